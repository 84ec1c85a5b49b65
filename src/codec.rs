//! Blocking exact-size I/O over raw file descriptors, plus the small
//! integer/base64 parsing helpers the task store and protocol need.
//!
//! The original C `utils_read_all` signalled overflow with a one-byte
//! extra probe read, which spec §9 calls out as a contract smell. Here
//! `read_exact`/`write_exact` just report the exact byte count moved (or
//! an end-of-file error) and let the caller decide what that means.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::unistd::{read, write};

use crate::error::{Error, Result};

/// Reads exactly `buf.len()` bytes, retrying on `EINTR`. An end-of-file
/// before `buf` is full is a protocol-level error, not a short read.
pub fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        match read(fd, &mut buf[offset..]) {
            Ok(0) => {
                return Err(Error::Protocol(
                    "unexpected end of file mid-record".to_string(),
                ))
            }
            Ok(n) => offset += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Io(e.into())),
        }
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes, retrying on `EINTR`.
pub fn write_exact(fd: RawFd, buf: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        match write(fd, &buf[offset..]) {
            Ok(n) => offset += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Io(e.into())),
        }
    }
    Ok(())
}

pub fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Encoding(e.to_string()))
}

/// Parses a fixed-width upper-case hex mask, e.g. the 15-hex-digit
/// minute mask or the 2-hex-digit weekday mask of the task file format.
pub fn parse_hex_mask(field: &str) -> Result<u64> {
    u64::from_str_radix(field.trim(), 16)
        .map_err(|e| Error::TaskFileCorrupt {
            path: String::new(),
            reason: format!("invalid hex mask {:?}: {}", field, e),
        })
}

pub fn format_hex_mask(value: u64, width: usize) -> String {
    format!("{:0width$X}", value, width = width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_mask_round_trips() {
        let formatted = format_hex_mask(0x1F, 15);
        assert_eq!(formatted.len(), 15);
        assert_eq!(parse_hex_mask(&formatted).unwrap(), 0x1F);
    }

    #[test]
    fn base64_round_trips() {
        let data = b"hello erraid";
        let encoded = base64_encode(data);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn exact_io_round_trips_over_a_pipe() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        write_exact(write_fd, b"0123456789").unwrap();
        let mut buf = [0u8; 10];
        read_exact(read_fd, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
        nix::unistd::close(read_fd).unwrap();
        nix::unistd::close(write_fd).unwrap();
    }
}
