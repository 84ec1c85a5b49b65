//! Client-side connection handling: opens both FIFOs and round-trips a
//! single framed request (spec §6, client side of §4.2).

use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::common::MessageType;
use crate::error::Result;
use crate::paths::Paths;
use crate::proto::{self, Message};

pub struct Connection {
    request_write_fd: RawFd,
    reply_read_fd: RawFd,
}

impl Connection {
    /// Opens the request pipe for writing and the reply pipe for
    /// reading. Both opens block until the daemon has the matching end
    /// open, which it always does once running (it holds a dummy
    /// writer on the request pipe and both ends of the reply pipe).
    pub fn open(paths: &Paths) -> Result<Connection> {
        let request_write_fd = open(&paths.request_pipe, OFlag::O_WRONLY, Mode::empty())
            .map_err(|e| crate::error::Error::Io(e.into()))?;
        let reply_read_fd = open(&paths.reply_pipe, OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| crate::error::Error::Io(e.into()))?;
        Ok(Connection {
            request_write_fd,
            reply_read_fd,
        })
    }

    /// Opens a connection rooted at an arbitrary path, for tests that
    /// don't want to stand up a full `Paths`.
    pub fn open_at(root: impl AsRef<Path>) -> Result<Connection> {
        Connection::open(&Paths::new(root))
    }

    pub fn send(&self, msg_type: MessageType, payload: &[u8]) -> Result<Message> {
        let message = proto::pack(msg_type, payload)?;
        proto::write_message(self.request_write_fd, &message)?;
        proto::read_message(self.reply_read_fd)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = close(self.request_write_fd);
        let _ = close(self.reply_read_fd);
    }
}
