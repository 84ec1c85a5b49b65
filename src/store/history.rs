//! Run-history append and stdio snapshot rotation (spec §4.5).
//!
//! Before writing a new `last.stdout`/`last.stderr`, the previous
//! contents (if non-empty) are renamed to `snapshot-<epoch>[-<counter>].
//! <ext>`. Only the five most recent snapshots per extension survive a
//! rotation; older ones are unlinked.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::common::{HistoryEntry, STDIO_SNAPSHOT_COUNT};
use crate::error::{Error, Result};

struct SnapshotName {
    path: std::path::PathBuf,
    epoch: i64,
    counter: u32,
}

fn parse_snapshot_filename(name: &str, ext: &str) -> Option<(i64, u32)> {
    let rest = name.strip_prefix("snapshot-")?;
    let rest = rest.strip_suffix(&format!(".{}", ext))?;
    match rest.split_once('-') {
        Some((epoch, counter)) => Some((epoch.parse().ok()?, counter.parse().ok()?)),
        None => Some((rest.parse().ok()?, 0)),
    }
}

fn build_snapshot_name(log_dir: &Path, epoch: i64, counter: u32, ext: &str) -> std::path::PathBuf {
    if counter == 0 {
        log_dir.join(format!("snapshot-{}.{}", epoch, ext))
    } else {
        log_dir.join(format!("snapshot-{}-{}.{}", epoch, counter, ext))
    }
}

fn list_snapshots(log_dir: &Path, ext: &str) -> Result<Vec<SnapshotName>> {
    let mut out = Vec::new();
    let read_dir = match fs::read_dir(log_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(Error::Io(e)),
    };
    for entry in read_dir {
        let entry = entry.map_err(Error::Io)?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if let Some((epoch, counter)) = parse_snapshot_filename(name, ext) {
            out.push(SnapshotName {
                path: entry.path(),
                epoch,
                counter,
            });
        }
    }
    Ok(out)
}

/// Deletes all but the five most recent `(epoch, counter)` snapshots.
fn prune_snapshots(log_dir: &Path, ext: &str) -> Result<()> {
    let mut snapshots = list_snapshots(log_dir, ext)?;
    if snapshots.len() <= STDIO_SNAPSHOT_COUNT {
        return Ok(());
    }
    snapshots.sort_by(|a, b| (b.epoch, b.counter).cmp(&(a.epoch, a.counter)));
    for stale in snapshots.into_iter().skip(STDIO_SNAPSHOT_COUNT) {
        let _ = fs::remove_file(&stale.path);
    }
    Ok(())
}

fn rotate_one(log_dir: &Path, base_name: &str, ext: &str, epoch: i64) -> Result<()> {
    let base_path = log_dir.join(base_name);
    let metadata = match fs::metadata(&base_path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };
    if metadata.len() == 0 {
        return Ok(());
    }

    let mut counter = 0u32;
    loop {
        let candidate = build_snapshot_name(log_dir, epoch, counter, ext);
        if !candidate.exists() {
            fs::rename(&base_path, &candidate).map_err(Error::Io)?;
            break;
        }
        counter += 1;
        if counter >= 1000 {
            // Exhausted the counter namespace for this epoch; drop the
            // stale snapshot rather than stall the run it belongs to.
            let _ = fs::remove_file(&base_path);
            break;
        }
    }

    prune_snapshots(log_dir, ext)
}

fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn write_fresh(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(Error::Io)?;
    file.write_all(content).map_err(Error::Io)?;
    file.sync_all().map_err(Error::Io)?;
    Ok(())
}

/// Rotates prior snapshots, writes the new `last.stdout`/`last.stderr`,
/// and appends one line to `history.log`. All writes are fsync'd.
pub fn append_history(
    log_dir: &Path,
    entry: &HistoryEntry,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<()> {
    ensure_dir(log_dir)?;

    rotate_one(log_dir, "last.stdout", "stdout", entry.epoch)?;
    rotate_one(log_dir, "last.stderr", "stderr", entry.epoch)?;

    write_fresh(&log_dir.join("last.stdout"), stdout)?;
    write_fresh(&log_dir.join("last.stderr"), stderr)?;

    let line = format!(
        "{} {} {} {}\n",
        entry.epoch, entry.status, entry.stdout_len, entry.stderr_len
    );
    let mut history_file = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(log_dir.join("history.log"))
        .map_err(Error::Io)?;
    history_file.write_all(line.as_bytes()).map_err(Error::Io)?;
    history_file.sync_all().map_err(Error::Io)?;
    Ok(())
}

fn parse_history_line(line: &str) -> Option<HistoryEntry> {
    let mut parts = line.split_whitespace();
    let epoch = parts.next()?.parse().ok()?;
    let status = parts.next()?.parse().ok()?;
    let stdout_len = parts.next()?.parse().ok()?;
    let stderr_len = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(HistoryEntry {
        epoch,
        status,
        stdout_len,
        stderr_len,
    })
}

pub fn load_history(history_path: &Path) -> Result<Vec<HistoryEntry>> {
    let content = match fs::read_to_string(history_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    content
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            parse_history_line(line).ok_or_else(|| Error::TaskFileCorrupt {
                path: history_path.display().to_string(),
                reason: format!("malformed history line {:?}", line),
            })
        })
        .collect()
}

pub fn load_stdio_file(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(epoch: i64) -> HistoryEntry {
        HistoryEntry {
            epoch,
            status: 0,
            stdout_len: 3,
            stderr_len: 0,
        }
    }

    #[test]
    fn first_run_produces_no_snapshot() {
        let dir = tempdir().unwrap();
        append_history(dir.path(), &entry(1000), b"out", b"").unwrap();
        let snapshots = list_snapshots(dir.path(), "stdout").unwrap();
        assert!(snapshots.is_empty());
    }

    #[test]
    fn keeps_at_most_five_snapshots_after_seven_runs() {
        let dir = tempdir().unwrap();
        for i in 0..7 {
            append_history(dir.path(), &entry(1000 + i), b"out", b"").unwrap();
        }
        let snapshots = list_snapshots(dir.path(), "stdout").unwrap();
        assert_eq!(snapshots.len(), STDIO_SNAPSHOT_COUNT);
        assert_eq!(fs::read(dir.path().join("last.stdout")).unwrap(), b"out");
    }

    #[test]
    fn history_log_appends_in_fire_order() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            append_history(dir.path(), &entry(1000 + i), b"x", b"").unwrap();
        }
        let entries = load_history(&dir.path().join("history.log")).unwrap();
        let epochs: Vec<i64> = entries.iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![1000, 1001, 1002]);
    }

    #[test]
    fn loading_history_for_a_task_with_no_runs_is_empty() {
        let dir = tempdir().unwrap();
        let entries = load_history(&dir.path().join("missing.log")).unwrap();
        assert!(entries.is_empty());
    }
}
