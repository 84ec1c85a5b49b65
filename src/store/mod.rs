//! Task store: atomic task files, history append, snapshot rotation,
//! and id allocation (spec §4.5). This is the persistence layer the
//! daemon's dispatcher writes through on every create/remove and every
//! firing; the in-memory task list is always rebuildable from it.

mod history;
mod task_file;

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use crate::common::{HistoryEntry, Task};
use crate::error::{Error, Result};
use crate::paths::Paths;

pub struct TaskStore {
    paths: Paths,
}

impl TaskStore {
    pub fn new(paths: Paths) -> TaskStore {
        TaskStore { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Creates the root and its four subdirectories (mode 0700) if they
    /// don't already exist.
    pub fn init_directories(&self) -> Result<()> {
        for dir in self.paths.all_dirs() {
            match fs::DirBuilder::new().mode(0o700).create(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Loads every `<id>.task` file under `tasks/`, skipping `next_id`.
    pub fn load_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let read_dir = match fs::read_dir(&self.paths.tasks_dir) {
            Ok(rd) => rd,
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in read_dir {
            let entry = entry.map_err(Error::Io)?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if name == "next_id" || !name.ends_with(".task") {
                continue;
            }
            let content = fs::read_to_string(entry.path()).map_err(Error::Io)?;
            let mut task = task_file::parse_task_file(&content).map_err(|e| match e {
                Error::TaskFileCorrupt { reason, .. } => Error::TaskFileCorrupt {
                    path: entry.path().display().to_string(),
                    reason,
                },
                other => other,
            })?;
            task.schedule.enabled = task.kind != crate::common::TaskKind::Abstract;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Writes a task file atomically: write to `<id>.task.tmp`, fsync,
    /// rename over the final path.
    pub fn write_task(&self, task: &Task) -> Result<()> {
        let final_path = self.paths.task_file(task.task_id);
        let tmp_path = final_path.with_extension("task.tmp");

        let serialized = task_file::serialize_task(task)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .map_err(Error::Io)?;
        file.write_all(serialized.as_bytes()).map_err(Error::Io)?;
        file.sync_all().map_err(Error::Io)?;
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Error::Io(e)
        })?;
        Ok(())
    }

    /// Deletes the task file, then best-effort removes history, both
    /// last-stdio files, and the per-task log directory.
    pub fn remove_task(&self, task_id: u64) -> Result<()> {
        fs::remove_file(self.paths.task_file(task_id)).map_err(Error::Io)?;

        let _ = fs::remove_file(self.paths.history_file(task_id));
        let _ = fs::remove_file(self.paths.last_stdout(task_id));
        let _ = fs::remove_file(self.paths.last_stderr(task_id));
        let _ = fs::remove_dir(self.paths.log_dir(task_id));
        Ok(())
    }

    /// Allocates the next task id by read-modify-truncate-write-fsync
    /// on `tasks/next_id`. Single-writer design: no inter-process lock,
    /// as only one daemon instance is assumed to run against a root.
    pub fn allocate_task_id(&self) -> Result<u64> {
        let id_path = self.paths.next_id_file();
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&id_path)
            .map_err(Error::Io)?;

        let existing = fs::read_to_string(&id_path).unwrap_or_default();
        let next_id: u64 = if existing.trim().is_empty() {
            1
        } else {
            existing
                .trim()
                .parse()
                .map_err(|_| Error::TaskFileCorrupt {
                    path: id_path.display().to_string(),
                    reason: "next_id is not a decimal integer".to_string(),
                })?
        };

        use std::io::{Seek, SeekFrom};
        file.set_len(0).map_err(Error::Io)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        file.write_all(format!("{}\n", next_id + 1).as_bytes())
            .map_err(Error::Io)?;
        file.sync_all().map_err(Error::Io)?;

        Ok(next_id)
    }

    pub fn append_history(
        &self,
        task_id: u64,
        entry: HistoryEntry,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()> {
        history::append_history(&self.paths.log_dir(task_id), &entry, stdout, stderr)
    }

    pub fn load_history(&self, task_id: u64) -> Result<Vec<HistoryEntry>> {
        history::load_history(&self.paths.history_file(task_id))
    }

    pub fn load_last_stdio(&self, task_id: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let stdout = history::load_stdio_file(&self.paths.last_stdout(task_id))?;
        let stderr = history::load_stdio_file(&self.paths.last_stderr(task_id))?;
        Ok((stdout, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Command, Schedule, TaskKind};
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(Paths::new(dir.path()));
        store.init_directories().unwrap();
        (dir, store)
    }

    fn simple_task(id: u64) -> Task {
        Task {
            task_id: id,
            kind: TaskKind::Simple,
            commands: vec![Command::new(vec!["/bin/true".into()])],
            schedule: Schedule {
                minute_mask: u64::MAX,
                hour_mask: 0xFFFFFF,
                weekday_mask: 0x7F,
                enabled: true,
            },
            last_run_epoch: -1,
        }
    }

    #[test]
    fn write_then_load_round_trips() {
        let (_dir, store) = store();
        let task = simple_task(1);
        store.write_task(&task).unwrap();
        let loaded = store.load_tasks().unwrap();
        assert_eq!(loaded, vec![task]);
    }

    #[test]
    fn ids_allocate_monotonically_and_are_never_reused() {
        let (_dir, store) = store();
        let first = store.allocate_task_id().unwrap();
        let second = store.allocate_task_id().unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let task = simple_task(first);
        store.write_task(&task).unwrap();
        store.remove_task(first).unwrap();

        let third = store.allocate_task_id().unwrap();
        assert_eq!(third, 3);
    }

    #[test]
    fn removal_deletes_task_file_history_and_snapshots() {
        let (_dir, store) = store();
        let task = simple_task(5);
        store.write_task(&task).unwrap();
        store
            .append_history(
                5,
                HistoryEntry {
                    epoch: 100,
                    status: 0,
                    stdout_len: 1,
                    stderr_len: 0,
                },
                b"x",
                b"",
            )
            .unwrap();

        store.remove_task(5).unwrap();

        assert!(store.load_tasks().unwrap().is_empty());
        assert!(store.load_history(5).unwrap().is_empty());
        let (stdout, stderr) = store.load_last_stdio(5).unwrap();
        assert!(stdout.is_empty() && stderr.is_empty());
        assert!(!store.paths().log_dir(5).exists());
    }
}
