//! On-disk directory layout rooted at a single directory (spec §4.5).

use std::path::{Path, PathBuf};

use crate::common::{
    DEFAULT_RUNDIR_PREFIX, DEFAULT_RUNDIR_SUFFIX, LOGS_DIR_NAME, PIPES_DIR_NAME,
    PIPE_REPLY_NAME, PIPE_REQUEST_NAME, STATE_DIR_NAME, TASKS_DIR_NAME,
};

#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    pub tasks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub pipes_dir: PathBuf,
    pub request_pipe: PathBuf,
    pub reply_pipe: PathBuf,
}

impl Paths {
    pub fn new(root: impl AsRef<Path>) -> Paths {
        let root = root.as_ref().to_path_buf();
        let pipes_dir = root.join(PIPES_DIR_NAME);
        Paths {
            tasks_dir: root.join(TASKS_DIR_NAME),
            logs_dir: root.join(LOGS_DIR_NAME),
            state_dir: root.join(STATE_DIR_NAME),
            request_pipe: pipes_dir.join(PIPE_REQUEST_NAME),
            reply_pipe: pipes_dir.join(PIPE_REPLY_NAME),
            pipes_dir,
            root,
        }
    }

    /// `<RUNDIR_PREFIX>/<USER><RUNDIR_SUFFIX>`, conventionally
    /// `/tmp/<user>/erraid` (spec §6).
    pub fn default_root() -> PathBuf {
        let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
        let user = if user.is_empty() { "user".to_string() } else { user };
        PathBuf::from(format!(
            "{}/{}{}",
            DEFAULT_RUNDIR_PREFIX, user, DEFAULT_RUNDIR_SUFFIX
        ))
    }

    pub fn task_file(&self, task_id: u64) -> PathBuf {
        self.tasks_dir.join(format!("{}.task", task_id))
    }

    pub fn next_id_file(&self) -> PathBuf {
        self.tasks_dir.join("next_id")
    }

    pub fn log_dir(&self, task_id: u64) -> PathBuf {
        self.logs_dir.join(task_id.to_string())
    }

    pub fn history_file(&self, task_id: u64) -> PathBuf {
        self.log_dir(task_id).join("history.log")
    }

    pub fn last_stdout(&self, task_id: u64) -> PathBuf {
        self.log_dir(task_id).join("last.stdout")
    }

    pub fn last_stderr(&self, task_id: u64) -> PathBuf {
        self.log_dir(task_id).join("last.stderr")
    }

    /// All directories this layout owns, in creation order.
    pub fn all_dirs(&self) -> [&Path; 5] {
        [
            &self.root,
            &self.tasks_dir,
            &self.logs_dir,
            &self.state_dir,
            &self.pipes_dir,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_expected_subpaths() {
        let paths = Paths::new("/tmp/erraid-test");
        assert_eq!(paths.tasks_dir, Path::new("/tmp/erraid-test/tasks"));
        assert_eq!(
            paths.request_pipe,
            Path::new("/tmp/erraid-test/pipes/erraid-request-pipe")
        );
        assert_eq!(paths.task_file(7), Path::new("/tmp/erraid-test/tasks/7.task"));
        assert_eq!(
            paths.history_file(7),
            Path::new("/tmp/erraid-test/logs/7/history.log")
        );
    }
}
