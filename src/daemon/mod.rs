//! Event loop and dispatcher: owns the authoritative task list and
//! plan, multiplexes the request pipe and the wake pipe, and fires due
//! tasks between request bursts (spec §4.3, §5).

mod dispatch;

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, mkfifo, pipe, read};
use serde_json::{json, Value};

use crate::common::{HistoryEntry, MessageType, Task, TaskKind};
use crate::config::Config;
use crate::error::{Error, ErrorCode, Result};
use crate::executor;
use crate::proto::{self, Message};
use crate::scheduler;
use crate::signals;
use crate::store::TaskStore;

use dispatch::{HandlerResult, Stream};

pub struct Daemon {
    store: TaskStore,
    tasks: Vec<Task>,
    plan: Vec<crate::common::PlanEntry>,
    request_read_fd: RawFd,
    request_dummy_write_fd: RawFd,
    reply_fd: RawFd,
    wake_read_fd: RawFd,
    wake_write_fd: RawFd,
    should_quit: bool,
}

fn current_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Io(e.into()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Io(e.into()))?;
    Ok(())
}

fn clear_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Io(e.into()))?;
    let flags = OFlag::from_bits_truncate(flags) & !OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Io(e.into()))?;
    Ok(())
}

impl Daemon {
    /// Creates the directory layout and FIFOs if absent, opens all four
    /// descriptors, installs signal handlers, and loads the initial
    /// task list and plan from disk.
    pub fn init(config: &Config) -> Result<Daemon> {
        let paths = config.paths();
        let store = TaskStore::new(paths.clone());
        store.init_directories()?;

        let fifo_mode = Mode::from_bits_truncate(0o600);
        for fifo in [&paths.request_pipe, &paths.reply_pipe] {
            match mkfifo(fifo, fifo_mode) {
                Ok(()) | Err(Errno::EEXIST) => {}
                Err(e) => return Err(Error::Io(e.into())),
            }
        }

        let (wake_read_fd, wake_write_fd) = pipe().map_err(|e| Error::Io(e.into()))?;
        set_nonblocking(wake_read_fd)?;
        set_nonblocking(wake_write_fd)?;

        // Open the reader non-blocking first so it never waits on a
        // writer that doesn't exist yet; open the dummy writer after so
        // the reader never observes end-of-file once a real client goes
        // away.
        let request_read_fd = open(&paths.request_pipe, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| Error::Io(e.into()))?;
        let request_dummy_write_fd =
            open(&paths.request_pipe, OFlag::O_WRONLY, Mode::empty()).map_err(|e| Error::Io(e.into()))?;
        clear_nonblocking(request_read_fd)?;

        let reply_fd = open(&paths.reply_pipe, OFlag::O_RDWR, Mode::empty()).map_err(|e| Error::Io(e.into()))?;

        signals::reset_should_quit();
        signals::install(wake_write_fd)?;

        let tasks = store.load_tasks()?;
        let now = current_epoch();
        let plan = scheduler::compute_plan(&tasks, now);

        tracing::info!(root = %paths.root.display(), task_count = tasks.len(), "daemon initialised");

        Ok(Daemon {
            store,
            tasks,
            plan,
            request_read_fd,
            request_dummy_write_fd,
            reply_fd,
            wake_read_fd,
            wake_write_fd,
            should_quit: false,
        })
    }

    /// Runs until a shutdown request or termination signal sets
    /// `should_quit`, draining the current iteration before returning.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let now = current_epoch();
            let timeout_ms = self.compute_timeout(now);

            let request_borrow = unsafe { BorrowedFd::borrow_raw(self.request_read_fd) };
            let wake_borrow = unsafe { BorrowedFd::borrow_raw(self.wake_read_fd) };
            let mut fds = [
                PollFd::new(request_borrow, PollFlags::POLLIN),
                PollFd::new(wake_borrow, PollFlags::POLLIN),
            ];

            match poll(&mut fds, timeout_ms) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Io(e.into())),
            }

            let request_ready = fds[0].revents().map_or(false, |r| !r.is_empty());
            let wake_ready = fds[1].revents().map_or(false, |r| !r.is_empty());
            drop(fds);

            if wake_ready {
                self.drain_wake_pipe();
            }
            if request_ready {
                self.drain_requests();
            }

            self.fire_due_tasks();

            if self.should_quit || signals::should_quit() {
                tracing::info!("daemon shutting down");
                break;
            }
        }
        Ok(())
    }

    fn compute_timeout(&self, now: i64) -> i32 {
        match self.plan.iter().filter_map(|p| p.next_epoch).min() {
            None => -1,
            Some(epoch) => {
                let delta_seconds = (epoch - now).max(0);
                delta_seconds.saturating_mul(1000).min(i32::MAX as i64) as i32
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.wake_read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    /// Reopens the reply descriptor if a prior broken-pipe write closed
    /// it. Lazy: only called right before the next reply write.
    fn ensure_reply_fd_open(&mut self) -> Result<()> {
        if self.reply_fd >= 0 {
            return Ok(());
        }
        let reply_pipe = self.store.paths().reply_pipe.clone();
        self.reply_fd = open(&reply_pipe, OFlag::O_RDWR, Mode::empty()).map_err(|e| Error::Io(e.into()))?;
        Ok(())
    }

    /// Reads and dispatches records until the request pipe would block,
    /// coalescing a burst of queued requests within one loop iteration.
    fn drain_requests(&mut self) {
        loop {
            match proto::read_message(self.request_read_fd) {
                Ok(message) => {
                    let reply = self.dispatch(message);
                    if let Err(e) = self.ensure_reply_fd_open() {
                        tracing::warn!(error = %e, "failed reopening reply pipe; dropping reply");
                    } else {
                        match proto::write_message(self.reply_fd, &reply) {
                            Ok(true) => {}
                            Ok(false) => {
                                // Broken reply pipe: not fatal, close now
                                // and reopen lazily the next time we need
                                // to write a reply.
                                tracing::warn!("reply pipe broken; closing for lazy reopen");
                                let _ = close(self.reply_fd);
                                self.reply_fd = -1;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed writing reply");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "protocol error reading request; dropping");
                }
            }

            let request_borrow = unsafe { BorrowedFd::borrow_raw(self.request_read_fd) };
            let mut fds = [PollFd::new(request_borrow, PollFlags::POLLIN)];
            match poll(&mut fds, 0) {
                Ok(0) => break,
                Ok(_) => {
                    let ready = fds[0].revents().map_or(false, |r| !r.is_empty());
                    if !ready {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn dispatch(&mut self, message: Message) -> Message {
        let msg_type = message.msg_type();
        tracing::debug!(?msg_type, "dispatching request");

        let (reply_type, result): (MessageType, HandlerResult) = match msg_type {
            Some(MessageType::Ping) => (MessageType::Pong, self.handle_ping()),
            Some(MessageType::ReqListTasks) => (MessageType::RspListTasks, self.handle_list_tasks()),
            Some(MessageType::ReqCreateSimple) => {
                (MessageType::RspCreate, self.parse_and_create(&message, TaskKind::Simple))
            }
            Some(MessageType::ReqCreateSequence) => {
                (MessageType::RspCreate, self.parse_and_create(&message, TaskKind::Sequence))
            }
            Some(MessageType::ReqCreateAbstract) => {
                (MessageType::RspCreate, self.parse_and_create(&message, TaskKind::Abstract))
            }
            Some(MessageType::ReqRemove) => (MessageType::RspRemove, self.parse_and_remove(&message)),
            Some(MessageType::ReqListHistory) => {
                (MessageType::RspListHistory, self.parse_and_list_history(&message))
            }
            Some(MessageType::ReqGetStdout) => {
                (MessageType::RspGetStdout, self.parse_and_get_stdio(&message, Stream::Stdout))
            }
            Some(MessageType::ReqGetStderr) => {
                (MessageType::RspGetStderr, self.parse_and_get_stdio(&message, Stream::Stderr))
            }
            Some(MessageType::ReqShutdown) => (MessageType::RspShutdown, self.handle_shutdown()),
            _ => (
                MessageType::RspError,
                Err((ErrorCode::UnknownRequest, "unrecognised message type".to_string())),
            ),
        };

        match result {
            Ok(payload) => self.build_reply(reply_type, &payload),
            Err((code, msg)) => {
                tracing::debug!(code = code.as_str(), message = %msg, "request failed");
                self.build_reply(
                    MessageType::RspError,
                    &json!({"status": "ERROR", "code": code.as_str(), "message": msg}),
                )
            }
        }
    }

    fn build_reply(&self, msg_type: MessageType, payload: &Value) -> Message {
        let bytes = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
        proto::pack(msg_type, &bytes).unwrap_or_else(|_| {
            proto::pack(
                MessageType::RspError,
                br#"{"status":"ERROR","code":"ENCODING_ERROR","message":"reply exceeds record limit"}"#,
            )
            .expect("fallback error reply always fits")
        })
    }

    fn parse_payload(message: &Message) -> HandlerResult {
        let text = message
            .payload_str()
            .map_err(|e| (ErrorCode::InvalidRequest, e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(text).map_err(|e| (ErrorCode::InvalidRequest, e.to_string()))
    }

    fn parse_and_create(&mut self, message: &Message, kind: TaskKind) -> HandlerResult {
        let payload = Self::parse_payload(message)?;
        self.handle_create(kind, &payload)
    }

    fn parse_and_remove(&mut self, message: &Message) -> HandlerResult {
        let payload = Self::parse_payload(message)?;
        self.handle_remove(&payload)
    }

    fn parse_and_list_history(&mut self, message: &Message) -> HandlerResult {
        let payload = Self::parse_payload(message)?;
        self.handle_list_history(&payload)
    }

    fn parse_and_get_stdio(&mut self, message: &Message, stream: Stream) -> HandlerResult {
        let payload = Self::parse_payload(message)?;
        self.handle_get_stdio(&payload, stream)
    }

    /// Full recompute used after membership changes (create/remove).
    fn rebuild_plan(&mut self) -> Result<()> {
        let now = current_epoch();
        self.plan = scheduler::compute_plan(&self.tasks, now);
        Ok(())
    }

    /// Reloads the task list from disk and rebuilds the plan wholesale;
    /// the recovery step of the one-atomicity rule (spec §4.3, §9).
    fn reload_tasks(&mut self) -> Result<()> {
        self.tasks = self.store.load_tasks()?;
        self.rebuild_plan()
    }

    /// Fires due entries one at a time, in task-index order, until none
    /// remain or shutdown has been requested. Re-scans the plan after
    /// each firing rather than snapshotting it, so a reload triggered by
    /// a persistence failure is picked up immediately.
    fn fire_due_tasks(&mut self) {
        loop {
            if self.should_quit || signals::should_quit() {
                return;
            }
            let now = current_epoch();
            let due = self
                .plan
                .iter()
                .find(|p| p.next_epoch.map_or(false, |e| (0..=now).contains(&e)))
                .map(|p| p.task_index);

            let task_index = match due {
                Some(i) => i,
                None => return,
            };

            if let Err(e) = self.fire_task(task_index, now) {
                tracing::warn!(error = %e, "task firing failed");
            }
        }
    }

    fn fire_task(&mut self, task_index: usize, now: i64) -> Result<()> {
        let task_id = self.tasks[task_index].task_id;
        let commands = self.tasks[task_index].commands.clone();

        let outcome = executor::run_task(&commands);
        tracing::info!(
            task_id,
            status = outcome.status,
            stdout_truncated = outcome.stdout_truncated,
            stderr_truncated = outcome.stderr_truncated,
            "task fired"
        );

        let entry = HistoryEntry {
            epoch: now,
            status: outcome.status,
            stdout_len: outcome.stdout.len(),
            stderr_len: outcome.stderr.len(),
        };
        if let Err(e) = self
            .store
            .append_history(task_id, entry, &outcome.stdout, &outcome.stderr)
        {
            tracing::warn!(task_id, error = %e, "history append failed; reloading from disk");
            let _ = self.reload_tasks();
            return Err(e);
        }

        self.tasks[task_index].last_run_epoch = now;
        if let Err(e) = self.store.write_task(&self.tasks[task_index]) {
            tracing::warn!(task_id, error = %e, "persisting last_run_epoch failed; reloading from disk");
            let _ = self.reload_tasks();
            return Err(e);
        }

        let next = scheduler::next_occurrence(&self.tasks[task_index].schedule, now);
        self.plan[task_index].next_epoch = next;
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        for fd in [
            self.request_read_fd,
            self.request_dummy_write_fd,
            self.reply_fd,
            self.wake_read_fd,
            self.wake_write_fd,
        ] {
            let _ = close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MessageType;
    use crate::paths::Paths;
    use tempfile::tempdir;

    /// Builds a `Daemon` over a temp root with manually-created pipe
    /// pairs in place of the real FIFOs, per SPEC_FULL.md §8's testing
    /// approach: exercise the dispatcher without a filesystem race on
    /// named pipes.
    fn test_daemon() -> (tempfile::TempDir, Daemon, RawFd, RawFd) {
        let dir = tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let store = TaskStore::new(paths.clone());
        store.init_directories().unwrap();

        let (client_to_daemon_read, client_to_daemon_write) = pipe().unwrap();
        let (daemon_to_client_read, daemon_to_client_write) = pipe().unwrap();
        let (wake_read_fd, wake_write_fd) = pipe().unwrap();

        let daemon = Daemon {
            store,
            tasks: Vec::new(),
            plan: Vec::new(),
            request_read_fd: client_to_daemon_read,
            request_dummy_write_fd: client_to_daemon_write,
            reply_fd: daemon_to_client_write,
            wake_read_fd,
            wake_write_fd,
            should_quit: false,
        };
        (dir, daemon, client_to_daemon_write, daemon_to_client_read)
    }

    #[test]
    fn ping_replies_pong() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let ping = proto::pack(MessageType::Ping, b"").unwrap();
        let reply = daemon.dispatch(ping);
        assert_eq!(reply.msg_type(), Some(MessageType::Pong));
        assert_eq!(reply.payload_str().unwrap(), r#"{"status":"OK"}"#);
    }

    #[test]
    fn create_simple_then_list_round_trips() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let create = proto::pack(
            MessageType::ReqCreateSimple,
            br#"{"commands":[["/bin/true"]],"schedule":{"minutes":"FFFFFFFFFFFFFFF","hours":"FFFFFF","weekdays":"7F"}}"#,
        )
        .unwrap();
        let reply = daemon.dispatch(create);
        assert_eq!(reply.msg_type(), Some(MessageType::RspCreate));
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["task_id"], 1);
        assert_eq!(daemon.tasks.len(), 1);
        assert_eq!(daemon.plan.len(), 1);

        let list = proto::pack(MessageType::ReqListTasks, b"{}").unwrap();
        let reply = daemon.dispatch(list);
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["tasks"][0]["task_id"], 1);
        assert_eq!(body["tasks"][0]["last_run"], -1);
    }

    #[test]
    fn create_sequence_rejects_eighteen_commands() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let commands: Vec<Value> = (0..18).map(|_| json!(["/bin/true"])).collect();
        let payload = json!({
            "commands": commands,
            "schedule": {"minutes": "FFFFFFFFFFFFFFF", "hours": "FFFFFF", "weekdays": "7F"},
        });
        let create = proto::pack(MessageType::ReqCreateSequence, serde_json::to_string(&payload).unwrap().as_bytes()).unwrap();
        let reply = daemon.dispatch(create);
        assert_eq!(reply.msg_type(), Some(MessageType::RspError));
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[test]
    fn remove_round_trip_clears_everything() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let create = proto::pack(
            MessageType::ReqCreateSimple,
            br#"{"commands":[["/bin/true"]],"schedule":{"minutes":"FFFFFFFFFFFFFFF","hours":"FFFFFF","weekdays":"7F"}}"#,
        )
        .unwrap();
        daemon.dispatch(create);

        let remove = proto::pack(MessageType::ReqRemove, br#"{"task_id":1}"#).unwrap();
        let reply = daemon.dispatch(remove);
        assert_eq!(reply.msg_type(), Some(MessageType::RspRemove));
        assert!(daemon.tasks.is_empty());

        let get_stdout = proto::pack(MessageType::ReqGetStdout, br#"{"task_id":1}"#).unwrap();
        let reply = daemon.dispatch(get_stdout);
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["code"], "STDOUT_FAILED");
    }

    #[test]
    fn abstract_task_never_appears_due() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let create = proto::pack(MessageType::ReqCreateAbstract, br#"{"commands":[]}"#).unwrap();
        daemon.dispatch(create);
        assert_eq!(daemon.plan[0].next_epoch, None);
    }

    #[test]
    fn shutdown_request_sets_should_quit() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let shutdown = proto::pack(MessageType::ReqShutdown, b"{}").unwrap();
        let reply = daemon.dispatch(shutdown);
        assert_eq!(reply.msg_type(), Some(MessageType::RspShutdown));
        assert!(daemon.should_quit);
    }

    #[test]
    fn firing_seven_times_keeps_only_five_stdout_snapshots() {
        let (dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let create = proto::pack(
            MessageType::ReqCreateSimple,
            br#"{"commands":[["/bin/sh","-c","echo run"]],"schedule":{"minutes":"FFFFFFFFFFFFFFF","hours":"FFFFFF","weekdays":"7F"}}"#,
        )
        .unwrap();
        daemon.dispatch(create);

        for epoch in 1000..1007 {
            daemon.fire_task(0, epoch).unwrap();
        }

        let log_dir = daemon.store.paths().log_dir(1);
        let snapshots = std::fs::read_dir(&log_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("snapshot-"))
            .filter(|e| e.file_name().to_string_lossy().ends_with(".stdout"))
            .count();
        assert_eq!(snapshots, 5);
        assert_eq!(
            std::fs::read(log_dir.join("last.stdout")).unwrap(),
            b"run\n"
        );
        drop(dir);
    }

    #[test]
    fn get_stdout_fails_once_the_capture_cannot_fit_a_record() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let create = proto::pack(
            MessageType::ReqCreateSimple,
            br#"{"commands":[["/bin/sh","-c","yes x | head -c 70000"]],"schedule":{"minutes":"FFFFFFFFFFFFFFF","hours":"FFFFFF","weekdays":"7F"}}"#,
        )
        .unwrap();
        daemon.dispatch(create);
        daemon.fire_task(0, 1000).unwrap();

        let get_stdout = proto::pack(MessageType::ReqGetStdout, br#"{"task_id":1}"#).unwrap();
        let reply = daemon.dispatch(get_stdout);
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["code"], "STDOUT_FAILED");
    }

    #[test]
    fn unknown_message_type_yields_unknown_request() {
        let (_dir, mut daemon, _client_write, _reply_read) = test_daemon();
        let mut raw = proto::pack(MessageType::Ping, b"").unwrap();
        raw.header.msg_type = 0xEE;
        let reply = daemon.dispatch(raw);
        assert_eq!(reply.msg_type(), Some(MessageType::RspError));
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["code"], "UNKNOWN_REQUEST");
    }
}
