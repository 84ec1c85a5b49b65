//! Task execution: fork/exec per command, bounded stdio capture, exit
//! status mapping (spec §4.4).

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, read, ForkResult};
use std::ffi::CString;
use std::os::unix::io::{BorrowedFd, RawFd};

use crate::common::{Command, MAX_STDIO_SNAPSHOT};
use crate::error::{Error, Result};

/// Outcome of running one task: the status of the last command executed
/// (or the only one, for SIMPLE), concatenated captured stdio, and
/// whether either stream hit the 65536-byte cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

struct BoundedBuffer {
    data: Vec<u8>,
    truncated: bool,
}

impl BoundedBuffer {
    fn new() -> Self {
        BoundedBuffer {
            data: Vec::new(),
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = MAX_STDIO_SNAPSHOT.saturating_sub(self.data.len());
        if remaining == 0 {
            if !chunk.is_empty() {
                self.truncated = true;
            }
            return;
        }
        if chunk.len() > remaining {
            self.data.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }
}

/// Drains both stdio pipes concurrently via `poll(2)`. Reading them one
/// at a time would deadlock once a child fills the unread pipe's kernel
/// buffer while this side blocks on the other.
fn drain_pipes(
    out_fd: RawFd,
    err_fd: RawFd,
    stdout: &mut BoundedBuffer,
    stderr: &mut BoundedBuffer,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        // Safety: both fds stay open for this whole call; they're closed
        // by the caller only after `drain_pipes` returns.
        let out_borrow = unsafe { BorrowedFd::borrow_raw(out_fd) };
        let err_borrow = unsafe { BorrowedFd::borrow_raw(err_fd) };

        let mut fds = Vec::with_capacity(2);
        if out_open {
            fds.push(PollFd::new(out_borrow, PollFlags::POLLIN));
        }
        if err_open {
            fds.push(PollFd::new(err_borrow, PollFlags::POLLIN));
        }

        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Executor(format!("poll on child pipes: {}", e))),
        }

        let mut idx = 0;
        if out_open {
            let revents = fds[idx].revents().unwrap_or(PollFlags::empty());
            idx += 1;
            if !revents.is_empty() {
                match read(out_fd, &mut buf) {
                    Ok(0) => out_open = false,
                    Ok(n) => stdout.push(&buf[..n]),
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => return Err(Error::Executor(format!("read from child stdout: {}", e))),
                }
            }
        }
        if err_open {
            let revents = fds[idx].revents().unwrap_or(PollFlags::empty());
            if !revents.is_empty() {
                match read(err_fd, &mut buf) {
                    Ok(0) => err_open = false,
                    Ok(n) => stderr.push(&buf[..n]),
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => return Err(Error::Executor(format!("read from child stderr: {}", e))),
                }
            }
        }
    }
    Ok(())
}

/// Runs one command to completion, capturing its stdout/stderr into the
/// given buffers. Returns the child's exit status per spec §4.4: normal
/// exit is `WEXITSTATUS`, signal death is `128 + signal`, exec failure
/// in the child is 127, and a wait failure on the parent side is -1.
fn run_one(command: &Command, stdout: &mut BoundedBuffer, stderr: &mut BoundedBuffer) -> i32 {
    let (out_read, out_write) = match pipe() {
        Ok(p) => p,
        Err(_) => return -1,
    };
    let (err_read, err_write) = match pipe() {
        Ok(p) => p,
        Err(_) => {
            let _ = close(out_read);
            let _ = close(out_write);
            return -1;
        }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = close(out_read);
            let _ = close(err_read);
            let _ = dup2(out_write, libc::STDOUT_FILENO);
            let _ = dup2(err_write, libc::STDERR_FILENO);
            let _ = close(out_write);
            let _ = close(err_write);

            let args: Vec<CString> = command
                .argv
                .iter()
                .map(|s| CString::new(s.as_str()).unwrap_or_default())
                .collect();
            let _ = execvp(&args[0], &args);
            // execvp only returns on failure.
            unsafe { libc::_exit(127) };
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = close(out_write);
            let _ = close(err_write);

            let drain_result = drain_pipes(out_read, err_read, stdout, stderr);
            let _ = close(out_read);
            let _ = close(err_read);
            if drain_result.is_err() {
                let _ = waitpid(child, None);
                return -1;
            }

            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
                Ok(_) => -1,
                Err(_) => -1,
            }
        }
        Err(_) => {
            let _ = close(out_read);
            let _ = close(out_write);
            let _ = close(err_read);
            let _ = close(err_write);
            -1
        }
    }
}

/// Fires a task's commands per its variant. SIMPLE runs the sole
/// command; SEQUENCE runs every command in order regardless of
/// intermediate failure and reports the last command's status; ABSTRACT
/// never forks and reports status 0 with empty buffers.
pub fn run_task(commands: &[Command]) -> RunOutcome {
    if commands.is_empty() {
        return RunOutcome {
            status: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        };
    }

    let mut stdout = BoundedBuffer::new();
    let mut stderr = BoundedBuffer::new();
    let mut status = 0;
    for command in commands {
        status = run_one(command, &mut stdout, &mut stderr);
    }

    RunOutcome {
        status,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        stdout: stdout.data,
        stderr: stderr.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        Command::new(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn abstract_task_with_no_commands_never_forks() {
        let outcome = run_task(&[]);
        assert_eq!(outcome.status, 0);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.is_empty());
    }

    #[test]
    fn simple_task_captures_stdout_and_status() {
        let outcome = run_task(&[sh("echo hi; exit 3")]);
        assert_eq!(outcome.status, 3);
        assert_eq!(outcome.stdout, b"hi\n");
    }

    #[test]
    fn sequence_runs_every_command_and_reports_last_status() {
        let outcome = run_task(&[sh("echo A"), sh("echo B; exit 2"), sh("echo C")]);
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.stdout, b"A\nB\nC\n");
        assert!(outcome.stderr.is_empty());
    }

    #[test]
    fn exec_failure_yields_status_127() {
        let outcome = run_task(&[Command::new(vec!["/no/such/binary-erraid-test".into()])]);
        assert_eq!(outcome.status, 127);
    }

    #[test]
    fn signal_termination_yields_128_plus_signal() {
        // SIGKILL = 9
        let outcome = run_task(&[sh("kill -KILL $$")]);
        assert_eq!(outcome.status, 128 + 9);
    }

    #[test]
    fn stdout_beyond_cap_is_truncated() {
        let outcome = run_task(&[sh(
            "yes x | head -c 70000",
        )]);
        assert_eq!(outcome.stdout.len(), MAX_STDIO_SNAPSHOT);
        assert!(outcome.stdout_truncated);
    }
}
