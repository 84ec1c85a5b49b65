//! Crate-wide error types.
//!
//! Internal operations (store, scheduler, executor, protocol) return
//! [`Error`]; the daemon's dispatcher is the only place that turns these
//! into the wire-level `RSP_ERROR` codes from the protocol.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed task file at {path}: {reason}")]
    TaskFileCorrupt { path: String, reason: String },

    #[error("task {0} not found")]
    TaskNotFound(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("executor failed: {0}")]
    Executor(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

/// The short codes the wire protocol sends back in `RSP_ERROR` (spec §7).
///
/// This is a separate, closed vocabulary from [`Error`] on purpose: a
/// handler picks the code that describes *what the caller should do*,
/// not which internal variant fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    TaskNotFound,
    PersistenceError,
    MemoryError,
    SchedulerError,
    ListFailed,
    HistoryFailed,
    StdoutFailed,
    StderrFailed,
    UnknownRequest,
    EncodingError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::MemoryError => "MEMORY_ERROR",
            ErrorCode::SchedulerError => "SCHEDULER_ERROR",
            ErrorCode::ListFailed => "LIST_FAILED",
            ErrorCode::HistoryFailed => "HISTORY_FAILED",
            ErrorCode::StdoutFailed => "STDOUT_FAILED",
            ErrorCode::StderrFailed => "STDERR_FAILED",
            ErrorCode::UnknownRequest => "UNKNOWN_REQUEST",
            ErrorCode::EncodingError => "ENCODING_ERROR",
        }
    }
}
