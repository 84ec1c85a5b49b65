//! Wire and on-disk data model: task variants, schedules, run history.
//!
//! Mirrors the C struct layout from the original `common.h` one to one —
//! the task file format on disk depends on these exact field widths.

pub const DEFAULT_RUNDIR_PREFIX: &str = "/tmp";
pub const DEFAULT_RUNDIR_SUFFIX: &str = "/erraid";

pub const PIPES_DIR_NAME: &str = "pipes";
pub const PIPE_REQUEST_NAME: &str = "erraid-request-pipe";
pub const PIPE_REPLY_NAME: &str = "erraid-reply-pipe";

pub const TASKS_DIR_NAME: &str = "tasks";
pub const LOGS_DIR_NAME: &str = "logs";
pub const STATE_DIR_NAME: &str = "state";

pub const MAX_COMMAND_ARGS: usize = 16;
pub const MAX_TASK_COMMANDS: usize = 16;
pub const MAX_STDIO_SNAPSHOT: usize = 65536;
pub const STDIO_SNAPSHOT_COUNT: usize = 5;
pub const PIPE_MESSAGE_LIMIT: usize = 4096;

pub const MAGIC: u32 = 0x4449_4552;
pub const PROTO_VERSION: u8 = 0x01;

/// One of the three task shapes from spec §3. Variant invariants
/// (command count bounds, whether a schedule may fire) are enforced at
/// construction time by [`crate::daemon`], not by this enum itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Simple,
    Sequence,
    Abstract,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Simple => "SIMPLE",
            TaskKind::Sequence => "SEQUENCE",
            TaskKind::Abstract => "ABSTRACT",
        }
    }

    pub fn from_str(s: &str) -> Option<TaskKind> {
        match s {
            "SIMPLE" => Some(TaskKind::Simple),
            "SEQUENCE" => Some(TaskKind::Sequence),
            "ABSTRACT" => Some(TaskKind::Abstract),
            _ => None,
        }
    }
}

/// A single command: argv[0] plus arguments, 1..=16 entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
}

impl Command {
    pub fn new(argv: Vec<String>) -> Self {
        Command { argv }
    }
}

/// Three weekly bitmasks plus an enable flag (spec §3).
///
/// Bit *m* of `minutes` means minute *m* is allowed; bit *h* of `hours`
/// means hour *h* is allowed; bit 0 of `weekdays` is Sunday, matching
/// `chrono::Weekday::num_days_from_sunday`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub minute_mask: u64,
    pub hour_mask: u32,
    pub weekday_mask: u8,
    pub enabled: bool,
}

impl Schedule {
    pub fn disabled() -> Self {
        Schedule {
            minute_mask: 0,
            hour_mask: 0,
            weekday_mask: 0,
            enabled: false,
        }
    }

    pub fn minute_allowed(&self, minute: u32) -> bool {
        minute < 60 && (self.minute_mask >> minute) & 1 != 0
    }

    pub fn hour_allowed(&self, hour: u32) -> bool {
        hour < 24 && (self.hour_mask >> hour) & 1 != 0
    }

    pub fn weekday_allowed(&self, weekday: u32) -> bool {
        weekday < 7 && (self.weekday_mask >> weekday) & 1 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: u64,
    pub kind: TaskKind,
    pub commands: Vec<Command>,
    pub schedule: Schedule,
    /// Seconds since epoch, or -1 if the task has never fired.
    pub last_run_epoch: i64,
}

impl Task {
    pub fn never_run(&self) -> bool {
        self.last_run_epoch < 0
    }
}

/// One line of `history.log`: `<epoch> <status> <stdout_len> <stderr_len>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub epoch: i64,
    pub status: i32,
    pub stdout_len: usize,
    pub stderr_len: usize,
}

/// `(task_id, task_index, next_epoch)`. `next_epoch = None` means "will
/// not fire in the foreseeable future" (disabled or exhausted horizon).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub task_id: u64,
    pub task_index: usize,
    pub next_epoch: Option<i64>,
}

/// Protocol message type codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0x01,
    Pong = 0x02,
    ReqListTasks = 0x10,
    RspListTasks = 0x11,
    ReqCreateSimple = 0x20,
    ReqCreateSequence = 0x21,
    ReqCreateAbstract = 0x22,
    RspCreate = 0x23,
    ReqRemove = 0x30,
    RspRemove = 0x31,
    ReqListHistory = 0x40,
    RspListHistory = 0x41,
    ReqGetStdout = 0x50,
    RspGetStdout = 0x51,
    ReqGetStderr = 0x52,
    RspGetStderr = 0x53,
    ReqShutdown = 0x60,
    RspShutdown = 0x61,
    RspError = 0x7F,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        use MessageType::*;
        let kind = match value {
            0x01 => Ping,
            0x02 => Pong,
            0x10 => ReqListTasks,
            0x11 => RspListTasks,
            0x20 => ReqCreateSimple,
            0x21 => ReqCreateSequence,
            0x22 => ReqCreateAbstract,
            0x23 => RspCreate,
            0x30 => ReqRemove,
            0x31 => RspRemove,
            0x40 => ReqListHistory,
            0x41 => RspListHistory,
            0x50 => ReqGetStdout,
            0x51 => RspGetStdout,
            0x52 => ReqGetStderr,
            0x53 => RspGetStderr,
            0x60 => ReqShutdown,
            0x61 => RspShutdown,
            0x7F => RspError,
            _ => return None,
        };
        Some(kind)
    }
}
