//! Request payload parsing, handler logic, and reply rendering (spec
//! §4.3, §6, §7).
//!
//! Payloads are parsed as tolerant `serde_json::Value` trees rather
//! than matched against a fixed struct: unknown fields are ignored and
//! the three schedule keys are accepted in any order, matching the
//! design note in spec §9 about the original's substring-based parser.

use serde_json::{json, Value};

use crate::codec::{base64_encode, format_hex_mask, parse_hex_mask};
use crate::common::{Command, Schedule, Task, TaskKind, MAX_COMMAND_ARGS, MAX_TASK_COMMANDS};
use crate::error::ErrorCode;

use super::Daemon;

pub type HandlerResult = Result<Value, (ErrorCode, String)>;

fn invalid(message: impl Into<String>) -> (ErrorCode, String) {
    (ErrorCode::InvalidRequest, message.into())
}

fn parse_commands(value: &Value, min: usize, max: usize) -> Result<Vec<Command>, (ErrorCode, String)> {
    let raw = value
        .get("commands")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("\"commands\" must be an array"))?;

    if raw.len() < min || raw.len() > max {
        return Err(invalid(format!(
            "task requires {}..={} commands, got {}",
            min,
            max,
            raw.len()
        )));
    }

    let mut commands = Vec::with_capacity(raw.len());
    for entry in raw {
        let argv_raw = entry
            .as_array()
            .ok_or_else(|| invalid("each command must be an array of strings"))?;
        if argv_raw.is_empty() || argv_raw.len() > MAX_COMMAND_ARGS {
            return Err(invalid(format!(
                "command must have 1..={} arguments, got {}",
                MAX_COMMAND_ARGS,
                argv_raw.len()
            )));
        }
        let mut argv = Vec::with_capacity(argv_raw.len());
        for arg in argv_raw {
            let s = arg
                .as_str()
                .ok_or_else(|| invalid("command arguments must be strings"))?;
            argv.push(s.to_string());
        }
        commands.push(Command::new(argv));
    }
    Ok(commands)
}

fn parse_required_schedule(value: &Value) -> Result<Schedule, (ErrorCode, String)> {
    let schedule = value
        .get("schedule")
        .filter(|v| !v.is_null())
        .ok_or_else(|| invalid("\"schedule\" is required for this task type"))?;
    if !schedule.is_object() {
        return Err(invalid("\"schedule\" must be an object"));
    }

    let minutes = schedule
        .get("minutes")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("schedule.minutes is required"))?;
    let hours = schedule
        .get("hours")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("schedule.hours is required"))?;
    let weekdays = schedule
        .get("weekdays")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("schedule.weekdays is required"))?;

    let minute_mask = parse_hex_mask(minutes).map_err(|e| invalid(e.to_string()))?;
    let hour_mask = parse_hex_mask(hours).map_err(|e| invalid(e.to_string()))? as u32;
    let weekday_mask = parse_hex_mask(weekdays).map_err(|e| invalid(e.to_string()))? as u8;

    Ok(Schedule {
        minute_mask,
        hour_mask,
        weekday_mask,
        enabled: true,
    })
}

fn schedule_json(schedule: &Schedule) -> Value {
    json!({
        "minutes": format_hex_mask(schedule.minute_mask, 15),
        "hours": format_hex_mask(schedule.hour_mask as u64 & 0xFF_FFFF, 6),
        "weekdays": format_hex_mask(schedule.weekday_mask as u64 & 0x7F, 2),
    })
}

fn task_id_from(value: &Value) -> Result<u64, (ErrorCode, String)> {
    value
        .get("task_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("\"task_id\" must be a non-negative integer"))
}

impl Daemon {
    pub(super) fn handle_ping(&mut self) -> HandlerResult {
        Ok(json!({"status": "OK"}))
    }

    pub(super) fn handle_list_tasks(&mut self) -> HandlerResult {
        let tasks: Vec<Value> = self
            .tasks
            .iter()
            .map(|t| {
                json!({
                    "task_id": t.task_id,
                    "type": t.kind.as_str(),
                    "last_run": t.last_run_epoch,
                    "schedule": schedule_json(&t.schedule),
                })
            })
            .collect();
        Ok(json!({"status": "OK", "tasks": tasks}))
    }

    pub(super) fn handle_create(&mut self, kind: TaskKind, payload: &Value) -> HandlerResult {
        let (min, max) = match kind {
            TaskKind::Simple => (1, 1),
            TaskKind::Sequence => (1, MAX_TASK_COMMANDS),
            TaskKind::Abstract => (0, MAX_TASK_COMMANDS),
        };
        let commands = parse_commands(payload, min, max)?;
        let schedule = match kind {
            TaskKind::Abstract => Schedule::disabled(),
            _ => parse_required_schedule(payload)?,
        };

        let task_id = self
            .store
            .allocate_task_id()
            .map_err(|e| (ErrorCode::PersistenceError, e.to_string()))?;
        let task = Task {
            task_id,
            kind,
            commands,
            schedule,
            last_run_epoch: -1,
        };

        if let Err(e) = self.store.write_task(&task) {
            return Err((ErrorCode::PersistenceError, e.to_string()));
        }

        self.tasks.push(task);
        if let Err(e) = self.rebuild_plan() {
            // One-atomicity rule: undo the write, resync from disk.
            let _ = self.store.remove_task(task_id);
            self.tasks.pop();
            let _ = self.reload_tasks();
            return Err((ErrorCode::SchedulerError, e.to_string()));
        }

        Ok(json!({"status": "OK", "task_id": task_id}))
    }

    pub(super) fn handle_remove(&mut self, payload: &Value) -> HandlerResult {
        let task_id = task_id_from(payload)?;
        let index = self
            .tasks
            .iter()
            .position(|t| t.task_id == task_id)
            .ok_or_else(|| (ErrorCode::TaskNotFound, format!("no task with id {}", task_id)))?;

        if let Err(e) = self.store.remove_task(task_id) {
            return Err((ErrorCode::PersistenceError, e.to_string()));
        }
        self.tasks.remove(index);
        if let Err(e) = self.rebuild_plan() {
            let _ = self.reload_tasks();
            return Err((ErrorCode::SchedulerError, e.to_string()));
        }

        Ok(json!({"status": "OK"}))
    }

    pub(super) fn handle_list_history(&mut self, payload: &Value) -> HandlerResult {
        let task_id = task_id_from(payload)?;
        if !self.tasks.iter().any(|t| t.task_id == task_id) {
            return Err((ErrorCode::HistoryFailed, format!("no task with id {}", task_id)));
        }
        let history = self
            .store
            .load_history(task_id)
            .map_err(|e| (ErrorCode::HistoryFailed, e.to_string()))?;
        let entries: Vec<Value> = history
            .iter()
            .map(|h| {
                json!({
                    "epoch": h.epoch,
                    "status": h.status,
                    "stdout_len": h.stdout_len,
                    "stderr_len": h.stderr_len,
                })
            })
            .collect();
        Ok(json!({"status": "OK", "history": entries}))
    }

    pub(super) fn handle_get_stdio(&mut self, payload: &Value, stream: Stream) -> HandlerResult {
        let fail_code = match stream {
            Stream::Stdout => ErrorCode::StdoutFailed,
            Stream::Stderr => ErrorCode::StderrFailed,
        };
        let task_id = task_id_from(payload)?;
        if !self.tasks.iter().any(|t| t.task_id == task_id) {
            return Err((fail_code, format!("no task with id {}", task_id)));
        }
        let (stdout, stderr) = self
            .store
            .load_last_stdio(task_id)
            .map_err(|e| (fail_code, e.to_string()))?;
        let data = match stream {
            Stream::Stdout => stdout,
            Stream::Stderr => stderr,
        };
        let key = match stream {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        };

        // The base64 expansion of a full 65536-byte snapshot cannot fit a
        // sub-4096-byte record; mirror the original's EMSGSIZE guard and
        // fail the same way rather than silently truncating the reply.
        let required = ((data.len() + 2) / 3) * 4;
        if required + 64 >= crate::common::PIPE_MESSAGE_LIMIT {
            return Err((fail_code, "encoded snapshot exceeds the record payload limit".to_string()));
        }

        Ok(json!({"status": "OK", key: base64_encode(&data)}))
    }

    pub(super) fn handle_shutdown(&mut self) -> HandlerResult {
        self.should_quit = true;
        Ok(json!({"status": "OK"}))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Stream {
    Stdout,
    Stderr,
}
