//! Parsing and serialisation of the `<id>.task` text format (spec §4.5).
//!
//! ```text
//! <id>
//! <type>                "SIMPLE" | "SEQUENCE" | "ABSTRACT"
//! <command_count>
//! <command_line>        one per command: JSON array of argument strings
//! ...
//! <minute_mask>          15 hex digits, upper-case
//! <hour_mask>            6 hex digits, upper-case
//! <weekday_mask>         2 hex digits, upper-case
//! <flags>                reserved, always "0"
//! <last_run_epoch>       signed decimal, -1 if never
//! ```

use crate::codec::{format_hex_mask, parse_hex_mask};
use crate::common::{Command, Schedule, Task, TaskKind};
use crate::error::{Error, Result};

fn corrupt(reason: impl Into<String>) -> Error {
    Error::TaskFileCorrupt {
        path: String::new(),
        reason: reason.into(),
    }
}

/// Renders a single command as a JSON array of strings, e.g.
/// `["/bin/sh","-c","echo hi"]`. `serde_json` handles escaping; the
/// format matches what `parse_command_line` below expects.
fn write_command_line(command: &Command) -> Result<String> {
    serde_json::to_string(&command.argv).map_err(Error::from)
}

fn parse_command_line(line: &str) -> Result<Command> {
    let argv: Vec<String> =
        serde_json::from_str(line).map_err(|e| corrupt(format!("bad command line: {}", e)))?;
    if argv.is_empty() {
        return Err(corrupt("command with no arguments"));
    }
    Ok(Command::new(argv))
}

pub fn serialize_task(task: &Task) -> Result<String> {
    let mut out = String::new();
    out.push_str(&task.task_id.to_string());
    out.push('\n');
    out.push_str(task.kind.as_str());
    out.push('\n');
    out.push_str(&task.commands.len().to_string());
    out.push('\n');
    for command in &task.commands {
        out.push_str(&write_command_line(command)?);
        out.push('\n');
    }
    out.push_str(&format_hex_mask(task.schedule.minute_mask, 15));
    out.push('\n');
    out.push_str(&format_hex_mask(task.schedule.hour_mask as u64 & 0xFF_FFFF, 6));
    out.push('\n');
    out.push_str(&format_hex_mask(task.schedule.weekday_mask as u64 & 0x7F, 2));
    out.push('\n');
    out.push_str("0\n"); // reserved flags field, always zero on write
    out.push_str(&task.last_run_epoch.to_string());
    out.push('\n');
    Ok(out)
}

pub fn parse_task_file(content: &str) -> Result<Task> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() < 8 {
        return Err(corrupt("fewer than 8 lines"));
    }

    let task_id: u64 = lines[0]
        .trim()
        .parse()
        .map_err(|_| corrupt("bad task id"))?;

    let kind = TaskKind::from_str(lines[1].trim())
        .ok_or_else(|| corrupt(format!("unknown task type {:?}", lines[1])))?;

    let command_count: usize = lines[2]
        .trim()
        .parse()
        .map_err(|_| corrupt("bad command count"))?;

    let mut index = 3;
    let mut commands = Vec::with_capacity(command_count);
    for _ in 0..command_count {
        let line = lines
            .get(index)
            .ok_or_else(|| corrupt("truncated command section"))?;
        commands.push(parse_command_line(line)?);
        index += 1;
    }

    if index + 5 > lines.len() {
        return Err(corrupt("truncated schedule/flags/last-run section"));
    }

    let minute_mask = parse_hex_mask(lines[index])?;
    index += 1;
    let hour_mask = parse_hex_mask(lines[index])? as u32;
    index += 1;
    let weekday_mask = parse_hex_mask(lines[index])? as u8;
    index += 1;

    // `flags` is reserved: read and discarded, regardless of its value
    // (spec §9 — forward-compat for a field nothing uses yet).
    let _flags = lines[index];
    index += 1;

    let last_run_epoch: i64 = lines[index]
        .trim()
        .parse()
        .map_err(|_| corrupt("bad last_run_epoch"))?;

    Ok(Task {
        task_id,
        kind,
        commands,
        schedule: Schedule {
            minute_mask,
            hour_mask,
            weekday_mask,
            enabled: kind != TaskKind::Abstract,
        },
        last_run_epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            task_id: 42,
            kind: TaskKind::Sequence,
            commands: vec![
                Command::new(vec!["/bin/sh".into(), "-c".into(), "echo A".into()]),
                Command::new(vec!["/bin/sh".into(), "-c".into(), "echo B".into()]),
            ],
            schedule: Schedule {
                minute_mask: 0x1FFFF_FFFF_FFFF,
                hour_mask: 0xFFFFFF,
                weekday_mask: 0x7F,
                enabled: true,
            },
            last_run_epoch: -1,
        }
    }

    #[test]
    fn round_trips_a_task() {
        let task = sample_task();
        let serialized = serialize_task(&task).unwrap();
        let parsed = parse_task_file(&serialized).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn round_trips_an_abstract_task_with_no_commands() {
        let task = Task {
            task_id: 1,
            kind: TaskKind::Abstract,
            commands: vec![],
            schedule: Schedule::disabled(),
            last_run_epoch: 1_700_000_000,
        };
        let serialized = serialize_task(&task).unwrap();
        let parsed = parse_task_file(&serialized).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn rejects_truncated_files() {
        assert!(parse_task_file("1\nSIMPLE\n").is_err());
    }

    #[test]
    fn rejects_unknown_task_type() {
        assert!(parse_task_file("1\nWEIRD\n0\n000000000000000\n000000\n00\n0\n-1\n").is_err());
    }
}
