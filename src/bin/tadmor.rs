//! `tadmor`: the erraid client CLI (spec §6). Builds a single request
//! from the selected operation flag, round-trips it over the two
//! FIFOs, and renders the reply.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use erraid::client::Connection;
use erraid::codec::parse_hex_mask;
use erraid::common::MessageType;
use erraid::config::Config;
use serde_json::{json, Value};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "tadmor", about = "client for the erraid scheduling daemon")]
struct Args {
    /// List tasks
    #[structopt(short = "l")]
    list: bool,
    /// Request daemon shutdown
    #[structopt(short = "q")]
    shutdown: bool,
    /// Create a simple task
    #[structopt(short = "c")]
    create_simple: bool,
    /// Create a sequence task
    #[structopt(short = "s")]
    create_sequence: bool,
    /// Create an abstract task
    #[structopt(short = "n")]
    create_abstract: bool,
    /// Remove a task
    #[structopt(short = "r")]
    remove: Option<u64>,
    /// Show a task's run history
    #[structopt(short = "x")]
    history: Option<u64>,
    /// Show a task's last captured stdout
    #[structopt(short = "o")]
    stdout: Option<u64>,
    /// Show a task's last captured stderr
    #[structopt(short = "e")]
    stderr: Option<u64>,
    /// Run directory (overrides the default <prefix>/<user><suffix> rule)
    #[structopt(short = "p")]
    root: Option<PathBuf>,
    /// Minute mask, 15 hex digits
    #[structopt(short = "m")]
    minutes: Option<String>,
    /// Hour mask, 6 hex digits
    #[structopt(short = "H")]
    hours: Option<String>,
    /// Weekday mask, 2 hex digits
    #[structopt(short = "w")]
    weekdays: Option<String>,
    /// Command(s) and arguments; separate sequence members with `--`
    command: Vec<String>,
}

/// Splits the trailing token list on literal `--` entries into one
/// argv group per command, mirroring the original getopt loop: an
/// empty leading group (from a no-op leading separator) is dropped,
/// and the final pending group is flushed even without a trailing `--`.
fn split_commands(tokens: &[String]) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        if token == "--" {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(token.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn require_schedule(args: &Args) -> Result<Value> {
    let minutes = args.minutes.as_deref().context("-m (minute mask) is required")?;
    let hours = args.hours.as_deref().context("-H (hour mask) is required")?;
    let weekdays = args.weekdays.as_deref().context("-w (weekday mask) is required")?;
    parse_hex_mask(minutes).context("-m is not valid hex")?;
    parse_hex_mask(hours).context("-H is not valid hex")?;
    parse_hex_mask(weekdays).context("-w is not valid hex")?;
    Ok(json!({"minutes": minutes, "hours": hours, "weekdays": weekdays}))
}

fn build_request(args: &Args) -> Result<(MessageType, Value)> {
    let operations = [
        args.list,
        args.shutdown,
        args.create_simple,
        args.create_sequence,
        args.create_abstract,
        args.remove.is_some(),
        args.history.is_some(),
        args.stdout.is_some(),
        args.stderr.is_some(),
    ];
    if operations.iter().filter(|&&set| set).count() != 1 {
        bail!("exactly one operation flag must be selected");
    }

    if args.list {
        return Ok((MessageType::ReqListTasks, json!({})));
    }
    if args.shutdown {
        return Ok((MessageType::ReqShutdown, json!({})));
    }
    if let Some(task_id) = args.remove {
        return Ok((MessageType::ReqRemove, json!({"task_id": task_id})));
    }
    if let Some(task_id) = args.history {
        return Ok((MessageType::ReqListHistory, json!({"task_id": task_id})));
    }
    if let Some(task_id) = args.stdout {
        return Ok((MessageType::ReqGetStdout, json!({"task_id": task_id})));
    }
    if let Some(task_id) = args.stderr {
        return Ok((MessageType::ReqGetStderr, json!({"task_id": task_id})));
    }

    let commands = split_commands(&args.command);
    if args.create_simple {
        if commands.len() != 1 {
            bail!("a simple task takes exactly one command");
        }
        let schedule = require_schedule(args)?;
        return Ok((
            MessageType::ReqCreateSimple,
            json!({"commands": commands, "schedule": schedule}),
        ));
    }
    if args.create_sequence {
        if commands.is_empty() {
            bail!("a sequence task takes at least one command");
        }
        let schedule = require_schedule(args)?;
        return Ok((
            MessageType::ReqCreateSequence,
            json!({"commands": commands, "schedule": schedule}),
        ));
    }
    if args.create_abstract {
        return Ok((
            MessageType::ReqCreateAbstract,
            json!({"commands": commands, "schedule": Value::Null}),
        ));
    }

    unreachable!("exactly one operation flag was confirmed selected above")
}

fn main() -> Result<()> {
    let args = Args::from_args();

    let (msg_type, payload) = match build_request(&args) {
        Ok(req) => req,
        Err(e) => {
            eprintln!("tadmor: {}", e);
            std::process::exit(2);
        }
    };

    let config = Config::resolve(args.root.clone());
    let connection = match Connection::open(&config.paths()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tadmor: could not connect to the daemon: {}", e);
            std::process::exit(1);
        }
    };

    let reply = match connection.send(msg_type, serde_json::to_vec(&payload)?.as_slice()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tadmor: request failed: {}", e);
            std::process::exit(1);
        }
    };

    let body: Value = match reply.payload_str().ok().and_then(|s| serde_json::from_str(s).ok()) {
        Some(v) => v,
        None => {
            eprintln!("tadmor: malformed reply from daemon");
            std::process::exit(1);
        }
    };

    if reply.msg_type() == Some(MessageType::RspError) {
        eprintln!("{}", serde_json::to_string_pretty(&body)?);
        std::process::exit(1);
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
