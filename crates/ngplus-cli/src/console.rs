//! Interactive command console on stdin.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use ngplus_core::{MonitorHandle, RecordKind, ShutdownSignal};
use owo_colors::OwoColorize;
use strum::IntoEnumIterator;
use tracing::debug;

/// How often the console checks for shutdown while idle
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `+N` / `-N`
    Relative(i64),
    /// `=N`
    Absolute(i64),
    Status,
    Info,
    Get { kind: RecordKind, row: i32 },
    /// `internal` reads, `internal N` writes
    Internal(Option<i32>),
    Help,
    Exit,
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix('+') {
        return Ok(Some(Command::Relative(parse_level(rest)?)));
    }
    if let Some(rest) = line.strip_prefix('-') {
        return Ok(Some(Command::Relative(-parse_level(rest)?)));
    }
    if let Some(rest) = line.strip_prefix('=') {
        return Ok(Some(Command::Absolute(parse_level(rest)?)));
    }

    let mut words = line.split_whitespace();
    let command = match words.next().map(str::to_ascii_lowercase).as_deref() {
        Some("status") => Command::Status,
        Some("info") => Command::Info,
        Some("help") | Some("?") => Command::Help,
        Some("exit") | Some("quit") => Command::Exit,
        Some("get") => {
            let kind = words
                .next()
                .ok_or_else(|| anyhow!("usage: get <record> <row>"))?;
            let kind: RecordKind = kind
                .parse()
                .map_err(|_| anyhow!("unknown record '{}'", kind))?;
            let row = words
                .next()
                .ok_or_else(|| anyhow!("usage: get <record> <row>"))?;
            let row = row
                .parse()
                .map_err(|_| anyhow!("invalid row id '{}'", row))?;
            Command::Get { kind, row }
        }
        Some("internal") => match words.next() {
            Some(value) => Command::Internal(Some(
                value
                    .parse()
                    .map_err(|_| anyhow!("invalid internal level '{}'", value))?,
            )),
            None => Command::Internal(None),
        },
        _ => bail!("unknown command '{}', type 'help'", line),
    };

    if let Some(extra) = words.next() {
        bail!("unexpected argument '{}'", extra);
    }
    Ok(Some(command))
}

fn parse_level(text: &str) -> Result<i64> {
    let text = text.trim();
    if text.starts_with(['+', '-']) {
        bail!("invalid level '{}'", text);
    }
    text.parse()
        .map_err(|_| anyhow!("invalid level '{}'", text))
}

/// Static facts for the `info` command.
pub struct Info {
    pub increments: Vec<(String, f64)>,
    pub tiered_max: u32,
}

/// Read commands until `exit` or shutdown.
pub fn run(handle: &MonitorHandle, info: &Info, shutdown: &ShutdownSignal) {
    let lines = spawn_stdin_reader();
    print_help();

    while !shutdown.is_shutdown() {
        let line = match lines.recv_timeout(IDLE_POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("stdin closed, waiting for Ctrl+C");
                while !shutdown.wait(Duration::from_secs(1)) {}
                break;
            }
        };

        match parse(&line) {
            Ok(Some(Command::Exit)) => break,
            Ok(Some(command)) => execute(command, handle, info),
            Ok(None) => {}
            Err(e) => println!("{} {}", "error:".red(), e),
        }
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        debug!("Console input unavailable: {}", e);
    }
    rx
}

fn execute(command: Command, handle: &MonitorHandle, info: &Info) {
    match command {
        Command::Relative(delta) => {
            let level = handle.request_relative(delta);
            println!("Requested level {}", level.to_string().cyan());
        }
        Command::Absolute(level) => {
            let level = handle.request_absolute(level);
            println!("Requested level {}", level.to_string().cyan());
        }
        Command::Status => print_status(handle),
        Command::Info => {
            println!("Beyond level {} every level adds:", info.tiered_max);
            for (field, increment) in &info.increments {
                println!("  {:<28} +{:.3}", field, increment);
            }
        }
        Command::Get { kind, row } => match handle.read_row(kind, row) {
            Ok(Some(row)) => {
                println!("{} row {}", kind.bold(), row.id);
                for (field, value) in &row.values {
                    println!("  {:<28} {}", field, value);
                }
            }
            Ok(None) => println!("{} {} has no row {}", "error:".red(), kind, row),
            Err(e) => println!("{} {}", "error:".red(), e),
        },
        Command::Internal(None) => match handle.read_internal_level() {
            Ok(value) => println!("Internal NG+ level: {}", value),
            Err(e) => println!("{} {}", "error:".red(), e),
        },
        Command::Internal(Some(value)) => match handle.write_internal_level(value) {
            Ok(()) => println!("Internal NG+ level set to {}", value),
            Err(e) => println!("{} {}", "error:".red(), e),
        },
        Command::Help => print_help(),
        Command::Exit => {}
    }
}

fn print_status(handle: &MonitorHandle) {
    let status = handle.status();
    let process = match status.pid {
        Some(pid) => format!("pid {}", pid).green().to_string(),
        None => "not attached".yellow().to_string(),
    };
    println!("State:     {} ({})", status.state, process);
    println!(
        "Level:     {} (requested {})",
        handle.current().to_string().cyan(),
        handle.requested()
    );
    for (kind, label) in &status.records {
        let label = if label.starts_with("located") {
            label.green().to_string()
        } else {
            label.yellow().to_string()
        };
        println!("  {:<16} {}", kind.to_string(), label);
    }
}

fn print_help() {
    let records = RecordKind::iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    println!("{}", "Commands".bold());
    println!("  +N / -N            raise or lower the level by N");
    println!("  =N                 set the level to N (0 disables scaling)");
    println!("  status             attachment and record state");
    println!("  info               per-level increments past the tier table");
    println!("  get <record> <row> live values of one row ({})", records);
    println!("  internal [N]       read or write the game's own NG+ level");
    println!("  exit / quit        stop");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_and_absolute() {
        assert_eq!(parse("+3").unwrap(), Some(Command::Relative(3)));
        assert_eq!(parse("-2").unwrap(), Some(Command::Relative(-2)));
        assert_eq!(parse(" =15 ").unwrap(), Some(Command::Absolute(15)));
        assert_eq!(parse("=0").unwrap(), Some(Command::Absolute(0)));
    }

    #[test]
    fn test_parse_rejects_bad_levels() {
        assert!(parse("+").is_err());
        assert!(parse("+x").is_err());
        assert!(parse("--2").is_err());
        assert!(parse("=-1").is_err());
    }

    #[test]
    fn test_parse_words() {
        assert_eq!(parse("status").unwrap(), Some(Command::Status));
        assert_eq!(parse("INFO").unwrap(), Some(Command::Info));
        assert_eq!(parse("quit").unwrap(), Some(Command::Exit));
        assert_eq!(parse("exit").unwrap(), Some(Command::Exit));
        assert_eq!(parse("   ").unwrap(), None);
        assert!(parse("jump").is_err());
        assert!(parse("status now").is_err());
    }

    #[test]
    fn test_parse_get() {
        assert_eq!(
            parse("get speffectparam 7400").unwrap(),
            Some(Command::Get {
                kind: RecordKind::SpEffectParam,
                row: 7400
            })
        );
        assert!(parse("get SpEffectParam").is_err());
        assert!(parse("get NpcParam 1").is_err());
        assert!(parse("get GameAreaParam abc").is_err());
    }

    #[test]
    fn test_parse_internal() {
        assert_eq!(parse("internal").unwrap(), Some(Command::Internal(None)));
        assert_eq!(parse("internal 0").unwrap(), Some(Command::Internal(Some(0))));
        assert!(parse("internal one").is_err());
    }
}
