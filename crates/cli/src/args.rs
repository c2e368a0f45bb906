#![forbid(unsafe_code)]

use std::path::PathBuf;
use uow_core::{LockId, LockMode};
use uow_storage::{LockingBackend, Settings};

pub(crate) fn usage() -> &'static str {
    "uow_ctl: inspect and prepare a unit-of-work database\n\n\
USAGE:\n\
  uow_ctl [--db PATH] [--config FILE] [--locking sqlite|local] [--no-install] COMMAND\n\n\
COMMANDS:\n\
  status                         connectivity and schema validation report\n\
  install                        create the core schema (reports when an upgrade is due)\n\
  locks                          registered lock ids and whether their rows exist\n\
  kv get KEY                     read a key-value entry\n\
  kv set KEY VALUE               write a key-value entry\n\
  probe-lock ID [--write] [--timeout-ms MS]\n\
                                 take a lock in a throwaway scope and report the wait\n\n\
NOTES:\n\
  - flags win over UOW_* environment variables, which win over --config.\n\
  - ID is a number (-331) or a registry name (servers, key-values, ...).\n\
  - UOW_LOG sets the log filter (default: info); logs go to stderr.\n"
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Status,
    Install,
    Locks,
    KvGet { key: String },
    KvSet { key: String, value: String },
    ProbeLock {
        id: LockId,
        mode: LockMode,
        timeout_ms: Option<u64>,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct CliConfig {
    pub(crate) settings: Settings,
    pub(crate) command: Command,
}

#[derive(Default)]
struct Flags {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    locking: Option<LockingBackend>,
    no_install: bool,
}

pub(crate) fn parse_args(args: &[String]) -> Result<CliConfig, String> {
    let (flags, positional) = split_flags(args)?;

    let settings = match flags.config.clone().or_else(|| env_var("UOW_CONFIG").map(PathBuf::from)) {
        Some(path) => Settings::from_json_file(&path).map_err(|err| err.to_string())?,
        None => Settings::default(),
    };
    let mut settings = settings.apply_env().map_err(|err| err.to_string())?;
    if let Some(db) = flags.db {
        settings.database_path = db;
    }
    if let Some(locking) = flags.locking {
        settings.locking = locking;
    }
    if flags.no_install {
        settings.install_missing_schema = false;
    }

    let command = parse_command(&positional)?;
    Ok(CliConfig { settings, command })
}

fn split_flags(args: &[String]) -> Result<(Flags, Vec<String>), String> {
    let mut flags = Flags::default();
    let mut positional = Vec::new();

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--db" => {
                i += 1;
                let v = args.get(i).ok_or("--db requires PATH")?;
                flags.db = Some(PathBuf::from(v));
            }
            "--config" => {
                i += 1;
                let v = args.get(i).ok_or("--config requires FILE")?;
                flags.config = Some(PathBuf::from(v));
            }
            "--locking" => {
                i += 1;
                let v = args.get(i).ok_or("--locking requires sqlite|local")?;
                flags.locking = Some(
                    LockingBackend::parse(v).ok_or_else(|| format!("--locking: unknown backend {v}"))?,
                );
            }
            "--no-install" => flags.no_install = true,
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }
    Ok((flags, positional))
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let words = args.iter().map(String::as_str).collect::<Vec<_>>();
    match words.as_slice() {
        ["status"] => Ok(Command::Status),
        ["install"] => Ok(Command::Install),
        ["locks"] => Ok(Command::Locks),
        ["kv", "get", key] => Ok(Command::KvGet {
            key: key.to_string(),
        }),
        ["kv", "set", key, value] => Ok(Command::KvSet {
            key: key.to_string(),
            value: value.to_string(),
        }),
        ["probe-lock", id, rest @ ..] => parse_probe(id, rest),
        [] => Err(format!("missing COMMAND\n\n{}", usage())),
        _ => Err(format!("Unknown command: {}\n\n{}", words.join(" "), usage())),
    }
}

fn parse_probe(id: &str, rest: &[&str]) -> Result<Command, String> {
    let id = LockId::parse(id).map_err(|err| err.to_string())?;
    let mut mode = LockMode::Read;
    let mut timeout_ms = None;

    let mut i = 0usize;
    while i < rest.len() {
        match rest[i] {
            "--write" => mode = LockMode::Write,
            "--timeout-ms" => {
                i += 1;
                let v = rest.get(i).ok_or("--timeout-ms requires MS")?;
                timeout_ms = Some(
                    v.parse::<u64>()
                        .map_err(|_| "--timeout-ms must be an integer (milliseconds)")?,
                );
            }
            other => return Err(format!("Unknown arg: {other}\n\n{}", usage())),
        }
        i += 1;
    }
    Ok(Command::ProbeLock {
        id,
        mode,
        timeout_ms,
    })
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn flags_may_appear_anywhere() {
        let (flags, positional) =
            split_flags(&args(&["kv", "--db", "x.db", "get", "--no-install", "site"])).expect("split");
        assert_eq!(flags.db, Some(PathBuf::from("x.db")));
        assert!(flags.no_install);
        assert_eq!(positional, args(&["kv", "get", "site"]));
    }

    #[test]
    fn commands_parse_into_their_variants() {
        assert_eq!(parse_command(&args(&["status"])), Ok(Command::Status));
        assert_eq!(
            parse_command(&args(&["kv", "set", "a", "b"])),
            Ok(Command::KvSet {
                key: "a".to_string(),
                value: "b".to_string()
            })
        );
        assert_eq!(
            parse_command(&args(&["probe-lock", "servers", "--write", "--timeout-ms", "50"])),
            Ok(Command::ProbeLock {
                id: LockId::SERVERS,
                mode: LockMode::Write,
                timeout_ms: Some(50),
            })
        );
        assert!(parse_command(&args(&["kv", "get"])).is_err());
        assert!(parse_command(&args(&[])).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = split_flags(&args(&["--locking", "etcd", "status"])).err().expect("rejected");
        assert!(err.contains("etcd"));
    }
}
