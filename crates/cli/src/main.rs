#![forbid(unsafe_code)]

mod args;

use args::{CliConfig, Command, parse_args};
use serde_json::{Value, json};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uow_core::LockMode;
use uow_core::locks::REGISTRY;
use uow_storage::{DatabaseBuilder, KeyValueService, ScopeError, ScopeOptions, ScopeProvider};

fn init_logging() {
    let filter = EnvFilter::try_from_env("UOW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cfg: CliConfig) -> Result<Value, ScopeError> {
    tracing::debug!(command = ?cfg.command, db = %cfg.settings.database_path.display(), "uow_ctl");
    let provider = ScopeProvider::open(cfg.settings)?;
    match cfg.command {
        Command::Status => {
            let builder = DatabaseBuilder::new(provider.clone());
            let report = builder.validate_schema()?;
            Ok(json!({
                "database": provider.settings().database_path.display().to_string(),
                "locking": provider.locking().name(),
                "can_connect": builder.can_connect(),
                "installed": report.is_installed(),
                "valid": report.is_valid(),
                "summary": report.summary(),
                "schema": report,
            }))
        }
        Command::Install => {
            let report = DatabaseBuilder::new(provider).create_schema_and_data();
            Ok(json!(report))
        }
        Command::Locks => {
            let report = DatabaseBuilder::new(provider).validate_schema()?;
            let locks = REGISTRY
                .iter()
                .map(|(id, name)| {
                    json!({
                        "id": id.get(),
                        "name": name,
                        "present": !report.missing_locks.contains(id),
                    })
                })
                .collect::<Vec<_>>();
            Ok(json!({ "locks": locks }))
        }
        Command::KvGet { key } => {
            let value = KeyValueService::new().get_value(&provider.context(), &key)?;
            Ok(json!({ "key": key, "value": value }))
        }
        Command::KvSet { key, value } => {
            KeyValueService::new().set_value(&provider.context(), &key, &value)?;
            Ok(json!({ "key": key, "value": value, "written": true }))
        }
        Command::ProbeLock {
            id,
            mode,
            timeout_ms,
        } => {
            let ctx = provider.context();
            let scope = ctx.create_scope(ScopeOptions::auto_complete())?;
            let started = Instant::now();
            match (mode, timeout_ms.map(Duration::from_millis)) {
                (LockMode::Read, None) => scope.read_lock(&[id])?,
                (LockMode::Write, None) => scope.write_lock(&[id])?,
                (LockMode::Read, Some(timeout)) => scope.read_lock_with_timeout(timeout, &[id])?,
                (LockMode::Write, Some(timeout)) => scope.write_lock_with_timeout(timeout, &[id])?,
            }
            let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            // Write probes roll back so the lock row keeps its value.
            scope.complete_with(mode == LockMode::Read)?;
            let outcome = scope.dispose()?;
            Ok(json!({
                "id": id.get(),
                "lock": id.to_string(),
                "mode": mode.as_str(),
                "waited_ms": waited_ms,
                "outcome": format!("{outcome:?}"),
            }))
        }
    }
}

fn main() -> ExitCode {
    let argv = std::env::args().skip(1).collect::<Vec<_>>();
    if argv.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", args::usage());
        return ExitCode::SUCCESS;
    }
    init_logging();

    let cfg = match parse_args(&argv) {
        Ok(cfg) => cfg,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    match run(cfg) {
        Ok(out) => {
            println!("{out}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            let out = json!({
                "error": err.code(),
                "message": err.to_string(),
                "retryable": err.is_retryable(),
            });
            eprintln!("{out}");
            ExitCode::FAILURE
        }
    }
}
