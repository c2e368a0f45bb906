#![forbid(unsafe_code)]

use crate::scope::{ScopeContext, ScopeOptions};
use crate::schema::now_ms;
use crate::ScopeError;
use rusqlite::{Connection, OptionalExtension, params};
use uow_core::{LockId, LockMode};

/// String-keyed settings persisted in the `kv` table. Every call runs in its
/// own scope, which joins the ambient scope when there is one, and takes the
/// `KEY_VALUES` lock in the matching mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyValueService;

impl KeyValueService {
    pub fn new() -> Self {
        Self
    }

    pub fn get_value(&self, ctx: &ScopeContext, key: &str) -> Result<Option<String>, ScopeError> {
        let key = normalize_key(key)?;
        in_scope(ctx, ScopeOptions::auto_complete(), LockMode::Read, |conn| {
            conn.query_row("SELECT value FROM kv WHERE key=?1", params![key], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .map(Option::flatten)
        })
    }

    pub fn set_value(&self, ctx: &ScopeContext, key: &str, value: &str) -> Result<(), ScopeError> {
        let key = normalize_key(key)?;
        in_scope(ctx, ScopeOptions::default(), LockMode::Write, |conn| {
            conn.execute(
                r#"
                INSERT INTO kv(key, value, updated_at_ms) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms
                "#,
                params![key, value, now_ms()],
            )
            .map(|_| ())
        })
    }

    /// Replaces the value only if it currently equals `original`. Returns
    /// whether the write happened; a missing key never matches.
    pub fn try_set_value(
        &self,
        ctx: &ScopeContext,
        key: &str,
        original: &str,
        value: &str,
    ) -> Result<bool, ScopeError> {
        let key = normalize_key(key)?;
        in_scope(ctx, ScopeOptions::default(), LockMode::Write, |conn| {
            conn.execute(
                "UPDATE kv SET value=?3, updated_at_ms=?4 WHERE key=?1 AND value=?2",
                params![key, original, value, now_ms()],
            )
            .map(|changed| changed == 1)
        })
    }
}

fn normalize_key(key: &str) -> Result<&str, ScopeError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ScopeError::InvalidInput("key-value key must not be empty".to_string()));
    }
    Ok(key)
}

fn in_scope<R>(
    ctx: &ScopeContext,
    options: ScopeOptions,
    mode: LockMode,
    f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
) -> Result<R, ScopeError> {
    let scope = ctx.create_scope(options)?;
    match mode {
        LockMode::Read => scope.read_lock(&[LockId::KEY_VALUES])?,
        LockMode::Write => scope.write_lock(&[LockId::KEY_VALUES])?,
    }
    let out = scope.with_database(f)?;
    scope.complete()?;
    scope.dispose()?;
    Ok(out)
}
