use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::BundleConfig;

/// Bump when the cached parse-result format or the parser changes.
pub const VALIDATE_CACHE_VERSION: u32 = 1;

const OBJECT_CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS object_cache (
    cache_key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at_unix INTEGER NOT NULL
);
"#;

/// Get-or-compute cache for expensive derived values. The callback runs
/// only on a miss; concurrency control across processes belongs to the
/// implementation.
pub trait ObjectCache {
    fn get_with_set_callback(
        &self,
        key: &str,
        ttl: Duration,
        compute: &mut dyn FnMut() -> Result<String>,
    ) -> Result<String>;
}

/// Process-local object cache. Fits the single-threaded-per-request model;
/// nothing survives the process.
#[derive(Default)]
pub struct InMemoryObjectCache {
    entries: RefCell<HashMap<String, (String, SystemTime)>>,
}

impl InMemoryObjectCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectCache for InMemoryObjectCache {
    fn get_with_set_callback(
        &self,
        key: &str,
        ttl: Duration,
        compute: &mut dyn FnMut() -> Result<String>,
    ) -> Result<String> {
        let now = SystemTime::now();
        if let Some((value, expires_at)) = self.entries.borrow().get(key)
            && *expires_at > now
        {
            return Ok(value.clone());
        }
        let value = compute()?;
        self.entries
            .borrow_mut()
            .insert(key.to_string(), (value.clone(), now + ttl));
        Ok(value)
    }
}

/// Object cache backed by a sqlite database file, shared across requests.
pub struct SqliteObjectCache {
    db_path: PathBuf,
}

impl SqliteObjectCache {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(OBJECT_CACHE_SCHEMA_SQL)
            .context("failed to initialize object cache schema")?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }
}

impl ObjectCache for SqliteObjectCache {
    fn get_with_set_callback(
        &self,
        key: &str,
        ttl: Duration,
        compute: &mut dyn FnMut() -> Result<String>,
    ) -> Result<String> {
        let connection = open_connection(&self.db_path)?;
        let now = unix_timestamp()?;
        let hit: Option<String> = connection
            .query_row(
                "SELECT value FROM object_cache WHERE cache_key = ?1 AND expires_at_unix > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read cache entry {key}"))?;
        if let Some(value) = hit {
            return Ok(value);
        }
        let value = compute()?;
        let ttl_secs = i64::try_from(ttl.as_secs()).context("ttl does not fit into i64")?;
        connection
            .execute(
                "INSERT OR REPLACE INTO object_cache (cache_key, value, expires_at_unix)
                 VALUES (?1, ?2, ?3)",
                params![key, value, now + ttl_secs],
            )
            .with_context(|| format!("failed to write cache entry {key}"))?;
        Ok(value)
    }
}

/// Outcome of parsing user-provided script content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseIssue {
    pub message: String,
    pub line: usize,
}

/// Syntax-checks user-editable Lua before it is bundled, caching parse
/// results by content hash. Broken scripts are replaced with an inert
/// logging stub instead of failing the batch response.
pub struct ScriptValidator {
    wiki_id: String,
    enabled: bool,
    ttl: Duration,
    cache: Box<dyn ObjectCache>,
}

impl ScriptValidator {
    pub fn new(config: &BundleConfig, cache: Box<dyn ObjectCache>) -> Self {
        Self {
            wiki_id: config.wiki_id(),
            enabled: config.validate_scripts(),
            ttl: config.validator_ttl(),
            cache,
        }
    }

    /// Returns the script unchanged when it parses (or validation is
    /// disabled), and a `mw.log(...)` stub describing the syntax error
    /// otherwise. Never fails on bad input, only on cache errors.
    pub fn validate(&self, file_name: &str, contents: &str) -> Result<String> {
        if !self.enabled {
            return Ok(contents.to_string());
        }

        // Content hash in the key makes edits take effect immediately,
        // without purges; wiki id and file name scope the entry because
        // hashes alone are not unique across wikis and pages.
        let key = format!(
            "{}:script-parse:{}:{}:{}",
            self.wiki_id,
            VALIDATE_CACHE_VERSION,
            content_hash(contents),
            file_name
        );
        let envelope = self
            .cache
            .get_with_set_callback(&key, self.ttl, &mut || {
                // Success is cached explicitly as JSON null so known-good
                // content is never re-parsed.
                match parse_script(contents) {
                    None => Ok("null".to_string()),
                    Some(issue) => {
                        serde_json::to_string(&issue).context("failed to serialize parse issue")
                    }
                }
            })?;
        let issue: Option<ParseIssue> = serde_json::from_str(&envelope)
            .with_context(|| format!("corrupt validator cache entry {key}"))?;

        match issue {
            None => Ok(contents.to_string()),
            Some(issue) => Ok(format!(
                "mw.log({})",
                lua_quote(&format!(
                    "Parse error: {} on line {} in {}",
                    issue.message, issue.line, file_name
                ))
            )),
        }
    }
}

/// First syntax issue in a script, or `None` when it parses cleanly.
pub fn parse_script(contents: &str) -> Option<ParseIssue> {
    match full_moon::parse(contents) {
        Ok(_) => None,
        Err(errors) => {
            let first = errors.into_iter().next()?;
            let line = match &first {
                full_moon::Error::AstError(error) => error.token().start_position().line(),
                full_moon::Error::TokenizerError(error) => error.position().line(),
            };
            Some(ParseIssue {
                message: first.to_string(),
                line,
            })
        }
    }
}

fn content_hash(contents: &str) -> String {
    let digest = Sha256::digest(contents.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Quote a string as a Lua literal, safe to embed in generated code.
fn lua_quote(value: &str) -> String {
    let mut output = String::with_capacity(value.len() + 2);
    output.push('"');
    for ch in value.chars() {
        match ch {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if (c as u32) < 0x20 => output.push_str(&format!("\\{}", c as u32)),
            c => output.push(c),
        }
    }
    output.push('"');
    output
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))
}

fn unix_timestamp() -> Result<i64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?;
    i64::try_from(now.as_secs()).context("timestamp does not fit into i64")
}
