use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::context::Context;

const DEPENDENCY_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS module_dependencies (
    dep_key TEXT PRIMARY KEY,
    paths TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
"#;

/// Persists indirect file dependencies between requests. Key shape is
/// `<module>|<skin>|<language>`.
pub trait DependencyStore {
    fn retrieve(&self, key: &str) -> Result<Vec<String>>;
    fn store_multi(&self, entries: &BTreeMap<String, Vec<String>>) -> Result<()>;
}

pub fn dependency_key(module_name: &str, context: &Context) -> String {
    format!("{module_name}|{}", context.vary())
}

/// Make file paths relative to the project root so tracked entries stay
/// valid when the deployment moves. Already-relative paths are returned
/// unchanged, which keeps the operation idempotent: normalizing a stored
/// value a second time never produces a different representation.
pub fn relative_paths(base: &Path, file_paths: &[String]) -> Vec<String> {
    file_paths
        .iter()
        .map(|raw| {
            let path = Path::new(raw);
            match path.strip_prefix(base) {
                Ok(rel) => display_path(rel),
                Err(_) => display_path(path),
            }
        })
        .collect()
}

/// Expand tracked relative paths against the project root.
pub fn expand_paths(base: &Path, file_paths: &[String]) -> Vec<PathBuf> {
    file_paths
        .iter()
        .map(|raw| {
            let path = Path::new(raw);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
        .collect()
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Dependency store backed by a sqlite database file. Connections are
/// opened per operation; cross-process locking is sqlite's.
pub struct SqliteDependencyStore {
    db_path: PathBuf,
}

impl SqliteDependencyStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(DEPENDENCY_SCHEMA_SQL)
            .context("failed to initialize dependency schema")?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }
}

impl DependencyStore for SqliteDependencyStore {
    fn retrieve(&self, key: &str) -> Result<Vec<String>> {
        let connection = open_connection(&self.db_path)?;
        let row: Option<String> = connection
            .query_row(
                "SELECT paths FROM module_dependencies WHERE dep_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to retrieve dependencies for {key}"))?;
        match row {
            Some(serialized) => serde_json::from_str(&serialized)
                .with_context(|| format!("corrupt dependency row for {key}")),
            None => Ok(Vec::new()),
        }
    }

    fn store_multi(&self, entries: &BTreeMap<String, Vec<String>>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut connection = open_connection(&self.db_path)?;
        let updated_at = unix_timestamp()?;
        let transaction = connection
            .transaction()
            .context("failed to start dependency store transaction")?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT OR REPLACE INTO module_dependencies (dep_key, paths, updated_at_unix)
                     VALUES (?1, ?2, ?3)",
                )
                .context("failed to prepare dependency insert")?;
            for (key, paths) in entries {
                let serialized = serde_json::to_string(paths)
                    .with_context(|| format!("failed to serialize dependencies for {key}"))?;
                statement
                    .execute(params![key, serialized, updated_at])
                    .with_context(|| format!("failed to store dependencies for {key}"))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit dependency store transaction")?;
        Ok(())
    }
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        DependencyStore, SqliteDependencyStore, dependency_key, expand_paths, relative_paths,
    };
    use crate::context::Context;

    #[test]
    fn dependency_key_shape() {
        let context = Context::new("de", "minerva");
        assert_eq!(dependency_key("site.styles", &context), "site.styles|minerva|de");
    }

    #[test]
    fn retrieve_missing_key_is_empty() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteDependencyStore::open(&temp.path().join("deps.db")).expect("open");
        assert!(store.retrieve("foo|vector|en").expect("retrieve").is_empty());
    }

    #[test]
    fn store_multi_round_trips() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteDependencyStore::open(&temp.path().join("deps.db")).expect("open");
        let mut entries = BTreeMap::new();
        entries.insert(
            "foo|vector|en".to_string(),
            vec!["images/a.png".to_string(), "images/b.png".to_string()],
        );
        store.store_multi(&entries).expect("store");
        assert_eq!(
            store.retrieve("foo|vector|en").expect("retrieve"),
            vec!["images/a.png", "images/b.png"]
        );

        entries.insert("foo|vector|en".to_string(), vec!["images/c.png".to_string()]);
        store.store_multi(&entries).expect("replace");
        assert_eq!(
            store.retrieve("foo|vector|en").expect("retrieve"),
            vec!["images/c.png"]
        );
    }

    #[test]
    fn relative_paths_strip_the_base() {
        let base = Path::new("/srv/wiki");
        let paths = vec![
            "/srv/wiki/assets/images/logo.png".to_string(),
            "/elsewhere/readme.txt".to_string(),
        ];
        assert_eq!(
            relative_paths(base, &paths),
            vec!["assets/images/logo.png", "/elsewhere/readme.txt"]
        );
    }

    #[test]
    fn relative_paths_is_idempotent() {
        let base = Path::new("/srv/wiki");
        let raw = vec![
            "/srv/wiki/assets/images/logo.png".to_string(),
            "assets/images/icon.png".to_string(),
        ];
        let once = relative_paths(base, &raw);
        let twice = relative_paths(base, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn expand_paths_round_trip() {
        let base = Path::new("/srv/wiki");
        let relative = vec!["assets/images/logo.png".to_string()];
        let expanded = expand_paths(base, &relative);
        assert_eq!(expanded, vec![base.join("assets/images/logo.png")]);
        let back = relative_paths(
            base,
            &expanded
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect::<Vec<_>>(),
        );
        assert_eq!(back, relative);
    }
}
