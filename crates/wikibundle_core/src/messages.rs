use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

/// Supplies precomputed localized message blobs per (module, language).
pub trait MessageBlobStore {
    /// JSON object of the module's declared keys, or `None` when the
    /// language has no translations at all.
    fn blob(&self, module_name: &str, keys: &[String], language: &str) -> Result<Option<String>>;
}

/// Store that never has messages. Useful for registries of pure
/// script/style modules.
pub struct NullMessageStore;

impl MessageBlobStore for NullMessageStore {
    fn blob(&self, _module_name: &str, _keys: &[String], _language: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Reads flat `<language>.json` message tables from an i18n directory and
/// assembles deterministic blobs for the declared keys.
pub struct JsonMessageStore {
    i18n_dir: PathBuf,
}

impl JsonMessageStore {
    pub fn new(i18n_dir: &Path) -> Self {
        Self {
            i18n_dir: i18n_dir.to_path_buf(),
        }
    }
}

impl MessageBlobStore for JsonMessageStore {
    fn blob(&self, _module_name: &str, keys: &[String], language: &str) -> Result<Option<String>> {
        let table_path = self.i18n_dir.join(format!("{language}.json"));
        if !table_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&table_path)
            .with_context(|| format!("failed to read {}", table_path.display()))?;
        let table: BTreeMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", table_path.display()))?;

        // BTreeMap keeps the blob byte-identical across rebuilds even when
        // declared key order changes.
        let mut blob = BTreeMap::new();
        for key in keys {
            if let Some(value) = table.get(key) {
                blob.insert(key.as_str(), value.as_str());
            }
        }
        let serialized = serde_json::to_string(&blob).context("failed to serialize blob")?;
        Ok(Some(serialized))
    }
}
