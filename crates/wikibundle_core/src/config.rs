use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WIKI_ID: &str = "wikibundle";
pub const DEFAULT_VALIDATOR_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BundleConfig {
    #[serde(default)]
    pub bundle: BundleSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BundleSection {
    /// Scopes validator cache keys so hashes never collide across wikis
    /// sharing one cache database.
    pub wiki_id: Option<String>,
    /// Base URL of the bundle endpoint, used for debug style URLs.
    pub load_url: Option<String>,
    pub validate_scripts: Option<bool>,
    pub validator_ttl_secs: Option<u64>,
    pub debug: Option<bool>,
}

impl BundleConfig {
    /// Resolve the wiki id: env WIKIBUNDLE_WIKI_ID > config > default.
    pub fn wiki_id(&self) -> String {
        if let Ok(value) = env::var("WIKIBUNDLE_WIKI_ID") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.bundle
            .wiki_id
            .clone()
            .unwrap_or_else(|| DEFAULT_WIKI_ID.to_string())
    }

    /// Resolve the load endpoint URL: env WIKIBUNDLE_LOAD_URL > config.
    /// Required whenever debug style URLs are built; there is no usable
    /// default, so absence is an error at the point of use.
    pub fn load_url(&self) -> Result<String> {
        if let Ok(value) = env::var("WIKIBUNDLE_LOAD_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Ok(trimmed);
            }
        }
        match &self.bundle.load_url {
            Some(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
            _ => bail!("load_url is not configured; set [bundle] load_url or WIKIBUNDLE_LOAD_URL"),
        }
    }

    pub fn validate_scripts(&self) -> bool {
        self.bundle.validate_scripts.unwrap_or(true)
    }

    pub fn validator_ttl(&self) -> Duration {
        Duration::from_secs(
            self.bundle
                .validator_ttl_secs
                .unwrap_or(DEFAULT_VALIDATOR_TTL_SECS),
        )
    }

    pub fn debug_default(&self) -> bool {
        self.bundle.debug.unwrap_or(false)
    }
}

/// Load a BundleConfig from a TOML file. Returns default if the file does
/// not exist.
pub fn load_config(config_path: &Path) -> Result<BundleConfig> {
    if !config_path.exists() {
        return Ok(BundleConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BundleConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
