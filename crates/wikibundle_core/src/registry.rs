use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::BundleConfig;
use crate::context::Context;
use crate::file_module::{FileModuleSource, ModuleDefinition};
use crate::messages::MessageBlobStore;
use crate::module::{Module, ModuleSource};
use crate::validate::ScriptValidator;

/// On-disk module manifest, one definition per module name.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDefinition>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse manifest {}", path.display()))
    }
}

/// Owns all registered modules. Names are unique; sources are boxed so
/// file-backed and programmatic modules coexist.
pub struct Registry {
    config: Arc<BundleConfig>,
    modules: BTreeMap<String, Module>,
}

impl Registry {
    pub fn new(config: Arc<BundleConfig>) -> Self {
        Self {
            config,
            modules: BTreeMap::new(),
        }
    }

    /// Build a registry from a manifest, resolving file paths against
    /// `base_dir`. User-origin modules pick up the validator when given.
    pub fn from_manifest(
        manifest: Manifest,
        base_dir: &Path,
        config: Arc<BundleConfig>,
        validator: Option<Arc<ScriptValidator>>,
    ) -> Result<Self> {
        let mut registry = Self::new(config);
        for (name, definition) in manifest.modules {
            let mut source = FileModuleSource::from_definition(definition, base_dir)
                .with_context(|| format!("invalid definition for module {name}"))?;
            if let Some(validator) = &validator {
                source = source.with_validator(validator.clone());
            }
            registry.register(&name, Box::new(source))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, source: Box<dyn ModuleSource>) -> Result<()> {
        if self.modules.contains_key(name) {
            bail!("module {name} is already registered");
        }
        self.modules.insert(
            name.to_string(),
            Module::new(name, source, self.config.clone()),
        );
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.modules.get_mut(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Batch-fill message blobs for the named modules so later content
    /// builds never fall back to per-module store lookups.
    pub fn preload_messages(
        &mut self,
        names: &[&str],
        context: &Context,
        store: &dyn MessageBlobStore,
    ) -> Result<()> {
        for name in names {
            let Some(module) = self.modules.get_mut(*name) else {
                bail!("unknown module: {name}");
            };
            let keys = module.source().messages();
            if keys.is_empty() {
                continue;
            }
            let blob = store.blob(name, &keys, context.language())?;
            module.set_message_blob(blob, context.language());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{Manifest, Registry};
    use crate::config::BundleConfig;
    use crate::context::Context;
    use crate::file_module::ModuleDefinition;
    use crate::messages::{JsonMessageStore, NullMessageStore};

    fn config() -> Arc<BundleConfig> {
        Arc::new(BundleConfig::default())
    }

    #[test]
    fn manifest_parses_module_definitions() {
        let manifest: Manifest = toml::from_str(
            r#"
            [modules."site.styles"]
            styles = ["site.css", { path = "print.css", media = "print" }]

            [modules."site.gadget"]
            scripts = ["gadget.lua"]
            origin = "user-sitewide"
            messages = ["gadget-title"]
            deprecated = "Use site.gadget2 instead."
            "#,
        )
        .expect("parse manifest");
        assert_eq!(manifest.modules.len(), 2);
        assert_eq!(manifest.modules["site.styles"].styles.len(), 2);
        assert_eq!(
            manifest.modules["site.gadget"].origin.as_deref(),
            Some("user-sitewide")
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let mut registry = Registry::new(config());
        let definition = ModuleDefinition::default();
        let first = crate::file_module::FileModuleSource::from_definition(
            definition.clone(),
            temp.path(),
        )
        .expect("source");
        let second =
            crate::file_module::FileModuleSource::from_definition(definition, temp.path())
                .expect("source");
        registry.register("site", Box::new(first)).expect("first");
        let error = registry
            .register("site", Box::new(second))
            .expect_err("duplicate");
        assert!(error.to_string().contains("already registered"));
    }

    #[test]
    fn from_manifest_registers_every_module() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.lua"), "-- a").expect("write");
        let mut manifest = Manifest::default();
        manifest.modules.insert(
            "site.a".to_string(),
            ModuleDefinition {
                scripts: vec!["a.lua".to_string()],
                ..ModuleDefinition::default()
            },
        );
        manifest
            .modules
            .insert("site.b".to_string(), ModuleDefinition::default());
        let registry =
            Registry::from_manifest(manifest, temp.path(), config(), None).expect("registry");
        assert_eq!(registry.names(), vec!["site.a", "site.b"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn preload_fills_blobs_for_declaring_modules_only() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("i18n")).expect("mkdir");
        std::fs::write(
            temp.path().join("i18n/en.json"),
            r#"{"greeting": "Hello"}"#,
        )
        .expect("write");
        let mut manifest = Manifest::default();
        manifest.modules.insert(
            "site.greet".to_string(),
            ModuleDefinition {
                messages: vec!["greeting".to_string()],
                ..ModuleDefinition::default()
            },
        );
        manifest
            .modules
            .insert("site.plain".to_string(), ModuleDefinition::default());
        let mut registry =
            Registry::from_manifest(manifest, temp.path(), config(), None).expect("registry");

        let store = JsonMessageStore::new(&temp.path().join("i18n"));
        let context = Context::new("en", "vector");
        registry
            .preload_messages(&["site.greet", "site.plain"], &context, &store)
            .expect("preload");

        // The blob is already cached, so content builds may use a store
        // that would fail on any real lookup.
        let module = registry.get_mut("site.greet").expect("module");
        let blob = module
            .message_blob(&context, &NullMessageStore)
            .expect("blob")
            .expect("present");
        assert!(blob.contains("Hello"));
    }

    #[test]
    fn preload_of_unknown_module_fails() {
        let mut registry = Registry::new(config());
        let error = registry
            .preload_messages(&["ghost"], &Context::new("en", "vector"), &NullMessageStore)
            .expect_err("unknown");
        assert!(error.to_string().contains("unknown module"));
    }
}
