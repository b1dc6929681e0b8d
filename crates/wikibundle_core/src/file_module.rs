use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use walkdir::WalkDir;

use crate::content::{PackageFile, PackageFileKind, Scripts};
use crate::context::Context;
use crate::module::{Deprecation, Group, LoadType, ModuleSource, Origin};
use crate::validate::ScriptValidator;
use crate::version::{base_summary, make_hash};

/// Manifest entry for one file-backed module.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ModuleDefinition {
    /// Script files in concatenation order. Order is significant.
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Entry file of a multi-file package. Absent means the scripts are
    /// concatenated flat.
    pub main: Option<String>,
    #[serde(default)]
    pub styles: Vec<StyleEntry>,
    /// Extra style files applied only for the named skin.
    #[serde(default)]
    pub skin_styles: BTreeMap<String, Vec<StyleEntry>>,
    #[serde(default)]
    pub messages: Vec<String>,
    pub templates_dir: Option<String>,
    pub group: Option<String>,
    pub origin: Option<String>,
    pub load_type: Option<String>,
    pub deprecated: Option<DeprecatedField>,
    #[serde(default)]
    pub content_versioned: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StyleEntry {
    Path(String),
    Full { path: String, media: String },
}

impl StyleEntry {
    fn path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Full { path, .. } => path,
        }
    }

    fn media(&self) -> &str {
        match self {
            Self::Path(_) => "all",
            Self::Full { media, .. } => media,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum DeprecatedField {
    Flag(bool),
    Note(String),
}

/// File-backed [`ModuleSource`]: reads scripts, styles, and templates from
/// disk under a base directory, per a manifest definition.
pub struct FileModuleSource {
    base_dir: PathBuf,
    definition: ModuleDefinition,
    group: Option<Group>,
    origin: Origin,
    load_type: LoadType,
    deprecation: Deprecation,
    validator: Option<Arc<ScriptValidator>>,
}

impl std::fmt::Debug for FileModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileModuleSource")
            .field("base_dir", &self.base_dir)
            .field("definition", &self.definition)
            .field("group", &self.group)
            .field("origin", &self.origin)
            .field("load_type", &self.load_type)
            .field("deprecation", &self.deprecation)
            .finish_non_exhaustive()
    }
}

impl FileModuleSource {
    pub fn from_definition(definition: ModuleDefinition, base_dir: &Path) -> Result<Self> {
        let origin = match definition.origin.as_deref() {
            None => Origin::CoreSitewide,
            Some(raw) => match Origin::parse(raw) {
                Some(origin) => origin,
                None => bail!("unknown module origin: {raw}"),
            },
        };
        let load_type = match definition.load_type.as_deref() {
            None | Some("general") => LoadType::General,
            Some("styles") => LoadType::Styles,
            Some(raw) => bail!("unknown module load type: {raw}"),
        };
        let group = definition.group.as_deref().map(Group::parse);
        let deprecation = match &definition.deprecated {
            None | Some(DeprecatedField::Flag(false)) => Deprecation::None,
            Some(DeprecatedField::Flag(true)) => Deprecation::Deprecated,
            Some(DeprecatedField::Note(note)) => Deprecation::Explained(note.clone()),
        };
        if let Some(main) = &definition.main
            && !definition.scripts.contains(main)
        {
            bail!("package main {main} is not listed in scripts");
        }
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            definition,
            group,
            origin,
            load_type,
            deprecation,
            validator: None,
        })
    }

    /// Route user-origin script files through a syntax validator before
    /// bundling.
    pub fn with_validator(mut self, validator: Arc<ScriptValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.base_dir.join(relative);
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn script_content(&self, relative: &str) -> Result<String> {
        let content = self.read_file(relative)?;
        if self.origin.is_user()
            && let Some(validator) = &self.validator
        {
            return validator.validate(relative, &content);
        }
        Ok(content)
    }

    fn style_entries<'a>(&'a self, context: &Context) -> Vec<&'a StyleEntry> {
        let mut entries: Vec<&StyleEntry> = self.definition.styles.iter().collect();
        if let Some(overrides) = self.definition.skin_styles.get(context.skin()) {
            entries.extend(overrides.iter());
        }
        entries
    }

    /// All files contributing to this context's output, in manifest order.
    /// The order is part of the definition summary: concatenation order
    /// changes the output, so it must change the version hash too.
    fn file_list(&self, context: &Context) -> Vec<String> {
        let mut files = self.definition.scripts.clone();
        files.extend(
            self.style_entries(context)
                .iter()
                .map(|entry| entry.path().to_string()),
        );
        files.extend(self.template_files().unwrap_or_default());
        files
    }

    fn template_files(&self) -> Result<Vec<String>> {
        let Some(dir) = &self.definition.templates_dir else {
            return Ok(Vec::new());
        };
        let root = self.base_dir.join(dir);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&root) {
            let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.base_dir)
                .unwrap_or(entry.path());
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
        files.sort();
        Ok(files)
    }
}

impl ModuleSource for FileModuleSource {
    fn class_name(&self) -> &'static str {
        "FileModuleSource"
    }

    fn script(&self, _context: &Context) -> Result<Scripts> {
        if let Some(main) = &self.definition.main {
            let mut files = BTreeMap::new();
            for relative in &self.definition.scripts {
                let kind = if relative.ends_with(".json") {
                    PackageFileKind::Data
                } else {
                    PackageFileKind::Script
                };
                let content = match kind {
                    PackageFileKind::Script => self.script_content(relative)?,
                    PackageFileKind::Data => self.read_file(relative)?,
                };
                files.insert(relative.clone(), PackageFile { kind, content });
            }
            return Ok(Scripts::Package {
                files,
                main: main.clone(),
            });
        }

        let mut pieces = Vec::with_capacity(self.definition.scripts.len());
        for relative in &self.definition.scripts {
            pieces.push(self.script_content(relative)?);
        }
        Ok(Scripts::plain(pieces.join("\n")))
    }

    fn styles(&self, context: &Context) -> Result<BTreeMap<String, Vec<String>>> {
        let mut pairs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.style_entries(context) {
            let content = self.read_file(entry.path())?;
            pairs.entry(entry.media().to_string()).or_default().push(content);
        }
        Ok(pairs)
    }

    fn messages(&self) -> Vec<String> {
        self.definition.messages.clone()
    }

    fn templates(&self) -> Result<BTreeMap<String, String>> {
        let Some(dir) = &self.definition.templates_dir else {
            return Ok(BTreeMap::new());
        };
        let mut templates = BTreeMap::new();
        for relative in self.template_files()? {
            let alias = relative
                .strip_prefix(&format!("{dir}/"))
                .unwrap_or(&relative)
                .to_string();
            templates.insert(alias, self.read_file(&relative)?);
        }
        Ok(templates)
    }

    fn group(&self) -> Option<Group> {
        self.group.clone()
    }

    fn origin(&self) -> Origin {
        self.origin
    }

    fn load_type(&self) -> LoadType {
        self.load_type
    }

    fn deprecation(&self) -> Deprecation {
        self.deprecation.clone()
    }

    fn supports_url_loading(&self) -> bool {
        // Packages need their file structure; a plain styles URL cannot
        // represent them.
        self.definition.main.is_none()
    }

    fn content_versioned(&self) -> bool {
        self.definition.content_versioned
    }

    fn definition_summary(&self, context: &Context) -> Result<Value> {
        let mut summary = base_summary(self.class_name());
        let files = self.file_list(context);
        let hashes: Vec<String> = files
            .iter()
            .map(|relative| safe_file_hash(&self.base_dir.join(relative)))
            .collect();
        summary.insert(
            "options".to_string(),
            json!({
                "group": self.group.as_ref().map(Group::as_str),
                "loadType": self.load_type.as_str(),
                "origin": self.origin.as_str(),
                "main": self.definition.main,
            }),
        );
        summary.insert("files".to_string(), json!(files));
        summary.insert("fileHashes".to_string(), json!(hashes));
        summary.insert("messages".to_string(), json!(self.definition.messages));
        Ok(Value::Object(summary))
    }

    fn indirect_dependencies(&self, context: &Context) -> Result<Vec<String>> {
        let mut refs = Vec::new();
        for entry in self.style_entries(context) {
            let content = self.read_file(entry.path())?;
            let style_dir = self
                .base_dir
                .join(entry.path())
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.base_dir.clone());
            for target in extract_url_refs(&content) {
                let resolved = style_dir.join(&target);
                if resolved.exists() {
                    refs.push(resolved.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(refs)
    }
}

/// Content hash of a file, empty string when the file is missing or
/// unreadable. Summaries must stay computable for half-deployed trees.
pub fn safe_file_hash(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => make_hash(&content),
        Err(_) => String::new(),
    }
}

/// Local file targets of `url(...)` references in a CSS string. Remote,
/// data, and fragment URLs are not tracked.
pub fn extract_url_refs(css: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut remainder = css;
    while let Some(start) = remainder.find("url(") {
        remainder = &remainder[start + 4..];
        let Some(end) = remainder.find(')') else {
            break;
        };
        let raw = remainder[..end].trim().trim_matches(['"', '\'']).trim();
        remainder = &remainder[end + 1..];
        if raw.is_empty()
            || raw.starts_with("data:")
            || raw.starts_with("http://")
            || raw.starts_with("https://")
            || raw.starts_with("//")
            || raw.starts_with('#')
        {
            continue;
        }
        // Strip query strings and fragments; only the file matters.
        let target = raw.split(['?', '#']).next().unwrap_or(raw);
        if !target.is_empty() {
            refs.push(target.to_string());
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{
        DeprecatedField, FileModuleSource, ModuleDefinition, StyleEntry, extract_url_refs,
        safe_file_hash,
    };
    use crate::config::BundleConfig;
    use crate::content::Scripts;
    use crate::context::Context;
    use crate::module::{Deprecation, ModuleSource, Origin};
    use crate::validate::{InMemoryObjectCache, ScriptValidator};

    fn write(base: &Path, relative: &str, content: &str) {
        let path = base.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
        fs::write(path, content).expect("write file");
    }

    fn source_with(definition: ModuleDefinition, base: &Path) -> FileModuleSource {
        FileModuleSource::from_definition(definition, base).expect("valid definition")
    }

    #[test]
    fn plain_scripts_concatenate_in_manifest_order() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "a.lua", "-- first");
        write(temp.path(), "b.lua", "-- second");
        let source = source_with(
            ModuleDefinition {
                scripts: vec!["a.lua".to_string(), "b.lua".to_string()],
                ..ModuleDefinition::default()
            },
            temp.path(),
        );
        let scripts = source.script(&Context::new("en", "vector")).expect("script");
        match scripts {
            Scripts::Plain { plain } => assert_eq!(plain, "-- first\n-- second"),
            other => panic!("unexpected scripts: {other:?}"),
        }
    }

    #[test]
    fn package_scripts_carry_main_and_data_files() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "init.lua", "return require('data.json')");
        write(temp.path(), "data.json", r#"{"x": 1}"#);
        let source = source_with(
            ModuleDefinition {
                scripts: vec!["init.lua".to_string(), "data.json".to_string()],
                main: Some("init.lua".to_string()),
                ..ModuleDefinition::default()
            },
            temp.path(),
        );
        let scripts = source.script(&Context::new("en", "vector")).expect("script");
        match scripts {
            Scripts::Package { files, main } => {
                assert_eq!(main, "init.lua");
                assert_eq!(files.len(), 2);
                assert_eq!(
                    files["data.json"].kind,
                    crate::content::PackageFileKind::Data
                );
            }
            other => panic!("unexpected scripts: {other:?}"),
        }
        assert!(!source.supports_url_loading());
    }

    #[test]
    fn package_main_must_be_listed() {
        let temp = tempdir().expect("tempdir");
        let error = FileModuleSource::from_definition(
            ModuleDefinition {
                scripts: vec!["a.lua".to_string()],
                main: Some("missing.lua".to_string()),
                ..ModuleDefinition::default()
            },
            temp.path(),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("not listed in scripts"));
    }

    #[test]
    fn styles_group_by_media_and_apply_skin_overrides() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "screen.css", ".screen{}");
        write(temp.path(), "print.css", ".print{}");
        write(temp.path(), "vector.css", ".vector{}");
        let mut definition = ModuleDefinition {
            styles: vec![
                StyleEntry::Path("screen.css".to_string()),
                StyleEntry::Full {
                    path: "print.css".to_string(),
                    media: "print".to_string(),
                },
            ],
            ..ModuleDefinition::default()
        };
        definition.skin_styles.insert(
            "vector".to_string(),
            vec![StyleEntry::Path("vector.css".to_string())],
        );
        let source = source_with(definition, temp.path());

        let vector = source.styles(&Context::new("en", "vector")).expect("styles");
        assert_eq!(vector["all"], vec![".screen{}", ".vector{}"]);
        assert_eq!(vector["print"], vec![".print{}"]);

        let minerva = source.styles(&Context::new("en", "minerva")).expect("styles");
        assert_eq!(minerva["all"], vec![".screen{}"]);
    }

    #[test]
    fn user_origin_scripts_are_validated() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "gadget.lua", "function oops(");
        let validator = Arc::new(ScriptValidator::new(
            &BundleConfig::default(),
            Box::new(InMemoryObjectCache::new()),
        ));
        let source = source_with(
            ModuleDefinition {
                scripts: vec!["gadget.lua".to_string()],
                origin: Some("user-sitewide".to_string()),
                ..ModuleDefinition::default()
            },
            temp.path(),
        )
        .with_validator(validator.clone());
        let scripts = source.script(&Context::new("en", "vector")).expect("script");
        match scripts {
            Scripts::Plain { plain } => {
                assert!(plain.starts_with("mw.log("));
                assert!(plain.contains("Parse error:"));
                assert!(plain.contains("gadget.lua"));
            }
            other => panic!("unexpected scripts: {other:?}"),
        }

        // Trusted origins bypass validation even when a validator is set.
        let trusted = source_with(
            ModuleDefinition {
                scripts: vec!["gadget.lua".to_string()],
                ..ModuleDefinition::default()
            },
            temp.path(),
        )
        .with_validator(validator);
        match trusted.script(&Context::new("en", "vector")).expect("script") {
            Scripts::Plain { plain } => assert_eq!(plain, "function oops("),
            other => panic!("unexpected scripts: {other:?}"),
        }
    }

    #[test]
    fn templates_are_keyed_by_alias() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "templates/row.mustache", "<tr>{{value}}</tr>");
        write(temp.path(), "templates/cell.mustache", "<td>{{value}}</td>");
        let source = source_with(
            ModuleDefinition {
                templates_dir: Some("templates".to_string()),
                ..ModuleDefinition::default()
            },
            temp.path(),
        );
        let templates = source.templates().expect("templates");
        assert_eq!(templates["row.mustache"], "<tr>{{value}}</tr>");
        assert_eq!(templates["cell.mustache"], "<td>{{value}}</td>");
    }

    #[test]
    fn summary_keeps_file_order() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "a.lua", "-- a");
        write(temp.path(), "b.lua", "-- b");
        let context = Context::new("en", "vector");

        let forward = source_with(
            ModuleDefinition {
                scripts: vec!["a.lua".to_string(), "b.lua".to_string()],
                ..ModuleDefinition::default()
            },
            temp.path(),
        )
        .definition_summary(&context)
        .expect("summary");
        let reversed = source_with(
            ModuleDefinition {
                scripts: vec!["b.lua".to_string(), "a.lua".to_string()],
                ..ModuleDefinition::default()
            },
            temp.path(),
        )
        .definition_summary(&context)
        .expect("summary");

        assert_eq!(forward["_class"], "FileModuleSource");
        assert_eq!(forward["files"][0], "a.lua");
        assert_ne!(forward, reversed);
    }

    #[test]
    fn summary_hashes_track_file_content() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "a.lua", "-- v1");
        let definition = ModuleDefinition {
            scripts: vec!["a.lua".to_string()],
            ..ModuleDefinition::default()
        };
        let context = Context::new("en", "vector");
        let before = source_with(definition.clone(), temp.path())
            .definition_summary(&context)
            .expect("summary");
        write(temp.path(), "a.lua", "-- v2");
        let after = source_with(definition, temp.path())
            .definition_summary(&context)
            .expect("summary");
        assert_ne!(before["fileHashes"], after["fileHashes"]);
    }

    #[test]
    fn safe_file_hash_of_missing_file_is_empty() {
        assert_eq!(safe_file_hash(Path::new("/nonexistent/file.lua")), "");
    }

    #[test]
    fn indirect_dependencies_resolve_existing_images() {
        let temp = tempdir().expect("tempdir");
        write(
            temp.path(),
            "css/main.css",
            ".a { background: url(../images/logo.png); }\n\
             .b { background: url(\"missing.png\"); }\n\
             .c { background: url(data:image/png;base64,xyz); }\n\
             .d { background: url(https://example.org/x.png); }",
        );
        write(temp.path(), "images/logo.png", "png-bytes");
        let source = source_with(
            ModuleDefinition {
                styles: vec![StyleEntry::Path("css/main.css".to_string())],
                ..ModuleDefinition::default()
            },
            temp.path(),
        );
        let refs = source
            .indirect_dependencies(&Context::new("en", "vector"))
            .expect("deps");
        assert_eq!(refs.len(), 1);
        assert!(refs[0].ends_with("images/logo.png"));
    }

    #[test]
    fn extract_url_refs_strips_quotes_and_queries() {
        let refs = extract_url_refs(
            ".a { background: url( 'x.png?version=2' ); cursor: url(\"y.cur#frag\"); }",
        );
        assert_eq!(refs, vec!["x.png", "y.cur"]);
    }

    #[test]
    fn deprecation_field_accepts_flag_or_note() {
        let temp = tempdir().expect("tempdir");
        let flagged = source_with(
            ModuleDefinition {
                deprecated: Some(DeprecatedField::Flag(true)),
                ..ModuleDefinition::default()
            },
            temp.path(),
        );
        assert_eq!(flagged.deprecation(), Deprecation::Deprecated);

        let noted = source_with(
            ModuleDefinition {
                deprecated: Some(DeprecatedField::Note("Use x instead.".to_string())),
                ..ModuleDefinition::default()
            },
            temp.path(),
        );
        assert_eq!(
            noted.deprecation(),
            Deprecation::Explained("Use x instead.".to_string())
        );
    }

    #[test]
    fn unknown_origin_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let error = FileModuleSource::from_definition(
            ModuleDefinition {
                origin: Some("nonsense".to_string()),
                ..ModuleDefinition::default()
            },
            temp.path(),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("unknown module origin"));
        assert_eq!(Origin::parse("nonsense"), None);
    }
}
