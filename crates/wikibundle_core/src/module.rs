use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::config::BundleConfig;
use crate::content::{ModuleContent, Scripts, Styles, combine_styles};
use crate::context::Context;
use crate::deps::{DependencyStore, dependency_key, relative_paths};
use crate::filter::{metric_label, minify_css};
use crate::messages::MessageBlobStore;
use crate::version::{base_summary, has_base_fields, make_hash};

/// Trust level of a module's content. Scripts and styles form a hierarchy
/// of trustworthiness: core modules are most trusted, per-user wiki pages
/// least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    CoreSitewide,
    CoreIndividual,
    UserSitewide,
    UserIndividual,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CoreSitewide => "core-sitewide",
            Self::CoreIndividual => "core-individual",
            Self::UserSitewide => "user-sitewide",
            Self::UserIndividual => "user-individual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "core-sitewide" => Some(Self::CoreSitewide),
            "core-individual" => Some(Self::CoreIndividual),
            "user-sitewide" => Some(Self::UserSitewide),
            "user-individual" => Some(Self::UserIndividual),
            _ => None,
        }
    }

    /// Whether the content comes from user-editable wiki pages.
    pub fn is_user(self) -> bool {
        matches!(self, Self::UserSitewide | Self::UserIndividual)
    }
}

/// Reserved group names carry special delivery behavior; anything else is
/// a freeform grouping label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    Site,
    User,
    Private,
    Noscript,
    Custom(String),
}

impl Group {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Site => "site",
            Self::User => "user",
            Self::Private => "private",
            Self::Noscript => "noscript",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "site" => Self::Site,
            "user" => Self::User,
            "private" => Self::Private,
            "noscript" => Self::Noscript,
            other => Self::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadType {
    /// Styles only, delivered via a stylesheet link.
    Styles,
    /// May carry scripts and other resources, loaded by the client loader.
    #[default]
    General,
}

impl LoadType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Styles => "styles",
            Self::General => "general",
        }
    }
}

/// Deprecation marker: absent, plain, or with an explanatory note.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Deprecation {
    #[default]
    None,
    Deprecated,
    Explained(String),
}

impl Deprecation {
    pub fn warning(&self, module_name: &str) -> Option<String> {
        let base = format!("This page is using the deprecated module \"{module_name}\".");
        match self {
            Self::None => None,
            Self::Deprecated => Some(base),
            Self::Explained(note) => Some(format!("{base}\n{note}")),
        }
    }
}

/// Resource a browser may preload ahead of the module payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadLink {
    pub url: String,
    pub as_type: String,
    pub media: Option<String>,
}

/// Where a module's raw resources come from. Implementations retrieve
/// scripts, styles, and declared metadata; the [`Module`] wrapper owns all
/// caching and fingerprinting on top.
pub trait ModuleSource {
    /// Concrete type identity, recorded in definition summaries.
    fn class_name(&self) -> &'static str;

    fn script(&self, context: &Context) -> Result<Scripts>;

    /// CSS keyed by media type. An empty map means the module has no
    /// styles at all.
    fn styles(&self, context: &Context) -> Result<BTreeMap<String, Vec<String>>>;

    /// Message keys this module needs localized.
    fn messages(&self) -> Vec<String> {
        Vec::new()
    }

    /// Template alias to template text.
    fn templates(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    fn group(&self) -> Option<Group> {
        None
    }

    fn origin(&self) -> Origin {
        Origin::CoreSitewide
    }

    fn load_type(&self) -> LoadType {
        LoadType::General
    }

    /// Source wiki name; `local` unless the module is served remotely.
    fn source(&self) -> &str {
        "local"
    }

    fn deprecation(&self) -> Deprecation {
        Deprecation::None
    }

    /// Whether debug requests may reference this module's styles by URL
    /// instead of inlining them.
    fn supports_url_loading(&self) -> bool {
        true
    }

    /// Version strategy: true to hash the full built bundle, false
    /// (default) to hash the definition summary. Content hashing is only
    /// appropriate when building is cheap.
    fn content_versioned(&self) -> bool {
        false
    }

    /// Deterministic metadata record used for metadata-addressed
    /// versioning. Implementations must extend [`base_summary`] — dropping
    /// the base fields is a contract violation rejected at hash time.
    /// Keep file lists in original order: order affects concatenation
    /// output, and sorting would mask a real change.
    fn definition_summary(&self, _context: &Context) -> Result<Value> {
        Ok(Value::Object(base_summary(self.class_name())))
    }

    fn preload_links(&self, _context: &Context) -> Vec<PreloadLink> {
        Vec::new()
    }

    /// Relative file paths the module's styles reference indirectly
    /// (images pulled in via CSS), for the dependency tracker.
    fn indirect_dependencies(&self, _context: &Context) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Runtime wrapper around a [`ModuleSource`], owning the per-context
/// caches. All caches live for the process lifetime and are never evicted;
/// request handling is single-threaded, so plain maps suffice.
pub struct Module {
    name: String,
    source: Box<dyn ModuleSource>,
    config: Arc<BundleConfig>,
    contents: HashMap<String, ModuleContent>,
    version_hash: HashMap<String, String>,
    msg_blobs: HashMap<String, Option<String>>,
    file_deps: HashMap<String, Vec<String>>,
}

impl Module {
    /// The name is fixed here, at registration time.
    pub fn new(name: &str, source: Box<dyn ModuleSource>, config: Arc<BundleConfig>) -> Self {
        Self {
            name: name.to_string(),
            source,
            config,
            contents: HashMap::new(),
            version_hash: HashMap::new(),
            msg_blobs: HashMap::new(),
            file_deps: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &dyn ModuleSource {
        self.source.as_ref()
    }

    pub fn origin(&self) -> Origin {
        self.source.origin()
    }

    pub fn group(&self) -> Option<Group> {
        self.source.group()
    }

    pub fn deprecation_warning(&self) -> Option<String> {
        self.source.deprecation().warning(&self.name)
    }

    /// Built bundle for this context, building at most once per distinct
    /// context fingerprint.
    pub fn content(
        &mut self,
        context: &Context,
        messages: &dyn MessageBlobStore,
    ) -> Result<&ModuleContent> {
        let context_hash = context.hash();
        // Building scripts, styles, and messages typically involves
        // filesystem and database access; do it once per fingerprint.
        if !self.contents.contains_key(&context_hash) {
            let built = self.build_content(context, messages)?;
            self.contents.insert(context_hash.clone(), built);
        }
        Ok(&self.contents[&context_hash])
    }

    fn build_content(
        &mut self,
        context: &Context,
        messages: &dyn MessageBlobStore,
    ) -> Result<ModuleContent> {
        let started = Instant::now();

        // Build both scripts and styles regardless of context.only(): the
        // result feeds the version hash, which must be identical across
        // only=scripts and only=styles requests for the same context.
        let scripts = self.source.script(context)?;

        let style_pairs = self.source.styles(context)?;
        let styles = if style_pairs.values().all(|list| list.is_empty()) {
            // Style-less modules get no styles value at all, not a map
            // with one empty entry.
            None
        } else if context.debug() && context.only().is_none() && self.source.supports_url_loading()
        {
            let mut urls = BTreeMap::new();
            urls.insert("all".to_string(), vec![self.debug_style_url(context)?]);
            Some(Styles::Urls { url: urls })
        } else {
            let pairs = if context.debug() {
                style_pairs
            } else {
                style_pairs
                    .into_iter()
                    .map(|(media, list)| {
                        (media, list.iter().map(|css| minify_css(css)).collect())
                    })
                    .collect()
            };
            Some(Styles::Css {
                css: combine_styles(&pairs),
            })
        };

        let messages_blob = self.message_blob(context, messages)?;

        let templates = match self.source.templates()? {
            map if map.is_empty() => None,
            map => Some(map),
        };

        let headers = match self.headers(context) {
            list if list.is_empty() => None,
            list => Some(list),
        };

        let content = ModuleContent {
            scripts,
            styles,
            messages_blob,
            templates,
            headers,
            deprecation_warning: self.deprecation_warning(),
        };

        tracing::debug!(
            module = %metric_label(&self.name),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built module content"
        );
        Ok(content)
    }

    fn debug_style_url(&self, context: &Context) -> Result<String> {
        let base = self.config.load_url()?;
        Ok(format!(
            "{base}?lang={}&skin={}&modules={}&only=styles&debug=1",
            context.language(),
            context.skin(),
            self.name
        ))
    }

    /// Preload links formatted as HTTP `Link` header strings. Only headers
    /// safe to repeat across a batched response belong here.
    fn headers(&self, context: &Context) -> Vec<String> {
        let links = self.source.preload_links(context);
        if links.is_empty() {
            return Vec::new();
        }
        let formatted = links
            .iter()
            .map(|link| {
                let mut entry = format!("<{}>;rel=preload;as={}", link.url, link.as_type);
                if let Some(media) = &link.media {
                    entry.push_str(&format!(";media={media}"));
                }
                entry
            })
            .collect::<Vec<_>>()
            .join(",");
        vec![format!("Link: {formatted}")]
    }

    /// Version fingerprint for caches on both sides of the wire. Empty in
    /// debug mode: debug responses are deliberately uncached and skipping
    /// the hash keeps them cheap.
    pub fn version_hash(
        &mut self,
        context: &Context,
        messages: &dyn MessageBlobStore,
    ) -> Result<String> {
        if context.debug() {
            return Ok(String::new());
        }

        let context_hash = context.hash();
        if !self.version_hash.contains_key(&context_hash) {
            let serialized = if self.source.content_versioned() {
                serde_json::to_string(self.content(context, messages)?)?
            } else {
                let summary = self.source.definition_summary(context)?;
                if !has_base_fields(&summary) {
                    bail!(
                        "definition summary for module {} must include the \
                         _class and _cacheVersion base fields",
                        self.name
                    );
                }
                serde_json::to_string(&summary)?
            };
            self.version_hash
                .insert(context_hash.clone(), make_hash(&serialized));
        }
        Ok(self.version_hash[&context_hash].clone())
    }

    /// Last-persisted indirect dependencies for this context's variant,
    /// loaded from the store on first access.
    pub fn file_dependencies(
        &mut self,
        context: &Context,
        store: &dyn DependencyStore,
    ) -> Result<Vec<String>> {
        let variant = context.vary();
        if !self.file_deps.contains_key(&variant) {
            let paths = store.retrieve(&dependency_key(&self.name, context))?;
            self.file_deps.insert(variant.clone(), paths);
        }
        Ok(self.file_deps[&variant].clone())
    }

    /// Override the in-memory value when the caller already knows the
    /// fresh set, skipping a redundant store fetch.
    pub fn set_file_dependencies(&mut self, context: &Context, paths: Vec<String>) {
        self.file_deps.insert(context.vary(), paths);
    }

    /// Persist freshly computed indirect dependencies. Paths are stored
    /// relative to `base` so tracked entries survive deployment moves, and
    /// the write is skipped when the set is unchanged in both directions —
    /// duplicates or reordering alone must not cause store churn.
    /// Returns whether a write was issued.
    pub fn save_file_dependencies(
        &mut self,
        context: &Context,
        store: &dyn DependencyStore,
        base: &Path,
        current_refs: &[String],
    ) -> Result<bool> {
        let paths = relative_paths(base, current_refs);
        let prior = self.file_dependencies(context, store)?;

        let new_set: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
        let prior_set: BTreeSet<&str> = prior.iter().map(String::as_str).collect();
        if new_set == prior_set {
            return Ok(false);
        }

        let mut entries = BTreeMap::new();
        entries.insert(dependency_key(&self.name, context), paths.clone());
        store.store_multi(&entries)?;
        self.file_deps.insert(context.vary(), paths);
        Ok(true)
    }

    /// Localized message blob for this context's language. Expected to be
    /// filled in batch via [`Module::set_message_blob`]; lazy filling works
    /// but defeats batching, hence the warning.
    pub fn message_blob(
        &mut self,
        context: &Context,
        store: &dyn MessageBlobStore,
    ) -> Result<Option<String>> {
        let keys = self.source.messages();
        if keys.is_empty() {
            // Don't bother consulting the store.
            return Ok(None);
        }
        let language = context.language().to_string();
        if !self.msg_blobs.contains_key(&language) {
            tracing::warn!(
                module = %self.name,
                language = %language,
                "message blob should have been preloaded"
            );
            let blob = store.blob(&self.name, &keys, &language)?;
            self.msg_blobs.insert(language.clone(), blob);
        }
        Ok(self.msg_blobs[&language].clone())
    }

    /// In-memory blob cache fill, used by the registry's batch preload.
    pub fn set_message_blob(&mut self, blob: Option<String>, language: &str) {
        self.msg_blobs.insert(language.to_string(), blob);
    }
}
