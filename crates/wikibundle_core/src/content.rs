use std::collections::BTreeMap;

use serde::Serialize;

/// One file of a multi-file script package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageFile {
    pub kind: PackageFileKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFileKind {
    Script,
    Data,
}

/// Script payload of a bundle: either flat concatenated code, or a package
/// of named files with a designated entry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Scripts {
    Plain {
        plain: String,
    },
    Package {
        files: BTreeMap<String, PackageFile>,
        main: String,
    },
}

impl Scripts {
    pub fn plain(code: impl Into<String>) -> Self {
        Self::Plain { plain: code.into() }
    }
}

/// Style payload: inline CSS (media-wrapped and flattened), or URL
/// references when serving debug responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Styles {
    Css { css: Vec<String> },
    Urls { url: BTreeMap<String, Vec<String>> },
}

/// The built, serializable output of a module for one context.
///
/// Optional fields are omitted from the serialized form when empty so that
/// modules which never produce them are not cache-invalidated when the
/// field is introduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleContent {
    pub scripts: Scripts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub styles: Option<Styles>,
    #[serde(rename = "messagesBlob", skip_serializing_if = "Option::is_none")]
    pub messages_blob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<String>>,
    #[serde(rename = "deprecationWarning", skip_serializing_if = "Option::is_none")]
    pub deprecation_warning: Option<String>,
}

/// Wrap per-media style lists into `@media` blocks and flatten. Styles for
/// media `all` are emitted as-is; empty strings are dropped.
pub fn combine_styles(pairs: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut combined = Vec::new();
    for (media, styles) in pairs {
        for css in styles {
            if css.is_empty() {
                continue;
            }
            if media == "all" || media.is_empty() {
                combined.push(css.clone());
            } else {
                combined.push(format!("@media {media} {{\n{css}\n}}"));
            }
        }
    }
    combined
}
