use serde::Serialize;

/// Restricts a response to one half of a module's payload. Absent means the
/// combined scripts-and-styles response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Only {
    Scripts,
    Styles,
}

impl Only {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scripts => "scripts",
            Self::Styles => "styles",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scripts" => Some(Self::Scripts),
            "styles" => Some(Self::Styles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ltr,
    Rtl,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ltr => "ltr",
            Self::Rtl => "rtl",
        }
    }
}

const RTL_LANGUAGES: &[&str] = &["ar", "arc", "fa", "he", "ks", "ps", "sd", "ug", "ur", "yi"];

fn direction_for(language: &str) -> Direction {
    let base = language.split('-').next().unwrap_or(language);
    if RTL_LANGUAGES.contains(&base) {
        Direction::Rtl
    } else {
        Direction::Ltr
    }
}

/// Immutable request descriptor. Every field that can change a module's
/// output is part of [`Context::hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    language: String,
    skin: String,
    direction: Direction,
    debug: bool,
    only: Option<Only>,
}

impl Context {
    pub fn new(language: &str, skin: &str) -> Self {
        Self {
            direction: direction_for(language),
            language: language.to_string(),
            skin: skin.to_string(),
            debug: false,
            only: None,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_only(mut self, only: Option<Only>) -> Self {
        self.only = only;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn skin(&self) -> &str {
        &self.skin
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn only(&self) -> Option<Only> {
        self.only
    }

    /// Stable cache key, injective over (skin, language, debug, only).
    /// Direction is derived from the language and deliberately excluded so
    /// contexts that agree on the four relevant fields share a cache entry.
    pub fn hash(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.skin,
            self.language,
            if self.debug { "1" } else { "" },
            self.only.map(Only::as_str).unwrap_or("")
        )
    }

    /// Variant key for file dependency tracking: skin and language only.
    pub fn vary(&self) -> String {
        format!("{}|{}", self.skin, self.language)
    }
}
