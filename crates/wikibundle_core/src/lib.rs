//! Build, memoize, and fingerprint deployable client asset bundles for a
//! wiki, per (module, request context) pair.

pub mod config;
pub mod content;
pub mod context;
pub mod deps;
pub mod file_module;
pub mod filter;
pub mod messages;
pub mod module;
pub mod registry;
pub mod validate;
pub mod version;

pub use config::{BundleConfig, load_config};
pub use content::{ModuleContent, Scripts, Styles};
pub use context::{Context, Only};
pub use module::{Module, ModuleSource, Origin};
pub use registry::Registry;
