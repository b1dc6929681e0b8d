use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use wikibundle_core::config::{BundleConfig, load_config};
use wikibundle_core::context::{Context, Only};
use wikibundle_core::deps::{SqliteDependencyStore, display_path, expand_paths};
use wikibundle_core::messages::{JsonMessageStore, MessageBlobStore, NullMessageStore};
use wikibundle_core::module::ModuleSource as _;
use wikibundle_core::registry::{Manifest, Registry};
use wikibundle_core::validate::{ScriptValidator, SqliteObjectCache, parse_script};

#[derive(Debug, Parser)]
#[command(
    name = "wikibundle",
    version,
    about = "Build, fingerprint, and cache wiki client asset bundles"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "CODE", help = "Request language")]
    lang: Option<String>,
    #[arg(long, global = true, value_name = "NAME", help = "Request skin")]
    skin: Option<String>,
    #[arg(long, global = true, help = "Build unminified debug output")]
    debug: bool,
    #[arg(
        long,
        global = true,
        value_name = "KIND",
        help = "Restrict output to scripts or styles"
    )]
    only: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    lang: Option<String>,
    skin: Option<String>,
    debug: bool,
    only: Option<String>,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            lang: cli.lang.clone(),
            skin: cli.skin.clone(),
            debug: cli.debug,
            only: cli.only.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the project layout and default config")]
    Init(InitArgs),
    #[command(about = "List registered modules")]
    List,
    #[command(about = "Build a module's content bundle as JSON")]
    Build(BuildArgs),
    #[command(about = "Print module version hashes")]
    Version(VersionArgs),
    #[command(about = "Show or refresh tracked file dependencies")]
    Deps(DepsArgs),
    #[command(about = "Syntax-check a script file")]
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config and manifest files")]
    force: bool,
}

#[derive(Debug, Args)]
struct BuildArgs {
    module: String,
    #[arg(long, help = "Compact JSON instead of pretty-printed")]
    compact: bool,
}

#[derive(Debug, Args)]
struct VersionArgs {
    #[arg(help = "Module name; all modules when omitted")]
    module: Option<String>,
}

#[derive(Debug, Args)]
struct DepsArgs {
    module: String,
    #[arg(long, help = "Recompute dependencies from styles and persist changes")]
    refresh: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    file: PathBuf,
}

#[derive(Debug, Clone)]
struct ProjectPaths {
    project_root: PathBuf,
    manifest_path: PathBuf,
    state_dir: PathBuf,
    config_path: PathBuf,
    data_dir: PathBuf,
    db_path: PathBuf,
    i18n_dir: PathBuf,
}

impl ProjectPaths {
    fn resolve(runtime: &RuntimeOptions) -> Result<Self> {
        let project_root = match &runtime.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("failed to resolve working directory")?,
        };
        let state_dir = project_root.join(".wikibundle");
        let data_dir = state_dir.join("data");
        Ok(Self {
            manifest_path: project_root.join("modules.toml"),
            config_path: state_dir.join("config.toml"),
            db_path: data_dir.join("wikibundle.db"),
            i18n_dir: project_root.join("i18n"),
            project_root,
            state_dir,
            data_dir,
        })
    }
}

const DEFAULT_CONFIG: &str = "\
[bundle]
wiki_id = \"wikibundle\"
validate_scripts = true
debug = false
";

const DEFAULT_MANIFEST: &str = "\
# Module manifest. One [modules.\"name\"] table per module.
#
# [modules.\"site.styles\"]
# styles = [\"css/site.css\", { path = \"css/print.css\", media = \"print\" }]
";

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::List) => run_list(&runtime),
        Some(Commands::Build(args)) => run_build(&runtime, args),
        Some(Commands::Version(args)) => run_version(&runtime, args),
        Some(Commands::Deps(args)) => run_deps(&runtime, args),
        Some(Commands::Validate(args)) => run_validate(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = ProjectPaths::resolve(runtime)?;
    let mut created_dirs = 0usize;
    for dir in [
        &paths.project_root,
        &paths.state_dir,
        &paths.data_dir,
        &paths.i18n_dir,
    ] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs += 1;
        }
    }

    let wrote_config = write_if_absent(&paths.config_path, DEFAULT_CONFIG, args.force)?;
    let wrote_manifest = write_if_absent(&paths.manifest_path, DEFAULT_MANIFEST, args.force)?;

    println!("Initialized wikibundle project layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("manifest: {}", normalize_path(&paths.manifest_path));
    println!("config: {}", normalize_path(&paths.config_path));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("i18n_dir: {}", normalize_path(&paths.i18n_dir));
    println!("created_dirs: {created_dirs}");
    println!("wrote_config: {wrote_config}");
    println!("wrote_manifest: {wrote_manifest}");
    Ok(())
}

fn run_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = ProjectPaths::resolve(runtime)?;
    let manifest = load_manifest(&paths)?;

    println!("modules: {}", manifest.modules.len());
    for (name, definition) in &manifest.modules {
        let origin = definition.origin.as_deref().unwrap_or("core-sitewide");
        let parts = [
            (!definition.scripts.is_empty()).then_some("scripts"),
            (!definition.styles.is_empty() || !definition.skin_styles.is_empty())
                .then_some("styles"),
            (!definition.messages.is_empty()).then_some("messages"),
            definition.templates_dir.is_some().then_some("templates"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        let parts = if parts.is_empty() {
            "<empty>".to_string()
        } else {
            parts.join(",")
        };
        println!("  {name} [{origin}] {parts}");
    }
    Ok(())
}

fn run_build(runtime: &RuntimeOptions, args: BuildArgs) -> Result<()> {
    let paths = ProjectPaths::resolve(runtime)?;
    let config = Arc::new(load_config(&paths.config_path)?);
    let context = request_context(runtime, &config)?;
    let mut registry = build_registry(&paths, config)?;

    let json_store;
    let messages: &dyn MessageBlobStore = if paths.i18n_dir.exists() {
        json_store = JsonMessageStore::new(&paths.i18n_dir);
        &json_store
    } else {
        &NullMessageStore
    };
    registry.preload_messages(&[args.module.as_str()], &context, messages)?;

    let Some(module) = registry.get_mut(&args.module) else {
        bail!("unknown module: {}", args.module);
    };
    let content = module.content(&context, messages)?;
    if args.compact {
        println!("{}", serde_json::to_string(content)?);
    } else {
        println!("{}", serde_json::to_string_pretty(content)?);
    }
    Ok(())
}

fn run_version(runtime: &RuntimeOptions, args: VersionArgs) -> Result<()> {
    let paths = ProjectPaths::resolve(runtime)?;
    let config = Arc::new(load_config(&paths.config_path)?);
    let context = request_context(runtime, &config)?;
    let mut registry = build_registry(&paths, config)?;

    let json_store;
    let messages: &dyn MessageBlobStore = if paths.i18n_dir.exists() {
        json_store = JsonMessageStore::new(&paths.i18n_dir);
        &json_store
    } else {
        &NullMessageStore
    };

    let names: Vec<String> = match args.module {
        Some(name) => vec![name],
        None => registry.names().iter().map(|name| name.to_string()).collect(),
    };
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    registry.preload_messages(&name_refs, &context, messages)?;

    for name in &names {
        let Some(module) = registry.get_mut(name) else {
            bail!("unknown module: {name}");
        };
        let hash = module.version_hash(&context, messages)?;
        if hash.is_empty() {
            println!("{name}: <debug, unversioned>");
        } else {
            println!("{name}: {hash}");
        }
    }
    Ok(())
}

fn run_deps(runtime: &RuntimeOptions, args: DepsArgs) -> Result<()> {
    let paths = ProjectPaths::resolve(runtime)?;
    let config = Arc::new(load_config(&paths.config_path)?);
    let context = request_context(runtime, &config)?;
    let mut registry = build_registry(&paths, config)?;
    let store = SqliteDependencyStore::open(&paths.db_path)?;

    let Some(module) = registry.get_mut(&args.module) else {
        bail!("unknown module: {}", args.module);
    };

    if args.refresh {
        let refs = module.source().indirect_dependencies(&context)?;
        let changed =
            module.save_file_dependencies(&context, &store, &paths.project_root, &refs)?;
        println!("refreshed: {}", if changed { "updated" } else { "unchanged" });
    }

    let tracked = module.file_dependencies(&context, &store)?;
    println!("module: {}", args.module);
    println!("variant: {}", context.vary());
    println!("dependencies: {}", tracked.len());
    for path in expand_paths(&paths.project_root, &tracked) {
        let marker = if path.exists() { "" } else { " (missing)" };
        println!("  {}{marker}", display_path(&path));
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let contents = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    match parse_script(&contents) {
        None => {
            println!("{}: ok", normalize_path(&args.file));
            Ok(())
        }
        Some(issue) => {
            println!(
                "{}: parse error on line {}: {}",
                normalize_path(&args.file),
                issue.line,
                issue.message
            );
            bail!("script failed validation");
        }
    }
}

fn build_registry(paths: &ProjectPaths, config: Arc<BundleConfig>) -> Result<Registry> {
    let manifest = load_manifest(paths)?;
    let validator = if config.validate_scripts() {
        let cache = SqliteObjectCache::open(&paths.db_path)?;
        Some(Arc::new(ScriptValidator::new(&config, Box::new(cache))))
    } else {
        None
    };
    Registry::from_manifest(manifest, &paths.project_root, config, validator)
}

fn load_manifest(paths: &ProjectPaths) -> Result<Manifest> {
    if !paths.manifest_path.exists() {
        bail!(
            "no module manifest at {} (run `wikibundle init` first)",
            normalize_path(&paths.manifest_path)
        );
    }
    Manifest::load(&paths.manifest_path)
}

fn request_context(runtime: &RuntimeOptions, config: &BundleConfig) -> Result<Context> {
    let language = runtime.lang.as_deref().unwrap_or("en");
    let skin = runtime.skin.as_deref().unwrap_or("vector");
    let mut context = Context::new(language, skin);
    if runtime.debug || config.debug_default() {
        context = context.with_debug(true);
    }
    if let Some(raw) = &runtime.only {
        let Some(only) = Only::parse(raw) else {
            bail!("--only must be `scripts` or `styles`, got `{raw}`");
        };
        context = context.with_only(Some(only));
    }
    Ok(context)
}

fn write_if_absent(path: &Path, contents: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
