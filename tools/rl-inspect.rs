//! Inspect a startup manifest with the resource loader
//!
//! Resolves load orders, shows the batch requests a load would send and lists
//! the registry. With the `http` feature it can also fetch modules from a
//! live load endpoint and report the resulting states.
//!
//! Usage:
//!   rl-inspect --manifest startup.json resolve ext.popups
//!   rl-inspect --manifest startup.json batch ext.popups site

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::info;

use resource_loader::utils::{init_logging, init_logging_from_config};
use resource_loader::{
    Capabilities, HeadlessHost, LoaderConfig, ModuleLoader, RecordingTransport, StartupManifest,
};

#[derive(Parser, Debug)]
#[command(name = "rl-inspect")]
#[command(about = "Inspect module manifests, load orders and batch requests")]
#[command(version)]
struct Cli {
    /// Loader configuration (TOML, or JSON by extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Startup manifest JSON
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Capabilities that are present; manifest entries skipped on them load as ready
    #[arg(long = "capability", value_delimiter = ',')]
    capabilities: Vec<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the load order for modules
    Resolve {
        modules: Vec<String>,

        /// Drop unresolvable modules instead of failing
        #[arg(long)]
        stubborn: bool,
    },

    /// Print the batch requests loading these modules would send
    Batch { modules: Vec<String> },

    /// Print every registered module
    List,

    /// Load modules from a live endpoint and print their final states
    #[cfg(feature = "http")]
    Fetch {
        /// Base URL relative endpoints are joined onto
        #[arg(long)]
        base_url: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        modules: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<LoaderConfig> {
    match &cli.config {
        Some(path) => LoaderConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(LoaderConfig::default()),
    }
}

fn register(loader: &ModuleLoader, cli: &Cli) -> Result<()> {
    let Some(path) = &cli.manifest else {
        return Ok(());
    };
    let manifest = StartupManifest::from_file(path)?;
    let mut capabilities = Capabilities::new();
    for capability in &cli.capabilities {
        capabilities.set(capability.clone(), true);
    }
    loader.register_manifest(&manifest, &capabilities)?;
    info!(
        "Registered {} modules from {}",
        manifest.modules.len(),
        path.display()
    );
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "http")]
async fn fetch(
    config: LoaderConfig,
    cli: &Cli,
    base_url: &str,
    timeout: u64,
    modules: &[String],
) -> Result<()> {
    use resource_loader::network::{drive, HttpTransport};
    use std::time::Duration;

    let (transport, mut responses) =
        HttpTransport::new(Some(base_url.to_string()), Duration::from_secs(timeout))?;
    let transport = Rc::new(transport);
    let loader = ModuleLoader::new(config, Rc::new(HeadlessHost::new()), transport.clone())?;
    register(&loader, cli)?;
    loader.load(modules);
    drive(&loader, &transport, &mut responses).await;

    let states: Vec<_> = modules
        .iter()
        .filter_map(|name| loader.inspect(name))
        .collect();
    print_json(&states)?;
    print_json(&loader.take_tracked_errors())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    if cli.verbose {
        init_logging(Some("debug"));
    } else {
        init_logging_from_config(config.logging.as_ref());
    }

    #[cfg(feature = "http")]
    if let Command::Fetch {
        base_url,
        timeout,
        modules,
    } = &cli.command
    {
        return fetch(config, &cli, base_url, *timeout, modules).await;
    }

    let transport = Rc::new(RecordingTransport::new());
    let loader = ModuleLoader::new(config, Rc::new(HeadlessHost::new()), transport.clone())?;
    register(&loader, &cli)?;

    match &cli.command {
        Command::Resolve { modules, stubborn } => {
            let order = if *stubborn {
                loader.resolve_stubbornly(modules)
            } else {
                loader.resolve(modules)?
            };
            print_json(&order)?;
        }
        Command::Batch { modules } => {
            loader.load(modules);
            print_json(&transport.take())?;
        }
        Command::List => {
            let modules: Vec<_> = loader
                .module_names()
                .iter()
                .filter_map(|name| loader.inspect(name))
                .collect();
            print_json(&modules)?;
        }
        #[cfg(feature = "http")]
        Command::Fetch { .. } => {}
    }
    Ok(())
}
