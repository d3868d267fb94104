use anyhow::Result;
use clap::{Parser, Subcommand};
use extension_runtime::{cli, RuntimeConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ext-runtime")]
#[command(author, version, about = "Extension runtime - load and manage sandboxed extensions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the extensions directory
    #[arg(long, global = true)]
    extensions_dir: Option<PathBuf>,

    /// Override the data directory (storage and secrets)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed extensions
    List,

    /// Show details of an installed extension
    Info {
        /// Extension id
        id: String,
    },

    /// Enable an installed extension
    Enable {
        /// Extension id
        id: String,
    },

    /// Disable an installed extension
    Disable {
        /// Extension id
        id: String,
    },

    /// Validate an extension manifest (file or directory)
    Validate {
        /// Path to extension.toml/extension.json or its directory
        path: PathBuf,
    },

    /// Load all enabled extensions and run until Ctrl-C
    Run {
        /// Exit right after loading
        #[arg(long)]
        once: bool,
    },

    /// Delete all secrets and storage of an extension
    SecretsPurge {
        /// Extension id
        id: String,
    },
}

fn load_config(args: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_from(path)?,
        None => RuntimeConfig::load()?,
    };
    if let Some(dir) = &args.extensions_dir {
        config.runtime.extensions_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.data_dir {
        config.runtime.data_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize logging
    let filter = if args.verbose {
        "extension_runtime=debug,ext_runtime=debug"
    } else {
        "extension_runtime=info,ext_runtime=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;

    match args.command {
        Commands::List => cli::run_list(&config)?,
        Commands::Info { id } => cli::run_info(&config, &id)?,
        Commands::Enable { id } => cli::run_enable(&config, &id)?,
        Commands::Disable { id } => cli::run_disable(&config, &id)?,
        Commands::Validate { path } => cli::run_validate(&path)?,
        Commands::Run { once } => {
            tracing::info!("Starting extension runtime");
            cli::run_extensions(config, once).await?;
        }
        Commands::SecretsPurge { id } => cli::run_secrets_purge(&config, &id)?,
    }

    Ok(())
}
