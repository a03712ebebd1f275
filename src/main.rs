use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kumo::config::Config;
use kumo::engine::Controller;
use kumo::models::Task;
use kumo::registry::Registry;
use kumo::server::Server;

#[derive(Parser)]
#[command(
    name = "kumo",
    version,
    about = "Web-crawl execution engine with pluggable spiders, middleware and pipelines",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full crawl for a spider
    Start {
        /// Spider name
        spider: String,
    },

    /// Process a single URL synchronously and print the extracted items
    Process {
        /// Spider name
        spider: String,

        /// URL to process
        url: String,
    },

    /// Run the HTTP facade exposing /process/?name=&url=
    Server {
        /// Bind address, overriding the configured one
        #[arg(short, long)]
        address: Option<String>,
    },

    /// List registered spiders
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env();
    config.validate()?;

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = Arc::new(config);
    let registry = Arc::new(Registry::with_defaults());

    match cli.command {
        Commands::Start { spider } => {
            tracing::info!(spider = %spider, "starting crawl");
            let controller = Arc::new(Controller::new(
                registry.spider(&spider)?,
                Arc::clone(&config),
                &registry,
            )?);
            controller.start().await?;
        }

        Commands::Process { spider, url } => {
            let controller = Arc::new(Controller::new(
                registry.spider(&spider)?,
                Arc::clone(&config),
                &registry,
            )?);
            controller.manager().storage().initialise().await?;
            let result = controller.process(Task::new(&url)).await?;
            let items: Vec<serde_json::Value> = result
                .items
                .iter()
                .map(|item| serde_json::Value::Object(item.to_map()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
            controller.finalise().await?;
        }

        Commands::Server { address } => {
            let address = address.unwrap_or_else(|| config.server.address.clone());
            Server::new(&address, Arc::clone(&config), Arc::clone(&registry))
                .start()
                .await?;
        }

        Commands::List => {
            for name in registry.spider_names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("kumo=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("kumo=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
