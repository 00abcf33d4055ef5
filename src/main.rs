use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use outdial::config::Config;
use outdial::engine::server;

#[derive(Parser)]
#[command(name = "outdial")]
#[command(version, about = "Outbound call campaign orchestration engine")]
struct Cli {
    /// Verbose logging (debug level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the campaign engine server
    Serve {
        /// Port to listen on (overrides config file and environment)
        #[arg(short, long)]
        port: Option<u16>,

        /// Dev mode: bind all interfaces, permissive CORS, simulated
        /// telephony provider
        #[arg(long)]
        dev: bool,
    },
    /// Print the effective configuration after file and environment layering
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("outdial={}", default_level))),
        )
        .init();

    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    let mut config = Config::load(&cwd)?;

    match cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            server::start_server(config, dev).await
        }
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}
