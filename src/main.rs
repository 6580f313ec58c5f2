use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "harbor")]
#[command(version, about = "Orchestrates coding-agent sessions in isolated sandboxes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding `.harbor/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the session server
    Serve {
        /// Port to serve on (overrides harbor.toml and HARBOR_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,

        /// Execution backends to enable; repeatable. Defaults to those
        /// enabled in harbor.toml.
        #[arg(long = "backend", value_enum)]
        backends: Vec<BackendChoice>,
    },
    /// Create `.harbor/harbor.toml` and the session database
    Init {
        /// Overwrite an existing harbor.toml
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    Docker,
    Kubernetes,
    /// In-process scripted sandboxes, for demos and UI work
    Mock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
            backends,
        } => {
            let logging = harbor::logging::LoggingConfig::from_env(cli.verbose);
            let _guard = harbor::logging::init(&logging)?;
            cmd::cmd_serve(
                &project_dir,
                cmd::ServeArgs {
                    port: *port,
                    host: host.clone(),
                    db_path: db_path.clone(),
                    dev: *dev,
                    backends: backends.clone(),
                },
            )
            .await?;
        }
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Config => cmd::cmd_config(&project_dir)?,
    }

    Ok(())
}
