//! `cairn`: apply and inspect SQL migrations against a SQLite database.
//!
//! # Commands
//!
//! - `migrate` - Apply pending migrations
//! - `status` - Show each migration file against the ledger
//! - `applied` - List applied migrations
//! - `health` - Ping the database and show pool occupancy

use std::process::ExitCode;
use std::time::Duration;

use cairn_cli::config::{self, Config};
use cairn_cli::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// SQL migration runner.
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(global = true, short, long, env = "CAIRN_CONFIG_PATH", default_value = "cairn.toml")]
    config: String,

    /// Database file, overriding the config
    #[arg(global = true, short, long)]
    database: Option<String>,

    /// Migrations directory, overriding the config
    #[arg(global = true, long)]
    dir: Option<String>,

    /// Abandon the command after this many seconds
    #[arg(global = true, long)]
    timeout_secs: Option<u64>,

    /// Print JSON instead of text
    #[arg(global = true, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Migrate,
    /// Show each migration file against the ledger
    Status,
    /// List applied migrations
    Applied,
    /// Ping the database and show pool occupancy
    Health,
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = config::load_config(Some(cli.config.as_str()))?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    if let Some(dir) = cli.dir {
        config.database.migrations_dir = dir;
    }

    init_tracing(&config);
    tracing::debug!(
        config = %cli.config,
        database = %config.database.path,
        migrations = %config.database.migrations_dir,
        "resolved configuration"
    );

    let ctx = Context::open(&config, cli.timeout_secs.map(Duration::from_secs), cli.json)?;

    let (ok, out) = match cli.command {
        Commands::Migrate => (true, cairn_cli::migrate(&ctx)?),
        Commands::Status => (true, cairn_cli::status(&ctx)?),
        Commands::Applied => (true, cairn_cli::applied(&ctx)?),
        Commands::Health => cairn_cli::health(&ctx)?,
    };
    println!("{out}");
    Ok(ok)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
