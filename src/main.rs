//! CLI entry point for balancebot.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use balancebot::app::App;
use balancebot::config::Config;
use balancebot::error::Error;

#[derive(Parser)]
#[command(name = "balancebot")]
#[command(about = "Crypto portfolio auto-rebalancer for Binance spot")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to strategy.json
    #[arg(long, default_value = "strategy.json")]
    strategy: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop (tick + reconcile) until killed
    Run,

    /// Run a single auto-trade tick and exit
    Tick,

    /// Run a single order-reconciliation pass and exit
    Reconcile,

    /// Show the account-wide portfolio summary
    Summary,

    /// Compute the plan, confirm, and execute a manual rebalance
    Rebalance {
        /// Show plan without executing
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompt (for automation/cron)
        #[arg(long)]
        force: bool,
    },

    /// Check exchange connectivity and configuration
    Status,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(1);
        }
    };

    let app = match App::new(config, &cli.strategy) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error loading strategy: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Run => app.run_loop(),
        Command::Tick => app.tick_once().map(|summary| {
            println!("{summary}");
        }),
        Command::Reconcile => app.reconcile_once().map(|summary| {
            println!("{summary}");
        }),
        Command::Summary => app.show_summary(),
        Command::Rebalance { dry_run, force } => app.manual_rebalance(dry_run, force),
        Command::Status => app.show_status(),
    };

    if let Err(e) = result {
        match &e {
            Error::Aborted(msg) => {
                eprintln!("\nAborted: {msg}");
                process::exit(2);
            }
            _ => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        }
    }
}
