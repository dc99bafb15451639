//! Walletflood crank
//!
//! Drives an EVM node with a growing pool of wallets: generates accounts,
//! funds them from one source key and keeps them transferring to each other
//! at a randomized rate until interrupted.
//!
//! One-shot subcommands cover generating, funding and blasting on their own,
//! plus reading back the SQLite dispatch journal.

mod config;
mod crank;
mod db;
mod sender;
mod wallet_store;

use clap::Parser;
use config::{Command, Config};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use walletflood::AmountRange;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Walletflood Crank");
    info!("RPC URL: {}", config.rpc_url);

    let command = match config.command.clone() {
        Some(command) => command,
        None => {
            warn!("No subcommand given, see --help");
            return Ok(());
        }
    };

    // Stats only reads the journal
    if let Command::Stats { since_secs } = command {
        let Some(db_path) = config.db_path.as_deref() else {
            error!("stats requires --db-path / DATABASE_PATH");
            return Err("missing database path".into());
        };
        crank::print_stats(db_path, since_secs).await?;
        return Ok(());
    }

    let crank = crank::Crank::new(config).await?;

    let result = match command {
        Command::Generate { count } => crank.generate(count).await.map(|_| ()),
        Command::Fund {
            min_amount,
            max_amount,
        } => {
            let range = AmountRange::new(
                config::parse_amount(&min_amount)?,
                config::parse_amount(&max_amount)?,
            );
            crank.fund(range).await.map(|report| {
                info!(
                    "✓ Funding complete: {} ok, {} failed, {} batch errors",
                    report.succeeded(),
                    report.failed(),
                    report.batch_errors.len()
                );
                for (index, reason) in &report.batch_errors {
                    warn!("  batch {}: {}", index, reason);
                }
            })
        }
        Command::Blast { count, amount } => {
            let value = config::parse_amount(&amount)?;
            crank.blast(count, value).await.map(|summary| {
                info!("✓ Blast complete");
                info!("  Sent:         {}", summary.requested);
                info!("  Succeeded:    {}", summary.succeeded);
                info!("  Failed:       {}", summary.failed);
                info!("  Batch errors: {}", summary.batch_errors);
                info!("  Elapsed:      {:.2}s", summary.elapsed.as_secs_f64());
                info!("  TPS:          {:.2}", summary.tps());
                info!("  Success rate: {:.1}%", summary.success_rate());
            })
        }
        Command::Run(args) => match crank.start_loop(&args).await {
            Ok(handle) => {
                let stop = handle.stop_signal();
                let watcher = tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown_signal() => {
                            info!("Shutdown requested, stopping funding loop...");
                            stop.stop();
                        }
                        _ = stop.stopped() => {}
                    }
                });

                let result = crank.finish_loop(handle).await.map(|_| ());
                watcher.abort();
                result
            }
            Err(e) => Err(e),
        },
        Command::Stats { .. } => Ok(()),
    };

    crank.shutdown().await;

    if let Err(e) = result {
        error!("✗ {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
