//! TaskPilot binary entry point

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskpilot::checkpoint::CheckpointStore;
use taskpilot::cli::{Cli, Command};
use taskpilot::config::Config;
use taskpilot::engine::Engine;
use taskpilot::events::LogSink;
use taskpilot::progress::{LogProgress, NullProgress, render_summary};
use taskpilot::store::TaskStore;
use taskpilot::tool::CliTool;

/// Exit code for invalid configuration
const EXIT_CONFIG: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        error!("{:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    match cli.command {
        None | Some(Command::Run { .. }) => run(config).await,
        Some(Command::Status) => status(config).await,
        Some(Command::Gc) => gc(config),
    }
}

async fn run(config: Config) -> ExitCode {
    // The credential is read once here and validated; the engine itself
    // never touches the environment again
    let tool = match CliTool::new(config.tool.command.clone(), &config.tool.api_key_env) {
        Ok(tool) => Arc::new(tool),
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let engine = Engine::new(config, tool, Arc::new(LogSink), Arc::new(LogProgress));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    match engine.run(cancel).await {
        Ok(report) => {
            print!("{}", render_summary(&report.tasks));
            ExitCode::from(report.outcome.exit_code() as u8)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn status(config: Config) -> ExitCode {
    let store = match TaskStore::open(&config.store.dir, Arc::new(NullProgress)) {
        Ok(store) => store,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match store.list_all().await {
        Ok(tasks) => {
            print!("{}", render_summary(&tasks));
            let _ = store.shutdown().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn gc(config: Config) -> ExitCode {
    let checkpoints = match CheckpointStore::open(&config.checkpoint.root) {
        Ok(store) => store,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match checkpoints.gc(config.checkpoint_max_age_ms()) {
        Ok(removed) => {
            println!("removed {} expired checkpoints", removed);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
