//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Parallel task orchestrator driving an LLM CLI
#[derive(Debug, Parser)]
#[command(name = "tp", version, about)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the task store directory
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    /// Override the checkpoint root directory
    #[arg(long, global = true)]
    pub checkpoint_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the engine against the task store (default)
    Run {
        /// Override the pool size
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Print the task table without running anything
    Status,
    /// Garbage-collect expired checkpoints
    Gc,
}

impl Cli {
    /// Fold CLI overrides into a loaded configuration
    pub fn apply_overrides(&self, config: &mut crate::config::Config) {
        if let Some(dir) = &self.store_dir {
            config.store.dir = dir.clone();
        }
        if let Some(root) = &self.checkpoint_root {
            config.checkpoint.root = root.clone();
        }
        if let Some(Command::Run {
            max_workers: Some(workers),
        }) = &self.command
        {
            config.max_workers = *workers;
        }
    }
}
