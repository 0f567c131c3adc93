//! CLI definitions for foundry
//!
//! This module contains all CLI argument parsing structures using clap.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "foundry",
    version,
    about = "Build and deployment control plane for service infrastructure",
    long_about = "Runs the build lifecycle core: validation, queueing, detection,\ncached reproducible builds, closure pushes, and deployment sync."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane worker pool
    Serve {
        /// Path to the control plane config file
        #[arg(long, env = "FOUNDRY_CONFIG")]
        config: Option<String>,

        /// Worker pool size (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Submit the build jobs in this spec file at startup
        #[arg(long)]
        jobs: Option<String>,

        /// Exit once every submitted job reached a terminal status
        #[arg(long)]
        drain: bool,
    },

    /// Validate a build-job spec file without running anything
    Validate {
        /// Path to a job spec (YAML or JSON)
        file: String,

        /// Path to the control plane config file (for the strategy registry)
        #[arg(long, env = "FOUNDRY_CONFIG")]
        config: Option<String>,
    },

    /// Run detection on a local source tree
    Detect {
        /// Path to a checked-out source tree
        path: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}
