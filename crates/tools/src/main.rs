/*
 * 5D Labs Agent Platform - Task Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! CLI for Task workload utilities
//!
//! Run `task-tools --help` for usage information.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use task_tools::{context_init, git_init, outputs, url_fetch, ProcessEnv};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "task-tools")]
#[command(about = "Init container and sidecar utilities for Task workloads")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the workload to exit, then write output parameters to the termination message
    CollectOutputs {
        /// Seconds between workload liveness checks
        #[arg(long, default_value_t = 1)]
        poll_interval: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 86_400)]
        max_wait: u64,

        /// Termination message path
        #[arg(long, default_value = "/dev/termination-log")]
        output: PathBuf,
    },

    /// Copy context files from the mounted ConfigMap into the workspace
    ContextInit,

    /// Download a URL context (configured through URL_* variables)
    UrlFetch,

    /// Clone a Git context (configured through GIT_* variables)
    GitInit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::CollectOutputs {
            poll_interval,
            max_wait,
            output,
        } => {
            let config = outputs::CollectConfig::from_env(
                &ProcessEnv,
                output,
                Duration::from_secs(poll_interval.max(1)),
                Duration::from_secs(max_wait),
            )?;
            outputs::run(&config)
                .await
                .context("collect-outputs failed")?;
        }
        Commands::ContextInit => {
            let config = context_init::ContextInitConfig::from_env(&ProcessEnv)?;
            let summary = context_init::run(&config).context("context-init failed")?;
            info!(
                copied = summary.copied,
                failed = summary.failed,
                "Context initialization complete"
            );
        }
        Commands::UrlFetch => {
            let config = url_fetch::UrlFetchConfig::from_env(&ProcessEnv)?;
            url_fetch::run(&config).await.context("url-fetch failed")?;
        }
        Commands::GitInit => {
            let config = git_init::GitInitConfig::from_env(&ProcessEnv)?;
            git_init::run(&config).await.context("git-init failed")?;
        }
    }

    Ok(())
}
