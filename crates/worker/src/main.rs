// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! The worker binary: reads a `WorkerConfig` from a TOML file, then repeatedly claims an
//! operation from the queue, materializes its input tree, runs its command, and reports the
//! result, backing off briefly whenever the queue has nothing for it.
//!
//! The operation queue and remote CAS this binary talks to are wired up here as in-memory
//! stand-ins (`rpc_client::StubQueue` / `rpc_client::StubCas`); a real deployment swaps in
//! whatever concrete `OperationQueue` / `RemoteCas` implementation speaks to its actual backend,
//! since both are plain `async_trait`s.

mod config;
mod coordinator;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cas_cache::Cache;
use clap::Parser;
use executor::OutputPolicy;
use rpc_client::{StubCas, StubQueue};

use config::WorkerConfig;
use coordinator::Coordinator;

#[derive(Parser)]
#[command(name = "worker", about = "Claims and runs remote-execution actions")]
struct Cli {
    /// Path to a TOML worker configuration file.
    config_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(&cli.config_path)
        .with_context(|| format!("loading config from {}", cli.config_path.display()))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let runtime = task_executor::Executor::new_owned("worker", None)
        .map_err(anyhow::Error::msg)
        .context("starting the worker's tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let remote_cas = Arc::new(StubCas::new());
    let queue = Arc::new(StubQueue::new());

    let cache = Cache::new(config.cache_dir.clone(), config.max_cache_bytes as usize, remote_cas.clone());
    let output_policy = OutputPolicy {
        stdout: config.stdout.clone().into(),
        stderr: config.stderr.clone().into(),
        output_files: config.output_files.clone().into(),
    };
    let coordinator = Coordinator::new(
        queue,
        remote_cas,
        cache,
        config.exec_root.clone(),
        output_policy,
        Duration::from_millis(config.liveness_poll_interval_ms),
    );

    log::info!("worker starting up, watching for operations");
    loop {
        match coordinator.run_once().await {
            Ok(true) => continue,
            Ok(false) => tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await,
            Err(error) => {
                log::error!("error while processing an operation: {error}");
                tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
            }
        }
    }
}
