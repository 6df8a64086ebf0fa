// SPDX-License-Identifier: MIT OR Apache-2.0
//! `rebus-master`: run the coordinator with a chosen storage backend and
//! the TCP broker for out-of-process agents.
//!
//! Shutdown is two-phase: the first SIGINT broadcasts `bus_exit` and
//! waits for agents to persist state and unregister; a second SIGINT (or
//! SIGTERM) stops immediately.

#![deny(unsafe_code)]

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rebus_master::MasterHandle;
use rebus_storage::{DiskStorage, RamStorage, Storage};
use rebus_transport::BrokerServer;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    /// Everything in memory; gone when the master exits.
    Ramstorage,
    /// Descriptors on disk with a sqlite metadata index.
    Diskstorage,
}

#[derive(Parser, Debug)]
#[command(name = "rebus-master", version, about = "REbus master coordinator")]
struct Cli {
    /// Storage backend.
    #[arg(long, value_enum, default_value_t = StorageKind::Ramstorage)]
    storage: StorageKind,

    /// Disk storage path (diskstorage only).
    #[arg(long, default_value = "/tmp/rebus")]
    path: PathBuf,

    /// Address the broker listens on for agent connections.
    #[arg(long, default_value = "127.0.0.1:6768")]
    listen: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let storage: Box<dyn Storage> = match cli.storage {
        StorageKind::Ramstorage => Box::new(RamStorage::new()),
        StorageKind::Diskstorage => Box::new(
            DiskStorage::open(&cli.path)
                .with_context(|| format!("opening disk storage at {}", cli.path.display()))?,
        ),
    };
    info!("starting master with {:?} storage", cli.storage);

    let (master, mut master_task) = rebus_master::spawn(storage);
    let _broker = BrokerServer::bind(&cli.listen, master.clone())
        .await
        .with_context(|| format!("binding broker on {}", cli.listen))?;

    run_until_shutdown(master, &mut master_task).await;
    Ok(())
}

/// Drive the signal protocol until the master loop ends.
async fn run_until_shutdown(master: MasterHandle, master_task: &mut tokio::task::JoinHandle<()>) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("installing the SIGTERM handler");
    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    info!("SIGINT: asking agents to exit (press again to force)");
                    master.shutdown(false);
                } else {
                    info!("second SIGINT: exiting now");
                    master.shutdown(true);
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: exiting now");
                master.shutdown(true);
            }
            result = &mut *master_task => {
                if let Err(err) = result {
                    tracing::error!("master task ended abnormally: {err}");
                }
                return;
            }
        }
    }
}
