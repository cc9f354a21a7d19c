// SPDX-License-Identifier: GPL-3.0-only

//! storage-partitiond - tracks the root and home filesystems and removable
//! devices, reconciling UDisks2 with the kernel mount table.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use storage_partitions::{Controller, PartitionEvent, PartitionModel, StorageHandle};
use storage_sys::{ProcMountTable, SyscallProbe};
use storage_types::{PartitionFilter, PartitionRecord, PartitionStatus, signed_bytes_to_pretty};
use storage_udisks::{ServiceConnection, ServiceSignalStream, StorageBackend, UDisksBackend};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod config;
mod logging;

use config::{DEFAULT_CONFIG_PATH, ServiceConfig};

/// How long `list` waits for capacity probes of mounted partitions
const PROBE_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "storage-partitiond")]
#[command(about = "Tracks internal and removable partitions", long_about = None)]
struct Cli {
    /// Configuration file [default: /etc/storage-partitiond.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run until interrupted, logging partition changes (default)
    Run,
    /// Print the partitions once removable devices are enumerated
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, explicit) = match cli.config {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let config = ServiceConfig::load(&config_path, explicit).context("loading configuration")?;
    logging::init(&config);

    info!("Starting storage-partitiond v{}", env!("CARGO_PKG_VERSION"));

    let (backend, signals) = connect().await;
    let (controller, handle) = Controller::new(
        &config.manager_config(),
        Arc::new(ProcMountTable::new(&config.mount_table)),
        Arc::new(SyscallProbe),
        backend,
        signals,
    );
    let controller = tokio::spawn(controller.run());

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&handle).await,
        Commands::List { json } => list(&handle, json).await,
    };

    drop(handle);
    controller.await.context("partition controller panicked")?;
    result
}

/// Reach UDisks2. Without it the daemon still serves internal partitions.
async fn connect() -> (Option<Arc<dyn StorageBackend>>, Option<ServiceSignalStream>) {
    let service = match ServiceConnection::system().await {
        Ok(service) => service,
        Err(e) => {
            warn!("{e}; only internal partitions are available");
            return (None, None);
        }
    };

    // Subscribe before the controller enumerates.
    let signals = match service.signals().await {
        Ok(signals) => Some(signals),
        Err(e) => {
            warn!("Failed to subscribe to storage service signals: {e}");
            None
        }
    };

    let backend: Arc<dyn StorageBackend> = Arc::new(UDisksBackend::new(service));
    (Some(backend), signals)
}

async fn run(handle: &StorageHandle) -> Result<()> {
    let mut events = handle.subscribe();
    let mut model = PartitionModel::new(PartitionFilter::any());
    model.reset(handle.partitions(PartitionFilter::any()).await?);

    for partition in model.rows() {
        info!("Tracking {}", describe(&partition.snapshot()));
    }
    info!(
        "Filesystems available for formatting: {}",
        PartitionModel::supported_format_types().join(", ")
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&mut model, &event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Fell behind on partition events, reloading");
                    model.reset(handle.partitions(PartitionFilter::any()).await?);
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

fn log_event(model: &mut PartitionModel, event: &PartitionEvent) {
    let change = model.apply(event);
    match event {
        PartitionEvent::Added(partition) => {
            info!(?change, "Added {}", describe(&partition.snapshot()));
        }
        PartitionEvent::Removed { snapshot, .. } => {
            info!(?change, "Removed {}", describe(snapshot));
        }
        PartitionEvent::Changed(partition) => {
            debug!(?change, "Changed {}", describe(&partition.snapshot()));
        }
        PartitionEvent::ExternalsPopulated => {
            info!(partitions = model.len(), "Removable devices enumerated");
        }
    }
}

async fn list(handle: &StorageHandle, json: bool) -> Result<()> {
    handle.wait_populated().await?;
    let partitions = handle.partitions(PartitionFilter::any()).await?;

    let deadline = Instant::now() + PROBE_GRACE;
    while Instant::now() < deadline
        && partitions
            .iter()
            .any(|p| p.status() == PartitionStatus::Mounted && p.bytes_total() < 0)
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let records: Vec<PartitionRecord> = partitions.iter().map(|p| p.snapshot()).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<18} {:<11} {:<28} {:<7} {:>12} {:>12}",
        "TYPE", "DEVICE", "STATUS", "MOUNTED ON", "FS", "AVAILABLE", "TOTAL"
    );
    for record in &records {
        println!(
            "{:<10} {:<18} {:<11} {:<28} {:<7} {:>12} {:>12}",
            format!("{:?}", record.storage_type).to_lowercase(),
            record.device_path,
            format!("{:?}", record.status).to_lowercase(),
            record.mount_path,
            record.filesystem_type,
            signed_bytes_to_pretty(record.bytes_available),
            signed_bytes_to_pretty(record.bytes_total),
        );
    }
    Ok(())
}

fn describe(record: &PartitionRecord) -> String {
    let name = if record.device_path.is_empty() {
        record.mount_path.as_str()
    } else {
        record.device_path.as_str()
    };
    let mut text = format!("{name} ({:?}, {:?})", record.storage_type, record.status);
    if !record.mount_path.is_empty() && record.status == PartitionStatus::Mounted {
        text.push_str(&format!(
            " on {} [{}] {} free of {}",
            record.mount_path,
            record.filesystem_type,
            signed_bytes_to_pretty(record.bytes_available),
            signed_bytes_to_pretty(record.bytes_total)
        ));
    }
    text
}
