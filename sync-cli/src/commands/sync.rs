//! Push pending files to every paired server.

use anyhow::{bail, Result};
use lanbackup_client::{ChunkedTransfer, SyncDispatcher, SyncReport, Transport};
use std::sync::Arc;

use crate::config::Settings;

/// Run one dispatch pass with `transport`.
pub async fn dispatch<T: Transport>(settings: &Settings, transport: T) -> Result<SyncReport> {
    let registry = settings.open_registry().await?;
    let dispatcher = SyncDispatcher::new(transport, settings.scheme(), &settings.client.device.name)
        .with_strategy(Arc::new(ChunkedTransfer::new(settings.client.sync.chunk_size)))
        .with_io_timeout(settings.client.sync.io_timeout());

    Ok(dispatcher.process_sending_files(&registry).await)
}

/// Run the sync command.
pub async fn run(settings: &Settings) -> Result<()> {
    let report = dispatch(settings, settings.transport()).await?;
    println!("{}", report.summary());

    if report.has_failures() {
        bail!("Some servers could not be synced");
    }
    Ok(())
}
