//! Discover backup servers.

use anyhow::Result;
use lanbackup_client::{DiscoveredService, DiscoveryService, StaticAnnouncements};
use std::sync::Arc;

use crate::config::Settings;

/// Run discovery for `cycles` cycles and return what was found.
pub async fn scan(settings: &Settings, cycles: u32) -> Result<Vec<DiscoveredService>> {
    let records = settings.client.manual_records();
    if records.is_empty() {
        tracing::warn!("No servers configured; add [[servers]] entries to the config file");
    }

    let discovery = DiscoveryService::with_offline_threshold(
        Arc::new(StaticAnnouncements::new(records)),
        settings.client.discovery.missed_cycles_before_offline,
    );
    let period = settings.client.discovery.period();

    discovery.start(period);
    // Let the first cycle land, then wait out the remaining ones
    tokio::time::sleep(period / 10).await;
    for _ in 1..cycles.max(1) {
        tokio::time::sleep(period).await;
    }
    let found = discovery.snapshot();
    discovery.stop(true).await;

    Ok(found)
}

/// Run the discover command.
pub async fn run(settings: &Settings, cycles: u32) -> Result<()> {
    let found = scan(settings, cycles).await?;
    let registry = settings.open_registry().await?;

    if found.is_empty() {
        println!("No servers found.");
        return Ok(());
    }

    println!("=== Discovered servers ===");
    for service in &found {
        let paired = if registry.is_paired(&service.record.id).await {
            "paired"
        } else {
            "not paired"
        };
        println!(
            "  {}  {:<16} {:<22} {:<8} {}",
            service.record.id,
            service.record.name,
            service.record.socket_addr(),
            if service.online { "online" } else { "offline" },
            paired
        );
    }

    Ok(())
}
