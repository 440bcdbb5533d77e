//! Manage paired servers: list, remove, set the sync directory, reset.

use anyhow::{bail, Context, Result};
use lanbackup_client::{DeviceRegistry, StorageError};
use std::path::{Path, PathBuf};

use crate::config::{parse_id, Settings};

/// Run the list command.
pub async fn list(settings: &Settings) -> Result<()> {
    let registry = settings.open_registry().await?;
    let servers = registry.paired_servers().await;

    if servers.is_empty() {
        println!("No paired servers.");
        println!();
        println!("Run 'lanbackup discover' and 'lanbackup pair <id>' to add one.");
        return Ok(());
    }

    println!("=== Paired servers ===");
    for server in &servers {
        println!("{}  {}", server.id, server.name);
        println!("  Address:   {}", server.socket_addr());
        match &server.sync_directory {
            Some(dir) => println!("  Directory: {}", dir.display()),
            None => println!("  Directory: (not set)"),
        }
        println!("  Files:     {} backed up", server.transferred.len());
        println!("  Paired:    {}", format_timestamp(server.paired_at));
    }

    Ok(())
}

/// Run the remove command.
pub async fn remove(settings: &Settings, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let registry = settings.open_registry().await?;

    if registry.remove(&id).await? {
        registry.save().await?;
        println!("Removed {}.", id);
    } else {
        println!("{} was not paired.", id);
    }
    Ok(())
}

/// Run the set-dir command. Without a path the directory is cleared.
pub async fn set_dir(settings: &Settings, id: &str, path: Option<&Path>) -> Result<()> {
    let id = parse_id(id)?;
    let registry = settings.open_registry().await?;

    let directory = match path {
        Some(path) => Some(absolute(path)?),
        None => None,
    };
    if let Some(dir) = &directory {
        if !dir.is_dir() {
            tracing::warn!("{} is not a directory yet", dir.display());
        }
    }

    registry
        .set_sync_directory(&id, directory.clone())
        .await
        .with_context(|| format!("Cannot set directory for {id}"))?;
    registry.save().await?;

    match directory {
        Some(dir) => println!("{} now backs up {}.", id, dir.display()),
        None => println!("{} no longer backs up anything.", id),
    }
    Ok(())
}

/// Run the reset command: forget every paired server, even when the
/// registry file is corrupt.
pub async fn reset(settings: &Settings, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("This forgets every paired server; run again with --yes to continue");
    }

    let registry = DeviceRegistry::new(settings.registry_path());
    match registry.load().await {
        Ok(count) => tracing::info!("Forgetting {} paired servers", count),
        Err(StorageError::Corrupt(reason)) => {
            tracing::warn!("Discarding corrupt registry: {}", reason)
        }
        Err(e) => return Err(e).context("Failed to read registry"),
    }
    registry.reset().await;
    registry.save().await?;

    println!("Registry reset. Pair again with 'lanbackup pair <id>'.");
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Cannot resolve current directory")?
            .join(path))
    }
}

/// Format a Unix timestamp as a human-readable string.
fn format_timestamp(ts: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let diff = now.saturating_sub(ts);

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanbackup_client::{Credential, PairedServer, ServiceId, ServiceRecord};
    use tempfile::tempdir;

    const ID: &str = "0102030405060708090a0b0c0d0e0f10";

    async fn settings_with_desk(dir: &Path) -> Settings {
        let settings = Settings::load(dir.to_path_buf(), None).unwrap();
        let registry = settings.open_registry().await.unwrap();
        let record = ServiceRecord::new(
            ID.parse::<ServiceId>().unwrap(),
            "10.0.0.5".parse().unwrap(),
            8080,
            "desk",
        );
        registry
            .insert(PairedServer::new(&record, Credential::from_bytes(vec![1; 49])))
            .await
            .unwrap();
        registry.save().await.unwrap();
        settings
    }

    #[tokio::test]
    async fn list_empty_registry() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(dir.path().to_path_buf(), None).unwrap();
        assert!(list(&settings).await.is_ok());
    }

    #[tokio::test]
    async fn list_with_server() {
        let dir = tempdir().unwrap();
        let settings = settings_with_desk(dir.path()).await;
        assert!(list(&settings).await.is_ok());
    }

    #[tokio::test]
    async fn set_dir_persists_and_clears() {
        let dir = tempdir().unwrap();
        let settings = settings_with_desk(dir.path()).await;
        let id: ServiceId = ID.parse().unwrap();

        set_dir(&settings, ID, Some(dir.path())).await.unwrap();
        let registry = settings.open_registry().await.unwrap();
        assert_eq!(
            registry.get(&id).await.unwrap().sync_directory.as_deref(),
            Some(dir.path())
        );

        set_dir(&settings, ID, None).await.unwrap();
        let registry = settings.open_registry().await.unwrap();
        assert!(registry.get(&id).await.unwrap().sync_directory.is_none());
    }

    #[tokio::test]
    async fn set_dir_for_unknown_server_fails() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(dir.path().to_path_buf(), None).unwrap();
        assert!(set_dir(&settings, ID, Some(dir.path())).await.is_err());
    }

    #[tokio::test]
    async fn remove_twice_is_fine() {
        let dir = tempdir().unwrap();
        let settings = settings_with_desk(dir.path()).await;

        remove(&settings, ID).await.unwrap();
        remove(&settings, ID).await.unwrap();

        let registry = settings.open_registry().await.unwrap();
        assert!(registry.paired_servers().await.is_empty());
    }

    #[tokio::test]
    async fn reset_recovers_from_corrupt_registry() {
        let dir = tempdir().unwrap();
        let settings = settings_with_desk(dir.path()).await;
        std::fs::write(settings.registry_path(), b"not a registry").unwrap();
        assert!(list(&settings).await.is_err());

        assert!(reset(&settings, false).await.is_err());
        reset(&settings, true).await.unwrap();

        let registry = settings.open_registry().await.unwrap();
        assert!(registry.paired_servers().await.is_empty());
        assert!(!registry.is_blocked().await);
    }

    #[test]
    fn format_timestamp_works() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        assert_eq!(format_timestamp(now), "just now");
        assert!(format_timestamp(now - 120).contains("minutes"));
        assert!(format_timestamp(now - 7200).contains("hours"));
        assert!(format_timestamp(now - 172800).contains("days"));
    }
}
