//! Pair with a backup server.

use anyhow::{bail, Context, Result};
use lanbackup_client::{DeviceRegistry, PairingSession, ServiceRecord, Transport};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::commands::discover;
use crate::config::{parse_id, Settings};

/// Run the pair command.
pub async fn run(settings: &Settings, id: &str, assume_yes: bool) -> Result<()> {
    let id = parse_id(id)?;
    let registry = settings.open_registry().await?;

    let service = match discover::scan(settings, 1)
        .await?
        .into_iter()
        .find(|s| s.record.id == id)
    {
        Some(found) => found.record,
        None => settings
            .manual_server(&id)
            .with_context(|| format!("Server {id} was not found"))?,
    };

    let mut input = BufReader::new(tokio::io::stdin());
    pair_with(
        settings,
        settings.transport(),
        &registry,
        service,
        assume_yes,
        &mut input,
    )
    .await
}

/// Pair with `service`, asking on `input` whether the codes match.
pub async fn pair_with<T, R>(
    settings: &Settings,
    transport: T,
    registry: &DeviceRegistry,
    service: ServiceRecord,
    assume_yes: bool,
    input: &mut R,
) -> Result<()>
where
    T: Transport + 'static,
    R: AsyncBufRead + Unpin,
{
    println!("Pairing with {}...", service);

    let session = PairingSession::new(transport, settings.scheme(), &settings.client.device.name)
        .with_timeout(settings.client.pairing.timeout());
    let code = session.pair_to_server(service.clone())?.wait().await?;

    println!();
    println!("  Verification code: {}", code);
    println!();

    let confirmed = if assume_yes {
        true
    } else {
        println!("Does {} show the same code? [y/N]", service.name);
        let mut answer = String::new();
        input
            .read_line(&mut answer)
            .await
            .context("Failed to read answer")?;
        matches!(answer.trim(), "y" | "Y" | "yes")
    };

    if !confirmed {
        session.reject()?;
        bail!("Pairing rejected: codes did not match");
    }

    let paired = session.add_as_paired(registry).await?;
    registry.save().await?;

    println!("Paired with {} ({}).", paired.name, paired.id);
    println!(
        "Run 'lanbackup set-dir {} <path>' to choose what to back up.",
        paired.id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanbackup_client::{MockTransport, ServiceId};

    #[tokio::test]
    async fn unknown_server_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::load(dir.path().to_path_buf(), None).unwrap();
        settings.client.discovery.period_ms = 20;

        let result = run(&settings, &"ab".repeat(16), true).await;

        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[tokio::test]
    async fn failed_exchange_leaves_registry_empty() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().to_path_buf(), None).unwrap();
        let registry = settings.open_registry().await.unwrap();
        let service = ServiceRecord::new(
            ServiceId::from_bytes([1; 16]),
            "10.0.0.5".parse().unwrap(),
            8080,
            "desk",
        );
        let transport = MockTransport::new();
        transport.set_unreachable("10.0.0.5:8080");
        let mut input: &[u8] = b"y\n";

        let result = pair_with(&settings, transport, &registry, service, false, &mut input).await;

        assert!(result.is_err());
        assert!(registry.paired_servers().await.is_empty());
        assert!(!settings.registry_path().exists());
    }
}
