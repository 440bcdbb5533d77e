//! Configuration management for the lanbackup CLI.

use anyhow::{Context, Result};
use lanbackup_client::{
    ClientConfig, CredentialScheme, DeviceRegistry, HkdfCredentialScheme, ServiceId,
    ServiceRecord, TcpTransport, TcpTransportConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config file looked up in the data directory when `--config` is absent.
pub const CONFIG_FILE: &str = "lanbackup.toml";

/// Everything a command needs: where data lives and the client configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the registry and the default config file.
    pub data_dir: PathBuf,
    /// Parsed client configuration.
    pub client: ClientConfig,
}

impl Settings {
    /// Load settings.
    ///
    /// An explicit `config` path must exist. Without one, `lanbackup.toml` in
    /// the data directory is used if present, defaults otherwise.
    pub fn load(data_dir: PathBuf, config: Option<&Path>) -> Result<Self> {
        let client = match config {
            Some(path) => ClientConfig::from_file(path)?,
            None => {
                let default = data_dir.join(CONFIG_FILE);
                if default.exists() {
                    ClientConfig::from_file(&default)?
                } else {
                    ClientConfig::default()
                }
            }
        };
        Ok(Self { data_dir, client })
    }

    /// Registry file, resolved against the data directory.
    pub fn registry_path(&self) -> PathBuf {
        let file = &self.client.storage.registry_file;
        if file.is_absolute() {
            file.clone()
        } else {
            self.data_dir.join(file)
        }
    }

    /// Open the paired-server registry.
    pub async fn open_registry(&self) -> Result<DeviceRegistry> {
        let path = self.registry_path();
        DeviceRegistry::open(&path)
            .await
            .with_context(|| format!("Failed to open registry {}", path.display()))
    }

    /// Credential scheme used for pairing and sessions.
    pub fn scheme(&self) -> Arc<dyn CredentialScheme> {
        Arc::new(HkdfCredentialScheme)
    }

    /// TCP transport honouring the configured timeouts.
    pub fn transport(&self) -> TcpTransport {
        let timeout = self.client.sync.io_timeout();
        TcpTransport::with_config(TcpTransportConfig {
            connect_timeout: timeout,
            operation_timeout: timeout,
        })
    }

    /// Manually configured server with this id.
    pub fn manual_server(&self, id: &ServiceId) -> Option<ServiceRecord> {
        self.client
            .manual_records()
            .into_iter()
            .find(|record| &record.id == id)
    }
}

/// Parse a service id given on the command line.
pub fn parse_id(text: &str) -> Result<ServiceId> {
    text.parse()
        .with_context(|| format!("'{text}' is not a server id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().to_path_buf(), None).unwrap();

        assert_eq!(settings.client.device.name, "lanbackup client");
        assert_eq!(
            settings.registry_path(),
            dir.path().join("paired_servers.bin")
        );
    }

    #[test]
    fn config_in_data_dir_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[device]\nname = \"pixel\"\n[storage]\nregistry_file = \"servers.bin\"\n",
        )
        .unwrap();

        let settings = Settings::load(dir.path().to_path_buf(), None).unwrap();

        assert_eq!(settings.client.device.name, "pixel");
        assert_eq!(settings.registry_path(), dir.path().join("servers.bin"));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::load(dir.path().to_path_buf(), Some(&dir.path().join("nope.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn manual_server_lookup_by_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[[servers]]\nid = \"0102030405060708090a0b0c0d0e0f10\"\naddress = \"10.0.0.5\"\nport = 8080\n",
        )
        .unwrap();
        let settings = Settings::load(dir.path().to_path_buf(), None).unwrap();

        let id = parse_id("0102030405060708090a0b0c0d0e0f10").unwrap();
        let record = settings.manual_server(&id).unwrap();
        assert_eq!(record.port, 8080);
        assert!(settings.manual_server(&parse_id(&"ff".repeat(16)).unwrap()).is_none());
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id("desk").is_err());
    }
}
