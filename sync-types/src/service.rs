//! Discovered service records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::ServiceId;

/// One announcement of a backup server on the local network.
///
/// Two records describe the same server iff their `id` matches; the
/// address and port are allowed to change between announcements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Stable server identifier.
    pub id: ServiceId,
    /// Address the server was last announced at.
    pub address: IpAddr,
    /// Port the server listens on.
    pub port: u16,
    /// Human-readable server name.
    pub name: String,
}

impl ServiceRecord {
    /// Create a new record.
    pub fn new(id: ServiceId, address: IpAddr, port: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            address,
            port,
            name: name.into(),
        }
    }

    /// Socket address to connect to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.name, self.id, self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_combines_address_and_port() {
        let record = ServiceRecord::new(
            ServiceId::random(),
            "10.0.0.5".parse().unwrap(),
            8080,
            "desk",
        );
        assert_eq!(record.socket_addr().to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn display_includes_name_and_address() {
        let record = ServiceRecord::new(
            ServiceId::from_bytes([0xAA; 16]),
            "192.168.1.20".parse().unwrap(),
            5354,
            "nas",
        );
        let shown = record.to_string();
        assert!(shown.starts_with("nas ("));
        assert!(shown.ends_with("192.168.1.20:5354"));
    }
}
