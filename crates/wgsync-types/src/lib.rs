// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! wgsync-types: Record definitions shared by the wgsync engine and CLI.
//!
//! These are the plain records persisted by the JSON store and fed to the
//! configuration renderers. Nothing in here performs I/O or validation.

#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The server's WireGuard key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKeypair {
    /// Base64 encoded private key.
    pub private_key: String,
    /// Base64 encoded public key.
    pub public_key: String,
    /// When the key pair was last rotated.
    pub updated_at: DateTime<Utc>,
}

/// The server's own interface: the networks it serves and how it listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInterface {
    /// Interface addresses in CIDR notation, in operator order.
    pub addresses: Vec<String>,
    /// UDP port the tunnel listens on.
    pub listen_port: u16,
    /// Shell command run after the interface comes up.
    #[serde(default)]
    pub post_up: String,
    /// Shell command run after the interface goes down.
    #[serde(default)]
    pub post_down: String,
    /// Last time the interface settings changed.
    pub updated_at: DateTime<Utc>,
}

/// Everything the renderers need to know about the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Key material.
    pub keypair: ServerKeypair,
    /// Interface settings.
    pub interface: ServerInterface,
}

/// Settings that apply to every peer and to the generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSetting {
    /// Public endpoint, either `host` or `host:port`.
    pub endpoint_address: String,
    /// DNS servers handed to peers that use the server's DNS.
    pub dns_servers: Vec<String>,
    /// Tunnel MTU; 0 leaves it unset.
    pub mtu: u32,
    /// Persistent keepalive in seconds; 0 leaves it unset.
    pub persistent_keepalive: u32,
    /// Firewall mark for outgoing packets; empty leaves it unset.
    #[serde(default)]
    pub firewall_mark: String,
    /// Routing table for wg-quick; empty leaves it unset.
    #[serde(default)]
    pub table: String,
    /// Where the generated server configuration is written.
    pub config_file_path: String,
    /// Last time the settings changed.
    pub updated_at: DateTime<Utc>,
}

/// A WireGuard peer managed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Opaque unique identifier.
    pub id: String,
    /// Base64 private key; empty when the peer manages its own key.
    #[serde(default)]
    pub private_key: String,
    /// Base64 public key.
    pub public_key: String,
    /// Base64 preshared key; empty when none is used.
    #[serde(default)]
    pub preshared_key: String,
    /// Human-readable name (e.g. "Dad's laptop").
    pub name: String,
    /// Contact email.
    #[serde(default)]
    pub email: String,
    /// Single-host addresses assigned to the peer (`/32` or `/128`).
    pub allocated_ips: Vec<String>,
    /// Networks the peer routes through the tunnel.
    pub allowed_ips: Vec<String>,
    /// Extra networks the server routes to this peer.
    #[serde(default)]
    pub extra_allowed_ips: Vec<String>,
    /// Whether the peer is handed the server's DNS servers.
    pub use_server_dns: bool,
    /// Disabled peers are left out of the server configuration.
    pub enabled: bool,
    /// Free-form notes, possibly spanning several lines.
    #[serde(default)]
    pub additional_notes: String,
    /// When the peer was created.
    pub created_at: DateTime<Utc>,
    /// Last time the peer changed.
    pub updated_at: DateTime<Utc>,
}

/// An operator account. Only passed through to configuration templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name.
    pub username: String,
    /// Whether the account has administrative rights.
    #[serde(default)]
    pub admin: bool,
}

/// Digests of the store taken when the configuration was last applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientServerHashes {
    /// Digest over every client record.
    pub client: String,
    /// Digest over the server and settings records.
    pub server: String,
}

impl ClientServerHashes {
    /// Placeholder stored before the first apply; never equal to a real digest.
    pub fn unset() -> Self {
        Self {
            client: "none".to_string(),
            server: "none".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn sample_client() -> Client {
        Client {
            id: "c1".to_string(),
            private_key: String::new(),
            public_key: "test-key".to_string(),
            preshared_key: String::new(),
            name: "dads-laptop".to_string(),
            email: String::new(),
            allocated_ips: vec!["10.0.0.2/32".to_string()],
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            extra_allowed_ips: vec![],
            use_server_dns: true,
            enabled: true,
            additional_notes: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn client_serializes() {
        let json = serde_json::to_string(&sample_client()).unwrap();
        assert!(json.contains("dads-laptop"));
        assert!(json.contains("\"allocated_ips\":[\"10.0.0.2/32\"]"));
    }

    #[test]
    fn client_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "c1",
            "public_key": "pk",
            "name": "n",
            "allocated_ips": ["10.0.0.2/32"],
            "allowed_ips": [],
            "use_server_dns": false,
            "enabled": true,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }"#;
        let client: Client = serde_json::from_str(json).unwrap();
        assert!(client.private_key.is_empty());
        assert!(client.extra_allowed_ips.is_empty());
        assert!(client.additional_notes.is_empty());
    }

    #[test_case("" ; "firewall mark absent")]
    #[test_case("0xca6c" ; "firewall mark present")]
    fn settings_round_trip(mark: &str) {
        let settings = GlobalSetting {
            endpoint_address: "vpn.example.com:51820".to_string(),
            dns_servers: vec!["1.1.1.1".to_string()],
            mtu: 1450,
            persistent_keepalive: 15,
            firewall_mark: mark.to_string(),
            table: "auto".to_string(),
            config_file_path: "/etc/wireguard/wg0.conf".to_string(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: GlobalSetting = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn unset_hashes_are_placeholders() {
        let hashes = ClientServerHashes::unset();
        assert_eq!(hashes.client, "none");
        assert_eq!(hashes.server, "none");
    }
}
