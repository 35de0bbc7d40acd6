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

//! Operations over the record store.
//!
//! Every write that depends on the current allocation state runs under one
//! async mutex, so "read allocated set, validate, persist" cannot interleave
//! with another writer in the same process.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgsync_types::{Client, ClientServerHashes, GlobalSetting, ServerInterface, ServerKeypair};

use crate::addr;
use crate::allocation;
use crate::config::{ClientDefaults, Config};
use crate::drift;
use crate::error::{Error, Result};
use crate::keys;
use crate::peer_config;
use crate::server_config::{self, RenderError};
use crate::store::JsonStore;
use crate::subnet_range::SubnetRangeRegistry;

/// Preshared key value meaning "no preshared key".
pub const NO_PRESHARED_KEY: &str = "-";

/// Input for [`Manager::create_client`].
///
/// Unset optional fields fall back to the configured client defaults. An
/// empty `allocated_ips` picks one free address per candidate CIDR of
/// `subnet_range` (or of the server networks).
#[derive(Debug, Clone, Default)]
pub struct NewClient {
    pub name: String,
    pub email: String,
    pub allocated_ips: Vec<String>,
    pub subnet_range: Option<String>,
    pub allowed_ips: Option<Vec<String>>,
    pub extra_allowed_ips: Option<Vec<String>>,
    pub use_server_dns: Option<bool>,
    pub enabled: Option<bool>,
    /// Empty generates a keypair; otherwise the peer keeps its private key.
    pub public_key: String,
    /// Empty generates one, `"-"` means none.
    pub preshared_key: String,
    pub additional_notes: String,
}

/// Partial update for [`Manager::update_client`]. `None` keeps the field.
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub allocated_ips: Option<Vec<String>>,
    pub allowed_ips: Option<Vec<String>>,
    pub extra_allowed_ips: Option<Vec<String>>,
    pub use_server_dns: Option<bool>,
    pub enabled: Option<bool>,
    pub additional_notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceUpdate {
    pub addresses: Option<Vec<String>>,
    pub listen_port: Option<u16>,
    pub post_up: Option<String>,
    pub post_down: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub endpoint_address: Option<String>,
    pub dns_servers: Option<Vec<String>>,
    pub mtu: Option<u32>,
    pub persistent_keepalive: Option<u32>,
    pub firewall_mark: Option<String>,
    pub table: Option<String>,
    pub config_file_path: Option<String>,
}

pub struct Manager {
    store: JsonStore,
    ranges: SubnetRangeRegistry,
    template_path: Option<PathBuf>,
    client_defaults: ClientDefaults,
    write_lock: Mutex<()>,
}

impl Manager {
    pub fn new(
        store: JsonStore,
        ranges: SubnetRangeRegistry,
        template_path: Option<PathBuf>,
        client_defaults: ClientDefaults,
    ) -> Self {
        Self {
            store,
            ranges,
            template_path,
            client_defaults,
            write_lock: Mutex::new(()),
        }
    }

    /// Open and initialize the store, then load the subnet ranges and prune
    /// them against the server networks.
    #[tracing::instrument(skip_all, fields(db = %config.db_path.display()))]
    pub async fn bootstrap(config: &Config) -> Result<Self> {
        let store = JsonStore::open(&config.db_path);
        store
            .init(&config.server_interface(), &config.global_settings())
            .await?;

        let server = store.get_server().await?;
        let networks = allocation::server_networks(&server.interface)?;

        let mut ranges = SubnetRangeRegistry::parse(&config.subnet_ranges);
        ranges.prune(&networks);

        Ok(Self::new(
            store,
            ranges,
            config.template_path.clone(),
            config.client.clone(),
        ))
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    pub fn subnet_ranges(&self) -> &SubnetRangeRegistry {
        &self.ranges
    }

    pub fn template_path(&self) -> Option<&Path> {
        self.template_path.as_deref()
    }

    // -- Clients ------------------------------------------------------------

    pub async fn clients(&self) -> Result<Vec<Client>> {
        Ok(self.store.get_clients().await?)
    }

    pub async fn client(&self, id: &str) -> Result<Client> {
        Ok(self.store.get_client(id).await?)
    }

    #[tracing::instrument(skip_all, fields(name = %new.name))]
    pub async fn create_client(&self, new: NewClient) -> Result<Client> {
        let _guard = self.write_lock.lock().await;

        let name = required("client name", &new.name)?;
        let server = self.store.get_server().await?;
        let clients = self.store.get_clients().await?;
        let networks = allocation::server_networks(&server.interface)?;
        let allocated = allocation::currently_allocated(&server.interface, &clients, None)?;

        let proposed = if new.allocated_ips.is_empty() {
            let range = new.subnet_range.as_deref().unwrap_or_default();
            let suggested = self.ranges.suggest(range, &networks, &allocated)?;
            debug!(range, ?suggested, "picked addresses for new client");
            suggested.iter().map(ToString::to_string).collect()
        } else {
            new.allocated_ips
        };
        let allocated_ips = allocation::validate(&networks, &allocated, &proposed)?
            .iter()
            .map(ToString::to_string)
            .collect();

        let allowed_ips = checked_cidrs(
            "AllowedIPs",
            new.allowed_ips
                .unwrap_or_else(|| self.client_defaults.allowed_ips.clone()),
            false,
        )?;
        let extra_allowed_ips = checked_cidrs(
            "Extra AllowedIPs",
            new.extra_allowed_ips
                .unwrap_or_else(|| self.client_defaults.extra_allowed_ips.clone()),
            true,
        )?;

        let public_key = new.public_key.trim();
        let (private_key, public_key) = if public_key.is_empty() {
            let pair = keys::generate_keypair();
            (pair.private_key, pair.public_key)
        } else {
            keys::validate_key(public_key)?;
            if clients.iter().any(|c| c.public_key == public_key) {
                return Err(Error::DuplicatePublicKey(public_key.to_string()));
            }
            (String::new(), public_key.to_string())
        };

        let preshared_key = match new.preshared_key.trim() {
            "" => keys::generate_preshared_key(),
            NO_PRESHARED_KEY => String::new(),
            psk => {
                keys::validate_key(psk)?;
                psk.to_string()
            }
        };

        let now = Utc::now();
        let client = Client {
            id: Uuid::new_v4().to_string(),
            private_key,
            public_key,
            preshared_key,
            name,
            email: new.email.trim().to_string(),
            allocated_ips,
            allowed_ips,
            extra_allowed_ips,
            use_server_dns: new
                .use_server_dns
                .unwrap_or(self.client_defaults.use_server_dns),
            enabled: new.enabled.unwrap_or(self.client_defaults.enabled),
            additional_notes: new.additional_notes,
            created_at: now,
            updated_at: now,
        };

        self.store.save_client(&client).await?;
        info!(
            client_id = %client.id,
            allocated_ips = ?client.allocated_ips,
            "created client"
        );
        Ok(client)
    }

    #[tracing::instrument(skip(self, update))]
    pub async fn update_client(&self, id: &str, update: ClientUpdate) -> Result<Client> {
        let _guard = self.write_lock.lock().await;

        let server = self.store.get_server().await?;
        let clients = self.store.get_clients().await?;
        let mut client = clients
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::ClientNotFound(id.to_string()))?;

        let networks = allocation::server_networks(&server.interface)?;
        let allocated = allocation::currently_allocated(&server.interface, &clients, Some(id))?;

        let proposed = update.allocated_ips.unwrap_or(client.allocated_ips);
        client.allocated_ips = allocation::validate(&networks, &allocated, &proposed)?
            .iter()
            .map(ToString::to_string)
            .collect();

        if let Some(allowed) = update.allowed_ips {
            client.allowed_ips = checked_cidrs("AllowedIPs", allowed, false)?;
        }
        if let Some(extra) = update.extra_allowed_ips {
            client.extra_allowed_ips = checked_cidrs("Extra AllowedIPs", extra, true)?;
        }
        if let Some(name) = update.name {
            client.name = required("client name", &name)?;
        }
        if let Some(email) = update.email {
            client.email = email.trim().to_string();
        }
        if let Some(use_server_dns) = update.use_server_dns {
            client.use_server_dns = use_server_dns;
        }
        if let Some(enabled) = update.enabled {
            client.enabled = enabled;
        }
        if let Some(notes) = update.additional_notes {
            client.additional_notes = notes;
        }
        client.updated_at = Utc::now();

        self.store.save_client(&client).await?;
        info!(allocated_ips = ?client.allocated_ips, "updated client");
        Ok(client)
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_client_status(&self, id: &str, enabled: bool) -> Result<Client> {
        let _guard = self.write_lock.lock().await;

        let mut client = self.store.get_client(id).await?;
        client.enabled = enabled;
        client.updated_at = Utc::now();
        self.store.save_client(&client).await?;
        info!(name = %client.name, "changed client status");
        Ok(client)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_client(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.delete_client(id).await?;
        Ok(())
    }

    /// The client's own configuration file.
    pub async fn client_config(&self, id: &str) -> Result<String> {
        let client = self.store.get_client(id).await?;
        let server = self.store.get_server().await?;
        let settings = self.store.get_global_settings().await?;

        if settings.endpoint_address.is_empty() {
            warn!(client_id = id, "endpoint address is not set");
        }
        if client.private_key.is_empty() {
            debug!(client_id = id, "client manages its own private key");
        }
        Ok(peer_config::render(&client, &server, &settings))
    }

    /// Names of the subnet ranges the client's addresses fall in.
    pub fn client_subnet_ranges(&self, client: &Client) -> Vec<String> {
        self.ranges.ranges_for_client(client)
    }

    // -- Server -------------------------------------------------------------

    #[tracing::instrument(skip_all)]
    pub async fn update_server_interface(&self, update: InterfaceUpdate) -> Result<ServerInterface> {
        let _guard = self.write_lock.lock().await;

        let mut interface = self.store.get_server().await?.interface;
        if let Some(addresses) = update.addresses {
            let addresses = checked_cidrs("server address", addresses, false)?;
            if addresses.is_empty() {
                return Err(Error::Validation(
                    "server needs at least one address".into(),
                ));
            }
            interface.addresses = addresses;
        }
        if let Some(port) = update.listen_port {
            interface.listen_port = port;
        }
        if let Some(post_up) = update.post_up {
            interface.post_up = post_up;
        }
        if let Some(post_down) = update.post_down {
            interface.post_down = post_down;
        }
        interface.updated_at = Utc::now();

        self.store.save_server_interface(&interface).await?;
        self.ranges.clear_cache();
        info!(addresses = ?interface.addresses, listen_port = interface.listen_port, "updated server interface");
        Ok(interface)
    }

    /// Replace the server keypair. Every peer config handed out before
    /// needs to be reissued.
    #[tracing::instrument(skip_all)]
    pub async fn regenerate_server_keypair(&self) -> Result<ServerKeypair> {
        let _guard = self.write_lock.lock().await;

        let pair = keys::generate_keypair();
        let keypair = ServerKeypair {
            private_key: pair.private_key,
            public_key: pair.public_key,
            updated_at: Utc::now(),
        };
        self.store.save_server_keypair(&keypair).await?;
        info!(public_key = %keypair.public_key, "regenerated server keypair");
        Ok(keypair)
    }

    #[tracing::instrument(skip_all)]
    pub async fn update_global_settings(&self, update: SettingsUpdate) -> Result<GlobalSetting> {
        let _guard = self.write_lock.lock().await;

        let mut settings = self.store.get_global_settings().await?;
        if let Some(dns) = update.dns_servers {
            settings.dns_servers = checked_ips("DNS server", dns)?;
        }
        if let Some(endpoint) = update.endpoint_address {
            settings.endpoint_address = endpoint.trim().to_string();
        }
        if let Some(mtu) = update.mtu {
            settings.mtu = mtu;
        }
        if let Some(keepalive) = update.persistent_keepalive {
            settings.persistent_keepalive = keepalive;
        }
        if let Some(mark) = update.firewall_mark {
            settings.firewall_mark = mark.trim().to_string();
        }
        if let Some(table) = update.table {
            settings.table = table.trim().to_string();
        }
        if let Some(path) = update.config_file_path {
            settings.config_file_path = required("config file path", &path)?;
        }
        settings.updated_at = Utc::now();

        self.store.save_global_settings(&settings).await?;
        info!(path = %settings.config_file_path, "updated global settings");
        Ok(settings)
    }

    /// Free single-host CIDRs, one per candidate CIDR of `range` (or of
    /// the server networks when `range` is empty or unknown).
    pub async fn suggest_addresses(&self, range: &str) -> Result<Vec<String>> {
        let server = self.store.get_server().await?;
        let clients = self.store.get_clients().await?;
        let networks = allocation::server_networks(&server.interface)?;
        let allocated = allocation::currently_allocated(&server.interface, &clients, None)?;

        let suggested = self.ranges.suggest(range, &networks, &allocated)?;
        Ok(suggested.iter().map(ToString::to_string).collect())
    }

    // -- Apply --------------------------------------------------------------

    /// Write the server config and record its inputs as applied.
    #[tracing::instrument(skip_all)]
    pub async fn apply(&self) -> Result<ClientServerHashes> {
        let _guard = self.write_lock.lock().await;
        self.write_server_config().await?;
        Ok(drift::commit(&self.store).await?)
    }

    pub async fn has_changes(&self) -> Result<bool> {
        Ok(drift::changed(&self.store).await?)
    }

    /// Write the server config if the target file does not exist yet.
    /// Returns whether it was written.
    pub async fn ensure_server_config(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let settings = self.store.get_global_settings().await?;
        let path = Path::new(&settings.config_file_path);
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| RenderError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        if exists {
            debug!(path = %path.display(), "server config already present");
            return Ok(false);
        }
        self.write_server_config().await?;
        Ok(true)
    }

    async fn write_server_config(&self) -> Result<()> {
        let server = self.store.get_server().await?;
        let clients = self.store.get_clients().await?;
        let users = self.store.get_users().await?;
        let settings = self.store.get_global_settings().await?;

        server_config::write(
            self.template_path.as_deref(),
            &server,
            &clients,
            &users,
            &settings,
        )
        .await?;
        Ok(())
    }
}

// -- Input checks -------------------------------------------------------------

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

/// Trim every entry and require CIDR notation. Empty entries are dropped
/// when `allow_empty`, rejected otherwise.
fn checked_cidrs(field: &str, list: Vec<String>, allow_empty: bool) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(list.len());
    for entry in &list {
        let entry = entry.trim();
        if entry.is_empty() {
            if allow_empty {
                continue;
            }
            return Err(Error::Validation(format!("{field} must not contain empty entries")));
        }
        if addr::parse_cidr(entry).is_err() {
            return Err(Error::Validation(format!(
                "invalid {field} {entry:?}, must be in CIDR format"
            )));
        }
        out.push(entry.to_string());
    }
    Ok(out)
}

fn checked_ips(field: &str, list: Vec<String>) -> Result<Vec<String>> {
    list.iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpAddr>()
                .map(|_| entry.to_string())
                .map_err(|_| Error::Validation(format!("invalid {field} {entry:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test_case(&["10.0.0.0/24", " 0.0.0.0/0 "], false, Ok(2) ; "valid list")]
    #[test_case(&["10.0.0.0/24", ""], true, Ok(1) ; "empty dropped")]
    #[test_case(&["10.0.0.0/24", ""], false, Err(()) ; "empty rejected")]
    #[test_case(&["10.0.0.1"], false, Err(()) ; "bare address rejected")]
    fn cidr_lists(input: &[&str], allow_empty: bool, expected: std::result::Result<usize, ()>) {
        let result = checked_cidrs("AllowedIPs", strings(input), allow_empty);
        match expected {
            Ok(n) => assert_eq!(result.unwrap().len(), n),
            Err(()) => assert!(matches!(result, Err(Error::Validation(_)))),
        }
    }

    #[test]
    fn dns_entries_must_be_addresses() {
        assert_eq!(
            checked_ips("DNS server", strings(&["1.1.1.1", " ", "2606:4700::1111"])).unwrap(),
            strings(&["1.1.1.1", "2606:4700::1111"])
        );
        assert!(checked_ips("DNS server", strings(&["dns.example.com"])).is_err());
    }

    #[test]
    fn required_trims() {
        assert_eq!(required("name", "  laptop ").unwrap(), "laptop");
        assert!(required("name", "   ").is_err());
    }
}
