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

use std::fmt;

use tracing::warn;
use wgsync_types::{Client, GlobalSetting, Server};

/// Client-side wg-quick configuration for one peer.
///
/// Rendering is a pure function of the three records, so the same inputs
/// always produce the same bytes.
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig<'a> {
    pub client: &'a Client,
    pub server: &'a Server,
    pub settings: &'a GlobalSetting,
}

impl<'a> PeerConfig<'a> {
    pub fn new(client: &'a Client, server: &'a Server, settings: &'a GlobalSetting) -> Self {
        Self {
            client,
            server,
            settings,
        }
    }
}

/// Convenience wrapper around [`PeerConfig`].
pub fn render(client: &Client, server: &Server, settings: &GlobalSetting) -> String {
    PeerConfig::new(client, server, settings).to_string()
}

/// Split the configured endpoint into host and port. An explicit `:port`
/// wins over the server's listen port; a port that does not parse is
/// ignored with a warning. IPv6 hosts take a port only in `[addr]:port`
/// form, so a bare IPv6 address is a host on its own.
pub fn resolve_endpoint(endpoint: &str, listen_port: u16) -> (&str, u16) {
    let (host, port) = if endpoint.starts_with('[') {
        match endpoint.split_once(']') {
            Some((addr, rest)) => (&endpoint[..=addr.len()], rest.strip_prefix(':')),
            None => (endpoint, None),
        }
    } else {
        match endpoint.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            _ => (endpoint, None),
        }
    };

    let Some(port) = port else {
        return (host, listen_port);
    };
    match port.parse::<u16>() {
        Ok(port) => (host, port),
        Err(e) => {
            warn!(endpoint, error = %e, "endpoint appears to be incorrectly formatted");
            (host, listen_port)
        }
    }
}

impl fmt::Display for PeerConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            client,
            server,
            settings,
        } = self;

        writeln!(f, "[Interface]")?;
        writeln!(f, "Address = {}", client.allocated_ips.join(","))?;
        writeln!(f, "PrivateKey = {}", client.private_key)?;
        if client.use_server_dns && !settings.dns_servers.is_empty() {
            writeln!(f, "DNS = {}", settings.dns_servers.join(","))?;
        }
        if settings.mtu > 0 {
            writeln!(f, "MTU = {}", settings.mtu)?;
        }

        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", server.keypair.public_key)?;
        if !client.preshared_key.is_empty() {
            writeln!(f, "PresharedKey = {}", client.preshared_key)?;
        }
        writeln!(f, "AllowedIPs = {}", client.allowed_ips.join(","))?;

        let (host, port) = resolve_endpoint(&settings.endpoint_address, server.interface.listen_port);
        if host.contains(':') && !host.starts_with('[') {
            writeln!(f, "Endpoint = [{host}]:{port}")?;
        } else {
            writeln!(f, "Endpoint = {host}:{port}")?;
        }

        if settings.persistent_keepalive > 0 {
            writeln!(f, "PersistentKeepalive = {}", settings.persistent_keepalive)?;
        }
        Ok(())
    }
}
