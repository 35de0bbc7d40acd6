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

use std::collections::HashSet;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::debug;
use wgsync_types::{Client, ServerInterface};

use crate::addr::{self, CidrParseError};

/// Bare addresses currently held by the server or by a peer.
pub type AllocatedSet = HashSet<IpAddr>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid ip allocation input {0:?}, must be a single host in CIDR format")]
    MalformedCidr(String),

    #[error("IP {0} already allocated")]
    DuplicateAddress(IpAddr),

    #[error("IP {0} does not belong to any network of the WireGuard server")]
    OutsideServerNetwork(IpAddr),

    #[error("no more available IP addresses in {scope}")]
    NoFreeAddress { scope: String },

    #[error("stored {owner} holds an invalid address {value:?}")]
    CorruptRecord { owner: String, value: String },
}

impl AllocationError {
    /// Whether the caller's input is at fault. A corrupt stored record is not.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::CorruptRecord { .. })
    }
}

impl From<CidrParseError> for AllocationError {
    fn from(err: CidrParseError) -> Self {
        Self::MalformedCidr(err.0)
    }
}

/// The server's networks as written in its interface settings.
pub fn server_networks(server: &ServerInterface) -> Result<Vec<IpNetwork>, AllocationError> {
    addr::parse_cidrs(&server.addresses).map_err(|e| AllocationError::CorruptRecord {
        owner: "server interface".into(),
        value: e.0,
    })
}

/// Collect every address already spoken for.
///
/// Each server CIDR contributes its network address and the server's own
/// address. Every client except `exclude_client_id` contributes the bare
/// addresses of its allocations.
pub fn currently_allocated(
    server: &ServerInterface,
    clients: &[Client],
    exclude_client_id: Option<&str>,
) -> Result<AllocatedSet, AllocationError> {
    let mut allocated = AllocatedSet::new();

    for net in server_networks(server)? {
        allocated.insert(net.network());
        allocated.insert(net.ip());
    }

    for client in clients {
        if exclude_client_id == Some(client.id.as_str()) {
            continue;
        }
        for cidr in &client.allocated_ips {
            let net = addr::parse_cidr(cidr).map_err(|e| AllocationError::CorruptRecord {
                owner: format!("client {}", client.id),
                value: e.0,
            })?;
            allocated.insert(net.ip());
        }
    }

    debug!(
        count = allocated.len(),
        excluded = exclude_client_id.unwrap_or(""),
        "computed allocated addresses"
    );
    Ok(allocated)
}

/// Boundary addresses of the server's networks, which no peer may take even
/// when a narrower range is being searched.
fn reserved_addresses(server_networks: &[IpNetwork]) -> HashSet<IpAddr> {
    server_networks
        .iter()
        .flat_map(|net| [addr::network_address(*net), addr::broadcast_address(*net)])
        .collect()
}

/// Lowest free host address in `cidr`.
///
/// Skips the network and broadcast addresses of every server network and of
/// `cidr` itself (unless `cidr` spans two addresses or fewer, where there is
/// no host/boundary distinction), plus anything in `allocated`. The walk
/// stops after at most `|excluded| + 1` steps because every skipped address
/// belongs to a finite set, so large IPv6 pools stay cheap.
pub fn find_free(
    cidr: IpNetwork,
    allocated: &AllocatedSet,
    server_networks: &[IpNetwork],
) -> Result<IpAddr, AllocationError> {
    let mut reserved = reserved_addresses(server_networks);
    if addr::address_count(cidr) > 2 {
        reserved.insert(addr::network_address(cidr));
        reserved.insert(addr::broadcast_address(cidr));
    }

    let found = addr::addresses(cidr).find(|ip| !reserved.contains(ip) && !allocated.contains(ip));

    match found {
        Some(ip) => {
            debug!(%cidr, %ip, "found free address");
            Ok(ip)
        }
        None => Err(AllocationError::NoFreeAddress {
            scope: addr::normalize(cidr).to_string(),
        }),
    }
}

/// Check a proposed set of allocations against the current state.
///
/// Every entry must be a CIDR whose address is neither allocated already nor
/// repeated within `proposed`, and lies inside one of the server's networks.
/// The first failure aborts; nothing is applied by this function either way.
pub fn validate(
    server_networks: &[IpNetwork],
    allocated: &AllocatedSet,
    proposed: &[String],
) -> Result<Vec<IpNetwork>, AllocationError> {
    let mut seen = HashSet::with_capacity(proposed.len());
    let mut accepted = Vec::with_capacity(proposed.len());

    for entry in proposed {
        let cidr = addr::parse_cidr(entry)?;
        let ip = cidr.ip();

        // allocations are single hosts; a wider prefix would overlap other peers
        if cidr.prefix() != addr::host_cidr(ip).prefix() {
            return Err(AllocationError::MalformedCidr(entry.trim().to_string()));
        }

        if allocated.contains(&ip) || !seen.insert(ip) {
            return Err(AllocationError::DuplicateAddress(ip));
        }

        if !server_networks.iter().any(|net| net.contains(ip)) {
            return Err(AllocationError::OutsideServerNetwork(ip));
        }

        accepted.push(cidr);
    }

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use test_case::test_case;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn set(ips: &[&str]) -> AllocatedSet {
        ips.iter().map(|s| ip(s)).collect()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn make_interface(addresses: &[&str]) -> ServerInterface {
        ServerInterface {
            addresses: strings(addresses),
            listen_port: 51820,
            post_up: String::new(),
            post_down: String::new(),
            updated_at: Utc::now(),
        }
    }

    fn make_client(id: &str, allocated: &[&str]) -> Client {
        Client {
            id: id.to_string(),
            private_key: String::new(),
            public_key: format!("{id}-pub"),
            preshared_key: String::new(),
            name: id.to_string(),
            email: String::new(),
            allocated_ips: strings(allocated),
            allowed_ips: strings(&["0.0.0.0/0"]),
            extra_allowed_ips: vec![],
            use_server_dns: true,
            enabled: true,
            additional_notes: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // -- Tracker -------------------------------------------------------------

    #[test]
    fn tracker_includes_server_and_clients() {
        let server = make_interface(&["10.0.0.1/24"]);
        let clients = vec![
            make_client("a", &["10.0.0.2/32"]),
            make_client("b", &["10.0.0.3/32", "fd00::3/128"]),
        ];
        let allocated = currently_allocated(&server, &clients, None).unwrap();
        assert_eq!(
            allocated,
            set(&["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3", "fd00::3"])
        );
    }

    #[test]
    fn tracker_excludes_edited_client() {
        let server = make_interface(&["10.0.0.0/24"]);
        let clients = vec![
            make_client("a", &["10.0.0.2/32"]),
            make_client("b", &["10.0.0.3/32"]),
        ];
        let allocated = currently_allocated(&server, &clients, Some("b")).unwrap();
        assert_eq!(allocated, set(&["10.0.0.0", "10.0.0.2"]));
    }

    #[test]
    fn tracker_rejects_corrupt_record() {
        let server = make_interface(&["10.0.0.0/24"]);
        let clients = vec![make_client("a", &["10.0.0.2"])];
        let err = currently_allocated(&server, &clients, None).unwrap_err();
        assert_eq!(
            err,
            AllocationError::CorruptRecord {
                owner: "client a".into(),
                value: "10.0.0.2".into(),
            }
        );
        assert!(!err.is_rejection());
    }

    // -- Allocator -----------------------------------------------------------

    #[test]
    fn first_free_skips_network_address() {
        let server = [net("10.0.0.0/24")];
        let found = find_free(net("10.0.0.0/24"), &AllocatedSet::new(), &server).unwrap();
        assert_eq!(found, ip("10.0.0.1"));
    }

    #[test_case(&["10.0.0.1"], "10.0.0.2" ; "skips allocated")]
    #[test_case(&["10.0.0.1", "10.0.0.2", "10.0.0.4"], "10.0.0.3" ; "fills gap")]
    fn first_free_lowest(allocated: &[&str], expected: &str) {
        let server = [net("10.0.0.0/24")];
        let found = find_free(net("10.0.0.0/24"), &set(allocated), &server).unwrap();
        assert_eq!(found, ip(expected));
    }

    #[test]
    fn never_returns_broadcast() {
        let server = [net("10.0.0.0/30")];
        let err = find_free(net("10.0.0.0/30"), &set(&["10.0.0.1", "10.0.0.2"]), &server)
            .unwrap_err();
        assert!(matches!(err, AllocationError::NoFreeAddress { .. }));
    }

    #[test]
    fn subnet_range_avoids_server_boundaries() {
        // The range's own first address is the server's network address.
        let server = [net("10.0.0.0/24")];
        let found = find_free(net("10.0.0.0/28"), &AllocatedSet::new(), &server).unwrap();
        assert_eq!(found, ip("10.0.0.1"));

        let server = [net("10.0.0.0/28")];
        let err = find_free(net("10.0.0.14/31"), &set(&["10.0.0.14"]), &server).unwrap_err();
        assert_eq!(
            err,
            AllocationError::NoFreeAddress {
                scope: "10.0.0.14/31".into()
            }
        );
    }

    #[test]
    fn narrow_range_skips_its_own_boundaries() {
        let server = [net("10.0.0.0/24")];
        let found = find_free(net("10.0.0.16/28"), &AllocatedSet::new(), &server).unwrap();
        assert_eq!(found, ip("10.0.0.17"));
    }

    #[test]
    fn single_host_range_yields_itself() {
        let server = [net("10.0.0.0/24")];
        let found = find_free(net("10.0.0.9/32"), &AllocatedSet::new(), &server).unwrap();
        assert_eq!(found, ip("10.0.0.9"));
    }

    #[test]
    fn large_v6_pool_is_cheap() {
        let server = [net("fd00::/48")];
        let allocated = set(&["fd00::1", "fd00::2"]);
        let found = find_free(net("fd00::/48"), &allocated, &server).unwrap();
        assert_eq!(found, ip("fd00::3"));
    }

    #[test]
    fn free_address_is_a_fresh_host_of_the_range() {
        let server = [net("10.1.0.0/26")];
        let mut allocated = AllocatedSet::new();
        for _ in 0..62 {
            let found = find_free(net("10.1.0.0/26"), &allocated, &server).unwrap();
            assert!(server[0].contains(found));
            assert_ne!(found, ip("10.1.0.0"));
            assert_ne!(found, ip("10.1.0.63"));
            assert!(allocated.insert(found), "{found} handed out twice");
        }
        assert!(find_free(net("10.1.0.0/26"), &allocated, &server).is_err());
    }

    // -- Validator -----------------------------------------------------------

    #[test]
    fn validate_accepts_free_host_in_network() {
        let server = [net("10.0.0.0/24")];
        let accepted =
            validate(&server, &set(&["10.0.0.0"]), &strings(&["10.0.0.5/32"])).unwrap();
        assert_eq!(accepted, vec![net("10.0.0.5/32")]);
    }

    #[test_case(&["10.0.0.1/32"], AllocationError::DuplicateAddress(ip("10.0.0.1")) ; "held by another peer")]
    #[test_case(&["10.0.0.0/32"], AllocationError::DuplicateAddress(ip("10.0.0.0")) ; "server address")]
    #[test_case(&["192.168.1.5/32"], AllocationError::OutsideServerNetwork(ip("192.168.1.5")) ; "outside server network")]
    #[test_case(&["10.0.0.7"], AllocationError::MalformedCidr("10.0.0.7".into()) ; "not a cidr")]
    #[test_case(&["10.0.0.5/24"], AllocationError::MalformedCidr("10.0.0.5/24".into()) ; "network prefix")]
    #[test_case(&["fd00::5/64"], AllocationError::MalformedCidr("fd00::5/64".into()) ; "ipv6 network prefix")]
    #[test_case(&["10.0.0.7/32", "10.0.0.7/32"], AllocationError::DuplicateAddress(ip("10.0.0.7")) ; "repeated in proposal")]
    #[test_case(&["10.0.0.8/32", "192.168.1.5/32"], AllocationError::OutsideServerNetwork(ip("192.168.1.5")) ; "second entry fails")]
    fn validate_rejects(proposed: &[&str], expected: AllocationError) {
        let server = [net("10.0.0.0/24")];
        let allocated = set(&["10.0.0.0", "10.0.0.1"]);
        let err = validate(&server, &allocated, &strings(proposed)).unwrap_err();
        assert_eq!(err, expected);
    }

    #[test]
    fn validate_checks_every_server_network() {
        let server = [net("10.0.0.0/24"), net("fd00::/64")];
        let accepted = validate(
            &server,
            &AllocatedSet::new(),
            &strings(&["10.0.0.9/32", "fd00::9/128"]),
        )
        .unwrap();
        assert_eq!(accepted.len(), 2);
    }
}
