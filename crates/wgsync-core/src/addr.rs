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

//! CIDR arithmetic shared by the allocator, the validator and the subnet
//! range registry. Addresses of both families are handled as `u128` so the
//! same walk works for IPv4 and IPv6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CIDR: {0:?}")]
pub struct CidrParseError(pub String);

/// Parse `addr/prefix`. A bare address is rejected, unlike `IpNetwork::from_str`
/// which silently treats it as a single host.
pub fn parse_cidr(s: &str) -> Result<IpNetwork, CidrParseError> {
    let s = s.trim();
    if !s.contains('/') {
        return Err(CidrParseError(s.to_string()));
    }
    s.parse().map_err(|_| CidrParseError(s.to_string()))
}

/// Parse a list of CIDRs, stopping at the first bad entry.
pub fn parse_cidrs<S: AsRef<str>>(list: &[S]) -> Result<Vec<IpNetwork>, CidrParseError> {
    list.iter().map(|s| parse_cidr(s.as_ref())).collect()
}

pub fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(n: u128, family: IpNetwork) -> IpAddr {
    match family {
        // Truncation is fine, callers never step outside the v4 range.
        IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(n as u32)),
        IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(n)),
    }
}

fn family_max(net: IpNetwork) -> u128 {
    match net {
        IpNetwork::V4(_) => u128::from(u32::MAX),
        IpNetwork::V6(_) => u128::MAX,
    }
}

/// First address of the network (all host bits zero).
pub fn network_address(net: IpNetwork) -> IpAddr {
    net.network()
}

/// Last address of the network (all host bits one). IPv6 has no broadcast,
/// but the all-ones address is reserved the same way.
pub fn broadcast_address(net: IpNetwork) -> IpAddr {
    let host_bits = !ip_to_u128(net.mask()) & family_max(net);
    u128_to_ip(ip_to_u128(net.network()) | host_bits, net)
}

/// Number of addresses covered, saturating at `u128::MAX` for `::/0`.
pub fn address_count(net: IpNetwork) -> u128 {
    let first = ip_to_u128(net.network());
    let last = ip_to_u128(broadcast_address(net));
    (last - first).saturating_add(1)
}

/// Whether `inner` is the same as or narrower than `outer` and lies inside it.
pub fn network_contains(outer: IpNetwork, inner: IpNetwork) -> bool {
    outer.prefix() <= inner.prefix() && outer.contains(inner.ip())
}

/// The single-host CIDR for an address: `/32` for IPv4, `/128` for IPv6.
pub fn host_cidr(ip: IpAddr) -> IpNetwork {
    IpNetwork::from(ip)
}

/// The same network with host bits cleared, e.g. `10.0.0.5/24` -> `10.0.0.0/24`.
pub fn normalize(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

/// Every address of `net` in ascending order, network and broadcast included.
pub fn addresses(net: IpNetwork) -> impl Iterator<Item = IpAddr> {
    let first = ip_to_u128(net.network());
    let last = ip_to_u128(broadcast_address(net));
    (first..=last).map(move |n| u128_to_ip(n, net))
}
