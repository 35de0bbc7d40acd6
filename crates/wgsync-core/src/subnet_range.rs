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

//! Named groups of candidate CIDRs used to steer address suggestions.
//!
//! Ranges come from a single operator string such as
//! `office:10.0.0.0/26,10.0.1.0/26; lab:10.0.0.64/26`. They are parsed once,
//! pruned once against the server's networks, and then only read.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};
use wgsync_types::Client;

use crate::addr;
use crate::allocation::{self, AllocatedSet, AllocationError};

#[derive(Debug, Default)]
pub struct SubnetRangeRegistry {
    order: Vec<String>,
    ranges: HashMap<String, Vec<IpNetwork>>,
    // ip -> range name; only a lookup shortcut, safe to drop at any time
    cache: DashMap<IpAddr, String>,
}

impl SubnetRangeRegistry {
    /// Parse `name:cidr[,cidr...][;name:cidr[,cidr...]]*`.
    ///
    /// Malformed pieces are logged and skipped: a range without exactly one
    /// name separator, a repeated range name, an unparsable CIDR, or a CIDR
    /// already listed in this or an earlier range. A range left without any
    /// CIDR is not registered.
    pub fn parse(spec: &str) -> Self {
        let mut registry = Self::default();
        let spec = spec.trim().trim_matches(|c| matches!(c, ';' | ':' | ','));
        if spec.is_empty() {
            return registry;
        }

        let mut seen_cidrs = HashSet::new();

        for entry in spec.split(';') {
            let entry = entry.trim();
            let Some((name, cidrs)) = entry.split_once(':') else {
                warn!(entry, "unable to parse subnet range, skipped");
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                warn!(entry, "subnet range has no name, skipped");
                continue;
            }
            if registry.ranges.contains_key(name) {
                warn!(range = name, "subnet range defined twice, skipped");
                continue;
            }

            let mut valid = Vec::new();
            for cidr in cidrs.split(',') {
                let cidr = cidr.trim();
                let net = match addr::parse_cidr(cidr) {
                    Ok(net) => addr::normalize(net),
                    Err(_) => {
                        warn!(range = name, cidr, "unable to parse CIDR, skipped");
                        continue;
                    }
                };
                if !seen_cidrs.insert(net) {
                    warn!(range = name, cidr = %net, "CIDR already listed, skipped");
                    continue;
                }
                valid.push(net);
            }

            if valid.is_empty() {
                warn!(range = name, "subnet range has no valid CIDR, skipped");
                continue;
            }

            debug!(range = name, cidr_count = valid.len(), "registered subnet range");
            registry.order.push(name.to_string());
            registry.ranges.insert(name.to_string(), valid);
        }

        registry
    }

    /// Drop every CIDR not contained by one of `server_networks`, then drop
    /// ranges that end up empty.
    pub fn prune(&mut self, server_networks: &[IpNetwork]) {
        for name in &self.order {
            let Some(cidrs) = self.ranges.get_mut(name) else {
                continue;
            };
            cidrs.retain(|cidr| {
                let inside = server_networks
                    .iter()
                    .any(|server| addr::network_contains(*server, *cidr));
                if !inside {
                    warn!(range = %name, %cidr, "CIDR is outside of all server networks, removed");
                }
                inside
            });
        }

        let ranges = &mut self.ranges;
        self.order.retain(|name| {
            let keep = ranges.get(name).is_some_and(|cidrs| !cidrs.is_empty());
            if !keep {
                warn!(range = %name, "no valid CIDR left in subnet range, removed");
                ranges.remove(name);
            }
            keep
        });

        self.cache.clear();
        info!(ranges = %self, "subnet ranges validated");
    }

    /// Range names in the order they were declared.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, name: &str) -> Option<&[IpNetwork]> {
        self.ranges.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// CIDRs to search for a suggestion: the named range when it exists,
    /// otherwise the server's own networks.
    pub fn candidates(&self, name: &str, server_networks: &[IpNetwork]) -> Vec<IpNetwork> {
        match self.get(name) {
            Some(cidrs) => cidrs.to_vec(),
            None => server_networks.to_vec(),
        }
    }

    /// One free single-host CIDR per candidate CIDR, de-duplicated, in
    /// candidate order. A candidate with no free address is skipped; the call
    /// fails only when none of them has one.
    pub fn suggest(
        &self,
        name: &str,
        server_networks: &[IpNetwork],
        allocated: &AllocatedSet,
    ) -> Result<Vec<IpNetwork>, AllocationError> {
        let mut suggested: Vec<IpNetwork> = Vec::new();

        for cidr in self.candidates(name, server_networks) {
            match allocation::find_free(cidr, allocated, server_networks) {
                Ok(ip) => {
                    let host = addr::host_cidr(ip);
                    if !suggested.contains(&host) {
                        suggested.push(host);
                    }
                }
                Err(e) => debug!(%cidr, error = %e, "no free address in candidate"),
            }
        }

        if suggested.is_empty() {
            let scope = match self.get(name) {
                Some(_) => format!("subnet range {name}"),
                None => "the server networks".to_string(),
            };
            return Err(AllocationError::NoFreeAddress { scope });
        }
        Ok(suggested)
    }

    /// Name of the first range containing `ip`, remembered for later calls.
    pub fn range_for(&self, ip: IpAddr) -> Option<String> {
        if let Some(hit) = self.cache.get(&ip) {
            return Some(hit.value().clone());
        }

        let name = self.order.iter().find(|name| {
            self.ranges
                .get(*name)
                .is_some_and(|cidrs| cidrs.iter().any(|cidr| cidr.contains(ip)))
        })?;

        self.cache.insert(ip, name.clone());
        Some(name.clone())
    }

    /// Ranges the client's allocations fall into, for display.
    pub fn ranges_for_client(&self, client: &Client) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for cidr in &client.allocated_ips {
            let Ok(net) = addr::parse_cidr(cidr) else {
                continue;
            };
            if let Some(name) = self.range_for(net.ip()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl fmt::Display for SubnetRangeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in &self.order {
            let Some(cidrs) = self.ranges.get(name) else {
                continue;
            };
            if !first {
                f.write_str("  ")?;
            }
            first = false;
            let list: Vec<String> = cidrs.iter().map(ToString::to_string).collect();
            write!(f, "{name}:[{}]", list.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn nets(strs: &[&str]) -> Vec<IpNetwork> {
        strs.iter().map(|s| net(s)).collect()
    }

    #[test]
    fn parse_multiple_ranges_in_order() {
        let reg = SubnetRangeRegistry::parse("office:10.0.0.0/26, 10.0.1.0/26; lab:10.0.0.64/26");
        assert_eq!(reg.names(), ["office", "lab"]);
        assert_eq!(reg.get("office").unwrap(), nets(&["10.0.0.0/26", "10.0.1.0/26"]));
        assert_eq!(reg.get("lab").unwrap(), nets(&["10.0.0.64/26"]));
    }

    #[test]
    fn parse_trims_stray_delimiters() {
        let reg = SubnetRangeRegistry::parse("  ;lab:10.0.0.0/28;, ");
        assert_eq!(reg.names(), ["lab"]);
    }

    #[test_case("" ; "empty")]
    #[test_case("lab" ; "missing separator")]
    #[test_case(":10.0.0.0/28" ; "missing name")]
    #[test_case("lab:not-a-cidr" ; "unparsable cidr")]
    #[test_case("lab:10.0.0.1" ; "bare address")]
    fn parse_drops_malformed(spec: &str) {
        assert!(SubnetRangeRegistry::parse(spec).is_empty());
    }

    #[test]
    fn parse_skips_bad_entries_but_keeps_good_ones() {
        let reg = SubnetRangeRegistry::parse("a:10.0.0.0/28,bogus;b;c:10.0.0.16/28");
        assert_eq!(reg.names(), ["a", "c"]);
        assert_eq!(reg.get("a").unwrap(), nets(&["10.0.0.0/28"]));
    }

    #[test]
    fn parse_rejects_duplicate_cidrs_across_ranges() {
        let reg = SubnetRangeRegistry::parse("a:10.0.0.0/28,10.0.0.0/28;b:10.0.0.5/28");
        assert_eq!(reg.names(), ["a"]);
        assert_eq!(reg.get("a").unwrap(), nets(&["10.0.0.0/28"]));
    }

    #[test]
    fn parse_rejects_repeated_name() {
        let reg = SubnetRangeRegistry::parse("a:10.0.0.0/28;a:10.0.0.16/28");
        assert_eq!(reg.get("a").unwrap(), nets(&["10.0.0.0/28"]));
    }

    #[test]
    fn parse_accepts_v6() {
        let reg = SubnetRangeRegistry::parse("v6:fd00::/120");
        assert_eq!(reg.get("v6").unwrap(), nets(&["fd00::/120"]));
    }

    #[test]
    fn prune_keeps_contained_and_drops_outside() {
        let mut reg = SubnetRangeRegistry::parse("lab:10.0.0.0/28;bad:172.16.0.0/24");
        reg.prune(&nets(&["10.0.0.0/24"]));
        assert_eq!(reg.names(), ["lab"]);
        assert_eq!(reg.get("lab").unwrap(), nets(&["10.0.0.0/28"]));
        assert!(reg.get("bad").is_none());
    }

    #[test]
    fn prune_removes_individual_cidrs() {
        let mut reg = SubnetRangeRegistry::parse("mixed:10.0.0.0/28,10.0.0.0/16,192.168.0.0/24");
        reg.prune(&nets(&["10.0.0.0/24"]));
        assert_eq!(reg.get("mixed").unwrap(), nets(&["10.0.0.0/28"]));
    }

    #[test]
    fn candidates_fall_back_to_server() {
        let reg = SubnetRangeRegistry::parse("lab:10.0.0.16/28");
        let server = nets(&["10.0.0.0/24"]);
        assert_eq!(reg.candidates("lab", &server), nets(&["10.0.0.16/28"]));
        assert_eq!(reg.candidates("", &server), server);
        assert_eq!(reg.candidates("nope", &server), server);
    }

    #[test]
    fn suggest_one_per_candidate() {
        let reg = SubnetRangeRegistry::parse("two:10.0.0.16/28,10.0.0.32/28");
        let server = nets(&["10.0.0.0/24"]);
        let got = reg.suggest("two", &server, &AllocatedSet::new()).unwrap();
        assert_eq!(got, nets(&["10.0.0.17/32", "10.0.0.33/32"]));
    }

    #[test]
    fn suggest_skips_exhausted_candidate() {
        let reg = SubnetRangeRegistry::parse("r:10.0.0.4/30,10.0.0.8/30");
        let server = nets(&["10.0.0.0/24"]);
        let allocated: AllocatedSet = ["10.0.0.5", "10.0.0.6"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let got = reg.suggest("r", &server, &allocated).unwrap();
        assert_eq!(got, nets(&["10.0.0.9/32"]));
    }

    #[test]
    fn suggest_fails_when_everything_is_taken() {
        let reg = SubnetRangeRegistry::default();
        let server = nets(&["10.0.0.0/30"]);
        let allocated: AllocatedSet = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let err = reg.suggest("", &server, &allocated).unwrap_err();
        assert!(matches!(err, AllocationError::NoFreeAddress { .. }));
    }

    #[test]
    fn suggest_dual_stack_formats_by_family() {
        let reg = SubnetRangeRegistry::default();
        let server = nets(&["10.0.0.0/24", "fd00::/64"]);
        let got = reg.suggest("", &server, &AllocatedSet::new()).unwrap();
        let rendered: Vec<String> = got.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["10.0.0.1/32", "fd00::1/128"]);
    }

    #[test]
    fn range_lookup_uses_declaration_order_and_cache() {
        let reg = SubnetRangeRegistry::parse("a:10.0.0.0/28;b:10.0.0.16/28");
        let ip: IpAddr = "10.0.0.20".parse().unwrap();
        assert_eq!(reg.range_for(ip).as_deref(), Some("b"));
        assert_eq!(reg.cache.len(), 1);
        reg.clear_cache();
        assert_eq!(reg.range_for(ip).as_deref(), Some("b"));
        assert!(reg.range_for("10.9.9.9".parse().unwrap()).is_none());
    }

    #[test]
    fn display_lists_ranges() {
        let reg = SubnetRangeRegistry::parse("a:10.0.0.0/28;b:10.0.0.16/28,10.0.0.32/28");
        assert_eq!(reg.to_string(), "a:[10.0.0.0/28]  b:[10.0.0.16/28, 10.0.0.32/28]");
    }
}
