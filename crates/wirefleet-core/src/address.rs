//! CIDR utilities and the host address allocator
//!
//! Allocation walks each pool in ascending order and returns the lowest
//! free host address. The network address and the all-ones address of a
//! pool are never handed out. No state is kept between calls: the caller
//! supplies the reserved set every time, so the same reserved set always
//! yields the same address.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{FleetError, Result};
use crate::types::Peer;

/// Prefix applied to a bare IPv4 pool address
pub const DEFAULT_V4_PREFIX: u8 = 24;
/// Prefix applied to a bare IPv6 pool address
pub const DEFAULT_V6_PREFIX: u8 = 64;

/// Parse a CIDR, rejecting bare addresses
pub fn parse_cidr(cidr: &str) -> Result<IpNet> {
    cidr.trim()
        .parse::<IpNet>()
        .map_err(|_| FleetError::invalid(format!("address {} is invalid", cidr)))
}

pub fn is_valid_cidr(cidr: &str) -> bool {
    parse_cidr(cidr).is_ok()
}

/// Host part of a CIDR or bare address
pub fn host_of(entry: &str) -> Option<IpAddr> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry.parse::<IpNet>().ok().map(|net| net.addr())
    } else {
        entry.parse::<IpAddr>().ok()
    }
}

/// True when the whole of `inner` lies inside `outer` (both CIDRs)
pub fn cidr_within(inner: &str, outer: &str) -> bool {
    match (inner.trim().parse::<IpNet>(), outer.trim().parse::<IpNet>()) {
        (Ok(inner), Ok(outer)) => outer.contains(&inner),
        _ => false,
    }
}

/// Normalize a pool to its network base address.
///
/// An explicit prefix is kept; a bare address gets /24 (IPv4) or /64
/// (IPv6). Normalizing an already normalized pool returns it unchanged.
pub fn normalize_pool(pool: &str) -> Result<String> {
    let pool = pool.trim();
    let net = if pool.contains('/') {
        parse_cidr(pool)?
    } else {
        let ip = pool
            .parse::<IpAddr>()
            .map_err(|_| FleetError::invalid(format!("address {} is invalid", pool)))?;
        let prefix = match ip {
            IpAddr::V4(_) => DEFAULT_V4_PREFIX,
            IpAddr::V6(_) => DEFAULT_V6_PREFIX,
        };
        IpNet::new(ip, prefix).map_err(|e| FleetError::Internal(e.to_string()))?
    };
    Ok(net.trunc().to_string())
}

/// Single-host network for an address: /32 or /128
fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::from(v6)),
    }
}

/// Lowest free host address of `pool` not present in `reserved`
pub fn allocate(pool: &IpNet, reserved: &HashSet<IpAddr>) -> Result<IpNet> {
    let candidate = match pool.trunc() {
        IpNet::V4(net) => {
            let first = u32::from(net.network()).saturating_add(1);
            let last = u32::from(net.broadcast());
            (first..last)
                .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
                .find(|ip| !reserved.contains(ip))
        }
        IpNet::V6(net) => {
            let first = u128::from(net.network()).saturating_add(1);
            let last = u128::from(net.broadcast());
            (first..last)
                .map(|n| IpAddr::V6(Ipv6Addr::from(n)))
                .find(|ip| !reserved.contains(ip))
        }
    };

    candidate
        .map(host_net)
        .ok_or_else(|| FleetError::ExhaustedPool(pool.trunc().to_string()))
}

/// Allocate one host per pool, in pool order.
///
/// Each picked address joins `reserved` so later pools (and later calls
/// sharing the set) never reuse it.
pub fn allocate_all(pools: &[String], reserved: &mut HashSet<IpAddr>) -> Result<Vec<String>> {
    let mut hosts = Vec::with_capacity(pools.len());
    for pool in pools {
        let net = parse_cidr(pool)?;
        let host = allocate(&net, reserved)?;
        reserved.insert(host.addr());
        hosts.push(host.to_string());
    }
    Ok(hosts)
}

/// Host addresses currently held by the given peers
pub fn reserved_addresses<'a>(peers: impl IntoIterator<Item = &'a Peer>) -> HashSet<IpAddr> {
    let mut reserved = HashSet::new();
    for peer in peers {
        for entry in &peer.current.address {
            match host_of(entry) {
                Some(ip) => {
                    reserved.insert(ip);
                }
                None => {
                    tracing::error!(peer = %peer.id, cidr = %entry, "failed to read ip from cidr");
                }
            }
        }
    }
    reserved
}
