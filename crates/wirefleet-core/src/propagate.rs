//! Rules for pushing a network's new default settings onto its peers
//!
//! Only the axes that actually changed are touched. AllowedIPs entries a
//! peer inherited from the old template are refreshed from the new one,
//! entries added by hand outside the old template survive.

use std::collections::HashSet;

use crate::address::cidr_within;
use crate::types::{Peer, Settings};

/// Which parts of a network's defaults differ between two versions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultsChange {
    pub mtu: bool,
    pub address: bool,
    pub allowed_ips: bool,
}

fn same_entries(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

impl DefaultsChange {
    pub fn between(old: &Settings, new: &Settings) -> Self {
        Self {
            mtu: old.mtu != new.mtu,
            address: !same_entries(&old.address, &new.address),
            allowed_ips: !same_entries(&old.allowed_ips, &new.allowed_ips),
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.mtu || self.address || self.allowed_ips)
    }
}

fn push_unique(list: &mut Vec<String>, entry: &str) {
    if !list.iter().any(|e| e == entry) {
        list.push(entry.to_string());
    }
}

/// Rewrite a peer's allowed IPs against an old and a new template.
///
/// The peer's own host addresses are always kept.
pub fn refresh_allowed_ips(
    allowed_ips: &[String],
    own_addresses: &[String],
    old_defaults: &[String],
    new_defaults: &[String],
) -> Vec<String> {
    let mut refreshed = Vec::with_capacity(allowed_ips.len() + new_defaults.len());

    for entry in allowed_ips {
        if own_addresses.contains(entry) {
            push_unique(&mut refreshed, entry);
        } else if old_defaults.contains(entry) {
            for replacement in new_defaults {
                push_unique(&mut refreshed, replacement);
            }
        } else if old_defaults.iter().any(|d| cidr_within(entry, d)) {
            // derived from the old template, superseded
        } else {
            push_unique(&mut refreshed, entry);
        }
    }

    refreshed
}

/// Apply a defaults change to one peer. Returns true when the peer changed.
///
/// An address change clears `current.address` (and drops those hosts from
/// the peer's allowed IPs); the caller must re-allocate before persisting.
pub fn apply_to_peer(peer: &mut Peer, old: &Settings, new: &Settings, change: DefaultsChange) -> bool {
    let before = peer.clone();
    let template = peer.default.get_or_insert_with(|| new.clone());

    if change.mtu {
        template.mtu = new.mtu;
        peer.current.mtu = new.mtu;
    }

    if change.allowed_ips {
        peer.current.allowed_ips = refresh_allowed_ips(
            &peer.current.allowed_ips,
            &peer.current.address,
            &old.allowed_ips,
            &new.allowed_ips,
        );
    }

    if change.address {
        template.address = new.address.clone();
        let released = std::mem::take(&mut peer.current.address);
        peer.current.allowed_ips.retain(|ip| !released.contains(ip));
    }

    *peer != before
}
