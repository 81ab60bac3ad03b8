//! Peer visibility within a relay topology
//!
//! A network may designate one Ingress and one Egress peer. Ordinary peers
//! route through the Ingress and never see the Egress directly; the Ingress
//! sees everyone; the Egress sees only the relay pair. Private keys and
//! hook commands of peers belonging to other devices are always blanked.

use crate::types::{Peer, PeerRole, Policies};

/// Catch-all routes removed from the Ingress when served to the Egress
pub const DEFAULT_ROUTES: &[&str] = &["0.0.0.0/0", "::/0"];

/// Public address space split into blocks, the usual replacement for a
/// default route that keeps private ranges local
pub const PUBLIC_SPLIT_ROUTES: &[&str] = &[
    "0.0.0.0/5", "8.0.0.0/7", "11.0.0.0/8", "12.0.0.0/6", "16.0.0.0/4", "32.0.0.0/3",
    "64.0.0.0/3", "96.0.0.0/4", "112.0.0.0/5", "120.0.0.0/6", "124.0.0.0/7", "126.0.0.0/8",
    "128.0.0.0/3", "160.0.0.0/5", "168.0.0.0/6", "172.0.0.0/12", "172.32.0.0/11",
    "172.64.0.0/10", "172.128.0.0/9", "173.0.0.0/8", "174.0.0.0/7", "176.0.0.0/4",
    "192.0.0.0/9", "192.128.0.0/11", "192.160.0.0/13", "192.169.0.0/16", "192.170.0.0/15",
    "192.172.0.0/14", "192.176.0.0/12", "192.192.0.0/10", "193.0.0.0/8", "194.0.0.0/7",
    "196.0.0.0/6", "200.0.0.0/5", "208.0.0.0/4", "::/1", "8000::/2", "c000::/3", "e000::/4",
    "f000::/5", "f800::/6", "fe00::/9", "fe80::/10", "ff00::/8",
];

/// Relay roles of a network as seen by one requesting device
#[derive(Debug, Clone, Copy)]
pub struct Roles<'a> {
    pub ingress: Option<&'a Peer>,
    pub egress: Option<&'a Peer>,
    pub is_ingress: bool,
    pub is_egress: bool,
}

impl Roles<'_> {
    pub fn has_ingress(&self) -> bool {
        self.ingress.is_some()
    }
}

/// Scan the peers of one network once for relay roles.
///
/// When several peers claim the same role the first one wins.
pub fn classify<'a>(peers: &'a [Peer], device_id: &str) -> Roles<'a> {
    let mut roles = Roles {
        ingress: None,
        egress: None,
        is_ingress: false,
        is_egress: false,
    };

    for peer in peers {
        match peer.role {
            PeerRole::Ingress if roles.ingress.is_none() => {
                roles.ingress = Some(peer);
                roles.is_ingress = peer.device_id == device_id;
            }
            PeerRole::Egress if roles.egress.is_none() => {
                roles.egress = Some(peer);
                roles.is_egress = peer.device_id == device_id;
            }
            _ => {}
        }
    }

    roles
}

/// Filtered peer list for one device
#[derive(Debug, Clone, Default)]
pub struct Visibility {
    pub peers: Vec<Peer>,
    /// Id of the requester's own peer in this network, if any
    pub own_peer: Option<String>,
}

/// Blank everything a peer's owner must keep to itself
pub fn redact(peer: &mut Peer) {
    peer.current.private_key.clear();
    peer.current.clear_hooks();
    peer.default = None;
}

fn strip_default_routes(allowed_ips: &mut Vec<String>) {
    allowed_ips.retain(|ip| {
        let ip = ip.as_str();
        !DEFAULT_ROUTES.contains(&ip) && !PUBLIC_SPLIT_ROUTES.contains(&ip)
    });
}

fn view_for(peer: &Peer, device_id: &str) -> Peer {
    let mut view = peer.clone();
    if peer.device_id != device_id {
        redact(&mut view);
    }
    view
}

/// Compute the peers `device_id` may see among `peers` (one network).
pub fn resolve(peers: &[Peer], device_id: &str, policies: Policies) -> Visibility {
    let roles = classify(peers, device_id);
    let own = peers.iter().find(|p| p.device_id == device_id);
    let own_peer = own.map(|p| p.id.clone());

    if let (true, Some(ingress), Some(egress)) = (roles.is_egress, roles.ingress, roles.egress) {
        let mut ingress = view_for(ingress, device_id);
        strip_default_routes(&mut ingress.current.allowed_ips);
        return Visibility {
            peers: vec![ingress, view_for(egress, device_id)],
            own_peer,
        };
    }

    let requester_is_endpoint = own.is_some_and(|p| p.current.has_endpoint());
    let mut visible = Vec::with_capacity(peers.len());

    for peer in peers {
        let is_own = peer.device_id == device_id;

        if peer.role == PeerRole::Egress && roles.has_ingress() && !roles.is_ingress {
            continue;
        }

        if policies.only_endpoints
            && !is_own
            && !requester_is_endpoint
            && !peer.current.has_endpoint()
        {
            continue;
        }

        visible.push(view_for(peer, device_id));
    }

    Visibility {
        peers: visible,
        own_peer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Settings;

    fn peer(id: &str, device: &str, role: PeerRole) -> Peer {
        Peer {
            id: id.into(),
            device_id: device.into(),
            net_id: "net-1".into(),
            role,
            current: Settings {
                private_key: format!("{}-secret", id),
                post_up: "iptables -A FORWARD".into(),
                allowed_ips: vec!["10.0.0.0/24".into()],
                ..Default::default()
            },
            default: Some(Settings::default()),
            ..Default::default()
        }
    }

    fn relay_network() -> Vec<Peer> {
        let mut ingress = peer("i", "dev-i", PeerRole::Ingress);
        ingress.current.allowed_ips = vec![
            "10.0.0.0/24".into(),
            "0.0.0.0/0".into(),
            "::/0".into(),
            "8.0.0.0/7".into(),
        ];
        vec![
            peer("a", "dev-a", PeerRole::Plain),
            peer("b", "dev-b", PeerRole::Plain),
            ingress,
            peer("e", "dev-e", PeerRole::Egress),
        ]
    }

    fn ids(v: &Visibility) -> Vec<&str> {
        v.peers.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_plain_peer_does_not_see_egress() {
        let v = resolve(&relay_network(), "dev-a", Policies::default());
        assert_eq!(ids(&v), vec!["a", "b", "i"]);
        assert_eq!(v.own_peer.as_deref(), Some("a"));

        for p in &v.peers {
            if p.id == "a" {
                assert_eq!(p.current.private_key, "a-secret");
                assert!(p.default.is_some());
            } else {
                assert!(p.current.private_key.is_empty());
                assert!(p.current.post_up.is_empty());
                assert!(p.default.is_none());
            }
        }
    }

    #[test]
    fn test_egress_sees_only_relay_pair() {
        let v = resolve(&relay_network(), "dev-e", Policies::default());
        assert_eq!(ids(&v), vec!["i", "e"]);

        let ingress = &v.peers[0];
        assert_eq!(ingress.current.allowed_ips, vec!["10.0.0.0/24"]);
        assert!(ingress.current.private_key.is_empty());
        assert_eq!(v.peers[1].current.private_key, "e-secret");
    }

    #[test]
    fn test_ingress_sees_everyone() {
        let v = resolve(&relay_network(), "dev-i", Policies::default());
        assert_eq!(ids(&v), vec!["a", "b", "i", "e"]);
        let ingress = v.peers.iter().find(|p| p.id == "i").unwrap();
        assert!(ingress.current.allowed_ips.contains(&"0.0.0.0/0".to_string()));
    }

    #[test]
    fn test_egress_without_ingress_is_visible() {
        let peers = vec![
            peer("a", "dev-a", PeerRole::Plain),
            peer("e", "dev-e", PeerRole::Egress),
        ];
        assert_eq!(ids(&resolve(&peers, "dev-a", Policies::default())), vec!["a", "e"]);
        assert_eq!(ids(&resolve(&peers, "dev-e", Policies::default())), vec!["a", "e"]);
    }

    #[test]
    fn test_only_endpoints_hides_clients_from_clients() {
        let mut server = peer("s", "dev-s", PeerRole::Plain);
        server.current.endpoint = "203.0.113.7:51820".into();
        let peers = vec![
            peer("a", "dev-a", PeerRole::Plain),
            peer("b", "dev-b", PeerRole::Plain),
            server,
        ];
        let policies = Policies {
            only_endpoints: true,
            ..Default::default()
        };

        assert_eq!(ids(&resolve(&peers, "dev-a", policies)), vec!["a", "s"]);
        assert_eq!(ids(&resolve(&peers, "dev-s", policies)), vec!["a", "b", "s"]);
    }

    #[test]
    fn test_classify_first_claim_wins() {
        let peers = vec![
            peer("i1", "dev-1", PeerRole::Ingress),
            peer("i2", "dev-2", PeerRole::Ingress),
        ];
        let roles = classify(&peers, "dev-2");
        assert_eq!(roles.ingress.map(|p| p.id.as_str()), Some("i1"));
        assert!(!roles.is_ingress);
        assert!(!roles.is_egress);
    }

    #[test]
    fn test_unknown_device_sees_redacted_list() {
        let v = resolve(&relay_network(), "dev-x", Policies::default());
        assert_eq!(ids(&v), vec!["a", "b", "i"]);
        assert!(v.own_peer.is_none());
        assert!(v.peers.iter().all(|p| p.current.private_key.is_empty()));
    }
}
