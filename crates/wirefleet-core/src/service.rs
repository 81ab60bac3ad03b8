//! Relay provisioning rules
//!
//! A service is one device and one peer dedicated to relaying traffic for
//! a network. Its type decides the peer's relay role and the routes it
//! announces.

use crate::topology::DEFAULT_ROUTES;
use crate::types::{PeerRole, ServiceType};

/// Listen port of the relay container when none is given
pub const DEFAULT_SERVICE_PORT: u16 = 30001;
/// Pool of a network created for a service when none is given
pub const DEFAULT_SERVICE_SUBNET: &str = "10.10.10.0/24";
/// Keepalive interval of relay peers, in seconds
pub const SERVICE_KEEPALIVE: u32 = 23;
/// Resolver used when a service network has no DNS configured
pub const FAILSAFE_DNS: &str = "8.8.8.8";

impl ServiceType {
    pub fn role(self) -> PeerRole {
        match self {
            ServiceType::Ingress => PeerRole::Ingress,
            ServiceType::Egress => PeerRole::Egress,
            ServiceType::Relay | ServiceType::Tunnel => PeerRole::Plain,
        }
    }

    /// Ingress and Egress stay put; other relays follow their public address
    pub fn syncs_endpoint(self) -> bool {
        !matches!(self, ServiceType::Ingress | ServiceType::Egress)
    }

    /// Lowercase label used in the generated device and peer names
    pub fn label(self) -> &'static str {
        match self {
            ServiceType::Relay => "relay",
            ServiceType::Tunnel => "tunnel",
            ServiceType::Ingress => "ingress",
            ServiceType::Egress => "egress",
        }
    }

    /// Routes the relay peer announces, before its own host addresses.
    ///
    /// The Egress only takes the IPv4 default route; the Ingress and full
    /// tunnels take both default routes on top of the network pools.
    pub fn routes(self, pools: &[String]) -> Vec<String> {
        let mut routes = Vec::new();
        match self {
            ServiceType::Relay => routes.extend(pools.iter().cloned()),
            ServiceType::Tunnel | ServiceType::Ingress => {
                routes.extend(pools.iter().cloned());
                routes.extend(DEFAULT_ROUTES.iter().map(|r| r.to_string()));
            }
            ServiceType::Egress => routes.push(DEFAULT_ROUTES[0].to_string()),
        }
        routes
    }
}
