//! Core types for Wirefleet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a record id such as `net-3f2c...`
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// WireGuard interface settings.
///
/// Embedded twice in every peer: `current` holds the live values and
/// `default` the template copied from the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
    /// Host CIDRs (/32 or /128) for a peer, pool CIDRs for a network template
    pub address: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub dns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub mtu: u32,
    pub listen_port: u16,
    /// `host:port`, empty when the peer is not reachable
    pub endpoint: String,
    pub persistent_keepalive: u32,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    pub subnet_routing: bool,
    pub enable_dns: bool,
    pub upnp: bool,
    pub sync_endpoint: bool,
    pub fail_safe: bool,
}

impl Settings {
    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Blank the routing hook commands
    pub fn clear_hooks(&mut self) {
        self.pre_up.clear();
        self.post_up.clear();
        self.pre_down.clear();
        self.post_down.clear();
    }
}

/// Network-wide visibility policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    /// Users may set endpoints on their own peers
    pub user_endpoints: bool,
    /// Peers without an endpoint cannot see each other
    pub only_endpoints: bool,
}

/// A named address space and settings template shared by its peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub policies: Policies,
    pub default: Settings,
    pub created_by: String,
    pub updated_by: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Relay role of a peer within its network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    #[default]
    #[serde(rename = "")]
    Plain,
    Ingress,
    Egress,
}

/// One WireGuard interface of a device within a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    pub id: String,
    pub account_id: String,
    pub device_id: String,
    pub net_id: String,
    pub net_name: String,
    pub name: String,
    pub role: PeerRole,
    pub enable: bool,
    pub tags: Vec<String>,
    pub current: Settings,
    /// Network template copy; dropped from views served to other devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Settings>,
    pub created_by: String,
    pub updated_by: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// A machine polling for configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub description: String,
    pub api_key: String,
    pub enable: bool,
    pub os: String,
    pub platform: String,
    pub version: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Role of an account member
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountRole {
    Owner,
    Admin,
    #[default]
    User,
    Guest,
}

/// Membership status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    #[default]
    Pending,
    Suspended,
}

/// A tenant account membership
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub id: String,
    /// Root account of the hierarchy; equals `id` for the root itself
    pub parent: String,
    pub email: String,
    pub name: String,
    pub role: AccountRole,
    pub status: AccountStatus,
    /// Restricts the member to a single network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,
}

/// Kind of relay a service provisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    /// Forwards traffic between the network's own pools
    #[default]
    Relay,
    /// Full tunnel: the network's pools plus every default route
    Tunnel,
    Ingress,
    Egress,
}

/// A provisioned relay: a device and its peer on a (possibly shared) network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub description: String,
    pub service_type: ServiceType,
    pub service_port: u16,
    /// Pool of a network created for the service
    pub default_subnet: String,
    pub api_key: String,
    /// Existing network to join; empty to find or create one by `net_name`
    pub net_id: String,
    pub net_name: String,
    /// DNS servers of a network created for the service
    pub dns: Vec<String>,
    /// Existing device to use; empty to create one
    pub device_id: String,
    pub peer_id: String,
    /// Peer settings requested at creation, not persisted
    #[serde(skip_serializing)]
    pub settings: Option<Settings>,
    pub created_by: String,
    pub updated_by: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Peers a device may see within one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub net_id: String,
    pub net_name: String,
    pub description: String,
    pub vpns: Vec<Peer>,
}

/// Full status document served to a polling device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub version: String,
    pub name: String,
    pub id: String,
    pub device: Device,
    pub config: Vec<NetworkConfig>,
}
