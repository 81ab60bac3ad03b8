//! Configuration distribution engine
//!
//! Orchestrates the write paths (networks, peers, devices, services) and
//! the poll path. Address allocation for a network always runs under that
//! network's lock; every write ends by invalidating the cached status of
//! each device that holds a peer in the affected networks.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use wirefleet_core::address::{allocate_all, normalize_pool, reserved_addresses};
use wirefleet_core::crypto::{
    ensure_peer_keys, generate_api_key, generate_preshared_key, generate_service_api_key,
};
use wirefleet_core::propagate::{apply_to_peer, DefaultsChange};
use wirefleet_core::service::{
    DEFAULT_SERVICE_PORT, DEFAULT_SERVICE_SUBNET, FAILSAFE_DNS, SERVICE_KEEPALIVE,
};
use wirefleet_core::topology;
use wirefleet_core::validate::{
    sanitize_hooks, validate_device, validate_network, validate_peer, validate_service,
};
use wirefleet_core::{
    new_id, Account, AccountRole, AccountStatus, Device, FleetError, Network, NetworkConfig, Peer,
    PeerRole, Result, Service, Settings, Status,
};

use crate::cache::StatusCache;
use crate::locks::KeyedLocks;
use crate::metrics;
use crate::snapshot::{etag_matches, seal, Snapshot};
use crate::store::{PeerFilter, Store};

/// Listen port assumed when a synced peer has none configured
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// DNS resolver address used by darwin clients
const DARWIN_DNS: &str = "127.0.0.1";

/// Outcome of a device poll
#[derive(Debug, Clone)]
pub enum Poll {
    NotModified { etag: String },
    Fresh(Arc<Snapshot>),
}

/// Peers touched by a forced defaults propagation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkUpdate {
    pub network: Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationReport>,
}

pub struct Engine {
    store: Arc<dyn Store>,
    cache: Arc<dyn StatusCache>,
    network_locks: KeyedLocks,
    account_locks: KeyedLocks,
    server_name: String,
}

fn push_unique(list: &mut Vec<String>, entry: &str) {
    if !list.iter().any(|e| e == entry) {
        list.push(entry.to_string());
    }
}

fn normalize_pools(settings: &mut Settings) -> Result<()> {
    settings.address = settings
        .address
        .iter()
        .map(|pool| normalize_pool(pool))
        .collect::<Result<Vec<_>>>()?;
    Ok(())
}

/// Put the peer's own resolver first in its DNS list
fn apply_dns(settings: &mut Settings, device: Option<&Device>) {
    if !settings.enable_dns {
        return;
    }

    let resolver = match device {
        Some(device) if device.os == "darwin" => DARWIN_DNS.to_string(),
        _ => match settings.address.first() {
            Some(address) => address.split('/').next().unwrap_or_default().to_string(),
            None => return,
        },
    };

    if !settings.dns.contains(&resolver) {
        settings.dns.insert(0, resolver);
    }
}

/// Default forwarding hooks for a subnet router
fn apply_subnet_hooks(settings: &mut Settings, interface: &str) {
    if settings.subnet_routing {
        fill_forwarding_hooks(settings, interface);
    }
}

/// NAT forwarding through `interface`, for hooks left empty
fn fill_forwarding_hooks(settings: &mut Settings, interface: &str) {
    if settings.post_up.is_empty() {
        settings.post_up = format!(
            "iptables -A FORWARD -i {0} -j ACCEPT; iptables -A FORWARD -o {0} -j ACCEPT; iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE",
            interface
        );
    }
    if settings.post_down.is_empty() {
        settings.post_down = format!(
            "iptables -D FORWARD -i {0} -j ACCEPT; iptables -D FORWARD -o {0} -j ACCEPT; iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE",
            interface
        );
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn StatusCache>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            network_locks: KeyedLocks::new(),
            account_locks: KeyedLocks::new(),
            server_name: server_name.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn StatusCache> {
        &self.cache
    }

    /// Lock a network, then load it. A missing network leaves no lock behind.
    async fn lock_network(&self, id: &str) -> Result<(OwnedMutexGuard<()>, Network)> {
        let guard = self.network_locks.acquire(id).await;
        match self.store.load_network(id).await {
            Ok(network) => Ok((guard, network)),
            Err(e) => {
                drop(guard);
                if e.is_not_found() {
                    self.network_locks.forget(id);
                }
                Err(e)
            }
        }
    }

    /// Allocate one host per pool, recording the outcome
    fn allocate(&self, pools: &[String], reserved: &mut HashSet<IpAddr>) -> Result<Vec<String>> {
        let result = allocate_all(pools, reserved);
        metrics::record_allocation(result.is_ok());
        result
    }

    // === Networks ===

    pub async fn create_network(&self, mut network: Network, actor: &str) -> Result<Network> {
        network.id = new_id("net");
        normalize_pools(&mut network.default)?;

        if network.default.allowed_ips.is_empty() {
            network.default.allowed_ips = network.default.address.clone();
        }
        if network.default.preshared_key.is_empty() {
            network.default.preshared_key = generate_preshared_key();
        }

        let now = Utc::now();
        network.created = Some(now);
        network.updated = Some(now);
        network.created_by = actor.to_string();
        network.updated_by = actor.to_string();

        validate_network(&network)?;
        self.store.save_network(&network).await?;

        tracing::info!(
            net = %network.id,
            name = %network.name,
            pools = ?network.default.address,
            "created network"
        );
        Ok(network)
    }

    pub async fn read_network(&self, id: &str) -> Result<Network> {
        self.store.load_network(id).await
    }

    pub async fn list_networks(&self, account_id: &str) -> Result<Vec<Network>> {
        self.store.list_networks(account_id).await
    }

    /// Replace a network's fields.
    ///
    /// With `force` set, changed defaults are pushed onto every peer of the
    /// network. A rename always reaches the peers.
    pub async fn update_network(
        &self,
        id: &str,
        mut network: Network,
        force: bool,
        actor: &str,
    ) -> Result<NetworkUpdate> {
        let (_guard, previous) = self.lock_network(id).await?;

        if !network.id.is_empty() && network.id != previous.id {
            return Err(FleetError::Conflict("records id mismatch".to_string()));
        }

        network.id = previous.id.clone();
        network.account_id = previous.account_id.clone();
        network.created = previous.created;
        network.created_by = previous.created_by.clone();
        network.updated = Some(Utc::now());
        network.updated_by = actor.to_string();

        normalize_pools(&mut network.default)?;
        if network.default.allowed_ips.is_empty() {
            network.default.allowed_ips = network.default.address.clone();
        }
        if network.default.preshared_key.is_empty() {
            network.default.preshared_key = previous.default.preshared_key.clone();
        }

        validate_network(&network)?;
        self.store.save_network(&network).await?;

        let change = DefaultsChange::between(&previous.default, &network.default);
        let propagate = force && !change.is_empty();
        let renamed = network.name != previous.name;

        let propagation = if propagate || renamed {
            let report = self
                .rewrite_peers(&network, &previous.default, propagate.then_some(change), actor)
                .await?;
            tracing::info!(
                net = %network.id,
                updated = report.updated.len(),
                failed = report.failed.len(),
                "propagated network defaults"
            );
            Some(report)
        } else {
            None
        };

        self.invalidate_network(&network.id).await;

        Ok(NetworkUpdate {
            network,
            propagation,
        })
    }

    /// Apply new defaults and the current network name to every peer.
    ///
    /// Must be called with the network lock held. Peers whose address was
    /// released get a new one from the new pools. Per-peer failures are
    /// logged and reported, the batch continues.
    async fn rewrite_peers(
        &self,
        network: &Network,
        old: &Settings,
        change: Option<DefaultsChange>,
        actor: &str,
    ) -> Result<PropagationReport> {
        let mut peers = self
            .store
            .list_peers(PeerFilter::Network(&network.id))
            .await?;

        let mut dirty = Vec::with_capacity(peers.len());
        for peer in peers.iter_mut() {
            let mut changed = match change {
                Some(change) => apply_to_peer(peer, old, &network.default, change),
                None => false,
            };
            if peer.net_name != network.name {
                peer.net_name = network.name.clone();
                changed = true;
            }
            dirty.push(changed);
        }

        let mut reserved = reserved_addresses(peers.iter());
        let mut report = PropagationReport::default();
        let now = Utc::now();

        for (peer, changed) in peers.iter_mut().zip(dirty) {
            if !changed {
                continue;
            }

            if peer.current.address.is_empty() {
                match self.allocate(&network.default.address, &mut reserved) {
                    Ok(hosts) => {
                        for host in &hosts {
                            push_unique(&mut peer.current.allowed_ips, host);
                        }
                        peer.current.address = hosts;
                    }
                    Err(e) => {
                        tracing::error!(peer = %peer.id, error = %e, "failed to re-allocate peer address");
                        metrics::record_propagation_failure();
                        report.failed.push(peer.id.clone());
                        continue;
                    }
                }
            }

            peer.updated = Some(now);
            peer.updated_by = actor.to_string();

            match self.store.save_peer(peer).await {
                Ok(()) => report.updated.push(peer.id.clone()),
                Err(e) => {
                    tracing::error!(peer = %peer.id, error = %e, "failed to save propagated peer");
                    metrics::record_propagation_failure();
                    report.failed.push(peer.id.clone());
                }
            }
        }

        Ok(report)
    }

    /// Delete a network and every peer in it
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let (guard, network) = self.lock_network(id).await?;
        let peers = self
            .store
            .list_peers(PeerFilter::Network(&network.id))
            .await?;

        for peer in &peers {
            self.store.delete_peer(&peer.id).await?;
        }
        self.store.delete_network(&network.id).await?;

        drop(guard);
        self.network_locks.forget(&network.id);

        let devices: HashSet<&str> = peers.iter().map(|p| p.device_id.as_str()).collect();
        for device_id in &devices {
            self.cache.delete(device_id);
        }
        metrics::record_invalidations(devices.len());

        tracing::info!(net = %network.id, peers = peers.len(), "deleted network");
        Ok(())
    }

    // === Peers ===

    /// Join a device to a network.
    ///
    /// The peer starts from the network defaults; the caller may supply
    /// keys, endpoint, listen port, hooks, keepalive, extra allowed IPs and
    /// opt-in flags. One address per pool is allocated.
    pub async fn create_peer(&self, request: Peer, actor: &str) -> Result<Peer> {
        let (guard, network) = self.lock_network(&request.net_id).await?;
        let device = if request.device_id.is_empty() {
            None
        } else {
            Some(self.store.load_device(&request.device_id).await?)
        };

        let now = Utc::now();
        let requested = request.current;
        let mut current = network.default.clone();

        current.listen_port = requested.listen_port;
        current.endpoint = requested.endpoint;
        current.private_key = requested.private_key;
        current.public_key = requested.public_key;
        current.pre_up = requested.pre_up;
        current.post_up = requested.post_up;
        current.pre_down = requested.pre_down;
        current.post_down = requested.post_down;
        current.persistent_keepalive = requested.persistent_keepalive;
        current.allowed_ips = requested.allowed_ips;
        current.address.clear();
        current.fail_safe |= requested.fail_safe;
        current.enable_dns |= requested.enable_dns;
        current.subnet_routing |= requested.subnet_routing;
        current.upnp |= requested.upnp;
        current.sync_endpoint = requested.sync_endpoint && current.has_endpoint();

        if ensure_peer_keys(&mut current) {
            tracing::debug!(net = %network.id, "generated a new key pair");
        }

        let mut peer = Peer {
            id: new_id("vpn"),
            account_id: network.account_id.clone(),
            device_id: request.device_id,
            net_id: network.id.clone(),
            net_name: network.name.clone(),
            name: request.name,
            role: request.role,
            enable: request.enable,
            tags: request.tags,
            current,
            default: Some(network.default.clone()),
            created_by: actor.to_string(),
            updated_by: actor.to_string(),
            created: Some(now),
            updated: Some(now),
        };

        let siblings = self
            .store
            .list_peers(PeerFilter::Network(&network.id))
            .await?;
        let mut reserved = reserved_addresses(siblings.iter());

        let hosts = self.allocate(&network.default.address, &mut reserved)?;
        for host in &hosts {
            push_unique(&mut peer.current.allowed_ips, host);
        }
        peer.current.address = hosts;

        apply_dns(&mut peer.current, device.as_ref());
        apply_subnet_hooks(&mut peer.current, &peer.net_name);
        sanitize_hooks(&mut peer.current);

        validate_peer(&peer)?;
        self.store.save_peer(&peer).await?;
        drop(guard);

        tracing::info!(
            peer = %peer.id,
            net = %peer.net_id,
            address = ?peer.current.address,
            "created peer"
        );

        self.invalidate_network(&peer.net_id).await;
        Ok(peer)
    }

    pub async fn read_peer(&self, id: &str) -> Result<Peer> {
        self.store.load_peer(id).await
    }

    /// Replace a peer.
    ///
    /// An empty address is re-allocated when the peer's default pools
    /// moved.
    pub async fn update_peer(&self, id: &str, mut peer: Peer, actor: &str) -> Result<Peer> {
        let previous = self.store.load_peer(id).await?;

        if peer.id.is_empty() {
            peer.id = previous.id.clone();
        }
        if peer.id != previous.id {
            return Err(FleetError::Conflict("records id mismatch".to_string()));
        }
        if peer.net_id.is_empty() {
            peer.net_id = previous.net_id.clone();
        }
        if peer.net_id != previous.net_id {
            return Err(FleetError::Conflict(
                "a peer cannot move between networks".to_string(),
            ));
        }

        let network = self.store.load_network(&peer.net_id).await?;
        let device = if peer.device_id.is_empty() {
            None
        } else {
            Some(self.store.load_device(&peer.device_id).await?)
        };

        peer.account_id = previous.account_id.clone();
        peer.net_name = network.name.clone();
        peer.created = previous.created;
        peer.created_by = previous.created_by.clone();
        if peer.default.is_none() {
            peer.default = previous.default.clone();
        }

        let guard = self.network_locks.acquire(&network.id).await;

        let first_pool = |settings: &Option<Settings>| {
            settings
                .as_ref()
                .and_then(|s| s.address.first().cloned())
        };
        let pools_moved = match (first_pool(&peer.default), first_pool(&previous.default)) {
            (Some(new), Some(old)) => new != old,
            _ => false,
        };

        if peer.current.address.is_empty() && pools_moved {
            let pools = peer
                .default
                .as_ref()
                .map(|d| d.address.clone())
                .unwrap_or_default();
            let siblings = self
                .store
                .list_peers(PeerFilter::Network(&network.id))
                .await?;
            let mut reserved =
                reserved_addresses(siblings.iter().filter(|p| p.id != peer.id));

            let hosts = self.allocate(&pools, &mut reserved)?;
            for host in &hosts {
                push_unique(&mut peer.current.allowed_ips, host);
            }
            peer.current.address = hosts;
        }

        apply_dns(&mut peer.current, device.as_ref());
        apply_subnet_hooks(&mut peer.current, &peer.net_name);
        sanitize_hooks(&mut peer.current);

        peer.updated = Some(Utc::now());
        peer.updated_by = actor.to_string();

        validate_peer(&peer)?;
        self.store.save_peer(&peer).await?;
        drop(guard);

        tracing::info!(peer = %peer.id, net = %peer.net_id, "updated peer");

        self.invalidate_network(&peer.net_id).await;
        if previous.device_id != peer.device_id && !previous.device_id.is_empty() {
            self.invalidate_device(&previous.device_id);
        }
        Ok(peer)
    }

    pub async fn delete_peer(&self, id: &str) -> Result<()> {
        let peer = self.store.load_peer(id).await?;
        self.store.delete_peer(&peer.id).await?;

        tracing::info!(peer = %peer.id, net = %peer.net_id, "deleted peer");

        self.invalidate_network(&peer.net_id).await;
        self.invalidate_device(&peer.device_id);
        Ok(())
    }

    // === Devices ===

    pub async fn create_device(&self, mut device: Device) -> Result<Device> {
        device.id = new_id("device");
        if device.api_key.is_empty() {
            device.api_key = generate_api_key();
        }

        let now = Utc::now();
        device.created = Some(now);
        device.updated = Some(now);
        device.last_seen = None;

        validate_device(&device)?;
        self.store.save_device(&device).await?;

        tracing::info!(device = %device.id, name = %device.name, "created device");
        Ok(device)
    }

    pub async fn read_device(&self, id: &str) -> Result<Device> {
        self.store.load_device(id).await
    }

    /// Delete a device and every peer it holds
    pub async fn delete_device(&self, id: &str) -> Result<()> {
        let device = self.store.load_device(id).await?;
        let peers = self
            .store
            .list_peers(PeerFilter::Device(&device.id))
            .await?;

        for peer in &peers {
            self.store.delete_peer(&peer.id).await?;
        }
        self.store.delete_device(&device.id).await?;

        let networks: HashSet<&str> = peers.iter().map(|p| p.net_id.as_str()).collect();
        for net_id in networks {
            self.invalidate_network(net_id).await;
        }
        self.invalidate_device(&device.id);

        tracing::info!(device = %device.id, peers = peers.len(), "deleted device");
        Ok(())
    }

    // === Services ===

    /// Provision a relay: its network (found by name or created), a device
    /// for the relay container and a peer whose role and routes follow the
    /// service type. Runs under the account's lock so two services sharing
    /// a network name do not both create it.
    pub async fn create_service(&self, mut service: Service, actor: &str) -> Result<Service> {
        service.id = new_id("service");
        if service.api_key.is_empty() {
            service.api_key = generate_service_api_key();
        }
        if service.service_port == 0 {
            service.service_port = DEFAULT_SERVICE_PORT;
        }
        if service.default_subnet.is_empty() {
            service.default_subnet = DEFAULT_SERVICE_SUBNET.to_string();
        }
        if service.net_name.is_empty() {
            service.net_name = service.name.clone();
        }

        let now = Utc::now();
        service.created = Some(now);
        service.updated = Some(now);
        service.created_by = actor.to_string();
        service.updated_by = actor.to_string();

        validate_service(&service)?;
        let _guard = self.account_locks.acquire(&service.account_id).await;

        let network = self.service_network(&service, actor).await?;
        let label = format!("{}.{}", service.service_type.label(), network.name);

        let device = if service.device_id.is_empty() {
            self.create_device(Device {
                account_id: service.account_id.clone(),
                name: label.clone(),
                description: service.description.clone(),
                enable: true,
                os: "linux".to_string(),
                platform: "Linux".to_string(),
                ..Default::default()
            })
            .await?
        } else {
            self.store.load_device(&service.device_id).await?
        };

        let mut settings = service.settings.take().unwrap_or_default();
        for route in service.service_type.routes(&network.default.address) {
            push_unique(&mut settings.allowed_ips, &route);
        }
        fill_forwarding_hooks(&mut settings, &network.name);
        settings.persistent_keepalive = SERVICE_KEEPALIVE;
        settings.sync_endpoint = service.service_type.syncs_endpoint();

        let peer = self
            .create_peer(
                Peer {
                    device_id: device.id.clone(),
                    net_id: network.id.clone(),
                    name: label,
                    role: service.service_type.role(),
                    enable: true,
                    current: settings,
                    ..Default::default()
                },
                actor,
            )
            .await?;

        service.net_id = network.id;
        service.net_name = network.name;
        service.device_id = device.id;
        service.peer_id = peer.id;
        self.store.save_service(&service).await?;

        tracing::info!(
            service = %service.id,
            kind = service.service_type.label(),
            net = %service.net_id,
            peer = %service.peer_id,
            "created service"
        );
        Ok(service)
    }

    /// The network named by a service, created when the account has none.
    /// Must be called with the account lock held.
    async fn service_network(&self, service: &Service, actor: &str) -> Result<Network> {
        if !service.net_id.is_empty() {
            return self.store.load_network(&service.net_id).await;
        }

        let existing = self
            .store
            .list_networks(&service.account_id)
            .await?
            .into_iter()
            .find(|n| n.name == service.net_name);
        if let Some(network) = existing {
            tracing::debug!(net = %network.id, "service joins an existing network");
            return Ok(network);
        }

        let dns = if service.dns.is_empty() {
            vec![FAILSAFE_DNS.to_string()]
        } else {
            service.dns.clone()
        };

        self.create_network(
            Network {
                account_id: service.account_id.clone(),
                name: service.net_name.clone(),
                description: service.description.clone(),
                default: Settings {
                    address: vec![service.default_subnet.clone()],
                    dns,
                    ..Default::default()
                },
                ..Default::default()
            },
            actor,
        )
        .await
    }

    pub async fn read_service(&self, id: &str) -> Result<Service> {
        self.store.load_service(id).await
    }

    pub async fn list_services(&self, account_id: &str) -> Result<Vec<Service>> {
        self.store.list_services(account_id).await
    }

    /// Tear a service down: its peer, its network once no peer is left, its
    /// device and the record itself. Parts already gone are skipped.
    pub async fn delete_service(&self, id: &str) -> Result<()> {
        let service = self.store.load_service(id).await?;
        let _guard = self.account_locks.acquire(&service.account_id).await;

        match self.delete_peer(&service.peer_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(service = %service.id, peer = %service.peer_id, "service peer already gone");
            }
            Err(e) => return Err(e),
        }

        let remaining = self
            .store
            .list_peers(PeerFilter::Network(&service.net_id))
            .await?;
        if remaining.is_empty() {
            match self.delete_network(&service.net_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        match self.delete_device(&service.device_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.store.delete_service(&service.id).await?;
        tracing::info!(service = %service.id, net = %service.net_id, "deleted service");
        Ok(())
    }

    // === Poll path ===

    /// Resolve a device from its api key
    pub async fn authenticate_device(&self, device_id: &str, api_key: &str) -> Result<Device> {
        let device = match self.store.load_device_by_api_key(api_key).await {
            Ok(device) => device,
            Err(e) if e.is_not_found() => {
                return Err(FleetError::Unauthorized("invalid api key".to_string()))
            }
            Err(e) => return Err(e),
        };

        if device.id != device_id {
            return Err(FleetError::Unauthorized(
                "api key does not belong to this device".to_string(),
            ));
        }
        if !device.enable {
            return Err(FleetError::Unauthorized("device is disabled".to_string()));
        }
        Ok(device)
    }

    /// Serve a poll, answering from the cache when possible.
    ///
    /// Every poll records the device as seen, cached or not. A status built
    /// while the device was invalidated is served but not cached.
    pub async fn poll(
        &self,
        device: &Device,
        if_none_match: Option<&str>,
        source_ip: Option<IpAddr>,
    ) -> Result<Poll> {
        self.touch(&device.id);

        let snapshot = match self.cache.get(&device.id) {
            Some(snapshot) => {
                metrics::record_cache_hit();
                snapshot
            }
            None => {
                let generation = self.cache.generation(&device.id);
                let snapshot = Arc::new(self.build_status(device, source_ip).await?);
                if !self
                    .cache
                    .set_if_current(&device.id, generation, snapshot.clone())
                {
                    tracing::debug!(device = %device.id, "status went stale while building");
                }
                snapshot
            }
        };

        if let Some(tag) = if_none_match {
            if etag_matches(tag, &snapshot.etag) {
                metrics::record_not_modified();
                return Ok(Poll::NotModified {
                    etag: snapshot.etag.clone(),
                });
            }
        }
        Ok(Poll::Fresh(snapshot))
    }

    /// Assemble the status document of one device from the store
    pub async fn build_status(&self, device: &Device, source_ip: Option<IpAddr>) -> Result<Snapshot> {
        let own_peers = self
            .store
            .list_peers(PeerFilter::Device(&device.id))
            .await?;

        let mut config = Vec::with_capacity(own_peers.len());
        let mut synced = Vec::new();

        for own in &own_peers {
            let network = match self.store.load_network(&own.net_id).await {
                Ok(network) => network,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(peer = %own.id, net = %own.net_id, "peer references a missing network");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut peers = self
                .store
                .list_peers(PeerFilter::Network(&network.id))
                .await?;

            if let (Some(ip), Some(peer)) =
                (source_ip, peers.iter_mut().find(|p| p.id == own.id))
            {
                if self.sync_endpoint(peer, ip, &device.name).await {
                    synced.push(network.id.clone());
                }
            }

            let visibility = topology::resolve(&peers, &device.id, network.policies);

            config.push(NetworkConfig {
                net_id: network.id,
                net_name: network.name,
                description: network.description,
                vpns: visibility.peers,
            });
        }

        let snapshot = seal(Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            name: self.server_name.clone(),
            id: device.id.clone(),
            device: device.clone(),
            config,
        })?;
        metrics::record_status_build();

        for net_id in &synced {
            self.invalidate_network(net_id).await;
        }

        tracing::debug!(device = %device.id, etag = %snapshot.etag, "built status");
        Ok(snapshot)
    }

    /// Record the last poll time in the background. Kept out of the status
    /// document so it never changes the etag.
    fn touch(&self, device_id: &str) {
        let store = self.store.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.touch_device(&device_id, Utc::now()).await {
                tracing::error!(device = %device_id, error = %e, "failed to record last seen");
            }
        });
    }

    /// Follow a roaming peer's public address.
    ///
    /// Only peers that opted in, are not the Ingress and already proved
    /// an endpoint are rewritten. Returns true when the peer was saved.
    async fn sync_endpoint(&self, peer: &mut Peer, source_ip: IpAddr, actor: &str) -> bool {
        if !peer.current.sync_endpoint
            || peer.role == PeerRole::Ingress
            || !peer.current.has_endpoint()
        {
            return false;
        }

        if peer.current.listen_port == 0 {
            peer.current.listen_port = DEFAULT_LISTEN_PORT;
        }
        let endpoint = SocketAddr::new(source_ip, peer.current.listen_port).to_string();
        if peer.current.endpoint == endpoint {
            return false;
        }

        tracing::info!(peer = %peer.id, from = %peer.current.endpoint, to = %endpoint, "syncing endpoint");
        peer.current.endpoint = endpoint;
        peer.updated_by = actor.to_string();

        match self.store.save_peer(peer).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(peer = %peer.id, error = %e, "failed to save synced endpoint");
                false
            }
        }
    }

    // === Cache invalidation ===

    /// Drop the cached status of every device holding a peer in a network.
    /// Never fails; returns how many devices were invalidated.
    pub async fn invalidate_network(&self, net_id: &str) -> usize {
        match self.store.list_peers(PeerFilter::Network(net_id)).await {
            Ok(peers) => {
                let devices: HashSet<&str> = peers.iter().map(|p| p.device_id.as_str()).collect();
                for device_id in &devices {
                    self.cache.delete(device_id);
                }
                metrics::record_invalidations(devices.len());
                tracing::debug!(net = %net_id, devices = devices.len(), "invalidated network");
                devices.len()
            }
            Err(e) => {
                tracing::warn!(net = %net_id, error = %e, "failed to invalidate network");
                0
            }
        }
    }

    pub fn invalidate_device(&self, device_id: &str) {
        self.cache.delete(device_id);
        metrics::record_invalidations(1);
    }

    // === Account views ===

    /// Peers visible to a user through their account memberships.
    ///
    /// Only active memberships count. A membership scoped to a network sees
    /// that network, otherwise every peer of the parent account. Users and
    /// guests do not see endpoint-less peers they did not create on
    /// networks restricted to endpoints. Private material of peers created
    /// by someone else is blanked.
    pub async fn visible_peers_for_account(
        &self,
        email: &str,
        accounts: &[Account],
    ) -> Result<Vec<Peer>> {
        let mut networks: HashMap<String, Option<Network>> = HashMap::new();
        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for account in accounts {
            if account.status != AccountStatus::Active {
                continue;
            }

            let peers = match &account.net_id {
                Some(net_id) if !net_id.is_empty() => {
                    self.store.list_peers(PeerFilter::Network(net_id)).await?
                }
                _ => {
                    self.store
                        .list_peers(PeerFilter::Account(&account.parent))
                        .await?
                }
            };

            let restricted = matches!(account.role, AccountRole::User | AccountRole::Guest);

            for mut peer in peers {
                if restricted {
                    if !networks.contains_key(&peer.net_id) {
                        let network = match self.store.load_network(&peer.net_id).await {
                            Ok(network) => Some(network),
                            Err(e) if e.is_not_found() => None,
                            Err(e) => return Err(e),
                        };
                        networks.insert(peer.net_id.clone(), network);
                    }

                    let only_endpoints = networks
                        .get(&peer.net_id)
                        .and_then(|n| n.as_ref())
                        .is_some_and(|n| n.policies.only_endpoints);

                    if only_endpoints && !peer.current.has_endpoint() && peer.created_by != email {
                        continue;
                    }
                }

                if !seen.insert(peer.id.clone()) {
                    continue;
                }
                if peer.created_by != email {
                    topology::redact(&mut peer);
                }
                results.push(peer);
            }
        }

        Ok(results)
    }
}
