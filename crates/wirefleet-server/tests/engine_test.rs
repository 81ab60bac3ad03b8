//! Engine tests against an in-memory store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wirefleet_core::{
    Account, AccountRole, AccountStatus, Device, FleetError, Network, Peer, PeerRole, Policies,
    Result, Service, ServiceType,
};

mod common;
use common::*;

fn addresses(peer: &Peer) -> Vec<&str> {
    peer.current.address.iter().map(String::as_str).collect()
}

#[tokio::test]
async fn test_create_network_normalizes_pools() {
    let engine = create_test_engine().await;

    let net = engine
        .create_network(network("office", &["10.1.2.3", "fd00:1::7"]), "ops")
        .await
        .unwrap();

    assert!(net.id.starts_with("net-"));
    assert_eq!(net.default.address, vec!["10.1.2.0/24", "fd00:1::/64"]);
    assert_eq!(net.default.allowed_ips, net.default.address);
    assert_eq!(net.default.preshared_key.len(), 44);
    assert_eq!(net.created_by, "ops");

    let stored = engine.read_network(&net.id).await.unwrap();
    assert_eq!(stored, net);
    assert_eq!(engine.list_networks("acct-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_network_rejects_bad_input() {
    let engine = create_test_engine().await;

    let err = engine
        .create_network(network("office", &[]), "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));

    let err = engine
        .create_network(network("office", &["10.0.0.0/33"]), "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));
}

#[tokio::test]
async fn test_allocation_reuses_released_address() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();

    let p1 = engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();
    let p2 = engine.create_peer(peer(&net.id, "", "node-two"), "ops").await.unwrap();
    assert_eq!(addresses(&p1), vec!["10.0.0.1/32"]);
    assert_eq!(addresses(&p2), vec!["10.0.0.2/32"]);
    assert!(p1.current.allowed_ips.contains(&"10.0.0.1/32".to_string()));

    engine.delete_peer(&p1.id).await.unwrap();

    let p3 = engine.create_peer(peer(&net.id, "", "node-three"), "ops").await.unwrap();
    assert_eq!(addresses(&p3), vec!["10.0.0.1/32"]);
}

#[tokio::test]
async fn test_small_pool_exhausts() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("tiny", &["10.9.9.0/30"]), "ops")
        .await
        .unwrap();

    engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();
    engine.create_peer(peer(&net.id, "", "node-two"), "ops").await.unwrap();

    let err = engine
        .create_peer(peer(&net.id, "", "node-three"), "ops")
        .await
        .unwrap_err();
    assert_eq!(err, FleetError::ExhaustedPool("10.9.9.0/30".into()));

    let peers = engine
        .store()
        .list_peers(PeerFilter::Network(&net.id))
        .await
        .unwrap();
    assert_eq!(peers.len(), 2);
}

#[tokio::test]
async fn test_concurrent_allocations_are_distinct() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("busy", &["10.20.0.0/24"]), "ops")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let net_id = net.id.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_peer(peer(&net_id, "", &format!("node-{}", i)), "ops")
                .await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let created = handle.await.unwrap().unwrap();
        assert!(seen.insert(created.current.address[0].clone()));
    }
    assert_eq!(seen.len(), 16);
}

#[tokio::test]
async fn test_create_peer_inherits_defaults_and_generates_keys() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;

    let mut template = network("office", &["10.0.0.0/24"]);
    template.default.dns = vec!["1.1.1.1".into()];
    let net = engine.create_network(template, "ops").await.unwrap();

    let mut request = peer(&net.id, &device.id, "laptop");
    request.current.enable_dns = true;
    request.current.subnet_routing = true;
    request.current.post_up = String::new();
    let created = engine.create_peer(request, "ops").await.unwrap();

    assert!(created.id.starts_with("vpn-"));
    assert_eq!(created.net_name, "office");
    assert_eq!(created.account_id, "acct-1");
    assert_eq!(created.current.mtu, 1420);
    assert_eq!(created.current.dns, vec!["10.0.0.1", "1.1.1.1"]);
    assert!(created.current.post_up.contains("-i office"));
    assert_eq!(created.current.preshared_key, net.default.preshared_key);
    assert_eq!(created.current.private_key.len(), 44);
    assert_eq!(created.default.as_ref().unwrap(), &net.default);

    let mut own_keys = peer(&net.id, &device.id, "phone");
    own_keys.current.public_key = "client-generated-public".into();
    let created = engine.create_peer(own_keys, "ops").await.unwrap();
    assert_eq!(created.current.public_key, "client-generated-public");
    assert!(created.current.private_key.is_empty());
}

#[tokio::test]
async fn test_create_peer_requires_existing_network() {
    let engine = create_test_engine().await;
    let err = engine
        .create_peer(peer("net-missing", "", "node-one"), "ops")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_forced_mtu_propagation_is_idempotent() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();
    engine.create_peer(peer(&net.id, "", "node-two"), "ops").await.unwrap();

    let mut next = net.clone();
    next.default.mtu = 1280;
    let update = engine.update_network(&net.id, next.clone(), true, "ops").await.unwrap();
    let report = update.propagation.unwrap();
    assert_eq!(report.updated.len(), 2);
    assert!(report.failed.is_empty());

    let peers = engine
        .store()
        .list_peers(PeerFilter::Network(&net.id))
        .await
        .unwrap();
    for p in &peers {
        assert_eq!(p.current.mtu, 1280);
        assert_eq!(p.default.as_ref().unwrap().mtu, 1280);
    }

    // same defaults again: nothing to push
    let update = engine.update_network(&net.id, next, true, "ops").await.unwrap();
    assert!(update.propagation.is_none());
    let again = engine
        .store()
        .list_peers(PeerFilter::Network(&net.id))
        .await
        .unwrap();
    assert_eq!(
        again.iter().map(|p| p.current.clone()).collect::<Vec<_>>(),
        peers.iter().map(|p| p.current.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_unforced_update_leaves_peers_alone() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p = engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();

    let mut next = net.clone();
    next.default.mtu = 1380;
    let update = engine.update_network(&net.id, next, false, "ops").await.unwrap();
    assert!(update.propagation.is_none());
    assert_eq!(update.network.default.mtu, 1380);

    let stored = engine.read_peer(&p.id).await.unwrap();
    assert_eq!(stored.current.mtu, 1420);
}

#[tokio::test]
async fn test_rename_reaches_peers() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p = engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();

    let mut next = net.clone();
    next.name = "hq".into();
    engine.update_network(&net.id, next, false, "ops").await.unwrap();

    assert_eq!(engine.read_peer(&p.id).await.unwrap().net_name, "hq");
}

#[tokio::test]
async fn test_forced_address_change_reallocates() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p1 = engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();
    let p2 = engine.create_peer(peer(&net.id, "", "node-two"), "ops").await.unwrap();

    let mut next = net.clone();
    next.default.address = vec!["10.1.0.0/24".into()];
    let report = engine
        .update_network(&net.id, next, true, "ops")
        .await
        .unwrap()
        .propagation
        .unwrap();
    assert_eq!(report.updated.len(), 2);

    let p1 = engine.read_peer(&p1.id).await.unwrap();
    let p2 = engine.read_peer(&p2.id).await.unwrap();
    assert_eq!(addresses(&p1), vec!["10.1.0.1/32"]);
    assert_eq!(addresses(&p2), vec!["10.1.0.2/32"]);
    assert!(!p1.current.allowed_ips.contains(&"10.0.0.1/32".to_string()));
    assert!(p1.current.allowed_ips.contains(&"10.1.0.1/32".to_string()));
    assert_eq!(p1.default.as_ref().unwrap().address, vec!["10.1.0.0/24"]);
}

#[tokio::test]
async fn test_allowed_ips_exceptions_survive_propagation() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();

    let mut request = peer(&net.id, "", "router");
    request.current.allowed_ips = vec!["10.0.0.0/24".into(), "192.168.50.0/24".into()];
    let p = engine.create_peer(request, "ops").await.unwrap();

    let mut next = net.clone();
    next.default.allowed_ips = vec!["10.0.0.0/24".into(), "172.20.0.0/16".into()];
    engine.update_network(&net.id, next, true, "ops").await.unwrap();

    let p = engine.read_peer(&p.id).await.unwrap();
    assert_eq!(
        p.current.allowed_ips,
        vec!["10.0.0.0/24", "172.20.0.0/16", "192.168.50.0/24", "10.0.0.1/32"]
    );
}

#[tokio::test]
async fn test_update_peer_checks_id() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p = engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();

    let mut other = p.clone();
    other.id = "vpn-other".into();
    let err = engine.update_peer(&p.id, other, "ops").await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));
}

#[tokio::test]
async fn test_update_peer_reallocates_when_pools_move() {
    let engine = create_test_engine().await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p = engine.create_peer(peer(&net.id, "", "node-one"), "ops").await.unwrap();

    let mut moved = p.clone();
    moved.current.address.clear();
    moved.current.allowed_ips.clear();
    moved.default.as_mut().unwrap().address = vec!["10.5.0.0/24".into()];

    let updated = engine.update_peer(&p.id, moved, "ops").await.unwrap();
    assert_eq!(addresses(&updated), vec!["10.5.0.1/32"]);
    assert_eq!(updated.created, p.created);

    // an empty address without moved pools is rejected
    let mut broken = updated.clone();
    broken.current.address.clear();
    let err = engine.update_peer(&p.id, broken, "ops").await.unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));
}

#[tokio::test]
async fn test_status_cache_coherence() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    engine.create_peer(peer(&net.id, &device.id, "laptop"), "ops").await.unwrap();

    let first = match engine.poll(&device, None, None).await.unwrap() {
        Poll::Fresh(snapshot) => snapshot,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(first.status.config.len(), 1);

    match engine.poll(&device, Some(&first.etag), None).await.unwrap() {
        Poll::NotModified { etag } => assert_eq!(etag, first.etag),
        other => panic!("unexpected {:?}", other),
    }

    engine.create_peer(peer(&net.id, "", "server"), "ops").await.unwrap();

    match engine.poll(&device, Some(&first.etag), None).await.unwrap() {
        Poll::Fresh(second) => {
            assert_ne!(second.etag, first.etag);
            assert_eq!(second.status.config[0].vpns.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_moving_a_peer_invalidates_its_old_device() {
    let engine = create_test_engine().await;
    let laptop = create_device(&engine, "laptop").await;
    let desktop = create_device(&engine, "desktop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p = engine.create_peer(peer(&net.id, &laptop.id, "laptop"), "ops").await.unwrap();

    let first = match engine.poll(&laptop, None, None).await.unwrap() {
        Poll::Fresh(snapshot) => snapshot,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(first.status.config.len(), 1);

    let mut moved = p.clone();
    moved.device_id = desktop.id.clone();
    engine.update_peer(&p.id, moved, "ops").await.unwrap();

    match engine.poll(&laptop, Some(&first.etag), None).await.unwrap() {
        Poll::Fresh(second) => assert!(second.status.config.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
}

/// Store that stalls once, right after a network's peers were read
struct StallingStore {
    inner: Arc<dyn Store>,
    armed: AtomicBool,
}

#[async_trait]
impl Store for StallingStore {
    async fn load_network(&self, id: &str) -> Result<Network> {
        self.inner.load_network(id).await
    }
    async fn save_network(&self, network: &Network) -> Result<()> {
        self.inner.save_network(network).await
    }
    async fn delete_network(&self, id: &str) -> Result<()> {
        self.inner.delete_network(id).await
    }
    async fn list_networks(&self, account_id: &str) -> Result<Vec<Network>> {
        self.inner.list_networks(account_id).await
    }

    async fn load_peer(&self, id: &str) -> Result<Peer> {
        self.inner.load_peer(id).await
    }
    async fn save_peer(&self, peer: &Peer) -> Result<()> {
        self.inner.save_peer(peer).await
    }
    async fn delete_peer(&self, id: &str) -> Result<()> {
        self.inner.delete_peer(id).await
    }
    async fn list_peers(&self, filter: PeerFilter<'_>) -> Result<Vec<Peer>> {
        let peers = self.inner.list_peers(filter).await?;
        if matches!(filter, PeerFilter::Network(_)) && self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(peers)
    }

    async fn load_device(&self, id: &str) -> Result<Device> {
        self.inner.load_device(id).await
    }
    async fn load_device_by_api_key(&self, api_key: &str) -> Result<Device> {
        self.inner.load_device_by_api_key(api_key).await
    }
    async fn save_device(&self, device: &Device) -> Result<()> {
        self.inner.save_device(device).await
    }
    async fn delete_device(&self, id: &str) -> Result<()> {
        self.inner.delete_device(id).await
    }
    async fn touch_device(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_device(id, at).await
    }

    async fn load_service(&self, id: &str) -> Result<Service> {
        self.inner.load_service(id).await
    }
    async fn save_service(&self, service: &Service) -> Result<()> {
        self.inner.save_service(service).await
    }
    async fn delete_service(&self, id: &str) -> Result<()> {
        self.inner.delete_service(id).await
    }
    async fn list_services(&self, account_id: &str) -> Result<Vec<Service>> {
        self.inner.list_services(account_id).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_status_built_across_a_write_is_not_cached() {
    let store = Arc::new(StallingStore {
        inner: create_test_store().await,
        armed: AtomicBool::new(false),
    });
    let engine = engine_with_store(store.clone());
    let device = create_device(&engine, "laptop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    engine.create_peer(peer(&net.id, &device.id, "laptop"), "ops").await.unwrap();

    store.armed.store(true, Ordering::SeqCst);
    let slow_poll = {
        let engine = engine.clone();
        let device = device.clone();
        tokio::spawn(async move { engine.poll(&device, None, None).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.create_peer(peer(&net.id, "", "server"), "ops").await.unwrap();

    let stale = match slow_poll.await.unwrap().unwrap() {
        Poll::Fresh(snapshot) => snapshot,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(stale.status.config[0].vpns.len(), 1);

    match engine.poll(&device, Some(&stale.etag), None).await.unwrap() {
        Poll::Fresh(current) => {
            assert_ne!(current.etag, stale.etag);
            assert_eq!(current.status.config[0].vpns.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_topology_through_engine() {
    let engine = create_test_engine().await;
    let plain = create_device(&engine, "plain").await;
    let ingress = create_device(&engine, "ingress").await;
    let egress = create_device(&engine, "egress").await;

    let net = engine
        .create_network(network("relay", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();

    engine.create_peer(peer(&net.id, &plain.id, "plain"), "ops").await.unwrap();
    let mut i = peer(&net.id, &ingress.id, "ingress");
    i.role = PeerRole::Ingress;
    i.current.allowed_ips = vec!["0.0.0.0/0".into(), "::/0".into()];
    let i = engine.create_peer(i, "ops").await.unwrap();
    let mut e = peer(&net.id, &egress.id, "egress");
    e.role = PeerRole::Egress;
    let e = engine.create_peer(e, "ops").await.unwrap();

    let status = engine.build_status(&egress, None).await.unwrap().status;
    let vpns = &status.config[0].vpns;
    assert_eq!(
        vpns.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        vec![i.id.as_str(), e.id.as_str()]
    );
    assert_eq!(vpns[0].current.allowed_ips, vec!["10.0.0.2/32"]);
    assert!(vpns[0].current.private_key.is_empty());

    let status = engine.build_status(&plain, None).await.unwrap().status;
    let ids: Vec<&str> = status.config[0].vpns.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&e.id.as_str()));

    let status = engine.build_status(&ingress, None).await.unwrap().status;
    assert_eq!(status.config[0].vpns.len(), 3);
}

#[tokio::test]
async fn test_only_endpoints_policy_in_status() {
    let engine = create_test_engine().await;
    let client = create_device(&engine, "client").await;
    let server = create_device(&engine, "server").await;

    let mut template = network("hub", &["10.0.0.0/24"]);
    template.policies = Policies {
        only_endpoints: true,
        ..Default::default()
    };
    let net = engine.create_network(template, "ops").await.unwrap();

    engine.create_peer(peer(&net.id, &client.id, "client"), "ops").await.unwrap();
    engine.create_peer(peer(&net.id, "", "other-client"), "ops").await.unwrap();
    let mut hub = peer(&net.id, &server.id, "hub");
    hub.current.endpoint = "203.0.113.7:51820".into();
    engine.create_peer(hub, "ops").await.unwrap();

    let status = engine.build_status(&client, None).await.unwrap().status;
    let names: Vec<&str> = status.config[0].vpns.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["client", "hub"]);

    let status = engine.build_status(&server, None).await.unwrap().status;
    assert_eq!(status.config[0].vpns.len(), 3);
}

#[tokio::test]
async fn test_sync_endpoint_follows_source_address() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "roamer").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();

    let mut request = peer(&net.id, &device.id, "roamer");
    request.current.endpoint = "198.51.100.1:51820".into();
    request.current.sync_endpoint = true;
    let p = engine.create_peer(request, "ops").await.unwrap();
    assert!(p.current.sync_endpoint);

    let source: IpAddr = "203.0.113.5".parse().unwrap();
    let snapshot = engine.build_status(&device, Some(source)).await.unwrap();
    assert_eq!(
        snapshot.status.config[0].vpns[0].current.endpoint,
        "203.0.113.5:51820"
    );

    let stored = engine.read_peer(&p.id).await.unwrap();
    assert_eq!(stored.current.endpoint, "203.0.113.5:51820");
    assert_eq!(stored.current.listen_port, 51820);
}

#[tokio::test]
async fn test_sync_endpoint_needs_a_proven_endpoint() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "roamer").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();

    let mut request = peer(&net.id, &device.id, "roamer");
    request.current.sync_endpoint = true;
    let p = engine.create_peer(request, "ops").await.unwrap();
    assert!(!p.current.sync_endpoint);

    engine
        .build_status(&device, Some("203.0.113.5".parse().unwrap()))
        .await
        .unwrap();
    assert!(engine.read_peer(&p.id).await.unwrap().current.endpoint.is_empty());
}

#[tokio::test]
async fn test_poll_records_last_seen() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    engine.create_peer(peer(&net.id, &device.id, "laptop"), "ops").await.unwrap();

    engine.poll(&device, None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = engine.read_device(&device.id).await.unwrap();
    assert!(stored.last_seen.is_some());
    assert_eq!(stored.name, "laptop");
}

#[tokio::test]
async fn test_cached_poll_refreshes_last_seen() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    engine.create_peer(peer(&net.id, &device.id, "laptop"), "ops").await.unwrap();

    let first = match engine.poll(&device, None, None).await.unwrap() {
        Poll::Fresh(snapshot) => snapshot,
        other => panic!("unexpected {:?}", other),
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let first_seen = engine.read_device(&device.id).await.unwrap().last_seen.unwrap();

    match engine.poll(&device, Some(&first.etag), None).await.unwrap() {
        Poll::NotModified { etag } => assert_eq!(etag, first.etag),
        other => panic!("unexpected {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second_seen = engine.read_device(&device.id).await.unwrap().last_seen.unwrap();

    assert!(second_seen > first_seen);
}

#[tokio::test]
async fn test_authenticate_device() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;
    let other = create_device(&engine, "desktop").await;

    assert_eq!(
        engine
            .authenticate_device(&device.id, &device.api_key)
            .await
            .unwrap()
            .id,
        device.id
    );
    assert!(matches!(
        engine.authenticate_device(&device.id, &other.api_key).await,
        Err(FleetError::Unauthorized(_))
    ));
    assert!(matches!(
        engine.authenticate_device(&device.id, "device-api-bogus").await,
        Err(FleetError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_delete_network_cascades() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let p = engine.create_peer(peer(&net.id, &device.id, "laptop"), "ops").await.unwrap();
    engine.poll(&device, None, None).await.unwrap();
    assert!(engine.cache().get(&device.id).is_some());

    engine.delete_network(&net.id).await.unwrap();

    assert!(engine.read_network(&net.id).await.unwrap_err().is_not_found());
    assert!(engine.read_peer(&p.id).await.unwrap_err().is_not_found());
    assert!(engine.cache().get(&device.id).is_none());

    let status = engine.build_status(&device, None).await.unwrap().status;
    assert!(status.config.is_empty());
}

#[tokio::test]
async fn test_delete_device_cascades() {
    let engine = create_test_engine().await;
    let device = create_device(&engine, "laptop").await;
    let net = engine
        .create_network(network("office", &["10.0.0.0/24"]), "ops")
        .await
        .unwrap();
    let mine = engine.create_peer(peer(&net.id, &device.id, "laptop"), "ops").await.unwrap();
    let other = engine.create_peer(peer(&net.id, "", "server"), "ops").await.unwrap();

    engine.delete_device(&device.id).await.unwrap();

    assert!(engine.read_device(&device.id).await.unwrap_err().is_not_found());
    assert!(engine.read_peer(&mine.id).await.unwrap_err().is_not_found());
    assert!(engine.read_peer(&other.id).await.is_ok());
    assert!(engine.delete_device(&device.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_visible_peers_for_account() {
    let engine = create_test_engine().await;
    let mut template = network("hub", &["10.0.0.0/24"]);
    template.policies.only_endpoints = true;
    let net = engine.create_network(template, "admin@example.com").await.unwrap();

    let mut server = peer(&net.id, "", "server");
    server.current.endpoint = "203.0.113.7:51820".into();
    let server = engine.create_peer(server, "admin@example.com").await.unwrap();
    let client = engine
        .create_peer(peer(&net.id, "", "client"), "admin@example.com")
        .await
        .unwrap();
    let mine = engine
        .create_peer(peer(&net.id, "", "mine"), "user@example.com")
        .await
        .unwrap();

    let member = Account {
        id: "member-1".into(),
        parent: "acct-1".into(),
        email: "user@example.com".into(),
        role: AccountRole::User,
        status: AccountStatus::Active,
        ..Default::default()
    };

    let visible = engine
        .visible_peers_for_account("user@example.com", &[member.clone(), member.clone()])
        .await
        .unwrap();
    let ids: Vec<&str> = visible.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec![server.id.as_str(), mine.id.as_str()]);
    assert!(visible[0].current.private_key.is_empty());
    assert!(!visible[1].current.private_key.is_empty());

    let admin = Account {
        role: AccountRole::Admin,
        ..member.clone()
    };
    let visible = engine
        .visible_peers_for_account("user@example.com", &[admin])
        .await
        .unwrap();
    assert_eq!(visible.len(), 3);
    assert!(visible.iter().any(|p| p.id == client.id));

    let suspended = Account {
        status: AccountStatus::Suspended,
        ..member
    };
    assert!(engine
        .visible_peers_for_account("user@example.com", &[suspended])
        .await
        .unwrap()
        .is_empty());
}

fn service(name: &str, net_name: &str, service_type: ServiceType) -> Service {
    Service {
        account_id: "acct-1".into(),
        name: name.into(),
        net_name: net_name.into(),
        service_type,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_services_provision_a_relay_pair() {
    let engine = create_test_engine().await;

    let ingress = engine
        .create_service(service("edge-in", "relay", ServiceType::Ingress), "ops")
        .await
        .unwrap();
    let egress = engine
        .create_service(service("edge-out", "relay", ServiceType::Egress), "ops")
        .await
        .unwrap();

    assert!(ingress.api_key.starts_with("service-api-"));
    assert_eq!(ingress.service_port, 30001);
    assert_eq!(ingress.default_subnet, "10.10.10.0/24");
    assert_eq!(ingress.net_id, egress.net_id);
    assert_eq!(engine.list_networks("acct-1").await.unwrap().len(), 1);
    assert_eq!(engine.list_services("acct-1").await.unwrap().len(), 2);

    let net = engine.read_network(&ingress.net_id).await.unwrap();
    assert_eq!(net.name, "relay");
    assert_eq!(net.default.dns, vec!["8.8.8.8"]);

    let i = engine.read_peer(&ingress.peer_id).await.unwrap();
    assert_eq!(i.role, PeerRole::Ingress);
    assert_eq!(i.name, "ingress.relay");
    assert_eq!(
        i.current.allowed_ips,
        vec!["10.10.10.0/24", "0.0.0.0/0", "::/0", "10.10.10.1/32"]
    );
    assert_eq!(i.current.persistent_keepalive, 23);
    assert!(!i.current.sync_endpoint);
    assert!(i.current.post_up.starts_with("iptables -A FORWARD -i relay"));

    let e = engine.read_peer(&egress.peer_id).await.unwrap();
    assert_eq!(e.role, PeerRole::Egress);
    assert_eq!(e.current.allowed_ips, vec!["0.0.0.0/0", "10.10.10.2/32"]);

    let egress_device = engine.read_device(&egress.device_id).await.unwrap();
    assert_eq!(egress_device.name, "egress.relay");
    assert_eq!(egress_device.platform, "Linux");

    let status = engine.build_status(&egress_device, None).await.unwrap().status;
    let vpns = &status.config[0].vpns;
    assert_eq!(
        vpns.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        vec![i.id.as_str(), e.id.as_str()]
    );
    assert_eq!(vpns[0].current.allowed_ips, vec!["10.10.10.0/24", "10.10.10.1/32"]);

    let laptop = create_device(&engine, "laptop").await;
    engine
        .create_peer(peer(&ingress.net_id, &laptop.id, "laptop"), "ops")
        .await
        .unwrap();
    let status = engine.build_status(&laptop, None).await.unwrap().status;
    let ids: Vec<&str> = status.config[0].vpns.iter().map(|p| p.id.as_str()).collect();
    assert!(ids.contains(&i.id.as_str()));
    assert!(!ids.contains(&e.id.as_str()));
}

#[tokio::test]
async fn test_delete_service_removes_its_records() {
    let engine = create_test_engine().await;

    let ingress = engine
        .create_service(service("edge-in", "relay", ServiceType::Ingress), "ops")
        .await
        .unwrap();
    let egress = engine
        .create_service(service("edge-out", "relay", ServiceType::Egress), "ops")
        .await
        .unwrap();

    engine.delete_service(&ingress.id).await.unwrap();
    assert!(engine.read_peer(&ingress.peer_id).await.unwrap_err().is_not_found());
    assert!(engine.read_device(&ingress.device_id).await.unwrap_err().is_not_found());
    assert!(engine.read_service(&ingress.id).await.unwrap_err().is_not_found());
    // the egress still uses the network
    assert!(engine.read_network(&ingress.net_id).await.is_ok());

    engine.delete_service(&egress.id).await.unwrap();
    assert!(engine.read_network(&egress.net_id).await.unwrap_err().is_not_found());
    assert!(engine.list_services("acct-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_service_rejects_bad_subnet() {
    let engine = create_test_engine().await;

    let mut bad = service("edge-in", "relay", ServiceType::Relay);
    bad.default_subnet = "10.10.10.0/33".into();
    let err = engine.create_service(bad, "ops").await.unwrap_err();

    assert!(matches!(err, FleetError::Validation(_)));
    assert!(engine.list_networks("acct-1").await.unwrap().is_empty());
}
