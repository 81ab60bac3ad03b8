//! Record store
//!
//! The engine only talks to the [`Store`] trait. [`SqliteStore`] keeps one
//! JSON document per record and bounds every call with a timeout.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use std::future::Future;
use std::time::Duration;
use wirefleet_core::{Device, FleetError, Network, Peer, Result, Service};

/// Secondary key a peer listing is filtered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter<'a> {
    Network(&'a str),
    Device(&'a str),
    Account(&'a str),
}

/// Persistence boundary of the engine. Absent records yield `NotFound`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_network(&self, id: &str) -> Result<Network>;
    async fn save_network(&self, network: &Network) -> Result<()>;
    async fn delete_network(&self, id: &str) -> Result<()>;
    async fn list_networks(&self, account_id: &str) -> Result<Vec<Network>>;

    async fn load_peer(&self, id: &str) -> Result<Peer>;
    async fn save_peer(&self, peer: &Peer) -> Result<()>;
    async fn delete_peer(&self, id: &str) -> Result<()>;
    async fn list_peers(&self, filter: PeerFilter<'_>) -> Result<Vec<Peer>>;

    async fn load_device(&self, id: &str) -> Result<Device>;
    async fn load_device_by_api_key(&self, api_key: &str) -> Result<Device>;
    async fn save_device(&self, device: &Device) -> Result<()>;
    async fn delete_device(&self, id: &str) -> Result<()>;
    /// Record a poll time without rewriting the rest of the device
    async fn touch_device(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn load_service(&self, id: &str) -> Result<Service>;
    async fn save_service(&self, service: &Service) -> Result<()>;
    async fn delete_service(&self, id: &str) -> Result<()>;
    async fn list_services(&self, account_id: &str) -> Result<Vec<Service>>;

    async fn ping(&self) -> Result<()>;
}

/// The closed set of record collections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Networks,
    Peers,
    Devices,
    Services,
}

impl Collection {
    pub fn entity(self) -> &'static str {
        match self {
            Collection::Networks => "network",
            Collection::Peers => "peer",
            Collection::Devices => "device",
            Collection::Services => "service",
        }
    }

    fn load_sql(self) -> &'static str {
        match self {
            Collection::Networks => "SELECT doc FROM networks WHERE id = ?",
            Collection::Peers => "SELECT doc FROM peers WHERE id = ?",
            Collection::Devices => "SELECT doc FROM devices WHERE id = ?",
            Collection::Services => "SELECT doc FROM services WHERE id = ?",
        }
    }

    fn delete_sql(self) -> &'static str {
        match self {
            Collection::Networks => "DELETE FROM networks WHERE id = ?",
            Collection::Peers => "DELETE FROM peers WHERE id = ?",
            Collection::Devices => "DELETE FROM devices WHERE id = ?",
            Collection::Services => "DELETE FROM services WHERE id = ?",
        }
    }

    /// Upsert keeps the original rowid so listings stay in creation order
    fn upsert_sql(self) -> &'static str {
        match self {
            Collection::Networks => {
                "INSERT INTO networks (id, account_id, doc) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET account_id = excluded.account_id, doc = excluded.doc"
            }
            Collection::Peers => {
                "INSERT INTO peers (id, net_id, device_id, account_id, doc) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET net_id = excluded.net_id,
                     device_id = excluded.device_id, account_id = excluded.account_id,
                     doc = excluded.doc"
            }
            Collection::Devices => {
                "INSERT INTO devices (id, account_id, api_key, doc) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET account_id = excluded.account_id,
                     api_key = excluded.api_key, doc = excluded.doc"
            }
            Collection::Services => {
                "INSERT INTO services (id, account_id, doc) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET account_id = excluded.account_id, doc = excluded.doc"
            }
        }
    }
}

/// A record stored as a document in one collection
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    /// Secondary key values, in the column order of the upsert statement
    fn keys(&self) -> Vec<&str>;
}

impl Record for Network {
    const COLLECTION: Collection = Collection::Networks;

    fn id(&self) -> &str {
        &self.id
    }

    fn keys(&self) -> Vec<&str> {
        vec![&self.account_id]
    }
}

impl Record for Peer {
    const COLLECTION: Collection = Collection::Peers;

    fn id(&self) -> &str {
        &self.id
    }

    fn keys(&self) -> Vec<&str> {
        vec![&self.net_id, &self.device_id, &self.account_id]
    }
}

impl Record for Device {
    const COLLECTION: Collection = Collection::Devices;

    fn id(&self) -> &str {
        &self.id
    }

    fn keys(&self) -> Vec<&str> {
        vec![&self.account_id, &self.api_key]
    }
}

impl Record for Service {
    const COLLECTION: Collection = Collection::Services;

    fn id(&self) -> &str {
        &self.id
    }

    fn keys(&self) -> Vec<&str> {
        vec![&self.account_id]
    }
}

fn db_error(err: sqlx::Error) -> FleetError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return FleetError::Conflict(db.message().to_string());
        }
    }
    FleetError::Database(err.to_string())
}

fn decode<T: Record>(doc: &str) -> Result<T> {
    serde_json::from_str(doc).map_err(|e| {
        FleetError::Internal(format!("corrupt {} document: {}", T::COLLECTION.entity(), e))
    })
}

/// SQLite-backed document store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(db_error),
            Err(_) => {
                tracing::warn!(op, timeout = ?self.timeout, "store call timed out");
                Err(FleetError::Timeout(op.to_string()))
            }
        }
    }

    async fn load<T: Record>(&self, id: &str) -> Result<T> {
        let doc: Option<String> = self
            .bounded(
                "load",
                sqlx::query_scalar::<_, String>(T::COLLECTION.load_sql())
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;

        match doc {
            Some(doc) => decode(&doc),
            None => Err(FleetError::not_found(T::COLLECTION.entity(), id)),
        }
    }

    async fn save<T: Record>(&self, record: &T) -> Result<()> {
        if record.id().is_empty() {
            return Err(FleetError::invalid(format!(
                "{} id is required",
                T::COLLECTION.entity()
            )));
        }

        let doc = serde_json::to_string(record).map_err(|e| FleetError::Internal(e.to_string()))?;

        let mut query = sqlx::query(T::COLLECTION.upsert_sql()).bind(record.id());
        for key in record.keys() {
            query = query.bind(key);
        }
        query = query.bind(doc);

        self.bounded("save", query.execute(&self.pool)).await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let result = self
            .bounded(
                "delete",
                sqlx::query(collection.delete_sql())
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::not_found(collection.entity(), id));
        }
        Ok(())
    }

    async fn list<T: Record>(&self, sql: &'static str, key: &str) -> Result<Vec<T>> {
        let docs: Vec<String> = self
            .bounded(
                "list",
                sqlx::query_scalar::<_, String>(sql)
                    .bind(key)
                    .fetch_all(&self.pool),
            )
            .await?;

        docs.iter().map(|doc| decode(doc)).collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_network(&self, id: &str) -> Result<Network> {
        self.load(id).await
    }

    async fn save_network(&self, network: &Network) -> Result<()> {
        self.save(network).await
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        self.delete(Collection::Networks, id).await
    }

    async fn list_networks(&self, account_id: &str) -> Result<Vec<Network>> {
        self.list(
            "SELECT doc FROM networks WHERE account_id = ? ORDER BY rowid",
            account_id,
        )
        .await
    }

    async fn load_peer(&self, id: &str) -> Result<Peer> {
        self.load(id).await
    }

    async fn save_peer(&self, peer: &Peer) -> Result<()> {
        self.save(peer).await
    }

    async fn delete_peer(&self, id: &str) -> Result<()> {
        self.delete(Collection::Peers, id).await
    }

    async fn list_peers(&self, filter: PeerFilter<'_>) -> Result<Vec<Peer>> {
        let (sql, key) = match filter {
            PeerFilter::Network(id) => ("SELECT doc FROM peers WHERE net_id = ? ORDER BY rowid", id),
            PeerFilter::Device(id) => {
                ("SELECT doc FROM peers WHERE device_id = ? ORDER BY rowid", id)
            }
            PeerFilter::Account(id) => {
                ("SELECT doc FROM peers WHERE account_id = ? ORDER BY rowid", id)
            }
        };
        self.list(sql, key).await
    }

    async fn load_device(&self, id: &str) -> Result<Device> {
        self.load(id).await
    }

    async fn load_device_by_api_key(&self, api_key: &str) -> Result<Device> {
        let doc: Option<String> = self
            .bounded(
                "load_device_by_api_key",
                sqlx::query_scalar::<_, String>("SELECT doc FROM devices WHERE api_key = ?")
                    .bind(api_key)
                    .fetch_optional(&self.pool),
            )
            .await?;

        match doc {
            Some(doc) => decode(&doc),
            None => Err(FleetError::not_found("device", "api key")),
        }
    }

    async fn save_device(&self, device: &Device) -> Result<()> {
        self.save(device).await
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        self.delete(Collection::Devices, id).await
    }

    async fn touch_device(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = self
            .bounded(
                "touch_device",
                sqlx::query("UPDATE devices SET doc = json_set(doc, '$.last_seen', ?) WHERE id = ?")
                    .bind(at.to_rfc3339_opts(SecondsFormat::Micros, true))
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::not_found("device", id));
        }
        Ok(())
    }

    async fn load_service(&self, id: &str) -> Result<Service> {
        self.load(id).await
    }

    async fn save_service(&self, service: &Service) -> Result<()> {
        self.save(service).await
    }

    async fn delete_service(&self, id: &str) -> Result<()> {
        self.delete(Collection::Services, id).await
    }

    async fn list_services(&self, account_id: &str) -> Result<Vec<Service>> {
        self.list(
            "SELECT doc FROM services WHERE account_id = ? ORDER BY rowid",
            account_id,
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }
}
