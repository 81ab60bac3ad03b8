//! Database migrations
//!
//! Every record is stored as a JSON document next to the secondary keys it
//! is looked up by. Rows are listed in insertion (rowid) order.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run database migrations
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS networks (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS peers (
            id TEXT PRIMARY KEY,
            net_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS services (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            doc TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_networks_account ON networks(account_id);
        CREATE INDEX IF NOT EXISTS idx_peers_net ON peers(net_id);
        CREATE INDEX IF NOT EXISTS idx_peers_device ON peers(device_id);
        CREATE INDEX IF NOT EXISTS idx_peers_account ON peers(account_id);
        CREATE INDEX IF NOT EXISTS idx_devices_api_key ON devices(api_key);
        CREATE INDEX IF NOT EXISTS idx_services_account ON services(account_id);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
