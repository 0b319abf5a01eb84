//! Blacklisted addresses.
//!
//! The blacklist is read fresh from the database on every allocation
//! decision; there is no in-process copy to keep in sync. Adding an address
//! has no side effects here: reassigning devices that hold a newly
//! blacklisted address is the job of
//! [`LeaseManager::blacklist_add`](crate::LeaseManager::blacklist_add).

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use tracing::info;

use crate::db::{bounded, is_unique_violation, parse_rfc3339};
use crate::error::{Error, Result};

/// An address excluded from issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistedIp {
    pub ip: Ipv4Addr,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable set of excluded addresses.
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    /// Adds `ip`. Returns `false` if it was already blacklisted, in which
    /// case the stored reason is left untouched.
    async fn add(&self, ip: Ipv4Addr, reason: &str) -> Result<bool>;

    /// Removes `ip`, or reports [`Error::NotFound`].
    async fn remove(&self, ip: Ipv4Addr) -> Result<()>;

    async fn contains(&self, ip: Ipv4Addr) -> Result<bool>;

    async fn list_all(&self) -> Result<Vec<Ipv4Addr>>;

    async fn entries(&self) -> Result<Vec<BlacklistedIp>>;
}

/// Blacklist kept in the `blacklisted_ips` table.
#[derive(Debug, Clone)]
pub struct SqlBlacklist {
    pool: AnyPool,
    timeout: Duration,
}

impl SqlBlacklist {
    pub fn new(pool: AnyPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

fn decode_ip(text: &str) -> Result<Ipv4Addr> {
    text.parse()
        .map_err(|error| Error::Database(sqlx::Error::Decode(Box::new(error))))
}

#[async_trait]
impl BlacklistStore for SqlBlacklist {
    async fn add(&self, ip: Ipv4Addr, reason: &str) -> Result<bool> {
        bounded(self.timeout, "blacklist_add", async {
            let now = Utc::now().to_rfc3339();
            let result = sqlx::query(
                "INSERT INTO blacklisted_ips (ip_address, reason, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(ip.to_string())
            .bind(reason.to_string())
            .bind(now.clone())
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    info!(ip = %ip, reason, "address blacklisted");
                    Ok(true)
                }
                Err(error) if is_unique_violation(&error) => Ok(false),
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        bounded(self.timeout, "blacklist_remove", async {
            let result = sqlx::query("DELETE FROM blacklisted_ips WHERE ip_address = ?")
                .bind(ip.to_string())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(Error::NotFound(format!("blacklist entry {}", ip)));
            }
            info!(ip = %ip, "address removed from blacklist");
            Ok(())
        })
        .await
    }

    async fn contains(&self, ip: Ipv4Addr) -> Result<bool> {
        bounded(self.timeout, "blacklist_contains", async {
            let row = sqlx::query("SELECT COUNT(*) FROM blacklisted_ips WHERE ip_address = ?")
                .bind(ip.to_string())
                .fetch_one(&self.pool)
                .await?;
            let count: i64 = row.try_get(0)?;
            Ok(count > 0)
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Ipv4Addr>> {
        bounded(self.timeout, "blacklist_list", async {
            let rows = sqlx::query("SELECT ip_address FROM blacklisted_ips ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| {
                    let text: String = row.try_get("ip_address")?;
                    decode_ip(&text)
                })
                .collect()
        })
        .await
    }

    async fn entries(&self) -> Result<Vec<BlacklistedIp>> {
        bounded(self.timeout, "blacklist_entries", async {
            let rows = sqlx::query(
                "SELECT ip_address, reason, created_at, updated_at FROM blacklisted_ips ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?;

            let mut entries = Vec::with_capacity(rows.len());
            for row in rows {
                let ip: String = row.try_get("ip_address")?;
                let created_at: String = row.try_get("created_at")?;
                let updated_at: String = row.try_get("updated_at")?;
                entries.push(BlacklistedIp {
                    ip: decode_ip(&ip)?,
                    reason: row.try_get("reason")?,
                    created_at: parse_rfc3339(&created_at)?,
                    updated_at: parse_rfc3339(&updated_at)?,
                });
            }
            Ok(entries)
        })
        .await
    }
}
