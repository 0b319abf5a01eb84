//! Device registry.
//!
//! The registry maps a MAC address to its owner, role, assigned address and
//! active flag. It is the application's own record of which addresses are
//! claimed; the lifecycle manager keeps `assigned_ip` equal to the address
//! reserved for the MAC in the DHCP tables.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};

use crate::catalog::Role;
use crate::db::{bounded, ip_from_int, ip_to_int, is_unique_violation, parse_rfc3339};
use crate::error::{Error, Result};
use crate::mac::MacAddr;

/// A registered network endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Registry-assigned numeric identifier. Seeds the quarantine address.
    pub id: i64,
    pub mac: MacAddr,
    pub name: String,
    pub assigned_ip: Option<Ipv4Addr>,
    pub is_active: bool,
    /// Username of the owning user.
    pub owner: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Registration request for a device not yet in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub mac: MacAddr,
    pub name: String,
    pub owner: String,
    pub role: Role,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Inserts a new active device without an address.
    ///
    /// A MAC that is already registered is [`Error::AlreadyRegistered`].
    async fn create(&self, device: NewDevice) -> Result<Device>;

    async fn get(&self, mac: MacAddr) -> Result<Option<Device>>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Device>>;

    /// Devices whose `assigned_ip` equals `ip`.
    async fn find_by_ip(&self, ip: Ipv4Addr) -> Result<Vec<Device>>;

    async fn list_active(&self, role: Role) -> Result<Vec<Device>>;

    async fn list_all(&self) -> Result<Vec<Device>>;

    /// Persists address, activity and name changes of an existing device.
    async fn save(&self, device: &Device) -> Result<()>;

    /// Deletes the device. Returns `false` if no such MAC was registered.
    async fn delete(&self, mac: MacAddr) -> Result<bool>;

    /// Bumps `last_access` to now.
    async fn touch(&self, mac: MacAddr) -> Result<()>;
}

/// Registry kept in the `devices` table.
#[derive(Debug, Clone)]
pub struct SqlDeviceRegistry {
    pool: AnyPool,
    timeout: Duration,
}

const DEVICE_COLUMNS: &str =
    "id, mac, name, assigned_ip, is_active, owner, role, created_at, last_access";

impl SqlDeviceRegistry {
    pub fn new(pool: AnyPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    fn from_row(row: &AnyRow) -> Result<Device> {
        let mac: String = row.try_get("mac")?;
        let assigned_ip: Option<i64> = row.try_get("assigned_ip")?;
        let is_active: i64 = row.try_get("is_active")?;
        let role: String = row.try_get("role")?;
        let created_at: String = row.try_get("created_at")?;
        let last_access: String = row.try_get("last_access")?;

        Ok(Device {
            id: row.try_get("id")?,
            mac: mac.parse()?,
            name: row.try_get("name")?,
            assigned_ip: assigned_ip.map(ip_from_int),
            is_active: is_active != 0,
            owner: row.try_get("owner")?,
            role: role.parse()?,
            created_at: parse_rfc3339(&created_at)?,
            last_access: parse_rfc3339(&last_access)?,
        })
    }

    async fn fetch_where(&self, clause: &str, bind: Option<String>) -> Result<Vec<Device>> {
        let sql = format!("SELECT {} FROM devices {} ORDER BY id", DEVICE_COLUMNS, clause);
        let mut query = sqlx::query(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect()
    }
}

#[async_trait]
impl DeviceRegistry for SqlDeviceRegistry {
    async fn create(&self, device: NewDevice) -> Result<Device> {
        bounded(self.timeout, "device_create", async {
            let now = Utc::now();
            let stamp = now.to_rfc3339();
            let result = sqlx::query(
                "INSERT INTO devices (mac, name, assigned_ip, is_active, owner, role, created_at, last_access) \
                 VALUES (?, ?, NULL, 1, ?, ?, ?, ?)",
            )
            .bind(device.mac.to_storage())
            .bind(device.name.clone())
            .bind(device.owner.clone())
            .bind(device.role.to_string())
            .bind(stamp.clone())
            .bind(stamp)
            .execute(&self.pool)
            .await;

            let result = match result {
                Ok(result) => result,
                Err(error) if is_unique_violation(&error) => {
                    return Err(Error::AlreadyRegistered(device.mac.to_string()));
                }
                Err(error) => return Err(error.into()),
            };

            let id = match result.last_insert_id() {
                Some(id) => id,
                None => {
                    let row = sqlx::query("SELECT id FROM devices WHERE mac = ?")
                        .bind(device.mac.to_storage())
                        .fetch_one(&self.pool)
                        .await?;
                    row.try_get("id")?
                }
            };

            Ok(Device {
                id,
                mac: device.mac,
                name: device.name,
                assigned_ip: None,
                is_active: true,
                owner: device.owner,
                role: device.role,
                created_at: now,
                last_access: now,
            })
        })
        .await
    }

    async fn get(&self, mac: MacAddr) -> Result<Option<Device>> {
        bounded(self.timeout, "device_get", async {
            let mut devices = self
                .fetch_where("WHERE mac = ?", Some(mac.to_storage()))
                .await?;
            Ok(devices.pop())
        })
        .await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Device>> {
        bounded(self.timeout, "device_get_by_id", async {
            let sql = format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS);
            let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(Self::from_row).transpose()
        })
        .await
    }

    async fn find_by_ip(&self, ip: Ipv4Addr) -> Result<Vec<Device>> {
        bounded(self.timeout, "device_find_by_ip", async {
            let sql = format!("SELECT {} FROM devices WHERE assigned_ip = ? ORDER BY id", DEVICE_COLUMNS);
            let rows = sqlx::query(&sql)
                .bind(ip_to_int(ip))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::from_row).collect()
        })
        .await
    }

    async fn list_active(&self, role: Role) -> Result<Vec<Device>> {
        bounded(self.timeout, "device_list_active", async {
            self.fetch_where("WHERE is_active = 1 AND role = ?", Some(role.to_string()))
                .await
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Device>> {
        bounded(self.timeout, "device_list_all", async {
            self.fetch_where("", None).await
        })
        .await
    }

    async fn save(&self, device: &Device) -> Result<()> {
        bounded(self.timeout, "device_save", async {
            let result = sqlx::query(
                "UPDATE devices SET name = ?, assigned_ip = ?, is_active = ?, role = ?, last_access = ? WHERE mac = ?",
            )
            .bind(device.name.clone())
            .bind(device.assigned_ip.map(ip_to_int))
            .bind(i64::from(device.is_active))
            .bind(device.role.to_string())
            .bind(device.last_access.to_rfc3339())
            .bind(device.mac.to_storage())
            .execute(&self.pool)
            .await;

            match result {
                Ok(result) if result.rows_affected() == 0 => {
                    // MySQL reports changed rather than matched rows.
                    let existing = sqlx::query("SELECT id FROM devices WHERE mac = ?")
                        .bind(device.mac.to_storage())
                        .fetch_optional(&self.pool)
                        .await?;
                    match existing {
                        Some(_) => Ok(()),
                        None => Err(Error::NotFound(format!("device {}", device.mac))),
                    }
                }
                Ok(_) => Ok(()),
                Err(error) if is_unique_violation(&error) => match device.assigned_ip {
                    Some(ip) => Err(Error::AddressConflict(ip)),
                    None => Err(error.into()),
                },
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn delete(&self, mac: MacAddr) -> Result<bool> {
        bounded(self.timeout, "device_delete", async {
            let result = sqlx::query("DELETE FROM devices WHERE mac = ?")
                .bind(mac.to_storage())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn touch(&self, mac: MacAddr) -> Result<()> {
        bounded(self.timeout, "device_touch", async {
            sqlx::query("UPDATE devices SET last_access = ? WHERE mac = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(mac.to_storage())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
