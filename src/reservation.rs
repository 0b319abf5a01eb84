//! Reservation store adapter.
//!
//! The external DHCP daemon reads three tables directly, so a reservation is
//! written as raw SQL in the daemon's own formats:
//!
//! - `hosts`: MAC (hex, no separators) to subnet id, address and hostname
//! - `dhcp4_options`: router, DNS and server-identifier rows tied to `host_id`
//! - `lease4`: address and MAC with a validity window and a lifecycle tag
//!
//! Every operation runs its own transactions; there is no atomicity across
//! calls, nor across the host and lease halves of one registration.
//! [`ReservationStore::register_reservation`] always clears the MAC's prior
//! reservation first, so repeating a failed registration converges.
//!
//! No other component writes these tables.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::{debug, error, info, warn};

use crate::blacklist::BlacklistStore;
use crate::config::Config;
use crate::db::{
    EXPIRE_FORMAT, MacEncoding, bounded, format_timestamp, ip_from_int, ip_to_int,
    is_unique_violation,
};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::options::{HOST_SCOPE, HostOption, OPTION_SPACE, OptionCode, reservation_options};

/// `dhcp_identifier_type` of a hardware-address host reservation.
const IDENTIFIER_HW_ADDRESS: i64 = 0;

/// `lease4.state` of a lease the client declined.
const LEASE_STATE_DECLINED: i64 = 1;

/// Lifecycle tag stored in a lease's `user_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    /// Lease backing a device's permanent address.
    Permanent,
    /// Short-lived quarantine lease.
    Temporary,
}

#[derive(Serialize, Deserialize)]
struct LeaseContext {
    lifecycle: LeaseKind,
}

impl LeaseKind {
    /// JSON written to `lease4.user_context`, e.g. `{"lifecycle":"temporary"}`.
    pub fn user_context(&self) -> String {
        serde_json::to_string(&LeaseContext { lifecycle: *self })
            .unwrap_or_else(|_| String::from("{}"))
    }

    pub fn from_user_context(text: &str) -> Option<Self> {
        serde_json::from_str::<LeaseContext>(text)
            .ok()
            .map(|context| context.lifecycle)
    }
}

/// Shapes of the lease INSERT, in the order they are tried.
///
/// [`LeaseInsertVariant::OmitClientId`] is the schema-correct form and the
/// only one used unless `lease_insert_fallback` is enabled. The other two
/// exist for older lease tables and drivers that reject a missing or NULL
/// `client_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseInsertVariant {
    OmitClientId,
    NullClientId,
    ExplicitClientId,
}

impl LeaseInsertVariant {
    pub const CHAIN: [Self; 3] = [Self::OmitClientId, Self::NullClientId, Self::ExplicitClientId];

    fn sql(&self, macs: MacEncoding) -> String {
        let mac = macs.param();
        match self {
            Self::OmitClientId => format!(
                "INSERT INTO lease4 (address, hwaddr, valid_lifetime, expire, subnet_id, fqdn_fwd, fqdn_rev, hostname, state, user_context) \
                 VALUES (?, {mac}, ?, ?, ?, 0, 0, ?, 0, ?)"
            ),
            Self::NullClientId => format!(
                "INSERT INTO lease4 (address, hwaddr, client_id, valid_lifetime, expire, subnet_id, fqdn_fwd, fqdn_rev, hostname, state, user_context) \
                 VALUES (?, {mac}, NULL, ?, ?, ?, 0, 0, ?, 0, ?)"
            ),
            Self::ExplicitClientId => format!(
                "INSERT INTO lease4 (address, hwaddr, client_id, valid_lifetime, expire, subnet_id, fqdn_fwd, fqdn_rev, hostname, state, user_context) \
                 VALUES (?, {mac}, {mac}, ?, ?, ?, 0, 0, ?, 0, ?)"
            ),
        }
    }
}

impl fmt::Display for LeaseInsertVariant {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OmitClientId => "omit-client-id",
            Self::NullClientId => "null-client-id",
            Self::ExplicitClientId => "explicit-client-id",
        };
        formatter.write_str(name)
    }
}

/// What to reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub kind: LeaseKind,
    /// Lease lifetime in seconds.
    pub valid_lifetime: u32,
}

/// A reservation as written by [`ReservationStore::register_reservation`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub host_id: i64,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub subnet_id: u32,
    pub hostname: Option<String>,
    pub options: [HostOption; 3],
    pub kind: LeaseKind,
    pub valid_lifetime: u32,
    pub expire: DateTime<Utc>,
    pub lease_variant: LeaseInsertVariant,
}

/// A row of the `hosts` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReservation {
    pub host_id: i64,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub subnet_id: u32,
    pub hostname: Option<String>,
}

/// A row of the `lease4` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr>,
    pub valid_lifetime: u32,
    pub expire: Option<DateTime<Utc>>,
    pub subnet_id: u32,
    pub hostname: Option<String>,
    pub state: i64,
    pub kind: Option<LeaseKind>,
}

/// Outcome of [`ReservationStore::remove_reservation`].
///
/// Removal is best-effort: one of the two transactions may fail while the
/// other succeeds, in which case `complete` is false.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub hosts_removed: u64,
    pub options_removed: u64,
    pub leases_removed: u64,
    pub complete: bool,
}

/// Client of the DHCP daemon's reservation tables.
pub struct ReservationStore {
    pool: AnyPool,
    config: Arc<Config>,
    blacklist: Arc<dyn BlacklistStore>,
    macs: MacEncoding,
}

impl ReservationStore {
    /// The MAC encoding follows the pool's backend; see [`MacEncoding`].
    pub fn new(pool: AnyPool, config: Arc<Config>, blacklist: Arc<dyn BlacklistStore>) -> Self {
        let macs = MacEncoding::for_pool(&pool);
        Self {
            pool,
            config,
            blacklist,
            macs,
        }
    }

    /// Overrides the MAC encoding derived from the pool.
    pub fn with_mac_encoding(mut self, macs: MacEncoding) -> Self {
        self.macs = macs;
        self
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Writes host, option and lease rows for `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::BlacklistedAddress`] if the address is blacklisted. Nothing
    ///   is written or removed.
    /// - [`Error::AddressOutOfRange`] if the address is in no band.
    /// - [`Error::AddressConflict`] if another host already holds the address.
    /// - [`Error::ReservationWriteFailed`] if the host/options transaction fails.
    /// - [`Error::PartialReservationInconsistency`] if host and options were
    ///   committed but no lease variant could be inserted.
    pub async fn register_reservation(&self, request: &ReservationRequest) -> Result<Reservation> {
        self.register_reservation_at(request, Utc::now()).await
    }

    /// [`register_reservation`](Self::register_reservation) with an explicit
    /// clock; the lease expires `valid_lifetime` seconds after `now`.
    pub async fn register_reservation_at(
        &self,
        request: &ReservationRequest,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        if self.blacklist.contains(request.ip).await? {
            return Err(Error::BlacklistedAddress(request.ip));
        }

        let catalog = &self.config.address_space;
        let (band, _) = catalog
            .classify(request.ip)
            .ok_or(Error::AddressOutOfRange(request.ip))?;
        let gateway = band
            .gateway_for(request.ip)
            .ok_or(Error::AddressOutOfRange(request.ip))?;
        let subnet_id = band.subnet_id;
        let options = reservation_options(gateway, self.config.dns_server, self.config.dhcp_server);

        self.remove_reservation(request.mac).await?;

        let host_id = bounded(
            self.config.store_timeout(),
            "insert_host",
            self.insert_host(request, subnet_id, &options),
        )
        .await?;

        let expire = now + TimeDelta::seconds(i64::from(request.valid_lifetime));
        let lease_variant = match bounded(
            self.config.store_timeout(),
            "insert_lease",
            self.insert_lease(request, subnet_id, now, expire),
        )
        .await
        {
            Ok(variant) => variant,
            Err(lease_error) => {
                error!(
                    mac = %request.mac,
                    ip = %request.ip,
                    host_id,
                    error = %lease_error,
                    "host reservation written without a lease; manual reconciliation required"
                );
                return Err(Error::PartialReservationInconsistency {
                    mac: request.mac.to_string(),
                    ip: request.ip,
                });
            }
        };

        info!(
            mac = %request.mac,
            ip = %request.ip,
            subnet_id,
            kind = ?request.kind,
            valid_lifetime = request.valid_lifetime,
            "reservation registered"
        );

        Ok(Reservation {
            host_id,
            mac: request.mac,
            ip: request.ip,
            subnet_id,
            hostname: request.hostname.clone(),
            options,
            kind: request.kind,
            valid_lifetime: request.valid_lifetime,
            expire,
            lease_variant,
        })
    }

    async fn insert_host(
        &self,
        request: &ReservationRequest,
        subnet_id: u32,
        options: &[HostOption; 3],
    ) -> Result<i64> {
        let mut transaction = self.pool.begin().await.map_err(write_failed)?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO hosts (dhcp_identifier, dhcp_identifier_type, dhcp4_subnet_id, ipv4_address, hostname) \
             VALUES ({}, ?, ?, ?, ?)",
            self.macs.param()
        ))
        .bind(request.mac.to_storage())
        .bind(IDENTIFIER_HW_ADDRESS)
        .bind(i64::from(subnet_id))
        .bind(ip_to_int(request.ip))
        .bind(request.hostname.clone())
        .execute(&mut *transaction)
        .await;

        let inserted = match inserted {
            Ok(result) => result,
            Err(error) if is_unique_violation(&error) => {
                debug!(ip = %request.ip, subnet_id, "host row rejected by unique key");
                return Err(Error::AddressConflict(request.ip));
            }
            Err(error) => return Err(write_failed(error)),
        };

        let host_id = match inserted.last_insert_id() {
            Some(host_id) => host_id,
            None => {
                let row = sqlx::query(&format!(
                    "SELECT host_id FROM hosts WHERE dhcp_identifier = {} AND dhcp4_subnet_id = ?",
                    self.macs.param()
                ))
                .bind(request.mac.to_storage())
                .bind(i64::from(subnet_id))
                .fetch_one(&mut *transaction)
                .await
                .map_err(write_failed)?;
                row.try_get("host_id").map_err(write_failed)?
            }
        };

        for option in options {
            sqlx::query(
                "INSERT INTO dhcp4_options (code, formatted_value, space, persistent, host_id, scope_id) \
                 VALUES (?, ?, ?, 0, ?, ?)",
            )
            .bind(option.code as i64)
            .bind(option.formatted_value())
            .bind(OPTION_SPACE)
            .bind(host_id)
            .bind(HOST_SCOPE)
            .execute(&mut *transaction)
            .await
            .map_err(write_failed)?;
        }

        transaction.commit().await.map_err(write_failed)?;
        Ok(host_id)
    }

    async fn insert_lease(
        &self,
        request: &ReservationRequest,
        subnet_id: u32,
        now: DateTime<Utc>,
        expire: DateTime<Utc>,
    ) -> Result<LeaseInsertVariant> {
        let mut transaction = self.pool.begin().await.map_err(write_failed)?;

        // Our own stale row, or anybody's expired one, may still hold the address.
        sqlx::query(&format!(
            "DELETE FROM lease4 WHERE address = ? AND (hwaddr = {} OR expire < ?)",
            self.macs.param()
        ))
        .bind(ip_to_int(request.ip))
        .bind(request.mac.to_storage())
        .bind(format_timestamp(now))
        .execute(&mut *transaction)
        .await
        .map_err(write_failed)?;

        let variants: &[LeaseInsertVariant] = if self.config.lease_insert_fallback {
            &LeaseInsertVariant::CHAIN
        } else {
            &LeaseInsertVariant::CHAIN[..1]
        };

        let mut last_error = None;
        for variant in variants {
            let sql = variant.sql(self.macs);
            let mut query = sqlx::query(&sql)
                .bind(ip_to_int(request.ip))
                .bind(request.mac.to_storage());
            if *variant == LeaseInsertVariant::ExplicitClientId {
                query = query.bind(request.mac.client_id());
            }
            let result = query
                .bind(i64::from(request.valid_lifetime))
                .bind(format_timestamp(expire))
                .bind(i64::from(subnet_id))
                .bind(request.hostname.clone())
                .bind(request.kind.user_context())
                .execute(&mut *transaction)
                .await;

            match result {
                Ok(_) => {
                    transaction.commit().await.map_err(write_failed)?;
                    if *variant != LeaseInsertVariant::OmitClientId {
                        warn!(mac = %request.mac, %variant, "lease inserted through compatibility variant");
                    }
                    return Ok(*variant);
                }
                Err(error) => {
                    warn!(mac = %request.mac, %variant, %error, "lease insert variant failed");
                    last_error = Some(error);
                }
            }
        }

        Err(match last_error {
            Some(error) => write_failed(error),
            None => Error::ReservationWriteFailed("no lease insert variant enabled".to_string()),
        })
    }

    /// Removes every host, option and lease row of `mac`.
    ///
    /// Host and options go in one transaction; leases at the reserved
    /// addresses, leases of the MAC, and the MAC's quarantine-band leases go
    /// in a second. The call succeeds if either transaction commits. A MAC
    /// with nothing reserved yields an empty, complete report.
    pub async fn remove_reservation(&self, mac: MacAddr) -> Result<RemovalReport> {
        let timeout = self.config.store_timeout();

        let reserved = match bounded(timeout, "lookup_host", self.host_addresses(mac)).await {
            Ok(addresses) => addresses,
            Err(lookup_error) => {
                warn!(mac = %mac, error = %lookup_error, "could not read reserved addresses");
                Vec::new()
            }
        };

        let hosts = bounded(timeout, "remove_host", self.delete_hosts(mac)).await;
        let leases = bounded(timeout, "remove_leases", self.delete_leases(mac, &reserved)).await;

        let mut report = RemovalReport {
            complete: hosts.is_ok() && leases.is_ok(),
            ..RemovalReport::default()
        };

        match (hosts, leases) {
            (Err(host_error), Err(lease_error)) => {
                error!(mac = %mac, %host_error, %lease_error, "reservation removal failed");
                return Err(Error::ReservationWriteFailed(format!(
                    "removing reservation for {}: hosts: {}; leases: {}",
                    mac, host_error, lease_error
                )));
            }
            (hosts, leases) => {
                match hosts {
                    Ok((hosts_removed, options_removed)) => {
                        report.hosts_removed = hosts_removed;
                        report.options_removed = options_removed;
                    }
                    Err(host_error) => {
                        warn!(mac = %mac, error = %host_error, "host rows left behind")
                    }
                }
                match leases {
                    Ok(leases_removed) => report.leases_removed = leases_removed,
                    Err(lease_error) => {
                        warn!(mac = %mac, error = %lease_error, "lease rows left behind")
                    }
                }
            }
        }

        if report.hosts_removed > 0 || report.leases_removed > 0 {
            info!(
                mac = %mac,
                hosts = report.hosts_removed,
                options = report.options_removed,
                leases = report.leases_removed,
                "reservation removed"
            );
        }
        Ok(report)
    }

    async fn host_addresses(&self, mac: MacAddr) -> Result<Vec<Ipv4Addr>> {
        let rows = sqlx::query(&format!(
            "SELECT ipv4_address FROM hosts WHERE dhcp_identifier = {} AND dhcp_identifier_type = ?",
            self.macs.param()
        ))
        .bind(mac.to_storage())
        .bind(IDENTIFIER_HW_ADDRESS)
        .fetch_all(&self.pool)
        .await?;

        let mut addresses = Vec::with_capacity(rows.len());
        for row in rows {
            let address: Option<i64> = row.try_get("ipv4_address")?;
            addresses.extend(address.map(ip_from_int));
        }
        Ok(addresses)
    }

    async fn delete_hosts(&self, mac: MacAddr) -> Result<(u64, u64)> {
        let mut transaction = self.pool.begin().await.map_err(write_failed)?;

        let rows = sqlx::query(&format!(
            "SELECT host_id FROM hosts WHERE dhcp_identifier = {} AND dhcp_identifier_type = ?",
            self.macs.param()
        ))
        .bind(mac.to_storage())
        .bind(IDENTIFIER_HW_ADDRESS)
        .fetch_all(&mut *transaction)
        .await
        .map_err(write_failed)?;

        let mut hosts_removed = 0;
        let mut options_removed = 0;
        for row in rows {
            let host_id: i64 = row.try_get("host_id").map_err(write_failed)?;
            options_removed += sqlx::query("DELETE FROM dhcp4_options WHERE host_id = ?")
                .bind(host_id)
                .execute(&mut *transaction)
                .await
                .map_err(write_failed)?
                .rows_affected();
            hosts_removed += sqlx::query("DELETE FROM hosts WHERE host_id = ?")
                .bind(host_id)
                .execute(&mut *transaction)
                .await
                .map_err(write_failed)?
                .rows_affected();
        }

        transaction.commit().await.map_err(write_failed)?;
        Ok((hosts_removed, options_removed))
    }

    async fn delete_leases(&self, mac: MacAddr, reserved: &[Ipv4Addr]) -> Result<u64> {
        let mut transaction = self.pool.begin().await.map_err(write_failed)?;
        let mut removed = 0;

        for ip in reserved {
            removed += sqlx::query("DELETE FROM lease4 WHERE address = ?")
                .bind(ip_to_int(*ip))
                .execute(&mut *transaction)
                .await
                .map_err(write_failed)?
                .rows_affected();
        }

        removed += sqlx::query(&format!("DELETE FROM lease4 WHERE hwaddr = {}", self.macs.param()))
            .bind(mac.to_storage())
            .execute(&mut *transaction)
            .await
            .map_err(write_failed)?
            .rows_affected();

        for (low, high) in self.config.address_space.quarantine_spans() {
            removed += sqlx::query(&format!(
                "DELETE FROM lease4 WHERE hwaddr = {} AND address BETWEEN ? AND ?",
                self.macs.param()
            ))
            .bind(mac.to_storage())
            .bind(i64::from(low))
            .bind(i64::from(high))
            .execute(&mut *transaction)
            .await
            .map_err(write_failed)?
            .rows_affected();
        }

        transaction.commit().await.map_err(write_failed)?;
        Ok(removed)
    }

    /// Returns the MAC holding `ip`.
    ///
    /// The most recent lease that was not declined wins; without one, the
    /// host reservation for the address is consulted.
    pub async fn lookup_mac_by_ip(&self, ip: Ipv4Addr) -> Result<MacAddr> {
        bounded(self.config.store_timeout(), "lookup_mac_by_ip", async {
            let lease = sqlx::query(&format!(
                "SELECT {} FROM lease4 WHERE address = ? AND COALESCE(state, 0) <> ? \
                 ORDER BY expire DESC LIMIT 1",
                self.macs.select("hwaddr")
            ))
            .bind(ip_to_int(ip))
            .bind(LEASE_STATE_DECLINED)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = lease
                && let Some(hwaddr) = row.try_get::<Option<String>, _>("hwaddr")?
            {
                return hwaddr.parse();
            }

            let host = sqlx::query(&format!(
                "SELECT {} FROM hosts WHERE ipv4_address = ? ORDER BY host_id DESC LIMIT 1",
                self.macs.select("dhcp_identifier")
            ))
            .bind(ip_to_int(ip))
            .fetch_optional(&self.pool)
            .await?;

            match host {
                Some(row) => {
                    let identifier: String = row.try_get("dhcp_identifier")?;
                    identifier.parse()
                }
                None => Err(Error::NotFound(format!("no lease or reservation for {}", ip))),
            }
        })
        .await
    }

    /// The most recent host reservation of `mac`.
    pub async fn host_for_mac(&self, mac: MacAddr) -> Result<Option<HostReservation>> {
        bounded(self.config.store_timeout(), "host_for_mac", async {
            let row = sqlx::query(&format!(
                "SELECT host_id, dhcp4_subnet_id, ipv4_address, hostname FROM hosts \
                 WHERE dhcp_identifier = {} AND dhcp_identifier_type = ? ORDER BY host_id DESC LIMIT 1",
                self.macs.param()
            ))
            .bind(mac.to_storage())
            .bind(IDENTIFIER_HW_ADDRESS)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let subnet_id: i64 = row.try_get("dhcp4_subnet_id")?;
            let address: i64 = row.try_get("ipv4_address")?;
            Ok(Some(HostReservation {
                host_id: row.try_get("host_id")?,
                mac,
                ip: ip_from_int(address),
                subnet_id: subnet_id as u32,
                hostname: row.try_get("hostname")?,
            }))
        })
        .await
    }

    /// Option rows of a host, in insertion order. Unknown codes are skipped.
    pub async fn options_for_host(&self, host_id: i64) -> Result<Vec<HostOption>> {
        bounded(self.config.store_timeout(), "options_for_host", async {
            let rows = sqlx::query(
                "SELECT code, formatted_value FROM dhcp4_options WHERE host_id = ? ORDER BY option_id",
            )
            .bind(host_id)
            .fetch_all(&self.pool)
            .await?;

            let mut options = Vec::with_capacity(rows.len());
            for row in rows {
                let code: i64 = row.try_get("code")?;
                let value: Option<String> = row.try_get("formatted_value")?;
                let Ok(code) = OptionCode::try_from(code as u8) else {
                    continue;
                };
                if let Some(value) = value.and_then(|text| text.parse().ok()) {
                    options.push(HostOption { code, value });
                }
            }
            Ok(options)
        })
        .await
    }

    /// The lease of `mac` with the latest expiry.
    pub async fn lease_for_mac(&self, mac: MacAddr) -> Result<Option<LeaseRecord>> {
        bounded(self.config.store_timeout(), "lease_for_mac", async {
            let row = sqlx::query(&format!(
                "{} WHERE hwaddr = {} ORDER BY expire DESC LIMIT 1",
                self.lease_select(),
                self.macs.param()
            ))
            .bind(mac.to_storage())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(lease_from_row).transpose()
        })
        .await
    }

    /// The lease at `ip`, if any.
    pub async fn lease_at(&self, ip: Ipv4Addr) -> Result<Option<LeaseRecord>> {
        bounded(self.config.store_timeout(), "lease_at", async {
            let row = sqlx::query(&format!("{} WHERE address = ?", self.lease_select()))
                .bind(ip_to_int(ip))
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(lease_from_row).transpose()
        })
        .await
    }

    /// Every address held by a host reservation or an unexpired lease.
    pub async fn addresses_in_use(&self, now: DateTime<Utc>) -> Result<HashSet<Ipv4Addr>> {
        bounded(self.config.store_timeout(), "addresses_in_use", async {
            let mut addresses = HashSet::new();

            let hosts = sqlx::query("SELECT ipv4_address FROM hosts WHERE ipv4_address IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
            for row in hosts {
                addresses.insert(ip_from_int(row.try_get("ipv4_address")?));
            }

            let leases = sqlx::query("SELECT address FROM lease4 WHERE expire >= ?")
                .bind(format_timestamp(now))
                .fetch_all(&self.pool)
                .await?;
            for row in leases {
                addresses.insert(ip_from_int(row.try_get("address")?));
            }

            Ok(addresses)
        })
        .await
    }

    /// Quarantine addresses held by a host reservation or a valid lease.
    pub async fn occupied_quarantine(&self, now: DateTime<Utc>) -> Result<HashSet<Ipv4Addr>> {
        bounded(self.config.store_timeout(), "occupied_quarantine", async {
            let mut occupied = HashSet::new();

            for (low, high) in self.config.address_space.quarantine_spans() {
                let hosts = sqlx::query(
                    "SELECT ipv4_address FROM hosts WHERE ipv4_address BETWEEN ? AND ?",
                )
                .bind(i64::from(low))
                .bind(i64::from(high))
                .fetch_all(&self.pool)
                .await?;
                for row in hosts {
                    occupied.insert(ip_from_int(row.try_get("ipv4_address")?));
                }

                let leases = sqlx::query(
                    "SELECT address FROM lease4 WHERE address BETWEEN ? AND ? AND expire >= ?",
                )
                .bind(i64::from(low))
                .bind(i64::from(high))
                .bind(format_timestamp(now))
                .fetch_all(&self.pool)
                .await?;
                for row in leases {
                    occupied.insert(ip_from_int(row.try_get("address")?));
                }
            }

            Ok(occupied)
        })
        .await
    }

    /// Deletes quarantine-band leases that expired before `now`.
    pub async fn delete_expired_quarantine_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        bounded(self.config.store_timeout(), "gc_expired_quarantine", async {
            let mut transaction = self.pool.begin().await.map_err(write_failed)?;
            let mut removed = 0;
            for (low, high) in self.config.address_space.quarantine_spans() {
                removed += sqlx::query(
                    "DELETE FROM lease4 WHERE address BETWEEN ? AND ? AND expire < ?",
                )
                .bind(i64::from(low))
                .bind(i64::from(high))
                .bind(format_timestamp(now))
                .execute(&mut *transaction)
                .await
                .map_err(write_failed)?
                .rows_affected();
            }
            transaction.commit().await.map_err(write_failed)?;
            Ok(removed)
        })
        .await
    }

    /// Deletes temporary-tagged leases, in any band, that expired before
    /// `cutoff`.
    pub async fn delete_stale_temporary_leases(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        bounded(self.config.store_timeout(), "gc_stale_temporary", async {
            let result = sqlx::query("DELETE FROM lease4 WHERE user_context = ? AND expire < ?")
                .bind(LeaseKind::Temporary.user_context())
                .bind(format_timestamp(cutoff))
                .execute(&self.pool)
                .await
                .map_err(write_failed)?;
            Ok(result.rows_affected())
        })
        .await
    }

    fn lease_select(&self) -> String {
        format!(
            "SELECT address, {}, valid_lifetime, CAST(expire AS CHAR) AS expire_text, \
             subnet_id, hostname, state, user_context FROM lease4",
            self.macs.select("hwaddr")
        )
    }
}

fn lease_from_row(row: &AnyRow) -> Result<LeaseRecord> {
    let address: i64 = row.try_get("address")?;
    let hwaddr: Option<String> = row.try_get("hwaddr")?;
    let valid_lifetime: Option<i64> = row.try_get("valid_lifetime")?;
    let expire: Option<String> = row.try_get("expire_text")?;
    let subnet_id: Option<i64> = row.try_get("subnet_id")?;
    let state: Option<i64> = row.try_get("state")?;
    let user_context: Option<String> = row.try_get("user_context")?;

    Ok(LeaseRecord {
        ip: ip_from_int(address),
        mac: hwaddr.and_then(|text| text.parse().ok()),
        valid_lifetime: valid_lifetime.unwrap_or_default() as u32,
        expire: expire.and_then(|text| {
            NaiveDateTime::parse_from_str(&text, EXPIRE_FORMAT)
                .ok()
                .map(|naive| naive.and_utc())
        }),
        subnet_id: subnet_id.unwrap_or_default() as u32,
        hostname: row.try_get("hostname")?,
        state: state.unwrap_or_default(),
        kind: user_context.as_deref().and_then(LeaseKind::from_user_context),
    })
}

fn write_failed(error: sqlx::Error) -> Error {
    Error::ReservationWriteFailed(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::SqlBlacklist;
    use crate::db::memory_pool;

    async fn store() -> (ReservationStore, Arc<SqlBlacklist>, AnyPool) {
        store_with(Config::default()).await
    }

    async fn store_with(config: Config) -> (ReservationStore, Arc<SqlBlacklist>, AnyPool) {
        let pool = memory_pool().await;
        let config = Arc::new(config);
        let blacklist = Arc::new(SqlBlacklist::new(pool.clone(), config.store_timeout()));
        let store = ReservationStore::new(pool.clone(), config, blacklist.clone());
        (store, blacklist, pool)
    }

    fn request(mac: &str, ip: Ipv4Addr, kind: LeaseKind) -> ReservationRequest {
        ReservationRequest {
            mac: mac.parse().unwrap(),
            ip,
            hostname: Some("laptop".to_string()),
            kind,
            valid_lifetime: 300,
        }
    }

    /// Swaps `lease4` for an older layout whose `client_id` is mandatory.
    async fn require_client_id(pool: &AnyPool) {
        sqlx::query("DROP TABLE lease4").execute(pool).await.unwrap();
        sqlx::query(
            "CREATE TABLE lease4 (
                address INTEGER PRIMARY KEY NOT NULL,
                hwaddr TEXT,
                client_id TEXT NOT NULL,
                valid_lifetime INTEGER,
                expire TEXT,
                subnet_id INTEGER,
                fqdn_fwd INTEGER,
                fqdn_rev INTEGER,
                hostname TEXT,
                state INTEGER DEFAULT 0,
                user_context TEXT
            )",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn test_lease_kind_user_context() {
        assert_eq!(LeaseKind::Temporary.user_context(), r#"{"lifecycle":"temporary"}"#);
        assert_eq!(
            LeaseKind::from_user_context(r#"{"lifecycle":"permanent"}"#),
            Some(LeaseKind::Permanent)
        );
        assert_eq!(LeaseKind::from_user_context("{}"), None);
        assert_eq!(LeaseKind::from_user_context("not json"), None);
    }

    #[tokio::test]
    async fn test_register_writes_host_options_and_lease() {
        let (store, _, _) = store().await;
        let ip = Ipv4Addr::new(10, 129, 57, 30);
        let reservation = store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await
            .unwrap();

        assert_eq!(reservation.subnet_id, 2);
        assert_eq!(reservation.lease_variant, LeaseInsertVariant::OmitClientId);

        let host = store.host_for_mac(reservation.mac).await.unwrap().unwrap();
        assert_eq!(host.ip, ip);
        assert_eq!(host.subnet_id, 2);
        assert_eq!(host.host_id, reservation.host_id);

        let options = store.options_for_host(host.host_id).await.unwrap();
        let values: Vec<(u8, Ipv4Addr)> = options
            .iter()
            .map(|option| (option.code as u8, option.value))
            .collect();
        assert_eq!(
            values,
            vec![
                (3, Ipv4Addr::new(10, 129, 57, 1)),
                (6, Ipv4Addr::new(10, 129, 0, 53)),
                (54, Ipv4Addr::new(10, 129, 0, 67)),
            ]
        );

        let lease = store.lease_for_mac(reservation.mac).await.unwrap().unwrap();
        assert_eq!(lease.ip, ip);
        assert_eq!(lease.valid_lifetime, 300);
        assert_eq!(lease.kind, Some(LeaseKind::Permanent));
        assert_eq!(lease.state, 0);

        assert_eq!(store.lookup_mac_by_ip(ip).await.unwrap(), reservation.mac);
    }

    #[tokio::test]
    async fn test_host_row_wire_format() {
        let (store, _, pool) = store().await;
        store
            .register_reservation(&request(
                "AA-BB-CC-DD-EE-01",
                Ipv4Addr::new(10, 129, 57, 30),
                LeaseKind::Permanent,
            ))
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT dhcp_identifier, dhcp_identifier_type, ipv4_address FROM hosts",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let identifier: String = row.try_get("dhcp_identifier").unwrap();
        let identifier_type: i64 = row.try_get("dhcp_identifier_type").unwrap();
        let address: i64 = row.try_get("ipv4_address").unwrap();
        assert_eq!(identifier, "aabbccddee01");
        assert_eq!(identifier_type, 0);
        assert_eq!(address, 176_240_926);

        let row = sqlx::query("SELECT space, scope_id FROM dhcp4_options LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        let space: String = row.try_get("space").unwrap();
        let scope_id: i64 = row.try_get("scope_id").unwrap();
        assert_eq!(space, "dhcp4");
        assert_eq!(scope_id, 3);
    }

    #[tokio::test]
    async fn test_register_replaces_prior_reservation() {
        let (store, _, _) = store().await;
        let mac = "aa:bb:cc:dd:ee:01";
        store
            .register_reservation(&request(mac, Ipv4Addr::new(10, 129, 57, 30), LeaseKind::Permanent))
            .await
            .unwrap();
        store
            .register_reservation(&request(mac, Ipv4Addr::new(10, 250, 0, 17), LeaseKind::Temporary))
            .await
            .unwrap();

        let now = Utc::now();
        let in_use = store.addresses_in_use(now).await.unwrap();
        assert_eq!(in_use, HashSet::from([Ipv4Addr::new(10, 250, 0, 17)]));

        let quarantine = store.occupied_quarantine(now).await.unwrap();
        assert_eq!(quarantine, HashSet::from([Ipv4Addr::new(10, 250, 0, 17)]));
    }

    #[tokio::test]
    async fn test_blacklisted_address_rejected_without_mutation() {
        let (store, blacklist, _) = store().await;
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let current = Ipv4Addr::new(10, 129, 57, 30);
        let banned = Ipv4Addr::new(10, 129, 57, 31);
        store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", current, LeaseKind::Permanent))
            .await
            .unwrap();
        blacklist.add(banned, "rogue access point").await.unwrap();

        let result = store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", banned, LeaseKind::Permanent))
            .await;
        assert!(matches!(result, Err(Error::BlacklistedAddress(ip)) if ip == banned));

        let host = store.host_for_mac(mac).await.unwrap().unwrap();
        assert_eq!(host.ip, current);
    }

    #[tokio::test]
    async fn test_out_of_range_address_rejected() {
        let (store, _, _) = store().await;
        let result = store
            .register_reservation(&request(
                "aa:bb:cc:dd:ee:01",
                Ipv4Addr::new(192, 168, 1, 20),
                LeaseKind::Permanent,
            ))
            .await;
        assert!(matches!(result, Err(Error::AddressOutOfRange(_))));
    }

    #[tokio::test]
    async fn test_conflicting_host_reports_address_conflict() {
        let (store, _, _) = store().await;
        let ip = Ipv4Addr::new(10, 129, 57, 30);
        store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await
            .unwrap();

        let result = store
            .register_reservation(&request("aa:bb:cc:dd:ee:02", ip, LeaseKind::Permanent))
            .await;
        assert!(matches!(result, Err(Error::AddressConflict(conflict)) if conflict == ip));

        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(store.lookup_mac_by_ip(ip).await.unwrap(), mac);
    }

    #[tokio::test]
    async fn test_missing_lease_table_is_partial_inconsistency() {
        let (store, _, pool) = store().await;
        sqlx::query("DROP TABLE lease4").execute(&pool).await.unwrap();

        let ip = Ipv4Addr::new(10, 129, 57, 30);
        let result = store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await;
        assert!(matches!(
            result,
            Err(Error::PartialReservationInconsistency { ip: partial, .. }) if partial == ip
        ));

        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let host = store.host_for_mac(mac).await.unwrap().unwrap();
        assert_eq!(host.ip, ip);
    }

    #[tokio::test]
    async fn test_lease_insert_falls_back_to_explicit_client_id() {
        let (store, _, pool) = store().await;
        require_client_id(&pool).await;

        let ip = Ipv4Addr::new(10, 129, 57, 30);
        let reservation = store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await
            .unwrap();
        assert_eq!(reservation.lease_variant, LeaseInsertVariant::ExplicitClientId);

        let row = sqlx::query("SELECT client_id FROM lease4 WHERE address = ?")
            .bind(ip_to_int(ip))
            .fetch_one(&pool)
            .await
            .unwrap();
        let client_id: String = row.try_get("client_id").unwrap();
        assert_eq!(client_id, "01aabbccddee01");

        let lease = store.lease_for_mac(reservation.mac).await.unwrap().unwrap();
        assert_eq!(lease.ip, ip);
    }

    #[tokio::test]
    async fn test_lease_insert_without_fallback_is_partial() {
        let (store, _, pool) = store_with(Config {
            lease_insert_fallback: false,
            ..Config::default()
        })
        .await;
        require_client_id(&pool).await;

        let ip = Ipv4Addr::new(10, 129, 57, 30);
        let result = store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await;
        assert!(matches!(
            result,
            Err(Error::PartialReservationInconsistency { ip: partial, .. }) if partial == ip
        ));

        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert!(store.host_for_mac(mac).await.unwrap().is_some());
        assert!(store.lease_for_mac(mac).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_binary_mac_columns() {
        let (store, _, pool) = store().await;
        let store = store.with_mac_encoding(MacEncoding::Bytes);
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let ip = Ipv4Addr::new(10, 129, 57, 30);
        store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT typeof(dhcp_identifier) AS kind, length(dhcp_identifier) AS size, \
             hex(dhcp_identifier) AS octets FROM hosts",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let kind: String = row.try_get("kind").unwrap();
        let size: i64 = row.try_get("size").unwrap();
        let octets: String = row.try_get("octets").unwrap();
        assert_eq!(kind, "blob");
        assert_eq!(size, 6);
        assert_eq!(octets, "AABBCCDDEE01");

        let row = sqlx::query("SELECT length(hwaddr) AS size FROM lease4")
            .fetch_one(&pool)
            .await
            .unwrap();
        let size: i64 = row.try_get("size").unwrap();
        assert_eq!(size, 6);

        assert_eq!(store.lookup_mac_by_ip(ip).await.unwrap(), mac);
        assert_eq!(store.host_for_mac(mac).await.unwrap().unwrap().ip, ip);
        let lease = store.lease_for_mac(mac).await.unwrap().unwrap();
        assert_eq!(lease.mac, Some(mac));

        let report = store.remove_reservation(mac).await.unwrap();
        assert_eq!(report.hosts_removed, 1);
        assert_eq!(report.leases_removed, 1);
        assert!(report.complete);
    }

    #[tokio::test]
    async fn test_binary_client_id_fallback() {
        let (store, _, pool) = store().await;
        let store = store.with_mac_encoding(MacEncoding::Bytes);
        require_client_id(&pool).await;

        let reservation = store
            .register_reservation(&request(
                "aa:bb:cc:dd:ee:01",
                Ipv4Addr::new(10, 129, 57, 30),
                LeaseKind::Permanent,
            ))
            .await
            .unwrap();
        assert_eq!(reservation.lease_variant, LeaseInsertVariant::ExplicitClientId);

        let row = sqlx::query("SELECT hex(client_id) AS octets FROM lease4")
            .fetch_one(&pool)
            .await
            .unwrap();
        let octets: String = row.try_get("octets").unwrap();
        assert_eq!(octets, "01AABBCCDDEE01");
    }

    #[tokio::test]
    async fn test_remove_reservation() {
        let (store, _, _) = store().await;
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let ip = Ipv4Addr::new(10, 129, 57, 30);
        store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await
            .unwrap();

        let report = store.remove_reservation(mac).await.unwrap();
        assert!(report.complete);
        assert_eq!(report.hosts_removed, 1);
        assert_eq!(report.options_removed, 3);
        assert_eq!(report.leases_removed, 1);

        assert!(store.host_for_mac(mac).await.unwrap().is_none());
        assert!(store.lease_for_mac(mac).await.unwrap().is_none());
        assert!(matches!(store.lookup_mac_by_ip(ip).await, Err(Error::NotFound(_))));

        let report = store.remove_reservation(mac).await.unwrap();
        assert_eq!(report, RemovalReport { complete: true, ..RemovalReport::default() });
    }

    #[tokio::test]
    async fn test_removal_survives_failed_lease_transaction() {
        let (store, _, pool) = store().await;
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        store
            .register_reservation(&request(
                "aa:bb:cc:dd:ee:01",
                Ipv4Addr::new(10, 129, 57, 30),
                LeaseKind::Permanent,
            ))
            .await
            .unwrap();
        sqlx::query("DROP TABLE lease4").execute(&pool).await.unwrap();

        let report = store.remove_reservation(mac).await.unwrap();
        assert_eq!(
            report,
            RemovalReport {
                hosts_removed: 1,
                options_removed: 3,
                leases_removed: 0,
                complete: false,
            }
        );
        assert!(store.host_for_mac(mac).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removal_survives_failed_host_transaction() {
        let (store, _, pool) = store().await;
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let ip = Ipv4Addr::new(10, 129, 57, 30);
        store
            .register_reservation(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Permanent))
            .await
            .unwrap();
        sqlx::query("DROP TABLE dhcp4_options").execute(&pool).await.unwrap();

        let report = store.remove_reservation(mac).await.unwrap();
        assert_eq!(
            report,
            RemovalReport {
                hosts_removed: 0,
                options_removed: 0,
                leases_removed: 1,
                complete: false,
            }
        );
        // The host transaction rolled back as a whole.
        assert_eq!(store.host_for_mac(mac).await.unwrap().unwrap().ip, ip);
        assert!(store.lease_for_mac(mac).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_foreign_lease_is_replaced() {
        let (store, _, _) = store().await;
        let ip = Ipv4Addr::new(10, 250, 0, 17);
        let past = Utc::now() - TimeDelta::hours(1);
        store
            .register_reservation_at(&request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Temporary), past)
            .await
            .unwrap();
        // The first device's host row is gone, only its expired lease lingers.
        store.delete_hosts("aa:bb:cc:dd:ee:01".parse().unwrap()).await.unwrap();

        store
            .register_reservation(&request("aa:bb:cc:dd:ee:02", ip, LeaseKind::Temporary))
            .await
            .unwrap();
        let lease = store.lease_at(ip).await.unwrap().unwrap();
        assert_eq!(lease.mac, Some("aa:bb:cc:dd:ee:02".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_quarantine_gc_primitives() {
        let (store, _, _) = store().await;
        let now = Utc::now();
        let long_ago = now - TimeDelta::hours(2);

        store
            .register_reservation_at(
                &request("aa:bb:cc:dd:ee:01", Ipv4Addr::new(10, 250, 0, 17), LeaseKind::Temporary),
                long_ago,
            )
            .await
            .unwrap();
        store
            .register_reservation_at(
                &request("aa:bb:cc:dd:ee:02", Ipv4Addr::new(10, 250, 0, 18), LeaseKind::Temporary),
                now,
            )
            .await
            .unwrap();

        assert_eq!(store.delete_expired_quarantine_leases(now).await.unwrap(), 1);
        assert!(store.lease_at(Ipv4Addr::new(10, 250, 0, 17)).await.unwrap().is_none());
        assert!(store.lease_at(Ipv4Addr::new(10, 250, 0, 18)).await.unwrap().is_some());

        let occupied = store.occupied_quarantine(now).await.unwrap();
        assert!(occupied.contains(&Ipv4Addr::new(10, 250, 0, 17)));
        assert!(occupied.contains(&Ipv4Addr::new(10, 250, 0, 18)));
    }

    #[tokio::test]
    async fn test_stale_temporary_leases_removed_outside_quarantine() {
        let (store, _, _) = store().await;
        let now = Utc::now();
        let ip = Ipv4Addr::new(10, 129, 57, 30);
        store
            .register_reservation_at(
                &request("aa:bb:cc:dd:ee:01", ip, LeaseKind::Temporary),
                now - TimeDelta::hours(1),
            )
            .await
            .unwrap();

        assert_eq!(store.delete_expired_quarantine_leases(now).await.unwrap(), 0);
        assert_eq!(
            store
                .delete_stale_temporary_leases(now - TimeDelta::minutes(5))
                .await
                .unwrap(),
            1
        );
        assert!(store.lease_at(ip).await.unwrap().is_none());
    }
}
