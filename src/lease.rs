//! Device lease lifecycle.
//!
//! [`LeaseManager`] moves devices through their states:
//!
//! ```text
//! Unregistered -> Active(permanent IP) -> Quarantined(temporary IP) -> Active(new permanent IP) -> Unregistered
//! ```
//!
//! Each transition composes the set of addresses in use from the device
//! registry, the reservation tables and the blacklist, asks the [`Allocator`]
//! for an address, writes the reservation and finally updates the registry.
//!
//! # Failure Semantics
//!
//! The steps of a transition run in independent transactions, so nothing is
//! rolled back across them. A failure is logged and returned; repeating the
//! call is safe because registering a reservation always clears the MAC's
//! previous one. Two transitions restore the prior reservation on failure:
//! [`LeaseManager::deactivate`] leaves the device active on its permanent
//! address and [`LeaseManager::reactivate`] leaves it in quarantine.
//!
//! # Concurrency
//!
//! No lock is held across store calls. Two callers may pick the same free
//! address; the unique key on (subnet, address) rejects the second host row
//! and the loser reselects, up to `allocation_attempts` times.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::AnyPool;
use tracing::{debug, error, info, warn};

use crate::allocator::Allocator;
use crate::blacklist::{BlacklistStore, SqlBlacklist};
use crate::catalog::Role;
use crate::config::{Config, sanitize_hostname};
use crate::device::{Device, DeviceRegistry, NewDevice, SqlDeviceRegistry};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::reservation::{LeaseKind, ReservationRequest, ReservationStore};

/// Rows deleted by one quarantine garbage-collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Quarantine-band leases past their expiry.
    pub expired_quarantine: u64,
    /// Temporary leases, in any band, past expiry by more than the grace period.
    pub stale_temporary: u64,
}

/// Orchestrates allocation, quarantine and blacklist reconciliation.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use leasegate::{Config, LeaseManager, NewDevice, Role};
///
/// # async fn example() -> leasegate::Result<()> {
/// let config = Arc::new(Config::default());
/// let manager = LeaseManager::connect(config).await?;
///
/// let device = manager
///     .register_device(NewDevice {
///         mac: "aa:bb:cc:dd:ee:01".parse()?,
///         name: "Chromebook".to_string(),
///         owner: "jdoe".to_string(),
///         role: Role::Student,
///     })
///     .await?;
/// println!("{} -> {:?}", device.mac, device.assigned_ip);
/// # Ok(())
/// # }
/// ```
pub struct LeaseManager {
    config: Arc<Config>,
    allocator: Allocator,
    reservations: ReservationStore,
    blacklist: Arc<dyn BlacklistStore>,
    devices: Arc<dyn DeviceRegistry>,
}

impl LeaseManager {
    pub fn new(
        config: Arc<Config>,
        pool: AnyPool,
        blacklist: Arc<dyn BlacklistStore>,
        devices: Arc<dyn DeviceRegistry>,
    ) -> Self {
        let allocator = Allocator::new(config.address_space.clone());
        let reservations = ReservationStore::new(pool, config.clone(), blacklist.clone());
        Self {
            config,
            allocator,
            reservations,
            blacklist,
            devices,
        }
    }

    /// Builds a manager whose blacklist and registry live in the same
    /// database as the reservation tables.
    pub fn from_pool(config: Arc<Config>, pool: AnyPool) -> Self {
        let timeout = config.store_timeout();
        let blacklist = Arc::new(SqlBlacklist::new(pool.clone(), timeout));
        let devices = Arc::new(SqlDeviceRegistry::new(pool.clone(), timeout));
        Self::new(config, pool, blacklist, devices)
    }

    /// Opens the configured database and builds a manager over it.
    ///
    /// The schema is not created here; see [`crate::db::init_schema`].
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let pool = crate::db::connect(&config.database_url, config.max_connections).await?;
        Ok(Self::from_pool(config, pool))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reservations(&self) -> &ReservationStore {
        &self.reservations
    }

    pub fn devices(&self) -> &dyn DeviceRegistry {
        self.devices.as_ref()
    }

    pub fn blacklist(&self) -> &dyn BlacklistStore {
        self.blacklist.as_ref()
    }

    /// Looks up a registered device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the MAC is not registered.
    pub async fn device(&self, mac: MacAddr) -> Result<Device> {
        self.devices
            .get(mac)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {}", mac)))
    }

    /// Registers a new device and gives it a permanent address.
    ///
    /// If no address can be reserved the registry row is deleted again, so a
    /// failed registration leaves nothing behind.
    pub async fn register_device(&self, new_device: NewDevice) -> Result<Device> {
        let role = new_device.role;
        let device = self.devices.create(new_device).await?;

        match self.allocate_and_register(&device, role).await {
            Ok(device) => Ok(device),
            Err(error) => {
                warn!("Registration of {} failed: {}", device.mac, error);
                if let Err(cleanup) = self.reservations.remove_reservation(device.mac).await {
                    warn!("Could not clear reservation of {}: {}", device.mac, cleanup);
                }
                if let Err(cleanup) = self.devices.delete(device.mac).await {
                    error!("Could not delete registry row of {}: {}", device.mac, cleanup);
                }
                Err(error)
            }
        }
    }

    /// Reserves a permanent address from the band of `role` and records it on
    /// the device, which becomes active.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressSpaceExhausted`] if the band has no free address.
    /// - Any reservation store error. The device is then saved without an
    ///   address.
    pub async fn allocate_and_register(&self, device: &Device, role: Role) -> Result<Device> {
        match self.place_permanent(device, role, None).await {
            Ok(ip) => {
                let mut updated = device.clone();
                updated.assigned_ip = Some(ip);
                updated.is_active = true;
                updated.role = role;
                self.devices.save(&updated).await?;
                info!("Assigned {} to {} ({})", ip, device.mac, role);
                Ok(updated)
            }
            Err(error) => {
                warn!("Could not allocate an address for {}: {}", device.mac, error);
                self.clear_assignment(device).await;
                Err(error)
            }
        }
    }

    /// Moves an active device to a different permanent address in its band.
    ///
    /// The old reservation is removed first; a failure to remove it is
    /// logged and does not stop the reassignment. The vacated address is
    /// never handed back. Inactive devices are left untouched.
    pub async fn reassign(&self, device: &Device) -> Result<Device> {
        if !device.is_active {
            debug!("Skipping reassignment of inactive device {}", device.mac);
            return Ok(device.clone());
        }

        let vacated = device.assigned_ip;
        if let Err(error) = self.reservations.remove_reservation(device.mac).await {
            warn!("Old reservation of {} not removed: {}", device.mac, error);
        }

        match self.place_permanent(device, device.role, vacated).await {
            Ok(ip) => {
                let mut updated = device.clone();
                updated.assigned_ip = Some(ip);
                self.devices.save(&updated).await?;
                info!("Reassigned {} from {:?} to {}", device.mac, vacated, ip);
                Ok(updated)
            }
            Err(error) => {
                warn!("Reassignment of {} failed: {}", device.mac, error);
                self.clear_assignment(device).await;
                Err(error)
            }
        }
    }

    /// Moves an active device into quarantine.
    ///
    /// The quarantine address is derived from the device id and carries the
    /// short quarantine lease. On failure the permanent reservation is
    /// restored and the device stays active. Deactivating an inactive device
    /// does nothing.
    pub async fn deactivate(&self, device: &Device) -> Result<Device> {
        if !device.is_active {
            debug!("{} is already deactivated", device.mac);
            return Ok(device.clone());
        }

        match self.enter_quarantine(device).await {
            Ok(updated) => Ok(updated),
            Err(error) => {
                error!("Deactivation of {} failed, restoring: {}", device.mac, error);
                self.restore(device, LeaseKind::Permanent).await;
                Err(error)
            }
        }
    }

    async fn enter_quarantine(&self, device: &Device) -> Result<Device> {
        self.reservations.remove_reservation(device.mac).await?;

        let hostname = sanitize_hostname(&device.name);
        let attempts = self.config.allocation_attempts.max(1);
        let mut attempt = 0;
        let ip = loop {
            attempt += 1;
            let occupied = self.occupied_quarantine(device.mac).await?;
            let ip = self.allocator.quarantine_ip(device.id, &occupied)?;
            let request = ReservationRequest {
                mac: device.mac,
                ip,
                hostname: hostname.clone(),
                kind: LeaseKind::Temporary,
                valid_lifetime: self.config.quarantine_lease_seconds,
            };
            match self.reservations.register_reservation(&request).await {
                Ok(_) => break ip,
                Err(Error::AddressConflict(taken) | Error::BlacklistedAddress(taken))
                    if attempt < attempts =>
                {
                    warn!("Quarantine address {} taken concurrently, reselecting", taken);
                }
                Err(error) => return Err(error),
            }
        };

        let mut updated = device.clone();
        updated.assigned_ip = Some(ip);
        updated.is_active = false;
        self.devices.save(&updated).await?;
        info!("Quarantined {} at {}", device.mac, ip);
        Ok(updated)
    }

    /// Brings a quarantined device back with a fresh permanent address.
    ///
    /// On failure the quarantine reservation is restored and the device
    /// stays inactive. Reactivating an active device does nothing.
    pub async fn reactivate(&self, device: &Device) -> Result<Device> {
        if device.is_active {
            debug!("{} is already active", device.mac);
            return Ok(device.clone());
        }

        match self.leave_quarantine(device).await {
            Ok(updated) => Ok(updated),
            Err(error) => {
                error!("Reactivation of {} failed, restoring: {}", device.mac, error);
                self.restore(device, LeaseKind::Temporary).await;
                Err(error)
            }
        }
    }

    async fn leave_quarantine(&self, device: &Device) -> Result<Device> {
        self.reservations.remove_reservation(device.mac).await?;

        let ip = self.place_permanent(device, device.role, None).await?;
        let mut updated = device.clone();
        updated.assigned_ip = Some(ip);
        updated.is_active = true;
        self.devices.save(&updated).await?;
        info!("Reactivated {} at {}", device.mac, ip);
        Ok(updated)
    }

    /// Removes the device's reservation and its registry row.
    ///
    /// Reservation removal is best-effort; the registry row is deleted even
    /// if it fails.
    pub async fn unregister_device(&self, mac: MacAddr) -> Result<Device> {
        let device = self.device(mac).await?;

        if let Err(error) = self.reservations.remove_reservation(mac).await {
            warn!("Reservation of {} not removed: {}", mac, error);
        }
        self.devices.delete(mac).await?;
        info!("Unregistered {}", mac);
        Ok(device)
    }

    /// Blacklists `ip` and reassigns every active device holding it.
    ///
    /// Blacklisting an address twice is not an error; the devices holding it
    /// are still reassigned. Returns the devices that moved. The entry stays
    /// in place when a holder cannot be moved.
    pub async fn blacklist_add(&self, ip: Ipv4Addr, reason: &str) -> Result<Vec<Device>> {
        if !self.blacklist.add(ip, reason).await? {
            debug!("{} was already blacklisted", ip);
        }

        let holders = self.devices.find_by_ip(ip).await?;
        self.reassign_each(holders.into_iter().filter(|device| device.is_active))
            .await
    }

    pub async fn blacklist_remove(&self, ip: Ipv4Addr) -> Result<()> {
        self.blacklist.remove(ip).await
    }

    /// Reassigns every active device whose address is blacklisted.
    ///
    /// Catches up with blacklist entries added while a previous
    /// reassignment failed or while the service was down.
    pub async fn reconcile_blacklist(&self) -> Result<Vec<Device>> {
        let blacklisted: HashSet<Ipv4Addr> = self.blacklist.list_all().await?.into_iter().collect();
        if blacklisted.is_empty() {
            return Ok(Vec::new());
        }

        let mut holders = Vec::new();
        for device in self.devices.list_all().await? {
            if device.is_active
                && let Some(ip) = device.assigned_ip
                && blacklisted.contains(&ip)
            {
                warn!("{} holds blacklisted address {}", device.mac, ip);
                holders.push(device);
            }
        }
        self.reassign_each(holders).await
    }

    /// Reassigns every device in turn.
    ///
    /// A failure does not stop the remaining devices; once all have been
    /// tried the first error is returned.
    async fn reassign_each(&self, devices: impl IntoIterator<Item = Device>) -> Result<Vec<Device>> {
        let mut reassigned = Vec::new();
        let mut first_error = None;
        for device in devices {
            match self.reassign(&device).await {
                Ok(updated) => reassigned.push(updated),
                Err(error) => {
                    error!("Could not move {} off {:?}: {}", device.mac, device.assigned_ip, error);
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(reassigned),
        }
    }

    /// Deletes expired quarantine leases.
    pub async fn garbage_collect_quarantine(&self) -> Result<GcReport> {
        self.garbage_collect_quarantine_at(Utc::now()).await
    }

    /// Runs both sweeps as of `now`.
    ///
    /// The first deletes quarantine-band leases that have expired. The second
    /// deletes temporary-tagged leases anywhere that expired more than
    /// `stale_grace_seconds` ago, catching leases the first sweep missed. The
    /// second sweep runs even if the first fails.
    pub async fn garbage_collect_quarantine_at(&self, now: DateTime<Utc>) -> Result<GcReport> {
        let mut first_error = None;

        let expired_quarantine = match self.reservations.delete_expired_quarantine_leases(now).await {
            Ok(count) => count,
            Err(error) => {
                warn!("Expired quarantine sweep failed: {}", error);
                first_error = Some(error);
                0
            }
        };

        let cutoff = TimeDelta::try_seconds(self.config.stale_grace_seconds)
            .and_then(|grace| now.checked_sub_signed(grace))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "stale_grace_seconds {} is out of range",
                    self.config.stale_grace_seconds
                ))
            })?;
        let stale_temporary = self.reservations.delete_stale_temporary_leases(cutoff).await?;

        let report = GcReport {
            expired_quarantine,
            stale_temporary,
        };
        if report.expired_quarantine > 0 || report.stale_temporary > 0 {
            info!(
                "Quarantine GC removed {} expired and {} stale leases",
                report.expired_quarantine, report.stale_temporary
            );
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    /// Addresses a new permanent reservation must avoid: every other
    /// device's address, every reserved or leased address, and the blacklist.
    async fn excluded_addresses(&self, skip: MacAddr) -> Result<HashSet<Ipv4Addr>> {
        let mut excluded = HashSet::new();
        for device in self.devices.list_all().await? {
            if device.mac != skip {
                excluded.extend(device.assigned_ip);
            }
        }
        excluded.extend(self.reservations.addresses_in_use(Utc::now()).await?);
        excluded.extend(self.blacklist.list_all().await?);
        Ok(excluded)
    }

    async fn occupied_quarantine(&self, skip: MacAddr) -> Result<HashSet<Ipv4Addr>> {
        let catalog = self.allocator.catalog();
        let mut occupied = self.reservations.occupied_quarantine(Utc::now()).await?;
        for device in self.devices.list_all().await? {
            if device.mac != skip
                && let Some(ip) = device.assigned_ip
                && catalog.is_quarantine(ip)
            {
                occupied.insert(ip);
            }
        }
        occupied.extend(self.blacklist.list_all().await?);
        Ok(occupied)
    }

    /// Picks and reserves a permanent address, reselecting when another
    /// writer takes the chosen address first.
    async fn place_permanent(
        &self,
        device: &Device,
        role: Role,
        vacated: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let band = role.band_name();
        let hostname = sanitize_hostname(&device.name);
        let attempts = self.config.allocation_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut excluded = self.excluded_addresses(device.mac).await?;
            excluded.extend(vacated);

            let ip = self.allocator.find_available_ip(band, &excluded)?;
            let request = ReservationRequest {
                mac: device.mac,
                ip,
                hostname: hostname.clone(),
                kind: LeaseKind::Permanent,
                valid_lifetime: self.config.permanent_lease_seconds,
            };

            match self.reservations.register_reservation(&request).await {
                Ok(_) => return Ok(ip),
                Err(Error::AddressConflict(taken) | Error::BlacklistedAddress(taken))
                    if attempt < attempts =>
                {
                    warn!(
                        "{} taken before {} could reserve it (attempt {}/{}), reselecting",
                        taken, device.mac, attempt, attempts
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Re-registers the device's recorded address after a failed transition.
    async fn restore(&self, device: &Device, kind: LeaseKind) {
        let Some(ip) = device.assigned_ip else {
            return;
        };
        let valid_lifetime = match kind {
            LeaseKind::Permanent => self.config.permanent_lease_seconds,
            LeaseKind::Temporary => self.config.quarantine_lease_seconds,
        };
        let request = ReservationRequest {
            mac: device.mac,
            ip,
            hostname: sanitize_hostname(&device.name),
            kind,
            valid_lifetime,
        };
        match self.reservations.register_reservation(&request).await {
            Ok(_) => info!("Restored reservation {} for {}", ip, device.mac),
            Err(error) => error!(
                "Could not restore reservation {} for {}: {}",
                ip, device.mac, error
            ),
        }
    }

    async fn clear_assignment(&self, device: &Device) {
        if device.assigned_ip.is_none() {
            return;
        }
        let mut cleared = device.clone();
        cleared.assigned_ip = None;
        if let Err(error) = self.devices.save(&cleared).await {
            error!("Could not clear the address of {}: {}", device.mac, error);
        }
    }
}
