//! # leasegate
//!
//! IP/DHCP reservation allocation engine for a captive-portal network-access
//! controller.
//!
//! Devices are bound by MAC address to IPv4 addresses drawn from segregated
//! student and teacher bands. Bindings are written straight into the
//! Kea-style reservation tables (`hosts`, `dhcp4_options`, `lease4`) that the
//! external DHCP daemon reads.
//!
//! ## Features
//!
//! - Deterministic lowest-free-address allocation per band
//! - Host reservation, per-host options (router, DNS, server identifier) and lease in one call
//! - Quarantine band for deactivated devices, with short-lived leases
//! - Blacklist with automatic reassignment of affected devices
//! - Background garbage collection of expired quarantine leases
//! - Race-safe allocation through a unique key and reselect-on-conflict
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use leasegate::{Config, LeaseManager, db};
//!
//! #[tokio::main]
//! async fn main() -> leasegate::Result<()> {
//!     let config = Arc::new(Config::load_or_create("leasegate.json")?);
//!     let manager = LeaseManager::connect(config.clone()).await?;
//!     let backend = db::Backend::from_url(&config.database_url)?;
//!     db::init_schema(manager.reservations().pool(), backend).await?;
//!
//!     let device = manager.device("aa:bb:cc:dd:ee:01".parse()?).await?;
//!     let quarantined = manager.deactivate(&device).await?;
//!     println!("{} quarantined at {:?}", quarantined.mac, quarantined.assigned_ip);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`AddressCatalog`] - Bands, prefixes and host ranges
//! - [`Allocator`] - Address selection, pure and deterministic
//! - [`ReservationStore`] - Raw SQL over the DHCP daemon's tables
//! - [`BlacklistStore`] - Addresses that must never be issued
//! - [`DeviceRegistry`] - MAC to owner, role, address and active flag
//! - [`LeaseManager`] - Device lifecycle orchestration
//! - [`QuarantineCollector`] - Periodic quarantine lease cleanup

pub mod allocator;
pub mod blacklist;
pub mod catalog;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod gc;
pub mod lease;
pub mod mac;
pub mod options;
pub mod reservation;

pub use allocator::Allocator;
pub use blacklist::{BlacklistStore, BlacklistedIp, SqlBlacklist};
pub use catalog::{AddressCatalog, Band, HostRange, Role};
pub use config::Config;
pub use device::{Device, DeviceRegistry, NewDevice, SqlDeviceRegistry};
pub use error::{Error, Result};
pub use gc::QuarantineCollector;
pub use lease::{GcReport, LeaseManager};
pub use mac::MacAddr;
pub use reservation::{LeaseKind, RemovalReport, Reservation, ReservationRequest, ReservationStore};
