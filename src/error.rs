//! Error types for the reservation engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while allocating, reserving or reclaiming addresses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file, lease tags).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reported by the database driver outside a reservation write.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No free address is left in the named band.
    ///
    /// Every host address of every prefix in the band is claimed by a device,
    /// a live lease, a host reservation or the blacklist.
    #[error("No available IP addresses in band '{0}'")]
    AddressSpaceExhausted(String),

    /// A reservation store transaction failed.
    #[error("Reservation write failed: {0}")]
    ReservationWriteFailed(String),

    /// Host and option rows were written but no lease row could be inserted.
    ///
    /// The reservation exists without a matching lease. This is not repaired
    /// automatically; operators reconcile it by hand or by re-running the
    /// registration, which clears the prior state first.
    #[error("Reservation for {mac} at {ip} has host and options but no lease")]
    PartialReservationInconsistency { mac: String, ip: Ipv4Addr },

    /// The target address is on the blacklist.
    #[error("Address {0} is blacklisted")]
    BlacklistedAddress(Ipv4Addr),

    /// Another host reservation already holds the address in the same subnet.
    ///
    /// Raised when the uniqueness constraint on (subnet, address) rejects the
    /// host row. The lifecycle manager reselects and retries.
    #[error("Address {0} is already reserved")]
    AddressConflict(Ipv4Addr),

    /// The address does not belong to any configured band.
    #[error("Address {0} is outside every configured band")]
    AddressOutOfRange(Ipv4Addr),

    /// No band with this name is configured.
    #[error("Unknown band '{0}'")]
    UnknownBand(String),

    /// The operation targeted a MAC or IP with no matching record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A device with this MAC is already in the registry.
    #[error("Device {0} is already registered")]
    AlreadyRegistered(String),

    /// Malformed MAC address.
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., overlapping bands).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A store operation exceeded its deadline.
    #[error("Store operation '{0}' timed out")]
    Timeout(&'static str),
}

impl Error {
    /// Returns true for errors caused by the request itself rather than by
    /// the service.
    ///
    /// Validation errors are rejected before any store mutation happens.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidMac(_)
                | Self::AlreadyRegistered(_)
                | Self::BlacklistedAddress(_)
                | Self::AddressOutOfRange(_)
                | Self::UnknownBand(_)
        )
    }
}

/// A specialized Result type for reservation operations.
pub type Result<T> = std::result::Result<T, Error>;
