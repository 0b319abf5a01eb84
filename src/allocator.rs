//! Address selection.
//!
//! The allocator is a pure function of the catalog and a caller-supplied set
//! of addresses that are already in use. It never reads the database; the
//! lifecycle manager composes the in-use set from the device registry, the
//! reservation tables and the blacklist before every call.
//!
//! Selection is deterministic: the same band and in-use set always yield the
//! same address.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::catalog::{AddressCatalog, QUARANTINE_BAND, with_host};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Allocator {
    catalog: AddressCatalog,
}

impl Allocator {
    pub fn new(catalog: AddressCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &AddressCatalog {
        &self.catalog
    }

    /// Returns the lowest free address of `band`.
    ///
    /// Prefixes are scanned in their configured order and host octets in
    /// ascending order within each prefix; the first address absent from
    /// `excluded` wins.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownBand`] if no role band has this name.
    /// - [`Error::AddressSpaceExhausted`] if every address is excluded.
    pub fn find_available_ip(&self, band: &str, excluded: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let band = self
            .catalog
            .band(band)
            .ok_or_else(|| Error::UnknownBand(band.to_string()))?;
        let (low, high) = self.catalog.host_range();

        for prefix in &band.prefixes {
            for host in low..=high {
                let candidate = with_host(*prefix, host);
                if !excluded.contains(&candidate) {
                    return Ok(candidate);
                }
            }
        }

        Err(Error::AddressSpaceExhausted(band.name.clone()))
    }

    /// Picks the quarantine address for a device.
    ///
    /// The starting host octet is `low + (device_id mod count)`, where
    /// `count` is the size of the quarantine host range (`10 + id mod 240`
    /// with the default 10-249 range). On collision the probe moves forward,
    /// wrapping from `high` back to `low`, then on to the next quarantine
    /// prefix.
    pub fn quarantine_ip(&self, device_id: i64, occupied: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let range = self.catalog.quarantine_range;
        let count = range.len();
        if count == 0 {
            return Err(Error::AddressSpaceExhausted(QUARANTINE_BAND.to_string()));
        }
        let offset = device_id.rem_euclid(i64::from(count)) as u32;

        for prefix in &self.catalog.quarantine.prefixes {
            for step in 0..count {
                let host = range.low as u32 + (offset + step) % count;
                let candidate = with_host(*prefix, host as u8);
                if !occupied.contains(&candidate) {
                    return Ok(candidate);
                }
            }
        }

        Err(Error::AddressSpaceExhausted(QUARANTINE_BAND.to_string()))
    }
}
