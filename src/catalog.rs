//! Address space catalog.
//!
//! Describes the named address bands devices draw from. A band is an ordered
//! list of /24 prefixes sharing one DHCP subnet identifier; within each
//! prefix only the host octets of the configured [`HostRange`] are issued.
//! The quarantine band is kept apart from the role bands and has its own
//! host range.
//!
//! The catalog is plain configuration: it has no mutable state and never
//! touches the database.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const STUDENT_BAND: &str = "student";
pub const TEACHER_BAND: &str = "teacher";
pub const QUARANTINE_BAND: &str = "quarantine";

/// Role of a device owner. Each role maps to the band of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn band_name(&self) -> &'static str {
        match self {
            Self::Student => STUDENT_BAND,
            Self::Teacher => TEACHER_BAND,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.band_name())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            STUDENT_BAND => Ok(Self::Student),
            TEACHER_BAND => Ok(Self::Teacher),
            other => Err(Error::UnknownBand(other.to_string())),
        }
    }
}

/// Inclusive range of host octets issued within each /24 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRange {
    pub low: u8,
    pub high: u8,
}

impl HostRange {
    pub const fn new(low: u8, high: u8) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, octet: u8) -> bool {
        octet >= self.low && octet <= self.high
    }

    /// Number of host octets in the range.
    pub fn len(&self) -> u32 {
        if self.high < self.low {
            0
        } else {
            u32::from(self.high - self.low) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named group of /24 prefixes sharing one DHCP subnet identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    /// Kea `subnet_id` written into host and lease rows.
    pub subnet_id: u32,
    /// Network addresses (`a.b.c.0`) in allocation order.
    pub prefixes: Vec<Ipv4Addr>,
    /// Host octet of the router within each prefix.
    #[serde(default = "default_gateway_octet")]
    pub gateway_octet: u8,
}

fn default_gateway_octet() -> u8 {
    1
}

impl Band {
    pub fn new(name: &str, subnet_id: u32, prefixes: Vec<Ipv4Addr>) -> Self {
        Self {
            name: name.to_string(),
            subnet_id,
            prefixes,
            gateway_octet: default_gateway_octet(),
        }
    }

    /// Returns the prefix (`a.b.c.0`) holding `ip`, if it is one of ours.
    pub fn prefix_of(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let network = network_of(ip);
        self.prefixes.iter().copied().find(|prefix| *prefix == network)
    }

    /// Router address for the prefix holding `ip`.
    pub fn gateway_for(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.prefix_of(ip).map(|prefix| with_host(prefix, self.gateway_octet))
    }
}

/// Whether an address belongs to a role band or to the quarantine band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandKind {
    Role,
    Quarantine,
}

/// The complete set of bands the engine allocates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressCatalog {
    pub bands: Vec<Band>,
    pub quarantine: Band,
    pub host_range: HostRange,
    pub quarantine_range: HostRange,
}

impl Default for AddressCatalog {
    fn default() -> Self {
        Self {
            bands: vec![
                Band::new(
                    STUDENT_BAND,
                    2,
                    vec![
                        Ipv4Addr::new(10, 129, 56, 0),
                        Ipv4Addr::new(10, 129, 57, 0),
                        Ipv4Addr::new(10, 129, 58, 0),
                        Ipv4Addr::new(10, 129, 59, 0),
                    ],
                ),
                Band::new(
                    TEACHER_BAND,
                    1,
                    vec![Ipv4Addr::new(10, 129, 50, 0), Ipv4Addr::new(10, 129, 51, 0)],
                ),
            ],
            quarantine: Band::new(QUARANTINE_BAND, 99, vec![Ipv4Addr::new(10, 250, 0, 0)]),
            host_range: HostRange::new(20, 250),
            quarantine_range: HostRange::new(10, 249),
        }
    }
}

impl AddressCatalog {
    /// Looks up a role band by name.
    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|band| band.name == name)
    }

    /// Ordered prefixes of the band serving `role`.
    pub fn bands_for(&self, role: Role) -> &[Ipv4Addr] {
        self.band(role.band_name())
            .map(|band| band.prefixes.as_slice())
            .unwrap_or(&[])
    }

    pub fn host_range(&self) -> (u8, u8) {
        (self.host_range.low, self.host_range.high)
    }

    pub fn quarantine_range(&self) -> (u8, u8) {
        (self.quarantine_range.low, self.quarantine_range.high)
    }

    /// Finds the band an address belongs to.
    ///
    /// Only addresses inside the band's host range count; the network,
    /// router and broadcast octets of a prefix are never ours to issue.
    pub fn classify(&self, ip: Ipv4Addr) -> Option<(&Band, BandKind)> {
        let host = ip.octets()[3];
        if self.quarantine.prefix_of(ip).is_some() && self.quarantine_range.contains(host) {
            return Some((&self.quarantine, BandKind::Quarantine));
        }
        if !self.host_range.contains(host) {
            return None;
        }
        self.bands
            .iter()
            .find(|band| band.prefix_of(ip).is_some())
            .map(|band| (band, BandKind::Role))
    }

    pub fn is_quarantine(&self, ip: Ipv4Addr) -> bool {
        matches!(self.classify(ip), Some((_, BandKind::Quarantine)))
    }

    /// First and last issuable quarantine address of each quarantine
    /// prefix, as 32-bit integers.
    ///
    /// Used for `BETWEEN` filters on the lease and host tables.
    pub fn quarantine_spans(&self) -> Vec<(u32, u32)> {
        self.quarantine
            .prefixes
            .iter()
            .map(|prefix| {
                (
                    u32::from(with_host(*prefix, self.quarantine_range.low)),
                    u32::from(with_host(*prefix, self.quarantine_range.high)),
                )
            })
            .collect()
    }
}

/// Network address of the /24 holding `ip`.
pub fn network_of(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 0)
}

/// Address `host` within the /24 `prefix`.
pub fn with_host(prefix: Ipv4Addr, host: u8) -> Ipv4Addr {
    let [a, b, c, _] = prefix.octets();
    Ipv4Addr::new(a, b, c, host)
}
