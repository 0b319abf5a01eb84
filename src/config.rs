use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::catalog::{AddressCatalog, Band, HostRange};
use crate::error::{Error, Result};

/// Longest DNS label a hostname may carry.
const MAX_HOSTNAME_LENGTH: usize = 63;

/// Upper bound on `stale_grace_seconds` (one day).
pub const MAX_STALE_GRACE_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reservation database, e.g. `mysql://kea:secret@db/kea` or `sqlite://kea.db`.
    pub database_url: String,
    pub max_connections: u32,
    pub address_space: AddressCatalog,
    /// Value of DHCP option 6 for every reservation.
    pub dns_server: Ipv4Addr,
    /// Value of DHCP option 54 for every reservation.
    pub dhcp_server: Ipv4Addr,
    pub permanent_lease_seconds: u32,
    pub quarantine_lease_seconds: u32,
    pub gc_interval_seconds: u64,
    /// How far past expiry a temporary lease may linger before the coarse
    /// sweep removes it regardless of band.
    pub stale_grace_seconds: i64,
    pub store_timeout_millis: u64,
    /// Attempts at picking an address when a concurrent writer wins the race.
    pub allocation_attempts: u32,
    /// Try the legacy client-id variants when the primary lease insert fails.
    pub lease_insert_fallback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://leasegate.db?mode=rwc".to_string(),
            max_connections: 8,
            address_space: AddressCatalog::default(),
            dns_server: Ipv4Addr::new(10, 129, 0, 53),
            dhcp_server: Ipv4Addr::new(10, 129, 0, 67),
            permanent_lease_seconds: 100 * 24 * 3600,
            quarantine_lease_seconds: 300,
            gc_interval_seconds: 60,
            stale_grace_seconds: 300,
            store_timeout_millis: 5000,
            allocation_attempts: 3,
            lease_insert_fallback: true,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let catalog = &self.address_space;

        if catalog.bands.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one role band must be configured".to_string(),
            ));
        }

        validate_range("host_range", catalog.host_range)?;
        validate_range("quarantine_range", catalog.quarantine_range)?;

        let mut names = HashSet::new();
        let mut subnet_ids = HashSet::new();
        let mut prefixes = HashSet::new();

        for band in catalog.bands.iter().chain(std::iter::once(&catalog.quarantine)) {
            validate_band(band)?;

            if !names.insert(band.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "band '{}' is defined more than once",
                    band.name
                )));
            }
            if !subnet_ids.insert(band.subnet_id) {
                return Err(Error::InvalidConfig(format!(
                    "subnet_id {} is used by more than one band",
                    band.subnet_id
                )));
            }
            for prefix in &band.prefixes {
                if !prefixes.insert(*prefix) {
                    return Err(Error::InvalidConfig(format!(
                        "prefix {} appears in more than one band",
                        prefix
                    )));
                }
            }
        }

        if self.permanent_lease_seconds == 0 || self.quarantine_lease_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease lifetimes must be greater than 0".to_string(),
            ));
        }

        if self.quarantine_lease_seconds >= self.permanent_lease_seconds {
            return Err(Error::InvalidConfig(
                "quarantine_lease_seconds must be shorter than permanent_lease_seconds".to_string(),
            ));
        }

        if self.allocation_attempts == 0 {
            return Err(Error::InvalidConfig(
                "allocation_attempts must be greater than 0".to_string(),
            ));
        }

        if self.store_timeout_millis == 0 || self.gc_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "store_timeout_millis and gc_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if !(0..=MAX_STALE_GRACE_SECONDS).contains(&self.stale_grace_seconds) {
            return Err(Error::InvalidConfig(format!(
                "stale_grace_seconds must be between 0 and {} (got {})",
                MAX_STALE_GRACE_SECONDS, self.stale_grace_seconds
            )));
        }

        if self.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_millis)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }
}

fn validate_range(field: &str, range: HostRange) -> Result<()> {
    if range.low == 0 || range.high == 255 || range.low > range.high {
        return Err(Error::InvalidConfig(format!(
            "{} must satisfy 1 <= low <= high <= 254 (got {}-{})",
            field, range.low, range.high
        )));
    }
    Ok(())
}

fn validate_band(band: &Band) -> Result<()> {
    if band.name.trim().is_empty() {
        return Err(Error::InvalidConfig("band name must not be empty".to_string()));
    }
    if band.prefixes.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "band '{}' has no prefixes",
            band.name
        )));
    }
    for prefix in &band.prefixes {
        if prefix.octets()[3] != 0 {
            return Err(Error::InvalidConfig(format!(
                "prefix {} of band '{}' is not a /24 network address",
                prefix, band.name
            )));
        }
    }
    Ok(())
}

/// Reduces a display name to a DNS-safe hostname label.
///
/// Lowercases ASCII letters, keeps digits and hyphens, turns whitespace and
/// underscores into hyphens and drops everything else. Leading and trailing
/// hyphens are trimmed and the result is capped at 63 characters.
pub fn sanitize_hostname(name: &str) -> Option<String> {
    let mapped: String = name
        .chars()
        .filter_map(|character| match character {
            'a'..='z' | '0'..='9' | '-' => Some(character),
            'A'..='Z' => Some(character.to_ascii_lowercase()),
            ' ' | '_' | '\t' => Some('-'),
            _ => None,
        })
        .collect();

    let trimmed: String = mapped
        .trim_matches('-')
        .chars()
        .take(MAX_HOSTNAME_LENGTH)
        .collect();
    let trimmed = trimmed.trim_end_matches('-');

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_range_inverted() {
        let mut config = Config::default();
        config.address_space.host_range = HostRange::new(250, 20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_host_range_covers_broadcast() {
        let mut config = Config::default();
        config.address_space.quarantine_range = HostRange::new(10, 255);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlapping_prefixes_rejected() {
        let mut config = Config::default();
        config.address_space.bands[1]
            .prefixes
            .push(Ipv4Addr::new(10, 129, 57, 0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_subnet_id_rejected() {
        let mut config = Config::default();
        config.address_space.quarantine.subnet_id = config.address_space.bands[0].subnet_id;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefix_must_be_network_address() {
        let mut config = Config::default();
        config.address_space.bands[0].prefixes[0] = Ipv4Addr::new(10, 129, 56, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quarantine_lifetime_must_be_short() {
        let config = Config {
            quarantine_lease_seconds: 100 * 24 * 3600,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_grace_bounds() {
        for stale_grace_seconds in [-1, MAX_STALE_GRACE_SECONDS + 1, i64::MAX] {
            let config = Config {
                stale_grace_seconds,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }

        let config = Config {
            stale_grace_seconds: MAX_STALE_GRACE_SECONDS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = Config {
            allocation_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "leasegate_config_{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let created = Config::load_or_create(&path).unwrap();
        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(created.address_space, loaded.address_space);
        assert_eq!(loaded.quarantine_lease_seconds, 300);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("Anna's iPad"), Some("annas-ipad".to_string()));
        assert_eq!(sanitize_hostname("--Lab_PC 07--"), Some("lab-pc-07".to_string()));
        assert_eq!(sanitize_hostname("!!!"), None);
        assert_eq!(sanitize_hostname(&"x".repeat(100)).unwrap().len(), 63);
    }
}
