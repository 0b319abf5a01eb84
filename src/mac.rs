//! Hardware (MAC) addresses.
//!
//! Devices are identified by their 48-bit MAC address. User input arrives in
//! many spellings (`aa:bb:cc:dd:ee:01`, `AA-BB-CC-DD-EE-01`,
//! `aabb.ccdd.ee01`, `aabbccddee01`); all of them normalise to the same
//! [`MacAddr`]. The DHCP tables store the address as twelve lowercase hex
//! digits without separators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A 48-bit IEEE 802 hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Storage form used by the DHCP tables: `aabbccddee01`.
    pub fn to_storage(&self) -> String {
        self.0.iter().map(|byte| format!("{:02x}", byte)).collect()
    }

    /// DHCP client identifier (option 61) for an Ethernet client:
    /// hardware type `01` followed by the address, hex encoded.
    pub fn client_id(&self) -> String {
        format!("01{}", self.to_storage())
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let digits: String = input
            .trim()
            .chars()
            .filter(|character| !matches!(character, ':' | '-' | '.'))
            .collect();

        if digits.len() != 12 || !digits.chars().all(|character| character.is_ascii_hexdigit()) {
            return Err(Error::InvalidMac(input.to_string()));
        }

        let mut octets = [0u8; 6];
        for (index, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[index * 2..index * 2 + 2], 16)
                .map_err(|_| Error::InvalidMac(input.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, f] = self.0;
        write!(
            formatter,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, f
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spellings() {
        let expected = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        for input in [
            "aa:bb:cc:dd:ee:01",
            "AA-BB-CC-DD-EE-01",
            "aabb.ccdd.ee01",
            "aabbccddee01",
            "  aa:bb:cc:dd:ee:01\n",
        ] {
            assert_eq!(input.parse::<MacAddr>().unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for input in ["", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:01:02", "gg:bb:cc:dd:ee:01", "+a:bb:cc:dd:ee:01"] {
            assert!(matches!(input.parse::<MacAddr>(), Err(Error::InvalidMac(_))), "{input}");
        }
    }

    #[test]
    fn test_storage_and_display() {
        let mac: MacAddr = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(mac.to_storage(), "aabbccddee01");
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:01");
        assert_eq!(mac.client_id(), "01aabbccddee01");
        assert_eq!(mac.to_storage().parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn test_serde_as_string() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"aa:bb:cc:dd:ee:01\"");
        assert_eq!(serde_json::from_str::<MacAddr>(&json).unwrap(), mac);
    }
}
