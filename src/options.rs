//! Per-host DHCP options written alongside a host reservation.
//!
//! Every reservation carries exactly three options, stored as rows of the
//! `dhcp4_options` table and tied to the host by `host_id`:
//!
//! - Router (option 3)
//! - DNS server (option 6)
//! - DHCP server identifier (option 54)
//!
//! Values are stored in the daemon's `formatted_value` text form (a dotted
//! quad), in the `dhcp4` option space, at host scope.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::fmt;
use std::net::Ipv4Addr;

/// Option space name used by the DHCPv4 daemon.
pub const OPTION_SPACE: &str = "dhcp4";

/// `scope_id` value marking an option as belonging to a single host.
pub const HOST_SCOPE: i64 = 3;

/// DHCP option codes written for host reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionCode {
    /// Router/gateway address (RFC 2132 §3.5).
    Router = 3,
    /// DNS server address (RFC 2132 §3.8).
    DnsServer = 6,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            54 => Ok(Self::ServerIdentifier),
            other => Err(other),
        }
    }
}

impl fmt::Display for OptionCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Router => "routers",
            Self::DnsServer => "domain-name-servers",
            Self::ServerIdentifier => "dhcp-server-identifier",
        };
        formatter.write_str(name)
    }
}

/// One option row of a host reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOption {
    pub code: OptionCode,
    pub value: Ipv4Addr,
}

impl HostOption {
    pub fn formatted_value(&self) -> String {
        self.value.to_string()
    }
}

/// The option set every reservation receives, in insertion order.
pub fn reservation_options(
    gateway: Ipv4Addr,
    dns_server: Ipv4Addr,
    dhcp_server: Ipv4Addr,
) -> [HostOption; 3] {
    [
        HostOption {
            code: OptionCode::Router,
            value: gateway,
        },
        HostOption {
            code: OptionCode::DnsServer,
            value: dns_server,
        },
        HostOption {
            code: OptionCode::ServerIdentifier,
            value: dhcp_server,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_code_conversions() {
        for code in [OptionCode::Router, OptionCode::DnsServer, OptionCode::ServerIdentifier] {
            assert_eq!(OptionCode::try_from(code as u8).unwrap(), code);
        }
        assert_eq!(OptionCode::try_from(1), Err(1));
        assert_eq!(OptionCode::try_from(55), Err(55));
    }

    #[test]
    fn test_reservation_options_wire_values() {
        let options = reservation_options(
            Ipv4Addr::new(10, 129, 57, 1),
            Ipv4Addr::new(10, 129, 0, 53),
            Ipv4Addr::new(10, 129, 0, 67),
        );
        let codes: Vec<u8> = options.iter().map(|option| option.code as u8).collect();
        assert_eq!(codes, vec![3, 6, 54]);
        assert_eq!(options[0].formatted_value(), "10.129.57.1");
        assert_eq!(options[2].formatted_value(), "10.129.0.67");
    }

    #[test]
    fn test_option_code_display() {
        assert_eq!(OptionCode::Router.to_string(), "routers");
        assert_eq!(OptionCode::DnsServer.to_string(), "domain-name-servers");
        assert_eq!(OptionCode::ServerIdentifier.to_string(), "dhcp-server-identifier");
    }
}
