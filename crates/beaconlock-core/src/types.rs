//! Shared domain types.
//!
//! Types used by more than one module live here: the beacon's identity,
//! link-layer handles and version info, and display surface identifiers.
//! Module-specific types stay in their modules (radio parameters in
//! [`crate::config`], lock reports in [`crate::lock`]).

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2})$")
        .unwrap_or_else(|_| unreachable!("static pattern is valid"))
});

/// Returns `true` if `address` is a colon-separated 48-bit address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BeaconAddress([u8; 6]);

impl BeaconAddress {
    /// Create an address from its six bytes, most significant first.
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The address bytes, most significant first.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

/// Error returned when parsing a malformed [`BeaconAddress`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address '{0}', expected XX:XX:XX:XX:XX:XX")]
pub struct InvalidAddress(pub String);

impl FromStr for BeaconAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MAC_ADDRESS_RE
            .captures(s)
            .ok_or_else(|| InvalidAddress(s.to_string()))?;

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&caps[i + 1], 16)
                .map_err(|_| InvalidAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BeaconAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BeaconAddress> for String {
    fn from(address: BeaconAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for BeaconAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Low Energy address type of the beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// IEEE-assigned public address.
    #[default]
    Public,
    /// Static or private random address.
    Random,
}

/// The single beacon this daemon trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconDevice {
    /// Device address.
    pub address: BeaconAddress,
    /// Address type used when whitelisting and connecting.
    pub address_type: AddressType,
}

impl fmt::Display for BeaconDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.address_type {
            AddressType::Public => "public",
            AddressType::Random => "random",
        };
        write!(f, "{} ({kind})", self.address)
    }
}

/// Controller-assigned handle of an established LE connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u16);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Reason code sent with a disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote user terminated connection (HCI error code 0x13).
    RemoteUserTerminated,
}

impl DisconnectReason {
    /// The HCI error code carried by the disconnect command.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::RemoteUserTerminated => 0x13,
        }
    }
}

/// Link-layer version codes as assigned by the Bluetooth SIG.
pub mod ll_version {
    /// Bluetooth Core 4.0, the first version with Low Energy.
    pub const CORE_4_0: u8 = 0x06;
    /// Bluetooth Core 4.1.
    pub const CORE_4_1: u8 = 0x07;
    /// Bluetooth Core 4.2.
    pub const CORE_4_2: u8 = 0x08;
    /// Bluetooth Core 5.0.
    pub const CORE_5_0: u8 = 0x09;
}

/// Remote version information reported by the peer's link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Link-layer version code (see [`ll_version`]).
    pub version: u8,
    /// Company identifier of the controller manufacturer.
    pub manufacturer: u16,
    /// Implementation-specific subversion.
    pub subversion: u16,
}

/// Identifier of one display surface that can be locked, e.g. an X display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub String);

impl SurfaceId {
    /// Create a surface identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: BeaconAddress = "00:07:80:7F:59:9E".parse().unwrap();
        assert_eq!(addr.octets(), [0x00, 0x07, 0x80, 0x7F, 0x59, 0x9E]);
        assert_eq!(addr.to_string(), "00:07:80:7F:59:9E");
    }

    #[test]
    fn test_parse_address_lowercase_normalizes() {
        let addr: BeaconAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        for bad in ["", "00:07:80:7F:59", "00-07-80-7F-59-9E", "GG:07:80:7F:59:9E", "00:07:80:7F:59:9E:01"] {
            assert!(bad.parse::<BeaconAddress>().is_err(), "{bad} should not parse");
            assert!(!is_valid_mac_address(bad));
        }
    }

    #[test]
    fn test_address_type_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: AddressType,
        }
        let w: Wrapper = toml::from_str("kind = \"random\"").unwrap();
        assert_eq!(w.kind, AddressType::Random);
    }

    #[test]
    fn test_disconnect_reason_code() {
        assert_eq!(DisconnectReason::RemoteUserTerminated.code(), 0x13);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ConnectionHandle(64).to_string(), "0x0040");
    }
}
