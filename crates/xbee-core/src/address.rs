//! Radio address types and their bracketed string forms
//!
//! Addresses cross the API boundary as strings:
//! - extended (64-bit): `[00:13:a2:00:40:0a:01:27]!`
//! - short (16-bit): `[FFFE]!`
//! - the empty string, meaning the local radio itself
//!
//! Internally they are plain integers wrapped in newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address length {len}: {text:?}")]
    InvalidLength { text: String, len: usize },
    #[error("invalid hex digits in address: {0:?}")]
    InvalidHex(String),
    #[error("address must end with '!': {0:?}")]
    MissingTerminator(String),
}

/// 64-bit IEEE extended address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtendedAddress(pub u64);

impl ExtendedAddress {
    /// Extended address used by the radio for "unknown / use short address"
    pub const UNKNOWN: Self = Self(0xFFFF_FFFF_FFFF_FFFF);
    /// All-zero address, used as source of synthetic status records
    pub const ZERO: Self = Self(0);

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for ExtendedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "[{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}]!",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for ExtendedAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // 26 with brackets, 24 without
        if s.len() != 26 && s.len() != 24 {
            return Err(AddressError::InvalidLength {
                text: s.to_string(),
                len: s.len(),
            });
        }
        let inner = strip_decoration(s)?;
        let digits: String = inner.split(':').collect();
        if digits.len() != 16
            || inner.split(':').count() != 8
            || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(AddressError::InvalidHex(s.to_string()));
        }
        u64::from_str_radix(&digits, 16)
            .map(Self)
            .map_err(|_| AddressError::InvalidHex(s.to_string()))
    }
}

/// 16-bit network-assigned address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortAddress(pub u16);

impl ShortAddress {
    /// "Unknown" short address, also used for "no parent"
    pub const UNKNOWN: Self = Self(0xFFFE);
    pub const ZERO: Self = Self(0);

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:04X}]!", self.0)
    }
}

impl FromStr for ShortAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 7 && s.len() != 5 {
            return Err(AddressError::InvalidLength {
                text: s.to_string(),
                len: s.len(),
            });
        }
        let inner = strip_decoration(s)?;
        if inner.len() != 4 || !inner.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::InvalidHex(s.to_string()));
        }
        u16::from_str_radix(inner, 16)
            .map(Self)
            .map_err(|_| AddressError::InvalidHex(s.to_string()))
    }
}

/// Strip the optional `[` `]` and the mandatory trailing `!`
fn strip_decoration(s: &str) -> Result<&str, AddressError> {
    let body = s
        .strip_suffix('!')
        .ok_or_else(|| AddressError::MissingTerminator(s.to_string()))?;
    match body.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| AddressError::InvalidHex(s.to_string())),
        None => Ok(body),
    }
}

/// Any address that can appear in a socket address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// The local radio; traffic loops back without touching the serial link
    Local,
    Extended(ExtendedAddress),
    Short(ShortAddress),
}

impl Address {
    pub fn is_local(&self) -> bool {
        matches!(self, Address::Local)
    }
}

impl From<ExtendedAddress> for Address {
    fn from(addr: ExtendedAddress) -> Self {
        Address::Extended(addr)
    }
}

impl From<ShortAddress> for Address {
    fn from(addr: ShortAddress) -> Self {
        Address::Short(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Local => Ok(()),
            Address::Extended(a) => a.fmt(f),
            Address::Short(a) => a.fmt(f),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            0 => Ok(Address::Local),
            5 | 7 => s.parse().map(Address::Short),
            _ => s.parse().map(Address::Extended),
        }
    }
}

/// Socket-level address: `(address, endpoint, profile_id, cluster_id, options, tag)`
///
/// `options` carries the per-packet transmit/receive option bits
/// (see [`options`]); `tag` is a caller-chosen correlation value that asks
/// for a transmit-status record to be delivered back to the sending socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub address: Address,
    pub endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub options: Option<u8>,
    pub tag: Option<u32>,
}

impl SocketAddress {
    pub fn new(address: Address, endpoint: u8, profile_id: u16, cluster_id: u16) -> Self {
        Self {
            address,
            endpoint,
            profile_id,
            cluster_id,
            options: None,
            tag: None,
        }
    }

    pub fn with_options(mut self, options: u8) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = Some(tag);
        self
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:?}, {:#04x}, {:#06x}, {:#06x})",
            self.address.to_string(),
            self.endpoint,
            self.profile_id,
            self.cluster_id
        )
    }
}

/// Per-packet option bits carried in [`SocketAddress::options`]
pub mod options {
    /// Disable end-to-end acknowledgement of the frame
    pub const TX_NOACK: u8 = 0x01;
    /// Purge the packet if delayed by duty cycle
    pub const TX_PURGE: u8 = 0x10;
    /// APS end-to-end security
    pub const TX_APSSEC: u8 = 0x20;
    /// Packet was acknowledged
    pub const RX_ACK: u8 = 0x01;
    /// Packet was received from the broadcast address
    pub const RX_BCADDR: u8 = 0x02;
    /// Packet was received with APS security
    pub const RX_APSSEC: u8 = 0x20;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_display() {
        let addr = ExtendedAddress(0x0013_A200_400A_0127);
        assert_eq!(addr.to_string(), "[00:13:a2:00:40:0a:01:27]!");
    }

    #[test]
    fn test_extended_parse_forms() {
        let bracketed: ExtendedAddress = "[00:13:A2:00:40:0a:01:27]!".parse().unwrap();
        let bare: ExtendedAddress = "00:13:a2:00:40:0a:01:27!".parse().unwrap();
        assert_eq!(bracketed, ExtendedAddress(0x0013_A200_400A_0127));
        assert_eq!(bracketed, bare);
    }

    #[test]
    fn test_short_display_and_parse() {
        assert_eq!(ShortAddress(0xfffe).to_string(), "[FFFE]!");
        assert_eq!("[1a2B]!".parse::<ShortAddress>().unwrap(), ShortAddress(0x1A2B));
        assert_eq!("1234!".parse::<ShortAddress>().unwrap(), ShortAddress(0x1234));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            "[00:13:a2]!".parse::<ExtendedAddress>(),
            Err(AddressError::InvalidLength { .. })
        ));
        assert!(matches!(
            "[zz:13:a2:00:40:0a:01:27]!".parse::<ExtendedAddress>(),
            Err(AddressError::InvalidHex(_))
        ));
        assert!(matches!(
            "[00:13:a2:00:40:0a:01:27]?".parse::<ExtendedAddress>(),
            Err(AddressError::MissingTerminator(_))
        ));
        assert!("[12345]!".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_dispatch() {
        assert_eq!("".parse::<Address>().unwrap(), Address::Local);
        assert_eq!(
            "[0001]!".parse::<Address>().unwrap(),
            Address::Short(ShortAddress(1))
        );
        assert!(matches!(
            "[00:00:00:00:00:00:00:01]!".parse::<Address>().unwrap(),
            Address::Extended(ExtendedAddress(1))
        ));
        assert_eq!(Address::Local.to_string(), "");
    }
}
