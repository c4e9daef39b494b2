//! Node records produced by discovery

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::{ExtendedAddress, ShortAddress};
use crate::frame::FrameError;

/// Digi's profile id, reported for the local node and legacy discovery results
pub const DIGI_PROFILE_ID: u16 = 0xC105;
/// Digi's manufacturer id
pub const DIGI_MANUFACTURER_ID: u16 = 0x101E;

/// Role of a node in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Coordinator,
    Router,
    End,
    Unknown,
}

impl NodeKind {
    /// Map a ZigBee device type number (neighbor table, ND reply)
    pub fn from_device_type(value: u8) -> Self {
        match value {
            0 => NodeKind::Coordinator,
            1 => NodeKind::Router,
            2 => NodeKind::End,
            _ => NodeKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Coordinator => "coordinator",
            NodeKind::Router => "router",
            NodeKind::End => "end",
            NodeKind::Unknown => "unknown",
        }
    }
}

impl Default for NodeKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of a node's identity is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Only the extended address is known
    Unknown,
    /// A short address has been seen, kind still undetermined
    Discovered,
    /// Extended and short address plus a definite kind
    Resolved,
}

/// A radio on the network, including the local one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub addr_extended: ExtendedAddress,
    pub addr_short: ShortAddress,
    pub addr_parent: ShortAddress,
    pub profile_id: u16,
    pub manufacturer_id: u16,
    pub label: String,
}

impl Node {
    /// A node only known by address, as learned from an announce or neighbor table
    pub fn remote(addr_extended: ExtendedAddress, addr_short: ShortAddress, kind: NodeKind) -> Self {
        Self {
            kind,
            addr_extended,
            addr_short,
            addr_parent: ShortAddress::UNKNOWN,
            profile_id: 0,
            manufacturer_id: 0,
            label: String::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        if self.addr_short.is_unknown() {
            Resolution::Unknown
        } else if self.kind == NodeKind::Unknown {
            Resolution::Discovered
        } else {
            Resolution::Resolved
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<node type={} addr_extended={}>",
            self.kind, self.addr_extended
        )
    }
}

/// Radio family, decided from the `HV` / `VR` registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioGeneration {
    /// Series 1 hardware running 802.15.4 firmware; uses ND and Tx16/Tx64
    Legacy802154,
    /// Anything else; uses ZDO discovery and explicit ZigBee frames
    Mesh,
}

/// Hardware (`HV`) and firmware (`VR`) version registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioVersion {
    pub hardware: u16,
    pub firmware: u16,
}

impl RadioVersion {
    pub fn new(hardware: u16, firmware: u16) -> Self {
        Self { hardware, firmware }
    }

    pub fn is_series_1(&self) -> bool {
        self.hardware & 0xFF00 == 0x1700
    }

    pub fn is_802_15_4(&self) -> bool {
        self.is_series_1() && self.firmware & 0xF000 == 0x1000
    }

    pub fn generation(&self) -> RadioGeneration {
        if self.is_802_15_4() {
            RadioGeneration::Legacy802154
        } else {
            RadioGeneration::Mesh
        }
    }

    /// Smart-energy firmware has no `NI` label
    pub fn has_label(&self) -> bool {
        self.firmware & 0xF000 != 0x3000
    }

    /// Role of the local radio as encoded in its firmware version
    pub fn local_kind(&self) -> NodeKind {
        if self.is_802_15_4() {
            return NodeKind::Router;
        }
        match self.firmware & 0x0F00 {
            0x0100 => NodeKind::Coordinator,
            // 0x0400 is a range extender, which routes
            0x0300 | 0x0400 => NodeKind::Router,
            _ => NodeKind::End,
        }
    }
}

/// Parse a big-endian register value of 1 or 2 bytes
pub fn register_u16(value: &[u8]) -> Option<u16> {
    match value {
        [b] => Some(*b as u16),
        [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Decode one `ND` reply value into a node
pub fn parse_node_discovery(value: &[u8], generation: RadioGeneration) -> Result<Node, FrameError> {
    let header = match generation {
        RadioGeneration::Legacy802154 => 11,
        RadioGeneration::Mesh => 10,
    };
    if value.len() < header {
        return Err(FrameError::Truncated {
            kind: "node discovery reply",
            needed: header,
            actual: value.len(),
        });
    }
    let addr_short = ShortAddress(u16::from_be_bytes([value[0], value[1]]));
    let mut ext = [0u8; 8];
    ext.copy_from_slice(&value[2..10]);
    let addr_extended = ExtendedAddress::from_be_bytes(ext);

    let rest = &value[header..];
    let label_len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let label = String::from_utf8_lossy(&rest[..label_len]).into_owned();

    match generation {
        RadioGeneration::Legacy802154 => Ok(Node {
            kind: NodeKind::Router,
            addr_extended,
            addr_short,
            addr_parent: ShortAddress::UNKNOWN,
            profile_id: DIGI_PROFILE_ID,
            manufacturer_id: DIGI_MANUFACTURER_ID,
            label,
        }),
        RadioGeneration::Mesh => {
            let tail = rest.get(label_len + 1..label_len + 9).ok_or_else(|| {
                FrameError::Truncated {
                    kind: "node discovery reply",
                    needed: header + label_len + 9,
                    actual: value.len(),
                }
            })?;
            Ok(Node {
                kind: NodeKind::from_device_type(tail[2]),
                addr_extended,
                addr_short,
                addr_parent: ShortAddress(u16::from_be_bytes([tail[0], tail[1]])),
                // tail[3] is the status byte, unused
                profile_id: u16::from_be_bytes([tail[4], tail[5]]),
                manufacturer_id: u16::from_be_bytes([tail[6], tail[7]]),
                label,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_classification() {
        let s1 = RadioVersion::new(0x1744, 0x10E8);
        assert!(s1.is_series_1());
        assert!(s1.is_802_15_4());
        assert_eq!(s1.generation(), RadioGeneration::Legacy802154);
        assert_eq!(s1.local_kind(), NodeKind::Router);

        let s1_digimesh = RadioVersion::new(0x1744, 0x8062);
        assert!(s1_digimesh.is_series_1());
        assert_eq!(s1_digimesh.generation(), RadioGeneration::Mesh);

        assert_eq!(RadioVersion::new(0x1E44, 0x2170).local_kind(), NodeKind::Coordinator);
        assert_eq!(RadioVersion::new(0x1E44, 0x2370).local_kind(), NodeKind::Router);
        assert_eq!(RadioVersion::new(0x1E44, 0x2470).local_kind(), NodeKind::Router);
        assert_eq!(RadioVersion::new(0x1E44, 0x2970).local_kind(), NodeKind::End);
        assert!(!RadioVersion::new(0x1E44, 0x3170).has_label());
    }

    #[test]
    fn test_parse_nd_legacy() {
        let mut value = vec![0x12, 0x34];
        value.extend_from_slice(&0x0013_A200_4000_0001u64.to_be_bytes());
        value.push(0x28); // rssi
        value.extend_from_slice(b"pump\0junk");
        let node = parse_node_discovery(&value, RadioGeneration::Legacy802154).unwrap();
        assert_eq!(node.addr_short, ShortAddress(0x1234));
        assert_eq!(node.addr_extended, ExtendedAddress(0x0013_A200_4000_0001));
        assert_eq!(node.label, "pump");
        assert_eq!(node.kind, NodeKind::Router);
        assert_eq!(node.addr_parent, ShortAddress::UNKNOWN);
        assert_eq!(node.profile_id, DIGI_PROFILE_ID);
    }

    #[test]
    fn test_parse_nd_mesh() {
        let mut value = vec![0x56, 0x78];
        value.extend_from_slice(&0x0013_A200_4000_0002u64.to_be_bytes());
        value.extend_from_slice(b"tank\0");
        value.extend_from_slice(&[0xFF, 0xFE, 0x02, 0x00, 0xC1, 0x05, 0x10, 0x1E]);
        let node = parse_node_discovery(&value, RadioGeneration::Mesh).unwrap();
        assert_eq!(node.kind, NodeKind::End);
        assert_eq!(node.label, "tank");
        assert_eq!(node.addr_parent, ShortAddress::UNKNOWN);
        assert_eq!(node.manufacturer_id, DIGI_MANUFACTURER_ID);
        assert_eq!(node.resolution(), Resolution::Resolved);

        value.truncate(value.len() - 1);
        assert!(parse_node_discovery(&value, RadioGeneration::Mesh).is_err());
    }

    #[test]
    fn test_register_width() {
        assert_eq!(register_u16(&[0x3C]), Some(0x3C));
        assert_eq!(register_u16(&[0x01, 0x00]), Some(0x100));
        assert_eq!(register_u16(&[]), None);
        assert_eq!(register_u16(&[1, 2, 3]), None);
    }

    #[test]
    fn test_resolution_progression() {
        let mut node = Node::remote(ExtendedAddress(1), ShortAddress::UNKNOWN, NodeKind::Unknown);
        assert_eq!(node.resolution(), Resolution::Unknown);
        node.addr_short = ShortAddress(0x0001);
        assert_eq!(node.resolution(), Resolution::Discovered);
        node.kind = NodeKind::Router;
        assert_eq!(node.resolution(), Resolution::Resolved);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&NodeKind::Coordinator).unwrap();
        assert_eq!(json, "\"coordinator\"");
    }
}
