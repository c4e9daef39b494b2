//! XBee Core - Wire codecs and data model for XBee radios
//!
//! This crate provides the pure, I/O-free layer of the driver:
//! - API frame framing with checksum and stream resynchronization
//! - Typed API messages for every supported frame type
//! - Address string forms and socket-level addresses
//! - ZigBee Device Object records used for topology discovery
//! - Node records and radio version classification

pub mod address;
pub mod frame;
pub mod message;
pub mod node;
pub mod zdo;

pub use address::{Address, AddressError, ExtendedAddress, ShortAddress, SocketAddress};
pub use frame::{ApiFrame, Decoded, FrameDecoder, FrameError, RawFrame};
pub use message::{ApiMessage, AtCommand};
pub use node::{Node, NodeKind, RadioGeneration, RadioVersion, Resolution};
pub use zdo::{DeviceAnnounce, MgmtLqiResponse, NeighborTableRecord, ZdoFrame};
