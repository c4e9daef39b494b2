//! XBee Driver - Serial driver and socket emulation for XBee radios
//!
//! This crate runs an XBee radio attached to a serial port:
//! - Serial link management with retry, radio probing and reopen on settings change
//! - AT parameter access on the local radio and remote nodes
//! - Topology discovery through ND sweeps or ZDO neighbor table reads
//! - Datagram sockets bound to radio endpoints, with loopback and `select`

pub mod cluster;
pub mod config;
pub mod correlation;
pub mod directory;
pub mod driver;
pub mod error;
pub mod mailbox;
pub mod select;
pub mod socket;
pub mod state;
pub mod transport;

pub use config::{DriverConfig, SerialSettings, TimingConfig};
pub use driver::{Driver, ParamValue};
pub use error::{DriverError, Result};
pub use mailbox::{Datagram, MailboxId};
pub use select::{select, DescriptorKind, SelectResult, Selectable};
pub use socket::{resolve, AddressFamily, Protocol, SockOpt, XBeeSocket, MSG_DONTWAIT};
pub use transport::{BoxedStream, LinkState, PortOpener, SerialPortOpener};
