//! Typed API messages carried inside [`ApiFrame`]s
//!
//! Each variant is a bidirectional codec between the frame payload and a
//! struct. Unknown API ids decode to [`ApiMessage::Opaque`] so nothing read
//! from the radio is lost.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::address::{ExtendedAddress, ShortAddress};
use crate::frame::{ApiFrame, FrameError};

/// API identifiers of the supported message types
pub mod api_id {
    pub const TX_64: u8 = 0x00;
    pub const TX_16: u8 = 0x01;
    pub const LOCAL_AT_COMMAND: u8 = 0x08;
    pub const ZIGBEE_TRANSMIT: u8 = 0x11;
    pub const REMOTE_AT_COMMAND: u8 = 0x17;
    pub const REGISTER_DEVICE: u8 = 0x24;
    pub const RX_64: u8 = 0x80;
    pub const RX_16: u8 = 0x81;
    pub const IO_64: u8 = 0x82;
    pub const IO_16: u8 = 0x83;
    pub const LOCAL_AT_RESPONSE: u8 = 0x88;
    pub const TX_STATUS: u8 = 0x89;
    pub const ZIGBEE_TX_STATUS: u8 = 0x8B;
    pub const ZIGBEE_RECEIVE: u8 = 0x91;
    pub const REMOTE_AT_RESPONSE: u8 = 0x97;
    pub const REGISTER_DEVICE_STATUS: u8 = 0xA4;
}

/// Delivery status codes reported by the Tx-status frames
pub mod delivery {
    pub const SUCCESS: u8 = 0x00;
    pub const NO_ACK_RECEIVED: u8 = 0x01;
    pub const CCA_FAILURE: u8 = 0x02;
    pub const PURGED: u8 = 0x03;
    pub const NETWORK_ACK_FAILURE: u8 = 0x21;
    pub const NOT_JOINED_TO_NETWORK: u8 = 0x22;
    pub const SELF_ADDRESSED: u8 = 0x23;
    pub const ADDRESS_NOT_FOUND: u8 = 0x24;
    pub const NO_ROUTE_FOUND: u8 = 0x25;
    pub const INVALID_ENDPOINT: u8 = 0x2C;
    pub const DATA_PAYLOAD_TOO_BIG: u8 = 0x74;
    pub const KEY_NOT_AUTHORIZED: u8 = 0xBB;
}

/// Remote AT command option: apply changes immediately
pub const REMOTE_AT_APPLY_CHANGES: u8 = 0x02;

/// A two-character AT command name (e.g. `NI`, `CH`)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtCommand(pub [u8; 2]);

impl AtCommand {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl TryFrom<&str> for AtCommand {
    type Error = FrameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.as_bytes() {
            [a, b] if a.is_ascii() && b.is_ascii() => Ok(Self([*a, *b])),
            _ => Err(FrameError::Malformed {
                kind: "AT command",
                reason: format!("{value:?} is not two ASCII characters"),
            }),
        }
    }
}

impl fmt::Debug for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtCommand({:?})", self.as_str())
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAtCommand {
    pub frame_id: u8,
    pub command: AtCommand,
    pub parameter: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAtResponse {
    pub frame_id: u8,
    pub command: AtCommand,
    pub status: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAtCommand {
    pub frame_id: u8,
    pub destination: ExtendedAddress,
    pub destination_short: ShortAddress,
    pub options: u8,
    pub command: AtCommand,
    pub parameter: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAtResponse {
    pub frame_id: u8,
    pub source: ExtendedAddress,
    pub source_short: ShortAddress,
    pub command: AtCommand,
    pub status: u8,
    pub value: Vec<u8>,
}

/// ZigBee explicit addressing transmit request (0x11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZigbeeTransmit {
    pub frame_id: u8,
    pub destination: ExtendedAddress,
    pub destination_short: ShortAddress,
    pub source_endpoint: u8,
    pub destination_endpoint: u8,
    pub cluster_id: u16,
    pub profile_id: u16,
    pub radius: u8,
    pub options: u8,
    pub data: Vec<u8>,
}

/// ZigBee explicit receive indicator (0x91)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZigbeeReceive {
    pub source: ExtendedAddress,
    pub source_short: ShortAddress,
    pub source_endpoint: u8,
    pub destination_endpoint: u8,
    pub cluster_id: u16,
    pub profile_id: u16,
    pub options: u8,
    pub data: Vec<u8>,
}

/// 802.15.4 transmit request with 64-bit destination (0x00)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit64 {
    pub frame_id: u8,
    pub destination: ExtendedAddress,
    pub options: u8,
    pub data: Vec<u8>,
}

/// 802.15.4 transmit request with 16-bit destination (0x01)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit16 {
    pub frame_id: u8,
    pub destination: ShortAddress,
    pub options: u8,
    pub data: Vec<u8>,
}

/// 802.15.4 receive (0x80) or IO sample (0x82) from a 64-bit source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receive64 {
    pub source: ExtendedAddress,
    pub rssi: u8,
    pub options: u8,
    pub data: Vec<u8>,
}

/// 802.15.4 receive (0x81) or IO sample (0x83) from a 16-bit source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receive16 {
    pub source: ShortAddress,
    pub rssi: u8,
    pub options: u8,
    pub data: Vec<u8>,
}

/// Register a joining device with its link key (0x24); an empty key unregisters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDevice {
    pub frame_id: u8,
    pub device: ExtendedAddress,
    pub link_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDeviceStatus {
    pub frame_id: u8,
    pub status: u8,
}

/// ZigBee transmit status (0x8B)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZigbeeTxStatus {
    pub frame_id: u8,
    pub remote_short: ShortAddress,
    pub retry_count: u8,
    pub delivery_status: u8,
    pub discovery_status: u8,
}

/// 802.15.4 transmit status (0x89)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub frame_id: u8,
    pub status: u8,
}

/// Every API message the driver understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiMessage {
    LocalAtCommand(LocalAtCommand),
    LocalAtResponse(LocalAtResponse),
    RemoteAtCommand(RemoteAtCommand),
    RemoteAtResponse(RemoteAtResponse),
    ZigbeeTransmit(ZigbeeTransmit),
    ZigbeeReceive(ZigbeeReceive),
    Transmit64(Transmit64),
    Transmit16(Transmit16),
    Receive64(Receive64),
    Receive16(Receive16),
    IoSample64(Receive64),
    IoSample16(Receive16),
    RegisterDevice(RegisterDevice),
    RegisterDeviceStatus(RegisterDeviceStatus),
    ZigbeeTxStatus(ZigbeeTxStatus),
    TxStatus(TxStatus),
    /// Any API id without a typed codec
    Opaque { api_id: u8, payload: Vec<u8> },
}

impl ApiMessage {
    pub fn api_id(&self) -> u8 {
        match self {
            ApiMessage::LocalAtCommand(_) => api_id::LOCAL_AT_COMMAND,
            ApiMessage::LocalAtResponse(_) => api_id::LOCAL_AT_RESPONSE,
            ApiMessage::RemoteAtCommand(_) => api_id::REMOTE_AT_COMMAND,
            ApiMessage::RemoteAtResponse(_) => api_id::REMOTE_AT_RESPONSE,
            ApiMessage::ZigbeeTransmit(_) => api_id::ZIGBEE_TRANSMIT,
            ApiMessage::ZigbeeReceive(_) => api_id::ZIGBEE_RECEIVE,
            ApiMessage::Transmit64(_) => api_id::TX_64,
            ApiMessage::Transmit16(_) => api_id::TX_16,
            ApiMessage::Receive64(_) => api_id::RX_64,
            ApiMessage::Receive16(_) => api_id::RX_16,
            ApiMessage::IoSample64(_) => api_id::IO_64,
            ApiMessage::IoSample16(_) => api_id::IO_16,
            ApiMessage::RegisterDevice(_) => api_id::REGISTER_DEVICE,
            ApiMessage::RegisterDeviceStatus(_) => api_id::REGISTER_DEVICE_STATUS,
            ApiMessage::ZigbeeTxStatus(_) => api_id::ZIGBEE_TX_STATUS,
            ApiMessage::TxStatus(_) => api_id::TX_STATUS,
            ApiMessage::Opaque { api_id, .. } => *api_id,
        }
    }

    /// Frame id carried by the message, if its type has one
    pub fn frame_id(&self) -> Option<u8> {
        match self {
            ApiMessage::LocalAtCommand(m) => Some(m.frame_id),
            ApiMessage::LocalAtResponse(m) => Some(m.frame_id),
            ApiMessage::RemoteAtCommand(m) => Some(m.frame_id),
            ApiMessage::RemoteAtResponse(m) => Some(m.frame_id),
            ApiMessage::ZigbeeTransmit(m) => Some(m.frame_id),
            ApiMessage::Transmit64(m) => Some(m.frame_id),
            ApiMessage::Transmit16(m) => Some(m.frame_id),
            ApiMessage::RegisterDevice(m) => Some(m.frame_id),
            ApiMessage::RegisterDeviceStatus(m) => Some(m.frame_id),
            ApiMessage::ZigbeeTxStatus(m) => Some(m.frame_id),
            ApiMessage::TxStatus(m) => Some(m.frame_id),
            ApiMessage::ZigbeeReceive(_)
            | ApiMessage::Receive64(_)
            | ApiMessage::Receive16(_)
            | ApiMessage::IoSample64(_)
            | ApiMessage::IoSample16(_)
            | ApiMessage::Opaque { .. } => None,
        }
    }

    /// Serialize the variant-specific payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ApiMessage::LocalAtCommand(m) => {
                out.put_u8(m.frame_id);
                out.put_slice(&m.command.0);
                out.put_slice(&m.parameter);
            }
            ApiMessage::LocalAtResponse(m) => {
                out.put_u8(m.frame_id);
                out.put_slice(&m.command.0);
                out.put_u8(m.status);
                out.put_slice(&m.value);
            }
            ApiMessage::RemoteAtCommand(m) => {
                out.put_u8(m.frame_id);
                out.put_u64(m.destination.0);
                out.put_u16(m.destination_short.0);
                out.put_u8(m.options);
                out.put_slice(&m.command.0);
                out.put_slice(&m.parameter);
            }
            ApiMessage::RemoteAtResponse(m) => {
                out.put_u8(m.frame_id);
                out.put_u64(m.source.0);
                out.put_u16(m.source_short.0);
                out.put_slice(&m.command.0);
                out.put_u8(m.status);
                out.put_slice(&m.value);
            }
            ApiMessage::ZigbeeTransmit(m) => {
                out.put_u8(m.frame_id);
                out.put_u64(m.destination.0);
                out.put_u16(m.destination_short.0);
                out.put_u8(m.source_endpoint);
                out.put_u8(m.destination_endpoint);
                out.put_u16(m.cluster_id);
                out.put_u16(m.profile_id);
                out.put_u8(m.radius);
                out.put_u8(m.options);
                out.put_slice(&m.data);
            }
            ApiMessage::ZigbeeReceive(m) => {
                out.put_u64(m.source.0);
                out.put_u16(m.source_short.0);
                out.put_u8(m.source_endpoint);
                out.put_u8(m.destination_endpoint);
                out.put_u16(m.cluster_id);
                out.put_u16(m.profile_id);
                out.put_u8(m.options);
                out.put_slice(&m.data);
            }
            ApiMessage::Transmit64(m) => {
                out.put_u8(m.frame_id);
                out.put_u64(m.destination.0);
                out.put_u8(m.options);
                out.put_slice(&m.data);
            }
            ApiMessage::Transmit16(m) => {
                out.put_u8(m.frame_id);
                out.put_u16(m.destination.0);
                out.put_u8(m.options);
                out.put_slice(&m.data);
            }
            ApiMessage::Receive64(m) | ApiMessage::IoSample64(m) => {
                out.put_u64(m.source.0);
                out.put_u8(m.rssi);
                out.put_u8(m.options);
                out.put_slice(&m.data);
            }
            ApiMessage::Receive16(m) | ApiMessage::IoSample16(m) => {
                out.put_u16(m.source.0);
                out.put_u8(m.rssi);
                out.put_u8(m.options);
                out.put_slice(&m.data);
            }
            ApiMessage::RegisterDevice(m) => {
                out.put_u8(m.frame_id);
                out.put_u64(m.device.0);
                // 16-bit address is always 0xFFFE and key options always 0
                out.put_u16(ShortAddress::UNKNOWN.0);
                out.put_u8(0);
                out.put_slice(&m.link_key);
            }
            ApiMessage::RegisterDeviceStatus(m) => {
                out.put_u8(m.frame_id);
                out.put_u8(m.status);
            }
            ApiMessage::ZigbeeTxStatus(m) => {
                out.put_u8(m.frame_id);
                out.put_u16(m.remote_short.0);
                out.put_u8(m.retry_count);
                out.put_u8(m.delivery_status);
                out.put_u8(m.discovery_status);
            }
            ApiMessage::TxStatus(m) => {
                out.put_u8(m.frame_id);
                out.put_u8(m.status);
            }
            ApiMessage::Opaque { payload, .. } => out.put_slice(payload),
        }
        out
    }

    pub fn to_frame(&self) -> ApiFrame {
        ApiFrame::new(self.api_id(), self.encode_payload())
    }

    /// Encode the message as a complete wire frame
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        self.to_frame().encode()
    }

    /// Decode the payload of a validated frame
    pub fn decode(frame: &ApiFrame) -> Result<Self, FrameError> {
        let mut p = frame.payload.as_slice();
        let msg = match frame.api_id {
            api_id::LOCAL_AT_COMMAND => {
                need("local AT command", p, 3)?;
                ApiMessage::LocalAtCommand(LocalAtCommand {
                    frame_id: p.get_u8(),
                    command: take_command(&mut p),
                    parameter: p.to_vec(),
                })
            }
            api_id::LOCAL_AT_RESPONSE => {
                need("local AT response", p, 4)?;
                ApiMessage::LocalAtResponse(LocalAtResponse {
                    frame_id: p.get_u8(),
                    command: take_command(&mut p),
                    status: p.get_u8(),
                    value: p.to_vec(),
                })
            }
            api_id::REMOTE_AT_COMMAND => {
                need("remote AT command", p, 14)?;
                ApiMessage::RemoteAtCommand(RemoteAtCommand {
                    frame_id: p.get_u8(),
                    destination: ExtendedAddress(p.get_u64()),
                    destination_short: ShortAddress(p.get_u16()),
                    options: p.get_u8(),
                    command: take_command(&mut p),
                    parameter: p.to_vec(),
                })
            }
            api_id::REMOTE_AT_RESPONSE => {
                need("remote AT response", p, 14)?;
                ApiMessage::RemoteAtResponse(RemoteAtResponse {
                    frame_id: p.get_u8(),
                    source: ExtendedAddress(p.get_u64()),
                    source_short: ShortAddress(p.get_u16()),
                    command: take_command(&mut p),
                    status: p.get_u8(),
                    value: p.to_vec(),
                })
            }
            api_id::ZIGBEE_TRANSMIT => {
                need("ZigBee transmit", p, 19)?;
                ApiMessage::ZigbeeTransmit(ZigbeeTransmit {
                    frame_id: p.get_u8(),
                    destination: ExtendedAddress(p.get_u64()),
                    destination_short: ShortAddress(p.get_u16()),
                    source_endpoint: p.get_u8(),
                    destination_endpoint: p.get_u8(),
                    cluster_id: p.get_u16(),
                    profile_id: p.get_u16(),
                    radius: p.get_u8(),
                    options: p.get_u8(),
                    data: p.to_vec(),
                })
            }
            api_id::ZIGBEE_RECEIVE => {
                need("ZigBee receive", p, 17)?;
                ApiMessage::ZigbeeReceive(ZigbeeReceive {
                    source: ExtendedAddress(p.get_u64()),
                    source_short: ShortAddress(p.get_u16()),
                    source_endpoint: p.get_u8(),
                    destination_endpoint: p.get_u8(),
                    cluster_id: p.get_u16(),
                    profile_id: p.get_u16(),
                    options: p.get_u8(),
                    data: p.to_vec(),
                })
            }
            api_id::TX_64 => {
                need("802.15.4 transmit (64)", p, 10)?;
                ApiMessage::Transmit64(Transmit64 {
                    frame_id: p.get_u8(),
                    destination: ExtendedAddress(p.get_u64()),
                    options: p.get_u8(),
                    data: p.to_vec(),
                })
            }
            api_id::TX_16 => {
                need("802.15.4 transmit (16)", p, 4)?;
                ApiMessage::Transmit16(Transmit16 {
                    frame_id: p.get_u8(),
                    destination: ShortAddress(p.get_u16()),
                    options: p.get_u8(),
                    data: p.to_vec(),
                })
            }
            api_id::RX_64 | api_id::IO_64 => {
                need("802.15.4 receive (64)", p, 10)?;
                let rx = Receive64 {
                    source: ExtendedAddress(p.get_u64()),
                    rssi: p.get_u8(),
                    options: p.get_u8(),
                    data: p.to_vec(),
                };
                if frame.api_id == api_id::RX_64 {
                    ApiMessage::Receive64(rx)
                } else {
                    ApiMessage::IoSample64(rx)
                }
            }
            api_id::RX_16 | api_id::IO_16 => {
                need("802.15.4 receive (16)", p, 4)?;
                let rx = Receive16 {
                    source: ShortAddress(p.get_u16()),
                    rssi: p.get_u8(),
                    options: p.get_u8(),
                    data: p.to_vec(),
                };
                if frame.api_id == api_id::RX_16 {
                    ApiMessage::Receive16(rx)
                } else {
                    ApiMessage::IoSample16(rx)
                }
            }
            api_id::REGISTER_DEVICE => {
                need("register device", p, 12)?;
                let frame_id = p.get_u8();
                let device = ExtendedAddress(p.get_u64());
                p.advance(3); // 0xFFFE + key options
                ApiMessage::RegisterDevice(RegisterDevice {
                    frame_id,
                    device,
                    link_key: p.to_vec(),
                })
            }
            api_id::REGISTER_DEVICE_STATUS => {
                need("register device status", p, 2)?;
                ApiMessage::RegisterDeviceStatus(RegisterDeviceStatus {
                    frame_id: p.get_u8(),
                    status: p.get_u8(),
                })
            }
            api_id::ZIGBEE_TX_STATUS => {
                need("ZigBee Tx status", p, 6)?;
                ApiMessage::ZigbeeTxStatus(ZigbeeTxStatus {
                    frame_id: p.get_u8(),
                    remote_short: ShortAddress(p.get_u16()),
                    retry_count: p.get_u8(),
                    delivery_status: p.get_u8(),
                    discovery_status: p.get_u8(),
                })
            }
            api_id::TX_STATUS => {
                need("802.15.4 Tx status", p, 2)?;
                ApiMessage::TxStatus(TxStatus {
                    frame_id: p.get_u8(),
                    status: p.get_u8(),
                })
            }
            other => ApiMessage::Opaque {
                api_id: other,
                payload: frame.payload.clone(),
            },
        };
        Ok(msg)
    }
}

fn need(kind: &'static str, payload: &[u8], needed: usize) -> Result<(), FrameError> {
    if payload.len() < needed {
        return Err(FrameError::Truncated {
            kind,
            needed,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn take_command(p: &mut &[u8]) -> AtCommand {
    let cmd = AtCommand([p[0], p[1]]);
    p.advance(2);
    cmd
}
