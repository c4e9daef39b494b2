//! Driver error type

use thiserror::Error;
use xbee_core::{AddressError, FrameError};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("serial port not open")]
    PortNotOpen,

    #[error("{operation}: timeout ({id}@{address})")]
    Timeout {
        operation: &'static str,
        id: String,
        address: String,
    },

    #[error("{operation}: radio reported status {status:#04x} ({id}@{address})")]
    OperationFailed {
        operation: &'static str,
        id: String,
        address: String,
        status: u8,
    },

    #[error("parameter id must be exactly two ASCII characters, got {0:?}")]
    InvalidParameterId(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("link key is {0} bytes, at most 16 allowed")]
    InvalidKey(usize),

    #[error("socket already bound")]
    AlreadyBound,

    #[error("endpoint {0:#04x} already has a socket bound")]
    AddressInUse(u8),

    #[error("socket not bound yet")]
    NotBound,

    #[error("socket is closed")]
    SocketClosed,

    #[error("unsupported address family {0:?}")]
    UnsupportedFamily(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
