//! Datagram sockets addressed by radio endpoint
//!
//! An [`XBeeSocket`] is bound to one endpoint of the local radio (or, for
//! [`Protocol::Xapi`], to one API id) and exchanges payloads with
//! [`SocketAddress`]es. Sending to [`Address::Local`] loops back without
//! touching the serial link.

use tracing::debug;
use xbee_core::{Address, SocketAddress};

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::mailbox::MailboxId;

/// `recvfrom` flag: return immediately when nothing is queued
pub const MSG_DONTWAIT: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    XBee,
    Inet,
    Inet6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Application data on a ZigBee endpoint
    Aps,
    /// Same delivery as `Aps`
    Transport,
    /// Byte-exact copies of API frames; binds by API id, never sends
    Xapi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    NonBlocking,
    /// Ask for a transmit-status record (tag 0) on every send
    TxStatus,
}

#[derive(Debug)]
pub struct XBeeSocket {
    driver: Driver,
    protocol: Protocol,
    mailbox: Option<MailboxId>,
    closed: bool,
    nonblocking: bool,
    tx_status: bool,
}

impl XBeeSocket {
    pub fn new(driver: &Driver, family: AddressFamily, protocol: Protocol) -> Result<Self> {
        if family != AddressFamily::XBee {
            return Err(DriverError::UnsupportedFamily(format!("{family:?}")));
        }
        Ok(Self {
            driver: driver.clone(),
            protocol,
            mailbox: None,
            closed: true,
            nonblocking: false,
            tx_status: false,
        })
    }

    /// Bind to the endpoint of `address`; only the endpoint is used
    pub fn bind(&mut self, address: &SocketAddress) -> Result<()> {
        if self.mailbox.is_some() {
            return Err(DriverError::AlreadyBound);
        }
        let id = match self.protocol {
            Protocol::Xapi => MailboxId::Tap(address.endpoint),
            Protocol::Aps | Protocol::Transport => MailboxId::Endpoint(address.endpoint),
        };
        if !self.driver.shared().register_mailbox(id) {
            return Err(DriverError::AddressInUse(address.endpoint));
        }
        debug!(mailbox = ?id, "Socket bound");
        self.mailbox = Some(id);
        self.closed = false;
        Ok(())
    }

    /// Bound mailbox, failing for unbound or closed sockets
    fn open_mailbox(&self) -> Result<MailboxId> {
        let id = self.mailbox.ok_or(DriverError::NotBound)?;
        if self.closed {
            return Err(DriverError::SocketClosed);
        }
        Ok(id)
    }

    /// Send `data` to `destination`; returns the number of bytes accepted
    pub async fn sendto(&self, data: &[u8], destination: &SocketAddress) -> Result<usize> {
        let endpoint = match self.open_mailbox()? {
            MailboxId::Endpoint(endpoint) => endpoint,
            MailboxId::Tap(_) => return Ok(0),
        };

        let mut destination = destination.clone();
        if destination.tag.is_none() && self.tx_status {
            destination.tag = Some(0);
        }

        let shared = self.driver.shared();
        if destination.address == Address::Local {
            shared.loopback(endpoint, &destination, data);
        } else {
            shared
                .transmit(endpoint, &destination, data, destination.tag)
                .await?;
        }
        Ok(data.len())
    }

    /// Next datagram, truncated to `max_len`
    ///
    /// Waits for traffic unless `MSG_DONTWAIT` is passed or the socket is
    /// non-blocking, in which case `None` means nothing was queued.
    pub async fn recvfrom(&self, max_len: usize, flags: u32) -> Result<Option<(Vec<u8>, SocketAddress)>> {
        let id = self.open_mailbox()?;
        let nonblocking = flags & MSG_DONTWAIT != 0 || self.nonblocking;
        let shared = self.driver.shared();

        loop {
            let notified = shared.inbound().notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue in between is not missed
            notified.as_mut().enable();

            if let Some(mut datagram) = shared.pop_datagram(id) {
                datagram.payload.truncate(max_len);
                return Ok(Some((datagram.payload, datagram.source)));
            }
            if nonblocking {
                return Ok(None);
            }
            notified.await;
        }
    }

    /// Datagrams ready to read
    pub fn pending(&self) -> Result<usize> {
        let id = self.open_mailbox()?;
        Ok(self.driver.shared().readable(id))
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(id) = self.mailbox {
            self.driver.shared().unregister_mailbox(id);
            debug!(mailbox = ?id, "Socket closed");
        }
        self.closed = true;
    }

    pub fn set_option(&mut self, option: SockOpt, value: bool) {
        match option {
            SockOpt::NonBlocking => self.nonblocking = value,
            SockOpt::TxStatus => self.tx_status = value,
        }
    }

    pub fn option(&self, option: SockOpt) -> bool {
        match option {
            SockOpt::NonBlocking => self.nonblocking,
            SockOpt::TxStatus => self.tx_status,
        }
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.set_option(SockOpt::NonBlocking, nonblocking);
    }
}

impl Drop for XBeeSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Socket address for an extended or short address string
///
/// Returns `None` for anything else, including the empty local address, so
/// callers can fall back to regular host name resolution.
pub fn resolve(host: &str, endpoint: u8) -> Option<SocketAddress> {
    match host.parse::<Address>() {
        Ok(Address::Local) | Err(_) => None,
        Ok(address) => Some(SocketAddress::new(address, endpoint, 0, 0)),
    }
}
