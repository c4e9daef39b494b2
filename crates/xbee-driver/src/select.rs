//! Readiness polling over XBee sockets and regular sockets

#[cfg(unix)]
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
#[cfg(unix)]
use std::net::{TcpStream, UdpSocket};
#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::socket::XBeeSocket;

/// Longest pause between two readiness passes
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Backed by a driver mailbox
    Virtual,
    /// Backed by an operating system socket
    Real,
}

/// Something [`select`] can poll
pub trait Selectable: Send + Sync {
    fn kind(&self) -> DescriptorKind;

    /// Whether a read would return without waiting
    fn is_readable(&self) -> bool;

    fn is_writable(&self) -> bool {
        true
    }
}

impl Selectable for XBeeSocket {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Virtual
    }

    fn is_readable(&self) -> bool {
        self.pending().map(|n| n > 0).unwrap_or(false)
    }
}

/// Zero-timeout `poll` for input; error and hangup count as readable since a read reports them
#[cfg(unix)]
fn poll_readable(fd: BorrowedFd<'_>) -> bool {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(n) if n > 0 => fds[0].revents().is_some_and(|r| !r.is_empty()),
        _ => false,
    }
}

#[cfg(unix)]
impl Selectable for UdpSocket {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Real
    }

    fn is_readable(&self) -> bool {
        poll_readable(self.as_fd())
    }
}

#[cfg(unix)]
impl Selectable for TcpStream {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Real
    }

    fn is_readable(&self) -> bool {
        poll_readable(self.as_fd())
    }
}

/// Indices into the `read` and `write` lists that are ready
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectResult {
    pub readable: Vec<usize>,
    pub writable: Vec<usize>,
}

impl SelectResult {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

fn poll_once(read: &[&dyn Selectable], write: &[&dyn Selectable]) -> SelectResult {
    SelectResult {
        readable: read
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_readable())
            .map(|(i, _)| i)
            .collect(),
        writable: write
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_writable())
            .map(|(i, _)| i)
            .collect(),
    }
}

/// Wait until a descriptor is ready or `timeout` elapses (`None` waits forever)
///
/// The first pass is immediate, so a zero timeout is a plain poll.
pub async fn select(
    read: &[&dyn Selectable],
    write: &[&dyn Selectable],
    timeout: Option<Duration>,
) -> SelectResult {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let result = poll_once(read, write);
        if !result.is_empty() {
            return result;
        }
        let pause = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return result;
                }
                remaining.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        sleep(pause).await;
    }
}
