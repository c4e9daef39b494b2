//! Matching asynchronous radio replies to the requests that caused them
//!
//! Two mechanisms live here:
//! - a single pending AT reply slot keyed by frame id, fed by the receive path
//! - one-shot ZDO conversations keyed by (address, tsn) with a sweep timeout

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;
use xbee_core::{Address, ApiMessage};

/// Cyclic frame id source: 1, 2, ..., 255, 1, ...
///
/// Id 0 tells the radio that no response is wanted, so it is never handed out.
#[derive(Debug)]
pub struct FrameIdAllocator {
    next: u8,
}

impl FrameIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u8 {
        let id = self.next;
        self.next = if id == u8::MAX { 1 } else { id + 1 };
        id
    }
}

impl Default for FrameIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The one outstanding AT-style request awaiting replies
///
/// Local AT, remote AT and register-device status frames carrying the slot's
/// frame id are forwarded. The channel is unbounded because node discovery
/// collects every reply during its window.
#[derive(Debug, Default)]
pub struct PendingReply {
    slot: Option<(u8, mpsc::UnboundedSender<ApiMessage>)>,
}

impl PendingReply {
    /// Open the slot for `frame_id`, replacing any previous waiter
    pub fn open(&mut self, frame_id: u8) -> mpsc::UnboundedReceiver<ApiMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some((old, _)) = self.slot.replace((frame_id, tx)) {
            debug!(old_frame_id = old, frame_id, "Replacing pending reply slot");
        }
        rx
    }

    /// Close the slot if it still belongs to `frame_id`
    pub fn close(&mut self, frame_id: u8) {
        if matches!(self.slot, Some((id, _)) if id == frame_id) {
            self.slot = None;
        }
    }

    pub fn frame_id(&self) -> Option<u8> {
        self.slot.as_ref().map(|(id, _)| *id)
    }

    /// Forward a reply to the waiter; returns false when nobody is waiting for it
    pub fn offer(&mut self, message: ApiMessage) -> bool {
        let Some(frame_id) = message.frame_id() else {
            return false;
        };
        let delivered = match &self.slot {
            Some((id, tx)) if *id == frame_id => tx.send(message).is_ok(),
            _ => return false,
        };
        if !delivered {
            // Waiter gave up (timeout) without closing
            self.slot = None;
        }
        delivered
    }
}

/// Result delivered to a conversation's waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Matched(T),
    TimedOut,
}

#[derive(Debug)]
struct Conversation<T> {
    started_at: Instant,
    active: bool,
    address: Address,
    tsn: u8,
    timeout: Duration,
    reply: Option<oneshot::Sender<Outcome<T>>>,
}

impl<T> Conversation<T> {
    fn finish(&mut self, outcome: Outcome<T>) {
        self.active = false;
        if let Some(reply) = self.reply.take() {
            // Receiver may already be gone; nothing to do then
            let _ = reply.send(outcome);
        }
    }
}

/// Outstanding one-shot ZDO request/response exchanges
#[derive(Debug)]
pub struct ConversationTable<T> {
    conversations: Vec<Conversation<T>>,
}

impl<T> Default for ConversationTable<T> {
    fn default() -> Self {
        Self {
            conversations: Vec::new(),
        }
    }
}

impl<T> ConversationTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversation expecting a reply from `address` with `tsn`
    pub fn issue(&mut self, address: Address, tsn: u8, timeout: Duration) -> oneshot::Receiver<Outcome<T>> {
        let (tx, rx) = oneshot::channel();
        self.conversations.push(Conversation {
            started_at: Instant::now(),
            active: true,
            address,
            tsn,
            timeout,
            reply: Some(tx),
        });
        rx
    }

    /// Deliver `response` to the conversation it answers
    ///
    /// Hands the response back when no active conversation matches.
    pub fn on_frame_received(&mut self, address: Address, tsn: u8, response: T) -> Result<(), T> {
        self.conversations.retain(|c| c.active);
        match self
            .conversations
            .iter_mut()
            .find(|c| c.address == address && c.tsn == tsn)
        {
            Some(conversation) => {
                conversation.finish(Outcome::Matched(response));
                Ok(())
            }
            None => Err(response),
        }
    }

    /// Expire conversations older than their timeout
    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for conversation in self.conversations.iter_mut().filter(|c| c.active) {
            if now.saturating_duration_since(conversation.started_at) > conversation.timeout {
                debug!(
                    address = %conversation.address,
                    tsn = conversation.tsn,
                    "Conversation timed out"
                );
                conversation.finish(Outcome::TimedOut);
                expired += 1;
            }
        }
        self.conversations.retain(|c| c.active);
        expired
    }

    /// Conversations still waiting for a response
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.conversations.iter().filter(|c| c.active).count()
    }
}
