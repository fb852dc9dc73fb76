//! Channels: named multicast groups with a registry of actions awaiting replies.
//!
//! Outbound datagrams are handed to the transport through an unbounded queue,
//! so `send` never blocks the caller and never reports delivery. Subscribers are
//! indexed by file ID; a reply is offered to every subscriber of its file and
//! each one decides whether it matches.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::protocol::{FileId, Message};
use crate::wire;

/// Protocol purpose of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// MC: STORED, GETCHUNK, DELETE, REMOVED, CHECKDELETE.
    Control,
    /// MDB: PUTCHUNK.
    Backup,
    /// MDR: CHUNK.
    Restore,
}

impl ChannelKind {
    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Control => "MC",
            ChannelKind::Backup => "MDB",
            ChannelKind::Restore => "MDR",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An action that wants to observe replies on a channel.
pub trait Subscriber: Send + Sync {
    /// Offered every reply for the subscribed file. Must not block.
    fn parse_response(&self, msg: &Message);
}

/// Forwards replies into an action's own inbox, so the action alone mutates its state.
pub struct Inbox(pub mpsc::UnboundedSender<Message>);

impl Subscriber for Inbox {
    fn parse_response(&self, msg: &Message) {
        let _ = self.0.send(msg.clone());
    }
}

/// Token returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    file_id: FileId,
    id: u64,
}

type Subscribers = HashMap<FileId, Vec<(u64, Arc<dyn Subscriber>)>>;

pub struct Channel {
    kind: ChannelKind,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl Channel {
    /// New channel and the receiving end of its outbound queue (drained by the transport).
    pub fn new(kind: ChannelKind) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            kind,
            outbound: tx,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        (channel, rx)
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Best-effort broadcast of raw bytes.
    pub fn send(&self, bytes: Vec<u8>) {
        if self.outbound.send(bytes).is_err() {
            debug!(channel = %self.kind, "transport gone, datagram dropped");
        }
    }

    /// Encode and broadcast. A build failure aborts only this send and is logged.
    pub fn send_message(&self, msg: &Message) -> bool {
        match wire::encode(msg) {
            Ok(bytes) => {
                debug!(channel = %self.kind, msg = %msg, "send");
                self.send(bytes);
                true
            }
            Err(e) => {
                error!(channel = %self.kind, msg = %msg, error = %e, "failed to build message");
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, file_id: FileId, subscriber: Arc<dyn Subscriber>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entry(file_id).or_default().push((id, subscriber));
        Subscription { file_id, id }
    }

    /// Remove a subscription. Returns false if it was already removed.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        let mut subs = self.lock();
        let Some(list) = subs.get_mut(&sub.file_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != sub.id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(&sub.file_id);
        }
        removed
    }

    /// Offer a reply to every subscriber of its file. Returns how many were notified.
    ///
    /// Subscribers are called outside the registry lock, so they may unsubscribe
    /// themselves from `parse_response`.
    pub fn notify(&self, msg: &Message) -> usize {
        let targets: Vec<Arc<dyn Subscriber>> = match self.lock().get(&msg.file_id()) {
            Some(list) => list.iter().map(|(_, s)| s.clone()).collect(),
            None => return 0,
        };
        for s in &targets {
            s.parse_response(msg);
        }
        targets.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// The three process-wide channels.
#[derive(Debug)]
pub struct Channels {
    pub control: Channel,
    pub backup: Channel,
    pub restore: Channel,
}

/// Receiving ends of the three outbound queues.
#[derive(Debug)]
pub struct Outbound {
    pub control: mpsc::UnboundedReceiver<Vec<u8>>,
    pub backup: mpsc::UnboundedReceiver<Vec<u8>>,
    pub restore: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Channels {
    pub fn new() -> (Self, Outbound) {
        let (control, control_rx) = Channel::new(ChannelKind::Control);
        let (backup, backup_rx) = Channel::new(ChannelKind::Backup);
        let (restore, restore_rx) = Channel::new(ChannelKind::Restore);
        (
            Self {
                control,
                backup,
                restore,
            },
            Outbound {
                control: control_rx,
                backup: backup_rx,
                restore: restore_rx,
            },
        )
    }

    pub fn get(&self, kind: ChannelKind) -> &Channel {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Backup => &self.backup,
            ChannelKind::Restore => &self.restore,
        }
    }
}
