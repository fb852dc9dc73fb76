//! Inbound routing: parse datagrams, drop our own, start rounds or forward replies.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::action::{
    PurgeAction, ReplicateChunkAction, RetrieveChunkAction, StoreAction, TriggerDeleteAction,
};
use crate::channel::ChannelKind;
use crate::core::PeerCore;
use crate::protocol::{Message, MessageKind};
use crate::wire::{self, ParseError};

/// What the dispatcher did with a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Unparseable, or sent by this peer.
    Discarded,
    /// Started a new action on the executor.
    Spawned(MessageKind),
    /// Offered to the subscribers of a channel.
    Forwarded {
        channel: ChannelKind,
        subscribers: usize,
    },
    /// Valid but needs nothing from this peer.
    Ignored,
}

#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<PeerCore>,
}

impl Dispatcher {
    pub fn new(core: Arc<PeerCore>) -> Self {
        Self { core }
    }

    /// Parse and dispatch one received datagram. Never fails; bad input is logged and dropped.
    pub fn handle_datagram(&self, bytes: &[u8]) -> Routed {
        match wire::parse(bytes) {
            Ok(msg) => self.dispatch(msg),
            Err(ParseError::UnrecognizedType(t)) => {
                warn!(token = %t, "unrecognizable message type, discarding");
                Routed::Discarded
            }
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "malformed message, discarding");
                Routed::Discarded
            }
        }
    }

    pub fn dispatch(&self, msg: Message) -> Routed {
        let core = &self.core;
        if msg.sender_id() == core.peer_id() {
            trace!(msg = %msg, "own message ignored");
            return Routed::Discarded;
        }
        debug!(msg = %msg, "received");

        let kind = msg.kind();
        match msg {
            Message::PutChunk {
                header,
                chunk_no,
                replication_degree,
                ref body,
            } => {
                core.channels.backup.notify(&msg);
                let body = body.clone();
                core.executor.execute(StoreAction::new(
                    core.clone(),
                    header,
                    chunk_no,
                    replication_degree,
                    body,
                ));
                Routed::Spawned(kind)
            }
            Message::GetChunk { header, chunk_no } => {
                let action = RetrieveChunkAction::new(core.clone(), &header, chunk_no);
                if !action.is_stored() {
                    return Routed::Ignored;
                }
                core.executor.execute(action);
                Routed::Spawned(kind)
            }
            Message::Stored { header, chunk_no } => {
                core.stored_chunks
                    .add_holder(&header.file_id, chunk_no, header.sender_id);
                self.forward(ChannelKind::Control, &msg)
            }
            Message::Removed { header, chunk_no } => {
                let holders = &core.stored_chunks;
                let dropped = holders.remove_holder(&header.file_id, chunk_no, header.sender_id);
                let routed = self.forward(ChannelKind::Control, &msg);
                if !dropped {
                    return routed;
                }
                let action = ReplicateChunkAction::new(core.clone(), header.file_id, chunk_no);
                if !action.is_needed() {
                    return routed;
                }
                core.executor.execute(action);
                Routed::Spawned(kind)
            }
            Message::Chunk { .. } => self.forward(ChannelKind::Restore, &msg),
            Message::Delete { header } => {
                core.executor
                    .execute(PurgeAction::new(core.clone(), header.file_id));
                Routed::Spawned(kind)
            }
            Message::CheckDelete { header } => {
                if !core.backed_up.was_deleted(&header.file_id) {
                    return Routed::Ignored;
                }
                core.executor
                    .execute(TriggerDeleteAction::for_file(core.clone(), header.file_id));
                Routed::Spawned(kind)
            }
        }
    }

    fn forward(&self, channel: ChannelKind, msg: &Message) -> Routed {
        let subscribers = self.core.channels.get(channel).notify(msg);
        Routed::Forwarded {
            channel,
            subscribers,
        }
    }
}
