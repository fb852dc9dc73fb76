//! Receiver side of PUTCHUNK: store the chunk if there is room, then acknowledge.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{random_delay, Action};
use crate::core::PeerCore;
use crate::protocol::{Header, Message};

pub struct StoreAction {
    core: Arc<PeerCore>,
    header: Header,
    chunk_no: u32,
    replication_degree: u8,
    body: Vec<u8>,
}

impl StoreAction {
    pub fn new(
        core: Arc<PeerCore>,
        header: Header,
        chunk_no: u32,
        replication_degree: u8,
        body: Vec<u8>,
    ) -> Self {
        Self {
            core,
            header,
            chunk_no,
            replication_degree,
            body,
        }
    }

    /// Store the chunk. Returns whether a STORED reply is due.
    fn store(&self) -> bool {
        let core = &self.core;
        let file_id = &self.header.file_id;
        if core.backed_up.is_backed_up(file_id) {
            debug!(file_id = %file_id, "PUTCHUNK for a file this peer backs up, ignored");
            return false;
        }
        if core.stored_chunks.has_chunk(file_id, self.chunk_no)
            && core.store.has_chunk(file_id, self.chunk_no)
        {
            debug!(file_id = %file_id, chunk_no = self.chunk_no, "chunk already stored");
            return true;
        }

        let _guard = core.storage_guard();
        if let Some(limit) = core.storage_limit() {
            let used = match core.store.used_bytes() {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "cannot measure storage use, refusing chunk");
                    return false;
                }
            };
            if used + self.body.len() as u64 > limit {
                info!(file_id = %file_id, chunk_no = self.chunk_no, used, limit, "no space for chunk");
                return false;
            }
        }

        if let Err(e) = core.store.write_chunk(file_id, self.chunk_no, &self.body) {
            warn!(file_id = %file_id, chunk_no = self.chunk_no, error = %e, "failed to store chunk");
            return false;
        }
        core.stored_chunks.record_chunk(
            *file_id,
            self.chunk_no,
            self.body.len() as u64,
            self.replication_degree,
            core.peer_id(),
        );
        // the initiator is not a holder; STORED from other peers adds them
        info!(file_id = %file_id, chunk_no = self.chunk_no, size = self.body.len(), "chunk stored");
        true
    }
}

impl Action for StoreAction {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        async move {
            if !self.store() {
                return;
            }
            let delay = random_delay(self.core.timings().stored_reply_window);
            tokio::time::sleep(delay).await;
            let reply = Message::Stored {
                header: self.core.header(self.header.file_id),
                chunk_no: self.chunk_no,
            };
            self.core.channels.control.send_message(&reply);
        }
    }
}
