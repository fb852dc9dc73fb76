//! Space reclaim: lower the storage limit and evict chunks until usage fits.
//!
//! Chunks with the largest surplus of holders over their desired degree go
//! first. Every eviction is announced with REMOVED so holders can re-replicate.

use std::cmp::Reverse;
use std::sync::Arc;

use tracing::{info, warn};

use super::Action;
use crate::core::PeerCore;
use crate::protocol::{FileId, Message};
use crate::registry::ChunkRecord;

pub struct ReclaimAction {
    core: Arc<PeerCore>,
    max_bytes: u64,
}

fn surplus(record: &ChunkRecord) -> i64 {
    record.perceived_degree() as i64 - i64::from(record.desired_degree)
}

impl ReclaimAction {
    pub fn new(core: Arc<PeerCore>, max_bytes: u64) -> Self {
        Self { core, max_bytes }
    }

    /// Apply the new limit and evict. Returns the evicted chunks in eviction order.
    pub fn reclaim(&self) -> Vec<(FileId, u32)> {
        let core = &self.core;
        let _guard = core.storage_guard();
        core.set_storage_limit(Some(self.max_bytes));

        let mut used = match core.store.used_bytes() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cannot measure storage use, nothing reclaimed");
                return Vec::new();
            }
        };
        let mut candidates = core.stored_chunks.records();
        // stable sort keeps file then chunk order among equals
        candidates.sort_by_key(|(_, _, r)| Reverse((surplus(r), r.size)));

        let mut evicted = Vec::new();
        for (file_id, chunk_no, record) in candidates {
            if used <= self.max_bytes {
                break;
            }
            match core.store.delete_chunk(&file_id, chunk_no) {
                Ok(freed) => used = used.saturating_sub(freed),
                Err(e) => {
                    warn!(file_id = %file_id, chunk_no, error = %e, "failed to evict chunk");
                    continue;
                }
            }
            core.stored_chunks.remove_chunk(&file_id, chunk_no);
            let removed = Message::Removed {
                header: core.header(file_id),
                chunk_no,
            };
            core.channels.control.send_message(&removed);
            info!(
                file_id = %file_id,
                chunk_no,
                size = record.size,
                surplus = surplus(&record),
                "chunk evicted"
            );
            evicted.push((file_id, chunk_no));
        }

        if used > self.max_bytes {
            warn!(used, limit = self.max_bytes, "storage still above limit after reclaim");
        } else {
            info!(used, limit = self.max_bytes, evicted = evicted.len(), "space reclaimed");
        }
        evicted
    }
}

impl Action for ReclaimAction {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        async move {
            self.reclaim();
        }
    }
}
