//! Receiver side of DELETE: drop every local chunk of the file.

use std::sync::Arc;

use tracing::{info, warn};

use super::Action;
use crate::core::PeerCore;
use crate::protocol::FileId;

pub struct PurgeAction {
    core: Arc<PeerCore>,
    file_id: FileId,
}

impl PurgeAction {
    pub fn new(core: Arc<PeerCore>, file_id: FileId) -> Self {
        Self { core, file_id }
    }

    pub fn purge(&self) {
        let records = self.core.stored_chunks.remove_file(&self.file_id);
        match self.core.store.delete_file(&self.file_id) {
            Ok(freed) if records > 0 || freed > 0 => {
                info!(file_id = %self.file_id, chunks = records, freed, "file chunks deleted")
            }
            Ok(_) => {}
            Err(e) => warn!(file_id = %self.file_id, error = %e, "failed to delete chunks"),
        }
    }
}

impl Action for PurgeAction {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        async move { self.purge() }
    }
}
