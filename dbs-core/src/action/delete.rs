//! Delete round: broadcast DELETE once and forget the file locally. Not acknowledged.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use super::Action;
use crate::core::PeerCore;
use crate::identity::{gen_file_id, FileIdError};
use crate::protocol::{FileId, Message};

pub struct TriggerDeleteAction {
    core: Arc<PeerCore>,
    file_id: FileId,
}

impl TriggerDeleteAction {
    /// Delete the file at `path`. Uses the registered ID if the path was backed up,
    /// so a file that has since been removed or touched can still be deleted.
    pub fn new(core: Arc<PeerCore>, path: &Path) -> Result<Self, FileIdError> {
        let file_id = match core.backed_up.find_by_path(path) {
            Some(record) => record.file_id,
            None => gen_file_id(path)?,
        };
        Ok(Self::for_file(core, file_id))
    }

    pub fn for_file(core: Arc<PeerCore>, file_id: FileId) -> Self {
        Self { core, file_id }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn delete(&self) {
        let msg = Message::Delete {
            header: self.core.header(self.file_id),
        };
        if !self.core.channels.control.send_message(&msg) {
            error!(file_id = %self.file_id, "failed to build DELETE, stopping delete action");
            return;
        }
        self.core.backed_up.remove_file(&self.file_id);
        info!(file_id = %self.file_id, "delete requested");
    }
}

impl Action for TriggerDeleteAction {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        async move { self.delete() }
    }
}
