//! Backup round: drive every chunk of a file to its replication degree.
//!
//! PUTCHUNK goes out for all chunks, then the action sleeps and counts STORED
//! replies. Chunks still short of the degree are re-sent with the wait doubled,
//! up to the cycle cap. Success is judged only on replies counted so far;
//! nothing is re-verified afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Action, TriggerDeleteAction};
use crate::channel::Inbox;
use crate::chunk;
use crate::core::PeerCore;
use crate::identity::{gen_file_id, FileIdError};
use crate::protocol::{FileId, Message, MAX_REPLICATION_DEGREE};
use crate::registry::BackedUpFile;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("replication degree {0} out of range 1-9")]
    ReplicationDegree(u8),
    #[error(transparent)]
    FileId(#[from] FileIdError),
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished round observed. Counters are STORED replies, not verified holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub file_id: FileId,
    pub chunks_rd: Vec<u32>,
    /// Re-send cycles performed after the initial broadcast.
    pub cycles: u32,
    pub converged: bool,
}

pub struct TriggerBackupAction {
    core: Arc<PeerCore>,
    path: Option<PathBuf>,
    file_id: FileId,
    replication_degree: u8,
    chunks: Vec<Vec<u8>>,
    chunks_rd: Vec<u32>,
    wait: Duration,
    cycles: u32,
}

impl TriggerBackupAction {
    /// Back up the file at `path`: identify it and split it into chunks.
    pub fn new(
        core: Arc<PeerCore>,
        path: &Path,
        replication_degree: u8,
    ) -> Result<Self, BackupError> {
        let file_id = gen_file_id(path)?;
        let chunks = chunk::split_file(path)?;
        let mut action = Self::with_chunks(core, file_id, replication_degree, chunks)?;
        action.path = Some(path.to_path_buf());
        Ok(action)
    }

    /// Back up already-split chunks under `file_id`. Nothing is recorded in the registry.
    pub fn with_chunks(
        core: Arc<PeerCore>,
        file_id: FileId,
        replication_degree: u8,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Self, BackupError> {
        if replication_degree == 0 || replication_degree > MAX_REPLICATION_DEGREE {
            return Err(BackupError::ReplicationDegree(replication_degree));
        }
        let wait = core.timings().backup_wait;
        Ok(Self {
            core,
            path: None,
            file_id,
            replication_degree,
            chunks_rd: vec![0; chunks.len()],
            chunks,
            wait,
            cycles: 0,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Count a STORED reply for this file. Duplicates from the same peer count again.
    pub fn parse_response(&mut self, msg: &Message) {
        let Message::Stored { header, chunk_no } = msg else {
            return;
        };
        if header.file_id != self.file_id {
            return;
        }
        match self.chunks_rd.get_mut(*chunk_no as usize) {
            Some(count) => *count += 1,
            None => debug!(file_id = %self.file_id, chunk_no, "STORED for unknown chunk"),
        }
    }

    fn missing_chunks(&self) -> Vec<u32> {
        let degree = u32::from(self.replication_degree);
        self.chunks_rd
            .iter()
            .enumerate()
            .filter(|(_, &rd)| rd < degree)
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn request_backup(&self, chunk_no: u32) {
        let msg = Message::PutChunk {
            header: self.core.header(self.file_id),
            chunk_no,
            replication_degree: self.replication_degree,
            body: self.chunks[chunk_no as usize].clone(),
        };
        // a build failure skips this chunk only
        self.core.channels.backup.send_message(&msg);
    }

    /// Run the round to completion and report the final counters.
    pub async fn execute(mut self) -> BackupOutcome {
        if let Some(path) = self.path.take() {
            let superseded = self.core.backed_up.add_file(BackedUpFile {
                path,
                file_id: self.file_id,
                chunk_count: self.chunks.len() as u32,
                replication_degree: self.replication_degree,
            });
            for old in superseded {
                info!(file_id = %old.file_id, replaced_by = %self.file_id, "deleting previous version");
                TriggerDeleteAction::for_file(self.core.clone(), old.file_id).delete();
            }
        }

        let mut pending = self.missing_chunks();
        if self.chunks.is_empty() {
            info!(file_id = %self.file_id, "empty file, nothing to replicate");
            return self.outcome(true);
        }

        let (tx, mut inbox) = mpsc::unbounded_channel();
        let control = &self.core.channels.control;
        let sub = control.subscribe(self.file_id, Arc::new(Inbox(tx)));
        let max_cycles = self.core.timings().max_backup_cycles;
        info!(
            file_id = %self.file_id,
            chunks = self.chunks.len(),
            degree = self.replication_degree,
            "backup started"
        );

        let converged = loop {
            for &chunk_no in &pending {
                self.request_backup(chunk_no);
            }
            tokio::time::sleep(self.wait).await;
            while let Ok(msg) = inbox.try_recv() {
                self.parse_response(&msg);
            }

            pending = self.missing_chunks();
            if pending.is_empty() {
                break true;
            }
            self.cycles += 1;
            if self.cycles >= max_cycles {
                break false;
            }
            debug!(
                file_id = %self.file_id,
                missing = pending.len(),
                cycle = self.cycles,
                "replication degree not reached, retrying"
            );
            self.wait *= 2;
        };

        self.core.channels.control.unsubscribe(sub);
        if converged {
            info!(file_id = %self.file_id, cycles = self.cycles, "backup complete");
        } else {
            warn!(
                file_id = %self.file_id,
                missing = pending.len(),
                counters = ?self.chunks_rd,
                "backup gave up before reaching replication degree"
            );
        }
        self.outcome(converged)
    }

    fn outcome(self, converged: bool) -> BackupOutcome {
        BackupOutcome {
            file_id: self.file_id,
            chunks_rd: self.chunks_rd,
            cycles: self.cycles,
            converged,
        }
    }
}

impl Action for TriggerBackupAction {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        async move {
            self.execute().await;
        }
    }
}
