//! On-disk chunk store: `<root>/backup-<peer>/<file_id>/<chunk_no>`.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::protocol::{FileId, PeerId};

const PEER_DIR_PREFIX: &str = "backup-";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("chunk {chunk_no} of {file_id} not stored")]
    NotFound { file_id: FileId, chunk_no: u32 },
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

/// Chunks this peer stores for others, one file per chunk.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    peer_dir: PathBuf,
}

impl ChunkStore {
    /// Store rooted at `<base>/backup-<peer_id>`. The directory is created lazily on first write.
    pub fn new(base: &Path, peer_id: PeerId) -> Self {
        Self {
            peer_dir: base.join(format!("{}{}", PEER_DIR_PREFIX, peer_id)),
        }
    }

    /// The per-peer directory; registries persist next to the chunk directories.
    pub fn peer_dir(&self) -> &Path {
        &self.peer_dir
    }

    fn file_dir(&self, file_id: &FileId) -> PathBuf {
        self.peer_dir.join(file_id.to_string())
    }

    pub fn chunk_path(&self, file_id: &FileId, chunk_no: u32) -> PathBuf {
        self.file_dir(file_id).join(chunk_no.to_string())
    }

    pub fn has_chunk(&self, file_id: &FileId, chunk_no: u32) -> bool {
        self.chunk_path(file_id, chunk_no).is_file()
    }

    pub fn read_chunk(&self, file_id: &FileId, chunk_no: u32) -> Result<Vec<u8>, StorageError> {
        match std::fs::read(self.chunk_path(file_id, chunk_no)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                file_id: *file_id,
                chunk_no,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (or overwrite) a chunk. Each writer gets its own temp file in the
    /// chunk's directory; readers never see a partial chunk.
    pub fn write_chunk(
        &self,
        file_id: &FileId,
        chunk_no: u32,
        body: &[u8],
    ) -> Result<(), StorageError> {
        let dir = self.file_dir(file_id);
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new().prefix(".chunk").tempfile_in(&dir)?;
        tmp.write_all(body)?;
        tmp.persist(self.chunk_path(file_id, chunk_no))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove one chunk, and its file directory once empty. Returns the bytes freed.
    pub fn delete_chunk(&self, file_id: &FileId, chunk_no: u32) -> Result<u64, StorageError> {
        let path = self.chunk_path(file_id, chunk_no);
        let freed = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        std::fs::remove_file(&path)?;
        let dir = self.file_dir(file_id);
        if std::fs::read_dir(&dir)?.next().is_none() {
            std::fs::remove_dir(&dir)?;
        }
        Ok(freed)
    }

    /// Remove every chunk of a file. Returns the number of bytes freed.
    pub fn delete_file(&self, file_id: &FileId) -> Result<u64, StorageError> {
        let dir = self.file_dir(file_id);
        if !dir.exists() {
            return Ok(0);
        }
        let freed = dir_size(&dir)?;
        std::fs::remove_dir_all(&dir)?;
        Ok(freed)
    }

    /// Bytes used by all stored chunks.
    pub fn used_bytes(&self) -> Result<u64, StorageError> {
        if !self.peer_dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        for entry in std::fs::read_dir(&self.peer_dir)? {
            let entry = entry?;
            let is_chunk_dir = entry.file_type()?.is_dir()
                && entry.file_name().to_str().is_some_and(|n| n.parse::<FileId>().is_ok());
            if is_chunk_dir {
                total += dir_size(&entry.path())?;
            }
        }
        Ok(total)
    }
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}
