//! Local registries: files this peer backs up, and chunks it stores for others.
//!
//! Both are small key-value records guarded by a mutex and persisted with
//! bincode after every mutation. A persistence failure is logged and the
//! in-memory state stays authoritative.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::{FileId, PeerId};

pub const BACKED_UP_FILES_FILE: &str = "BackedUpFiles.bin";
pub const CHUNKS_RECORDER_FILE: &str = "ChunksRecorder.bin";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn load<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, RegistryError> {
    match path {
        Some(p) if p.exists() => Ok(bincode::deserialize(&std::fs::read(p)?)?),
        _ => Ok(T::default()),
    }
}

fn save<T: Serialize>(path: Option<&Path>, value: &T) -> Result<(), RegistryError> {
    let Some(p) = path else {
        return Ok(());
    };
    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(p, bincode::serialize(value)?)?;
    Ok(())
}

/// A file this peer has backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpFile {
    pub path: PathBuf,
    pub file_id: FileId,
    pub chunk_count: u32,
    pub replication_degree: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackedUpState {
    files: BTreeMap<FileId, BackedUpFile>,
    /// Files deleted by this peer; answers CHECKDELETE from peers that missed the DELETE.
    deleted: BTreeSet<FileId>,
}

pub struct BackedUpFiles {
    path: Option<PathBuf>,
    state: Mutex<BackedUpState>,
}

impl BackedUpFiles {
    /// Registry kept only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(BackedUpState::default()),
        }
    }

    /// Registry persisted at `<dir>/BackedUpFiles.bin`, loading any existing state.
    pub fn open(dir: &Path) -> Result<Self, RegistryError> {
        let path = dir.join(BACKED_UP_FILES_FILE);
        let state = load(Some(&path))?;
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &BackedUpState) {
        if let Err(e) = save(self.path.as_deref(), state) {
            warn!(error = %e, "failed to persist backed-up files registry");
        }
    }

    /// Record a backed-up file. A path holds one version: records for the same
    /// path under another ID are dropped and returned so their chunks can be deleted.
    pub fn add_file(&self, file: BackedUpFile) -> Vec<BackedUpFile> {
        let mut state = lock(&self.state);
        let stale: Vec<FileId> = state
            .files
            .values()
            .filter(|f| f.path == file.path && f.file_id != file.file_id)
            .map(|f| f.file_id)
            .collect();
        let superseded = stale
            .iter()
            .filter_map(|id| state.files.remove(id))
            .collect();
        state.deleted.remove(&file.file_id);
        state.files.insert(file.file_id, file);
        self.persist(&state);
        superseded
    }

    /// Forget a file and remember that it was deleted. Returns the removed record.
    pub fn remove_file(&self, file_id: &FileId) -> Option<BackedUpFile> {
        let mut state = lock(&self.state);
        let removed = state.files.remove(file_id);
        state.deleted.insert(*file_id);
        self.persist(&state);
        removed
    }

    pub fn get(&self, file_id: &FileId) -> Option<BackedUpFile> {
        lock(&self.state).files.get(file_id).cloned()
    }

    /// The current version backed up from `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<BackedUpFile> {
        lock(&self.state)
            .files
            .values()
            .find(|f| f.path == path)
            .cloned()
    }

    pub fn is_backed_up(&self, file_id: &FileId) -> bool {
        lock(&self.state).files.contains_key(file_id)
    }

    pub fn was_deleted(&self, file_id: &FileId) -> bool {
        lock(&self.state).deleted.contains(file_id)
    }

    pub fn files(&self) -> Vec<BackedUpFile> {
        lock(&self.state).files.values().cloned().collect()
    }
}

/// A chunk this peer stores on behalf of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub size: u64,
    pub desired_degree: u8,
    /// Peers known to hold a copy, this one included.
    pub holders: BTreeSet<PeerId>,
}

impl ChunkRecord {
    pub fn perceived_degree(&self) -> usize {
        self.holders.len()
    }
}

pub struct ChunksRecorder {
    path: Option<PathBuf>,
    chunks: Mutex<BTreeMap<(FileId, u32), ChunkRecord>>,
}

impl ChunksRecorder {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            chunks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Recorder persisted at `<dir>/ChunksRecorder.bin`.
    pub fn open(dir: &Path) -> Result<Self, RegistryError> {
        let path = dir.join(CHUNKS_RECORDER_FILE);
        let chunks = load(Some(&path))?;
        Ok(Self {
            path: Some(path),
            chunks: Mutex::new(chunks),
        })
    }

    fn persist(&self, chunks: &BTreeMap<(FileId, u32), ChunkRecord>) {
        if let Err(e) = save(self.path.as_deref(), chunks) {
            warn!(error = %e, "failed to persist chunks recorder");
        }
    }

    /// Record a freshly stored chunk with `holder` (this peer) as its only known holder.
    pub fn record_chunk(
        &self,
        file_id: FileId,
        chunk_no: u32,
        size: u64,
        desired_degree: u8,
        holder: PeerId,
    ) {
        let mut chunks = lock(&self.chunks);
        let record = chunks.entry((file_id, chunk_no)).or_insert_with(|| ChunkRecord {
            size,
            desired_degree,
            holders: BTreeSet::new(),
        });
        record.size = size;
        record.desired_degree = desired_degree;
        record.holders.insert(holder);
        self.persist(&chunks);
    }

    pub fn has_chunk(&self, file_id: &FileId, chunk_no: u32) -> bool {
        lock(&self.chunks).contains_key(&(*file_id, chunk_no))
    }

    pub fn get(&self, file_id: &FileId, chunk_no: u32) -> Option<ChunkRecord> {
        lock(&self.chunks).get(&(*file_id, chunk_no)).cloned()
    }

    /// Note that `peer` also holds the chunk. No-op for chunks not stored here.
    pub fn add_holder(&self, file_id: &FileId, chunk_no: u32, peer: PeerId) -> bool {
        let mut chunks = lock(&self.chunks);
        let changed = chunks
            .get_mut(&(*file_id, chunk_no))
            .is_some_and(|r| r.holders.insert(peer));
        if changed {
            self.persist(&chunks);
        }
        changed
    }

    pub fn remove_holder(&self, file_id: &FileId, chunk_no: u32, peer: PeerId) -> bool {
        let mut chunks = lock(&self.chunks);
        let changed = chunks
            .get_mut(&(*file_id, chunk_no))
            .is_some_and(|r| r.holders.remove(&peer));
        if changed {
            self.persist(&chunks);
        }
        changed
    }

    /// Drop one chunk's record.
    pub fn remove_chunk(&self, file_id: &FileId, chunk_no: u32) -> Option<ChunkRecord> {
        let mut chunks = lock(&self.chunks);
        let removed = chunks.remove(&(*file_id, chunk_no));
        if removed.is_some() {
            self.persist(&chunks);
        }
        removed
    }

    /// Drop every chunk of a file. Returns how many records were removed.
    pub fn remove_file(&self, file_id: &FileId) -> usize {
        let mut chunks = lock(&self.chunks);
        let before = chunks.len();
        chunks.retain(|(id, _), _| id != file_id);
        let removed = before - chunks.len();
        if removed > 0 {
            self.persist(&chunks);
        }
        removed
    }

    /// Distinct files with at least one stored chunk.
    pub fn files(&self) -> Vec<FileId> {
        let ids: HashSet<FileId> = lock(&self.chunks).keys().map(|(id, _)| *id).collect();
        let mut ids: Vec<FileId> = ids.into_iter().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every record, ordered by file then chunk number.
    pub fn records(&self) -> Vec<(FileId, u32, ChunkRecord)> {
        lock(&self.chunks)
            .iter()
            .map(|(&(id, n), r)| (id, n, r.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::file_id_from_parts;

    fn record(id: FileId) -> BackedUpFile {
        BackedUpFile {
            path: PathBuf::from("/data/report.pdf"),
            file_id: id,
            chunk_count: 3,
            replication_degree: 2,
        }
    }

    #[test]
    fn backed_up_add_remove_tombstone() {
        let reg = BackedUpFiles::in_memory();
        let id = file_id_from_parts("report.pdf", 1);
        reg.add_file(record(id));
        assert!(reg.is_backed_up(&id));
        assert_eq!(reg.find_by_path(Path::new("/data/report.pdf")).unwrap().file_id, id);

        assert_eq!(reg.remove_file(&id).unwrap().chunk_count, 3);
        assert!(!reg.is_backed_up(&id));
        assert!(reg.was_deleted(&id));

        reg.add_file(record(id));
        assert!(!reg.was_deleted(&id));
    }

    #[test]
    fn backing_up_a_path_again_replaces_older_version() {
        let reg = BackedUpFiles::in_memory();
        let path = Path::new("/data/report.pdf");
        let older = file_id_from_parts("report.pdf", 1);
        let newer = file_id_from_parts("report.pdf", 2);
        let other = file_id_from_parts("other.pdf", 1);
        assert!(reg.add_file(record(older)).is_empty());
        reg.add_file(BackedUpFile {
            path: PathBuf::from("/data/other.pdf"),
            ..record(other)
        });

        let superseded = reg.add_file(record(newer));
        assert_eq!(superseded, vec![record(older)]);
        assert_eq!(reg.find_by_path(path).unwrap().file_id, newer);
        assert!(!reg.is_backed_up(&older));
        assert!(reg.is_backed_up(&other));
        assert_eq!(reg.files().len(), 2);

        // same version again supersedes nothing
        assert!(reg.add_file(record(newer)).is_empty());
    }

    #[test]
    fn backed_up_persists() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("report.pdf", 1);
        {
            let reg = BackedUpFiles::open(dir.path()).unwrap();
            reg.add_file(record(id));
        }
        let reg = BackedUpFiles::open(dir.path()).unwrap();
        assert_eq!(reg.get(&id), Some(record(id)));
        assert_eq!(reg.files().len(), 1);
    }

    #[test]
    fn recorder_holders() {
        let rec = ChunksRecorder::in_memory();
        let id = file_id_from_parts("f", 1);
        assert!(!rec.add_holder(&id, 0, PeerId(2)));

        rec.record_chunk(id, 0, 100, 2, PeerId(1));
        assert!(rec.add_holder(&id, 0, PeerId(2)));
        assert!(!rec.add_holder(&id, 0, PeerId(2)));
        assert_eq!(rec.get(&id, 0).unwrap().perceived_degree(), 2);

        assert!(rec.remove_holder(&id, 0, PeerId(2)));
        assert_eq!(rec.get(&id, 0).unwrap().perceived_degree(), 1);

        assert_eq!(rec.remove_chunk(&id, 0).unwrap().size, 100);
        assert!(rec.remove_chunk(&id, 0).is_none());
        assert!(rec.records().is_empty());
    }

    #[test]
    fn recorder_remove_file_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_id_from_parts("a", 1);
        let b = file_id_from_parts("b", 1);
        {
            let rec = ChunksRecorder::open(dir.path()).unwrap();
            rec.record_chunk(a, 0, 10, 1, PeerId(1));
            rec.record_chunk(a, 1, 10, 1, PeerId(1));
            rec.record_chunk(b, 0, 10, 1, PeerId(1));
            assert_eq!(rec.remove_file(&a), 2);
        }
        let rec = ChunksRecorder::open(dir.path()).unwrap();
        assert_eq!(rec.files(), vec![b]);
        assert!(rec.has_chunk(&b, 0));
        assert!(!rec.has_chunk(&a, 0));
    }
}
