//! Peer context shared by the dispatcher and every action.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::{Channels, Outbound};
use crate::protocol::{FileId, Header, PeerId, Version, PROTOCOL_VERSION};
use crate::registry::{BackedUpFiles, ChunksRecorder, RegistryError};
use crate::scheduler::{Executor, Scheduler};
use crate::storage::ChunkStore;

/// Initial wait before the first replication check of a backup round.
pub const DEFAULT_BACKUP_WAIT: Duration = Duration::from_millis(1000);

/// Rounds of PUTCHUNK before a backup gives up.
pub const DEFAULT_MAX_BACKUP_CYCLES: u32 = 5;

/// Upper bound (exclusive) of the random delay before answering GETCHUNK.
pub const DEFAULT_CHUNK_REPLY_WINDOW: Duration = Duration::from_millis(4000);

/// Upper bound (exclusive) of the random delay before answering PUTCHUNK with STORED.
pub const DEFAULT_STORED_REPLY_WINDOW: Duration = Duration::from_millis(400);

/// Upper bound (exclusive) of the random delay before re-replicating a chunk after REMOVED.
pub const DEFAULT_REPLICATE_WINDOW: Duration = Duration::from_millis(400);

/// How long a restore waits for each CHUNK before asking again.
pub const DEFAULT_RESTORE_WAIT: Duration = Duration::from_millis(5000);

/// GETCHUNK attempts per chunk during a restore.
pub const DEFAULT_RESTORE_ATTEMPTS: u32 = 3;

/// Protocol timings. Defaults are the protocol constants; tests shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub backup_wait: Duration,
    pub max_backup_cycles: u32,
    pub chunk_reply_window: Duration,
    pub stored_reply_window: Duration,
    pub replicate_window: Duration,
    pub restore_wait: Duration,
    pub restore_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            backup_wait: DEFAULT_BACKUP_WAIT,
            max_backup_cycles: DEFAULT_MAX_BACKUP_CYCLES,
            chunk_reply_window: DEFAULT_CHUNK_REPLY_WINDOW,
            stored_reply_window: DEFAULT_STORED_REPLY_WINDOW,
            replicate_window: DEFAULT_REPLICATE_WINDOW,
            restore_wait: DEFAULT_RESTORE_WAIT,
            restore_attempts: DEFAULT_RESTORE_ATTEMPTS,
        }
    }
}

/// Static configuration of a peer.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub peer_id: PeerId,
    pub version: Version,
    pub storage_dir: PathBuf,
    /// 0 means unlimited.
    pub max_storage_bytes: u64,
    pub timings: Timings,
}

impl CoreConfig {
    pub fn new(peer_id: PeerId, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            peer_id,
            version: PROTOCOL_VERSION,
            storage_dir: storage_dir.into(),
            max_storage_bytes: 0,
            timings: Timings::default(),
        }
    }
}

/// Everything an action needs: identity, channels, storage, registries, scheduling.
pub struct PeerCore {
    config: CoreConfig,
    pub channels: Channels,
    pub store: ChunkStore,
    pub stored_chunks: ChunksRecorder,
    pub backed_up: BackedUpFiles,
    pub scheduler: Scheduler,
    pub executor: Executor,
    /// Bytes this peer may use for chunks; `u64::MAX` when unlimited.
    storage_limit: AtomicU64,
    /// Serializes capacity checks with the writes and evictions that follow them.
    storage_lock: Mutex<()>,
}

impl PeerCore {
    /// Open the peer's store and persisted registries. Must run inside a tokio runtime.
    pub fn open(config: CoreConfig) -> Result<(Arc<Self>, Outbound), RegistryError> {
        let store = ChunkStore::new(&config.storage_dir, config.peer_id);
        let stored_chunks = ChunksRecorder::open(store.peer_dir())?;
        let backed_up = BackedUpFiles::open(store.peer_dir())?;
        let (channels, outbound) = Channels::new();
        let limit = match config.max_storage_bytes {
            0 => u64::MAX,
            n => n,
        };
        let core = Self {
            config,
            channels,
            store,
            stored_chunks,
            backed_up,
            scheduler: Scheduler::current(),
            executor: Executor::current(),
            storage_limit: AtomicU64::new(limit),
            storage_lock: Mutex::new(()),
        };
        Ok((Arc::new(core), outbound))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn peer_id(&self) -> PeerId {
        self.config.peer_id
    }

    pub fn version(&self) -> Version {
        self.config.version
    }

    pub fn timings(&self) -> &Timings {
        &self.config.timings
    }

    /// Header for a message this peer originates about `file_id`.
    pub fn header(&self, file_id: FileId) -> Header {
        Header::new(self.config.version, self.config.peer_id, file_id)
    }

    /// Where restored files are written.
    pub fn restore_dir(&self) -> PathBuf {
        self.store.peer_dir().join("restored")
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    /// Current chunk storage limit in bytes, `None` when unlimited.
    pub fn storage_limit(&self) -> Option<u64> {
        match self.storage_limit.load(Ordering::Acquire) {
            u64::MAX => None,
            n => Some(n),
        }
    }

    /// Change the limit without evicting anything. Reclaiming goes through `ReclaimAction`.
    pub fn set_storage_limit(&self, limit: Option<u64>) {
        self.storage_limit
            .store(limit.unwrap_or(u64::MAX), Ordering::Release);
    }

    pub(crate) fn storage_guard(&self) -> MutexGuard<'_, ()> {
        self.storage_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
