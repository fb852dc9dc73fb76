//! Actions: one protocol round each, run concurrently on the executor.
//!
//! Fire-and-forget actions send and finish. Reply-awaiting actions subscribe to
//! a channel for the file they concern and unsubscribe when their round ends.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

mod backup;
mod delete;
mod purge;
mod reclaim;
mod replicate;
mod restore;
mod retrieve;
mod store;

pub use backup::{BackupError, BackupOutcome, TriggerBackupAction};
pub use delete::TriggerDeleteAction;
pub use purge::PurgeAction;
pub use reclaim::ReclaimAction;
pub use replicate::ReplicateChunkAction;
pub use restore::{RestoreError, TriggerRestoreAction};
pub use retrieve::RetrieveChunkAction;
pub use store::StoreAction;

/// A unit of protocol work. Owned by the task that runs it.
pub trait Action: Send + 'static {
    fn run(self) -> impl Future<Output = ()> + Send;
}

/// Uniform delay in `[0, window)`, millisecond resolution.
pub(crate) fn random_delay(window: Duration) -> Duration {
    let ms = window.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..ms))
}
