//! Re-replication after REMOVED: a holder whose chunk fell below its desired
//! degree re-sends PUTCHUNK from its local copy.
//!
//! Every remaining holder schedules the PUTCHUNK after a random delay and
//! watches the backup channel; the first to send wins and the others cancel.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::{random_delay, Action};
use crate::channel::{Subscriber, Subscription};
use crate::core::PeerCore;
use crate::protocol::{FileId, Message};
use crate::scheduler::ScheduledTask;

pub struct ReplicateChunkAction {
    inner: Arc<Replication>,
}

struct Replication {
    core: Arc<PeerCore>,
    file_id: FileId,
    chunk_no: u32,
    desired_degree: u8,
    body: Option<Vec<u8>>,
    sender: Mutex<Option<ScheduledTask>>,
    subscription: Mutex<Option<Subscription>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReplicateChunkAction {
    /// Inert unless this peer stores the chunk and its perceived degree is below the desired one.
    pub fn new(core: Arc<PeerCore>, file_id: FileId, chunk_no: u32) -> Self {
        let record = core
            .stored_chunks
            .get(&file_id, chunk_no)
            .filter(|r| r.perceived_degree() < usize::from(r.desired_degree));
        let desired_degree = record.as_ref().map_or(0, |r| r.desired_degree);
        let body = record.and_then(|_| match core.store.read_chunk(&file_id, chunk_no) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(file_id = %file_id, chunk_no, error = %e, "cannot read chunk to re-replicate");
                None
            }
        });
        Self {
            inner: Arc::new(Replication {
                core,
                file_id,
                chunk_no,
                desired_degree,
                body,
                sender: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
        }
    }

    pub fn is_needed(&self) -> bool {
        self.inner.body.is_some()
    }

    /// Subscribe to the backup channel and schedule the PUTCHUNK.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.body.is_none() {
            return;
        }
        let core = &inner.core;
        // held until the task handle is stored, so a competing PUTCHUNK always finds it
        let mut sender = lock(&inner.sender);
        let sub = core
            .channels
            .backup
            .subscribe(inner.file_id, inner.clone() as Arc<dyn Subscriber>);
        *lock(&inner.subscription) = Some(sub);

        let delay = random_delay(core.timings().replicate_window);
        let fire = inner.clone();
        *sender = Some(core.scheduler.schedule(delay, move || fire.send_putchunk()));
        debug!(file_id = %inner.file_id, chunk_no = inner.chunk_no, delay_ms = delay.as_millis() as u64, "re-replication scheduled");
    }
}

impl Replication {
    fn unsubscribe(&self) {
        if let Some(sub) = lock(&self.subscription).take() {
            self.core.channels.backup.unsubscribe(sub);
        }
    }

    fn send_putchunk(&self) {
        if let Some(body) = &self.body {
            let msg = Message::PutChunk {
                header: self.core.header(self.file_id),
                chunk_no: self.chunk_no,
                replication_degree: self.desired_degree,
                body: body.clone(),
            };
            if self.core.channels.backup.send_message(&msg) {
                info!(file_id = %self.file_id, chunk_no = self.chunk_no, "chunk re-replicated");
            }
        }
        self.unsubscribe();
    }
}

impl Subscriber for Replication {
    fn parse_response(&self, msg: &Message) {
        if !matches!(msg, Message::PutChunk { .. }) || !msg.concerns(&self.file_id, self.chunk_no) {
            return;
        }
        if lock(&self.sender).as_ref().is_some_and(ScheduledTask::cancel) {
            debug!(
                file_id = %self.file_id,
                chunk_no = self.chunk_no,
                by = %msg.sender_id(),
                "another holder re-replicated first"
            );
        }
        self.unsubscribe();
    }
}

impl Action for ReplicateChunkAction {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        async move { self.start() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Outbound;
    use crate::core::CoreConfig;
    use crate::identity::file_id_from_parts;
    use crate::protocol::{Header, PeerId, PROTOCOL_VERSION};
    use crate::wire;
    use std::time::Duration;

    const ME: PeerId = PeerId(3);

    fn holder(dir: &std::path::Path, file_id: FileId, desired: u8) -> (Arc<PeerCore>, Outbound) {
        let (core, out) = PeerCore::open(CoreConfig::new(ME, dir)).unwrap();
        core.store.write_chunk(&file_id, 0, b"copy").unwrap();
        core.stored_chunks.record_chunk(file_id, 0, 4, desired, ME);
        (core, out)
    }

    #[tokio::test(start_paused = true)]
    async fn under_replicated_chunk_is_sent_once() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 2);

        let action = ReplicateChunkAction::new(core.clone(), id, 0);
        assert!(action.is_needed());
        action.run().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let msg = wire::parse(&out.backup.try_recv().unwrap()).unwrap();
        assert_eq!(
            msg,
            Message::PutChunk {
                header: Header::new(PROTOCOL_VERSION, ME, id),
                chunk_no: 0,
                replication_degree: 2,
                body: b"copy".to_vec(),
            }
        );
        assert!(out.backup.try_recv().is_err());
        assert_eq!(core.channels.backup.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn competing_putchunk_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 2);

        ReplicateChunkAction::new(core.clone(), id, 0).run().await;
        let other = Message::PutChunk {
            header: Header::new(PROTOCOL_VERSION, PeerId(4), id),
            chunk_no: 0,
            replication_degree: 2,
            body: b"copy".to_vec(),
        };
        assert_eq!(core.channels.backup.notify(&other), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(out.backup.try_recv().is_err());
        assert_eq!(core.channels.backup.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_or_unheld_chunk_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 1);

        let satisfied = ReplicateChunkAction::new(core.clone(), id, 0);
        assert!(!satisfied.is_needed());
        satisfied.run().await;
        let unheld = ReplicateChunkAction::new(core.clone(), id, 9);
        assert!(!unheld.is_needed());
        unheld.run().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(out.backup.try_recv().is_err());
        assert_eq!(core.channels.backup.subscriber_count(), 0);
    }
}
