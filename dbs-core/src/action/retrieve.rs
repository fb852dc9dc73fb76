//! Answer GETCHUNK with randomized suppression.
//!
//! Every holder of the chunk schedules its CHUNK reply after a random delay and
//! listens on the restore channel meanwhile. The first holder to answer wins;
//! the others see its CHUNK and cancel their own pending reply.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::{random_delay, Action};
use crate::channel::{Subscriber, Subscription};
use crate::core::PeerCore;
use crate::protocol::{FileId, Header, Message, Version};
use crate::scheduler::ScheduledTask;

pub struct RetrieveChunkAction {
    inner: Arc<Retrieval>,
}

struct Retrieval {
    core: Arc<PeerCore>,
    version: Version,
    file_id: FileId,
    chunk_no: u32,
    body: Option<Vec<u8>>,
    sender: Mutex<Option<ScheduledTask>>,
    subscription: Mutex<Option<Subscription>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RetrieveChunkAction {
    /// Prepare an answer to GETCHUNK `(request.file_id, chunk_no)`.
    ///
    /// Reads the chunk now. If it is not stored here, or cannot be read, the
    /// action is inert: running it neither subscribes nor schedules anything.
    pub fn new(core: Arc<PeerCore>, request: &Header, chunk_no: u32) -> Self {
        let file_id = request.file_id;
        let body = if core.stored_chunks.has_chunk(&file_id, chunk_no) {
            match core.store.read_chunk(&file_id, chunk_no) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(file_id = %file_id, chunk_no, error = %e, "failed to get chunk bytes");
                    None
                }
            }
        } else {
            None
        };
        Self {
            inner: Arc::new(Retrieval {
                core,
                version: request.version,
                file_id,
                chunk_no,
                body,
                sender: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Whether this peer holds the chunk and will take part in the round.
    pub fn is_stored(&self) -> bool {
        self.inner.body.is_some()
    }

    /// Subscribe and schedule the reply. Returns immediately; the reply fires from the scheduler.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.body.is_none() {
            debug!(file_id = %inner.file_id, chunk_no = inner.chunk_no, "chunk not stored, not answering");
            return;
        }
        let core = &inner.core;
        // held until the task handle is stored, so a competing CHUNK always finds it
        let mut sender = lock(&inner.sender);
        let sub = core
            .channels
            .restore
            .subscribe(inner.file_id, inner.clone() as Arc<dyn Subscriber>);
        *lock(&inner.subscription) = Some(sub);

        let delay = random_delay(core.timings().chunk_reply_window);
        let fire = inner.clone();
        *sender = Some(core.scheduler.schedule(delay, move || fire.send_chunk()));
        debug!(file_id = %inner.file_id, chunk_no = inner.chunk_no, delay_ms = delay.as_millis() as u64, "CHUNK reply scheduled");
    }
}

impl Retrieval {
    fn unsubscribe(&self) {
        if let Some(sub) = lock(&self.subscription).take() {
            self.core.channels.restore.unsubscribe(sub);
        }
    }

    fn send_chunk(&self) {
        if let Some(body) = &self.body {
            let msg = Message::Chunk {
                header: Header::new(self.version, self.core.peer_id(), self.file_id),
                chunk_no: self.chunk_no,
                body: body.clone(),
            };
            if self.core.channels.restore.send_message(&msg) {
                info!(file_id = %self.file_id, chunk_no = self.chunk_no, "chunk sent");
            }
        }
        self.unsubscribe();
    }
}

impl Subscriber for Retrieval {
    fn parse_response(&self, msg: &Message) {
        if !matches!(msg, Message::Chunk { .. }) || !msg.concerns(&self.file_id, self.chunk_no) {
            return;
        }
        let suppressed = lock(&self.sender).as_ref().is_some_and(ScheduledTask::cancel);
        if suppressed {
            info!(
                file_id = %self.file_id,
                chunk_no = self.chunk_no,
                by = %msg.sender_id(),
                "chunk already sent by another peer, reply suppressed"
            );
        }
        self.unsubscribe();
    }
}

impl Action for RetrieveChunkAction {
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
    use crate::protocol::{PeerId, PROTOCOL_VERSION};
    use crate::wire;
    use std::time::Duration;

    fn holder(dir: &std::path::Path, file_id: FileId, chunk_no: u32) -> (Arc<PeerCore>, Outbound) {
        let (core, out) = PeerCore::open(CoreConfig::new(PeerId(5), dir)).unwrap();
        core.store.write_chunk(&file_id, chunk_no, b"payload").unwrap();
        core.stored_chunks.record_chunk(file_id, chunk_no, 7, 1, core.peer_id());
        (core, out)
    }

    fn request(file_id: FileId) -> Header {
        Header::new(PROTOCOL_VERSION, PeerId(9), file_id)
    }

    fn competing_chunk(file_id: FileId, chunk_no: u32) -> Message {
        Message::Chunk {
            header: Header::new(PROTOCOL_VERSION, PeerId(6), file_id),
            chunk_no,
            body: b"payload".to_vec(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_exactly_once_without_competition() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 2);

        let action = RetrieveChunkAction::new(core.clone(), &request(id), 2);
        assert!(action.is_stored());
        action.run().await;
        assert_eq!(core.channels.restore.subscriber_count(), 1);

        tokio::time::sleep(Duration::from_millis(4001)).await;
        let bytes = out.restore.try_recv().unwrap();
        let msg = wire::parse(&bytes).unwrap();
        assert_eq!(
            msg,
            Message::Chunk {
                header: Header::new(PROTOCOL_VERSION, PeerId(5), id),
                chunk_no: 2,
                body: b"payload".to_vec(),
            }
        );
        assert!(out.restore.try_recv().is_err());
        assert_eq!(core.channels.restore.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn competing_reply_suppresses_send() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 2);

        RetrieveChunkAction::new(core.clone(), &request(id), 2).run().await;
        // another chunk of the same file is not a competitor
        assert_eq!(core.channels.restore.notify(&competing_chunk(id, 3)), 1);
        assert_eq!(core.channels.restore.notify(&competing_chunk(id, 2)), 1);
        assert_eq!(core.channels.restore.subscriber_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(out.restore.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_chunk_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 2);

        let action = RetrieveChunkAction::new(core.clone(), &request(id), 3);
        assert!(!action.is_stored());
        action.run().await;
        assert_eq!(core.channels.restore.subscriber_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(out.restore.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_chunk_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, _out) = PeerCore::open(CoreConfig::new(PeerId(5), dir.path())).unwrap();
        // recorded but the bytes are gone
        core.stored_chunks.record_chunk(id, 0, 7, 1, core.peer_id());

        let action = RetrieveChunkAction::new(core.clone(), &request(id), 0);
        assert!(!action.is_stored());
        action.run().await;
        assert_eq!(core.channels.restore.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_competitor_after_send_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let id = file_id_from_parts("f", 1);
        let (core, mut out) = holder(dir.path(), id, 0);

        RetrieveChunkAction::new(core.clone(), &request(id), 0).run().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(core.channels.restore.notify(&competing_chunk(id, 0)), 0);
        assert!(out.restore.try_recv().is_ok());
        assert!(out.restore.try_recv().is_err());
    }
}
