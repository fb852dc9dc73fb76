//! Several peers in one process, joined by an in-memory bus that delivers every
//! datagram to every peer (the sender included, as multicast loopback does).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dbs_core::action::{PurgeAction, ReclaimAction};
use dbs_core::{
    CoreConfig, Dispatcher, Message, Outbound, PeerCore, PeerId, TriggerBackupAction,
    TriggerDeleteAction, TriggerRestoreAction,
};
use tokio::sync::mpsc;

fn join(dir: &Path, ids: &[u32]) -> Vec<Arc<PeerCore>> {
    let mut cores = Vec::new();
    let mut queues = Vec::new();
    for &id in ids {
        let (core, out) = PeerCore::open(CoreConfig::new(PeerId(id), dir)).unwrap();
        cores.push(core);
        queues.push(out);
    }
    let dispatchers: Arc<Vec<Dispatcher>> =
        Arc::new(cores.iter().cloned().map(Dispatcher::new).collect());
    for Outbound {
        control,
        backup,
        restore,
    } in queues
    {
        for rx in [control, backup, restore] {
            tokio::spawn(pump(rx, dispatchers.clone()));
        }
    }
    cores
}

async fn pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, peers: Arc<Vec<Dispatcher>>) {
    while let Some(bytes) = rx.recv().await {
        for peer in peers.iter() {
            peer.handle_datagram(&bytes);
        }
    }
}

fn sample_file(dir: &Path, len: usize) -> std::path::PathBuf {
    let path = dir.join("payload.bin");
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn backup_reaches_degree_in_one_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let peers = join(dir.path(), &[1, 2, 3]);
    let path = sample_file(dir.path(), 150_000);

    let action = TriggerBackupAction::new(peers[0].clone(), &path, 2).unwrap();
    assert_eq!(action.chunk_count(), 3);
    let start = tokio::time::Instant::now();
    let outcome = action.execute().await;

    assert_eq!(outcome.chunks_rd, vec![2, 2, 2]);
    assert_eq!(outcome.cycles, 0);
    assert!(outcome.converged);
    assert_eq!(start.elapsed(), Duration::from_secs(1));

    let id = outcome.file_id;
    let sizes = [64_000, 64_000, 22_000];
    for peer in &peers[1..] {
        for (n, size) in sizes.iter().enumerate() {
            let n = n as u32;
            assert_eq!(peer.store.read_chunk(&id, n).unwrap().len(), *size);
            let record = peer.stored_chunks.get(&id, n).unwrap();
            assert_eq!(record.desired_degree, 2);
            assert_eq!(record.perceived_degree(), 2);
        }
    }
    assert!(!peers[0].store.has_chunk(&id, 0));
    assert!(peers[0].backed_up.is_backed_up(&id));
    assert_eq!(peers[0].channels.control.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_returns_original_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let peers = join(dir.path(), &[1, 2, 3]);
    let path = sample_file(dir.path(), 150_000);
    let outcome = TriggerBackupAction::new(peers[0].clone(), &path, 2)
        .unwrap()
        .execute()
        .await;
    assert!(outcome.converged);

    let restored = TriggerRestoreAction::new(peers[0].clone(), &path)
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&path).unwrap());

    // let any suppressed retrievals run out
    tokio::time::sleep(Duration::from_secs(5)).await;
    for peer in &peers {
        assert_eq!(peer.channels.restore.subscriber_count(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn delete_purges_every_holder() {
    let dir = tempfile::tempdir().unwrap();
    let peers = join(dir.path(), &[1, 2, 3]);
    let path = sample_file(dir.path(), 70_000);
    let id = TriggerBackupAction::new(peers[0].clone(), &path, 2)
        .unwrap()
        .execute()
        .await
        .file_id;

    let action = TriggerDeleteAction::new(peers[0].clone(), &path).unwrap();
    dbs_core::Action::run(action).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(peers[0].backed_up.was_deleted(&id));
    for peer in &peers[1..] {
        assert!(!peer.store.has_chunk(&id, 0));
        assert!(!peer.stored_chunks.has_chunk(&id, 1));
    }
}

#[tokio::test(start_paused = true)]
async fn checkdelete_catches_up_a_stale_holder() {
    let dir = tempfile::tempdir().unwrap();
    let peers = join(dir.path(), &[1, 2]);
    let path = sample_file(dir.path(), 1_000);
    let id = TriggerBackupAction::new(peers[0].clone(), &path, 1)
        .unwrap()
        .execute()
        .await
        .file_id;
    assert!(peers[1].store.has_chunk(&id, 0));

    // peer 2 misses the DELETE
    peers[0].backed_up.remove_file(&id);
    assert!(peers[1].store.has_chunk(&id, 0));

    let check = Message::CheckDelete {
        header: peers[1].header(id),
    };
    assert!(peers[1].channels.control.send_message(&check));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!peers[1].store.has_chunk(&id, 0));
    assert!(peers[1].stored_chunks.files().is_empty());

    // a second purge is harmless
    dbs_core::Action::run(PurgeAction::new(peers[1].clone(), id)).await;
}

#[tokio::test(start_paused = true)]
async fn reclaim_makes_a_remaining_holder_re_replicate() {
    let dir = tempfile::tempdir().unwrap();
    let peers = join(dir.path(), &[1, 2, 3, 4]);
    // peer 4 has no room during the backup
    peers[3].set_storage_limit(Some(10));
    let path = sample_file(dir.path(), 1_000);
    let outcome = TriggerBackupAction::new(peers[0].clone(), &path, 2)
        .unwrap()
        .execute()
        .await;
    assert_eq!(outcome.chunks_rd, vec![2]);
    let id = outcome.file_id;
    assert!(!peers[3].store.has_chunk(&id, 0));

    peers[3].set_storage_limit(None);
    let evicted = ReclaimAction::new(peers[1].clone(), 0).reclaim();
    assert_eq!(evicted, vec![(id, 0)]);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(!peers[1].store.has_chunk(&id, 0));
    assert!(!peers[1].stored_chunks.has_chunk(&id, 0));
    assert!(peers[3].store.has_chunk(&id, 0));
    let record = peers[2].stored_chunks.get(&id, 0).unwrap();
    assert_eq!(record.holders, BTreeSet::from([PeerId(3), PeerId(4)]));
    assert_eq!(record.perceived_degree(), 2);
}

#[tokio::test(start_paused = true)]
async fn reclaim_of_surplus_copy_needs_no_replication() {
    let dir = tempfile::tempdir().unwrap();
    let peers = join(dir.path(), &[1, 2, 3]);
    let path = sample_file(dir.path(), 1_000);
    let id = TriggerBackupAction::new(peers[0].clone(), &path, 1)
        .unwrap()
        .execute()
        .await
        .file_id;
    assert_eq!(peers[2].stored_chunks.get(&id, 0).unwrap().perceived_degree(), 2);

    ReclaimAction::new(peers[1].clone(), 0).reclaim();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let record = peers[2].stored_chunks.get(&id, 0).unwrap();
    assert_eq!(record.holders, BTreeSet::from([PeerId(3)]));
    assert_eq!(peers[2].channels.backup.subscriber_count(), 0);
    assert!(!peers[1].store.has_chunk(&id, 0));
}
