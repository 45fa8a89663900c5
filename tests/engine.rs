//! End-to-end tests of the replication pipeline: convergence between
//! peers, durability across restarts, snapshot resume, object sync and
//! cancellation behavior.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use strand::net::memory::{MemoryAdapter, MemoryNetwork};
use strand::{
    proto, AllowAll, FeedId, FeedSecret, FeedStore, LwwMap, MetadataStore, Mutation, NetEvent,
    NetworkAdapter, ObjectId, PeerId, Snapshot, SnapshotId, SnapshotManager, SnapshotStore, Space,
    SpaceConfig, SpaceEvent, SpaceId, SpaceOpts, Timeframe, Value, WriteAuthorizer,
};

const WAIT: Duration = Duration::from_secs(10);

/// Honor `RUST_LOG` when debugging a failing test.
fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> SpaceConfig {
    SpaceConfig {
        compaction_threshold: 0,
        announce_interval: Duration::from_millis(100),
        fetch_retry: Duration::from_millis(100),
    }
}

struct Device {
    feeds: FeedStore,
    metadata: Arc<MetadataStore>,
    snapshots: SnapshotStore,
    adapter: MemoryAdapter,
    _dir: tempfile::TempDir,
}

impl Device {
    fn new(hub: &MemoryNetwork, seed: u8) -> Result<Device> {
        let dir = tempfile::tempdir()?;
        Ok(Device {
            feeds: FeedStore::memory()?,
            metadata: Arc::new(MetadataStore::new(dir.path().join("catalog"))),
            snapshots: SnapshotStore::memory()?,
            adapter: hub.join(PeerId::from(&[seed; 32])),
            _dir: dir,
        })
    }

    fn opts(&self) -> SpaceOpts {
        self.opts_with_auth(Arc::new(AllowAll))
    }

    fn opts_with_auth(&self, auth: Arc<dyn WriteAuthorizer>) -> SpaceOpts {
        SpaceOpts {
            feeds: self.feeds.clone(),
            metadata: self.metadata.clone(),
            snapshots: self.snapshots.clone(),
            net: Arc::new(self.adapter.clone()),
            document: Box::new(LwwMap::new()),
            auth,
            config: test_config(),
        }
    }
}

fn set(object: &str, field: &str, value: i64) -> Mutation {
    Mutation::Assign {
        object: object.into(),
        field: field.to_owned(),
        value: Value::Int(value),
    }
}

fn doc_state(space: &Space) -> bytes::Bytes {
    space.document().lock().encode_state().unwrap()
}

fn frame(frames: &[(FeedId, u64)]) -> Timeframe {
    frames.iter().copied().collect()
}

#[tokio::test]
async fn two_peers_converge() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev_a = Device::new(&hub, 1)?;
    let dev_b = Device::new(&hub, 2)?;

    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(1);
    let a = Space::create(&mut rng, dev_a.opts()).await?;
    let space = a.id();

    dev_b.metadata.add_space(space).await?;
    let b = Space::open(space, Some(FeedSecret::from_bytes(&[42; 32])), dev_b.opts()).await?;

    // Feed F1 gets [A, B, C]; feed F2 gets [X, Y].
    for (i, obj) in ["a0", "a1", "a2"].iter().enumerate() {
        a.append(set(obj, "v", i as i64)).await?;
    }
    for (i, obj) in ["b0", "b1"].iter().enumerate() {
        b.append(set(obj, "v", 100 + i as i64)).await?;
    }

    let fa = a.local_feed().unwrap();
    let fb = b.local_feed().unwrap();
    let target = frame(&[(fa, 2), (fb, 1)]);
    let cancel = CancellationToken::new();
    timeout(WAIT, a.wait_until(&target, &cancel)).await??;
    timeout(WAIT, b.wait_until(&target, &cancel)).await??;

    // Same block set, any interleaving: equal merged state.
    assert_eq!(a.timeframe(), target);
    assert_eq!(b.timeframe(), target);
    assert_eq!(doc_state(&a), doc_state(&b));

    let progress = a.progress();
    assert_eq!((progress.applied, progress.known), (5, 5));
    assert_eq!(progress.ratio(), 1.0);

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn read_your_writes() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev = Device::new(&hub, 1)?;
    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(2);
    let space = Space::create(&mut rng, dev.opts()).await?;

    let index = space.append(set("note", "title", 1)).await?;
    let feed = space.local_feed().unwrap();
    let cancel = CancellationToken::new();
    timeout(WAIT, space.wait_until(&frame(&[(feed, index)]), &cancel)).await??;

    let doc = doc_state(&space);
    let mut check = LwwMap::new();
    strand::Document::restore(&mut check, &doc).unwrap();
    assert_eq!(check.get(&ObjectId::new("note"), "title"), Some(&Value::Int(1)));

    space.close().await;
    Ok(())
}

#[tokio::test]
async fn append_durability_across_restart() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("feeds.redb");
    let secret = FeedSecret::from_bytes(&[7; 32]);

    let index = {
        let store = FeedStore::persistent(&path)?;
        let feed = store.create_feed(&secret)?;
        store.append(feed, &secret, bytes::Bytes::from_static(b"durable"))?
    };
    assert_eq!(index, 0);

    let store = FeedStore::persistent(&path)?;
    let feed = secret.id();
    assert_eq!(store.len(&feed)?, 1);
    let mut reader = store.read_from(feed, 0, CancellationToken::new())?;
    let block = reader.next().await?;
    assert_eq!(block.index(), 0);
    assert_eq!(block.payload().as_ref(), b"durable");
    block.verify()?;
    Ok(())
}

#[tokio::test]
async fn snapshot_resume_equals_replay() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev = Device::new(&hub, 1)?;
    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(3);

    let space = Space::create(&mut rng, dev.opts()).await?;
    let id = space.id();
    let secret = space.local_secret().cloned().unwrap();
    let feed = space.local_feed().unwrap();
    let cancel = CancellationToken::new();

    for i in 0..5i64 {
        space.append(set(&format!("o{i}"), "v", i)).await?;
    }
    timeout(WAIT, space.wait_until(&frame(&[(feed, 4)]), &cancel)).await??;
    let before_close = space.timeframe();
    space.compact().await?;
    space.close().await;

    // Reopen: resumes from the snapshot, then appends one more.
    let space = Space::open(id, Some(secret), dev.opts()).await?;
    assert!(space.timeframe().covers(&before_close), "monotonic across restart");
    space.append(set("o5", "v", 5)).await?;
    timeout(WAIT, space.wait_until(&frame(&[(feed, 5)]), &cancel)).await??;
    let resumed = doc_state(&space);

    // A replica that replays from genesis (no snapshot recorded) must
    // arrive at the same state.
    let dir = tempfile::tempdir()?;
    let fresh_metadata = Arc::new(MetadataStore::new(dir.path().join("catalog")));
    fresh_metadata.add_space(id).await?;
    fresh_metadata.add_feed(id, feed).await?;
    let replayed = Space::open(
        id,
        None,
        SpaceOpts {
            feeds: dev.feeds.clone(),
            metadata: fresh_metadata,
            snapshots: SnapshotStore::memory()?,
            net: Arc::new(dev.adapter.clone()),
            document: Box::new(LwwMap::new()),
            auth: Arc::new(AllowAll),
            config: test_config(),
        },
    )
    .await?;
    timeout(WAIT, replayed.wait_until(&frame(&[(feed, 5)]), &cancel)).await??;
    assert_eq!(doc_state(&replayed), resumed);

    space.close().await;
    replayed.close().await;
    Ok(())
}

#[tokio::test]
async fn compaction_threshold_creates_snapshot() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev = Device::new(&hub, 1)?;
    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(4);

    let mut opts = dev.opts();
    opts.config.compaction_threshold = 3;
    let space = Space::create(&mut rng, opts).await?;
    let events = space.subscribe();

    for i in 0..3i64 {
        space.append(set("o", &format!("f{i}"), i)).await?;
    }

    let id = timeout(WAIT, async {
        loop {
            if let Ok(SpaceEvent::SnapshotCreated { id }) = events.recv_async().await {
                return id;
            }
        }
    })
    .await?;
    assert!(dev.snapshots.contains(&id)?);
    let record = dev.metadata.space(&space.id()).await?.unwrap();
    assert_eq!(record.snapshot, Some(id));

    space.close().await;
    Ok(())
}

#[tokio::test]
async fn snapshot_object_sync_on_join() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev_a = Device::new(&hub, 1)?;
    let dev_b = Device::new(&hub, 2)?;
    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(5);

    let a = Space::create(&mut rng, dev_a.opts()).await?;
    let space = a.id();
    let fa = a.local_feed().unwrap();
    let cancel = CancellationToken::new();

    for i in 0..4i64 {
        a.append(set(&format!("o{i}"), "v", i)).await?;
    }
    timeout(WAIT, a.wait_until(&frame(&[(fa, 3)]), &cancel)).await??;
    let snapshot_id = a.compact().await?;

    // B has never seen the space; it knows only the record a peer handed
    // it. The snapshot is fetched from A over object sync, then tailing
    // resumes after the cut.
    dev_b.metadata.add_space(space).await?;
    dev_b.metadata.add_feed(space, fa).await?;
    dev_b.metadata.set_snapshot(space, snapshot_id).await?;
    let b = Space::open(space, None, dev_b.opts()).await?;

    assert!(dev_b.snapshots.contains(&snapshot_id)?);
    timeout(WAIT, b.wait_until(&frame(&[(fa, 3)]), &cancel)).await??;
    assert_eq!(doc_state(&b), doc_state(&a));

    // New writes keep flowing after the snapshot-based join.
    a.append(set("after", "v", 99)).await?;
    timeout(WAIT, b.wait_until(&frame(&[(fa, 4)]), &cancel)).await??;
    assert_eq!(doc_state(&b), doc_state(&a));

    a.close().await;
    b.close().await;
    Ok(())
}

/// Pump transport events into a bare snapshot manager, the way a space's
/// demux task would.
fn pump(adapter: MemoryAdapter, manager: SnapshotManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let events = adapter.events();
        while let Ok(event) = events.recv_async().await {
            match event {
                NetEvent::PeerConnected(peer) => {
                    manager.peer_connected(peer).await.ok();
                }
                NetEvent::Message { from, frame } => {
                    if let Ok(message) = proto::decode_message(&frame) {
                        manager.handle_message(from, message).await.ok();
                    }
                }
                NetEvent::PeerDisconnected(_) => {}
            }
        }
    })
}

#[tokio::test]
async fn snapshot_fetch_cancellation_and_late_peer() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let space = SpaceId::from(&[9u8; 32]);

    let adapter_b = hub.join(PeerId::from(&[2; 32]));
    let store_b = SnapshotStore::memory()?;
    let (manager_b, _task_b) = SnapshotManager::spawn(
        space,
        store_b.clone(),
        Arc::new(adapter_b.clone()),
        Duration::from_millis(100),
        CancellationToken::new(),
    );
    let _pump_b = pump(adapter_b, manager_b.clone());

    let snapshot = Snapshot {
        space,
        timeframe: Timeframe::new(),
        state: bytes::Bytes::from_static(b"merged"),
    };
    let id = snapshot.id()?;

    // No peer has it: the load suspends, and cancelling leaves nothing
    // behind.
    let cancel = CancellationToken::new();
    let pending = {
        let manager = manager_b.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.load(id, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    let err = pending.await?.unwrap_err();
    assert!(matches!(err, strand::Error::Cancelled));
    assert!(!store_b.contains(&id)?);

    // A peer that has the object joins; a fresh load now succeeds and the
    // object is persisted locally so the miss never recurs.
    let adapter_a = hub.join(PeerId::from(&[1; 32]));
    let (manager_a, _task_a) = SnapshotManager::spawn(
        space,
        SnapshotStore::memory()?,
        Arc::new(adapter_a.clone()),
        Duration::from_millis(100),
        CancellationToken::new(),
    );
    manager_a.store_snapshot(&snapshot)?;
    let _pump_a = pump(adapter_a, manager_a);

    let loaded = timeout(WAIT, manager_b.load(id, &CancellationToken::new())).await??;
    assert_eq!(loaded, snapshot);
    assert!(store_b.contains(&id)?);
    Ok(())
}

struct DenyFeed(FeedId);

impl WriteAuthorizer for DenyFeed {
    fn allow_append(&self, _space: &SpaceId, feed: &FeedId, _index: u64) -> bool {
        *feed != self.0
    }
}

#[tokio::test]
async fn unauthorized_feed_is_not_admitted() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev_a = Device::new(&hub, 1)?;
    let dev_b = Device::new(&hub, 2)?;
    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(6);

    let secret_b = FeedSecret::from_bytes(&[42; 32]);
    let a = Space::create(&mut rng, dev_a.opts_with_auth(Arc::new(DenyFeed(secret_b.id())))).await?;
    let space = a.id();

    dev_b.metadata.add_space(space).await?;
    let b = Space::open(space, Some(secret_b.clone()), dev_b.opts()).await?;
    b.append(set("intruder", "v", 1)).await?;

    // Give replication a few announce rounds.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // A never persisted the denied feed or its blocks.
    assert!(!dev_a.feeds.contains(&secret_b.id())?);
    let record = dev_a.metadata.space(&space).await?.unwrap();
    assert!(!record.feeds.contains(&secret_b.id()));
    assert_eq!(a.timeframe().get(&secret_b.id()), None);

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn destroy_resets_space_state() -> Result<()> {
    setup_logging();
    let hub = MemoryNetwork::new();
    let dev = Device::new(&hub, 1)?;
    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(7);

    let space = Space::create(&mut rng, dev.opts()).await?;
    let id = space.id();
    let feed = space.local_feed().unwrap();
    space.append(set("o", "v", 1)).await?;
    space.destroy().await?;

    assert!(dev.metadata.space(&id).await?.is_none());
    assert!(matches!(dev.feeds.len(&feed), Err(strand::Error::NotFound)));
    Ok(())
}
