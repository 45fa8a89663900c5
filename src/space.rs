//! Per-space orchestration.
//!
//! A [`Space`] wires the stores, the merge engine and the sync actors
//! together for one replicated dataset. Construction is explicit — every
//! dependency is injected, lifecycle is `open`/`close`, and there is no
//! ambient global state. Multiple spaces run fully in parallel; they share
//! only the metadata store, whose mutations are serialized internally.
//!
//! Startup flows:
//!
//! - **Create**: mint a space id and a local write feed, record both in the
//!   catalog, then open.
//! - **Open from storage**: read the catalog record, load the recorded
//!   snapshot (if any) to skip replay, tail every feed from the snapshot
//!   cut.
//! - **Join**: open a record learned from a peer; the snapshot is fetched
//!   over object sync if it is not local yet.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand_core::CryptoRngCore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    auth::WriteAuthorizer,
    codec::{self, EntryPayload, Mutation},
    document::Document,
    error::{Error, Result},
    feeds::FeedStore,
    fetch::SnapshotManager,
    keys::{FeedId, FeedSecret, SpaceId},
    metadata::MetadataStore,
    net::{NetEvent, NetworkAdapter},
    pipeline::{Pipeline, PipelineEvent, Progress},
    proto::{self, Message},
    replicate::Replicator,
    snapshot::{Snapshot, SnapshotId, SnapshotStore},
    timeframe::Timeframe,
};

/// Tunables for one space.
#[derive(Debug, Clone)]
pub struct SpaceConfig {
    /// Take a snapshot after this many applied blocks. `0` disables the
    /// log-length trigger; [`Space::compact`] still works.
    pub compaction_threshold: u64,
    /// How often local heads are pushed to connected peers.
    pub announce_interval: Duration,
    /// How long a pending snapshot fetch waits before re-asking peers.
    pub fetch_retry: Duration,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            compaction_threshold: 1000,
            announce_interval: Duration::from_secs(3),
            fetch_retry: Duration::from_secs(1),
        }
    }
}

/// Dependencies injected into a space at construction.
pub struct SpaceOpts {
    /// Block storage, shared per device.
    pub feeds: FeedStore,
    /// The space/feed catalog, shared per device.
    pub metadata: Arc<MetadataStore>,
    /// Snapshot object storage.
    pub snapshots: SnapshotStore,
    /// Transport to the space's peers.
    pub net: Arc<dyn NetworkAdapter>,
    /// The merge algebra for document content.
    pub document: Box<dyn Document>,
    /// Decides which writers may append.
    pub auth: Arc<dyn WriteAuthorizer>,
    /// Tunables.
    pub config: SpaceConfig,
}

/// Events observable by space subscribers.
#[derive(Debug, Clone)]
pub enum SpaceEvent {
    /// A block was applied to the document.
    Applied {
        /// Feed of the applied block.
        feed: FeedId,
        /// Index of the applied block.
        index: u64,
    },
    /// A snapshot was created and recorded in the catalog.
    SnapshotCreated {
        /// Content address of the new snapshot.
        id: SnapshotId,
    },
    /// The space halted on a local storage error and needs operator
    /// intervention (e.g. reset).
    Halted {
        /// Why the space halted.
        reason: String,
    },
}

type Subscribers = Arc<Mutex<Vec<flume::Sender<SpaceEvent>>>>;

/// A replicated dataset: the convergent merge of its feeds.
#[derive(derive_more::Debug)]
pub struct Space {
    id: SpaceId,
    feeds: FeedStore,
    metadata: Arc<MetadataStore>,
    pipeline: Pipeline,
    replicator: Replicator,
    snapshots: SnapshotManager,
    #[debug("document")]
    document: Arc<Mutex<Box<dyn Document>>>,
    local_feed: Option<(FeedId, FeedSecret)>,
    cancel: CancellationToken,
    #[debug("tasks")]
    tasks: Mutex<Vec<JoinHandle<()>>>,
    #[debug("subscribers")]
    subscribers: Subscribers,
}

impl Space {
    /// Create a brand new space with a local write feed, record it in the
    /// catalog, and open it.
    pub async fn create<R: CryptoRngCore + ?Sized>(rng: &mut R, opts: SpaceOpts) -> Result<Space> {
        let space = SpaceId::generate(rng);
        let secret = FeedSecret::generate(rng);
        let feed = opts.feeds.create_feed(&secret)?;
        opts.metadata.add_space(space).await?;
        opts.metadata.set_local_feed(space, feed).await?;
        debug!(space = %space.fmt_short(), feed = %feed.fmt_short(), "space created");
        Self::open(space, Some(secret), opts).await
    }

    /// Open a space known to the catalog.
    ///
    /// `local_secret` is the write key of this device's feed; pass `None`
    /// for a read-only open. When the record carries no local feed yet and
    /// a secret is supplied, a write feed is created and recorded (the
    /// join flow).
    pub async fn open(
        space: SpaceId,
        local_secret: Option<FeedSecret>,
        opts: SpaceOpts,
    ) -> Result<Space> {
        let SpaceOpts {
            feeds,
            metadata,
            snapshots: snapshot_store,
            net,
            document,
            auth,
            config,
        } = opts;

        let record = metadata.space(&space).await?.ok_or(Error::NotFound)?;
        let cancel = CancellationToken::new();
        let document: Arc<Mutex<Box<dyn Document>>> = Arc::new(Mutex::new(document));
        let subscribers: Subscribers = Default::default();
        let mut tasks = Vec::new();

        // Object sync first: loading the startup snapshot may need a peer.
        let (snapshots, fetch_task) = SnapshotManager::spawn(
            space,
            snapshot_store,
            net.clone(),
            config.fetch_retry,
            cancel.clone(),
        );
        tasks.push(fetch_task);

        // The demux must run before the snapshot load so responses are
        // routed; replication messages are dropped until the replicator
        // exists (peers re-announce periodically, so nothing is lost).
        let (replicator_tx, replicator_rx) = watch::channel(None::<Replicator>);
        let demux = tokio::spawn(
            demux_loop(net.events(), snapshots.clone(), replicator_rx, cancel.clone())
                .instrument(error_span!("demux", space = %space.fmt_short())),
        );
        tasks.push(demux);

        // Resume from the recorded snapshot instead of replaying from
        // genesis.
        let mut start = Timeframe::new();
        if let Some(id) = record.snapshot {
            let snapshot = snapshots.load(id, &cancel).await?;
            if snapshot.space != space {
                return Err(Error::corrupt("snapshot belongs to a different space"));
            }
            document
                .lock()
                .restore(&snapshot.state)
                .map_err(|err| Error::corrupt(format!("snapshot restore failed: {err}")))?;
            start = snapshot.timeframe;
            debug!(snapshot = %id.fmt_short(), timeframe = %start, "resumed from snapshot");
        }

        let local_feed = match (record.local_feed, local_secret) {
            (Some(feed), Some(secret)) => {
                if secret.id() != feed {
                    return Err(Error::NotOwner { feed: Some(feed) });
                }
                Some((feed, secret))
            }
            (None, Some(secret)) => {
                let feed = feeds.create_feed(&secret)?;
                metadata.set_local_feed(space, feed).await?;
                Some((feed, secret))
            }
            (_, None) => None,
        };

        // The catalog is the source of truth for the feed set; make sure
        // the block store knows every feed before tailing starts.
        let record = metadata.space(&space).await?.ok_or(Error::NotFound)?;
        for feed in &record.feeds {
            feeds.add_feed(*feed)?;
        }

        let (events_tx, events_rx) = flume::unbounded();
        let (pipeline, pipeline_task) = Pipeline::spawn(
            space,
            feeds.clone(),
            document.clone(),
            start,
            config.compaction_threshold,
            events_tx,
            cancel.clone(),
        );
        tasks.push(pipeline_task);
        for feed in &record.feeds {
            pipeline.attach(*feed).await?;
        }

        let (replicator, replicate_task) = Replicator::spawn(
            space,
            feeds.clone(),
            pipeline.clone(),
            metadata.clone(),
            auth,
            net.clone(),
            config.announce_interval,
            cancel.clone(),
        );
        tasks.push(replicate_task);
        replicator_tx.send(Some(replicator.clone())).ok();

        let forward = tokio::spawn(
            forward_loop(
                space,
                events_rx,
                pipeline.clone(),
                snapshots.clone(),
                metadata.clone(),
                subscribers.clone(),
                cancel.clone(),
            )
            .instrument(error_span!("events", space = %space.fmt_short())),
        );
        tasks.push(forward);

        Ok(Space {
            id: space,
            feeds,
            metadata,
            pipeline,
            replicator,
            snapshots,
            document,
            local_feed,
            cancel,
            tasks: Mutex::new(tasks),
            subscribers,
        })
    }

    /// This space's id.
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// The feed this device writes to, if the space is writable.
    pub fn local_feed(&self) -> Option<FeedId> {
        self.local_feed.as_ref().map(|(feed, _)| *feed)
    }

    /// The write key of the local feed. Persist it (credential layer's
    /// concern) and pass it back to [`Space::open`] after a restart.
    pub fn local_secret(&self) -> Option<&FeedSecret> {
        self.local_feed.as_ref().map(|(_, secret)| secret)
    }

    /// The merged document. Lock it for reads; the pipeline holds the lock
    /// only while applying a single mutation.
    pub fn document(&self) -> &Arc<Mutex<Box<dyn Document>>> {
        &self.document
    }

    /// Append a mutation to the local write feed.
    ///
    /// Returns the new block's index. For read-your-writes, wait on
    /// `[(local_feed, index)]` via [`Space::wait_until`].
    pub async fn append(&self, mutation: Mutation) -> Result<u64> {
        self.append_entry(&EntryPayload::new(mutation)).await
    }

    /// Append a prepared entry payload to the local write feed.
    ///
    /// Transient metadata (the queue position) is stripped on encode; the
    /// caller's entry is not modified.
    pub async fn append_entry(&self, entry: &EntryPayload) -> Result<u64> {
        if let Some(reason) = self.pipeline.halt_reason() {
            return Err(Error::corrupt(reason));
        }
        let (feed, secret) = self
            .local_feed
            .as_ref()
            .ok_or(Error::NotOwner { feed: None })?;
        let bytes = codec::encode(entry)?;
        let index = self.feeds.append(*feed, secret, bytes.into())?;
        trace!(feed = %feed.fmt_short(), index, "appended");
        self.replicator.announce().await.ok();
        Ok(index)
    }

    /// Suspend until the applied timeframe covers `target`.
    pub async fn wait_until(&self, target: &Timeframe, cancel: &CancellationToken) -> Result<()> {
        self.pipeline.wait_until(target, cancel).await
    }

    /// The fully applied timeframe.
    pub fn timeframe(&self) -> Timeframe {
        self.pipeline.current_timeframe()
    }

    /// The highest known timeframe, including blocks not yet downloaded.
    pub fn target_timeframe(&self) -> Timeframe {
        self.pipeline.target_timeframe()
    }

    /// Applied vs. known block totals.
    pub fn progress(&self) -> Progress {
        self.pipeline.progress()
    }

    /// Why the space halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.pipeline.halt_reason()
    }

    /// Subscribe to space events.
    pub fn subscribe(&self) -> flume::Receiver<SpaceEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Take a snapshot of the current cut now, regardless of the log-length
    /// trigger. This is the hook for externally signaled boundaries
    /// (e.g. a credential epoch).
    pub async fn compact(&self) -> Result<SnapshotId> {
        let id = compact_inner(self.id, &self.pipeline, &self.snapshots, &self.metadata).await?;
        emit(&self.subscribers, SpaceEvent::SnapshotCreated { id });
        Ok(id)
    }

    /// Stop all tasks of this space. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.await.ok();
        }
        debug!(space = %self.id.fmt_short(), "space closed");
    }

    /// Irreversibly delete this space: its feeds' blocks and its catalog
    /// record. Snapshots are left for [`SnapshotStore::gc`].
    pub async fn destroy(self) -> Result<()> {
        self.close().await;
        if let Some(record) = self.metadata.space(&self.id).await? {
            for feed in &record.feeds {
                self.feeds.destroy(feed)?;
            }
        }
        self.metadata.remove_space(&self.id).await?;
        Ok(())
    }
}

async fn demux_loop(
    events: flume::Receiver<NetEvent>,
    snapshots: SnapshotManager,
    replicator: watch::Receiver<Option<Replicator>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        // Clone out of the watch before awaiting; the borrow guard must not
        // be held across a suspension point.
        let replicator_now = replicator.borrow().clone();
        match event {
            NetEvent::PeerConnected(peer) => {
                snapshots.peer_connected(peer).await.ok();
                if let Some(replicator) = replicator_now {
                    replicator.peer_connected(peer).await.ok();
                }
            }
            NetEvent::PeerDisconnected(peer) => {
                if let Some(replicator) = replicator_now {
                    replicator.peer_disconnected(peer).await.ok();
                }
            }
            NetEvent::Message { from, frame } => match proto::decode_message(&frame) {
                Err(err) => {
                    warn!(from = %from.fmt_short(), %err, "malformed frame, dropping");
                }
                Ok(
                    message @ (Message::SnapshotRequest { .. }
                    | Message::SnapshotResponse { .. }
                    | Message::SnapshotMissing { .. }),
                ) => {
                    snapshots.handle_message(from, message).await.ok();
                }
                Ok(message) => match replicator_now {
                    Some(replicator) => {
                        replicator.handle_message(from, message).await.ok();
                    }
                    // Startup window before the replicator exists; peers
                    // re-announce, so dropping is safe.
                    None => trace!("replicator not ready, dropping frame"),
                },
            },
        }
    }
}

async fn forward_loop(
    space: SpaceId,
    events: flume::Receiver<PipelineEvent>,
    pipeline: Pipeline,
    snapshots: SnapshotManager,
    metadata: Arc<MetadataStore>,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        match event {
            PipelineEvent::Applied { feed, index } => {
                emit(&subscribers, SpaceEvent::Applied { feed, index });
            }
            PipelineEvent::Halted { reason } => {
                emit(&subscribers, SpaceEvent::Halted { reason });
            }
            PipelineEvent::CompactionWanted => {
                match compact_inner(space, &pipeline, &snapshots, &metadata).await {
                    Ok(id) => emit(&subscribers, SpaceEvent::SnapshotCreated { id }),
                    Err(err) => warn!(%err, "compaction failed"),
                }
            }
        }
    }
}

async fn compact_inner(
    space: SpaceId,
    pipeline: &Pipeline,
    snapshots: &SnapshotManager,
    metadata: &MetadataStore,
) -> Result<SnapshotId> {
    let (timeframe, state) = pipeline.checkpoint().await?;
    let snapshot = Snapshot {
        space,
        timeframe,
        state,
    };
    let id = snapshots.store_snapshot(&snapshot)?;
    metadata.set_snapshot(space, id).await?;
    debug!(id = %id.fmt_short(), timeframe = %snapshot.timeframe, "snapshot created");
    Ok(id)
}

fn emit(subscribers: &Subscribers, event: SpaceEvent) {
    subscribers
        .lock()
        .retain(|tx| tx.send(event.clone()).is_ok());
}
