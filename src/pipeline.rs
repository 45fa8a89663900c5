//! The merge engine.
//!
//! A pipeline reads ordered blocks across all feeds of a space, decodes and
//! applies them to the merged document, and maintains the current vs.
//! target replication timeframe. One tailer task per attached feed pushes
//! blocks into a single FIFO consumed by the pipeline actor, which
//! preserves strict index order within each feed while leaving cross-feed
//! interleaving arbitrary — exactly the ordering contract the document
//! capability requires.
//!
//! Failure policy: garbage received from a peer (undecodable entry,
//! rejected mutation) is logged and skipped — one bad writer must not stall
//! the space. Damage to locally stored data (signature mismatch, missing
//! block below the persisted length) halts the space, because continuing
//! would risk silent divergence.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    block::SignedBlock,
    codec,
    document::{ApplyOrigin, Document},
    error::{Error, Result},
    feeds::FeedStore,
    keys::{FeedId, SpaceId},
    timeframe::Timeframe,
};

/// Replication progress of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Blocks applied to the document.
    pub applied: u64,
    /// Blocks known to exist across all feeds, including ones not yet
    /// downloaded.
    pub known: u64,
}

impl Progress {
    /// Applied fraction in `0.0..=1.0`. An empty space counts as complete.
    pub fn ratio(&self) -> f64 {
        if self.known == 0 {
            1.0
        } else {
            self.applied as f64 / self.known as f64
        }
    }
}

/// Events emitted by the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A block was processed and the current timeframe advanced past it.
    Applied {
        /// Feed of the processed block.
        feed: FeedId,
        /// Index of the processed block.
        index: u64,
    },
    /// The log-length compaction threshold was crossed; a snapshot should
    /// be taken.
    CompactionWanted,
    /// The space halted on a local storage error.
    Halted {
        /// Why the space halted.
        reason: String,
    },
}

#[derive(derive_more::Debug, strum::Display)]
enum ToPipeline {
    Attach {
        feed: FeedId,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    NoteHead {
        feed: FeedId,
        index: u64,
    },
    Checkpoint {
        #[debug("reply")]
        reply: oneshot::Sender<Result<(Timeframe, Bytes)>>,
    },
}

enum TailerEvent {
    Block(SignedBlock),
    Failed { feed: FeedId, error: Error },
}

/// Handle to a running merge engine.
#[derive(Debug, Clone)]
pub struct Pipeline {
    inbox: mpsc::Sender<ToPipeline>,
    current: watch::Receiver<Timeframe>,
    target: watch::Receiver<Timeframe>,
    halted: watch::Receiver<Option<String>>,
}

impl Pipeline {
    /// Spawn the merge engine for one space.
    ///
    /// `start` is the timeframe already represented by the document (from a
    /// snapshot, or empty); attached feeds are tailed from
    /// `start[feed] + 1`. When `compaction_threshold` is non-zero, a
    /// [`PipelineEvent::CompactionWanted`] fires every time that many
    /// blocks have been applied since the last signal.
    pub fn spawn(
        space: SpaceId,
        feeds: FeedStore,
        document: Arc<Mutex<Box<dyn Document>>>,
        start: Timeframe,
        compaction_threshold: u64,
        events: flume::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (blocks_tx, blocks_rx) = mpsc::channel(64);
        let (current_tx, current_rx) = watch::channel(start.clone());
        let (target_tx, target_rx) = watch::channel(start);
        let (halted_tx, halted_rx) = watch::channel(None);

        let actor = PipelineActor {
            feeds,
            document,
            inbox: inbox_rx,
            blocks_tx,
            blocks_rx,
            current: current_tx,
            target: target_tx,
            halted: halted_tx,
            tailers: JoinSet::new(),
            attached: HashSet::new(),
            cancel,
            applied_since_checkpoint: 0,
            compaction_threshold,
            events,
        };
        let span = error_span!("pipeline", space = %space.fmt_short());
        let handle = tokio::spawn(actor.run().instrument(span));
        (
            Pipeline {
                inbox: inbox_tx,
                current: current_rx,
                target: target_rx,
                halted: halted_rx,
            },
            handle,
        )
    }

    /// Attach a feed; it is tailed from `current[feed] + 1` (or 0 if
    /// unseen). Idempotent.
    pub async fn attach(&self, feed: FeedId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(ToPipeline::Attach { feed, reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Advance the target timeframe from a peer's advertised head, before
    /// the blocks are downloaded. Enables progress reporting during
    /// partial replication.
    pub async fn note_head(&self, feed: FeedId, index: u64) -> Result<()> {
        self.inbox
            .send(ToPipeline::NoteHead { feed, index })
            .await
            .map_err(|_| Error::Closed)
    }

    /// The fully applied timeframe. Only ever advances.
    pub fn current_timeframe(&self) -> Timeframe {
        self.current.borrow().clone()
    }

    /// The highest known timeframe across all feeds, applied or not.
    pub fn target_timeframe(&self) -> Timeframe {
        self.target.borrow().clone()
    }

    /// Applied vs. known block totals.
    pub fn progress(&self) -> Progress {
        Progress {
            applied: self.current.borrow().total(),
            known: self.target.borrow().total(),
        }
    }

    /// Why the space halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.halted.borrow().clone()
    }

    /// Suspend until the current timeframe covers `target`.
    ///
    /// This is how callers express read-your-writes ("wait for my append")
    /// or "wait for a specific peer's contribution". Fails with
    /// [`Error::Cancelled`] on token fire and with the halt reason if the
    /// space halts while waiting.
    pub async fn wait_until(&self, target: &Timeframe, cancel: &CancellationToken) -> Result<()> {
        let mut current = self.current.clone();
        let mut halted = self.halted.clone();
        loop {
            if let Some(reason) = halted.borrow().clone() {
                return Err(Error::corrupt(reason));
            }
            if current.borrow().covers(target) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = current.changed() => res.map_err(|_| Error::Closed)?,
                res = halted.changed() => res.map_err(|_| Error::Closed)?,
            }
        }
    }

    /// Take a consistent cut: the current timeframe plus the encoded
    /// document state at exactly that point.
    pub async fn checkpoint(&self) -> Result<(Timeframe, Bytes)> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(ToPipeline::Checkpoint { reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

struct PipelineActor {
    feeds: FeedStore,
    document: Arc<Mutex<Box<dyn Document>>>,
    inbox: mpsc::Receiver<ToPipeline>,
    blocks_tx: mpsc::Sender<TailerEvent>,
    blocks_rx: mpsc::Receiver<TailerEvent>,
    current: watch::Sender<Timeframe>,
    target: watch::Sender<Timeframe>,
    halted: watch::Sender<Option<String>>,
    tailers: JoinSet<()>,
    attached: HashSet<FeedId>,
    cancel: CancellationToken,
    applied_since_checkpoint: u64,
    compaction_threshold: u64,
    events: flume::Sender<PipelineEvent>,
}

impl PipelineActor {
    async fn run(mut self) {
        debug!("pipeline started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                Some(event) = self.blocks_rx.recv() => match event {
                    TailerEvent::Block(block) => self.process(block),
                    TailerEvent::Failed { feed, error } => {
                        self.halt(format!("feed {} tailer failed: {error}", feed.fmt_short()));
                    }
                },
            }
        }
        self.tailers.shutdown().await;
        debug!("pipeline stopped");
    }

    fn handle(&mut self, msg: ToPipeline) {
        trace!(%msg, "inbox");
        match msg {
            ToPipeline::Attach { feed, reply } => {
                reply.send(self.attach(feed)).ok();
            }
            ToPipeline::NoteHead { feed, index } => {
                self.target.send_modify(|t| t.advance(feed, index));
            }
            ToPipeline::Checkpoint { reply } => {
                reply.send(self.checkpoint()).ok();
            }
        }
    }

    fn attach(&mut self, feed: FeedId) -> Result<()> {
        if self.attached.contains(&feed) {
            return Ok(());
        }
        let start = self.current.borrow().next_index(&feed);
        let mut reader = self.feeds.read_from(feed, start, self.cancel.child_token())?;
        let len = self.feeds.len(&feed)?;
        if len > 0 {
            self.target.send_modify(|t| t.advance(feed, len - 1));
        }
        let tx = self.blocks_tx.clone();
        self.tailers.spawn(async move {
            loop {
                match reader.next().await {
                    Ok(block) => {
                        if tx.send(TailerEvent::Block(block)).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::Cancelled) | Err(Error::Closed) => break,
                    Err(error) => {
                        tx.send(TailerEvent::Failed { feed, error }).await.ok();
                        break;
                    }
                }
            }
        });
        self.attached.insert(feed);
        debug!(feed = %feed.fmt_short(), start, "feed attached");
        Ok(())
    }

    fn process(&mut self, block: SignedBlock) {
        if self.halted.borrow().is_some() {
            return;
        }
        let feed = *block.feed();
        let index = block.index();

        // Blocks were verified on insert; failing again here means the
        // local store returned different bytes than were written.
        if block.verify().is_err() {
            self.halt(format!(
                "stored block {}/{index} failed signature verification",
                feed.fmt_short()
            ));
            return;
        }
        let expected = self.current.borrow().next_index(&feed);
        if index != expected {
            self.halt(format!(
                "feed {} out of order: got {index}, expected {expected}",
                feed.fmt_short()
            ));
            return;
        }

        match codec::decode(block.payload(), None) {
            Ok(entry) => {
                let origin = ApplyOrigin {
                    timestamp_us: entry.timestamp_us,
                    feed,
                    index,
                };
                let applied = self.document.lock().apply(&entry.mutation, &origin);
                if let Err(err) = applied {
                    warn!(feed = %feed.fmt_short(), index, %err, "mutation rejected, skipping");
                }
            }
            // A malformed entry from one writer is skipped; the feed
            // position still advances so the space keeps making progress.
            Err(err) => {
                warn!(feed = %feed.fmt_short(), index, %err, "undecodable entry, skipping");
            }
        }

        self.current.send_modify(|t| t.advance(feed, index));
        self.target.send_modify(|t| t.advance(feed, index));
        self.events.send(PipelineEvent::Applied { feed, index }).ok();

        self.applied_since_checkpoint += 1;
        if self.compaction_threshold > 0
            && self.applied_since_checkpoint >= self.compaction_threshold
        {
            self.applied_since_checkpoint = 0;
            self.events.send(PipelineEvent::CompactionWanted).ok();
        }
    }

    fn checkpoint(&mut self) -> Result<(Timeframe, Bytes)> {
        if let Some(reason) = self.halted.borrow().clone() {
            return Err(Error::corrupt(reason));
        }
        let state = self
            .document
            .lock()
            .encode_state()
            .map_err(|err| Error::corrupt(format!("document state encoding failed: {err}")))?;
        self.applied_since_checkpoint = 0;
        Ok((self.current.borrow().clone(), state))
    }

    fn halt(&mut self, reason: String) {
        warn!(reason = %reason, "halting space");
        self.halted.send_replace(Some(reason.clone()));
        self.events.send(PipelineEvent::Halted { reason }).ok();
        // Local storage is no longer trustworthy; stop everything attached
        // to this space rather than diverge silently.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EntryPayload, Mutation, Value};
    use crate::document::LwwMap;
    use crate::keys::FeedSecret;

    fn entry(object: &str, field: &str, value: i64, ts: u64) -> Bytes {
        let payload = EntryPayload {
            timestamp_us: ts,
            mutation: Mutation::Assign {
                object: object.into(),
                field: field.to_owned(),
                value: Value::Int(value),
            },
            metadata: Vec::new(),
        };
        codec::encode(&payload).unwrap().into()
    }

    fn spawn_pipeline(
        feeds: &FeedStore,
        threshold: u64,
    ) -> (
        Pipeline,
        Arc<Mutex<Box<dyn Document>>>,
        flume::Receiver<PipelineEvent>,
        CancellationToken,
    ) {
        let document: Arc<Mutex<Box<dyn Document>>> =
            Arc::new(Mutex::new(Box::new(LwwMap::new())));
        let (events_tx, events_rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        let (pipeline, _handle) = Pipeline::spawn(
            SpaceId::from(&[9u8; 32]),
            feeds.clone(),
            document.clone(),
            Timeframe::new(),
            threshold,
            events_tx,
            cancel.clone(),
        );
        (pipeline, document, events_rx, cancel)
    }

    #[tokio::test]
    async fn applies_across_feeds_and_reports_progress() {
        let feeds = FeedStore::memory().unwrap();
        let s1 = FeedSecret::from_bytes(&[1; 32]);
        let s2 = FeedSecret::from_bytes(&[2; 32]);
        let f1 = feeds.create_feed(&s1).unwrap();
        let f2 = feeds.create_feed(&s2).unwrap();

        for (i, ts) in [(0u64, 10u64), (1, 20), (2, 30)] {
            feeds
                .append(f1, &s1, entry("obj", "a", i as i64, ts))
                .unwrap();
        }
        feeds.append(f2, &s2, entry("obj", "b", 7, 15)).unwrap();
        feeds.append(f2, &s2, entry("obj", "a", 99, 40)).unwrap();

        let (pipeline, document, _events, cancel) = spawn_pipeline(&feeds, 0);
        pipeline.attach(f1).await.unwrap();
        pipeline.attach(f2).await.unwrap();

        let target: Timeframe = [(f1, 2), (f2, 1)].into_iter().collect();
        pipeline.wait_until(&target, &cancel).await.unwrap();

        assert_eq!(pipeline.current_timeframe(), target);
        let progress = pipeline.progress();
        assert_eq!(progress.applied, 5);
        assert_eq!(progress.known, 5);
        assert_eq!(progress.ratio(), 1.0);

        // Highest timestamp wins regardless of which feed carried it.
        let doc = document.lock();
        let state = doc.encode_state().unwrap();
        let mut check = LwwMap::new();
        check.restore(&state).unwrap();
        assert_eq!(check.get(&"obj".into(), "a"), Some(&Value::Int(99)));
        assert_eq!(check.get(&"obj".into(), "b"), Some(&Value::Int(7)));
    }

    #[tokio::test]
    async fn note_head_advances_target_only() {
        let feeds = FeedStore::memory().unwrap();
        let s1 = FeedSecret::from_bytes(&[1; 32]);
        let f1 = feeds.create_feed(&s1).unwrap();

        let (pipeline, _document, _events, _cancel) = spawn_pipeline(&feeds, 0);
        pipeline.attach(f1).await.unwrap();
        pipeline.note_head(f1, 9).await.unwrap();

        // Give the actor a turn to process.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let progress = pipeline.progress();
        assert_eq!(progress.applied, 0);
        assert_eq!(progress.known, 10);
        assert!(progress.ratio() < 1.0);
    }

    #[tokio::test]
    async fn wait_until_cancellation() {
        let feeds = FeedStore::memory().unwrap();
        let (pipeline, _document, _events, _cancel) = spawn_pipeline(&feeds, 0);

        let secret = FeedSecret::from_bytes(&[3; 32]);
        let target: Timeframe = [(secret.id(), 0)].into_iter().collect();
        let cancel = CancellationToken::new();
        let waiter = pipeline.wait_until(&target, &cancel);
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap_err(), Error::Cancelled));
    }

    #[tokio::test]
    async fn compaction_threshold_signals() {
        let feeds = FeedStore::memory().unwrap();
        let s1 = FeedSecret::from_bytes(&[1; 32]);
        let f1 = feeds.create_feed(&s1).unwrap();
        for i in 0..4u64 {
            feeds.append(f1, &s1, entry("o", "f", i as i64, i)).unwrap();
        }

        let (pipeline, _document, events, cancel) = spawn_pipeline(&feeds, 2);
        pipeline.attach(f1).await.unwrap();
        let target: Timeframe = [(f1, 3)].into_iter().collect();
        pipeline.wait_until(&target, &cancel).await.unwrap();

        let wanted = events
            .drain()
            .filter(|e| matches!(e, PipelineEvent::CompactionWanted))
            .count();
        assert_eq!(wanted, 2);
    }

    #[tokio::test]
    async fn checkpoint_resumes_equivalently() {
        let feeds = FeedStore::memory().unwrap();
        let s1 = FeedSecret::from_bytes(&[1; 32]);
        let f1 = feeds.create_feed(&s1).unwrap();
        for i in 0..3u64 {
            feeds.append(f1, &s1, entry("o", "f", i as i64, i)).unwrap();
        }

        let (pipeline, _document, _events, cancel) = spawn_pipeline(&feeds, 0);
        pipeline.attach(f1).await.unwrap();
        let mid: Timeframe = [(f1, 2)].into_iter().collect();
        pipeline.wait_until(&mid, &cancel).await.unwrap();
        let (cut, state) = pipeline.checkpoint().await.unwrap();
        assert_eq!(cut, mid);

        // Resume a fresh pipeline from the checkpoint; append more.
        feeds.append(f1, &s1, entry("o", "f", 42, 100)).unwrap();
        let resumed: Arc<Mutex<Box<dyn Document>>> = {
            let mut doc = LwwMap::new();
            doc.restore(&state).unwrap();
            Arc::new(Mutex::new(Box::new(doc)))
        };
        let (events_tx, _events_rx) = flume::unbounded();
        let (pipeline2, _handle) = Pipeline::spawn(
            SpaceId::from(&[9u8; 32]),
            feeds.clone(),
            resumed.clone(),
            cut,
            0,
            events_tx,
            CancellationToken::new(),
        );
        pipeline2.attach(f1).await.unwrap();
        let end: Timeframe = [(f1, 3)].into_iter().collect();
        pipeline2
            .wait_until(&end, &CancellationToken::new())
            .await
            .unwrap();

        let state = resumed.lock().encode_state().unwrap();
        let mut check = LwwMap::new();
        check.restore(&state).unwrap();
        assert_eq!(check.get(&"o".into(), "f"), Some(&Value::Int(42)));
    }
}
