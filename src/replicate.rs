//! Feed replication between peers.
//!
//! Each peer periodically announces the heads of the feeds it stores. A
//! receiver compares the announcement with its own logs: unknown feeds are
//! admitted (subject to the write authorizer), the pipeline's target
//! timeframe advances immediately, and missing ranges are requested block
//! by block in index order. Because the transport may drop, duplicate or
//! reorder frames, every inbound block is re-checked (signature, authority,
//! contiguity) and gaps are simply re-requested — the periodic announce
//! bounds the loss window.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, trace, warn, Instrument};

use crate::{
    auth::WriteAuthorizer,
    block::SignedBlock,
    error::{Error, Result},
    feeds::{FeedStore, InsertOutcome},
    keys::{FeedId, SpaceId},
    metadata::MetadataStore,
    net::{NetworkAdapter, PeerId},
    pipeline::Pipeline,
    proto::{self, Message, BLOCK_BATCH_SIZE},
    timeframe::Timeframe,
};

#[derive(derive_more::Debug, strum::Display)]
enum ToReplicate {
    Handle { from: PeerId, message: Message },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    Announce,
}

/// Handle to the feed replication actor of one space.
#[derive(Debug, Clone)]
pub struct Replicator {
    inbox: mpsc::Sender<ToReplicate>,
}

impl Replicator {
    /// Spawn the replication actor.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        space: SpaceId,
        feeds: FeedStore,
        pipeline: Pipeline,
        metadata: Arc<MetadataStore>,
        auth: Arc<dyn WriteAuthorizer>,
        net: Arc<dyn NetworkAdapter>,
        announce_interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let actor = ReplicateActor {
            space,
            feeds,
            pipeline,
            metadata,
            auth,
            net,
            inbox: inbox_rx,
            announce_interval,
            cancel,
        };
        let span = error_span!("replicate", space = %space.fmt_short());
        let handle = tokio::spawn(actor.run().instrument(span));
        (Replicator { inbox: inbox_tx }, handle)
    }

    /// Push the local heads to all connected peers now (e.g. after a local
    /// append), rather than waiting for the next periodic announce.
    pub async fn announce(&self) -> Result<()> {
        self.inbox
            .send(ToReplicate::Announce)
            .await
            .map_err(|_| Error::Closed)
    }

    pub(crate) async fn handle_message(&self, from: PeerId, message: Message) -> Result<()> {
        self.inbox
            .send(ToReplicate::Handle { from, message })
            .await
            .map_err(|_| Error::Closed)
    }

    pub(crate) async fn peer_connected(&self, peer: PeerId) -> Result<()> {
        self.inbox
            .send(ToReplicate::PeerConnected { peer })
            .await
            .map_err(|_| Error::Closed)
    }

    pub(crate) async fn peer_disconnected(&self, peer: PeerId) -> Result<()> {
        self.inbox
            .send(ToReplicate::PeerDisconnected { peer })
            .await
            .map_err(|_| Error::Closed)
    }
}

struct ReplicateActor {
    space: SpaceId,
    feeds: FeedStore,
    pipeline: Pipeline,
    metadata: Arc<MetadataStore>,
    auth: Arc<dyn WriteAuthorizer>,
    net: Arc<dyn NetworkAdapter>,
    inbox: mpsc::Receiver<ToReplicate>,
    announce_interval: Duration,
    cancel: CancellationToken,
}

impl ReplicateActor {
    async fn run(mut self) {
        debug!("replicator started");
        let mut announce = tokio::time::interval(self.announce_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = announce.tick() => self.announce_to_all(),
            }
        }
        debug!("replicator stopped");
    }

    async fn handle(&mut self, msg: ToReplicate) {
        trace!(%msg, "inbox");
        match msg {
            ToReplicate::Announce => self.announce_to_all(),
            ToReplicate::PeerConnected { peer } => self.announce_to(peer),
            ToReplicate::PeerDisconnected { peer } => {
                // Temporarily unavailable, not data loss; nothing to undo.
                trace!(peer = %peer.fmt_short(), "peer disconnected");
            }
            ToReplicate::Handle { from, message } => match message {
                Message::Announce { space, heads } => {
                    if space != self.space {
                        trace!(%space, "announce for foreign space, ignoring");
                        return;
                    }
                    self.on_announce(from, heads).await;
                }
                Message::BlockRequest { space, feed, from: start } => {
                    if space != self.space {
                        return;
                    }
                    self.serve_blocks(from, feed, start);
                }
                Message::Blocks { space, blocks } => {
                    if space != self.space {
                        return;
                    }
                    self.on_blocks(from, blocks).await;
                }
                other => trace!(%other, "non-replication message, ignoring"),
            },
        }
    }

    fn announce_to_all(&self) {
        for peer in self.net.peers() {
            self.announce_to(peer);
        }
    }

    fn announce_to(&self, peer: PeerId) {
        match self.feeds.heads() {
            Ok(heads) => self.send(
                peer,
                &Message::Announce {
                    space: self.space,
                    heads,
                },
            ),
            Err(err) => error!(%err, "failed to read local heads"),
        }
    }

    async fn on_announce(&mut self, from: PeerId, heads: Timeframe) {
        for (feed, head) in heads.iter() {
            let known = match self.feeds.contains(feed) {
                Ok(known) => known,
                Err(err) => {
                    error!(%err, "feed store unavailable");
                    return;
                }
            };
            if !known {
                if !self.auth.allow_append(&self.space, feed, 0) {
                    warn!(feed = %feed.fmt_short(), "unauthorized feed announced, ignoring");
                    continue;
                }
                if let Err(err) = self.admit(*feed).await {
                    error!(feed = %feed.fmt_short(), %err, "failed to admit feed");
                    continue;
                }
            }
            self.pipeline.note_head(*feed, *head).await.ok();
            match self.feeds.len(feed) {
                Ok(len) if len <= *head => self.send(
                    from,
                    &Message::BlockRequest {
                        space: self.space,
                        feed: *feed,
                        from: len,
                    },
                ),
                Ok(_) => {}
                Err(err) => error!(feed = %feed.fmt_short(), %err, "failed to read feed length"),
            }
        }
    }

    async fn admit(&mut self, feed: FeedId) -> Result<()> {
        self.metadata.add_feed(self.space, feed).await?;
        self.feeds.add_feed(feed)?;
        self.pipeline.attach(feed).await?;
        debug!(feed = %feed.fmt_short(), "feed admitted");
        Ok(())
    }

    fn serve_blocks(&self, to: PeerId, feed: FeedId, mut start: u64) {
        loop {
            let batch = match self.feeds.batch(&feed, start, BLOCK_BATCH_SIZE) {
                Ok(batch) => batch,
                Err(Error::NotFound) => {
                    trace!(feed = %feed.fmt_short(), "request for unknown feed, ignoring");
                    return;
                }
                Err(err) => {
                    error!(feed = %feed.fmt_short(), %err, "failed to read blocks for peer");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            let count = batch.len();
            start += count as u64;
            self.send(
                to,
                &Message::Blocks {
                    space: self.space,
                    blocks: batch,
                },
            );
            if count < BLOCK_BATCH_SIZE {
                return;
            }
        }
    }

    async fn on_blocks(&mut self, from: PeerId, blocks: Vec<SignedBlock>) {
        // Feeds that already produced a gap in this batch; their remaining
        // blocks would fail the same way.
        let mut gapped = HashSet::new();
        for block in blocks {
            let feed = *block.feed();
            let index = block.index();
            if gapped.contains(&feed) {
                continue;
            }
            match self.feeds.contains(&feed) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(feed = %feed.fmt_short(), "blocks for unadmitted feed, ignoring");
                    continue;
                }
                Err(err) => {
                    error!(%err, "feed store unavailable");
                    return;
                }
            }
            if !self.auth.allow_append(&self.space, &feed, index) {
                warn!(feed = %feed.fmt_short(), index, "unauthorized block, dropping");
                continue;
            }
            match self.feeds.insert_remote(block) {
                Ok(InsertOutcome::Inserted) => {
                    self.pipeline.note_head(feed, index).await.ok();
                }
                Ok(InsertOutcome::Duplicate) => {
                    trace!(feed = %feed.fmt_short(), index, "duplicate block");
                }
                Err(Error::OutOfOrder { expected, .. }) => {
                    // The transport reordered or dropped something; ask for
                    // the range again in order.
                    gapped.insert(feed);
                    self.send(
                        from,
                        &Message::BlockRequest {
                            space: self.space,
                            feed,
                            from: expected,
                        },
                    );
                }
                // A bad block from a remote peer is dropped, never fatal.
                Err(Error::Corrupt { reason }) => {
                    warn!(feed = %feed.fmt_short(), index, %reason, "corrupt remote block, dropping");
                }
                Err(err) => {
                    error!(feed = %feed.fmt_short(), index, %err, "failed to persist block");
                    return;
                }
            }
        }
    }

    fn send(&self, to: PeerId, message: &Message) {
        match proto::encode_message(message) {
            Ok(frame) => {
                if let Err(err) = self.net.send(to, frame) {
                    debug!(to = %to.fmt_short(), %err, "send failed");
                }
            }
            Err(err) => warn!(%err, "failed to encode message"),
        }
    }
}
