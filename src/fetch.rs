//! Peer-to-peer snapshot exchange ("object sync").
//!
//! The snapshot manager produces space state on demand: a local store hit
//! returns immediately; on a miss the object is requested from connected
//! peers by content address, verified, persisted, and only then returned —
//! so a second miss for the same id never recurs. With no peer reachable
//! the load suspends until one connects or the caller cancels; it never
//! fabricates empty state. The same actor symmetrically serves requests
//! for objects it has locally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    error::{Error, Result},
    keys::SpaceId,
    net::{NetworkAdapter, PeerId},
    proto::{self, Message},
    snapshot::{Snapshot, SnapshotId, SnapshotStore},
};

#[derive(derive_more::Debug, strum::Display)]
enum ToFetch {
    Fetch {
        id: SnapshotId,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Handle {
        from: PeerId,
        message: Message,
    },
    PeerConnected {
        peer: PeerId,
    },
}

/// Handle to the snapshot exchange actor of one space.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    inbox: mpsc::Sender<ToFetch>,
    store: SnapshotStore,
}

impl SnapshotManager {
    /// Spawn the exchange actor.
    ///
    /// `retry` bounds how long a pending fetch waits before re-asking the
    /// currently connected peers.
    pub fn spawn(
        space: SpaceId,
        store: SnapshotStore,
        net: Arc<dyn NetworkAdapter>,
        retry: Duration,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let actor = FetchActor {
            store: store.clone(),
            net,
            inbox: inbox_rx,
            pending: HashMap::new(),
            retry,
            cancel,
        };
        let span = error_span!("fetch", space = %space.fmt_short());
        let handle = tokio::spawn(actor.run().instrument(span));
        (
            SnapshotManager {
                inbox: inbox_tx,
                store,
            },
            handle,
        )
    }

    /// The local snapshot store.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Produce the snapshot stored under `id`, fetching it from a peer when
    /// missing locally.
    ///
    /// Suspends until the object is available or `cancel` fires
    /// ([`Error::Cancelled`]). A cancelled load leaves no partial object:
    /// fetched payloads are persisted only after full verification.
    pub async fn load(&self, id: SnapshotId, cancel: &CancellationToken) -> Result<Snapshot> {
        if let Some(bytes) = self.store.get(&id)? {
            return Snapshot::decode(&bytes);
        }
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(ToFetch::Fetch { id, reply })
            .await
            .map_err(|_| Error::Closed)?;
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = rx => match res {
                Ok(inner) => inner?,
                Err(_) => return Err(Error::Closed),
            },
        };
        Snapshot::decode(&bytes)
    }

    /// Persist a snapshot locally and return its content address.
    pub fn store_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotId> {
        let bytes = snapshot.encode()?;
        self.store.put(&bytes)
    }

    /// Route one inbound protocol message to the exchange actor.
    ///
    /// [`Space`](crate::space::Space) does this from its transport demux;
    /// call it directly when embedding the manager without a space.
    pub async fn handle_message(&self, from: PeerId, message: Message) -> Result<()> {
        self.inbox
            .send(ToFetch::Handle { from, message })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Tell the actor a peer became reachable; pending fetches are
    /// re-requested from it.
    pub async fn peer_connected(&self, peer: PeerId) -> Result<()> {
        self.inbox
            .send(ToFetch::PeerConnected { peer })
            .await
            .map_err(|_| Error::Closed)
    }
}

struct FetchActor {
    store: SnapshotStore,
    net: Arc<dyn NetworkAdapter>,
    inbox: mpsc::Receiver<ToFetch>,
    pending: HashMap<SnapshotId, Vec<oneshot::Sender<Result<Bytes>>>>,
    retry: Duration,
    cancel: CancellationToken,
}

impl FetchActor {
    async fn run(mut self) {
        debug!("fetch actor started");
        let mut retry = tokio::time::interval(self.retry);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = retry.tick() => self.rerequest(),
            }
        }
        debug!("fetch actor stopped");
    }

    fn handle(&mut self, msg: ToFetch) {
        trace!(%msg, "inbox");
        match msg {
            ToFetch::Fetch { id, reply } => match self.store.get(&id) {
                Ok(Some(bytes)) => {
                    reply.send(Ok(bytes)).ok();
                }
                Ok(None) => {
                    self.pending.entry(id).or_default().push(reply);
                    self.request(&id, None);
                }
                Err(err) => {
                    reply.send(Err(err)).ok();
                }
            },
            ToFetch::PeerConnected { peer } => {
                let pending: Vec<SnapshotId> = self.pending.keys().copied().collect();
                for id in pending {
                    self.request(&id, Some(peer));
                }
            }
            ToFetch::Handle { from, message } => self.handle_message(from, message),
        }
    }

    fn handle_message(&mut self, from: PeerId, message: Message) {
        match message {
            Message::SnapshotRequest { id } => {
                let reply = match self.store.get(&id) {
                    Ok(Some(payload)) => Message::SnapshotResponse { id, payload },
                    Ok(None) => Message::SnapshotMissing { id },
                    Err(err) => {
                        warn!(id = %id.fmt_short(), %err, "failed to read snapshot for peer");
                        Message::SnapshotMissing { id }
                    }
                };
                self.send(from, &reply);
            }
            Message::SnapshotResponse { id, payload } => {
                let Some(waiters) = self.pending.remove(&id) else {
                    trace!(id = %id.fmt_short(), "unsolicited snapshot response, ignoring");
                    return;
                };
                // Content addressing makes integrity self-verifying; a
                // mismatch means a broken or hostile peer, never fatal.
                if SnapshotId::for_payload(&payload) != id {
                    warn!(
                        id = %id.fmt_short(),
                        from = %from.fmt_short(),
                        "snapshot payload does not match its content address, dropping"
                    );
                    self.pending.insert(id, waiters);
                    return;
                }
                match self.store.put(&payload) {
                    Ok(_) => {
                        debug!(id = %id.fmt_short(), from = %from.fmt_short(), "snapshot fetched");
                        for waiter in waiters {
                            waiter.send(Ok(payload.clone())).ok();
                        }
                    }
                    Err(err) => {
                        warn!(id = %id.fmt_short(), %err, "failed to persist fetched snapshot");
                        for waiter in waiters {
                            waiter
                                .send(Err(Error::corrupt(format!(
                                    "failed to persist fetched snapshot: {err}"
                                ))))
                                .ok();
                        }
                    }
                }
            }
            Message::SnapshotMissing { id } => {
                trace!(id = %id.fmt_short(), from = %from.fmt_short(), "peer does not have snapshot");
            }
            other => {
                trace!(%other, "non-snapshot message, ignoring");
            }
        }
    }

    /// Ask `peer` (or every connected peer) for `id`.
    fn request(&self, id: &SnapshotId, peer: Option<PeerId>) {
        let peers = match peer {
            Some(peer) => vec![peer],
            None => self.net.peers(),
        };
        if peers.is_empty() {
            trace!(id = %id.fmt_short(), "no peer available, fetch stays pending");
            return;
        }
        for peer in peers {
            self.send(peer, &Message::SnapshotRequest { id: *id });
        }
    }

    fn rerequest(&mut self) {
        // Drop waiters whose callers have cancelled.
        for waiters in self.pending.values_mut() {
            waiters.retain(|w| !w.is_closed());
        }
        self.pending.retain(|_, waiters| !waiters.is_empty());
        let pending: Vec<SnapshotId> = self.pending.keys().copied().collect();
        for id in pending {
            self.request(&id, None);
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
