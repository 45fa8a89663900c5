//! In-process transport for tests and examples.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::net::{NetEvent, NetworkAdapter, PeerId};

/// A hub connecting in-process peers.
///
/// Every joined peer sees every other joined peer as connected. Delivery is
/// in-order and reliable — tests that need reordering or loss inject those
/// at the call site.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<HashMap<PeerId, flume::Sender<NetEvent>>>>,
}

impl MemoryNetwork {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as `peer`, returning its adapter.
    ///
    /// Existing members observe `PeerConnected(peer)`; the new member
    /// observes one `PeerConnected` per existing member.
    pub fn join(&self, peer: PeerId) -> MemoryAdapter {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.inner.lock();
        for (other, sender) in inner.iter() {
            sender.send(NetEvent::PeerConnected(peer)).ok();
            tx.send(NetEvent::PeerConnected(*other)).ok();
        }
        inner.insert(peer, tx);
        MemoryAdapter {
            id: peer,
            hub: self.clone(),
            events: rx,
        }
    }

    /// Remove `peer` from the hub; remaining members observe
    /// `PeerDisconnected(peer)`.
    pub fn disconnect(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        if inner.remove(peer).is_some() {
            for sender in inner.values() {
                sender.send(NetEvent::PeerDisconnected(*peer)).ok();
            }
        }
    }
}

/// Adapter handle for one member of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    id: PeerId,
    hub: MemoryNetwork,
    events: flume::Receiver<NetEvent>,
}

impl MemoryAdapter {
    /// This member's peer id.
    pub fn id(&self) -> PeerId {
        self.id
    }
}

impl NetworkAdapter for MemoryAdapter {
    fn send(&self, to: PeerId, frame: Bytes) -> Result<()> {
        let inner = self.hub.inner.lock();
        match inner.get(&to) {
            Some(sender) => {
                trace!(from = %self.id.fmt_short(), to = %to.fmt_short(), len = frame.len(), "deliver");
                sender
                    .send(NetEvent::Message {
                        from: self.id,
                        frame,
                    })
                    .ok();
            }
            // Unknown peer: the transport contract allows dropping frames.
            None => trace!(to = %to.fmt_short(), "drop frame for unknown peer"),
        }
        Ok(())
    }

    fn events(&self) -> flume::Receiver<NetEvent> {
        self.events.clone()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.hub
            .inner
            .lock()
            .keys()
            .filter(|id| **id != self.id)
            .copied()
            .collect()
    }
}
