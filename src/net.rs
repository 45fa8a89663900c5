//! The transport capability consumed by the replication layer.
//!
//! The engine does not discover or dial peers; it is handed a
//! [`NetworkAdapter`] that can push framed messages to connected peers and
//! surfaces connectivity as an event stream. The transport is allowed to
//! reorder, duplicate and drop frames — every protocol built on top of it
//! must tolerate all three — and a disconnected peer is "temporarily
//! unavailable", never data loss.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keys::base32;

pub mod memory;

/// Identifier of a connected peer, assigned by the transport.
#[derive(
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
    Serialize,
    Deserialize,
)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Mint a random peer id (used by in-process transports and tests).
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    /// Convert to byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Shortened string representation, for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(base32::parse_array(s)?))
    }
}

impl From<&[u8; 32]> for PeerId {
    fn from(value: &[u8; 32]) -> Self {
        Self(*value)
    }
}

/// Connectivity and inbound traffic, as observed by the transport.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A peer became reachable.
    PeerConnected(PeerId),
    /// A peer became unreachable. Not data loss; it may come back.
    PeerDisconnected(PeerId),
    /// One framed message arrived from a peer.
    Message {
        /// Sender of the frame.
        from: PeerId,
        /// The frame as handed to [`NetworkAdapter::send`] on the far side.
        frame: Bytes,
    },
}

/// Minimal transport capability.
///
/// Implementations are injected at [`Space`](crate::space::Space)
/// construction. `send` is fire-and-forget: the transport may queue, drop
/// or duplicate the frame, and delivery order is not guaranteed.
pub trait NetworkAdapter: Send + Sync + 'static {
    /// Queue one frame for delivery to `to`.
    fn send(&self, to: PeerId, frame: Bytes) -> Result<()>;

    /// The event stream of this adapter. All consumers share one stream;
    /// the engine drains it from a single task per space.
    fn events(&self) -> flume::Receiver<NetEvent>;

    /// Peers currently connected.
    fn peers(&self) -> Vec<PeerId>;
}
