//! Wire messages exchanged between peers.
//!
//! One postcard-encoded [`Message`] per transport frame. Frames above
//! [`MAX_FRAME_SIZE`] are rejected on decode; a malformed frame from a peer
//! is logged and dropped by the caller, never fatal.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    block::SignedBlock,
    error::{Error, Result},
    keys::{FeedId, SpaceId},
    snapshot::SnapshotId,
    timeframe::Timeframe,
};

/// Upper bound for one frame. Generous for snapshots, small enough to bound
/// a hostile peer's allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Number of blocks sent per [`Message::Blocks`] frame.
pub const BLOCK_BATCH_SIZE: usize = 64;

/// Replication protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum Message {
    /// Advertise the sender's highest stored index per feed of a space.
    Announce {
        /// Space being announced.
        space: SpaceId,
        /// The sender's stored heads.
        heads: Timeframe,
    },
    /// Ask for blocks of one feed starting at `from`.
    BlockRequest {
        /// Space the feed belongs to.
        space: SpaceId,
        /// Feed to read.
        feed: FeedId,
        /// First index wanted.
        from: u64,
    },
    /// A batch of consecutive blocks of one feed.
    Blocks {
        /// Space the blocks belong to.
        space: SpaceId,
        /// The blocks, in index order.
        blocks: Vec<SignedBlock>,
    },
    /// Ask for a snapshot object by content address.
    SnapshotRequest {
        /// Content address wanted.
        id: SnapshotId,
    },
    /// A snapshot object. The receiver verifies `id` against the payload.
    SnapshotResponse {
        /// Content address of `payload`.
        id: SnapshotId,
        /// The snapshot bytes.
        payload: Bytes,
    },
    /// The sender does not have the requested object.
    SnapshotMissing {
        /// The content address that was asked for.
        id: SnapshotId,
    },
}

/// Encode a message into one transport frame.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let bytes = postcard::to_stdvec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::corrupt(format!(
            "refusing to send oversized frame ({} bytes)",
            bytes.len()
        )));
    }
    Ok(bytes.into())
}

/// Decode one transport frame.
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(Error::corrupt(format!(
            "oversized frame ({} bytes)",
            frame.len()
        )));
    }
    Ok(postcard::from_bytes(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::FeedSecret;

    #[test]
    fn roundtrip() {
        let feed = FeedSecret::from_bytes(&[1; 32]).id();
        let msg = Message::Announce {
            space: SpaceId::from(&[2u8; 32]),
            heads: [(feed, 41)].into_iter().collect(),
        };
        let frame = encode_message(&msg).unwrap();
        match decode_message(&frame).unwrap() {
            Message::Announce { heads, .. } => assert_eq!(heads.get(&feed), Some(41)),
            other => panic!("unexpected message: {other}"),
        }
    }

    #[test]
    fn garbage_frame_is_an_error() {
        assert!(decode_message(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
