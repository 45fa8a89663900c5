//! Signed feed entries.

use bytes::Bytes;
use ed25519_dalek::{Signature, SignatureError};
use serde::{Deserialize, Serialize};

use crate::keys::{FeedId, FeedSecret};

/// One entry in a feed, prior to signing.
///
/// `index` is the block's position in its feed, dense from 0. Once written,
/// the block at an index never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    feed: FeedId,
    index: u64,
    payload: Bytes,
}

impl Block {
    /// Create a new block.
    pub fn new(feed: FeedId, index: u64, payload: Bytes) -> Self {
        Block {
            feed,
            index,
            payload,
        }
    }

    /// The feed this block belongs to.
    pub fn feed(&self) -> &FeedId {
        &self.feed
    }

    /// Position of this block in its feed.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Entry payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Canonical byte representation used for signing.
    ///
    /// The signature covers `(feed, index, payload)` so that tampering with
    /// any of them is detectable by any reader.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + self.payload.len());
        out.extend_from_slice(self.feed.as_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Sign this block with the writer's key.
    pub fn sign(self, secret: &FeedSecret) -> SignedBlock {
        let signature = secret.sign(&self.signing_bytes());
        SignedBlock {
            block: self,
            signature,
        }
    }
}

/// A signed block, as stored and replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    block: Block,
    signature: Signature,
}

impl SignedBlock {
    /// Reassemble from parts, e.g. when loading from storage.
    pub fn from_parts(block: Block, signature: Signature) -> Self {
        SignedBlock { block, signature }
    }

    /// The inner block.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// The feed this block belongs to.
    pub fn feed(&self) -> &FeedId {
        self.block.feed()
    }

    /// Position of this block in its feed.
    pub fn index(&self) -> u64 {
        self.block.index()
    }

    /// Entry payload bytes.
    pub fn payload(&self) -> &Bytes {
        self.block.payload()
    }

    /// The writer signature over the canonical block bytes.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Verify the signature against the feed's public key.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.block
            .feed
            .verify(&self.block.signing_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let mut rng = rand::thread_rng();
        let secret = FeedSecret::generate(&mut rng);
        let block = Block::new(secret.id(), 0, Bytes::from_static(b"payload"));
        let signed = block.sign(&secret);
        signed.verify().unwrap();
    }

    #[test]
    fn tampering_detected() {
        let mut rng = rand::thread_rng();
        let secret = FeedSecret::generate(&mut rng);
        let signed = Block::new(secret.id(), 3, Bytes::from_static(b"data")).sign(&secret);

        // Payload swap.
        let forged = SignedBlock::from_parts(
            Block::new(secret.id(), 3, Bytes::from_static(b"evil")),
            *signed.signature(),
        );
        assert!(forged.verify().is_err());

        // Index swap.
        let forged = SignedBlock::from_parts(
            Block::new(secret.id(), 4, Bytes::from_static(b"data")),
            *signed.signature(),
        );
        assert!(forged.verify().is_err());

        // Feed swap.
        let other = FeedSecret::generate(&mut rng);
        let forged = SignedBlock::from_parts(
            Block::new(other.id(), 3, Bytes::from_static(b"data")),
            *signed.signature(),
        );
        assert!(forged.verify().is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let mut rng = rand::thread_rng();
        let secret = FeedSecret::generate(&mut rng);
        let signed = Block::new(secret.id(), 7, Bytes::from_static(b"x")).sign(&secret);
        let bytes = postcard::to_stdvec(&signed).unwrap();
        let back: SignedBlock = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(signed, back);
        back.verify().unwrap();
    }
}
