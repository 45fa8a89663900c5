//! Keys and identifiers for feeds and spaces.

use std::{cmp::Ordering, fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Signing key of a feed.
///
/// The holder of this key is the single writer of the feed; every block is
/// signed with it. Internally this is an [`SigningKey`].
#[derive(Clone, Serialize, Deserialize)]
pub struct FeedSecret {
    signing_key: SigningKey,
}

impl FeedSecret {
    /// Create a new [`FeedSecret`] with a random key.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        FeedSecret { signing_key }
    }

    /// Create a [`FeedSecret`] from a byte array.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// Returns the [`FeedSecret`] byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the [`FeedId`] this secret writes to.
    pub fn id(&self) -> FeedId {
        FeedId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with this key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl From<SigningKey> for FeedSecret {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

impl fmt::Display for FeedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.to_bytes()))
    }
}

impl fmt::Debug for FeedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedSecret({})", self.id())
    }
}

impl FromStr for FeedSecret {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?))
    }
}

/// Public identifier of a feed.
///
/// This is the verifying key matching the writer's [`FeedSecret`]; any
/// reader can use it to check block signatures.
#[derive(
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
    Serialize,
    Deserialize,
)]
pub struct FeedId([u8; 32]);

impl FeedId {
    /// Convert to byte array.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Convert to byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify that `signature` over `msg` was created by the writer of this
    /// feed.
    ///
    /// Fails if the bytes of this [`FeedId`] are not a valid
    /// [`ed25519_dalek`] curve point, or if the signature does not match.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        VerifyingKey::from_bytes(&self.0)?.verify_strict(msg, signature)
    }

    /// Shortened string representation, for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.0)
    }
}

/// Identifier of a space.
///
/// Spaces are identified by an opaque 32-byte value minted at creation; they
/// carry no signing authority of their own (writes are authorized per feed).
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
pub struct SpaceId([u8; 32]);

impl SpaceId {
    /// Mint a new random [`SpaceId`].
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        SpaceId(bytes)
    }

    /// Convert to byte array.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
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

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedId({})", self.fmt_short())
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceId({})", self.fmt_short())
    }
}

impl FromStr for FeedId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base32::parse_array(s)?))
    }
}

impl FromStr for SpaceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base32::parse_array(s)?))
    }
}

impl From<&[u8; 32]> for FeedId {
    fn from(value: &[u8; 32]) -> Self {
        Self(*value)
    }
}

impl From<&[u8; 32]> for SpaceId {
    fn from(value: &[u8; 32]) -> Self {
        Self(*value)
    }
}

impl From<&FeedSecret> for FeedId {
    fn from(value: &FeedSecret) -> Self {
        value.id()
    }
}

impl PartialOrd for FeedId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeedId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Utilities for working with byte array identifiers.
pub(crate) mod base32 {
    /// Convert to a base32 string
    pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
        text.make_ascii_lowercase();
        text
    }

    /// Convert to a base32 string limited to the first 10 bytes
    pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
        let len = bytes.as_ref().len().min(10);
        let mut text = data_encoding::BASE32_NOPAD.encode(&bytes.as_ref()[..len]);
        text.make_ascii_lowercase();
        text
    }

    /// Parse from a base32 string into a byte array
    pub fn parse_array<const N: usize>(input: &str) -> anyhow::Result<[u8; N]> {
        data_encoding::BASE32_NOPAD
            .decode(input.to_ascii_uppercase().as_bytes())?
            .try_into()
            .map_err(|_| ::anyhow::anyhow!("Failed to parse: invalid byte length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_id_roundtrip() {
        let mut rng = rand::thread_rng();
        let secret = FeedSecret::generate(&mut rng);
        let id = secret.id();
        let parsed: FeedId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        let secret2: FeedSecret = secret.to_string().parse().unwrap();
        assert_eq!(secret.to_bytes(), secret2.to_bytes());
    }

    #[test]
    fn signature_verifies() {
        let mut rng = rand::thread_rng();
        let secret = FeedSecret::generate(&mut rng);
        let sig = secret.sign(b"hello");
        secret.id().verify(b"hello", &sig).unwrap();
        assert!(secret.id().verify(b"tampered", &sig).is_err());
    }
}
