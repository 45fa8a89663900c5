//! Mapping between application mutations and feed entry payloads.
//!
//! The wire form is a postcard-encoded [`EntryPayload`]. One metadata key,
//! [`MetaKey::QueuePosition`], is transient: it describes the entry's place
//! in a derived ordering, which is a property of replication order rather
//! than of application content, so [`encode`] strips it and [`decode`]
//! re-injects it when the caller knows the position.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of an application object targeted by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an object id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    /// The string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        ObjectId(value.to_owned())
    }
}

/// A field value carried by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// An application-level CRDT mutation.
///
/// The merge semantics of these are owned by the injected
/// [`Document`](crate::document::Document) capability; the engine only
/// transports and orders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Bring an object into existence.
    Create {
        /// Object to create.
        object: ObjectId,
    },
    /// Assign a field of an object.
    Assign {
        /// Object to mutate.
        object: ObjectId,
        /// Field name.
        field: String,
        /// New value.
        value: Value,
    },
    /// Remove an object.
    Remove {
        /// Object to remove.
        object: ObjectId,
    },
}

/// Metadata keys attachable to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetaKey {
    /// Transient position of the entry in a derived queue ordering.
    /// Never persisted to a feed.
    QueuePosition,
}

/// The decoded form of a feed entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPayload {
    /// Wall-clock timestamp at write time, micros since the Unix epoch.
    /// Used by last-write-wins merge strategies.
    pub timestamp_us: u64,
    /// The mutation itself.
    pub mutation: Mutation,
    /// Ancillary annotations; at most one entry per [`MetaKey`] after
    /// decoding.
    pub metadata: Vec<(MetaKey, Value)>,
}

impl EntryPayload {
    /// Create a payload for `mutation`, stamped with the current time.
    pub fn new(mutation: Mutation) -> Self {
        let timestamp_us = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("time drift")
            .as_micros() as u64;
        EntryPayload {
            timestamp_us,
            mutation,
            metadata: Vec::new(),
        }
    }

    /// The queue position annotation, if present.
    pub fn queue_position(&self) -> Option<u64> {
        self.metadata.iter().find_map(|(key, value)| match (key, value) {
            (MetaKey::QueuePosition, Value::Int(p)) => u64::try_from(*p).ok(),
            _ => None,
        })
    }
}

/// Encode an entry for appending to a feed.
///
/// Operates on a clone: the caller's in-memory entry is never mutated.
/// All [`MetaKey::QueuePosition`] annotations are stripped before
/// serializing, so the persisted payload carries no transient positional
/// state. Deterministic and side-effect-free.
pub fn encode(entry: &EntryPayload) -> Result<Vec<u8>> {
    let mut entry = entry.clone();
    entry
        .metadata
        .retain(|(key, _)| !matches!(key, MetaKey::QueuePosition));
    Ok(postcard::to_stdvec(&entry)?)
}

/// Decode an entry payload read from a feed.
///
/// When `position` is supplied the decoded entry is annotated with it.
/// Any stale persisted position entries are removed first, so at most one
/// position annotation survives.
pub fn decode(bytes: &[u8], position: Option<u64>) -> Result<EntryPayload> {
    let mut entry: EntryPayload = postcard::from_bytes(bytes)?;
    entry
        .metadata
        .retain(|(key, _)| !matches!(key, MetaKey::QueuePosition));
    if let Some(position) = position {
        entry
            .metadata
            .push((MetaKey::QueuePosition, Value::Int(position as i64)));
    }
    Ok(entry)
}
