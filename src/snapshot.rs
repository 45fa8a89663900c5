//! Content-addressed storage for compacted merge state.

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use bytes::Bytes;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    keys::{base32, SpaceId},
    timeframe::Timeframe,
};

// Snapshots
// Table
// Key: [u8; 32] # SnapshotId (blake3 of the encoded snapshot)
// Value: &[u8]  # postcard-encoded Snapshot
const SNAPSHOTS_TABLE: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("snapshots-1");

/// Content address of a snapshot: the blake3 hash of its encoded bytes.
///
/// Because the id is derived from the payload, integrity of a fetched
/// snapshot is self-verifying.
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
pub struct SnapshotId([u8; 32]);

impl SnapshotId {
    /// Compute the content address of `payload`.
    pub fn for_payload(payload: &[u8]) -> Self {
        SnapshotId(*blake3::hash(payload).as_bytes())
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

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.fmt_short())
    }
}

impl FromStr for SnapshotId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(base32::parse_array(s)?))
    }
}

/// A compacted, self-describing checkpoint of a space.
///
/// Immutable once created: a new cut produces a new snapshot under a new
/// id. The recorded timeframe makes resume unambiguous — each feed
/// continues at `timeframe[feed] + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The space this snapshot belongs to.
    pub space: SpaceId,
    /// The exact cut the merged state represents.
    pub timeframe: Timeframe,
    /// Encoded merged document state.
    pub state: Bytes,
}

impl Snapshot {
    /// Serialize for storage or transfer.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(postcard::to_stdvec(self)?.into())
    }

    /// Decode stored snapshot bytes. An undecodable snapshot is corrupt;
    /// whether that is fatal depends on where the bytes came from.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|_| Error::corrupt("snapshot undecodable"))
    }

    /// The content address of this snapshot.
    pub fn id(&self) -> Result<SnapshotId> {
        Ok(SnapshotId::for_payload(&self.encode()?))
    }
}

/// Durable, content-addressed snapshot store.
///
/// Entries are immutable once written, so they are safely cacheable and
/// shareable without locking. Writes commit before returning; a reader can
/// never observe a partially written object.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db: Arc<Database>,
}

impl SnapshotStore {
    /// Open or create a snapshot store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::with_db(db)
    }

    /// Create a snapshot store that lives in memory only.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::with_db(db)
    }

    fn with_db(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(SNAPSHOTS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(SnapshotStore { db: Arc::new(db) })
    }

    /// Persist `payload` under its content address and return the id.
    /// Storing the same bytes twice is a no-op.
    pub fn put(&self, payload: &[u8]) -> Result<SnapshotId> {
        let id = SnapshotId::for_payload(payload);
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(SNAPSHOTS_TABLE)?;
            if table.get(id.as_bytes())?.is_none() {
                table.insert(id.as_bytes(), payload)?;
            }
        }
        write_tx.commit()?;
        Ok(id)
    }

    /// Fetch the payload stored under `id`, if present locally.
    pub fn get(&self, id: &SnapshotId) -> Result<Option<Bytes>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(SNAPSHOTS_TABLE)?;
        Ok(table
            .get(id.as_bytes())?
            .map(|guard| Bytes::copy_from_slice(guard.value())))
    }

    /// Whether `id` is present locally.
    pub fn contains(&self, id: &SnapshotId) -> Result<bool> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(SNAPSHOTS_TABLE)?;
        Ok(table.get(id.as_bytes())?.is_some())
    }

    /// Delete every snapshot whose id is not in `keep`. Returns the number
    /// of deleted entries. Never called automatically.
    pub fn gc(&self, keep: &[SnapshotId]) -> Result<usize> {
        let write_tx = self.db.begin_write()?;
        let removed = {
            let mut table = write_tx.open_table(SNAPSHOTS_TABLE)?;
            let doomed: Vec<[u8; 32]> = {
                let mut doomed = Vec::new();
                for item in table.iter()? {
                    let (key, _) = item?;
                    let id = SnapshotId(*key.value());
                    if !keep.contains(&id) {
                        doomed.push(*key.value());
                    }
                }
                doomed
            };
            for key in &doomed {
                table.remove(key)?;
            }
            doomed.len()
        };
        write_tx.commit()?;
        Ok(removed)
    }
}
