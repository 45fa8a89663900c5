//! Durable catalog of known spaces and their feeds.
//!
//! The catalog is one file, rewritten atomically (write to a temp file in
//! the same directory, fsync, rename). The payload is checksummed so a torn
//! write is detected as [`Error::Corrupt`] rather than silently loading a
//! wrong feed set. A missing file is normal first-run state, not an error.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::{Error, Result},
    keys::{FeedId, SpaceId},
    snapshot::SnapshotId,
};

const MAGIC: &[u8; 8] = b"strandmd";
const STORAGE_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 4 + 32;

/// Catalog entry for one space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    /// The space this record describes.
    pub space: SpaceId,
    /// All feeds admitted to the space, in admission order.
    pub feeds: Vec<FeedId>,
    /// The feed this device writes to, once one exists.
    pub local_feed: Option<FeedId>,
    /// Latest compacted checkpoint, for replay-free startup.
    pub snapshot: Option<SnapshotId>,
}

impl SpaceRecord {
    fn new(space: SpaceId) -> Self {
        SpaceRecord {
            space,
            feeds: Vec::new(),
            local_feed: None,
            snapshot: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    spaces: BTreeMap<SpaceId, SpaceRecord>,
}

/// Durable space/feed catalog.
///
/// Read-modify-write cycles are serialized per store, so concurrent
/// mutators cannot lose updates. Catalog merges are deliberately simple:
/// feed lists are set-union, scalar fields are latest-wins. Document-level
/// CRDT merging never goes through here.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetadataStore {
    /// Create a store backed by the catalog file at `path`.
    ///
    /// No I/O happens here; the file may not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetadataStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Load all known space records. A missing catalog file yields an empty
    /// map; any other failure is surfaced (the engine must not guess at the
    /// feed set).
    pub async fn load(&self) -> Result<BTreeMap<SpaceId, SpaceRecord>> {
        Ok(self.read_catalog().await?.spaces)
    }

    /// Load the record for one space.
    pub async fn space(&self, space: &SpaceId) -> Result<Option<SpaceRecord>> {
        Ok(self.read_catalog().await?.spaces.remove(space))
    }

    /// Register a space. Idempotent.
    pub async fn add_space(&self, space: SpaceId) -> Result<()> {
        self.mutate(|catalog| {
            catalog
                .spaces
                .entry(space)
                .or_insert_with(|| SpaceRecord::new(space));
        })
        .await
    }

    /// Admit a feed to a space's feed set. Set-union: admitting a known
    /// feed is a no-op.
    pub async fn add_feed(&self, space: SpaceId, feed: FeedId) -> Result<()> {
        self.mutate_space(space, |record| {
            if !record.feeds.contains(&feed) {
                record.feeds.push(feed);
            }
        })
        .await
    }

    /// Record which feed this device writes to.
    pub async fn set_local_feed(&self, space: SpaceId, feed: FeedId) -> Result<()> {
        self.mutate_space(space, |record| {
            record.local_feed = Some(feed);
            if !record.feeds.contains(&feed) {
                record.feeds.push(feed);
            }
        })
        .await
    }

    /// Record the latest snapshot of a space.
    pub async fn set_snapshot(&self, space: SpaceId, snapshot: SnapshotId) -> Result<()> {
        self.mutate_space(space, |record| {
            record.snapshot = Some(snapshot);
        })
        .await
    }

    /// Forget a space. Used only on explicit space reset.
    pub async fn remove_space(&self, space: &SpaceId) -> Result<()> {
        let space = *space;
        self.mutate(|catalog| {
            catalog.spaces.remove(&space);
        })
        .await
    }

    /// Destroy the whole catalog. Used only on full device reset.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn mutate(&self, f: impl FnOnce(&mut Catalog)) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut catalog = self.read_catalog().await?;
        f(&mut catalog);
        self.write_catalog(&catalog).await
    }

    async fn mutate_space(&self, space: SpaceId, f: impl FnOnce(&mut SpaceRecord)) -> Result<()> {
        self.mutate(|catalog| {
            let record = catalog
                .spaces
                .entry(space)
                .or_insert_with(|| SpaceRecord::new(space));
            f(record);
        })
        .await
    }

    async fn read_catalog(&self) -> Result<Catalog> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no catalog file, starting empty");
                return Ok(Catalog::default());
            }
            Err(err) => return Err(err.into()),
        };
        if data.len() < HEADER_LEN {
            return Err(Error::corrupt("metadata catalog truncated"));
        }
        if &data[..8] != MAGIC {
            return Err(Error::corrupt("metadata catalog bad magic"));
        }
        let version = u32::from_be_bytes(data[8..12].try_into().expect("sized"));
        if version != STORAGE_VERSION {
            return Err(Error::corrupt(format!(
                "metadata catalog storage version {version}, expected {STORAGE_VERSION}"
            )));
        }
        let payload_len = u32::from_be_bytes(data[12..16].try_into().expect("sized")) as usize;
        let checksum: [u8; 32] = data[16..48].try_into().expect("sized");
        let payload = &data[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(Error::corrupt("metadata catalog payload length mismatch"));
        }
        if *blake3::hash(payload).as_bytes() != checksum {
            return Err(Error::corrupt("metadata catalog checksum mismatch"));
        }
        Ok(postcard::from_bytes(payload)
            .map_err(|_| Error::corrupt("metadata catalog undecodable"))?)
    }

    async fn write_catalog(&self, catalog: &Catalog) -> Result<()> {
        let payload = postcard::to_stdvec(catalog)?;
        let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&STORAGE_VERSION.to_be_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(blake3::hash(&payload).as_bytes());
        data.extend_from_slice(&payload);

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
