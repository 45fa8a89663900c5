//! Durable append-only feed storage.
//!
//! Blocks live in a redb database, keyed `(feed, index)`. A write
//! transaction commits before `append` returns, so an acknowledged append
//! survives a crash. Appends go through a single writer path per feed (the
//! database write transaction), while readers run concurrently against read
//! snapshots; tailing readers park on a per-feed length watch.

use std::{collections::HashMap, path::Path, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    block::{Block, SignedBlock},
    error::{Error, Result},
    keys::{FeedId, FeedSecret},
    timeframe::Timeframe,
};

// Feeds
// Table
// Key: [u8; 32] # FeedId
// Value: u64    # feed length (next index to append)
const FEEDS_TABLE: TableDefinition<&[u8; 32], u64> = TableDefinition::new("feeds-1");

// Blocks
// Table
// Key: ([u8; 32], u64)      # (FeedId, index)
// Value: ([u8; 64], &[u8])  # (signature, payload)
type BlocksId<'a> = (&'a [u8; 32], u64);
type BlocksValue<'a> = (&'a [u8; 64], &'a [u8]);
const BLOCKS_TABLE: TableDefinition<BlocksId, BlocksValue> = TableDefinition::new("blocks-1");

/// Outcome of [`FeedStore::insert_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The block was new and is now persisted.
    Inserted,
    /// A block at this index already exists; the insert was a no-op.
    Duplicate,
}

/// Durable store for the append-only feeds of a device.
#[derive(Debug, Clone)]
pub struct FeedStore {
    db: Arc<Database>,
    watchers: Arc<RwLock<HashMap<FeedId, watch::Sender<u64>>>>,
}

impl FeedStore {
    /// Open or create a feed store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::with_db(db)
    }

    /// Create a feed store that lives in memory only.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::with_db(db)
    }

    fn with_db(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(FEEDS_TABLE)?;
            let _table = write_tx.open_table(BLOCKS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(FeedStore {
            db: Arc::new(db),
            watchers: Default::default(),
        })
    }

    /// Register a new locally writable feed. Idempotent.
    pub fn create_feed(&self, secret: &FeedSecret) -> Result<FeedId> {
        let feed = secret.id();
        self.add_feed(feed)?;
        Ok(feed)
    }

    /// Register a feed written by a remote peer. Idempotent.
    pub fn add_feed(&self, feed: FeedId) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut feeds = write_tx.open_table(FEEDS_TABLE)?;
            if feeds.get(feed.as_bytes())?.is_none() {
                feeds.insert(feed.as_bytes(), 0)?;
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    /// Whether `feed` is registered in this store.
    pub fn contains(&self, feed: &FeedId) -> Result<bool> {
        let read_tx = self.db.begin_read()?;
        let feeds = read_tx.open_table(FEEDS_TABLE)?;
        Ok(feeds.get(feed.as_bytes())?.is_some())
    }

    /// Number of blocks in `feed`.
    pub fn len(&self, feed: &FeedId) -> Result<u64> {
        let read_tx = self.db.begin_read()?;
        let feeds = read_tx.open_table(FEEDS_TABLE)?;
        let len = feeds.get(feed.as_bytes())?.ok_or(Error::NotFound)?;
        Ok(len.value())
    }

    /// All registered feeds.
    pub fn feed_ids(&self) -> Result<Vec<FeedId>> {
        let read_tx = self.db.begin_read()?;
        let feeds = read_tx.open_table(FEEDS_TABLE)?;
        let mut out = Vec::new();
        for item in feeds.iter()? {
            let (key, _) = item?;
            out.push(FeedId::from(key.value()));
        }
        Ok(out)
    }

    /// Highest stored index per non-empty feed.
    pub fn heads(&self) -> Result<Timeframe> {
        let read_tx = self.db.begin_read()?;
        let feeds = read_tx.open_table(FEEDS_TABLE)?;
        let mut heads = Timeframe::new();
        for item in feeds.iter()? {
            let (key, len) = item?;
            if len.value() > 0 {
                heads.advance(FeedId::from(key.value()), len.value() - 1);
            }
        }
        Ok(heads)
    }

    /// Sign and durably append `payload` to `feed`.
    ///
    /// Returns the index of the new block. The write is committed before
    /// this returns; an acknowledged append survives restart. Fails with
    /// [`Error::NotOwner`] when `secret` is not the feed's write key.
    pub fn append(&self, feed: FeedId, secret: &FeedSecret, payload: Bytes) -> Result<u64> {
        if secret.id() != feed {
            return Err(Error::NotOwner { feed: Some(feed) });
        }
        let index = {
            let write_tx = self.db.begin_write()?;
            let index = {
                let mut feeds = write_tx.open_table(FEEDS_TABLE)?;
                let index = feeds.get(feed.as_bytes())?.ok_or(Error::NotFound)?.value();
                let block = Block::new(feed, index, payload).sign(secret);
                let mut blocks = write_tx.open_table(BLOCKS_TABLE)?;
                blocks.insert(
                    (feed.as_bytes(), index),
                    (&block.signature().to_bytes(), block.payload().as_ref()),
                )?;
                feeds.insert(feed.as_bytes(), index + 1)?;
                index
            };
            write_tx.commit()?;
            index
        };
        self.notify(&feed, index + 1);
        Ok(index)
    }

    /// Persist a block received from a remote peer.
    ///
    /// The signature is verified first; an invalid signature is reported as
    /// [`Error::Corrupt`] (the caller decides whether that is fatal — for
    /// remote data it is not). Blocks below the current length are
    /// duplicates and ignored; blocks above it are [`Error::OutOfOrder`]
    /// and must be re-requested in order.
    pub fn insert_remote(&self, block: SignedBlock) -> Result<InsertOutcome> {
        block
            .verify()
            .map_err(|_| Error::corrupt("invalid block signature"))?;
        let feed = *block.feed();
        let index = block.index();
        let len = {
            let write_tx = self.db.begin_write()?;
            let len = {
                let mut feeds = write_tx.open_table(FEEDS_TABLE)?;
                let len = feeds.get(feed.as_bytes())?.ok_or(Error::NotFound)?.value();
                match index {
                    i if i < len => None,
                    i if i > len => {
                        return Err(Error::OutOfOrder {
                            feed,
                            index,
                            expected: len,
                        })
                    }
                    _ => {
                        let mut blocks = write_tx.open_table(BLOCKS_TABLE)?;
                        blocks.insert(
                            (feed.as_bytes(), index),
                            (&block.signature().to_bytes(), block.payload().as_ref()),
                        )?;
                        feeds.insert(feed.as_bytes(), index + 1)?;
                        Some(index + 1)
                    }
                }
            };
            write_tx.commit()?;
            len
        };
        match len {
            Some(len) => {
                self.notify(&feed, len);
                Ok(InsertOutcome::Inserted)
            }
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    /// Random-access read of a single block.
    pub fn get(&self, feed: &FeedId, index: u64) -> Result<Option<SignedBlock>> {
        let read_tx = self.db.begin_read()?;
        let blocks = read_tx.open_table(BLOCKS_TABLE)?;
        let Some(value) = blocks.get((feed.as_bytes(), index))? else {
            return Ok(None);
        };
        let (signature, payload) = value.value();
        let block = Block::new(*feed, index, Bytes::copy_from_slice(payload));
        Ok(Some(SignedBlock::from_parts(
            block,
            ed25519_dalek::Signature::from_bytes(signature),
        )))
    }

    /// Read up to `limit` consecutive blocks starting at `from`.
    ///
    /// Used to serve replication requests from remote peers.
    pub fn batch(&self, feed: &FeedId, from: u64, limit: usize) -> Result<Vec<SignedBlock>> {
        let len = self.len(feed)?;
        let mut out = Vec::new();
        let mut index = from;
        while index < len && out.len() < limit {
            match self.get(feed, index)? {
                Some(block) => out.push(block),
                None => {
                    return Err(Error::corrupt(format!(
                        "feed {} missing block {index} below length {len}",
                        feed.fmt_short()
                    )))
                }
            }
            index += 1;
        }
        Ok(out)
    }

    /// Begin a live-tailing read of `feed` starting at `from`.
    ///
    /// The returned reader yields stored blocks in index order and then
    /// suspends awaiting new appends. Dropping the reader or cancelling the
    /// token ends the read; the store is unaffected.
    pub fn read_from(
        &self,
        feed: FeedId,
        from: u64,
        cancel: CancellationToken,
    ) -> Result<BlockReader> {
        if !self.contains(&feed)? {
            return Err(Error::NotFound);
        }
        let len_rx = self.watch_len(&feed)?;
        Ok(BlockReader {
            store: self.clone(),
            feed,
            next: from,
            len_rx,
            cancel,
        })
    }

    /// Irreversibly delete `feed` and all of its blocks.
    ///
    /// Used only on explicit space reset. Active readers of the feed
    /// observe [`Error::Closed`].
    pub fn destroy(&self, feed: &FeedId) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut feeds = write_tx.open_table(FEEDS_TABLE)?;
            feeds.remove(feed.as_bytes())?;
            let mut blocks = write_tx.open_table(BLOCKS_TABLE)?;
            let keys: Vec<u64> = {
                let range =
                    blocks.range((feed.as_bytes(), 0)..=(feed.as_bytes(), u64::MAX))?;
                let mut keys = Vec::new();
                for item in range {
                    let (key, _) = item?;
                    keys.push(key.value().1);
                }
                keys
            };
            for index in keys {
                blocks.remove((feed.as_bytes(), index))?;
            }
        }
        write_tx.commit()?;
        // Dropping the sender wakes tailing readers with `Closed`.
        self.watchers.write().remove(feed);
        Ok(())
    }

    fn watch_len(&self, feed: &FeedId) -> Result<watch::Receiver<u64>> {
        if let Some(tx) = self.watchers.read().get(feed) {
            return Ok(tx.subscribe());
        }
        let rx = {
            let mut watchers = self.watchers.write();
            match watchers.get(feed) {
                Some(tx) => return Ok(tx.subscribe()),
                None => {
                    let (tx, rx) = watch::channel(0);
                    watchers.insert(*feed, tx);
                    rx
                }
            }
        };
        // Publish the current length after the watcher is visible, so an
        // append racing with registration cannot be missed.
        let len = self.len(feed)?;
        self.notify(feed, len);
        Ok(rx)
    }

    fn notify(&self, feed: &FeedId, len: u64) {
        if let Some(tx) = self.watchers.read().get(feed) {
            tx.send_replace(len);
        }
    }
}

/// Pull-based, cancellable, live-tailing reader over one feed.
#[derive(Debug)]
pub struct BlockReader {
    store: FeedStore,
    feed: FeedId,
    next: u64,
    len_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl BlockReader {
    /// The feed this reader follows.
    pub fn feed(&self) -> &FeedId {
        &self.feed
    }

    /// Index of the next block this reader will yield.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Yield the next block, suspending until one is appended if the reader
    /// has caught up.
    ///
    /// Fails with [`Error::Cancelled`] when the token fires,
    /// [`Error::Closed`] when the feed is destroyed, and [`Error::Corrupt`]
    /// when a block below the persisted length is missing (local storage
    /// damage).
    pub async fn next(&mut self) -> Result<SignedBlock> {
        loop {
            let len = *self.len_rx.borrow();
            if self.next < len {
                let block = self.store.get(&self.feed, self.next)?.ok_or_else(|| {
                    Error::corrupt(format!(
                        "feed {} missing block {} below length {len}",
                        self.feed.fmt_short(),
                        self.next
                    ))
                })?;
                self.next += 1;
                return Ok(block);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                changed = self.len_rx.changed() => {
                    changed.map_err(|_| Error::Closed)?;
                }
            }
        }
    }
}
