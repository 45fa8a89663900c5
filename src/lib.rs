//! Local-first, peer-replicated spaces.
//!
//! A *space* is the convergent merge of multiple append-only, single-writer
//! logs (*feeds*), synchronized between peers without a central server.
//! This crate implements the replication and storage pipeline:
//!
//! - [`FeedStore`]: durable append-only feeds with live tailing
//! - [`MetadataStore`]: the catalog of known spaces and their feeds
//! - [`codec`]: the mapping between mutations and feed entry payloads
//! - [`SnapshotStore`] / [`SnapshotManager`]: content-addressed checkpoints,
//!   fetched from peers when missing locally
//! - [`Pipeline`]: the merge engine that applies entries in a
//!   convergence-preserving order and tracks replication progress
//! - [`Space`]: the per-dataset handle tying all of the above together
//!
//! Transports are injected via [`NetworkAdapter`]; the CRDT merge algebra is
//! injected via [`Document`]. Both are consumed as narrow capabilities, so
//! the engine itself stays transport- and schema-agnostic.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod block;
pub mod codec;
pub mod document;
pub mod error;
pub mod feeds;
pub mod fetch;
pub mod keys;
pub mod metadata;
pub mod net;
pub mod pipeline;
pub mod proto;
pub mod replicate;
pub mod snapshot;
pub mod space;
pub mod timeframe;

pub use auth::{AllowAll, WriteAuthorizer};
pub use block::{Block, SignedBlock};
pub use codec::{EntryPayload, MetaKey, Mutation, ObjectId, Value};
pub use document::{ApplyOrigin, Document, LwwMap};
pub use error::{Error, Result};
pub use feeds::{BlockReader, FeedStore, InsertOutcome};
pub use fetch::SnapshotManager;
pub use keys::{FeedId, FeedSecret, SpaceId};
pub use metadata::{MetadataStore, SpaceRecord};
pub use net::{NetEvent, NetworkAdapter, PeerId};
pub use pipeline::{Pipeline, PipelineEvent, Progress};
pub use snapshot::{Snapshot, SnapshotId, SnapshotStore};
pub use space::{Space, SpaceConfig, SpaceEvent, SpaceOpts};
pub use timeframe::Timeframe;
