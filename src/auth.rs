//! Write authorization for remote blocks.

use crate::keys::{FeedId, SpaceId};

/// Decides whether a writer may append to a feed at a point in history.
///
/// Supplied by the credential layer and consulted before any remote block
/// is accepted into local storage (and before an unknown feed is admitted
/// to a space). Deliberately a single narrow method, not a capability bag.
pub trait WriteAuthorizer: Send + Sync + 'static {
    /// Whether the writer of `feed` is authorized to hold index `index` in
    /// `space`.
    fn allow_append(&self, space: &SpaceId, feed: &FeedId, index: u64) -> bool;
}

/// Accepts every writer. The default for single-trust-domain deployments
/// and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl WriteAuthorizer for AllowAll {
    fn allow_append(&self, _space: &SpaceId, _feed: &FeedId, _index: u64) -> bool {
        true
    }
}
