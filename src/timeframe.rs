//! Per-feed high-water-mark vectors.

use std::collections::{btree_map, BTreeMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys::FeedId;

/// Highest known block index for each feed of a space.
///
/// A timeframe describes a consistent causal cut across all feeds. Feeds
/// absent from the map have no known blocks (conceptually index `-1`).
/// Timeframes are partially ordered: `a` covers `b` iff every frame of `b`
/// is at or below the corresponding frame of `a`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<FeedId, u64>,
}

impl Timeframe {
    /// The empty timeframe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no feed has a known block.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Highest known index for `feed`, if any.
    pub fn get(&self, feed: &FeedId) -> Option<u64> {
        self.frames.get(feed).copied()
    }

    /// First index *after* this timeframe for `feed`. This is where tailing
    /// resumes when the timeframe has been fully applied.
    pub fn next_index(&self, feed: &FeedId) -> u64 {
        self.get(feed).map(|i| i + 1).unwrap_or(0)
    }

    /// Raise the frame for `feed` to at least `index`. Frames only ever
    /// advance; a lower index is a no-op.
    pub fn advance(&mut self, feed: FeedId, index: u64) {
        self.frames
            .entry(feed)
            .and_modify(|i| *i = (*i).max(index))
            .or_insert(index);
    }

    /// Merge another timeframe into this one, keeping the maximum frame per
    /// feed.
    pub fn merge(&mut self, other: &Timeframe) {
        for (feed, index) in other.iter() {
            self.advance(*feed, *index);
        }
    }

    /// Whether this timeframe is at or past `other` on every frame.
    pub fn covers(&self, other: &Timeframe) -> bool {
        other
            .iter()
            .all(|(feed, index)| self.get(feed).map(|i| i >= *index).unwrap_or(false))
    }

    /// The frames of `self` that `current` has not yet reached.
    ///
    /// Empty result means `current` covers `self`.
    pub fn dependencies(&self, current: &Timeframe) -> Timeframe {
        let frames = self
            .iter()
            .filter(|(feed, index)| current.get(feed).map(|i| i < **index).unwrap_or(true))
            .map(|(feed, index)| (*feed, *index))
            .collect();
        Timeframe { frames }
    }

    /// Total number of blocks at or below this cut, across all feeds.
    /// Used for progress ratios.
    pub fn total(&self) -> u64 {
        self.frames.values().map(|i| i + 1).sum()
    }

    /// Iterate over `(feed, index)` frames.
    pub fn iter(&self) -> btree_map::Iter<'_, FeedId, u64> {
        self.frames.iter()
    }
}

impl FromIterator<(FeedId, u64)> for Timeframe {
    fn from_iter<T: IntoIterator<Item = (FeedId, u64)>>(iter: T) -> Self {
        Timeframe {
            frames: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for (feed, index) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", feed.fmt_short(), index)?;
            first = false;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::FeedSecret;

    fn feed(seed: u8) -> FeedId {
        FeedSecret::from_bytes(&[seed; 32]).id()
    }

    #[test]
    fn advance_is_monotonic() {
        let f = feed(1);
        let mut tf = Timeframe::new();
        tf.advance(f, 5);
        tf.advance(f, 3);
        assert_eq!(tf.get(&f), Some(5));
        tf.advance(f, 9);
        assert_eq!(tf.get(&f), Some(9));
    }

    #[test]
    fn covers_partial_order() {
        let (a, b) = (feed(1), feed(2));
        let lo: Timeframe = [(a, 1)].into_iter().collect();
        let hi: Timeframe = [(a, 3), (b, 0)].into_iter().collect();

        assert!(hi.covers(&lo));
        assert!(!lo.covers(&hi));
        assert!(hi.covers(&Timeframe::new()));
        // Missing feeds count as -1.
        let other: Timeframe = [(b, 0)].into_iter().collect();
        assert!(!lo.covers(&other));
    }

    #[test]
    fn dependencies_lists_missing_frames() {
        let (a, b) = (feed(1), feed(2));
        let target: Timeframe = [(a, 3), (b, 1)].into_iter().collect();
        let current: Timeframe = [(a, 3)].into_iter().collect();

        let deps = target.dependencies(&current);
        assert_eq!(deps.get(&a), None);
        assert_eq!(deps.get(&b), Some(1));
        assert!(target.dependencies(&target).is_empty());
    }

    #[test]
    fn merge_and_total() {
        let (a, b) = (feed(1), feed(2));
        let mut x: Timeframe = [(a, 2)].into_iter().collect();
        let y: Timeframe = [(a, 1), (b, 4)].into_iter().collect();
        x.merge(&y);
        assert_eq!(x.get(&a), Some(2));
        assert_eq!(x.get(&b), Some(4));
        assert_eq!(x.total(), 3 + 5);
    }

    #[test]
    fn next_index_for_resume() {
        let a = feed(1);
        let tf: Timeframe = [(a, 7)].into_iter().collect();
        assert_eq!(tf.next_index(&a), 8);
        assert_eq!(tf.next_index(&feed(2)), 0);
    }
}
