//! # Streams and Stream Sets
//!
//! A *stream* is one logical row source inside the statement being compiled: a base
//! table, a derived table, a procedure result. Streams are addressed by a small
//! compile-scoped integer, `StreamId`.
//!
//! ## Stream Sets
//!
//! Almost every planning decision asks a set question about streams: "are all the
//! streams this predicate references already active?", "which rivers does this
//! equality touch?", "does this access path depend on an outer stream?". `StreamSet`
//! answers those with a growable bitset. Unlike a fixed-width mask it has no upper
//! bound on the stream id, so statements with hundreds of streams need no special
//! handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compile-scoped identifier of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

const WORD_BITS: usize = 64;

/// Set of stream ids backed by a growable bitset.
///
/// Trailing zero words are trimmed after every mutation so that two sets holding the
/// same ids always compare equal regardless of how they were built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamSet {
    words: Vec<u64>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(stream: StreamId) -> Self {
        let mut set = Self::new();
        set.insert(stream);
        set
    }

    pub fn insert(&mut self, stream: StreamId) -> bool {
        let (word, bit) = Self::locate(stream);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !was_set
    }

    pub fn remove(&mut self, stream: StreamId) -> bool {
        let (word, bit) = Self::locate(stream);
        if word >= self.words.len() {
            return false;
        }
        let was_set = self.words[word] & bit != 0;
        self.words[word] &= !bit;
        self.trim();
        was_set
    }

    pub fn contains(&self, stream: StreamId) -> bool {
        let (word, bit) = Self::locate(stream);
        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when every member of `self` is also in `other`.
    pub fn is_subset(&self, other: &StreamSet) -> bool {
        self.words.iter().enumerate().all(|(i, w)| {
            let o = other.words.get(i).copied().unwrap_or(0);
            w & !o == 0
        })
    }

    pub fn intersects(&self, other: &StreamSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn union_with(&mut self, other: &StreamSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (i, w) in other.words.iter().enumerate() {
            self.words[i] |= w;
        }
    }

    pub fn difference_with(&mut self, other: &StreamSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= !other.words.get(i).copied().unwrap_or(0);
        }
        self.trim();
    }

    pub fn union(&self, other: &StreamSet) -> StreamSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn difference(&self, other: &StreamSet) -> StreamSet {
        let mut out = self.clone();
        out.difference_with(other);
        out
    }

    /// Iterate members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |b| word & (1u64 << b) != 0)
                .map(move |b| StreamId((i * WORD_BITS + b) as u32))
        })
    }

    fn locate(stream: StreamId) -> (usize, u64) {
        let idx = stream.0 as usize;
        (idx / WORD_BITS, 1u64 << (idx % WORD_BITS))
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl FromIterator<StreamId> for StreamSet {
    fn from_iter<I: IntoIterator<Item = StreamId>>(iter: I) -> Self {
        let mut set = StreamSet::new();
        for s in iter {
            set.insert(s);
        }
        set
    }
}

impl Extend<StreamId> for StreamSet {
    fn extend<I: IntoIterator<Item = StreamId>>(&mut self, iter: I) {
        for s in iter {
            self.insert(s);
        }
    }
}

impl fmt::Display for StreamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, s) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", s)?;
        }
        write!(f, "}}")
    }
}
