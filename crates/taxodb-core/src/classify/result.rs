//! Per-call accumulator of confirmed class matches.

use std::sync::Arc;

use crate::class::{ClassDescriptor, ClassId};
use crate::error::Error;

/// The classes one record was confirmed to match, scoped to a single
/// classify call.
///
/// Kept sorted by class id so duplicate detection is a binary search;
/// escape-list classes and classes reachable through more than one trie
/// branch are inserted once regardless of how often they were yielded as
/// candidates.
#[derive(Debug, Default)]
pub struct ClassificationResult {
    classes: Vec<Arc<ClassDescriptor>>,
    n_indexed: usize,
    notifications: u16,
}

impl ClassificationResult {
    /// Create an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a confirmed match, ignoring duplicates.
    ///
    /// Returns true when the class was newly inserted. Growth failure is
    /// reported as `ResourceExhausted` and aborts only this call.
    pub fn insert(&mut self, descriptor: Arc<ClassDescriptor>) -> Result<bool, Error> {
        let pos = match self
            .classes
            .binary_search_by_key(&descriptor.id(), |c| c.id())
        {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        self.classes
            .try_reserve(1)
            .map_err(|_| Error::ResourceExhausted("classification result growth"))?;
        if descriptor.is_indexed() {
            self.n_indexed += 1;
        }
        self.notifications |= descriptor.notifications();
        self.classes.insert(pos, descriptor);
        Ok(true)
    }

    /// The confirmed matches, ascending by class id.
    pub fn classes(&self) -> &[Arc<ClassDescriptor>] {
        &self.classes
    }

    /// Whether a class id is among the matches.
    pub fn contains(&self, id: ClassId) -> bool {
        self.classes.binary_search_by_key(&id, |c| c.id()).is_ok()
    }

    /// Number of confirmed matches.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class matched.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// How many matches carry a persistent postings index.
    pub fn n_indexed(&self) -> usize {
        self.n_indexed
    }

    /// OR of the matches' notification subscriber masks.
    pub fn notifications(&self) -> u16 {
        self.notifications
    }

    /// Reset for reuse across records in a batch.
    pub fn clear(&mut self) {
        self.classes.clear();
        self.n_indexed = 0;
        self.notifications = 0;
    }
}
