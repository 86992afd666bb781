//! Per-session transactional buffering.
//!
//! A session owns two pending lists, touched by no lock: class definition
//! changes (create/drop) and posting operations. Both are merged into the
//! shared structures by the classifier at commit and discarded wholesale at
//! rollback; other sessions never observe a partial flush.

use std::collections::BTreeMap;

use taxodb_proto::RecordId;

use crate::class::{ClassDef, ClassId};

/// Record mutation kinds the indexer translates into posting effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    /// New record inserted.
    Insert,
    /// Existing record updated.
    Update,
    /// Record deleted.
    Delete,
    /// Record soft-deleted (restorable).
    SoftDelete,
    /// Soft-deleted record restored.
    Undelete,
    /// Record purged, including soft-deleted postings.
    Purge,
    /// Record inserted already in the soft-deleted state (bulk load of a
    /// store that carries soft-deleted records).
    InsertDeleted,
}

/// A pending class definition change.
#[derive(Debug, Clone)]
pub enum PendingClassOp {
    /// Publish a new class at commit.
    Create(ClassDef),
    /// Drop a class at commit.
    Drop(ClassId),
}

impl PendingClassOp {
    /// The class the operation concerns.
    pub fn class_id(&self) -> ClassId {
        match self {
            PendingClassOp::Create(def) => def.id,
            PendingClassOp::Drop(id) => *id,
        }
    }
}

/// Sort key of a buffered posting operation. The BTreeMap ordering gives the
/// flush its required (class, key) order, and ascending class id is exactly
/// the per-class lock acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingKey {
    /// Affected class.
    pub class: ClassId,
    /// Full posting key (empty for escape-list membership entries).
    pub key: Vec<u8>,
    /// Affected record.
    pub record: RecordId,
}

/// Net effect buffered for one posting.
///
/// `created` tracks whether the posting was born inside this transaction;
/// a later delete of such a posting cancels the pair instead of flushing a
/// spurious remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPosting {
    /// Ensure a posting exists with the given state.
    Put { soft_deleted: bool, created: bool },
    /// Ensure no posting exists.
    Remove,
}

/// Fold one more submitted operation into the pending state for a key.
/// Returning None means the entry nets out to nothing.
fn coalesce(prev: Option<PendingPosting>, op: IndexOp) -> Option<PendingPosting> {
    use PendingPosting::*;
    let existed_before_tx = !matches!(prev, None | Some(Put { created: true, .. }));
    match op {
        IndexOp::Insert => Some(Put {
            soft_deleted: false,
            created: !existed_before_tx,
        }),
        IndexOp::InsertDeleted => Some(Put {
            soft_deleted: true,
            created: !existed_before_tx,
        }),
        IndexOp::Update | IndexOp::Undelete => Some(Put {
            soft_deleted: false,
            created: matches!(prev, Some(Put { created: true, .. })),
        }),
        IndexOp::SoftDelete => Some(Put {
            soft_deleted: true,
            created: matches!(prev, Some(Put { created: true, .. })),
        }),
        IndexOp::Delete | IndexOp::Purge => match prev {
            Some(Put { created: true, .. }) => None, // insert-then-delete cancels
            _ => Some(Remove),
        },
    }
}

/// Combine an earlier pending state with a later one (savepoint merge).
fn combine(earlier: Option<PendingPosting>, later: PendingPosting) -> Option<PendingPosting> {
    use PendingPosting::*;
    match later {
        Remove => match earlier {
            Some(Put { created: true, .. }) => None,
            _ => Some(Remove),
        },
        Put { soft_deleted, created } => {
            let created = match earlier {
                // Earlier op proved the posting predates the transaction.
                Some(Remove) | Some(Put { created: false, .. }) => false,
                Some(Put { created: true, .. }) => true,
                None => created,
            };
            Some(Put {
                soft_deleted,
                created,
            })
        }
    }
}

/// One session's transactional state.
#[derive(Debug, Default)]
pub struct Session {
    pending_classes: Vec<PendingClassOp>,
    pending_postings: BTreeMap<PendingKey, PendingPosting>,
}

impl Session {
    /// Create a session with no pending work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the session has buffered any uncommitted work.
    pub fn has_pending(&self) -> bool {
        !self.pending_classes.is_empty() || !self.pending_postings.is_empty()
    }

    /// Buffered class definition changes, in submission order.
    pub fn pending_class_ops(&self) -> &[PendingClassOp] {
        &self.pending_classes
    }

    /// Number of buffered posting operations (post-coalescing).
    pub fn pending_posting_count(&self) -> usize {
        self.pending_postings.len()
    }

    pub(crate) fn push_class_op(&mut self, op: PendingClassOp) {
        self.pending_classes.push(op);
    }

    /// Buffer a posting operation, collapsing repeats on the same key into
    /// their net effect.
    pub(crate) fn buffer_posting(&mut self, key: PendingKey, op: IndexOp) {
        let prev = self.pending_postings.get(&key).copied();
        match coalesce(prev, op) {
            Some(state) => {
                self.pending_postings.insert(key, state);
            }
            None => {
                self.pending_postings.remove(&key);
            }
        }
    }

    /// Drain both pending lists for a commit flush.
    pub(crate) fn take_pending(
        &mut self,
    ) -> (Vec<PendingClassOp>, BTreeMap<PendingKey, PendingPosting>) {
        (
            std::mem::take(&mut self.pending_classes),
            std::mem::take(&mut self.pending_postings),
        )
    }

    /// Discard all pending work (rollback). No persistent effect.
    pub fn discard(&mut self) {
        self.pending_classes.clear();
        self.pending_postings.clear();
    }

    /// Merge a later pending chain (an inner savepoint) into this session,
    /// collapsing repeated create/drop of the same class id and repeated
    /// operations on the same posting into their net effect.
    pub fn merge(&mut self, from: Session) {
        self.pending_classes.extend(from.pending_classes);
        for (key, later) in from.pending_postings {
            let earlier = self.pending_postings.get(&key).copied();
            match combine(earlier, later) {
                Some(state) => {
                    self.pending_postings.insert(key, state);
                }
                None => {
                    self.pending_postings.remove(&key);
                }
            }
        }
    }

    /// Net class-definition effects in submission order: a create followed by
    /// a drop of the same id nets out entirely; a drop followed by a create
    /// nets to drop-then-create.
    pub(crate) fn net_class_ops(ops: Vec<PendingClassOp>) -> Vec<PendingClassOp> {
        let mut net: Vec<PendingClassOp> = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                PendingClassOp::Drop(id) => {
                    // Cancel a pending create of the same id, if any.
                    if let Some(pos) = net.iter().position(|p| {
                        matches!(p, PendingClassOp::Create(def) if def.id == id)
                    }) {
                        net.remove(pos);
                    } else {
                        net.push(PendingClassOp::Drop(id));
                    }
                }
                create => net.push(create),
            }
        }
        net
    }
}
