//! TAXODB Core - Predicate classification and class membership indexing.
//!
//! Records carry open-ended sets of typed property values; registered
//! classes are persistent predicates over them. For every record mutation
//! this crate determines the classes the record satisfies (discrimination
//! trie narrowing plus predicate confirmation) and keeps each class's
//! persistent membership index consistent with that determination, inside
//! the caller's transactions.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod class;
pub mod classify;
pub mod error;
pub mod eval;
pub mod index;
pub mod lock;
pub mod txn;

pub use class::{
    ClassCatalog, ClassDef, ClassDescriptor, ClassId, ClassState, Condition, CLASS_ACL,
    CLASS_DISABLED, CLASS_INDEXED, NOTIFY_DELETE, NOTIFY_INSERT, NOTIFY_UPDATE,
};
pub use classify::{
    ClassificationResult, Classifier, MemoryRecordSource, OwnedRecord, PropertyDelta,
    RecordSource, StructuralGuard, BATCH_SIZE,
};
pub use lock::StructuralToken;
pub use error::Error;
pub use index::{ClassIndex, IndexParams, MembershipTree, Posting, PostingsTree};
pub use txn::{IndexOp, PendingClassOp, Session};

/// Re-export protocol types.
pub use taxodb_proto as proto;
