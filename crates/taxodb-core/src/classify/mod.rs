//! Classification: candidate narrowing, confirmation, and orchestration.

mod cache;
mod classifier;
mod result;
mod trie;

pub use cache::{ClassEntry, ClassObjectCache, DEFAULT_CLASS_CACHE_SIZE};
pub use classifier::{
    Classifier, MemoryRecordSource, OwnedRecord, PropertyDelta, RecordSource, StructuralGuard,
    BATCH_SIZE,
};
pub use result::ClassificationResult;
pub use trie::PropertyDiscriminationIndex;
