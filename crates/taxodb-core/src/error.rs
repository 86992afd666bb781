//! Core error types.

use taxodb_proto::record::PropertyId;
use thiserror::Error;

use crate::class::ClassId;

/// Classification engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Postings tree error.
    #[error("postings tree error: {0}")]
    Index(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Proto(#[from] taxodb_proto::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Allocation failed while growing an in-memory structure. Aborts the
    /// current call only.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A persisted class definition or parameter block failed its checksum
    /// or did not deserialize. The class is quarantined, not the session.
    #[error("corrupt class {class}: {reason}")]
    Corrupt { class: ClassId, reason: String },

    /// Predicate evaluation failed for one candidate class. Isolated to that
    /// class; other candidates in the same call are unaffected.
    #[error("predicate evaluation failed for class {class}: {reason}")]
    Eval { class: ClassId, reason: String },

    /// Class not found.
    #[error("class not found")]
    NotFound,

    /// Class id already registered.
    #[error("class {0} already exists")]
    AlreadyExists(ClassId),

    /// A structural change could not proceed without violating lock
    /// ordering. Retryable.
    #[error("structural lock busy, retry")]
    Busy,

    /// Property id outside the assigned range.
    #[error("unknown property id {0}")]
    UnknownProperty(PropertyId),

    /// Malformed index parameter block.
    #[error("invalid index params: {0}")]
    InvalidParams(String),

    /// Unexpected internal failure caught at the classify boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy)
    }

    /// Whether the failure is local to a single class rather than the call.
    pub fn is_class_local(&self) -> bool {
        matches!(self, Error::Corrupt { .. } | Error::Eval { .. })
    }
}
