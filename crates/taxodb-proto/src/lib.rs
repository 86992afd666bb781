//! TAXODB protocol types.
//!
//! This crate defines the value and predicate IR types shared between the
//! classification kernel and its callers, using rkyv for zero-copy
//! serialization of persisted definitions.
//!
//! # Modules
//!
//! - [`value`] - Runtime property value types
//! - [`record`] - Record identity and property enumeration
//! - [`predicate`] - Compiled predicate IR evaluated during classification
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! All persisted types derive `rkyv::Archive`, `rkyv::Serialize`, and
//! `rkyv::Deserialize`. Use rkyv directly for serialization:
//!
//! ```ignore
//! use taxodb_proto::Value;
//!
//! let value = Value::String("hello".into());
//! let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&value).unwrap();
//! ```

pub mod error;
pub mod predicate;
pub mod record;
pub mod value;

pub use error::Error;

// Re-export commonly used types at crate root
pub use predicate::{PredicateExpr, SimplePredicate};
pub use record::{PropertyId, RecordAddr, RecordId, RecordView};
pub use value::Value;

/// Format version for persisted definitions.
///
/// Included in persisted class definitions and index parameter blocks so an
/// incompatible layout change is detected at load time instead of producing
/// garbage descriptors.
pub const FORMAT_VERSION: u32 = 1;
