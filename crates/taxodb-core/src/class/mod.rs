//! Class definitions, runtime descriptors, and the persistent catalog.

mod catalog;
mod descriptor;

pub use catalog::ClassCatalog;
pub use descriptor::{
    ClassDef, ClassDescriptor, ClassId, ClassState, Condition, CLASS_ACL, CLASS_DISABLED,
    CLASS_INDEXED, NOTIFY_DELETE, NOTIFY_INSERT, NOTIFY_UPDATE,
};
