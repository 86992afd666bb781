//! Class definitions and runtime descriptors.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use rkyv::{Archive, Deserialize, Serialize};
use taxodb_proto::{PredicateExpr, PropertyId, RecordView};

use crate::error::Error;
use crate::eval::{self, Evaluator};

/// Identifier of a registered class. Assigned monotonically, never reused.
pub type ClassId = u32;

/// The class has at least one index property and therefore a persistent
/// postings index.
pub const CLASS_INDEXED: u32 = 0x0001;
/// Classification skips this class.
pub const CLASS_DISABLED: u32 = 0x0002;
/// Membership changes are subject to access control by the outer kernel.
pub const CLASS_ACL: u32 = 0x8000;

/// Notify subscribers when a record enters the class.
pub const NOTIFY_INSERT: u16 = 0x01;
/// Notify subscribers when a member record is updated.
pub const NOTIFY_UPDATE: u16 = 0x02;
/// Notify subscribers when a record leaves the class.
pub const NOTIFY_DELETE: u16 = 0x04;

/// A class predicate: one expression, or a disjunction of expressions.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Condition {
    /// A single compiled expression.
    Single(PredicateExpr),
    /// Any of several compiled expressions.
    AnyOf(Vec<PredicateExpr>),
}

impl Condition {
    /// Properties whose presence is necessary for any match.
    pub fn index_properties(&self) -> Vec<PropertyId> {
        match self {
            Condition::Single(expr) => eval::index_properties(expr),
            Condition::AnyOf(exprs) => eval::index_properties_any_of(exprs),
        }
    }

    /// Every property id the condition mentions.
    pub fn referenced_properties(&self) -> Vec<PropertyId> {
        let mut props = match self {
            Condition::Single(expr) => eval::referenced_properties(expr),
            Condition::AnyOf(exprs) => {
                let mut all: Vec<PropertyId> = exprs
                    .iter()
                    .flat_map(eval::referenced_properties)
                    .collect();
                all.sort_unstable();
                all
            }
        };
        props.dedup();
        props
    }

    /// Evaluate the condition against a record.
    pub fn matches(&self, record: &RecordView<'_>) -> bool {
        match self {
            Condition::Single(expr) => Evaluator::evaluate(expr, record),
            Condition::AnyOf(exprs) => exprs.iter().any(|e| Evaluator::evaluate(e, record)),
        }
    }
}

/// Lifecycle state of a class.
///
/// `PendingCreate -> Active -> PendingDelete -> Dying -> Destroyed`, with
/// `PendingDelete -> Active` on rollback. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassState {
    /// Created inside an uncommitted transaction.
    PendingCreate = 0,
    /// Live: classification matches it, its index accepts postings.
    Active = 1,
    /// Dropped inside an uncommitted transaction.
    PendingDelete = 2,
    /// Drop committed: invisible to new classification, still indexable for
    /// cleanup, visible to in-flight readers.
    Dying = 3,
    /// Unreferenced and its persistent index dropped.
    Destroyed = 4,
}

impl ClassState {
    fn from_u8(v: u8) -> ClassState {
        match v {
            0 => ClassState::PendingCreate,
            1 => ClassState::Active,
            2 => ClassState::PendingDelete,
            3 => ClassState::Dying,
            _ => ClassState::Destroyed,
        }
    }
}

/// Persisted definition of one class.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ClassDef {
    /// Class identifier.
    pub id: ClassId,
    /// Human-readable class name (unique per store, assigned by the caller).
    pub name: String,
    /// The compiled predicate.
    pub condition: Condition,
    /// Index property ids, strictly ascending, duplicate-free. Empty for
    /// escape-list classes.
    pub index_props: Vec<PropertyId>,
    /// CLASS_* flag bits.
    pub flags: u32,
    /// NOTIFY_* subscriber mask.
    pub notifications: u16,
}

impl ClassDef {
    /// Build a definition from a compiled condition, extracting its index
    /// properties.
    pub fn new(id: ClassId, name: impl Into<String>, condition: Condition) -> Self {
        let index_props = condition.index_properties();
        let mut flags = 0;
        if !index_props.is_empty() {
            flags |= CLASS_INDEXED;
        }
        Self {
            id,
            name: name.into(),
            condition,
            index_props,
            flags,
            notifications: 0,
        }
    }

    /// Set the notification subscriber mask.
    pub fn with_notifications(mut self, mask: u16) -> Self {
        self.notifications = mask;
        self
    }

    /// Clear the index property list, making this an escape-list class
    /// evaluated against every record (e.g. when the derivable properties
    /// are too volatile to be worth postings maintenance).
    pub fn unindexed(mut self) -> Self {
        self.index_props.clear();
        self.flags &= !CLASS_INDEXED;
        self
    }

    /// Serialize the definition to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a definition from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Runtime descriptor of one class.
///
/// Immutable after publication except for the flag/notification/state words;
/// shared behind `Arc`, so "refcount reaches zero" is the last handle being
/// dropped.
#[derive(Debug)]
pub struct ClassDescriptor {
    id: ClassId,
    name: String,
    condition: Condition,
    index_props: Vec<PropertyId>,
    flags: AtomicU32,
    notifications: AtomicU16,
    state: AtomicU8,
}

impl ClassDescriptor {
    /// Compile a persisted definition into a runtime descriptor.
    pub fn from_def(def: ClassDef, state: ClassState) -> Self {
        Self {
            id: def.id,
            name: def.name,
            condition: def.condition,
            index_props: def.index_props,
            flags: AtomicU32::new(def.flags),
            notifications: AtomicU16::new(def.notifications),
            state: AtomicU8::new(state as u8),
        }
    }

    /// Class identifier.
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled predicate.
    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Index property ids (ascending, duplicate-free).
    pub fn index_props(&self) -> &[PropertyId] {
        &self.index_props
    }

    /// Whether the class has a persistent postings index.
    pub fn is_indexed(&self) -> bool {
        !self.index_props.is_empty()
    }

    /// Current CLASS_* flag bits.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Set and clear flag bits, returning the previous flags.
    pub fn update_flags(&self, set: u32, clear: u32) -> u32 {
        let mut cur = self.flags.load(Ordering::Acquire);
        loop {
            let next = (cur & !clear) | set;
            match self
                .flags
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => return prev,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current NOTIFY_* subscriber mask.
    pub fn notifications(&self) -> u16 {
        self.notifications.load(Ordering::Acquire)
    }

    /// Add subscriber bits.
    pub fn subscribe(&self, mask: u16) {
        self.notifications.fetch_or(mask, Ordering::AcqRel);
    }

    /// Remove subscriber bits.
    pub fn unsubscribe(&self, mask: u16) {
        self.notifications.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClassState {
        ClassState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt a lifecycle transition; false if the current state is not
    /// `from` or the edge is not part of the state machine.
    pub fn transition(&self, from: ClassState, to: ClassState) -> bool {
        let legal = matches!(
            (from, to),
            (ClassState::PendingCreate, ClassState::Active)
                | (ClassState::Active, ClassState::PendingDelete)
                | (ClassState::PendingDelete, ClassState::Active)
                | (ClassState::Active, ClassState::Dying)
                | (ClassState::PendingDelete, ClassState::Dying)
                | (ClassState::Dying, ClassState::Destroyed)
        );
        legal
            && self
                .state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Whether classification may match this class right now.
    pub fn is_classifiable(&self) -> bool {
        self.state() == ClassState::Active && self.flags() & CLASS_DISABLED == 0
    }

    /// Snapshot the descriptor back into a persistable definition.
    pub fn to_def(&self) -> ClassDef {
        ClassDef {
            id: self.id,
            name: self.name.clone(),
            condition: self.condition.clone(),
            index_props: self.index_props.clone(),
            flags: self.flags(),
            notifications: self.notifications(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxodb_proto::{SimplePredicate, Value};

    fn sample_def(id: ClassId) -> ClassDef {
        ClassDef::new(
            id,
            format!("class-{id}"),
            Condition::Single(PredicateExpr::And(vec![
                SimplePredicate::Gt { prop: 4, value: Value::Int32(10) },
                SimplePredicate::Exists { prop: 2 },
            ])),
        )
    }

    #[test]
    fn test_def_extracts_index_props() {
        let def = sample_def(1);
        assert_eq!(def.index_props, vec![2, 4]);
        assert_ne!(def.flags & CLASS_INDEXED, 0);

        let escape = ClassDef::new(
            2,
            "escape",
            Condition::Single(PredicateExpr::NotExists { prop: 9 }),
        );
        assert!(escape.index_props.is_empty());
        assert_eq!(escape.flags & CLASS_INDEXED, 0);
    }

    #[test]
    fn test_def_round_trip() {
        let def = sample_def(3).with_notifications(NOTIFY_INSERT | NOTIFY_DELETE);
        let bytes = def.to_bytes().unwrap();
        let back = ClassDef::from_bytes(&bytes).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_state_machine() {
        let desc = ClassDescriptor::from_def(sample_def(1), ClassState::PendingCreate);
        assert!(desc.transition(ClassState::PendingCreate, ClassState::Active));
        assert!(desc.is_classifiable());

        // Drop requested in a transaction, then rolled back.
        assert!(desc.transition(ClassState::Active, ClassState::PendingDelete));
        assert!(!desc.is_classifiable());
        assert!(desc.transition(ClassState::PendingDelete, ClassState::Active));

        // Drop committed.
        assert!(desc.transition(ClassState::Active, ClassState::Dying));
        assert!(desc.transition(ClassState::Dying, ClassState::Destroyed));

        // Terminal: no way out of Destroyed.
        assert!(!desc.transition(ClassState::Destroyed, ClassState::Active));
    }

    #[test]
    fn test_illegal_edges_rejected() {
        let desc = ClassDescriptor::from_def(sample_def(1), ClassState::PendingCreate);
        assert!(!desc.transition(ClassState::PendingCreate, ClassState::Dying));
        assert!(!desc.transition(ClassState::Active, ClassState::Active));
        // CAS guard: claimed `from` must match the actual state.
        assert!(!desc.transition(ClassState::Active, ClassState::PendingDelete));
    }

    #[test]
    fn test_flags_and_notifications() {
        let desc = ClassDescriptor::from_def(sample_def(1), ClassState::Active);
        desc.update_flags(CLASS_DISABLED, 0);
        assert!(!desc.is_classifiable());
        desc.update_flags(0, CLASS_DISABLED);
        assert!(desc.is_classifiable());

        desc.subscribe(NOTIFY_INSERT | NOTIFY_UPDATE);
        desc.unsubscribe(NOTIFY_UPDATE);
        assert_eq!(desc.notifications(), NOTIFY_INSERT);
    }
}
