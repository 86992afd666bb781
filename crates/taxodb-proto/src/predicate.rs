//! Compiled predicate IR.
//!
//! A class predicate arrives here already compiled by the query layer: a
//! single [`PredicateExpr`], or (for classes defined as a disjunction) an
//! array of them. Expressions are flat, two-level trees: compound And/Or
//! nodes hold [`SimplePredicate`] leaves only.

use crate::record::PropertyId;
use crate::value::Value;
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// A non-compound predicate over one property.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum SimplePredicate {
    /// Property equals value.
    Eq { prop: PropertyId, value: Value },
    /// Property not equals value.
    Ne { prop: PropertyId, value: Value },
    /// Property less than value.
    Lt { prop: PropertyId, value: Value },
    /// Property less than or equal to value.
    Le { prop: PropertyId, value: Value },
    /// Property greater than value.
    Gt { prop: PropertyId, value: Value },
    /// Property greater than or equal to value.
    Ge { prop: PropertyId, value: Value },
    /// Property is in a set of values.
    In { prop: PropertyId, values: Vec<Value> },
    /// Property is not in a set of values.
    NotIn { prop: PropertyId, values: Vec<Value> },
    /// Property is present on the record.
    Exists { prop: PropertyId },
    /// Property is absent from the record (or null).
    NotExists { prop: PropertyId },
    /// Property matches a LIKE pattern.
    Like { prop: PropertyId, pattern: String },
    /// Property does not match a LIKE pattern.
    NotLike { prop: PropertyId, pattern: String },
}

/// A compiled predicate expression.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum PredicateExpr {
    /// Property equals value.
    Eq { prop: PropertyId, value: Value },
    /// Property not equals value.
    Ne { prop: PropertyId, value: Value },
    /// Property less than value.
    Lt { prop: PropertyId, value: Value },
    /// Property less than or equal to value.
    Le { prop: PropertyId, value: Value },
    /// Property greater than value.
    Gt { prop: PropertyId, value: Value },
    /// Property greater than or equal to value.
    Ge { prop: PropertyId, value: Value },
    /// Property is in a set of values.
    In { prop: PropertyId, values: Vec<Value> },
    /// Property is not in a set of values.
    NotIn { prop: PropertyId, values: Vec<Value> },
    /// Property is present on the record.
    Exists { prop: PropertyId },
    /// Property is absent from the record (or null).
    NotExists { prop: PropertyId },
    /// Property matches a LIKE pattern.
    Like { prop: PropertyId, pattern: String },
    /// Property does not match a LIKE pattern.
    NotLike { prop: PropertyId, pattern: String },
    /// All conditions must be true (flat list, single level).
    And(Vec<SimplePredicate>),
    /// At least one condition must be true (flat list, single level).
    Or(Vec<SimplePredicate>),
}

impl PredicateExpr {
    /// Convenience constructor for a conjunction.
    pub fn and(preds: Vec<SimplePredicate>) -> Self {
        PredicateExpr::And(preds)
    }

    /// Convenience constructor for a disjunction.
    pub fn or(preds: Vec<SimplePredicate>) -> Self {
        PredicateExpr::Or(preds)
    }
}
