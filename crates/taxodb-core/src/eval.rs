//! Predicate evaluation and index-property extraction.
//!
//! This module is the confirmation step of classification: given a
//! candidate class's compiled predicate and a record's property enumeration,
//! decide match/no-match. It also extracts the *index properties* of a
//! predicate — the properties whose presence is a necessary condition for a
//! match — which is what the discrimination trie narrows on.

use std::cmp::Ordering;

use taxodb_proto::{PredicateExpr, PropertyId, RecordView, SimplePredicate, Value};

/// Extract the properties whose presence is necessary for the predicate to
/// hold, sorted ascending and deduplicated.
///
/// A property qualifies when a record lacking it can never match: Eq, Ne,
/// Lt, Le, Gt, Ge, In, Like, and Exists all require the property to be
/// present. NotIn, NotExists, and NotLike are satisfied by absence, so they
/// contribute nothing. An Or contributes only the properties required by
/// every branch.
pub fn index_properties(expr: &PredicateExpr) -> Vec<PropertyId> {
    let mut props = match expr {
        PredicateExpr::Eq { prop, .. }
        | PredicateExpr::Ne { prop, .. }
        | PredicateExpr::Lt { prop, .. }
        | PredicateExpr::Le { prop, .. }
        | PredicateExpr::Gt { prop, .. }
        | PredicateExpr::Ge { prop, .. }
        | PredicateExpr::In { prop, .. }
        | PredicateExpr::Like { prop, .. }
        | PredicateExpr::Exists { prop } => vec![*prop],
        PredicateExpr::NotIn { .. }
        | PredicateExpr::NotExists { .. }
        | PredicateExpr::NotLike { .. } => Vec::new(),
        PredicateExpr::And(preds) => {
            let mut out = Vec::new();
            for p in preds {
                if let Some(prop) = required_property(p) {
                    out.push(prop);
                }
            }
            out
        }
        PredicateExpr::Or(preds) => {
            // A property is necessary only if every branch requires it.
            let mut iter = preds.iter();
            match iter.next().and_then(required_property) {
                Some(first) if iter.clone().all(|p| required_property(p) == Some(first)) => {
                    vec![first]
                }
                _ => Vec::new(),
            }
        }
    };
    props.sort_unstable();
    props.dedup();
    props
}

/// Intersection of necessary properties across a disjunction of predicate
/// expressions (a class defined as `AnyOf`).
pub fn index_properties_any_of(exprs: &[PredicateExpr]) -> Vec<PropertyId> {
    let mut iter = exprs.iter().map(index_properties);
    let Some(mut acc) = iter.next() else {
        return Vec::new();
    };
    for branch in iter {
        acc.retain(|p| branch.binary_search(p).is_ok());
        if acc.is_empty() {
            break;
        }
    }
    acc
}

/// Every property id the expression mentions, sorted and deduplicated.
/// Distinct from [`index_properties`]: presence of these is not necessarily
/// required for a match.
pub fn referenced_properties(expr: &PredicateExpr) -> Vec<PropertyId> {
    let mut props = match expr {
        PredicateExpr::Eq { prop, .. }
        | PredicateExpr::Ne { prop, .. }
        | PredicateExpr::Lt { prop, .. }
        | PredicateExpr::Le { prop, .. }
        | PredicateExpr::Gt { prop, .. }
        | PredicateExpr::Ge { prop, .. }
        | PredicateExpr::In { prop, .. }
        | PredicateExpr::NotIn { prop, .. }
        | PredicateExpr::Exists { prop }
        | PredicateExpr::NotExists { prop }
        | PredicateExpr::Like { prop, .. }
        | PredicateExpr::NotLike { prop, .. } => vec![*prop],
        PredicateExpr::And(preds) | PredicateExpr::Or(preds) => preds
            .iter()
            .map(|p| match p {
                SimplePredicate::Eq { prop, .. }
                | SimplePredicate::Ne { prop, .. }
                | SimplePredicate::Lt { prop, .. }
                | SimplePredicate::Le { prop, .. }
                | SimplePredicate::Gt { prop, .. }
                | SimplePredicate::Ge { prop, .. }
                | SimplePredicate::In { prop, .. }
                | SimplePredicate::NotIn { prop, .. }
                | SimplePredicate::Exists { prop }
                | SimplePredicate::NotExists { prop }
                | SimplePredicate::Like { prop, .. }
                | SimplePredicate::NotLike { prop, .. } => *prop,
            })
            .collect(),
    };
    props.sort_unstable();
    props.dedup();
    props
}

fn required_property(pred: &SimplePredicate) -> Option<PropertyId> {
    match pred {
        SimplePredicate::Eq { prop, .. }
        | SimplePredicate::Ne { prop, .. }
        | SimplePredicate::Lt { prop, .. }
        | SimplePredicate::Le { prop, .. }
        | SimplePredicate::Gt { prop, .. }
        | SimplePredicate::Ge { prop, .. }
        | SimplePredicate::In { prop, .. }
        | SimplePredicate::Like { prop, .. }
        | SimplePredicate::Exists { prop } => Some(*prop),
        SimplePredicate::NotIn { .. }
        | SimplePredicate::NotExists { .. }
        | SimplePredicate::NotLike { .. } => None,
    }
}

/// Evaluates compiled predicates against record property enumerations.
pub struct Evaluator;

impl Evaluator {
    /// Evaluate a predicate expression against a record.
    pub fn evaluate(expr: &PredicateExpr, record: &RecordView<'_>) -> bool {
        match expr {
            PredicateExpr::Eq { prop, value } => {
                Self::compare_prop(record, *prop, value, Self::values_equal)
            }
            PredicateExpr::Ne { prop, value } => {
                Self::compare_prop(record, *prop, value, |a, b| !Self::values_equal(a, b))
            }
            PredicateExpr::Lt { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_lt).unwrap_or(false)
            }),
            PredicateExpr::Le { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_le).unwrap_or(false)
            }),
            PredicateExpr::Gt { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_gt).unwrap_or(false)
            }),
            PredicateExpr::Ge { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_ge).unwrap_or(false)
            }),
            PredicateExpr::In { prop, values } => match record.get(*prop) {
                Some(pv) => values.iter().any(|v| Self::values_equal(pv, v)),
                None => false,
            },
            PredicateExpr::NotIn { prop, values } => match record.get(*prop) {
                Some(pv) => !values.iter().any(|v| Self::values_equal(pv, v)),
                None => true, // absent property is not in any set
            },
            PredicateExpr::Exists { prop } => {
                !matches!(record.get(*prop), None | Some(Value::Null))
            }
            PredicateExpr::NotExists { prop } => {
                matches!(record.get(*prop), None | Some(Value::Null))
            }
            PredicateExpr::Like { prop, pattern } => match record.get(*prop) {
                Some(Value::String(s)) => Self::like_match(s, pattern),
                _ => false,
            },
            PredicateExpr::NotLike { prop, pattern } => match record.get(*prop) {
                Some(Value::String(s)) => !Self::like_match(s, pattern),
                _ => true,
            },
            PredicateExpr::And(preds) => preds.iter().all(|p| Self::evaluate_simple(p, record)),
            PredicateExpr::Or(preds) => preds.iter().any(|p| Self::evaluate_simple(p, record)),
        }
    }

    /// Evaluate a simple (non-compound) predicate.
    fn evaluate_simple(pred: &SimplePredicate, record: &RecordView<'_>) -> bool {
        match pred {
            SimplePredicate::Eq { prop, value } => {
                Self::compare_prop(record, *prop, value, Self::values_equal)
            }
            SimplePredicate::Ne { prop, value } => {
                Self::compare_prop(record, *prop, value, |a, b| !Self::values_equal(a, b))
            }
            SimplePredicate::Lt { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_lt).unwrap_or(false)
            }),
            SimplePredicate::Le { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_le).unwrap_or(false)
            }),
            SimplePredicate::Gt { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_gt).unwrap_or(false)
            }),
            SimplePredicate::Ge { prop, value } => Self::compare_prop(record, *prop, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_ge).unwrap_or(false)
            }),
            SimplePredicate::In { prop, values } => match record.get(*prop) {
                Some(pv) => values.iter().any(|v| Self::values_equal(pv, v)),
                None => false,
            },
            SimplePredicate::NotIn { prop, values } => match record.get(*prop) {
                Some(pv) => !values.iter().any(|v| Self::values_equal(pv, v)),
                None => true,
            },
            SimplePredicate::Exists { prop } => {
                !matches!(record.get(*prop), None | Some(Value::Null))
            }
            SimplePredicate::NotExists { prop } => {
                matches!(record.get(*prop), None | Some(Value::Null))
            }
            SimplePredicate::Like { prop, pattern } => match record.get(*prop) {
                Some(Value::String(s)) => Self::like_match(s, pattern),
                _ => false,
            },
            SimplePredicate::NotLike { prop, pattern } => match record.get(*prop) {
                Some(Value::String(s)) => !Self::like_match(s, pattern),
                _ => true,
            },
        }
    }

    /// Compare a record property with a comparator function. A missing
    /// property never matches.
    fn compare_prop<F>(record: &RecordView<'_>, prop: PropertyId, value: &Value, cmp: F) -> bool
    where
        F: FnOnce(&Value, &Value) -> bool,
    {
        match record.get(prop) {
            Some(pv) => cmp(pv, value),
            None => false,
        }
    }

    /// Check if two values are equal, coercing across numeric widths.
    fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Int32(a), Value::Int64(b)) => (*a as i64) == *b,
            (Value::Int64(a), Value::Int32(b)) => *a == (*b as i64),
            (Value::Float32(a), Value::Float32(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::Float32(a), Value::Float64(b)) => (*a as f64) == *b,
            (Value::Float64(a), Value::Float32(b)) => *a == (*b as f64),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            _ => false,
        }
    }

    /// Compare two values, returning their ordering if comparable.
    fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int64(b)) => Some((*a as i64).cmp(b)),
            (Value::Int64(a), Value::Int32(b)) => Some(a.cmp(&(*b as i64))),
            (Value::Float32(a), Value::Float32(b)) => a.partial_cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::Float32(a), Value::Float64(b)) => (*a as f64).partial_cmp(b),
            (Value::Float64(a), Value::Float32(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            _ => None, // incompatible types
        }
    }

    /// Match a string against a SQL LIKE pattern.
    ///
    /// Supports:
    /// - `%` matches zero or more characters
    /// - `_` matches exactly one character
    /// - `\\%` matches literal `%`
    /// - `\\_` matches literal `_`
    pub fn like_match(value: &str, pattern: &str) -> bool {
        let mut chars = value.chars().peekable();
        let mut pattern_chars = pattern.chars().peekable();
        Self::like_match_recursive(&mut chars, &mut pattern_chars)
    }

    fn like_match_recursive(
        chars: &mut std::iter::Peekable<std::str::Chars>,
        pattern: &mut std::iter::Peekable<std::str::Chars>,
    ) -> bool {
        loop {
            match (pattern.peek().copied(), chars.peek().copied()) {
                (None, None) => return true,
                (None, Some(_)) => return false,
                (Some('%'), _) => {
                    pattern.next();
                    if pattern.peek().is_none() {
                        return true;
                    }
                    // Try matching % with 0, 1, 2, ... characters
                    loop {
                        let mut pattern_clone = pattern.clone();
                        let mut chars_clone = chars.clone();
                        if Self::like_match_recursive(&mut chars_clone, &mut pattern_clone) {
                            return true;
                        }
                        if chars.next().is_none() {
                            return false;
                        }
                    }
                }
                (Some('_'), Some(_)) => {
                    pattern.next();
                    chars.next();
                }
                (Some('_'), None) => return false,
                (Some('\\'), _) => {
                    pattern.next();
                    match (pattern.peek().copied(), chars.peek().copied()) {
                        (Some(p), Some(c)) if p == c => {
                            pattern.next();
                            chars.next();
                        }
                        _ => return false,
                    }
                }
                (Some(p), Some(c)) => {
                    if p == c {
                        pattern.next();
                        chars.next();
                    } else {
                        return false;
                    }
                }
                (Some(_), None) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxodb_proto::RecordAddr;

    fn record(props: &[(PropertyId, Value)]) -> RecordView<'_> {
        RecordView::new(1, RecordAddr::INVALID, props)
    }

    #[test]
    fn test_eq_and_comparisons() {
        let props = vec![(1u32, Value::Int32(30)), (2u32, Value::String("a".into()))];
        let rec = record(&props);

        assert!(Evaluator::evaluate(
            &PredicateExpr::Eq { prop: 1, value: Value::Int32(30) },
            &rec
        ));
        assert!(!Evaluator::evaluate(
            &PredicateExpr::Eq { prop: 1, value: Value::Int32(31) },
            &rec
        ));
        assert!(Evaluator::evaluate(
            &PredicateExpr::Gt { prop: 1, value: Value::Int32(10) },
            &rec
        ));
        assert!(Evaluator::evaluate(
            &PredicateExpr::Le { prop: 1, value: Value::Int32(30) },
            &rec
        ));
    }

    #[test]
    fn test_missing_property_never_matches_positive_preds() {
        let props = vec![(1u32, Value::Int32(5))];
        let rec = record(&props);

        assert!(!Evaluator::evaluate(
            &PredicateExpr::Eq { prop: 9, value: Value::Int32(5) },
            &rec
        ));
        assert!(!Evaluator::evaluate(
            &PredicateExpr::Ne { prop: 9, value: Value::Int32(5) },
            &rec
        ));
        // Absence satisfies the negated forms.
        assert!(Evaluator::evaluate(
            &PredicateExpr::NotIn { prop: 9, values: vec![Value::Int32(5)] },
            &rec
        ));
        assert!(Evaluator::evaluate(&PredicateExpr::NotExists { prop: 9 }, &rec));
    }

    #[test]
    fn test_numeric_coercion() {
        let props = vec![(1u32, Value::Int64(100))];
        let rec = record(&props);
        assert!(Evaluator::evaluate(
            &PredicateExpr::Eq { prop: 1, value: Value::Int32(100) },
            &rec
        ));
        assert!(Evaluator::evaluate(
            &PredicateExpr::Gt { prop: 1, value: Value::Int32(50) },
            &rec
        ));
    }

    #[test]
    fn test_and_or() {
        let props = vec![(1u32, Value::Int32(25)), (2u32, Value::Bool(true))];
        let rec = record(&props);

        assert!(Evaluator::evaluate(
            &PredicateExpr::And(vec![
                SimplePredicate::Gt { prop: 1, value: Value::Int32(18) },
                SimplePredicate::Eq { prop: 2, value: Value::Bool(true) },
            ]),
            &rec
        ));
        assert!(!Evaluator::evaluate(
            &PredicateExpr::And(vec![
                SimplePredicate::Gt { prop: 1, value: Value::Int32(30) },
                SimplePredicate::Eq { prop: 2, value: Value::Bool(true) },
            ]),
            &rec
        ));
        assert!(Evaluator::evaluate(
            &PredicateExpr::Or(vec![
                SimplePredicate::Gt { prop: 1, value: Value::Int32(30) },
                SimplePredicate::Exists { prop: 2 },
            ]),
            &rec
        ));
        // Empty And is true, empty Or is false.
        assert!(Evaluator::evaluate(&PredicateExpr::And(vec![]), &rec));
        assert!(!Evaluator::evaluate(&PredicateExpr::Or(vec![]), &rec));
    }

    #[test]
    fn test_like() {
        let props = vec![(1u32, Value::String("alice@example.com".into()))];
        let rec = record(&props);
        assert!(Evaluator::evaluate(
            &PredicateExpr::Like { prop: 1, pattern: "alice%".into() },
            &rec
        ));
        assert!(Evaluator::evaluate(
            &PredicateExpr::Like { prop: 1, pattern: "%@%".into() },
            &rec
        ));
        assert!(!Evaluator::evaluate(
            &PredicateExpr::Like { prop: 1, pattern: "bob%".into() },
            &rec
        ));
        assert!(Evaluator::like_match("100%", "100\\%"));
        assert!(Evaluator::like_match("A1B", "A_B"));
    }

    #[test]
    fn test_index_properties_conjunction() {
        let expr = PredicateExpr::And(vec![
            SimplePredicate::Gt { prop: 5, value: Value::Int32(1) },
            SimplePredicate::Eq { prop: 2, value: Value::Bool(true) },
            SimplePredicate::NotExists { prop: 9 },
            SimplePredicate::Eq { prop: 5, value: Value::Int32(3) },
        ]);
        // Sorted, deduped, without the NotExists property.
        assert_eq!(index_properties(&expr), vec![2, 5]);
    }

    #[test]
    fn test_index_properties_disjunction() {
        // Both branches require prop 3 -> necessary.
        let expr = PredicateExpr::Or(vec![
            SimplePredicate::Gt { prop: 3, value: Value::Int32(1) },
            SimplePredicate::Lt { prop: 3, value: Value::Int32(-1) },
        ]);
        assert_eq!(index_properties(&expr), vec![3]);

        // Branches diverge -> nothing is necessary.
        let expr = PredicateExpr::Or(vec![
            SimplePredicate::Gt { prop: 3, value: Value::Int32(1) },
            SimplePredicate::Exists { prop: 4 },
        ]);
        assert!(index_properties(&expr).is_empty());

        // A NotIn branch is satisfiable by absence -> nothing is necessary.
        let expr = PredicateExpr::Or(vec![
            SimplePredicate::Gt { prop: 3, value: Value::Int32(1) },
            SimplePredicate::NotIn { prop: 3, values: vec![Value::Int32(0)] },
        ]);
        assert!(index_properties(&expr).is_empty());
    }

    #[test]
    fn test_index_properties_any_of() {
        let a = PredicateExpr::And(vec![
            SimplePredicate::Exists { prop: 1 },
            SimplePredicate::Exists { prop: 2 },
        ]);
        let b = PredicateExpr::And(vec![
            SimplePredicate::Exists { prop: 2 },
            SimplePredicate::Exists { prop: 3 },
        ]);
        assert_eq!(index_properties_any_of(&[a, b]), vec![2]);
        assert!(index_properties_any_of(&[]).is_empty());
    }
}
