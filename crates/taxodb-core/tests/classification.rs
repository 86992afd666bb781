//! End-to-end classification and indexing tests over a temp store.

use taxodb_core::{
    ClassState, ClassificationResult, Classifier, Condition, IndexOp, MemoryRecordSource,
    OwnedRecord, PropertyDelta, Session, CLASS_DISABLED,
};
use taxodb_proto::{PredicateExpr, PropertyId, RecordAddr, RecordView, SimplePredicate, Value};

const P1: PropertyId = 10;
const P2: PropertyId = 20;
const P3: PropertyId = 30;

fn open_classifier(dir: &std::path::Path) -> Classifier {
    Classifier::open(dir).unwrap()
}

fn record(props: &[(PropertyId, Value)]) -> Vec<(PropertyId, Value)> {
    props.to_vec()
}

fn classify_one(clf: &Classifier, id: u64, props: &[(PropertyId, Value)]) -> ClassificationResult {
    let view = RecordView::new(id, RecordAddr::INVALID, props);
    let mut result = ClassificationResult::new();
    clf.classify(&view, &mut result).unwrap();
    result
}

/// Register a class and commit it in a one-shot transaction.
fn register(clf: &Classifier, name: &str, condition: Condition) -> taxodb_core::ClassId {
    let mut session = Session::new();
    let id = clf.add_class(&mut session, name, condition, 0).unwrap();
    clf.class_tx(&mut session, true).unwrap();
    id
}

#[test]
fn scenario_a_indexed_value_predicate() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k1 = register(
        &clf,
        "k1",
        Condition::Single(PredicateExpr::Gt {
            prop: P1,
            value: Value::Int32(10),
        }),
    );

    // Value below the threshold: candidate, but not confirmed.
    let low = record(&[(P1, Value::Int32(5))]);
    assert!(classify_one(&clf, 1, &low).is_empty());

    // Value above the threshold: one match, one posting after commit.
    let high = record(&[(P1, Value::Int32(20))]);
    let result = classify_one(&clf, 2, &high);
    assert_eq!(result.len(), 1);
    assert!(result.contains(k1));
    assert_eq!(result.n_indexed(), 1);

    let mut session = Session::new();
    let view = RecordView::new(2, RecordAddr::INVALID, &high);
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();

    let members = clf.class_members(k1).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].record, 2);
    assert!(!members[0].soft_deleted);
}

#[test]
fn scenario_b_escape_class() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    // `P2 == "x"`, registered without index properties: the class is
    // evaluated against every record.
    let mut session = Session::new();
    let k2 = clf
        .add_unindexed_class(
            &mut session,
            "k2",
            Condition::Single(PredicateExpr::Eq {
                prop: P2,
                value: Value::String("x".into()),
            }),
            0,
        )
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    assert!(clf.get_class(k2).unwrap().index_props().is_empty());

    // Records lacking P2 do not match, empty records included...
    assert!(classify_one(&clf, 1, &record(&[(P3, Value::Bool(true))])).is_empty());
    assert!(classify_one(&clf, 2, &record(&[])).is_empty());

    // ...but the class was evaluated: P2 == "x" matches even though the
    // trie has nothing to narrow on.
    let with_p2 = record(&[(P2, Value::String("x".into())), (P3, Value::Bool(true))]);
    assert!(classify_one(&clf, 3, &with_p2).contains(k2));

    // And the wrong value is confirmed away.
    let wrong = record(&[(P2, Value::String("y".into()))]);
    assert!(classify_one(&clf, 4, &wrong).is_empty());
}

#[test]
fn scenario_c_create_then_drop_in_one_tx() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let mut session = Session::new();
    let k3 = clf
        .add_class(
            &mut session,
            "k3",
            Condition::Single(PredicateExpr::Exists { prop: P1 }),
            0,
        )
        .unwrap();
    clf.drop_class(&mut session, k3).unwrap();
    clf.class_tx(&mut session, true).unwrap();

    assert!(matches!(
        clf.get_class(k3),
        Err(taxodb_core::Error::NotFound)
    ));
    assert_eq!(clf.class_count(), 0);
}

#[test]
fn rollback_leaves_live_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let keep = register(
        &clf,
        "keep",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );
    assert_eq!(clf.class_count(), 1);

    // An aborted create leaves no trace.
    let mut session = Session::new();
    let ephemeral = clf
        .add_class(
            &mut session,
            "ephemeral",
            Condition::Single(PredicateExpr::Exists { prop: P2 }),
            0,
        )
        .unwrap();
    clf.class_tx(&mut session, false).unwrap();
    assert_eq!(clf.class_count(), 1);
    assert!(clf.get_class(ephemeral).is_err());

    // An aborted drop restores the class to classification.
    let mut session = Session::new();
    clf.drop_class(&mut session, keep).unwrap();
    let mid = classify_one(&clf, 1, &record(&[(P1, Value::Int32(1))]));
    assert!(mid.is_empty(), "pending-delete class must not match");
    clf.class_tx(&mut session, false).unwrap();

    let restored = classify_one(&clf, 1, &record(&[(P1, Value::Int32(1))]));
    assert!(restored.contains(keep));
    assert_eq!(clf.get_class(keep).unwrap().state(), ClassState::Active);
}

#[test]
fn scenario_d_bulk_matches_single_record_classification() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let even = register(
        &clf,
        "even",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );
    let big = register(
        &clf,
        "big",
        Condition::Single(PredicateExpr::Ge {
            prop: P2,
            value: Value::Int32(2000),
        }),
    );

    // 2500 records: evens carry P1, all carry P2 = their id.
    let records: Vec<OwnedRecord> = (0..2500u64)
        .map(|id| {
            let mut props = Vec::new();
            if id % 2 == 0 {
                props.push((P1, Value::Bool(true)));
            }
            props.push((P2, Value::Int32(id as i32)));
            OwnedRecord {
                id,
                addr: RecordAddr::INVALID,
                props,
            }
        })
        .collect();

    // Per-record classification as the reference.
    let mut expect_even = 0u64;
    let mut expect_big = 0u64;
    for rec in &records {
        let result = classify_one(&clf, rec.id, &rec.props);
        if result.contains(even) {
            expect_even += 1;
        }
        if result.contains(big) {
            expect_big += 1;
        }
    }
    assert_eq!(expect_even, 1250);
    assert_eq!(expect_big, 500);

    // Bulk classification in batches of 1000 produces identical membership.
    let mut session = Session::new();
    let mut source = MemoryRecordSource::new(records);
    let total = clf.classify_all(&mut source, &mut session, false).unwrap();
    assert_eq!(total, 2500);
    clf.class_tx(&mut session, true).unwrap();

    assert_eq!(clf.class_members(even).unwrap().len() as u64, expect_even);
    assert_eq!(clf.class_members(big).unwrap().len() as u64, expect_big);
}

#[test]
fn idempotent_delete_and_coalesced_double_insert() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "k",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );

    let props = record(&[(P1, Value::Int32(1))]);
    let view = RecordView::new(7, RecordAddr::INVALID, &props);
    let result = classify_one(&clf, 7, &props);

    // DELETE with no prior posting: a no-op, not an error.
    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Delete, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    assert!(clf.class_members(k).unwrap().is_empty());

    // Two INSERTs for the same (record, class, key): one posting.
    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    assert_eq!(clf.class_members(k).unwrap().len(), 1);
}

#[test]
fn soft_delete_undelete_purge() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "k",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );
    let props = record(&[(P1, Value::Int32(1))]);
    let view = RecordView::new(5, RecordAddr::INVALID, &props);
    let result = classify_one(&clf, 5, &props);

    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();

    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::SoftDelete, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    let (_, live, soft) = clf.get_class_info(k).unwrap();
    assert_eq!((live, soft), (0, 1));

    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Undelete, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    let (_, live, soft) = clf.get_class_info(k).unwrap();
    assert_eq!((live, soft), (1, 0));

    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Purge, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    let (_, live, soft) = clf.get_class_info(k).unwrap();
    assert_eq!((live, soft), (0, 0));
}

#[test]
fn update_moves_posting_to_new_key() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "k",
        Condition::Single(PredicateExpr::Gt {
            prop: P1,
            value: Value::Int32(0),
        }),
    );

    let before = record(&[(P1, Value::Int32(20))]);
    let view = RecordView::new(1, RecordAddr::INVALID, &before);
    let result = classify_one(&clf, 1, &before);
    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();

    // The record's P1 changes 20 -> 30; its posting must move keys.
    let after = record(&[(P1, Value::Int32(30))]);
    let view = RecordView::new(1, RecordAddr::INVALID, &after);
    let result = classify_one(&clf, 1, &after);
    let deltas = [PropertyDelta {
        prop: P1,
        old: Some(Value::Int32(20)),
        new: Some(Value::Int32(30)),
    }];
    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Update, &deltas)
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();

    assert!(clf
        .class_members_at(k, &[&Value::Int32(20)])
        .unwrap()
        .is_empty());
    let moved = clf.class_members_at(k, &[&Value::Int32(30)]).unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].record, 1);
}

#[test]
fn index_params_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "k",
        Condition::Single(PredicateExpr::And(vec![
            SimplePredicate::Exists { prop: P1 },
            SimplePredicate::Exists { prop: P2 },
        ])),
    );

    let props = record(&[(P1, Value::Int32(1)), (P2, Value::Int32(2))]);
    let view = RecordView::new(42, RecordAddr::INVALID, &props);
    let result = classify_one(&clf, 42, &props);
    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();

    // Persist the parameter block, reconnect, and compare membership.
    let params = clf.index_params(k).unwrap();
    let decoded = taxodb_core::IndexParams::decode(&params.encode()).unwrap();
    assert_eq!(decoded, params);

    let reconnected = clf.connect_index(decoded);
    let guard = clf.lock_shared();
    let scanned = reconnected.scan_all(&guard.token()).unwrap();
    drop(guard);
    assert_eq!(scanned, clf.class_members(k).unwrap());
}

#[test]
fn restart_rehydrates_classes_and_membership() {
    let dir = tempfile::tempdir().unwrap();

    let k = {
        let clf = open_classifier(dir.path());
        let k = register(
            &clf,
            "durable",
            Condition::Single(PredicateExpr::Exists { prop: P1 }),
        );
        let props = record(&[(P1, Value::Int32(1))]);
        let view = RecordView::new(3, RecordAddr::INVALID, &props);
        let result = classify_one(&clf, 3, &props);
        let mut session = Session::new();
        clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
            .unwrap();
        clf.class_tx(&mut session, true).unwrap();
        k
    };

    // Reopen: trie, descriptors, and membership come back from disk.
    let clf = open_classifier(dir.path());
    assert_eq!(clf.class_count(), 1);
    let desc = clf.get_class(k).unwrap();
    assert_eq!(desc.name(), "durable");

    let result = classify_one(&clf, 9, &record(&[(P1, Value::Int32(5))]));
    assert!(result.contains(k));

    let members = clf.class_members(k).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].record, 3);

    // Ids keep ascending after restart.
    let next = register(
        &clf,
        "later",
        Condition::Single(PredicateExpr::Exists { prop: P2 }),
    );
    assert!(next > k);
}

#[test]
fn escape_class_membership_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "escape",
        Condition::Single(PredicateExpr::NotExists { prop: P3 }),
    );

    let props = record(&[(P1, Value::Int32(1))]);
    let view = RecordView::new(11, RecordAddr::INVALID, &props);
    let result = classify_one(&clf, 11, &props);
    assert!(result.contains(k));
    assert_eq!(result.n_indexed(), 0);

    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();

    let members = clf.class_members(k).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].record, 11);

    let (_, live, soft) = clf.get_class_info(k).unwrap();
    assert_eq!((live, soft), (1, 0));
}

#[test]
fn disabled_class_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "toggle",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );
    let props = record(&[(P1, Value::Int32(1))]);
    assert!(classify_one(&clf, 1, &props).contains(k));

    clf.set_flags(k, CLASS_DISABLED, 0).unwrap();
    assert!(classify_one(&clf, 1, &props).is_empty());

    clf.set_flags(k, 0, CLASS_DISABLED).unwrap();
    assert!(classify_one(&clf, 1, &props).contains(k));
}

#[test]
fn drop_class_releases_membership() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    let k = register(
        &clf,
        "doomed",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );
    let props = record(&[(P1, Value::Int32(1))]);
    let view = RecordView::new(8, RecordAddr::INVALID, &props);
    let result = classify_one(&clf, 8, &props);
    let mut session = Session::new();
    clf.index(&mut session, &view, &result, IndexOp::Insert, &[])
        .unwrap();
    clf.class_tx(&mut session, true).unwrap();
    assert_eq!(clf.class_members(k).unwrap().len(), 1);

    clf.remove(k).unwrap();
    assert!(clf.get_class(k).is_err());
    assert_eq!(clf.class_count(), 0);
    assert!(classify_one(&clf, 8, &props).is_empty());
}

#[test]
fn restore_max_property_id_from_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let clf = open_classifier(dir.path());

    register(
        &clf,
        "a",
        Condition::Single(PredicateExpr::Exists { prop: P1 }),
    );
    register(
        &clf,
        "b",
        Condition::Single(PredicateExpr::And(vec![
            SimplePredicate::Exists { prop: P2 },
            SimplePredicate::NotExists { prop: P3 },
        ])),
    );

    assert_eq!(clf.restore_max_property_id().unwrap(), P3);
    assert_eq!(clf.max_property_id(), P3);
}
