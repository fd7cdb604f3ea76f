//! Property tests for the transform rules.

use logos_sync::document::Document;
use logos_sync::ot::{transform, TransformOutcome};
use logos_sync::Change;
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
struct Edit {
    kind: u8,
    offset: usize,
    length: usize,
    text: String,
    timestamp: u64,
}

fn edit() -> impl Strategy<Value = Edit> {
    (0u8..3, any::<usize>(), any::<usize>(), "[xyz]{1,3}", 0u64..3).prop_map(
        |(kind, offset, length, text, timestamp)| Edit {
            kind,
            offset,
            length,
            text,
            timestamp,
        },
    )
}

/// Fit an arbitrary edit onto a text of `len` chars.
fn build(author: &str, edit: &Edit, len: usize) -> Change {
    let offset = edit.offset % (len + 1);
    let length = edit.length % (len - offset + 1);
    let change = match edit.kind {
        0 => Change::insert(author, 0, "body", offset, edit.text.clone()),
        1 => Change::delete_range(author, 0, "body", offset, length),
        _ => Change::replace_range(author, 0, "body", offset, length, edit.text.clone()),
    };
    change.with_timestamp(edit.timestamp)
}

fn seeded(text: &str) -> Document {
    let mut doc = Document::new();
    doc.apply(&Change::insert("seed", 0, "body", 0, text)).unwrap();
    doc
}

fn both_orders(base: &Document, a: &Change, b: &Change, a2: &Change, b2: &Change) -> (Document, Document) {
    let mut left = base.clone();
    left.apply(a).unwrap();
    left.apply(b2).unwrap();
    let mut right = base.clone();
    right.apply(b).unwrap();
    right.apply(a2).unwrap();
    (left, right)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_text_edits_converge(seed in "[a-z]{1,12}", ea in edit(), eb in edit()) {
        let len = seed.chars().count();
        let a = build("alice", &ea, len);
        let b = build("bob", &eb, len);
        let base = seeded(&seed);

        match (transform(&a, &b), transform(&b, &a)) {
            (TransformOutcome::Transformed(a2), TransformOutcome::Transformed(b2)) => {
                prop_assert_eq!(a2.base_version, 1);
                let (left, right) = both_orders(&base, &a, &b, &a2, &b2);
                prop_assert_eq!(left.text("body"), right.text("body"));
            }
            (TransformOutcome::Irreconcilable(x), TransformOutcome::Irreconcilable(y)) => {
                prop_assert_eq!(x, y);
            }
            (x, y) => prop_assert!(false, "one-sided conflict: {:?} / {:?}", x, y),
        }
    }

    #[test]
    fn prop_field_modifies_converge_or_conflict(x in 0i64..3, y in 0i64..3) {
        let a = Change::modify("alice", 0, "meta", json!({"n": x}));
        let b = Change::modify("bob", 0, "meta", json!({"n": y}));
        let base = Document::new();

        match (transform(&a, &b), transform(&b, &a)) {
            (TransformOutcome::Transformed(a2), TransformOutcome::Transformed(b2)) => {
                prop_assert_eq!(x, y);
                let (left, right) = both_orders(&base, &a, &b, &a2, &b2);
                prop_assert_eq!(left, right);
            }
            (TransformOutcome::Irreconcilable(_), TransformOutcome::Irreconcilable(_)) => {
                prop_assert_ne!(x, y);
            }
            (x, y) => prop_assert!(false, "one-sided conflict: {:?} / {:?}", x, y),
        }
    }

    #[test]
    fn prop_edits_on_other_paths_pass_through(seed in "[a-z]{1,12}", ea in edit(), v in 0i64..100) {
        let a = build("alice", &ea, seed.chars().count());
        let b = Change::modify("bob", 0, "meta", json!(v));
        let TransformOutcome::Transformed(a2) = transform(&a, &b) else {
            return Err(TestCaseError::fail("different paths never conflict"));
        };
        prop_assert_eq!(&a2.target, &a.target);
        prop_assert_eq!(a2.base_version, a.base_version + 1);
    }
}
