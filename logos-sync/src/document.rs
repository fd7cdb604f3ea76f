//! Materialized document state and the apply function changes are defined by.
//!
//! A document is an ordered map of node paths to nodes. Text nodes take
//! sequence edits addressed in chars; value nodes hold structured JSON and are
//! only ever replaced whole.
//!
//! ```text
//! "body"        -> Text("Hello, world")
//! "meta/title"  -> Value("Draft")
//! "meta/tags"   -> Value(["a", "b"])
//! ```
//!
//! Every successful [`Document::apply`] returns the inverse change, so any
//! entry of the history can later be reverted without re-reading old state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::change::{Change, ChangeError, ChangeId, OperationType, Payload, Target};

/// A single addressable node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Value(serde_json::Value),
}

impl Node {
    /// Payload that recreates this node through a whole-node replace.
    pub fn to_payload(&self) -> Payload {
        match self {
            Node::Text(s) => Payload::Text(s.clone()),
            Node::Value(v) => Payload::Value(v.clone()),
        }
    }
}

/// Lightweight summary used by tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub nodes: usize,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    nodes: BTreeMap<String, Node>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn text(&self, path: &str) -> Option<&str> {
        match self.nodes.get(path) {
            Some(Node::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn value(&self, path: &str) -> Option<&serde_json::Value> {
        match self.nodes.get(path) {
            Some(Node::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Whole-node payload for `path`; `Empty` when the node is absent.
    pub fn payload_at(&self, path: &str) -> Payload {
        self.nodes
            .get(path)
            .map(Node::to_payload)
            .unwrap_or(Payload::Empty)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply a change, returning its inverse.
    ///
    /// The document is left untouched when the change does not fit.
    pub fn apply(&mut self, change: &Change) -> Result<Change, ChangeError> {
        let path = change.target.path.as_str();
        let (op, target, payload) = match change.target.span {
            Some(span) => {
                let current = match self.nodes.get(path) {
                    Some(Node::Text(s)) => s.as_str(),
                    Some(Node::Value(_)) => return Err(ChangeError::NotText(path.to_string())),
                    None => "",
                };
                let len = current.chars().count();
                if span.end() > len {
                    return Err(ChangeError::OutOfBounds {
                        path: path.to_string(),
                        offset: span.offset,
                        len,
                    });
                }

                let start = byte_index(current, span.offset);
                let end = byte_index(current, span.end());
                let removed = current[start..end].to_string();
                let inserted = match change.op {
                    OperationType::Insert | OperationType::Replace => {
                        change.payload.as_text().unwrap_or_default()
                    }
                    OperationType::Delete => "",
                    OperationType::Modify => {
                        return Err(ChangeError::UnexpectedSpan(OperationType::Modify))
                    }
                };

                let inverse = match change.op {
                    OperationType::Insert => (
                        OperationType::Delete,
                        Target::range(path, span.offset, change.payload.char_len()),
                        Payload::Empty,
                    ),
                    OperationType::Delete if removed.is_empty() => (
                        OperationType::Delete,
                        Target::range(path, span.offset, 0),
                        Payload::Empty,
                    ),
                    OperationType::Delete => (
                        OperationType::Insert,
                        Target::range(path, span.offset, 0),
                        Payload::Text(removed),
                    ),
                    _ => (
                        OperationType::Replace,
                        Target::range(path, span.offset, inserted.chars().count()),
                        Payload::Text(removed),
                    ),
                };

                if self.nodes.contains_key(path) || !inserted.is_empty() {
                    let mut next = String::with_capacity(current.len() + inserted.len());
                    next.push_str(&current[..start]);
                    next.push_str(inserted);
                    next.push_str(&current[end..]);
                    self.nodes.insert(path.to_string(), Node::Text(next));
                }
                inverse
            }
            None => {
                let prior = match self.nodes.get(path) {
                    None => Payload::Empty,
                    Some(node) => node.to_payload(),
                };
                match (change.op, &change.payload) {
                    (OperationType::Modify, Payload::Value(v))
                    | (OperationType::Replace, Payload::Value(v)) => {
                        self.nodes.insert(path.to_string(), Node::Value(v.clone()));
                    }
                    (OperationType::Replace, Payload::Text(s)) => {
                        self.nodes.insert(path.to_string(), Node::Text(s.clone()));
                    }
                    (OperationType::Delete, _) | (OperationType::Replace, Payload::Empty) => {
                        self.nodes.remove(path);
                    }
                    (OperationType::Insert, _) => {
                        return Err(ChangeError::MissingSpan(OperationType::Insert))
                    }
                    (OperationType::Modify, _) => {
                        return Err(ChangeError::PayloadMismatch {
                            op: OperationType::Modify,
                            expected: "value",
                            found: "other",
                        })
                    }
                }
                match prior {
                    Payload::Empty => (OperationType::Delete, Target::node(path), Payload::Empty),
                    restore => (OperationType::Replace, Target::node(path), restore),
                }
            }
        };

        Ok(Change {
            id: ChangeId::new(),
            op,
            target,
            payload,
            depends_on: Vec::new(),
            lineage: None,
            resolves: None,
            ..change.clone()
        })
    }

    /// Best-effort apply: ranges are clamped to the node, and a sequence edit
    /// against a value node starts from empty text. Never fails.
    pub fn apply_lenient(&mut self, change: &Change) {
        let mut adjusted = change.clone();
        if let Some(span) = change.target.span {
            let len = match self.nodes.get(&change.target.path) {
                Some(Node::Text(s)) => s.chars().count(),
                Some(Node::Value(_)) => {
                    self.nodes.remove(&change.target.path);
                    0
                }
                None => 0,
            };
            let offset = span.offset.min(len);
            let length = span.length.min(len - offset);
            adjusted.target = Target::range(change.target.path.clone(), offset, length);
        }
        if let Err(e) = self.apply(&adjusted) {
            log::debug!("Lenient apply skipped change {}: {e}", change.id);
        }
    }

    /// SHA-256 over a canonical rendering of every node.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, node) in &self.nodes {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            match node {
                Node::Text(s) => {
                    hasher.update([1u8]);
                    hasher.update(s.as_bytes());
                }
                Node::Value(v) => {
                    hasher.update([2u8]);
                    hasher.update(v.to_string().as_bytes());
                }
            }
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            nodes: self.nodes.len(),
            digest: self.digest(),
        }
    }
}

/// Byte index of the `chars`-th char (or the end of the string).
fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with(path: &str, text: &str) -> Document {
        let mut doc = Document::new();
        doc.apply(&Change::insert("seed", 0, path, 0, text)).unwrap();
        doc
    }

    #[test]
    fn test_insert_creates_text_node() {
        let doc = doc_with("body", "Hello");
        assert_eq!(doc.text("body"), Some("Hello"));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_sequence_edits_use_char_offsets() {
        let mut doc = doc_with("body", "héllo wörld");
        doc.apply(&Change::delete_range("a", 1, "body", 1, 4)).unwrap();
        assert_eq!(doc.text("body"), Some("h wörld"));
        doc.apply(&Change::replace_range("a", 2, "body", 2, 5, "there"))
            .unwrap();
        assert_eq!(doc.text("body"), Some("h there"));
    }

    #[test]
    fn test_out_of_bounds_leaves_document_untouched() {
        let mut doc = doc_with("body", "abc");
        let before = doc.clone();
        let err = doc
            .apply(&Change::delete_range("a", 1, "body", 2, 5))
            .unwrap_err();
        assert!(matches!(err, ChangeError::OutOfBounds { len: 3, .. }));
        assert_eq!(doc, before);
    }

    #[test]
    fn test_sequence_edit_on_value_rejected() {
        let mut doc = Document::new();
        doc.apply(&Change::modify("a", 0, "n", json!(3))).unwrap();
        let err = doc.apply(&Change::insert("a", 1, "n", 0, "x")).unwrap_err();
        assert_eq!(err, ChangeError::NotText("n".into()));
    }

    #[test]
    fn test_whole_node_ops() {
        let mut doc = Document::new();
        doc.apply(&Change::modify("a", 0, "title", json!("Draft")))
            .unwrap();
        assert_eq!(doc.value("title"), Some(&json!("Draft")));

        doc.apply(&Change::replace_node("a", 1, "title", Payload::Text("T".into())))
            .unwrap();
        assert_eq!(doc.text("title"), Some("T"));

        doc.apply(&Change::delete_node("a", 2, "title")).unwrap();
        assert!(doc.get("title").is_none());

        // deleting a missing node is a no-op
        doc.apply(&Change::delete_node("a", 3, "title")).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_inverse_restores_prior_state() {
        let mut doc = doc_with("body", "Hello world");
        doc.apply(&Change::modify("a", 1, "meta", json!({"k": 1})))
            .unwrap();
        let before = doc.clone();

        let edits = vec![
            Change::insert("a", 2, "body", 5, ","),
            Change::delete_range("a", 2, "body", 0, 6),
            Change::replace_range("a", 2, "body", 6, 5, "there"),
            Change::modify("a", 2, "meta", json!({"k": 2})),
            Change::delete_node("a", 2, "meta"),
            Change::replace_node("a", 2, "fresh", Payload::Value(json!(true))),
        ];
        for edit in edits {
            let mut working = before.clone();
            let inverse = working.apply(&edit).unwrap();
            working.apply(&inverse).unwrap();
            assert_eq!(working, before, "inverse of {:?} failed", edit.op);
        }
    }

    #[test]
    fn test_lenient_apply_clamps() {
        let mut doc = doc_with("body", "abc");
        doc.apply_lenient(&Change::replace_range("a", 1, "body", 2, 10, "Z"));
        assert_eq!(doc.text("body"), Some("abZ"));

        doc.apply(&Change::modify("a", 2, "n", json!(1))).unwrap();
        doc.apply_lenient(&Change::insert("a", 3, "n", 4, "text"));
        assert_eq!(doc.text("n"), Some("text"));
    }

    #[test]
    fn test_digest_is_content_addressed() {
        let a = doc_with("body", "same");
        let b = doc_with("body", "same");
        let c = doc_with("body", "diff");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.summary().nodes, 1);
    }
}
