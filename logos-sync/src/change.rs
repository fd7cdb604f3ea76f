//! The atomic unit of collaboration: an immutable [`Change`].
//!
//! ```text
//! ┌──────────┬────────┬──────────────┬────────┬─────────────────────┬──────────┬───────────┐
//! │ id       │ author │ base_version │ op     │ target (path, span) │ payload  │ timestamp │
//! │ 16 bytes │ utf-8  │ u64          │ 1 byte │ path + char range   │ variable │ u64 (ms)  │
//! └──────────┴────────┴──────────────┴────────┴─────────────────────┴──────────┴───────────┘
//! ```
//!
//! A change with a `span` edits the text held at `path` (sequence content);
//! a change without one addresses the whole node (structured field).
//! Transforms never mutate a change in place; they produce a new value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::SystemTime;
use uuid::Uuid;

use crate::conflict::ResolutionRecord;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Globally unique change identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(pub Uuid);

impl ChangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Edit kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationType {
    Insert = 1,
    Delete = 2,
    Modify = 3,
    Replace = 4,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Modify => "modify",
            OperationType::Replace => "replace",
        }
    }
}

/// Character range inside a text node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub offset: usize,
    pub length: usize,
}

impl Span {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// Saturates; validated changes never reach the bound.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.length)
    }
}

/// What a change touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// `/`-separated node path, e.g. `body` or `meta/title`
    pub path: String,
    /// `Some` for sequence edits, `None` for whole-node edits
    pub span: Option<Span>,
}

impl Target {
    /// Whole-node target.
    pub fn node(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            span: None,
        }
    }

    /// Character-range target.
    pub fn range(path: impl Into<String>, offset: usize, length: usize) -> Self {
        Self {
            path: path.into(),
            span: Some(Span::new(offset, length)),
        }
    }

    pub fn is_ranged(&self) -> bool {
        self.span.is_some()
    }
}

/// Change payload.
///
/// Structured values travel as JSON text inside binary encodings because
/// `serde_json::Value` cannot be decoded by non-self-describing formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Text(String),
    Value(#[serde(with = "json_text")] serde_json::Value),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Length in chars of a text payload, 0 otherwise.
    pub fn char_len(&self) -> usize {
        self.as_text().map(|s| s.chars().count()).unwrap_or(0)
    }

    fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Text(_) => "text",
            Payload::Value(_) => "value",
        }
    }
}

mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Where a change entered the engine. Origin-preferring strategies key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
    Server,
}

/// An atomic, immutable edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub author: String,
    /// Branch version the author observed when creating the change
    pub base_version: u64,
    pub op: OperationType,
    pub target: Target,
    pub payload: Payload,
    /// Authoring time (ms since epoch)
    pub timestamp: u64,
    pub origin: Origin,
    /// Changes that must be in the log before this one applies
    pub depends_on: Vec<ChangeId>,
    /// For copies made while merging branches: the change this one derives from
    pub lineage: Option<ChangeId>,
    /// Set on synthetic changes that record a conflict resolution
    pub resolves: Option<ResolutionRecord>,
}

impl Change {
    pub fn new(
        author: impl Into<String>,
        base_version: u64,
        op: OperationType,
        target: Target,
        payload: Payload,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            author: author.into(),
            base_version,
            op,
            target,
            payload,
            timestamp: now_millis(),
            origin: Origin::Local,
            depends_on: Vec::new(),
            lineage: None,
            resolves: None,
        }
    }

    /// Insert `text` at char `offset` of the text node at `path`.
    pub fn insert(
        author: impl Into<String>,
        base_version: u64,
        path: impl Into<String>,
        offset: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            author,
            base_version,
            OperationType::Insert,
            Target::range(path, offset, 0),
            Payload::Text(text.into()),
        )
    }

    /// Remove `length` chars starting at `offset`.
    pub fn delete_range(
        author: impl Into<String>,
        base_version: u64,
        path: impl Into<String>,
        offset: usize,
        length: usize,
    ) -> Self {
        Self::new(
            author,
            base_version,
            OperationType::Delete,
            Target::range(path, offset, length),
            Payload::Empty,
        )
    }

    /// Replace `length` chars at `offset` with `text`.
    pub fn replace_range(
        author: impl Into<String>,
        base_version: u64,
        path: impl Into<String>,
        offset: usize,
        length: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            author,
            base_version,
            OperationType::Replace,
            Target::range(path, offset, length),
            Payload::Text(text.into()),
        )
    }

    /// Set a structured field.
    pub fn modify(
        author: impl Into<String>,
        base_version: u64,
        path: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self::new(
            author,
            base_version,
            OperationType::Modify,
            Target::node(path),
            Payload::Value(value),
        )
    }

    /// Remove a whole node.
    pub fn delete_node(
        author: impl Into<String>,
        base_version: u64,
        path: impl Into<String>,
    ) -> Self {
        Self::new(
            author,
            base_version,
            OperationType::Delete,
            Target::node(path),
            Payload::Empty,
        )
    }

    /// Overwrite a whole node. `Payload::Empty` removes it.
    pub fn replace_node(
        author: impl Into<String>,
        base_version: u64,
        path: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::new(
            author,
            base_version,
            OperationType::Replace,
            Target::node(path),
            payload,
        )
    }

    pub fn with_id(mut self, id: ChangeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn depending_on(mut self, ids: impl IntoIterator<Item = ChangeId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    /// Identity shared by every copy of this change across branches.
    pub fn root(&self) -> ChangeId {
        self.lineage.unwrap_or(self.id)
    }

    /// Deterministic total order: `(timestamp, author, id)`.
    pub fn order_cmp(&self, other: &Change) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.author.cmp(&other.author))
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn precedes(&self, other: &Change) -> bool {
        self.order_cmp(other) == Ordering::Less
    }

    /// Same change, moved to a new target and base. Used by transforms.
    pub fn rebased(&self, target: Target, base_version: u64) -> Change {
        Change {
            target,
            base_version,
            ..self.clone()
        }
    }

    /// `(start, removed, inserted)` for sequence edits.
    pub fn footprint(&self) -> Option<(usize, usize, usize)> {
        let span = self.target.span?;
        let inserted = match self.op {
            OperationType::Insert | OperationType::Replace => self.payload.char_len(),
            _ => 0,
        };
        Some((span.offset, span.length, inserted))
    }

    /// A sequence edit that changes nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self.footprint(), Some((_, 0, 0)))
    }

    /// Structural validation. Malformed changes never enter the log.
    pub fn validate(&self) -> Result<(), ChangeError> {
        if self.author.trim().is_empty() {
            return Err(ChangeError::MissingAuthor);
        }
        let path = &self.target.path;
        if path.is_empty() {
            return Err(ChangeError::MissingPath);
        }
        if path.split('/').any(|segment| segment.is_empty()) {
            return Err(ChangeError::InvalidPath(path.clone()));
        }
        if self.depends_on.contains(&self.id) {
            return Err(ChangeError::SelfDependency(self.id));
        }

        let span = self.target.span;
        if let Some(span) = span {
            let fits = span
                .offset
                .checked_add(span.length)
                .and_then(|end| end.checked_add(self.payload.char_len()));
            if fits.is_none() {
                return Err(ChangeError::SpanOverflow(span));
            }
        }
        match self.op {
            OperationType::Insert => {
                let span = span.ok_or(ChangeError::MissingSpan(self.op))?;
                if span.length != 0 {
                    return Err(ChangeError::InsertWithLength(span.length));
                }
                match &self.payload {
                    Payload::Text(text) if !text.is_empty() => Ok(()),
                    Payload::Text(_) => Err(ChangeError::EmptyInsert),
                    other => Err(ChangeError::PayloadMismatch {
                        op: self.op,
                        expected: "text",
                        found: other.kind(),
                    }),
                }
            }
            OperationType::Delete => match &self.payload {
                Payload::Empty => Ok(()),
                other => Err(ChangeError::PayloadMismatch {
                    op: self.op,
                    expected: "empty",
                    found: other.kind(),
                }),
            },
            OperationType::Modify => {
                if span.is_some() {
                    return Err(ChangeError::UnexpectedSpan(self.op));
                }
                match &self.payload {
                    Payload::Value(_) => Ok(()),
                    other => Err(ChangeError::PayloadMismatch {
                        op: self.op,
                        expected: "value",
                        found: other.kind(),
                    }),
                }
            }
            OperationType::Replace => match (&span, &self.payload) {
                (Some(_), Payload::Text(_)) | (None, _) => Ok(()),
                (Some(_), other) => Err(ChangeError::PayloadMismatch {
                    op: self.op,
                    expected: "text",
                    found: other.kind(),
                }),
            },
        }
    }
}

/// Validation failures (`MalformedChange`).
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeError {
    MissingAuthor,
    MissingPath,
    InvalidPath(String),
    MissingSpan(OperationType),
    UnexpectedSpan(OperationType),
    InsertWithLength(usize),
    EmptyInsert,
    PayloadMismatch {
        op: OperationType,
        expected: &'static str,
        found: &'static str,
    },
    SelfDependency(ChangeId),
    /// Range end does not fit in an index
    SpanOverflow(Span),
    /// The change id is already present in the log
    DuplicateId(ChangeId),
    /// The change does not fit the document it targets
    OutOfBounds {
        path: String,
        offset: usize,
        len: usize,
    },
    /// Sequence edit against a node that holds a structured value
    NotText(String),
}

impl std::fmt::Display for ChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeError::MissingAuthor => write!(f, "Change has no author"),
            ChangeError::MissingPath => write!(f, "Change has no target path"),
            ChangeError::InvalidPath(p) => write!(f, "Invalid target path: {p:?}"),
            ChangeError::MissingSpan(op) => write!(f, "{} requires a character range", op.as_str()),
            ChangeError::UnexpectedSpan(op) => {
                write!(f, "{} addresses a whole node and takes no range", op.as_str())
            }
            ChangeError::InsertWithLength(len) => {
                write!(f, "Insert range must be empty, got length {len}")
            }
            ChangeError::EmptyInsert => write!(f, "Insert carries no text"),
            ChangeError::PayloadMismatch { op, expected, found } => write!(
                f,
                "{} expects a {expected} payload, found {found}",
                op.as_str()
            ),
            ChangeError::SelfDependency(id) => write!(f, "Change {id} depends on itself"),
            ChangeError::SpanOverflow(span) => write!(
                f,
                "Range at {} with length {} overflows",
                span.offset, span.length
            ),
            ChangeError::DuplicateId(id) => write!(f, "Change {id} is already in the log"),
            ChangeError::OutOfBounds { path, offset, len } => write!(
                f,
                "Range at {offset} exceeds text length {len} of '{path}'"
            ),
            ChangeError::NotText(p) => write!(f, "Node '{p}' does not hold text"),
        }
    }
}

impl std::error::Error for ChangeError {}
