//! The document value type.
//!
//! This module defines [`Document`], the unit of persisted state in the
//! pipeline, and [`DocumentPatch`], the partial-update shape accepted by
//! the store's `update` operation.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Media type assigned to documents that don't declare one.
pub const DEFAULT_MEDIA_TYPE: &str = "text/plain";

fn default_media_type() -> String {
    DEFAULT_MEDIA_TYPE.to_string()
}

/// A document moving through the processing pipeline.
///
/// A document has a stable unique id, a state naming a vertex of the
/// pipeline's state machine, optional content, and lineage pointers to its
/// parent and children. Transitions never mutate an existing document;
/// they produce new ones, so `id`, `parent_id`, and `state` are fixed once
/// a document has been persisted.
///
/// The `children` list is derived by the persistence layer from the
/// `parent_id` pointers of other documents; it is populated on reads and
/// ignored on writes.
///
/// # Example
///
/// ```
/// use millrace::Document;
/// use serde_json::json;
///
/// let doc = Document::new("download")
///     .with_url("https://example.com/report.pdf")
///     .with_metadata("source", json!("crawler"));
///
/// assert!(doc.is_root());
/// assert!(!doc.has_children());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable unique identifier (UUID v4 text), generated at construction.
    pub id: String,

    /// Name of the state-machine vertex this document sits at. Empty only
    /// for drafts produced inside processing functions; the engine stamps
    /// the transition's target state before persisting.
    #[serde(default)]
    pub state: String,

    /// Optional content. Treated as opaque UTF-8; callers may encode
    /// binary payloads into it.
    #[serde(default)]
    pub content: Option<String>,

    /// Media type of the content.
    #[serde(default = "default_media_type")]
    pub media_type: String,

    /// Optional source URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Id of the document this one was produced from; `None` for roots.
    #[serde(default)]
    pub parent_id: Option<String>,

    /// Ids of documents produced from this one, in creation order.
    /// Derived on read; never authoritative.
    #[serde(default)]
    pub children: Vec<String>,

    /// Free-form metadata carried alongside the document.
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl Document {
    /// Creates a new root document in the given state with a generated id.
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: state.into(),
            content: None,
            media_type: default_media_type(),
            url: None,
            parent_id: None,
            children: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a draft document with no state, for use inside processing
    /// functions.
    ///
    /// The engine fills in the state of a draft with the target state of
    /// the transition that produced it, and stamps the parent id, before
    /// persisting.
    pub fn draft() -> Self {
        Self::new("")
    }

    /// Replaces the generated id with a caller-supplied one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Sets the media type.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    /// Sets the source URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the parent pointer.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Inserts a single metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if this document has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns true if this document has child documents.
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Appends a child id, ignoring duplicates.
    pub fn add_child(&mut self, child_id: impl Into<String>) {
        let child_id = child_id.into();
        if !self.children.contains(&child_id) {
            self.children.push(child_id);
        }
    }

    /// Appends multiple child ids, preserving order and ignoring ids
    /// already present.
    pub fn add_children<I, S>(&mut self, child_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for child_id in child_ids {
            self.add_child(child_id);
        }
    }
}

/// A partial update applied to a persisted document.
///
/// Only metadata entries (merged key-by-key) and child links (appended,
/// idempotently) can be patched. `id`, `parent_id`, and `state` have no
/// representation here and therefore cannot be rewritten.
///
/// # Example
///
/// ```
/// use millrace::DocumentPatch;
/// use serde_json::json;
///
/// let patch = DocumentPatch::new()
///     .metadata("reviewed", json!(true))
///     .metadata("score", json!(0.87));
/// assert!(!patch.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    /// Metadata entries to merge into the document's metadata.
    pub metadata: HashMap<String, JsonValue>,

    /// Ids of existing documents to link as children.
    pub children: Vec<String>,
}

impl DocumentPatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metadata entry to merge.
    pub fn metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds a child id to link.
    pub fn child(mut self, child_id: impl Into<String>) -> Self {
        self.children.push(child_id.into());
        self
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_generates_unique_ids() {
        let a = Document::new("start");
        let b = Document::new("start");
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn test_new_defaults() {
        let doc = Document::new("start");
        assert_eq!(doc.state, "start");
        assert_eq!(doc.media_type, DEFAULT_MEDIA_TYPE);
        assert!(doc.content.is_none());
        assert!(doc.url.is_none());
        assert!(doc.parent_id.is_none());
        assert!(doc.children.is_empty());
        assert!(doc.metadata.is_empty());
    }

    #[test]
    fn test_builder_methods() {
        let doc = Document::new("chunk")
            .with_id("doc-1")
            .with_content("hello")
            .with_media_type("application/pdf")
            .with_url("https://example.com")
            .with_parent_id("doc-0")
            .with_metadata("step", json!(2));

        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.content.as_deref(), Some("hello"));
        assert_eq!(doc.media_type, "application/pdf");
        assert_eq!(doc.url.as_deref(), Some("https://example.com"));
        assert_eq!(doc.parent_id.as_deref(), Some("doc-0"));
        assert_eq!(doc.metadata.get("step"), Some(&json!(2)));
    }

    #[test]
    fn test_draft_has_empty_state() {
        let doc = Document::draft();
        assert!(doc.state.is_empty());
        assert!(!doc.id.is_empty());
    }

    #[test]
    fn test_is_root() {
        let root = Document::new("start");
        assert!(root.is_root());

        let child = Document::new("next").with_parent_id(&root.id);
        assert!(!child.is_root());
    }

    #[test]
    fn test_add_child_deduplicates() {
        let mut doc = Document::new("start");
        doc.add_child("c1");
        doc.add_child("c2");
        doc.add_child("c1");
        assert_eq!(doc.children, vec!["c1", "c2"]);
        assert!(doc.has_children());
    }

    #[test]
    fn test_add_children_preserves_order() {
        let mut doc = Document::new("start");
        doc.add_child("c1");
        doc.add_children(["c2", "c1", "c3"]);
        assert_eq!(doc.children, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_serialize_round_trip() {
        let original = Document::new("start")
            .with_id("doc-rt")
            .with_content("body")
            .with_metadata("k", json!("v"));
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let json = r#"{"id":"doc-min","state":"start"}"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(doc.media_type, DEFAULT_MEDIA_TYPE);
        assert!(doc.children.is_empty());
        assert!(doc.metadata.is_empty());
    }

    #[test]
    fn test_wire_format_children_as_array() {
        let mut doc = Document::new("start").with_id("doc-w");
        doc.add_children(["a", "b"]);
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["children"], json!(["a", "b"]));
        assert_eq!(value["id"], json!("doc-w"));
    }

    #[test]
    fn test_patch_empty() {
        assert!(DocumentPatch::new().is_empty());
        assert!(!DocumentPatch::new().metadata("k", json!(1)).is_empty());
        assert!(!DocumentPatch::new().child("c1").is_empty());
    }
}
