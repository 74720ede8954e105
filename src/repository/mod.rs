//! Document persistence for the millrace pipeline engine.
//!
//! This module provides the [`DocumentRepository`] trait, the port the
//! orchestrator speaks to, along with concrete implementations:
//!
//! - [`MemoryRepository`]: thread-safe in-memory storage for tests and
//!   development
//! - [`SqliteRepository`]: durable SQLite-backed storage (feature
//!   `sqlite`, enabled by default)
//!
//! The repository stores the flat document rows; the `children` list of a
//! [`Document`] is derived on read from the `parent_id` pointers of other
//! rows, ordered by a monotonic creation key. Because of that derivation,
//! a reader that can see a child document necessarily sees it in its
//! parent's `children`: inserting a child and linking it are one write.

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryRepository;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOptions, SqliteRepository};

use crate::{Document, DocumentPatch, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Filters for the repository's `list` operation.
///
/// Metadata filters are a conjunction of equality predicates: a document
/// matches only if every `(key, value)` pair appears in its metadata.
///
/// # Example
///
/// ```
/// use millrace::ListQuery;
/// use serde_json::json;
///
/// let query = ListQuery::state("embedded")
///     .leaf_only(true)
///     .include_content(false)
///     .metadata("source", json!("crawler"));
/// ```
#[derive(Debug, Clone)]
pub struct ListQuery {
    /// Match documents in this state.
    pub state: String,

    /// When true (the default), only documents without children match.
    pub leaf_only: bool,

    /// When false, matched documents are returned with `content: None`.
    pub include_content: bool,

    /// Metadata equality predicates, all of which must hold.
    pub metadata: HashMap<String, JsonValue>,
}

impl ListQuery {
    /// Creates a query matching documents in the given state.
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            leaf_only: true,
            include_content: true,
            metadata: HashMap::new(),
        }
    }

    /// Sets whether only leaves (documents without children) match.
    pub fn leaf_only(mut self, leaf_only: bool) -> Self {
        self.leaf_only = leaf_only;
        self
    }

    /// Sets whether content is included in the results.
    pub fn include_content(mut self, include_content: bool) -> Self {
        self.include_content = include_content;
        self
    }

    /// Adds a metadata equality predicate.
    pub fn metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if the given metadata satisfies every predicate.
    pub fn matches_metadata(&self, metadata: &HashMap<String, JsonValue>) -> bool {
        self.metadata
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// The persistence port the orchestrator drives.
///
/// All operations may suspend on I/O. Every write is durable on return.
/// Implementations must preserve the lineage invariants: a child's parent
/// exists, `children` lists are duplicate-free and creation-ordered,
/// deletion cascades to all descendants, and the parent relation is a
/// forest.
///
/// # Object Safety
///
/// This trait is object-safe; the orchestrator holds an
/// `Arc<dyn DocumentRepository>` so backends can be swapped at runtime.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Creates the schema if it does not exist. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Releases what the backend can release ahead of drop. Idempotent.
    async fn dispose(&self) -> Result<()>;

    /// Inserts one document and returns its id.
    ///
    /// # Errors
    ///
    /// [`MillraceError::Conflict`] if the id already exists;
    /// [`MillraceError::NotFound`] if `parent_id` names a missing document.
    ///
    /// [`MillraceError::Conflict`]: crate::MillraceError::Conflict
    /// [`MillraceError::NotFound`]: crate::MillraceError::NotFound
    async fn insert(&self, doc: &Document) -> Result<String>;

    /// Inserts several documents in one transaction, all or nothing.
    /// Returns their ids in input order.
    async fn insert_many(&self, docs: &[Document]) -> Result<Vec<String>>;

    /// Inserts the children produced by one hop in one transaction.
    ///
    /// Verifies the parent exists and inserts the child rows (whose
    /// `parent_id` must already point at the parent). Readers observe the
    /// insert and the lineage link atomically.
    async fn insert_children(&self, parent_id: &str, docs: &[Document]) -> Result<Vec<String>>;

    /// Fetches a document by id, or `None` if absent.
    async fn get(&self, id: &str, include_content: bool) -> Result<Option<Document>>;

    /// Fetches all documents in the given state, in creation order.
    async fn get_by_state(&self, state: &str, include_content: bool) -> Result<Vec<Document>>;

    /// Fetches every document, in creation order.
    async fn get_all(&self, include_content: bool) -> Result<Vec<Document>>;

    /// Fetches several documents in one round trip. Results follow the
    /// input order; missing ids are omitted.
    async fn get_batch(&self, ids: &[String]) -> Result<Vec<Document>>;

    /// Fetches documents matching the query filters.
    async fn list(&self, query: &ListQuery) -> Result<Vec<Document>>;

    /// Applies a partial update and returns the updated document.
    ///
    /// # Errors
    ///
    /// [`MillraceError::NotFound`] if the document does not exist.
    ///
    /// [`MillraceError::NotFound`]: crate::MillraceError::NotFound
    async fn update(&self, id: &str, patch: &DocumentPatch) -> Result<Document>;

    /// Links existing documents as children of `parent_id`, idempotently
    /// and in one transaction.
    ///
    /// A child already linked to this parent is a no-op. Linking a child
    /// that belongs to a different parent is a conflict: the parent
    /// relation is write-once.
    async fn append_children(&self, parent_id: &str, child_ids: &[String]) -> Result<()>;

    /// Deletes a document and all of its transitive descendants.
    ///
    /// # Errors
    ///
    /// [`MillraceError::NotFound`] if the document does not exist.
    ///
    /// [`MillraceError::NotFound`]: crate::MillraceError::NotFound
    async fn delete(&self, id: &str) -> Result<()>;

    /// Counts documents, optionally restricted to one state.
    async fn count(&self, state: Option<&str>) -> Result<u64>;

    /// Returns the content length in characters, or `None` when the
    /// document's content is null.
    ///
    /// # Errors
    ///
    /// [`MillraceError::NotFound`] if the document does not exist.
    ///
    /// [`MillraceError::NotFound`]: crate::MillraceError::NotFound
    async fn content_length(&self, id: &str) -> Result<Option<u64>>;

    /// Returns up to `max_chars` characters of content starting at
    /// `offset_chars`. Memory use is bounded by the requested window.
    async fn content_chunk(&self, id: &str, offset_chars: u64, max_chars: u64) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_query_defaults() {
        let query = ListQuery::state("done");
        assert_eq!(query.state, "done");
        assert!(query.leaf_only);
        assert!(query.include_content);
        assert!(query.metadata.is_empty());
    }

    #[test]
    fn test_list_query_builder() {
        let query = ListQuery::state("done")
            .leaf_only(false)
            .include_content(false)
            .metadata("k", json!(1));
        assert!(!query.leaf_only);
        assert!(!query.include_content);
        assert_eq!(query.metadata.len(), 1);
    }

    #[test]
    fn test_matches_metadata_conjunction() {
        let query = ListQuery::state("done")
            .metadata("a", json!(1))
            .metadata("b", json!("x"));

        let mut metadata = HashMap::new();
        metadata.insert("a".to_string(), json!(1));
        metadata.insert("b".to_string(), json!("x"));
        metadata.insert("extra".to_string(), json!(true));
        assert!(query.matches_metadata(&metadata));

        metadata.insert("b".to_string(), json!("y"));
        assert!(!query.matches_metadata(&metadata));

        metadata.remove("b");
        assert!(!query.matches_metadata(&metadata));
    }

    #[test]
    fn test_empty_predicates_match_anything() {
        let query = ListQuery::state("done");
        assert!(query.matches_metadata(&HashMap::new()));
    }
}
