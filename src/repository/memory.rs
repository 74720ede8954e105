//! In-memory repository implementation.
//!
//! This module provides [`MemoryRepository`], a thread-safe in-memory
//! implementation of [`DocumentRepository`] suitable for testing and
//! development.

use crate::repository::{DocumentRepository, ListQuery};
use crate::{Document, DocumentPatch, MillraceError, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One stored row; the id is the map key and `children` is kept as an
/// adjacency list beside the rows.
#[derive(Debug, Clone)]
struct StoredDocument {
    seq: u64,
    state: String,
    content: Option<String>,
    media_type: String,
    url: Option<String>,
    parent_id: Option<String>,
    metadata: HashMap<String, JsonValue>,
}

/// Internal storage for the memory repository.
#[derive(Debug, Default)]
struct Shelf {
    /// Document rows indexed by id.
    docs: HashMap<String, StoredDocument>,
    /// Ordered child ids indexed by parent id.
    children: HashMap<String, Vec<String>>,
    /// Monotonic creation key; orders reads and children lists.
    next_seq: u64,
}

impl Shelf {
    fn materialize(&self, id: &str, stored: &StoredDocument, include_content: bool) -> Document {
        Document {
            id: id.to_string(),
            state: stored.state.clone(),
            content: if include_content {
                stored.content.clone()
            } else {
                None
            },
            media_type: stored.media_type.clone(),
            url: stored.url.clone(),
            parent_id: stored.parent_id.clone(),
            children: self.children.get(id).cloned().unwrap_or_default(),
            metadata: stored.metadata.clone(),
        }
    }

    fn insert_row(&mut self, doc: &Document) -> Result<String> {
        if self.docs.contains_key(&doc.id) {
            return Err(MillraceError::Conflict(format!("duplicate id {}", doc.id)));
        }
        if let Some(parent_id) = &doc.parent_id {
            if !self.docs.contains_key(parent_id) {
                return Err(MillraceError::NotFound(parent_id.clone()));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.docs.insert(
            doc.id.clone(),
            StoredDocument {
                seq,
                state: doc.state.clone(),
                content: doc.content.clone(),
                media_type: doc.media_type.clone(),
                url: doc.url.clone(),
                parent_id: doc.parent_id.clone(),
                metadata: doc.metadata.clone(),
            },
        );
        if let Some(parent_id) = &doc.parent_id {
            self.children
                .entry(parent_id.clone())
                .or_default()
                .push(doc.id.clone());
        }
        Ok(doc.id.clone())
    }

    /// Write-once parent linking; already-linked children are no-ops.
    fn link_children(&mut self, parent_id: &str, child_ids: &[String]) -> Result<()> {
        if !self.docs.contains_key(parent_id) {
            return Err(MillraceError::NotFound(parent_id.to_string()));
        }
        for child_id in child_ids {
            let child = self
                .docs
                .get_mut(child_id)
                .ok_or_else(|| MillraceError::NotFound(child_id.clone()))?;
            match &child.parent_id {
                None => {
                    child.parent_id = Some(parent_id.to_string());
                    self.children
                        .entry(parent_id.to_string())
                        .or_default()
                        .push(child_id.clone());
                }
                Some(existing) if existing == parent_id => {}
                Some(existing) => {
                    return Err(MillraceError::Conflict(format!(
                        "document {child_id} already belongs to {existing}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, id: &str) {
        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(children) = self.children.remove(&current) {
                pending.extend(children);
            }
            self.docs.remove(&current);
        }
    }
}

/// An in-memory implementation of [`DocumentRepository`].
///
/// This implementation uses `Arc<RwLock<...>>` internally, making it safe
/// to clone and share across async tasks. Multiple readers can access the
/// store concurrently, but writers get exclusive access, which also makes
/// each write atomic with respect to readers.
///
/// # Example
///
/// ```
/// use millrace::{Document, DocumentRepository, MemoryRepository};
///
/// # async fn example() -> millrace::Result<()> {
/// let repo = MemoryRepository::new();
/// let doc = Document::new("start").with_content("hello");
/// let id = repo.insert(&doc).await?;
/// assert!(repo.get(&id, true).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    shelf: Arc<RwLock<Shelf>>,
}

impl MemoryRepository {
    /// Creates a new, empty in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    ///
    /// Useful for testing.
    pub async fn len(&self) -> usize {
        self.shelf.read().await.docs.len()
    }

    /// Returns true if no documents are stored.
    pub async fn is_empty(&self) -> bool {
        self.shelf.read().await.docs.is_empty()
    }

    /// Clears all stored data.
    ///
    /// Useful for resetting state between tests.
    pub async fn clear(&self) {
        let mut shelf = self.shelf.write().await;
        shelf.docs.clear();
        shelf.children.clear();
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, doc: &Document) -> Result<String> {
        let mut shelf = self.shelf.write().await;
        shelf.insert_row(doc)
    }

    async fn insert_many(&self, docs: &[Document]) -> Result<Vec<String>> {
        let mut shelf = self.shelf.write().await;

        // Validate up front so the batch is all-or-nothing.
        let mut staged: Vec<&str> = Vec::with_capacity(docs.len());
        for doc in docs {
            if shelf.docs.contains_key(&doc.id) || staged.contains(&doc.id.as_str()) {
                return Err(MillraceError::Conflict(format!("duplicate id {}", doc.id)));
            }
            if let Some(parent_id) = &doc.parent_id {
                if !shelf.docs.contains_key(parent_id) && !staged.contains(&parent_id.as_str()) {
                    return Err(MillraceError::NotFound(parent_id.clone()));
                }
            }
            staged.push(&doc.id);
        }

        // Parents inside the batch were validated above, so rows must land
        // in input order.
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(shelf.insert_row(doc)?);
        }
        Ok(ids)
    }

    async fn insert_children(&self, parent_id: &str, docs: &[Document]) -> Result<Vec<String>> {
        let mut shelf = self.shelf.write().await;
        if !shelf.docs.contains_key(parent_id) {
            return Err(MillraceError::NotFound(parent_id.to_string()));
        }
        for doc in docs {
            if shelf.docs.contains_key(&doc.id) {
                return Err(MillraceError::Conflict(format!("duplicate id {}", doc.id)));
            }
            if doc.parent_id.as_deref() != Some(parent_id) {
                return Err(MillraceError::Conflict(format!(
                    "document {} does not point at parent {parent_id}",
                    doc.id
                )));
            }
        }

        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(shelf.insert_row(doc)?);
        }
        Ok(ids)
    }

    async fn get(&self, id: &str, include_content: bool) -> Result<Option<Document>> {
        let shelf = self.shelf.read().await;
        Ok(shelf
            .docs
            .get(id)
            .map(|stored| shelf.materialize(id, stored, include_content)))
    }

    async fn get_by_state(&self, state: &str, include_content: bool) -> Result<Vec<Document>> {
        let shelf = self.shelf.read().await;
        let mut rows: Vec<(&String, &StoredDocument)> = shelf
            .docs
            .iter()
            .filter(|(_, stored)| stored.state == state)
            .collect();
        rows.sort_by_key(|(_, stored)| stored.seq);
        Ok(rows
            .into_iter()
            .map(|(id, stored)| shelf.materialize(id, stored, include_content))
            .collect())
    }

    async fn get_all(&self, include_content: bool) -> Result<Vec<Document>> {
        let shelf = self.shelf.read().await;
        let mut rows: Vec<(&String, &StoredDocument)> = shelf.docs.iter().collect();
        rows.sort_by_key(|(_, stored)| stored.seq);
        Ok(rows
            .into_iter()
            .map(|(id, stored)| shelf.materialize(id, stored, include_content))
            .collect())
    }

    async fn get_batch(&self, ids: &[String]) -> Result<Vec<Document>> {
        let shelf = self.shelf.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                shelf
                    .docs
                    .get(id)
                    .map(|stored| shelf.materialize(id, stored, true))
            })
            .collect())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Document>> {
        let shelf = self.shelf.read().await;
        let mut rows: Vec<(&String, &StoredDocument)> = shelf
            .docs
            .iter()
            .filter(|(id, stored)| {
                if stored.state != query.state {
                    return false;
                }
                if query.leaf_only
                    && shelf
                        .children
                        .get(*id)
                        .is_some_and(|children| !children.is_empty())
                {
                    return false;
                }
                query.matches_metadata(&stored.metadata)
            })
            .collect();
        rows.sort_by_key(|(_, stored)| stored.seq);
        Ok(rows
            .into_iter()
            .map(|(id, stored)| shelf.materialize(id, stored, query.include_content))
            .collect())
    }

    async fn update(&self, id: &str, patch: &DocumentPatch) -> Result<Document> {
        let mut shelf = self.shelf.write().await;
        let stored = shelf
            .docs
            .get_mut(id)
            .ok_or_else(|| MillraceError::NotFound(id.to_string()))?;
        for (key, value) in &patch.metadata {
            stored.metadata.insert(key.clone(), value.clone());
        }
        if !patch.children.is_empty() {
            shelf.link_children(id, &patch.children)?;
        }

        let stored = shelf
            .docs
            .get(id)
            .ok_or_else(|| MillraceError::NotFound(id.to_string()))?;
        Ok(shelf.materialize(id, stored, true))
    }

    async fn append_children(&self, parent_id: &str, child_ids: &[String]) -> Result<()> {
        let mut shelf = self.shelf.write().await;
        shelf.link_children(parent_id, child_ids)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut shelf = self.shelf.write().await;
        let parent_id = match shelf.docs.get(id) {
            Some(stored) => stored.parent_id.clone(),
            None => return Err(MillraceError::NotFound(id.to_string())),
        };
        if let Some(parent_id) = parent_id {
            if let Some(siblings) = shelf.children.get_mut(&parent_id) {
                siblings.retain(|child_id| child_id != id);
            }
        }
        shelf.remove_subtree(id);
        Ok(())
    }

    async fn count(&self, state: Option<&str>) -> Result<u64> {
        let shelf = self.shelf.read().await;
        let count = match state {
            Some(state) => shelf
                .docs
                .values()
                .filter(|stored| stored.state == state)
                .count(),
            None => shelf.docs.len(),
        };
        Ok(count as u64)
    }

    async fn content_length(&self, id: &str) -> Result<Option<u64>> {
        let shelf = self.shelf.read().await;
        let stored = shelf
            .docs
            .get(id)
            .ok_or_else(|| MillraceError::NotFound(id.to_string()))?;
        Ok(stored
            .content
            .as_ref()
            .map(|content| content.chars().count() as u64))
    }

    async fn content_chunk(&self, id: &str, offset_chars: u64, max_chars: u64) -> Result<String> {
        let shelf = self.shelf.read().await;
        let stored = shelf
            .docs
            .get(id)
            .ok_or_else(|| MillraceError::NotFound(id.to_string()))?;
        let content = stored
            .content
            .as_ref()
            .ok_or_else(|| MillraceError::NoContent(id.to_string()))?;
        Ok(content
            .chars()
            .skip(offset_chars as usize)
            .take(max_chars as usize)
            .collect())
    }
}
