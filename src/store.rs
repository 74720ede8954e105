//! The document store orchestrator.
//!
//! This module provides [`DocStore`], the public façade of the pipeline
//! engine. A store owns a persistence backend, the current
//! [`DocumentType`], the concurrency gate, and an event channel; it
//! advances documents one hop ([`DocStore::next`]) or to completion
//! ([`DocStore::finish`]), and exposes the administrative surface for
//! adding, querying, patching, and deleting documents.
//!
//! # Construction
//!
//! ```rust,ignore
//! use millrace::{DocStore, DocumentType};
//!
//! let store = DocStore::builder()
//!     .connection_string("sqlite://pipeline.db")
//!     .document_type(document_type)
//!     .max_concurrency(8)
//!     .build()
//!     .await?;
//! store.initialize().await?;
//! ```

use crate::event::PipelineEvent;
use crate::gate::ProcessGate;
use crate::machine::{DocumentType, ProcessError, Transition};
use crate::repository::{DocumentRepository, ListQuery};
#[cfg(feature = "sqlite")]
use crate::repository::{SqliteOptions, SqliteRepository};
use crate::{Document, DocumentPatch, MillraceError, Result};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

/// State name error documents are routed to unless configured otherwise.
pub const DEFAULT_ERROR_STATE: &str = "error";

/// Default capacity of the concurrency gate.
const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default channel capacity for pipeline events.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tracks in-flight `next`/`finish` calls so the document type cannot be
/// swapped under a running wave.
struct RunGuard {
    counter: Arc<AtomicUsize>,
}

impl RunGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The orchestrator driving documents through their state machine.
///
/// `DocStore` is `Send + Sync`; share it behind an `Arc` and call it from
/// any task. Processing runs on spawned tasks bounded by the concurrency
/// gate, so a single `next` call with many documents (or a document with
/// many outgoing transitions) fans out without exceeding the configured
/// cap. Dropping a `next`/`finish` future aborts its in-flight hops;
/// whatever was persisted before the abort stays persisted.
pub struct DocStore {
    repository: Arc<dyn DocumentRepository>,
    document_type: RwLock<Option<Arc<DocumentType>>>,
    error_state: String,
    gate: ProcessGate,
    event_tx: broadcast::Sender<PipelineEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl DocStore {
    /// Creates a new store builder.
    pub fn builder() -> DocStoreBuilder {
        DocStoreBuilder::new()
    }

    /// Subscribes to pipeline execution events.
    ///
    /// Returns a receiver that will receive all events broadcast by this
    /// store. Events are not persisted; if the receiver is too slow,
    /// events may be dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Emits an event to all subscribers.
    ///
    /// Ignores send errors (no subscribers or channel full).
    fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Creates the persistence schema if needed. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.repository.initialize().await
    }

    /// Releases pooled backend resources. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        self.repository.dispose().await
    }

    /// Returns the configured error state name.
    pub fn error_state(&self) -> &str {
        &self.error_state
    }

    /// Returns the concurrency gate's capacity.
    pub fn max_concurrency(&self) -> usize {
        self.gate.capacity()
    }

    /// Replaces the document state machine.
    ///
    /// Replacing the type also discards its transition and final-state
    /// caches.
    ///
    /// # Errors
    ///
    /// Returns [`MillraceError::Busy`] while any `next`/`finish` call is
    /// in progress.
    pub fn set_document_type(&self, document_type: DocumentType) -> Result<()> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(MillraceError::Busy(
                "cannot replace the document type while the pipeline is advancing".to_string(),
            ));
        }
        *self
            .document_type
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(document_type));
        Ok(())
    }

    fn read_document_type(&self) -> Option<Arc<DocumentType>> {
        self.document_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_document_type(&self) -> Result<Arc<DocumentType>> {
        self.read_document_type()
            .ok_or_else(|| MillraceError::Configuration("document type not set".to_string()))
    }

    /// Returns the names of states with no outgoing transitions.
    ///
    /// # Errors
    ///
    /// Returns [`MillraceError::Configuration`] if no document type is
    /// set.
    pub fn final_state_names(&self) -> Result<HashSet<String>> {
        Ok(self.require_document_type()?.final_state_names().clone())
    }

    /// States that end a document's journey through `finish`: the final
    /// states, plus the error state when it has no outgoing transitions
    /// (it need not be declared to be used as a failure sink).
    fn terminal_state_names(&self, document_type: &DocumentType) -> HashSet<String> {
        let mut terminal = document_type.final_state_names().clone();
        if document_type.transitions_from(&self.error_state).is_empty() {
            terminal.insert(self.error_state.clone());
        }
        terminal
    }

    fn validate_addable(&self, doc: &Document) -> Result<()> {
        if doc.state.is_empty() {
            return Err(MillraceError::Configuration(
                "document state must not be empty".to_string(),
            ));
        }
        if let Some(document_type) = self.read_document_type() {
            if !document_type.has_state(&doc.state) && doc.state != self.error_state {
                return Err(MillraceError::Configuration(format!(
                    "unknown state on add: {}",
                    doc.state
                )));
            }
        }
        Ok(())
    }

    /// Persists one document without triggering transitions.
    ///
    /// # Errors
    ///
    /// Returns [`MillraceError::Configuration`] for an empty or (when a
    /// document type is set) undeclared state, and
    /// [`MillraceError::Conflict`] for a duplicate id.
    pub async fn add(&self, doc: Document) -> Result<String> {
        self.validate_addable(&doc)?;
        let id = self.repository.insert(&doc).await?;
        debug!(doc_id = %id, state = %doc.state, "document added");
        Ok(id)
    }

    /// Persists several documents in one transaction, without triggering
    /// transitions. Returns their ids in input order.
    pub async fn add_many(&self, docs: Vec<Document>) -> Result<Vec<String>> {
        for doc in &docs {
            self.validate_addable(doc)?;
        }
        let ids = self.repository.insert_many(&docs).await?;
        debug!(count = ids.len(), "documents added");
        Ok(ids)
    }

    /// Fetches a document by id, or `None` if absent.
    pub async fn get(&self, id: &str, include_content: bool) -> Result<Option<Document>> {
        self.repository.get(id, include_content).await
    }

    /// Fetches all documents in a state, in creation order.
    pub async fn get_by_state(
        &self,
        state: &str,
        include_content: bool,
    ) -> Result<Vec<Document>> {
        self.repository.get_by_state(state, include_content).await
    }

    /// Fetches every document, in creation order.
    pub async fn get_all(&self, include_content: bool) -> Result<Vec<Document>> {
        self.repository.get_all(include_content).await
    }

    /// Fetches several documents in one round trip. Results follow the
    /// input order; missing ids are omitted.
    pub async fn get_batch(&self, ids: &[String]) -> Result<Vec<Document>> {
        self.repository.get_batch(ids).await
    }

    /// Fetches documents matching the query filters.
    pub async fn list(&self, query: ListQuery) -> Result<Vec<Document>> {
        self.repository.list(&query).await
    }

    /// Applies a metadata/children patch and returns the updated
    /// document. `id`, `parent_id`, and `state` cannot be patched.
    ///
    /// # Errors
    ///
    /// Returns [`MillraceError::NotFound`] if the document does not
    /// exist.
    pub async fn update(&self, id: &str, patch: DocumentPatch) -> Result<Document> {
        let updated = self.repository.update(id, &patch).await?;
        debug!(doc_id = %id, "document updated");
        Ok(updated)
    }

    /// Deletes a document and all of its descendants.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repository.delete(id).await?;
        info!(doc_id = %id, "document deleted");
        Ok(())
    }

    /// Counts documents, optionally restricted to one state.
    pub async fn count(&self, state: Option<&str>) -> Result<u64> {
        self.repository.count(state).await
    }

    /// Advances one document by one hop. See [`DocStore::next`].
    pub async fn next_one(&self, doc: Document) -> Result<Vec<Document>> {
        self.next(vec![doc]).await
    }

    /// Advances each document by exactly one hop.
    ///
    /// Every outgoing transition of every document fires; hops run
    /// concurrently, bounded by the gate. Documents without outgoing
    /// transitions contribute nothing (that is not an error). The result
    /// collects all produced documents in unspecified order; a parent's
    /// `children` list reflects the completion order of its hops.
    ///
    /// A failing processing function produces a persisted error document
    /// instead of an error: `next` only fails on repository faults.
    pub async fn next(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let document_type = self.require_document_type()?;
        let _guard = RunGuard::new(&self.in_flight);
        let span = info_span!("next", documents = docs.len());
        self.advance_wave(&document_type, docs).instrument(span).await
    }

    /// Runs one wave of hops on a `JoinSet`. Dropping the future aborts
    /// in-flight hops, which also returns their gate permits.
    async fn advance_wave(
        &self,
        document_type: &Arc<DocumentType>,
        docs: Vec<Document>,
    ) -> Result<Vec<Document>> {
        let mut hops: JoinSet<Result<Vec<Document>>> = JoinSet::new();
        for doc in docs {
            let transitions = document_type.transitions_from(&doc.state);
            if transitions.is_empty() {
                debug!(doc_id = %doc.id, state = %doc.state, "no outgoing transitions");
                continue;
            }
            for transition in transitions {
                hops.spawn(run_hop(
                    Arc::clone(&self.repository),
                    self.gate.clone(),
                    self.event_tx.clone(),
                    self.error_state.clone(),
                    doc.clone(),
                    transition.clone(),
                ));
            }
        }

        let mut produced = Vec::new();
        while let Some(joined) = hops.join_next().await {
            let children = joined.map_err(|e| MillraceError::Task(e.to_string()))??;
            produced.extend(children);
        }
        Ok(produced)
    }

    /// Drives one document to completion. See [`DocStore::finish`].
    pub async fn finish_one(&self, doc: Document) -> Result<Vec<Document>> {
        self.finish(vec![doc]).await
    }

    /// Drives documents until every descendant reaches a terminal state.
    ///
    /// Works in waves: documents already terminal are collected, the rest
    /// advance one hop, and their children form the next wave. Inputs not
    /// yet persisted are added first. Termination requires the reachable
    /// state machine to be acyclic; the engine does not detect cycles.
    ///
    /// Error documents count as terminal as long as the error state has
    /// no outgoing transitions; if it has some, they advance like any
    /// other document.
    pub async fn finish(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let document_type = self.require_document_type()?;
        let _guard = RunGuard::new(&self.in_flight);
        let span = info_span!("finish", documents = docs.len());
        async move {
            for doc in &docs {
                if self.repository.get(&doc.id, false).await?.is_none() {
                    self.validate_addable(doc)?;
                    self.repository.insert(doc).await?;
                    debug!(doc_id = %doc.id, "persisted input document");
                }
            }

            let terminal = self.terminal_state_names(&document_type);
            let mut worklist = docs;
            let mut finished = Vec::new();

            loop {
                let (done, active): (Vec<Document>, Vec<Document>) = worklist
                    .into_iter()
                    .partition(|doc| terminal.contains(&doc.state));
                finished.extend(done);
                if active.is_empty() {
                    break;
                }

                debug!(active = active.len(), "advancing wave");
                let produced = self.advance_wave(&document_type, active).await?;
                self.emit(PipelineEvent::WaveCompleted {
                    produced: produced.len(),
                });
                worklist = produced;
            }

            info!(finished = finished.len(), "pipeline drained");
            Ok(finished)
        }
        .instrument(span)
        .await
    }

    /// Opens a lazy chunked view over a document's content.
    ///
    /// Each chunk holds at most `chunk_size` characters and is fetched
    /// with its own repository query, so memory stays bounded regardless
    /// of content size.
    ///
    /// # Errors
    ///
    /// [`MillraceError::NotFound`] if the document does not exist,
    /// [`MillraceError::NoContent`] if its content is null, and
    /// [`MillraceError::Configuration`] for a zero `chunk_size`.
    pub async fn stream_content(&self, id: &str, chunk_size: usize) -> Result<ContentStream> {
        if chunk_size == 0 {
            return Err(MillraceError::Configuration(
                "chunk_size must be positive".to_string(),
            ));
        }
        let length = self
            .repository
            .content_length(id)
            .await?
            .ok_or_else(|| MillraceError::NoContent(id.to_string()))?;
        Ok(ContentStream {
            repository: Arc::clone(&self.repository),
            doc_id: id.to_string(),
            length,
            offset: 0,
            chunk_size: chunk_size as u64,
        })
    }
}

impl std::fmt::Debug for DocStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStore")
            .field("error_state", &self.error_state)
            .field("max_concurrency", &self.gate.capacity())
            .field("document_type", &self.read_document_type())
            .finish_non_exhaustive()
    }
}

/// Executes one transition on one document: admit through the gate, run
/// the processing function, stamp and persist the children in a single
/// transaction, release the permit (RAII, also on failure and abort).
async fn run_hop(
    repository: Arc<dyn DocumentRepository>,
    gate: ProcessGate,
    events: broadcast::Sender<PipelineEvent>,
    error_state: String,
    doc: Document,
    transition: Transition,
) -> Result<Vec<Document>> {
    let span = info_span!("hop", doc_id = %doc.id, transition = %transition.label());
    async move {
        let _permit = gate.admit().await?;
        let _ = events.send(PipelineEvent::TransitionStarted {
            doc_id: doc.id.clone(),
            from: transition.from_state.name.clone(),
            to: transition.to_state.name.clone(),
        });
        debug!("processing function admitted");

        match transition.process(doc.clone()).await {
            Ok(output) => {
                let mut children = output.into_documents();
                for child in &mut children {
                    child.parent_id = Some(doc.id.clone());
                    if child.state.is_empty() {
                        child.state = transition.to_state.name.clone();
                    }
                }
                if !children.is_empty() {
                    repository.insert_children(&doc.id, &children).await?;
                }
                info!(children = children.len(), "transition completed");
                let _ = events.send(PipelineEvent::TransitionCompleted {
                    doc_id: doc.id.clone(),
                    from: transition.from_state.name.clone(),
                    to: transition.to_state.name.clone(),
                    children: children.iter().map(|child| child.id.clone()).collect(),
                });
                Ok(children)
            }
            Err(process_error) => {
                warn!(error = %process_error, "processing function failed");
                let error_doc = error_document(&doc, &transition, &error_state, &process_error);
                repository
                    .insert_children(&doc.id, std::slice::from_ref(&error_doc))
                    .await?;
                let _ = events.send(PipelineEvent::TransitionFailed {
                    doc_id: doc.id.clone(),
                    from: transition.from_state.name.clone(),
                    to: transition.to_state.name.clone(),
                    error: process_error.to_string(),
                });
                Ok(vec![error_doc])
            }
        }
    }
    .instrument(span)
    .await
}

/// Materializes a processing failure as a child document.
fn error_document(
    parent: &Document,
    transition: &Transition,
    error_state: &str,
    error: &ProcessError,
) -> Document {
    let mut doc = Document::new(error_state)
        .with_parent_id(parent.id.clone())
        .with_content(error.to_string());
    doc.metadata = parent.metadata.clone();
    doc.metadata.insert(
        "error".to_string(),
        JsonValue::String(error.message.clone()),
    );
    doc.metadata.insert(
        "error_type".to_string(),
        JsonValue::String(error.kind.clone()),
    );
    doc.metadata.insert(
        "failed_transition".to_string(),
        JsonValue::String(transition.label()),
    );
    doc
}

/// A lazy, finite sequence of content chunks.
///
/// Produced by [`DocStore::stream_content`]; each
/// [`next_chunk`](ContentStream::next_chunk) call fetches one window of
/// characters from the repository.
pub struct ContentStream {
    repository: Arc<dyn DocumentRepository>,
    doc_id: String,
    length: u64,
    offset: u64,
    chunk_size: u64,
}

impl ContentStream {
    /// Fetches the next chunk, or `None` once the content is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<String>> {
        if self.offset >= self.length {
            return Ok(None);
        }
        let take = self.chunk_size.min(self.length - self.offset);
        let chunk = self
            .repository
            .content_chunk(&self.doc_id, self.offset, take)
            .await?;
        self.offset += take;
        Ok(Some(chunk))
    }

    /// Drains the remaining chunks into one string.
    pub async fn read_to_string(&mut self) -> Result<String> {
        let mut content = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            content.push_str(&chunk);
        }
        Ok(content)
    }

    /// Total content length in characters.
    pub fn length(&self) -> u64 {
        self.length
    }
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("doc_id", &self.doc_id)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DocStore`] instances.
///
/// Either inject a repository or supply a connection string
/// (`sqlite://path`, `sqlite:path`, a bare path, or `:memory:`). The
/// document type may be set later with [`DocStore::set_document_type`].
pub struct DocStoreBuilder {
    connection_string: Option<String>,
    repository: Option<Arc<dyn DocumentRepository>>,
    document_type: Option<DocumentType>,
    error_state: String,
    max_concurrency: usize,
    #[cfg(feature = "sqlite")]
    sqlite: SqliteOptions,
}

impl DocStoreBuilder {
    fn new() -> Self {
        Self {
            connection_string: None,
            repository: None,
            document_type: None,
            error_state: DEFAULT_ERROR_STATE.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            #[cfg(feature = "sqlite")]
            sqlite: SqliteOptions::default(),
        }
    }

    /// Sets the connection string handed to the persistence backend.
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Injects a repository directly, overriding any connection string.
    pub fn repository(mut self, repository: Arc<dyn DocumentRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sets the document state machine.
    pub fn document_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = Some(document_type);
        self
    }

    /// Names the state failure documents are routed to.
    pub fn error_state(mut self, error_state: impl Into<String>) -> Self {
        self.error_state = error_state.into();
        self
    }

    /// Caps the number of concurrently executing processing functions.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Forwards connection-pool settings to the SQLite backend.
    #[cfg(feature = "sqlite")]
    pub fn sqlite_options(mut self, options: SqliteOptions) -> Self {
        self.sqlite = options;
        self
    }

    /// Builds the store, opening the backend if a connection string was
    /// given. The schema is not created here; call
    /// [`DocStore::initialize`] for that.
    pub async fn build(self) -> Result<DocStore> {
        let repository: Arc<dyn DocumentRepository> = match (self.repository, self.connection_string)
        {
            (Some(repository), _) => repository,
            #[cfg(feature = "sqlite")]
            (None, Some(connection_string)) => {
                open_sqlite(&connection_string, self.sqlite.clone()).await?
            }
            #[cfg(not(feature = "sqlite"))]
            (None, Some(_)) => {
                return Err(MillraceError::Configuration(
                    "connection strings require the `sqlite` feature".to_string(),
                ))
            }
            (None, None) => {
                return Err(MillraceError::Configuration(
                    "a repository or connection string is required".to_string(),
                ))
            }
        };

        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        Ok(DocStore {
            repository,
            document_type: RwLock::new(self.document_type.map(Arc::new)),
            error_state: self.error_state,
            gate: ProcessGate::new(self.max_concurrency),
            event_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Default for DocStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(
    connection_string: &str,
    options: SqliteOptions,
) -> Result<Arc<dyn DocumentRepository>> {
    let target = connection_string
        .strip_prefix("sqlite://")
        .or_else(|| connection_string.strip_prefix("sqlite:"))
        .unwrap_or(connection_string);
    let repository = if target == ":memory:" || target.is_empty() {
        SqliteRepository::open_in_memory(options).await?
    } else {
        SqliteRepository::open(target, options).await?
    };
    Ok(Arc::new(repository))
}
