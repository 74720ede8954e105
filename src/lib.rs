//! # Millrace
//!
//! A persistent, concurrent document-processing pipeline engine.
//!
//! Millrace lets you declare a finite state machine whose vertices are
//! named document states and whose edges carry user-supplied async
//! processing functions. Documents are injected at arbitrary start states;
//! the engine advances each one along its outgoing transitions, persists
//! every produced document, maintains the parent→children lineage graph,
//! caps in-flight work with a counting semaphore, and routes processing
//! failures into a dedicated error state as persisted error documents.
//!
//! ## Quick Start
//!
//! Declare the machine and its processing functions:
//!
//! ```rust,ignore
//! use millrace::{Document, DocumentType, ProcessOutput, State, Transition};
//!
//! let machine = DocumentType::new(
//!     vec![
//!         State::new("download"),
//!         State::new("chunk"),
//!         State::new("error"),
//!     ],
//!     vec![Transition::new("download", "chunk", |doc: Document| async move {
//!         let body = fetch(doc.url.as_deref().unwrap_or_default()).await?;
//!         Ok(ProcessOutput::Many(
//!             split(&body)
//!                 .map(|piece| Document::draft().with_content(piece))
//!                 .collect(),
//!         ))
//!     })],
//! )?;
//! ```
//!
//! Build a store and drive documents through:
//!
//! ```rust,ignore
//! use millrace::{DocStore, Document};
//!
//! let store = DocStore::builder()
//!     .connection_string("sqlite://pipeline.db")
//!     .document_type(machine)
//!     .max_concurrency(8)
//!     .build()
//!     .await?;
//! store.initialize().await?;
//!
//! let doc = Document::new("download").with_url("https://example.com/report.pdf");
//! let finished = store.finish_one(doc).await?;
//! for doc in finished {
//!     println!("{} ended in {}", doc.id, doc.state);
//! }
//! ```
//!
//! ## Fan-Out
//!
//! A processing function may return several documents, and one state may
//! have several outgoing transitions; all of them fire. Every produced
//! document is persisted and linked to its parent in one transaction, so
//! readers never observe a child without its lineage.
//!
//! ## Failure Handling
//!
//! A failing processing function never surfaces as an error from
//! [`DocStore::next`] or [`DocStore::finish`]. Instead the engine persists
//! an error document: a child in the configured error state whose content
//! renders the failure and whose metadata records the message, the failure
//! kind, and the transition that failed. Only persistence faults and
//! cancellation propagate to the caller.
//!
//! ## Observation
//!
//! Subscribe to pipeline events for logging, monitoring, or building UIs:
//!
//! ```rust,ignore
//! let mut events = store.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             PipelineEvent::TransitionCompleted { doc_id, children, .. } => {
//!                 println!("{} produced {} documents", doc_id, children.len());
//!             }
//!             PipelineEvent::TransitionFailed { doc_id, error, .. } => {
//!                 println!("{} failed: {}", doc_id, error);
//!             }
//!             _ => {}
//!         }
//!     }
//! });
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default): Enables [`SqliteRepository`] for durable storage
//!
//! ## Design Philosophy
//!
//! The name comes from the **millrace** — the channel that carries water
//! to a mill wheel. The wheel does the visible work, but the race decides
//! how much water reaches it and where the flow goes next. This captures
//! the core design: documents are the water, processing functions are the
//! wheel, and the engine is the channel that routes, meters, and never
//! loses what flows through it.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod document;
pub mod error;
pub mod event;
pub mod gate;
pub mod machine;
pub mod repository;
pub mod store;

pub use document::{Document, DocumentPatch, DEFAULT_MEDIA_TYPE};
pub use error::{MillraceError, Result};
pub use event::PipelineEvent;
pub use gate::{ProcessGate, ProcessPermit};
pub use machine::{
    DocumentType, ProcessError, ProcessFn, ProcessFuture, ProcessOutput, State, Transition,
};
pub use repository::{DocumentRepository, ListQuery, MemoryRepository};
pub use store::{ContentStream, DocStore, DocStoreBuilder, DEFAULT_ERROR_STATE};

#[cfg(feature = "sqlite")]
pub use repository::{SqliteOptions, SqliteRepository};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
