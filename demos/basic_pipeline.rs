//! Basic millrace pipeline example.
//!
//! This example demonstrates:
//! - Declaring a state machine with fan-out and failure handling
//! - Adding documents and driving them to completion
//! - Inspecting lineage and error documents
//! - Observing pipeline events
//!
//! Run with: `cargo run --example basic_pipeline`

use std::sync::Arc;

use millrace::{
    DocStore, Document, DocumentType, MemoryRepository, PipelineEvent, ProcessError,
    ProcessOutput, State, Transition,
};
use serde_json::json;

fn machine() -> millrace::Result<DocumentType> {
    DocumentType::new(
        vec![
            State::new("download"),
            State::new("chunk"),
            State::new("embed"),
            State::new("error"),
        ],
        vec![
            // "download" pretends to fetch the document body.
            Transition::new("download", "chunk", |doc: Document| async move {
                let url = doc
                    .url
                    .ok_or_else(|| ProcessError::new("MissingUrl", "document has no url"))?;
                println!("  ⇣ fetching {url}");
                let body = format!("contents of {url} ").repeat(8);
                Ok(ProcessOutput::One(Document::draft().with_content(body)))
            }),
            // "chunk" fans out into fixed-size pieces.
            Transition::new("chunk", "embed", |doc: Document| async move {
                let body = doc.content.unwrap_or_default();
                let pieces: Vec<Document> = body
                    .as_bytes()
                    .chunks(64)
                    .map(|piece| {
                        Document::draft()
                            .with_content(String::from_utf8_lossy(piece).into_owned())
                            .with_metadata("length", json!(piece.len()))
                    })
                    .collect();
                println!("  ✂ split into {} pieces", pieces.len());
                Ok(ProcessOutput::Many(pieces))
            }),
        ],
    )
}

#[tokio::main]
async fn main() -> millrace::Result<()> {
    let store = DocStore::builder()
        .repository(Arc::new(MemoryRepository::new()))
        .document_type(machine()?)
        .max_concurrency(4)
        .build()
        .await?;
    store.initialize().await?;

    // Watch the pipeline work.
    let mut events = store.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::TransitionCompleted {
                    doc_id, children, ..
                } => {
                    println!("  ✓ {} produced {} document(s)", &doc_id[..8], children.len());
                }
                PipelineEvent::TransitionFailed { doc_id, error, .. } => {
                    println!("  ✗ {} failed: {error}", &doc_id[..8]);
                }
                _ => {}
            }
        }
    });

    println!("Processing a healthy document:");
    let doc = Document::new("download").with_url("https://example.com/report.txt");
    let finished = store.finish_one(doc).await?;
    println!(
        "Pipeline finished with {} embedded piece(s); {} documents stored\n",
        finished.len(),
        store.count(None).await?
    );

    println!("Processing a document that cannot be fetched:");
    let broken = Document::new("download");
    let finished = store.finish_one(broken).await?;
    for doc in &finished {
        println!(
            "  ended in '{}' (error_type = {})",
            doc.state,
            doc.metadata
                .get("error_type")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
        );
    }

    store.dispose().await?;
    Ok(())
}
