//! Integration tests for the millrace pipeline engine.
//!
//! These tests exercise the full engine end to end:
//! - Linear pipelines and lineage chains
//! - Fan-out transitions and fan-out across edges
//! - Failure capture as persisted error documents
//! - Batch processing under the concurrency gate
//! - Content streaming
//! - Cascade deletion
//! - Parity between the memory and SQLite backends

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use millrace::{
    DocStore, Document, DocumentType, ListQuery, MemoryRepository, PipelineEvent, ProcessError,
    ProcessOutput, State, Transition,
};

/// Tracks how many processing functions run at once.
#[derive(Debug, Clone, Default)]
struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Identity transition that stamps a `step` marker into child metadata.
fn step_transition(from: &str, to: &str, step: i64) -> Transition {
    Transition::new(from, to, move |doc: Document| async move {
        let mut child = Document::draft();
        child.content = doc.content.clone();
        child.metadata = doc.metadata.clone();
        child.metadata.insert("step".to_string(), json!(step));
        Ok(ProcessOutput::One(child))
    })
}

/// Identity transition that records its concurrency through a probe.
fn probed_transition(from: &str, to: &str, probe: ConcurrencyProbe) -> Transition {
    Transition::new(from, to, move |doc: Document| {
        let probe = probe.clone();
        async move {
            probe.enter();
            tokio::time::sleep(Duration::from_millis(2)).await;
            let mut child = Document::draft();
            child.content = doc.content.clone();
            probe.exit();
            Ok(ProcessOutput::One(child))
        }
    })
}

async fn memory_store(document_type: DocumentType, max_concurrency: usize) -> DocStore {
    DocStore::builder()
        .repository(Arc::new(MemoryRepository::new()))
        .document_type(document_type)
        .max_concurrency(max_concurrency)
        .build()
        .await
        .unwrap()
}

fn linear_type() -> DocumentType {
    DocumentType::new(
        vec![
            State::new("a"),
            State::new("b"),
            State::new("c"),
            State::new("error"),
        ],
        vec![step_transition("a", "b", 1), step_transition("b", "c", 2)],
    )
    .unwrap()
}

#[tokio::test]
async fn linear_pipeline_builds_a_parent_chain() {
    let store = memory_store(linear_type(), 10).await;

    let root = Document::new("a").with_id("D0").with_content("hello");
    store.add(root.clone()).await.unwrap();

    let finished = store.finish_one(root).await.unwrap();
    assert_eq!(finished.len(), 1);

    let leaf = &finished[0];
    assert_eq!(leaf.state, "c");
    assert_eq!(leaf.content.as_deref(), Some("hello"));
    assert_eq!(leaf.metadata.get("step"), Some(&json!(2)));

    // Walk the chain back to the root.
    let middle_id = leaf.parent_id.clone().unwrap();
    let middle = store.get(&middle_id, true).await.unwrap().unwrap();
    assert_eq!(middle.state, "b");
    assert_eq!(middle.metadata.get("step"), Some(&json!(1)));
    assert_eq!(middle.parent_id.as_deref(), Some("D0"));
    assert_eq!(middle.children, vec![leaf.id.clone()]);

    // Exactly three documents persisted.
    assert_eq!(store.count(None).await.unwrap(), 3);
}

#[tokio::test]
async fn fan_out_produces_three_linked_children() {
    let document_type = DocumentType::new(
        vec![State::new("a"), State::new("b"), State::new("error")],
        vec![Transition::new("a", "b", |_doc: Document| async move {
            Ok(ProcessOutput::Many(vec![
                Document::draft().with_content("x"),
                Document::draft().with_content("y"),
                Document::draft().with_content("z"),
            ]))
        })],
    )
    .unwrap();
    let store = memory_store(document_type, 10).await;

    let root = Document::new("a");
    store.add(root.clone()).await.unwrap();
    let produced = store.next_one(root.clone()).await.unwrap();
    assert_eq!(produced.len(), 3);

    let parent = store.get(&root.id, false).await.unwrap().unwrap();
    assert_eq!(parent.children.len(), 3);

    let children = store.get_batch(&parent.children).await.unwrap();
    let mut contents: Vec<&str> = children
        .iter()
        .map(|child| child.content.as_deref().unwrap())
        .collect();
    contents.sort_unstable();
    assert_eq!(contents, vec!["x", "y", "z"]);
    for child in &children {
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.state, "b");
    }
}

#[tokio::test]
async fn processing_failure_is_captured_not_raised() {
    let document_type = DocumentType::new(
        vec![State::new("a"), State::new("b"), State::new("error")],
        vec![Transition::new("a", "b", |_doc: Document| async move {
            Err(ProcessError::new("RuntimeError", "boom"))
        })],
    )
    .unwrap();
    let store = memory_store(document_type, 10).await;

    let root = Document::new("a");
    store.add(root.clone()).await.unwrap();

    let finished = store.finish_one(root.clone()).await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, "error");
    assert_eq!(finished[0].metadata.get("error"), Some(&json!("boom")));

    let parent = store.get(&root.id, false).await.unwrap().unwrap();
    assert_eq!(parent.children.len(), 1);
    assert_eq!(parent.children[0], finished[0].id);
}

#[tokio::test]
async fn every_failing_processor_yields_one_error_child() {
    let document_type = DocumentType::new(
        vec![State::new("a"), State::new("b"), State::new("error")],
        vec![Transition::new("a", "b", |_doc: Document| async move {
            Err(ProcessError::from("always down"))
        })],
    )
    .unwrap();
    let store = memory_store(document_type, 4).await;

    let docs: Vec<Document> = (0..5).map(|_| Document::new("a")).collect();
    store.add_many(docs.clone()).await.unwrap();

    let produced = store.next(docs.clone()).await.unwrap();
    assert_eq!(produced.len(), 5);
    assert!(produced.iter().all(|doc| doc.state == "error"));

    for doc in &docs {
        let parent = store.get(&doc.id, false).await.unwrap().unwrap();
        assert_eq!(parent.children.len(), 1, "exactly one error child");
    }
}

#[tokio::test]
async fn batch_finish_stays_inside_the_concurrency_gate() {
    let probe = ConcurrencyProbe::default();
    let document_type = DocumentType::new(
        vec![
            State::new("a"),
            State::new("b"),
            State::new("c"),
            State::new("error"),
        ],
        vec![
            probed_transition("a", "b", probe.clone()),
            probed_transition("b", "c", probe.clone()),
        ],
    )
    .unwrap();
    let store = memory_store(document_type, 4).await;

    let docs: Vec<Document> = (0..50)
        .map(|i| Document::new("a").with_content(format!("doc-{i}")))
        .collect();
    store.add_many(docs.clone()).await.unwrap();

    let finished = store.finish(docs).await.unwrap();
    assert_eq!(finished.len(), 50);
    assert!(finished.iter().all(|doc| doc.state == "c"));

    // 50 roots + 50 in b + 50 in c.
    assert_eq!(store.count(None).await.unwrap(), 150);

    // All leaves sit in the final state.
    let leaves = store.list(ListQuery::state("c")).await.unwrap();
    assert_eq!(leaves.len(), 50);

    assert!(
        probe.peak() <= 4,
        "observed {} concurrent processors",
        probe.peak()
    );
}

#[tokio::test]
async fn streamed_chunks_reassemble_the_content() {
    let store = DocStore::builder()
        .repository(Arc::new(MemoryRepository::new()))
        .build()
        .await
        .unwrap();

    let content: String = (0..10_000)
        .map(|i| char::from(b'a' + (i % 26) as u8))
        .collect();
    let doc = Document::new("stored").with_id("big").with_content(content.clone());
    store.add(doc).await.unwrap();

    let mut stream = store.stream_content("big", 512).await.unwrap();
    let mut reassembled = String::new();
    let mut chunks = 0;
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        assert!(chunk.chars().count() <= 512);
        reassembled.push_str(&chunk);
        chunks += 1;
    }

    assert_eq!(reassembled, content);
    assert_eq!(chunks, 20);
}

#[tokio::test]
async fn cascade_delete_empties_the_tree() {
    let store = DocStore::builder()
        .repository(Arc::new(MemoryRepository::new()))
        .build()
        .await
        .unwrap();

    store.add(Document::new("s").with_id("root")).await.unwrap();
    for child in 0..3 {
        let child_id = format!("child-{child}");
        store
            .add(Document::new("s").with_id(&child_id).with_parent_id("root"))
            .await
            .unwrap();
        for grandchild in 0..2 {
            store
                .add(
                    Document::new("s")
                        .with_id(format!("grandchild-{child}-{grandchild}"))
                        .with_parent_id(&child_id),
                )
                .await
                .unwrap();
        }
    }
    assert_eq!(store.count(None).await.unwrap(), 10);

    store.delete("root").await.unwrap();
    assert_eq!(store.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn lineage_holds_after_fan_out_pipeline() {
    let document_type = DocumentType::new(
        vec![
            State::new("a"),
            State::new("b"),
            State::new("c"),
            State::new("error"),
        ],
        vec![
            Transition::new("a", "b", |_doc: Document| async move {
                Ok(ProcessOutput::Many(vec![
                    Document::draft().with_content("left"),
                    Document::draft().with_content("right"),
                ]))
            }),
            step_transition("b", "c", 2),
        ],
    )
    .unwrap();
    let store = memory_store(document_type, 10).await;

    let root = Document::new("a");
    store.add(root.clone()).await.unwrap();
    let finished = store.finish_one(root).await.unwrap();
    assert_eq!(finished.len(), 2);

    // Every non-root document points at an existing parent that lists it,
    // and no children list carries duplicates.
    for doc in store.get_all(false).await.unwrap() {
        let mut deduped = doc.children.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), doc.children.len());

        if let Some(parent_id) = &doc.parent_id {
            let parent = store.get(parent_id, false).await.unwrap().unwrap();
            assert!(parent.children.contains(&doc.id));
        }
    }
}

#[tokio::test]
async fn finish_returns_only_final_state_documents() {
    let store = memory_store(linear_type(), 10).await;
    let finals = store.final_state_names().unwrap();

    let docs: Vec<Document> = (0..8).map(|_| Document::new("a")).collect();
    let finished = store.finish(docs).await.unwrap();

    assert_eq!(finished.len(), 8);
    assert!(finished.iter().all(|doc| finals.contains(&doc.state)));

    // The returned set is exactly the final-state leaves.
    let leaves = store.list(ListQuery::state("c")).await.unwrap();
    let mut leaf_ids: Vec<&str> = leaves.iter().map(|doc| doc.id.as_str()).collect();
    let mut finished_ids: Vec<&str> = finished.iter().map(|doc| doc.id.as_str()).collect();
    leaf_ids.sort_unstable();
    finished_ids.sort_unstable();
    assert_eq!(leaf_ids, finished_ids);
}

#[tokio::test]
async fn add_then_get_round_trips_every_field() {
    let store = memory_store(linear_type(), 10).await;
    let original = Document::new("a")
        .with_id("rt")
        .with_content("body")
        .with_media_type("text/markdown")
        .with_url("https://example.com/doc")
        .with_metadata("source", json!("crawler"));
    store.add(original.clone()).await.unwrap();

    let with_content = store.get("rt", true).await.unwrap().unwrap();
    assert_eq!(with_content, original);

    let without_content = store.get("rt", false).await.unwrap().unwrap();
    assert!(without_content.content.is_none());
    assert_eq!(without_content.url, original.url);
    assert_eq!(without_content.metadata, original.metadata);
}

#[tokio::test]
async fn list_filters_on_state_leaf_and_metadata() {
    let store = memory_store(linear_type(), 10).await;

    store
        .add(
            Document::new("c")
                .with_id("match")
                .with_metadata("k", json!("v")),
        )
        .await
        .unwrap();
    store
        .add(
            Document::new("c")
                .with_id("wrong-meta")
                .with_metadata("k", json!("other")),
        )
        .await
        .unwrap();
    store.add(Document::new("a").with_id("wrong-state")).await.unwrap();
    store
        .add(
            Document::new("c")
                .with_id("parent")
                .with_metadata("k", json!("v")),
        )
        .await
        .unwrap();
    store
        .add(
            Document::new("b")
                .with_id("child")
                .with_parent_id("parent"),
        )
        .await
        .unwrap();

    let results = store
        .list(ListQuery::state("c").metadata("k", json!("v")))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "match");
}

#[tokio::test]
async fn transition_events_are_observable() {
    let store = memory_store(linear_type(), 10).await;
    let mut events = store.subscribe();

    let root = Document::new("a");
    store.add(root.clone()).await.unwrap();
    store.finish_one(root).await.unwrap();

    let mut started = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::TransitionStarted { .. } => started += 1,
            PipelineEvent::TransitionCompleted { .. } => completed += 1,
            _ => {}
        }
    }
    assert_eq!(started, 2);
    assert_eq!(completed, 2);
}

#[cfg(feature = "sqlite")]
mod sqlite_backend {
    use super::*;
    use millrace::{SqliteOptions, SqliteRepository};

    async fn sqlite_store(document_type: DocumentType) -> DocStore {
        let repository = SqliteRepository::open_in_memory(SqliteOptions::default())
            .await
            .unwrap();
        let store = DocStore::builder()
            .repository(Arc::new(repository))
            .document_type(document_type)
            .max_concurrency(4)
            .build()
            .await
            .unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn linear_pipeline_on_sqlite() {
        let store = sqlite_store(linear_type()).await;
        let root = Document::new("a").with_id("D0").with_content("hello");
        store.add(root.clone()).await.unwrap();

        let finished = store.finish_one(root).await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].state, "c");
        assert_eq!(store.count(None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failure_capture_on_sqlite() {
        let document_type = DocumentType::new(
            vec![State::new("a"), State::new("b"), State::new("error")],
            vec![Transition::new("a", "b", |_doc: Document| async move {
                Err(ProcessError::new("RuntimeError", "boom"))
            })],
        )
        .unwrap();
        let store = sqlite_store(document_type).await;

        let root = Document::new("a");
        store.add(root.clone()).await.unwrap();
        let finished = store.finish_one(root.clone()).await.unwrap();

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].state, "error");
        assert_eq!(
            finished[0].metadata.get("failed_transition"),
            Some(&json!("a→b"))
        );
        let parent = store.get(&root.id, false).await.unwrap().unwrap();
        assert_eq!(parent.children.len(), 1);
    }

    #[tokio::test]
    async fn streaming_on_sqlite_uses_bounded_chunks() {
        let store = sqlite_store(linear_type()).await;
        let content: String = (0..10_000)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        store
            .add(Document::new("a").with_id("big").with_content(content.clone()))
            .await
            .unwrap();

        let mut stream = store.stream_content("big", 512).await.unwrap();
        let reassembled = stream.read_to_string().await.unwrap();
        assert_eq!(reassembled, content);
    }

    #[tokio::test]
    async fn cascade_delete_on_sqlite() {
        let store = sqlite_store(linear_type()).await;
        store.add(Document::new("a").with_id("root")).await.unwrap();
        store
            .add(Document::new("b").with_id("child").with_parent_id("root"))
            .await
            .unwrap();
        store
            .add(Document::new("c").with_id("leaf").with_parent_id("child"))
            .await
            .unwrap();

        store.delete("root").await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 0);
    }
}
