//! Pipeline execution events.
//!
//! This module provides [`PipelineEvent`] for observing document
//! processing. Events are broadcast through a channel that can be
//! subscribed to for monitoring, logging, or building UIs.

/// An event emitted while the pipeline advances documents.
///
/// Events use `String` for document ids and state names to keep the type
/// simple and easy to serialize for logging or transmission.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PipelineEvent {
    /// A transition began executing for a document.
    TransitionStarted {
        /// The processed document's id.
        doc_id: String,
        /// The transition's source state.
        from: String,
        /// The transition's target state.
        to: String,
    },

    /// A transition completed and its children were persisted.
    TransitionCompleted {
        /// The processed document's id.
        doc_id: String,
        /// The transition's source state.
        from: String,
        /// The transition's target state.
        to: String,
        /// Ids of the persisted child documents.
        children: Vec<String>,
    },

    /// A processing function failed; an error document was persisted.
    TransitionFailed {
        /// The processed document's id.
        doc_id: String,
        /// The transition's source state.
        from: String,
        /// The transition's target state.
        to: String,
        /// Rendered failure description.
        error: String,
    },

    /// One `finish` wave drained; the next wave holds `produced` documents.
    WaveCompleted {
        /// Number of documents produced by the wave.
        produced: usize,
    },
}

impl PipelineEvent {
    /// Returns the document id for per-document events.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::TransitionStarted { doc_id, .. }
            | PipelineEvent::TransitionCompleted { doc_id, .. }
            | PipelineEvent::TransitionFailed { doc_id, .. } => Some(doc_id),
            PipelineEvent::WaveCompleted { .. } => None,
        }
    }

    /// Returns the `(from, to)` state pair for transition events.
    pub fn transition(&self) -> Option<(&str, &str)> {
        match self {
            PipelineEvent::TransitionStarted { from, to, .. }
            | PipelineEvent::TransitionCompleted { from, to, .. }
            | PipelineEvent::TransitionFailed { from, to, .. } => Some((from, to)),
            PipelineEvent::WaveCompleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_accessor() {
        let event = PipelineEvent::TransitionStarted {
            doc_id: "doc-1".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
        };
        assert_eq!(event.doc_id(), Some("doc-1"));

        let wave = PipelineEvent::WaveCompleted { produced: 3 };
        assert_eq!(wave.doc_id(), None);
    }

    #[test]
    fn test_transition_accessor() {
        let event = PipelineEvent::TransitionFailed {
            doc_id: "doc-1".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
            error: "boom".to_string(),
        };
        assert_eq!(event.transition(), Some(("a", "b")));
    }

    #[test]
    fn test_completed_carries_children() {
        let event = PipelineEvent::TransitionCompleted {
            doc_id: "doc-1".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
            children: vec!["c1".to_string(), "c2".to_string()],
        };
        match event {
            PipelineEvent::TransitionCompleted { children, .. } => {
                assert_eq!(children.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_clone_and_debug() {
        let event = PipelineEvent::WaveCompleted { produced: 7 };
        let cloned = event.clone();
        let debug = format!("{:?}", cloned);
        assert!(debug.contains("WaveCompleted"));
        assert!(debug.contains('7'));
    }
}
