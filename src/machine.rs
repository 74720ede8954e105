//! The document state machine.
//!
//! This module defines the vertices ([`State`]), the edges ([`Transition`],
//! each carrying a user-supplied asynchronous processing function), and the
//! machine itself ([`DocumentType`]) with its lazily built lookup caches.
//!
//! A processing function takes one [`Document`] and produces one or more
//! documents ([`ProcessOutput`]), or fails with a [`ProcessError`]. The
//! machine is never persisted; storage only ever sees state *names*.

use crate::{Document, MillraceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

/// A named vertex in the document state machine.
///
/// Equality and hashing are by name only, and a `State` compares equal to
/// the bare string with the same characters, so lookup sites can take
/// either form.
///
/// # Example
///
/// ```
/// use millrace::State;
///
/// let state = State::new("download");
/// assert_eq!(state, "download");
/// assert_eq!(state, State::from("download"));
/// ```
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct State {
    /// The state's name.
    pub name: String,
}

impl State {
    /// Creates a state with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Hash for State {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.name.hash(hasher);
    }
}

impl PartialEq<str> for State {
    fn eq(&self, other: &str) -> bool {
        self.name == other
    }
}

impl PartialEq<&str> for State {
    fn eq(&self, other: &&str) -> bool {
        self.name == *other
    }
}

impl PartialEq<String> for State {
    fn eq(&self, other: &String) -> bool {
        &self.name == other
    }
}

impl From<&str> for State {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for State {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl AsRef<str> for State {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A failure raised by a user processing function.
///
/// The engine never re-raises these; it materializes them as error
/// documents whose metadata records `kind` and `message`.
///
/// # Example
///
/// ```
/// use millrace::ProcessError;
///
/// let err = ProcessError::new("FetchError", "connection refused");
/// assert_eq!(err.to_string(), "FetchError: connection refused");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    /// Short label for the failure class.
    pub kind: String,

    /// Human-readable failure description.
    pub message: String,
}

impl ProcessError {
    /// Creates a processing error with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wraps any error, using its short type name as the kind.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error");
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProcessError {}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        Self::new("ProcessError", message)
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        Self::new("ProcessError", message)
    }
}

/// The result of a processing function: one document or several.
#[derive(Debug, Clone)]
pub enum ProcessOutput {
    /// A single produced document.
    One(Document),

    /// An ordered fan-out of produced documents. May be empty, in which
    /// case the transition contributes nothing.
    Many(Vec<Document>),
}

impl ProcessOutput {
    /// Normalizes the output to a list.
    pub fn into_documents(self) -> Vec<Document> {
        match self {
            ProcessOutput::One(doc) => vec![doc],
            ProcessOutput::Many(docs) => docs,
        }
    }

    /// Returns the number of produced documents.
    pub fn len(&self) -> usize {
        match self {
            ProcessOutput::One(_) => 1,
            ProcessOutput::Many(docs) => docs.len(),
        }
    }

    /// Returns true if no documents were produced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Document> for ProcessOutput {
    fn from(doc: Document) -> Self {
        ProcessOutput::One(doc)
    }
}

impl From<Vec<Document>> for ProcessOutput {
    fn from(docs: Vec<Document>) -> Self {
        ProcessOutput::Many(docs)
    }
}

/// The boxed future returned by a processing function.
pub type ProcessFuture =
    Pin<Box<dyn Future<Output = std::result::Result<ProcessOutput, ProcessError>> + Send>>;

/// A shared, type-erased processing function.
pub type ProcessFn = Arc<dyn Fn(Document) -> ProcessFuture + Send + Sync>;

/// An edge of the state machine: a source state, a target state, and the
/// processing function that carries documents across.
///
/// # Example
///
/// ```
/// use millrace::{Document, ProcessOutput, Transition};
///
/// let identity = Transition::new("download", "chunk", |doc: Document| async move {
///     Ok(ProcessOutput::One(Document::draft().with_content(
///         doc.content.unwrap_or_default(),
///     )))
/// });
/// assert_eq!(identity.label(), "download→chunk");
/// ```
#[derive(Clone)]
pub struct Transition {
    /// The state this transition leaves from.
    pub from_state: State,

    /// The state documents produced by this transition default to.
    pub to_state: State,

    process: ProcessFn,
}

impl Transition {
    /// Creates a transition from an async closure.
    pub fn new<F, Fut>(from: impl Into<State>, to: impl Into<State>, process: F) -> Self
    where
        F: Fn(Document) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<ProcessOutput, ProcessError>> + Send + 'static,
    {
        Self {
            from_state: from.into(),
            to_state: to.into(),
            process: Arc::new(move |doc| Box::pin(process(doc))),
        }
    }

    /// Invokes the processing function on a document.
    pub fn process(&self, doc: Document) -> ProcessFuture {
        (self.process)(doc)
    }

    /// Returns the `"<from>→<to>"` label used in logs and error metadata.
    pub fn label(&self) -> String {
        format!("{}→{}", self.from_state, self.to_state)
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from_state", &self.from_state.name)
            .field("to_state", &self.to_state.name)
            .finish_non_exhaustive()
    }
}

/// The state machine a pipeline's documents move through.
///
/// Construction validates that every transition endpoint names a declared
/// state. The type is immutable once built; the orchestrator replaces it
/// wholesale, which also discards the lookup caches.
///
/// # Example
///
/// ```
/// use millrace::{Document, DocumentType, ProcessOutput, State, Transition};
///
/// let dt = DocumentType::new(
///     vec![State::new("raw"), State::new("done")],
///     vec![Transition::new("raw", "done", |_doc: Document| async move {
///         Ok(ProcessOutput::One(Document::draft()))
///     })],
/// )
/// .unwrap();
///
/// assert_eq!(dt.transitions_from("raw").len(), 1);
/// assert!(dt.is_final("done"));
/// ```
pub struct DocumentType {
    states: Vec<State>,
    transitions: Vec<Transition>,
    transition_index: OnceLock<HashMap<String, Vec<Transition>>>,
    final_names: OnceLock<HashSet<String>>,
}

impl DocumentType {
    /// Builds a machine from its states and transitions.
    ///
    /// # Errors
    ///
    /// Returns [`MillraceError::Configuration`] if any transition
    /// references an undeclared state.
    pub fn new(states: Vec<State>, transitions: Vec<Transition>) -> Result<Self> {
        let declared: HashSet<&str> = states.iter().map(|s| s.name.as_str()).collect();
        for transition in &transitions {
            if !declared.contains(transition.from_state.name.as_str()) {
                return Err(MillraceError::Configuration(format!(
                    "transition references unknown from_state: {}",
                    transition.from_state
                )));
            }
            if !declared.contains(transition.to_state.name.as_str()) {
                return Err(MillraceError::Configuration(format!(
                    "transition references unknown to_state: {}",
                    transition.to_state
                )));
            }
        }

        Ok(Self {
            states,
            transitions,
            transition_index: OnceLock::new(),
            final_names: OnceLock::new(),
        })
    }

    /// Returns the declared states.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// Returns all transitions.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Returns true if the given name is a declared state.
    pub fn has_state(&self, name: impl AsRef<str>) -> bool {
        let name = name.as_ref();
        self.states.iter().any(|s| s.name == name)
    }

    fn index(&self) -> &HashMap<String, Vec<Transition>> {
        self.transition_index.get_or_init(|| {
            let mut index: HashMap<String, Vec<Transition>> = HashMap::new();
            for transition in &self.transitions {
                index
                    .entry(transition.from_state.name.clone())
                    .or_default()
                    .push(transition.clone());
            }
            index
        })
    }

    /// Returns the outgoing transitions of a state, possibly empty.
    ///
    /// Accepts a [`State`] or a bare name; equal names give identical
    /// results. The index is built on first access.
    pub fn transitions_from(&self, state: impl AsRef<str>) -> &[Transition] {
        self.index()
            .get(state.as_ref())
            .map(|transitions| transitions.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the names of states with no outgoing transitions.
    pub fn final_state_names(&self) -> &HashSet<String> {
        self.final_names.get_or_init(|| {
            let sources: HashSet<&str> = self
                .transitions
                .iter()
                .map(|t| t.from_state.name.as_str())
                .collect();
            self.states
                .iter()
                .filter(|s| !sources.contains(s.name.as_str()))
                .map(|s| s.name.clone())
                .collect()
        })
    }

    /// Returns true if the named state has no outgoing transitions.
    pub fn is_final(&self, state: impl AsRef<str>) -> bool {
        self.transitions_from(state).is_empty()
    }
}

impl fmt::Debug for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentType")
            .field("states", &self.states)
            .field("transition_count", &self.transitions.len())
            .finish()
    }
}
