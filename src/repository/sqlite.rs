//! SQLite-backed repository implementation.
//!
//! This module provides [`SqliteRepository`], a durable implementation of
//! [`DocumentRepository`] backed by SQLite.

use crate::repository::{DocumentRepository, ListQuery};
use crate::{Document, DocumentPatch, MillraceError, Result};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// SQL for creating the documents table.
///
/// `children` is never stored: it is derived on read from `parent_id`,
/// ordered by `rowid`. The metadata column is named `cmetadata` to avoid
/// clashing with names reserved by common object mappers.
const CREATE_DOCUMENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        id          TEXT PRIMARY KEY,
        state       TEXT NOT NULL,
        content     TEXT,
        media_type  TEXT NOT NULL DEFAULT 'text/plain',
        url         TEXT,
        parent_id   TEXT REFERENCES documents(id) ON DELETE CASCADE,
        cmetadata   TEXT NOT NULL DEFAULT '{}'
    )
"#;

/// SQL for creating the schema_version table.
const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

/// Indexes for the common query patterns.
const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_state ON documents (state)",
    "CREATE INDEX IF NOT EXISTS idx_documents_media_type ON documents (media_type)",
    "CREATE INDEX IF NOT EXISTS idx_documents_url ON documents (url)",
    "CREATE INDEX IF NOT EXISTS idx_state_media_type ON documents (state, media_type)",
    "CREATE INDEX IF NOT EXISTS idx_parent_state ON documents (parent_id, state)",
];

const COLUMNS: &str = "id, state, content, media_type, url, parent_id, cmetadata";
const COLUMNS_NO_CONTENT: &str =
    "id, state, NULL AS content, media_type, url, parent_id, cmetadata";

fn select_columns(include_content: bool) -> &'static str {
    if include_content {
        COLUMNS
    } else {
        COLUMNS_NO_CONTENT
    }
}

/// Connection settings forwarded from the store configuration.
///
/// Only the knobs meaningful for an embedded database survive here:
/// `pool_size` is the number of pooled read connections (writes serialize
/// on a dedicated connection, WAL keeps readers concurrent with them) and
/// `busy_timeout` is how long a connection waits on a locked database.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Number of pooled read connections.
    pub pool_size: usize,

    /// How long a connection waits for a lock before failing.
    pub busy_timeout: Duration,
}

impl SqliteOptions {
    /// Sets the read-connection pool size.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the lock wait timeout.
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// A SQLite-backed implementation of [`DocumentRepository`].
///
/// Writes go through one dedicated connection; reads round-robin over a
/// small pool of additional connections, which WAL mode keeps usable while
/// a write is in flight. Every connection is wrapped in a `Mutex` and all
/// database work runs under `spawn_blocking`, making the store safe to use
/// from async contexts.
///
/// # Example
///
/// ```rust,ignore
/// use millrace::{SqliteOptions, SqliteRepository};
///
/// // Open or create a database file
/// let repo = SqliteRepository::open("pipeline.db", SqliteOptions::default()).await?;
/// repo.initialize().await?;
///
/// // Or use an in-memory database for testing
/// let repo = SqliteRepository::open_in_memory(SqliteOptions::default()).await?;
/// ```
pub struct SqliteRepository {
    writer: Arc<Mutex<Connection>>,
    readers: Vec<Arc<Mutex<Connection>>>,
    next_reader: AtomicUsize,
}

/// Maps a rusqlite failure onto the crate's error vocabulary.
fn db_err(err: rusqlite::Error) -> MillraceError {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = err {
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return MillraceError::Conflict(
                    message.clone().unwrap_or_else(|| "duplicate id".to_string()),
                );
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return MillraceError::NotFound("parent document".to_string());
            }
            _ => {}
        }
    }
    MillraceError::Repository(err.to_string())
}

fn open_connection(path: &Path, options: &SqliteOptions) -> Result<Connection> {
    let conn = Connection::open(path).map_err(db_err)?;
    configure_connection(&conn, options)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, options: &SqliteOptions) -> Result<()> {
    // journal_mode reports the resulting mode as a row, so it cannot go
    // through execute().
    let _mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(db_err)?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")
        .map_err(db_err)?;
    conn.busy_timeout(options.busy_timeout).map_err(db_err)?;
    Ok(())
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let metadata_json: String = row.get(6)?;
    let metadata: HashMap<String, JsonValue> = serde_json::from_str(&metadata_json)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    Ok(Document {
        id: row.get(0)?,
        state: row.get(1)?,
        content: row.get(2)?,
        media_type: row.get(3)?,
        url: row.get(4)?,
        parent_id: row.get(5)?,
        children: Vec::new(),
        metadata,
    })
}

fn children_of(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM documents WHERE parent_id = ?1 ORDER BY rowid")
        .map_err(db_err)?;
    let rows = stmt.query_map([id], |row| row.get(0)).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
}

fn attach_children(conn: &Connection, docs: &mut [Document]) -> Result<()> {
    for doc in docs {
        doc.children = children_of(conn, &doc.id)?;
    }
    Ok(())
}

fn insert_row(conn: &Connection, doc: &Document) -> Result<()> {
    let metadata_json = serde_json::to_string(&doc.metadata)?;
    conn.execute(
        "INSERT INTO documents (id, state, content, media_type, url, parent_id, cmetadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            doc.id,
            doc.state,
            doc.content,
            doc.media_type,
            doc.url,
            doc.parent_id,
            metadata_json
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn parent_exists(conn: &Connection, parent_id: &str) -> Result<bool> {
    conn.query_row("SELECT 1 FROM documents WHERE id = ?1", [parent_id], |_| {
        Ok(())
    })
    .optional()
    .map_err(db_err)
    .map(|found| found.is_some())
}

/// Write-once parent linking; children already under this parent are
/// no-ops, children under another parent are conflicts.
fn link_children(conn: &Connection, parent_id: &str, child_ids: &[String]) -> Result<()> {
    if !parent_exists(conn, parent_id)? {
        return Err(MillraceError::NotFound(parent_id.to_string()));
    }
    for child_id in child_ids {
        let current: Option<Option<String>> = conn
            .query_row(
                "SELECT parent_id FROM documents WHERE id = ?1",
                [child_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match current {
            None => return Err(MillraceError::NotFound(child_id.clone())),
            Some(None) => {
                conn.execute(
                    "UPDATE documents SET parent_id = ?1 WHERE id = ?2",
                    params![parent_id, child_id],
                )
                .map_err(db_err)?;
            }
            Some(Some(existing)) if existing == parent_id => {}
            Some(Some(existing)) => {
                return Err(MillraceError::Conflict(format!(
                    "document {child_id} already belongs to {existing}"
                )));
            }
        }
    }
    Ok(())
}

impl SqliteRepository {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist. The schema is not
    /// created here; call
    /// [`initialize`](DocumentRepository::initialize) for that.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be opened or configured.
    pub async fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        tokio::task::spawn_blocking(move || {
            let writer = open_connection(&path, &options)?;
            let mut readers = Vec::with_capacity(options.pool_size.max(1));
            for _ in 0..options.pool_size.max(1) {
                readers.push(Arc::new(Mutex::new(open_connection(&path, &options)?)));
            }
            Ok(Self {
                writer: Arc::new(Mutex::new(writer)),
                readers,
                next_reader: AtomicUsize::new(0),
            })
        })
        .await
        .map_err(|e| MillraceError::Repository(format!("spawn_blocking failed: {e}")))?
    }

    /// Opens an in-memory SQLite database.
    ///
    /// Useful for testing. An in-memory database is private to its
    /// connection, so the read pool degenerates to the single writer
    /// connection and `pool_size` is ignored. The database is lost when
    /// the repository is dropped.
    pub async fn open_in_memory(options: SqliteOptions) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_in_memory().map_err(db_err)?;
            configure_connection(&conn, &options)?;
            let writer = Arc::new(Mutex::new(conn));
            Ok(Self {
                readers: vec![Arc::clone(&writer)],
                writer,
                next_reader: AtomicUsize::new(0),
            })
        })
        .await
        .map_err(|e| MillraceError::Repository(format!("spawn_blocking failed: {e}")))?
    }

    fn reader(&self) -> Arc<Mutex<Connection>> {
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        Arc::clone(&self.readers[index])
    }

    async fn with_writer<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| MillraceError::Repository(format!("spawn_blocking failed: {e}")))?
    }

    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.reader();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| MillraceError::Repository(format!("spawn_blocking failed: {e}")))?
    }

    /// Checks if the required tables exist.
    ///
    /// Useful for testing that the schema was created correctly.
    pub async fn tables_exist(&self) -> Result<bool> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table'
                     AND name IN ('documents', 'schema_version')",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            let tables = rows
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(db_err)?;
            Ok(tables.len() == 2)
        })
        .await
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository")
            .field("readers", &self.readers.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DocumentRepository for SqliteRepository {
    async fn initialize(&self) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(CREATE_SCHEMA_VERSION_TABLE, []).map_err(db_err)?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;

            if version.unwrap_or(0) < SCHEMA_VERSION {
                conn.execute(CREATE_DOCUMENTS_TABLE, []).map_err(db_err)?;
                for index_sql in CREATE_INDEXES {
                    conn.execute(index_sql, []).map_err(db_err)?;
                }
                conn.execute("DELETE FROM schema_version", []).map_err(db_err)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(db_err)?;
            }
            Ok(())
        })
        .await
    }

    async fn dispose(&self) -> Result<()> {
        self.with_writer(|conn| {
            // Flush the write-ahead log; connections close on drop.
            let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
            Ok(())
        })
        .await
    }

    async fn insert(&self, doc: &Document) -> Result<String> {
        let doc = doc.clone();
        self.with_writer(move |conn| {
            insert_row(conn, &doc)?;
            Ok(doc.id)
        })
        .await
    }

    async fn insert_many(&self, docs: &[Document]) -> Result<Vec<String>> {
        let docs = docs.to_vec();
        self.with_writer(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let mut ids = Vec::with_capacity(docs.len());
            for doc in &docs {
                insert_row(&tx, doc)?;
                ids.push(doc.id.clone());
            }
            tx.commit().map_err(db_err)?;
            Ok(ids)
        })
        .await
    }

    async fn insert_children(&self, parent_id: &str, docs: &[Document]) -> Result<Vec<String>> {
        let parent_id = parent_id.to_string();
        let docs = docs.to_vec();
        self.with_writer(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            if !parent_exists(&tx, &parent_id)? {
                return Err(MillraceError::NotFound(parent_id));
            }
            let mut ids = Vec::with_capacity(docs.len());
            for doc in &docs {
                if doc.parent_id.as_deref() != Some(parent_id.as_str()) {
                    return Err(MillraceError::Conflict(format!(
                        "document {} does not point at parent {parent_id}",
                        doc.id
                    )));
                }
                insert_row(&tx, doc)?;
                ids.push(doc.id.clone());
            }
            tx.commit().map_err(db_err)?;
            Ok(ids)
        })
        .await
    }

    async fn get(&self, id: &str, include_content: bool) -> Result<Option<Document>> {
        let id = id.to_string();
        self.with_reader(move |conn| {
            let sql = format!(
                "SELECT {} FROM documents WHERE id = ?1",
                select_columns(include_content)
            );
            let doc = conn
                .query_row(&sql, [&id], row_to_document)
                .optional()
                .map_err(db_err)?;
            match doc {
                Some(mut doc) => {
                    doc.children = children_of(conn, &doc.id)?;
                    Ok(Some(doc))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_by_state(&self, state: &str, include_content: bool) -> Result<Vec<Document>> {
        let state = state.to_string();
        self.with_reader(move |conn| {
            let sql = format!(
                "SELECT {} FROM documents WHERE state = ?1 ORDER BY rowid",
                select_columns(include_content)
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt.query_map([&state], row_to_document).map_err(db_err)?;
            let mut docs = rows
                .collect::<rusqlite::Result<Vec<Document>>>()
                .map_err(db_err)?;
            attach_children(conn, &mut docs)?;
            Ok(docs)
        })
        .await
    }

    async fn get_all(&self, include_content: bool) -> Result<Vec<Document>> {
        self.with_reader(move |conn| {
            let sql = format!(
                "SELECT {} FROM documents ORDER BY rowid",
                select_columns(include_content)
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt.query_map([], row_to_document).map_err(db_err)?;
            let mut docs = rows
                .collect::<rusqlite::Result<Vec<Document>>>()
                .map_err(db_err)?;
            attach_children(conn, &mut docs)?;
            Ok(docs)
        })
        .await
    }

    async fn get_batch(&self, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.with_reader(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!("SELECT {COLUMNS} FROM documents WHERE id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(ids.iter()), row_to_document)
                .map_err(db_err)?;
            let mut by_id: HashMap<String, Document> = rows
                .collect::<rusqlite::Result<Vec<Document>>>()
                .map_err(db_err)?
                .into_iter()
                .map(|doc| (doc.id.clone(), doc))
                .collect();

            let mut docs = Vec::with_capacity(by_id.len());
            for id in &ids {
                if let Some(doc) = by_id.remove(id) {
                    docs.push(doc);
                }
            }
            attach_children(conn, &mut docs)?;
            Ok(docs)
        })
        .await
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Document>> {
        let query = query.clone();
        self.with_reader(move |conn| {
            let mut sql = format!(
                "SELECT {} FROM documents WHERE state = ?1",
                select_columns(query.include_content)
            );
            if query.leaf_only {
                sql.push_str(
                    " AND NOT EXISTS (SELECT 1 FROM documents c WHERE c.parent_id = documents.id)",
                );
            }
            sql.push_str(" ORDER BY rowid");

            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map([&query.state], row_to_document)
                .map_err(db_err)?;
            let mut docs = rows
                .collect::<rusqlite::Result<Vec<Document>>>()
                .map_err(db_err)?;
            docs.retain(|doc| query.matches_metadata(&doc.metadata));
            attach_children(conn, &mut docs)?;
            Ok(docs)
        })
        .await
    }

    async fn update(&self, id: &str, patch: &DocumentPatch) -> Result<Document> {
        let id = id.to_string();
        let patch = patch.clone();
        self.with_writer(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;

            let metadata_json: Option<String> = tx
                .query_row(
                    "SELECT cmetadata FROM documents WHERE id = ?1",
                    [&id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let metadata_json =
                metadata_json.ok_or_else(|| MillraceError::NotFound(id.clone()))?;

            if !patch.metadata.is_empty() {
                let mut metadata: HashMap<String, JsonValue> =
                    serde_json::from_str(&metadata_json)?;
                for (key, value) in &patch.metadata {
                    metadata.insert(key.clone(), value.clone());
                }
                tx.execute(
                    "UPDATE documents SET cmetadata = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&metadata)?, id],
                )
                .map_err(db_err)?;
            }
            if !patch.children.is_empty() {
                link_children(&tx, &id, &patch.children)?;
            }
            tx.commit().map_err(db_err)?;

            let mut doc = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM documents WHERE id = ?1"),
                    [&id],
                    row_to_document,
                )
                .map_err(db_err)?;
            doc.children = children_of(conn, &doc.id)?;
            Ok(doc)
        })
        .await
    }

    async fn append_children(&self, parent_id: &str, child_ids: &[String]) -> Result<()> {
        let parent_id = parent_id.to_string();
        let child_ids = child_ids.to_vec();
        self.with_writer(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            link_children(&tx, &parent_id, &child_ids)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_writer(move |conn| {
            let affected = conn
                .execute("DELETE FROM documents WHERE id = ?1", [&id])
                .map_err(db_err)?;
            if affected == 0 {
                return Err(MillraceError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn count(&self, state: Option<&str>) -> Result<u64> {
        let state = state.map(str::to_string);
        self.with_reader(move |conn| {
            let count: i64 = match state {
                Some(state) => conn
                    .query_row(
                        "SELECT COUNT(*) FROM documents WHERE state = ?1",
                        [&state],
                        |row| row.get(0),
                    )
                    .map_err(db_err)?,
                None => conn
                    .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
                    .map_err(db_err)?,
            };
            Ok(count as u64)
        })
        .await
    }

    async fn content_length(&self, id: &str) -> Result<Option<u64>> {
        let id = id.to_string();
        self.with_reader(move |conn| {
            // length() counts characters on TEXT, matching the chunk math.
            let length: Option<Option<i64>> = conn
                .query_row(
                    "SELECT length(content) FROM documents WHERE id = ?1",
                    [&id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match length {
                None => Err(MillraceError::NotFound(id)),
                Some(length) => Ok(length.map(|chars| chars as u64)),
            }
        })
        .await
    }

    async fn content_chunk(&self, id: &str, offset_chars: u64, max_chars: u64) -> Result<String> {
        let id = id.to_string();
        self.with_reader(move |conn| {
            // substr() is 1-based and character-oriented on TEXT.
            let chunk: Option<Option<String>> = conn
                .query_row(
                    "SELECT substr(content, ?2, ?3) FROM documents WHERE id = ?1",
                    params![id, (offset_chars + 1) as i64, max_chars as i64],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match chunk {
                None => Err(MillraceError::NotFound(id)),
                Some(None) => Err(MillraceError::NoContent(id)),
                Some(Some(chunk)) => Ok(chunk),
            }
        })
        .await
    }
}
