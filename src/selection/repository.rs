//! SQLite document repository
//!
//! Documents have an id, a type, a title and string properties. Scrolling is
//! keyset-based on the id, so a cursor never holds a statement or a lock
//! between pages and documents created behind the cursor are not revisited.

use crate::error::{SelectionResult, StoreResult};
use crate::selection::{Cursor, Query, SelectionEngine};
use crate::store::schema::BUSY_TIMEOUT;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const CREATE_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    doc_type TEXT NOT NULL,
    title TEXT NOT NULL,
    properties TEXT NOT NULL   -- JSON object of string properties
)
"#;

/// Rows fetched per round trip while filtering
const SCAN_CHUNK: usize = 512;

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub title: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Document {
    /// Document with no properties
    pub fn new(id: &str, doc_type: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            doc_type: doc_type.to_string(),
            title: title.to_string(),
            properties: BTreeMap::new(),
        }
    }

    /// Document with a fresh random id
    pub fn with_random_id(doc_type: &str, title: &str) -> Self {
        Self::new(&Uuid::new_v4().to_string(), doc_type, title)
    }
}

/// Repository of documents implementing [`SelectionEngine`]
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open a repository on a database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| crate::error::StoreError::OpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::init(conn)
    }

    /// Open a private in-memory repository
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute(CREATE_DOCUMENTS_TABLE, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace documents in one transaction
    pub fn save_all(&self, docs: &[Document]) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO documents (id, doc_type, title, properties) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for doc in docs {
                let properties = serde_json::to_string(&doc.properties)?;
                stmt.execute(params![doc.id, doc.doc_type, doc.title, properties])?;
            }
        }
        tx.commit()?;
        Ok(docs.len())
    }

    /// Insert or replace one document
    pub fn save(&self, doc: &Document) -> StoreResult<()> {
        self.save_all(std::slice::from_ref(doc))?;
        Ok(())
    }

    /// Look up a document
    pub fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.conn.lock();
        let doc = conn
            .query_row(
                "SELECT id, doc_type, title, properties FROM documents WHERE id = ?1",
                [id],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    /// Delete a document, returns whether it existed
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM documents WHERE id = ?1", [id])? == 1)
    }

    /// Number of stored documents
    pub fn len(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Whether the repository holds no document
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Next chunk of documents with an id greater than `after`
    fn scan_after(&self, after: Option<&str>, limit: usize) -> SelectionResult<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, doc_type, title, properties FROM documents \
             WHERE ?1 IS NULL OR id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let docs = stmt
            .query_map(params![after, limit as i64], document_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }
}

impl SelectionEngine for SqliteRepository {
    fn scroll(&self, query: &str, page_size: usize) -> SelectionResult<Box<dyn Cursor>> {
        Ok(Box::new(DocumentCursor {
            repository: self.clone(),
            query: Query::parse(query)?,
            page_size: page_size.max(1),
            last_id: None,
            exhausted: false,
        }))
    }

    fn count(&self, query: &str) -> SelectionResult<Option<u64>> {
        // Only the full scan has a cheap count
        if Query::parse(query)?.is_all() {
            let conn = self.conn.lock();
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
            return Ok(Some(count as u64));
        }
        Ok(None)
    }
}

struct DocumentCursor {
    repository: SqliteRepository,
    query: Query,
    page_size: usize,
    last_id: Option<String>,
    exhausted: bool,
}

impl Cursor for DocumentCursor {
    fn next_page(&mut self) -> SelectionResult<Option<Vec<String>>> {
        let mut page = Vec::with_capacity(self.page_size);
        while !self.exhausted && page.len() < self.page_size {
            let chunk = self
                .repository
                .scan_after(self.last_id.as_deref(), SCAN_CHUNK.max(self.page_size))?;
            if chunk.len() < SCAN_CHUNK.max(self.page_size) {
                self.exhausted = true;
            }
            for doc in chunk {
                self.last_id = Some(doc.id.clone());
                if self.query.matches(&doc) {
                    page.push(doc.id);
                    if page.len() == self.page_size {
                        // Resume right after the last returned id
                        self.exhausted = false;
                        break;
                    }
                }
            }
        }

        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    let properties: String = row.get(3)?;
    let properties = serde_json::from_str(&properties).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Document {
        id: row.get(0)?,
        doc_type: row.get(1)?,
        title: row.get(2)?,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(n: usize) -> SqliteRepository {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let docs: Vec<Document> = (0..n)
            .map(|i| {
                let kind = if i % 2 == 0 { "File" } else { "Note" };
                Document::new(&format!("doc-{:04}", i), kind, &format!("Title {}", i))
            })
            .collect();
        repo.save_all(&docs).unwrap();
        repo
    }

    fn scroll_all(repo: &SqliteRepository, query: &str, page_size: usize) -> Vec<Vec<String>> {
        let mut cursor = repo.scroll(query, page_size).unwrap();
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_page().unwrap() {
            pages.push(page);
        }
        pages
    }

    #[test]
    fn test_scroll_pages_in_id_order() {
        let repo = repository(10);
        let pages = scroll_all(&repo, "*", 4);

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], vec!["doc-0000", "doc-0001", "doc-0002", "doc-0003"]);
        assert_eq!(pages[2].len(), 2);
    }

    #[test]
    fn test_scroll_filters() {
        let repo = repository(1200);
        let pages = scroll_all(&repo, "type = 'Note'", 250);

        let ids: Vec<String> = pages.into_iter().flatten().collect();
        assert_eq!(ids.len(), 600);
        assert_eq!(ids[0], "doc-0001");
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_count_and_exists() {
        let repo = repository(5);
        assert_eq!(repo.count("*").unwrap(), Some(5));
        assert_eq!(repo.count("type = 'File'").unwrap(), None);
        assert!(repo.exists("title = 'Title 3'").unwrap());
        assert!(!repo.exists("title = 'Missing'").unwrap());
        assert!(repo.scroll("bogus", 10).is_err());
    }

    #[test]
    fn test_save_get_delete() {
        let repo = repository(0);
        assert!(repo.is_empty().unwrap());

        let mut doc = Document::with_random_id("File", "hello");
        doc.properties.insert("lang".into(), "en".into());
        repo.save(&doc).unwrap();
        assert_eq!(repo.get(&doc.id).unwrap(), Some(doc.clone()));

        assert!(repo.delete(&doc.id).unwrap());
        assert!(repo.get(&doc.id).unwrap().is_none());
        assert!(repo.scroll("*", 10).unwrap().next_page().unwrap().is_none());
    }
}
