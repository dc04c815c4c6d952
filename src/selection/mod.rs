//! Selection engine boundary and the reference document repository
//!
//! The engine never interprets queries itself: it asks a [`SelectionEngine`]
//! to scroll matching record ids page by page, to count them when it can,
//! and to test whether any record matches (migration probes).

pub mod query;
pub mod repository;

pub use query::{Condition, Operator, Query};
pub use repository::{Document, SqliteRepository};

use crate::error::SelectionResult;

/// Forward-only cursor over matching record ids
pub trait Cursor: Send {
    /// Next page of ids, `None` once exhausted
    fn next_page(&mut self) -> SelectionResult<Option<Vec<String>>>;
}

/// Query/selection engine consumed by the scroller and migration probes
pub trait SelectionEngine: Send + Sync {
    /// Open a cursor over ids matching `query`, `page_size` ids per page
    fn scroll(&self, query: &str, page_size: usize) -> SelectionResult<Box<dyn Cursor>>;

    /// Number of matching records, when the engine can tell cheaply
    fn count(&self, query: &str) -> SelectionResult<Option<u64>>;

    /// Whether at least one record matches
    fn exists(&self, query: &str) -> SelectionResult<bool> {
        let mut cursor = self.scroll(query, 1)?;
        Ok(cursor
            .next_page()?
            .map(|page| !page.is_empty())
            .unwrap_or(false))
    }
}
