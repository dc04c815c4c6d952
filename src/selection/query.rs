//! Query language of the document repository
//!
//! ```text
//! *                                      every document
//! type = 'File'                          field equals value
//! type = 'File' AND title != 'x'         clauses joined by AND
//! status = 'it''s'                       quotes doubled inside values
//! ```
//!
//! Fields are `id`, `type`, `title`, or any property name. A missing
//! property never equals a value and always differs from one.

use crate::error::{SelectionError, SelectionResult};
use crate::selection::Document;
use regex::Regex;
use std::sync::LazyLock;

/// One `field op 'value'` clause at the start of the input
static CLAUSE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(=|!=)\s*'((?:[^']|'')*)'\s*")
        .expect("Invalid query clause regex")
});

/// Clause separator
static AND_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^AND\s+").expect("Invalid query separator regex"));

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
}

/// A single comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub value: String,
}

impl Condition {
    fn matches(&self, doc: &Document) -> bool {
        let actual = match self.field.as_str() {
            "id" => Some(doc.id.as_str()),
            "type" => Some(doc.doc_type.as_str()),
            "title" => Some(doc.title.as_str()),
            name => doc.properties.get(name).map(String::as_str),
        };
        match self.op {
            Operator::Eq => actual == Some(self.value.as_str()),
            Operator::Ne => actual != Some(self.value.as_str()),
        }
    }
}

/// Parsed query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// `*`
    All,
    /// Conjunction of conditions
    Conditions(Vec<Condition>),
}

impl Query {
    /// Parse a query string
    pub fn parse(input: &str) -> SelectionResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid(input, "empty query"));
        }
        if trimmed == "*" {
            return Ok(Query::All);
        }

        let mut conditions = Vec::new();
        let mut rest = trimmed;
        loop {
            let caps = CLAUSE_REGEX
                .captures(rest)
                .ok_or_else(|| invalid(input, &format!("expected field = 'value' at '{}'", rest)))?;
            let op = match &caps[2] {
                "=" => Operator::Eq,
                _ => Operator::Ne,
            };
            conditions.push(Condition {
                field: caps[1].to_string(),
                op,
                value: caps[3].replace("''", "'"),
            });
            rest = &rest[caps[0].len()..];

            if rest.is_empty() {
                break;
            }
            let sep = AND_REGEX
                .find(rest)
                .ok_or_else(|| invalid(input, &format!("expected AND at '{}'", rest)))?;
            rest = &rest[sep.end()..];
        }

        Ok(Query::Conditions(conditions))
    }

    /// Whether a document satisfies the query
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::All => true,
            Query::Conditions(conditions) => conditions.iter().all(|c| c.matches(doc)),
        }
    }

    /// Whether this is the match-everything query
    pub fn is_all(&self) -> bool {
        matches!(self, Query::All)
    }
}

fn invalid(query: &str, reason: &str) -> SelectionError {
    SelectionError::InvalidQuery {
        query: query.to_string(),
        reason: reason.to_string(),
    }
}
