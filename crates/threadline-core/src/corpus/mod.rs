//! Corpus access abstraction
//!
//! The engine never owns persistence. It consumes a `CorpusStore` that
//! can fetch archived records by filter and resolve link-graph neighbors
//! of a record set. The bundled `MemoryStore` loads a JSON archive and
//! derives the neighbor relation from thread structure.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One archived post or comment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier within the archive
    pub id: String,

    /// Full text content
    pub content: String,

    /// Author handle
    pub author: String,

    /// Original publication time
    pub timestamp: DateTime<Utc>,

    /// Source (channel/expert) this record belongs to
    pub source: String,

    /// Parent record for comments, absent for top-level posts
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Filter for fetching records
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to one source
    pub source: Option<String>,

    /// Restrict to one author
    pub author: Option<String>,

    /// Only records at or after this time
    pub after: Option<DateTime<Utc>>,

    /// Only records before this time
    pub before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    /// Filter matching one source
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    /// Check whether a record passes this filter
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(ref source) = self.source {
            if &record.source != source {
                return false;
            }
        }
        if let Some(ref author) = self.author {
            if &record.author != author {
                return false;
            }
        }
        if let Some(after) = self.after {
            if record.timestamp < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if record.timestamp >= before {
                return false;
            }
        }
        true
    }
}

/// Corpus store trait - all archive backends must implement this
#[async_trait::async_trait]
pub trait CorpusStore: Send + Sync {
    /// Fetch records matching a filter, ordered by id
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Fetch link-graph neighbors of a record set. May include records
    /// from the input set; callers are expected to deduplicate.
    async fn fetch_neighbors(&self, ids: &[String]) -> Result<Vec<Record>>;

    /// Distinct source identifiers present in the corpus
    async fn list_sources(&self) -> Result<Vec<String>>;
}
