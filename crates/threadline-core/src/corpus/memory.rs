//! In-memory archive store
//!
//! Loads a JSON archive of posts and comments and serves filtered record
//! fetches and neighbor lookups from indexes built at load time. The
//! neighbor relation is thread structure: parent, children, and siblings
//! under the same parent.

use super::{CorpusStore, Record, RecordFilter};
use crate::error::{Result, ThreadlineError};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// In-memory corpus backed by a JSON archive
pub struct MemoryStore {
    records: Vec<Record>,
    by_id: HashMap<String, usize>,
    children: HashMap<String, Vec<String>>,
}

impl MemoryStore {
    /// Build a store from records already in memory
    pub fn from_records(records: Vec<Record>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            if record.id.is_empty() {
                return Err(ThreadlineError::Corpus(
                    "archive contains a record with an empty id".to_string(),
                ));
            }
            if by_id.insert(record.id.clone(), idx).is_some() {
                return Err(ThreadlineError::Corpus(format!(
                    "archive contains duplicate record id: {}",
                    record.id
                )));
            }
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for record in &records {
            if let Some(ref parent) = record.parent_id {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(record.id.clone());
            }
        }

        Ok(Self {
            records,
            by_id,
            children,
        })
    }

    /// Load a store from a JSON archive file: a top-level array of
    /// records, or an object with a `records` array
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let records = parse_archive(&content)?;
        tracing::info!("loaded {} records from {}", records.len(), path.display());
        Self::from_records(records)
    }

    /// Number of records in the store
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get(&self, id: &str) -> Option<&Record> {
        self.by_id.get(id).map(|idx| &self.records[*idx])
    }
}

fn parse_archive(content: &str) -> Result<Vec<Record>> {
    #[derive(serde::Deserialize)]
    struct Archive {
        records: Vec<Record>,
    }

    if let Ok(records) = serde_json::from_str::<Vec<Record>>(content) {
        return Ok(records);
    }
    let archive: Archive = serde_json::from_str(content)
        .map_err(|e| ThreadlineError::Corpus(format!("unrecognized archive format: {}", e)))?;
    Ok(archive.records)
}

#[async_trait::async_trait]
impl CorpusStore for MemoryStore {
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let mut matched: Vec<Record> = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn fetch_neighbors(&self, ids: &[String]) -> Result<Vec<Record>> {
        let mut neighbor_ids: BTreeSet<String> = BTreeSet::new();

        for id in ids {
            let Some(record) = self.get(id) else {
                continue;
            };

            if let Some(ref parent) = record.parent_id {
                neighbor_ids.insert(parent.clone());
                // Siblings under the same parent
                if let Some(siblings) = self.children.get(parent) {
                    neighbor_ids.extend(siblings.iter().cloned());
                }
            }
            if let Some(own_children) = self.children.get(id) {
                neighbor_ids.extend(own_children.iter().cloned());
            }
        }

        Ok(neighbor_ids
            .into_iter()
            .filter_map(|id| self.get(&id).cloned())
            .collect())
    }

    async fn list_sources(&self) -> Result<Vec<String>> {
        let sources: BTreeSet<String> =
            self.records.iter().map(|r| r.source.clone()).collect();
        Ok(sources.into_iter().collect())
    }
}
