//! Bounded link-graph context expansion
//!
//! Breadth-first walk over the corpus store's neighbor relation,
//! starting from the high-relevance seed set. The walk is bounded both
//! by depth and by a node budget on top of the seeds, and is cycle-safe.
//! Graph lookups are cheap next to LLM calls, so the traversal runs
//! sequentially relative to its caller. Neighbor fetches go through a
//! circuit breaker; a tripped breaker degrades expansion to whatever
//! was gathered so far instead of failing the stage.

use crate::corpus::{CorpusStore, Record};
use crate::error::Result;
use crate::llm::CircuitBreaker;
use std::collections::HashSet;
use std::sync::Arc;

/// Bounded breadth-first context expander
pub struct ContextExpander {
    store: Arc<dyn CorpusStore>,
    breaker: Arc<CircuitBreaker>,
    max_depth: usize,
    max_additional_nodes: usize,
}

impl ContextExpander {
    pub fn new(
        store: Arc<dyn CorpusStore>,
        breaker: Arc<CircuitBreaker>,
        max_depth: usize,
        max_additional_nodes: usize,
    ) -> Self {
        Self {
            store,
            breaker,
            max_depth,
            max_additional_nodes,
        }
    }

    /// Expand a seed set with linked context records.
    ///
    /// Returns only newly discovered records; seeds are never re-added
    /// or re-scored. The result never exceeds `max_additional_nodes`
    /// records and never explores past `max_depth` levels.
    pub async fn expand(&self, seed_ids: &HashSet<String>) -> Result<Vec<Record>> {
        let budget = seed_ids.len() + self.max_additional_nodes;
        let mut visited: HashSet<String> = seed_ids.clone();
        let mut frontier: Vec<String> = {
            let mut ids: Vec<String> = seed_ids.iter().cloned().collect();
            ids.sort_unstable();
            ids
        };
        let mut gathered: Vec<Record> = Vec::new();

        for depth in 0..self.max_depth {
            if frontier.is_empty() || visited.len() >= budget {
                break;
            }

            let neighbors = match self
                .breaker
                .call(|| async { self.store.fetch_neighbors(&frontier).await })
                .await
            {
                Ok(neighbors) => neighbors,
                Err(err) => {
                    tracing::warn!(
                        depth,
                        gathered = gathered.len(),
                        "context expansion degraded: {}",
                        err
                    );
                    break;
                }
            };

            let mut next_frontier = Vec::new();
            for record in neighbors {
                if visited.len() >= budget {
                    break;
                }
                if visited.insert(record.id.clone()) {
                    next_frontier.push(record.id.clone());
                    gathered.push(record);
                }
            }

            tracing::debug!(
                depth,
                added = next_frontier.len(),
                total = gathered.len(),
                "expansion level complete"
            );
            frontier = next_frontier;
        }

        Ok(gathered)
    }
}
