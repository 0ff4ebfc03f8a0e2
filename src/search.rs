//! Semantic search orchestration: ensure index, embed query, cosine search,
//! optional rerank. `global_search` fans the same query out across every
//! registered project.

use crate::core::decay::effective_decay;
use crate::core::models::{GlobalSearchResult, SearchResult};
use crate::error::Result;
use crate::index::{build_index, SearchOptions};
use crate::ollama::OllamaClient;
use crate::registry;
use crate::rerank::rerank;
use crate::storage::NdjsonStorage;

/// How many candidates the reranker sees per requested result.
const RERANK_POOL_FACTOR: usize = 3;

/// Query-time options for [`semantic_search`].
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Number of results.
    pub top_k: usize,
    /// Filter: `session` / `plan` / `todo` / `task`.
    pub artifact_type: Option<String>,
    /// Second-pass LLM rerank.
    pub rerank: bool,
    /// Disable the decay boost for this query.
    pub no_decay: bool,
}

/// Builds/updates the index, embeds the query, and searches.
pub fn semantic_search(
    query: &str,
    params: &SearchParams,
    storage: &NdjsonStorage,
    client: &OllamaClient,
) -> Result<Vec<SearchResult>> {
    let index = build_index(storage, client)?;

    let query_vectors = client.embed(&[query.to_string()])?;
    let Some(query_vector) = query_vectors.first() else {
        return Ok(Vec::new());
    };

    let config = storage.read_config()?;
    let (half_life_days, _) = effective_decay(&config);

    // Rerank wants a wider candidate pool to reorder.
    let fetch_k = if params.rerank {
        params.top_k * RERANK_POOL_FACTOR
    } else {
        params.top_k
    };

    let options = SearchOptions {
        top_k: fetch_k,
        half_life_days,
        no_decay: params.no_decay,
        artifact_type: params.artifact_type.clone(),
    };
    let results = index.search(query_vector, &options)?;

    if params.rerank {
        Ok(rerank(query, results, client, params.top_k))
    } else {
        Ok(results)
    }
}

/// Runs the query against every registered project's index, merging results
/// by score. Projects whose storage is unreachable are skipped.
pub fn global_search(
    query: &str,
    params: &SearchParams,
    client: &OllamaClient,
) -> Result<Vec<GlobalSearchResult>> {
    let projects = registry::list_projects();

    let mut merged: Vec<GlobalSearchResult> = Vec::new();
    for (path, _entry) in projects {
        let root = NdjsonStorage::default_root(std::path::Path::new(&path));
        let Ok(storage) = NdjsonStorage::open(root) else {
            tracing::warn!(project = %path, "skipping unreachable project");
            continue;
        };
        let results = semantic_search(query, params, &storage, client)?;
        merged.extend(
            results
                .into_iter()
                .map(|r| GlobalSearchResult::from_search_result(r, path.clone())),
        );
    }

    merged.sort_by(|a, b| {
        b.result
            .score
            .partial_cmp(&a.result.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(params.top_k);
    Ok(merged)
}
