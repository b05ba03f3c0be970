//! Hybrid retrieval and result fusion
//!
//! One search runs per configured [`SearchKind`]; the hit groups are fused
//! into a single deduplicated ranking, then enriched with recency and
//! per-source trust weights.

use crate::error::{FlowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Named search strategy offered by a vector store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Dense,
    Sparse,
}

/// Raw scored hit returned by a vector store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source: String,
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Fused retrieval result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub source: String,
    pub text: String,
    pub score: f32,
    /// Trust weight of the source; 1.0 until enrichment
    pub weight: f32,
    pub kind: SearchKind,
    pub timestamp: Option<DateTime<Utc>>,
}

impl KnowledgeItem {
    /// Effective rank
    pub fn weighted_score(&self) -> f32 {
        self.score * self.weight
    }
}

/// Result of a bounded hybrid search
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    Items(Vec<KnowledgeItem>),
    Timeout,
    Failed(String),
}

/// Vector-store collaborator
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Return up to `top_k` scored hits for `query` using `kind`
    async fn search(&self, kind: SearchKind, query: &str, top_k: usize) -> Result<Vec<SearchHit>>;
}

/// Tunables for fusion and enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum raw score kept by fusion
    #[serde(default)]
    pub score_threshold: Option<f32>,

    /// Items older than this are dropped; `None` disables the window
    #[serde(default = "default_recency_window_days")]
    pub recency_window_days: Option<i64>,

    /// source → trust weight; unlisted sources weigh 1.0
    #[serde(default)]
    pub source_weights: HashMap<String, f32>,

    #[serde(default = "default_search_kinds")]
    pub search_kinds: Vec<SearchKind>,
}

fn default_top_k() -> usize {
    5
}

fn default_recency_window_days() -> Option<i64> {
    Some(730)
}

fn default_search_kinds() -> Vec<SearchKind> {
    vec![SearchKind::Dense, SearchKind::Sparse]
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: None,
            recency_window_days: default_recency_window_days(),
            source_weights: HashMap::new(),
            search_kinds: default_search_kinds(),
        }
    }
}

/// Descending by `key`, then source and text ascending
fn rank_by(a: &KnowledgeItem, b: &KnowledgeItem, key: fn(&KnowledgeItem) -> f32) -> Ordering {
    key(b)
        .total_cmp(&key(a))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.text.cmp(&b.text))
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Merge hit groups into one ranked list
///
/// Groups are flattened in order; the first occurrence of each
/// (source, text) pair wins.
pub fn fuse(
    groups: Vec<(SearchKind, Vec<SearchHit>)>,
    top_k: usize,
    score_threshold: Option<f32>,
) -> Vec<KnowledgeItem> {
    let mut seen: HashSet<(String, u64)> = HashSet::new();
    let mut items: Vec<KnowledgeItem> = Vec::new();

    for (kind, hits) in groups {
        for hit in hits {
            if !seen.insert((hit.source.clone(), text_hash(&hit.text))) {
                continue;
            }
            items.push(KnowledgeItem {
                source: hit.source,
                text: hit.text,
                score: hit.score,
                weight: 1.0,
                kind,
                timestamp: hit.timestamp,
            });
        }
    }

    items.sort_by(|a, b| rank_by(a, b, |i| i.score));
    if let Some(threshold) = score_threshold {
        items.retain(|i| i.score >= threshold);
    }
    items.truncate(top_k);
    items
}

/// Apply the recency window and source weights, then re-rank by
/// `score * weight`
pub fn enrich(
    mut items: Vec<KnowledgeItem>,
    now: DateTime<Utc>,
    config: &RetrievalConfig,
) -> Vec<KnowledgeItem> {
    if let Some(days) = config.recency_window_days {
        let cutoff = now - ChronoDuration::days(days);
        items.retain(|i| i.timestamp.map_or(true, |ts| ts >= cutoff));
    }

    for item in &mut items {
        item.weight = config
            .source_weights
            .get(&item.source)
            .copied()
            .unwrap_or(1.0);
    }

    items.sort_by(|a, b| rank_by(a, b, KnowledgeItem::weighted_score));
    items.truncate(config.top_k);
    items
}

/// Runs hybrid searches against a vector store under a deadline
pub struct RetrievalService {
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
    timeout: Duration,
}

impl RetrievalService {
    pub fn new(store: Arc<dyn VectorStore>, config: RetrievalConfig, timeout: Duration) -> Self {
        Self {
            store,
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Search every configured kind concurrently and fuse the results
    ///
    /// The first failing search drops the others. Enrichment is left to
    /// the caller so it can pick the reference time.
    pub async fn hybrid_search(&self, query: &str, top_k: usize) -> RetrievalOutcome {
        let searches = self.config.search_kinds.iter().map(|&kind| {
            let store = Arc::clone(&self.store);
            async move {
                let hits = store.search(kind, query, top_k).await?;
                Ok::<_, FlowError>((kind, hits))
            }
        });

        match tokio::time::timeout(self.timeout, futures::future::try_join_all(searches)).await {
            Ok(Ok(groups)) => {
                let items = fuse(groups, top_k, self.config.score_threshold);
                tracing::debug!(query = %query, items = items.len(), "Hybrid search complete");
                RetrievalOutcome::Items(items)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Hybrid search failed");
                RetrievalOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "Hybrid search timed out");
                RetrievalOutcome::Timeout
            }
        }
    }
}

/// Document held by [`MemoryVectorStore`]
#[derive(Debug, Clone)]
struct Document {
    source: String,
    text: String,
    tokens: HashSet<String>,
    timestamp: Option<DateTime<Utc>>,
}

/// Token-overlap store for tests and single-process use
///
/// Dense search scores by Jaccard similarity of token sets; sparse search
/// scores by the fraction of query tokens found in the document.
#[derive(Default)]
pub struct MemoryVectorStore {
    documents: RwLock<Vec<Document>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        source: impl Into<String>,
        text: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let text = text.into();
        let mut docs = self
            .documents
            .write()
            .map_err(|e| FlowError::Lock(format!("vector store: {}", e)))?;
        docs.push(Document {
            source: source.into(),
            tokens: tokenize(&text),
            text,
            timestamp,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn search(&self, kind: SearchKind, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self
            .documents
            .read()
            .map_err(|e| FlowError::Lock(format!("vector store: {}", e)))?;

        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter_map(|doc| {
                let shared = doc.tokens.intersection(&query_tokens).count();
                if shared == 0 {
                    return None;
                }
                let score = match kind {
                    SearchKind::Dense => {
                        shared as f32 / doc.tokens.union(&query_tokens).count() as f32
                    }
                    SearchKind::Sparse => shared as f32 / query_tokens.len() as f32,
                };
                Some(SearchHit {
                    source: doc.source.clone(),
                    text: doc.text.clone(),
                    score,
                    timestamp: doc.timestamp,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.source.cmp(&b.source)));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(source: &str, text: &str, score: f32) -> SearchHit {
        SearchHit {
            source: source.into(),
            text: text.into(),
            score,
            timestamp: None,
        }
    }

    #[test]
    fn test_fuse_dedupes_keeping_first_occurrence() {
        let groups = vec![
            (SearchKind::Dense, vec![hit("a", "x", 0.9), hit("b", "y", 0.5)]),
            (SearchKind::Sparse, vec![hit("a", "x", 0.95), hit("c", "z", 0.7)]),
        ];
        let items = fuse(groups, 10, None);

        assert_eq!(items.len(), 3);
        let a = items.iter().find(|i| i.source == "a").unwrap();
        assert_eq!(a.kind, SearchKind::Dense);
        assert_eq!(a.score, 0.9);
        assert_eq!(
            items.iter().map(|i| i.source.as_str()).collect::<Vec<_>>(),
            vec!["a", "c", "b"]
        );
    }

    #[test]
    fn test_fuse_same_source_different_text_kept() {
        let groups = vec![(SearchKind::Dense, vec![hit("a", "x", 0.5), hit("a", "y", 0.5)])];
        let items = fuse(groups, 10, None);
        assert_eq!(items.len(), 2);
        // Tie on score and source breaks by text
        assert_eq!(items[0].text, "x");
        assert_eq!(items[1].text, "y");
    }

    #[test]
    fn test_fuse_threshold_and_top_k() {
        let groups = vec![(
            SearchKind::Sparse,
            vec![hit("a", "1", 0.9), hit("b", "2", 0.8), hit("c", "3", 0.75), hit("d", "4", 0.2)],
        )];
        let items = fuse(groups.clone(), 2, Some(0.7));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source, "a");

        let items = fuse(groups, 10, Some(0.7));
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.score >= 0.7));
    }

    #[test]
    fn test_fuse_empty() {
        assert!(fuse(Vec::new(), 5, None).is_empty());
        assert!(fuse(vec![(SearchKind::Dense, vec![hit("a", "x", 1.0)])], 0, None).is_empty());
    }

    #[test]
    fn test_enrich_weights_and_reranks() {
        let items = fuse(
            vec![(SearchKind::Dense, vec![hit("wiki", "a", 0.9), hit("manual", "b", 0.6)])],
            10,
            None,
        );
        let mut config = RetrievalConfig::default();
        config.source_weights.insert("wiki".into(), 0.5);
        config.source_weights.insert("manual".into(), 1.0);

        let enriched = enrich(items, Utc::now(), &config);
        assert_eq!(enriched[0].source, "manual");
        assert_eq!(enriched[0].weight, 1.0);
        assert_eq!(enriched[1].source, "wiki");
        assert_eq!(enriched[1].weight, 0.5);
        assert!((enriched[1].weighted_score() - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_enrich_drops_stale_items_keeps_undated() {
        let now = Utc::now();
        let mut old = hit("old", "a", 0.9);
        old.timestamp = Some(now - ChronoDuration::days(800));
        let mut fresh = hit("fresh", "b", 0.5);
        fresh.timestamp = Some(now - ChronoDuration::days(10));
        let undated = hit("undated", "c", 0.4);

        let items = fuse(vec![(SearchKind::Dense, vec![old, fresh, undated])], 10, None);
        let enriched = enrich(items, now, &RetrievalConfig::default());

        let sources: Vec<_> = enriched.iter().map(|i| i.source.as_str()).collect();
        assert_eq!(sources, vec!["fresh", "undated"]);
    }

    #[test]
    fn test_enrich_truncates_to_top_k() {
        let hits = (0..10).map(|i| hit(&format!("s{}", i), "t", i as f32 / 10.0)).collect();
        let items = fuse(vec![(SearchKind::Sparse, hits)], 10, None);
        let config = RetrievalConfig {
            top_k: 3,
            ..RetrievalConfig::default()
        };
        let enriched = enrich(items, Utc::now(), &config);
        assert_eq!(enriched.len(), 3);
        assert_eq!(enriched[0].source, "s9");
    }

    #[tokio::test]
    async fn test_memory_store_scores_by_overlap() {
        let store = MemoryVectorStore::new();
        store.insert("rust", "Rust is a systems programming language", None).unwrap();
        store.insert("python", "Python is a scripting language", None).unwrap();
        store.insert("cooking", "Boil the pasta", None).unwrap();

        let hits = store
            .search(SearchKind::Sparse, "systems programming", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "rust");
        assert_eq!(hits[0].score, 1.0);

        let hits = store.search(SearchKind::Dense, "language", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score < 1.0);
    }

    #[tokio::test]
    async fn test_hybrid_search_fuses_both_kinds() {
        let store = Arc::new(MemoryVectorStore::new());
        store.insert("rust", "Rust ownership and borrowing", None).unwrap();
        store.insert("go", "Go channels", None).unwrap();

        let service = RetrievalService::new(store, RetrievalConfig::default(), Duration::from_secs(1));
        match service.hybrid_search("rust ownership", 5).await {
            RetrievalOutcome::Items(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].source, "rust");
                assert_eq!(items[0].kind, SearchKind::Dense);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    struct SlowStore;

    #[async_trait]
    impl VectorStore for SlowStore {
        async fn search(&self, _: SearchKind, _: &str, _: usize) -> Result<Vec<SearchHit>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct BrokenSparse;

    #[async_trait]
    impl VectorStore for BrokenSparse {
        async fn search(&self, kind: SearchKind, _: &str, _: usize) -> Result<Vec<SearchHit>> {
            match kind {
                SearchKind::Dense => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Vec::new())
                }
                SearchKind::Sparse => Err(FlowError::Retrieval("index offline".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_hybrid_search_timeout() {
        let service = RetrievalService::new(
            Arc::new(SlowStore),
            RetrievalConfig::default(),
            Duration::from_millis(20),
        );
        assert_eq!(service.hybrid_search("q", 5).await, RetrievalOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_hybrid_search_first_failure_wins() {
        let service = RetrievalService::new(
            Arc::new(BrokenSparse),
            RetrievalConfig::default(),
            Duration::from_secs(2),
        );
        let started = std::time::Instant::now();
        match service.hybrid_search("q", 5).await {
            RetrievalOutcome::Failed(reason) => assert!(reason.contains("index offline")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        // The slow dense search was dropped, not awaited
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
