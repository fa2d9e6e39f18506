//! Purpose: Search stored records by identifier, body text, or JSON structure.
//! Exports: `SearchQuery`, `SearchHit`, `SearchCache`, `search`, `search_cached`.
//! Role: Backs `GET /v0/search`, `POST /v0/search`, and the CLI `search` command.
//! Invariants: Results are capped by the limit and ordered deterministically.
//! Invariants: Cached hit lists expire by TTL and never exceed the entry cap.

use crate::core::error::Error;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_SEARCH_LIMIT: usize = 100;
pub const MAX_SEARCH_LIMIT: usize = 400;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CACHE_ENTRIES: usize = 128;

#[derive(Clone, Debug, PartialEq)]
pub enum SearchQuery {
    /// Case-insensitive identifier match with a full-body fallback.
    DocId(String),
    /// JSON structure containment over the relaton body.
    Struct(Value),
}

impl SearchQuery {
    pub fn cache_key(&self, snapshot: &str, limit: usize) -> String {
        let (format, query) = match self {
            SearchQuery::DocId(text) => ("docid", Value::String(text.clone())),
            SearchQuery::Struct(value) => ("struct", value.clone()),
        };
        json!({
            "snapshot": snapshot,
            "query_format": format,
            "query": query,
            "limit": limit,
        })
        .to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub docid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub bibitem: Value,
}

/// Clamps a requested limit into `1..=MAX_SEARCH_LIMIT`.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT)
}

/// Scans a snapshot and returns matching hits, capped at `limit`.
///
/// Identifier queries run in two phases: exact (case-insensitive) docid
/// matches order first, then substring docid matches; only when neither
/// phase matches anything does the query fall back to a case-insensitive
/// substring scan of the whole serialized body.
pub fn search(
    store: &Store,
    snapshot: &str,
    query: &SearchQuery,
    limit: usize,
) -> Result<Vec<SearchHit>, Error> {
    let mut exact = Vec::new();
    let mut partial = Vec::new();
    let mut body_matches = Vec::new();

    for result in store.scan(snapshot)? {
        let envelope = result?;
        match query {
            SearchQuery::DocId(text) => {
                let needle = text.to_ascii_lowercase();
                let ids = docids_of(&envelope.bibitem);
                if ids.iter().any(|id| id.to_ascii_lowercase() == needle)
                    || envelope.docid.to_ascii_lowercase() == needle
                {
                    exact.push(hit_from(&envelope.docid, envelope.bibitem));
                } else if ids
                    .iter()
                    .any(|id| id.to_ascii_lowercase().contains(&needle))
                    || envelope.docid.to_ascii_lowercase().contains(&needle)
                {
                    partial.push(hit_from(&envelope.docid, envelope.bibitem));
                } else if envelope
                    .bibitem
                    .to_string()
                    .to_ascii_lowercase()
                    .contains(&needle)
                {
                    body_matches.push(hit_from(&envelope.docid, envelope.bibitem));
                }
            }
            SearchQuery::Struct(needle) => {
                if contains_struct(&envelope.bibitem, needle) {
                    exact.push(hit_from(&envelope.docid, envelope.bibitem));
                }
            }
        }
    }

    let mut hits = exact;
    hits.append(&mut partial);
    if hits.is_empty() {
        hits = body_matches;
    }
    hits.truncate(limit);
    Ok(hits)
}

fn hit_from(docid: &str, bibitem: Value) -> SearchHit {
    SearchHit {
        docid: docid.to_string(),
        title: title_of(&bibitem),
        bibitem,
    }
}

fn docids_of(bibitem: &Value) -> Vec<String> {
    let entries = match bibitem.get("docid") {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };
    entries
        .iter()
        .filter_map(|entry| entry.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn title_of(bibitem: &Value) -> Option<String> {
    let titles = match bibitem.get("title") {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };
    let content = |entry: &Value| match entry {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    titles
        .iter()
        .find(|entry| entry.get("type").and_then(Value::as_str) == Some("main"))
        .and_then(content)
        .or_else(|| titles.first().and_then(content))
}

/// JSON containment: objects require every needle key contained, arrays
/// require every needle element contained in some haystack element (a scalar
/// needle is contained in an array that holds it), scalars compare equal.
pub fn contains_struct(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(hay), Value::Object(need)) => need
            .iter()
            .all(|(key, value)| hay.get(key).is_some_and(|inner| contains_struct(inner, value))),
        (Value::Array(hay), Value::Array(need)) => need
            .iter()
            .all(|value| hay.iter().any(|inner| contains_struct(inner, value))),
        (Value::Array(hay), scalar) => hay.iter().any(|inner| contains_struct(inner, scalar)),
        (left, right) => left == right,
    }
}

struct CacheEntry {
    hits: Vec<SearchHit>,
    created_at: Instant,
}

/// Bounded TTL cache of search hit lists, keyed by the canonical query.
pub struct SearchCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl SearchCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<SearchHit>> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.created_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.hits.clone())
    }

    pub fn put(&self, key: String, hits: Vec<SearchHit>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.created_at.elapsed() <= ttl);
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                hits,
                created_at: Instant::now(),
            },
        );
    }
}

impl Default for SearchCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_ENTRIES)
    }
}

/// Cache-through search. The second element reports whether the hit list was
/// served from cache.
pub fn search_cached(
    store: &Store,
    cache: &SearchCache,
    snapshot: &str,
    query: &SearchQuery,
    limit: usize,
) -> Result<(Vec<SearchHit>, bool), Error> {
    let key = query.cache_key(snapshot, limit);
    if let Some(hits) = cache.get(&key) {
        return Ok((hits, true));
    }
    let hits = search(store, snapshot, query, limit)?;
    cache.put(key, hits.clone());
    Ok((hits, false))
}

#[cfg(test)]
mod tests {
    use super::{
        SearchCache, SearchQuery, clamp_limit, contains_struct, search, search_cached,
    };
    use crate::core::record::RecordEnvelope;
    use crate::core::store::Store;
    use serde_json::json;
    use std::time::Duration;

    fn seed(store: &Store, docid: &str, title: &str) {
        let envelope = RecordEnvelope::new(
            docid,
            "test",
            json!({
                "docid": [{ "id": docid, "type": "IETF", "primary": true }],
                "title": [{ "content": title, "type": "main" }],
                "keyword": ["protocol"]
            }),
            None,
        )
        .expect("envelope");
        store.put(&envelope).expect("put");
    }

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");
        (dir, store)
    }

    #[test]
    fn exact_docid_ranks_before_substring() {
        let (_dir, store) = test_store();
        seed(&store, "RFC123", "Exact");
        seed(&store, "RFC1234", "Longer");

        let hits = search(&store, "test", &SearchQuery::DocId("rfc123".into()), 10)
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].docid, "RFC123");
        assert_eq!(hits[1].docid, "RFC1234");
    }

    #[test]
    fn body_fallback_when_no_docid_matches() {
        let (_dir, store) = test_store();
        seed(&store, "RFC9000", "QUIC Transport");

        let hits = search(&store, "test", &SearchQuery::DocId("quic".into()), 10)
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].docid, "RFC9000");
        assert_eq!(hits[0].title.as_deref(), Some("QUIC Transport"));
    }

    #[test]
    fn struct_query_matches_containment() {
        let (_dir, store) = test_store();
        seed(&store, "RFC1234", "A Protocol");
        seed(&store, "RFC5678", "Another");

        let query = SearchQuery::Struct(json!({
            "docid": [{ "id": "RFC1234" }]
        }));
        let hits = search(&store, "test", &query, 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].docid, "RFC1234");
    }

    #[test]
    fn containment_semantics() {
        let hay = json!({
            "docid": [{ "id": "RFC1234", "type": "IETF" }],
            "keyword": ["a", "b"],
            "edition": { "content": "2nd" }
        });
        assert!(contains_struct(&hay, &json!({})));
        assert!(contains_struct(&hay, &json!({ "keyword": ["b"] })));
        assert!(contains_struct(&hay, &json!({ "keyword": "a" })));
        assert!(contains_struct(&hay, &json!({ "edition": { "content": "2nd" } })));
        assert!(!contains_struct(&hay, &json!({ "keyword": ["c"] })));
        assert!(!contains_struct(&hay, &json!({ "docid": [{ "id": "RFC9" }] })));
        assert!(!contains_struct(&hay, &json!({ "missing": 1 })));
    }

    #[test]
    fn limit_caps_results() {
        let (_dir, store) = test_store();
        for index in 0..5 {
            seed(&store, &format!("RFC{index}"), "Same");
        }
        let hits = search(&store, "test", &SearchQuery::DocId("RFC".into()), 3)
            .expect("search");
        assert_eq!(hits.len(), 3);

        assert_eq!(clamp_limit(None), 100);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(100_000)), 400);
    }

    #[test]
    fn cached_queries_skip_the_scan() {
        let (_dir, store) = test_store();
        seed(&store, "RFC1234", "A Protocol");
        let cache = SearchCache::default();
        let query = SearchQuery::DocId("RFC1234".into());

        let (hits, cached) = search_cached(&store, &cache, "test", &query, 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert!(!cached);

        seed(&store, "RFC12345", "Added Later");
        let (hits, cached) = search_cached(&store, &cache, "test", &query, 10).expect("search");
        assert!(cached);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn cache_expires_and_evicts() {
        let cache = SearchCache::new(Duration::from_secs(0), 2);
        cache.put("a".into(), Vec::new());
        assert!(cache.get("a").is_none());

        let cache = SearchCache::new(Duration::from_secs(3600), 2);
        cache.put("a".into(), Vec::new());
        cache.put("b".into(), Vec::new());
        cache.put("c".into(), Vec::new());
        let present = ["a", "b", "c"]
            .iter()
            .filter(|key| cache.get(**key).is_some())
            .count();
        assert_eq!(present, 2);
        assert!(cache.get("c").is_some());
    }
}
