//! Purpose: Read-through resolution of document identifiers against the store.
//! Exports: `Resolver`, `RecordSource`, `DEFAULT_FETCH_RETRIES`.
//! Role: Single owner of miss handling; request handlers never talk to the
//! upstream directly.
//! Invariants: At most one upstream fetch per identifier across concurrent
//! callers of one resolver.
//! Invariants: Fetched payloads are digest-checked, normalized, and re-enveloped
//! under the active snapshot tag before they reach the store.
#![allow(clippy::result_large_err)]

use crate::api::upstream::UpstreamClient;
use crate::core::docid::ensure_docid;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{RecordEnvelope, bibitem_from_value};
use crate::core::store::Store;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_FETCH_RETRIES: u32 = 2;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Where missing records come from. The production source is an
/// `UpstreamClient`; tests substitute counting stubs.
pub trait RecordSource: Send + Sync {
    fn fetch_record(&self, docid: &str) -> Result<RecordEnvelope, Error>;

    fn describe(&self) -> String;
}

impl RecordSource for UpstreamClient {
    fn fetch_record(&self, docid: &str) -> Result<RecordEnvelope, Error> {
        UpstreamClient::fetch_record(self, docid)
    }

    fn describe(&self) -> String {
        self.base_url().to_string()
    }
}

type FlightTable = HashMap<String, Arc<Mutex<()>>>;

pub struct Resolver {
    store: Store,
    snapshot: String,
    source: Option<Arc<dyn RecordSource>>,
    inflight: Mutex<FlightTable>,
    retries: u32,
}

impl Resolver {
    pub fn new(store: Store, snapshot: impl Into<String>) -> Self {
        Self {
            store,
            snapshot: snapshot.into(),
            source: None,
            inflight: Mutex::new(HashMap::new()),
            retries: DEFAULT_FETCH_RETRIES,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn source_description(&self) -> Option<String> {
        self.source.as_ref().map(|source| source.describe())
    }

    /// Resolve one identifier under the active snapshot. Stored records win;
    /// a miss goes upstream at most once no matter how many callers ask.
    pub fn resolve(&self, docid: &str) -> Result<RecordEnvelope, Error> {
        ensure_docid(docid)?;
        if let Some(envelope) = self.store.get(&self.snapshot, docid)? {
            return Ok(envelope);
        }
        let Some(source) = self.source.clone() else {
            return Err(not_found(docid, &self.snapshot)
                .with_hint("Ingest data for this snapshot or configure an upstream."));
        };

        let flight = self.flight(docid)?;
        let guard = flight.lock().map_err(|_| flight_poisoned())?;
        let result = self.resolve_missing(source.as_ref(), docid);
        drop(guard);
        self.release_flight(docid, &flight)?;
        result
    }

    /// Runs with the per-docid flight lock held. Losers of the lock race find
    /// the winner's record on the re-check and return without fetching.
    fn resolve_missing(
        &self,
        source: &dyn RecordSource,
        docid: &str,
    ) -> Result<RecordEnvelope, Error> {
        if let Some(envelope) = self.store.get(&self.snapshot, docid)? {
            return Ok(envelope);
        }

        let fetched = match self.fetch_with_retry(source, docid) {
            Ok(fetched) => fetched,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(err.with_docid(docid).with_snapshot(&self.snapshot));
            }
            Err(err) => return Err(err),
        };
        fetched.verify_digest().map_err(|err| {
            Error::new(ErrorKind::Upstream)
                .with_message("upstream record failed digest verification")
                .with_docid(docid)
                .with_source(err)
        })?;

        let (_, bibitem, issues) = bibitem_from_value(fetched.bibitem, false)?;
        if !issues.is_empty() {
            tracing::warn!(
                docid,
                issues = issues.len(),
                "fetched record parsed with issues"
            );
        }
        let envelope = RecordEnvelope::new(docid, &self.snapshot, bibitem, fetched.xml)?;
        self.store.put(&envelope)?;
        tracing::info!(
            docid,
            snapshot = %self.snapshot,
            source = %source.describe(),
            "stored upstream record"
        );
        Ok(envelope)
    }

    fn fetch_with_retry(
        &self,
        source: &dyn RecordSource,
        docid: &str,
    ) -> Result<RecordEnvelope, Error> {
        let mut attempt: u32 = 0;
        loop {
            match source.fetch_record(docid) {
                Ok(envelope) => return Ok(envelope),
                Err(err) if err.kind() == ErrorKind::Upstream && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(docid, attempt, error = %err, "upstream fetch failed; retrying");
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn flight(&self, docid: &str) -> Result<Arc<Mutex<()>>, Error> {
        let mut inflight = self.lock_inflight()?;
        Ok(Arc::clone(
            inflight
                .entry(docid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Drops the table entry once no other caller holds a clone, so the table
    /// does not grow with every unique miss.
    fn release_flight(&self, docid: &str, flight: &Arc<Mutex<()>>) -> Result<(), Error> {
        let mut inflight = self.lock_inflight()?;
        if Arc::strong_count(flight) <= 2 {
            inflight.remove(docid);
        }
        Ok(())
    }

    fn lock_inflight(&self) -> Result<MutexGuard<'_, FlightTable>, Error> {
        self.inflight.lock().map_err(|_| flight_poisoned())
    }
}

fn not_found(docid: &str, snapshot: &str) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("no stored record for this identifier")
        .with_docid(docid)
        .with_snapshot(snapshot)
}

fn flight_poisoned() -> Error {
    Error::new(ErrorKind::Internal).with_message("resolver flight table poisoned")
}

#[cfg(test)]
mod tests {
    use super::{RecordSource, Resolver};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::record::RecordEnvelope;
    use crate::core::store::Store;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubSource {
        calls: AtomicU32,
        fail_first: u32,
        missing: bool,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                missing: false,
            }
        }

        fn flaky(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Self::new()
            }
        }

        fn missing() -> Self {
            Self {
                missing: true,
                ..Self::new()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RecordSource for StubSource {
        fn fetch_record(&self, docid: &str) -> Result<RecordEnvelope, Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::new(ErrorKind::Upstream).with_message("connection refused"));
            }
            if self.missing {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message("no stored record for this identifier"));
            }
            RecordEnvelope::new(
                docid,
                "upstream-head",
                json!({
                    "docid": [{"id": docid, "type": "IETF", "primary": true}],
                    "title": "An Example Protocol",
                    "keyword": [{"content": "transport"}],
                }),
                None,
            )
        }

        fn describe(&self) -> String {
            "stub".to_string()
        }
    }

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("store");
        (dir, store)
    }

    #[test]
    fn resolve_prefers_stored_records() {
        let (_dir, store) = store();
        let envelope =
            RecordEnvelope::new("RFC1234", "head", json!({"title": "Stored"}), None).expect("env");
        store.put(&envelope).expect("put");

        let source = Arc::new(StubSource::new());
        let resolver = Resolver::new(store, "head").with_source(source.clone());
        let resolved = resolver.resolve("RFC1234").expect("resolve");
        assert_eq!(resolved.bibitem["title"], json!("Stored"));
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn resolve_fetches_once_then_serves_from_store() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::new());
        let resolver = Resolver::new(store, "head").with_source(source.clone());

        let first = resolver.resolve("RFC1234").expect("first");
        let second = resolver.resolve("RFC1234").expect("second");
        assert_eq!(source.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first.snapshot, "head");
        assert_eq!(first.docid, "RFC1234");
    }

    #[test]
    fn resolve_normalizes_before_storing() {
        let (_dir, store) = store();
        let resolver = Resolver::new(store, "head").with_source(Arc::new(StubSource::new()));
        let envelope = resolver.resolve("RFC1234").expect("resolve");
        assert_eq!(envelope.bibitem["keyword"], json!(["transport"]));
        assert_eq!(
            envelope.bibitem["title"],
            json!([{"content": "An Example Protocol"}])
        );
    }

    #[test]
    fn concurrent_misses_fetch_once() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::new());
        let resolver = Arc::new(Resolver::new(store, "head").with_source(source.clone()));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let resolver = Arc::clone(&resolver);
                scope.spawn(move || {
                    resolver.resolve("RFC1234").expect("resolve");
                });
            }
        });
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn snapshot_switch_resolves_fresh() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::new());
        let head = Resolver::new(store.clone(), "head").with_source(source.clone());
        let pinned = Resolver::new(store, "2024-06-01").with_source(source.clone());

        head.resolve("RFC1234").expect("head");
        pinned.resolve("RFC1234").expect("pinned");
        head.resolve("RFC1234").expect("head again");
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn miss_without_source_is_not_found() {
        let (_dir, store) = store();
        let resolver = Resolver::new(store, "head");
        let err = resolver.resolve("RFC9999999").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.docid(), Some("RFC9999999"));
        assert_eq!(err.snapshot(), Some("head"));
    }

    #[test]
    fn upstream_not_found_is_not_cached() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::missing());
        let resolver = Resolver::new(store, "head").with_source(source.clone());

        let err = resolver.resolve("RFC9999999").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.snapshot(), Some("head"));
        let again = resolver.resolve("RFC9999999").expect_err("again");
        assert_eq!(again.kind(), ErrorKind::NotFound);
        assert_eq!(source.calls(), 2);
        assert!(
            resolver
                .store()
                .get("head", "RFC9999999")
                .expect("get")
                .is_none()
        );
    }

    #[test]
    fn transient_upstream_failures_are_retried() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::flaky(2));
        let resolver = Resolver::new(store, "head").with_source(source.clone());
        resolver.resolve("RFC1234").expect("resolve");
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn exhausted_retries_surface_upstream_error() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::flaky(10));
        let resolver = Resolver::new(store, "head")
            .with_source(source.clone())
            .with_retries(1);
        let err = resolver.resolve("RFC1234").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn invalid_identifier_never_reaches_the_source() {
        let (_dir, store) = store();
        let source = Arc::new(StubSource::new());
        let resolver = Resolver::new(store, "head").with_source(source.clone());
        let err = resolver.resolve("../etc/passwd").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn tampered_upstream_digest_is_rejected() {
        struct Tampered;
        impl RecordSource for Tampered {
            fn fetch_record(&self, docid: &str) -> Result<RecordEnvelope, Error> {
                let mut envelope =
                    RecordEnvelope::new(docid, "head", json!({"title": "A"}), None)?;
                envelope.digest = "sha256:0000".to_string();
                Ok(envelope)
            }

            fn describe(&self) -> String {
                "tampered".to_string()
            }
        }

        let (_dir, store) = store();
        let resolver = Resolver::new(store, "head")
            .with_source(Arc::new(Tampered))
            .with_retries(0);
        let err = resolver.resolve("RFC1234").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Upstream);
    }
}
