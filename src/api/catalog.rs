//! Purpose: Define the public client surface for local store access.
//! Exports: `Catalog`, `DEFAULT_DB_NAME`, and snapshot/record lifecycle operations.
//! Role: Stable boundary for the CLI and server state; mirrors CLI resolution rules.
//! Invariants: Database names resolve to `<data_dir>/<db_name>` and never traverse paths.
#![allow(clippy::result_large_err)]

use super::ValidationReport;
use super::validation::validate_snapshot_report;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::RecordEnvelope;
use crate::core::store::{PutOutcome, SnapshotManifest, SnapshotStatus, Store, StoreScan};
use crate::store_paths::{DbNameResolveError, default_data_dir, resolve_db_root};
use std::path::{Path, PathBuf};

pub type ApiResult<T> = Result<T, Error>;

pub const DEFAULT_DB_NAME: &str = "bibxml";

#[derive(Clone, Debug)]
pub struct Catalog {
    data_dir: PathBuf,
    db_name: String,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_name: DEFAULT_DB_NAME.to_string(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn store(&self) -> ApiResult<Store> {
        let root = resolve_db_root(&self.db_name, &self.data_dir)
            .map_err(map_db_name_resolve_error)?;
        Store::open(root)
    }

    pub fn get_record(&self, tag: &str, docid: &str) -> ApiResult<Option<RecordEnvelope>> {
        self.store()?.get(tag, docid)
    }

    pub fn put_record(&self, envelope: &RecordEnvelope) -> ApiResult<PutOutcome> {
        self.store()?.put(envelope)
    }

    pub fn create_snapshot(&self, tag: &str) -> ApiResult<SnapshotManifest> {
        self.store()?.create_snapshot(tag)
    }

    pub fn delete_snapshot(&self, tag: &str) -> ApiResult<()> {
        self.store()?.delete_snapshot(tag)
    }

    pub fn snapshot_status(&self, tag: &str) -> ApiResult<SnapshotStatus> {
        self.store()?.snapshot_status(tag)
    }

    pub fn list_snapshots(&self) -> ApiResult<Vec<SnapshotStatus>> {
        self.store()?.list_snapshots()
    }

    pub fn list_docids(&self, tag: &str) -> ApiResult<Vec<String>> {
        self.store()?.list_docids(tag)
    }

    pub fn scan(&self, tag: &str) -> ApiResult<StoreScan> {
        self.store()?.scan(tag)
    }

    pub fn validate_snapshot(&self, tag: &str) -> ApiResult<ValidationReport> {
        let store = self.store()?;
        if !store.snapshot_exists(tag) {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("snapshot does not exist")
                .with_snapshot(tag)
                .with_path(store.snapshot_dir(tag))
                .with_hint("Run `bibserve snapshot list` to see available tags."));
        }
        Ok(validate_snapshot_report(&store, tag).with_snapshot_tag(tag))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn map_db_name_resolve_error(err: DbNameResolveError) -> Error {
    match err {
        DbNameResolveError::Empty => {
            Error::new(ErrorKind::Usage).with_message("database name must not be empty")
        }
        DbNameResolveError::ContainsPathSeparator => Error::new(ErrorKind::Usage)
            .with_message("database name must not contain path separators"),
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalog, DEFAULT_DB_NAME};
    use crate::core::error::ErrorKind;
    use crate::core::record::RecordEnvelope;
    use serde_json::json;

    #[test]
    fn catalog_defaults_data_dir() {
        let catalog = Catalog::new();
        assert!(catalog.data_dir().to_string_lossy().contains(".bibserve"));
        assert_eq!(catalog.db_name(), DEFAULT_DB_NAME);
    }

    #[test]
    fn db_name_with_separator_is_usage_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::new()
            .with_data_dir(temp.path())
            .with_db_name("foo/bar");
        let err = catalog.store().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn empty_db_name_is_usage_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::new().with_data_dir(temp.path()).with_db_name("");
        let err = catalog.store().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn records_round_trip_through_catalog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::new().with_data_dir(temp.path());
        let envelope =
            RecordEnvelope::new("RFC1234", "head", json!({"title": "A"}), None).expect("envelope");
        catalog.put_record(&envelope).expect("put");

        let stored = catalog
            .get_record("head", "RFC1234")
            .expect("get")
            .expect("record");
        assert_eq!(stored, envelope);
        assert_eq!(catalog.list_docids("head").expect("list"), vec!["RFC1234"]);
    }

    #[test]
    fn validate_missing_snapshot_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::new().with_data_dir(temp.path());
        let err = catalog.validate_snapshot("nope").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
