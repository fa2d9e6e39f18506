// Reference store: per-snapshot directories of write-once record envelopes.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::core::docid::{docid_file_stem, docid_from_file_stem, ensure_docid, ensure_snapshot_tag};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{RecordEnvelope, now_rfc3339};
use serde::{Deserialize, Serialize};

const LOCK_FILE: &str = "store.lock";
const MANIFEST_FILE: &str = "manifest.json";
const REFS_DIR: &str = "refs";
const RECORD_EXT: &str = "json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot: String,
    pub created: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub snapshot: String,
    pub created: String,
    pub records: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    Stored,
    Unchanged,
}

/// File-backed store rooted at `<data_dir>/<db_name>`. Reads are lock-free;
/// snapshot mutation and record puts serialize on an advisory file lock.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create store directory")
                .with_path(&root)
                .with_source(err)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn snapshot_dir(&self, tag: &str) -> PathBuf {
        self.root.join(tag)
    }

    pub(crate) fn refs_dir(&self, tag: &str) -> PathBuf {
        self.snapshot_dir(tag).join(REFS_DIR)
    }

    fn record_path(&self, tag: &str, docid: &str) -> PathBuf {
        self.refs_dir(tag)
            .join(format!("{}.{RECORD_EXT}", docid_file_stem(docid)))
    }

    pub(crate) fn manifest_path(&self, tag: &str) -> PathBuf {
        self.snapshot_dir(tag).join(MANIFEST_FILE)
    }

    fn lock(&self) -> Result<StoreLock, Error> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_path(&path)
                    .with_source(err)
            })?;
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(StoreLock { file })
    }

    pub fn snapshot_exists(&self, tag: &str) -> bool {
        self.snapshot_dir(tag).is_dir()
    }

    /// Creates an empty snapshot. Fails with `AlreadyExists` when the tag is
    /// already present.
    pub fn create_snapshot(&self, tag: &str) -> Result<SnapshotManifest, Error> {
        ensure_snapshot_tag(tag)?;
        let _lock = self.lock()?;
        let dir = self.snapshot_dir(tag);
        if dir.exists() {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("snapshot already exists")
                .with_snapshot(tag)
                .with_path(&dir)
                .with_hint("Choose a different tag or delete the existing snapshot."));
        }
        self.init_snapshot_dir(tag)
    }

    /// Creates the snapshot if absent; used by record puts so a freshly
    /// configured tag needs no separate create step.
    fn ensure_snapshot(&self, tag: &str) -> Result<(), Error> {
        if self.snapshot_exists(tag) {
            return Ok(());
        }
        ensure_snapshot_tag(tag)?;
        let _lock = self.lock()?;
        if self.snapshot_exists(tag) {
            return Ok(());
        }
        self.init_snapshot_dir(tag).map(|_| ())
    }

    fn init_snapshot_dir(&self, tag: &str) -> Result<SnapshotManifest, Error> {
        let refs = self.refs_dir(tag);
        fs::create_dir_all(&refs).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_path(&refs)
                .with_source(err)
        })?;
        let manifest = SnapshotManifest {
            snapshot: tag.to_string(),
            created: now_rfc3339()?,
        };
        write_json_atomic(&self.manifest_path(tag), &manifest)?;
        Ok(manifest)
    }

    pub fn delete_snapshot(&self, tag: &str) -> Result<(), Error> {
        ensure_snapshot_tag(tag)?;
        let _lock = self.lock()?;
        let dir = self.snapshot_dir(tag);
        if !dir.exists() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("snapshot does not exist")
                .with_snapshot(tag)
                .with_path(&dir));
        }
        fs::remove_dir_all(&dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_path(&dir)
                .with_source(err)
        })
    }

    pub fn read_manifest(&self, tag: &str) -> Result<SnapshotManifest, Error> {
        let path = self.manifest_path(tag);
        let body = read_file(&path)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("snapshot manifest not found")
                .with_snapshot(tag)
                .with_path(&path)
        })?;
        serde_json::from_slice(&body).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("snapshot manifest is not valid JSON")
                .with_path(&path)
                .with_source(err)
        })
    }

    pub fn snapshot_status(&self, tag: &str) -> Result<SnapshotStatus, Error> {
        if !self.snapshot_exists(tag) {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("snapshot does not exist")
                .with_snapshot(tag));
        }
        let manifest = match self.read_manifest(tag) {
            Ok(manifest) => manifest,
            Err(err) if err.kind() == ErrorKind::NotFound => SnapshotManifest {
                snapshot: tag.to_string(),
                created: String::new(),
            },
            Err(err) => return Err(err),
        };
        Ok(SnapshotStatus {
            snapshot: manifest.snapshot,
            created: manifest.created,
            records: self.record_count(tag)?,
        })
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotStatus>, Error> {
        let mut statuses = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(statuses),
            Err(err) => {
                return Err(Error::new(map_io_error_kind(&err))
                    .with_path(&self.root)
                    .with_source(err));
            }
        };
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_path(&self.root)
                    .with_source(err)
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(tag) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if ensure_snapshot_tag(tag).is_err() {
                continue;
            }
            statuses.push(self.snapshot_status(tag)?);
        }
        statuses.sort_by(|a, b| a.snapshot.cmp(&b.snapshot));
        Ok(statuses)
    }

    pub fn record_count(&self, tag: &str) -> Result<u64, Error> {
        Ok(self.record_paths(tag)?.len() as u64)
    }

    /// Reads a record. `Ok(None)` when the snapshot or record is absent;
    /// `Corrupt` when the stored envelope fails to parse or its digest does
    /// not match.
    pub fn get(&self, tag: &str, docid: &str) -> Result<Option<RecordEnvelope>, Error> {
        ensure_docid(docid)?;
        let path = self.record_path(tag, docid);
        let Some(body) = read_file(&path)? else {
            return Ok(None);
        };
        let envelope = parse_envelope(&body, &path)?;
        envelope.verify_digest()?;
        if envelope.docid != docid || envelope.snapshot != tag {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("stored record does not match its location")
                .with_docid(docid)
                .with_snapshot(tag)
                .with_path(&path));
        }
        Ok(Some(envelope))
    }

    /// Write-once put. Re-putting a byte-identical body is an idempotent
    /// no-op; a conflicting body for an existing key fails `AlreadyExists`.
    pub fn put(&self, envelope: &RecordEnvelope) -> Result<PutOutcome, Error> {
        ensure_docid(&envelope.docid)?;
        ensure_snapshot_tag(&envelope.snapshot)?;
        self.ensure_snapshot(&envelope.snapshot)?;

        let _lock = self.lock()?;
        let path = self.record_path(&envelope.snapshot, &envelope.docid);
        if let Some(existing) = read_file(&path)? {
            let existing = parse_envelope(&existing, &path)?;
            if existing.digest == envelope.digest {
                return Ok(PutOutcome::Unchanged);
            }
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("record is immutable once stored for a snapshot")
                .with_docid(&envelope.docid)
                .with_snapshot(&envelope.snapshot)
                .with_path(&path)
                .with_hint("Ingest changed data under a new snapshot tag."));
        }
        write_json_atomic(&path, envelope)?;
        Ok(PutOutcome::Stored)
    }

    /// Sorted identifiers of all records in a snapshot.
    pub fn list_docids(&self, tag: &str) -> Result<Vec<String>, Error> {
        let mut docids: Vec<String> = self
            .record_paths(tag)?
            .iter()
            .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()))
            .map(docid_from_file_stem)
            .collect();
        docids.sort();
        Ok(docids)
    }

    /// Iterator over all record envelopes in a snapshot, ordered by docid.
    pub fn scan(&self, tag: &str) -> Result<StoreScan, Error> {
        let mut paths = self.record_paths(tag)?;
        paths.sort();
        Ok(StoreScan { paths, index: 0 })
    }

    pub(crate) fn record_paths(&self, tag: &str) -> Result<Vec<PathBuf>, Error> {
        let refs = self.refs_dir(tag);
        let entries = match fs::read_dir(&refs) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Error::new(map_io_error_kind(&err))
                    .with_path(&refs)
                    .with_source(err));
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| Error::new(ErrorKind::Io).with_path(&refs).with_source(err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXT) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

pub struct StoreScan {
    paths: Vec<PathBuf>,
    index: usize,
}

impl Iterator for StoreScan {
    type Item = Result<RecordEnvelope, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.get(self.index)?.clone();
        self.index += 1;
        let result = match read_file(&path) {
            Ok(Some(body)) => parse_envelope(&body, &path),
            Ok(None) => Err(Error::new(ErrorKind::NotFound)
                .with_message("record removed during scan")
                .with_path(&path)),
            Err(err) => Err(err),
        };
        Some(result)
    }
}

struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn parse_envelope(body: &[u8], path: &Path) -> Result<RecordEnvelope, Error> {
    serde_json::from_slice(body).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("stored record is not a valid envelope")
            .with_path(path)
            .with_source(err)
    })
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::new(map_io_error_kind(&err))
                .with_path(path)
                .with_source(err));
        }
    };
    let mut body = Vec::new();
    file.read_to_end(&mut body).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_path(path)
            .with_source(err)
    })?;
    Ok(Some(body))
}

/// Serializes to a sibling temp file, flushes, then renames into place so a
/// crash never leaves a half-written record visible.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let body = serde_json::to_vec_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("record serialization failed")
            .with_path(path)
            .with_source(err)
    })?;
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_path(&tmp)
                .with_source(err)
        })?;
    file.write_all(&body)
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_path(&tmp)
                .with_source(err)
        })?;
    drop(file);
    fs::rename(&tmp, path).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_path(path)
            .with_source(err)
    })
}

pub(crate) fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{PutOutcome, Store};
    use crate::core::error::ErrorKind;
    use crate::core::record::RecordEnvelope;
    use serde_json::json;

    fn envelope(docid: &str, snapshot: &str, title: &str) -> RecordEnvelope {
        RecordEnvelope::new(
            docid,
            snapshot,
            json!({
                "docid": [{ "id": docid, "type": "IETF", "primary": true }],
                "title": [{ "content": title, "type": "main" }]
            }),
            None,
        )
        .expect("envelope")
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");

        let record = envelope("RFC1234", "test", "A Protocol");
        assert_eq!(store.put(&record).expect("put"), PutOutcome::Stored);

        let loaded = store.get("test", "RFC1234").expect("get").expect("record");
        assert_eq!(loaded.docid, "RFC1234");
        assert_eq!(loaded.snapshot, "test");
        assert_eq!(loaded.digest, record.digest);
    }

    #[test]
    fn get_missing_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");
        assert!(store.get("test", "RFC9999999").expect("get").is_none());
    }

    #[test]
    fn put_is_write_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");

        let record = envelope("RFC1234", "test", "A Protocol");
        assert_eq!(store.put(&record).expect("put"), PutOutcome::Stored);
        assert_eq!(store.put(&record).expect("re-put"), PutOutcome::Unchanged);

        let conflicting = envelope("RFC1234", "test", "A Different Title");
        let err = store.put(&conflicting).expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let loaded = store.get("test", "RFC1234").expect("get").expect("record");
        assert_eq!(loaded.digest, record.digest);
    }

    #[test]
    fn snapshots_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");

        store.put(&envelope("RFC1234", "test", "A")).expect("put");
        assert!(store.get("head", "RFC1234").expect("get").is_none());

        store.put(&envelope("RFC1234", "head", "A")).expect("put");
        assert_eq!(store.record_count("test").expect("count"), 1);
        assert_eq!(store.record_count("head").expect("count"), 1);
    }

    #[test]
    fn tampered_record_reads_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");
        store.put(&envelope("RFC1234", "test", "A")).expect("put");

        let path = store.record_path("test", "RFC1234");
        let body = std::fs::read_to_string(&path).expect("read");
        std::fs::write(&path, body.replace("\"A\"", "\"B\"")).expect("write");

        let err = store.get("test", "RFC1234").expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn snapshot_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");

        store.create_snapshot("test").expect("create");
        let err = store.create_snapshot("test").expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        store.put(&envelope("RFC1234", "test", "A")).expect("put");
        let statuses = store.list_snapshots().expect("list");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].snapshot, "test");
        assert_eq!(statuses[0].records, 1);
        assert!(!statuses[0].created.is_empty());

        store.delete_snapshot("test").expect("delete");
        assert!(!store.snapshot_exists("test"));
        let err = store.delete_snapshot("test").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn slash_docids_stay_single_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");

        let record = envelope("ANSI/IEEE.802-1985", "test", "LAN Standard");
        store.put(&record).expect("put");

        let docids = store.list_docids("test").expect("list");
        assert_eq!(docids, vec!["ANSI/IEEE.802-1985".to_string()]);

        let loaded = store
            .get("test", "ANSI/IEEE.802-1985")
            .expect("get")
            .expect("record");
        assert_eq!(loaded.docid, "ANSI/IEEE.802-1985");
    }

    #[test]
    fn scan_yields_sorted_envelopes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("bibxml")).expect("open");
        store.put(&envelope("RFC2", "test", "B")).expect("put");
        store.put(&envelope("RFC1", "test", "A")).expect("put");

        let docids: Vec<String> = store
            .scan("test")
            .expect("scan")
            .map(|result| result.expect("envelope").docid)
            .collect();
        assert_eq!(docids, vec!["RFC1".to_string(), "RFC2".to_string()]);
    }
}
