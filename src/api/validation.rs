//! Purpose: Provide a stable, serializable validation report model.
//! Exports: `ValidationReport`, `ValidationStatus`, `ValidationIssue`.
//! Role: Shared contract for CLI diagnostics and API users.
//! Invariants: Reports are additive-only in v0; no heavy payloads are embedded.
//! Invariants: Validation reads the store independently and never mutates it.

use crate::core::docid::{docid_from_file_stem, ensure_docid};
use crate::core::record::{RecordEnvelope, bibitem_from_value, primary_docid};
use crate::core::store::{SnapshotManifest, Store};
use crate::core::xml2rfc::check_well_formed;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationStatus {
    Ok,
    Corrupt,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub docid: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationReport {
    pub snapshot: Option<String>,
    pub path: PathBuf,
    pub status: ValidationStatus,
    pub records_checked: u64,
    pub issues: Vec<ValidationIssue>,
    pub issue_count: usize,
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    pub fn ok(path: PathBuf) -> Self {
        Self {
            snapshot: None,
            path,
            status: ValidationStatus::Ok,
            records_checked: 0,
            issues: Vec::new(),
            issue_count: 0,
            remediation_hints: Vec::new(),
        }
    }

    pub fn corrupt(path: PathBuf, issue: ValidationIssue) -> Self {
        let remediation_hints = vec![
            "Snapshot appears corrupt. Re-ingest it under a fresh tag and switch over.".to_string(),
        ];
        Self {
            snapshot: None,
            path,
            status: ValidationStatus::Corrupt,
            records_checked: 0,
            issues: vec![issue],
            issue_count: 1,
            remediation_hints,
        }
    }

    pub fn with_snapshot_tag(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn set_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issue_count = issues.len();
        self.issues = issues;
        self.status = if self.issue_count == 0 {
            ValidationStatus::Ok
        } else {
            ValidationStatus::Corrupt
        };
        if self.status == ValidationStatus::Corrupt && self.remediation_hints.is_empty() {
            self.remediation_hints = vec![
                "Snapshot appears corrupt. Re-ingest it under a fresh tag and switch over."
                    .to_string(),
            ];
        }
        self
    }

    fn set_records_checked(mut self, records_checked: u64) -> Self {
        self.records_checked = records_checked;
        self
    }
}

/// Walks every record file of a snapshot with independent parsing, so one
/// damaged file becomes an issue instead of aborting the walk.
pub(crate) fn validate_snapshot_report(store: &Store, tag: &str) -> ValidationReport {
    let snapshot_dir = store.snapshot_dir(tag);
    let mut issues = Vec::new();
    let mut hints = Vec::new();

    check_manifest(store, tag, &mut issues);

    let mut paths = match store.record_paths(tag) {
        Ok(paths) => paths,
        Err(err) => {
            issues.push(issue(
                "io",
                &format!("failed to list records: {err}"),
                None,
                Some(store.refs_dir(tag)),
            ));
            return ValidationReport::ok(snapshot_dir).set_issues(issues);
        }
    };
    paths.sort();

    let mut checked = 0u64;
    let mut salvaged = 0u64;
    let mut unidentified = 0u64;
    for path in &paths {
        checked += 1;
        check_record_file(tag, path, &mut issues, &mut salvaged, &mut unidentified);
    }

    if salvaged > 0 {
        hints.push(format!(
            "warning: {salvaged} records only parse with per-field salvage"
        ));
    }
    if unidentified > 0 {
        hints.push(format!(
            "warning: {unidentified} records have no single primary docid"
        ));
    }

    let mut report = ValidationReport::ok(snapshot_dir)
        .set_issues(issues)
        .set_records_checked(checked);
    report.remediation_hints.extend(hints);
    report
}

fn check_manifest(store: &Store, tag: &str, issues: &mut Vec<ValidationIssue>) {
    let manifest_path = store.manifest_path(tag);
    let body = match std::fs::read(&manifest_path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            issues.push(issue(
                "manifest",
                "snapshot manifest is missing",
                None,
                Some(manifest_path),
            ));
            return;
        }
        Err(err) => {
            issues.push(issue(
                "manifest",
                &format!("failed to read manifest: {err}"),
                None,
                Some(manifest_path),
            ));
            return;
        }
    };
    match serde_json::from_slice::<SnapshotManifest>(&body) {
        Ok(manifest) if manifest.snapshot != tag => {
            issues.push(issue(
                "manifest",
                &format!("manifest names snapshot {:?}", manifest.snapshot),
                None,
                Some(manifest_path),
            ));
        }
        Ok(_) => {}
        Err(err) => {
            issues.push(issue(
                "manifest",
                &format!("manifest decode failed: {err}"),
                None,
                Some(manifest_path),
            ));
        }
    }
}

fn check_record_file(
    tag: &str,
    path: &Path,
    issues: &mut Vec<ValidationIssue>,
    salvaged: &mut u64,
    unidentified: &mut u64,
) {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let docid = docid_from_file_stem(stem);

    if let Err(err) = ensure_docid(&docid) {
        issues.push(issue(
            "docid",
            &format!("file stem is not a valid identifier: {err}"),
            Some(&docid),
            Some(path.to_path_buf()),
        ));
        return;
    }

    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(err) => {
            issues.push(issue(
                "io",
                &format!("failed to read record: {err}"),
                Some(&docid),
                Some(path.to_path_buf()),
            ));
            return;
        }
    };
    let envelope: RecordEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            issues.push(issue(
                "parse",
                &format!("envelope decode failed: {err}"),
                Some(&docid),
                Some(path.to_path_buf()),
            ));
            return;
        }
    };

    if envelope.docid != docid {
        issues.push(issue(
            "location",
            &format!("envelope docid {:?} does not match its file", envelope.docid),
            Some(&docid),
            Some(path.to_path_buf()),
        ));
    }
    if envelope.snapshot != tag {
        issues.push(issue(
            "location",
            &format!(
                "envelope snapshot {:?} does not match the snapshot directory",
                envelope.snapshot
            ),
            Some(&docid),
            Some(path.to_path_buf()),
        ));
    }
    if let Err(err) = envelope.verify_digest() {
        issues.push(issue(
            "digest",
            &format!("{err}"),
            Some(&docid),
            Some(path.to_path_buf()),
        ));
    }
    if let Some(xml) = envelope.xml.as_deref() {
        if let Err(err) = check_well_formed(xml) {
            issues.push(issue(
                "xml",
                &format!("stored xml is not well-formed: {err}"),
                Some(&docid),
                Some(path.to_path_buf()),
            ));
        }
    }

    match bibitem_from_value(envelope.bibitem.clone(), false) {
        Ok((item, _, item_issues)) => {
            if !item_issues.is_empty() {
                *salvaged += 1;
            }
            if primary_docid(&item.docid).is_none() {
                *unidentified += 1;
            }
        }
        Err(err) => {
            issues.push(issue(
                "bibitem",
                &format!("bibliographic item rejected: {err}"),
                Some(&docid),
                Some(path.to_path_buf()),
            ));
        }
    }
}

fn issue(code: &str, message: &str, docid: Option<&str>, path: Option<PathBuf>) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        message: message.to_string(),
        docid: docid.map(str::to_string),
        path,
    }
}
