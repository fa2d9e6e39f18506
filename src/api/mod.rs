//! Purpose: Define the stable public Rust API boundary for bibserve.
//! Exports: Core types and operations needed by the CLI and server.
//! Role: Public, additive-only surface; hides internal storage modules.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

mod catalog;
mod resolver;
mod upstream;
mod validation;

pub use crate::core::docid::{ensure_docid, ensure_snapshot_tag};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::record::{
    BibliographicItem, DocId, RecordEnvelope, SourceIssue, bibitem_from_value, normalize_relaxed,
    primary_docid,
};
pub use crate::core::search::{
    DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT, SearchCache, SearchHit, SearchQuery, clamp_limit,
    search, search_cached,
};
pub use crate::core::store::{PutOutcome, SnapshotManifest, SnapshotStatus, Store, StoreScan};
pub use crate::core::xml2rfc::reference_xml;
pub use crate::store_paths::default_data_dir;
pub use catalog::{Catalog, DEFAULT_DB_NAME};
pub use resolver::{DEFAULT_FETCH_RETRIES, RecordSource, Resolver};
pub use upstream::{DEFAULT_UPSTREAM_TIMEOUT, UpstreamClient};
pub use validation::{ValidationIssue, ValidationReport, ValidationStatus};
