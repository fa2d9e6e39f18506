// Core modules implementing record storage, search, rendition, and error modeling.
pub mod docid;
pub mod error;
pub mod record;
pub mod search;
pub mod store;
pub mod xml2rfc;
