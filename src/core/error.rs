use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

// Discriminants are the process exit codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal = 1,
    Usage = 2,
    NotFound = 3,
    AlreadyExists = 4,
    Busy = 5,
    Permission = 6,
    Corrupt = 7,
    Io = 8,
    Upstream = 9,
}

impl ErrorKind {
    /// Stable wire identifier, used in JSON error bodies and notices.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "internal",
            ErrorKind::Usage => "usage",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Busy => "busy",
            ErrorKind::Permission => "permission",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Io => "io",
            ErrorKind::Upstream => "upstream",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Detail,
}

#[derive(Debug, Default)]
struct Detail {
    message: Option<String>,
    hint: Option<String>,
    docid: Option<String>,
    snapshot: Option<String>,
    path: Option<PathBuf>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: Detail::default(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.detail.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.detail.hint.as_deref()
    }

    pub fn docid(&self) -> Option<&str> {
        self.detail.docid.as_deref()
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.detail.snapshot.as_deref()
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.detail.path.as_ref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.detail.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.detail.hint = Some(hint.into());
        self
    }

    pub fn with_docid(mut self, docid: impl Into<String>) -> Self {
        self.detail.docid = Some(docid.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.detail.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.detail.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.detail.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = self.message() {
            write!(f, ": {message}")?;
        }
        let path_text = self
            .detail
            .path
            .as_ref()
            .map(|path| path.display().to_string());
        let locators = [
            ("docid", self.detail.docid.as_deref()),
            ("snapshot", self.detail.snapshot.as_deref()),
            ("path", path_text.as_deref()),
        ];
        for (label, value) in locators {
            if let Some(value) = value {
                write!(f, " ({label}: {value})")?;
            }
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.detail
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    kind as i32
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        assert_eq!(to_exit_code(ErrorKind::Internal), 1);
        assert_eq!(to_exit_code(ErrorKind::Usage), 2);
        assert_eq!(to_exit_code(ErrorKind::NotFound), 3);
        assert_eq!(to_exit_code(ErrorKind::AlreadyExists), 4);
        assert_eq!(to_exit_code(ErrorKind::Busy), 5);
        assert_eq!(to_exit_code(ErrorKind::Permission), 6);
        assert_eq!(to_exit_code(ErrorKind::Corrupt), 7);
        assert_eq!(to_exit_code(ErrorKind::Io), 8);
        assert_eq!(to_exit_code(ErrorKind::Upstream), 9);
    }

    #[test]
    fn display_includes_locators() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("no such record")
            .with_docid("RFC1234")
            .with_snapshot("test");
        let text = err.to_string();
        assert!(text.contains("NotFound: no such record"));
        assert!(text.contains("docid: RFC1234"));
        assert!(text.contains("snapshot: test"));
    }

    #[test]
    fn wire_kind_round_trips_through_display_prefix() {
        let err = Error::new(ErrorKind::Upstream).with_message("request failed");
        assert!(err.to_string().starts_with("Upstream: "));
        assert_eq!(err.kind().as_str(), "upstream");
    }
}
