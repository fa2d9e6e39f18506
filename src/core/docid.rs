//! Purpose: Validate document identifiers and snapshot tags.
//! Exports: `ensure_docid`, `ensure_snapshot_tag`, `docid_file_stem`, `docid_from_file_stem`.
//! Role: Keep CLI, server, and store key semantics aligned from one source.
//! Invariants: Valid identifiers never contain whitespace or path traversal.
//! Invariants: File stems are reversible back to the identifier.

use crate::core::error::{Error, ErrorKind};

pub const MAX_DOCID_LEN: usize = 128;
pub const MAX_SNAPSHOT_LEN: usize = 64;

const DOCID_SEPARATORS: [char; 4] = ['.', '-', '_', '/'];

fn is_docid_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '/')
}

/// Validates a document identifier against the key grammar.
///
/// Identifiers are 1..=128 bytes of `[A-Za-z0-9._/-]` with no leading or
/// trailing separator and no `..` or `//` runs. Comparison is byte-for-byte;
/// `RFC1234` and `rfc1234` are distinct keys.
pub fn ensure_docid(docid: &str) -> Result<(), Error> {
    if docid.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("document identifier is empty")
            .with_hint("Provide an identifier like RFC1234 or I-D.ietf-quic-transport."));
    }
    if docid.len() > MAX_DOCID_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "document identifier exceeds {MAX_DOCID_LEN} bytes"
            ))
            .with_docid(&docid[..MAX_DOCID_LEN.min(docid.len())]));
    }
    if let Some(bad) = docid.chars().find(|ch| !is_docid_char(*ch)) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("document identifier contains {bad:?}"))
            .with_docid(docid)
            .with_hint("Identifiers may use ASCII letters, digits, and . - _ /."));
    }
    let first = docid.chars().next().unwrap_or_default();
    let last = docid.chars().last().unwrap_or_default();
    if DOCID_SEPARATORS.contains(&first) || DOCID_SEPARATORS.contains(&last) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("document identifier starts or ends with a separator")
            .with_docid(docid));
    }
    if docid.contains("..") || docid.contains("//") {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("document identifier contains a separator run")
            .with_docid(docid));
    }
    Ok(())
}

/// Validates a snapshot tag: 1..=64 chars of `[A-Za-z0-9._-]`, and the first
/// character must be alphanumeric.
pub fn ensure_snapshot_tag(tag: &str) -> Result<(), Error> {
    if tag.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("snapshot tag is empty")
            .with_hint("Provide a tag like head, 2024-03, or test."));
    }
    if tag.len() > MAX_SNAPSHOT_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("snapshot tag exceeds {MAX_SNAPSHOT_LEN} bytes")));
    }
    if let Some(bad) = tag
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_')))
    {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("snapshot tag contains {bad:?}"))
            .with_snapshot(tag)
            .with_hint("Tags may use ASCII letters, digits, and . - _."));
    }
    let first = tag.chars().next().unwrap_or_default();
    if !first.is_ascii_alphanumeric() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("snapshot tag must start with a letter or digit")
            .with_snapshot(tag));
    }
    Ok(())
}

/// Maps an identifier to its record file stem. `/` becomes `+` so identifiers
/// containing a slash stay one path component; `+` is outside the identifier
/// alphabet, so the mapping is injective.
pub fn docid_file_stem(docid: &str) -> String {
    docid.replace('/', "+")
}

/// Reverses `docid_file_stem`.
pub fn docid_from_file_stem(stem: &str) -> String {
    stem.replace('+', "/")
}

#[cfg(test)]
mod tests {
    use super::{docid_file_stem, docid_from_file_stem, ensure_docid, ensure_snapshot_tag};
    use crate::core::error::ErrorKind;

    #[test]
    fn accepts_common_identifier_families() {
        for docid in [
            "RFC1234",
            "BCP47",
            "STD68",
            "I-D.ietf-quic-transport",
            "W3C.REC-xml-20081126",
            "IEEE.802-3.1988",
            "NIST.SP.800-38A",
            "ANSI/IEEE.802-1985",
        ] {
            assert!(ensure_docid(docid).is_ok(), "rejected {docid}");
        }
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for docid in [
            "",
            " RFC1234",
            "RFC 1234",
            ".RFC1234",
            "RFC1234.",
            "a//b",
            "a/../b",
            "RFC#1",
            "ref\u{e9}rence",
        ] {
            let err = ensure_docid(docid).expect_err(&format!("accepted {docid:?}"));
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn rejects_oversized_identifier() {
        let long = "R".repeat(129);
        assert_eq!(
            ensure_docid(&long).expect_err("accepted").kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn snapshot_tags_validate() {
        assert!(ensure_snapshot_tag("head").is_ok());
        assert!(ensure_snapshot_tag("2024-03.1").is_ok());
        assert!(ensure_snapshot_tag("test").is_ok());
        for tag in ["", ".hidden", "-dash", "a/b", "tag with space"] {
            assert_eq!(
                ensure_snapshot_tag(tag).expect_err("accepted").kind(),
                ErrorKind::Usage
            );
        }
    }

    #[test]
    fn file_stem_round_trips_slashes() {
        let docid = "ANSI/IEEE.802-1985";
        let stem = docid_file_stem(docid);
        assert_eq!(stem, "ANSI+IEEE.802-1985");
        assert_eq!(docid_from_file_stem(&stem), docid);
        assert!(!stem.contains('/'));
    }
}
