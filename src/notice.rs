//! Purpose: Structured schema for non-fatal notices on stderr.
//! Exports: `Notice`, `notice_json`.
//! Role: Keeps CLI diagnostics machine-readable without touching stdout payloads.
//! Invariants: A notice never changes the exit code of the command that emits it.
//! Invariants: Published fields are additive-only; consumers may rely on them.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub snapshot: String,
    pub docid: Option<String>,
    pub message: String,
    pub details: Map<String, Value>,
}

/// Wire form of a notice: `{"notice": {...}}` with `docid` present only
/// when the event concerns a specific record.
pub fn notice_json(notice: &Notice) -> Value {
    let mut body = json!({
        "kind": notice.kind,
        "time": notice.time,
        "cmd": notice.cmd,
        "snapshot": notice.snapshot,
        "message": notice.message,
        "details": Value::Object(notice.details.clone()),
    });
    if let Some(docid) = &notice.docid {
        body["docid"] = json!(docid);
    }
    json!({ "notice": body })
}

#[cfg(test)]
mod tests {
    use super::{Notice, notice_json};
    use serde_json::{Map, Value};

    #[test]
    fn notice_json_has_required_fields() {
        let mut details = Map::new();
        details.insert("line".to_string(), Value::from(7));

        let notice = Notice {
            kind: "ingest_skip".to_string(),
            time: "2026-02-01T00:00:00Z".to_string(),
            cmd: "ingest".to_string(),
            snapshot: "test".to_string(),
            docid: None,
            message: "skipped invalid record".to_string(),
            details,
        };

        let body = &notice_json(&notice)["notice"];
        assert_eq!(body["kind"], "ingest_skip");
        assert_eq!(body["time"], "2026-02-01T00:00:00Z");
        assert_eq!(body["cmd"], "ingest");
        assert_eq!(body["snapshot"], "test");
        assert_eq!(body["message"], "skipped invalid record");
        assert_eq!(body["details"]["line"], 7);
        assert!(body.get("docid").is_none());
    }

    #[test]
    fn notice_json_includes_docid_when_present() {
        let notice = Notice {
            kind: "fallback".to_string(),
            time: "2026-02-01T00:00:00Z".to_string(),
            cmd: "fetch".to_string(),
            snapshot: "head".to_string(),
            docid: Some("RFC.1234".to_string()),
            message: "served from upstream".to_string(),
            details: Map::new(),
        };

        let value = notice_json(&notice);
        assert_eq!(value["notice"]["docid"].as_str(), Some("RFC.1234"));
    }
}
