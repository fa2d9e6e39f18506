//! Purpose: Parse relaton input streams into JSON documents for `ingest`.
//! Exports: `IngestMode`, `ErrorPolicy`, `IngestConfig`, `IngestOutcome`, `IngestFailure`, `ingest`.
//! Role: Input ingestion engine used by the CLI; isolates streaming heuristics from main.
//! Invariants: Auto detection is deterministic, bounded, and documented by config limits.
//! Invariants: Skip mode only continues at well-defined record boundaries.
//! Invariants: No unbounded buffering; per-record buffering is capped.
use std::io::{self, BufRead, BufReader, Read};

use bstr::ByteSlice;
use serde_json::Value;

use bibserve::api::{Error, ErrorKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IngestMode {
    Auto,
    Jsonl,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorPolicy {
    Stop,
    Skip,
}

#[derive(Copy, Clone, Debug)]
pub struct IngestConfig {
    pub mode: IngestMode,
    pub errors: ErrorPolicy,
    pub sniff_bytes: usize,
    pub sniff_lines: usize,
    pub max_record_bytes: usize,
    pub max_snippet_bytes: usize,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct IngestOutcome {
    pub records_total: u64,
    pub ok: u64,
    pub failed: u64,
}

#[derive(Clone, Debug)]
pub struct IngestFailure {
    pub index: u64,
    pub mode: IngestMode,
    pub message: String,
    pub error_kind: String,
    pub snippet: Option<String>,
    pub line: Option<u64>,
}

/// Feed a stream of relaton documents to `on_value`, one record at a time.
/// Under the skip policy, records that fail to parse or that the store
/// rejects are reported through `on_failure` and counted instead of
/// aborting the run.
pub fn ingest<R, F, N>(
    reader: R,
    config: IngestConfig,
    on_value: F,
    on_failure: N,
) -> Result<IngestOutcome, Error>
where
    R: Read,
    F: FnMut(Value) -> Result<(), Error>,
    N: FnMut(IngestFailure),
{
    let mut sink = Sink {
        policy: config.errors,
        mode: config.mode,
        index: 0,
        accepted: 0,
        rejected: 0,
        on_value,
        on_failure,
    };
    match config.mode {
        IngestMode::Auto => {
            let (shape, replay) = probe_layout(reader, &config)?;
            match shape {
                DumpShape::Array => read_document(replay, &config, &mut sink)?,
                DumpShape::Lines => read_delimited(replay, &config, true, &mut sink)?,
            }
        }
        IngestMode::Jsonl => read_delimited(reader, &config, false, &mut sink)?,
        IngestMode::Json => read_document(reader, &config, &mut sink)?,
    }
    Ok(sink.outcome())
}

/// One record that never reached the store, with enough context for a
/// useful diagnostic.
struct Rejection {
    line: Option<u64>,
    message: String,
    kind: String,
    snippet: Option<String>,
}

impl Rejection {
    fn unparsable(line: Option<u64>, text: &str, config: &IngestConfig) -> Self {
        Self {
            line,
            message: "invalid json input".to_string(),
            kind: "parse".to_string(),
            snippet: Some(clip(text, config.max_snippet_bytes)),
        }
    }

    fn oversize(line: Option<u64>, text: &str, config: &IngestConfig) -> Self {
        Self {
            line,
            message: "record exceeds size limit".to_string(),
            kind: "oversize".to_string(),
            snippet: Some(clip(text, config.max_snippet_bytes)),
        }
    }
}

/// Applies the error policy and keeps the running counts. All record
/// outcomes funnel through here so indices stay consistent across the
/// layout variants.
struct Sink<F, N> {
    policy: ErrorPolicy,
    mode: IngestMode,
    index: u64,
    accepted: u64,
    rejected: u64,
    on_value: F,
    on_failure: N,
}

impl<F, N> Sink<F, N>
where
    F: FnMut(Value) -> Result<(), Error>,
    N: FnMut(IngestFailure),
{
    fn begin_record(&mut self) {
        self.index += 1;
    }

    fn accept(&mut self, value: Value, line: Option<u64>) -> Result<(), Error> {
        match (self.on_value)(value) {
            Ok(()) => {
                self.accepted += 1;
                Ok(())
            }
            Err(err) if self.policy == ErrorPolicy::Skip && !is_fatal(&err) => {
                let rejection = Rejection {
                    line,
                    message: err.message().unwrap_or("store rejected record").to_string(),
                    kind: err.kind().as_str().to_string(),
                    snippet: None,
                };
                self.reject(rejection)
            }
            Err(err) => Err(err),
        }
    }

    fn reject(&mut self, rejection: Rejection) -> Result<(), Error> {
        match self.policy {
            ErrorPolicy::Stop => {
                let mut err = Error::new(ErrorKind::Usage).with_message(rejection.message);
                if rejection.kind == "parse" {
                    err =
                        err.with_hint("Use --errors skip to continue or select the correct mode.");
                }
                Err(err)
            }
            ErrorPolicy::Skip => {
                self.rejected += 1;
                (self.on_failure)(IngestFailure {
                    index: self.index,
                    mode: self.mode,
                    message: rejection.message,
                    error_kind: rejection.kind,
                    snippet: rejection.snippet,
                    line: rejection.line,
                });
                Ok(())
            }
        }
    }

    fn outcome(&self) -> IngestOutcome {
        IngestOutcome {
            records_total: self.accepted + self.rejected,
            ok: self.accepted,
            failed: self.rejected,
        }
    }
}

// Environment failures abort even under skip; only record-level
// rejections are skippable.
fn is_fatal(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Io | ErrorKind::Internal | ErrorKind::Busy | ErrorKind::Permission
    )
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DumpShape {
    Array,
    Lines,
}

type Replay<R> = io::Chain<io::Cursor<Vec<u8>>, BufReader<R>>;

/// Buffers a bounded window from the head of the stream, classifies it,
/// and hands back a reader that replays the window before the remainder.
fn probe_layout<R: Read>(reader: R, config: &IngestConfig) -> Result<(DumpShape, Replay<R>), Error> {
    let mut source = BufReader::new(reader);
    let mut window: Vec<u8> = Vec::new();
    let mut seen_lines = 0usize;
    while window.len() < config.sniff_bytes && seen_lines < config.sniff_lines {
        let chunk = source.fill_buf().map_err(read_error)?;
        if chunk.is_empty() {
            break;
        }
        let take = chunk.len().min(config.sniff_bytes - window.len());
        seen_lines += chunk[..take].iter().filter(|byte| **byte == b'\n').count();
        window.extend_from_slice(&chunk[..take]);
        source.consume(take);
    }
    let shape = classify_window(&window);
    Ok((shape, io::Cursor::new(window).chain(source)))
}

// An exported dataset is either one JSON document (usually an array of
// relaton items) or newline-delimited items. The first non-blank line
// decides; a lone multiline object is recovered by the delimited path.
fn classify_window(window: &[u8]) -> DumpShape {
    for line in ByteSlice::lines(window) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.first() == Some(&b'[') {
            return DumpShape::Array;
        }
        break;
    }
    DumpShape::Lines
}

fn read_delimited<R, F, N>(
    reader: R,
    config: &IngestConfig,
    recover_multiline: bool,
    sink: &mut Sink<F, N>,
) -> Result<(), Error>
where
    R: Read,
    F: FnMut(Value) -> Result<(), Error>,
    N: FnMut(IngestFailure),
{
    sink.mode = IngestMode::Jsonl;
    let mut lines = BufReader::new(reader);
    let mut buf = String::new();
    let mut line_no = 0u64;
    loop {
        buf.clear();
        if read_one_line(&mut lines, &mut buf)? == 0 {
            return Ok(());
        }
        line_no += 1;
        let text = buf.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            continue;
        }
        sink.begin_record();
        if text.len() > config.max_record_bytes {
            sink.reject(Rejection::oversize(Some(line_no), text, config))?;
            continue;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => sink.accept(value, Some(line_no))?,
            Err(_) if recover_multiline && starts_record(text) => {
                line_no = continue_multiline(&mut lines, text, line_no, config, sink)?;
            }
            Err(_) => sink.reject(Rejection::unparsable(Some(line_no), text, config))?,
        }
    }
}

/// Accumulates lines until the buffer parses, the input ends, or (under
/// skip) a fresh record start allows resynchronization. Returns the line
/// number the outer loop should continue from.
fn continue_multiline<R, F, N>(
    lines: &mut BufReader<R>,
    first: &str,
    start_line: u64,
    config: &IngestConfig,
    sink: &mut Sink<F, N>,
) -> Result<u64, Error>
where
    R: Read,
    F: FnMut(Value) -> Result<(), Error>,
    N: FnMut(IngestFailure),
{
    let mut pending = String::from(first);
    let mut opened_at = start_line;
    let mut line_no = start_line;
    let mut next = String::new();
    loop {
        if pending.len() > config.max_record_bytes {
            sink.reject(Rejection::oversize(Some(opened_at), &pending, config))?;
            return Ok(line_no);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&pending) {
            sink.accept(value, Some(opened_at))?;
            return Ok(line_no);
        }
        next.clear();
        if read_one_line(lines, &mut next)? == 0 {
            sink.reject(Rejection::unparsable(Some(opened_at), &pending, config))?;
            return Ok(line_no);
        }
        line_no += 1;
        let text = next.trim_end_matches(['\r', '\n']);
        if sink.policy == ErrorPolicy::Skip && starts_record(text) {
            sink.reject(Rejection::unparsable(Some(opened_at), &pending, config))?;
            sink.begin_record();
            opened_at = line_no;
            pending.clear();
            pending.push_str(text);
            continue;
        }
        pending.push_str(&next);
    }
}

fn read_document<R, F, N>(
    mut reader: R,
    config: &IngestConfig,
    sink: &mut Sink<F, N>,
) -> Result<(), Error>
where
    R: Read,
    F: FnMut(Value) -> Result<(), Error>,
    N: FnMut(IngestFailure),
{
    sink.mode = IngestMode::Json;
    let mut body = String::new();
    reader.read_to_string(&mut body).map_err(read_error)?;
    if body.trim().is_empty() {
        return Ok(());
    }
    if body.len() > config.max_record_bytes {
        sink.begin_record();
        return sink.reject(Rejection::oversize(None, &body, config));
    }
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Array(items)) => {
            for item in items {
                sink.begin_record();
                sink.accept(item, None)?;
            }
            Ok(())
        }
        Ok(value) => {
            sink.begin_record();
            sink.accept(value, None)
        }
        Err(_) => {
            sink.begin_record();
            sink.reject(Rejection::unparsable(None, &body, config))
        }
    }
}

fn read_one_line<R: Read>(reader: &mut BufReader<R>, buf: &mut String) -> Result<usize, Error> {
    reader.read_line(buf).map_err(read_error)
}

fn read_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to read input")
        .with_source(err)
}

fn starts_record(line: &str) -> bool {
    matches!(line.trim_start().as_bytes().first(), Some(b'{' | b'['))
}

/// Truncates to at most `max` bytes on a character boundary, marking the
/// cut with an ellipsis.
fn clip(input: &str, max: usize) -> String {
    const ELLIPSIS: &str = "...";
    if input.len() <= max {
        return input.to_string();
    }
    if max <= ELLIPSIS.len() {
        return ELLIPSIS[..max].to_string();
    }
    let mut cut = max - ELLIPSIS.len();
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{ELLIPSIS}", &input[..cut])
}
