//! Purpose: `bibserve` CLI entry point and v0 command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable stdout formats (human or JSON by command/flags).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All record mutations go through `api::Catalog` (locks + write-once).
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal, Read};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

mod colorize;
mod command_dispatch;
mod config;
mod ingest;
mod search_filter;
mod serve;
mod serve_init;

use bibserve::api::{
    Catalog, DEFAULT_UPSTREAM_TIMEOUT, Error, ErrorKind, RecordEnvelope, Resolver, SearchHit,
    SearchQuery, SnapshotStatus, UpstreamClient, ValidationReport, ValidationStatus,
    bibitem_from_value, clamp_limit, ensure_snapshot_tag, primary_docid, reference_xml, search,
    to_exit_code,
};
use bibserve::notice::{Notice, notice_json};
use colorize::{colorize_json, colorize_xml};
use config::ServiceConfig;
use ingest::{ErrorPolicy, IngestConfig, IngestFailure, IngestMode, IngestOutcome, ingest};
use search_filter::{compile_filters, matches_all};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self::with_code(0)
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

/// Either a parsed command line or an early exit (help/version output).
enum ParsedCli {
    Command(Box<Cli>),
    Done(RunOutcome),
}

fn main() {
    std::process::exit(match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    });
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match parse_cli().map_err(|err| (err, ColorMode::Auto))? {
        ParsedCli::Command(cli) => *cli,
        ParsedCli::Done(outcome) => return Ok(outcome),
    };

    let color_mode = cli.color;
    let mut service = ServiceConfig::from_env().map_err(|err| (err, color_mode))?;
    if let Some(data_dir) = cli.data_dir {
        service.data_dir = data_dir;
    }
    if let Some(db) = cli.db {
        service.db_name = db;
    }

    command_dispatch::dispatch_command(cli.command, service, color_mode)
        .map_err(|err| (with_default_hint(err), color_mode))
}

fn parse_cli() -> Result<ParsedCli, Error> {
    match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => Ok(ParsedCli::Command(Box::new(cli))),
        Err(err) if is_informational(err.kind()) => {
            err.print().map_err(|io_err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to write help")
                    .with_source(io_err)
            })?;
            // Bare invocations that only print help are still usage errors.
            let exit_code = match err.kind() {
                ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 2,
                _ => 0,
            };
            Ok(ParsedCli::Done(RunOutcome::with_code(exit_code)))
        }
        Err(err) => Err(Error::new(ErrorKind::Usage)
            .with_message(clap_error_summary(&err))
            .with_hint(clap_error_hint(&err))),
    }
}

fn is_informational(kind: ClapErrorKind) -> bool {
    matches!(
        kind,
        ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    )
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some("---help") => OsString::from("--help"),
            Some("---version") => OsString::from("--version"),
            _ => arg,
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "bibserve",
    version,
    about = "Bibliographic reference store and resolver for xml2rfc data",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Stores relaton bibliographic records in immutable snapshots and serves
them over HTTP as JSON or BibXML.

Mental model:
  - `ingest` loads records into a snapshot (write)
  - `fetch` resolves one record by identifier (read)
  - `serve` exposes the store over HTTP
"#,
    after_help = r#"EXAMPLES
  $ bibserve snapshot create test
  $ bibserve ingest test refs.jsonl
  $ bibserve fetch RFC.1234
  $ bibserve serve --bind 127.0.0.1:9013

LEARN MORE
  Common snapshot operations:
    bibserve snapshot create <tag>
    bibserve snapshot info <tag>
    bibserve snapshot list
    bibserve snapshot delete <tag>

  $ bibserve <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long = "data-dir",
        help = "Data directory for the reference store (default: ~/.bibserve)",
        value_hint = ValueHint::DirPath
    )]
    data_dir: Option<PathBuf>,
    #[arg(
        long,
        help = "Logical database name under the data directory (default: bibxml)"
    )]
    db: Option<String>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and pretty output: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum InputMode {
    Auto,
    Jsonl,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, ValueEnum)]
enum ErrorPolicyCli {
    Stop,
    Skip,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RefFormat {
    Relaton,
    Bibxml,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Manage snapshots of the reference store",
        long_about = r#"Create and inspect snapshots.

Snapshots are immutable generations of bibliographic data: records are
write-once per (snapshot, docid), so a tag never changes under a reader."#,
        after_help = r#"EXAMPLES
  $ bibserve snapshot create test
  $ bibserve snapshot info test
  $ bibserve snapshot list
  $ bibserve snapshot delete old-2025 --force

NOTES
  - Default location: ~/.bibserve (override with --data-dir or BIBSERVE_DATA_DIR)"#
    )]
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Load relaton records into a snapshot",
        long_about = r#"Load relaton JSON documents into a snapshot.

Accepts file paths or stdin (use -). Each document is normalized, keyed by
its primary docid, and stored write-once under the snapshot tag."#,
        after_help = r#"EXAMPLES
  $ bibserve ingest test refs.jsonl                       # one document per line
  $ bibserve ingest test dump.json                        # single document or array
  $ curl -sS https://example.org/refs.json | bibserve ingest test -"#,
        after_long_help = r#"EXAMPLES
  # JSON Lines file
  $ bibserve ingest test refs.jsonl

  # Single JSON document (top-level arrays fan out per element)
  $ bibserve ingest test dump.json

  # Several files in one run
  $ bibserve ingest test rfcs.jsonl drafts.jsonl

  # Pipe from another service
  $ curl -sS https://example.org/v0/snapshots/head/export | bibserve ingest mirror -

  # Keep going past bad records
  $ bibserve ingest test refs.jsonl --errors skip

NOTES
  - `--in auto` detects JSON Lines vs a single JSON document from a bounded prefix
  - `--errors skip` continues past bad records and reports them as notices on stderr
  - `--strict` rejects records that do not parse as strict relaton
  - A second conflicting record for the same docid fails; identical records are no-ops
  - The run summary (stored, skipped, elapsed) prints as JSON on stdout"#
    )]
    Ingest {
        #[arg(help = "Snapshot tag to load records into")]
        snapshot: String,
        #[arg(
            help = "Input files (JSON or JSON Lines; use - for stdin)",
            value_hint = ValueHint::FilePath
        )]
        files: Vec<String>,
        #[arg(
            short = 'i',
            long = "in",
            default_value = "auto",
            value_enum,
            help = "Input mode",
            long_help = r#"Input mode

  auto   Detect from the stream prefix (JSON document vs JSON Lines)
  jsonl  One relaton document per line
  json   Single JSON document (top-level arrays fan out per element)"#
        )]
        input: InputMode,
        #[arg(
            short = 'e',
            long = "errors",
            default_value = "stop",
            value_enum,
            help = "What to do with bad records: stop|skip"
        )]
        errors: ErrorPolicyCli,
        #[arg(long, help = "Reject records that do not parse as strict relaton")]
        strict: bool,
    },
    #[command(
        about = "Serve references over HTTP (loopback default in v0)",
        long_about = r#"Serve the reference store over HTTP.

Exposes /v0/refs, /v0/search, and /v0/snapshots plus /healthz and /about.
Honors the HOST/PORT/API_SECRET/SNAPSHOT environment contract; flags override
the environment."#,
        after_help = r#"EXAMPLES
  $ bibserve serve                                              # loopback, no auth
  $ bibserve serve init                                         # bootstrap TLS + secret
  $ bibserve serve check                                        # validate config"#,
        after_long_help = r#"EXAMPLES
  $ bibserve serve
  $ bibserve serve --bind 127.0.0.1:9014 --snapshot test
  $ bibserve serve --api-secret-file /path/to/secret
  $ bibserve serve --tls-self-signed
  $ bibserve serve --upstream https://bib.example.org check
  $ bibserve serve init --output-dir ./.bibserve-serve

NOTES
  - `bibserve serve` prints a startup "next commands" block on interactive terminals
  - Use `bibserve serve check` to validate config without binding sockets
  - Use `bibserve serve init` to scaffold secret + TLS artifacts for non-loopback setup
  - Loopback is the default; non-loopback binds require --allow-non-loopback
  - Clients send Authorization: Bearer <secret> when a secret is configured
  - Prefer --api-secret-file for non-loopback deployments; --api-secret is dev-only
  - Non-loopback serving with a secret requires TLS (or --insecure-no-tls for demos)
  - --upstream chains this instance to another bibserve speaking the same v0 API
  - Use repeatable --cors-origin to allow browser clients from specific origins
  - Safety limits: --max-body-bytes, --max-export-concurrency"#
    )]
    Serve {
        #[command(subcommand)]
        subcommand: Option<ServeSubcommand>,
        #[command(flatten)]
        run: ServeRunArgs,
    },
    #[command(
        arg_required_else_help = true,
        about = "Resolve one reference by document identifier",
        long_about = r#"Resolve a document identifier to its bibliographic record.

Stored records win; on a miss the configured upstream (BIBSERVE_UPSTREAM) is
consulted once and the result is stored. With --remote the lookup goes against
a running bibserve service instead of the local store."#,
        after_help = r#"EXAMPLES
  $ bibserve fetch RFC.1234
  $ bibserve fetch RFC.9110 --format bibxml
  $ bibserve fetch RFC.1234 --remote https://127.0.0.1:9013 --secret-file api-secret.txt --tls-ca serve-cert.pem"#
    )]
    Fetch {
        #[arg(help = "Document identifier, for example RFC.1234")]
        docid: String,
        #[arg(
            long,
            value_enum,
            default_value = "relaton",
            help = "Output format: relaton|bibxml"
        )]
        format: RefFormat,
        #[arg(
            long,
            value_name = "URL",
            help = "Fetch from a running bibserve service instead of the local store",
            help_heading = "Remote auth/TLS"
        )]
        remote: Option<String>,
        #[arg(
            long,
            help = "Bearer secret for --remote (dev-only; prefer --secret-file)",
            help_heading = "Remote auth/TLS"
        )]
        secret: Option<String>,
        #[arg(
            long,
            value_name = "PATH",
            help = "Read the bearer secret from file for --remote",
            value_hint = ValueHint::FilePath,
            help_heading = "Remote auth/TLS"
        )]
        secret_file: Option<PathBuf>,
        #[arg(
            long = "tls-ca",
            value_name = "PATH",
            help = "PEM certificate or CA bundle to trust for the remote connection",
            value_hint = ValueHint::FilePath,
            help_heading = "Remote auth/TLS"
        )]
        tls_ca: Option<PathBuf>,
        #[arg(
            long,
            help = "Disable remote TLS certificate verification (unsafe; dev-only)",
            help_heading = "Remote auth/TLS"
        )]
        insecure: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Search stored references",
        long_about = r#"Search the active snapshot.

A plain query matches document identifiers (exact matches rank first) and
falls back to full-body substring search. With --struct the query is a JSON
object matched by containment against the relaton body."#,
        after_help = r#"EXAMPLES
  $ bibserve search RFC.1234
  $ bibserve search '{"doctype": "rfc"}' --struct
  $ bibserve search http --where '.keyword[]? == "http"' --limit 20
  $ bibserve search RFC --json | jq '.hits[].docid'"#
    )]
    Search {
        #[arg(help = "Query: identifier text, or a JSON object with --struct")]
        query: String,
        #[arg(
            long = "struct",
            help = "Treat the query as a JSON structure matched by containment"
        )]
        structured: bool,
        #[arg(long, help = "Maximum number of hits (default 100, max 400)")]
        limit: Option<usize>,
        #[arg(
            long = "where",
            value_name = "EXPR",
            help = "Filter hits by boolean expression over the relaton body (repeatable; AND across repeats)"
        )]
        where_expr: Vec<String>,
        #[arg(long, help = "Machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Diagnose stored snapshot health",
        long_about = r#"Validate stored snapshots and emit a diagnostic report.

Checks manifests, envelope parsing, filename/docid agreement, content digests,
and BibXML well-formedness. Defaults to the active snapshot."#,
        after_help = r#"EXAMPLES
  $ bibserve doctor
  $ bibserve doctor test
  $ bibserve doctor --all
  $ bibserve doctor --all --json

NOTES
  - Human-readable output is the default.
  - Use --json for machine-readable output.
  - Exits nonzero when corruption is detected."#
    )]
    Doctor {
        #[arg(help = "Snapshot tag (default: the active snapshot)")]
        snapshot: Option<String>,
        #[arg(long, help = "Validate every snapshot in the store")]
        all: bool,
        #[arg(long, help = "Machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Print version info as JSON",
        long_about = r#"Print the binary name and version as a stable JSON object."#,
        after_help = r#"EXAMPLES
  $ bibserve version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        long_about = r#"Write a tab-completion script for the given shell to stdout.

Source the script, or install it into the shell's completion directory,
to complete bibserve commands and flags."#,
        after_help = r#"EXAMPLES
  $ bibserve completion bash > ~/.local/share/bash-completion/completions/bibserve
  $ source ~/.bashrc
  $ bibserve completion zsh > ~/.zfunc/_bibserve
  $ autoload -U compinit && compinit
  $ bibserve completion fish > ~/.config/fish/completions/bibserve.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    #[command(
        arg_required_else_help = true,
        about = "Create an empty snapshot",
        long_about = r#"Create an empty snapshot (manifest only).

Ingesting into a missing tag also creates it; an explicit create reserves the
tag up front and fails if it already exists."#,
        after_help = r#"EXAMPLES
  $ bibserve snapshot create test
  $ bibserve snapshot create 2026-08-22"#
    )]
    Create {
        #[arg(help = "Snapshot tag to create")]
        tag: String,
    },
    #[command(
        about = "List snapshots with record counts",
        after_help = r#"EXAMPLES
  $ bibserve snapshot list
  $ bibserve snapshot list --json

NOTES
  - Human-readable output is the default.
  - Use --json for machine-readable output."#
    )]
    List {
        #[arg(long, help = "Machine-readable JSON output")]
        json: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Show one snapshot's manifest and record count",
        after_help = r#"EXAMPLES
  $ bibserve snapshot info test"#
    )]
    Info {
        #[arg(help = "Snapshot tag")]
        tag: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Delete a snapshot directory",
        long_about = r#"Delete a snapshot and all its records (destructive, cannot be undone).

Refuses the active snapshot unless --force is set."#,
        after_help = r#"EXAMPLES
  $ bibserve snapshot delete old-2025
  $ bibserve snapshot delete head --force"#
    )]
    Delete {
        #[arg(help = "Snapshot tag to delete")]
        tag: String,
        #[arg(long, help = "Delete even if this is the active snapshot")]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ServeSubcommand {
    #[command(
        about = "Bootstrap secure serve secret/TLS artifacts",
        long_about = r#"Generate an API secret + TLS artifacts and print copy/paste next commands for secure serve startup."#,
        after_help = r#"EXAMPLES
  $ bibserve serve init
  $ bibserve serve init --output-dir ./.bibserve-serve
  $ bibserve serve init --output-dir ./.bibserve-serve --force

NOTES
  - Writes secret/cert/key files without printing secret values
  - Refuses to overwrite existing artifacts unless --force is set"#
    )]
    Init(ServeInitArgs),
    #[command(
        about = "Validate serve config and print effective settings without starting",
        long_about = r#"Validate serve config and print effective settings without starting a server."#,
        after_help = r#"EXAMPLES
  $ bibserve serve check
  $ bibserve serve --bind 0.0.0.0:9013 --allow-non-loopback --tls-self-signed check
  $ bibserve serve --api-secret-file ./api-secret.txt check

NOTES
  - Exits non-zero on invalid config
  - No sockets are bound and no background tasks start
  - Prints human-readable text by default; --json switches to machine output"#
    )]
    Check {
        #[arg(long, help = "Machine-readable JSON output")]
        json: bool,
    },
}

#[derive(Args)]
struct ServeInitArgs {
    #[arg(
        long,
        default_value = "0.0.0.0:9013",
        help = "Bind address baked into the printed follow-up commands"
    )]
    bind: String,
    #[arg(
        long,
        default_value = ".",
        value_name = "PATH",
        help = "Directory that receives the generated files",
        value_hint = ValueHint::DirPath
    )]
    output_dir: PathBuf,
    #[arg(
        long = "api-secret-file",
        default_value = "api-secret.txt",
        value_name = "PATH",
        help = "Where to write the API secret (resolved against --output-dir unless absolute)",
        value_hint = ValueHint::FilePath
    )]
    api_secret_file: PathBuf,
    #[arg(
        long = "tls-cert",
        default_value = "serve-cert.pem",
        value_name = "PATH",
        help = "Where to write the TLS certificate (resolved against --output-dir unless absolute)",
        value_hint = ValueHint::FilePath
    )]
    tls_cert: PathBuf,
    #[arg(
        long = "tls-key",
        default_value = "serve-key.pem",
        value_name = "PATH",
        help = "Where to write the TLS private key (resolved against --output-dir unless absolute)",
        value_hint = ValueHint::FilePath
    )]
    tls_key: PathBuf,
    #[arg(long, help = "Overwrite files left by a previous init")]
    force: bool,
}

#[derive(Args)]
struct ServeRunArgs {
    #[arg(
        long,
        help = "Bind address (default: HOST:PORT from the environment, else 127.0.0.1:9013)",
        help_heading = "Connection"
    )]
    bind: Option<String>,
    #[arg(
        long,
        value_name = "TAG",
        help = "Active snapshot tag (default: SNAPSHOT from the environment, else head)",
        help_heading = "Connection"
    )]
    snapshot: Option<String>,
    #[arg(
        long = "cors-origin",
        value_name = "ORIGIN",
        help = "Origin allowed for browser requests (repeatable; exact match)",
        help_heading = "Connection"
    )]
    cors_origin: Vec<String>,
    #[arg(
        long = "api-secret",
        help = "Shared API secret (dev-only; prefer --api-secret-file)",
        help_heading = "Authentication"
    )]
    api_secret: Option<String>,
    #[arg(
        long = "api-secret-file",
        value_name = "PATH",
        help = "Read the shared API secret from file",
        value_hint = ValueHint::FilePath,
        help_heading = "Authentication"
    )]
    api_secret_file: Option<PathBuf>,
    #[arg(
        long,
        value_name = "URL",
        help = "Upstream bibserve base URL for cache-miss fetches",
        help_heading = "Upstream"
    )]
    upstream: Option<String>,
    #[arg(
        long = "upstream-secret",
        help = "Bearer secret sent to the upstream (dev-only; prefer --upstream-secret-file)",
        help_heading = "Upstream"
    )]
    upstream_secret: Option<String>,
    #[arg(
        long = "upstream-secret-file",
        value_name = "PATH",
        help = "Read the upstream bearer secret from file",
        value_hint = ValueHint::FilePath,
        help_heading = "Upstream"
    )]
    upstream_secret_file: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Path to the TLS certificate chain (PEM)", value_hint = ValueHint::FilePath, help_heading = "TLS")]
    tls_cert: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Path to the TLS private key (PEM)", value_hint = ValueHint::FilePath, help_heading = "TLS")]
    tls_key: Option<PathBuf>,
    #[arg(
        long,
        help = "Create a self-signed TLS identity at startup",
        help_heading = "TLS"
    )]
    tls_self_signed: bool,
    #[arg(
        long,
        help = "Allow non-loopback binds (unsafe without TLS + secret)",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        help = "Allow non-loopback serving with a secret but without TLS (unsafe)",
        help_heading = "Safety"
    )]
    insecure_no_tls: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Largest accepted request body in bytes",
        help_heading = "Safety"
    )]
    max_body_bytes: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_EXPORT_CONCURRENCY,
        help = "Cap on concurrently running export streams",
        help_heading = "Safety"
    )]
    max_export_concurrency: usize,
}

const DEFAULT_SNIFF_BYTES: usize = 8 * 1024;
const DEFAULT_SNIFF_LINES: usize = 8;
const DEFAULT_MAX_RECORD_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_SNIPPET_BYTES: usize = 200;
const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;
const DEFAULT_MAX_EXPORT_CONCURRENCY: usize = 4;

fn catalog_from(service: &ServiceConfig) -> Catalog {
    Catalog::new()
        .with_data_dir(service.data_dir.clone())
        .with_db_name(service.db_name.clone())
}

/// Attach a recovery hint for error kinds where the command layer did not
/// provide a more specific one.
fn with_default_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --data-dir to a writable location.",
        ),
        ErrorKind::Busy => {
            err.with_hint("Store is busy (another process holds the lock). Retry shortly.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        ErrorKind::Corrupt => {
            err.with_hint("Stored data appears corrupt. Run `bibserve doctor` to locate the damage.")
        }
        ErrorKind::Internal => err.with_hint(
            "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
        ),
        _ => err,
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let missing_required = rendered.contains("required arguments were not provided");
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `bibserve --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "bibserve") else {
        return "Try `bibserve --help`.".to_string();
    };

    let mut parts = Vec::new();
    for token in tokens.iter().skip(pos + 1) {
        if token.starts_with('-') || token.starts_with('<') || token.starts_with('[') {
            break;
        }
        parts.push(*token);
    }

    if parts.is_empty() {
        return "Try `bibserve --help`.".to_string();
    }

    if missing_required && parts.as_slice() == ["fetch"] && rendered.contains("<DOCID>") {
        return "Provide a document identifier, for example: `bibserve fetch RFC.1234`."
            .to_string();
    }

    format!("Try `bibserve {} --help`.", parts.join(" "))
}

fn parse_inline_json(data: &str) -> Result<Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_hint("Provide a single JSON value (e.g. '{\"doctype\":\"rfc\"}').")
            .with_source(err)
    })
}

fn open_input_reader(path: &str) -> Result<Box<dyn Read>, Error> {
    if path == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let reader = std::fs::File::open(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read input file")
            .with_path(path)
            .with_source(err)
    })?;
    Ok(Box::new(reader))
}

fn read_secret_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("failed to read secret file")
            .with_path(path)
            .with_source(err)
    })?;
    let secret = raw.trim().to_string();
    if secret.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("secret file is empty")
            .with_path(path));
    }
    Ok(secret)
}

fn resolve_secret_value(
    secret: Option<String>,
    secret_file: Option<PathBuf>,
    flag: &str,
) -> Result<Option<String>, Error> {
    if secret.is_some() && secret_file.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("{flag} cannot be combined with {flag}-file"))
            .with_hint(format!(
                "Use {flag}-file for safer handling, or pass {flag} for local/dev use."
            )));
    }
    if let Some(path) = secret_file {
        return read_secret_file(&path).map(Some);
    }
    Ok(secret)
}

fn reject_remote_only_flags_for_local_fetch(
    secret: Option<&str>,
    secret_file: Option<&Path>,
    tls_ca: Option<&Path>,
    insecure: bool,
) -> Result<(), Error> {
    if secret.is_none() && secret_file.is_none() && tls_ca.is_none() && !insecure {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Usage)
        .with_message("fetch remote auth/TLS flags require --remote")
        .with_hint("Use --secret/--secret-file/--tls-ca/--insecure only with --remote <url>."))
}

fn remote_client(
    remote: &str,
    secret: Option<String>,
    secret_file: Option<PathBuf>,
    tls_ca: Option<PathBuf>,
    insecure: bool,
    service: &ServiceConfig,
) -> Result<UpstreamClient, Error> {
    let secret = resolve_secret_value(secret, secret_file, "--secret")?;
    let mut client = UpstreamClient::new(remote)?
        .with_user_agent(service.user_agent())
        .with_timeout(DEFAULT_UPSTREAM_TIMEOUT);
    if let Some(secret) = secret {
        client = client.with_secret(secret);
    }
    if let Some(path) = tls_ca {
        client = client.with_tls_ca_file(path)?;
    }
    if insecure {
        client = client.with_tls_skip_verify();
    }
    Ok(client)
}

fn local_resolver(service: &ServiceConfig) -> Result<Resolver, Error> {
    let store = catalog_from(service).store()?;
    let mut resolver = Resolver::new(store, service.snapshot.clone());
    if let Some(upstream) = service.upstream.as_deref() {
        let mut client = UpstreamClient::new(upstream)?
            .with_user_agent(service.user_agent())
            .with_timeout(DEFAULT_UPSTREAM_TIMEOUT);
        if let Some(secret) = service.upstream_secret.clone() {
            client = client.with_secret(secret);
        }
        resolver = resolver.with_source(Arc::new(client));
    }
    Ok(resolver)
}

fn input_mode_to_ingest(mode: InputMode) -> IngestMode {
    match mode {
        InputMode::Auto => IngestMode::Auto,
        InputMode::Jsonl => IngestMode::Jsonl,
        InputMode::Json => IngestMode::Json,
    }
}

fn error_policy_to_ingest(policy: ErrorPolicyCli) -> ErrorPolicy {
    match policy {
        ErrorPolicyCli::Stop => ErrorPolicy::Stop,
        ErrorPolicyCli::Skip => ErrorPolicy::Skip,
    }
}

fn mode_label(mode: IngestMode) -> &'static str {
    match mode {
        IngestMode::Auto => "auto",
        IngestMode::Jsonl => "jsonl",
        IngestMode::Json => "json",
    }
}

fn ingest_failure_message(failure: &IngestFailure) -> String {
    match failure.error_kind.as_str() {
        "parse" => "Skipped invalid JSON.".to_string(),
        "oversize" => "Skipped oversized record.".to_string(),
        _ => format!("Skipped record: {}.", failure.message),
    }
}

fn ingest_failure_notice(
    failure: &IngestFailure,
    snapshot: &str,
    source_label: &str,
    color_mode: ColorMode,
) {
    let mut details = Map::new();
    details.insert("mode".to_string(), json!(mode_label(failure.mode)));
    details.insert("index".to_string(), json!(failure.index));
    details.insert("error_kind".to_string(), json!(failure.error_kind));
    details.insert("source".to_string(), json!(source_label));
    if let Some(line) = failure.line {
        details.insert("line".to_string(), json!(line));
    }
    if let Some(snippet) = &failure.snippet {
        details.insert("snippet".to_string(), json!(snippet));
    }
    let notice = Notice {
        kind: "ingest_skip".to_string(),
        time: notice_time_now().unwrap_or_else(|| "unknown".to_string()),
        cmd: "ingest".to_string(),
        snapshot: snapshot.to_string(),
        docid: None,
        message: ingest_failure_message(failure),
        details,
    };
    emit_notice(&notice, color_mode);
}

fn ingest_summary_notice(
    outcome: &IngestOutcome,
    snapshot: &str,
    source_label: &str,
    color_mode: ColorMode,
) {
    let mut details = Map::new();
    details.insert("total".to_string(), json!(outcome.records_total));
    details.insert("ok".to_string(), json!(outcome.ok));
    details.insert("failed".to_string(), json!(outcome.failed));
    details.insert("source".to_string(), json!(source_label));
    let notice = Notice {
        kind: "ingest_summary".to_string(),
        time: notice_time_now().unwrap_or_else(|| "unknown".to_string()),
        cmd: "ingest".to_string(),
        snapshot: snapshot.to_string(),
        docid: None,
        message: format!(
            "Finished with {} skipped record{}.",
            outcome.failed,
            if outcome.failed == 1 { "" } else { "s" }
        ),
        details,
    };
    emit_notice(&notice, color_mode);
}

struct IngestContext<'a> {
    catalog: &'a Catalog,
    snapshot: &'a str,
    source_label: &'a str,
    strict: bool,
    input: InputMode,
    errors: ErrorPolicyCli,
    color_mode: ColorMode,
}

fn ingest_records<R: Read>(reader: R, ctx: IngestContext<'_>) -> Result<IngestOutcome, Error> {
    let ingest_config = IngestConfig {
        mode: input_mode_to_ingest(ctx.input),
        errors: error_policy_to_ingest(ctx.errors),
        sniff_bytes: DEFAULT_SNIFF_BYTES,
        sniff_lines: DEFAULT_SNIFF_LINES,
        max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        max_snippet_bytes: DEFAULT_MAX_SNIPPET_BYTES,
    };

    let outcome = ingest(
        reader,
        ingest_config,
        |data| {
            let (item, normalized, _issues) = bibitem_from_value(data, ctx.strict)?;
            let docid = primary_docid(&item.docid)
                .and_then(|docid| docid.id.clone())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message("record has no document identifier")
                        .with_hint("Each record needs a docid entry with an id.")
                })?;
            let envelope = RecordEnvelope::new(docid, ctx.snapshot, normalized, None)?;
            ctx.catalog.put_record(&envelope)?;
            Ok(())
        },
        |failure| ingest_failure_notice(&failure, ctx.snapshot, ctx.source_label, ctx.color_mode),
    )?;

    if ctx.errors == ErrorPolicyCli::Skip && outcome.failed > 0 {
        ingest_summary_notice(&outcome, ctx.snapshot, ctx.source_label, ctx.color_mode);
    }

    Ok(outcome)
}

fn serve_config_from_run_args(
    run: ServeRunArgs,
    service: &ServiceConfig,
) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = match run.bind.as_deref() {
        Some(raw) => raw.parse().map_err(|_| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid bind address")
                .with_hint("Use a host:port value like 127.0.0.1:9013.")
        })?,
        None => service.bind()?,
    };
    if run.api_secret.is_some() && run.api_secret_file.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--api-secret cannot be combined with --api-secret-file")
            .with_hint("Use --api-secret for dev, or run `bibserve serve init` and use the generated --api-secret-file for safer deployments."));
    }
    let api_secret = if let Some(path) = run.api_secret_file {
        Some(read_secret_file(&path)?)
    } else {
        run.api_secret.or_else(|| service.api_secret.clone())
    };
    let upstream_secret = resolve_secret_value(
        run.upstream_secret,
        run.upstream_secret_file,
        "--upstream-secret",
    )?
    .or_else(|| service.upstream_secret.clone());
    Ok(serve::ServeConfig {
        bind,
        data_dir: service.data_dir.clone(),
        db_name: service.db_name.clone(),
        snapshot: run.snapshot.unwrap_or_else(|| service.snapshot.clone()),
        api_secret,
        service_name: service.service_name.clone(),
        contact_email: service.contact_email.clone(),
        user_agent: service.user_agent(),
        debug: service.debug,
        upstream: run.upstream.or_else(|| service.upstream.clone()),
        upstream_secret,
        allow_non_loopback: run.allow_non_loopback,
        insecure_no_tls: run.insecure_no_tls,
        tls_cert: run.tls_cert,
        tls_key: run.tls_key,
        tls_self_signed: run.tls_self_signed,
        max_body_bytes: run.max_body_bytes,
        max_export_concurrency: run.max_export_concurrency,
        cors_origins: run.cors_origin,
    })
}

fn display_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(addr) => {
            if addr.is_unspecified() {
                "127.0.0.1".to_string()
            } else {
                addr.to_string()
            }
        }
        IpAddr::V6(addr) => {
            let shown = if addr.is_unspecified() {
                "::1".to_string()
            } else {
                addr.to_string()
            };
            format!("[{shown}]")
        }
    }
}

fn serve_scope(ip: IpAddr) -> &'static str {
    if ip.is_loopback() {
        "loopback only"
    } else if ip.is_unspecified() {
        "all interfaces"
    } else {
        "network reachable"
    }
}

fn serve_tls_enabled(config: &serve::ServeConfig) -> bool {
    config.tls_self_signed || (config.tls_cert.is_some() && config.tls_key.is_some())
}

fn serve_scheme(config: &serve::ServeConfig) -> &'static str {
    if serve_tls_enabled(config) { "https" } else { "http" }
}

fn tls_label(config: &serve::ServeConfig) -> &'static str {
    if config.tls_self_signed {
        "self-signed"
    } else if serve_tls_enabled(config) {
        "on"
    } else {
        "off"
    }
}

fn cors_label(config: &serve::ServeConfig) -> &'static str {
    if config.cors_origins.is_empty() {
        "same-origin"
    } else {
        "allowlist"
    }
}

fn emit_serve_startup_guidance(config: &serve::ServeConfig) {
    if io::stderr().is_terminal() {
        for line in build_serve_startup_lines(config) {
            eprintln!("{line}");
        }
    }
}

fn build_serve_startup_lines(config: &serve::ServeConfig) -> Vec<String> {
    let tls_enabled = serve_tls_enabled(config);
    let has_secret = config.api_secret.is_some();
    let base_url = format!(
        "{}://{}:{}",
        serve_scheme(config),
        display_host(config.bind.ip()),
        config.bind.port()
    );
    let auth = if has_secret { "bearer" } else { "none" };

    let mut fetch_cmd = format!("bibserve fetch RFC.1234 --remote {base_url}");
    if has_secret {
        fetch_cmd.push_str(" --secret-file <secret-file>");
    }
    if tls_enabled {
        fetch_cmd.push_str(" --tls-ca <tls-cert>");
    }

    let mut lines = vec![
        format!(
            "Serving references on {base_url} ({})",
            serve_scope(config.bind.ip())
        ),
        String::new(),
        format!("  About: {base_url}/about"),
        format!(
            "  Auth: {auth}    TLS: {}    Snapshot: {}    CORS: {}",
            tls_label(config),
            config.snapshot,
            cors_label(config)
        ),
    ];
    if let Some(upstream) = config.upstream.as_deref() {
        lines.push(format!("  Upstream: {upstream}"));
    }

    lines.extend([
        String::new(),
        "Try it:".to_string(),
        String::new(),
        format!("  {fetch_cmd}"),
        String::new(),
    ]);
    if has_secret {
        lines.push("  SECRET=$(cat <secret-file>)".to_string());
    }
    let curl_tls_flag = if config.tls_self_signed { " -k" } else { "" };
    let auth_header = if has_secret {
        " -H \"Authorization: Bearer $SECRET\""
    } else {
        ""
    };
    lines.push(format!(
        "  curl{curl_tls_flag} -sS{auth_header} '{base_url}/v0/refs/RFC.1234'"
    ));
    lines.push(String::new());
    lines.push("Press Ctrl-C to stop.".to_string());

    if config.tls_self_signed {
        lines.push("Self-signed TLS: clients should trust the cert with --tls-ca.".to_string());
    }
    if config.bind.ip().is_unspecified() {
        lines.push(String::new());
        lines.push(
            "Replace 127.0.0.1 with your host IP or DNS name for remote clients.".to_string(),
        );
    }
    lines
}

fn emit_serve_check_report(config: &serve::ServeConfig, color_mode: ColorMode, json: bool) {
    if !json {
        for line in build_serve_check_lines(config) {
            println!("{line}");
        }
        return;
    }

    let base_url = format!(
        "{}://{}:{}",
        serve_scheme(config),
        display_host(config.bind.ip()),
        config.bind.port()
    );
    let auth_mode = if config.api_secret.is_some() {
        "bearer secret"
    } else {
        "none"
    };
    let tls_mode = match (config.tls_self_signed, serve_tls_enabled(config)) {
        (true, _) => "self-signed",
        (false, true) => "enabled",
        (false, false) => "disabled",
    };

    emit_json(
        json!({
            "check": {
                "status": "valid",
                "listen": config.bind.to_string(),
                "base_url": base_url,
                "about": format!("{base_url}/about"),
                "snapshot": config.snapshot,
                "data_dir": config.data_dir.display().to_string(),
                "db_name": config.db_name,
                "auth": auth_mode,
                "tls": tls_mode,
                "upstream": config.upstream,
                "cors_origins": config.cors_origins,
                "limits": {
                    "max_body_bytes": config.max_body_bytes,
                    "max_export_concurrency": config.max_export_concurrency
                }
            }
        }),
        color_mode,
    );
}

fn build_serve_check_lines(config: &serve::ServeConfig) -> Vec<String> {
    let auth = if config.api_secret.is_some() {
        "bearer secret"
    } else {
        "none"
    };
    let mut lines = vec![
        "Configuration valid.".to_string(),
        String::new(),
        format!(
            "  Bind:   {} ({})",
            config.bind,
            serve_scope(config.bind.ip())
        ),
        format!(
            "  Auth: {auth}    TLS: {}    Snapshot: {}    CORS: {}",
            tls_label(config),
            config.snapshot,
            cors_label(config)
        ),
        format!(
            "  Store:  {} (db: {})",
            config.data_dir.display(),
            config.db_name
        ),
        format!(
            "  Limits: body {}, export concurrency {}",
            format_bytes(config.max_body_bytes),
            config.max_export_concurrency
        ),
    ];
    if let Some(upstream) = config.upstream.as_deref() {
        lines.push(format!("  Upstream: {upstream}"));
    }
    lines.push(String::new());
    lines.push("Start with: bibserve serve".to_string());

    lines
}

fn emit_serve_init_human(result: &serve_init::ServeInitResult) {
    let (headline, files_heading) = if result.overwrote_existing {
        ("Secure serving re-initialized.", "Files overwritten:")
    } else {
        ("Secure serving initialized.", "Files created:")
    };

    println!("{headline}");
    println!("Clients on your network can now fetch references over HTTPS.");
    println!();
    println!("  {files_heading}");
    println!("    secret  {}", result.secret_file);
    println!("    cert    {}", result.tls_cert);
    println!("    key     {}", result.tls_key);
    println!();
    println!("  Fingerprint (share this with clients to verify the cert):");
    println!("    {}", result.tls_fingerprint);
    println!();
    println!("  Start serving references:");
    println!();
    for command in &result.server_commands {
        println!("    {command}");
    }
    println!();
    println!("  From another machine, fetch references by identifier:");
    println!();
    for command in &result.client_commands {
        println!("    {command}");
    }
    println!();
    println!("  Or with curl:");
    for command in &result.curl_client_commands {
        println!("    {command}");
    }
    println!();
    println!("  The secret is in the file, not printed here. Share the secret");
    println!("  and fingerprint with collaborators out-of-band. Clients use the");
    println!("  fingerprint to verify the cert on first connect.");
}

fn emit_env_parity_notices(service: &ServiceConfig, color_mode: ColorMode) {
    for name in &service.ignored_env {
        let mut details = Map::new();
        details.insert("variable".to_string(), json!(name));
        let notice = Notice {
            kind: "env_ignored".to_string(),
            time: notice_time_now().unwrap_or_else(|| "unknown".to_string()),
            cmd: "serve".to_string(),
            snapshot: service.snapshot.clone(),
            docid: None,
            message: format!("{name} is accepted for deployment parity and not used."),
            details,
        };
        emit_notice(&notice, color_mode);
    }
}

fn emit_doctor_human(report: &ValidationReport) {
    let label = doctor_display_label(report);
    if !io::stdout().is_terminal() {
        match report.status {
            ValidationStatus::Ok => {
                println!("OK: {label}");
            }
            ValidationStatus::Corrupt => {
                let issue = report
                    .issues
                    .first()
                    .map(|issue| format!(" issue={}", issue.message))
                    .unwrap_or_default();
                println!(
                    "CORRUPT: {label} records_checked={}{issue}",
                    report.records_checked
                );
            }
        }
        return;
    }

    match report.status {
        ValidationStatus::Ok => {
            println!("{label}: healthy");
            println!("  records:   {}", report.records_checked);
            println!("  checked:   manifest, envelopes, digests (0 issues)");
        }
        ValidationStatus::Corrupt => {
            let issue = report
                .issues
                .first()
                .map(|value| value.message.clone())
                .unwrap_or_else(|| "corruption detected".to_string());
            println!("{label}: corrupt");
            println!("  records:   {}", report.records_checked);
            println!(
                "  checked:   manifest, envelopes, digests ({} issues)",
                report.issues.len()
            );
            println!("  detail:    {issue}");
        }
    }
}

fn emit_doctor_human_summary(reports: &[ValidationReport]) {
    if reports.is_empty() {
        println!("No snapshots found.");
        return;
    }
    if !io::stdout().is_terminal() {
        for report in reports {
            emit_doctor_human(report);
        }
        return;
    }

    let corrupt = reports
        .iter()
        .filter(|report| report.status == ValidationStatus::Corrupt)
        .count();
    let labels = reports.iter().map(doctor_display_label).collect::<Vec<_>>();
    let record_labels = reports
        .iter()
        .map(|report| format!("{} records", report.records_checked))
        .collect::<Vec<_>>();
    let label_width = labels.iter().map(|value| value.len()).max().unwrap_or(0);
    let record_width = record_labels
        .iter()
        .map(|value| value.len())
        .max()
        .unwrap_or(0);
    if corrupt == 0 {
        println!("All {} snapshots healthy.", reports.len());
        println!();
        for idx in 0..reports.len() {
            println!(
                "  {:<label_width$}   {:<record_width$}   0 issues",
                labels[idx], record_labels[idx]
            );
        }
    } else {
        println!("{corrupt} of {} snapshots unhealthy.", reports.len());
        println!();
        for (idx, report) in reports.iter().enumerate() {
            let label = &labels[idx];
            let records = &record_labels[idx];
            if report.status == ValidationStatus::Corrupt {
                println!(
                    "  ✗ {label:<label_width$}   {records:<record_width$}   {} issues (run `bibserve doctor {label}` for detail)",
                    report.issues.len()
                );
            } else {
                println!("  ✓ {label:<label_width$}   {records:<record_width$}   0 issues");
            }
        }
    }
}

fn doctor_display_label(report: &ValidationReport) -> String {
    if let Some(snapshot) = report.snapshot.as_deref() {
        return snapshot.to_string();
    }
    report
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| report.path.display().to_string())
}

fn report_json(report: &ValidationReport) -> Value {
    let issues = report
        .issues
        .iter()
        .map(|issue| {
            json!({
                "code": issue.code,
                "message": issue.message,
                "docid": issue.docid,
                "path": issue.path.as_ref().map(|path| path.to_string_lossy()),
            })
        })
        .collect::<Vec<_>>();
    json!({
        "snapshot": report.snapshot,
        "path": report.path.to_string_lossy(),
        "status": match report.status {
            ValidationStatus::Ok => "ok",
            ValidationStatus::Corrupt => "corrupt",
        },
        "records_checked": report.records_checked,
        "issue_count": report.issue_count,
        "issues": issues,
        "remediation_hints": report.remediation_hints,
    })
}

fn emit_snapshot_list_table(statuses: &[SnapshotStatus]) {
    if statuses.is_empty() {
        println!("No snapshots found.");
        println!("Create one with `bibserve snapshot create <tag>` or ingest records.");
        return;
    }
    let rows = statuses
        .iter()
        .map(|status| {
            vec![
                status.snapshot.clone(),
                status.records.to_string(),
                format_timestamp_human(&status.created),
            ]
        })
        .collect::<Vec<_>>();
    emit_table(&["SNAPSHOT", "RECORDS", "CREATED"], &rows);
}

fn emit_search_table(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No matches.");
        return;
    }
    let rows = hits
        .iter()
        .map(|hit| {
            vec![
                hit.docid.clone(),
                hit.title.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect::<Vec<_>>();
    emit_table(&["DOCID", "TITLE"], &rows);
}

fn emit_record_output(
    envelope: &RecordEnvelope,
    format: RefFormat,
    color_mode: ColorMode,
) -> Result<(), Error> {
    match format {
        RefFormat::Relaton => {
            let value = serde_json::to_value(envelope).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode record")
                    .with_source(err)
            })?;
            emit_json(value, color_mode);
        }
        RefFormat::Bibxml => {
            let (item, _issues) = envelope.typed_item()?;
            let xml = reference_xml(&item, &envelope.docid)?;
            let use_color = color_mode.use_color(io::stdout().is_terminal());
            println!("{}", colorize_xml(&xml, use_color));
        }
    }
    Ok(())
}

fn emit_version_output(color_mode: ColorMode) {
    if io::stdout().is_terminal() {
        println!("bibserve {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(
            json!({
                "name": "bibserve",
                "version": env!("CARGO_PKG_VERSION"),
            }),
            color_mode,
        );
    }
}

fn emit_table(headers: &[&str], rows: &[Vec<String>]) {
    println!("{}", render_table(headers, rows));
}

/// Plain two-space aligned table. Control characters that would break the
/// grid are escaped; the last column is never right-padded.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let header_row: Vec<String> = headers.iter().map(|header| header.to_string()).collect();
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            (0..headers.len())
                .map(|idx| clean_cell(row.get(idx).map(String::as_str).unwrap_or("")))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = header_row.iter().map(|cell| cell.chars().count()).collect();
    for row in &body {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    std::iter::once(&header_row)
        .chain(body.iter())
        .map(|row| table_line(row, &widths))
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_cell(value: &str) -> String {
    value.replace('\n', "\\n").replace('\r', "\\r")
}

fn table_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::new();
    for (idx, width) in widths.iter().enumerate() {
        if idx > 0 {
            line.push_str("  ");
        }
        let cell = cells.get(idx).map(String::as_str).unwrap_or("");
        line.push_str(cell);
        if idx + 1 < widths.len() {
            for _ in cell.chars().count()..*width {
                line.push(' ');
            }
        }
    }
    line
}

fn format_bytes(value: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
    for (unit, suffix) in UNITS {
        if value < unit {
            continue;
        }
        if value.is_multiple_of(unit) {
            return format!("{}{suffix}", value / unit);
        }
        return format!("{:.1}{suffix}", value as f64 / unit as f64);
    }
    value.to_string()
}

fn format_timestamp_human(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let parsed =
        time::OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339);
    let Ok(parsed) = parsed else {
        return trimmed.to_string();
    };
    let parsed = parsed.to_offset(time::UtcOffset::UTC);
    let format = time::format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    let Ok(format) = format else {
        return trimmed.to_string();
    };
    parsed
        .format(&format)
        .unwrap_or_else(|_| trimmed.to_string())
}

// Pretty output (with or without color) for terminals, compact single-line
// JSON for pipes.
fn emit_json(value: serde_json::Value, color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    let use_color = color_mode.use_color(is_tty);
    let json = if is_tty || use_color {
        colorize_json(&value, use_color)
    } else {
        serde_json::to_string(&value)
            .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    };
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

impl AnsiColor {
    fn code(self) -> &'static str {
        match self {
            AnsiColor::Red => "31",
            AnsiColor::Yellow => "33",
        }
    }
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if enabled {
        format!("\u{1b}[{}m{label}\u{1b}[0m", color.code())
    } else {
        label.to_string()
    }
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err, color_mode.use_color(true)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> Option<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    time::OffsetDateTime::from_unix_timestamp_nanos(now.as_nanos() as i128)
        .ok()?
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    if io::stderr().is_terminal() {
        let label = colorize_label("notice:", color_mode.use_color(true), AnsiColor::Yellow);
        if notice.cmd == "ingest" {
            eprintln!("{label} {}", notice.message);
        } else {
            eprintln!("{label} {} (snapshot: {})", notice.message, notice.snapshot);
        }
        return;
    }

    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    match err.message() {
        Some(message) => message.to_string(),
        None => default_error_message(err.kind()).to_string(),
    }
}

fn default_error_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::AlreadyExists => "already exists",
        ErrorKind::Busy => "resource is busy",
        ErrorKind::Permission => "permission denied",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
        ErrorKind::Upstream => "upstream unavailable",
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    std::iter::successors(err.source(), |&source| source.source())
        .map(|source| source.to_string())
        .collect()
}

fn error_json(err: &Error) -> Value {
    let mut body = json!({
        "kind": err.kind().as_str(),
        "message": error_message(err),
    });
    if let Some(hint) = err.hint() {
        body["hint"] = json!(hint);
    }
    if let Some(path) = err.path() {
        body["path"] = json!(path.display().to_string());
    }
    if let Some(docid) = err.docid() {
        body["docid"] = json!(docid);
    }
    if let Some(snapshot) = err.snapshot() {
        body["snapshot"] = json!(snapshot);
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        body["causes"] = json!(causes);
    }
    json!({ "error": body })
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    let mut detail = |label: &str, value: String| {
        lines.push(format!(
            "{} {value}",
            colorize_label(label, use_color, AnsiColor::Yellow)
        ));
    };

    if let Some(hint) = err.hint() {
        detail("hint:", hint.to_string());
    }
    if let Some(path) = err.path() {
        detail("path:", path.display().to_string());
    }
    if let Some(docid) = err.docid() {
        detail("docid:", docid.to_string());
    }
    if let Some(snapshot) = err.snapshot() {
        detail("snapshot:", snapshot.to_string());
    }
    if let Some(cause) = error_causes(err).into_iter().next() {
        detail("caused by:", cause);
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{
        Error, ErrorKind, IngestFailure, IngestMode, ServeRunArgs, ServiceConfig,
        build_serve_check_lines, build_serve_startup_lines, doctor_display_label, error_json,
        error_text, format_bytes, format_timestamp_human, ingest_failure_message,
        reject_remote_only_flags_for_local_fetch, render_table, report_json, resolve_secret_value,
        serve_config_from_run_args,
    };
    use bibserve::api::{ValidationIssue, ValidationReport};
    use std::path::{Path, PathBuf};
    use tempfile::NamedTempFile;

    fn test_serve_config() -> super::serve::ServeConfig {
        super::serve::ServeConfig {
            bind: "127.0.0.1:9013".parse().expect("bind"),
            data_dir: PathBuf::from("/tmp/bibserve"),
            db_name: "bibxml".to_string(),
            snapshot: "head".to_string(),
            api_secret: None,
            service_name: "IETF BibXML service".to_string(),
            contact_email: None,
            user_agent: "test".to_string(),
            debug: false,
            upstream: None,
            upstream_secret: None,
            allow_non_loopback: false,
            insecure_no_tls: false,
            tls_cert: None,
            tls_key: None,
            tls_self_signed: false,
            max_body_bytes: 1024 * 1024,
            max_export_concurrency: 4,
            cors_origins: Vec::new(),
        }
    }

    fn test_run_args() -> ServeRunArgs {
        ServeRunArgs {
            bind: None,
            snapshot: None,
            cors_origin: Vec::new(),
            api_secret: None,
            api_secret_file: None,
            upstream: None,
            upstream_secret: None,
            upstream_secret_file: None,
            tls_cert: None,
            tls_key: None,
            tls_self_signed: false,
            allow_non_loopback: false,
            insecure_no_tls: false,
            max_body_bytes: super::DEFAULT_MAX_BODY_BYTES,
            max_export_concurrency: super::DEFAULT_MAX_EXPORT_CONCURRENCY,
        }
    }

    fn test_service_config() -> ServiceConfig {
        ServiceConfig::from_lookup(|_| None).expect("config")
    }

    #[test]
    fn serve_startup_banner_secure_mode_includes_client_flags() {
        let mut config = test_serve_config();
        config.api_secret = Some("secret".to_string());
        config.tls_self_signed = true;
        let text = build_serve_startup_lines(&config).join("\n");
        assert!(text.contains("Serving references on https://127.0.0.1:9013 (loopback only)"));
        assert!(text.contains("Auth: bearer    TLS: self-signed"));
        assert!(text.contains("--secret-file <secret-file> --tls-ca <tls-cert>"));
        assert!(text.contains("curl -k -sS -H \"Authorization: Bearer $SECRET\""));
    }

    #[test]
    fn serve_startup_banner_local_mode_stays_compact() {
        let config = test_serve_config();
        let text = build_serve_startup_lines(&config).join("\n");
        assert!(text.contains("Serving references on http://127.0.0.1:9013 (loopback only)"));
        assert!(text.contains("Auth: none    TLS: off    Snapshot: head    CORS: same-origin"));
        assert!(text.contains("Try it:"));
        assert!(text.contains("Press Ctrl-C to stop."));
    }

    #[test]
    fn serve_check_lines_show_store_and_limits() {
        let mut config = test_serve_config();
        config.upstream = Some("https://bib.example.org".to_string());
        let text = build_serve_check_lines(&config).join("\n");
        assert!(text.contains("Configuration valid."));
        assert!(text.contains("Bind:   127.0.0.1:9013 (loopback only)"));
        assert!(text.contains("Store:  /tmp/bibserve (db: bibxml)"));
        assert!(text.contains("Limits: body 1M, export concurrency 4"));
        assert!(text.contains("Upstream: https://bib.example.org"));
    }

    #[test]
    fn serve_config_merges_flags_over_environment() {
        let service = ServiceConfig::from_lookup(|name| match name {
            "HOST" => Some("127.0.0.1".to_string()),
            "PORT" => Some("9200".to_string()),
            "API_SECRET" => Some("env-secret".to_string()),
            "SNAPSHOT" => Some("env-tag".to_string()),
            _ => None,
        })
        .expect("config");

        let mut run = test_run_args();
        run.bind = Some("127.0.0.1:9500".to_string());
        run.snapshot = Some("flag-tag".to_string());
        let config = serve_config_from_run_args(run, &service).expect("config");
        assert_eq!(config.bind.port(), 9500);
        assert_eq!(config.snapshot, "flag-tag");
        assert_eq!(config.api_secret.as_deref(), Some("env-secret"));

        let config = serve_config_from_run_args(test_run_args(), &service).expect("config");
        assert_eq!(config.bind.port(), 9200);
        assert_eq!(config.snapshot, "env-tag");
    }

    #[test]
    fn serve_config_rejects_secret_flag_conflict() {
        let mut run = test_run_args();
        run.api_secret = Some("a".to_string());
        run.api_secret_file = Some(PathBuf::from("/tmp/secret"));
        let err = serve_config_from_run_args(run, &test_service_config()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn secret_file_trims_and_reads() {
        let mut file = NamedTempFile::new().expect("tempfile");
        std::io::Write::write_all(&mut file, b"  api-secret \n").expect("write");
        let secret =
            resolve_secret_value(None, Some(file.path().to_path_buf()), "--secret").expect("secret");
        assert_eq!(secret.as_deref(), Some("api-secret"));
    }

    #[test]
    fn secret_file_rejects_empty() {
        let mut file = NamedTempFile::new().expect("tempfile");
        std::io::Write::write_all(&mut file, b" \n").expect("write");
        let err = resolve_secret_value(None, Some(file.path().to_path_buf()), "--secret")
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn remote_only_flags_require_remote() {
        assert!(reject_remote_only_flags_for_local_fetch(None, None, None, false).is_ok());
        let err = reject_remote_only_flags_for_local_fetch(Some("secret"), None, None, false)
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = reject_remote_only_flags_for_local_fetch(
            None,
            None,
            Some(Path::new("/tmp/ca.pem")),
            false,
        )
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn format_bytes_boundaries() {
        assert_eq!(format_bytes(0), "0");
        assert_eq!(format_bytes(1023), "1023");
        assert_eq!(format_bytes(1024), "1K");
        assert_eq!(format_bytes(1536), "1.5K");
        assert_eq!(format_bytes(1024 * 1024), "1M");
    }

    #[test]
    fn format_timestamp_human_truncates_to_seconds() {
        assert_eq!(
            format_timestamp_human("2026-02-27T12:34:56.789Z"),
            "2026-02-27T12:34:56Z"
        );
        assert_eq!(format_timestamp_human(""), "-");
    }

    #[test]
    fn ingest_failure_messages_map_error_kinds() {
        let failure = |error_kind: &str, message: &str| IngestFailure {
            index: 1,
            mode: IngestMode::Jsonl,
            message: message.to_string(),
            error_kind: error_kind.to_string(),
            snippet: None,
            line: Some(1),
        };
        assert_eq!(
            ingest_failure_message(&failure("parse", "invalid json input")),
            "Skipped invalid JSON."
        );
        assert_eq!(
            ingest_failure_message(&failure("oversize", "record exceeds size limit")),
            "Skipped oversized record."
        );
        assert_eq!(
            ingest_failure_message(&failure(
                "already_exists",
                "record is immutable once stored for a snapshot"
            )),
            "Skipped record: record is immutable once stored for a snapshot."
        );
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::Usage)
            .with_message("bad input")
            .with_hint("Try `bibserve --help`.");
        let colored = error_text(&err, true);
        assert!(colored.contains("\u{1b}[31merror:\u{1b}[0m bad input"));
        assert!(colored.contains("\u{1b}[33mhint:\u{1b}[0m"));

        let plain = error_text(&err, false);
        assert!(plain.starts_with("error: bad input"));
        assert!(plain.contains("hint: Try `bibserve --help`."));
        assert!(!plain.contains("\u{1b}["));
    }

    #[test]
    fn error_json_uses_wire_kind_names() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("no such record")
            .with_docid("RFC.9999999")
            .with_snapshot("head");
        let value = error_json(&err);
        let inner = value.get("error").expect("error object");
        assert_eq!(inner.get("kind").and_then(|v| v.as_str()), Some("not_found"));
        assert_eq!(
            inner.get("docid").and_then(|v| v.as_str()),
            Some("RFC.9999999")
        );
        assert_eq!(inner.get("snapshot").and_then(|v| v.as_str()), Some("head"));
    }

    #[test]
    fn doctor_label_prefers_snapshot_tag() {
        let report = ValidationReport::ok(PathBuf::from("/tmp/db/test")).with_snapshot_tag("test");
        assert_eq!(doctor_display_label(&report), "test");
        let report = ValidationReport::ok(PathBuf::from("/tmp/db/orphan"));
        assert_eq!(doctor_display_label(&report), "orphan");
    }

    #[test]
    fn report_json_has_stable_shape() {
        let issue = ValidationIssue {
            code: "digest".to_string(),
            message: "record digest mismatch".to_string(),
            docid: Some("RFC.1234".to_string()),
            path: Some(PathBuf::from("/tmp/db/test/refs/RFC.1234.json")),
        };
        let report =
            ValidationReport::corrupt(PathBuf::from("/tmp/db/test"), issue).with_snapshot_tag("test");
        let value = report_json(&report);
        assert_eq!(value.get("snapshot").and_then(|v| v.as_str()), Some("test"));
        assert_eq!(value.get("status").and_then(|v| v.as_str()), Some("corrupt"));
        assert_eq!(value.get("issue_count").and_then(|v| v.as_u64()), Some(1));
        let issues = value
            .get("issues")
            .and_then(|v| v.as_array())
            .expect("issues");
        assert_eq!(issues[0].get("code").and_then(|v| v.as_str()), Some("digest"));
        assert_eq!(
            issues[0].get("docid").and_then(|v| v.as_str()),
            Some("RFC.1234")
        );
    }

    #[test]
    fn render_table_aligns_and_sanitizes_cells() {
        let output = render_table(
            &["SNAPSHOT", "RECORDS"],
            &[
                vec!["head".to_string(), "12".to_string()],
                vec!["test\nline".to_string(), "3".to_string()],
            ],
        );
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("SNAPSHOT"));
        assert!(lines[0].contains("  RECORDS"));
        assert!(lines[2].contains("test\\nline"));
        assert!(!lines[1].ends_with(' '));
    }
}
