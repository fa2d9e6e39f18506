//! Purpose: Provide the HTTP/JSON gateway for the bibliographic service.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum-based server exposing reference lookup, search, and snapshot export.
//! Invariants: Authorization is checked before any request field is validated.
//! Invariants: Loopback-only unless explicitly allowed; error kinds remain stable.
//! Notes: Snapshot export streams JSONL; lookups resolve against one active snapshot.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rcgen::{Certificate, CertificateParams, SanType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use bibserve::api::{
    Catalog, DEFAULT_UPSTREAM_TIMEOUT, Error, ErrorKind, Resolver, SearchCache, SearchQuery,
    UpstreamClient, clamp_limit, ensure_snapshot_tag, reference_xml, search_cached,
};

const API_VERSION_HEADER: &str = "x-bibserve-api-version";
const API_VERSION: &str = "v0";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub db_name: String,
    pub snapshot: String,
    pub api_secret: Option<String>,
    pub service_name: String,
    pub contact_email: Option<String>,
    pub user_agent: String,
    pub debug: bool,
    pub upstream: Option<String>,
    pub upstream_secret: Option<String>,
    pub allow_non_loopback: bool,
    pub insecure_no_tls: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_self_signed: bool,
    pub max_body_bytes: u64,
    pub max_export_concurrency: usize,
    pub cors_origins: Vec<String>,
}

struct AppState {
    resolver: Resolver,
    search_cache: SearchCache,
    api_secret: Option<String>,
    service_name: String,
    contact_email: Option<String>,
    debug: bool,
    export_semaphore: Arc<Semaphore>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing(config.debug);

    if !is_loopback(config.bind.ip()) && config.api_secret.is_none() {
        tracing::warn!("serving without an API secret on a non-loopback address");
    }

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let catalog = Catalog::new()
        .with_data_dir(config.data_dir.clone())
        .with_db_name(config.db_name.clone());
    let store = catalog.store()?;
    let mut resolver = Resolver::new(store, config.snapshot.clone());
    if let Some(upstream) = config.upstream.as_deref() {
        let mut client = UpstreamClient::new(upstream)?
            .with_user_agent(config.user_agent.clone())
            .with_timeout(DEFAULT_UPSTREAM_TIMEOUT);
        if let Some(secret) = config.upstream_secret.clone() {
            client = client.with_secret(secret);
        }
        resolver = resolver.with_source(Arc::new(client));
    }

    let state = Arc::new(AppState {
        resolver,
        search_cache: SearchCache::default(),
        api_secret: config.api_secret.clone(),
        service_name: config.service_name.clone(),
        contact_email: config.contact_email.clone(),
        debug: config.debug,
        export_semaphore: Arc::new(Semaphore::new(config.max_export_concurrency)),
    });

    let cors = build_cors(&config.cors_origins)?;
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/about", get(about))
        .route("/v0/refs/*docid", get(get_reference))
        .route("/v0/search", get(search_get).post(search_post))
        .route("/v0/snapshots", get(list_snapshots))
        .route("/v0/snapshots/:tag/export", get(export_snapshot))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let tls_acceptor = build_tls_acceptor(&config)?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    if let Ok(local_addr) = listener.local_addr() {
        let scheme = if tls_acceptor.is_some() {
            "https"
        } else {
            "http"
        };
        tracing::info!(
            "listening on {scheme}://{local_addr} (snapshot {})",
            config.snapshot
        );
    }

    match tls_acceptor {
        Some(acceptor) => serve_with_tls(listener, app, acceptor).await,
        None => serve_plain(listener, app).await,
    }
}

async fn serve_plain(listener: tokio::net::TcpListener, app: Router) -> Result<(), Error> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

async fn serve_with_tls(
    listener: tokio::net::TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
) -> Result<(), Error> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    tracing::debug!("TLS handshake with {peer} failed: {err}");
                    return;
                }
            };
            let served = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await;
            if let Err(err) = served {
                tracing::debug!("connection from {peer} ended with error: {err}");
            }
        });
    }
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    let is_loopback_bind = is_loopback(config.bind.ip());
    if !is_loopback_bind && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    ensure_snapshot_tag(&config.snapshot)?;

    if let Some(secret) = config.api_secret.as_deref()
        && secret.trim().is_empty()
    {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("API secret must not be blank")
            .with_hint("Unset API_SECRET to disable auth or provide a real value."));
    }

    if config.tls_cert.is_some() != config.tls_key.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("TLS requires both --tls-cert and --tls-key")
            .with_hint("Provide both paths or use --tls-self-signed."));
    }

    if config.tls_self_signed && config.tls_cert.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--tls-self-signed conflicts with --tls-cert/--tls-key")
            .with_hint("Pick one TLS source."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if config.max_export_concurrency == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-export-concurrency must be greater than zero")
            .with_hint("Use a positive value like 4."));
    }

    if !is_loopback_bind
        && config.api_secret.is_some()
        && !config.insecure_no_tls
        && !tls_is_configured(config)
    {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback service with an API secret requires TLS")
            .with_hint("Use --tls-cert/--tls-key, --tls-self-signed, or --insecure-no-tls."));
    }

    Ok(())
}

fn tls_is_configured(config: &ServeConfig) -> bool {
    config.tls_self_signed || (config.tls_cert.is_some() && config.tls_key.is_some())
}

/// Runs the same validation `serve` performs, including CORS parsing and TLS
/// material loading, without binding sockets. Backs `serve check`.
pub fn preflight(config: &ServeConfig) -> Result<(), Error> {
    validate_config(config)?;
    build_cors(&config.cors_origins)?;
    build_tls_acceptor(config)?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_env("BIBSERVE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn build_cors(origins: &[String]) -> Result<CorsLayer, Error> {
    if origins.is_empty() {
        return Ok(CorsLayer::new());
    }
    if origins.iter().any(|origin| origin == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    let mut values = Vec::with_capacity(origins.len());
    for origin in origins {
        let value = origin.parse::<HeaderValue>().map_err(|_| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid CORS origin: {origin}"))
                .with_hint("Use full origins like https://example.org, or *.")
        })?;
        values.push(value);
    }
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(values))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

fn build_tls_acceptor(config: &ServeConfig) -> Result<Option<TlsAcceptor>, Error> {
    let identity = if config.tls_self_signed {
        Some(self_signed_identity(config.bind.ip())?)
    } else if let (Some(cert), Some(key)) = (config.tls_cert.as_deref(), config.tls_key.as_deref())
    {
        Some(load_tls_identity(cert, key)?)
    } else {
        None
    };
    let Some((certs, key)) = identity else {
        return Ok(None);
    };

    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
    let mut tls_config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("TLS certificate and key do not form a usable identity")
                .with_source(err)
        })?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

fn load_tls_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let cert_pem = std::fs::read(cert_path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read TLS certificate")
            .with_path(cert_path)
            .with_source(err)
    })?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("failed to parse TLS certificate")
                .with_path(cert_path)
                .with_source(err)
        })?;
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("TLS certificate file contains no certificates")
            .with_path(cert_path));
    }
    let key_pem = std::fs::read(key_path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read TLS key")
            .with_path(key_path)
            .with_source(err)
    })?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("failed to parse TLS key")
                .with_path(key_path)
                .with_source(err)
        })?
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("TLS key file contains no private key")
                .with_path(key_path)
        })?;
    Ok((certs, key))
}

fn self_signed_identity(
    bind_ip: IpAddr,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    if !bind_ip.is_unspecified() {
        params.subject_alt_names.push(SanType::IpAddress(bind_ip));
    }
    let cert = Certificate::from_params(params).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to generate self-signed certificate")
            .with_source(err)
    })?;
    let cert_der = cert.serialize_der().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode self-signed certificate")
            .with_source(err)
    })?;
    let key_der = cert.serialize_private_key_der();
    Ok((
        vec![CertificateDer::from(cert_der)],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
    ))
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(secret) = state.api_secret.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing api secret"));
    };
    let value = value.to_str().unwrap_or_default();
    let expected = format!("Bearer {secret}");
    if value != expected {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid api secret"));
    }
    Ok(())
}

async fn run_blocking<T, F>(task: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(err) => Err(Error::new(ErrorKind::Internal)
            .with_message("blocking task failed")
            .with_source(err)),
    }
}

#[derive(Debug, Deserialize)]
struct StructSearchRequest {
    query: serde_json::Value,
    limit: Option<usize>,
}

async fn healthz() -> Response {
    json_response(json!({ "status": "ok" }))
}

async fn about(State(state): State<Arc<AppState>>) -> Response {
    json_response(json!({
        "service": state.service_name,
        "contact": state.contact_email,
        "version": env!("CARGO_PKG_VERSION"),
        "snapshot": state.resolver.snapshot(),
    }))
}

async fn get_reference(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(docid): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err, state.debug);
    }
    let want_xml = match params.get("format").map(String::as_str) {
        None | Some("relaton") => false,
        Some("bibxml") => true,
        Some(other) => {
            return error_response(
                Error::new(ErrorKind::Usage)
                    .with_message(format!("unknown format: {other}"))
                    .with_hint("Use format=relaton or format=bibxml."),
                state.debug,
            );
        }
    };

    let blocking = state.clone();
    let requested = docid.clone();
    let envelope = match run_blocking(move || blocking.resolver.resolve(&requested)).await {
        Ok(envelope) => envelope,
        Err(err) => return error_response(err, state.debug),
    };

    if !want_xml {
        return json_response(json!({ "record": envelope }));
    }
    if let Some(xml) = envelope.xml {
        return xml_response(xml);
    }
    let rendered = envelope
        .typed_item()
        .and_then(|(item, _issues)| reference_xml(&item, &docid));
    match rendered {
        Ok(xml) => xml_response(xml),
        Err(err) => error_response(err, state.debug),
    }
}

async fn search_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err, state.debug);
    }
    let query = match params.get("q").map(|q| q.trim()) {
        Some(q) if !q.is_empty() => SearchQuery::DocId(q.to_string()),
        _ => {
            return error_response(
                Error::new(ErrorKind::Usage)
                    .with_message("missing query parameter: q")
                    .with_hint("Pass ?q=<identifier fragment> or POST a JSON query."),
                state.debug,
            );
        }
    };
    let limit = match params.get("limit") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(value) => Some(value),
            Err(_) => {
                return error_response(
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("invalid limit: {raw}"))
                        .with_hint("Use a positive integer."),
                    state.debug,
                );
            }
        },
        None => None,
    };
    run_search(state, query, limit).await
}

async fn search_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<StructSearchRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err, state.debug);
    }
    run_search(state, SearchQuery::Struct(payload.query), payload.limit).await
}

async fn run_search(state: Arc<AppState>, query: SearchQuery, limit: Option<usize>) -> Response {
    let limit = clamp_limit(limit);
    let blocking = state.clone();
    let result = run_blocking(move || {
        search_cached(
            blocking.resolver.store(),
            &blocking.search_cache,
            blocking.resolver.snapshot(),
            &query,
            limit,
        )
    })
    .await;
    match result {
        Ok((hits, cached)) => json_response(json!({ "hits": hits, "cached": cached })),
        Err(err) => error_response(err, state.debug),
    }
}

async fn list_snapshots(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err, state.debug);
    }
    let blocking = state.clone();
    match run_blocking(move || blocking.resolver.store().list_snapshots()).await {
        Ok(snapshots) => json_response(json!({ "snapshots": snapshots })),
        Err(err) => error_response(err, state.debug),
    }
}

async fn export_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(tag): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err, state.debug);
    }
    if let Err(err) = ensure_snapshot_tag(&tag) {
        return error_response(err, state.debug);
    }
    let permit = match state.export_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return error_response(
                Error::new(ErrorKind::Busy)
                    .with_message("too many concurrent export requests")
                    .with_hint("Try again later or raise --max-export-concurrency."),
                state.debug,
            );
        }
    };

    // Existence is checked before streaming so a missing tag is a clean 404
    // instead of an error mid-stream.
    let check_state = state.clone();
    let check_tag = tag.clone();
    let exists = run_blocking(move || Ok(check_state.resolver.store().snapshot_exists(&check_tag)));
    match exists.await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                Error::new(ErrorKind::NotFound)
                    .with_message("snapshot not found")
                    .with_snapshot(&tag)
                    .with_hint("List available snapshots at /v0/snapshots."),
                state.debug,
            );
        }
        Err(err) => return error_response(err, state.debug),
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(16);
    let stream_state = state.clone();
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let result = stream_state.resolver.store().scan(&tag).and_then(|scan| {
            for record in scan {
                let envelope = record?;
                let line = match serde_json::to_vec(&envelope) {
                    Ok(mut bytes) => {
                        bytes.push(b'\n');
                        bytes
                    }
                    Err(err) => {
                        return Err(Error::new(ErrorKind::Internal)
                            .with_message("failed to encode record")
                            .with_source(err));
                    }
                };
                if tx.blocking_send(Ok(Bytes::from(line))).is_err() {
                    break;
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            let _ = tx.blocking_send(Err(err));
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|result| result.map_err(|err| std::io::Error::other(err.to_string())));

    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/jsonl"));
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    docid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

fn xml_response(xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

fn error_response(err: Error, debug: bool) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Permission => {
            if is_access_forbidden(&err) {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::UNAUTHORIZED
            }
        }
        ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response_with_status(err, status, debug)
}

fn error_response_with_status(err: Error, status: StatusCode, debug: bool) -> Response {
    // Server-side paths and source chains stay out of responses unless the
    // operator opted into debug output.
    let path = if debug {
        err.path().map(|path| path.to_string_lossy().to_string())
    } else {
        None
    };
    let detail = if debug { source_chain(&err) } else { None };
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: err.kind().as_str().to_string(),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(|hint| hint.to_string()),
            docid: err.docid().map(|docid| docid.to_string()),
            snapshot: err.snapshot().map(|snapshot| snapshot.to_string()),
            path,
            detail,
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

fn source_chain(err: &Error) -> Option<String> {
    let mut parts = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(": "))
    }
}

fn is_access_forbidden(err: &Error) -> bool {
    err.message()
        .is_some_and(|message| message.starts_with("forbidden:"))
}

#[cfg(test)]
mod tests {
    use super::{
        AppState, Arc, ErrorKind, SearchCache, Semaphore, ServeConfig, StatusCode, authorize,
        error_response, json_response, serve, validate_config,
    };
    use axum::http::{HeaderMap, HeaderValue};
    use bibserve::api::{Error, Resolver, Store};
    use serde_json::json;
    use std::path::Path;

    fn local_config(temp: &Path) -> ServeConfig {
        ServeConfig {
            bind: "127.0.0.1:0".parse().expect("bind"),
            data_dir: temp.to_path_buf(),
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

    fn test_state(secret: Option<&str>, temp: &Path) -> AppState {
        let store = Store::open(temp.join("db")).expect("store");
        AppState {
            resolver: Resolver::new(store, "head"),
            search_cache: SearchCache::default(),
            api_secret: secret.map(str::to_string),
            service_name: "IETF BibXML service".to_string(),
            contact_email: None,
            debug: false,
            export_semaphore: Arc::new(Semaphore::new(4)),
        }
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.bind = "0.0.0.0:0".parse().expect("bind");
        let err = serve(config).await.expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_requires_allow_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.bind = "0.0.0.0:0".parse().expect("bind");
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_without_secret_is_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.bind = "0.0.0.0:0".parse().expect("bind");
        config.allow_non_loopback = true;
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn non_loopback_secret_requires_tls_or_insecure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.bind = "0.0.0.0:0".parse().expect("bind");
        config.allow_non_loopback = true;
        config.api_secret = Some("dev".to_string());
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);

        config.insecure_no_tls = true;
        validate_config(&config).expect("config ok with explicit opt-out");
    }

    #[test]
    fn tls_cert_requires_matching_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.tls_cert = Some(temp.path().join("cert.pem"));
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn blank_api_secret_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.api_secret = Some("   ".to_string());
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn snapshot_tag_is_validated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.snapshot = "bad/tag".to_string();
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn safety_limits_require_positive_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(temp.path());
        config.max_body_bytes = 0;
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let mut config = local_config(temp.path());
        config.max_export_concurrency = 0;
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn authorize_checks_the_shared_secret() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(Some("s3cret"), temp.path());

        let err = authorize(&HeaderMap::new(), &state).expect_err("missing header");
        assert_eq!(err.kind(), ErrorKind::Permission);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        let err = authorize(&headers, &state).expect_err("wrong secret");
        assert_eq!(err.kind(), ErrorKind::Permission);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s3cret"),
        );
        authorize(&headers, &state).expect("correct secret");
    }

    #[test]
    fn authorize_is_open_without_a_secret() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(None, temp.path());
        authorize(&HeaderMap::new(), &state).expect("open access");
    }

    #[test]
    fn upstream_failures_surface_as_bad_gateway() {
        let response = error_response(
            Error::new(ErrorKind::Upstream).with_message("fetch failed"),
            false,
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn permission_failures_surface_as_unauthorized() {
        let response = error_response(
            Error::new(ErrorKind::Permission).with_message("invalid api secret"),
            false,
        );
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn forbidden_prefix_maps_to_forbidden_status() {
        let response = error_response(
            Error::new(ErrorKind::Permission).with_message("forbidden: scoped token"),
            false,
        );
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn busy_exports_surface_as_locked() {
        let response = error_response(
            Error::new(ErrorKind::Busy).with_message("too many concurrent export requests"),
            false,
        );
        assert_eq!(response.status(), StatusCode::LOCKED);
    }

    #[test]
    fn responses_carry_the_api_version_header() {
        let response = json_response(json!({ "status": "ok" }));
        let header = response
            .headers()
            .get("x-bibserve-api-version")
            .and_then(|value| value.to_str().ok());
        assert_eq!(header, Some("v0"));
    }
}
