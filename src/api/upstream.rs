//! Purpose: HTTP client for fetching reference records from an upstream bibserve node.
//! Exports: `UpstreamClient`, `DEFAULT_UPSTREAM_TIMEOUT`.
//! Role: Read-through source for the resolver; speaks the same v0 protocol this
//! service exposes, so nodes can be chained as mirrors.
//! Invariants: Upstream 404 responses are authoritative and map to NotFound.
//! Invariants: Transport failures and upstream server faults map to Upstream.
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};
use crate::core::record::RecordEnvelope;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use ureq::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use ureq::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use ureq::rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use url::Url;

type ApiResult<T> = Result<T, Error>;

/// Overall per-request deadline; the resolver layers its retry budget on top.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<UpstreamClientInner>,
}

#[derive(Clone)]
struct UpstreamClientInner {
    base_url: Url,
    secret: Option<String>,
    user_agent: String,
    timeout: Duration,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct RecordResponse {
    record: RecordEnvelope,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    path: Option<String>,
    docid: Option<String>,
    snapshot: Option<String>,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new()
            .timeout(DEFAULT_UPSTREAM_TIMEOUT)
            .build();
        Ok(Self {
            inner: Arc::new(UpstreamClientInner {
                base_url,
                secret: None,
                user_agent: default_user_agent(),
                timeout: DEFAULT_UPSTREAM_TIMEOUT,
                agent,
            }),
        })
    }

    // Builder setters clone the shared state only when another handle holds it.
    fn update(mut self, apply: impl FnOnce(&mut UpstreamClientInner)) -> Self {
        apply(Arc::make_mut(&mut self.inner));
        self
    }

    pub fn with_secret(self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.update(|inner| inner.secret = Some(secret))
    }

    pub fn with_user_agent(self, user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        self.update(|inner| inner.user_agent = user_agent)
    }

    /// Set the per-request deadline. Apply before any TLS option so the
    /// rebuilt agents inherit it.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        self.update(|inner| {
            inner.timeout = timeout;
            inner.agent = agent;
        })
    }

    pub fn with_tls_ca_file(self, path: impl AsRef<Path>) -> ApiResult<Self> {
        install_tls_provider();
        let roots = load_trust_roots(path.as_ref())?;
        let tls = ureq::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(self.with_tls_config(tls))
    }

    pub fn with_tls_skip_verify(self) -> Self {
        install_tls_provider();
        let tls = ureq::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();
        self.with_tls_config(tls)
    }

    fn with_tls_config(self, tls: ureq::rustls::ClientConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(self.inner.timeout)
            .tls_config(Arc::new(tls))
            .build();
        self.update(|inner| inner.agent = agent)
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Fetch one record from the upstream's active snapshot. The caller
    /// re-envelopes the result under its own snapshot tag before storing.
    pub fn fetch_record(&self, docid: &str) -> ApiResult<RecordEnvelope> {
        let url = build_url(&self.inner.base_url, &["v0", "refs", docid])?;
        let envelope: RecordResponse = self
            .request_json(&url)
            .map_err(|err| err.with_docid(docid))?;
        Ok(envelope.record)
    }

    /// Liveness probe against the upstream's unauthenticated health route.
    pub fn check(&self) -> ApiResult<()> {
        let url = build_url(&self.inner.base_url, &["healthz"])?;
        let _value: serde_json::Value = self.request_json(&url)?;
        Ok(())
    }

    fn request_json<R: DeserializeOwned>(&self, url: &Url) -> ApiResult<R> {
        let mut request = self
            .inner
            .agent
            .request("GET", url.as_str())
            .set("User-Agent", &self.inner.user_agent)
            .set("Accept", "application/json");
        if let Some(secret) = &self.inner.secret {
            request = request.set("Authorization", &format!("Bearer {secret}"));
        }
        match request.call() {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Upstream)
                .with_message("upstream request failed")
                .with_source(err)),
        }
    }
}

/// Disables server certificate checks for `--insecure`. Only reachable
/// through an explicit opt-in flag.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ureq::rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn install_tls_provider() {
    let _ = ureq::rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn load_trust_roots(path: &Path) -> ApiResult<ureq::rustls::RootCertStore> {
    let pem = std::fs::read(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("failed to read TLS CA/certificate file")
            .with_path(path)
            .with_source(err)
    })?;
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("failed to parse TLS CA/certificate file")
                .with_path(path)
                .with_source(err)
        })?;

    let mut roots = ureq::rustls::RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("TLS CA/certificate file contains no usable certificates")
            .with_path(path));
    }
    Ok(roots)
}

fn default_user_agent() -> String {
    concat!("bibserve/", env!("CARGO_PKG_VERSION")).to_string()
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid upstream base url")
            .with_source(err)
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("upstream base url must use http or https scheme"));
    }
    if !matches!(url.path(), "" | "/") {
        return Err(
            Error::new(ErrorKind::Usage).with_message("upstream base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("upstream base url cannot be a base"))?
        .clear()
        .extend(segments);
    Ok(url)
}

fn read_json_response<R: DeserializeOwned>(response: ureq::Response) -> ApiResult<R> {
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Upstream)
            .with_message("failed to read upstream response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Upstream)
            .with_message("invalid upstream response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => error_from_remote(envelope.error),
        Err(_) => Error::new(error_kind_from_status(status))
            .with_message(format!("upstream error status {status}")),
    }
}

fn error_from_remote(remote: RemoteError) -> Error {
    let RemoteError {
        kind,
        message,
        hint,
        path,
        docid,
        snapshot,
    } = remote;
    let mut err = Error::new(parse_error_kind(&kind));
    if let Some(message) = message {
        err = err.with_message(message);
    }
    if let Some(hint) = hint {
        err = err.with_hint(hint);
    }
    if let Some(path) = path {
        err = err.with_path(path);
    }
    if let Some(docid) = docid {
        err = err.with_docid(docid);
    }
    if let Some(snapshot) = snapshot {
        err = err.with_snapshot(snapshot);
    }
    err
}

/// Caller-fault kinds pass through; anything server-side is an upstream
/// failure from this node's point of view.
fn parse_error_kind(kind: &str) -> ErrorKind {
    match kind {
        "usage" => ErrorKind::Usage,
        "not_found" => ErrorKind::NotFound,
        "already_exists" => ErrorKind::AlreadyExists,
        "busy" => ErrorKind::Busy,
        "permission" => ErrorKind::Permission,
        _ => ErrorKind::Upstream,
    }
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        423 => ErrorKind::Busy,
        _ => ErrorKind::Upstream,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        UpstreamClient, build_url, error_kind_from_status, normalize_base_url, parse_error_kind,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn normalize_base_url_strips_path() {
        let url = normalize_base_url("http://localhost:8080".to_string()).expect("url");
        assert_eq!(url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn normalize_base_url_rejects_other_schemes() {
        let err = normalize_base_url("ftp://localhost:8080".to_string()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn normalize_base_url_rejects_embedded_path() {
        let err = normalize_base_url("http://localhost:8080/v0".to_string()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn build_url_encodes_slash_in_docids() {
        let base = url::Url::parse("http://localhost:8080/").expect("url");
        let url = build_url(&base, &["v0", "refs", "ANSI/IEEE.802-1985"]).expect("url");
        assert_eq!(url.path(), "/v0/refs/ANSI%2FIEEE.802-1985");
    }

    #[test]
    fn parse_error_kind_passes_caller_faults_through() {
        assert_eq!(parse_error_kind("usage"), ErrorKind::Usage);
        assert_eq!(parse_error_kind("not_found"), ErrorKind::NotFound);
        assert_eq!(parse_error_kind("permission"), ErrorKind::Permission);
        assert_eq!(parse_error_kind("busy"), ErrorKind::Busy);
    }

    #[test]
    fn parse_error_kind_maps_server_faults_to_upstream() {
        assert_eq!(parse_error_kind("internal"), ErrorKind::Upstream);
        assert_eq!(parse_error_kind("corrupt"), ErrorKind::Upstream);
        assert_eq!(parse_error_kind("io"), ErrorKind::Upstream);
        assert_eq!(parse_error_kind("no-such-kind"), ErrorKind::Upstream);
    }

    #[test]
    fn error_kind_from_status_treats_5xx_as_upstream() {
        assert_eq!(error_kind_from_status(404), ErrorKind::NotFound);
        assert_eq!(error_kind_from_status(401), ErrorKind::Permission);
        assert_eq!(error_kind_from_status(500), ErrorKind::Upstream);
        assert_eq!(error_kind_from_status(503), ErrorKind::Upstream);
    }

    #[test]
    fn client_normalizes_base_url() {
        let client = UpstreamClient::new("http://localhost:9999").expect("client");
        assert_eq!(client.base_url().as_str(), "http://localhost:9999/");
    }
}
