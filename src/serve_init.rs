//! Purpose: Generate secure bootstrap artifacts for `bibserve serve init`.
//! Exports: `ServeInitConfig`, `ServeInitResult`, `init`.
//! Role: Pure-ish orchestration for path resolution, artifact generation, and safe writes.
//! Invariants: Secret values are never printed; only paths and commands are returned.
//! Invariants: Existing files are never overwritten unless `force` is set.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use getrandom::fill as fill_random;
use rcgen::{Certificate, CertificateParams, SanType};
use sha2::{Digest, Sha256};

use bibserve::api::{Error, ErrorKind};

#[derive(Debug)]
pub struct ServeInitConfig {
    pub output_dir: PathBuf,
    pub secret_file: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub bind: SocketAddr,
    pub force: bool,
}

#[derive(Debug)]
pub struct ServeInitResult {
    pub secret_file: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub tls_fingerprint: String,
    pub server_commands: Vec<String>,
    pub client_commands: Vec<String>,
    pub curl_client_commands: Vec<String>,
    pub overwrote_existing: bool,
}

struct Artifacts {
    secret_file: PathBuf,
    tls_cert: PathBuf,
    tls_key: PathBuf,
}

impl Artifacts {
    fn resolve(config: &ServeInitConfig) -> Result<Self, Error> {
        let output_dir = absolutize(&config.output_dir)?;
        let anchor = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                output_dir.join(path)
            }
        };
        let artifacts = Self {
            secret_file: anchor(&config.secret_file),
            tls_cert: anchor(&config.tls_cert),
            tls_key: anchor(&config.tls_key),
        };
        artifacts.ensure_distinct()?;
        Ok(artifacts)
    }

    fn all(&self) -> [&PathBuf; 3] {
        [&self.secret_file, &self.tls_cert, &self.tls_key]
    }

    fn ensure_distinct(&self) -> Result<(), Error> {
        let paths = self.all();
        for (idx, path) in paths.iter().enumerate() {
            if paths[..idx].contains(path) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("serve init requires distinct artifact paths")
                    .with_path(path)
                    .with_hint(
                        "Use different values for --api-secret-file, --tls-cert, and --tls-key.",
                    ));
            }
        }
        Ok(())
    }

    fn count_existing(&self) -> usize {
        self.all().iter().filter(|path| path.exists()).count()
    }
}

pub fn init(config: ServeInitConfig) -> Result<ServeInitResult, Error> {
    let artifacts = Artifacts::resolve(&config)?;
    let existing_count = artifacts.count_existing();

    if !config.force {
        for path in artifacts.all() {
            if path.exists() {
                return Err(Error::new(ErrorKind::AlreadyExists)
                    .with_message("serve init artifact already exists")
                    .with_path(path)
                    .with_hint("Re-run with --force to overwrite or choose different paths."));
            }
        }
    }

    for path in artifacts.all() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to create artifact directory")
                    .with_path(parent)
                    .with_source(err)
            })?;
        }
    }

    let secret = generate_secret()?;
    write_artifact(
        &artifacts.secret_file,
        format!("{secret}\n"),
        "failed to write API secret file",
    )?;
    restrict_permissions(&artifacts.secret_file)?;

    let identity = self_signed_identity(config.bind.ip())?;
    write_artifact(
        &artifacts.tls_cert,
        identity.cert_pem,
        "failed to write TLS certificate",
    )?;
    write_artifact(
        &artifacts.tls_key,
        identity.key_pem,
        "failed to write TLS key",
    )?;
    restrict_permissions(&artifacts.tls_key)?;

    let secret_display = artifacts.secret_file.display().to_string();
    let cert_display = artifacts.tls_cert.display().to_string();
    let key_display = artifacts.tls_key.display().to_string();
    let bind = config.bind.to_string();
    let serve_cmd = format!(
        "bibserve serve --bind {bind} --allow-non-loopback --api-secret-file {} --tls-cert {} --tls-key {}",
        quote_for_shell(&secret_display),
        quote_for_shell(&cert_display),
        quote_for_shell(&key_display),
    );
    let base_url = format!(
        "https://{}:{}",
        display_host(config.bind.ip()),
        config.bind.port()
    );
    let fetch_cmd = format!(
        "bibserve fetch RFC.1234 --remote {} --secret-file {} --tls-ca {}",
        quote_for_shell(&base_url),
        quote_for_shell(&secret_display),
        quote_for_shell(&cert_display),
    );
    let ref_cmd = format!(
        "curl -k -sS -H 'Authorization: Bearer <secret>' {}",
        quote_for_shell(&format!("{base_url}/v0/refs/RFC.1234")),
    );
    let export_cmd = format!(
        "curl -k -N -sS -H 'Authorization: Bearer <secret>' {}",
        quote_for_shell(&format!("{base_url}/v0/snapshots/head/export")),
    );

    Ok(ServeInitResult {
        secret_file: secret_display,
        tls_cert: cert_display,
        tls_key: key_display,
        tls_fingerprint: fingerprint(&identity.cert_der),
        server_commands: vec![serve_cmd],
        client_commands: vec![fetch_cmd],
        curl_client_commands: vec![ref_cmd, export_cmd],
        overwrote_existing: config.force && existing_count > 0,
    })
}

fn write_artifact(path: &Path, contents: String, what: &str) -> Result<(), Error> {
    std::fs::write(path, contents).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(what)
            .with_path(path)
            .with_source(err)
    })
}

fn absolutize(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read current directory")
            .with_source(err)
    })?;
    Ok(cwd.join(path))
}

fn generate_secret() -> Result<String, Error> {
    let mut bytes = [0u8; 32];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate random secret: {err}"))
    })?;
    Ok(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to restrict artifact permissions")
            .with_path(path)
            .with_source(err)
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

struct TlsIdentity {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
}

/// Certificate for localhost plus the bound address, so the generated
/// artifacts work unmodified for both local and LAN deployments.
fn self_signed_identity(bind_ip: IpAddr) -> Result<TlsIdentity, Error> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    let mut sans = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ];
    if !bind_ip.is_unspecified() && !sans.contains(&bind_ip) {
        sans.push(bind_ip);
    }
    params
        .subject_alt_names
        .extend(sans.into_iter().map(SanType::IpAddress));

    let cert = Certificate::from_params(params).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to generate self-signed certificate")
            .with_source(err)
    })?;
    let cert_der = cert.serialize_der().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode certificate as DER")
            .with_source(err)
    })?;
    let cert_pem = cert.serialize_pem().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode certificate as PEM")
            .with_source(err)
    })?;
    Ok(TlsIdentity {
        cert_pem,
        key_pem: cert.serialize_private_key_pem(),
        cert_der,
    })
}

fn fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let hex: Vec<String> = digest.iter().map(|byte| format!("{byte:02X}")).collect();
    format!("SHA256:{}", hex.join(":"))
}

fn quote_for_shell(value: &str) -> String {
    let plain = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '-' | '.' | ':' | '='));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\"'\"'"))
    }
}

fn display_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => "127.0.0.1".to_string(),
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) if v6.is_unspecified() => "[::1]".to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::{ServeInitConfig, fingerprint, init, quote_for_shell};

    fn config(dir: &std::path::Path) -> ServeInitConfig {
        ServeInitConfig {
            output_dir: dir.to_path_buf(),
            secret_file: "api-secret.txt".into(),
            tls_cert: "serve-cert.pem".into(),
            tls_key: "serve-key.pem".into(),
            bind: "127.0.0.1:9013".parse().expect("addr"),
            force: false,
        }
    }

    #[test]
    fn init_writes_three_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = init(config(temp.path())).expect("init");

        assert!(temp.path().join("api-secret.txt").is_file());
        assert!(temp.path().join("serve-cert.pem").is_file());
        assert!(temp.path().join("serve-key.pem").is_file());
        assert!(result.tls_fingerprint.starts_with("SHA256:"));
        assert!(!result.overwrote_existing);

        let secret = std::fs::read_to_string(temp.path().join("api-secret.txt")).expect("read");
        assert_eq!(secret.trim().len(), 64);
        assert!(secret.trim().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init(config(temp.path())).expect("first init");

        let err = init(config(temp.path())).expect_err("second init");
        assert_eq!(err.kind(), bibserve::api::ErrorKind::AlreadyExists);

        let mut forced = config(temp.path());
        forced.force = true;
        let result = init(forced).expect("forced init");
        assert!(result.overwrote_existing);
    }

    #[test]
    fn init_rejects_colliding_artifact_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(temp.path());
        cfg.tls_key = cfg.tls_cert.clone();
        let err = init(cfg).expect_err("collision");
        assert_eq!(err.kind(), bibserve::api::ErrorKind::Usage);
    }

    #[test]
    fn shell_quoting_wraps_special_characters() {
        assert_eq!(quote_for_shell("/tmp/plain-path.pem"), "/tmp/plain-path.pem");
        assert_eq!(quote_for_shell("a b"), "'a b'");
        assert_eq!(quote_for_shell("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn fingerprint_is_colon_separated_sha256() {
        let printed = fingerprint(b"example");
        assert!(printed.starts_with("SHA256:"));
        assert_eq!(printed.matches(':').count(), 32);
    }
}
