//! Purpose: Interpret the deployment environment contract for the service.
//! Exports: `ServiceConfig` plus the default host/port/snapshot constants.
//! Role: One place where environment variables become effective settings.
//! Invariants: Flags override environment; environment overrides defaults.
//! Invariants: `DB_SECRET` and `DJANGO_SECRET` are accepted but never consulted.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use bibserve::api::{Error, ErrorKind, default_data_dir};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9013;
pub const DEFAULT_SNAPSHOT: &str = "head";
pub const DEFAULT_SERVICE_NAME: &str = "IETF BibXML service";

/// Effective settings assembled from the environment. Deployment manifests for
/// the original service also pass `DB_SECRET` and `DJANGO_SECRET`; those are
/// accepted and reported as unused instead of failing startup.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_name: String,
    pub api_secret: Option<String>,
    pub service_name: String,
    pub contact_email: Option<String>,
    pub debug: bool,
    pub snapshot: String,
    pub upstream: Option<String>,
    pub upstream_secret: Option<String>,
    pub ignored_env: Vec<&'static str>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |name: &str| get(name).filter(|value| !value.trim().is_empty());

        let port = match get("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("PORT is not a valid port number: {raw:?}"))
                    .with_hint("Use an integer between 1 and 65535.")
                    .with_source(err)
            })?,
            None => DEFAULT_PORT,
        };

        let mut ignored_env = Vec::new();
        for name in ["DB_SECRET", "DJANGO_SECRET"] {
            if get(name).is_some() {
                ignored_env.push(name);
            }
        }

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            data_dir: get("BIBSERVE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            db_name: get("DB_NAME").unwrap_or_else(|| "bibxml".to_string()),
            api_secret: get("API_SECRET"),
            service_name: get("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            contact_email: get("CONTACT_EMAIL"),
            debug: get("DEBUG").as_deref().is_some_and(truthy),
            snapshot: get("SNAPSHOT").unwrap_or_else(|| DEFAULT_SNAPSHOT.to_string()),
            upstream: get("BIBSERVE_UPSTREAM"),
            upstream_secret: get("BIBSERVE_UPSTREAM_SECRET"),
            ignored_env,
        })
    }

    /// Resolves `HOST:PORT` to a bind address; hostnames are looked up.
    pub fn bind(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("HOST {:?} does not resolve", self.host))
                    .with_hint("Use an IP address or a resolvable hostname.")
                    .with_source(err)
            })?
            .next()
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("HOST {:?} resolves to no addresses", self.host))
            })
    }

    /// Identity string sent upstream, mirroring how the original service
    /// announces itself to external sources.
    pub fn user_agent(&self) -> String {
        let base = format!(
            "{} bibserve/{}",
            self.service_name,
            env!("CARGO_PKG_VERSION")
        );
        match self.contact_email.as_deref() {
            Some(email) => format!("{base} ({email})"),
            None => base,
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_PORT, DEFAULT_SNAPSHOT, ServiceConfig, truthy};
    use bibserve::core::error::ErrorKind;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServiceConfig, bibserve::core::error::Error> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = config_from(&[]).expect("config");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.db_name, "bibxml");
        assert_eq!(config.snapshot, DEFAULT_SNAPSHOT);
        assert!(config.api_secret.is_none());
        assert!(!config.debug);
        assert!(config.ignored_env.is_empty());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = config_from(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "8000"),
            ("DB_NAME", "staging"),
            ("SNAPSHOT", "2024-06-01"),
            ("API_SECRET", "s3cret"),
        ])
        .expect("config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.db_name, "staging");
        assert_eq!(config.snapshot, "2024-06-01");
        assert_eq!(config.api_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn malformed_port_is_usage_error() {
        let err = config_from(&[("PORT", "nine")]).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[("HOST", "  "), ("SNAPSHOT", "")]).expect("config");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.snapshot, DEFAULT_SNAPSHOT);
    }

    #[test]
    fn legacy_secrets_are_accepted_and_reported() {
        let config = config_from(&[("DB_SECRET", "x"), ("DJANGO_SECRET", "y")]).expect("config");
        assert_eq!(config.ignored_env, vec!["DB_SECRET", "DJANGO_SECRET"]);
    }

    #[test]
    fn debug_flag_accepts_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(truthy(value), "{value:?} should be truthy");
        }
        for value in ["0", "false", "off", "nope", ""] {
            assert!(!truthy(value), "{value:?} should be falsy");
        }
    }

    #[test]
    fn bind_resolves_loopback() {
        let config = config_from(&[("PORT", "9100")]).expect("config");
        let bind = config.bind().expect("bind");
        assert!(bind.ip().is_loopback());
        assert_eq!(bind.port(), 9100);
    }

    #[test]
    fn user_agent_includes_contact_when_present() {
        let config = config_from(&[
            ("SERVICE_NAME", "Example BibXML"),
            ("CONTACT_EMAIL", "ops@example.org"),
        ])
        .expect("config");
        let agent = config.user_agent();
        assert!(agent.starts_with("Example BibXML bibserve/"));
        assert!(agent.ends_with("(ops@example.org)"));
    }
}
