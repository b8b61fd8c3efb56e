//! Connection builder: layered client settings → validated, cached handles.
//!
//! [`ConnectionBuilder::build`] turns the base settings (packaged defaults
//! merged with the `[elastic]` file layer) plus call-time overrides into an
//! immutable [`ClientConfig`], loads any TLS material it references, and
//! returns a shared [`ClientHandle`].
//!
//! ```text
//! ClientSettings::default()
//!        │ merge([elastic])
//!        ▼
//!   base settings ──merge(overrides)──▶ ClientConfig::from_settings
//!                                             │
//!                                   load_tls_material (PEM)
//!                                             │
//!                              fingerprint = sha256(config ++ pem bytes)
//!                                             │
//!                          cache hit? ──yes──▶ Arc<ClientHandle>
//!                                │no
//!                         reqwest::Client::builder()
//! ```
//!
//! Building never touches the network. The underlying `reqwest::Client`
//! connects lazily on first request, so only certificate problems are
//! detected here.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use elastic_tasks_core::error::ConfigError;
use reqwest::{Method, RequestBuilder, Url};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{ClientOverrides, ClientSettings, TlsMode};

/// Credentials sent with every request.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    Basic { username: String, password: String },
    ApiKey(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

/// Validated, immutable client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientConfig {
    pub hosts: Vec<String>,
    pub credentials: Option<Credentials>,
    pub tls_mode: TlsMode,
    pub ca_bundle_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub request_timeout_seconds: u64,
    pub index: Option<String>,
}

impl ClientConfig {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ConfigError> {
        if settings.hosts.is_empty() {
            return Err(ConfigError::MissingOption("hosts".into()));
        }
        let mut hosts = Vec::with_capacity(settings.hosts.len());
        for host in &settings.hosts {
            let url = Url::parse(host)
                .map_err(|e| ConfigError::invalid("hosts", format!("'{host}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::invalid(
                    "hosts",
                    format!("'{host}' must use http or https"),
                ));
            }
            hosts.push(host.trim_end_matches('/').to_string());
        }

        let credentials = match (&settings.username, &settings.password, &settings.api_key) {
            (None, None, None) => None,
            (Some(_), _, Some(_)) => {
                return Err(ConfigError::invalid(
                    "api_key",
                    "cannot be combined with username/password",
                ))
            }
            (None, None, Some(key)) if key.is_empty() => {
                return Err(ConfigError::invalid("api_key", "must not be empty"))
            }
            (None, None, Some(key)) => Some(Credentials::ApiKey(key.clone())),
            (Some(_), None, None) => return Err(ConfigError::MissingOption("password".into())),
            (None, Some(_), _) => return Err(ConfigError::MissingOption("username".into())),
            (Some(username), Some(password), None) => Some(Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
        };

        if settings.tls_mode.requires_ca() && settings.ca_bundle_path.is_none() {
            return Err(ConfigError::CertificateError(format!(
                "tls_mode {} requires ca_bundle_path",
                settings.tls_mode
            )));
        }
        if settings.tls_mode.requires_identity() {
            if settings.client_cert_path.is_none() {
                return Err(ConfigError::CertificateError(
                    "tls_mode mutual-tls requires client_cert_path".into(),
                ));
            }
            if settings.client_key_path.is_none() {
                return Err(ConfigError::CertificateError(
                    "tls_mode mutual-tls requires client_key_path".into(),
                ));
            }
        }

        if settings.request_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "request_timeout_seconds",
                "must be at least 1",
            ));
        }

        Ok(Self {
            hosts,
            credentials,
            tls_mode: settings.tls_mode,
            ca_bundle_path: settings.ca_bundle_path.clone(),
            client_cert_path: settings.client_cert_path.clone(),
            client_key_path: settings.client_key_path.clone(),
            request_timeout_seconds: settings.request_timeout_seconds,
            index: settings.index.clone(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// PEM material referenced by a [`ClientConfig`], read and parsed up front.
#[derive(Default)]
struct TlsMaterial {
    roots: Vec<CertificateDer<'static>>,
    /// Client certificate chain followed by its private key, both PEM.
    identity_pem: Option<Vec<u8>>,
    /// Raw file bytes in load order; part of the cache fingerprint.
    raw: Vec<u8>,
}

fn read_pem_file(path: &Path, what: &str) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|e| {
        ConfigError::CertificateError(format!("cannot read {what} {}: {e}", path.display()))
    })
}

fn parse_certificates(
    bytes: &[u8],
    path: &Path,
    what: &str,
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = CertificateDer::pem_slice_iter(bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ConfigError::CertificateError(format!("invalid {what} {}: {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(ConfigError::CertificateError(format!(
            "{what} {} contains no PEM certificates",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_tls_material(config: &ClientConfig) -> Result<TlsMaterial, ConfigError> {
    let mut material = TlsMaterial::default();
    if config.tls_mode == TlsMode::None {
        return Ok(material);
    }

    if let Some(path) = &config.ca_bundle_path {
        let bytes = read_pem_file(path, "CA bundle")?;
        material.roots = parse_certificates(&bytes, path, "CA bundle")?;
        material.raw.extend_from_slice(&bytes);
    }

    if config.tls_mode.requires_identity() {
        let (Some(cert_path), Some(key_path)) = (&config.client_cert_path, &config.client_key_path)
        else {
            return Err(ConfigError::CertificateError(
                "tls_mode mutual-tls requires client_cert_path and client_key_path".into(),
            ));
        };
        let cert_bytes = read_pem_file(cert_path, "client certificate")?;
        parse_certificates(&cert_bytes, cert_path, "client certificate")?;

        let key_bytes = read_pem_file(key_path, "client key")?;
        PrivateKeyDer::from_pem_slice(&key_bytes).map_err(|e| {
            ConfigError::CertificateError(format!(
                "invalid client key {}: {e}",
                key_path.display()
            ))
        })?;

        let mut pem = cert_bytes.clone();
        pem.push(b'\n');
        pem.extend_from_slice(&key_bytes);
        material.raw.extend_from_slice(&pem);
        material.identity_pem = Some(pem);
    }

    Ok(material)
}

fn fingerprint(config: &ClientConfig, material: &TlsMaterial) -> String {
    let mut hasher = Sha256::new();
    // Serializing a plain struct of strings and integers cannot fail.
    if let Ok(canonical) = serde_json::to_vec(config) {
        hasher.update(&canonical);
    }
    hasher.update(&material.raw);
    format!("{:x}", hasher.finalize())
}

fn build_http_client(
    config: &ClientConfig,
    material: TlsMaterial,
) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(config.request_timeout());

    match config.tls_mode {
        TlsMode::None => {
            if config.hosts.iter().any(|h| h.starts_with("https://")) {
                tracing::warn!(
                    hosts = ?config.hosts,
                    "tls_mode = none: server certificates will not be verified"
                );
            }
            builder = builder.danger_accept_invalid_certs(true);
        }
        TlsMode::Verify => {}
        TlsMode::VerifyWithCa | TlsMode::MutualTls => {
            builder = builder.tls_built_in_root_certs(false);
        }
    }

    for root in &material.roots {
        let cert = reqwest::Certificate::from_der(root.as_ref())
            .map_err(|e| ConfigError::CertificateError(format!("CA certificate rejected: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if let Some(pem) = &material.identity_pem {
        let identity = reqwest::Identity::from_pem(pem).map_err(|e| {
            ConfigError::CertificateError(format!("client identity rejected: {e}"))
        })?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| {
        if config.tls_mode == TlsMode::None {
            ConfigError::invalid("client", e.to_string())
        } else {
            ConfigError::CertificateError(format!("TLS setup failed: {e}"))
        }
    })
}

/// A ready-to-use, shareable Elasticsearch client.
///
/// Safe for concurrent use; runs never mutate it.
pub struct ClientHandle {
    client: reqwest::Client,
    config: ClientConfig,
    fingerprint: String,
    next_host: AtomicUsize,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("hosts", &self.config.hosts)
            .field("tls_mode", &self.config.tls_mode)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl ClientHandle {
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Hex SHA-256 of the configuration and certificate bytes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn default_index(&self) -> Option<&str> {
        self.config.index.as_deref()
    }

    /// Absolute URL for `path` on the next host (round-robin).
    pub fn url(&self, path: &str) -> String {
        let i = self.next_host.fetch_add(1, Ordering::Relaxed) % self.config.hosts.len();
        format!("{}/{}", self.config.hosts[i], path.trim_start_matches('/'))
    }

    /// Start a request with credentials applied.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.config.credentials {
            None => builder,
            Some(Credentials::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credentials::ApiKey(key)) => {
                builder.header(reqwest::header::AUTHORIZATION, format!("ApiKey {key}"))
            }
        }
    }
}

/// Builds and caches [`ClientHandle`]s by configuration content hash.
pub struct ConnectionBuilder {
    base: RwLock<ClientSettings>,
    cache: RwLock<HashMap<String, Arc<ClientHandle>>>,
}

impl ConnectionBuilder {
    pub fn new(base: ClientSettings) -> Self {
        Self {
            base: RwLock::new(base),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Packaged defaults with the file layer applied.
    pub fn from_file_layer(file: &ClientOverrides) -> Self {
        Self::new(ClientSettings::default().merge(file))
    }

    /// The fully merged settings for `overrides`.
    pub fn settings(&self, overrides: &ClientOverrides) -> ClientSettings {
        self.base
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(overrides)
    }

    pub fn build(&self, overrides: &ClientOverrides) -> Result<Arc<ClientHandle>, ConfigError> {
        let config = ClientConfig::from_settings(&self.settings(overrides))?;
        let material = load_tls_material(&config)?;
        let fingerprint = fingerprint(&config, &material);

        if let Some(handle) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fingerprint)
        {
            return Ok(Arc::clone(handle));
        }

        let client = build_http_client(&config, material)?;
        tracing::debug!(
            fingerprint = &fingerprint[..12],
            hosts = ?config.hosts,
            tls_mode = %config.tls_mode,
            "built Elasticsearch client"
        );
        let handle = Arc::new(ClientHandle {
            client,
            config,
            fingerprint: fingerprint.clone(),
            next_host: AtomicUsize::new(0),
        });

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(cache.entry(fingerprint).or_insert(handle)))
    }

    /// Replace the base settings and drop every cached handle.
    pub fn reload(&self, base: ClientSettings) {
        *self.base.write().unwrap_or_else(PoisonError::into_inner) = base;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = cache.len();
        cache.clear();
        tracing::info!(dropped, "client configuration reloaded");
    }

    pub fn cached_handles(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAKE_CERT: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

    const TEST_CA: &str = include_str!("../tests/fixtures/tls/ca.pem");
    const ROTATED_CA: &str = include_str!("../tests/fixtures/tls/ca-rotated.pem");
    const CLIENT_CERT: &str = include_str!("../tests/fixtures/tls/client.pem");
    const CLIENT_KEY: &str = include_str!("../tests/fixtures/tls/client.key");

    /// Write the test CA and client pair into `dir`.
    fn write_tls_files(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let (ca, cert, key) = (dir.join("ca.pem"), dir.join("client.pem"), dir.join("client.key"));
        std::fs::write(&ca, TEST_CA).unwrap();
        std::fs::write(&cert, CLIENT_CERT).unwrap();
        std::fs::write(&key, CLIENT_KEY).unwrap();
        (ca, cert, key)
    }

    fn named(args: &[(&str, &str)]) -> ClientOverrides {
        ClientOverrides::from_named_args(args.iter().copied()).unwrap()
    }

    #[test]
    fn test_mutual_tls_without_key_is_certificate_error() {
        let builder = ConnectionBuilder::new(ClientSettings::default());
        let err = builder
            .build(&named(&[
                ("hosts", "https://es:9200"),
                ("tls_mode", "mutual-tls"),
                ("ca_bundle_path", "/nonexistent/ca.pem"),
                ("client_cert_path", "/nonexistent/client.pem"),
            ]))
            .unwrap_err();
        assert_eq!(err.kind(), "config.certificate");
        assert!(err.to_string().contains("client_key_path"));
        assert_eq!(builder.cached_handles(), 0);
    }

    #[test]
    fn test_missing_key_file_is_certificate_error() {
        let tmp = TempDir::new().unwrap();
        let ca = tmp.path().join("ca.pem");
        let cert = tmp.path().join("client.pem");
        std::fs::write(&ca, FAKE_CERT).unwrap();
        std::fs::write(&cert, FAKE_CERT).unwrap();

        let builder = ConnectionBuilder::new(ClientSettings::default());
        let err = builder
            .build(&ClientOverrides {
                hosts: Some(vec!["https://es:9200".into()]),
                tls_mode: Some(TlsMode::MutualTls),
                ca_bundle_path: Some(ca),
                client_cert_path: Some(cert),
                client_key_path: Some(tmp.path().join("missing.key")),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), "config.certificate");
        assert!(err.to_string().contains("client key"));
    }

    #[test]
    fn test_unparsable_ca_bundle_is_certificate_error() {
        let tmp = TempDir::new().unwrap();
        let ca = tmp.path().join("ca.pem");
        std::fs::write(&ca, "not a certificate").unwrap();

        let builder = ConnectionBuilder::new(ClientSettings::default());
        let err = builder
            .build(&ClientOverrides {
                tls_mode: Some(TlsMode::VerifyWithCa),
                ca_bundle_path: Some(ca),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), "config.certificate");
        assert!(err.to_string().contains("no PEM certificates"));
    }

    #[test]
    fn test_verify_with_ca_builds_from_pem_bundle() {
        let tmp = TempDir::new().unwrap();
        let (ca, _, _) = write_tls_files(tmp.path());

        let builder = ConnectionBuilder::new(ClientSettings::default());
        let handle = builder
            .build(&ClientOverrides {
                hosts: Some(vec!["https://es:9200".into()]),
                tls_mode: Some(TlsMode::VerifyWithCa),
                ca_bundle_path: Some(ca),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(handle.config().tls_mode, TlsMode::VerifyWithCa);
        assert_eq!(builder.cached_handles(), 1);
    }

    #[test]
    fn test_mutual_tls_builds_from_pem_identity() {
        let tmp = TempDir::new().unwrap();
        let (ca, cert, key) = write_tls_files(tmp.path());

        let builder = ConnectionBuilder::new(ClientSettings::default());
        let handle = builder
            .build(&ClientOverrides {
                hosts: Some(vec!["https://es:9200".into()]),
                tls_mode: Some(TlsMode::MutualTls),
                ca_bundle_path: Some(ca),
                client_cert_path: Some(cert),
                client_key_path: Some(key),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(handle.config().tls_mode, TlsMode::MutualTls);
    }

    #[test]
    fn test_rotated_certificate_yields_new_handle() {
        let tmp = TempDir::new().unwrap();
        let (ca, _, _) = write_tls_files(tmp.path());
        let overrides = ClientOverrides {
            hosts: Some(vec!["https://es:9200".into()]),
            tls_mode: Some(TlsMode::VerifyWithCa),
            ca_bundle_path: Some(ca.clone()),
            ..Default::default()
        };

        let builder = ConnectionBuilder::new(ClientSettings::default());
        let before = builder.build(&overrides).unwrap();
        std::fs::write(&ca, ROTATED_CA).unwrap();
        let after = builder.build(&overrides).unwrap();

        assert_ne!(before.fingerprint(), after.fingerprint());
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(builder.cached_handles(), 2);
    }

    #[test]
    fn test_call_time_api_key_wins_over_file_basic_auth() {
        let builder = ConnectionBuilder::from_file_layer(&ClientOverrides {
            username: Some("elastic".into()),
            password: Some("changeme".into()),
            ..Default::default()
        });
        let handle = builder.build(&named(&[("api_key", "c2VjcmV0")])).unwrap();
        assert_eq!(
            handle.config().credentials,
            Some(Credentials::ApiKey("c2VjcmV0".into()))
        );
    }

    #[test]
    fn test_verify_with_ca_requires_bundle() {
        let settings = ClientSettings {
            tls_mode: TlsMode::VerifyWithCa,
            ..Default::default()
        };
        let err = ClientConfig::from_settings(&settings).unwrap_err();
        assert_eq!(err.kind(), "config.certificate");
    }

    #[test]
    fn test_option_validation() {
        let empty = ClientSettings {
            hosts: vec![],
            ..Default::default()
        };
        assert_eq!(
            ClientConfig::from_settings(&empty).unwrap_err(),
            ConfigError::MissingOption("hosts".into())
        );

        let ftp = ClientSettings {
            hosts: vec!["ftp://es:21".into()],
            ..Default::default()
        };
        assert_eq!(
            ClientConfig::from_settings(&ftp).unwrap_err().kind(),
            "config.invalid_option"
        );

        let user_only = ClientSettings {
            username: Some("elastic".into()),
            ..Default::default()
        };
        assert_eq!(
            ClientConfig::from_settings(&user_only).unwrap_err(),
            ConfigError::MissingOption("password".into())
        );
    }

    #[test]
    fn test_handles_cached_by_content() {
        let builder = ConnectionBuilder::new(ClientSettings::default());
        let a = builder.build(&ClientOverrides::default()).unwrap();
        let b = builder.build(&ClientOverrides::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builder.cached_handles(), 1);

        let c = builder
            .build(&named(&[("request_timeout_seconds", "30")]))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(builder.cached_handles(), 2);
    }

    #[test]
    fn test_reload_drops_cache() {
        let builder = ConnectionBuilder::new(ClientSettings::default());
        let before = builder.build(&ClientOverrides::default()).unwrap();

        builder.reload(ClientSettings {
            hosts: vec!["http://other:9200".into()],
            ..Default::default()
        });
        assert_eq!(builder.cached_handles(), 0);

        let after = builder.build(&ClientOverrides::default()).unwrap();
        assert_eq!(after.config().hosts, vec!["http://other:9200".to_string()]);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_round_robin_hosts() {
        let builder = ConnectionBuilder::new(ClientSettings::default());
        let handle = builder
            .build(&named(&[("hosts", "http://a:9200/,http://b:9200")]))
            .unwrap();
        assert_eq!(handle.url("/idx/_search"), "http://a:9200/idx/_search");
        assert_eq!(handle.url("idx/_search"), "http://b:9200/idx/_search");
        assert_eq!(handle.url("_bulk"), "http://a:9200/_bulk");
    }

    #[test]
    fn test_credentials_redacted_in_debug() {
        let creds = Credentials::Basic {
            username: "elastic".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("elastic"));
        assert!(!shown.contains("hunter2"));
    }
}
