//! TOML configuration parsing and layered client settings.
//!
//! The configuration file (default `./config/estask.toml`) holds the
//! database location, the file-based Elasticsearch client layer, runner
//! limits, and the task definitions:
//!
//! ```toml
//! [db]
//! path = "./data/estask.sqlite"
//!
//! [elastic]
//! hosts = ["https://es1:9200"]
//! username = "elastic"
//! password = "changeme"
//! tls_mode = "verify-with-ca"
//! ca_bundle_path = "certs/ca.pem"
//! request_timeout_seconds = 10
//!
//! [runner]
//! max_concurrent_runs = 4
//!
//! [[tasks]]
//! id = "purge-sessions"
//! operation = "search"
//! index = "sessions"
//! body = '''{"query":{"range":{"expires":{"lt":"{{today:yyyy-MM-dd}}"}}}}'''
//! ```
//!
//! # Client settings layers
//!
//! Client options resolve through three layers, lowest precedence first:
//!
//! 1. packaged defaults ([`ClientSettings::default`]),
//! 2. the `[elastic]` table of the file (a [`ClientOverrides`]),
//! 3. named-argument overrides supplied when a client is requested
//!    (`[tasks.connection]`, `--set key=value`, or code).
//!
//! A later layer replaces an option wholesale; composite values such as
//! `hosts` are never merged element-wise.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use elastic_tasks_core::context::TemplateValue;
use elastic_tasks_core::error::ConfigError;
use elastic_tasks_core::models::{ExpectedResults, OperationKind, TaskDefinition};
use serde::{Deserialize, Serialize};

/// How the client validates the cluster's TLS certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// No certificate verification.
    None,
    /// Verify against the bundled web PKI roots.
    Verify,
    /// Verify against the configured CA bundle only.
    VerifyWithCa,
    /// Verify against the CA bundle and present a client certificate.
    MutualTls,
}

impl TlsMode {
    pub fn requires_ca(&self) -> bool {
        matches!(self, Self::VerifyWithCa | Self::MutualTls)
    }

    pub fn requires_identity(&self) -> bool {
        matches!(self, Self::MutualTls)
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Verify => "verify",
            Self::VerifyWithCa => "verify-with-ca",
            Self::MutualTls => "mutual-tls",
        };
        f.write_str(s)
    }
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "verify" => Ok(Self::Verify),
            "verify-with-ca" => Ok(Self::VerifyWithCa),
            "mutual-tls" => Ok(Self::MutualTls),
            other => Err(format!(
                "unknown TLS mode '{other}'. Must be none, verify, verify-with-ca, or mutual-tls"
            )),
        }
    }
}

/// A complete set of client options (every option has a value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub tls_mode: TlsMode,
    pub ca_bundle_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub request_timeout_seconds: u64,
    pub index: Option<String>,
}

impl Default for ClientSettings {
    /// Packaged defaults: a local, unauthenticated, plaintext cluster.
    fn default() -> Self {
        Self {
            hosts: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            api_key: None,
            tls_mode: TlsMode::None,
            ca_bundle_path: None,
            client_cert_path: None,
            client_key_path: None,
            request_timeout_seconds: 10,
            index: None,
        }
    }
}

impl ClientSettings {
    /// Apply `layer` on top of `self`. Options set in `layer` win.
    ///
    /// Credentials count as one option: an API key in `layer` drops basic
    /// auth from below, and a username or password drops the API key.
    pub fn merge(&self, layer: &ClientOverrides) -> ClientSettings {
        let mut merged = self.clone();
        if layer.api_key.is_some() {
            merged.username = None;
            merged.password = None;
        }
        if layer.sets_basic_auth() {
            merged.api_key = None;
        }
        if let Some(hosts) = &layer.hosts {
            merged.hosts = hosts.clone();
        }
        if let Some(username) = &layer.username {
            merged.username = Some(username.clone());
        }
        if let Some(password) = &layer.password {
            merged.password = Some(password.clone());
        }
        if let Some(api_key) = &layer.api_key {
            merged.api_key = Some(api_key.clone());
        }
        if let Some(mode) = layer.tls_mode {
            merged.tls_mode = mode;
        }
        if let Some(path) = &layer.ca_bundle_path {
            merged.ca_bundle_path = Some(path.clone());
        }
        if let Some(path) = &layer.client_cert_path {
            merged.client_cert_path = Some(path.clone());
        }
        if let Some(path) = &layer.client_key_path {
            merged.client_key_path = Some(path.clone());
        }
        if let Some(timeout) = layer.request_timeout_seconds {
            merged.request_timeout_seconds = timeout;
        }
        if let Some(index) = &layer.index {
            merged.index = Some(index.clone());
        }
        merged
    }
}

/// A partial layer of client options. `None` means "not set here".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientOverrides {
    pub hosts: Option<Vec<String>>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub tls_mode: Option<TlsMode>,
    pub ca_bundle_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub request_timeout_seconds: Option<u64>,
    pub index: Option<String>,
}

impl ClientOverrides {
    /// Build a layer from `name=value` named arguments.
    ///
    /// `hosts` takes a comma-separated list. Unknown names and unparsable
    /// values fail with [`ConfigError::InvalidOption`].
    pub fn from_named_args<I, K, V>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut layer = Self::default();
        for (name, value) in args {
            let (name, value) = (name.as_ref().trim(), value.as_ref().trim());
            match name {
                "hosts" => {
                    layer.hosts = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|h| !h.is_empty())
                            .map(String::from)
                            .collect(),
                    )
                }
                "username" => layer.username = Some(value.to_string()),
                "password" => layer.password = Some(value.to_string()),
                "api_key" => layer.api_key = Some(value.to_string()),
                "tls_mode" => {
                    layer.tls_mode = Some(
                        value
                            .parse()
                            .map_err(|e: String| ConfigError::invalid(name, e))?,
                    )
                }
                "ca_bundle_path" => layer.ca_bundle_path = Some(PathBuf::from(value)),
                "client_cert_path" => layer.client_cert_path = Some(PathBuf::from(value)),
                "client_key_path" => layer.client_key_path = Some(PathBuf::from(value)),
                "request_timeout_seconds" => {
                    layer.request_timeout_seconds = Some(value.parse().map_err(|_| {
                        ConfigError::invalid(name, format!("'{value}' is not a number of seconds"))
                    })?)
                }
                "index" => layer.index = Some(value.to_string()),
                other => return Err(ConfigError::invalid(other, "unknown option")),
            }
        }
        Ok(layer)
    }

    /// Stack `higher` on top of `self`; options set in `higher` win.
    pub fn layered(&self, higher: &ClientOverrides) -> ClientOverrides {
        let (username, password) = if higher.api_key.is_some() {
            (None, None)
        } else {
            (self.username.clone(), self.password.clone())
        };
        let api_key = if higher.sets_basic_auth() {
            None
        } else {
            self.api_key.clone()
        };
        ClientOverrides {
            hosts: higher.hosts.clone().or_else(|| self.hosts.clone()),
            username: higher.username.clone().or(username),
            password: higher.password.clone().or(password),
            api_key: higher.api_key.clone().or(api_key),
            tls_mode: higher.tls_mode.or(self.tls_mode),
            ca_bundle_path: higher
                .ca_bundle_path
                .clone()
                .or_else(|| self.ca_bundle_path.clone()),
            client_cert_path: higher
                .client_cert_path
                .clone()
                .or_else(|| self.client_cert_path.clone()),
            client_key_path: higher
                .client_key_path
                .clone()
                .or_else(|| self.client_key_path.clone()),
            request_timeout_seconds: higher
                .request_timeout_seconds
                .or(self.request_timeout_seconds),
            index: higher.index.clone().or_else(|| self.index.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn sets_basic_auth(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    /// File-based client layer.
    #[serde(default)]
    pub elastic: ClientOverrides,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/estask.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            run_timeout_seconds: default_run_timeout_seconds(),
        }
    }
}

fn default_max_concurrent_runs() -> usize {
    4
}
fn default_run_timeout_seconds() -> u64 {
    300
}

/// A task definition plus its per-task client overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "TaskFile")]
pub struct TaskEntry {
    pub definition: TaskDefinition,
    pub connection: ClientOverrides,
}

/// One `[[tasks]]` table as written in the file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    id: String,
    #[serde(default)]
    index: Option<String>,
    operation: OperationKind,
    body: String,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    expected_results: Option<ExpectedResults>,
    #[serde(default)]
    log_fields: Vec<String>,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, toml::Value>,
    #[serde(default)]
    connection: ClientOverrides,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<TaskFile> for TaskEntry {
    type Error = String;

    fn try_from(file: TaskFile) -> Result<Self, Self::Error> {
        let mut variables = BTreeMap::new();
        for (name, value) in file.variables {
            let value = template_value(&value)
                .map_err(|reason| format!("task '{}': variable '{}' {}", file.id, name, reason))?;
            variables.insert(name, value);
        }

        let mut definition = TaskDefinition::new(file.id, file.operation, file.body);
        definition.index = file.index;
        definition.schedule = file.schedule;
        definition.enabled = file.enabled;
        definition.expected_results = file.expected_results;
        definition.log_fields = file.log_fields;
        definition.document_id = file.document_id;
        definition.variables = variables;

        Ok(Self {
            definition,
            connection: file.connection,
        })
    }
}

/// Map a TOML scalar to a typed template variable.
fn template_value(value: &toml::Value) -> Result<TemplateValue, String> {
    match value {
        toml::Value::String(s) => Ok(TemplateValue::Text(s.clone())),
        toml::Value::Integer(n) => Ok(TemplateValue::Integer(*n)),
        toml::Value::Float(x) => Ok(TemplateValue::Float(*x)),
        toml::Value::Boolean(b) => Ok(TemplateValue::Bool(*b)),
        toml::Value::Datetime(dt) => match (dt.date, dt.time, dt.offset) {
            (Some(_), None, None) => NaiveDate::parse_from_str(&dt.to_string(), "%Y-%m-%d")
                .map(TemplateValue::Date)
                .map_err(|e| format!("is not a valid date: {e}")),
            (Some(_), Some(_), Some(_)) => DateTime::parse_from_rfc3339(&dt.to_string())
                .map(|ts| TemplateValue::DateTime(ts.with_timezone(&Utc)))
                .map_err(|e| format!("is not a valid date-time: {e}")),
            _ => Err("must be a date or a date-time with an offset".to_string()),
        },
        toml::Value::Array(_) | toml::Value::Table(_) => {
            Err("must be a string, number, boolean or date".to_string())
        }
    }
}

impl Config {
    pub fn task(&self, id: &str) -> Option<&TaskEntry> {
        self.tasks.iter().find(|t| t.definition.id == id)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.runner.max_concurrent_runs == 0 {
        bail!("runner.max_concurrent_runs must be >= 1");
    }
    if config.runner.run_timeout_seconds == 0 {
        bail!("runner.run_timeout_seconds must be >= 1");
    }

    let mut seen = HashSet::new();
    for entry in &config.tasks {
        let id = entry.definition.id.trim();
        if id.is_empty() {
            bail!("tasks: every task needs a non-empty id");
        }
        if !seen.insert(id.to_string()) {
            bail!("tasks: duplicate task id '{}'", id);
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_tasks_core::models::OperationKind;

    #[test]
    fn test_defaults_file_overrides_precedence() {
        let file = ClientOverrides {
            hosts: Some(vec!["https://file:9200".into()]),
            request_timeout_seconds: Some(30),
            index: Some("file-index".into()),
            ..Default::default()
        };
        let call = ClientOverrides::from_named_args([("request_timeout_seconds", "60")]).unwrap();

        let settings = ClientSettings::default().merge(&file).merge(&call);
        assert_eq!(settings.hosts, vec!["https://file:9200".to_string()]);
        assert_eq!(settings.request_timeout_seconds, 60);
        assert_eq!(settings.index.as_deref(), Some("file-index"));
        assert_eq!(settings.tls_mode, TlsMode::None);
    }

    #[test]
    fn test_override_replaces_composite_values() {
        let file = ClientOverrides {
            hosts: Some(vec!["http://a:9200".into(), "http://b:9200".into()]),
            ca_bundle_path: Some(PathBuf::from("/etc/ssl/file-ca.pem")),
            ..Default::default()
        };
        let call = ClientOverrides::from_named_args([
            ("hosts", "http://c:9200"),
            ("ca_bundle_path", "/tmp/call-ca.pem"),
        ])
        .unwrap();

        let settings = ClientSettings::default().merge(&file).merge(&call);
        assert_eq!(settings.hosts, vec!["http://c:9200".to_string()]);
        assert_eq!(
            settings.ca_bundle_path,
            Some(PathBuf::from("/tmp/call-ca.pem"))
        );
    }

    #[test]
    fn test_named_args_errors() {
        let err = ClientOverrides::from_named_args([("colour", "blue")]).unwrap_err();
        assert_eq!(err.kind(), "config.invalid_option");

        let err = ClientOverrides::from_named_args([("tls_mode", "sometimes")]).unwrap_err();
        assert!(err.to_string().contains("tls_mode"));

        let err =
            ClientOverrides::from_named_args([("request_timeout_seconds", "soon")]).unwrap_err();
        assert_eq!(err.kind(), "config.invalid_option");
    }

    #[test]
    fn test_layered_overrides() {
        let task = ClientOverrides {
            request_timeout_seconds: Some(60),
            index: Some("task-index".into()),
            ..Default::default()
        };
        let cli = ClientOverrides::from_named_args([("index", "cli-index")]).unwrap();

        let combined = task.layered(&cli);
        assert_eq!(combined.index.as_deref(), Some("cli-index"));
        assert_eq!(combined.request_timeout_seconds, Some(60));
        assert_eq!(combined.hosts, None);
    }

    #[test]
    fn test_named_hosts_list() {
        let layer =
            ClientOverrides::from_named_args([("hosts", "http://a:9200, http://b:9200,")]).unwrap();
        assert_eq!(
            layer.hosts,
            Some(vec!["http://a:9200".to_string(), "http://b:9200".to_string()])
        );
        assert!(!layer.is_empty());
        assert!(ClientOverrides::default().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
[db]
path = "/tmp/estask.sqlite"

[elastic]
hosts = ["https://es:9200"]
tls_mode = "mutual-tls"
ca_bundle_path = "certs/ca.pem"
client_cert_path = "certs/client.pem"
client_key_path = "certs/client.key"

[runner]
max_concurrent_runs = 2

[[tasks]]
id = "stale"
operation = "search"
index = "sessions"
body = '{"query":{"match_all":{}}}'
expected_results = "0-10"
log_fields = ["user"]

[tasks.variables]
tenant = "acme"

[tasks.connection]
request_timeout_seconds = 45

[[tasks]]
id = "tag"
operation = "bulk-update"
enabled = false
body = '[]'
"#,
        )
        .unwrap();

        assert_eq!(config.elastic.tls_mode, Some(TlsMode::MutualTls));
        assert_eq!(config.runner.max_concurrent_runs, 2);
        assert_eq!(config.runner.run_timeout_seconds, 300);
        assert_eq!(config.tasks.len(), 2);

        let stale = config.task("stale").unwrap();
        assert_eq!(stale.definition.operation, OperationKind::Search);
        assert_eq!(stale.definition.expected_results.unwrap().max, Some(10));
        assert_eq!(stale.definition.variables["tenant"], TemplateValue::from("acme"));
        assert_eq!(stale.connection.request_timeout_seconds, Some(45));
        assert!(stale.definition.enabled);

        let tag = config.task("tag").unwrap();
        assert_eq!(tag.definition.operation, OperationKind::BulkUpdate);
        assert!(!tag.definition.enabled);
        assert!(tag.connection.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_task_ids() {
        let err = parse_config(
            r#"
[[tasks]]
id = "a"
operation = "search"
body = "{}"

[[tasks]]
id = "a"
operation = "update"
body = "{}"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_unknown_elastic_option() {
        assert!(parse_config("[elastic]\nverify_certs = true\n").is_err());
    }

    #[test]
    fn test_api_key_override_replaces_basic_auth() {
        let file = ClientOverrides {
            username: Some("elastic".into()),
            password: Some("changeme".into()),
            ..Default::default()
        };
        let call = ClientOverrides::from_named_args([("api_key", "c2VjcmV0")]).unwrap();

        let merged = ClientSettings::default().merge(&file).merge(&call);
        assert_eq!(merged.api_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(merged.username, None);
        assert_eq!(merged.password, None);

        let stacked = file.layered(&call);
        assert_eq!(stacked.api_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(stacked.username, None);
        assert_eq!(stacked.password, None);
    }

    #[test]
    fn test_basic_auth_override_replaces_api_key() {
        let file = ClientOverrides {
            api_key: Some("c2VjcmV0".into()),
            ..Default::default()
        };
        let call = ClientOverrides::from_named_args([("username", "ops"), ("password", "pw")]).unwrap();

        let merged = ClientSettings::default().merge(&file).merge(&call);
        assert_eq!(merged.api_key, None);
        assert_eq!(merged.username.as_deref(), Some("ops"));
        assert_eq!(file.layered(&call).api_key, None);

        // A password alone rotates basic auth and keeps the lower username.
        let basic = ClientOverrides {
            username: Some("elastic".into()),
            password: Some("old".into()),
            ..Default::default()
        };
        let rotated = ClientSettings::default()
            .merge(&basic)
            .merge(&ClientOverrides::from_named_args([("password", "new")]).unwrap());
        assert_eq!(rotated.username.as_deref(), Some("elastic"));
        assert_eq!(rotated.password.as_deref(), Some("new"));
    }

    #[test]
    fn test_rejects_unknown_task_key() {
        let err = parse_config(
            r#"
[[tasks]]
id = "stale"
operation = "search"
body = "{}"
expected_result = "0"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("expected_result"));
    }

    #[test]
    fn test_task_variables_keep_toml_types() {
        let config = parse_config(
            r#"
[[tasks]]
id = "typed"
operation = "search"
body = "{}"

[tasks.variables]
tenant = "acme"
batch = 7
ratio = 0.25
dry_run = true
since = 2024-02-29
cutoff = 2024-03-05T03:00:00Z
"#,
        )
        .unwrap();

        let vars = &config.task("typed").unwrap().definition.variables;
        assert_eq!(vars["tenant"], TemplateValue::from("acme"));
        assert_eq!(vars["batch"], TemplateValue::Integer(7));
        assert_eq!(vars["ratio"], TemplateValue::Float(0.25));
        assert_eq!(vars["dry_run"], TemplateValue::Bool(true));
        assert_eq!(
            vars["since"],
            TemplateValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(
            vars["cutoff"],
            TemplateValue::DateTime(DateTime::parse_from_rfc3339("2024-03-05T03:00:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn test_rejects_composite_and_local_time_variables() {
        for value in ["[1, 2]", "07:32:00", "2024-03-05T03:00:00"] {
            let err = parse_config(&format!(
                "[[tasks]]\nid = \"t\"\noperation = \"search\"\nbody = \"{{}}\"\n\n[tasks.variables]\nx = {value}\n"
            ))
            .unwrap_err();
            assert!(format!("{:#}", err).contains("variable 'x'"), "value: {}", value);
        }
    }
}
