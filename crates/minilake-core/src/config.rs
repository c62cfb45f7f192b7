//! Configuration model
//!
//! [`StorageConfig`] describes where tables live and how to authenticate. It is
//! resolved once (from the environment or a config file), validated, and then
//! treated as an immutable value owned by the connection manager.
//!
//! [`MinilakeConfig`] bundles the storage section with the tuning knobs of the
//! other components so an embedding application can load everything from a
//! single YAML or JSON file.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::TableRef;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const ENV_STORAGE_TYPE: &str = "STORAGE_TYPE";
pub const ENV_STORAGE_ENDPOINT: &str = "STORAGE_ENDPOINT";
pub const ENV_STORAGE_ACCESS_KEY: &str = "STORAGE_ACCESS_KEY";
pub const ENV_STORAGE_SECRET_KEY: &str = "STORAGE_SECRET_KEY";
pub const ENV_STORAGE_DEFAULT_BUCKETS: &str = "STORAGE_DEFAULT_BUCKETS";
pub const ENV_STORAGE_REGION: &str = "STORAGE_REGION";
pub const ENV_STORAGE_PATH_STYLE: &str = "STORAGE_PATH_STYLE";
pub const ENV_STORAGE_TABLE_PREFIX: &str = "STORAGE_TABLE_PREFIX";
pub const ENV_STORAGE_LOCAL_ROOT: &str = "STORAGE_LOCAL_ROOT";
pub const ENV_STORAGE_ALLOW_UNSAFE_RENAME: &str = "STORAGE_ALLOW_UNSAFE_RENAME";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_TABLE_PREFIX: &str = "delta-tables";

// ============================================================================
// Storage
// ============================================================================

/// Where tables are stored and how to reach them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Buckets the process works with; the first one receives new tables
    pub default_buckets: Vec<String>,

    /// Object prefix under each bucket (tables live at `bucket/prefix/<name>/`)
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

/// Storage backend flavour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible object store (AWS S3, MinIO...)
    S3(S3Settings),
    /// Local filesystem; each bucket is a directory under `root`
    Local { root: PathBuf },
}

/// S3 endpoint and credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    /// `host:port`, optionally prefixed by `http://` or `https://`
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_true")]
    pub path_style: bool,
    /// Skip the put-if-absent commit guard (only for stores without conditional writes)
    #[serde(default)]
    pub allow_unsafe_rename: bool,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("path_style", &self.path_style)
            .field("allow_unsafe_rename", &self.allow_unsafe_rename)
            .finish()
    }
}

/// Parsed, validated form of an S3 endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Endpoint {
    /// `host:port` (or bare host when the scheme default port is used)
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }

    pub fn use_ssl(&self) -> bool {
        self.scheme == "https"
    }
}

impl S3Settings {
    /// Parse the endpoint string
    ///
    /// A bare endpoint must be `host:port`; with an explicit `http`/`https`
    /// scheme the port may be omitted.
    pub fn parse_endpoint(&self) -> Result<Endpoint> {
        let raw = self.endpoint.trim();
        if raw.is_empty() {
            return Err(Error::config("storage endpoint is empty"));
        }

        if let Some((scheme, _)) = raw.split_once("://") {
            let url = Url::parse(raw)
                .map_err(|e| Error::config(format!("invalid storage endpoint '{}': {}", raw, e)))?;
            if scheme != "http" && scheme != "https" {
                return Err(Error::config(format!(
                    "invalid storage endpoint '{}': scheme must be http or https",
                    raw
                )));
            }
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| {
                    Error::config(format!("invalid storage endpoint '{}': missing host", raw))
                })?;
            if !matches!(url.path(), "" | "/") {
                return Err(Error::config(format!(
                    "invalid storage endpoint '{}': must not contain a path",
                    raw
                )));
            }
            return Ok(Endpoint {
                scheme: scheme.to_string(),
                host: host.to_string(),
                port: url.port(),
            });
        }

        let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
            Error::config(format!(
                "invalid storage endpoint '{}': expected host:port",
                raw
            ))
        })?;
        if host.is_empty() || host.contains('/') {
            return Err(Error::config(format!(
                "invalid storage endpoint '{}': expected host:port",
                raw
            )));
        }
        let port: u16 = port.parse().map_err(|_| {
            Error::config(format!(
                "invalid storage endpoint '{}': port '{}' is not a number in 1-65535",
                raw, port
            ))
        })?;
        if port == 0 {
            return Err(Error::config(format!(
                "invalid storage endpoint '{}': port must be non-zero",
                raw
            )));
        }

        Ok(Endpoint {
            scheme: "http".to_string(),
            host: host.to_string(),
            port: Some(port),
        })
    }
}

impl StorageConfig {
    /// S3-backed configuration with default region, prefix and path-style access
    pub fn s3(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        default_buckets: Vec<String>,
    ) -> Self {
        Self {
            backend: StorageBackend::S3(S3Settings {
                endpoint: endpoint.into(),
                access_key: access_key.into(),
                secret_key: secret_key.into(),
                region: default_region(),
                path_style: true,
                allow_unsafe_rename: false,
            }),
            default_buckets,
            table_prefix: default_table_prefix(),
        }
    }

    /// Local filesystem configuration rooted at `root`
    pub fn local(root: impl Into<PathBuf>, default_buckets: Vec<String>) -> Self {
        Self {
            backend: StorageBackend::Local { root: root.into() },
            default_buckets,
            table_prefix: default_table_prefix(),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Resolve configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup
    ///
    /// All missing required keys are reported together. The result is
    /// validated before it is returned.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let storage_type = get(ENV_STORAGE_TYPE)
            .unwrap_or_else(|| "s3".to_string())
            .to_lowercase();

        let required: &[&str] = match storage_type.as_str() {
            "s3" | "minio" => &[
                ENV_STORAGE_ENDPOINT,
                ENV_STORAGE_ACCESS_KEY,
                ENV_STORAGE_SECRET_KEY,
                ENV_STORAGE_DEFAULT_BUCKETS,
            ],
            "local" => &[ENV_STORAGE_LOCAL_ROOT, ENV_STORAGE_DEFAULT_BUCKETS],
            other => {
                return Err(Error::config(format!(
                    "{} must be 's3' or 'local', got '{}'",
                    ENV_STORAGE_TYPE, other
                )))
            }
        };

        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let required_value = |key: &str| {
            get(key).ok_or_else(|| Error::config(format!("{} is not set", key)))
        };

        let default_buckets = parse_bucket_list(&required_value(ENV_STORAGE_DEFAULT_BUCKETS)?);
        let table_prefix =
            get(ENV_STORAGE_TABLE_PREFIX).unwrap_or_else(|| DEFAULT_TABLE_PREFIX.to_string());

        let backend = if storage_type == "local" {
            StorageBackend::Local {
                root: PathBuf::from(required_value(ENV_STORAGE_LOCAL_ROOT)?),
            }
        } else {
            StorageBackend::S3(S3Settings {
                endpoint: required_value(ENV_STORAGE_ENDPOINT)?,
                access_key: required_value(ENV_STORAGE_ACCESS_KEY)?,
                secret_key: required_value(ENV_STORAGE_SECRET_KEY)?,
                region: get(ENV_STORAGE_REGION).unwrap_or_else(default_region),
                path_style: parse_flag(ENV_STORAGE_PATH_STYLE, get(ENV_STORAGE_PATH_STYLE), true)?,
                allow_unsafe_rename: parse_flag(
                    ENV_STORAGE_ALLOW_UNSAFE_RENAME,
                    get(ENV_STORAGE_ALLOW_UNSAFE_RENAME),
                    false,
                )?,
            })
        };

        let config = Self {
            backend,
            default_buckets,
            table_prefix,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and formats
    pub fn validate(&self) -> Result<()> {
        if self.default_buckets.is_empty() {
            return Err(Error::config("at least one default bucket is required"));
        }
        for bucket in &self.default_buckets {
            validate_bucket_name(bucket)?;
        }

        match &self.backend {
            StorageBackend::S3(s3) => {
                s3.parse_endpoint()?;
                if s3.access_key.trim().is_empty() {
                    return Err(Error::config("storage access key is empty"));
                }
                if s3.secret_key.trim().is_empty() {
                    return Err(Error::config("storage secret key is empty"));
                }
            }
            StorageBackend::Local { root } => {
                if root.as_os_str().is_empty() {
                    return Err(Error::config("local storage root is empty"));
                }
            }
        }
        Ok(())
    }

    /// Bucket that receives tables created without an explicit location
    pub fn primary_bucket(&self) -> Result<&str> {
        self.default_buckets
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::config("at least one default bucket is required"))
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, StorageBackend::Local { .. })
    }

    /// Normalized prefix without leading or trailing slashes
    pub fn prefix(&self) -> &str {
        self.table_prefix.trim_matches('/')
    }

    /// Root URI of a table, as understood by delta-rs and DuckDB
    pub fn table_uri(&self, table: &TableRef) -> String {
        match &self.backend {
            StorageBackend::S3(_) => format!("s3://{}", table.location()),
            StorageBackend::Local { root } => {
                let root = if root.is_relative() {
                    std::env::current_dir()
                        .map(|cwd| cwd.join(root))
                        .unwrap_or_else(|_| root.clone())
                } else {
                    root.clone()
                };
                root.join(table.location()).to_string_lossy().to_string()
            }
        }
    }

    /// URI of a bucket root, used for connectivity checks
    pub fn bucket_uri(&self, bucket: &str) -> String {
        match &self.backend {
            StorageBackend::S3(_) => format!("s3://{}", bucket),
            StorageBackend::Local { root } => root.join(bucket).to_string_lossy().to_string(),
        }
    }

    /// Object store options for delta-rs
    pub fn storage_options(&self) -> Result<HashMap<String, String>> {
        let mut options = HashMap::new();
        if let StorageBackend::S3(s3) = &self.backend {
            let endpoint = s3.parse_endpoint()?;
            options.insert("AWS_ENDPOINT_URL".to_string(), endpoint.url());
            options.insert("AWS_ACCESS_KEY_ID".to_string(), s3.access_key.clone());
            options.insert("AWS_SECRET_ACCESS_KEY".to_string(), s3.secret_key.clone());
            options.insert("AWS_REGION".to_string(), s3.region.clone());
            options.insert(
                "AWS_ALLOW_HTTP".to_string(),
                (!endpoint.use_ssl()).to_string(),
            );
            options.insert(
                "AWS_VIRTUAL_HOSTED_STYLE_REQUEST".to_string(),
                (!s3.path_style).to_string(),
            );
            if s3.allow_unsafe_rename {
                options.insert("AWS_S3_ALLOW_UNSAFE_RENAME".to_string(), "true".to_string());
            } else {
                options.insert("AWS_CONDITIONAL_PUT".to_string(), "etag".to_string());
            }
        }
        Ok(options)
    }
}

fn parse_bucket_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(key: &str, raw: Option<String>, default: bool) -> Result<bool> {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(Error::config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

/// S3 bucket naming rules: 3-63 chars of lowercase letters, digits, '.' and '-',
/// starting and ending with a letter or digit
pub fn validate_bucket_name(bucket: &str) -> Result<()> {
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    let valid_edges = bucket
        .chars()
        .next()
        .zip(bucket.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);

    if (3..=63).contains(&bucket.len()) && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(Error::config(format!("invalid bucket name '{}'", bucket)))
    }
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Engine, ingestion, query, registry sections
// ============================================================================

/// Embedded DuckDB session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Persistent database file (None = in-memory)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Worker threads for the database instance (0 = DuckDB default)
    #[serde(default)]
    pub threads: usize,

    /// Memory limit for the database instance (e.g. "2GB")
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// Seconds to wait for a free pooled connection
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Directory for spilling intermediate results
    #[serde(default)]
    pub temp_directory: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: default_pool_size(),
            threads: 0,
            memory_limit: default_memory_limit(),
            connection_timeout_secs: default_connection_timeout(),
            temp_directory: None,
        }
    }
}

fn default_pool_size() -> u32 {
    // max(2, num_cpus / 2)
    (num_cpus::get() / 2).max(2) as u32
}

fn default_memory_limit() -> String {
    "2GB".to_string()
}

fn default_connection_timeout() -> u64 {
    10
}

/// Parquet compression for data files written by ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    Uncompressed,
    Snappy,
    ZstdLevel1,
    #[default]
    ZstdLevel3,
    ZstdLevel9,
}

/// Source parsing and write settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Rows per in-memory record batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// CSV field delimiter
    #[serde(default = "default_delimiter")]
    pub csv_delimiter: char,

    /// Rows sampled for schema inference (None = whole file)
    #[serde(default)]
    pub infer_max_records: Option<usize>,

    #[serde(default)]
    pub compression: CompressionCodec,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            csv_delimiter: default_delimiter(),
            infer_max_records: None,
            compression: CompressionCodec::default(),
        }
    }
}

fn default_batch_size() -> usize {
    8192
}

fn default_delimiter() -> char {
    ','
}

/// Query execution defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Timeout applied when the caller supplies none
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

impl QuerySettings {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }
}

/// Table registry location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// SQLite file path, or ":memory:"
    #[serde(default = "default_registry_path")]
    pub path: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

fn default_registry_path() -> String {
    ".minilake/registry.db".to_string()
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinilakeConfig {
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub ingest: IngestSettings,

    #[serde(default)]
    pub query: QuerySettings,

    #[serde(default)]
    pub registry: RegistrySettings,
}

impl MinilakeConfig {
    /// Load and validate configuration from a YAML or JSON file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = load_from_file(path.as_ref())
            .map_err(|e| Error::config(format!("{:#}", e)))?;
        config.storage.validate()?;
        Ok(config)
    }
}

fn load_from_file(path: &Path) -> anyhow::Result<MinilakeConfig> {
    let display = path.display();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", display))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {}", display)),
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON config: {}", display)),
        _ => serde_yaml::from_str(&content)
            .or_else(|_| serde_json::from_str(&content))
            .with_context(|| format!("Failed to parse config file: {}", display)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn minio_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_STORAGE_ENDPOINT, "localhost:9000"),
            (ENV_STORAGE_ACCESS_KEY, "minioadmin"),
            (ENV_STORAGE_SECRET_KEY, "minioadmin"),
            (ENV_STORAGE_DEFAULT_BUCKETS, "lake, raw-data"),
        ]
    }

    #[test]
    fn test_from_lookup_resolves_s3() {
        let config = StorageConfig::from_lookup(lookup_from(&minio_env())).unwrap();

        assert_eq!(config.default_buckets, vec!["lake", "raw-data"]);
        assert_eq!(config.table_prefix, "delta-tables");
        match &config.backend {
            StorageBackend::S3(s3) => {
                assert_eq!(s3.endpoint, "localhost:9000");
                assert_eq!(s3.region, "us-east-1");
                assert!(s3.path_style);
            }
            other => panic!("expected S3 backend, got {:?}", other),
        }
    }

    #[test]
    fn test_from_lookup_reports_all_missing_keys() {
        let err = StorageConfig::from_lookup(lookup_from(&[(
            ENV_STORAGE_ENDPOINT,
            "localhost:9000",
        )]))
        .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        let msg = err.to_string();
        assert!(msg.contains("STORAGE_ACCESS_KEY"));
        assert!(msg.contains("STORAGE_SECRET_KEY"));
        assert!(msg.contains("STORAGE_DEFAULT_BUCKETS"));
        assert!(!msg.contains("STORAGE_ENDPOINT"));
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let mut env = minio_env();
        env[1] = (ENV_STORAGE_ACCESS_KEY, "   ");
        let err = StorageConfig::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(err.to_string().contains("STORAGE_ACCESS_KEY"));
    }

    #[test]
    fn test_malformed_endpoint_is_configuration_error() {
        for endpoint in ["localhost", "localhost:notaport", ":9000", "ftp://host:21", "host:0"] {
            let mut env = minio_env();
            env[0] = (ENV_STORAGE_ENDPOINT, endpoint);
            let err = StorageConfig::from_lookup(lookup_from(&env)).unwrap_err();
            assert!(
                matches!(err, Error::Configuration(_)),
                "endpoint {} should be rejected",
                endpoint
            );
        }
    }

    #[test]
    fn test_endpoint_parsing() {
        let s3 = |endpoint: &str| S3Settings {
            endpoint: endpoint.to_string(),
            access_key: "a".into(),
            secret_key: "b".into(),
            region: default_region(),
            path_style: true,
            allow_unsafe_rename: false,
        };

        let endpoint = s3("minio:9000").parse_endpoint().unwrap();
        assert_eq!(endpoint.url(), "http://minio:9000");
        assert!(!endpoint.use_ssl());

        let endpoint = s3("https://s3.eu-west-1.amazonaws.com").parse_endpoint().unwrap();
        assert_eq!(endpoint.authority(), "s3.eu-west-1.amazonaws.com");
        assert!(endpoint.use_ssl());
    }

    #[test]
    fn test_invalid_bucket_rejected() {
        let mut env = minio_env();
        env[3] = (ENV_STORAGE_DEFAULT_BUCKETS, "Bad_Bucket");
        let err = StorageConfig::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(err.to_string().contains("Bad_Bucket"));

        let mut env = minio_env();
        env[3] = (ENV_STORAGE_DEFAULT_BUCKETS, " , ");
        assert!(StorageConfig::from_lookup(lookup_from(&env)).is_err());
    }

    #[test]
    fn test_local_backend_from_lookup() {
        let config = StorageConfig::from_lookup(lookup_from(&[
            (ENV_STORAGE_TYPE, "local"),
            (ENV_STORAGE_LOCAL_ROOT, "/var/lib/minilake"),
            (ENV_STORAGE_DEFAULT_BUCKETS, "lake"),
        ]))
        .unwrap();
        assert!(config.is_local());
        assert!(config.storage_options().unwrap().is_empty());

        let table = TableRef::new("sales", "lake", "delta-tables").unwrap();
        assert_eq!(
            config.table_uri(&table),
            "/var/lib/minilake/lake/delta-tables/sales"
        );
    }

    #[test]
    fn test_storage_options_for_minio() {
        let config = StorageConfig::from_lookup(lookup_from(&minio_env())).unwrap();
        let options = config.storage_options().unwrap();

        assert_eq!(options["AWS_ENDPOINT_URL"], "http://localhost:9000");
        assert_eq!(options["AWS_ALLOW_HTTP"], "true");
        assert_eq!(options["AWS_VIRTUAL_HOSTED_STYLE_REQUEST"], "false");
        assert_eq!(options["AWS_CONDITIONAL_PUT"], "etag");
        assert!(!options.contains_key("AWS_S3_ALLOW_UNSAFE_RENAME"));

        let table = TableRef::new("sales", "lake", "delta-tables").unwrap();
        assert_eq!(config.table_uri(&table), "s3://lake/delta-tables/sales");
    }

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let config = StorageConfig::s3("localhost:9000", "key", "super-secret", vec!["lake".into()]);
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_load_yaml_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("minilake.yaml");

        let yaml_content = r#"
storage:
  backend:
    type: s3
    endpoint: localhost:9000
    access_key: minioadmin
    secret_key: minioadmin
  default_buckets: [lake]
engine:
  pool_size: 8
  memory_limit: 4GB
retry:
  max_retries: 5
ingest:
  csv_delimiter: ";"
  compression: snappy
query:
  default_timeout_secs: 30
"#;
        std::fs::write(&config_path, yaml_content).unwrap();

        let config = MinilakeConfig::load_from_file(&config_path).unwrap();

        assert_eq!(config.storage.table_prefix, "delta-tables");
        assert_eq!(config.engine.pool_size, 8);
        assert_eq!(config.engine.memory_limit, "4GB");
        assert_eq!(config.engine.connection_timeout_secs, 10);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.ingest.csv_delimiter, ';');
        assert_eq!(config.ingest.compression, CompressionCodec::Snappy);
        assert_eq!(config.query.default_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.registry.path, ".minilake/registry.db");
    }

    #[test]
    fn test_load_json_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("minilake.json");

        let json_content = r#"{
            "storage": {
                "backend": { "type": "local", "root": "/data" },
                "default_buckets": ["lake"],
                "table_prefix": "tables"
            },
            "registry": { "path": ":memory:" }
        }"#;
        std::fs::write(&config_path, json_content).unwrap();

        let config = MinilakeConfig::load_from_file(&config_path).unwrap();
        assert!(config.storage.is_local());
        assert_eq!(config.storage.prefix(), "tables");
        assert_eq!(config.registry.path, ":memory:");
        assert_eq!(config.ingest, IngestSettings::default());
    }

    #[test]
    fn test_load_config_rejects_invalid_storage() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("minilake.yaml");
        std::fs::write(
            &config_path,
            "storage:\n  backend:\n    type: local\n    root: /data\n  default_buckets: []\n",
        )
        .unwrap();

        let err = MinilakeConfig::load_from_file(&config_path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = MinilakeConfig::load_from_file("/nonexistent/minilake.yaml").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
