//! Storage session management
//!
//! [`ConnectionManager::get_connection`] resolves a [`StorageConfig`], opens
//! the embedded DuckDB instance, registers the object store with it and
//! verifies the default buckets are reachable. The resulting
//! [`ConnectionHandle`] is cheap to clone and is shared by ingestion and
//! query execution for the lifetime of the process.
//!
//! Re-acquiring a connection returns the same session. Reconfiguring storage
//! while a session is open is refused; it requires a new process (or a new
//! manager).

use crate::pool::{checkout, create_duckdb_pool, open_database, DuckDBPool, PooledDuckDBConnection};
use crate::sql::quote_literal;
use minilake_core::config::StorageBackend;
use minilake_core::{
    retry_async, EngineConfig, Error, MinilakeConfig, Result, RetryPolicy, StorageConfig,
    TableRef,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Once};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const DUCKDB_SECRET_NAME: &str = "minilake_s3";

static REGISTER_S3_HANDLERS: Once = Once::new();

struct Session {
    config: StorageConfig,
    storage_options: HashMap<String, String>,
    pool: DuckDBPool,
}

/// Shared handle to an open storage session
#[derive(Clone)]
pub struct ConnectionHandle {
    session: Arc<Session>,
}

impl ConnectionHandle {
    fn open(config: StorageConfig, engine: &EngineConfig) -> Result<Self> {
        let storage_options = config.storage_options()?;

        let (database, setup) = open_database(engine)?;
        if let StorageBackend::S3(s3) = &config.backend {
            let endpoint = s3.parse_endpoint()?;
            let statements = format!(
                "INSTALL httpfs;\nLOAD httpfs;\n\
                 CREATE OR REPLACE SECRET {} (\n\
                     TYPE S3,\n\
                     KEY_ID {},\n\
                     SECRET {},\n\
                     ENDPOINT {},\n\
                     URL_STYLE {},\n\
                     USE_SSL {},\n\
                     REGION {}\n\
                 );",
                DUCKDB_SECRET_NAME,
                quote_literal(&s3.access_key),
                quote_literal(&s3.secret_key),
                quote_literal(&endpoint.authority()),
                quote_literal(if s3.path_style { "path" } else { "vhost" }),
                endpoint.use_ssl(),
                quote_literal(&s3.region),
            );
            setup.execute_batch(&statements).map_err(|e| {
                Error::connection(format!(
                    "failed to register storage endpoint {} with the query engine: {}",
                    endpoint.url(),
                    e
                ))
            })?;
            debug!("Registered S3 endpoint {} as DuckDB secret", endpoint.url());
        }

        let pool = create_duckdb_pool(database, engine)?;

        Ok(Self {
            session: Arc::new(Session {
                config,
                storage_options,
                pool,
            }),
        })
    }

    /// Check that every default bucket is reachable with the configured credentials
    fn check_reachable(&self) -> Result<()> {
        let config = &self.session.config;
        match &config.backend {
            StorageBackend::Local { .. } => {
                for bucket in &config.default_buckets {
                    let path = config.bucket_uri(bucket);
                    std::fs::create_dir_all(&path).map_err(|e| {
                        Error::connection(format!("storage location {} is not writable: {}", path, e))
                    })?;
                }
            }
            StorageBackend::S3(_) => {
                let conn = self.connection()?;
                for bucket in &config.default_buckets {
                    let pattern = format!("{}/*", config.bucket_uri(bucket));
                    conn.execute_batch(&format!(
                        "SELECT count(*) FROM glob({})",
                        quote_literal(&pattern)
                    ))
                    .map_err(|e| {
                        Error::connection(format!("bucket '{}' is not reachable: {}", bucket, e))
                    })?;
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.session.config
    }

    /// Object store options handed to delta-rs
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.session.storage_options
    }

    pub fn pool(&self) -> &DuckDBPool {
        &self.session.pool
    }

    /// Check out a DuckDB connection bound to this session
    pub fn connection(&self) -> Result<PooledDuckDBConnection> {
        checkout(&self.session.pool)
    }

    /// Root URI of a table under this session's storage
    pub fn table_uri(&self, table: &TableRef) -> String {
        self.session.config.table_uri(table)
    }

    /// Reference for `name` in the primary bucket under the configured prefix
    pub fn default_table_ref(&self, name: &str) -> Result<TableRef> {
        let config = &self.session.config;
        TableRef::new(name, config.primary_bucket()?, config.prefix())
    }

    /// Whether two handles share the same underlying session
    pub fn same_session(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("config", &self.session.config)
            .field("pool_size", &self.session.pool.max_size())
            .finish()
    }
}

/// Owns the process-wide storage session
pub struct ConnectionManager {
    engine: EngineConfig,
    retry: RetryPolicy,
    default_config: Option<StorageConfig>,
    session: AsyncMutex<Option<ConnectionHandle>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            retry: RetryPolicy::default(),
            default_config: None,
            session: AsyncMutex::new(None),
        }
    }

    /// Manager whose default storage comes from a configuration file instead of the environment
    pub fn from_config(config: &MinilakeConfig) -> Self {
        Self {
            engine: config.engine.clone(),
            retry: config.retry.clone(),
            default_config: Some(config.storage.clone()),
            session: AsyncMutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Return the session, opening it on first use
    ///
    /// With `config` omitted the storage settings come from the manager's
    /// configuration file, or else the `STORAGE_*` environment variables.
    /// Once a session exists, omitting `config` or passing an equal one
    /// returns it; a different configuration is a [`Error::Configuration`].
    pub async fn get_connection(&self, config: Option<StorageConfig>) -> Result<ConnectionHandle> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.as_ref() {
            return match config {
                Some(requested) if &requested != existing.config() => {
                    warn!("Refusing to reconfigure an open storage session");
                    Err(Error::config(
                        "a storage session with a different configuration is already open; \
                         reconfiguring storage requires a restart",
                    ))
                }
                _ => {
                    debug!("Reusing open storage session");
                    Ok(existing.clone())
                }
            };
        }

        let config = match config.or_else(|| self.default_config.clone()) {
            Some(config) => config,
            None => StorageConfig::from_env()?,
        };
        config.validate()?;

        if !config.is_local() {
            REGISTER_S3_HANDLERS.call_once(|| deltalake::aws::register_handlers(None));
        }

        let engine = self.engine.clone();
        let opening = config.clone();
        let handle =
            tokio::task::spawn_blocking(move || ConnectionHandle::open(opening, &engine)).await??;

        let reachable = handle.clone();
        check_storage(&self.retry, move || reachable.check_reachable()).await?;

        info!(
            "Opened storage session: {} bucket(s), prefix '{}', {}",
            config.default_buckets.len(),
            config.prefix(),
            if config.is_local() { "local" } else { "s3" }
        );

        *session = Some(handle.clone());
        Ok(handle)
    }

    /// The open session, if any
    pub async fn current(&self) -> Option<ConnectionHandle> {
        self.session.lock().await.clone()
    }
}

/// Diagnostics of an object store that rejected the credentials
const AUTH_REJECTIONS: &[&str] = &[
    "http 401",
    "http 403",
    "unauthorized",
    "forbidden",
    "access denied",
    "accessdenied",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
];

fn is_auth_rejection(err: &Error) -> bool {
    let Error::Connection(diagnostic) = err else {
        return false;
    };
    let diagnostic = diagnostic.to_lowercase();
    AUTH_REJECTIONS.iter().any(|marker| diagnostic.contains(marker))
}

/// Check the storage is reachable, retrying transient failures but not rejected credentials
async fn check_storage<F>(retry: &RetryPolicy, check: F) -> Result<()>
where
    F: Fn() -> Result<()> + Clone + Send + 'static,
{
    let outcome = retry_async(retry, "storage check", || {
        let check = check.clone();
        async move {
            match tokio::task::spawn_blocking(check).await? {
                Err(err) if is_auth_rejection(&err) => Ok(Err(err)),
                other => other.map(Ok),
            }
        }
    })
    .await?;

    if let Err(err) = &outcome {
        warn!("Storage rejected the configured credentials: {}", err);
    }
    outcome
}
