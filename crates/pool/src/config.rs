//! Pool and backend configuration, loaded once at process start.

use std::fmt;
use std::time::Duration;

use driver::PgBackend;
use tracing::debug;

use crate::ConfigError;

pub const DEFAULT_MAX_SIZE: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PORT: u16 = 5432;

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// Sizing and timeout knobs for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live sessions (idle + checked out).
    pub max_size: usize,
    /// Idle sessions older than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// Default deadline for `acquire`.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    pub fn new(max_size: usize) -> Self {
        Self { max_size, ..Default::default() }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::PoolSize);
        }
        Ok(())
    }

    /// How often the reaper wakes: half the idle timeout, kept within 10ms..1s.
    pub fn reap_interval(&self) -> Duration {
        (self.idle_timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    /// How long a session sits idle between health checks.  Half the idle
    /// timeout, so an unused session is pinged about once before it expires.
    pub fn health_check_interval(&self) -> Duration {
        self.idle_timeout / 2
    }
}

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

/// Address and credentials of the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DatabaseConfig {
    /// PostgreSQL backend for these parameters.
    pub fn backend(&self) -> PgBackend {
        PgBackend::from_parts(&self.host, self.port, &self.user, &self.password, &self.database)
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything needed to build a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
}

impl Settings {
    /// Load `.env` from the working directory (if any), then read
    /// `PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD`, `PGDATABASE` and the
    /// optional `PGPOOL_*` overrides from the process environment.
    ///
    /// # Errors
    /// [`ConfigError::Missing`] lists every required variable that is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => debug!("ignoring unreadable .env file: {e}"),
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Parse settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut required = |name: &'static str| match lookup(name) {
            Some(value) if !value.is_empty() => value,
            _ => {
                missing.push(name);
                String::new()
            }
        };

        let host = required("PGHOST");
        let user = required("PGUSER");
        let password = required("PGPASSWORD");
        let database = required("PGDATABASE");
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port = parse_var(&lookup, "PGPORT")?.unwrap_or(DEFAULT_PORT);

        let mut pool = PoolConfig::default();
        if let Some(max_size) = parse_var(&lookup, "PGPOOL_MAX_SIZE")? {
            pool.max_size = max_size;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PGPOOL_IDLE_TIMEOUT_MS")? {
            pool.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PGPOOL_CONNECT_TIMEOUT_MS")? {
            pool.connect_timeout = Duration::from_millis(ms);
        }
        pool.validate()?;

        Ok(Self {
            database: DatabaseConfig { host, port, user, password, database },
            pool,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
