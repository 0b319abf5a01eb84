//! Database plumbing shared by the reservation, blacklist and device stores.
//!
//! All stores talk to one [`AnyPool`]. SQLite and MySQL are supported; the
//! statements use `?` placeholders, which rules out PostgreSQL.
//!
//! On MySQL the DHCP daemon owns the `hosts`, `dhcp4_options` and `lease4`
//! tables and only the application tables are created here. On SQLite
//! (standalone use and tests) the daemon tables are created as well, with the
//! same column names, encodings and unique keys.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Text form of the lease `expire` column (UTC).
pub const EXPIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQL dialect behind the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    MySql,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(Error::InvalidConfig(format!(
                "unsupported database scheme '{}' (expected sqlite or mysql)",
                other
            ))),
        }
    }
}

/// How hardware addresses are stored in the daemon's identifier columns.
///
/// The daemon's MySQL schema keeps `hosts.dhcp_identifier`, `lease4.hwaddr`
/// and `lease4.client_id` as `VARBINARY`, so the MAC has to arrive as raw
/// octets. The SQLite tables created by [`init_schema`] hold the hex text.
/// Either way the value is bound as hex text and read back as hex text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacEncoding {
    Hex,
    Bytes,
}

impl MacEncoding {
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Sqlite => Self::Hex,
            Backend::MySql => Self::Bytes,
        }
    }

    /// Encoding used by the database behind `pool`.
    ///
    /// Only the SQLite and MySQL drivers are installed, so any other scheme
    /// could not have produced a pool.
    pub fn for_pool(pool: &AnyPool) -> Self {
        let options = pool.connect_options();
        match Backend::from_url(options.database_url.as_str()) {
            Ok(backend) => Self::for_backend(backend),
            Err(_) => Self::Hex,
        }
    }

    /// Placeholder for a MAC (or client id) bound as hex text.
    pub fn param(&self) -> &'static str {
        match self {
            Self::Hex => "?",
            Self::Bytes => "UNHEX(?)",
        }
    }

    /// Select expression returning `column` as hex text under its own name.
    pub fn select(&self, column: &str) -> String {
        match self {
            Self::Hex => column.to_string(),
            Self::Bytes => format!("HEX({0}) AS {0}", column),
        }
    }
}

/// Opens a connection pool for `url`.
///
/// Idle connections are never reaped so that an in-memory SQLite database
/// survives for the life of the pool.
pub async fn connect(url: &str, max_connections: u32) -> Result<AnyPool> {
    install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(url)
        .await?;

    Ok(pool)
}

/// Creates the tables this crate needs if they do not exist yet.
pub async fn init_schema(pool: &AnyPool, backend: Backend) -> Result<()> {
    let statements: &[&str] = match backend {
        Backend::Sqlite => SQLITE_SCHEMA,
        Backend::MySql => MYSQL_SCHEMA,
    };

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    info!(?backend, "database schema ready");
    Ok(())
}

/// Runs a store operation under a deadline.
///
/// A timed-out operation is reported as [`Error::Timeout`]; its transaction
/// is dropped and rolled back, so nothing is assumed committed.
pub async fn bounded<T, F>(timeout: Duration, operation: &'static str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "store operation timed out");
            Err(Error::Timeout(operation))
        }
    }
}

/// True when the driver rejected a write because of a unique key.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(database_error) => database_error.is_unique_violation(),
        _ => false,
    }
}

/// Column form of an IPv4 address: the unsigned 32-bit value.
pub fn ip_to_int(ip: Ipv4Addr) -> i64 {
    i64::from(u32::from(ip))
}

pub fn ip_from_int(value: i64) -> Ipv4Addr {
    Ipv4Addr::from(value as u32)
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(EXPIRE_FORMAT).to_string()
}

pub fn parse_rfc3339(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| Error::Database(sqlx::Error::Decode(Box::new(error))))
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        host_id INTEGER PRIMARY KEY AUTOINCREMENT,
        dhcp_identifier TEXT NOT NULL,
        dhcp_identifier_type INTEGER NOT NULL DEFAULT 0,
        dhcp4_subnet_id INTEGER,
        ipv4_address INTEGER,
        hostname TEXT
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS key_dhcp4_ipv4_address_subnet_id ON hosts(ipv4_address, dhcp4_subnet_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS key_dhcp4_identifier_subnet_id ON hosts(dhcp_identifier, dhcp_identifier_type, dhcp4_subnet_id)",
    r#"
    CREATE TABLE IF NOT EXISTS dhcp4_options (
        option_id INTEGER PRIMARY KEY AUTOINCREMENT,
        code INTEGER NOT NULL,
        value BLOB,
        formatted_value TEXT,
        space TEXT,
        persistent INTEGER NOT NULL DEFAULT 0,
        host_id INTEGER,
        scope_id INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fk_options_host ON dhcp4_options(host_id)",
    r#"
    CREATE TABLE IF NOT EXISTS lease4 (
        address INTEGER PRIMARY KEY NOT NULL,
        hwaddr TEXT,
        client_id TEXT,
        valid_lifetime INTEGER,
        expire TEXT,
        subnet_id INTEGER,
        fqdn_fwd INTEGER,
        fqdn_rev INTEGER,
        hostname TEXT,
        state INTEGER DEFAULT 0,
        user_context TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS lease4_by_hwaddr ON lease4(hwaddr)",
    "CREATE INDEX IF NOT EXISTS lease4_by_expire ON lease4(expire)",
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mac TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        assigned_ip INTEGER UNIQUE,
        is_active INTEGER NOT NULL DEFAULT 1,
        owner TEXT NOT NULL,
        role TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_access TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blacklisted_ips (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip_address TEXT NOT NULL UNIQUE,
        reason TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        mac VARCHAR(12) NOT NULL UNIQUE,
        name VARCHAR(255) NOT NULL,
        assigned_ip BIGINT NULL UNIQUE,
        is_active BIGINT NOT NULL DEFAULT 1,
        owner VARCHAR(255) NOT NULL,
        role VARCHAR(16) NOT NULL,
        created_at VARCHAR(40) NOT NULL,
        last_access VARCHAR(40) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blacklisted_ips (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        ip_address VARCHAR(15) NOT NULL UNIQUE,
        reason TEXT NOT NULL,
        created_at VARCHAR(40) NOT NULL,
        updated_at VARCHAR(40) NOT NULL
    )
    "#,
];

#[cfg(test)]
pub(crate) async fn memory_pool() -> AnyPool {
    let pool = connect("sqlite::memory:", 1).await.unwrap();
    init_schema(&pool, Backend::Sqlite).await.unwrap();
    pool
}
