//! Relational database adapters.
//!
//! One `Database` implementation per backend, each owning a `sqlx` pool. The pipeline only
//! sees the trait: catalogue reads for schema sync, `execute` for the executor, `ping` for
//! the startup health check.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::domain::error::{AppError, Result};
use crate::domain::query::Row;
use crate::domain::schema::SchemaRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    Postgres,
    Mysql,
    Sqlite,
}

impl DbBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(DbBackend::Postgres),
            "mysql" | "mariadb" => Some(DbBackend::Mysql),
            "sqlite" => Some(DbBackend::Sqlite),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DbBackend::Postgres => 5432,
            DbBackend::Mysql => 3306,
            DbBackend::Sqlite => 0,
        }
    }

    /// Dialect name used when prompting for SQL.
    pub fn sql_dialect(&self) -> &'static str {
        match self {
            DbBackend::Postgres => "PostgreSQL",
            DbBackend::Mysql => "MySQL",
            DbBackend::Sqlite => "SQLite",
        }
    }
}

impl fmt::Display for DbBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DbBackend::Postgres => "postgres",
            DbBackend::Mysql => "mysql",
            DbBackend::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// Pool tuning shared by all backends.
#[derive(Debug, Clone)]
pub struct DbConnectionConfig {
    /// Maximum connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Catalogue query timeout in seconds
    pub query_timeout_secs: u64,
    /// Idle timeout in seconds
    pub idle_timeout_secs: u64,
}

impl Default for DbConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout_secs: 10,
            query_timeout_secs: 30,
            idle_timeout_secs: 300,
        }
    }
}

/// Where to connect. For SQLite `database` is a file path or `:memory:`.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub backend: DbBackend,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Already resolved; never a `keychain:` / `env:` reference.
    pub password: String,
}

impl DbSettings {
    /// Connection target for log lines; never includes the password.
    pub fn describe(&self) -> String {
        match self.backend {
            DbBackend::Sqlite => format!("sqlite:{}", self.database),
            _ => format!(
                "{}://{}@{}:{}/{}",
                self.backend, self.user, self.host, self.port, self.database
            ),
        }
    }
}

/// Rows produced by one statement, in execution order.
#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows the statement produced, including those past the kept ones.
    pub total_rows: usize,
}

#[async_trait]
pub trait Database: Send + Sync {
    fn backend(&self) -> DbBackend;

    /// Base tables of the connected database, ordered by name.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns in ordinal order, with comments and primary key when the catalogue has them.
    async fn describe_table(&self, table_name: &str) -> Result<SchemaRecord>;

    /// Runs any statement, streaming its result. The first `row_limit` rows are kept and the
    /// rest only counted. Errors carry the raw database message.
    async fn fetch_rows(&self, sql: &str, row_limit: usize) -> Result<QueryRows>;

    /// Runs any statement and keeps every row.
    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        self.fetch_rows(sql, usize::MAX).await
    }

    async fn ping(&self) -> Result<()>;
}

pub async fn connect(
    settings: &DbSettings,
    config: &DbConnectionConfig,
) -> Result<Arc<dyn Database>> {
    let db: Arc<dyn Database> = match settings.backend {
        DbBackend::Postgres => Arc::new(postgres::PostgresDatabase::connect(settings, config).await?),
        DbBackend::Mysql => Arc::new(mysql::MySqlDatabase::connect(settings, config).await?),
        DbBackend::Sqlite => Arc::new(sqlite::SqliteDatabase::connect(settings, config).await?),
    };
    info!("Connected to {}", settings.describe());
    Ok(db)
}

/// Bounds a database future; both the elapsed timeout and the driver error become `DatabaseError`.
pub(crate) async fn with_timeout<T, F>(secs: u64, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .map_err(|_| AppError::DatabaseError(format!("{} timed out after {} seconds", what, secs)))?
        .map_err(|e| AppError::DatabaseError(format!("{} failed: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse_and_ports() {
        assert_eq!(DbBackend::parse("PostgreSQL"), Some(DbBackend::Postgres));
        assert_eq!(DbBackend::parse("mariadb"), Some(DbBackend::Mysql));
        assert_eq!(DbBackend::parse("oracle"), None);
        assert_eq!(DbBackend::Mysql.default_port(), 3306);
    }

    #[test]
    fn test_describe_hides_password() {
        let settings = DbSettings {
            backend: DbBackend::Mysql,
            host: "localhost".to_string(),
            port: 3306,
            database: "test_db".to_string(),
            user: "root".to_string(),
            password: "hunter2".to_string(),
        };
        let text = settings.describe();
        assert_eq!(text, "mysql://root@localhost:3306/test_db");
        assert!(!text.contains("hunter2"));
    }
}
