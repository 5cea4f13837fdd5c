use super::{with_timeout, Database, DbBackend, DbConnectionConfig, DbSettings, QueryRows};
use crate::domain::error::{AppError, Result};
use crate::domain::query::Row as JsonRow;
use crate::domain::schema::{ColumnSpec, SchemaRecord};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::str::FromStr;
use std::time::Duration;

pub struct SqliteDatabase {
    pool: SqlitePool,
    config: DbConnectionConfig,
}

impl SqliteDatabase {
    pub async fn connect(settings: &DbSettings, config: &DbConnectionConfig) -> Result<Self> {
        let in_memory = settings.database.is_empty() || settings.database == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}", settings.database.replace('\\', "/"))
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to parse connection string: {}", e))
            })?
            .create_if_missing(true);

        // An in-memory database lives and dies with its only connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {}", e)))?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    fn extract_column_value(row: &SqliteRow, index: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
            return v.map(|b| Value::String(hex::encode(b))).unwrap_or(Value::Null);
        }
        Value::Null
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn backend(&self) -> DbBackend {
        DbBackend::Sqlite
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let names: Vec<String> = with_timeout(
            self.config.query_timeout_secs,
            "Table listing",
            sqlx::query_scalar::<_, String>(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(names)
    }

    async fn describe_table(&self, table_name: &str) -> Result<SchemaRecord> {
        let rows = with_timeout(
            self.config.query_timeout_secs,
            "Column listing",
            sqlx::query("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")
                .bind(table_name)
                .fetch_all(&self.pool),
        )
        .await?;

        if rows.is_empty() {
            return Err(AppError::NotFound(format!("Table '{}' not found", table_name)));
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut keyed: Vec<(i64, String)> = Vec::new();
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| {
                AppError::DatabaseError(format!("Failed to parse column name: {}", e))
            })?;
            let data_type: String = row.try_get("type").unwrap_or_default();
            let pk: i64 = row.try_get("pk").unwrap_or(0);
            if pk > 0 {
                keyed.push((pk, name.clone()));
            }
            columns.push(ColumnSpec::new(&name, &data_type));
        }
        keyed.sort_by_key(|(position, _)| *position);

        let mut record = SchemaRecord::new(table_name, columns);
        record.primary_keys = keyed.into_iter().map(|(_, name)| name).collect();
        Ok(record)
    }

    async fn fetch_rows(&self, sql: &str, row_limit: usize) -> Result<QueryRows> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);

        let mut out = QueryRows::default();
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?
        {
            out.total_rows += 1;
            if out.columns.is_empty() {
                out.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            if out.rows.len() >= row_limit {
                continue;
            }
            let mut map = JsonRow::new();
            for (i, column) in row.columns().iter().enumerate() {
                map.insert(column.name().to_string(), Self::extract_column_value(&row, i));
            }
            out.rows.push(map);
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        with_timeout(
            self.config.connect_timeout_secs,
            "Health check",
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) async fn memory_database() -> SqliteDatabase {
    let settings = DbSettings {
        backend: DbBackend::Sqlite,
        host: String::new(),
        port: 0,
        database: ":memory:".to_string(),
        user: String::new(),
        password: String::new(),
    };
    SqliteDatabase::connect(&settings, &DbConnectionConfig::default())
        .await
        .unwrap()
}
