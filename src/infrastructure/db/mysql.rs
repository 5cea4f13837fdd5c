use super::{with_timeout, Database, DbBackend, DbConnectionConfig, DbSettings, QueryRows};
use crate::domain::error::{AppError, Result};
use crate::domain::query::Row as JsonRow;
use crate::domain::schema::{ColumnSpec, SchemaRecord};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};
use std::time::Duration;
use tracing::error;

pub struct MySqlDatabase {
    pool: MySqlPool,
    config: DbConnectionConfig,
}

impl MySqlDatabase {
    pub async fn connect(settings: &DbSettings, config: &DbConnectionConfig) -> Result<Self> {
        if settings.host.trim().is_empty() {
            return Err(AppError::ValidationError("MySQL host is required".to_string()));
        }

        let mut options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .database(&settings.database)
            .username(&settings.user)
            .charset("utf8mb4");
        if !settings.password.is_empty() {
            options = options.password(&settings.password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to MySQL: {}", e);
                AppError::DatabaseError(format!("Failed to connect to MySQL: {}", e))
            })?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    fn extract_column_value(row: &MySqlRow, index: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
            return v
                .and_then(|n| serde_json::Number::from_f64(n as f64))
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bigdecimal::BigDecimal>, _>(index) {
            return v
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
            return v
                .map(|dt| Value::String(dt.to_rfc3339()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
            return v
                .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
            return v
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
            return v
                .map(|b| match String::from_utf8(b) {
                    Ok(text) => Value::String(text),
                    Err(raw) => Value::String(hex::encode(raw.into_bytes())),
                })
                .unwrap_or(Value::Null);
        }
        Value::Null
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    fn backend(&self) -> DbBackend {
        DbBackend::Mysql
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR) AS table_name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
                AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        with_timeout(
            self.config.query_timeout_secs,
            "Table listing",
            sqlx::query_scalar::<_, String>(query).fetch_all(&self.pool),
        )
        .await
    }

    async fn describe_table(&self, table_name: &str) -> Result<SchemaRecord> {
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(COLUMN_TYPE AS CHAR) AS column_type,
                CAST(COLUMN_COMMENT AS CHAR) AS column_comment,
                CAST(COLUMN_KEY AS CHAR) AS column_key
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows = with_timeout(
            self.config.query_timeout_secs,
            "Column listing",
            sqlx::query(query).bind(table_name).fetch_all(&self.pool),
        )
        .await?;

        if rows.is_empty() {
            return Err(AppError::NotFound(format!("Table '{}' not found", table_name)));
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut primary_keys = Vec::new();
        for row in rows {
            let column_name: String = row.try_get("column_name").map_err(|e| {
                AppError::DatabaseError(format!("Failed to parse column_name: {}", e))
            })?;
            let column_type: String = row.try_get("column_type").unwrap_or_default();
            let comment: Option<String> = row.try_get("column_comment").unwrap_or(None);
            let key: Option<String> = row.try_get("column_key").unwrap_or(None);

            if key.as_deref() == Some("PRI") {
                primary_keys.push(column_name.clone());
            }
            columns.push(
                ColumnSpec::new(&column_name, &column_type)
                    .with_comment(comment.as_deref().unwrap_or("")),
            );
        }

        let table_comment: Option<String> = with_timeout(
            self.config.query_timeout_secs,
            "Table comment",
            sqlx::query_scalar::<_, Option<String>>(
                "SELECT CAST(TABLE_COMMENT AS CHAR) FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
            )
            .bind(table_name)
            .fetch_optional(&self.pool),
        )
        .await
        .ok()
        .flatten()
        .flatten();

        let mut record = SchemaRecord::new(table_name, columns);
        record.primary_keys = primary_keys;
        if let Some(comment) = table_comment.filter(|c| !c.trim().is_empty()) {
            record.description = comment;
        }
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
            sqlx::query("SELECT 1").fetch_one(&self.pool),
        )
        .await
        .map(|_| ())
    }
}
