use super::{with_timeout, Database, DbBackend, DbConnectionConfig, DbSettings, QueryRows};
use crate::domain::error::{AppError, Result};
use crate::domain::query::Row as JsonRow;
use crate::domain::schema::{ColumnSpec, SchemaRecord};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row};
use std::time::Duration;
use tracing::error;

pub struct PostgresDatabase {
    pool: PgPool,
    config: DbConnectionConfig,
}

impl PostgresDatabase {
    pub async fn connect(settings: &DbSettings, config: &DbConnectionConfig) -> Result<Self> {
        if settings.host.trim().is_empty() {
            return Err(AppError::ValidationError(
                "PostgreSQL host is required".to_string(),
            ));
        }

        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .database(&settings.database)
            .username(&settings.user)
            .password(&settings.password);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                AppError::DatabaseError(format!("Failed to connect to PostgreSQL: {}", e))
            })?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    /// Extract a column value from a row as serde_json::Value
    fn extract_column_value(row: &PgRow, index: usize) -> Value {
        // Try different types in order of likelihood
        if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
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
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(index) {
            return v.unwrap_or(Value::Null);
        }

        // Default to null for unsupported types
        Value::Null
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn backend(&self) -> DbBackend {
        DbBackend::Postgres
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'public'
                AND table_type = 'BASE TABLE'
            ORDER BY table_name
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
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                col_description(
                    (quote_ident(c.table_schema) || '.' || quote_ident(c.table_name))::regclass,
                    c.ordinal_position::int
                ) AS column_comment,
                COALESCE(
                    EXISTS (
                        SELECT 1 FROM information_schema.table_constraints tc
                        JOIN information_schema.key_column_usage kcu
                            ON tc.constraint_name = kcu.constraint_name
                            AND tc.table_schema = kcu.table_schema
                        WHERE tc.table_schema = 'public'
                            AND tc.table_name = $1
                            AND kcu.column_name = c.column_name
                            AND tc.constraint_type = 'PRIMARY KEY'
                    ),
                    false
                ) AS is_primary_key
            FROM information_schema.columns c
            WHERE c.table_schema = 'public' AND c.table_name = $1
            ORDER BY c.ordinal_position
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
            let data_type: String = row.try_get("data_type").map_err(|e| {
                AppError::DatabaseError(format!("Failed to parse data_type: {}", e))
            })?;
            let comment: Option<String> = row.try_get("column_comment").unwrap_or(None);
            let is_primary_key: bool = row.try_get("is_primary_key").unwrap_or(false);

            if is_primary_key {
                primary_keys.push(column_name.clone());
            }
            columns.push(
                ColumnSpec::new(&column_name, &data_type)
                    .with_comment(comment.as_deref().unwrap_or("")),
            );
        }

        let table_comment: Option<String> = with_timeout(
            self.config.query_timeout_secs,
            "Table comment",
            sqlx::query_scalar::<_, Option<String>>(
                "SELECT obj_description(('public.' || quote_ident($1))::regclass, 'pg_class')",
            )
            .bind(table_name)
            .fetch_one(&self.pool),
        )
        .await
        .unwrap_or(None);

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
            sqlx::query("SELECT 1 as health_check").fetch_one(&self.pool),
        )
        .await
        .map(|_| ())
    }
}
