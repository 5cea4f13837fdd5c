use crate::domain::query::ExecutionResult;
use crate::infrastructure::db::{Database, DbBackend};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Runs a final SQL candidate. Every failure, timeouts included, comes back as an
/// unsuccessful `ExecutionResult` rather than an error.
pub struct SqlExecutor {
    db: Arc<dyn Database>,
    row_limit: usize,
    timeout: Duration,
}

impl SqlExecutor {
    pub fn new(db: Arc<dyn Database>, row_limit: usize, timeout: Duration) -> Self {
        Self {
            db,
            row_limit,
            timeout,
        }
    }

    /// The backend whose SQL grammar candidates are validated against.
    pub fn backend(&self) -> DbBackend {
        self.db.backend()
    }

    pub async fn execute(&self, sql: &str) -> ExecutionResult {
        let start = Instant::now();

        match tokio::time::timeout(self.timeout, self.db.fetch_rows(sql, self.row_limit)).await {
            Ok(Ok(rows)) => {
                let result = ExecutionResult::from_rows(rows.columns, rows.rows, rows.total_rows);
                info!(
                    "SQL executed on {} in {}ms: {} row(s){}",
                    self.db.backend(),
                    start.elapsed().as_millis(),
                    result.total_rows.unwrap_or(result.row_count),
                    if result.truncated {
                        format!(", truncated to {}", result.row_count)
                    } else {
                        String::new()
                    }
                );
                result
            }
            Ok(Err(e)) => {
                warn!("SQL execution failed: {}", e);
                ExecutionResult::failure(e.to_string())
            }
            Err(_) => {
                warn!("SQL execution timed out after {:?}", self.timeout);
                ExecutionResult::failure(format!("Query timed out after {:?}", self.timeout))
            }
        }
    }
}
