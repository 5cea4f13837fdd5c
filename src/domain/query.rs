use super::schema::SchemaRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// One result row, column name → decoded value, in select-list order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingKind {
    SyntaxError,
    UnknownTable,
    UnknownColumn,
    SemanticWarning,
}

impl FindingKind {
    /// Blocking findings drive the repair loop; warnings only inform.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, FindingKind::SemanticWarning)
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FindingKind::SyntaxError => "syntax error",
            FindingKind::UnknownTable => "unknown table",
            FindingKind::UnknownColumn => "unknown column",
            FindingKind::SemanticWarning => "warning",
        };
        f.write_str(label)
    }
}

/// A single structured validation complaint about a SQL candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub message: String,
    pub location_hint: Option<String>,
}

impl Finding {
    pub fn new(kind: FindingKind, message: impl Into<String>, location_hint: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location_hint,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.kind.is_blocking()
    }
}

pub fn has_blocking(findings: &[Finding]) -> bool {
    findings.iter().any(Finding::is_blocking)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: SchemaRecord,
    pub similarity_score: f32,
}

/// Schema records retrieved for one user query, ordered by non-increasing similarity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    entries: Vec<ScoredRecord>,
}

impl RetrievedContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Clamps every score into [0,1] and stable-sorts descending, so equal scores keep the
    /// order in which they were supplied.
    pub fn from_scored(mut entries: Vec<ScoredRecord>) -> Self {
        for entry in &mut entries {
            entry.similarity_score = clamp_score(entry.similarity_score);
        }
        entries.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[ScoredRecord] {
        &self.entries
    }

    pub fn records(&self) -> impl Iterator<Item = &SchemaRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// One repair attempt. Appended to the history and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    pub iteration: u32,
    pub sql: String,
    pub findings: Vec<Finding>,
    /// Absent when the generator failed to produce a replacement.
    pub repaired_sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Pending,
    Validated,
    Executed,
    FailedTerminal,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Executed | QueryStatus::FailedTerminal)
    }
}

/// Per-request aggregate, exclusively owned by one orchestrator run.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub query_id: Uuid,
    pub user_query: String,
    pub context: RetrievedContext,
    pub current_sql: String,
    pub retrieval_degraded: bool,
    iteration_count: u32,
    history: Vec<DebugEntry>,
    status: QueryStatus,
}

impl QueryState {
    pub fn new(user_query: &str) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            user_query: user_query.to_string(),
            context: RetrievedContext::empty(),
            current_sql: String::new(),
            retrieval_degraded: false,
            iteration_count: 0,
            history: Vec::new(),
            status: QueryStatus::Pending,
        }
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn history(&self) -> &[DebugEntry] {
        &self.history
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Appends a repair attempt and advances the iteration counter. When a replacement was
    /// produced it becomes the current candidate.
    pub fn record_repair(&mut self, findings: Vec<Finding>, repaired_sql: Option<String>) {
        self.iteration_count += 1;
        let entry = DebugEntry {
            iteration: self.iteration_count,
            sql: self.current_sql.clone(),
            findings,
            repaired_sql: repaired_sql.clone(),
        };
        self.history.push(entry);
        if let Some(sql) = repaired_sql {
            self.current_sql = sql;
        }
    }

    /// Moves to `next` unless a terminal status was already reached. Returns whether the
    /// status changed.
    pub fn set_status(&mut self, next: QueryStatus) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                query_id = %self.query_id,
                "Ignoring status change {:?} -> {:?} after terminal state",
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        true
    }
}

/// Terminal artifact of the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub columns: Vec<String>,
    pub rows: Option<Vec<Row>>,
    /// Number of rows returned to the caller (the limit when truncated).
    pub row_count: usize,
    /// Rows the statement actually produced, when known.
    pub total_rows: Option<usize>,
    #[serde(default)]
    pub truncated: bool,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// `rows` are the kept prefix, in execution order, of the `total` rows produced.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>, total: usize) -> Self {
        let total = total.max(rows.len());
        let truncated = total > rows.len();
        Self {
            success: true,
            columns,
            row_count: rows.len(),
            rows: Some(rows),
            total_rows: Some(total),
            truncated,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            columns: Vec::new(),
            rows: None,
            row_count: 0,
            total_rows: None,
            truncated: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineErrorKind {
    GenerationUnavailable,
    ExecutionFailure,
}

/// Structured error attached to a failed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: PipelineErrorKind,
    pub message: String,
    /// SQL that caused the failure, if one had been produced.
    pub sql: Option<String>,
}

/// Caller-visible result of one natural-language query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub query_id: Uuid,
    pub user_query: String,
    pub success: bool,
    pub status: QueryStatus,
    pub sql: String,
    /// The statement ran although validation still reported blocking findings.
    pub forced: bool,
    pub retrieval_degraded: bool,
    pub result: Option<ExecutionResult>,
    pub error: Option<PipelineError>,
    pub residual_findings: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub debug_history: Vec<DebugEntry>,
}
