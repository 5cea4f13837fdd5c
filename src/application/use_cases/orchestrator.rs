//! The query pipeline: retrieve → generate → validate → (repair → validate)* → execute.
//!
//! The transition policy lives in [`next_phase`], a pure function over `(phase, signal)`.
//! [`Orchestrator::run`] only performs the side effect of the current phase, turns its result
//! into a [`Signal`] and asks the policy where to go next. Each run owns its `QueryState`, so
//! one orchestrator can serve concurrent queries.

use crate::application::use_cases::repairer::build_repair_directive;
use crate::application::use_cases::retriever::Retriever;
use crate::application::use_cases::schema_store::SchemaStore;
use crate::application::use_cases::sql_executor::SqlExecutor;
use crate::application::use_cases::sql_generator::SqlGenerator;
use crate::application::use_cases::sql_validator::validate;
use crate::domain::error::Result;
use crate::domain::query::{
    has_blocking, ExecutionResult, Finding, PipelineError, PipelineErrorKind, QueryOutcome,
    QueryState, QueryStatus, RetrievedContext,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Validating,
    Repairing,
    Executing,
    Executed,
    FailedTerminal,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Executed | Phase::FailedTerminal)
    }
}

/// Outcome of the side effect performed in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Generated,
    GenerationFailed,
    Valid,
    BlockingFindings {
        iteration_count: u32,
        max_iterations: u32,
    },
    ExecutionSucceeded,
    ExecutionFailed,
}

/// Transition policy of the debug loop. `None` marks a pair that cannot occur.
pub fn next_phase(phase: Phase, signal: Signal) -> Option<Phase> {
    match (phase, signal) {
        (Phase::Pending | Phase::Repairing, Signal::Generated) => Some(Phase::Validating),
        (Phase::Pending | Phase::Repairing, Signal::GenerationFailed) => Some(Phase::FailedTerminal),
        (Phase::Validating, Signal::Valid) => Some(Phase::Executing),
        (
            Phase::Validating,
            Signal::BlockingFindings {
                iteration_count,
                max_iterations,
            },
        ) => {
            if iteration_count < max_iterations {
                Some(Phase::Repairing)
            } else {
                // Budget exhausted: run it anyway, flagged as forced.
                Some(Phase::Executing)
            }
        }
        (Phase::Executing, Signal::ExecutionSucceeded) => Some(Phase::Executed),
        (Phase::Executing, Signal::ExecutionFailed) => Some(Phase::FailedTerminal),
        _ => None,
    }
}

pub struct Orchestrator {
    retriever: Retriever,
    generator: SqlGenerator,
    executor: SqlExecutor,
    store: Arc<SchemaStore>,
    top_k: usize,
    max_iterations: u32,
}

impl Orchestrator {
    pub fn new(
        retriever: Retriever,
        generator: SqlGenerator,
        executor: SqlExecutor,
        store: Arc<SchemaStore>,
        top_k: usize,
        max_iterations: u32,
    ) -> Self {
        Self {
            retriever,
            generator,
            executor,
            store,
            top_k,
            max_iterations,
        }
    }

    /// Answers one natural-language question.
    ///
    /// Every pipeline failure ends up inside the returned outcome. Only a `ConfigurationError`
    /// (such as an embedding dimension mismatch) is returned as `Err`.
    pub async fn run(&self, user_query: &str) -> Result<QueryOutcome> {
        let mut state = QueryState::new(user_query);
        let query_id = state.query_id;
        info!(%query_id, "Query received: {}", user_query);

        match self.retriever.retrieve(user_query, self.top_k).await {
            Ok(context) => state.context = context,
            Err(e) if e.is_fatal_configuration() => return Err(e),
            Err(e) => {
                warn!(%query_id, "Retrieval degraded, continuing without schema context: {}", e);
                state.context = RetrievedContext::empty();
                state.retrieval_degraded = true;
            }
        }

        // One snapshot for the whole query; a concurrent re-sync does not change it.
        let schema = self.store.snapshot();

        let mut phase = Phase::Pending;
        let mut findings: Vec<Finding> = Vec::new();
        let mut forced = false;
        let mut result: Option<ExecutionResult> = None;
        let mut failure: Option<PipelineError> = None;

        while !phase.is_terminal() {
            let signal = match phase {
                Phase::Pending => {
                    match self
                        .generator
                        .generate(user_query, &state.context, None)
                        .await
                    {
                        Ok(sql) => {
                            state.current_sql = sql;
                            Signal::Generated
                        }
                        Err(e) => {
                            failure = Some(generation_failure(e.to_string(), None));
                            Signal::GenerationFailed
                        }
                    }
                }
                Phase::Validating => {
                    findings = validate(&state.current_sql, &schema, self.executor.backend());
                    if has_blocking(&findings) {
                        Signal::BlockingFindings {
                            iteration_count: state.iteration_count(),
                            max_iterations: self.max_iterations,
                        }
                    } else {
                        Signal::Valid
                    }
                }
                Phase::Repairing => {
                    let directive =
                        build_repair_directive(&state.current_sql, &findings, state.history());
                    match self
                        .generator
                        .generate(user_query, &state.context, Some(&directive))
                        .await
                    {
                        Ok(sql) => {
                            state.record_repair(findings.clone(), Some(sql));
                            Signal::Generated
                        }
                        Err(e) => {
                            state.record_repair(findings.clone(), None);
                            failure = Some(generation_failure(
                                e.to_string(),
                                Some(state.current_sql.clone()),
                            ));
                            Signal::GenerationFailed
                        }
                    }
                }
                Phase::Executing => {
                    let outcome = self.executor.execute(&state.current_sql).await;
                    let signal = if outcome.success {
                        Signal::ExecutionSucceeded
                    } else {
                        failure = Some(PipelineError {
                            kind: PipelineErrorKind::ExecutionFailure,
                            message: outcome.error.clone().unwrap_or_default(),
                            sql: Some(state.current_sql.clone()),
                        });
                        Signal::ExecutionFailed
                    };
                    result = Some(outcome);
                    signal
                }
                Phase::Executed | Phase::FailedTerminal => break,
            };

            let Some(next) = next_phase(phase, signal) else {
                error!(%query_id, "No transition from {:?} on {:?}", phase, signal);
                failure.get_or_insert_with(|| {
                    generation_failure(
                        format!("Pipeline stopped in {:?}", phase),
                        Some(state.current_sql.clone()),
                    )
                });
                phase = Phase::FailedTerminal;
                break;
            };

            if phase == Phase::Validating && next == Phase::Executing {
                if has_blocking(&findings) {
                    forced = true;
                    warn!(
                        %query_id,
                        "Repair budget of {} exhausted, forcing execution with {} blocking finding(s)",
                        self.max_iterations,
                        findings.iter().filter(|f| f.is_blocking()).count()
                    );
                }
                state.set_status(QueryStatus::Validated);
            }

            info!(
                %query_id,
                iteration = state.iteration_count(),
                "{:?} -> {:?}",
                phase,
                next
            );
            phase = next;
        }

        state.set_status(if phase == Phase::Executed {
            QueryStatus::Executed
        } else {
            QueryStatus::FailedTerminal
        });

        let (residual_findings, warnings): (Vec<Finding>, Vec<Finding>) =
            findings.into_iter().partition(|f| f.is_blocking());
        let success = state.status() == QueryStatus::Executed;

        info!(
            %query_id,
            success,
            forced,
            iterations = state.iteration_count(),
            "Query finished with status {:?}",
            state.status()
        );

        Ok(QueryOutcome {
            query_id,
            user_query: state.user_query.clone(),
            success,
            status: state.status(),
            sql: state.current_sql.clone(),
            forced,
            retrieval_degraded: state.retrieval_degraded,
            result,
            error: failure,
            residual_findings,
            warnings,
            debug_history: state.history().to_vec(),
        })
    }
}

fn generation_failure(message: String, sql: Option<String>) -> PipelineError {
    PipelineError {
        kind: PipelineErrorKind::GenerationUnavailable,
        message,
        sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::prompt_builder::PromptBuilder;
    use crate::application::use_cases::sql_generator::RetryPolicy;
    use crate::application::use_cases::test_support::{
        sample_schema, seeded_database, seeded_index, FailingIndex, FixedLLM, HashEmbedder,
        ScriptedLLM, StalledEmbedder,
    };
    use crate::application::use_cases::embedding_service::Embedder;
    use crate::domain::llm_config::CompletionOptions;
    use crate::domain::query::FindingKind;
    use crate::infrastructure::llm_clients::LLMClient;
    use crate::infrastructure::vector_index::VectorIndex;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::RwLock;

    async fn orchestrator_with(
        llm: Arc<dyn LLMClient>,
        index: Option<Arc<dyn VectorIndex>>,
        max_iterations: u32,
    ) -> Orchestrator {
        orchestrator_embedding_with(llm, Arc::new(HashEmbedder::new(64)), index, max_iterations)
            .await
    }

    async fn orchestrator_embedding_with(
        llm: Arc<dyn LLMClient>,
        embedder: Arc<dyn Embedder>,
        index: Option<Arc<dyn VectorIndex>>,
        max_iterations: u32,
    ) -> Orchestrator {
        let schema = sample_schema();
        let index = match index {
            Some(index) => index,
            None => seeded_index(&schema).await,
        };
        let store = Arc::new(SchemaStore::new(schema));
        let retriever = Retriever::new(
            embedder,
            index,
            store.clone(),
            Arc::new(RwLock::new(())),
            Duration::from_secs(1),
        );
        let generator = SqlGenerator::new(
            llm,
            PromptBuilder::new("SQLite"),
            CompletionOptions::default(),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
            },
        );
        let executor = SqlExecutor::new(
            Arc::new(seeded_database().await),
            100,
            Duration::from_secs(5),
        );
        Orchestrator::new(retriever, generator, executor, store, 3, max_iterations)
    }

    #[test]
    fn test_transition_table() {
        use Phase::*;
        let blocking_with_budget = Signal::BlockingFindings {
            iteration_count: 1,
            max_iterations: 3,
        };
        let blocking_exhausted = Signal::BlockingFindings {
            iteration_count: 3,
            max_iterations: 3,
        };
        let signals = [
            Signal::Generated,
            Signal::GenerationFailed,
            Signal::Valid,
            blocking_with_budget,
            blocking_exhausted,
            Signal::ExecutionSucceeded,
            Signal::ExecutionFailed,
        ];
        let phases = [Pending, Validating, Repairing, Executing, Executed, FailedTerminal];

        for phase in phases {
            for signal in signals {
                let expected = match (phase, signal) {
                    (Pending, Signal::Generated) | (Repairing, Signal::Generated) => Some(Validating),
                    (Pending, Signal::GenerationFailed) | (Repairing, Signal::GenerationFailed) => {
                        Some(FailedTerminal)
                    }
                    (Validating, Signal::Valid) => Some(Executing),
                    (Validating, s) if s == blocking_with_budget => Some(Repairing),
                    (Validating, s) if s == blocking_exhausted => Some(Executing),
                    (Executing, Signal::ExecutionSucceeded) => Some(Executed),
                    (Executing, Signal::ExecutionFailed) => Some(FailedTerminal),
                    _ => None,
                };
                assert_eq!(next_phase(phase, signal), expected, "{:?} on {:?}", phase, signal);
            }
        }
    }

    #[test]
    fn test_zero_budget_forces_execution() {
        assert_eq!(
            next_phase(
                Phase::Validating,
                Signal::BlockingFindings {
                    iteration_count: 0,
                    max_iterations: 0
                }
            ),
            Some(Phase::Executing)
        );
    }

    #[tokio::test]
    async fn test_list_all_users() {
        let llm = Arc::new(ScriptedLLM::replying(&["```sql\nSELECT * FROM users\n```"]));
        let outcome = orchestrator_with(llm.clone(), None, 3)
            .await
            .run("list all users")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, QueryStatus::Executed);
        assert_eq!(outcome.sql, "SELECT * FROM users");
        assert!(!outcome.forced);
        assert!(outcome.debug_history.is_empty());
        assert_eq!(outcome.result.unwrap().row_count, 3);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(llm.calls(), 1);
        assert!(llm.prompts()[0].contains("Table: users"));
    }

    #[tokio::test]
    async fn test_count_orders_is_repaired() {
        let llm = Arc::new(ScriptedLLM::replying(&[
            "SELECT COUNT(*) FROM orders",
            "SELECT COUNT(*) AS total FROM user_orders",
        ]));
        let outcome = orchestrator_with(llm.clone(), None, 3)
            .await
            .run("count orders")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, QueryStatus::Executed);
        assert_eq!(outcome.debug_history.len(), 1);
        let entry = &outcome.debug_history[0];
        assert_eq!(entry.sql, "SELECT COUNT(*) FROM orders");
        assert_eq!(entry.findings[0].kind, FindingKind::UnknownTable);
        assert_eq!(entry.findings[0].location_hint.as_deref(), Some("user_orders"));
        assert_eq!(
            entry.repaired_sql.as_deref(),
            Some("SELECT COUNT(*) AS total FROM user_orders")
        );
        assert!(llm.prompts()[1].contains("did you mean `user_orders`?"));

        let rows = outcome.result.unwrap().rows.unwrap();
        assert_eq!(rows[0].get("total"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_persistent_mismatch_forces_execution() {
        let llm = Arc::new(FixedLLM("SELECT COUNT(*) FROM orders".to_string()));
        let outcome = orchestrator_with(llm, None, 3)
            .await
            .run("count orders")
            .await
            .unwrap();

        assert!(outcome.forced);
        assert_eq!(outcome.debug_history.len(), 3);
        assert_eq!(outcome.residual_findings.len(), 1);
        assert_eq!(outcome.residual_findings[0].kind, FindingKind::UnknownTable);
        // The database rejects the forced statement too.
        assert!(!outcome.success);
        assert_eq!(outcome.status, QueryStatus::FailedTerminal);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, PipelineErrorKind::ExecutionFailure);
        assert_eq!(error.sql.as_deref(), Some("SELECT COUNT(*) FROM orders"));
        assert!(error.message.contains("no such table"));
    }

    #[tokio::test]
    async fn test_history_never_exceeds_budget() {
        for max_iterations in 0..=4 {
            let llm = Arc::new(FixedLLM("SELECT nope FROM nowhere".to_string()));
            let outcome = orchestrator_with(llm, None, max_iterations)
                .await
                .run("anything")
                .await
                .unwrap();
            assert_eq!(outcome.debug_history.len(), max_iterations as usize);
            assert!(outcome.forced);
            assert!(outcome.status.is_terminal());
        }
    }

    #[tokio::test]
    async fn test_generation_failure_is_terminal() {
        let llm = Arc::new(ScriptedLLM::new(Vec::new()));
        let outcome = orchestrator_with(llm.clone(), None, 3)
            .await
            .run("list all users")
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status, QueryStatus::FailedTerminal);
        assert_eq!(outcome.sql, "");
        assert!(outcome.result.is_none());
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, PipelineErrorKind::GenerationUnavailable);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_repair_is_recorded() {
        let llm = Arc::new(ScriptedLLM::replying(&["SELECT * FROM orders"]));
        let outcome = orchestrator_with(llm, None, 3)
            .await
            .run("show orders")
            .await
            .unwrap();

        assert_eq!(outcome.status, QueryStatus::FailedTerminal);
        assert_eq!(outcome.debug_history.len(), 1);
        assert!(outcome.debug_history[0].repaired_sql.is_none());
        assert_eq!(outcome.sql, "SELECT * FROM orders");
        assert_eq!(outcome.residual_findings.len(), 1);
        assert_eq!(
            outcome.error.unwrap().kind,
            PipelineErrorKind::GenerationUnavailable
        );
    }

    #[tokio::test]
    async fn test_index_outage_degrades_to_empty_context() {
        let llm = Arc::new(ScriptedLLM::replying(&["SELECT name FROM users WHERE id = 2"]));
        let outcome = orchestrator_with(llm.clone(), Some(Arc::new(FailingIndex::new(64))), 3)
            .await
            .run("name of user 2")
            .await
            .unwrap();

        assert!(outcome.retrieval_degraded);
        assert!(outcome.success);
        assert!(llm.prompts()[0].contains("No table descriptions are available"));
        let rows = outcome.result.unwrap().rows.unwrap();
        assert_eq!(rows[0].get("name"), Some(&json!("Linus")));
    }

    #[tokio::test]
    async fn test_concurrent_runs_own_their_state() {
        let llm = Arc::new(FixedLLM("SELECT id FROM users WHERE id = 1".to_string()));
        let orchestrator = orchestrator_with(llm, None, 3).await;
        let (a, b) = tokio::join!(orchestrator.run("first"), orchestrator.run("second"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.query_id, b.query_id);
        assert_eq!(a.user_query, "first");
        assert_eq!(b.user_query, "second");
        assert!(a.success && b.success);
    }

    #[tokio::test]
    async fn test_retrieval_timeout_degrades_but_answers() {
        let llm = Arc::new(ScriptedLLM::replying(&["SELECT COUNT(*) AS total FROM users"]));
        let outcome = orchestrator_embedding_with(
            llm.clone(),
            Arc::new(StalledEmbedder { dimension: 64 }),
            None,
            3,
        )
        .await
        .run("how many users are there")
        .await
        .unwrap();

        assert!(outcome.retrieval_degraded);
        assert!(outcome.success);
        assert!(llm.prompts()[0].contains("No table descriptions are available"));
        let rows = outcome.result.unwrap().rows.unwrap();
        assert_eq!(rows[0].get("total"), Some(&json!(3)));
    }
}
