//! Command-line front end over the query pipeline.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::domain::error::AppError;
use crate::domain::query::QueryOutcome;
use crate::infrastructure::bootstrap::Services;
use crate::infrastructure::config::AppConfig;

const DEMO_QUERIES: &[&str] = &[
    "List all users",
    "Count the orders of each user",
    "Find users who placed an order with an amount greater than 100",
    "Show the details of the 10 most recent orders",
];

/// Rows shown per result in human-readable output.
const DISPLAY_ROWS: usize = 10;

/// Natural-language questions in, validated SQL and its results out.
#[derive(Parser, Debug)]
#[command(name = "text2sql")]
#[command(about = "Retrieval-grounded text-to-SQL with a bounded repair loop", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML configuration file (defaults to ./text2sql.toml when present)
    #[arg(long, env = "TEXT2SQL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Print each outcome as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read one question per line until quit (default)
    Interactive,
    /// Run the built-in sample questions
    Demo,
    /// Load the database schema into the vector index and exit
    Sync,
    /// Answer a single question
    Ask {
        /// Question in natural language
        question: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum LineAction<'a> {
    Quit,
    Skip,
    Query(&'a str),
}

pub fn parse_line(line: &str) -> LineAction<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineAction::Skip;
    }
    match trimmed.to_lowercase().as_str() {
        "quit" | "exit" | "q" => LineAction::Quit,
        _ => LineAction::Query(trimmed),
    }
}

/// 2 for configuration problems, 1 for everything else that stops startup.
pub fn exit_code_for(err: &AppError) -> u8 {
    if err.is_fatal_configuration() {
        2
    } else {
        1
    }
}

pub async fn run(cli: Cli) -> ExitCode {
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return fail("Invalid configuration", &err),
    };

    let services = match Services::build(config).await {
        Ok(services) => services,
        Err(err) => return fail("Startup failed", &err),
    };

    let command = cli.command.clone().unwrap_or(Command::Interactive);

    if command == Command::Sync {
        return match services.sync_schema().await {
            Ok(report) => {
                if cli.json {
                    print_json(&report);
                } else {
                    println!(
                        "Synced {} table(s): {} embedded, {} unchanged, {} removed",
                        report.tables, report.embedded, report.unchanged, report.removed
                    );
                }
                ExitCode::SUCCESS
            }
            Err(err) => fail("Schema sync failed", &err),
        };
    }

    match services.sync_schema().await {
        Ok(report) if report.tables == 0 => warn!("The database has no tables"),
        Ok(_) => {}
        Err(err) if err.is_fatal_configuration() => return fail("Schema sync failed", &err),
        Err(err) => warn!("Schema sync failed, continuing without fresh schema: {}", err),
    }

    let result = match command {
        Command::Ask { question } => answer(&services, &question, cli.json).await.map(|_| ()),
        Command::Demo => run_demo(&services, cli.json).await,
        Command::Interactive | Command::Sync => run_interactive(&services, cli.json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => fail("Query failed", &err),
    }
}

fn fail(context: &str, err: &AppError) -> ExitCode {
    error!("{}: {}", context, err);
    eprintln!("{}: {}", context, err);
    ExitCode::from(exit_code_for(err))
}

async fn answer(services: &Services, question: &str, json: bool) -> Result<bool, AppError> {
    let outcome = services.orchestrator.run(question).await?;
    if json {
        print_json(&outcome);
    } else {
        print!("{}", render_outcome(&outcome));
    }
    Ok(outcome.success)
}

async fn run_demo(services: &Services, json: bool) -> Result<(), AppError> {
    let mut succeeded = 0;
    for question in DEMO_QUERIES {
        if !json {
            println!("\n=== {}", question);
        }
        if answer(services, question, json).await? {
            succeeded += 1;
        }
    }
    info!("Demo finished: {}/{} succeeded", succeeded, DEMO_QUERIES.len());
    Ok(())
}

async fn run_interactive(services: &Services, json: bool) -> Result<(), AppError> {
    println!(
        "Connected to {} with {} known table(s). Type a question, or 'quit' to exit.",
        services.db.backend(),
        services.store.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_line(&line) {
            LineAction::Quit => break,
            LineAction::Skip => continue,
            LineAction::Query(question) => {
                answer(services, question, json).await?;
            }
        }
    }

    println!("Bye.");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

pub fn render_outcome(outcome: &QueryOutcome) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Status: {}{}\n",
        if outcome.success { "success" } else { "failed" },
        if outcome.forced {
            " (forced past validation)"
        } else {
            ""
        }
    ));
    if outcome.retrieval_degraded {
        out.push_str("Note: schema retrieval was unavailable; SQL was generated without table context\n");
    }
    if !outcome.sql.is_empty() {
        out.push_str(&format!("SQL: {}\n", outcome.sql));
    }

    if let Some(result) = outcome.result.as_ref().filter(|r| r.success) {
        if let Some(rows) = &result.rows {
            if !result.columns.is_empty() {
                let header = result.columns.join(" | ");
                out.push_str(&format!("{}\n{}\n", header, "-".repeat(header.len())));
            }
            for row in rows.iter().take(DISPLAY_ROWS) {
                let cells: Vec<String> = result
                    .columns
                    .iter()
                    .map(|column| match row.get(column) {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(value) => value.to_string(),
                        None => String::new(),
                    })
                    .collect();
                out.push_str(&format!("{}\n", cells.join(" | ")));
            }
            if rows.len() > DISPLAY_ROWS {
                out.push_str(&format!("... {} more row(s)\n", rows.len() - DISPLAY_ROWS));
            }
        }
        out.push_str(&format!("({} row(s)", result.row_count));
        if let (true, Some(total)) = (result.truncated, result.total_rows) {
            out.push_str(&format!(", truncated from {}", total));
        }
        out.push_str(")\n");
    }

    if let Some(error) = &outcome.error {
        out.push_str(&format!("Error ({:?}): {}\n", error.kind, error.message));
    }
    for finding in &outcome.residual_findings {
        out.push_str(&format!("Unresolved {}: {}\n", finding.kind, finding.message));
    }
    for warning in &outcome.warnings {
        out.push_str(&format!("Warning: {}\n", warning.message));
    }

    if !outcome.debug_history.is_empty() {
        out.push_str("Repair history:\n");
        for entry in &outcome.debug_history {
            let problems: Vec<&str> = entry.findings.iter().map(|f| f.message.as_str()).collect();
            out.push_str(&format!(
                "  {}. {}\n     problems: {}\n     replaced by: {}\n",
                entry.iteration,
                entry.sql,
                problems.join("; "),
                entry.repaired_sql.as_deref().unwrap_or("(generation failed)")
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::query::{
        DebugEntry, ExecutionResult, Finding, FindingKind, QueryStatus,
    };
    use serde_json::{json, Map};
    use uuid::Uuid;

    fn outcome() -> QueryOutcome {
        let mut row = Map::new();
        row.insert("name".to_string(), json!("Ada"));
        row.insert("id".to_string(), json!(1));
        QueryOutcome {
            query_id: Uuid::new_v4(),
            user_query: "list users".to_string(),
            success: true,
            status: QueryStatus::Executed,
            sql: "SELECT name, id FROM users".to_string(),
            forced: false,
            retrieval_degraded: false,
            result: Some(ExecutionResult::from_rows(
                vec!["name".to_string(), "id".to_string()],
                vec![row],
                1,
            )),
            error: None,
            residual_findings: Vec::new(),
            warnings: Vec::new(),
            debug_history: Vec::new(),
        }
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("   "), LineAction::Skip);
        assert_eq!(parse_line("QUIT"), LineAction::Quit);
        assert_eq!(parse_line(" q "), LineAction::Quit);
        assert_eq!(parse_line(" list users "), LineAction::Query("list users"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&AppError::ConfigurationError("x".to_string())), 2);
        assert_eq!(exit_code_for(&AppError::DatabaseError("refused".to_string())), 1);
        assert_eq!(exit_code_for(&AppError::IndexUnavailable("down".to_string())), 1);
    }

    #[test]
    fn test_cli_defaults_to_interactive() {
        let cli = Cli::try_parse_from(["text2sql"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["text2sql", "ask", "count orders", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(
            cli.command,
            Some(Command::Ask {
                question: "count orders".to_string()
            })
        );
    }

    #[test]
    fn test_render_success() {
        let text = render_outcome(&outcome());
        assert!(text.contains("Status: success"));
        assert!(text.contains("name | id"));
        assert!(text.contains("Ada | 1"));
        assert!(text.contains("(1 row(s))"));
    }

    #[test]
    fn test_render_forced_failure_with_history() {
        let mut failed = outcome();
        failed.success = false;
        failed.forced = true;
        failed.status = QueryStatus::FailedTerminal;
        failed.result = Some(ExecutionResult::failure("no such table: orders"));
        failed.residual_findings = vec![Finding::new(
            FindingKind::UnknownTable,
            "Table `orders` does not exist",
            Some("user_orders".to_string()),
        )];
        failed.debug_history = vec![DebugEntry {
            iteration: 1,
            sql: "SELECT * FROM orders".to_string(),
            findings: failed.residual_findings.clone(),
            repaired_sql: None,
        }];

        let text = render_outcome(&failed);
        assert!(text.contains("forced past validation"));
        assert!(text.contains("Unresolved unknown table"));
        assert!(text.contains("(generation failed)"));
        assert!(!text.contains("row(s)"));
    }
}
