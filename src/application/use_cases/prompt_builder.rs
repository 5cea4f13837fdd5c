//! Prompt construction for SQL generation.
//!
//! The oracle is stateless, so every prompt carries the whole context: the question, the
//! retrieved table descriptions and, on repair calls, the corrective directive.

use crate::domain::query::RetrievedContext;
use std::fmt::Write;

pub struct PromptBuilder {
    dialect: String,
}

impl PromptBuilder {
    pub fn new(dialect: &str) -> Self {
        Self {
            dialect: dialect.to_string(),
        }
    }

    pub fn build_prompt(
        &self,
        user_query: &str,
        context: &RetrievedContext,
        repair_directive: Option<&str>,
    ) -> String {
        let mut prompt = String::new();

        let _ = writeln!(
            prompt,
            "You are a SQL expert. Write one {} query that answers the question, using only the tables and columns listed below.\n",
            self.dialect
        );

        self.add_schema_info(&mut prompt, context);

        let _ = writeln!(prompt, "## Question");
        let _ = writeln!(prompt, "{}\n", user_query.trim());

        if let Some(directive) = repair_directive.filter(|d| !d.trim().is_empty()) {
            let _ = writeln!(prompt, "## Correction Required");
            let _ = writeln!(prompt, "{}\n", directive.trim());
        }

        let _ = writeln!(prompt, "## Output Format");
        let _ = writeln!(
            prompt,
            "Return only the SQL statement inside a ```sql code block, without explanation."
        );

        prompt
    }

    fn add_schema_info(&self, prompt: &mut String, context: &RetrievedContext) {
        let _ = writeln!(prompt, "## Relevant Tables\n");

        if context.is_empty() {
            let _ = writeln!(
                prompt,
                "No table descriptions are available. Use only tables you are certain exist.\n"
            );
            return;
        }

        for record in context.records() {
            let _ = writeln!(prompt, "{}", record.document());
        }
    }
}
