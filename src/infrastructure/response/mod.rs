use once_cell::sync::Lazy;
use regex::Regex;

static THINK_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<think>[\s\S]*?</think>|<think\s*/>").unwrap());

static REASONING_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<reasoning>[\s\S]*?</reasoning>").unwrap());

static INTERNAL_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<internal>[\s\S]*?</internal>").unwrap());

static MULTIPLE_NEWLINES_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static FENCED_BLOCK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:sqlite|postgresql|postgres|mysql|sql)?[ \t]*\r?\n?(.*?)```")
        .unwrap()
});

static OPEN_FENCE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[^\n]*\n?").unwrap());

static SQL_LABEL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*sql\s*:\s*").unwrap());

/// Cleans LLM response by removing common artifacts and unwanted tags
pub fn clean_llm_response(response: &str) -> String {
    let mut cleaned = response.to_string();

    // Remove <think>...</think> and <think/> tags
    cleaned = THINK_TAG_PATTERN.replace_all(&cleaned, "").to_string();

    // Remove <reasoning>...</reasoning> tags (some models use this)
    cleaned = REASONING_TAG_PATTERN.replace_all(&cleaned, "").to_string();

    // Remove <internal>...</internal> tags
    cleaned = INTERNAL_TAG_PATTERN.replace_all(&cleaned, "").to_string();

    cleaned = cleaned.trim().to_string();

    // Collapse multiple consecutive newlines into at most two
    cleaned = MULTIPLE_NEWLINES_PATTERN
        .replace_all(&cleaned, "\n\n")
        .to_string();

    cleaned
}

/// Reduces a raw completion to the SQL candidate it carries.
///
/// Takes the first fenced block when there is one (a block cut off by `max_tokens` loses only
/// its opening fence), drops a leading `SQL:` label and one trailing semicolon. The result is
/// still untrusted; the validator decides whether it is usable.
pub fn extract_sql(response: &str) -> String {
    let cleaned = clean_llm_response(response);

    let body = if let Some(caps) = FENCED_BLOCK_PATTERN.captures(&cleaned) {
        caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string()
    } else if cleaned.starts_with("```") {
        OPEN_FENCE_PATTERN.replace(&cleaned, "").to_string()
    } else {
        cleaned
    };

    let body = SQL_LABEL_PATTERN.replace(body.trim(), "").to_string();
    let body = body.trim();
    body.strip_suffix(';').unwrap_or(body).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_think_tags() {
        let input = "<think>Some reasoning here</think>The actual response";
        assert_eq!(clean_llm_response(input), "The actual response");
    }

    #[test]
    fn test_clean_self_closing_think() {
        let input = "<think />The actual response";
        assert_eq!(clean_llm_response(input), "The actual response");
    }

    #[test]
    fn test_clean_reasoning_tags() {
        let input = "<reasoning>Internal reasoning</reasoning>Final answer";
        assert_eq!(clean_llm_response(input), "Final answer");
    }

    #[test]
    fn test_clean_multiple_newlines() {
        let input = "Line 1\n\n\n\n\nLine 2";
        assert_eq!(clean_llm_response(input), "Line 1\n\nLine 2");
    }

    #[test]
    fn test_extract_sql_from_fenced_block() {
        let input = "Here you go:\n```sql\nSELECT * FROM users;\n```\nThis lists users.";
        assert_eq!(extract_sql(input), "SELECT * FROM users");
    }

    #[test]
    fn test_extract_sql_from_plain_fence() {
        let input = "```\nSELECT COUNT(*) FROM user_orders\n```";
        assert_eq!(extract_sql(input), "SELECT COUNT(*) FROM user_orders");
    }

    #[test]
    fn test_extract_sql_after_think_block() {
        let input = "<think>users table has id, name</think>\n```sql\nSELECT name FROM users\n```";
        assert_eq!(extract_sql(input), "SELECT name FROM users");
    }

    #[test]
    fn test_extract_sql_strips_label() {
        assert_eq!(extract_sql("SQL: SELECT 1;"), "SELECT 1");
    }

    #[test]
    fn test_extract_sql_unterminated_fence() {
        let input = "```sql\nSELECT id FROM users WHERE";
        assert_eq!(extract_sql(input), "SELECT id FROM users WHERE");
    }

    #[test]
    fn test_extract_sql_trims_only_one_semicolon() {
        assert_eq!(extract_sql("SELECT 1;;"), "SELECT 1;");
    }

    #[test]
    fn test_extract_sql_preserves_plain_statement() {
        assert_eq!(
            extract_sql("  SELECT id FROM users LIMIT 10  "),
            "SELECT id FROM users LIMIT 10"
        );
    }
}
