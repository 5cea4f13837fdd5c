use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// One column of a table as reported by the database catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub comment: String,
}

impl ColumnSpec {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            comment: String::new(),
        }
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }
}

/// Structured description of one database table.
///
/// Records are immutable once loaded into a `SchemaStore`; a re-sync replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub table_name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

impl SchemaRecord {
    pub fn new(table_name: &str, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table_name: table_name.to_string(),
            description: format!("Table {}", table_name),
            columns,
            primary_keys: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_primary_keys(mut self, keys: &[&str]) -> Self {
        self.primary_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Case-insensitive column lookup, returning the schema's spelling.
    pub fn find_column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Canonical text used both for embedding and for prompt context.
    pub fn document(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "Table: {}", self.table_name);
        if !self.description.trim().is_empty() {
            let _ = writeln!(text, "Description: {}", self.description.trim());
        }
        if !self.primary_keys.is_empty() {
            let _ = writeln!(text, "Primary key: {}", self.primary_keys.join(", "));
        }
        text.push_str("Columns:\n");
        for col in &self.columns {
            let _ = write!(text, "  - {} ({})", col.name, col.data_type);
            if !col.comment.trim().is_empty() {
                let _ = write!(text, ": {}", col.comment.trim());
            }
            text.push('\n');
        }
        text
    }

    /// SHA-256 of `document()`, hex encoded. Unchanged tables keep their embedding on re-sync.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> SchemaRecord {
        SchemaRecord::new(
            "users",
            vec![
                ColumnSpec::new("id", "INT"),
                ColumnSpec::new("name", "VARCHAR(100)").with_comment("display name"),
                ColumnSpec::new("email", "VARCHAR(255)"),
            ],
        )
        .with_primary_keys(&["id"])
    }

    #[test]
    fn test_find_column_is_case_insensitive() {
        let record = users();
        assert_eq!(record.find_column("EMAIL").map(|c| c.name.as_str()), Some("email"));
        assert!(record.find_column("phone").is_none());
    }

    #[test]
    fn test_document_lists_columns_in_order() {
        let doc = users().document();
        let id_pos = doc.find("- id (INT)").unwrap();
        let name_pos = doc.find("- name (VARCHAR(100)): display name").unwrap();
        let email_pos = doc.find("- email").unwrap();
        assert!(id_pos < name_pos && name_pos < email_pos);
        assert!(doc.contains("Primary key: id"));
    }

    #[test]
    fn test_content_hash_tracks_document_changes() {
        let a = users();
        let b = users().with_description("people who signed up");
        assert_eq!(a.content_hash(), users().content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_column_type_serializes_as_type() {
        let json = serde_json::to_value(ColumnSpec::new("id", "INT")).unwrap();
        assert_eq!(json["type"], "INT");
    }
}
