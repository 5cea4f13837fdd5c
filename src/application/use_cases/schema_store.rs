use crate::domain::schema::SchemaRecord;
use std::sync::{Arc, RwLock};

/// Current set of known table schemas.
///
/// Readers take an `Arc` snapshot and keep using it for the whole query; `replace` swaps the
/// snapshot atomically, so a re-sync never exposes a half-updated schema.
#[derive(Default)]
pub struct SchemaStore {
    records: RwLock<Arc<Vec<SchemaRecord>>>,
}

impl SchemaStore {
    pub fn new(records: Vec<SchemaRecord>) -> Self {
        Self {
            records: RwLock::new(Arc::new(records)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<SchemaRecord>> {
        match self.records.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, records: Vec<SchemaRecord>) {
        let next = Arc::new(records);
        match self.records.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Case-insensitive lookup by table name.
    pub fn get(&self, table_name: &str) -> Option<SchemaRecord> {
        self.snapshot()
            .iter()
            .find(|r| r.table_name.eq_ignore_ascii_case(table_name))
            .cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|r| r.table_name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
