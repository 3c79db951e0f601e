use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::DATABASE_FORMAT_VERSION;
use crate::types::Timestamp;

/// Process-wide keyed configuration, persisted as a single record.
///
/// Mutations are staged by the store's configuration handle and written out
/// only on an explicit commit, so a batch of related changes lands
/// atomically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub string_values: BTreeMap<String, String>,
    pub int_values: BTreeMap<String, i64>,
    /// On-disk format version; checked before any subsystem starts.
    pub database_format_version: u32,
    pub last_defrag: Option<Timestamp>,
    pub last_score_verification: Option<Timestamp>,
}

impl Configuration {
    pub fn new() -> Self {
        Self {
            string_values: BTreeMap::new(),
            int_values: BTreeMap::new(),
            database_format_version: DATABASE_FORMAT_VERSION,
            last_defrag: None,
            last_score_verification: None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.string_values.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.int_values.get(key).copied()
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.string_values.insert(key.to_string(), value.to_string());
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.int_values.insert(key.to_string(), value);
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
