//! Injectable label → synonyms table used as the resolver's last fallback.
//!
//! Keys are matched case-insensitively; synonyms keep their configured order.
//!
//! # Example
//!
//! ```rust
//! use scenefuse_runtime::synonyms::SynonymTable;
//!
//! let table = SynonymTable::default();
//! assert_eq!(table.lookup("Laptop"), ["computer", "notebook"]);
//! assert!(table.lookup("xylophone").is_empty());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maps an object label to alternative labels it may be detected as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct SynonymTable {
    entries: BTreeMap<String, Vec<String>>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert("laptop", ["computer", "notebook"]);
        table.insert("phone", ["mobile", "cellphone", "smartphone"]);
        table.insert("bottle", ["container"]);
        table.insert("cup", ["mug", "glass"]);
        table.insert("person", ["people", "man", "woman"]);
        table
    }
}

impl SynonymTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add or replace the synonyms for `label`.
    pub fn insert<I, S>(&mut self, label: &str, synonyms: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.insert(
            normalise(label),
            synonyms.into_iter().map(Into::into).collect(),
        );
    }

    /// Synonyms for `label`, empty when there is no entry.
    pub fn lookup(&self, label: &str) -> &[String] {
        self.entries
            .get(&normalise(label))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, Vec<String>>> for SynonymTable {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        let mut table = Self::empty();
        for (label, synonyms) in map {
            table.insert(&label, synonyms);
        }
        table
    }
}

impl From<SynonymTable> for BTreeMap<String, Vec<String>> {
    fn from(table: SynonymTable) -> Self {
        table.entries
    }
}

fn normalise(label: &str) -> String {
    label.trim().to_lowercase()
}
