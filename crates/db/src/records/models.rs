use std::collections::BTreeMap;

use paysync_common::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A source record mapped onto the fixed destination schema of its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub kind: EntityKind,
    pub id: String,
    /// Reference column -> referenced id.
    pub references: BTreeMap<String, String>,
    pub fields: Map<String, Value>,
    /// Verbatim source payload, kept for forensic replay. `None` on placeholders.
    pub raw: Option<Value>,
    pub is_placeholder: bool,
}

impl NormalizedRecord {
    /// Minimal row that only exists to satisfy a foreign key.
    pub fn placeholder(kind: EntityKind, id: impl Into<String>, hints: Map<String, Value>) -> Self {
        let mut references = BTreeMap::new();
        let mut fields = Map::new();
        for (key, value) in hints {
            if value.is_null() {
                continue;
            }
            let is_reference = kind.references().iter().any(|r| r.column == key);
            match (is_reference, value) {
                (true, Value::String(s)) => {
                    references.insert(key, s);
                }
                (true, _) => {}
                (false, value) => {
                    fields.insert(key, value);
                }
            }
        }

        Self {
            kind,
            id: id.into(),
            references,
            fields,
            raw: None,
            is_placeholder: true,
        }
    }

    /// Merge-on-primary-key: non-null incoming fields overwrite, everything else is kept.
    pub fn merged_with(&self, incoming: &NormalizedRecord) -> NormalizedRecord {
        let mut fields = self.fields.clone();
        for (key, value) in &incoming.fields {
            if !value.is_null() {
                fields.insert(key.clone(), value.clone());
            }
        }

        let mut references = self.references.clone();
        references.extend(
            incoming
                .references
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        NormalizedRecord {
            kind: self.kind,
            id: self.id.clone(),
            references,
            fields,
            raw: incoming.raw.clone().or_else(|| self.raw.clone()),
            is_placeholder: self.is_placeholder && incoming.is_placeholder,
        }
    }

    pub fn reference(&self, column: &str) -> Option<&str> {
        self.references.get(column).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}
