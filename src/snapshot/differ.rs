use serde::{Deserialize, Serialize};

use crate::snapshot::{Field, FieldValue, Snapshot};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub field: Field,
    pub new_value: FieldValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "changes")]
pub enum DiffResult {
    Initial,
    Unchanged,
    Changed(Vec<FieldChange>),
}

/// Field-wise exact comparison. Whitespace or formatting drift on the page counts
/// as a change.
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> DiffResult {
    let Some(previous) = previous else {
        return DiffResult::Initial;
    };
    let changes = diff_fields(previous, current);
    if changes.is_empty() {
        DiffResult::Unchanged
    } else {
        DiffResult::Changed(changes)
    }
}

pub fn diff_fields(previous: &Snapshot, current: &Snapshot) -> Vec<FieldChange> {
    Field::ALL
        .into_iter()
        .filter(|field| previous.get(*field) != current.get(*field))
        .map(|field| FieldChange {
            field,
            new_value: current.get(field).clone(),
        })
        .collect()
}
