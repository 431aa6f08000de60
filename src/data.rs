// Recorded trial data. Every record is tagged with `trial_id` and, inside loops,
// the innermost `loop_id`, matching the columns the generated script writes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evaluator::RecordLookup;
use crate::types::{DataRecord, ItemId};

pub const TRIAL_ID_COLUMN: &str = "trial_id";
pub const LOOP_ID_COLUMN: &str = "loop_id";

/// Append-only data store, in presentation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataLog {
    records: Vec<DataRecord>,
}

impl DataLog {
    pub fn new() -> Self {
        DataLog::default()
    }

    /// Tag and append a trial's output.
    pub fn record(&mut self, trial_id: &ItemId, loop_id: Option<&ItemId>, mut record: DataRecord) {
        record.insert(
            TRIAL_ID_COLUMN.to_string(),
            Value::String(trial_id.as_str().to_string()),
        );
        if let Some(loop_id) = loop_id {
            record.insert(
                LOOP_ID_COLUMN.to_string(),
                Value::String(loop_id.as_str().to_string()),
            );
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Restrict lookups to records tagged with one of `loop_ids`: a loop and the loops
    /// nested in it, since records carry only their innermost loop.
    pub fn within_loops<'a>(&'a self, loop_ids: &'a BTreeSet<ItemId>) -> LoopScopedData<'a> {
        LoopScopedData { log: self, loop_ids }
    }

    fn latest_where(&self, trial_id: &ItemId, loop_ids: Option<&BTreeSet<ItemId>>) -> Option<&DataRecord> {
        self.records.iter().rev().find(|record| {
            tag_matches(record, TRIAL_ID_COLUMN, trial_id)
                && loop_ids.map_or(true, |ids| {
                    record
                        .get(LOOP_ID_COLUMN)
                        .and_then(Value::as_str)
                        .map_or(false, |tag| ids.contains(&ItemId::from(tag)))
                })
        })
    }
}

fn tag_matches(record: &DataRecord, column: &str, id: &ItemId) -> bool {
    record.get(column).and_then(Value::as_str) == Some(id.as_str())
}

impl RecordLookup for DataLog {
    fn latest(&self, trial_id: &ItemId) -> Option<&DataRecord> {
        self.latest_where(trial_id, None)
    }
}

/// Lookup view over the records of a loop and its nested loops.
pub struct LoopScopedData<'a> {
    log: &'a DataLog,
    loop_ids: &'a BTreeSet<ItemId>,
}

impl RecordLookup for LoopScopedData<'_> {
    fn latest(&self, trial_id: &ItemId) -> Option<&DataRecord> {
        self.log.latest_where(trial_id, Some(self.loop_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: Value) -> DataRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn latest_record_wins() {
        let mut log = DataLog::new();
        let a = ItemId::from("a");
        log.record(&a, None, response(json!({"rt": 100})));
        log.record(&a, None, response(json!({"rt": 200})));
        assert_eq!(log.latest(&a).unwrap()["rt"], json!(200));
        assert_eq!(log.latest(&a).unwrap()[TRIAL_ID_COLUMN], json!("a"));
        assert!(log.latest(&ItemId::from("b")).is_none());
    }

    #[test]
    fn loop_view_ignores_other_loops() {
        let mut log = DataLog::new();
        let a = ItemId::from("a");
        let l1 = ItemId::from("l1");
        let l2 = ItemId::from("l2");
        log.record(&a, Some(&l1), response(json!({"rt": 1})));
        log.record(&a, Some(&l2), response(json!({"rt": 2})));

        let only_l1: BTreeSet<ItemId> = [l1.clone()].into_iter().collect();
        assert_eq!(log.within_loops(&only_l1).latest(&a).unwrap()["rt"], json!(1));
        assert_eq!(log.latest(&a).unwrap()["rt"], json!(2));
        let l3: BTreeSet<ItemId> = [ItemId::from("l3")].into_iter().collect();
        assert!(log.within_loops(&l3).latest(&a).is_none());
    }

    #[test]
    fn loop_view_includes_nested_loops() {
        let mut log = DataLog::new();
        let x = ItemId::from("x");
        log.record(&x, Some(&ItemId::from("inner")), response(json!({"rt": 5})));
        log.record(&x, None, response(json!({"rt": 6})));

        let scope: BTreeSet<ItemId> = ["outer", "inner"].into_iter().map(ItemId::from).collect();
        assert_eq!(log.within_loops(&scope).latest(&x).unwrap()["rt"], json!(5));
    }
}
