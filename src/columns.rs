use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, VaultError};

/// Column-oriented bag of normalized event records for one hour bucket.
///
/// Every column holds one slot per represented event; event `i` is
/// reconstructed by reading slot `i` across all columns. Fields absent
/// from a given event hold an explicit `null` in that event's slot. The
/// mutators below maintain that alignment; only deserialized input can
/// violate it, and [`Aggregate::inflate`] treats that as fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aggregate {
    columns: BTreeMap<String, Vec<Value>>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds flat event records into column form.
    pub fn from_events<I>(events: I) -> Self
    where
        I: IntoIterator<Item = Map<String, Value>>,
    {
        let mut aggregate = Self::default();
        for record in events {
            aggregate.push(record);
        }
        aggregate
    }

    pub fn slot_count(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.slot_count() == 0
    }

    /// Appends one record: unseen fields are backfilled with nulls for
    /// all prior slots, known fields absent from the record pad with null.
    pub fn push(&mut self, record: Map<String, Value>) {
        let len = self.slot_count();
        for (field, value) in record {
            let column = self.columns.entry(field).or_default();
            column.resize(len, Value::Null);
            column.push(value);
        }
        for column in self.columns.values_mut() {
            column.resize(len + 1, Value::Null);
        }
    }

    /// Appends all of `other`'s slots after this aggregate's, padding
    /// fields unique to either side with nulls.
    pub fn merge(&mut self, other: Aggregate) {
        let len = self.slot_count();
        let other_len = other.slot_count();
        for (field, mut column) in other.columns {
            column.resize(other_len, Value::Null);
            let target = self.columns.entry(field).or_default();
            target.resize(len, Value::Null);
            target.append(&mut column);
        }
        for column in self.columns.values_mut() {
            column.resize(len + other_len, Value::Null);
        }
    }

    /// Left-to-right fold of [`Aggregate::merge`], preserving input order.
    pub fn merge_all<I>(aggregates: I) -> Aggregate
    where
        I: IntoIterator<Item = Aggregate>,
    {
        let mut merged = Aggregate::default();
        for aggregate in aggregates {
            merged.merge(aggregate);
        }
        merged
    }

    /// Reconstructs one flat record per slot, dropping null padding.
    ///
    /// Fails when columns disagree on slot count, which only happens to
    /// data corrupted at rest.
    pub fn inflate(&self) -> Result<Vec<Map<String, Value>>> {
        let len = self.slot_count();
        for (field, column) in &self.columns {
            if column.len() != len {
                return Err(VaultError::CorruptAggregate(format!(
                    "column {field} holds {} slots where {len} were expected",
                    column.len()
                )));
            }
        }
        let mut records = vec![Map::new(); len];
        for (field, column) in &self.columns {
            for (slot, value) in column.iter().enumerate() {
                if !value.is_null() {
                    records[slot].insert(field.clone(), value.clone());
                }
            }
        }
        Ok(records)
    }

    /// Excises every slot whose `key_field` value matches one of `values`,
    /// keeping the relative order of the remaining slots.
    pub fn remove_where(&mut self, key_field: &str, values: &HashSet<String>) {
        let Some(keys) = self.columns.get(key_field) else {
            return;
        };
        let doomed: HashSet<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, value)| value.as_str().is_some_and(|key| values.contains(key)))
            .map(|(slot, _)| slot)
            .collect();
        if doomed.is_empty() {
            return;
        }
        for column in self.columns.values_mut() {
            let mut slot = 0;
            column.retain(|_| {
                let keep = !doomed.contains(&slot);
                slot += 1;
                keep
            });
        }
    }
}
