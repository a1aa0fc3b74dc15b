//! Per-data-type change appliers.
//!
//! Each applier validates payloads for its data type, turns a change into an
//! [`EntityWrite`] against the current stored entity, and supplies the merge
//! strategy used when resolving conflicts. Appliers are looked up by
//! [`DataType`] through [`ApplierRegistry`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::merge::{id_key, merge_fields, merge_with_array_union, scalar_key, MergeOptions};
use crate::error::{Error, Result};
use crate::models::{Change, DataType, Operation, SyncEntity};

/// A change that passed request-level parsing
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedChange {
    pub id: Option<String>,
    pub operation: Operation,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Revision the change builds on (Unix ms)
    pub baseline: i64,
}

impl TryFrom<&Change> for PreparedChange {
    type Error = Error;

    fn try_from(change: &Change) -> Result<Self> {
        let operation = change
            .operation
            .as_str()
            .ok_or_else(|| Error::InvalidInput("change operation is required".into()))?
            .trim()
            .parse::<Operation>()?;
        if !matches!(change.id, Value::Null | Value::String(_) | Value::Number(_)) {
            return Err(Error::InvalidInput("change id must be a string".into()));
        }
        let timestamp = change
            .timestamp()?
            .ok_or_else(|| Error::InvalidInput("change timestamp is required".into()))?;
        let baseline = change
            .baseline_millis()?
            .unwrap_or_else(|| timestamp.timestamp_millis());

        Ok(Self {
            id: change.target_id(),
            operation,
            data: change.data.clone(),
            timestamp,
            baseline,
        })
    }
}

impl PreparedChange {
    fn require_id(&self) -> Result<&str> {
        self.id.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("{} change requires an id", self.operation))
        })
    }
}

/// Store mutation produced by an applier
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
    Insert {
        id: String,
        data: Value,
    },
    Replace {
        id: String,
        expected_revision: i64,
        data: Value,
    },
    Delete {
        id: String,
        expected_revision: i64,
    },
}

impl EntityWrite {
    pub fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Replace { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// Capability interface implemented once per synchronized data type
pub trait ChangeApplier: Send + Sync {
    fn data_type(&self) -> DataType;

    /// Reject payloads whose fields have the wrong shape for this data type
    fn validate(&self, data: &Value) -> Result<()>;

    /// Combine two conflicting documents
    fn merge(&self, local: &Value, remote: &Value, options: &MergeOptions) -> Value {
        merge_fields(local, remote, options)
    }

    /// Translate a change into a store write.
    ///
    /// `current` is the stored entity (tombstones included) as last observed;
    /// replace and delete writes are conditional on its revision.
    fn apply(&self, change: &PreparedChange, current: Option<&SyncEntity>) -> Result<EntityWrite> {
        match change.operation {
            Operation::Create => {
                self.validate(&change.data)?;
                let id = change
                    .id
                    .clone()
                    .unwrap_or_else(|| Uuid::now_v7().to_string());
                Ok(EntityWrite::Insert {
                    id,
                    data: change.data.clone(),
                })
            }
            Operation::Update => {
                let id = change.require_id()?;
                let current = live(current, self.data_type(), id)?;
                self.validate(&change.data)?;
                Ok(EntityWrite::Replace {
                    id: id.to_string(),
                    expected_revision: current.revision,
                    data: patch(&current.data, &change.data),
                })
            }
            Operation::Delete => {
                let id = change.require_id()?;
                let current = live(current, self.data_type(), id)?;
                Ok(EntityWrite::Delete {
                    id: id.to_string(),
                    expected_revision: current.revision,
                })
            }
        }
    }
}

fn live<'a>(current: Option<&'a SyncEntity>, data_type: DataType, id: &str) -> Result<&'a SyncEntity> {
    current
        .filter(|entity| !entity.is_deleted)
        .ok_or_else(|| Error::NotFound(format!("{data_type} {id}")))
}

/// Shallow patch: top-level fields of `changes` replace those of `stored`.
pub(crate) fn patch(stored: &Value, changes: &Value) -> Value {
    match (stored.as_object(), changes.as_object()) {
        (Some(stored), Some(changes)) => {
            let mut patched = stored.clone();
            for (field, value) in changes {
                patched.insert(field.clone(), value.clone());
            }
            Value::Object(patched)
        }
        _ => changes.clone(),
    }
}

fn expect_object<'a>(data: &'a Value, data_type: DataType) -> Result<&'a Map<String, Value>> {
    data.as_object()
        .ok_or_else(|| Error::InvalidInput(format!("{data_type} data must be a JSON object")))
}

fn check_field(
    object: &Map<String, Value>,
    field: &str,
    expected: &str,
    accept: impl Fn(&Value) -> bool,
) -> Result<()> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(value) if accept(value) => Ok(()),
        Some(_) => Err(Error::InvalidInput(format!("{field} must be {expected}"))),
    }
}

fn each_item(
    object: &Map<String, Value>,
    field: &str,
    check: impl Fn(usize, &Value) -> Result<()>,
) -> Result<()> {
    check_field(object, field, "an array", Value::is_array)?;
    if let Some(Value::Array(items)) = object.get(field) {
        for (index, item) in items.iter().enumerate() {
            check(index, item)?;
        }
    }
    Ok(())
}

/// Applier for trip documents
#[derive(Debug, Default, Clone, Copy)]
pub struct TripApplier;

impl ChangeApplier for TripApplier {
    fn data_type(&self) -> DataType {
        DataType::Trip
    }

    fn validate(&self, data: &Value) -> Result<()> {
        let trip = expect_object(data, DataType::Trip)?;
        for field in ["destination", "country", "startDate"] {
            check_field(trip, field, "a string", Value::is_string)?;
        }
        check_field(trip, "numberOfDays", "a non-negative integer", Value::is_u64)?;
        check_field(trip, "plan", "an object", Value::is_object)?;
        each_item(trip, "interests", |index, item| {
            if item.is_string() {
                Ok(())
            } else {
                Err(Error::InvalidInput(format!("interests[{index}] must be a string")))
            }
        })
    }

    fn merge(&self, local: &Value, remote: &Value, options: &MergeOptions) -> Value {
        merge_with_array_union(local, remote, options, "interests", scalar_key)
    }
}

/// Applier for packing/todo checklists
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecklistApplier;

fn checklist_item_key(item: &Value) -> Option<String> {
    id_key(item).or_else(|| {
        item.get("text")
            .or_else(|| item.get("title"))
            .and_then(Value::as_str)
            .map(|text| format!("text:{}", text.trim().to_lowercase()))
    })
}

impl ChangeApplier for ChecklistApplier {
    fn data_type(&self) -> DataType {
        DataType::Checklist
    }

    fn validate(&self, data: &Value) -> Result<()> {
        let checklist = expect_object(data, DataType::Checklist)?;
        check_field(checklist, "title", "a string", Value::is_string)?;
        each_item(checklist, "items", |index, item| {
            let item = item
                .as_object()
                .ok_or_else(|| Error::InvalidInput(format!("items[{index}] must be an object")))?;
            let has_label = ["text", "title"]
                .iter()
                .any(|field| item.get(*field).is_some_and(Value::is_string));
            if !has_label {
                return Err(Error::InvalidInput(format!(
                    "items[{index}] requires a text or title string"
                )));
            }
            check_field(item, "done", "a boolean", Value::is_boolean)?;
            check_field(item, "checked", "a boolean", Value::is_boolean)
        })
    }

    fn merge(&self, local: &Value, remote: &Value, options: &MergeOptions) -> Value {
        merge_with_array_union(local, remote, options, "items", checklist_item_key)
    }
}

/// Applier for trip budgets
#[derive(Debug, Default, Clone, Copy)]
pub struct BudgetApplier;

impl ChangeApplier for BudgetApplier {
    fn data_type(&self) -> DataType {
        DataType::Budget
    }

    fn validate(&self, data: &Value) -> Result<()> {
        let budget = expect_object(data, DataType::Budget)?;
        check_field(budget, "total", "a number", Value::is_number)?;
        check_field(budget, "amount", "a number", Value::is_number)?;
        check_field(budget, "currency", "a string", Value::is_string)?;
        each_item(budget, "expenses", |index, item| {
            let expense = item.as_object().ok_or_else(|| {
                Error::InvalidInput(format!("expenses[{index}] must be an object"))
            })?;
            if expense.get("amount").is_some_and(Value::is_number) {
                Ok(())
            } else {
                Err(Error::InvalidInput(format!(
                    "expenses[{index}].amount must be a number"
                )))
            }
        })
    }

    fn merge(&self, local: &Value, remote: &Value, options: &MergeOptions) -> Value {
        merge_with_array_union(local, remote, options, "expenses", id_key)
    }
}

/// Appliers keyed by the data type they handle
pub struct ApplierRegistry {
    appliers: HashMap<DataType, Box<dyn ChangeApplier>>,
}

impl ApplierRegistry {
    /// Registry with no appliers
    pub fn empty() -> Self {
        Self {
            appliers: HashMap::new(),
        }
    }

    /// Register (or replace) the applier for its data type
    pub fn register(&mut self, applier: impl ChangeApplier + 'static) {
        self.appliers.insert(applier.data_type(), Box::new(applier));
    }

    /// Applier for `data_type`, or `UnsupportedDataType`
    pub fn get(&self, data_type: DataType) -> Result<&dyn ChangeApplier> {
        self.appliers
            .get(&data_type)
            .map(|applier| &**applier)
            .ok_or_else(|| Error::UnsupportedDataType(data_type.to_string()))
    }
}

impl Default for ApplierRegistry {
    /// Trip, checklist and budget appliers
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(TripApplier);
        registry.register(ChecklistApplier);
        registry.register(BudgetApplier);
        registry
    }
}
