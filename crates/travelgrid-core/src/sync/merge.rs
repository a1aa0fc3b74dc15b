//! Field-level merge strategies used by the `merge` resolution.
//!
//! `serde_json::Map` is ordered by key here, so equal inputs always produce
//! byte-identical output.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Which version wins a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Side {
    Local,
    #[default]
    Remote,
}

impl Side {
    fn parse(value: &Value, context: &str) -> Result<Self> {
        match value.as_str() {
            Some("local") => Ok(Self::Local),
            Some("remote") => Ok(Self::Remote),
            _ => Err(Error::InvalidInput(format!(
                "{context} must be \"local\" or \"remote\""
            ))),
        }
    }

    const fn pick<'a>(self, local: &'a Value, remote: &'a Value) -> &'a Value {
        match self {
            Self::Local => local,
            Self::Remote => remote,
        }
    }
}

/// Caller-supplied merge policy taken from `resolutionData`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
    pub prefer: Side,
    pub fields: BTreeMap<String, Side>,
}

impl MergeOptions {
    /// Parse `{"prefer": "local"|"remote", "fields": {"name": "local"|"remote"}}`.
    ///
    /// Absent or null data means "prefer remote for every field".
    pub fn from_resolution_data(data: Option<&Value>) -> Result<Self> {
        let Some(data) = data.filter(|data| !data.is_null()) else {
            return Ok(Self::default());
        };
        let object = data
            .as_object()
            .ok_or_else(|| Error::InvalidInput("merge resolutionData must be an object".into()))?;

        let prefer = match object.get("prefer") {
            Some(value) => Side::parse(value, "resolutionData.prefer")?,
            None => Side::default(),
        };

        let mut fields = BTreeMap::new();
        if let Some(overrides) = object.get("fields") {
            let overrides = overrides.as_object().ok_or_else(|| {
                Error::InvalidInput("resolutionData.fields must be an object".into())
            })?;
            for (name, side) in overrides {
                fields.insert(
                    name.clone(),
                    Side::parse(side, &format!("resolutionData.fields.{name}"))?,
                );
            }
        }

        Ok(Self { prefer, fields })
    }

    /// Side that wins the named field
    pub fn side_for(&self, field: &str) -> Side {
        self.fields.get(field).copied().unwrap_or(self.prefer)
    }
}

/// Overlay `remote` onto `local` field by field.
///
/// Fields present on one side only are always kept; fields present on both
/// sides take the value from the side chosen by `options`.
pub fn merge_fields(local: &Value, remote: &Value, options: &MergeOptions) -> Value {
    let (Some(local_map), Some(remote_map)) = (local.as_object(), remote.as_object()) else {
        return options.prefer.pick(local, remote).clone();
    };

    let mut merged: Map<String, Value> = local_map.clone();
    for (field, remote_value) in remote_map {
        match local_map.get(field) {
            Some(local_value) => {
                let winner = options.side_for(field).pick(local_value, remote_value);
                merged.insert(field.clone(), winner.clone());
            }
            None => {
                merged.insert(field.clone(), remote_value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Union two arrays, matching elements by `key`.
///
/// Local order comes first, then remote-only elements in remote order. Elements
/// present on both sides take the version from `prefer`. Elements without a key
/// are kept from both sides unless an identical value is already present.
pub fn union_by_key(
    local: &Value,
    remote: &Value,
    prefer: Side,
    key: impl Fn(&Value) -> Option<String>,
) -> Value {
    let (Some(local_items), Some(remote_items)) = (local.as_array(), remote.as_array()) else {
        return prefer.pick(local, remote).clone();
    };

    let remote_by_key: BTreeMap<String, &Value> = remote_items
        .iter()
        .filter_map(|item| key(item).map(|k| (k, item)))
        .collect();

    let mut merged: Vec<Value> = Vec::with_capacity(local_items.len() + remote_items.len());
    let mut seen_keys = Vec::new();
    for item in local_items {
        match key(item) {
            Some(k) => {
                let chosen = remote_by_key
                    .get(&k)
                    .map_or(item, |remote_item| prefer.pick(item, remote_item));
                merged.push(chosen.clone());
                seen_keys.push(k);
            }
            None => merged.push(item.clone()),
        }
    }

    for item in remote_items {
        let duplicate = match key(item) {
            Some(k) => seen_keys.contains(&k),
            None => merged.contains(item),
        };
        if !duplicate {
            merged.push(item.clone());
        }
    }

    Value::Array(merged)
}

/// Merge `local` and `remote`, then union the named array field by `key`.
pub fn merge_with_array_union(
    local: &Value,
    remote: &Value,
    options: &MergeOptions,
    field: &str,
    key: impl Fn(&Value) -> Option<String>,
) -> Value {
    let mut merged = merge_fields(local, remote, options);
    if let (Some(local_items), Some(remote_items), Some(target)) = (
        local.get(field),
        remote.get(field),
        merged.as_object_mut(),
    ) {
        target.insert(
            field.to_string(),
            union_by_key(local_items, remote_items, options.side_for(field), key),
        );
    }
    merged
}

/// Key an array element by its string or numeric `id` field
pub fn id_key(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Key scalar array elements by their own value
pub fn scalar_key(item: &Value) -> Option<String> {
    match item {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn options_default_to_remote() {
        let options = MergeOptions::from_resolution_data(None).unwrap();
        assert_eq!(options.prefer, Side::Remote);
        assert_eq!(options.side_for("anything"), Side::Remote);
    }

    #[test]
    fn options_parse_field_overrides() {
        let data = json!({"prefer": "local", "fields": {"destination": "remote"}});
        let options = MergeOptions::from_resolution_data(Some(&data)).unwrap();
        assert_eq!(options.side_for("destination"), Side::Remote);
        assert_eq!(options.side_for("startDate"), Side::Local);
    }

    #[test]
    fn options_reject_unknown_side() {
        let data = json!({"prefer": "newest"});
        assert!(MergeOptions::from_resolution_data(Some(&data)).is_err());
    }

    #[test]
    fn merge_fields_keeps_one_sided_fields() {
        let local = json!({"destination": "Lima", "country": "Peru"});
        let remote = json!({"destination": "Cusco", "numberOfDays": 5});
        let merged = merge_fields(&local, &remote, &MergeOptions::default());
        assert_eq!(
            merged,
            json!({"country": "Peru", "destination": "Cusco", "numberOfDays": 5})
        );
    }

    #[test]
    fn merge_fields_honors_local_preference() {
        let local = json!({"destination": "Lima"});
        let remote = json!({"destination": "Cusco"});
        let options = MergeOptions {
            prefer: Side::Local,
            ..MergeOptions::default()
        };
        assert_eq!(
            merge_fields(&local, &remote, &options),
            json!({"destination": "Lima"})
        );
    }

    #[test]
    fn union_by_key_merges_and_orders() {
        let local = json!([{"id": "a", "text": "passport"}, {"id": "b", "text": "charger"}]);
        let remote = json!([{"id": "b", "text": "charger", "done": true}, {"id": "c", "text": "adapter"}]);
        let merged = union_by_key(&local, &remote, Side::Remote, id_key);
        assert_eq!(
            merged,
            json!([
                {"id": "a", "text": "passport"},
                {"id": "b", "text": "charger", "done": true},
                {"id": "c", "text": "adapter"}
            ])
        );
    }

    #[test]
    fn union_by_key_is_deterministic() {
        let local = json!({"interests": ["food", "art"]});
        let remote = json!({"interests": ["art", "hiking"]});
        let options = MergeOptions::default();
        let first = merge_with_array_union(&local, &remote, &options, "interests", scalar_key);
        let second = merge_with_array_union(&local, &remote, &options, "interests", scalar_key);
        assert_eq!(first, second);
        assert_eq!(first, json!({"interests": ["food", "art", "hiking"]}));
    }
}
