//! Field-owned three-way merge used by `patch`.
//!
//! A patch is the difference between the object a writer read (`original`)
//! and the object it wants (`modified`). The difference is applied onto what
//! is stored now (`current`). When `current` has moved on since `original`
//! was read, every field the patch touches must still hold its original
//! value, otherwise the patch is a conflict. Conditions in
//! `status.conditions` merge per condition type, and types listed in
//! [`PatchOptions::owned_conditions`] are taken from `modified` without a
//! conflict check.

use serde_json::{Map, Value};

use crate::error::{StateError, StateResult};

/// Metadata fields the store manages itself; never part of a patch.
const STORE_MANAGED: [&str; 4] = [
    "generation",
    "resource_version",
    "creation_timestamp",
    "deletion_timestamp",
];

/// Options controlling how a patch merges.
#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    /// Condition types this writer owns.
    pub owned_conditions: Vec<String>,
}

impl PatchOptions {
    pub fn owning_conditions<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owned_conditions: kinds.into_iter().map(Into::into).collect(),
        }
    }

    fn owns(&self, kind: &str) -> bool {
        self.owned_conditions.iter().any(|k| k == kind)
    }
}

/// Merge the `original → modified` changes onto `current`.
///
/// Returns `None` when `modified` does not differ from `original`.
/// `stale` says whether `current` has been written since `original` was read.
pub(crate) fn three_way_merge(
    original: &Value,
    modified: &Value,
    current: &Value,
    stale: bool,
    options: &PatchOptions,
) -> StateResult<Option<Value>> {
    let mut original = original.clone();
    let mut modified = modified.clone();
    let mut current = current.clone();

    let orig_conditions = take_conditions(&mut original);
    let mod_conditions = take_conditions(&mut modified);
    let curr_conditions = take_conditions(&mut current);

    let mut patch = diff(&original, &modified);
    if let Some(Value::Object(fields)) = patch.as_mut() {
        if let Some(Value::Object(meta)) = fields.get_mut("metadata") {
            for key in STORE_MANAGED {
                meta.remove(key);
            }
            if meta.is_empty() {
                fields.remove("metadata");
            }
        }
        if fields.is_empty() {
            patch = None;
        }
    }

    let merged_conditions = merge_conditions(
        &orig_conditions,
        &mod_conditions,
        &curr_conditions,
        stale,
        options,
    )?;

    if patch.is_none() && merged_conditions.is_none() {
        return Ok(None);
    }

    if let Some(patch) = &patch {
        if stale {
            check_untouched(patch, Some(&original), Some(&current), &mut Vec::new())?;
        }
        apply(&mut current, patch);
    }

    let conditions = merged_conditions.unwrap_or(curr_conditions);
    put_conditions(&mut current, conditions);
    Ok(Some(current))
}

/// RFC 7396 style diff: objects recurse, removed keys become `null`, any
/// other changed value is replaced wholesale.
fn diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut out = Map::new();
            for (key, mod_value) in modi {
                match orig.get(key) {
                    Some(orig_value) => {
                        if let Some(d) = diff(orig_value, mod_value) {
                            out.insert(key.clone(), d);
                        }
                    }
                    None => {
                        out.insert(key.clone(), mod_value.clone());
                    }
                }
            }
            for key in orig.keys() {
                if !modi.contains_key(key) {
                    out.insert(key.clone(), Value::Null);
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        _ if original == modified => None,
        _ => Some(modified.clone()),
    }
}

/// Every leaf the patch writes must be unchanged between `original` and `current`.
fn check_untouched(
    patch: &Value,
    original: Option<&Value>,
    current: Option<&Value>,
    path: &mut Vec<String>,
) -> StateResult<()> {
    if let Value::Object(fields) = patch {
        let orig_is_object = original.is_none_or(Value::is_object);
        let curr_is_object = current.is_none_or(Value::is_object);
        if orig_is_object && curr_is_object {
            for (key, sub) in fields {
                path.push(key.clone());
                check_untouched(
                    sub,
                    original.and_then(|v| v.get(key)),
                    current.and_then(|v| v.get(key)),
                    path,
                )?;
                path.pop();
            }
            return Ok(());
        }
    }
    if original != current {
        return Err(StateError::Conflict(format!(
            "field {} was modified concurrently",
            path.join(".")
        )));
    }
    Ok(())
}

fn apply(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        apply(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn take_conditions(value: &mut Value) -> Vec<Value> {
    value
        .get_mut("status")
        .and_then(Value::as_object_mut)
        .and_then(|status| status.remove("conditions"))
        .and_then(|c| match c {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default()
}

fn put_conditions(value: &mut Value, conditions: Vec<Value>) {
    if let Some(Value::Object(status)) = value.get_mut("status") {
        status.insert("conditions".to_string(), Value::Array(conditions));
    }
}

fn condition_type(condition: &Value) -> Option<&str> {
    condition.get("type").and_then(Value::as_str)
}

fn find<'a>(conditions: &'a [Value], kind: &str) -> Option<&'a Value> {
    conditions.iter().find(|c| condition_type(c) == Some(kind))
}

/// Per-type merge of condition lists. Returns `None` when `modified` changed
/// no condition.
fn merge_conditions(
    original: &[Value],
    modified: &[Value],
    current: &[Value],
    stale: bool,
    options: &PatchOptions,
) -> StateResult<Option<Vec<Value>>> {
    let mut kinds: Vec<&str> = original.iter().chain(modified).filter_map(condition_type).collect();
    kinds.sort_unstable();
    kinds.dedup();

    let mut result = current.to_vec();
    let mut changed = false;
    for kind in kinds {
        let orig = find(original, kind);
        let modi = find(modified, kind);
        if orig == modi {
            continue;
        }
        changed = true;
        if stale && !options.owns(kind) && find(current, kind) != orig {
            return Err(StateError::Conflict(format!(
                "condition {kind} was modified concurrently"
            )));
        }
        result.retain(|c| condition_type(c) != Some(kind));
        if let Some(m) = modi {
            result.push(m.clone());
        }
    }
    if !changed {
        return Ok(None);
    }
    result.sort_by(|a, b| {
        let ka = condition_type(a).unwrap_or_default();
        let kb = condition_type(b).unwrap_or_default();
        (ka != crate::conditions::READY, ka).cmp(&(kb != crate::conditions::READY, kb))
    });
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owned(kinds: &[&str]) -> PatchOptions {
        PatchOptions::owning_conditions(kinds.iter().copied())
    }

    #[test]
    fn no_change_yields_none() {
        let v = json!({"metadata": {"name": "a"}, "status": {"conditions": []}});
        let out = three_way_merge(&v, &v, &v, true, &PatchOptions::default()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn applies_changes_onto_current() {
        let original = json!({"metadata": {"labels": {"a": "1"}}, "status": {"count": 1}});
        let modified = json!({"metadata": {"labels": {"a": "1", "b": "2"}}, "status": {"count": 2}});
        let current = json!({"metadata": {"labels": {"a": "1", "c": "3"}}, "status": {"count": 1}});

        let out = three_way_merge(&original, &modified, &current, true, &PatchOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(out["metadata"]["labels"], json!({"a": "1", "b": "2", "c": "3"}));
        assert_eq!(out["status"]["count"], json!(2));
    }

    #[test]
    fn removed_fields_are_deleted() {
        let original = json!({"status": {"rollout": {"count": 1}, "x": 1}});
        let modified = json!({"status": {"x": 1}});
        let out = three_way_merge(&original, &modified, &original, false, &PatchOptions::default())
            .unwrap()
            .unwrap();
        assert!(out["status"].get("rollout").is_none());
    }

    #[test]
    fn overlapping_concurrent_change_conflicts() {
        let original = json!({"status": {"count": 1}});
        let modified = json!({"status": {"count": 2}});
        let current = json!({"status": {"count": 5}});
        let err = three_way_merge(&original, &modified, &current, true, &PatchOptions::default())
            .unwrap_err();
        assert!(err.is_conflict());

        // Not stale: the writer saw the latest version, so it simply wins.
        let out = three_way_merge(&original, &modified, &current, false, &PatchOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(out["status"]["count"], json!(2));
    }

    #[test]
    fn store_managed_metadata_is_ignored() {
        let original = json!({"metadata": {"resource_version": 1, "generation": 1}});
        let modified = json!({"metadata": {"resource_version": 9, "generation": 9}});
        let out = three_way_merge(&original, &modified, &original, true, &PatchOptions::default())
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn owned_conditions_never_conflict() {
        let original = json!({"status": {"conditions": [
            {"type": "Ready", "status": "Unknown"},
            {"type": "Other", "status": "True"}
        ]}});
        let modified = json!({"status": {"conditions": [
            {"type": "Ready", "status": "True"},
            {"type": "Other", "status": "True"}
        ]}});
        let current = json!({"status": {"conditions": [
            {"type": "Ready", "status": "False"},
            {"type": "Other", "status": "False"}
        ]}});

        let out = three_way_merge(&original, &modified, &current, true, &owned(&["Ready"]))
            .unwrap()
            .unwrap();
        let conditions = out["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions[0], json!({"type": "Ready", "status": "True"}));
        // Untouched by this writer: the concurrent value survives.
        assert_eq!(conditions[1], json!({"type": "Other", "status": "False"}));

        let err = three_way_merge(&original, &modified, &current, true, &owned(&[])).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn new_conditions_are_appended_in_order() {
        let original = json!({"status": {"conditions": [{"type": "Zeta", "status": "True"}]}});
        let modified = json!({"status": {"conditions": [
            {"type": "Ready", "status": "True"},
            {"type": "Alpha", "status": "True"},
            {"type": "Zeta", "status": "True"}
        ]}});
        let out = three_way_merge(&original, &modified, &original, false, &PatchOptions::default())
            .unwrap()
            .unwrap();
        let kinds: Vec<_> = out["status"]["conditions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["Ready", "Alpha", "Zeta"]);
    }
}
