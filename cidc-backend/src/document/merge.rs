use serde_json::Value;

use super::{Error, Result};

/// Keys that identify an element of an array of objects, in order of
/// precedence. Patch elements are merged into the base element with the same
/// identity instead of being appended.
pub const IDENTITY_KEYS: [&str; 8] = [
    "cimac_participant_id",
    "cimac_id",
    "manifest_id",
    "slide_number",
    "batch_id",
    "assay_run_id",
    "upload_placeholder",
    "object_url",
];

/// Merge `patch` into a copy of `base`.
///
/// Objects merge key by key. Arrays of identifiable objects merge element by
/// element, and other arrays gain the patch elements they lack. Nulls in the
/// patch change nothing. A scalar that differs from the base is a conflict.
///
/// # Errors
/// [`Error::MergeConflict`] naming the path of the first conflicting value.
pub fn merge_patch(base: &Value, patch: &Value) -> Result<Value> {
    let mut merged = base.clone();
    merge_at(&mut merged, patch, "")?;

    Ok(merged)
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn identity(value: &Value) -> Option<(&'static str, &Value)> {
    let object = value.as_object()?;

    IDENTITY_KEYS
        .into_iter()
        .find_map(|key| object.get(key).filter(|v| !v.is_null()).map(|v| (key, v)))
}

fn merge_at(base: &mut Value, patch: &Value, path: &str) -> Result<()> {
    if patch.is_null() {
        return Ok(());
    }
    if base.is_null() {
        *base = patch.clone();
        return Ok(());
    }

    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_at(existing, value, &child_path(path, key))?,
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(())
        }
        (Value::Array(base), Value::Array(patch)) => merge_arrays(base, patch, path),
        (base, patch) if *base == *patch => Ok(()),
        (base, patch) => Err(Error::MergeConflict {
            path: path.to_string(),
            base: base.clone(),
            patch: patch.clone(),
        }),
    }
}

fn merge_arrays(base: &mut Vec<Value>, patch: &[Value], path: &str) -> Result<()> {
    for element in patch {
        let Some((key, id)) = identity(element) else {
            if !base.contains(element) {
                base.push(element.clone());
            }
            continue;
        };

        let position = base
            .iter()
            .position(|b| identity(b).is_some_and(|(k, v)| k == key && v == id));

        match position {
            Some(i) => {
                let element_path = format!("{path}[{key}={}]", display_id(id));
                merge_at(&mut base[i], element, &element_path)?;
            }
            None => base.push(element.clone()),
        }
    }

    Ok(())
}

fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn objects_merge_recursively() {
        let merged = merge_patch(
            &json!({"a": {"b": 1}, "c": "kept"}),
            &json!({"a": {"d": 2}, "e": null}),
        )
        .unwrap();

        assert_eq!(merged, json!({"a": {"b": 1, "d": 2}, "c": "kept"}));
    }

    #[test]
    fn identified_elements_merge_in_place() {
        let base = json!({"participants": [
            {"cimac_participant_id": "CTTTPP1", "samples": [{"cimac_id": "CTTTPP101.00"}]}
        ]});
        let patch = json!({"participants": [
            {"cimac_participant_id": "CTTTPP1", "samples": [{"cimac_id": "CTTTPP102.00"}]},
            {"cimac_participant_id": "CTTTPP2", "samples": []}
        ]});

        let merged = merge_patch(&base, &patch).unwrap();

        assert_eq!(
            merged,
            json!({"participants": [
                {"cimac_participant_id": "CTTTPP1", "samples": [
                    {"cimac_id": "CTTTPP101.00"},
                    {"cimac_id": "CTTTPP102.00"}
                ]},
                {"cimac_participant_id": "CTTTPP2", "samples": []}
            ]})
        );
    }

    #[test]
    fn plain_arrays_gain_missing_elements() {
        let merged = merge_patch(
            &json!({"allowed_cohort_names": ["Arm_A", "Arm_B"]}),
            &json!({"allowed_cohort_names": ["Arm_B", "Arm_C"]}),
        )
        .unwrap();

        assert_eq!(merged, json!({"allowed_cohort_names": ["Arm_A", "Arm_B", "Arm_C"]}));
    }

    #[test]
    fn equal_scalars_are_not_conflicts() {
        let base = json!({"protocol_identifier": "10021", "shipments": [{"manifest_id": "M1", "courier": "FedEx"}]});

        assert_eq!(merge_patch(&base, &base).unwrap(), base);
    }

    #[test]
    fn conflicting_scalar_reports_its_path() {
        let base = json!({"shipments": [{"manifest_id": "M1", "courier": "FedEx"}]});
        let patch = json!({"shipments": [{"manifest_id": "M1", "courier": "UPS"}]});

        assert_eq!(
            merge_patch(&base, &patch),
            Err(Error::MergeConflict {
                path: "shipments[manifest_id=M1].courier".to_string(),
                base: json!("FedEx"),
                patch: json!("UPS"),
            })
        );
    }
}
