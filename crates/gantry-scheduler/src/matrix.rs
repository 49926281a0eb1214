//! Matrix expansion of job templates into concrete instances.

use crate::dag::DagError;
use gantry_core::definition::JobTemplate;
use std::collections::HashMap;

/// One concrete, schedulable expansion of a template.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Unique identifier: the template name, suffixed by the axis value
    /// tuple when a matrix is present (`name[os=linux,version=18]`).
    pub id: String,
    pub template: String,
    /// Bound matrix values in axis declaration order.
    pub values: Vec<(String, serde_json::Value)>,
}

impl JobInstance {
    /// Matrix values as strings, for `${{ matrix.key }}` interpolation.
    pub fn matrix_strings(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect()
    }
}

pub fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand a template into its job instances.
///
/// The cross product iterates the first declared axis slowest and the last
/// fastest; `include` entries not already present are appended afterwards in
/// declaration order; `exclude` entries subset-match combinations out. This
/// ordering is an observable contract.
pub fn expand(template: &JobTemplate) -> Result<Vec<JobInstance>, DagError> {
    let Some(matrix) = &template.matrix else {
        return Ok(vec![JobInstance {
            id: template.name.clone(),
            template: template.name.clone(),
            values: Vec::new(),
        }]);
    };

    for axis in matrix.axes.iter() {
        if axis.values.is_empty() {
            return Err(DagError::MalformedMatrix {
                job: template.name.clone(),
                message: format!("axis '{}' has no values", axis.name),
            });
        }
    }

    let mut combinations: Vec<Vec<(String, serde_json::Value)>> = vec![Vec::new()];
    for axis in matrix.axes.iter() {
        let mut next = Vec::with_capacity(combinations.len() * axis.values.len());
        for combo in &combinations {
            for value in &axis.values {
                let mut extended = combo.clone();
                extended.push((axis.name.clone(), value.clone()));
                next.push(extended);
            }
        }
        combinations = next;
    }

    for include in &matrix.include {
        if include.is_empty() {
            return Err(DagError::MalformedMatrix {
                job: template.name.clone(),
                message: "empty include entry".to_string(),
            });
        }
        if !combinations.iter().any(|c| combo_equals(c, include)) {
            combinations.push(ordered_entry(include, &matrix.axes));
        }
    }

    combinations.retain(|combo| !matrix.exclude.iter().any(|ex| subset_matches(combo, ex)));

    Ok(combinations
        .into_iter()
        .map(|values| JobInstance {
            id: instance_id(&template.name, &values),
            template: template.name.clone(),
            values,
        })
        .collect())
}

fn instance_id(name: &str, values: &[(String, serde_json::Value)]) -> String {
    if values.is_empty() {
        return name.to_string();
    }
    let parts: Vec<String> = values
        .iter()
        .map(|(k, v)| format!("{}={}", k, scalar_to_string(v)))
        .collect();
    format!("{}[{}]", name, parts.join(","))
}

fn combo_equals(
    combo: &[(String, serde_json::Value)],
    entry: &HashMap<String, serde_json::Value>,
) -> bool {
    combo.len() == entry.len()
        && combo
            .iter()
            .all(|(k, v)| entry.get(k) == Some(v))
}

fn subset_matches(
    combo: &[(String, serde_json::Value)],
    exclude: &HashMap<String, serde_json::Value>,
) -> bool {
    !exclude.is_empty()
        && exclude.iter().all(|(k, v)| {
            combo
                .iter()
                .any(|(ck, cv)| ck == k && cv == v)
        })
}

/// Order an include entry's pairs by axis declaration order first, remaining
/// keys alphabetically, so instance identifiers are deterministic.
fn ordered_entry(
    entry: &HashMap<String, serde_json::Value>,
    axes: &gantry_core::definition::MatrixAxes,
) -> Vec<(String, serde_json::Value)> {
    let mut ordered = Vec::with_capacity(entry.len());
    for axis in axes.iter() {
        if let Some(value) = entry.get(&axis.name) {
            ordered.push((axis.name.clone(), value.clone()));
        }
    }
    let mut extras: Vec<&String> = entry
        .keys()
        .filter(|k| !axes.iter().any(|a| &a.name == *k))
        .collect();
    extras.sort();
    for key in extras {
        ordered.push((key.clone(), entry[key].clone()));
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::definition::{MatrixAxes, MatrixAxis, MatrixSpec, StepDefinition};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn step() -> StepDefinition {
        StepDefinition {
            name: "run".to_string(),
            run: "true".to_string(),
            shell: "sh".to_string(),
            working_directory: None,
            env: Default::default(),
            continue_on_error: false,
        }
    }

    fn template(name: &str, matrix: Option<MatrixSpec>) -> JobTemplate {
        JobTemplate {
            name: name.to_string(),
            needs: vec![],
            run_if: None,
            require: None,
            matrix,
            timeout_minutes: 60,
            steps: vec![step()],
            env: Default::default(),
            on: None,
            cache: None,
        }
    }

    fn axes(pairs: &[(&str, Vec<serde_json::Value>)]) -> MatrixAxes {
        MatrixAxes(
            pairs
                .iter()
                .map(|(name, values)| MatrixAxis {
                    name: name.to_string(),
                    values: values.clone(),
                })
                .collect(),
        )
    }

    fn spec(axes: MatrixAxes) -> MatrixSpec {
        MatrixSpec {
            axes,
            include: vec![],
            exclude: vec![],
            fail_fast: true,
            max_parallel: None,
        }
    }

    #[test]
    fn test_no_matrix_yields_single_instance() {
        let instances = expand(&template("build", None)).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "build");
        assert!(instances[0].values.is_empty());
    }

    #[test]
    fn test_cross_product_size_and_order() {
        let m = spec(axes(&[
            ("os", vec![json!("linux"), json!("macos")]),
            ("version", vec![json!(18), json!(20), json!(22)]),
        ]));
        let instances = expand(&template("test", Some(m))).unwrap();

        assert_eq!(instances.len(), 6);
        // First axis varies slowest, last fastest.
        let ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "test[os=linux,version=18]",
                "test[os=linux,version=20]",
                "test[os=linux,version=22]",
                "test[os=macos,version=18]",
                "test[os=macos,version=20]",
                "test[os=macos,version=22]",
            ]
        );
    }

    #[test]
    fn test_include_appended_after_cross_product() {
        let mut m = spec(axes(&[("os", vec![json!("linux"), json!("macos")])]));
        m.include = vec![HashMap::from([
            ("os".to_string(), json!("windows")),
            ("experimental".to_string(), json!(true)),
        ])];
        let instances = expand(&template("test", Some(m))).unwrap();

        assert_eq!(instances.len(), 3);
        assert_eq!(instances[2].id, "test[os=windows,experimental=true]");
    }

    #[test]
    fn test_include_duplicate_of_cross_product_not_added() {
        let mut m = spec(axes(&[("os", vec![json!("linux")])]));
        m.include = vec![HashMap::from([("os".to_string(), json!("linux"))])];
        let instances = expand(&template("test", Some(m))).unwrap();
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn test_exclude_subset_match() {
        let mut m = spec(axes(&[
            ("os", vec![json!("linux"), json!("macos")]),
            ("arch", vec![json!("amd64"), json!("arm64")]),
        ]));
        m.exclude = vec![HashMap::from([
            ("os".to_string(), json!("macos")),
            ("arch".to_string(), json!("amd64")),
        ])];
        let instances = expand(&template("build", Some(m))).unwrap();

        assert_eq!(instances.len(), 3);
        assert!(!instances.iter().any(|i| i.id == "build[os=macos,arch=amd64]"));
    }

    #[test]
    fn test_exclude_single_key_removes_whole_row() {
        let mut m = spec(axes(&[
            ("os", vec![json!("linux"), json!("macos")]),
            ("arch", vec![json!("amd64"), json!("arm64")]),
        ]));
        m.exclude = vec![HashMap::from([("os".to_string(), json!("macos"))])];
        let instances = expand(&template("build", Some(m))).unwrap();
        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn test_empty_axis_is_malformed() {
        let m = spec(axes(&[("os", vec![])]));
        let err = expand(&template("build", Some(m))).unwrap_err();
        assert!(matches!(err, DagError::MalformedMatrix { .. }));
    }

    #[test]
    fn test_unique_identifiers() {
        let m = spec(axes(&[
            ("a", vec![json!(1), json!(2)]),
            ("b", vec![json!("x"), json!("y")]),
        ]));
        let instances = expand(&template("j", Some(m))).unwrap();
        let mut ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn test_matrix_strings_unquoted() {
        let m = spec(axes(&[
            ("os", vec![json!("linux")]),
            ("version", vec![json!(20)]),
        ]));
        let instances = expand(&template("t", Some(m))).unwrap();
        let strings = instances[0].matrix_strings();
        assert_eq!(strings["os"], "linux");
        assert_eq!(strings["version"], "20");
    }
}
