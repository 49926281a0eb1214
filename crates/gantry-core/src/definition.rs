//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub jobs: Vec<JobTemplate>,
    #[serde(default)]
    pub policies: RunPolicies,
}

/// Declarative description of one schedulable unit before matrix expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Run condition over upstream outcomes. Absent means "all needs succeeded".
    #[serde(rename = "if", default)]
    pub run_if: Option<String>,
    /// Gate expression. A job carrying one aggregates upstream outcomes into a
    /// pass/fail signal of its own.
    #[serde(default)]
    pub require: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u64,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub on: Option<TriggerFilter>,
    #[serde(default)]
    pub cache: Option<CacheKeySpec>,
}

fn default_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Best-effort steps do not decide the node's outcome and never abort
    /// later steps.
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Matrix specification for a job template.
///
/// Axis declaration order is an observable contract: expansion iterates the
/// first axis slowest and the last axis fastest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSpec {
    pub axes: MatrixAxes,
    #[serde(default)]
    pub include: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// Ordered matrix axes. A plain map type would lose declaration order, which
/// the expansion ordering depends on.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct MatrixAxes(pub Vec<MatrixAxis>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<serde_json::Value>,
}

impl MatrixAxes {
    pub fn iter(&self) -> std::slice::Iter<'_, MatrixAxis> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'de> Deserialize<'de> for MatrixAxes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AxesVisitor;

        impl<'de> Visitor<'de> for AxesVisitor {
            type Value = MatrixAxes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of axis name to value list")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut axes = Vec::new();
                while let Some((name, values)) =
                    map.next_entry::<String, Vec<serde_json::Value>>()?
                {
                    axes.push(MatrixAxis { name, values });
                }
                Ok(MatrixAxes(axes))
            }
        }

        deserializer.deserialize_map(AxesVisitor)
    }
}

/// Cache key specification for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKeySpec {
    /// Primary key. May embed `${{ hashFiles('...') }}` placeholders resolved
    /// against the named input files.
    pub key: String,
    /// Ordered fallback prefixes tried when the primary key misses.
    #[serde(default)]
    pub restore_keys: Vec<String>,
    /// Paths the cache entry covers.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Per-job trigger filter. A job without one is included in every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerFilter {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub events: Vec<EventKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
}

/// Policy knobs for behaviors that conventional CI runners leave implicit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunPolicies {
    #[serde(default)]
    pub gate: GatePolicy,
    #[serde(default)]
    pub restore: RestorePolicy,
}

/// What a false gate expression yields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// The gate's steps still run when its run condition holds, and the node's
    /// terminal outcome is forced to Failed.
    #[default]
    Fail,
    /// A false expression short-circuits to Skipped without running steps.
    Skip,
}

/// Tie-break rule for restore-key fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    /// First declared prefix with any match wins; recency breaks ties within
    /// that prefix.
    #[default]
    PrefixOrder,
    /// The single most recent entry across all prefixes wins.
    MostRecent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_minimal_pipeline() {
        let yaml = r#"
name: demo
jobs:
  - name: build
    steps:
      - name: compile
        run: make
"#;
        let def: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.name, "demo");
        assert_eq!(def.jobs.len(), 1);
        assert_eq!(def.jobs[0].timeout_minutes, 60);
        assert_eq!(def.jobs[0].steps[0].shell, "sh");
        assert!(!def.jobs[0].steps[0].continue_on_error);
    }

    #[test]
    fn test_matrix_axes_preserve_declaration_order() {
        let yaml = r#"
axes:
  zeta: [1, 2]
  alpha: ["a", "b"]
  mid: [true]
"#;
        let spec: MatrixSpec = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<&str> = spec.axes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert!(spec.fail_fast);
        assert_eq!(spec.max_parallel, None);
    }

    #[test]
    fn test_parse_gate_job() {
        let yaml = r#"
name: gated
jobs:
  - name: build
    steps:
      - name: compile
        run: make
  - name: ci-ok
    needs: [build]
    if: always()
    require: success(build)
    steps:
      - name: marker
        run: "true"
"#;
        let def: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        let gate = &def.jobs[1];
        assert_eq!(gate.run_if.as_deref(), Some("always()"));
        assert_eq!(gate.require.as_deref(), Some("success(build)"));
    }

    #[test]
    fn test_default_policies() {
        let policies = RunPolicies::default();
        assert_eq!(policies.gate, GatePolicy::Fail);
        assert_eq!(policies.restore, RestorePolicy::PrefixOrder);
    }
}
