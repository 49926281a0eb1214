//! Dependency graph construction and validation.
//!
//! All structural validation happens here, before anything runs: cycle
//! detection (naming the offending members), unknown dependency references,
//! condition parsing and reference checking, and matrix expansion. A
//! partially-built invalid graph never starts.

use crate::matrix::{self, JobInstance};
use gantry_core::condition::Expr;
use gantry_core::definition::JobTemplate;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in job dependencies: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("Job '{job}' depends on unknown job '{missing}'")]
    UnknownDependency { job: String, missing: String },

    #[error("Job '{job}' condition references '{reference}', which is not among its needs")]
    UnknownConditionReference { job: String, reference: String },

    #[error("Job '{job}' has a malformed condition: {message}")]
    MalformedCondition { job: String, message: String },

    #[error("Job '{job}' has a malformed matrix: {message}")]
    MalformedMatrix { job: String, message: String },

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Empty pipeline")]
    EmptyPipeline,
}

/// One execution node: a job instance plus everything the scheduler needs to
/// drive it.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub id: String,
    pub template: Arc<JobTemplate>,
    /// Bound matrix values in axis declaration order.
    pub values: Vec<(String, serde_json::Value)>,
    pub run_if: Expr,
    pub require: Option<Expr>,
    /// Matrix sibling group, keyed by template name.
    pub group: Option<String>,
}

impl NodeMeta {
    pub fn matrix_strings(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), matrix::scalar_to_string(v)))
            .collect()
    }
}

/// Sibling-group membership, materialized eagerly so fail-fast can address
/// all cancellable siblings by group key.
#[derive(Debug)]
pub struct MatrixGroup {
    pub fail_fast: bool,
    pub max_parallel: Option<usize>,
    pub members: Vec<NodeIndex>,
}

/// Validated execution graph. Topology is immutable after build.
#[derive(Debug)]
pub struct ExecutionGraph {
    graph: DiGraph<NodeMeta, ()>,
    by_template: HashMap<String, Vec<NodeIndex>>,
    groups: HashMap<String, MatrixGroup>,
}

impl ExecutionGraph {
    /// Build and validate the graph from the templates selected for this run.
    pub fn build(templates: &[JobTemplate]) -> Result<Self, DagError> {
        if templates.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut names: HashMap<&str, usize> = HashMap::new();
        for (i, template) in templates.iter().enumerate() {
            if names.insert(template.name.as_str(), i).is_some() {
                return Err(DagError::DuplicateJob(template.name.clone()));
            }
        }

        for template in templates {
            for need in &template.needs {
                if !names.contains_key(need.as_str()) {
                    return Err(DagError::UnknownDependency {
                        job: template.name.clone(),
                        missing: need.clone(),
                    });
                }
            }
        }

        // Parse conditions once per template and check references before
        // any expansion happens.
        let mut conditions: HashMap<&str, (Expr, Option<Expr>)> = HashMap::new();
        for template in templates {
            let run_if = match &template.run_if {
                Some(raw) => parse_condition(&template.name, raw)?,
                None => Expr::default_condition(),
            };
            let require = match &template.require {
                Some(raw) => Some(parse_condition(&template.name, raw)?),
                None => None,
            };
            check_references(&template.name, &run_if, &template.needs)?;
            if let Some(expr) = &require {
                check_references(&template.name, expr, &template.needs)?;
            }
            conditions.insert(template.name.as_str(), (run_if, require));
        }

        detect_cycles(templates, &names)?;

        // Expand matrices and build the instance-level graph. Every
        // instance of a needed template becomes a dependency edge.
        let mut graph = DiGraph::new();
        let mut by_template: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        let mut groups = HashMap::new();

        for template in templates {
            let instances: Vec<JobInstance> = matrix::expand(template)?;
            let (run_if, require) = conditions[template.name.as_str()].clone();
            let shared = Arc::new(template.clone());
            let group = template.matrix.as_ref().map(|_| template.name.clone());

            let mut indices = Vec::with_capacity(instances.len());
            for instance in instances {
                let idx = graph.add_node(NodeMeta {
                    id: instance.id,
                    template: shared.clone(),
                    values: instance.values,
                    run_if: run_if.clone(),
                    require: require.clone(),
                    group: group.clone(),
                });
                indices.push(idx);
            }

            if let Some(spec) = &template.matrix {
                groups.insert(
                    template.name.clone(),
                    MatrixGroup {
                        fail_fast: spec.fail_fast,
                        max_parallel: spec.max_parallel,
                        members: indices.clone(),
                    },
                );
            }
            by_template.insert(template.name.clone(), indices);
        }

        for template in templates {
            for instance_idx in &by_template[&template.name] {
                for need in &template.needs {
                    for dep_idx in &by_template[need] {
                        graph.add_edge(*dep_idx, *instance_idx, ());
                    }
                }
            }
        }

        Ok(Self {
            graph,
            by_template,
            groups,
        })
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn node(&self, idx: NodeIndex) -> &NodeMeta {
        &self.graph[idx]
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    /// All instances expanded from the named template.
    pub fn instances_of(&self, template: &str) -> &[NodeIndex] {
        self.by_template
            .get(template)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn group(&self, name: &str) -> Option<&MatrixGroup> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> &HashMap<String, MatrixGroup> {
        &self.groups
    }

    /// Topological execution tiers: every node in tier N depends only on
    /// nodes in tiers < N. Tier membership follows longest dependency path.
    pub fn tiers(&self) -> Vec<Vec<&str>> {
        // The graph is acyclic by construction, so toposort cannot fail.
        let order = toposort(&self.graph, None).unwrap_or_default();
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut tiers: Vec<Vec<&str>> = Vec::new();

        for idx in order {
            let tier = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| level[&dep] + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, tier);
            if tiers.len() <= tier {
                tiers.resize_with(tier + 1, Vec::new);
            }
            tiers[tier].push(self.graph[idx].id.as_str());
        }
        tiers
    }
}

fn parse_condition(job: &str, raw: &str) -> Result<Expr, DagError> {
    Expr::parse(raw).map_err(|e| DagError::MalformedCondition {
        job: job.to_string(),
        message: e.to_string(),
    })
}

fn check_references(job: &str, expr: &Expr, needs: &[String]) -> Result<(), DagError> {
    for reference in expr.references() {
        if !needs.iter().any(|n| n == reference) {
            return Err(DagError::UnknownConditionReference {
                job: job.to_string(),
                reference: reference.to_string(),
            });
        }
    }
    Ok(())
}

/// Cycle detection at template level, naming the members of the first
/// strongly connected component found.
fn detect_cycles(
    templates: &[JobTemplate],
    names: &HashMap<&str, usize>,
) -> Result<(), DagError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index_of = HashMap::new();
    for template in templates {
        let idx = graph.add_node(template.name.as_str());
        index_of.insert(template.name.as_str(), idx);
    }
    for template in templates {
        for need in &template.needs {
            graph.add_edge(index_of[need.as_str()], index_of[template.name.as_str()], ());
        }
    }

    if toposort(&graph, None).is_ok() {
        return Ok(());
    }

    for scc in tarjan_scc(&graph) {
        let cyclic = scc.len() > 1
            || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
        if cyclic {
            let mut members: Vec<String> =
                scc.iter().map(|idx| graph[*idx].to_string()).collect();
            members.sort_by_key(|name| names[name.as_str()]);
            return Err(DagError::Cycle { members });
        }
    }
    // toposort failed, so a cyclic component exists.
    Err(DagError::Cycle { members: vec![] })
}
