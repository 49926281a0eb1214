//! Run scheduling.
//!
//! The scheduler owns all node state on its own task. Node work runs on a
//! [`JoinSet`]; every completion message is applied to the state map, which
//! may promote further nodes, until every node holds a terminal outcome.
//! There is no polling and no shared mutable state between node tasks.

use crate::dag::{ExecutionGraph, NodeMeta};
use chrono::Utc;
use gantry_cache::resolver::{KeyResolver, ResolvedCacheKey};
use gantry_cache::store::CacheStore;
use gantry_core::definition::{GatePolicy, RestorePolicy, RunPolicies, StepDefinition};
use gantry_core::interpolation::InterpolationContext;
use gantry_core::outcome::{NodeState, Outcome};
use gantry_core::ports::{OutputLine, StepContext, StepExecutor};
use gantry_core::report::{NodeResult, RunReport};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REASON_FAIL_FAST: &str = "cancelled by fail-fast";
const REASON_RUN_CONDITION: &str = "run condition unmet";
const REASON_GATE: &str = "gate condition unmet";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workspace: PathBuf,
    pub variables: HashMap<String, String>,
    pub policies: RunPolicies,
    /// How long a cancelled node's running step may keep going before its
    /// future is dropped.
    pub grace_period: Duration,
}

impl SchedulerConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            variables: HashMap::new(),
            policies: RunPolicies::default(),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Drives an [`ExecutionGraph`] to completion.
pub struct Scheduler {
    executor: Arc<dyn StepExecutor>,
    cache: Option<Arc<dyn CacheStore>>,
    config: SchedulerConfig,
}

/// Completion message from one node task.
#[derive(Debug)]
struct NodeFinish {
    idx: NodeIndex,
    outcome: Outcome,
    duration_ms: u64,
    reason: Option<String>,
    restored_key: Option<String>,
}

/// Everything a node task needs, owned, so the task borrows nothing from the
/// scheduler loop.
struct NodePlan {
    idx: NodeIndex,
    id: String,
    steps: Vec<StepDefinition>,
    env: HashMap<String, String>,
    workspace: PathBuf,
    timeout: Duration,
    /// A gate whose expression came up false still runs its steps, then has
    /// a successful outcome forced to Failed.
    gate_unmet: bool,
    cache: Option<CachePlan>,
}

struct CachePlan {
    store: Arc<dyn CacheStore>,
    resolved: ResolvedCacheKey,
    policy: RestorePolicy,
    paths: Vec<String>,
}

/// Per-run cancellation and concurrency plumbing, one slot per matrix group.
struct RunChannels {
    groups: HashMap<String, watch::Sender<bool>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    never: watch::Sender<bool>,
}

impl RunChannels {
    fn for_graph(graph: &ExecutionGraph) -> Self {
        let mut groups = HashMap::new();
        let mut semaphores = HashMap::new();
        for (name, group) in graph.groups() {
            let (tx, _rx) = watch::channel(false);
            groups.insert(name.clone(), tx);
            if let Some(limit) = group.max_parallel {
                semaphores.insert(name.clone(), Arc::new(Semaphore::new(limit.max(1))));
            }
        }
        let (never, _rx) = watch::channel(false);
        Self {
            groups,
            semaphores,
            never,
        }
    }

    fn cancel_receiver(&self, meta: &NodeMeta) -> watch::Receiver<bool> {
        match &meta.group {
            Some(name) => self.groups[name].subscribe(),
            None => self.never.subscribe(),
        }
    }

    fn semaphore(&self, meta: &NodeMeta) -> Option<Arc<Semaphore>> {
        meta.group
            .as_ref()
            .and_then(|name| self.semaphores.get(name))
            .cloned()
    }
}

impl Scheduler {
    pub fn new(executor: Arc<dyn StepExecutor>, config: SchedulerConfig) -> Self {
        Self {
            executor,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Run every node of the graph to a terminal outcome and report.
    pub async fn run(
        &self,
        pipeline: &str,
        graph: &ExecutionGraph,
        output: mpsc::Sender<OutputLine>,
    ) -> RunReport {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        info!(run_id = %run_id, pipeline = %pipeline, nodes = graph.node_count(), "run started");

        let mut states: HashMap<NodeIndex, NodeState> =
            graph.indices().map(|idx| (idx, NodeState::Pending)).collect();
        let mut records: HashMap<NodeIndex, NodeFinish> = HashMap::new();
        let mut join_set: JoinSet<NodeFinish> = JoinSet::new();
        let channels = RunChannels::for_graph(graph);

        self.promote(graph, &mut states, &mut records, &mut join_set, &channels, &output);

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(finish) => {
                    debug!(node = %graph.node(finish.idx).id, outcome = %finish.outcome, "node finished");
                    states.insert(finish.idx, NodeState::Done(finish.outcome));
                    if finish.outcome.counts_as_failure() {
                        self.fail_fast(graph, finish.idx, &mut states, &mut records, &channels);
                    }
                    records.insert(finish.idx, finish);
                }
                Err(e) => {
                    error!(error = %e, "node task aborted");
                }
            }
            self.promote(graph, &mut states, &mut records, &mut join_set, &channels, &output);
        }

        // A task abort can leave nodes stranded; close them out.
        for idx in graph.indices() {
            if !states[&idx].is_terminal() {
                states.insert(idx, NodeState::Done(Outcome::Cancelled));
                records.insert(
                    idx,
                    NodeFinish {
                        idx,
                        outcome: Outcome::Cancelled,
                        duration_ms: 0,
                        reason: Some("never scheduled".to_string()),
                        restored_key: None,
                    },
                );
            }
        }

        let nodes: Vec<NodeResult> = graph
            .indices()
            .map(|idx| {
                let record = records.remove(&idx);
                NodeResult {
                    name: graph.node(idx).id.clone(),
                    outcome: states[&idx].outcome().unwrap_or(Outcome::Cancelled),
                    duration_ms: record.as_ref().map(|r| r.duration_ms).unwrap_or(0),
                    reason: record.as_ref().and_then(|r| r.reason.clone()),
                    restored_key: record.and_then(|r| r.restored_key),
                }
            })
            .collect();

        let report = RunReport::from_results(run_id, pipeline, nodes, started_at, Utc::now());
        info!(run_id = %run_id, success = report.success, duration_ms = report.duration_ms, "run finished");
        report
    }

    /// Promote pending nodes whose dependencies are all terminal, to a
    /// fixpoint. Skipping a node is itself terminal and can unblock others.
    fn promote(
        &self,
        graph: &ExecutionGraph,
        states: &mut HashMap<NodeIndex, NodeState>,
        records: &mut HashMap<NodeIndex, NodeFinish>,
        join_set: &mut JoinSet<NodeFinish>,
        channels: &RunChannels,
        output: &mpsc::Sender<OutputLine>,
    ) {
        loop {
            let mut changed = false;
            for idx in graph.indices() {
                if states[&idx] != NodeState::Pending {
                    continue;
                }
                let deps = graph.dependencies(idx);
                if !deps.iter().all(|d| states[d].is_terminal()) {
                    continue;
                }

                let meta = graph.node(idx);
                let outcomes = dep_outcomes(graph, meta, states);
                let needs = &meta.template.needs;

                if !meta.run_if.evaluate(&outcomes, needs) {
                    debug!(node = %meta.id, "skipped");
                    states.insert(idx, NodeState::Done(Outcome::Skipped));
                    records.insert(idx, skip_record(idx, REASON_RUN_CONDITION));
                    changed = true;
                    continue;
                }

                let gate_unmet = match &meta.require {
                    Some(expr) => !expr.evaluate(&outcomes, needs),
                    None => false,
                };
                if gate_unmet && self.config.policies.gate == GatePolicy::Skip {
                    debug!(node = %meta.id, "gate unmet, skipped");
                    states.insert(idx, NodeState::Done(Outcome::Skipped));
                    records.insert(idx, skip_record(idx, REASON_GATE));
                    changed = true;
                    continue;
                }

                debug!(node = %meta.id, "spawning");
                states.insert(idx, NodeState::Running);
                let plan = self.build_plan(graph, idx, gate_unmet);
                join_set.spawn(run_node(
                    self.executor.clone(),
                    plan,
                    channels.cancel_receiver(meta),
                    channels.semaphore(meta),
                    output.clone(),
                    self.config.grace_period,
                ));
            }
            if !changed {
                break;
            }
        }
    }

    /// Cancel a failed node's matrix siblings when its group is fail-fast.
    /// Running siblings get the watch signal; pending ones terminate here and
    /// never spawn.
    fn fail_fast(
        &self,
        graph: &ExecutionGraph,
        idx: NodeIndex,
        states: &mut HashMap<NodeIndex, NodeState>,
        records: &mut HashMap<NodeIndex, NodeFinish>,
        channels: &RunChannels,
    ) {
        let meta = graph.node(idx);
        let Some(group_name) = &meta.group else {
            return;
        };
        let Some(group) = graph.group(group_name) else {
            return;
        };
        if !group.fail_fast {
            return;
        }

        warn!(group = %group_name, failed = %meta.id, "fail-fast triggered");
        if let Some(tx) = channels.groups.get(group_name) {
            let _ = tx.send(true);
        }
        for sibling in &group.members {
            if states[sibling] == NodeState::Pending {
                states.insert(*sibling, NodeState::Done(Outcome::Cancelled));
                records.insert(
                    *sibling,
                    NodeFinish {
                        idx: *sibling,
                        outcome: Outcome::Cancelled,
                        duration_ms: 0,
                        reason: Some(REASON_FAIL_FAST.to_string()),
                        restored_key: None,
                    },
                );
            }
        }
    }

    fn build_plan(&self, graph: &ExecutionGraph, idx: NodeIndex, gate_unmet: bool) -> NodePlan {
        let meta = graph.node(idx);
        let mut ctx = InterpolationContext::new();
        ctx.variables = self.config.variables.clone();
        ctx.matrix = meta.matrix_strings();

        let env = interpolate_env(&meta.template.env, &ctx);
        let steps = meta
            .template
            .steps
            .iter()
            .map(|s| StepDefinition {
                name: s.name.clone(),
                run: ctx.interpolate(&s.run),
                shell: s.shell.clone(),
                working_directory: s.working_directory.as_deref().map(|w| ctx.interpolate(w)),
                env: interpolate_env(&s.env, &ctx),
                continue_on_error: s.continue_on_error,
            })
            .collect();

        let cache = match (&meta.template.cache, &self.cache) {
            (Some(spec), Some(store)) => Some(CachePlan {
                store: store.clone(),
                resolved: KeyResolver::new().resolve(spec, &self.config.workspace, &ctx),
                policy: self.config.policies.restore,
                paths: spec.paths.clone(),
            }),
            _ => None,
        };

        NodePlan {
            idx,
            id: meta.id.clone(),
            steps,
            env,
            workspace: self.config.workspace.clone(),
            timeout: Duration::from_secs(meta.template.timeout_minutes * 60),
            gate_unmet,
            cache,
        }
    }
}

fn interpolate_env(
    env: &HashMap<String, String>,
    ctx: &InterpolationContext,
) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), ctx.interpolate(v)))
        .collect()
}

fn skip_record(idx: NodeIndex, reason: &str) -> NodeFinish {
    NodeFinish {
        idx,
        outcome: Outcome::Skipped,
        duration_ms: 0,
        reason: Some(reason.to_string()),
        restored_key: None,
    }
}

/// Aggregate terminal outcomes per needed template. A template with several
/// matrix instances folds to its worst instance outcome.
fn dep_outcomes(
    graph: &ExecutionGraph,
    meta: &NodeMeta,
    states: &HashMap<NodeIndex, NodeState>,
) -> HashMap<String, Outcome> {
    meta.template
        .needs
        .iter()
        .map(|need| {
            let agg = Outcome::aggregate(
                graph
                    .instances_of(need)
                    .iter()
                    .filter_map(|i| states[i].outcome()),
            );
            (need.clone(), agg)
        })
        .collect()
}

/// Drive one node: cancellation checks, cache restore, step execution under
/// the node timeout, gate verdict, cache save.
async fn run_node(
    executor: Arc<dyn StepExecutor>,
    plan: NodePlan,
    cancel: watch::Receiver<bool>,
    semaphore: Option<Arc<Semaphore>>,
    output: mpsc::Sender<OutputLine>,
    grace: Duration,
) -> NodeFinish {
    let started = tokio::time::Instant::now();
    let idx = plan.idx;
    let finish = |outcome, reason: Option<String>, restored_key: Option<String>, started: tokio::time::Instant| NodeFinish {
        idx,
        outcome,
        duration_ms: started.elapsed().as_millis() as u64,
        reason,
        restored_key,
    };

    if *cancel.borrow() {
        return finish(Outcome::Cancelled, Some(REASON_FAIL_FAST.to_string()), None, started);
    }

    let _permit: Option<OwnedSemaphorePermit> = match semaphore {
        Some(sem) => match sem.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                return finish(Outcome::Cancelled, Some(REASON_FAIL_FAST.to_string()), None, started);
            }
        },
        None => None,
    };
    // A sibling may have failed while this node waited for a slot.
    if *cancel.borrow() {
        return finish(Outcome::Cancelled, Some(REASON_FAIL_FAST.to_string()), None, started);
    }

    let mut restored_key = None;
    let mut exact_hit = false;
    if let Some(cache) = &plan.cache {
        let restore = KeyResolver::new()
            .restore(cache.store.as_ref(), &cache.resolved, cache.policy)
            .await;
        exact_hit = restore.is_exact();
        restored_key = restore.matched_key().map(str::to_string);
    }

    let steps_fut = run_steps(executor.as_ref(), &plan, &output);
    tokio::pin!(steps_fut);
    // Steps keep running through the grace window after a cancel signal; a
    // natural completion inside the window keeps its own outcome.
    let cancel_deadline = async move {
        cancel_signal(cancel).await;
        tokio::time::sleep(grace).await;
    };

    let (mut outcome, mut reason) = tokio::select! {
        res = tokio::time::timeout(plan.timeout, &mut steps_fut) => match res {
            Ok((outcome, reason)) => (outcome, reason),
            Err(_) => (
                Outcome::TimedOut,
                Some(format!("exceeded timeout of {} minutes", plan.timeout.as_secs() / 60)),
            ),
        },
        _ = cancel_deadline => (Outcome::Cancelled, Some(REASON_FAIL_FAST.to_string())),
    };

    // Timeouts and step failures keep their own reason codes; the gate
    // verdict only overrides an otherwise successful node.
    if plan.gate_unmet && outcome == Outcome::Succeeded {
        outcome = Outcome::Failed;
        reason = Some(REASON_GATE.to_string());
    }

    if outcome == Outcome::Succeeded && !exact_hit {
        if let Some(cache) = &plan.cache {
            let content = cache.paths.join("\n");
            if let Err(e) = cache.store.store(&cache.resolved.primary, content.as_bytes()).await {
                warn!(error = %e, key = %cache.resolved.primary, "cache save failed");
            }
        }
    }

    finish(outcome, reason, restored_key, started)
}

/// Resolves when the group's cancel flag flips to true, never before.
async fn cancel_signal(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone means cancellation can no longer arrive.
            std::future::pending::<()>().await;
        }
    }
}

/// Execute the node's steps in order. The first failing step that is not
/// best-effort decides the outcome and aborts the rest.
async fn run_steps(
    executor: &dyn StepExecutor,
    plan: &NodePlan,
    output: &mpsc::Sender<OutputLine>,
) -> (Outcome, Option<String>) {
    for step in &plan.steps {
        let mut env = plan.env.clone();
        env.extend(step.env.clone());
        let ctx = StepContext {
            node: plan.id.clone(),
            step: step.clone(),
            workspace: plan.workspace.clone(),
            env,
        };
        match executor.execute(&ctx, output.clone()).await {
            Ok(exec) if exec.success => {}
            Ok(exec) => {
                if step.continue_on_error {
                    warn!(node = %plan.id, step = %step.name, code = exec.exit_code, "best-effort step failed");
                } else {
                    return (
                        Outcome::Failed,
                        Some(format!("step '{}' exited with code {}", step.name, exec.exit_code)),
                    );
                }
            }
            Err(e) => {
                if step.continue_on_error {
                    warn!(node = %plan.id, step = %step.name, error = %e, "best-effort step failed");
                } else {
                    return (
                        Outcome::Failed,
                        Some(format!("step '{}' failed: {}", step.name, e)),
                    );
                }
            }
        }
    }
    (Outcome::Succeeded, None)
}
