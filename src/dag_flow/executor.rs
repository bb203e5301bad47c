//! Local execution engine.
//!
//! Runs a flattened workflow on the tokio runtime. Nodes whose producers
//! have all finished are launched in topological order, at most
//! `max_parallel_nodes` at a time. A failed node never stops independent
//! branches; everything downstream of it is reported as skipped.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::dag_flow::{FlatGraph, FlatNode, NodeKind, PortValues, Workflow};
use crate::core::config::ExecutionConfig;
use crate::core::errors::{LogisError, Result};
use crate::stages::tools::missing_files;
use crate::stages::{InputOrigin, StageCtx, StageInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Completed,
    Failed,
    /// Not run because something upstream failed
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node: String,
    pub interface: String,
    pub status: NodeStatus,
    pub outputs: PortValues,
    pub error: Option<String>,
    pub error_category: Option<&'static str>,
    pub exit_code: Option<i32>,
    pub work_dir: Option<PathBuf>,
    pub duration_ms: u64,
}

impl NodeOutcome {
    fn skipped(node: &FlatNode) -> Self {
        Self {
            node: node.qualified_name.clone(),
            interface: node.node.interface_name().to_string(),
            status: NodeStatus::Skipped,
            outputs: PortValues::new(),
            error: None,
            error_category: None,
            exit_code: None,
            work_dir: None,
            duration_ms: 0,
        }
    }
}

/// Per-node results of one run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In flattened node order
    pub outcomes: Vec<NodeOutcome>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == NodeStatus::Completed)
    }

    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.node == node)
    }

    pub fn status(&self, node: &str) -> Option<NodeStatus> {
        self.outcome(node).map(|o| o.status)
    }

    pub fn outputs(&self, node: &str) -> Option<&PortValues> {
        self.outcome(node)
            .filter(|o| o.status == NodeStatus::Completed)
            .map(|o| &o.outputs)
    }

    pub fn with_status(&self, status: NodeStatus) -> Vec<&NodeOutcome> {
        self.outcomes.iter().filter(|o| o.status == status).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LocalExecutor {
    base_dir: PathBuf,
    max_parallel_nodes: usize,
    stage_timeout: Option<Duration>,
}

impl LocalExecutor {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_parallel_nodes: 4,
            stage_timeout: None,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Result<Self> {
        let base_dir = match &config.working_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join("work"),
        };
        Ok(Self {
            base_dir,
            max_parallel_nodes: config.max_parallel_nodes,
            stage_timeout: config.job_finished_timeout.map(Duration::from_secs),
        })
    }

    pub fn max_parallel_nodes(mut self, count: usize) -> Self {
        self.max_parallel_nodes = count;
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Run every node of `workflow`. Assembly problems are returned as
    /// errors; stage failures are recorded in the report.
    pub async fn run(&self, workflow: &Workflow) -> Result<ExecutionReport> {
        workflow.validate()?;
        let flat = Arc::new(workflow.flatten()?);
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            "Running workflow {} ({} nodes, run {})",
            workflow.name(),
            flat.nodes.len(),
            run_id
        );

        let mut state = RunState::new(&flat);
        let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; flat.nodes.len()];
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_nodes.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, NodeOutcome)>();
        let mut active_tasks = 0usize;
        let mut finished = 0usize;

        while finished < flat.nodes.len() {
            while let Some(index) = state.ready.pop_front() {
                let node = &flat.nodes[index];
                if state.blocked[index] {
                    warn!("Skipping node {}: upstream failure", node.qualified_name);
                    let outcome = NodeOutcome::skipped(node);
                    state.resolve(&flat, index, &outcome);
                    outcomes[index] = Some(outcome);
                    finished += 1;
                    continue;
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| LogisError::stage(&node.qualified_name, "executor shut down"))?;
                let tx = tx.clone();
                let node = node.clone();
                let work_dir = node
                    .work_dir_components()
                    .iter()
                    .fold(self.base_dir.clone(), |dir, part| dir.join(part));
                let inputs = std::mem::take(&mut state.inputs[index]);
                let origins = state.origins[index].clone();
                let timeout = self.stage_timeout;

                active_tasks += 1;
                info!(
                    "Launching node {} (active tasks: {})",
                    node.qualified_name, active_tasks
                );
                let span = info_span!("node", name = %node.qualified_name);
                tokio::spawn(
                    async move {
                        let outcome = execute_node(&node, work_dir, inputs, origins, timeout).await;
                        drop(permit);
                        let _ = tx.send((index, outcome));
                    }
                    .instrument(span),
                );
            }

            if active_tasks == 0 {
                break;
            }

            match rx.recv().await {
                Some((index, outcome)) => {
                    active_tasks -= 1;
                    finished += 1;
                    match outcome.status {
                        NodeStatus::Failed => error!(
                            "Node {} failed: {}",
                            outcome.node,
                            outcome.error.as_deref().unwrap_or("unknown error")
                        ),
                        _ => info!(
                            "Node {} completed (active tasks: {})",
                            outcome.node, active_tasks
                        ),
                    }
                    state.resolve(&flat, index, &outcome);
                    outcomes[index] = Some(outcome);
                }
                None => break,
            }
        }

        let outcomes: Vec<NodeOutcome> = outcomes
            .into_iter()
            .zip(flat.nodes.iter())
            .map(|(outcome, node)| outcome.unwrap_or_else(|| NodeOutcome::skipped(node)))
            .collect();
        let report = ExecutionReport {
            run_id,
            workflow: workflow.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            "Workflow {} finished: {} completed, {} failed, {} skipped",
            report.workflow,
            report.with_status(NodeStatus::Completed).len(),
            report.with_status(NodeStatus::Failed).len(),
            report.with_status(NodeStatus::Skipped).len()
        );
        Ok(report)
    }
}

/// Bookkeeping for nodes that have not run yet
struct RunState {
    remaining: Vec<usize>,
    inputs: Vec<PortValues>,
    origins: Vec<BTreeMap<String, InputOrigin>>,
    blocked: Vec<bool>,
    ready: VecDeque<usize>,
}

impl RunState {
    fn new(flat: &FlatGraph) -> Self {
        let remaining: Vec<usize> = (0..flat.nodes.len())
            .map(|i| flat.incoming(i).count())
            .collect();
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
            .collect();
        Self {
            inputs: flat.nodes.iter().map(|n| n.node.literals().clone()).collect(),
            origins: vec![BTreeMap::new(); flat.nodes.len()],
            blocked: vec![false; flat.nodes.len()],
            remaining,
            ready,
        }
    }

    /// Deliver a finished node's outputs downstream and queue consumers
    /// whose producers are all done.
    fn resolve(&mut self, flat: &FlatGraph, index: usize, outcome: &NodeOutcome) {
        let source = &flat.nodes[index];
        for edge in flat.outgoing(index) {
            let dest = edge.dest;
            if outcome.status == NodeStatus::Completed {
                if let Some(value) = outcome.outputs.get(&edge.source_port) {
                    self.inputs[dest].insert(edge.dest_port.clone(), value.clone());
                    // identity nodes pass on where their value came from
                    let relayed = match source.node.kind() {
                        NodeKind::Identity => self.origins[index].get(&edge.source_port).cloned(),
                        _ => None,
                    };
                    let origin = relayed.unwrap_or_else(|| InputOrigin {
                        node: source.qualified_name.clone(),
                        port: edge.source_port.clone(),
                        axis: source.node.axis().cloned(),
                    });
                    self.origins[dest].insert(edge.dest_port.clone(), origin);
                }
            } else {
                self.blocked[dest] = true;
            }
            self.remaining[dest] -= 1;
            if self.remaining[dest] == 0 {
                self.ready.push_back(dest);
            }
        }
    }
}

async fn execute_node(
    node: &FlatNode,
    work_dir: PathBuf,
    inputs: PortValues,
    origins: BTreeMap<String, InputOrigin>,
    timeout: Option<Duration>,
) -> NodeOutcome {
    let start = Instant::now();
    let result = match node.node.kind() {
        NodeKind::Identity => Ok(inputs),
        NodeKind::Stage(stage) => {
            run_stage(node, stage.as_ref(), work_dir.clone(), inputs, origins, timeout).await
        }
        NodeKind::Workflow(_) => Err(LogisError::stage(
            &node.qualified_name,
            "nested workflow reached the engine unflattened",
        )),
    };

    let mut outcome = NodeOutcome {
        node: node.qualified_name.clone(),
        interface: node.node.interface_name().to_string(),
        status: NodeStatus::Completed,
        outputs: PortValues::new(),
        error: None,
        error_category: None,
        exit_code: None,
        work_dir: (!node.node.is_identity()).then_some(work_dir),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    match result {
        Ok(outputs) => outcome.outputs = outputs,
        Err(err) => {
            outcome.status = NodeStatus::Failed;
            outcome.error_category = Some(err.category());
            if let LogisError::StageExecution { exit_code, .. } = &err {
                outcome.exit_code = *exit_code;
            }
            outcome.error = Some(err.to_string());
        }
    }
    outcome
}

async fn run_stage(
    node: &FlatNode,
    stage: &dyn StageInterface,
    work_dir: PathBuf,
    inputs: PortValues,
    origins: BTreeMap<String, InputOrigin>,
    timeout: Option<Duration>,
) -> Result<PortValues> {
    let name = &node.qualified_name;
    for port in node.node.inputs() {
        match inputs.get(&port.name) {
            None | Some(Value::Null) => {
                if !port.optional {
                    return Err(LogisError::stage(
                        name,
                        format!("required input '{}' has no value", port.name),
                    ));
                }
            }
            Some(value) => {
                let missing = missing_files(port.kind, value);
                if !missing.is_empty() {
                    return Err(LogisError::stage(
                        name,
                        format!("input '{}' refers to missing file(s) {:?}", port.name, missing),
                    ));
                }
            }
        }
    }

    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(|e| LogisError::io(format!("creating {}", work_dir.display()), e))?;

    let ctx = StageCtx {
        node_name: name.clone(),
        work_dir,
        inputs,
        params: node.node.params().clone(),
        origins,
        timeout,
    };
    let mut outputs = stage.run(&ctx).await.map_err(|err| match err.downcast::<LogisError>() {
        Ok(err) => err,
        Err(err) => LogisError::stage(name, format!("{err:#}")),
    })?;

    for port in node.node.outputs() {
        let missing = outputs
            .get(&port.name)
            .map(|value| missing_files(port.kind, value))
            .unwrap_or_default();
        let absent = !outputs.contains_key(&port.name);
        if port.optional {
            if !missing.is_empty() {
                outputs.remove(&port.name);
            }
        } else if absent {
            return Err(LogisError::stage(
                name,
                format!("declared output '{}' was not reported", port.name),
            ));
        } else if !missing.is_empty() {
            return Err(LogisError::stage(
                name,
                format!("output '{}' was not produced: {:?}", port.name, missing),
            ));
        }
    }
    Ok(outputs)
}
