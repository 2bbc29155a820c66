//! Manager loop handler for "house" shaped nodes.
//!
//! Supervises a child process through an observe/steer/wait cycle: spawn,
//! poll on an interval, merge telemetry into context, and stop once the
//! child finishes or a `stop_condition` is satisfied.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attractor_dot::AttributeValue;
use attractor_types::{Context, Outcome, Result, StageStatus};

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::PipelineNode;
use crate::handler::{EngineHooks, NodeHandler};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_CYCLES: u32 = 20;

/// The observed state of a supervised child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// A child process under Manager Loop supervision. Mirrors the injected-
/// collaborator pattern [`crate::handlers::codergen_handler::CodergenBackend`]
/// and [`crate::interviewer::Interviewer`] already use for external systems.
#[async_trait]
pub trait ChildProcess: Send + Sync {
    async fn poll(&self) -> ChildStatus;
    fn is_finished(&self) -> bool;
    async fn telemetry(&self) -> HashMap<String, serde_json::Value>;
}

/// Spawns a [`ChildProcess`] from a node's `command`/`args` attributes,
/// mirroring [`crate::handlers::tool_handler::ToolHandler`]'s own attributes.
#[async_trait]
pub trait ChildProcessSpawner: Send + Sync {
    async fn spawn(&self, command: &str, args: &str) -> Result<Box<dyn ChildProcess>>;
}

/// A child that completes immediately with a fixed telemetry payload, in the
/// same spirit as [`crate::interviewer::AutoApproveInterviewer`]. Used when no
/// real spawner is configured, so pipelines can be exercised without actually
/// spawning a subprocess.
pub struct SimulatedChildProcess {
    telemetry: HashMap<String, serde_json::Value>,
}

impl SimulatedChildProcess {
    pub fn new() -> Self {
        let mut telemetry = HashMap::new();
        telemetry.insert("status".to_string(), serde_json::json!("completed"));
        Self { telemetry }
    }
}

impl Default for SimulatedChildProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChildProcess for SimulatedChildProcess {
    async fn poll(&self) -> ChildStatus {
        ChildStatus::Succeeded
    }

    fn is_finished(&self) -> bool {
        true
    }

    async fn telemetry(&self) -> HashMap<String, serde_json::Value> {
        self.telemetry.clone()
    }
}

struct SimulatedSpawner;

#[async_trait]
impl ChildProcessSpawner for SimulatedSpawner {
    async fn spawn(&self, _command: &str, _args: &str) -> Result<Box<dyn ChildProcess>> {
        Ok(Box::new(SimulatedChildProcess::new()))
    }
}

fn string_attr(node: &PipelineNode, key: &str) -> Option<String> {
    node.raw_attrs.get(key).and_then(|v| match v {
        AttributeValue::String(s) => Some(s.clone()),
        _ => None,
    })
}

fn int_attr(node: &PipelineNode, key: &str) -> Option<i64> {
    node.raw_attrs.get(key).and_then(|v| match v {
        AttributeValue::Integer(i) => Some(*i),
        _ => None,
    })
}

fn duration_attr(node: &PipelineNode, key: &str) -> Option<Duration> {
    node.raw_attrs.get(key).and_then(|v| match v {
        AttributeValue::Duration(d) => Some(*d),
        _ => None,
    })
}

/// Handler for "manager_loop" type nodes (shape="house").
/// Supervises a child process through poll/telemetry/stop-condition cycles.
pub struct ManagerLoopHandler {
    spawner: Arc<dyn ChildProcessSpawner>,
}

impl ManagerLoopHandler {
    pub fn new() -> Self {
        Self {
            spawner: Arc::new(SimulatedSpawner),
        }
    }

    pub fn with_spawner(spawner: Arc<dyn ChildProcessSpawner>) -> Self {
        Self { spawner }
    }
}

impl Default for ManagerLoopHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "manager_loop"
    }

    async fn execute(&self, node: &PipelineNode, context: &Context, _hooks: &dyn EngineHooks) -> Result<Outcome> {
        let command = string_attr(node, "command").unwrap_or_default();
        let args = string_attr(node, "args").unwrap_or_default();
        let poll_interval = duration_attr(node, "poll_interval").unwrap_or(DEFAULT_POLL_INTERVAL);
        let max_cycles = int_attr(node, "max_cycles")
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_MAX_CYCLES);
        let stop_condition = string_attr(node, "stop_condition");

        let child = self.spawner.spawn(&command, &args).await?;

        let mut telemetry_updates: HashMap<String, serde_json::Value> = HashMap::new();
        let base_snapshot = context.snapshot().await;
        let mut cycle = 0u32;

        loop {
            let telemetry = child.telemetry().await;
            for (k, v) in &telemetry {
                telemetry_updates.insert(format!("{}.{}", node.id, k), v.clone());
            }

            let stop_satisfied = match &stop_condition {
                Some(cond) => {
                    let mut merged = base_snapshot.clone();
                    merged.extend(telemetry_updates.clone());
                    let resolve = |key: &str| -> String {
                        merged
                            .get(key)
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default()
                    };
                    parse_condition(cond)
                        .map(|expr| evaluate_condition(&expr, &resolve))
                        .unwrap_or(false)
                }
                None => false,
            };

            let status = child.poll().await;
            let finished = child.is_finished();

            if finished || stop_satisfied {
                let success = stop_satisfied || matches!(status, ChildStatus::Succeeded);
                return Ok(Outcome {
                    status: if success { StageStatus::Success } else { StageStatus::Fail },
                    preferred_label: None,
                    suggested_next_ids: vec![],
                    context_updates: telemetry_updates,
                    notes: format!(
                        "Manager loop for '{}' stopped after {} cycle(s): {}",
                        node.id,
                        cycle + 1,
                        if success { "child satisfied stop condition" } else { "child failed" }
                    ),
                    failure_reason: if success {
                        None
                    } else if let ChildStatus::Failed(reason) = status {
                        Some(reason)
                    } else {
                        Some("child did not succeed".to_string())
                    },
                });
            }

            cycle += 1;
            if cycle >= max_cycles {
                return Ok(Outcome {
                    status: StageStatus::Fail,
                    preferred_label: None,
                    suggested_next_ids: vec![],
                    context_updates: telemetry_updates,
                    notes: format!("Manager loop for '{}' hit max_cycles={max_cycles} without stopping", node.id),
                    failure_reason: Some("max_cycles reached".to_string()),
                });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
