//! Pipeline execution engine — the core traversal loop.
//!
//! Drives a [`PipelineGraph`] from its start node to an exit node: resolves
//! each node's handler, expands `$goal`/`$context.<key>` references in its
//! prompt, dispatches through [`HandlerRegistry`] with retry/backoff, applies
//! context updates, selects the next edge, enforces goal gates at the exit
//! node, and checkpoints after every step so a crashed run can resume.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use attractor_types::{AttractorError, Context, Outcome, Result, StageStatus};

use crate::checkpoint::{clear_checkpoint, load_checkpoint, save_checkpoint, PipelineCheckpoint};
use crate::edge_selection::select_edge;
use crate::events::{EventEmitter, PipelineEvent};
use crate::goal_gate::{enforce_goal_gates, GoalGateFailureTracker};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::{default_registry, EngineHooks, HandlerRegistry};
use crate::retry::BackoffPolicy;
use crate::transforms::expand_goal_context_vars;
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The core pipeline executor. Owns a handler registry and drives graph traversal.
pub struct PipelineExecutor {
    registry: HandlerRegistry,
    cancelled: Arc<AtomicBool>,
}

/// Configuration for a pipeline run that persists checkpoints and run
/// artifacts to disk.
pub struct PipelineConfig {
    pub logs_root: PathBuf,
}

/// The result of a completed pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub completed_nodes: Vec<String>,
    pub node_outcomes: HashMap<String, Outcome>,
    pub final_context: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert an `attractor_dot::AttributeValue` to a `serde_json::Value`.
fn attr_to_json(val: &attractor_dot::AttributeValue) -> serde_json::Value {
    match val {
        attractor_dot::AttributeValue::String(s) => serde_json::Value::String(s.clone()),
        attractor_dot::AttributeValue::Integer(i) => serde_json::json!(*i),
        attractor_dot::AttributeValue::Float(f) => serde_json::json!(*f),
        attractor_dot::AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
        attractor_dot::AttributeValue::Duration(d) => serde_json::json!(d.as_millis() as u64),
    }
}

/// Map a `StageStatus` to the lowercase string used in edge conditions.
fn status_to_string(status: StageStatus) -> String {
    match status {
        StageStatus::Success => "success".to_string(),
        StageStatus::PartialSuccess => "partial_success".to_string(),
        StageStatus::Retry => "retry".to_string(),
        StageStatus::Fail => "fail".to_string(),
        StageStatus::Skipped => "skipped".to_string(),
    }
}

/// Build the node the handler actually sees: if its prompt references
/// `$goal` or `$context.<key>`, replace it with a clone carrying the
/// expanded string. Handlers themselves never see the raw template.
async fn expand_node_for_invocation(node: &PipelineNode, goal: &str, context: &Context) -> PipelineNode {
    match &node.prompt {
        Some(p) if p.contains('$') => {
            let snapshot = context.snapshot().await;
            let expanded = expand_goal_context_vars(p, goal, &snapshot);
            let mut cloned = node.clone();
            cloned.prompt = Some(expanded);
            cloned
        }
        _ => node.clone(),
    }
}

async fn write_manifest(logs_root: &Path, graph: &PipelineGraph, run_id: Uuid) -> Result<()> {
    tokio::fs::create_dir_all(logs_root).await?;
    let manifest = serde_json::json!({
        "run_id": run_id.to_string(),
        "graph_name": graph.name,
        "goal": graph.goal,
        "node_count": graph.all_nodes().count(),
        "started_at": chrono::Utc::now().to_rfc3339(),
    });
    let path = logs_root.join("manifest.json");
    tokio::fs::write(&path, serde_json::to_string_pretty(&manifest)?).await?;
    Ok(())
}

async fn write_node_artifacts(logs_root: &Path, node: &PipelineNode, outcome: &Outcome) -> Result<()> {
    let dir = logs_root.join(&node.id);
    tokio::fs::create_dir_all(&dir).await?;
    if let Some(ref prompt) = node.prompt {
        tokio::fs::write(dir.join("prompt.md"), prompt).await?;
    }
    tokio::fs::write(dir.join("response.md"), &outcome.notes).await?;
    let status = serde_json::json!({
        "status": status_to_string(outcome.status),
        "failure_reason": outcome.failure_reason,
    });
    tokio::fs::write(dir.join("status.json"), serde_json::to_string_pretty(&status)?).await?;
    Ok(())
}

/// Resolve the handler for `node`, expand its prompt, and invoke it with
/// retry/backoff bound by `node.max_retries`. Returns the final outcome, the
/// resolved handler type, and the number of retry attempts consumed. Used
/// both by the main loop and by `EngineHooks::invoke_node`, so nested
/// Parallel/Manager Loop dispatch goes through the exact same path as a
/// top-level step.
async fn dispatch_with_retry(
    node: &PipelineNode,
    context: &Context,
    goal: &str,
    registry: &HandlerRegistry,
    events: &EventEmitter,
    cancelled: &Arc<AtomicBool>,
    hooks: &dyn EngineHooks,
) -> Result<(Outcome, String, u32)> {
    let handler_type = registry.resolve_type(node);
    let handler = registry.get(&handler_type).ok_or_else(|| AttractorError::HandlerError {
        handler: handler_type.clone(),
        node: node.id.clone(),
        message: format!("No handler registered for type '{}'", handler_type),
    })?;

    let expanded_node = expand_node_for_invocation(node, goal, context).await;
    let policy = BackoffPolicy::default();
    let max_retries = node.max_retries;
    let mut attempt: usize = 0;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(AttractorError::Cancelled);
        }

        events.emit(PipelineEvent::StageStarted {
            node_id: node.id.clone(),
            handler_type: handler_type.clone(),
        });

        let started_at = std::time::Instant::now();
        let outcome = handler.execute(&expanded_node, context, hooks).await?;
        let duration_ms = started_at.elapsed().as_millis() as u64;

        if !outcome.context_updates.is_empty() {
            context.apply_updates(outcome.context_updates.clone()).await;
            events.emit(PipelineEvent::ContextUpdated {
                node_id: node.id.clone(),
                keys: outcome.context_updates.keys().cloned().collect(),
            });
        }

        events.emit(PipelineEvent::StageCompleted {
            node_id: node.id.clone(),
            status: status_to_string(outcome.status),
            duration_ms,
        });

        if outcome.status == StageStatus::Fail {
            events.emit(PipelineEvent::StageFailed {
                node_id: node.id.clone(),
                error: outcome
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "stage failed".to_string()),
            });

            if attempt < max_retries {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                events.emit(PipelineEvent::StageRetrying {
                    node_id: node.id.clone(),
                    attempt,
                });
                tokio::time::sleep(delay).await;
                continue;
            }
        }

        return Ok((outcome, handler_type, attempt as u32));
    }
}

// ---------------------------------------------------------------------------
// EngineHooksImpl — the real EngineHooks backing a run
// ---------------------------------------------------------------------------

struct EngineHooksImpl<'a> {
    graph: &'a PipelineGraph,
    registry: &'a HandlerRegistry,
    events: &'a EventEmitter,
    cancelled: Arc<AtomicBool>,
    goal: String,
}

#[async_trait]
impl<'a> EngineHooks for EngineHooksImpl<'a> {
    fn graph(&self) -> &PipelineGraph {
        self.graph
    }

    fn events(&self) -> &EventEmitter {
        self.events
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn invoke_node(&self, node_id: &str, context: &Context) -> Result<Outcome> {
        let node = self.graph.node(node_id).ok_or_else(|| {
            AttractorError::Other(format!("invoke_node: node '{node_id}' not found"))
        })?;
        let (outcome, _handler_type, _attempts) =
            dispatch_with_retry(node, context, &self.goal, self.registry, self.events, &self.cancelled, self)
                .await?;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    /// Create an executor with the given handler registry.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create an executor pre-loaded with the default built-in handlers.
    pub fn with_default_registry() -> Self {
        Self::new(default_registry())
    }

    /// Request cooperative cancellation. Checked between handler invocations
    /// and retry sleeps; already-running handler calls are not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run the pipeline with a fresh context and no checkpoint persistence.
    pub async fn run(&self, graph: &PipelineGraph) -> Result<PipelineResult> {
        self.run_internal(graph, Context::new(), None, None).await
    }

    /// Run the pipeline with a caller-supplied context (e.g. pre-seeded with
    /// `workdir`/`dry_run`/budget keys), no checkpoint persistence.
    pub async fn run_with_context(&self, graph: &PipelineGraph, context: Context) -> Result<PipelineResult> {
        self.run_internal(graph, context, None, None).await
    }

    /// Run the pipeline with checkpoint persistence and run-directory
    /// artifacts under `config.logs_root`. When `resume` is true and a
    /// checkpoint already exists there, execution picks up from the
    /// checkpointed node instead of the graph's start node.
    pub async fn run_with_config(
        &self,
        graph: &PipelineGraph,
        config: &PipelineConfig,
        resume: bool,
    ) -> Result<PipelineResult> {
        let context = Context::new();
        let mut resume_state = None;

        if resume {
            if let Some(cp) = load_checkpoint(&config.logs_root).await? {
                context.apply_updates(cp.context_snapshot.clone()).await;
                resume_state = Some((cp.retry_counts.clone(), cp.visited.clone(), cp.current_node_id.clone(), cp.run_id));
            }
        }

        self.run_internal(graph, context, Some(config), resume_state).await
    }

    async fn run_internal(
        &self,
        graph: &PipelineGraph,
        context: Context,
        config: Option<&PipelineConfig>,
        resume_state: Option<(HashMap<String, u32>, Vec<String>, String, Uuid)>,
    ) -> Result<PipelineResult> {
        validate_or_raise(graph)?;

        let is_resuming = resume_state.is_some();
        let run_id = resume_state.as_ref().map(|s| s.3).unwrap_or_else(Uuid::new_v4);

        if !is_resuming {
            for (key, val) in &graph.attrs {
                context.set(key, attr_to_json(val)).await;
            }
        }

        let mut retry_counts: HashMap<String, u32> = resume_state.as_ref().map(|s| s.0.clone()).unwrap_or_default();
        let mut visited: Vec<String> = resume_state.as_ref().map(|s| s.1.clone()).unwrap_or_default();
        let mut completed_nodes: Vec<String> = visited.clone();
        let mut node_outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut gate_tracker = GoalGateFailureTracker::new();

        let mut current_id = match resume_state {
            Some((_, _, current_node_id, _)) => current_node_id,
            None => graph
                .start_node()
                .ok_or_else(|| AttractorError::ValidationError("No start node found".into()))?
                .id
                .clone(),
        };
        if graph.node(&current_id).is_none() {
            return Err(AttractorError::ValidationError(format!(
                "No start node found (resume target '{current_id}' does not exist)"
            )));
        }

        let events = EventEmitter::default();
        events.emit(PipelineEvent::PipelineStarted {
            pipeline_name: graph.name.clone(),
            node_count: graph.all_nodes().count(),
        });
        let run_started_at = std::time::Instant::now();

        let hooks = EngineHooksImpl {
            graph,
            registry: &self.registry,
            events: &events,
            cancelled: self.cancelled.clone(),
            goal: graph.goal.clone(),
        };

        if let Some(cfg) = config {
            write_manifest(&cfg.logs_root, graph, run_id).await?;
        }

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                events.emit(PipelineEvent::PipelineFailed {
                    pipeline_name: graph.name.clone(),
                    error: "cancelled".into(),
                });
                return Err(AttractorError::Cancelled);
            }

            let node = graph
                .node(&current_id)
                .ok_or_else(|| AttractorError::Other(format!("Node '{current_id}' not found")))?;

            let (outcome, handler_type, attempts) =
                dispatch_with_retry(node, &context, &graph.goal, &self.registry, &events, &self.cancelled, &hooks)
                    .await?;

            retry_counts.insert(node.id.clone(), attempts);
            completed_nodes.push(node.id.clone());
            visited.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());

            if node.goal_gate
                && matches!(outcome.status, StageStatus::Success | StageStatus::PartialSuccess)
            {
                gate_tracker.record_satisfied(&node.id);
            }

            context
                .set("outcome", serde_json::Value::String(status_to_string(outcome.status)))
                .await;
            if let Some(ref label) = outcome.preferred_label {
                context.set("preferred_label", serde_json::Value::String(label.clone())).await;
            }

            if let Some(cfg) = config {
                write_node_artifacts(&cfg.logs_root, node, &outcome).await?;
            }

            let context_snapshot = context.snapshot().await;
            let resolve = |key: &str| -> String {
                match key {
                    "outcome" => status_to_string(outcome.status),
                    "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
                    _ => {
                        let ctx_key = key.strip_prefix("context.").unwrap_or(key);
                        context_snapshot
                            .get(ctx_key)
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default()
                    }
                }
            };
            let next_edge = select_edge(&node.id, &outcome, &resolve, graph);
            let is_exit = node.shape == "Msquare";

            match next_edge {
                Some(edge) => {
                    events.emit(PipelineEvent::EdgeSelected {
                        from_node: node.id.clone(),
                        to_node: edge.to.clone(),
                        edge_label: edge.label.clone(),
                    });
                    current_id = edge.to.clone();
                }
                None if is_exit => {
                    match enforce_goal_gates(graph, &node_outcomes) {
                        Ok(result) => {
                            events.emit(PipelineEvent::GoalGateChecked {
                                node_id: node.id.clone(),
                                satisfied: result.all_satisfied,
                            });
                            if result.all_satisfied {
                                if let Some(cfg) = config {
                                    clear_checkpoint(&cfg.logs_root).await?;
                                }
                                let duration_ms = run_started_at.elapsed().as_millis() as u64;
                                events.emit(PipelineEvent::PipelineCompleted {
                                    pipeline_name: graph.name.clone(),
                                    completed_nodes: completed_nodes.clone(),
                                    duration_ms,
                                });
                                break;
                            }

                            let failed_node = result.failed_node_id.clone().unwrap_or_default();
                            if gate_tracker.record_failure(&failed_node) >= 2 {
                                let err = AttractorError::GoalGateRepeatedFailure { node: failed_node };
                                events.emit(PipelineEvent::PipelineFailed {
                                    pipeline_name: graph.name.clone(),
                                    error: err.to_string(),
                                });
                                return Err(err);
                            }

                            let target = result
                                .retry_target
                                .clone()
                                .ok_or_else(|| AttractorError::NoRetryTarget { node: failed_node.clone() })?;
                            if graph.node(&target).is_none() {
                                return Err(AttractorError::Other(format!("Retry target '{target}' not found")));
                            }
                            current_id = target;
                        }
                        Err(err) => {
                            events.emit(PipelineEvent::GoalGateChecked {
                                node_id: node.id.clone(),
                                satisfied: false,
                            });
                            events.emit(PipelineEvent::PipelineFailed {
                                pipeline_name: graph.name.clone(),
                                error: err.to_string(),
                            });
                            return Err(err);
                        }
                    }
                }
                None => {
                    if outcome.status == StageStatus::Fail {
                        let err = AttractorError::HandlerError {
                            handler: handler_type,
                            node: node.id.clone(),
                            message: "Handler failed with no outgoing edge".into(),
                        };
                        events.emit(PipelineEvent::PipelineFailed {
                            pipeline_name: graph.name.clone(),
                            error: err.to_string(),
                        });
                        return Err(err);
                    }
                    if let Some(cfg) = config {
                        clear_checkpoint(&cfg.logs_root).await?;
                    }
                    let duration_ms = run_started_at.elapsed().as_millis() as u64;
                    events.emit(PipelineEvent::PipelineCompleted {
                        pipeline_name: graph.name.clone(),
                        completed_nodes: completed_nodes.clone(),
                        duration_ms,
                    });
                    break;
                }
            }

            if let Some(cfg) = config {
                let snapshot = context.snapshot().await;
                let checkpoint = PipelineCheckpoint::new(
                    graph.name.clone(),
                    current_id.clone(),
                    snapshot,
                    retry_counts.clone(),
                    visited.clone(),
                    run_id,
                );
                save_checkpoint(&checkpoint, &cfg.logs_root).await?;
                events.emit(PipelineEvent::CheckpointSaved { node_id: current_id.clone() });
            }
        }

        let final_context = context.snapshot().await;
        Ok(PipelineResult {
            completed_nodes,
            node_outcomes,
            final_context,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
