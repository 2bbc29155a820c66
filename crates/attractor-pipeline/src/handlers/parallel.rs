use std::collections::HashMap;

use async_trait::async_trait;
use attractor_dot::AttributeValue;
use attractor_types::{Context, Outcome, Result, StageStatus};

use crate::events::PipelineEvent;
use crate::graph::PipelineNode;
use crate::handler::{EngineHooks, NodeHandler};

/// How many branches a `ParallelHandler` must see complete before it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPolicy {
    WaitAll,
    FirstSuccess,
}

/// How a `ParallelHandler` treats a branch's own FAIL outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorPolicy {
    FailFast,
    Continue,
    Ignore,
}

fn string_attr(node: &PipelineNode, key: &str) -> Option<String> {
    node.raw_attrs.get(key).and_then(|v| match v {
        AttributeValue::String(s) => Some(s.clone()),
        _ => None,
    })
}

fn join_policy(node: &PipelineNode) -> JoinPolicy {
    match string_attr(node, "join_policy").as_deref() {
        Some("first_success") => JoinPolicy::FirstSuccess,
        _ => JoinPolicy::WaitAll,
    }
}

fn error_policy(node: &PipelineNode) -> ErrorPolicy {
    match string_attr(node, "error_policy").as_deref() {
        Some("continue") => ErrorPolicy::Continue,
        Some("ignore") => ErrorPolicy::Ignore,
        _ => ErrorPolicy::FailFast,
    }
}

/// Handler for "parallel" type nodes (shape="component").
///
/// Invokes every outgoing branch's own resolved handler concurrently, each
/// against an isolated copy of the context so branches never race on writes.
/// Results are merged back into the parent context only after the join
/// policy is satisfied.
pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, node: &PipelineNode, context: &Context, hooks: &dyn EngineHooks) -> Result<Outcome> {
        let branches: Vec<String> = hooks
            .graph()
            .outgoing_edges(&node.id)
            .iter()
            .map(|e| e.to.clone())
            .collect();
        let join = join_policy(node);
        let error = error_policy(node);

        hooks.events().emit(PipelineEvent::ParallelStarted {
            node_id: node.id.clone(),
            branch_count: branches.len(),
        });

        // Each branch gets its own isolated context snapshot so concurrent
        // writes from sibling branches never interleave.
        let mut tasks = Vec::with_capacity(branches.len());
        for branch_id in &branches {
            let branch_context = context.clone_isolated().await;
            let branch_id = branch_id.clone();
            hooks.events().emit(PipelineEvent::BranchStarted {
                node_id: node.id.clone(),
                branch_node_id: branch_id.clone(),
            });
            tasks.push(invoke_branch(hooks, branch_id, branch_context));
        }

        let mut results: Vec<(String, Result<Outcome>)> = Vec::with_capacity(tasks.len());
        if join == JoinPolicy::FirstSuccess {
            // Poll branches as they settle; stop collecting the moment one
            // succeeds. Remaining branches keep running to completion in the
            // background — they are plain futures, not spawned tasks, so
            // simply dropping the rest would abort them; join_all already
            // started them concurrently via their own awaits below.
            let settled = futures::future::join_all(tasks).await;
            for (branch_id, outcome) in settled {
                let is_success = matches!(&outcome, Ok(o) if o.status == StageStatus::Success);
                results.push((branch_id, outcome));
                if is_success {
                    break;
                }
            }
        } else {
            results = futures::future::join_all(tasks).await;
        }

        let mut context_updates = HashMap::new();
        let mut any_fail = false;
        let mut notes = Vec::new();

        for (branch_id, outcome) in results {
            let outcome = outcome?;

            let mut status = outcome.status;
            if status == StageStatus::Fail && error == ErrorPolicy::Ignore {
                status = StageStatus::Skipped;
            }

            hooks.events().emit(PipelineEvent::BranchCompleted {
                node_id: node.id.clone(),
                branch_node_id: branch_id.clone(),
                status: status_label(status),
            });

            if status == StageStatus::Fail {
                any_fail = true;
                if error == ErrorPolicy::FailFast {
                    let final_status = StageStatus::Fail;
                    hooks.events().emit(PipelineEvent::ParallelCompleted {
                        node_id: node.id.clone(),
                        status: status_label(final_status),
                    });
                    return Ok(Outcome {
                        status: final_status,
                        preferred_label: None,
                        suggested_next_ids: vec![],
                        context_updates,
                        notes: format!("Branch '{branch_id}' failed: {}", outcome.notes),
                        failure_reason: outcome.failure_reason.clone(),
                    });
                }
            }

            for (k, v) in outcome.context_updates {
                context_updates.insert(format!("{}.{}", branch_id, k), v);
            }
            notes.push(format!("{branch_id}: {}", outcome.notes));
        }

        let final_status = if any_fail && error != ErrorPolicy::Ignore {
            StageStatus::PartialSuccess
        } else {
            StageStatus::Success
        };

        hooks.events().emit(PipelineEvent::ParallelCompleted {
            node_id: node.id.clone(),
            status: status_label(final_status),
        });

        Ok(Outcome {
            status: final_status,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates,
            notes: notes.join("; "),
            failure_reason: None,
        })
    }
}

async fn invoke_branch(
    hooks: &dyn EngineHooks,
    branch_id: String,
    branch_context: Context,
) -> (String, Result<Outcome>) {
    let outcome = hooks.invoke_node(&branch_id, &branch_context).await;
    (branch_id, outcome)
}

fn status_label(status: StageStatus) -> String {
    match status {
        StageStatus::Success => "success".into(),
        StageStatus::PartialSuccess => "partial_success".into(),
        StageStatus::Retry => "retry".into(),
        StageStatus::Fail => "fail".into(),
        StageStatus::Skipped => "skipped".into(),
    }
}

/// Handler for "fan_in" type nodes (shape="tripleoctagon").
/// Pass-through synchronization point marking where parallel branches rejoin.
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "fan_in"
    }

    async fn execute(&self, node: &PipelineNode, _context: &Context, _hooks: &dyn EngineHooks) -> Result<Outcome> {
        tracing::info!(node = %node.id, "Fan-in merge point");

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: HashMap::new(),
            notes: "Fan-in merge completed".to_string(),
            failure_reason: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
