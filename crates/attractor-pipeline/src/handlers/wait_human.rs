//! WaitHumanHandler — pauses pipeline execution for human input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use attractor_types::{Context, Outcome, Result, StageStatus};

use crate::events::PipelineEvent;
use crate::graph::PipelineNode;
use crate::handler::{EngineHooks, NodeHandler};
use crate::interviewer::{Choice, Interviewer, Question};

/// Applied when a node carries no `timeout` attribute of its own.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Split an edge label on its first `&` into display text and accelerator
/// key, e.g. `"&Yes"` -> `Choice { text: "Yes", accelerator: Some('Y') }`.
/// A label with no `&` carries no accelerator.
fn parse_choice_label(label: &str) -> Choice {
    if let Some(pos) = label.find('&') {
        let mut rest = label[pos + 1..].chars();
        if let Some(accel) = rest.next() {
            let text = format!("{}{}{}", &label[..pos], accel, rest.as_str());
            return Choice {
                text,
                accelerator: Some(accel),
            };
        }
    }
    Choice::plain(label)
}

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(&self, node: &PipelineNode, _ctx: &Context, hooks: &dyn EngineHooks) -> Result<Outcome> {
        let edges = hooks.graph().outgoing_edges(&node.id);
        if edges.is_empty() {
            return Ok(Outcome::fail(format!(
                "Wait-for-human node '{}' has no outgoing edges to offer as choices",
                node.id
            )));
        }

        let choices: Vec<Choice> = edges
            .iter()
            .filter_map(|e| e.label.as_deref())
            .map(parse_choice_label)
            .collect();

        let prompt = node.prompt.clone().unwrap_or_else(|| node.label.clone());
        let timeout = node.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let question = Question {
            prompt: prompt.clone(),
            choices,
            default: None,
            timeout: Some(timeout),
        };

        hooks.events().emit(PipelineEvent::InterviewStarted {
            node_id: node.id.clone(),
            prompt,
        });

        match tokio::time::timeout(timeout, self.interviewer.ask(&question)).await {
            Ok(Ok(answer)) => {
                hooks.events().emit(PipelineEvent::InterviewCompleted {
                    node_id: node.id.clone(),
                    choice: answer.choice.clone(),
                });
                Ok(Outcome {
                    status: StageStatus::Success,
                    preferred_label: Some(answer.choice),
                    suggested_next_ids: vec![],
                    context_updates: HashMap::new(),
                    notes: "Human responded".into(),
                    failure_reason: None,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                hooks.events().emit(PipelineEvent::InterviewTimeout {
                    node_id: node.id.clone(),
                });
                Ok(Outcome {
                    status: StageStatus::Skipped,
                    preferred_label: None,
                    suggested_next_ids: vec![],
                    context_updates: HashMap::new(),
                    notes: "timeout".into(),
                    failure_reason: Some("interview timed out waiting for human response".into()),
                })
            }
        }
    }
}
