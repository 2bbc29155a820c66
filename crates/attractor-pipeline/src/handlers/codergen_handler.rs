//! CodergenHandler — delegates a node's prompt to an LLM backend.
//!
//! Handles "box" shaped nodes (and conditional nodes that carry a prompt).
//! The concrete backend is an injected collaborator, the same pattern used
//! for [`crate::interviewer::Interviewer`]: this crate depends only on
//! `attractor_llm`'s always-compiled `Request`/`Response` wire contract, never
//! on a concrete provider, which stays behind that crate's own `providers`
//! feature. Without a backend (or when the context's `dry_run`/`simulation`
//! flag is set) the handler runs in simulation mode, returning a
//! deterministic stub response so pipelines can be exercised in tests
//! without ever calling a real model.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use attractor_llm::{Message, ReasoningEffort, Request, Response};
use attractor_types::{AttractorError, Context, Outcome, Result, StageStatus};

use crate::graph::PipelineNode;
use crate::handler::{EngineHooks, NodeHandler};

/// An LLM backend capable of completing a single [`Request`]. Mirrors the
/// shape of `attractor_llm::ProviderAdapter::complete` without requiring the
/// `providers` feature, so a caller can inject any backend (a real provider,
/// a test double, a routing layer) without this crate pulling one in.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn complete(&self, request: &Request) -> std::result::Result<Response, AttractorError>;
}

pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new() -> Self {
        Self { backend: None }
    }

    pub fn with_backend(backend: Arc<dyn CodergenBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    fn simulated_response(node: &PipelineNode, prompt: &str) -> String {
        format!("[simulated response for node '{}']: {}", node.id, prompt)
    }

    fn reasoning_effort(node: &PipelineNode) -> Option<ReasoningEffort> {
        match node.reasoning_effort.as_deref() {
            Some("low") => Some(ReasoningEffort::Low),
            Some("medium") => Some(ReasoningEffort::Medium),
            Some("high") => Some(ReasoningEffort::High),
            _ => None,
        }
    }
}

impl Default for CodergenHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(&self, node: &PipelineNode, context: &Context, _hooks: &dyn EngineHooks) -> Result<Outcome> {
        let prompt = node.prompt.clone().unwrap_or_default();

        let simulate = self.backend.is_none()
            || context
                .get("dry_run")
                .await
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            || context
                .get("simulation")
                .await
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

        let mut updates = HashMap::new();
        updates.insert(
            format!("{}.prompt", node.id),
            serde_json::Value::String(prompt.clone()),
        );

        let response_text = if simulate {
            Self::simulated_response(node, &prompt)
        } else {
            let backend = self.backend.as_ref().unwrap();
            let request = Request {
                model: node.llm_model.clone().unwrap_or_default(),
                messages: vec![Message::user(prompt.clone())],
                tools: Vec::new(),
                tool_choice: None,
                max_tokens: None,
                temperature: None,
                stop_sequences: Vec::new(),
                reasoning_effort: Self::reasoning_effort(node),
                provider: node.llm_provider.clone(),
                provider_options: None,
            };

            match backend.complete(&request).await {
                Ok(response) => response.text,
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "codergen backend call failed");
                    return Ok(Outcome {
                        status: StageStatus::Fail,
                        preferred_label: None,
                        suggested_next_ids: vec![],
                        context_updates: updates,
                        notes: format!("LLM backend error: {e}"),
                        failure_reason: Some(e.to_string()),
                    });
                }
            }
        };

        updates.insert(
            format!("{}.response", node.id),
            serde_json::Value::String(response_text.clone()),
        );

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: updates,
            notes: response_text,
            failure_reason: None,
        })
    }
}
