//! Node handler trait, dynamic dispatch wrapper, and handler registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use attractor_types::{Context, Outcome, Result};

use crate::events::EventEmitter;
use crate::graph::{PipelineGraph, PipelineNode};

// ---------------------------------------------------------------------------
// EngineHooks — the engine-provided capabilities a handler may need
// ---------------------------------------------------------------------------

/// Capabilities the engine exposes to a handler during `execute`: read-only
/// graph access, the run's cancellation flag, and (for handlers like
/// Parallel and Manager Loop that need to invoke another node's own handler)
/// a re-entrant dispatch callback.
#[async_trait]
pub trait EngineHooks: Send + Sync {
    fn graph(&self) -> &PipelineGraph;

    /// The run's event emitter, for handlers (Parallel, Wait-for-Human,
    /// Manager Loop) that emit events beyond the engine's own
    /// `StageStarted`/`StageCompleted` pair.
    fn events(&self) -> &EventEmitter;

    /// True once `PipelineExecutor::cancel()` has been called for this run.
    fn is_cancelled(&self) -> bool;

    /// Resolve and invoke the handler for `node_id` against `context`,
    /// exactly as the engine's own main loop would for a normal step (minus
    /// edge selection/checkpointing, which only the top-level loop does).
    /// Used by Parallel to fan out to branch nodes and by Manager Loop to
    /// delegate to a child's own handler.
    async fn invoke_node(&self, node_id: &str, context: &Context) -> Result<Outcome>;
}

/// A no-op `EngineHooks` for handler unit tests that never call
/// `invoke_node`. Calling `invoke_node` on it is a programming error in the
/// test, not a recoverable condition, so it panics.
pub struct NullHooks<'a> {
    pub graph: &'a PipelineGraph,
    pub cancelled: Arc<AtomicBool>,
    pub events: EventEmitter,
}

impl<'a> NullHooks<'a> {
    pub fn new(graph: &'a PipelineGraph) -> Self {
        Self {
            graph,
            cancelled: Arc::new(AtomicBool::new(false)),
            events: EventEmitter::new(uuid::Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl<'a> EngineHooks for NullHooks<'a> {
    fn graph(&self) -> &PipelineGraph {
        self.graph
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn invoke_node(&self, node_id: &str, _context: &Context) -> Result<Outcome> {
        panic!("NullHooks::invoke_node called for '{node_id}' — this test double has no registry to dispatch through");
    }
}

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The handler type identifier (e.g. "start", "exit", "codergen").
    fn handler_type(&self) -> &str;

    /// Execute this handler for a given node.
    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        hooks: &dyn EngineHooks,
    ) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        hooks: &dyn EngineHooks,
    ) -> Result<Outcome> {
        self.0.execute(node, context, hooks).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
    shape_to_type: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut shape_to_type = HashMap::new();
        shape_to_type.insert("Mdiamond".into(), "start".into());
        shape_to_type.insert("Msquare".into(), "exit".into());
        shape_to_type.insert("box".into(), "codergen".into());
        shape_to_type.insert("hexagon".into(), "wait.human".into());
        shape_to_type.insert("diamond".into(), "conditional".into());
        shape_to_type.insert("component".into(), "parallel".into());
        shape_to_type.insert("tripleoctagon".into(), "fan_in".into());
        shape_to_type.insert("parallelogram".into(), "tool".into());
        shape_to_type.insert("house".into(), "manager_loop".into());

        Self {
            handlers: HashMap::new(),
            shape_to_type,
        }
    }

    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// Resolve a node to its handler type using 3-step priority:
    /// 1. Explicit `type` attribute on the node
    /// 2. Shape-based mapping
    /// 3. Default: `"codergen"`
    ///
    /// Special case: conditional nodes with a prompt are routed to `"codergen"`
    /// so the prompt actually gets executed via the LLM backend. The
    /// `ConditionalHandler` is a pass-through for pure routing nodes with no
    /// prompt.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        if let Some(ref t) = node.node_type {
            if t == "conditional" && node.prompt.is_some() {
                return "codergen".to_string();
            }
            return t.clone();
        }
        if let Some(t) = self.shape_to_type.get(&node.shape) {
            if t == "conditional" && node.prompt.is_some() {
                return "codergen".to_string();
            }
            return t.clone();
        }
        "codergen".to_string()
    }

    pub fn get(&self, handler_type: &str) -> Option<&DynHandler> {
        self.handlers.get(handler_type)
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _hooks: &dyn EngineHooks,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _hooks: &dyn EngineHooks,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline completed"))
    }
}

pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _hooks: &dyn EngineHooks,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Conditional pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::CodergenHandler::new());
    reg.register(crate::handlers::ParallelHandler);
    reg.register(crate::handlers::FanInHandler);
    reg.register(crate::handlers::ManagerLoopHandler::new());
    reg
}

/// Create the default handler registry with WaitHumanHandler registered.
///
/// This factory function creates a registry with all the standard handlers
/// plus WaitHumanHandler configured with the provided interviewer.
/// Use this when you need to support hexagon (human review) nodes in pipelines.
pub fn default_registry_with_interviewer(
    interviewer: std::sync::Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry();
    reg.register(crate::handlers::wait_human::WaitHumanHandler::new(interviewer));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
