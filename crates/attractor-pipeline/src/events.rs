//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s synchronously, in subscription order, to every
//! registered [`EventObserver`]. Unlike a broadcast channel, no event is ever
//! silently dropped for lack of a receiver, delivery order matches
//! registration order, and a panicking observer never takes down the
//! pipeline run — its panic is caught and logged.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline_name: String,
        node_count: usize,
    },
    PipelineCompleted {
        pipeline_name: String,
        completed_nodes: Vec<String>,
        duration_ms: u64,
    },
    PipelineFailed {
        pipeline_name: String,
        error: String,
    },
    StageStarted {
        node_id: String,
        handler_type: String,
    },
    StageCompleted {
        node_id: String,
        status: String,
        duration_ms: u64,
    },
    StageFailed {
        node_id: String,
        error: String,
    },
    StageRetrying {
        node_id: String,
        attempt: usize,
    },
    EdgeSelected {
        from_node: String,
        to_node: String,
        edge_label: Option<String>,
    },
    GoalGateChecked {
        node_id: String,
        satisfied: bool,
    },
    CheckpointSaved {
        node_id: String,
    },
    ContextUpdated {
        node_id: String,
        keys: Vec<String>,
    },
    ParallelStarted {
        node_id: String,
        branch_count: usize,
    },
    BranchStarted {
        node_id: String,
        branch_node_id: String,
    },
    BranchCompleted {
        node_id: String,
        branch_node_id: String,
        status: String,
    },
    ParallelCompleted {
        node_id: String,
        status: String,
    },
    InterviewStarted {
        node_id: String,
        prompt: String,
    },
    InterviewCompleted {
        node_id: String,
        choice: String,
    },
    InterviewTimeout {
        node_id: String,
    },
}

/// An event together with the envelope metadata spec.md's event contract
/// requires every event to carry: a timestamp and the originating pipeline's
/// run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    pub pipeline_id: Uuid,
    pub event: PipelineEvent,
}

/// Receives pipeline events as they're emitted.
///
/// Implementations must not panic across an unwind boundary the emitter
/// can't catch (they can panic; the emitter catches it), but should avoid
/// blocking for long since `emit` calls observers synchronously and in
/// order.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &TimestampedEvent);
}

/// Logs every event through `tracing`, at `warn` for failure-shaped events
/// and `info` otherwise. Registered by default so pipeline activity is
/// always visible in the process's log sink even with no other observer
/// attached.
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, event: &TimestampedEvent) {
        match &event.event {
            PipelineEvent::PipelineFailed { pipeline_name, error } => {
                tracing::warn!(pipeline = %pipeline_name, %error, "pipeline failed");
            }
            PipelineEvent::StageFailed { node_id, error } => {
                tracing::warn!(node = %node_id, %error, "stage failed");
            }
            PipelineEvent::InterviewTimeout { node_id } => {
                tracing::warn!(node = %node_id, "interview timed out");
            }
            PipelineEvent::GoalGateChecked { node_id, satisfied } if !satisfied => {
                tracing::warn!(node = %node_id, "goal gate unsatisfied");
            }
            other => {
                tracing::info!(pipeline_id = %event.pipeline_id, event = ?other, "pipeline event");
            }
        }
    }
}

/// Event emitter fanning out to a subscription-ordered list of observers.
pub struct EventEmitter {
    pipeline_id: Uuid,
    observers: RwLock<Vec<Arc<dyn EventObserver>>>,
}

impl EventEmitter {
    /// Create a new emitter for a given pipeline run id, with no observers
    /// registered.
    pub fn new(pipeline_id: Uuid) -> Self {
        Self {
            pipeline_id,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer. Observers are called in registration order.
    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    /// Emit an event to every registered observer, in order. A panicking
    /// observer is caught and logged; it never aborts delivery to the
    /// remaining observers nor propagates into the caller.
    pub fn emit(&self, event: PipelineEvent) {
        let wrapped = TimestampedEvent {
            at: Utc::now(),
            pipeline_id: self.pipeline_id,
            event,
        };
        let observers = self.observers.read().unwrap();
        for observer in observers.iter() {
            let observer = observer.clone();
            let wrapped_ref = &wrapped;
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_event(wrapped_ref);
            }));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                tracing::error!(panic = %msg, "event observer panicked");
            }
        }
    }

    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        let emitter = Self::new(Uuid::new_v4());
        emitter.subscribe(Arc::new(TracingObserver));
        emitter
    }
}
