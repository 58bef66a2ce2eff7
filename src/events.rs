//! Workflow lifecycle events published to external consumers
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    Created { workflow_id: String, transaction_id: String },
    LevelAdvanced { workflow_id: String, level: u8 },
    Approved { workflow_id: String },
    Rejected { workflow_id: String },
    Cancelled { workflow_id: String },
    Escalated { workflow_id: String },
    Expired { workflow_id: String },
    Reopened { workflow_id: String },
}

/// Consumer of lifecycle events (notification fan-out, audit, reporting).
/// Publishing happens after the owning transition has committed.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: WorkflowEvent);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: WorkflowEvent) {}
}

/// Buffers events in memory, useful for tests and single-process embedding.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.events.lock().expect("event sink poisoned"))
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: WorkflowEvent) {
        self.events.lock().expect("event sink poisoned").push(event);
    }
}
