//! Error taxonomy for the approval engine
use crate::rule::{Currency, TransactionType};
use crate::workflow::WorkflowStatus;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("workflow {workflow_id} was modified concurrently; re-read and retry")]
    ConcurrentModification { workflow_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("no active rule matches {transaction_type:?}/{currency:?}")]
    NoRuleMatched {
        transaction_type: TransactionType,
        currency: Currency,
    },

    #[error("{user_id} lacks a required role for level {level}")]
    Authorization { user_id: String, level: u8 },

    #[error("external service failure: {0}")]
    ExternalService(String),
}
