//! Append-only action ledger, the canonical audit trail
//!
//! Every workflow status change corresponds to exactly one ledger action,
//! written in the same storage transaction as the workflow row. The row's
//! `(status, current_level)` is a materialized projection; [`replay`] folds
//! the ordered history back into it.
use crate::error::EngineError;
use crate::utils;
use crate::workflow::{TimeStamp, WorkflowStatus};
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
    #[n(2)]
    Delegate,
    #[n(3)]
    Escalate,
    #[n(4)]
    RequestInfo,
    #[n(5)]
    Cancel,
    // system-generated by the expiration sweep, attributed to the requester
    #[n(6)]
    Expire,
    // synthetic record of a privileged short-circuit approval
    #[n(7)]
    EmergencyOverride,
    #[n(8)]
    Reopen,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Action {
    #[n(0)]
    pub id: String, // uuid7, bech32 "act_"
    #[n(1)]
    pub workflow_id: String,
    #[n(2)]
    pub seq: u64, // assigned at commit time, dense per workflow
    #[n(3)]
    pub approver_id: String,
    #[n(4)]
    pub level: u8,
    #[n(5)]
    pub kind: ActionKind,
    #[n(6)]
    pub comments: Option<String>,
    #[n(7)]
    pub delegated_to: Option<String>, // required iff kind == Delegate
    #[n(8)]
    pub client_addr: Option<String>, // requester IP/agent for audit
    #[n(9)]
    pub content_hash: String, // sha256 over the CBOR payload, tamper evidence
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
}

impl Action {
    pub fn new(
        workflow_id: &str,
        approver_id: &str,
        level: u8,
        kind: ActionKind,
        comments: Option<&str>,
        delegated_to: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Self> {
        match (kind, delegated_to) {
            (ActionKind::Delegate, None) => {
                return Err(
                    EngineError::Validation("delegate actions require a target approver".into())
                        .into(),
                );
            }
            (ActionKind::Delegate, Some(_)) => {}
            (_, Some(_)) => {
                return Err(EngineError::Validation(
                    "delegated_to is only valid on delegate actions".into(),
                )
                .into());
            }
            _ => {}
        }

        let mut action = Self {
            id: utils::new_uuid_to_bech32("act_")?,
            workflow_id: workflow_id.to_string(),
            seq: 0,
            approver_id: approver_id.to_string(),
            level,
            kind,
            comments: comments.map(str::to_string),
            delegated_to: delegated_to.map(str::to_string),
            client_addr: client_addr.map(str::to_string),
            content_hash: String::new(),
            created_at: TimeStamp::new(),
        };
        let payload = minicbor::to_vec(&action)?;
        action.content_hash = sha256::digest(&payload);
        Ok(action)
    }
}

/// Fold an ordered action history into the `(status, current_level)`
/// projection. Deterministic for any input; the materialized workflow row
/// must always agree with the replay of its own history.
pub fn replay(total_levels: u8, actions: &[Action]) -> (WorkflowStatus, u8) {
    let mut status = WorkflowStatus::Pending;
    let mut level = 1u8;

    for action in actions {
        match action.kind {
            ActionKind::Approve => {
                if level == total_levels {
                    status = WorkflowStatus::Approved;
                } else {
                    level += 1;
                    status = WorkflowStatus::Pending;
                }
            }
            ActionKind::Reject => status = WorkflowStatus::Rejected,
            ActionKind::Cancel => status = WorkflowStatus::Cancelled,
            ActionKind::Escalate => status = WorkflowStatus::Escalated,
            ActionKind::Expire => status = WorkflowStatus::Expired,
            ActionKind::EmergencyOverride => status = WorkflowStatus::Approved,
            ActionKind::Reopen => status = WorkflowStatus::Pending,
            ActionKind::Delegate | ActionKind::RequestInfo => {}
        }
    }

    (status, level)
}

/// Read access to the ledger. Writes happen only inside workflow
/// transitions; there is no update or delete.
pub struct ActionLedger {
    tree: sled::Tree,
}

impl ActionLedger {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    // zero-padded decimal keeps lexicographic scan order equal to seq order
    pub(crate) fn key(workflow_id: &str, seq: u64) -> Vec<u8> {
        format!("{workflow_id}:{seq:010}").into_bytes()
    }

    /// Ordered action history for one workflow.
    pub fn history(&self, workflow_id: &str) -> anyhow::Result<Vec<Action>> {
        let prefix = format!("{workflow_id}:");
        let mut actions = vec![];
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = entry?;
            actions.push(minicbor::decode(&raw)?);
        }
        Ok(actions)
    }
}
