//! sled-backed persistence and the conditional transition commit
//!
//! All workflow mutation funnels through [`EngineStore::commit_transition`]:
//! a multi-tree transaction that re-reads the row, compares
//! `(status, current_level)` against the snapshot the caller computed from,
//! and writes the updated row together with its ledger action as one unit.
use crate::analytics::DailySummary;
use crate::error::EngineError;
use crate::ledger::{Action, ActionLedger};
use crate::risk::RiskAssessment;
use crate::workflow::{TimeStamp, Workflow, WorkflowStatus};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::sync::Arc;

pub(crate) const WORKFLOWS_TREE: &str = "workflows";
pub(crate) const ACTIONS_TREE: &str = "actions";
pub(crate) const RULES_TREE: &str = "rules";
pub(crate) const ASSESSMENTS_TREE: &str = "assessments";
pub(crate) const NOTIFICATIONS_TREE: &str = "notifications";
pub(crate) const ANALYTICS_TREE: &str = "analytics";

pub(crate) struct EngineStore {
    workflows: sled::Tree,
    actions: sled::Tree,
    assessments: sled::Tree,
    analytics: sled::Tree,
}

type Abort = ConflictableTransactionError<EngineError>;

fn abort(err: EngineError) -> Abort {
    ConflictableTransactionError::Abort(err)
}

fn unwrap_transaction(err: TransactionError<EngineError>) -> anyhow::Error {
    match err {
        TransactionError::Abort(engine) => anyhow::Error::new(engine),
        TransactionError::Storage(storage) => anyhow::Error::new(storage),
    }
}

impl EngineStore {
    pub(crate) fn open(db: &Arc<sled::Db>) -> anyhow::Result<Self> {
        Ok(Self {
            workflows: db.open_tree(WORKFLOWS_TREE)?,
            actions: db.open_tree(ACTIONS_TREE)?,
            assessments: db.open_tree(ASSESSMENTS_TREE)?,
            analytics: db.open_tree(ANALYTICS_TREE)?,
        })
    }

    pub(crate) fn actions_tree(&self) -> sled::Tree {
        self.actions.clone()
    }

    pub(crate) fn insert_workflow(&self, workflow: &Workflow) -> anyhow::Result<()> {
        self.workflows
            .insert(workflow.id.as_bytes(), minicbor::to_vec(workflow)?)?;
        Ok(())
    }

    pub(crate) fn workflow(&self, workflow_id: &str) -> anyhow::Result<Workflow> {
        let raw = self
            .workflows
            .get(workflow_id.as_bytes())?
            .ok_or_else(|| EngineError::NotFound {
                kind: "workflow",
                id: workflow_id.to_string(),
            })?;
        Ok(minicbor::decode(&raw)?)
    }

    pub(crate) fn all_workflows(&self) -> anyhow::Result<Vec<Workflow>> {
        let mut workflows = vec![];
        for entry in self.workflows.iter() {
            let (_, raw) = entry?;
            workflows.push(minicbor::decode(&raw)?);
        }
        Ok(workflows)
    }

    pub(crate) fn workflows_with_status(
        &self,
        statuses: &[WorkflowStatus],
    ) -> anyhow::Result<Vec<Workflow>> {
        Ok(self
            .all_workflows()?
            .into_iter()
            .filter(|w| statuses.contains(&w.status))
            .collect())
    }

    /// Commit one transition: compare-and-swap on `(status, current_level)`
    /// plus the ledger append, atomically. `apply` must be a pure function
    /// of the row; the transaction may re-run it.
    pub(crate) fn commit_transition(
        &self,
        snapshot: &Workflow,
        apply: &dyn Fn(&mut Workflow),
        action: &Action,
    ) -> anyhow::Result<Workflow> {
        let committed = (&self.workflows, &self.actions)
            .transaction(|(workflows, actions)| {
                let raw = workflows
                    .get(snapshot.id.as_bytes())?
                    .ok_or_else(|| {
                        abort(EngineError::NotFound {
                            kind: "workflow",
                            id: snapshot.id.clone(),
                        })
                    })?;
                let current: Workflow = minicbor::decode(&raw).map_err(|e| {
                    abort(EngineError::Validation(format!("stored workflow is unreadable: {e}")))
                })?;

                if current.status != snapshot.status
                    || current.current_level != snapshot.current_level
                {
                    return Err(abort(EngineError::ConcurrentModification {
                        workflow_id: snapshot.id.clone(),
                    }));
                }

                let mut updated = current.clone();
                apply(&mut updated);

                if updated.status != current.status
                    && !current.status.can_transition_to(updated.status)
                {
                    return Err(abort(EngineError::InvalidTransition {
                        from: current.status,
                        to: updated.status,
                    }));
                }
                // completed_at is non-null iff the status set says so
                if updated.status.is_complete() {
                    if updated.completed_at.is_none() {
                        updated.completed_at = Some(TimeStamp::new());
                    }
                } else {
                    updated.completed_at = None;
                }

                let mut entry = action.clone();
                entry.seq = current.action_count;
                updated.action_count = current.action_count + 1;

                let encoded_action = minicbor::to_vec(&entry).map_err(|e| {
                    abort(EngineError::Validation(format!("serialize action: {e}")))
                })?;
                let encoded_workflow = minicbor::to_vec(&updated).map_err(|e| {
                    abort(EngineError::Validation(format!("serialize workflow: {e}")))
                })?;

                actions.insert(ActionLedger::key(&entry.workflow_id, entry.seq), encoded_action)?;
                workflows.insert(updated.id.as_bytes(), encoded_workflow)?;
                Ok(updated)
            })
            .map_err(unwrap_transaction)?;

        Ok(committed)
    }

    /// Audit annotations are the one mutation allowed on completed rows.
    /// No status or level changes, so no ledger entry and no CAS guard.
    pub(crate) fn annotate(&self, workflow_id: &str, note: &str) -> anyhow::Result<Workflow> {
        let updated = self
            .workflows
            .transaction(|workflows| {
                let raw = workflows
                    .get(workflow_id.as_bytes())?
                    .ok_or_else(|| {
                        abort(EngineError::NotFound {
                            kind: "workflow",
                            id: workflow_id.to_string(),
                        })
                    })?;
                let mut workflow: Workflow = minicbor::decode(&raw).map_err(|e| {
                    abort(EngineError::Validation(format!("stored workflow is unreadable: {e}")))
                })?;
                workflow.annotations.push(note.to_string());

                let encoded = minicbor::to_vec(&workflow).map_err(|e| {
                    abort(EngineError::Validation(format!("serialize workflow: {e}")))
                })?;
                workflows.insert(workflow.id.as_bytes(), encoded)?;
                Ok(workflow)
            })
            .map_err(unwrap_transaction)?;

        Ok(updated)
    }

    pub(crate) fn insert_assessment(&self, assessment: &RiskAssessment) -> anyhow::Result<()> {
        self.assessments
            .insert(assessment.id.as_bytes(), minicbor::to_vec(assessment)?)?;
        Ok(())
    }

    pub(crate) fn assessments_for(&self, transaction_id: &str) -> anyhow::Result<Vec<RiskAssessment>> {
        let mut assessments: Vec<RiskAssessment> = vec![];
        for entry in self.assessments.iter() {
            let (_, raw) = entry?;
            let assessment: RiskAssessment = minicbor::decode(&raw)?;
            if assessment.transaction_id == transaction_id {
                assessments.push(assessment);
            }
        }
        assessments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(assessments)
    }

    pub(crate) fn put_summary(&self, summary: &DailySummary) -> anyhow::Result<()> {
        self.analytics
            .insert(summary.date.as_bytes(), minicbor::to_vec(summary)?)?;
        Ok(())
    }

    pub(crate) fn summary(&self, date: &str) -> anyhow::Result<Option<DailySummary>> {
        match self.analytics.get(date.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }
}
