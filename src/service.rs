//! Service layer API for approval workflow operations
use crate::analytics::{self, ApprovalMetrics, DailySummary};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventSink, WorkflowEvent};
use crate::identity::IdentityProvider;
use crate::ledger::{Action, ActionKind, ActionLedger};
use crate::notify::{Channel, NotificationDispatcher, NotificationType};
use crate::risk::{RiskAssessment, RiskScorer};
use crate::rule::{Role, RuleStore};
use crate::store::{self, EngineStore};
use crate::utils;
use crate::workflow::{TransactionRequest, Workflow, WorkflowStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Per-item outcome of a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResult {
    pub workflow_id: String,
    pub success: bool,
    pub message: Option<String>,
}

pub struct ApprovalService {
    store: EngineStore,
    rules: RuleStore,
    ledger: ActionLedger,
    dispatcher: NotificationDispatcher,
    config: EngineConfig,
    identity: Arc<dyn IdentityProvider>,
    scorer: Arc<dyn RiskScorer>,
    events: Arc<dyn EventSink>,
}

impl ApprovalService {
    pub fn new(
        instance: Arc<sled::Db>,
        config: EngineConfig,
        identity: Arc<dyn IdentityProvider>,
        scorer: Arc<dyn RiskScorer>,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<Self> {
        let engine_store = EngineStore::open(&instance)?;
        let rules = RuleStore::new(instance.open_tree(store::RULES_TREE)?);
        let ledger = ActionLedger::new(engine_store.actions_tree());
        let dispatcher =
            NotificationDispatcher::new(instance.open_tree(store::NOTIFICATIONS_TREE)?, config.clone());

        Ok(Self {
            store: engine_store,
            rules,
            ledger,
            dispatcher,
            config,
            identity,
            scorer,
            events,
        })
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn ledger(&self) -> &ActionLedger {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflow(&self, workflow_id: &str) -> anyhow::Result<Workflow> {
        self.store.workflow(workflow_id)
    }

    pub fn assessments_for(&self, transaction_id: &str) -> anyhow::Result<Vec<RiskAssessment>> {
        self.store.assessments_for(transaction_id)
    }

    /// Submit a transaction for authorization. Matches a rule, scores the
    /// risk (bounded; failure leaves the workflow unscored rather than
    /// blocking) and opens a pending workflow at level 1.
    pub fn create_workflow(&self, request: TransactionRequest) -> anyhow::Result<Workflow> {
        let rule =
            self.rules
                .match_rule(request.transaction_type, request.amount, request.currency)?;
        let mut workflow = Workflow::new(&request, &rule)?;

        let scorer = Arc::clone(&self.scorer);
        let scoring_request = request.clone();
        let evaluation = utils::call_with_timeout(self.config.external_call_timeout, move || {
            scorer.assess(&scoring_request)
        });
        match evaluation {
            Some(Ok(evaluation)) => {
                let assessment =
                    RiskAssessment::new(&request.transaction_id, Some(workflow.id.clone()), evaluation)?;
                workflow.risk_score = Some(assessment.risk_score);
                self.store.insert_assessment(&assessment)?;
            }
            Some(Err(err)) => {
                tracing::warn!(transaction_id = %request.transaction_id, error = %err, "risk scoring failed");
                workflow.annotations.push("risk assessment unavailable".into());
            }
            None => {
                tracing::warn!(transaction_id = %request.transaction_id, "risk scoring timed out");
                workflow.annotations.push("risk assessment unavailable".into());
            }
        }

        self.store.insert_workflow(&workflow)?;
        tracing::info!(
            workflow_id = %workflow.id,
            transaction_id = %workflow.transaction_id,
            levels = workflow.total_levels,
            "workflow created"
        );
        self.events.publish(WorkflowEvent::Created {
            workflow_id: workflow.id.clone(),
            transaction_id: workflow.transaction_id.clone(),
        });
        self.dispatcher.enqueue(
            &workflow.id,
            &workflow.requester_id,
            NotificationType::WorkflowCreated,
            Channel::InApp,
        )?;

        Ok(workflow)
    }

    /// Approve the current level. On the final level the workflow completes;
    /// otherwise the level increments by exactly one and any delegation for
    /// the finished level is cleared.
    pub fn advance_level(
        &self,
        workflow_id: &str,
        approver_id: &str,
        comment: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        let snapshot = self.store.workflow(workflow_id)?;
        self.ensure_actionable(&snapshot)?;
        self.authorize_approver(&snapshot, approver_id)?;

        let action = Action::new(
            workflow_id,
            approver_id,
            snapshot.current_level,
            ActionKind::Approve,
            comment,
            None,
            client_addr,
        )?;
        let final_level = snapshot.is_final_level();
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| {
                if final_level {
                    workflow.status = WorkflowStatus::Approved;
                } else {
                    workflow.current_level += 1;
                    workflow.status = WorkflowStatus::Pending;
                    workflow.delegated_to = None;
                }
            },
            &action,
        )?;

        if updated.status == WorkflowStatus::Approved {
            tracing::info!(workflow_id, approver_id, "workflow approved");
            self.events.publish(WorkflowEvent::Approved {
                workflow_id: workflow_id.to_string(),
            });
            self.notify_requester(&updated, NotificationType::Approved)?;
        } else {
            tracing::info!(workflow_id, approver_id, level = updated.current_level, "level advanced");
            self.events.publish(WorkflowEvent::LevelAdvanced {
                workflow_id: workflow_id.to_string(),
                level: updated.current_level,
            });
            self.notify_requester(&updated, NotificationType::LevelAdvanced)?;
        }

        Ok(updated)
    }

    /// Reject at the current level. Rejection at any level is terminal.
    pub fn reject_level(
        &self,
        workflow_id: &str,
        approver_id: &str,
        comment: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        let snapshot = self.store.workflow(workflow_id)?;
        self.ensure_actionable(&snapshot)?;
        self.authorize_approver(&snapshot, approver_id)?;

        let action = Action::new(
            workflow_id,
            approver_id,
            snapshot.current_level,
            ActionKind::Reject,
            comment,
            None,
            client_addr,
        )?;
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| workflow.status = WorkflowStatus::Rejected,
            &action,
        )?;

        tracing::info!(workflow_id, approver_id, "workflow rejected");
        self.events.publish(WorkflowEvent::Rejected {
            workflow_id: workflow_id.to_string(),
        });
        self.notify_requester(&updated, NotificationType::Rejected)?;
        Ok(updated)
    }

    /// Reassign responsibility for the current level only. Neither the
    /// level nor the status changes.
    pub fn delegate(
        &self,
        workflow_id: &str,
        from_approver: &str,
        to_approver: &str,
        comment: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        if to_approver.trim().is_empty() {
            return Err(EngineError::Validation("delegate target must not be empty".into()).into());
        }
        if to_approver == from_approver {
            return Err(EngineError::Validation("cannot delegate to oneself".into()).into());
        }

        let snapshot = self.store.workflow(workflow_id)?;
        self.ensure_actionable(&snapshot)?;
        self.authorize_approver(&snapshot, from_approver)?;

        let action = Action::new(
            workflow_id,
            from_approver,
            snapshot.current_level,
            ActionKind::Delegate,
            comment,
            Some(to_approver),
            client_addr,
        )?;
        let target = to_approver.to_string();
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| workflow.delegated_to = Some(target.clone()),
            &action,
        )?;

        tracing::info!(workflow_id, from_approver, to_approver, "level delegated");
        Ok(updated)
    }

    /// Request higher-authority review out of band. The level counter is
    /// untouched; executives act on escalated workflows.
    pub fn escalate(
        &self,
        workflow_id: &str,
        actor_id: &str,
        comment: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        let snapshot = self.store.workflow(workflow_id)?;
        if snapshot.status != WorkflowStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from: snapshot.status,
                to: WorkflowStatus::Escalated,
            }
            .into());
        }
        if snapshot.requester_id != actor_id {
            self.authorize_approver(&snapshot, actor_id)?;
        }

        let action = Action::new(
            workflow_id,
            actor_id,
            snapshot.current_level,
            ActionKind::Escalate,
            comment,
            None,
            client_addr,
        )?;
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| workflow.status = WorkflowStatus::Escalated,
            &action,
        )?;

        tracing::info!(workflow_id, actor_id, "workflow escalated");
        self.events.publish(WorkflowEvent::Escalated {
            workflow_id: workflow_id.to_string(),
        });
        self.notify_requester(&updated, NotificationType::Escalated)?;
        Ok(updated)
    }

    /// Ledger-only request for more context from the requester. No status
    /// or level change.
    pub fn request_info(
        &self,
        workflow_id: &str,
        approver_id: &str,
        comment: &str,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        if comment.trim().is_empty() {
            return Err(EngineError::Validation("an information request needs a comment".into()).into());
        }

        let snapshot = self.store.workflow(workflow_id)?;
        self.ensure_actionable(&snapshot)?;
        self.authorize_approver(&snapshot, approver_id)?;

        let action = Action::new(
            workflow_id,
            approver_id,
            snapshot.current_level,
            ActionKind::RequestInfo,
            Some(comment),
            None,
            client_addr,
        )?;
        self.store.commit_transition(&snapshot, &|_| {}, &action)
    }

    /// Cancel a workflow, allowed to the requester and to executives.
    pub fn cancel(
        &self,
        workflow_id: &str,
        actor_id: &str,
        comment: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        let snapshot = self.store.workflow(workflow_id)?;
        self.ensure_privileged_or_requester(&snapshot, actor_id)?;

        let action = Action::new(
            workflow_id,
            actor_id,
            snapshot.current_level,
            ActionKind::Cancel,
            comment,
            None,
            client_addr,
        )?;
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| workflow.status = WorkflowStatus::Cancelled,
            &action,
        )?;

        tracing::info!(workflow_id, actor_id, "workflow cancelled");
        self.events.publish(WorkflowEvent::Cancelled {
            workflow_id: workflow_id.to_string(),
        });
        Ok(updated)
    }

    /// Manually reopen an expired or escalated workflow at its current level.
    pub fn reopen(
        &self,
        workflow_id: &str,
        actor_id: &str,
        comment: Option<&str>,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        let snapshot = self.store.workflow(workflow_id)?;
        if !matches!(snapshot.status, WorkflowStatus::Expired | WorkflowStatus::Escalated) {
            return Err(EngineError::InvalidTransition {
                from: snapshot.status,
                to: WorkflowStatus::Pending,
            }
            .into());
        }
        self.ensure_privileged_or_requester(&snapshot, actor_id)?;

        let action = Action::new(
            workflow_id,
            actor_id,
            snapshot.current_level,
            ActionKind::Reopen,
            comment,
            None,
            client_addr,
        )?;
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| workflow.status = WorkflowStatus::Pending,
            &action,
        )?;

        tracing::info!(workflow_id, actor_id, "workflow reopened");
        self.events.publish(WorkflowEvent::Reopened {
            workflow_id: workflow_id.to_string(),
        });
        Ok(updated)
    }

    /// Privileged short-circuit: approves immediately, bypassing remaining
    /// levels, with a mandatory justification and a synthetic audit action.
    pub fn emergency_override(
        &self,
        workflow_id: &str,
        actor_id: &str,
        reason: &str,
        client_addr: Option<&str>,
    ) -> anyhow::Result<Workflow> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation("an override reason is mandatory".into()).into());
        }
        if !self.identity.has_role(actor_id, Role::Executive) {
            return Err(EngineError::Authorization {
                user_id: actor_id.to_string(),
                level: 0,
            }
            .into());
        }

        let snapshot = self.store.workflow(workflow_id)?;
        self.ensure_actionable(&snapshot)?;

        let action = Action::new(
            workflow_id,
            actor_id,
            snapshot.current_level,
            ActionKind::EmergencyOverride,
            Some(reason),
            None,
            client_addr,
        )?;
        let actor = actor_id.to_string();
        let justification = reason.to_string();
        let updated = self.store.commit_transition(
            &snapshot,
            &|workflow: &mut Workflow| {
                workflow.status = WorkflowStatus::Approved;
                workflow.emergency_override = true;
                workflow.override_reason = Some(justification.clone());
                workflow.override_by = Some(actor.clone());
            },
            &action,
        )?;

        tracing::warn!(workflow_id, actor_id, "emergency override applied");
        self.events.publish(WorkflowEvent::Approved {
            workflow_id: workflow_id.to_string(),
        });
        self.notify_requester(&updated, NotificationType::Approved)?;
        Ok(updated)
    }

    /// Append an audit note. The only mutation permitted on completed rows.
    pub fn annotate(&self, workflow_id: &str, note: &str) -> anyhow::Result<Workflow> {
        self.store.annotate(workflow_id, note)
    }

    /// Apply one approval across many workflows, each item its own failure
    /// domain. A bad workflow never aborts the batch; results keep input
    /// order.
    pub fn bulk_approve(
        &self,
        workflow_ids: &[String],
        approver_id: &str,
        comment: Option<&str>,
    ) -> Vec<BulkResult> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = workflow_ids
                .iter()
                .map(|workflow_id| {
                    let id = workflow_id.clone();
                    let handle = scope.spawn(move || self.approve_one(&id, approver_id, comment));
                    (workflow_id.clone(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(workflow_id, handle)| {
                    handle.join().unwrap_or_else(|_| BulkResult {
                        workflow_id,
                        success: false,
                        message: Some("approval worker panicked".into()),
                    })
                })
                .collect()
        })
    }

    fn approve_one(&self, workflow_id: &str, approver_id: &str, comment: Option<&str>) -> BulkResult {
        let pending_check = self.store.workflow(workflow_id).and_then(|workflow| {
            if workflow.status != WorkflowStatus::Pending {
                return Err(EngineError::Validation(format!(
                    "not pending: {:?}",
                    workflow.status
                ))
                .into());
            }
            Ok(workflow)
        });

        let outcome = pending_check
            .and_then(|_| self.advance_level(workflow_id, approver_id, comment, None));
        match outcome {
            Ok(_) => BulkResult {
                workflow_id: workflow_id.to_string(),
                success: true,
                message: None,
            },
            Err(err) => BulkResult {
                workflow_id: workflow_id.to_string(),
                success: false,
                message: Some(err.to_string()),
            },
        }
    }

    /// Approval inbox: pending work the user may act on, most urgent first.
    pub fn pending_approvals_for(&self, user_id: &str) -> anyhow::Result<Vec<Workflow>> {
        let candidates = self
            .store
            .workflows_with_status(&[WorkflowStatus::Pending, WorkflowStatus::Escalated])?;

        let mut inbox = vec![];
        for workflow in candidates {
            if self.authorize_approver(&workflow, user_id).is_ok() {
                inbox.push(workflow);
            }
        }
        inbox.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.risk_score.unwrap_or(0).cmp(&a.risk_score.unwrap_or(0)))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(inbox)
    }

    pub fn approval_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<ApprovalMetrics> {
        let workflows = self.store.all_workflows()?;
        Ok(analytics::metrics_over(&workflows, start, end))
    }

    pub fn daily_summary(&self, date: chrono::NaiveDate) -> anyhow::Result<Option<DailySummary>> {
        self.store.summary(&date.format("%Y-%m-%d").to_string())
    }

    /// Expiration sweep: pending workflows past the configured timeout and
    /// not flagged no_expiry become expired, with a synthetic expire action
    /// attributed to the requester. Races lost to concurrent user actions
    /// are skipped, not retried.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - self.config.expiry_timeout;
        let mut expired = 0;

        for workflow in self.store.workflows_with_status(&[WorkflowStatus::Pending])? {
            if workflow.no_expiry || workflow.created_at.to_datetime_utc() >= cutoff {
                continue;
            }

            let action = Action::new(
                &workflow.id,
                &workflow.requester_id,
                workflow.current_level,
                ActionKind::Expire,
                Some("expired by maintenance sweep"),
                None,
                None,
            )?;
            match self.store.commit_transition(
                &workflow,
                &|w: &mut Workflow| w.status = WorkflowStatus::Expired,
                &action,
            ) {
                Ok(updated) => {
                    expired += 1;
                    self.events.publish(WorkflowEvent::Expired {
                        workflow_id: updated.id.clone(),
                    });
                    self.notify_requester(&updated, NotificationType::Expired)?;
                }
                Err(err) => match err.downcast_ref::<EngineError>() {
                    // a user action claimed the row first; leave it alone
                    Some(EngineError::ConcurrentModification { .. })
                    | Some(EngineError::InvalidTransition { .. }) => continue,
                    _ => return Err(err),
                },
            }
        }

        if expired > 0 {
            tracing::info!(expired, "stale workflows expired");
        }
        Ok(expired)
    }

    /// Recompute the daily summary cache for the trailing window.
    pub fn refresh_analytics(&self, now: DateTime<Utc>, days_back: u32) -> anyhow::Result<usize> {
        let workflows = self.store.all_workflows()?;
        let mut refreshed = 0;
        for offset in 0..days_back {
            let date = (now - chrono::Duration::days(offset as i64)).date_naive();
            let summary = analytics::summarize_day(date, &workflows);
            self.store.put_summary(&summary)?;
            refreshed += 1;
        }
        Ok(refreshed)
    }

    fn notify_requester(
        &self,
        workflow: &Workflow,
        notification_type: NotificationType,
    ) -> anyhow::Result<()> {
        self.dispatcher
            .enqueue(&workflow.id, &workflow.requester_id, notification_type, Channel::InApp)?;
        Ok(())
    }

    fn ensure_actionable(&self, workflow: &Workflow) -> anyhow::Result<()> {
        if !workflow.status.is_actionable() {
            return Err(EngineError::InvalidTransition {
                from: workflow.status,
                to: workflow.status,
            }
            .into());
        }
        Ok(())
    }

    /// Escalated workflows demand the executive role; pending ones accept
    /// the current delegate or any holder of a required role for the level.
    fn authorize_approver(&self, workflow: &Workflow, user_id: &str) -> anyhow::Result<()> {
        let denied = || EngineError::Authorization {
            user_id: user_id.to_string(),
            level: workflow.current_level,
        };

        if workflow.status == WorkflowStatus::Escalated {
            if self.identity.has_role(user_id, Role::Executive) {
                return Ok(());
            }
            return Err(denied().into());
        }

        if workflow.delegated_to.as_deref() == Some(user_id) {
            return Ok(());
        }

        let Some(rule_id) = &workflow.rule_id else {
            return Err(denied().into());
        };
        let rule = self.rules.get(rule_id)?;
        let roles = rule
            .roles_for_level(workflow.current_level)
            .ok_or_else(denied)?;
        if roles.roles().iter().any(|role| self.identity.has_role(user_id, *role)) {
            return Ok(());
        }
        Err(denied().into())
    }

    fn ensure_privileged_or_requester(&self, workflow: &Workflow, actor_id: &str) -> anyhow::Result<()> {
        if workflow.requester_id == actor_id || self.identity.has_role(actor_id, Role::Executive) {
            return Ok(());
        }
        Err(EngineError::Authorization {
            user_id: actor_id.to_string(),
            level: workflow.current_level,
        }
        .into())
    }
}
