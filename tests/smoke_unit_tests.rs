//! Smoke tests spanning the engine's components in isolation from the
//! larger workflow scenarios. Generally happy-path plus the documented
//! failure modes of each component.
use approval_engine::{
    config::EngineConfig,
    error::EngineError,
    events::MemorySink,
    identity::StaticRoles,
    notify::{Channel, NotificationChannel, NotificationStatus, NotificationType},
    risk::{RiskEvaluation, RiskScorer, UnscoredRisk},
    rule::{ApprovalRule, Currency, LevelRoles, Role, TransactionType},
    service::ApprovalService,
    workflow::{TransactionRequest, WorkflowStatus},
};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct AmountScorer;

impl RiskScorer for AmountScorer {
    fn assess(&self, request: &TransactionRequest) -> anyhow::Result<RiskEvaluation> {
        Ok(RiskEvaluation {
            score: (request.amount % 101) as u8,
            factors: vec![],
            fraud_indicators: vec![],
            method: "amount".into(),
        })
    }
}

struct SlowScorer;

impl RiskScorer for SlowScorer {
    fn assess(&self, _request: &TransactionRequest) -> anyhow::Result<RiskEvaluation> {
        std::thread::sleep(std::time::Duration::from_millis(500));
        Ok(RiskEvaluation {
            score: 10,
            factors: vec![],
            fraud_indicators: vec![],
            method: "slow".into(),
        })
    }
}

struct AlwaysDelivers;

impl NotificationChannel for AlwaysDelivers {
    fn send(&self, _notification: &approval_engine::notify::Notification) -> anyhow::Result<()> {
        Ok(())
    }
}

struct AlwaysFails;

impl NotificationChannel for AlwaysFails {
    fn send(&self, _notification: &approval_engine::notify::Notification) -> anyhow::Result<()> {
        Err(anyhow::Error::msg("smtp unreachable"))
    }
}

/// Fails the first `n` sends, then delivers.
struct Flaky {
    failures_left: Mutex<u32>,
}

impl NotificationChannel for Flaky {
    fn send(&self, _notification: &approval_engine::notify::Notification) -> anyhow::Result<()> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(anyhow::Error::msg("transient failure"));
        }
        Ok(())
    }
}

fn open_service_with(
    dir: &tempfile::TempDir,
    name: &str,
    config: EngineConfig,
    identity: StaticRoles,
    scorer: Arc<dyn RiskScorer>,
) -> ApprovalService {
    let db = sled::open(dir.path().join(name)).unwrap();
    ApprovalService::new(
        Arc::new(db),
        config,
        Arc::new(identity),
        scorer,
        Arc::new(MemorySink::new()),
    )
    .unwrap()
}

fn open_service(dir: &tempfile::TempDir, name: &str, identity: StaticRoles) -> ApprovalService {
    open_service_with(dir, name, EngineConfig::default(), identity, Arc::new(AmountScorer))
}

fn manager_rule(threshold: Option<u64>) -> ApprovalRule {
    ApprovalRule::new(
        "payments",
        TransactionType::Payment,
        threshold,
        Currency::USD,
        vec![LevelRoles::single(Role::Manager)],
    )
    .unwrap()
}

fn payment(amount: u64) -> TransactionRequest {
    TransactionRequest::new(
        approval_engine::utils::new_uuid_to_bech32("txn_").unwrap(),
        TransactionType::Payment,
        amount,
        Currency::USD,
        "usr_requester",
    )
}

mod rule_store {
    use super::*;

    #[test]
    fn duplicate_active_rules_are_refused() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "rules_unique.db", StaticRoles::new());

        service.rules().create(manager_rule(Some(1_000))).unwrap();
        let err = service.rules().create(manager_rule(Some(1_000))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));

        // thresholdless uniqueness is checked separately
        service.rules().create(manager_rule(None)).unwrap();
        let err = service.rules().create(manager_rule(None)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));
    }

    #[test]
    fn deactivate_then_create_succeeds() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "rules_toggle.db", StaticRoles::new());

        let first = service.rules().create(manager_rule(Some(1_000))).unwrap();
        service.rules().set_active(&first.id, false).unwrap();
        service.rules().create(manager_rule(Some(1_000))).unwrap();

        // reactivating the first would clash again
        let err = service.rules().set_active(&first.id, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));
    }

    #[test]
    fn matching_through_the_store_prefers_the_tightest_band() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "rules_match.db", StaticRoles::new());

        service.rules().create(manager_rule(Some(100))).unwrap();
        service.rules().create(manager_rule(Some(1_000))).unwrap();
        service.rules().create(manager_rule(None)).unwrap();

        let matched = service
            .rules()
            .match_rule(TransactionType::Payment, 1_500, Currency::USD)
            .unwrap();
        assert_eq!(matched.amount_threshold, Some(1_000));

        let matched = service
            .rules()
            .match_rule(TransactionType::Payment, 50, Currency::USD)
            .unwrap();
        assert_eq!(matched.amount_threshold, None);

        let err = service
            .rules()
            .match_rule(TransactionType::Loan, 50, Currency::USD)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NoRuleMatched { .. })
        ));
    }
}

mod notifications {
    use super::*;

    fn quick_retry_config() -> EngineConfig {
        EngineConfig {
            notification_cooldown: chrono::Duration::zero(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn failed_sends_are_retried_until_delivery() {
        let dir = tempdir().unwrap();
        let service = open_service_with(
            &dir,
            "ntf_flaky.db",
            quick_retry_config(),
            StaticRoles::new(),
            Arc::new(AmountScorer),
        );
        let dispatcher = service.dispatcher();

        let notification = dispatcher
            .enqueue("wf_x", "usr_r", NotificationType::ApprovalRequired, Channel::Email)
            .unwrap();

        let flaky: Arc<dyn NotificationChannel> = Arc::new(Flaky {
            failures_left: Mutex::new(2),
        });

        let report = dispatcher.deliver_pending(&flaky).unwrap();
        assert_eq!((report.sent, report.failed), (0, 1));

        assert_eq!(dispatcher.retry_failed(Utc::now()).unwrap(), 1);
        let report = dispatcher.deliver_pending(&flaky).unwrap();
        assert_eq!((report.sent, report.failed), (0, 1));

        assert_eq!(dispatcher.retry_failed(Utc::now()).unwrap(), 1);
        let report = dispatcher.deliver_pending(&flaky).unwrap();
        assert_eq!((report.sent, report.failed), (1, 0));

        let sent = dispatcher.get(&notification.id).unwrap();
        assert_eq!(sent.status, NotificationStatus::Sent);
        assert_eq!(sent.retry_count, 2);

        let delivered = dispatcher.mark_delivered(&notification.id).unwrap();
        assert_eq!(delivered.status, NotificationStatus::Delivered);
    }

    #[test]
    fn retries_are_capped_and_surfaced_to_operators() {
        let dir = tempdir().unwrap();
        let service = open_service_with(
            &dir,
            "ntf_capped.db",
            quick_retry_config(),
            StaticRoles::new(),
            Arc::new(AmountScorer),
        );
        let dispatcher = service.dispatcher();

        let notification = dispatcher
            .enqueue("wf_x", "usr_r", NotificationType::ApprovalRequired, Channel::Email)
            .unwrap();
        let broken: Arc<dyn NotificationChannel> = Arc::new(AlwaysFails);

        for _ in 0..6 {
            dispatcher.deliver_pending(&broken).unwrap();
            dispatcher.retry_failed(Utc::now()).unwrap();
        }

        let stuck = dispatcher.get(&notification.id).unwrap();
        assert_eq!(stuck.status, NotificationStatus::Failed);
        assert_eq!(stuck.retry_count, 5);

        // no further automatic retries past the cap, ever
        assert_eq!(dispatcher.retry_failed(Utc::now()).unwrap(), 0);
        let surfaced = dispatcher.permanently_failed().unwrap();
        assert_eq!(surfaced.len(), 1);
        assert_eq!(surfaced[0].id, notification.id);
        assert_eq!(surfaced[0].last_error.as_deref(), Some("smtp unreachable"));
    }

    #[test]
    fn cooldown_holds_failures_back() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "ntf_cooldown.db", StaticRoles::new());
        let dispatcher = service.dispatcher();

        dispatcher
            .enqueue("wf_x", "usr_r", NotificationType::ApprovalRequired, Channel::Email)
            .unwrap();
        let broken: Arc<dyn NotificationChannel> = Arc::new(AlwaysFails);
        dispatcher.deliver_pending(&broken).unwrap();

        // the default cool-down is an hour; immediately after failing,
        // nothing is eligible
        assert_eq!(dispatcher.retry_failed(Utc::now()).unwrap(), 0);
        assert_eq!(
            dispatcher.retry_failed(Utc::now() + chrono::Duration::hours(2)).unwrap(),
            1
        );
    }

    #[test]
    fn pending_notifications_of_a_workflow_can_be_cancelled() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "ntf_cancel.db", StaticRoles::new());
        let dispatcher = service.dispatcher();

        dispatcher
            .enqueue("wf_a", "usr_r", NotificationType::ApprovalRequired, Channel::Email)
            .unwrap();
        dispatcher
            .enqueue("wf_b", "usr_r", NotificationType::ApprovalRequired, Channel::Email)
            .unwrap();

        assert_eq!(dispatcher.cancel_for_workflow("wf_a").unwrap(), 1);
        assert_eq!(dispatcher.with_status(NotificationStatus::Cancelled).unwrap().len(), 1);
        assert_eq!(dispatcher.with_status(NotificationStatus::Pending).unwrap().len(), 1);
    }

    #[test]
    fn successful_sends_are_reported() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "ntf_ok.db", StaticRoles::new());
        let dispatcher = service.dispatcher();

        dispatcher
            .enqueue("wf_a", "usr_r", NotificationType::Approved, Channel::InApp)
            .unwrap();
        let channel: Arc<dyn NotificationChannel> = Arc::new(AlwaysDelivers);
        let report = dispatcher.deliver_pending(&channel).unwrap();
        assert_eq!((report.sent, report.failed), (1, 0));
    }
}

mod risk_fallbacks {
    use super::*;

    #[test]
    fn scorer_failure_leaves_the_workflow_unscored_but_visible() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service_with(
            &dir,
            "risk_err.db",
            EngineConfig::default(),
            identity,
            Arc::new(UnscoredRisk),
        );
        service.rules().create(manager_rule(Some(100))).unwrap();

        let workflow = service.create_workflow(payment(500)).unwrap();
        assert_eq!(workflow.risk_score, None);
        assert!(workflow.annotations.iter().any(|a| a.contains("risk assessment unavailable")));

        // approval is not blocked by the missing score
        let workflow = service
            .advance_level(&workflow.id, "usr_manager", None, None)
            .unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Approved);
    }

    #[test]
    fn scorer_timeout_is_a_fallback_not_a_stall() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            external_call_timeout: std::time::Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let service =
            open_service_with(&dir, "risk_slow.db", config, StaticRoles::new(), Arc::new(SlowScorer));
        service.rules().create(manager_rule(Some(100))).unwrap();

        let started = std::time::Instant::now();
        let workflow = service.create_workflow(payment(500)).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(400));
        assert_eq!(workflow.risk_score, None);
    }

    #[test]
    fn successful_scores_are_recorded_as_assessments() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "risk_ok.db", StaticRoles::new());
        service.rules().create(manager_rule(Some(100))).unwrap();

        let request = payment(580);
        let transaction_id = request.transaction_id.clone();
        let workflow = service.create_workflow(request).unwrap();
        assert_eq!(workflow.risk_score, Some(75));

        let assessments = service.assessments_for(&transaction_id).unwrap();
        assert_eq!(assessments.len(), 1);
        assert_eq!(assessments[0].risk_score, 75);
        assert_eq!(assessments[0].workflow_id.as_deref(), Some(workflow.id.as_str()));
    }
}

mod inbox_and_metrics {
    use super::*;

    #[test]
    fn inbox_orders_by_priority_then_risk_then_age() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service(&dir, "inbox.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();

        // AmountScorer makes the risk score equal to amount % 101
        let low_risk = service.create_workflow(payment(510)).unwrap(); // score 5
        let high_risk = service.create_workflow(payment(585)).unwrap(); // score 80
        let urgent = service
            .create_workflow(payment(510).with_priority(5))
            .unwrap();

        let inbox = service.pending_approvals_for("usr_manager").unwrap();
        let ids: Vec<&str> = inbox.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec![urgent.id.as_str(), high_risk.id.as_str(), low_risk.id.as_str()]);

        // a user without the role sees nothing
        assert!(service.pending_approvals_for("usr_nobody").unwrap().is_empty());
    }

    #[test]
    fn metrics_cover_the_requested_window() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new()
            .grant("usr_manager", Role::Manager)
            .grant("usr_exec", Role::Executive);
        let service = open_service(&dir, "metrics.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();

        let a = service.create_workflow(payment(510)).unwrap();
        let b = service.create_workflow(payment(520)).unwrap();
        let c = service.create_workflow(payment(530)).unwrap();
        service.advance_level(&a.id, "usr_manager", None, None).unwrap();
        service.reject_level(&b.id, "usr_manager", None, None).unwrap();
        service.emergency_override(&c.id, "usr_exec", "deadline", None).unwrap();

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let metrics = service.approval_metrics(start, end).unwrap();

        assert_eq!(metrics.total_workflows, 3);
        // two approved out of three decided
        assert!((metrics.approval_rate_percent - 66.66).abs() < 0.5);
        assert!((metrics.emergency_override_rate_percent - 33.33).abs() < 0.5);
        assert!(metrics.avg_risk_score > 0.0);

        // a window in the past sees nothing
        let empty = service
            .approval_metrics(start - chrono::Duration::days(2), start - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(empty.total_workflows, 0);
        assert_eq!(empty.approval_rate_percent, 0.0);
    }

    #[test]
    fn analytics_refresh_populates_the_daily_cache() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service(&dir, "analytics.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();

        let workflow = service.create_workflow(payment(510)).unwrap();
        service.advance_level(&workflow.id, "usr_manager", None, None).unwrap();

        let now = Utc::now();
        assert_eq!(service.refresh_analytics(now, 7).unwrap(), 7);

        let today = service.daily_summary(now.date_naive()).unwrap().unwrap();
        assert_eq!(today.created, 1);
        assert_eq!(today.approved, 1);

        // refreshing again is idempotent
        service.refresh_analytics(now, 7).unwrap();
        let again = service.daily_summary(now.date_naive()).unwrap().unwrap();
        assert_eq!(again, today);
    }
}

mod maintenance {
    use super::*;
    use approval_engine::maintenance::MaintenanceScheduler;

    #[test]
    fn one_sweep_round_covers_expiry_retry_and_analytics() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            notification_cooldown: chrono::Duration::zero(),
            ..EngineConfig::default()
        };
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = Arc::new(open_service_with(
            &dir,
            "sweep.db",
            config,
            identity,
            Arc::new(AmountScorer),
        ));
        service.rules().create(manager_rule(Some(100))).unwrap();
        service.create_workflow(payment(500)).unwrap();

        let broken: Arc<dyn NotificationChannel> = Arc::new(AlwaysFails);
        service.dispatcher().deliver_pending(&broken).unwrap();

        let scheduler = MaintenanceScheduler::new(Arc::clone(&service));
        let report = scheduler.run_once(Utc::now() + chrono::Duration::days(8)).unwrap();

        assert_eq!(report.workflows_expired, 1);
        assert_eq!(report.notifications_retried, 1);
        assert_eq!(report.summaries_refreshed, 30);

        // nothing left to do on the next round except the refresh
        let again = scheduler.run_once(Utc::now() + chrono::Duration::days(8)).unwrap();
        assert_eq!(again.workflows_expired, 0);
        assert_eq!(again.summaries_refreshed, 30);
    }

    #[test]
    fn background_scheduler_stops_on_request() {
        let dir = tempdir().unwrap();
        let service = Arc::new(open_service(&dir, "scheduler.db", StaticRoles::new()));

        let handle =
            MaintenanceScheduler::spawn(service, std::time::Duration::from_millis(10));
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.stop();
    }
}

mod guardrails {
    use super::*;

    #[test]
    fn delegation_input_is_validated() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service(&dir, "delegate_input.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();
        let workflow = service.create_workflow(payment(500)).unwrap();

        let err = service
            .delegate(&workflow.id, "usr_manager", "  ", None, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));

        let err = service
            .delegate(&workflow.id, "usr_manager", "usr_manager", None, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));
    }

    #[test]
    fn information_requests_need_a_comment_and_leave_state_alone() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service(&dir, "request_info.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();
        let workflow = service.create_workflow(payment(500)).unwrap();

        assert!(service.request_info(&workflow.id, "usr_manager", "", None).is_err());

        let after = service
            .request_info(&workflow.id, "usr_manager", "which cost centre?", None)
            .unwrap();
        assert_eq!(after.status, WorkflowStatus::Pending);
        assert_eq!(after.current_level, 1);
        assert_eq!(service.ledger().history(&workflow.id).unwrap().len(), 1);
    }

    #[test]
    fn unknown_ids_surface_not_found() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "not_found.db", StaticRoles::new());

        let err = service.workflow("wf_missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotFound { kind: "workflow", .. })
        ));

        let err = service.rules().get("rule_missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotFound { kind: "rule", .. })
        ));
    }

    #[test]
    fn reopen_only_applies_to_expired_or_escalated() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service(&dir, "reopen_guard.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();
        let workflow = service.create_workflow(payment(500)).unwrap();

        let err = service
            .reopen(&workflow.id, "usr_requester", None, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn annotations_survive_terminal_states() {
        let dir = tempdir().unwrap();
        let identity = StaticRoles::new().grant("usr_manager", Role::Manager);
        let service = open_service(&dir, "annotate.db", identity);
        service.rules().create(manager_rule(Some(100))).unwrap();

        let workflow = service.create_workflow(payment(500)).unwrap();
        service.advance_level(&workflow.id, "usr_manager", None, None).unwrap();

        let annotated = service.annotate(&workflow.id, "linked to incident 4411").unwrap();
        assert!(annotated.annotations.contains(&"linked to incident 4411".to_string()));
        assert_eq!(annotated.status, WorkflowStatus::Approved);
    }
}
