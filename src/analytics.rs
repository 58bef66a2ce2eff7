//! Derived aggregates: approval metrics and the daily summary cache
//!
//! Everything here is recomputable from the workflow table and the ledger;
//! nothing in this module is a source of truth.
use crate::workflow::{Workflow, WorkflowStatus};
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalMetrics {
    pub total_workflows: usize,
    pub avg_approval_time_hours: f64,
    pub approval_rate_percent: f64,
    pub avg_risk_score: f64,
    pub emergency_override_rate_percent: f64,
}

/// Read-optimized per-day rollup, refreshed by the maintenance sweep.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DailySummary {
    #[n(0)]
    pub date: String, // YYYY-MM-DD
    #[n(1)]
    pub created: u64,
    #[n(2)]
    pub approved: u64,
    #[n(3)]
    pub rejected: u64,
    #[n(4)]
    pub cancelled: u64,
    #[n(5)]
    pub expired: u64,
    #[n(6)]
    pub avg_completion_hours: f64,
}

fn completion_hours(workflow: &Workflow) -> Option<f64> {
    let completed = workflow.completed_at.as_ref()?.to_datetime_utc();
    let elapsed = completed - workflow.created_at.to_datetime_utc();
    Some(elapsed.num_seconds() as f64 / 3600.0)
}

/// Metrics over workflows created in `[start, end)`. Denominators of zero
/// yield zero rates rather than NaN.
pub fn metrics_over(workflows: &[Workflow], start: DateTime<Utc>, end: DateTime<Utc>) -> ApprovalMetrics {
    let window: Vec<&Workflow> = workflows
        .iter()
        .filter(|w| {
            let created = w.created_at.to_datetime_utc();
            created >= start && created < end
        })
        .collect();

    let total = window.len();
    let approved: Vec<&&Workflow> = window
        .iter()
        .filter(|w| w.status == WorkflowStatus::Approved)
        .collect();
    let rejected = window
        .iter()
        .filter(|w| w.status == WorkflowStatus::Rejected)
        .count();
    let overrides = window.iter().filter(|w| w.emergency_override).count();
    let scored: Vec<u8> = window.iter().filter_map(|w| w.risk_score).collect();

    let decided = approved.len() + rejected;
    let approval_rate_percent = if decided == 0 {
        0.0
    } else {
        approved.len() as f64 / decided as f64 * 100.0
    };

    let durations: Vec<f64> = approved.iter().filter_map(|w| completion_hours(w)).collect();
    let avg_approval_time_hours = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    let avg_risk_score = if scored.is_empty() {
        0.0
    } else {
        scored.iter().map(|s| *s as f64).sum::<f64>() / scored.len() as f64
    };

    let emergency_override_rate_percent = if total == 0 {
        0.0
    } else {
        overrides as f64 / total as f64 * 100.0
    };

    ApprovalMetrics {
        total_workflows: total,
        avg_approval_time_hours,
        approval_rate_percent,
        avg_risk_score,
        emergency_override_rate_percent,
    }
}

/// Rollup of the workflows created on `date`.
pub fn summarize_day(date: NaiveDate, workflows: &[Workflow]) -> DailySummary {
    let day: Vec<&Workflow> = workflows
        .iter()
        .filter(|w| w.created_at.to_datetime_utc().date_naive() == date)
        .collect();

    let count_status = |status: WorkflowStatus| day.iter().filter(|w| w.status == status).count() as u64;

    let durations: Vec<f64> = day.iter().filter_map(|w| completion_hours(w)).collect();
    let avg_completion_hours = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    DailySummary {
        date: date.format("%Y-%m-%d").to_string(),
        created: day.len() as u64,
        approved: count_status(WorkflowStatus::Approved),
        rejected: count_status(WorkflowStatus::Rejected),
        cancelled: count_status(WorkflowStatus::Cancelled),
        expired: count_status(WorkflowStatus::Expired),
        avg_completion_hours,
    }
}
