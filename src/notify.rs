//! Notification queue with bounded retry
//!
//! The dispatcher owns the retry/backoff bookkeeping; delivery itself is an
//! external [`NotificationChannel`]. Failed notifications are requeued after
//! a cool-down until the retry cap, then stay failed and are surfaced to
//! operators through [`NotificationDispatcher::permanently_failed`].
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::utils;
use crate::workflow::TimeStamp;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    #[n(0)]
    WorkflowCreated,
    #[n(1)]
    ApprovalRequired,
    #[n(2)]
    LevelAdvanced,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
    #[n(5)]
    Escalated,
    #[n(6)]
    Expired,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    #[n(0)]
    Email,
    #[n(1)]
    Sms,
    #[n(2)]
    Push,
    #[n(3)]
    InApp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Sent,
    #[n(2)]
    Delivered,
    #[n(3)]
    Failed,
    #[n(4)]
    Cancelled,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct Notification {
    #[n(0)]
    pub id: String, // uuid7, bech32 "ntf_"
    #[n(1)]
    pub workflow_id: String,
    #[n(2)]
    pub recipient_id: String,
    #[n(3)]
    pub notification_type: NotificationType,
    #[n(4)]
    pub channel: Channel,
    #[n(5)]
    pub status: NotificationStatus,
    #[n(6)]
    pub retry_count: u8, // 0..=5
    #[n(7)]
    pub last_error: Option<String>,
    #[n(8)]
    pub failed_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// External delivery transport. Timeout-bound on the engine side; a failed
/// or timed-out send feeds the retry policy.
pub trait NotificationChannel: Send + Sync {
    fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    tree: sled::Tree,
    config: EngineConfig,
}

impl NotificationDispatcher {
    pub(crate) fn new(tree: sled::Tree, config: EngineConfig) -> Self {
        Self { tree, config }
    }

    pub fn enqueue(
        &self,
        workflow_id: &str,
        recipient_id: &str,
        notification_type: NotificationType,
        channel: Channel,
    ) -> anyhow::Result<Notification> {
        let notification = Notification {
            id: utils::new_uuid_to_bech32("ntf_")?,
            workflow_id: workflow_id.to_string(),
            recipient_id: recipient_id.to_string(),
            notification_type,
            channel,
            status: NotificationStatus::Pending,
            retry_count: 0,
            last_error: None,
            failed_at: None,
            created_at: TimeStamp::new(),
        };
        self.put(&notification)?;
        Ok(notification)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Notification> {
        let raw = self.tree.get(id.as_bytes())?.ok_or_else(|| EngineError::NotFound {
            kind: "notification",
            id: id.to_string(),
        })?;
        Ok(minicbor::decode(&raw)?)
    }

    pub fn for_workflow(&self, workflow_id: &str) -> anyhow::Result<Vec<Notification>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|n| n.workflow_id == workflow_id)
            .collect())
    }

    /// Attempt delivery of everything pending through `channel`, each send
    /// bounded by the configured timeout.
    pub fn deliver_pending(
        &self,
        channel: &Arc<dyn NotificationChannel>,
    ) -> anyhow::Result<DeliveryReport> {
        let mut report = DeliveryReport::default();

        for notification in self.with_status(NotificationStatus::Pending)? {
            let transport = Arc::clone(channel);
            let payload = notification.clone();
            let outcome = utils::call_with_timeout(self.config.external_call_timeout, move || {
                transport.send(&payload)
            });

            let mut updated = notification;
            match outcome {
                Some(Ok(())) => {
                    updated.status = NotificationStatus::Sent;
                    updated.last_error = None;
                    report.sent += 1;
                }
                Some(Err(err)) => {
                    updated.status = NotificationStatus::Failed;
                    updated.failed_at = Some(TimeStamp::new());
                    updated.last_error = Some(err.to_string());
                    report.failed += 1;
                    tracing::warn!(
                        notification_id = %updated.id,
                        retry_count = updated.retry_count,
                        "notification delivery failed"
                    );
                }
                None => {
                    updated.status = NotificationStatus::Failed;
                    updated.failed_at = Some(TimeStamp::new());
                    updated.last_error = Some("delivery timed out".into());
                    report.failed += 1;
                    tracing::warn!(notification_id = %updated.id, "notification delivery timed out");
                }
            }
            self.put(&updated)?;
        }

        Ok(report)
    }

    /// Delivery receipt from the transport.
    pub fn mark_delivered(&self, id: &str) -> anyhow::Result<Notification> {
        let mut notification = self.get(id)?;
        if notification.status != NotificationStatus::Sent {
            return Err(EngineError::Validation(format!(
                "only sent notifications can be marked delivered, {id} is {:?}",
                notification.status
            ))
            .into());
        }
        notification.status = NotificationStatus::Delivered;
        self.put(&notification)?;
        Ok(notification)
    }

    /// Requeue failures older than the cool-down, up to the retry cap.
    /// Beyond the cap rows stay failed permanently.
    pub fn retry_failed(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - self.config.notification_cooldown;
        let mut retried = 0;

        for notification in self.with_status(NotificationStatus::Failed)? {
            if notification.retry_count >= self.config.max_notification_retries {
                continue;
            }
            let cooled_down = notification
                .failed_at
                .as_ref()
                .is_none_or(|at| at.to_datetime_utc() <= cutoff);
            if !cooled_down {
                continue;
            }

            let mut updated = notification;
            updated.status = NotificationStatus::Pending;
            updated.retry_count += 1;
            self.put(&updated)?;
            retried += 1;
        }

        if retried > 0 {
            tracing::info!(retried, "requeued failed notifications");
        }
        Ok(retried)
    }

    /// Failures past the retry cap, for operator attention.
    pub fn permanently_failed(&self) -> anyhow::Result<Vec<Notification>> {
        Ok(self
            .with_status(NotificationStatus::Failed)?
            .into_iter()
            .filter(|n| n.retry_count >= self.config.max_notification_retries)
            .collect())
    }

    /// Cancel still-pending notifications of a finished workflow.
    pub fn cancel_for_workflow(&self, workflow_id: &str) -> anyhow::Result<usize> {
        let mut cancelled = 0;
        for notification in self.with_status(NotificationStatus::Pending)? {
            if notification.workflow_id != workflow_id {
                continue;
            }
            let mut updated = notification;
            updated.status = NotificationStatus::Cancelled;
            self.put(&updated)?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    pub fn with_status(&self, status: NotificationStatus) -> anyhow::Result<Vec<Notification>> {
        Ok(self.all()?.into_iter().filter(|n| n.status == status).collect())
    }

    fn all(&self) -> anyhow::Result<Vec<Notification>> {
        let mut notifications = vec![];
        for entry in self.tree.iter() {
            let (_, raw) = entry?;
            notifications.push(minicbor::decode(&raw)?);
        }
        Ok(notifications)
    }

    fn put(&self, notification: &Notification) -> anyhow::Result<()> {
        self.tree
            .insert(notification.id.as_bytes(), minicbor::to_vec(notification)?)?;
        Ok(())
    }
}
