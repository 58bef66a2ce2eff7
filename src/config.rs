//! Engine tuning knobs
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pending workflows older than this are swept to expired.
    pub expiry_timeout: chrono::Duration,
    /// Failed notifications wait this long before a retry attempt.
    pub notification_cooldown: chrono::Duration,
    /// Retries beyond this count are never attempted.
    pub max_notification_retries: u8,
    /// Deadline for risk scoring and notification delivery calls.
    pub external_call_timeout: Duration,
    /// Pause between maintenance sweep rounds.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiry_timeout: chrono::Duration::days(7),
            notification_cooldown: chrono::Duration::hours(1),
            max_notification_retries: 5,
            external_call_timeout: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
