//! Workflow rows, the status transition table and timestamps
use crate::rule::{ApprovalRule, Currency, TransactionType};
use crate::utils;
use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Cancelled,
    #[n(4)]
    Escalated,
    #[n(5)]
    Expired,
}

impl WorkflowStatus {
    /// States that stamp `completed_at` and freeze the row (annotations aside).
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Approved
                | WorkflowStatus::Rejected
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Expired
        )
    }

    /// States an approver may still act on.
    pub fn is_actionable(&self) -> bool {
        matches!(self, WorkflowStatus::Pending | WorkflowStatus::Escalated)
    }

    /// The full transition table. Everything not listed here is invalid.
    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, to) {
            (Pending, Approved | Rejected | Cancelled | Escalated | Expired) => true,
            (Escalated, Approved | Rejected | Cancelled | Pending) => true,
            // manual reopen only
            (Expired, Cancelled | Pending) => true,
            _ => false,
        }
    }
}

/// The transaction submitted for authorization. Built by the caller,
/// matched against the rule store and handed to the risk scorer.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub transaction_id: String,
    pub transaction_type: TransactionType,
    pub amount: u64, // minor units
    pub currency: Currency,
    pub requester_id: String,
    pub priority: u8,
    pub no_expiry: bool,
}

impl TransactionRequest {
    pub fn new(
        transaction_id: impl Into<String>,
        transaction_type: TransactionType,
        amount: u64,
        currency: Currency,
        requester_id: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            transaction_type,
            amount,
            currency,
            requester_id: requester_id.into(),
            priority: 0,
            no_expiry: false,
        }
    }
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
    pub fn with_no_expiry(mut self) -> Self {
        self.no_expiry = true;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    #[n(0)]
    pub id: String, // uuid7, bech32 "wf_"
    #[n(1)]
    pub transaction_id: String,
    #[n(2)]
    pub rule_id: Option<String>, // None once the rule is deleted; historical reference only
    #[n(3)]
    pub requester_id: String,
    #[n(4)]
    pub current_level: u8, // 1..=total_levels
    #[n(5)]
    pub total_levels: u8,
    #[n(6)]
    pub status: WorkflowStatus,
    #[n(7)]
    pub risk_score: Option<u8>, // None means unscored
    #[n(8)]
    pub emergency_override: bool,
    #[n(9)]
    pub override_reason: Option<String>,
    #[n(10)]
    pub override_by: Option<String>,
    #[n(11)]
    pub delegated_to: Option<String>, // current level only, cleared on advance
    #[n(12)]
    pub priority: u8,
    #[n(13)]
    pub no_expiry: bool,
    #[n(14)]
    pub annotations: Vec<String>, // audit metadata, appendable even when complete
    #[n(15)]
    pub action_count: u64, // next ledger sequence number
    #[n(16)]
    pub created_at: TimeStamp<Utc>,
    #[n(17)]
    pub completed_at: Option<TimeStamp<Utc>>,
}

impl Workflow {
    pub fn new(request: &TransactionRequest, rule: &ApprovalRule) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("wf_")?,
            transaction_id: request.transaction_id.clone(),
            rule_id: Some(rule.id.clone()),
            requester_id: request.requester_id.clone(),
            current_level: 1,
            total_levels: rule.approval_levels,
            status: WorkflowStatus::Pending,
            risk_score: None,
            emergency_override: false,
            override_reason: None,
            override_by: None,
            delegated_to: None,
            priority: request.priority,
            no_expiry: request.no_expiry,
            annotations: vec![],
            action_count: 0,
            created_at: TimeStamp::new(),
            completed_at: None,
        })
    }

    pub fn is_final_level(&self) -> bool {
        self.current_level == self.total_levels
    }
}

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
