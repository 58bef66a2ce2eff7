//! Risk assessments and the pluggable scorer interface
use crate::utils;
use crate::workflow::{TimeStamp, TransactionRequest};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Fixed bucketing: low <25, medium [25,50), high [50,75), critical >=75.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=24 => RiskLevel::Low,
            25..=49 => RiskLevel::Medium,
            50..=74 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

/// What a scorer returns for one transaction.
#[derive(Debug, Clone)]
pub struct RiskEvaluation {
    pub score: u8, // clamped to 0..=100 on ingest
    pub factors: Vec<String>,
    pub fraud_indicators: Vec<String>,
    pub method: String,
}

/// Immutable record of one scoring pass. A workflow may reference several
/// historical assessments if the transaction is re-scored.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct RiskAssessment {
    #[n(0)]
    pub id: String, // uuid7, bech32 "risk_"
    #[n(1)]
    pub transaction_id: String,
    #[n(2)]
    pub workflow_id: Option<String>,
    #[n(3)]
    pub risk_score: u8,
    #[n(4)]
    pub risk_factors: Vec<String>,
    #[n(5)]
    pub fraud_indicators: Vec<String>,
    #[n(6)]
    pub assessment_method: String,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

impl RiskAssessment {
    pub fn new(
        transaction_id: &str,
        workflow_id: Option<String>,
        evaluation: RiskEvaluation,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("risk_")?,
            transaction_id: transaction_id.to_string(),
            workflow_id,
            risk_score: evaluation.score.min(100),
            risk_factors: evaluation.factors,
            fraud_indicators: evaluation.fraud_indicators,
            assessment_method: evaluation.method,
            created_at: TimeStamp::new(),
        })
    }

    /// The level is derived, never stored, so score and level always agree.
    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_score(self.risk_score)
    }
}

/// External collaborator producing a score for a transaction. Calls are
/// wrapped in a timeout by the engine; failure leaves the workflow unscored
/// rather than blocking it.
pub trait RiskScorer: Send + Sync {
    fn assess(&self, request: &TransactionRequest) -> anyhow::Result<RiskEvaluation>;
}

/// Scorer that never returns a score, for embedding without a risk model.
pub struct UnscoredRisk;

impl RiskScorer for UnscoredRisk {
    fn assess(&self, _request: &TransactionRequest) -> anyhow::Result<RiskEvaluation> {
        Err(anyhow::Error::msg("no risk model configured"))
    }
}
