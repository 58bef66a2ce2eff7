//! Approval rules, templates and the rule matching store
use crate::error::EngineError;
use crate::notify::Channel;
use crate::utils;
use crate::workflow::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    #[n(0)]
    Transfer,
    #[n(1)]
    Payment,
    #[n(2)]
    Withdrawal,
    #[n(3)]
    Investment,
    #[n(4)]
    Loan,
    #[n(5)]
    Expense,
    #[n(6)]
    Other,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    #[n(0)]
    USD,
    #[n(1)]
    GBP,
    #[n(2)]
    EUR,
    #[n(3)]
    JPY,
    #[n(4)]
    CHF,
    #[n(5)]
    AUD,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[n(0)]
    Manager,
    #[n(1)]
    FinanceDirector,
    #[n(2)]
    Compliance,
    #[n(3)]
    Treasury,
    #[n(4)]
    RiskOfficer,
    #[n(5)]
    Executive,
}

/// The roles authorized to act at one approval level. Holding any one of
/// them is sufficient.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
#[cbor(array)]
pub struct LevelRoles(#[n(0)] Vec<Role>);

impl LevelRoles {
    pub fn single(role: Role) -> Self {
        Self(vec![role])
    }
    pub fn any_of(roles: &[Role]) -> Self {
        Self(roles.to_vec())
    }
    pub fn roles(&self) -> &[Role] {
        &self.0
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Typed rule predicates, validated when the rule is created rather than
/// interpreted ad hoc at evaluation time.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    #[n(0)]
    pub max_daily_amount: Option<u64>,
    #[n(1)]
    pub allowed_departments: Option<Vec<String>>,
    #[n(2)]
    pub require_dual_control: Option<bool>,
    #[n(3)]
    pub business_hours_only: Option<bool>,
}

impl Conditions {
    fn validate(&self) -> Result<(), EngineError> {
        if self.max_daily_amount == Some(0) {
            return Err(EngineError::Validation(
                "max_daily_amount must be non-zero when set".into(),
            ));
        }
        if let Some(departments) = &self.allowed_departments {
            if departments.is_empty() {
                return Err(EngineError::Validation(
                    "allowed_departments must name at least one department when set".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct ApprovalRule {
    #[n(0)]
    pub id: String, // uuid7, bech32 "rule_"
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub transaction_type: TransactionType,
    #[n(3)]
    pub amount_threshold: Option<u64>, // None applies regardless of amount
    #[n(4)]
    pub currency: Currency,
    #[n(5)]
    pub approval_levels: u8, // 1..=5, equals required_roles.len()
    #[n(6)]
    pub required_roles: Vec<LevelRoles>, // one role-set per level, in order
    #[n(7)]
    pub conditions: Conditions,
    #[n(8)]
    pub is_active: bool,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

impl ApprovalRule {
    pub fn new(
        name: impl Into<String>,
        transaction_type: TransactionType,
        amount_threshold: Option<u64>,
        currency: Currency,
        required_roles: Vec<LevelRoles>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("rule_")?,
            name: name.into(),
            transaction_type,
            amount_threshold,
            currency,
            approval_levels: required_roles.len() as u8,
            required_roles,
            conditions: Conditions::default(),
            is_active: true,
            created_at: TimeStamp::new(),
        })
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Build an inactive rule from a reusable template. The template itself
    /// is never mutated; activation happens through the store so the
    /// uniqueness invariant is checked.
    pub fn from_template(name: impl Into<String>, template: &ApprovalTemplate) -> anyhow::Result<Self> {
        let mut rule = Self::new(
            name,
            template.transaction_type,
            template.amount_threshold,
            template.currency,
            template.levels.iter().map(|l| l.roles.clone()).collect(),
        )?;
        rule.is_active = false;
        Ok(rule)
    }

    /// Role-set for a 1-based level.
    pub fn roles_for_level(&self, level: u8) -> Option<&LevelRoles> {
        if level == 0 {
            return None;
        }
        self.required_roles.get(level as usize - 1)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("rule name must not be empty".into()));
        }
        if !(1..=5).contains(&self.approval_levels) {
            return Err(EngineError::Validation(format!(
                "approval_levels must be between 1 and 5, got {}",
                self.approval_levels
            )));
        }
        if self.required_roles.len() != self.approval_levels as usize {
            return Err(EngineError::Validation(format!(
                "required_roles has {} entries for {} levels",
                self.required_roles.len(),
                self.approval_levels
            )));
        }
        if self.required_roles.iter().any(LevelRoles::is_empty) {
            return Err(EngineError::Validation(
                "every approval level needs at least one role".into(),
            ));
        }
        self.conditions.validate()
    }
}

/// One level of a reusable approval template.
#[derive(Debug, Clone)]
pub struct TemplateLevel {
    pub roles: LevelRoles,
    pub amount_limit: Option<u64>,
}

/// Named configuration bundle used as read-only input to rule creation.
#[derive(Debug, Clone)]
pub struct ApprovalTemplate {
    pub name: String,
    pub transaction_type: TransactionType,
    pub currency: Currency,
    pub amount_threshold: Option<u64>,
    pub levels: Vec<TemplateLevel>,
    pub default_channel: Channel,
    pub escalate_after_hours: Option<u32>,
}

/// Among active rules of the right type and currency, a satisfied
/// thresholded rule always wins over the thresholdless fallback; the
/// tightest band (largest threshold not exceeding the amount) is preferred,
/// ties broken by most recent creation.
pub(crate) fn best_match<'a>(
    rules: &'a [ApprovalRule],
    transaction_type: TransactionType,
    amount: u64,
    currency: Currency,
) -> Option<&'a ApprovalRule> {
    let candidates: Vec<&ApprovalRule> = rules
        .iter()
        .filter(|r| r.is_active && r.transaction_type == transaction_type && r.currency == currency)
        .collect();

    let thresholded = candidates
        .iter()
        .filter_map(|r| r.amount_threshold.map(|t| (t, *r)))
        .filter(|(t, _)| *t <= amount)
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.created_at.cmp(&b.1.created_at)));
    if let Some((_, rule)) = thresholded {
        return Some(rule);
    }

    candidates
        .into_iter()
        .filter(|r| r.amount_threshold.is_none())
        .max_by(|a, b| a.created_at.cmp(&b.created_at))
}

/// CRUD and matching over the versioned rule set.
pub struct RuleStore {
    tree: sled::Tree,
}

impl RuleStore {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn create(&self, rule: ApprovalRule) -> anyhow::Result<ApprovalRule> {
        rule.validate()?;
        if rule.is_active {
            self.check_unique(&rule)?;
        }
        self.tree.insert(rule.id.as_bytes(), minicbor::to_vec(&rule)?)?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, "approval rule created");
        Ok(rule)
    }

    pub fn get(&self, rule_id: &str) -> anyhow::Result<ApprovalRule> {
        let raw = self.tree.get(rule_id.as_bytes())?.ok_or_else(|| EngineError::NotFound {
            kind: "rule",
            id: rule_id.to_string(),
        })?;
        Ok(minicbor::decode(&raw)?)
    }

    pub fn list(&self) -> anyhow::Result<Vec<ApprovalRule>> {
        let mut rules = vec![];
        for entry in self.tree.iter() {
            let (_, raw) = entry?;
            rules.push(minicbor::decode(&raw)?);
        }
        Ok(rules)
    }

    pub fn list_active(&self) -> anyhow::Result<Vec<ApprovalRule>> {
        Ok(self.list()?.into_iter().filter(|r: &ApprovalRule| r.is_active).collect())
    }

    /// Toggle `is_active`. Activation re-checks the uniqueness invariant.
    pub fn set_active(&self, rule_id: &str, active: bool) -> anyhow::Result<ApprovalRule> {
        let mut rule = self.get(rule_id)?;
        if active && !rule.is_active {
            rule.is_active = true;
            self.check_unique(&rule)?;
        }
        rule.is_active = active;
        self.tree.insert(rule.id.as_bytes(), minicbor::to_vec(&rule)?)?;
        tracing::info!(rule_id = %rule.id, active, "approval rule toggled");
        Ok(rule)
    }

    /// Which rule governs this transaction?
    pub fn match_rule(
        &self,
        transaction_type: TransactionType,
        amount: u64,
        currency: Currency,
    ) -> anyhow::Result<ApprovalRule> {
        let rules = self.list()?;
        best_match(&rules, transaction_type, amount, currency)
            .cloned()
            .ok_or_else(|| {
                EngineError::NoRuleMatched {
                    transaction_type,
                    currency,
                }
                .into()
            })
    }

    // at most one active rule per (type, threshold, currency), thresholdless included
    fn check_unique(&self, rule: &ApprovalRule) -> anyhow::Result<()> {
        let clash = self.list_active()?.into_iter().any(|existing| {
            existing.id != rule.id
                && existing.transaction_type == rule.transaction_type
                && existing.currency == rule.currency
                && existing.amount_threshold == rule.amount_threshold
        });
        if clash {
            return Err(EngineError::Validation(format!(
                "an active rule for {:?}/{:?} with threshold {:?} already exists",
                rule.transaction_type, rule.currency, rule.amount_threshold
            ))
            .into());
        }
        Ok(())
    }
}
