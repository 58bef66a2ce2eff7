//! Authorization lookups against an external identity provider
use crate::rule::Role;
use std::collections::HashMap;

pub trait IdentityProvider: Send + Sync {
    fn has_role(&self, user_id: &str, role: Role) -> bool;
}

/// In-memory role directory for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct StaticRoles {
    grants: HashMap<String, Vec<Role>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: impl Into<String>, role: Role) -> Self {
        self.grants.entry(user_id.into()).or_default().push(role);
        self
    }
}

impl IdentityProvider for StaticRoles {
    fn has_role(&self, user_id: &str, role: Role) -> bool {
        self.grants
            .get(user_id)
            .is_some_and(|roles| roles.contains(&role))
    }
}
