//! Admin gate — decides whether a caller may mutate settings or totals.
//!
//! Authentication itself happens upstream; the core only sees a
//! [`CallerIdentity`] and asks the gate.

use crate::config::AutopumpConfig;
use crate::types::CallerIdentity;
use async_trait::async_trait;

/// Capability consulted before every gated write.
#[async_trait]
pub trait AdminGate: Send + Sync {
    async fn is_admin(&self, caller: &CallerIdentity) -> bool;
}

/// Gate backed by the configured admin emails and role claims.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredAdmins {
    emails: Vec<String>,
    roles: Vec<String>,
}

impl ConfiguredAdmins {
    pub fn new(emails: Vec<String>, roles: Vec<String>) -> Self {
        Self {
            emails: emails
                .into_iter()
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            roles: roles.into_iter().filter(|r| !r.is_empty()).collect(),
        }
    }

    pub fn from_config(config: &AutopumpConfig) -> Self {
        Self::new(config.admin_emails.clone(), config.admin_roles.clone())
    }
}

#[async_trait]
impl AdminGate for ConfiguredAdmins {
    async fn is_admin(&self, caller: &CallerIdentity) -> bool {
        let email_match = caller.email.as_deref().is_some_and(|email| {
            let email = email.trim().to_ascii_lowercase();
            self.emails.iter().any(|admin| *admin == email)
        });
        email_match || caller.roles.iter().any(|r| self.roles.contains(r))
    }
}
