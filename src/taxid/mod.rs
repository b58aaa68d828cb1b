//! VAT id validation against an external tax authority.
//!
//! The verifier only reports an outcome; persisting it on the backer is the
//! sync orchestrator's job.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ViesSettings;
use crate::finance::{normalize_tax_number, TAX_ID_PREFIXES};
use crate::model::TaxIdDetail;

pub mod vies;

pub use vies::ViesClient;

/// Fields the authority echoes back that say nothing about the registrant.
const BOOKKEEPING_FIELDS: [&str; 4] = ["countryCode", "vatNumber", "requestDate", "valid"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaxIdOutcome {
    Valid(TaxIdDetail),
    Invalid,
    Unavailable(String),
}

/// Answer from the authority for a well-formed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VatCheck {
    /// Every leaf field of the response, including bookkeeping ones.
    Valid(TaxIdDetail),
    NotValid,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("tax authority rejected the input")]
    InvalidInput,
    #[error("tax authority fault: {0}")]
    Fault(String),
    #[error("tax authority unreachable: {0}")]
    Transport(String),
}

#[async_trait]
pub trait TaxAuthority: Send + Sync {
    async fn check_vat(&self, country_code: &str, number: &str) -> Result<VatCheck, AuthorityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTaxId {
    pub prefix: String,
    pub number: String,
}

/// Strips separators, uppercases and applies the jurisdiction fixup. `None`
/// for ids that can never be valid.
pub fn normalize(raw: &str) -> Option<NormalizedTaxId> {
    let id: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if !(4..=14).contains(&id.len()) {
        return None;
    }
    let (prefix, number) = id.split_at(2);
    if !TAX_ID_PREFIXES.contains(&prefix) {
        return None;
    }
    Some(NormalizedTaxId {
        prefix: prefix.to_string(),
        number: normalize_tax_number(prefix, number),
    })
}

pub struct TaxIdVerifier {
    authority: Arc<dyn TaxAuthority>,
    attempts: u32,
    attempt_timeout: Duration,
    backoff: Duration,
}

impl TaxIdVerifier {
    pub fn new(authority: Arc<dyn TaxAuthority>, settings: &ViesSettings) -> Self {
        Self {
            authority,
            attempts: settings.attempts.max(1),
            attempt_timeout: settings.attempt_timeout,
            backoff: settings.backoff,
        }
    }

    pub async fn validate(&self, raw: &str) -> TaxIdOutcome {
        let Some(id) = normalize(raw) else {
            debug!("malformed tax id; skipping remote check");
            return TaxIdOutcome::Invalid;
        };

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            let call = self.authority.check_vat(&id.prefix, &id.number);
            let result = match tokio::time::timeout(self.attempt_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(AuthorityError::Transport(format!(
                    "no answer within {:?}",
                    self.attempt_timeout
                ))),
            };
            match result {
                Ok(VatCheck::Valid(mut detail)) => {
                    detail.retain(|k, _| !BOOKKEEPING_FIELDS.contains(&k.as_str()));
                    return TaxIdOutcome::Valid(detail);
                }
                Ok(VatCheck::NotValid) | Err(AuthorityError::InvalidInput) => return TaxIdOutcome::Invalid,
                Err(e) => {
                    warn!(prefix = %id.prefix, attempt, error = %e, "tax id check failed");
                    last_error = e.to_string();
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff.saturating_mul(attempt)).await;
            }
        }
        TaxIdOutcome::Unavailable(last_error)
    }
}
