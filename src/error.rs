//! Errors raised while syncing a backer. `Display` is the message shown to the backer.

use tracing::error;

use crate::billing::ProcessorError;
use crate::model::Tier;
use crate::retry::StaleData;
use crate::store::StoreError;

pub const TRY_AGAIN_LATER: &str = "Sorry, there was an unexpected error. Please try again later.";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sorry, there are no {0} slots left.")]
    NoSlotsLeft(Tier),
    #[error("{0}")]
    Card(String),
    #[error("Sorry, there was an error with our payment processor. Please try again later.")]
    Processor(#[source] ProcessorError),
    #[error("Sorry, we could not reach the tax authority to validate your VAT ID. Please try again later.")]
    TaxAuthorityUnavailable(String),
    #[error("Sorry, we could not email {to}. Please try again later.")]
    Mail { to: String, reason: String },
    #[error("Please provide a card before choosing a sponsorship tier.")]
    MissingCustomer,
    #[error("Sorry, we couldn't find that sponsorship.")]
    BackerMissing(i64),
    #[error("{}", TRY_AGAIN_LATER)]
    Store(#[from] StoreError),
    #[error("Sorry, your sponsorship is being updated elsewhere. Please try again later.")]
    Stale(#[from] StaleData),
}

impl From<ProcessorError> for SyncError {
    fn from(e: ProcessorError) -> Self {
        match e {
            ProcessorError::Card { message, .. } => SyncError::Card(message),
            other => SyncError::Processor(other),
        }
    }
}

impl SyncError {
    /// True for failures the backer cannot fix by changing their request.
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            SyncError::NoSlotsLeft(_) | SyncError::Card(_) | SyncError::MissingCustomer
        )
    }

    /// Logs unexpected failures with their cause; expected outcomes stay quiet.
    pub fn log(&self, backer_id: i64, step: &'static str) {
        match self {
            SyncError::NoSlotsLeft(_) | SyncError::Card(_) | SyncError::MissingCustomer => {}
            SyncError::Processor(e) => error!(backer_id, step, error = %e, "payment processor failure"),
            SyncError::TaxAuthorityUnavailable(reason) => {
                error!(backer_id, step, reason = %reason, "tax authority unavailable")
            }
            SyncError::Mail { to, reason } => {
                error!(backer_id, step, to = %to, reason = %reason, "email delivery failed")
            }
            SyncError::BackerMissing(id) => error!(backer_id = *id, step, "backer vanished mid-sync"),
            SyncError::Store(e) => error!(backer_id, step, error = %e, "datastore failure"),
            SyncError::Stale(e) => error!(backer_id, step, error = %e, "stale retry budget exhausted"),
        }
    }
}
