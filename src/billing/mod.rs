//! Payment processor contract consumed by the reconciler and the request boundary.

use async_trait::async_trait;
use serde::Serialize;

pub mod stripe;

pub use stripe::StripeClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Unpaid,
    /// Any status the reconciler does not act on (`trialing`, `incomplete`, ...).
    Other,
}

impl SubscriptionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub customer: String,
    pub plan: String,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub customer: String,
    pub plan: String,
    /// Tax percentage in basis points.
    pub tax_bps: u32,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Card problems are shown to the backer verbatim.
    #[error("{message}")]
    Card { code: Option<String>, message: String },
    #[error("no such {0}")]
    NotFound(String),
    #[error("payment processor rejected the request: {0}")]
    Api(String),
    #[error("payment processor unreachable: {0}")]
    Transport(String),
}

impl ProcessorError {
    /// The request may or may not have taken effect.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::Transport(_))
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_customer(
        &self,
        email: &str,
        name: &str,
        card_token: &str,
        idempotency_key: &str,
    ) -> Result<Customer, ProcessorError>;

    /// Replaces the customer's default payment source.
    async fn save_customer_card(&self, id: &str, card_token: &str) -> Result<Customer, ProcessorError>;

    async fn create_subscription(&self, req: &NewSubscription) -> Result<Subscription, ProcessorError>;

    async fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProcessorError>;

    async fn delete_subscription(&self, id: &str) -> Result<Subscription, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_statuses_are_tolerated() {
        assert_eq!(SubscriptionStatus::parse("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::parse("trialing"), SubscriptionStatus::Other);
    }
}
