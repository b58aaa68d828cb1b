use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Customer, NewSubscription, PaymentProcessor, ProcessorError, Subscription, SubscriptionStatus};
use crate::config::StripeSettings;

/// Form-encoded Stripe REST client.
pub struct StripeClient {
    http: Client,
    api_base: String,
    secret_key: String,
    max_attempts: u32,
    backoff: Duration,
}

#[derive(Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Deserialize)]
struct StripePlanRef {
    id: String,
}

#[derive(Deserialize)]
struct StripeSubscription {
    id: String,
    #[serde(default)]
    customer: String,
    status: String,
    plan: Option<StripePlanRef>,
}

impl From<StripeSubscription> for Subscription {
    fn from(s: StripeSubscription) -> Self {
        Subscription {
            id: s.id,
            customer: s.customer,
            plan: s.plan.map(|p| p.id).unwrap_or_default(),
            status: SubscriptionStatus::parse(&s.status),
        }
    }
}

#[derive(Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Stripe's legacy `tax_percent` takes a decimal percentage.
fn tax_percent(bps: u32) -> String {
    format!("{}.{:02}", bps / 100, bps % 100)
}

impl StripeClient {
    pub fn new(settings: &StripeSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("building stripe http client")?;
        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            secret_key: settings.secret_key.clone(),
            max_attempts: settings.max_attempts.max(1),
            backoff: Duration::from_millis(250),
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, ProcessorError> {
        let url = format!("{}/v1/{}", self.api_base, path);
        // Reads, deletes and keyed writes can be replayed after a transport failure.
        let replayable = method == Method::GET || method == Method::DELETE || idempotency_key.is_some();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.secret_key);
            if let Some(key) = idempotency_key {
                req = req.header("Idempotency-Key", key);
            }
            if !form.is_empty() {
                req = req.form(form);
            }
            match req.send().await {
                Ok(resp) => return decode(resp).await,
                Err(e) => {
                    if !replayable || attempt >= self.max_attempts {
                        return Err(ProcessorError::Transport(e.to_string()));
                    }
                    warn!(path, attempt, error = %e, "stripe request failed; retrying");
                    tokio::time::sleep(self.backoff.saturating_mul(attempt)).await;
                }
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ProcessorError> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| ProcessorError::Transport(e.to_string()))?;
    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| ProcessorError::Api(format!("undecodable response: {e}")));
    }
    let detail = serde_json::from_str::<StripeErrorEnvelope>(&body).ok().map(|e| e.error);
    debug!(%status, "stripe returned an error");
    Err(match detail {
        Some(err) if err.kind == "card_error" => ProcessorError::Card {
            code: err.code,
            message: err.message,
        },
        Some(err) if status == reqwest::StatusCode::NOT_FOUND => ProcessorError::NotFound(err.message),
        Some(err) => ProcessorError::Api(format!("{status}: {}", err.message)),
        None => ProcessorError::Api(status.to_string()),
    })
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(
        &self,
        email: &str,
        name: &str,
        card_token: &str,
        idempotency_key: &str,
    ) -> Result<Customer, ProcessorError> {
        let form = [
            ("email", email.to_string()),
            ("description", name.to_string()),
            ("source", card_token.to_string()),
        ];
        let c: StripeCustomer = self.send(Method::POST, "customers", &form, Some(idempotency_key)).await?;
        Ok(Customer { id: c.id })
    }

    async fn save_customer_card(&self, id: &str, card_token: &str) -> Result<Customer, ProcessorError> {
        let form = [("source", card_token.to_string())];
        let c: StripeCustomer = self.send(Method::POST, &format!("customers/{id}"), &form, None).await?;
        Ok(Customer { id: c.id })
    }

    async fn create_subscription(&self, req: &NewSubscription) -> Result<Subscription, ProcessorError> {
        let form = [
            ("customer", req.customer.clone()),
            ("plan", req.plan.clone()),
            ("tax_percent", tax_percent(req.tax_bps)),
        ];
        let s: StripeSubscription = self
            .send(Method::POST, "subscriptions", &form, Some(&req.idempotency_key))
            .await?;
        Ok(s.into())
    }

    async fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProcessorError> {
        let s: StripeSubscription = self.send(Method::GET, &format!("subscriptions/{id}"), &[], None).await?;
        Ok(s.into())
    }

    async fn delete_subscription(&self, id: &str) -> Result<Subscription, ProcessorError> {
        let s: StripeSubscription = self
            .send(Method::DELETE, &format!("subscriptions/{id}"), &[], None)
            .await?;
        Ok(s.into())
    }
}
