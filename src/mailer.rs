//! Outbound email: Mailjet delivery plus a log-only fallback for development.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use crate::config::MailjetSettings;
use crate::model::Backer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}

pub struct MailjetMailer {
    http: Client,
    settings: MailjetSettings,
}

impl MailjetMailer {
    pub fn new(settings: &MailjetSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("building mailjet http client")?;
        Ok(Self {
            http,
            settings: settings.clone(),
        })
    }
}

#[async_trait]
impl Mailer for MailjetMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        let payload = json!({
            "FromEmail": self.settings.sender_email,
            "FromName": self.settings.sender_name,
            "Recipients": [{"Email": email.to_email, "Name": email.to_name}],
            "Subject": email.subject,
            "Text-part": email.text,
        });
        let resp = self
            .http
            .post(&self.settings.api_url)
            .basic_auth(&self.settings.api_key, Some(&self.settings.secret_key))
            .json(&payload)
            .send()
            .await
            .context("sending mailjet request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("mailjet returned {status}: {body}");
        }
        info!(subject = %email.subject, "email sent");
        Ok(())
    }
}

/// Logs messages instead of delivering them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        info!(to = %email.to_email, subject = %email.subject, "email delivery disabled; logging only");
        Ok(())
    }
}

pub fn delinquency_notice(backer: &Backer, manage_url: &str) -> Email {
    let name = if backer.name.is_empty() { "there" } else { backer.name.as_str() };
    Email {
        to_email: backer.email.clone(),
        to_name: backer.name.clone(),
        subject: "Your GitFund sponsorship payment failed".to_string(),
        text: format!(
            "Hi {name},\n\n\
             We were unable to charge your card for your GitFund sponsorship. \
             Please update your card details at {manage_url} so your sponsorship stays active.\n\n\
             Thanks,\nThe GitFund Team\n"
        ),
    }
}
