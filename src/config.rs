//! Process-wide configuration, built once at startup from the environment.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::finance::{PlanCatalog, TierSpec};
use crate::model::Tier;
use crate::util::env::{env_opt, env_parse, env_parse_opt};

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub api_base: String,
    /// Shared secret embedded in the webhook URL.
    pub webhook_token: String,
    pub timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ViesSettings {
    pub endpoint: String,
    pub attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct MailjetSettings {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub sender_email: String,
    pub sender_name: String,
    pub timeout: Duration,
}

impl MailjetSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Reloads allowed after losing an optimistic race.
    pub stale_retries: u32,
    pub staleness_window: chrono::Duration,
    pub sweep_batch: usize,
    pub sweep_concurrency: usize,
    pub sweep_deadline: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub catalog: PlanCatalog,
    pub stripe: StripeSettings,
    pub vies: ViesSettings,
    pub mailjet: MailjetSettings,
    pub sync: SyncSettings,
    pub cache_ttl: Duration,
    /// Link included in delinquency notices.
    pub manage_url: String,
    pub db_max_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog: PlanCatalog::standard(),
            stripe: StripeSettings {
                secret_key: String::new(),
                api_base: "https://api.stripe.com".to_string(),
                webhook_token: String::new(),
                timeout: Duration::from_secs(30),
                max_attempts: 2,
            },
            vies: ViesSettings {
                endpoint: "https://ec.europa.eu/taxation_customs/vies/services/checkVatService".to_string(),
                attempts: 3,
                attempt_timeout: Duration::from_secs(10),
                backoff: Duration::from_millis(500),
            },
            mailjet: MailjetSettings {
                api_url: "https://api.mailjet.com/v3/send".to_string(),
                api_key: String::new(),
                secret_key: String::new(),
                sender_email: "team@gitfund.io".to_string(),
                sender_name: "GitFund".to_string(),
                timeout: Duration::from_secs(30),
            },
            sync: SyncSettings {
                stale_retries: 1,
                staleness_window: chrono::Duration::minutes(30),
                sweep_batch: 100,
                sweep_concurrency: 4,
                sweep_deadline: Duration::from_secs(540),
                sweep_interval: Duration::from_secs(600),
            },
            cache_ttl: Duration::from_secs(30),
            manage_url: "https://gitfund.io/manage".to_string(),
            db_max_connections: 10,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let mut tiers = BTreeMap::new();
        for tier in Tier::ALL {
            let defaults = d
                .catalog
                .spec(tier)
                .with_context(|| format!("no default spec for {tier}"))?;
            let key = tier.as_str().to_ascii_uppercase();
            let amount = env_parse(&format!("GITFUND_PRICE_{key}"), defaults.amount);
            let slots = match defaults.slots {
                Some(n) => Some(env_parse(&format!("GITFUND_SLOTS_{key}"), n)),
                None => None,
            };
            tiers.insert(tier, TierSpec { amount, slots });
        }
        let catalog = PlanCatalog::new(tiers).context("invalid plan catalog")?;

        let secs = |key: &str, default: Duration| {
            env_parse_opt::<u64>(key).map(Duration::from_secs).unwrap_or(default)
        };

        let settings = Self {
            catalog,
            stripe: StripeSettings {
                secret_key: env_opt("STRIPE_SECRET_KEY").unwrap_or_default(),
                api_base: env_opt("STRIPE_API_BASE").unwrap_or(d.stripe.api_base),
                webhook_token: env_opt("STRIPE_WEBHOOK_TOKEN").unwrap_or_default(),
                timeout: secs("STRIPE_TIMEOUT_SECS", d.stripe.timeout),
                max_attempts: env_parse("STRIPE_MAX_ATTEMPTS", d.stripe.max_attempts).max(1),
            },
            vies: ViesSettings {
                endpoint: env_opt("VIES_URL").unwrap_or(d.vies.endpoint),
                attempts: env_parse("VIES_ATTEMPTS", d.vies.attempts).max(1),
                attempt_timeout: secs("VIES_TIMEOUT_SECS", d.vies.attempt_timeout),
                backoff: env_parse_opt::<u64>("VIES_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(d.vies.backoff),
            },
            mailjet: MailjetSettings {
                api_url: env_opt("MAILJET_API_URL").unwrap_or(d.mailjet.api_url),
                api_key: env_opt("MAILJET_API_KEY").unwrap_or_default(),
                secret_key: env_opt("MAILJET_SECRET_KEY").unwrap_or_default(),
                sender_email: env_opt("MAILJET_SENDER_EMAIL").unwrap_or(d.mailjet.sender_email),
                sender_name: env_opt("MAILJET_SENDER_NAME").unwrap_or(d.mailjet.sender_name),
                timeout: d.mailjet.timeout,
            },
            sync: SyncSettings {
                stale_retries: env_parse("GITFUND_STALE_RETRIES", d.sync.stale_retries),
                staleness_window: chrono::Duration::minutes(env_parse(
                    "GITFUND_STALENESS_MINUTES",
                    d.sync.staleness_window.num_minutes(),
                )),
                sweep_batch: env_parse("GITFUND_SWEEP_BATCH", d.sync.sweep_batch).max(1),
                sweep_concurrency: env_parse("GITFUND_SWEEP_CONCURRENCY", d.sync.sweep_concurrency).max(1),
                sweep_deadline: secs("GITFUND_SWEEP_DEADLINE_SECS", d.sync.sweep_deadline),
                sweep_interval: secs("GITFUND_SWEEP_INTERVAL_SECS", d.sync.sweep_interval),
            },
            cache_ttl: secs("GITFUND_CACHE_TTL_SECS", d.cache_ttl),
            manage_url: env_opt("GITFUND_MANAGE_URL").unwrap_or(d.manage_url),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", d.db_max_connections),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Startup invariants; a violation aborts the process.
    pub fn validate(&self) -> Result<()> {
        self.catalog.validate().context("invalid plan catalog")?;
        if self.sync.staleness_window <= chrono::Duration::zero() {
            anyhow::bail!("staleness window must be positive");
        }
        if self.stripe.timeout.is_zero() || self.vies.attempt_timeout.is_zero() {
            anyhow::bail!("external call deadlines must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.sync.sweep_batch, 100);
        assert_eq!(settings.sync.staleness_window, chrono::Duration::minutes(30));
        assert_eq!(settings.cache_ttl, Duration::from_secs(30));
        assert!(!settings.mailjet.is_configured());
    }

    #[test]
    fn zero_deadlines_are_rejected() {
        let mut settings = Settings::default();
        settings.stripe.timeout = Duration::ZERO;
        assert!(settings.validate().is_err());
    }
}
