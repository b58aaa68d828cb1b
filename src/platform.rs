//! Everything a request or a cron tick needs, built once at startup.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::billing::stripe::StripeClient;
use crate::billing::PaymentProcessor;
use crate::cache::DisplayCache;
use crate::config::Settings;
use crate::error::{SyncError, TRY_AGAIN_LATER};
use crate::finance::{tax_notice, tax_spec, TotalsSummary};
use crate::ledger::SlotLedger;
use crate::mailer::{LogMailer, MailjetMailer, Mailer};
use crate::model::{is_email, login_key, parse_plan, Backer, ProcessorEvent, SponsorCard, Tier};
use crate::reconciler::SubscriptionReconciler;
use crate::store::{Datastore, PgStore, StoreError, Txn};
use crate::sweep::{SweepReport, Sweeper};
use crate::sync::SyncOrchestrator;
use crate::taxid::vies::ViesClient;
use crate::taxid::{normalize, TaxAuthority, TaxIdOutcome, TaxIdVerifier};
use crate::util::db::Db;

pub const MAX_LINK_TEXT_CHARS: usize = 60;
pub const MAX_LINK_URL_BYTES: usize = 300;
pub const MAX_IMAGE_BYTES: usize = 500;
pub const MAX_NAME_CHARS: usize = 100;
const SPONSOR_LIMIT: usize = 500;

/// Request-boundary rejections. `Display` is what the caller sees.
#[derive(Debug, thiserror::Error)]
pub enum BackingError {
    #[error("Please provide a valid email address.")]
    InvalidEmail,
    #[error("Please provide a name of at most {MAX_NAME_CHARS} characters.")]
    InvalidName,
    #[error("Please choose a sponsorship tier.")]
    MissingTier,
    #[error("Sorry, {0:?} is not a sponsorship tier.")]
    UnknownTier(String),
    #[error("Please choose a valid country or territory.")]
    InvalidTerritory,
    #[error("Please check your VAT ID. It should start with {0}.")]
    InvalidTaxId(String),
    #[error("Please provide a card.")]
    MissingCard,
    #[error("{0}")]
    InvalidProfile(String),
    #[error("You are already a sponsor. Please manage your existing sponsorship instead.")]
    AlreadyBacking,
    #[error("You are not currently a sponsor.")]
    NotBacking,
    #[error("Sorry, we couldn't find that sponsorship.")]
    NotFound(i64),
    #[error("Invalid webhook token.")]
    Unauthorized,
    #[error("Malformed event payload.")]
    MalformedEvent(#[source] serde_json::Error),
    /// First failure reported by the sync that followed the change.
    #[error("{0}")]
    NotSynced(#[source] SyncError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("{}", TRY_AGAIN_LATER)]
    Store(#[from] StoreError),
}

impl BackingError {
    /// True for failures the caller cannot fix by changing the request.
    pub fn is_internal(&self) -> bool {
        match self {
            BackingError::Store(_) => true,
            BackingError::Sync(e) | BackingError::NotSynced(e) => e.is_internal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackingRequest {
    pub email: String,
    pub name: String,
    pub tier: String,
    pub territory: String,
    #[serde(default)]
    pub tax_id: String,
    pub card_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierChange {
    pub tier: String,
    pub territory: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub link_text: String,
    #[serde(default)]
    pub link_url: String,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackingReceipt {
    pub backer_id: i64,
    pub tier: Option<Tier>,
    pub territory: String,
    /// Minor units charged per month, tax included where prices are VAT-inclusive.
    pub amount: Option<u32>,
    pub tax_notice: Option<String>,
}

impl BackingReceipt {
    fn new(backer: &Backer, settings: &Settings) -> Self {
        Self {
            backer_id: backer.id,
            tier: backer.plan,
            territory: backer.territory.clone(),
            amount: backer.plan.and_then(|t| settings.catalog.amount(t, &backer.territory)),
            tax_notice: tax_notice(&backer.territory),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventReceipt {
    /// False when the event id was already journaled.
    pub recorded: bool,
    pub backer_id: Option<i64>,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    livemode: bool,
    #[serde(default)]
    data: serde_json::Value,
}

impl WebhookEnvelope {
    /// The customer the event concerns, whether the object is the customer
    /// itself or something hanging off it.
    fn customer(&self) -> Option<String> {
        let object = self.data.get("object")?;
        if let Some(customer) = object.get("customer").and_then(|c| c.as_str()) {
            return Some(customer.to_string());
        }
        match object.get("object").and_then(|o| o.as_str()) {
            Some("customer") => object.get("id").and_then(|id| id.as_str()).map(str::to_string),
            _ => None,
        }
    }
}

pub struct Platform<S> {
    pub settings: Arc<Settings>,
    pub store: Arc<S>,
    processor: Arc<dyn PaymentProcessor>,
    verifier: TaxIdVerifier,
    pub orchestrator: Arc<SyncOrchestrator<S>>,
    pub sweeper: Sweeper<S>,
    pub cache: Arc<DisplayCache>,
}

impl<S: Datastore> Platform<S> {
    pub fn new(
        settings: Settings,
        store: Arc<S>,
        processor: Arc<dyn PaymentProcessor>,
        authority: Arc<dyn TaxAuthority>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let cache = Arc::new(DisplayCache::new(settings.cache_ttl));
        let ledger = SlotLedger::new(store.clone(), settings.catalog.capacities());
        let reconciler = SubscriptionReconciler::new(
            store.clone(),
            processor.clone(),
            mailer,
            cache.clone(),
            settings.manage_url.clone(),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            ledger,
            reconciler,
            TaxIdVerifier::new(authority.clone(), &settings.vies),
            cache.clone(),
            settings.sync.stale_retries,
        ));
        let sweeper = Sweeper::new(store.clone(), orchestrator.clone(), &settings.sync);
        Self {
            verifier: TaxIdVerifier::new(authority, &settings.vies),
            settings: Arc::new(settings),
            store,
            processor,
            orchestrator,
            sweeper,
            cache,
        }
    }

    async fn backer(&self, id: i64) -> Result<Backer, BackingError> {
        self.store.get_backer(id).await?.ok_or(BackingError::NotFound(id))
    }

    /// Runs the follow-up sync and turns its first complaint into the answer.
    async fn settle(&self, backer_id: i64, first_time: bool) -> Result<Backer, BackingError> {
        self.cache.invalidate_all().await;
        let errors = self.orchestrator.sync_report(backer_id, first_time).await;
        if let Some(first) = errors.into_iter().next() {
            return Err(BackingError::NotSynced(first));
        }
        self.backer(backer_id).await
    }

    #[instrument(skip(self, req), fields(tier = %req.tier, territory = %req.territory))]
    pub async fn start_backing(&self, req: &BackingRequest) -> Result<BackingReceipt, BackingError> {
        let email = req.email.trim();
        if !is_email(email) {
            return Err(BackingError::InvalidEmail);
        }
        let name = valid_name(&req.name)?;
        let tier = valid_tier(&req.tier)?;
        let territory = valid_territory(&req.territory)?;
        let tax_id = valid_tax_id(&req.tax_id, &territory)?;
        let card_token = req.card_token.trim();
        if card_token.is_empty() {
            return Err(BackingError::MissingCard);
        }

        let (backer, created) = self.store.find_or_create_backer(&login_key(email), email, &name).await?;
        if backer.plan.is_some() {
            return Err(BackingError::AlreadyBacking);
        }
        if created {
            info!(backer_id = backer.id, "new backer");
        }

        let customer_id = if backer.stripe_customer_id.is_empty() {
            let key = format!("gitfund-cus-{}-{}", backer.id, card_token);
            self.processor
                .create_customer(email, &name, card_token, &key)
                .await
                .map_err(SyncError::from)?
                .id
        } else {
            self.processor
                .save_customer_card(&backer.stripe_customer_id, card_token)
                .await
                .map_err(SyncError::from)?
                .id
        };

        let accepted = self
            .store
            .update_backer(backer.id, move |b| {
                if b.plan.is_some() {
                    return Txn::Abort(false);
                }
                b.name = name;
                b.plan = Some(tier);
                b.territory = territory;
                b.tax_id_to_validate = !tax_id.is_empty();
                b.tax_id = tax_id;
                b.tax_id_detailed = None;
                b.tax_id_is_invalid = false;
                b.stripe_customer_id = customer_id;
                b.request_totals_sync();
                b.request_subscription_update();
                Txn::Commit(true)
            })
            .await?;
        if !accepted {
            return Err(BackingError::AlreadyBacking);
        }

        let backer = match self.settle(backer.id, true).await {
            Ok(backer) => backer,
            Err(e) => {
                self.withdraw(backer.id).await;
                return Err(e);
            }
        };
        info!(backer_id = backer.id, %tier, "backing started");
        Ok(BackingReceipt::new(&backer, &self.settings))
    }

    /// Undoes a sign-up whose first sync left it without a subscription, so
    /// the slot is released and the backer can sign up again.
    async fn withdraw(&self, backer_id: i64) {
        let withdrawn = self
            .store
            .update_backer(backer_id, |b| {
                if b.plan.is_none() || b.has_live_subscription() {
                    return Txn::Abort(false);
                }
                b.end_backing();
                b.request_totals_sync();
                Txn::Commit(true)
            })
            .await;
        match withdrawn {
            Ok(true) => {
                let errors = self.orchestrator.sync(backer_id, true).await;
                if errors.is_empty() {
                    info!(backer_id, "sign-up rolled back");
                } else {
                    warn!(backer_id, ?errors, "sign-up rolled back; the sweep will finish releasing it");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(backer_id, error = %e, "could not roll back sign-up"),
        }
    }

    #[instrument(skip(self, change))]
    pub async fn change_tier(&self, backer_id: i64, change: &TierChange) -> Result<BackingReceipt, BackingError> {
        let tier = valid_tier(&change.tier)?;
        let territory = valid_territory(&change.territory)?;

        let changed = self
            .store
            .update_backer(backer_id, move |b| {
                if b.plan.is_none() {
                    return Txn::Abort(Err(BackingError::NotBacking));
                }
                if b.plan == Some(tier) && b.territory == territory {
                    return Txn::Abort(Ok(false));
                }
                if b.territory != territory && !b.tax_id.is_empty() {
                    // Tax treatment is per territory; re-check under the new one.
                    b.tax_id_to_validate = true;
                }
                b.plan = Some(tier);
                b.territory = territory;
                b.request_totals_sync();
                b.request_subscription_update();
                Txn::Commit(Ok(true))
            })
            .await
            .map_err(not_found)??;

        let backer = match changed {
            true => self.settle(backer_id, true).await?,
            false => self.backer(backer_id).await?,
        };
        Ok(BackingReceipt::new(&backer, &self.settings))
    }

    #[instrument(skip(self))]
    pub async fn cancel_backing(&self, backer_id: i64) -> Result<(), BackingError> {
        let cancelled = self
            .store
            .update_backer(backer_id, |b| {
                if b.plan.is_none() && !b.occupies_slot {
                    return Txn::Abort(false);
                }
                b.end_backing();
                b.request_totals_sync();
                Txn::Commit(true)
            })
            .await
            .map_err(not_found)?;
        if !cancelled {
            return Err(BackingError::NotBacking);
        }
        self.settle(backer_id, true).await?;
        info!(backer_id, "backing cancelled");
        Ok(())
    }

    #[instrument(skip(self, update))]
    pub async fn update_profile(&self, backer_id: i64, update: &ProfileUpdate) -> Result<SponsorCard, BackingError> {
        let link_text = update.link_text.trim().to_string();
        let link_url = update.link_url.trim().to_string();
        let image = update.image.trim().to_string();
        if link_text.chars().count() > MAX_LINK_TEXT_CHARS {
            return Err(BackingError::InvalidProfile(format!(
                "Link text must be at most {MAX_LINK_TEXT_CHARS} characters."
            )));
        }
        if link_url.len() > MAX_LINK_URL_BYTES {
            return Err(BackingError::InvalidProfile(format!(
                "Link URL must be at most {MAX_LINK_URL_BYTES} bytes."
            )));
        }
        if !link_url.is_empty() && !is_web_url(&link_url) {
            return Err(BackingError::InvalidProfile(
                "Link URL must start with http:// or https://.".to_string(),
            ));
        }
        if image.len() > MAX_IMAGE_BYTES {
            return Err(BackingError::InvalidProfile(format!(
                "Image must be at most {MAX_IMAGE_BYTES} bytes."
            )));
        }

        let card = self
            .store
            .update_backer(backer_id, move |b| {
                b.link_text = link_text;
                b.link_url = link_url;
                b.image = image;
                Txn::Commit(b.sponsor_card())
            })
            .await
            .map_err(not_found)?;
        self.cache.invalidate_all().await;
        Ok(card)
    }

    /// Saves a new card on the backer's processor customer. A backer left
    /// without a subscription gets a fresh attempt with the new card.
    #[instrument(skip(self, card_token))]
    pub async fn update_card(&self, backer_id: i64, card_token: &str) -> Result<(), BackingError> {
        let card_token = card_token.trim();
        if card_token.is_empty() {
            return Err(BackingError::MissingCard);
        }
        let backer = self.backer(backer_id).await?;
        let fresh_customer = if backer.stripe_customer_id.is_empty() {
            let key = format!("gitfund-cus-{}-{}", backer.id, card_token);
            let customer = self
                .processor
                .create_customer(&backer.email, &backer.name, card_token, &key)
                .await
                .map_err(SyncError::from)?;
            Some(customer.id)
        } else {
            self.processor
                .save_customer_card(&backer.stripe_customer_id, card_token)
                .await
                .map_err(SyncError::from)?;
            None
        };
        info!(backer_id, "card updated");

        let needs_subscription = self
            .store
            .update_backer(backer_id, move |b| {
                let stored = match fresh_customer {
                    Some(_) if !b.stripe_customer_id.is_empty() => return Txn::Abort(false),
                    Some(id) => {
                        b.stripe_customer_id = id;
                        true
                    }
                    None => false,
                };
                if b.plan.is_none() || b.has_live_subscription() {
                    return if stored { Txn::Commit(false) } else { Txn::Abort(false) };
                }
                b.request_subscription_update();
                Txn::Commit(true)
            })
            .await
            .map_err(not_found)?;
        if needs_subscription {
            self.settle(backer_id, true).await?;
        }
        Ok(())
    }

    /// Runs a full sync now; the messages are whatever is still out of sync.
    pub async fn force_sync(&self, backer_id: i64) -> Result<Vec<String>, BackingError> {
        self.backer(backer_id).await?;
        Ok(self.orchestrator.sync(backer_id, false).await)
    }

    pub async fn totals(&self) -> Result<Arc<TotalsSummary>, StoreError> {
        self.cache
            .totals
            .get_or_refresh(|| async {
                let counts = self.orchestrator.ledger().totals().await?;
                Ok(self.settings.catalog.summarize(&counts))
            })
            .await
    }

    pub async fn sponsors(&self) -> Result<Arc<Vec<SponsorCard>>, StoreError> {
        self.cache
            .sponsors
            .get_or_refresh(|| async {
                let backers = self.store.sponsors(SPONSOR_LIMIT).await?;
                Ok(backers.iter().map(Backer::sponsor_card).collect())
            })
            .await
    }

    /// Journals a processor event and syncs the backer it concerns.
    #[instrument(skip(self, token, payload))]
    pub async fn handle_processor_event(&self, token: &str, payload: &[u8]) -> Result<EventReceipt, BackingError> {
        let expected = &self.settings.stripe.webhook_token;
        if expected.is_empty() || !tokens_match(token, expected) {
            warn!("webhook rejected: bad token");
            return Err(BackingError::Unauthorized);
        }
        let envelope: WebhookEnvelope = serde_json::from_slice(payload).map_err(BackingError::MalformedEvent)?;
        let customer = envelope.customer().unwrap_or_default();
        let event = ProcessorEvent {
            id: envelope.id,
            created: envelope.created,
            customer: customer.clone(),
            event_type: envelope.event_type,
            livemode: envelope.livemode,
            data: envelope.data,
        };
        let recorded = self.store.record_event(&event).await?;
        info!(event_id = %event.id, event_type = %event.event_type, recorded, "processor event");

        let mut receipt = EventReceipt {
            recorded,
            ..EventReceipt::default()
        };
        if customer.is_empty() {
            return Ok(receipt);
        }
        if let Some(backer) = self.store.backer_for_customer(&customer).await? {
            receipt.backer_id = Some(backer.id);
            receipt.errors = self.orchestrator.sync(backer.id, false).await;
        }
        Ok(receipt)
    }

    pub async fn run_sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweeper.run_once(Utc::now()).await
    }

    pub async fn check_tax_id(&self, raw: &str) -> TaxIdOutcome {
        self.verifier.validate(raw).await
    }
}

impl Platform<PgStore> {
    /// Wires the live processor, tax authority and mailer over Postgres.
    pub fn production(settings: Settings, db: Db) -> anyhow::Result<Self> {
        use anyhow::Context;

        settings.validate().context("invalid settings")?;
        let processor = Arc::new(StripeClient::new(&settings.stripe).context("building stripe client")?);
        let authority = Arc::new(ViesClient::new(&settings.vies).context("building VIES client")?);
        let mailer: Arc<dyn Mailer> = if settings.mailjet.is_configured() {
            Arc::new(MailjetMailer::new(&settings.mailjet).context("building mailjet client")?)
        } else {
            warn!("MAILJET_API_KEY not set; delinquency notices will only be logged");
            Arc::new(LogMailer)
        };
        Ok(Self::new(settings, Arc::new(PgStore::new(db)), processor, authority, mailer))
    }
}

fn not_found(e: StoreError) -> BackingError {
    match e {
        StoreError::BackerNotFound(id) => BackingError::NotFound(id),
        other => other.into(),
    }
}

fn valid_name(raw: &str) -> Result<String, BackingError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
        return Err(BackingError::InvalidName);
    }
    Ok(name.to_string())
}

fn valid_tier(raw: &str) -> Result<Tier, BackingError> {
    match parse_plan(raw) {
        Ok(Some(tier)) => Ok(tier),
        Ok(None) => Err(BackingError::MissingTier),
        Err(e) => Err(BackingError::UnknownTier(e.0)),
    }
}

/// ISO 3166 alpha-2, optionally with a subdivision suffix (`GR-83`).
fn valid_territory(raw: &str) -> Result<String, BackingError> {
    let territory = raw.trim().to_ascii_uppercase();
    let (country, subdivision) = match territory.split_once('-') {
        Some((c, s)) => (c, Some(s)),
        None => (territory.as_str(), None),
    };
    let country_ok = country.len() == 2 && country.bytes().all(|b| b.is_ascii_uppercase());
    let subdivision_ok =
        subdivision.map_or(true, |s| (1..=3).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_alphanumeric()));
    if country_ok && subdivision_ok {
        Ok(territory)
    } else {
        Err(BackingError::InvalidTerritory)
    }
}

/// Empty is fine. Anything else must be well formed and, where the territory
/// has a VAT regime, carry that regime's prefix.
fn valid_tax_id(raw: &str, territory: &str) -> Result<String, BackingError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(String::new());
    }
    let expected = tax_spec(territory).map(|spec| spec.id_prefix);
    match normalize(raw) {
        Some(id) if expected.map_or(true, |p| p == id.prefix) => Ok(format!("{}{}", id.prefix, id.number)),
        _ => Err(BackingError::InvalidTaxId(expected.unwrap_or("a country code").to_string())),
    }
}

fn is_web_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some(),
        Err(_) => false,
    }
}

/// Compares digests so the time taken does not depend on where the inputs differ.
fn tokens_match(given: &str, expected: &str) -> bool {
    let a = Sha256::digest(given.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
