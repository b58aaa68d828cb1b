//! Persistent entities: backers, the slot ledger and the processor event journal.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sponsorship level. Every tier except `Donor` is capacity-limited by the plan catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Donor,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Bronze, Tier::Silver, Tier::Gold, Tier::Platinum, Tier::Donor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
            Tier::Donor => "donor",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sponsorship tier {0:?}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| UnknownTier(s.to_string()))
    }
}

/// Parses a plan parameter where the empty string means "no tier".
pub fn parse_plan(raw: &str) -> Result<Option<Tier>, UnknownTier> {
    if raw.trim().is_empty() {
        Ok(None)
    } else {
        raw.parse().map(Some)
    }
}

/// Flat registrant fields returned by the tax authority.
pub type TaxIdDetail = BTreeMap<String, String>;

/// A subscription create request, kept until its result is known so it can be
/// replayed under the same idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCreate {
    pub key: String,
    pub version: i64,
    pub plan: String,
    pub tax_bps: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backer {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub plan: Option<Tier>,
    pub territory: String,

    pub tax_id: String,
    pub tax_id_detailed: Option<TaxIdDetail>,
    pub tax_id_to_validate: bool,
    pub tax_id_is_invalid: bool,

    pub stripe_customer_id: String,
    pub stripe_subscription: String,
    /// Plan id and tax rate the live subscription was created with.
    pub stripe_plan: String,
    pub stripe_tax_bps: u32,
    pub stripe_needs_cancelling: Vec<String>,
    /// Creates sent to the processor whose outcome has not been seen yet.
    pub unconfirmed_creates: Vec<PendingCreate>,
    pub subscription_update_version: i64,
    pub subscription_needs_updating: bool,
    pub subscription_is_unpaid: bool,

    pub occupies_slot: bool,
    pub totals_need_syncing: bool,
    pub totals_version: i64,

    pub delinquent: bool,
    pub delinquent_emailed: bool,

    pub link_text: String,
    pub link_url: String,
    pub image: String,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Backer {
    pub fn new(id: i64, email: &str, name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            email: email.trim().to_string(),
            name: name.trim().to_string(),
            created: now,
            updated: now,
            ..Self::default()
        }
    }

    pub fn has_live_subscription(&self) -> bool {
        !self.stripe_subscription.is_empty()
    }

    pub fn has_validated_tax_id(&self) -> bool {
        self.tax_id_detailed.is_some() && !self.tax_id_is_invalid && !self.tax_id_to_validate
    }

    /// Stamps a fresh totals version so the next sync re-runs the ledger.
    pub fn request_totals_sync(&mut self) {
        self.totals_version += 1;
        self.totals_need_syncing = true;
    }

    pub fn request_subscription_update(&mut self) {
        self.subscription_update_version += 1;
        self.subscription_needs_updating = true;
    }

    /// Unconfirmed creates made for an update version that is no longer wanted.
    pub fn abandoned_creates(&self) -> Vec<PendingCreate> {
        self.unconfirmed_creates
            .iter()
            .filter(|p| p.version != self.subscription_update_version || !self.subscription_needs_updating)
            .cloned()
            .collect()
    }

    pub fn queue_cancellation(&mut self, subscription_id: &str) {
        if subscription_id.is_empty() || self.stripe_needs_cancelling.iter().any(|s| s == subscription_id) {
            return;
        }
        self.stripe_needs_cancelling.push(subscription_id.to_string());
    }

    /// Moves the live subscription (if any) onto the cancellation queue.
    pub fn detach_subscription(&mut self) {
        let current = std::mem::take(&mut self.stripe_subscription);
        self.queue_cancellation(&current);
        self.stripe_plan.clear();
        self.stripe_tax_bps = 0;
        self.subscription_is_unpaid = false;
    }

    /// Drops the backer to tier-less. In-flight subscription work at the old
    /// version becomes orphaned and is cancelled when it lands.
    pub fn end_backing(&mut self) {
        self.plan = None;
        self.occupies_slot = false;
        self.detach_subscription();
        self.subscription_update_version += 1;
        self.subscription_needs_updating = false;
        self.delinquent = false;
        self.delinquent_emailed = false;
    }

    pub fn sponsor_card(&self) -> SponsorCard {
        SponsorCard {
            id: self.id,
            tier: self.plan,
            name: self.name.clone(),
            link_text: self.link_text.clone(),
            link_url: self.link_url.clone(),
            image: self.image.clone(),
        }
    }
}

/// Public face of a slot-holding backer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SponsorCard {
    pub id: i64,
    pub tier: Option<Tier>,
    pub name: String,
    pub link_text: String,
    pub link_url: String,
    pub image: String,
}

/// Occupied slots per tier. Serialized as `{"gold": 3, ...}`; unknown tiers
/// fail to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierCounts(BTreeMap<Tier, u32>);

impl TierCounts {
    pub fn get(&self, tier: Tier) -> u32 {
        self.0.get(&tier).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, tier: Tier) {
        *self.0.entry(tier).or_insert(0) += 1;
    }

    pub fn decrement(&mut self, tier: Tier) {
        if let Some(n) = self.0.get_mut(&tier) {
            *n = n.saturating_sub(1);
        }
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tier, u32)> + '_ {
        self.0.iter().map(|(t, n)| (*t, *n))
    }
}

impl FromIterator<(Tier, u32)> for TierCounts {
    fn from_iter<I: IntoIterator<Item = (Tier, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The tier currently counted for one backer and the totals version that wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub backer_id: i64,
    pub plan: Option<Tier>,
    pub version: i64,
}

impl LedgerRecord {
    pub fn empty(backer_id: i64) -> Self {
        Self {
            backer_id,
            ..Self::default()
        }
    }
}

/// Journal entry for a payment processor webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    pub created: i64,
    pub customer: String,
    pub event_type: String,
    pub livemode: bool,
    pub data: serde_json::Value,
}

/// Login index key: `e.` followed by the unpadded base64url SHA-256 of the
/// lowercased email.
pub fn login_key(email: &str) -> String {
    let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
    format!("e.{}", URL_SAFE_NO_PAD.encode(digest))
}

pub const MAX_EMAIL_BYTES: usize = 254;

pub fn is_email(raw: &str) -> bool {
    let email = raw.trim();
    if email.len() > MAX_EMAIL_BYTES {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_parse_case_insensitively() {
        assert_eq!("Gold".parse::<Tier>(), Ok(Tier::Gold));
        assert_eq!(parse_plan(""), Ok(None));
        assert_eq!(parse_plan("donor"), Ok(Some(Tier::Donor)));
        assert!(parse_plan("diamond").is_err());
    }

    #[test]
    fn unknown_tiers_fail_to_decode_from_storage() {
        let ok: TierCounts = serde_json::from_str(r#"{"gold": 3, "bronze": 1}"#).unwrap();
        assert_eq!(ok.get(Tier::Gold), 3);
        assert_eq!(ok.total(), 4);
        assert!(serde_json::from_str::<TierCounts>(r#"{"diamond": 1}"#).is_err());
    }

    #[test]
    fn counts_never_go_negative() {
        let mut counts = TierCounts::default();
        counts.decrement(Tier::Silver);
        counts.increment(Tier::Silver);
        counts.decrement(Tier::Silver);
        counts.decrement(Tier::Silver);
        assert_eq!(counts.get(Tier::Silver), 0);
    }

    #[test]
    fn cancellation_queue_is_deduplicated() {
        let mut b = Backer::new(1, "a@b.c", "A", Utc::now());
        b.stripe_subscription = "sub_1".into();
        b.queue_cancellation("sub_1");
        b.detach_subscription();
        b.queue_cancellation("");
        assert_eq!(b.stripe_needs_cancelling, vec!["sub_1".to_string()]);
        assert!(!b.has_live_subscription());
    }

    #[test]
    fn ending_a_backing_orphans_in_flight_subscription_work() {
        let mut b = Backer::new(1, "a@b.c", "A", Utc::now());
        b.plan = Some(Tier::Gold);
        b.stripe_subscription = "sub_9".into();
        b.request_subscription_update();
        b.end_backing();
        assert_eq!(b.plan, None);
        assert_eq!(b.subscription_update_version, 2);
        assert!(!b.subscription_needs_updating);
        assert_eq!(b.stripe_needs_cancelling, vec!["sub_9".to_string()]);
    }

    #[test]
    fn creates_for_older_versions_are_abandoned() {
        let mut b = Backer::new(1, "a@b.c", "A", Utc::now());
        b.request_subscription_update();
        let pending = |version| PendingCreate {
            key: format!("k{version}"),
            version,
            plan: "p".into(),
            tax_bps: 0,
        };
        b.unconfirmed_creates = vec![pending(1)];
        assert!(b.abandoned_creates().is_empty());

        b.request_subscription_update();
        b.unconfirmed_creates.push(pending(2));
        assert_eq!(b.abandoned_creates(), vec![pending(1)]);

        b.end_backing();
        assert_eq!(b.abandoned_creates().len(), 2);
    }

    #[test]
    fn login_keys_ignore_email_case() {
        let key = login_key("Ada@Example.com");
        assert_eq!(key, login_key(" ada@example.COM "));
        assert!(key.starts_with("e."));
        assert_ne!(key, login_key("bob@example.com"));
    }

    #[test]
    fn email_validation() {
        assert!(is_email("ada@example.com"));
        assert!(!is_email("ada.example.com"));
        assert!(!is_email("@example.com"));
        let long = format!("{}@example.com", "a".repeat(250));
        assert!(!is_email(&long));
    }

    #[test]
    fn backer_documents_tolerate_missing_fields() {
        let b: Backer = serde_json::from_str(r#"{"id": 7, "email": "x@y.z", "plan": "silver"}"#).unwrap();
        assert_eq!(b.plan, Some(Tier::Silver));
        assert!(b.stripe_needs_cancelling.is_empty());
    }
}
