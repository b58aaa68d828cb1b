//! Plan catalog, plan ids and territory tax regimes.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{Tier, TierCounts};

/// Stamped into every plan id; bump when prices change so old subscriptions keep their plan.
pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSpec {
    /// Monthly price in minor units, exclusive of tax.
    pub amount: u32,
    /// `None` for tiers without a slot limit.
    pub slots: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("tier {0} is missing from the plan catalog")]
    MissingTier(Tier),
    #[error("tier {0} has zero capacity")]
    ZeroCapacity(Tier),
    #[error("tier {0} has a zero price")]
    ZeroAmount(Tier),
    #[error("tier {0} cannot be slot-limited")]
    DonorLimited(Tier),
    #[error("plan portions do not tally to 100%: {0}%")]
    PortionsDoNotTally(f64),
    #[error("tier {0} is priced at {1}, above the processor's maximum charge of {MAX_CHARGE}")]
    AmountTooLarge(Tier, u32),
}

/// Largest single charge the processor accepts, in minor units.
pub const MAX_CHARGE: u32 = 99_999_999;

#[derive(Debug, Clone, PartialEq)]
pub struct PlanCatalog {
    tiers: BTreeMap<Tier, TierSpec>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl PlanCatalog {
    pub fn standard() -> Self {
        let spec = |amount, slots| TierSpec { amount, slots };
        Self {
            tiers: BTreeMap::from([
                (Tier::Bronze, spec(1200, Some(40))),
                (Tier::Silver, spec(2400, Some(20))),
                (Tier::Gold, spec(4800, Some(10))),
                (Tier::Platinum, spec(9600, Some(5))),
                (Tier::Donor, spec(500, None)),
            ]),
        }
    }

    /// Builds and validates a catalog.
    pub fn new(tiers: BTreeMap<Tier, TierSpec>) -> Result<Self, CatalogError> {
        let catalog = Self { tiers };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        for tier in Tier::ALL {
            let spec = self.tiers.get(&tier).ok_or(CatalogError::MissingTier(tier))?;
            if spec.amount == 0 {
                return Err(CatalogError::ZeroAmount(tier));
            }
            if spec.amount > MAX_CHARGE {
                return Err(CatalogError::AmountTooLarge(tier, spec.amount));
            }
            match (tier, spec.slots) {
                (Tier::Donor, Some(_)) => return Err(CatalogError::DonorLimited(tier)),
                (Tier::Donor, None) => {}
                (_, None) | (_, Some(0)) => return Err(CatalogError::ZeroCapacity(tier)),
                (_, Some(_)) => {}
            }
        }
        let tally: f64 = self
            .portions()
            .iter()
            .map(|(tier, portion)| portion * f64::from(self.capacity(*tier).unwrap_or(0)) * 100.0)
            .sum();
        if (tally - 100.0).abs() > 1e-6 {
            return Err(CatalogError::PortionsDoNotTally(tally));
        }
        Ok(())
    }

    pub fn spec(&self, tier: Tier) -> Option<TierSpec> {
        self.tiers.get(&tier).copied()
    }

    pub fn capacity(&self, tier: Tier) -> Option<u32> {
        self.tiers.get(&tier).and_then(|s| s.slots)
    }

    pub fn capacities(&self) -> BTreeMap<Tier, u32> {
        self.tiers
            .iter()
            .filter_map(|(t, s)| s.slots.map(|n| (*t, n)))
            .collect()
    }

    /// Price charged in `territory`; UK VAT territories see VAT-inclusive prices.
    pub fn amount(&self, tier: Tier, territory: &str) -> Option<u32> {
        let base = self.tiers.get(&tier)?.amount;
        match tax_spec(territory) {
            Some(spec) if spec.regime == TaxRegime::UkVat => {
                let gross = u64::from(base) * u64::from(10_000 + spec.rate_bps) / 10_000;
                u32::try_from(gross).ok()
            }
            _ => Some(base),
        }
    }

    fn fully_funded(&self) -> u64 {
        self.tiers
            .values()
            .filter_map(|s| s.slots.map(|n| u64::from(s.amount) * u64::from(n)))
            .sum()
    }

    /// Share of the fully-funded total contributed by one slot of each limited tier.
    pub fn portions(&self) -> BTreeMap<Tier, f64> {
        let total = self.fully_funded() as f64;
        self.tiers
            .iter()
            .filter(|(_, s)| s.slots.is_some())
            .map(|(t, s)| (*t, if total > 0.0 { f64::from(s.amount) / total } else { 0.0 }))
            .collect()
    }

    /// Funding progress in basis points (10000 = fully funded).
    pub fn funded_bps(&self, counts: &TierCounts) -> u32 {
        let total = self.fully_funded();
        if total == 0 {
            return 0;
        }
        let raised: u64 = counts
            .iter()
            .filter_map(|(tier, n)| {
                let spec = self.tiers.get(&tier)?;
                spec.slots?;
                Some(u64::from(spec.amount) * u64::from(n))
            })
            .sum();
        (raised * 10_000 / total) as u32
    }

    pub fn summarize(&self, counts: &TierCounts) -> TotalsSummary {
        let tiers = self
            .tiers
            .iter()
            .filter_map(|(tier, spec)| {
                let capacity = spec.slots?;
                let occupied = counts.get(*tier);
                Some(TierProgress {
                    tier: *tier,
                    occupied,
                    capacity,
                    remaining: capacity.saturating_sub(occupied),
                    amount: spec.amount,
                })
            })
            .collect();
        TotalsSummary {
            funded_percentage: f64::from(self.funded_bps(counts)) / 100.0,
            sponsors: counts.total(),
            tiers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierProgress {
    pub tier: Tier,
    pub occupied: u32,
    pub capacity: u32,
    pub remaining: u32,
    pub amount: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TotalsSummary {
    pub funded_percentage: f64,
    pub sponsors: u32,
    pub tiers: Vec<TierProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxRegime {
    UkVat,
    EuVat,
}

#[derive(Debug, Clone, Copy)]
pub struct TaxSpec {
    pub regime: TaxRegime,
    pub rate_bps: u32,
    pub id_prefix: &'static str,
}

/// Tax regime for a territory code, following the shared VAT domain aliases.
pub fn tax_spec(territory: &str) -> Option<TaxSpec> {
    let eu = |rate_bps, id_prefix| TaxSpec {
        regime: TaxRegime::EuVat,
        rate_bps,
        id_prefix,
    };
    let spec = match territory {
        "GB" | "IM" => TaxSpec {
            regime: TaxRegime::UkVat,
            rate_bps: 2000,
            id_prefix: "GB",
        },
        "AT" => eu(2000, "AT"),
        "AT-JU" | "AT-MI" => eu(1900, "AT"),
        "BE" => eu(2100, "BE"),
        "BG" => eu(2000, "BG"),
        "CY" => eu(1900, "CY"),
        "CZ" => eu(2100, "CZ"),
        "DE" => eu(1900, "DE"),
        "DK" => eu(2500, "DK"),
        "EE" => eu(2000, "EE"),
        "EL" => eu(2400, "EL"),
        "ES" => eu(2100, "ES"),
        "FI" => eu(2400, "FI"),
        "FR" | "MC" => eu(2000, "FR"),
        "GR" => eu(2400, "GR"),
        "GR-81" | "GR-82" | "GR-83" | "GR-84" | "GR-85" | "GR-NS" | "GR-ST" => eu(1700, "GR"),
        "HR" => eu(2500, "HR"),
        "HU" => eu(2700, "HU"),
        "IE" => eu(2300, "IE"),
        "IT" => eu(2200, "IT"),
        "LT" => eu(2100, "LT"),
        "LU" => eu(1700, "LU"),
        "LV" => eu(2100, "LV"),
        "MT" => eu(1800, "MT"),
        "NL" => eu(2100, "NL"),
        "PL" => eu(2300, "PL"),
        "PT" => eu(2300, "PT"),
        "PT-20" => eu(1800, "PT"),
        "PT-30" => eu(2200, "PT"),
        "RO" => eu(1900, "RO"),
        "SE" => eu(2500, "SE"),
        "SI" => eu(2200, "SI"),
        "SK" => eu(2000, "SK"),
        _ => return None,
    };
    Some(spec)
}

/// Tax id prefixes the verifier will send to the authority.
pub const TAX_ID_PREFIXES: [&str; 29] = [
    "AT", "BE", "BG", "CY", "CZ", "DE", "DK", "EE", "EL", "ES", "FI", "FR", "GB", "GR", "HR", "HU", "IE",
    "IT", "LT", "LU", "LV", "MT", "NL", "PL", "PT", "RO", "SE", "SI", "SK",
];

/// Jurisdiction-specific tax id fixup applied to the number after the prefix.
pub fn normalize_tax_number(prefix: &str, number: &str) -> String {
    match prefix {
        "AT" if !number.starts_with('U') => format!("U{number}"),
        "BE" if number.len() == 9 => format!("0{number}"),
        _ => number.to_string(),
    }
}

/// Plan id for a tier in a territory. UK VAT territories are billed a
/// VAT-inclusive price and so need their own plan.
pub fn stripe_plan(tier: Tier, territory: &str) -> String {
    let variant = match tax_spec(territory) {
        Some(spec) if spec.regime == TaxRegime::UkVat => "gb",
        _ => "std",
    };
    format!("gitfund.{tier}.{variant}.v{PLAN_VERSION}")
}

/// Tax percentage (basis points) applied on top of the subscription price.
/// EU VAT is reverse-charged for backers with a validated tax id.
pub fn subscription_tax_bps(territory: &str, tax_id_validated: bool) -> u32 {
    match tax_spec(territory) {
        Some(spec) if spec.regime == TaxRegime::EuVat && !tax_id_validated => spec.rate_bps,
        _ => 0,
    }
}

pub fn tax_notice(territory: &str) -> Option<String> {
    let spec = tax_spec(territory)?;
    Some(match spec.regime {
        TaxRegime::EuVat => "Please note that all amounts are exclusive of any applicable VAT.".to_string(),
        TaxRegime::UkVat => format!(
            "Please note that all amounts include {}% VAT.",
            spec.rate_bps / 100
        ),
    })
}
