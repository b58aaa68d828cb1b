//! Slot ledger: capacity-limited tier reservations.
//!
//! The totals row is the single serialization point. A tier change releases
//! the old slot and claims the new one inside the same transaction, so
//! observers never see both or neither.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::model::{Tier, TierCounts};
use crate::store::{Datastore, StoreError, Txn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Applied,
    /// The desired tier had no free slot; the backer now holds nothing.
    Full,
    /// A newer version already wrote the record.
    Superseded,
}

pub struct SlotLedger<S> {
    store: Arc<S>,
    capacities: BTreeMap<Tier, u32>,
}

impl<S: Datastore> SlotLedger<S> {
    pub fn new(store: Arc<S>, capacities: BTreeMap<Tier, u32>) -> Self {
        Self { store, capacities }
    }

    pub fn is_limited(&self, tier: Tier) -> bool {
        self.capacities.contains_key(&tier)
    }

    #[instrument(skip(self))]
    pub async fn reserve_or_release(
        &self,
        backer_id: i64,
        desired: Option<Tier>,
        version: i64,
    ) -> Result<LedgerOutcome, StoreError> {
        let capacities = self.capacities.clone();
        let outcome = self
            .store
            .update_ledger(backer_id, move |totals, record| {
                if record.version > version {
                    return Txn::Abort(LedgerOutcome::Superseded);
                }
                let wanted = desired.filter(|t| capacities.contains_key(t));
                if record.version == version {
                    let outcome = match wanted {
                        Some(tier) if record.plan != Some(tier) => LedgerOutcome::Full,
                        _ => LedgerOutcome::Applied,
                    };
                    return Txn::Abort(outcome);
                }

                if let Some(held) = record.plan.take() {
                    totals.decrement(held);
                }
                let mut outcome = LedgerOutcome::Applied;
                if let Some(tier) = wanted {
                    let cap = capacities.get(&tier).copied().unwrap_or(0);
                    if totals.get(tier) >= cap {
                        outcome = LedgerOutcome::Full;
                    } else {
                        totals.increment(tier);
                        record.plan = Some(tier);
                    }
                }
                record.version = version;
                Txn::Commit(outcome)
            })
            .await?;
        if outcome == LedgerOutcome::Full {
            info!(backer_id, tier = ?desired, "tier is full");
        }
        Ok(outcome)
    }

    pub async fn totals(&self) -> Result<TierCounts, StoreError> {
        self.store.ledger_totals().await
    }
}
