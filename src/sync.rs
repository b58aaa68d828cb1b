//! The single "sync a backer" entry point.
//!
//! Steps run in a fixed order and each one catches its own failure, so a
//! broken step never prevents the later ones from making progress. Every
//! step is idempotent and only clears its precondition flag after success.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::DisplayCache;
use crate::error::SyncError;
use crate::finance::subscription_tax_bps;
use crate::ledger::{LedgerOutcome, SlotLedger};
use crate::model::{Backer, Tier};
use crate::reconciler::{PollOutcome, SubscriptionReconciler};
use crate::retry::{retry_stale, Attempt};
use crate::store::{Datastore, Txn};
use crate::taxid::{TaxIdOutcome, TaxIdVerifier};

pub struct SyncOrchestrator<S> {
    store: Arc<S>,
    ledger: SlotLedger<S>,
    reconciler: SubscriptionReconciler<S>,
    verifier: TaxIdVerifier,
    cache: Arc<DisplayCache>,
    stale_retries: u32,
}

/// How a ledger pass ended for the backer.
enum TotalsSync {
    Clean,
    Demoted(Tier),
}

impl<S: Datastore> SyncOrchestrator<S> {
    pub fn new(
        store: Arc<S>,
        ledger: SlotLedger<S>,
        reconciler: SubscriptionReconciler<S>,
        verifier: TaxIdVerifier,
        cache: Arc<DisplayCache>,
        stale_retries: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            reconciler,
            verifier,
            cache,
            stale_retries,
        }
    }

    pub fn ledger(&self) -> &SlotLedger<S> {
        &self.ledger
    }

    /// Brings the backer's ledger, subscription and tax state up to date.
    /// Returns user-facing messages for everything that went wrong; empty
    /// means fully synced. `first_time` stops after the cancellations so a
    /// fresh backing gets its answer without waiting on the tax authority.
    pub async fn sync(&self, backer_id: i64, first_time: bool) -> Vec<String> {
        self.sync_report(backer_id, first_time)
            .await
            .iter()
            .map(SyncError::to_string)
            .collect()
    }

    /// Same as [`sync`](Self::sync), keeping the failures typed.
    #[instrument(skip(self))]
    pub async fn sync_report(&self, backer_id: i64, first_time: bool) -> Vec<SyncError> {
        let mut errors = Vec::new();
        let mut record = |step: &'static str, e: SyncError| {
            e.log(backer_id, step);
            errors.push(e);
        };

        let backer = match self.load(backer_id).await {
            Ok(b) => b,
            Err(e) => {
                record("load", e);
                return errors;
            }
        };

        if backer.totals_need_syncing {
            if let Err(e) = self.sync_totals(backer_id).await {
                record("totals", e);
            }
        }

        match self.load(backer_id).await {
            Ok(b) if b.subscription_needs_updating || !b.unconfirmed_creates.is_empty() => {
                if let Err(e) = self.reconciler.ensure_subscription(&b).await {
                    record("subscription", e);
                }
            }
            Ok(_) => {}
            Err(e) => record("load", e),
        }

        match self.load(backer_id).await {
            Ok(b) => {
                for sub_id in &b.stripe_needs_cancelling {
                    if let Err(e) = self.reconciler.cancel(backer_id, sub_id).await {
                        record("cancel", e);
                    }
                }
            }
            Err(e) => record("load", e),
        }

        if first_time {
            return errors;
        }

        match self.load(backer_id).await {
            Ok(b) if b.tax_id_to_validate => {
                if let Err(e) = self.sync_tax_id(&b).await {
                    record("tax_id", e);
                }
            }
            Ok(_) => {}
            Err(e) => record("load", e),
        }

        let polled = match self.load(backer_id).await {
            Ok(b) if b.has_live_subscription() => match self.reconciler.poll_status(&b).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    record("poll", e);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                record("load", e);
                None
            }
        };

        if polled == Some(PollOutcome::Reset) {
            if let Err(e) = self.sync_totals(backer_id).await {
                record("totals", e);
            }
        }

        if errors.is_empty() {
            debug!("backer fully synced");
        }
        errors
    }

    async fn load(&self, backer_id: i64) -> Result<Backer, SyncError> {
        self.store
            .get_backer(backer_id)
            .await?
            .ok_or(SyncError::BackerMissing(backer_id))
    }

    /// Runs the ledger for the backer's current totals version and folds the
    /// outcome back, reloading on lost races.
    async fn sync_totals(&self, backer_id: i64) -> Result<(), SyncError> {
        let outcome = retry_stale::<_, SyncError, _, _>("ledger sync", self.stale_retries, |_| async move {
            let backer = self.load(backer_id).await?;
            if !backer.totals_need_syncing {
                return Ok(Attempt::Done(TotalsSync::Clean));
            }
            let version = backer.totals_version;
            let desired = backer.plan;
            let result = self.ledger.reserve_or_release(backer_id, desired, version).await?;

            let holds_slot = desired.is_some_and(|t| self.ledger.is_limited(t));
            let written = match result {
                LedgerOutcome::Superseded => return Ok(Attempt::Stale),
                LedgerOutcome::Applied => {
                    self.store
                        .update_backer(backer_id, move |b| {
                            if b.totals_version != version {
                                return Txn::Abort(None);
                            }
                            b.totals_need_syncing = false;
                            b.occupies_slot = holds_slot;
                            Txn::Commit(Some(TotalsSync::Clean))
                        })
                        .await?
                }
                LedgerOutcome::Full => {
                    self.store
                        .update_backer(backer_id, move |b| {
                            if b.totals_version != version {
                                return Txn::Abort(None);
                            }
                            let tier = b.plan;
                            b.end_backing();
                            b.totals_need_syncing = false;
                            Txn::Commit(Some(tier.map_or(TotalsSync::Clean, TotalsSync::Demoted)))
                        })
                        .await?
                }
            };
            Ok(match written {
                Some(outcome) => Attempt::Done(outcome),
                None => Attempt::Stale,
            })
        })
        .await?;

        self.cache.invalidate_all().await;
        match outcome {
            TotalsSync::Clean => Ok(()),
            TotalsSync::Demoted(tier) => {
                info!(backer_id, %tier, "no slots left; backing cancelled");
                Err(SyncError::NoSlotsLeft(tier))
            }
        }
    }

    /// Validates the pending tax id and records the outcome, provided the
    /// backer has not changed it in the meantime.
    async fn sync_tax_id(&self, backer: &Backer) -> Result<(), SyncError> {
        let tax_id = backer.tax_id.clone();
        let (detail, invalid) = match self.verifier.validate(&tax_id).await {
            TaxIdOutcome::Valid(detail) => (Some(detail), false),
            TaxIdOutcome::Invalid => (None, true),
            TaxIdOutcome::Unavailable(reason) => return Err(SyncError::TaxAuthorityUnavailable(reason)),
        };

        let repriced = self
            .store
            .update_backer(backer.id, move |b| {
                if b.tax_id != tax_id || !b.tax_id_to_validate {
                    return Txn::Abort(false);
                }
                let before = subscription_tax_bps(&b.territory, b.has_validated_tax_id());
                b.tax_id_detailed = detail;
                b.tax_id_is_invalid = invalid;
                b.tax_id_to_validate = false;
                let after = subscription_tax_bps(&b.territory, b.has_validated_tax_id());
                let repriced = b.plan.is_some() && before != after;
                if repriced {
                    b.request_subscription_update();
                }
                Txn::Commit(repriced)
            })
            .await?;
        if invalid {
            warn!(backer_id = backer.id, "tax id failed validation");
        }
        if repriced {
            info!(backer_id = backer.id, "tax treatment changed; subscription will be replaced");
        }
        Ok(())
    }
}
