//! Drives a backer's processor subscription towards the desired tier and territory.
//!
//! Every write-back re-checks `subscription_update_version`; a result computed
//! for an older version never overwrites newer state.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::billing::{NewSubscription, PaymentProcessor, ProcessorError, SubscriptionStatus};
use crate::cache::DisplayCache;
use crate::error::SyncError;
use crate::finance::{stripe_plan, subscription_tax_bps};
use crate::mailer::{delinquency_notice, Mailer};
use crate::model::{Backer, PendingCreate};
use crate::store::{Datastore, Txn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Nothing was pending.
    Unchanged,
    /// The live subscription already matched; the pending flag was cleared.
    AlreadyCurrent,
    Attached(String),
    /// Created for a version that was superseded meanwhile; queued for cancellation.
    Orphaned(String),
    /// No tier is desired; any live subscription was queued for cancellation.
    Detached,
    /// Newer work landed while this pass was running.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Recovered,
    Delinquent,
    Unpaid,
    /// The processor cancelled the subscription; the backer is tier-less again.
    Reset,
}

/// Idempotency key for the create call at a given update version.
pub fn idempotency_key(backer_id: i64, version: i64) -> String {
    format!("gitfund-sub-{backer_id}-v{version}")
}

/// Plan id and tax rate the backer should be subscribed with, if any.
pub fn desired_subscription(backer: &Backer) -> Option<(String, u32)> {
    let tier = backer.plan?;
    Some((
        stripe_plan(tier, &backer.territory),
        subscription_tax_bps(&backer.territory, backer.has_validated_tax_id()),
    ))
}

pub struct SubscriptionReconciler<S> {
    store: Arc<S>,
    processor: Arc<dyn PaymentProcessor>,
    mailer: Arc<dyn Mailer>,
    cache: Arc<DisplayCache>,
    manage_url: String,
}

impl<S: Datastore> SubscriptionReconciler<S> {
    pub fn new(
        store: Arc<S>,
        processor: Arc<dyn PaymentProcessor>,
        mailer: Arc<dyn Mailer>,
        cache: Arc<DisplayCache>,
        manage_url: String,
    ) -> Self {
        Self {
            store,
            processor,
            mailer,
            cache,
            manage_url,
        }
    }

    #[instrument(skip(self, backer), fields(backer_id = backer.id))]
    pub async fn ensure_subscription(&self, backer: &Backer) -> Result<EnsureOutcome, SyncError> {
        self.replay_abandoned(backer).await?;
        if !backer.subscription_needs_updating {
            return Ok(EnsureOutcome::Unchanged);
        }
        let version = backer.subscription_update_version;

        let Some((plan, tax_bps)) = desired_subscription(backer) else {
            return Ok(self
                .store
                .update_backer(backer.id, move |b| {
                    if b.subscription_update_version != version {
                        return Txn::Abort(EnsureOutcome::Superseded);
                    }
                    b.detach_subscription();
                    b.subscription_needs_updating = false;
                    Txn::Commit(EnsureOutcome::Detached)
                })
                .await?);
        };

        if backer.has_live_subscription() && backer.stripe_plan == plan && backer.stripe_tax_bps == tax_bps {
            return Ok(self
                .store
                .update_backer(backer.id, move |b| {
                    if b.subscription_update_version != version {
                        return Txn::Abort(EnsureOutcome::Superseded);
                    }
                    b.subscription_needs_updating = false;
                    Txn::Commit(EnsureOutcome::AlreadyCurrent)
                })
                .await?);
        }

        if backer.stripe_customer_id.is_empty() {
            return Err(SyncError::MissingCustomer);
        }
        let key = idempotency_key(backer.id, version);
        let pending = PendingCreate {
            key: key.clone(),
            version,
            plan: plan.clone(),
            tax_bps,
        };
        self.store
            .update_backer(backer.id, move |b| {
                if b.unconfirmed_creates.iter().any(|p| p.key == pending.key) {
                    return Txn::Abort(());
                }
                b.unconfirmed_creates.push(pending);
                Txn::Commit(())
            })
            .await?;

        let request = NewSubscription {
            customer: backer.stripe_customer_id.clone(),
            plan: plan.clone(),
            tax_bps,
            idempotency_key: key.clone(),
        };
        let created = match self.processor.create_subscription(&request).await {
            Ok(sub) => sub,
            // Outcome unknown; the next pass retries under the same key.
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                self.retire_key(backer.id, version, key).await?;
                return Err(e.into());
            }
        };
        info!(subscription = %created.id, plan = %plan, version, "subscription created");

        let new_id = created.id;
        let outcome = self
            .store
            .update_backer(backer.id, move |b| {
                b.unconfirmed_creates.retain(|p| p.key != key);
                if b.subscription_update_version != version {
                    if b.stripe_subscription == new_id {
                        return Txn::Commit(EnsureOutcome::Superseded);
                    }
                    b.queue_cancellation(&new_id);
                    return Txn::Commit(EnsureOutcome::Orphaned(new_id));
                }
                if b.stripe_subscription != new_id {
                    b.detach_subscription();
                }
                b.stripe_subscription = new_id.clone();
                b.stripe_plan = plan;
                b.stripe_tax_bps = tax_bps;
                b.subscription_needs_updating = false;
                b.subscription_is_unpaid = false;
                Txn::Commit(EnsureOutcome::Attached(new_id))
            })
            .await?;
        if let EnsureOutcome::Orphaned(id) = &outcome {
            warn!(subscription = %id, version, "subscription orphaned by a newer update; queued for cancellation");
        }
        Ok(outcome)
    }

    /// The processor answered definitively and replays that answer for `key`,
    /// so a still-wanted update moves to a fresh version and key.
    async fn retire_key(&self, backer_id: i64, version: i64, key: String) -> Result<(), SyncError> {
        self.store
            .update_backer(backer_id, move |b| {
                b.unconfirmed_creates.retain(|p| p.key != key);
                if b.subscription_update_version == version && b.subscription_needs_updating {
                    b.request_subscription_update();
                }
                Txn::Commit(())
            })
            .await?;
        Ok(())
    }

    /// Replays creates whose update was superseded before their outcome was
    /// seen. Anything they produced is queued for cancellation.
    async fn replay_abandoned(&self, backer: &Backer) -> Result<(), SyncError> {
        for pending in backer.abandoned_creates() {
            let request = NewSubscription {
                customer: backer.stripe_customer_id.clone(),
                plan: pending.plan.clone(),
                tax_bps: pending.tax_bps,
                idempotency_key: pending.key.clone(),
            };
            let produced = match self.processor.create_subscription(&request).await {
                Ok(sub) => Some(sub.id),
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    debug!(key = %pending.key, error = %e, "abandoned create never produced a subscription");
                    None
                }
            };
            let key = pending.key;
            let orphan = produced.clone();
            self.store
                .update_backer(backer.id, move |b| {
                    b.unconfirmed_creates.retain(|p| p.key != key);
                    if let Some(id) = orphan.filter(|id| *id != b.stripe_subscription) {
                        b.queue_cancellation(&id);
                    }
                    Txn::Commit(())
                })
                .await?;
            if let Some(id) = produced {
                warn!(subscription = %id, version = pending.version, "unconfirmed subscription found; queued for cancellation");
            }
        }
        Ok(())
    }

    /// Cancels one queued subscription and drops it from the queue. Failures keep it queued.
    #[instrument(skip(self))]
    pub async fn cancel(&self, backer_id: i64, subscription_id: &str) -> Result<(), SyncError> {
        let live = match self.processor.retrieve_subscription(subscription_id).await {
            Ok(sub) => sub.status != SubscriptionStatus::Canceled,
            Err(ProcessorError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if live {
            match self.processor.delete_subscription(subscription_id).await {
                Ok(_) | Err(ProcessorError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!(subscription = %subscription_id, "subscription cancelled");
        } else {
            debug!(subscription = %subscription_id, "subscription already cancelled");
        }

        let id = subscription_id.to_string();
        self.store
            .update_backer(backer_id, move |b| {
                let before = b.stripe_needs_cancelling.len();
                b.stripe_needs_cancelling.retain(|s| *s != id);
                if b.stripe_needs_cancelling.len() == before {
                    Txn::Abort(())
                } else {
                    Txn::Commit(())
                }
            })
            .await?;
        Ok(())
    }

    /// Folds the processor's view of the live subscription into the backer.
    #[instrument(skip(self, backer), fields(backer_id = backer.id))]
    pub async fn poll_status(&self, backer: &Backer) -> Result<PollOutcome, SyncError> {
        if !backer.has_live_subscription() {
            return Ok(PollOutcome::Unchanged);
        }
        let sub_id = backer.stripe_subscription.clone();
        let status = match self.processor.retrieve_subscription(&sub_id).await {
            Ok(sub) => sub.status,
            Err(ProcessorError::NotFound(_)) => SubscriptionStatus::Canceled,
            Err(e) => return Err(e.into()),
        };

        match status {
            SubscriptionStatus::Active => Ok(self
                .guarded(backer.id, &sub_id, |b| {
                    if !(b.delinquent || b.delinquent_emailed || b.subscription_is_unpaid) {
                        return None;
                    }
                    b.delinquent = false;
                    b.delinquent_emailed = false;
                    b.subscription_is_unpaid = false;
                    Some(PollOutcome::Recovered)
                })
                .await?),
            SubscriptionStatus::PastDue => self.mark_delinquent(backer, &sub_id).await,
            SubscriptionStatus::Unpaid => Ok(self
                .guarded(backer.id, &sub_id, |b| {
                    if b.subscription_is_unpaid {
                        return None;
                    }
                    b.subscription_is_unpaid = true;
                    Some(PollOutcome::Unpaid)
                })
                .await?),
            SubscriptionStatus::Canceled => {
                let outcome = self
                    .guarded(backer.id, &sub_id, |b| {
                        b.stripe_subscription.clear();
                        b.end_backing();
                        b.request_totals_sync();
                        Some(PollOutcome::Reset)
                    })
                    .await?;
                if outcome == PollOutcome::Reset {
                    info!(subscription = %sub_id, "subscription cancelled remotely; backing reset");
                    self.cache.invalidate_all().await;
                }
                Ok(outcome)
            }
            SubscriptionStatus::Other => Ok(PollOutcome::Unchanged),
        }
    }

    async fn mark_delinquent(&self, backer: &Backer, sub_id: &str) -> Result<PollOutcome, SyncError> {
        let needs_email = self
            .store
            .update_backer(backer.id, {
                let sub_id = sub_id.to_string();
                move |b| {
                    if b.stripe_subscription != sub_id {
                        return Txn::Abort(false);
                    }
                    let needs_email = !b.delinquent_emailed;
                    if b.delinquent {
                        return Txn::Abort(needs_email);
                    }
                    b.delinquent = true;
                    Txn::Commit(needs_email)
                }
            })
            .await?;
        if !needs_email {
            return Ok(PollOutcome::Delinquent);
        }

        let notice = delinquency_notice(backer, &self.manage_url);
        if let Err(e) = self.mailer.send(&notice).await {
            return Err(SyncError::Mail {
                to: backer.email.clone(),
                reason: format!("{e:#}"),
            });
        }
        let sub_id = sub_id.to_string();
        self.store
            .update_backer(backer.id, move |b| {
                if b.stripe_subscription != sub_id || !b.delinquent {
                    return Txn::Abort(());
                }
                b.delinquent_emailed = true;
                Txn::Commit(())
            })
            .await?;
        info!("delinquency notice sent");
        Ok(PollOutcome::Delinquent)
    }

    /// Applies `f` only while `sub_id` is still the live subscription. `None` means no change.
    async fn guarded<F>(&self, backer_id: i64, sub_id: &str, f: F) -> Result<PollOutcome, SyncError>
    where
        F: FnOnce(&mut Backer) -> Option<PollOutcome> + Send,
    {
        let sub_id = sub_id.to_string();
        Ok(self
            .store
            .update_backer(backer_id, move |b| {
                if b.stripe_subscription != sub_id {
                    return Txn::Abort(PollOutcome::Unchanged);
                }
                match f(b) {
                    Some(outcome) => Txn::Commit(outcome),
                    None => Txn::Abort(PollOutcome::Unchanged),
                }
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tier;
    use crate::store::MemoryStore;
    use crate::testing::{FakeProcessor, RecordingMailer};
    use chrono::Utc;
    use std::time::Duration;

    struct Rig {
        store: Arc<MemoryStore>,
        processor: Arc<FakeProcessor>,
        mailer: Arc<RecordingMailer>,
        reconciler: SubscriptionReconciler<MemoryStore>,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(FakeProcessor::default());
        let mailer = Arc::new(RecordingMailer::default());
        let reconciler = SubscriptionReconciler::new(
            store.clone(),
            processor.clone(),
            mailer.clone(),
            Arc::new(DisplayCache::new(Duration::from_secs(30))),
            "https://gitfund.io/manage".into(),
        );
        Rig {
            store,
            processor,
            mailer,
            reconciler,
        }
    }

    async fn seed(store: &MemoryStore, tier: Tier, territory: &str) -> Backer {
        let mut b = Backer::new(7, "ada@example.com", "Ada", Utc::now());
        b.plan = Some(tier);
        b.territory = territory.into();
        b.stripe_customer_id = "cus_7".into();
        b.request_subscription_update();
        store.put_backer(&b).await.unwrap();
        b
    }

    async fn reload(store: &MemoryStore) -> Backer {
        store.get_backer(7).await.unwrap().unwrap()
    }

    #[test]
    fn keys_are_derived_from_backer_and_version() {
        assert_eq!(idempotency_key(7, 3), "gitfund-sub-7-v3");
        assert_ne!(idempotency_key(7, 3), idempotency_key(7, 4));
    }

    #[tokio::test]
    async fn attaches_a_new_subscription() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Gold, "DE").await;
        let outcome = rig.reconciler.ensure_subscription(&b).await.unwrap();
        let saved = reload(&rig.store).await;
        assert_eq!(outcome, EnsureOutcome::Attached(saved.stripe_subscription.clone()));
        assert_eq!(saved.stripe_plan, "gitfund.gold.std.v1");
        assert_eq!(saved.stripe_tax_bps, 1900);
        assert!(!saved.subscription_needs_updating);
    }

    #[tokio::test]
    async fn retry_after_timeout_reuses_the_key() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Silver, "GB").await;
        rig.processor.time_out_next_create();

        let first = rig.reconciler.ensure_subscription(&b).await;
        assert!(matches!(first, Err(SyncError::Processor(_))));
        assert!(reload(&rig.store).await.subscription_needs_updating);

        let b = reload(&rig.store).await;
        rig.reconciler.ensure_subscription(&b).await.unwrap();

        let keys = rig.processor.create_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(rig.processor.live_subscriptions("cus_7").len(), 1);
    }

    #[tokio::test]
    async fn timed_out_creates_are_cancelled_after_a_tier_change() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Silver, "US").await;
        rig.processor.time_out_next_create();
        assert!(rig.reconciler.ensure_subscription(&b).await.is_err());
        assert_eq!(reload(&rig.store).await.unconfirmed_creates.len(), 1);

        rig.store
            .update_backer(7, |b| {
                b.plan = Some(Tier::Gold);
                b.request_subscription_update();
                Txn::Commit(())
            })
            .await
            .unwrap();
        let b = reload(&rig.store).await;
        let outcome = rig.reconciler.ensure_subscription(&b).await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::Attached(_)), "{outcome:?}");

        let saved = reload(&rig.store).await;
        assert!(saved.unconfirmed_creates.is_empty());
        assert_eq!(saved.stripe_needs_cancelling.len(), 1);
        let orphan = saved.stripe_needs_cancelling[0].clone();
        rig.reconciler.cancel(7, &orphan).await.unwrap();

        let live = rig.processor.live_subscriptions("cus_7");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, saved.stripe_subscription);
        assert_eq!(live[0].plan, "gitfund.gold.std.v1");
        assert_eq!(
            rig.processor.create_keys(),
            vec![idempotency_key(7, 1), idempotency_key(7, 1), idempotency_key(7, 2)]
        );
    }

    #[tokio::test]
    async fn definitive_failures_move_to_a_fresh_key() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Gold, "US").await;
        rig.processor.fail_next_create(ProcessorError::Api("500: boom".into()));
        assert!(rig.reconciler.ensure_subscription(&b).await.is_err());

        let b = reload(&rig.store).await;
        assert_eq!(b.subscription_update_version, 2);
        assert!(b.subscription_needs_updating);
        assert!(b.unconfirmed_creates.is_empty());

        rig.reconciler.ensure_subscription(&b).await.unwrap();
        assert_eq!(rig.processor.create_keys(), vec![idempotency_key(7, 1), idempotency_key(7, 2)]);
        assert_eq!(rig.processor.live_subscriptions("cus_7").len(), 1);
    }

    #[tokio::test]
    async fn superseded_creations_are_queued_for_cancellation() {
        let rig = rig();
        let stale = seed(&rig.store, Tier::Bronze, "US").await;
        // A tier change lands between the snapshot and the write-back.
        rig.store
            .update_backer(7, |b| {
                b.plan = Some(Tier::Silver);
                b.request_subscription_update();
                Txn::Commit(())
            })
            .await
            .unwrap();

        let outcome = rig.reconciler.ensure_subscription(&stale).await.unwrap();
        let EnsureOutcome::Orphaned(orphan) = outcome else {
            panic!("expected orphan, got {outcome:?}");
        };
        let saved = reload(&rig.store).await;
        assert_eq!(saved.stripe_needs_cancelling, vec![orphan]);
        assert!(saved.stripe_subscription.is_empty());
        assert!(saved.subscription_needs_updating);
    }

    #[tokio::test]
    async fn plan_changes_replace_the_subscription() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Bronze, "FR").await;
        rig.reconciler.ensure_subscription(&b).await.unwrap();
        let old = reload(&rig.store).await.stripe_subscription;

        rig.store
            .update_backer(7, |b| {
                b.plan = Some(Tier::Gold);
                b.request_subscription_update();
                Txn::Commit(())
            })
            .await
            .unwrap();
        let b = reload(&rig.store).await;
        rig.reconciler.ensure_subscription(&b).await.unwrap();

        let saved = reload(&rig.store).await;
        assert_ne!(saved.stripe_subscription, old);
        assert_eq!(saved.stripe_needs_cancelling, vec![old]);
    }

    #[tokio::test]
    async fn card_errors_are_surfaced_verbatim() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Gold, "US").await;
        rig.processor.fail_next_create(ProcessorError::Card {
            code: Some("card_declined".into()),
            message: "Your card was declined.".into(),
        });
        let err = rig.reconciler.ensure_subscription(&b).await.unwrap_err();
        assert_eq!(err.to_string(), "Your card was declined.");
    }

    #[tokio::test]
    async fn already_cancelled_subscriptions_are_just_dequeued() {
        let rig = rig();
        let id = rig.processor.seed_subscription("cus_7", SubscriptionStatus::Canceled);
        let mut b = seed(&rig.store, Tier::Gold, "US").await;
        b.stripe_needs_cancelling = vec![id.clone()];
        rig.store.put_backer(&b).await.unwrap();

        rig.reconciler.cancel(7, &id).await.unwrap();
        assert!(reload(&rig.store).await.stripe_needs_cancelling.is_empty());
        assert_eq!(rig.processor.deletes(), 0);
    }

    #[tokio::test]
    async fn failed_cancellations_stay_queued() {
        let rig = rig();
        let id = rig.processor.seed_subscription("cus_7", SubscriptionStatus::Active);
        let mut b = seed(&rig.store, Tier::Gold, "US").await;
        b.stripe_needs_cancelling = vec![id.clone()];
        rig.store.put_backer(&b).await.unwrap();
        rig.processor.fail_deletes(true);

        assert!(rig.reconciler.cancel(7, &id).await.is_err());
        assert_eq!(reload(&rig.store).await.stripe_needs_cancelling, vec![id.clone()]);

        rig.processor.fail_deletes(false);
        rig.reconciler.cancel(7, &id).await.unwrap();
        assert!(reload(&rig.store).await.stripe_needs_cancelling.is_empty());
        assert!(rig.processor.live_subscriptions("cus_7").is_empty());
    }

    #[tokio::test]
    async fn past_due_emails_once_per_episode() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Gold, "US").await;
        rig.reconciler.ensure_subscription(&b).await.unwrap();
        let b = reload(&rig.store).await;
        rig.processor.set_status(&b.stripe_subscription, SubscriptionStatus::PastDue);

        assert_eq!(rig.reconciler.poll_status(&b).await.unwrap(), PollOutcome::Delinquent);
        let b = reload(&rig.store).await;
        assert!(b.delinquent && b.delinquent_emailed);
        assert_eq!(rig.reconciler.poll_status(&b).await.unwrap(), PollOutcome::Delinquent);
        assert_eq!(rig.mailer.sent().len(), 1);

        rig.processor.set_status(&b.stripe_subscription, SubscriptionStatus::Active);
        assert_eq!(rig.reconciler.poll_status(&b).await.unwrap(), PollOutcome::Recovered);
        let b = reload(&rig.store).await;
        assert!(!b.delinquent && !b.delinquent_emailed);
    }

    #[tokio::test]
    async fn failed_notice_is_retried_on_the_next_poll() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Gold, "US").await;
        rig.reconciler.ensure_subscription(&b).await.unwrap();
        let b = reload(&rig.store).await;
        rig.processor.set_status(&b.stripe_subscription, SubscriptionStatus::PastDue);
        rig.mailer.fail(true);

        assert!(matches!(rig.reconciler.poll_status(&b).await, Err(SyncError::Mail { .. })));
        let b = reload(&rig.store).await;
        assert!(b.delinquent && !b.delinquent_emailed);

        rig.mailer.fail(false);
        rig.reconciler.poll_status(&b).await.unwrap();
        assert!(reload(&rig.store).await.delinquent_emailed);
    }

    #[tokio::test]
    async fn remote_cancellation_resets_the_backing() {
        let rig = rig();
        let b = seed(&rig.store, Tier::Gold, "US").await;
        rig.reconciler.ensure_subscription(&b).await.unwrap();
        let b = reload(&rig.store).await;
        rig.processor.set_status(&b.stripe_subscription, SubscriptionStatus::Canceled);

        assert_eq!(rig.reconciler.poll_status(&b).await.unwrap(), PollOutcome::Reset);
        let saved = reload(&rig.store).await;
        assert_eq!(saved.plan, None);
        assert!(saved.stripe_subscription.is_empty());
        assert!(saved.stripe_needs_cancelling.is_empty());
        assert!(saved.totals_need_syncing);
        assert_eq!(saved.totals_version, b.totals_version + 1);
    }
}
