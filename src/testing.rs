//! Scripted stand-ins for the processor, the tax authority, the mailer and
//! a racing datastore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::billing::{Customer, NewSubscription, PaymentProcessor, ProcessorError, Subscription, SubscriptionStatus};
use crate::cache::DisplayCache;
use crate::config::Settings;
use crate::mailer::{Email, Mailer};
use crate::model::{Backer, LedgerRecord, ProcessorEvent, TierCounts};
use crate::store::{Cursor, Datastore, MemoryStore, Page, StoreError, Txn};
use crate::taxid::{AuthorityError, TaxAuthority, VatCheck};
use crate::Platform;

#[derive(Default)]
struct ProcessorState {
    next_id: u32,
    customers: HashMap<String, String>,
    subscriptions: HashMap<String, Subscription>,
    by_key: HashMap<String, String>,
    failed_keys: HashMap<String, ProcessorError>,
    create_keys: Vec<String>,
    deletes: u32,
    fail_next_create: Option<ProcessorError>,
    time_out_next_create: bool,
    fail_deletes: bool,
    fail_customers: Option<ProcessorError>,
}

/// In-memory processor honouring idempotency keys like the real one.
#[derive(Default)]
pub struct FakeProcessor {
    state: Mutex<ProcessorState>,
}

impl FakeProcessor {
    fn lock(&self) -> std::sync::MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap()
    }

    pub fn time_out_next_create(&self) {
        self.lock().time_out_next_create = true;
    }

    pub fn fail_next_create(&self, err: ProcessorError) {
        self.lock().fail_next_create = Some(err);
    }

    pub fn fail_customers_with(&self, err: ProcessorError) {
        self.lock().fail_customers = Some(err);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn create_keys(&self) -> Vec<String> {
        self.lock().create_keys.clone()
    }

    pub fn deletes(&self) -> u32 {
        self.lock().deletes
    }

    pub fn seed_subscription(&self, customer: &str, status: SubscriptionStatus) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("sub_seed_{}", state.next_id);
        state.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                customer: customer.to_string(),
                plan: String::new(),
                status,
            },
        );
        id
    }

    pub fn set_status(&self, id: &str, status: SubscriptionStatus) {
        if let Some(sub) = self.lock().subscriptions.get_mut(id) {
            sub.status = status;
        }
    }

    pub fn live_subscriptions(&self, customer: &str) -> Vec<Subscription> {
        self.lock()
            .subscriptions
            .values()
            .filter(|s| s.customer == customer && s.status != SubscriptionStatus::Canceled)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_customer(
        &self,
        email: &str,
        _name: &str,
        card_token: &str,
        _idempotency_key: &str,
    ) -> Result<Customer, ProcessorError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_customers.take() {
            return Err(err);
        }
        if card_token == "tok_chargeDeclined" {
            return Err(ProcessorError::Card {
                code: Some("card_declined".into()),
                message: "Your card was declined.".into(),
            });
        }
        state.next_id += 1;
        let id = format!("cus_{}", state.next_id);
        state.customers.insert(id.clone(), email.to_string());
        Ok(Customer { id })
    }

    async fn save_customer_card(&self, id: &str, card_token: &str) -> Result<Customer, ProcessorError> {
        if card_token == "tok_chargeDeclined" {
            return Err(ProcessorError::Card {
                code: Some("card_declined".into()),
                message: "Your card was declined.".into(),
            });
        }
        match self.lock().customers.contains_key(id) {
            true => Ok(Customer { id: id.to_string() }),
            false => Err(ProcessorError::NotFound(id.to_string())),
        }
    }

    async fn create_subscription(&self, req: &NewSubscription) -> Result<Subscription, ProcessorError> {
        let mut state = self.lock();
        state.create_keys.push(req.idempotency_key.clone());
        if let Some(err) = state.failed_keys.get(&req.idempotency_key) {
            return Err(err.clone());
        }
        if let Some(err) = state.fail_next_create.take() {
            // Answers are remembered per key, failures included.
            state.failed_keys.insert(req.idempotency_key.clone(), err.clone());
            return Err(err);
        }
        let existing = state.by_key.get(&req.idempotency_key).cloned();
        let sub = match existing {
            Some(id) => state.subscriptions[&id].clone(),
            None => {
                state.next_id += 1;
                let sub = Subscription {
                    id: format!("sub_{}", state.next_id),
                    customer: req.customer.clone(),
                    plan: req.plan.clone(),
                    status: SubscriptionStatus::Active,
                };
                state.by_key.insert(req.idempotency_key.clone(), sub.id.clone());
                state.subscriptions.insert(sub.id.clone(), sub.clone());
                sub
            }
        };
        // The subscription exists remotely, but the caller never hears back.
        if std::mem::take(&mut state.time_out_next_create) {
            return Err(ProcessorError::Transport("operation timed out".into()));
        }
        Ok(sub)
    }

    async fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProcessorError> {
        self.lock()
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(id.to_string()))
    }

    async fn delete_subscription(&self, id: &str) -> Result<Subscription, ProcessorError> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(ProcessorError::Api("500: internal error".into()));
        }
        state.deletes += 1;
        let sub = state
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| ProcessorError::NotFound(id.to_string()))?;
        sub.status = SubscriptionStatus::Canceled;
        Ok(sub.clone())
    }
}

/// Answers from a queue; an empty queue behaves like an unreachable service.
#[derive(Default)]
pub struct FakeAuthority {
    script: Mutex<VecDeque<Result<VatCheck, AuthorityError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeAuthority {
    pub fn push(&self, answer: Result<VatCheck, AuthorityError>) {
        self.script.lock().unwrap().push_back(answer);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaxAuthority for FakeAuthority {
    async fn check_vat(&self, country_code: &str, number: &str) -> Result<VatCheck, AuthorityError> {
        self.calls
            .lock()
            .unwrap()
            .push((country_code.to_string(), number.to_string()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AuthorityError::Transport("no scripted answer".into())))
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    failing: Mutex<bool>,
}

impl RecordingMailer {
    pub fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        if *self.failing.lock().unwrap() {
            anyhow::bail!("smtp relay refused the message");
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Memory store where a competing writer bumps the backer's totals version
/// right after each of the next `bumps` ledger transactions.
pub struct RacingStore {
    inner: MemoryStore,
    bumps: AtomicU32,
}

impl RacingStore {
    pub fn new(bumps: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            bumps: AtomicU32::new(bumps),
        }
    }
}

#[async_trait]
impl Datastore for RacingStore {
    async fn get_backer(&self, id: i64) -> Result<Option<Backer>, StoreError> {
        self.inner.get_backer(id).await
    }

    async fn put_backer(&self, backer: &Backer) -> Result<(), StoreError> {
        self.inner.put_backer(backer).await
    }

    async fn find_or_create_backer(
        &self,
        login_key: &str,
        email: &str,
        name: &str,
    ) -> Result<(Backer, bool), StoreError> {
        self.inner.find_or_create_backer(login_key, email, name).await
    }

    async fn backer_for_login(&self, login_key: &str) -> Result<Option<Backer>, StoreError> {
        self.inner.backer_for_login(login_key).await
    }

    async fn backer_for_customer(&self, customer_id: &str) -> Result<Option<Backer>, StoreError> {
        self.inner.backer_for_customer(customer_id).await
    }

    async fn update_backer<T, F>(&self, id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Backer) -> Txn<T> + Send,
    {
        self.inner.update_backer(id, f).await
    }

    async fn update_ledger<T, F>(&self, backer_id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut TierCounts, &mut LedgerRecord) -> Txn<T> + Send,
    {
        let out = self.inner.update_ledger(backer_id, f).await?;
        let raced = self
            .bumps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            self.inner
                .update_backer(backer_id, |b| {
                    b.request_totals_sync();
                    Txn::Commit(())
                })
                .await?;
        }
        Ok(out)
    }

    async fn ledger_totals(&self) -> Result<TierCounts, StoreError> {
        self.inner.ledger_totals().await
    }

    async fn ledger_record(&self, backer_id: i64) -> Result<Option<LedgerRecord>, StoreError> {
        self.inner.ledger_record(backer_id).await
    }

    async fn stale_backers(
        &self,
        before: DateTime<Utc>,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<i64>, StoreError> {
        self.inner.stale_backers(before, after, limit).await
    }

    async fn sponsors(&self, limit: usize) -> Result<Vec<Backer>, StoreError> {
        self.inner.sponsors(limit).await
    }

    async fn record_event(&self, event: &ProcessorEvent) -> Result<bool, StoreError> {
        self.inner.record_event(event).await
    }
}

/// A platform over the memory store and the fakes above.
pub struct TestRig {
    pub store: Arc<MemoryStore>,
    pub processor: Arc<FakeProcessor>,
    pub authority: Arc<FakeAuthority>,
    pub mailer: Arc<RecordingMailer>,
    pub platform: Arc<Platform<MemoryStore>>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(mut settings: Settings) -> Self {
        settings.vies.backoff = std::time::Duration::from_millis(1);
        settings.stripe.webhook_token = "whtok".into();
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(FakeProcessor::default());
        let authority = Arc::new(FakeAuthority::default());
        let mailer = Arc::new(RecordingMailer::default());
        let platform = Arc::new(Platform::new(
            settings,
            store.clone(),
            processor.clone(),
            authority.clone(),
            mailer.clone(),
        ));
        Self {
            store,
            processor,
            authority,
            mailer,
            platform,
        }
    }

    pub fn cache(&self) -> &DisplayCache {
        &self.platform.cache
    }
}
