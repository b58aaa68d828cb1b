use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{Cursor, Datastore, Page, StoreError, Txn};
use crate::model::{Backer, LedgerRecord, ProcessorEvent, TierCounts};

#[derive(Default)]
struct State {
    backers: BTreeMap<i64, Backer>,
    last_id: i64,
    logins: HashMap<String, i64>,
    totals: TierCounts,
    records: HashMap<i64, LedgerRecord>,
    events: HashMap<String, ProcessorEvent>,
}

/// In-process datastore. One mutex guards all entities, so every transaction
/// is serializable.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event(&self, id: &str) -> Option<ProcessorEvent> {
        self.state.lock().await.events.get(id).cloned()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn get_backer(&self, id: i64) -> Result<Option<Backer>, StoreError> {
        Ok(self.state.lock().await.backers.get(&id).cloned())
    }

    async fn put_backer(&self, backer: &Backer) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.last_id = state.last_id.max(backer.id);
        state.backers.insert(backer.id, backer.clone());
        Ok(())
    }

    async fn find_or_create_backer(
        &self,
        login_key: &str,
        email: &str,
        name: &str,
    ) -> Result<(Backer, bool), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.logins.get(login_key).copied() {
            let backer = state.backers.get(&id).cloned().ok_or(StoreError::BackerNotFound(id))?;
            return Ok((backer, false));
        }
        state.last_id += 1;
        let backer = Backer::new(state.last_id, email, name, Utc::now());
        state.logins.insert(login_key.to_string(), backer.id);
        state.backers.insert(backer.id, backer.clone());
        Ok((backer, true))
    }

    async fn backer_for_login(&self, login_key: &str) -> Result<Option<Backer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logins
            .get(login_key)
            .and_then(|id| state.backers.get(id))
            .cloned())
    }

    async fn backer_for_customer(&self, customer_id: &str) -> Result<Option<Backer>, StoreError> {
        if customer_id.is_empty() {
            return Ok(None);
        }
        let state = self.state.lock().await;
        Ok(state
            .backers
            .values()
            .find(|b| b.stripe_customer_id == customer_id)
            .cloned())
    }

    async fn update_backer<T, F>(&self, id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Backer) -> Txn<T> + Send,
    {
        let mut state = self.state.lock().await;
        let mut backer = state.backers.get(&id).cloned().ok_or(StoreError::BackerNotFound(id))?;
        match f(&mut backer) {
            Txn::Commit(v) => {
                backer.updated = Utc::now();
                state.backers.insert(id, backer);
                Ok(v)
            }
            Txn::Abort(v) => Ok(v),
        }
    }

    async fn update_ledger<T, F>(&self, backer_id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut TierCounts, &mut LedgerRecord) -> Txn<T> + Send,
    {
        let mut state = self.state.lock().await;
        let mut totals = state.totals.clone();
        let mut record = state
            .records
            .get(&backer_id)
            .cloned()
            .unwrap_or_else(|| LedgerRecord::empty(backer_id));
        match f(&mut totals, &mut record) {
            Txn::Commit(v) => {
                state.totals = totals;
                state.records.insert(backer_id, record);
                Ok(v)
            }
            Txn::Abort(v) => Ok(v),
        }
    }

    async fn ledger_totals(&self) -> Result<TierCounts, StoreError> {
        Ok(self.state.lock().await.totals.clone())
    }

    async fn ledger_record(&self, backer_id: i64) -> Result<Option<LedgerRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&backer_id).cloned())
    }

    async fn stale_backers(
        &self,
        before: DateTime<Utc>,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<i64>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<(DateTime<Utc>, i64)> = state
            .backers
            .values()
            .filter(|b| b.updated < before)
            .map(|b| (b.updated, b.id))
            .filter(|key| after.map_or(true, |c| *key > (c.updated, c.id)))
            .collect();
        rows.sort();
        rows.truncate(limit);
        let next = match rows.last() {
            Some(&(updated, id)) if rows.len() == limit => Some(Cursor { updated, id }),
            _ => None,
        };
        Ok(Page {
            items: rows.into_iter().map(|(_, id)| id).collect(),
            next,
        })
    }

    async fn sponsors(&self, limit: usize) -> Result<Vec<Backer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .backers
            .values()
            .filter(|b| b.occupies_slot)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: &ProcessorEvent) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.events.contains_key(&event.id) {
            return Ok(false);
        }
        state.events.insert(event.id.clone(), event.clone());
        Ok(true)
    }
}
