//! Transactional access to backers, the slot ledger and the webhook journal.
//!
//! Every mutation goes through a closure that sees the current committed state
//! and returns [`Txn::Commit`] or [`Txn::Abort`]; implementations run the
//! closure under the entity's lock so concurrent writers serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Backer, LedgerRecord, ProcessorEvent, TierCounts};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Decision returned by a transaction body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Txn<T> {
    /// Persist the mutated entities and return the value.
    Commit(T),
    /// Discard every mutation and return the value.
    Abort(T),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backer {0} not found")]
    BackerNotFound(i64),
    #[error("stored {entity} is malformed: {source}")]
    Malformed {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Keyset position for the staleness query: `(updated, id)` of the last row seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub updated: DateTime<Utc>,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` once the query is exhausted.
    pub next: Option<Cursor>,
}

#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn get_backer(&self, id: i64) -> Result<Option<Backer>, StoreError>;

    /// Writes the backer as-is, including its `updated` stamp.
    async fn put_backer(&self, backer: &Backer) -> Result<(), StoreError>;

    /// Looks the email up through the login index, creating both the backer and
    /// the login entry when absent. The flag is true when a backer was created.
    async fn find_or_create_backer(
        &self,
        login_key: &str,
        email: &str,
        name: &str,
    ) -> Result<(Backer, bool), StoreError>;

    async fn backer_for_login(&self, login_key: &str) -> Result<Option<Backer>, StoreError>;

    async fn backer_for_customer(&self, customer_id: &str) -> Result<Option<Backer>, StoreError>;

    /// Runs `f` against the current backer; on commit the backer is written with
    /// a fresh `updated` stamp.
    async fn update_backer<T, F>(&self, id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Backer) -> Txn<T> + Send;

    /// Runs `f` against the ledger totals and the backer's ledger record in one
    /// transaction. A missing record is presented as empty at version 0.
    async fn update_ledger<T, F>(&self, backer_id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut TierCounts, &mut LedgerRecord) -> Txn<T> + Send;

    async fn ledger_totals(&self) -> Result<TierCounts, StoreError>;

    async fn ledger_record(&self, backer_id: i64) -> Result<Option<LedgerRecord>, StoreError>;

    /// Ids of backers last updated before `before`, ordered by `(updated, id)`.
    async fn stale_backers(
        &self,
        before: DateTime<Utc>,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<i64>, StoreError>;

    /// Backers currently holding a slot, oldest first.
    async fn sponsors(&self, limit: usize) -> Result<Vec<Backer>, StoreError>;

    /// Get-or-insert by event id; true when the event was new.
    async fn record_event(&self, event: &ProcessorEvent) -> Result<bool, StoreError>;
}
