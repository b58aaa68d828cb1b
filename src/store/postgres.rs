use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};

use super::{Cursor, Datastore, Page, StoreError, Txn};
use crate::model::{parse_plan, Backer, LedgerRecord, ProcessorEvent, TierCounts};
use crate::util::db::Db;

/// Postgres-backed datastore. Backers live as JSONB documents; transactions
/// take row locks with `SELECT ... FOR UPDATE`.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn decode_backer(row: &PgRow) -> Result<Backer, StoreError> {
        let Json(backer) = row.try_get::<Json<Backer>, _>("doc")?;
        Ok(backer)
    }

    async fn write_backer(tx: &mut Transaction<'_, Postgres>, backer: &Backer) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE backers
                SET doc = $2, stripe_customer_id = $3, occupies_slot = $4, updated = $5
              WHERE id = $1",
        )
        .bind(backer.id)
        .bind(Json(backer))
        .bind(&backer.stripe_customer_id)
        .bind(backer.occupies_slot)
        .bind(backer.updated)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn lock_totals(tx: &mut Transaction<'_, Postgres>) -> Result<TierCounts, StoreError> {
        sqlx::query("INSERT INTO ledger_totals (id, counts) VALUES (1, '{}'::jsonb) ON CONFLICT (id) DO NOTHING")
            .execute(&mut **tx)
            .await?;
        let raw: serde_json::Value = sqlx::query_scalar("SELECT counts FROM ledger_totals WHERE id = 1 FOR UPDATE")
            .fetch_one(&mut **tx)
            .await?;
        decode_totals(raw)
    }
}

fn decode_totals(raw: serde_json::Value) -> Result<TierCounts, StoreError> {
    serde_json::from_value(raw).map_err(|source| StoreError::Malformed {
        entity: "ledger totals",
        source,
    })
}

fn decode_record(backer_id: i64, row: Option<PgRow>) -> Result<LedgerRecord, StoreError> {
    let Some(row) = row else {
        return Ok(LedgerRecord::empty(backer_id));
    };
    let plan: Option<String> = row.try_get("plan")?;
    let plan = parse_plan(plan.as_deref().unwrap_or("")).map_err(|e| StoreError::Malformed {
        entity: "ledger record",
        source: serde::de::Error::custom(e),
    })?;
    Ok(LedgerRecord {
        backer_id,
        plan,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl Datastore for PgStore {
    async fn get_backer(&self, id: i64) -> Result<Option<Backer>, StoreError> {
        let row = sqlx::query("SELECT doc FROM backers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(Self::decode_backer).transpose()
    }

    async fn put_backer(&self, backer: &Backer) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO backers (id, doc, stripe_customer_id, occupies_slot, updated)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
                SET doc = EXCLUDED.doc,
                    stripe_customer_id = EXCLUDED.stripe_customer_id,
                    occupies_slot = EXCLUDED.occupies_slot,
                    updated = EXCLUDED.updated",
        )
        .bind(backer.id)
        .bind(Json(backer))
        .bind(&backer.stripe_customer_id)
        .bind(backer.occupies_slot)
        .bind(backer.updated)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, email, name))]
    async fn find_or_create_backer(
        &self,
        login_key: &str,
        email: &str,
        name: &str,
    ) -> Result<(Backer, bool), StoreError> {
        if let Some(existing) = self.backer_for_login(login_key).await? {
            return Ok((existing, false));
        }

        let mut tx = self.db.pool.begin().await?;
        let id: i64 = sqlx::query_scalar("INSERT INTO backers (doc) VALUES ('{}'::jsonb) RETURNING id")
            .fetch_one(&mut *tx)
            .await?;
        // A concurrent creator for the same key blocks here until it commits.
        let inserted = sqlx::query("INSERT INTO logins (key, user_id) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
            .bind(login_key)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            debug!("lost login creation race; using the winner's backer");
            let winner = self.backer_for_login(login_key).await?;
            return winner.map(|b| (b, false)).ok_or(StoreError::BackerNotFound(id));
        }

        let backer = Backer::new(id, email, name, Utc::now());
        Self::write_backer(&mut tx, &backer).await?;
        tx.commit().await?;
        Ok((backer, true))
    }

    async fn backer_for_login(&self, login_key: &str) -> Result<Option<Backer>, StoreError> {
        let row = sqlx::query("SELECT b.doc FROM logins l JOIN backers b ON b.id = l.user_id WHERE l.key = $1")
            .bind(login_key)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(Self::decode_backer).transpose()
    }

    async fn backer_for_customer(&self, customer_id: &str) -> Result<Option<Backer>, StoreError> {
        if customer_id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT doc FROM backers WHERE stripe_customer_id = $1 ORDER BY id LIMIT 1")
            .bind(customer_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(Self::decode_backer).transpose()
    }

    #[instrument(skip(self, f))]
    async fn update_backer<T, F>(&self, id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Backer) -> Txn<T> + Send,
    {
        let mut tx = self.db.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM backers WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::BackerNotFound(id))?;
        let mut backer = Self::decode_backer(&row)?;
        match f(&mut backer) {
            Txn::Commit(v) => {
                backer.updated = Utc::now();
                Self::write_backer(&mut tx, &backer).await?;
                tx.commit().await?;
                Ok(v)
            }
            Txn::Abort(v) => {
                tx.rollback().await?;
                Ok(v)
            }
        }
    }

    #[instrument(skip(self, f))]
    async fn update_ledger<T, F>(&self, backer_id: i64, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut TierCounts, &mut LedgerRecord) -> Txn<T> + Send,
    {
        let mut tx = self.db.pool.begin().await?;
        let mut totals = Self::lock_totals(&mut tx).await?;
        let row = sqlx::query("SELECT plan, version FROM ledger_records WHERE backer_id = $1 FOR UPDATE")
            .bind(backer_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut record = decode_record(backer_id, row)?;

        match f(&mut totals, &mut record) {
            Txn::Commit(v) => {
                sqlx::query("UPDATE ledger_totals SET counts = $1 WHERE id = 1")
                    .bind(Json(&totals))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    "INSERT INTO ledger_records (backer_id, plan, version) VALUES ($1, $2, $3)
                     ON CONFLICT (backer_id) DO UPDATE SET plan = EXCLUDED.plan, version = EXCLUDED.version",
                )
                .bind(backer_id)
                .bind(record.plan.map(|t| t.as_str()))
                .bind(record.version)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(v)
            }
            Txn::Abort(v) => {
                tx.rollback().await?;
                Ok(v)
            }
        }
    }

    async fn ledger_totals(&self) -> Result<TierCounts, StoreError> {
        let raw: Option<serde_json::Value> = sqlx::query_scalar("SELECT counts FROM ledger_totals WHERE id = 1")
            .fetch_optional(&self.db.pool)
            .await?;
        raw.map(decode_totals).unwrap_or_else(|| Ok(TierCounts::default()))
    }

    async fn ledger_record(&self, backer_id: i64) -> Result<Option<LedgerRecord>, StoreError> {
        let row = sqlx::query("SELECT plan, version FROM ledger_records WHERE backer_id = $1")
            .bind(backer_id)
            .fetch_optional(&self.db.pool)
            .await?;
        match row {
            Some(row) => decode_record(backer_id, Some(row)).map(Some),
            None => Ok(None),
        }
    }

    async fn stale_backers(
        &self,
        before: DateTime<Utc>,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page<i64>, StoreError> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match after {
            Some(c) => {
                sqlx::query(
                    "SELECT id, updated FROM backers
                      WHERE updated < $1 AND (updated, id) > ($2, $3)
                      ORDER BY updated, id LIMIT $4",
                )
                .bind(before)
                .bind(c.updated)
                .bind(c.id)
                .bind(limit_i64)
                .fetch_all(&self.db.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, updated FROM backers WHERE updated < $1 ORDER BY updated, id LIMIT $2")
                    .bind(before)
                    .bind(limit_i64)
                    .fetch_all(&self.db.pool)
                    .await?
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        let mut last = None;
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let updated: DateTime<Utc> = row.try_get("updated")?;
            items.push(id);
            last = Some(Cursor { updated, id });
        }
        let next = if items.len() == limit { last } else { None };
        Ok(Page { items, next })
    }

    async fn sponsors(&self, limit: usize) -> Result<Vec<Backer>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM backers WHERE occupies_slot ORDER BY id LIMIT $1")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(Self::decode_backer).collect()
    }

    async fn record_event(&self, event: &ProcessorEvent) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO processor_events (id, created, customer, event_type, livemode, data)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(event.created)
        .bind(&event.customer)
        .bind(&event.event_type)
        .bind(event.livemode)
        .bind(Json(&event.data))
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tier;

    #[test]
    fn missing_ledger_records_start_empty() {
        let record = decode_record(42, None).unwrap();
        assert_eq!(record, LedgerRecord::empty(42));
    }

    #[test]
    fn stored_totals_with_unknown_tiers_are_rejected() {
        let good = decode_totals(serde_json::json!({"platinum": 2})).unwrap();
        assert_eq!(good.get(Tier::Platinum), 2);
        assert!(matches!(
            decode_totals(serde_json::json!({"emerald": 1})),
            Err(StoreError::Malformed { entity: "ledger totals", .. })
        ));
    }
}
