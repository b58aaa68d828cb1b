//! Periodic re-sync of backers whose `updated` stamp has gone stale.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::config::SyncSettings;
use crate::store::{Datastore, StoreError};
use crate::sync::SyncOrchestrator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pages: usize,
    pub visited: usize,
    pub with_errors: usize,
    /// True when the deadline cut the run short.
    pub truncated: bool,
}

pub struct Sweeper<S> {
    store: Arc<S>,
    orchestrator: Arc<SyncOrchestrator<S>>,
    window: chrono::Duration,
    batch: usize,
    concurrency: usize,
    deadline: Duration,
}

impl<S: Datastore> Sweeper<S> {
    pub fn new(store: Arc<S>, orchestrator: Arc<SyncOrchestrator<S>>, settings: &SyncSettings) -> Self {
        Self {
            store,
            orchestrator,
            window: settings.staleness_window,
            batch: settings.sweep_batch.max(1),
            concurrency: settings.sweep_concurrency.max(1),
            deadline: settings.sweep_deadline,
        }
    }

    /// One pass over every backer stale as of `now`. Overlapping runs are
    /// harmless since each sync is idempotent.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let cutoff = now - self.window;
        let mut report = SweepReport::default();
        let mut cursor = None;

        loop {
            if started.elapsed() >= self.deadline {
                report.truncated = true;
                warn!(visited = report.visited, "sweep deadline reached; remaining backers wait for the next run");
                break;
            }
            let page = self.store.stale_backers(cutoff, cursor, self.batch).await?;
            if page.items.is_empty() {
                break;
            }
            report.pages += 1;
            report.visited += page.items.len();

            let orchestrator = &self.orchestrator;
            let failures = stream::iter(page.items)
                .map(|id| async move { (id, orchestrator.sync(id, false).await) })
                .buffer_unordered(self.concurrency)
                .filter(|(_, errors)| std::future::ready(!errors.is_empty()))
                .collect::<Vec<_>>()
                .await;
            for (id, errors) in &failures {
                warn!(backer_id = id, errors = ?errors, "backer still out of sync");
            }
            report.with_errors += failures.len();

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(
            pages = report.pages,
            visited = report.visited,
            with_errors = report.with_errors,
            truncated = report.truncated,
            "sweep finished"
        );
        Ok(report)
    }
}
