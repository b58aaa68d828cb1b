//! Bounded reload-and-retry for optimistic version races.

use std::future::Future;
use tracing::debug;

/// Result of one optimistic attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    /// A newer write won the race; reload and try again.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{what} kept losing to newer writes after {attempts} attempts")]
pub struct StaleData {
    pub what: &'static str,
    pub attempts: u32,
}

/// Runs `attempt` until it reports `Done`, allowing at most `retries` reloads
/// after the first try. The attempt number (from 0) is passed in.
pub async fn retry_stale<T, E, F, Fut>(what: &'static str, retries: u32, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
    E: From<StaleData>,
{
    let attempts = retries.saturating_add(1);
    for n in 0..attempts {
        match attempt(n).await? {
            Attempt::Done(v) => return Ok(v),
            Attempt::Stale => debug!(what, attempt = n + 1, "stale data; reloading"),
        }
    }
    Err(StaleData { what, attempts }.into())
}
