pub mod api;
pub mod billing;
pub mod cache;
pub mod config;
pub mod error;
pub mod finance;
pub mod ledger;
pub mod mailer;
pub mod model;
pub mod platform;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod sweep;
pub mod sync;
pub mod taxid;
pub mod telemetry;

pub mod util {
    pub mod db;
    pub mod env;
}

#[cfg(test)]
mod testing;

pub use platform::Platform;
