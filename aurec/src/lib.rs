#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod collector;
pub mod config;
pub mod emitter;
pub mod supervisor;

pub use api::{delete_audit, query_audit, Principal};
pub use config::AuditSettings;
pub use emitter::{Emitter, SessionInfo};
pub use supervisor::Supervisor;

/// Seconds since the Unix epoch, saturating instead of failing.
pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
