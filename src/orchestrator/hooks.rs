//! Injected side effects: post-teardown cleanup, time, and identifiers.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::BoxFuture;
use crate::models::session::UserSessionSnapshot;
use crate::Result;

/// Post-termination hook, run exactly once per torn-down user session.
///
/// Its outcome never blocks or reverses the termination.
pub trait Cleaner: Send + Sync {
    /// Perform cleanup for `session`.
    ///
    /// # Errors
    ///
    /// Errors are logged by the orchestrator and otherwise ignored.
    fn cleanup<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        session: &'a UserSessionSnapshot,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Cleaner that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleaner;

impl Cleaner for NoopCleaner {
    fn cleanup<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        _session: &'a UserSessionSnapshot,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Source of timestamps.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of user session identifiers.
pub trait IdGenerator: Send + Sync {
    /// A fresh, globally unique identifier.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
