//! Intent persistence
//!
//! Handles:
//! - Idempotent intent creation keyed on the deposit tx hash
//! - Serialized patch application (per-intent mutex or optimistic versioning)
//! - Filtered, cursor-paginated history listing
//! - Per-status statistics

mod memory;
mod postgres;

pub use memory::MemoryIntentStore;
pub use postgres::PostgresIntentStore;

use crate::error::DisperserResult;
use crate::intent::{DepositIntent, IntentPatch, IntentStatus, Patched};

use async_trait::async_trait;
use serde::Serialize;

/// Upper bound for a single history page
pub const MAX_PAGE_SIZE: usize = 100;

/// History filter
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub user_address: Option<String>,
    pub status: Option<IntentStatus>,
}

impl ListFilter {
    fn matches(&self, intent: &DepositIntent) -> bool {
        let user_ok = self
            .user_address
            .as_ref()
            .map_or(true, |u| u.eq_ignore_ascii_case(&intent.user_address));
        let status_ok = self.status.map_or(true, |s| s == intent.status);
        user_ok && status_ok
    }
}

/// One page of history, newest first
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<DepositIntent>,
    pub next_cursor: Option<String>,
}

/// Intent counts per status
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentStats {
    pub deposit_confirmed: u64,
    pub disperse_queued: u64,
    pub disperse_in_progress: u64,
    pub dispersed: u64,
    pub failed: u64,
}

impl IntentStats {
    fn record(&mut self, status: IntentStatus, count: u64) {
        let slot = match status {
            IntentStatus::DepositConfirmed => &mut self.deposit_confirmed,
            IntentStatus::DisperseQueued => &mut self.disperse_queued,
            IntentStatus::DisperseInProgress => &mut self.disperse_in_progress,
            IntentStatus::Dispersed => &mut self.dispersed,
            IntentStatus::Failed => &mut self.failed,
        };
        *slot += count;
    }
}

/// Durable keyed storage for deposit intents
#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn get(&self, id: &str) -> DisperserResult<Option<DepositIntent>>;

    /// Insert an intent materialized from a deposit event unless one with the
    /// same id exists. Always returns the stored record; an existing record is
    /// returned unchanged.
    async fn create_from_deposit(&self, intent: DepositIntent) -> DisperserResult<DepositIntent>;

    /// Apply a patch under the store's serialization discipline. Concurrent
    /// patches to the same intent never lose each other's effects.
    async fn patch(&self, id: &str, patch: IntentPatch) -> DisperserResult<Patched>;

    async fn list(
        &self,
        filter: &ListFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> DisperserResult<Page>;

    async fn stats(&self) -> DisperserResult<IntentStats>;

    async fn health_check(&self) -> DisperserResult<()> {
        Ok(())
    }
}

pub(crate) fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_SIZE)
}
