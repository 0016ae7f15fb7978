//! In-process intent store
//!
//! Each intent lives behind its own async mutex, so every patch to one
//! intent runs read-merge-write as a single critical section while patches to
//! different intents proceed in parallel.

use super::{clamp_limit, IntentStats, IntentStore, ListFilter, Page};
use crate::error::{DisperserError, DisperserResult};
use crate::intent::{DepositIntent, IntentPatch, Patched};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Single-process store with per-intent mutual exclusion
#[derive(Default)]
pub struct MemoryIntentStore {
    intents: DashMap<String, Arc<Mutex<DepositIntent>>>,
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Option<Arc<Mutex<DepositIntent>>> {
        self.intents.get(id).map(|entry| entry.value().clone())
    }

    async fn snapshot(&self) -> Vec<DepositIntent> {
        // Clone the handles first so no map guard is held across an await
        let slots: Vec<_> = self.intents.iter().map(|e| e.value().clone()).collect();
        let mut intents = Vec::with_capacity(slots.len());
        for slot in slots {
            intents.push(slot.lock().await.clone());
        }
        intents
    }
}

#[async_trait]
impl IntentStore for MemoryIntentStore {
    async fn get(&self, id: &str) -> DisperserResult<Option<DepositIntent>> {
        match self.slot(id) {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn create_from_deposit(&self, intent: DepositIntent) -> DisperserResult<DepositIntent> {
        let id = intent.id.clone();
        let slot = self
            .intents
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(intent)))
            .value()
            .clone();

        let stored = slot.lock().await.clone();
        debug!(intent_id = %id, version = stored.version, "Intent stored");
        Ok(stored)
    }

    async fn patch(&self, id: &str, patch: IntentPatch) -> DisperserResult<Patched> {
        let slot = self.slot(id).ok_or_else(|| DisperserError::IntentNotFound {
            intent_id: id.to_string(),
        })?;

        let mut intent = slot.lock().await;
        let transition = intent.apply(&patch, Utc::now())?;

        Ok(Patched::new(intent.clone(), transition))
    }

    async fn list(
        &self,
        filter: &ListFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> DisperserResult<Page> {
        let limit = clamp_limit(limit);

        let mut items: Vec<DepositIntent> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|intent| filter.matches(intent))
            .collect();

        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let start = cursor
            .and_then(|c| items.iter().position(|item| item.id == c))
            .map_or(0, |idx| idx + 1);

        let remaining = items.len().saturating_sub(start);
        let page: Vec<DepositIntent> = items.into_iter().skip(start).take(limit).collect();
        let next_cursor = if remaining > limit {
            page.last().map(|item| item.id.clone())
        } else {
            None
        };

        Ok(Page {
            items: page,
            next_cursor,
        })
    }

    async fn stats(&self) -> DisperserResult<IntentStats> {
        let mut stats = IntentStats::default();
        for intent in self.snapshot().await {
            stats.record(intent.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::tests::{deposit_event, sample_intent, USER};
    use crate::intent::{ChainDispersalStatus, ChainUpdate, IntentStatus};
    use crate::config::ChainRegistry;

    fn intent_with_hash(n: u64, created_offset_secs: i64) -> DepositIntent {
        let hash = format!("0x{:064x}", n);
        let mut intent = DepositIntent::from_deposit(
            &deposit_event(&hash, &[(10, "1")]),
            &ChainRegistry::default(),
            Utc::now(),
        );
        intent.created_at = intent.created_at + chrono::Duration::seconds(created_offset_secs);
        intent
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryIntentStore::new();
        let first = store
            .create_from_deposit(sample_intent(&[(10, "0.75"), (137, "0.50")]))
            .await
            .unwrap();
        store.patch(&first.id, IntentPatch::Enqueue).await.unwrap();

        // A re-ingested payload must not reset the stored record
        let again = store
            .create_from_deposit(sample_intent(&[(10, "0.75"), (137, "0.50")]))
            .await
            .unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.status, IntentStatus::DisperseQueued);
        assert_eq!(again.chain_statuses.len(), 2);
        assert_eq!(store.intents.len(), 1);
    }

    #[tokio::test]
    async fn test_patch_unknown_intent() {
        let store = MemoryIntentStore::new();
        let err = store.patch("0xmissing", IntentPatch::Enqueue).await.unwrap_err();
        assert!(matches!(err, DisperserError::IntentNotFound { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_merges_are_not_lost() {
        let chains: Vec<u64> = (1..=16).collect();
        let allocations: Vec<(u64, &str)> = chains.iter().map(|c| (*c, "0.10")).collect();
        let store = Arc::new(MemoryIntentStore::new());
        let intent = store
            .create_from_deposit(sample_intent(&allocations))
            .await
            .unwrap();
        store.patch(&intent.id, IntentPatch::Enqueue).await.unwrap();

        let handles: Vec<_> = chains
            .iter()
            .map(|chain_id| {
                let store = store.clone();
                let id = intent.id.clone();
                let chain_id = *chain_id;
                tokio::spawn(async move {
                    let hash = format!("0x{:064x}", chain_id);
                    store
                        .patch(
                            &id,
                            IntentPatch::Chain {
                                chain_id,
                                update: ChainUpdate::broadcasted(hash, "u"),
                            },
                        )
                        .await
                        .unwrap();
                    store
                        .patch(
                            &id,
                            IntentPatch::Chain {
                                chain_id,
                                update: ChainUpdate::confirmed("21000"),
                            },
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        let final_state = store.get(&intent.id).await.unwrap().unwrap();
        assert!(final_state
            .chain_statuses
            .iter()
            .all(|c| c.status == ChainDispersalStatus::Confirmed));
        assert_eq!(final_state.status, IntentStatus::Dispersed);
        assert!(final_state.completed_at.is_some());
        // enqueue + two merges per chain
        assert_eq!(final_state.version, 1 + 2 * chains.len() as u64);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let store = MemoryIntentStore::new();
        for n in 1..=5u64 {
            let mut intent = intent_with_hash(n, n as i64);
            if n == 3 {
                intent.user_address = "0x2222222222222222222222222222222222222222".to_string();
            }
            store.create_from_deposit(intent).await.unwrap();
        }

        let filter = ListFilter {
            user_address: Some(USER.to_ascii_uppercase().replacen("0X", "0x", 1)),
            status: None,
        };
        let first = store.list(&filter, 2, None).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![format!("0x{:064x}", 5), format!("0x{:064x}", 4)]);
        assert_eq!(first.next_cursor, Some(format!("0x{:064x}", 4)));

        let second = store
            .list(&filter, 2, first.next_cursor.as_deref())
            .await
            .unwrap();
        let ids: Vec<_> = second.items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![format!("0x{:064x}", 2), format!("0x{:064x}", 1)]);
        assert_eq!(second.next_cursor, None);

        let queued = ListFilter {
            user_address: None,
            status: Some(IntentStatus::DisperseQueued),
        };
        assert!(store.list(&queued, 10, None).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = MemoryIntentStore::new();
        let a = store.create_from_deposit(intent_with_hash(1, 0)).await.unwrap();
        store.create_from_deposit(intent_with_hash(2, 0)).await.unwrap();
        store.patch(&a.id, IntentPatch::Enqueue).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.deposit_confirmed, 1);
        assert_eq!(stats.disperse_queued, 1);
        assert_eq!(stats.dispersed, 0);
    }
}
