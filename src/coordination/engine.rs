//! Dispersal orchestrator: intent lifecycle and per-chain fan-out

use super::supervisor::{TaskStage, TaskSupervisor};
use crate::chain::ChainGateway;
use crate::config::{ChainRegistry, DispersalConfig};
use crate::error::{DisperserError, DisperserResult};
use crate::events::DepositEvent;
use crate::intent::{ChainDispersalStatus, ChainUpdate, DepositIntent, IntentPatch, Patched};
use crate::state::IntentStore;

use chrono::Utc;
use ethers::types::{Address, H256, U256};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on the backoff multiplier for contended merges
const MAX_MERGE_BACKOFF_STEPS: u32 = 10;

/// Convert a USD decimal string into token base units
pub fn to_token_units(amount_usd: &str, decimals: u32) -> DisperserResult<U256> {
    ethers::utils::parse_units(amount_usd, decimals)
        .map(U256::from)
        .map_err(|e| {
            DisperserError::Validation(format!("Cannot convert amount {}: {}", amount_usd, e))
        })
}

/// Drives intents from ingestion to a terminal status
pub struct DispersalOrchestrator {
    /// Intent persistence
    store: Arc<dyn IntentStore>,
    /// Destination chain access
    gateway: Arc<dyn ChainGateway>,
    /// Chain metadata for new intents
    registry: Arc<ChainRegistry>,
    /// Outstanding workers
    supervisor: Arc<TaskSupervisor>,
    /// Configuration
    config: DispersalConfig,
}

impl DispersalOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        store: Arc<dyn IntentStore>,
        gateway: Arc<dyn ChainGateway>,
        registry: Arc<ChainRegistry>,
        config: DispersalConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            registry,
            supervisor: Arc::new(TaskSupervisor::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn IntentStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    /// Fetch an intent or fail with `IntentNotFound`
    pub async fn get_intent(&self, intent_id: &str) -> DisperserResult<DepositIntent> {
        self.store
            .get(&intent_id.to_ascii_lowercase())
            .await?
            .ok_or_else(|| DisperserError::IntentNotFound {
                intent_id: intent_id.to_string(),
            })
    }

    /// Ingest a deposit event.
    ///
    /// Returns the intent and whether this call created it. A replayed event
    /// returns the stored record untouched and dispatches nothing.
    pub async fn ingest_deposit(
        self: &Arc<Self>,
        event: DepositEvent,
    ) -> DisperserResult<(DepositIntent, bool)> {
        event.validate()?;
        let intent_id = event.intent_id();

        if let Some(existing) = self.store.get(&intent_id).await? {
            info!(
                intent_id = %intent_id,
                status = %existing.status,
                "Duplicate deposit event, returning existing intent"
            );
            crate::metrics::record_ingest(false);
            return Ok((existing, false));
        }

        let intent = DepositIntent::from_deposit(&event, &self.registry, Utc::now());
        info!(
            intent_id = %intent_id,
            user = %intent.user_address,
            amount_usd = %intent.amount_in_usd,
            chains = intent.chain_statuses.len(),
            "Deposit intent created"
        );
        self.store.create_from_deposit(intent).await?;

        // A concurrent ingest of the same event loses here: only one enqueue applies
        let patched = self.enqueue(&intent_id).await?;
        crate::metrics::record_ingest(patched.applied);
        Ok((patched.intent, patched.applied))
    }

    /// Move every NOT_STARTED chain to QUEUED and start one worker per chain.
    ///
    /// Returns as soon as the QUEUED transition is committed; workers run
    /// detached under the task supervisor.
    pub async fn enqueue_dispersal(self: &Arc<Self>, intent_id: &str) -> DisperserResult<DepositIntent> {
        let patched = self.enqueue(&intent_id.to_ascii_lowercase()).await?;
        Ok(patched.intent)
    }

    async fn enqueue(self: &Arc<Self>, intent_id: &str) -> DisperserResult<Patched> {
        let patched = self.store.patch(intent_id, IntentPatch::Enqueue).await?;

        if !patched.applied {
            debug!(
                intent_id,
                status = %patched.intent.status,
                "Intent already enqueued, no workers spawned"
            );
            return Ok(patched);
        }

        info!(
            intent_id,
            chains = patched.intent.chain_statuses.len(),
            "Dispersal queued"
        );

        for chain in &patched.intent.chain_statuses {
            if chain.status == ChainDispersalStatus::Queued {
                info!(intent_id, chain_id = chain.chain_id(), "Chain dispersal queued");
                self.spawn_dispatch(
                    &patched.intent,
                    chain.chain_id(),
                    chain.allocation.amount_usd.clone(),
                );
            }
        }

        Ok(patched)
    }

    fn spawn_dispatch(self: &Arc<Self>, intent: &DepositIntent, chain_id: u64, amount_usd: String) {
        let this = self.clone();
        let intent_id = intent.id.clone();
        let recipient = intent.user_address.clone();

        self.supervisor
            .spawn(&intent.id, chain_id, TaskStage::Dispatch, async move {
                let outcome =
                    AssertUnwindSafe(this.dispatch_chain(&intent_id, chain_id, &amount_usd, &recipient))
                        .catch_unwind()
                        .await;

                if outcome.is_err() {
                    crate::metrics::record_worker_panic();
                    crate::metrics::record_dispatch_failed(chain_id, "dispatch");
                    error!(intent_id = %intent_id, chain_id, "Dispatch worker panicked");
                    this.merge(&intent_id, chain_id, ChainUpdate::failed("worker panicked"))
                        .await;
                }
            });
    }

    async fn dispatch_chain(
        self: &Arc<Self>,
        intent_id: &str,
        chain_id: u64,
        amount_usd: &str,
        recipient: &str,
    ) {
        let result = async {
            let amount = to_token_units(amount_usd, self.config.token_decimals)?;
            let recipient: Address = recipient.parse().map_err(|e| {
                DisperserError::Validation(format!("Invalid recipient {}: {}", recipient, e))
            })?;
            self.gateway.dispatch(chain_id, amount, recipient).await
        }
        .await;

        match result {
            Ok(receipt) => {
                let tx_hash = format!("{:?}", receipt.tx_hash);
                crate::metrics::record_dispatch_submitted(chain_id);
                info!(intent_id, chain_id, tx_hash = %tx_hash, "Chain dispersal broadcast");

                self.merge(
                    intent_id,
                    chain_id,
                    ChainUpdate::broadcasted(tx_hash, receipt.explorer_url),
                )
                .await;
                // The transaction exists on chain either way, so it is always watched
                self.spawn_watch(intent_id, chain_id, receipt.tx_hash);
            }
            Err(e) => {
                crate::metrics::record_dispatch_failed(chain_id, "dispatch");
                warn!(intent_id, chain_id, "Chain dispersal failed to dispatch: {}", e);
                self.merge(intent_id, chain_id, ChainUpdate::failed(failure_reason(&e)))
                    .await;
            }
        }
    }

    fn spawn_watch(self: &Arc<Self>, intent_id: &str, chain_id: u64, tx_hash: H256) {
        let this = self.clone();
        let id = intent_id.to_string();

        self.supervisor
            .spawn(intent_id, chain_id, TaskStage::Confirmation, async move {
                let outcome = AssertUnwindSafe(this.watch_chain(&id, chain_id, tx_hash))
                    .catch_unwind()
                    .await;

                if outcome.is_err() {
                    crate::metrics::record_worker_panic();
                    crate::metrics::record_dispatch_failed(chain_id, "confirmation");
                    error!(intent_id = %id, chain_id, "Confirmation watch panicked");
                    this.merge(&id, chain_id, ChainUpdate::failed("confirmation watch panicked"))
                        .await;
                }
            });
    }

    async fn watch_chain(&self, intent_id: &str, chain_id: u64, tx_hash: H256) {
        let started = Instant::now();
        let result = self
            .gateway
            .await_confirmation(
                chain_id,
                tx_hash,
                self.config.confirmations,
                self.config.confirmation_timeout(),
            )
            .await;

        match result {
            Ok(receipt) => {
                crate::metrics::record_dispatch_confirmed(chain_id, started.elapsed().as_secs_f64());
                info!(
                    intent_id,
                    chain_id,
                    tx_hash = ?tx_hash,
                    block = receipt.block_number,
                    gas_used = %receipt.gas_used,
                    "Chain dispersal confirmed"
                );
                self.merge(
                    intent_id,
                    chain_id,
                    ChainUpdate::confirmed(receipt.gas_used.to_string()),
                )
                .await;
            }
            Err(e) => {
                crate::metrics::record_dispatch_failed(chain_id, "confirmation");
                if e.should_alert() {
                    error!(intent_id, chain_id, tx_hash = ?tx_hash, "Dispersal needs attention: {}", e);
                } else {
                    warn!(intent_id, chain_id, tx_hash = ?tx_hash, "Confirmation failed: {}", e);
                }
                self.merge(intent_id, chain_id, ChainUpdate::failed(failure_reason(&e)))
                    .await;
            }
        }
    }

    /// Merge one chain's report, retrying until the store accepts it.
    /// Only permanent errors give up.
    async fn merge(&self, intent_id: &str, chain_id: u64, update: ChainUpdate) -> Option<DepositIntent> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let patch = IntentPatch::Chain {
                chain_id,
                update: update.clone(),
            };

            match self.store.patch(intent_id, patch).await {
                Ok(patched) => {
                    log_merge(&patched, chain_id, &update);
                    return Some(patched.intent);
                }
                Err(e) if e.is_permanent() => {
                    error!(
                        intent_id,
                        chain_id,
                        status = ?update.status,
                        "Chain update cannot be merged: {}",
                        e
                    );
                    return None;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(intent_id, chain_id, attempt, "Merge contended, retrying: {}", e);
                    } else {
                        error!(intent_id, chain_id, attempt, "Merge failed, retrying: {}", e);
                    }
                    let steps = attempt.min(MAX_MERGE_BACKOFF_STEPS);
                    tokio::time::sleep(Duration::from_millis(self.config.merge_retry_delay_ms) * steps)
                        .await;
                }
            }
        }
    }
}

/// Human-readable reason stored in `errorMessage`
fn failure_reason(e: &DisperserError) -> String {
    match e {
        DisperserError::Dispatch { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn log_merge(patched: &Patched, chain_id: u64, update: &ChainUpdate) {
    let intent = &patched.intent;

    if !patched.applied {
        debug!(
            intent_id = %intent.id,
            chain_id,
            status = ?update.status,
            "Ignored out-of-order chain update"
        );
        return;
    }

    debug!(
        intent_id = %intent.id,
        chain_id,
        chain_status = ?update.status,
        status = %intent.status,
        version = intent.version,
        "Chain update merged"
    );

    if patched.became_terminal {
        crate::metrics::record_intent_finished(intent.status);
        info!(
            intent_id = %intent.id,
            status = %intent.status,
            phase = intent.global_phase.as_str(),
            "Intent reached terminal status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ConfirmationReceipt, DispatchReceipt, MockChainGateway};
    use crate::intent::tests::{deposit_event, TX_HASH};
    use crate::intent::{GlobalPhase, IntentStatus};
    use crate::state::{IntentStats, ListFilter, MemoryIntentStore, Page};

    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Gateway with per-chain scripted behavior
    #[derive(Default)]
    struct ScriptedGateway {
        fail_dispatch: HashSet<u64>,
        panic_dispatch: HashSet<u64>,
        /// Chains whose confirmation never resolves
        hang_confirmation: HashSet<u64>,
        timeout_confirmation: HashSet<u64>,
        revert_confirmation: HashSet<u64>,
        dispatched: DashMap<u64, U256>,
    }

    #[async_trait]
    impl ChainGateway for ScriptedGateway {
        async fn dispatch(
            &self,
            chain_id: u64,
            amount_raw: U256,
            _recipient: Address,
        ) -> DisperserResult<DispatchReceipt> {
            if self.panic_dispatch.contains(&chain_id) {
                panic!("scripted panic on chain {}", chain_id);
            }
            tokio::time::sleep(Duration::from_millis(chain_id % 5)).await;
            if self.fail_dispatch.contains(&chain_id) {
                return Err(DisperserError::Dispatch {
                    chain_id,
                    reason: "insufficient funds for gas".to_string(),
                });
            }
            self.dispatched.insert(chain_id, amount_raw);
            let tx_hash = H256::from_low_u64_be(chain_id);
            Ok(DispatchReceipt {
                tx_hash,
                explorer_url: format!("https://explorer/{}/tx/{:?}", chain_id, tx_hash),
            })
        }

        async fn await_confirmation(
            &self,
            chain_id: u64,
            tx_hash: H256,
            _confirmations: u64,
            timeout: Duration,
        ) -> DisperserResult<ConfirmationReceipt> {
            if self.hang_confirmation.contains(&chain_id) {
                futures::future::pending::<()>().await;
            }
            if self.timeout_confirmation.contains(&chain_id) {
                return Err(DisperserError::ConfirmationTimeout {
                    chain_id,
                    tx_hash: format!("{:?}", tx_hash),
                    timeout_secs: timeout.as_secs(),
                });
            }
            if self.revert_confirmation.contains(&chain_id) {
                return Err(DisperserError::TransactionReverted {
                    chain_id,
                    tx_hash: format!("{:?}", tx_hash),
                    block_number: 1_000 + chain_id,
                });
            }
            tokio::time::sleep(Duration::from_millis(chain_id % 7)).await;
            Ok(ConfirmationReceipt {
                block_number: 1_000 + chain_id,
                gas_used: U256::from(21_000u64 + chain_id),
                status: 1,
            })
        }
    }

    /// Memory store whose patches fail with scripted errors before succeeding
    struct FlakyStore {
        inner: MemoryIntentStore,
        /// Errors returned, last first, to patches that confirm a chain
        confirm_errors: Mutex<Vec<DisperserError>>,
        rejected: AtomicU32,
    }

    impl FlakyStore {
        fn new(confirm_errors: Vec<DisperserError>) -> Self {
            Self {
                inner: MemoryIntentStore::new(),
                confirm_errors: Mutex::new(confirm_errors),
                rejected: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl IntentStore for FlakyStore {
        async fn get(&self, id: &str) -> DisperserResult<Option<DepositIntent>> {
            self.inner.get(id).await
        }

        async fn create_from_deposit(&self, intent: DepositIntent) -> DisperserResult<DepositIntent> {
            self.inner.create_from_deposit(intent).await
        }

        async fn patch(&self, id: &str, patch: IntentPatch) -> DisperserResult<Patched> {
            if let IntentPatch::Chain { update, .. } = &patch {
                if update.status == ChainDispersalStatus::Confirmed {
                    let injected = self.confirm_errors.lock().unwrap().pop();
                    if let Some(e) = injected {
                        self.rejected.fetch_add(1, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
            self.inner.patch(id, patch).await
        }

        async fn list(
            &self,
            filter: &ListFilter,
            limit: usize,
            cursor: Option<&str>,
        ) -> DisperserResult<Page> {
            self.inner.list(filter, limit, cursor).await
        }

        async fn stats(&self) -> DisperserResult<IntentStats> {
            self.inner.stats().await
        }
    }

    fn orchestrator(gateway: Arc<dyn ChainGateway>) -> Arc<DispersalOrchestrator> {
        orchestrator_with_store(Arc::new(MemoryIntentStore::new()), gateway)
    }

    fn orchestrator_with_store(
        store: Arc<dyn IntentStore>,
        gateway: Arc<dyn ChainGateway>,
    ) -> Arc<DispersalOrchestrator> {
        Arc::new(DispersalOrchestrator::new(
            store,
            gateway,
            Arc::new(ChainRegistry::default()),
            DispersalConfig {
                merge_retry_delay_ms: 1,
                ..DispersalConfig::default()
            },
        ))
    }

    async fn wait_for_status(
        orchestrator: &DispersalOrchestrator,
        intent_id: &str,
        status: IntentStatus,
    ) -> DepositIntent {
        for _ in 0..500 {
            let intent = orchestrator.get_intent(intent_id).await.unwrap();
            if intent.status == status {
                return intent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("intent never reached {}", status);
    }

    #[test]
    fn test_to_token_units() {
        assert_eq!(to_token_units("0.75", 6).unwrap(), U256::from(750_000u64));
        assert_eq!(to_token_units("0.50", 6).unwrap(), U256::from(500_000u64));
        assert_eq!(to_token_units("20", 6).unwrap(), U256::from(20_000_000u64));
        assert!(matches!(
            to_token_units("abc", 6),
            Err(DisperserError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_two_chain_split_completes() {
        let gateway = Arc::new(ScriptedGateway::default());
        let orchestrator = orchestrator(gateway.clone());

        let (intent, created) = orchestrator
            .ingest_deposit(deposit_event(TX_HASH, &[(10, "0.75"), (137, "0.50")]))
            .await
            .unwrap();

        // The caller gets the committed QUEUED transition, not the outcome
        assert!(created);
        assert_eq!(intent.status, IntentStatus::DisperseQueued);
        assert_eq!(intent.global_phase, GlobalPhase::PreparingSwap);
        assert!(intent
            .chain_statuses
            .iter()
            .all(|c| c.status == ChainDispersalStatus::Queued));

        assert!(orchestrator.supervisor().wait_idle(Duration::from_secs(5)).await);

        let done = orchestrator.get_intent(TX_HASH).await.unwrap();
        assert_eq!(done.status, IntentStatus::Dispersed);
        assert_eq!(done.global_phase, GlobalPhase::Completed);
        assert!(done.completed_at.is_some());
        for chain in &done.chain_statuses {
            assert_eq!(chain.status, ChainDispersalStatus::Confirmed);
            assert!(chain.tx_hash.is_some());
            assert!(chain.explorer_url.is_some());
            assert_eq!(
                chain.gas_used,
                Some((21_000 + chain.chain_id()).to_string())
            );
        }

        assert_eq!(*gateway.dispatched.get(&10).unwrap(), U256::from(750_000u64));
        assert_eq!(*gateway.dispatched.get(&137).unwrap(), U256::from(500_000u64));
    }

    #[tokio::test]
    async fn test_one_failed_dispatch_fails_intent_early() {
        let gateway = Arc::new(ScriptedGateway {
            fail_dispatch: [137].into_iter().collect(),
            hang_confirmation: [10, 8453].into_iter().collect(),
            ..Default::default()
        });
        let orchestrator = orchestrator(gateway);

        orchestrator
            .ingest_deposit(deposit_event(
                TX_HASH,
                &[(10, "0.40"), (137, "0.40"), (8453, "0.45")],
            ))
            .await
            .unwrap();

        let failed = wait_for_status(&orchestrator, TX_HASH, IntentStatus::Failed).await;
        assert_eq!(failed.global_phase, GlobalPhase::Failed);
        assert!(failed.completed_at.is_some());

        let polygon = failed.chain(137).unwrap();
        assert_eq!(polygon.status, ChainDispersalStatus::Failed);
        assert_eq!(
            polygon.error_message.as_deref(),
            Some("insufficient funds for gas")
        );
        for sibling in [10, 8453] {
            let status = failed.chain(sibling).unwrap().status;
            assert!(
                matches!(
                    status,
                    ChainDispersalStatus::Queued | ChainDispersalStatus::Broadcasted
                ),
                "sibling {} was {:?}",
                sibling,
                status
            );
        }
    }

    #[tokio::test]
    async fn test_duplicate_ingest_dispatches_once() {
        let mut mock = MockChainGateway::new();
        mock.expect_dispatch().times(2).returning(|chain_id, _, _| {
            Ok(DispatchReceipt {
                tx_hash: H256::from_low_u64_be(chain_id),
                explorer_url: format!("https://explorer/tx/{}", chain_id),
            })
        });
        mock.expect_await_confirmation()
            .times(2)
            .returning(|_, _, confirmations, _| {
                assert_eq!(confirmations, 1);
                Ok(ConfirmationReceipt {
                    block_number: 7,
                    gas_used: U256::from(50_000u64),
                    status: 1,
                })
            });

        let orchestrator = orchestrator(Arc::new(mock));
        let event = deposit_event(TX_HASH, &[(10, "0.75"), (137, "0.50")]);

        let (first, created) = orchestrator.ingest_deposit(event.clone()).await.unwrap();
        assert!(created);
        assert!(orchestrator.supervisor().wait_idle(Duration::from_secs(5)).await);

        let (second, created_again) = orchestrator.ingest_deposit(event).await.unwrap();
        assert!(!created_again);
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, IntentStatus::Dispersed);
        assert_eq!(orchestrator.supervisor().outstanding(), 0);

        let page = orchestrator
            .store()
            .list(&Default::default(), 10, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_missing_intent() {
        let orchestrator = orchestrator(Arc::new(MockChainGateway::new()));
        let err = orchestrator.enqueue_dispersal("0xdoesnotexist").await.unwrap_err();
        assert!(matches!(err, DisperserError::IntentNotFound { .. }));
        assert_eq!(orchestrator.supervisor().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_invalid_event_creates_nothing() {
        let orchestrator = orchestrator(Arc::new(MockChainGateway::new()));
        let err = orchestrator
            .ingest_deposit(deposit_event(TX_HASH, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, DisperserError::Validation(_)));
        assert!(orchestrator.store().get(TX_HASH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_panic_is_contained_to_its_chain() {
        let gateway = Arc::new(ScriptedGateway {
            panic_dispatch: [10].into_iter().collect(),
            ..Default::default()
        });
        let orchestrator = orchestrator(gateway);

        orchestrator
            .ingest_deposit(deposit_event(TX_HASH, &[(10, "0.75"), (137, "0.50")]))
            .await
            .unwrap();
        assert!(orchestrator.supervisor().wait_idle(Duration::from_secs(5)).await);

        let intent = orchestrator.get_intent(TX_HASH).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Failed);
        let optimism = intent.chain(10).unwrap();
        assert_eq!(optimism.status, ChainDispersalStatus::Failed);
        assert_eq!(optimism.error_message.as_deref(), Some("worker panicked"));
        // The sibling still records its own outcome after the intent failed
        assert_eq!(
            intent.chain(137).unwrap().status,
            ChainDispersalStatus::Confirmed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wide_fan_out_loses_no_updates() {
        let chains: Vec<u64> = (1..=12).collect();
        let allocations: Vec<(u64, &str)> = chains.iter().map(|c| (*c, "0.10")).collect();
        let orchestrator = orchestrator(Arc::new(ScriptedGateway::default()));

        orchestrator
            .ingest_deposit(deposit_event(TX_HASH, &allocations))
            .await
            .unwrap();
        assert!(orchestrator.supervisor().wait_idle(Duration::from_secs(10)).await);

        let intent = orchestrator.get_intent(TX_HASH).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Dispersed);
        assert!(intent
            .chain_statuses
            .iter()
            .all(|c| c.status == ChainDispersalStatus::Confirmed && c.gas_used.is_some()));
        // enqueue + broadcast + confirm per chain
        assert_eq!(intent.version, 1 + 2 * chains.len() as u64);
    }

    #[tokio::test]
    async fn test_confirmation_failures_fail_their_chains() {
        let gateway = Arc::new(ScriptedGateway {
            timeout_confirmation: [10].into_iter().collect(),
            revert_confirmation: [137].into_iter().collect(),
            ..Default::default()
        });
        let orchestrator = orchestrator(gateway);

        orchestrator
            .ingest_deposit(deposit_event(TX_HASH, &[(10, "0.75"), (137, "0.50")]))
            .await
            .unwrap();
        assert!(orchestrator.supervisor().wait_idle(Duration::from_secs(5)).await);

        let intent = orchestrator.get_intent(TX_HASH).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Failed);
        assert_eq!(intent.global_phase, GlobalPhase::Failed);
        assert!(intent.completed_at.is_some());

        let optimism = intent.chain(10).unwrap();
        assert_eq!(optimism.status, ChainDispersalStatus::Failed);
        assert!(optimism.tx_hash.is_some());
        let reason = optimism.error_message.as_deref().unwrap();
        assert!(reason.starts_with("Timed out after 600s"), "{}", reason);

        let polygon = intent.chain(137).unwrap();
        assert_eq!(polygon.status, ChainDispersalStatus::Failed);
        let reason = polygon.error_message.as_deref().unwrap();
        assert!(reason.contains("reverted on chain 137 in block 1137"), "{}", reason);
    }

    #[tokio::test]
    async fn test_transient_store_errors_do_not_drop_updates() {
        let store = Arc::new(FlakyStore::new(vec![
            DisperserError::Internal("connection reset by peer".to_string()),
            DisperserError::Database(sqlx::Error::PoolTimedOut),
            DisperserError::Database(sqlx::Error::PoolTimedOut),
        ]));
        let orchestrator = orchestrator_with_store(store.clone(), Arc::new(ScriptedGateway::default()));

        orchestrator
            .ingest_deposit(deposit_event(TX_HASH, &[(10, "1")]))
            .await
            .unwrap();
        assert!(orchestrator.supervisor().wait_idle(Duration::from_secs(5)).await);

        assert_eq!(store.rejected.load(Ordering::SeqCst), 3);
        let intent = orchestrator.get_intent(TX_HASH).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Dispersed);
        assert_eq!(intent.global_phase, GlobalPhase::Completed);
        assert_eq!(
            intent.chain(10).unwrap().status,
            ChainDispersalStatus::Confirmed
        );
    }
}
