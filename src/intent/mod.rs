//! Deposit intents and their per-chain dispersal records
//!
//! A `DepositIntent` is created once per deposit transaction and then only
//! changes through `IntentPatch`es applied inside a store's serialized
//! region. Applying a chain patch re-runs the aggregator over the full set of
//! chain statuses, so intent-level status never drifts from the chain data.

pub mod aggregate;

pub use aggregate::aggregate;

use crate::config::ChainRegistry;
use crate::error::{DisperserError, DisperserResult};
use crate::events::DepositEvent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Intent-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    DepositConfirmed,
    DisperseQueued,
    DisperseInProgress,
    Dispersed,
    Failed,
}

impl IntentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IntentStatus::Dispersed | IntentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntentStatus::DepositConfirmed => "DEPOSIT_CONFIRMED",
            IntentStatus::DisperseQueued => "DISPERSE_QUEUED",
            IntentStatus::DisperseInProgress => "DISPERSE_IN_PROGRESS",
            IntentStatus::Dispersed => "DISPERSED",
            IntentStatus::Failed => "FAILED",
        }
    }

    pub const ALL: [IntentStatus; 5] = [
        IntentStatus::DepositConfirmed,
        IntentStatus::DisperseQueued,
        IntentStatus::DisperseInProgress,
        IntentStatus::Dispersed,
        IntentStatus::Failed,
    ];
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = DisperserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DisperserError::Validation(format!("Unknown intent status: {}", s)))
    }
}

/// Coarse progress indicator shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalPhase {
    DepositConfirmed,
    PreparingSwap,
    Swapping,
    Dispersing,
    Completed,
    Failed,
}

impl GlobalPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            GlobalPhase::DepositConfirmed => "DEPOSIT_CONFIRMED",
            GlobalPhase::PreparingSwap => "PREPARING_SWAP",
            GlobalPhase::Swapping => "SWAPPING",
            GlobalPhase::Dispersing => "DISPERSING",
            GlobalPhase::Completed => "COMPLETED",
            GlobalPhase::Failed => "FAILED",
        }
    }
}

impl FromStr for GlobalPhase {
    type Err = DisperserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            GlobalPhase::DepositConfirmed,
            GlobalPhase::PreparingSwap,
            GlobalPhase::Swapping,
            GlobalPhase::Dispersing,
            GlobalPhase::Completed,
            GlobalPhase::Failed,
        ]
        .into_iter()
        .find(|phase| phase.as_str() == s)
        .ok_or_else(|| DisperserError::Validation(format!("Unknown global phase: {}", s)))
    }
}

/// Per-chain dispersal status
///
/// Partial order: NotStarted < Queued < Broadcasted < {Confirmed, Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainDispersalStatus {
    NotStarted,
    Queued,
    Broadcasted,
    Confirmed,
    Failed,
}

impl ChainDispersalStatus {
    fn rank(self) -> u8 {
        match self {
            ChainDispersalStatus::NotStarted => 0,
            ChainDispersalStatus::Queued => 1,
            ChainDispersalStatus::Broadcasted => 2,
            ChainDispersalStatus::Confirmed | ChainDispersalStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether moving from `self` to `next` respects the partial order
    pub fn can_advance_to(self, next: ChainDispersalStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Immutable intended split for one destination chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationAllocation {
    pub chain_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_symbol: Option<String>,
    /// Decimal string, e.g. "0.75"
    pub amount_usd: String,
}

/// Mutable per-chain progress record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDispersal {
    #[serde(flatten)]
    pub allocation: DestinationAllocation,
    pub status: ChainDispersalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChainDispersal {
    pub fn chain_id(&self) -> u64 {
        self.allocation.chain_id
    }
}

/// One user deposit and its planned dispersal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositIntent {
    /// Source deposit transaction hash, lower-cased
    pub id: String,
    pub user_address: String,
    pub source_chain_id: u64,
    pub source_tx_hash: String,
    pub source_block_number: u64,
    pub token_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_symbol: Option<String>,
    pub amount_in_token_raw: String,
    pub amount_in_usd: String,
    pub status: IntentStatus,
    pub global_phase: GlobalPhase,
    pub allocations: Vec<DestinationAllocation>,
    pub chain_statuses: Vec<ChainDispersal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by every applied patch
    pub version: u64,
}

/// Fields a chain worker reports for its own chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    pub status: ChainDispersalStatus,
    pub tx_hash: Option<String>,
    pub explorer_url: Option<String>,
    pub gas_used: Option<String>,
    pub error_message: Option<String>,
}

impl ChainUpdate {
    pub fn broadcasted(tx_hash: impl Into<String>, explorer_url: impl Into<String>) -> Self {
        Self {
            status: ChainDispersalStatus::Broadcasted,
            tx_hash: Some(tx_hash.into()),
            explorer_url: Some(explorer_url.into()),
            gas_used: None,
            error_message: None,
        }
    }

    pub fn confirmed(gas_used: impl Into<String>) -> Self {
        Self {
            status: ChainDispersalStatus::Confirmed,
            tx_hash: None,
            explorer_url: None,
            gas_used: Some(gas_used.into()),
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: ChainDispersalStatus::Failed,
            tx_hash: None,
            explorer_url: None,
            gas_used: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// A serialized mutation of one intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentPatch {
    /// NOT_STARTED chains move to QUEUED, intent moves to DISPERSE_QUEUED
    Enqueue,
    /// Merge one chain's report, then re-aggregate
    Chain { chain_id: u64, update: ChainUpdate },
}

/// What a single patch did to an intent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transition {
    /// False when the patch was a no-op (stale or out-of-order report)
    pub applied: bool,
    /// This patch moved the intent into DISPERSED or FAILED
    pub became_terminal: bool,
}

/// Result of applying a patch through a store
#[derive(Debug, Clone)]
pub struct Patched {
    pub intent: DepositIntent,
    pub applied: bool,
    pub became_terminal: bool,
}

impl Patched {
    pub fn new(intent: DepositIntent, transition: Transition) -> Self {
        Self {
            intent,
            applied: transition.applied,
            became_terminal: transition.became_terminal,
        }
    }
}

impl DepositIntent {
    /// Materialize a validated deposit event
    pub fn from_deposit(event: &DepositEvent, registry: &ChainRegistry, now: DateTime<Utc>) -> Self {
        let allocations: Vec<DestinationAllocation> = event
            .allocations
            .iter()
            .map(|alloc| {
                let chain = registry.get(alloc.dest_chain_id).ok();
                DestinationAllocation {
                    chain_id: alloc.dest_chain_id,
                    chain_name: chain.map(|c| c.name.clone()),
                    native_symbol: chain.map(|c| c.native_symbol.clone()),
                    amount_usd: alloc.amount_usd.clone(),
                }
            })
            .collect();

        let chain_statuses = allocations
            .iter()
            .map(|allocation| ChainDispersal {
                allocation: allocation.clone(),
                status: ChainDispersalStatus::NotStarted,
                tx_hash: None,
                explorer_url: None,
                gas_used: None,
                error_message: None,
                updated_at: now,
            })
            .collect();

        Self {
            id: event.intent_id(),
            user_address: event.user.clone(),
            source_chain_id: event.chain_id,
            source_tx_hash: event.tx_hash.clone(),
            source_block_number: event.block_number,
            token_address: event.token_address.clone(),
            token_symbol: event.token_symbol.clone(),
            amount_in_token_raw: event.amount_token_raw.clone(),
            amount_in_usd: event.amount_usd.clone(),
            status: IntentStatus::DepositConfirmed,
            global_phase: GlobalPhase::DepositConfirmed,
            allocations,
            chain_statuses,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainDispersal> {
        self.chain_statuses.iter().find(|c| c.chain_id() == chain_id)
    }

    /// Apply a patch in place and report the resulting transition
    pub fn apply(&mut self, patch: &IntentPatch, now: DateTime<Utc>) -> DisperserResult<Transition> {
        let was_terminal = self.status.is_terminal();
        let applied = match patch {
            IntentPatch::Enqueue => self.apply_enqueue(now),
            IntentPatch::Chain { chain_id, update } => {
                self.apply_chain_update(*chain_id, update, now)?
            }
        };

        if applied {
            self.updated_at = now;
            self.version += 1;
        }
        Ok(Transition {
            applied,
            became_terminal: applied && !was_terminal && self.status.is_terminal(),
        })
    }

    fn apply_enqueue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != IntentStatus::DepositConfirmed {
            return false;
        }

        for chain in &mut self.chain_statuses {
            if chain.status == ChainDispersalStatus::NotStarted {
                chain.status = ChainDispersalStatus::Queued;
                chain.updated_at = now;
            }
        }
        self.status = IntentStatus::DisperseQueued;
        self.global_phase = GlobalPhase::PreparingSwap;
        true
    }

    fn apply_chain_update(
        &mut self,
        chain_id: u64,
        update: &ChainUpdate,
        now: DateTime<Utc>,
    ) -> DisperserResult<bool> {
        let chain = self
            .chain_statuses
            .iter_mut()
            .find(|c| c.chain_id() == chain_id)
            .ok_or_else(|| DisperserError::UnknownChain {
                intent_id: self.id.clone(),
                chain_id,
            })?;

        if !chain.status.can_advance_to(update.status) {
            return Ok(false);
        }

        chain.status = update.status;
        if update.tx_hash.is_some() {
            chain.tx_hash = update.tx_hash.clone();
        }
        if update.explorer_url.is_some() {
            chain.explorer_url = update.explorer_url.clone();
        }
        if update.gas_used.is_some() {
            chain.gas_used = update.gas_used.clone();
        }
        if update.error_message.is_some() {
            chain.error_message = update.error_message.clone();
        }
        chain.updated_at = now;

        self.reaggregate(now);
        Ok(true)
    }

    /// Recompute status and phase from scratch; terminal intents are frozen
    fn reaggregate(&mut self, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }

        if let Some((status, phase)) = aggregate(self.chain_statuses.iter().map(|c| c.status)) {
            self.status = status;
            self.global_phase = phase;
            if status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        }
    }
}
