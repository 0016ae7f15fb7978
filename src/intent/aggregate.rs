//! Intent-level status derived from per-chain statuses

use super::{ChainDispersalStatus, GlobalPhase, IntentStatus};

/// Derive `(status, phase)` from the full multiset of chain statuses.
///
/// Rows are evaluated in order: all confirmed, any failed, any broadcasted,
/// any queued. `None` means "leave unchanged" (all chains still NOT_STARTED,
/// or no chains at all). The result depends only on which statuses are
/// present, so it is independent of ordering and safe to re-run.
pub fn aggregate<I>(statuses: I) -> Option<(IntentStatus, GlobalPhase)>
where
    I: IntoIterator<Item = ChainDispersalStatus>,
{
    let mut total = 0usize;
    let mut confirmed = 0usize;
    let mut any_failed = false;
    let mut any_broadcasted = false;
    let mut any_queued = false;

    for status in statuses {
        total += 1;
        match status {
            ChainDispersalStatus::Confirmed => confirmed += 1,
            ChainDispersalStatus::Failed => any_failed = true,
            ChainDispersalStatus::Broadcasted => any_broadcasted = true,
            ChainDispersalStatus::Queued => any_queued = true,
            ChainDispersalStatus::NotStarted => {}
        }
    }

    if total == 0 {
        None
    } else if confirmed == total {
        Some((IntentStatus::Dispersed, GlobalPhase::Completed))
    } else if any_failed {
        Some((IntentStatus::Failed, GlobalPhase::Failed))
    } else if any_broadcasted {
        Some((IntentStatus::DisperseInProgress, GlobalPhase::Dispersing))
    } else if any_queued {
        Some((IntentStatus::DisperseInProgress, GlobalPhase::PreparingSwap))
    } else {
        None
    }
}
