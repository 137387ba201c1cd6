//! Transfer pacing and session admission
//!
//! Transfer bytes are paced with a virtual-time scheduler: every charged
//! chunk pushes a per-lane "link free again" instant forward, and the
//! charging task sleeps off whatever part of that debt exceeds the burst
//! allowance. A [`TransferBudget`] stacks lanes (the user-wide rate plus an
//! optional per-session cap), so the slowest lane governs. [`SessionGate`]
//! bounds concurrent sessions with slots released on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

// Debt below one burst is absorbed without sleeping, so interactive
// transfers are not nickel-and-dimed per chunk.
const BURST: Duration = Duration::from_secs(1);

/// One pacing lane: a byte rate expressed as virtual time
#[derive(Debug)]
struct Lane {
    bytes_per_second: u64,
    /// Instant at which previously charged bytes are fully paid off
    free_at: Mutex<Instant>,
}

impl Lane {
    fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second: bytes_per_second.max(1),
            free_at: Mutex::new(Instant::now()),
        }
    }

    fn cost_of(&self, bytes: u64) -> Duration {
        let nanos = (u128::from(bytes) * 1_000_000_000) / u128::from(self.bytes_per_second);
        Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
    }

    /// Advance the virtual clock by `bytes` and return the wait that keeps
    /// the caller within the configured rate
    fn charge(&self, bytes: u64) -> Duration {
        let cost = self.cost_of(bytes);
        let now = Instant::now();
        let mut free_at = self.free_at.lock().unwrap_or_else(PoisonError::into_inner);
        let paid_off = (*free_at).max(now) + cost;
        *free_at = paid_off;
        paid_off.saturating_duration_since(now + BURST)
    }
}

/// Pacing applied to one direction of one session's transfers
///
/// A budget with no lanes never waits. Each transfer chunk must clear
/// every lane before the pipe moves on, which is how a tight per-session
/// cap tightens a generous user-wide rate and never the other way around.
#[derive(Debug, Clone, Default)]
pub struct TransferBudget {
    lanes: Vec<Arc<Lane>>,
}

impl TransferBudget {
    /// A budget with no lanes: unlimited
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Stack a rate lane; `None` leaves the budget unchanged
    pub fn with_rate(mut self, bytes_per_second: Option<u64>) -> Self {
        if let Some(rate) = bytes_per_second {
            self.lanes.push(Arc::new(Lane::new(rate)));
        }
        self
    }

    /// Whether any lane constrains this budget
    pub fn is_limited(&self) -> bool {
        !self.lanes.is_empty()
    }

    /// Charge `bytes` against every lane, sleeping off any debt beyond the
    /// burst allowance
    pub async fn charge(&self, bytes: u64) {
        for lane in &self.lanes {
            let wait = lane.charge(bytes);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Admission gate bounding concurrent sessions
///
/// Claimed at accept time, before any TLS work; the slot releases when the
/// session's [`SessionSlot`] drops.
#[derive(Debug, Clone)]
pub struct SessionGate {
    active: Arc<AtomicUsize>,
    max_sessions: usize,
}

impl SessionGate {
    /// Allow up to `max_sessions` concurrent sessions
    pub fn new(max_sessions: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_sessions,
        }
    }

    /// Claim a slot if one is free
    pub fn try_enter(&self) -> Option<SessionSlot> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_sessions {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(SessionSlot {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// The configured maximum
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Sessions currently holding a slot
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// RAII slot handed out by a [`SessionGate`]
#[derive(Debug)]
pub struct SessionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_paces_to_rate() {
        let budget = TransferBudget::unlimited().with_rate(Some(1000));
        // The first second's worth rides the burst allowance.
        budget.charge(1000).await;

        let start = Instant::now();
        budget.charge(500).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        budget.charge(250).await;
        assert_eq!(start.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_pays_debt_down() {
        let budget = TransferBudget::unlimited().with_rate(Some(1000));
        budget.charge(1500).await;

        // Everything charged so far is paid off during the idle gap, so
        // the next chunk rides the burst again.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let start = Instant::now();
        budget.charge(800).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tightest_lane_governs() {
        let budget = TransferBudget::unlimited()
            .with_rate(Some(1_000_000))
            .with_rate(Some(1000));
        assert!(budget.is_limited());

        budget.charge(1000).await;
        let start = Instant::now();
        budget.charge(500).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_unlimited_budget_never_waits() {
        let budget = TransferBudget::unlimited();
        assert!(!budget.is_limited());
        budget.charge(u64::MAX / 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_none_rate_adds_no_lane() {
        let budget = TransferBudget::unlimited().with_rate(None);
        assert!(!budget.is_limited());
    }

    #[test]
    fn test_gate_claims_and_releases() {
        let gate = SessionGate::new(2);
        let first = gate.try_enter().expect("slot 1");
        let second = gate.try_enter().expect("slot 2");
        assert!(gate.try_enter().is_none());
        assert_eq!(gate.active(), 2);

        drop(first);
        assert_eq!(gate.active(), 1);
        let _third = gate.try_enter().expect("slot freed by drop");

        drop(second);
        assert_eq!(gate.max_sessions(), 2);
    }

    #[test]
    fn test_gate_clones_share_the_count() {
        let gate = SessionGate::new(1);
        let cloned = gate.clone();
        let _slot = gate.try_enter().expect("slot");
        assert!(cloned.try_enter().is_none());
        assert_eq!(cloned.active(), 1);
    }

    #[test]
    fn test_zero_capacity_gate_admits_nobody() {
        let gate = SessionGate::new(0);
        assert!(gate.try_enter().is_none());
    }
}
