//! CPU budget accounting for one context.
//!
//! A budget meters interpreted steps against three independent thresholds:
//! a hard limit (forces `HardPause`), a soft limit (signals `SoftPause` once
//! per acknowledgment window), and a safe limit (query-only early warning).
//! Threshold comparisons are amortized behind a countdown check clock, so the
//! per-step cost is one increment and one decrement; a limit can therefore be
//! overshot by at most `max_check_interval` steps before it is caught.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default ceiling on the number of steps between threshold checks.
pub const DEFAULT_MAX_CHECK_INTERVAL: u64 = 256;

/// Signal produced when a budget threshold is crossed at a check point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSignal {
    /// Soft limit crossed and not yet acknowledged. Recoverable.
    Soft,
    /// Hard limit crossed. Terminates the current budget period.
    Hard,
}

/// Step-count budget state.
///
/// A limit of `0` means "no limit". `consumed` only grows; it is reset by
/// `clear_usage` and nothing else. The whole struct is plain data so a
/// microthread can snapshot it and swap it in and out of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuBudget {
    hard_limit: u64,
    soft_limit: u64,
    safe_limit: u64,
    consumed: u64,
    soft_signaled: bool,
    check_clock: u64,
    max_check_interval: u64,
}

impl Default for CpuBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHECK_INTERVAL)
    }
}

impl CpuBudget {
    pub fn new(max_check_interval: u64) -> Self {
        let mut budget = Self {
            hard_limit: 0,
            soft_limit: 0,
            safe_limit: 0,
            consumed: 0,
            soft_signaled: false,
            check_clock: 0,
            max_check_interval: max_check_interval.max(1),
        };
        budget.reschedule();
        budget
    }

    pub fn set_hard_limit(&mut self, n: u64) {
        self.hard_limit = n;
        self.reschedule();
    }

    pub fn set_soft_limit(&mut self, n: u64) {
        self.soft_limit = n;
        self.reschedule();
    }

    pub fn set_safe_limit(&mut self, n: u64) {
        self.safe_limit = n;
        self.reschedule();
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn safe_limit(&self) -> u64 {
        self.safe_limit
    }

    pub fn max_check_interval(&self) -> u64 {
        self.max_check_interval
    }

    pub fn usage(&self) -> u64 {
        self.consumed
    }

    /// Record `n` executed steps without burning the check clock. Used for
    /// batch accounting; ordinary stepping goes through `step`.
    pub fn record_steps(&mut self, n: u64) {
        self.consumed = self.consumed.saturating_add(n);
    }

    /// Record one executed step and run the threshold checks if the check
    /// clock has expired. This is the hot path: between check points it is
    /// one increment and one decrement.
    pub fn step(&mut self) -> Option<BudgetSignal> {
        self.consumed += 1;
        if self.check_clock > 0 {
            self.check_clock -= 1;
            return None;
        }
        self.reschedule();
        self.evaluate()
    }

    pub fn hard_exceeded(&self) -> bool {
        self.hard_limit > 0 && self.consumed >= self.hard_limit
    }

    /// True when the soft limit is crossed and has not yet been signaled.
    /// Once `signal_soft` runs, stays false until `clear_soft`.
    pub fn soft_exceeded(&self) -> bool {
        self.soft_limit > 0 && !self.soft_signaled && self.consumed >= self.soft_limit
    }

    pub fn safe_exceeded(&self) -> bool {
        self.safe_limit > 0 && self.consumed >= self.safe_limit
    }

    /// Acknowledge the soft limit so it does not signal again this window.
    pub fn signal_soft(&mut self) {
        self.soft_signaled = true;
        self.reschedule();
    }

    pub fn clear_soft(&mut self) {
        self.soft_signaled = false;
        self.reschedule();
    }

    /// Reset `consumed` to zero and reopen the soft-signal window.
    pub fn clear_usage(&mut self) {
        self.consumed = 0;
        self.soft_signaled = false;
        self.reschedule();
    }

    pub fn set_usage(&mut self, n: u64) {
        self.consumed = n;
        self.reschedule();
    }

    /// Steps remaining until the next mandatory threshold check.
    pub fn check_clock(&self) -> u64 {
        self.check_clock
    }

    fn evaluate(&mut self) -> Option<BudgetSignal> {
        if self.hard_exceeded() {
            debug!(consumed = self.consumed, limit = self.hard_limit, "hard budget limit crossed");
            return Some(BudgetSignal::Hard);
        }
        if self.soft_exceeded() {
            debug!(consumed = self.consumed, limit = self.soft_limit, "soft budget limit crossed");
            return Some(BudgetSignal::Soft);
        }
        None
    }

    /// Recompute the check clock: the smallest distance to a set threshold,
    /// capped at `max_check_interval`. A threshold that is already reached
    /// contributes zero, forcing a check on the very next step. The soft
    /// limit stops contributing once signaled; it would otherwise pin the
    /// clock at zero for the rest of the window.
    fn reschedule(&mut self) {
        let mut next = self.max_check_interval;
        let mut consider = |limit: u64| {
            if limit > 0 {
                next = next.min(limit.saturating_sub(self.consumed));
            }
        };
        consider(self.hard_limit);
        if !self.soft_signaled {
            consider(self.soft_limit);
        }
        consider(self.safe_limit);
        self.check_clock = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_steps(budget: &mut CpuBudget, n: u64) -> Option<BudgetSignal> {
        for _ in 0..n {
            if let Some(signal) = budget.step() {
                return Some(signal);
            }
        }
        None
    }

    #[test]
    fn unlimited_budget_never_signals() {
        let mut budget = CpuBudget::new(16);
        assert_eq!(run_steps(&mut budget, 1000), None);
        assert_eq!(budget.usage(), 1000);
    }

    #[test]
    fn consumed_is_monotone_until_cleared() {
        let mut budget = CpuBudget::new(16);
        budget.record_steps(10);
        budget.record_steps(5);
        assert_eq!(budget.usage(), 15);

        budget.clear_usage();
        assert_eq!(budget.usage(), 0);
    }

    #[test]
    fn hard_limit_signals_and_latches() {
        let mut budget = CpuBudget::new(8);
        budget.set_hard_limit(100);

        let signal = run_steps(&mut budget, 200);
        assert_eq!(signal, Some(BudgetSignal::Hard));
        assert!(budget.usage() >= 100);
        assert!(budget.hard_exceeded());

        // Stays exceeded until usage is cleared.
        budget.record_steps(50);
        assert!(budget.hard_exceeded());
        budget.clear_usage();
        assert!(!budget.hard_exceeded());
    }

    #[test]
    fn overshoot_is_bounded_by_check_interval() {
        let mut budget = CpuBudget::new(64);
        budget.set_hard_limit(100);

        let mut taken = 0u64;
        loop {
            taken += 1;
            if budget.step().is_some() {
                break;
            }
            assert!(taken < 100 + 64, "signal not raised within the bound");
        }
        assert!(budget.usage() >= 100);
        assert!(budget.usage() < 100 + 64);
    }

    #[test]
    fn soft_signal_is_idempotent_until_cleared() {
        let mut budget = CpuBudget::new(4);
        budget.set_soft_limit(10);

        assert_eq!(run_steps(&mut budget, 50), Some(BudgetSignal::Soft));
        assert!(budget.soft_exceeded());
        budget.signal_soft();

        // Keeps consuming, no second signal.
        assert!(!budget.soft_exceeded());
        assert_eq!(run_steps(&mut budget, 100), None);

        budget.clear_soft();
        assert!(budget.soft_exceeded());
        assert_eq!(run_steps(&mut budget, 10), Some(BudgetSignal::Soft));
    }

    #[test]
    fn safe_limit_is_query_only() {
        let mut budget = CpuBudget::new(4);
        budget.set_safe_limit(5);

        assert_eq!(run_steps(&mut budget, 20), None);
        assert!(budget.safe_exceeded());
    }

    #[test]
    fn setters_recompute_check_clock() {
        let mut budget = CpuBudget::new(256);
        assert_eq!(budget.check_clock(), 256);

        budget.set_hard_limit(10);
        assert_eq!(budget.check_clock(), 10);

        budget.record_steps(4);
        budget.set_soft_limit(6);
        assert_eq!(budget.check_clock(), 2);
    }

    #[test]
    fn hard_beats_soft_when_both_cross() {
        let mut budget = CpuBudget::new(4);
        budget.set_hard_limit(10);
        budget.set_soft_limit(10);

        assert_eq!(run_steps(&mut budget, 20), Some(BudgetSignal::Hard));
    }
}
