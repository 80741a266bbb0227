// Budget Enforcement
// Run-wide cost/iteration ledger shared by all sessions, plus per-session guards

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::BudgetSnapshot;

/// Costs are tracked in integer micro-dollars so they can live in atomics.
const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

fn to_micros(dollars: f64) -> u64 {
    if !dollars.is_finite() || dollars <= 0.0 {
        return 0;
    }
    (dollars * MICROS_PER_DOLLAR).round() as u64
}

fn to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// A per-session cap; only that session stops.
    Session,
    /// The shared run ledger; the whole run stops.
    Run,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetScope::Session => f.write_str("session"),
            BudgetScope::Run => f.write_str("run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("budget exceeded ({scope}): {reason}")]
pub struct BudgetExceeded {
    pub scope: BudgetScope,
    pub reason: String,
}

impl BudgetExceeded {
    fn run(reason: impl Into<String>) -> Self {
        Self {
            scope: BudgetScope::Run,
            reason: reason.into(),
        }
    }

    fn session(reason: impl Into<String>) -> Self {
        Self {
            scope: BudgetScope::Session,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// The run's single budget. Settled spending and in-flight reservations are
/// kept apart: a reservation that only collides with sibling reservations
/// waits for them to settle, and only settled spending can exhaust the run.
#[derive(Debug)]
pub struct BudgetLedger {
    max_cost_micros: u64,
    max_iterations: u32,
    /// Settled spending. Never exceeds the cap.
    spent_micros: AtomicU64,
    /// Settled spending plus outstanding reservations.
    booked_micros: AtomicU64,
    iterations_used: AtomicU32,
    exhausted: AtomicBool,
    settled: Notify,
}

enum Booking {
    Booked,
    Busy,
    Refused(BudgetExceeded),
}

impl BudgetLedger {
    pub fn new(max_cost: f64, max_iterations: u32) -> Self {
        Self {
            max_cost_micros: to_micros(max_cost),
            max_iterations,
            spent_micros: AtomicU64::new(0),
            booked_micros: AtomicU64::new(0),
            iterations_used: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            settled: Notify::new(),
        }
    }

    pub fn restore(snapshot: &BudgetSnapshot) -> Self {
        let ledger = Self::new(snapshot.max_cost, snapshot.max_iterations);
        let spent = to_micros(snapshot.spent).min(ledger.max_cost_micros);
        ledger.spent_micros.store(spent, Ordering::SeqCst);
        ledger.booked_micros.store(spent, Ordering::SeqCst);
        ledger
            .iterations_used
            .store(snapshot.iterations_used.min(snapshot.max_iterations), Ordering::SeqCst);
        ledger.exhausted.store(snapshot.exhausted, Ordering::SeqCst);
        ledger
    }

    pub fn spent(&self) -> f64 {
        to_dollars(self.spent_micros.load(Ordering::SeqCst))
    }

    pub fn iterations_used(&self) -> u32 {
        self.iterations_used.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            max_cost: to_dollars(self.max_cost_micros),
            max_iterations: self.max_iterations,
            spent: self.spent(),
            iterations_used: self.iterations_used(),
            exhausted: self.is_exhausted(),
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> f64 {
        to_dollars(
            self.booked_micros
                .load(Ordering::SeqCst)
                .saturating_sub(self.spent_micros.load(Ordering::SeqCst)),
        )
    }

    fn mark_exhausted(&self, reason: String) -> BudgetExceeded {
        self.exhausted.store(true, Ordering::SeqCst);
        self.settled.notify_waiters();
        BudgetExceeded::run(reason)
    }

    fn try_book(&self, micros: u64) -> Booking {
        if self.is_exhausted() {
            return Booking::Refused(BudgetExceeded::run("run budget already exhausted"));
        }
        let max = self.max_cost_micros;
        let booked = self
            .booked_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |booked| {
                booked.checked_add(micros).filter(|next| *next <= max)
            });
        if booked.is_ok() {
            return Booking::Booked;
        }
        let spent = self.spent_micros.load(Ordering::SeqCst);
        if spent >= max {
            Booking::Refused(self.mark_exhausted(format!(
                "the ${:.6} run budget is used up",
                to_dollars(max)
            )))
        } else if spent.saturating_add(micros) > max {
            Booking::Refused(BudgetExceeded::session(format!(
                "estimated ${:.6} is more than the ${:.6} left in the run budget",
                to_dollars(micros),
                to_dollars(max - spent)
            )))
        } else {
            Booking::Busy
        }
    }

    /// Books `micros` against the cap, waiting while only other sessions'
    /// outstanding reservations stand in the way.
    async fn book(&self, micros: u64) -> Result<(), BudgetExceeded> {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            match self.try_book(micros) {
                Booking::Booked => return Ok(()),
                Booking::Refused(err) => return Err(err),
                Booking::Busy => settled.await,
            }
        }
    }

    fn unbook(&self, micros: u64) {
        let _ = self
            .booked_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |booked| {
                Some(booked.saturating_sub(micros))
            });
        self.settled.notify_waiters();
    }

    /// Swaps a reservation for its actual cost. Spending is clamped at the
    /// cap; hitting the clamp exhausts the run. Returns the amount charged.
    fn settle(&self, reserved: u64, actual: u64) -> (u64, Option<BudgetExceeded>) {
        let max = self.max_cost_micros;
        let mut added = 0;
        let _ = self
            .spent_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |spent| {
                let next = spent.saturating_add(actual).min(max);
                added = next.saturating_sub(spent);
                Some(next)
            });
        let _ = self
            .booked_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |booked| {
                Some(booked.saturating_sub(reserved).saturating_add(added))
            });
        if added < actual {
            let err = self.mark_exhausted(format!(
                "actual cost overshot the ${:.6} cap",
                to_dollars(max)
            ));
            return (added, Some(err));
        }
        self.settled.notify_waiters();
        (added, None)
    }

    fn try_tick(&self) -> Result<(), BudgetExceeded> {
        let max = self.max_iterations;
        self.iterations_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| self.mark_exhausted(format!("iteration cap of {} reached", max)))
    }
}

// ============================================================================
// Per-session guard
// ============================================================================

/// An accepted reservation. Settle it with [`BudgetGuard::commit`] or return
/// it with [`BudgetGuard::release`].
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    micros: u64,
}

/// A session's handle on the shared ledger. Once any check fails the guard
/// is tripped and every later call fails with the same error.
#[derive(Debug)]
pub struct BudgetGuard {
    ledger: Arc<BudgetLedger>,
    session_cap_micros: Option<u64>,
    session_max_iterations: Option<u32>,
    session_spent: AtomicU64,
    session_iterations: AtomicU32,
    tripped: Mutex<Option<BudgetExceeded>>,
}

impl BudgetGuard {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        max_session_cost: Option<f64>,
        max_session_iterations: Option<u32>,
    ) -> Self {
        Self {
            ledger,
            session_cap_micros: max_session_cost.map(to_micros),
            session_max_iterations: max_session_iterations,
            session_spent: AtomicU64::new(0),
            session_iterations: AtomicU32::new(0),
            tripped: Mutex::new(None),
        }
    }

    /// Seeds usage carried over from a snapshot.
    pub fn with_usage(self, cost_spent: f64, iterations: u32) -> Self {
        let spent = to_micros(cost_spent);
        let spent = self.session_cap_micros.map_or(spent, |cap| spent.min(cap));
        self.session_spent.store(spent, Ordering::SeqCst);
        self.session_iterations.store(iterations, Ordering::SeqCst);
        self
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn session_spent(&self) -> f64 {
        to_dollars(self.session_spent.load(Ordering::SeqCst))
    }

    pub fn session_iterations(&self) -> u32 {
        self.session_iterations.load(Ordering::SeqCst)
    }

    pub fn tripped(&self) -> Option<BudgetExceeded> {
        self.tripped.lock().ok().and_then(|t| t.clone())
    }

    fn trip(&self, err: BudgetExceeded) -> BudgetExceeded {
        if let Ok(mut tripped) = self.tripped.lock() {
            if tripped.is_none() {
                *tripped = Some(err.clone());
            }
        }
        err
    }

    fn check_tripped(&self) -> Result<(), BudgetExceeded> {
        match self.tripped() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Reserves the estimated cost of one call. Waits while sibling
    /// reservations hold the remaining budget; callers race this against
    /// their cancellation token.
    pub async fn reserve(&self, estimated_cost: f64) -> Result<Reservation, BudgetExceeded> {
        self.check_tripped()?;
        let micros = to_micros(estimated_cost);
        if let Some(cap) = self.session_cap_micros {
            let spent = self.session_spent.load(Ordering::SeqCst);
            if spent.saturating_add(micros) > cap {
                return Err(self.trip(BudgetExceeded::session(format!(
                    "reserving ${:.6} would exceed the session cap of ${:.6}",
                    to_dollars(micros),
                    to_dollars(cap)
                ))));
            }
        }
        self.ledger.book(micros).await.map_err(|e| self.trip(e))?;
        Ok(Reservation { micros })
    }

    /// Replaces the reserved amount with the actual cost. The charge is
    /// clamped at the session cap and then at the run cap; either clamp
    /// trips the guard. Returns the amount charged.
    pub fn commit(&self, reservation: Reservation, actual_cost: f64) -> Result<f64, BudgetExceeded> {
        let mut actual = to_micros(actual_cost);
        let mut capped = None;
        if let Some(cap) = self.session_cap_micros {
            let room = cap.saturating_sub(self.session_spent.load(Ordering::SeqCst));
            if actual > room {
                actual = room;
                capped = Some(BudgetExceeded::session(format!(
                    "session spending reached its cap of ${:.6}",
                    to_dollars(cap)
                )));
            }
        }
        let (charged, overshoot) = self.ledger.settle(reservation.micros, actual);
        self.session_spent.fetch_add(charged, Ordering::SeqCst);
        if let Some(err) = overshoot.or(capped) {
            return Err(self.trip(err));
        }
        Ok(to_dollars(charged))
    }

    /// Returns an unused reservation (the call failed before costing anything).
    pub fn release(&self, reservation: Reservation) {
        self.ledger.unbook(reservation.micros);
    }

    pub fn iteration_tick(&self) -> Result<(), BudgetExceeded> {
        self.check_tripped()?;
        if let Some(max) = self.session_max_iterations {
            let used = self.session_iterations.load(Ordering::SeqCst);
            if used >= max {
                return Err(self.trip(BudgetExceeded::session(format!(
                    "session iteration cap of {} reached",
                    max
                ))));
            }
        }
        self.ledger.try_tick().map_err(|e| self.trip(e))?;
        self.session_iterations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
