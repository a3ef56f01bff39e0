use std::fmt;

use nudge_core::NotificationId;
use nudge_core::alerts::TOAST_CAPACITY;

use crate::{Outcome, SimulationResult};

// ── Core result types ─────────────────────────────────────────────────────────

/// Result of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        self.passed &= other.passed;
        self.violations.extend(other.violations);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The published unread count disagreed with the records it came with.
    UnreadCount {
        step: u64,
        reported: usize,
        recounted: usize,
    },
    /// The same composite key was visible twice.
    DuplicateRecord { step: u64, visible: usize, distinct: usize },
    /// More toasts were visible than the queue allows.
    ToastBound { step: u64, visible: usize },
    /// A read transition was still pending after its operation returned.
    PendingLeak { step: u64, pending: usize },
    /// The ledger saw a different number of deliveries than counterparts
    /// sent; self-authored events leaking in show up here.
    IngestCount { expected: u64, actual: u64 },
    /// The store holds a different number of records than distinct events
    /// were delivered.
    StoreCount { expected: usize, actual: usize },
    /// A message that arrived while its conversation was being marked read
    /// ended up read.
    ArrivalMarkedRead { step: u64 },
    /// A refresh loaded a different number of records than the store held.
    RefreshMismatch { step: u64, loaded: usize, store_len: usize },
    /// A visible record's read flag disagrees with the store of record.
    ReadStateDrift {
        id: NotificationId,
        ledger: bool,
        store: Option<bool>,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreadCount {
                step,
                reported,
                recounted,
            } => write!(
                f,
                "UnreadCount: step {step} reported {reported} unread, records say {recounted}"
            ),
            Self::DuplicateRecord {
                step,
                visible,
                distinct,
            } => write!(
                f,
                "DuplicateRecord: step {step} shows {visible} records but only {distinct} ids"
            ),
            Self::ToastBound { step, visible } => write!(
                f,
                "ToastBound: step {step} shows {visible} toasts (max {TOAST_CAPACITY})"
            ),
            Self::PendingLeak { step, pending } => {
                write!(f, "PendingLeak: step {step} left {pending} records pending")
            }
            Self::IngestCount { expected, actual } => write!(
                f,
                "IngestCount: expected {expected} deliveries, ledger saw {actual}"
            ),
            Self::StoreCount { expected, actual } => write!(
                f,
                "StoreCount: expected {expected} stored records, found {actual}"
            ),
            Self::ArrivalMarkedRead { step } => write!(
                f,
                "ArrivalMarkedRead: step {step} marked a message that arrived mid-confirm"
            ),
            Self::RefreshMismatch {
                step,
                loaded,
                store_len,
            } => write!(
                f,
                "RefreshMismatch: step {step} loaded {loaded} of {store_len} stored records"
            ),
            Self::ReadStateDrift { id, ledger, store } => write!(
                f,
                "ReadStateDrift: {id} is read={ledger} locally, store has {store:?}"
            ),
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks a finished [`SimulationResult`] against the ledger invariants.
pub struct ConsistencyOracle;

impl ConsistencyOracle {
    /// Per-step invariants: unread count, uniqueness, toast bound, and no
    /// pending transitions once a step has returned.
    #[must_use]
    pub fn check_observations(result: &SimulationResult) -> OracleResult {
        let mut violations = Vec::new();
        for obs in &result.observations {
            if obs.unread_count != obs.recounted_unread {
                violations.push(InvariantViolation::UnreadCount {
                    step: obs.step,
                    reported: obs.unread_count,
                    recounted: obs.recounted_unread,
                });
            }
            if obs.visible != obs.distinct_visible {
                violations.push(InvariantViolation::DuplicateRecord {
                    step: obs.step,
                    visible: obs.visible,
                    distinct: obs.distinct_visible,
                });
            }
            if obs.toasts > TOAST_CAPACITY {
                violations.push(InvariantViolation::ToastBound {
                    step: obs.step,
                    visible: obs.toasts,
                });
            }
            if obs.pending > 0 {
                violations.push(InvariantViolation::PendingLeak {
                    step: obs.step,
                    pending: obs.pending,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Every counterpart delivery reached the ledger exactly once and every
    /// distinct event was stored exactly once.
    #[must_use]
    pub fn check_idempotence(result: &SimulationResult) -> OracleResult {
        let mut violations = Vec::new();
        if result.ingest_attempts != result.expected_attempts {
            violations.push(InvariantViolation::IngestCount {
                expected: result.expected_attempts,
                actual: result.ingest_attempts,
            });
        }
        if result.store_len != result.distinct_events {
            violations.push(InvariantViolation::StoreCount {
                expected: result.distinct_events,
                actual: result.store_len,
            });
        }
        OracleResult::from_violations(violations)
    }

    /// Step outcomes that carry their own expectations.
    #[must_use]
    pub fn check_outcomes(result: &SimulationResult) -> OracleResult {
        let mut violations = Vec::new();
        for event in &result.trace {
            match event.outcome {
                Outcome::Raced {
                    arrival_unread: false,
                    ..
                } => violations.push(InvariantViolation::ArrivalMarkedRead { step: event.step }),
                Outcome::Refreshed { loaded, store_len } if loaded != store_len => {
                    violations.push(InvariantViolation::RefreshMismatch {
                        step: event.step,
                        loaded,
                        store_len,
                    });
                }
                _ => {}
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Once everything settled, each visible record agrees with the store.
    #[must_use]
    pub fn check_store_agreement(result: &SimulationResult) -> OracleResult {
        let violations = result
            .ledger_read
            .iter()
            .filter_map(|(id, &ledger)| {
                let store = result.store_read.get(id).copied();
                (store != Some(ledger)).then(|| InvariantViolation::ReadStateDrift {
                    id: id.clone(),
                    ledger,
                    store,
                })
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_all(result: &SimulationResult) -> OracleResult {
        Self::check_observations(result)
            .merge(Self::check_idempotence(result))
            .merge(Self::check_outcomes(result))
            .merge(Self::check_store_agreement(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, Observation, TraceEvent};
    use std::collections::BTreeMap;

    fn clean_result() -> SimulationResult {
        SimulationResult {
            seed: 0,
            trace: Vec::new(),
            observations: vec![Observation {
                step: 0,
                unread_count: 1,
                recounted_unread: 1,
                visible: 1,
                distinct_visible: 1,
                pending: 0,
                toasts: 1,
            }],
            expected_attempts: 1,
            ingest_attempts: 1,
            distinct_events: 1,
            store_len: 1,
            ledger_read: BTreeMap::from([(NotificationId::from("ntf-a"), false)]),
            store_read: BTreeMap::from([(NotificationId::from("ntf-a"), false)]),
            rejected_confirms: 0,
            races: 0,
            interesting_state_reached: false,
        }
    }

    #[test]
    fn clean_result_passes() {
        let oracle = ConsistencyOracle::check_all(&clean_result());
        assert!(oracle.passed, "{:?}", oracle.violations);
    }

    #[test]
    fn unread_mismatch_and_toast_overflow_are_flagged() {
        let mut result = clean_result();
        result.observations[0].recounted_unread = 0;
        result.observations[0].toasts = 4;

        let oracle = ConsistencyOracle::check_observations(&result);
        assert!(!oracle.passed);
        assert_eq!(oracle.violations.len(), 2);
    }

    #[test]
    fn self_echo_leak_is_an_ingest_count_violation() {
        let mut result = clean_result();
        result.ingest_attempts = 2;

        let oracle = ConsistencyOracle::check_idempotence(&result);
        assert_eq!(
            oracle.violations,
            vec![InvariantViolation::IngestCount {
                expected: 1,
                actual: 2
            }]
        );
    }

    #[test]
    fn read_arrival_is_flagged() {
        let mut result = clean_result();
        result.trace.push(TraceEvent {
            step: 3,
            action: Action::MarkDuringArrival {
                conversation: "conv-0".into(),
                event_id: "evt-9".into(),
            },
            outcome: Outcome::Raced {
                marked: 2,
                arrival_unread: false,
            },
        });

        let oracle = ConsistencyOracle::check_outcomes(&result);
        assert_eq!(
            oracle.violations,
            vec![InvariantViolation::ArrivalMarkedRead { step: 3 }]
        );
    }

    #[test]
    fn drift_from_store_is_flagged() {
        let mut result = clean_result();
        result.store_read.insert(NotificationId::from("ntf-a"), true);

        let oracle = ConsistencyOracle::check_store_agreement(&result);
        assert!(!oracle.passed);
        assert!(oracle.violations[0].to_string().starts_with("ReadStateDrift"));
    }
}
