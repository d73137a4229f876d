use crate::config::StrategyConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Tolerance for float accumulation in the ledger
const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CapitalLimits {
    pub total_capital: f64,
    pub max_positions: usize,
}

impl CapitalLimits {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            total_capital: cfg.total_capital,
            max_positions: cfg.max_positions,
        }
    }
}

/// Process-wide capital counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CapitalLedger {
    pub deployed_capital: f64,
    pub open_position_count: usize,
}

/// Why a reservation was denied
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapitalRejection {
    #[error("insufficient capital: requested {requested:.2}, available {available:.2}")]
    InsufficientCapital { requested: f64, available: f64 },

    #[error("position limit reached ({max_positions} open)")]
    PositionLimit { max_positions: usize },

    #[error("invalid reservation amount {0}")]
    InvalidAmount(f64),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapitalError {
    #[error("release of {amount:.2} exceeds deployed capital {deployed:.2}")]
    CapitalUnderflow { amount: f64, deployed: f64 },

    #[error("release with no open positions")]
    PositionUnderflow,

    #[error("limits ({total_capital:.2}, {max_positions}) below current usage")]
    LimitsBelowUsage {
        total_capital: f64,
        max_positions: usize,
    },
}

/// Granted capital for one position
///
/// Must be handed back through [`CapitalAllocator::release`] when the order
/// fails or the position closes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub amount: f64,
}

#[derive(Debug)]
struct AllocatorState {
    limits: CapitalLimits,
    ledger: CapitalLedger,
}

/// Enforces the global capital and position-count limits
///
/// Reserve and release run inside one critical section so two concurrent
/// entry attempts can never both take the last slot. The lock is never held
/// across broker calls.
#[derive(Debug)]
pub struct CapitalAllocator {
    state: Mutex<AllocatorState>,
}

impl CapitalAllocator {
    pub fn new(limits: CapitalLimits) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                limits,
                ledger: CapitalLedger::default(),
            }),
        }
    }

    pub fn reserve(&self, amount: f64) -> Result<Reservation, CapitalRejection> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(CapitalRejection::InvalidAmount(amount));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let AllocatorState { limits, ledger } = &mut *state;

        if ledger.open_position_count >= limits.max_positions {
            return Err(CapitalRejection::PositionLimit {
                max_positions: limits.max_positions,
            });
        }
        if ledger.deployed_capital + amount > limits.total_capital + EPSILON {
            return Err(CapitalRejection::InsufficientCapital {
                requested: amount,
                available: (limits.total_capital - ledger.deployed_capital).max(0.0),
            });
        }

        ledger.deployed_capital += amount;
        ledger.open_position_count += 1;

        Ok(Reservation { amount })
    }

    pub fn release(&self, reservation: Reservation) -> Result<(), CapitalError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ledger = &mut state.ledger;

        if ledger.open_position_count == 0 {
            return Err(CapitalError::PositionUnderflow);
        }
        if reservation.amount > ledger.deployed_capital + EPSILON {
            return Err(CapitalError::CapitalUnderflow {
                amount: reservation.amount,
                deployed: ledger.deployed_capital,
            });
        }

        ledger.deployed_capital = (ledger.deployed_capital - reservation.amount).max(0.0);
        ledger.open_position_count -= 1;
        if ledger.open_position_count == 0 {
            ledger.deployed_capital = 0.0;
        }

        Ok(())
    }

    pub fn snapshot(&self) -> CapitalLedger {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ledger
    }

    pub fn limits(&self) -> CapitalLimits {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .limits
    }

    pub fn available(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.limits.total_capital - state.ledger.deployed_capital).max(0.0)
    }

    /// Rebuild counters from recovered open trades
    pub fn restore(&self, deployed_capital: f64, open_position_count: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if deployed_capital > state.limits.total_capital + EPSILON
            || open_position_count > state.limits.max_positions
        {
            tracing::warn!(
                deployed_capital,
                open_position_count,
                total_capital = state.limits.total_capital,
                max_positions = state.limits.max_positions,
                "Recovered positions exceed configured limits; new entries blocked until they close"
            );
        }
        state.ledger = CapitalLedger {
            deployed_capital,
            open_position_count,
        };
    }

    /// Apply new limits; rejected if current usage would violate them
    pub fn set_limits(&self, limits: CapitalLimits) -> Result<(), CapitalError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.ledger.deployed_capital > limits.total_capital + EPSILON
            || state.ledger.open_position_count > limits.max_positions
        {
            return Err(CapitalError::LimitsBelowUsage {
                total_capital: limits.total_capital,
                max_positions: limits.max_positions,
            });
        }
        state.limits = limits;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn allocator(total: f64, max_positions: usize) -> CapitalAllocator {
        CapitalAllocator::new(CapitalLimits {
            total_capital: total,
            max_positions,
        })
    }

    #[test]
    fn test_reserve_and_release() {
        let capital = allocator(10_000.0, 5);

        let r = capital.reserve(3_000.0).unwrap();
        assert_eq!(capital.snapshot().deployed_capital, 3_000.0);
        assert_eq!(capital.snapshot().open_position_count, 1);
        assert_eq!(capital.available(), 7_000.0);

        capital.release(r).unwrap();
        assert_eq!(capital.snapshot(), CapitalLedger::default());
    }

    #[test]
    fn test_capital_limit() {
        let capital = allocator(10_000.0, 10);

        capital.reserve(3_000.0).unwrap();
        capital.reserve(3_000.0).unwrap();
        capital.reserve(3_000.0).unwrap();

        let err = capital.reserve(3_000.0).unwrap_err();
        assert_eq!(
            err,
            CapitalRejection::InsufficientCapital {
                requested: 3_000.0,
                available: 1_000.0
            }
        );
    }

    #[test]
    fn test_position_limit() {
        let capital = allocator(100_000.0, 2);

        capital.reserve(1_000.0).unwrap();
        capital.reserve(1_000.0).unwrap();
        assert_eq!(
            capital.reserve(1_000.0),
            Err(CapitalRejection::PositionLimit { max_positions: 2 })
        );
    }

    #[test]
    fn test_invalid_amounts() {
        let capital = allocator(10_000.0, 5);
        assert!(capital.reserve(0.0).is_err());
        assert!(capital.reserve(-5.0).is_err());
        assert!(capital.reserve(f64::INFINITY).is_err());
    }

    #[test]
    fn test_release_underflow_is_an_error() {
        let capital = allocator(10_000.0, 5);
        assert_eq!(
            capital.release(Reservation { amount: 1.0 }),
            Err(CapitalError::PositionUnderflow)
        );

        capital.reserve(1_000.0).unwrap();
        assert!(matches!(
            capital.release(Reservation { amount: 5_000.0 }),
            Err(CapitalError::CapitalUnderflow { .. })
        ));
    }

    #[test]
    fn test_set_limits_rejects_below_usage() {
        let capital = allocator(10_000.0, 5);
        capital.reserve(6_000.0).unwrap();

        assert!(capital
            .set_limits(CapitalLimits {
                total_capital: 5_000.0,
                max_positions: 5
            })
            .is_err());
        assert_eq!(capital.limits().total_capital, 10_000.0);

        capital
            .set_limits(CapitalLimits {
                total_capital: 20_000.0,
                max_positions: 5,
            })
            .unwrap();
        assert_eq!(capital.available(), 14_000.0);
    }

    #[test]
    fn test_concurrent_reservations_never_oversubscribe() {
        use std::thread;

        let capital = Arc::new(allocator(240_000.0, 1_000));
        let handles: Vec<_> = (0..200)
            .map(|_| {
                let capital = Arc::clone(&capital);
                thread::spawn(move || capital.reserve(3_000.0).is_ok())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 80);
        let ledger = capital.snapshot();
        assert_eq!(ledger.open_position_count, 80);
        assert!(ledger.deployed_capital <= 240_000.0);
    }
}
