use crate::error::VmError;

// ─── Gas Cost Constants ─────────────────────────────────────────────────────

/// Cost per guest statement, charged at basic-block entry by the
/// instrumentation pass.
pub const GAS_PER_STATEMENT: u64 = 1;

/// Cost for a single object or balance read.
pub const GAS_OBJECT_READ: u64 = 100;

/// Cost for a single object mutation.
pub const GAS_OBJECT_WRITE: u64 = 200;

/// Cost per byte returned to the guest.
pub const GAS_BYTE_READ: u64 = 1;

/// Cost per byte written to ledger state.
pub const GAS_BYTE_WRITE: u64 = 2;

/// Cost for a balance transfer.
pub const GAS_TRANSFER: u64 = 500;

/// Cost for emitting a structured event.
pub const GAS_EMIT_EVENT: u64 = 75;

/// Cost for creating an object.
pub const GAS_OBJECT_CREATE: u64 = 1_000;

/// Refund granted when an object is deleted.
pub const GAS_OBJECT_DELETE_REFUND: u64 = 500;

/// Base cost for a cross-contract call.
pub const GAS_CALL_BASE: u64 = 700;

/// Default gas limit when none is specified.
pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;

/// Maximum cross-contract call depth.
pub const MAX_CALL_DEPTH: u8 = 8;

// ─── Gas Meter ──────────────────────────────────────────────────────────────

/// Tracks gas for one invocation, shared by every nested call within it.
///
/// `remaining + used` equals the original limit at all times: a failed
/// consume or refund is fatal to the invocation and leaves the meter
/// untouched, so the error report reflects the state at the point of
/// failure.
#[derive(Debug, Clone)]
pub struct GasMeter {
    remaining: u64,
    used: u64,
}

impl GasMeter {
    /// Create a meter holding `limit` gas.
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: limit,
            used: 0,
        }
    }

    /// Consume `amount` gas. Consuming zero is a no-op; consuming more than
    /// remains fails without changing the meter.
    pub fn consume(&mut self, amount: u64) -> Result<(), VmError> {
        if amount == 0 {
            return Ok(());
        }
        if self.remaining < amount {
            return Err(VmError::OutOfGas {
                requested: amount,
                remaining: self.remaining,
                used: self.used,
            });
        }
        self.remaining -= amount;
        self.used += amount;
        Ok(())
    }

    /// Return up to `amount` gas to the meter, capped at what has been
    /// used. Returns the amount actually refunded. Used for the schedule's
    /// fixed refunds, which may exceed what a cheap invocation has consumed.
    pub fn refund_capped(&mut self, amount: u64) -> u64 {
        let granted = amount.min(self.used);
        self.used -= granted;
        self.remaining += granted;
        granted
    }

    /// Return `amount` gas to the meter. Refunding zero is a no-op;
    /// refunding more than was used fails without changing the meter.
    pub fn refund(&mut self, amount: u64) -> Result<(), VmError> {
        if amount == 0 {
            return Ok(());
        }
        if self.used < amount {
            return Err(VmError::InvalidRefund {
                requested: amount,
                used: self.used,
            });
        }
        self.used -= amount;
        self.remaining += amount;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// The original limit the meter was created with.
    pub fn limit(&self) -> u64 {
        self.remaining + self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_consume_and_refund() {
        let mut meter = GasMeter::new(1000);
        meter.consume(300).unwrap();
        assert_eq!(meter.used(), 300);
        assert_eq!(meter.remaining(), 700);

        meter.refund(100).unwrap();
        assert_eq!(meter.used(), 200);
        assert_eq!(meter.remaining(), 800);
    }

    #[test]
    fn test_consume_past_limit_leaves_meter_untouched() {
        let mut meter = GasMeter::new(100);
        meter.consume(60).unwrap();
        let err = meter.consume(50).unwrap_err();
        assert!(matches!(
            err,
            VmError::OutOfGas {
                requested: 50,
                remaining: 40,
                used: 60,
            }
        ));
        assert_eq!(meter.remaining(), 40);
        assert_eq!(meter.used(), 60);
    }

    #[test]
    fn test_refund_past_used_leaves_meter_untouched() {
        let mut meter = GasMeter::new(100);
        meter.consume(30).unwrap();
        let err = meter.refund(31).unwrap_err();
        assert!(matches!(
            err,
            VmError::InvalidRefund {
                requested: 31,
                used: 30,
            }
        ));
        assert_eq!(meter.used(), 30);
    }

    #[test]
    fn test_refund_capped_never_exceeds_used() {
        let mut meter = GasMeter::new(1000);
        meter.consume(259).unwrap();
        assert_eq!(meter.refund_capped(500), 259);
        assert_eq!(meter.used(), 0);
        assert_eq!(meter.remaining(), 1000);

        meter.consume(600).unwrap();
        assert_eq!(meter.refund_capped(500), 500);
        assert_eq!(meter.used(), 100);
    }

    #[test]
    fn test_zero_amounts_are_noops() {
        let mut meter = GasMeter::new(10);
        meter.consume(0).unwrap();
        meter.refund(0).unwrap();
        assert_eq!(meter.used(), 0);
        assert_eq!(meter.remaining(), 10);
    }

    #[test]
    fn test_exact_limit() {
        let mut meter = GasMeter::new(100);
        meter.consume(100).unwrap();
        assert_eq!(meter.remaining(), 0);
        assert!(meter.consume(1).is_err());
    }

    proptest! {
        /// remaining + used is invariant across any op sequence, successful
        /// or not.
        #[test]
        fn prop_meter_conserves_limit(
            limit in 0u64..10_000,
            ops in proptest::collection::vec((proptest::bool::ANY, 0u64..2_000), 0..50),
        ) {
            let mut meter = GasMeter::new(limit);
            for (is_consume, amount) in ops {
                let _ = if is_consume {
                    meter.consume(amount)
                } else {
                    meter.refund(amount)
                };
                prop_assert_eq!(meter.remaining() + meter.used(), limit);
            }
            prop_assert_eq!(meter.limit(), limit);
        }
    }
}
