//! Completion-polling cadence (§9): named constants rather than inlined
//! literals, since the pending/starting budgets are tied to the device's
//! poll period and must change in lockstep with it.

use std::time::Duration;

/// Time allowed while `MF_READY == Pending` before `first_stage_transfer`
/// fails with `TimedOut` (§4.5 step 5).
pub const PENDING_BUDGET: Duration = Duration::from_millis(100);

/// Time allowed while `MF_READY == Starting`, measured from the start of
/// the poll (§4.5 step 5).
pub const STARTING_BUDGET: Duration = Duration::from_millis(1500);
