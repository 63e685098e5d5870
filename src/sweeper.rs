//! Expiry sweeper
//!
//! Forces escrows whose deadline has passed into the terminal refund
//! path: status `Expired`, `resolved_outcome = refund`. Runs
//! opportunistically on every inbound action, which makes the ordinary
//! claim/payout path the sole settlement mechanism even for abandoned
//! escrows.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::{ledger::Ledger, voting, EscrowResult};

pub struct Sweeper {
    ledger: Arc<Ledger>,
}

impl Sweeper {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Expire every overdue non-terminal escrow. Returns the ids that
    /// were transitioned so callers can drop any per-escrow state tied
    /// to them. A conditional-update conflict means another request
    /// raced us to the same escrow; that escrow is skipped.
    pub fn sweep(&self) -> EscrowResult<Vec<u64>> {
        let now = Utc::now();
        let overdue = self.ledger.list_overdue(now)?;
        let mut expired = Vec::new();

        for escrow in overdue {
            match self
                .ledger
                .update_conditional(escrow.id, escrow.status, voting::apply_expiry)
            {
                Ok(_) => {
                    info!(escrow_id = escrow.id, "escrow expired, forced refund");
                    expired.push(escrow.id);
                }
                Err(e) => {
                    warn!(escrow_id = escrow.id, "expiry sweep skipped escrow: {}", e);
                }
            }
        }

        Ok(expired)
    }
}
