//! Lightning-settled 2-of-3 escrow engine
//!
//! Three parties (seller, buyer, tie-breaking arbiter) place a
//! custodial amount under a 2-of-3 release policy without trusting each
//! other. Funds settle through an external Lightning-style payment
//! network; this crate implements the escrow lifecycle, the
//! strict-order voting protocol deciding release vs refund, and the
//! settlement orchestration with idempotency and expiry guarantees.

pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod ratelimit;
pub mod sweeper;
pub mod vault;
pub mod voting;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
