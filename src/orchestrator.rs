//! Settlement orchestrator
//!
//! Coordinates the steps that move real value through the settlement
//! network: locking the custodial amount and paying out the winner.
//! Callers are never blocked on network settlement latency; the escrow
//! is marked `Locked`/`Completed` optimistically on dispatch and a
//! detached task awaits the definitive outcome for logging only. A
//! failed confirmation does not reverse the optimistic state; that
//! asymmetry is a known recovery gap and needs operational monitoring.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    ledger::Ledger,
    models::{Escrow, EscrowStatus, LockMode, Role},
    network::{InvoiceHandle, OperationHandle, PaymentNetwork},
    vault::SecretVault,
    voting, EscrowResult,
};

/// Configuration for the settlement orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Production mode: direct locks are refused
    pub production: bool,
    /// How far the deadline extends when funds are locked, in hours
    pub lock_extension_hours: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            production: false,
            lock_extension_hours: 72,
        }
    }
}

/// Result of a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    pub escrow: Escrow,
    /// Plaintext custodial secret; present only for direct-mode locks,
    /// returned exactly once.
    pub secret: Option<String>,
    /// External-mode locks settle through a payout instead of a secret.
    pub payout_ready: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    ledger: Arc<Ledger>,
    network: Arc<dyn PaymentNetwork>,
    vault: Arc<SecretVault>,
    /// Invoices issued for pending external locks, keyed by escrow id.
    /// Process-local; a restart abandons the pending invoice and the
    /// seller re-requests one.
    pending_locks: RwLock<HashMap<u64, OperationHandle>>,
    /// Escrows with a payout currently dispatching. Prevents
    /// double-submission within one process lifetime.
    inflight_payouts: RwLock<HashSet<u64>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ledger: Arc<Ledger>,
        network: Arc<dyn PaymentNetwork>,
        vault: Arc<SecretVault>,
    ) -> Self {
        Self {
            config,
            ledger,
            network,
            vault,
            pending_locks: RwLock::new(HashMap::new()),
            inflight_payouts: RwLock::new(HashSet::new()),
        }
    }

    /// Extend the deadline on lock. The deadline only ever moves forward.
    fn extended_expiry(&self, escrow: &Escrow) -> chrono::DateTime<Utc> {
        let extended = Utc::now() + Duration::hours(self.config.lock_extension_hours);
        extended.max(escrow.expires_at)
    }

    /// Step one of an external lock: request an invoice for the escrow
    /// amount and hand it to the seller for payment.
    pub async fn begin_external_lock(
        &self,
        escrow_id: u64,
        caller: &str,
    ) -> EscrowResult<InvoiceHandle> {
        let escrow = self.ledger.require(escrow_id)?;
        voting::check_lock(&escrow, caller)?;

        let memo = format!("escrow {} lock", escrow_id);
        let handle = self.network.create_invoice(escrow.amount_msat, &memo).await?;

        info!(
            escrow_id,
            operation = %handle.operation,
            "issued lock invoice"
        );
        self.pending_locks
            .write()
            .await
            .insert(escrow_id, handle.operation.clone());

        Ok(handle)
    }

    /// Step two: the seller reports the invoice as paid. The escrow is
    /// marked `Locked` immediately; definitive settlement is verified in
    /// the background and logged.
    pub async fn confirm_external_lock(&self, escrow_id: u64, caller: &str) -> EscrowResult<Escrow> {
        let escrow = self.ledger.require(escrow_id)?;
        voting::check_lock(&escrow, caller)?;

        let operation = self
            .pending_locks
            .write()
            .await
            .remove(&escrow_id)
            .ok_or_else(|| {
                EscrowError::state(
                    escrow_id,
                    escrow.status.to_string(),
                    "no lock invoice pending for this escrow".to_string(),
                )
            })?;

        // The stored payload for an external lock is the sealed network
        // operation reference, not a payable value.
        let sealed = self.vault.seal(&operation.0)?;
        let expires_at = self.extended_expiry(&escrow);

        let updated = self
            .ledger
            .update_conditional(escrow_id, EscrowStatus::Funded, |e| {
                e.status = EscrowStatus::Locked;
                e.lock_mode = Some(LockMode::External);
                e.locked_secret = Some(sealed);
                e.locked_at = Some(Utc::now());
                e.expires_at = expires_at;
            })?;

        info!(escrow_id, "escrow locked (external, settlement pending)");
        self.spawn_settlement_watch(escrow_id, operation);

        Ok(updated)
    }

    /// Drop pending lock invoices for escrows that left the lockable
    /// state, so abandoned locks do not accumulate for the process
    /// lifetime. Called with the ids the expiry sweep transitioned.
    pub async fn evict_pending_locks(&self, escrow_ids: &[u64]) {
        if escrow_ids.is_empty() {
            return;
        }
        let mut pending = self.pending_locks.write().await;
        for id in escrow_ids {
            if let Some(operation) = pending.remove(id) {
                warn!(
                    escrow_id = id,
                    operation = %operation,
                    "dropped pending lock invoice for expired escrow"
                );
            }
        }
    }

    /// Detached task: await definitive settlement of the lock invoice.
    /// Logs the outcome either way; a failed settlement after the
    /// optimistic `Locked` marking is not reversed here.
    fn spawn_settlement_watch(&self, escrow_id: u64, operation: OperationHandle) {
        let network = Arc::clone(&self.network);
        let correlation = Uuid::new_v4();
        tokio::spawn(async move {
            match network.await_settlement(&operation).await {
                Ok(true) => {
                    info!(escrow_id, %correlation, "lock settlement confirmed");
                }
                Ok(false) => {
                    error!(
                        escrow_id,
                        %correlation,
                        operation = %operation,
                        "lock settlement NOT confirmed; escrow is marked locked but funds may be missing"
                    );
                }
                Err(e) => {
                    error!(
                        escrow_id,
                        %correlation,
                        operation = %operation,
                        "lock settlement verification failed: {}", e
                    );
                }
            }
        });
    }

    /// Lock with a caller-supplied secret, bypassing the network.
    /// Refused outright in production configuration.
    pub async fn direct_lock(
        &self,
        escrow_id: u64,
        caller: &str,
        secret: &str,
    ) -> EscrowResult<Escrow> {
        if self.config.production {
            return Err(EscrowError::validation(
                "direct lock is not available in production",
            ));
        }
        if secret.trim().is_empty() {
            return Err(EscrowError::validation("lock secret cannot be empty"));
        }

        let escrow = self.ledger.require(escrow_id)?;
        voting::check_lock(&escrow, caller)?;

        let sealed = self.vault.seal(secret)?;
        let expires_at = self.extended_expiry(&escrow);

        let updated = self
            .ledger
            .update_conditional(escrow_id, EscrowStatus::Funded, |e| {
                e.status = EscrowStatus::Locked;
                e.lock_mode = Some(LockMode::Direct);
                e.locked_secret = Some(sealed);
                e.locked_at = Some(Utc::now());
                e.expires_at = expires_at;
            })?;

        warn!(escrow_id, "escrow locked in direct mode (non-production path)");
        Ok(updated)
    }

    /// Claim by the resolution winner. Clears the stored secret in the
    /// same update that moves to `Claimed`; a direct-mode secret is
    /// decrypted and returned exactly here, an external-mode claim
    /// signals payout readiness instead.
    pub async fn claim(&self, escrow_id: u64, caller: &str) -> EscrowResult<ClaimResult> {
        let escrow = self.ledger.require(escrow_id)?;
        let role = voting::check_claim(&escrow, caller)?;

        let secret = match (escrow.lock_mode, &escrow.locked_secret) {
            (Some(LockMode::Direct), Some(sealed)) => Some(self.vault.open(sealed)?),
            _ => None,
        };
        let payout_ready = escrow.lock_mode == Some(LockMode::External);

        let updated = self
            .ledger
            .update_conditional(escrow_id, escrow.status, |e| {
                voting::apply_claim(e, role);
            })?;

        info!(escrow_id, claimant = %role, payout_ready, "escrow claimed");

        Ok(ClaimResult {
            escrow: updated,
            secret,
            payout_ready,
        })
    }

    /// Pay out to the winner's receiving invoice.
    ///
    /// Order of checks: already-completed first (idempotent rejection,
    /// never double-pays), then the in-flight guard, then authorization.
    /// The escrow is marked `Completed` upon successful dispatch, not
    /// final settlement; a detached task awaits the preimage for logging.
    pub async fn request_payout(
        &self,
        escrow_id: u64,
        caller: &str,
        invoice: &str,
    ) -> EscrowResult<Escrow> {
        if invoice.trim().is_empty() {
            return Err(EscrowError::validation("payout invoice cannot be empty"));
        }

        let escrow = self.ledger.require(escrow_id)?;

        if escrow.status == EscrowStatus::Completed {
            return Err(EscrowError::conflict(format!(
                "payout for escrow {} already completed",
                escrow_id
            )));
        }
        if escrow.status != EscrowStatus::Claimed {
            return Err(EscrowError::state(
                escrow_id,
                escrow.status.to_string(),
                "payout requires a claimed escrow".to_string(),
            ));
        }

        let winner = escrow.claimed_by.ok_or_else(|| {
            EscrowError::internal(format!("escrow {} claimed without a claimant", escrow_id))
        })?;
        if escrow.role_of(caller) != Some(winner) {
            return Err(EscrowError::authorization(format!(
                "only the {} may request this payout",
                winner
            )));
        }

        // In-flight guard: inserted before the network call, removed on
        // completion or failure. Process-local, not persisted.
        if !self.inflight_payouts.write().await.insert(escrow_id) {
            return Err(EscrowError::conflict(format!(
                "payout for escrow {} is already in flight",
                escrow_id
            )));
        }

        let dispatch = self.network.pay(invoice).await;
        let operation = match dispatch {
            Ok(operation) => operation,
            Err(e) => {
                self.inflight_payouts.write().await.remove(&escrow_id);
                error!(escrow_id, "payout dispatch failed: {}", e);
                return Err(e);
            }
        };

        let updated = self
            .ledger
            .update_conditional(escrow_id, EscrowStatus::Claimed, |e| {
                e.status = EscrowStatus::Completed;
            });
        self.inflight_payouts.write().await.remove(&escrow_id);
        let updated = updated?;

        info!(
            escrow_id,
            winner = %winner,
            operation = %operation,
            "payout dispatched, escrow completed"
        );
        self.spawn_payout_watch(escrow_id, operation);

        Ok(updated)
    }

    /// Detached task: await the final payout outcome for logging only.
    fn spawn_payout_watch(&self, escrow_id: u64, operation: OperationHandle) {
        let network = Arc::clone(&self.network);
        let correlation = Uuid::new_v4();
        tokio::spawn(async move {
            match network.await_payout(&operation).await {
                Ok(result) if result.success => {
                    info!(
                        escrow_id,
                        %correlation,
                        preimage = result.preimage.as_deref().unwrap_or(""),
                        "payout settled"
                    );
                }
                Ok(_) => {
                    error!(
                        escrow_id,
                        %correlation,
                        operation = %operation,
                        "payout did NOT settle; escrow is marked completed but funds may not have moved"
                    );
                }
                Err(e) => {
                    error!(
                        escrow_id,
                        %correlation,
                        operation = %operation,
                        "payout settlement verification failed: {}", e
                    );
                }
            }
        });
    }
}
