//! Escrow node - high-level API for the escrow engine
//!
//! Wires the ledger, orchestrator, sweeper, identity boundary and rate
//! limiter into one facade exposing the full action surface. Every
//! inbound action runs the same pipeline: identity verification, rate
//! limiting, an opportunistic expiry sweep, then the operation itself.
//!
//! Components are dependency-injected; there is no global state, and a
//! shutdown closes the ledger.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::{
    config::EscrowNodeConfig,
    error::EscrowError,
    identity::{IdentityVerifier, RequestProof, SignatureVerifier},
    ledger::Ledger,
    models::{Escrow, EscrowStatus, EscrowView, Role, Vote, VoteOutcome, VoteTally},
    network::{InvoiceHandle, PaymentNetwork, RestPaymentNetwork, WalletInfo},
    orchestrator::{Orchestrator, OrchestratorConfig},
    ratelimit::RateLimiter,
    sweeper::Sweeper,
    vault::SecretVault,
    voting, EscrowResult,
};

/// Escrow creation request
#[derive(Debug, Clone)]
pub struct CreateEscrowRequest {
    pub proof: RequestProof,
    pub amount_msat: u64,
    pub description: String,
    pub terms: String,
    pub community_reference: String,
}

/// Join request for the buyer or arbiter slot
#[derive(Debug, Clone)]
pub struct JoinEscrowRequest {
    pub proof: RequestProof,
    pub escrow_id: u64,
    pub role: Role,
}

/// Direct-mode lock request (non-production)
#[derive(Debug, Clone)]
pub struct DirectLockRequest {
    pub proof: RequestProof,
    pub escrow_id: u64,
    pub secret: String,
}

/// Vote request
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub proof: RequestProof,
    pub escrow_id: u64,
    pub outcome: VoteOutcome,
}

/// Payout request carrying the winner's receiving invoice
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub proof: RequestProof,
    pub escrow_id: u64,
    pub invoice: String,
}

/// Claim response: the secret appears exactly once, for direct-mode
/// locks; external-mode claims signal payout readiness instead.
#[derive(Debug, Clone)]
pub struct ClaimResponse {
    pub escrow: EscrowView,
    pub secret: Option<String>,
    pub payout_ready: bool,
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub wallet: Option<WalletInfo>,
    pub issues: Vec<String>,
}

/// Main escrow node coordinating all components
pub struct EscrowNode {
    config: EscrowNodeConfig,
    ledger: Arc<Ledger>,
    orchestrator: Orchestrator,
    sweeper: Sweeper,
    network: Arc<dyn PaymentNetwork>,
    identity: Arc<dyn IdentityVerifier>,
    ratelimit: RateLimiter,
}

impl EscrowNode {
    /// Build a node with injected collaborators. The ledger is opened
    /// (and migrated) here; a missing vault key in production mode fails
    /// startup.
    pub fn new(
        config: EscrowNodeConfig,
        network: Arc<dyn PaymentNetwork>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> EscrowResult<Self> {
        info!(production = config.production, "initializing escrow node");

        let vault = Arc::new(SecretVault::from_config(
            config.vault_key_hex.as_deref(),
            config.production,
        )?);
        let ledger = Arc::new(Ledger::open(&config.ledger_path)?);
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                production: config.production,
                lock_extension_hours: config.lock_extension_hours,
            },
            Arc::clone(&ledger),
            Arc::clone(&network),
            vault,
        );
        let sweeper = Sweeper::new(Arc::clone(&ledger));
        let ratelimit = RateLimiter::new(config.rate_limit.clone());

        Ok(Self {
            config,
            ledger,
            orchestrator,
            sweeper,
            network,
            identity,
            ratelimit,
        })
    }

    /// Build a node against a REST settlement network and the signature
    /// identity verifier, all from configuration.
    pub fn connect(config: EscrowNodeConfig) -> EscrowResult<Self> {
        let network: Arc<dyn PaymentNetwork> =
            Arc::new(RestPaymentNetwork::new(config.network.clone())?);
        let identity: Arc<dyn IdentityVerifier> =
            Arc::new(SignatureVerifier::new(config.identity_freshness_secs));
        Self::new(config, network, identity)
    }

    /// Shared inbound pipeline: verify identity, charge the rate
    /// limiter, run the expiry sweep. Returns the verified identity.
    async fn admit(&self, proof: &RequestProof) -> EscrowResult<String> {
        let identity = self.identity.verify(proof).await?;
        self.ratelimit.charge(&identity).await?;
        match self.sweeper.sweep() {
            Ok(expired) => self.orchestrator.evict_pending_locks(&expired).await,
            Err(e) => warn!("expiry sweep failed: {}", e),
        }
        Ok(identity)
    }

    fn view(&self, escrow: &Escrow) -> EscrowResult<EscrowView> {
        let votes = self.ledger.votes_for(escrow.id)?;
        Ok(EscrowView::project(escrow, &votes))
    }

    /// Create a new escrow; the caller becomes the seller.
    pub async fn create_escrow(&self, request: CreateEscrowRequest) -> EscrowResult<EscrowView> {
        let identity = self.admit(&request.proof).await?;
        self.validate_create(&request)?;

        let expires_at = Utc::now() + Duration::hours(self.config.default_expiry_hours);
        let escrow = self.ledger.create(
            request.amount_msat,
            request.description,
            request.terms,
            request.community_reference,
            identity,
            expires_at,
        )?;

        info!(escrow_id = escrow.id, amount_msat = escrow.amount_msat, "escrow created");
        self.view(&escrow)
    }

    fn validate_create(&self, request: &CreateEscrowRequest) -> EscrowResult<()> {
        if request.amount_msat == 0 {
            return Err(EscrowError::validation("amount must be greater than 0"));
        }
        if request.amount_msat > self.config.max_amount_msat {
            return Err(EscrowError::validation(format!(
                "amount {} exceeds maximum {}",
                request.amount_msat, self.config.max_amount_msat
            )));
        }
        if request.terms.trim().is_empty() {
            return Err(EscrowError::validation("terms cannot be empty"));
        }
        let reference = request.community_reference.trim();
        if reference.is_empty()
            || !reference
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(EscrowError::validation(
                "community reference must be a lowercase handle",
            ));
        }
        Ok(())
    }

    /// Join an escrow as buyer or arbiter.
    pub async fn join_escrow(&self, request: JoinEscrowRequest) -> EscrowResult<EscrowView> {
        let identity = self.admit(&request.proof).await?;

        let escrow = self.ledger.require(request.escrow_id)?;
        voting::check_join(&escrow, &identity, request.role)?;

        let updated = self
            .ledger
            .update_conditional(request.escrow_id, escrow.status, |e| {
                voting::apply_join(e, &identity, request.role)
            })?;

        info!(
            escrow_id = updated.id,
            role = %request.role,
            status = %updated.status,
            "party joined escrow"
        );
        self.view(&updated)
    }

    /// Begin an external lock: returns the invoice the seller must pay.
    pub async fn request_lock_invoice(
        &self,
        proof: RequestProof,
        escrow_id: u64,
    ) -> EscrowResult<InvoiceHandle> {
        let identity = self.admit(&proof).await?;
        self.orchestrator.begin_external_lock(escrow_id, &identity).await
    }

    /// Complete an external lock after the seller reports payment.
    pub async fn confirm_lock(
        &self,
        proof: RequestProof,
        escrow_id: u64,
    ) -> EscrowResult<EscrowView> {
        let identity = self.admit(&proof).await?;
        let escrow = self
            .orchestrator
            .confirm_external_lock(escrow_id, &identity)
            .await?;
        self.view(&escrow)
    }

    /// Lock with a caller-supplied secret (non-production only).
    pub async fn lock_direct(&self, request: DirectLockRequest) -> EscrowResult<EscrowView> {
        let identity = self.admit(&request.proof).await?;
        let escrow = self
            .orchestrator
            .direct_lock(request.escrow_id, &identity, &request.secret)
            .await?;
        self.view(&escrow)
    }

    /// Cast a vote; resolves the escrow once an outcome reaches two votes.
    pub async fn vote(&self, request: VoteRequest) -> EscrowResult<EscrowView> {
        let identity = self.admit(&request.proof).await?;

        let escrow = self.ledger.require(request.escrow_id)?;
        let votes = self.ledger.votes_for(request.escrow_id)?;
        let role = voting::check_vote(&escrow, &votes, &identity, request.outcome)?;

        self.ledger.add_vote(&Vote {
            escrow_id: request.escrow_id,
            role,
            outcome: request.outcome,
            caster: identity,
            cast_at: Utc::now(),
        })?;

        let votes = self.ledger.votes_for(request.escrow_id)?;
        let escrow = if let Some(outcome) = VoteTally::count(&votes).decided() {
            let resolved = self
                .ledger
                .update_conditional(request.escrow_id, EscrowStatus::Locked, |e| {
                    voting::apply_vote_result(e, &votes);
                })?;
            info!(
                escrow_id = resolved.id,
                outcome = %outcome,
                "escrow resolved"
            );
            resolved
        } else {
            self.ledger.require(request.escrow_id)?
        };

        self.view(&escrow)
    }

    /// Claim by the resolution winner.
    pub async fn claim(&self, proof: RequestProof, escrow_id: u64) -> EscrowResult<ClaimResponse> {
        let identity = self.admit(&proof).await?;
        let result = self.orchestrator.claim(escrow_id, &identity).await?;

        Ok(ClaimResponse {
            escrow: self.view(&result.escrow)?,
            secret: result.secret,
            payout_ready: result.payout_ready,
        })
    }

    /// Pay out to the winner's receiving invoice.
    pub async fn request_payout(&self, request: PayoutRequest) -> EscrowResult<EscrowView> {
        let identity = self.admit(&request.proof).await?;
        let escrow = self
            .orchestrator
            .request_payout(request.escrow_id, &identity, &request.invoice)
            .await?;
        self.view(&escrow)
    }

    /// Fetch one escrow. Participants only.
    pub async fn get_escrow(&self, proof: RequestProof, escrow_id: u64) -> EscrowResult<EscrowView> {
        let identity = self.admit(&proof).await?;
        let escrow = self.ledger.require(escrow_id)?;
        if escrow.role_of(&identity).is_none() {
            return Err(EscrowError::authorization("caller is not a participant"));
        }
        self.view(&escrow)
    }

    /// List every escrow the caller participates in.
    pub async fn list_escrows(&self, proof: RequestProof) -> EscrowResult<Vec<EscrowView>> {
        let identity = self.admit(&proof).await?;
        self.ledger
            .list_by_identity(&identity)?
            .iter()
            .map(|e| self.view(e))
            .collect()
    }

    /// Liveness probe against the settlement network wallet.
    pub async fn health(&self) -> NodeHealth {
        match self.network.wallet_info().await {
            Ok(wallet) => NodeHealth {
                healthy: wallet.available,
                issues: if wallet.available {
                    Vec::new()
                } else {
                    vec!["settlement network wallet unavailable".to_string()]
                },
                wallet: Some(wallet),
            },
            Err(e) => NodeHealth {
                healthy: false,
                wallet: None,
                issues: vec![format!("settlement network error: {}", e)],
            },
        }
    }

    /// Shut the node down, closing the ledger.
    pub fn shutdown(self) {
        info!("shutting down escrow node");
        let Self {
            ledger,
            orchestrator,
            sweeper,
            ..
        } = self;
        drop(orchestrator);
        drop(sweeper);
        if let Ok(ledger) = Arc::try_unwrap(ledger) {
            ledger.close();
        }
        info!("escrow node shutdown complete");
    }
}
