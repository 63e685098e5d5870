//! Core data models for the escrow engine
//!
//! Escrow and vote records as stored in the ledger, plus the JSON-safe
//! projection returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Escrow state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    /// Created by the seller, waiting for buyer and arbiter to join
    Created,
    /// All three parties joined, funds not yet locked
    Funded,
    /// Funds locked under escrow control, voting open
    Locked,
    /// 2-of-3 resolution reached, awaiting the winner's claim
    Approved,
    /// Winner claimed; secret cleared, payout may follow
    Claimed,
    /// Deadline passed before resolution; forced refund to seller
    Expired,
    /// Payout dispatched through the settlement network
    Completed,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if this state allows a party to join
    pub fn can_join(&self) -> bool {
        matches!(self, Self::Created | Self::Funded)
    }

    /// Check if this state allows locking funds
    pub fn can_lock(&self) -> bool {
        matches!(self, Self::Funded)
    }

    /// Check if this state allows voting
    pub fn can_vote(&self) -> bool {
        matches!(self, Self::Locked)
    }

    /// Check if this state allows claiming
    pub fn can_claim(&self) -> bool {
        matches!(self, Self::Approved | Self::Expired)
    }

    /// Check if this state is subject to the expiry sweep
    pub fn can_expire(&self) -> bool {
        matches!(self, Self::Created | Self::Funded | Self::Locked)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Participant role in an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Seller,
    Buyer,
    Arbiter,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seller => write!(f, "seller"),
            Self::Buyer => write!(f, "buyer"),
            Self::Arbiter => write!(f, "arbiter"),
        }
    }
}

/// Vote outcome enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOutcome {
    /// Funds go to the buyer
    Release,
    /// Funds return to the seller
    Refund,
}

impl VoteOutcome {
    /// The role that claims the funds under this outcome
    pub fn winner(&self) -> Role {
        match self {
            Self::Release => Role::Buyer,
            Self::Refund => Role::Seller,
        }
    }
}

impl std::fmt::Display for VoteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

/// How the custodial amount was locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Settled through the external payment network
    External,
    /// Secret supplied by the caller directly (non-production only)
    Direct,
}

/// Escrow record as persisted in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: u64,
    pub status: EscrowStatus,

    /// Amount in minor currency units (millisatoshis); immutable after creation
    pub amount_msat: u64,
    pub description: String,
    pub terms: String,
    pub community_reference: String,

    // Parties
    pub seller_id: String,
    pub buyer_id: Option<String>,
    pub arbiter_id: Option<String>,

    /// Custodial payload, AEAD-encrypted at rest; present iff Locked/Approved
    pub locked_secret: Option<Vec<u8>>,
    pub lock_mode: Option<LockMode>,

    // Resolution
    pub resolved_outcome: Option<VoteOutcome>,
    pub claimed_by: Option<Role>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Escrow {
    /// Create a new escrow; the creator is always the seller
    pub fn new(
        id: u64,
        amount_msat: u64,
        description: String,
        terms: String,
        community_reference: String,
        seller_id: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: EscrowStatus::Created,
            amount_msat,
            description,
            terms,
            community_reference,
            seller_id,
            buyer_id: None,
            arbiter_id: None,
            locked_secret: None,
            lock_mode: None,
            resolved_outcome: None,
            claimed_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            locked_at: None,
            resolved_at: None,
            claimed_at: None,
            expires_at,
        }
    }

    /// The role an identity holds in this escrow, if any
    pub fn role_of(&self, identity: &str) -> Option<Role> {
        if self.seller_id == identity {
            Some(Role::Seller)
        } else if self.buyer_id.as_deref() == Some(identity) {
            Some(Role::Buyer)
        } else if self.arbiter_id.as_deref() == Some(identity) {
            Some(Role::Arbiter)
        } else {
            None
        }
    }

    /// True once seller, buyer and arbiter are all set
    pub fn fully_joined(&self) -> bool {
        self.buyer_id.is_some() && self.arbiter_id.is_some()
    }

    /// True if the deadline has passed at the given instant
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Vote record, append-only, one per (escrow, role)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub escrow_id: u64,
    pub role: Role,
    pub outcome: VoteOutcome,
    /// Verified identity of the caster
    pub caster: String,
    pub cast_at: DateTime<Utc>,
}

/// Running tally of votes for an escrow
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub release: u8,
    pub refund: u8,
}

impl VoteTally {
    pub fn count(votes: &[Vote]) -> Self {
        let mut tally = Self::default();
        for vote in votes {
            match vote.outcome {
                VoteOutcome::Release => tally.release += 1,
                VoteOutcome::Refund => tally.refund += 1,
            }
        }
        tally
    }

    /// The first outcome to reach two votes, if any
    pub fn decided(&self) -> Option<VoteOutcome> {
        if self.release >= 2 {
            Some(VoteOutcome::Release)
        } else if self.refund >= 2 {
            Some(VoteOutcome::Refund)
        } else {
            None
        }
    }
}

/// Vote as exposed to callers (no caster identity leakage beyond role)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteView {
    pub role: Role,
    pub outcome: VoteOutcome,
    pub cast_at: DateTime<Utc>,
}

/// Escrow projection returned by the action surface
///
/// Never carries the locked secret; the only authorized exposure of the
/// plaintext is the one-shot claim result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowView {
    pub id: u64,
    pub status: EscrowStatus,
    pub amount_msat: u64,
    pub description: String,
    pub terms: String,
    pub community_reference: String,
    pub seller_id: String,
    pub buyer_id: Option<String>,
    pub arbiter_id: Option<String>,
    pub lock_mode: Option<LockMode>,
    pub resolved_outcome: Option<VoteOutcome>,
    pub claimed_by: Option<Role>,
    pub votes: Vec<VoteView>,
    pub tally: VoteTally,
    /// Seconds until expiry; zero once overdue or terminal
    pub remaining_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EscrowView {
    pub fn project(escrow: &Escrow, votes: &[Vote]) -> Self {
        let now = Utc::now();
        let remaining_secs = if escrow.status.can_expire() && escrow.expires_at > now {
            (escrow.expires_at - now).num_seconds().max(0) as u64
        } else {
            0
        };

        Self {
            id: escrow.id,
            status: escrow.status,
            amount_msat: escrow.amount_msat,
            description: escrow.description.clone(),
            terms: escrow.terms.clone(),
            community_reference: escrow.community_reference.clone(),
            seller_id: escrow.seller_id.clone(),
            buyer_id: escrow.buyer_id.clone(),
            arbiter_id: escrow.arbiter_id.clone(),
            lock_mode: escrow.lock_mode,
            resolved_outcome: escrow.resolved_outcome,
            claimed_by: escrow.claimed_by,
            votes: votes
                .iter()
                .map(|v| VoteView {
                    role: v.role,
                    outcome: v.outcome,
                    cast_at: v.cast_at,
                })
                .collect(),
            tally: VoteTally::count(votes),
            remaining_secs,
            created_at: escrow.created_at,
            updated_at: escrow.updated_at,
            expires_at: escrow.expires_at,
        }
    }
}
