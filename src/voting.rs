//! Voting / resolution state machine
//!
//! Pure decision logic over ledger records: join/lock/vote/claim
//! eligibility, strict vote ordering, and 2-of-3 tallying. No I/O
//! happens here; the orchestrating components load state, call in,
//! and persist the result.
//!
//! Vote ordering is strict: the buyer acts first and may only ask for
//! release, the seller votes second, and the arbiter is admitted only
//! when buyer and seller disagree. With two possible outcomes and the
//! arbiter gated on disagreement, a tie cannot occur.

use crate::{
    error::EscrowError,
    models::{Escrow, EscrowStatus, Role, Vote, VoteOutcome, VoteTally},
    EscrowResult,
};
use chrono::Utc;

/// Validate a join request and return the slot being filled.
///
/// Valid only from Created/Funded. Fails if the identity already holds
/// a role in this escrow or the target slot is taken.
pub fn check_join(escrow: &Escrow, identity: &str, role: Role) -> EscrowResult<()> {
    if !escrow.status.can_join() {
        return Err(EscrowError::state(
            escrow.id,
            escrow.status.to_string(),
            format!("cannot join as {} in this state", role),
        ));
    }

    if escrow.role_of(identity).is_some() {
        return Err(EscrowError::conflict(format!(
            "identity already holds a role in escrow {}",
            escrow.id
        )));
    }

    match role {
        Role::Seller => Err(EscrowError::validation(
            "seller slot is fixed at creation",
        )),
        Role::Buyer if escrow.buyer_id.is_some() => {
            Err(EscrowError::conflict("buyer slot already filled"))
        }
        Role::Arbiter if escrow.arbiter_id.is_some() => {
            Err(EscrowError::conflict("arbiter slot already filled"))
        }
        _ => Ok(()),
    }
}

/// Apply a validated join, transitioning to Funded once all parties are set.
pub fn apply_join(escrow: &mut Escrow, identity: &str, role: Role) {
    match role {
        Role::Buyer => escrow.buyer_id = Some(identity.to_string()),
        Role::Arbiter => escrow.arbiter_id = Some(identity.to_string()),
        Role::Seller => unreachable!("seller slot is fixed at creation"),
    }
    if escrow.fully_joined() {
        escrow.status = EscrowStatus::Funded;
    }
    escrow.updated_at = Utc::now();
}

/// Validate a lock request: seller-only, from Funded.
pub fn check_lock(escrow: &Escrow, identity: &str) -> EscrowResult<()> {
    if !escrow.status.can_lock() {
        return Err(EscrowError::state(
            escrow.id,
            escrow.status.to_string(),
            "funds can only be locked once all parties have joined".to_string(),
        ));
    }
    if escrow.role_of(identity) != Some(Role::Seller) {
        return Err(EscrowError::authorization(
            "only the seller can lock funds",
        ));
    }
    Ok(())
}

/// Validate a vote against the ordering rules.
///
/// Rules, applied in order:
/// - escrow must be Locked;
/// - the caster must hold a role;
/// - that role must not have voted already;
/// - buyer votes must be Release;
/// - seller votes require a prior buyer vote;
/// - arbiter votes require buyer and seller to have voted and to disagree.
pub fn check_vote(
    escrow: &Escrow,
    votes: &[Vote],
    identity: &str,
    outcome: VoteOutcome,
) -> EscrowResult<Role> {
    if !escrow.status.can_vote() {
        return Err(EscrowError::state(
            escrow.id,
            escrow.status.to_string(),
            "voting is only open while funds are locked".to_string(),
        ));
    }

    let role = escrow
        .role_of(identity)
        .ok_or_else(|| EscrowError::authorization("caller is not a participant"))?;

    if votes.iter().any(|v| v.role == role) {
        return Err(EscrowError::conflict(format!(
            "{} has already voted on escrow {}",
            role, escrow.id
        )));
    }

    let buyer_vote = votes.iter().find(|v| v.role == Role::Buyer);
    let seller_vote = votes.iter().find(|v| v.role == Role::Seller);

    match role {
        Role::Buyer => {
            // Buyers have no standing to request a refund of funds they
            // do not own.
            if outcome != VoteOutcome::Release {
                return Err(EscrowError::validation(
                    "buyer may only vote release",
                ));
            }
        }
        Role::Seller => {
            if buyer_vote.is_none() {
                return Err(EscrowError::state(
                    escrow.id,
                    escrow.status.to_string(),
                    "seller may only vote after the buyer".to_string(),
                ));
            }
        }
        Role::Arbiter => {
            let (buyer, seller) = match (buyer_vote, seller_vote) {
                (Some(b), Some(s)) => (b, s),
                _ => {
                    return Err(EscrowError::state(
                        escrow.id,
                        escrow.status.to_string(),
                        "arbiter may only vote after buyer and seller".to_string(),
                    ))
                }
            };
            if buyer.outcome == seller.outcome {
                return Err(EscrowError::state(
                    escrow.id,
                    escrow.status.to_string(),
                    "nothing to arbitrate: buyer and seller agree".to_string(),
                ));
            }
        }
    }

    Ok(role)
}

/// Tally votes after a new one was recorded; resolve when an outcome
/// reaches two votes.
pub fn apply_vote_result(escrow: &mut Escrow, votes: &[Vote]) -> Option<VoteOutcome> {
    let decided = VoteTally::count(votes).decided()?;
    escrow.status = EscrowStatus::Approved;
    escrow.resolved_outcome = Some(decided);
    escrow.resolved_at = Some(Utc::now());
    escrow.updated_at = Utc::now();
    Some(decided)
}

/// Validate a claim and return the claiming role.
///
/// From Approved the winner follows `resolved_outcome`; from Expired
/// the seller claims the forced refund. Exactly one claim is permitted.
pub fn check_claim(escrow: &Escrow, identity: &str) -> EscrowResult<Role> {
    let role = escrow
        .role_of(identity)
        .ok_or_else(|| EscrowError::authorization("caller is not a participant"))?;

    if !escrow.status.can_claim() {
        return Err(EscrowError::state(
            escrow.id,
            escrow.status.to_string(),
            "nothing to claim in this state".to_string(),
        ));
    }

    let winner = match escrow.status {
        EscrowStatus::Approved => escrow
            .resolved_outcome
            .ok_or_else(|| {
                EscrowError::internal(format!(
                    "escrow {} is approved without a resolved outcome",
                    escrow.id
                ))
            })?
            .winner(),
        EscrowStatus::Expired => Role::Seller,
        _ => unreachable!("can_claim covers Approved and Expired only"),
    };

    if role != winner {
        return Err(EscrowError::authorization(format!(
            "only the {} may claim this escrow",
            winner
        )));
    }

    Ok(role)
}

/// Apply a validated claim: record the claimant and clear the secret.
pub fn apply_claim(escrow: &mut Escrow, role: Role) {
    escrow.status = EscrowStatus::Claimed;
    escrow.claimed_by = Some(role);
    escrow.locked_secret = None;
    escrow.claimed_at = Some(Utc::now());
    escrow.updated_at = Utc::now();
}

/// Force an overdue escrow into the Expired state with a refund outcome.
pub fn apply_expiry(escrow: &mut Escrow) {
    escrow.status = EscrowStatus::Expired;
    escrow.resolved_outcome = Some(VoteOutcome::Refund);
    escrow.resolved_at = Some(Utc::now());
    escrow.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn locked_escrow() -> Escrow {
        let mut escrow = Escrow::new(
            7,
            100_000_000,
            "camera sale".to_string(),
            "ship insured".to_string(),
            "gear-trade".to_string(),
            "alice".to_string(),
            Utc::now() + Duration::hours(24),
        );
        escrow.buyer_id = Some("bob".to_string());
        escrow.arbiter_id = Some("carol".to_string());
        escrow.status = EscrowStatus::Locked;
        escrow
    }

    fn vote(role: Role, outcome: VoteOutcome, caster: &str) -> Vote {
        Vote {
            escrow_id: 7,
            role,
            outcome,
            caster: caster.to_string(),
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn join_fills_slots_then_funds() {
        let mut escrow = Escrow::new(
            1,
            1_000,
            "d".to_string(),
            "t".to_string(),
            "c".to_string(),
            "alice".to_string(),
            Utc::now() + Duration::hours(1),
        );

        check_join(&escrow, "bob", Role::Buyer).unwrap();
        apply_join(&mut escrow, "bob", Role::Buyer);
        assert_eq!(escrow.status, EscrowStatus::Created);

        // Same identity cannot take a second role.
        assert!(matches!(
            check_join(&escrow, "bob", Role::Arbiter),
            Err(EscrowError::Conflict(_))
        ));
        // Filled slot rejects.
        assert!(matches!(
            check_join(&escrow, "dave", Role::Buyer),
            Err(EscrowError::Conflict(_))
        ));

        check_join(&escrow, "carol", Role::Arbiter).unwrap();
        apply_join(&mut escrow, "carol", Role::Arbiter);
        assert_eq!(escrow.status, EscrowStatus::Funded);
    }

    #[test]
    fn lock_is_seller_only_from_funded() {
        let mut escrow = locked_escrow();
        escrow.status = EscrowStatus::Funded;

        assert!(matches!(
            check_lock(&escrow, "bob"),
            Err(EscrowError::Authorization(_))
        ));
        check_lock(&escrow, "alice").unwrap();

        escrow.status = EscrowStatus::Created;
        assert!(matches!(
            check_lock(&escrow, "alice"),
            Err(EscrowError::State { .. })
        ));
    }

    #[test]
    fn buyer_must_vote_release() {
        let escrow = locked_escrow();
        assert!(matches!(
            check_vote(&escrow, &[], "bob", VoteOutcome::Refund),
            Err(EscrowError::Validation(_))
        ));
        assert_eq!(
            check_vote(&escrow, &[], "bob", VoteOutcome::Release).unwrap(),
            Role::Buyer
        );
    }

    #[test]
    fn seller_requires_prior_buyer_vote() {
        let escrow = locked_escrow();
        assert!(matches!(
            check_vote(&escrow, &[], "alice", VoteOutcome::Refund),
            Err(EscrowError::State { .. })
        ));

        let votes = vec![vote(Role::Buyer, VoteOutcome::Release, "bob")];
        assert_eq!(
            check_vote(&escrow, &votes, "alice", VoteOutcome::Refund).unwrap(),
            Role::Seller
        );
    }

    #[test]
    fn arbiter_requires_disagreement() {
        let escrow = locked_escrow();

        // Before both votes.
        assert!(matches!(
            check_vote(&escrow, &[], "carol", VoteOutcome::Release),
            Err(EscrowError::State { .. })
        ));

        // Agreement leaves nothing to arbitrate.
        let agreed = vec![
            vote(Role::Buyer, VoteOutcome::Release, "bob"),
            vote(Role::Seller, VoteOutcome::Release, "alice"),
        ];
        assert!(matches!(
            check_vote(&escrow, &agreed, "carol", VoteOutcome::Refund),
            Err(EscrowError::State { .. })
        ));

        let disagreed = vec![
            vote(Role::Buyer, VoteOutcome::Release, "bob"),
            vote(Role::Seller, VoteOutcome::Refund, "alice"),
        ];
        assert_eq!(
            check_vote(&escrow, &disagreed, "carol", VoteOutcome::Refund).unwrap(),
            Role::Arbiter
        );
    }

    #[test]
    fn duplicate_vote_is_conflict() {
        let escrow = locked_escrow();
        let votes = vec![vote(Role::Buyer, VoteOutcome::Release, "bob")];
        assert!(matches!(
            check_vote(&escrow, &votes, "bob", VoteOutcome::Release),
            Err(EscrowError::Conflict(_))
        ));
    }

    #[test]
    fn non_participant_cannot_vote() {
        let escrow = locked_escrow();
        assert!(matches!(
            check_vote(&escrow, &[], "mallory", VoteOutcome::Release),
            Err(EscrowError::Authorization(_))
        ));
    }

    #[test]
    fn agreement_resolves_release() {
        let mut escrow = locked_escrow();
        let votes = vec![
            vote(Role::Buyer, VoteOutcome::Release, "bob"),
            vote(Role::Seller, VoteOutcome::Release, "alice"),
        ];
        assert_eq!(
            apply_vote_result(&mut escrow, &votes),
            Some(VoteOutcome::Release)
        );
        assert_eq!(escrow.status, EscrowStatus::Approved);
        assert_eq!(escrow.resolved_outcome, Some(VoteOutcome::Release));
    }

    #[test]
    fn arbiter_breaks_disagreement_either_way() {
        for (arbiter_outcome, expected_winner) in [
            (VoteOutcome::Refund, Role::Seller),
            (VoteOutcome::Release, Role::Buyer),
        ] {
            let mut escrow = locked_escrow();
            let votes = vec![
                vote(Role::Buyer, VoteOutcome::Release, "bob"),
                vote(Role::Seller, VoteOutcome::Refund, "alice"),
                vote(Role::Arbiter, arbiter_outcome, "carol"),
            ];
            let outcome = apply_vote_result(&mut escrow, &votes).unwrap();
            assert_eq!(outcome.winner(), expected_winner);
        }
    }

    #[test]
    fn single_vote_does_not_resolve() {
        let mut escrow = locked_escrow();
        let votes = vec![vote(Role::Buyer, VoteOutcome::Release, "bob")];
        assert_eq!(apply_vote_result(&mut escrow, &votes), None);
        assert_eq!(escrow.status, EscrowStatus::Locked);
    }

    #[test]
    fn claim_goes_to_winner_only() {
        let mut escrow = locked_escrow();
        escrow.status = EscrowStatus::Approved;
        escrow.resolved_outcome = Some(VoteOutcome::Release);

        // Seller lost, cannot claim.
        assert!(matches!(
            check_claim(&escrow, "alice"),
            Err(EscrowError::Authorization(_))
        ));
        assert_eq!(check_claim(&escrow, "bob").unwrap(), Role::Buyer);

        apply_claim(&mut escrow, Role::Buyer);
        assert_eq!(escrow.status, EscrowStatus::Claimed);
        assert!(escrow.locked_secret.is_none());

        // Second claim rejects on state.
        assert!(matches!(
            check_claim(&escrow, "bob"),
            Err(EscrowError::State { .. })
        ));
    }

    #[test]
    fn expired_escrow_refunds_to_seller() {
        let mut escrow = locked_escrow();
        apply_expiry(&mut escrow);
        assert_eq!(escrow.status, EscrowStatus::Expired);
        assert_eq!(escrow.resolved_outcome, Some(VoteOutcome::Refund));

        assert!(matches!(
            check_claim(&escrow, "bob"),
            Err(EscrowError::Authorization(_))
        ));
        assert_eq!(check_claim(&escrow, "alice").unwrap(), Role::Seller);
    }
}
