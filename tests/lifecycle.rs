//! End-to-end escrow lifecycle scenarios.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use lnescrow::config::EscrowNodeConfig;
use lnescrow::error::EscrowError;
use lnescrow::identity::{asserted_proof, InsecureVerifier};
use lnescrow::ledger::Ledger;
use lnescrow::models::{EscrowStatus, Role, VoteOutcome};
use lnescrow::network::mock::MockPaymentNetwork;
use lnescrow::network::PaymentNetwork;
use lnescrow::node::{
    CreateEscrowRequest, EscrowNode, JoinEscrowRequest, PayoutRequest, VoteRequest,
};
use lnescrow::orchestrator::{Orchestrator, OrchestratorConfig};
use lnescrow::sweeper::Sweeper;
use lnescrow::vault::SecretVault;

const AMOUNT: u64 = 100_000_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_node(dir: &TempDir) -> (EscrowNode, Arc<MockPaymentNetwork>) {
    init_tracing();
    let network = Arc::new(MockPaymentNetwork::default());
    let config = EscrowNodeConfig {
        ledger_path: dir.path().to_path_buf(),
        ..EscrowNodeConfig::default()
    };
    let node = EscrowNode::new(
        config,
        network.clone() as Arc<dyn PaymentNetwork>,
        Arc::new(InsecureVerifier),
    )
    .unwrap();
    (node, network)
}

async fn create_funded(node: &EscrowNode) -> u64 {
    let view = node
        .create_escrow(CreateEscrowRequest {
            proof: asserted_proof("alice"),
            amount_msat: AMOUNT,
            description: "camera sale".to_string(),
            terms: "ship within 7 days".to_string(),
            community_reference: "gear-trade".to_string(),
        })
        .await
        .unwrap();

    node.join_escrow(JoinEscrowRequest {
        proof: asserted_proof("bob"),
        escrow_id: view.id,
        role: Role::Buyer,
    })
    .await
    .unwrap();

    let funded = node
        .join_escrow(JoinEscrowRequest {
            proof: asserted_proof("carol"),
            escrow_id: view.id,
            role: Role::Arbiter,
        })
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);

    view.id
}

async fn lock_external(node: &EscrowNode, escrow_id: u64) {
    let invoice = node
        .request_lock_invoice(asserted_proof("alice"), escrow_id)
        .await
        .unwrap();
    assert!(invoice.invoice.starts_with("lnmock"));

    let view = node
        .confirm_lock(asserted_proof("alice"), escrow_id)
        .await
        .unwrap();
    assert_eq!(view.status, EscrowStatus::Locked);
}

async fn vote(node: &EscrowNode, identity: &str, escrow_id: u64, outcome: VoteOutcome) {
    node.vote(VoteRequest {
        proof: asserted_proof(identity),
        escrow_id,
        outcome,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn happy_path_release_to_buyer() {
    let dir = TempDir::new().unwrap();
    let (node, network) = test_node(&dir);

    let id = create_funded(&node).await;
    lock_external(&node, id).await;

    // Buyer and seller agree on release; no arbitration needed.
    vote(&node, "bob", id, VoteOutcome::Release).await;
    let resolved = node
        .vote(VoteRequest {
            proof: asserted_proof("alice"),
            escrow_id: id,
            outcome: VoteOutcome::Release,
        })
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Approved);
    assert_eq!(resolved.resolved_outcome, Some(VoteOutcome::Release));
    assert_eq!(resolved.tally.release, 2);

    let claim = node.claim(asserted_proof("bob"), id).await.unwrap();
    assert_eq!(claim.escrow.status, EscrowStatus::Claimed);
    assert_eq!(claim.escrow.claimed_by, Some(Role::Buyer));
    assert!(claim.payout_ready);
    assert!(claim.secret.is_none());

    let completed = node
        .request_payout(PayoutRequest {
            proof: asserted_proof("bob"),
            escrow_id: id,
            invoice: "lnbc1buyer".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(completed.status, EscrowStatus::Completed);
    assert_eq!(network.paid_invoices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn disagreement_arbiter_refunds_seller() {
    let dir = TempDir::new().unwrap();
    let (node, _) = test_node(&dir);

    let id = create_funded(&node).await;
    lock_external(&node, id).await;

    vote(&node, "bob", id, VoteOutcome::Release).await;
    vote(&node, "alice", id, VoteOutcome::Refund).await;
    let resolved = node
        .vote(VoteRequest {
            proof: asserted_proof("carol"),
            escrow_id: id,
            outcome: VoteOutcome::Refund,
        })
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Approved);
    assert_eq!(resolved.resolved_outcome, Some(VoteOutcome::Refund));

    // Buyer lost; only the seller may claim.
    assert!(matches!(
        node.claim(asserted_proof("bob"), id).await,
        Err(EscrowError::Authorization(_))
    ));
    let claim = node.claim(asserted_proof("alice"), id).await.unwrap();
    assert_eq!(claim.escrow.claimed_by, Some(Role::Seller));
}

#[tokio::test]
async fn disagreement_arbiter_releases_to_buyer() {
    let dir = TempDir::new().unwrap();
    let (node, _) = test_node(&dir);

    let id = create_funded(&node).await;
    lock_external(&node, id).await;

    vote(&node, "bob", id, VoteOutcome::Release).await;
    vote(&node, "alice", id, VoteOutcome::Refund).await;
    let resolved = node
        .vote(VoteRequest {
            proof: asserted_proof("carol"),
            escrow_id: id,
            outcome: VoteOutcome::Release,
        })
        .await
        .unwrap();
    assert_eq!(resolved.resolved_outcome, Some(VoteOutcome::Release));

    let claim = node.claim(asserted_proof("bob"), id).await.unwrap();
    assert_eq!(claim.escrow.claimed_by, Some(Role::Buyer));
}

#[tokio::test]
async fn rejection_ladder() {
    let dir = TempDir::new().unwrap();
    let (node, _) = test_node(&dir);

    let id = create_funded(&node).await;

    // Buyer attempts to lock: seller-only.
    assert!(matches!(
        node.request_lock_invoice(asserted_proof("bob"), id).await,
        Err(EscrowError::Authorization(_))
    ));

    lock_external(&node, id).await;

    // Seller before buyer: ordering violation.
    assert!(matches!(
        node.vote(VoteRequest {
            proof: asserted_proof("alice"),
            escrow_id: id,
            outcome: VoteOutcome::Refund,
        })
        .await,
        Err(EscrowError::State { .. })
    ));

    // Arbiter before both: ordering violation.
    assert!(matches!(
        node.vote(VoteRequest {
            proof: asserted_proof("carol"),
            escrow_id: id,
            outcome: VoteOutcome::Release,
        })
        .await,
        Err(EscrowError::State { .. })
    ));

    // Buyer voting refund: no standing.
    assert!(matches!(
        node.vote(VoteRequest {
            proof: asserted_proof("bob"),
            escrow_id: id,
            outcome: VoteOutcome::Refund,
        })
        .await,
        Err(EscrowError::Validation(_))
    ));

    vote(&node, "bob", id, VoteOutcome::Release).await;

    // Buyer voting twice: conflict.
    assert!(matches!(
        node.vote(VoteRequest {
            proof: asserted_proof("bob"),
            escrow_id: id,
            outcome: VoteOutcome::Release,
        })
        .await,
        Err(EscrowError::Conflict(_))
    ));

    // Seller agrees; resolves to release.
    let resolved = node
        .vote(VoteRequest {
            proof: asserted_proof("alice"),
            escrow_id: id,
            outcome: VoteOutcome::Release,
        })
        .await
        .unwrap();
    assert_eq!(resolved.resolved_outcome, Some(VoteOutcome::Release));

    // Losing seller cannot claim.
    assert!(matches!(
        node.claim(asserted_proof("alice"), id).await,
        Err(EscrowError::Authorization(_))
    ));
}

/// Component-level expiry scenario: a locked escrow passes its deadline,
/// the sweep forces the refund path, the seller claims it, and a second
/// payout never goes through.
#[tokio::test]
async fn expired_lock_refunds_seller_exactly_once() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path()).unwrap());
    let network = Arc::new(MockPaymentNetwork::default());
    let vault = Arc::new(SecretVault::from_config(None, false).unwrap());
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::clone(&ledger),
        network.clone() as Arc<dyn PaymentNetwork>,
        vault,
    );
    let sweeper = Sweeper::new(Arc::clone(&ledger));

    let escrow = ledger
        .create(
            AMOUNT,
            "camera sale".to_string(),
            "ship within 7 days".to_string(),
            "gear-trade".to_string(),
            "alice".to_string(),
            Utc::now() + Duration::hours(1),
        )
        .unwrap();
    ledger
        .update_conditional(escrow.id, EscrowStatus::Created, |e| {
            e.buyer_id = Some("bob".to_string());
            e.arbiter_id = Some("carol".to_string());
            e.status = EscrowStatus::Funded;
        })
        .unwrap();

    orchestrator
        .begin_external_lock(escrow.id, "alice")
        .await
        .unwrap();
    orchestrator
        .confirm_external_lock(escrow.id, "alice")
        .await
        .unwrap();

    // Deadline passes while locked and unresolved.
    ledger
        .update_conditional(escrow.id, EscrowStatus::Locked, |e| {
            e.expires_at = Utc::now() - Duration::seconds(1);
        })
        .unwrap();

    assert_eq!(sweeper.sweep().unwrap(), vec![escrow.id]);
    let expired = ledger.require(escrow.id).unwrap();
    assert_eq!(expired.status, EscrowStatus::Expired);
    assert_eq!(expired.resolved_outcome, Some(VoteOutcome::Refund));

    // Forced refund: seller claims, buyer cannot.
    assert!(matches!(
        orchestrator.claim(escrow.id, "bob").await,
        Err(EscrowError::Authorization(_))
    ));
    let claim = orchestrator.claim(escrow.id, "alice").await.unwrap();
    assert_eq!(claim.escrow.status, EscrowStatus::Claimed);

    let completed = orchestrator
        .request_payout(escrow.id, "alice", "lnbc1refund")
        .await
        .unwrap();
    assert_eq!(completed.status, EscrowStatus::Completed);

    // No payout attempt succeeds twice.
    assert!(matches!(
        orchestrator.request_payout(escrow.id, "alice", "lnbc1refund").await,
        Err(EscrowError::Conflict(_))
    ));
    assert_eq!(network.paid_invoices.lock().unwrap().len(), 1);
}

/// An escrow past its deadline is not expired by a timer; the next
/// ordinary inbound action forces the transition, and later actions
/// against it reject with the expired status.
#[tokio::test]
async fn overdue_escrow_expires_on_next_inbound_action() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let network = Arc::new(MockPaymentNetwork::default());
    let config = EscrowNodeConfig {
        ledger_path: dir.path().to_path_buf(),
        default_expiry_hours: 0,
        ..EscrowNodeConfig::default()
    };
    let node = EscrowNode::new(
        config,
        network as Arc<dyn PaymentNetwork>,
        Arc::new(InsecureVerifier),
    )
    .unwrap();

    let view = node
        .create_escrow(CreateEscrowRequest {
            proof: asserted_proof("alice"),
            amount_msat: AMOUNT,
            description: "camera sale".to_string(),
            terms: "ship within 7 days".to_string(),
            community_reference: "gear-trade".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(view.status, EscrowStatus::Created);

    // The deadline has already passed; a plain read trips the sweep.
    let view = node
        .get_escrow(asserted_proof("alice"), view.id)
        .await
        .unwrap();
    assert_eq!(view.status, EscrowStatus::Expired);
    assert_eq!(view.resolved_outcome, Some(VoteOutcome::Refund));
    assert_eq!(view.remaining_secs, 0);

    match node
        .join_escrow(JoinEscrowRequest {
            proof: asserted_proof("bob"),
            escrow_id: view.id,
            role: Role::Buyer,
        })
        .await
    {
        Err(EscrowError::State { status, .. }) => assert_eq!(status, "Expired"),
        other => panic!("expected a state rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn direct_mode_claim_reveals_secret_once() {
    let dir = TempDir::new().unwrap();
    let (node, _) = test_node(&dir);

    let id = create_funded(&node).await;
    node.lock_direct(lnescrow::node::DirectLockRequest {
        proof: asserted_proof("alice"),
        escrow_id: id,
        secret: "order-voucher-1234".to_string(),
    })
    .await
    .unwrap();

    vote(&node, "bob", id, VoteOutcome::Release).await;
    vote(&node, "alice", id, VoteOutcome::Release).await;

    let claim = node.claim(asserted_proof("bob"), id).await.unwrap();
    assert_eq!(claim.secret.as_deref(), Some("order-voucher-1234"));
    assert!(!claim.payout_ready);

    // Secret is gone; a second claim is rejected.
    assert!(matches!(
        node.claim(asserted_proof("bob"), id).await,
        Err(EscrowError::State { .. })
    ));
}
