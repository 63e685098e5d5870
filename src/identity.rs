//! Identity collaborator boundary
//!
//! Inbound actions carry a proof of possession: a signature over a
//! canonicalized request descriptor (method, path, body digest,
//! timestamp). Verification yields the caller's stable opaque identity
//! handle. Absent, invalid or stale proofs are rejected with an
//! authorization error; nothing downstream ever sees an unverified
//! identity.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};

use crate::{error::EscrowError, EscrowResult};

/// Proof of possession attached to one inbound request.
#[derive(Debug, Clone)]
pub struct RequestProof {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// Hex-encoded compressed secp256k1 public key; doubles as the
    /// caller's stable identity handle.
    pub public_key: String,
    /// Hex-encoded compact ECDSA signature over the canonical descriptor.
    pub signature: String,
}

/// Canonical descriptor bytes that get signed: method, path, body
/// digest and timestamp, newline-separated. Clients must produce the
/// exact same bytes.
pub fn canonical_descriptor(
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: DateTime<Utc>,
) -> Vec<u8> {
    let body_digest = hex::encode(Sha256::digest(body));
    format!(
        "{}\n{}\n{}\n{}",
        method,
        path,
        body_digest,
        timestamp.to_rfc3339()
    )
    .into_bytes()
}

/// Verifies request proofs into identity handles.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, proof: &RequestProof) -> EscrowResult<String>;
}

/// Signature-based verifier with a freshness window.
pub struct SignatureVerifier {
    secp: Secp256k1<VerifyOnly>,
    freshness: Duration,
}

impl SignatureVerifier {
    pub fn new(freshness_secs: i64) -> Self {
        Self {
            secp: Secp256k1::verification_only(),
            freshness: Duration::seconds(freshness_secs),
        }
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new(60)
    }
}

#[async_trait]
impl IdentityVerifier for SignatureVerifier {
    async fn verify(&self, proof: &RequestProof) -> EscrowResult<String> {
        if proof.public_key.is_empty() || proof.signature.is_empty() {
            return Err(EscrowError::authorization("missing identity proof"));
        }

        let age = Utc::now() - proof.timestamp;
        if age > self.freshness || age < -self.freshness {
            return Err(EscrowError::authorization("identity proof is stale"));
        }

        let key_bytes = hex::decode(&proof.public_key)
            .map_err(|_| EscrowError::authorization("malformed public key"))?;
        let public_key = PublicKey::from_slice(&key_bytes)
            .map_err(|_| EscrowError::authorization("malformed public key"))?;

        let sig_bytes = hex::decode(&proof.signature)
            .map_err(|_| EscrowError::authorization("malformed signature"))?;
        let signature = Signature::from_compact(&sig_bytes)
            .map_err(|_| EscrowError::authorization("malformed signature"))?;

        let descriptor =
            canonical_descriptor(&proof.method, &proof.path, &proof.body, proof.timestamp);
        let digest: [u8; 32] = Sha256::digest(&descriptor).into();
        let message = Message::from_digest(digest);

        self.secp
            .verify_ecdsa(&message, &signature, &public_key)
            .map_err(|_| EscrowError::authorization("invalid identity proof"))?;

        Ok(proof.public_key.clone())
    }
}

/// Non-production verifier that trusts the asserted key without a
/// signature. Used by tests and local demos only.
pub struct InsecureVerifier;

#[async_trait]
impl IdentityVerifier for InsecureVerifier {
    async fn verify(&self, proof: &RequestProof) -> EscrowResult<String> {
        if proof.public_key.is_empty() {
            return Err(EscrowError::authorization("missing identity proof"));
        }
        Ok(proof.public_key.clone())
    }
}

/// Build an unsigned proof asserting an identity, accepted only by
/// `InsecureVerifier`.
pub fn asserted_proof(identity: &str) -> RequestProof {
    RequestProof {
        method: String::new(),
        path: String::new(),
        body: Vec::new(),
        timestamp: Utc::now(),
        public_key: identity.to_string(),
        signature: String::new(),
    }
}
