//! Escrow ledger - durable LMDB-backed storage
//!
//! Three databases inside one environment:
//! - `escrows`: binary key `id_be_u64(8)` → bincode `Escrow`.
//! - `votes`: composite key `id_be_u64(8) ++ role_tag(1)` → bincode `Vote`.
//!   The key itself enforces at most one vote per (escrow, role);
//!   big-endian ids sort lexicographically, so a prefix scan yields an
//!   escrow's votes.
//! - `meta`: string key → raw bytes; holds `schema_version` and the
//!   monotonic `next_escrow_id` counter.
//!
//! Mutators take the caller's expected status and compare it against
//! the stored record inside the write transaction, rejecting on
//! mismatch. The ledger does not arbitrate business rules beyond that;
//! eligibility lives in `voting` and the orchestrator.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use tracing::info;

use crate::{
    error::EscrowError,
    models::{Escrow, EscrowStatus, Role, Vote},
    EscrowResult,
};

/// The schema version the current code expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_KEY: &str = "schema_version";
const NEXT_ESCROW_ID_KEY: &str = "next_escrow_id";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const MAX_DBS: u32 = 3;

fn escrow_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn role_tag(role: Role) -> u8 {
    match role {
        Role::Seller => 0,
        Role::Buyer => 1,
        Role::Arbiter => 2,
    }
}

/// Composite key `id_be(8) ++ role_tag(1)` for the votes database.
fn vote_key(escrow_id: u64, role: Role) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[..8].copy_from_slice(&escrow_id.to_be_bytes());
    key[8] = role_tag(role);
    key
}

/// Durable escrow ledger over an LMDB environment.
pub struct Ledger {
    env: Arc<Env>,
    escrows: Database<Bytes, Bytes>,
    votes: Database<Bytes, Bytes>,
    meta: Database<Str, Bytes>,
}

impl Ledger {
    /// Open or create the ledger at the given directory, running any
    /// pending schema migrations.
    pub fn open(path: &Path) -> EscrowResult<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| EscrowError::storage(format!("cannot create ledger dir: {}", e)))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(DEFAULT_MAP_SIZE)
                .max_dbs(MAX_DBS)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let escrows = env.create_database(&mut wtxn, Some("escrows"))?;
        let votes = env.create_database(&mut wtxn, Some("votes"))?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        let ledger = Self {
            env: Arc::new(env),
            escrows,
            votes,
            meta,
        };
        Migrator::run(&ledger)?;
        Ok(ledger)
    }

    /// Flush and close the environment. Further use of clones of this
    /// ledger's env is undefined, so the node calls this only at shutdown.
    pub fn close(self) {
        info!("closing escrow ledger");
        // heed flushes on drop of the last Env handle.
        drop(self);
    }

    fn get_meta_u32(&self, key: &str) -> EscrowResult<Option<u32>> {
        let rtxn = self.env.read_txn()?;
        match self.meta.get(&rtxn, key)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| {
                    EscrowError::storage(format!("meta key '{}' has unexpected length", key))
                })?;
                Ok(Some(u32::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn put_meta_u32(&self, key: &str, value: u32) -> EscrowResult<()> {
        let mut wtxn = self.env.write_txn()?;
        self.meta.put(&mut wtxn, key, value.to_le_bytes().as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn schema_version(&self) -> EscrowResult<u32> {
        Ok(self.get_meta_u32(SCHEMA_VERSION_KEY)?.unwrap_or(0))
    }

    fn set_schema_version(&self, version: u32) -> EscrowResult<()> {
        self.put_meta_u32(SCHEMA_VERSION_KEY, version)
    }

    /// Create a new escrow record with a monotonically assigned id.
    /// Counter increment and record insert commit atomically.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        amount_msat: u64,
        description: String,
        terms: String,
        community_reference: String,
        seller_id: String,
        expires_at: DateTime<Utc>,
    ) -> EscrowResult<Escrow> {
        let mut wtxn = self.env.write_txn()?;

        let next_id = match self.meta.get(&wtxn, NEXT_ESCROW_ID_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| EscrowError::storage("next_escrow_id has unexpected length"))?;
                u64::from_le_bytes(arr)
            }
            None => 1,
        };

        let escrow = Escrow::new(
            next_id,
            amount_msat,
            description,
            terms,
            community_reference,
            seller_id,
            expires_at,
        );

        let bytes = bincode::serialize(&escrow)?;
        self.escrows
            .put(&mut wtxn, escrow_key(next_id).as_slice(), bytes.as_slice())?;
        self.meta
            .put(&mut wtxn, NEXT_ESCROW_ID_KEY, (next_id + 1).to_le_bytes().as_slice())?;
        wtxn.commit()?;

        Ok(escrow)
    }

    /// Fetch an escrow by id.
    pub fn get(&self, id: u64) -> EscrowResult<Option<Escrow>> {
        let rtxn = self.env.read_txn()?;
        match self.escrows.get(&rtxn, escrow_key(id).as_slice())? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch an escrow, mapping absence to a NotFound error.
    pub fn require(&self, id: u64) -> EscrowResult<Escrow> {
        self.get(id)?.ok_or(EscrowError::NotFound(id))
    }

    /// All escrows in which the identity holds any role.
    pub fn list_by_identity(&self, identity: &str) -> EscrowResult<Vec<Escrow>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.escrows.iter(&rtxn)? {
            let (_, bytes) = entry?;
            let escrow: Escrow = bincode::deserialize(bytes)?;
            if escrow.role_of(identity).is_some() {
                out.push(escrow);
            }
        }
        Ok(out)
    }

    /// All non-terminal escrows whose deadline has passed.
    pub fn list_overdue(&self, now: DateTime<Utc>) -> EscrowResult<Vec<Escrow>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.escrows.iter(&rtxn)? {
            let (_, bytes) = entry?;
            let escrow: Escrow = bincode::deserialize(bytes)?;
            if escrow.status.can_expire() && escrow.is_overdue(now) {
                out.push(escrow);
            }
        }
        Ok(out)
    }

    /// Conditionally update an escrow: the stored status must equal
    /// `expected` at commit time, otherwise the update is rejected with
    /// a conflict. The mutation runs inside the write transaction.
    pub fn update_conditional(
        &self,
        id: u64,
        expected: EscrowStatus,
        mutate: impl FnOnce(&mut Escrow),
    ) -> EscrowResult<Escrow> {
        let mut wtxn = self.env.write_txn()?;

        let stored = self
            .escrows
            .get(&wtxn, escrow_key(id).as_slice())?
            .ok_or(EscrowError::NotFound(id))?;
        let mut escrow: Escrow = bincode::deserialize(stored)?;

        if escrow.status != expected {
            return Err(EscrowError::conflict(format!(
                "escrow {} changed concurrently: expected {}, found {}",
                id, expected, escrow.status
            )));
        }

        mutate(&mut escrow);
        escrow.updated_at = Utc::now();

        let bytes = bincode::serialize(&escrow)?;
        self.escrows
            .put(&mut wtxn, escrow_key(id).as_slice(), bytes.as_slice())?;
        wtxn.commit()?;

        Ok(escrow)
    }

    /// Append a vote. The composite key rejects a second vote for the
    /// same (escrow, role) with a conflict.
    pub fn add_vote(&self, vote: &Vote) -> EscrowResult<()> {
        let mut wtxn = self.env.write_txn()?;
        let key = vote_key(vote.escrow_id, vote.role);

        if self.votes.get(&wtxn, key.as_slice())?.is_some() {
            return Err(EscrowError::conflict(format!(
                "{} has already voted on escrow {}",
                vote.role, vote.escrow_id
            )));
        }

        let bytes = bincode::serialize(vote)?;
        self.votes.put(&mut wtxn, key.as_slice(), bytes.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    /// All votes for an escrow, in role-tag order.
    pub fn votes_for(&self, escrow_id: u64) -> EscrowResult<Vec<Vote>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.votes.prefix_iter(&rtxn, escrow_key(escrow_id).as_slice())? {
            let (_, bytes) = entry?;
            out.push(bincode::deserialize(bytes)?);
        }
        Ok(out)
    }
}

/// Runs schema migrations on open.
///
/// - Version 0 means a fresh database (no marker stored yet).
/// - If the stored version matches `CURRENT_SCHEMA_VERSION`, this is a no-op.
/// - A stored version *newer* than the code supports means the database
///   was written by a newer build; refuse to open it.
pub struct Migrator;

impl Migrator {
    pub fn run(ledger: &Ledger) -> EscrowResult<()> {
        let current = ledger.schema_version()?;

        if current == CURRENT_SCHEMA_VERSION {
            info!(version = current, "ledger schema is up to date");
            return Ok(());
        }

        if current > CURRENT_SCHEMA_VERSION {
            return Err(EscrowError::storage(format!(
                "ledger schema version {} is newer than supported version {}",
                current, CURRENT_SCHEMA_VERSION
            )));
        }

        for version in current..CURRENT_SCHEMA_VERSION {
            info!(from = version, to = version + 1, "running ledger migration");
            run_migration(version, version + 1)?;
        }

        ledger.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        info!(version = CURRENT_SCHEMA_VERSION, "ledger migration complete");
        Ok(())
    }
}

fn run_migration(from: u32, to: u32) -> EscrowResult<()> {
    match (from, to) {
        (0, 1) => {
            // Initial schema: escrows, votes and meta databases created
            // on open; nothing to migrate from a blank slate.
            Ok(())
        }
        _ => Err(EscrowError::storage(format!(
            "unknown ledger migration: {} -> {}",
            from, to
        ))),
    }
}
