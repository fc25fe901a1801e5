//! Signed masternode votes.
//!
//! Dua jenis vote dengan frame signed-message yang sama:
//! - [`BudgetVote`]: vote berarah (yes/no/abstain) pada sebuah proposal.
//! - [`FinalizedBudgetVote`]: dukungan (implicit yes) pada finalized budget.
//!
//! Identity hash sebuah vote mencakup voter, target, (arah,) dan timestamp,
//! sehingga vote susulan dari voter yang sama menghasilkan hash berbeda.
//! Canonical message yang ditandatangani TIDAK boleh berubah format:
//! perubahan apa pun membatalkan seluruh signature di network.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::crypto;
use crate::params::{BUDGET_VOTE_UPDATE_MIN, VOTE_MAX_TIME_DRIFT};
use crate::types::{Hash, OutPoint};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("proposal {0} not found")]
    UnknownProposal(Hash),

    #[error("finalized budget {0} not found")]
    UnknownBudget(Hash),

    #[error("unknown masternode {0}")]
    UnknownMasternode(OutPoint),

    #[error("vote signature invalid")]
    InvalidSignature,

    #[error("new vote older than existing vote")]
    Stale,

    #[error("time between votes is too soon - {elapsed} sec < {min} sec")]
    TooSoon { elapsed: i64, min: i64 },

    #[error("new vote is too far ahead of current time - {time} > max {max}")]
    TooFarAhead { time: i64, max: i64 },
}

/// Shared intake rule for both vote flavors: per-voter timestamps must be
/// monotonic, spaced at least `BUDGET_VOTE_UPDATE_MIN` apart, and no more
/// than one hour ahead of wall clock.
pub(crate) fn check_vote_update(
    existing_time: Option<i64>,
    vote_time: i64,
    now: i64,
) -> Result<(), VoteError> {
    if let Some(old_time) = existing_time {
        if old_time > vote_time {
            return Err(VoteError::Stale);
        }
        let elapsed = vote_time - old_time;
        if elapsed < BUDGET_VOTE_UPDATE_MIN {
            return Err(VoteError::TooSoon { elapsed, min: BUDGET_VOTE_UPDATE_MIN });
        }
    }
    let max = now + VOTE_MAX_TIME_DRIFT;
    if vote_time > max {
        return Err(VoteError::TooFarAhead { time: vote_time, max });
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// VOTE DIRECTION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteDirection {
    Abstain,
    Yes,
    No,
}

impl VoteDirection {
    /// Integer encoding carried in the signed message.
    pub fn as_int(&self) -> i32 {
        match self {
            VoteDirection::Abstain => 0,
            VoteDirection::Yes => 1,
            VoteDirection::No => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDirection::Abstain => "ABSTAIN",
            VoteDirection::Yes => "YES",
            VoteDirection::No => "NO",
        }
    }
}

fn default_true() -> bool {
    true
}

// ════════════════════════════════════════════════════════════════════════════
// PROPOSAL VOTE
// ════════════════════════════════════════════════════════════════════════════

/// Directional vote on a budget proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetVote {
    pub outpoint: OutPoint,
    pub proposal_hash: Hash,
    pub direction: VoteDirection,
    pub time: i64,
    pub signature: Vec<u8>,
    /// Local flag: voter currently resolves to a known masternode.
    #[serde(skip, default = "default_true")]
    pub valid: bool,
    /// Local flag: already announced to peers during a full sync.
    #[serde(skip)]
    pub synced: bool,
}

impl BudgetVote {
    pub fn new(outpoint: OutPoint, proposal_hash: Hash, direction: VoteDirection, time: i64) -> Self {
        BudgetVote {
            outpoint,
            proposal_hash,
            direction,
            time,
            signature: Vec::new(),
            valid: true,
            synced: false,
        }
    }

    pub fn hash(&self) -> Hash {
        crypto::hash_object(&(
            &self.outpoint,
            &self.proposal_hash,
            self.direction.as_int(),
            self.time,
        ))
        .expect("vote hash encoding cannot fail")
    }

    /// Canonical message covered by the signature.
    pub fn message(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}",
            self.outpoint.to_string_short(),
            self.proposal_hash,
            self.direction.as_int(),
            self.time
        )
        .into_bytes()
    }

    pub fn sign(&mut self, secret_key: &[u8]) -> anyhow::Result<()> {
        self.signature = crypto::sign_with_secret_key(secret_key, &self.message())?;
        Ok(())
    }

    pub fn check_signature(&self, pubkey: &[u8]) -> bool {
        crypto::verify_signature(pubkey, &self.message(), &self.signature).unwrap_or(false)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "masternode": self.outpoint.to_string(),
            "hash": self.hash().to_hex(),
            "vote": self.direction.as_str(),
            "time": self.time,
            "valid": self.valid,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FINALIZED BUDGET VOTE
// ════════════════════════════════════════════════════════════════════════════

/// Supporting vote on a finalized budget. Direction is implicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedBudgetVote {
    pub outpoint: OutPoint,
    pub budget_hash: Hash,
    pub time: i64,
    pub signature: Vec<u8>,
    #[serde(skip, default = "default_true")]
    pub valid: bool,
    #[serde(skip)]
    pub synced: bool,
}

impl FinalizedBudgetVote {
    pub fn new(outpoint: OutPoint, budget_hash: Hash, time: i64) -> Self {
        FinalizedBudgetVote {
            outpoint,
            budget_hash,
            time,
            signature: Vec::new(),
            valid: true,
            synced: false,
        }
    }

    pub fn hash(&self) -> Hash {
        crypto::hash_object(&(&self.outpoint, &self.budget_hash, self.time))
            .expect("vote hash encoding cannot fail")
    }

    pub fn message(&self) -> Vec<u8> {
        format!("{}{}{}", self.outpoint.to_string_short(), self.budget_hash, self.time).into_bytes()
    }

    pub fn sign(&mut self, secret_key: &[u8]) -> anyhow::Result<()> {
        self.signature = crypto::sign_with_secret_key(secret_key, &self.message())?;
        Ok(())
    }

    pub fn check_signature(&self, pubkey: &[u8]) -> bool {
        crypto::verify_signature(pubkey, &self.message(), &self.signature).unwrap_or(false)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "masternode": self.outpoint.to_string(),
            "hash": self.hash().to_hex(),
            "time": self.time,
            "valid": self.valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;

    fn outpoint() -> OutPoint {
        OutPoint::new(crate::crypto::sha3_256(b"mn collateral"), 0)
    }

    #[test]
    fn vote_hash_covers_time_and_direction() {
        let target = crate::crypto::sha3_256(b"proposal");
        let a = BudgetVote::new(outpoint(), target, VoteDirection::Yes, 1000);
        let b = BudgetVote::new(outpoint(), target, VoteDirection::Yes, 2000);
        let c = BudgetVote::new(outpoint(), target, VoteDirection::No, 1000);
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash(), BudgetVote::new(outpoint(), target, VoteDirection::Yes, 1000).hash());
    }

    #[test]
    fn sign_then_verify() {
        let (pk, sk) = crate::crypto::generate_keypair_bytes();
        let mut vote = BudgetVote::new(outpoint(), Hash::zero(), VoteDirection::Yes, 1000);
        vote.sign(&sk).unwrap();
        assert!(vote.check_signature(&pk));

        let mut tampered = vote.clone();
        tampered.time += 1;
        assert!(!tampered.check_signature(&pk));
    }

    #[test]
    fn update_rules_boundaries() {
        let now = 1_700_000_000;
        // no prior vote: only the future bound applies
        assert!(check_vote_update(None, now, now).is_ok());
        assert!(check_vote_update(None, now + VOTE_MAX_TIME_DRIFT, now).is_ok());
        assert_eq!(
            check_vote_update(None, now + VOTE_MAX_TIME_DRIFT + 1, now),
            Err(VoteError::TooFarAhead { time: now + VOTE_MAX_TIME_DRIFT + 1, max: now + VOTE_MAX_TIME_DRIFT })
        );

        // prior vote: monotonic and spaced
        let prev = now - 2 * BUDGET_VOTE_UPDATE_MIN;
        assert_eq!(check_vote_update(Some(now), now - 1, now).unwrap_err(), VoteError::Stale);
        assert_eq!(
            check_vote_update(Some(prev), prev + BUDGET_VOTE_UPDATE_MIN - 1, now),
            Err(VoteError::TooSoon { elapsed: BUDGET_VOTE_UPDATE_MIN - 1, min: BUDGET_VOTE_UPDATE_MIN })
        );
        assert!(check_vote_update(Some(prev), prev + BUDGET_VOTE_UPDATE_MIN + 1, now).is_ok());
    }

    #[test]
    fn finalized_vote_round_trips_without_local_flags() {
        let mut vote = FinalizedBudgetVote::new(outpoint(), crate::crypto::sha3_256(b"fb"), 1234);
        vote.valid = false;
        vote.synced = true;
        let bytes = bincode::serialize(&vote).unwrap();
        let back: FinalizedBudgetVote = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.hash(), vote.hash());
        // local flags reset to their defaults on the wire
        assert!(back.valid);
        assert!(!back.synced);
    }
}
