//! Budget proposal entity: a single funding request masternodes vote on.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::crypto;
use crate::external::{Inv, InvType, MasternodeDirectory};
use crate::params::{ChainParams, PROPOSAL_MIN_AMOUNT};
use crate::types::{Amount, Hash, OutPoint, Script};
use crate::vote::{check_vote_update, BudgetVote, VoteDirection, VoteError};

/// Broadcast field limits. Names and URLs are bounded on the wire; anything
/// longer is a parse error, not a truncation.
pub const MAX_NAME_LEN: usize = 20;
pub const MAX_URL_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("name too long ({0} > {MAX_NAME_LEN} bytes)")]
    NameTooLong(usize),

    #[error("url too long ({0} > {MAX_URL_LEN} bytes)")]
    UrlTooLong(usize),

    #[error("too many budget payments ({0})")]
    TooManyPayments(usize),
}

// ════════════════════════════════════════════════════════════════════════════
// WIRE FORM
// ════════════════════════════════════════════════════════════════════════════

/// Network serialization of a proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalBroadcast {
    pub name: String,
    pub url: String,
    pub time: i64,
    pub block_start: i64,
    pub block_end: i64,
    pub amount: Amount,
    pub payee: Script,
    pub fee_tx_hash: Hash,
}

// ════════════════════════════════════════════════════════════════════════════
// ENTITY
// ════════════════════════════════════════════════════════════════════════════

/// A funding request: payee, amount, payment cycle range, collateral, and the
/// tally of masternode votes keyed by voter outpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetProposal {
    pub name: String,
    pub url: String,
    pub block_start: i64,
    pub block_end: i64,
    pub payee: Script,
    pub amount: Amount,
    pub fee_tx_hash: Hash,
    /// Creation time declared by the author; part of the identity hash.
    pub time: i64,
    /// Collateral block time, set at admission. Establishment is measured
    /// from here so it cannot be backdated.
    pub collateral_time: i64,
    pub valid: bool,
    pub invalid_reason: String,
    /// Amount granted by the most recent allocation round (0 = not admitted).
    pub allotted: Amount,
    votes: HashMap<OutPoint, BudgetVote>,
}

impl BudgetProposal {
    /// Build a proposal from author inputs, snapping the payment range onto
    /// the cycle grid: the range ends `(cycle + 1) * payment_count` blocks
    /// after the start of the cycle containing `block_start`.
    pub fn new(
        name: String,
        url: String,
        payment_count: i64,
        payee: Script,
        amount: Amount,
        block_start: i64,
        fee_tx_hash: Hash,
        params: &ChainParams,
    ) -> Self {
        let cycle = params.budget_cycle_blocks;
        let cycle_start = block_start - block_start % cycle;
        let block_end = cycle_start + (cycle + 1) * payment_count;
        BudgetProposal {
            name,
            url,
            block_start,
            block_end,
            payee,
            amount,
            fee_tx_hash,
            time: 0,
            collateral_time: 0,
            valid: true,
            invalid_reason: String::new(),
            allotted: Amount::zero(),
            votes: HashMap::new(),
        }
    }

    pub fn from_broadcast(b: ProposalBroadcast) -> Result<Self, ParseError> {
        if b.name.len() > MAX_NAME_LEN {
            return Err(ParseError::NameTooLong(b.name.len()));
        }
        if b.url.len() > MAX_URL_LEN {
            return Err(ParseError::UrlTooLong(b.url.len()));
        }
        Ok(BudgetProposal {
            name: b.name,
            url: b.url,
            block_start: b.block_start,
            block_end: b.block_end,
            payee: b.payee,
            amount: b.amount,
            fee_tx_hash: b.fee_tx_hash,
            time: b.time,
            collateral_time: 0,
            valid: true,
            invalid_reason: String::new(),
            allotted: Amount::zero(),
            votes: HashMap::new(),
        })
    }

    pub fn broadcast(&self) -> ProposalBroadcast {
        ProposalBroadcast {
            name: self.name.clone(),
            url: self.url.clone(),
            time: self.time,
            block_start: self.block_start,
            block_end: self.block_end,
            amount: self.amount,
            payee: self.payee.clone(),
            fee_tx_hash: self.fee_tx_hash,
        }
    }

    /// Identity hash. Two proposals with identical parameters collide on
    /// purpose: the collateral is bound to this hash.
    pub fn hash(&self) -> Hash {
        crypto::hash_object(&(
            &self.name,
            &self.url,
            self.block_start,
            self.block_end,
            &self.amount,
            &self.payee,
            self.time,
        ))
        .expect("proposal hash encoding cannot fail")
    }

    // ────────────────────────────────────────────────────────────────────
    // Well-formedness
    // ────────────────────────────────────────────────────────────────────

    fn check_start_end(&mut self) -> bool {
        if self.block_start < 0 {
            self.invalid_reason = "invalid block start".into();
            return false;
        }
        if self.block_end < self.block_start {
            self.invalid_reason = "invalid block end (end before start)".into();
            return false;
        }
        true
    }

    fn check_amount(&mut self, total_budget: Amount) -> bool {
        if self.amount < PROPOSAL_MIN_AMOUNT {
            self.invalid_reason = "invalid amount (too low)".into();
            return false;
        }
        if self.amount > total_budget {
            self.invalid_reason = "invalid amount (too high)".into();
            return false;
        }
        true
    }

    fn check_payee(&mut self) -> bool {
        // Multisig payees stay unsupported in the coinbase path.
        if self.payee.is_pay_to_script_hash() {
            self.invalid_reason = "multisig is not currently supported".into();
            return false;
        }
        if self.payee.destination().is_none() {
            self.invalid_reason = "invalid recipient address".into();
            return false;
        }
        true
    }

    pub fn is_well_formed(&mut self, total_budget: Amount) -> bool {
        self.check_start_end() && self.check_amount(total_budget) && self.check_payee()
    }

    // ────────────────────────────────────────────────────────────────────
    // Validity lifecycle
    // ────────────────────────────────────────────────────────────────────

    pub fn is_heavily_downvoted(&mut self, enabled_masternodes: i64) -> bool {
        if self.nays() - self.yeas() > enabled_masternodes / 10 {
            self.invalid_reason = "active removal".into();
            return true;
        }
        false
    }

    pub fn is_expired(&mut self, current_height: i64) -> bool {
        if self.block_end < current_height {
            self.invalid_reason = "proposal expired".into();
            return true;
        }
        false
    }

    /// Recompute the validity flag. Invalid proposals are evicted by the next
    /// maintenance pass.
    pub fn update_valid(&mut self, current_height: i64, enabled_masternodes: i64) -> bool {
        self.valid = false;
        if self.is_heavily_downvoted(enabled_masternodes) {
            return false;
        }
        if self.is_expired(current_height) {
            return false;
        }
        self.valid = true;
        self.invalid_reason.clear();
        true
    }

    /// A proposal only counts once its collateral has been on chain for the
    /// establishment window.
    pub fn is_established(&self, now: i64, establishment_window: i64) -> bool {
        now - self.collateral_time > establishment_window
    }

    /// Passing predicate used by the allocation round for the candidate cycle
    /// `[block_start_budget, block_end_budget]`.
    pub fn is_passing(
        &self,
        block_start_budget: i64,
        block_end_budget: i64,
        enabled_masternodes: i64,
        now: i64,
        establishment_window: i64,
    ) -> bool {
        if !self.valid {
            return false;
        }
        if self.block_start > block_start_budget {
            return false;
        }
        if self.block_end < block_end_budget {
            return false;
        }
        if self.net_yes() <= enabled_masternodes / 10 {
            return false;
        }
        if !self.is_established(now, establishment_window) {
            return false;
        }
        true
    }

    // ────────────────────────────────────────────────────────────────────
    // Votes
    // ────────────────────────────────────────────────────────────────────

    /// Insert or replace the voter's vote. One slot per voter outpoint; the
    /// stored vote is the most recent accepted one.
    pub fn add_or_update_vote(&mut self, vote: BudgetVote, now: i64) -> Result<(), VoteError> {
        let key = vote.outpoint;
        let existing = self.votes.get(&key).map(|v| v.time);
        check_vote_update(existing, vote.time, now)?;
        let action = if existing.is_some() { "existing vote updated" } else { "new vote inserted" };
        debug!(proposal = %self.name, voter = %key, vote = vote.direction.as_str(), "{}", action);
        self.votes.insert(key, vote);
        Ok(())
    }

    /// Re-flag each stored vote: valid iff its voter still resolves to a
    /// known masternode.
    pub fn clean_and_remove(&mut self, directory: &dyn MasternodeDirectory) {
        for vote in self.votes.values_mut() {
            vote.valid = directory.find(&vote.outpoint).is_some();
        }
    }

    pub fn set_synced(&mut self, synced: bool) {
        for vote in self.votes.values_mut() {
            if synced {
                if vote.valid {
                    vote.synced = true;
                }
            } else {
                vote.synced = false;
            }
        }
    }

    /// Inventory items for this proposal's votes. Partial mode skips votes
    /// already flagged synced.
    pub fn vote_invs(&self, partial: bool) -> Vec<Inv> {
        self.votes
            .values()
            .filter(|v| v.valid && (!partial || !v.synced))
            .map(|v| Inv::new(InvType::BudgetVote, v.hash()))
            .collect()
    }

    pub fn find_vote(&self, hash: &Hash) -> Option<&BudgetVote> {
        self.votes.values().find(|v| v.hash() == *hash)
    }

    pub fn vote_count(&self, direction: VoteDirection) -> i64 {
        self.votes
            .values()
            .filter(|v| v.direction == direction && v.valid)
            .count() as i64
    }

    pub fn yeas(&self) -> i64 { self.vote_count(VoteDirection::Yes) }
    pub fn nays(&self) -> i64 { self.vote_count(VoteDirection::No) }
    pub fn abstains(&self) -> i64 { self.vote_count(VoteDirection::Abstain) }

    pub fn net_yes(&self) -> i64 {
        self.yeas() - self.nays()
    }

    pub fn ratio(&self) -> f64 {
        let yeas = self.yeas();
        let nays = self.nays();
        if yeas + nays == 0 {
            return 0.0;
        }
        yeas as f64 / (yeas + nays) as f64
    }

    pub fn votes_json(&self) -> serde_json::Value {
        json!(self.votes.values().map(|v| v.to_json()).collect::<Vec<_>>())
    }

    // ────────────────────────────────────────────────────────────────────
    // Payment schedule helpers
    // ────────────────────────────────────────────────────────────────────

    fn block_cycle(height: i64, cycle: i64) -> i64 {
        height - height % cycle
    }

    pub fn total_payment_count(&self, params: &ChainParams) -> i64 {
        let cycle = params.budget_cycle_blocks;
        (self.block_end - Self::block_cycle(self.block_start, cycle)) / cycle
    }

    pub fn remaining_payment_count(&self, current_height: i64, params: &ChainParams) -> i64 {
        let cycle = params.budget_cycle_blocks;
        let payments = (self.block_end - Self::block_cycle(current_height, cycle)) / cycle - 1;
        payments.min(self.total_payment_count(params))
    }

    /// Allocation order: net yes descending, collateral hash descending as a
    /// deterministic cross-node tiebreak.
    pub fn cmp_by_net_yes(a: &BudgetProposal, b: &BudgetProposal) -> Ordering {
        match b.net_yes().cmp(&a.net_yes()) {
            Ordering::Equal => b.fee_tx_hash.cmp(&a.fee_tx_hash),
            ord => ord,
        }
    }

    /// Hash-descending order used by the deterministic auto-vote comparison.
    pub fn cmp_by_hash_desc(a: &BudgetProposal, b: &BudgetProposal) -> Ordering {
        b.hash().cmp(&a.hash())
    }
}
