//! Finalized budget entity.
//!
//! Sebuah finalized budget adalah slate pembayaran proposal yang dipatok ke
//! satu superblock. Masternode memberikan supporting vote pada slate yang
//! cocok dengan hasil perhitungan lokalnya; slate dengan dukungan terbanyak
//! menentukan pembayaran yang wajib ada di block.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::crypto;
use crate::external::{ChainIndex, Inv, InvType, MasternodeDirectory};
use crate::params::{ChainParams, MAX_FINALIZED_BUDGET_PAYMENTS};
use crate::proposal::{ParseError, MAX_NAME_LEN};
use crate::types::{Amount, Hash, Script, Transaction};
use crate::vote::{check_vote_update, FinalizedBudgetVote, VoteError};

/// Outcome of validating a block transaction against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxValidationStatus {
    /// Transaction carries the expected budget payment.
    Valid,
    /// Transaction does not carry the expected payment.
    Invalid,
    /// The payment was already made in a different on-chain block.
    DoublePayment,
    /// No finalized budget reached the vote threshold; the caller pays a
    /// masternode instead.
    VoteThreshold,
}

/// One scheduled payment inside a finalized budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPayment {
    pub proposal_hash: Hash,
    pub payee: Script,
    pub amount: Amount,
}

/// Network serialization of a finalized budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedBudgetBroadcast {
    pub name: String,
    pub block_start: i64,
    pub payments: Vec<BudgetPayment>,
    pub fee_tx_hash: Hash,
}

// ════════════════════════════════════════════════════════════════════════════
// ENTITY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedBudget {
    pub name: String,
    pub block_start: i64,
    pub payments: Vec<BudgetPayment>,
    pub fee_tx_hash: Hash,
    /// Collateral block time, set at admission.
    pub time: i64,
    pub valid: bool,
    pub invalid_reason: String,
    /// Display string resolving payment hashes to proposal names.
    pub proposals_display: String,
    /// Auto-check runs once per lifetime; flag is local state.
    #[serde(skip)]
    pub auto_checked: bool,
    votes: HashMap<crate::types::OutPoint, FinalizedBudgetVote>,
    /// Per-cycle payment history: proposal hash -> (paid block hash, height).
    /// Local double-payment cache, never exchanged or persisted.
    #[serde(skip)]
    payment_history: HashMap<Hash, (Hash, i64)>,
}

impl FinalizedBudget {
    pub fn new(name: String, block_start: i64, payments: Vec<BudgetPayment>, fee_tx_hash: Hash) -> Self {
        FinalizedBudget {
            name,
            block_start,
            payments,
            fee_tx_hash,
            time: 0,
            valid: true,
            invalid_reason: String::new(),
            proposals_display: String::new(),
            auto_checked: false,
            votes: HashMap::new(),
            payment_history: HashMap::new(),
        }
    }

    pub fn from_broadcast(b: FinalizedBudgetBroadcast) -> Result<Self, ParseError> {
        if b.name.len() > MAX_NAME_LEN {
            return Err(ParseError::NameTooLong(b.name.len()));
        }
        if b.payments.len() > MAX_FINALIZED_BUDGET_PAYMENTS {
            return Err(ParseError::TooManyPayments(b.payments.len()));
        }
        Ok(FinalizedBudget::new(b.name, b.block_start, b.payments, b.fee_tx_hash))
    }

    pub fn broadcast(&self) -> FinalizedBudgetBroadcast {
        FinalizedBudgetBroadcast {
            name: self.name.clone(),
            block_start: self.block_start,
            payments: self.payments.clone(),
            fee_tx_hash: self.fee_tx_hash,
        }
    }

    /// Identity hash over name, start and the full payment slate.
    pub fn hash(&self) -> Hash {
        crypto::hash_object(&(&self.name, self.block_start, &self.payments))
            .expect("finalized budget hash encoding cannot fail")
    }

    /// One payment per block, starting at the superblock.
    pub fn block_end(&self) -> i64 {
        self.block_start + self.payments.len() as i64 - 1
    }

    // ────────────────────────────────────────────────────────────────────
    // Well-formedness
    // ────────────────────────────────────────────────────────────────────

    fn check_name(&mut self) -> bool {
        if self.name.is_empty() {
            self.invalid_reason = "invalid budget name".into();
            return false;
        }
        true
    }

    fn check_start_end(&mut self, params: &ChainParams) -> bool {
        if self.block_start == 0 {
            self.invalid_reason = "invalid block start == 0".into();
            return false;
        }
        // payment must land on a superblock
        if self.block_start % params.budget_cycle_blocks != 0 {
            self.invalid_reason = "invalid block start (not a superblock)".into();
            return false;
        }
        // both bounds cover the same thing: at most 100 payments
        if self.block_end() - self.block_start > MAX_FINALIZED_BUDGET_PAYMENTS as i64 {
            self.invalid_reason = "invalid block end".into();
            return false;
        }
        if self.payments.len() > MAX_FINALIZED_BUDGET_PAYMENTS {
            self.invalid_reason = "invalid budget payments count (too many)".into();
            return false;
        }
        true
    }

    fn check_amount(&mut self, total_budget: Amount) -> bool {
        if self.total_payout() > total_budget {
            self.invalid_reason = "invalid payout (more than max)".into();
            return false;
        }
        true
    }

    pub fn is_well_formed(&mut self, total_budget: Amount, params: &ChainParams) -> bool {
        self.check_start_end(params) && self.check_amount(total_budget) && self.check_name()
    }

    // ────────────────────────────────────────────────────────────────────
    // Validity lifecycle
    // ────────────────────────────────────────────────────────────────────

    /// Expired once the last payment block fell behind the most recent
    /// superblock.
    pub fn is_expired(&mut self, current_height: i64, params: &ChainParams) -> bool {
        let cycle = params.budget_cycle_blocks;
        let last_superblock = current_height - current_height % cycle;
        if self.block_end() < last_superblock {
            self.invalid_reason =
                format!("(ends at block {}) too old and obsolete", self.block_end());
            return true;
        }
        false
    }

    pub fn update_valid(&mut self, current_height: i64, params: &ChainParams) -> bool {
        self.valid = false;
        if self.is_expired(current_height, params) {
            return false;
        }
        self.valid = true;
        self.invalid_reason.clear();
        true
    }

    // ────────────────────────────────────────────────────────────────────
    // Votes
    // ────────────────────────────────────────────────────────────────────

    pub fn add_or_update_vote(&mut self, vote: FinalizedBudgetVote, now: i64) -> Result<(), VoteError> {
        let key = vote.outpoint;
        let existing = self.votes.get(&key).map(|v| v.time);
        check_vote_update(existing, vote.time, now)?;
        let action = if existing.is_some() { "existing vote updated" } else { "new vote inserted" };
        debug!(budget = %self.name, voter = %key, "{}", action);
        self.votes.insert(key, vote);
        Ok(())
    }

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

    pub fn vote_invs(&self, partial: bool) -> Vec<Inv> {
        self.votes
            .values()
            .filter(|v| v.valid && (!partial || !v.synced))
            .map(|v| Inv::new(InvType::FinalizedBudgetVote, v.hash()))
            .collect()
    }

    pub fn find_vote(&self, hash: &Hash) -> Option<&FinalizedBudgetVote> {
        self.votes.values().find(|v| v.hash() == *hash)
    }

    pub fn vote_count(&self) -> i64 {
        self.votes.len() as i64
    }

    pub fn votes_json(&self) -> serde_json::Value {
        json!(self
            .votes
            .values()
            .map(|v| (v.outpoint.to_string_short(), v.to_json()))
            .collect::<HashMap<_, _>>())
    }

    // ────────────────────────────────────────────────────────────────────
    // Payments
    // ────────────────────────────────────────────────────────────────────

    pub fn total_payout(&self) -> Amount {
        self.payments
            .iter()
            .fold(Amount::zero(), |acc, p| acc.saturating_add(p.amount))
    }

    pub fn proposal_hashes(&self) -> Vec<Hash> {
        self.payments.iter().map(|p| p.proposal_hash).collect()
    }

    pub fn payment_by_block(&self, height: i64) -> Option<&BudgetPayment> {
        let i = height - self.block_start;
        if i < 0 {
            return None;
        }
        self.payments.get(i as usize)
    }

    pub fn payee_and_amount(&self, height: i64) -> Option<(Script, Amount)> {
        self.payment_by_block(height).map(|p| (p.payee.clone(), p.amount))
    }

    // ────────────────────────────────────────────────────────────────────
    // Double-payment detection
    // ────────────────────────────────────────────────────────────────────

    /// Record/check a payment occurrence for the current cycle.
    ///
    /// Entries outside `[block_start, block_end]` are evicted first. A
    /// proposal not yet recorded is recorded and reported unpaid. A proposal
    /// recorded under a *different* block hash that is on the active chain is
    /// a double payment; re-checking the same block is not.
    pub fn is_paid_already(
        &mut self,
        proposal_hash: &Hash,
        block_hash: &Hash,
        block_height: i64,
        chain: &dyn ChainIndex,
    ) -> bool {
        let start = self.block_start;
        let end = self.block_end();
        self.payment_history.retain(|old_hash, (_, paid_height)| {
            let keep = *paid_height >= start && *paid_height <= end;
            if !keep {
                debug!(budget = %self.name, proposal = %old_hash, height = paid_height,
                       "payment history entry from old cycle deleted");
            }
            keep
        });

        match self.payment_history.get(proposal_hash) {
            None => {
                self.payment_history.insert(*proposal_hash, (*block_hash, block_height));
                debug!(budget = %self.name, proposal = %proposal_hash, height = block_height,
                       entries = self.payment_history.len(), "added to payment history");
                false
            }
            Some((paid_block_hash, _)) if paid_block_hash != block_hash => {
                // Checking a different block while the paid one is on chain:
                // reject so the block pays a masternode instead.
                chain.active_chain_contains(paid_block_hash)
            }
            // Re-checking the same block. Not a double payment.
            Some(_) => false,
        }
    }

    /// Validate a coinbase/coinstake transaction at `block_height` against
    /// this budget's scheduled payment.
    pub fn is_transaction_valid(
        &mut self,
        tx: &Transaction,
        block_hash: &Hash,
        block_height: i64,
        chain: &dyn ChainIndex,
    ) -> TrxValidationStatus {
        if block_height > self.block_end() {
            debug!(budget = %self.name, height = block_height, end = self.block_end(), "block out of range");
            return TrxValidationStatus::Invalid;
        }
        if block_height < self.block_start {
            debug!(budget = %self.name, height = block_height, start = self.block_start, "block out of range");
            return TrxValidationStatus::Invalid;
        }

        let current_payment = (block_height - self.block_start) as usize;
        let payment = match self.payments.get(current_payment) {
            Some(p) => p.clone(),
            None => {
                debug!(budget = %self.name, index = current_payment, total = self.payments.len(),
                       "no payment scheduled for block");
                return TrxValidationStatus::Invalid;
            }
        };

        // If this proposal was paid already, pay a masternode instead.
        // One double payment disables all budget payments for this block.
        if self.is_paid_already(&payment.proposal_hash, block_hash, block_height, chain) {
            debug!(budget = %self.name, proposal = %payment.proposal_hash, amount = %payment.amount,
                   "double budget payment detected");
            return TrxValidationStatus::DoublePayment;
        }

        // Budget payment is usually the last output of coinstake txes,
        // iterate backwards.
        for out in tx.outputs.iter().rev() {
            if out.script == payment.payee && out.value == payment.amount {
                debug!(budget = %self.name, proposal = %payment.proposal_hash, amount = %payment.amount,
                       "found valid budget payment");
                return TrxValidationStatus::Valid;
            }
        }

        debug!(budget = %self.name, payee = %payment.payee.destination_display(),
               amount = %payment.amount, "missing required payment");
        TrxValidationStatus::Invalid
    }

    // ────────────────────────────────────────────────────────────────────
    // Auto-vote comparison
    // ────────────────────────────────────────────────────────────────────

    /// Whether this budget's slate matches the locally computed one.
    ///
    /// `local_slate` must already be sorted by proposal hash descending; the
    /// own payments are sorted the same way, and the two lists must agree
    /// pairwise on hash, payee and amount. This exact ordering is what makes
    /// independent nodes agree.
    pub fn matches_local_slate(&self, local_slate: &[BudgetPayment]) -> bool {
        if local_slate.is_empty() {
            debug!(budget = %self.name, "no local proposals, aborting slate comparison");
            return false;
        }

        let mut own: Vec<&BudgetPayment> = self.payments.iter().collect();
        own.sort_by(|a, b| b.proposal_hash.cmp(&a.proposal_hash));

        if own.len() != local_slate.len() {
            debug!(budget = %self.name, own = own.len(), local = local_slate.len(),
                   "slate length mismatch");
            return false;
        }

        for (i, (ours, local)) in own.iter().zip(local_slate.iter()).enumerate() {
            if ours.proposal_hash != local.proposal_hash {
                debug!(budget = %self.name, item = i, "slate proposal hash mismatch");
                return false;
            }
            if ours.payee != local.payee {
                debug!(budget = %self.name, item = i, "slate payee mismatch");
                return false;
            }
            if ours.amount != local.amount {
                debug!(budget = %self.name, item = i, "slate amount mismatch");
                return false;
            }
        }
        true
    }

    /// Selection order: vote count descending, collateral hash descending.
    pub fn cmp_by_votes(a: &FinalizedBudget, b: &FinalizedBudget) -> Ordering {
        match b.vote_count().cmp(&a.vote_count()) {
            Ordering::Equal => b.fee_tx_hash.cmp(&a.fee_tx_hash),
            ord => ord,
        }
    }
}
