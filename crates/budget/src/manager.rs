//! Budget manager: pusat state governance.
//!
//! Manager memiliki empat map yang masing-masing dijaga mutex independen:
//!
//! | Region | Isi |
//! |---|---|
//! | `proposals` | hash → [`BudgetProposal`] |
//! | `finalized` | hash → [`FinalizedBudget`] |
//! | `proposal_votes` | seen votes (vote hash → vote) + orphan votes (proposal hash → vote) |
//! | `finalized_votes` | seen + orphan finalized-budget votes |
//!
//! ## Lock discipline
//!
//! - Lock chain-state milik host selalu berada DI ATAS lock budget: caller
//!   `is_transaction_valid` sudah memegang chain lock, dan
//!   `add_proposal`/`add_finalized_budget` menjalankan verifikasi collateral
//!   SEBELUM mengambil lock map tujuan.
//! - Tidak ada path yang memegang dua lock budget sekaligus; data yang
//!   dibutuhkan lintas region di-snapshot dulu, lock dilepas, baru region
//!   berikutnya diambil.
//! - Cleanup di `new_block` memakai `try_lock` dan mundur bila contended.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::collateral::{check_collateral, CollateralError};
use crate::external::{
    ActiveMasternode, BudgetMessage, BudgetNetwork, BudgetSyncTracker, BudgetWallet, ChainIndex,
    Inv, InvType, MasternodeDirectory, PeerId,
};
use crate::finalized::{BudgetPayment, FinalizedBudget, FinalizedBudgetBroadcast, TrxValidationStatus};
use crate::params::{
    ChainParams, Network, MAINTENANCE_INTERVAL_BLOCKS, MISBEHAVING_SCORE, SOURCE_REQUEST_EXPIRY,
    SYNC_BUDGET_FIN, SYNC_BUDGET_PROP,
};
use crate::proposal::{BudgetProposal, ParseError, ProposalBroadcast};
use crate::types::{current_unix_time, Amount, Hash, Script, Transaction};
use crate::vote::{BudgetVote, FinalizedBudgetVote, VoteError};

/// Budget participation mode, from the node's configuration string.
/// `suggest` authors finalized budgets, `auto` self-votes on matching ones,
/// anything else disables both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMode {
    Suggest,
    Auto,
    Disabled,
}

impl BudgetMode {
    pub fn from_config(s: &str) -> Self {
        match s {
            "suggest" => BudgetMode::Suggest,
            "auto" => BudgetMode::Auto,
            _ => BudgetMode::Disabled,
        }
    }
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("item {0} already added")]
    Duplicate(Hash),

    #[error("invalid item: {0}")]
    NotWellFormed(String),

    #[error(transparent)]
    Collateral(#[from] CollateralError),

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Seen/orphan caches for one vote flavor. Orphans are keyed by the *target*
/// hash so a late-arriving proposal immediately finds its parked vote.
struct VoteCache<V> {
    seen: HashMap<Hash, V>,
    orphans: HashMap<Hash, V>,
}

impl<V> Default for VoteCache<V> {
    fn default() -> Self {
        VoteCache { seen: HashMap::new(), orphans: HashMap::new() }
    }
}

/// Disk image of the manager state (`budget.dat` body).
#[derive(Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub proposals: HashMap<Hash, BudgetProposal>,
    pub finalized: HashMap<Hash, FinalizedBudget>,
    pub seen_proposal_votes: HashMap<Hash, BudgetVote>,
    pub orphan_proposal_votes: HashMap<Hash, BudgetVote>,
    pub seen_finalized_votes: HashMap<Hash, FinalizedBudgetVote>,
    pub orphan_finalized_votes: HashMap<Hash, FinalizedBudgetVote>,
}

// ════════════════════════════════════════════════════════════════════════════
// BUDGET MANAGER
// ════════════════════════════════════════════════════════════════════════════

pub struct BudgetManager {
    params: ChainParams,
    mode: BudgetMode,

    chain: Arc<dyn ChainIndex>,
    masternodes: Arc<dyn MasternodeDirectory>,
    network: Arc<dyn BudgetNetwork>,
    wallet: Arc<dyn BudgetWallet>,
    sync_tracker: Arc<dyn BudgetSyncTracker>,

    proposals: Mutex<HashMap<Hash, BudgetProposal>>,
    finalized: Mutex<HashMap<Hash, FinalizedBudget>>,
    proposal_votes: Mutex<VoteCache<BudgetVote>>,
    finalized_votes: Mutex<VoteCache<FinalizedBudgetVote>>,

    best_height: AtomicI64,
    /// Superblock height the submitter last finished a submission for.
    submitted_height: AtomicI64,
    /// Outstanding source requests: target hash → time asked.
    asked_for_source: Mutex<HashMap<Hash, i64>>,
    /// Peers that already used their one full vote-sync request (mainnet).
    fulfilled_vote_sync: Mutex<HashSet<PeerId>>,
    /// Collateral transactions committed for not-yet-submitted finalized
    /// budgets: budget hash → collateral txid.
    collateral_txids: Mutex<HashMap<Hash, Hash>>,
}

impl BudgetManager {
    pub fn new(
        params: ChainParams,
        mode: BudgetMode,
        chain: Arc<dyn ChainIndex>,
        masternodes: Arc<dyn MasternodeDirectory>,
        network: Arc<dyn BudgetNetwork>,
        wallet: Arc<dyn BudgetWallet>,
        sync_tracker: Arc<dyn BudgetSyncTracker>,
    ) -> Self {
        BudgetManager {
            params,
            mode,
            chain,
            masternodes,
            network,
            wallet,
            sync_tracker,
            proposals: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashMap::new()),
            proposal_votes: Mutex::new(VoteCache::default()),
            finalized_votes: Mutex::new(VoteCache::default()),
            best_height: AtomicI64::new(0),
            submitted_height: AtomicI64::new(0),
            asked_for_source: Mutex::new(HashMap::new()),
            fulfilled_vote_sync: Mutex::new(HashSet::new()),
            collateral_txids: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn set_best_height(&self, height: i64) {
        self.best_height.store(height, AtomicOrdering::Relaxed);
    }

    pub fn best_height(&self) -> i64 {
        self.best_height.load(AtomicOrdering::Relaxed)
    }

    fn enabled_masternodes(&self) -> i64 {
        self.masternodes.count_enabled(self.params.active_protocol)
    }

    // ────────────────────────────────────────────────────────────────────
    // Lookups
    // ────────────────────────────────────────────────────────────────────

    pub fn have_proposal(&self, hash: &Hash) -> bool {
        self.proposals.lock().contains_key(hash)
    }

    pub fn have_finalized_budget(&self, hash: &Hash) -> bool {
        self.finalized.lock().contains_key(hash)
    }

    pub fn get_proposal(&self, hash: &Hash) -> Option<BudgetProposal> {
        self.proposals.lock().get(hash).cloned()
    }

    pub fn get_finalized_budget(&self, hash: &Hash) -> Option<FinalizedBudget> {
        self.finalized.lock().get(hash).cloned()
    }

    /// Broadcast form of a stored proposal, for serving inventory requests.
    pub fn proposal_broadcast(&self, hash: &Hash) -> Option<ProposalBroadcast> {
        self.proposals.lock().get(hash).map(|p| p.broadcast())
    }

    pub fn finalized_budget_broadcast(&self, hash: &Hash) -> Option<FinalizedBudgetBroadcast> {
        self.finalized.lock().get(hash).map(|b| b.broadcast())
    }

    pub fn seen_proposal_vote(&self, vote_hash: &Hash) -> Option<BudgetVote> {
        self.proposal_votes.lock().seen.get(vote_hash).cloned()
    }

    pub fn seen_finalized_vote(&self, vote_hash: &Hash) -> Option<FinalizedBudgetVote> {
        self.finalized_votes.lock().seen.get(vote_hash).cloned()
    }

    /// Best proposal (highest net yes) carrying the given name.
    pub fn find_proposal_by_name(&self, name: &str) -> Option<BudgetProposal> {
        let proposals = self.proposals.lock();
        proposals
            .values()
            .filter(|p| p.name == name)
            .max_by_key(|p| p.net_yes())
            .cloned()
    }

    // ────────────────────────────────────────────────────────────────────
    // Admission
    // ────────────────────────────────────────────────────────────────────

    /// Admit a proposal. Collateral is verified against the chain index
    /// before the proposals lock is taken; the lock is held only to insert.
    pub fn add_proposal(&self, mut proposal: BudgetProposal) -> Result<(), BudgetError> {
        let hash = proposal.hash();
        if self.have_proposal(&hash) {
            debug!(proposal = %hash, "proposal already added");
            return Err(BudgetError::Duplicate(hash));
        }

        if !proposal.is_well_formed(self.params.total_budget(proposal.block_start)) {
            debug!(proposal = %hash, reason = %proposal.invalid_reason, "invalid budget proposal");
            return Err(BudgetError::NotWellFormed(proposal.invalid_reason.clone()));
        }

        let current_height = self.best_height();
        let info = check_collateral(
            self.chain.as_ref(),
            &self.params,
            &proposal.fee_tx_hash,
            &hash,
            current_height,
            false,
        )
        .map_err(|e| {
            debug!(proposal = %hash, error = %e, "invalid budget proposal collateral");
            e
        })?;
        proposal.collateral_time = info.block_time;

        if !proposal.update_valid(current_height, self.enabled_masternodes()) {
            debug!(proposal = %hash, reason = %proposal.invalid_reason, "invalid budget proposal");
            return Err(BudgetError::NotWellFormed(proposal.invalid_reason.clone()));
        }

        info!(proposal = %hash, name = %proposal.name, "proposal added");
        self.proposals.lock().insert(hash, proposal);
        Ok(())
    }

    /// Admit a finalized budget. Same locking shape as `add_proposal`.
    pub fn add_finalized_budget(&self, mut budget: FinalizedBudget) -> Result<(), BudgetError> {
        let hash = budget.hash();
        if self.have_finalized_budget(&hash) {
            debug!(budget = %hash, "finalized budget already added");
            return Err(BudgetError::Duplicate(hash));
        }

        if !budget.is_well_formed(self.params.total_budget(budget.block_start), &self.params) {
            debug!(budget = %hash, reason = %budget.invalid_reason, "invalid finalized budget");
            return Err(BudgetError::NotWellFormed(budget.invalid_reason.clone()));
        }

        let current_height = self.best_height();
        let info = check_collateral(
            self.chain.as_ref(),
            &self.params,
            &budget.fee_tx_hash,
            &hash,
            current_height,
            true,
        )
        .map_err(|e| {
            debug!(budget = %hash, error = %e, "invalid finalized budget collateral");
            e
        })?;
        budget.time = info.block_time;

        if !budget.update_valid(current_height, &self.params) {
            debug!(budget = %hash, reason = %budget.invalid_reason, "invalid finalized budget");
            return Err(BudgetError::NotWellFormed(budget.invalid_reason.clone()));
        }

        budget.proposals_display = self.resolve_proposals_display(&budget);
        info!(budget = %hash, name = %budget.name, proposals = %budget.proposals_display,
              "finalized budget added");
        self.finalized.lock().insert(hash, budget);
        Ok(())
    }

    /// Resolve a finalized budget's payment hashes to proposal names where
    /// known (display only).
    fn resolve_proposals_display(&self, budget: &FinalizedBudget) -> String {
        let proposals = self.proposals.lock();
        budget
            .proposal_hashes()
            .iter()
            .map(|h| match proposals.get(h) {
                Some(p) => p.name.clone(),
                None => h.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ────────────────────────────────────────────────────────────────────
    // Vote intake
    // ────────────────────────────────────────────────────────────────────

    /// Route a proposal vote to its target. Unknown targets from a peer are
    /// parked in the orphan cache and the source proposal is requested once.
    pub fn update_proposal_vote(
        &self,
        vote: BudgetVote,
        from: Option<PeerId>,
    ) -> Result<(), BudgetError> {
        let target = vote.proposal_hash;
        let known = {
            let mut proposals = self.proposals.lock();
            match proposals.get_mut(&target) {
                Some(proposal) => {
                    proposal.add_or_update_vote(vote.clone(), current_unix_time())?;
                    true
                }
                None => false,
            }
        };
        if known {
            return Ok(());
        }

        if let Some(peer) = from {
            // only ask for missing items after our syncing process is
            // complete, otherwise we'll think a full sync succeeded when
            // they return a result
            if !self.sync_tracker.is_synced() {
                return Err(VoteError::UnknownProposal(target).into());
            }
            debug!(proposal = %target, "unknown proposal, asking for source");
            self.proposal_votes.lock().orphans.insert(target, vote);
            self.ask_for_source(peer, target);
        }
        Err(VoteError::UnknownProposal(target).into())
    }

    /// Route a finalized-budget vote, same shape as `update_proposal_vote`.
    pub fn update_finalized_budget_vote(
        &self,
        vote: FinalizedBudgetVote,
        from: Option<PeerId>,
    ) -> Result<(), BudgetError> {
        let target = vote.budget_hash;
        let known = {
            let mut finalized = self.finalized.lock();
            match finalized.get_mut(&target) {
                Some(budget) => {
                    budget.add_or_update_vote(vote.clone(), current_unix_time())?;
                    true
                }
                None => false,
            }
        };
        if known {
            return Ok(());
        }

        if let Some(peer) = from {
            if !self.sync_tracker.is_synced() {
                return Err(VoteError::UnknownBudget(target).into());
            }
            debug!(budget = %target, "unknown finalized budget, asking for source");
            self.finalized_votes.lock().orphans.insert(target, vote);
            self.ask_for_source(peer, target);
        }
        Err(VoteError::UnknownBudget(target).into())
    }

    fn ask_for_source(&self, peer: PeerId, target: Hash) {
        let mut asked = self.asked_for_source.lock();
        if !asked.contains_key(&target) {
            self.network
                .push_message(peer, &BudgetMessage::VoteSync { filter: Some(target) });
            asked.insert(target, current_unix_time());
        }
    }

    /// Retry parked votes; a vote that now lands on its target leaves the
    /// orphan cache.
    pub fn check_orphan_votes(&self) {
        let orphans: Vec<(Hash, BudgetVote)> = {
            let cache = self.proposal_votes.lock();
            cache.orphans.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        for (target, vote) in orphans {
            if self.update_proposal_vote(vote, None).is_ok() {
                self.proposal_votes.lock().orphans.remove(&target);
            }
        }

        let orphans: Vec<(Hash, FinalizedBudgetVote)> = {
            let cache = self.finalized_votes.lock();
            cache.orphans.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        for (target, vote) in orphans {
            if self.update_finalized_budget_vote(vote, None).is_ok() {
                self.finalized_votes.lock().orphans.remove(&target);
            }
        }
        debug!("orphan vote check done");
    }

    /// Record a locally authored proposal vote and relay it on success.
    pub fn add_and_relay_proposal_vote(&self, vote: BudgetVote) -> Result<(), BudgetError> {
        let hash = vote.hash();
        self.update_proposal_vote(vote.clone(), None)?;
        self.proposal_votes.lock().seen.insert(hash, vote);
        self.network.relay_inv(&Inv::new(InvType::BudgetVote, hash));
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Queries backing allocation and RPC
    // ────────────────────────────────────────────────────────────────────

    /// All proposals with refreshed vote validity, net-yes order.
    pub fn get_all_proposals(&self) -> Vec<BudgetProposal> {
        let mut proposals = self.proposals.lock();
        for proposal in proposals.values_mut() {
            proposal.clean_and_remove(self.masternodes.as_ref());
        }
        let mut out: Vec<BudgetProposal> = proposals.values().cloned().collect();
        out.sort_by(BudgetProposal::cmp_by_net_yes);
        out
    }

    /// Greedy allocation for the next superblock cycle: proposals in net-yes
    /// order are admitted while they fit under the cycle cap. A proposal that
    /// does not fit gets its allotted amount zeroed and stays out; it is not
    /// swapped for a smaller candidate, though later proposals that do fit
    /// into the remaining room are still admitted.
    pub fn get_budget(&self) -> Vec<BudgetProposal> {
        let height = self.best_height();
        if height <= 0 {
            return Vec::new();
        }

        let cycle = self.params.budget_cycle_blocks;
        let block_start = height - height % cycle + cycle;
        let block_end = block_start + cycle - 1;
        let total_budget = self.params.total_budget(block_start);
        let enabled = self.enabled_masternodes();
        let now = current_unix_time();
        let establishment = self.params.proposal_establishment_time;

        let mut proposals = self.proposals.lock();
        for proposal in proposals.values_mut() {
            proposal.clean_and_remove(self.masternodes.as_ref());
        }

        let mut order: Vec<Hash> = proposals.keys().copied().collect();
        order.sort_by(|a, b| BudgetProposal::cmp_by_net_yes(&proposals[a], &proposals[b]));

        let mut admitted = Vec::new();
        let mut allocated = Amount::zero();
        for hash in order {
            let proposal = proposals.get_mut(&hash).expect("key from same map");
            if !proposal.is_passing(block_start, block_end, enabled, now, establishment) {
                debug!(proposal = %proposal.name, "allocation: not passing");
                continue;
            }
            match allocated.checked_add(proposal.amount) {
                Some(next) if next <= total_budget => {
                    proposal.allotted = proposal.amount;
                    allocated = next;
                    admitted.push(proposal.clone());
                    debug!(proposal = %proposal.name, amount = %proposal.amount, "allocation: admitted");
                }
                _ => {
                    proposal.allotted = Amount::zero();
                    debug!(proposal = %proposal.name, "allocation: no amount allotted");
                }
            }
        }
        admitted
    }

    /// The slate the local node would finalize right now, in allocation
    /// order.
    fn local_slate(&self) -> Vec<BudgetPayment> {
        self.get_budget()
            .into_iter()
            .map(|p| BudgetPayment {
                proposal_hash: p.hash(),
                payee: p.payee.clone(),
                amount: p.allotted,
            })
            .collect()
    }

    /// All finalized budgets, most voted first.
    pub fn get_finalized_budgets(&self) -> Vec<FinalizedBudget> {
        let mut out: Vec<FinalizedBudget> = self.finalized.lock().values().cloned().collect();
        out.sort_by(FinalizedBudget::cmp_by_votes);
        out
    }

    /// Comma-joined proposal hashes every known finalized budget schedules at
    /// `height`.
    pub fn get_required_payments_string(&self, height: i64) -> String {
        let finalized = self.finalized.lock();
        let mut ret = String::new();
        for budget in finalized.values() {
            if height >= budget.block_start && height <= budget.block_end() {
                if let Some(payment) = budget.payment_by_block(height) {
                    if !ret.is_empty() {
                        ret.push(',');
                    }
                    ret.push_str(&payment.proposal_hash.to_string());
                }
            }
        }
        if ret.is_empty() {
            "unknown-budget".to_string()
        } else {
            ret
        }
    }

    /// Diagnostic report of a finalized budget against locally known
    /// proposals: unknown hashes and payee/amount mismatches.
    pub fn get_finalized_budget_status(&self, hash: &Hash) -> String {
        let budget = match self.get_finalized_budget(hash) {
            Some(b) => b,
            None => return format!("ERROR: cannot find finalized budget {}", hash),
        };

        let mut bad_hashes: Vec<String> = Vec::new();
        let mut bad_payee_or_amount: Vec<String> = Vec::new();
        for height in budget.block_start..=budget.block_end() {
            let payment = match budget.payment_by_block(height) {
                Some(p) => p,
                None => {
                    debug!(height, "couldn't find budget payment for block");
                    continue;
                }
            };
            match self.get_proposal(&payment.proposal_hash) {
                None => bad_hashes.push(payment.proposal_hash.to_string()),
                Some(proposal) => {
                    if proposal.payee != payment.payee || proposal.amount != payment.amount {
                        bad_payee_or_amount.push(payment.proposal_hash.to_string());
                    }
                }
            }
        }

        if bad_hashes.is_empty() && bad_payee_or_amount.is_empty() {
            return "OK".to_string();
        }
        let mut ret = String::new();
        if !bad_hashes.is_empty() {
            ret.push_str(&format!(
                "Unknown proposal(s) hash! Check this proposal(s) before voting: {}",
                bad_hashes.join(", ")
            ));
        }
        if !bad_payee_or_amount.is_empty() {
            if !ret.is_empty() {
                ret.push_str(" -- ");
            }
            ret.push_str(&format!(
                "Budget payee/amount doesn't match our proposal(s)! {}",
                bad_payee_or_amount.join(", ")
            ));
        }
        ret
    }

    // ────────────────────────────────────────────────────────────────────
    // Consensus-facing predicates
    // ────────────────────────────────────────────────────────────────────

    /// Highest-voted finalized budget covering `height`, with its count.
    fn budget_with_highest_vote_count(&self, height: i64) -> Option<(Hash, i64)> {
        let finalized = self.finalized.lock();
        let mut best: Option<(Hash, i64)> = None;
        for (hash, budget) in finalized.iter() {
            let count = budget.vote_count();
            let covers = height >= budget.block_start && height <= budget.block_end();
            if covers && count > best.map_or(0, |(_, c)| c) {
                best = Some((*hash, count));
            }
        }
        best
    }

    pub fn get_highest_vote_count(&self, height: i64) -> i64 {
        self.budget_with_highest_vote_count(height)
            .map_or(-1, |(_, count)| count)
    }

    /// Winning payment for `height`, provided the winner holds at least 5%
    /// of enabled masternodes.
    pub fn get_payee_and_amount(&self, height: i64) -> Option<(Script, Amount)> {
        let (hash, count) = self.budget_with_highest_vote_count(height)?;
        let five_percent = self.enabled_masternodes() / 20;
        if five_percent == 0 || count < five_percent {
            return None;
        }
        self.finalized.lock().get(&hash)?.payee_and_amount(height)
    }

    /// Whether `height` is a budget payment block, and the vote threshold a
    /// finalized budget must clear there.
    pub fn is_budget_payment_block_with_threshold(&self, height: i64) -> (bool, i64) {
        let highest_count = self.get_highest_vote_count(height);
        let enabled = self.enabled_masternodes();
        let five_percent = enabled / 20;
        // threshold: highest vote count minus 10% of active masternodes
        let mut threshold = highest_count - enabled / 10;
        // reduce the threshold if there are less than 10 enabled masternodes
        if threshold == highest_count {
            threshold -= 1;
        }
        debug!(highest_count, five_percent, "budget payment block check");
        (highest_count > five_percent, threshold)
    }

    pub fn is_budget_payment_block(&self, height: i64) -> bool {
        self.is_budget_payment_block_with_threshold(height).0
    }

    /// Consensus predicate: does `tx` carry the budget payment `height`
    /// demands? `VoteThreshold` means no finalized budget cleared the bar
    /// and the caller pays a masternode instead.
    pub fn is_transaction_valid(
        &self,
        tx: &Transaction,
        block_hash: &Hash,
        height: i64,
    ) -> TrxValidationStatus {
        let (payment_block, threshold) = self.is_budget_payment_block_with_threshold(height);
        if !payment_block {
            // budget doesn't have 5% of the network votes, pay a masternode
            return TrxValidationStatus::Invalid;
        }

        let mut any_crossed = false;
        let mut finalized = self.finalized.lock();
        for budget in finalized.values_mut() {
            let count = budget.vote_count();
            debug!(budget = %budget.name, votes = count, threshold, "checking finalized budget");
            if count > threshold {
                any_crossed = true;
                if budget.is_transaction_valid(tx, block_hash, height, self.chain.as_ref())
                    == TrxValidationStatus::Valid
                {
                    return TrxValidationStatus::Valid;
                }
                debug!(budget = %budget.name, "ignoring budget, out of range or tx not valid");
            }
        }

        if any_crossed {
            TrxValidationStatus::Invalid
        } else {
            TrxValidationStatus::VoteThreshold
        }
    }

    /// Fill in the budget payment for the block being assembled at the next
    /// height. Proof-of-stake coinstakes get an appended output; proof-of-work
    /// coinbases are expanded to subsidy + payment.
    pub fn fill_block_payee(&self, tx: &mut Transaction, proof_of_stake: bool) -> bool {
        let height = self.best_height();
        if height <= 0 {
            return false;
        }
        let (payee, amount) = match self.get_payee_and_amount(height + 1) {
            Some(found) => found,
            None => return false,
        };

        if proof_of_stake {
            tx.outputs.push(crate::types::TxOut::new(amount, payee.clone()));
        } else {
            let block_value = self.chain.block_value(height + 1);
            match tx.outputs.first_mut() {
                Some(first) => first.value = block_value,
                None => {
                    warn!("cannot fill budget payee into an empty coinbase");
                    return false;
                }
            }
            // superblocks carry the payment in output 1, their value can be
            // much larger than normal
            tx.outputs.truncate(1);
            tx.outputs.push(crate::types::TxOut::new(amount, payee.clone()));
        }

        debug!(payee = %payee.destination_display(), amount = %amount, "budget payment filled");
        true
    }

    // ────────────────────────────────────────────────────────────────────
    // Message processing
    // ────────────────────────────────────────────────────────────────────

    pub fn process_message(&self, peer: PeerId, msg: BudgetMessage) {
        if !self.sync_tracker.is_blockchain_synced() {
            return;
        }

        match msg {
            BudgetMessage::VoteSync { filter } => self.process_vote_sync(peer, filter),
            BudgetMessage::Proposal(broadcast) => self.process_proposal(peer, broadcast),
            BudgetMessage::Vote(vote) => self.process_proposal_vote(peer, vote),
            BudgetMessage::FinalizedBudget(broadcast) => self.process_finalized(peer, broadcast),
            BudgetMessage::FinalizedVote(vote) => self.process_finalized_vote(peer, vote),
            BudgetMessage::SyncStatusCount { .. } => {} // outbound marker only
        }
    }

    fn process_vote_sync(&self, peer: PeerId, filter: Option<Hash>) {
        if self.params.network == Network::Main && filter.is_none() {
            let mut fulfilled = self.fulfilled_vote_sync.lock();
            if fulfilled.contains(&peer) {
                warn!(peer = peer.0, "peer already asked for the budget list");
                self.network.misbehaving(peer, MISBEHAVING_SCORE);
                return;
            }
            fulfilled.insert(peer);
        }
        self.sync(peer, filter, false);
        debug!(peer = peer.0, "sent budget votes to peer");
    }

    fn process_proposal(&self, peer: PeerId, broadcast: ProposalBroadcast) {
        let proposal = match BudgetProposal::from_broadcast(broadcast) {
            Ok(p) => p,
            Err(e) => {
                debug!(peer = peer.0, error = %e, "undeserializable proposal broadcast");
                return;
            }
        };
        let hash = proposal.hash();
        if self.have_proposal(&hash) {
            self.sync_tracker.added_budget_item(&hash);
            return;
        }
        if self.add_proposal(proposal).is_err() {
            return;
        }
        self.network.relay_inv(&Inv::new(InvType::BudgetProposal, hash));
        self.sync_tracker.added_budget_item(&hash);
        debug!(proposal = %hash, "new proposal from network");
        // we might have active votes for this proposal that are valid now
        self.check_orphan_votes();
    }

    fn process_proposal_vote(&self, peer: PeerId, vote: BudgetVote) {
        let vote_hash = vote.hash();
        if self.seen_proposal_vote(&vote_hash).is_some() {
            self.sync_tracker.added_budget_item(&vote_hash);
            return;
        }

        let masternode = match self.masternodes.find(&vote.outpoint) {
            Some(mn) => mn,
            None => {
                debug!(voter = %vote.outpoint, "vote from unknown masternode");
                self.masternodes.ask_for_masternode(peer, &vote.outpoint);
                return;
            }
        };

        self.proposal_votes.lock().seen.insert(vote_hash, vote.clone());

        if !vote.check_signature(&masternode.pubkey) {
            if self.sync_tracker.is_synced() {
                warn!(voter = %vote.outpoint, "proposal vote signature invalid");
                self.network.misbehaving(peer, MISBEHAVING_SCORE);
            }
            // it could just be a non-synced masternode
            self.masternodes.ask_for_masternode(peer, &vote.outpoint);
            return;
        }

        if self.update_proposal_vote(vote.clone(), Some(peer)).is_ok() {
            self.network.relay_inv(&Inv::new(InvType::BudgetVote, vote_hash));
            self.sync_tracker.added_budget_item(&vote_hash);
        }
        debug!(proposal = %vote.proposal_hash, vote = %vote_hash, "new budget vote");
    }

    fn process_finalized(&self, peer: PeerId, broadcast: FinalizedBudgetBroadcast) {
        let budget = match FinalizedBudget::from_broadcast(broadcast) {
            Ok(b) => b,
            Err(e) => {
                debug!(peer = peer.0, error = %e, "undeserializable finalized budget broadcast");
                return;
            }
        };
        let hash = budget.hash();
        if self.have_finalized_budget(&hash) {
            self.sync_tracker.added_budget_item(&hash);
            return;
        }
        if self.add_finalized_budget(budget).is_err() {
            return;
        }
        self.network.relay_inv(&Inv::new(InvType::FinalizedBudget, hash));
        self.sync_tracker.added_budget_item(&hash);
        debug!(budget = %hash, "new finalized budget from network");
        // we might have active votes for this budget that are now valid
        self.check_orphan_votes();
    }

    fn process_finalized_vote(&self, peer: PeerId, vote: FinalizedBudgetVote) {
        let vote_hash = vote.hash();
        if self.seen_finalized_vote(&vote_hash).is_some() {
            self.sync_tracker.added_budget_item(&vote_hash);
            return;
        }

        let masternode = match self.masternodes.find(&vote.outpoint) {
            Some(mn) => mn,
            None => {
                debug!(voter = %vote.outpoint, "finalized vote from unknown masternode");
                self.masternodes.ask_for_masternode(peer, &vote.outpoint);
                return;
            }
        };

        self.finalized_votes.lock().seen.insert(vote_hash, vote.clone());

        if !vote.check_signature(&masternode.pubkey) {
            if self.sync_tracker.is_synced() {
                warn!(voter = %vote.outpoint, "finalized budget vote signature invalid");
                self.network.misbehaving(peer, MISBEHAVING_SCORE);
            }
            self.masternodes.ask_for_masternode(peer, &vote.outpoint);
            return;
        }

        match self.update_finalized_budget_vote(vote.clone(), Some(peer)) {
            Ok(()) => {
                self.network.relay_inv(&Inv::new(InvType::FinalizedBudgetVote, vote_hash));
                self.sync_tracker.added_budget_item(&vote_hash);
                debug!(budget = %vote.budget_hash, vote = %vote_hash, "new finalized budget vote");
            }
            Err(e) => {
                debug!(budget = %vote.budget_hash, vote = %vote_hash, error = %e,
                       "rejected finalized budget vote");
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Synchronizer
    // ────────────────────────────────────────────────────────────────────

    /// Serve a full or incremental dump of known items to a peer. Partial
    /// mode skips votes already flagged synced.
    pub fn sync(&self, peer: PeerId, filter: Option<Hash>, partial: bool) {
        let mut count: u32 = 0;
        {
            let proposals = self.proposals.lock();
            for (hash, proposal) in proposals.iter() {
                if proposal.valid && filter.map_or(true, |f| f == *hash) {
                    self.network
                        .push_inventory(peer, &Inv::new(InvType::BudgetProposal, *hash));
                    count += 1;
                    for inv in proposal.vote_invs(partial) {
                        self.network.push_inventory(peer, &inv);
                        count += 1;
                    }
                }
            }
        }
        self.network.push_message(
            peer,
            &BudgetMessage::SyncStatusCount { phase: SYNC_BUDGET_PROP, count },
        );
        debug!(peer = peer.0, count, "synced proposals to peer");

        let mut count: u32 = 0;
        {
            let finalized = self.finalized.lock();
            for (hash, budget) in finalized.iter() {
                if budget.valid && filter.map_or(true, |f| f == *hash) {
                    self.network
                        .push_inventory(peer, &Inv::new(InvType::FinalizedBudget, *hash));
                    count += 1;
                    for inv in budget.vote_invs(partial) {
                        self.network.push_inventory(peer, &inv);
                        count += 1;
                    }
                }
            }
        }
        self.network.push_message(
            peer,
            &BudgetMessage::SyncStatusCount { phase: SYNC_BUDGET_FIN, count },
        );
        debug!(peer = peer.0, count, "synced finalized budgets to peer");
    }

    /// Mark (or reset) the synced flag on every valid entity's votes.
    pub fn set_synced(&self, synced: bool) {
        {
            let mut proposals = self.proposals.lock();
            for proposal in proposals.values_mut() {
                if proposal.valid {
                    proposal.set_synced(synced);
                }
            }
        }
        {
            let mut finalized = self.finalized.lock();
            for budget in finalized.values_mut() {
                if budget.valid {
                    budget.set_synced(synced);
                }
            }
        }
    }

    fn clear_seen(&self) {
        self.proposal_votes.lock().seen.clear();
        self.finalized_votes.lock().seen.clear();
    }

    // ────────────────────────────────────────────────────────────────────
    // Maintenance
    // ────────────────────────────────────────────────────────────────────

    /// Rebuild both maps from valid survivors, auto-checking finalized
    /// budgets on masternode nodes along the way.
    pub fn check_and_remove(&self) {
        self.check_and_remove_inner(false)
    }

    /// `force_auto_check` bypasses the probabilistic auto-check gate; used by
    /// operator tooling and tests.
    pub fn check_and_remove_forced(&self) {
        self.check_and_remove_inner(true)
    }

    fn check_and_remove_inner(&self, force_auto_check: bool) {
        let current_height = self.best_height();

        // The local slate is computed before the finalized lock is taken:
        // slate computation needs the proposals lock and no path may hold
        // both entity locks.
        let wants_auto_check = self.mode == BudgetMode::Auto
            && !self.masternodes.active_masternodes().is_empty();
        let local_slate: Option<Vec<BudgetPayment>> = if wants_auto_check {
            let mut slate = self.local_slate();
            slate.sort_by(|a, b| b.proposal_hash.cmp(&a.proposal_hash));
            Some(slate)
        } else {
            None
        };

        let mut to_vote: Vec<Hash> = Vec::new();
        {
            let mut finalized = self.finalized.lock();
            debug!(size = finalized.len(), "finalized budget cleanup start");
            let mut survivors = HashMap::new();
            for (hash, mut budget) in finalized.drain() {
                if !budget.update_valid(current_height, &self.params) {
                    debug!(budget = %hash, reason = %budget.invalid_reason, "invalid finalized budget");
                    continue;
                }
                if let Some(slate) = &local_slate {
                    // Spread the voting activity out: 1 in 4 of the
                    // fourteen-block maintenance ticks, once per budget
                    // lifetime.
                    if !budget.auto_checked
                        && (force_auto_check || rand::thread_rng().gen_range(0..4) == 0)
                    {
                        budget.auto_checked = true;
                        if budget.matches_local_slate(slate) {
                            debug!(budget = %hash, "finalized budget matches, submitting vote");
                            to_vote.push(hash);
                        }
                    }
                }
                survivors.insert(hash, budget);
            }
            *finalized = survivors;
            debug!(size = finalized.len(), "finalized budget cleanup done");
        }
        for hash in to_vote {
            self.submit_finalized_budget_votes(&hash);
        }

        {
            let mut proposals = self.proposals.lock();
            debug!(size = proposals.len(), "proposal cleanup start");
            let enabled = self.enabled_masternodes();
            let mut survivors = HashMap::new();
            for (hash, mut proposal) in proposals.drain() {
                if proposal.update_valid(current_height, enabled) {
                    survivors.insert(hash, proposal);
                } else {
                    debug!(proposal = %hash, reason = %proposal.invalid_reason, "invalid proposal");
                }
            }
            *proposals = survivors;
            debug!(size = proposals.len(), "proposal cleanup done");
        }
    }

    /// Sign and submit a supporting vote on a finalized budget from every
    /// active masternode this node runs. Signing requires a resolved
    /// collateral outpoint, so unresolved entries are skipped.
    fn submit_finalized_budget_votes(&self, budget_hash: &Hash) {
        for active in self.masternodes.active_masternodes() {
            let ActiveMasternode { outpoint, secret_key } = active;
            let outpoint = match outpoint {
                Some(op) => op,
                None => {
                    debug!("active masternode not initialized, skipping vote");
                    continue;
                }
            };

            let mut vote = FinalizedBudgetVote::new(outpoint, *budget_hash, current_unix_time());
            if let Err(e) = vote.sign(&secret_key) {
                warn!(voter = %outpoint, error = %e, "failure to sign finalized budget vote");
                continue;
            }

            match self.update_finalized_budget_vote(vote.clone(), None) {
                Ok(()) => {
                    let hash = vote.hash();
                    info!(budget = %budget_hash, vote = %hash, "new finalized budget vote");
                    self.finalized_votes.lock().seen.insert(hash, vote);
                    self.network.relay_inv(&Inv::new(InvType::FinalizedBudgetVote, hash));
                }
                Err(e) => {
                    debug!(budget = %budget_hash, error = %e, "error submitting vote");
                }
            }
        }
    }

    /// Per-tip maintenance hook, called by the host on every new chain tip.
    pub fn new_block(&self, height: i64) {
        self.set_best_height(height);

        if !self.sync_tracker.budget_stage_passed() {
            return;
        }

        if self.mode == BudgetMode::Suggest {
            // suggest the budget we see
            self.submit_final_budget();
        }

        // run the heavy work once per 14 blocks, allowing up to 100 votes
        // per day on all proposals
        if self.best_height() % MAINTENANCE_INTERVAL_BLOCKS != 0 {
            return;
        }

        // incremental sync with our peers
        if self.sync_tracker.is_synced() {
            debug!("incremental budget sync started");
            if rand::thread_rng().gen_range(0..1440) == 0 {
                self.clear_seen();
                self.set_synced(false);
            }
            let min_protocol = self.params.active_protocol;
            self.network.for_each_peer(&mut |peer| {
                if peer.protocol_version >= min_protocol {
                    self.sync(peer.id, None, true);
                }
            });
            self.set_synced(true);
        }

        // remove expired/heavily downvoted budgets
        self.check_and_remove();

        // expire outstanding source requests
        {
            let mut asked = self.asked_for_source.lock();
            debug!(size = asked.len(), "source request cleanup");
            let cutoff = current_unix_time() - SOURCE_REQUEST_EXPIRY;
            asked.retain(|_, time| *time > cutoff);
        }

        // remove invalid (from non-active masternode) votes once in a while;
        // deferred to a later tick when the lock is contended
        {
            let proposals = match self.proposals.try_lock() {
                Some(guard) => guard,
                None => return,
            };
            let mut proposals = proposals;
            debug!(size = proposals.len(), "proposal vote cleanup");
            for proposal in proposals.values_mut() {
                proposal.clean_and_remove(self.masternodes.as_ref());
            }
        }
        {
            let finalized = match self.finalized.try_lock() {
                Some(guard) => guard,
                None => return,
            };
            let mut finalized = finalized;
            debug!(size = finalized.len(), "finalized budget vote cleanup");
            for budget in finalized.values_mut() {
                budget.clean_and_remove(self.masternodes.as_ref());
            }
        }
        debug!("new block maintenance passed");
    }

    // ────────────────────────────────────────────────────────────────────
    // Submitter
    // ────────────────────────────────────────────────────────────────────

    /// Once per cycle, inside the finalization window, build this node's
    /// preferred slate, pay the finalization collateral, and submit the
    /// finalized budget. The collateral is committed on one tick and the
    /// budget submitted on a later one, once the fee tx has confirmations.
    pub fn submit_final_budget(&self) {
        let current_height = self.best_height();
        let cycle = self.params.budget_cycle_blocks;
        let block_start = current_height - current_height % cycle + cycle;
        if self.submitted_height.load(AtomicOrdering::Relaxed) >= block_start {
            debug!(block_start, "final budget already submitted for this superblock");
            return;
        }

        let window = self.params.finalization_window();
        if block_start - current_height > window {
            debug!(
                current_height,
                block_start,
                first_possible = block_start - window,
                "too early for finalization"
            );
            return;
        }

        let payments = self.local_slate();
        if payments.is_empty() {
            debug!("found no proposals for period");
            return;
        }

        // tentative budget with zero collateral, just to derive the hash the
        // collateral has to commit to
        let tentative =
            FinalizedBudget::new("main".to_string(), block_start, payments.clone(), Hash::zero());
        let budget_hash = tentative.hash();

        if self.have_finalized_budget(&budget_hash) {
            debug!(budget = %budget_hash, "budget already exists");
            self.submitted_height.store(current_height, AtomicOrdering::Relaxed);
            return;
        }

        let collateral = {
            let memo = self.collateral_txids.lock();
            memo.get(&budget_hash).copied()
        };
        let collateral = match collateral {
            Some(txid) => txid,
            None => {
                // create the collateral tx, remember it, and continue on a
                // later tick once it has confirmations
                match self.wallet.create_collateral_tx(&budget_hash, true) {
                    Ok(txid) => {
                        self.collateral_txids.lock().insert(budget_hash, txid);
                        info!(budget = %budget_hash, collateral = %txid, "collateral committed");
                    }
                    Err(e) => {
                        warn!(error = %e, "can't make collateral transaction");
                    }
                }
                return;
            }
        };

        let budget =
            FinalizedBudget::new("main".to_string(), block_start, payments, collateral);
        if let Err(e) = self.add_finalized_budget(budget) {
            debug!(budget = %budget_hash, error = %e, "submitted budget not accepted yet");
            return;
        }
        self.network
            .relay_inv(&Inv::new(InvType::FinalizedBudget, budget_hash));
        self.submitted_height.store(current_height, AtomicOrdering::Relaxed);
        self.collateral_txids.lock().remove(&budget_hash);
        info!(budget = %budget_hash, "final budget submitted");
    }

    // ────────────────────────────────────────────────────────────────────
    // Snapshot
    // ────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> BudgetSnapshot {
        let proposal_votes = self.proposal_votes.lock();
        let finalized_votes = self.finalized_votes.lock();
        BudgetSnapshot {
            proposals: self.proposals.lock().clone(),
            finalized: self.finalized.lock().clone(),
            seen_proposal_votes: proposal_votes.seen.clone(),
            orphan_proposal_votes: proposal_votes.orphans.clone(),
            seen_finalized_votes: finalized_votes.seen.clone(),
            orphan_finalized_votes: finalized_votes.orphans.clone(),
        }
    }

    /// Replace the in-memory state with a loaded snapshot. The caller runs
    /// `check_and_remove` afterwards to drop anything that expired offline.
    pub fn restore(&self, snapshot: BudgetSnapshot) {
        *self.proposals.lock() = snapshot.proposals;
        *self.finalized.lock() = snapshot.finalized;
        {
            let mut cache = self.proposal_votes.lock();
            cache.seen = snapshot.seen_proposal_votes;
            cache.orphans = snapshot.orphan_proposal_votes;
        }
        {
            let mut cache = self.finalized_votes.lock();
            cache.seen = snapshot.seen_finalized_votes;
            cache.orphans = snapshot.orphan_finalized_votes;
        }
    }
}

impl fmt::Display for BudgetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proposals = self.proposals.lock().len();
        let budgets = self.finalized.lock().len();
        let (seen_votes, orphan_votes) = {
            let cache = self.proposal_votes.lock();
            (cache.seen.len(), cache.orphans.len())
        };
        let (seen_finalized, orphan_finalized) = {
            let cache = self.finalized_votes.lock();
            (cache.seen.len(), cache.orphans.len())
        };
        write!(
            f,
            "Proposals: {} - Finalized Budgets: {} - Proposal Votes: {} (orphan: {}) - \
             Finalized Budget Votes: {} (orphan: {})",
            proposals, budgets, seen_votes, orphan_votes, seen_finalized, orphan_finalized
        )
    }
}
