//! End-to-end tests for the budget manager against in-memory collaborators.
//! Run with: cargo test --test budget_manager_tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use afo_budget::finalized::BudgetPayment;
use afo_budget::types::{current_unix_time, COIN};
use afo_budget::{
    ActiveMasternode, Amount, BlockIndexEntry, BudgetManager, BudgetMessage, BudgetMode,
    BudgetNetwork, BudgetProposal, BudgetSyncTracker, BudgetWallet, ChainIndex, ChainParams,
    FinalizedBudget, FinalizedBudgetVote, Hash, Inv, MasternodeDirectory, MasternodeInfo,
    OutPoint, PeerId, PeerInfo, Script, Transaction, TrxValidationStatus, TxOut, VoteDirection,
};
use afo_budget::vote::BudgetVote;

// ============================================================
// MOCK COLLABORATORS
// ============================================================

#[derive(Default)]
struct ChainStore {
    txs: HashMap<Hash, (Transaction, Option<Hash>)>,
    blocks: HashMap<Hash, BlockIndexEntry>,
    active: HashSet<Hash>,
}

#[derive(Default)]
struct MockChain {
    store: Mutex<ChainStore>,
}

impl MockChain {
    fn add_block(&self, hash: Hash, height: i64, time: i64, active: bool) {
        let mut store = self.store.lock();
        store.blocks.insert(hash, BlockIndexEntry { height, time });
        if active {
            store.active.insert(hash);
        }
    }

    /// Register a confirmed collateral transaction committing to `binding`.
    fn add_collateral(&self, binding: &Hash, is_finalization: bool, height: i64, time: i64) -> Hash {
        let fee = if is_finalization { Amount(5 * COIN) } else { Amount(50 * COIN) };
        let mut seed = binding.as_bytes().to_vec();
        seed.push(is_finalization as u8);
        seed.extend_from_slice(&height.to_le_bytes());
        let txid = afo_budget::crypto::sha3_256(&seed);
        let mut block_seed = b"block".to_vec();
        block_seed.extend_from_slice(txid.as_bytes());
        let block_hash = afo_budget::crypto::sha3_256(&block_seed);
        let tx = Transaction::new(vec![
            TxOut::new(Amount(1234), Script::PayToPubkeyHash([0x11; 20])),
            TxOut::new(fee, Script::op_return(binding)),
        ]);
        self.add_block(block_hash, height, time, true);
        self.store.lock().txs.insert(txid, (tx, Some(block_hash)));
        txid
    }

    fn deactivate_block(&self, hash: &Hash) {
        self.store.lock().active.remove(hash);
    }
}

impl ChainIndex for MockChain {
    fn transaction_with_block(&self, txid: &Hash) -> Option<(Transaction, Option<Hash>)> {
        self.store.lock().txs.get(txid).cloned()
    }
    fn block_index(&self, block_hash: &Hash) -> Option<BlockIndexEntry> {
        self.store.lock().blocks.get(block_hash).copied()
    }
    fn active_chain_contains(&self, block_hash: &Hash) -> bool {
        self.store.lock().active.contains(block_hash)
    }
    fn block_value(&self, _height: i64) -> Amount {
        Amount(450 * COIN)
    }
}

struct MockDirectory {
    masternodes: Mutex<HashMap<OutPoint, MasternodeInfo>>,
    active: Mutex<Vec<ActiveMasternode>>,
    enabled: i64,
    asked: Mutex<Vec<(PeerId, OutPoint)>>,
}

impl MockDirectory {
    fn new(enabled: i64) -> Self {
        MockDirectory {
            masternodes: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
            enabled,
            asked: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, outpoint: OutPoint, pubkey: Vec<u8>) {
        self.masternodes.lock().insert(
            outpoint,
            MasternodeInfo { outpoint, pubkey, enabled: true, protocol_version: 70_920 },
        );
    }
}

impl MasternodeDirectory for MockDirectory {
    fn find(&self, outpoint: &OutPoint) -> Option<MasternodeInfo> {
        self.masternodes.lock().get(outpoint).cloned()
    }
    fn count_enabled(&self, _min_protocol: i32) -> i64 {
        self.enabled
    }
    fn ask_for_masternode(&self, peer: PeerId, outpoint: &OutPoint) {
        self.asked.lock().push((peer, *outpoint));
    }
    fn active_masternodes(&self) -> Vec<ActiveMasternode> {
        self.active.lock().clone()
    }
}

#[derive(Default)]
struct MockNetwork {
    relayed: Mutex<Vec<Inv>>,
    pushed_invs: Mutex<Vec<(PeerId, Inv)>>,
    messages: Mutex<Vec<(PeerId, BudgetMessage)>>,
    misbehavior: Mutex<Vec<(PeerId, i32)>>,
    peers: Mutex<Vec<PeerInfo>>,
}

impl BudgetNetwork for MockNetwork {
    fn relay_inv(&self, inv: &Inv) {
        self.relayed.lock().push(*inv);
    }
    fn push_inventory(&self, peer: PeerId, inv: &Inv) {
        self.pushed_invs.lock().push((peer, *inv));
    }
    fn push_message(&self, peer: PeerId, msg: &BudgetMessage) {
        self.messages.lock().push((peer, msg.clone()));
    }
    fn for_each_peer(&self, f: &mut dyn FnMut(&PeerInfo)) {
        for peer in self.peers.lock().iter() {
            f(peer);
        }
    }
    fn misbehaving(&self, peer: PeerId, score: i32) {
        self.misbehavior.lock().push((peer, score));
    }
}

/// Wallet that actually lands the collateral on the mock chain.
struct MockWallet {
    chain: Arc<MockChain>,
    confirm_height: i64,
    confirm_time: i64,
}

impl BudgetWallet for MockWallet {
    fn create_collateral_tx(&self, binding: &Hash, is_finalization: bool) -> anyhow::Result<Hash> {
        Ok(self
            .chain
            .add_collateral(binding, is_finalization, self.confirm_height, self.confirm_time))
    }
}

struct MockSync {
    blockchain_synced: AtomicBool,
    synced: AtomicBool,
    budget_stage: AtomicBool,
    items: Mutex<Vec<Hash>>,
}

impl Default for MockSync {
    fn default() -> Self {
        MockSync {
            blockchain_synced: AtomicBool::new(true),
            synced: AtomicBool::new(true),
            budget_stage: AtomicBool::new(true),
            items: Mutex::new(Vec::new()),
        }
    }
}

impl BudgetSyncTracker for MockSync {
    fn is_blockchain_synced(&self) -> bool {
        self.blockchain_synced.load(Ordering::Relaxed)
    }
    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }
    fn budget_stage_passed(&self) -> bool {
        self.budget_stage.load(Ordering::Relaxed)
    }
    fn added_budget_item(&self, hash: &Hash) {
        self.items.lock().push(*hash);
    }
}

// ============================================================
// TEST ENVIRONMENT
// ============================================================

struct Env {
    chain: Arc<MockChain>,
    directory: Arc<MockDirectory>,
    network: Arc<MockNetwork>,
    sync: Arc<MockSync>,
    manager: BudgetManager,
    /// (outpoint, secret key) per registered masternode.
    voters: Vec<(OutPoint, Vec<u8>)>,
    params: ChainParams,
    now: i64,
}

fn test_params() -> ChainParams {
    let mut params = ChainParams::main();
    params.budget_cycle_blocks = 200;
    params.proposal_establishment_time = 3600;
    params
}

fn env_with(mode: BudgetMode, enabled_masternodes: i64) -> Env {
    let params = test_params();
    let chain = Arc::new(MockChain::default());
    let directory = Arc::new(MockDirectory::new(enabled_masternodes));
    let network = Arc::new(MockNetwork::default());
    let sync = Arc::new(MockSync::default());
    let wallet = Arc::new(MockWallet {
        chain: chain.clone(),
        confirm_height: 184,
        confirm_time: current_unix_time() - 7200,
    });

    let mut voters = Vec::new();
    for n in 0..enabled_masternodes {
        let (pk, sk) = afo_budget::crypto::generate_keypair_bytes();
        let outpoint = OutPoint::new(afo_budget::crypto::sha3_256(&n.to_le_bytes()), 0);
        directory.register(outpoint, pk);
        voters.push((outpoint, sk));
    }

    let manager = BudgetManager::new(
        params.clone(),
        mode,
        chain.clone(),
        directory.clone(),
        network.clone(),
        wallet,
        sync.clone(),
    );
    manager.set_best_height(150);

    Env { chain, directory, network, sync, manager, voters, params, now: current_unix_time() }
}

fn env() -> Env {
    env_with(BudgetMode::Disabled, 100)
}

impl Env {
    /// Build a proposal, land its collateral, and admit it.
    fn add_proposal(&self, name: &str, amount: Amount, established: bool) -> Hash {
        let collateral_time = if established { self.now - 7200 } else { self.now - 30 };
        let mut proposal = BudgetProposal::new(
            name.to_string(),
            format!("https://forum.example/{}", name),
            2,
            Script::PayToPubkeyHash([name.as_bytes()[0]; 20]),
            amount,
            200,
            Hash::zero(),
            &self.params,
        );
        proposal.time = collateral_time;
        let hash = proposal.hash();
        proposal.fee_tx_hash = self.chain.add_collateral(&hash, false, 100, collateral_time);
        self.manager.add_proposal(proposal).expect("proposal admitted");
        hash
    }

    /// Cast `yeas`/`nays` from distinct registered masternodes.
    fn vote_on_proposal(&self, proposal_hash: &Hash, yeas: usize, nays: usize) {
        for (i, (outpoint, _)) in self.voters.iter().take(yeas + nays).enumerate() {
            let direction = if i < yeas { VoteDirection::Yes } else { VoteDirection::No };
            let vote = BudgetVote::new(*outpoint, *proposal_hash, direction, self.now);
            self.manager.update_proposal_vote(vote, None).expect("vote accepted");
        }
    }

    /// Build a finalized budget for superblock 200, land its collateral, and
    /// admit it.
    fn add_finalized(&self, payments: Vec<BudgetPayment>) -> Hash {
        let tentative = FinalizedBudget::new("main".to_string(), 200, payments.clone(), Hash::zero());
        let hash = tentative.hash();
        let collateral = self.chain.add_collateral(&hash, true, 100, self.now - 7200);
        let budget = FinalizedBudget::new("main".to_string(), 200, payments, collateral);
        self.manager.add_finalized_budget(budget).expect("finalized budget admitted");
        hash
    }

    fn vote_on_finalized(&self, budget_hash: &Hash, count: usize) {
        for (outpoint, _) in self.voters.iter().take(count) {
            let vote = FinalizedBudgetVote::new(*outpoint, *budget_hash, self.now);
            self.manager.update_finalized_budget_vote(vote, None).expect("vote accepted");
        }
    }

    fn payment(&self, proposal_hash: &Hash) -> BudgetPayment {
        let proposal = self.manager.get_proposal(proposal_hash).expect("proposal exists");
        BudgetPayment {
            proposal_hash: *proposal_hash,
            payee: proposal.payee.clone(),
            amount: proposal.amount,
        }
    }
}

// ============================================================
// END-TO-END SCENARIOS
// ============================================================

#[test]
fn happy_path_allocation_and_payment() {
    let env = env();

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    let b = env.add_proposal("beta", Amount(50 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);
    env.vote_on_proposal(&b, 15, 1);

    // both fit under the cap, alpha first on net yes
    let budget = env.manager.get_budget();
    assert_eq!(budget.len(), 2);
    assert_eq!(budget[0].hash(), a);
    assert_eq!(budget[1].hash(), b);
    assert_eq!(budget[0].allotted, Amount(30 * COIN));
    assert_eq!(budget[1].allotted, Amount(50 * COIN));

    // finalized slate over both proposals, 20 supporting votes
    let f = env.add_finalized(vec![env.payment(&a), env.payment(&b)]);
    env.vote_on_finalized(&f, 20);

    let (is_payment_block, threshold) = env.manager.is_budget_payment_block_with_threshold(200);
    assert!(is_payment_block);
    assert_eq!(threshold, 10);

    // coinstake carrying the scheduled alpha payment at block 200
    let block = afo_budget::crypto::sha3_256(b"superblock 200");
    env.chain.add_block(block, 200, env.now, true);
    let tx = Transaction::new(vec![
        TxOut::new(Amount(999), Script::PayToPubkeyHash([0xAA; 20])),
        TxOut::new(Amount(30 * COIN), Script::PayToPubkeyHash([b'a'; 20])),
    ]);
    assert_eq!(
        env.manager.is_transaction_valid(&tx, &block, 200),
        TrxValidationStatus::Valid
    );

    // a coinstake missing the payment is rejected
    let bare = Transaction::new(vec![TxOut::new(Amount(999), Script::PayToPubkeyHash([0xAA; 20]))]);
    assert_eq!(
        env.manager.is_transaction_valid(&bare, &block, 200),
        TrxValidationStatus::Invalid
    );
}

#[test]
fn over_cap_proposal_is_not_allotted() {
    let env = env();

    // cap at superblock 200 is 648000 coins; alpha+beta would exceed it
    let a = env.add_proposal("alpha", Amount(400_000 * COIN), true);
    let b = env.add_proposal("beta", Amount(300_000 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);
    env.vote_on_proposal(&b, 15, 1);

    let budget = env.manager.get_budget();
    assert_eq!(budget.len(), 1);
    assert_eq!(budget[0].hash(), a);

    // beta stays in the map, with nothing allotted
    let beta = env.manager.get_proposal(&b).unwrap();
    assert_eq!(beta.allotted, Amount::zero());
}

#[test]
fn unestablished_proposal_is_skipped() {
    let env = env();

    let a = env.add_proposal("young", Amount(30 * COIN), false);
    env.vote_on_proposal(&a, 20, 0);

    assert!(env.manager.get_budget().is_empty());

    let proposal = env.manager.get_proposal(&a).unwrap();
    assert!(!proposal.is_established(env.now, env.params.proposal_establishment_time));
}

#[test]
fn heavily_downvoted_proposal_is_removed() {
    let env = env();

    let a = env.add_proposal("contested", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 5, 17);

    // nays - yeas = 12 > 100 / 10
    env.manager.check_and_remove();
    assert!(!env.manager.have_proposal(&a));
}

#[test]
fn double_payment_pays_a_masternode_instead() {
    let env = env();

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);
    let f = env.add_finalized(vec![env.payment(&a)]);
    env.vote_on_finalized(&f, 20);

    let block1 = afo_budget::crypto::sha3_256(b"first block at 200");
    let block2 = afo_budget::crypto::sha3_256(b"competing block at 200");
    env.chain.add_block(block1, 200, env.now, true);
    env.chain.add_block(block2, 200, env.now, false);

    let tx = Transaction::new(vec![TxOut::new(Amount(30 * COIN), Script::PayToPubkeyHash([b'a'; 20]))]);

    assert_eq!(env.manager.is_transaction_valid(&tx, &block1, 200), TrxValidationStatus::Valid);
    // re-checking the very same block is idempotent
    assert_eq!(env.manager.is_transaction_valid(&tx, &block1, 200), TrxValidationStatus::Valid);
    // a different block at the same height, while the paid one is on the
    // active chain, is a double payment: the budget refuses to validate
    assert_eq!(env.manager.is_transaction_valid(&tx, &block2, 200), TrxValidationStatus::Invalid);

    // once the paid block fell off the active chain, the new one validates
    env.chain.deactivate_block(&block1);
    assert_eq!(env.manager.is_transaction_valid(&tx, &block2, 200), TrxValidationStatus::Valid);
}

#[test]
fn orphan_vote_installs_when_the_proposal_arrives() {
    let env = env();
    let peer = PeerId(7);

    // the proposal exists on chain but is not known locally yet
    let collateral_time = env.now - 7200;
    let mut proposal = BudgetProposal::new(
        "late".to_string(),
        "https://forum.example/late".to_string(),
        2,
        Script::PayToPubkeyHash([b'l'; 20]),
        Amount(30 * COIN),
        200,
        Hash::zero(),
        &env.params,
    );
    proposal.time = collateral_time;
    let hash = proposal.hash();
    proposal.fee_tx_hash = env.chain.add_collateral(&hash, false, 100, collateral_time);

    // a signed vote for the unknown proposal arrives first and gets parked
    let (outpoint, sk) = &env.voters[0];
    let mut vote = BudgetVote::new(*outpoint, hash, VoteDirection::Yes, env.now);
    vote.sign(sk).unwrap();
    env.manager.process_message(peer, BudgetMessage::Vote(vote));

    assert!(!env.manager.have_proposal(&hash));
    assert!(env.manager.to_string().contains("(orphan: 1)"));
    // the manager asked the peer for the source proposal
    assert!(env
        .network
        .messages
        .lock()
        .iter()
        .any(|(p, m)| *p == peer && matches!(m, BudgetMessage::VoteSync { filter: Some(h) } if *h == hash)));

    // the proposal broadcast arrives: the parked vote is installed
    env.manager.process_message(peer, BudgetMessage::Proposal(proposal.broadcast()));
    assert!(env.manager.have_proposal(&hash));
    let stored = env.manager.get_proposal(&hash).unwrap();
    assert_eq!(stored.yeas(), 1);
    assert!(env.manager.to_string().contains("(orphan: 0)"));
}

// ============================================================
// IDEMPOTENCE & PERSISTENCE LAWS
// ============================================================

#[test]
fn adding_the_same_proposal_twice_fails_once() {
    let env = env();

    let collateral_time = env.now - 7200;
    let mut proposal = BudgetProposal::new(
        "once".to_string(),
        "https://forum.example/once".to_string(),
        2,
        Script::PayToPubkeyHash([b'o'; 20]),
        Amount(30 * COIN),
        200,
        Hash::zero(),
        &env.params,
    );
    proposal.time = collateral_time;
    let hash = proposal.hash();
    proposal.fee_tx_hash = env.chain.add_collateral(&hash, false, 100, collateral_time);

    assert!(env.manager.add_proposal(proposal.clone()).is_ok());
    assert!(matches!(
        env.manager.add_proposal(proposal),
        Err(afo_budget::BudgetError::Duplicate(h)) if h == hash
    ));
    assert_eq!(env.manager.get_all_proposals().len(), 1);
}

#[test]
fn snapshot_survives_disk_round_trip() {
    let env = env();

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 3, 1);
    let f = env.add_finalized(vec![env.payment(&a)]);
    env.vote_on_finalized(&f, 2);

    let dir = tempfile::tempdir().unwrap();
    let db = afo_budget::BudgetDb::new(dir.path(), &env.params);
    assert!(afo_budget::dump_budgets(&env.manager, &db));

    // restore into a fresh manager wired to the same chain
    let restored = BudgetManager::new(
        env.params.clone(),
        BudgetMode::Disabled,
        env.chain.clone(),
        env.directory.clone(),
        env.network.clone(),
        Arc::new(MockWallet {
            chain: env.chain.clone(),
            confirm_height: 184,
            confirm_time: env.now - 7200,
        }),
        env.sync.clone(),
    );
    restored.set_best_height(150);
    afo_budget::load_budgets(&restored, &db).unwrap();

    assert!(restored.have_proposal(&a));
    assert!(restored.have_finalized_budget(&f));
    assert_eq!(restored.get_proposal(&a).unwrap().hash(), a);
    assert_eq!(restored.get_proposal(&a).unwrap().yeas(), 3);
    assert_eq!(restored.get_finalized_budget(&f).unwrap().vote_count(), 2);
}

// ============================================================
// SUBMITTER & AUTO-VOTE
// ============================================================

#[test]
fn submitter_pays_collateral_then_submits() {
    let env = env_with(BudgetMode::Suggest, 100);

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);

    // outside the finalization window nothing happens
    env.manager.set_best_height(150);
    env.manager.submit_final_budget();
    assert!(env.manager.get_finalized_budgets().is_empty());

    // inside the window: first tick commits the collateral only
    env.manager.set_best_height(190);
    env.manager.submit_final_budget();
    assert!(env.manager.get_finalized_budgets().is_empty());

    // next tick: collateral has depth, the budget is admitted and relayed
    env.manager.submit_final_budget();
    let budgets = env.manager.get_finalized_budgets();
    assert_eq!(budgets.len(), 1);
    assert_eq!(budgets[0].block_start, 200);
    assert_eq!(budgets[0].payments.len(), 1);
    assert_eq!(budgets[0].payments[0].proposal_hash, a);

    // the latch stops a re-submission for the same superblock
    let before = env.manager.get_finalized_budgets().len();
    env.manager.submit_final_budget();
    assert_eq!(env.manager.get_finalized_budgets().len(), before);
}

#[test]
fn masternode_auto_votes_on_matching_budget() {
    let env = env_with(BudgetMode::Auto, 100);
    let (outpoint, sk) = env.voters[0].clone();
    env.directory
        .active
        .lock()
        .push(ActiveMasternode { outpoint: Some(outpoint), secret_key: sk });

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);
    let f = env.add_finalized(vec![env.payment(&a)]);

    env.manager.check_and_remove_forced();

    let budget = env.manager.get_finalized_budget(&f).unwrap();
    assert_eq!(budget.vote_count(), 1);
    assert!(env
        .network
        .relayed
        .lock()
        .iter()
        .any(|inv| matches!(inv.kind, afo_budget::InvType::FinalizedBudgetVote)));
}

#[test]
fn mismatched_slate_gets_no_auto_vote() {
    let env = env_with(BudgetMode::Auto, 100);
    let (outpoint, sk) = env.voters[0].clone();
    env.directory
        .active
        .lock()
        .push(ActiveMasternode { outpoint: Some(outpoint), secret_key: sk });

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);

    // slate pays the right proposal the wrong amount
    let mut payment = env.payment(&a);
    payment.amount = Amount(29 * COIN);
    let f = env.add_finalized(vec![payment]);

    env.manager.check_and_remove_forced();
    assert_eq!(env.manager.get_finalized_budget(&f).unwrap().vote_count(), 0);
}

// ============================================================
// MESSAGE POLICING
// ============================================================

#[test]
fn repeated_full_vote_sync_is_misbehavior_on_mainnet() {
    let env = env();
    let peer = PeerId(3);

    env.manager.process_message(peer, BudgetMessage::VoteSync { filter: None });
    assert!(env.network.misbehavior.lock().is_empty());

    env.manager.process_message(peer, BudgetMessage::VoteSync { filter: None });
    assert_eq!(*env.network.misbehavior.lock(), vec![(peer, 20)]);

    // filtered requests stay unrestricted
    let target = afo_budget::crypto::sha3_256(b"some hash");
    env.manager.process_message(peer, BudgetMessage::VoteSync { filter: Some(target) });
    assert_eq!(env.network.misbehavior.lock().len(), 1);
}

#[test]
fn bad_vote_signature_is_misbehavior_when_synced() {
    let env = env();
    let peer = PeerId(4);

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);

    let (outpoint, _) = &env.voters[0];
    let (_, wrong_sk) = afo_budget::crypto::generate_keypair_bytes();
    let mut vote = BudgetVote::new(*outpoint, a, VoteDirection::Yes, env.now);
    vote.sign(&wrong_sk).unwrap();
    env.manager.process_message(peer, BudgetMessage::Vote(vote));

    assert_eq!(*env.network.misbehavior.lock(), vec![(peer, 20)]);
    assert_eq!(env.manager.get_proposal(&a).unwrap().yeas(), 0);
    // the peer is asked for the masternode announcement, it could just be
    // a non-synced masternode
    assert!(!env.directory.asked.lock().is_empty());
}

#[test]
fn vote_sync_serves_proposals_and_votes() {
    let env = env();
    let peer = PeerId(9);

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 2, 0);

    env.manager.sync(peer, None, false);

    let invs = env.network.pushed_invs.lock();
    let proposals = invs
        .iter()
        .filter(|(p, inv)| *p == peer && matches!(inv.kind, afo_budget::InvType::BudgetProposal))
        .count();
    let votes = invs
        .iter()
        .filter(|(p, inv)| *p == peer && matches!(inv.kind, afo_budget::InvType::BudgetVote))
        .count();
    assert_eq!(proposals, 1);
    assert_eq!(votes, 2);

    let markers = env
        .network
        .messages
        .lock()
        .iter()
        .filter(|(p, m)| *p == peer && matches!(m, BudgetMessage::SyncStatusCount { .. }))
        .count();
    assert_eq!(markers, 2);
}

#[test]
fn fill_block_payee_expands_the_coinbase() {
    let env = env();

    let a = env.add_proposal("alpha", Amount(30 * COIN), true);
    env.vote_on_proposal(&a, 20, 0);
    let f = env.add_finalized(vec![env.payment(&a)]);
    env.vote_on_finalized(&f, 20);

    // the winner pays at height 200, so the tip must be at 199
    env.manager.set_best_height(199);

    // proof of stake: the payment is appended
    let mut coinstake = Transaction::new(vec![TxOut::new(Amount::zero(), Script::PayToPubkeyHash([1; 20]))]);
    assert!(env.manager.fill_block_payee(&mut coinstake, true));
    assert_eq!(coinstake.outputs.len(), 2);
    assert_eq!(coinstake.outputs[1].value, Amount(30 * COIN));

    // proof of work: subsidy in output 0, payment in output 1
    let mut coinbase = Transaction::new(vec![TxOut::new(Amount::zero(), Script::PayToPubkeyHash([1; 20]))]);
    assert!(env.manager.fill_block_payee(&mut coinbase, false));
    assert_eq!(coinbase.outputs.len(), 2);
    assert_eq!(coinbase.outputs[0].value, Amount(450 * COIN));
    assert_eq!(coinbase.outputs[1].value, Amount(30 * COIN));
}
