//! Interface ke subsystem luar.
//!
//! Budget layer tidak memiliki chain index, masternode directory, wallet,
//! atau P2P transport sendiri; semuanya dikonsumsi lewat trait di module
//! ini. Host node menyediakan implementasi konkret saat membangun
//! [`crate::manager::BudgetManager`]; test suite menyediakan mock in-memory.
//!
//! # Kontrak untuk Implementor
//!
//! Semua trait memerlukan `Send + Sync`: manager dipanggil bersamaan dari
//! network thread, block-processing thread, dan maintenance tick.

use serde::{Deserialize, Serialize};

use crate::types::{Amount, Hash, OutPoint, Transaction};
use crate::vote::{BudgetVote, FinalizedBudgetVote};
use crate::proposal::ProposalBroadcast;
use crate::finalized::FinalizedBudgetBroadcast;

// ════════════════════════════════════════════════════════════════════════════
// PEERS & INVENTORY
// ════════════════════════════════════════════════════════════════════════════

/// Opaque peer identifier assigned by the host's connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

/// The slice of peer state the budget layer reads.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub id: PeerId,
    pub protocol_version: i32,
}

/// Inventory item kinds announced for budget objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvType {
    BudgetProposal,
    BudgetVote,
    FinalizedBudget,
    FinalizedBudgetVote,
}

/// Inventory announcement relayed through the host network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvType,
    pub hash: Hash,
}

impl Inv {
    pub fn new(kind: InvType, hash: Hash) -> Self { Inv { kind, hash } }
}

// ════════════════════════════════════════════════════════════════════════════
// WIRE MESSAGES
// ════════════════════════════════════════════════════════════════════════════

/// Budget messages exchanged with peers. The transport delivers them
/// pre-framed; `decode`/`encode` map to the raw payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BudgetMessage {
    /// Request a dump of known items. `filter = None` asks for everything,
    /// otherwise only the entity with the given hash (plus its votes).
    VoteSync { filter: Option<Hash> },
    Proposal(ProposalBroadcast),
    Vote(BudgetVote),
    FinalizedBudget(FinalizedBudgetBroadcast),
    FinalizedVote(FinalizedBudgetVote),
    /// Sync terminator: how many items of the tagged phase were announced.
    SyncStatusCount { phase: u32, count: u32 },
}

impl BudgetMessage {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// COLLABORATOR TRAITS
// ════════════════════════════════════════════════════════════════════════════

/// Index entry for a block known to the host chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub height: i64,
    pub time: i64,
}

/// Read access to the host blockchain index.
pub trait ChainIndex: Send + Sync {
    /// Look up a transaction and the hash of its containing block.
    /// `None` block hash means the transaction is known but unconfirmed.
    fn transaction_with_block(&self, txid: &Hash) -> Option<(Transaction, Option<Hash>)>;

    /// Height and time of a block, if the index knows it.
    fn block_index(&self, block_hash: &Hash) -> Option<BlockIndexEntry>;

    /// Whether the block is part of the current active chain.
    fn active_chain_contains(&self, block_hash: &Hash) -> bool;

    /// Full block reward at the given height (used when expanding a
    /// proof-of-work coinbase around a budget payment).
    fn block_value(&self, height: i64) -> Amount;
}

/// A masternode entry as published by the directory.
#[derive(Debug, Clone)]
pub struct MasternodeInfo {
    pub outpoint: OutPoint,
    /// ed25519 public key the masternode signs budget votes with.
    pub pubkey: Vec<u8>,
    pub enabled: bool,
    pub protocol_version: i32,
}

/// A masternode controlled by this node, able to sign votes.
#[derive(Debug, Clone)]
pub struct ActiveMasternode {
    /// Resolved collateral outpoint; `None` until the masternode activates.
    pub outpoint: Option<OutPoint>,
    /// ed25519 secret key bytes for vote signing.
    pub secret_key: Vec<u8>,
}

/// The masternode directory: who may vote, and how to reach them.
pub trait MasternodeDirectory: Send + Sync {
    fn find(&self, outpoint: &OutPoint) -> Option<MasternodeInfo>;

    /// Count of enabled masternodes at or above the given protocol version.
    fn count_enabled(&self, min_protocol: i32) -> i64;

    /// Ask a peer for the masternode announcement backing `outpoint`.
    fn ask_for_masternode(&self, peer: PeerId, outpoint: &OutPoint);

    /// Masternodes run by this node (empty on non-masternode nodes).
    fn active_masternodes(&self) -> Vec<ActiveMasternode>;
}

/// Outbound side of the P2P layer.
pub trait BudgetNetwork: Send + Sync {
    /// Announce an inventory item to all peers.
    fn relay_inv(&self, inv: &Inv);

    /// Queue an inventory announcement for one peer.
    fn push_inventory(&self, peer: PeerId, inv: &Inv);

    /// Send a budget message to one peer.
    fn push_message(&self, peer: PeerId, msg: &BudgetMessage);

    /// Visit every connected peer.
    fn for_each_peer(&self, f: &mut dyn FnMut(&PeerInfo));

    /// Raise a peer's misbehavior score.
    fn misbehaving(&self, peer: PeerId, score: i32);
}

/// Wallet operations the submitter needs.
pub trait BudgetWallet: Send + Sync {
    /// Build, fund, and commit a collateral transaction paying the required
    /// fee to an unspendable output committing to `binding`. Returns the
    /// transaction id of the committed transaction.
    fn create_collateral_tx(&self, binding: &Hash, is_finalization: bool) -> anyhow::Result<Hash>;
}

/// Progress of the host's masternode sync state machine.
pub trait BudgetSyncTracker: Send + Sync {
    /// Blockchain headers/blocks caught up far enough to process messages.
    fn is_blockchain_synced(&self) -> bool;

    /// Every sync stage finished.
    fn is_synced(&self) -> bool;

    /// The budget stage itself has been passed (we may serve/relay).
    fn budget_stage_passed(&self) -> bool;

    /// Acknowledge one received budget item towards sync accounting.
    fn added_budget_item(&self, hash: &Hash);
}
