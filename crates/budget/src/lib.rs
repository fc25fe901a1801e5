//! # AFO Masternode Budget Library
//!
//! Subsystem governance terdesentralisasi untuk node AFO: replicated state
//! machine yang digerakkan gossip antar masternode dan menentukan pembayaran
//! on-chain ("budget payments") yang wajib dimuat blockchain pada superblock.
//!
//! ## Module Overview
//!
//! | Module | Fungsi |
//! |--------|--------|
//! | `types` | Core types: Hash, Amount, OutPoint, Script, Transaction |
//! | `crypto` | SHA3-256 hashing + Ed25519 vote signatures |
//! | `params` | Chain parameters, fee constants, budget cap schedule |
//! | `external` | Trait seams ke chain index, masternode directory, network, wallet |
//! | `collateral` | Verifikasi fee transaction on-chain (op-return binding) |
//! | `vote` | BudgetVote / FinalizedBudgetVote + aturan intake |
//! | `proposal` | Entity proposal: well-formedness, passing, tally |
//! | `finalized` | Entity finalized budget: slate, double-payment cache |
//! | `manager` | BudgetManager: maps, locks, pesan network, alokasi, submitter |
//! | `db` | Snapshot budget.dat (magic + checksum, atomic write) |
//!
//! ## Data Flow
//!
//! ```text
//! network ──► BudgetManager::process_message
//!                 │  validate, dedup, route
//!                 ▼
//!        proposal / finalized entity ──► optional relay
//!
//! block validator ──► BudgetManager::is_transaction_valid
//!                         │
//!                         ▼
//!              Valid / Invalid / DoublePayment / VoteThreshold
//! ```
//!
//! ## Consensus-Critical Components
//!
//! Komponen berikut memerlukan hard-fork untuk perubahan:
//!
//! - Identity hash tuples di `proposal.rs` / `finalized.rs` / `vote.rs`
//! - Budget cap schedule di `params.rs`
//! - Canonical signed vote message di `vote.rs`
//! - Ordering alokasi dan tiebreak collateral-hash
//!
//! ## Threading
//!
//! `BudgetManager` dipanggil bersamaan dari network thread, block-processing
//! thread, dan maintenance tick. Empat region state dijaga mutex independen;
//! lihat dokumentasi `manager` untuk disiplin lock.

pub mod types;
pub mod crypto;
pub mod params;
pub mod external;
pub mod collateral;
pub mod vote;
pub mod proposal;
pub mod finalized;
pub mod manager;
pub mod db;

pub use collateral::{check_collateral, CollateralError, CollateralInfo};
pub use external::{
    ActiveMasternode, BlockIndexEntry, BudgetMessage, BudgetNetwork, BudgetSyncTracker,
    BudgetWallet, ChainIndex, Inv, InvType, MasternodeDirectory, MasternodeInfo, PeerId, PeerInfo,
};
pub use finalized::{BudgetPayment, FinalizedBudget, FinalizedBudgetBroadcast, TrxValidationStatus};
pub use manager::{BudgetError, BudgetManager, BudgetMode, BudgetSnapshot};
pub use params::{ChainParams, Network};
pub use proposal::{BudgetProposal, ProposalBroadcast};
pub use types::{Amount, Hash, OutPoint, Script, Transaction, TxOut, COIN};
pub use vote::{BudgetVote, FinalizedBudgetVote, VoteDirection, VoteError};
pub use db::{dump_budgets, load_budgets, BudgetDb, DbError};
