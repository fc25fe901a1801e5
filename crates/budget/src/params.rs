//! Chain parameters dan konstanta budget.
//!
//! Semua nilai di module ini bersifat consensus-critical: node dengan nilai
//! berbeda akan menghitung budget cap / collateral depth yang berbeda dan
//! fork dari network.

use serde::{Deserialize, Serialize};

use crate::types::{Amount, COIN};

// ════════════════════════════════════════════════════════════════════════════
// BUDGET CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Collateral fee for a budget proposal.
pub const PROPOSAL_FEE_TX: Amount = Amount(50 * COIN);

/// Collateral fee for a finalized budget.
pub const BUDGET_FEE_TX: Amount = Amount(5 * COIN);

/// Minimum amount a proposal may request.
pub const PROPOSAL_MIN_AMOUNT: Amount = Amount(10 * COIN);

/// Minimum seconds between two accepted votes from the same masternode on
/// the same target.
pub const BUDGET_VOTE_UPDATE_MIN: i64 = 60 * 60;

/// Maximum seconds a vote timestamp may run ahead of local wall clock.
pub const VOTE_MAX_TIME_DRIFT: i64 = 60 * 60;

/// A finalized budget carries at most this many payments.
pub const MAX_FINALIZED_BUDGET_PAYMENTS: usize = 100;

/// Entries in the outstanding source-request map expire after 24 hours.
pub const SOURCE_REQUEST_EXPIRY: i64 = 60 * 60 * 24;

/// Maintenance work in `new_block` runs once every this many blocks.
pub const MAINTENANCE_INTERVAL_BLOCKS: i64 = 14;

/// Misbehavior score applied for malicious budget traffic.
pub const MISBEHAVING_SCORE: i32 = 20;

/// Sync phase tags emitted in `SyncStatusCount` markers.
pub const SYNC_BUDGET_PROP: u32 = 10;
pub const SYNC_BUDGET_FIN: u32 = 11;

// ════════════════════════════════════════════════════════════════════════════
// NETWORK PARAMETERS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Main,
    Testnet,
    Regtest,
}

/// Per-network chain parameters consumed by the budget layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    pub network: Network,
    /// 4-byte network magic, written into the snapshot header.
    pub message_start: [u8; 4],
    /// Blocks between successive superblocks.
    pub budget_cycle_blocks: i64,
    /// Confirmation depth required on collateral transactions.
    pub budget_fee_confirmations: i64,
    /// Seconds a proposal must exist before it can count as passing.
    pub proposal_establishment_time: i64,
    /// Minimum peer protocol version accepted for vote exchange.
    pub active_protocol: i32,
    /// Height at which proof of stake activates.
    pub height_pos_start: i64,
    /// Height of the second zerocoin protocol upgrade.
    pub height_zc_v2: i64,
}

impl ChainParams {
    pub fn main() -> Self {
        ChainParams {
            network: Network::Main,
            message_start: [0x41, 0x66, 0x6f, 0x4d],
            budget_cycle_blocks: 43_200,
            budget_fee_confirmations: 6,
            proposal_establishment_time: 60 * 60 * 24,
            active_protocol: 70_920,
            height_pos_start: 259_201,
            height_zc_v2: 1_153_160,
        }
    }

    pub fn testnet() -> Self {
        ChainParams {
            network: Network::Testnet,
            message_start: [0x41, 0x66, 0x6f, 0x54],
            budget_cycle_blocks: 144,
            budget_fee_confirmations: 3,
            proposal_establishment_time: 60 * 5,
            active_protocol: 70_920,
            height_pos_start: 201,
            height_zc_v2: 444,
        }
    }

    pub fn regtest() -> Self {
        ChainParams {
            network: Network::Regtest,
            message_start: [0x41, 0x66, 0x6f, 0x52],
            budget_cycle_blocks: 144,
            budget_fee_confirmations: 1,
            proposal_establishment_time: 60 * 5,
            active_protocol: 70_920,
            height_pos_start: 251,
            height_zc_v2: 300,
        }
    }

    fn is_pos_active(&self, height: i64) -> bool {
        height >= self.height_pos_start
    }

    fn is_zc_v2_active(&self, height: i64) -> bool {
        height >= self.height_zc_v2
    }

    /// Superblock submission window: a finalized budget may only be submitted
    /// this many blocks before its superblock.
    pub fn finalization_window(&self) -> i64 {
        if self.network == Network::Testnet {
            // 56 + 4 finalization confirmations + buffer for propagation.
            // The formula below would yield 9 blocks, far too short for a
            // single auto-check tick to ever land inside the window.
            return 64;
        }
        (self.budget_cycle_blocks / 30) * 2
    }

    /// Per-cycle budget cap at the given superblock height.
    ///
    /// The height bands replicate the deployed emission schedule and must not
    /// be collapsed into a formula: historical superblocks replay against
    /// exactly these values.
    pub fn total_budget(&self, height: i64) -> Amount {
        if self.network == Network::Testnet {
            let subsidy = 500 * COIN;
            return Amount(((subsidy / 100) * 10) * 146);
        }

        let pos_active = self.is_pos_active(height);
        let subsidy: u128 = if height >= 151_200 && !pos_active {
            50 * COIN
        } else if pos_active && height <= 302_399 {
            50 * COIN
        } else if (302_400..=345_599).contains(&height) {
            45 * COIN
        } else if (345_600..=388_799).contains(&height) {
            40 * COIN
        } else if (388_800..=431_999).contains(&height) {
            35 * COIN
        } else if (432_000..=475_199).contains(&height) {
            30 * COIN
        } else if (475_200..=518_399).contains(&height) {
            25 * COIN
        } else if (518_400..=561_599).contains(&height) {
            20 * COIN
        } else if (561_600..=604_799).contains(&height) {
            15 * COIN
        } else if (604_800..=647_999).contains(&height) {
            10 * COIN
        } else if self.is_zc_v2_active(height) {
            10 * COIN
        } else {
            5 * COIN
        };

        // 10% of emission over a month of one-minute blocks (60*24*30),
        // with a fixed cap for the first bootstrapping period.
        if height <= 172_800 {
            Amount(648_000 * COIN)
        } else {
            Amount(((subsidy / 100) * 10) * 1440 * 30)
        }
    }
}
