//! Collateral verification for proposals and finalized budgets.
//!
//! A budget item is only admitted once a fee transaction exists on the active
//! chain, pays the required fee into an unspendable output committing to the
//! item's identity hash, and has accrued the configured confirmation depth.
//! Every failure here is non-fatal: the caller rejects the item and may see
//! it succeed at a later height once the depth has grown.

use thiserror::Error;
use tracing::debug;

use crate::external::ChainIndex;
use crate::params::{ChainParams, BUDGET_FEE_TX, PROPOSAL_FEE_TX};
use crate::types::{Amount, Hash, Script};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollateralError {
    #[error("can't find collateral tx {0}")]
    TxNotFound(Hash),

    #[error("collateral transaction {0} is unconfirmed")]
    Unconfirmed(Hash),

    #[error("collateral transaction {0} not in active chain")]
    NotInActiveChain(Hash),

    #[error("collateral transaction has no outputs")]
    NoOutputs,

    #[error("collateral transaction has non-zero lock time")]
    NonZeroLockTime,

    #[error("invalid script in collateral output")]
    MalformedOutput,

    #[error("couldn't find op-return committing to {0}")]
    BindingNotCommitted(Hash),

    #[error("collateral pays {found} but {required} is required")]
    Underpaid { found: Amount, required: Amount },

    #[error(
        "collateral requires at least {required} confirmations - {confirmations} confirmations \
         (current height: {current_height}, fee tx height: {collateral_height})"
    )]
    InsufficientDepth {
        required: i64,
        confirmations: i64,
        current_height: i64,
        collateral_height: i64,
    },
}

/// Block height and time of a verified collateral transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollateralInfo {
    pub block_height: i64,
    pub block_time: i64,
}

/// Depth check. The inclusion block counts as the first confirmation.
fn check_collateral_confs(
    required: i64,
    current_height: i64,
    collateral_height: i64,
) -> Result<(), CollateralError> {
    let confirmations = (current_height - collateral_height) + 1;
    if confirmations < required {
        return Err(CollateralError::InsufficientDepth {
            required,
            confirmations,
            current_height,
            collateral_height,
        });
    }
    Ok(())
}

/// Verify the collateral transaction backing a proposal or finalized budget.
///
/// `expected_binding` is the identity hash of the item; the fee transaction
/// must commit to exactly this hash in an op-return output worth at least the
/// proposal fee (or the finalization fee when `is_finalization`).
pub fn check_collateral(
    chain: &dyn ChainIndex,
    params: &ChainParams,
    collateral_txid: &Hash,
    expected_binding: &Hash,
    current_height: i64,
    is_finalization: bool,
) -> Result<CollateralInfo, CollateralError> {
    let (tx, block_hash) = chain
        .transaction_with_block(collateral_txid)
        .ok_or(CollateralError::TxNotFound(*collateral_txid))?;

    if tx.outputs.is_empty() {
        return Err(CollateralError::NoOutputs);
    }
    if tx.lock_time != 0 {
        return Err(CollateralError::NonZeroLockTime);
    }

    let find_script = Script::op_return(expected_binding);
    let required_fee = if is_finalization { BUDGET_FEE_TX } else { PROPOSAL_FEE_TX };

    let mut found_binding = false;
    let mut underpaid: Option<Amount> = None;
    for out in &tx.outputs {
        if !out.script.is_normal_payment() && !out.script.is_unspendable() {
            return Err(CollateralError::MalformedOutput);
        }
        if out.script == find_script {
            if out.value >= required_fee {
                found_binding = true;
            } else {
                underpaid = Some(underpaid.map_or(out.value, |v| v.max(out.value)));
            }
        }
    }

    if !found_binding {
        return Err(match underpaid {
            Some(found) => CollateralError::Underpaid { found, required: required_fee },
            None => CollateralError::BindingNotCommitted(*expected_binding),
        });
    }

    let block_hash = block_hash.ok_or(CollateralError::Unconfirmed(*collateral_txid))?;

    let index = chain
        .block_index(&block_hash)
        .filter(|_| chain.active_chain_contains(&block_hash))
        .ok_or(CollateralError::NotInActiveChain(*collateral_txid))?;

    check_collateral_confs(params.budget_fee_confirmations, current_height, index.height)?;

    debug!(
        collateral = %collateral_txid,
        height = index.height,
        "collateral verified"
    );
    Ok(CollateralInfo {
        block_height: index.height,
        block_time: index.time,
    })
}
