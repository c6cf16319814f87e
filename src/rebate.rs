//! Minimum-UTXO storage rebate calculation.
//!
//! Outputs carrying native tokens must hold more lovelace than ADA-only
//! outputs, scaling with the number of policies and the combined length of
//! the asset names on the output. The vending machine refunds ("rebates")
//! exactly that amount to whoever ends up holding the tokens.
//!
//! The arithmetic here reproduces the network's minimum-UTXO rule byte for
//! byte: the ceil/floor placement matters. Over-rebating erodes the seller's
//! margin; under-rebating produces transactions the network rejects.

use crate::utxo::MIN_UTXO_VALUE;

/// Serialized size in words of a UTXO entry holding only ADA.
const ADA_ONLY_UTXO_SIZE: u64 = 27;

/// Fixed per-entry overhead words added on top of the asset bundle.
const PER_UTXO_OVERHEAD: u64 = 6;

/// Bytes of bookkeeping per distinct asset in the bundle.
const PER_ASSET_BYTES: u64 = 12;

/// Bytes of bookkeeping per distinct policy in the bundle.
const PER_POLICY_BYTES: u64 = 28;

/// Lovelace owed per serialized word.
const LOVELACE_PER_WORD: u64 = MIN_UTXO_VALUE / ADA_ONLY_UTXO_SIZE;

/// Compute the minimum lovelace an output must carry to hold the given
/// bundle of native tokens.
///
/// Returns 0 for an empty bundle. `total_name_chars` is the combined length
/// of all (unencoded) asset names across the bundle.
pub fn calculate_rebate(num_policies: u64, num_assets: u64, total_name_chars: u64) -> u64 {
    if num_assets < 1 {
        return 0;
    }
    let asset_bytes = num_assets * PER_ASSET_BYTES + total_name_chars + num_policies * PER_POLICY_BYTES;
    let asset_words = asset_bytes.div_ceil(8);
    LOVELACE_PER_WORD * (ADA_ONLY_UTXO_SIZE + PER_UTXO_OVERHEAD + asset_words)
}
