//! Whitelist capability and its implementations.
//!
//! A whitelist answers one question per mint request: how many NFTs is this
//! buyer still allowed to mint? The engine resolves the concrete variant once
//! at startup and only ever talks to the [`Whitelist`] trait. Consumption is
//! recorded on disk (files moved from an `unused/` to a `consumed/`
//! directory) and only after the mint transaction has been submitted; by
//! that point an inconsistency can no longer be rolled back, so `consume`
//! treats an over-decrement as a fatal, manually-investigated condition.

mod asset;
mod filesystem;
mod no_whitelist;
mod wallet;

pub use asset::{SingleUseWhitelist, UnlimitedWhitelist};
pub use filesystem::SlotStore;
pub use no_whitelist::NoWhitelist;
pub use wallet::WalletWhitelist;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::blockfrost::{ChainIndexer, TxnIo, TxnMetadataLabel, TxnUtxos};
use crate::utxo::Utxo;

/// Capacity sentinel for "no limit".
pub const UNLIMITED: u64 = u64::MAX;

/// Everything a whitelist variant may need to answer `available` and
/// `consume` for one mint request. Gathered once per candidate so the two
/// calls observe the same world.
#[derive(Debug, Default)]
pub struct WhitelistResources {
    /// Outputs of the mint request's own transaction.
    pub utxo_outputs: Vec<TxnIo>,

    /// Metadata labels attached to the mint request's transaction.
    pub metadata: Vec<TxnMetadataLabel>,

    /// Addresses actually funding the transaction (reference and collateral
    /// inputs excluded).
    pub input_addrs: BTreeSet<String>,
}

impl WhitelistResources {
    /// Collect funding addresses from a transaction's inputs.
    pub fn funding_addrs(txn_utxos: &TxnUtxos) -> BTreeSet<String> {
        txn_utxos
            .inputs
            .iter()
            .filter(|input| !(input.reference || input.collateral))
            .map(|input| input.address.clone())
            .collect()
    }
}

/// Polymorphic whitelist capability.
#[async_trait]
pub trait Whitelist: Send + Sync {
    /// Gather the resource bundle needed to evaluate this mint request.
    async fn required_info(
        &self,
        mint_req: &Utxo,
        txn_utxos: &TxnUtxos,
        indexer: &dyn ChainIndexer,
    ) -> Result<WhitelistResources>;

    /// Remaining mint capacity for the request: 0 means not whitelisted,
    /// [`UNLIMITED`] means no limit.
    fn available(&self, resources: &WhitelistResources) -> u64;

    /// Record `num_mints` consumed slots. Called once per successful vend,
    /// after submission. Errors here are fatal consistency violations.
    fn consume(&self, resources: &WhitelistResources, num_mints: u64) -> Result<()>;

    /// Check the whitelist's static configuration.
    fn validate(&self) -> Result<()>;
}
