//! UTXO and balance value objects.
//!
//! These strengthen the stringly-typed data coming back from the chain
//! indexer. A [`Utxo`]'s identity is its `(hash, index)` pair only, which is
//! what lets the engine keep a `HashSet<Utxo>` of already-processed
//! candidates regardless of how their balances were reported.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Network-enforced minimum lovelace value for an ADA-only output.
pub const MIN_UTXO_VALUE: u64 = 1_000_000;

/// A quantity of a single fungible unit held on a UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Quantity in lovelace (for ADA) or token units.
    pub quantity: u64,

    /// Unit identifier: [`Balance::LOVELACE`] for native ADA, otherwise the
    /// concatenated `policyid || assetnamehex` form the indexer reports.
    pub unit: String,
}

impl Balance {
    /// The unit identifier for native ADA.
    pub const LOVELACE: &'static str = "lovelace";

    pub fn new(quantity: u64, unit: &str) -> Self {
        let unit = if unit.is_empty() {
            Self::LOVELACE.to_string()
        } else {
            unit.to_string()
        };
        Self { quantity, unit }
    }

    /// Whether this balance is denominated in native ADA.
    pub fn is_lovelace(&self) -> bool {
        self.unit == Self::LOVELACE
    }
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.quantity, self.unit)
    }
}

/// An unspent transaction output observed at the payment address.
///
/// Constructed fresh from each indexer poll and never mutated. Equality and
/// hashing intentionally ignore `balances` so that the exclusion set matches
/// a candidate no matter how it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    /// Hash of the transaction that created this output.
    pub hash: String,

    /// Output index within that transaction.
    pub index: u32,

    /// Balances carried by this output, as reported by the indexer.
    pub balances: Vec<Balance>,
}

impl Utxo {
    pub fn new(hash: &str, index: u32, balances: Vec<Balance>) -> Self {
        Self {
            hash: hash.to_string(),
            index,
            balances,
        }
    }

    /// The lovelace balance of this output, if the indexer reported one.
    pub fn lovelace(&self) -> Option<u64> {
        self.balances
            .iter()
            .find(|balance| balance.is_lovelace())
            .map(|balance| balance.quantity)
    }
}

impl PartialEq for Utxo {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.index == other.index
    }
}

impl Eq for Utxo {}

impl Hash for Utxo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.index.hash(state);
    }
}

impl std::fmt::Display for Utxo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.hash, self.index)?;
        for balance in &self.balances {
            write!(f, " {balance}")?;
        }
        Ok(())
    }
}
