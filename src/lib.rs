//! Cardano NFT Vending Machine
//!
//! An automated NFT "vending machine" for the Cardano blockchain. It watches
//! a payment address for incoming UTXOs, computes how many NFTs a payment
//! entitles the buyer to, locks and merges CIP-25 metadata for the chosen
//! NFTs, builds/signs/submits a minting transaction through the external
//! `cardano-cli`, and records whitelist consumption. This library provides:
//!
//! - The per-request vend engine with its pricing/rebate/whitelist
//!   reconciliation (balanced multi-payee transaction plans)
//! - A minimum-UTXO storage rebate calculator matching the network rule
//! - Filesystem-backed whitelists (single-use, unlimited, CIP-8 wallet proof)
//! - A Blockfrost chain-indexer client with rate limiting and bounded retry
//!
//! # Architecture
//!
//! The engine is driven by a single polling loop: fetch candidate payment
//! UTXOs, process each serially, sleep, repeat. Chain-level operations
//! (transaction bytes, fees, signing) are delegated to `cardano-cli`; chain
//! queries and submission go through the Blockfrost REST API. Both sit
//! behind traits so tests can run the whole flow against mocks.
//!
//! # Failure Model
//!
//! Configuration errors halt startup. A structurally unusable payment UTXO
//! is logged for manual investigation and permanently excluded, with no
//! money movement attempted. Consistency violations detected after a
//! transaction has been submitted can only be escalated, never rolled back.

pub mod blockfrost;
pub mod bogo;
pub mod cardano_cli;
pub mod config;
pub mod mint;
pub mod rebate;
pub mod utxo;
pub mod vend;
pub mod whitelist;

pub use blockfrost::{BlockfrostApi, ChainIndexer};
pub use bogo::Bogo;
pub use cardano_cli::{CardanoCli, WalletCli};
pub use config::{VendingConfig, WhitelistMode};
pub use mint::{Mint, Price};
pub use utxo::{Balance, Utxo};
pub use vend::{NftVendingMachine, VendError};
pub use whitelist::Whitelist;
