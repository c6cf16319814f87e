//! Launcher configuration for the vending machine.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, ValueEnum};

use crate::bogo::Bogo;
use crate::cardano_cli::TXN_DIR;
use crate::mint::Price;
use crate::utxo::Balance;
use crate::vend::{LOCKED_SUBDIR, METADATA_SUBDIR};
use crate::whitelist::{
    NoWhitelist, SingleUseWhitelist, UnlimitedWhitelist, WalletWhitelist, Whitelist,
};

/// Subdirectory of the whitelist dir holding unconsumed slot files.
const WHITELIST_UNUSED_SUBDIR: &str = "unused";

/// Subdirectory of the whitelist dir holding consumed slot files.
const WHITELIST_CONSUMED_SUBDIR: &str = "consumed";

/// Which whitelist implementation gates the mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WhitelistMode {
    /// No mint restrictions
    #[default]
    None,
    /// One mint per whitelisted asset held by the buyer
    SingleUseAsset,
    /// Unlimited mints for holders of a whitelisted asset
    UnlimitedAsset,
    /// Slot files per wallet, proven by a CIP-8 signed message
    Wallet,
}

/// Vending machine configuration.
#[derive(Debug, Parser)]
#[command(name = "nft-vending-machine")]
#[command(about = "Automated NFT vending machine for the Cardano blockchain")]
#[command(version)]
pub struct VendingConfig {
    /// Cardano address where mint payments are sent to
    #[arg(long)]
    pub payment_addr: String,

    /// Location on disk of wallet signing keys for the payment landing zone
    #[arg(long)]
    pub payment_sign_key: PathBuf,

    /// Cardano address where mint profits should be taken (hardware wallet recommended)
    #[arg(long)]
    pub profit_addr: String,

    /// Price charged per NFT, as AMOUNT or AMOUNT:UNIT (repeatable; UNIT
    /// defaults to lovelace, otherwise policyhex.assetnamehex)
    #[arg(long = "mint-price", value_name = "AMOUNT[:UNIT]")]
    pub mint_prices: Vec<String>,

    /// Perform a free mint (buyer is refunded all ADA minus the fee)
    #[arg(long, conflicts_with = "mint_prices")]
    pub free_mint: bool,

    /// Developer fee in lovelace per paid mint
    #[arg(long, default_value_t = 0)]
    pub dev_fee: u64,

    /// Cardano address receiving the developer fee
    #[arg(long)]
    pub dev_addr: Option<String>,

    /// Local path of a native script file for the mint (repeatable)
    #[arg(long = "mint-script")]
    pub mint_scripts: Vec<PathBuf>,

    /// Location on disk of a signing key used for the mint (repeatable,
    /// one-to-one with --mint-script)
    #[arg(long = "mint-sign-key")]
    pub mint_sign_keys: Vec<PathBuf>,

    /// Local folder where CIP-25 metadata files (the inventory) are stored
    #[arg(long)]
    pub metadata_dir: PathBuf,

    /// Local folder where vending machine output is stored
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Blockfrost project id used for retrieving chain data
    #[arg(long)]
    pub blockfrost_project: String,

    /// Run against mainnet (default is the test network)
    #[arg(long)]
    pub mainnet: bool,

    /// Backend limit on NFTs vended in a single transaction (recommended)
    #[arg(long)]
    pub single_vend_max: Option<u64>,

    /// Randomly pick from the metadata directory when vending
    #[arg(long)]
    pub vend_randomly: bool,

    /// Whitelist implementation gating the mint
    #[arg(long, value_enum, default_value_t)]
    pub whitelist: WhitelistMode,

    /// Whitelist directory with unused/ and consumed/ subdirectories
    #[arg(long)]
    pub whitelist_dir: Option<PathBuf>,

    /// Paid mints required to earn a bonus (buy-N-get-M)
    #[arg(long)]
    pub bogo_threshold: Option<u64>,

    /// Free mints granted per threshold reached
    #[arg(long)]
    pub bogo_additional: Option<u64>,

    /// Validate the configuration and exit without vending
    #[arg(long)]
    pub validate_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl VendingConfig {
    /// Structural checks that do not require touching the chain.
    pub fn validate(&self) -> Result<()> {
        if !self.free_mint && self.mint_prices.is_empty() {
            bail!("One of --mint-price or --free-mint is required");
        }
        self.prices()?;
        if self.mint_scripts.is_empty() {
            bail!("At least one --mint-script is required");
        }
        if self.mint_scripts.len() != self.mint_sign_keys.len() {
            bail!(
                "Got {} mint scripts but {} mint signing keys",
                self.mint_scripts.len(),
                self.mint_sign_keys.len()
            );
        }
        if self.whitelist != WhitelistMode::None && self.whitelist_dir.is_none() {
            bail!("--whitelist-dir is required for whitelist mode {:?}", self.whitelist);
        }
        if self.bogo_threshold.is_some() != self.bogo_additional.is_some() {
            bail!("--bogo-threshold and --bogo-additional must be provided together");
        }
        if self.bogo_threshold == Some(0) {
            bail!("--bogo-threshold must be positive");
        }
        Ok(())
    }

    /// Configured prices; a free mint is one zero-lovelace price.
    pub fn prices(&self) -> Result<Vec<Price>> {
        if self.free_mint {
            return Ok(vec![Price::new(0, Balance::LOVELACE)]);
        }
        self.mint_prices.iter().map(|spec| parse_price(spec)).collect()
    }

    pub fn single_vend_max(&self) -> u64 {
        self.single_vend_max.unwrap_or(u64::MAX)
    }

    pub fn bogo(&self) -> Option<Bogo> {
        match (self.bogo_threshold, self.bogo_additional) {
            (Some(threshold), Some(additional)) => Some(Bogo::new(threshold, additional)),
            _ => None,
        }
    }

    /// Construct the configured whitelist implementation.
    pub fn build_whitelist(&self) -> Result<Box<dyn Whitelist>> {
        if self.whitelist == WhitelistMode::None {
            return Ok(Box::new(NoWhitelist));
        }
        let whitelist_dir = self
            .whitelist_dir
            .as_ref()
            .ok_or_else(|| anyhow!("--whitelist-dir is required for whitelist mode {:?}", self.whitelist))?;
        let unused = whitelist_dir.join(WHITELIST_UNUSED_SUBDIR);
        let consumed = whitelist_dir.join(WHITELIST_CONSUMED_SUBDIR);
        Ok(match self.whitelist {
            WhitelistMode::None => unreachable!(),
            WhitelistMode::SingleUseAsset => Box::new(SingleUseWhitelist::new(&unused, &consumed)),
            WhitelistMode::UnlimitedAsset => Box::new(UnlimitedWhitelist::new(&unused, &consumed)),
            WhitelistMode::Wallet => Box::new(WalletWhitelist::new(&unused, &consumed)),
        })
    }

    /// Create the output directory layout the engine writes into.
    pub fn ensure_output_dirs(&self) -> Result<()> {
        for subdir in [LOCKED_SUBDIR, METADATA_SUBDIR, TXN_DIR] {
            std::fs::create_dir_all(self.output_dir.join(subdir))?;
        }
        Ok(())
    }

    /// Location of the rewritten protocol parameters file.
    pub fn protocol_params_file(&self) -> PathBuf {
        self.output_dir.join("protocol.json")
    }
}

fn parse_price(spec: &str) -> Result<Price> {
    let (amount, unit) = match spec.split_once(':') {
        Some((amount, unit)) => (amount, unit),
        None => (spec, Balance::LOVELACE),
    };
    let lovelace: u64 = amount
        .parse()
        .map_err(|_| anyhow!("Unparseable price amount in '{spec}'"))?;
    Ok(Price::new(lovelace, unit))
}

/// Check the whitelist directory layout exists on disk.
pub fn validate_whitelist_dir(whitelist_dir: &Path) -> Result<()> {
    for subdir in [WHITELIST_UNUSED_SUBDIR, WHITELIST_CONSUMED_SUBDIR] {
        let dir = whitelist_dir.join(subdir);
        if !dir.is_dir() {
            bail!("Whitelist directory {} does not exist", dir.display());
        }
    }
    Ok(())
}
