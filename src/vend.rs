//! The vending engine: per-candidate vend flow and the pricing, rebate and
//! whitelist reconciliation at the heart of the machine.
//!
//! One [`NftVendingMachine`] is constructed at startup, validated once, and
//! then driven by the poll loop in `main`: fetch candidate payment UTXOs,
//! process each serially, sleep, repeat. Each candidate is excluded before
//! processing so it is considered at most once per run, success or not.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::blockfrost::{ChainIndexer, TxnUtxos};
use crate::cardano_cli::WalletCli;
use crate::mint::{Mint, Price, POLICY_LEN};
use crate::rebate::calculate_rebate;
use crate::utxo::{Balance, Utxo, MIN_UTXO_VALUE};
use crate::whitelist::WhitelistResources;

/// Subdirectory where locked (in-process) metadata files are staged.
pub const LOCKED_SUBDIR: &str = "in_proc";

/// Subdirectory where merged per-transaction metadata documents land.
pub const METADATA_SUBDIR: &str = "metadata";

/// Backoff after an unrecognized per-candidate failure.
const ERROR_WAIT: Duration = Duration::from_secs(30);

/// Seed for the shuffled metadata selection, so a restart replays the same
/// ordering over the same inventory.
const SHUFFLE_SEED: u64 = 321;

/// Errors surfaced by the vending engine.
#[derive(Debug, Error)]
pub enum VendError {
    /// The candidate UTXO itself is unusable; no money movement was
    /// attempted and manual investigation is required.
    #[error("{reason}")]
    BadUtxo { utxo: Utxo, reason: String },

    #[error("Attempting to vend from non-validated vending machine")]
    NotValidated,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The automated NFT vending machine.
pub struct NftVendingMachine {
    payment_addr: String,
    payment_sign_key: PathBuf,
    profit_addr: String,
    vend_randomly: bool,
    single_vend_max: u64,
    pub mint: Mint,
    indexer: Arc<dyn ChainIndexer>,
    wallet_cli: Arc<dyn WalletCli>,

    /// Resolved at validation time: policy id -> script file.
    script_map: BTreeMap<String, PathBuf>,
    /// Largest rebate a single vend could owe, resolved at validation time.
    max_rebate: u64,
    validated: bool,
    rng: StdRng,
}

impl NftVendingMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payment_addr: &str,
        payment_sign_key: &Path,
        profit_addr: &str,
        vend_randomly: bool,
        single_vend_max: u64,
        mint: Mint,
        indexer: Arc<dyn ChainIndexer>,
        wallet_cli: Arc<dyn WalletCli>,
    ) -> Self {
        Self {
            payment_addr: payment_addr.to_string(),
            payment_sign_key: payment_sign_key.to_path_buf(),
            profit_addr: profit_addr.to_string(),
            vend_randomly,
            single_vend_max,
            mint,
            indexer,
            wallet_cli,
            script_map: BTreeMap::new(),
            max_rebate: 0,
            validated: false,
            rng: StdRng::seed_from_u64(SHUFFLE_SEED),
        }
    }

    /// Validate the full configuration. Must succeed before [`Self::vend`]
    /// is called; raises a descriptive configuration error otherwise.
    pub async fn validate(&mut self) -> Result<()> {
        self.mint.validate()?;
        if self.payment_addr == self.profit_addr {
            bail!(
                "Payment address and profit address ({}) cannot be the same!",
                self.payment_addr
            );
        }
        self.max_rebate = max_rebate_for(&self.mint.validated_names, self.single_vend_max);
        for price in &self.mint.prices {
            if price.unit == Balance::LOVELACE
                && price.lovelace != 0
                && price.lovelace < (self.max_rebate + self.mint.dev_fee + MIN_UTXO_VALUE)
            {
                bail!(
                    "Price of {} lovelace with dev fee of {} could lead to a minUTxO error due to rebates",
                    price.lovelace,
                    self.mint.dev_fee
                );
            }
        }
        if !self.payment_sign_key.exists() {
            bail!(
                "Payment signing key file '{}' not found on filesystem",
                self.payment_sign_key.display()
            );
        }
        let expected_payment_addr = self.wallet_cli.build_addr(&self.payment_sign_key).await?;
        if expected_payment_addr != self.payment_addr {
            bail!(
                "Could not match {} to signature at '{}' (expected {})",
                self.payment_addr,
                self.payment_sign_key.display(),
                expected_payment_addr
            );
        }
        for policy in self.mint.policies.clone() {
            let script = self.resolve_script_file(&policy).await?;
            let Some(script) = script else {
                bail!("No matching script file found for policy {policy}");
            };
            self.script_map.insert(policy, script);
        }
        self.validated = true;
        Ok(())
    }

    async fn resolve_script_file(&self, policy: &str) -> Result<Option<PathBuf>> {
        for script in &self.mint.scripts {
            if self.wallet_cli.policy_id(script).await? == policy {
                return Ok(Some(script.clone()));
            }
        }
        Ok(None)
    }

    /// One poll cycle: fetch candidates at the payment address and process
    /// each serially. Every candidate is excluded before processing.
    pub async fn vend(
        &mut self,
        output_dir: &Path,
        exclusions: &mut HashSet<Utxo>,
    ) -> Result<(), VendError> {
        if !self.validated {
            return Err(VendError::NotValidated);
        }
        let mint_reqs = self
            .indexer
            .get_utxos(&self.payment_addr, exclusions)
            .await
            .map_err(VendError::Other)?;
        for mint_req in mint_reqs {
            exclusions.insert(mint_req.clone());
            match self.do_vend(&mint_req, output_dir).await {
                Ok(()) => {}
                Err(VendError::BadUtxo { utxo, reason }) => {
                    tracing::error!(
                        "UNRECOVERABLE UTXO ERROR\n{utxo}\n^--- REQUIRES INVESTIGATION: {reason}"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "Uncaught exception for {mint_req}, added to exclusions (RETRY WILL NOT BE ATTEMPTED): {e:#}"
                    );
                    tokio::time::sleep(ERROR_WAIT).await;
                }
            }
        }
        Ok(())
    }

    async fn do_vend(&mut self, mint_req: &Utxo, output_dir: &Path) -> Result<(), VendError> {
        let mut available_mints = inventory_filenames(&self.mint.nfts_dir)?;
        if available_mints.is_empty() {
            tracing::warn!("Metadata directory is empty, please restock the vending machine...");
        } else if self.vend_randomly {
            available_mints.shuffle(&mut self.rng);
        }

        let num_mints_requested =
            num_mints_requested(&self.mint.prices, self.single_vend_max, mint_req);

        let txn_utxos = self.indexer.get_txn_utxos(&mint_req.hash).await?;
        let input_addr = self.delivery_addr(mint_req, &txn_utxos)?;

        let wl_resources = self
            .mint
            .whitelist
            .required_info(mint_req, &txn_utxos, self.indexer.as_ref())
            .await?;
        let wl_availability = self.mint.whitelist.available(&wl_resources);
        let mut num_mints = [
            self.single_vend_max,
            available_mints.len() as u64,
            num_mints_requested,
            wl_availability,
        ]
        .into_iter()
        .min()
        .unwrap_or(0);

        let mut bonuses = 0;
        if let Some(bogo) = &self.mint.bogo {
            let eligible_bonuses = bogo.determine_bonuses(num_mints_requested);
            let num_mints_plus_bonus = [
                self.single_vend_max,
                available_mints.len() as u64,
                num_mints.saturating_add(eligible_bonuses),
            ]
            .into_iter()
            .min()
            .unwrap_or(0);
            tracing::info!(
                "Bonus of {eligible_bonuses} NFTs determined based on {num_mints_requested} (can mint {num_mints_plus_bonus} in total)"
            );
            bonuses = num_mints_plus_bonus - num_mints;
            num_mints += bonuses;
        }

        tracing::info!("Beginning to mint {num_mints} NFTs to send to address {input_addr}");
        let txn_id = Utc::now().timestamp();
        let nft_metadata_file = lock_and_merge(
            &self.mint.nfts_dir,
            &mut available_mints,
            num_mints,
            output_dir,
            txn_id,
        )?;
        let nft_policy_map = policy_name_map(&nft_metadata_file)?;

        let paid_mints = num_mints - bonuses;
        let pricing = self.pricing_breakdown(&input_addr, paid_mints, &nft_policy_map, mint_req, 0)?;
        tracing::info!("Anticipated pricing breakdown: {pricing:?}");

        let tx_ins = vec![format!("{}#{}", mint_req.hash, mint_req.index)];
        let tx_outs = tx_out_args(&pricing);
        let validity = (self.mint.initial_slot, self.mint.expiration_slot);
        let mint_build_tmp = self
            .wallet_cli
            .build_raw_mint_txn(
                output_dir,
                txn_id,
                &tx_ins,
                &tx_outs,
                0,
                &nft_metadata_file,
                validity,
                &nft_policy_map,
                &self.script_map,
            )
            .await?;

        let mut signers = vec![self.payment_sign_key.clone()];
        if num_mints > 0 {
            signers.extend(self.mint.sign_keys.iter().cloned());
        }
        let fee = self
            .wallet_cli
            .calculate_min_fee(&mint_build_tmp, tx_ins.len(), tx_outs.len(), signers.len())
            .await?;

        let pricing =
            self.pricing_breakdown(&input_addr, paid_mints, &nft_policy_map, mint_req, fee)?;
        tracing::info!("Final pricing breakdown: {pricing:?}");

        let tx_outs = tx_out_args(&pricing);
        let mint_build = self
            .wallet_cli
            .build_raw_mint_txn(
                output_dir,
                txn_id,
                &tx_ins,
                &tx_outs,
                fee,
                &nft_metadata_file,
                validity,
                &nft_policy_map,
                &self.script_map,
            )
            .await?;
        let mint_signed = self.wallet_cli.sign_txn(&signers, &mint_build).await?;
        let submitted = self.indexer.submit_txn(&mint_signed).await?;
        tracing::info!("Submitted transaction: {submitted}");
        // The chain has already moved; consume failures are escalated, not
        // rolled back.
        self.mint.whitelist.consume(&wl_resources, num_mints)?;
        Ok(())
    }

    /// The unique funding address of the candidate's enclosing transaction,
    /// used as the refund/delivery target.
    fn delivery_addr(&self, mint_req: &Utxo, txn_utxos: &TxnUtxos) -> Result<String, VendError> {
        let input_addrs = WhitelistResources::funding_addrs(txn_utxos);
        if input_addrs.len() != 1 {
            return Err(VendError::BadUtxo {
                utxo: mint_req.clone(),
                reason: format!(
                    "Txn hash {} has {} valid funding addresses ({:?}), aborting...",
                    mint_req.hash,
                    input_addrs.len(),
                    input_addrs
                ),
            });
        }
        Ok(input_addrs.into_iter().next().unwrap_or_default())
    }

    fn pricing_breakdown(
        &self,
        input_addr: &str,
        num_mints: u64,
        nft_policy_map: &BTreeMap<String, Vec<String>>,
        mint_req: &Utxo,
        fee: u64,
    ) -> Result<Vec<(String, BTreeMap<String, u64>)>, VendError> {
        pricing_breakdown(
            input_addr,
            &self.profit_addr,
            self.mint.dev_addr.as_deref(),
            self.mint.dev_fee,
            &self.mint.prices,
            num_mints,
            nft_policy_map,
            mint_req,
            fee,
        )
    }
}

/// Sorted inventory filenames; the pool the engine pops mints from.
fn inventory_filenames(nfts_dir: &Path) -> Result<Vec<String>> {
    let mut filenames: Vec<String> = std::fs::read_dir(nfts_dir)
        .with_context(|| format!("Could not read metadata dir {}", nfts_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    filenames.sort();
    Ok(filenames)
}

/// The mint count a payment entitles the buyer to, before any caps.
///
/// A configured price of 0 means unlimited against that unit, bounded only
/// by the single-vend ceiling.
fn num_mints_requested(prices: &[Price], single_vend_max: u64, mint_req: &Utxo) -> u64 {
    let mut requested: u64 = 0;
    for balance in &mint_req.balances {
        let unit = normalized_unit(&balance.unit);
        let Some(price) = prices.iter().find(|price| price.unit == unit) else {
            continue;
        };
        requested = requested.saturating_add(if price.lovelace == 0 {
            single_vend_max
        } else {
            balance.quantity / price.lovelace
        });
    }
    requested
}

/// Indexer-reported units concatenate policy and hex asset name; prices use
/// the dotted `policy.assetnamehex` form.
fn normalized_unit(unit: &str) -> String {
    if unit == Balance::LOVELACE || unit.len() <= POLICY_LEN {
        unit.to_string()
    } else {
        format!("{}.{}", &unit[..POLICY_LEN], &unit[POLICY_LEN..])
    }
}

/// Pop `num_mints` metadata files off the pool, merge their per-policy
/// fragments into one combined CIP-25 document, and move the sources into
/// the locked staging directory. Best-effort claim, not atomic: a crash
/// between the move and submission strands inventory in `in_proc/`.
fn lock_and_merge(
    nfts_dir: &Path,
    available_mints: &mut Vec<String>,
    num_mints: u64,
    output_dir: &Path,
    txn_id: i64,
) -> Result<PathBuf> {
    let mut combined: BTreeMap<String, serde_json::Map<String, serde_json::Value>> =
        BTreeMap::new();
    for _ in 0..num_mints {
        let filename = available_mints.remove(0);
        let source = nfts_dir.join(&filename);
        let contents = std::fs::read_to_string(&source)
            .with_context(|| format!("Could not read {}", source.display()))?;
        let parsed: serde_json::Value = serde_json::from_str(&contents)?;
        let cip25 = parsed
            .get("721")
            .and_then(|v| v.as_object())
            .ok_or_else(|| anyhow!("No '721' object in {}", source.display()))?;
        for (policy, assets) in cip25 {
            if policy == "version" {
                continue;
            }
            let assets = assets
                .as_object()
                .ok_or_else(|| anyhow!("Non-object policy entry in {}", source.display()))?;
            let merged = combined.entry(policy.clone()).or_default();
            for (nft_name, nft_metadata) in assets {
                merged.insert(nft_name.clone(), nft_metadata.clone());
            }
        }
        let locked = output_dir.join(LOCKED_SUBDIR).join(&filename);
        std::fs::rename(&source, &locked)
            .with_context(|| format!("Could not lock {}", source.display()))?;
    }
    let combined_path = output_dir
        .join(METADATA_SUBDIR)
        .join(format!("{txn_id}.json"));
    let document = serde_json::json!({ "721": combined });
    std::fs::write(&combined_path, serde_json::to_string(&document)?)
        .with_context(|| format!("Could not write {}", combined_path.display()))?;
    Ok(combined_path)
}

/// Policy -> asset names of a combined metadata document.
fn policy_name_map(metadata_file: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let contents = std::fs::read_to_string(metadata_file)
        .with_context(|| format!("Could not read {}", metadata_file.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&contents)?;
    let cip25 = parsed
        .get("721")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow!("No '721' object in {}", metadata_file.display()))?;
    let mut names = BTreeMap::new();
    for (policy, assets) in cip25 {
        if policy == "version" {
            continue;
        }
        let assets = assets
            .as_object()
            .ok_or_else(|| anyhow!("Non-object policy entry in {}", metadata_file.display()))?;
        names.insert(policy.clone(), assets.keys().cloned().collect());
    }
    Ok(names)
}

/// The payment unwind: reconcile the buyer's UTXO into a balanced payee ->
/// unit -> amount plan covering the buyer's refund and NFTs, the seller's
/// proceeds, and the developer's cut.
///
/// Invariant by construction: per unit, sum(outputs) + fee == sum(inputs).
#[allow(clippy::too_many_arguments)]
fn pricing_breakdown(
    input_addr: &str,
    profit_addr: &str,
    dev_addr: Option<&str>,
    dev_fee: u64,
    prices: &[Price],
    num_mints: u64,
    nft_policy_map: &BTreeMap<String, Vec<String>>,
    mint_req: &Utxo,
    fee: u64,
) -> Result<Vec<(String, BTreeMap<String, u64>)>, VendError> {
    tracing::info!("Building pricing breakdown for {num_mints} NFTs being paid from {mint_req}");
    let mut buyer: BTreeMap<String, i128> = BTreeMap::new();
    let mut profit: BTreeMap<String, i128> = BTreeMap::new();
    let mut dev: BTreeMap<String, i128> = BTreeMap::new();

    // Track the unwinding input balances, lovelace ahead of token units.
    let mut remaining: Vec<(String, i128)> = mint_req
        .balances
        .iter()
        .map(|balance| (normalized_unit(&balance.unit), balance.quantity as i128))
        .collect();
    remaining.sort_by(|a, b| b.0.cmp(&a.0));
    let ada_idx = remaining
        .iter()
        .position(|(unit, _)| unit == Balance::LOVELACE)
        .ok_or_else(|| VendError::BadUtxo {
            utxo: mint_req.clone(),
            reason: format!("UTxO {mint_req} carries no lovelace balance"),
        })?;

    // Pay the seller.
    let mut remaining_to_payout = num_mints as i128;
    for idx in 0..remaining.len() {
        if remaining_to_payout == 0 {
            break;
        }
        let unit = remaining[idx].0.clone();
        let Some(price) = prices.iter().find(|price| price.unit == unit) else {
            continue;
        };
        let num_paid_for = if price.lovelace == 0 {
            num_mints as i128
        } else {
            remaining_to_payout.min(remaining[idx].1 / price.lovelace as i128)
        };
        let total_paid = num_paid_for * price.lovelace as i128;
        tracing::info!("Paid for {num_paid_for} NFTs using {total_paid} {unit}");
        if num_paid_for == 0 {
            continue;
        }
        remaining_to_payout -= num_paid_for;
        remaining[idx].1 -= total_paid;
        *profit.entry(unit).or_insert(0) += total_paid;
    }

    // A seller holding only tokens still needs the ADA collateral that
    // holding tokens on a UTXO requires.
    if !profit.contains_key(Balance::LOVELACE) {
        if profit.is_empty() {
            profit.insert(Balance::LOVELACE.to_string(), 0);
        } else {
            let token_types: HashSet<&str> = profit.keys().map(|unit| &unit[..POLICY_LEN]).collect();
            let token_names: Vec<String> = profit
                .keys()
                .map(|unit| decoded_asset_name(unit))
                .collect::<Result<_>>()?;
            let total_token_chars: usize = token_names.iter().map(String::len).sum();
            let profit_rebate = calculate_rebate(
                token_types.len() as u64,
                token_names.len() as u64,
                total_token_chars as u64,
            );
            profit.insert(Balance::LOVELACE.to_string(), profit_rebate as i128);
            remaining[ada_idx].1 -= profit_rebate as i128;
        }
    }
    let profit_ada = profit[Balance::LOVELACE];
    if remaining_to_payout > 0 {
        return Err(VendError::Other(anyhow!(
            "Unable to match UTxO to payment for {num_mints} NFTs"
        )));
    }

    // Deliver the NFTs.
    for (policy, nft_names) in nft_policy_map {
        for nft_name in nft_names {
            let asset_name = format!("{policy}.{}", hex::encode(nft_name.as_bytes()));
            *buyer.entry(asset_name).or_insert(0) += 1;
        }
    }

    // The buyer's own refund output must clear the min-UTXO floor for the
    // full minted bundle.
    let all_names: Vec<&String> = nft_policy_map.values().flatten().collect();
    let total_name_chars: usize = all_names.iter().map(|name| name.len()).sum();
    let user_rebate = calculate_rebate(
        nft_policy_map.len() as u64,
        all_names.len() as u64,
        total_name_chars as u64,
    );
    tracing::info!("Minimum rebate to user is {user_rebate}");

    // An ADA-only seller absorbs the rebate and fee; otherwise they come out
    // of the buyer's remaining lovelace.
    buyer.insert(Balance::LOVELACE.to_string(), user_rebate as i128);
    if profit_ada != 0 && profit.len() == 1 {
        *profit.entry(Balance::LOVELACE.to_string()).or_insert(0) -=
            user_rebate as i128 + fee as i128;
    } else if (user_rebate as i128) > remaining[ada_idx].1 {
        return Err(VendError::Other(anyhow!(
            "USER SENT {} WHICH CAN'T COVER REBATE OF {user_rebate} (FREE MINT?)",
            remaining[ada_idx].1
        )));
    } else {
        remaining[ada_idx].1 -= user_rebate as i128 + fee as i128;
    }

    // Dev fee comes out of the seller's lovelace, and only when the seller
    // was actually paid in lovelace.
    if dev_fee > 0 {
        let expected_dev_fee = (num_mints * dev_fee) as i128;
        if profit.len() == 1 {
            let actual_dev_fee = expected_dev_fee.min(profit_ada);
            tracing::info!("Paying developer {actual_dev_fee} lovelace");
            let dev_fee_diff = expected_dev_fee - actual_dev_fee;
            if dev_fee_diff != 0 {
                tracing::warn!(
                    "SOMETHING IS OFF: Expected dev fee ({expected_dev_fee}) greater than actual ({actual_dev_fee}) by {dev_fee_diff} lovelace"
                );
            }
            dev.insert(Balance::LOVELACE.to_string(), actual_dev_fee);
            *profit.entry(Balance::LOVELACE.to_string()).or_insert(0) -= actual_dev_fee;
        } else {
            tracing::warn!(
                "NATIVE TOKEN WARNING: Cannot pay dev fee for native token, need to credit {expected_dev_fee} lovelace ({num_mints} mints)"
            );
        }
    }

    // Everything unclaimed drains back to the buyer.
    for (unit, quantity) in remaining {
        if quantity == 0 {
            continue;
        }
        *buyer.entry(unit).or_insert(0) += quantity;
    }

    let mut payees = Vec::new();
    for (addr, amounts) in [
        (Some(input_addr), buyer),
        (Some(profit_addr), profit),
        (dev_addr, dev),
    ] {
        let Some(addr) = addr else {
            continue;
        };
        let mut converted = BTreeMap::new();
        for (unit, amount) in amounts {
            if amount == 0 {
                continue;
            }
            let amount: u64 = amount.try_into().map_err(|_| {
                VendError::Other(anyhow!(
                    "Pricing breakdown produced a negative {unit} payout for {addr}"
                ))
            })?;
            converted.insert(unit, amount);
        }
        if !converted.is_empty() {
            payees.push((addr.to_string(), converted));
        }
    }
    Ok(payees)
}

/// `unit` is the dotted `policy.assetnamehex` form; recover the UTF-8 name.
fn decoded_asset_name(unit: &str) -> Result<String> {
    let hex_name = unit
        .get(POLICY_LEN + 1..)
        .ok_or_else(|| anyhow!("Unit '{unit}' has no asset name"))?;
    let bytes = hex::decode(hex_name).with_context(|| format!("Bad asset name hex in '{unit}'"))?;
    String::from_utf8(bytes).with_context(|| format!("Non-UTF-8 asset name in '{unit}'"))
}

/// `--tx-out` argument bodies, one per payee with any value.
fn tx_out_args(payees: &[(String, BTreeMap<String, u64>)]) -> Vec<String> {
    let mut tx_outs = Vec::new();
    for (payee, payouts) in payees {
        let payout_str = payouts
            .iter()
            .filter(|(_, amount)| **amount != 0)
            .map(|(unit, amount)| format!("{amount} {unit}"))
            .collect::<Vec<_>>()
            .join("+");
        if !payout_str.is_empty() {
            tx_outs.push(format!("{payee}+{payout_str}"));
        }
    }
    tx_outs
}

/// Worst-case rebate for a single vend, used to guard the configured price.
///
/// The vend ceiling may be the unlimited sentinel (`u64::MAX`); a single
/// vend can never mint more than the whole inventory, so the cap is bounded
/// by it before any size math.
fn max_rebate_for(validated_names: &std::collections::BTreeSet<String>, single_vend_max: u64) -> u64 {
    let max_mints = single_vend_max.min(validated_names.len() as u64);
    let max_len = validated_names
        .iter()
        .filter_map(|name| name.split_once('.').map(|(_, asset)| asset.len() as u64))
        .max()
        .unwrap_or(0);
    let policies: HashSet<&str> = validated_names
        .iter()
        .filter_map(|name| name.split('.').next())
        .collect();
    calculate_rebate(policies.len() as u64, max_mints, max_len * max_mints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TANGZ_POLICY: &str = "33568ad11f93b3e79ae8dee5ad928ded72adcea719e92108caf1521b";

    fn lovelace_price(lovelace: u64) -> Vec<Price> {
        vec![Price::new(lovelace, Balance::LOVELACE)]
    }

    fn single_mint_map(name: &str) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(TANGZ_POLICY.to_string(), vec![name.to_string()])])
    }

    fn payment(lovelace: u64) -> Utxo {
        Utxo::new("aabb00", 0, vec![Balance::new(lovelace, Balance::LOVELACE)])
    }

    fn amount_for<'a>(
        payees: &'a [(String, BTreeMap<String, u64>)],
        addr: &str,
        unit: &str,
    ) -> Option<u64> {
        payees
            .iter()
            .find(|(payee, _)| payee == addr)
            .and_then(|(_, amounts)| amounts.get(unit))
            .copied()
    }

    fn conservation_holds(
        payees: &[(String, BTreeMap<String, u64>)],
        mint_req: &Utxo,
        nft_policy_map: &BTreeMap<String, Vec<String>>,
        fee: u64,
    ) {
        let mut outputs: BTreeMap<String, u64> = BTreeMap::new();
        for (_, amounts) in payees {
            for (unit, amount) in amounts {
                *outputs.entry(unit.clone()).or_insert(0) += amount;
            }
        }
        // Freshly minted assets enter supply at this transaction.
        for (policy, names) in nft_policy_map {
            for name in names {
                let unit = format!("{policy}.{}", hex::encode(name.as_bytes()));
                let minted = outputs.remove(&unit).unwrap_or(0);
                assert_eq!(minted, 1, "expected exactly 1 minted {unit}");
            }
        }
        for balance in &mint_req.balances {
            let unit = normalized_unit(&balance.unit);
            let mut out = outputs.remove(&unit).unwrap_or(0);
            if unit == Balance::LOVELACE {
                out += fee;
            }
            assert_eq!(out, balance.quantity, "unit {unit} does not balance");
        }
        assert!(outputs.is_empty(), "unexpected output units: {outputs:?}");
    }

    #[test]
    fn ada_priced_mint_pays_seller_minus_rebate_and_fee() {
        let mint_req = payment(10_000_000);
        let map = single_mint_map("WildTangz 1");
        let fee = 200_000;
        let payees = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &lovelace_price(10_000_000),
            1,
            &map,
            &mint_req,
            fee,
        )
        .unwrap();

        let rebate = calculate_rebate(1, 1, "WildTangz 1".len() as u64);
        assert_eq!(
            amount_for(&payees, "addr_seller", Balance::LOVELACE),
            Some(10_000_000 - rebate - fee)
        );
        assert_eq!(amount_for(&payees, "addr_buyer", Balance::LOVELACE), Some(rebate));
        let nft_unit = format!("{TANGZ_POLICY}.{}", hex::encode("WildTangz 1"));
        assert_eq!(amount_for(&payees, "addr_buyer", &nft_unit), Some(1));
        conservation_holds(&payees, &mint_req, &map, fee);
    }

    #[test]
    fn free_mint_refunds_buyer_and_omits_seller() {
        let mint_req = payment(10_000_000);
        let mut map = BTreeMap::new();
        map.insert(
            TANGZ_POLICY.to_string(),
            vec!["A 1".to_string(), "A 2".to_string(), "A 3".to_string()],
        );
        let fee = 180_000;
        let payees = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &lovelace_price(0),
            3,
            &map,
            &mint_req,
            fee,
        )
        .unwrap();

        assert!(payees.iter().all(|(payee, _)| payee != "addr_seller"));
        assert_eq!(
            amount_for(&payees, "addr_buyer", Balance::LOVELACE),
            Some(10_000_000 - fee)
        );
        conservation_holds(&payees, &mint_req, &map, fee);
    }

    #[test]
    fn token_priced_mint_carves_seller_rebate_from_buyer() {
        let pay_unit_concat = format!("{TANGZ_POLICY}{}", hex::encode("WenToken"));
        let pay_unit = normalized_unit(&pay_unit_concat);
        let mint_req = Utxo::new(
            "aabb00",
            0,
            vec![
                Balance::new(5_000_000, Balance::LOVELACE),
                Balance::new(4, &pay_unit_concat),
            ],
        );
        let map = single_mint_map("WildTangz 1");
        let fee = 200_000;
        let prices = vec![Price::new(2, &pay_unit)];
        let payees = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &prices,
            1,
            &map,
            &mint_req,
            fee,
        )
        .unwrap();

        // Seller takes 2 tokens plus the collateral ADA for holding them.
        let seller_rebate = calculate_rebate(1, 1, "WenToken".len() as u64);
        assert_eq!(amount_for(&payees, "addr_seller", &pay_unit), Some(2));
        assert_eq!(
            amount_for(&payees, "addr_seller", Balance::LOVELACE),
            Some(seller_rebate)
        );
        // Buyer keeps the leftover 2 tokens; rebate and fee come out of the
        // buyer's own lovelace since the seller was not paid in ADA.
        let user_rebate = calculate_rebate(1, 1, "WildTangz 1".len() as u64);
        assert_eq!(amount_for(&payees, "addr_buyer", &pay_unit), Some(2));
        assert_eq!(
            amount_for(&payees, "addr_buyer", Balance::LOVELACE),
            Some(user_rebate + (5_000_000 - seller_rebate - user_rebate - fee))
        );
        conservation_holds(&payees, &mint_req, &map, fee);
    }

    #[test]
    fn mixed_payment_does_not_double_deduct() {
        // Both an ADA price and a token price configured; buyer pays with
        // both. The seller credit is then not ADA-only, so the buyer absorbs
        // rebate and fee exactly once.
        let pay_unit_concat = format!("{TANGZ_POLICY}{}", hex::encode("WenToken"));
        let pay_unit = normalized_unit(&pay_unit_concat);
        let mint_req = Utxo::new(
            "aabb00",
            0,
            vec![
                Balance::new(15_000_000, Balance::LOVELACE),
                Balance::new(2, &pay_unit_concat),
            ],
        );
        let mut map = single_mint_map("WildTangz 1");
        map.get_mut(TANGZ_POLICY)
            .unwrap()
            .push("WildTangz 2".to_string());
        let fee = 190_000;
        let prices = vec![
            Price::new(10_000_000, Balance::LOVELACE),
            Price::new(2, &pay_unit),
        ];
        let payees = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &prices,
            2,
            &map,
            &mint_req,
            fee,
        )
        .unwrap();

        // Lovelace sorts ahead of the token unit: 1 mint paid in ADA, 1 in
        // tokens. Seller holds both, so no seller-side rebate deduction.
        assert_eq!(
            amount_for(&payees, "addr_seller", Balance::LOVELACE),
            Some(10_000_000)
        );
        assert_eq!(amount_for(&payees, "addr_seller", &pay_unit), Some(2));
        conservation_holds(&payees, &mint_req, &map, fee);
    }

    #[test]
    fn dev_fee_comes_out_of_seller_proceeds() {
        let mint_req = payment(20_000_000);
        let mut map = single_mint_map("WildTangz 1");
        map.get_mut(TANGZ_POLICY)
            .unwrap()
            .push("WildTangz 2".to_string());
        let fee = 200_000;
        let payees = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            Some("addr_dev"),
            1_000_000,
            &lovelace_price(10_000_000),
            2,
            &map,
            &mint_req,
            fee,
        )
        .unwrap();

        let rebate = calculate_rebate(1, 2, 2 * "WildTangz 1".len() as u64);
        assert_eq!(
            amount_for(&payees, "addr_dev", Balance::LOVELACE),
            Some(2_000_000)
        );
        assert_eq!(
            amount_for(&payees, "addr_seller", Balance::LOVELACE),
            Some(20_000_000 - rebate - fee - 2_000_000)
        );
        conservation_holds(&payees, &mint_req, &map, fee);
    }

    #[test]
    fn unmatchable_payment_is_an_error() {
        let mint_req = payment(10_000_000);
        let map = single_mint_map("WildTangz 1");
        let err = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &lovelace_price(10_000_000),
            2,
            &map,
            &mint_req,
            0,
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("Unable to match UTxO to payment for 2 NFTs"));
    }

    #[test]
    fn utxo_without_lovelace_is_bad() {
        let mint_req = Utxo::new("aabb00", 0, vec![Balance::new(4, "aabbccdd")]);
        let err = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &lovelace_price(10_000_000),
            0,
            &BTreeMap::new(),
            &mint_req,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, VendError::BadUtxo { .. }));
    }

    #[test]
    fn zero_mint_refund_keeps_buyer_whole_minus_fee() {
        let mint_req = payment(3_000_000);
        let fee = 170_000;
        let payees = pricing_breakdown(
            "addr_buyer",
            "addr_seller",
            None,
            0,
            &lovelace_price(10_000_000),
            0,
            &BTreeMap::new(),
            &mint_req,
            fee,
        )
        .unwrap();
        assert_eq!(payees.len(), 1);
        assert_eq!(
            amount_for(&payees, "addr_buyer", Balance::LOVELACE),
            Some(3_000_000 - fee)
        );
    }

    #[test]
    fn lock_and_merge_moves_sources_and_combines() {
        let nfts = tempdir().unwrap();
        let output = tempdir().unwrap();
        std::fs::create_dir_all(output.path().join(LOCKED_SUBDIR)).unwrap();
        std::fs::create_dir_all(output.path().join(METADATA_SUBDIR)).unwrap();
        for i in 1..=3 {
            std::fs::write(
                nfts.path().join(format!("Tang {i}.json")),
                serde_json::json!({
                    "721": { TANGZ_POLICY: { format!("Tang {i}"): {"name": format!("Tang {i}")} } }
                })
                .to_string(),
            )
            .unwrap();
        }
        let mut pool = inventory_filenames(nfts.path()).unwrap();

        let combined = lock_and_merge(nfts.path(), &mut pool, 2, output.path(), 42).unwrap();
        let map = policy_name_map(&combined).unwrap();
        assert_eq!(map[TANGZ_POLICY], vec!["Tang 1", "Tang 2"]);
        assert!(output.path().join(LOCKED_SUBDIR).join("Tang 1.json").exists());
        assert!(nfts.path().join("Tang 3.json").exists());
        assert_eq!(pool, vec!["Tang 3.json"]);
    }

    #[test]
    fn requested_count_honors_free_and_priced_units() {
        let prices = vec![Price::new(5_000_000, Balance::LOVELACE)];
        assert_eq!(num_mints_requested(&prices, 10, &payment(12_000_000)), 2);

        let free = vec![Price::new(0, Balance::LOVELACE)];
        assert_eq!(num_mints_requested(&free, 10, &payment(2_000_000)), 10);

        let unpriced = Utxo::new("cc", 0, vec![Balance::new(7, "aabbcc")]);
        assert_eq!(num_mints_requested(&prices, 10, &unpriced), 0);
    }

    #[test]
    fn tx_out_args_skip_empty_payees() {
        let payees = vec![
            (
                "addr_buyer".to_string(),
                BTreeMap::from([("lovelace".to_string(), 5_000_000u64)]),
            ),
            ("addr_dev".to_string(), BTreeMap::new()),
        ];
        assert_eq!(tx_out_args(&payees), vec!["addr_buyer+5000000 lovelace"]);
    }

    #[test]
    fn max_rebate_is_bounded_by_inventory() {
        let names = std::collections::BTreeSet::from([
            format!("{TANGZ_POLICY}.WildTangz 1"),
            format!("{TANGZ_POLICY}.WildTangz 22"),
        ]);
        // Two NFTs in stock: a ceiling of 10 can still only vend 2.
        assert_eq!(max_rebate_for(&names, 10), calculate_rebate(1, 2, 24));
        assert_eq!(max_rebate_for(&names, 1), calculate_rebate(1, 1, 12));
        assert_eq!(max_rebate_for(&std::collections::BTreeSet::new(), 10), calculate_rebate(0, 0, 0));
    }

    #[test]
    fn max_rebate_handles_unlimited_vend_ceiling() {
        let names = std::collections::BTreeSet::from([format!("{TANGZ_POLICY}.WildTangz 1")]);
        assert_eq!(max_rebate_for(&names, u64::MAX), calculate_rebate(1, 1, 11));
    }

    #[test]
    fn requested_count_saturates_on_unlimited_ceiling() {
        let free = vec![Price::new(0, Balance::LOVELACE)];
        assert_eq!(
            num_mints_requested(&free, u64::MAX, &payment(2_000_000)),
            u64::MAX
        );
    }
}
