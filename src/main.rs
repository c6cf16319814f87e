//! Cardano NFT Vending Machine CLI
//!
//! Parses the launcher configuration, validates the whole machine against
//! the chain, then runs the poll loop until interrupted.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cardano_nft_vending_machine::blockfrost::{BlockfrostApi, ChainIndexer};
use cardano_nft_vending_machine::cardano_cli::CardanoCli;
use cardano_nft_vending_machine::config::{validate_whitelist_dir, VendingConfig, WhitelistMode};
use cardano_nft_vending_machine::mint::Mint;
use cardano_nft_vending_machine::vend::NftVendingMachine;

/// Sleep between poll cycles.
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Blockfrost reports protocol parameters under different key names than the
/// `cardano-cli` protocol-parameters file expects.
const PROTOCOL_TRANSLATOR: &[(&str, &str)] = &[
    ("decentralization", "decentralisation_param"),
    ("extraPraosEntropy", "extra_entropy"),
    ("maxBlockBodySize", "max_block_size"),
    ("maxBlockHeaderSize", "max_block_header_size"),
    ("minPoolCost", "min_pool_cost"),
    ("maxTxSize", "max_tx_size"),
    ("minUTxOValue", "min_utxo"),
    ("monetaryExpansion", "rho"),
    ("poolPledgeInfluence", "a0"),
    ("poolRetireMaxEpoch", "e_max"),
    ("stakeAddressDeposit", "key_deposit"),
    ("stakePoolDeposit", "pool_deposit"),
    ("stakePoolTargetNum", "n_opt"),
    ("treasuryCut", "tau"),
    ("txFeeFixed", "min_fee_b"),
    ("txFeePerByte", "min_fee_a"),
];

const PROTOCOL_VERSION_TRANSLATOR: &[(&str, &str)] = &[
    ("minor", "protocol_minor_ver"),
    ("major", "protocol_major_ver"),
];

#[tokio::main]
async fn main() -> Result<()> {
    let config = VendingConfig::parse();
    init_logging(&config.log_level)?;
    config.validate()?;
    config.ensure_output_dirs()?;
    if let Some(whitelist_dir) = &config.whitelist_dir {
        if config.whitelist != WhitelistMode::None {
            validate_whitelist_dir(whitelist_dir)?;
        }
    }

    let indexer = Arc::new(BlockfrostApi::new(&config.blockfrost_project, config.mainnet)?);

    let blockfrost_protocol = indexer.get_protocol_parameters().await?;
    let protocol_file = config.protocol_params_file();
    write_protocol_params(&blockfrost_protocol, &protocol_file)?;
    let max_txn_fee = max_txn_fee(&blockfrost_protocol)?;
    tracing::info!("Max txn fee is a * size(tx) + b: {max_txn_fee}");

    let wallet_cli = Arc::new(CardanoCli::new(config.mainnet, &protocol_file));

    let mint = Mint::new(
        config.prices()?,
        config.dev_fee,
        config.dev_addr.clone(),
        &config.metadata_dir,
        config.mint_scripts.clone(),
        config.mint_sign_keys.clone(),
        config.build_whitelist()?,
        config.bogo(),
    );
    let mut vending_machine = NftVendingMachine::new(
        &config.payment_addr,
        &config.payment_sign_key,
        &config.profit_addr,
        config.vend_randomly,
        config.single_vend_max(),
        mint,
        indexer,
        wallet_cli,
    );
    vending_machine.validate().await?;
    if config.validate_only {
        tracing::info!("Configuration is valid, exiting (--validate-only)");
        return Ok(());
    }

    // Finish the current candidate, then stop: the flag is only checked at
    // iteration boundaries.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current cycle before shutdown");
            shutdown_flag.store(true, Ordering::SeqCst);
        }
    });

    tracing::info!("Starting vending machine at {}", config.payment_addr);
    let mut exclusions = HashSet::new();
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = vending_machine.vend(&config.output_dir, &mut exclusions).await {
            tracing::error!("Vend cycle failed: {e:#}");
        }
        tokio::time::sleep(WAIT_TIMEOUT).await;
    }
    tracing::info!("Vending machine stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Rewrite Blockfrost protocol parameters into the key shape `cardano-cli`
/// expects and persist them next to the transaction artifacts.
fn write_protocol_params(blockfrost_protocol: &Value, protocol_file: &Path) -> Result<()> {
    let mut translated = translate_protocol(blockfrost_protocol, PROTOCOL_TRANSLATOR)?;
    translated.insert(
        "protocolVersion".to_string(),
        Value::Object(translate_protocol(
            blockfrost_protocol,
            PROTOCOL_VERSION_TRANSLATOR,
        )?),
    );
    std::fs::write(protocol_file, serde_json::to_string(&Value::Object(translated))?)
        .with_context(|| format!("Could not write {}", protocol_file.display()))?;
    Ok(())
}

fn translate_protocol(
    blockfrost_protocol: &Value,
    translator: &[(&str, &str)],
) -> Result<serde_json::Map<String, Value>> {
    let mut translated = serde_json::Map::new();
    for (cli_key, blockfrost_key) in translator {
        let input_val = blockfrost_protocol
            .get(blockfrost_key)
            .ok_or_else(|| anyhow!("Protocol parameters missing '{blockfrost_key}'"))?;
        translated.insert(cli_key.to_string(), coerce_numeric(input_val));
    }
    Ok(translated)
}

/// Blockfrost reports several numeric parameters as decimal strings.
fn coerce_numeric(value: &Value) -> Value {
    if let Some(s) = value.as_str() {
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = s.parse::<u64>() {
                return Value::from(n);
            }
        }
    }
    value.clone()
}

fn max_txn_fee(blockfrost_protocol: &Value) -> Result<u64> {
    let field = |key: &str| -> Result<u64> {
        let value = blockfrost_protocol
            .get(key)
            .ok_or_else(|| anyhow!("Protocol parameters missing '{key}'"))?;
        match coerce_numeric(value) {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| anyhow!("Protocol parameter '{key}' is not a u64")),
            other => Err(anyhow!("Protocol parameter '{key}' has unexpected shape: {other}")),
        }
    };
    Ok(field("min_fee_a")? * field("max_tx_size")? + field("min_fee_b")?)
}
