//! Wrapper around the external `cardano-cli` binary.
//!
//! All chain-level construction (transaction bodies, fees, signing, address
//! and policy-id derivation) is delegated to the CLI. The [`WalletCli`] trait
//! is the seam the vending engine talks to, so tests can substitute a mock
//! that never spawns a process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Subdirectory of the output dir holding transaction build artifacts.
pub const TXN_DIR: &str = "txn";

const CLI_BINARY: &str = "cardano-cli";
const MAINNET_ARGS: &[&str] = &["--mainnet"];
const TESTNET_ARGS: &[&str] = &["--testnet-magic", "1097911063"];

/// External wallet CLI capability used by the vending engine.
#[async_trait]
pub trait WalletCli: Send + Sync {
    /// Build a raw transaction body with an explicit fee, minting the assets
    /// in `policy_name_map` under their scripts. Returns the body file path.
    #[allow(clippy::too_many_arguments)]
    async fn build_raw_mint_txn(
        &self,
        output_dir: &Path,
        txn_id: i64,
        tx_ins: &[String],
        tx_outs: &[String],
        fee: u64,
        metadata_file: &Path,
        validity: (Option<u64>, Option<u64>),
        policy_name_map: &BTreeMap<String, Vec<String>>,
        script_map: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf>;

    /// Authoritative minimum fee for a drafted body.
    async fn calculate_min_fee(
        &self,
        raw_build_file: &Path,
        tx_in_count: usize,
        tx_out_count: usize,
        witness_count: usize,
    ) -> Result<u64>;

    /// Sign a body with one or more key files; returns the signed file path.
    async fn sign_txn(&self, signing_files: &[PathBuf], build_file: &Path) -> Result<PathBuf>;

    /// Derive the payment address controlled by a signing key.
    async fn build_addr(&self, sign_key: &Path) -> Result<String>;

    /// Derive the policy id of a native script file.
    async fn policy_id(&self, script: &Path) -> Result<String>;
}

/// Shells out to `cardano-cli` via `tokio::process`.
#[derive(Debug)]
pub struct CardanoCli {
    mainnet: bool,
    protocol_params: PathBuf,
}

impl CardanoCli {
    pub fn new(mainnet: bool, protocol_params: &Path) -> Self {
        Self {
            mainnet,
            protocol_params: protocol_params.to_path_buf(),
        }
    }

    fn network_args(&self) -> &'static [&'static str] {
        if self.mainnet {
            MAINNET_ARGS
        } else {
            TESTNET_ARGS
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        tracing::info!("{CLI_BINARY} {}", args.join(" "));
        let output = Command::new(CLI_BINARY)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {CLI_BINARY}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        tracing::info!("[STDOUT] {stdout}");
        tracing::info!("[STDERR] {stderr}");
        if !output.status.success() {
            bail!("{CLI_BINARY} exited with {}: {stderr}", output.status);
        }
        Ok(stdout)
    }
}

/// `--mint` argument body: `1 <policy>.<hexname>` per asset, `+`-joined.
fn mint_field(policy_name_map: &BTreeMap<String, Vec<String>>) -> String {
    policy_name_map
        .iter()
        .flat_map(|(policy, names)| {
            names
                .iter()
                .map(move |name| format!("1 {policy}.{}", hex::encode(name.as_bytes())))
        })
        .collect::<Vec<_>>()
        .join("+")
}

fn parse_fee(cli_output: &str) -> Result<u64> {
    cli_output
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("Empty fee output from {CLI_BINARY}"))?
        .parse()
        .with_context(|| format!("Unparseable fee output '{}'", cli_output.trim()))
}

#[async_trait]
impl WalletCli for CardanoCli {
    async fn build_raw_mint_txn(
        &self,
        output_dir: &Path,
        txn_id: i64,
        tx_ins: &[String],
        tx_outs: &[String],
        fee: u64,
        metadata_file: &Path,
        validity: (Option<u64>, Option<u64>),
        policy_name_map: &BTreeMap<String, Vec<String>>,
        script_map: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf> {
        let raw_build_file = output_dir.join(TXN_DIR).join(format!("txn_{txn_id}.raw.build"));
        let mut args = vec![
            "transaction".to_string(),
            "build-raw".to_string(),
            "--fee".to_string(),
            fee.to_string(),
        ];
        for tx_in in tx_ins {
            args.push("--tx-in".to_string());
            args.push(tx_in.clone());
        }
        for tx_out in tx_outs {
            args.push("--tx-out".to_string());
            args.push(tx_out.clone());
        }
        args.push("--metadata-json-file".to_string());
        args.push(metadata_file.display().to_string());
        if !policy_name_map.is_empty() {
            args.push("--mint".to_string());
            args.push(mint_field(policy_name_map));
            for policy in policy_name_map.keys() {
                let script = script_map
                    .get(policy)
                    .ok_or_else(|| anyhow!("No script file resolved for policy {policy}"))?;
                args.push("--minting-script-file".to_string());
                args.push(script.display().to_string());
            }
        }
        if let Some(initial_slot) = validity.0 {
            args.push("--invalid-before".to_string());
            args.push(initial_slot.to_string());
        }
        if let Some(expiration_slot) = validity.1 {
            args.push("--invalid-hereafter".to_string());
            args.push(expiration_slot.to_string());
        }
        args.push("--out-file".to_string());
        args.push(raw_build_file.display().to_string());
        self.run(&args).await?;
        Ok(raw_build_file)
    }

    async fn calculate_min_fee(
        &self,
        raw_build_file: &Path,
        tx_in_count: usize,
        tx_out_count: usize,
        witness_count: usize,
    ) -> Result<u64> {
        let args = vec![
            "transaction".to_string(),
            "calculate-min-fee".to_string(),
            "--tx-body-file".to_string(),
            raw_build_file.display().to_string(),
            "--tx-in-count".to_string(),
            tx_in_count.to_string(),
            "--tx-out-count".to_string(),
            tx_out_count.to_string(),
            "--witness-count".to_string(),
            witness_count.to_string(),
            "--protocol-params-file".to_string(),
            self.protocol_params.display().to_string(),
        ];
        parse_fee(&self.run(&args).await?)
    }

    async fn sign_txn(&self, signing_files: &[PathBuf], build_file: &Path) -> Result<PathBuf> {
        let signed_file = PathBuf::from(format!("{}.signed", build_file.display()));
        let mut args = vec!["transaction".to_string(), "sign".to_string()];
        for signing_file in signing_files {
            args.push("--signing-key-file".to_string());
            args.push(signing_file.display().to_string());
        }
        args.push("--tx-body-file".to_string());
        args.push(build_file.display().to_string());
        args.push("--out-file".to_string());
        args.push(signed_file.display().to_string());
        self.run(&args).await?;
        Ok(signed_file)
    }

    async fn build_addr(&self, sign_key: &Path) -> Result<String> {
        let vkey_file = tempfile::NamedTempFile::new()?;
        let args = vec![
            "key".to_string(),
            "verification-key".to_string(),
            "--signing-key-file".to_string(),
            sign_key.display().to_string(),
            "--verification-key-file".to_string(),
            vkey_file.path().display().to_string(),
        ];
        self.run(&args).await?;

        let mut args = vec![
            "address".to_string(),
            "build".to_string(),
            "--payment-verification-key-file".to_string(),
            vkey_file.path().display().to_string(),
        ];
        args.extend(self.network_args().iter().map(|arg| arg.to_string()));
        Ok(self.run(&args).await?.trim().to_string())
    }

    async fn policy_id(&self, script: &Path) -> Result<String> {
        let args = vec![
            "transaction".to_string(),
            "policyid".to_string(),
            "--script-file".to_string(),
            script.display().to_string(),
        ];
        Ok(self.run(&args).await?.trim().to_string())
    }
}
