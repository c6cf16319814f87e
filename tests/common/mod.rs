//! Shared fixtures and mock collaborators for the end-to-end vend tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use cardano_nft_vending_machine::blockfrost::{
    ChainIndexer, TxnIo, TxnMetadataLabel, TxnUtxos,
};
use cardano_nft_vending_machine::cardano_cli::{WalletCli, TXN_DIR};
use cardano_nft_vending_machine::utxo::Utxo;
use cardano_nft_vending_machine::vend::{LOCKED_SUBDIR, METADATA_SUBDIR};

pub const TANGZ_POLICY: &str = "33568ad11f93b3e79ae8dee5ad928ded72adcea719e92108caf1521b";
pub const PAYMENT_ADDR: &str = "addr_test1vplgrtqgphv0hpx2v6zyzwxxmyh0q4vjrzeuv7qvtk3ev2cmmgd54";
pub const PROFIT_ADDR: &str = "addr_test1profit";
pub const BUYER_ADDR: &str = "addr_test1buyer";

/// In-memory [`ChainIndexer`] serving canned chain data.
#[derive(Default)]
pub struct MockIndexer {
    pub utxos: Mutex<Vec<Utxo>>,
    pub txn_utxos: Mutex<HashMap<String, TxnUtxos>>,
    pub metadata: Mutex<HashMap<String, Vec<TxnMetadataLabel>>>,
    pub submitted: Mutex<Vec<PathBuf>>,
}

impl MockIndexer {
    pub fn with_payment(utxo: Utxo, funding_addr: &str) -> Self {
        let indexer = Self::default();
        indexer.txn_utxos.lock().unwrap().insert(
            utxo.hash.clone(),
            TxnUtxos {
                inputs: vec![TxnIo {
                    address: funding_addr.to_string(),
                    ..Default::default()
                }],
                outputs: Vec::new(),
            },
        );
        indexer.utxos.lock().unwrap().push(utxo);
        indexer
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainIndexer for MockIndexer {
    async fn get_utxos(&self, _address: &str, exclusions: &HashSet<Utxo>) -> Result<Vec<Utxo>> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .iter()
            .filter(|utxo| !exclusions.contains(utxo))
            .cloned()
            .collect())
    }

    async fn get_txn_utxos(&self, txn_hash: &str) -> Result<TxnUtxos> {
        Ok(self
            .txn_utxos
            .lock()
            .unwrap()
            .get(txn_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_txn_metadata(&self, txn_hash: &str) -> Result<Vec<TxnMetadataLabel>> {
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(txn_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_protocol_parameters(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn submit_txn(&self, signed_file: &Path) -> Result<String> {
        self.submitted.lock().unwrap().push(signed_file.to_path_buf());
        Ok("txn_hash_submitted".to_string())
    }
}

/// One recorded `build_raw_mint_txn` invocation.
#[derive(Debug, Clone)]
pub struct BuildCall {
    pub fee: u64,
    pub tx_outs: Vec<String>,
    pub minted_units: usize,
}

/// [`WalletCli`] double that never spawns a process.
pub struct MockWalletCli {
    pub payment_addr: String,
    pub fee: u64,
    pub policy: String,
    pub builds: Mutex<Vec<BuildCall>>,
}

impl MockWalletCli {
    pub fn new(fee: u64) -> Self {
        Self {
            payment_addr: PAYMENT_ADDR.to_string(),
            fee,
            policy: TANGZ_POLICY.to_string(),
            builds: Mutex::new(Vec::new()),
        }
    }

    /// The fee-adjusted (second-pass) build.
    pub fn final_build(&self) -> BuildCall {
        self.builds.lock().unwrap().last().cloned().expect("no builds recorded")
    }
}

#[async_trait]
impl WalletCli for MockWalletCli {
    async fn build_raw_mint_txn(
        &self,
        output_dir: &Path,
        txn_id: i64,
        _tx_ins: &[String],
        tx_outs: &[String],
        fee: u64,
        _metadata_file: &Path,
        _validity: (Option<u64>, Option<u64>),
        policy_name_map: &BTreeMap<String, Vec<String>>,
        _script_map: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf> {
        self.builds.lock().unwrap().push(BuildCall {
            fee,
            tx_outs: tx_outs.to_vec(),
            minted_units: policy_name_map.values().map(Vec::len).sum(),
        });
        let build_file = output_dir.join(TXN_DIR).join(format!("txn_{txn_id}.raw.build"));
        std::fs::write(&build_file, "{}")?;
        Ok(build_file)
    }

    async fn calculate_min_fee(
        &self,
        _raw_build_file: &Path,
        _tx_in_count: usize,
        _tx_out_count: usize,
        _witness_count: usize,
    ) -> Result<u64> {
        Ok(self.fee)
    }

    async fn sign_txn(&self, _signing_files: &[PathBuf], build_file: &Path) -> Result<PathBuf> {
        let signed_file = PathBuf::from(format!("{}.signed", build_file.display()));
        std::fs::write(&signed_file, serde_json::json!({"cborHex": "00"}).to_string())?;
        Ok(signed_file)
    }

    async fn build_addr(&self, _sign_key: &Path) -> Result<String> {
        Ok(self.payment_addr.clone())
    }

    async fn policy_id(&self, _script: &Path) -> Result<String> {
        Ok(self.policy.clone())
    }
}

/// Filesystem layout for one vend run: inventory, keys, scripts, output.
pub struct VendFixture {
    pub root: TempDir,
}

impl VendFixture {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        for subdir in ["nfts", "keys", "scripts", "out"] {
            std::fs::create_dir_all(root.path().join(subdir)).unwrap();
        }
        for subdir in [LOCKED_SUBDIR, METADATA_SUBDIR, TXN_DIR] {
            std::fs::create_dir_all(root.path().join("out").join(subdir)).unwrap();
        }
        let fixture = Self { root };
        std::fs::write(fixture.payment_sign_key(), "{}").unwrap();
        std::fs::write(fixture.mint_sign_key(), "{}").unwrap();
        std::fs::write(
            fixture.script_file(),
            serde_json::json!({
                "type": "all",
                "scripts": [{"type": "sig", "keyHash": "deadbeef"}]
            })
            .to_string(),
        )
        .unwrap();
        fixture
    }

    pub fn nfts_dir(&self) -> PathBuf {
        self.root.path().join("nfts")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.path().join("out")
    }

    pub fn payment_sign_key(&self) -> PathBuf {
        self.root.path().join("keys").join("payment.skey")
    }

    pub fn mint_sign_key(&self) -> PathBuf {
        self.root.path().join("keys").join("policy.skey")
    }

    pub fn script_file(&self) -> PathBuf {
        self.root.path().join("scripts").join("policy.script")
    }

    /// Write one single-asset CIP-25 inventory file.
    pub fn stock_asset(&self, asset_name: &str) {
        std::fs::write(
            self.nfts_dir().join(format!("{asset_name}.json")),
            serde_json::json!({
                "721": { TANGZ_POLICY: { asset_name: { "name": asset_name } } }
            })
            .to_string(),
        )
        .unwrap();
    }

    pub fn locked_count(&self) -> usize {
        std::fs::read_dir(self.output_dir().join(LOCKED_SUBDIR))
            .unwrap()
            .count()
    }

    pub fn inventory_count(&self) -> usize {
        std::fs::read_dir(self.nfts_dir()).unwrap().count()
    }
}

/// The tx-out entry paying `addr`, split into its unit amounts.
pub fn output_for(build: &BuildCall, addr: &str) -> Option<Vec<String>> {
    build
        .tx_outs
        .iter()
        .find(|out| out.starts_with(&format!("{addr}+")))
        .map(|out| {
            out[addr.len() + 1..]
                .split('+')
                .map(str::to_string)
                .collect()
        })
}
