//! Chain indexer client (Blockfrost REST API).
//!
//! The engine only sees the [`ChainIndexer`] trait; [`BlockfrostApi`] is the
//! production implementation. All calls go through a token-bucket rate
//! limiter and a bounded linear-backoff retry loop, and a well-formed
//! "not found" comes back as an empty result rather than an error.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utxo::{Balance, Utxo};

/// Requests allowed per second against the indexer.
const REQUESTS_PER_SEC: f64 = 10.0;

/// Burst capacity of the rate limiter.
const BURST_CAPACITY: f64 = 10.0;

/// Attempts per call before a transient failure surfaces to the engine.
const MAX_ATTEMPTS: u32 = 3;

/// Base of the linear backoff between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Page size used when listing address UTXOs.
const PAGE_SIZE: usize = 100;

/// One side of a transaction's input/output set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnIo {
    /// Bech32 address funding or receiving this entry.
    pub address: String,

    /// Unit/quantity pairs carried by this entry.
    #[serde(default)]
    pub amount: Vec<TxnAmount>,

    /// Reference inputs do not fund the transaction.
    #[serde(default)]
    pub reference: bool,

    /// Collateral inputs do not fund the transaction either.
    #[serde(default)]
    pub collateral: bool,
}

/// A unit/quantity pair inside a transaction input or output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnAmount {
    pub unit: String,
    /// Quantity as reported by the indexer (decimal string).
    pub quantity: String,
}

impl TxnAmount {
    pub fn new(unit: &str, quantity: u64) -> Self {
        Self {
            unit: unit.to_string(),
            quantity: quantity.to_string(),
        }
    }

    pub fn quantity(&self) -> Result<u64> {
        self.quantity
            .parse()
            .with_context(|| format!("Bad quantity '{}' for unit {}", self.quantity, self.unit))
    }
}

/// Inputs and outputs of a transaction, as reported by the indexer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnUtxos {
    pub inputs: Vec<TxnIo>,
    pub outputs: Vec<TxnIo>,
}

/// One labeled metadata entry attached to a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnMetadataLabel {
    pub label: String,
    pub json_metadata: serde_json::Value,
}

/// The chain-indexer capability the vending engine relies on.
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    /// List UTXOs at an address, dropping anything in the exclusion set.
    async fn get_utxos(&self, address: &str, exclusions: &HashSet<Utxo>) -> Result<Vec<Utxo>>;

    /// Inputs and outputs of the transaction with the given hash.
    async fn get_txn_utxos(&self, txn_hash: &str) -> Result<TxnUtxos>;

    /// Metadata labels attached to the transaction (empty if none).
    async fn get_txn_metadata(&self, txn_hash: &str) -> Result<Vec<TxnMetadataLabel>>;

    /// Current protocol parameters, in the indexer's key shape.
    async fn get_protocol_parameters(&self) -> Result<serde_json::Value>;

    /// Submit the signed transaction file's CBOR body; returns the tx hash.
    async fn submit_txn(&self, signed_file: &Path) -> Result<String>;
}

/// Token bucket limiting the request rate against the indexer.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Blockfrost-backed [`ChainIndexer`].
pub struct BlockfrostApi {
    project: String,
    base_url: String,
    client: reqwest::Client,
    limiter: Mutex<TokenBucket>,
}

impl BlockfrostApi {
    pub fn new(project: &str, mainnet: bool) -> Result<Self> {
        let network = if mainnet { "mainnet" } else { "preprod" };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            project: project.to_string(),
            base_url: format!("https://cardano-{network}.blockfrost.io/api/v0"),
            client,
            limiter: Mutex::new(TokenBucket::new(BURST_CAPACITY, REQUESTS_PER_SEC)),
        })
    }

    async fn acquire_slot(&self) {
        loop {
            let granted = self
                .limiter
                .lock()
                .expect("rate limiter lock poisoned")
                .try_consume();
            if granted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// GET a resource, returning `None` on a well-formed 404.
    async fn get_json(&self, resource: &str) -> Result<Option<serde_json::Value>> {
        let url = format!("{}/{}", self.base_url, resource);
        let mut last_error = anyhow!("No attempts made for {resource}");

        for attempt in 1..=MAX_ATTEMPTS {
            self.acquire_slot().await;
            let response = self
                .client
                .get(&url)
                .header("project_id", &self.project)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!("Indexer GET {} ({})", resource, status);
                    if status.is_success() {
                        return Ok(Some(response.json().await?));
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    last_error = anyhow!("Indexer returned {} for {}", status, resource);
                    if !(status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS)
                    {
                        return Err(last_error);
                    }
                }
                Err(e) => {
                    last_error = anyhow!("Indexer request for {} failed: {}", resource, e);
                }
            }

            if attempt < MAX_ATTEMPTS {
                tracing::warn!(
                    "Retrying {} (attempt {}/{}): {}",
                    resource,
                    attempt,
                    MAX_ATTEMPTS,
                    last_error
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Err(last_error)
    }

    async fn post_cbor(&self, resource: &str, body: Vec<u8>) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, resource);
        self.acquire_slot().await;
        let response = self
            .client
            .post(&url)
            .header("project_id", &self.project)
            .header("Content-Type", "application/cbor")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Indexer POST {resource} failed"))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        tracing::info!("Indexer POST {} ({}): {}", resource, status, text);
        if !status.is_success() {
            return Err(anyhow!("Indexer POST {} returned {}: {}", resource, status, text));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ChainIndexer for BlockfrostApi {
    async fn get_utxos(&self, address: &str, exclusions: &HashSet<Utxo>) -> Result<Vec<Utxo>> {
        #[derive(Deserialize)]
        struct RawUtxo {
            tx_hash: String,
            output_index: u32,
            amount: Vec<TxnAmount>,
        }

        let mut available = Vec::new();
        for page in 1.. {
            let resource = format!("addresses/{address}/utxos?page={page}&count={PAGE_SIZE}");
            let Some(body) = self.get_json(&resource).await? else {
                break;
            };
            let raw_utxos: Vec<RawUtxo> = serde_json::from_value(body)?;
            let page_len = raw_utxos.len();

            for raw in raw_utxos {
                let balances = raw
                    .amount
                    .iter()
                    .map(|amount| Ok(Balance::new(amount.quantity()?, &amount.unit)))
                    .collect::<Result<Vec<_>>>()?;
                let utxo = Utxo::new(&raw.tx_hash, raw.output_index, balances);
                if exclusions.contains(&utxo) {
                    tracing::debug!("Skipping excluded {}#{}", utxo.hash, utxo.index);
                    continue;
                }
                available.push(utxo);
            }

            if page_len < PAGE_SIZE {
                break;
            }
        }
        Ok(available)
    }

    async fn get_txn_utxos(&self, txn_hash: &str) -> Result<TxnUtxos> {
        let body = self
            .get_json(&format!("txs/{txn_hash}/utxos"))
            .await?
            .ok_or_else(|| anyhow!("No UTXO data found for txn {txn_hash}"))?;
        Ok(serde_json::from_value(body)?)
    }

    async fn get_txn_metadata(&self, txn_hash: &str) -> Result<Vec<TxnMetadataLabel>> {
        match self.get_json(&format!("txs/{txn_hash}/metadata")).await? {
            Some(body) => Ok(serde_json::from_value(body)?),
            None => Ok(Vec::new()),
        }
    }

    async fn get_protocol_parameters(&self) -> Result<serde_json::Value> {
        self.get_json("epochs/latest/parameters")
            .await?
            .ok_or_else(|| anyhow!("Protocol parameters not available"))
    }

    async fn submit_txn(&self, signed_file: &Path) -> Result<String> {
        let contents = std::fs::read_to_string(signed_file)
            .with_context(|| format!("Could not read signed txn {}", signed_file.display()))?;
        let envelope: serde_json::Value = serde_json::from_str(&contents)?;
        let cbor_hex = envelope
            .get("cborHex")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Signed txn {} has no cborHex", signed_file.display()))?;
        let body = hex::decode(cbor_hex)?;
        let result = self.post_cbor("tx/submit", body).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }
}
