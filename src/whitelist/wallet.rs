//! Wallet whitelist proven by a CIP-8 signed message.
//!
//! The buyer attaches a `whitelist_proof` payload under transaction metadata
//! label 674: a stringified JSON object holding a hex COSE_Sign1 signature
//! and the hex COSE key that produced it. The signed message body is the
//! comma-separated list of addresses the signer intends to pay from.
//!
//! Verification fails *closed*: any malformed, missing, duplicated or
//! non-conforming proof yields zero capacity. A proof that verifies but
//! claims addresses other than the ones actually funding the transaction is
//! also rejected, so a whitelisted key cannot co-sign on behalf of an
//! unauthorized payer.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_cbor::Value as CborValue;

use crate::blockfrost::{ChainIndexer, TxnMetadataLabel, TxnUtxos};
use crate::utxo::Utxo;

use super::{SlotStore, Whitelist, WhitelistResources};

/// Transaction metadata label carrying the signed message (CIP-20 "message").
const MSG_LABEL: &str = "674";

/// Key inside the label 674 object that holds the proof chunks.
const SIGNATURE_KEY: &str = "whitelist_proof";

/// Byte length of a key hash embedded in an address.
const KEY_HASH_LEN: usize = 28;

/// A decoded `whitelist_proof` payload.
struct SignedProof {
    /// COSE_Sign1 structure, CBOR-encoded.
    signature: Vec<u8>,
    /// COSE_Key structure, CBOR-encoded.
    key: Vec<u8>,
}

/// Outcome of verifying a proof.
struct Verification {
    /// Hex-encoded raw bytes of the signer's address; doubles as the slot
    /// store identifier.
    signing_address: String,
    /// The signed message body: comma-separated claimed addresses.
    message: String,
}

/// N mints per whitelisted wallet, keyed by the signer's address bytes.
#[derive(Debug)]
pub struct WalletWhitelist {
    store: SlotStore,
}

impl WalletWhitelist {
    pub fn new(input_dir: &Path, consumed_dir: &Path) -> Self {
        Self {
            store: SlotStore::new(input_dir, consumed_dir),
        }
    }

    /// Extract the single expected proof from the transaction metadata.
    /// Returns `None` (with a log line) on any deviation.
    fn signed_proof(&self, metadata: &[TxnMetadataLabel]) -> Option<SignedProof> {
        let messages: Vec<_> = metadata
            .iter()
            .filter(|entry| entry.label == MSG_LABEL)
            .collect();
        if messages.len() != 1 {
            tracing::warn!(
                "Wallet whitelist requires exactly 1 MSG (674) label metadata, found {}",
                messages.len()
            );
            return None;
        }
        let Some(chunks) = messages[0].json_metadata.get(SIGNATURE_KEY) else {
            tracing::warn!(
                "Expected to find '{}' in message metadata, found {}",
                SIGNATURE_KEY,
                messages[0].json_metadata
            );
            return None;
        };
        let Some(chunk_list) = chunks.as_array() else {
            tracing::warn!("Encountered unexpected proof type: {chunks}");
            return None;
        };
        let mut joined = String::new();
        for chunk in chunk_list {
            match chunk.as_str() {
                Some(chunk) => joined.push_str(chunk),
                None => {
                    tracing::warn!("Non-string proof chunk in {chunks}");
                    return None;
                }
            }
        }
        match parse_proof_json(&joined) {
            Ok(proof) => Some(proof),
            Err(e) => {
                tracing::warn!("Could not parse stringified JSON '{joined}': {e}");
                None
            }
        }
    }
}

fn parse_proof_json(joined: &str) -> Result<SignedProof> {
    let parsed: serde_json::Value = serde_json::from_str(joined)?;
    let signature = parsed
        .get("signature")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Proof has no 'signature' field"))?;
    let key = parsed
        .get("key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Proof has no 'key' field"))?;
    Ok(SignedProof {
        signature: hex::decode(signature)?,
        key: hex::decode(key)?,
    })
}

fn cbor_map_get<'a>(map: &'a CborValue, key: &CborValue) -> Option<&'a CborValue> {
    match map {
        CborValue::Map(entries) => entries.get(key),
        _ => None,
    }
}

fn untag(value: CborValue) -> CborValue {
    match value {
        CborValue::Tag(_, inner) => *inner,
        other => other,
    }
}

/// Blake2b-224 of a verification key, the hash embedded in addresses.
fn key_hash(key_bytes: &[u8]) -> Result<[u8; KEY_HASH_LEN]> {
    let mut hasher = Blake2bVar::new(KEY_HASH_LEN).map_err(|e| anyhow!("{e}"))?;
    hasher.update(key_bytes);
    let mut out = [0u8; KEY_HASH_LEN];
    hasher
        .finalize_variable(&mut out)
        .map_err(|e| anyhow!("{e}"))?;
    Ok(out)
}

/// Whether the address embeds the given key hash as its payment or stake
/// credential.
fn address_contains_hash(address: &[u8], hash: &[u8; KEY_HASH_LEN]) -> bool {
    let payment = address.get(1..1 + KEY_HASH_LEN);
    let stake = address.get(1 + KEY_HASH_LEN..1 + 2 * KEY_HASH_LEN);
    payment == Some(hash.as_slice()) || stake == Some(hash.as_slice())
}

/// Verify a CIP-8 proof: COSE_Sign1 signature over the message payload,
/// signed by the attached COSE key, which must hash into the address named
/// in the protected headers.
fn verify_proof(proof: &SignedProof) -> Result<Verification> {
    let sign1 = untag(
        serde_cbor::from_slice::<CborValue>(&proof.signature).context("Invalid COSE_Sign1 CBOR")?,
    );
    let CborValue::Array(fields) = sign1 else {
        bail!("COSE_Sign1 is not an array");
    };
    if fields.len() != 4 {
        bail!("COSE_Sign1 has {} fields, expected 4", fields.len());
    }
    let CborValue::Bytes(protected) = &fields[0] else {
        bail!("COSE_Sign1 protected headers are not a byte string");
    };
    let CborValue::Bytes(payload) = &fields[2] else {
        bail!("COSE_Sign1 payload is not a byte string");
    };
    let CborValue::Bytes(signature_bytes) = &fields[3] else {
        bail!("COSE_Sign1 signature is not a byte string");
    };

    let headers: CborValue =
        serde_cbor::from_slice(protected).context("Invalid protected header CBOR")?;
    let address = match cbor_map_get(&headers, &CborValue::Text("address".to_string())) {
        Some(CborValue::Bytes(address)) => address.clone(),
        _ => bail!("Protected headers carry no address"),
    };

    let cose_key: CborValue =
        serde_cbor::from_slice(&proof.key).context("Invalid COSE_Key CBOR")?;
    let public_key = match cbor_map_get(&cose_key, &CborValue::Integer(-2)) {
        Some(CborValue::Bytes(public_key)) => public_key.clone(),
        _ => bail!("COSE_Key carries no public key"),
    };
    let public_key: [u8; 32] = public_key
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Public key is not 32 bytes"))?;

    if !address_contains_hash(&address, &key_hash(&public_key)?) {
        bail!("Signing key does not belong to the claimed address");
    }

    // Sig_structure for a detached-free COSE_Sign1 with no external AAD.
    let sig_structure = serde_cbor::to_vec(&CborValue::Array(vec![
        CborValue::Text("Signature1".to_string()),
        CborValue::Bytes(protected.clone()),
        CborValue::Bytes(Vec::new()),
        CborValue::Bytes(payload.clone()),
    ]))?;

    let verifying_key = VerifyingKey::from_bytes(&public_key).map_err(|e| anyhow!("{e}"))?;
    let signature_bytes: [u8; 64] = signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Signature is not 64 bytes"))?;
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify(&sig_structure, &signature)
        .map_err(|e| anyhow!("Signature verification failed: {e}"))?;

    Ok(Verification {
        signing_address: hex::encode(&address),
        message: String::from_utf8(payload.clone()).context("Payload is not UTF-8")?,
    })
}

#[async_trait]
impl Whitelist for WalletWhitelist {
    async fn required_info(
        &self,
        mint_req: &Utxo,
        txn_utxos: &TxnUtxos,
        indexer: &dyn ChainIndexer,
    ) -> Result<WhitelistResources> {
        Ok(WhitelistResources {
            metadata: indexer.get_txn_metadata(&mint_req.hash).await?,
            input_addrs: WhitelistResources::funding_addrs(txn_utxos),
            ..Default::default()
        })
    }

    fn available(&self, resources: &WhitelistResources) -> u64 {
        let Some(proof) = self.signed_proof(&resources.metadata) else {
            return 0;
        };
        let verification = match verify_proof(&proof) {
            Ok(verification) => verification,
            Err(e) => {
                tracing::warn!("Failed to verify whitelist proof: {e}");
                return 0;
            }
        };
        let num_whitelisted = self.store.num_whitelisted(&verification.signing_address);
        if num_whitelisted == 0 {
            tracing::warn!("{} not on whitelist", verification.signing_address);
            return 0;
        }
        let claimed: Vec<&str> = verification.message.trim().split(',').collect();
        for input_addr in &resources.input_addrs {
            if !claimed.contains(&input_addr.as_str()) {
                tracing::warn!(
                    "Found unexpected address {input_addr}, excluding signer from whitelist"
                );
                return 0;
            }
        }
        num_whitelisted
    }

    fn consume(&self, resources: &WhitelistResources, num_mints: u64) -> Result<()> {
        if num_mints == 0 {
            return Ok(());
        }
        let proof = self.signed_proof(&resources.metadata).ok_or_else(|| {
            anyhow!(
                "[MANUALLY DEBUG] SOMEHOW MINTED OFF WHITELIST WITH NO PROOF: {:?}",
                resources.metadata
            )
        })?;
        let verification = verify_proof(&proof).map_err(|e| {
            anyhow!("[MANUALLY DEBUG] SOMEHOW MINTED OFF WHITELIST WITH AN INVALIDLY SIGNED MESSAGE ({e})")
        })?;
        let num_whitelisted = self.store.num_whitelisted(&verification.signing_address);
        if num_mints > num_whitelisted {
            bail!(
                "[MANUALLY DEBUG] THERE WAS AN OVERMINT FOR A WHITELIST ({num_mints} > {num_whitelisted}), \
                 THE MINT WAS ALREADY PROCESSED, INVESTIGATE {}",
                verification.signing_address
            );
        }
        self.store
            .remove_from_whitelist(&verification.signing_address, num_mints)
    }

    fn validate(&self) -> Result<()> {
        self.store.validate()
    }
}
