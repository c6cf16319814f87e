//! Mint configuration: prices, signing material, metadata inventory.
//!
//! A [`Mint`] is assembled once at startup from CLI configuration and
//! validated exactly once before the first vend. Validation walks the whole
//! metadata inventory so a malformed CIP-25 file halts the process before any
//! money can move.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::bogo::Bogo;
use crate::utxo::{Balance, MIN_UTXO_VALUE};
use crate::whitelist::Whitelist;

/// Hex length of an on-chain policy id (28 bytes).
pub const POLICY_LEN: usize = 56;

/// The CIP-25 top-level metadata label.
const METADATA_KEY: &str = "721";

/// On-chain metadata caps individual string values at 64 bytes.
const MAX_METADATA_STR_LEN: usize = 64;

/// Price per NFT in a single denomination.
///
/// `unit` is either [`Balance::LOVELACE`] or the normalized
/// `<policyhex>.<assetnamehex>` form. A price of 0 lovelace means the unit
/// grants a free mint capped only by the single-vend ceiling.
#[derive(Debug, Clone)]
pub struct Price {
    pub lovelace: u64,
    pub unit: String,
}

impl Price {
    pub fn new(lovelace: u64, unit: &str) -> Self {
        Self {
            lovelace,
            unit: unit.to_string(),
        }
    }
}

/// Aggregate configuration for the current minting process.
pub struct Mint {
    pub prices: Vec<Price>,
    pub dev_fee: u64,
    pub dev_addr: Option<String>,
    pub nfts_dir: PathBuf,
    pub scripts: Vec<PathBuf>,
    pub sign_keys: Vec<PathBuf>,
    pub whitelist: Box<dyn Whitelist>,
    pub bogo: Option<Bogo>,

    /// Policy ids implied by the validated inventory.
    pub policies: BTreeSet<String>,
    /// Fully-qualified `policy.assetname` pairs found in the inventory.
    pub validated_names: BTreeSet<String>,
    /// Latest "after" slot across all scripts (intersection of windows).
    pub initial_slot: Option<u64>,
    /// Earliest "before" slot across all scripts.
    pub expiration_slot: Option<u64>,
}

impl Mint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prices: Vec<Price>,
        dev_fee: u64,
        dev_addr: Option<String>,
        nfts_dir: &Path,
        scripts: Vec<PathBuf>,
        sign_keys: Vec<PathBuf>,
        whitelist: Box<dyn Whitelist>,
        bogo: Option<Bogo>,
    ) -> Self {
        Self {
            prices,
            dev_fee,
            dev_addr,
            nfts_dir: nfts_dir.to_path_buf(),
            scripts,
            sign_keys,
            whitelist,
            bogo,
            policies: BTreeSet::new(),
            validated_names: BTreeSet::new(),
            initial_slot: None,
            expiration_slot: None,
        }
    }

    /// Validate the static configuration and the on-disk metadata inventory.
    ///
    /// Populates the derived `policies`, `validated_names` and validity-slot
    /// fields. Raises on the first violation; never mutates the inventory.
    pub fn validate(&mut self) -> Result<()> {
        self.validate_prices()?;
        self.validate_dev_fee()?;
        self.validate_metadata_inventory()?;
        self.validate_files_exist()?;
        self.resolve_validity_slots()?;
        self.whitelist.validate()
    }

    fn validate_prices(&self) -> Result<()> {
        if self.prices.is_empty() {
            bail!("At least one mint price must be configured");
        }
        let mut seen_units = BTreeSet::new();
        for price in &self.prices {
            if !seen_units.insert(price.unit.as_str()) {
                bail!("Found duplicate price for unit '{}'", price.unit);
            }
            validate_unit(&price.unit)?;
            if price.unit == Balance::LOVELACE
                && price.lovelace != 0
                && price.lovelace < MIN_UTXO_VALUE
            {
                bail!(
                    "Provided mint price of {} but minimum allowed is {}",
                    price.lovelace,
                    MIN_UTXO_VALUE
                );
            }
        }
        Ok(())
    }

    fn validate_dev_fee(&self) -> Result<()> {
        if self.dev_fee > 0 && self.dev_addr.is_none() {
            bail!(
                "Dev fee of {} configured without a dev address",
                self.dev_fee
            );
        }
        if self.dev_fee > 0 && self.dev_fee < MIN_UTXO_VALUE {
            bail!(
                "Dev fee of {} is below the minimum UTxO value of {}",
                self.dev_fee,
                MIN_UTXO_VALUE
            );
        }
        Ok(())
    }

    fn validate_metadata_inventory(&mut self) -> Result<()> {
        let mut filenames: Vec<_> = std::fs::read_dir(&self.nfts_dir)
            .with_context(|| format!("Could not read metadata dir {}", self.nfts_dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        filenames.sort();
        for metadata_file in filenames {
            self.validate_metadata_file(&metadata_file)?;
        }
        self.policies = self
            .validated_names
            .iter()
            .filter_map(|name| name.split('.').next())
            .map(str::to_string)
            .collect();
        Ok(())
    }

    fn validate_metadata_file(&mut self, metadata_file: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(metadata_file)
            .with_context(|| format!("Could not read {}", metadata_file.display()))?;
        let parsed: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid JSON in {}", metadata_file.display()))?;
        let Some(top_level) = parsed.as_object() else {
            bail!("Expected JSON object in {}", metadata_file.display());
        };
        if top_level.len() != 1 || !top_level.contains_key(METADATA_KEY) {
            bail!(
                "Incorrect # of keys ({}, expected exactly '{METADATA_KEY}') in {}",
                top_level.len(),
                metadata_file.display()
            );
        }
        let Some(cip25) = top_level[METADATA_KEY].as_object() else {
            bail!(
                "Expected object under '{METADATA_KEY}' in {}",
                metadata_file.display()
            );
        };

        if cip25.len() == 2 && !cip25.contains_key("version") {
            bail!(
                "Found 2 keys but 1 is not 'version' in {}",
                metadata_file.display()
            );
        }
        let policy_keys: Vec<&String> = cip25.keys().filter(|key| *key != "version").collect();
        if policy_keys.is_empty() {
            bail!("No policy keys found in {}", metadata_file.display());
        }
        if policy_keys.len() > 1 {
            bail!(
                "Too many policy keys ({}) found in {}",
                policy_keys.len(),
                metadata_file.display()
            );
        }

        let policy = policy_keys[0];
        if policy.len() != POLICY_LEN || !policy.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("Incorrect looking policy {policy} in {}", metadata_file.display());
        }
        let Some(assets) = cip25[policy].as_object() else {
            bail!(
                "Expected assets object under policy {policy} in {}",
                metadata_file.display()
            );
        };
        if assets.is_empty() {
            bail!(
                "Incorrect # of assets (0) in {}",
                metadata_file.display()
            );
        }
        for (asset_name, asset_metadata) in assets {
            validate_metadata_strings(asset_metadata)?;
            let qualified_name = format!("{policy}.{asset_name}");
            if !self.validated_names.insert(qualified_name) {
                bail!("Found duplicate asset name '{asset_name}'");
            }
        }
        Ok(())
    }

    fn validate_files_exist(&self) -> Result<()> {
        for script in &self.scripts {
            if !script.exists() {
                bail!("No such file or directory: '{}'", script.display());
            }
        }
        for sign_key in &self.sign_keys {
            if !sign_key.exists() {
                bail!(
                    "Signing key file '{}' not found on filesystem",
                    sign_key.display()
                );
            }
        }
        Ok(())
    }

    /// Intersect the validity windows of all configured scripts: the mint is
    /// only valid after every "after" bound and before every "before" bound.
    fn resolve_validity_slots(&mut self) -> Result<()> {
        for script in &self.scripts {
            if let Some(after) = read_validator_slot(script, "after")? {
                self.initial_slot = Some(self.initial_slot.map_or(after, |s| s.max(after)));
            }
            if let Some(before) = read_validator_slot(script, "before")? {
                self.expiration_slot = Some(self.expiration_slot.map_or(before, |s| s.min(before)));
            }
        }
        Ok(())
    }
}

fn validate_unit(unit: &str) -> Result<()> {
    if unit == Balance::LOVELACE {
        return Ok(());
    }
    let parts: Vec<&str> = unit.splitn(2, '.').collect();
    let valid = parts.len() == 2
        && parts[0].len() == POLICY_LEN
        && parts[0].chars().all(|c| c.is_ascii_hexdigit())
        && !parts[1].is_empty()
        && hex::decode(parts[1]).is_ok();
    if !valid {
        bail!("Invalid unit identifier '{unit}' in price configuration");
    }
    Ok(())
}

/// Recursively walk all string leaves and reject any longer than the
/// on-chain metadata cap.
fn validate_metadata_strings(value: &Value) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.len() > MAX_METADATA_STR_LEN {
                bail!(
                    "Encountered metadata value >{MAX_METADATA_STR_LEN} chars '{s}'"
                );
            }
        }
        Value::Array(items) => {
            for item in items {
                validate_metadata_strings(item)?;
            }
        }
        Value::Object(entries) => {
            for entry in entries.values() {
                validate_metadata_strings(entry)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Read the slot bound of a `{"type": "<validation>", "slot": N}` validator
/// from a native script file, looking one level into a nested `scripts` list.
fn read_validator_slot(script: &Path, validation: &str) -> Result<Option<u64>> {
    let contents = std::fs::read_to_string(script)
        .with_context(|| format!("Could not read script file {}", script.display()))?;
    let parsed: Value = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid JSON in script file {}", script.display()))?;
    if let Some(slot) = validator_slot_in(&parsed, validation) {
        return Ok(Some(slot));
    }
    if let Some(validators) = parsed.get("scripts").and_then(Value::as_array) {
        for validator in validators {
            if let Some(slot) = validator_slot_in(validator, validation) {
                return Ok(Some(slot));
            }
        }
    }
    Ok(None)
}

fn validator_slot_in(validator: &Value, validation: &str) -> Option<u64> {
    if validator.get("type").and_then(Value::as_str) == Some(validation) {
        validator.get("slot").and_then(Value::as_u64)
    } else {
        None
    }
}
