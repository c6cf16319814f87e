//! Asset-token whitelists.
//!
//! A buyer proves membership by spending a transaction whose outputs carry a
//! whitelisted asset. The whitelist itself is a directory of files, one per
//! asset unit; a file's presence in `input_dir` is an unconsumed slot.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::blockfrost::{ChainIndexer, TxnIo, TxnUtxos};
use crate::utxo::Utxo;

use super::{Whitelist, WhitelistResources, UNLIMITED};

/// Filesystem plumbing shared by the asset whitelist variants.
#[derive(Debug)]
struct AssetDirs {
    input_dir: PathBuf,
    consumed_dir: PathBuf,
}

impl AssetDirs {
    fn fs_location(&self, asset_id: &str) -> PathBuf {
        self.input_dir.join(asset_id)
    }

    fn is_whitelisted(&self, asset_id: &str) -> bool {
        self.fs_location(asset_id).exists()
    }

    fn remove_from_whitelist(&self, asset_id: &str) -> Result<()> {
        let consumed_location = self.consumed_dir.join(asset_id);
        std::fs::rename(self.fs_location(asset_id), &consumed_location)
            .with_context(|| format!("Could not consume whitelist slot for {asset_id}"))
    }

    fn validate(&self) -> Result<()> {
        if !self.input_dir.exists() {
            bail!(
                "Could not find whitelist directory {} on filesystem!",
                self.input_dir.display()
            );
        }
        if !self.consumed_dir.exists() {
            bail!(
                "Output directory {} does not exist on filesystem!",
                self.consumed_dir.display()
            );
        }
        Ok(())
    }
}

fn output_asset_ids(utxo_outputs: &[TxnIo]) -> impl Iterator<Item = &str> {
    utxo_outputs
        .iter()
        .flat_map(|output| output.amount.iter())
        .map(|amount| amount.unit.as_str())
}

/// One mint per whitelisted asset for the duration of the mint.
#[derive(Debug)]
pub struct SingleUseWhitelist {
    dirs: AssetDirs,
}

impl SingleUseWhitelist {
    pub fn new(input_dir: &Path, consumed_dir: &Path) -> Self {
        Self {
            dirs: AssetDirs {
                input_dir: input_dir.to_path_buf(),
                consumed_dir: consumed_dir.to_path_buf(),
            },
        }
    }
}

#[async_trait]
impl Whitelist for SingleUseWhitelist {
    async fn required_info(
        &self,
        _mint_req: &Utxo,
        txn_utxos: &TxnUtxos,
        _indexer: &dyn ChainIndexer,
    ) -> Result<WhitelistResources> {
        Ok(WhitelistResources {
            utxo_outputs: txn_utxos.outputs.clone(),
            ..Default::default()
        })
    }

    /// Counts whitelisted assets appearing in the mint request transaction's
    /// outputs; each is one consumable slot.
    fn available(&self, resources: &WhitelistResources) -> u64 {
        output_asset_ids(&resources.utxo_outputs)
            .filter(|asset_id| self.dirs.is_whitelisted(asset_id))
            .count() as u64
    }

    /// Moves one slot file per mint into the consumed directory. The mint
    /// already happened on-chain, so a shortfall here can only be escalated.
    fn consume(&self, resources: &WhitelistResources, num_mints: u64) -> Result<()> {
        let mut remaining_to_remove = num_mints;
        for asset_id in output_asset_ids(&resources.utxo_outputs) {
            if remaining_to_remove == 0 {
                break;
            }
            if !self.dirs.is_whitelisted(asset_id) {
                continue;
            }
            self.dirs.remove_from_whitelist(asset_id)?;
            remaining_to_remove -= 1;
        }
        if remaining_to_remove != 0 {
            bail!(
                "[MANUALLY DEBUG] THERE WAS AN OVERMINT FOR A WHITELIST ({remaining_to_remove}), \
                 THE MINT WAS ALREADY PROCESSED, INVESTIGATE {:?}",
                resources.utxo_outputs
            );
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.dirs.validate()
    }
}

/// Unlimited mints per whitelisted asset for the duration of the mint.
#[derive(Debug)]
pub struct UnlimitedWhitelist {
    dirs: AssetDirs,
}

impl UnlimitedWhitelist {
    pub fn new(input_dir: &Path, consumed_dir: &Path) -> Self {
        Self {
            dirs: AssetDirs {
                input_dir: input_dir.to_path_buf(),
                consumed_dir: consumed_dir.to_path_buf(),
            },
        }
    }
}

#[async_trait]
impl Whitelist for UnlimitedWhitelist {
    async fn required_info(
        &self,
        _mint_req: &Utxo,
        txn_utxos: &TxnUtxos,
        _indexer: &dyn ChainIndexer,
    ) -> Result<WhitelistResources> {
        Ok(WhitelistResources {
            utxo_outputs: txn_utxos.outputs.clone(),
            ..Default::default()
        })
    }

    fn available(&self, resources: &WhitelistResources) -> u64 {
        let whitelisted = output_asset_ids(&resources.utxo_outputs)
            .any(|asset_id| self.dirs.is_whitelisted(asset_id));
        if whitelisted {
            UNLIMITED
        } else {
            0
        }
    }

    /// Slots are never exhausted, so nothing is recorded.
    fn consume(&self, _resources: &WhitelistResources, _num_mints: u64) -> Result<()> {
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.dirs.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockfrost::TxnAmount;
    use tempfile::tempdir;

    fn resources_with_units(units: &[&str]) -> WhitelistResources {
        WhitelistResources {
            utxo_outputs: vec![TxnIo {
                address: "addr_test1buyer".to_string(),
                amount: units.iter().map(|unit| TxnAmount::new(unit, 1)).collect(),
                reference: false,
                collateral: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn single_use_counts_matching_slots() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("aaa111"), "").unwrap();
        std::fs::write(unused.path().join("bbb222"), "").unwrap();

        let whitelist = SingleUseWhitelist::new(unused.path(), consumed.path());
        let resources = resources_with_units(&["aaa111", "ccc333", "bbb222"]);
        assert_eq!(whitelist.available(&resources), 2);
    }

    #[test]
    fn single_use_consume_moves_slot_files() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("aaa111"), "").unwrap();

        let whitelist = SingleUseWhitelist::new(unused.path(), consumed.path());
        let resources = resources_with_units(&["aaa111"]);
        whitelist.consume(&resources, 1).unwrap();

        assert!(!unused.path().join("aaa111").exists());
        assert!(consumed.path().join("aaa111").exists());
        assert_eq!(whitelist.available(&resources), 0);
    }

    #[test]
    fn single_use_overmint_is_fatal() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("aaa111"), "").unwrap();

        let whitelist = SingleUseWhitelist::new(unused.path(), consumed.path());
        let resources = resources_with_units(&["aaa111"]);
        let err = whitelist.consume(&resources, 2).unwrap_err();
        assert!(err.to_string().contains("OVERMINT"));
    }

    #[test]
    fn unlimited_grants_sentinel_capacity() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("aaa111"), "").unwrap();

        let whitelist = UnlimitedWhitelist::new(unused.path(), consumed.path());
        assert_eq!(
            whitelist.available(&resources_with_units(&["aaa111"])),
            UNLIMITED
        );
        assert_eq!(whitelist.available(&resources_with_units(&["zzz999"])), 0);

        // Consuming never exhausts the slot.
        whitelist
            .consume(&resources_with_units(&["aaa111"]), 10)
            .unwrap();
        assert!(unused.path().join("aaa111").exists());
    }

    #[test]
    fn validate_requires_both_directories() {
        let unused = tempdir().unwrap();
        let whitelist = SingleUseWhitelist::new(unused.path(), Path::new("/does/not/exist"));
        assert!(whitelist.validate().is_err());
    }
}
