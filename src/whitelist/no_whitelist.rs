//! The absent whitelist: every request is allowed.

use anyhow::Result;
use async_trait::async_trait;

use crate::blockfrost::{ChainIndexer, TxnUtxos};
use crate::utxo::Utxo;

use super::{Whitelist, WhitelistResources, UNLIMITED};

/// No mint restrictions.
#[derive(Debug, Default)]
pub struct NoWhitelist;

#[async_trait]
impl Whitelist for NoWhitelist {
    async fn required_info(
        &self,
        _mint_req: &Utxo,
        _txn_utxos: &TxnUtxos,
        _indexer: &dyn ChainIndexer,
    ) -> Result<WhitelistResources> {
        Ok(WhitelistResources::default())
    }

    fn available(&self, _resources: &WhitelistResources) -> u64 {
        UNLIMITED
    }

    fn consume(&self, _resources: &WhitelistResources, _num_mints: u64) -> Result<()> {
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
