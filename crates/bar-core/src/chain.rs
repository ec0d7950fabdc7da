//! In-memory chain store.
//!
//! Implements both [`ChainState`] and [`BlockSink`] over height-indexed maps.
//! It performs only structural checks (payload commitment, height continuity,
//! parent linkage); it is the stand-in for the real blockchain collaborator in
//! the node binary and in tests.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::ChainError;
use crate::traits::{BlockSink, ChainState};
use crate::types::{Block, BlockHeader, Hash256};

/// Timestamp of the genesis block.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<u64, Block>,
    headers: BTreeMap<u64, BlockHeader>,
}

impl Inner {
    fn tip_height(&self) -> u64 {
        self.blocks.last_key_value().map(|(h, _)| *h).unwrap_or(0)
    }

    fn header_tip_height(&self) -> u64 {
        self.headers.last_key_value().map(|(h, _)| *h).unwrap_or(0)
    }
}

/// Height-indexed chain held in memory, seeded with a fixed genesis block.
#[derive(Debug)]
pub struct MemoryChain {
    inner: RwLock<Inner>,
}

impl MemoryChain {
    /// A chain containing only the genesis block.
    pub fn new() -> Self {
        let genesis = Self::genesis();
        let mut inner = Inner::default();
        inner.headers.insert(0, genesis.header.clone());
        inner.blocks.insert(0, genesis);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// The genesis block shared by every node.
    pub fn genesis() -> Block {
        Block::new(0, Hash256::ZERO, GENESIS_TIMESTAMP, b"bar genesis".to_vec())
    }

    /// Append a new block carrying `payload` on top of the current tip.
    pub fn extend(&self, payload: Vec<u8>) -> Block {
        let mut inner = self.inner.write();
        let height = inner.tip_height() + 1;
        let (prev_hash, prev_ts) = inner
            .blocks
            .get(&(height - 1))
            .map(|b| (b.hash(), b.header.timestamp))
            .unwrap_or((Hash256::ZERO, GENESIS_TIMESTAMP));
        let block = Block::new(height, prev_hash, prev_ts + 1, payload);
        inner.headers.insert(height, block.header.clone());
        inner.blocks.insert(height, block.clone());
        block
    }

    /// Number of full blocks stored, genesis included.
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Block at the current tip.
    pub fn tip(&self) -> Option<Block> {
        self.inner.read().blocks.last_key_value().map(|(_, b)| b.clone())
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainState for MemoryChain {
    fn chain_height(&self) -> Result<u64, ChainError> {
        Ok(self.inner.read().tip_height())
    }

    fn block_at(&self, height: u64) -> Result<Option<Block>, ChainError> {
        Ok(self.inner.read().blocks.get(&height).cloned())
    }

    fn header_at(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.inner.read().headers.get(&height).cloned())
    }

    fn header_height(&self) -> Result<u64, ChainError> {
        Ok(self.inner.read().header_tip_height())
    }

    fn has_block(&self, height: u64) -> Result<bool, ChainError> {
        Ok(self.inner.read().blocks.contains_key(&height))
    }
}

impl BlockSink for MemoryChain {
    fn import_block(&self, block: Block) -> Result<(), ChainError> {
        if !block.verify_payload() {
            return Err(ChainError::InvalidBlock("payload hash mismatch".into()));
        }
        let height = block.height();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.blocks.get(&height) {
            if existing.hash() == block.hash() {
                return Ok(());
            }
            return Err(ChainError::Conflict(height));
        }

        let expected = inner.tip_height() + 1;
        if height != expected {
            return Err(ChainError::NotContiguous { expected, got: height });
        }
        let parent = inner
            .blocks
            .get(&(height - 1))
            .map(|b| b.hash())
            .ok_or(ChainError::HeightNotFound(height - 1))?;
        if block.header.prev_hash != parent {
            return Err(ChainError::InvalidBlock(format!("prev_hash mismatch at height {height}")));
        }
        if let Some(known) = inner.headers.get(&height) {
            if known.hash() != block.hash() {
                return Err(ChainError::Conflict(height));
            }
        }

        debug!(height, hash = %block.hash(), "chain: block imported");
        inner.headers.insert(height, block.header.clone());
        inner.blocks.insert(height, block);
        Ok(())
    }

    fn import_headers(&self, headers: Vec<BlockHeader>) -> Result<usize, ChainError> {
        let mut inner = self.inner.write();
        let mut imported = 0;

        for header in headers {
            let height = header.height;
            if let Some(existing) = inner.headers.get(&height) {
                if existing.hash() != header.hash() {
                    return Err(ChainError::Conflict(height));
                }
                continue;
            }
            let expected = inner.header_tip_height() + 1;
            if height != expected {
                return Err(ChainError::NotContiguous { expected, got: height });
            }
            let parent = inner
                .headers
                .get(&(height - 1))
                .map(|h| h.hash())
                .ok_or(ChainError::HeightNotFound(height - 1))?;
            if header.prev_hash != parent {
                return Err(ChainError::InvalidBlock(format!("header linkage broken at height {height}")));
            }
            inner.headers.insert(height, header);
            imported += 1;
        }

        if imported > 0 {
            debug!(imported, tip = inner.header_tip_height(), "chain: headers imported");
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chain_holds_genesis() {
        let chain = MemoryChain::new();
        assert_eq!(chain.chain_height().unwrap(), 0);
        assert_eq!(chain.block_count(), 1);
        assert_eq!(chain.block_at(0).unwrap(), Some(MemoryChain::genesis()));
    }

    #[test]
    fn extend_links_to_parent() {
        let chain = MemoryChain::new();
        let b1 = chain.extend(b"one".to_vec());
        let b2 = chain.extend(b"two".to_vec());
        assert_eq!(b1.height(), 1);
        assert_eq!(b2.header.prev_hash, b1.hash());
        assert_eq!(chain.chain_height().unwrap(), 2);
    }

    #[test]
    fn import_block_from_other_chain() {
        let source = MemoryChain::new();
        let b1 = source.extend(b"one".to_vec());
        let b2 = source.extend(b"two".to_vec());

        let target = MemoryChain::new();
        target.import_block(b1.clone()).unwrap();
        target.import_block(b2).unwrap();
        assert_eq!(target.chain_height().unwrap(), 2);

        // Re-importing the same block is a no-op.
        target.import_block(b1).unwrap();
        assert_eq!(target.block_count(), 3);
    }

    #[test]
    fn import_rejects_gap() {
        let source = MemoryChain::new();
        source.extend(b"one".to_vec());
        let b2 = source.extend(b"two".to_vec());

        let target = MemoryChain::new();
        let err = target.import_block(b2).unwrap_err();
        assert_eq!(err, ChainError::NotContiguous { expected: 1, got: 2 });
    }

    #[test]
    fn import_rejects_tampered_payload() {
        let source = MemoryChain::new();
        let mut b1 = source.extend(b"one".to_vec());
        b1.payload = b"evil".to_vec();

        let target = MemoryChain::new();
        assert!(matches!(target.import_block(b1), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn import_rejects_conflicting_block() {
        let a = MemoryChain::new();
        let b = MemoryChain::new();
        a.extend(b"a".to_vec());
        let other = b.extend(b"b".to_vec());
        assert_eq!(a.import_block(other).unwrap_err(), ChainError::Conflict(1));
    }

    #[test]
    fn headers_import_ahead_of_bodies() {
        let source = MemoryChain::new();
        let headers: Vec<BlockHeader> = (0..5).map(|i| source.extend(vec![i]).header).collect();

        let light = MemoryChain::new();
        assert_eq!(light.import_headers(headers.clone()).unwrap(), 5);
        assert_eq!(light.header_height().unwrap(), 5);
        assert_eq!(light.chain_height().unwrap(), 0);

        // Known headers are skipped.
        assert_eq!(light.import_headers(headers).unwrap(), 0);
    }

    #[test]
    fn headers_with_broken_linkage_rejected() {
        let source = MemoryChain::new();
        let h1 = source.extend(vec![1]).header;
        let mut h2 = source.extend(vec![2]).header;
        h2.prev_hash = Hash256([9; 32]);

        let light = MemoryChain::new();
        assert!(matches!(
            light.import_headers(vec![h1, h2]),
            Err(ChainError::InvalidBlock(_))
        ));
    }
}
