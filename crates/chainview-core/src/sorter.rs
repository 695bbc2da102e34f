//! Deterministic intra-block transaction ordering.
//!
//! Before the sort-order upgrade height the chain did not report reliable
//! execution order, so transactions are ordered by hash. From the upgrade
//! height onward the chain-reported `transaction_index` is authoritative.

use std::cmp::Ordering;

use crate::types::ChainTransaction;

/// Orders the transactions of a block before they are applied.
#[derive(Debug, Clone, Copy)]
pub struct TransactionSorter {
    tx_index_start_block: u64,
}

impl TransactionSorter {
    pub fn new(tx_index_start_block: u64) -> Self {
        Self {
            tx_index_start_block,
        }
    }

    /// Returns `true` if blocks at `block_number` are ordered by transaction index.
    pub fn uses_tx_index(&self, block_number: u64) -> bool {
        block_number >= self.tx_index_start_block
    }

    /// Sort `txs` in place into application order for `block_number`.
    pub fn sort(&self, block_number: u64, txs: &mut [ChainTransaction]) {
        if self.uses_tx_index(block_number) {
            txs.sort_by(|a, b| {
                a.transaction_index
                    .cmp(&b.transaction_index)
                    .then_with(|| cmp_hash(&a.tx_hash, &b.tx_hash))
            });
        } else {
            txs.sort_by(|a, b| cmp_hash(&a.tx_hash, &b.tx_hash));
        }
    }

    /// Return a sorted copy of `txs`.
    pub fn sorted(&self, block_number: u64, txs: &[ChainTransaction]) -> Vec<ChainTransaction> {
        let mut out = txs.to_vec();
        self.sort(block_number, &mut out);
        out
    }
}

fn cmp_hash(a: &str, b: &str) -> Ordering {
    a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(hash: &str, index: u32) -> ChainTransaction {
        ChainTransaction {
            tx_hash: hash.into(),
            transaction_index: index,
            payload: serde_json::Value::Null,
        }
    }

    fn hashes(txs: &[ChainTransaction]) -> Vec<&str> {
        txs.iter().map(|t| t.tx_hash.as_str()).collect()
    }

    #[test]
    fn post_upgrade_orders_by_index() {
        let sorter = TransactionSorter::new(100);
        let txs = vec![tx("0xa", 2), tx("0xb", 0), tx("0xc", 1)];
        let sorted = sorter.sorted(100, &txs);
        assert_eq!(hashes(&sorted), vec!["0xb", "0xc", "0xa"]);
    }

    #[test]
    fn pre_upgrade_orders_by_hash() {
        let sorter = TransactionSorter::new(100);
        let txs = vec![tx("0xC3", 0), tx("0xa1", 1), tx("0xb2", 2)];
        let sorted = sorter.sorted(99, &txs);
        assert_eq!(hashes(&sorted), vec!["0xa1", "0xb2", "0xC3"]);
    }

    #[test]
    fn equal_index_falls_back_to_hash() {
        let sorter = TransactionSorter::new(0);
        let txs = vec![tx("0xff", 1), tx("0x01", 1), tx("0x99", 0)];
        let sorted = sorter.sorted(5, &txs);
        assert_eq!(hashes(&sorted), vec!["0x99", "0x01", "0xff"]);
    }
}
