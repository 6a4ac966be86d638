//! Transaction pool for pending transactions
//!
//! Holds verified transactions waiting to be included in a block, in arrival
//! order. Also indexes which pooled transaction spends which output.

use crate::core::{OutPoint, Transaction, TxOutput};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TxPool {
    order: Vec<String>,
    txs: HashMap<String, Transaction>,
    /// Outpoint -> id of the pooled transaction spending it
    spent: HashMap<OutPoint, String>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction. Returns `false` if it was already pooled.
    pub fn add(&mut self, tx: Transaction) -> bool {
        if self.txs.contains_key(&tx.id) {
            return false;
        }
        for outpoint in tx.spent_outpoints() {
            self.spent.insert(outpoint, tx.id.clone());
        }
        self.order.push(tx.id.clone());
        self.txs.insert(tx.id.clone(), tx);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.txs.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.txs.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Transaction> {
        let tx = self.txs.remove(id)?;
        self.order.retain(|pooled| pooled != id);
        for outpoint in tx.spent_outpoints() {
            if self.spent.get(&outpoint).is_some_and(|spender| spender == id) {
                self.spent.remove(&outpoint);
            }
        }
        Some(tx)
    }

    /// Drop every transaction of `txs` that is pooled
    pub fn remove_all<'a>(&mut self, txs: impl IntoIterator<Item = &'a Transaction>) {
        for tx in txs {
            self.remove(&tx.id);
        }
    }

    /// Transactions in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.order.iter().filter_map(|id| self.txs.get(id))
    }

    /// Output created by a pooled transaction
    pub fn find_output(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.txs
            .get(&outpoint.tx_id)?
            .outputs
            .get(outpoint.index as usize)
    }

    /// Id of the pooled transaction spending `outpoint`
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&str> {
        self.spent.get(outpoint).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
