//! UTXO model
//!
//! There is no separate UTXO index: unspent outputs are found by walking the
//! chain from a tip back to genesis. Walking newest first means every spend of
//! an output is seen before the output itself.

use super::chain::{LedgerError, RejectReason};
use super::pool::TxPool;
use crate::core::{Block, OutPoint, Transaction, TxInput, TxOutput, BLOCK_REWARD};
use crate::crypto::KeyPair;
use crate::storage::{ChainStore, StorageError};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

/// The chain ending at `tip`, as seen through the store
pub struct ChainView<'a> {
    store: &'a ChainStore,
    tip: &'a Block,
}

/// Outputs located by a chain walk and which of them are already spent
#[derive(Debug, Default)]
struct ChainScan {
    found: HashMap<OutPoint, TxOutput>,
    spent: HashSet<OutPoint>,
}

impl<'a> ChainView<'a> {
    pub fn new(store: &'a ChainStore, tip: &'a Block) -> Self {
        Self { store, tip }
    }

    /// Locate `wanted` outputs in one backward walk, stopping once all are found
    fn scan(&self, wanted: &HashSet<OutPoint>) -> Result<ChainScan, StorageError> {
        let mut scan = ChainScan::default();
        if wanted.is_empty() {
            return Ok(scan);
        }
        for block in self.store.ancestors(self.tip.clone()) {
            let block = block?;
            for tx in &block.transactions {
                for outpoint in tx.spent_outpoints() {
                    if wanted.contains(&outpoint) {
                        scan.spent.insert(outpoint);
                    }
                }
                for (outpoint, output) in tx.created_outputs() {
                    if wanted.contains(&outpoint) {
                        scan.found.insert(outpoint, output.clone());
                    }
                }
            }
            if scan.found.len() == wanted.len() {
                break;
            }
        }
        Ok(scan)
    }

    /// Call `f` with each unspent output owned by `owner`, newest first
    pub fn for_each_utxo<F>(&self, owner: &str, mut f: F) -> Result<(), StorageError>
    where
        F: FnMut(&OutPoint, &TxOutput) -> ControlFlow<()>,
    {
        let mut spent = HashSet::new();
        for block in self.store.ancestors(self.tip.clone()) {
            let block = block?;
            for tx in &block.transactions {
                spent.extend(tx.spent_outpoints());
            }
            for tx in &block.transactions {
                for (outpoint, output) in tx.created_outputs() {
                    if output.is_owned_by(owner) && !spent.contains(&outpoint) {
                        if let ControlFlow::Break(()) = f(&outpoint, output) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Sum of unspent outputs owned by `owner`
    pub fn balance_of(&self, owner: &str) -> Result<u64, StorageError> {
        let mut total = 0u64;
        self.for_each_utxo(owner, |_, output| {
            total = total.saturating_add(output.amount);
            ControlFlow::Continue(())
        })?;
        Ok(total)
    }
}

// =============================================================================
// Verification
// =============================================================================

/// Checks that need no chain access
fn check_shape(tx: &Transaction) -> Result<(), RejectReason> {
    if !tx.has_valid_id() {
        return Err(RejectReason::BadTxId(tx.id.clone()));
    }
    if tx.outputs.is_empty() {
        return Err(RejectReason::NoOutputs);
    }
    if tx.outputs.iter().any(|o| o.amount == 0) {
        return Err(RejectReason::ZeroOutput);
    }
    if tx.is_coinbase() {
        let valid = tx.inputs.len() == 1
            && tx.outputs.len() == 1
            && tx.outputs[0].amount == BLOCK_REWARD;
        return if valid {
            Ok(())
        } else {
            Err(RejectReason::BadCoinbase)
        };
    }
    if tx.inputs.is_empty() || tx.inputs.iter().any(|i| i.outpoint().is_none()) {
        return Err(RejectReason::MalformedInput);
    }
    let mut seen = HashSet::new();
    for outpoint in tx.spent_outpoints() {
        if !seen.insert(outpoint.clone()) {
            return Err(RejectReason::DoubleSpend(outpoint.to_string()));
        }
    }
    Ok(())
}

/// Signature and value checks once every referenced output is known
fn check_spends(
    tx: &Transaction,
    resolve: impl Fn(&OutPoint) -> Option<TxOutput>,
) -> Result<(), RejectReason> {
    let mut input_total = 0u64;
    for input in &tx.inputs {
        let outpoint = input.outpoint().ok_or(RejectReason::MalformedInput)?;
        let output =
            resolve(&outpoint).ok_or_else(|| RejectReason::UnknownOutput(outpoint.to_string()))?;
        if !output.verify_spend(&input.script_sig) {
            return Err(RejectReason::BadSpendSignature(outpoint.to_string()));
        }
        input_total = input_total
            .checked_add(output.amount)
            .ok_or(RejectReason::ValueOverflow)?;
    }
    let output_total = tx.total_output().ok_or(RejectReason::ValueOverflow)?;
    if input_total < output_total {
        return Err(RejectReason::InsufficientInputs {
            have: input_total,
            need: output_total,
        });
    }
    Ok(())
}

/// Verify a transaction offered to the pool
pub fn verify_transaction(
    view: &ChainView<'_>,
    pool: &TxPool,
    tx: &Transaction,
) -> Result<(), LedgerError> {
    check_shape(tx)?;
    if tx.is_coinbase() {
        return Ok(());
    }

    let mut wanted = HashSet::new();
    for outpoint in tx.spent_outpoints() {
        if pool.spender_of(&outpoint).is_some_and(|spender| spender != tx.id) {
            return Err(RejectReason::DoubleSpend(outpoint.to_string()).into());
        }
        if pool.find_output(&outpoint).is_none() {
            wanted.insert(outpoint);
        }
    }

    let scan = view.scan(&wanted)?;
    if let Some(outpoint) = wanted.iter().find(|o| scan.spent.contains(*o)) {
        return Err(RejectReason::DoubleSpend(outpoint.to_string()).into());
    }
    check_spends(tx, |outpoint| {
        pool.find_output(outpoint)
            .or_else(|| scan.found.get(outpoint))
            .cloned()
    })?;
    Ok(())
}

/// Verify the transactions of `block` against the chain `view` it extends.
///
/// Outputs may come from the chain or from earlier transactions of the same
/// block. The pool plays no part.
pub fn verify_block_transactions(view: &ChainView<'_>, block: &Block) -> Result<(), LedgerError> {
    let mut coinbases = 0;
    let mut spent_in_block = HashSet::new();
    let mut wanted = HashSet::new();
    let mut created: HashMap<OutPoint, TxOutput> = HashMap::new();

    for tx in &block.transactions {
        check_shape(tx)?;
        if tx.is_coinbase() {
            coinbases += 1;
            if coinbases > 1 {
                return Err(RejectReason::MultipleCoinbase.into());
            }
        }
        for outpoint in tx.spent_outpoints() {
            if !spent_in_block.insert(outpoint.clone()) {
                return Err(RejectReason::DoubleSpend(outpoint.to_string()).into());
            }
            if !created.contains_key(&outpoint) {
                wanted.insert(outpoint);
            }
        }
        for (outpoint, output) in tx.created_outputs() {
            created.insert(outpoint, output.clone());
        }
    }

    let scan = view.scan(&wanted)?;
    if let Some(outpoint) = wanted.iter().find(|o| scan.spent.contains(*o)) {
        return Err(RejectReason::DoubleSpend(outpoint.to_string()).into());
    }
    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
        check_spends(tx, |outpoint| {
            created
                .get(outpoint)
                .or_else(|| scan.found.get(outpoint))
                .cloned()
        })?;
    }
    Ok(())
}

// =============================================================================
// Spending
// =============================================================================

/// Build and sign a transfer of `amount` from `owner` to `to`.
///
/// Outputs already spent by pooled transactions are skipped. Change goes back
/// to the owner.
pub fn build_transaction(
    view: &ChainView<'_>,
    pool: &TxPool,
    owner: &KeyPair,
    to: &str,
    amount: u64,
) -> Result<Transaction, LedgerError> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount);
    }
    let owner_key = owner.public_key_hex();

    let mut selected = Vec::new();
    let mut total = 0u64;
    view.for_each_utxo(&owner_key, |outpoint, output| {
        if pool.spender_of(outpoint).is_some() {
            return ControlFlow::Continue(());
        }
        selected.push((outpoint.clone(), output.clone()));
        total = total.saturating_add(output.amount);
        if total >= amount {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;

    if total < amount {
        return Err(LedgerError::InsufficientFunds {
            have: total,
            need: amount,
        });
    }

    let inputs = selected
        .iter()
        .map(|(outpoint, output)| TxInput::spend(outpoint, output, owner))
        .collect::<Result<Vec<_>, _>>()?;
    let mut outputs = vec![TxOutput::new(amount, to)];
    if total > amount {
        outputs.push(TxOutput::new(total - amount, owner_key));
    }
    Ok(Transaction::new(inputs, outputs))
}
