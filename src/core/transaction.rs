//! Transaction handling for the ledger
//!
//! Implements a UTXO-based transaction model. A transaction id is the hash of
//! its own inputs and outputs, so transactions are content addressed and any
//! tampering changes the id.

use crate::crypto::{sha256_hex, verify_hex, KeyError, KeyPair};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed reward carried by every coinbase transaction
pub const BLOCK_REWARD: u64 = 50;

/// Output index recorded by coinbase inputs
pub const COINBASE_INDEX: i64 = -1;

/// Serialize a value to its canonical JSON bytes.
///
/// Every type hashed or signed by the ledger is a plain struct of strings and
/// integers, which serde_json always serializes in declaration order.
pub(crate) fn canonical_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Reference to one output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub tx_id: String,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<String>, index: u32) -> Self {
        Self {
            tx_id: tx_id.into(),
            index,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

/// Transaction input (reference to previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    /// Id of the transaction holding the spent output, `None` for coinbase
    pub id: Option<String>,
    /// Index of the output in that transaction, `-1` for coinbase
    pub index: i64,
    /// Signature over the spent output, or free text for coinbase
    #[serde(rename = "ScriptSig")]
    pub script_sig: String,
}

impl TxInput {
    /// Build a coinbase input carrying an arbitrary memo
    pub fn coinbase(memo: impl Into<String>) -> Self {
        Self {
            id: None,
            index: COINBASE_INDEX,
            script_sig: memo.into(),
        }
    }

    /// Build an input spending `output`, signed by its owner
    pub fn spend(
        outpoint: &OutPoint,
        output: &TxOutput,
        owner: &KeyPair,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            id: Some(outpoint.tx_id.clone()),
            index: i64::from(outpoint.index),
            script_sig: owner.sign_hex(&output.canonical_bytes())?,
        })
    }

    pub fn is_coinbase(&self) -> bool {
        self.id.is_none()
    }

    /// The referenced output, if this input spends one
    pub fn outpoint(&self) -> Option<OutPoint> {
        let tx_id = self.id.as_ref()?;
        let index = u32::try_from(self.index).ok()?;
        Some(OutPoint::new(tx_id.clone(), index))
    }
}

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount of coins
    pub amount: u64,
    /// Recipient's public key (hex)
    #[serde(rename = "ScriptPubKey")]
    pub script_pubkey: String,
}

impl TxOutput {
    pub fn new(amount: u64, recipient: impl Into<String>) -> Self {
        Self {
            amount,
            script_pubkey: recipient.into(),
        }
    }

    /// Check if this output belongs to the given public key
    pub fn is_owned_by(&self, public_key: &str) -> bool {
        self.script_pubkey == public_key
    }

    /// Bytes an owner signs to authorize spending this output
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_json(self)
    }

    /// Check a spend signature against the recorded recipient
    pub fn verify_spend(&self, script_sig: &str) -> bool {
        verify_hex(&self.script_pubkey, &self.canonical_bytes(), script_sig)
    }
}

/// A ledger transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Hash of the inputs and outputs
    pub id: String,
    /// Transaction inputs
    #[serde(rename = "input")]
    pub inputs: Vec<TxInput>,
    /// Transaction outputs
    #[serde(rename = "output")]
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a transaction, deriving its id from the contents
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let id = Self::calculate_id(&inputs, &outputs);
        Self {
            id,
            inputs,
            outputs,
        }
    }

    /// Create a coinbase (block reward) transaction
    pub fn coinbase(recipient: &str, memo: impl Into<String>) -> Self {
        Self::new(
            vec![TxInput::coinbase(memo)],
            vec![TxOutput::new(BLOCK_REWARD, recipient)],
        )
    }

    /// Hash of the serialized inputs followed by the serialized outputs
    pub fn calculate_id(inputs: &[TxInput], outputs: &[TxOutput]) -> String {
        let mut data = canonical_json(&inputs);
        data.extend_from_slice(&canonical_json(&outputs));
        sha256_hex(&data)
    }

    /// Whether the stored id matches the contents
    pub fn has_valid_id(&self) -> bool {
        self.id == Self::calculate_id(&self.inputs, &self.outputs)
    }

    /// A coinbase transaction references no earlier output
    pub fn is_coinbase(&self) -> bool {
        self.inputs.iter().any(TxInput::is_coinbase)
    }

    /// Sum of all outputs, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Outputs referenced by the inputs (coinbase inputs excluded)
    pub fn spent_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().filter_map(TxInput::outpoint)
    }

    /// Outputs created by this transaction, with their outpoints
    pub fn created_outputs(&self) -> impl Iterator<Item = (OutPoint, &TxOutput)> + '_ {
        self.outputs
            .iter()
            .enumerate()
            .map(move |(i, o)| (OutPoint::new(self.id.clone(), i as u32), o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::coinbase("recipient", "memo");
        assert!(tx.is_coinbase());
        assert_eq!(tx.total_output(), Some(BLOCK_REWARD));
        assert!(tx.has_valid_id());
        assert_eq!(tx.spent_outpoints().count(), 0);
    }

    #[test]
    fn test_transaction_id_changes_with_content() {
        let tx1 = Transaction::coinbase("addr1", "memo");
        let tx2 = Transaction::coinbase("addr2", "memo");
        assert_ne!(tx1.id, tx2.id);

        let mut tampered = tx1.clone();
        tampered.outputs[0].amount = 5000;
        assert!(!tampered.has_valid_id());
    }

    #[test]
    fn test_spend_signature() {
        let owner = KeyPair::generate();
        let thief = KeyPair::generate();
        let output = TxOutput::new(50, owner.public_key_hex());
        let outpoint = OutPoint::new("abc123", 0);

        let good = TxInput::spend(&outpoint, &output, &owner).unwrap();
        assert!(output.verify_spend(&good.script_sig));
        assert_eq!(good.outpoint(), Some(outpoint.clone()));

        let bad = TxInput::spend(&outpoint, &output, &thief).unwrap();
        assert!(!output.verify_spend(&bad.script_sig));
    }

    #[test]
    fn test_total_output_overflow() {
        let tx = Transaction::new(
            vec![],
            vec![TxOutput::new(u64::MAX, "a"), TxOutput::new(1, "b")],
        );
        assert_eq!(tx.total_output(), None);
    }

    #[test]
    fn test_wire_shape() {
        let tx = Transaction::coinbase("pk", "memo");
        let json = serde_json::to_value(&tx).unwrap();
        assert!(json["input"][0]["id"].is_null());
        assert_eq!(json["input"][0]["index"], -1);
        assert_eq!(json["input"][0]["ScriptSig"], "memo");
        assert_eq!(json["output"][0]["amount"], 50);
        assert_eq!(json["output"][0]["ScriptPubKey"], "pk");
    }
}
