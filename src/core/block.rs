//! Block implementation for the ledger
//!
//! A block links to its parent by hash, carries the proof written by the
//! consensus strategy that produced it and is signed by its generator.

use crate::core::transaction::{canonical_json, Transaction};
use crate::crypto::{merkle_root_of_ids, sha256_hex, verify_hex, KeyError, KeyPair};
use serde::{Deserialize, Serialize};

// =============================================================================
// Genesis Constants
// =============================================================================

/// Seed phrase of the key that signs the genesis block
pub const GENESIS_SEED: &str = "I am genesis!";

/// Fixed genesis timestamp (milliseconds since the Unix epoch)
pub const GENESIS_TIMESTAMP: i64 = 1_550_049_140_488;

/// Height of the genesis block
pub const GENESIS_HEIGHT: u64 = 1;

/// Block format version
pub const BLOCK_VERSION: u32 = 0;

// =============================================================================
// Consensus Data
// =============================================================================

/// Proof written into a block by the consensus strategy.
///
/// Serialized as a bare JSON object; the set of keys identifies the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConsensusData {
    /// Proof of work
    Pow { difficulty: u64, nonce: u64 },
    /// Proof of stake
    Pos {
        difficulty: u64,
        timestamp: i64,
        stake: u64,
    },
    /// Slot based proposal (DPoS and PBFT)
    Slot { generator_id: u64 },
    /// No proof (genesis, or not yet produced)
    Empty {},
}

impl Default for ConsensusData {
    fn default() -> Self {
        ConsensusData::Empty {}
    }
}

// =============================================================================
// Block
// =============================================================================

/// Borrowed view of the hashed fields of a block, in wire order
#[derive(Serialize)]
struct BlockContent<'a> {
    version: u32,
    height: u64,
    previous_hash: &'a Option<String>,
    timestamp: i64,
    merkle_hash: &'a Option<String>,
    generator_publickey: &'a str,
    consensus_data: &'a ConsensusData,
    transactions: &'a [Transaction],
}

/// A block in the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub version: u32,
    /// Genesis is height 1
    pub height: u64,
    /// Hash of the parent, `None` only for genesis
    pub previous_hash: Option<String>,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Merkle root of the transaction ids, `None` when there are none
    pub merkle_hash: Option<String>,
    /// Hex public key of the node that produced the block
    pub generator_publickey: String,
    /// Set by `seal`
    pub hash: Option<String>,
    /// Signature over `hash`, set by `seal`
    pub block_signature: Option<String>,
    #[serde(default)]
    pub consensus_data: ConsensusData,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create an unsealed candidate on top of `previous`
    pub fn new(previous: &Block, transactions: Vec<Transaction>, generator_publickey: String) -> Self {
        Self {
            version: BLOCK_VERSION,
            height: previous.height.saturating_add(1),
            previous_hash: previous.hash.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            merkle_hash: Self::calculate_merkle_hash(&transactions),
            generator_publickey,
            hash: None,
            block_signature: None,
            consensus_data: ConsensusData::Empty {},
            transactions,
        }
    }

    /// Build the genesis block.
    ///
    /// Every node derives the same block: fixed contents, a key derived from
    /// [`GENESIS_SEED`] and deterministic ECDSA signatures.
    pub fn genesis() -> Result<Self, KeyError> {
        let keypair = KeyPair::from_seed(GENESIS_SEED)?;
        let mut block = Self {
            version: BLOCK_VERSION,
            height: GENESIS_HEIGHT,
            previous_hash: None,
            timestamp: GENESIS_TIMESTAMP,
            merkle_hash: None,
            generator_publickey: keypair.public_key_hex(),
            hash: None,
            block_signature: None,
            consensus_data: ConsensusData::Empty {},
            transactions: Vec::new(),
        };
        block.seal(&keypair)?;
        Ok(block)
    }

    /// Merkle root of the transaction ids
    pub fn calculate_merkle_hash(transactions: &[Transaction]) -> Option<String> {
        let ids: Vec<String> = transactions.iter().map(|tx| tx.id.clone()).collect();
        merkle_root_of_ids(&ids)
    }

    /// Canonical bytes covered by the block hash
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_json(&BlockContent {
            version: self.version,
            height: self.height,
            previous_hash: &self.previous_hash,
            timestamp: self.timestamp,
            merkle_hash: &self.merkle_hash,
            generator_publickey: &self.generator_publickey,
            consensus_data: &self.consensus_data,
            transactions: &self.transactions,
        })
    }

    /// Hash of the canonical bytes
    pub fn compute_hash(&self) -> String {
        sha256_hex(&self.canonical_bytes())
    }

    /// Write the hash, then sign it with the generator key
    pub fn seal(&mut self, keypair: &KeyPair) -> Result<(), KeyError> {
        let hash = self.compute_hash();
        self.block_signature = Some(keypair.sign_hex(hash.as_bytes())?);
        self.hash = Some(hash);
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.hash.is_some() && self.block_signature.is_some()
    }

    /// Stored hash, or the empty string for an unsealed block
    pub fn hash_str(&self) -> &str {
        self.hash.as_deref().unwrap_or_default()
    }

    /// The stored hash matches the contents and is signed by the generator
    pub fn verify_signature(&self) -> bool {
        let (Some(hash), Some(signature)) = (&self.hash, &self.block_signature) else {
            return false;
        };
        *hash == self.compute_hash()
            && verify_hex(&self.generator_publickey, hash.as_bytes(), signature)
    }

    /// The recorded Merkle root matches the transactions
    pub fn verify_merkle_root(&self) -> bool {
        self.merkle_hash == Self::calculate_merkle_hash(&self.transactions)
    }

    /// Whether this block sits directly on top of `parent`
    pub fn extends(&self, parent: &Block) -> bool {
        parent.hash.is_some()
            && self.previous_hash == parent.hash
            && parent.height.checked_add(1) == Some(self.height)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_of(parent: &Block, keypair: &KeyPair) -> Block {
        let coinbase = Transaction::coinbase(&keypair.public_key_hex(), "test coinbase");
        Block::new(parent, vec![coinbase], keypair.public_key_hex())
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis().unwrap();
        let b = Block::genesis().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.height, GENESIS_HEIGHT);
        assert!(a.is_genesis());
        assert!(a.merkle_hash.is_none());
        assert!(a.verify_signature());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let block = child_of(&genesis, &kp);
        assert_eq!(block.compute_hash(), block.clone().compute_hash());

        let mut later = block.clone();
        later.timestamp += 1;
        assert_ne!(block.compute_hash(), later.compute_hash());
    }

    #[test]
    fn test_seal_and_verify() {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = child_of(&genesis, &kp);
        assert!(!block.is_sealed());
        assert!(!block.verify_signature());

        block.seal(&kp).unwrap();
        assert!(block.is_sealed());
        assert!(block.verify_signature());
        assert!(block.verify_merkle_root());
        assert!(block.extends(&genesis));
    }

    #[test]
    fn test_extends_checks_height() {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = child_of(&genesis, &kp);
        block.height = 1_000_000;
        block.seal(&kp).unwrap();
        assert!(!block.extends(&genesis));

        // No successor height exists past u64::MAX
        let mut top = genesis.clone();
        top.height = u64::MAX;
        let mut above = child_of(&top, &kp);
        assert_eq!(above.height, u64::MAX);
        above.seal(&kp).unwrap();
        assert!(!above.extends(&top));
    }

    #[test]
    fn test_signature_requires_generator_key() {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let mut block = child_of(&genesis, &kp);
        block.seal(&other).unwrap();
        assert!(!block.verify_signature());
    }

    #[test]
    fn test_tampering_is_detected() {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = child_of(&genesis, &kp);
        block.seal(&kp).unwrap();

        let mut tampered = block.clone();
        tampered.transactions[0].outputs[0].amount = 5000;
        assert!(!tampered.verify_signature());

        let mut swapped = block.clone();
        swapped.transactions[0] = Transaction::coinbase("thief", "memo");
        assert!(!swapped.verify_merkle_root());
    }

    #[test]
    fn test_consensus_data_shapes() {
        let pow: ConsensusData = serde_json::from_str(r#"{"difficulty":10000,"nonce":7}"#).unwrap();
        assert_eq!(pow, ConsensusData::Pow { difficulty: 10000, nonce: 7 });

        let pos: ConsensusData =
            serde_json::from_str(r#"{"difficulty":5,"timestamp":12,"stake":50}"#).unwrap();
        assert!(matches!(pos, ConsensusData::Pos { stake: 50, .. }));

        let slot: ConsensusData = serde_json::from_str(r#"{"generator_id":3}"#).unwrap();
        assert_eq!(slot, ConsensusData::Slot { generator_id: 3 });

        let empty: ConsensusData = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ConsensusData::Empty {});
        assert_eq!(serde_json::to_string(&empty).unwrap(), "{}");
        assert_eq!(ConsensusData::default(), ConsensusData::Empty {});
    }

    #[test]
    fn test_missing_consensus_data_defaults_to_empty() {
        let genesis = Block::genesis().unwrap();
        let mut value = serde_json::to_value(&genesis).unwrap();
        value.as_object_mut().unwrap().remove("consensus_data");
        let block: Block = serde_json::from_value(value).unwrap();
        assert_eq!(block.consensus_data, ConsensusData::Empty {});
        assert_eq!(block, genesis);
    }
}
