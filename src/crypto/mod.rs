//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and numeric hash prefixes
//! - ECDSA key management (secp256k1)
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{hash_prefix, sha256, sha256_hex};
pub use keys::{
    public_key_from_hex, sign_message, verify_hex, verify_signature, KeyError, KeyPair,
};
pub use merkle::{calculate_merkle_root, merkle_root_of_ids};
