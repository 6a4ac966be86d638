//! ECDSA key management for the ledger
//!
//! Provides key pair generation, signing, and verification using
//! the secp256k1 elliptic curve. Node identities and block proposers
//! are referred to by the hex encoding of their compressed public key.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::sha256;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Derive a key pair deterministically from a seed phrase.
    ///
    /// The secret key is the SHA-256 of the phrase, so every node that knows
    /// the phrase derives the same identity (this is how the genesis key is shared).
    pub fn from_seed(seed: &str) -> Result<Self, KeyError> {
        let secret_key =
            SecretKey::from_slice(&sha256(seed.as_bytes())).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Sign a message with the private key
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_message(&self.secret_key, message)
    }

    /// Sign a message and hex-encode the compact signature
    pub fn sign_hex(&self, message: &[u8]) -> Result<String, KeyError> {
        Ok(hex::encode(self.sign(message)?))
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_signature(&self.public_key, message, signature)
    }
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Reduce arbitrary message bytes to the 32-byte digest secp256k1 signs.
fn message_digest(message: &[u8]) -> Result<Message, KeyError> {
    let hash = if message.len() == 32 {
        message.to_vec()
    } else {
        sha256(message)
    };
    Ok(Message::from_digest_slice(&hash)?)
}

/// Sign a message with a secret key
pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::new();
    let digest = message_digest(message)?;
    let signature = secp.sign_ecdsa(&digest, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a signature against a public key
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();
    let digest = message_digest(message)?;
    let sig = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&digest, &sig, public_key).is_ok())
}

/// Verify a hex signature against a hex public key.
///
/// Any decoding failure counts as an invalid signature.
pub fn verify_hex(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(public_key) = public_key_from_hex(public_key_hex) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    verify_signature(&public_key, message, &signature).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.private_key_hex().len(), 64);
        assert_eq!(kp.public_key_hex().len(), 66);
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let message = b"Hello, ledger!";

        let signature = kp.sign(message).unwrap();
        assert!(kp.verify(message, &signature).unwrap());
        assert!(!kp.verify(b"Hello, other ledger!", &signature).unwrap());
    }

    #[test]
    fn test_seeded_keys_are_deterministic() {
        let a = KeyPair::from_seed("I am genesis!").unwrap();
        let b = KeyPair::from_seed("I am genesis!").unwrap();
        let c = KeyPair::from_seed("I am tester!").unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        assert_ne!(a.public_key_hex(), c.public_key_hex());
    }

    #[test]
    fn test_verify_hex_with_wrong_key() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = signer.sign_hex(b"payload").unwrap();

        assert!(verify_hex(&signer.public_key_hex(), b"payload", &sig));
        assert!(!verify_hex(&other.public_key_hex(), b"payload", &sig));
        assert!(!verify_hex("not-hex", b"payload", &sig));
        assert!(!verify_hex(&signer.public_key_hex(), b"payload", "00ff"));
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_private_key_hex(&kp1.private_key_hex()).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
    }
}
