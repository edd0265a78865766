//! ECDSA key management for the blockchain
//!
//! Provides key pair generation, signing, and verification using
//! the secp256k1 elliptic curve (same as Bitcoin). Public keys travel in
//! transactions as compressed SEC1 bytes and signatures as 64-byte compact
//! encodings.

use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::Digest;
use thiserror::Error;

use super::hash::{double_sha256, sha256};

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Message digest must be 32 bytes, got {0}")]
    InvalidDigestLength(usize),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
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

    /// Create a key pair from raw 32-byte private key material
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    /// Compressed public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Base58Check address of the public key
    pub fn address(&self) -> String {
        public_key_to_address(&self.public_key.serialize())
    }

    /// Sign a 32-byte digest with the private key
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_message(&self.secret_key, digest)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Convert serialized public key bytes to an address:
/// `Base58(0x00 ‖ RIPEMD160(SHA256(pubkey)) ‖ checksum)`
pub fn public_key_to_address(public_key: &[u8]) -> String {
    let sha256_hash = sha256(public_key);

    let mut ripemd = Ripemd160::new();
    ripemd.update(&sha256_hash);
    let ripemd_hash = ripemd.finalize();

    // Version byte 0x00
    let mut address_bytes = vec![0x00];
    address_bytes.extend_from_slice(&ripemd_hash);

    let checksum = double_sha256(&address_bytes);
    address_bytes.extend_from_slice(&checksum[..4]);

    bs58::encode(address_bytes).into_string()
}

/// Sign a 32-byte digest with a secret key, returning the compact signature
pub fn sign_message(secret_key: &SecretKey, digest: &[u8]) -> Result<Vec<u8>, KeyError> {
    if digest.len() != 32 {
        return Err(KeyError::InvalidDigestLength(digest.len()));
    }
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest_slice(digest)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a compact signature over a 32-byte digest.
///
/// Malformed keys or signatures are errors; a well-formed signature that does
/// not match yields `Ok(false)`.
pub fn verify_signature(
    public_key: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    if digest.len() != 32 {
        return Err(KeyError::InvalidDigestLength(digest.len()));
    }
    let secp = Secp256k1::verification_only();
    let public_key = PublicKey::from_slice(public_key).map_err(|_| KeyError::InvalidPublicKey)?;
    let signature = Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;
    let message = Message::from_digest_slice(digest)?;

    Ok(secp.verify_ecdsa(&message, &signature, &public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public_key_bytes().len(), 33);
        assert!(!kp.address().is_empty());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let digest = sha256(b"Hello, blockchain!");

        let signature = kp.sign(&digest).unwrap();
        assert!(verify_signature(&kp.public_key_bytes(), &digest, &signature).unwrap());

        let other = sha256(b"something else");
        assert!(!verify_signature(&kp.public_key_bytes(), &other, &signature).unwrap());
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        let kp = KeyPair::generate();
        let digest = sha256(b"msg");
        let signature = kp.sign(&digest).unwrap();

        assert!(verify_signature(&[1, 2, 3], &digest, &signature).is_err());
        assert!(verify_signature(&kp.public_key_bytes(), &digest, &[0u8; 10]).is_err());
        assert!(verify_signature(&kp.public_key_bytes(), b"short", &signature).is_err());
    }

    #[test]
    fn test_key_pair_from_bytes() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_secret_bytes(&kp1.secret_bytes()).unwrap();
        assert_eq!(kp1.public_key_bytes(), kp2.public_key_bytes());
        assert_eq!(kp1.address(), kp2.address());

        let kp3 = KeyPair::from_private_key_hex(&hex::encode(kp1.secret_bytes())).unwrap();
        assert_eq!(kp1.address(), kp3.address());
        assert!(KeyPair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_address_format() {
        let kp = KeyPair::generate();
        // Version byte 0x00 encodes to a leading '1'
        assert!(kp.address().starts_with('1'));
        let decoded = bs58::decode(kp.address()).into_vec().unwrap();
        assert_eq!(decoded.len(), 25);
    }
}
