//! crypto helpers for afo-budget: hashing + ed25519 vote signatures
use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use sha3::{Digest, Sha3_256};

use crate::types::Hash;

/// compute sha3-256 raw bytes (32 bytes)
pub fn sha3_256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let sum = hasher.finalize();
    sum.into()
}

/// compute sha3-256 and return as Hash type
pub fn sha3_256(data: &[u8]) -> Hash {
    Hash::from_bytes(sha3_256_bytes(data))
}

/// Identity hash of a serializable value: sha3-256 over its bincode encoding.
/// Used for proposal / finalized-budget / vote identity hashes, so the field
/// order of the hashed tuples is consensus-critical.
pub fn hash_object<T: Serialize>(value: &T) -> Result<Hash> {
    let bytes = bincode::serialize(value)?;
    Ok(sha3_256(&bytes))
}

/// Generate an ed25519 keypair, returned as (public, secret) byte vectors.
pub fn generate_keypair_bytes() -> (Vec<u8>, Vec<u8>) {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    (
        signing.verifying_key().to_bytes().to_vec(),
        signing.to_bytes().to_vec(),
    )
}

pub fn public_key_from_secret(secret: &[u8]) -> Result<Vec<u8>> {
    let signing = signing_key_from_bytes(secret)?;
    Ok(signing.verifying_key().to_bytes().to_vec())
}

/// Sign message with secret key bytes; returns raw signature bytes.
pub fn sign_with_secret_key(secret: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let signing = signing_key_from_bytes(secret)?;
    Ok(signing.sign(msg).to_bytes().to_vec())
}

/// Verify signature given public key bytes, message, and signature bytes.
pub fn verify_signature(pubkey_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<bool> {
    let pk: [u8; 32] = pubkey_bytes
        .try_into()
        .map_err(|_| anyhow!("invalid ed25519 public key length: {}", pubkey_bytes.len()))?;
    let verifying = VerifyingKey::from_bytes(&pk)
        .map_err(|e| anyhow!("invalid ed25519 public key: {}", e))?;
    let sig: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| anyhow!("invalid ed25519 signature length: {}", sig_bytes.len()))?;
    let signature = Signature::from_bytes(&sig);
    Ok(verifying.verify(msg, &signature).is_ok())
}

fn signing_key_from_bytes(secret: &[u8]) -> Result<SigningKey> {
    let sk: [u8; 32] = secret
        .try_into()
        .map_err(|_| anyhow!("invalid ed25519 secret key length: {}", secret.len()))?;
    Ok(SigningKey::from_bytes(&sk))
}
