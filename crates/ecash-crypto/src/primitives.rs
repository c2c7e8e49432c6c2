//! Ed25519, SHA-256 and BLAKE3 building blocks.

use ed25519_dalek::{Signer, Verifier};
use sha2::{Digest, Sha256};

use ecash_core::types::{EddsaKeyPair, EddsaPrivateKey, EddsaPublicKey, Hash256};

/// Signature purposes, mixed into every signed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Purpose {
    Withdraw = 1200,
    Deposit = 1201,
    Melt = 1202,
    CoinLink = 1204,
    Recoup = 1210,
}

pub fn keypair_from_secret(secret: [u8; 32]) -> EddsaKeyPair {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
    EddsaKeyPair {
        pub_key: EddsaPublicKey(signing_key.verifying_key().to_bytes()),
        priv_key: EddsaPrivateKey(secret),
    }
}

pub fn random_keypair() -> EddsaKeyPair {
    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    keypair_from_secret(signing_key.to_bytes())
}

pub fn sign(priv_key: &EddsaPrivateKey, message: &[u8]) -> Vec<u8> {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(priv_key.as_bytes());
    signing_key.sign(message).to_bytes().to_vec()
}

pub fn verify(pub_key: &EddsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(pub_key.as_bytes()) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(message, &sig).is_ok()
}

pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256(Sha256::digest(data).into())
}

/// Envelope submitted to the exchange for signing.
///
/// Blinding is opaque to this crate, so the envelope is the SHA-256 of the
/// coin public key and the exchange signs it directly.
pub fn coin_envelope(coin_pub: &EddsaPublicKey) -> Vec<u8> {
    sha256(coin_pub.as_bytes()).0.to_vec()
}

/// Derive 32 secret bytes from `parts` under a BLAKE3 KDF context.
pub fn derive_secret(context: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut ikm = Vec::new();
    for p in parts {
        ikm.extend_from_slice(p);
    }
    blake3::derive_key(context, &ikm)
}

/// Digest that gets signed for `purpose`. Each part is length-prefixed.
pub fn signed_message(purpose: Purpose, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(purpose as u32).to_be_bytes());
    for p in parts {
        hasher.update(&(p.len() as u32).to_be_bytes());
        hasher.update(p);
    }
    *hasher.finalize().as_bytes()
}
