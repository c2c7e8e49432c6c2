//! Offloadable operations and their payloads.
//!
//! Each operation is one variant of [`CryptoRequest`] with a typed payload
//! and a fixed scheduling priority; the matching [`CryptoResponse`] variant
//! carries its result.

use ecash_core::Amount;
use ecash_core::exchange::RecoupRequest;
use ecash_core::types::{
    DenominationPubKey, EddsaKeyPair, EddsaPrivateKey, EddsaPublicKey, Hash256, Timestamp,
};

/// Number of priority levels. Higher numbers are served first.
pub const NUM_PRIORITY: usize = 5;

#[derive(Clone, Debug)]
pub struct CreatePlanchetRequest {
    pub secret_seed: [u8; 32],
    pub coin_index: u32,
    pub denom_pub: DenominationPubKey,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub reserve_pub: EddsaPublicKey,
    pub reserve_priv: EddsaPrivateKey,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanchetCreationResult {
    pub coin_pub: EddsaPublicKey,
    pub coin_priv: EddsaPrivateKey,
    pub reserve_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub blinding_key: [u8; 32],
    pub withdraw_sig: Vec<u8>,
    pub coin_ev: Vec<u8>,
    pub coin_ev_hash: Hash256,
    pub coin_value: Amount,
}

#[derive(Clone, Debug)]
pub struct UnblindRequest {
    pub blinded_sig: Vec<u8>,
    pub blinding_key: [u8; 32],
    pub denom_pub: DenominationPubKey,
}

#[derive(Clone, Debug)]
pub struct VerifyDenominationSignatureRequest {
    pub coin_pub: EddsaPublicKey,
    pub denom_sig: Vec<u8>,
    pub denom_pub: DenominationPubKey,
}

#[derive(Clone, Debug)]
pub struct DepositPermissionRequest {
    pub coin_priv: EddsaPrivateKey,
    pub coin_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub contract_terms_hash: Hash256,
    pub merchant_pub: EddsaPublicKey,
    pub h_wire: Hash256,
    pub contribution: Amount,
    pub fee_deposit: Amount,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
}

/// One output denomination of a refresh, with its multiplicity.
#[derive(Clone, Debug)]
pub struct RefreshDenomination {
    pub denom_pub: DenominationPubKey,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct DeriveRefreshSessionRequest {
    pub session_secret_seed: [u8; 32],
    pub kappa: usize,
    pub melt_coin_pub: EddsaPublicKey,
    pub melt_coin_priv: EddsaPrivateKey,
    pub melt_coin_denom_pub_hash: Hash256,
    pub new_denoms: Vec<RefreshDenomination>,
    pub fee_refresh: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshPlanchet {
    pub coin_pub: EddsaPublicKey,
    pub coin_priv: EddsaPrivateKey,
    pub blinding_key: [u8; 32],
    pub coin_ev: Vec<u8>,
    pub coin_ev_hash: Hash256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedRefreshSession {
    pub transfer_pubs: Vec<EddsaPublicKey>,
    pub transfer_privs: Vec<EddsaPrivateKey>,
    /// `planchets_for_gammas[i][j]`: new coin `j` of cut-and-choose branch `i`.
    pub planchets_for_gammas: Vec<Vec<RefreshPlanchet>>,
    /// Commitment over every branch.
    pub rc: Hash256,
    pub confirm_sig: Vec<u8>,
    pub melt_value_with_fee: Amount,
}

#[derive(Clone, Debug)]
pub struct SignCoinLinkRequest {
    pub old_coin_priv: EddsaPrivateKey,
    pub old_coin_pub: EddsaPublicKey,
    pub new_denom_hash: Hash256,
    pub transfer_pub: EddsaPublicKey,
    pub coin_ev: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct CreateRecoupRequest {
    pub coin_priv: EddsaPrivateKey,
    pub coin_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub denom_sig: Vec<u8>,
    pub blinding_key: [u8; 32],
    pub refreshed: bool,
}

/// Every operation the workers implement.
#[derive(Clone, Debug)]
pub enum CryptoRequest {
    CreatePlanchet(CreatePlanchetRequest),
    HashString(String),
    CreateEddsaKeypair,
    CreateRecoupRequest(CreateRecoupRequest),
    SignDepositPermission(DepositPermissionRequest),
    UnblindSignature(UnblindRequest),
    VerifyDenominationSignature(VerifyDenominationSignatureRequest),
    DeriveRefreshSession(DeriveRefreshSessionRequest),
    SignCoinLink(SignCoinLinkRequest),
}

impl CryptoRequest {
    pub fn priority(&self) -> usize {
        match self {
            CryptoRequest::CreatePlanchet(_)
            | CryptoRequest::HashString(_)
            | CryptoRequest::CreateEddsaKeypair
            | CryptoRequest::CreateRecoupRequest(_) => 1,
            CryptoRequest::SignDepositPermission(_) => 3,
            CryptoRequest::UnblindSignature(_)
            | CryptoRequest::VerifyDenominationSignature(_)
            | CryptoRequest::DeriveRefreshSession(_)
            | CryptoRequest::SignCoinLink(_) => 4,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            CryptoRequest::CreatePlanchet(_) => "create_planchet",
            CryptoRequest::HashString(_) => "hash_string",
            CryptoRequest::CreateEddsaKeypair => "create_eddsa_keypair",
            CryptoRequest::CreateRecoupRequest(_) => "create_recoup_request",
            CryptoRequest::SignDepositPermission(_) => "sign_deposit_permission",
            CryptoRequest::UnblindSignature(_) => "unblind_signature",
            CryptoRequest::VerifyDenominationSignature(_) => "verify_denomination_signature",
            CryptoRequest::DeriveRefreshSession(_) => "derive_refresh_session",
            CryptoRequest::SignCoinLink(_) => "sign_coin_link",
        }
    }
}

#[derive(Clone, Debug)]
pub enum CryptoResponse {
    Planchet(PlanchetCreationResult),
    Hash(Hash256),
    KeyPair(EddsaKeyPair),
    RecoupRequest(RecoupRequest),
    Signature(Vec<u8>),
    Verified(bool),
    RefreshSession(DerivedRefreshSession),
}

impl CryptoResponse {
    pub fn variant_name(&self) -> &'static str {
        match self {
            CryptoResponse::Planchet(_) => "planchet",
            CryptoResponse::Hash(_) => "hash",
            CryptoResponse::KeyPair(_) => "key_pair",
            CryptoResponse::RecoupRequest(_) => "recoup_request",
            CryptoResponse::Signature(_) => "signature",
            CryptoResponse::Verified(_) => "verified",
            CryptoResponse::RefreshSession(_) => "refresh_session",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_fit_queue_count() {
        let reqs = [
            CryptoRequest::HashString("x".into()),
            CryptoRequest::CreateEddsaKeypair,
            CryptoRequest::UnblindSignature(UnblindRequest {
                blinded_sig: vec![],
                blinding_key: [0; 32],
                denom_pub: DenominationPubKey::eddsa(EddsaPublicKey([0; 32])),
            }),
        ];
        for r in &reqs {
            assert!(r.priority() < NUM_PRIORITY, "{}", r.operation());
        }
        assert!(reqs[2].priority() > reqs[0].priority());
    }
}
