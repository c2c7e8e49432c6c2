//! Interface to the exchange (issuing and redeeming service).
//!
//! The HTTP transport and the wire-level JSON schemas live outside this
//! workspace. The wallet only talks to an [`ExchangeClient`], which maps
//! these request/response types onto whatever transport is in use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::ExchangeError;
use crate::types::{EddsaPrivateKey, EddsaPublicKey, Hash256, Timestamp};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReserveStatusResponse {
    pub balance: Amount,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WithdrawRequest {
    pub reserve_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub coin_ev: Vec<u8>,
    pub reserve_sig: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WithdrawResponse {
    /// Blinded denomination signature over `coin_ev`.
    pub ev_sig: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DepositRequest {
    pub coin_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub ub_sig: Vec<u8>,
    pub contribution: Amount,
    pub merchant_pub: EddsaPublicKey,
    pub h_contract_terms: Hash256,
    pub h_wire: Hash256,
    pub payto_uri: String,
    pub wire_salt: Hash256,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
    pub coin_sig: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DepositResponse {
    pub exchange_sig: Vec<u8>,
    pub exchange_pub: EddsaPublicKey,
    pub exchange_timestamp: Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MeltRequest {
    pub coin_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub denom_sig: Vec<u8>,
    pub confirm_sig: Vec<u8>,
    pub value_with_fee: Amount,
    pub rc: Hash256,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MeltResponse {
    pub noreveal_index: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RevealRequest {
    pub rc: Hash256,
    pub old_coin_pub: EddsaPublicKey,
    /// Transfer public key of the cut-and-choose branch kept secret.
    pub transfer_pub: EddsaPublicKey,
    /// Transfer secrets of every other branch, in branch order.
    pub transfer_privs: Vec<EddsaPrivateKey>,
    pub new_denoms_h: Vec<Hash256>,
    pub coin_evs: Vec<Vec<u8>>,
    pub link_sigs: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RevealResponse {
    pub ev_sigs: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RecoupRequest {
    pub coin_pub: EddsaPublicKey,
    pub denom_pub_hash: Hash256,
    pub denom_sig: Vec<u8>,
    pub coin_blind_key_secret: [u8; 32],
    pub coin_sig: Vec<u8>,
    pub refreshed: bool,
}

/// Exactly one of the two fields is expected, depending on coin origin.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RecoupResponse {
    pub reserve_pub: Option<EddsaPublicKey>,
    pub old_coin_pub: Option<EddsaPublicKey>,
}

/// Network operations against an exchange.
///
/// Implementations must be safe to call concurrently. Timeouts are applied
/// by the caller; an implementation may still report its own
/// [`ExchangeError::Timeout`].
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn reserve_status(
        &self,
        exchange_base_url: &str,
        reserve_pub: &EddsaPublicKey,
    ) -> Result<ReserveStatusResponse, ExchangeError>;

    async fn withdraw(
        &self,
        exchange_base_url: &str,
        req: &WithdrawRequest,
    ) -> Result<WithdrawResponse, ExchangeError>;

    async fn deposit(
        &self,
        exchange_base_url: &str,
        req: &DepositRequest,
    ) -> Result<DepositResponse, ExchangeError>;

    /// Answer [`ExchangeError::CoinNotFound`] when the exchange does not know
    /// the coin being melted.
    async fn melt(&self, exchange_base_url: &str, req: &MeltRequest)
    -> Result<MeltResponse, ExchangeError>;

    async fn reveal(
        &self,
        exchange_base_url: &str,
        req: &RevealRequest,
    ) -> Result<RevealResponse, ExchangeError>;

    async fn recoup(
        &self,
        exchange_base_url: &str,
        req: &RecoupRequest,
    ) -> Result<RecoupResponse, ExchangeError>;
}
