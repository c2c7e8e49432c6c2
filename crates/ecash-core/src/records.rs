//! Records persisted in the wallet database.
//!
//! Every lifecycle record (withdrawal, refresh, recoup and deposit groups,
//! plus reserves) carries the same bookkeeping trio: `retry_info`,
//! `last_error` and a `frozen` flag. A record is terminal once its finish
//! timestamp is set, at which point the bookkeeping fields are cleared.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::ErrorDetails;
use crate::retry::RetryInfo;
use crate::types::{
    DenominationPubKey, DepositGroupId, EddsaPrivateKey, EddsaPublicKey, Hash256, RecoupGroupId,
    RefreshGroupId, Timestamp, WithdrawalGroupId,
};

/// Whether a coin may still be selected for payments.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum CoinStatus {
    Fresh,
    /// Spent, being refreshed or recouped. Kept for audit.
    Dormant,
}

/// How a coin came into the wallet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum CoinSource {
    Withdraw {
        withdrawal_group_id: WithdrawalGroupId,
        coin_index: u32,
        reserve_pub: EddsaPublicKey,
    },
    Refresh {
        old_coin_pub: EddsaPublicKey,
    },
}

/// Which spend a coin was allocated to, and for how much.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CoinAllocation {
    pub id: String,
    pub amount: Amount,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CoinRecord {
    pub coin_pub: EddsaPublicKey,
    pub coin_priv: EddsaPrivateKey,
    pub exchange_base_url: String,
    pub denom_pub: DenominationPubKey,
    pub denom_pub_hash: Hash256,
    /// Unblinded denomination signature over the coin.
    pub denom_sig: Vec<u8>,
    pub blinding_key: [u8; 32],
    pub coin_ev_hash: Hash256,
    pub current_amount: Amount,
    pub status: CoinStatus,
    pub coin_source: CoinSource,
    pub allocation: Option<CoinAllocation>,
    pub suspended: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum DenominationVerificationStatus {
    Unverified,
    VerifiedGood,
    VerifiedBad,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DenominationRecord {
    pub exchange_base_url: String,
    pub denom_pub: DenominationPubKey,
    pub denom_pub_hash: Hash256,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub fee_refund: Amount,
    pub stamp_start: Timestamp,
    pub stamp_expire_withdraw: Timestamp,
    pub stamp_expire_deposit: Timestamp,
    pub is_offered: bool,
    pub is_revoked: bool,
    pub verification_status: DenominationVerificationStatus,
}

impl DenominationRecord {
    /// Usable for new coins at `now`.
    pub fn is_withdrawable(&self, now: Timestamp) -> bool {
        self.is_offered
            && !self.is_revoked
            && self.verification_status != DenominationVerificationStatus::VerifiedBad
            && self.stamp_start <= now
            && now < self.stamp_expire_withdraw
    }

    /// Coins of this denomination can still be deposited at `now`.
    pub fn is_depositable(&self, now: Timestamp) -> bool {
        !self.is_revoked && now < self.stamp_expire_deposit
    }
}

/// Wire transfer fee for one method over a validity window.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct WireFee {
    pub wire_method: String,
    pub fee: Amount,
    pub closing_fee: Amount,
    pub start_stamp: Timestamp,
    pub end_stamp: Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExchangeRecord {
    pub base_url: String,
    pub currency: String,
    pub master_pub: EddsaPublicKey,
    pub wire_fees: Vec<WireFee>,
    pub last_update: Option<Timestamp>,
}

impl ExchangeRecord {
    /// Wire fee in force for `wire_method` at `now`.
    pub fn wire_fee_at(&self, wire_method: &str, now: Timestamp) -> Option<&Amount> {
        self.wire_fees
            .iter()
            .find(|f| f.wire_method == wire_method && f.start_stamp <= now && now < f.end_stamp)
            .map(|f| &f.fee)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum ReserveStatus {
    /// Balance must be (re)queried from the exchange.
    QueryingStatus,
    Dormant,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ReserveRecord {
    pub reserve_pub: EddsaPublicKey,
    pub reserve_priv: EddsaPrivateKey,
    pub exchange_base_url: String,
    pub currency: String,
    pub status: ReserveStatus,
    pub timestamp_created: Timestamp,
    pub last_balance: Option<Amount>,
    pub initial_withdrawal_group_id: Option<WithdrawalGroupId>,
    pub retry_info: Option<RetryInfo>,
    pub last_error: Option<ErrorDetails>,
    pub frozen: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SelectedDenomination {
    pub denom_pub_hash: Hash256,
    pub count: u32,
}

/// A multiset of denominations chosen for withdrawal or refresh output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DenominationSelection {
    pub selected: Vec<SelectedDenomination>,
    pub total_coin_value: Amount,
    pub total_withdraw_cost: Amount,
}

impl DenominationSelection {
    pub fn coin_count(&self) -> u32 {
        self.selected.iter().map(|s| s.count).sum()
    }

    /// Denomination hash of every coin, in selection order.
    pub fn expand(&self) -> Vec<Hash256> {
        self.selected
            .iter()
            .flat_map(|s| std::iter::repeat_n(s.denom_pub_hash, s.count as usize))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct WithdrawalGroupRecord {
    pub withdrawal_group_id: WithdrawalGroupId,
    pub reserve_pub: EddsaPublicKey,
    pub exchange_base_url: String,
    pub secret_seed: [u8; 32],
    pub raw_withdrawal_amount: Amount,
    pub denoms_sel: DenominationSelection,
    pub timestamp_start: Timestamp,
    pub timestamp_finish: Option<Timestamp>,
    pub retry_info: Option<RetryInfo>,
    pub last_error: Option<ErrorDetails>,
    pub frozen: bool,
}

/// A coin being withdrawn, before the exchange signed it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PlanchetRecord {
    pub coin_pub: EddsaPublicKey,
    pub coin_priv: EddsaPrivateKey,
    pub withdrawal_group_id: WithdrawalGroupId,
    pub coin_idx: u32,
    pub withdrawal_done: bool,
    pub denom_pub: DenominationPubKey,
    pub denom_pub_hash: Hash256,
    pub blinding_key: [u8; 32],
    pub withdraw_sig: Vec<u8>,
    pub coin_ev: Vec<u8>,
    pub coin_ev_hash: Hash256,
    pub coin_value: Amount,
    pub reserve_pub: EddsaPublicKey,
    pub last_error: Option<ErrorDetails>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum RefreshCoinStatus {
    Pending,
    Finished,
    /// The exchange refused the coin; no automatic retry.
    Frozen,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum RefreshReason {
    Pay,
    Recoup,
    Manual,
    Scheduled,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RefreshSessionRecord {
    pub session_secret_seed: [u8; 32],
    pub new_denoms: Vec<SelectedDenomination>,
    pub amount_refresh_output: Amount,
    /// Set once the melt was accepted.
    pub noreveal_index: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RefreshGroupRecord {
    pub refresh_group_id: RefreshGroupId,
    pub reason: RefreshReason,
    pub old_coin_pubs: Vec<EddsaPublicKey>,
    pub input_per_coin: Vec<Amount>,
    pub estimated_output_per_coin: Vec<Amount>,
    pub status_per_coin: Vec<RefreshCoinStatus>,
    pub refresh_sessions: Vec<Option<RefreshSessionRecord>>,
    pub last_error_per_coin: Vec<Option<ErrorDetails>>,
    pub timestamp_created: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
    pub retry_info: Option<RetryInfo>,
    pub last_error: Option<ErrorDetails>,
    pub frozen: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RecoupGroupRecord {
    pub recoup_group_id: RecoupGroupId,
    pub coin_pubs: Vec<EddsaPublicKey>,
    pub recoup_finished_per_coin: Vec<bool>,
    /// Value each coin had before it was zeroed for recoup.
    pub old_amount_per_coin: Vec<Option<Amount>>,
    pub schedule_refresh_coins: Vec<EddsaPublicKey>,
    pub timestamp_started: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
    pub retry_info: Option<RetryInfo>,
    pub last_error: Option<ErrorDetails>,
    pub frozen: bool,
}

/// Coins chosen to pay an amount, with each coin's contribution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PayCoinSelection {
    pub payment_amount: Amount,
    pub coin_pubs: Vec<EddsaPublicKey>,
    pub coin_contributions: Vec<Amount>,
    pub customer_wire_fees: Amount,
    pub customer_deposit_fees: Amount,
}

/// Terms under which a deposit group pays into a bank account.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DepositContractTerms {
    pub amount: Amount,
    pub max_deposit_fee: Amount,
    pub max_wire_fee: Amount,
    pub wire_fee_amortization: u32,
    pub wire_method: String,
    pub h_wire: Hash256,
    pub merchant_pub: EddsaPublicKey,
    pub exchanges: Vec<String>,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
    pub nonce: EddsaPublicKey,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct WireInfo {
    pub payto_uri: String,
    pub salt: Hash256,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DepositGroupRecord {
    pub deposit_group_id: DepositGroupId,
    pub contract_terms: DepositContractTerms,
    pub contract_terms_hash: Hash256,
    pub merchant_priv: EddsaPrivateKey,
    pub wire: WireInfo,
    pub amount: Amount,
    pub total_pay_cost: Amount,
    pub effective_deposit_amount: Amount,
    pub pay_coin_selection: PayCoinSelection,
    pub deposited_per_coin: Vec<bool>,
    pub timestamp_created: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
    pub retry_info: Option<RetryInfo>,
    pub last_error: Option<ErrorDetails>,
    pub frozen: bool,
}
