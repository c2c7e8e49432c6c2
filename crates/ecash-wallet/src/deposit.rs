//! Deposit groups: paying wallet funds into a bank account through the
//! exchange, with the wallet acting as its own merchant.

use std::collections::BTreeSet;

use ecash_core::exchange::DepositRequest;
use ecash_core::records::{
    CoinRecord, DenominationRecord, DepositContractTerms, DepositGroupRecord, ExchangeRecord, PayCoinSelection,
    RefreshReason, WireInfo,
};
use ecash_core::{Amount, DepositGroupId, ErrorCode, ErrorDetails, Hash256, RetryInfo, Timestamp};
use ecash_crypto::ops::DepositPermissionRequest;
use ecash_store::{IndexName, ReadWrite, StoreName, Tx};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coin_selection::{PayCoinSelectionRequest, get_candidate_pay_coins, select_pay_coins};
use crate::error::WalletError;
use crate::notifications::WalletNotification;
use crate::refresh::get_total_refresh_cost;
use crate::spend::apply_coin_spend;
use crate::task::{TaskId, TaskOutcome, clear_retry, first_error};
use crate::wallet::Wallet;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateDepositGroupRequest {
    pub amount: Amount,
    /// Target account, e.g. `payto://iban/DE00...`.
    pub deposit_payto_uri: String,
}

/// Wire method of a payto URI: its authority component.
fn wire_method_of(payto_uri: &str) -> Option<&str> {
    let rest = payto_uri.strip_prefix("payto://")?;
    let method = rest.split(['/', '?']).next()?;
    (!method.is_empty()).then_some(method)
}

struct DepositCosts {
    total_pay_cost: Amount,
    effective_deposit_amount: Amount,
}

/// What the selection costs the wallet, and what reaches the account.
fn deposit_costs(
    tx: &Tx<'_, ReadWrite>,
    sel: &PayCoinSelection,
    wire_method: &str,
    now: Timestamp,
) -> Result<DepositCosts, WalletError> {
    let currency = sel.payment_amount.currency.clone();
    let mut total_pay_cost = Amount::zero(currency.clone());
    let mut deposited = Amount::zero(currency.clone());
    let mut exchanges = BTreeSet::new();

    for (coin_pub, contribution) in sel.coin_pubs.iter().zip(&sel.coin_contributions) {
        let coin = tx
            .get::<CoinRecord>(coin_pub)?
            .ok_or_else(|| WalletError::invariant(format!("coin {coin_pub} not found")))?;
        let denom = tx
            .get::<DenominationRecord>(&(coin.exchange_base_url.clone(), coin.denom_pub_hash))?
            .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", coin.denom_pub_hash)))?;
        let denoms = tx
            .index::<DenominationRecord>(IndexName::DenominationsByBaseUrl, coin.exchange_base_url.as_bytes())?
            .to_vec()?;
        let left = coin.current_amount.saturating_sub(contribution)?;
        let refresh_cost = get_total_refresh_cost(&denoms, &denom, &left, now)?;
        total_pay_cost = total_pay_cost.saturating_add(contribution)?.saturating_add(&refresh_cost)?;
        deposited = deposited.saturating_add(&contribution.saturating_sub(&denom.fee_deposit)?)?;
        exchanges.insert(coin.exchange_base_url);
    }

    let mut wire_fees = Amount::zero(currency);
    for url in &exchanges {
        let exchange = tx
            .get::<ExchangeRecord>(url)?
            .ok_or_else(|| WalletError::invariant(format!("exchange {url} not found")))?;
        if let Some(fee) = exchange.wire_fee_at(wire_method, now) {
            wire_fees = wire_fees.saturating_add(fee)?;
        }
    }
    Ok(DepositCosts {
        total_pay_cost,
        effective_deposit_amount: deposited.saturating_sub(&wire_fees)?,
    })
}

fn random_hash() -> Hash256 {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Hash256(bytes)
}

impl Wallet {
    /// Select and debit coins for a deposit of `req.amount`.
    ///
    /// All coin state changes happen in one transaction together with the
    /// new group, so a crash cannot leave debited coins without a deposit.
    pub async fn create_deposit_group(&self, req: CreateDepositGroupRequest) -> Result<DepositGroupId, WalletError> {
        let wire_method = wire_method_of(&req.deposit_payto_uri)
            .ok_or_else(|| WalletError::InvalidRequest(format!("malformed payto URI {}", req.deposit_payto_uri)))?
            .to_string();
        let currency = req.amount.currency.clone();
        let exchanges: Vec<String> = self.db.run_read_only(&[StoreName::Exchanges], |tx| {
            tx.iter::<ExchangeRecord>()?
                .filter_records(|e| e.currency == currency)
                .map(|v| v.into_iter().map(|e| e.base_url).collect())
        })?;
        if exchanges.is_empty() {
            return Err(WalletError::InsufficientFunds);
        }

        let merchant = self.crypto.create_eddsa_keypair().await?;
        let nonce = self.crypto.create_eddsa_keypair().await?;
        let wire_salt = random_hash();
        let h_wire = self
            .crypto
            .hash_string(format!("{}{}", req.deposit_payto_uri, wire_salt))
            .await?;
        let now = Timestamp::now();
        let contract_terms = DepositContractTerms {
            amount: req.amount.clone(),
            max_deposit_fee: req.amount.clone(),
            max_wire_fee: req.amount.clone(),
            wire_fee_amortization: 1,
            wire_method: wire_method.clone(),
            h_wire,
            merchant_pub: merchant.pub_key,
            exchanges: exchanges.clone(),
            timestamp: now,
            refund_deadline: now,
            wire_transfer_deadline: now,
            nonce: nonce.pub_key,
        };
        let canonical = serde_json::to_string(&contract_terms)
            .map_err(|e| WalletError::invariant(format!("contract terms not serializable: {e}")))?;
        let contract_terms_hash = self.crypto.hash_string(canonical).await?;

        let id = DepositGroupId::random();
        let scope = [
            StoreName::Exchanges,
            StoreName::Denominations,
            StoreName::Coins,
            StoreName::RefreshGroups,
            StoreName::DepositGroups,
        ];
        let (group, refresh_group_id) = self.db.run_read_write(&scope, |tx| {
            let candidates = get_candidate_pay_coins(tx, &currency, &exchanges, &wire_method, now)?;
            let selection = select_pay_coins(&PayCoinSelectionRequest {
                candidates: candidates.candidates,
                wire_fees_per_exchange: candidates.wire_fees_per_exchange,
                contract_amount: req.amount.clone(),
                max_deposit_fee: contract_terms.max_deposit_fee.clone(),
                max_wire_fee: contract_terms.max_wire_fee.clone(),
                wire_fee_amortization: contract_terms.wire_fee_amortization,
                previous_selection: Vec::new(),
            })?
            .ok_or(WalletError::InsufficientFunds)?;

            let costs = deposit_costs(tx, &selection, &wire_method, now)?;
            let refresh_group_id =
                apply_coin_spend(tx, &selection, &format!("deposit-group:{id}"), RefreshReason::Pay, now)?;
            let group = DepositGroupRecord {
                deposit_group_id: id,
                contract_terms: contract_terms.clone(),
                contract_terms_hash,
                merchant_priv: merchant.priv_key.clone(),
                wire: WireInfo { payto_uri: req.deposit_payto_uri.clone(), salt: wire_salt },
                amount: req.amount.clone(),
                total_pay_cost: costs.total_pay_cost,
                effective_deposit_amount: costs.effective_deposit_amount,
                deposited_per_coin: vec![false; selection.coin_pubs.len()],
                pay_coin_selection: selection,
                timestamp_created: now,
                timestamp_finished: None,
                retry_info: Some(RetryInfo::initial(now)),
                last_error: None,
                frozen: false,
            };
            tx.add(&group)?;
            Ok::<_, WalletError>((group, refresh_group_id))
        })?;

        info!(
            group = %id,
            amount = %group.amount,
            cost = %group.total_pay_cost,
            effective = %group.effective_deposit_amount,
            coins = group.pay_coin_selection.coin_pubs.len(),
            refresh_group = %refresh_group_id,
            "created deposit group"
        );
        Ok(id)
    }

    pub async fn process_deposit_group(&self, id: DepositGroupId, force_now: bool) -> Result<TaskOutcome, WalletError> {
        self.run_task::<DepositGroupRecord, _, _>(id, TaskId::Deposit(id), force_now, || self.deposit_step(id)).await
    }

    async fn deposit_step(&self, id: DepositGroupId) -> Result<TaskOutcome, WalletError> {
        let scope = [StoreName::DepositGroups, StoreName::Coins, StoreName::Denominations];
        let (group, coins) = self.db.run_read_only(&scope, |tx| {
            let group = tx
                .get::<DepositGroupRecord>(&id)?
                .ok_or_else(|| WalletError::invariant(format!("deposit group {id} not found")))?;
            let mut coins = Vec::with_capacity(group.pay_coin_selection.coin_pubs.len());
            for coin_pub in &group.pay_coin_selection.coin_pubs {
                let coin = tx
                    .get::<CoinRecord>(coin_pub)?
                    .ok_or_else(|| WalletError::invariant(format!("coin {coin_pub} not found")))?;
                let denom = tx
                    .get::<DenominationRecord>(&(coin.exchange_base_url.clone(), coin.denom_pub_hash))?
                    .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", coin.denom_pub_hash)))?;
                coins.push((coin, denom.fee_deposit));
            }
            Ok::<_, WalletError>((group, coins))
        })?;

        let mut results = Vec::new();
        for (i, (coin, fee_deposit)) in coins.into_iter().enumerate() {
            if group.deposited_per_coin[i] {
                continue;
            }
            results.push(self.deposit_coin(&group, i, coin, fee_deposit).await);
        }
        self.finish_deposit(id, results)
    }

    async fn deposit_coin(
        &self,
        group: &DepositGroupRecord,
        coin_index: usize,
        coin: CoinRecord,
        fee_deposit: Amount,
    ) -> Result<(), WalletError> {
        let terms = &group.contract_terms;
        let contribution = group.pay_coin_selection.coin_contributions[coin_index].clone();
        let coin_sig = self
            .crypto
            .sign_deposit_permission(DepositPermissionRequest {
                coin_priv: coin.coin_priv.clone(),
                coin_pub: coin.coin_pub,
                denom_pub_hash: coin.denom_pub_hash,
                contract_terms_hash: group.contract_terms_hash,
                merchant_pub: terms.merchant_pub,
                h_wire: terms.h_wire,
                contribution: contribution.clone(),
                fee_deposit,
                timestamp: terms.timestamp,
                refund_deadline: terms.refund_deadline,
                wire_transfer_deadline: terms.wire_transfer_deadline,
            })
            .await?;
        let req = DepositRequest {
            coin_pub: coin.coin_pub,
            denom_pub_hash: coin.denom_pub_hash,
            ub_sig: coin.denom_sig.clone(),
            contribution,
            merchant_pub: terms.merchant_pub,
            h_contract_terms: group.contract_terms_hash,
            h_wire: terms.h_wire,
            payto_uri: group.wire.payto_uri.clone(),
            wire_salt: group.wire.salt,
            timestamp: terms.timestamp,
            refund_deadline: terms.refund_deadline,
            wire_transfer_deadline: terms.wire_transfer_deadline,
            coin_sig,
        };
        self.exchange_call(self.exchange.deposit(&coin.exchange_base_url, &req)).await?;

        let id = group.deposit_group_id;
        self.db.run_read_write(&[StoreName::DepositGroups], |tx| {
            let Some(mut g) = tx.get::<DepositGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("deposit group {id} vanished")));
            };
            g.deposited_per_coin[coin_index] = true;
            tx.put(&g)?;
            Ok(())
        })?;
        debug!(group = %id, coin_index, coin = %coin.coin_pub, "coin deposited");
        Ok(())
    }

    fn finish_deposit(&self, id: DepositGroupId, results: Vec<Result<(), WalletError>>) -> Result<TaskOutcome, WalletError> {
        let now = Timestamp::now();
        let finished = self.db.run_read_write(&[StoreName::DepositGroups], |tx| {
            let Some(mut g) = tx.get::<DepositGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("deposit group {id} vanished")));
            };
            if g.timestamp_finished.is_some() {
                return Ok(true);
            }
            if !g.deposited_per_coin.iter().all(|d| *d) {
                return Ok(false);
            }
            g.timestamp_finished = Some(now);
            clear_retry(&mut g);
            tx.put(&g)?;
            Ok(true)
        })?;

        if finished {
            info!(group = %id, "deposit group finished");
            self.notifier.notify(WalletNotification::DepositFinished { deposit_group_id: id });
            return Ok(TaskOutcome::Finished);
        }
        Err(first_error(results).unwrap_or_else(|| {
            WalletError::Transient(ErrorDetails::new(ErrorCode::Unknown, "deposit group has undeposited coins"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_method_from_payto() {
        assert_eq!(wire_method_of("payto://iban/DE123?receiver-name=A"), Some("iban"));
        assert_eq!(wire_method_of("payto://x-taler-bank/bank.test/alice"), Some("x-taler-bank"));
        assert_eq!(wire_method_of("payto://"), None);
        assert_eq!(wire_method_of("iban/DE123"), None);
    }
}
