//! Withdrawal groups: turning reserve funds into fresh coins.
//!
//! A group fixes its denomination selection and a secret seed at creation.
//! Processing first derives every planchet from the seed (so a crash
//! before persisting them loses nothing), then requests a signature for
//! each planchet that has none yet. Each coin is stored as soon as its own
//! signature checks out.

use std::collections::{BTreeSet, HashMap};

use ecash_core::exchange::WithdrawRequest;
use ecash_core::records::{
    CoinRecord, CoinSource, CoinStatus, DenominationRecord, PlanchetRecord, ReserveRecord,
    WithdrawalGroupRecord,
};
use ecash_core::{Amount, EddsaPublicKey, ErrorCode, ErrorDetails, Hash256, RetryInfo, Timestamp, WithdrawalGroupId};
use ecash_crypto::ops::{CreatePlanchetRequest, UnblindRequest, VerifyDenominationSignatureRequest};
use ecash_store::{IndexName, ReadWrite, StoreName, Tx, planchet_group_index_key};
use futures::future::join_all;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::denom_selection::select_withdrawal_denominations;
use crate::error::{ErrorClass, WalletError};
use crate::notifications::WalletNotification;
use crate::task::{TaskId, TaskOutcome, clear_retry, first_error};
use crate::wallet::Wallet;

/// Persist a new withdrawal group drawing `amount` from `reserve`.
///
/// Returns `None` if no withdrawable denomination fits into `amount`.
/// Needs `denominations` and `withdrawal_groups` in scope.
pub(crate) fn insert_withdrawal_group(
    tx: &mut Tx<'_, ReadWrite>,
    reserve: &ReserveRecord,
    amount: &Amount,
    now: Timestamp,
) -> Result<Option<WithdrawalGroupId>, WalletError> {
    let denoms = tx
        .index::<DenominationRecord>(IndexName::DenominationsByBaseUrl, reserve.exchange_base_url.as_bytes())?
        .to_vec()?;
    let denoms_sel = select_withdrawal_denominations(amount, &denoms, now)?;
    if denoms_sel.selected.is_empty() {
        debug!(%amount, "no denomination fits the withdrawal amount");
        return Ok(None);
    }
    let mut secret_seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret_seed);
    let group = WithdrawalGroupRecord {
        withdrawal_group_id: WithdrawalGroupId::random(),
        reserve_pub: reserve.reserve_pub,
        exchange_base_url: reserve.exchange_base_url.clone(),
        secret_seed,
        raw_withdrawal_amount: amount.clone(),
        denoms_sel,
        timestamp_start: now,
        timestamp_finish: None,
        retry_info: Some(RetryInfo::initial(now)),
        last_error: None,
        frozen: false,
    };
    tx.add(&group)?;
    info!(
        group = %group.withdrawal_group_id,
        coins = group.denoms_sel.coin_count(),
        value = %group.denoms_sel.total_coin_value,
        "created withdrawal group"
    );
    Ok(Some(group.withdrawal_group_id))
}

struct WithdrawContext {
    group: WithdrawalGroupRecord,
    reserve: ReserveRecord,
    denoms: HashMap<Hash256, DenominationRecord>,
}

impl Wallet {
    pub fn create_withdrawal_group(
        &self,
        reserve_pub: EddsaPublicKey,
        amount: &Amount,
    ) -> Result<WithdrawalGroupId, WalletError> {
        let now = Timestamp::now();
        let scope = [StoreName::Reserves, StoreName::Denominations, StoreName::WithdrawalGroups];
        self.db.run_read_write(&scope, |tx| {
            let reserve = tx
                .get::<ReserveRecord>(&reserve_pub)?
                .ok_or_else(|| WalletError::invariant(format!("reserve {reserve_pub} not found")))?;
            insert_withdrawal_group(tx, &reserve, amount, now)?.ok_or(WalletError::InsufficientFunds)
        })
    }

    pub async fn process_withdrawal_group(
        &self,
        id: WithdrawalGroupId,
        force_now: bool,
    ) -> Result<TaskOutcome, WalletError> {
        self.run_task::<WithdrawalGroupRecord, _, _>(id, TaskId::Withdraw(id), force_now, || {
            self.withdraw_step(id)
        })
        .await
    }

    fn load_withdraw_context(&self, id: WithdrawalGroupId) -> Result<WithdrawContext, WalletError> {
        let scope = [StoreName::WithdrawalGroups, StoreName::Reserves, StoreName::Denominations];
        self.db.run_read_only(&scope, |tx| {
            let group = tx
                .get::<WithdrawalGroupRecord>(&id)?
                .ok_or_else(|| WalletError::invariant(format!("withdrawal group {id} not found")))?;
            let reserve = tx
                .get::<ReserveRecord>(&group.reserve_pub)?
                .ok_or_else(|| WalletError::invariant(format!("reserve {} not found", group.reserve_pub)))?;
            let mut denoms = HashMap::new();
            for sel in &group.denoms_sel.selected {
                let key = (group.exchange_base_url.clone(), sel.denom_pub_hash);
                let denom = tx
                    .get::<DenominationRecord>(&key)?
                    .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", sel.denom_pub_hash)))?;
                denoms.insert(sel.denom_pub_hash, denom);
            }
            Ok(WithdrawContext { group, reserve, denoms })
        })
    }

    async fn withdraw_step(&self, id: WithdrawalGroupId) -> Result<TaskOutcome, WalletError> {
        let ctx = self.load_withdraw_context(id)?;
        self.ensure_planchets(&ctx).await?;

        let planchets = self.db.run_read_only(&[StoreName::Planchets], |tx| {
            tx.index::<PlanchetRecord>(IndexName::PlanchetsByGroup, id.as_ref())?
                .filter_records(|p| !p.withdrawal_done)
        })?;
        debug!(group = %id, pending = planchets.len(), "withdrawing planchets");

        let results = join_all(planchets.into_iter().map(|p| self.withdraw_planchet(&ctx.group, p))).await;
        self.finish_withdrawal(&ctx.group, results)
    }

    /// Derive and persist every planchet the group does not have yet.
    async fn ensure_planchets(&self, ctx: &WithdrawContext) -> Result<(), WalletError> {
        let id = ctx.group.withdrawal_group_id;
        let existing: BTreeSet<u32> = self.db.run_read_only(&[StoreName::Planchets], |tx| {
            tx.index::<PlanchetRecord>(IndexName::PlanchetsByGroup, id.as_ref())?
                .map_records(|p| p.coin_idx)
                .map(|v| v.into_iter().collect())
        })?;

        let mut requests = Vec::new();
        for (idx, denom_hash) in ctx.group.denoms_sel.expand().into_iter().enumerate() {
            let idx = idx as u32;
            if existing.contains(&idx) {
                continue;
            }
            let denom = ctx
                .denoms
                .get(&denom_hash)
                .ok_or_else(|| WalletError::invariant(format!("denomination {denom_hash} not loaded")))?;
            requests.push((
                idx,
                denom.clone(),
                CreatePlanchetRequest {
                    secret_seed: ctx.group.secret_seed,
                    coin_index: idx,
                    denom_pub: denom.denom_pub.clone(),
                    value: denom.value.clone(),
                    fee_withdraw: denom.fee_withdraw.clone(),
                    reserve_pub: ctx.reserve.reserve_pub,
                    reserve_priv: ctx.reserve.reserve_priv.clone(),
                },
            ));
        }
        if requests.is_empty() {
            return Ok(());
        }

        let created = join_all(requests.into_iter().map(|(idx, denom, req)| async move {
            let r = self.crypto.create_planchet(req).await?;
            Ok::<_, WalletError>((idx, denom, r))
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        self.db.run_read_write(&[StoreName::Planchets], |tx| {
            for (idx, denom, r) in created {
                let index_key = planchet_group_index_key(&id, idx);
                if tx.index_first::<PlanchetRecord>(IndexName::PlanchetsByGroupAndIndex, &index_key)?.is_some() {
                    continue;
                }
                tx.put(&PlanchetRecord {
                    coin_pub: r.coin_pub,
                    coin_priv: r.coin_priv,
                    withdrawal_group_id: id,
                    coin_idx: idx,
                    withdrawal_done: false,
                    denom_pub: denom.denom_pub,
                    denom_pub_hash: r.denom_pub_hash,
                    blinding_key: r.blinding_key,
                    withdraw_sig: r.withdraw_sig,
                    coin_ev: r.coin_ev,
                    coin_ev_hash: r.coin_ev_hash,
                    coin_value: r.coin_value,
                    reserve_pub: r.reserve_pub,
                    last_error: None,
                })?;
            }
            Ok::<_, WalletError>(())
        })?;
        debug!(group = %id, "planchets stored");
        Ok(())
    }

    async fn withdraw_planchet(&self, group: &WithdrawalGroupRecord, planchet: PlanchetRecord) -> Result<(), WalletError> {
        let coin_pub = planchet.coin_pub;
        let result = self.request_coin(group, planchet).await;
        if let Err(e) = &result {
            if e.class() != ErrorClass::Logic {
                let details = e.to_details();
                self.db.run_read_write(&[StoreName::Planchets], |tx| {
                    if let Some(mut p) = tx.get::<PlanchetRecord>(&coin_pub)? {
                        p.last_error = Some(details);
                        tx.put(&p)?;
                    }
                    Ok::<_, WalletError>(())
                })?;
            }
        }
        result
    }

    async fn request_coin(&self, group: &WithdrawalGroupRecord, planchet: PlanchetRecord) -> Result<(), WalletError> {
        let req = WithdrawRequest {
            reserve_pub: planchet.reserve_pub,
            denom_pub_hash: planchet.denom_pub_hash,
            coin_ev: planchet.coin_ev.clone(),
            reserve_sig: planchet.withdraw_sig.clone(),
        };
        let resp = self.exchange_call(self.exchange.withdraw(&group.exchange_base_url, &req)).await?;

        let denom_sig = self
            .crypto
            .unblind_signature(UnblindRequest {
                blinded_sig: resp.ev_sig,
                blinding_key: planchet.blinding_key,
                denom_pub: planchet.denom_pub.clone(),
            })
            .await?;
        let valid = self
            .crypto
            .verify_denomination_signature(VerifyDenominationSignatureRequest {
                coin_pub: planchet.coin_pub,
                denom_sig: denom_sig.clone(),
                denom_pub: planchet.denom_pub.clone(),
            })
            .await?;
        if !valid {
            warn!(group = %group.withdrawal_group_id, idx = planchet.coin_idx, "exchange returned an invalid signature");
            return Err(WalletError::signature_invalid(format!(
                "invalid denomination signature for coin {} of withdrawal group {}",
                planchet.coin_idx, group.withdrawal_group_id
            )));
        }

        let coin = CoinRecord {
            coin_pub: planchet.coin_pub,
            coin_priv: planchet.coin_priv.clone(),
            exchange_base_url: group.exchange_base_url.clone(),
            denom_pub: planchet.denom_pub.clone(),
            denom_pub_hash: planchet.denom_pub_hash,
            denom_sig,
            blinding_key: planchet.blinding_key,
            coin_ev_hash: planchet.coin_ev_hash,
            current_amount: planchet.coin_value.clone(),
            status: CoinStatus::Fresh,
            coin_source: CoinSource::Withdraw {
                withdrawal_group_id: group.withdrawal_group_id,
                coin_index: planchet.coin_idx,
                reserve_pub: planchet.reserve_pub,
            },
            allocation: None,
            suspended: false,
        };
        let stored = self.db.run_read_write(&[StoreName::Planchets, StoreName::Coins], |tx| {
            let Some(mut p) = tx.get::<PlanchetRecord>(&planchet.coin_pub)? else {
                return Err(WalletError::invariant(format!("planchet {} vanished", planchet.coin_pub)));
            };
            if p.withdrawal_done {
                return Ok(false);
            }
            p.withdrawal_done = true;
            p.last_error = None;
            tx.put(&p)?;
            tx.put(&coin)?;
            Ok(true)
        })?;
        if stored {
            self.notifier.notify(WalletNotification::CoinWithdrawn {
                withdrawal_group_id: group.withdrawal_group_id,
                coin_pub: coin.coin_pub,
            });
        }
        Ok(())
    }

    fn finish_withdrawal(
        &self,
        group: &WithdrawalGroupRecord,
        results: Vec<Result<(), WalletError>>,
    ) -> Result<TaskOutcome, WalletError> {
        let id = group.withdrawal_group_id;
        let now = Timestamp::now();
        let (finished, done) = self.db.run_read_write(&[StoreName::WithdrawalGroups, StoreName::Planchets], |tx| {
            let Some(mut g) = tx.get::<WithdrawalGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("withdrawal group {id} vanished")));
            };
            let done = tx
                .index::<PlanchetRecord>(IndexName::PlanchetsByGroup, id.as_ref())?
                .filter_records(|p| p.withdrawal_done)?
                .len() as u32;
            if g.timestamp_finish.is_some() {
                return Ok((true, done));
            }
            if done < g.denoms_sel.coin_count() {
                return Ok((false, done));
            }
            g.timestamp_finish = Some(now);
            clear_retry(&mut g);
            tx.put(&g)?;
            Ok((true, done))
        })?;

        if finished {
            info!(group = %id, coins = done, "withdrawal group finished");
            self.notifier.notify(WalletNotification::WithdrawGroupFinished { withdrawal_group_id: id });
            return Ok(TaskOutcome::Finished);
        }

        let total = group.denoms_sel.coin_count();
        match first_error(results) {
            Some(e) if e.class() != ErrorClass::Transient => Err(e),
            cause => {
                let mut details = ErrorDetails::new(
                    ErrorCode::WithdrawalGroupIncomplete,
                    format!("{done} of {total} coins withdrawn"),
                );
                if let Some(cause) = cause {
                    details = details.with_detail("cause", cause.to_details().to_string());
                }
                Err(WalletError::Transient(details))
            }
        }
    }
}
