//! Refresh groups: melting spent or rescued coins into fresh change.
//!
//! Each old coin runs its own small state machine inside the group:
//! session creation, melt, reveal. The session seed is persisted before the
//! melt so that a crash between melt and reveal re-derives exactly the
//! planchets the exchange committed to.

use std::collections::{BTreeMap, HashMap};

use ecash_core::constants::REFRESH_KAPPA;
use ecash_core::exchange::{MeltRequest, RevealRequest};
use ecash_core::records::{
    CoinRecord, CoinSource, CoinStatus, DenominationRecord, RefreshCoinStatus, RefreshGroupRecord,
    RefreshReason, RefreshSessionRecord,
};
use ecash_core::{Amount, EddsaPublicKey, ErrorCode, ErrorDetails, ExchangeError, Hash256, RefreshGroupId, RetryInfo, Timestamp};
use ecash_crypto::ops::{
    DeriveRefreshSessionRequest, DerivedRefreshSession, RefreshDenomination, SignCoinLinkRequest, UnblindRequest,
    VerifyDenominationSignatureRequest,
};
use ecash_store::{IndexName, ReadWrite, StoreName, Tx};
use futures::future::join_all;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::denom_selection::select_withdrawal_denominations;
use crate::error::{ErrorClass, WalletError};
use crate::locks::EXCHANGE_COINS_LOCK;
use crate::notifications::WalletNotification;
use crate::task::{TaskId, TaskOutcome, clear_retry, first_error};
use crate::wallet::Wallet;

/// Value lost when refreshing `amount_left` of a coin of `refreshed_denom`:
/// the refresh fee, the withdraw fees of the new coins, and whatever cannot
/// be represented by the denominations on offer.
pub fn get_total_refresh_cost(
    denoms: &[DenominationRecord],
    refreshed_denom: &DenominationRecord,
    amount_left: &Amount,
    now: Timestamp,
) -> Result<Amount, WalletError> {
    let withdraw_amount = amount_left.saturating_sub(&refreshed_denom.fee_refresh)?;
    let sel = select_withdrawal_denominations(&withdraw_amount, denoms, now)?;
    Ok(amount_left.saturating_sub(&sel.total_coin_value)?)
}

fn denominations_of(
    tx: &Tx<'_, ReadWrite>,
    cache: &mut BTreeMap<String, Vec<DenominationRecord>>,
    exchange_base_url: &str,
) -> Result<Vec<DenominationRecord>, WalletError> {
    if let Some(d) = cache.get(exchange_base_url) {
        return Ok(d.clone());
    }
    let d = tx
        .index::<DenominationRecord>(IndexName::DenominationsByBaseUrl, exchange_base_url.as_bytes())?
        .to_vec()?;
    cache.insert(exchange_base_url.to_string(), d.clone());
    Ok(d)
}

/// Consume `coin_pubs` into a new refresh group.
///
/// Every coin is zeroed and made dormant in the same transaction. Needs
/// `coins`, `denominations` and `refresh_groups` in scope.
pub fn create_refresh_group(
    tx: &mut Tx<'_, ReadWrite>,
    coin_pubs: &[EddsaPublicKey],
    reason: RefreshReason,
    now: Timestamp,
) -> Result<RefreshGroupId, WalletError> {
    let mut old_coin_pubs: Vec<EddsaPublicKey> = Vec::with_capacity(coin_pubs.len());
    for pub_key in coin_pubs {
        if !old_coin_pubs.contains(pub_key) {
            old_coin_pubs.push(*pub_key);
        }
    }

    let mut cache = BTreeMap::new();
    let mut input_per_coin = Vec::with_capacity(old_coin_pubs.len());
    let mut estimated_output_per_coin = Vec::with_capacity(old_coin_pubs.len());
    for pub_key in &old_coin_pubs {
        let mut coin = tx
            .get::<CoinRecord>(pub_key)?
            .ok_or_else(|| WalletError::invariant(format!("coin {pub_key} not found")))?;
        let denom = tx
            .get::<DenominationRecord>(&(coin.exchange_base_url.clone(), coin.denom_pub_hash))?
            .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", coin.denom_pub_hash)))?;
        let denoms = denominations_of(tx, &mut cache, &coin.exchange_base_url)?;
        let input = coin.current_amount.clone();
        let cost = get_total_refresh_cost(&denoms, &denom, &input, now)?;
        estimated_output_per_coin.push(input.saturating_sub(&cost)?);
        input_per_coin.push(input);

        coin.current_amount = Amount::zero(coin.current_amount.currency.clone());
        coin.status = CoinStatus::Dormant;
        tx.put(&coin)?;
    }

    let n = old_coin_pubs.len();
    let finished = n == 0;
    let group = RefreshGroupRecord {
        refresh_group_id: RefreshGroupId::random(),
        reason,
        old_coin_pubs,
        input_per_coin,
        estimated_output_per_coin,
        status_per_coin: vec![RefreshCoinStatus::Pending; n],
        refresh_sessions: vec![None; n],
        last_error_per_coin: vec![None; n],
        timestamp_created: now,
        timestamp_finished: finished.then_some(now),
        retry_info: (!finished).then(|| RetryInfo::initial(now)),
        last_error: None,
        frozen: false,
    };
    tx.add(&group)?;
    debug!(group = %group.refresh_group_id, coins = n, ?reason, "created refresh group");
    Ok(group.refresh_group_id)
}

/// Where one coin's session stands before melting.
enum SessionState {
    /// Coin is no longer pending.
    Done,
    /// Nothing worth refreshing; coin marked finished.
    Unwarranted,
    Ready(RefreshSessionRecord),
}

struct MeltContext {
    exchange_base_url: String,
    old_coin: CoinRecord,
    /// Record of every new coin, in session order.
    new_coin_denoms: Vec<DenominationRecord>,
    derived: DerivedRefreshSession,
}

impl Wallet {
    /// Refresh `coin_pubs` outside of any spend.
    pub fn refresh_coins(
        &self,
        coin_pubs: &[EddsaPublicKey],
        reason: RefreshReason,
    ) -> Result<RefreshGroupId, WalletError> {
        let now = Timestamp::now();
        let scope = [StoreName::Coins, StoreName::Denominations, StoreName::RefreshGroups];
        self.db.run_read_write(&scope, |tx| create_refresh_group(tx, coin_pubs, reason, now))
    }

    pub async fn process_refresh_group(&self, id: RefreshGroupId, force_now: bool) -> Result<TaskOutcome, WalletError> {
        self.run_task::<RefreshGroupRecord, _, _>(id, TaskId::Refresh(id), force_now, || self.refresh_step(id))
            .await
    }

    async fn refresh_step(&self, id: RefreshGroupId) -> Result<TaskOutcome, WalletError> {
        let group = self
            .db
            .run_read_only(&[StoreName::RefreshGroups], |tx| tx.get::<RefreshGroupRecord>(&id))?
            .ok_or_else(|| WalletError::invariant(format!("refresh group {id} not found")))?;
        let pending: Vec<usize> = group
            .status_per_coin
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == RefreshCoinStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        debug!(group = %id, pending = pending.len(), "refreshing coins");
        let results = join_all(pending.into_iter().map(|i| self.refresh_coin(id, i))).await;
        self.finish_refresh(id, results)
    }

    async fn refresh_coin(&self, id: RefreshGroupId, coin_index: usize) -> Result<(), WalletError> {
        let result = self.refresh_coin_inner(id, coin_index).await;
        if let Err(e) = &result {
            if e.class() != ErrorClass::Logic {
                let details = e.to_details();
                self.db.run_read_write(&[StoreName::RefreshGroups], |tx| {
                    if let Some(mut g) = tx.get::<RefreshGroupRecord>(&id)? {
                        if let Some(slot) = g.last_error_per_coin.get_mut(coin_index) {
                            *slot = Some(details);
                            tx.put(&g)?;
                        }
                    }
                    Ok::<_, WalletError>(())
                })?;
            }
        }
        result
    }

    async fn refresh_coin_inner(&self, id: RefreshGroupId, coin_index: usize) -> Result<(), WalletError> {
        let session = match self.ensure_refresh_session(id, coin_index)? {
            SessionState::Done => return Ok(()),
            SessionState::Unwarranted => {
                debug!(group = %id, coin_index, "refresh unwarranted");
                self.notifier.notify(WalletNotification::RefreshUnwarranted { refresh_group_id: id, coin_index });
                return Ok(());
            }
            SessionState::Ready(session) => session,
        };

        let ctx = self.derive_session(id, coin_index, &session).await?;
        let noreveal_index = match session.noreveal_index {
            Some(n) => n,
            None => match self.melt(id, coin_index, &ctx).await? {
                Some(n) => n,
                None => return Ok(()),
            },
        };
        self.reveal(id, coin_index, &ctx, noreveal_index).await
    }

    /// Load the coin's session, creating and persisting one if needed.
    fn ensure_refresh_session(&self, id: RefreshGroupId, coin_index: usize) -> Result<SessionState, WalletError> {
        let now = Timestamp::now();
        let scope = [StoreName::RefreshGroups, StoreName::Coins, StoreName::Denominations];
        self.db.run_read_write(&scope, |tx| {
            let Some(mut group) = tx.get::<RefreshGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("refresh group {id} vanished")));
            };
            if group.status_per_coin.get(coin_index) != Some(&RefreshCoinStatus::Pending) {
                return Ok(SessionState::Done);
            }
            if let Some(Some(session)) = group.refresh_sessions.get(coin_index) {
                return Ok(SessionState::Ready(session.clone()));
            }

            let old_coin_pub = group.old_coin_pubs[coin_index];
            let coin = tx
                .get::<CoinRecord>(&old_coin_pub)?
                .ok_or_else(|| WalletError::invariant(format!("coin {old_coin_pub} not found")))?;
            let old_denom = tx
                .get::<DenominationRecord>(&(coin.exchange_base_url.clone(), coin.denom_pub_hash))?
                .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", coin.denom_pub_hash)))?;
            let denoms = tx
                .index::<DenominationRecord>(IndexName::DenominationsByBaseUrl, coin.exchange_base_url.as_bytes())?
                .to_vec()?;
            let available = group.input_per_coin[coin_index].saturating_sub(&old_denom.fee_refresh)?;
            let sel = select_withdrawal_denominations(&available, &denoms, now)?;

            if sel.selected.is_empty() {
                group.status_per_coin[coin_index] = RefreshCoinStatus::Finished;
                tx.put(&group)?;
                return Ok(SessionState::Unwarranted);
            }

            let mut session_secret_seed = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut session_secret_seed);
            let session = RefreshSessionRecord {
                session_secret_seed,
                new_denoms: sel.selected,
                amount_refresh_output: sel.total_coin_value,
                noreveal_index: None,
            };
            group.refresh_sessions[coin_index] = Some(session.clone());
            tx.put(&group)?;
            Ok(SessionState::Ready(session))
        })
    }

    async fn derive_session(
        &self,
        id: RefreshGroupId,
        coin_index: usize,
        session: &RefreshSessionRecord,
    ) -> Result<MeltContext, WalletError> {
        let scope = [StoreName::RefreshGroups, StoreName::Coins, StoreName::Denominations];
        let (old_coin, old_denom, new_denoms) = self.db.run_read_only(&scope, |tx| {
            let group = tx
                .get::<RefreshGroupRecord>(&id)?
                .ok_or_else(|| WalletError::invariant(format!("refresh group {id} vanished")))?;
            let old_coin_pub = group.old_coin_pubs[coin_index];
            let coin = tx
                .get::<CoinRecord>(&old_coin_pub)?
                .ok_or_else(|| WalletError::invariant(format!("coin {old_coin_pub} not found")))?;
            let url = coin.exchange_base_url.clone();
            let old_denom = tx
                .get::<DenominationRecord>(&(url.clone(), coin.denom_pub_hash))?
                .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", coin.denom_pub_hash)))?;
            let mut new_denoms = HashMap::new();
            for sel in &session.new_denoms {
                let d = tx
                    .get::<DenominationRecord>(&(url.clone(), sel.denom_pub_hash))?
                    .ok_or_else(|| WalletError::invariant(format!("denomination {} not found", sel.denom_pub_hash)))?;
                new_denoms.insert(sel.denom_pub_hash, d);
            }
            Ok::<_, WalletError>((coin, old_denom, new_denoms))
        })?;

        let mut request_denoms = Vec::with_capacity(session.new_denoms.len());
        let mut new_coin_denoms = Vec::new();
        for sel in &session.new_denoms {
            let d = &new_denoms[&sel.denom_pub_hash];
            request_denoms.push(RefreshDenomination {
                denom_pub: d.denom_pub.clone(),
                value: d.value.clone(),
                fee_withdraw: d.fee_withdraw.clone(),
                count: sel.count,
            });
            new_coin_denoms.extend(std::iter::repeat_n(d.clone(), sel.count as usize));
        }

        let derived = self
            .crypto
            .derive_refresh_session(DeriveRefreshSessionRequest {
                session_secret_seed: session.session_secret_seed,
                kappa: REFRESH_KAPPA,
                melt_coin_pub: old_coin.coin_pub,
                melt_coin_priv: old_coin.coin_priv.clone(),
                melt_coin_denom_pub_hash: old_coin.denom_pub_hash,
                new_denoms: request_denoms,
                fee_refresh: old_denom.fee_refresh.clone(),
            })
            .await?;
        Ok(MeltContext {
            exchange_base_url: old_coin.exchange_base_url.clone(),
            old_coin,
            new_coin_denoms,
            derived,
        })
    }

    /// Melt the old coin. Returns `None` if the exchange does not know the
    /// coin, in which case the coin is frozen.
    async fn melt(&self, id: RefreshGroupId, coin_index: usize, ctx: &MeltContext) -> Result<Option<u32>, WalletError> {
        let req = MeltRequest {
            coin_pub: ctx.old_coin.coin_pub,
            denom_pub_hash: ctx.old_coin.denom_pub_hash,
            denom_sig: ctx.old_coin.denom_sig.clone(),
            confirm_sig: ctx.derived.confirm_sig.clone(),
            value_with_fee: ctx.derived.melt_value_with_fee.clone(),
            rc: ctx.derived.rc,
        };
        let result = self
            .locks
            .run_sequentialized(
                &[EXCHANGE_COINS_LOCK],
                self.exchange_call(self.exchange.melt(&ctx.exchange_base_url, &req)),
            )
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(WalletError::Exchange(ExchangeError::CoinNotFound)) => {
                warn!(group = %id, coin_index, coin = %ctx.old_coin.coin_pub, "exchange does not know the melted coin");
                let details = ErrorDetails::from(&ExchangeError::CoinNotFound);
                self.db.run_read_write(&[StoreName::RefreshGroups], |tx| {
                    if let Some(mut g) = tx.get::<RefreshGroupRecord>(&id)? {
                        g.status_per_coin[coin_index] = RefreshCoinStatus::Frozen;
                        g.last_error_per_coin[coin_index] = Some(details);
                        tx.put(&g)?;
                    }
                    Ok::<_, WalletError>(())
                })?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if resp.noreveal_index as usize >= REFRESH_KAPPA {
            return Err(WalletError::protocol_violation(format!(
                "noreveal index {} out of range",
                resp.noreveal_index
            )));
        }
        self.db.run_read_write(&[StoreName::RefreshGroups], |tx| {
            if let Some(mut g) = tx.get::<RefreshGroupRecord>(&id)? {
                if let Some(Some(session)) = g.refresh_sessions.get_mut(coin_index) {
                    session.noreveal_index = Some(resp.noreveal_index);
                    tx.put(&g)?;
                }
            }
            Ok::<_, WalletError>(())
        })?;
        debug!(group = %id, coin_index, noreveal_index = resp.noreveal_index, "coin melted");
        self.notifier.notify(WalletNotification::RefreshMelted { refresh_group_id: id, coin_index });
        Ok(Some(resp.noreveal_index))
    }

    async fn reveal(
        &self,
        id: RefreshGroupId,
        coin_index: usize,
        ctx: &MeltContext,
        noreveal_index: u32,
    ) -> Result<(), WalletError> {
        let gamma = noreveal_index as usize;
        let derived = &ctx.derived;
        let (Some(planchets), Some(transfer_pub)) =
            (derived.planchets_for_gammas.get(gamma), derived.transfer_pubs.get(gamma).copied())
        else {
            return Err(WalletError::invariant(format!("no refresh branch {gamma}")));
        };
        let new_denoms_h: Vec<Hash256> = ctx.new_coin_denoms.iter().map(|d| d.denom_pub_hash).collect();
        if new_denoms_h.len() != planchets.len() {
            return Err(WalletError::invariant("refresh session planchet count mismatch"));
        }
        let transfer_privs = derived
            .transfer_privs
            .iter()
            .enumerate()
            .filter(|(k, _)| *k != gamma)
            .map(|(_, p)| p.clone())
            .collect();

        let link_sigs = join_all(planchets.iter().zip(&new_denoms_h).map(|(p, h)| {
            self.crypto.sign_coin_link(SignCoinLinkRequest {
                old_coin_priv: ctx.old_coin.coin_priv.clone(),
                old_coin_pub: ctx.old_coin.coin_pub,
                new_denom_hash: *h,
                transfer_pub,
                coin_ev: p.coin_ev.clone(),
            })
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        let req = RevealRequest {
            rc: derived.rc,
            old_coin_pub: ctx.old_coin.coin_pub,
            transfer_pub,
            transfer_privs,
            new_denoms_h,
            coin_evs: planchets.iter().map(|p| p.coin_ev.clone()).collect(),
            link_sigs,
        };
        let resp = self
            .locks
            .run_sequentialized(
                &[EXCHANGE_COINS_LOCK],
                self.exchange_call(self.exchange.reveal(&ctx.exchange_base_url, &req)),
            )
            .await?;
        if resp.ev_sigs.len() != planchets.len() {
            return Err(WalletError::protocol_violation(format!(
                "reveal returned {} signatures for {} coins",
                resp.ev_sigs.len(),
                planchets.len()
            )));
        }

        let mut coins = Vec::with_capacity(planchets.len());
        for ((p, denom), ev_sig) in planchets.iter().zip(&ctx.new_coin_denoms).zip(resp.ev_sigs) {
            let denom_sig = self
                .crypto
                .unblind_signature(UnblindRequest {
                    blinded_sig: ev_sig,
                    blinding_key: p.blinding_key,
                    denom_pub: denom.denom_pub.clone(),
                })
                .await?;
            let valid = self
                .crypto
                .verify_denomination_signature(VerifyDenominationSignatureRequest {
                    coin_pub: p.coin_pub,
                    denom_sig: denom_sig.clone(),
                    denom_pub: denom.denom_pub.clone(),
                })
                .await?;
            if !valid {
                return Err(WalletError::signature_invalid(format!(
                    "invalid signature on refreshed coin {} of group {id}",
                    p.coin_pub
                )));
            }
            coins.push(CoinRecord {
                coin_pub: p.coin_pub,
                coin_priv: p.coin_priv.clone(),
                exchange_base_url: ctx.exchange_base_url.clone(),
                denom_pub: denom.denom_pub.clone(),
                denom_pub_hash: denom.denom_pub_hash,
                denom_sig,
                blinding_key: p.blinding_key,
                coin_ev_hash: p.coin_ev_hash,
                current_amount: denom.value.clone(),
                status: CoinStatus::Fresh,
                coin_source: CoinSource::Refresh { old_coin_pub: ctx.old_coin.coin_pub },
                allocation: None,
                suspended: false,
            });
        }

        let stored = self.db.run_read_write(&[StoreName::RefreshGroups, StoreName::Coins], |tx| {
            let Some(mut g) = tx.get::<RefreshGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("refresh group {id} vanished")));
            };
            if g.status_per_coin[coin_index] != RefreshCoinStatus::Pending {
                return Ok(false);
            }
            for c in &coins {
                tx.put(c)?;
            }
            g.status_per_coin[coin_index] = RefreshCoinStatus::Finished;
            g.last_error_per_coin[coin_index] = None;
            tx.put(&g)?;
            Ok(true)
        })?;
        if stored {
            debug!(group = %id, coin_index, new_coins = coins.len(), "refresh revealed");
            self.notifier.notify(WalletNotification::RefreshRevealed { refresh_group_id: id, coin_index });
        }
        Ok(())
    }

    /// Mark the group finished once no coin is pending. Frozen coins leave
    /// it finished and frozen; forcing the group reopens them.
    fn finish_refresh(&self, id: RefreshGroupId, results: Vec<Result<(), WalletError>>) -> Result<TaskOutcome, WalletError> {
        let now = Timestamp::now();
        let finished = self.db.run_read_write(&[StoreName::RefreshGroups], |tx| {
            let Some(mut g) = tx.get::<RefreshGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("refresh group {id} vanished")));
            };
            if g.timestamp_finished.is_some() {
                return Ok(Some(g.frozen));
            }
            if g.status_per_coin.contains(&RefreshCoinStatus::Pending) {
                return Ok(None);
            }
            g.timestamp_finished = Some(now);
            g.frozen = g.status_per_coin.contains(&RefreshCoinStatus::Frozen);
            clear_retry(&mut g);
            tx.put(&g)?;
            Ok(Some(g.frozen))
        })?;

        match finished {
            Some(frozen) => {
                info!(group = %id, frozen, "refresh group finished");
                self.notifier.notify(WalletNotification::RefreshGroupFinished { refresh_group_id: id });
                Ok(if frozen { TaskOutcome::Frozen } else { TaskOutcome::Finished })
            }
            None => Err(first_error(results).unwrap_or_else(|| {
                WalletError::Transient(ErrorDetails::new(ErrorCode::Unknown, "refresh group has pending coins"))
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash_core::DenominationPubKey;
    use ecash_core::records::DenominationVerificationStatus;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn denom(tag: u8, value: &str, fee: &str) -> DenominationRecord {
        let key = DenominationPubKey::eddsa(EddsaPublicKey([tag; 32]));
        DenominationRecord {
            exchange_base_url: "https://ex.test/".into(),
            denom_pub_hash: key.hash(),
            denom_pub: key,
            value: amt(value),
            fee_withdraw: amt(fee),
            fee_deposit: amt(fee),
            fee_refresh: amt(fee),
            fee_refund: amt(fee),
            stamp_start: Timestamp(0),
            stamp_expire_withdraw: Timestamp(u64::MAX),
            stamp_expire_deposit: Timestamp(u64::MAX),
            is_offered: true,
            is_revoked: false,
            verification_status: DenominationVerificationStatus::VerifiedGood,
        }
    }

    #[test]
    fn refresh_cost_covers_fees_and_remainder() {
        let denoms = vec![denom(1, "EUR:1", "EUR:0.01"), denom(2, "EUR:0.1", "EUR:0.01")];
        // 2.0 - 0.01 refresh fee = 1.99 to withdraw:
        // one 1.0 coin (1.01), then eight 0.1 coins (0.88), 0.1 left over.
        let cost = get_total_refresh_cost(&denoms, &denoms[0], &amt("EUR:2"), Timestamp(1)).unwrap();
        assert_eq!(cost, amt("EUR:0.2"));
    }

    #[test]
    fn refresh_cost_of_dust_is_everything() {
        let denoms = vec![denom(1, "EUR:1", "EUR:0.01")];
        let cost = get_total_refresh_cost(&denoms, &denoms[0], &amt("EUR:0.5"), Timestamp(1)).unwrap();
        assert_eq!(cost, amt("EUR:0.5"));
    }
}
