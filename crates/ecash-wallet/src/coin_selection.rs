//! Fee-aware selection of coins to cover a payment.
//!
//! [`select_pay_coins`] is a pure function: it looks only at the request and
//! never touches the store, so it is safe to call speculatively for fee
//! estimation. [`get_candidate_pay_coins`] builds its input from the store.
//!
//! Coins are taken largest first. Every coin pays its deposit fee and, for
//! the first coin of each exchange, an amortized share of that exchange's
//! wire fee. Fees are covered by the merchant's allowances first; whatever
//! the allowances do not cover is added to the amount still owed and
//! reported as a customer fee.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use ecash_core::records::{CoinRecord, CoinStatus, DenominationRecord, ExchangeRecord, PayCoinSelection};
use ecash_core::{Amount, AmountError, DenominationPubKey, EddsaPublicKey, Timestamp};
use ecash_store::{IndexName, Tx};
use tracing::{debug, warn};

use crate::error::WalletError;

/// A coin that could be spent, with the fee its deposit would cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableCoinInfo {
    pub coin_pub: EddsaPublicKey,
    pub denom_pub: DenominationPubKey,
    pub available_amount: Amount,
    pub fee_deposit: Amount,
    pub exchange_base_url: String,
}

/// One coin of an earlier selection that is being repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousCoin {
    pub coin_pub: EddsaPublicKey,
    pub contribution: Amount,
    pub fee_deposit: Amount,
    pub exchange_base_url: String,
}

#[derive(Debug, Clone)]
pub struct PayCoinSelectionRequest {
    pub candidates: Vec<AvailableCoinInfo>,
    /// Wire fee charged by each exchange for the payment's wire method.
    pub wire_fees_per_exchange: BTreeMap<String, Amount>,
    pub contract_amount: Amount,
    /// Deposit fees the merchant is willing to cover.
    pub max_deposit_fee: Amount,
    /// Wire fees the merchant is willing to cover.
    pub max_wire_fee: Amount,
    /// Number of payments the wire fee is spread over. Zero is treated as one.
    pub wire_fee_amortization: u32,
    /// Contributions already committed. Their coins are not reconsidered.
    pub previous_selection: Vec<PreviousCoin>,
}

/// Candidate coins together with the wire fees of their exchanges.
#[derive(Debug, Clone, Default)]
pub struct CandidateCoins {
    pub candidates: Vec<AvailableCoinInfo>,
    pub wire_fees_per_exchange: BTreeMap<String, Amount>,
}

struct Tally {
    amount_pay_remaining: Amount,
    wire_fee_allowance_remaining: Amount,
    deposit_fee_allowance_remaining: Amount,
    customer_wire_fees: Amount,
    customer_deposit_fees: Amount,
    wire_fee_covered: BTreeSet<String>,
}

impl Tally {
    fn new(req: &PayCoinSelectionRequest) -> Self {
        let currency = req.contract_amount.currency.clone();
        Self {
            amount_pay_remaining: req.contract_amount.clone(),
            wire_fee_allowance_remaining: req.max_wire_fee.clone(),
            deposit_fee_allowance_remaining: req.max_deposit_fee.clone(),
            customer_wire_fees: Amount::zero(currency.clone()),
            customer_deposit_fees: Amount::zero(currency),
            wire_fee_covered: BTreeSet::new(),
        }
    }

    /// Account for the fees of spending one coin of `exchange_base_url`.
    fn add_fees(
        &mut self,
        wire_fees: &BTreeMap<String, Amount>,
        amortization: u32,
        exchange_base_url: &str,
        fee_deposit: &Amount,
    ) -> Result<(), AmountError> {
        if !self.wire_fee_covered.contains(exchange_base_url) {
            let currency = &self.amount_pay_remaining.currency;
            let wire_fee = wire_fees
                .get(exchange_base_url)
                .cloned()
                .unwrap_or_else(|| Amount::zero(currency.clone()));
            let forgiven = self.wire_fee_allowance_remaining.min(&wire_fee)?;
            self.wire_fee_allowance_remaining = self.wire_fee_allowance_remaining.saturating_sub(&forgiven)?;

            let amortized = wire_fee.saturating_sub(&forgiven)?.divide(u64::from(amortization.max(1)))?;
            let deposit_forgiven = self.deposit_fee_allowance_remaining.min(&amortized)?;
            self.deposit_fee_allowance_remaining =
                self.deposit_fee_allowance_remaining.saturating_sub(&deposit_forgiven)?;

            let customer_share = amortized.saturating_sub(&deposit_forgiven)?;
            self.customer_wire_fees = self.customer_wire_fees.saturating_add(&customer_share)?;
            self.amount_pay_remaining = self.amount_pay_remaining.saturating_add(&customer_share)?;
            self.wire_fee_covered.insert(exchange_base_url.to_string());
        }

        let forgiven = fee_deposit.min(&self.deposit_fee_allowance_remaining)?;
        self.deposit_fee_allowance_remaining = self.deposit_fee_allowance_remaining.saturating_sub(&forgiven)?;
        let customer_share = fee_deposit.saturating_sub(&forgiven)?;
        self.customer_deposit_fees = self.customer_deposit_fees.saturating_add(&customer_share)?;
        self.amount_pay_remaining = self.amount_pay_remaining.saturating_add(&customer_share)?;
        Ok(())
    }
}

fn check_currency(currency: &str, amount: &Amount) -> Result<(), AmountError> {
    if amount.currency != currency {
        return Err(AmountError::CurrencyMismatch {
            left: currency.to_string(),
            right: amount.currency.clone(),
        });
    }
    Ok(())
}

/// Selection order: available amount descending, deposit fee ascending,
/// denomination key ascending.
fn candidate_order(a: &AvailableCoinInfo, b: &AvailableCoinInfo) -> Ordering {
    let by_amount = b.available_amount.cmp_amount(&a.available_amount).unwrap_or(Ordering::Equal);
    let by_fee = a.fee_deposit.cmp_amount(&b.fee_deposit).unwrap_or(Ordering::Equal);
    by_amount.then(by_fee).then_with(|| a.denom_pub.cmp(&b.denom_pub))
}

/// Select coins to pay `req.contract_amount`.
///
/// Returns `Ok(None)` when the candidates cannot cover the amount plus the
/// customer-borne fees. Fails only if amounts of different currencies are
/// mixed.
pub fn select_pay_coins(req: &PayCoinSelectionRequest) -> Result<Option<PayCoinSelection>, AmountError> {
    if req.candidates.is_empty() {
        return Ok(None);
    }
    let currency = req.contract_amount.currency.as_str();
    check_currency(currency, &req.max_deposit_fee)?;
    check_currency(currency, &req.max_wire_fee)?;
    for c in &req.candidates {
        check_currency(currency, &c.available_amount)?;
        check_currency(currency, &c.fee_deposit)?;
    }

    let mut tally = Tally::new(req);
    let mut coin_pubs = Vec::new();
    let mut coin_contributions = Vec::new();

    for prev in &req.previous_selection {
        tally.add_fees(
            &req.wire_fees_per_exchange,
            req.wire_fee_amortization,
            &prev.exchange_base_url,
            &prev.fee_deposit,
        )?;
        tally.amount_pay_remaining = tally.amount_pay_remaining.saturating_sub(&prev.contribution)?;
        coin_pubs.push(prev.coin_pub);
        coin_contributions.push(prev.contribution.clone());
    }
    let previous: BTreeSet<EddsaPublicKey> = req.previous_selection.iter().map(|p| p.coin_pub).collect();

    let mut candidates: Vec<&AvailableCoinInfo> = req.candidates.iter().collect();
    candidates.sort_by(|a, b| candidate_order(a, b));

    for coin in candidates {
        if coin.fee_deposit.cmp_amount(&coin.available_amount)? == Ordering::Greater {
            continue;
        }
        if tally.amount_pay_remaining.is_zero() {
            break;
        }
        // A coin never contributes twice to one payment.
        if previous.contains(&coin.coin_pub) || coin_pubs.contains(&coin.coin_pub) {
            continue;
        }

        tally.add_fees(
            &req.wire_fees_per_exchange,
            req.wire_fee_amortization,
            &coin.exchange_base_url,
            &coin.fee_deposit,
        )?;
        let contribution = tally
            .amount_pay_remaining
            .min(&coin.available_amount)?
            .max(&coin.fee_deposit)?;
        tally.amount_pay_remaining = tally.amount_pay_remaining.saturating_sub(&contribution)?;
        coin_pubs.push(coin.coin_pub);
        coin_contributions.push(contribution);
    }

    if !tally.amount_pay_remaining.is_zero() {
        debug!(
            contract = %req.contract_amount,
            missing = %tally.amount_pay_remaining,
            "coin selection failed: insufficient funds"
        );
        return Ok(None);
    }
    Ok(Some(PayCoinSelection {
        payment_amount: req.contract_amount.clone(),
        coin_pubs,
        coin_contributions,
        customer_wire_fees: tally.customer_wire_fees,
        customer_deposit_fees: tally.customer_deposit_fees,
    }))
}

fn is_spendable(coin: &CoinRecord, denom: &DenominationRecord, now: Timestamp) -> bool {
    coin.status == CoinStatus::Fresh
        && !coin.suspended
        && !coin.current_amount.is_zero()
        && denom.is_depositable(now)
}

/// Collect spendable coins of `currency` from `allowed_exchanges`, along
/// with each exchange's wire fee for `wire_method` at `now`.
///
/// Needs the `exchanges`, `denominations` and `coins` stores in scope.
pub fn get_candidate_pay_coins<M>(
    tx: &Tx<'_, M>,
    currency: &str,
    allowed_exchanges: &[String],
    wire_method: &str,
    now: Timestamp,
) -> Result<CandidateCoins, WalletError> {
    let mut out = CandidateCoins::default();
    for exchange in tx.iter::<ExchangeRecord>()? {
        let exchange = exchange?;
        if exchange.currency != currency || !allowed_exchanges.contains(&exchange.base_url) {
            continue;
        }
        let coins = tx
            .index::<CoinRecord>(IndexName::CoinsByBaseUrl, exchange.base_url.as_bytes())?
            .to_vec()?;
        for coin in coins {
            let denom_key = (exchange.base_url.clone(), coin.denom_pub_hash);
            let denom = tx.get::<DenominationRecord>(&denom_key)?.ok_or_else(|| {
                WalletError::invariant(format!("denomination {} of coin {} missing", coin.denom_pub_hash, coin.coin_pub))
            })?;
            if denom.value.currency != currency {
                warn!(exchange = %exchange.base_url, "denomination currency differs from exchange currency");
                continue;
            }
            if !is_spendable(&coin, &denom, now) {
                continue;
            }
            out.candidates.push(AvailableCoinInfo {
                coin_pub: coin.coin_pub,
                denom_pub: coin.denom_pub.clone(),
                available_amount: coin.current_amount.clone(),
                fee_deposit: denom.fee_deposit.clone(),
                exchange_base_url: exchange.base_url.clone(),
            });
        }
        if let Some(fee) = exchange.wire_fee_at(wire_method, now) {
            out.wire_fees_per_exchange.insert(exchange.base_url.clone(), fee.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash_core::types::DenomCipher;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn coin(id: u8, available: &str, fee: &str, exchange: &str) -> AvailableCoinInfo {
        AvailableCoinInfo {
            coin_pub: EddsaPublicKey([id; 32]),
            denom_pub: DenominationPubKey { cipher: DenomCipher::Eddsa, key: vec![id] },
            available_amount: amt(available),
            fee_deposit: amt(fee),
            exchange_base_url: exchange.to_string(),
        }
    }

    fn request(candidates: Vec<AvailableCoinInfo>, contract: &str, max_deposit_fee: &str) -> PayCoinSelectionRequest {
        PayCoinSelectionRequest {
            candidates,
            wire_fees_per_exchange: BTreeMap::new(),
            contract_amount: amt(contract),
            max_deposit_fee: amt(max_deposit_fee),
            max_wire_fee: amt("EUR:0"),
            wire_fee_amortization: 1,
            previous_selection: Vec::new(),
        }
    }

    fn total(sel: &PayCoinSelection) -> Amount {
        Amount::sum("EUR", &sel.coin_contributions).unwrap().amount
    }

    #[test]
    fn covered_deposit_fee() {
        let req = request(
            vec![coin(1, "EUR:1", "EUR:0.1", "https://ex/"), coin(2, "EUR:1", "EUR:0", "https://ex/")],
            "EUR:2",
            "EUR:0.1",
        );
        let sel = select_pay_coins(&req).unwrap().unwrap();
        assert_eq!(sel.coin_pubs.len(), 2);
        // Equal amounts: the cheaper coin goes first.
        assert_eq!(sel.coin_pubs[0], EddsaPublicKey([2; 32]));
        assert!(sel.customer_deposit_fees.is_zero());
        assert_eq!(total(&sel), amt("EUR:2"));
    }

    #[test]
    fn fees_exhaust_funds() {
        let coins = (1..=3).map(|i| coin(i, "EUR:1", "EUR:0.5", "https://ex/")).collect();
        let req = request(coins, "EUR:4", "EUR:0.2");
        assert_eq!(select_pay_coins(&req).unwrap(), None);
    }

    #[test]
    fn no_candidates() {
        let req = request(vec![], "EUR:1", "EUR:0");
        assert_eq!(select_pay_coins(&req).unwrap(), None);
    }

    #[test]
    fn customer_pays_uncovered_deposit_fee() {
        let req = request(vec![coin(1, "EUR:5", "EUR:0.3", "https://ex/")], "EUR:2", "EUR:0.1");
        let sel = select_pay_coins(&req).unwrap().unwrap();
        assert_eq!(sel.customer_deposit_fees, amt("EUR:0.2"));
        assert_eq!(sel.coin_contributions, vec![amt("EUR:2.2")]);
    }

    #[test]
    fn wire_fee_amortized_once_per_exchange() {
        let mut req = request(
            vec![coin(1, "EUR:1", "EUR:0", "https://a/"), coin(2, "EUR:1", "EUR:0", "https://a/")],
            "EUR:1.5",
            "EUR:0",
        );
        req.wire_fees_per_exchange.insert("https://a/".into(), amt("EUR:0.4"));
        req.max_wire_fee = amt("EUR:0.2");
        req.wire_fee_amortization = 2;
        let sel = select_pay_coins(&req).unwrap().unwrap();
        // (0.4 - 0.2) / 2 borne by the customer, once.
        assert_eq!(sel.customer_wire_fees, amt("EUR:0.1"));
        assert_eq!(total(&sel), amt("EUR:1.6"));
    }

    #[test]
    fn wire_fee_spills_into_deposit_allowance() {
        let mut req = request(vec![coin(1, "EUR:2", "EUR:0", "https://a/")], "EUR:1", "EUR:0.5");
        req.wire_fees_per_exchange.insert("https://a/".into(), amt("EUR:0.3"));
        let sel = select_pay_coins(&req).unwrap().unwrap();
        assert!(sel.customer_wire_fees.is_zero());
        assert_eq!(total(&sel), amt("EUR:1"));
    }

    #[test]
    fn fee_dominated_coin_is_skipped() {
        let req = request(
            vec![coin(1, "EUR:0.1", "EUR:0.2", "https://ex/"), coin(2, "EUR:1", "EUR:0", "https://ex/")],
            "EUR:1.05",
            "EUR:0",
        );
        // The small coin would cover the rest but costs more than it is worth.
        assert_eq!(select_pay_coins(&req).unwrap(), None);
    }

    #[test]
    fn fee_floor_on_small_remainder() {
        let req = request(
            vec![coin(1, "EUR:1", "EUR:0", "https://ex/"), coin(2, "EUR:0.5", "EUR:0.2", "https://ex/")],
            "EUR:1.05",
            "EUR:0.2",
        );
        let sel = select_pay_coins(&req).unwrap().unwrap();
        assert_eq!(sel.coin_contributions, vec![amt("EUR:1"), amt("EUR:0.2")]);
    }

    #[test]
    fn repair_keeps_previous_contributions() {
        let mut req = request(
            vec![coin(1, "EUR:3", "EUR:0", "https://ex/"), coin(2, "EUR:1", "EUR:0", "https://ex/")],
            "EUR:1.5",
            "EUR:0",
        );
        req.previous_selection.push(PreviousCoin {
            coin_pub: EddsaPublicKey([1; 32]),
            contribution: amt("EUR:0.5"),
            fee_deposit: amt("EUR:0"),
            exchange_base_url: "https://ex/".into(),
        });
        let sel = select_pay_coins(&req).unwrap().unwrap();
        assert_eq!(sel.coin_pubs, vec![EddsaPublicKey([1; 32]), EddsaPublicKey([2; 32])]);
        assert_eq!(sel.coin_contributions, vec![amt("EUR:0.5"), amt("EUR:1")]);
        assert_eq!(total(&sel), amt("EUR:1.5"));
    }

    #[test]
    fn ties_broken_by_denomination_key() {
        let a = coin(9, "EUR:1", "EUR:0", "https://ex/");
        let b = coin(3, "EUR:1", "EUR:0", "https://ex/");
        let req = request(vec![a, b], "EUR:1", "EUR:0");
        let sel = select_pay_coins(&req).unwrap().unwrap();
        assert_eq!(sel.coin_pubs, vec![EddsaPublicKey([3; 32])]);
    }

    #[test]
    fn currency_mismatch_is_an_error() {
        let req = request(vec![coin(1, "USD:1", "USD:0", "https://ex/")], "EUR:1", "EUR:0");
        assert!(matches!(select_pay_coins(&req), Err(AmountError::CurrencyMismatch { .. })));
    }
}
