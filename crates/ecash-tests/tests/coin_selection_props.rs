//! Property tests for payment coin selection.
//!
//! Candidate sets are random wallets of up to 24 coins spread over three
//! exchanges, with amounts in whole cents.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use ecash_core::types::DenomCipher;
use ecash_core::{Amount, DenominationPubKey, EddsaPublicKey};
use ecash_wallet::coin_selection::{AvailableCoinInfo, PayCoinSelectionRequest, PreviousCoin, select_pay_coins};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn cents(c: u64) -> Amount {
    Amount::new("EUR", c / 100, ((c % 100) * 1_000_000) as u32).unwrap()
}

fn total(amounts: &[Amount]) -> Amount {
    Amount::sum("EUR", amounts).unwrap().amount
}

fn url(i: u8) -> String {
    format!("https://ex{i}.test/")
}

fn coin(idx: usize, value: u64, fee: u64, exchange: u8) -> AvailableCoinInfo {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&(idx as u64).to_le_bytes());
    // Denomination keys are per exchange, like real ones.
    let mut denom_key = vec![exchange];
    denom_key.extend_from_slice(&value.to_be_bytes());
    AvailableCoinInfo {
        coin_pub: EddsaPublicKey(key),
        denom_pub: DenominationPubKey { cipher: DenomCipher::Eddsa, key: denom_key },
        available_amount: cents(value),
        fee_deposit: cents(fee),
        exchange_base_url: url(exchange),
    }
}

fn wallet_strategy() -> impl Strategy<Value = Vec<AvailableCoinInfo>> {
    prop::collection::vec((1u64..2_000, 0u64..30, 0u8..3), 0..24).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (value, fee, ex))| coin(i, value, fee, ex))
            .collect()
    })
}

fn request(
    candidates: Vec<AvailableCoinInfo>,
    contract: u64,
    max_deposit_fee: u64,
    wire_fee: u64,
) -> PayCoinSelectionRequest {
    let wire_fees_per_exchange: BTreeMap<String, Amount> = (0..3).map(|i| (url(i), cents(wire_fee))).collect();
    PayCoinSelectionRequest {
        candidates,
        wire_fees_per_exchange,
        contract_amount: cents(contract),
        max_deposit_fee: cents(max_deposit_fee),
        max_wire_fee: cents(0),
        wire_fee_amortization: 1,
        previous_selection: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// A selection covers the contract plus every customer-borne fee, never
// takes more than a coin holds, and overshoots by less than one deposit fee.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn selection_is_sound(
        coins in wallet_strategy(),
        contract in 1u64..5_000,
        allowance in 0u64..50,
        wire_fee in 0u64..20,
    ) {
        let req = request(coins.clone(), contract, allowance, wire_fee);
        let Some(sel) = select_pay_coins(&req).unwrap() else {
            return Ok(());
        };
        let by_pub: BTreeMap<EddsaPublicKey, &AvailableCoinInfo> =
            coins.iter().map(|c| (c.coin_pub, c)).collect();

        prop_assert_eq!(sel.coin_pubs.len(), sel.coin_contributions.len());
        for (pub_key, contribution) in sel.coin_pubs.iter().zip(&sel.coin_contributions) {
            let c = by_pub[pub_key];
            prop_assert!(contribution.cmp_amount(&c.available_amount).unwrap().is_le());
        }

        let paid = total(&sel.coin_contributions);
        let required = total(&[
            sel.payment_amount.clone(),
            sel.customer_wire_fees.clone(),
            sel.customer_deposit_fees.clone(),
        ]);
        prop_assert!(paid.cmp_amount(&required).unwrap().is_ge(), "paid {} < required {}", paid, required);
        let overshoot = paid.saturating_sub(&required).unwrap();
        prop_assert!(overshoot.cmp_amount(&cents(30)).unwrap().is_lt(), "overshoot {}", overshoot);
    }
}

// ---------------------------------------------------------------------------
// When the usable coins cannot even cover the bare contract, selection
// reports insufficient funds.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn insufficient_wallet_yields_none(
        coins in wallet_strategy(),
        extra in 1u64..1_000,
        allowance in 0u64..50,
    ) {
        let usable: Vec<Amount> = coins
            .iter()
            .filter(|c| c.fee_deposit.cmp_amount(&c.available_amount).unwrap().is_le())
            .map(|c| c.available_amount.clone())
            .collect();
        let wallet_total = total(&usable);
        let contract = wallet_total.value * 100 + u64::from(wallet_total.fraction / 1_000_000) + extra;
        let req = request(coins, contract, allowance, 0);
        prop_assert!(select_pay_coins(&req).unwrap().is_none());
    }
}

// ---------------------------------------------------------------------------
// A larger merchant fee allowance never makes a payment fail that used to
// succeed, and never raises what the customer pays in fees.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn larger_allowance_never_costs_more(
        coins in wallet_strategy(),
        contract in 1u64..5_000,
        allowance in 0u64..50,
        raise in 0u64..50,
    ) {
        let low = select_pay_coins(&request(coins.clone(), contract, allowance, 0)).unwrap();
        let high = select_pay_coins(&request(coins, contract, allowance + raise, 0)).unwrap();
        if let Some(low) = low {
            let high = high.expect("raising the allowance broke a feasible payment");
            let low_fees = low.customer_deposit_fees.saturating_add(&low.customer_wire_fees).unwrap();
            let high_fees = high.customer_deposit_fees.saturating_add(&high.customer_wire_fees).unwrap();
            prop_assert!(high_fees.cmp_amount(&low_fees).unwrap().is_le(), "{} > {}", high_fees, low_fees);
        }
    }
}

// ---------------------------------------------------------------------------
// Input order does not matter: reversing the candidate list yields the same
// contributions and fees.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn selection_ignores_candidate_order(
        coins in wallet_strategy(),
        contract in 1u64..5_000,
        allowance in 0u64..50,
        wire_fee in 0u64..20,
    ) {
        let forward = select_pay_coins(&request(coins.clone(), contract, allowance, wire_fee)).unwrap();
        let mut reversed = coins;
        reversed.reverse();
        let backward = select_pay_coins(&request(reversed, contract, allowance, wire_fee)).unwrap();
        match (forward, backward) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                prop_assert_eq!(a.coin_contributions, b.coin_contributions);
                prop_assert_eq!(a.customer_deposit_fees, b.customer_deposit_fees);
                prop_assert_eq!(a.customer_wire_fees, b.customer_wire_fees);
            }
            (a, b) => prop_assert!(false, "order changed feasibility: {:?} vs {:?}", a.is_some(), b.is_some()),
        }
    }
}

// ---------------------------------------------------------------------------
// No coin is used twice, and coins of a previous selection are kept as they
// were rather than selected again.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn repaired_selection_never_reuses_coins(
        coins in wallet_strategy(),
        contract in 1u64..5_000,
        keep in 0usize..4,
    ) {
        let mut req = request(coins.clone(), contract, 10, 5);
        req.previous_selection = coins
            .iter()
            .take(keep)
            .filter(|c| c.fee_deposit.cmp_amount(&c.available_amount).unwrap().is_le())
            .map(|c| PreviousCoin {
                coin_pub: c.coin_pub,
                contribution: c.available_amount.clone(),
                fee_deposit: c.fee_deposit.clone(),
                exchange_base_url: c.exchange_base_url.clone(),
            })
            .collect();
        let Some(sel) = select_pay_coins(&req).unwrap() else {
            return Ok(());
        };
        let unique: BTreeSet<_> = sel.coin_pubs.iter().collect();
        prop_assert_eq!(unique.len(), sel.coin_pubs.len());
        for (i, prev) in req.previous_selection.iter().enumerate() {
            prop_assert_eq!(sel.coin_pubs[i], prev.coin_pub);
            prop_assert_eq!(&sel.coin_contributions[i], &prev.contribution);
        }
    }
}
