//! Greedy choice of denominations for a withdrawal or refresh.

use ecash_core::records::{DenominationRecord, DenominationSelection, SelectedDenomination};
use ecash_core::{Amount, AmountError, Timestamp};
use tracing::trace;

/// Pick coins whose value plus withdraw fee fits into `amount`, largest
/// denomination first, each as many times as it fits.
///
/// Only denominations withdrawable at `now` are considered. The result's
/// `total_withdraw_cost` never exceeds `amount`.
pub fn select_withdrawal_denominations(
    amount: &Amount,
    denoms: &[DenominationRecord],
    now: Timestamp,
) -> Result<DenominationSelection, AmountError> {
    let currency = amount.currency.clone();
    let mut remaining = amount.clone();
    let mut selected = Vec::new();
    let mut total_coin_value = Amount::zero(currency.clone());
    let mut total_withdraw_cost = Amount::zero(currency);

    let mut usable: Vec<&DenominationRecord> = denoms
        .iter()
        .filter(|d| d.is_withdrawable(now) && d.value.currency == amount.currency)
        .collect();
    usable.sort_by(|a, b| b.value.units().cmp(&a.value.units()).then_with(|| a.denom_pub.cmp(&b.denom_pub)));

    for d in usable {
        let cost = d.value.saturating_add(&d.fee_withdraw)?;
        let cost_units = cost.units();
        if cost_units == 0 {
            continue;
        }
        let count = u32::try_from(remaining.units() / cost_units).unwrap_or(u32::MAX);
        if count > 0 {
            let spent = cost.mult(u64::from(count)).amount;
            remaining = remaining.saturating_sub(&spent)?;
            total_coin_value = total_coin_value.saturating_add(&d.value.mult(u64::from(count)).amount)?;
            total_withdraw_cost = total_withdraw_cost.saturating_add(&spent)?;
            trace!(denom = %d.denom_pub_hash, count, "selected denomination");
            selected.push(SelectedDenomination { denom_pub_hash: d.denom_pub_hash, count });
        }
        if remaining.is_zero() {
            break;
        }
    }

    Ok(DenominationSelection { selected, total_coin_value, total_withdraw_cost })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash_core::records::DenominationVerificationStatus;
    use ecash_core::types::{DenomCipher, DenominationPubKey, Hash256};

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn denom(id: u8, value: &str, fee: &str) -> DenominationRecord {
        let denom_pub = DenominationPubKey { cipher: DenomCipher::Eddsa, key: vec![id; 32] };
        DenominationRecord {
            exchange_base_url: "https://ex/".into(),
            denom_pub_hash: denom_pub.hash(),
            denom_pub,
            value: amt(value),
            fee_withdraw: amt(fee),
            fee_deposit: amt("EUR:0"),
            fee_refresh: amt("EUR:0"),
            fee_refund: amt("EUR:0"),
            stamp_start: Timestamp(0),
            stamp_expire_withdraw: Timestamp(1_000),
            stamp_expire_deposit: Timestamp(2_000),
            is_offered: true,
            is_revoked: false,
            verification_status: DenominationVerificationStatus::VerifiedGood,
        }
    }

    fn count_of(sel: &DenominationSelection, h: Hash256) -> u32 {
        sel.selected.iter().find(|s| s.denom_pub_hash == h).map_or(0, |s| s.count)
    }

    #[test]
    fn largest_first_with_fees() {
        let d10 = denom(1, "EUR:10", "EUR:0.01");
        let d1 = denom(2, "EUR:1", "EUR:0.01");
        let sel = select_withdrawal_denominations(&amt("EUR:23"), &[d1.clone(), d10.clone()], Timestamp(10)).unwrap();
        assert_eq!(count_of(&sel, d10.denom_pub_hash), 2);
        assert_eq!(count_of(&sel, d1.denom_pub_hash), 2);
        assert_eq!(sel.total_coin_value, amt("EUR:22"));
        assert_eq!(sel.total_withdraw_cost, amt("EUR:22.04"));
        assert_eq!(sel.coin_count(), 4);
    }

    #[test]
    fn skips_unwithdrawable() {
        let mut revoked = denom(1, "EUR:5", "EUR:0");
        revoked.is_revoked = true;
        let late = denom(2, "EUR:2", "EUR:0");
        let sel = select_withdrawal_denominations(&amt("EUR:5"), &[revoked, late.clone()], Timestamp(10)).unwrap();
        assert_eq!(sel.selected, vec![SelectedDenomination { denom_pub_hash: late.denom_pub_hash, count: 2 }]);

        let expired = select_withdrawal_denominations(&amt("EUR:5"), &[late], Timestamp(1_000)).unwrap();
        assert!(expired.selected.is_empty());
    }

    #[test]
    fn amount_below_cheapest_coin() {
        let sel = select_withdrawal_denominations(&amt("EUR:0.5"), &[denom(1, "EUR:1", "EUR:0")], Timestamp(1)).unwrap();
        assert!(sel.selected.is_empty());
        assert!(sel.total_coin_value.is_zero());
    }
}
