//! Applying a coin selection to the coin store.

use ecash_core::records::{CoinAllocation, CoinRecord, CoinStatus, PayCoinSelection, RefreshReason};
use ecash_core::{RefreshGroupId, Timestamp};
use ecash_store::{ReadWrite, Tx};
use tracing::debug;

use crate::error::WalletError;
use crate::refresh::create_refresh_group;

/// Debit every coin of `selection` for the spend `allocation_id` and put
/// the spent coins into a refresh group so their change comes back.
///
/// Re-applying the same allocation is a no-op for coins that already
/// carry it. Needs `coins`, `denominations` and `refresh_groups` in scope.
pub fn apply_coin_spend(
    tx: &mut Tx<'_, ReadWrite>,
    selection: &PayCoinSelection,
    allocation_id: &str,
    reason: RefreshReason,
    now: Timestamp,
) -> Result<RefreshGroupId, WalletError> {
    if selection.coin_pubs.len() != selection.coin_contributions.len() {
        return Err(WalletError::invariant("coin selection lists differ in length"));
    }
    for (coin_pub, contribution) in selection.coin_pubs.iter().zip(&selection.coin_contributions) {
        let mut coin = tx
            .get::<CoinRecord>(coin_pub)?
            .ok_or_else(|| WalletError::invariant(format!("coin {coin_pub} not found")))?;
        if let Some(existing) = &coin.allocation {
            if existing.id != allocation_id || existing.amount != *contribution {
                return Err(WalletError::invariant(format!(
                    "coin {coin_pub} already allocated to {}",
                    existing.id
                )));
            }
            debug!(coin = %coin_pub, allocation_id, "coin already allocated");
            continue;
        }
        let remaining = coin.current_amount.sub(contribution)?;
        if remaining.saturated {
            return Err(WalletError::invariant(format!(
                "coin {coin_pub} holds {} but {contribution} was spent",
                coin.current_amount
            )));
        }
        coin.status = CoinStatus::Dormant;
        coin.allocation = Some(CoinAllocation { id: allocation_id.to_string(), amount: contribution.clone() });
        coin.current_amount = remaining.amount;
        tx.put(&coin)?;
    }
    create_refresh_group(tx, &selection.coin_pubs, reason, now)
}
