//! Per-currency balances.

use std::collections::BTreeMap;

use ecash_core::Amount;
use ecash_core::records::{CoinRecord, CoinStatus, RefreshCoinStatus, RefreshGroupRecord};
use ecash_store::{StoreName, Tx};
use serde::Serialize;

use crate::error::WalletError;
use crate::wallet::Wallet;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CurrencyBalance {
    pub currency: String,
    /// Value of fresh coins that can be spent now.
    pub available: Amount,
    /// Estimated value of change still being refreshed.
    pub pending_incoming: Amount,
}

fn entry<'a>(map: &'a mut BTreeMap<String, CurrencyBalance>, currency: &str) -> &'a mut CurrencyBalance {
    map.entry(currency.to_string()).or_insert_with(|| CurrencyBalance {
        currency: currency.to_string(),
        available: Amount::zero(currency),
        pending_incoming: Amount::zero(currency),
    })
}

/// Balances as seen by `tx`. Needs `coins` and `refresh_groups` in scope.
pub(crate) fn balances_in<M>(tx: &Tx<'_, M>) -> Result<Vec<CurrencyBalance>, WalletError> {
    let mut map = BTreeMap::new();
    for coin in tx.iter::<CoinRecord>()? {
        let coin = coin?;
        if coin.status != CoinStatus::Fresh || coin.suspended {
            continue;
        }
        let b = entry(&mut map, &coin.current_amount.currency);
        b.available = b.available.saturating_add(&coin.current_amount)?;
    }
    for group in tx.iter::<RefreshGroupRecord>()? {
        let group = group?;
        if group.timestamp_finished.is_some() {
            continue;
        }
        for (status, output) in group.status_per_coin.iter().zip(&group.estimated_output_per_coin) {
            if *status != RefreshCoinStatus::Pending {
                continue;
            }
            let b = entry(&mut map, &output.currency);
            b.pending_incoming = b.pending_incoming.saturating_add(output)?;
        }
    }
    Ok(map.into_values().collect())
}

impl Wallet {
    pub fn get_balances(&self) -> Result<Vec<CurrencyBalance>, WalletError> {
        self.db
            .run_read_only(&[StoreName::Coins, StoreName::RefreshGroups], |tx| balances_in(tx))
    }
}
