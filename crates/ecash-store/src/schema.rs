//! Store and index names, and the mapping of records onto them.

use std::fmt;

use ecash_core::records::{
    CoinRecord, DenominationRecord, DepositGroupRecord, ExchangeRecord, PlanchetRecord,
    RecoupGroupRecord, RefreshGroupRecord, ReserveRecord, WithdrawalGroupRecord,
};
use ecash_core::types::{
    DepositGroupId, EddsaPublicKey, Hash256, RecoupGroupId, RefreshGroupId, WithdrawalGroupId,
};

/// Bumped whenever the on-disk layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Named object stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreName {
    Coins,
    Denominations,
    Exchanges,
    Reserves,
    WithdrawalGroups,
    Planchets,
    RefreshGroups,
    RecoupGroups,
    DepositGroups,
}

impl StoreName {
    pub const ALL: [StoreName; 9] = [
        StoreName::Coins,
        StoreName::Denominations,
        StoreName::Exchanges,
        StoreName::Reserves,
        StoreName::WithdrawalGroups,
        StoreName::Planchets,
        StoreName::RefreshGroups,
        StoreName::RecoupGroups,
        StoreName::DepositGroups,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::Coins => "coins",
            StoreName::Denominations => "denominations",
            StoreName::Exchanges => "exchanges",
            StoreName::Reserves => "reserves",
            StoreName::WithdrawalGroups => "withdrawal_groups",
            StoreName::Planchets => "planchets",
            StoreName::RefreshGroups => "refresh_groups",
            StoreName::RecoupGroups => "recoup_groups",
            StoreName::DepositGroups => "deposit_groups",
        }
    }

    pub(crate) fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary indexes. Each belongs to exactly one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexName {
    CoinsByDenomPubHash,
    CoinsByBaseUrl,
    DenominationsByBaseUrl,
    PlanchetsByGroup,
    PlanchetsByGroupAndIndex,
    WithdrawalGroupsByReservePub,
}

impl IndexName {
    pub const ALL: [IndexName; 6] = [
        IndexName::CoinsByDenomPubHash,
        IndexName::CoinsByBaseUrl,
        IndexName::DenominationsByBaseUrl,
        IndexName::PlanchetsByGroup,
        IndexName::PlanchetsByGroupAndIndex,
        IndexName::WithdrawalGroupsByReservePub,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IndexName::CoinsByDenomPubHash => "coins.by_denom_pub_hash",
            IndexName::CoinsByBaseUrl => "coins.by_base_url",
            IndexName::DenominationsByBaseUrl => "denominations.by_base_url",
            IndexName::PlanchetsByGroup => "planchets.by_group",
            IndexName::PlanchetsByGroupAndIndex => "planchets.by_group_and_index",
            IndexName::WithdrawalGroupsByReservePub => "withdrawal_groups.by_reserve_pub",
        }
    }

    pub fn store(self) -> StoreName {
        match self {
            IndexName::CoinsByDenomPubHash | IndexName::CoinsByBaseUrl => StoreName::Coins,
            IndexName::DenominationsByBaseUrl => StoreName::Denominations,
            IndexName::PlanchetsByGroup | IndexName::PlanchetsByGroupAndIndex => {
                StoreName::Planchets
            }
            IndexName::WithdrawalGroupsByReservePub => StoreName::WithdrawalGroups,
        }
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concatenate key components, each prefixed by its big-endian `u32` length.
///
/// Length prefixes make composite keys unambiguous and keep every prefix
/// of components a valid scan prefix.
pub fn key_parts(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len() + 4).sum();
    let mut out = Vec::with_capacity(len);
    for p in parts {
        out.extend_from_slice(&(p.len() as u32).to_be_bytes());
        out.extend_from_slice(p);
    }
    out
}

/// A record type that lives in one named store.
pub trait StoreRecord: bincode::Encode + bincode::Decode<()> + Sized {
    const STORE: StoreName;
    type Key;

    fn encode_key(key: &Self::Key) -> Vec<u8>;

    fn key(&self) -> Self::Key;

    /// Index values for this record. Maintained on every put and delete.
    fn index_keys(&self) -> Vec<(IndexName, Vec<u8>)> {
        Vec::new()
    }
}

/// Lookup key for [`IndexName::PlanchetsByGroupAndIndex`].
pub fn planchet_group_index_key(group: &WithdrawalGroupId, coin_idx: u32) -> Vec<u8> {
    key_parts(&[group.as_ref(), &coin_idx.to_be_bytes()])
}

impl StoreRecord for CoinRecord {
    const STORE: StoreName = StoreName::Coins;
    type Key = EddsaPublicKey;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.coin_pub
    }

    fn index_keys(&self) -> Vec<(IndexName, Vec<u8>)> {
        vec![
            (IndexName::CoinsByDenomPubHash, self.denom_pub_hash.0.to_vec()),
            (IndexName::CoinsByBaseUrl, self.exchange_base_url.as_bytes().to_vec()),
        ]
    }
}

impl StoreRecord for DenominationRecord {
    const STORE: StoreName = StoreName::Denominations;
    type Key = (String, Hash256);

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key_parts(&[key.0.as_bytes(), key.1.as_ref()])
    }

    fn key(&self) -> Self::Key {
        (self.exchange_base_url.clone(), self.denom_pub_hash)
    }

    fn index_keys(&self) -> Vec<(IndexName, Vec<u8>)> {
        vec![(IndexName::DenominationsByBaseUrl, self.exchange_base_url.as_bytes().to_vec())]
    }
}

impl StoreRecord for ExchangeRecord {
    const STORE: StoreName = StoreName::Exchanges;
    type Key = String;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.as_bytes().to_vec()
    }

    fn key(&self) -> Self::Key {
        self.base_url.clone()
    }
}

impl StoreRecord for ReserveRecord {
    const STORE: StoreName = StoreName::Reserves;
    type Key = EddsaPublicKey;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.reserve_pub
    }
}

impl StoreRecord for WithdrawalGroupRecord {
    const STORE: StoreName = StoreName::WithdrawalGroups;
    type Key = WithdrawalGroupId;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.withdrawal_group_id
    }

    fn index_keys(&self) -> Vec<(IndexName, Vec<u8>)> {
        vec![(IndexName::WithdrawalGroupsByReservePub, self.reserve_pub.0.to_vec())]
    }
}

impl StoreRecord for PlanchetRecord {
    const STORE: StoreName = StoreName::Planchets;
    type Key = EddsaPublicKey;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.coin_pub
    }

    fn index_keys(&self) -> Vec<(IndexName, Vec<u8>)> {
        vec![
            (IndexName::PlanchetsByGroup, self.withdrawal_group_id.0.to_vec()),
            (
                IndexName::PlanchetsByGroupAndIndex,
                planchet_group_index_key(&self.withdrawal_group_id, self.coin_idx),
            ),
        ]
    }
}

impl StoreRecord for RefreshGroupRecord {
    const STORE: StoreName = StoreName::RefreshGroups;
    type Key = RefreshGroupId;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.refresh_group_id
    }
}

impl StoreRecord for RecoupGroupRecord {
    const STORE: StoreName = StoreName::RecoupGroups;
    type Key = RecoupGroupId;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.recoup_group_id
    }
}

impl StoreRecord for DepositGroupRecord {
    const STORE: StoreName = StoreName::DepositGroups;
    type Key = DepositGroupId;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        key.0.to_vec()
    }

    fn key(&self) -> Self::Key {
        self.deposit_group_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parts_prefix_property() {
        let b = |s: &'static str| s.as_bytes();
        let full = key_parts(&[b("abc"), b("def")]);
        let prefix = key_parts(&[b("abc")]);
        assert!(full.starts_with(&prefix));
        // "ab" + "cdef" must not collide with "abc" + "def"
        assert_ne!(full, key_parts(&[b("ab"), b("cdef")]));
        assert!(!key_parts(&[b("ab"), b("c")]).starts_with(&prefix));
    }

    #[test]
    fn every_index_belongs_to_a_store() {
        for idx in IndexName::ALL {
            assert!(StoreName::ALL.contains(&idx.store()));
            assert!(idx.as_str().starts_with(idx.store().as_str()));
        }
    }

    #[test]
    fn ordinals_are_dense() {
        for (i, s) in StoreName::ALL.iter().enumerate() {
            assert_eq!(s.ordinal(), i);
        }
    }
}
