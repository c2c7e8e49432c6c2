//! Store behavior on real wallet records: index upkeep, scope checks,
//! rollback and persistence across reopen.

use ecash_core::records::{CoinRecord, CoinSource, CoinStatus, DenominationRecord};
use ecash_core::{Amount, EddsaPublicKey, WithdrawalGroupId};
use ecash_crypto::primitives;
use ecash_store::{Database, IndexName, StoreError, StoreName};
use ecash_tests::helpers::{DenomFixture, EXCHANGE_URL, amt, denomination};

fn coin(seed: u8, denom: &DenomFixture) -> CoinRecord {
    let keys = primitives::keypair_from_secret([seed; 32]);
    let coin_ev = primitives::coin_envelope(&keys.pub_key);
    CoinRecord {
        coin_pub: keys.pub_key,
        coin_priv: keys.priv_key.clone(),
        exchange_base_url: EXCHANGE_URL.into(),
        denom_pub: denom.record.denom_pub.clone(),
        denom_pub_hash: denom.record.denom_pub_hash,
        denom_sig: primitives::sign(&denom.priv_key, &coin_ev),
        blinding_key: [seed; 32],
        coin_ev_hash: primitives::sha256(&coin_ev),
        current_amount: denom.record.value.clone(),
        status: CoinStatus::Fresh,
        coin_source: CoinSource::Withdraw {
            withdrawal_group_id: WithdrawalGroupId([seed; 32]),
            coin_index: 0,
            reserve_pub: EddsaPublicKey([0xaa; 32]),
        },
        allocation: None,
        suspended: false,
    }
}

fn coins_of(db: &Database, denom: &DenomFixture) -> Vec<EddsaPublicKey> {
    db.run_read_only(&[StoreName::Coins], |tx| {
        tx.index::<CoinRecord>(IndexName::CoinsByDenomPubHash, denom.record.denom_pub_hash.as_ref())?
            .map_records(|c| c.coin_pub)
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

#[test]
fn index_follows_updates_and_deletes() {
    let db = Database::open_memory().unwrap();
    let one = denomination(1, "EUR:1", "EUR:0.01");
    let two = denomination(2, "EUR:2", "EUR:0.01");
    let mut a = coin(1, &one);
    let b = coin(2, &one);

    db.run_read_write(&[StoreName::Coins], |tx| {
        tx.put(&a)?;
        tx.put(&b)
    })
    .unwrap();
    let mut expected = vec![a.coin_pub, b.coin_pub];
    expected.sort();
    assert_eq!(coins_of(&db, &one), expected);

    // Moving a coin to another denomination drops its old index entry.
    a.denom_pub_hash = two.record.denom_pub_hash;
    db.run_read_write(&[StoreName::Coins], |tx| tx.put(&a)).unwrap();
    assert_eq!(coins_of(&db, &one), vec![b.coin_pub]);
    assert_eq!(coins_of(&db, &two), vec![a.coin_pub]);

    let existed = db.run_read_write(&[StoreName::Coins], |tx| tx.delete::<CoinRecord>(&b.coin_pub)).unwrap();
    assert!(existed);
    assert!(coins_of(&db, &one).is_empty());
}

#[test]
fn index_lookup_sees_uncommitted_writes() {
    let db = Database::open_memory().unwrap();
    let one = denomination(1, "EUR:1", "EUR:0.01");
    let c = coin(7, &one);
    let seen = db
        .run_read_write(&[StoreName::Coins], |tx| {
            tx.put(&c)?;
            tx.index_first::<CoinRecord>(IndexName::CoinsByBaseUrl, EXCHANGE_URL.as_bytes())
        })
        .unwrap();
    assert_eq!(seen.map(|c| c.coin_pub), Some(c.coin_pub));
}

#[test]
fn denominations_by_exchange() {
    let db = Database::open_memory().unwrap();
    let mut other = denomination(3, "EUR:5", "EUR:0.01").record;
    other.exchange_base_url = "https://other.test/".into();
    let mine = denomination(4, "EUR:1", "EUR:0.01").record;
    db.run_read_write(&[StoreName::Denominations], |tx| {
        tx.put(&other)?;
        tx.put(&mine)
    })
    .unwrap();

    let found = db
        .run_read_only(&[StoreName::Denominations], |tx| {
            tx.index::<DenominationRecord>(IndexName::DenominationsByBaseUrl, EXCHANGE_URL.as_bytes())?
                .to_vec()
        })
        .unwrap();
    assert_eq!(found, vec![mine]);
}

#[test]
fn index_of_foreign_store_is_rejected() {
    let db = Database::open_memory().unwrap();
    let r = db.run_read_only(&[StoreName::Coins], |tx| {
        tx.index::<CoinRecord>(IndexName::PlanchetsByGroup, &[0; 32]).map(|c| c.count())
    });
    assert!(matches!(r, Err(StoreError::Backend(_))));
}

// ---------------------------------------------------------------------------
// Atomicity
// ---------------------------------------------------------------------------

#[test]
fn out_of_scope_access_aborts_everything() {
    let db = Database::open_memory().unwrap();
    let one = denomination(1, "EUR:1", "EUR:0.01");
    let c = coin(1, &one);
    let r = db.run_read_write(&[StoreName::Coins], |tx| {
        tx.put(&c)?;
        tx.put(&one.record)
    });
    assert_eq!(r, Err(StoreError::NotInScope(StoreName::Denominations)));
    assert!(coins_of(&db, &one).is_empty());
}

#[test]
fn failed_body_leaves_amounts_untouched() {
    let db = Database::open_memory().unwrap();
    let one = denomination(1, "EUR:1", "EUR:0.01");
    let c = coin(1, &one);
    db.run_read_write(&[StoreName::Coins], |tx| tx.put(&c)).unwrap();

    let r: Result<(), StoreError> = db.run_read_write(&[StoreName::Coins], |tx| {
        let mut c = tx.get::<CoinRecord>(&c.coin_pub)?.unwrap();
        c.current_amount = Amount::zero("EUR");
        c.status = CoinStatus::Dormant;
        tx.put(&c)?;
        Err(StoreError::Aborted)
    });
    assert_eq!(r, Err(StoreError::Aborted));

    let after = db.run_read_only(&[StoreName::Coins], |tx| tx.get::<CoinRecord>(&c.coin_pub)).unwrap().unwrap();
    assert_eq!(after.current_amount, amt("EUR:1"));
    assert_eq!(after.status, CoinStatus::Fresh);
}

// ---------------------------------------------------------------------------
// RocksDB backend
// ---------------------------------------------------------------------------

#[test]
fn rocks_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wallet-db");
    let one = denomination(1, "EUR:1", "EUR:0.01");
    let c = coin(9, &one);
    {
        let db = Database::open_rocks(&path).unwrap();
        db.run_read_write(&[StoreName::Coins, StoreName::Denominations], |tx| {
            tx.put(&one.record)?;
            tx.put(&c)
        })
        .unwrap();
    }

    let db = Database::open_rocks(&path).unwrap();
    let back = db.run_read_only(&[StoreName::Coins], |tx| tx.get::<CoinRecord>(&c.coin_pub)).unwrap();
    assert_eq!(back, Some(c.clone()));
    assert_eq!(coins_of(&db, &one), vec![c.coin_pub]);
}

#[test]
fn rocks_rollback_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_rocks(dir.path().join("wallet-db")).unwrap();
    let one = denomination(1, "EUR:1", "EUR:0.01");
    let c = coin(3, &one);
    let r: Result<(), StoreError> = db.run_read_write(&[StoreName::Coins], |tx| {
        tx.put(&c)?;
        Err(StoreError::Aborted)
    });
    assert!(r.is_err());
    assert!(coins_of(&db, &one).is_empty());
}
