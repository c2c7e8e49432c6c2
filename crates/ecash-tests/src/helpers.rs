//! Shared fixtures: a scripted exchange, denominations and a ready wallet.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ecash_core::exchange::*;
use ecash_core::records::{
    CoinRecord, CoinSource, CoinStatus, DenominationRecord, DenominationVerificationStatus, ExchangeRecord, WireFee,
};
use ecash_core::{Amount, EddsaPrivateKey, EddsaPublicKey, ExchangeError, Hash256, Timestamp, WithdrawalGroupId};
use ecash_crypto::{CryptoWorkerPool, eddsa_denomination_key, primitives};
use ecash_store::{Database, StoreName, StoreRecord};
use ecash_wallet::{Wallet, WalletConfig};

pub const EXCHANGE_URL: &str = "https://exchange.test/";
pub const CURRENCY: &str = "EUR";

pub fn amt(s: &str) -> Amount {
    s.parse().unwrap()
}

/// A denomination together with the exchange's signing key for it.
#[derive(Clone, Debug)]
pub struct DenomFixture {
    pub record: DenominationRecord,
    pub priv_key: EddsaPrivateKey,
}

pub fn denomination(tag: u8, value: &str, fee: &str) -> DenomFixture {
    let (denom_pub, priv_key) = eddsa_denomination_key([tag; 32]);
    DenomFixture {
        record: DenominationRecord {
            exchange_base_url: EXCHANGE_URL.into(),
            denom_pub_hash: denom_pub.hash(),
            denom_pub,
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
        },
        priv_key,
    }
}

/// EUR 8, 4, 2, 1, 0.5 and 0.1 with a 0.01 fee on every operation.
pub fn standard_denominations() -> Vec<DenomFixture> {
    vec![
        denomination(1, "EUR:8", "EUR:0.01"),
        denomination(2, "EUR:4", "EUR:0.01"),
        denomination(3, "EUR:2", "EUR:0.01"),
        denomination(4, "EUR:1", "EUR:0.01"),
        denomination(5, "EUR:0.5", "EUR:0.01"),
        denomination(6, "EUR:0.1", "EUR:0.01"),
    ]
}

pub fn exchange_record(wire_fee: &str) -> ExchangeRecord {
    ExchangeRecord {
        base_url: EXCHANGE_URL.into(),
        currency: CURRENCY.into(),
        master_pub: EddsaPublicKey([0xee; 32]),
        wire_fees: vec![WireFee {
            wire_method: "iban".into(),
            fee: amt(wire_fee),
            closing_fee: amt("EUR:0"),
            start_stamp: Timestamp(0),
            end_stamp: Timestamp(u64::MAX),
        }],
        last_update: Some(Timestamp::now()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ReserveStatus,
    Withdraw,
    Deposit,
    Melt,
    Reveal,
    Recoup,
}

/// Where the value of a coin goes back to on recoup.
#[derive(Clone, Copy, Debug)]
enum Origin {
    Reserve(EddsaPublicKey),
    Coin(EddsaPublicKey),
}

#[derive(Default)]
struct MockState {
    reserves: HashMap<EddsaPublicKey, Amount>,
    denoms: HashMap<Hash256, DenomFixture>,
    failures: HashMap<Endpoint, VecDeque<ExchangeError>>,
    deposit_failures: HashMap<EddsaPublicKey, VecDeque<ExchangeError>>,
    delays: HashMap<Endpoint, Duration>,
    calls: HashMap<Endpoint, usize>,
    deposits: Vec<DepositRequest>,
    origins: HashMap<Vec<u8>, Origin>,
    unknown_coins: HashSet<EddsaPublicKey>,
    noreveal_index: u32,
    corrupt_signatures: bool,
}

/// In-process exchange double.
///
/// Signs envelopes with real denomination keys, tracks reserve balances
/// and coin origins, counts calls per endpoint and replays scripted
/// failures before answering normally.
#[derive(Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.state.lock().noreveal_index = 1;
        mock
    }

    pub fn add_denomination(&self, denom: &DenomFixture) {
        self.state.lock().denoms.insert(denom.record.denom_pub_hash, denom.clone());
    }

    pub fn fund_reserve(&self, reserve_pub: EddsaPublicKey, amount: &Amount) {
        let mut st = self.state.lock();
        let balance = st.reserves.entry(reserve_pub).or_insert_with(|| Amount::zero(amount.currency.clone()));
        *balance = balance.saturating_add(amount).unwrap();
    }

    pub fn reserve_balance(&self, reserve_pub: &EddsaPublicKey) -> Option<Amount> {
        self.state.lock().reserves.get(reserve_pub).cloned()
    }

    /// Fail the next call to `endpoint` with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, endpoint: Endpoint, err: ExchangeError) {
        self.state.lock().failures.entry(endpoint).or_default().push_back(err);
    }

    /// Fail the next deposit of `coin_pub` with `err`.
    pub fn fail_deposit_of(&self, coin_pub: EddsaPublicKey, err: ExchangeError) {
        self.state.lock().deposit_failures.entry(coin_pub).or_default().push_back(err);
    }

    pub fn delay(&self, endpoint: Endpoint, delay: Duration) {
        self.state.lock().delays.insert(endpoint, delay);
    }

    /// Melting `coin_pub` will be answered with "coin unknown".
    pub fn forget_coin(&self, coin_pub: EddsaPublicKey) {
        self.state.lock().unknown_coins.insert(coin_pub);
    }

    /// Undo [`forget_coin`](Self::forget_coin).
    pub fn recognize_coin(&self, coin_pub: &EddsaPublicKey) {
        self.state.lock().unknown_coins.remove(coin_pub);
    }

    pub fn corrupt_signatures(&self, corrupt: bool) {
        self.state.lock().corrupt_signatures = corrupt;
    }

    /// Remember that `coin_pub` was withdrawn from `reserve_pub`, for coins
    /// placed in the wallet without going through a withdrawal.
    pub fn register_withdrawn(&self, coin_pub: &EddsaPublicKey, reserve_pub: EddsaPublicKey) {
        self.state.lock().origins.insert(primitives::coin_envelope(coin_pub), Origin::Reserve(reserve_pub));
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.state.lock().calls.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn deposits(&self) -> Vec<DepositRequest> {
        self.state.lock().deposits.clone()
    }

    /// Count the call, wait out any configured delay, then pop a scripted
    /// failure if one is queued.
    async fn enter(&self, endpoint: Endpoint) -> Result<(), ExchangeError> {
        let delay = {
            let mut st = self.state.lock();
            *st.calls.entry(endpoint).or_default() += 1;
            st.delays.get(&endpoint).copied()
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        match self.state.lock().failures.get_mut(&endpoint).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn sign(st: &MockState, denom_pub_hash: &Hash256, coin_ev: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        let denom = st
            .denoms
            .get(denom_pub_hash)
            .ok_or_else(|| ExchangeError::UnexpectedStatus { status: 404, message: "unknown denomination".into() })?;
        let mut sig = primitives::sign(&denom.priv_key, coin_ev);
        if st.corrupt_signatures {
            sig[0] ^= 0xff;
        }
        Ok(sig)
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn reserve_status(
        &self,
        _exchange_base_url: &str,
        reserve_pub: &EddsaPublicKey,
    ) -> Result<ReserveStatusResponse, ExchangeError> {
        self.enter(Endpoint::ReserveStatus).await?;
        let st = self.state.lock();
        let balance = st.reserves.get(reserve_pub).cloned().unwrap_or_else(|| Amount::zero(CURRENCY));
        Ok(ReserveStatusResponse { balance })
    }

    async fn withdraw(&self, _exchange_base_url: &str, req: &WithdrawRequest) -> Result<WithdrawResponse, ExchangeError> {
        self.enter(Endpoint::Withdraw).await?;
        let mut st = self.state.lock();
        // Repeated requests for the same envelope are not charged again.
        if st.origins.contains_key(&req.coin_ev) {
            let ev_sig = Self::sign(&st, &req.denom_pub_hash, &req.coin_ev)?;
            return Ok(WithdrawResponse { ev_sig });
        }
        let cost = {
            let d = st
                .denoms
                .get(&req.denom_pub_hash)
                .ok_or_else(|| ExchangeError::UnexpectedStatus { status: 404, message: "unknown denomination".into() })?;
            d.record.value.saturating_add(&d.record.fee_withdraw).unwrap()
        };
        let balance = st
            .reserves
            .get_mut(&req.reserve_pub)
            .ok_or_else(|| ExchangeError::UnexpectedStatus { status: 404, message: "unknown reserve".into() })?;
        let after = balance.sub(&cost).unwrap();
        if after.saturated {
            return Err(ExchangeError::UnexpectedStatus { status: 409, message: "insufficient reserve balance".into() });
        }
        *balance = after.amount;
        let ev_sig = Self::sign(&st, &req.denom_pub_hash, &req.coin_ev)?;
        st.origins.insert(req.coin_ev.clone(), Origin::Reserve(req.reserve_pub));
        Ok(WithdrawResponse { ev_sig })
    }

    async fn deposit(&self, _exchange_base_url: &str, req: &DepositRequest) -> Result<DepositResponse, ExchangeError> {
        self.enter(Endpoint::Deposit).await?;
        let mut st = self.state.lock();
        if let Some(err) = st.deposit_failures.get_mut(&req.coin_pub).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        st.deposits.push(req.clone());
        Ok(DepositResponse {
            exchange_sig: vec![0; 64],
            exchange_pub: EddsaPublicKey([0xee; 32]),
            exchange_timestamp: Timestamp::now(),
        })
    }

    async fn melt(&self, _exchange_base_url: &str, req: &MeltRequest) -> Result<MeltResponse, ExchangeError> {
        self.enter(Endpoint::Melt).await?;
        let st = self.state.lock();
        if st.unknown_coins.contains(&req.coin_pub) {
            return Err(ExchangeError::CoinNotFound);
        }
        Ok(MeltResponse { noreveal_index: st.noreveal_index })
    }

    async fn reveal(&self, _exchange_base_url: &str, req: &RevealRequest) -> Result<RevealResponse, ExchangeError> {
        self.enter(Endpoint::Reveal).await?;
        if req.coin_evs.len() != req.new_denoms_h.len() || req.link_sigs.len() != req.coin_evs.len() {
            return Err(ExchangeError::UnexpectedStatus { status: 400, message: "length mismatch".into() });
        }
        let mut st = self.state.lock();
        let mut ev_sigs = Vec::with_capacity(req.coin_evs.len());
        for (coin_ev, denom_hash) in req.coin_evs.iter().zip(&req.new_denoms_h) {
            ev_sigs.push(Self::sign(&st, denom_hash, coin_ev)?);
        }
        for coin_ev in &req.coin_evs {
            st.origins.insert(coin_ev.clone(), Origin::Coin(req.old_coin_pub));
        }
        Ok(RevealResponse { ev_sigs })
    }

    async fn recoup(&self, _exchange_base_url: &str, req: &RecoupRequest) -> Result<RecoupResponse, ExchangeError> {
        self.enter(Endpoint::Recoup).await?;
        let mut st = self.state.lock();
        let envelope = primitives::coin_envelope(&req.coin_pub);
        let origin = st.origins.get(&envelope).copied().ok_or(ExchangeError::CoinNotFound)?;
        match origin {
            Origin::Reserve(reserve_pub) => {
                let value = st.denoms.get(&req.denom_pub_hash).map(|d| d.record.value.clone());
                if let Some(value) = value {
                    let balance = st.reserves.entry(reserve_pub).or_insert_with(|| Amount::zero(CURRENCY));
                    *balance = balance.saturating_add(&value).unwrap();
                }
                Ok(RecoupResponse { reserve_pub: Some(reserve_pub), old_coin_pub: None })
            }
            Origin::Coin(old_coin_pub) => Ok(RecoupResponse { reserve_pub: None, old_coin_pub: Some(old_coin_pub) }),
        }
    }
}

/// A wallet wired to a [`MockExchange`] that knows `denoms`.
pub struct TestWallet {
    pub wallet: Wallet,
    pub exchange: Arc<MockExchange>,
    pub denoms: Vec<DenomFixture>,
}

pub fn test_config() -> WalletConfig {
    WalletConfig {
        request_timeout_secs: 1,
        crypto_concurrency: Some(2),
        ..WalletConfig::default()
    }
}

pub fn test_wallet_with(denoms: Vec<DenomFixture>, wire_fee: &str) -> TestWallet {
    let exchange = Arc::new(MockExchange::new());
    for d in &denoms {
        exchange.add_denomination(d);
    }
    let config = test_config();
    let crypto = CryptoWorkerPool::with_thread_workers(config.crypto_idle_timeout(), config.crypto_concurrency);
    let wallet = Wallet::new(Database::open_memory().unwrap(), crypto, exchange.clone(), config);
    wallet
        .import_exchange(exchange_record(wire_fee), denoms.iter().map(|d| d.record.clone()).collect())
        .unwrap();
    TestWallet { wallet, exchange, denoms }
}

pub fn test_wallet() -> TestWallet {
    test_wallet_with(standard_denominations(), "EUR:0")
}

impl TestWallet {
    pub fn denom(&self, value: &str) -> &DenomFixture {
        let value = amt(value);
        self.denoms.iter().find(|d| d.record.value == value).unwrap()
    }

    /// Put a fresh, validly signed coin of `denom` into the wallet as if it
    /// had been withdrawn from `reserve_pub`.
    pub fn add_coin(&self, seed: u8, denom: &DenomFixture, reserve_pub: EddsaPublicKey) -> CoinRecord {
        let keys = primitives::keypair_from_secret([seed; 32]);
        let coin_ev = primitives::coin_envelope(&keys.pub_key);
        let coin = CoinRecord {
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
                withdrawal_group_id: WithdrawalGroupId([0; 32]),
                coin_index: u32::from(seed),
                reserve_pub,
            },
            allocation: None,
            suspended: false,
        };
        self.wallet.db().run_read_write(&[StoreName::Coins], |tx| tx.put(&coin)).unwrap();
        self.exchange.register_withdrawn(&coin.coin_pub, reserve_pub);
        coin
    }

    /// Current state of any stored record.
    pub fn record<R: StoreRecord>(&self, key: &R::Key) -> Option<R> {
        self.wallet.db().run_read_only(&[R::STORE], |tx| tx.get::<R>(key)).unwrap()
    }

    pub fn coin(&self, coin_pub: &EddsaPublicKey) -> Option<CoinRecord> {
        self.wallet.db().run_read_only(&[StoreName::Coins], |tx| tx.get::<CoinRecord>(coin_pub)).unwrap()
    }

    pub fn coins(&self) -> Vec<CoinRecord> {
        self.wallet
            .db()
            .run_read_only(&[StoreName::Coins], |tx| tx.iter::<CoinRecord>()?.to_vec())
            .unwrap()
    }

    pub fn fresh_value(&self) -> Amount {
        let coins = self.coins();
        let fresh = coins.iter().filter(|c| c.status == CoinStatus::Fresh).map(|c| &c.current_amount);
        Amount::sum(CURRENCY, fresh).unwrap().amount
    }
}
