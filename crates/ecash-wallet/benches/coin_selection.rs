//! Criterion benchmarks for payment coin selection.

use std::collections::BTreeMap;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use ecash_core::types::DenomCipher;
use ecash_core::{Amount, DenominationPubKey, EddsaPublicKey};
use ecash_wallet::coin_selection::{AvailableCoinInfo, PayCoinSelectionRequest, select_pay_coins};

fn wallet_coins(n: usize) -> Vec<AvailableCoinInfo> {
    (0..n)
        .map(|i| {
            let value = 1u64 << (i % 6);
            let mut key = [0u8; 32];
            key[..8].copy_from_slice(&(i as u64).to_le_bytes());
            AvailableCoinInfo {
                coin_pub: EddsaPublicKey(key),
                denom_pub: DenominationPubKey { cipher: DenomCipher::Eddsa, key: vec![(i % 6) as u8] },
                available_amount: Amount::new("EUR", value, 0).unwrap(),
                fee_deposit: Amount::new("EUR", 0, 1_000_000).unwrap(),
                exchange_base_url: format!("https://ex{}.test/", i % 3),
            }
        })
        .collect()
}

fn request(candidates: Vec<AvailableCoinInfo>, contract: u64) -> PayCoinSelectionRequest {
    let wire_fees: BTreeMap<String, Amount> = (0..3)
        .map(|i| (format!("https://ex{i}.test/"), Amount::new("EUR", 0, 10_000_000).unwrap()))
        .collect();
    PayCoinSelectionRequest {
        candidates,
        wire_fees_per_exchange: wire_fees,
        contract_amount: Amount::new("EUR", contract, 0).unwrap(),
        max_deposit_fee: Amount::new("EUR", 0, 5_000_000).unwrap(),
        max_wire_fee: Amount::new("EUR", 0, 5_000_000).unwrap(),
        wire_fee_amortization: 2,
        previous_selection: Vec::new(),
    }
}

fn bench_select_pay_coins(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_pay_coins");
    for n in [16usize, 256, 4096] {
        let req = request(wallet_coins(n), 40);
        group.bench_with_input(BenchmarkId::from_parameter(n), &req, |b, req| {
            b.iter(|| select_pay_coins(black_box(req)))
        });
    }
    group.finish();
}

fn bench_insufficient_funds(c: &mut Criterion) {
    // Every coin is visited before giving up.
    let req = request(wallet_coins(1024), 1_000_000);
    c.bench_function("select_pay_coins_insufficient", |b| {
        b.iter(|| select_pay_coins(black_box(&req)))
    });
}

criterion_group!(benches, bench_select_pay_coins, bench_insufficient_funds);
criterion_main!(benches);
