// Envelope and key-exchange benchmarks.
//
// Covers sealing and opening a typical purchase frame, the raw AES/HMAC
// primitives underneath, and the Diffie-Hellman work done once per pairing.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use spi_client::crypto::{aes_decrypt, aes_encrypt, hmac_signature, DhKeyPair};
use spi_client::message::{decode, MessageStamp};
use spi_client::{Event, Message, Secrets};

fn secrets() -> Secrets {
    Secrets::new([0x11; 32], [0x22; 32])
}

fn purchase() -> Message {
    Message::new(
        "prchs1",
        Event::PurchaseRequest,
        json!({
            "pos_ref_id": "bench-0001",
            "purchase_amount": 1981,
            "tip_amount": 0,
            "cash_amount": 0,
            "prompt_for_cashout": false,
        }),
        true,
    )
}

fn bench_encode_sealed(c: &mut Criterion) {
    let secrets = secrets();
    let msg = purchase();
    let mut stamp = MessageStamp::new("POS1");

    c.bench_function("codec/encode_sealed", |b| {
        b.iter(|| stamp.encode(&msg, Some(&secrets)).unwrap());
    });
}

fn bench_decode_sealed(c: &mut Criterion) {
    let secrets = secrets();
    let wire = MessageStamp::new("POS1").encode(&purchase(), Some(&secrets)).unwrap();

    c.bench_function("codec/decode_sealed", |b| {
        b.iter(|| decode(&wire, Some(&secrets)));
    });
}

fn bench_aes_hmac(c: &mut Criterion) {
    let secrets = secrets();
    let mut group = c.benchmark_group("crypto/aes_cbc_hmac");

    for size in [64, 512, 4096] {
        let plain = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &plain, |b, plain| {
            b.iter(|| {
                let cipher = aes_encrypt(secrets.enc_key(), plain);
                let hex_cipher = hex::encode_upper(&cipher);
                let sig = hmac_signature(secrets.hmac_key(), &hex_cipher).unwrap();
                let back = aes_decrypt(secrets.enc_key(), &cipher).unwrap();
                (sig, back)
            });
        });
    }

    group.finish();
}

fn bench_key_exchange(c: &mut Criterion) {
    let terminal = DhKeyPair::generate();
    let terminal_public = terminal.public_hex();

    c.bench_function("dh/generate_keypair", |b| {
        b.iter(DhKeyPair::generate);
    });

    c.bench_function("dh/derive_session_key", |b| {
        let ours = DhKeyPair::generate();
        b.iter(|| ours.derive_session_key(&terminal_public).unwrap());
    });
}

criterion_group!(
    benches,
    bench_encode_sealed,
    bench_decode_sealed,
    bench_aes_hmac,
    bench_key_exchange,
);
criterion_main!(benches);
