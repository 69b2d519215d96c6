#![allow(unused)]
extern crate dotreclaim;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use dotreclaim::{
    metadata::method::MethodBody,
    recovery::methods::xor_mask,
    utils::{
        crypto::{decrypt_cbc, encrypt_cbc, CipherKind},
        tea::{words_from_le_bytes, xtea_decrypt, xxtea_decrypt},
    },
};
use std::hint::black_box;

const KEY_16: &[u8; 16] = b"0123456789abcdef";
const KEY_24: &[u8; 24] = b"0123456789abcdef01234567";
const IV_16: &[u8; 16] = b"fedcba9876543210";

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// CBC decryption of a 64 KiB resource blob with each supported cipher
fn bench_cbc(c: &mut Criterion) {
    let plain = payload(64 * 1024);

    let mut group = c.benchmark_group("cbc_decrypt");
    group.throughput(Throughput::Bytes(plain.len() as u64));
    for (kind, key, iv) in [
        (CipherKind::Aes, &KEY_16[..], &IV_16[..]),
        (CipherKind::TripleDes, &KEY_24[..], &IV_16[..8]),
        (CipherKind::Des, &KEY_16[..8], &IV_16[..8]),
    ] {
        let ciphertext = encrypt_cbc(kind, &plain, key, iv).unwrap();
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| black_box(decrypt_cbc(kind, black_box(&ciphertext), key, iv).unwrap()));
        });
    }
    group.finish();
}

/// The two TEA variants over the same 64 KiB of words
fn bench_tea(c: &mut Criterion) {
    let words = words_from_le_bytes(&payload(64 * 1024));
    let key = [0x0123_4567, 0x89AB_CDEF, 0xFEDC_BA98, 0x7654_3210];

    let mut group = c.benchmark_group("tea");
    group.throughput(Throughput::Bytes((words.len() * 4) as u64));
    group.bench_function("xxtea", |b| {
        b.iter(|| {
            let mut block = words.clone();
            xxtea_decrypt(black_box(&mut block), &key);
            black_box(block)
        });
    });
    group.bench_function("xtea_32_rounds", |b| {
        b.iter(|| {
            let mut block = words.clone();
            for pair in block.chunks_exact_mut(2) {
                let (left, right) = pair.split_at_mut(1);
                xtea_decrypt(&mut left[0], &mut right[0], &key, 32);
            }
            black_box(block)
        });
    });
    group.finish();
}

/// Stream masking and method body probing, the hot loops of method stream handling
fn bench_method_stream(c: &mut Criterion) {
    let stream = payload(256 * 1024);
    let mut body = vec![(4 << 2) | 2];
    body.extend_from_slice(&[0x00, 0x17, 0x26, 0x2A]);

    let mut group = c.benchmark_group("method_stream");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("xor_mask", |b| {
        b.iter(|| {
            let mut data = stream.clone();
            xor_mask(black_box(&mut data), 0x1122_3344_5566_7788);
            black_box(data)
        });
    });
    group.finish();

    c.bench_function("method_body_verify", |b| {
        b.iter(|| black_box(MethodBody::verify(black_box(&body))));
    });
}

criterion_group!(benches, bench_cbc, bench_tea, bench_method_stream);
criterion_main!(benches);
