//! Data-plane round trips: seal, encode, lose shards, decode, open.
//!
//! Exercises the exact transform the pipeline applies around the
//! network, without the network.

use shardstore_common::ErasureParams;
use shardstore_crypto::{open, seal, KeyMaterial, ENVELOPE_OVERHEAD};
use shardstore_erasure::{CodecError, ShardCodec};

fn codec() -> ShardCodec {
    ShardCodec::new(ErasureParams::default()).unwrap()
}

fn seal_and_encode(plaintext: &[u8], key: &KeyMaterial) -> (Vec<Option<Vec<u8>>>, usize) {
    let sealed = seal(plaintext, key).unwrap();
    let ciphertext_len = sealed.len();
    assert_eq!(ciphertext_len, plaintext.len() + ENVELOPE_OVERHEAD);

    let shards = codec().encode(&sealed).unwrap();
    assert_eq!(shards.len(), 9);
    (shards.into_iter().map(Some).collect(), ciphertext_len)
}

#[test]
fn round_trip_with_all_shards() {
    let key = KeyMaterial::generate();
    let plaintext = b"hello world";
    let (slots, ct_len) = seal_and_encode(plaintext, &key);

    let ciphertext = codec().decode(&slots, ct_len).unwrap();
    let recovered = open(&ciphertext, &key).unwrap();
    assert_eq!(recovered, plaintext);
}

#[test]
fn tolerates_m_losses_then_fails_on_more() {
    let key = KeyMaterial::generate();
    let plaintext = b"hello world";
    let (mut slots, ct_len) = seal_and_encode(plaintext, &key);

    // Lose three shards (one parity, two data); still whole.
    for i in [2, 4, 7] {
        slots[i] = None;
    }
    let ciphertext = codec().decode(&slots, ct_len).unwrap();
    assert_eq!(open(&ciphertext, &key).unwrap(), plaintext);

    // A fourth loss crosses the tolerance.
    slots[5] = None;
    assert!(matches!(
        codec().decode(&slots, ct_len),
        Err(CodecError::InsufficientShards { available: 5, required: 6 })
    ));
}

#[test]
fn tampered_shard_is_caught_before_decryption() {
    let key = KeyMaterial::generate();
    let plaintext = b"account ledger, do not corrupt";
    let (mut slots, ct_len) = seal_and_encode(plaintext, &key);

    slots[3].as_mut().unwrap()[10] ^= 0x01;
    assert!(matches!(
        codec().decode(&slots, ct_len),
        Err(CodecError::VerificationFailed)
    ));
}

#[test]
fn tampered_ciphertext_is_caught_by_the_envelope() {
    // If the erasure layer were somehow bypassed, the GCM tag is the
    // second line of defence.
    let key = KeyMaterial::generate();
    let mut sealed = seal(b"hello world", &key).unwrap();
    sealed[15] ^= 0x80;
    assert!(open(&sealed, &key).is_err());
}

#[test]
fn large_object_round_trip() {
    let key = KeyMaterial::generate();
    let plaintext: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let (mut slots, ct_len) = seal_and_encode(&plaintext, &key);

    slots[0] = None;
    slots[8] = None;

    let ciphertext = codec().decode(&slots, ct_len).unwrap();
    assert_eq!(open(&ciphertext, &key).unwrap(), plaintext);
}
