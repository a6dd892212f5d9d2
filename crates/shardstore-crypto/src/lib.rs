//! Shardstore crypto - object envelope encryption
//!
//! Objects are sealed client-side with AES-256-GCM before erasure
//! coding; the catalog only ever sees an opaque `key_ref` into the
//! secret provider. This crate holds the envelope format and the
//! provider contract.

pub mod envelope;
pub mod provider;

pub use envelope::{open, seal, ENVELOPE_OVERHEAD, NONCE_LEN, TAG_LEN};
pub use provider::{KeyMaterial, LocalSecretProvider, SecretProvider};
