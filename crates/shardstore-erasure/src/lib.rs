//! Shardstore erasure coding
//!
//! A stateless (k, m) Reed-Solomon codec over `reed-solomon-simd`.
//! One codec is built per process from the deployment's parameters and
//! shared across requests; it holds no per-call state.

pub mod codec;

pub use codec::{CodecError, ShardCodec};
