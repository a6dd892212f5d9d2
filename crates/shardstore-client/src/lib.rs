//! Shardstore client
//!
//! HTTP clients for the metadata service and the shard nodes, and the
//! pipeline that turns a plaintext object into placed shards (and back).

pub mod meta;
pub mod node;
pub mod pipeline;

pub use meta::MetaClient;
pub use node::NodeClient;
pub use pipeline::{fetch_ciphertext, place_shards, Pipeline};
