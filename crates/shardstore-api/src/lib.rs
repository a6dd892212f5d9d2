//! Shardstore API - shared wire types
//!
//! Request/response bodies for the metadata REST API and the shard node
//! service, plus the tiering event record. One crate so servers,
//! clients, the CLI and the tier controller agree on field names.

pub mod meta;
pub mod node;
pub mod tiering;

pub use meta::*;
pub use node::*;
pub use tiering::TieringRequest;
