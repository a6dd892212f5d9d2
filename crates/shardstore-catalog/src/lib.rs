//! Shardstore catalog - the replicated metadata state machine
//!
//! A deterministic function `(state, command) -> state` over buckets,
//! objects and registered storage nodes. Commands arrive in log order
//! from the consensus layer; nothing else mutates the catalog.
//!
//! Determinism rules:
//! - every command carries the leader's clock; the catalog never reads
//!   the local wall-clock
//! - all maps are `BTreeMap`s, so snapshots of equal states are
//!   byte-identical

pub mod command;
pub mod fsm;
pub mod types;

pub use command::{Command, CommandReply, Op, Rejection};
pub use fsm::{Catalog, CatalogState};
pub use types::{object_key, AclRight, BucketMeta, ObjectMeta, ShardInfo, StorageNode};
