//! Raft type wiring and shared daemon state

use openraft::BasicNode;
use shardstore_catalog::{Catalog, Command, CommandReply, Op};
use shardstore_client::NodeClient;
use shardstore_common::metrics::Counter;
use shardstore_common::{Error, DEFAULT_APPLY_TIMEOUT};
use shardstore_erasure::ShardCodec;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use crate::migrate::MigrationRegistry;

/// Raft node id (assigned by the operator, stable across restarts)
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft type configuration: catalog commands in, command replies out.
    pub TypeConfig:
        D = Command,
        R = CommandReply,
);

/// The consensus handle
pub type MetaRaft = openraft::Raft<TypeConfig>;

/// Request counters for the REST surface
#[derive(Debug, Default)]
pub struct ApiMetrics {
    pub requests_total: Counter,
    pub requests_errors: Counter,
}

/// Everything the handlers share
pub struct App {
    pub id: NodeId,
    /// Advertised HTTP address of this node
    pub addr: String,
    pub raft: MetaRaft,
    pub catalog: Arc<Catalog>,
    pub codec: Arc<ShardCodec>,
    pub nodes: NodeClient,
    pub migrations: MigrationRegistry,
    pub api_metrics: ApiMetrics,
    pub start_time: Instant,
}

pub type AppState = Arc<App>;

impl App {
    /// Marshal an op into a stamped command and push it through
    /// consensus, waiting for local apply.
    ///
    /// A timeout does not mean the command failed; it may still commit.
    /// Callers surface 504 and rely on idempotency.
    pub async fn propose(&self, op: Op) -> Result<(), Error> {
        let cmd = Command::new(now_epoch(), op);

        let write = tokio::time::timeout(DEFAULT_APPLY_TIMEOUT, self.raft.client_write(cmd)).await;
        match write {
            Err(_) => Err(Error::ApplyTimeout),
            Ok(Ok(resp)) => match resp.data.rejection {
                None => Ok(()),
                Some(rejection) => Err(rejection.into()),
            },
            Ok(Err(e)) => Err(self.map_write_error(e)),
        }
    }

    fn map_write_error(
        &self,
        e: openraft::error::RaftError<
            NodeId,
            openraft::error::ClientWriteError<NodeId, BasicNode>,
        >,
    ) -> Error {
        use openraft::error::{ClientWriteError, RaftError};
        match e {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => Error::NotLeader {
                leader: fwd.leader_node.map(|n| n.addr),
            },
            RaftError::APIError(other) => Error::internal(other.to_string()),
            RaftError::Fatal(fatal) => Error::internal(fatal.to_string()),
        }
    }

    /// Whether this node currently leads the group
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    /// HTTP address of the current leader, if one is known
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
    }
}

/// Epoch seconds from the local clock
///
/// Only ever read on the leader at propose time; replicas see the stamp
/// inside the command.
#[must_use]
pub fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
