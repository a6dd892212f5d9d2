//! Raft storage
//!
//! The log lives in `redb` (entries bincode-encoded, vote and purge
//! markers in a meta table); the state machine is the in-memory catalog
//! with snapshots persisted as a single file in the data directory.

use openraft::storage::{LogFlushed, LogState, RaftLogStorage, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftLogReader, RaftSnapshotBuilder,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use shardstore_catalog::{Catalog, CommandReply};
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::app::{NodeId, TypeConfig};

type StorageResult<T> = Result<T, StorageError<NodeId>>;

const LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

fn read_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_logs(&e),
    }
}

fn write_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_logs(&e),
    }
}

fn sm_read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_state_machine(&e),
    }
}

fn sm_write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_state_machine(&e),
    }
}

/// Durable raft log on `redb`
#[derive(Clone)]
pub struct LogStore {
    db: Arc<Database>,
}

impl LogStore {
    /// Open (creating if needed) the log database
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = Database::create(path)?;
        // Make sure both tables exist so reads never race creation.
        let txn = db.begin_write()?;
        {
            txn.open_table(LOGS)?;
            txn.open_table(META)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value).map_err(write_logs_err)?;
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(META).map_err(write_logs_err)?;
            table.insert(key, bytes.as_slice()).map_err(write_logs_err)?;
        }
        txn.commit().map_err(write_logs_err)?;
        Ok(())
    }

    fn get_meta<T: for<'de> Deserialize<'de>>(&self, key: &str) -> StorageResult<Option<T>> {
        let txn = self.db.begin_read().map_err(read_logs_err)?;
        let table = txn.open_table(META).map_err(read_logs_err)?;
        match table.get(key).map_err(read_logs_err)? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(read_logs_err)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete_range(&self, from: Bound<u64>, to: Bound<u64>) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(LOGS).map_err(write_logs_err)?;
            let keys: Vec<u64> = table
                .range((from, to))
                .map_err(write_logs_err)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(write_logs_err)?;
            for key in keys {
                table.remove(key).map_err(write_logs_err)?;
            }
        }
        txn.commit().map_err(write_logs_err)?;
        Ok(())
    }

    fn last_entry(&self) -> StorageResult<Option<Entry<TypeConfig>>> {
        let txn = self.db.begin_read().map_err(read_logs_err)?;
        let table = txn.open_table(LOGS).map_err(read_logs_err)?;
        let result = match table.last().map_err(read_logs_err)? {
            Some((_, value)) => {
                let entry = bincode::deserialize(value.value()).map_err(read_logs_err)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        };
        result
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> StorageResult<Vec<Entry<TypeConfig>>> {
        let txn = self.db.begin_read().map_err(read_logs_err)?;
        let table = txn.open_table(LOGS).map_err(read_logs_err)?;

        let from = range.start_bound().cloned();
        let to = range.end_bound().cloned();
        let mut entries = Vec::new();
        for item in table.range((from, to)).map_err(read_logs_err)? {
            let (_, value) = item.map_err(read_logs_err)?;
            entries.push(bincode::deserialize(value.value()).map_err(read_logs_err)?);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> StorageResult<LogState<TypeConfig>> {
        let last_purged: Option<LogId<NodeId>> = self.get_meta("last_purged")?;
        let last_log_id = match self.last_entry()? {
            Some(entry) => Some(entry.log_id),
            None => last_purged,
        };
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> StorageResult<()> {
        self.put_meta("vote", vote)
    }

    async fn read_vote(&mut self) -> StorageResult<Option<Vote<NodeId>>> {
        self.get_meta("vote")
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> StorageResult<()> {
        self.put_meta("committed", &committed)
    }

    async fn read_committed(&mut self) -> StorageResult<Option<LogId<NodeId>>> {
        Ok(self.get_meta("committed")?.flatten())
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> StorageResult<()>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(LOGS).map_err(write_logs_err)?;
            for entry in entries {
                let bytes = bincode::serialize(&entry).map_err(write_logs_err)?;
                table
                    .insert(entry.log_id.index, bytes.as_slice())
                    .map_err(write_logs_err)?;
            }
        }
        txn.commit().map_err(write_logs_err)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> StorageResult<()> {
        self.delete_range(Bound::Included(log_id.index), Bound::Unbounded)
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> StorageResult<()> {
        self.put_meta("last_purged", &Some(log_id))?;
        self.delete_range(Bound::Unbounded, Bound::Included(log_id.index))
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

/// Snapshot as persisted on disk
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    /// Serialized catalog state
    data: Vec<u8>,
}

#[derive(Default)]
struct StateMachineData {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
}

/// State machine adapter over the catalog
#[derive(Clone)]
pub struct StateMachineStore {
    catalog: Arc<Catalog>,
    data: Arc<RwLock<StateMachineData>>,
    snapshot_path: PathBuf,
    current_snapshot: Arc<RwLock<Option<StoredSnapshot>>>,
    snapshot_seq: Arc<AtomicU64>,
}

impl StateMachineStore {
    /// Open the state machine, restoring the latest snapshot if one was
    /// persisted. Entries after the snapshot are replayed by the raft
    /// core from the durable log.
    pub fn open(catalog: Arc<Catalog>, data_dir: &Path) -> anyhow::Result<Self> {
        let snapshot_path = data_dir.join("catalog.snapshot");
        let sm = Self {
            catalog,
            data: Arc::new(RwLock::new(StateMachineData::default())),
            snapshot_path,
            current_snapshot: Arc::new(RwLock::new(None)),
            snapshot_seq: Arc::new(AtomicU64::new(0)),
        };

        if sm.snapshot_path.exists() {
            let bytes = std::fs::read(&sm.snapshot_path)?;
            let stored: StoredSnapshot = serde_json::from_slice(&bytes)?;
            sm.catalog
                .restore(&stored.data)
                .map_err(|e| anyhow::anyhow!("corrupt catalog snapshot: {e}"))?;
            {
                let mut data = sm.data.write();
                data.last_applied = stored.meta.last_log_id;
                data.last_membership = stored.meta.last_membership.clone();
            }
            info!(
                snapshot = %stored.meta.snapshot_id,
                "restored catalog snapshot"
            );
            *sm.current_snapshot.write() = Some(stored);
        }
        Ok(sm)
    }

    fn persist_snapshot(&self, stored: &StoredSnapshot) -> StorageResult<()> {
        let bytes = serde_json::to_vec(stored).map_err(sm_write_err)?;
        let tmp = self.snapshot_path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(sm_write_err)?;
        std::fs::rename(&tmp, &self.snapshot_path).map_err(sm_write_err)?;
        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> StorageResult<Snapshot<TypeConfig>> {
        let data = self.catalog.snapshot().map_err(sm_read_err)?;

        let (last_applied, last_membership) = {
            let sm = self.data.read();
            (sm.last_applied, sm.last_membership.clone())
        };

        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot_id = match last_applied {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, seq),
            None => format!("none-{seq}"),
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&stored)?;
        *self.current_snapshot.write() = Some(stored);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> StorageResult<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>)> {
        let sm = self.data.read();
        Ok((sm.last_applied, sm.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> StorageResult<Vec<CommandReply>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut replies = Vec::new();
        for entry in entries {
            {
                self.data.write().last_applied = Some(entry.log_id);
            }
            match entry.payload {
                EntryPayload::Blank => replies.push(CommandReply::ok()),
                EntryPayload::Normal(cmd) => {
                    let reply = match self.catalog.apply(&cmd) {
                        Ok(()) => CommandReply::ok(),
                        Err(rejection) => CommandReply::rejected(rejection),
                    };
                    replies.push(reply);
                }
                EntryPayload::Membership(membership) => {
                    self.data.write().last_membership =
                        StoredMembership::new(Some(entry.log_id), membership);
                    replies.push(CommandReply::ok());
                }
            }
        }
        Ok(replies)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> StorageResult<Box<Cursor<Vec<u8>>>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> StorageResult<()> {
        let data = snapshot.into_inner();
        self.catalog.restore(&data).map_err(sm_write_err)?;

        {
            let mut sm = self.data.write();
            sm.last_applied = meta.last_log_id;
            sm.last_membership = meta.last_membership.clone();
        }

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.persist_snapshot(&stored)?;
        *self.current_snapshot.write() = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> StorageResult<Option<Snapshot<TypeConfig>>> {
        let current = self.current_snapshot.read().clone();
        Ok(current.map(|stored| Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardstore_common::ErasureParams;

    #[tokio::test]
    async fn test_log_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(&dir.path().join("raft.redb")).unwrap();

        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(store.read_vote().await.unwrap().is_none());

        let vote = Vote::new(2, 1);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn test_state_machine_snapshot_persists() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::new(ErasureParams::new(2, 1)));
        let mut sm = StateMachineStore::open(catalog.clone(), dir.path()).unwrap();

        catalog
            .apply(&shardstore_catalog::Command::new(
                7,
                shardstore_catalog::Op::CreateBucket {
                    name: "b1".into(),
                    owner: "alice".into(),
                    acl: Default::default(),
                    metadata: Default::default(),
                },
            ))
            .unwrap();

        let snapshot = sm.build_snapshot().await.unwrap();
        assert!(dir.path().join("catalog.snapshot").exists());

        // A fresh state machine over an empty catalog restores the
        // snapshot at open.
        let restored_catalog = Arc::new(Catalog::new(ErasureParams::new(2, 1)));
        let _sm2 = StateMachineStore::open(restored_catalog.clone(), dir.path()).unwrap();
        assert!(restored_catalog.get_bucket("b1").is_some());
        assert_eq!(restored_catalog.get_bucket("b1").unwrap().created_at, 7);
        drop(snapshot);
    }
}
