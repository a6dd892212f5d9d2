//! Event stream transports
//!
//! The broker itself is an external collaborator; the controller only
//! needs ordered records with offsets it can commit after the
//! enqueue-or-drop decision. `JsonlEventStream` tails a JSONL file with
//! a committed-offset sidecar; `MemoryEventStream` backs tests and
//! embedded use.

use async_trait::async_trait;
use shardstore_common::{Error, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

/// Position of a record within the stream
pub type Offset = u64;

/// One raw record; the controller owns parsing so malformed events can
/// be counted rather than wedging the transport.
#[derive(Clone, Debug)]
pub struct StreamRecord {
    pub offset: Offset,
    pub payload: String,
}

/// An ordered, at-least-once event source
#[async_trait]
pub trait EventStream: Send {
    /// Wait for the next record; `None` means the stream is finished
    async fn next(&mut self) -> Result<Option<StreamRecord>>;

    /// Mark everything up to and including `offset` as consumed
    async fn commit(&mut self, offset: Offset) -> Result<()>;
}

/// Tail a JSONL file of tiering events
///
/// Offsets are 1-based line numbers; the committed offset lives in a
/// sidecar file so a restarted daemon resumes where it left off.
/// `next` polls for new complete lines and never returns `None`.
pub struct JsonlEventStream {
    path: PathBuf,
    offset_path: PathBuf,
    /// Byte position of the next unread line
    byte_pos: u64,
    /// Line number of the last delivered record
    line_no: Offset,
    poll_interval: Duration,
    /// Lines read from the file but not yet delivered
    pending: Vec<StreamRecord>,
}

impl JsonlEventStream {
    /// Open a stream over `path`, resuming from its committed offset
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let offset_path = path.with_extension("offset");

        let committed: Offset = match fs::read_to_string(&offset_path).await {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };

        let mut stream = Self {
            path,
            offset_path,
            byte_pos: 0,
            line_no: 0,
            poll_interval: Duration::from_secs(1),
            pending: Vec::new(),
        };

        // Skip past already-committed lines.
        while stream.line_no < committed {
            stream.fill_pending().await?;
            if stream.pending.is_empty() {
                break;
            }
            stream.pending.retain(|r| r.offset > committed);
            if !stream.pending.is_empty() {
                break;
            }
        }
        Ok(stream)
    }

    /// Override the tail poll interval (tests)
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Read any new complete lines into the pending buffer
    async fn fill_pending(&mut self) -> Result<()> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(f) => f,
            // The producer may not have created the file yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::IoFailure(e)),
        };
        file.seek(SeekFrom::Start(self.byte_pos)).await?;

        let mut buf = String::new();
        file.read_to_string(&mut buf).await?;

        let mut consumed = 0usize;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // Partial trailing line; wait for the producer to finish it.
                break;
            }
            consumed += line.len();
            self.line_no += 1;
            let payload = line.trim_end().to_string();
            if payload.is_empty() {
                continue;
            }
            self.pending.push(StreamRecord {
                offset: self.line_no,
                payload,
            });
        }
        self.byte_pos += consumed as u64;
        Ok(())
    }
}

#[async_trait]
impl EventStream for JsonlEventStream {
    async fn next(&mut self) -> Result<Option<StreamRecord>> {
        loop {
            if !self.pending.is_empty() {
                return Ok(Some(self.pending.remove(0)));
            }
            self.fill_pending().await?;
            if self.pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn commit(&mut self, offset: Offset) -> Result<()> {
        fs::write(&self.offset_path, format!("{offset}\n")).await?;
        Ok(())
    }
}

/// Channel-backed stream for tests and embedding
pub struct MemoryEventStream {
    rx: mpsc::UnboundedReceiver<String>,
    next_offset: Offset,
    committed: Offset,
}

impl MemoryEventStream {
    /// Create a stream and the sender side feeding it
    #[must_use]
    pub fn new() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                next_offset: 0,
                committed: 0,
            },
        )
    }

    /// Highest committed offset so far
    #[must_use]
    pub const fn committed(&self) -> Offset {
        self.committed
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn next(&mut self) -> Result<Option<StreamRecord>> {
        match self.rx.recv().await {
            Some(payload) => {
                self.next_offset += 1;
                Ok(Some(StreamRecord {
                    offset: self.next_offset,
                    payload,
                }))
            }
            None => Ok(None),
        }
    }

    async fn commit(&mut self, offset: Offset) -> Result<()> {
        self.committed = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_tail_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, "{\"a\":1}\n{\"a\":2}\n").await.unwrap();

        let mut stream = JsonlEventStream::open(&path)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(first.payload, "{\"a\":1}");
        stream.commit(first.offset).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.offset, 2);
        stream.commit(second.offset).await.unwrap();

        // Reopen resumes past the committed offset.
        fs::write(
            &path,
            "{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n",
        )
        .await
        .unwrap();
        let mut resumed = JsonlEventStream::open(&path).await.unwrap();
        let third = resumed.next().await.unwrap().unwrap();
        assert_eq!(third.offset, 3);
        assert_eq!(third.payload, "{\"a\":3}");
    }

    #[tokio::test]
    async fn test_jsonl_ignores_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, "{\"a\":1}\n{\"par").await.unwrap();

        let mut stream = JsonlEventStream::open(&path)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));

        assert_eq!(stream.next().await.unwrap().unwrap().offset, 1);

        // Complete the partial line; it becomes visible on the next poll.
        fs::write(&path, "{\"a\":1}\n{\"partial\":true}\n")
            .await
            .unwrap();
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.offset, 2);
        assert_eq!(next.payload, "{\"partial\":true}");
    }

    #[tokio::test]
    async fn test_memory_stream() {
        let (tx, mut stream) = MemoryEventStream::new();
        tx.send("one".into()).unwrap();
        tx.send("two".into()).unwrap();
        drop(tx);

        assert_eq!(stream.next().await.unwrap().unwrap().payload, "one");
        stream.commit(1).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().payload, "two");
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(stream.committed(), 1);
    }
}
