//! Per-request audit records and the traffic dump writer.
//!
//! Every accepted request produces exactly one record. Connection tasks
//! send events over a channel; a single sink task applies them in append
//! order and keeps a bounded history for the control plane to list.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordStatus {
    Active,
    Completed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub id: u64,
    pub created: SystemTime,
    pub proxy: String,
    pub status: RecordStatus,
    pub url: String,
    pub rule: String,
    pub dumped: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

enum RecordEvent {
    Append(Record),
    Finalize {
        id: u64,
        status: RecordStatus,
        bytes_up: u64,
        bytes_down: u64,
    },
}

#[derive(Clone)]
pub struct RecordSink {
    tx: mpsc::UnboundedSender<RecordEvent>,
    history: Arc<Mutex<VecDeque<Record>>>,
    next_id: Arc<AtomicU64>,
}

impl RecordSink {
    /// Create the sink and spawn its apply task.
    pub fn start() -> RecordSink {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let history: Arc<Mutex<VecDeque<Record>>> = Arc::new(Mutex::new(VecDeque::new()));

        let task_history = history.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut history = task_history.lock();
                match event {
                    RecordEvent::Append(record) => {
                        if history.len() == HISTORY_LIMIT {
                            history.pop_front();
                        }
                        history.push_back(record);
                    }
                    RecordEvent::Finalize {
                        id,
                        status,
                        bytes_up,
                        bytes_down,
                    } => {
                        if let Some(record) = history.iter_mut().rev().find(|r| r.id == id) {
                            record.status = status;
                            record.bytes_up = bytes_up;
                            record.bytes_down = bytes_down;
                        }
                    }
                }
            }
        });

        RecordSink {
            tx,
            history,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Append a fresh record, returning its id.
    pub fn append(&self, mut record: Record) -> u64 {
        if record.id == 0 {
            record.id = self.next_id();
        }
        let id = record.id;
        debug!(id, proxy = %record.proxy, url = %record.url, "record opened");
        let _ = self.tx.send(RecordEvent::Append(record));
        id
    }

    pub fn finalize(&self, id: u64, status: RecordStatus, bytes_up: u64, bytes_down: u64) {
        debug!(id, ?status, bytes_up, bytes_down, "record finalized");
        let _ = self.tx.send(RecordEvent::Finalize {
            id,
            status,
            bytes_up,
            bytes_down,
        });
    }

    /// Most-recent-last snapshot for the control plane.
    pub fn list(&self) -> Vec<Record> {
        self.history.lock().iter().cloned().collect()
    }
}

impl Record {
    pub fn new(proxy: &str, rule: &str, url: &str, dumped: bool) -> Record {
        Record {
            id: 0,
            created: SystemTime::now(),
            proxy: proxy.to_string(),
            status: RecordStatus::Active,
            url: url.to_string(),
            rule: rule.to_string(),
            dumped,
            bytes_up: 0,
            bytes_down: 0,
        }
    }
}

/// Writes request/response byte captures under `dump/<record-id>/`.
#[derive(Debug, Clone)]
pub struct DumpWriter {
    root: PathBuf,
}

impl DumpWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub async fn write(&self, id: u64, request: &[u8], response: &[u8]) {
        if let Err(e) = self.try_write(id, request, response).await {
            warn!(id, error = %e, "traffic dump failed");
        }
    }

    async fn try_write(&self, id: u64, request: &[u8], response: &[u8]) -> std::io::Result<()> {
        let dir = self.root.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let mut file = tokio::fs::File::create(dir.join("request")).await?;
        file.write_all(request).await?;
        file.flush().await?;

        let mut file = tokio::fs::File::create(dir.join("response")).await?;
        file.write_all(response).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_append_and_finalize_in_order() {
        let sink = RecordSink::start();

        let id_a = sink.append(Record::new("PROXY", "FINAL,PROXY", "a.test:443", false));
        let id_b = sink.append(Record::new("DIRECT", "FINAL,DIRECT", "b.test:80", false));
        assert!(id_b > id_a);

        sink.finalize(id_a, RecordStatus::Completed, 10, 20);
        // The sink task applies events asynchronously.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let records = sink.list();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, id_a);
        assert_eq!(records[0].status, RecordStatus::Completed);
        assert_eq!(records[0].bytes_up, 10);
        assert_eq!(records[1].status, RecordStatus::Active);
    }

    #[tokio::test]
    async fn rejected_records_keep_zero_counters() {
        let sink = RecordSink::start();
        let id = sink.append(Record::new("REJECT", "DOMAIN,ads.test,REJECT", "ads.test:443", false));
        sink.finalize(id, RecordStatus::Rejected, 0, 0);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let records = sink.list();
        assert_eq!(records[0].status, RecordStatus::Rejected);
        assert_eq!(records[0].bytes_up, 0);
        assert_eq!(records[0].bytes_down, 0);
    }

    #[tokio::test]
    async fn dump_writer_creates_the_id_keyed_pair() {
        let dir = std::env::temp_dir().join(format!("ferry-dump-test-{}", std::process::id()));
        let writer = DumpWriter::new(&dir);
        writer.write(42, b"GET / HTTP/1.1\r\n\r\n", b"HTTP/1.1 200 OK\r\n\r\n").await;

        let request = tokio::fs::read(dir.join("42").join("request")).await.unwrap();
        assert_eq!(request, b"GET / HTTP/1.1\r\n\r\n");
        let response = tokio::fs::read(dir.join("42").join("response")).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\n");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
