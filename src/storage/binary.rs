//! Binary (length-prefixed) writer (C2). Same hourly partition tree as the
//! JSONL writer, under a `protobuf/` root, with an explicit `u32_be(len) ||
//! payload` frame per record instead of a JSON line delimiter.
//!
//! Grounded on `backtest_v2/book_recorder.rs`'s length-prefixed disk frame
//! and on `ib_util/storage/v3_storage.py`'s statement that the binary path
//! mirrors the JSON path one-to-one, same keys, same partitioning. No
//! protobuf codegen is wired into this tree (it would need a build.rs and a
//! registry-verified `.proto` schema this exercise cannot produce without
//! running a build); the payload is the same compact `serde_json` encoding
//! used by the JSONL writer, framed with a length prefix instead of a
//! newline. Swapping the frame payload for a generated protobuf message
//! later is a one-function change (`encode`/`decode` below) that does not
//! touch the partitioning or locking logic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use super::{layout, Writer};
use crate::errors::StorageError;
use crate::models::{TickMessage, TickType};

const EXT: &str = "bin";

fn encode(message: &TickMessage) -> Result<Vec<u8>, StorageError> {
    let payload = serde_json::to_vec(message)?;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

pub struct BinaryWriter {
    root: PathBuf,
    file_locks: parking_lot::Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl BinaryWriter {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            file_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.file_locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn append_to_file(&self, path: &Path, messages: &[&TickMessage]) -> Result<(), StorageError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| StorageError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StorageError::Io {
                path: path.display().to_string(),
                source: e,
            })?;

        let mut buf = Vec::new();
        for msg in messages {
            buf.extend(encode(msg)?);
        }
        file.write_all(&buf).await.map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

#[async_trait]
impl Writer for BinaryWriter {
    fn name(&self) -> &'static str {
        "binary"
    }

    async fn start(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).await.map_err(|e| StorageError::Io {
            path: self.root.display().to_string(),
            source: e,
        })
    }

    async fn write_batch(&self, messages: &[TickMessage]) -> Result<(), StorageError> {
        let mut groups: HashMap<PathBuf, Vec<&TickMessage>> = HashMap::new();
        for msg in messages {
            let (_, _, _, _, secs) = msg.partition();
            let path = layout::file_path(&self.root, msg.contract_id, msg.tick_type, secs, EXT);
            groups.entry(path).or_default().push(msg);
        }
        for (path, msgs) in groups {
            self.append_to_file(&path, &msgs).await?;
        }
        Ok(())
    }

    async fn query_range(
        &self,
        contract_id: i64,
        tick_types: &[TickType],
        start_us: i64,
        end_us: i64,
        limit: Option<usize>,
    ) -> Result<Vec<TickMessage>, StorageError> {
        let dirs = layout::hour_dirs(&self.root, start_us, end_us);
        let mut candidates: Vec<(i64, PathBuf)> = Vec::new();

        for dir in dirs {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let file_name = match entry.file_name().into_string() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                let Some((cid, tt, secs)) = layout::parse_filename(&file_name, EXT) else {
                    continue;
                };
                if cid != contract_id || !tick_types.contains(&tt) {
                    continue;
                }
                candidates.push((secs, entry.path()));
            }
        }
        candidates.sort_by_key(|(secs, _)| *secs);

        let mut out = Vec::new();
        for (_, path) in candidates {
            let mut file = match fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "query_range_open_failed");
                    continue;
                }
            };
            let mut data = Vec::new();
            if file.read_to_end(&mut data).await.is_err() {
                continue;
            }
            let mut offset = 0usize;
            while offset + 4 <= data.len() {
                let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
                offset += 4;
                if offset + len > data.len() {
                    warn!(path = %path.display(), "truncated_binary_frame");
                    break;
                }
                let payload = &data[offset..offset + len];
                offset += len;
                let msg: TickMessage = match serde_json::from_slice(payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping_malformed_binary_frame");
                        continue;
                    }
                };
                if msg.contract_id != contract_id || !tick_types.contains(&msg.tick_type) {
                    continue;
                }
                if msg.ib_timestamp_us < start_us || msg.ib_timestamp_us >= end_us {
                    continue;
                }
                out.push(msg);
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickType;

    fn msg(contract_id: i64, tick_type: TickType, ib_timestamp_us: i64) -> TickMessage {
        TickMessage {
            ib_timestamp_us,
            system_timestamp_us: ib_timestamp_us,
            contract_id,
            tick_type,
            request_id: 1,
            price: Some(1.0),
            size: Some(1.0),
            unreported: false,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            bid_past_low: false,
            ask_past_high: false,
            mid_point: None,
        }
    }

    #[tokio::test]
    async fn write_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinaryWriter::new(dir.path().to_path_buf());
        writer.start().await.unwrap();

        writer
            .write_batch(&[
                msg(265598, TickType::Last, 1_709_646_300_000_000),
                msg(265598, TickType::Last, 1_709_646_301_000_000),
            ])
            .await
            .unwrap();

        let results = writer
            .query_range(265598, &[TickType::Last], 0, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn multiple_frames_in_one_file_are_all_read() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinaryWriter::new(dir.path().to_path_buf());
        writer.start().await.unwrap();

        let batch: Vec<TickMessage> = (0..5)
            .map(|i| msg(1, TickType::Last, 1_709_646_300_000_000 + i))
            .collect();
        writer.write_batch(&batch).await.unwrap();
        writer.write_batch(&[msg(1, TickType::Last, 1_709_646_300_000_005)]).await.unwrap();

        let results = writer
            .query_range(1, &[TickType::Last], 0, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 6);
    }
}
