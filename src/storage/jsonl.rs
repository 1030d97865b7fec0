//! JSONL writer (C2). Compact, one-object-per-line, hourly-partitioned.
//!
//! Grounded on `ib_util/storage/v3_storage.py`/`v3_json_storage.py`: exact
//! path algorithm, per-path lock (their `_get_file_lock`, an
//! `asyncio.Lock` keyed by path; here a `tokio::sync::Mutex` in a
//! `parking_lot`-guarded registry), append-with-trailing-newline, and
//! candidate-file discovery followed by an explicit sort on the embedded
//! filename timestamp (the original relies on OS glob order for this, which
//! is not guaranteed — this port sorts explicitly to satisfy the ordering
//! invariant in spec §4.5/§8 property 5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use super::{layout, Writer};
use crate::errors::StorageError;
use crate::models::{TickMessage, TickType};

const EXT: &str = "jsonl";

pub struct JsonlWriter {
    root: PathBuf,
    file_locks: parking_lot::Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl JsonlWriter {
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

        let mut buf = String::new();
        for msg in messages {
            let line = serde_json::to_string(msg)?;
            buf.push_str(&line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await.map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

#[async_trait]
impl Writer for JsonlWriter {
    fn name(&self) -> &'static str {
        "json"
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
        // Each path is an independent lock; never hold two at once (spec §4.5
        // invariant) — sequential across groups, concurrent within a group is
        // unnecessary since writes to one file must be ordered anyway.
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
                Err(_) => continue, // hour directory may not exist; not an error
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
        // Ascending file-order guarantee (spec §4.5): sort by embedded
        // timestamp, not directory read order.
        candidates.sort_by_key(|(secs, _)| *secs);

        let mut out = Vec::new();
        for (_, path) in candidates {
            let file = match fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "query_range_open_failed");
                    continue;
                }
            };
            let mut lines = BufReader::new(file).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let msg: TickMessage = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping_malformed_jsonl_line");
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
        let writer = JsonlWriter::new(dir.path().to_path_buf());
        writer.start().await.unwrap();

        let batch = vec![
            msg(265598, TickType::Last, 1_709_646_300_000_000),
            msg(265598, TickType::Last, 1_709_646_301_000_000),
        ];
        writer.write_batch(&batch).await.unwrap();

        let results = writer
            .query_range(
                265598,
                &[TickType::Last],
                1_709_646_300_000_000,
                1_709_646_302_000_000,
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].ib_timestamp_us <= results[1].ib_timestamp_us);
    }

    #[tokio::test]
    async fn query_range_across_hourly_boundary_yields_both_messages() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlWriter::new(dir.path().to_path_buf());
        writer.start().await.unwrap();

        // 12:59:59.900Z and 13:00:00.100Z same date.
        let before = 1_709_643_599_900_000_i64;
        let after = 1_709_643_600_100_000_i64;
        writer
            .write_batch(&[
                msg(711280073, TickType::BidAsk, before),
                msg(711280073, TickType::BidAsk, after),
            ])
            .await
            .unwrap();

        let results = writer
            .query_range(
                711280073,
                &[TickType::BidAsk],
                1_709_643_540_000_000, // 12:59:00Z
                1_709_643_660_000_000, // 13:01:00Z
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].ib_timestamp_us, before);
        assert_eq!(results[1].ib_timestamp_us, after);
    }

    #[tokio::test]
    async fn query_range_filters_by_tick_type_and_contract() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlWriter::new(dir.path().to_path_buf());
        writer.start().await.unwrap();

        writer
            .write_batch(&[
                msg(1, TickType::Last, 1_709_646_300_000_000),
                msg(2, TickType::Last, 1_709_646_300_000_000),
                msg(1, TickType::BidAsk, 1_709_646_300_000_000),
            ])
            .await
            .unwrap();

        let results = writer
            .query_range(1, &[TickType::Last], 0, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].contract_id, 1);
        assert_eq!(results[0].tick_type, TickType::Last);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlWriter::new(dir.path().to_path_buf());
        writer.start().await.unwrap();

        let good = msg(1, TickType::Last, 1_709_646_300_000_000);
        writer.write_batch(&[good.clone()]).await.unwrap();

        let (_, _, _, _, secs) = good.partition();
        let path = layout::file_path(&dir.path().to_path_buf(), 1, TickType::Last, secs, EXT);
        let mut existing = tokio::fs::read_to_string(&path).await.unwrap();
        existing.push_str("not valid json\n");
        tokio::fs::write(&path, existing).await.unwrap();

        let results = writer
            .query_range(1, &[TickType::Last], 0, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
