//! Storage writers (C2) and the multi-format orchestrator (C3).
//!
//! Orchestrator shape grounded on the teacher's
//! `backtest_v2/book_recorder.rs::AsyncBookRecorder`/`run_writer`: one
//! bounded mpsc queue per writer, a dedicated worker draining it on a
//! count-or-timer batch boundary, generalized here from one SQLite sink to N
//! file-backed writers behind a common trait.

pub mod binary;
pub mod buffer;
pub mod jsonl;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::errors::StorageError;
use crate::models::{TickMessage, TickType};

#[async_trait]
pub trait Writer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> Result<(), StorageError>;
    async fn write_batch(&self, messages: &[TickMessage]) -> Result<(), StorageError>;
    async fn query_range(
        &self,
        contract_id: i64,
        tick_types: &[TickType],
        start_us: i64,
        end_us: i64,
        limit: Option<usize>,
    ) -> Result<Vec<TickMessage>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct StorageOrchestratorConfig {
    pub storage_root: PathBuf,
    pub enable_json: bool,
    pub enable_binary: bool,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
}

impl Default for StorageOrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("data"),
            enable_json: true,
            enable_binary: false,
            queue_capacity: 10_000,
            batch_size: 100,
            batch_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub messages_received: AtomicU64,
    pub messages_written: AtomicU64,
    pub writes_dropped: AtomicU64,
    pub batch_errors: AtomicU64,
}

struct WriterHandle {
    writer: Arc<dyn Writer>,
    tx: mpsc::Sender<TickMessage>,
    metrics: Arc<WriterMetrics>,
}

/// Fans ticks out to all registered writers concurrently and exposes a
/// unified range query with fixed-order fallback (spec §4.5).
pub struct StorageOrchestrator {
    writers: Vec<WriterHandle>,
    query_order: Vec<usize>,
}

impl StorageOrchestrator {
    /// Builds and starts workers for every enabled writer.
    pub fn new(config: StorageOrchestratorConfig) -> Self {
        let mut writers: Vec<Arc<dyn Writer>> = Vec::new();
        if config.enable_json {
            writers.push(Arc::new(jsonl::JsonlWriter::new(config.storage_root.join("json"))));
        }
        if config.enable_binary {
            writers.push(Arc::new(binary::BinaryWriter::new(config.storage_root.join("protobuf"))));
        }
        Self::from_writers(writers, config.queue_capacity, config.batch_size, config.batch_interval)
    }

    /// No writers registered; `store()` is then a no-op. Used by callers
    /// (e.g. router tests) that need a valid orchestrator handle but no
    /// actual persistence.
    pub fn disabled(config: StorageOrchestratorConfig) -> Self {
        Self::from_writers(Vec::new(), config.queue_capacity, config.batch_size, config.batch_interval)
    }

    fn from_writers(
        writers: Vec<Arc<dyn Writer>>,
        queue_capacity: usize,
        batch_size: usize,
        batch_interval: Duration,
    ) -> Self {
        let query_order = (0..writers.len()).collect();
        let mut handles = Vec::with_capacity(writers.len());
        for writer in writers {
            let (tx, rx) = mpsc::channel(queue_capacity);
            let metrics = Arc::new(WriterMetrics::default());
            let writer_for_task = writer.clone();
            let metrics_for_task = metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = writer_for_task.start().await {
                    warn!(writer = writer_for_task.name(), error = %e, "writer_start_failed");
                }
                run_writer(writer_for_task, rx, metrics_for_task, batch_size, batch_interval).await;
            });
            handles.push(WriterHandle { writer, tx, metrics });
        }
        Self {
            writers: handles,
            query_order,
        }
    }

    /// Enqueues into every writer's bounded queue. Never blocks the caller
    /// (the router MUST stay responsive, spec §4.5): on a full queue, drops
    /// the newest message and increments that writer's drop counter.
    pub fn store(&self, message: TickMessage) {
        for handle in &self.writers {
            handle.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
            match handle.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    handle.metrics.writes_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(writer = handle.writer.name(), "storage_queue_full_dropping_newest");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(writer = handle.writer.name(), "storage_writer_task_gone");
                }
            }
        }
    }

    /// Tries writers in `query_order` (JSON preferred; spec §4.5a), falling
    /// back to the next only on a writer-level error. Results are not
    /// deduplicated across writers; the first successful writer is
    /// authoritative.
    pub async fn query(
        &self,
        contract_id: i64,
        tick_types: &[TickType],
        start_us: i64,
        end_us: i64,
        limit: Option<usize>,
    ) -> Result<Vec<TickMessage>, StorageError> {
        let mut last_err = None;
        for &idx in &self.query_order {
            let handle = &self.writers[idx];
            match handle
                .writer
                .query_range(contract_id, tick_types, start_us, end_us, limit)
                .await
            {
                Ok(messages) => return Ok(messages),
                Err(e) => {
                    warn!(writer = handle.writer.name(), error = %e, "query_failed_falling_back");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    pub fn writer_metrics(&self) -> Vec<(&'static str, Arc<WriterMetrics>)> {
        self.writers
            .iter()
            .map(|h| (h.writer.name(), h.metrics.clone()))
            .collect()
    }
}

async fn run_writer(
    writer: Arc<dyn Writer>,
    mut rx: mpsc::Receiver<TickMessage>,
    metrics: Arc<WriterMetrics>,
    batch_size: usize,
    batch_interval: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = interval(batch_interval);
    loop {
        tokio::select! {
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        batch.push(msg);
                        if batch.len() >= batch_size {
                            flush(&writer, &mut batch, &metrics).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush(&writer, &mut batch, &metrics).await;
                        }
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&writer, &mut batch, &metrics).await;
                }
            }
        }
    }
}

async fn flush(writer: &Arc<dyn Writer>, batch: &mut Vec<TickMessage>, metrics: &Arc<WriterMetrics>) {
    match writer.write_batch(batch).await {
        Ok(()) => {
            metrics
                .messages_written
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.batch_errors.fetch_add(1, Ordering::Relaxed);
            warn!(writer = writer.name(), error = %e, "write_batch_failed");
        }
    }
    batch.clear();
}

/// Shared hourly-partition path algorithm (spec §4.5a), used by both the
/// JSONL and binary writers so the two formats address the same file tree
/// shape under their own format-named subdirectory.
pub(crate) mod layout {
    use super::*;
    use std::path::Path;

    pub fn file_path(root: &Path, contract_id: i64, tick_type: TickType, timestamp_seconds: i64, ext: &str) -> PathBuf {
        let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp_seconds, 0)
            .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap());
        use chrono::{Datelike, Timelike};
        root.join(format!("{:04}", dt.year()))
            .join(format!("{:02}", dt.month()))
            .join(format!("{:02}", dt.day()))
            .join(format!("{:02}", dt.hour()))
            .join(format!("{}_{}_{}.{}", contract_id, tick_type.as_str(), timestamp_seconds, ext))
    }

    /// Every UTC-hour directory whose file set might contain a record in
    /// `[start_us, end_us]`, oldest first, including a one-hour look-behind
    /// on the starting hour (spec §4.5a tolerance for files overlapping more
    /// than one hour).
    pub fn hour_dirs(root: &Path, start_us: i64, end_us: i64) -> Vec<PathBuf> {
        let start_secs = start_us.div_euclid(1_000_000) - 3600;
        let end_secs = end_us.div_euclid(1_000_000);
        let mut dirs = Vec::new();
        let mut hour_start = start_secs - start_secs.rem_euclid(3600);
        while hour_start <= end_secs {
            let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(hour_start, 0)
                .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap());
            use chrono::{Datelike, Timelike};
            dirs.push(
                root.join(format!("{:04}", dt.year()))
                    .join(format!("{:02}", dt.month()))
                    .join(format!("{:02}", dt.day()))
                    .join(format!("{:02}", dt.hour())),
            );
            hour_start += 3600;
        }
        dirs
    }

    /// Parses `{contract_id}_{tick_type}_{timestamp_seconds}.{ext}` back out
    /// of a file name, returning `(contract_id, tick_type, timestamp_seconds)`.
    pub fn parse_filename(file_name: &str, ext: &str) -> Option<(i64, TickType, i64)> {
        let stem = file_name.strip_suffix(&format!(".{}", ext))?;
        let mut parts = stem.rsplitn(3, '_');
        let timestamp_seconds: i64 = parts.next()?.parse().ok()?;
        let tick_type_str = parts.next()?;
        let tick_type = TickType::from_str_loose(tick_type_str)?;
        let contract_id: i64 = parts.next()?.parse().ok()?;
        Some((contract_id, tick_type, timestamp_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_orchestrator_has_no_writers() {
        let orch = StorageOrchestrator::disabled(StorageOrchestratorConfig::default());
        assert!(orch.writer_metrics().is_empty());
    }

    #[test]
    fn hour_dirs_includes_one_hour_look_behind() {
        let root = PathBuf::from("/data");
        // 13:00:00Z and 13:05:00Z same day -> covers 12:00 and 13:00 dirs.
        let start_us = 1_709_643_600_000_000_i64; // 2024-03-05T13:00:00Z
        let end_us = start_us + 5 * 60 * 1_000_000;
        let dirs = layout::hour_dirs(&root, start_us, end_us);
        assert!(dirs.iter().any(|d| d.ends_with("12")));
        assert!(dirs.iter().any(|d| d.ends_with("13")));
    }

    #[test]
    fn filename_round_trips_through_parse() {
        let root = PathBuf::from("/data");
        let path = layout::file_path(&root, 265598, TickType::BidAsk, 1_709_646_300, "jsonl");
        let name = path.file_name().unwrap().to_str().unwrap();
        let (cid, tt, secs) = layout::parse_filename(name, "jsonl").unwrap();
        assert_eq!(cid, 265598);
        assert_eq!(tt, TickType::BidAsk);
        assert_eq!(secs, 1_709_646_300);
    }
}
