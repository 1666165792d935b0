//! # Statistics Aggregation Module
//!
//! Non-blocking collection of numeric samples keyed by (statistic, item).
//! Workers and the IO plane record samples from their hot paths; a periodic
//! flush formats the buffered samples as log lines, hands them to a
//! non-blocking writer, and truncates the buffer to empty.
//!
//! Alongside the raw sample log, every item feeds an HDR histogram that
//! survives flushes. The histogram backs the percentile summaries reported
//! to the controller in STATS_UPDATE replies and printed at shutdown;
//! histogram recording is constant-time regardless of value, so it adds no
//! coordination to the paths being measured.
//!
//! ## Blocking Behavior
//!
//! `record` takes one short per-item mutex and never performs I/O. A full
//! sample buffer drops the sample and counts the drop; flushing formats
//! under the item lock but writes only through the non-blocking writer.
//! Samples for a given (stat, item) form a time-ordered append-only log
//! between flushes.

use crate::defaults;
use crate::error::CoreResult;
use crate::message::{StatsUpdateEntry, StatsUpdatePayload};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Identifiers of the statistics the core gathers.
///
/// Discriminants are wire-stable: they appear in STATS_UPDATE replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatId {
    /// Data-queue length of a worker, sampled at dispatch.
    QueueLength = 0,
    /// Envelopes dispatched to an MSU.
    ItemsProcessed = 1,
    /// Wall time of a full dispatch (dequeue to receive-return), seconds.
    FullMsuTime = 2,
    /// Wall time inside an MSU's receive alone, seconds.
    InternalMsuTime = 3,
    /// Wall time of one worker loop iteration, seconds.
    ThreadLoopTime = 4,
    /// Wall time spent flushing stats themselves, seconds.
    FlushTime = 5,
}

impl StatId {
    pub const ALL: [StatId; 6] = [
        StatId::QueueLength,
        StatId::ItemsProcessed,
        StatId::FullMsuTime,
        StatId::InternalMsuTime,
        StatId::ThreadLoopTime,
        StatId::FlushTime,
    ];

    /// Fixed-width label used in flushed log lines.
    pub fn name(self) -> &'static str {
        match self {
            StatId::QueueLength => "QUEUE_LENGTH",
            StatId::ItemsProcessed => "ITEMS_PROCESSED",
            StatId::FullMsuTime => "FULL_MSU_TIME",
            StatId::InternalMsuTime => "INTERNAL_MSU_TIME",
            StatId::ThreadLoopTime => "THREAD_LOOP_TIME",
            StatId::FlushTime => "FLUSH_TIME",
        }
    }
}

/// One recorded sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Percentile summary of everything ever recorded for one (stat, item).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSummary {
    pub n_samples: u64,
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
    pub max: f64,
}

/// Nanosecond scaling applied before histogram recording, undone on read.
const HIST_SCALE: f64 = 1e9;

struct ItemLog {
    samples: Vec<StatSample>,
    histogram: Histogram<u64>,
    dropped: u64,
    last_flush: Option<Instant>,
}

impl ItemLog {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            // Three significant figures covers every stat the core keeps.
            histogram: Histogram::new(3).expect("static histogram config"),
            dropped: 0,
            last_flush: None,
        }
    }
}

/// Process-wide statistics collector.
///
/// The item map is append-mostly: the read path takes the map's read lock
/// plus the item's own mutex; a new (stat, item) pair takes the write lock
/// once to insert its slot.
pub struct StatsCollector {
    items: RwLock<HashMap<(StatId, u32), Arc<Mutex<ItemLog>>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    max_samples: usize,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
            max_samples: defaults::MAX_STAT_SAMPLES,
        }
    }

    /// Attach the sink flushed lines are written to (typically a
    /// `tracing_appender` non-blocking file writer).
    pub fn set_writer(&self, writer: Box<dyn Write + Send>) {
        *self.writer.lock() = Some(writer);
    }

    fn item(&self, stat: StatId, item: u32) -> Arc<Mutex<ItemLog>> {
        if let Some(log) = self.items.read().get(&(stat, item)) {
            return Arc::clone(log);
        }
        let mut items = self.items.write();
        Arc::clone(
            items
                .entry((stat, item))
                .or_insert_with(|| Arc::new(Mutex::new(ItemLog::new()))),
        )
    }

    /// Record one sample. Non-blocking: a full buffer drops the sample and
    /// counts it rather than waiting for a flush.
    pub fn record(&self, stat: StatId, item: u32, value: f64) {
        let slot = self.item(stat, item);
        let mut log = slot.lock();
        if log.samples.len() >= self.max_samples {
            log.dropped += 1;
        } else {
            log.samples.push(StatSample {
                timestamp: Utc::now(),
                value,
            });
        }
        let scaled = (value * HIST_SCALE).max(0.0) as u64;
        if log.histogram.record(scaled).is_err() {
            log.dropped += 1;
        }
    }

    /// Record the elapsed seconds since `started`.
    pub fn record_elapsed(&self, stat: StatId, item: u32, started: Instant) {
        self.record(stat, item, started.elapsed().as_secs_f64());
    }

    /// Flush one item's buffered samples and truncate the buffer to empty.
    pub fn flush_item(&self, stat: StatId, item: u32) -> CoreResult<usize> {
        let flush_started = Instant::now();
        let slot = self.item(stat, item);
        let (lines, n) = {
            let mut log = slot.lock();
            let mut lines = String::new();
            for sample in &log.samples {
                lines.push_str(&format!(
                    "{}:{:02}:{}:{}\n",
                    stat.name(),
                    item,
                    sample.timestamp.to_rfc3339(),
                    sample.value
                ));
            }
            let n = log.samples.len();
            log.samples.clear();
            log.last_flush = Some(Instant::now());
            (lines, n)
        };
        if n > 0 {
            if let Some(writer) = self.writer.lock().as_mut() {
                writer.write_all(lines.as_bytes())?;
            }
        }
        if stat != StatId::FlushTime {
            self.record_elapsed(StatId::FlushTime, stat as u32, flush_started);
        }
        Ok(n)
    }

    /// Flush every item whose flush interval has elapsed (or all of them
    /// when `force` is set). Returns the number of samples written.
    pub fn flush_all(&self, force: bool) -> usize {
        let keys: Vec<(StatId, u32)> = self.items.read().keys().copied().collect();
        let mut written = 0;
        for (stat, item) in keys {
            let due = {
                let slot = self.item(stat, item);
                let log = slot.lock();
                !log.samples.is_empty()
                    && (force
                        || log
                            .last_flush
                            .map_or(true, |t| t.elapsed() >= defaults::STAT_FLUSH_INTERVAL))
            };
            if due {
                match self.flush_item(stat, item) {
                    Ok(n) => written += n,
                    Err(err) => warn!(?stat, item, %err, "stat flush failed"),
                }
            }
        }
        written
    }

    /// Percentile summary for one (stat, item), if anything was recorded.
    pub fn summary(&self, stat: StatId, item: u32) -> Option<StatSummary> {
        let slot = self.items.read().get(&(stat, item))?.clone();
        let log = slot.lock();
        if log.histogram.len() == 0 {
            return None;
        }
        Some(StatSummary {
            n_samples: log.histogram.len(),
            mean: log.histogram.mean() / HIST_SCALE,
            p50: log.histogram.value_at_quantile(0.50) as f64 / HIST_SCALE,
            p99: log.histogram.value_at_quantile(0.99) as f64 / HIST_SCALE,
            max: log.histogram.max() as f64 / HIST_SCALE,
        })
    }

    /// Buffered-sample count for one (stat, item); zero right after a flush.
    pub fn pending(&self, stat: StatId, item: u32) -> usize {
        self.items
            .read()
            .get(&(stat, item))
            .map_or(0, |slot| slot.lock().samples.len())
    }

    /// Samples dropped against full buffers for one (stat, item).
    pub fn dropped(&self, stat: StatId, item: u32) -> u64 {
        self.items
            .read()
            .get(&(stat, item))
            .map_or(0, |slot| slot.lock().dropped)
    }

    /// Snapshot of every non-empty series, shaped for a STATS_UPDATE reply.
    pub fn snapshot_update(&self) -> StatsUpdatePayload {
        let keys: Vec<(StatId, u32)> = self.items.read().keys().copied().collect();
        let mut entries = Vec::new();
        for (stat, item) in keys {
            if let Some(summary) = self.summary(stat, item) {
                entries.push(StatsUpdateEntry {
                    stat: stat as u32,
                    item,
                    n_samples: summary.n_samples.min(u32::MAX as u64) as u32,
                    mean: summary.mean,
                    p99: summary.p99,
                });
            }
        }
        entries.sort_by_key(|e| (e.stat, e.item));
        StatsUpdatePayload { entries }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Test writer that forwards flushed bytes over a channel.
    struct ChannelWriter(mpsc::Sender<Vec<u8>>);

    impl Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.send(buf.to_vec()).ok();
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn flush_truncates_the_buffer_to_empty() {
        let stats = StatsCollector::new();
        let (tx, rx) = mpsc::channel();
        stats.set_writer(Box::new(ChannelWriter(tx)));

        for i in 0..5 {
            stats.record(StatId::QueueLength, 3, i as f64);
        }
        assert_eq!(stats.pending(StatId::QueueLength, 3), 5);

        let written = stats.flush_item(StatId::QueueLength, 3).unwrap();
        assert_eq!(written, 5);
        assert_eq!(stats.pending(StatId::QueueLength, 3), 0);

        let lines = String::from_utf8(rx.recv().unwrap()).unwrap();
        assert_eq!(lines.lines().count(), 5);
        assert!(lines.lines().all(|l| l.starts_with("QUEUE_LENGTH:03:")));

        // A second flush has nothing left over from the first.
        stats.record(StatId::QueueLength, 3, 9.0);
        assert_eq!(stats.flush_item(StatId::QueueLength, 3).unwrap(), 1);
    }

    #[test]
    fn full_buffer_drops_and_counts() {
        let mut stats = StatsCollector::new();
        stats.max_samples = 4;
        for i in 0..6 {
            stats.record(StatId::ItemsProcessed, 1, i as f64);
        }
        assert_eq!(stats.pending(StatId::ItemsProcessed, 1), 4);
        assert_eq!(stats.dropped(StatId::ItemsProcessed, 1), 2);
    }

    #[test]
    fn summary_survives_flushes() {
        let stats = StatsCollector::new();
        for i in 1..=100 {
            stats.record(StatId::QueueLength, 0, i as f64);
        }
        stats.flush_item(StatId::QueueLength, 0).unwrap();
        let summary = stats.summary(StatId::QueueLength, 0).unwrap();
        assert_eq!(summary.n_samples, 100);
        assert!((summary.mean - 50.5).abs() < 1.0);
        assert!(summary.p99 >= summary.p50);
        assert!((summary.max - 100.0).abs() < 0.2);
    }

    #[test]
    fn snapshot_update_reports_each_series_once() {
        let stats = StatsCollector::new();
        stats.record(StatId::QueueLength, 1, 4.0);
        stats.record(StatId::QueueLength, 2, 8.0);
        stats.record(StatId::ItemsProcessed, 1, 1.0);
        let update = stats.snapshot_update();
        assert_eq!(update.entries.len(), 3);
        assert!(update
            .entries
            .windows(2)
            .all(|w| (w[0].stat, w[0].item) < (w[1].stat, w[1].item)));
    }

    #[test]
    fn flush_all_force_covers_everything() {
        let stats = StatsCollector::new();
        stats.record(StatId::QueueLength, 1, 1.0);
        stats.record(StatId::ThreadLoopTime, 2, 0.5);
        assert_eq!(stats.flush_all(true), 2);
        assert_eq!(stats.pending(StatId::QueueLength, 1), 0);
        assert_eq!(stats.pending(StatId::ThreadLoopTime, 2), 0);
    }
}
