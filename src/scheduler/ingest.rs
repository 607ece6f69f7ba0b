//! Ingestion writer: the only task that appends to the event log.

use crate::eventlog::{encode_batch, LogStore, MeasurementRecord, StoreError};

use super::PipelineMetrics;

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const MAX_WRITE_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Batching and shutdown settings for the writer.
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Longest the writer keeps draining after the stop signal.
    pub drain_timeout: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// What the writer did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub records_written: u64,
    pub records_lost: u64,
    pub batches_flushed: u64,
}

/// Merges the per-protocol queues into one stream.
///
/// Order inside a single queue is preserved; queues are visited round-robin
/// so a busy protocol cannot starve the others.
pub struct FanIn {
    queues: Vec<mpsc::Receiver<MeasurementRecord>>,
    next: usize,
}

impl FanIn {
    pub fn new(queues: Vec<mpsc::Receiver<MeasurementRecord>>) -> Self {
        Self { queues, next: 0 }
    }

    /// Next record from any queue, or `None` once every producer is gone
    /// and every queue is empty.
    pub async fn recv(&mut self) -> Option<MeasurementRecord> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<MeasurementRecord>> {
        let n = self.queues.len();
        let mut closed = 0;

        for i in 0..n {
            let idx = (self.next + i) % n;
            match self.queues[idx].poll_recv(cx) {
                Poll::Ready(Some(record)) => {
                    self.next = (idx + 1) % n;
                    return Poll::Ready(Some(record));
                }
                Poll::Ready(None) => closed += 1,
                Poll::Pending => {}
            }
        }

        if closed == n {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    /// Take everything already sitting in the queues without waiting.
    pub fn take_queued(&mut self) -> Vec<MeasurementRecord> {
        let mut out = Vec::new();
        for queue in &mut self.queues {
            while let Ok(record) = queue.try_recv() {
                out.push(record);
            }
        }
        out
    }
}

/// Single consumer of all scheduler output.
pub struct IngestWriter {
    /// Moved onto the blocking pool for each append; `None` only if that task died.
    store: Option<LogStore>,
    fan_in: FanIn,
    settings: IngestSettings,
    metrics: Arc<PipelineMetrics>,
    buffer: Vec<MeasurementRecord>,
    report: IngestReport,
}

impl IngestWriter {
    pub fn new(
        store: LogStore,
        queues: Vec<mpsc::Receiver<MeasurementRecord>>,
        settings: IngestSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let settings = IngestSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        Self {
            store: Some(store),
            fan_in: FanIn::new(queues),
            settings,
            metrics,
            buffer: Vec::with_capacity(settings.batch_size),
            report: IngestReport::default(),
        }
    }

    pub fn spawn(self, stop_rx: oneshot::Receiver<()>) -> JoinHandle<IngestReport> {
        tokio::spawn(self.run(stop_rx))
    }

    /// Consume until every producer has finished, or until the drain
    /// timeout after a stop signal, then flush what is left.
    ///
    /// The stop is meant to be sent once the producers have exited, so the
    /// drain deadline only covers what is already queued.
    pub async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> IngestReport {
        let period = self.settings.flush_interval;
        let mut flush_timer = tokio::time::interval_at(Instant::now() + period, period);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut drain_deadline: Option<Instant> = None;

        loop {
            let deadline = drain_deadline;
            let drain_expired = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                received = self.fan_in.recv() => match received {
                    Some(record) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= self.settings.batch_size {
                            self.flush().await;
                            flush_timer.reset();
                        }
                    }
                    None => break,
                },
                _ = flush_timer.tick() => {
                    self.flush().await;
                }
                _ = &mut stop_rx, if drain_deadline.is_none() => {
                    tracing::info!(
                        "Ingest: stop received, draining for up to {:?}",
                        self.settings.drain_timeout
                    );
                    drain_deadline = Some(Instant::now() + self.settings.drain_timeout);
                }
                _ = drain_expired => {
                    let queued = self.fan_in.take_queued();
                    tracing::warn!(
                        "Ingest: drain timeout reached, persisting {} queued records and closing",
                        queued.len()
                    );
                    self.buffer.extend(queued);
                    break;
                }
            }
        }

        self.flush().await;
        tracing::info!(
            "Ingest: stopped after writing {} records ({} lost)",
            self.report.records_written,
            self.report.records_lost
        );
        self.report
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.buffer);

        let batch = match encode_batch(&records) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Ingest: failed to encode batch of {}: {}", records.len(), e);
                self.lose(records.len());
                return;
            }
        };

        let mut batch = batch;
        let mut attempt = 0;
        loop {
            let (returned, result) = self.append(batch).await;

            match (result, returned) {
                (Ok(()), _) => {
                    self.metrics.record_flush(records.len());
                    self.report.records_written += records.len() as u64;
                    self.report.batches_flushed += 1;
                    break;
                }
                (Err(e), Some(returned)) if attempt < MAX_WRITE_RETRIES => {
                    batch = returned;
                    attempt += 1;
                    self.metrics.record_retry();
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        "Ingest: append failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        MAX_WRITE_RETRIES,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                (Err(e), _) => {
                    tracing::error!(
                        "Ingest: dropping batch of {} records after {} retries: {}",
                        records.len(),
                        attempt,
                        e
                    );
                    self.lose(records.len());
                    break;
                }
            }
        }

        self.buffer = records;
        self.buffer.clear();
    }

    /// Append on the blocking pool so a stalled disk does not hold a runtime
    /// worker. The batch comes back for a retry unless the task died.
    async fn append(&mut self, batch: Vec<u8>) -> (Option<Vec<u8>>, Result<(), StoreError>) {
        let Some(mut store) = self.store.take() else {
            return (Some(batch), Err(StoreError::Closed));
        };

        let joined = tokio::task::spawn_blocking(move || {
            let result = store.append(&batch);
            (store, batch, result)
        })
        .await;

        match joined {
            Ok((store, batch, result)) => {
                self.store = Some(store);
                (Some(batch), result)
            }
            Err(e) => {
                tracing::error!("Ingest: append task failed, log store lost: {}", e);
                (None, Err(StoreError::Closed))
            }
        }
    }

    fn lose(&mut self, records: usize) {
        self.metrics.record_lost(records);
        self.report.records_lost += records as u64;
    }
}
