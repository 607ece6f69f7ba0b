//! Scheduler module for running probes and persisting their records.

mod ingest;
mod metrics;

pub use ingest::*;
pub use metrics::*;

use crate::eventlog::{LogStore, MeasurementRecord, Protocol};
use crate::probe::{run_probe, ProtocolConfig};

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Slack on top of the probe timeout before a tick is abandoned.
const TICK_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a protocol scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Drives one protocol's probe on its own timer.
pub struct Scheduler {
    config: ProtocolConfig,
    queue: mpsc::Sender<MeasurementRecord>,
    metrics: Arc<PipelineMetrics>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        config: ProtocolConfig,
        queue: mpsc::Sender<MeasurementRecord>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            config,
            queue,
            metrics,
            state,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Start ticking; the task resolves to the number of ticks run.
    pub fn spawn(self, stop_rx: broadcast::Receiver<()>) -> JoinHandle<u64> {
        tokio::spawn(self.run(stop_rx))
    }

    async fn run(self, mut stop_rx: broadcast::Receiver<()>) -> u64 {
        let protocol = self.config.protocol;
        tracing::info!(
            "Scheduler: starting {} probes to {} every {:?} (timeout {:?})",
            protocol,
            self.config.target(),
            self.config.interval,
            self.config.timeout
        );
        self.state.send_replace(SchedulerState::Running);

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut ticks = 0u64;
        let mut stopping = false;

        while !stopping {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => {
                    self.begin_drain();
                    break;
                }
                _ = interval.tick() => {}
            }

            let record = self.finish(self.tick(), &mut stop_rx, &mut stopping).await;
            ticks += 1;
            if !self.finish(self.enqueue(record), &mut stop_rx, &mut stopping).await {
                break;
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        tracing::info!("Scheduler: {} stopped after {} ticks", protocol, ticks);
        ticks
    }

    /// Drive `work` to completion. A stop arriving meanwhile moves the
    /// scheduler to `Draining` but does not cancel the work.
    async fn finish<F: Future>(
        &self,
        work: F,
        stop_rx: &mut broadcast::Receiver<()>,
        stopping: &mut bool,
    ) -> F::Output {
        tokio::pin!(work);
        if *stopping {
            return work.await;
        }
        tokio::select! {
            biased;
            out = &mut work => out,
            _ = stop_rx.recv() => {
                *stopping = true;
                self.begin_drain();
                work.await
            }
        }
    }

    fn begin_drain(&self) {
        tracing::debug!("Scheduler: {} draining", self.config.protocol);
        self.state.send_replace(SchedulerState::Draining);
    }

    /// One probe attempt, bounded so that it always yields a record.
    async fn tick(&self) -> MeasurementRecord {
        let bound = self.config.timeout + TICK_GRACE;
        match tokio::time::timeout(bound, run_probe(&self.config)).await {
            Ok(record) => record,
            Err(_) => {
                tracing::warn!(
                    "Scheduler: {} probe exceeded {:?}, recording timeout",
                    self.config.protocol,
                    bound
                );
                MeasurementRecord::timeout(
                    self.config.protocol,
                    &self.config.target(),
                    "request timed out",
                )
            }
        }
    }

    /// Hand the record to the writer, waiting if the queue is full.
    async fn enqueue(&self, record: MeasurementRecord) -> bool {
        let protocol = self.config.protocol;
        let record = match self.queue.try_send(record) {
            Ok(()) => {
                self.metrics.record_enqueued(protocol);
                return true;
            }
            Err(mpsc::error::TrySendError::Full(record)) => record,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Scheduler: {} queue closed, dropping record", protocol);
                self.metrics.record_dropped(protocol);
                return false;
            }
        };

        self.metrics.record_backpressure(protocol);
        tracing::warn!("Scheduler: {} queue full, waiting for the writer", protocol);

        match self.queue.send(record).await {
            Ok(()) => {
                self.metrics.record_enqueued(protocol);
                true
            }
            Err(_) => {
                tracing::error!("Scheduler: {} queue closed, dropping record", protocol);
                self.metrics.record_dropped(protocol);
                false
            }
        }
    }
}

/// Cloneable view of every scheduler's lifecycle state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStates(Vec<(Protocol, watch::Receiver<SchedulerState>)>);

impl SchedulerStates {
    pub fn snapshot(&self) -> BTreeMap<Protocol, SchedulerState> {
        self.0.iter().map(|(p, rx)| (*p, *rx.borrow())).collect()
    }
}

/// Pipeline sizing.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub ingest: IngestSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            ingest: IngestSettings::default(),
        }
    }
}

/// Running schedulers plus the writer that persists their output.
pub struct Pipeline {
    stop_tx: broadcast::Sender<()>,
    schedulers: Vec<(Protocol, JoinHandle<u64>)>,
    states: SchedulerStates,
    writer_stop: oneshot::Sender<()>,
    writer: JoinHandle<IngestReport>,
    drain_timeout: Duration,
}

impl Pipeline {
    /// Spawn one scheduler per config and the ingestion writer.
    pub fn start(
        configs: Vec<ProtocolConfig>,
        store: LogStore,
        settings: PipelineSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);

        let mut receivers = Vec::with_capacity(configs.len());
        let mut schedulers = Vec::with_capacity(configs.len());
        let mut states = Vec::with_capacity(configs.len());

        for config in configs {
            let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
            receivers.push(rx);

            let scheduler = Scheduler::new(config, tx, metrics.clone());
            let protocol = scheduler.protocol();
            states.push((protocol, scheduler.subscribe()));
            schedulers.push((protocol, scheduler.spawn(stop_tx.subscribe())));
        }

        tracing::info!(
            "Pipeline: writing {} protocol queues to {}",
            receivers.len(),
            store.path().display()
        );
        let (writer_stop, writer_stop_rx) = oneshot::channel();
        let writer =
            IngestWriter::new(store, receivers, settings.ingest, metrics).spawn(writer_stop_rx);

        Self {
            stop_tx,
            schedulers,
            states: SchedulerStates(states),
            writer_stop,
            writer,
            drain_timeout: settings.ingest.drain_timeout,
        }
    }

    /// Current state of every scheduler.
    pub fn states(&self) -> SchedulerStates {
        self.states.clone()
    }

    /// Stop all schedulers, let in-flight ticks finish, then drain the writer.
    pub async fn shutdown(self) -> Option<IngestReport> {
        tracing::info!("Pipeline: stopping {} schedulers", self.schedulers.len());
        let _ = self.stop_tx.send(());

        for (protocol, handle) in self.schedulers {
            if let Err(e) = handle.await {
                tracing::error!("Pipeline: {} scheduler task failed: {}", protocol, e);
            }
        }

        // every producer is gone; the drain deadline starts only now
        let _ = self.writer_stop.send(());

        // the writer bounds its own drain; this only guards against a hung flush
        let mut writer = self.writer;
        match tokio::time::timeout(self.drain_timeout * 2, &mut writer).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::error!("Pipeline: writer task failed: {}", e);
                None
            }
            Err(_) => {
                tracing::error!("Pipeline: writer did not finish draining, aborting it");
                writer.abort();
                None
            }
        }
    }
}
