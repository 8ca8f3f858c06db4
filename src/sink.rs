//! Measurement persistence sinks.
//!
//! The sink runs on its own worker task behind a bounded channel. The
//! acquisition loop offers measurements through a [`SinkHandle`]; the handle
//! applies the per-channel log interval and a non-blocking send, so a slow or
//! wedged disk can only ever cost persistence samples, never acquisition
//! timing or fan-out delivery.
//!
//! Only wavemeter readings are persisted. Etalon traces and their scalar
//! peak summaries are fanned out to subscribers but never written to disk;
//! `offer` filters on the measurement source.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SinkKind, SinkSection};
use crate::error::{AppResult, WavemuxError};
use crate::measurement::{Measurement, Source};

/// A destination for persisted measurements.
#[async_trait]
pub trait MeasurementSink: Send {
    /// Prepares the sink for writing. Called once before the worker starts;
    /// a failure here aborts startup.
    async fn open(&mut self) -> AppResult<()>;

    /// Appends one measurement.
    async fn record(&mut self, measurement: &Measurement) -> AppResult<()>;

    /// Flushes and releases the sink's resources.
    async fn close(&mut self) -> AppResult<()>;

    fn describe(&self) -> String;
}

/// Discards everything. Used by simulation and bench setups.
pub struct NullSink;

#[async_trait]
impl MeasurementSink for NullSink {
    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn record(&mut self, _measurement: &Measurement) -> AppResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "null".to_string()
    }
}

/// Appends rows to a timestamped CSV file, one file per server run.
#[cfg(feature = "sink_csv")]
pub struct CsvSink {
    dir: std::path::PathBuf,
    path: std::path::PathBuf,
    writer: Option<csv::Writer<std::fs::File>>,
}

#[cfg(feature = "sink_csv")]
impl CsvSink {
    /// Creates a sink that will place its run file under `dir`.
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            path: std::path::PathBuf::new(),
            writer: None,
        }
    }

    /// Path of the run file, valid after a successful [`MeasurementSink::open`].
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(feature = "sink_csv")]
#[async_trait]
impl MeasurementSink for CsvSink {
    async fn open(&mut self) -> AppResult<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| {
                WavemuxError::Sink(format!("create {}: {}", self.dir.display(), e))
            })?;
        }
        let file_name = format!(
            "wavemux_{}.csv",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        self.path = self.dir.join(file_name);

        let file = std::fs::File::create(&self.path)
            .map_err(|e| WavemuxError::Sink(format!("create {}: {}", self.path.display(), e)))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record([
                "timestamp",
                "channel",
                "source",
                "status",
                "value_hz",
                "detuning_hz",
                "error_code",
            ])
            .map_err(|e| WavemuxError::Sink(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| WavemuxError::Sink(e.to_string()))?;
        self.writer = Some(writer);
        info!(path = %self.path.display(), "csv sink opened");
        Ok(())
    }

    async fn record(&mut self, measurement: &Measurement) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| WavemuxError::Sink("csv sink is not open".to_string()))?;
        writer
            .write_record(&[
                measurement.timestamp.to_rfc3339(),
                measurement.channel.clone(),
                measurement.source.to_string(),
                measurement.status.to_string(),
                measurement.value.map(|v| v.to_string()).unwrap_or_default(),
                measurement
                    .detuning
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                measurement
                    .error_code
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            ])
            .map_err(|e| WavemuxError::Sink(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| WavemuxError::Sink(e.to_string()))?;
        }
        info!("csv sink closed");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("csv ({})", self.dir.display())
    }
}

/// Instantiates the sink named by the configuration.
pub fn build(section: &SinkSection) -> AppResult<Box<dyn MeasurementSink>> {
    match section.kind {
        SinkKind::Null => Ok(Box::new(NullSink)),
        SinkKind::Csv => {
            #[cfg(feature = "sink_csv")]
            {
                Ok(Box::new(CsvSink::new(&section.path)))
            }
            #[cfg(not(feature = "sink_csv"))]
            {
                Err(WavemuxError::FeatureNotEnabled("sink_csv".to_string()))
            }
        }
    }
}

/// Producer side of the persistence pipeline, held by the acquisition loop.
pub struct SinkHandle {
    tx: mpsc::Sender<Measurement>,
    log_interval: Duration,
    last_persisted: Mutex<HashMap<String, Instant>>,
}

impl SinkHandle {
    /// Offers a measurement for persistence. Applies the per-channel log
    /// interval and never blocks; when the worker queue is full the sample
    /// is dropped.
    pub fn offer(&self, measurement: &Measurement) {
        if measurement.source != Source::Wavemeter {
            return;
        }
        let now = Instant::now();
        {
            let mut last = match self.last_persisted.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(at) = last.get(&measurement.channel) {
                if now.duration_since(*at) < self.log_interval {
                    return;
                }
            }
            last.insert(measurement.channel.clone(), now);
        }
        if self.tx.try_send(measurement.clone()).is_err() {
            warn!(
                channel = %measurement.channel,
                "sink queue full, dropping persistence sample"
            );
        }
    }
}

/// Starts the worker task draining into an already-opened sink.
///
/// The worker stops, flushing the sink, once every [`SinkHandle`] is gone.
pub fn spawn(
    mut sink: Box<dyn MeasurementSink>,
    section: &SinkSection,
) -> (SinkHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(section.queue_capacity.max(1));
    let handle = SinkHandle {
        tx,
        log_interval: section.log_interval,
        last_persisted: Mutex::new(HashMap::new()),
    };
    let task = tokio::spawn(async move {
        info!(sink = %sink.describe(), "persistence worker started");
        while let Some(measurement) = rx.recv().await {
            if let Err(e) = sink.record(&measurement).await {
                warn!(error = %e, channel = %measurement.channel, "sink write failed");
            }
        }
        if let Err(e) = sink.close().await {
            warn!(error = %e, "sink close failed");
        }
        debug!("persistence worker stopped");
    });
    (handle, task)
}
