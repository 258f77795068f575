//! Pipeline coordinator: merges readings, batches them, and writes summaries.
//!
//! The [`Coordinator`] is the single consumer of the shared reading channel. It
//! owns the batches and the [`RotatingSink`] exclusively, so neither needs any
//! locking. Shutdown is a `tokio::select!` between the channel and an external
//! termination future.

use std::collections::HashMap;
use std::future::Future;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::{aggregate, format_summary, Stats};
use crate::config::Config;
use crate::generator::{Generator, GeneratorConfig, Reading, StopSignal};
use crate::sink::{RotatingSink, SinkError};

/// Capacity of the merge channel. One slot is the closest tokio gets to a
/// rendezvous hand-off: a second send waits for the coordinator.
pub const READING_CHANNEL_CAPACITY: usize = 1;

/// Notice printed on stdout when the pipeline shuts down.
const SHUTDOWN_NOTICE: &str = "Shutting down ...";

/// How readings from different sensors share batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One batch for all sensors. A flushed batch may mix sensors and is
    /// labeled with the name and unit of its last reading.
    Shared,

    /// One batch per sensor name, each flushed independently.
    #[default]
    PerSensor,
}

impl std::fmt::Display for BatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchMode::Shared => write!(f, "shared"),
            BatchMode::PerSensor => write!(f, "per_sensor"),
        }
    }
}

/// Values accumulated for one batch, with the metadata of the latest reading.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    values: Vec<f64>,
    name: String,
    unit: String,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            name: String::new(),
            unit: String::new(),
        }
    }

    pub fn push(&mut self, reading: Reading) {
        self.values.push(reading.value);
        self.name = reading.name;
        self.unit = reading.unit;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Aggregate the batch and clear it, keeping its allocation.
    fn flush(&mut self) -> BatchSummary {
        let summary = BatchSummary {
            name: self.name.clone(),
            unit: self.unit.clone(),
            count: self.values.len(),
            stats: aggregate(&self.values),
        };
        self.values.clear();
        summary
    }
}

/// Result of flushing one full batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub name: String,
    pub unit: String,
    pub count: usize,
    pub stats: Stats,
}

impl BatchSummary {
    /// The line written to the rotating log.
    pub fn to_line(&self) -> String {
        format_summary(&self.name, &self.unit, &self.stats)
    }
}

/// Groups readings into fixed-size batches according to a [`BatchMode`].
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    mode: BatchMode,
    batches: HashMap<String, Batch>,
}

impl Batcher {
    /// Create a batcher. A `batch_size` of zero is treated as one.
    pub fn new(batch_size: usize, mode: BatchMode) -> Self {
        Self {
            batch_size: batch_size.max(1),
            mode,
            batches: HashMap::new(),
        }
    }

    /// Append a reading; returns a summary when its batch reaches the batch size.
    pub fn push(&mut self, reading: Reading) -> Option<BatchSummary> {
        let key = match self.mode {
            BatchMode::Shared => String::new(),
            BatchMode::PerSensor => reading.name.clone(),
        };

        let batch_size = self.batch_size;
        let batch = self
            .batches
            .entry(key)
            .or_insert_with(|| Batch::with_capacity(batch_size));

        batch.push(reading);
        if batch.len() >= batch_size {
            Some(batch.flush())
        } else {
            None
        }
    }

    /// Number of values waiting in partially filled batches.
    pub fn pending(&self) -> usize {
        self.batches.values().map(Batch::len).sum()
    }

    /// Drop every partially filled batch, returning how many values were lost.
    pub fn discard(&mut self) -> usize {
        let mut discarded = 0;
        for (key, batch) in self.batches.iter_mut().filter(|(_, b)| !b.is_empty()) {
            warn!(
                batch = %key,
                sensor = %batch.name(),
                values = batch.len(),
                "Discarding partially filled batch"
            );
            discarded += batch.len();
            batch.values.clear();
        }
        discarded
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Counters reported when the coordinator stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Total number of readings consumed from the channel
    pub readings_received: u64,

    /// Number of batches aggregated and written to the sink
    pub batches_flushed: u64,

    /// Values left in partial batches at shutdown
    pub values_discarded: usize,

    /// Log files opened by the sink
    pub files_opened: usize,
}

/// Errors that stop the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("log sink failure: {0}")]
    Sink(#[from] SinkError),
}

/// Single consumer of the reading channel.
#[derive(Debug)]
pub struct Coordinator {
    batcher: Batcher,
    sink: RotatingSink,
    stats: PipelineStats,
}

impl Coordinator {
    pub fn new(batch_size: usize, mode: BatchMode, sink: RotatingSink) -> Self {
        Self {
            batcher: Batcher::new(batch_size, mode),
            sink,
            stats: PipelineStats::default(),
        }
    }

    /// Batch one reading, writing a summary line if its batch fills up.
    pub fn handle(&mut self, reading: Reading) -> Result<Option<BatchSummary>, SinkError> {
        self.stats.readings_received += 1;

        let Some(summary) = self.batcher.push(reading) else {
            return Ok(None);
        };

        self.sink.write(&summary.to_line())?;
        self.stats.batches_flushed += 1;
        debug!(
            sensor = %summary.name,
            count = summary.count,
            mean = summary.stats.mean,
            "Batch flushed"
        );
        Ok(Some(summary))
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.batcher.pending()
    }

    pub fn sink(&self) -> &RotatingSink {
        &self.sink
    }

    /// Consume readings until `shutdown` resolves or every producer is gone.
    ///
    /// On exit the stop signal is triggered, partial batches are discarded and
    /// the sink is closed. Generators are not awaited. A sink write failure
    /// ends the loop and is returned after the same shutdown steps.
    pub async fn run<S>(
        mut self,
        mut rx: mpsc::Receiver<Reading>,
        stop: StopSignal,
        shutdown: S,
    ) -> Result<PipelineStats, PipelineError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Termination requested");
                    break Ok(());
                }

                maybe_reading = rx.recv() => {
                    match maybe_reading {
                        Some(reading) => {
                            if let Err(e) = self.handle(reading) {
                                error!(error = %e, "Log sink failed, stopping pipeline");
                                break Err(e);
                            }
                        }
                        None => {
                            info!("Reading channel closed, all generators stopped");
                            break Ok(());
                        }
                    }
                }
            }
        };

        stop.trigger();
        println!("{}", SHUTDOWN_NOTICE);

        self.stats.values_discarded = self.batcher.discard();
        self.stats.files_opened = self.sink.files_opened();
        let closed = self.sink.close();

        outcome?;
        closed?;

        info!(
            readings = self.stats.readings_received,
            batches = self.stats.batches_flushed,
            discarded = self.stats.values_discarded,
            "Coordinator stopped"
        );
        Ok(self.stats)
    }
}

/// Start one generator task per config, all sending into `tx`.
pub fn spawn_generators(
    configs: impl IntoIterator<Item = GeneratorConfig>,
    tx: &mpsc::Sender<Reading>,
    stop: &StopSignal,
) -> Vec<JoinHandle<()>> {
    configs
        .into_iter()
        .map(|config| {
            info!(
                sensor = %config.name,
                unit = %config.unit,
                min = config.min,
                max = config.max,
                period_ms = config.period.as_millis() as u64,
                "Starting generator"
            );
            Generator::new(config).start(tx.clone(), stop.listener())
        })
        .collect()
}

/// Build and run the full pipeline from `config` until `shutdown` resolves.
///
/// The sink is opened before any generator starts, so a construction failure
/// leaves nothing running.
pub async fn run<S>(config: &Config, shutdown: S) -> Result<PipelineStats, PipelineError>
where
    S: Future<Output = ()>,
{
    let sink = RotatingSink::open(config.logger.sink_config())?;

    let (tx, rx) = mpsc::channel(READING_CHANNEL_CAPACITY);
    let stop = StopSignal::new();
    let generators = spawn_generators(config.generator_configs(), &tx, &stop);
    drop(tx);

    info!(
        generators = generators.len(),
        batch_size = config.processor.batch_size,
        batch_mode = %config.processor.batch_mode,
        "Pipeline started"
    );

    Coordinator::new(config.processor.batch_size, config.processor.batch_mode, sink)
        .run(rx, stop, shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkConfig;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn reading(name: &str, unit: &str, value: f64) -> Reading {
        Reading::new(name, unit, value)
    }

    fn open_sink(dir: &Path) -> RotatingSink {
        RotatingSink::open(SinkConfig::new(dir, "sensor", 100)).expect("should open sink")
    }

    fn log_lines(dir: &Path) -> Vec<String> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        files.sort();
        files
            .iter()
            .flat_map(|f| {
                fs::read_to_string(f)
                    .expect("read log")
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_batch_mode_deserialization() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: BatchMode,
        }

        let w: Wrapper = toml::from_str(r#"mode = "shared""#).unwrap();
        assert_eq!(w.mode, BatchMode::Shared);
        let w: Wrapper = toml::from_str(r#"mode = "per_sensor""#).unwrap();
        assert_eq!(w.mode, BatchMode::PerSensor);
        assert_eq!(BatchMode::default(), BatchMode::PerSensor);
    }

    #[test]
    fn test_batcher_flushes_at_batch_size() {
        let mut batcher = Batcher::new(3, BatchMode::Shared);

        assert!(batcher.push(reading("temperature", "C", 10.0)).is_none());
        assert!(batcher.push(reading("temperature", "C", 20.0)).is_none());
        let summary = batcher
            .push(reading("temperature", "C", 30.0))
            .expect("third reading fills the batch");

        assert_eq!(summary.count, 3);
        assert_eq!(summary.stats.mean, 20.0);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_batcher_shared_mode_labels_with_last_reading() {
        let mut batcher = Batcher::new(3, BatchMode::Shared);

        batcher.push(reading("temperature", "C", 20.0));
        batcher.push(reading("temperature", "C", 22.0));
        let summary = batcher
            .push(reading("pressure", "hPa", 1013.0))
            .expect("mixed batch still flushes");

        // Mixed sensors end up in one batch labeled after the last reading.
        assert_eq!(summary.name, "pressure");
        assert_eq!(summary.unit, "hPa");
        assert_eq!(summary.stats.min, 20.0);
        assert_eq!(summary.stats.max, 1013.0);
    }

    #[test]
    fn test_batcher_per_sensor_mode_keeps_sensors_apart() {
        let mut batcher = Batcher::new(2, BatchMode::PerSensor);

        assert!(batcher.push(reading("temperature", "C", 20.0)).is_none());
        assert!(batcher.push(reading("pressure", "hPa", 1000.0)).is_none());
        let temp = batcher
            .push(reading("temperature", "C", 24.0))
            .expect("temperature batch full");
        assert_eq!(temp.name, "temperature");
        assert_eq!(temp.stats.mean, 22.0);
        assert_eq!(batcher.pending(), 1);

        let pressure = batcher
            .push(reading("pressure", "hPa", 1020.0))
            .expect("pressure batch full");
        assert_eq!(pressure.name, "pressure");
        assert_eq!(pressure.unit, "hPa");
        assert_eq!(pressure.stats.mean, 1010.0);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_batcher_discard() {
        let mut batcher = Batcher::new(5, BatchMode::PerSensor);
        batcher.push(reading("temperature", "C", 1.0));
        batcher.push(reading("temperature", "C", 2.0));
        batcher.push(reading("pressure", "hPa", 3.0));

        assert_eq!(batcher.pending(), 3);
        assert_eq!(batcher.discard(), 3);
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.discard(), 0);
    }

    #[test]
    fn test_batcher_zero_batch_size_treated_as_one() {
        let mut batcher = Batcher::new(0, BatchMode::Shared);
        assert_eq!(batcher.batch_size(), 1);
        assert!(batcher.push(reading("temperature", "C", 1.0)).is_some());
    }

    #[test]
    fn test_coordinator_three_readings_one_write() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut coordinator = Coordinator::new(3, BatchMode::Shared, open_sink(temp_dir.path()));

        for v in [10.0, 20.0, 30.0] {
            coordinator.handle(reading("temperature", "C", v)).unwrap();
        }

        assert_eq!(coordinator.stats().batches_flushed, 1);
        assert_eq!(coordinator.sink().line_count(), 1);
        assert_eq!(coordinator.pending(), 0);

        let lines = log_lines(temp_dir.path());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("INFO: "));
        assert!(lines[0].ends_with("temperature stats [C] -> Mean: 20.00, Min: 10.00, Max: 30.00"));
    }

    #[test]
    fn test_coordinator_five_readings_keeps_two_pending() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut coordinator = Coordinator::new(3, BatchMode::Shared, open_sink(temp_dir.path()));

        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            coordinator.handle(reading("temperature", "C", v)).unwrap();
        }

        assert_eq!(coordinator.stats().readings_received, 5);
        assert_eq!(coordinator.stats().batches_flushed, 1);
        assert_eq!(coordinator.pending(), 2);
        assert_eq!(log_lines(temp_dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_run_discards_partial_batch_on_channel_close() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let coordinator = Coordinator::new(3, BatchMode::Shared, open_sink(temp_dir.path()));
        let (tx, rx) = mpsc::channel(8);
        let stop = StopSignal::new();
        let listener = stop.listener();

        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            tx.send(reading("temperature", "C", v)).await.unwrap();
        }
        drop(tx);

        let stats = coordinator
            .run(rx, stop, std::future::pending())
            .await
            .expect("run should succeed");

        assert_eq!(stats.readings_received, 5);
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.values_discarded, 2);
        assert_eq!(stats.files_opened, 1);
        assert!(listener.is_stopped());

        let lines = log_lines(temp_dir.path());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("temperature stats [C] -> Mean: 2.00, Min: 1.00, Max: 3.00"));
    }

    #[tokio::test]
    async fn test_run_fails_when_rotation_cannot_open_file() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let log_dir = temp_dir.path().join("logs");
        let sink = RotatingSink::open(SinkConfig::new(&log_dir, "sensor", 1)).expect("should open");
        let coordinator = Coordinator::new(1, BatchMode::Shared, sink);
        fs::remove_dir_all(&log_dir).expect("remove log dir");

        let (tx, rx) = mpsc::channel(8);
        let stop = StopSignal::new();
        let listener = stop.listener();
        tx.send(reading("temperature", "C", 1.0)).await.unwrap();
        tx.send(reading("temperature", "C", 2.0)).await.unwrap();

        let result = coordinator.run(rx, stop, std::future::pending()).await;

        assert!(matches!(
            result,
            Err(PipelineError::Sink(SinkError::Open { .. }))
        ));
        assert!(listener.is_stopped());
        // The channel is still open: the sink failure alone ended the loop.
        drop(tx);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_request() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let coordinator = Coordinator::new(3, BatchMode::PerSensor, open_sink(temp_dir.path()));
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let stop = StopSignal::new();
        let listener = stop.listener();

        let handle = tokio::spawn(async move {
            coordinator
                .run(rx, stop, async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        for v in [10.0, 20.0, 30.0, 40.0] {
            tx.send(reading("temperature", "C", v)).await.unwrap();
        }
        // The capacity-1 channel only accepts the next send once the previous
        // reading was taken, so at least three readings have been handled here.
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(()).unwrap();

        let stats = timeout(Duration::from_secs(1), handle)
            .await
            .expect("coordinator should stop")
            .unwrap()
            .expect("run should succeed");

        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.readings_received, 4);
        assert_eq!(stats.values_discarded, 1);
        assert!(listener.is_stopped());
        // tx is still alive: shutdown did not depend on the channel closing.
        drop(tx);

        let lines = log_lines(temp_dir.path());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("temperature stats [C] -> Mean: 20.00, Min: 10.00, Max: 30.00"));
    }

    #[tokio::test]
    async fn test_run_with_generators_writes_and_stops() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let coordinator = Coordinator::new(2, BatchMode::PerSensor, open_sink(temp_dir.path()));
        let (tx, rx) = mpsc::channel(READING_CHANNEL_CAPACITY);
        let stop = StopSignal::new();

        let configs = vec![
            GeneratorConfig::new("temperature", "C", 18.0, 26.0, Duration::from_millis(5)),
            GeneratorConfig::new("pressure", "hPa", 990.0, 1030.0, Duration::from_millis(7)),
        ];
        let handles = spawn_generators(configs, &tx, &stop);
        drop(tx);
        assert_eq!(handles.len(), 2);

        let stats = coordinator
            .run(rx, stop, tokio::time::sleep(Duration::from_millis(200)))
            .await
            .expect("run should succeed");

        for handle in handles {
            timeout(Duration::from_millis(100), handle)
                .await
                .expect("generator should stop after shutdown")
                .unwrap();
        }

        assert!(stats.batches_flushed >= 1);
        let lines = log_lines(temp_dir.path());
        assert_eq!(lines.len() as u64, stats.batches_flushed);
        for line in lines {
            let is_temp = line.contains("temperature stats [C]");
            let is_pressure = line.contains("pressure stats [hPa]");
            assert!(is_temp || is_pressure, "unexpected line: {}", line);
        }
    }

    #[tokio::test]
    async fn test_run_pipeline_from_config() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut config = Config::default();
        config.logger.dir = temp_dir.path().join("logs");
        config.processor.batch_size = 1;
        for sensor in &mut config.sensors {
            sensor.period_ms = 5;
        }

        let stats = run(&config, tokio::time::sleep(Duration::from_millis(100)))
            .await
            .expect("pipeline should run");

        assert!(stats.readings_received >= 1);
        assert_eq!(stats.batches_flushed, stats.readings_received);
        assert_eq!(stats.values_discarded, 0);
        assert_eq!(log_lines(&config.logger.dir).len() as u64, stats.batches_flushed);
    }

    #[tokio::test]
    async fn test_run_pipeline_fails_before_starting_on_bad_dir() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let blocker = temp_dir.path().join("file");
        fs::write(&blocker, b"").unwrap();

        let mut config = Config::default();
        config.logger.dir = blocker.join("logs");

        let result = run(&config, std::future::pending()).await;
        assert!(matches!(
            result,
            Err(PipelineError::Sink(SinkError::CreateDir { .. }))
        ));
    }
}
