//! Generator module for simulating periodic physical sensors.
//!
//! Each [`Generator`] runs as its own tokio task: on every tick of its period it
//! samples a value uniformly from the configured range and sends a [`Reading`]
//! onto a shared channel. All generators observe one [`StopSignal`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// A single timestamped sample from a simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Wall-clock time at which the sample was taken
    pub timestamp: DateTime<Utc>,

    /// Sampled value
    pub value: f64,

    /// Name of the sensor that produced the reading
    pub name: String,

    /// Unit of the sampled value
    pub unit: String,
}

impl Reading {
    /// Create a new reading stamped with the current time.
    pub fn new(name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            value,
            name: name.into(),
            unit: unit.into(),
        }
    }
}

/// Configuration for a single simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Sensor name, copied into every reading
    pub name: String,

    /// Unit label, copied into every reading
    pub unit: String,

    /// Inclusive lower bound of sampled values
    pub min: f64,

    /// Inclusive upper bound of sampled values
    pub max: f64,

    /// Time between two emitted readings
    pub period: Duration,
}

impl GeneratorConfig {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        min: f64,
        max: f64,
        period: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            min,
            max,
            period,
        }
    }
}

/// Broadcast stop signal shared by every generator.
///
/// Triggering the signal, or dropping it, wakes every [`StopListener`]. No
/// acknowledgment is collected from listeners.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Create a new listener for this signal.
    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal every listener to stop. Calling this more than once is harmless.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Check whether the stop signal has been triggered.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal is triggered or its sender is dropped.
    pub async fn stopped(&mut self) {
        // A dropped sender counts as a stop request.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Simulated sensor producing uniformly distributed readings on a fixed period.
#[derive(Debug, Clone)]
pub struct Generator {
    config: GeneratorConfig,
}

impl Generator {
    /// Create a new generator.
    ///
    /// The caller guarantees `min <= max` and a non-zero period.
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// Sample a single reading from the configured range.
    pub fn sample(&self) -> Reading {
        let t: f64 = rand::thread_rng().gen();
        let value = sample_between(self.config.min, self.config.max, t);
        Reading::new(&self.config.name, &self.config.unit, value)
    }

    /// Spawn the generator task.
    ///
    /// The first reading is emitted one period after the call. Sends block while
    /// the channel is full; missed ticks are skipped rather than replayed. The
    /// task exits when `stop` fires or when the receiving side is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or with a zero period.
    pub fn start(self, out: mpsc::Sender<Reading>, stop: StopListener) -> JoinHandle<()> {
        tokio::spawn(self.run(out, stop))
    }

    async fn run(self, out: mpsc::Sender<Reading>, mut stop: StopListener) {
        let period = self.config.period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut emitted: u64 = 0;
        debug!(
            sensor = %self.config.name,
            period_ms = period.as_millis() as u64,
            "Generator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = ticker.tick() => {}
            }

            let reading = self.sample();

            // A stop request also interrupts a send blocked on back-pressure.
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                sent = out.send(reading) => {
                    if sent.is_err() {
                        debug!(sensor = %self.config.name, "Reading channel closed, generator stopping");
                        break;
                    }
                    emitted += 1;
                }
            }
        }

        debug!(sensor = %self.config.name, emitted, "Generator stopped");
    }
}

/// Interpolate between `min` and `max` for `t` in `[0, 1]`.
///
/// Never forms `max - min`, which overflows for ranges wider than `f64::MAX`.
fn sample_between(min: f64, max: f64, t: f64) -> f64 {
    (min * (1.0 - t) + max * t).max(min).min(max)
}
