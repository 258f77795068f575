//! Sensor Pipeline Library
//!
//! This library simulates periodic sensors, batches their readings and writes
//! summary statistics to a line-bounded rotating log:
//!
//! - **config**: TOML configuration with environment overrides and validation
//! - **generator**: Simulated sensors emitting readings on their own period
//! - **aggregator**: Mean/min/max statistics over a batch of values
//! - **sink**: Append-only log that rotates to a new file every N lines
//! - **pipeline**: Coordinator merging readings, batching, and shutting down
//!
//! # Example
//!
//! ```no_run
//! use sensor_pipeline::config::Config;
//! use sensor_pipeline::pipeline;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::load("config.toml").expect("Failed to load config");
//!
//!     // Run until Ctrl+C, then stop generators and close the log
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     let stats = pipeline::run(&config, shutdown).await.expect("Pipeline failed");
//!     println!("{} batches written", stats.batches_flushed);
//! }
//! ```

// Module declarations
pub mod aggregator;
pub mod config;
pub mod generator;
pub mod pipeline;
pub mod sink;

// Re-export commonly used types at crate root for convenience
pub use aggregator::{aggregate, Stats};
pub use config::{Config, ConfigError};
pub use generator::{Generator, GeneratorConfig, Reading, StopListener, StopSignal};
pub use pipeline::{BatchMode, Coordinator, PipelineError, PipelineStats};
pub use sink::{RotatingSink, SinkConfig, SinkError};
