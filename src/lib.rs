//! Sayl load-generation engine.
//!
//! Drives a configurable request rate against one or more HTTP endpoints for
//! a bounded duration, walking templated scenario steps, collecting HDR
//! latency statistics per second, evaluating response assertions, and
//! stopping early when a circuit breaker condition trips.

pub mod assertions;
pub mod breaker;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod feeder;
pub mod report;
pub mod scheduler;
pub mod stats;
pub mod template;
pub mod variables;

// Re-export commonly used types
pub use breaker::CircuitBreaker;
pub use config::{load_config, Config, DataSource, Stage, Step};
pub use engine::{Engine, RetryConfig};
pub use error::{Result, SaylError};
pub use feeder::CsvFeeder;
pub use report::{write_json_report, Report, SecondStats};
pub use scheduler::RateScheduler;
pub use stats::{Monitor, RequestResult};
pub use template::CompiledTemplate;
pub use variables::VariableProcessor;
