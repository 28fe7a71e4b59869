//! Batch editing of SPICE netlists and bounded-parallelism simulation runs.

pub mod circuit;
pub mod config;
pub mod document;
pub mod error;
pub mod output;
pub mod sim;
pub mod stats;
pub mod sweep;
pub mod syntax;
pub mod tolerance;
pub mod units;

pub use circuit::{CircuitNode, ComponentInfo, ComponentValue};
pub use config::BatchConfig;
pub use document::{CircuitDocument, EditorConfig};
pub use error::{Result, SpiceBatchError};
pub use sim::{SimStepper, TaskScheduler};
pub use tolerance::{Deviation, Distribution, ToleranceBench};
