//! Staged transport stream processing pipeline runtime.
//!
//! A pipeline is an input stage, zero or more packet processors and an
//! output stage, each running on its own thread and connected by bounded
//! packet queues. Packets flow strictly in order; a stage blocks when its
//! upstream queue is empty or its downstream queue is full. The runtime
//! also provides input stuffing, pipeline-wide bitrate discovery,
//! joint-termination voting and cooperative cancellation.

pub mod bitrate;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod monitor;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod stuffing;
pub mod test_utils;

mod error;

pub use cancellation::CancellationToken;
pub use config::{PipelineConfig, Realtime};
pub use context::StageHandle;
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineSummary};
pub use processor::{PacketFeedback, PacketInput, PacketOutput, PacketProcessor, PacketStatus};
pub use queue::PacketQueue;
pub use stuffing::StuffingConfig;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
