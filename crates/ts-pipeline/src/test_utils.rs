//! Helpers for driving plugins outside a running pipeline in tests.

use std::sync::Arc;
use std::time::Duration;

use crate::bitrate::BitrateController;
use crate::cancellation::CancellationToken;
use crate::context::{JointBallot, PipelineShared, StageHandle};

/// Build a standalone stage handle with a fixed TS bitrate.
///
/// The handle belongs to a synthetic four-stage pipeline; joint-termination
/// votes resolve only if every registered stage votes, as in a real run.
pub fn create_test_handle(bitrate: u64) -> StageHandle {
    create_named_test_handle(bitrate, "test-stage")
}

/// Same as [`create_test_handle`] with an explicit stage name.
pub fn create_named_test_handle(bitrate: u64, name: &'static str) -> StageHandle {
    build_handle(bitrate, false, name)
}

/// A handle reporting realtime mode (plugins pick realtime defaults).
pub fn create_realtime_test_handle(bitrate: u64) -> StageHandle {
    build_handle(bitrate, true, "test-stage")
}

fn build_handle(bitrate: u64, realtime: bool, name: &'static str) -> StageHandle {
    let shared = Arc::new(PipelineShared {
        name: "test".to_string(),
        realtime,
        token: CancellationToken::new(),
        bitrate: BitrateController::new(bitrate, Duration::from_secs(5)),
        ballot: JointBallot::new(4, false),
    });
    StageHandle::new(shared, 1, name)
}
