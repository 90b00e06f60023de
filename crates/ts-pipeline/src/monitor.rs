use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::cancellation::CancellationToken;
use crate::queue::PacketQueue;

/// Spawn the resource monitor thread.
///
/// Logs the occupancy of every inter-stage queue at a fixed period until
/// the token is cancelled.
pub fn spawn(
    token: CancellationToken,
    queues: Vec<Arc<PacketQueue>>,
    interval: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("tsp-monitor".to_string())
        .spawn(move || {
            let step = Duration::from_millis(200).min(interval);
            let mut elapsed = Duration::ZERO;
            while !token.is_cancelled() {
                std::thread::sleep(step);
                elapsed += step;
                if elapsed < interval {
                    continue;
                }
                elapsed = Duration::ZERO;
                let occupancy: Vec<String> = queues
                    .iter()
                    .map(|q| format!("{}/{}", q.len(), q.capacity()))
                    .collect();
                info!(buffers = occupancy.join(" "), "pipeline buffers");
            }
        })
}
