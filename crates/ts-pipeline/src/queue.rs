use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ts::TsPacket;

use crate::cancellation::CancellationToken;

/// How long a blocked producer sleeps before rechecking the token.
const PUSH_RECHECK: Duration = Duration::from_millis(100);

struct QueueState {
    packets: VecDeque<TsPacket>,
    /// Producer reported end of flow; consumers drain what is left.
    eof: bool,
    /// Hard stop; both ends give up immediately, buffered packets are lost.
    stopped: bool,
}

/// Bounded packet queue between two pipeline stages.
///
/// One producer stage, one consumer stage. The producer blocks when the
/// queue is full, the consumer when it is empty. `set_eof` ends the flow
/// gracefully (the consumer drains); `stop` tears it down immediately.
pub struct PacketQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    token: CancellationToken,
}

impl PacketQueue {
    pub fn new(capacity: usize, token: CancellationToken) -> Self {
        PacketQueue {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                packets: VecDeque::with_capacity(capacity.max(1)),
                eof: false,
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            token,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().packets.is_empty()
    }

    /// Move every packet of `batch` into the queue, blocking on a full
    /// queue. Returns false when the queue was stopped or the pipeline
    /// cancelled; `batch` may then still hold the unsent tail.
    pub fn push(&self, batch: &mut Vec<TsPacket>) -> bool {
        let mut sent = 0;
        let mut state = self.state.lock();
        while sent < batch.len() {
            if state.stopped {
                batch.drain(..sent);
                return false;
            }
            if state.packets.len() >= self.capacity {
                if self.token.is_cancelled() {
                    batch.drain(..sent);
                    return false;
                }
                let _ = self.not_full.wait_for(&mut state, PUSH_RECHECK);
                continue;
            }
            let room = self.capacity - state.packets.len();
            let take = room.min(batch.len() - sent);
            state.packets.extend(batch[sent..sent + take].iter().copied());
            sent += take;
            self.not_empty.notify_one();
        }
        batch.clear();
        true
    }

    /// Move up to `max` packets into `out`, blocking until at least one is
    /// available. Returns false when the flow is over (EOF with an empty
    /// queue, or a hard stop).
    pub fn pop(&self, out: &mut Vec<TsPacket>, max: usize) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            if !state.packets.is_empty() {
                let take = state.packets.len().min(max.max(1));
                out.extend(state.packets.drain(..take));
                self.not_full.notify_one();
                return true;
            }
            if state.eof {
                return false;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Producer is done; consumers drain the rest and then see end of flow.
    pub fn set_eof(&self) {
        let mut state = self.state.lock();
        state.eof = true;
        self.not_empty.notify_all();
    }

    /// Hard stop: wake both ends, discard buffered packets on next access.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ts::packet::test_support::payload_packet;

    fn queue(capacity: usize) -> Arc<PacketQueue> {
        Arc::new(PacketQueue::new(capacity, CancellationToken::new()))
    }

    #[test]
    fn test_push_pop_order() {
        let q = queue(16);
        let mut batch: Vec<TsPacket> = (0..5).map(|i| payload_packet(0x100, i)).collect();
        assert!(q.push(&mut batch));
        assert!(batch.is_empty());

        let mut out = Vec::new();
        assert!(q.pop(&mut out, 3));
        assert_eq!(out.len(), 3);
        assert!(q.pop(&mut out, 10));
        assert_eq!(out.len(), 5);
        for (i, pkt) in out.iter().enumerate() {
            assert_eq!(pkt.cc(), i as u8);
        }
    }

    #[test]
    fn test_eof_drains_then_ends() {
        let q = queue(16);
        let mut batch = vec![TsPacket::null()];
        q.push(&mut batch);
        q.set_eof();

        let mut out = Vec::new();
        assert!(q.pop(&mut out, 10));
        assert_eq!(out.len(), 1);
        assert!(!q.pop(&mut out, 10));
    }

    #[test]
    fn test_backpressure_blocks_until_consumed() {
        let q = queue(2);
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut batch: Vec<TsPacket> =
                    (0..10).map(|i| payload_packet(0x10, i % 16)).collect();
                q.push(&mut batch)
            })
        };
        let mut out = Vec::new();
        let mut total = 0;
        while total < 10 {
            let mut chunk = Vec::new();
            assert!(q.pop(&mut chunk, 2));
            total += chunk.len();
            out.extend(chunk);
        }
        assert!(producer.join().unwrap());
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_stop_wakes_blocked_producer() {
        let q = queue(1);
        let mut first = vec![TsPacket::null()];
        q.push(&mut first);
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut batch = vec![TsPacket::null(), TsPacket::null()];
                q.push(&mut batch)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        q.stop();
        assert!(!producer.join().unwrap());
        let mut out = Vec::new();
        assert!(!q.pop(&mut out, 10));
    }

    #[test]
    fn test_cancelled_token_unblocks_producer() {
        let token = CancellationToken::new();
        let q = Arc::new(PacketQueue::new(1, token.clone()));
        let mut first = vec![TsPacket::null()];
        q.push(&mut first);
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut batch = vec![TsPacket::null()];
                q.push(&mut batch)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(!producer.join().unwrap());
    }
}
