use ts::{NULL_PACKET, TsPacket};

/// Input stuffing parameters.
///
/// `nullpkt`/`inpkt` interleave null packets into the input flow;
/// `start`/`stop` prepend and append fixed runs of null packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct StuffingConfig {
    /// Null packets before the first input packet.
    pub start: usize,
    /// Null packets after the last input packet.
    pub stop: usize,
    /// Null packets inserted per interval.
    pub nullpkt: usize,
    /// Interval length in input packets (0 disables interleaving).
    pub inpkt: usize,
}

impl StuffingConfig {
    pub fn is_active(&self) -> bool {
        self.start > 0 || self.stop > 0 || (self.nullpkt > 0 && self.inpkt > 0)
    }
}

/// Applies input stuffing to batches of input packets.
pub struct StuffingInjector {
    config: StuffingConfig,
    started: bool,
    since_insert: usize,
}

impl StuffingInjector {
    pub fn new(config: StuffingConfig) -> Self {
        StuffingInjector {
            config,
            started: false,
            since_insert: 0,
        }
    }

    /// Append `count` input packets from `input` into `out`, interleaving
    /// stuffing as configured.
    pub fn apply(&mut self, input: &[TsPacket], out: &mut Vec<TsPacket>) {
        if !self.started {
            self.started = true;
            out.extend(std::iter::repeat_n(NULL_PACKET, self.config.start));
        }
        if self.config.inpkt == 0 || self.config.nullpkt == 0 {
            out.extend_from_slice(input);
            return;
        }
        for pkt in input {
            out.push(*pkt);
            self.since_insert += 1;
            if self.since_insert == self.config.inpkt {
                out.extend(std::iter::repeat_n(NULL_PACKET, self.config.nullpkt));
                self.since_insert = 0;
            }
        }
    }

    /// Trailing stuffing emitted at end of input.
    pub fn trailing(&mut self) -> Vec<TsPacket> {
        let count = if self.started || self.config.start == 0 {
            self.config.stop
        } else {
            // Empty input still gets the start/stop runs
            self.config.start + self.config.stop
        };
        vec![NULL_PACKET; count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts::packet::test_support::payload_packet;

    fn run(config: StuffingConfig, batches: &[usize]) -> Vec<TsPacket> {
        let mut injector = StuffingInjector::new(config);
        let mut out = Vec::new();
        for &count in batches {
            let input: Vec<TsPacket> = (0..count).map(|_| payload_packet(0x100, 0)).collect();
            injector.apply(&input, &mut out);
        }
        out.extend(injector.trailing());
        out
    }

    fn null_count(packets: &[TsPacket]) -> usize {
        packets.iter().filter(|p| p.is_null()).count()
    }

    #[test]
    fn test_no_stuffing_is_identity() {
        let out = run(StuffingConfig::default(), &[10]);
        assert_eq!(out.len(), 10);
        assert_eq!(null_count(&out), 0);
    }

    #[test]
    fn test_start_and_stop_runs() {
        let config = StuffingConfig {
            start: 3,
            stop: 2,
            ..Default::default()
        };
        let out = run(config, &[5]);
        assert_eq!(out.len(), 10);
        assert!(out[..3].iter().all(|p| p.is_null()));
        assert!(out[8..].iter().all(|p| p.is_null()));
    }

    #[test]
    fn test_interleave_across_batches() {
        // 2 nulls every 4 input packets, 10 inputs split over two batches
        let config = StuffingConfig {
            nullpkt: 2,
            inpkt: 4,
            ..Default::default()
        };
        let out = run(config, &[6, 4]);
        // 10 inputs + 2 insertions of 2 nulls
        assert_eq!(out.len(), 14);
        assert_eq!(null_count(&out), 4);
        assert!(out[4].is_null() && out[5].is_null());
        assert!(out[10].is_null() && out[11].is_null());
    }
}
