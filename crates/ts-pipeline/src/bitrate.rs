use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use ts::clock::{PKT_SIZE, SYSTEM_CLOCK_FREQ};
use ts::{Pid, TsPacket};

/// Per-PID PCR progression.
#[derive(Debug, Default, Clone, Copy)]
struct PcrPidState {
    first_pcr: u64,
    first_index: u64,
    last_pcr: u64,
    last_index: u64,
    pcr_count: u64,
}

/// Estimates the TS bitrate from PCR progression on any PID.
///
/// The bitrate between two PCRs is the number of transmitted bits divided
/// by the elapsed 27 MHz clock time. A PCR going backwards (wrap or
/// discontinuity) restarts the measurement on that PID.
#[derive(Debug, Default)]
pub struct PcrAnalyzer {
    pids: HashMap<Pid, PcrPidState>,
    packet_index: u64,
}

impl PcrAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, pkt: &TsPacket) {
        let index = self.packet_index;
        self.packet_index += 1;
        let Some(pcr) = pkt.pcr() else {
            return;
        };
        let state = self.pids.entry(pkt.pid()).or_default();
        if state.pcr_count == 0 || pcr <= state.last_pcr {
            *state = PcrPidState {
                first_pcr: pcr,
                first_index: index,
                last_pcr: pcr,
                last_index: index,
                pcr_count: 1,
            };
        } else {
            state.last_pcr = pcr;
            state.last_index = index;
            state.pcr_count += 1;
        }
    }

    /// Current estimate in b/s, 0 while not enough PCRs were seen.
    pub fn bitrate(&self) -> u64 {
        let best = self
            .pids
            .values()
            .filter(|s| s.pcr_count >= 2)
            .max_by_key(|s| s.pcr_count);
        let Some(state) = best else {
            return 0;
        };
        let packets = state.last_index - state.first_index;
        let clocks = state.last_pcr - state.first_pcr;
        if clocks == 0 {
            return 0;
        }
        let bits = packets as u128 * (PKT_SIZE as u128 * 8) * SYSTEM_CLOCK_FREQ as u128;
        (bits / clocks as u128) as u64
    }

    pub fn reset(&mut self) {
        self.pids.clear();
        self.packet_index = 0;
    }
}

struct ControllerState {
    input_bitrate: u64,
    analyzer: PcrAnalyzer,
    current: u64,
    last_eval: Option<Instant>,
}

/// Pipeline-wide effective bitrate.
///
/// Precedence: a configured override, then the bitrate reported by the
/// input stage, then PCR analysis over the input flow. The value is
/// re-evaluated at a fixed interval and on demand.
pub struct BitrateController {
    override_bitrate: u64,
    adjust_interval: Duration,
    state: Mutex<ControllerState>,
}

impl BitrateController {
    pub fn new(override_bitrate: u64, adjust_interval: Duration) -> Self {
        BitrateController {
            override_bitrate,
            adjust_interval,
            state: Mutex::new(ControllerState {
                input_bitrate: 0,
                analyzer: PcrAnalyzer::new(),
                current: override_bitrate,
                last_eval: None,
            }),
        }
    }

    /// Feed one input packet to the PCR analyzer.
    pub fn feed(&self, pkt: &TsPacket) {
        if self.override_bitrate == 0 {
            self.state.lock().analyzer.feed(pkt);
        }
    }

    /// Record the bitrate reported by the input stage (0 = unknown).
    pub fn report_input(&self, bitrate: u64) {
        if bitrate != 0 {
            self.state.lock().input_bitrate = bitrate;
        }
    }

    /// Current effective bitrate in b/s (0 = unknown).
    pub fn current(&self) -> u64 {
        if self.override_bitrate != 0 {
            return self.override_bitrate;
        }
        let mut state = self.state.lock();
        let due = state
            .last_eval
            .is_none_or(|at| at.elapsed() >= self.adjust_interval);
        if due {
            Self::evaluate(&mut state);
        }
        state.current
    }

    /// Re-evaluate immediately (a stage reported `bitrate_changed`).
    pub fn refresh(&self) -> u64 {
        if self.override_bitrate != 0 {
            return self.override_bitrate;
        }
        let mut state = self.state.lock();
        Self::evaluate(&mut state);
        state.current
    }

    fn evaluate(state: &mut ControllerState) {
        let previous = state.current;
        state.current = if state.input_bitrate != 0 {
            state.input_bitrate
        } else {
            state.analyzer.bitrate()
        };
        state.last_eval = Some(Instant::now());
        if state.current != previous {
            debug!(bitrate = state.current, "TS bitrate adjusted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts::packet::test_support::{payload_packet, pcr_packet};

    /// Feed packets at a synthetic 38 Mb/s: one PCR every 100 packets, the
    /// PCR advancing by the transmission time of 100 packets.
    fn feed_constant_rate(analyzer: &mut PcrAnalyzer, bitrate: u64, pcr_count: u32) {
        let clocks_per_100_pkts = 100 * PKT_SIZE as u64 * 8 * SYSTEM_CLOCK_FREQ / bitrate;
        let mut pcr = 1_000_000;
        for _ in 0..pcr_count {
            analyzer.feed(&pcr_packet(0x100, pcr));
            for _ in 0..99 {
                analyzer.feed(&payload_packet(0x101, 0));
            }
            pcr += clocks_per_100_pkts;
        }
    }

    #[test]
    fn test_analyzer_needs_two_pcrs() {
        let mut analyzer = PcrAnalyzer::new();
        analyzer.feed(&pcr_packet(0x100, 500));
        assert_eq!(analyzer.bitrate(), 0);
    }

    #[test]
    fn test_analyzer_constant_rate() {
        let mut analyzer = PcrAnalyzer::new();
        feed_constant_rate(&mut analyzer, 38_000_000, 10);
        let estimate = analyzer.bitrate();
        assert!((37_900_000..=38_100_000).contains(&estimate), "{estimate}");
    }

    #[test]
    fn test_analyzer_resets_on_backward_pcr() {
        let mut analyzer = PcrAnalyzer::new();
        analyzer.feed(&pcr_packet(0x100, 1_000_000));
        analyzer.feed(&pcr_packet(0x100, 2_000_000));
        assert!(analyzer.bitrate() > 0);
        // Discontinuity: PCR jumps backwards
        analyzer.feed(&pcr_packet(0x100, 10));
        assert_eq!(analyzer.bitrate(), 0);
    }

    #[test]
    fn test_controller_precedence() {
        let ctrl = BitrateController::new(10_000_000, Duration::from_millis(0));
        ctrl.report_input(20_000_000);
        assert_eq!(ctrl.current(), 10_000_000);

        let ctrl = BitrateController::new(0, Duration::from_millis(0));
        ctrl.report_input(20_000_000);
        assert_eq!(ctrl.current(), 20_000_000);
    }

    #[test]
    fn test_controller_falls_back_to_analysis() {
        let ctrl = BitrateController::new(0, Duration::from_millis(0));
        let clocks = 100 * PKT_SIZE as u64 * 8 * SYSTEM_CLOCK_FREQ / 38_000_000;
        let mut pcr = 1_000_000;
        for _ in 0..5 {
            ctrl.feed(&pcr_packet(0x100, pcr));
            for _ in 0..99 {
                ctrl.feed(&payload_packet(0x101, 0));
            }
            pcr += clocks;
        }
        let estimate = ctrl.refresh();
        assert!((37_900_000..=38_100_000).contains(&estimate), "{estimate}");
    }
}
