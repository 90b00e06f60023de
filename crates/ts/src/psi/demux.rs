use bytes::Bytes;
use tracing::trace;

use crate::packet::TsPacket;
use crate::pid::{Pid, PidSet};
use crate::psi::section::{MAX_SECTION_SIZE, Section};

/// Per-PID section reassembly state.
#[derive(Default)]
struct PidState {
    /// Bytes of the section currently being assembled.
    buffer: Vec<u8>,
    /// Continuity counter of the last packet consumed on this PID.
    last_cc: Option<u8>,
}

/// Reassembles PSI sections from TS packets on a set of filtered PIDs.
///
/// Handles the pointer field on payload-unit-start packets, multi-packet
/// sections and multiple sections per packet. Sections with an invalid CRC
/// are dropped silently; a continuity break discards the partial section.
pub struct SectionDemux {
    pids: PidSet,
    states: Vec<PidState>,
}

impl SectionDemux {
    pub fn new() -> Self {
        SectionDemux {
            pids: PidSet::new(),
            states: Vec::new(),
        }
    }

    /// Add a PID to the filter.
    pub fn add_pid(&mut self, pid: Pid) {
        self.pids.set(pid);
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.pids.clear(pid);
    }

    pub fn has_pid(&self, pid: Pid) -> bool {
        self.pids.test(pid)
    }

    /// Feed one packet; completed sections on filtered PIDs are appended to
    /// `out`.
    pub fn feed(&mut self, pkt: &TsPacket, out: &mut Vec<(Pid, Section)>) {
        let pid = pkt.pid();
        if !self.pids.test(pid) || !pkt.has_payload() {
            return;
        }
        let payload = pkt.payload();
        if payload.is_empty() {
            return;
        }

        if self.states.len() <= pid as usize {
            self.states.resize_with(pid as usize + 1, PidState::default);
        }
        let state = &mut self.states[pid as usize];

        // Continuity break discards any partial section.
        if let Some(last) = state.last_cc
            && pkt.cc() != (last + 1) & 0x0F
            && !state.buffer.is_empty()
        {
            trace!(pid, "continuity break, dropping partial section");
            state.buffer.clear();
        }
        state.last_cc = Some(pkt.cc());

        let mut data = payload;
        if pkt.payload_unit_start() {
            let pointer = data[0] as usize;
            if 1 + pointer > data.len() {
                state.buffer.clear();
                return;
            }
            // Bytes before the pointer target complete the previous section.
            if !state.buffer.is_empty() {
                state.buffer.extend_from_slice(&data[1..1 + pointer]);
                Self::try_complete(pid, &mut state.buffer, out);
            }
            state.buffer.clear();
            data = &data[1 + pointer..];
        } else if state.buffer.is_empty() {
            // Continuation of a section we never saw the start of.
            return;
        }

        state.buffer.extend_from_slice(data);
        Self::try_complete(pid, &mut state.buffer, out);
    }

    /// Extract every complete section from the front of `buffer`.
    fn try_complete(pid: Pid, buffer: &mut Vec<u8>, out: &mut Vec<(Pid, Section)>) {
        loop {
            if buffer.first() == Some(&0xFF) {
                // Stuffing to end of packet
                buffer.clear();
                return;
            }
            if buffer.len() < 3 {
                return;
            }
            let total = 3 + (u16::from_be_bytes([buffer[1] & 0x0F, buffer[2]]) as usize);
            if total > MAX_SECTION_SIZE {
                buffer.clear();
                return;
            }
            if buffer.len() < total {
                return;
            }
            let raw: Vec<u8> = buffer.drain(..total).collect();
            match Section::parse(Bytes::from(raw)) {
                Ok(section) => out.push((pid, section)),
                Err(err) => trace!(pid, %err, "dropping bad section"),
            }
        }
    }
}

impl Default for SectionDemux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::packetizer::packetize_section;

    #[test]
    fn test_single_packet_section() {
        let section = Section::build(0x00, 0x0001, 0, 0, 0, &[0xAB; 16]).unwrap();
        let packets = packetize_section(&section, 0x0000, 0);

        let mut demux = SectionDemux::new();
        demux.add_pid(0x0000);
        let mut out = Vec::new();
        for pkt in &packets {
            demux.feed(pkt, &mut out);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, section);
    }

    #[test]
    fn test_multi_packet_section() {
        let section = Section::build(0x02, 0x0064, 1, 0, 0, &[0x55; 600]).unwrap();
        let packets = packetize_section(&section, 0x0100, 4);
        assert!(packets.len() > 1);

        let mut demux = SectionDemux::new();
        demux.add_pid(0x0100);
        let mut out = Vec::new();
        for pkt in &packets {
            demux.feed(pkt, &mut out);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, section);
    }

    #[test]
    fn test_unfiltered_pid_ignored() {
        let section = Section::build(0x00, 0x0001, 0, 0, 0, &[0x00; 8]).unwrap();
        let packets = packetize_section(&section, 0x0200, 0);

        let mut demux = SectionDemux::new();
        demux.add_pid(0x0100);
        let mut out = Vec::new();
        for pkt in &packets {
            demux.feed(pkt, &mut out);
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_continuity_break_drops_partial() {
        let section = Section::build(0x02, 0x0064, 1, 0, 0, &[0x55; 600]).unwrap();
        let packets = packetize_section(&section, 0x0100, 0);
        assert!(packets.len() >= 3);

        let mut demux = SectionDemux::new();
        demux.add_pid(0x0100);
        let mut out = Vec::new();
        demux.feed(&packets[0], &mut out);
        // Skip the middle packet: continuity breaks, section never completes.
        demux.feed(&packets[2], &mut out);
        assert!(out.is_empty());
    }
}
