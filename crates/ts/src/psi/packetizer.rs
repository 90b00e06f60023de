use crate::clock::PKT_SIZE;
use crate::packet::{SYNC_BYTE, TsPacket};
use crate::pid::Pid;
use crate::psi::section::Section;

/// Payload capacity of a section-bearing packet (header excluded).
const PAYLOAD_SIZE: usize = PKT_SIZE - 4;

/// Packetize one section into TS packets, stuffing the tail with 0xFF.
///
/// The first packet carries payload_unit_start with a zero pointer field;
/// continuation packets carry the remaining bytes. Continuity counters start
/// at `first_cc`.
pub fn packetize_section(section: &Section, pid: Pid, first_cc: u8) -> Vec<TsPacket> {
    packetize_raw(section.as_bytes(), pid, first_cc)
}

/// Packetize raw section bytes (long or short form) the same way.
pub fn packetize_raw(data: &[u8], pid: Pid, first_cc: u8) -> Vec<TsPacket> {
    let mut packets = Vec::with_capacity(1 + data.len() / PAYLOAD_SIZE);
    let mut offset = 0;
    let mut cc = first_cc & 0x0F;

    while offset < data.len() {
        let first = offset == 0;
        let mut b = [0xFF_u8; PKT_SIZE];
        b[0] = SYNC_BYTE;
        b[1] = ((pid >> 8) as u8 & 0x1F) | if first { 0x40 } else { 0 };
        b[2] = (pid & 0xFF) as u8;
        b[3] = 0x10 | cc;
        cc = (cc + 1) & 0x0F;

        let mut pos = 4;
        if first {
            b[pos] = 0; // pointer field
            pos += 1;
        }
        let take = (data.len() - offset).min(PKT_SIZE - pos);
        b[pos..pos + take].copy_from_slice(&data[offset..offset + take]);
        offset += take;

        packets.push(TsPacket::from_bytes(&b).expect("sync byte set above"));
    }
    packets
}

/// Continuously re-emits a table's sections on a fixed PID.
///
/// Used to replace every packet of a rewritten PID (typically the PMT) with
/// the current version of the table. Each section starts in a fresh packet;
/// tails are stuffed. The packetizer cycles forever over its section list.
pub struct CyclingPacketizer {
    pid: Pid,
    sections: Vec<Section>,
    packets: Vec<TsPacket>,
    next: usize,
    cc: u8,
}

impl CyclingPacketizer {
    pub fn new(pid: Pid) -> Self {
        CyclingPacketizer {
            pid,
            sections: Vec::new(),
            packets: Vec::new(),
            next: 0,
            cc: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
        self.repacketize();
    }

    /// Replace the whole section list.
    pub fn set_sections(&mut self, sections: Vec<Section>) {
        self.sections = sections;
        self.repacketize();
    }

    pub fn has_sections(&self) -> bool {
        !self.sections.is_empty()
    }

    fn repacketize(&mut self) {
        self.packets.clear();
        self.next = 0;
        for section in &self.sections {
            self.packets.extend(packetize_section(section, self.pid, 0));
        }
    }

    /// Next packet of the cycle, with a live continuity counter.
    ///
    /// Returns a null packet while no sections are loaded.
    pub fn next_packet(&mut self) -> TsPacket {
        if self.packets.is_empty() {
            return TsPacket::null();
        }
        let mut pkt = self.packets[self.next];
        self.next = (self.next + 1) % self.packets.len();
        pkt.set_cc(self.cc);
        self.cc = (self.cc + 1) & 0x0F;
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_small_section() {
        let section = Section::build(0x02, 1, 0, 0, 0, &[0x11; 20]).unwrap();
        let packets = packetize_section(&section, 0x0321, 7);
        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(pkt.pid(), 0x0321);
        assert!(pkt.payload_unit_start());
        assert_eq!(pkt.cc(), 7);
        assert_eq!(pkt.payload()[0], 0); // pointer field
        assert_eq!(&pkt.payload()[1..1 + section.len()], section.as_bytes());
        // Tail is stuffed
        assert!(pkt.payload()[1 + section.len()..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_one_shot_continuation_packets() {
        let section = Section::build(0x02, 1, 0, 0, 0, &[0x22; 400]).unwrap();
        let packets = packetize_section(&section, 0x0100, 0);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].payload_unit_start());
        assert!(!packets[1].payload_unit_start());
        assert_eq!(packets[1].cc(), 1);
        assert_eq!(packets[2].cc(), 2);
    }

    #[test]
    fn test_cycling_packetizer_cc_and_cycle() {
        let section = Section::build(0x02, 1, 0, 0, 0, &[0x33; 20]).unwrap();
        let mut pzer = CyclingPacketizer::new(0x0065);
        assert!(pzer.next_packet().is_null());

        pzer.set_sections(vec![section]);
        let a = pzer.next_packet();
        let b = pzer.next_packet();
        assert_eq!(a.pid(), 0x0065);
        assert_eq!(a.cc(), 0);
        assert_eq!(b.cc(), 1);
        // Single-packet table: same payload repeats with advancing CC
        assert_eq!(a.payload(), b.payload());
    }
}
