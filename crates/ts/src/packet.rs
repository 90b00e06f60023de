use crate::clock::{PKT_SIZE, SYSTEM_CLOCK_SUBFACTOR};
use crate::pes;
use crate::pid::{PID_NULL, Pid};
use crate::{Result, TsError};

/// The TS sync byte, first byte of every packet.
pub const SYNC_BYTE: u8 = 0x47;

/// A stuffing packet: PID 0x1FFF, payload filled with 0xFF.
pub const NULL_PACKET: TsPacket = TsPacket::null();

/// A 188-byte Transport Stream packet.
///
/// The packet is a plain byte array; all header fields are read and written
/// in place. Processors mutate packets directly in the pipeline buffer.
#[derive(Clone, Copy)]
pub struct TsPacket {
    b: [u8; PKT_SIZE],
}

impl TsPacket {
    /// The canonical null packet (PID 0x1FFF, no adaptation field).
    pub const fn null() -> Self {
        let mut b = [0xFF_u8; PKT_SIZE];
        b[0] = SYNC_BYTE;
        b[1] = 0x1F;
        b[2] = 0xFF;
        b[3] = 0x10; // payload only, continuity counter 0
        TsPacket { b }
    }

    /// Build a packet from a 188-byte slice. The sync byte is checked.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != PKT_SIZE {
            return Err(TsError::InvalidPacketSize(data.len()));
        }
        if data[0] != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(data[0]));
        }
        let mut b = [0u8; PKT_SIZE];
        b.copy_from_slice(data);
        Ok(TsPacket { b })
    }

    /// Raw packet bytes.
    pub fn as_bytes(&self) -> &[u8; PKT_SIZE] {
        &self.b
    }

    /// Raw packet bytes, mutable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PKT_SIZE] {
        &mut self.b
    }

    /// Replace this packet with a null packet in place.
    pub fn make_null(&mut self) {
        *self = NULL_PACKET;
    }

    pub fn sync_ok(&self) -> bool {
        self.b[0] == SYNC_BYTE
    }

    pub fn pid(&self) -> Pid {
        ((self.b[1] as u16 & 0x1F) << 8) | self.b[2] as u16
    }

    pub fn set_pid(&mut self, pid: Pid) {
        self.b[1] = (self.b[1] & 0xE0) | ((pid >> 8) as u8 & 0x1F);
        self.b[2] = (pid & 0xFF) as u8;
    }

    pub fn is_null(&self) -> bool {
        self.pid() == PID_NULL
    }

    pub fn transport_error(&self) -> bool {
        self.b[1] & 0x80 != 0
    }

    pub fn payload_unit_start(&self) -> bool {
        self.b[1] & 0x40 != 0
    }

    pub fn set_payload_unit_start(&mut self, on: bool) {
        if on {
            self.b[1] |= 0x40;
        } else {
            self.b[1] &= !0x40;
        }
    }

    /// 4-bit continuity counter.
    pub fn cc(&self) -> u8 {
        self.b[3] & 0x0F
    }

    pub fn set_cc(&mut self, cc: u8) {
        self.b[3] = (self.b[3] & 0xF0) | (cc & 0x0F);
    }

    /// 2-bit transport_scrambling_control field.
    pub fn scrambling_control(&self) -> u8 {
        (self.b[3] >> 6) & 0x03
    }

    pub fn set_scrambling_control(&mut self, sc: u8) {
        self.b[3] = (self.b[3] & 0x3F) | ((sc & 0x03) << 6);
    }

    /// A packet is scrambled when its scrambling control field is non-zero.
    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control() != 0
    }

    /// 2-bit adaptation_field_control field.
    pub fn adaptation_field_control(&self) -> u8 {
        (self.b[3] >> 4) & 0x03
    }

    pub fn has_payload(&self) -> bool {
        self.b[3] & 0x10 != 0
    }

    pub fn has_adaptation_field(&self) -> bool {
        self.b[3] & 0x20 != 0
    }

    /// Length of the adaptation field body (excluding the length byte).
    fn adaptation_field_len(&self) -> usize {
        if self.has_adaptation_field() {
            self.b[4] as usize
        } else {
            0
        }
    }

    /// Offset of the payload within the packet, if any.
    pub fn payload_offset(&self) -> Option<usize> {
        if !self.has_payload() {
            return None;
        }
        let offset = if self.has_adaptation_field() {
            5 + self.adaptation_field_len()
        } else {
            4
        };
        (offset < PKT_SIZE).then_some(offset)
    }

    pub fn payload(&self) -> &[u8] {
        match self.payload_offset() {
            Some(offset) => &self.b[offset..],
            None => &[],
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self.payload_offset() {
            Some(offset) => &mut self.b[offset..],
            None => &mut [],
        }
    }

    /// Adaptation field body, if present and well-formed.
    fn adaptation_field(&self) -> Option<&[u8]> {
        if !self.has_adaptation_field() {
            return None;
        }
        let len = self.b[4] as usize;
        (len > 0 && 5 + len <= PKT_SIZE).then(|| &self.b[5..5 + len])
    }

    pub fn has_pcr(&self) -> bool {
        self.pcr().is_some()
    }

    /// 42-bit PCR at 27 MHz (base × 300 + extension).
    pub fn pcr(&self) -> Option<u64> {
        let af = self.adaptation_field()?;
        if af[0] & 0x10 == 0 || af.len() < 7 {
            return None;
        }
        Some(parse_pcr_field(&af[1..7]))
    }

    pub fn has_opcr(&self) -> bool {
        self.opcr().is_some()
    }

    /// 42-bit original PCR at 27 MHz, following the PCR field when present.
    pub fn opcr(&self) -> Option<u64> {
        let af = self.adaptation_field()?;
        if af[0] & 0x08 == 0 {
            return None;
        }
        let offset = 1 + if af[0] & 0x10 != 0 { 6 } else { 0 };
        (af.len() >= offset + 6).then(|| parse_pcr_field(&af[offset..offset + 6]))
    }

    /// PCR expressed in PTS units (27 MHz / 300).
    pub fn pcr_as_pts(&self) -> Option<u64> {
        self.pcr().map(|pcr| pcr / SYSTEM_CLOCK_SUBFACTOR)
    }

    pub fn has_pts(&self) -> bool {
        self.pts().is_some()
    }

    /// PTS from the PES header starting in this packet's payload.
    pub fn pts(&self) -> Option<u64> {
        if !self.payload_unit_start() {
            return None;
        }
        pes::pts_from_payload(self.payload())
    }

    pub fn has_dts(&self) -> bool {
        self.dts().is_some()
    }

    /// DTS from the PES header starting in this packet's payload.
    pub fn dts(&self) -> Option<u64> {
        if !self.payload_unit_start() {
            return None;
        }
        pes::dts_from_payload(self.payload())
    }
}

impl Default for TsPacket {
    fn default() -> Self {
        NULL_PACKET
    }
}

impl std::fmt::Debug for TsPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsPacket")
            .field("pid", &format_args!("0x{:04X}", self.pid()))
            .field("cc", &self.cc())
            .field("pusi", &self.payload_unit_start())
            .field("afc", &self.adaptation_field_control())
            .field("sc", &self.scrambling_control())
            .finish()
    }
}

impl PartialEq for TsPacket {
    fn eq(&self, other: &Self) -> bool {
        self.b[..] == other.b[..]
    }
}

impl Eq for TsPacket {}

/// Decode the 6-byte PCR field into a 27 MHz value.
fn parse_pcr_field(p: &[u8]) -> u64 {
    let base = ((p[0] as u64) << 25)
        | ((p[1] as u64) << 17)
        | ((p[2] as u64) << 9)
        | ((p[3] as u64) << 1)
        | ((p[4] as u64) >> 7);
    let ext = (((p[4] & 0x01) as u64) << 8) | p[5] as u64;
    base * 300 + ext
}

/// Encode a 27 MHz PCR value into its 6-byte field.
pub(crate) fn encode_pcr_field(pcr: u64, out: &mut [u8]) {
    let base = pcr / 300;
    let ext = pcr % 300;
    out[0] = (base >> 25) as u8;
    out[1] = (base >> 17) as u8;
    out[2] = (base >> 9) as u8;
    out[3] = (base >> 1) as u8;
    out[4] = (((base & 0x01) << 7) as u8) | 0x7E | ((ext >> 8) as u8 & 0x01);
    out[5] = (ext & 0xFF) as u8;
}

/// Builders for synthetic packets, shared by tests across the workspace.
pub mod test_support {
    use super::*;

    /// A payload-only packet with the given PID and continuity counter.
    pub fn payload_packet(pid: Pid, cc: u8) -> TsPacket {
        let mut b = [0xA5_u8; PKT_SIZE];
        b[0] = SYNC_BYTE;
        b[1] = (pid >> 8) as u8 & 0x1F;
        b[2] = (pid & 0xFF) as u8;
        b[3] = 0x10 | (cc & 0x0F);
        TsPacket { b }
    }

    /// A packet with an adaptation field carrying the given 27 MHz PCR.
    pub fn pcr_packet(pid: Pid, pcr: u64) -> TsPacket {
        let mut b = [0xFF_u8; PKT_SIZE];
        b[0] = SYNC_BYTE;
        b[1] = (pid >> 8) as u8 & 0x1F;
        b[2] = (pid & 0xFF) as u8;
        b[3] = 0x30; // adaptation field + payload
        b[4] = 7; // adaptation field length
        b[5] = 0x10; // PCR flag
        encode_pcr_field(pcr, &mut b[6..12]);
        TsPacket { b }
    }

    /// A packet whose payload starts a PES header with the given PTS.
    pub fn pts_packet(pid: Pid, pts: u64) -> TsPacket {
        let mut b = [0xFF_u8; PKT_SIZE];
        b[0] = SYNC_BYTE;
        b[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // payload unit start
        b[2] = (pid & 0xFF) as u8;
        b[3] = 0x10;
        // PES header: video stream, PTS only
        b[4..7].copy_from_slice(&[0x00, 0x00, 0x01]);
        b[7] = 0xE0;
        b[8] = 0x00;
        b[9] = 0x00;
        b[10] = 0x80;
        b[11] = 0x80; // PTS_DTS_flags = 0b10
        b[12] = 0x05; // PES header data length
        b[13] = 0x21 | (((pts >> 30) as u8 & 0x07) << 1);
        b[14] = (pts >> 22) as u8;
        b[15] = 0x01 | (((pts >> 15) as u8 & 0x7F) << 1);
        b[16] = (pts >> 7) as u8;
        b[17] = 0x01 | (((pts & 0x7F) as u8) << 1);
        TsPacket { b }
    }
}
