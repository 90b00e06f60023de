use bytes::{BufMut, Bytes, BytesMut};

use crate::descriptor::{DescriptorIterator, DescriptorRef, TAG_AC3, TAG_EAC3, TAG_SUBTITLING, TAG_TELETEXT};
use crate::pid::Pid;
use crate::psi::TID_PMT;
use crate::psi::section::Section;
use crate::{Result, TsError};

/// One elementary stream entry in the PMT.
#[derive(Debug, Clone)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: Pid,
    pub descriptors: Vec<DescriptorRef>,
}

impl PmtStream {
    pub fn new(stream_type: u8, pid: Pid) -> Self {
        PmtStream {
            stream_type,
            pid,
            descriptors: Vec::new(),
        }
    }

    fn has_descriptor(&self, tag: u8) -> bool {
        self.descriptors.iter().any(|d| d.tag == tag)
    }

    /// Video component, by stream type.
    pub fn is_video(&self) -> bool {
        matches!(self.stream_type, 0x01 | 0x02 | 0x10 | 0x1B | 0x24)
    }

    /// Audio component, by stream type or by AC-3 style descriptors on a
    /// private PES stream.
    pub fn is_audio(&self) -> bool {
        matches!(self.stream_type, 0x03 | 0x04 | 0x0F | 0x11 | 0x81)
            || (self.stream_type == 0x06
                && (self.has_descriptor(TAG_AC3) || self.has_descriptor(TAG_EAC3)))
    }

    /// DVB subtitles or teletext component.
    pub fn is_subtitles(&self) -> bool {
        self.stream_type == 0x06
            && (self.has_descriptor(TAG_SUBTITLING) || self.has_descriptor(TAG_TELETEXT))
    }
}

/// Program Map Table.
#[derive(Debug, Clone)]
pub struct Pmt {
    pub service_id: u16,
    pub version: u8,
    pub pcr_pid: Pid,
    /// Program-level descriptor loop.
    pub descriptors: Vec<DescriptorRef>,
    pub streams: Vec<PmtStream>,
}

fn parse_descriptor_loop(data: Bytes) -> Vec<DescriptorRef> {
    DescriptorIterator::new(data).collect()
}

fn descriptor_loop_len(descs: &[DescriptorRef]) -> usize {
    descs.iter().map(|d| d.size()).sum()
}

impl Pmt {
    /// Parse a PMT from a validated section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TID_PMT {
            return Err(TsError::UnexpectedTableId {
                expected: TID_PMT,
                actual: section.table_id(),
            });
        }
        let body = section.body();
        if body.len() < 4 {
            return Err(TsError::SectionTooShort(body.len()));
        }
        let pcr_pid = u16::from_be_bytes([body[0], body[1]]) & 0x1FFF;
        let info_len = (u16::from_be_bytes([body[2], body[3]]) & 0x0FFF) as usize;
        if 4 + info_len > body.len() {
            return Err(TsError::DescriptorOverrun);
        }
        let descriptors = parse_descriptor_loop(body.slice(4..4 + info_len));

        let mut streams = Vec::new();
        let mut offset = 4 + info_len;
        while offset + 5 <= body.len() {
            let stream_type = body[offset];
            let pid = u16::from_be_bytes([body[offset + 1], body[offset + 2]]) & 0x1FFF;
            let es_len =
                (u16::from_be_bytes([body[offset + 3], body[offset + 4]]) & 0x0FFF) as usize;
            offset += 5;
            if offset + es_len > body.len() {
                return Err(TsError::DescriptorOverrun);
            }
            streams.push(PmtStream {
                stream_type,
                pid,
                descriptors: parse_descriptor_loop(body.slice(offset..offset + es_len)),
            });
            offset += es_len;
        }

        Ok(Pmt {
            service_id: section.table_id_extension(),
            version: section.version(),
            pcr_pid,
            descriptors,
            streams,
        })
    }

    /// Serialize into a long-form section with a fresh CRC.
    pub fn to_section(&self) -> Result<Section> {
        let mut body = BytesMut::new();
        body.put_u16(0xE000 | (self.pcr_pid & 0x1FFF));
        body.put_u16(0xF000 | descriptor_loop_len(&self.descriptors) as u16);
        for desc in &self.descriptors {
            desc.write(&mut body);
        }
        for stream in &self.streams {
            body.put_u8(stream.stream_type);
            body.put_u16(0xE000 | (stream.pid & 0x1FFF));
            body.put_u16(0xF000 | descriptor_loop_len(&stream.descriptors) as u16);
            for desc in &stream.descriptors {
                desc.write(&mut body);
            }
        }
        Section::build(TID_PMT, self.service_id, self.version, 0, 0, &body)
    }

    pub fn stream(&self, pid: Pid) -> Option<&PmtStream> {
        self.streams.iter().find(|s| s.pid == pid)
    }
}
