//! MPEG and DVB descriptors.
//!
//! Only the descriptors this pipeline reads or writes are modelled: the
//! generic descriptor loop, the CA_descriptor and the DVB
//! scrambling_descriptor. Everything else passes through untouched as raw
//! bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::pid::Pid;

/// CA descriptor (tag 0x09)
pub const TAG_CA: u8 = 0x09;
/// ISO 639 language descriptor (tag 0x0A)
pub const TAG_ISO_639_LANGUAGE: u8 = 0x0A;
/// DVB service descriptor (tag 0x48)
pub const TAG_SERVICE: u8 = 0x48;
/// DVB teletext descriptor (tag 0x56)
pub const TAG_TELETEXT: u8 = 0x56;
/// DVB subtitling descriptor (tag 0x59)
pub const TAG_SUBTITLING: u8 = 0x59;
/// DVB AC-3 descriptor (tag 0x6A)
pub const TAG_AC3: u8 = 0x6A;
/// DVB enhanced AC-3 descriptor (tag 0x7A)
pub const TAG_EAC3: u8 = 0x7A;
/// DVB scrambling descriptor (tag 0x65)
pub const TAG_SCRAMBLING: u8 = 0x65;

/// One descriptor in a loop: tag plus raw body.
#[derive(Debug, Clone)]
pub struct DescriptorRef {
    pub tag: u8,
    pub data: Bytes,
}

impl DescriptorRef {
    /// Serialized size, header included.
    pub fn size(&self) -> usize {
        2 + self.data.len()
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.tag);
        out.put_u8(self.data.len() as u8);
        out.put_slice(&self.data);
    }
}

/// Iterator over a `[tag, length, data…]*` descriptor loop.
#[derive(Debug, Clone)]
pub struct DescriptorIterator {
    data: Bytes,
}

impl DescriptorIterator {
    pub fn new(data: Bytes) -> Self {
        DescriptorIterator { data }
    }
}

impl Iterator for DescriptorIterator {
    type Item = DescriptorRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let tag = self.data[0];
        let length = self.data[1] as usize;
        if self.data.len() < 2 + length {
            // Malformed loop, stop here
            self.data.clear();
            return None;
        }
        let _ = self.data.split_to(2);
        let data = self.data.split_to(length);
        Some(DescriptorRef { tag, data })
    }
}

/// CA_descriptor: links a CA system to the PID carrying its ECMs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDescriptor {
    pub ca_system_id: u16,
    pub ca_pid: Pid,
    pub private_data: Vec<u8>,
}

impl CaDescriptor {
    pub fn new(ca_system_id: u16, ca_pid: Pid) -> Self {
        CaDescriptor {
            ca_system_id,
            ca_pid,
            private_data: Vec::new(),
        }
    }

    pub fn with_private_data(mut self, data: Vec<u8>) -> Self {
        self.private_data = data;
        self
    }

    pub fn to_descriptor(&self) -> DescriptorRef {
        let mut body = BytesMut::with_capacity(4 + self.private_data.len());
        body.put_u16(self.ca_system_id);
        body.put_u16(0xE000 | (self.ca_pid & 0x1FFF));
        body.put_slice(&self.private_data);
        DescriptorRef {
            tag: TAG_CA,
            data: body.freeze(),
        }
    }

    /// Parse from a descriptor body (tag already consumed).
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        Some(CaDescriptor {
            ca_system_id: u16::from_be_bytes([data[0], data[1]]),
            ca_pid: u16::from_be_bytes([data[2], data[3]]) & 0x1FFF,
            private_data: data[4..].to_vec(),
        })
    }
}

/// DVB scrambling_descriptor: advertises a non-default scrambling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScramblingDescriptor {
    pub scrambling_mode: u8,
}

impl ScramblingDescriptor {
    pub fn new(scrambling_mode: u8) -> Self {
        ScramblingDescriptor { scrambling_mode }
    }

    pub fn to_descriptor(&self) -> DescriptorRef {
        DescriptorRef {
            tag: TAG_SCRAMBLING,
            data: Bytes::copy_from_slice(&[self.scrambling_mode]),
        }
    }
}
