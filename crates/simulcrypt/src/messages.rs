//! ECMG ⇔ SCS message types and their TLV encoding.
//!
//! Wire format: a 5-byte header `[version, message_type, length]` followed
//! by `length` bytes of `[param_type(2), param_length(2), value]` entries.

use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Result, SimulcryptError};

/// Protocol versions accepted on this interface.
pub const SUPPORTED_VERSIONS: [u8; 2] = [2, 3];

// Message types.
pub const MSG_CHANNEL_SETUP: u16 = 0x0001;
pub const MSG_CHANNEL_TEST: u16 = 0x0002;
pub const MSG_CHANNEL_STATUS: u16 = 0x0003;
pub const MSG_CHANNEL_CLOSE: u16 = 0x0004;
pub const MSG_CHANNEL_ERROR: u16 = 0x0005;
pub const MSG_STREAM_SETUP: u16 = 0x0101;
pub const MSG_STREAM_TEST: u16 = 0x0102;
pub const MSG_STREAM_STATUS: u16 = 0x0103;
pub const MSG_STREAM_CLOSE_REQUEST: u16 = 0x0104;
pub const MSG_STREAM_CLOSE_RESPONSE: u16 = 0x0105;
pub const MSG_STREAM_ERROR: u16 = 0x0106;
pub const MSG_CW_PROVISION: u16 = 0x0201;
pub const MSG_ECM_RESPONSE: u16 = 0x0202;

// Parameter types.
const PRM_SUPER_CAS_ID: u16 = 0x0001;
const PRM_SECTION_TSPKT_FLAG: u16 = 0x0002;
const PRM_DELAY_START: u16 = 0x0003;
const PRM_DELAY_STOP: u16 = 0x0004;
const PRM_MAX_STREAMS: u16 = 0x0008;
const PRM_MIN_CP_DURATION: u16 = 0x0009;
const PRM_LEAD_CW: u16 = 0x000A;
const PRM_CW_PER_MSG: u16 = 0x000B;
const PRM_MAX_COMP_TIME: u16 = 0x000C;
const PRM_ACCESS_CRITERIA: u16 = 0x000D;
const PRM_ECM_CHANNEL_ID: u16 = 0x000E;
const PRM_ECM_STREAM_ID: u16 = 0x000F;
const PRM_NOMINAL_CP_DURATION: u16 = 0x0010;
const PRM_AC_TRANSFER_MODE: u16 = 0x0011;
const PRM_CP_NUMBER: u16 = 0x0012;
const PRM_CP_DURATION: u16 = 0x0013;
const PRM_CP_CW_COMBINATION: u16 = 0x0014;
const PRM_ECM_DATAGRAM: u16 = 0x0015;
const PRM_ECM_ID: u16 = 0x0019;
const PRM_ERROR_STATUS: u16 = 0x7000;

/// `channel_setup`, sent by the SCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSetup {
    pub channel_id: u16,
    pub super_cas_id: u32,
}

/// `channel_status`, the ECMG's channel parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub channel_id: u16,
    /// 0: ECMs are sections; 1: ECMs are TS packets.
    pub section_tspkt_flag: bool,
    /// Signed offset in ms between crypto-period start and ECM broadcast.
    pub delay_start: i16,
    pub delay_stop: i16,
    pub max_streams: u16,
    /// Minimum crypto-period duration in 100 ms units.
    pub min_cp_duration: u16,
    pub lead_cw: u8,
    pub cw_per_msg: u8,
    pub max_comp_time: u16,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        ChannelStatus {
            channel_id: 1,
            section_tspkt_flag: false,
            delay_start: 0,
            delay_stop: 0,
            max_streams: 1,
            min_cp_duration: 1,
            lead_cw: 1,
            cw_per_msg: 2,
            max_comp_time: 5_000,
        }
    }
}

/// `stream_setup`, sent by the SCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSetup {
    pub channel_id: u16,
    pub stream_id: u16,
    pub ecm_id: u16,
    /// Nominal crypto-period duration in 100 ms units.
    pub nominal_cp_duration: u16,
}

/// `stream_status`, the ECMG's stream confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub channel_id: u16,
    pub stream_id: u16,
    pub ecm_id: u16,
    pub access_criteria_transfer_mode: bool,
}

/// `CW_provision`, one crypto-period's control words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CwProvision {
    pub channel_id: u16,
    pub stream_id: u16,
    pub cp_number: u16,
    pub cw_current: Vec<u8>,
    pub cw_next: Vec<u8>,
    pub access_criteria: Vec<u8>,
    /// Crypto-period duration in 100 ms units.
    pub cp_duration: u16,
}

/// `ECM_response`, the generated ECM for one crypto-period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcmResponse {
    pub channel_id: u16,
    pub stream_id: u16,
    pub cp_number: u16,
    pub ecm_datagram: Bytes,
}

/// Any message of the ECMG ⇔ SCS interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChannelSetup(ChannelSetup),
    ChannelTest { channel_id: u16 },
    ChannelStatus(ChannelStatus),
    ChannelClose { channel_id: u16 },
    ChannelError { channel_id: u16, status: u16 },
    StreamSetup(StreamSetup),
    StreamTest { channel_id: u16, stream_id: u16 },
    StreamStatus(StreamStatus),
    StreamCloseRequest { channel_id: u16, stream_id: u16 },
    StreamCloseResponse { channel_id: u16, stream_id: u16 },
    StreamError { channel_id: u16, stream_id: u16, status: u16 },
    CwProvision(CwProvision),
    EcmResponse(EcmResponse),
}

impl Message {
    pub fn message_type(&self) -> u16 {
        match self {
            Message::ChannelSetup(_) => MSG_CHANNEL_SETUP,
            Message::ChannelTest { .. } => MSG_CHANNEL_TEST,
            Message::ChannelStatus(_) => MSG_CHANNEL_STATUS,
            Message::ChannelClose { .. } => MSG_CHANNEL_CLOSE,
            Message::ChannelError { .. } => MSG_CHANNEL_ERROR,
            Message::StreamSetup(_) => MSG_STREAM_SETUP,
            Message::StreamTest { .. } => MSG_STREAM_TEST,
            Message::StreamStatus(_) => MSG_STREAM_STATUS,
            Message::StreamCloseRequest { .. } => MSG_STREAM_CLOSE_REQUEST,
            Message::StreamCloseResponse { .. } => MSG_STREAM_CLOSE_RESPONSE,
            Message::StreamError { .. } => MSG_STREAM_ERROR,
            Message::CwProvision(_) => MSG_CW_PROVISION,
            Message::EcmResponse(_) => MSG_ECM_RESPONSE,
        }
    }

    /// Serialize with the given protocol version.
    pub fn encode(&self, version: u8) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Message::ChannelSetup(m) => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, m.channel_id);
                put_u32(&mut body, PRM_SUPER_CAS_ID, m.super_cas_id);
            }
            Message::ChannelTest { channel_id }
            | Message::ChannelClose { channel_id } => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, *channel_id);
            }
            Message::ChannelStatus(m) => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, m.channel_id);
                put_u8(&mut body, PRM_SECTION_TSPKT_FLAG, m.section_tspkt_flag as u8);
                put_u16(&mut body, PRM_DELAY_START, m.delay_start as u16);
                put_u16(&mut body, PRM_DELAY_STOP, m.delay_stop as u16);
                put_u16(&mut body, PRM_MAX_STREAMS, m.max_streams);
                put_u16(&mut body, PRM_MIN_CP_DURATION, m.min_cp_duration);
                put_u8(&mut body, PRM_LEAD_CW, m.lead_cw);
                put_u8(&mut body, PRM_CW_PER_MSG, m.cw_per_msg);
                put_u16(&mut body, PRM_MAX_COMP_TIME, m.max_comp_time);
            }
            Message::ChannelError { channel_id, status } => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, *channel_id);
                put_u16(&mut body, PRM_ERROR_STATUS, *status);
            }
            Message::StreamSetup(m) => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, m.channel_id);
                put_u16(&mut body, PRM_ECM_STREAM_ID, m.stream_id);
                put_u16(&mut body, PRM_ECM_ID, m.ecm_id);
                put_u16(&mut body, PRM_NOMINAL_CP_DURATION, m.nominal_cp_duration);
            }
            Message::StreamTest {
                channel_id,
                stream_id,
            }
            | Message::StreamCloseRequest {
                channel_id,
                stream_id,
            }
            | Message::StreamCloseResponse {
                channel_id,
                stream_id,
            } => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, *channel_id);
                put_u16(&mut body, PRM_ECM_STREAM_ID, *stream_id);
            }
            Message::StreamStatus(m) => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, m.channel_id);
                put_u16(&mut body, PRM_ECM_STREAM_ID, m.stream_id);
                put_u16(&mut body, PRM_ECM_ID, m.ecm_id);
                put_u8(
                    &mut body,
                    PRM_AC_TRANSFER_MODE,
                    m.access_criteria_transfer_mode as u8,
                );
            }
            Message::StreamError {
                channel_id,
                stream_id,
                status,
            } => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, *channel_id);
                put_u16(&mut body, PRM_ECM_STREAM_ID, *stream_id);
                put_u16(&mut body, PRM_ERROR_STATUS, *status);
            }
            Message::CwProvision(m) => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, m.channel_id);
                put_u16(&mut body, PRM_ECM_STREAM_ID, m.stream_id);
                put_u16(&mut body, PRM_CP_NUMBER, m.cp_number);
                put_cw(&mut body, m.cp_number, &m.cw_current);
                put_cw(&mut body, m.cp_number.wrapping_add(1), &m.cw_next);
                if !m.access_criteria.is_empty() {
                    put_bytes(&mut body, PRM_ACCESS_CRITERIA, &m.access_criteria);
                }
                put_u16(&mut body, PRM_CP_DURATION, m.cp_duration);
            }
            Message::EcmResponse(m) => {
                put_u16(&mut body, PRM_ECM_CHANNEL_ID, m.channel_id);
                put_u16(&mut body, PRM_ECM_STREAM_ID, m.stream_id);
                put_u16(&mut body, PRM_CP_NUMBER, m.cp_number);
                put_bytes(&mut body, PRM_ECM_DATAGRAM, &m.ecm_datagram);
            }
        }

        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u8(version);
        frame.put_u16(self.message_type());
        frame.put_u16(body.len() as u16);
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Read one message from a blocking reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header)?;
        let version = header[0];
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(SimulcryptError::UnsupportedVersion(version));
        }
        let message_type = u16::from_be_bytes([header[1], header[2]]);
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;
        Self::decode(message_type, Bytes::from(body))
    }

    fn decode(message_type: u16, body: Bytes) -> Result<Message> {
        let params = Params::parse(body)?;
        let channel_id = params.u16(PRM_ECM_CHANNEL_ID).unwrap_or(0);
        let stream_id = params.u16(PRM_ECM_STREAM_ID).unwrap_or(0);
        let message = match message_type {
            MSG_CHANNEL_SETUP => Message::ChannelSetup(ChannelSetup {
                channel_id,
                super_cas_id: params.u32(PRM_SUPER_CAS_ID).unwrap_or(0),
            }),
            MSG_CHANNEL_TEST => Message::ChannelTest { channel_id },
            MSG_CHANNEL_STATUS => Message::ChannelStatus(ChannelStatus {
                channel_id,
                section_tspkt_flag: params.u8(PRM_SECTION_TSPKT_FLAG).unwrap_or(0) != 0,
                delay_start: params.u16(PRM_DELAY_START).unwrap_or(0) as i16,
                delay_stop: params.u16(PRM_DELAY_STOP).unwrap_or(0) as i16,
                max_streams: params.u16(PRM_MAX_STREAMS).unwrap_or(1),
                min_cp_duration: params.u16(PRM_MIN_CP_DURATION).unwrap_or(1),
                lead_cw: params.u8(PRM_LEAD_CW).unwrap_or(1),
                cw_per_msg: params.u8(PRM_CW_PER_MSG).unwrap_or(2),
                max_comp_time: params.u16(PRM_MAX_COMP_TIME).unwrap_or(0),
            }),
            MSG_CHANNEL_CLOSE => Message::ChannelClose { channel_id },
            MSG_CHANNEL_ERROR => Message::ChannelError {
                channel_id,
                status: params.u16(PRM_ERROR_STATUS).unwrap_or(0),
            },
            MSG_STREAM_SETUP => Message::StreamSetup(StreamSetup {
                channel_id,
                stream_id,
                ecm_id: params.u16(PRM_ECM_ID).unwrap_or(0),
                nominal_cp_duration: params.u16(PRM_NOMINAL_CP_DURATION).unwrap_or(0),
            }),
            MSG_STREAM_TEST => Message::StreamTest {
                channel_id,
                stream_id,
            },
            MSG_STREAM_STATUS => Message::StreamStatus(StreamStatus {
                channel_id,
                stream_id,
                ecm_id: params.u16(PRM_ECM_ID).unwrap_or(0),
                access_criteria_transfer_mode: params.u8(PRM_AC_TRANSFER_MODE).unwrap_or(0) != 0,
            }),
            MSG_STREAM_CLOSE_REQUEST => Message::StreamCloseRequest {
                channel_id,
                stream_id,
            },
            MSG_STREAM_CLOSE_RESPONSE => Message::StreamCloseResponse {
                channel_id,
                stream_id,
            },
            MSG_STREAM_ERROR => Message::StreamError {
                channel_id,
                stream_id,
                status: params.u16(PRM_ERROR_STATUS).unwrap_or(0),
            },
            MSG_CW_PROVISION => {
                let cp_number = params
                    .u16(PRM_CP_NUMBER)
                    .ok_or_else(|| SimulcryptError::Protocol("CW_provision without CP_number".into()))?;
                let mut cw_current = Vec::new();
                let mut cw_next = Vec::new();
                for combo in params.all(PRM_CP_CW_COMBINATION) {
                    if combo.len() < 2 {
                        return Err(SimulcryptError::Protocol("short CP_CW_combination".into()));
                    }
                    let cp = u16::from_be_bytes([combo[0], combo[1]]);
                    let cw = combo[2..].to_vec();
                    if cp == cp_number {
                        cw_current = cw;
                    } else {
                        cw_next = cw;
                    }
                }
                Message::CwProvision(CwProvision {
                    channel_id,
                    stream_id,
                    cp_number,
                    cw_current,
                    cw_next,
                    access_criteria: params
                        .bytes(PRM_ACCESS_CRITERIA)
                        .map(|b| b.to_vec())
                        .unwrap_or_default(),
                    cp_duration: params.u16(PRM_CP_DURATION).unwrap_or(0),
                })
            }
            MSG_ECM_RESPONSE => Message::EcmResponse(EcmResponse {
                channel_id,
                stream_id,
                cp_number: params
                    .u16(PRM_CP_NUMBER)
                    .ok_or_else(|| SimulcryptError::Protocol("ECM_response without CP_number".into()))?,
                ecm_datagram: params.bytes(PRM_ECM_DATAGRAM).unwrap_or_default(),
            }),
            other => {
                return Err(SimulcryptError::Protocol(format!(
                    "unknown message type 0x{other:04X}"
                )));
            }
        };
        Ok(message)
    }
}

/// Parsed parameter list of one message.
struct Params {
    entries: Vec<(u16, Bytes)>,
}

impl Params {
    fn parse(mut body: Bytes) -> Result<Self> {
        let mut entries = Vec::new();
        while body.has_remaining() {
            if body.remaining() < 4 {
                return Err(SimulcryptError::Protocol("truncated parameter header".into()));
            }
            let param_type = body.get_u16();
            let length = body.get_u16() as usize;
            if body.remaining() < length {
                return Err(SimulcryptError::Protocol("truncated parameter value".into()));
            }
            entries.push((param_type, body.split_to(length)));
        }
        Ok(Params { entries })
    }

    fn bytes(&self, param: u16) -> Option<Bytes> {
        self.entries
            .iter()
            .find(|(t, _)| *t == param)
            .map(|(_, v)| v.clone())
    }

    fn all(&self, param: u16) -> impl Iterator<Item = &Bytes> {
        self.entries
            .iter()
            .filter(move |(t, _)| *t == param)
            .map(|(_, v)| v)
    }

    fn u8(&self, param: u16) -> Option<u8> {
        self.bytes(param).filter(|v| v.len() == 1).map(|v| v[0])
    }

    fn u16(&self, param: u16) -> Option<u16> {
        self.bytes(param)
            .filter(|v| v.len() == 2)
            .map(|v| u16::from_be_bytes([v[0], v[1]]))
    }

    fn u32(&self, param: u16) -> Option<u32> {
        self.bytes(param)
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }
}

fn put_u8(out: &mut BytesMut, param: u16, value: u8) {
    out.put_u16(param);
    out.put_u16(1);
    out.put_u8(value);
}

fn put_u16(out: &mut BytesMut, param: u16, value: u16) {
    out.put_u16(param);
    out.put_u16(2);
    out.put_u16(value);
}

fn put_u32(out: &mut BytesMut, param: u16, value: u32) {
    out.put_u16(param);
    out.put_u16(4);
    out.put_u32(value);
}

fn put_bytes(out: &mut BytesMut, param: u16, value: &[u8]) {
    out.put_u16(param);
    out.put_u16(value.len() as u16);
    out.put_slice(value);
}

fn put_cw(out: &mut BytesMut, cp_number: u16, cw: &[u8]) {
    out.put_u16(PRM_CP_CW_COMBINATION);
    out.put_u16(2 + cw.len() as u16);
    out.put_u16(cp_number);
    out.put_slice(cw);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let encoded = message.encode(2);
        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        Message::read_from(&mut cursor).unwrap()
    }

    #[test]
    fn test_channel_setup_round_trip() {
        let msg = Message::ChannelSetup(ChannelSetup {
            channel_id: 7,
            super_cas_id: 0x4ADC_0001,
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_channel_status_negative_delay() {
        let msg = Message::ChannelStatus(ChannelStatus {
            delay_start: -2000,
            ..Default::default()
        });
        let Message::ChannelStatus(status) = round_trip(msg) else {
            panic!("wrong message type");
        };
        assert_eq!(status.delay_start, -2000);
    }

    #[test]
    fn test_cw_provision_round_trip() {
        let msg = Message::CwProvision(CwProvision {
            channel_id: 1,
            stream_id: 1,
            cp_number: 41,
            cw_current: vec![0x11; 8],
            cw_next: vec![0x22; 8],
            access_criteria: vec![0xAB, 0xCD],
            cp_duration: 100,
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_ecm_response_round_trip() {
        let msg = Message::EcmResponse(EcmResponse {
            channel_id: 1,
            stream_id: 1,
            cp_number: 41,
            ecm_datagram: Bytes::from(vec![0x80; 120]),
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut raw = Message::ChannelTest { channel_id: 1 }.encode(2).to_vec();
        raw[0] = 9;
        let mut cursor = std::io::Cursor::new(raw);
        assert!(matches!(
            Message::read_from(&mut cursor),
            Err(SimulcryptError::UnsupportedVersion(9))
        ));
    }
}
