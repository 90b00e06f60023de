use thiserror::Error;

/// Errors raised while parsing or building TS structures.
#[derive(Debug, Error)]
pub enum TsError {
    #[error("invalid packet size {0}, expected 188 bytes")]
    InvalidPacketSize(usize),

    #[error("invalid sync byte 0x{0:02X}, expected 0x47")]
    InvalidSyncByte(u8),

    #[error("insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("invalid PES start code")]
    InvalidPesStartCode,

    #[error("invalid PTS/DTS flags 0b{0:02b}")]
    InvalidPtsDtsFlags(u8),

    #[error("section CRC mismatch")]
    SectionCrc,

    #[error("section too short ({0} bytes)")]
    SectionTooShort(usize),

    #[error("section too long ({0} bytes)")]
    SectionTooLong(usize),

    #[error("invalid table id 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedTableId { expected: u8, actual: u8 },

    #[error("invalid PID 0x{0:04X}")]
    InvalidPid(u16),

    #[error("descriptor loop overruns section")]
    DescriptorOverrun,
}
