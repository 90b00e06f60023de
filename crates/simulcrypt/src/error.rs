use thiserror::Error;

/// Errors of the ECMG ⇔ SCS session.
#[derive(Debug, Error)]
pub enum SimulcryptError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("unexpected message 0x{0:04X} during handshake")]
    UnexpectedMessage(u16),

    #[error("channel error from ECMG, status 0x{status:04X}")]
    ChannelError { status: u16 },

    #[error("stream error from ECMG, status 0x{status:04X}")]
    StreamError { status: u16 },

    #[error("no response from ECMG within {0:?}")]
    Timeout(std::time::Duration),

    #[error("ECMG session closed")]
    Disconnected,
}
