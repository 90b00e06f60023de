//! DVB SimulCrypt ECMG ⇔ SCS protocol client (ETSI TS 103 197).
//!
//! The SCS side of the ECMG interface: TLV message codec, blocking session
//! bring-up (`channel_setup → channel_status`, `stream_setup →
//! stream_status`) and per-crypto-period CW provisioning, either blocking
//! (`generate_ecm`) or asynchronous (`submit_ecm` with a callback invoked
//! from the receiver thread).

pub mod client;
pub mod messages;

mod error;

pub use client::{EcmgClient, EcmgConfig, EcmHandler};
pub use error::SimulcryptError;
pub use messages::{
    ChannelSetup, ChannelStatus, CwProvision, EcmResponse, Message, StreamSetup, StreamStatus,
};

/// Result type for SimulCrypt operations.
pub type Result<T> = std::result::Result<T, SimulcryptError>;
