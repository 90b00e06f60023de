//! MPEG-2 Transport Stream packet primitive and DVB table syntax.
//!
//! This crate provides the 188-byte TS packet with mutating accessors
//! (PID, continuity counter, scrambling control, PCR/OPCR, PTS/DTS),
//! fixed-size PID sets, PSI section assembly and packetization, and the
//! PAT/PMT/SDT parsers needed for service discovery and PMT rewriting.

pub mod clock;
pub mod crc32;
pub mod descriptor;
pub mod error;
pub mod packet;
pub mod pes;
pub mod pid;
pub mod psi;

pub use clock::{packet_distance, sequenced_pts, PKT_SIZE, SYSTEM_CLOCK_FREQ, SYSTEM_CLOCK_SUBFACTOR};
pub use crc32::{mpeg2_crc32, validate_section_crc32};
pub use descriptor::{CaDescriptor, DescriptorIterator, DescriptorRef, ScramblingDescriptor};
pub use error::TsError;
pub use packet::{NULL_PACKET, TsPacket};
pub use pid::{PID_CAT, PID_MAX, PID_NULL, PID_PAT, PID_SDT, Pid, PidSet};
pub use psi::demux::SectionDemux;
pub use psi::packetizer::{CyclingPacketizer, packetize_raw, packetize_section};
pub use psi::pat::Pat;
pub use psi::pmt::{Pmt, PmtStream};
pub use psi::sdt::Sdt;
pub use psi::section::Section;

/// Result type for TS parsing and building operations
pub type Result<T> = std::result::Result<T, TsError>;
