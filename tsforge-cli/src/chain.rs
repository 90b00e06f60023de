//! Static plugin registry: maps segment names to plugin constructors.

use std::path::PathBuf;

use clap::Parser;
use ts::Pid;
use ts_pipeline::{PacketInput, PacketOutput, PacketProcessor};
use ts_plugins::scrambler::ScramblingMode;
use ts_plugins::service::ServiceRef;
use ts_plugins::{
    DropOutput, FileInput, FileOutput, MuxConfig, MuxProcessor, NullInput, PcrExtract,
    PcrExtractConfig, Scrambler, ScramblerConfig,
};

use crate::cli::{PluginSegment, parse_hex};
use crate::error::CliError;

/// Parse one plugin segment with its own clap parser.
fn parse_segment<T: Parser>(segment: &PluginSegment) -> Result<T, CliError> {
    let argv = std::iter::once(segment.name.clone()).chain(segment.args.iter().cloned());
    T::try_parse_from(argv).map_err(CliError::Usage)
}

fn unknown(kind: &str, name: &str) -> CliError {
    CliError::UnknownPlugin {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

// ---------------------------------------------------------------- inputs

#[derive(Parser)]
#[command(about = "Read packets from a TS file")]
struct FileInputArgs {
    /// Input file of 188-byte packets.
    file: PathBuf,
    /// Number of passes over the file (0 = infinite).
    #[arg(short, long, default_value_t = 1)]
    repeat: usize,
    /// Start reading at this byte offset.
    #[arg(long, default_value_t = 0)]
    byte_offset: u64,
    /// Start reading at this packet index.
    #[arg(long, default_value_t = 0)]
    packet_offset: u64,
}

#[derive(Parser)]
#[command(about = "Generate null packets")]
struct NullInputArgs {
    /// Number of packets to generate (default: endless).
    count: Option<u64>,
    /// Vote joint termination once the count is reached.
    #[arg(short, long)]
    joint_termination: bool,
}

/// Build an input plugin from its segment.
pub fn build_input(segment: &PluginSegment) -> Result<Box<dyn PacketInput>, CliError> {
    match segment.name.as_str() {
        "file" => {
            let args: FileInputArgs = parse_segment(segment)?;
            let offset = if args.byte_offset != 0 {
                args.byte_offset
            } else {
                args.packet_offset * 188
            };
            Ok(Box::new(
                FileInput::new(args.file).repeat(args.repeat).byte_offset(offset),
            ))
        }
        "null" => {
            let args: NullInputArgs = parse_segment(segment)?;
            let mut input = NullInput::new().joint_termination(args.joint_termination);
            if let Some(count) = args.count {
                input = input.with_count(count);
            }
            Ok(Box::new(input))
        }
        other => Err(unknown("input", other)),
    }
}

// ------------------------------------------------------------- processors

#[derive(Parser)]
#[command(about = "Insert packets from a secondary TS file into stuffing")]
struct MuxArgs {
    /// Secondary file of 188-byte packets.
    file: PathBuf,
    /// Bitrate of inserted packets in b/s.
    #[arg(short, long, default_value_t = 0)]
    bitrate: u64,
    /// Primary packets between insertions.
    #[arg(short, long, default_value_t = 0)]
    inter_packet: u64,
    /// Milliseconds between insertions.
    #[arg(long, default_value_t = 0)]
    inter_time: u64,
    /// Insert only after this PTS on the reference PID.
    #[arg(long, default_value_t = 0)]
    min_pts: u64,
    /// Stop inserting after this PTS on the reference PID.
    #[arg(long, default_value_t = 0)]
    max_pts: u64,
    /// PID carrying the reference PCR or PTS clock.
    #[arg(long)]
    pts_pid: Option<Pid>,
    /// Force the PID of inserted packets.
    #[arg(short, long)]
    pid: Option<Pid>,
    /// Keep continuity counters of inserted packets untouched.
    #[arg(long)]
    no_continuity_update: bool,
    /// Skip the PID conflict check.
    #[arg(long)]
    no_pid_conflict_check: bool,
    /// Stop after this many insertions.
    #[arg(long, default_value_t = 0)]
    max_insert_count: u64,
    /// Number of passes over the file (0 = infinite).
    #[arg(short, long, default_value_t = 0)]
    repeat: usize,
    #[arg(long, default_value_t = 0)]
    byte_offset: u64,
    #[arg(long, default_value_t = 0)]
    packet_offset: u64,
    /// End the pipeline when the file is exhausted.
    #[arg(short, long)]
    terminate: bool,
    /// Vote joint termination when the file is exhausted.
    #[arg(short, long)]
    joint_termination: bool,
}

#[derive(Parser)]
#[command(about = "DVB scrambler")]
struct ScramblerArgs {
    /// Service to scramble: id, or name as listed in the SDT.
    service: Option<String>,
    /// Scramble these PIDs with a fixed control word.
    #[arg(short, long)]
    pid: Vec<Pid>,
    /// Fixed control word in hexadecimal.
    #[arg(long)]
    cw: Option<String>,
    /// Scrambling algorithm.
    #[arg(long, default_value = "atis-idsa")]
    scrambling: String,
    /// ECM generator `host:port`.
    #[arg(short, long)]
    ecmg: Option<String>,
    /// DVB SimulCrypt Super_CAS_Id (hexadecimal).
    #[arg(short, long)]
    super_cas_id: Option<String>,
    #[arg(long, default_value_t = 1)]
    channel_id: u16,
    #[arg(long, default_value_t = 1)]
    stream_id: u16,
    #[arg(long, default_value_t = 1)]
    ecm_id: u16,
    /// ECMG ⇔ SCS protocol version.
    #[arg(short = 'v', long, default_value_t = 2)]
    ecmg_scs_version: u8,
    /// Crypto-period duration in seconds.
    #[arg(short = 'd', long, default_value_t = 10)]
    cp_duration: u64,
    /// ECM PID bitrate in b/s.
    #[arg(short = 'b', long, default_value_t = 30_000)]
    bitrate_ecm: u64,
    /// Fixed ECM PID (allocated after the PMT PID by default).
    #[arg(long)]
    pid_ecm: Option<Pid>,
    /// Access criteria in hexadecimal.
    #[arg(short, long)]
    access_criteria: Option<String>,
    /// CA_descriptor private data in hexadecimal.
    #[arg(long)]
    private_data: Option<String>,
    /// Add CA_descriptors at component level.
    #[arg(long)]
    component_level: bool,
    /// Do not scramble audio components.
    #[arg(long)]
    no_audio: bool,
    /// Do not scramble video components.
    #[arg(long)]
    no_video: bool,
    /// Scramble subtitles components.
    #[arg(long)]
    subtitles: bool,
    /// Scramble one packet out of this many.
    #[arg(long, default_value_t = 1)]
    partial_scrambling: u64,
    /// Pass packets that are already scrambled.
    #[arg(long)]
    ignore_scrambled: bool,
    /// Generate ECMs synchronously.
    #[arg(long)]
    synchronous: bool,
}

#[derive(Parser)]
#[command(about = "Extract PCR, OPCR, PTS, DTS for analysis")]
struct PcrExtractArgs {
    /// Analyze these PIDs only (default: all).
    #[arg(short, long)]
    pid: Vec<Pid>,
    /// CSV output.
    #[arg(short, long)]
    csv: bool,
    /// Log output.
    #[arg(short, long)]
    log: bool,
    /// CSV field separator.
    #[arg(short, long, default_value = ";")]
    separator: String,
    /// Suppress the CSV header.
    #[arg(short, long)]
    noheader: bool,
    /// Keep only PTS values that move forward.
    #[arg(short, long)]
    good_pts_only: bool,
    #[arg(long)]
    pcr: bool,
    #[arg(long)]
    opcr: bool,
    #[arg(long)]
    pts: bool,
    #[arg(long)]
    dts: bool,
    /// CSV output file (default: standard error).
    #[arg(short, long)]
    output_file: Option<PathBuf>,
}

fn scrambling_mode(name: &str) -> Result<ScramblingMode, CliError> {
    match name {
        "dvb-csa2" => Ok(ScramblingMode::DvbCsa2),
        "dvb-csa3" => Ok(ScramblingMode::DvbCsa3),
        "atis-idsa" => Ok(ScramblingMode::AtisIdsa),
        other => Err(CliError::Invalid(format!(
            "unknown scrambling algorithm `{other}`"
        ))),
    }
}

fn hex_option(value: &Option<String>) -> Result<Vec<u8>, CliError> {
    match value {
        Some(text) => parse_hex(text).map_err(CliError::Invalid),
        None => Ok(Vec::new()),
    }
}

/// Build a processor plugin from its segment.
pub fn build_processor(segment: &PluginSegment) -> Result<Box<dyn PacketProcessor>, CliError> {
    match segment.name.as_str() {
        "mux" => {
            let args: MuxArgs = parse_segment(segment)?;
            let mut config = MuxConfig::new(args.file);
            config.bitrate = args.bitrate;
            config.inter_packet = args.inter_packet;
            config.inter_time_ms = args.inter_time;
            config.min_pts = args.min_pts;
            config.max_pts = args.max_pts;
            config.pts_pid = args.pts_pid;
            config.force_pid = args.pid;
            config.update_cc = !args.no_continuity_update;
            config.check_pid_conflict = !args.no_pid_conflict_check;
            config.max_insert_count = args.max_insert_count;
            config.repeat = args.repeat;
            config.byte_offset = args.byte_offset;
            config.packet_offset = args.packet_offset;
            config.terminate = args.terminate;
            config.joint_termination = args.joint_termination;
            Ok(Box::new(MuxProcessor::new(config)))
        }
        "scrambler" => {
            let args: ScramblerArgs = parse_segment(segment)?;
            let service = args.service.as_ref().map(|text| match text.parse::<u16>() {
                Ok(id) => ServiceRef::Id(id),
                Err(_) => ServiceRef::Name(text.clone()),
            });
            let super_cas_id = match &args.super_cas_id {
                Some(text) => {
                    u32::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|_| {
                        CliError::Invalid(format!("invalid super-cas-id `{text}`"))
                    })?
                }
                None => 0,
            };
            let cw = match &args.cw {
                Some(text) => Some(parse_hex(text).map_err(CliError::Invalid)?),
                None => None,
            };
            let config = ScramblerConfig {
                service,
                pids: args.pid.clone(),
                cw,
                mode: scrambling_mode(&args.scrambling)?,
                ecmg_addr: args.ecmg.clone(),
                super_cas_id,
                channel_id: args.channel_id,
                stream_id: args.stream_id,
                ecm_id: args.ecm_id,
                ecmg_version: args.ecmg_scs_version,
                cp_duration_ms: args.cp_duration * 1000,
                ecm_bitrate: args.bitrate_ecm,
                ecm_pid: args.pid_ecm,
                access_criteria: hex_option(&args.access_criteria)?,
                ca_private_data: hex_option(&args.private_data)?,
                component_level: args.component_level,
                scramble_audio: !args.no_audio,
                scramble_video: !args.no_video,
                scramble_subtitles: args.subtitles,
                partial_scrambling: args.partial_scrambling,
                ignore_scrambled: args.ignore_scrambled,
                synchronous: args.synchronous,
            };
            Ok(Box::new(Scrambler::new(config)))
        }
        "pcrextract" => {
            let args: PcrExtractArgs = parse_segment(segment)?;
            let config = PcrExtractConfig {
                pids: args.pid.clone(),
                separator: args.separator.clone(),
                csv: args.csv || !args.log,
                log: args.log,
                noheader: args.noheader,
                good_pts_only: args.good_pts_only,
                get_pcr: args.pcr,
                get_opcr: args.opcr,
                get_pts: args.pts,
                get_dts: args.dts,
                output: args.output_file.clone(),
            };
            Ok(Box::new(PcrExtract::new(config)))
        }
        other => Err(unknown("processor", other)),
    }
}

// --------------------------------------------------------------- outputs

#[derive(Parser)]
#[command(about = "Write packets to a TS file")]
struct FileOutputArgs {
    /// Output file (default: standard output).
    file: Option<PathBuf>,
    /// Append instead of truncating.
    #[arg(short, long)]
    append: bool,
}

/// Build an output plugin from its segment.
pub fn build_output(segment: &PluginSegment) -> Result<Box<dyn PacketOutput>, CliError> {
    match segment.name.as_str() {
        "file" => {
            let args: FileOutputArgs = parse_segment(segment)?;
            Ok(Box::new(FileOutput::new(args.file).append(args.append)))
        }
        "drop" => Ok(Box::new(DropOutput)),
        other => Err(unknown("output", other)),
    }
}
