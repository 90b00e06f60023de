//! Command line parsing: global options followed by a plugin chain.
//!
//! `tsforge [options] [-I input [opts]] [-P proc [opts]]… [-O output [opts]]`
//!
//! The argument list is split into segments at `-I`, `-P` and `-O`; each
//! segment is handed to the plugin's own parser.

use clap::Parser;

/// Kind of a plugin segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Input,
    Processor,
    Output,
}

/// One `-I/-P/-O name [options…]` segment.
#[derive(Debug, Clone)]
pub struct PluginSegment {
    pub kind: SegmentKind,
    pub name: String,
    pub args: Vec<String>,
}

/// Global options of the transport stream processor.
#[derive(Debug, Parser)]
#[command(
    name = "tsforge",
    about = "MPEG transport stream processor using a chain of plugins"
)]
pub struct GlobalArgs {
    /// Total packet buffer size in megabytes.
    #[arg(long, default_value_t = 16)]
    pub buffer_size_mb: usize,

    /// Fixed TS bitrate in b/s, overriding discovery.
    #[arg(short, long, default_value_t = 0)]
    pub bitrate: u64,

    /// Seconds between two bitrate re-evaluations.
    #[arg(long, default_value_t = 5)]
    pub bitrate_adjust_interval: u64,

    /// Maximum packets a processor holds back before flushing.
    #[arg(long, default_value_t = 0)]
    pub max_flushed_packets: usize,

    /// Maximum packets per input operation.
    #[arg(long, default_value_t = 0)]
    pub max_input_packets: usize,

    /// Interleave null packets in the input: `nullpkt/inpkt`.
    #[arg(short = 'a', long, value_name = "NULLPKT/INPKT")]
    pub add_input_stuffing: Option<String>,

    /// Null packets before the first input packet.
    #[arg(long, default_value_t = 0)]
    pub add_start_stuffing: usize,

    /// Null packets after the last input packet.
    #[arg(long, default_value_t = 0)]
    pub add_stop_stuffing: usize,

    /// Force realtime defaults on or off.
    #[arg(short, long)]
    pub realtime: Option<bool>,

    /// Run the resource monitor thread.
    #[arg(short, long)]
    pub monitor: bool,

    /// Refuse joint termination requested by plugins.
    #[arg(short, long)]
    pub ignore_joint_termination: bool,

    /// More verbose logging (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Errors only.
    #[arg(short, long)]
    pub quiet: bool,
}

/// The parsed command line: global options plus the plugin chain.
#[derive(Debug)]
pub struct CommandLine {
    pub global: GlobalArgs,
    pub input: Option<PluginSegment>,
    pub processors: Vec<PluginSegment>,
    pub output: Option<PluginSegment>,
}

/// Split the raw arguments and parse the global part.
pub fn parse_command_line<I>(args: I) -> Result<CommandLine, clap::Error>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let program = args.next().unwrap_or_else(|| "tsforge".to_string());

    let mut global_args = vec![program];
    let mut segments: Vec<PluginSegment> = Vec::new();

    for arg in args {
        let kind = match arg.as_str() {
            "-I" => Some(SegmentKind::Input),
            "-P" => Some(SegmentKind::Processor),
            "-O" => Some(SegmentKind::Output),
            _ => None,
        };
        if let Some(kind) = kind {
            segments.push(PluginSegment {
                kind,
                name: String::new(),
                args: Vec::new(),
            });
        } else if let Some(segment) = segments.last_mut() {
            if segment.name.is_empty() {
                segment.name = arg;
            } else {
                segment.args.push(arg);
            }
        } else {
            global_args.push(arg);
        }
    }

    let global = GlobalArgs::try_parse_from(global_args)?;

    let mut command = CommandLine {
        global,
        input: None,
        processors: Vec::new(),
        output: None,
    };
    for segment in segments {
        if segment.name.is_empty() {
            return Err(clap::Error::raw(
                clap::error::ErrorKind::MissingRequiredArgument,
                "plugin segment without a plugin name\n",
            ));
        }
        match segment.kind {
            SegmentKind::Input if command.input.is_some() => {
                return Err(clap::Error::raw(
                    clap::error::ErrorKind::ArgumentConflict,
                    "only one input plugin is allowed\n",
                ));
            }
            SegmentKind::Output if command.output.is_some() => {
                return Err(clap::Error::raw(
                    clap::error::ErrorKind::ArgumentConflict,
                    "only one output plugin is allowed\n",
                ));
            }
            SegmentKind::Input => command.input = Some(segment),
            SegmentKind::Output => command.output = Some(segment),
            SegmentKind::Processor => command.processors.push(segment),
        }
    }
    Ok(command)
}

/// Parse a `nullpkt/inpkt` stuffing specification.
pub fn parse_stuffing(spec: &str) -> Result<(usize, usize), String> {
    let (nullpkt, inpkt) = spec
        .split_once('/')
        .ok_or_else(|| format!("invalid stuffing `{spec}`, expected nullpkt/inpkt"))?;
    let nullpkt = nullpkt
        .parse()
        .map_err(|_| format!("invalid null packet count `{nullpkt}`"))?;
    let inpkt = inpkt
        .parse()
        .map_err(|_| format!("invalid input packet count `{inpkt}`"))?;
    Ok((nullpkt, inpkt))
}

/// Decode an even-length hexadecimal string.
pub fn parse_hex(value: &str) -> Result<Vec<u8>, String> {
    if value.len() % 2 != 0 {
        return Err(format!("`{value}`: specify an even number of hexa digits"));
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&value[i..i + 2], 16)
                .map_err(|_| format!("`{value}` is not valid hexadecimal"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("tsforge")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_global_and_chain_split() {
        let command = parse_command_line(args(
            "-b 38000000 -I file input.ts --repeat 2 -P mux other.ts -P pcrextract --csv -O drop",
        ))
        .unwrap();
        assert_eq!(command.global.bitrate, 38_000_000);
        let input = command.input.unwrap();
        assert_eq!(input.name, "file");
        assert_eq!(input.args, vec!["input.ts", "--repeat", "2"]);
        assert_eq!(command.processors.len(), 2);
        assert_eq!(command.processors[0].name, "mux");
        assert_eq!(command.output.unwrap().name, "drop");
    }

    #[test]
    fn test_duplicate_input_rejected() {
        assert!(parse_command_line(args("-I null -I file x.ts")).is_err());
    }

    #[test]
    fn test_missing_plugin_name_rejected() {
        assert!(parse_command_line(args("-I")).is_err());
    }

    #[test]
    fn test_parse_stuffing() {
        assert_eq!(parse_stuffing("2/100").unwrap(), (2, 100));
        assert!(parse_stuffing("2").is_err());
        assert!(parse_stuffing("x/y").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0ab1").unwrap(), vec![0x0A, 0xB1]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
