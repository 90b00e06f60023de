mod chain;
mod cli;
mod error;

use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ts_pipeline::{Pipeline, PipelineConfig, Realtime, StuffingConfig};

use crate::cli::{CommandLine, PluginSegment, SegmentKind, parse_command_line, parse_stuffing};
use crate::error::CliError;

fn main() -> ExitCode {
    let command = match parse_command_line(std::env::args()) {
        Ok(command) => command,
        Err(err) => {
            // clap renders its own help/version output
            let _ = err.print();
            return ExitCode::from(if err.use_stderr() { 2 } else { 0 });
        }
    };

    init_logging(command.global.verbose, command.global.quiet);

    match run(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: CommandLine) -> Result<(), CliError> {
    let config = pipeline_config(&command)?;

    // Defaults: read a file, write to standard output.
    let default_input = PluginSegment {
        kind: SegmentKind::Input,
        name: "file".to_string(),
        args: Vec::new(),
    };
    let default_output = PluginSegment {
        kind: SegmentKind::Output,
        name: "file".to_string(),
        args: Vec::new(),
    };

    let input = chain::build_input(command.input.as_ref().unwrap_or(&default_input))?;
    let output = chain::build_output(command.output.as_ref().unwrap_or(&default_output))?;

    let mut pipeline = Pipeline::new(config).input(input).output(output);
    for segment in &command.processors {
        pipeline = pipeline.add_processor(chain::build_processor(segment)?);
    }

    let summary = pipeline.run()?;
    info!(
        packets_in = summary.packets_in,
        packets_out = summary.packets_out,
        "done"
    );
    Ok(())
}

fn pipeline_config(command: &CommandLine) -> Result<PipelineConfig, CliError> {
    let global = &command.global;
    let (nullpkt, inpkt) = match &global.add_input_stuffing {
        Some(spec) => parse_stuffing(spec).map_err(CliError::Invalid)?,
        None => (0, 0),
    };
    Ok(PipelineConfig {
        name: "tsforge".to_string(),
        buffer_size: global.buffer_size_mb * 1024 * 1024,
        max_flush_packets: global.max_flushed_packets,
        max_input_packets: global.max_input_packets,
        bitrate: global.bitrate,
        bitrate_adjust_interval: Duration::from_secs(global.bitrate_adjust_interval),
        stuffing: StuffingConfig {
            start: global.add_start_stuffing,
            stop: global.add_stop_stuffing,
            nullpkt,
            inpkt,
        },
        realtime: match global.realtime {
            None => Realtime::Auto,
            Some(true) => Realtime::On,
            Some(false) => Realtime::Off,
        },
        ignore_joint_termination: global.ignore_joint_termination,
        monitor: global.monitor,
        monitor_interval: Duration::from_secs(10),
    })
}
