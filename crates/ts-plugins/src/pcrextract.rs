//! PCR/OPCR/PTS/DTS extraction processor.
//!
//! Passes every packet through untouched while writing the observed clock
//! values to a CSV or log sink.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::info;
use ts::clock::{SYSTEM_CLOCK_FREQ, SYSTEM_CLOCK_SUBFACTOR, sequenced_pts};
use ts::{Pid, PidSet, TsPacket};
use ts_pipeline::{PacketFeedback, PacketProcessor, PacketStatus, StageHandle};

/// Options of the `pcrextract` processor.
#[derive(Debug, Clone)]
pub struct PcrExtractConfig {
    /// PIDs to analyze; empty means every PID.
    pub pids: Vec<Pid>,
    pub separator: String,
    pub csv: bool,
    pub log: bool,
    pub noheader: bool,
    /// Report only PTS that move forward (33-bit modular order).
    pub good_pts_only: bool,
    pub get_pcr: bool,
    pub get_opcr: bool,
    pub get_pts: bool,
    pub get_dts: bool,
    /// CSV output file; `None` writes to standard error.
    pub output: Option<PathBuf>,
}

impl Default for PcrExtractConfig {
    fn default() -> Self {
        PcrExtractConfig {
            pids: Vec::new(),
            separator: ";".to_string(),
            csv: true,
            log: false,
            noheader: false,
            good_pts_only: false,
            get_pcr: false,
            get_opcr: false,
            get_pts: false,
            get_dts: false,
            output: None,
        }
    }
}

#[derive(Default)]
struct PidContext {
    packet_count: u64,
    pcr_count: u64,
    opcr_count: u64,
    pts_count: u64,
    dts_count: u64,
    first_pcr: u64,
    first_opcr: u64,
    first_pts: u64,
    last_good_pts: u64,
    first_dts: u64,
}

enum Sink {
    File(BufWriter<File>),
    Stderr(std::io::Stderr),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::File(writer) => writer.write(buf),
            Sink::Stderr(stderr) => stderr.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::File(writer) => writer.flush(),
            Sink::Stderr(stderr) => stderr.flush(),
        }
    }
}

/// The `pcrextract` packet processor.
pub struct PcrExtract {
    config: PcrExtractConfig,
    pids: PidSet,
    all_pids: bool,
    get_pcr: bool,
    get_opcr: bool,
    get_pts: bool,
    get_dts: bool,
    sink: Option<Sink>,
    packet_count: u64,
    stats: HashMap<Pid, PidContext>,
}

impl PcrExtract {
    pub fn new(config: PcrExtractConfig) -> Self {
        let pids: PidSet = config.pids.iter().copied().collect();
        let all_pids = config.pids.is_empty();
        // Nothing selected means everything selected.
        let any = config.get_pcr || config.get_opcr || config.get_pts || config.get_dts;
        PcrExtract {
            get_pcr: config.get_pcr || !any,
            get_opcr: config.get_opcr || !any,
            get_pts: config.get_pts || !any,
            get_dts: config.get_dts || !any,
            pids,
            all_pids,
            config,
            sink: None,
            packet_count: 0,
            stats: HashMap::new(),
        }
    }

    fn row(
        &mut self,
        pid: Pid,
        kind: &str,
        count_in_pid: u64,
        value: u64,
        offset: u64,
        from_pcr: Option<i64>,
    ) -> std::io::Result<()> {
        if self.config.csv
            && let Some(sink) = &mut self.sink
        {
            let sep = &self.config.separator;
            let pid_count = self.stats.get(&pid).map_or(0, |c| c.packet_count);
            let from_pcr = from_pcr.map_or(String::new(), |v| v.to_string());
            writeln!(
                sink,
                "{pid}{sep}{}{sep}{pid_count}{sep}{kind}{sep}{count_in_pid}{sep}{value}{sep}{offset}{sep}{from_pcr}",
                self.packet_count
            )?;
        }
        if self.config.log {
            let frequency = if kind == "PCR" || kind == "OPCR" {
                SYSTEM_CLOCK_FREQ
            } else {
                SYSTEM_CLOCK_FREQ / SYSTEM_CLOCK_SUBFACTOR
            };
            info!(
                pid = format_args!("0x{pid:04X}"),
                kind,
                value = format_args!("0x{value:011X}"),
                ms_from_start = (offset * 1000) / frequency,
                "clock sample"
            );
        }
        Ok(())
    }
}

impl PacketProcessor for PcrExtract {
    fn name(&self) -> &'static str {
        "pcrextract"
    }

    fn start(&mut self, _handle: &StageHandle) -> ts_pipeline::Result<()> {
        self.packet_count = 0;
        self.stats.clear();
        let mut sink = match &self.config.output {
            Some(path) => Sink::File(BufWriter::new(File::create(path)?)),
            None => Sink::Stderr(std::io::stderr()),
        };
        if self.config.csv && !self.config.noheader {
            let sep = &self.config.separator;
            writeln!(
                sink,
                "PID{sep}Packet index in TS{sep}Packet index in PID{sep}Type{sep}Count in PID{sep}Value{sep}Value offset in PID{sep}Offset from PCR"
            )?;
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn process(
        &mut self,
        _handle: &StageHandle,
        pkt: &mut TsPacket,
        _feedback: &mut PacketFeedback,
    ) -> ts_pipeline::Result<PacketStatus> {
        let pid = pkt.pid();
        if !(self.all_pids || self.pids.test(pid)) {
            self.packet_count += 1;
            return Ok(PacketStatus::Ok);
        }

        let pcr = pkt.pcr();

        if let Some(value) = pcr {
            let context = self.stats.entry(pid).or_default();
            if context.pcr_count == 0 {
                context.first_pcr = value;
            }
            context.pcr_count += 1;
            let (count, offset) = (context.pcr_count, value - context.first_pcr);
            if self.get_pcr {
                self.row(pid, "PCR", count, value, offset, None)?;
            }
        }

        if let Some(value) = pkt.opcr() {
            let context = self.stats.entry(pid).or_default();
            if context.opcr_count == 0 {
                context.first_opcr = value;
            }
            context.opcr_count += 1;
            let (count, offset) = (context.opcr_count, value - context.first_opcr);
            if self.get_opcr {
                let from_pcr = pcr.map(|p| value as i64 - p as i64);
                self.row(pid, "OPCR", count, value, offset, from_pcr)?;
            }
        }

        if let Some(value) = pkt.pts() {
            let context = self.stats.entry(pid).or_default();
            if context.pts_count == 0 {
                context.first_pts = value;
                context.last_good_pts = value;
            }
            context.pts_count += 1;
            // A "good" PTS moves forward in 33-bit modular order.
            let good = sequenced_pts(context.last_good_pts, value);
            if good {
                context.last_good_pts = value;
            }
            let (count, offset) = (context.pts_count, value.wrapping_sub(context.first_pts));
            if self.get_pts && (good || !self.config.good_pts_only) {
                let from_pcr = pcr.map(|p| value as i64 - (p / SYSTEM_CLOCK_SUBFACTOR) as i64);
                self.row(pid, "PTS", count, value, offset, from_pcr)?;
            }
        }

        if let Some(value) = pkt.dts() {
            let context = self.stats.entry(pid).or_default();
            if context.dts_count == 0 {
                context.first_dts = value;
            }
            context.dts_count += 1;
            let (count, offset) = (context.dts_count, value.wrapping_sub(context.first_dts));
            if self.get_dts {
                let from_pcr = pcr.map(|p| value as i64 - (p / SYSTEM_CLOCK_SUBFACTOR) as i64);
                self.row(pid, "DTS", count, value, offset, from_pcr)?;
            }
        }

        self.stats.entry(pid).or_default().packet_count += 1;
        self.packet_count += 1;
        Ok(PacketStatus::Ok)
    }

    fn stop(&mut self, _handle: &StageHandle) {
        if let Some(sink) = &mut self.sink {
            let _ = sink.flush();
        }
        self.sink = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts::packet::test_support::{payload_packet, pcr_packet};
    use ts_pipeline::test_utils::create_test_handle;

    fn run(config: PcrExtractConfig, packets: Vec<TsPacket>) -> String {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let handle = create_test_handle(0);
        let mut proc = PcrExtract::new(PcrExtractConfig {
            output: Some(path.clone()),
            ..config
        });
        proc.start(&handle).unwrap();
        for mut pkt in packets {
            let mut feedback = PacketFeedback::default();
            assert_eq!(
                proc.process(&handle, &mut pkt, &mut feedback).unwrap(),
                PacketStatus::Ok
            );
        }
        proc.stop(&handle);
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_pcr_offsets_non_decreasing() {
        let config = PcrExtractConfig {
            get_pcr: true,
            ..Default::default()
        };
        let packets = vec![
            pcr_packet(0x100, 1_000_000),
            payload_packet(0x100, 1),
            pcr_packet(0x100, 1_360_000),
            pcr_packet(0x100, 1_720_000),
        ];
        let output = run(config, packets);
        let mut lines = output.lines();
        let header = lines.next().unwrap();
        assert!(header.contains("Value offset in PID"));

        let offsets: Vec<u64> = lines
            .map(|line| line.split(';').nth(6).unwrap().parse().unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 360_000, 720_000]);
    }

    #[test]
    fn test_noheader_and_pid_filter() {
        let config = PcrExtractConfig {
            get_pcr: true,
            noheader: true,
            pids: vec![0x200],
            ..Default::default()
        };
        let packets = vec![pcr_packet(0x100, 500_000), pcr_packet(0x200, 900_000)];
        let output = run(config, packets);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("512;")); // 0x200
    }
}
