//! Multiplex processor: splices packets from a secondary TS file into the
//! stuffing of the primary stream.

use std::path::PathBuf;

use tracing::{debug, error, info};
use ts::clock::{PKT_SIZE, SYSTEM_CLOCK_SUBFACTOR};
use ts::pid::PID_MAX;
use ts::{Pid, PidSet, TsPacket};
use ts_pipeline::{PacketFeedback, PacketProcessor, PacketStatus, PipelineError, StageHandle};

use crate::file::TsFileReader;

/// Multiplexer options.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Secondary TS file providing the packets to insert.
    pub path: PathBuf,
    /// Target bitrate of inserted packets in b/s (0 = replace every null).
    pub bitrate: u64,
    /// Primary packets between two insertions (0 = disabled).
    pub inter_packet: u64,
    /// Milliseconds between two insertions (0 = disabled).
    pub inter_time_ms: u64,
    /// Insertion window on the reference PID, in PTS units (0 = open).
    pub min_pts: u64,
    pub max_pts: u64,
    /// Reference PID for PTS/PCR; `None` selects the first PID carrying a
    /// PCR.
    pub pts_pid: Option<Pid>,
    /// Rewrite the PID of every inserted packet.
    pub force_pid: Option<Pid>,
    /// Rewrite continuity counters of inserted packets.
    pub update_cc: bool,
    /// Fail when an inserted PID already exists in the primary stream.
    pub check_pid_conflict: bool,
    /// Stop inserting after this many packets (0 = unlimited).
    pub max_insert_count: u64,
    /// File passes (0 = infinite).
    pub repeat: usize,
    pub byte_offset: u64,
    pub packet_offset: u64,
    /// End the pipeline when the file is exhausted.
    pub terminate: bool,
    /// Vote joint termination when the file is exhausted.
    pub joint_termination: bool,
}

impl MuxConfig {
    pub fn new(path: PathBuf) -> Self {
        MuxConfig {
            path,
            bitrate: 0,
            inter_packet: 0,
            inter_time_ms: 0,
            min_pts: 0,
            max_pts: 0,
            pts_pid: None,
            force_pid: None,
            update_cc: true,
            check_pid_conflict: true,
            max_insert_count: 0,
            repeat: 0,
            byte_offset: 0,
            packet_offset: 0,
            terminate: false,
            joint_termination: false,
        }
    }
}

/// The `mux` packet processor.
pub struct MuxProcessor {
    config: MuxConfig,
    file: Option<TsFileReader>,
    /// Insertion interval in primary packets.
    inter_pkt: u64,
    /// Insertion interval in PTS units.
    inter_time: u64,
    pts_pid: Option<Pid>,
    packet_count: u64,
    pid_next_pkt: u64,
    inserted_count: u64,
    youngest_pts: u64,
    pts_last_inserted: u64,
    pts_range_ok: bool,
    ts_pids: PidSet,
    cc: Vec<u8>,
    file_exhausted: bool,
}

impl MuxProcessor {
    pub fn new(config: MuxConfig) -> Self {
        MuxProcessor {
            config,
            file: None,
            inter_pkt: 0,
            inter_time: 0,
            pts_pid: None,
            packet_count: 0,
            pid_next_pkt: 0,
            inserted_count: 0,
            youngest_pts: 0,
            pts_last_inserted: 0,
            pts_range_ok: true,
            ts_pids: PidSet::new(),
            cc: vec![0; PID_MAX],
            file_exhausted: false,
        }
    }

    /// Re-evaluate the insertion window from the latest reference time.
    fn update_pts_range(&mut self, current_pts: u64) {
        self.youngest_pts = current_pts;

        if self.config.min_pts != 0
            && current_pts > self.config.min_pts
            && (self.config.max_pts == 0 || current_pts < self.config.max_pts)
        {
            if !self.pts_range_ok {
                debug!(pts = current_pts, "insertion window open");
            }
            self.pts_range_ok = true;
        }

        if self.inter_time != 0 && self.pts_last_inserted != 0 {
            self.pts_range_ok = self.youngest_pts > self.pts_last_inserted + self.inter_time;
        }

        if self.config.max_pts != 0 && current_pts > self.config.max_pts {
            debug!(pts = current_pts, "insertion window closed");
            self.pts_range_ok = false;
        }
    }

    /// Handle a read failure or exhaustion of the secondary file.
    fn on_file_over(&mut self, handle: &StageHandle) -> PacketStatus {
        if !self.file_exhausted {
            info!("secondary file insertion complete");
            self.file_exhausted = true;
        }
        if handle.uses_joint_termination() {
            handle.joint_terminate();
            PacketStatus::Ok
        } else if self.config.terminate {
            PacketStatus::End
        } else {
            PacketStatus::Ok
        }
    }
}

impl PacketProcessor for MuxProcessor {
    fn name(&self) -> &'static str {
        "mux"
    }

    fn start(&mut self, handle: &StageHandle) -> ts_pipeline::Result<()> {
        if (self.config.bitrate != 0) as u8
            + (self.config.inter_packet != 0) as u8
            + (self.config.inter_time_ms != 0) as u8
            > 1
        {
            return Err(PipelineError::Config(
                "bitrate, inter-packet and inter-time are mutually exclusive".into(),
            ));
        }
        if self.config.terminate && self.config.joint_termination {
            return Err(PipelineError::Config(
                "terminate and joint-termination are mutually exclusive".into(),
            ));
        }
        if self.config.joint_termination {
            handle.use_joint_termination();
        }

        self.inter_pkt = self.config.inter_packet;
        // Milliseconds to 90 kHz PTS units.
        self.inter_time = self.config.inter_time_ms * 90;
        self.pts_pid = self.config.pts_pid;
        self.packet_count = 0;
        self.pid_next_pkt = 0;
        self.inserted_count = 0;
        self.youngest_pts = 0;
        self.pts_last_inserted = 0;
        self.ts_pids.reset();
        self.cc.fill(0);
        self.file_exhausted = false;
        // Wait for the window only when a lower bound is configured.
        self.pts_range_ok = self.config.min_pts == 0;

        let offset = if self.config.byte_offset != 0 {
            self.config.byte_offset
        } else {
            self.config.packet_offset * PKT_SIZE as u64
        };
        self.file = Some(TsFileReader::open(&self.config.path, self.config.repeat, offset)?);
        Ok(())
    }

    fn process(
        &mut self,
        handle: &StageHandle,
        pkt: &mut TsPacket,
        _feedback: &mut PacketFeedback,
    ) -> ts_pipeline::Result<PacketStatus> {
        // Resolve the packet interval from the TS bitrate, once.
        if self.packet_count == 0 && self.config.bitrate != 0 {
            let ts_bitrate = handle.bitrate();
            if ts_bitrate < self.config.bitrate {
                error!(
                    ts_bitrate,
                    target = self.config.bitrate,
                    "input bitrate unknown or too low for mux insertion"
                );
                return Ok(PacketStatus::End);
            }
            self.inter_pkt = ts_bitrate / self.config.bitrate;
            debug!(ts_bitrate, inter_pkt = self.inter_pkt, "mux packet interval");
        }

        self.packet_count += 1;
        let pid = pkt.pid();

        // Reference time from this packet, if it carries one.
        let mut current_pts = 0;
        if self.pts_pid == Some(pid) && pkt.has_pts() {
            current_pts = pkt.pts().unwrap_or(0);
        } else if (self.pts_pid.is_none() || self.pts_pid == Some(pid))
            && let Some(pcr) = pkt.pcr()
        {
            // Without an explicit reference PID, the first PID carrying a
            // PCR becomes the reference.
            self.pts_pid = Some(pid);
            current_pts = pcr / SYSTEM_CLOCK_SUBFACTOR;
        }
        if current_pts > 0 {
            self.update_pts_range(current_pts);
        }

        // Non-stuffing passes through untouched.
        if !pkt.is_null() {
            self.ts_pids.set(pid);
            return Ok(PacketStatus::Ok);
        }

        if self.packet_count < self.pid_next_pkt {
            return Ok(PacketStatus::Ok);
        }
        if !self.pts_range_ok
            || (self.config.max_insert_count != 0
                && self.inserted_count >= self.config.max_insert_count)
        {
            return Ok(PacketStatus::Ok);
        }

        // Time to insert: overwrite this stuffing packet from the file.
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| PipelineError::Processing("mux not started".into()))?;
        let inserted = match file.read_packet() {
            Ok(Some(inserted)) => inserted,
            Ok(None) => return Ok(self.on_file_over(handle)),
            Err(err) => {
                error!(%err, "error reading secondary file");
                return Ok(self.on_file_over(handle));
            }
        };
        *pkt = inserted;

        self.inserted_count += 1;
        self.pts_last_inserted = self.youngest_pts;
        if self.inter_time != 0 {
            // Wait for the next reference time before reopening.
            self.pts_range_ok = false;
        }

        if let Some(forced) = self.config.force_pid {
            pkt.set_pid(forced);
        }
        let new_pid = pkt.pid();
        if self.config.check_pid_conflict && self.ts_pids.test(new_pid) {
            error!(
                pid = new_pid,
                "inserted PID already present in the primary stream"
            );
            return Ok(PacketStatus::End);
        }
        if self.config.update_cc {
            pkt.set_cc(self.cc[new_pid as usize]);
            self.cc[new_pid as usize] = (self.cc[new_pid as usize] + 1) & 0x0F;
        }

        self.pid_next_pkt += self.inter_pkt;
        Ok(PacketStatus::Ok)
    }
}
