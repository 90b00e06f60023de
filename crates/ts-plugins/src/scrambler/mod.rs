//! DVB scrambler processor: crypto-period rotation, ECM insertion, PMT
//! rewriting.
//!
//! Two crypto-periods rotate through `cp[0]`/`cp[1]`. During cp(N),
//! scrambling uses CW(N); the broadcast ECM starts before or after the CW
//! change depending on the sign of the ECMG's `delay_start`. When the next
//! ECM is late, the scrambler enters degraded mode: no transition happens
//! and the current CW and ECM stay in use until the ECM arrives.

mod crypto_period;
mod scrambling;

pub use scrambling::{CommonScrambling, IdsaScrambling, ScramblingMode, TsScrambling};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use simulcrypt::{EcmgClient, EcmgConfig};
use tracing::{debug, error, info, warn};
use ts::clock::packet_distance;
use ts::descriptor::DescriptorRef;
use ts::{
    CaDescriptor, CyclingPacketizer, PID_NULL, Pid, PidSet, Pmt, ScramblingDescriptor, TsPacket,
};
use ts_pipeline::{PacketFeedback, PacketProcessor, PacketStatus, PipelineError, StageHandle};

use crate::service::{ServiceDiscovery, ServiceRef};
use crypto_period::{CryptoPeriod, EcmEnv};

/// Default ECM PID bitrate in b/s.
pub const DEFAULT_ECM_BITRATE: u64 = 30_000;
/// Default crypto-period duration in milliseconds.
pub const DEFAULT_CP_DURATION_MS: u64 = 10_000;

/// Scrambler options.
#[derive(Debug, Clone)]
pub struct ScramblerConfig {
    /// Service to scramble; exclusive with `pids`.
    pub service: Option<ServiceRef>,
    /// Explicit PIDs to scramble with a fixed control word.
    pub pids: Vec<Pid>,
    /// Fixed control word; required with `pids`.
    pub cw: Option<Vec<u8>>,
    pub mode: ScramblingMode,
    /// `host:port` of the ECM generator.
    pub ecmg_addr: Option<String>,
    pub super_cas_id: u32,
    pub channel_id: u16,
    pub stream_id: u16,
    pub ecm_id: u16,
    /// ECMG ⇔ SCS protocol version (2 or 3).
    pub ecmg_version: u8,
    pub cp_duration_ms: u64,
    pub ecm_bitrate: u64,
    /// Fixed ECM PID; allocated after the PMT PID when unset.
    pub ecm_pid: Option<Pid>,
    pub access_criteria: Vec<u8>,
    /// Private data of the inserted CA_descriptor.
    pub ca_private_data: Vec<u8>,
    /// Put the CA_descriptor on each scrambled component instead of the
    /// program level.
    pub component_level: bool,
    pub scramble_audio: bool,
    pub scramble_video: bool,
    pub scramble_subtitles: bool,
    /// Scramble one packet out of this many (1 = all).
    pub partial_scrambling: u64,
    /// Pass packets that are already scrambled instead of failing.
    pub ignore_scrambled: bool,
    /// Force synchronous ECM generation (always on offline).
    pub synchronous: bool,
}

impl Default for ScramblerConfig {
    fn default() -> Self {
        ScramblerConfig {
            service: None,
            pids: Vec::new(),
            cw: None,
            mode: ScramblingMode::default(),
            ecmg_addr: None,
            super_cas_id: 0,
            channel_id: 1,
            stream_id: 1,
            ecm_id: 1,
            ecmg_version: 2,
            cp_duration_ms: DEFAULT_CP_DURATION_MS,
            ecm_bitrate: DEFAULT_ECM_BITRATE,
            ecm_pid: None,
            access_criteria: Vec::new(),
            ca_private_data: Vec::new(),
            component_level: false,
            scramble_audio: true,
            scramble_video: true,
            scramble_subtitles: false,
            partial_scrambling: 1,
            ignore_scrambled: false,
            synchronous: false,
        }
    }
}

/// The `scrambler` packet processor.
pub struct Scrambler {
    config: ScramblerConfig,
    service: Option<ServiceDiscovery>,
    scrambling: Option<TsScrambling>,
    client: Option<Arc<EcmgClient>>,
    env: Option<EcmEnv>,
    abort: Arc<AtomicBool>,

    need_cp: bool,
    need_ecm: bool,
    delay_start_ms: i64,
    partial_scrambling: u64,

    degraded: bool,
    packet_count: u64,
    scrambled_count: u64,
    partial_clear: u64,
    pkt_insert_ecm: u64,
    pkt_change_cw: u64,
    pkt_change_ecm: u64,
    ts_bitrate: u64,
    ecm_cc: u8,
    ecm_pid: Pid,
    scrambled_pids: PidSet,
    conflict_pids: PidSet,
    input_pids: PidSet,
    cp: [CryptoPeriod; 2],
    current_cw: usize,
    current_ecm: usize,
    pzer_pmt: CyclingPacketizer,
    update_pmt: bool,
}

impl Scrambler {
    pub fn new(config: ScramblerConfig) -> Self {
        Scrambler {
            config,
            service: None,
            scrambling: None,
            client: None,
            env: None,
            abort: Arc::new(AtomicBool::new(false)),
            need_cp: false,
            need_ecm: false,
            delay_start_ms: 0,
            partial_scrambling: 1,
            degraded: false,
            packet_count: 0,
            scrambled_count: 0,
            partial_clear: 0,
            pkt_insert_ecm: 0,
            pkt_change_cw: 0,
            pkt_change_ecm: 0,
            ts_bitrate: 0,
            ecm_cc: 0,
            ecm_pid: PID_NULL,
            scrambled_pids: PidSet::new(),
            conflict_pids: PidSet::new(),
            input_pids: PidSet::new(),
            cp: [CryptoPeriod::empty(), CryptoPeriod::empty()],
            current_cw: 0,
            current_ecm: 0,
            pzer_pmt: CyclingPacketizer::new(PID_NULL),
            update_pmt: false,
        }
    }

    /// PID allocated (or configured) for ECM broadcast.
    pub fn ecm_pid(&self) -> Pid {
        self.ecm_pid
    }

    fn next_ecm(&self) -> &CryptoPeriod {
        &self.cp[self.current_ecm ^ 1]
    }

    /// Check degraded mode, entering it when the next ECM is late.
    fn in_degraded_mode(&mut self) -> bool {
        if !self.need_ecm {
            false
        } else if self.degraded {
            true
        } else if self.next_ecm().ecm_ready() {
            false
        } else {
            warn!("next ECM not ready, entering degraded mode");
            self.degraded = true;
            true
        }
    }

    /// Generate the following crypto-period into the free slot.
    fn spawn_next(&mut self) {
        let Some(env) = &self.env else { return };
        let next = CryptoPeriod::init_next(&self.cp[self.current_cw], env);
        self.cp[self.current_cw ^ 1] = next;
    }

    /// Switch scrambling to the next control word. False on failure.
    fn change_cw(&mut self) -> bool {
        if self.in_degraded_mode() {
            return true;
        }
        self.current_cw ^= 1;
        let cp_number = self.cp[self.current_cw].cp_number;
        let Some(scrambling) = &mut self.scrambling else {
            return false;
        };
        scrambling.set_encrypt_parity(cp_number);
        if self.need_ecm {
            let cw = self.cp[self.current_cw].cw_current.clone();
            if let Err(err) = scrambling.set_cw(&cw, cp_number) {
                error!(cp_number, %err, "cannot load control word");
                return false;
            }
        }
        debug!(cp_number, "control word changed");
        if self.need_cp {
            self.pkt_change_cw =
                self.packet_count + packet_distance(self.ts_bitrate, self.config.cp_duration_ms);
        }
        if self.need_ecm && self.current_ecm == self.current_cw {
            self.spawn_next();
        }
        true
    }

    /// Switch the broadcast ECM to the next crypto-period.
    fn change_ecm(&mut self) {
        if self.need_ecm && !self.in_degraded_mode() {
            self.current_ecm ^= 1;
            self.pkt_change_ecm =
                self.packet_count + packet_distance(self.ts_bitrate, self.config.cp_duration_ms);
            debug!(
                cp_number = self.cp[self.current_ecm].cp_number,
                "ECM changed"
            );
            if self.current_ecm == self.current_cw {
                self.spawn_next();
            }
        }
    }

    /// Leave degraded mode once the late ECM has arrived. False on failure.
    fn try_exit_degraded_mode(&mut self) -> bool {
        if !self.degraded {
            return true;
        }
        if !self.next_ecm().ecm_ready() {
            return true;
        }
        info!("next ECM ready, exiting degraded mode");
        self.degraded = false;

        let delay = packet_distance(self.ts_bitrate, self.delay_start_ms.unsigned_abs());
        if self.delay_start_ms < 0 {
            // ECM first, CW change postponed by the lead time.
            self.change_ecm();
            self.pkt_change_cw = self.packet_count + delay;
            true
        } else {
            let ok = self.change_cw();
            self.pkt_change_ecm = self.packet_count + delay;
            ok
        }
    }

    fn handle_pmt(&mut self, table: Pmt) {
        // Scheduling needs a known bitrate.
        if self.ts_bitrate == 0 && (self.need_cp || self.need_ecm) {
            error!("unknown bitrate, cannot schedule crypto-periods");
            self.abort.store(true, Ordering::Release);
            return;
        }
        let pmt_pid = self
            .service
            .as_ref()
            .and_then(|s| s.pmt_pid())
            .unwrap_or(PID_NULL);

        let mut pmt = table;
        self.scrambled_pids.reset();
        for stream in &pmt.streams {
            self.input_pids.set(stream.pid);
            if (self.config.scramble_audio && stream.is_audio())
                || (self.config.scramble_video && stream.is_video())
                || (self.config.scramble_subtitles && stream.is_subtitles())
            {
                info!(pid = stream.pid, "starting scrambling PID");
                self.scrambled_pids.set(stream.pid);
            }
        }
        if self.scrambled_pids.none() {
            error!("no PID to scramble in service");
            self.abort.store(true, Ordering::Release);
            return;
        }

        // Allocate the ECM PID right after the PMT PID.
        if self.need_ecm && self.ecm_pid == PID_NULL {
            let mut candidate = pmt_pid + 1;
            while candidate < PID_NULL && self.input_pids.test(candidate) {
                candidate += 1;
            }
            if candidate >= PID_NULL {
                error!("cannot find an unused PID for ECM broadcast");
                self.abort.store(true, Ordering::Release);
                return;
            }
            info!(ecm_pid = candidate, "ECM PID allocated");
            self.ecm_pid = candidate;
        }

        // Advertise non-default scrambling algorithms.
        if self.config.mode != ScramblingMode::DvbCsa2 {
            self.update_pmt = true;
            pmt.descriptors
                .push(ScramblingDescriptor::new(self.config.mode.descriptor_mode()).to_descriptor());
        }

        if self.need_ecm {
            self.update_pmt = true;
            let ca = CaDescriptor::new((self.config.super_cas_id >> 16) as u16, self.ecm_pid)
                .with_private_data(self.config.ca_private_data.clone());
            if self.config.component_level {
                let desc: DescriptorRef = ca.to_descriptor();
                for stream in &mut pmt.streams {
                    if self.scrambled_pids.test(stream.pid) {
                        stream.descriptors.push(desc.clone());
                    }
                }
            } else {
                pmt.descriptors.push(ca.to_descriptor());
            }
        }

        if self.update_pmt {
            match pmt.to_section() {
                Ok(section) => {
                    self.pzer_pmt.set_pid(pmt_pid);
                    self.pzer_pmt.set_sections(vec![section]);
                }
                Err(err) => {
                    error!(%err, "cannot rebuild PMT");
                    self.abort.store(true, Ordering::Release);
                    return;
                }
            }
        }

        // Schedule the first transitions.
        if self.need_cp {
            self.pkt_change_cw =
                self.packet_count + packet_distance(self.ts_bitrate, self.config.cp_duration_ms);
        }
        if self.need_ecm {
            self.pkt_insert_ecm = self.packet_count;
            let delay = packet_distance(self.ts_bitrate, self.delay_start_ms.unsigned_abs());
            self.pkt_change_ecm = if self.delay_start_ms > 0 {
                self.pkt_change_cw + delay
            } else {
                self.pkt_change_cw.saturating_sub(delay)
            };
        }
    }
}

impl PacketProcessor for Scrambler {
    fn name(&self) -> &'static str {
        "scrambler"
    }

    fn start(&mut self, handle: &StageHandle) -> ts_pipeline::Result<()> {
        let use_service = self.config.service.is_some();
        if use_service == !self.config.pids.is_empty() {
            return Err(PipelineError::Config(
                "specify either a service or a list of PIDs".into(),
            ));
        }
        if !self.config.pids.is_empty() && self.config.cw.is_none() {
            return Err(PipelineError::Config(
                "a fixed control word is required to scramble an explicit PID list".into(),
            ));
        }
        if self.config.partial_scrambling == 0 {
            return Err(PipelineError::Config("partial-scrambling must be >= 1".into()));
        }

        self.abort.store(false, Ordering::Release);
        self.degraded = false;
        self.packet_count = 0;
        self.scrambled_count = 0;
        self.partial_clear = 0;
        self.pkt_insert_ecm = 0;
        self.pkt_change_cw = 0;
        self.pkt_change_ecm = 0;
        self.ts_bitrate = 0;
        self.ecm_cc = 0;
        self.update_pmt = false;
        self.partial_scrambling = self.config.partial_scrambling;
        self.ecm_pid = self.config.ecm_pid.unwrap_or(PID_NULL);
        self.conflict_pids.reset();
        self.scrambled_pids = self.config.pids.iter().copied().collect();

        // Fixed single CW: no crypto-period rotation, no ECM.
        self.need_cp = self.config.cw.is_none();
        self.need_ecm = use_service && self.config.cw.is_none();

        let mut scrambling = TsScrambling::new(self.config.mode)?;
        if let Some(cw) = &self.config.cw {
            scrambling.set_cw(cw, 0)?;
        }
        scrambling.set_encrypt_parity(0);
        self.scrambling = Some(scrambling);

        // Reserved PIDs are never allocated for ECM.
        self.input_pids.reset();
        self.input_pids.set(PID_NULL);
        for pid in 0..=0x001F {
            self.input_pids.set(pid);
        }

        if self.need_ecm {
            let addr = self.config.ecmg_addr.clone().ok_or_else(|| {
                PipelineError::Config("an ECMG address is required without a fixed control word".into())
            })?;
            if self.config.ecm_bitrate == 0 {
                return Err(PipelineError::Config("ecm-bitrate must be > 0".into()));
            }
            let synchronous = self.config.synchronous || !handle.is_realtime();
            let client = EcmgClient::connect(EcmgConfig {
                addr,
                super_cas_id: self.config.super_cas_id,
                channel_id: self.config.channel_id,
                stream_id: self.config.stream_id,
                ecm_id: self.config.ecm_id,
                cp_duration: (self.config.cp_duration_ms / 100) as u16,
                version: self.config.ecmg_version,
                ..Default::default()
            })
            .map_err(|err| PipelineError::Processing(format!("ECMG connection failed: {err}")))?;

            let status = client.channel_status().clone();
            self.delay_start_ms = status.delay_start as i64;
            // The ECM lead time must fit inside half a crypto-period.
            if self.delay_start_ms.unsigned_abs() > self.config.cp_duration_ms / 2 {
                client.disconnect();
                return Err(PipelineError::Config(format!(
                    "crypto-period too short for this CAS, must be at least {} ms",
                    2 * self.delay_start_ms.unsigned_abs()
                )));
            }
            debug!(
                cp_duration_ms = self.config.cp_duration_ms,
                delay_start_ms = self.delay_start_ms,
                "crypto-period schedule"
            );

            let env = EcmEnv {
                client: Arc::clone(&client),
                synchronous,
                access_criteria: self.config.access_criteria.clone(),
                section_tspkt_flag: status.section_tspkt_flag,
                abort: Arc::clone(&self.abort),
            };

            self.current_cw = 0;
            self.current_ecm = 0;
            let cw_size = self.config.mode.cw_size();
            self.cp[0] = CryptoPeriod::init_first(cw_size, &env);
            if self.abort.load(Ordering::Acquire) {
                client.disconnect();
                return Err(PipelineError::Processing("initial ECM generation failed".into()));
            }
            let scrambling = self.scrambling.as_mut().ok_or_else(|| {
                PipelineError::Processing("scrambling engine missing".into())
            })?;
            scrambling.set_cw(&self.cp[0].cw_current, 0)?;
            scrambling.set_encrypt_parity(0);
            let second = CryptoPeriod::init_next(&self.cp[0], &env);
            self.cp[1] = second;

            self.env = Some(env);
            self.client = Some(client);
        }

        self.service = self
            .config
            .service
            .as_ref()
            .map(|target| ServiceDiscovery::new(target.clone()));
        Ok(())
    }

    fn process(
        &mut self,
        handle: &StageHandle,
        pkt: &mut TsPacket,
        _feedback: &mut PacketFeedback,
    ) -> ts_pipeline::Result<PacketStatus> {
        self.packet_count += 1;
        let pid = pkt.pid();
        self.input_pids.set(pid);

        // Keep the last known bitrate.
        let bitrate = handle.bitrate();
        if bitrate != 0 {
            self.ts_bitrate = bitrate;
        }

        // Service discovery; a (re)received PMT reconfigures the stage.
        let pmt = match &mut self.service {
            Some(service) => service.feed(pkt),
            None => None,
        };
        if let Some(pmt) = pmt {
            self.handle_pmt(pmt);
        }

        if self.abort.load(Ordering::Acquire)
            || self.service.as_ref().is_some_and(|s| s.nonexistent())
        {
            return Ok(PacketStatus::End);
        }

        // The allocated ECM PID must not collide with input traffic.
        if self.ecm_pid != PID_NULL && pid == self.ecm_pid {
            error!(pid, "ECM PID allocation conflict with input PID");
            return Ok(PacketStatus::End);
        }

        // Until the PMT tells which PIDs to scramble, nothing may leak.
        if self.scrambled_pids.none() {
            return Ok(PacketStatus::Null);
        }

        // Replace PMT packets with the rewritten table.
        if self.update_pmt && pid == self.pzer_pmt.pid() {
            *pkt = self.pzer_pmt.next_packet();
            return Ok(PacketStatus::Ok);
        }

        // Crypto-period transitions.
        if self.need_cp && self.packet_count >= self.pkt_change_cw && !self.change_cw() {
            return Ok(PacketStatus::End);
        }
        if self.need_ecm && self.packet_count >= self.pkt_change_ecm {
            self.change_ecm();
        }

        // ECM insertion into stuffing, paced by the ECM bitrate.
        if self.need_ecm && pid == PID_NULL && self.packet_count >= self.pkt_insert_ecm {
            self.pkt_insert_ecm += (self.ts_bitrate / self.config.ecm_bitrate).max(1);
            if !self.try_exit_degraded_mode() {
                return Ok(PacketStatus::End);
            }
            *pkt = self.cp[self.current_ecm].next_ecm_packet(self.ecm_pid, &mut self.ecm_cc);
            return Ok(PacketStatus::Ok);
        }

        if !pkt.has_payload() || !self.scrambled_pids.test(pid) {
            return Ok(PacketStatus::Ok);
        }

        if pkt.is_scrambled() {
            if self.config.ignore_scrambled {
                if !self.conflict_pids.test(pid) {
                    warn!(pid, "input packets already scrambled, ignored");
                    self.conflict_pids.set(pid);
                }
                return Ok(PacketStatus::Ok);
            }
            error!(pid, "packet already scrambled");
            return Ok(PacketStatus::End);
        }

        // Partial scrambling keeps a run of packets in the clear.
        if self.partial_clear > 0 {
            self.partial_clear -= 1;
            return Ok(PacketStatus::Ok);
        }
        self.partial_clear = self.partial_scrambling - 1;

        let Some(scrambling) = &mut self.scrambling else {
            return Ok(PacketStatus::End);
        };
        if let Err(err) = scrambling.encrypt_packet(pkt) {
            error!(%err, "scrambling failed");
            return Ok(PacketStatus::End);
        }
        self.scrambled_count += 1;
        Ok(PacketStatus::Ok)
    }

    fn stop(&mut self, _handle: &StageHandle) {
        if let Some(client) = self.client.take() {
            client.disconnect();
        }
        self.env = None;
        debug!(
            scrambled = self.scrambled_count,
            pids = self.scrambled_pids.count(),
            "scrambler stopped"
        );
    }
}
