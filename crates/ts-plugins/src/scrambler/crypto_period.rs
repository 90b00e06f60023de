//! Crypto-period state: control words, ECM acquisition and ECM packet
//! cycling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::RngCore;
use simulcrypt::{EcmgClient, EcmResponse};
use tracing::{debug, error};
use ts::clock::PKT_SIZE;
use ts::{NULL_PACKET, Pid, TsPacket, packetize_raw};

/// ECM publication slot, written by the ECMG receiver thread and read by
/// the scrambler stage.
///
/// The packet vector is fully written before `ready` is released; readers
/// acquire `ready` before touching the packets.
pub(crate) struct EcmSlot {
    packets: Mutex<Vec<TsPacket>>,
    ready: AtomicBool,
}

impl EcmSlot {
    fn new() -> Arc<Self> {
        Arc::new(EcmSlot {
            packets: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        })
    }

    fn publish(&self, packets: Vec<TsPacket>) {
        *self.packets.lock() = packets;
        // Last write: readers check this flag before the packets.
        self.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// What ECM generation needs from the scrambler.
pub(crate) struct EcmEnv {
    pub client: Arc<EcmgClient>,
    pub synchronous: bool,
    pub access_criteria: Vec<u8>,
    /// From `channel_status`: 0 = sections, 1 = TS packets.
    pub section_tspkt_flag: bool,
    pub abort: Arc<AtomicBool>,
}

/// One crypto-period: its number, both control words and its ECM.
pub(crate) struct CryptoPeriod {
    pub cp_number: u16,
    pub cw_current: Vec<u8>,
    pub cw_next: Vec<u8>,
    slot: Arc<EcmSlot>,
    /// Local copy of the ECM packets, taken once the slot is ready.
    local: Vec<TsPacket>,
    index: usize,
}

impl CryptoPeriod {
    /// Placeholder before the rotation starts.
    pub fn empty() -> Self {
        CryptoPeriod {
            cp_number: 0,
            cw_current: Vec::new(),
            cw_next: Vec::new(),
            slot: EcmSlot::new(),
            local: Vec::new(),
            index: 0,
        }
    }

    /// First crypto-period: two fresh random control words.
    pub fn init_first(cw_size: usize, env: &EcmEnv) -> Self {
        let mut cp = CryptoPeriod {
            cp_number: 0,
            cw_current: random_cw(cw_size),
            cw_next: random_cw(cw_size),
            slot: EcmSlot::new(),
            local: Vec::new(),
            index: 0,
        };
        cp.generate(env);
        cp
    }

    /// The crypto-period following `previous`: its next CW becomes current.
    pub fn init_next(previous: &CryptoPeriod, env: &EcmEnv) -> Self {
        let mut cp = CryptoPeriod {
            cp_number: previous.cp_number.wrapping_add(1),
            cw_current: previous.cw_next.clone(),
            cw_next: random_cw(previous.cw_next.len()),
            slot: EcmSlot::new(),
            local: Vec::new(),
            index: 0,
        };
        cp.generate(env);
        cp
    }

    pub fn ecm_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Next packet of the ECM cycle, retagged with the ECM PID and a live
    /// continuity counter. A null packet while the ECM is not ready.
    pub fn next_ecm_packet(&mut self, ecm_pid: Pid, ecm_cc: &mut u8) -> TsPacket {
        if !self.ecm_ready() {
            return NULL_PACKET;
        }
        if self.local.is_empty() {
            self.local = self.slot.packets.lock().clone();
            self.index = 0;
            if self.local.is_empty() {
                return NULL_PACKET;
            }
        }
        let mut pkt = self.local[self.index];
        self.index = (self.index + 1) % self.local.len();
        pkt.set_pid(ecm_pid);
        pkt.set_cc(*ecm_cc);
        *ecm_cc = (*ecm_cc + 1) & 0x0F;
        pkt
    }

    /// Request the ECM for this crypto-period from the ECMG.
    fn generate(&mut self, env: &EcmEnv) {
        let cp_number = self.cp_number;
        if env.synchronous {
            match env.client.generate_ecm(
                cp_number,
                &self.cw_current,
                &self.cw_next,
                &env.access_criteria,
            ) {
                Ok(response) => {
                    handle_ecm(&response, &self.slot, env.section_tspkt_flag, &env.abort);
                }
                Err(err) => {
                    error!(cp_number, %err, "synchronous ECM generation failed");
                    env.abort.store(true, Ordering::Release);
                }
            }
        } else {
            let slot = Arc::clone(&self.slot);
            let abort = Arc::clone(&env.abort);
            let section_tspkt_flag = env.section_tspkt_flag;
            let submitted = env.client.submit_ecm(
                cp_number,
                &self.cw_current,
                &self.cw_next,
                &env.access_criteria,
                Box::new(move |result| match result {
                    Ok(response) => handle_ecm(&response, &slot, section_tspkt_flag, &abort),
                    Err(err) => {
                        error!(cp_number, %err, "asynchronous ECM generation failed");
                        abort.store(true, Ordering::Release);
                    }
                }),
            );
            if let Err(err) = submitted {
                error!(cp_number, %err, "cannot submit CW_provision");
                env.abort.store(true, Ordering::Release);
            }
        }
    }
}

/// Turn an ECM datagram into TS packets and publish it.
///
/// May run on the ECMG receiver thread.
fn handle_ecm(response: &EcmResponse, slot: &EcmSlot, section_tspkt_flag: bool, abort: &AtomicBool) {
    let datagram = &response.ecm_datagram;
    let packets = if !section_tspkt_flag {
        // One private section, stuffed into packets.
        let declared = datagram
            .len()
            .checked_sub(3)
            .map(|_| 3 + ((((datagram[1] & 0x0F) as usize) << 8) | datagram[2] as usize));
        if declared != Some(datagram.len()) {
            error!(
                size = datagram.len(),
                "ECMG returned an invalid ECM section"
            );
            abort.store(true, Ordering::Release);
            return;
        }
        packetize_raw(datagram, 0, 0)
    } else if datagram.len() % PKT_SIZE != 0 {
        error!(
            size = datagram.len(),
            "ECM datagram is not a whole number of TS packets"
        );
        abort.store(true, Ordering::Release);
        return;
    } else {
        let mut packets = Vec::with_capacity(datagram.len() / PKT_SIZE);
        for chunk in datagram.chunks_exact(PKT_SIZE) {
            match TsPacket::from_bytes(chunk) {
                Ok(pkt) => packets.push(pkt),
                Err(err) => {
                    error!(%err, "bad TS packet in ECM datagram");
                    abort.store(true, Ordering::Release);
                    return;
                }
            }
        }
        packets
    };

    debug!(
        cp_number = response.cp_number,
        packets = packets.len(),
        "ECM ready"
    );
    slot.publish(packets);
}

fn random_cw(size: usize) -> Vec<u8> {
    let mut cw = vec![0u8; size];
    rand::rng().fill_bytes(&mut cw);
    cw
}
