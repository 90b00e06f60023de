//! Scrambler behaviour against a mock ECMG: PMT rewrite, ECM insertion,
//! transition scheduling and degraded mode.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use simulcrypt::messages::{ChannelStatus, EcmResponse, Message, StreamStatus};
use ts::packet::test_support::{payload_packet, pts_packet};
use ts::psi::pat::{Pat, PatProgram};
use ts::psi::pmt::{Pmt, PmtStream};
use ts::{CaDescriptor, NULL_PACKET, PID_PAT, Pid, Section, SectionDemux, TsPacket, packetize_section};
use ts_pipeline::test_utils::{create_realtime_test_handle, create_test_handle};
use ts_pipeline::{PacketFeedback, PacketProcessor, PacketStatus, StageHandle};
use ts_plugins::scrambler::{Scrambler, ScramblerConfig};
use ts_plugins::service::ServiceRef;

const SERVICE_ID: u16 = 7;
const PMT_PID: Pid = 0x0100;
const VIDEO_PID: Pid = 0x0101;
const SUPER_CAS_ID: u32 = 0x4ADC_0001;

/// ECM form served by the mock.
#[derive(Clone, Copy)]
enum EcmForm {
    /// One private section per ECM.
    Section,
    /// `packets` whole TS packets per ECM.
    Packets(usize),
}

/// Mock ECMG; crypto-periods at or above `gate_from` are answered only
/// after a token arrives on the gate channel.
fn start_mock(
    delay_start: i16,
    form: EcmForm,
    gate_from: u16,
) -> (String, mpsc::Sender<()>, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream, delay_start, form, gate_from, gate_rx);
    });
    (addr, gate_tx, handle)
}

fn ecm_datagram(cp_number: u16, form: EcmForm) -> Bytes {
    match form {
        EcmForm::Section => {
            let mut body = vec![cp_number as u8, (cp_number >> 8) as u8];
            body.resize(30, 0xEE);
            let mut section = vec![0x80, 0x30, body.len() as u8];
            section.extend_from_slice(&body);
            Bytes::from(section)
        }
        EcmForm::Packets(count) => {
            let mut data = Vec::with_capacity(count * 188);
            for i in 0..count {
                let mut pkt = payload_packet(0x0654, i as u8);
                // Tag each packet with its index and crypto-period
                pkt.as_bytes_mut()[4] = i as u8;
                pkt.as_bytes_mut()[5] = cp_number as u8;
                data.extend_from_slice(pkt.as_bytes());
            }
            Bytes::from(data)
        }
    }
}

fn serve(
    mut stream: TcpStream,
    delay_start: i16,
    form: EcmForm,
    gate_from: u16,
    gate: mpsc::Receiver<()>,
) {
    use std::io::Write;
    loop {
        let message = match Message::read_from(&mut stream) {
            Ok(message) => message,
            Err(_) => return,
        };
        let reply = match message {
            Message::ChannelSetup(setup) => Some(Message::ChannelStatus(ChannelStatus {
                channel_id: setup.channel_id,
                delay_start,
                section_tspkt_flag: matches!(form, EcmForm::Packets(_)),
                ..Default::default()
            })),
            Message::StreamSetup(setup) => Some(Message::StreamStatus(StreamStatus {
                channel_id: setup.channel_id,
                stream_id: setup.stream_id,
                ecm_id: setup.ecm_id,
                access_criteria_transfer_mode: false,
            })),
            Message::CwProvision(provision) => {
                if provision.cp_number >= gate_from && gate.recv().is_err() {
                    return;
                }
                Some(Message::EcmResponse(EcmResponse {
                    channel_id: provision.channel_id,
                    stream_id: provision.stream_id,
                    cp_number: provision.cp_number,
                    ecm_datagram: ecm_datagram(provision.cp_number, form),
                }))
            }
            Message::StreamCloseRequest {
                channel_id,
                stream_id,
            } => Some(Message::StreamCloseResponse {
                channel_id,
                stream_id,
            }),
            Message::ChannelClose { .. } => return,
            _ => None,
        };
        if let Some(reply) = reply {
            stream.write_all(&reply.encode(2)).unwrap();
        }
    }
}

fn psi_packets() -> Vec<TsPacket> {
    let pat = Pat {
        ts_id: 1,
        version: 0,
        nit_pid: None,
        programs: vec![PatProgram {
            service_id: SERVICE_ID,
            pmt_pid: PMT_PID,
        }],
    };
    let pmt = Pmt {
        service_id: SERVICE_ID,
        version: 1,
        pcr_pid: VIDEO_PID,
        descriptors: Vec::new(),
        streams: vec![PmtStream::new(0x1B, VIDEO_PID)],
    };
    let mut packets = packetize_section(&pat.to_section().unwrap(), PID_PAT, 0);
    packets.extend(packetize_section(&pmt.to_section().unwrap(), PMT_PID, 0));
    packets
}

fn service_config(addr: &str) -> ScramblerConfig {
    ScramblerConfig {
        service: Some(ServiceRef::Id(SERVICE_ID)),
        ecmg_addr: Some(addr.to_string()),
        super_cas_id: SUPER_CAS_ID,
        cp_duration_ms: 10_000,
        ..Default::default()
    }
}

fn drive(
    scrambler: &mut Scrambler,
    handle: &StageHandle,
    packets: impl IntoIterator<Item = TsPacket>,
) -> Vec<(TsPacket, PacketStatus)> {
    let mut out = Vec::new();
    for mut pkt in packets {
        let mut feedback = PacketFeedback::default();
        let status = scrambler.process(handle, &mut pkt, &mut feedback).unwrap();
        out.push((pkt, status));
    }
    out
}

/// Reassemble the rewritten PMT from the output packets on the PMT PID.
fn rewritten_pmt(output: &[(TsPacket, PacketStatus)]) -> Pmt {
    let mut demux = SectionDemux::new();
    demux.add_pid(PMT_PID);
    let mut sections: Vec<(Pid, Section)> = Vec::new();
    for (pkt, status) in output {
        if *status == PacketStatus::Ok && pkt.pid() == PMT_PID {
            demux.feed(pkt, &mut sections);
            if !sections.is_empty() {
                break;
            }
        }
    }
    Pmt::parse(&sections.first().expect("rewritten PMT on output").1).unwrap()
}

#[test]
fn pre_pmt_packets_are_nullified() {
    let (addr, _gate, mock) = start_mock(0, EcmForm::Section, u16::MAX);
    let handle = create_test_handle(1_000_000);
    let mut scrambler = Scrambler::new(service_config(&addr));
    scrambler.start(&handle).unwrap();

    // Nothing is known yet: every packet must be nullified.
    let out = drive(&mut scrambler, &handle, vec![pts_packet(VIDEO_PID, 1000); 5]);
    assert!(out.iter().all(|(_, status)| *status == PacketStatus::Null));

    scrambler.stop(&handle);
    mock.join().unwrap();
}

#[test]
fn pmt_rewrite_carries_ca_descriptor_and_ecm_pid() {
    let (addr, _gate, mock) = start_mock(1000, EcmForm::Section, u16::MAX);
    let handle = create_test_handle(1_000_000);
    let mut scrambler = Scrambler::new(service_config(&addr));
    scrambler.start(&handle).unwrap();

    let mut input = psi_packets();
    // Send the PMT twice so the rewritten table fully packetizes.
    input.extend(psi_packets());
    input.extend(std::iter::repeat_n(payload_packet(VIDEO_PID, 0), 10));
    let out = drive(&mut scrambler, &handle, input);

    // ECM PID allocation skips the PMT PID + 1 video PID.
    assert_eq!(scrambler.ecm_pid(), 0x0102);

    let pmt = rewritten_pmt(&out);
    let ca = pmt
        .descriptors
        .iter()
        .find(|d| d.tag == ts::descriptor::TAG_CA)
        .map(|d| CaDescriptor::parse(&d.data).unwrap())
        .expect("CA descriptor in rewritten PMT");
    assert_eq!(ca.ca_system_id, (SUPER_CAS_ID >> 16) as u16);
    assert_eq!(ca.ca_pid, 0x0102);
    // Non-CSA2 scrambling advertises itself
    assert!(
        pmt.descriptors
            .iter()
            .any(|d| d.tag == ts::descriptor::TAG_SCRAMBLING)
    );

    // Video packets after the PMT get scrambled with the even key.
    let scrambled: Vec<_> = out
        .iter()
        .filter(|(pkt, _)| pkt.pid() == VIDEO_PID && pkt.is_scrambled())
        .collect();
    assert!(!scrambled.is_empty());
    assert!(scrambled.iter().all(|(pkt, _)| pkt.scrambling_control() == 0x02));

    scrambler.stop(&handle);
    mock.join().unwrap();
}

#[test]
fn ecm_packets_cycle_with_monotonic_cc() {
    // 3-packet ECMs; ts 3 Mb/s over ECM 30 kb/s → one ECM packet per 100.
    let (addr, _gate, mock) = start_mock(1000, EcmForm::Packets(3), u16::MAX);
    let handle = create_test_handle(3_000_000);
    let mut scrambler = Scrambler::new(service_config(&addr));
    scrambler.start(&handle).unwrap();

    let mut input = psi_packets();
    for _ in 0..1000 {
        input.push(NULL_PACKET);
    }
    let out = drive(&mut scrambler, &handle, input);

    let ecm_pid = scrambler.ecm_pid();
    let ecm_packets: Vec<&TsPacket> = out
        .iter()
        .filter(|(pkt, _)| pkt.pid() == ecm_pid)
        .map(|(pkt, _)| pkt)
        .collect();
    assert!(ecm_packets.len() >= 9, "got {}", ecm_packets.len());

    for (i, pkt) in ecm_packets.iter().enumerate() {
        // Payload cycles 0,1,2,0,1,2…; CC increments mod 16.
        assert_eq!(pkt.as_bytes()[4], (i % 3) as u8);
        assert_eq!(pkt.cc(), (i % 16) as u8);
    }

    // Insertion pacing: one ECM packet every ~100 packets.
    let positions: Vec<usize> = out
        .iter()
        .enumerate()
        .filter(|(_, (pkt, _))| pkt.pid() == ecm_pid)
        .map(|(i, _)| i)
        .collect();
    for pair in positions.windows(2) {
        let gap = pair[1] - pair[0];
        assert!((95..=105).contains(&gap), "gap {gap}");
    }

    scrambler.stop(&handle);
    mock.join().unwrap();
}

#[test]
fn negative_delay_start_broadcasts_next_ecm_before_cw_change() {
    // 1 Mb/s: cp(10 s) ≈ 6648 packets, |delay_start|(2 s) ≈ 1329 packets.
    let (addr, _gate, mock) = start_mock(-2000, EcmForm::Packets(1), u16::MAX);
    let handle = create_test_handle(1_000_000);
    let mut scrambler = Scrambler::new(service_config(&addr));
    scrambler.start(&handle).unwrap();

    let mut input = psi_packets();
    for i in 0..16_000u32 {
        input.push(if i % 2 == 0 {
            payload_packet(VIDEO_PID, (i / 2 % 16) as u8)
        } else {
            NULL_PACKET
        });
    }
    let out = drive(&mut scrambler, &handle, input);
    let ecm_pid = scrambler.ecm_pid();

    // First index where the broadcast ECM switches to crypto-period 1.
    let ecm_switch = out
        .iter()
        .position(|(pkt, _)| pkt.pid() == ecm_pid && pkt.as_bytes()[5] == 1)
        .expect("ECM(1) broadcast");
    // First index scrambled with the odd key (crypto-period 1).
    let cw_switch = out
        .iter()
        .position(|(pkt, _)| pkt.pid() == VIDEO_PID && pkt.scrambling_control() == 0x03)
        .expect("odd-parity scrambling");

    assert!(
        ecm_switch < cw_switch,
        "ECM(1) at {ecm_switch}, CW(1) at {cw_switch}"
    );
    // The lead is about 2 s worth of packets (insertion granularity aside).
    let lead = cw_switch - ecm_switch;
    assert!((1200..=1500).contains(&lead), "lead {lead}");

    scrambler.stop(&handle);
    mock.join().unwrap();
}

#[test]
fn late_ecm_enters_and_leaves_degraded_mode() {
    // Async mode (realtime handle); ECMs from crypto-period 2 are gated.
    let (addr, gate, mock) = start_mock(1000, EcmForm::Packets(1), 2);
    let handle = create_realtime_test_handle(1_000_000);
    let mut scrambler = Scrambler::new(service_config(&addr));
    scrambler.start(&handle).unwrap();

    let drive_chunk = |scrambler: &mut Scrambler, count: u32, phase: u32| -> Vec<TsPacket> {
        let mut chunk = Vec::with_capacity(count as usize);
        for i in 0..count {
            chunk.push(if (phase + i) % 2 == 0 {
                payload_packet(VIDEO_PID, 0)
            } else {
                NULL_PACKET
            });
        }
        drive(scrambler, &handle, chunk)
            .into_iter()
            .map(|(pkt, _)| pkt)
            .collect()
    };

    let mut out = drive(&mut scrambler, &handle, psi_packets())
        .into_iter()
        .map(|(pkt, _)| pkt)
        .collect::<Vec<_>>();
    // Wait for the asynchronous ECMs of periods 0 and 1.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !out.iter().any(|p| p.pid() == scrambler.ecm_pid()) {
        assert!(std::time::Instant::now() < deadline, "no ECM broadcast");
        std::thread::sleep(Duration::from_millis(10));
        out.extend(drive_chunk(&mut scrambler, 100, 0));
    }

    // Push far past two crypto-periods: with ECM(2) gated, the second CW
    // change cannot happen, so nothing is ever scrambled with the even key
    // of crypto-period 2 — parity stays odd.
    let mut parities = Vec::new();
    for _ in 0..20 {
        let chunk = drive_chunk(&mut scrambler, 1000, 0);
        parities.extend(
            chunk
                .iter()
                .filter(|p| p.pid() == VIDEO_PID && p.is_scrambled())
                .map(|p| p.scrambling_control()),
        );
    }
    assert_eq!(*parities.last().unwrap(), 0x03, "stuck on crypto-period 1");

    // Release the gate: ECM(2) arrives, degraded mode exits and the CW
    // changes back to even parity.
    gate.send(()).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut last_parity = 0x03;
    while last_parity != 0x02 {
        assert!(
            std::time::Instant::now() < deadline,
            "never left degraded mode"
        );
        std::thread::sleep(Duration::from_millis(10));
        let chunk = drive_chunk(&mut scrambler, 500, 0);
        if let Some(parity) = chunk
            .iter()
            .filter(|p| p.pid() == VIDEO_PID && p.is_scrambled())
            .map(|p| p.scrambling_control())
            .next_back()
        {
            last_parity = parity;
        }
    }

    drop(gate);
    scrambler.stop(&handle);
    mock.join().unwrap();
}

#[test]
fn ecm_pid_conflict_with_input_aborts() {
    let (addr, _gate, mock) = start_mock(0, EcmForm::Section, u16::MAX);
    let handle = create_test_handle(1_000_000);
    let mut config = service_config(&addr);
    config.ecm_pid = Some(0x0200);
    let mut scrambler = Scrambler::new(config);
    scrambler.start(&handle).unwrap();

    let out = drive(&mut scrambler, &handle, vec![payload_packet(0x0200, 0)]);
    assert_eq!(out[0].1, PacketStatus::End);

    scrambler.stop(&handle);
    mock.join().unwrap();
}

#[test]
fn fixed_cw_pid_list_partial_scrambling() {
    let handle = create_test_handle(0);
    let config = ScramblerConfig {
        pids: vec![VIDEO_PID],
        cw: Some(vec![0x42; 16]),
        partial_scrambling: 3,
        ..Default::default()
    };
    let mut scrambler = Scrambler::new(config);
    scrambler.start(&handle).unwrap();

    let input: Vec<TsPacket> = (0..30)
        .map(|i| payload_packet(VIDEO_PID, (i % 16) as u8))
        .chain((0..10).map(|i| payload_packet(0x0300, i % 16)))
        .collect();
    let out = drive(&mut scrambler, &handle, input);

    // 1 packet out of every 3 eligible is scrambled: ⌈30/3⌉ = 10.
    let scrambled = out
        .iter()
        .filter(|(pkt, _)| pkt.pid() == VIDEO_PID && pkt.is_scrambled())
        .count();
    assert_eq!(scrambled, 10);
    // Other PIDs stay in the clear.
    assert!(
        out.iter()
            .filter(|(pkt, _)| pkt.pid() == 0x0300)
            .all(|(pkt, _)| !pkt.is_scrambled())
    );
    scrambler.stop(&handle);
}
