//! Client session tests against a mock ECMG on loopback TCP.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use simulcrypt::messages::{ChannelStatus, EcmResponse, Message, StreamStatus};
use simulcrypt::{EcmgClient, EcmgConfig, SimulcryptError};

/// A scripted ECMG: answers the handshake, then echoes one ECM per
/// CW_provision with the crypto-period number embedded in the datagram.
struct MockEcmg {
    addr: String,
    handle: JoinHandle<()>,
}

fn ecm_section_for(cp_number: u16, cw_current: &[u8]) -> Vec<u8> {
    // A private short-form section carrying the CP number and current CW.
    let mut body = vec![cp_number as u8, (cp_number >> 8) as u8];
    body.extend_from_slice(cw_current);
    body.resize(40, 0xEE);
    let mut section = vec![0x80, 0x30, body.len() as u8];
    section.extend_from_slice(&body);
    section
}

impl MockEcmg {
    fn start(channel_status: ChannelStatus) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, channel_status);
        });
        MockEcmg { addr, handle }
    }

    fn join(self) {
        self.handle.join().unwrap();
    }
}

fn serve(mut stream: TcpStream, channel_status: ChannelStatus) {
    use std::io::Write;
    loop {
        let message = match Message::read_from(&mut stream) {
            Ok(message) => message,
            Err(_) => return, // client went away
        };
        let reply = match message {
            Message::ChannelSetup(setup) => Some(Message::ChannelStatus(ChannelStatus {
                channel_id: setup.channel_id,
                ..channel_status.clone()
            })),
            Message::StreamSetup(setup) => Some(Message::StreamStatus(StreamStatus {
                channel_id: setup.channel_id,
                stream_id: setup.stream_id,
                ecm_id: setup.ecm_id,
                access_criteria_transfer_mode: false,
            })),
            Message::CwProvision(provision) => Some(Message::EcmResponse(EcmResponse {
                channel_id: provision.channel_id,
                stream_id: provision.stream_id,
                cp_number: provision.cp_number,
                ecm_datagram: Bytes::from(ecm_section_for(
                    provision.cp_number,
                    &provision.cw_current,
                )),
            })),
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

fn config(addr: &str) -> EcmgConfig {
    EcmgConfig {
        addr: addr.to_string(),
        super_cas_id: 0x4ADC_0001,
        cp_duration: 100,
        response_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[test]
fn handshake_captures_channel_parameters() {
    let mock = MockEcmg::start(ChannelStatus {
        delay_start: -2000,
        section_tspkt_flag: false,
        ..Default::default()
    });
    let client = EcmgClient::connect(config(&mock.addr)).unwrap();
    assert_eq!(client.channel_status().delay_start, -2000);
    assert!(!client.channel_status().section_tspkt_flag);
    assert_eq!(client.stream_status().stream_id, 1);
    client.disconnect();
    mock.join();
}

#[test]
fn generate_ecm_blocks_for_response() {
    let mock = MockEcmg::start(ChannelStatus::default());
    let client = EcmgClient::connect(config(&mock.addr)).unwrap();

    let cw_current = [0x11u8; 16];
    let response = client
        .generate_ecm(7, &cw_current, &[0x22; 16], &[])
        .unwrap();
    assert_eq!(response.cp_number, 7);
    assert_eq!(
        response.ecm_datagram[..],
        ecm_section_for(7, &cw_current)[..]
    );
    client.disconnect();
    mock.join();
}

#[test]
fn submit_ecm_fires_callback() {
    let mock = MockEcmg::start(ChannelStatus::default());
    let client = EcmgClient::connect(config(&mock.addr)).unwrap();

    let (tx, rx) = mpsc::channel();
    client
        .submit_ecm(
            3,
            &[0x33; 16],
            &[0x44; 16],
            &[0xAB],
            Box::new(move |result| {
                tx.send(result.map(|r| r.cp_number)).unwrap();
            }),
        )
        .unwrap();

    let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered.unwrap(), 3);
    client.disconnect();
    mock.join();
}

#[test]
fn channel_error_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = std::thread::spawn(move || {
        use std::io::Write;
        let (mut stream, _) = listener.accept().unwrap();
        let Ok(Message::ChannelSetup(setup)) = Message::read_from(&mut stream) else {
            panic!("expected channel_setup");
        };
        let error = Message::ChannelError {
            channel_id: setup.channel_id,
            status: 0x000D,
        };
        stream.write_all(&error.encode(2)).unwrap();
    });

    let result = EcmgClient::connect(config(&addr));
    assert!(matches!(
        result,
        Err(SimulcryptError::ChannelError { status: 0x000D })
    ));
    server.join().unwrap();
}

#[test]
fn disconnect_fails_pending_requests() {
    // A server that completes the handshake then drops the connection on
    // the first CW_provision.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = std::thread::spawn(move || {
        use std::io::Write;
        let (mut stream, _) = listener.accept().unwrap();
        loop {
            match Message::read_from(&mut stream) {
                Ok(Message::ChannelSetup(setup)) => {
                    let status = Message::ChannelStatus(ChannelStatus {
                        channel_id: setup.channel_id,
                        ..Default::default()
                    });
                    stream.write_all(&status.encode(2)).unwrap();
                }
                Ok(Message::StreamSetup(setup)) => {
                    let status = Message::StreamStatus(StreamStatus {
                        channel_id: setup.channel_id,
                        stream_id: setup.stream_id,
                        ecm_id: setup.ecm_id,
                        access_criteria_transfer_mode: false,
                    });
                    stream.write_all(&status.encode(2)).unwrap();
                }
                Ok(Message::CwProvision(_)) => return, // drop the session
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });

    let client = EcmgClient::connect(config(&addr)).unwrap();
    let result = client.generate_ecm(1, &[0x55; 16], &[0x66; 16], &[]);
    assert!(matches!(result, Err(SimulcryptError::Disconnected)));
    server.join().unwrap();
}
