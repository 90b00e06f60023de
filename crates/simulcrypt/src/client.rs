use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::messages::{
    ChannelSetup, ChannelStatus, CwProvision, EcmResponse, Message, StreamSetup, StreamStatus,
};
use crate::{Result, SimulcryptError};

/// Callback invoked when an asynchronously submitted ECM completes.
///
/// Runs on the client's receiver thread.
pub type EcmHandler = Box<dyn FnOnce(Result<EcmResponse>) + Send + 'static>;

/// ECMG session parameters.
#[derive(Debug, Clone)]
pub struct EcmgConfig {
    /// `host:port` of the ECM generator.
    pub addr: String,
    pub super_cas_id: u32,
    pub channel_id: u16,
    pub stream_id: u16,
    pub ecm_id: u16,
    /// Nominal crypto-period duration in 100 ms units.
    pub cp_duration: u16,
    /// Protocol version, 2 or 3.
    pub version: u8,
    pub response_timeout: Duration,
}

impl Default for EcmgConfig {
    fn default() -> Self {
        EcmgConfig {
            addr: String::new(),
            super_cas_id: 0,
            channel_id: 1,
            stream_id: 1,
            ecm_id: 1,
            cp_duration: 100,
            version: 2,
            response_timeout: Duration::from_secs(10),
        }
    }
}

enum Pending {
    Sync,
    Async(EcmHandler),
}

#[derive(Default)]
struct SessionState {
    pending: HashMap<u16, Pending>,
    sync_results: HashMap<u16, Result<EcmResponse>>,
    closed: bool,
}

/// A connected ECMG ⇔ SCS session.
///
/// The session owns a receiver thread that dispatches `ECM_response`
/// messages to blocked `generate_ecm` callers and to `submit_ecm`
/// callbacks, and answers channel/stream tests.
pub struct EcmgClient {
    config: EcmgConfig,
    writer: Mutex<TcpStream>,
    state: Mutex<SessionState>,
    response: Condvar,
    channel_status: ChannelStatus,
    stream_status: StreamStatus,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl EcmgClient {
    /// Connect and bring up the channel and the stream.
    ///
    /// Blocks through `channel_setup → channel_status` and `stream_setup →
    /// stream_status`, then starts the receiver thread.
    pub fn connect(config: EcmgConfig) -> Result<Arc<EcmgClient>> {
        let addr = config
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SimulcryptError::Protocol(format!("cannot resolve `{}`", config.addr)))?;
        let mut stream = TcpStream::connect_timeout(&addr, config.response_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.response_timeout))?;

        // Channel bring-up.
        write_message(&mut stream, config.version, &Message::ChannelSetup(ChannelSetup {
            channel_id: config.channel_id,
            super_cas_id: config.super_cas_id,
        }))?;
        let channel_status = match Message::read_from(&mut stream)? {
            Message::ChannelStatus(status) => status,
            Message::ChannelError { status, .. } => {
                return Err(SimulcryptError::ChannelError { status });
            }
            other => return Err(SimulcryptError::UnexpectedMessage(other.message_type())),
        };
        debug!(
            delay_start = channel_status.delay_start,
            section_tspkt_flag = channel_status.section_tspkt_flag,
            "ECMG channel established"
        );

        // Stream bring-up.
        write_message(&mut stream, config.version, &Message::StreamSetup(StreamSetup {
            channel_id: config.channel_id,
            stream_id: config.stream_id,
            ecm_id: config.ecm_id,
            nominal_cp_duration: config.cp_duration,
        }))?;
        let stream_status = match Message::read_from(&mut stream)? {
            Message::StreamStatus(status) => status,
            Message::StreamError { status, .. } => {
                return Err(SimulcryptError::StreamError { status });
            }
            other => return Err(SimulcryptError::UnexpectedMessage(other.message_type())),
        };

        stream.set_read_timeout(None)?;
        let reader_stream = stream.try_clone()?;

        let client = Arc::new(EcmgClient {
            config,
            writer: Mutex::new(stream),
            state: Mutex::new(SessionState::default()),
            response: Condvar::new(),
            channel_status,
            stream_status,
            reader: Mutex::new(None),
        });

        let thread_client = Arc::clone(&client);
        let handle = std::thread::Builder::new()
            .name("ecmg-client".to_string())
            .spawn(move || thread_client.receive_loop(reader_stream))?;
        *client.reader.lock() = Some(handle);

        Ok(client)
    }

    /// Channel parameters negotiated at setup.
    pub fn channel_status(&self) -> &ChannelStatus {
        &self.channel_status
    }

    pub fn stream_status(&self) -> &StreamStatus {
        &self.stream_status
    }

    /// Blocking ECM generation for one crypto-period.
    pub fn generate_ecm(
        &self,
        cp_number: u16,
        cw_current: &[u8],
        cw_next: &[u8],
        access_criteria: &[u8],
    ) -> Result<EcmResponse> {
        self.register(cp_number, Pending::Sync)?;
        if let Err(err) = self.send_provision(cp_number, cw_current, cw_next, access_criteria) {
            self.state.lock().pending.remove(&cp_number);
            return Err(err);
        }

        let deadline = Instant::now() + self.config.response_timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.sync_results.remove(&cp_number) {
                return result;
            }
            if state.closed {
                return Err(SimulcryptError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                state.pending.remove(&cp_number);
                return Err(SimulcryptError::Timeout(self.config.response_timeout));
            }
            self.response.wait_for(&mut state, deadline - now);
        }
    }

    /// Asynchronous ECM generation; the handler runs on the receiver thread.
    pub fn submit_ecm(
        &self,
        cp_number: u16,
        cw_current: &[u8],
        cw_next: &[u8],
        access_criteria: &[u8],
        handler: EcmHandler,
    ) -> Result<()> {
        self.register(cp_number, Pending::Async(handler))?;
        if let Err(err) = self.send_provision(cp_number, cw_current, cw_next, access_criteria) {
            self.state.lock().pending.remove(&cp_number);
            return Err(err);
        }
        Ok(())
    }

    /// Close the session and join the receiver thread.
    pub fn disconnect(&self) {
        {
            let mut writer = self.writer.lock();
            let version = self.config.version;
            let _ = write_message(&mut writer, version, &Message::StreamCloseRequest {
                channel_id: self.config.channel_id,
                stream_id: self.config.stream_id,
            });
            let _ = write_message(&mut writer, version, &Message::ChannelClose {
                channel_id: self.config.channel_id,
            });
            let _ = writer.shutdown(Shutdown::Both);
        }
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn register(&self, cp_number: u16, pending: Pending) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SimulcryptError::Disconnected);
        }
        state.pending.insert(cp_number, pending);
        Ok(())
    }

    fn send_provision(
        &self,
        cp_number: u16,
        cw_current: &[u8],
        cw_next: &[u8],
        access_criteria: &[u8],
    ) -> Result<()> {
        trace!(cp_number, "CW_provision");
        let message = Message::CwProvision(CwProvision {
            channel_id: self.config.channel_id,
            stream_id: self.config.stream_id,
            cp_number,
            cw_current: cw_current.to_vec(),
            cw_next: cw_next.to_vec(),
            access_criteria: access_criteria.to_vec(),
            cp_duration: self.config.cp_duration,
        });
        write_message(&mut self.writer.lock(), self.config.version, &message)
    }

    fn receive_loop(&self, mut stream: TcpStream) {
        loop {
            match Message::read_from(&mut stream) {
                Ok(Message::EcmResponse(response)) => {
                    trace!(cp_number = response.cp_number, "ECM_response");
                    self.resolve(response.cp_number, Ok(response));
                }
                Ok(Message::ChannelTest { .. }) => {
                    let status = Message::ChannelStatus(self.channel_status.clone());
                    let _ = write_message(&mut self.writer.lock(), self.config.version, &status);
                }
                Ok(Message::StreamTest { .. }) => {
                    let status = Message::StreamStatus(self.stream_status.clone());
                    let _ = write_message(&mut self.writer.lock(), self.config.version, &status);
                }
                Ok(Message::ChannelError { status, .. }) => {
                    warn!(status, "channel error from ECMG");
                    self.fail_all(|| SimulcryptError::ChannelError { status });
                    return;
                }
                Ok(Message::StreamError { status, .. }) => {
                    warn!(status, "stream error from ECMG");
                    self.fail_all(|| SimulcryptError::StreamError { status });
                    return;
                }
                Ok(Message::StreamCloseResponse { .. } | Message::ChannelClose { .. }) => {}
                Ok(other) => {
                    warn!(message_type = other.message_type(), "unexpected ECMG message");
                }
                Err(err) => {
                    debug!(%err, "ECMG session closed");
                    self.fail_all(|| SimulcryptError::Disconnected);
                    return;
                }
            }
        }
    }

    /// Hand a completed crypto-period to its waiter or callback.
    fn resolve(&self, cp_number: u16, result: Result<EcmResponse>) {
        let pending = self.state.lock().pending.remove(&cp_number);
        match pending {
            Some(Pending::Sync) => {
                let mut state = self.state.lock();
                state.sync_results.insert(cp_number, result);
                self.response.notify_all();
            }
            Some(Pending::Async(handler)) => handler(result),
            None => warn!(cp_number, "ECM response for unknown crypto-period"),
        }
    }

    /// Terminate every outstanding request with an error.
    fn fail_all(&self, error: impl Fn() -> SimulcryptError) {
        let drained: Vec<(u16, Pending)> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained = state.pending.drain().collect();
            self.response.notify_all();
            drained
        };
        for (cp_number, pending) in drained {
            match pending {
                Pending::Sync => {
                    let mut state = self.state.lock();
                    state.sync_results.insert(cp_number, Err(error()));
                }
                Pending::Async(handler) => handler(Err(error())),
            }
        }
        self.response.notify_all();
    }
}

impl Drop for EcmgClient {
    fn drop(&mut self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

fn write_message(stream: &mut TcpStream, version: u8, message: &Message) -> Result<()> {
    stream.write_all(&message.encode(version))?;
    Ok(())
}
