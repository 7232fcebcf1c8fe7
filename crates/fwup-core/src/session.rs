//! Update session - drives one component update from sync to reboot.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bootloader::FlasherConfig;
use crate::codec::FramingCodec;
use crate::events::{PacketDirection, TracingObserver, UpdateEvent, UpdateObserver};
use crate::payload::FirmwareImage;
use crate::protocol::constants::*;
use crate::protocol::frame::{FrameError, sync_bytes};
use crate::protocol::{Component, DeviceResponse, ProtocolVariant};
use crate::reboot::{RebootController, RebootMethod, RebootStrategy};
use crate::resolver::ResolveError;
use crate::state::{FailureKind, RetryBudget, SessionState, StateMachine};
use crate::transport::{Transport, TransportError};

/// Read size while hunting for the sync answer.
const SYNC_READ_LEN: usize = 64;

/// Shortest listening slot after each SYNC_WORD1.
const MIN_SYNC_POLL: Duration = Duration::from_millis(1);

/// Configuration for an update session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial port of the device.
    pub port: String,
    /// Link speed.
    pub baud_rate: u32,
    /// SYNC_WORD1 transmissions before giving up on the handshake.
    pub sync_attempts: u32,
    /// Listening slot after each SYNC_WORD1, in milliseconds.
    pub sync_poll_ms: u64,
    /// Wait for a command or packet response, in milliseconds.
    pub response_timeout_ms: u64,
    /// Wait for the start-upgrade answer; the device erases flash first.
    pub erase_timeout_ms: u64,
    /// Resends allowed per packet after the first attempt.
    pub max_retries: u32,
    /// Override of the variant's block size; zero keeps the default.
    pub block_size: Option<usize>,
    /// Reset the device into its updater before the handshake.
    pub reboot_before_update: bool,
    pub reboot_strategy: RebootStrategy,
    /// Reset requests sent by the automatic strategy.
    pub reboot_poll_attempts: u32,
    /// Delay between reset requests, in milliseconds.
    pub reboot_poll_interval_ms: u64,
    /// Time the operator has to power-cycle the device.
    pub manual_reboot_window_secs: u64,
    /// External bootloader flashing tool.
    pub bootloader: FlasherConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD,
            sync_attempts: 200,
            sync_poll_ms: 50,
            response_timeout_ms: 60_000,
            erase_timeout_ms: 60_000,
            max_retries: 5,
            block_size: None,
            reboot_before_update: true,
            reboot_strategy: RebootStrategy::Automatic,
            reboot_poll_attempts: 20,
            reboot_poll_interval_ms: 500,
            manual_reboot_window_secs: 120,
            bootloader: FlasherConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn sync_poll(&self) -> Duration {
        Duration::from_millis(self.sync_poll_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }

    pub fn reboot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reboot_poll_interval_ms)
    }

    pub fn manual_reboot_window(&self) -> Duration {
        Duration::from_secs(self.manual_reboot_window_secs)
    }

    /// Protocol variant for `component` with the configured overrides.
    pub fn variant_for(&self, component: Component) -> Option<ProtocolVariant> {
        let variant = ProtocolVariant::for_component(component)?;
        Some(
            self.block_size
                .and_then(|size| variant.with_block_size(size))
                .unwrap_or(variant),
        )
    }
}

/// Shared cancellation flag, set from outside the session (e.g. Ctrl-C).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), SessionError> {
        if self.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn describe_report(report: &Option<u32>) -> String {
    match report {
        Some(r) => format!("0x{:08X}", r),
        None => "nothing".to_string(),
    }
}

/// Terminal failure of an update session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Sync timed out after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    #[error("Device rejected {command}: {response}")]
    CommandRejected {
        command: &'static str,
        response: DeviceResponse,
    },

    #[error("Transfer aborted: packet {sequence} failed {attempts} times (last answer: {last})")]
    TransferAborted {
        sequence: u32,
        attempts: u32,
        last: DeviceResponse,
    },

    #[error("Integrity mismatch: expected 0x{expected:08X}, device reported {}", describe_report(.reported))]
    IntegrityMismatch { expected: u32, reported: Option<u32> },

    #[error("Device did not come back within {waited_secs}s of the manual reboot prompt")]
    ManualRebootTimeout { waited_secs: u64 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Image resolution failed: {0}")]
    ImageResolution(#[from] ResolveError),

    #[error("Frame encoding failed: {0}")]
    Frame(#[from] FrameError),

    #[error("Update cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::HandshakeTimeout { .. } => FailureKind::HandshakeTimeout,
            SessionError::CommandRejected { .. } => FailureKind::CommandRejected,
            SessionError::TransferAborted { .. } => FailureKind::TransferAborted,
            SessionError::IntegrityMismatch { .. } => FailureKind::IntegrityMismatch,
            SessionError::ManualRebootTimeout { .. } => FailureKind::ManualRebootTimeout,
            SessionError::Transport(_) => FailureKind::TransportIo,
            SessionError::ImageResolution(_) => FailureKind::ImageResolution,
            SessionError::Frame(_) => FailureKind::Encoding,
            SessionError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Summary of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub component: Component,
    pub packets: usize,
    pub retransmissions: u32,
    pub reboot: RebootMethod,
}

/// Update session - owns the transport for one component update.
///
/// Consumed by [`UpdateSession::run`]; the transport is closed when the
/// session ends, whatever the outcome.
pub struct UpdateSession<T: Transport, O: UpdateObserver> {
    config: SessionConfig,
    link: ObservableTransport<T, O>,
    observer: Arc<O>,
    cancel: CancelToken,
    machine: StateMachine,
    component: Component,
}

impl<T: Transport> UpdateSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self::with_observer(config, transport, Arc::new(TracingObserver))
    }
}

impl<T: Transport, O: UpdateObserver + 'static> UpdateSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, transport: T, observer: Arc<O>) -> Self {
        Self {
            config,
            link: ObservableTransport {
                inner: transport,
                observer: Arc::clone(&observer),
            },
            observer,
            cancel: CancelToken::new(),
            machine: StateMachine::new(),
            component: Component::Application,
        }
    }

    /// Use an externally controlled cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Run the complete update of `image`.
    #[instrument(skip(self, image), fields(component = %image.component(), len = image.len()))]
    pub fn run(mut self, image: &FirmwareImage) -> Result<SessionReport, SessionError> {
        self.component = image.component();
        self.emit_state();

        let result = self.drive(image);
        match &result {
            Ok(report) => {
                info!(
                    packets = report.packets,
                    retransmissions = report.retransmissions,
                    "Update complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "Update failed");
                self.enter(SessionState::Failed(e.kind()));
            }
        }
        result
        // `self.link` drops here and closes the port.
    }

    fn drive(&mut self, image: &FirmwareImage) -> Result<SessionReport, SessionError> {
        let variant = self.config.variant_for(image.component()).ok_or_else(|| {
            ResolveError::ComponentMismatch {
                requested: image.component(),
                reason: "component is not handled by the serial updater".to_string(),
            }
        })?;
        let codec = FramingCodec::new(variant);

        self.enter(SessionState::Handshaking);
        self.handshake(&codec, image)?;

        let (packets, retransmissions) = self.transfer(&codec, image)?;

        self.enter(SessionState::Verifying);
        self.verify(&codec, image, packets)?;

        self.enter(SessionState::AwaitingReboot);
        let reboot = RebootController::new(
            &self.config,
            self.observer.as_ref(),
            &self.cancel,
            self.component,
        )
        .confirm_running(&mut self.link)?;

        self.enter(SessionState::Complete);
        Ok(SessionReport {
            component: self.component,
            packets,
            retransmissions,
            reboot,
        })
    }

    fn enter(&mut self, state: SessionState) {
        self.machine.goto_state(state);
        self.emit_state();
    }

    fn emit_state(&self) {
        self.observer.on_event(&UpdateEvent::StateChanged {
            component: self.component,
            state: self.machine.state(),
        });
    }

    fn handshake(&mut self, codec: &FramingCodec, image: &FirmwareImage) -> Result<(), SessionError> {
        if self.config.reboot_before_update {
            RebootController::new(
                &self.config,
                self.observer.as_ref(),
                &self.cancel,
                self.component,
            )
            .enter_update_mode(&mut self.link)?;
        }

        self.synchronize()?;

        info!("Sending firmware address");
        self.command(
            "firmware address",
            MSG_ID_FIRMWARE_ADDRESS,
            codec.firmware_address()?,
            codec,
            self.config.response_timeout(),
        )?;

        info!(size = image.len(), crc = %format!("0x{:08X}", image.integrity()), "Sending firmware info");
        self.command(
            "firmware info",
            MSG_ID_FIRMWARE_INFO,
            codec.firmware_info(image)?,
            codec,
            self.config.response_timeout(),
        )?;

        info!("Sending upgrade start and flash erase");
        self.command(
            "start upgrade",
            MSG_ID_START_UPGRADE,
            codec.start_upgrade()?,
            codec,
            self.config.erase_timeout(),
        )?;
        Ok(())
    }

    /// Two-word sync with the serial updater.
    ///
    /// SYNC_WORD1 goes out once per poll interval; the handshake gives up
    /// after `sync_attempts` intervals, however much unrelated output the
    /// device sends meanwhile.
    fn synchronize(&mut self) -> Result<(), SessionError> {
        let sync1 = sync_bytes(SYNC_WORD1);
        let sync2 = sync_bytes(SYNC_WORD2);
        let rsp2 = sync_bytes(RSP_WORD2);
        let poll = self.config.sync_poll().max(MIN_SYNC_POLL);

        self.link.clear_input()?;
        let mut window = [0u8; 4];

        for attempt in 1..=self.config.sync_attempts {
            self.cancel.check()?;
            self.link.send(&sync1)?;

            let Some(mut reply) = self.await_first_answer(&mut window, poll)? else {
                continue;
            };

            debug!(attempt, "First sync word answered");
            self.link.send(&sync2)?;

            if reply.len() < rsp2.len() {
                match self.link.receive_exact(rsp2.len() - reply.len(), poll) {
                    Ok(more) => reply.extend_from_slice(&more),
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if reply.len() >= rsp2.len() && reply[..rsp2.len()] == rsp2 {
                info!(attempt, "Sync success");
                return Ok(());
            }
            window = [0u8; 4];
        }

        Err(SessionError::HandshakeTimeout {
            attempts: self.config.sync_attempts,
        })
    }

    /// Scan incoming bytes for RSP_WORD1 until `slot` has elapsed.
    ///
    /// Returns the bytes that followed the answer in the same read.
    fn await_first_answer(
        &mut self,
        window: &mut [u8; 4],
        slot: Duration,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let rsp1 = sync_bytes(RSP_WORD1);
        let slot_end = Instant::now() + slot;

        loop {
            let remaining = slot_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let chunk = match self.link.receive(SYNC_READ_LEN, remaining) {
                Ok(chunk) => chunk,
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            for (i, &byte) in chunk.iter().enumerate() {
                window.rotate_left(1);
                window[3] = byte;
                if *window == rsp1 {
                    return Ok(Some(chunk[i + 1..].to_vec()));
                }
            }
        }
    }

    /// Send a setup command; anything but an ACK aborts the session.
    fn command(
        &mut self,
        name: &'static str,
        msg_id: u8,
        frame: Vec<u8>,
        codec: &FramingCodec,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.cancel.check()?;
        self.link.send(&frame)?;
        let response = codec.read_response(&mut self.link, msg_id, timeout)?;
        if response.is_ack() {
            debug!(command = name, "Command acknowledged");
            Ok(())
        } else {
            Err(SessionError::CommandRejected {
                command: name,
                response,
            })
        }
    }

    /// Send every packet in order, resending a packet until it is acked or
    /// its retry budget runs out.
    fn transfer(
        &mut self,
        codec: &FramingCodec,
        image: &FirmwareImage,
    ) -> Result<(usize, u32), SessionError> {
        let packets = codec.encode(image);
        let total = packets.total();
        let timeout = self.config.response_timeout();
        let mut retransmissions = 0u32;

        info!(packets = total, block_size = codec.variant().block_size.get(), "Sending data");

        for (index, packet) in packets.enumerate() {
            self.enter(SessionState::Transferring);
            let mut budget = RetryBudget::new(self.config.max_retries);

            loop {
                self.cancel.check()?;
                let frame = packet.to_frame(codec.variant())?;
                self.link.send(&frame)?;

                let response = codec.read_response(&mut self.link, MSG_ID_SEND_FIRMWARE, timeout)?;
                match response {
                    DeviceResponse::Ack { .. } => break,
                    DeviceResponse::Nack(_) | DeviceResponse::Timeout | DeviceResponse::Malformed => {
                        if !budget.record_failure() {
                            return Err(SessionError::TransferAborted {
                                sequence: packet.sequence,
                                attempts: budget.retries(),
                                last: response,
                            });
                        }
                        retransmissions += 1;
                        self.observer.on_event(&UpdateEvent::Retry {
                            sequence: packet.sequence,
                            attempt: budget.attempts(),
                            response,
                        });
                        // Drop whatever is left of a bad answer before resending.
                        self.link.clear_input()?;
                    }
                }
            }

            self.observer.on_event(&UpdateEvent::Progress {
                component: self.component,
                current: (index + 1) as u64,
                total: total as u64,
            });
        }

        Ok((total, retransmissions))
    }

    /// Close the transfer and compare the device's CRC with the image's.
    fn verify(
        &mut self,
        codec: &FramingCodec,
        image: &FirmwareImage,
        packets: usize,
    ) -> Result<(), SessionError> {
        self.cancel.check()?;
        self.link.send(&codec.end_transfer(packets as u32)?)?;

        let response =
            codec.read_response(&mut self.link, MSG_ID_END_TRANSFER, self.config.response_timeout())?;
        let expected = image.integrity();
        match response {
            DeviceResponse::Ack {
                report: Some(reported),
            } if reported == expected => {
                info!(crc = %format!("0x{:08X}", expected), "Image verified");
                Ok(())
            }
            DeviceResponse::Ack { report } => Err(SessionError::IntegrityMismatch {
                expected,
                reported: report,
            }),
            DeviceResponse::Nack(_) | DeviceResponse::Timeout | DeviceResponse::Malformed => {
                Err(SessionError::IntegrityMismatch {
                    expected,
                    reported: None,
                })
            }
        }
    }
}

/// Transport wrapper that emits packet events and closes the inner
/// transport when dropped.
struct ObservableTransport<T: Transport, O: UpdateObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: Transport, O: UpdateObserver> Transport for ObservableTransport<T, O> {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.send(data);
        if res.is_ok() {
            self.observer.on_event(&UpdateEvent::Packet {
                direction: PacketDirection::Tx,
                length: data.len(),
            });
        }
        res
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.receive(max_len, timeout);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&UpdateEvent::Packet {
                direction: PacketDirection::Rx,
                length: data.len(),
            });
        }
        res
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.inner.clear_input()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl<T: Transport, O: UpdateObserver> Drop for ObservableTransport<T, O> {
    fn drop(&mut self) {
        self.inner.close();
    }
}
