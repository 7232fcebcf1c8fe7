//! Reboot controller.
//!
//! Resets the module through the application's FusionEngine command
//! channel and confirms it came back by waiting for an accepted
//! `CommandResponse`. When the automatic path gets no answer the operator is
//! asked to power-cycle the device; some hardware revisions ignore the
//! software reset.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::events::{UpdateEvent, UpdateObserver};
use crate::fusion::{CommandResponse, FeDecoder, reset_request};
use crate::protocol::Component;
use crate::protocol::constants::{RESET_PROBE, RESET_REBOOT_NAVIGATION_PROCESSOR};
use crate::session::{CancelToken, SessionConfig, SessionError};
use crate::transport::Transport;

/// Read size while polling for the reset answer.
const POLL_READ_LEN: usize = 1024;

/// Shortest time spent listening after each reset request.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How the device is rebooted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootStrategy {
    /// Send the reset command, fall back to Manual without an answer.
    #[default]
    Automatic,
    /// Ask the operator to power-cycle the device.
    Manual,
}

/// Which path confirmed the reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMethod {
    Automatic,
    Manual,
}

/// Result of one polling round.
enum PollOutcome {
    Confirmed,
    Rejected(u8),
    Silent,
}

pub struct RebootController<'a, O: UpdateObserver + ?Sized> {
    config: &'a SessionConfig,
    observer: &'a O,
    cancel: &'a CancelToken,
    component: Component,
    sequence: u32,
}

impl<'a, O: UpdateObserver + ?Sized> RebootController<'a, O> {
    pub fn new(
        config: &'a SessionConfig,
        observer: &'a O,
        cancel: &'a CancelToken,
        component: Component,
    ) -> Self {
        Self {
            config,
            observer,
            cancel,
            component,
            sequence: 0,
        }
    }

    /// Ask the running application to reboot into the serial updater.
    ///
    /// The updater does not speak FusionEngine, so the sync handshake that
    /// follows is the real confirmation; a silent device only produces the
    /// operator prompt here.
    #[instrument(skip(self, transport), fields(component = %self.component))]
    pub fn enter_update_mode<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<RebootMethod, SessionError> {
        if self.config.reboot_strategy == RebootStrategy::Automatic {
            info!("Rebooting the device...");
            match self.poll(
                transport,
                RESET_REBOOT_NAVIGATION_PROCESSOR,
                self.config.reboot_poll_attempts,
            )? {
                PollOutcome::Confirmed => {
                    info!("Reboot command accepted");
                    return Ok(RebootMethod::Automatic);
                }
                PollOutcome::Rejected(code) => warn!(code, "Reboot command rejected"),
                PollOutcome::Silent => warn!("No answer to reboot command"),
            }
        }

        self.prompt(format!(
            "Please reboot the device now to start the {} update.",
            self.component
        ));
        Ok(RebootMethod::Manual)
    }

    /// Confirm the device runs the application again after an update.
    ///
    /// Automatic first; without an answer falls back to Manual. Manual
    /// expiry is fatal.
    #[instrument(skip(self, transport), fields(component = %self.component))]
    pub fn confirm_running<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<RebootMethod, SessionError> {
        if self.config.reboot_strategy == RebootStrategy::Automatic {
            info!("Waiting for software to start...");
            match self.poll(transport, RESET_PROBE, self.config.reboot_poll_attempts)? {
                PollOutcome::Confirmed => {
                    info!("Device rebooted");
                    return Ok(RebootMethod::Automatic);
                }
                PollOutcome::Rejected(code) => {
                    warn!(code, "Device answered but rejected the reset, falling back to manual reboot")
                }
                PollOutcome::Silent => {
                    warn!("Timed out waiting for device, falling back to manual reboot")
                }
            }
        }

        let window = self.config.manual_reboot_window();
        self.prompt(format!(
            "Please power-cycle the device within {}s to finish the {} update.",
            window.as_secs(),
            self.component
        ));

        match self.poll(transport, RESET_PROBE, self.manual_poll_attempts(window))? {
            PollOutcome::Confirmed => {
                info!("Device rebooted after manual reset");
                Ok(RebootMethod::Manual)
            }
            _ => Err(SessionError::ManualRebootTimeout {
                waited_secs: window.as_secs(),
            }),
        }
    }

    fn manual_poll_attempts(&self, window: Duration) -> u32 {
        let interval = self.config.reboot_poll_interval().as_millis().max(1);
        let attempts = window.as_millis().div_ceil(interval);
        attempts.clamp(1, u32::MAX as u128) as u32
    }

    fn prompt(&self, message: String) {
        self.observer.on_event(&UpdateEvent::ManualRebootRequired {
            message,
            window: self.config.manual_reboot_window(),
        });
    }

    /// Send the reset request once per attempt, then listen for the rest of
    /// the poll interval. Other output the device streams meanwhile is
    /// skipped by the decoder and does not shorten the interval.
    fn poll<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        reset_mask: u32,
        attempts: u32,
    ) -> Result<PollOutcome, SessionError> {
        let interval = self.config.reboot_poll_interval().max(MIN_POLL_INTERVAL);
        let mut decoder = FeDecoder::new();

        for attempt in 1..=attempts {
            self.cancel.check()?;

            self.sequence = self.sequence.wrapping_add(1);
            transport.send(&reset_request(self.sequence, reset_mask))?;

            let slot_end = Instant::now() + interval;
            loop {
                let remaining = slot_end.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let data = match transport.receive(POLL_READ_LEN, remaining) {
                    Ok(data) => data,
                    Err(e) if e.is_timeout() => break,
                    Err(e) => return Err(e.into()),
                };

                for msg in decoder.feed(&data) {
                    if let Some(resp) = CommandResponse::from_message(&msg) {
                        if resp.is_ok() {
                            return Ok(PollOutcome::Confirmed);
                        }
                        return Ok(PollOutcome::Rejected(resp.response));
                    }
                }
            }
            debug!(attempt, "No reset answer yet");
        }

        Ok(PollOutcome::Silent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, UpdateEvent};
    use crate::fusion::command_response;
    use crate::protocol::constants::FE_RESPONSE_OK;
    use crate::transport::MockTransport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        prompts: Mutex<Vec<String>>,
    }

    impl UpdateObserver for Recorder {
        fn on_event(&self, event: &UpdateEvent) {
            if let UpdateEvent::ManualRebootRequired { message, .. } = event {
                self.prompts.lock().unwrap().push(message.clone());
            }
        }
    }

    fn config(strategy: RebootStrategy) -> SessionConfig {
        SessionConfig {
            reboot_strategy: strategy,
            reboot_poll_attempts: 3,
            reboot_poll_interval_ms: 1,
            manual_reboot_window_secs: 1,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_automatic_confirms_on_first_poll() {
        let cfg = config(RebootStrategy::Automatic);
        let observer = Recorder::default();
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();
        mock.queue_bytes(&command_response(1, 1, FE_RESPONSE_OK));

        let mut ctrl = RebootController::new(&cfg, &observer, &cancel, Component::Application);
        assert_eq!(ctrl.confirm_running(&mut mock).unwrap(), RebootMethod::Automatic);
        assert_eq!(mock.get_writes().len(), 1);
        assert!(observer.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_silent_device_falls_back_to_manual_prompt_then_times_out() {
        let cfg = config(RebootStrategy::Automatic);
        let observer = Recorder::default();
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();

        let mut ctrl = RebootController::new(&cfg, &observer, &cancel, Component::Gnss);
        let err = ctrl.confirm_running(&mut mock).unwrap_err();

        assert!(matches!(err, SessionError::ManualRebootTimeout { waited_secs: 1 }));
        assert_eq!(observer.prompts.lock().unwrap().len(), 1);
        // Automatic attempts plus the manual window polling.
        assert_eq!(mock.get_writes().len(), 3 + 1000);
    }

    #[test]
    fn test_manual_recovers_when_device_answers() {
        let cfg = config(RebootStrategy::Manual);
        let observer = Recorder::default();
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();
        mock.queue_silence();
        mock.queue_silence();
        mock.queue_bytes(&command_response(9, 3, FE_RESPONSE_OK));

        let mut ctrl = RebootController::new(&cfg, &observer, &cancel, Component::Application);
        assert_eq!(ctrl.confirm_running(&mut mock).unwrap(), RebootMethod::Manual);
        assert_eq!(observer.prompts.lock().unwrap().len(), 1);
        assert_eq!(mock.get_writes().len(), 3);
    }

    #[test]
    fn test_rejected_reset_falls_back() {
        let cfg = config(RebootStrategy::Automatic);
        let observer = Recorder::default();
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();
        mock.queue_bytes(&command_response(1, 1, 4));
        mock.queue_bytes(&command_response(2, 2, FE_RESPONSE_OK));

        let mut ctrl = RebootController::new(&cfg, &observer, &cancel, Component::Application);
        assert_eq!(ctrl.confirm_running(&mut mock).unwrap(), RebootMethod::Manual);
        assert_eq!(observer.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_enter_update_mode_prompts_when_silent() {
        let cfg = config(RebootStrategy::Automatic);
        let observer = Recorder::default();
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();

        let mut ctrl = RebootController::new(&cfg, &observer, &cancel, Component::Gnss);
        assert_eq!(ctrl.enter_update_mode(&mut mock).unwrap(), RebootMethod::Manual);
        assert_eq!(mock.get_writes().len(), 3);
        assert_eq!(observer.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_stops_polling() {
        let cfg = config(RebootStrategy::Manual);
        let observer = Recorder::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut mock = MockTransport::new();

        let mut ctrl = RebootController::new(&cfg, &observer, &cancel, Component::Gnss);
        assert!(matches!(
            ctrl.confirm_running(&mut mock),
            Err(SessionError::Cancelled)
        ));
        assert!(mock.get_writes().is_empty());
    }

    const NMEA: &[u8] = b"$GNGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76\r\n";

    #[test]
    fn test_streaming_device_is_answered_within_window() {
        let cfg = SessionConfig {
            reboot_strategy: RebootStrategy::Manual,
            reboot_poll_interval_ms: 100,
            manual_reboot_window_secs: 1,
            ..SessionConfig::default()
        };
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();
        for _ in 0..10 {
            mock.queue_bytes(NMEA);
        }
        mock.queue_bytes(&command_response(1, 1, FE_RESPONSE_OK));

        let mut ctrl = RebootController::new(&cfg, &NullObserver, &cancel, Component::Application);
        assert_eq!(ctrl.confirm_running(&mut mock).unwrap(), RebootMethod::Manual);
        assert_eq!(mock.get_writes().len(), 1);
    }

    #[test]
    fn test_streaming_output_does_not_shorten_polling() {
        let cfg = SessionConfig {
            reboot_strategy: RebootStrategy::Automatic,
            reboot_poll_attempts: 3,
            reboot_poll_interval_ms: 30,
            manual_reboot_window_secs: 0,
            ..SessionConfig::default()
        };
        let cancel = CancelToken::new();
        let mut mock = MockTransport::new();
        for _ in 0..50 {
            mock.queue_bytes(NMEA);
        }

        let start = Instant::now();
        let mut ctrl = RebootController::new(&cfg, &NullObserver, &cancel, Component::Gnss);
        let err = ctrl.confirm_running(&mut mock).unwrap_err();

        assert!(matches!(err, SessionError::ManualRebootTimeout { .. }));
        // Three automatic intervals plus one manual interval.
        assert_eq!(mock.get_writes().len(), 4);
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(mock.pending(), 0);
    }
}
