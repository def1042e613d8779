//! Entry point for shocker commands.
//!
//! [`CommandHandler`] ties the transmitter slot, the keep-alive service and
//! the persisted RF settings together. Commands from any source (network,
//! serial) go through [`CommandHandler::handle_command`], which
//!
//! 1. takes the read side of the transmitter slot,
//! 2. turns `Stop` into a short zero-intensity vibrate after purging the
//!    pending queue,
//! 3. queues the command, and
//! 4. on success tells the keep-alive task the shocker is busy until the
//!    command ends.
//!
//! Changing the transmitter pin takes the write side, destroys the old
//! transmitter and builds a new one on the requested GPIO.

use crate::clock::Clock;
use crate::config::{ConfigError, ConfigStore};
use crate::consts::{DEFAULT_RF_TX_PIN, STOP_DURATION_MS};
use crate::encoding::{ShockerCommandType, ShockerModel};
use crate::gpio::is_valid_output_pin;
use crate::keepalive::{KeepAliveConfig, KeepAliveService};
use crate::radio::RadioFactory;
use crate::transmitter::{RfTransmitter, TransmitError, TransmitterSlot};
use core::fmt;
use log::{debug, error, trace, warn};
use std::sync::Arc;

/// Outcome of a GPIO reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SetGpioResultCode {
    /// The new pin is in use and persisted.
    Success,
    /// The pin cannot drive an output.
    InvalidPin,
    /// The radio or the config store failed.
    InternalError,
}

/// Routes shocker commands to the RF transmitter and keeps receivers awake.
pub struct CommandHandler {
    config: Arc<dyn ConfigStore>,
    radio: Arc<dyn RadioFactory>,
    clock: Arc<dyn Clock>,
    slot: Arc<TransmitterSlot>,
    keep_alive: KeepAliveService,
}

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandler")
            .field("slot", &self.slot)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl CommandHandler {
    /// Brings up the transmitter and keep-alive from the persisted settings.
    ///
    /// An unusable configured pin is replaced by [`DEFAULT_RF_TX_PIN`] and the
    /// replacement persisted. If the default is unusable too, "no pin" is
    /// persisted and the handler starts without a transmitter. A radio that
    /// fails to open is logged and also leaves the handler without one.
    ///
    /// # Errors
    /// Reading the settings or persisting a pin fallback failed.
    pub fn init(
        config: Arc<dyn ConfigStore>,
        radio: Arc<dyn RadioFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::init_with(config, radio, clock, KeepAliveConfig::default())
    }

    /// [`CommandHandler::init`] with custom keep-alive timing.
    pub fn init_with(
        config: Arc<dyn ConfigStore>,
        radio: Arc<dyn RadioFactory>,
        clock: Arc<dyn Clock>,
        keep_alive: KeepAliveConfig,
    ) -> Result<Self, ConfigError> {
        let rf = config.rf_config().inspect_err(|e| error!("Failed to get RF config: {e}"))?;

        let slot = Arc::new(TransmitterSlot::new());
        let handler = Self {
            keep_alive: KeepAliveService::new(Arc::clone(&slot), Arc::clone(&clock), keep_alive),
            config,
            radio,
            clock,
            slot,
        };

        let tx_pin = match rf.tx_pin.filter(|&p| is_valid_output_pin(p)) {
            Some(pin) => Some(pin),
            None if is_valid_output_pin(DEFAULT_RF_TX_PIN) => {
                warn!(
                    "Configured RF TX pin ({:?}) is invalid, using default pin ({DEFAULT_RF_TX_PIN})",
                    rf.tx_pin
                );
                handler
                    .config
                    .set_rf_tx_pin(Some(DEFAULT_RF_TX_PIN))
                    .inspect_err(|e| error!("Failed to set RF TX pin in config: {e}"))?;
                Some(DEFAULT_RF_TX_PIN)
            }
            None => {
                error!("Configured RF TX pin and default pin are invalid, RF transmitter disabled");
                handler.config.set_rf_tx_pin(None)?;
                None
            }
        };

        if let Some(pin) = tx_pin {
            match handler.open_transmitter(pin) {
                Ok(tx) => *handler.slot.write() = Some(tx),
                Err(e) => error!("Failed to initialize RF transmitter: {e}"),
            }
        }

        if rf.keep_alive_enabled {
            let _ = handler.keep_alive.set_enabled(true);
        }

        Ok(handler)
    }

    fn open_transmitter(&self, pin: u8) -> Result<RfTransmitter, TransmitError> {
        let writer = self.radio.open(pin).map_err(|e| {
            error!("Failed to open radio on pin {pin}: {e}");
            TransmitError::NotInitialized
        })?;
        RfTransmitter::new(pin, writer, Arc::clone(&self.clock))
    }

    /// Whether a transmitter is available.
    pub fn is_ok(&self) -> bool {
        self.slot.is_initialized()
    }

    /// The shared transmitter slot.
    pub fn transmitter(&self) -> &Arc<TransmitterSlot> {
        &self.slot
    }

    /// Sends a command to a shocker.
    ///
    /// `Stop` purges every queued command, for all shockers, and is sent as a
    /// zero-intensity vibrate of [`STOP_DURATION_MS`].
    ///
    /// # Errors
    /// - [`TransmitError::NotInitialized`] without a transmitter
    /// - [`TransmitError::QueueFull`] when the command could not be queued
    pub fn handle_command(
        &self,
        model: ShockerModel,
        shocker_id: u16,
        command_type: ShockerCommandType,
        intensity: u8,
        duration_ms: u16,
    ) -> Result<(), TransmitError> {
        let duration_ms = {
            let guard = self.slot.read();
            let Some(tx) = guard.as_ref() else {
                warn!("RF transmitter is not initialized, ignoring command");
                return Err(TransmitError::NotInitialized);
            };

            let (command_type, intensity, duration_ms) = if command_type == ShockerCommandType::Stop {
                trace!("Stop command received, clearing pending commands");
                tx.clear_pending_commands();
                (ShockerCommandType::Vibrate, 0, STOP_DURATION_MS)
            } else {
                debug!("Command received: {model} {shocker_id} {command_type:?} {intensity}");
                (command_type, intensity, duration_ms)
            };

            tx.send_command(model, shocker_id, command_type, intensity, duration_ms, true)?;
            duration_ms
        };

        let busy_until = self.clock.now_ms() + i64::from(duration_ms);
        if self.keep_alive.is_enabled()
            && !self.keep_alive.notify_activity(shocker_id, model, busy_until)
        {
            error!("Failed to send keep-alive activity for shocker {shocker_id}");
        }

        Ok(())
    }

    /// Moves the transmitter to another GPIO.
    ///
    /// Waits for in-flight submissions, destroys the current transmitter, then
    /// builds and persists the new one. On failure the handler is left without
    /// a transmitter.
    pub fn set_rf_tx_pin(&self, pin: u8) -> SetGpioResultCode {
        if !is_valid_output_pin(pin) {
            return SetGpioResultCode::InvalidPin;
        }

        let mut slot = self.slot.write();
        if slot.take().is_some() {
            trace!("Destroyed existing RF transmitter");
        }

        let tx = match self.open_transmitter(pin) {
            Ok(tx) => tx,
            Err(e) => {
                error!("Failed to initialize RF transmitter on pin {pin}: {e}");
                return SetGpioResultCode::InternalError;
            }
        };

        if let Err(e) = self.config.set_rf_tx_pin(Some(pin)) {
            error!("Failed to set RF TX pin in config: {e}");
            return SetGpioResultCode::InternalError;
        }

        *slot = Some(tx);
        SetGpioResultCode::Success
    }

    /// The live transmitter's pin, or the persisted one when there is none.
    pub fn rf_tx_pin(&self) -> Option<u8> {
        if let Some(tx) = self.slot.read().as_ref() {
            return Some(tx.tx_pin());
        }

        match self.config.rf_config() {
            Ok(rf) => rf.tx_pin,
            Err(e) => {
                error!("Failed to get RF TX pin from config: {e}");
                None
            }
        }
    }

    /// Starts or stops keep-alive and persists the choice.
    pub fn set_keep_alive_enabled(&self, enabled: bool) -> bool {
        if !self.keep_alive.set_enabled(enabled) {
            return false;
        }

        if let Err(e) = self.config.set_keep_alive_enabled(enabled) {
            error!("Failed to set keep-alive enabled in config: {e}");
            return false;
        }

        true
    }

    /// Temporarily stops or resumes keep-alive without persisting.
    ///
    /// Resuming is refused while keep-alive is disabled in the settings.
    pub fn set_keep_alive_paused(&self, paused: bool) -> bool {
        let enabled = match self.config.rf_config() {
            Ok(rf) => rf.keep_alive_enabled,
            Err(e) => {
                error!("Failed to get keep-alive enabled from config: {e}");
                return false;
            }
        };

        if !enabled && !paused {
            warn!("Keep-alive is disabled in config, ignoring unpause command");
            return false;
        }

        self.keep_alive.set_enabled(!paused)
    }

    /// Whether the keep-alive task is running.
    pub fn is_keep_alive_running(&self) -> bool {
        self.keep_alive.is_enabled()
    }
}
