//! Command queue and transmit loop for one physical RF transmitter.
//!
//! [`RfTransmitter`] owns a bounded queue of [`PendingCommand`]s and a
//! dedicated thread that turns them into pulse sequences on a
//! [`PulseWriter`]. Several shockers can be active at once: each pass of the
//! loop writes the frame of every active command once, so their streams are
//! interleaved on the single radio. A command stays active until its duration
//! has elapsed, after which its zero-intensity frame is sent to end the action.
//!
//! ## Lifecycle
//!
//! `new` spawns the loop (Ready); every `send_command` hands a command to it;
//! dropping the transmitter discards whatever is still queued, terminates the
//! active commands and joins the thread (Destroyed).
//!
//! ## Ordering
//!
//! Commands for one shocker are transmitted in submission order. A command
//! submitted with `overwrite` replaces the active command for the same
//! shocker instead of running alongside it.

use crate::clock::Clock;
use crate::consts::{QUEUE_SEND_TIMEOUT_MS, TASK_SHUTDOWN_POLL_MS, TRANSMIT_QUEUE_CAPACITY};
use crate::encoding::{self, PulseSequence, ShockerCommandType, ShockerModel};
use crate::radio::PulseWriter;
use core::fmt;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, error, info, trace, warn};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reasons a command could not be handed to the transmit loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    /// No transmitter exists (no usable pin configured).
    #[error("rf transmitter is not initialized")]
    NotInitialized,
    /// `Stop` reached the transmitter without being translated first.
    #[error("stop commands have no on-air form")]
    InvalidCommand,
    /// The pending queue stayed full for the whole send timeout.
    #[error("transmit queue is full")]
    QueueFull,
    /// The transmit loop is gone.
    #[error("transmit loop is not running")]
    Stopped,
    /// The transmit loop thread could not be created.
    #[error("failed to start the transmit loop")]
    TaskSpawn,
}

/// A command waiting in the queue.
///
/// Copied by value into the loop's working set once dequeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// Receiver address.
    pub shocker_id: u16,
    /// Receiver hardware family.
    pub model: ShockerModel,
    /// Requested action, never `Stop`.
    pub command_type: ShockerCommandType,
    /// Requested intensity, clamped by the encoder.
    pub intensity: u8,
    /// How long the action lasts.
    pub duration_ms: u16,
    /// Clock reading when the command was queued.
    pub enqueued_at_ms: i64,
    /// Replace the active command for the same shocker.
    pub overwrite: bool,
}

impl PendingCommand {
    /// Clock reading after which the command has expired.
    pub fn until_ms(&self) -> i64 {
        self.enqueued_at_ms + i64::from(self.duration_ms)
    }
}

#[derive(Debug)]
enum TxMessage {
    Command(PendingCommand),
    Kill,
}

#[derive(Debug)]
struct ActiveCommand {
    shocker_id: u16,
    model: ShockerModel,
    until_ms: i64,
    sequence: PulseSequence,
    zero_sequence: PulseSequence,
}

impl ActiveCommand {
    fn from_pending(cmd: &PendingCommand) -> Self {
        Self {
            shocker_id: cmd.shocker_id,
            model: cmd.model,
            until_ms: cmd.until_ms(),
            sequence: encoding::sequence(cmd.model, cmd.shocker_id, cmd.command_type, cmd.intensity)
                .unwrap_or_default(),
            zero_sequence: encoding::zero_sequence(cmd.model, cmd.shocker_id),
        }
    }
}

/// Working set of the transmit loop: every command currently on air.
#[derive(Debug, Default)]
struct TransmitSchedule {
    active: Vec<ActiveCommand>,
}

impl TransmitSchedule {
    fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn accept(&mut self, cmd: PendingCommand) {
        let next = ActiveCommand::from_pending(&cmd);
        if cmd.overwrite {
            if let Some(slot) = self
                .active
                .iter_mut()
                .find(|a| a.shocker_id == cmd.shocker_id && a.model == cmd.model)
            {
                *slot = next;
                return;
            }
        }
        self.active.push(next);
    }

    /// One round-robin pass over the active commands.
    fn service(&mut self, now_ms: i64, writer: &mut dyn PulseWriter) {
        self.active.retain(|cmd| {
            let expired = cmd.until_ms < now_ms;
            let empty = cmd.sequence.is_empty();

            if expired || empty {
                if !empty {
                    if let Err(e) = writer.write_blocking(&cmd.zero_sequence) {
                        warn!("Failed to terminate command for shocker {}: {e}", cmd.shocker_id);
                    }
                }
                trace!("Command for shocker {} done", cmd.shocker_id);
                return false;
            }

            if let Err(e) = writer.write_blocking(&cmd.sequence) {
                warn!("Failed to transmit command for shocker {}: {e}", cmd.shocker_id);
            }
            true
        });
    }

    /// Ends every active command.
    fn shutdown(&mut self, writer: &mut dyn PulseWriter) {
        for cmd in self.active.drain(..) {
            if cmd.sequence.is_empty() {
                continue;
            }
            if let Err(e) = writer.write_blocking(&cmd.zero_sequence) {
                warn!("Failed to terminate command for shocker {}: {e}", cmd.shocker_id);
            }
        }
    }
}

fn transmit_loop(
    tx_pin: u8,
    rx: Receiver<TxMessage>,
    mut writer: Box<dyn PulseWriter>,
    clock: Arc<dyn Clock>,
) {
    debug!("[pin-{tx_pin}] Transmit loop started");
    let mut schedule = TransmitSchedule::default();

    'run: loop {
        // Nothing on air: sleep until the next command
        if schedule.is_empty() {
            match rx.recv() {
                Ok(TxMessage::Command(cmd)) => schedule.accept(cmd),
                Ok(TxMessage::Kill) | Err(_) => break 'run,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(TxMessage::Command(cmd)) => schedule.accept(cmd),
                Ok(TxMessage::Kill) | Err(TryRecvError::Disconnected) => break 'run,
                Err(TryRecvError::Empty) => break,
            }
        }

        schedule.service(clock.now_ms(), writer.as_mut());
    }

    schedule.shutdown(writer.as_mut());
    debug!("[pin-{tx_pin}] Transmit loop stopped");
}

/// One physical transmitter and its transmit loop.
pub struct RfTransmitter {
    tx_pin: u8,
    queue: Sender<TxMessage>,
    pending: Receiver<TxMessage>,
    clock: Arc<dyn Clock>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for RfTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RfTransmitter")
            .field("tx_pin", &self.tx_pin)
            .field("pending", &self.pending.len())
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl RfTransmitter {
    /// Starts the transmit loop for `writer`.
    ///
    /// # Arguments
    /// - `tx_pin`: the GPIO the writer drives, kept for reporting
    /// - `writer`: exclusive handle to the radio
    /// - `clock`: time source for command expiry
    pub fn new(
        tx_pin: u8,
        writer: Box<dyn PulseWriter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransmitError> {
        let (queue, pending) = bounded(TRANSMIT_QUEUE_CAPACITY);

        let loop_rx = pending.clone();
        let loop_clock = Arc::clone(&clock);
        let task = thread::Builder::new()
            .name(format!("rf-tx-{tx_pin}"))
            .spawn(move || transmit_loop(tx_pin, loop_rx, writer, loop_clock))
            .map_err(|e| {
                error!("[pin-{tx_pin}] Failed to spawn transmit loop: {e}");
                TransmitError::TaskSpawn
            })?;

        info!("[pin-{tx_pin}] RF transmitter ready");
        Ok(Self {
            tx_pin,
            queue,
            pending,
            clock,
            task: Some(task),
        })
    }

    /// The GPIO this transmitter drives.
    pub fn tx_pin(&self) -> u8 {
        self.tx_pin
    }

    /// Queues a command for transmission.
    ///
    /// Waits at most [`QUEUE_SEND_TIMEOUT_MS`] for room in the queue.
    ///
    /// # Errors
    /// - [`TransmitError::InvalidCommand`] for `Stop`
    /// - [`TransmitError::QueueFull`] when the queue stayed full
    pub fn send_command(
        &self,
        model: ShockerModel,
        shocker_id: u16,
        command_type: ShockerCommandType,
        intensity: u8,
        duration_ms: u16,
        overwrite: bool,
    ) -> Result<(), TransmitError> {
        if command_type == ShockerCommandType::Stop {
            return Err(TransmitError::InvalidCommand);
        }

        let cmd = PendingCommand {
            shocker_id,
            model,
            command_type,
            intensity,
            duration_ms,
            enqueued_at_ms: self.clock.now_ms(),
            overwrite,
        };

        match self.queue.send_timeout(
            TxMessage::Command(cmd),
            Duration::from_millis(QUEUE_SEND_TIMEOUT_MS),
        ) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("[pin-{}] Transmit queue full, dropping command", self.tx_pin);
                Err(TransmitError::QueueFull)
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(TransmitError::Stopped),
        }
    }

    /// Discards every command that has not been dequeued yet, for all shockers.
    pub fn clear_pending_commands(&self) {
        let mut cleared = 0usize;
        while let Ok(msg) = self.pending.try_recv() {
            if let TxMessage::Command(_) = msg {
                cleared += 1;
            }
        }
        debug!("[pin-{}] Cleared {cleared} pending commands", self.tx_pin);
    }
}

impl Drop for RfTransmitter {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.clear_pending_commands();
        while !task.is_finished() {
            if self
                .queue
                .send_timeout(TxMessage::Kill, Duration::from_millis(TASK_SHUTDOWN_POLL_MS))
                .is_ok()
            {
                break;
            }
        }
        if task.join().is_err() {
            error!("[pin-{}] Transmit loop panicked", self.tx_pin);
        }
        info!("[pin-{}] RF transmitter destroyed", self.tx_pin);
    }
}

/// Replaceable home of the active [`RfTransmitter`].
///
/// Submissions take the read side, so concurrent callers share one stable
/// instance; replacing the transmitter takes the write side and waits for
/// every in-flight submission to finish.
#[derive(Debug, Default)]
pub struct TransmitterSlot {
    inner: RwLock<Option<RfTransmitter>>,
}

impl TransmitterSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access to the current transmitter.
    pub fn read(&self) -> RwLockReadGuard<'_, Option<RfTransmitter>> {
        self.inner.read()
    }

    /// Exclusive access, for replacing or destroying the transmitter.
    pub fn write(&self) -> RwLockWriteGuard<'_, Option<RfTransmitter>> {
        self.inner.write()
    }

    /// Whether a transmitter is installed.
    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    /// [`RfTransmitter::send_command`] on the current transmitter.
    ///
    /// # Errors
    /// [`TransmitError::NotInitialized`] when the slot is empty.
    pub fn send_command(
        &self,
        model: ShockerModel,
        shocker_id: u16,
        command_type: ShockerCommandType,
        intensity: u8,
        duration_ms: u16,
        overwrite: bool,
    ) -> Result<(), TransmitError> {
        let guard = self.inner.read();
        let tx = guard.as_ref().ok_or(TransmitError::NotInitialized)?;
        tx.send_command(model, shocker_id, command_type, intensity, duration_ms, overwrite)
    }
}
