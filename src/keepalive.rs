//! Keep-alive scheduling for idle shockers.
//!
//! Receivers disarm when they hear nothing for a while. The keep-alive task
//! remembers when every shocker was last active and, once a shocker has been
//! idle for a full interval, sends it a zero-intensity vibrate through the
//! shared transmitter.
//!
//! ## Structure
//!
//! - [`KeepAliveSchedule`]: the activity map and due-time arithmetic, free of
//!   threads so it can be driven with simulated time
//! - [`KeepAliveService`]: owns the background task and its bounded activity
//!   queue; enabling and disabling are idempotent
//!
//! The activity map is owned by the task alone. Everyone else posts messages.

use crate::clock::Clock;
use crate::consts::{
    KEEP_ALIVE_DURATION_MS, KEEP_ALIVE_INTERVAL_MS, KEEP_ALIVE_QUEUE_CAPACITY,
    QUEUE_SEND_TIMEOUT_MS, TASK_SHUTDOWN_POLL_MS,
};
use crate::encoding::{ShockerCommandType, ShockerModel};
use crate::transmitter::TransmitterSlot;
use core::fmt;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Keep-alive tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Idle time after which a shocker receives a keep-alive.
    pub interval_ms: i64,
    /// Duration of the keep-alive vibrate.
    pub pulse_duration_ms: u16,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: KEEP_ALIVE_INTERVAL_MS,
            pulse_duration_ms: KEEP_ALIVE_DURATION_MS,
        }
    }
}

/// Last known state of one shocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedShocker {
    /// Hardware family, needed to encode the keep-alive.
    pub model: ShockerModel,
    /// When the shocker was last active. May lie in the future while a
    /// command is still running.
    pub last_activity_ms: i64,
}

/// Activity map and due-time computation.
///
/// Entries are never removed: an idle shocker keeps getting a keep-alive
/// once per interval for as long as the hub runs.
#[derive(Debug, Clone)]
pub struct KeepAliveSchedule {
    interval_ms: i64,
    shockers: HashMap<u16, TrackedShocker>,
}

impl Default for KeepAliveSchedule {
    fn default() -> Self {
        Self::new(KEEP_ALIVE_INTERVAL_MS)
    }
}

impl KeepAliveSchedule {
    /// An empty schedule with the given interval.
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            shockers: HashMap::new(),
        }
    }

    /// Records activity; a later record for the same id replaces the earlier one.
    pub fn record(&mut self, shocker_id: u16, model: ShockerModel, at_ms: i64) {
        let _ = self.shockers.insert(
            shocker_id,
            TrackedShocker {
                model,
                last_activity_ms: at_ms,
            },
        );
    }

    /// State of one shocker, if it was ever seen.
    pub fn get(&self, shocker_id: u16) -> Option<&TrackedShocker> {
        self.shockers.get(&shocker_id)
    }

    /// Number of tracked shockers.
    pub fn len(&self) -> usize {
        self.shockers.len()
    }

    /// Whether no shocker has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.shockers.is_empty()
    }

    /// Shockers idle for longer than the interval at `now_ms`.
    ///
    /// Their activity is reset to `now_ms`, so each one is returned once per
    /// interval.
    pub fn collect_due(&mut self, now_ms: i64) -> Vec<(u16, ShockerModel)> {
        let mut due = Vec::new();
        for (&id, shocker) in self.shockers.iter_mut() {
            if shocker.last_activity_ms + self.interval_ms < now_ms {
                shocker.last_activity_ms = now_ms;
                due.push((id, shocker.model));
            }
        }
        due.sort_unstable_by_key(|(id, _)| *id);
        due
    }

    /// Milliseconds until the earliest keep-alive, within `0..=interval`.
    pub fn next_wake_ms(&self, now_ms: i64) -> i64 {
        self.shockers
            .values()
            .map(|s| s.last_activity_ms + self.interval_ms - now_ms)
            .min()
            .unwrap_or(self.interval_ms)
            .clamp(0, self.interval_ms)
    }
}

#[derive(Debug)]
enum KeepAliveMessage {
    Activity {
        shocker_id: u16,
        model: ShockerModel,
        at_ms: i64,
    },
    Kill,
}

fn keep_alive_loop(
    rx: Receiver<KeepAliveMessage>,
    slot: Arc<TransmitterSlot>,
    clock: Arc<dyn Clock>,
    config: KeepAliveConfig,
) {
    debug!("Keep-alive task started");
    let mut schedule = KeepAliveSchedule::new(config.interval_ms);
    let mut wait_ms = config.interval_ms;

    'run: loop {
        let first = match rx.recv_timeout(Duration::from_millis(wait_ms.unsigned_abs())) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break 'run,
        };

        for msg in first.into_iter().chain(rx.try_iter()) {
            match msg {
                KeepAliveMessage::Activity {
                    shocker_id,
                    model,
                    at_ms,
                } => schedule.record(shocker_id, model, at_ms),
                KeepAliveMessage::Kill => break 'run,
            }
        }

        let now = clock.now_ms();
        for (shocker_id, model) in schedule.collect_due(now) {
            trace!("Sending keep-alive for shocker {shocker_id} ({model})");
            // Activity was already advanced; a failed send waits for the next interval
            if let Err(e) = slot.send_command(
                model,
                shocker_id,
                ShockerCommandType::Vibrate,
                0,
                config.pulse_duration_ms,
                false,
            ) {
                warn!("Failed to send keep-alive for shocker {shocker_id}: {e}");
            }
        }

        wait_ms = schedule.next_wake_ms(clock.now_ms());
    }

    debug!("Keep-alive task stopped");
}

#[derive(Debug)]
struct KeepAliveTask {
    queue: Sender<KeepAliveMessage>,
    handle: JoinHandle<()>,
}

impl KeepAliveTask {
    /// Sends the kill message and waits for the task to exit.
    fn shutdown(self) {
        let poll = Duration::from_millis(TASK_SHUTDOWN_POLL_MS);
        while !self.handle.is_finished() {
            if self.queue.send_timeout(KeepAliveMessage::Kill, poll).is_ok() {
                break;
            }
        }
        while !self.handle.is_finished() {
            thread::sleep(poll);
        }
        if self.handle.join().is_err() {
            error!("Keep-alive task panicked");
        }
    }
}

/// Owner of the keep-alive background task.
pub struct KeepAliveService {
    slot: Arc<TransmitterSlot>,
    clock: Arc<dyn Clock>,
    config: KeepAliveConfig,
    task: RwLock<Option<KeepAliveTask>>,
}

impl fmt::Debug for KeepAliveService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAliveService")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl KeepAliveService {
    /// A disabled service sending keep-alives through `slot`.
    pub fn new(slot: Arc<TransmitterSlot>, clock: Arc<dyn Clock>, config: KeepAliveConfig) -> Self {
        Self {
            slot,
            clock,
            config,
            task: RwLock::new(None),
        }
    }

    /// Whether the background task is running.
    pub fn is_enabled(&self) -> bool {
        self.task.read().is_some()
    }

    /// Starts or stops the background task.
    ///
    /// Requesting the current state is a no-op. Disabling returns only once
    /// the task has exited.
    ///
    /// # Returns
    /// `false` only when the task could not be started.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let mut task = self.task.write();

        if enabled == task.is_some() {
            return true;
        }

        if !enabled {
            if let Some(running) = task.take() {
                running.shutdown();
            }
            info!("Keep-alive disabled");
            return true;
        }

        let (queue, rx) = bounded(KEEP_ALIVE_QUEUE_CAPACITY);
        let slot = Arc::clone(&self.slot);
        let clock = Arc::clone(&self.clock);
        let config = self.config;
        match thread::Builder::new()
            .name("keep-alive".into())
            .spawn(move || keep_alive_loop(rx, slot, clock, config))
        {
            Ok(handle) => {
                *task = Some(KeepAliveTask { queue, handle });
                info!("Keep-alive enabled");
                true
            }
            Err(e) => {
                error!("Failed to start keep-alive task: {e}");
                false
            }
        }
    }

    /// Tells the task that `shocker_id` is active until `at_ms`.
    ///
    /// # Returns
    /// `false` when keep-alive is disabled or its queue stayed full.
    pub fn notify_activity(&self, shocker_id: u16, model: ShockerModel, at_ms: i64) -> bool {
        let task = self.task.read();
        let Some(task) = task.as_ref() else {
            return false;
        };

        let msg = KeepAliveMessage::Activity {
            shocker_id,
            model,
            at_ms,
        };
        match task
            .queue
            .send_timeout(msg, Duration::from_millis(QUEUE_SEND_TIMEOUT_MS))
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to post keep-alive activity for shocker {shocker_id}: {e}");
                false
            }
        }
    }
}

impl Drop for KeepAliveService {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.shutdown();
        }
    }
}
