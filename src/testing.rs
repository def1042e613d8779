//! Fakes shared by the unit tests.

use crate::encoding::Pulse;
use crate::radio::{PulseWriter, RadioError, RadioFactory};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Routes `log` output to the test harness; safe to call from every test.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` every few milliseconds until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Everything a set of [`RecordingWriter`]s put on air, tagged with the pin.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameLog(Arc<Mutex<Vec<(u8, Vec<Pulse>)>>>);

impl FrameLog {
    pub(crate) fn frames(&self) -> Vec<Vec<Pulse>> {
        self.0.lock().iter().map(|(_, f)| f.clone()).collect()
    }

    pub(crate) fn pins(&self) -> Vec<u8> {
        self.0.lock().iter().map(|(pin, _)| *pin).collect()
    }

    pub(crate) fn count(&self, frame: &[Pulse]) -> usize {
        self.0.lock().iter().filter(|(_, f)| f.as_slice() == frame).count()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().clear();
    }

    fn push(&self, pin: u8, frame: &[Pulse]) {
        self.0.lock().push((pin, frame.to_vec()));
    }
}

/// Handshake for a [`RecordingWriter`] that blocks inside its first write.
#[derive(Debug)]
pub(crate) struct WriteGate {
    pub(crate) entered: Receiver<()>,
    pub(crate) release: Sender<()>,
}

/// [`PulseWriter`] that logs every frame and takes 1 ms of "airtime".
#[derive(Debug)]
pub(crate) struct RecordingWriter {
    pin: u8,
    log: FrameLog,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl RecordingWriter {
    pub(crate) fn new(log: FrameLog) -> Self {
        Self::on_pin(0, log)
    }

    pub(crate) fn on_pin(pin: u8, log: FrameLog) -> Self {
        Self {
            pin,
            log,
            gate: None,
        }
    }

    pub(crate) fn gated(log: FrameLog) -> (Self, WriteGate) {
        let (entered_tx, entered) = bounded(1);
        let (release, release_rx) = bounded(1);
        let writer = Self {
            pin: 0,
            log,
            gate: Some((entered_tx, release_rx)),
        };
        (writer, WriteGate { entered, release })
    }
}

impl PulseWriter for RecordingWriter {
    fn write_blocking(&mut self, sequence: &[Pulse]) -> Result<(), RadioError> {
        if let Some((entered, release)) = self.gate.take() {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.log.push(self.pin, sequence);
        thread::sleep(Duration::from_millis(1));
        Ok(())
    }
}

/// [`RadioFactory`] handing out [`RecordingWriter`]s that share one log.
#[derive(Debug, Default)]
pub(crate) struct FakeRadio {
    pub(crate) log: FrameLog,
    pub(crate) opened: Mutex<Vec<u8>>,
    pub(crate) fail: AtomicBool,
}

impl FakeRadio {
    pub(crate) fn failing() -> Self {
        let radio = Self::default();
        radio.fail.store(true, Ordering::SeqCst);
        radio
    }
}

impl RadioFactory for FakeRadio {
    fn open(&self, pin: u8) -> Result<Box<dyn PulseWriter>, RadioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RadioError::Unavailable);
        }
        self.opened.lock().push(pin);
        Ok(Box::new(RecordingWriter::on_pin(pin, self.log.clone())))
    }
}
