//! Physical OOK output for 433 MHz transmitter modules.
//!
//! This module provides the [`PulseWriter`] boundary the transmit loop talks
//! to, and [`PinPulseWriter`], a bit-banging implementation over
//! `embedded-hal` digital output and delay traits.
//!
//! Transmission is On-Off Keying: for each [`Pulse`] the data line is driven
//! `HIGH` (carrier on) for `high_us`, then `LOW` (carrier off) for `low_us`.
//! After a full sequence the line stays `LOW` for the frame gap, which bounds
//! how closely two frames can follow each other on air.
//!
//! ## Example
//!
//! ```rust
//! # use embedded_hal_mock::eh1::digital::{Mock as Pin, State as PinState, Transaction as PinTransaction};
//! # use embedded_hal_mock::eh1::delay::NoopDelay;
//! use shocker_hub::encoding::Pulse;
//! use shocker_hub::radio::{PinPulseWriter, PulseWriter};
//!
//! # let pin = Pin::new(&[
//! #     PinTransaction::set(PinState::Low),
//! #     PinTransaction::set(PinState::High),
//! #     PinTransaction::set(PinState::Low),
//! # ]);
//! let mut writer = PinPulseWriter::new(pin, NoopDelay::new(), 5_000).unwrap();
//! writer.write_blocking(&[Pulse::new(750, 750)]).unwrap();
//! # let (mut pin, _) = writer.release();
//! # pin.done();
//! ```

use crate::encoding::Pulse;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, ErrorKind, OutputPin};

/// Failures of the physical radio layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    /// The data pin rejected a level change.
    #[error("transmitter pin write failed: {0:?}")]
    Pin(ErrorKind),
    /// The requested GPIO cannot drive a transmitter.
    #[error("gpio {0} cannot be used as a transmitter output")]
    InvalidPin(u8),
    /// The radio peripheral could not be claimed.
    #[error("radio peripheral unavailable")]
    Unavailable,
}

/// Something that can put a pulse sequence on air.
///
/// Calls block until the whole sequence has been emitted. Implementations
/// are owned by exactly one transmit loop, so they only need to be `Send`.
pub trait PulseWriter: Send {
    /// Emits `sequence`, returning once the line is idle again.
    fn write_blocking(&mut self, sequence: &[Pulse]) -> Result<(), RadioError>;
}

/// Opens a [`PulseWriter`] on a GPIO, the hub's `Initialize(pinSpec)` step.
pub trait RadioFactory: Send + Sync {
    /// Claims `pin` and returns a writer driving it.
    fn open(&self, pin: u8) -> Result<Box<dyn PulseWriter>, RadioError>;
}

/// Current line activity of a [`PinPulseWriter`].
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub enum LineMode {
    /// Line held low, nothing on air.
    #[default]
    Idle,
    /// A sequence is being emitted.
    Tx,
}

/// Bit-banging [`PulseWriter`] over an `embedded-hal` output pin.
///
/// ## Type Parameters
///
/// - `P`: the transmitter data pin
/// - `D`: a delay provider with microsecond resolution
#[derive(Debug)]
pub struct PinPulseWriter<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    pin: P,
    delay: D,
    frame_gap_us: u32,
    /// Current line activity.
    pub mode: LineMode,
    /// Number of sequences emitted in full.
    pub frames_sent: u32,
}

impl<P, D> PinPulseWriter<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    /// Takes ownership of the pin and drives it `LOW` (carrier off).
    ///
    /// # Arguments
    /// - `pin`: transmitter data pin
    /// - `delay`: timing source for slot lengths
    /// - `frame_gap_us`: idle time held after every sequence
    pub fn new(mut pin: P, delay: D, frame_gap_us: u32) -> Result<Self, RadioError> {
        pin.set_low().map_err(|e| RadioError::Pin(e.kind()))?;
        Ok(Self {
            pin,
            delay,
            frame_gap_us,
            mode: LineMode::Idle,
            frames_sent: 0,
        })
    }

    /// Gives back the pin and the delay provider.
    pub fn release(self) -> (P, D) {
        (self.pin, self.delay)
    }

    fn write_line(&mut self, high: bool) -> Result<(), RadioError> {
        let res = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        res.map_err(|e| RadioError::Pin(e.kind()))
    }

    fn emit(&mut self, sequence: &[Pulse]) -> Result<(), RadioError> {
        for pulse in sequence {
            self.write_line(true)?;
            self.delay.delay_us(u32::from(pulse.high_us));
            self.write_line(false)?;
            self.delay.delay_us(u32::from(pulse.low_us));
        }
        Ok(())
    }
}

impl<P, D> PulseWriter for PinPulseWriter<P, D>
where
    P: OutputPin + Send,
    D: DelayNs + Send,
{
    fn write_blocking(&mut self, sequence: &[Pulse]) -> Result<(), RadioError> {
        if sequence.is_empty() {
            return Ok(());
        }

        self.mode = LineMode::Tx;
        let res = self.emit(sequence);
        if res.is_err() {
            // Never leave the carrier on after a failed write
            let _ = self.pin.set_low();
        }
        self.mode = LineMode::Idle;
        res?;

        self.delay.delay_us(self.frame_gap_us);
        self.frames_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };

    #[test]
    fn test_writer_initialization_drives_low() {
        let pin = PinMock::new(&[PinTransaction::set(PinState::Low)]);

        let writer = PinPulseWriter::new(pin, NoopDelay::new(), 0).unwrap();

        assert_eq!(writer.mode, LineMode::Idle);
        assert_eq!(writer.frames_sent, 0);
        let (mut pin, _) = writer.release();
        pin.done();
    }

    #[test]
    fn test_write_sequence_toggles_line_per_slot() {
        let pin = PinMock::new(&[
            PinTransaction::set(PinState::Low),
            PinTransaction::set(PinState::High),
            PinTransaction::set(PinState::Low),
            PinTransaction::set(PinState::High),
            PinTransaction::set(PinState::Low),
        ]);
        let mut writer = PinPulseWriter::new(pin, NoopDelay::new(), 5_000).unwrap();

        writer
            .write_blocking(&[Pulse::new(750, 750), Pulse::new(200, 1500)])
            .unwrap();

        assert_eq!(writer.frames_sent, 1);
        assert_eq!(writer.mode, LineMode::Idle);
        let (mut pin, _) = writer.release();
        pin.done();
    }

    #[test]
    fn test_empty_sequence_is_not_a_frame() {
        let pin = PinMock::new(&[PinTransaction::set(PinState::Low)]);
        let mut writer = PinPulseWriter::new(pin, NoopDelay::new(), 5_000).unwrap();

        writer.write_blocking(&[]).unwrap();

        assert_eq!(writer.frames_sent, 0);
        let (mut pin, _) = writer.release();
        pin.done();
    }
}
