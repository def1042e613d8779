//! Shocker command encoding into OOK pulse sequences.
//!
//! Every supported receiver model listens for a frame made of timing slots:
//! a preamble, a fixed-width payload sent MSB first where each bit is either a
//! "one" or a "zero" slot, and a postamble. A slot is a [`Pulse`]: the carrier
//! is switched on for `high_us`, then off for `low_us`.
//!
//! ## Frame layouts
//!
//! | Model            | Payload (40 bits)                                        |
//! |------------------|----------------------------------------------------------|
//! | `CaiXianlin`     | id:16, channel:4, type:4, intensity:8, sum8:8            |
//! | `Petrainer`      | method:8, id:16, intensity:8, mirrored method:8          |
//! | `Petrainer998DR` | channel:4, type:4, id:16, intensity:8, check:8           |
//!
//! ## Functions
//!
//! - [`sequence`]: encodes a command; `Stop` has no on-air form and yields `None`
//! - [`zero_sequence`]: zero-intensity vibrate, used to terminate an action
//!
//! The exact RF waveform of each model is outside this crate; only slot timing
//! is modelled.

mod caixianlin;
mod petrainer;
mod petrainer998dr;

use core::fmt;

/// Longest frame any encoder produces, in slots.
pub const MAX_SEQUENCE_LEN: usize = 64;

/// An encoded frame, ready for [`PulseWriter`](crate::radio::PulseWriter).
pub type PulseSequence = heapless::Vec<Pulse, MAX_SEQUENCE_LEN>;

/// One timing slot: carrier on for `high_us`, then off for `low_us`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct Pulse {
    /// Carrier-on time in microseconds.
    pub high_us: u16,
    /// Carrier-off time in microseconds.
    pub low_us: u16,
}

impl Pulse {
    /// Builds a slot.
    pub const fn new(high_us: u16, low_us: u16) -> Self {
        Self { high_us, low_us }
    }

    /// Total slot length in microseconds.
    pub const fn duration_us(&self) -> u32 {
        self.high_us as u32 + self.low_us as u32
    }
}

/// Receiver hardware families.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShockerModel {
    /// CaiXianlin style collars (also sold under many white labels).
    CaiXianlin,
    /// Petrainer PET998DB/PET916 style collars.
    Petrainer,
    /// Petrainer PET998DR collars.
    Petrainer998DR,
}

impl ShockerModel {
    /// Highest intensity the model accepts; larger values are clamped.
    pub const fn max_intensity(self) -> u8 {
        match self {
            Self::CaiXianlin => caixianlin::MAX_INTENSITY,
            Self::Petrainer => petrainer::MAX_INTENSITY,
            Self::Petrainer998DR => petrainer998dr::MAX_INTENSITY,
        }
    }
}

impl fmt::Display for ShockerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CaiXianlin => "CaiXianlin",
            Self::Petrainer => "Petrainer",
            Self::Petrainer998DR => "Petrainer998DR",
        };
        f.write_str(name)
    }
}

/// What a command asks the receiver to do.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShockerCommandType {
    /// Cancel whatever the receiver is doing.
    Stop,
    /// Electric stimulus.
    Shock,
    /// Vibration motor.
    Vibrate,
    /// Beeper.
    Sound,
}

/// Encodes a command for `model`.
///
/// # Returns
/// - `Some(sequence)`: the frame to put on air
/// - `None`: for [`ShockerCommandType::Stop`], which callers must translate first
pub fn sequence(
    model: ShockerModel,
    shocker_id: u16,
    command: ShockerCommandType,
    intensity: u8,
) -> Option<PulseSequence> {
    let intensity = intensity.min(model.max_intensity());
    match model {
        ShockerModel::CaiXianlin => caixianlin::sequence(shocker_id, command, intensity),
        ShockerModel::Petrainer => petrainer::sequence(shocker_id, command, intensity),
        ShockerModel::Petrainer998DR => petrainer998dr::sequence(shocker_id, command, intensity),
    }
}

/// The zero-intensity vibrate frame that ends an action on `model`.
pub fn zero_sequence(model: ShockerModel, shocker_id: u16) -> PulseSequence {
    sequence(model, shocker_id, ShockerCommandType::Vibrate, 0).unwrap_or_default()
}

/// Appends the low `bits` bits of `data`, MSB first.
pub(crate) fn encode_bits(out: &mut PulseSequence, data: u64, bits: u32, one: Pulse, zero: Pulse) {
    for i in (0..bits).rev() {
        let slot = if (data >> i) & 1 == 1 { one } else { zero };
        let _ = out.push(slot);
    }
}
