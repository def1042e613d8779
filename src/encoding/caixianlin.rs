use super::{Pulse, PulseSequence, ShockerCommandType, encode_bits};
use crate::checksum::sum8;

pub(super) const MAX_INTENSITY: u8 = 99;

const PREAMBLE: Pulse = Pulse::new(1400, 800);
const ONE: Pulse = Pulse::new(800, 300);
const ZERO: Pulse = Pulse::new(300, 800);

// Hubs address every collar on channel 0.
const CHANNEL: u8 = 0;

pub(super) fn sequence(
    shocker_id: u16,
    command: ShockerCommandType,
    intensity: u8,
) -> Option<PulseSequence> {
    let kind: u8 = match command {
        ShockerCommandType::Shock => 0x1,
        ShockerCommandType::Vibrate => 0x2,
        ShockerCommandType::Sound => 0x3,
        ShockerCommandType::Stop => return None,
    };

    let payload = (u32::from(shocker_id) << 16)
        | (u32::from(CHANNEL & 0x0f) << 12)
        | (u32::from(kind) << 8)
        | u32::from(intensity);
    let data = (u64::from(payload) << 8) | u64::from(sum8(payload));

    let mut out = PulseSequence::new();
    let _ = out.push(PREAMBLE);
    encode_bits(&mut out, data, 40, ONE, ZERO);
    // Trailing zeros close the frame
    for _ in 0..3 {
        let _ = out.push(ZERO);
    }
    Some(out)
}
