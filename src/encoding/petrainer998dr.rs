use super::{Pulse, PulseSequence, ShockerCommandType, encode_bits};
use crate::checksum::reverse_nibble;

pub(super) const MAX_INTENSITY: u8 = 100;

const PREAMBLE: Pulse = Pulse::new(1500, 750);
const ONE: Pulse = Pulse::new(750, 250);
const ZERO: Pulse = Pulse::new(250, 750);
const POSTAMBLE: Pulse = Pulse::new(250, 3750);

// Channel A
const CHANNEL: u8 = 0b1000;

pub(super) fn sequence(
    shocker_id: u16,
    command: ShockerCommandType,
    intensity: u8,
) -> Option<PulseSequence> {
    let kind: u8 = match command {
        ShockerCommandType::Shock => 0b0001,
        ShockerCommandType::Vibrate => 0b0010,
        ShockerCommandType::Sound => 0b0100,
        ShockerCommandType::Stop => return None,
    };
    let kind_check = !reverse_nibble(kind) & 0x0f;
    let channel_check = !reverse_nibble(CHANNEL) & 0x0f;

    let data = (u64::from(CHANNEL) << 36)
        | (u64::from(kind) << 32)
        | (u64::from(shocker_id) << 16)
        | (u64::from(intensity) << 8)
        | (u64::from(kind_check) << 4)
        | u64::from(channel_check);

    let mut out = PulseSequence::new();
    let _ = out.push(PREAMBLE);
    encode_bits(&mut out, data, 40, ONE, ZERO);
    let _ = out.push(POSTAMBLE);
    Some(out)
}
