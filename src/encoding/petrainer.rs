use super::{Pulse, PulseSequence, ShockerCommandType, encode_bits};

pub(super) const MAX_INTENSITY: u8 = 100;

const PREAMBLE: Pulse = Pulse::new(750, 750);
const ONE: Pulse = Pulse::new(200, 1500);
const ZERO: Pulse = Pulse::new(200, 750);
const POSTAMBLE: Pulse = Pulse::new(200, 7000);

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
    let method = 0x80 | kind;
    // The receiver checks the trailing byte against the mirrored, inverted method
    let check = !method.reverse_bits();

    let data = (u64::from(method) << 32)
        | (u64::from(shocker_id) << 16)
        | (u64::from(intensity) << 8)
        | u64::from(check);

    let mut out = PulseSequence::new();
    let _ = out.push(PREAMBLE);
    encode_bits(&mut out, data, 40, ONE, ZERO);
    let _ = out.push(POSTAMBLE);
    Some(out)
}
