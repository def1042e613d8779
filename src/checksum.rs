/// 8-bit additive checksum over the big-endian bytes of `data`.
pub(crate) fn sum8(data: u32) -> u8 {
    data.to_be_bytes()
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Mirrors the low nibble of `nibble` (bit 0 <-> bit 3, bit 1 <-> bit 2).
pub(crate) fn reverse_nibble(nibble: u8) -> u8 {
    (nibble & 0x0f).reverse_bits() >> 4
}
