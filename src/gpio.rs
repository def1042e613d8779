//! GPIO capability checks for the ESP32 pin map.
//!
//! GPIO 6-11 are wired to the SPI flash and unusable, 34-39 are input only,
//! and 20, 24 and 28-31 do not exist on the package.

/// Highest GPIO number on the chip.
pub const GPIO_MAX: u8 = 39;

fn exists(pin: u8) -> bool {
    pin <= GPIO_MAX && !matches!(pin, 20 | 24 | 28..=31)
}

fn reserved_for_flash(pin: u8) -> bool {
    (6..=11).contains(&pin)
}

/// Whether `pin` can drive an output such as the RF transmitter data line.
pub fn is_valid_output_pin(pin: u8) -> bool {
    exists(pin) && !reserved_for_flash(pin) && pin < 34
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_pins() {
        assert!(is_valid_output_pin(15));
        assert!(is_valid_output_pin(0));
        assert!(is_valid_output_pin(33));
        assert!(!is_valid_output_pin(6));
        assert!(!is_valid_output_pin(24));
        assert!(!is_valid_output_pin(34));
        assert!(!is_valid_output_pin(200));
        assert!(!is_valid_output_pin(36));
        assert!(!is_valid_output_pin(11));
    }
}
