//! CI-V numeric encodings: BCD frequencies, level bytes, meter scales.
//!
//! Frequencies travel as 5-byte little-endian BCD (two decimal digits
//! per byte, low byte first). Level controls (power, gain, squelch,
//! noise reduction) use a two-byte form the radio was reverse-
//! engineered against: a hundreds digit followed by a binary 0..=99
//! remainder. Meter readings come back in the same two-byte form and
//! are mapped onto S-units, SWR, and volts here.

/// Convert a frequency in hertz to 5-byte BCD, least significant byte
/// first. Covers the full 10-digit range (up to 9,999,999,999 Hz).
///
/// # Example
///
/// ```
/// use shacklink_civ::bcd::freq_to_bcd;
///
/// // 14.250 MHz
/// assert_eq!(freq_to_bcd(14_250_000), [0x00, 0x00, 0x25, 0x14, 0x00]);
/// ```
pub fn freq_to_bcd(freq_hz: u64) -> [u8; 5] {
    let mut out = [0u8; 5];
    let mut rest = freq_hz;
    for byte in &mut out {
        let lo = (rest % 10) as u8;
        rest /= 10;
        let hi = (rest % 10) as u8;
        rest /= 10;
        *byte = (hi << 4) | lo;
    }
    out
}

/// Convert little-endian BCD bytes back to hertz. Accepts any length;
/// the inverse of [`freq_to_bcd`] for 5-byte input.
pub fn bcd_to_freq(bcd: &[u8]) -> u64 {
    let mut freq: u64 = 0;
    let mut scale: u64 = 1;
    for &byte in bcd {
        freq += (byte & 0x0F) as u64 * scale;
        scale *= 10;
        freq += ((byte >> 4) & 0x0F) as u64 * scale;
        scale *= 10;
    }
    freq
}

/// Encode a 0..=255 level into its two-byte wire form via the
/// shift-and-add-3 (double dabble) routine: the high byte is the
/// hundreds digit, the low byte the remaining 0..=99 in binary.
///
/// This is not textbook packed BCD, but it is what the radio side was
/// reverse-engineered against, so it is preserved bit-for-bit.
pub fn encode_level(level: u8) -> [u8; 2] {
    let mut v = (level as u32) << 3;
    for _ in 3..8 {
        // Add 3 to the ones or tens digit when it is 5 or more, then
        // shift left.
        if v & 0x00F00 > 0x00400 {
            v += 0x00300;
        }
        if v & 0x0F000 > 0x04000 {
            v += 0x03000;
        }
        v <<= 1;
    }
    let hundreds = ((v & 0xF0000) >> 16) as u8;
    let tens = ((v & 0x0F000) >> 12) as u8;
    let ones = ((v & 0x00F00) >> 8) as u8;
    [hundreds, tens * 10 + ones]
}

/// Decode the two-byte level form back to its value.
pub fn decode_level(data: &[u8]) -> u16 {
    match data {
        [hundreds, rest, ..] => *hundreds as u16 * 100 + *rest as u16,
        [only] => *only as u16,
        [] => 0,
    }
}

/// Map a raw S-meter reading (0..=241) to an S-level index 0..=18:
/// S0 through S9, then seven "plus" steps above S9.
///
/// Anchors: 0 reads S0, 120 reads S9, 241 reads S9+60.
pub fn s_level(raw: u16) -> u8 {
    (((raw as u32) * 18 + 120) / 241).min(18) as u8
}

/// Render an S-level index as the conventional meter label.
///
/// Indices 13 through 16 all render "S9+40"; the radio's plus scale
/// collapses those buckets.
pub fn s_label(level: u8) -> String {
    match level {
        0..=9 => format!("S{level}"),
        10 => "S9+10".to_string(),
        11 => "S9+20".to_string(),
        12 => "S9+30".to_string(),
        13..=16 => "S9+40".to_string(),
        17 | 18 => "S9+50".to_string(),
        _ => "S9+60".to_string(),
    }
}

/// Map a raw SWR reading to a ratio.
///
/// The radio's scale is nonlinear (0 -> 1.0, 48 -> 1.5, 80 -> 2.0,
/// 120 -> 3.0) but this linear form is what the original controller
/// shipped with, and it is kept deliberately: a lookup table would
/// change reported values for identical wire bytes.
pub fn swr_from_raw(raw: u16) -> f64 {
    1.0 + (raw as f64 / 120.0) * 2.0
}

/// Map a raw drain-voltage reading (0..=241) linearly onto 0..=16 V.
pub fn vd_from_raw(raw: u16) -> f64 {
    (raw as f64 / 241.0) * 16.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_bcd_known_values() {
        assert_eq!(freq_to_bcd(14_250_000), [0x00, 0x00, 0x25, 0x14, 0x00]);
        assert_eq!(freq_to_bcd(7_000_000), [0x00, 0x00, 0x00, 0x07, 0x00]);
        assert_eq!(freq_to_bcd(1_800_000), [0x00, 0x00, 0x80, 0x01, 0x00]);
        assert_eq!(freq_to_bcd(432_100_000), [0x00, 0x00, 0x10, 0x32, 0x04]);
    }

    #[test]
    fn freq_bcd_round_trip() {
        // Encode/decode identity across the 10-digit range.
        for &f in &[
            0u64,
            1,
            30_000,
            7_074_123,
            14_250_000,
            145_500_000,
            440_000_000,
            9_999_999_999,
        ] {
            assert_eq!(bcd_to_freq(&freq_to_bcd(f)), f, "freq {f}");
        }
    }

    #[test]
    fn freq_bcd_max_is_all_nines() {
        assert_eq!(
            freq_to_bcd(9_999_999_999),
            [0x99, 0x99, 0x99, 0x99, 0x99]
        );
    }

    #[test]
    fn level_known_values() {
        assert_eq!(encode_level(0), [0, 0]);
        assert_eq!(encode_level(99), [0, 99]);
        assert_eq!(encode_level(100), [1, 0]);
        assert_eq!(encode_level(255), [2, 55]);
    }

    #[test]
    fn level_round_trip_full_range() {
        for level in 0..=255u8 {
            let wire = encode_level(level);
            assert_eq!(decode_level(&wire), level as u16, "level {level}");
        }
    }

    #[test]
    fn decode_level_degenerate_inputs() {
        assert_eq!(decode_level(&[]), 0);
        assert_eq!(decode_level(&[7]), 7);
        // Extra trailing bytes are ignored.
        assert_eq!(decode_level(&[1, 23, 0xFF]), 123);
    }

    #[test]
    fn s_level_anchors() {
        assert_eq!(s_level(0), 0);
        assert_eq!(s_level(120), 9);
        assert_eq!(s_level(241), 18);
    }

    #[test]
    fn s_level_monotonic() {
        let mut prev = 0;
        for raw in 0..=241u16 {
            let l = s_level(raw);
            assert!(l >= prev, "raw {raw}");
            prev = l;
        }
    }

    #[test]
    fn s_labels() {
        assert_eq!(s_label(0), "S0");
        assert_eq!(s_label(7), "S7");
        assert_eq!(s_label(9), "S9");
        assert_eq!(s_label(10), "S9+10");
        assert_eq!(s_label(12), "S9+30");
        // The collapsed bucket.
        for l in 13..=16 {
            assert_eq!(s_label(l), "S9+40");
        }
        assert_eq!(s_label(17), "S9+50");
        assert_eq!(s_label(18), "S9+50");
    }

    #[test]
    fn swr_keeps_linear_form() {
        assert!((swr_from_raw(0) - 1.0).abs() < 1e-9);
        assert!((swr_from_raw(120) - 3.0).abs() < 1e-9);
        // The deliberate deviation from the nonlinear table: 48 reads
        // 1.8, not 1.5.
        assert!((swr_from_raw(48) - 1.8).abs() < 1e-9);
    }

    #[test]
    fn vd_scale() {
        assert!((vd_from_raw(0) - 0.0).abs() < 1e-9);
        assert!((vd_from_raw(241) - 16.0).abs() < 1e-9);
        assert!((vd_from_raw(120) - 7.966).abs() < 1e-2);
    }
}
