//! Radio state types shared across the workspace.
//!
//! These are the enumerations the CI-V controller mirrors: operating
//! mode, IF filter, split/duplex state, AGC, preamp, and the tuning
//! step table. Each carries its CI-V wire code so the codec layers
//! never hard-code magic bytes.

use std::fmt;
use std::str::FromStr;

/// Operating mode of the transceiver.
///
/// The set the IC-705 reports via CI-V command 0x04/0x26, with the
/// wire code of each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Lower sideband voice.
    LSB,
    /// Upper sideband voice.
    USB,
    /// Amplitude modulation.
    AM,
    /// CW (morse).
    CW,
    /// Radio teletype (FSK).
    RTTY,
    /// Frequency modulation.
    FM,
    /// Wide FM (broadcast receive).
    WFM,
    /// CW reverse sideband.
    CWR,
    /// RTTY reverse sideband.
    RTTYR,
    /// D-Star digital voice.
    DV,
}

/// All modes in wire-code order.
const ALL_MODES: &[Mode] = &[
    Mode::LSB,
    Mode::USB,
    Mode::AM,
    Mode::CW,
    Mode::RTTY,
    Mode::FM,
    Mode::WFM,
    Mode::CWR,
    Mode::RTTYR,
    Mode::DV,
];

impl Mode {
    /// The CI-V code for this mode.
    pub fn code(&self) -> u8 {
        match self {
            Mode::LSB => 0x00,
            Mode::USB => 0x01,
            Mode::AM => 0x02,
            Mode::CW => 0x03,
            Mode::RTTY => 0x04,
            Mode::FM => 0x05,
            Mode::WFM => 0x06,
            Mode::CWR => 0x07,
            Mode::RTTYR => 0x08,
            Mode::DV => 0x17,
        }
    }

    /// Look up a mode by its CI-V code.
    pub fn from_code(code: u8) -> Option<Mode> {
        ALL_MODES.iter().copied().find(|m| m.code() == code)
    }

    /// All modes, in the order the radio cycles through them.
    pub fn all() -> &'static [Mode] {
        ALL_MODES
    }

    /// The next mode in cycle order, wrapping.
    pub fn next(&self) -> Mode {
        let i = ALL_MODES.iter().position(|m| m == self).unwrap_or(0);
        ALL_MODES[(i + 1) % ALL_MODES.len()]
    }

    /// The previous mode in cycle order, wrapping.
    pub fn prev(&self) -> Mode {
        let i = ALL_MODES.iter().position(|m| m == self).unwrap_or(0);
        ALL_MODES[(i + ALL_MODES.len() - 1) % ALL_MODES.len()]
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::LSB => "LSB",
            Mode::USB => "USB",
            Mode::AM => "AM",
            Mode::CW => "CW",
            Mode::RTTY => "RTTY",
            Mode::FM => "FM",
            Mode::WFM => "WFM",
            Mode::CWR => "CW-R",
            Mode::RTTYR => "RTTY-R",
            Mode::DV => "DV",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into a [`Mode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError(String);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown mode: {}", self.0)
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LSB" => Ok(Mode::LSB),
            "USB" => Ok(Mode::USB),
            "AM" => Ok(Mode::AM),
            "CW" => Ok(Mode::CW),
            "RTTY" => Ok(Mode::RTTY),
            "FM" => Ok(Mode::FM),
            "WFM" => Ok(Mode::WFM),
            "CW-R" | "CWR" => Ok(Mode::CWR),
            "RTTY-R" | "RTTYR" => Ok(Mode::RTTYR),
            "DV" => Ok(Mode::DV),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// IF filter selection (FIL1 is widest, FIL3 narrowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    /// Filter 1 (wide).
    #[default]
    Fil1,
    /// Filter 2 (mid).
    Fil2,
    /// Filter 3 (narrow).
    Fil3,
}

impl Filter {
    /// The CI-V code for this filter (1-based).
    pub fn code(&self) -> u8 {
        match self {
            Filter::Fil1 => 0x01,
            Filter::Fil2 => 0x02,
            Filter::Fil3 => 0x03,
        }
    }

    /// Look up a filter by its CI-V code. Unknown codes fall back to
    /// FIL1, matching the radio's own default.
    pub fn from_code(code: u8) -> Filter {
        match code {
            0x02 => Filter::Fil2,
            0x03 => Filter::Fil3,
            _ => Filter::Fil1,
        }
    }

    /// The next filter in cycle order, wrapping.
    pub fn next(&self) -> Filter {
        match self {
            Filter::Fil1 => Filter::Fil2,
            Filter::Fil2 => Filter::Fil3,
            Filter::Fil3 => Filter::Fil1,
        }
    }

    /// The previous filter in cycle order, wrapping.
    pub fn prev(&self) -> Filter {
        match self {
            Filter::Fil1 => Filter::Fil3,
            Filter::Fil2 => Filter::Fil1,
            Filter::Fil3 => Filter::Fil2,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Filter::Fil1 => "FIL1",
            Filter::Fil2 => "FIL2",
            Filter::Fil3 => "FIL3",
        };
        write!(f, "{s}")
    }
}

/// Split / duplex operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SplitMode {
    /// Simplex.
    #[default]
    Off,
    /// Split: TX on the inactive VFO.
    On,
    /// Duplex with negative offset.
    DupMinus,
    /// Duplex with positive offset.
    DupPlus,
}

impl SplitMode {
    /// The CI-V code sent with command 0x0F to select this state.
    pub fn code(&self) -> u8 {
        match self {
            SplitMode::Off => 0x10,
            SplitMode::On => 0x01,
            SplitMode::DupMinus => 0x11,
            SplitMode::DupPlus => 0x12,
        }
    }

    /// Decode the CI-V split status byte. Anything unrecognized reads
    /// as off, which is what the radio reports for plain simplex.
    pub fn from_code(code: u8) -> SplitMode {
        match code {
            0x01 => SplitMode::On,
            0x11 => SplitMode::DupMinus,
            0x12 => SplitMode::DupPlus,
            _ => SplitMode::Off,
        }
    }

    /// Cycle order used by the split toggle: off, on, dup-, dup+, off.
    pub fn next(&self) -> SplitMode {
        match self {
            SplitMode::Off => SplitMode::On,
            SplitMode::On => SplitMode::DupMinus,
            SplitMode::DupMinus => SplitMode::DupPlus,
            SplitMode::DupPlus => SplitMode::Off,
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SplitMode::Off => "OFF",
            SplitMode::On => "SPLIT",
            SplitMode::DupMinus => "DUP-",
            SplitMode::DupPlus => "DUP+",
        };
        write!(f, "{s}")
    }
}

/// AGC time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgcMode {
    /// Fast attack/release.
    #[default]
    Fast,
    /// Medium.
    Mid,
    /// Slow.
    Slow,
}

impl AgcMode {
    /// The CI-V code (1-based) for command 0x16 0x12.
    pub fn code(&self) -> u8 {
        match self {
            AgcMode::Fast => 1,
            AgcMode::Mid => 2,
            AgcMode::Slow => 3,
        }
    }

    /// Look up an AGC mode by its CI-V code.
    pub fn from_code(code: u8) -> Option<AgcMode> {
        match code {
            1 => Some(AgcMode::Fast),
            2 => Some(AgcMode::Mid),
            3 => Some(AgcMode::Slow),
            _ => None,
        }
    }

    /// The next mode in rotation order (fast, mid, slow, fast).
    pub fn next(&self) -> AgcMode {
        match self {
            AgcMode::Fast => AgcMode::Mid,
            AgcMode::Mid => AgcMode::Slow,
            AgcMode::Slow => AgcMode::Fast,
        }
    }
}

impl fmt::Display for AgcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgcMode::Fast => "F",
            AgcMode::Mid => "M",
            AgcMode::Slow => "S",
        };
        write!(f, "{s}")
    }
}

/// Preamplifier setting: 0 = off, 1 = P.AMP1, 2 = P.AMP2.
///
/// On VHF/UHF the radio only distinguishes off/on; "on" reads as 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PreampLevel(u8);

impl PreampLevel {
    /// Preamp off.
    pub const OFF: PreampLevel = PreampLevel(0);

    /// Create from the raw CI-V byte, clamping to the valid 0..=2 range.
    pub fn from_code(code: u8) -> PreampLevel {
        PreampLevel(code.min(2))
    }

    /// The raw CI-V byte.
    pub fn code(&self) -> u8 {
        self.0
    }

    /// The next level in rotation order (0, 1, 2, 0).
    pub fn next(&self) -> PreampLevel {
        PreampLevel(if self.0 >= 2 { 0 } else { self.0 + 1 })
    }
}

impl fmt::Display for PreampLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "OFF"),
            n => write!(f, "P{n}"),
        }
    }
}

/// Tuning step selection, index 0..=13 into the radio's step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TuningStep(u8);

/// Step sizes in hertz, indexed by the CI-V tuning-step value.
const STEP_TABLE: [u32; 14] = [
    1, 100, 500, 1_000, 5_000, 6_250, 8_330, 9_000, 10_000, 12_500, 20_000, 25_000, 50_000,
    100_000,
];

impl TuningStep {
    /// Create from the raw CI-V byte. Out-of-range values clamp to the
    /// 1 Hz step, matching the radio's default reporting.
    pub fn from_code(code: u8) -> TuningStep {
        if (code as usize) < STEP_TABLE.len() {
            TuningStep(code)
        } else {
            TuningStep(0)
        }
    }

    /// The raw CI-V byte (0..=13).
    pub fn code(&self) -> u8 {
        self.0
    }

    /// The step size in hertz.
    pub fn hz(&self) -> u32 {
        STEP_TABLE[self.0 as usize]
    }

    /// The next larger step, wrapping to the smallest.
    pub fn next(&self) -> TuningStep {
        TuningStep(if self.0 as usize == STEP_TABLE.len() - 1 {
            0
        } else {
            self.0 + 1
        })
    }

    /// The next smaller step, wrapping to the largest.
    pub fn prev(&self) -> TuningStep {
        TuningStep(if self.0 == 0 {
            (STEP_TABLE.len() - 1) as u8
        } else {
            self.0 - 1
        })
    }
}

impl fmt::Display for TuningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hz = self.hz();
        if hz >= 1_000 {
            write!(f, "{}k", hz as f64 / 1_000.0)
        } else {
            write!(f, "{hz}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes_round_trip() {
        for &mode in Mode::all() {
            assert_eq!(Mode::from_code(mode.code()), Some(mode));
        }
    }

    #[test]
    fn mode_dv_code() {
        // DV is the one mode whose code is not contiguous with the rest.
        assert_eq!(Mode::DV.code(), 0x17);
        assert_eq!(Mode::from_code(0x17), Some(Mode::DV));
    }

    #[test]
    fn mode_unknown_code() {
        assert_eq!(Mode::from_code(0x09), None);
        assert_eq!(Mode::from_code(0xFF), None);
    }

    #[test]
    fn mode_cycle_wraps() {
        assert_eq!(Mode::DV.next(), Mode::LSB);
        assert_eq!(Mode::LSB.prev(), Mode::DV);
        assert_eq!(Mode::USB.next(), Mode::AM);
    }

    #[test]
    fn mode_display_round_trip() {
        for &mode in Mode::all() {
            let parsed: Mode = mode.to_string().parse().expect("should round-trip");
            assert_eq!(mode, parsed);
        }
    }

    #[test]
    fn filter_codes() {
        assert_eq!(Filter::Fil1.code(), 0x01);
        assert_eq!(Filter::from_code(0x03), Filter::Fil3);
        // Unknown codes fall back to FIL1.
        assert_eq!(Filter::from_code(0x00), Filter::Fil1);
        assert_eq!(Filter::from_code(0x7F), Filter::Fil1);
    }

    #[test]
    fn filter_cycle() {
        assert_eq!(Filter::Fil3.next(), Filter::Fil1);
        assert_eq!(Filter::Fil1.prev(), Filter::Fil3);
    }

    #[test]
    fn split_codes() {
        assert_eq!(SplitMode::from_code(0x01), SplitMode::On);
        assert_eq!(SplitMode::from_code(0x11), SplitMode::DupMinus);
        assert_eq!(SplitMode::from_code(0x12), SplitMode::DupPlus);
        assert_eq!(SplitMode::from_code(0x00), SplitMode::Off);
    }

    #[test]
    fn split_cycle_covers_all() {
        let mut mode = SplitMode::Off;
        let mut seen = vec![mode];
        for _ in 0..3 {
            mode = mode.next();
            seen.push(mode);
        }
        assert_eq!(
            seen,
            vec![
                SplitMode::Off,
                SplitMode::On,
                SplitMode::DupMinus,
                SplitMode::DupPlus
            ]
        );
        assert_eq!(mode.next(), SplitMode::Off);
    }

    #[test]
    fn agc_rotation() {
        assert_eq!(AgcMode::Fast.next(), AgcMode::Mid);
        assert_eq!(AgcMode::Slow.next(), AgcMode::Fast);
        assert_eq!(AgcMode::from_code(2), Some(AgcMode::Mid));
        assert_eq!(AgcMode::from_code(0), None);
    }

    #[test]
    fn preamp_rotation() {
        let p = PreampLevel::OFF;
        assert_eq!(p.next().code(), 1);
        assert_eq!(p.next().next().code(), 2);
        assert_eq!(p.next().next().next().code(), 0);
    }

    #[test]
    fn preamp_clamps() {
        assert_eq!(PreampLevel::from_code(9).code(), 2);
    }

    #[test]
    fn tuning_step_table() {
        assert_eq!(TuningStep::from_code(0).hz(), 1);
        assert_eq!(TuningStep::from_code(1).hz(), 100);
        assert_eq!(TuningStep::from_code(6).hz(), 8_330);
        assert_eq!(TuningStep::from_code(13).hz(), 100_000);
    }

    #[test]
    fn tuning_step_out_of_range_clamps() {
        assert_eq!(TuningStep::from_code(14).hz(), 1);
        assert_eq!(TuningStep::from_code(0xFF).code(), 0);
    }

    #[test]
    fn tuning_step_wraps() {
        assert_eq!(TuningStep::from_code(13).next().code(), 0);
        assert_eq!(TuningStep::from_code(0).prev().code(), 13);
        assert_eq!(TuningStep::from_code(5).next().code(), 6);
    }

    #[test]
    fn tuning_step_display() {
        assert_eq!(TuningStep::from_code(0).to_string(), "1");
        assert_eq!(TuningStep::from_code(3).to_string(), "1k");
        assert_eq!(TuningStep::from_code(9).to_string(), "12.5k");
    }
}
