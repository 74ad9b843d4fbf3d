// ── Fan field codes and value helpers ──
//
// The relay speaks in short field codes. Everything that knows what
// `H02` means lives here.

use serde::Serialize;
use serde_json::Value;

use fansync_api::Status;

pub const KEY_POWER: &str = "H00";
pub const KEY_PRESET: &str = "H01";
pub const KEY_SPEED: &str = "H02";
pub const KEY_DIRECTION: &str = "H06";
pub const KEY_LIGHT_POWER: &str = "H0B";
pub const KEY_LIGHT_BRIGHTNESS: &str = "H0C";

/// Fields an optimistic command may cover.
pub const OVERLAY_KEYS: [&str; 6] = [
    KEY_POWER,
    KEY_PRESET,
    KEY_SPEED,
    KEY_DIRECTION,
    KEY_LIGHT_POWER,
    KEY_LIGHT_BRIGHTNESS,
];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PresetMode {
    Normal,
    #[strum(to_string = "fresh_air", serialize = "fresh-air")]
    FreshAir,
}

impl PresetMode {
    pub fn code(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::FreshAir => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::FreshAir),
            _ => None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn code(self) -> i64 {
        match self {
            Self::Forward => 0,
            Self::Reverse => 1,
        }
    }

    /// Anything but 0 reads as reverse.
    pub fn from_code(code: i64) -> Self {
        if code == 0 { Self::Forward } else { Self::Reverse }
    }
}

/// Clamp a speed or brightness percentage to the device range `1..=100`.
pub fn clamp_percentage(value: i64) -> u8 {
    u8::try_from(value.clamp(1, 100)).unwrap_or(100)
}

/// Map an 8-bit brightness (`0..=255`) to a device percentage.
/// `None` means full brightness.
pub fn brightness_to_pct(brightness: Option<u8>) -> u8 {
    match brightness {
        None => 100,
        Some(b) => clamp_percentage(i64::from(b) * 100 / 255),
    }
}

/// Map a device percentage to an 8-bit brightness.
pub fn pct_to_brightness(pct: u8) -> u8 {
    u8::try_from(u32::from(pct.min(100)) * 255 / 100).unwrap_or(u8::MAX)
}

/// Integer value of a field. The relay sometimes sends numbers as strings.
pub fn status_int(status: &Status, key: &str) -> Option<i64> {
    value_int(status.get(key)?)
}

pub(crate) fn value_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(f64_to_i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn f64_to_i64(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract().abs() < f64::EPSILON).then_some(f as i64)
}

/// Readable view of one device's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanState {
    pub is_on: bool,
    pub percentage: u8,
    pub direction: Direction,
    pub preset: Option<PresetMode>,
    pub light_on: bool,
    /// Light brightness percentage.
    pub light_brightness: u8,
}

impl FanState {
    pub fn from_status(status: &Status) -> Self {
        let int = |key| status_int(status, key).unwrap_or(0);
        Self {
            is_on: int(KEY_POWER) == 1,
            percentage: u8::try_from(int(KEY_SPEED).clamp(0, 100)).unwrap_or(0),
            direction: Direction::from_code(int(KEY_DIRECTION)),
            preset: PresetMode::from_code(int(KEY_PRESET)),
            light_on: int(KEY_LIGHT_POWER) == 1,
            light_brightness: u8::try_from(int(KEY_LIGHT_BRIGHTNESS).clamp(0, 100)).unwrap_or(0),
        }
    }
}
