// ── Fan and light commands ──
//
// Every write goes through `FanCommand`. Planning a command yields the
// wire payload, the values to show optimistically, and the check that
// tells us the device actually got there.

use serde_json::{Value, json};

use fansync_api::Status;

use crate::device::{
    Direction, KEY_DIRECTION, KEY_LIGHT_BRIGHTNESS, KEY_LIGHT_POWER, KEY_POWER, KEY_PRESET,
    KEY_SPEED, PresetMode, clamp_percentage, status_int,
};
use crate::overlay::Predicate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanCommand {
    // ── Fan ──────────────────────────────────────────────────────────
    TurnOn {
        percentage: Option<u8>,
        preset: Option<PresetMode>,
    },
    TurnOff,
    /// `0` turns the fan off.
    SetPercentage(u8),
    SetDirection(Direction),
    SetPreset(PresetMode),

    // ── Light ────────────────────────────────────────────────────────
    LightOn {
        brightness_pct: Option<u8>,
    },
    LightOff,
    /// `0` turns the light off.
    SetBrightness(u8),
}

/// What to send, what to show meanwhile, and how to recognize success.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub payload: Status,
    pub optimistic: Status,
    pub predicate: Predicate,
}

impl FanCommand {
    pub fn plan(self) -> CommandPlan {
        match self {
            Self::TurnOn { percentage, preset } => {
                let speed = percentage.map(|p| clamp_percentage(i64::from(p)));
                let preset = preset.map(PresetMode::code);
                let mut fields = fields(&[(KEY_POWER, json!(1))]);
                if let Some(speed) = speed {
                    fields.insert(KEY_SPEED.into(), json!(speed));
                }
                if let Some(preset) = preset {
                    fields.insert(KEY_PRESET.into(), json!(preset));
                }
                CommandPlan {
                    predicate: Predicate::new(move |s| {
                        status_int(s, KEY_POWER) == Some(1)
                            && speed.is_none_or(|t| status_int(s, KEY_SPEED) == Some(i64::from(t)))
                            && preset.is_none_or(|t| status_int(s, KEY_PRESET) == Some(t))
                    }),
                    payload: fields.clone(),
                    optimistic: fields,
                }
            }
            Self::TurnOff | Self::SetPercentage(0) => {
                same(fields(&[(KEY_POWER, json!(0))]), &[KEY_POWER])
            }
            Self::SetPercentage(p) => same(
                fields(&[
                    (KEY_POWER, json!(1)),
                    (KEY_SPEED, json!(clamp_percentage(i64::from(p)))),
                    (KEY_PRESET, json!(PresetMode::Normal.code())),
                ]),
                &[KEY_SPEED, KEY_PRESET],
            ),
            Self::SetDirection(d) => same(
                fields(&[(KEY_POWER, json!(1)), (KEY_DIRECTION, json!(d.code()))]),
                &[KEY_DIRECTION],
            ),
            Self::SetPreset(mode) => same(
                fields(&[(KEY_POWER, json!(1)), (KEY_PRESET, json!(mode.code()))]),
                &[KEY_PRESET],
            ),
            Self::LightOn { brightness_pct } => {
                let mut light = fields(&[(KEY_LIGHT_POWER, json!(1))]);
                if let Some(pct) = brightness_pct {
                    light.insert(
                        KEY_LIGHT_BRIGHTNESS.into(),
                        json!(clamp_percentage(i64::from(pct))),
                    );
                }
                let confirm: &[&str] = if brightness_pct.is_some() {
                    &[KEY_LIGHT_POWER, KEY_LIGHT_BRIGHTNESS]
                } else {
                    &[KEY_LIGHT_POWER]
                };
                same(light, confirm)
            }
            Self::LightOff | Self::SetBrightness(0) => {
                same(fields(&[(KEY_LIGHT_POWER, json!(0))]), &[KEY_LIGHT_POWER])
            }
            Self::SetBrightness(pct) => same(
                fields(&[
                    (KEY_LIGHT_POWER, json!(1)),
                    (KEY_LIGHT_BRIGHTNESS, json!(clamp_percentage(i64::from(pct)))),
                ]),
                &[KEY_LIGHT_POWER, KEY_LIGHT_BRIGHTNESS],
            ),
        }
    }

    /// Short name for logs and history.
    pub fn name(self) -> &'static str {
        match self {
            Self::TurnOn { .. } => "turn_on",
            Self::TurnOff => "turn_off",
            Self::SetPercentage(_) => "set_percentage",
            Self::SetDirection(_) => "set_direction",
            Self::SetPreset(_) => "set_preset",
            Self::LightOn { .. } => "light_on",
            Self::LightOff => "light_off",
            Self::SetBrightness(_) => "set_brightness",
        }
    }
}

fn fields(pairs: &[(&str, Value)]) -> Status {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect()
}

/// Payload and optimistic values are the same map; success means the
/// `confirm` fields match it.
fn same(fields: Status, confirm: &[&str]) -> CommandPlan {
    let expected: Status = confirm
        .iter()
        .filter_map(|key| Some(((*key).to_owned(), fields.get(*key)?.clone())))
        .collect();
    CommandPlan {
        predicate: Predicate::fields_equal(expected),
        payload: fields.clone(),
        optimistic: fields,
    }
}
