use std::fmt;

use super::DisplayKind;
use crate::device::MessagePayload;

/// Brightness of a light widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightLevel {
    #[default]
    Off,
    On,
    High,
}

impl LightLevel {
    pub fn from_value(value: Option<f64>) -> Self {
        match value {
            Some(v) if v >= 2.0 => LightLevel::High,
            Some(v) if v == 1.0 => LightLevel::On,
            _ => LightLevel::Off,
        }
    }
}

/// What an output widget currently shows.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DisplayValue {
    #[default]
    Empty,
    Text(String),
    Light(LightLevel),
}

impl DisplayValue {
    pub fn render(kind: DisplayKind, payload: &MessagePayload) -> Self {
        match kind {
            DisplayKind::Light => DisplayValue::Light(LightLevel::from_value(payload.first())),
            DisplayKind::Number => match payload {
                MessagePayload::Number(value) => DisplayValue::Text(format_number(*value)),
                MessagePayload::List(values) => DisplayValue::Text(
                    values
                        .iter()
                        .map(|v| format_number(*v))
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
            },
        }
    }
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayValue::Empty => Ok(()),
            DisplayValue::Text(text) => f.write_str(text),
            DisplayValue::Light(level) => write!(f, "{level:?}"),
        }
    }
}

const ABBREVIATE_ABOVE: f64 = 1000.0;

/// Number box presentation: two decimals (truncated), or `{n}k+` above 1000.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value.abs() > ABBREVIATE_ABOVE {
        return format!("{}k+", (value / ABBREVIATE_ABOVE).round());
    }
    // Nudge by an epsilon so values like 0.29 are not lost to binary
    // representation before truncating.
    let scaled = value * 100.0;
    let truncated = (scaled + scaled.signum() * 1e-9).trunc() / 100.0;
    format!("{}", truncated + 0.0)
}
