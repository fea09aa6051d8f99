/// Static table of configurable BluVib parameters and their wire encoding
use bluer::Uuid;

use crate::bluetooth::characteristics;
use crate::error::RegistryError;

/// Fallback label for a raw code missing from an enumerated mapping.
pub const UNKNOWN_LABEL: &str = "Unknown";

pub const TRACE_LEN_KEY: &str = "trace_len";
pub const TRIGGER_DELAY_KEY: &str = "trigger_delay";

/// Wire description of one configurable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterDef {
    pub key: &'static str,
    pub display_name: &'static str,
    pub characteristic: Uuid,
    pub byte_width: usize,
    pub value_labels: Option<&'static [(u64, &'static str)]>,
}

const AXES_LABELS: &[(u64, &str)] = &[(1, "1"), (3, "3")];

const SAMPLE_RATE_LABELS: &[(u64, &str)] = &[
    (1, "25600 Hz"),
    (2, "12800 Hz"),
    (3, "5120 Hz"),
    (4, "2560 Hz"),
    (5, "1280 Hz"),
    (6, "512 Hz"),
    (7, "256 Hz"),
];

const GAIN_LABELS: &[(u64, &str)] = &[(1, "1"), (2, "2"), (4, "4"), (10, "10")];

const MODE_LABELS: &[(u64, &str)] = &[
    (1, "Continuous"),
    (2, "Wakeup"),
    (3, "Wakeup+"),
    (4, "Ready"),
    (5, "MotionDetect"),
];

const TRACE_LEN_LABELS: &[(u64, &str)] = &[
    (0, "64"),
    (1, "128"),
    (2, "256"),
    (3, "512"),
    (4, "1024"),
    (5, "2048"),
    (6, "4096"),
    (7, "8192"),
    (8, "16384"),
    (9, "32768"),
    (10, "65536"),
    (11, "131072"),
    (12, "262144"),
    (13, "524288"),
    (14, "1048576"),
    (15, "2097152"),
];

/// Every parameter read on session open, in editor order.
pub static PARAMETERS: [ParameterDef; 8] = [
    ParameterDef {
        key: "axes",
        display_name: "Axes",
        characteristic: characteristics::AXES,
        byte_width: 1,
        value_labels: Some(AXES_LABELS),
    },
    ParameterDef {
        key: "sample_rate",
        display_name: "Sample Rate (Hz)",
        characteristic: characteristics::SAMPLE_RATE,
        byte_width: 1,
        value_labels: Some(SAMPLE_RATE_LABELS),
    },
    ParameterDef {
        key: "gain",
        display_name: "Gain",
        characteristic: characteristics::GAIN,
        byte_width: 1,
        value_labels: Some(GAIN_LABELS),
    },
    ParameterDef {
        key: "mode",
        display_name: "Operating Mode",
        characteristic: characteristics::MODE,
        byte_width: 1,
        value_labels: Some(MODE_LABELS),
    },
    ParameterDef {
        key: "holdoff_interval",
        display_name: "Holdoff Interval (s)",
        characteristic: characteristics::HOLDOFF_INTERVAL,
        byte_width: 2,
        value_labels: None,
    },
    ParameterDef {
        key: "wakeup_interval",
        display_name: "Wakeup Interval (s)",
        characteristic: characteristics::WAKEUP_INTERVAL,
        byte_width: 2,
        value_labels: None,
    },
    ParameterDef {
        key: TRACE_LEN_KEY,
        display_name: "Trace Length (samples)",
        characteristic: characteristics::TRACE_LEN,
        byte_width: 1,
        value_labels: Some(TRACE_LEN_LABELS),
    },
    ParameterDef {
        key: TRIGGER_DELAY_KEY,
        display_name: "Trigger Delay (%)",
        characteristic: characteristics::TRIGGER_DELAY,
        byte_width: 2,
        value_labels: None,
    },
];

/// Find the parameter registered under `key`.
pub fn lookup(key: &str) -> Result<&'static ParameterDef, RegistryError> {
    PARAMETERS
        .iter()
        .find(|param| param.key == key)
        .ok_or_else(|| RegistryError::UnknownParameter(key.to_string()))
}

impl ParameterDef {
    /// Largest raw value representable in `byte_width` unsigned bytes.
    pub fn max_raw(&self) -> u64 {
        (1u64 << (8 * self.byte_width)) - 1
    }

    /// Little-endian, fixed width encoding of `raw`.
    pub fn encode(&self, raw: u64) -> Result<Vec<u8>, RegistryError> {
        if raw > self.max_raw() {
            return Err(RegistryError::ValueOutOfRange {
                key: self.key.to_string(),
                value: raw,
                width: self.byte_width,
            });
        }
        Ok(raw.to_le_bytes()[..self.byte_width].to_vec())
    }

    /// Little-endian unsigned decoding; the payload must be exactly `byte_width` long.
    pub fn decode(&self, data: &[u8]) -> Result<u64, RegistryError> {
        if data.len() != self.byte_width {
            return Err(RegistryError::MalformedPayload {
                expected: self.byte_width,
                actual: data.len(),
            });
        }
        Ok(data
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    /// Display label for a raw value.
    ///
    /// Free-form parameters render the decimal value. Enumerated parameters
    /// render their mapped label, or [`UNKNOWN_LABEL`] for an unmapped code.
    pub fn label_for(&self, raw: u64) -> String {
        match self.value_labels {
            Some(labels) => labels
                .iter()
                .find(|(value, _)| *value == raw)
                .map(|(_, label)| label.to_string())
                .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
            None => raw.to_string(),
        }
    }

    /// Reverse of [`label_for`](Self::label_for).
    pub fn raw_for(&self, label: &str) -> Result<u64, RegistryError> {
        let label = label.trim();
        match self.value_labels {
            Some(labels) => labels
                .iter()
                .find(|(_, l)| *l == label)
                .map(|(value, _)| *value)
                .ok_or_else(|| RegistryError::LabelNotFound {
                    key: self.key.to_string(),
                    label: label.to_string(),
                }),
            None => label.parse::<u64>().map_err(|_| RegistryError::InvalidNumber {
                key: self.key.to_string(),
                input: label.to_string(),
            }),
        }
    }

    /// Labels offered to the operator, empty for free-form parameters.
    pub fn choices(&self) -> Vec<&'static str> {
        self.value_labels
            .map(|labels| labels.iter().map(|(_, label)| *label).collect())
            .unwrap_or_default()
    }
}

/// Number of samples per trace for a `trace_len` code.
pub fn trace_len_samples(code: u64) -> Option<u64> {
    TRACE_LEN_LABELS
        .iter()
        .find(|(value, _)| *value == code)
        .and_then(|(_, label)| label.parse().ok())
}

/// Trigger delay as a rounded percentage of the trace length.
pub fn trigger_delay_percent(delay_raw: u64, trace_samples: u64) -> u64 {
    (delay_raw as f64 / trace_samples as f64 * 100.0).round() as u64
}

/// Display value for `trigger_delay`.
///
/// Falls back to the raw decimal value until a known `trace_len` code has
/// been read.
pub fn trigger_delay_display(delay_raw: u64, trace_len_code: Option<u64>) -> String {
    match trace_len_code.and_then(trace_len_samples) {
        Some(samples) if samples > 0 => trigger_delay_percent(delay_raw, samples).to_string(),
        _ => delay_raw.to_string(),
    }
}
