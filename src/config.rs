use crate::range_info::RangeInfo;
use crate::report::ReportMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unrecognized report mode \"{0}\", must be one of range, stuck_channel, zerostuck_channel")]
    UnknownReportMode(String),
    #[error("Invalid input range \"{0}\": {1}")]
    InvalidInputRange(String, String),
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Range assumed for every graph input that is not a constant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRange {
    /// Use each input's declared datatype bounds.
    #[default]
    FromDataType,
    Uniform { min: f64, max: f64 },
    PerChannel { min: Vec<f64>, max: Vec<f64> },
    Prebuilt(RangeInfo),
}

impl FromStr for InputRange {
    type Err = ConfigError;

    /// Parses `[min, max]` or `[[min..], [max..]]`; empty text selects
    /// [`InputRange::FromDataType`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Ok(InputRange::FromDataType);
        }
        let invalid = |why: &str| ConfigError::InvalidInputRange(text.to_string(), why.to_string());
        let value: Value = serde_json::from_str(text).map_err(|e| invalid(&e.to_string()))?;
        let pair = match value {
            Value::Array(items) if items.len() == 2 => items,
            _ => return Err(invalid("expected a [min, max] pair")),
        };
        let range = match (&pair[0], &pair[1]) {
            (Value::Number(lo), Value::Number(hi)) => InputRange::Uniform {
                min: lo.as_f64().ok_or_else(|| invalid("non-finite bound"))?,
                max: hi.as_f64().ok_or_else(|| invalid("non-finite bound"))?,
            },
            (Value::Array(_), Value::Array(_)) => {
                let min: Vec<f64> = serde_json::from_value(pair[0].clone()).map_err(|e| invalid(&e.to_string()))?;
                let max: Vec<f64> = serde_json::from_value(pair[1].clone()).map_err(|e| invalid(&e.to_string()))?;
                InputRange::PerChannel { min, max }
            }
            _ => return Err(invalid("min and max must both be numbers or both be lists")),
        };
        range.validate().map_err(|why| invalid(&why))?;
        Ok(range)
    }
}

impl InputRange {
    /// Checks that bounds are ordered and per-channel bounds have matching lengths.
    pub fn validate(&self) -> Result<(), String> {
        if let InputRange::PerChannel { min, max } = self {
            if min.len() != max.len() {
                return Err("per-channel bounds differ in length".to_string());
            }
        }
        let ordered = match self {
            InputRange::Uniform { min, max } => min <= max,
            InputRange::PerChannel { min, max } => min.iter().zip(max).all(|(lo, hi)| lo <= hi),
            _ => true,
        };
        if ordered {
            Ok(())
        } else {
            Err("min exceeds max".to_string())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub input_range: InputRange,
    /// Only report tensors whose name contains this substring.
    pub key_filter: String,
    pub report_mode: ReportMode,
    /// Drop constants from the range report.
    pub strip_initializers: bool,
    /// Run the scaled-integer reconstruction pass.
    pub scaled_int: bool,
    /// Run shape inference, constant folding and datatype inference first.
    pub normalize: bool,
    pub channel_axis: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            input_range: InputRange::FromDataType,
            key_filter: String::new(),
            report_mode: ReportMode::StuckChannel,
            strip_initializers: true,
            scaled_int: false,
            normalize: false,
            channel_axis: 1,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        if let Err(why) = config.input_range.validate() {
            return Err(ConfigError::InvalidInputRange(serde_json::to_string(&config.input_range)?, why));
        }
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
