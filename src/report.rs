use crate::config::ConfigError;
use crate::interval::bound_serde;
use crate::range_info::RangeInfo;
use crate::walker::{AnalysisOutcome, StuckChannels};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to render report: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::EnumString, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReportMode {
    /// Every tensor's abstract value.
    Range,
    /// Tensors with channels stuck at a single value.
    #[default]
    StuckChannel,
    /// Tensors with channels stuck at exactly zero; values omitted.
    ZerostuckChannel,
}

impl ReportMode {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::from_str(text).map_err(|_| ConfigError::UnknownReportMode(text.to_string()))
    }
}

/// Final view of an analysis, in graph-walk order.
#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    Ranges(Vec<(String, RangeInfo)>),
    StuckChannels(StuckChannels),
    ZeroStuckChannels(Vec<(String, BTreeSet<usize>)>),
}

impl Report {
    pub fn build(outcome: &AnalysisOutcome, mode: ReportMode, key_filter: &str, strip_initializers: bool) -> Self {
        let keep = |name: &str| key_filter.is_empty() || name.contains(key_filter);
        let stuck = || -> StuckChannels {
            outcome
                .stuck_channels
                .iter()
                .filter(|(name, _)| keep(name.as_str()))
                .cloned()
                .collect()
        };
        match mode {
            ReportMode::Range => Report::Ranges(
                outcome
                    .store
                    .iter()
                    .filter(|&(name, info)| keep(name) && !(strip_initializers && info.is_initializer))
                    .map(|(name, info)| (name.to_string(), info.clone()))
                    .collect(),
            ),
            ReportMode::StuckChannel => Report::StuckChannels(stuck()),
            ReportMode::ZerostuckChannel => Report::StuckChannels(stuck()).zero_stuck_only(),
        }
    }

    /// Keep only channels stuck at zero, dropping tensors left without any.
    /// Range reports are returned unchanged.
    pub fn zero_stuck_only(self) -> Self {
        match self {
            Report::StuckChannels(entries) => Report::ZeroStuckChannels(
                entries
                    .into_iter()
                    .filter_map(|(name, channels)| {
                        let zero: BTreeSet<usize> = channels
                            .into_iter()
                            .filter(|(_, value)| *value == 0.0)
                            .map(|(channel, _)| channel)
                            .collect();
                        (!zero.is_empty()).then_some((name, zero))
                    })
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Report::Ranges(x) => x.len(),
            Report::StuckChannels(x) => x.len(),
            Report::ZeroStuckChannels(x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            Report::Ranges(x) => x.iter().map(|(name, _)| name.as_str()).collect(),
            Report::StuckChannels(x) => x.iter().map(|(name, _)| name.as_str()).collect(),
            Report::ZeroStuckChannels(x) => x.iter().map(|(name, _)| name.as_str()).collect(),
        }
    }

    pub fn to_json(&self, pretty: bool) -> Result<String, ReportError> {
        Ok(if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        })
    }
}

impl Serialize for Report {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        match self {
            Report::Ranges(entries) => {
                for (name, info) in entries {
                    map.serialize_entry(name, info)?;
                }
            }
            Report::StuckChannels(entries) => {
                for (name, channels) in entries {
                    map.serialize_entry(name, channels)?;
                }
            }
            Report::ZeroStuckChannels(entries) => {
                for (name, channels) in entries {
                    map.serialize_entry(name, channels)?;
                }
            }
        }
        map.end()
    }
}

fn write_bound(f: &mut fmt::Formatter<'_>, bound: &crate::interval::Bound) -> fmt::Result {
    fn rec(f: &mut fmt::Formatter<'_>, view: ndarray::ArrayViewD<f64>) -> fmt::Result {
        if view.ndim() == 0 {
            return write!(f, "{}", bound_serde::to_value(&view.to_owned()));
        }
        write!(f, "[")?;
        for (i, item) in view.outer_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            rec(f, item)?;
        }
        write!(f, "]")
    }
    rec(f, bound.view())
}

fn write_range_info(f: &mut fmt::Formatter<'_>, info: &RangeInfo) -> fmt::Result {
    write!(f, "(")?;
    write_bound(f, &info.range.min)?;
    write!(f, ", ")?;
    write_bound(f, &info.range.max)?;
    write!(f, ")")?;
    if let Some(integer) = &info.integer {
        write!(f, " int_range=(")?;
        write_bound(f, &integer.int_range.min)?;
        write!(f, ", ")?;
        write_bound(f, &integer.int_range.max)?;
        write!(f, "), scale=")?;
        write_bound(f, &integer.scale)?;
        write!(f, ", bias=")?;
        write_bound(f, &integer.bias)?;
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Ranges(entries) => {
                for (name, info) in entries {
                    write!(f, "{}: ", name)?;
                    write_range_info(f, info)?;
                    writeln!(f)?;
                }
            }
            Report::StuckChannels(entries) => {
                for (name, channels) in entries {
                    let items: Vec<String> = channels
                        .iter()
                        .map(|(channel, value)| format!("({}, {})", channel, value))
                        .collect();
                    writeln!(f, "{}: [{}]", name, items.join(", "))?;
                }
            }
            Report::ZeroStuckChannels(entries) => {
                for (name, channels) in entries {
                    let items: Vec<String> = channels.iter().map(usize::to_string).collect();
                    writeln!(f, "{}: {{{}}}", name, items.join(", "))?;
                }
            }
        }
        Ok(())
    }
}
