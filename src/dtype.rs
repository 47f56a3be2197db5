use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataTypeError {
    #[error("Unknown datatype \"{0}\"")]
    UnknownDataType(String),
    #[error("Invalid bit width {0} for an integer datatype")]
    InvalidBitWidth(u32),
}

/// Declared element datatype of a tensor.
///
/// Integer types carry an arbitrary bit width, as produced by quantizers
/// (`INT3`, `UINT7`, ...), next to the special low-precision encodings.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Int(u32),
    UInt(u32),
    Bipolar,
    Binary,
    Ternary,
    Float32,
}

impl DataType {
    pub fn int(bits: u32, signed: bool) -> Result<Self, DataTypeError> {
        if bits == 0 || bits > 64 || (signed && bits < 2) {
            return Err(DataTypeError::InvalidBitWidth(bits));
        }
        Ok(if signed { DataType::Int(bits) } else { DataType::UInt(bits) })
    }

    pub fn min(&self) -> f64 {
        match self {
            DataType::Int(bits) => -(2f64.powi(*bits as i32 - 1)),
            DataType::UInt(_) => 0.0,
            DataType::Bipolar => -1.0,
            DataType::Binary => 0.0,
            DataType::Ternary => -1.0,
            DataType::Float32 => f32::MIN as f64,
        }
    }

    pub fn max(&self) -> f64 {
        match self {
            DataType::Int(bits) => 2f64.powi(*bits as i32 - 1) - 1.0,
            DataType::UInt(bits) => 2f64.powi(*bits as i32) - 1.0,
            DataType::Bipolar => 1.0,
            DataType::Binary => 1.0,
            DataType::Ternary => 1.0,
            DataType::Float32 => f32::MAX as f64,
        }
    }

    pub fn signed(&self) -> bool {
        !matches!(self, DataType::UInt(_) | DataType::Binary)
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32)
    }

    pub fn bitwidth(&self) -> u32 {
        match self {
            DataType::Int(bits) | DataType::UInt(bits) => *bits,
            DataType::Bipolar | DataType::Binary => 1,
            DataType::Ternary => 2,
            DataType::Float32 => 32,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Int(bits) => write!(f, "INT{bits}"),
            DataType::UInt(bits) => write!(f, "UINT{bits}"),
            DataType::Bipolar => write!(f, "BIPOLAR"),
            DataType::Binary => write!(f, "BINARY"),
            DataType::Ternary => write!(f, "TERNARY"),
            DataType::Float32 => write!(f, "FLOAT32"),
        }
    }
}

impl FromStr for DataType {
    type Err = DataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let parse_bits = |digits: &str| {
            digits
                .parse::<u32>()
                .map_err(|_| DataTypeError::UnknownDataType(s.to_string()))
        };
        match upper.as_str() {
            "BIPOLAR" => Ok(DataType::Bipolar),
            "BINARY" => Ok(DataType::Binary),
            "TERNARY" => Ok(DataType::Ternary),
            "FLOAT32" | "FLOAT" => Ok(DataType::Float32),
            x if x.starts_with("UINT") => DataType::int(parse_bits(&x[4..])?, false),
            x if x.starts_with("INT") => DataType::int(parse_bits(&x[3..])?, true),
            _ => Err(DataTypeError::UnknownDataType(s.to_string())),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = DataTypeError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}
