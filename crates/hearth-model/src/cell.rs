//! Cells and cell references.

use hearth_core::{CellValue, Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The declared type of a cell, following bus conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    /// Boolean on/off cell, `1`/`0` on the wire.
    Switch,
    /// Numeric cell.
    Value,
    /// Numeric cell with an upper bound.
    Range,
    /// Free-form text cell.
    Text,
}

impl CellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Switch => "switch",
            CellType::Value => "value",
            CellType::Range => "range",
            CellType::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "switch" => Some(CellType::Switch),
            "value" => Some(CellType::Value),
            "range" => Some(CellType::Range),
            "text" => Some(CellType::Text),
            _ => None,
        }
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cell on the change channel: `(device, control)`.
///
/// The script-side string form is `"Device/Control"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellSpec {
    pub device: String,
    pub control: String,
}

impl CellSpec {
    pub fn new(device: impl Into<String>, control: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            control: control.into(),
        }
    }
}

impl FromStr for CellSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((device, control)) if !device.is_empty() && !control.is_empty() => {
                Ok(CellSpec::new(device, control))
            }
            _ => Err(Error::Model(format!("invalid cell reference: '{}'", s))),
        }
    }
}

impl std::fmt::Display for CellSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.control)
    }
}

/// A single cell: current value, completeness and metadata.
#[derive(Debug, Clone)]
pub struct Cell {
    pub name: String,
    pub cell_type: CellType,
    /// True once the type was declared explicitly (virtual-device definition
    /// or a `/meta/type` message) rather than defaulted.
    pub typed: bool,
    pub value: CellValue,
    pub raw: String,
    /// True once at least one value has been observed.
    pub complete: bool,
    pub readonly: bool,
    pub max: Option<f64>,
}

impl Cell {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cell_type: CellType::Text,
            typed: false,
            value: CellValue::default(),
            raw: String::new(),
            complete: false,
            readonly: false,
            max: None,
        }
    }

    /// Parse a raw bus payload according to the declared type; untyped cells
    /// infer booleans and numbers from the payload shape.
    pub(crate) fn parse_raw(&self, raw: &str) -> CellValue {
        if !self.typed {
            return CellValue::infer(raw);
        }
        match self.cell_type {
            CellType::Switch => CellValue::Bool(raw == "1" || raw == "true"),
            CellType::Value | CellType::Range => {
                CellValue::Number(raw.parse().unwrap_or(0.0))
            }
            CellType::Text => CellValue::Text(raw.to_string()),
        }
    }

    /// Wire payload for a value, per the cell's type.
    pub(crate) fn encode(&self, value: &CellValue) -> String {
        match (self.cell_type, value) {
            (CellType::Switch, v) => {
                if v.is_truthy() { "1".to_string() } else { "0".to_string() }
            }
            (_, CellValue::Bool(b)) => {
                if *b { "1".to_string() } else { "0".to_string() }
            }
            (_, v) => v.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_spec_parsing() {
        let spec: CellSpec = "Weather/Temp1".parse().unwrap();
        assert_eq!(spec, CellSpec::new("Weather", "Temp1"));
        assert_eq!(spec.to_string(), "Weather/Temp1");

        assert!("Weather".parse::<CellSpec>().is_err());
        assert!("/Temp1".parse::<CellSpec>().is_err());
        assert!("Weather/".parse::<CellSpec>().is_err());
    }

    #[test]
    fn cell_spec_keeps_remainder_of_slashed_name() {
        let spec: CellSpec = "dev/a/b".parse().unwrap();
        assert_eq!(spec.device, "dev");
        assert_eq!(spec.control, "a/b");
    }

    #[test]
    fn typed_parsing_and_encoding() {
        let mut cell = Cell::new("Relay1");
        cell.cell_type = CellType::Switch;
        cell.typed = true;
        assert_eq!(cell.parse_raw("1"), CellValue::Bool(true));
        assert_eq!(cell.parse_raw("0"), CellValue::Bool(false));
        assert_eq!(cell.encode(&CellValue::Bool(true)), "1");

        let untyped = Cell::new("Temp1");
        assert_eq!(untyped.parse_raw("18"), CellValue::Number(18.0));
        assert_eq!(untyped.parse_raw("warm"), CellValue::Text("warm".into()));
    }
}
