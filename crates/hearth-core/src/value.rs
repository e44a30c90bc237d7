//! Value variants for cells and rule scripts.

use serde::{Deserialize, Serialize};

/// A cell value as it lives on the bus: boolean, number or string.
///
/// Serialized untagged, so virtual-device definitions can write
/// `"value": true` or `"value": 20` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Infer a value from a raw bus payload: booleans, then numbers,
    /// then plain text.
    pub fn infer(raw: &str) -> Self {
        match raw {
            "true" => return CellValue::Bool(true),
            "false" => return CellValue::Bool(false),
            _ => {}
        }
        if let Ok(n) = raw.parse::<f64>() {
            return CellValue::Number(n);
        }
        CellValue::Text(raw.to_string())
    }

    /// Truthiness the way rule conditions see it: `false`, `0` and the
    /// empty string are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            CellValue::Bool(b) => *b,
            CellValue::Number(n) => *n != 0.0,
            CellValue::Text(s) => !s.is_empty(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value. Booleans coerce to 0/1 and numeric
    /// strings parse, matching how scripts compare cell values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            CellValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Text(String::new())
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

/// A value as marshalled to and from rule-script callables.
///
/// Identical to [`CellValue`] plus `Undefined`, the return value of bodies
/// and of conditions that do not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Undefined,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ScriptValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Number(n) => *n != 0.0,
            ScriptValue::Text(s) => !s.is_empty(),
        }
    }
}

impl From<CellValue> for ScriptValue {
    fn from(v: CellValue) -> Self {
        match v {
            CellValue::Bool(b) => ScriptValue::Bool(b),
            CellValue::Number(n) => ScriptValue::Number(n),
            CellValue::Text(s) => ScriptValue::Text(s),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}
