//! Typed parameters for drivers and internal clients.
//!
//! A module publishes [`ParamDescriptor`]s (name, single-character short form,
//! kind, default). Callers pass [`DriverParam`]s; [`resolve_params`] checks them
//! against the descriptors, coerces compatible values, and fills in defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The type of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Signed integer.
    Int,
    /// Unsigned integer.
    UInt,
    /// Single character.
    Char,
    /// String.
    Str,
    /// Boolean flag.
    Bool,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Int => "int",
            ParamKind::UInt => "uint",
            ParamKind::Char => "char",
            ParamKind::Str => "string",
            ParamKind::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A parameter value.
///
/// Deserialized untagged, so TOML `48000` becomes [`ParamValue::Int`] and is
/// coerced to [`ParamValue::UInt`] when the descriptor asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Single character.
    Char(char),
    /// String.
    Str(String),
}

impl ParamValue {
    /// The kind of this value.
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::UInt(_) => ParamKind::UInt,
            ParamValue::Char(_) => ParamKind::Char,
            ParamValue::Str(_) => ParamKind::Str,
        }
    }

    /// Converts this value to `kind` when the conversion loses nothing.
    pub fn coerce(&self, kind: ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (v, k) if v.kind() == k => Some(v.clone()),
            (ParamValue::Int(i), ParamKind::UInt) => u64::try_from(*i).ok().map(ParamValue::UInt),
            (ParamValue::UInt(u), ParamKind::Int) => i64::try_from(*u).ok().map(ParamValue::Int),
            (ParamValue::Char(c), ParamKind::Str) => Some(ParamValue::Str(c.to_string())),
            (ParamValue::Str(s), ParamKind::Char) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(ParamValue::Char(c)),
                    _ => None,
                }
            }
            (ParamValue::Str(s), ParamKind::Bool) => match s.as_str() {
                "true" | "yes" | "on" | "1" => Some(ParamValue::Bool(true)),
                "false" | "no" | "off" | "0" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            (ParamValue::Str(s), ParamKind::UInt) => s.parse().ok().map(ParamValue::UInt),
            (ParamValue::Str(s), ParamKind::Int) => s.parse().ok().map(ParamValue::Int),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::UInt(u) => write!(f, "{u}"),
            ParamValue::Char(c) => write!(f, "{c}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

/// A parameter passed to a driver or internal client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverParam {
    /// Long parameter name (e.g. `"rate"`), or its single-character short form.
    pub name: String,
    /// Value supplied by the caller.
    pub value: ParamValue,
}

impl DriverParam {
    /// Creates a parameter.
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Describes one parameter accepted by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    /// Long name.
    pub name: String,
    /// Single-character short name.
    pub character: char,
    /// Expected kind.
    pub kind: ParamKind,
    /// Value used when the parameter is not supplied.
    pub default: ParamValue,
    /// One-line help text.
    pub short_desc: String,
}

impl ParamDescriptor {
    /// Creates a descriptor; the kind is taken from the default value.
    pub fn new(
        name: impl Into<String>,
        character: char,
        default: ParamValue,
        short_desc: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            character,
            kind: default.kind(),
            default,
            short_desc: short_desc.into(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        let mut chars = name.chars();
        matches!((chars.next(), chars.next()), (Some(c), None) if c == self.character)
    }
}

/// Errors raised while resolving parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// The module does not declare this parameter.
    #[error("unknown parameter '{0}'")]
    Unknown(String),

    /// The value cannot be converted to the declared kind.
    #[error("parameter '{name}' expects {expected}, got '{value}'")]
    WrongKind {
        /// Parameter name.
        name: String,
        /// Declared kind.
        expected: ParamKind,
        /// Supplied value.
        value: ParamValue,
    },
}

/// Parameters after validation, with defaults filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedParams {
    values: BTreeMap<String, ParamValue>,
}

impl ResolvedParams {
    /// Raw value of a parameter.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Unsigned value of a parameter.
    pub fn uint(&self, name: &str) -> Option<u64> {
        match self.values.get(name)? {
            ParamValue::UInt(u) => Some(*u),
            ParamValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Unsigned value narrowed to `u32`, saturating.
    pub fn uint32(&self, name: &str) -> Option<u32> {
        self.uint(name).map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    }

    /// String value of a parameter.
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean value of a parameter.
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Number of resolved parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validates `given` against `descriptors` and fills in defaults.
///
/// Later parameters override earlier ones with the same name.
pub fn resolve_params(
    descriptors: &[ParamDescriptor],
    given: &[DriverParam],
) -> Result<ResolvedParams, ParamError> {
    let mut values: BTreeMap<String, ParamValue> = descriptors
        .iter()
        .map(|d| (d.name.clone(), d.default.clone()))
        .collect();

    for param in given {
        let descriptor = descriptors
            .iter()
            .find(|d| d.matches(&param.name))
            .ok_or_else(|| ParamError::Unknown(param.name.clone()))?;
        let value = param
            .value
            .coerce(descriptor.kind)
            .ok_or_else(|| ParamError::WrongKind {
                name: descriptor.name.clone(),
                expected: descriptor.kind,
                value: param.value.clone(),
            })?;
        values.insert(descriptor.name.clone(), value);
    }

    Ok(ResolvedParams { values })
}
