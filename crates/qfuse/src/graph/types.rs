use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

/// Semantic type tag carried by every value.
///
/// Tags are consulted by match filters and copied onto replacement outputs; the
/// engine never infers or checks them structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor,
    Int,
    Float,
    Bool,
    Number,
    Str,
    NoneType,
    Optional(Box<ValueType>),
    List(Box<ValueType>),
}

impl ValueType {
    /// Returns `true` for numeric scalar types (`int`, `float`, `number`).
    pub fn is_scalar(&self) -> bool {
        matches!(self, ValueType::Int | ValueType::Float | ValueType::Number)
    }

    /// Parses a textual type annotation such as `Tensor`, `int` or `Tensor?`.
    pub fn parse(src: &str) -> Option<ValueType> {
        let trimmed = src.trim();
        if let Some(inner) = trimmed.strip_suffix('?') {
            return ValueType::parse(inner).map(|ty| ValueType::Optional(Box::new(ty)));
        }
        if let Some(inner) = trimmed.strip_suffix("[]") {
            return ValueType::parse(inner).map(|ty| ValueType::List(Box::new(ty)));
        }
        match trimmed {
            "Tensor" | "tensor" => Some(ValueType::Tensor),
            "int" => Some(ValueType::Int),
            "float" => Some(ValueType::Float),
            "bool" => Some(ValueType::Bool),
            "number" | "Scalar" => Some(ValueType::Number),
            "str" => Some(ValueType::Str),
            "NoneType" | "None" => Some(ValueType::NoneType),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor => f.write_str("Tensor"),
            ValueType::Int => f.write_str("int"),
            ValueType::Float => f.write_str("float"),
            ValueType::Bool => f.write_str("bool"),
            ValueType::Number => f.write_str("number"),
            ValueType::Str => f.write_str("str"),
            ValueType::NoneType => f.write_str("NoneType"),
            ValueType::Optional(inner) => write!(f, "{inner}?"),
            ValueType::List(inner) => write!(f, "{inner}[]"),
        }
    }
}

/// Literal payload attached to nodes as an attribute (e.g. a constant's `value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
    List(Vec<Literal>),
}

impl Literal {
    /// Type a constant carrying this literal produces when no annotation is given.
    pub fn value_type(&self) -> ValueType {
        match self {
            Literal::Int(_) => ValueType::Int,
            Literal::Float(_) => ValueType::Float,
            Literal::Bool(_) => ValueType::Bool,
            Literal::Str(_) => ValueType::Str,
            Literal::None => ValueType::NoneType,
            Literal::List(items) => ValueType::List(Box::new(
                items
                    .first()
                    .map(Literal::value_type)
                    .unwrap_or(ValueType::Int),
            )),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Literal::Float(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Float(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Str(value.to_string())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(value) => write!(f, "{value}"),
            // `{:?}` keeps a decimal point or exponent so the text re-parses as a float.
            Literal::Float(value) => write!(f, "{value:?}"),
            Literal::Bool(value) => write!(f, "{value}"),
            Literal::Str(value) => {
                f.write_char('"')?;
                for ch in value.chars() {
                    if matches!(ch, '"' | '\\') {
                        f.write_char('\\')?;
                    }
                    f.write_char(ch)?;
                }
                f.write_char('"')
            }
            Literal::None => f.write_str("None"),
            Literal::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}
