use std::borrow::Cow;

use serde::de;
use serde_yaml::Value as Yaml;

pub use self::parser::{
    Anchor, BoolOp, Detection, Expression, Match, MatchKind, Number, Scalar, parse_detection,
    parse_expression, parse_kv,
};
pub use self::solver::solve;

pub mod optimiser;
pub mod parser;
mod solver;

/// A document that tau expressions can be solved against. Implementations
/// resolve dotted paths themselves, which is what lets the hunter slide a
/// field mapping between the expression and the raw data.
pub trait Document {
    fn find(&self, key: &str) -> Option<Value<'_>>;

    /// The whole-document text form used by anonymous searches.
    fn as_text(&self) -> Option<String> {
        None
    }
}

/// A borrowed view of a value inside a document.
#[derive(Clone, Debug)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Float(f64),
    Int(i64),
    UInt(u64),
    String(Cow<'a, str>),
    Array(&'a [crate::value::Value]),
    Object(&'a crate::value::Map),
}

impl Value<'_> {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The canonical string form of a scalar, used when text predicates are
    /// applied to non-string values. Arrays and objects have none.
    pub fn to_display(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::UInt(u) => Some(u.to_string()),
            Self::String(s) => Some(s.to_string()),
            Self::Null | Self::Array(_) | Self::Object(_) => None,
        }
    }

    /// Boolean coercion for `Cast`: nonzero or nonempty.
    pub fn to_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Float(f) => *f != 0.0,
            Self::Int(i) => *i != 0,
            Self::UInt(u) => *u != 0,
            Self::String(s) => !s.is_empty(),
            Self::Array(a) => !a.is_empty(),
            Self::Object(o) => !o.is_empty(),
        }
    }
}

pub fn deserialize_expression<'de, D>(deserializer: D) -> Result<Expression, D::Error>
where
    D: de::Deserializer<'de>,
{
    let yaml: Yaml = de::Deserialize::deserialize(deserializer)?;
    parse_expression(&yaml, false).map_err(de::Error::custom)
}
