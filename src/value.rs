use std::borrow::Cow;
use std::fmt;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Value as Json;

use crate::tau::{Document, Value as Tau};

/// Object mapping with keys kept in insertion order, so that a document
/// serialises the same way it was read.
pub type Map = IndexMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Float(f64),
    Int(i64),
    UInt(u64),
    String(String),
    Array(Vec<Value>),
    Object(Map),
}

impl Value {
    /// Resolves a dotted path, descending objects only.
    pub fn find(&self, key: &str) -> Option<&Value> {
        let mut value = self;
        for part in key.split('.') {
            match value {
                Self::Object(o) => {
                    value = o.get(part)?;
                }
                _ => return None,
            }
        }
        Some(value)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            Self::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("could not serialise value")
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("could not serialise value")
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float(f)
                } else {
                    unreachable!()
                }
            }
            Json::String(s) => Self::String(s),
            Json::Array(a) => Self::Array(a.into_iter().map(|v| v.into()).collect()),
            Json::Object(o) => Self::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::UInt(u) => serializer.serialize_u64(*u),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for value in a {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            Self::Object(o) => {
                let mut map = serializer.serialize_map(Some(o.len()))?;
                for (key, value) in o {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any valid JSON value")
            }

            fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E>(self, i: i64) -> Result<Value, E> {
                Ok(Value::Int(i))
            }

            fn visit_u64<E>(self, u: u64) -> Result<Value, E> {
                Ok(Value::UInt(u))
            }

            fn visit_f64<E>(self, f: f64) -> Result<Value, E> {
                Ok(Value::Float(f))
            }

            fn visit_str<E>(self, s: &str) -> Result<Value, E> {
                Ok(Value::String(s.to_owned()))
            }

            fn visit_string<E>(self, s: String) -> Result<Value, E> {
                Ok(Value::String(s))
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                Deserialize::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut array = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(value) = seq.next_element()? {
                    array.push(value);
                }
                Ok(Value::Array(array))
            }

            fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut object = Map::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    if object.insert(key.clone(), value).is_some() {
                        return Err(de::Error::custom(format!("duplicate object key '{}'", key)));
                    }
                }
                Ok(Value::Object(object))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl Document for Value {
    fn find(&self, key: &str) -> Option<Tau<'_>> {
        Value::find(self, key).map(|v| v.into())
    }

    fn as_text(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl Document for Map {
    fn find(&self, key: &str) -> Option<Tau<'_>> {
        let (part, rest) = match key.split_once('.') {
            Some((part, rest)) => (part, Some(rest)),
            None => (key, None),
        };
        let value = self.get(part)?;
        match rest {
            Some(rest) => Value::find(value, rest).map(|v| v.into()),
            None => Some(value.into()),
        }
    }

    fn as_text(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl<'a> From<&'a Value> for Tau<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Null => Tau::Null,
            Value::Bool(b) => Tau::Bool(*b),
            Value::Float(f) => Tau::Float(*f),
            Value::Int(i) => Tau::Int(*i),
            Value::UInt(u) => Tau::UInt(*u),
            Value::String(s) => Tau::String(Cow::Borrowed(s)),
            Value::Array(a) => Tau::Array(a),
            Value::Object(o) => Tau::Object(o),
        }
    }
}

/// Parses the tool's timestamp shapes: `YYYY-MM-DDTHH:MM:SS`, the same with a
/// fractional part, each optionally suffixed with `Z`. Timestamps are UTC.
pub fn parse_datetime(timestamp: &str) -> crate::Result<NaiveDateTime> {
    let timestamp = timestamp.strip_suffix('Z').unwrap_or(timestamp);
    if let Ok(parsed) = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(parsed);
    }
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| anyhow!("invalid timestamp '{}' - {}", timestamp, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn find_descends_objects_only() {
        let value = object(r#"{"a": {"b": {"c": 1}}, "d": [{"e": 2}]}"#);
        assert_eq!(value.find("a.b.c"), Some(&Value::UInt(1)));
        assert_eq!(value.find("a.b.x"), None);
        assert_eq!(value.find("d.e"), None);
        assert_eq!(value.find("a.b.c.d"), None);
    }

    #[test]
    fn serialisation_preserves_insertion_order() {
        let value = object(r#"{"zulu": 1, "alpha": 2, "mike": {"yankee": 3, "bravo": 4}}"#);
        assert_eq!(
            value.to_json(),
            r#"{"zulu":1,"alpha":2,"mike":{"yankee":3,"bravo":4}}"#
        );
    }

    #[test]
    fn equality_is_key_order_insensitive() {
        let x = object(r#"{"a": 1, "b": 2}"#);
        let y = object(r#"{"b": 2, "a": 1}"#);
        assert_eq!(x, y);
    }

    #[test]
    fn json_round_trip_is_fixed_point() {
        let text = r#"{"a":-1,"b":18446744073709551615,"c":[true,null,"x"],"d":0.5}"#;
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(value.to_json(), text);
    }

    #[test]
    fn datetime_shapes() {
        for ts in [
            "2024-01-01T00:00:00",
            "2024-01-01T00:00:00Z",
            "2024-01-01T00:00:00.123456",
            "2024-01-01T00:00:00.123456Z",
        ] {
            assert!(parse_datetime(ts).is_ok(), "{}", ts);
        }
        assert!(parse_datetime("2024-13-01T00:00:00").is_err());
        assert!(parse_datetime("2024-01-01T24:00:00").is_err());
        assert!(parse_datetime("2024-01-01 00:00:00").is_err());
    }

    #[test]
    fn datetime_round_trip() {
        let ts = "2024-05-17T13:37:00.000001";
        let parsed = parse_datetime(ts).unwrap();
        assert_eq!(parsed.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(), ts);
    }
}
