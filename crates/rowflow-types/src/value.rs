//! Typed field values.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};

use crate::field::FieldType;

/// One field value of a [`crate::Row`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Number(f64),
    BigNumber(BigDecimal),
    Boolean(bool),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
}

/// Failure converting external data into a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot read {found} as {expected}")]
pub struct ValueError {
    pub expected: FieldType,
    pub found: String,
}

impl ValueError {
    fn new(expected: FieldType, found: &serde_json::Value) -> Self {
        Self {
            expected,
            found: found.to_string(),
        }
    }
}

impl Value {
    /// Type of a non-null value. `Null` has no type of its own.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::String(_) => Some(FieldType::String),
            Self::Integer(_) => Some(FieldType::Integer),
            Self::Number(_) => Some(FieldType::Number),
            Self::BigNumber(_) => Some(FieldType::BigNumber),
            Self::Boolean(_) => Some(FieldType::Boolean),
            Self::Date(_) => Some(FieldType::Date),
            Self::Binary(_) => Some(FieldType::Binary),
        }
    }

    /// Whether the value may be stored in a field of type `field_type`.
    /// `Null` conforms to every type.
    #[must_use]
    pub fn conforms_to(&self, field_type: FieldType) -> bool {
        self.field_type().map_or(true, |t| t == field_type)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert a JSON scalar into a value of the requested type.
    ///
    /// Strings are accepted for every type and parsed; dates accept RFC 3339
    /// timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
    pub fn from_json(json: &serde_json::Value, field_type: FieldType) -> Result<Self, ValueError> {
        use serde_json::Value as Json;

        if json.is_null() {
            return Ok(Self::Null);
        }
        let err = || ValueError::new(field_type, json);

        match field_type {
            FieldType::String => match json {
                Json::String(s) => Ok(Self::String(s.clone())),
                Json::Number(n) => Ok(Self::String(n.to_string())),
                Json::Bool(b) => Ok(Self::String(b.to_string())),
                _ => Err(err()),
            },
            FieldType::Integer => match json {
                Json::Number(n) => n.as_i64().map(Self::Integer).ok_or_else(err),
                Json::String(s) => s.trim().parse().map(Self::Integer).map_err(|_| err()),
                _ => Err(err()),
            },
            FieldType::Number => match json {
                Json::Number(n) => n.as_f64().map(Self::Number).ok_or_else(err),
                Json::String(s) => s.trim().parse().map(Self::Number).map_err(|_| err()),
                _ => Err(err()),
            },
            FieldType::BigNumber => match json {
                Json::Number(n) => BigDecimal::from_str(&n.to_string())
                    .map(Self::BigNumber)
                    .map_err(|_| err()),
                Json::String(s) => BigDecimal::from_str(s.trim())
                    .map(Self::BigNumber)
                    .map_err(|_| err()),
                _ => Err(err()),
            },
            FieldType::Boolean => match json {
                Json::Bool(b) => Ok(Self::Boolean(*b)),
                Json::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "y" | "yes" => Ok(Self::Boolean(true)),
                    "false" | "n" | "no" => Ok(Self::Boolean(false)),
                    _ => Err(err()),
                },
                _ => Err(err()),
            },
            FieldType::Date => match json {
                Json::String(s) => parse_date(s.trim()).map(Self::Date).ok_or_else(err),
                _ => Err(err()),
            },
            FieldType::Binary => match json {
                Json::String(s) => Ok(Self::Binary(s.as_bytes().to_vec())),
                Json::Array(items) => items
                    .iter()
                    .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Self::Binary)
                    .ok_or_else(err),
                _ => Err(err()),
            },
        }
    }

    /// JSON rendering used for logging and diagnostics.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::String(s) => Json::String(s.clone()),
            Self::Integer(i) => Json::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
            Self::BigNumber(d) => Json::String(d.to_string()),
            Self::Boolean(b) => Json::Bool(*b),
            Self::Date(d) => Json::String(d.to_rfc3339()),
            Self::Binary(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        }
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::BigNumber(d) => write!(f, "{d}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Self::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<BigDecimal> for Value {
    fn from(value: BigDecimal) -> Self {
        Self::BigNumber(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
