use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::types::{IngestError, Result};

pub(crate) fn find<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    Some(current)
}

pub(crate) fn find_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    find(value, path).and_then(Value::as_str)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(parsed, Utc));
        }
    }
    if !raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit()) {
        let value = raw.parse::<i64>().ok()?;
        return if raw.len() > 10 {
            DateTime::from_timestamp_millis(value)
        } else {
            DateTime::from_timestamp(value, 0)
        };
    }
    None
}

/// Location and position of the record being decoded, used to build errors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct At<'a> {
    pub location: &'a str,
    pub position: u64,
}

impl<'a> At<'a> {
    pub fn new(location: &'a str, position: u64) -> Self {
        Self { location, position }
    }

    pub fn missing(&self, field: &str) -> IngestError {
        IngestError::MissingField {
            location: self.location.to_string(),
            position: self.position,
            field: field.to_string(),
        }
    }

    pub fn invalid(&self, field: &str, expected: &'static str) -> IngestError {
        IngestError::InvalidField {
            location: self.location.to_string(),
            position: self.position,
            field: field.to_string(),
            expected,
        }
    }

    pub fn required<'v>(&self, value: &'v Value, key: &str, name: &str) -> Result<&'v Value> {
        match value.get(key) {
            Some(Value::Null) | None => Err(self.missing(name)),
            Some(found) => Ok(found),
        }
    }

    pub fn object<'v>(&self, value: &'v Value, key: &str, name: &str) -> Result<&'v Value> {
        let found = self.required(value, key, name)?;
        if found.is_object() {
            Ok(found)
        } else {
            Err(self.invalid(name, "an object"))
        }
    }

    pub fn count(&self, value: &Value, key: &str, name: &str) -> Result<u64> {
        self.required(value, key, name)?
            .as_u64()
            .ok_or_else(|| self.invalid(name, "a non-negative integer"))
    }

    pub fn optional_count(&self, value: &Value, key: &str, name: &str) -> Result<Option<u64>> {
        match value.get(key) {
            Some(Value::Null) | None => Ok(None),
            Some(found) => found
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "a non-negative integer")),
        }
    }

    pub fn timestamp(&self, value: &Value, key: &str, name: &str) -> Result<DateTime<Utc>> {
        let raw = self.required(value, key, name)?;
        let parsed = match raw {
            Value::String(text) => parse_timestamp(text),
            Value::Number(number) => number.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        };
        parsed.ok_or_else(|| self.invalid(name, "a timestamp"))
    }

    pub fn uuid(&self, raw: &str, name: &str) -> Result<String> {
        uuid::Uuid::parse_str(raw)
            .map(|id| id.hyphenated().to_string())
            .map_err(|_| self.invalid(name, "a UUID"))
    }
}

pub(crate) fn optional_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
