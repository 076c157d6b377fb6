use crate::level::Level;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Level,
    pub message: String,
    pub cause: Option<Cause>,
}

/// An exception chain as emitted by structured loggers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cause {
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: Option<Box<Cause>>,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.class_name {
            Some(class_name) => write!(f, "{class_name}: {}", self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(cause) = &self.cause {
            write!(f, "; caused by {cause}")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonTimestamp {
    Millis(i64),
    Text(String),
}

impl JsonTimestamp {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(millis) => DateTime::from_timestamp_millis(millis),
            Self::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_legacy_timestamp(&text)),
        }
    }
}

#[derive(Deserialize)]
struct JsonLine {
    #[serde(default)]
    timestamp: Option<JsonTimestamp>,
    #[serde(default)]
    level: Level,
    #[serde(default)]
    message: String,
    #[serde(default, alias = "cause")]
    throwable: Option<Cause>,
}

impl LogLine {
    /// Only JSON objects are accepted; scalars and arrays fall through to
    /// the legacy format.
    pub(crate) fn from_json(line: &str) -> Option<Self> {
        if !line.trim_start().starts_with('{') {
            return None;
        }
        let parsed: JsonLine = serde_json::from_str(line).ok()?;
        Some(Self {
            timestamp: parsed.timestamp.and_then(JsonTimestamp::into_datetime),
            level: parsed.level,
            message: parsed.message,
            cause: parsed.throwable,
        })
    }

    /// The message with the cause chain appended, if there is one.
    pub fn full_message(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{}: {cause}", self.message),
            None => self.message.clone(),
        }
    }
}

pub(crate) fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ts| ts.and_utc())
}
