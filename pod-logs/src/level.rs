use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Level {
    #[strum(to_string = "DEBUG", serialize = "TRACE")]
    Debug,
    #[strum(to_string = "INFO")]
    Info,
    #[strum(to_string = "WARN", serialize = "WARNING")]
    Warn,
    #[strum(to_string = "ERROR", serialize = "FATAL")]
    Error,
    #[default]
    #[strum(to_string = "UNKNOWN")]
    Unknown,
}

impl Level {
    /// Never fails, anything unrecognized is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        Self::from_str(raw.trim()).unwrap_or(Self::Unknown)
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::parse(&String::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(Level::parse("ERROR"), Level::Error);
        assert_eq!(Level::parse("warn"), Level::Warn);
        assert_eq!(Level::parse("WARNING"), Level::Warn);
        assert_eq!(Level::parse(" INFO "), Level::Info);
        assert_eq!(Level::parse("NOTICE"), Level::Unknown);
        assert_eq!(Level::Warn.to_string(), "WARN");
    }
}
