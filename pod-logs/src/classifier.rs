use crate::level::Level;
use crate::line::{parse_legacy_timestamp, LogLine};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // 2024-09-12 15:56:31 \x1b[31mERROR\x1b[0m i.a.Application(main):25 - message
    static ref LEGACY_LINE: Regex = Regex::new(
        r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\s+\x1b\[[0-9;]*m([A-Za-z]+)\x1b\[0?m (.*)$"
    )
    .unwrap();
}

/// Turns physical log lines into [`LogLine`] entries.
///
/// Lines without a level of their own (continuations, wrapped messages)
/// inherit the level of the line before them, so a classifier must see the
/// lines of one stream in order.
#[derive(Debug, Default)]
pub struct Classifier {
    current_level: Level,
}

impl Classifier {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn current_level(&self) -> Level {
        self.current_level
    }

    /// Returns `None` for lines that carry no information of their own.
    pub fn classify(&mut self, raw: &str) -> Option<LogLine> {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || is_stack_frame(line) {
            return None;
        }

        if let Some(entry) = LogLine::from_json(line) {
            self.current_level = entry.level;
            return Some(entry);
        }

        let entry = match LEGACY_LINE.captures(line) {
            Some(captures) => LogLine {
                timestamp: parse_legacy_timestamp(&captures[1]),
                level: Level::parse(&captures[2]),
                message: captures[3].to_owned(),
                cause: None,
            },
            None => LogLine {
                timestamp: None,
                level: self.current_level,
                message: line.to_owned(),
                cause: None,
            },
        };
        self.current_level = entry.level;
        Some(entry)
    }
}

fn is_stack_frame(line: &str) -> bool {
    line.strip_prefix('\t')
        .map(|rest| rest.starts_with("at ") || rest.starts_with("... "))
        .unwrap_or(false)
}
