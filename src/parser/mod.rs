//! Output parsers.
//!
//! Each capability declares how its stdout should be read. Parsing is total:
//! when the output does not have the expected shape the result degrades to
//! [`ParsedOutput::Text`], so a well-behaved command is never reported as
//! failed because its output looked unusual.

pub mod memory;
pub mod table;

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::{MemoryPressure, PressureLevel};
pub use table::{DiskEntry, ProcessEntry, Table};

/// Parser declared by a capability. Selection never depends on the output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParserKind {
    #[default]
    Text,
    Json,
    RegexCapture {
        pattern: String,
    },
    Table,
    MemoryPressure,
    DiskUsage,
    ProcessTable,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::Text => "text",
            ParserKind::Json => "json",
            ParserKind::RegexCapture { .. } => "regex_capture",
            ParserKind::Table => "table",
            ParserKind::MemoryPressure => "memory_pressure",
            ParserKind::DiskUsage => "disk_usage",
            ParserKind::ProcessTable => "process_table",
        }
    }

    /// Catalog-time check; only regex patterns can be invalid.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ParserKind::RegexCapture { pattern } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid parser pattern: {}", e)),
            _ => Ok(()),
        }
    }
}

/// One match of a regex-capture parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexMatch {
    /// Positional groups, index 0 being the whole match.
    pub groups: Vec<Option<String>>,
    pub named: BTreeMap<String, String>,
}

/// Structured view of a command's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedOutput {
    Text { text: String },
    Json { value: Value },
    RegexCaptures { matches: Vec<RegexMatch> },
    Table(Table),
    MemoryPressure(MemoryPressure),
    DiskUsage { entries: Vec<DiskEntry> },
    ProcessTable { entries: Vec<ProcessEntry> },
}

impl ParsedOutput {
    pub fn text(raw: &str) -> Self {
        ParsedOutput::Text {
            text: raw.to_string(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ParsedOutput::Text { .. })
    }

    /// One-line description stored alongside the audit record.
    pub fn summary(&self) -> String {
        match self {
            ParsedOutput::Text { text } => {
                let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                let first = crate::util::truncate_utf8(first.trim(), 120);
                if first.is_empty() {
                    "no output".to_string()
                } else {
                    first.to_string()
                }
            }
            ParsedOutput::Json { value } => match value {
                Value::Object(map) => format!("json object ({} keys)", map.len()),
                Value::Array(items) => format!("json array ({} items)", items.len()),
                _ => "json value".to_string(),
            },
            ParsedOutput::RegexCaptures { matches } => format!("{} matches", matches.len()),
            ParsedOutput::Table(t) => {
                format!("table: {} columns, {} rows", t.headers.len(), t.rows.len())
            }
            ParsedOutput::MemoryPressure(m) => format!(
                "memory pressure {}: {}% free",
                m.level.as_str(),
                m.free_percentage
            ),
            ParsedOutput::DiskUsage { entries } => format!("{} filesystems", entries.len()),
            ParsedOutput::ProcessTable { entries } => format!("{} processes", entries.len()),
        }
    }
}

/// Parse `raw` with the parser `kind` selects. Never fails.
pub fn parse(kind: &ParserKind, raw: &str) -> ParsedOutput {
    let parsed = match kind {
        ParserKind::Text => None,
        ParserKind::Json => parse_json(raw),
        ParserKind::RegexCapture { pattern } => parse_regex(pattern, raw),
        ParserKind::Table => table::parse_table(raw).map(ParsedOutput::Table),
        ParserKind::MemoryPressure => memory::parse(raw).map(ParsedOutput::MemoryPressure),
        ParserKind::DiskUsage => {
            table::parse_disk_usage(raw).map(|entries| ParsedOutput::DiskUsage { entries })
        }
        ParserKind::ProcessTable => {
            table::parse_process_table(raw).map(|entries| ParsedOutput::ProcessTable { entries })
        }
    };

    match parsed {
        Some(output) => output,
        None => {
            if !matches!(kind, ParserKind::Text) {
                log::debug!("Output did not match {} parser, keeping text", kind.as_str());
            }
            ParsedOutput::text(raw)
        }
    }
}

fn parse_json(raw: &str) -> Option<ParsedOutput> {
    match serde_json::from_str::<Value>(raw.trim()).ok()? {
        value @ (Value::Object(_) | Value::Array(_)) => Some(ParsedOutput::Json { value }),
        _ => None,
    }
}

fn parse_regex(pattern: &str, raw: &str) -> Option<ParsedOutput> {
    let re = Regex::new(pattern).ok()?;
    let names: Vec<&str> = re.capture_names().flatten().collect();

    let matches: Vec<RegexMatch> = re
        .captures_iter(raw)
        .map(|caps| RegexMatch {
            groups: caps
                .iter()
                .map(|g| g.map(|m| m.as_str().to_string()))
                .collect(),
            named: names
                .iter()
                .filter_map(|n| caps.name(n).map(|m| (n.to_string(), m.as_str().to_string())))
                .collect(),
        })
        .collect();

    if matches.is_empty() {
        None
    } else {
        Some(ParsedOutput::RegexCaptures { matches })
    }
}
