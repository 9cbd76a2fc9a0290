use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

impl PressureLevel {
    pub fn from_free_percentage(pct: u8) -> Self {
        match pct {
            25..=u8::MAX => PressureLevel::Normal,
            10..=24 => PressureLevel::Warning,
            _ => PressureLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPressure {
    pub level: PressureLevel,
    pub free_percentage: u8,
    pub available_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

struct Patterns {
    free_pct: Regex,
    total: Regex,
    page_size: Regex,
    pages: Regex,
    meminfo: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        free_pct: Regex::new(r"System-wide memory free percentage:\s*(\d+)\s*%").expect("regex"),
        total: Regex::new(r"The system has (\d+)").expect("regex"),
        page_size: Regex::new(r"page size of (\d+)").expect("regex"),
        pages: Regex::new(r"(?m)^\s*Pages (free|purgeable|inactive|speculative):\s*(\d+)").expect("regex"),
        meminfo: Regex::new(r"(?m)^(MemTotal|MemAvailable):\s*(\d+)\s*kB").expect("regex"),
    })
}

/// Parse macOS `memory_pressure` output or Linux `/proc/meminfo`.
pub fn parse(raw: &str) -> Option<MemoryPressure> {
    parse_memory_pressure(raw).or_else(|| parse_meminfo(raw))
}

fn parse_memory_pressure(raw: &str) -> Option<MemoryPressure> {
    let p = patterns();
    let pct: u8 = p.free_pct.captures(raw)?[1].parse().ok()?;
    if pct > 100 {
        return None;
    }

    let total: Option<u64> = p.total.captures(raw).and_then(|c| c[1].parse().ok());
    let page_size: u64 = p
        .page_size
        .captures(raw)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(4096);

    let mut reclaimable_pages: Option<u64> = None;
    for caps in p.pages.captures_iter(raw) {
        if let Ok(n) = caps[2].parse::<u64>() {
            *reclaimable_pages.get_or_insert(0) += n;
        }
    }

    let available = match (reclaimable_pages, total) {
        (Some(pages), _) => Some(pages.saturating_mul(page_size)),
        (None, Some(total)) => Some(total / 100 * pct as u64),
        (None, None) => None,
    };

    Some(MemoryPressure {
        level: PressureLevel::from_free_percentage(pct),
        free_percentage: pct,
        available_bytes: available,
        total_bytes: total,
    })
}

fn parse_meminfo(raw: &str) -> Option<MemoryPressure> {
    let mut total_kb = None;
    let mut available_kb = None;
    for caps in patterns().meminfo.captures_iter(raw) {
        let value: u64 = caps[2].parse().ok()?;
        match &caps[1] {
            "MemTotal" => total_kb = Some(value),
            _ => available_kb = Some(value),
        }
    }

    let (total_kb, available_kb) = (total_kb?, available_kb?);
    if total_kb == 0 || available_kb > total_kb {
        return None;
    }
    let pct = ((available_kb as f64 / total_kb as f64) * 100.0).round() as u8;

    Some(MemoryPressure {
        level: PressureLevel::from_free_percentage(pct),
        free_percentage: pct,
        available_bytes: Some(available_kb * 1024),
        total_bytes: Some(total_kb * 1024),
    })
}
