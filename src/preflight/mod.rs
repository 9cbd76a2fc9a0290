//! Preflight checks.
//!
//! A capability declares the conditions that must hold before it runs. Every
//! check is evaluated on every attempt (nothing is cached) and all of them are
//! evaluated even after the first failure, so the caller can show the complete
//! list of things to fix in one go.

pub mod probe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::util::expand_home;
pub use probe::{RunningApp, SysinfoProbe, SystemProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    PathExists,
    PathWritable,
    AppRunning,
    AppNotRunning,
    DiskSpaceAvailable,
    AutomationPermission,
    PrivilegedCapabilityAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub kind: CheckKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub message: String,
}

impl PreflightCheck {
    pub fn new(kind: CheckKind, target: &str, message: &str) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    /// The catalog message, or a generic one when the catalog left it empty.
    pub fn failure_message(&self) -> String {
        if !self.message.trim().is_empty() {
            return self.message.clone();
        }
        match self.kind {
            CheckKind::PathExists => format!("{} does not exist", self.target),
            CheckKind::PathWritable => format!("{} is not writable", self.target),
            CheckKind::AppRunning => format!("{} is not running", self.target),
            CheckKind::AppNotRunning => format!("{} is still running", self.target),
            CheckKind::DiskSpaceAvailable => format!("Not enough free disk space ({})", self.target),
            CheckKind::AutomationPermission => format!("Automation of {} is not allowed", self.target),
            CheckKind::PrivilegedCapabilityAvailable => "Administrator privileges are unavailable".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationStep {
    pub kind: CheckKind,
    pub target: String,
    pub instruction: String,
}

impl RemediationStep {
    fn for_check(check: &PreflightCheck) -> Self {
        let t = &check.target;
        let instruction = match check.kind {
            CheckKind::PathExists => format!("Create or restore {}, then try again.", t),
            CheckKind::PathWritable => format!(
                "Make {} writable by the current user (check its owner and permissions).",
                t
            ),
            CheckKind::AppRunning => format!("Open {} and try again.", t),
            CheckKind::AppNotRunning => format!("Quit {} and try again.", t),
            CheckKind::DiskSpaceAvailable => match DiskRequirement::parse(t) {
                Some(req) => format!(
                    "Free up at least {} on the volume containing {}.",
                    format_bytes(req.min_bytes),
                    req.path.display()
                ),
                None => format!("Fix the disk space requirement '{}' in the capability catalog.", t),
            },
            CheckKind::AutomationPermission => format!(
                "Open System Settings > Privacy & Security > Automation and allow this app to control {}.",
                t
            ),
            CheckKind::PrivilegedCapabilityAvailable => {
                "Sign in with an administrator account or configure sudo/polkit for this user.".into()
            }
        };
        Self {
            kind: check.kind,
            target: check.target.clone(),
            instruction,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub can_execute: bool,
    pub failures: Vec<PreflightCheck>,
    pub remediation_steps: Vec<RemediationStep>,
}

impl PreflightReport {
    pub fn passed() -> Self {
        Self {
            can_execute: true,
            ..Default::default()
        }
    }

    pub fn failure_messages(&self) -> Vec<String> {
        self.failures.iter().map(|c| c.failure_message()).collect()
    }
}

/// Parsed `disk_space_available` target: `<size>[@<path>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRequirement {
    pub min_bytes: u64,
    pub path: PathBuf,
}

impl DiskRequirement {
    pub fn parse(target: &str) -> Option<Self> {
        let (size, path) = match target.split_once('@') {
            Some((size, path)) => (size.trim(), expand_home(path.trim())),
            None => (target.trim(), PathBuf::from("/")),
        };
        Some(Self {
            min_bytes: parse_size(size)?,
            path,
        })
    }
}

/// `"500MB"`, `"1.5 GB"`, `"4096"`. Units are powers of 1024.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return None,
    };
    if number < 0.0 || !number.is_finite() {
        return None;
    }
    Some((number * multiplier as f64) as u64)
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Evaluates preflight checks against the live system.
#[derive(Clone)]
pub struct PreflightValidator {
    probe: Arc<dyn SystemProbe>,
}

impl PreflightValidator {
    pub fn new(probe: Arc<dyn SystemProbe>) -> Self {
        Self { probe }
    }

    /// Evaluate every check. May block on filesystem and process-table
    /// access; async callers should run it on the blocking pool.
    pub fn evaluate(&self, checks: &[PreflightCheck]) -> PreflightReport {
        let needs_apps = checks
            .iter()
            .any(|c| matches!(c.kind, CheckKind::AppRunning | CheckKind::AppNotRunning));
        let apps = if needs_apps {
            self.probe.running_applications()
        } else {
            Vec::new()
        };

        let mut report = PreflightReport::passed();
        for check in checks {
            if !self.check_passes(check, &apps) {
                log::info!(
                    "Preflight check {:?} failed for '{}'",
                    check.kind,
                    check.target
                );
                report.remediation_steps.push(RemediationStep::for_check(check));
                report.failures.push(check.clone());
            }
        }
        report.can_execute = report.failures.is_empty();
        report
    }

    fn check_passes(&self, check: &PreflightCheck, apps: &[RunningApp]) -> bool {
        match check.kind {
            CheckKind::PathExists => expand_home(&check.target).exists(),
            CheckKind::PathWritable => is_writable(&expand_home(&check.target)),
            CheckKind::AppRunning => apps.iter().any(|a| a.matches(&check.target)),
            CheckKind::AppNotRunning => !apps.iter().any(|a| a.matches(&check.target)),
            CheckKind::DiskSpaceAvailable => match DiskRequirement::parse(&check.target) {
                Some(req) => self
                    .probe
                    .available_space(&req.path)
                    .is_some_and(|free| free >= req.min_bytes),
                None => {
                    log::warn!("Invalid disk space requirement '{}'", check.target);
                    false
                }
            },
            // A definitive answer needs the scripted operation itself; the
            // automation executor reports the denial at execution time.
            CheckKind::AutomationPermission => {
                log::debug!("Automation permission for '{}' deferred to execution", check.target);
                true
            }
            CheckKind::PrivilegedCapabilityAvailable => {
                log::debug!("Privilege availability deferred to the elevation provider");
                true
            }
        }
    }
}

fn is_writable(path: &Path) -> bool {
    if path.is_dir() {
        let probe = path.join(format!(".preflight-{}", uuid::Uuid::new_v4()));
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    } else if path.is_file() {
        std::fs::OpenOptions::new().append(true).open(path).is_ok()
    } else {
        path.parent()
            .is_some_and(|parent| parent.is_dir() && is_writable(parent))
    }
}
