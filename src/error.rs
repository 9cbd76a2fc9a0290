use std::time::Duration;

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Preflight failed: {}", .failures.join("; "))]
    PreflightFailed { failures: Vec<String> },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Automation denied for {application}: {message}")]
    AutomationDenied { application: String, message: String },

    #[error("Privilege elevation required: {0}")]
    PrivilegeRequired(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Audit persistence failed: {0}")]
    AuditPersistenceFailed(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog: {0}")]
    Catalog(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl EngineError {
    /// Human-readable next step for the person who triggered the failure.
    pub fn remediation_hint(&self) -> Option<String> {
        match self {
            EngineError::CapabilityNotFound(id) => Some(format!(
                "'{}' is not part of the installed capability catalog. Update the catalog or pick a listed capability.",
                id
            )),
            EngineError::PreflightFailed { .. } => Some(
                "Resolve the listed preconditions and run the capability again.".into(),
            ),
            EngineError::PermissionDenied(_) => Some(
                "Grant the required permission in System Settings > Privacy & Security, then retry.".into(),
            ),
            EngineError::AutomationDenied { application, .. } => Some(format!(
                "Open System Settings > Privacy & Security > Automation and allow this app to control {}.",
                application
            )),
            EngineError::PrivilegeRequired(_) => Some(
                "This capability needs administrator rights. Configure sudo or polkit for this user and retry.".into(),
            ),
            EngineError::TimedOut(d) => Some(format!(
                "The command did not finish within {}s. Retry when the system is less busy.",
                d.as_secs()
            )),
            EngineError::Spawn { program, source } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    Some(format!("'{}' is not installed or not on PATH.", program))
                } else if source.kind() == std::io::ErrorKind::PermissionDenied {
                    Some(format!("'{}' is not executable by the current user.", program))
                } else {
                    None
                }
            }
            EngineError::AuditPersistenceFailed(_) | EngineError::Database(_) => Some(
                "The command ran, but its audit record could not be saved. Check free disk space and permissions of the data directory.".into(),
            ),
            _ => None,
        }
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
