//! Capability catalog.
//!
//! Capabilities are the closed allowlist of operations the engine may run.
//! The catalog is loaded once (from YAML, JSON or an in-memory list), validated
//! up front, and never modified afterwards. Nothing the caller supplies at
//! execution time can add a command: callers choose a capability id and fill
//! the named parameters that capability declares.

pub mod template;
pub mod validation;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::parser::ParserKind;
use crate::preflight::PreflightCheck;

/// Which executor tier runs a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    #[default]
    User,
    Automation,
    Elevated,
}

impl PrivilegeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeLevel::User => "user",
            PrivilegeLevel::Automation => "automation",
            PrivilegeLevel::Elevated => "elevated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(PrivilegeLevel::User),
            "automation" => Some(PrivilegeLevel::Automation),
            "elevated" => Some(PrivilegeLevel::Elevated),
            _ => None,
        }
    }
}

/// Risk classification, shown to users before they run a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Safe,
    Moderate,
    Destructive,
}

/// A named placeholder a capability accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Side-effect-free variant of a capability (e.g. `--dry-run`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunVariant {
    pub arguments: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Executable to run. Absolute paths are preferred; bare names go through PATH.
    #[serde(default)]
    pub program: String,
    /// Argument template; each element becomes exactly one argv entry.
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub privilege: PrivilegeLevel,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub preflight: Vec<PreflightCheck>,
    #[serde(default)]
    pub parser: ParserKind,
    #[serde(default)]
    pub dry_run: Option<DryRunVariant>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Script template for automation capabilities.
    #[serde(default)]
    pub script: Option<String>,
    /// Application an automation script talks to.
    #[serde(default)]
    pub target_application: Option<String>,
    /// JSON Schema the caller's argument object must satisfy.
    #[serde(default)]
    pub argument_schema: Option<Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Capability {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check the capability definition itself. Errors are collected so a
    /// catalog author sees every problem at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("id must not be empty".to_string());
        }
        if self.timeout_secs == 0 {
            problems.push("timeout_secs must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !template::is_valid_name(&param.name) {
                problems.push(format!("invalid parameter name '{}'", param.name));
            }
            if !seen.insert(param.name.as_str()) {
                problems.push(format!("parameter '{}' declared twice", param.name));
            }
        }

        let mut templates: Vec<&str> = self.arguments.iter().map(String::as_str).collect();
        if let Some(dry_run) = &self.dry_run {
            templates.extend(dry_run.arguments.iter().map(String::as_str));
        }
        if let Some(script) = &self.script {
            templates.push(script);
        }
        for t in templates {
            for name in template::placeholders(t) {
                if !seen.contains(name.as_str()) {
                    problems.push(format!("placeholder '{{{}}}' is not a declared parameter", name));
                }
            }
        }

        match self.privilege {
            PrivilegeLevel::Automation => {
                if self.script.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    problems.push("automation capabilities must declare a script".to_string());
                }
                if self.target_application.is_none() {
                    problems.push("automation capabilities must declare target_application".to_string());
                }
                for name in self.script.as_deref().map(template::quoted_script_placeholders).unwrap_or_default() {
                    problems.push(format!(
                        "script placeholder '{{{}}}' must not be quoted; values are inserted as string literals",
                        name
                    ));
                }
            }
            PrivilegeLevel::User | PrivilegeLevel::Elevated => {
                if self.program.trim().is_empty() {
                    problems.push("program must not be empty".to_string());
                }
            }
        }

        if let Err(e) = self.parser.validate() {
            problems.push(e);
        }

        if let Some(schema) = &self.argument_schema {
            if let Err(e) = validation::check_schema(schema) {
                problems.push(e);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Serializable summary of a capability for listing.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub privilege: PrivilegeLevel,
    pub risk: RiskLevel,
    pub parameters: Vec<ParameterDef>,
    pub has_dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    capabilities: Vec<Capability>,
}

/// Read-only table of capability definitions, built at startup.
#[derive(Debug, Default)]
pub struct CapabilityCatalog {
    capabilities: HashMap<String, Arc<Capability>>,
}

impl CapabilityCatalog {
    pub fn new(capabilities: Vec<Capability>) -> EngineResult<Self> {
        let mut map = HashMap::new();
        let mut problems = Vec::new();

        for cap in capabilities {
            if let Err(errs) = cap.validate() {
                problems.extend(errs.into_iter().map(|e| format!("{}: {}", cap.id, e)));
                continue;
            }
            let id = cap.id.clone();
            if map.insert(id.clone(), Arc::new(cap)).is_some() {
                problems.push(format!("{}: duplicate capability id", id));
            }
        }

        if !problems.is_empty() {
            return Err(EngineError::Catalog(problems.join("; ")));
        }

        log::info!("Loaded capability catalog ({} capabilities)", map.len());
        Ok(Self { capabilities: map })
    }

    /// Load a catalog file. `.json` files are parsed as JSON, everything else as YAML.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&data)
        } else {
            Self::from_yaml_str(&data)
        }
    }

    pub fn from_yaml_str(data: &str) -> EngineResult<Self> {
        let file: CatalogFile = serde_yaml::from_str(data)?;
        Self::new(file.capabilities)
    }

    pub fn from_json_str(data: &str) -> EngineResult<Self> {
        let file: CatalogFile = serde_json::from_str(data)?;
        Self::new(file.capabilities)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Capability>> {
        self.capabilities.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.capabilities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn list(&self) -> Vec<CapabilitySummary> {
        let mut result: Vec<_> = self
            .capabilities
            .values()
            .map(|cap| CapabilitySummary {
                id: cap.id.clone(),
                title: cap.title.clone(),
                description: cap.description.clone(),
                privilege: cap.privilege,
                risk: cap.risk,
                parameters: cap.parameters.clone(),
                has_dry_run: cap.dry_run.is_some(),
            })
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal user-tier capability used across the crate's tests.
    pub(crate) fn capability(id: &str, program: &str, arguments: &[&str]) -> Capability {
        Capability {
            id: id.into(),
            title: format!("Test {}", id),
            description: String::new(),
            program: program.into(),
            arguments: arguments.iter().map(|s| s.to_string()).collect(),
            parameters: vec![],
            privilege: PrivilegeLevel::User,
            risk: RiskLevel::Safe,
            preflight: vec![],
            parser: ParserKind::Text,
            dry_run: None,
            timeout_secs: 10,
            script: None,
            target_application: None,
            argument_schema: None,
            env: BTreeMap::new(),
        }
    }

    const YAML: &str = r#"
capabilities:
  - id: memory.pressure
    title: Check memory pressure
    program: /usr/bin/memory_pressure
    parser:
      kind: memory_pressure
  - id: caches.clear_user
    title: Clear user caches
    program: /bin/rm
    arguments: ["-rf", "{cache_dir}"]
    risk: destructive
    parameters:
      - name: cache_dir
        default: "~/Library/Caches/tmp"
    preflight:
      - kind: path_exists
        target: "~/Library/Caches"
        message: "Cache directory is missing"
    dry_run:
      arguments: ["-n", "{cache_dir}"]
  - id: safari.close_tabs
    title: Close Safari tabs
    privilege: automation
    target_application: Safari
    script: 'tell application "Safari" to close every tab of window 1'
"#;

    #[test]
    fn loads_yaml_catalog() {
        let catalog = CapabilityCatalog::from_yaml_str(YAML).unwrap();
        assert_eq!(catalog.len(), 3);

        let cap = catalog.get("caches.clear_user").unwrap();
        assert_eq!(cap.risk, RiskLevel::Destructive);
        assert_eq!(cap.privilege, PrivilegeLevel::User);
        assert_eq!(cap.timeout_secs, 60);
        assert_eq!(cap.preflight.len(), 1);

        let listed: Vec<_> = catalog.list().into_iter().map(|c| c.id).collect();
        assert_eq!(
            listed,
            vec!["caches.clear_user", "memory.pressure", "safari.close_tabs"]
        );
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"capabilities":[{"id":"uptime","title":"Uptime","program":"/usr/bin/uptime"}]}"#,
        )
        .unwrap();
        let catalog = CapabilityCatalog::load(&path).unwrap();
        assert!(catalog.contains("uptime"));
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = CapabilityCatalog::new(vec![
            capability("a", "/bin/echo", &[]),
            capability("a", "/bin/echo", &[]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_undeclared_placeholder() {
        let cap = capability("bad", "/bin/echo", &["{secret}"]);
        let err = CapabilityCatalog::new(vec![cap]).unwrap_err();
        assert!(err.to_string().contains("{secret}"));
    }

    #[test]
    fn rejects_automation_without_script() {
        let mut cap = capability("auto", "", &[]);
        cap.privilege = PrivilegeLevel::Automation;
        let problems = cap.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("script")));
        assert!(problems.iter().any(|p| p.contains("target_application")));
    }

    #[test]
    fn rejects_quoted_script_placeholder() {
        let mut cap = capability("auto", "", &[]);
        cap.privilege = PrivilegeLevel::Automation;
        cap.target_application = Some("Safari".into());
        cap.script = Some(r#"tell application "Safari" to open location "{url}""#.into());
        cap.parameters = vec![ParameterDef {
            name: "url".into(),
            description: String::new(),
            default: None,
            required: true,
        }];
        let problems = cap.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("{url}") && p.contains("quoted")));

        cap.script = Some(r#"tell application "Safari" to open location {url}"#.into());
        assert!(cap.validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut cap = capability("t", "/bin/echo", &[]);
        cap.timeout_secs = 0;
        assert!(cap.validate().is_err());
    }
}
