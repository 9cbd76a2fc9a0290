//! Placeholder substitution for capability templates.
//!
//! Templates carry `{name}` tokens. Substitution is a single pass: values are
//! inserted verbatim and never re-scanned, and each argument template yields
//! exactly one argv element no matter what the value contains. Anything left
//! unresolved fails the whole substitution.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::validation;
use super::Capability;
use crate::error::{EngineError, EngineResult};
use crate::util::expand_home;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"))
}

pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Placeholder names referenced by a template, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Fully resolved command for the user and elevated tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Merge caller arguments with declared defaults.
///
/// Caller keys that the capability does not declare are rejected, as are
/// missing required parameters and values containing NUL bytes. Defaults
/// come from the catalog and get `~` expanded; caller values stay literal.
pub fn resolve_values(
    capability: &Capability,
    supplied: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Vec<String>> {
    let mut failures = Vec::new();

    for key in supplied.keys() {
        if capability.parameter(key).is_none() {
            failures.push(format!("'{}' is not a parameter of {}", key, capability.id));
        }
    }

    let mut values = BTreeMap::new();
    for param in &capability.parameters {
        let value = match supplied.get(&param.name) {
            Some(value) => Some(value.clone()),
            None => param.default.as_deref().map(expand_literal),
        };
        match value {
            Some(value) if value.contains('\0') => {
                failures.push(format!("parameter '{}' contains a NUL byte", param.name));
            }
            Some(value) => {
                values.insert(param.name.clone(), value);
            }
            None if param.required => {
                failures.push(format!("missing required parameter '{}'", param.name));
            }
            None => {}
        }
    }

    if failures.is_empty() {
        Ok(values)
    } else {
        Err(failures)
    }
}

/// Replace every placeholder in `template`. `escape` is applied to each value
/// before insertion.
pub fn substitute_with(
    template: &str,
    values: &BTreeMap<String, String>,
    escape: impl Fn(&str) -> String,
) -> Result<String, Vec<String>> {
    let mut unresolved = Vec::new();
    let out = placeholder_re().replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match values.get(name) {
            Some(value) => escape(value),
            None => {
                unresolved.push(format!("placeholder '{{{}}}' was not resolved", name));
                caps[0].to_string()
            }
        }
    });

    if unresolved.is_empty() {
        Ok(out.into_owned())
    } else {
        Err(unresolved)
    }
}

pub fn substitute(template: &str, values: &BTreeMap<String, String>) -> Result<String, Vec<String>> {
    substitute_with(template, values, |v| v.to_string())
}

/// Render a value as a complete AppleScript string literal, quotes included.
/// Line breaks and tabs become escapes so a value can never start a new
/// statement.
pub fn script_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Script placeholders wrapped in quotes by the catalog author. The literal
/// is produced by substitution, so these would close it early.
pub fn quoted_script_placeholders(script: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#""\{([A-Za-z_][A-Za-z0-9_]*)\}""#).expect("quoted placeholder regex"));
    re.captures_iter(script).map(|c| c[1].to_string()).collect()
}

/// Expand a leading `~` in catalog-authored text. No shell is involved, so
/// nothing else would.
fn expand_literal(text: &str) -> String {
    if text == "~" || text.starts_with("~/") {
        expand_home(text).to_string_lossy().into_owned()
    } else {
        text.to_string()
    }
}

fn prepare(
    capability: &Capability,
    supplied: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Vec<String>> {
    if let Some(schema) = &capability.argument_schema {
        let instance = serde_json::to_value(supplied).unwrap_or_default();
        validation::validate_arguments(schema, &instance).map_err(|e| vec![e])?;
    }
    resolve_values(capability, supplied)
}

fn argument_template(capability: &Capability, dry_run: bool) -> Result<&[String], Vec<String>> {
    if !dry_run {
        return Ok(&capability.arguments);
    }
    capability
        .dry_run
        .as_ref()
        .map(|d| d.arguments.as_slice())
        .ok_or_else(|| vec![format!("{} has no dry-run variant", capability.id)])
}

/// Build the argv for a user or elevated capability.
///
/// Returns the command plus the effective parameter values recorded in the
/// audit log. All failures surface as `PreflightFailed`.
pub fn build_command(
    capability: &Capability,
    supplied: &BTreeMap<String, String>,
    dry_run: bool,
) -> EngineResult<(CommandLine, BTreeMap<String, String>)> {
    let values = prepare(capability, supplied).map_err(preflight)?;
    let template = argument_template(capability, dry_run).map_err(preflight)?;

    let mut args = Vec::with_capacity(template.len());
    let mut failures = Vec::new();
    for t in template {
        match substitute(&expand_literal(t), &values) {
            Ok(arg) => args.push(arg),
            Err(errs) => failures.extend(errs),
        }
    }
    if !failures.is_empty() {
        return Err(preflight(failures));
    }

    Ok((
        CommandLine {
            program: capability.program.clone(),
            args,
        },
        values,
    ))
}

/// Build the script for an automation capability. Every value is inserted as
/// a complete string literal, so templates write placeholders bare.
pub fn build_script(
    capability: &Capability,
    supplied: &BTreeMap<String, String>,
) -> EngineResult<(String, BTreeMap<String, String>)> {
    let values = prepare(capability, supplied).map_err(preflight)?;
    let script = capability
        .script
        .as_deref()
        .ok_or_else(|| preflight(vec![format!("{} has no script", capability.id)]))?;
    let script = substitute_with(script, &values, script_literal).map_err(preflight)?;
    Ok((script, values))
}

fn preflight(failures: Vec<String>) -> EngineError {
    EngineError::PreflightFailed { failures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::capability;
    use crate::catalog::{DryRunVariant, ParameterDef};

    fn param(name: &str, default: Option<&str>, required: bool) -> ParameterDef {
        ParameterDef {
            name: name.into(),
            description: String::new(),
            default: default.map(String::from),
            required,
        }
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn finds_placeholders() {
        assert_eq!(placeholders("--path={dir}/{name}"), vec!["dir", "name"]);
        assert!(placeholders("{1bad} {} plain").is_empty());
    }

    #[test]
    fn value_stays_one_argument() {
        let mut cap = capability("echo", "/bin/echo", &["{msg}"]);
        cap.parameters = vec![param("msg", None, true)];

        let (cmd, values) =
            build_command(&cap, &args(&[("msg", "; rm -rf / && echo {msg}")]), false).unwrap();
        assert_eq!(cmd.args, vec!["; rm -rf / && echo {msg}".to_string()]);
        assert_eq!(values["msg"], "; rm -rf / && echo {msg}");
    }

    #[test]
    fn defaults_fill_missing_values() {
        let mut cap = capability("du", "/usr/bin/du", &["-sh", "{path}"]);
        cap.parameters = vec![param("path", Some("~/Downloads"), false)];
        let (cmd, values) = build_command(&cap, &BTreeMap::new(), false).unwrap();
        let downloads = dirs::home_dir().unwrap().join("Downloads").to_string_lossy().into_owned();
        assert_eq!(cmd.args, vec!["-sh".to_string(), downloads.clone()]);
        assert_eq!(values["path"], downloads);
    }

    #[test]
    fn template_tilde_expands_but_caller_tilde_stays_literal() {
        let home = dirs::home_dir().unwrap();
        let mut cap = capability("ls", "/bin/ls", &["~/Library/{sub}", "{path}"]);
        cap.parameters = vec![param("sub", Some("Caches"), false), param("path", None, true)];

        let (cmd, values) = build_command(&cap, &args(&[("path", "~/x")]), false).unwrap();
        assert_eq!(cmd.args[0], home.join("Library/Caches").to_string_lossy());
        assert_eq!(cmd.args[1], "~/x");
        assert_eq!(values["path"], cmd.args[1]);
    }

    #[test]
    fn unresolved_placeholder_fails_closed() {
        let mut cap = capability("du", "/usr/bin/du", &["{path}"]);
        cap.parameters = vec![param("path", None, false)];
        let err = build_command(&cap, &BTreeMap::new(), false).unwrap_err();
        match err {
            EngineError::PreflightFailed { failures } => {
                assert!(failures[0].contains("{path}"));
            }
            other => panic!("expected PreflightFailed, got {:?}", other),
        }
    }

    #[test]
    fn undeclared_argument_is_rejected() {
        let cap = capability("uptime", "/usr/bin/uptime", &[]);
        let err = build_command(&cap, &args(&[("extra", "x")]), false).unwrap_err();
        assert!(matches!(err, EngineError::PreflightFailed { .. }));
    }

    #[test]
    fn nul_byte_is_rejected() {
        let mut cap = capability("echo", "/bin/echo", &["{msg}"]);
        cap.parameters = vec![param("msg", None, true)];
        assert!(build_command(&cap, &args(&[("msg", "a\0b")]), false).is_err());
    }

    #[test]
    fn dry_run_uses_variant() {
        let mut cap = capability("rm", "/bin/rm", &["-rf", "{dir}"]);
        cap.parameters = vec![param("dir", Some("/tmp/x"), false)];
        cap.dry_run = Some(DryRunVariant {
            arguments: vec!["-n".into(), "{dir}".into()],
            description: None,
        });
        let (cmd, _) = build_command(&cap, &BTreeMap::new(), true).unwrap();
        assert_eq!(cmd.args, vec!["-n", "/tmp/x"]);

        cap.dry_run = None;
        assert!(build_command(&cap, &BTreeMap::new(), true).is_err());
    }

    #[test]
    fn script_values_are_escaped() {
        let mut cap = capability("tabs", "", &[]);
        cap.script = Some(r#"tell application "Safari" to close (tabs whose URL contains {domain})"#.into());
        cap.parameters = vec![param("domain", None, true)];
        let (script, _) = build_script(&cap, &args(&[("domain", r#"x" & do shell script "id"#)])).unwrap();
        assert!(script.ends_with(r#"contains "x\" & do shell script \"id")"#));
    }

    #[test]
    fn script_value_cannot_add_a_statement() {
        let mut cap = capability("window", "", &[]);
        cap.script = Some(r#"tell application "Finder" to get window {index}"#.into());
        cap.parameters = vec![param("index", None, true)];
        let (script, values) = build_script(&cap, &args(&[("index", "1\nempty the trash")])).unwrap();

        assert_eq!(script.lines().count(), 1);
        assert_eq!(script, r#"tell application "Finder" to get window "1\nempty the trash""#);
        assert_eq!(values["index"], "1\nempty the trash");
    }

    #[test]
    fn script_literal_escapes_control_characters() {
        assert_eq!(script_literal("a\r\tb"), r#""a\r\tb""#);
        assert_eq!(script_literal(r#"\"#), r#""\\""#);
    }

    #[test]
    fn finds_quoted_script_placeholders() {
        let script = r#"open location "{url}" & {suffix}"#;
        assert_eq!(quoted_script_placeholders(script), vec!["url"]);
    }

    #[test]
    fn schema_rejects_bad_arguments() {
        let mut cap = capability("kill", "/bin/kill", &["{pid}"]);
        cap.parameters = vec![param("pid", None, true)];
        cap.argument_schema = Some(serde_json::json!({
            "type": "object",
            "properties": { "pid": { "type": "string", "pattern": "^[0-9]+$" } },
            "required": ["pid"]
        }));
        assert!(build_command(&cap, &args(&[("pid", "123")]), false).is_ok());
        assert!(build_command(&cap, &args(&[("pid", "1; reboot")]), false).is_err());
    }
}
