//! Structural validation of save documents.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::sync;
use crate::version::SaveVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub validator: String,
    pub field_path: String,
    pub message: String,
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
    pub validation_time: Duration,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
            validation_time: Duration::ZERO,
        }
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_issue(
        &mut self,
        severity: Severity,
        validator: &str,
        field_path: &str,
        message: impl Into<String>,
        suggested_fix: Option<&str>,
    ) {
        if severity != Severity::Warning {
            self.passed = false;
        }
        self.issues.push(ValidationIssue {
            severity,
            validator: validator.to_string(),
            field_path: field_path.to_string(),
            message: message.into(),
            suggested_fix: suggested_fix.map(str::to_string),
        });
    }

    pub fn add_warning(
        &mut self,
        validator: &str,
        field_path: &str,
        message: impl Into<String>,
        suggested_fix: Option<&str>,
    ) {
        self.add_issue(Severity::Warning, validator, field_path, message, suggested_fix);
    }

    pub fn add_error(
        &mut self,
        validator: &str,
        field_path: &str,
        message: impl Into<String>,
        suggested_fix: Option<&str>,
    ) {
        self.add_issue(Severity::Error, validator, field_path, message, suggested_fix);
    }

    pub fn add_critical(
        &mut self,
        validator: &str,
        field_path: &str,
        message: impl Into<String>,
        suggested_fix: Option<&str>,
    ) {
        self.add_issue(Severity::Critical, validator, field_path, message, suggested_fix);
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.passed &= other.passed;
        self.issues.extend(other.issues);
    }

    pub fn is_valid(&self) -> bool {
        self.passed && self.error_count() == 0 && self.critical_count() == 0
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn critical_count(&self) -> usize {
        self.count(Severity::Critical)
    }

    fn count(&self, severity: Severity) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity == severity)
            .count()
    }

    /// First suggested fix among the most severe issues.
    pub fn first_suggested_fix(&self) -> Option<&str> {
        let mut issues = self.issues.iter().collect::<Vec<_>>();
        issues.sort_by_key(|issue| std::cmp::Reverse(issue.severity));
        issues
            .into_iter()
            .find_map(|issue| issue.suggested_fix.as_deref())
    }

    /// One-line description used in error values.
    pub fn summary(&self) -> String {
        match self
            .issues
            .iter()
            .filter(|issue| issue.severity != Severity::Warning)
            .max_by_key(|issue| issue.severity)
        {
            Some(worst) => format!(
                "{} critical, {} errors; first: [{}] {}",
                self.critical_count(),
                self.error_count(),
                worst.validator,
                worst.message
            ),
            None => format!("passed with {} warnings", self.warning_count()),
        }
    }

    pub fn generate_report(&self) -> String {
        let mut out = String::new();
        out.push_str("Validation Report:\n");
        let _ = writeln!(out, "  Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        let _ = writeln!(out, "  Duration: {}ms", self.validation_time.as_millis());
        let _ = writeln!(
            out,
            "  Issues: {} total ({} critical, {} errors, {} warnings)",
            self.issues.len(),
            self.critical_count(),
            self.error_count(),
            self.warning_count()
        );
        if !self.issues.is_empty() {
            out.push_str("\nDetailed Issues:\n");
            for issue in &self.issues {
                let _ = write!(out, "  [{}] {}", issue.severity.as_str(), issue.validator);
                if !issue.field_path.is_empty() {
                    let _ = write!(out, " at {}", issue.field_path);
                }
                let _ = write!(out, ": {}", issue.message);
                if let Some(fix) = &issue.suggested_fix {
                    let _ = write!(out, " (Suggested fix: {fix})");
                }
                out.push('\n');
            }
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let issues = self
            .issues
            .iter()
            .map(|issue| {
                let mut entry = json!({
                    "severity": issue.severity.as_str(),
                    "validator": issue.validator,
                    "field_path": issue.field_path,
                    "message": issue.message,
                });
                if let Some(fix) = &issue.suggested_fix {
                    entry["suggested_fix"] = Value::String(fix.clone());
                }
                entry
            })
            .collect::<Vec<_>>();
        json!({
            "passed": self.passed,
            "validation_time_ms": self.validation_time.as_millis() as u64,
            "error_count": self.error_count(),
            "warning_count": self.warning_count(),
            "critical_count": self.critical_count(),
            "issues": issues,
        })
    }
}

pub type Validator = Arc<dyn Fn(&Value, &[String]) -> ValidationReport + Send + Sync>;

/// Named validators run in name order; later registrations replace earlier
/// ones with the same name.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: RwLock<BTreeMap<String, Validator>>,
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_validators() -> Self {
        let registry = Self::new();
        registry.register("structure", validate_structure);
        registry.register("systems", validate_systems);
        registry
    }

    pub fn register<F>(&self, name: &str, validator: F)
    where
        F: Fn(&Value, &[String]) -> ValidationReport + Send + Sync + 'static,
    {
        debug!(validator = name, "validator_registered");
        sync::write(&self.validators, "validator_register")
            .insert(name.to_string(), Arc::new(validator));
    }

    pub fn names(&self) -> Vec<String> {
        sync::read(&self.validators, "validator_names")
            .keys()
            .cloned()
            .collect()
    }

    pub fn run(&self, document: &Value, expected_systems: &[String]) -> ValidationReport {
        let started = Instant::now();
        let validators = sync::read(&self.validators, "validator_run")
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut report = ValidationReport::new();
        for validator in validators {
            report.merge(validator(document, expected_systems));
        }
        report.validation_time = started.elapsed();
        report
    }
}

pub fn validate_structure(document: &Value, _expected_systems: &[String]) -> ValidationReport {
    const NAME: &str = "structure";
    let mut report = ValidationReport::new();

    match document.get("header") {
        None => report.add_critical(NAME, "", "Missing header section", Some("Ensure save file has valid header")),
        Some(header) => {
            match header.get("version").and_then(Value::as_str) {
                None => report.add_error(NAME, "header", "Missing version field", Some("Add version to header")),
                Some(version) if SaveVersion::parse(version).is_err() => report.add_error(
                    NAME,
                    "header.version",
                    format!("Unparseable version '{version}'"),
                    Some("Use MAJOR.MINOR.PATCH"),
                ),
                Some(_) => {}
            }
            if header.get("product").and_then(Value::as_str).is_none() {
                report.add_error(NAME, "header", "Missing product field", Some("Add product to header"));
            }
        }
    }

    if !document.get("systems").is_some_and(Value::is_object) {
        report.add_critical(NAME, "", "Missing systems section", Some("Ensure save file has systems data"));
    }
    report
}

pub fn validate_systems(document: &Value, expected_systems: &[String]) -> ValidationReport {
    const NAME: &str = "systems";
    let mut report = ValidationReport::new();
    let Some(systems) = document.get("systems").and_then(Value::as_object) else {
        return report;
    };

    for expected in expected_systems {
        if !systems.contains_key(expected) {
            report.add_warning(
                NAME,
                "systems",
                format!("Missing system data for: {expected}"),
                Some("System will use default state"),
            );
        }
    }
    for name in systems.keys() {
        if !expected_systems.iter().any(|expected| expected == name) {
            report.add_warning(
                NAME,
                &format!("systems.{name}"),
                format!("Unknown system in save: {name}"),
                Some("System data will be ignored"),
            );
        }
    }
    report
}

/// Which checks `verify_file` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationOptions {
    pub check_structure: bool,
    pub check_checksums: bool,
    pub run_validators: bool,
    pub check_migrations: bool,
    pub verbose: bool,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            check_structure: true,
            check_checksums: true,
            run_validators: true,
            check_migrations: true,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_document() -> Value {
        json!({
            "header": {"version": "1.2.0", "product": "demo", "timestamp": 1},
            "systems": {"economy": {}, "military": {}},
        })
    }

    #[test]
    fn warnings_do_not_fail_a_report() {
        let mut report = ValidationReport::new();
        report.add_warning("v", "", "just a heads up", None);
        assert!(report.passed);
        assert!(report.is_valid());
        report.add_error("v", "a.b", "broken", Some("fix it"));
        assert!(!report.passed);
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.warning_count(), 1);
        assert_eq!(report.first_suggested_fix(), Some("fix it"));
    }

    #[test]
    fn structure_validator_flags_missing_sections() {
        let report = validate_structure(&json!({}), &[]);
        assert_eq!(report.critical_count(), 2);
        assert!(!report.passed);

        let report = validate_structure(&json!({"header": {"version": "x"}, "systems": {}}), &[]);
        assert_eq!(report.critical_count(), 0);
        assert_eq!(report.error_count(), 2);

        assert!(validate_structure(&good_document(), &[]).is_valid());
    }

    #[test]
    fn systems_validator_warns_both_directions() {
        let expected = vec!["economy".to_string(), "technology".to_string()];
        let report = validate_systems(&good_document(), &expected);
        assert!(report.passed);
        assert_eq!(report.warning_count(), 2);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.field_path == "systems.military"));
    }

    #[test]
    fn registry_merges_in_name_order() {
        let registry = ValidatorRegistry::with_builtin_validators();
        registry.register("aaa_custom", |_, _| {
            let mut report = ValidationReport::new();
            report.add_error("aaa_custom", "", "custom failure", None);
            report
        });
        let report = registry.run(&good_document(), &["economy".to_string(), "military".to_string()]);
        assert!(!report.passed);
        assert_eq!(report.issues[0].validator, "aaa_custom");
        assert_eq!(registry.names(), vec!["aaa_custom", "structure", "systems"]);
    }

    #[test]
    fn report_renders_text_and_json() {
        let mut report = ValidationReport::new();
        report.add_critical("structure", "", "Missing header section", Some("Add a header"));
        report.add_warning("systems", "systems.x", "Unknown system", None);

        let text = report.generate_report();
        assert!(text.contains("Status: FAILED"));
        assert!(text.contains("[CRITICAL] structure: Missing header section (Suggested fix: Add a header)"));
        assert!(text.contains("[WARNING] systems at systems.x: Unknown system"));

        let value = report.to_json();
        assert_eq!(value["passed"], json!(false));
        assert_eq!(value["critical_count"], json!(1));
        assert_eq!(value["issues"][0]["severity"], json!("CRITICAL"));
        assert!(value["issues"][1].get("suggested_fix").is_none());
        assert!(report.summary().starts_with("1 critical, 0 errors"));
    }
}
