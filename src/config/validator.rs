//! Stack file validation.
//!
//! Checks everything that can be checked without building the graph: names,
//! backends, timeouts and outputs. Graph-level checks (schemas, references,
//! cycles) happen in `Stack::build`.

use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{StackConfig, StateBackend};
use crate::backend::BackendProvider;
use crate::resource::Value;

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }
            .into());
        }

        debug!("Stack validation passed");
        Ok(result)
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(config, &mut result);
        Self::validate_backend(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    fn validate_stack(config: &StackConfig, result: &mut ValidationResult) {
        let name = &config.stack.name;
        if name.is_empty() {
            result.error("stack.name", "Stack name cannot be empty");
        } else if !is_valid_name(name) {
            result.error(
                "stack.name",
                format!("Stack name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
            );
        }

        if config.stack.environment.is_empty() {
            result.error("stack.environment", "Environment cannot be empty");
        }

        if config.execution.call_timeout_secs == 0 {
            result.error("execution.call_timeout_secs", "Call timeout must be at least 1 second");
        }
    }

    fn validate_backend(config: &StackConfig, result: &mut ValidationResult) {
        let backend = &config.backend;

        if backend.provider == BackendProvider::Http {
            match backend.endpoint.as_deref() {
                None | Some("") => {
                    result.error("backend.endpoint", "An endpoint is required for the http backend");
                }
                Some(endpoint) if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) => {
                    result.error(
                        "backend.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            }
        }

        if backend.region.is_empty() {
            result.error("backend.region", "Region cannot be empty");
        }

        if backend.request_timeout_secs == 0 {
            result.error("backend.request_timeout_secs", "Request timeout must be at least 1 second");
        }
    }

    fn validate_state(config: &StackConfig, result: &mut ValidationResult) {
        let state = &config.state;
        if state.backend == StateBackend::S3 && state.bucket.as_deref().is_none_or(str::is_empty) {
            result.error("state.bucket", "S3 bucket name is required when using S3 backend");
        }
    }

    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result.warnings.push(String::from("No resources defined in stack"));
            return;
        }

        for (i, resource) in config.resources.iter().enumerate() {
            if !is_valid_resource_id(&resource.id) {
                result.error(
                    format!("resources[{i}].id"),
                    format!(
                        "Resource id '{}' is invalid. Must start with a lowercase letter or digit and contain only lowercase letters, digits, '-' or '_'.",
                        resource.id
                    ),
                );
            }

            if let Some(Value::String(policy)) = resource.inputs.get("removalPolicy") {
                if policy.eq_ignore_ascii_case("destroy") {
                    result.warnings.push(format!(
                        "Resource '{}' has removalPolicy: destroy; it is recorded but never triggers replacement",
                        resource.id
                    ));
                }
            }
        }
    }

    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        if config.outputs.is_empty() {
            result.warnings.push(String::from("No stack outputs defined"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, output) in config.outputs.iter().enumerate() {
            if output.name.is_empty() {
                result.error(format!("outputs[{i}].name"), "Output name cannot be empty");
            } else if !seen.insert(output.name.as_str()) {
                result.error(
                    format!("outputs[{i}].name"),
                    format!("Duplicate output name: {}", output.name),
                );
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }
    !name.ends_with('-') && !name.contains("--")
}

/// Resource ids: `[a-z0-9][a-z0-9_-]*`.
fn is_valid_resource_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("thot-site"));
        assert!(is_valid_name("site2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Thot"));
        assert!(!is_valid_name("2site"));
        assert!(!is_valid_name("thot_site"));
        assert!(!is_valid_name("thot-"));
        assert!(!is_valid_name("thot--site"));
    }

    #[test]
    fn test_resource_ids() {
        assert!(is_valid_resource_id("site-bucket"));
        assert!(is_valid_resource_id("b1"));
        assert!(is_valid_resource_id("leader_lambda"));
        assert!(!is_valid_resource_id("-bucket"));
        assert!(!is_valid_resource_id("Bucket"));
        assert!(!is_valid_resource_id(""));
    }

    #[test]
    fn test_http_backend_requires_endpoint() {
        let config = parse("stack:\n  name: s\nbackend:\n  provider: http\n");
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "backend.endpoint"));

        let config = parse("stack:\n  name: s\nbackend:\n  provider: http\n  endpoint: ftp://x\n");
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_s3_state_requires_bucket() {
        let config = parse("stack:\n  name: s\nstate:\n  backend: s3\n");
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("S3 bucket"));
    }

    #[test]
    fn test_warnings() {
        let yaml = r"
stack:
  name: s
resources:
  - id: b
    kind: bucket
    inputs:
      bucketName: thot-site.com
      removalPolicy: destroy
";
        let result = ConfigValidator::new().validate(&parse(yaml)).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 2);
        assert!(result.warnings.iter().any(|w| w.contains("removalPolicy")));
    }

    #[test]
    fn test_duplicate_outputs() {
        let yaml = r"
stack:
  name: s
resources:
  - id: oai
    kind: origin-access-identity
outputs:
  - name: Id
    value: ${oai.identityId}
  - name: Id
    value: ${oai.canonicalUserId}
";
        let result = ConfigValidator::new().check(&parse(yaml));
        assert_eq!(result.error_count(), 1);
    }
}
