//! Stack file parser.
//!
//! Loads the YAML stack file, a `.env` file next to it, and `THOT_*`
//! environment overrides. The engine itself never reads the environment;
//! everything it needs arrives through the parsed `StackConfig`.

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment variable holding the HTTP backend bearer token.
pub const BACKEND_TOKEN_VAR: &str = "THOT_BACKEND_TOKEN";

/// Stack file parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for `.env` lookup.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid, including malformed
    /// `${...}` references.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML stack");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            }
        })?;

        debug!(
            "Parsed stack '{}' with {} resources",
            config.stack.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack file and applies `THOT_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the HTTP backend token from the environment.
    ///
    /// # Errors
    ///
    /// Returns `MissingEnvVar` if the token is not set.
    pub fn backend_token() -> Result<String> {
        std::env::var(BACKEND_TOKEN_VAR).map_err(|_| {
            ConfigError::MissingEnvVar {
                name: BACKEND_TOKEN_VAR.to_string(),
            }
            .into()
        })
    }
}

/// Applies `THOT_*` overrides read through `lookup`.
pub fn apply_overrides(config: &mut StackConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(name) = lookup("THOT_STACK_NAME") {
        debug!("Overriding stack.name from environment");
        config.stack.name = name;
    }

    if let Some(environment) = lookup("THOT_STACK_ENVIRONMENT") {
        debug!("Overriding stack.environment from environment");
        config.stack.environment = environment;
    }

    if let Some(region) = lookup("THOT_BACKEND_REGION") {
        debug!("Overriding backend.region from environment");
        config.backend.region = region;
    }

    if let Some(endpoint) = lookup("THOT_BACKEND_ENDPOINT") {
        debug!("Overriding backend.endpoint from environment");
        config.backend.endpoint = Some(endpoint);
    }

    if let Some(bucket) = lookup("THOT_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = lookup("THOT_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }
}

/// Stack file names searched for, in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "thot.stack.yaml",
    "thot.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the stack file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns `FileNotFound` if no stack file exists up to the root.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceKind, Value};
    use std::collections::HashMap;
    use tempfile::TempDir;

    const SITE_STACK: &str = r#"
stack:
  name: thot-site
  environment: prod
backend:
  provider: simulated
  region: us-east-1
resources:
  - id: site-bucket
    kind: bucket
    inputs:
      bucketName: thot-site.com
      websiteIndexDocument: index.html
      publicReadAccess: true
  - id: site-oai
    kind: origin-access-identity
    inputs:
      comment: "OAI for thot-site.com"
  - id: site-policy
    kind: bucket-policy
    inputs:
      bucket: ${site-bucket.bucketName}
      actions: ["s3:GetObject"]
      resources: ["${site-bucket.arn}/*"]
      principal: ${site-oai.canonicalUserId}
outputs:
  - name: BucketArn
    value: ${site-bucket.arn}
"#;

    #[test]
    fn test_parse_site_stack() {
        let config = ConfigParser::new().parse_yaml(SITE_STACK, None).unwrap();

        assert_eq!(config.stack.name, "thot-site");
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[1].kind, ResourceKind::OriginAccessIdentity);

        let policy = config.resource("site-policy").unwrap();
        assert_eq!(policy.inputs["bucket"], Value::reference("site-bucket", "bucketName"));
        assert_eq!(
            policy.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["site-bucket", "site-oai"]
        );
        assert!(config.build_stack().is_ok());
    }

    #[test]
    fn test_malformed_reference_is_a_parse_error() {
        let yaml = "stack:\n  name: s\nresources:\n  - id: x\n    kind: function-url\n    inputs:\n      function: ${broken\n";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml(SITE_STACK, None).unwrap();
        let env: HashMap<&str, &str> = [
            ("THOT_STACK_ENVIRONMENT", "staging"),
            ("THOT_BACKEND_REGION", "eu-west-1"),
            ("THOT_STATE_BUCKET", "thot-state"),
        ]
        .into_iter()
        .collect();

        apply_overrides(&mut config, |name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.stack.name, "thot-site");
        assert_eq!(config.stack.environment, "staging");
        assert_eq!(config.backend.region, "eu-west-1");
        assert_eq!(config.state.bucket.as_deref(), Some("thot-state"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join("thot.stack.yaml"), SITE_STACK).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("thot.stack.yaml"));

        let loaded = ConfigParser::new().load_file(&found).unwrap();
        assert_eq!(loaded.stack.environment, "prod");
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = ConfigParser::new()
            .load_file(temp.path().join("nope.yaml"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ThotError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
