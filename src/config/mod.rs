//! Stack configuration.
//!
//! This module handles:
//! - Parsing `thot.stack.yaml` (plus `.env` and `THOT_*` overrides)
//! - Validation of stack-level settings
//! - Hashing of inputs, declarations and plans for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{
    BACKEND_TOKEN_VAR, ConfigParser, DEFAULT_CONFIG_FILES, apply_overrides, find_config_file,
};
pub use spec::{ExecutionConfig, StackConfig, StackMeta, StateBackend, StateConfig};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
