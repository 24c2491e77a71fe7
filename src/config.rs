//! Configuration parsing, validation, and environment interpolation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::permission::PermissionPolicy;
use crate::{AppError, Result};

/// Placeholder expanded to the canonical workspace root inside `env` values.
pub const WORKSPACE_ROOT_PLACEHOLDER: &str = "${workspaceRoot}";

fn default_terminal_output_limit() -> usize {
    1_048_576
}

/// Bridge configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConduitConfig {
    /// Agent executable (e.g. `claude-code-acp`).
    pub command: String,
    /// Arguments passed to the agent executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Workspace root; the agent starts in this directory.
    pub workspace_root: PathBuf,
    /// Environment overlay applied on top of the inherited environment.
    ///
    /// Values may contain [`WORKSPACE_ROOT_PLACEHOLDER`], which is expanded
    /// to the canonical workspace root at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// How inbound permission requests are answered.
    #[serde(default)]
    pub permission_policy: PermissionPolicy,
    /// Preferred model query resolved against the session's model list
    /// after `session/new` (exact id/name match, else substring).
    #[serde(default)]
    pub preferred_model: Option<String>,
    /// Fallback byte cap for terminals created without an explicit
    /// `outputByteLimit`.
    #[serde(default = "default_terminal_output_limit")]
    pub terminal_output_limit: usize,
}

impl ConduitConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a minimal in-memory configuration without touching the
    /// filesystem. The workspace root is taken as-is; `validate` is not run.
    #[must_use]
    pub fn for_command(command: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workspace_root: workspace_root.into(),
            env: HashMap::new(),
            permission_policy: PermissionPolicy::default(),
            preferred_model: None,
            terminal_output_limit: default_terminal_output_limit(),
        }
    }

    /// Environment overlay with the workspace-root placeholder expanded.
    #[must_use]
    pub fn resolved_env(&self) -> HashMap<String, String> {
        let root = self.workspace_root.to_string_lossy();
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.replace(WORKSPACE_ROOT_PLACEHOLDER, &root)))
            .collect()
    }

    fn validate(&mut self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(AppError::Config("command must not be empty".into()));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
