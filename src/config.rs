//! Emulator configuration parsing, validation, and launch argument mapping.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::orchestrator::probe::EmulatorFeatures;
use crate::process::LaunchSpec;
use crate::{AppError, Result};

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_blob_port() -> u16 {
    10000
}

fn default_queue_port() -> u16 {
    10001
}

fn default_table_port() -> u16 {
    10002
}

fn default_probe_timeout_ms() -> u64 {
    15_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

/// Settings for one emulator installation, parsed from `azurite.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AzuriteConfig {
    /// Path to the emulator executable. The file must exist; bare command
    /// names are not looked up on `PATH`.
    pub executable_path: PathBuf,
    /// Directory the emulator persists its state in (`--location`).
    pub workspace_path: PathBuf,
    /// Blob service listen host.
    #[serde(default = "default_host")]
    pub blob_host: String,
    /// Blob service listen port.
    #[serde(default = "default_blob_port")]
    pub blob_port: u16,
    /// Queue service listen host.
    #[serde(default = "default_host")]
    pub queue_host: String,
    /// Queue service listen port.
    #[serde(default = "default_queue_port")]
    pub queue_port: u16,
    /// Table service listen host; only passed when the emulator supports tables.
    #[serde(default = "default_host")]
    pub table_host: String,
    /// Table service listen port; only passed when the emulator supports tables.
    #[serde(default = "default_table_port")]
    pub table_port: u16,
    /// Ignore unsupported headers and parameters (`--loose`).
    #[serde(default)]
    pub loose_mode: bool,
    /// Skip the request API version check (`--skipApiVersionCheck`).
    #[serde(default)]
    pub skip_api_version_check: bool,
    /// TLS certificate (`--cert`).
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS private key (`--key`). Requires `cert_path`.
    #[serde(default)]
    pub cert_key_path: Option<PathBuf>,
    /// Password for a PFX certificate (`--pwd`). Requires `cert_path`.
    #[serde(default)]
    pub cert_password: Option<String>,
    /// Write the emulator debug log to this file (`--debug`).
    #[serde(default)]
    pub debug_log_path: Option<PathBuf>,
    /// Upper bound for the `--help` feature probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Time a stopping emulator gets to exit before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Extra environment variables for the emulator process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AzuriteConfig {
    /// Build a configuration with default endpoints for the given paths.
    #[must_use]
    pub fn new(executable_path: impl Into<PathBuf>, workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            workspace_path: workspace_path.into(),
            blob_host: default_host(),
            blob_port: default_blob_port(),
            queue_host: default_host(),
            queue_port: default_queue_port(),
            table_host: default_host(),
            table_port: default_table_port(),
            loose_mode: false,
            skip_api_version_check: false,
            cert_path: None,
            cert_key_path: None,
            cert_password: None,
            debug_log_path: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            env: HashMap::new(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// Executable and workspace existence is not checked here; a missing
    /// path is reported as a warning when a session is started.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Feature probe timeout as a [`Duration`].
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Graceful stop window as a [`Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Command-line arguments for the emulator, given the detected features.
    ///
    /// Table endpoint flags are only emitted when the probe found table
    /// support; older emulator builds reject unknown flags.
    #[must_use]
    pub fn launch_args(&self, features: EmulatorFeatures) -> Vec<String> {
        let mut args = vec![
            "--location".to_owned(),
            self.workspace_path.to_string_lossy().into_owned(),
            "--blobHost".to_owned(),
            self.blob_host.clone(),
            "--blobPort".to_owned(),
            self.blob_port.to_string(),
            "--queueHost".to_owned(),
            self.queue_host.clone(),
            "--queuePort".to_owned(),
            self.queue_port.to_string(),
        ];

        if features.table {
            args.extend([
                "--tableHost".to_owned(),
                self.table_host.clone(),
                "--tablePort".to_owned(),
                self.table_port.to_string(),
            ]);
        }

        if self.loose_mode {
            args.push("--loose".to_owned());
        }
        if self.skip_api_version_check {
            args.push("--skipApiVersionCheck".to_owned());
        }
        if let Some(ref cert) = self.cert_path {
            args.push("--cert".to_owned());
            args.push(cert.to_string_lossy().into_owned());
            if let Some(ref key) = self.cert_key_path {
                args.push("--key".to_owned());
                args.push(key.to_string_lossy().into_owned());
            }
            if let Some(ref pwd) = self.cert_password {
                args.push("--pwd".to_owned());
                args.push(pwd.clone());
            }
        }
        if let Some(ref log) = self.debug_log_path {
            args.push("--debug".to_owned());
            args.push(log.to_string_lossy().into_owned());
        }

        args
    }

    /// Full launch description for the emulator process.
    #[must_use]
    pub fn launch_spec(&self, features: EmulatorFeatures) -> LaunchSpec {
        LaunchSpec {
            program: self.executable_path.clone(),
            args: self.launch_args(features),
            env: self.env.clone(),
            working_dir: Some(self.workspace_path.clone()),
        }
    }

    fn validate(&self) -> Result<()> {
        let ports = [
            ("blob_port", self.blob_port),
            ("queue_port", self.queue_port),
            ("table_port", self.table_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(AppError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.blob_port == self.queue_port
            || self.blob_port == self.table_port
            || self.queue_port == self.table_port
        {
            return Err(AppError::Config(
                "blob, queue and table ports must be distinct".into(),
            ));
        }

        if self.cert_path.is_none()
            && (self.cert_key_path.is_some() || self.cert_password.is_some())
        {
            return Err(AppError::Config(
                "cert_key_path and cert_password require cert_path".into(),
            ));
        }

        if self.probe_timeout_ms == 0 {
            return Err(AppError::Config(
                "probe_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.executable_path.as_os_str().is_empty() {
            return Err(AppError::Config("executable_path must not be empty".into()));
        }
        if self.workspace_path.as_os_str().is_empty() {
            return Err(AppError::Config("workspace_path must not be empty".into()));
        }

        Ok(())
    }
}
