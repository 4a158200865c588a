//! Language runtimes this node can host.
//!
//! Runtimes are declared in configuration and probed once at startup. A
//! runtime whose executable is missing, whose version output does not match,
//! or whose additional check does not print `true` stays disabled; the other
//! runtimes are unaffected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeDefinition;

/// Errors from probing a runtime.
#[derive(Debug, Error)]
pub enum RuntimeProbeError {
    #[error("invalid version pattern for runtime {runtime}: {source}")]
    InvalidPattern {
        runtime: String,
        #[source]
        source: regex::Error,
    },

    #[error("executable {0} not found")]
    NotFound(String),

    #[error("version output {output:?} does not match {pattern}")]
    VersionMismatch { pattern: String, output: String },

    #[error("additional check printed {0:?} instead of \"true\"")]
    CheckFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One configured runtime and its probe result.
#[derive(Debug, Clone)]
pub struct DeaRuntime {
    pub name: String,
    /// Executable as configured.
    pub executable: String,
    /// Executable resolved on `PATH` by the probe.
    pub resolved: Option<PathBuf>,
    pub version_flag: String,
    pub version_pattern: Regex,
    pub additional_checks: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub debug_env: BTreeMap<String, BTreeMap<String, String>>,
    pub enabled: bool,
}

impl DeaRuntime {
    fn from_definition(name: &str, def: &RuntimeDefinition) -> Result<Self, RuntimeProbeError> {
        let version_pattern =
            Regex::new(&def.version).map_err(|source| RuntimeProbeError::InvalidPattern {
                runtime: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            executable: def.executable.clone(),
            resolved: None,
            version_flag: def.version_flag.clone(),
            version_pattern,
            additional_checks: def.additional_checks.clone(),
            environment: def.environment.clone(),
            debug_env: def.debug_env.clone(),
            enabled: false,
        })
    }

    /// Path substituted for the runtime placeholder in startup scripts.
    pub fn executable_path(&self) -> PathBuf {
        self.resolved
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.executable))
    }

    fn probe(&self) -> Result<PathBuf, RuntimeProbeError> {
        let path = which::which(&self.executable)
            .map_err(|_| RuntimeProbeError::NotFound(self.executable.clone()))?;

        let output = run_capture(&path, std::slice::from_ref(&self.version_flag))?;
        if !self.version_pattern.is_match(&output) {
            return Err(RuntimeProbeError::VersionMismatch {
                pattern: self.version_pattern.as_str().to_string(),
                output,
            });
        }

        if let Some(checks) = &self.additional_checks {
            let output = run_capture(&path, checks)?;
            if output.trim() != "true" {
                return Err(RuntimeProbeError::CheckFailed(output.trim().to_string()));
            }
        }

        Ok(path)
    }
}

/// Runs `program args...` and returns stdout followed by stderr.
fn run_capture(program: &Path, args: &[String]) -> Result<String, RuntimeProbeError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Registry of configured runtimes.
///
/// Only [`RuntimeRegistry::setup_runtimes`] mutates it; share it behind an
/// `Arc` afterwards.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: BTreeMap<String, DeaRuntime>,
}

impl RuntimeRegistry {
    /// Build the registry. An invalid version pattern is a configuration error.
    pub fn new(definitions: &BTreeMap<String, RuntimeDefinition>) -> Result<Self, RuntimeProbeError> {
        let runtimes = definitions
            .iter()
            .map(|(name, def)| Ok((name.clone(), DeaRuntime::from_definition(name, def)?)))
            .collect::<Result<_, RuntimeProbeError>>()?;
        Ok(Self { runtimes })
    }

    /// Probe every runtime and enable the ones that pass.
    pub fn setup_runtimes(&mut self) {
        for runtime in self.runtimes.values_mut() {
            match runtime.probe() {
                Ok(path) => {
                    info!(
                        runtime = %runtime.name,
                        executable = %path.display(),
                        "Runtime enabled"
                    );
                    runtime.resolved = Some(path);
                    runtime.enabled = true;
                }
                Err(e) => {
                    warn!(runtime = %runtime.name, error = %e, "Runtime disabled");
                    runtime.enabled = false;
                }
            }
        }
    }

    /// False if the runtime is unknown or failed its probe.
    pub fn runtime_supported(&self, name: &str) -> bool {
        self.runtimes.get(name).is_some_and(|r| r.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&DeaRuntime> {
        self.runtimes.get(name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DeaRuntime> {
        self.runtimes.values().filter(|r| r.enabled)
    }

    /// Environment overlay for an instance of `name`.
    ///
    /// The debug overlay for `debug_mode` comes first, then the runtime's own
    /// environment. A debug mode the runtime does not define adds nothing.
    pub fn environment_for(&self, name: &str, debug_mode: Option<&str>) -> Vec<(String, String)> {
        let Some(runtime) = self.runtimes.get(name) else {
            return Vec::new();
        };

        let mut env = Vec::new();
        if let Some(mode) = debug_mode {
            match runtime.debug_env.get(mode) {
                Some(overlay) => {
                    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                None => debug!(runtime = %name, debug_mode = %mode, "No debug overlay"),
            }
        }
        env.extend(
            runtime
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }
}
