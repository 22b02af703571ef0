//! Launch options and their normalization into a [`LaunchDescriptor`].
//!
//! Options arrive loosely typed (a JSON object from an embedder, or the
//! builder below) and are checked here before anything is launched. Every
//! failure is an [`Error::InvalidArgument`] raised synchronously.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LauncherConfig;
use crate::error::{Error, Result};

const STDIO_VALUES: &str = "inherit, pipe, ignore";

/// What happens to one standard stream of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Stream is discarded.
    Ignore,
    /// Stream is shared with the parent.
    Inherit,
    /// Stream is captured and exposed as an [`OutputStream`](crate::OutputStream).
    Pipe,
}

impl StdioMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Inherit => "inherit",
            Self::Pipe => "pipe",
        }
    }

    /// Parse a mode name, `None` for anything unsupported.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ignore" => Some(Self::Ignore),
            "inherit" => Some(Self::Inherit),
            "pipe" => Some(Self::Pipe),
            _ => None,
        }
    }
}

impl fmt::Display for StdioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw `stdio` option: a single mode for stdout and stderr, or explicit slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StdioOption {
    Mode(String),
    Slots(Vec<String>),
}

impl From<&str> for StdioOption {
    fn from(mode: &str) -> Self {
        Self::Mode(mode.to_string())
    }
}

impl From<StdioMode> for StdioOption {
    fn from(mode: StdioMode) -> Self {
        Self::Mode(mode.as_str().to_string())
    }
}

impl<const N: usize> From<[&str; N]> for StdioOption {
    fn from(slots: [&str; N]) -> Self {
        Self::Slots(slots.iter().map(|s| (*s).to_string()).collect())
    }
}

/// Resolved stdio layout. Stdin is always ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }
}

impl StdioConfig {
    /// Explicit `[stdin, stdout, stderr]` slots.
    pub const fn slots(&self) -> [StdioMode; 3] {
        [StdioMode::Ignore, self.stdout, self.stderr]
    }

    fn uniform(mode: StdioMode) -> Self {
        Self {
            stdout: mode,
            stderr: mode,
        }
    }

    fn resolve(option: &StdioOption) -> Result<Self> {
        match option {
            StdioOption::Mode(name) => StdioMode::from_name(name).map(Self::uniform).ok_or_else(
                || Error::invalid(format!("stdio must be of the following values: {STDIO_VALUES}")),
            ),
            StdioOption::Slots(slots) => {
                if slots.len() < 3 {
                    return Err(Error::invalid(
                        "configuration missing for stdin, stdout or stderr.",
                    ));
                }
                if slots[0] != "ignore" {
                    return Err(Error::invalid(
                        "stdin value other than ignore is not supported.",
                    ));
                }
                let stdout = StdioMode::from_name(&slots[1]).ok_or_else(|| {
                    Error::invalid(format!(
                        "stdout configuration must be of the following values: {STDIO_VALUES}"
                    ))
                })?;
                let stderr = StdioMode::from_name(&slots[2]).ok_or_else(|| {
                    Error::invalid(format!(
                        "stderr configuration must be of the following values: {STDIO_VALUES}"
                    ))
                })?;
                Ok(Self { stdout, stderr })
            }
        }
    }
}

/// Constructor options for a utility process. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UtilityProcessOptions {
    /// Arguments for the interpreter, placed before the entry script.
    #[serde(alias = "execArgv")]
    pub exec_args: Option<Vec<String>>,
    /// Extra environment variables for the worker.
    pub env: Option<BTreeMap<String, String>>,
    pub stdio: Option<StdioOption>,
    /// Working directory of the worker.
    pub cwd: Option<PathBuf>,
    /// Name attached to the worker for diagnostics.
    pub service_name: Option<String>,
}

impl UtilityProcessOptions {
    /// Parse options from a loosely-typed JSON value.
    ///
    /// `null` yields the defaults. Type mismatches are reported per field.
    pub fn from_json(value: Value) -> Result<Self> {
        let mut object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            _ => return Err(Error::invalid("Options must be an object.")),
        };

        for key in ["execArgs", "execArgv"] {
            if let Some(v) = object.get(key)
                && !v.is_null()
                && !is_string_array(v)
            {
                return Err(Error::invalid("execArgv must be an array of strings."));
            }
        }
        if let Some(v) = object.get("serviceName")
            && !v.is_null()
            && !v.is_string()
        {
            return Err(Error::invalid("serviceName must be a string."));
        }
        if let Some(v) = object.get("cwd")
            && !v.is_null()
            && !v.is_string()
        {
            return Err(Error::invalid("cwd path must be a string."));
        }
        if let Some(v) = object.get("env")
            && !v.is_null()
            && !v.as_object().is_some_and(|m| m.values().all(Value::is_string))
        {
            return Err(Error::invalid("env must be an object of string values."));
        }
        match object.get_mut("stdio") {
            None | Some(Value::Null | Value::String(_)) => {}
            // Non-string slots are kept as their JSON text so that slot
            // validation reports them against the stream they configure.
            Some(Value::Array(slots)) => {
                for slot in slots.iter_mut().filter(|slot| !slot.is_string()) {
                    *slot = Value::String(slot.to_string());
                }
            }
            Some(_) => {
                return Err(Error::invalid(format!(
                    "stdio must be of the following values: {STDIO_VALUES}"
                )));
            }
        }

        serde_json::from_value(Value::Object(object))
            .map_err(|e| Error::invalid(format!("Malformed options: {e}")))
    }

    #[must_use]
    pub fn with_stdio(mut self, stdio: impl Into<StdioOption>) -> Self {
        self.stdio = Some(stdio.into());
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_exec_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

fn is_string_array(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string))
}

/// Fully validated parameters for one launch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchDescriptor {
    entry: PathBuf,
    args: Vec<String>,
    exec_args: Vec<String>,
    env: BTreeMap<String, String>,
    stdio: StdioConfig,
    cwd: Option<PathBuf>,
    service_name: Option<String>,
}

impl LaunchDescriptor {
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn exec_args(&self) -> &[String] {
        &self.exec_args
    }

    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub const fn stdio(&self) -> StdioConfig {
        self.stdio
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }
}

/// Turn constructor input into a [`LaunchDescriptor`].
pub fn normalize(
    entry: impl Into<PathBuf>,
    args: Vec<String>,
    options: UtilityProcessOptions,
    defaults: &LauncherConfig,
) -> Result<LaunchDescriptor> {
    let entry = entry.into();
    if entry.as_os_str().is_empty() {
        return Err(Error::invalid("Missing UtilityProcess entry script."));
    }

    let stdio = match &options.stdio {
        Some(option) => StdioConfig::resolve(option)?,
        None => StdioConfig::default(),
    };

    if let Some(cwd) = &options.cwd
        && cwd.as_os_str().is_empty()
    {
        return Err(Error::invalid("cwd path must not be empty."));
    }

    Ok(LaunchDescriptor {
        entry,
        args,
        exec_args: options
            .exec_args
            .unwrap_or_else(|| defaults.default_exec_args.clone()),
        env: options.env.unwrap_or_default(),
        stdio,
        cwd: options.cwd,
        service_name: options.service_name,
    })
}
