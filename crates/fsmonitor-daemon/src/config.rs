//! Daemon options.
//!
//! Priority, from least significant to most significant:
//! - built-in defaults
//! - `<metadata-dir>/fsmonitor.json`
//! - `FSMONITOR_*` environment variables
//! - builder overrides (command line flags)

use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_IPC_THREADS: usize = 8;
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_COOKIE_TIMEOUT_MS: u64 = 1000;

pub const CONFIG_FILE_NAME: &str = "fsmonitor.json";

const ENV_MAPPING: &[(&str, &str)] = [
    ("FSMONITOR_IPC_THREADS", "ipc_threads"),
    ("FSMONITOR_START_TIMEOUT", "start_timeout"),
    ("FSMONITOR_COOKIE_TIMEOUT_MS", "cookie_timeout_ms"),
    ("FSMONITOR_TEST_TOKEN", "test_tokens"),
    ("FSMONITOR_COOKIE_SYNC", "cookie_sync"),
]
.as_slice();

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("value of '{key}' out of range: {value}")]
    OutOfRange { key: &'static str, value: i64 },
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
    #[error("environment variable {0} is not valid UTF-8")]
    Encoding(&'static str),
    #[error("failed to read config file {path}: {error}")]
    FailedToReadConfig {
        path: Utf8PathBuf,
        error: std::io::Error,
    },
    #[error("failed to parse config file {path}: {error}")]
    InvalidConfigFile {
        path: Utf8PathBuf,
        error: serde_json::Error,
    },
}

macro_rules! create_builder {
    ($func_name:ident, $property_name:ident, $type:ty) => {
        pub fn $func_name(mut self, value: $type) -> Self {
            self.override_config.$property_name = value;
            self
        }
    };
}

/// One layer of configuration. Unset fields defer to lower layers.
///
/// Numbers are kept signed so that negative values in a file or the
/// environment are reported as out of range rather than as parse failures.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationOptions {
    #[serde(alias = "ipcthreads")]
    pub(crate) ipc_threads: Option<i64>,
    #[serde(alias = "starttimeout")]
    pub(crate) start_timeout: Option<i64>,
    pub(crate) cookie_timeout_ms: Option<i64>,
    pub(crate) test_tokens: Option<bool>,
    pub(crate) cookie_sync: Option<bool>,
}

impl ConfigurationOptions {
    fn merge(mut self, other: ConfigurationOptions) -> Self {
        self.ipc_threads = other.ipc_threads.or(self.ipc_threads);
        self.start_timeout = other.start_timeout.or(self.start_timeout);
        self.cookie_timeout_ms = other.cookie_timeout_ms.or(self.cookie_timeout_ms);
        self.test_tokens = other.test_tokens.or(self.test_tokens);
        self.cookie_sync = other.cookie_sync.or(self.cookie_sync);
        self
    }
}

/// Fully resolved, validated options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonOpts {
    pub ipc_threads: usize,
    pub start_timeout: Duration,
    pub cookie_timeout: Duration,
    /// Deterministic token ids, and batch 0 pinned from the start.
    pub test_tokens: bool,
    /// Rendezvous with the listener through a cookie before answering
    /// queries.
    pub cookie_sync: bool,
}

impl Default for DaemonOpts {
    fn default() -> Self {
        Self {
            ipc_threads: DEFAULT_IPC_THREADS,
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            cookie_timeout: Duration::from_millis(DEFAULT_COOKIE_TIMEOUT_MS),
            test_tokens: false,
            cookie_sync: true,
        }
    }
}

impl TryFrom<ConfigurationOptions> for DaemonOpts {
    type Error = ConfigError;

    fn try_from(options: ConfigurationOptions) -> Result<Self, Self::Error> {
        let defaults = DaemonOpts::default();
        let ipc_threads = match options.ipc_threads {
            None => defaults.ipc_threads,
            Some(value) => usize::try_from(value)
                .ok()
                .filter(|threads| *threads >= 1)
                .ok_or(ConfigError::OutOfRange {
                    key: "ipcThreads",
                    value,
                })?,
        };
        let start_timeout = match options.start_timeout {
            None => defaults.start_timeout,
            Some(value) => Duration::from_secs(non_negative("startTimeout", value)?),
        };
        let cookie_timeout = match options.cookie_timeout_ms {
            None => defaults.cookie_timeout,
            Some(value) => Duration::from_millis(non_negative("cookieTimeoutMs", value)?),
        };
        Ok(Self {
            ipc_threads,
            start_timeout,
            cookie_timeout,
            test_tokens: options.test_tokens.unwrap_or(defaults.test_tokens),
            cookie_sync: options.cookie_sync.unwrap_or(defaults.cookie_sync),
        })
    }
}

fn non_negative(key: &'static str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::OutOfRange { key, value })
}

pub struct DaemonConfigBuilder {
    metadata_dir: Utf8PathBuf,
    override_config: ConfigurationOptions,
    environment: Option<HashMap<OsString, OsString>>,
}

impl DaemonConfigBuilder {
    pub fn new(metadata_dir: &Utf8Path) -> Self {
        Self {
            metadata_dir: metadata_dir.to_owned(),
            override_config: ConfigurationOptions::default(),
            environment: None,
        }
    }

    /// Replaces the process environment as the source of `FSMONITOR_*`
    /// variables.
    pub fn with_environment(mut self, environment: HashMap<OsString, OsString>) -> Self {
        self.environment = Some(environment);
        self
    }

    create_builder!(with_ipc_threads, ipc_threads, Option<i64>);
    create_builder!(with_start_timeout, start_timeout, Option<i64>);
    create_builder!(with_test_tokens, test_tokens, Option<bool>);

    fn config_path(&self) -> Utf8PathBuf {
        self.metadata_dir.join(CONFIG_FILE_NAME)
    }

    fn get_file_config(&self) -> Result<ConfigurationOptions, ConfigError> {
        let path = self.config_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConfigurationOptions::default())
            }
            Err(error) => return Err(ConfigError::FailedToReadConfig { path, error }),
        };
        if contents.trim().is_empty() {
            return Ok(ConfigurationOptions::default());
        }
        serde_json::from_str(&contents).map_err(|error| ConfigError::InvalidConfigFile { path, error })
    }

    pub fn build(&self) -> Result<DaemonOpts, ConfigError> {
        let file_config = self.get_file_config()?;
        let env_config = match &self.environment {
            Some(environment) => get_env_var_config(environment)?,
            None => {
                let environment: HashMap<_, _> = std::env::vars_os().collect();
                get_env_var_config(&environment)?
            }
        };

        let options = [file_config, env_config, self.override_config.clone()]
            .into_iter()
            .fold(ConfigurationOptions::default(), ConfigurationOptions::merge);

        DaemonOpts::try_from(options)
    }
}

pub fn truth_env_var(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn get_env_var_config(
    environment: &HashMap<OsString, OsString>,
) -> Result<ConfigurationOptions, ConfigError> {
    let mut output_map: HashMap<&str, (&'static str, String)> = HashMap::new();
    for &(var, property) in ENV_MAPPING {
        if let Some(value) = environment.get(OsStr::new(var)) {
            let value = value.to_str().ok_or(ConfigError::Encoding(var))?;
            if !value.is_empty() {
                output_map.insert(property, (var, value.to_owned()));
            }
        }
    }

    let number = |property: &str| -> Result<Option<i64>, ConfigError> {
        output_map
            .get(property)
            .map(|&(var, ref value)| {
                value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    var,
                    value: value.clone(),
                })
            })
            .transpose()
    };
    let boolean = |property: &str| -> Result<Option<bool>, ConfigError> {
        output_map
            .get(property)
            .map(|&(var, ref value)| {
                truth_env_var(value).ok_or_else(|| ConfigError::InvalidValue {
                    var,
                    value: value.clone(),
                })
            })
            .transpose()
    };

    Ok(ConfigurationOptions {
        ipc_threads: number("ipc_threads")?,
        start_timeout: number("start_timeout")?,
        cookie_timeout_ms: number("cookie_timeout_ms")?,
        test_tokens: boolean("test_tokens")?,
        cookie_sync: boolean("cookie_sync")?,
    })
}
