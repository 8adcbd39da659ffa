// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Server configuration, layered from four sources.
//!
//! Precedence, strongest first: command-line arguments, a properties
//! file, `TRIPTYCH_*` environment variables, built-in defaults. Option
//! names are matched ignoring case, dashes and underscores, so
//! `--max-connections`, `maxConnections` and `TRIPTYCH_MAX_CONNECTIONS`
//! all address the same knob.

use std::env;
use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::Serialize;

/// Effective server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port.
    pub port: u16,
    /// Worker cap for the threaded engine; also sizes the hybrid
    /// engine's I/O pool.
    pub thread_pool_size: usize,
    /// Listen backlog handed to the OS.
    pub backlog: u32,
    /// Ceiling on simultaneously open connections.
    pub max_connections: usize,
    /// Whether /health, /metrics and /info get mounted.
    pub monitoring_enabled: bool,
    /// Blocking-socket read timeout.
    pub read_timeout: Duration,
    /// Per-request deadline on the hybrid engine.
    pub request_deadline: Duration,
    /// Offload pool size on the event-loop engine.
    pub offload_workers: usize,
    /// Budget for draining connections at shutdown, and again for pool
    /// termination.
    pub shutdown_drain: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8080,
            thread_pool_size: 200,
            backlog: 50,
            max_connections: 1_000,
            monitoring_enabled: true,
            read_timeout: Duration::from_secs(30),
            request_deadline: Duration::from_secs(10),
            offload_workers: num_cpus::get(),
            shutdown_drain: Duration::from_secs(30),
        }
    }
}

/// Problems assembling or validating a [`Config`].
#[derive(Debug)]
pub enum ConfigError {
    /// An option name no layer recognises.
    UnknownOption(String),
    /// A value that doesn't parse for its option.
    InvalidValue { option: String, value: String },
    /// A command-line flag with no value after it.
    MissingValue(String),
    /// A value outside its documented range.
    OutOfRange { option: &'static str, constraint: &'static str },
    /// The properties file couldn't be read.
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::UnknownOption(ref name) => {
                write!(fmt, "unknown configuration option `{}`", name)
            }
            ConfigError::InvalidValue { ref option, ref value } => {
                write!(fmt, "invalid value `{}` for option `{}`", value, option)
            }
            ConfigError::MissingValue(ref name) => {
                write!(fmt, "option `{}` is missing a value", name)
            }
            ConfigError::OutOfRange { option, constraint } => {
                write!(fmt, "option `{}` must be {}", option, constraint)
            }
            ConfigError::Io(ref err) => write!(fmt, "cannot read properties file: {}", err),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ConfigError::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

// The closed set of recognised option names, in canonical form (lower
// case, separators stripped).
const OPTIONS: &[&str] = &[
    "port",
    "threadpoolsize",
    "backlog",
    "maxconnections",
    "monitoringenabled",
    "requesttimeoutms",
    "eventloopworkers",
];

fn canonical(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl Config {
    /// Defaults overridden by environment, then a properties file, then
    /// command-line arguments, then validated.
    pub fn load(args: &[String], properties: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        if let Some(path) = properties {
            config.apply_properties(path)?;
        }
        config.apply_args(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `TRIPTYCH_<OPTION>` variables for every recognised option.
    pub fn apply_env(&mut self) {
        for option in OPTIONS {
            let variable = format!("TRIPTYCH_{}", option.to_ascii_uppercase());
            if let Ok(value) = env::var(&variable) {
                debug!("config: {} = {} (environment)", option, value);
                // A malformed environment value is ignored rather than
                // fatal; the stronger layers can still fix it.
                let _ = self.apply_option(option, &value);
            }
        }
    }

    /// Applies `key=value` lines. Blank lines and `#` comments are
    /// skipped; unknown keys are errors.
    pub fn apply_properties(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.find('=') {
                Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
                None => {
                    return Err(ConfigError::InvalidValue {
                        option: line.to_owned(),
                        value: String::new(),
                    });
                }
            };
            debug!("config: {} = {} (properties)", key, value);
            self.apply_option(&canonical(key), value)?;
        }
        Ok(())
    }

    /// Applies `--option=value` and `--option value` arguments.
    pub fn apply_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let stripped = match arg.strip_prefix("--") {
                Some(stripped) => stripped,
                None => return Err(ConfigError::UnknownOption(arg.clone())),
            };
            let (key, value) = match stripped.find('=') {
                Some(pos) => (&stripped[..pos], stripped[pos + 1..].to_owned()),
                None => {
                    let value = iter.next().ok_or_else(|| {
                        ConfigError::MissingValue(arg.clone())
                    })?;
                    (stripped, value.clone())
                }
            };
            debug!("config: {} = {} (command line)", key, value);
            self.apply_option(&canonical(key), &value)?;
        }
        Ok(())
    }

    fn apply_option(&mut self, canonical_key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            option: canonical_key.to_owned(),
            value: value.to_owned(),
        };
        match canonical_key {
            "port" => self.port = value.parse().map_err(|_| invalid())?,
            "threadpoolsize" => self.thread_pool_size = value.parse().map_err(|_| invalid())?,
            "backlog" => self.backlog = value.parse().map_err(|_| invalid())?,
            "maxconnections" => self.max_connections = value.parse().map_err(|_| invalid())?,
            "monitoringenabled" => {
                self.monitoring_enabled = match value.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    _ => return Err(invalid()),
                };
            }
            "requesttimeoutms" => {
                let millis: u64 = value.parse().map_err(|_| invalid())?;
                self.request_deadline = Duration::from_millis(millis);
            }
            "eventloopworkers" => self.offload_workers = value.parse().map_err(|_| invalid())?,
            _ => return Err(ConfigError::UnknownOption(canonical_key.to_owned())),
        }
        Ok(())
    }

    /// Range checks every knob.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::OutOfRange { option: "port", constraint: "in 1..65535" });
        }
        if self.thread_pool_size < 1 {
            return Err(ConfigError::OutOfRange {
                option: "threadPoolSize",
                constraint: "at least 1",
            });
        }
        if self.backlog < 1 {
            return Err(ConfigError::OutOfRange { option: "backlog", constraint: "at least 1" });
        }
        if self.max_connections < 1 {
            return Err(ConfigError::OutOfRange {
                option: "maxConnections",
                constraint: "at least 1",
            });
        }
        if self.request_deadline.as_millis() == 0 {
            return Err(ConfigError::OutOfRange {
                option: "requestTimeoutMs",
                constraint: "at least 1",
            });
        }
        if self.offload_workers < 1 {
            return Err(ConfigError::OutOfRange {
                option: "eventLoopWorkers",
                constraint: "at least 1",
            });
        }
        Ok(())
    }

    /// The serialisable view `/info` exposes.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            port: self.port,
            thread_pool_size: self.thread_pool_size,
            backlog: self.backlog,
            max_connections: self.max_connections,
            monitoring_enabled: self.monitoring_enabled,
            read_timeout_ms: self.read_timeout.as_millis() as u64,
            request_timeout_ms: self.request_deadline.as_millis() as u64,
            event_loop_workers: self.offload_workers,
            shutdown_drain_ms: self.shutdown_drain.as_millis() as u64,
        }
    }
}

/// See [`Config::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub port: u16,
    pub thread_pool_size: usize,
    pub backlog: u32,
    pub max_connections: usize,
    pub monitoring_enabled: bool,
    pub read_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub event_loop_workers: usize,
    pub shutdown_drain_ms: u64,
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::{canonical, Config, ConfigError};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn canonical_naming() {
        assert_eq!(canonical("maxConnections"), "maxconnections");
        assert_eq!(canonical("max-connections"), "maxconnections");
        assert_eq!(canonical("MAX_CONNECTIONS"), "maxconnections");
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 1_000);
        assert_eq!(config.backlog, 50);
        assert_eq!(config.request_deadline, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn command_line_overrides() {
        let mut config = Config::default();
        config.apply_args(&args(&[
            "--port=9000",
            "--max-connections", "64",
            "--monitoring-enabled=false",
            "--request-timeout-ms", "2500",
        ])).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_connections, 64);
        assert!(!config.monitoring_enabled);
        assert_eq!(config.request_deadline, Duration::from_millis(2_500));
    }

    #[test]
    fn rejects_unknown_and_malformed_args() {
        let mut config = Config::default();
        match config.apply_args(&args(&["--warp-speed=9"])) {
            Err(ConfigError::UnknownOption(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match config.apply_args(&args(&["--port"])) {
            Err(ConfigError::MissingValue(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match config.apply_args(&args(&["--port=zero"])) {
            Err(ConfigError::InvalidValue { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn properties_file_layer() {
        let mut path = std::env::temp_dir();
        path.push(format!("triptych-config-test-{}.properties", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "threadPoolSize = 32").unwrap();
        writeln!(file, "backlog=128").unwrap();
        drop(file);

        let mut config = Config::default();
        config.apply_properties(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.thread_pool_size, 32);
        assert_eq!(config.backlog, 128);
    }

    #[test]
    fn command_line_beats_properties() {
        let mut path = std::env::temp_dir();
        path.push(format!("triptych-config-prec-{}.properties", std::process::id()));
        std::fs::write(&path, "port=7000\n").unwrap();

        let config = Config::load(&args(&["--port=7001"]), Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.port, 7001);
    }

    #[test]
    fn validation_catches_zeroes() {
        let mut config = Config::default();
        config.max_connections = 0;
        match config.validate() {
            Err(ConfigError::OutOfRange { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
