//! Configuration using Figment
//!
//! Settings are merged from, in increasing priority:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, or `im_control.toml` in the working directory if present)
//! 3. environment variables prefixed with `IM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! IM_CONNECTION__HOST=192.168.1.20
//! IM_CONNECTION__PORT=6260
//! IM_LOGGING__LEVEL=debug
//! IM_SIMULATOR__FOCUS_Z_UM=18042.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use im_control::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("Imaging Machine at {}:{}", settings.connection.host, settings.connection.port);
//! # Ok::<(), im_control::ImError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ImError, ImResult};

/// File picked up from the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "im_control.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "IM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote-control connection
    pub connection: ConnectionSettings,
    /// Log output
    pub logging: LoggingSettings,
    /// Simulated Imaging Machine
    pub simulator: SimulatorSettings,
    /// Rhai script execution
    pub scripting: ScriptingSettings,
}

/// Connection to the Imaging Machine software
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Host running the IM software
    pub host: String,
    /// Remote-control TCP port
    pub port: u16,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Reply timeout for ordinary commands in milliseconds
    pub read_timeout_ms: u64,
    /// Reply timeout for autofocus and acquire in milliseconds
    pub long_read_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6260,
            connect_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            long_read_timeout_ms: 600_000,
        }
    }
}

impl ConnectionSettings {
    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reply timeout for ordinary commands
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Reply timeout for autofocus and acquire
    pub fn long_read_timeout(&self) -> Duration {
        Duration::from_millis(self.long_read_timeout_ms)
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "im_control=info".to_string(),
            json: false,
        }
    }
}

/// Simulated Imaging Machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// Listen address of `im_control simulate`
    pub bind: String,
    /// Z of the best-focus plane in µm
    pub focus_z_um: f64,
    /// Half-width of the hardware autofocus capture range in µm
    pub hardware_af_range_um: f64,
    /// Default project folder
    pub project_folder: String,
    /// Artificial delay per command in milliseconds
    pub latency_ms: u64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:6260".to_string(),
            focus_z_um: 18_042.0,
            hardware_af_range_um: 2_000.0,
            project_folder: "IM_Projects".to_string(),
            latency_ms: 0,
        }
    }
}

impl SimulatorSettings {
    /// Per-command delay.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// Rhai script execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingSettings {
    /// Maximum Rhai operations per script run
    pub max_operations: u64,
}

impl Default for ScriptingSettings {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// With `path == None` the file [`DEFAULT_CONFIG_FILE`] is read if it exists.
    /// An explicit path must exist.
    pub fn load(path: Option<&Path>) -> ImResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ImError::Configuration(format!(
                        "config file '{}' does not exist",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string on top of the defaults, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> ImResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render as TOML, e.g. to start a config file from the effective settings.
    pub fn to_toml_string(&self) -> ImResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ImError::Configuration(format!("cannot serialize settings: {e}")))
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> ImResult<()> {
        let c = &self.connection;
        if c.host.trim().is_empty() {
            return Err(ImError::Configuration("connection.host is empty".into()));
        }
        if c.port == 0 {
            return Err(ImError::Configuration("connection.port must not be 0".into()));
        }
        for (name, value) in [
            ("connect_timeout_ms", c.connect_timeout_ms),
            ("write_timeout_ms", c.write_timeout_ms),
            ("read_timeout_ms", c.read_timeout_ms),
            ("long_read_timeout_ms", c.long_read_timeout_ms),
        ] {
            if value == 0 {
                return Err(ImError::Configuration(format!(
                    "connection.{name} must be greater than 0"
                )));
            }
        }
        if self.simulator.hardware_af_range_um < 0.0 {
            return Err(ImError::Configuration(
                "simulator.hardware_af_range_um must not be negative".into(),
            ));
        }
        if self.scripting.max_operations == 0 {
            return Err(ImError::Configuration(
                "scripting.max_operations must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.connection.port, 6260);
        assert_eq!(settings.connection.read_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
[connection]
host = "192.168.1.20"
long_read_timeout_ms = 120000

[logging]
json = true
"#,
        )
        .unwrap();
        assert_eq!(settings.connection.host, "192.168.1.20");
        assert_eq!(settings.connection.port, 6260);
        assert_eq!(settings.connection.long_read_timeout(), Duration::from_secs(120));
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "im_control=info");
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let err = Settings::from_toml_str("[connection]\nport = 0\n").unwrap_err();
        assert!(matches!(err, ImError::Configuration(msg) if msg.contains("port")));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let err = Settings::from_toml_str("[connection]\nread_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("read_timeout_ms"));
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let err = Settings::from_toml_str("[connection]\nport = \"six\"\n").unwrap_err();
        assert!(matches!(err, ImError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[simulator]\nfocus_z_um = 17500.0\nproject_folder = \"/data/im\""
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.simulator.focus_z_um, 17500.0);
        assert_eq!(settings.simulator.project_folder, "/data/im");
    }

    #[test]
    fn test_shipped_default_file_matches_defaults() {
        let shipped = Settings::from_toml_str(include_str!("../config/default.toml")).unwrap();
        assert_eq!(shipped, Settings::default());
    }

    #[test]
    fn test_rendered_toml_reloads() {
        let mut settings = Settings::default();
        settings.connection.host = "im-04.lab".to_string();
        settings.simulator.latency_ms = 250;
        let rendered = settings.to_toml_string().unwrap();
        assert!(rendered.contains("[connection]"));
        assert_eq!(Settings::from_toml_str(&rendered).unwrap(), settings);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nhost = \"from-file\"\nport = 7000").unwrap();

        std::env::set_var("IM_CONNECTION__HOST", "from-env");
        let settings = Settings::load(Some(file.path()));
        std::env::remove_var("IM_CONNECTION__HOST");

        let settings = settings.unwrap();
        assert_eq!(settings.connection.host, "from-env");
        assert_eq!(settings.connection.port, 7000);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let err = Settings::load(Some(Path::new("/nonexistent/im_control.toml"))).unwrap_err();
        assert!(matches!(err, ImError::Configuration(_)));
    }
}
