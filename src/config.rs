//! Configuration loading using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration, `config/fourprobe.toml` by default)
//! 2. environment variables prefixed with `FOURPROBE_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, since many keys contain
//! single underscores:
//!
//! ```text
//! FOURPROBE_APPLICATION__LOG_LEVEL=debug
//! FOURPROBE_SWEEP__REPEATS_PER_POINT=10
//! FOURPROBE_RETRY__BACKOFF_DELAY=250ms
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fourprobe_daq::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_from("config/fourprobe.toml")?;
//!     println!("Sweep: {} levels", settings.sweep.levels.len());
//!     Ok(())
//! }
//! ```

use crate::error::DaqError;
use crate::error_recovery::RetryPolicy;
use crate::instrument::probe::ProbeConfig;
use crate::instrument::{InstrumentConfig, ReadbackElement, ResistanceMode, SourceLimits};
use crate::sweep::{SweepMode, SweepSpec};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/fourprobe.toml";
pub const ENV_PREFIX: &str = "FOURPROBE_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Source/measure unit
    pub source: InstrumentConfig,
    #[serde(default)]
    pub source_limits: SourceLimits,
    /// Nanovoltmeter; required for high-precision sweeps
    #[serde(default)]
    pub sense: Option<InstrumentConfig>,
    /// Auxiliary probe read once per point
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
    pub sweep: SweepSpec,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Sweep name, used in result file names
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for result files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

fn default_name() -> String {
    "sweep".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            output_dir: default_output_dir(),
            json_logs: false,
        }
    }
}

impl Settings {
    /// Load configuration from the default location
    pub fn load() -> Result<Self, DaqError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, apply environment
    /// overrides and validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, DaqError> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument settings are in range
    /// - High-precision sweeps have a `[sense]` instrument
    /// - The sweep itself is valid against the source range
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.application.name.trim().is_empty() {
            return Err(DaqError::Config("application.name cannot be empty".into()));
        }

        self.retry.validate()?;
        self.source.validate_common()?;
        if self.source.resistance_mode == ResistanceMode::Auto {
            if self.source.readback != ReadbackElement::Resistance {
                return Err(DaqError::Config(
                    "resistance_mode = \"auto\" needs readback = \"resistance\"".into(),
                ));
            }
            if self.sweep.current_reversal {
                return Err(DaqError::Config(
                    "current reversal needs a programmed current; disable auto-ohms".into(),
                ));
            }
        }

        match (&self.sense, self.sweep.mode) {
            (None, SweepMode::HighPrecision) => {
                return Err(DaqError::Config(
                    "high-precision mode requires a [sense] instrument".into(),
                ))
            }
            (Some(sense), _) => sense.validate_common()?,
            (None, SweepMode::Standard) => {}
        }

        if let Some(probe) = &self.probe {
            if probe.resource.trim().is_empty() {
                return Err(DaqError::Config("probe 'resource' cannot be empty".into()));
            }
            if probe.timeout.is_zero() {
                return Err(DaqError::Config("probe timeout must be greater than zero".into()));
            }
        }

        let hardware = self.source_limits.max_for(self.sweep.source_function);
        let max_level = self.source.range.map_or(hardware, |r| r.min(hardware));
        self.sweep.validate(max_level)?;

        let max_compliance = self
            .source_limits
            .max_compliance_for(self.sweep.source_function);
        if self.sweep.compliance_limit > max_compliance {
            return Err(DaqError::Config(format!(
                "compliance_limit {} exceeds hardware maximum {}",
                self.sweep.compliance_limit, max_compliance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::TriggerMode;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const STANDARD: &str = r#"
        [application]
        name = "film-a"
        log_level = "debug"

        [source]
        resource = "GPIB0::24::INSTR"
        range = 0.01

        [sweep]
        levels = [0.001, 0.002, { level = 0.003, delay = 1.5 }]
        settling_delay_seconds = 0.5
        repeats_per_point = 5
        compliance_limit = 21.0

        [retry]
        max_attempts = 4
        backoff_delay = "50ms"
    "#;

    fn parse(toml: &str) -> Result<Settings, DaqError> {
        let settings: Settings = Figment::new().merge(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    #[test]
    fn test_standard_config_loads() {
        let settings = parse(STANDARD).unwrap();
        assert_eq!(settings.application.name, "film-a");
        assert_eq!(settings.sweep.levels.len(), 3);
        assert_eq!(settings.sweep.repeats_per_point, 5);
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.backoff_delay, Duration::from_millis(50));
        assert!(settings.sense.is_none());
        assert_eq!(settings.source_limits, SourceLimits::default());
    }

    #[test]
    fn test_high_precision_requires_sense() {
        let toml = STANDARD.replace("[sweep]", "[sweep]\nmode = \"high-precision\"");
        let err = parse(&toml).unwrap_err();
        assert!(err.to_string().contains("[sense]"));

        let with_sense = format!(
            "{}\n[sense]\nresource = \"GPIB0::7::INSTR\"\ntrigger = \"bus\"\n",
            toml
        );
        let settings = parse(&with_sense).unwrap();
        assert_eq!(settings.sense.unwrap().trigger, TriggerMode::Bus);
    }

    #[test]
    fn test_invalid_log_level() {
        let toml = STANDARD.replace("log_level = \"debug\"", "log_level = \"loud\"");
        let result = parse(&toml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_level_beyond_range_rejected() {
        let toml = STANDARD.replace("0.001, 0.002", "0.001, 0.5");
        assert!(matches!(parse(&toml), Err(DaqError::Config(_))));
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let toml = STANDARD.replace("max_attempts = 4", "max_attempts = 0");
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn test_timed_series_and_auto_ohms_settings() {
        let toml = STANDARD
            .replace(
                "range = 0.01",
                "range = 0.01\nreadback = \"resistance\"\nresistance_mode = \"auto\"",
            )
            .replace(
                "compliance_limit = 21.0",
                "compliance_limit = 21.0\nrepeat_cycles = 4\ncycle_interval_seconds = 30.0",
            );
        let settings = parse(&toml).unwrap();
        assert!(settings.source.auto_ohms());
        assert_eq!(settings.sweep.cycle_interval().unwrap(), Some(Duration::from_secs(30)));

        let reversed = toml.replace("repeat_cycles = 4", "repeat_cycles = 4\ncurrent_reversal = true");
        assert!(matches!(parse(&reversed), Err(DaqError::Config(_))));

        let measured = toml.replace("readback = \"resistance\"", "readback = \"measured\"");
        assert!(matches!(parse(&measured), Err(DaqError::Config(_))));

        let zero = toml.replace("cycle_interval_seconds = 30.0", "cycle_interval_seconds = 0.0");
        assert!(matches!(parse(&zero), Err(DaqError::Config(_))));
    }

    #[test]
    fn test_missing_sweep_is_a_load_error() {
        let err = parse("[source]\nresource = \"GPIB0::24::INSTR\"\n").unwrap_err();
        assert!(matches!(err, DaqError::ConfigLoad(_)));
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(STANDARD.as_bytes()).unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("FOURPROBE_SWEEP__REPEATS_PER_POINT", "9");
            jail.set_env("FOURPROBE_APPLICATION__LOG_LEVEL", "warn");
            let settings = Settings::load_from(file.path()).expect("load");
            assert_eq!(settings.sweep.repeats_per_point, 9);
            assert_eq!(settings.application.log_level, "warn");
            Ok(())
        });
    }
}
