//! Sweep definition, state machine and orchestration.
//!
//! A [`SweepSpec`] lists the source levels to apply; the [`SweepEngine`] walks
//! them one at a time and produces a [`SweepResult`].
//!
//! ```text
//! Idle -> Configuring -> (StepSourcing -> StepSettling -> StepMeasuring -> StepRecording)*
//!      -> Finalizing -> Done | Faulted
//! ```

pub mod compute;
pub mod engine;
pub mod result;

pub use compute::{PointResistance, ReadingStats};
pub use engine::{Instruments, SenseStrategy, SweepEngine};
pub use result::{MeasurementPoint, ReverseLeg, SweepFault, SweepMetadata, SweepResult, SweepStatus};

use crate::error::DaqError;
use crate::instrument::SourceFunction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Driven levels with a smaller magnitude are treated as zero. The driven
/// value is the divisor of every resistance computation.
pub const MIN_DRIVEN_LEVEL: f64 = 1e-15;

/// Precision tier of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepMode {
    /// The source instrument reads back the sample response itself.
    #[default]
    Standard,
    /// A nanovoltmeter senses the voltage after each source event.
    HighPrecision,
}

impl fmt::Display for SweepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepMode::Standard => write!(f, "standard"),
            SweepMode::HighPrecision => write!(f, "high-precision"),
        }
    }
}

/// One source level and its optional settling delay override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "LevelRepr", into = "LevelRepr")]
pub struct SweepLevel {
    pub value: f64,
    /// Overrides the global settling delay, in seconds.
    pub delay_seconds: Option<f64>,
}

/// Levels may be written as bare numbers or as `{ level, delay }` tables.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LevelRepr {
    Plain(f64),
    Detailed {
        level: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<f64>,
    },
}

impl From<LevelRepr> for SweepLevel {
    fn from(repr: LevelRepr) -> Self {
        match repr {
            LevelRepr::Plain(value) => SweepLevel::new(value),
            LevelRepr::Detailed { level, delay } => SweepLevel {
                value: level,
                delay_seconds: delay,
            },
        }
    }
}

impl From<SweepLevel> for LevelRepr {
    fn from(level: SweepLevel) -> Self {
        match level.delay_seconds {
            None => LevelRepr::Plain(level.value),
            Some(delay) => LevelRepr::Detailed {
                level: level.value,
                delay: Some(delay),
            },
        }
    }
}

impl SweepLevel {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            delay_seconds: None,
        }
    }

    pub fn with_delay(value: f64, delay_seconds: f64) -> Self {
        Self {
            value,
            delay_seconds: Some(delay_seconds),
        }
    }
}

/// Everything one sweep needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    #[serde(default)]
    pub mode: SweepMode,
    #[serde(default)]
    pub source_function: SourceFunction,
    pub levels: Vec<SweepLevel>,
    #[serde(default)]
    pub settling_delay_seconds: f64,
    #[serde(default = "default_one")]
    pub repeats_per_point: u32,
    /// Compliance on the complementary quantity (V when sourcing current).
    pub compliance_limit: f64,
    /// Sense integration time in NPLC, high-precision mode only.
    #[serde(default)]
    pub integration_time: Option<f64>,
    /// Measure each level at +level and -level and average.
    #[serde(default)]
    pub current_reversal: bool,
    /// Repeat the whole level list this many times.
    #[serde(default = "default_one")]
    pub repeat_cycles: u32,
    /// Period between cycle starts, for timed series. Without it cycles run
    /// back to back.
    #[serde(default)]
    pub cycle_interval_seconds: Option<f64>,
    /// Query the programmed level back after each set.
    #[serde(default)]
    pub verify_level: bool,
}

fn default_one() -> u32 {
    1
}

/// Seconds as a `Duration`; negative, non-finite and out-of-range values are
/// configuration errors.
fn checked_seconds(seconds: f64, what: &str) -> Result<Duration, DaqError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        DaqError::Config(format!(
            "{} {} s must be a finite, representable number >= 0",
            what, seconds
        ))
    })
}

impl SweepSpec {
    pub fn new(levels: impl IntoIterator<Item = f64>, compliance_limit: f64) -> Self {
        Self {
            mode: SweepMode::default(),
            source_function: SourceFunction::default(),
            levels: levels.into_iter().map(SweepLevel::new).collect(),
            settling_delay_seconds: 0.0,
            repeats_per_point: 1,
            compliance_limit,
            integration_time: None,
            current_reversal: false,
            repeat_cycles: 1,
            cycle_interval_seconds: None,
            verify_level: false,
        }
    }

    pub fn with_mode(mut self, mode: SweepMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_settling_delay(mut self, seconds: f64) -> Self {
        self.settling_delay_seconds = seconds;
        self
    }

    pub fn with_repeats(mut self, repeats: u32) -> Self {
        self.repeats_per_point = repeats;
        self
    }

    /// Total number of points a completed sweep produces.
    pub fn point_count(&self) -> usize {
        self.levels.len() * self.repeat_cycles as usize
    }

    /// Settling delay for `level`, honoring its override. Cannot fail on a
    /// validated sweep.
    pub fn delay_for(&self, level: &SweepLevel) -> Result<Duration, DaqError> {
        match level.delay_seconds {
            Some(seconds) => checked_seconds(seconds, "delay override"),
            None => checked_seconds(self.settling_delay_seconds, "settling_delay_seconds"),
        }
    }

    /// Period between cycle starts, if the sweep is a timed series.
    pub fn cycle_interval(&self) -> Result<Option<Duration>, DaqError> {
        self.cycle_interval_seconds
            .map(|seconds| checked_seconds(seconds, "cycle_interval_seconds"))
            .transpose()
    }

    /// Check the sweep against the largest level the source can drive.
    ///
    /// Runs before any instrument I/O; every violation is a
    /// [`DaqError::Config`].
    pub fn validate(&self, max_level: f64) -> Result<(), DaqError> {
        if self.levels.is_empty() {
            return Err(DaqError::Config("sweep has no levels".into()));
        }
        let unit = self.source_function.unit();
        for (i, level) in self.levels.iter().enumerate() {
            if !level.value.is_finite() {
                return Err(DaqError::Config(format!(
                    "level {} is not a finite number",
                    i
                )));
            }
            if level.value.abs() > max_level {
                return Err(DaqError::Config(format!(
                    "level {} ({} {}) exceeds the source range of {} {}",
                    i, level.value, unit, max_level, unit
                )));
            }
            if level.value.abs() < MIN_DRIVEN_LEVEL {
                return Err(DaqError::Config(format!(
                    "level {} drives {} {}; the driven {} is the resistance divisor and cannot be zero",
                    i, level.value, unit, self.source_function
                )));
            }
            if let Some(delay) = level.delay_seconds {
                checked_seconds(delay, &format!("delay override for level {}", i))?;
            }
        }
        checked_seconds(self.settling_delay_seconds, "settling_delay_seconds")?;
        if let Some(interval) = self.cycle_interval()? {
            if interval.is_zero() {
                return Err(DaqError::Config(
                    "cycle_interval_seconds must be greater than zero".into(),
                ));
            }
        }
        if self.repeats_per_point == 0 {
            return Err(DaqError::Config("repeats_per_point must be >= 1".into()));
        }
        if self.repeat_cycles == 0 {
            return Err(DaqError::Config("repeat_cycles must be >= 1".into()));
        }
        if !self.compliance_limit.is_finite() || self.compliance_limit <= 0.0 {
            return Err(DaqError::Config(format!(
                "compliance_limit {} must be a positive number",
                self.compliance_limit
            )));
        }
        if let Some(nplc) = self.integration_time {
            if !(0.01..=100.0).contains(&nplc) {
                return Err(DaqError::Config(format!(
                    "integration_time {} NPLC out of range (0.01-100)",
                    nplc
                )));
            }
        }
        if self.mode == SweepMode::HighPrecision && self.source_function == SourceFunction::Voltage {
            return Err(DaqError::Config(
                "high-precision mode senses voltage and requires current sourcing".into(),
            ));
        }
        Ok(())
    }
}

/// Where the engine is in a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Configuring,
    StepSourcing { step: usize },
    StepSettling { step: usize },
    StepMeasuring { step: usize },
    StepRecording { step: usize },
    Finalizing,
    Done,
    Faulted,
}
