//! Instrument controllers for the four-probe bench.
//!
//! - [`SourceController`]: Keithley 2400-class source/measure unit
//! - [`SenseController`]: Keithley 2182-class nanovoltmeter (high-precision mode)
//! - [`ProbeController`]: auxiliary single-value meter, typically a thermometer
//!
//! All three are configured from an [`InstrumentConfig`] once per session and
//! only reconfigured between sweeps.

pub mod probe;
pub mod sense;
pub mod source;

pub use probe::ProbeController;
pub use sense::SenseController;
pub use source::SourceController;

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Quantity the source instrument drives through the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFunction {
    #[default]
    Current,
    Voltage,
}

impl SourceFunction {
    /// SCPI mnemonic for the driven quantity.
    pub fn mnemonic(self) -> &'static str {
        match self {
            SourceFunction::Current => "CURR",
            SourceFunction::Voltage => "VOLT",
        }
    }

    /// SCPI mnemonic for the quantity measured while sourcing.
    pub fn measured_mnemonic(self) -> &'static str {
        match self {
            SourceFunction::Current => "VOLT",
            SourceFunction::Voltage => "CURR",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SourceFunction::Current => "A",
            SourceFunction::Voltage => "V",
        }
    }

    pub fn measured_unit(self) -> &'static str {
        match self {
            SourceFunction::Current => "V",
            SourceFunction::Voltage => "A",
        }
    }
}

impl fmt::Display for SourceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFunction::Current => write!(f, "current"),
            SourceFunction::Voltage => write!(f, "voltage"),
        }
    }
}

/// What the source instrument returns from a self read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadbackElement {
    /// The complementary quantity (voltage when sourcing current).
    #[default]
    Measured,
    /// The instrument's own four-wire resistance computation.
    Resistance,
}

/// Who picks the test current for a resistance read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResistanceMode {
    /// The programmed source level is applied.
    #[default]
    Manual,
    /// Auto-ohms: the instrument chooses the current for the reading range.
    Auto,
}

/// How a reading is triggered on the sense instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// `:READ?` triggers and returns in one transaction.
    #[default]
    Immediate,
    /// Arm with `:INIT`, fire with `*TRG`, collect with `:FETC?`.
    Bus,
}

/// Hardware envelope of the source instrument. Configuration outside these
/// bounds is rejected before any command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceLimits {
    /// Largest current range in A.
    #[serde(default = "default_max_current")]
    pub max_current: f64,
    /// Largest voltage range in V.
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
}

fn default_max_current() -> f64 {
    1.05
}

fn default_max_voltage() -> f64 {
    210.0
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            max_current: default_max_current(),
            max_voltage: default_max_voltage(),
        }
    }
}

impl SourceLimits {
    pub fn max_for(&self, function: SourceFunction) -> f64 {
        match function {
            SourceFunction::Current => self.max_current,
            SourceFunction::Voltage => self.max_voltage,
        }
    }

    /// Compliance applies to the complementary quantity.
    pub fn max_compliance_for(&self, function: SourceFunction) -> f64 {
        match function {
            SourceFunction::Current => self.max_voltage,
            SourceFunction::Voltage => self.max_current,
        }
    }
}

/// Per-instrument settings applied by `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA resource string (e.g., "GPIB0::24::INSTR")
    pub resource: String,
    /// Source function (source instrument only)
    #[serde(default)]
    pub function: SourceFunction,
    /// Fixed range; `None` selects autorange
    #[serde(default)]
    pub range: Option<f64>,
    /// Compliance limit on the complementary quantity (source instrument only)
    #[serde(default)]
    pub compliance: Option<f64>,
    /// Integration time in power-line cycles
    #[serde(default = "default_nplc")]
    pub nplc: f64,
    /// Trigger mode (sense instrument only)
    #[serde(default)]
    pub trigger: TriggerMode,
    /// Input channel (sense instrument only)
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Read-back element (source instrument only)
    #[serde(default)]
    pub readback: ReadbackElement,
    /// Test current selection for the resistance read-back
    #[serde(default)]
    pub resistance_mode: ResistanceMode,
    /// Four-wire remote sense (source instrument only)
    #[serde(default = "default_four_wire")]
    pub four_wire: bool,
    /// Bound on a single transaction
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_nplc() -> f64 {
    1.0
}

fn default_channel() -> u8 {
    1
}

fn default_four_wire() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl InstrumentConfig {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            function: SourceFunction::default(),
            range: None,
            compliance: None,
            nplc: default_nplc(),
            trigger: TriggerMode::default(),
            channel: default_channel(),
            readback: ReadbackElement::default(),
            resistance_mode: ResistanceMode::default(),
            four_wire: default_four_wire(),
            timeout: default_timeout(),
        }
    }

    /// The instrument chooses its own test current.
    pub fn auto_ohms(&self) -> bool {
        self.readback == ReadbackElement::Resistance && self.resistance_mode == ResistanceMode::Auto
    }

    /// Checks shared by every instrument role.
    pub(crate) fn validate_common(&self) -> Result<(), DaqError> {
        if self.resource.trim().is_empty() {
            return Err(DaqError::Config("instrument 'resource' cannot be empty".into()));
        }
        if !(0.01..=100.0).contains(&self.nplc) {
            return Err(DaqError::Config(format!(
                "NPLC {} for '{}' out of range (0.01-100)",
                self.nplc, self.resource
            )));
        }
        if self.timeout.is_zero() {
            return Err(DaqError::Config(format!(
                "timeout for '{}' must be greater than zero",
                self.resource
            )));
        }
        if let Some(range) = self.range {
            if !range.is_finite() || range <= 0.0 {
                return Err(DaqError::Config(format!(
                    "range {} for '{}' must be a positive number",
                    range, self.resource
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_from_minimal_toml() {
        let cfg: InstrumentConfig = toml::from_str(r#"resource = "GPIB0::24::INSTR""#).unwrap();
        assert_eq!(cfg.function, SourceFunction::Current);
        assert_eq!(cfg.nplc, 1.0);
        assert_eq!(cfg.trigger, TriggerMode::Immediate);
        assert!(cfg.four_wire);
        assert_eq!(cfg.timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_parses_humantime_timeout() {
        let cfg: InstrumentConfig = toml::from_str(
            r#"
            resource = "GPIB0::7::INSTR"
            trigger = "bus"
            nplc = 5.0
            timeout = "750ms"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.trigger, TriggerMode::Bus);
        assert_eq!(cfg.timeout, Duration::from_millis(750));
    }

    #[test]
    fn auto_ohms_needs_resistance_readback() {
        let cfg: InstrumentConfig = toml::from_str(
            r#"
            resource = "GPIB0::24::INSTR"
            readback = "resistance"
            resistance_mode = "auto"
            "#,
        )
        .unwrap();
        assert!(cfg.auto_ohms());
        let measured = InstrumentConfig {
            readback: ReadbackElement::Measured,
            ..cfg
        };
        assert!(!measured.auto_ohms());
    }

    #[test]
    fn empty_resource_rejected() {
        let cfg = InstrumentConfig::new("  ");
        assert!(matches!(cfg.validate_common(), Err(DaqError::Config(_))));
    }

    #[test]
    fn limits_pick_complementary_compliance() {
        let limits = SourceLimits::default();
        assert_eq!(limits.max_for(SourceFunction::Current), 1.05);
        assert_eq!(limits.max_compliance_for(SourceFunction::Current), 210.0);
    }
}
