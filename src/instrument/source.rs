//! Source/measure unit driver (Keithley 2400 command set)
//!
//! Drives the current or voltage through the sample and, in standard mode,
//! reads the sample response back itself.
//!
//! ## Configuration
//!
//! ```toml
//! [source]
//! resource = "GPIB0::24::INSTR"
//! function = "current"
//! range = 0.01        # A, omit for autorange
//! compliance = 21.0   # V
//! nplc = 1.0
//! ```
//!
//! Every `set_level` changes the physical state of the instrument. It can only
//! be undone by programming a new level or disabling the output.
//!
//! Each bus transaction is bounded by the configured `timeout`; a hung
//! instrument surfaces as [`DaqError::Timeout`].

use super::{InstrumentConfig, ReadbackElement, ResistanceMode, SourceFunction, SourceLimits};
use crate::adapters::InstrumentSession;
use crate::error::DaqError;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Relative tolerance for the level read-back check.
const LEVEL_READBACK_TOLERANCE: f64 = 1e-6;

/// Transaction bound before the first `configure`.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SourceController {
    session: Box<dyn InstrumentSession>,
    limits: SourceLimits,
    config: Option<InstrumentConfig>,
    timeout: Duration,
    level: Option<f64>,
    output_enabled: bool,
}

impl SourceController {
    pub fn new(session: Box<dyn InstrumentSession>, limits: SourceLimits) -> Self {
        Self {
            session,
            limits,
            config: None,
            timeout: DEFAULT_TIMEOUT,
            level: None,
            output_enabled: false,
        }
    }

    pub fn resource(&self) -> &str {
        self.session.resource()
    }

    pub fn limits(&self) -> &SourceLimits {
        &self.limits
    }

    pub fn config(&self) -> Option<&InstrumentConfig> {
        self.config.as_ref()
    }

    pub fn function(&self) -> SourceFunction {
        self.config.as_ref().map(|c| c.function).unwrap_or_default()
    }

    /// Last programmed level, if any.
    pub fn level(&self) -> Option<f64> {
        self.level
    }

    /// Cached output state.
    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    /// The instrument picks its own test current (auto-ohms).
    pub fn auto_ohms(&self) -> bool {
        self.config.as_ref().is_some_and(InstrumentConfig::auto_ohms)
    }

    async fn write(&mut self, command: &str) -> Result<(), DaqError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.session.write_command(command)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DaqError::timeout(self.resource(), command, timeout)),
        }
    }

    async fn query_value(&mut self, command: &str) -> Result<f64, DaqError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.session.query_value(command)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DaqError::timeout(self.resource(), command, timeout)),
        }
    }

    /// Largest level the configured range allows.
    pub fn max_level(&self) -> f64 {
        let hardware = self.limits.max_for(self.function());
        match self.config.as_ref().and_then(|c| c.range) {
            Some(range) => range.min(hardware),
            None => hardware,
        }
    }

    pub(crate) fn validate(&self, config: &InstrumentConfig) -> Result<(), DaqError> {
        config.validate_common()?;
        let max_range = self.limits.max_for(config.function);
        if let Some(range) = config.range {
            if range > max_range {
                return Err(DaqError::Config(format!(
                    "{} range {} exceeds hardware maximum {}",
                    config.function, range, max_range
                )));
            }
        }
        if let Some(compliance) = config.compliance {
            let max_compliance = self.limits.max_compliance_for(config.function);
            if !compliance.is_finite() || compliance <= 0.0 || compliance > max_compliance {
                return Err(DaqError::Config(format!(
                    "compliance {} {} outside supported range (0, {}]",
                    compliance,
                    config.function.measured_unit(),
                    max_compliance
                )));
            }
        }
        if config.resistance_mode == ResistanceMode::Auto
            && config.readback != ReadbackElement::Resistance
        {
            return Err(DaqError::Config(
                "resistance_mode 'auto' requires readback = 'resistance'".into(),
            ));
        }
        Ok(())
    }

    /// Validate, reset and program the instrument.
    pub async fn configure(&mut self, config: InstrumentConfig) -> Result<(), DaqError> {
        self.validate(&config)?;
        self.timeout = config.timeout;

        let function = config.function.mnemonic();
        let measured = config.function.measured_mnemonic();

        self.write("*RST").await?;
        self.write(":STAT:PRES").await?;
        self.write("*CLS").await?;
        // *RST turns the output off.
        self.output_enabled = false;
        self.level = None;

        self.write(&format!(":SOUR:FUNC {}", function)).await?;
        self.write(&format!(":SOUR:{}:MODE FIXED", function)).await?;
        match config.range {
            Some(range) => self.write(&format!(":SOUR:{}:RANG {}", function, range)).await?,
            None => self.write(&format!(":SOUR:{}:RANG:AUTO ON", function)).await?,
        }
        if let Some(compliance) = config.compliance {
            self.write(&format!(":SENS:{}:PROT {}", measured, compliance)).await?;
        }

        match config.readback {
            ReadbackElement::Measured => {
                self.write(&format!(":SENS:FUNC \"{}\"", measured)).await?;
                self.write(&format!(":SENS:{}:NPLC {}", measured, config.nplc)).await?;
                self.write(&format!(":FORM:ELEM {}", measured)).await?;
            }
            ReadbackElement::Resistance => {
                self.write(":SENS:FUNC \"RES\"").await?;
                let mode = match config.resistance_mode {
                    ResistanceMode::Manual => ":SENS:RES:MODE MAN",
                    ResistanceMode::Auto => ":SENS:RES:MODE AUTO",
                };
                self.write(mode).await?;
                self.write(&format!(":SENS:RES:NPLC {}", config.nplc)).await?;
                self.write(":FORM:ELEM RES").await?;
            }
        }
        let sense = if config.four_wire { ":SYST:RSEN ON" } else { ":SYST:RSEN OFF" };
        self.write(sense).await?;

        info!(
            "Source '{}' configured: {} source, range {:?}, compliance {:?}, {} NPLC",
            self.resource(),
            config.function,
            config.range,
            config.compliance,
            config.nplc
        );
        self.config = Some(config);
        Ok(())
    }

    /// Program the output level. Does not wait for settling.
    pub async fn set_level(&mut self, value: f64) -> Result<(), DaqError> {
        let function = self.function().mnemonic();
        self.write(&format!(":SOUR:{}:LEV {}", function, value)).await?;
        self.level = Some(value);
        debug!("Source '{}' level set to {} {}", self.resource(), value, self.function().unit());
        Ok(())
    }

    /// Query the programmed level back from the instrument.
    ///
    /// A mismatch with the last `set_level` is logged, not treated as an error.
    /// In auto-ohms mode this is the current the instrument chose.
    pub async fn read_level(&mut self) -> Result<f64, DaqError> {
        let function = self.function().mnemonic();
        let actual = self.query_value(&format!(":SOUR:{}:LEV?", function)).await?;
        if let Some(expected) = self.level.filter(|_| !self.auto_ohms()) {
            let tolerance = LEVEL_READBACK_TOLERANCE * expected.abs().max(f64::MIN_POSITIVE);
            if (actual - expected).abs() > tolerance {
                warn!(
                    "Source '{}' reports level {} but {} was programmed",
                    self.resource(),
                    actual,
                    expected
                );
            }
        }
        Ok(actual)
    }

    /// Turn the output on. No-op when already on.
    pub async fn enable_output(&mut self) -> Result<(), DaqError> {
        if self.output_enabled {
            return Ok(());
        }
        self.write(":OUTP ON").await?;
        self.output_enabled = true;
        debug!("Source '{}' output on", self.resource());
        Ok(())
    }

    /// Turn the output off.
    ///
    /// Always sends the command regardless of the cached state, so it can be
    /// used for guaranteed shutdown.
    pub async fn disable_output(&mut self) -> Result<(), DaqError> {
        self.write(":OUTP OFF").await?;
        self.output_enabled = false;
        debug!("Source '{}' output off", self.resource());
        Ok(())
    }

    /// Trigger a reading on the source instrument itself.
    pub async fn read_self(&mut self) -> Result<f64, DaqError> {
        self.query_value(":READ?").await
    }

    pub async fn close(&mut self) -> Result<(), DaqError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockSession, SimulatedSample};

    fn controller() -> (SourceController, MockSession) {
        let sample = SimulatedSample::new(100.0);
        let mock = MockSession::source("GPIB0::24::INSTR", &sample);
        (
            SourceController::new(Box::new(mock.clone()), SourceLimits::default()),
            mock,
        )
    }

    fn current_config() -> InstrumentConfig {
        InstrumentConfig {
            range: Some(0.01),
            compliance: Some(21.0),
            ..InstrumentConfig::new("GPIB0::24::INSTR")
        }
    }

    #[tokio::test]
    async fn configure_sends_four_wire_setup() {
        let (mut source, mock) = controller();
        source.configure(current_config()).await.unwrap();

        let log = mock.call_log();
        assert_eq!(log[0], "write: *RST");
        assert!(log.contains(&"write: :SOUR:FUNC CURR".to_string()));
        assert!(log.contains(&"write: :SOUR:CURR:RANG 0.01".to_string()));
        assert!(log.contains(&"write: :SENS:VOLT:PROT 21".to_string()));
        assert!(log.contains(&"write: :SYST:RSEN ON".to_string()));
        assert!(log.contains(&"write: :FORM:ELEM VOLT".to_string()));
        assert_eq!(source.max_level(), 0.01);
    }

    #[tokio::test]
    async fn configure_rejects_range_beyond_hardware() {
        let (mut source, mock) = controller();
        let config = InstrumentConfig {
            range: Some(5.0),
            ..InstrumentConfig::new("GPIB0::24::INSTR")
        };
        let err = source.configure(config).await.unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
        assert!(mock.call_log().is_empty(), "no I/O before validation passes");
    }

    #[tokio::test]
    async fn configure_rejects_excess_compliance() {
        let (mut source, _mock) = controller();
        let config = InstrumentConfig {
            compliance: Some(500.0),
            ..InstrumentConfig::new("GPIB0::24::INSTR")
        };
        assert!(matches!(
            source.configure(config).await,
            Err(DaqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn enable_is_idempotent() {
        let (mut source, mock) = controller();
        source.enable_output().await.unwrap();
        source.enable_output().await.unwrap();
        assert_eq!(mock.count_calls(":OUTP ON"), 1);
        assert!(mock.output_enabled());
    }

    #[tokio::test]
    async fn disable_twice_is_safe() {
        let (mut source, mock) = controller();
        source.disable_output().await.unwrap();
        assert!(!source.output_enabled());
        source.disable_output().await.unwrap();
        assert!(!source.output_enabled());
        assert!(!mock.output_enabled());
        assert_eq!(mock.count_calls(":OUTP OFF"), 2);
    }

    #[tokio::test]
    async fn read_self_returns_sample_voltage() {
        let (mut source, _mock) = controller();
        source.configure(current_config()).await.unwrap();
        source.set_level(0.002).await.unwrap();
        source.enable_output().await.unwrap();
        let volts = source.read_self().await.unwrap();
        assert!((volts - 0.2).abs() < 1e-12);
        assert_eq!(source.read_level().await.unwrap(), 0.002);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_source_times_out_at_configured_bound() {
        let sample = SimulatedSample::new(100.0);
        let mock = MockSession::source("GPIB0::24::INSTR", &sample).with_latency(Duration::from_secs(60));
        let mut source = SourceController::new(Box::new(mock), SourceLimits::default());
        let config = InstrumentConfig {
            timeout: Duration::from_secs(1),
            ..current_config()
        };

        let started = tokio::time::Instant::now();
        let err = source.configure(config).await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { timeout, .. } if timeout == Duration::from_secs(1)));
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(2));

        let err = source.disable_output().await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
    }

    #[tokio::test]
    async fn auto_ohms_lets_the_instrument_pick_the_current() {
        let (mut source, mock) = controller();
        let config = InstrumentConfig {
            readback: ReadbackElement::Resistance,
            resistance_mode: ResistanceMode::Auto,
            ..current_config()
        };
        source.configure(config).await.unwrap();
        assert!(source.auto_ohms());
        assert!(mock.call_log().contains(&"write: :SENS:RES:MODE AUTO".to_string()));
        assert_eq!(mock.count_calls(":SENS:RES:MODE MAN"), 0);
    }

    #[tokio::test]
    async fn auto_ohms_without_resistance_readback_rejected() {
        let (mut source, mock) = controller();
        let config = InstrumentConfig {
            resistance_mode: ResistanceMode::Auto,
            ..current_config()
        };
        assert!(matches!(source.configure(config).await, Err(DaqError::Config(_))));
        assert!(mock.call_log().is_empty());
    }

    #[tokio::test]
    async fn failed_set_level_keeps_previous_level() {
        let (mut source, mock) = controller();
        source.set_level(0.001).await.unwrap();
        mock.inject_next_failure();
        assert!(source.set_level(0.002).await.is_err());
        assert_eq!(source.level(), Some(0.001));
    }
}
