//! Simulated instrument sessions for testing and dry runs
//!
//! [`MockSession`] speaks the small SCPI subset the controllers use and answers
//! from a [`SimulatedSample`]: a resistor (with an optional thermoelectric
//! offset) that a source-role session biases and a voltmeter-role session
//! reads. It provides:
//! - Queued readings that take precedence over the simulation
//! - Controllable failure injection (command errors and timeouts)
//! - Simulated bus latency
//! - Call logging for test verification
//!
//! Clones share state, so a test keeps one handle while a controller owns the
//! other.

use super::InstrumentSession;
use crate::error::DaqError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Drive {
    Current,
    Voltage,
}

#[derive(Debug)]
struct SampleState {
    resistance_ohms: f64,
    thermal_offset_volts: f64,
    drive: Drive,
    level: f64,
    biased: bool,
}

/// A four-probe sample shared between simulated instruments.
#[derive(Debug, Clone)]
pub struct SimulatedSample {
    state: Arc<Mutex<SampleState>>,
}

impl SimulatedSample {
    pub fn new(resistance_ohms: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SampleState {
                resistance_ohms,
                thermal_offset_volts: 0.0,
                drive: Drive::Current,
                level: 0.0,
                biased: false,
            })),
        }
    }

    /// Add a constant thermoelectric voltage to every voltage reading.
    pub fn with_thermal_offset(self, volts: f64) -> Self {
        lock(&self.state).thermal_offset_volts = volts;
        self
    }

    pub fn resistance_ohms(&self) -> f64 {
        lock(&self.state).resistance_ohms
    }

    /// Whether a source is currently driving the sample.
    pub fn is_biased(&self) -> bool {
        lock(&self.state).biased
    }

    /// Voltage across the sense probes.
    pub fn voltage(&self) -> f64 {
        let s = lock(&self.state);
        let driven = match (s.biased, s.drive) {
            (false, _) => 0.0,
            (true, Drive::Current) => s.level * s.resistance_ohms,
            (true, Drive::Voltage) => s.level,
        };
        driven + s.thermal_offset_volts
    }

    /// Current through the sample.
    pub fn current(&self) -> f64 {
        let s = lock(&self.state);
        match (s.biased, s.drive) {
            (false, _) => 0.0,
            (true, Drive::Current) => s.level,
            (true, Drive::Voltage) => s.level / s.resistance_ohms,
        }
    }

    fn apply_bias(&self, drive: Drive, level: f64, biased: bool) {
        let mut s = lock(&self.state);
        s.drive = drive;
        s.level = level;
        s.biased = biased;
    }
}

#[derive(Debug, Clone)]
enum Role {
    /// Source/measure unit driving the sample.
    Source(SimulatedSample),
    /// Voltmeter on the sense probes.
    Voltmeter(SimulatedSample),
    /// Meter returning a fixed value (e.g. a thermometer).
    Meter(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FailureKind {
    Command,
    Timeout,
}

#[derive(Debug)]
struct FailureRule {
    pattern: String,
    remaining: Option<usize>,
    kind: FailureKind,
}

#[derive(Debug)]
struct MockState {
    role: Role,
    call_log: Vec<String>,
    queued_readings: VecDeque<f64>,
    failures: Vec<FailureRule>,
    fail_next: bool,
    latency: Duration,
    timeout: Duration,
    drive: Drive,
    element: String,
    level: f64,
    output_on: bool,
    closed: bool,
}

/// Scriptable simulated instrument.
#[derive(Debug, Clone)]
pub struct MockSession {
    resource: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn with_role(resource: impl Into<String>, role: Role) -> Self {
        Self {
            resource: resource.into(),
            state: Arc::new(Mutex::new(MockState {
                role,
                call_log: Vec::new(),
                queued_readings: VecDeque::new(),
                failures: Vec::new(),
                fail_next: false,
                latency: Duration::ZERO,
                timeout: Duration::from_secs(5),
                drive: Drive::Current,
                element: "VOLT".to_string(),
                level: 0.0,
                output_on: false,
                closed: false,
            })),
        }
    }

    /// Source/measure unit wired to `sample`.
    pub fn source(resource: impl Into<String>, sample: &SimulatedSample) -> Self {
        Self::with_role(resource, Role::Source(sample.clone()))
    }

    /// Nanovoltmeter wired to the sense probes of `sample`.
    pub fn voltmeter(resource: impl Into<String>, sample: &SimulatedSample) -> Self {
        Self::with_role(resource, Role::Voltmeter(sample.clone()))
    }

    /// Meter that always reads `value`.
    pub fn meter(resource: impl Into<String>, value: f64) -> Self {
        Self::with_role(resource, Role::Meter(value))
    }

    /// Simulated latency applied to every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// Readings returned by the next measurement queries, before falling back
    /// to the simulation.
    pub fn push_readings(&self, readings: impl IntoIterator<Item = f64>) {
        lock(&self.state).queued_readings.extend(readings);
    }

    /// Fail calls containing `pattern` with a command error, `times` times
    /// (`None` for every matching call).
    pub fn fail_matching(&self, pattern: impl Into<String>, times: Option<usize>) {
        self.add_rule(pattern.into(), times, FailureKind::Command);
    }

    /// Fail calls containing `pattern` with a timeout error.
    pub fn timeout_matching(&self, pattern: impl Into<String>, times: Option<usize>) {
        self.add_rule(pattern.into(), times, FailureKind::Timeout);
    }

    /// Inject a command error for the next call, whatever it is.
    pub fn inject_next_failure(&self) {
        lock(&self.state).fail_next = true;
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.state).call_log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.state).call_log.clear();
    }

    /// Number of logged calls containing `pattern`.
    pub fn count_calls(&self, pattern: &str) -> usize {
        lock(&self.state)
            .call_log
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn output_enabled(&self) -> bool {
        lock(&self.state).output_on
    }

    pub fn level(&self) -> f64 {
        lock(&self.state).level
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn add_rule(&self, pattern: String, remaining: Option<usize>, kind: FailureKind) {
        lock(&self.state).failures.push(FailureRule {
            pattern,
            remaining,
            kind,
        });
    }

    /// Log the call and evaluate injected failures.
    async fn begin_call(&self, entry: String, command: &str) -> Result<(), DaqError> {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        state.call_log.push(entry);

        if state.closed {
            return Err(DaqError::command(&self.resource, "session closed"));
        }
        if state.fail_next {
            state.fail_next = false;
            return Err(DaqError::command(&self.resource, "Injected failure"));
        }

        let timeout = state.timeout;
        let mut hit = None;
        for rule in state.failures.iter_mut() {
            if !command.contains(&rule.pattern) {
                continue;
            }
            match rule.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            hit = Some(rule.kind);
            break;
        }

        match hit {
            Some(FailureKind::Command) => Err(DaqError::command(
                &self.resource,
                format!("Injected failure for '{}'", command),
            )),
            Some(FailureKind::Timeout) => Err(DaqError::timeout(&self.resource, command, timeout)),
            None => Ok(()),
        }
    }

    fn apply_write(&self, command: &str) {
        let mut state = lock(&self.state);
        let upper = command.trim().to_ascii_uppercase();
        let argument = upper.rsplit(' ').next().unwrap_or("");

        if upper == "*RST" {
            state.level = 0.0;
            state.output_on = false;
            state.drive = Drive::Current;
            state.element = "VOLT".to_string();
        } else if upper.starts_with(":SOUR:FUNC") {
            state.drive = if argument.starts_with("VOLT") {
                Drive::Voltage
            } else {
                Drive::Current
            };
        } else if upper.starts_with(":SOUR:CURR:LEV ") || upper.starts_with(":SOUR:VOLT:LEV ") {
            if let Ok(level) = argument.parse::<f64>() {
                state.level = level;
            }
        } else if upper.starts_with(":OUTP ") {
            state.output_on = argument == "ON" || argument == "1";
        } else if upper.starts_with(":FORM:ELEM ") {
            state.element = argument.to_string();
        }

        if let Role::Source(sample) = &state.role {
            sample.apply_bias(state.drive, state.level, state.output_on);
        }
    }

    fn reading(&self) -> f64 {
        let mut state = lock(&self.state);
        if let Some(value) = state.queued_readings.pop_front() {
            return value;
        }
        match &state.role {
            Role::Source(sample) => match state.element.as_str() {
                "CURR" => sample.current(),
                "RES" => sample.resistance_ohms(),
                _ => sample.voltage(),
            },
            Role::Voltmeter(sample) => sample.voltage(),
            Role::Meter(value) => *value,
        }
    }

    fn answer(&self, command: &str) -> String {
        let upper = command.trim().to_ascii_uppercase();
        if upper == "*IDN?" {
            format!("MOCK,{},0,1.0", self.resource)
        } else if upper.ends_with(":LEV?") {
            format!("{:e}", lock(&self.state).level)
        } else if upper == ":OUTP?" {
            if lock(&self.state).output_on { "1" } else { "0" }.to_string()
        } else if upper.ends_with("READ?") || upper.ends_with("FETC?") || upper.ends_with("DATA?") {
            format!("{:e}", self.reading())
        } else {
            "0".to_string()
        }
    }
}

#[async_trait]
impl InstrumentSession for MockSession {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write_command(&mut self, command: &str) -> Result<(), DaqError> {
        self.begin_call(format!("write: {}", command), command).await?;
        self.apply_write(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, DaqError> {
        self.begin_call(format!("query: {}", command), command).await?;
        Ok(self.answer(command))
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_biases_the_shared_sample() {
        let sample = SimulatedSample::new(100.0);
        let mut smu = MockSession::source("GPIB0::24::INSTR", &sample);
        let mut nvm = MockSession::voltmeter("GPIB0::7::INSTR", &sample);

        smu.write_command(":SOUR:CURR:LEV 0.002").await.unwrap();
        assert_eq!(nvm.query_value(":READ?").await.unwrap(), 0.0);

        smu.write_command(":OUTP ON").await.unwrap();
        let volts = nvm.query_value(":READ?").await.unwrap();
        assert!((volts - 0.2).abs() < 1e-12);
        assert!(sample.is_biased());
    }

    #[tokio::test]
    async fn queued_readings_take_precedence() {
        let mut meter = MockSession::meter("GPIB0::12::INSTR", 4.2);
        meter.push_readings([1.0, 2.0]);
        assert_eq!(meter.query_value(":READ?").await.unwrap(), 1.0);
        assert_eq!(meter.query_value(":READ?").await.unwrap(), 2.0);
        assert_eq!(meter.query_value(":READ?").await.unwrap(), 4.2);
    }

    #[tokio::test]
    async fn level_query_echoes_programmed_level() {
        let sample = SimulatedSample::new(10.0);
        let mut smu = MockSession::source("smu", &sample);
        smu.write_command(":SOUR:CURR:LEV -0.001").await.unwrap();
        assert_eq!(smu.query_value(":SOUR:CURR:LEV?").await.unwrap(), -0.001);
    }

    #[tokio::test]
    async fn failure_rules_are_counted() {
        let mut meter = MockSession::meter("m", 1.0);
        meter.fail_matching("READ", Some(2));
        assert!(meter.query(":READ?").await.is_err());
        assert!(meter.query(":READ?").await.is_err());
        assert!(meter.query(":READ?").await.is_ok());
        assert_eq!(meter.count_calls("READ"), 3);
    }

    #[tokio::test]
    async fn timeout_rule_yields_timeout_error() {
        let mut meter = MockSession::meter("m", 1.0);
        meter.timeout_matching(":READ?", None);
        let err = meter.query(":READ?").await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
    }

    #[tokio::test]
    async fn injected_failure_is_consumed() {
        let mut meter = MockSession::meter("m", 1.0);
        meter.inject_next_failure();
        assert!(meter.write_command("*CLS").await.is_err());
        assert!(meter.write_command("*CLS").await.is_ok());
    }

    #[tokio::test]
    async fn closed_session_rejects_calls() {
        let mut meter = MockSession::meter("m", 1.0);
        let handle = meter.clone();
        meter.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(meter.query(":READ?").await.is_err());
    }

    #[tokio::test]
    async fn resistance_element_reads_sample_resistance() {
        let sample = SimulatedSample::new(42.0);
        let mut smu = MockSession::source("smu", &sample);
        smu.write_command(":FORM:ELEM RES").await.unwrap();
        assert_eq!(smu.query_value(":READ?").await.unwrap(), 42.0);
    }
}
