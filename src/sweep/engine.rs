//! Sweep orchestration.
//!
//! The engine owns the instrument controllers for the duration of a sweep and
//! drives them strictly in sequence: one outstanding bus transaction at a time,
//! no concurrent sweeps on one engine.
//!
//! Per point:
//!
//! 1. program the level and enable the output (retried)
//! 2. wait the settling delay (always, even when it is zero)
//! 3. take `repeats_per_point` readings (each retried)
//! 4. with current reversal, repeat 1-3 at the negated level
//! 5. read the auxiliary probe, if any
//! 6. compute R and hand the point to the logger
//!
//! With a cycle interval, each cycle after the first starts one interval after
//! the previous one did.
//!
//! Whatever happens, the sweep ends in `Finalizing`, which disables the source
//! output before the result is returned.

use super::compute::{PointResistance, ReadingStats};
use super::result::{MeasurementPoint, ReverseLeg, SweepFault, SweepMetadata, SweepResult, SweepStatus};
use super::{SweepLevel, SweepMode, SweepSpec, SweepState};
use crate::clock::{Clock, SystemClock};
use crate::data::ResultLogger;
use crate::error::{DaqError, ErrorKind};
use crate::error_recovery::{retry_transient, RetryPolicy};
use crate::instrument::{
    InstrumentConfig, ProbeController, ReadbackElement, SenseController, SourceController,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where the sample response comes from.
pub enum SenseStrategy {
    /// Standard mode: the source instrument reads back the response itself.
    SourceReadback,
    /// High-precision mode: a separate nanovoltmeter senses the voltage.
    Nanovoltmeter {
        controller: SenseController,
        config: InstrumentConfig,
    },
}

impl SenseStrategy {
    pub fn nanovoltmeter(controller: SenseController, config: InstrumentConfig) -> Self {
        SenseStrategy::Nanovoltmeter { controller, config }
    }

    pub fn mode(&self) -> SweepMode {
        match self {
            SenseStrategy::SourceReadback => SweepMode::Standard,
            SenseStrategy::Nanovoltmeter { .. } => SweepMode::HighPrecision,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        match self {
            SenseStrategy::SourceReadback => None,
            SenseStrategy::Nanovoltmeter { controller, .. } => Some(controller.resource()),
        }
    }
}

/// The controllers taking part in a sweep.
pub struct Instruments {
    pub source: SourceController,
    pub sense: SenseStrategy,
    pub probe: Option<ProbeController>,
}

impl Instruments {
    pub fn new(source: SourceController, sense: SenseStrategy) -> Self {
        Self {
            source,
            sense,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: ProbeController) -> Self {
        self.probe = Some(probe);
        self
    }

    async fn read_sample(&mut self) -> Result<f64, DaqError> {
        match &mut self.sense {
            SenseStrategy::SourceReadback => self.source.read_self().await,
            SenseStrategy::Nanovoltmeter { controller, .. } => controller.trigger_and_read().await,
        }
    }

    /// Close every session, reporting the first failure.
    pub async fn close(&mut self) -> Result<(), DaqError> {
        let mut first_error = None;
        let mut note = |res: Result<(), DaqError>| {
            if let Err(err) = res {
                warn!("Failed to close instrument session: {}", err);
                first_error.get_or_insert(err);
            }
        };
        note(self.source.close().await);
        if let SenseStrategy::Nanovoltmeter { controller, .. } = &mut self.sense {
            note(controller.close().await);
        }
        if let Some(probe) = self.probe.as_mut() {
            note(probe.close().await);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A failure inside the sweep body, tagged with the point being taken.
struct StepFailure {
    step: Option<usize>,
    error: DaqError,
}

pub struct SweepEngine {
    name: String,
    instruments: Instruments,
    source_config: InstrumentConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: SweepState,
}

impl SweepEngine {
    pub fn new(instruments: Instruments, source_config: InstrumentConfig) -> Self {
        Self {
            name: "sweep".to_string(),
            instruments,
            source_config,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            state: SweepState::Idle,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    /// Replace the source settings used from the next sweep on.
    pub fn reconfigure_source(&mut self, config: InstrumentConfig) -> Result<(), DaqError> {
        self.instruments.source.validate(&config)?;
        self.source_config = config;
        Ok(())
    }

    /// Replace the nanovoltmeter settings used from the next sweep on.
    pub fn reconfigure_sense(&mut self, new_config: InstrumentConfig) -> Result<(), DaqError> {
        SenseController::validate(&new_config)?;
        match &mut self.instruments.sense {
            SenseStrategy::Nanovoltmeter { config, .. } => {
                *config = new_config;
                Ok(())
            }
            SenseStrategy::SourceReadback => Err(DaqError::Config(
                "no nanovoltmeter attached; standard mode reads back from the source".into(),
            )),
        }
    }

    fn transition(&mut self, next: SweepState) {
        debug!("Sweep '{}': {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
    }

    /// Merge the sweep settings into the instrument configs and validate
    /// everything. No I/O happens here.
    fn plan(
        &self,
        spec: &SweepSpec,
    ) -> Result<(InstrumentConfig, Option<InstrumentConfig>), DaqError> {
        let sense_mode = self.instruments.sense.mode();
        if spec.mode != sense_mode {
            return Err(DaqError::Config(format!(
                "sweep requests {} mode but the bench is wired for {} mode",
                spec.mode, sense_mode
            )));
        }

        let mut source = self.source_config.clone();
        source.function = spec.source_function;
        source.compliance = Some(spec.compliance_limit);
        self.instruments.source.validate(&source)?;
        if source.auto_ohms() && spec.current_reversal {
            return Err(DaqError::Config(
                "current reversal needs a programmed current; disable auto-ohms".into(),
            ));
        }

        let sense = match &self.instruments.sense {
            SenseStrategy::Nanovoltmeter { config, .. } => {
                let mut config = config.clone();
                if let Some(nplc) = spec.integration_time {
                    config.nplc = nplc;
                }
                SenseController::validate(&config)?;
                Some(config)
            }
            SenseStrategy::SourceReadback => {
                if spec.integration_time.is_some() {
                    warn!("integration_time only applies in high-precision mode; ignored");
                }
                None
            }
        };

        let hardware = self.instruments.source.limits().max_for(spec.source_function);
        let max_level = source.range.map_or(hardware, |range| range.min(hardware));
        spec.validate(max_level)?;

        Ok((source, sense))
    }

    /// Run one sweep to completion.
    ///
    /// Invalid settings return `Err(DaqError::Config)` before any command is
    /// sent. Every other failure ends the sweep as
    /// [`SweepStatus::Faulted`] with the points taken so far; the output is
    /// disabled in both the success and the fault path.
    pub async fn run(
        &mut self,
        spec: &SweepSpec,
        logger: &mut dyn ResultLogger,
    ) -> Result<SweepResult, DaqError> {
        self.transition(SweepState::Idle);
        let (source_config, sense_config) = self.plan(spec)?;
        let readback = match self.instruments.sense {
            SenseStrategy::SourceReadback => source_config.readback,
            SenseStrategy::Nanovoltmeter { .. } => ReadbackElement::Measured,
        };

        let metadata = SweepMetadata {
            name: self.name.clone(),
            mode: spec.mode,
            source_function: spec.source_function,
            source_resource: self.instruments.source.resource().to_string(),
            sense_resource: self.instruments.sense.resource().map(str::to_string),
            auxiliary: self
                .instruments
                .probe
                .as_ref()
                .map(|p| (p.config().label.clone(), p.config().unit.clone())),
            spec: spec.clone(),
            started_at: self.clock.now(),
        };
        logger.begin(&metadata).await?;
        info!(
            "Sweep '{}' starting: {} points in {} mode",
            self.name,
            spec.point_count(),
            spec.mode
        );
        let mut result = SweepResult::new(metadata);

        self.transition(SweepState::Configuring);
        let outcome = match self.configure(source_config, sense_config).await {
            Ok(()) => self.run_steps(spec, readback, &mut result, logger).await,
            Err(error) => Err(StepFailure { step: None, error }),
        };

        self.transition(SweepState::Finalizing);
        result.output_left_enabled = !self.disable_output().await;
        result.finished_at = Some(self.clock.now());
        result.status = match outcome {
            Ok(()) => SweepStatus::Done,
            Err(failure) => {
                error!(
                    "Sweep '{}' faulted at step {:?} after {} points: {}",
                    self.name,
                    failure.step,
                    result.points.len(),
                    failure.error
                );
                SweepStatus::Faulted(SweepFault {
                    step: failure.step,
                    kind: failure.error.kind(),
                    message: failure.error.to_string(),
                })
            }
        };

        if let Err(err) = logger.finish(&result).await {
            error!("Result logger failed to write the summary: {}", err);
            if result.is_done() {
                result.status = SweepStatus::Faulted(SweepFault {
                    step: None,
                    kind: ErrorKind::Storage,
                    message: err.to_string(),
                });
            }
        }

        if result.is_done() {
            info!(
                "Sweep '{}' done: {} points",
                self.name,
                result.points.len()
            );
            self.transition(SweepState::Done);
        } else {
            self.transition(SweepState::Faulted);
        }
        Ok(result)
    }

    async fn configure(
        &mut self,
        source_config: InstrumentConfig,
        sense_config: Option<InstrumentConfig>,
    ) -> Result<(), DaqError> {
        retry_transient(
            &self.retry,
            self.clock.as_ref(),
            "configure source",
            &mut self.instruments.source,
            |source| Box::pin(source.configure(source_config.clone())),
        )
        .await?;

        if let (SenseStrategy::Nanovoltmeter { controller, .. }, Some(config)) =
            (&mut self.instruments.sense, sense_config)
        {
            retry_transient(
                &self.retry,
                self.clock.as_ref(),
                "configure sense",
                controller,
                |sense| Box::pin(sense.configure(config.clone())),
            )
            .await?;
        }
        Ok(())
    }

    async fn run_steps(
        &mut self,
        spec: &SweepSpec,
        readback: ReadbackElement,
        result: &mut SweepResult,
        logger: &mut dyn ResultLogger,
    ) -> Result<(), StepFailure> {
        let started_at = result.metadata.started_at;
        let interval = spec
            .cycle_interval()
            .map_err(|error| StepFailure { step: None, error })?;
        let mut index = 0;
        for cycle in 0..spec.repeat_cycles {
            let cycle_start = self.clock.now();
            for (level_index, level) in spec.levels.iter().enumerate() {
                let point = self
                    .take_point(spec, readback, (index, level_index, cycle), level, started_at)
                    .await
                    .map_err(|error| StepFailure {
                        step: Some(index),
                        error,
                    })?;

                self.transition(SweepState::StepRecording { step: index });
                result.points.push(point);
                if let Some(recorded) = result.points.last() {
                    logger.record(recorded).await.map_err(|error| StepFailure {
                        step: Some(index),
                        error: match error {
                            DaqError::Storage(_) => error,
                            other => DaqError::Storage(other.to_string()),
                        },
                    })?;
                }
                index += 1;
            }

            if let Some(period) = interval.filter(|_| cycle + 1 < spec.repeat_cycles) {
                self.wait_for_next_cycle(cycle, cycle_start, period).await;
            }
        }
        Ok(())
    }

    /// Sleep until `period` has passed since `cycle_start`.
    async fn wait_for_next_cycle(&self, cycle: u32, cycle_start: DateTime<Utc>, period: Duration) {
        let spent = (self.clock.now() - cycle_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        match period.checked_sub(spent) {
            Some(remaining) if remaining.is_zero() => {}
            Some(remaining) => {
                debug!("Cycle {} done; next cycle in {:?}", cycle, remaining);
                self.clock.sleep(remaining).await;
            }
            None => warn!(
                "Cycle {} took {:?}, longer than the {:?} cycle interval; starting the next one now",
                cycle, spent, period
            ),
        }
    }

    /// Measure one level. `position` is (index, level_index, cycle).
    async fn take_point(
        &mut self,
        spec: &SweepSpec,
        readback: ReadbackElement,
        position: (usize, usize, u32),
        level: &SweepLevel,
        started_at: DateTime<Utc>,
    ) -> Result<MeasurementPoint, DaqError> {
        let (step, level_index, cycle) = position;
        let delay = spec.delay_for(level)?;
        let function = spec.source_function;

        let forward = self.measure_leg(spec, step, level.value, delay).await?;
        let forward_r = PointResistance::compute(function, readback, level.value, &forward)?;

        // In auto-ohms mode the instrument picks the test current itself.
        let source_level = if self.instruments.source.auto_ohms() {
            retry_transient(
                &self.retry,
                self.clock.as_ref(),
                "read source level",
                &mut self.instruments.source,
                |source| Box::pin(source.read_level()),
            )
            .await?
        } else {
            level.value
        };

        let (resistance, reverse) = if spec.current_reversal {
            let reversed = -level.value;
            let stats = self.measure_leg(spec, step, reversed, delay).await?;
            let reverse_r = PointResistance::compute(function, readback, reversed, &stats)?;
            (
                PointResistance::reversal_average(forward_r, reverse_r),
                Some(ReverseLeg {
                    source_level: reversed,
                    measured_value: stats.mean,
                    measured_std_dev: stats.std_dev,
                    resistance: reverse_r.ohms,
                }),
            )
        } else {
            (forward_r, None)
        };

        let auxiliary = match self.instruments.probe.as_mut() {
            Some(probe) => {
                let value = retry_transient(
                    &self.retry,
                    self.clock.as_ref(),
                    "read probe",
                    probe,
                    |p| Box::pin(p.read()),
                )
                .await?;
                if !value.is_finite() {
                    return Err(DaqError::Computation(format!(
                        "probe returned non-finite value {}",
                        value
                    )));
                }
                Some(value)
            }
            None => None,
        };

        let timestamp = self.clock.now();
        let elapsed = (timestamp - started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();

        Ok(MeasurementPoint {
            index: step,
            level_index,
            cycle,
            source_level,
            measured_value: forward.mean,
            measured_std_dev: forward.std_dev,
            samples: spec.repeats_per_point,
            resistance: resistance.ohms,
            resistance_std_dev: resistance.std_dev,
            reverse,
            auxiliary,
            timestamp,
            elapsed_secs: elapsed,
        })
    }

    /// Source one level, settle, and average the readings.
    async fn measure_leg(
        &mut self,
        spec: &SweepSpec,
        step: usize,
        value: f64,
        delay: Duration,
    ) -> Result<ReadingStats, DaqError> {
        self.transition(SweepState::StepSourcing { step });
        let verify = spec.verify_level;
        retry_transient(
            &self.retry,
            self.clock.as_ref(),
            "set source level",
            &mut self.instruments.source,
            |source| {
                Box::pin(async move {
                    source.set_level(value).await?;
                    if verify {
                        source.read_level().await?;
                    }
                    source.enable_output().await
                })
            },
        )
        .await?;

        self.transition(SweepState::StepSettling { step });
        self.clock.sleep(delay).await;

        self.transition(SweepState::StepMeasuring { step });
        let mut readings = Vec::with_capacity(spec.repeats_per_point as usize);
        for _ in 0..spec.repeats_per_point {
            let reading = retry_transient(
                &self.retry,
                self.clock.as_ref(),
                "read sample",
                &mut self.instruments,
                |instruments| Box::pin(instruments.read_sample()),
            )
            .await?;
            if !reading.is_finite() {
                return Err(DaqError::Computation(format!(
                    "non-finite reading {} at level {}",
                    reading, value
                )));
            }
            readings.push(reading);
        }

        ReadingStats::from_samples(&readings)
            .ok_or_else(|| DaqError::Computation(format!("no readings at level {}", value)))
    }

    /// Disable the output under the retry policy. Returns whether it is
    /// confirmed off.
    async fn disable_output(&mut self) -> bool {
        match retry_transient(
            &self.retry,
            self.clock.as_ref(),
            "disable output",
            &mut self.instruments.source,
            |source| Box::pin(source.disable_output()),
        )
        .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "Could not disable output on '{}': {}. The sample may still be biased.",
                    self.instruments.source.resource(),
                    err
                );
                false
            }
        }
    }

    /// Turn the output off and close every session.
    pub async fn shutdown(&mut self) -> Result<(), DaqError> {
        if !self.disable_output().await {
            warn!("Closing sessions with the output possibly still on");
        }
        self.instruments.close().await
    }
}
