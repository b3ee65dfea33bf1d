//! Result logging.
//!
//! The sweep engine hands every point to a [`ResultLogger`] as soon as it is
//! recorded, so a crash mid-sweep still leaves the points taken so far on disk.
//! A logger failure faults the sweep with [`ErrorKind::Storage`](crate::error::ErrorKind).

pub mod storage;

pub use storage::CsvResultLogger;

use crate::error::DaqError;
use crate::sweep::{MeasurementPoint, SweepMetadata, SweepResult};
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait ResultLogger: Send {
    /// Called once before the first point.
    async fn begin(&mut self, _metadata: &SweepMetadata) -> Result<(), DaqError> {
        Ok(())
    }

    /// Persist one point.
    async fn record(&mut self, point: &MeasurementPoint) -> Result<(), DaqError>;

    /// Called once with the final result, after the output is disabled.
    async fn finish(&mut self, _result: &SweepResult) -> Result<(), DaqError> {
        Ok(())
    }
}

/// Keeps everything in memory. Mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    pub metadata: Option<SweepMetadata>,
    pub points: Vec<MeasurementPoint>,
    pub summary: Option<SweepResult>,
    fail_after: Option<usize>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `n` points, then fail every later `record`.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ResultLogger for MemoryLogger {
    async fn begin(&mut self, metadata: &SweepMetadata) -> Result<(), DaqError> {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    async fn record(&mut self, point: &MeasurementPoint) -> Result<(), DaqError> {
        if self.fail_after.is_some_and(|n| self.points.len() >= n) {
            return Err(DaqError::Storage(format!(
                "memory logger refused point {}",
                point.index
            )));
        }
        self.points.push(point.clone());
        Ok(())
    }

    async fn finish(&mut self, result: &SweepResult) -> Result<(), DaqError> {
        self.summary = Some(result.clone());
        Ok(())
    }
}

/// Prints each point through `tracing`.
#[derive(Debug, Default)]
pub struct ConsoleLogger;

#[async_trait]
impl ResultLogger for ConsoleLogger {
    async fn begin(&mut self, metadata: &SweepMetadata) -> Result<(), DaqError> {
        info!(
            "Sweep '{}' ({} mode, {} sourcing): {} levels x {} cycles",
            metadata.name,
            metadata.mode,
            metadata.source_function,
            metadata.spec.levels.len(),
            metadata.spec.repeat_cycles
        );
        Ok(())
    }

    async fn record(&mut self, point: &MeasurementPoint) -> Result<(), DaqError> {
        match point.resistance_std_dev {
            Some(sd) => info!(
                "#{:<4} level {:>12.6e}  R = {:.6e} +/- {:.2e} ohm",
                point.index, point.source_level, point.resistance, sd
            ),
            None => info!(
                "#{:<4} level {:>12.6e}  R = {:.6e} ohm",
                point.index, point.source_level, point.resistance
            ),
        }
        Ok(())
    }

    async fn finish(&mut self, result: &SweepResult) -> Result<(), DaqError> {
        match (result.fault(), result.mean_resistance()) {
            (Some(fault), _) => info!(
                "Sweep '{}' faulted after {} points: {}",
                result.metadata.name,
                result.points.len(),
                fault.message
            ),
            (None, Some(mean)) => info!(
                "Sweep '{}' done: {} points, mean R = {:.6e} ohm",
                result.metadata.name,
                result.points.len(),
                mean
            ),
            (None, None) => info!("Sweep '{}' done with no finite points", result.metadata.name),
        }
        Ok(())
    }
}

/// Fans every call out to several loggers, stopping at the first failure.
#[derive(Default)]
pub struct LoggerSet {
    loggers: Vec<Box<dyn ResultLogger>>,
}

impl LoggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, logger: impl ResultLogger + 'static) -> Self {
        self.loggers.push(Box::new(logger));
        self
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

#[async_trait]
impl ResultLogger for LoggerSet {
    async fn begin(&mut self, metadata: &SweepMetadata) -> Result<(), DaqError> {
        for logger in self.loggers.iter_mut() {
            logger.begin(metadata).await?;
        }
        Ok(())
    }

    async fn record(&mut self, point: &MeasurementPoint) -> Result<(), DaqError> {
        for logger in self.loggers.iter_mut() {
            logger.record(point).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, result: &SweepResult) -> Result<(), DaqError> {
        for logger in self.loggers.iter_mut() {
            logger.finish(result).await?;
        }
        Ok(())
    }
}
