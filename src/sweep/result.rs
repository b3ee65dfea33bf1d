//! Sweep output records.

use super::{SweepMode, SweepSpec};
use crate::error::ErrorKind;
use crate::instrument::SourceFunction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The -level leg of a current-reversal point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseLeg {
    pub source_level: f64,
    pub measured_value: f64,
    pub measured_std_dev: Option<f64>,
    pub resistance: f64,
}

/// One recorded point of a sweep. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    /// Position in the sweep, counting across cycles.
    pub index: usize,
    /// Position in the level list.
    pub level_index: usize,
    pub cycle: u32,
    /// Driven value in A (current sourcing) or V (voltage sourcing).
    pub source_level: f64,
    /// Mean of the repeated readings at `source_level`.
    pub measured_value: f64,
    pub measured_std_dev: Option<f64>,
    /// Number of readings averaged per leg.
    pub samples: u32,
    /// Ohms. With current reversal, the average of both legs.
    pub resistance: f64,
    pub resistance_std_dev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<ReverseLeg>,
    /// Auxiliary probe reading (e.g. temperature).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the sweep started.
    pub elapsed_secs: f64,
}

/// Describes a sweep before its first point is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMetadata {
    pub name: String,
    pub mode: SweepMode,
    pub source_function: SourceFunction,
    pub source_resource: String,
    pub sense_resource: Option<String>,
    /// Label and unit of the auxiliary column, when a probe is attached.
    pub auxiliary: Option<(String, String)>,
    pub spec: SweepSpec,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFault {
    /// Index of the point being taken, `None` if the sweep failed while configuring.
    pub step: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SweepStatus {
    Running,
    Done,
    Faulted(SweepFault),
}

/// Ordered points plus how the sweep ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub metadata: SweepMetadata,
    pub points: Vec<MeasurementPoint>,
    pub status: SweepStatus,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the output could not be confirmed off after the sweep.
    pub output_left_enabled: bool,
}

impl SweepResult {
    pub fn new(metadata: SweepMetadata) -> Self {
        Self {
            metadata,
            points: Vec::new(),
            status: SweepStatus::Running,
            finished_at: None,
            output_left_enabled: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == SweepStatus::Done
    }

    pub fn fault(&self) -> Option<&SweepFault> {
        match &self.status {
            SweepStatus::Faulted(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn resistances(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.resistance).collect()
    }

    /// Mean resistance over all finite points.
    pub fn mean_resistance(&self) -> Option<f64> {
        let finite: Vec<f64> = self
            .points
            .iter()
            .map(|p| p.resistance)
            .filter(|r| r.is_finite())
            .collect();
        if finite.is_empty() {
            None
        } else {
            Some(finite.iter().sum::<f64>() / finite.len() as f64)
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.metadata.started_at).num_milliseconds() as f64 / 1000.0)
    }
}
