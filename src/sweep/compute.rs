//! Reading statistics and the resistance computation.

use crate::error::DaqError;
use crate::instrument::{ReadbackElement, SourceFunction};

/// Mean and spread of the repeated readings taken at one source level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingStats {
    pub mean: f64,
    /// Sample standard deviation (n - 1); `None` for a single reading.
    pub std_dev: Option<f64>,
    pub count: usize,
}

impl ReadingStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let std_dev = if samples.len() > 1 {
            let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
            Some(var.sqrt())
        } else {
            None
        };
        Some(Self {
            mean,
            std_dev,
            count: samples.len(),
        })
    }
}

/// Resistance derived from one leg of a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointResistance {
    pub ohms: f64,
    pub std_dev: Option<f64>,
}

impl PointResistance {
    /// Compute R from the driven level and the averaged response.
    ///
    /// - current sourcing: `R = V / I`
    /// - voltage sourcing: `G = I / V`, `R = 1 / G` (infinite for an open circuit)
    /// - resistance read-back: the instrument already reports ohms
    pub fn compute(
        function: SourceFunction,
        readback: ReadbackElement,
        driven: f64,
        stats: &ReadingStats,
    ) -> Result<Self, DaqError> {
        if driven.abs() < super::MIN_DRIVEN_LEVEL {
            return Err(DaqError::Computation(format!(
                "driven {} {} is too small to divide by",
                driven,
                function.unit()
            )));
        }

        let resistance = match (readback, function) {
            (ReadbackElement::Resistance, _) => Self {
                ohms: stats.mean,
                std_dev: stats.std_dev,
            },
            (ReadbackElement::Measured, SourceFunction::Current) => Self {
                ohms: stats.mean / driven,
                std_dev: stats.std_dev.map(|s| s / driven.abs()),
            },
            (ReadbackElement::Measured, SourceFunction::Voltage) => {
                let conductance = stats.mean / driven;
                if conductance == 0.0 {
                    Self {
                        ohms: f64::INFINITY,
                        std_dev: None,
                    }
                } else {
                    Self {
                        ohms: 1.0 / conductance,
                        std_dev: stats
                            .std_dev
                            .map(|s| (s / driven.abs()) / (conductance * conductance)),
                    }
                }
            }
        };

        if resistance.ohms.is_nan() {
            return Err(DaqError::Computation(format!(
                "resistance is not a number for driven level {}",
                driven
            )));
        }
        Ok(resistance)
    }

    /// Combine the +level and -level legs of a current-reversal point.
    pub fn reversal_average(forward: Self, reverse: Self) -> Self {
        let std_dev = match (forward.std_dev, reverse.std_dev) {
            (Some(a), Some(b)) => Some((a * a + b * b).sqrt() / 2.0),
            _ => None,
        };
        Self {
            ohms: (forward.ohms + reverse.ohms) / 2.0,
            std_dev,
        }
    }
}
