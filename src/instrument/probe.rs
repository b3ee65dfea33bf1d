//! Auxiliary single-value meter, read once per sweep point.
//!
//! Usually the cryostat thermometer, so resistance can be plotted against
//! temperature.

use crate::adapters::InstrumentSession;
use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// VISA resource string (e.g., "GPIB0::12::INSTR")
    pub resource: String,
    /// Column label in the result log
    #[serde(default = "default_label")]
    pub label: String,
    /// Unit of the reading
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Query used to fetch one reading
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_label() -> String {
    "temperature".to_string()
}

fn default_unit() -> String {
    "K".to_string()
}

fn default_query() -> String {
    ":READ?".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl ProbeConfig {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            label: default_label(),
            unit: default_unit(),
            query: default_query(),
            timeout: default_timeout(),
        }
    }
}

pub struct ProbeController {
    session: Box<dyn InstrumentSession>,
    config: ProbeConfig,
}

impl ProbeController {
    pub fn new(session: Box<dyn InstrumentSession>, config: ProbeConfig) -> Self {
        Self { session, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub async fn read(&mut self) -> Result<f64, DaqError> {
        let timeout = self.config.timeout;
        let query = self.config.query.clone();
        let resource = self.session.resource().to_string();
        tokio::time::timeout(timeout, self.session.query_value(&query))
            .await
            .map_err(|_| DaqError::timeout(resource, query.clone(), timeout))?
    }

    pub async fn close(&mut self) -> Result<(), DaqError> {
        self.session.close().await
    }
}
