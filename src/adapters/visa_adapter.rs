//! VISA session for GPIB/USB/Ethernet instruments
//!
//! Implements [`InstrumentSession`] on top of the `visa-rs` crate. VISA calls
//! are blocking, so every transaction runs on Tokio's blocking pool while the
//! sweep task awaits it.
//!
//! Supports resource strings like:
//! - "GPIB0::24::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2450::04012345::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::InstrumentSession;
use crate::error::DaqError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex, PoisonError};
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// VISA-backed instrument session
pub struct VisaSession {
    /// VISA resource string (e.g., "GPIB0::24::INSTR")
    pub(crate) resource_string: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI)
    pub(crate) line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<visa_rs::Instrument>>>,
}

impl VisaSession {
    /// Create an unopened session with default settings
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    /// Open the VISA resource.
    #[cfg(feature = "instrument_visa")]
    pub async fn open(mut self) -> Result<Self, DaqError> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let resource = self.resource_string.clone();
        let timeout = self.timeout;

        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
            let c_resource = CString::new(resource.clone()).context("Invalid resource string")?;
            let instr = rm
                .open(&c_resource.into(), AccessMode::NO_LOCK, timeout)
                .with_context(|| format!("Failed to open VISA resource: {}", resource))?;
            Ok::<_, anyhow::Error>(instr)
        })
        .await
        .map_err(|e| DaqError::command(&self.resource_string, format!("VISA open task panicked: {}", e)))?
        .map_err(|e| DaqError::command(&self.resource_string, format!("{:#}", e)))?;

        self.instrument = Some(Arc::new(Mutex::new(instrument)));
        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            self.resource_string,
            self.timeout.as_millis()
        );
        Ok(self)
    }

    #[cfg(not(feature = "instrument_visa"))]
    pub async fn open(self) -> Result<Self, DaqError> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    /// Execute one blocking transaction on the VISA thread pool, with the VISA
    /// I/O timeout set to the session timeout.
    #[cfg(feature = "instrument_visa")]
    async fn transact(&self, command: &str, expect_reply: bool) -> Result<String, DaqError> {
        use std::io::{BufRead, BufReader, Write};

        let instrument = self
            .instrument
            .as_ref()
            .ok_or_else(|| DaqError::command(&self.resource_string, "VISA session not open"))?
            .clone();

        let framed = format!("{}{}", command, self.line_terminator);
        let resource = self.resource_string.clone();
        let command_owned = command.to_string();
        let timeout = self.timeout;
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        let outcome = tokio::task::spawn_blocking(move || {
            let mut instr = instrument.lock().unwrap_or_else(PoisonError::into_inner);
            // Bound every blocking read/write by the session timeout.
            instr
                .set_timeout(timeout_ms)
                .map_err(|e| std::io::Error::other(format!("Failed to set VISA timeout: {}", e)))?;
            (&*instr).write_all(framed.as_bytes())?;
            if !expect_reply {
                return Ok(String::new());
            }
            let mut response = String::new();
            BufReader::new(&*instr).read_line(&mut response)?;
            Ok::<_, std::io::Error>(response.trim().to_string())
        })
        .await
        .map_err(|e| DaqError::command(&resource, format!("VISA I/O task panicked: {}", e)))?;

        match outcome {
            Ok(response) => {
                if expect_reply {
                    debug!("VISA query '{}' -> '{}'", command_owned, response);
                } else {
                    debug!("VISA command sent: {}", command_owned);
                }
                Ok(response)
            }
            Err(e) if is_visa_timeout(&e) => Err(DaqError::timeout(resource, command_owned, timeout)),
            Err(e) => Err(DaqError::command(
                resource,
                format!("VISA transaction failed for '{}': {}", command_owned, e),
            )),
        }
    }

    pub fn info(&self) -> String {
        format!(
            "VisaSession({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[cfg(feature = "instrument_visa")]
fn is_visa_timeout(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::TimedOut || err.to_string().contains("TMO")
}

#[async_trait]
impl InstrumentSession for VisaSession {
    fn resource(&self) -> &str {
        &self.resource_string
    }

    #[cfg(feature = "instrument_visa")]
    async fn write_command(&mut self, command: &str) -> Result<(), DaqError> {
        self.transact(command, false).await.map(|_| ())
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn write_command(&mut self, _command: &str) -> Result<(), DaqError> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn query(&mut self, command: &str) -> Result<String, DaqError> {
        self.transact(command, true).await
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn query(&mut self, _command: &str) -> Result<String, DaqError> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }
}
