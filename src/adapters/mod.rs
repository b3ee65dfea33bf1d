//! Bus transport for instrument sessions
//!
//! An [`InstrumentSession`] is one open connection to one bus-addressed device.
//! Controllers only hold a `Box<dyn InstrumentSession>`; how the bytes move
//! (VISA over GPIB, or the in-process mock) is decided by whoever opens it.

pub mod mock_adapter;
pub mod visa_adapter;

pub use mock_adapter::{MockSession, SimulatedSample};
pub use visa_adapter::VisaSession;

use crate::error::DaqError;
use async_trait::async_trait;

/// Command/query primitives of a single instrument.
#[async_trait]
pub trait InstrumentSession: Send {
    /// Address of the device, e.g. `GPIB0::24::INSTR`.
    fn resource(&self) -> &str;

    /// Send a command that produces no response.
    async fn write_command(&mut self, command: &str) -> Result<(), DaqError>;

    /// Send a query and return the trimmed response.
    async fn query(&mut self, command: &str) -> Result<String, DaqError>;

    /// Send a query and parse its response as a number.
    ///
    /// SCPI instruments may return several comma-separated elements; the first
    /// one is taken.
    async fn query_value(&mut self, command: &str) -> Result<f64, DaqError> {
        let response = self.query(command).await?;
        parse_numeric_response(self.resource(), command, &response)
    }

    /// Release the session. Closing an already closed session is a no-op.
    async fn close(&mut self) -> Result<(), DaqError>;
}

/// Keithley instruments report overflow or "no reading" as `+9.9E37`.
pub const OVERFLOW_SENTINEL: f64 = 9.9e37;

/// Parse the first field of a numeric SCPI response.
///
/// The overflow sentinel is a well-formed number but not a measurement, so it
/// fails with [`DaqError::Computation`].
pub fn parse_numeric_response(resource: &str, command: &str, response: &str) -> Result<f64, DaqError> {
    let field = response.split(',').next().unwrap_or("").trim();
    let value = field.parse::<f64>().map_err(|_| {
        DaqError::command(
            resource,
            format!("unparsable response to '{}': '{}'", command, response.trim()),
        )
    })?;
    if value.abs() >= OVERFLOW_SENTINEL {
        return Err(DaqError::Computation(format!(
            "'{}' reported overflow ({}) for '{}'",
            resource, field, command
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scientific_notation() {
        let value = parse_numeric_response("dev", ":READ?", "+1.234560E-03\n").unwrap();
        assert!((value - 1.23456e-3).abs() < 1e-12);
    }

    #[test]
    fn takes_first_element_of_list() {
        let value = parse_numeric_response("dev", ":READ?", "1.0E-1,2.0E-3,9.9E37").unwrap();
        assert_eq!(value, 0.1);
    }

    #[test]
    fn overflow_sentinel_is_not_a_reading() {
        let err = parse_numeric_response("dev", ":READ?", "+9.9E37").unwrap_err();
        assert!(matches!(err, DaqError::Computation(_)));
        assert!(!err.is_transient());
        assert!(parse_numeric_response("dev", ":READ?", "-9.91E37,0").is_err());
        assert_eq!(parse_numeric_response("dev", ":READ?", "9.8E36").unwrap(), 9.8e36);
    }

    #[test]
    fn rejects_garbage_as_command_error() {
        let err = parse_numeric_response("dev", ":READ?", "ERR -113").unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("ERR -113"));
    }
}
