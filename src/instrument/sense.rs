//! Nanovoltmeter driver (Keithley 2182 command set)
//!
//! Senses the voltage across the inner probes in high-precision mode. The
//! controller knows nothing about the source: the sweep engine only calls
//! [`SenseController::trigger_and_read`] after the level is set and the settling
//! delay has elapsed.
//!
//! Longer integration (`nplc`) lowers noise and raises latency; the trade-off is
//! left to configuration.

use super::{InstrumentConfig, TriggerMode};
use crate::adapters::InstrumentSession;
use crate::error::DaqError;
use std::time::Duration;
use tracing::{debug, info};

pub struct SenseController {
    session: Box<dyn InstrumentSession>,
    config: Option<InstrumentConfig>,
}

impl SenseController {
    pub fn new(session: Box<dyn InstrumentSession>) -> Self {
        Self {
            session,
            config: None,
        }
    }

    pub fn resource(&self) -> &str {
        self.session.resource()
    }

    pub fn config(&self) -> Option<&InstrumentConfig> {
        self.config.as_ref()
    }

    fn read_timeout(&self) -> Duration {
        self.config
            .as_ref()
            .map(|c| c.timeout)
            .unwrap_or(Duration::from_secs(5))
    }

    pub(crate) fn validate(config: &InstrumentConfig) -> Result<(), DaqError> {
        config.validate_common()?;
        if !(1..=2).contains(&config.channel) {
            return Err(DaqError::Config(format!(
                "sense channel {} invalid, must be 1 or 2",
                config.channel
            )));
        }
        Ok(())
    }

    pub async fn configure(&mut self, config: InstrumentConfig) -> Result<(), DaqError> {
        Self::validate(&config)?;

        let channel = config.channel;
        self.session.write_command("*RST").await?;
        self.session.write_command(":STAT:PRES").await?;
        self.session.write_command("*CLS").await?;
        self.session.write_command(":SENS:FUNC 'VOLT'").await?;
        self.session
            .write_command(&format!(":SENS:CHAN {}", channel))
            .await?;
        match config.range {
            Some(range) => {
                self.session
                    .write_command(&format!(":SENS:VOLT:CHAN{}:RANG {}", channel, range))
                    .await?
            }
            None => {
                self.session
                    .write_command(&format!(":SENS:VOLT:CHAN{}:RANG:AUTO ON", channel))
                    .await?
            }
        }
        self.session
            .write_command(&format!(":SENS:VOLT:NPLC {}", config.nplc))
            .await?;
        match config.trigger {
            TriggerMode::Immediate => self.session.write_command(":TRIG:SOUR IMM").await?,
            TriggerMode::Bus => self.session.write_command(":TRIG:SOUR BUS").await?,
        }

        info!(
            "Sense '{}' configured: channel {}, range {:?}, {} NPLC, {:?} trigger",
            self.resource(),
            channel,
            config.range,
            config.nplc,
            config.trigger
        );
        self.config = Some(config);
        Ok(())
    }

    /// Arm the instrument and return one voltage reading.
    ///
    /// Fails with [`DaqError::Timeout`] if the whole transaction takes longer
    /// than the configured timeout.
    pub async fn trigger_and_read(&mut self) -> Result<f64, DaqError> {
        let timeout = self.read_timeout();
        let trigger = self.config.as_ref().map(|c| c.trigger).unwrap_or_default();
        let resource = self.resource().to_string();

        let transaction = async {
            match trigger {
                TriggerMode::Immediate => self.session.query_value(":READ?").await,
                TriggerMode::Bus => {
                    self.session.write_command(":INIT").await?;
                    self.session.write_command("*TRG").await?;
                    self.session.query_value(":FETC?").await
                }
            }
        };

        let volts = tokio::time::timeout(timeout, transaction)
            .await
            .map_err(|_| DaqError::timeout(resource, "trigger and read", timeout))??;
        debug!("Sense '{}' read {} V", self.resource(), volts);
        Ok(volts)
    }

    pub async fn close(&mut self) -> Result<(), DaqError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockSession, SimulatedSample};

    fn nvm_config() -> InstrumentConfig {
        InstrumentConfig {
            range: Some(0.1),
            nplc: 5.0,
            timeout: Duration::from_secs(1),
            ..InstrumentConfig::new("GPIB0::7::INSTR")
        }
    }

    #[tokio::test]
    async fn configure_programs_channel_range_and_nplc() {
        let sample = SimulatedSample::new(1.0);
        let mock = MockSession::voltmeter("GPIB0::7::INSTR", &sample);
        let mut sense = SenseController::new(Box::new(mock.clone()));
        sense.configure(nvm_config()).await.unwrap();

        let log = mock.call_log();
        assert!(log.contains(&"write: :SENS:CHAN 1".to_string()));
        assert!(log.contains(&"write: :SENS:VOLT:CHAN1:RANG 0.1".to_string()));
        assert!(log.contains(&"write: :SENS:VOLT:NPLC 5".to_string()));
        assert!(log.contains(&"write: :TRIG:SOUR IMM".to_string()));
    }

    #[tokio::test]
    async fn invalid_channel_rejected() {
        let mock = MockSession::meter("GPIB0::7::INSTR", 0.0);
        let mut sense = SenseController::new(Box::new(mock));
        let config = InstrumentConfig {
            channel: 3,
            ..nvm_config()
        };
        assert!(matches!(
            sense.configure(config).await,
            Err(DaqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn bus_trigger_arms_fires_and_fetches() {
        let mock = MockSession::meter("GPIB0::7::INSTR", 1.5e-3);
        let mut sense = SenseController::new(Box::new(mock.clone()));
        let config = InstrumentConfig {
            trigger: TriggerMode::Bus,
            ..nvm_config()
        };
        sense.configure(config).await.unwrap();
        mock.clear_log();

        let volts = sense.trigger_and_read().await.unwrap();
        assert_eq!(volts, 1.5e-3);
        assert_eq!(
            mock.call_log(),
            vec!["write: :INIT", "write: *TRG", "query: :FETC?"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_instrument_times_out() {
        let mock = MockSession::meter("GPIB0::7::INSTR", 1.0).with_latency(Duration::from_secs(3));
        let mut sense = SenseController::new(Box::new(mock.clone()));
        sense.config = Some(nvm_config());

        let err = sense.trigger_and_read().await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert!(err.is_transient());
    }
}
