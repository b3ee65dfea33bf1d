//! Core library for four-probe resistance sweeps.
//!
//! A source/measure unit drives a current (or voltage) through the sample and
//! the response is read back either from the source itself or from a separate
//! nanovoltmeter. The [`sweep::SweepEngine`] steps through the configured
//! levels, averages the readings, computes resistance and streams each point to
//! a [`data::ResultLogger`].
//!
//! ```no_run
//! use fourprobe_daq::adapters::{MockSession, SimulatedSample};
//! use fourprobe_daq::data::MemoryLogger;
//! use fourprobe_daq::instrument::{InstrumentConfig, SourceController, SourceLimits};
//! use fourprobe_daq::sweep::{Instruments, SenseStrategy, SweepEngine, SweepSpec};
//!
//! # async fn demo() -> Result<(), fourprobe_daq::error::DaqError> {
//! let sample = SimulatedSample::new(100.0);
//! let session = MockSession::source("GPIB0::24::INSTR", &sample);
//! let source = SourceController::new(Box::new(session), SourceLimits::default());
//! let mut engine = SweepEngine::new(
//!     Instruments::new(source, SenseStrategy::SourceReadback),
//!     InstrumentConfig::new("GPIB0::24::INSTR"),
//! );
//! let spec = SweepSpec::new([1e-3, 2e-3, 3e-3], 21.0);
//! let result = engine.run(&spec, &mut MemoryLogger::new()).await?;
//! println!("{:?}", result.resistances());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod sweep;
