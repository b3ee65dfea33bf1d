//! CSV result logger with clean feature flag handling.
//!
//! Layout of a sweep file:
//!
//! ```text
//! # {                      <- sweep metadata as pretty JSON, one "# " line each
//! # ...
//! # }
//! index,cycle,level_index,timestamp,elapsed_s,source_level,...
//! 0,0,0,2026-01-01T00:00:00Z,0.0,0.001,...
//! ```
//!
//! The final [`SweepResult`] is written next to it as `<stem>.summary.json`.

use super::ResultLogger;
use crate::error::DaqError;
use crate::sweep::{MeasurementPoint, SweepMetadata, SweepResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use anyhow::Context;
    use std::fs::{File, OpenOptions};
    use std::io::Write;

    pub struct CsvResultLogger {
        path: PathBuf,
        writer: Option<csv::Writer<File>>,
        has_auxiliary: bool,
    }

    fn storage_err(err: anyhow::Error) -> DaqError {
        DaqError::Storage(format!("{:#}", err))
    }

    fn optional(value: Option<f64>) -> String {
        value.map_or(String::new(), |v| v.to_string())
    }

    impl CsvResultLogger {
        /// Log to exactly `path`. The file must not exist yet.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                writer: None,
                has_auxiliary: false,
            }
        }

        /// Log to `<dir>/<name>_<YYYYmmdd_HHMMSS>.csv`.
        pub fn in_directory(dir: impl AsRef<Path>, name: &str) -> Self {
            let file_name = format!(
                "{}_{}.csv",
                name,
                chrono::Utc::now().format("%Y%m%d_%H%M%S")
            );
            Self::new(dir.as_ref().join(file_name))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn summary_path(&self) -> PathBuf {
            self.path.with_extension("summary.json")
        }

        fn create(&mut self, metadata: &SweepMetadata) -> anyhow::Result<()> {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                if !dir.exists() {
                    std::fs::create_dir_all(dir).with_context(|| {
                        format!("Failed to create output directory at {:?}", dir)
                    })?;
                }
            }

            // Never clobber an earlier sweep.
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .with_context(|| format!("Refusing to overwrite or create {:?}", self.path))?;

            let json_string = serde_json::to_string_pretty(metadata)
                .context("Failed to serialize metadata to JSON")?;
            for line in json_string.lines() {
                file.write_all(b"# ")
                    .and_then(|_| file.write_all(line.as_bytes()))
                    .and_then(|_| file.write_all(b"\n"))
                    .context("Failed to write metadata to CSV file")?;
            }

            let source_unit = metadata.source_function.unit();
            let measured_unit = metadata.source_function.measured_unit();
            let mut header = vec![
                "index".to_string(),
                "cycle".to_string(),
                "level_index".to_string(),
                "timestamp".to_string(),
                "elapsed_s".to_string(),
                format!("source_level_{}", source_unit),
                format!("measured_{}", measured_unit),
                format!("measured_std_{}", measured_unit),
                "samples".to_string(),
                "resistance_ohm".to_string(),
                "resistance_std_ohm".to_string(),
                format!("reverse_level_{}", source_unit),
                format!("reverse_measured_{}", measured_unit),
                "reverse_resistance_ohm".to_string(),
            ];
            self.has_auxiliary = metadata.auxiliary.is_some();
            if let Some((label, unit)) = &metadata.auxiliary {
                header.push(format!("{}_{}", label, unit));
            }

            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record(&header)
                .context("Failed to write CSV header")?;
            writer.flush().context("Failed to flush CSV header")?;

            log::info!("CSV result logger writing to '{}'.", self.path.display());
            self.writer = Some(writer);
            Ok(())
        }

        fn append(&mut self, point: &MeasurementPoint) -> anyhow::Result<()> {
            let writer = self
                .writer
                .as_mut()
                .context("CSV result logger used before begin()")?;
            let reverse = point.reverse.as_ref();
            let mut record = vec![
                point.index.to_string(),
                point.cycle.to_string(),
                point.level_index.to_string(),
                point.timestamp.to_rfc3339(),
                point.elapsed_secs.to_string(),
                point.source_level.to_string(),
                point.measured_value.to_string(),
                optional(point.measured_std_dev),
                point.samples.to_string(),
                point.resistance.to_string(),
                optional(point.resistance_std_dev),
                optional(reverse.map(|r| r.source_level)),
                optional(reverse.map(|r| r.measured_value)),
                optional(reverse.map(|r| r.resistance)),
            ];
            if self.has_auxiliary {
                record.push(optional(point.auxiliary));
            }
            writer
                .write_record(&record)
                .context("Failed to write point to CSV file")?;
            // Points hit the disk as they are taken.
            writer.flush().context("Failed to flush CSV writer")?;
            Ok(())
        }

        fn close(&mut self, result: &SweepResult) -> anyhow::Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            let summary_path = self.summary_path();
            let json = serde_json::to_string_pretty(result)
                .context("Failed to serialize sweep summary")?;
            std::fs::write(&summary_path, json)
                .with_context(|| format!("Failed to write summary to {:?}", summary_path))?;
            log::info!("CSV result logger closed '{}'.", self.path.display());
            Ok(())
        }
    }

    #[async_trait]
    impl ResultLogger for CsvResultLogger {
        async fn begin(&mut self, metadata: &SweepMetadata) -> Result<(), DaqError> {
            self.create(metadata).map_err(storage_err)
        }

        async fn record(&mut self, point: &MeasurementPoint) -> Result<(), DaqError> {
            self.append(point).map_err(storage_err)
        }

        async fn finish(&mut self, result: &SweepResult) -> Result<(), DaqError> {
            self.close(result).map_err(storage_err)
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    pub struct CsvResultLogger {
        path: PathBuf,
    }

    impl CsvResultLogger {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn in_directory(dir: impl AsRef<Path>, name: &str) -> Self {
            Self::new(dir.as_ref().join(format!("{}.csv", name)))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn summary_path(&self) -> PathBuf {
            self.path.with_extension("summary.json")
        }
    }

    #[async_trait]
    impl ResultLogger for CsvResultLogger {
        async fn begin(&mut self, _metadata: &SweepMetadata) -> Result<(), DaqError> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn record(&mut self, _point: &MeasurementPoint) -> Result<(), DaqError> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn finish(&mut self, _result: &SweepResult) -> Result<(), DaqError> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvResultLogger;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvResultLogger;
