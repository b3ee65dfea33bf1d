//! CSV result logging through a full sweep.

#![cfg(feature = "storage_csv")]

use fourprobe_daq::adapters::{MockSession, SimulatedSample};
use fourprobe_daq::clock::ManualClock;
use fourprobe_daq::data::{CsvResultLogger, LoggerSet, MemoryLogger, ResultLogger};
use fourprobe_daq::error::DaqError;
use fourprobe_daq::instrument::probe::ProbeConfig;
use fourprobe_daq::instrument::{InstrumentConfig, ProbeController, SourceController, SourceLimits};
use fourprobe_daq::sweep::{Instruments, SenseStrategy, SweepEngine, SweepSpec};
use std::sync::Arc;
use tempfile::tempdir;

const SMU: &str = "GPIB0::24::INSTR";

fn engine(sample: &SimulatedSample) -> (SweepEngine, MockSession) {
    let smu = MockSession::source(SMU, sample);
    let source = SourceController::new(Box::new(smu.clone()), SourceLimits::default());
    let engine = SweepEngine::new(
        Instruments::new(source, SenseStrategy::SourceReadback),
        InstrumentConfig::new(SMU),
    )
    .with_name("csv-test")
    .with_clock(Arc::new(ManualClock::new()));
    (engine, smu)
}

fn data_rows(contents: &str) -> Vec<&str> {
    contents.lines().filter(|l| !l.starts_with("# ")).collect()
}

#[tokio::test]
async fn test_csv_has_metadata_header_and_one_row_per_point() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.csv");
    let sample = SimulatedSample::new(100.0);
    let (mut engine, _smu) = engine(&sample);
    let mut logger = CsvResultLogger::new(&path);

    let result = engine
        .run(&SweepSpec::new([1e-3, 2e-3, 3e-3], 21.0), &mut logger)
        .await
        .unwrap();
    assert!(result.is_done());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("# {"));
    assert!(contents.contains("\"name\": \"csv-test\""));

    let rows = data_rows(&contents);
    assert_eq!(rows.len(), 4, "header plus three points");
    assert!(rows[0].starts_with("index,cycle,level_index,timestamp"));
    assert!(rows[0].contains("source_level_A"));
    assert!(rows[0].contains("measured_V"));
    assert!(!rows[0].contains("temperature"));
    assert!(rows[1].starts_with("0,0,0,"));
    assert!(rows[3].starts_with("2,0,2,"));

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(logger.summary_path()).unwrap()).unwrap();
    assert_eq!(summary["status"]["state"], "done");
    assert_eq!(summary["points"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_csv_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("existing.csv");
    std::fs::write(&path, "keep me\n").unwrap();
    let sample = SimulatedSample::new(100.0);
    let (mut engine, smu) = engine(&sample);

    let err = engine
        .run(&SweepSpec::new([1e-3], 21.0), &mut CsvResultLogger::new(&path))
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Storage(_)));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me\n");
    assert!(smu.call_log().is_empty(), "no instrument I/O when the log cannot be created");
}

#[tokio::test]
async fn test_rows_taken_before_a_fault_are_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.csv");
    let sample = SimulatedSample::new(100.0);
    let (mut engine, smu) = engine(&sample);
    smu.fail_matching("LEV 0.003", None);
    let mut logger = CsvResultLogger::new(&path);

    let result = engine
        .run(&SweepSpec::new([1e-3, 2e-3, 3e-3], 21.0), &mut logger)
        .await
        .unwrap();
    assert!(result.fault().is_some());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(data_rows(&contents).len(), 3, "header plus two points");

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(logger.summary_path()).unwrap()).unwrap();
    assert_eq!(summary["status"]["state"], "faulted");
    assert_eq!(summary["status"]["kind"], "command");
}

#[tokio::test]
async fn test_rows_stream_as_points_are_recorded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stream.csv");
    let sample = SimulatedSample::new(100.0);
    let (mut engine, _smu) = engine(&sample);
    let spec = SweepSpec::new([1e-3, 2e-3], 21.0);

    // Let the sweep run, capture the CSV by hand point by point.
    let mut memory = MemoryLogger::new();
    let result = engine.run(&spec, &mut memory).await.unwrap();
    let mut csv = CsvResultLogger::new(&path);
    csv.begin(memory.metadata.as_ref().unwrap()).await.unwrap();
    csv.record(&result.points[0]).await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(data_rows(&contents).len(), 2, "row is flushed before finish");

    csv.record(&result.points[1]).await.unwrap();
    csv.finish(&result).await.unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(data_rows(&contents).len(), 3);
}

#[tokio::test]
async fn test_reversal_and_probe_columns() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("probe.csv");
    let sample = SimulatedSample::new(100.0);
    let smu = MockSession::source(SMU, &sample);
    let probe = ProbeController::new(
        Box::new(MockSession::meter("GPIB0::12::INSTR", 4.2)),
        ProbeConfig::new("GPIB0::12::INSTR"),
    );
    let mut engine = SweepEngine::new(
        Instruments::new(
            SourceController::new(Box::new(smu), SourceLimits::default()),
            SenseStrategy::SourceReadback,
        )
        .with_probe(probe),
        InstrumentConfig::new(SMU),
    )
    .with_clock(Arc::new(ManualClock::new()));
    let mut spec = SweepSpec::new([1e-3], 21.0);
    spec.current_reversal = true;

    let mut loggers = LoggerSet::new()
        .with(CsvResultLogger::new(&path))
        .with(MemoryLogger::new());
    assert_eq!(loggers.len(), 2);
    engine.run(&spec, &mut loggers).await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let rows = data_rows(&contents);
    assert!(rows[0].ends_with("reverse_resistance_ohm,temperature_K"));
    let fields: Vec<&str> = rows[1].split(',').collect();
    assert_eq!(fields.len(), 15);
    assert_eq!(fields[11], "-0.001");
    assert_eq!(fields[14], "4.2");
}
