//! Recorded sensor logs.
//!
//! CSV, one reading per line. Step logs carry a single `timestamp_ns` column;
//! accelerometer logs carry `timestamp,x,y,z` in the source's native units.
//! Blank lines, `#` comments and a leading header row are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use cadence_engine::step_source::{SensorInput, StepSourceKind};

/// Read a log recorded from a `kind` source.
pub fn load_sensor_log(path: &Path, kind: StepSourceKind) -> Result<Vec<SensorInput>> {
    let file = File::open(path).with_context(|| format!("open sensor log {:?}", path))?;
    parse_sensor_log(BufReader::new(file), kind).with_context(|| format!("parse sensor log {:?}", path))
}

pub fn parse_sensor_log(reader: impl BufRead, kind: StepSourceKind) -> Result<Vec<SensorInput>> {
    let mut inputs = Vec::new();
    let mut seen_data = false;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if !seen_data && fields[0].parse::<i64>().is_err() {
            // header row
            seen_data = true;
            continue;
        }
        seen_data = true;

        let input = parse_row(&fields, kind).with_context(|| format!("line {}", idx + 1))?;
        inputs.push(input);
    }
    Ok(inputs)
}

fn parse_row(fields: &[&str], kind: StepSourceKind) -> Result<SensorInput> {
    let timestamp = fields[0]
        .parse::<i64>()
        .with_context(|| format!("invalid timestamp {:?}", fields[0]))?;
    match kind {
        StepSourceKind::Inbuilt => Ok(SensorInput::Step { timestamp }),
        StepSourceKind::External | StepSourceKind::Accelerometer => {
            let &[_, x, y, z] = fields else {
                return Err(anyhow!("expected timestamp,x,y,z; got {} columns", fields.len()));
            };
            let axis = |v: &str| v.parse::<f32>().with_context(|| format!("invalid axis value {v:?}"));
            Ok(SensorInput::Accel {
                timestamp,
                x: axis(x)?,
                y: axis(y)?,
                z: axis(z)?,
            })
        }
    }
}

/// Nanoseconds per timestamp unit for logs recorded from `kind`.
pub fn timestamp_unit_ns(kind: StepSourceKind) -> i64 {
    match kind {
        StepSourceKind::External => 1_000_000,
        StepSourceKind::Inbuilt | StepSourceKind::Accelerometer => 1,
    }
}

pub fn timestamp_of(input: &SensorInput) -> i64 {
    match *input {
        SensorInput::Step { timestamp } | SensorInput::Accel { timestamp, .. } => timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn step_log_skips_comments_and_header() {
        let log = "# recorded 2024-05-01\ntimestamp_ns\n1000000000\n\n1500000000\n";
        let inputs = parse_sensor_log(Cursor::new(log), StepSourceKind::Inbuilt).unwrap();
        assert_eq!(
            inputs,
            vec![
                SensorInput::Step { timestamp: 1_000_000_000 },
                SensorInput::Step { timestamp: 1_500_000_000 },
            ]
        );
    }

    #[test]
    fn accelerometer_log_reads_four_columns() {
        let log = "timestamp,x,y,z\n120, 0.1, -0.2, 1.0\n";
        let inputs = parse_sensor_log(Cursor::new(log), StepSourceKind::External).unwrap();
        assert_eq!(
            inputs,
            vec![SensorInput::Accel {
                timestamp: 120,
                x: 0.1,
                y: -0.2,
                z: 1.0
            }]
        );
    }

    #[test]
    fn malformed_rows_report_their_line() {
        let err = parse_sensor_log(Cursor::new("1,2,3\n"), StepSourceKind::Accelerometer).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));

        let err = parse_sensor_log(Cursor::new("100\nabc\n"), StepSourceKind::Inbuilt).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn external_timestamps_are_milliseconds() {
        assert_eq!(timestamp_unit_ns(StepSourceKind::External), 1_000_000);
        assert_eq!(timestamp_unit_ns(StepSourceKind::Accelerometer), 1);
        assert_eq!(timestamp_of(&SensorInput::Step { timestamp: 7 }), 7);
    }

    #[test]
    fn loads_log_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.csv");
        std::fs::write(&path, "0\n600000000\n").unwrap();
        let inputs = load_sensor_log(&path, StepSourceKind::Inbuilt).unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(load_sensor_log(&dir.path().join("missing.csv"), StepSourceKind::Inbuilt).is_err());
    }
}
