//! Crash-report sidecar.
//!
//! When a mutation child dies, a small CBOR record is dropped into its
//! directory before the directory is renamed into the crash archive, so a
//! crash can be placed in the run (which call, generation, worker, and
//! iteration produced it) without re-deriving that from directory names.

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::Path;

use libafl_bolts::Error;
use serde::{Deserialize, Serialize};

pub const REPORT_FILE_NAME: &str = "report";

/// Where in the run a crash happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub target: String,
    pub call: u64,
    pub generation: i64,
    pub worker: i32,
    pub iteration: u64,
    pub crash_count: u64,
    pub timestamp: String,
}

impl CrashReport {
    /// Serialize into `<dir>/report`.
    pub fn write_into(&self, dir: &Path) -> Result<(), Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join(REPORT_FILE_NAME))?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(self, &mut writer)
            .map_err(|err| Error::unknown(format!("Could not serialize crash report: {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_roundtrips_through_cbor() {
        let dir = tempfile::tempdir().unwrap();
        let report = CrashReport {
            target: "parse_header".into(),
            call: 3,
            generation: 2,
            worker: 1,
            iteration: 17,
            crash_count: 4,
            timestamp: "Sun_Jul__6_12:00:00_2025".into(),
        };
        report.write_into(dir.path()).unwrap();

        let file = std::fs::File::open(dir.path().join(REPORT_FILE_NAME)).unwrap();
        let read: CrashReport = ciborium::from_reader(file).unwrap();
        assert_eq!(read.target, report.target);
        assert_eq!(read.iteration, report.iteration);
    }
}
