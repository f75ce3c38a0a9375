//! Coverage harvesting and novelty scoring.
//!
//! Parents leave `.gcda`-formatted counter files behind in their `coverage/`
//! directories. Scoring folds every counter into a coarse four-bucket
//! feature and compares it against the feature history accumulated in the
//! call's features file: exercising a bucket the population has rarely hit
//! earns a score close to one, a common bucket close to zero. The history
//! is updated in place as each parent is processed, and both file cursors
//! rewind after every parent so the next one walks the same positions.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use libafl_bolts::Error;

use crate::state::GenerationState;

/// On-disk size of one feature-history record.
pub const FEATURE_SIZE: usize = 32;

/// Marker preceding each function's counter block in a `.gcda` stream.
pub const FUNCTION_TAG: u32 = 0x01A1_0000;

/// How often an edge counter landed in each magnitude bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoverageFeature {
    pub none: i64,
    pub few: i64,
    pub some: i64,
    pub many: i64,
}

impl CoverageFeature {
    /// Classify one counter value: `=0`, `<8`, `<128`, `>=128`.
    pub fn from_counter(counter: u64) -> Self {
        let mut feature = Self::default();
        if counter == 0 {
            feature.none += 1;
        } else if counter < 8 {
            feature.few += 1;
        } else if counter < 128 {
            feature.some += 1;
        } else {
            feature.many += 1;
        }
        feature
    }

    pub fn total(&self) -> i64 {
        self.none + self.few + self.some + self.many
    }

    pub fn merge(&mut self, update: &Self) {
        self.none += update.none;
        self.few += update.few;
        self.some += update.some;
        self.many += update.many;
    }

    pub fn encode(&self) -> [u8; FEATURE_SIZE] {
        let mut buf = [0u8; FEATURE_SIZE];
        buf[0..8].copy_from_slice(&self.none.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.few.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.some.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.many.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FEATURE_SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            i64::from_ne_bytes(buf[range].try_into().unwrap())
        };
        Self {
            none: word(0..8),
            few: word(8..16),
            some: word(16..24),
            many: word(24..32),
        }
    }
}

/// Score delta for a single counter: the probability that the bucket it
/// landed in was *not* the historical outcome at this position.
fn compute_delta(history: &CoverageFeature, update: &CoverageFeature) -> f64 {
    let total = history.total() as f64;
    if total == 0.0 {
        return 0.0;
    }
    let seen = if update.none > 0 {
        history.none
    } else if update.few > 0 {
        history.few
    } else if update.some > 0 {
        history.some
    } else {
        history.many
    };
    1.0 - (seen as f64 / total)
}

/// Read the feature record at the read cursor. End of file means the
/// position has never been observed and reads as all zeroes; a torn record
/// is an error.
fn read_next_feature(file: &mut File) -> Result<CoverageFeature, Error> {
    let mut buf = [0u8; FEATURE_SIZE];
    let mut total = 0;
    while total < FEATURE_SIZE {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    match total {
        0 => Ok(CoverageFeature::default()),
        FEATURE_SIZE => Ok(CoverageFeature::decode(&buf)),
        partial => {
            log::error!("Couldn't read features");
            log::error!("actually read: {partial}");
            Err(Error::illegal_state("Torn feature record"))
        }
    }
}

/// Write the feature record at the write cursor, growing the file when the
/// position is new.
fn write_next_feature(file: &mut File, feature: &CoverageFeature) -> Result<(), Error> {
    use std::io::Write;
    file.write_all(&feature.encode())?;
    Ok(())
}

/// Fold one counter into the history and accumulate its score delta.
fn update_score(
    generation: &mut GenerationState,
    counter: u64,
    score: &mut f64,
) -> Result<(), Error> {
    let mut history = read_next_feature(&mut generation.features_read)?;
    let update = CoverageFeature::from_counter(counter);
    *score += compute_delta(&history, &update);
    history.merge(&update);
    write_next_feature(&mut generation.features_write, &history)
}

fn read_u32(reader: &mut impl Read) -> Option<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).ok()?;
    Some(u32::from_ne_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Option<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).ok()?;
    Some(u64::from_ne_bytes(buf))
}

/// Scan one counter file: every function tag announces a record count, of
/// which half are 64-bit edge counters. A truncated stream simply ends the
/// scan; feature-file failures propagate.
fn scan_gcda_file(
    file: &mut File,
    generation: &mut GenerationState,
    score: &mut f64,
) -> Result<(), Error> {
    while let Some(word) = read_u32(file) {
        if word != FUNCTION_TAG {
            continue;
        }
        let Some(count) = read_u32(file) else {
            break;
        };
        for _ in 0..count / 2 {
            let Some(counter) = read_u64(file) else {
                return Ok(());
            };
            update_score(generation, counter, score)?;
        }
    }
    Ok(())
}

/// Score one parent directory's coverage against the feature history,
/// rewinding both feature cursors afterwards so the next parent sees the
/// same positions.
pub fn score_directory(
    generation: &mut GenerationState,
    state_dir: &Path,
) -> Result<f64, Error> {
    let coverage_dir = state_dir.join("coverage");
    let entries = std::fs::read_dir(&coverage_dir).map_err(|err| {
        log::error!("Couldn't open coverage directory");
        err
    })?;

    let mut score = 0.0;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "gcda") {
            continue;
        }
        let mut file = File::open(&path).map_err(|err| {
            log::error!("Couldn't open coverage file!");
            err
        })?;
        scan_gcda_file(&mut file, generation, &mut score)?;
    }

    generation
        .features_read
        .seek(SeekFrom::Start(0))
        .map_err(|err| {
            log::error!("Couldn't reset the read fd");
            err
        })?;
    generation
        .features_write
        .seek(SeekFrom::Start(0))
        .map_err(|err| {
            log::error!("Couldn't reset the write fd");
            err
        })?;

    Ok(score)
}
