//! The run context and everything it keeps on disk.
//!
//! One [`Runtime`] is the single owner of all fuzzing state. Because every
//! worker and mutation child is a separate process, the context is
//! naturally private after `fork`; the only shared channels are the parents
//! and features files, and those are coordinated purely through append
//! writes and an atomic rename.
//!
//! Layout on disk:
//!
//! ```text
//! <data_path>/fffc_state.<target>.<timestamp>.XXXXXX/   global
//!   <call:08>.XXXXXX/                                   per call
//!     parents, features
//!     <target>-<iter:08>/                               per mutation
//!       log, coverage/, crash, stdout, stderr
//! <crash_path>/fffc_crashes.<target>.<timestamp>.XXXXXX/
//!   crash.XXXXXX/                                       archived mutation
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libafl_bolts::rands::{Rand, StdRand};
use libafl_bolts::{current_nanos, current_time, Error};

use crate::config::{self, Config, MAX_PATH_LENGTH, PARENT_RETRY};
use crate::coverage;
use crate::events::{EventLog, LogEvent};
use crate::hook::Interceptor;
use crate::mutators::Mode;
use crate::region::{RegionQuery, SizeLfu};
use crate::report::CrashReport;

const PARENTS_FILE_NAME: &str = "parents";
const TEMP_PARENTS_FILE_NAME: &str = "parents.tmp";
const FEATURES_FILE_NAME: &str = "features";
const LOG_FILE_NAME: &str = "log";
const COVERAGE_DIR_NAME: &str = "coverage";
const CRASH_FILE_NAME: &str = "crash";

/// Run-scoped state, fixed after construction apart from the counters.
#[derive(Debug)]
pub struct GlobalState {
    pub call_count: u64,
    pub generation_count: i64,
    pub state_path: PathBuf,
    pub crash_path: PathBuf,
    pub target_name: String,
    pub stack_start: u64,
}

/// One intercepted call's directory.
#[derive(Debug)]
pub struct CallState {
    pub path: PathBuf,
}

/// Open handles over one generation's parents and features files.
///
/// The features file is opened twice so the scoring pass can keep an
/// independent read cursor and write cursor moving in lockstep.
#[derive(Debug)]
pub struct GenerationState {
    pub start_time: Duration,
    pub parents: File,
    pub parents_path: PathBuf,
    pub features_read: File,
    pub features_write: File,
    pub features_path: PathBuf,
}

/// Per-worker bookkeeping, reset when a worker child starts.
#[derive(Debug)]
pub struct WorkerState {
    pub worker_number: i32,
    pub lfu: SizeLfu,
    pub mode: Mode,
    pub mutation_counter: u64,
    pub exec_count: u64,
    pub crash_count: u64,
    pub excessive_crashes: bool,
    pub break_now: bool,
}

impl WorkerState {
    fn new(worker_number: i32) -> Self {
        Self {
            worker_number,
            lfu: SizeLfu::new(),
            mode: Mode::Random,
            mutation_counter: 0,
            exec_count: 0,
            crash_count: 0,
            excessive_crashes: false,
            break_now: false,
        }
    }
}

/// One mutation attempt's directory and open log.
#[derive(Debug)]
pub struct MutationState {
    pub dir: PathBuf,
    pub log: EventLog,
    pub log_path: PathBuf,
    pub coverage_path: PathBuf,
    pub crash_file: PathBuf,
}

/// The run context: configuration, RNG, the interception and region seams,
/// and the live state at every level of the process tree.
pub struct Runtime {
    pub(crate) config: Config,
    pub(crate) rand: StdRand,
    pub(crate) region: Box<dyn RegionQuery>,
    pub(crate) hook: Option<Box<dyn Interceptor>>,
    pub(crate) saved_mode: Mode,
    pub(crate) global: GlobalState,
    pub(crate) call: Option<CallState>,
    pub(crate) generation: Option<GenerationState>,
    pub(crate) worker: WorkerState,
    pub(crate) mutation: Option<MutationState>,
}

impl Runtime {
    /// Build the run context from the environment: read configuration and
    /// create the state and crash archive roots. Called once, from the
    /// target's constructor stub.
    pub fn new(
        target_name: &str,
        stack_start: usize,
        region: Box<dyn RegionQuery>,
    ) -> Result<Self, Error> {
        config::init_logging();
        let cfg = Config::from_env();
        Self::with_config(cfg, target_name, stack_start, region)
    }

    /// Like [`Runtime::new`] but with an explicit configuration.
    pub fn with_config(
        config: Config,
        target_name: &str,
        stack_start: usize,
        region: Box<dyn RegionQuery>,
    ) -> Result<Self, Error> {
        config::log_environment_size();

        let stamp = timestamp();
        let state_template = config
            .data_path
            .join(format!("fffc_state.{target_name}.{stamp}.XXXXXX"));
        let state_path = make_temp_dir(&state_template).map_err(|err| {
            log::error!("Couldn't create global state directory");
            err
        })?;
        let crash_template = config
            .crash_path
            .join(format!("fffc_crashes.{target_name}.{stamp}.XXXXXX"));
        let crash_path = make_temp_dir(&crash_template).map_err(|err| {
            log::error!("Couldn't create global crash directory");
            err
        })?;

        Ok(Self {
            config,
            rand: StdRand::with_seed(current_nanos()),
            region,
            hook: None,
            saved_mode: Mode::Random,
            global: GlobalState {
                call_count: 0,
                generation_count: 0,
                state_path,
                crash_path,
                target_name: target_name.to_owned(),
                stack_start: stack_start as u64,
            },
            call: None,
            generation: None,
            worker: WorkerState::new(0),
            mutation: None,
        })
    }

    /// Whether the runtime is replaying a user-supplied log instead of
    /// fuzzing.
    pub fn debug(&self) -> bool {
        self.config.debug_replay.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---- call state ----

    pub fn setup_call_state(&mut self) -> Result<(), Error> {
        let template = self
            .global
            .state_path
            .join(format!("{:08}.XXXXXX", self.global.call_count));
        if template.as_os_str().len() >= MAX_PATH_LENGTH {
            return Err(Error::illegal_state("Couldn't setup call state"));
        }
        let path = make_temp_dir(&template)?;
        self.call = Some(CallState { path });
        Ok(())
    }

    pub fn cleanup_call_state(&mut self) {
        self.call = None;
    }

    fn call_path(&self) -> Result<&Path, Error> {
        self.call
            .as_ref()
            .map(|call| call.path.as_path())
            .ok_or_else(|| Error::illegal_state("No call state"))
    }

    // ---- generation state ----

    pub fn setup_generation_state(&mut self) -> Result<(), Error> {
        let call_path = self.call_path()?.to_path_buf();

        let parents_path = call_path.join(PARENTS_FILE_NAME);
        let parents = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&parents_path)
            .map_err(|err| {
                log::error!("Couldn't open the parents file");
                log::error!("{}", parents_path.display());
                err
            })?;

        let features_path = call_path.join(FEATURES_FILE_NAME);
        let features_read = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&features_path)
            .map_err(|err| {
                log::error!("Couldn't open the features file for reading");
                err
            })?;
        let features_write = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&features_path)
            .map_err(|err| {
                log::error!("Couldn't open the features file for writing");
                err
            })?;

        self.generation = Some(GenerationState {
            start_time: current_time(),
            parents,
            parents_path,
            features_read,
            features_write,
            features_path,
        });
        Ok(())
    }

    /// Score and evict, then close the generation's files and report
    /// throughput. A scoring failure leaves the parents file untouched.
    pub fn cleanup_generation_state(&mut self) {
        if let Err(err) = self.reap() {
            log::error!("Couldn't get coverage: {err}");
        }
        let Some(generation) = self.generation.take() else {
            return;
        };
        let elapsed = current_time()
            .saturating_sub(generation.start_time)
            .as_secs_f64();
        if elapsed > 0.0 {
            let execs = self.config.fork_count * self.config.parallel_count as i64;
            log::info!("Executions per second: {:.0}", execs as f64 / elapsed);
        }
    }

    // ---- worker state ----

    pub fn setup_worker_state(&mut self, worker_number: i32) {
        self.worker = WorkerState::new(worker_number);
    }

    pub fn cleanup_worker_state(&mut self) {}

    // ---- mutation state ----

    /// Create the mutation directory and its log, adopt a parent log when
    /// this is not the first generation, point coverage and crash output at
    /// the directory, and redirect this process's stdio into it.
    pub fn setup_mutation_state(&mut self) -> Result<(), Error> {
        let iter = self.mutation_iteration();
        let dir = self
            .call_path()?
            .join(format!("{}-{iter:08}", self.global.target_name));
        if let Err(err) = fs::create_dir(&dir) {
            log::error!("Couldn't create data directory: {err}");
            return Err(err.into());
        }

        let log_path = dir.join(LOG_FILE_NAME);
        let log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&log_path)
            .map_err(|err| {
                log::error!("Couldn't create logfile: {err}");
                err
            })?;

        let coverage_path = dir.join(COVERAGE_DIR_NAME);
        if let Err(err) = fs::create_dir(&coverage_path) {
            log::error!(
                "Couldn't create coverage directory: {} -> {err}",
                coverage_path.display()
            );
            return Err(err.into());
        }
        std::env::set_var("GCOV_PREFIX", &coverage_path);
        std::env::set_var("GCOV_PREFIX_STRIP", "100");

        let crash_file = dir.join(CRASH_FILE_NAME);
        self.region.set_report_path(&crash_file);

        self.mutation = Some(MutationState {
            dir: dir.clone(),
            log: EventLog::new(log_file),
            log_path: log_path.clone(),
            coverage_path,
            crash_file,
        });

        if self.global.generation_count > 1 {
            if !self.adopt_parent_log(&log_path) {
                log::warn!("Couldn't get parent log; this is probably due to excessive crashes.");
                self.log_begin();
            }
        } else {
            self.log_begin();
        }

        if !self.debug() {
            redirect_stream(&dir.join("stdout"), nix::libc::STDOUT_FILENO)?;
            redirect_stream(&dir.join("stderr"), nix::libc::STDERR_FILENO)?;
        }

        Ok(())
    }

    /// Unique iteration number for the mutation directory name, derived from
    /// the worker's position in the generation grid.
    fn mutation_iteration(&self) -> u64 {
        let per_generation = self
            .config
            .fork_count
            .wrapping_mul(self.config.parallel_count as i64);
        let previous_gens = self.global.generation_count.wrapping_mul(per_generation);
        let this_gen = (self.worker.worker_number as i64).wrapping_mul(self.config.fork_count);
        (self.worker.exec_count as i64)
            .wrapping_add(previous_gens)
            .wrapping_add(this_gen) as u64
    }

    /// Seed the mutation log with a random surviving parent's log. Slots are
    /// drawn from the full population cap; a short read (an empty slot)
    /// triggers a retry. Returns false when no parent could be copied.
    fn adopt_parent_log(&mut self, log_path: &Path) -> bool {
        let max = self.config.max_state_count;
        if max <= 0 {
            return false;
        }
        let Some(generation) = self.generation.as_ref() else {
            return false;
        };
        let mut record = vec![0u8; MAX_PATH_LENGTH];
        for _ in 0..PARENT_RETRY {
            let slot = self.rand.below(max as u64);
            let offset = slot * MAX_PATH_LENGTH as u64;
            match generation.parents.read_at(&mut record, offset) {
                Ok(n) if n == MAX_PATH_LENGTH => {}
                _ => continue,
            }
            let parent = decode_path_record(&record);
            if fs::copy(parent.join(LOG_FILE_NAME), log_path).is_ok() {
                return true;
            }
        }
        false
    }

    /// File the finished mutation: crashed directories move to the crash
    /// archive (with a report inside), clean ones join the parent set.
    pub fn cleanup_mutation_state(&mut self, crashed: bool) {
        let Some(mutation) = self.mutation.take() else {
            return;
        };
        let MutationState { dir, log, .. } = mutation;
        drop(log);
        if crashed {
            let report = CrashReport {
                target: self.global.target_name.clone(),
                call: self.global.call_count,
                generation: self.global.generation_count,
                worker: self.worker.worker_number,
                iteration: self.worker.exec_count,
                crash_count: self.worker.crash_count,
                timestamp: timestamp(),
            };
            if let Err(err) = report.write_into(&dir) {
                log::warn!("Couldn't write crash report: {err}");
            }
            if let Err(err) = self.move_to_crashes(&dir) {
                log::error!("{err}");
            }
        } else {
            self.append_parent_record(&dir);
        }
    }

    fn move_to_crashes(&mut self, dir: &Path) -> Result<(), Error> {
        let template = self.global.crash_path.join("crash.XXXXXX");
        let crash_dir = make_temp_dir(&template).map_err(|err| {
            log::error!("Couldn't create saved crash directory");
            err
        })?;
        if let Err(err) = fs::rename(dir, &crash_dir) {
            log::error!("Rename failed");
            return Err(err.into());
        }
        Ok(())
    }

    /// Append a fixed-stride, null-padded path record to the parents file.
    pub(crate) fn append_parent_record(&mut self, dir: &Path) {
        let Some(generation) = self.generation.as_mut() else {
            return;
        };
        let record = match encode_path_record(dir) {
            Ok(record) => record,
            Err(err) => {
                log::error!("{err}");
                return;
            }
        };
        if let Err(err) = generation.parents.write_all(&record) {
            log::error!("Didn't write whole path: {err}");
        }
    }

    // ---- eviction ----

    /// Score every surviving parent against the feature history, then delete
    /// the lowest scorers past the population cap and atomically rewrite the
    /// parents file with the survivors.
    pub fn reap(&mut self) -> Result<(), Error> {
        let max_state_count = self.config.max_state_count;
        let call_path = self.call_path()?.to_path_buf();
        let Some(generation) = self.generation.as_mut() else {
            return Ok(());
        };

        generation.parents.seek(SeekFrom::Start(0)).map_err(|err| {
            log::error!("Couldn't seek in the parents file");
            err
        })?;
        let state_count = generation.parents.metadata()?.len() / MAX_PATH_LENGTH as u64;
        let num_victims = state_count as i64 - max_state_count;
        if num_victims < 0 {
            return Ok(());
        }

        let tmp_parents_path = call_path.join(TEMP_PARENTS_FILE_NAME);
        let mut new_parents = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_parents_path)
            .map_err(|err| {
                log::error!("Couldn't open the new parents file");
                err
            })?;

        struct ScoreEntry {
            score: f64,
            record: Vec<u8>,
            path: PathBuf,
        }

        let mut scores = Vec::with_capacity(state_count as usize);
        for _ in 0..state_count {
            let mut record = vec![0u8; MAX_PATH_LENGTH];
            generation.parents.read_exact(&mut record).map_err(|err| {
                log::error!("Couldn't read parent file");
                err
            })?;
            let path = decode_path_record(&record);
            let score = coverage::score_directory(generation, &path)?;
            scores.push(ScoreEntry {
                score,
                record,
                path,
            });
        }

        scores.sort_by(|a, b| a.score.total_cmp(&b.score));

        for (index, entry) in scores.iter().enumerate() {
            if (index as i64) < num_victims {
                let _ = fs::remove_dir_all(&entry.path);
            } else {
                new_parents.write_all(&entry.record).map_err(|err| {
                    log::error!("Couldn't write to the temporary parent file.");
                    err
                })?;
            }
        }

        drop(new_parents);
        fs::rename(&tmp_parents_path, &generation.parents_path)?;
        Ok(())
    }

    // ---- replay-log emission ----

    /// Start a fresh log for the current mutation.
    pub fn log_begin(&mut self) {
        let event = LogEvent::Begin {
            call_count: self.global.call_count,
            stack_start: self.global.stack_start,
        };
        if let Some(mutation) = self.mutation.as_mut() {
            mutation.log.append(&event);
        }
    }

    /// Record the bytes currently stored at `location`.
    ///
    /// # Safety
    /// `location` must be readable for `length` bytes.
    pub unsafe fn log_write(&mut self, location: *const u8, length: usize) {
        let bytes = std::slice::from_raw_parts(location, length);
        match LogEvent::write(location as u64, bytes) {
            Ok(event) => {
                if let Some(mutation) = self.mutation.as_mut() {
                    mutation.log.append(&event);
                }
            }
            Err(err) => log::error!("{err}"),
        }
    }

    /// Record a copy of `length` bytes from `src` to `dest`.
    pub fn log_copy(&mut self, dest: u64, src: u64, length: u64) {
        let event = LogEvent::Copy { src, dest, length };
        if let Some(mutation) = self.mutation.as_mut() {
            mutation.log.append(&event);
        }
    }

    /// Record a replacement allocation of `length` bytes at `location`.
    pub fn log_allocate(&mut self, location: u64, length: u64) {
        let event = LogEvent::Allocate { location, length };
        if let Some(mutation) = self.mutation.as_mut() {
            mutation.log.append(&event);
        }
    }
}

/// Local time, spaces flattened so the stamp can live in a path.
pub(crate) fn timestamp() -> String {
    chrono::Local::now()
        .format("%c")
        .to_string()
        .replace(' ', "_")
}

/// `mkdtemp` over a `...XXXXXX` template.
fn make_temp_dir(template: &Path) -> Result<PathBuf, Error> {
    nix::unistd::mkdtemp(template).map_err(|errno| std::io::Error::from(errno).into())
}

/// Swap this process's `fd` for a freshly created file at `path`.
fn redirect_stream(path: &Path, fd: std::os::fd::RawFd) -> Result<(), Error> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| {
            log::error!("Unable to create redirection file");
            err
        })?;
    nix::unistd::dup2(file.as_raw_fd(), fd).map_err(|errno| {
        log::error!("Unable to redirect output");
        Error::from(std::io::Error::from(errno))
    })?;
    Ok(())
}

/// Null-padded fixed-stride path record for the parents file.
pub(crate) fn encode_path_record(path: &Path) -> Result<Vec<u8>, Error> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= MAX_PATH_LENGTH {
        return Err(Error::illegal_argument(format!(
            "Path too long for a parent record: {}",
            path.display()
        )));
    }
    let mut record = vec![0u8; MAX_PATH_LENGTH];
    record[..bytes.len()].copy_from_slice(bytes);
    Ok(record)
}

/// Decode a parents-file record: everything up to the first null byte.
pub(crate) fn decode_path_record(record: &[u8]) -> PathBuf {
    let end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
    PathBuf::from(std::ffi::OsStr::from_bytes(&record[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::testing::UniformRegions;

    fn test_runtime(dir: &Path) -> Runtime {
        let config = Config {
            data_path: dir.to_path_buf(),
            crash_path: dir.to_path_buf(),
            ..Config::default()
        };
        Runtime::with_config(config, "sample", 0x7ffd_0000, Box::new(UniformRegions(0))).unwrap()
    }

    #[test]
    fn path_records_roundtrip() {
        let path = PathBuf::from("/tmp/fffc/00000001.abc/sample-00000004");
        let record = encode_path_record(&path).unwrap();
        assert_eq!(record.len(), MAX_PATH_LENGTH);
        assert_eq!(decode_path_record(&record), path);
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let path = PathBuf::from(format!("/{}", "x".repeat(MAX_PATH_LENGTH)));
        assert!(encode_path_record(&path).is_err());
    }

    #[test]
    fn global_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime(dir.path());
        assert!(rt.global.state_path.is_dir());
        assert!(rt.global.crash_path.is_dir());
        let name = rt.global.state_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("fffc_state.sample."));
    }

    #[test]
    fn parents_file_keeps_fixed_stride() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();

        for i in 0..3 {
            let parent = rt
                .call
                .as_ref()
                .unwrap()
                .path
                .join(format!("sample-{i:08}"));
            fs::create_dir(&parent).unwrap();
            rt.append_parent_record(&parent);
        }

        let generation = rt.generation.as_ref().unwrap();
        let len = fs::metadata(&generation.parents_path).unwrap().len();
        assert_eq!(len, 3 * MAX_PATH_LENGTH as u64);

        let data = fs::read(&generation.parents_path).unwrap();
        for chunk in data.chunks(MAX_PATH_LENGTH) {
            assert!(chunk.contains(&0), "record must be null-terminated");
            assert!(decode_path_record(chunk).is_dir());
        }
    }

    fn write_fake_gcda(dir: &Path, counter: u64) {
        fs::create_dir_all(dir.join("coverage")).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x01A1_0000u32.to_ne_bytes());
        bytes.extend_from_slice(&2u32.to_ne_bytes());
        bytes.extend_from_slice(&counter.to_ne_bytes());
        fs::write(dir.join("coverage").join("unit.gcda"), bytes).unwrap();
    }

    #[test]
    fn reap_evicts_down_to_the_population_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        rt.config.max_state_count = 8;
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();

        let mut parents = Vec::new();
        for i in 0..32u64 {
            let parent = rt
                .call
                .as_ref()
                .unwrap()
                .path
                .join(format!("sample-{i:08}"));
            fs::create_dir(&parent).unwrap();
            write_fake_gcda(&parent, i);
            rt.append_parent_record(&parent);
            parents.push(parent);
        }

        rt.reap().unwrap();

        let generation = rt.generation.as_ref().unwrap();
        let len = fs::metadata(&generation.parents_path).unwrap().len();
        assert_eq!(len, 8 * MAX_PATH_LENGTH as u64);

        let survivors: Vec<_> = parents.iter().filter(|p| p.is_dir()).collect();
        assert_eq!(survivors.len(), 8);

        let data = fs::read(&generation.parents_path).unwrap();
        for chunk in data.chunks(MAX_PATH_LENGTH) {
            assert!(decode_path_record(chunk).is_dir());
        }
    }

    #[test]
    fn reap_below_cap_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();

        let parent = rt.call.as_ref().unwrap().path.join("sample-00000000");
        fs::create_dir(&parent).unwrap();
        write_fake_gcda(&parent, 3);
        rt.append_parent_record(&parent);

        rt.reap().unwrap();
        assert!(parent.is_dir());
        let generation = rt.generation.as_ref().unwrap();
        let len = fs::metadata(&generation.parents_path).unwrap().len();
        assert_eq!(len, MAX_PATH_LENGTH as u64);
    }

    #[test]
    fn crashed_mutations_move_to_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        // Debug mode keeps stdio alone during mutation setup.
        rt.config.debug_replay = Some(PathBuf::from("/dev/null"));
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();
        rt.setup_mutation_state().unwrap();

        let mutation_dir = rt.mutation.as_ref().unwrap().dir.clone();
        assert!(mutation_dir.is_dir());
        rt.cleanup_mutation_state(true);
        assert!(!mutation_dir.exists());

        let archived: Vec<_> = fs::read_dir(&rt.global.crash_path)
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(archived.len(), 1);
        let crash_dir = archived[0].path();
        assert!(crash_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("crash."));
        assert!(crash_dir.join("log").is_file());
        assert!(crash_dir.join("report").is_file());
        assert!(crash_dir.join("coverage").is_dir());
    }

    #[test]
    fn second_generation_mutations_adopt_a_parent_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        rt.config.debug_replay = Some(PathBuf::from("/dev/null"));
        // One population slot makes the adoption draw deterministic.
        rt.config.max_state_count = 1;
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();

        // Build generation one's surviving parent by hand.
        rt.setup_mutation_state().unwrap();
        let marker = 0x5Au8;
        unsafe {
            rt.log_write(&marker as *const u8, 1);
        }
        let parent_dir = rt.mutation.as_ref().unwrap().dir.clone();
        rt.cleanup_mutation_state(false);
        let parent_log = fs::read(parent_dir.join("log")).unwrap();

        rt.global.generation_count = 2;
        rt.setup_mutation_state().unwrap();
        let child_log_path = rt.mutation.as_ref().unwrap().log_path.clone();
        let child_log = fs::read(&child_log_path).unwrap();
        assert_eq!(
            child_log, parent_log,
            "a second-generation log starts as a byte copy of its parent's"
        );
    }

    #[test]
    fn clean_mutations_join_the_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        rt.config.debug_replay = Some(PathBuf::from("/dev/null"));
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();
        rt.setup_mutation_state().unwrap();

        let mutation_dir = rt.mutation.as_ref().unwrap().dir.clone();
        rt.cleanup_mutation_state(false);
        assert!(mutation_dir.is_dir());

        let generation = rt.generation.as_ref().unwrap();
        let data = fs::read(&generation.parents_path).unwrap();
        assert_eq!(data.len(), MAX_PATH_LENGTH);
        assert_eq!(decode_path_record(&data), mutation_dir);
    }
}
