//! Runtime configuration, read once from the environment.
//!
//! Every knob is an `FFFC_*` environment variable; unset variables keep their
//! built-in defaults and invalid values are reported and ignored, so a typo
//! never stops a fuzzing run from starting.

use std::env;
use std::path::PathBuf;

use log::LevelFilter;

/// Fixed stride of the parents-file records and upper bound for every path
/// the runtime builds.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Slots in the per-worker region-size cache.
pub const LFU_SIZE: usize = 4096;

/// How many random slots to try when adopting a parent log.
pub const PARENT_RETRY: usize = 128;

const DEFAULT_FORK_COUNT: i64 = 256;
const DEFAULT_GENERATION_COUNT: i64 = 256;
const DEFAULT_PARALLEL_COUNT: i32 = 16;
const DEFAULT_MAX_STATE_COUNT: i64 = 1024;
const DEFAULT_SKIP_RATE: f32 = 1.0 / 256.0;

/// Snapshot of the `FFFC_*` environment, taken when the run context is
/// created and immutable afterwards. Children inherit it across `fork`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which the state directory tree is created.
    pub data_path: PathBuf,
    /// Root under which the crash archive is created.
    pub crash_path: PathBuf,
    /// Probabilistic skip rate used by `normal` and `smart-skip` selection.
    pub skip_rate: f32,
    /// Mask rolled once per mutation to decide whether a resize pass runs.
    pub resize_pass_mask: u32,
    /// Mask rolled per pointer argument inside a resize pass.
    pub resize_pointer_mask: u32,
    /// Mutations per worker; -1 means run forever.
    pub fork_count: i64,
    /// Generations per intercepted call; -1 means run forever.
    pub generation_count: i64,
    /// Parent population cap enforced by eviction.
    pub max_state_count: i64,
    /// Workers forked per generation.
    pub parallel_count: i32,
    /// When set, the runtime replays this log instead of fuzzing.
    pub debug_replay: Option<PathBuf>,
    /// Raise SIGTRAP in `precall` once a debug replay has been applied.
    pub tracing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("."),
            crash_path: PathBuf::from("."),
            skip_rate: DEFAULT_SKIP_RATE,
            resize_pass_mask: 0xFF,
            resize_pointer_mask: 0x0F,
            fork_count: DEFAULT_FORK_COUNT,
            generation_count: DEFAULT_GENERATION_COUNT,
            max_state_count: DEFAULT_MAX_STATE_COUNT,
            parallel_count: DEFAULT_PARALLEL_COUNT,
            debug_replay: None,
            tracing: false,
        }
    }
}

impl Config {
    /// Build a configuration from the current environment, reporting every
    /// override the way the runtime reports everything else: through the log.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        match env::var("FFFC_MUTATION_RATE").ok().as_deref() {
            None => {
                log::info!("Using default mutation rate; set via FFFC_MUTATION_RATE environment variable.");
            }
            Some("NONE") => {
                config.skip_rate = 0.0;
                log::info!("Using user-provided mutation rate NONE");
            }
            Some("SOME") => {
                config.skip_rate = 1.0 / 512.0;
                log::info!("Using user-provided mutation rate SOME");
            }
            Some("LOTS") => {
                config.skip_rate = 1.0 / 4.0;
                log::info!("Using user-provided mutation rate LOTS");
            }
            Some(_) => {
                log::error!("Invalid value for FFFC_MUTATION_RATE; options are NONE, SOME, or LOTS.");
            }
        }

        match env::var("FFFC_RESIZE_RATE").ok().as_deref() {
            None => {
                log::info!("Using default resize rate; set via FFFC_RESIZE_RATE environment variable.");
            }
            Some("NONE") => {
                config.resize_pass_mask = 0xFF;
                config.resize_pointer_mask = 0x00;
                log::info!("Using user-provided resize rate NONE");
            }
            Some("SOME") => {
                config.resize_pass_mask = 0x0F;
                config.resize_pointer_mask = 0x03;
                log::info!("Using user-provided resize rate SOME");
            }
            Some("LOTS") => {
                config.resize_pass_mask = 0x01;
                config.resize_pointer_mask = 0x03;
                log::info!("Using user-provided resize rate LOTS");
            }
            Some(_) => {
                log::error!("Invalid value for FFFC_RESIZE_RATE; options are NONE, SOME, or LOTS.");
            }
        }

        if let Some(count) = read_count("FFFC_MUTATION_COUNT", "mutation count") {
            config.fork_count = count;
        }
        if let Some(count) = read_count("FFFC_GENERATION_COUNT", "generation count") {
            config.generation_count = count;
        }
        if let Some(count) = read_count("FFFC_MAX_STATE_COUNT", "max state count") {
            config.max_state_count = count;
        }

        match env::var("FFFC_DATA_PATH") {
            Ok(path) => {
                log::info!("Using user-provided working path.");
                config.data_path = PathBuf::from(path);
            }
            Err(_) => {
                log::info!("Using default working path; set via FFFC_DATA_PATH environment variable.");
            }
        }
        match env::var("FFFC_CRASH_PATH") {
            Ok(path) => {
                log::info!("Using user-provided crash path.");
                config.crash_path = PathBuf::from(path);
            }
            Err(_) => {
                log::info!("Using default crash path; set via FFFC_CRASH_PATH environment variable.");
            }
        }

        match env::var("FFFC_DEBUG_REPLAY") {
            Ok(raw) => match fixup_replay_path(&raw) {
                Some(path) => {
                    log::info!("Using user-provided replay path.");
                    config.debug_replay = Some(path);
                }
                None => {
                    log::info!("Fuzzing normally; to replay a specific run, set the FFFC_DEBUG_REPLAY=<logfile> environment variable");
                }
            },
            Err(_) => {
                log::info!("Fuzzing normally; to replay a specific run, set the FFFC_DEBUG_REPLAY=<logfile> environment variable");
            }
        }

        if env::var("FFFC_TRACING").ok().as_deref() == Some("True") {
            config.tracing = true;
            log::info!("Using tracing mode.");
        }

        config
    }

    /// Worker processes to fork per generation: one when replaying a debug
    /// log, the configured count otherwise.
    pub fn effective_parallel_count(&self) -> i32 {
        if self.debug_replay.is_some() {
            1
        } else {
            self.parallel_count
        }
    }
}

fn read_count(var: &str, what: &str) -> Option<i64> {
    let Ok(raw) = env::var(var) else {
        log::info!("Using default {what}; set via {var} environment variable.");
        return None;
    };
    match raw.trim().parse::<i64>() {
        Ok(count) if count >= -1 => {
            log::info!("Using user-provided {what}: {count}");
            Some(count)
        }
        _ => {
            log::error!("Invalid value for {var}; please put a positive integer or -1 to run forever.");
            None
        }
    }
}

/// A debug-replay path is handed over as a full parents-file record: exactly
/// `MAX_PATH_LENGTH` characters with trailing slashes as padding. Anything
/// else is rejected.
pub fn fixup_replay_path(raw: &str) -> Option<PathBuf> {
    if raw.len() != MAX_PATH_LENGTH {
        log::warn!("Got invalid replay path.");
        log::warn!("{raw}");
        return None;
    }
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

/// Initialize the `log` backend from `FFFC_LOG_LEVEL`. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging() {
    let level = match env::var("FFFC_LOG_LEVEL").ok().as_deref() {
        Some("DEBUG") => LevelFilter::Debug,
        Some("INFO") => LevelFilter::Info,
        Some("WARN") => LevelFilter::Warn,
        Some("ERROR") => LevelFilter::Error,
        Some("NONE") => LevelFilter::Off,
        Some(_) => {
            // Reported after init so the message is not swallowed.
            LevelFilter::Warn
        }
        None => LevelFilter::Warn,
    };
    let _ = env_logger::Builder::new().filter_level(level).try_init();
    if matches!(
        env::var("FFFC_LOG_LEVEL").ok().as_deref(),
        Some(other) if !matches!(other, "DEBUG" | "INFO" | "WARN" | "ERROR" | "NONE")
    ) {
        log::error!("Invalid value for FFFC_LOG_LEVEL; options are DEBUG, INFO, WARN, ERROR, or NONE.");
    }
}

/// Report the byte footprint of the environment at debug level: the pointer
/// table (including its null terminator) and the string data. `FFFC_DUMMY`
/// padding entries are skipped.
pub fn log_environment_size() {
    let mut pointer_size = std::mem::size_of::<usize>();
    let mut data_size = 0usize;
    for (key, value) in env::vars_os() {
        if key == "FFFC_DUMMY" {
            continue;
        }
        pointer_size += std::mem::size_of::<usize>();
        // KEY=VALUE plus the terminating null.
        data_size += key.len() + 1 + value.len() + 1;
    }
    log::debug!("Environment pointer size: {pointer_size}");
    log::debug!("Environment data size: {data_size}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rates_match_builtins() {
        let config = Config::default();
        assert_eq!(config.fork_count, 256);
        assert_eq!(config.generation_count, 256);
        assert_eq!(config.max_state_count, 1024);
        assert_eq!(config.parallel_count, 16);
        assert_eq!(config.resize_pass_mask, 0xFF);
        assert_eq!(config.resize_pointer_mask, 0x0F);
        assert!((config.skip_rate - 1.0 / 256.0).abs() < f32::EPSILON);
    }

    #[test]
    fn replay_path_requires_full_record() {
        assert!(fixup_replay_path("/tmp/short").is_none());

        let mut padded = String::from("/tmp/state/log");
        padded.push_str(&"/".repeat(MAX_PATH_LENGTH - padded.len()));
        let fixed = fixup_replay_path(&padded).unwrap();
        assert_eq!(fixed, PathBuf::from("/tmp/state/log"));
    }

    #[test]
    fn replay_path_of_only_slashes_is_rejected() {
        let padded = "/".repeat(MAX_PATH_LENGTH);
        assert!(fixup_replay_path(&padded).is_none());
    }

    #[test]
    fn debug_replay_forces_single_worker() {
        let mut config = Config::default();
        assert_eq!(config.effective_parallel_count(), 16);
        config.debug_replay = Some(PathBuf::from("/tmp/log"));
        assert_eq!(config.effective_parallel_count(), 1);
    }
}
