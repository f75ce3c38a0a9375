//! Deterministic replay of mutation logs.
//!
//! A mutation child replays its log before mutating, so the effects of its
//! ancestors (the copied parent log) land on the fresh argument storage
//! first. In debug mode a user-supplied log is replayed instead and the
//! worker arms `break_now`, so a debugger can trap right before the real
//! call runs on the reconstructed input.
//!
//! Replay is only sound because every process in the tree shares one
//! address-space layout: ASLR is refused at startup and the begin record's
//! call count and stack token are checked before anything is applied.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use libafl_bolts::Error;

use crate::events::{read_event, LogEvent};
use crate::state::Runtime;

/// What a begin record must carry to be replayed in this process.
struct Expectation {
    call_count: u64,
    stack_start: u64,
    debug: bool,
}

impl Runtime {
    /// Replay the current mutation's log from the beginning, or the
    /// user-supplied log in debug mode.
    ///
    /// # Safety
    /// The addresses recorded in the log must be live, writable storage in
    /// this process. That holds in a mutation child of the run that wrote
    /// the log (same binary, ASLR off, matching call count and stack).
    pub unsafe fn replay_log(&mut self) -> Result<(), Error> {
        if self.debug() {
            return self.replay_debug_log();
        }
        let expectation = Expectation {
            call_count: self.global.call_count,
            stack_start: self.global.stack_start,
            debug: false,
        };
        let Some(mutation) = self.mutation.as_mut() else {
            return Err(Error::illegal_state("No mutation to replay"));
        };
        replay_stream(mutation.log.file_mut(), &expectation)
    }

    /// Replay the log named by `FFFC_DEBUG_REPLAY` and arm the trap for
    /// `precall`.
    ///
    /// # Safety
    /// Same contract as [`Runtime::replay_log`].
    pub unsafe fn replay_debug_log(&mut self) -> Result<(), Error> {
        let mut file = self.open_debug_log();
        let expectation = Expectation {
            call_count: self.global.call_count,
            stack_start: self.global.stack_start,
            debug: true,
        };
        let result = replay_stream(&mut file, &expectation);
        self.worker.break_now = true;
        result
    }

    /// Probe whether the user-supplied log belongs to the current call,
    /// without applying anything.
    pub fn check_log_call_matches(&mut self) -> Result<(), Error> {
        let mut file = self.open_debug_log();
        let Some(record) = read_event(&mut file) else {
            return Err(Error::illegal_state("Replay log has no begin record"));
        };
        let event = LogEvent::decode(&record)?;
        let expectation = Expectation {
            call_count: self.global.call_count,
            stack_start: self.global.stack_start,
            debug: true,
        };
        validate_begin(&event, &expectation)
    }

    /// A missing or unopenable debug log is a setup-fatal condition.
    fn open_debug_log(&self) -> File {
        let path = self
            .config
            .debug_replay
            .as_deref()
            .unwrap_or_else(|| std::path::Path::new(""));
        match File::open(path) {
            Ok(file) => file,
            Err(_) => {
                log::error!("Couldn't open specified log");
                std::process::exit(-1);
            }
        }
    }
}

fn validate_begin(event: &LogEvent, expectation: &Expectation) -> Result<(), Error> {
    let LogEvent::Begin {
        call_count,
        stack_start,
    } = event
    else {
        return Err(Error::illegal_state(
            "Replay log does not start with a begin record",
        ));
    };
    if *call_count != expectation.call_count {
        if expectation.debug {
            log::warn!("Not at the right execution count for replay: {call_count}");
            log::warn!("Correct execution count would be: {}", expectation.call_count);
        }
        return Err(Error::illegal_state("Replay call count mismatch"));
    }
    if *stack_start != expectation.stack_start {
        log::error!("Stack is not at the right location for replay: {stack_start:#x}");
        log::error!("Correct location would be: {:#x}", expectation.stack_start);
        return Err(Error::illegal_state("Replay stack mismatch"));
    }
    Ok(())
}

/// Apply one record exactly as written.
unsafe fn apply_event(event: &LogEvent, expectation: &Expectation) -> Result<(), Error> {
    match event {
        LogEvent::Begin { .. } => validate_begin(event, expectation),
        LogEvent::Allocate { length, .. } => {
            // The buffer itself is throwaway; allocating it keeps every
            // later address in the log lined up with the original run.
            std::mem::forget(Vec::<u8>::with_capacity(*length as usize));
            Ok(())
        }
        LogEvent::Copy { src, dest, length } => {
            std::ptr::copy_nonoverlapping(
                *src as *const u8,
                *dest as *mut u8,
                *length as usize,
            );
            Ok(())
        }
        LogEvent::Write {
            location,
            length,
            value,
        } => {
            std::ptr::copy_nonoverlapping(
                value.as_ptr(),
                *location as *mut u8,
                *length as usize,
            );
            Ok(())
        }
    }
}

/// Replay a whole log from offset zero. The first record must be a begin
/// matching `expectation`; every later record is applied in order. The
/// stream ends at the first short record.
unsafe fn replay_stream(file: &mut File, expectation: &Expectation) -> Result<(), Error> {
    file.seek(SeekFrom::Start(0)).map_err(Error::from)?;

    let Some(first) = read_event(file) else {
        return Ok(());
    };
    let begin = LogEvent::decode(&first)?;
    validate_begin(&begin, expectation)?;

    let mut event_count = 1;
    while let Some(record) = read_event(file) {
        let applied = LogEvent::decode(&record).and_then(|event| apply_event(&event, expectation));
        if let Err(err) = applied {
            if !expectation.debug {
                log::error!("Broke replaying event number {event_count}");
            }
            return Err(err);
        }
        event_count += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::config::Config;
    use crate::events::EventLog;
    use crate::mutators::{ArgMutator, ArrayMutator, ByteMutator, Mode};
    use crate::region::testing::UniformRegions;

    fn mutation_runtime(dir: &Path) -> Runtime {
        let config = Config {
            data_path: dir.to_path_buf(),
            crash_path: dir.to_path_buf(),
            ..Config::default()
        };
        let mut rt =
            Runtime::with_config(config, "sample", 0x7ffd_1000, Box::new(UniformRegions(0)))
                .unwrap();
        rt.config.debug_replay = Some(PathBuf::from("/dev/null"));
        rt.global.call_count = 1;
        rt.setup_call_state().unwrap();
        rt.setup_generation_state().unwrap();
        rt.setup_mutation_state().unwrap();
        rt.config.debug_replay = None;
        rt
    }

    #[test]
    fn replay_reconstructs_the_mutated_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = mutation_runtime(dir.path());

        let original = *b"0123456789abcdef";
        let mut buffer = original;
        rt.set_mode(Mode::Normal);
        rt.config.skip_rate = 0.0;
        rt.worker.mutation_counter = 0;
        let array = ArrayMutator::new(&ByteMutator, buffer.len());
        unsafe {
            array.mutate(&mut rt, buffer.as_mut_ptr()).unwrap();
        }
        let mutated = buffer;
        assert_ne!(mutated, original, "every site mutates at skip rate zero");

        buffer = original;
        unsafe {
            rt.replay_log().unwrap();
        }
        assert_eq!(buffer, mutated);
    }

    #[test]
    fn replay_rejects_the_wrong_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = mutation_runtime(dir.path());
        rt.global.call_count = 2;
        unsafe {
            assert!(rt.replay_log().is_err());
        }
    }

    #[test]
    fn replay_rejects_the_wrong_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = mutation_runtime(dir.path());
        rt.global.stack_start = 0xdead;
        unsafe {
            assert!(rt.replay_log().is_err());
        }
    }

    #[test]
    fn empty_logs_replay_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("log"))
            .unwrap();
        let expectation = Expectation {
            call_count: 1,
            stack_start: 0,
            debug: false,
        };
        unsafe {
            replay_stream(&mut file, &expectation).unwrap();
        }
    }

    #[test]
    fn logs_must_start_with_begin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut log = EventLog::new(file);
        log.append(&LogEvent::Allocate {
            location: 0,
            length: 8,
        });

        let expectation = Expectation {
            call_count: 1,
            stack_start: 0,
            debug: false,
        };
        let mut reader = std::fs::File::open(&path).unwrap();
        unsafe {
            assert!(replay_stream(&mut reader, &expectation).is_err());
        }
    }

    #[test]
    fn debug_probe_matches_the_owning_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay-log");
        let file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut log = EventLog::new(file);
        log.append(&LogEvent::Begin {
            call_count: 3,
            stack_start: 0x7ffd_1000,
        });

        let config = Config {
            data_path: dir.path().to_path_buf(),
            crash_path: dir.path().to_path_buf(),
            debug_replay: Some(path),
            ..Config::default()
        };
        let mut rt =
            Runtime::with_config(config, "sample", 0x7ffd_1000, Box::new(UniformRegions(0)))
                .unwrap();

        rt.global.call_count = 1;
        assert!(rt.check_log_call_matches().is_err());
        rt.global.call_count = 3;
        assert!(rt.check_log_call_matches().is_ok());
    }

    #[test]
    fn debug_replay_arms_the_trap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay-log");
        let file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut log = EventLog::new(file);
        log.append(&LogEvent::Begin {
            call_count: 1,
            stack_start: 0x7ffd_1000,
        });

        let config = Config {
            data_path: dir.path().to_path_buf(),
            crash_path: dir.path().to_path_buf(),
            debug_replay: Some(path),
            ..Config::default()
        };
        let mut rt =
            Runtime::with_config(config, "sample", 0x7ffd_1000, Box::new(UniformRegions(0)))
                .unwrap();
        rt.global.call_count = 1;

        assert!(!rt.worker.break_now);
        unsafe {
            rt.replay_log().unwrap();
        }
        assert!(rt.worker.break_now);
    }
}
