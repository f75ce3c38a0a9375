//! End-to-end exercise of the fork tree against an always-crashing target.
//!
//! Kept to a single test: the orchestrator forks, and forking wants as few
//! sibling threads in the harness as possible.

use std::fs;
use std::path::{Path, PathBuf};

use libafl_bolts::Error;

use fffc::config::Config;
use fffc::mutators::{ArgMutator, IntMutator};
use fffc::region::RegionQuery;
use fffc::state::Runtime;
use fffc::target::FuzzTarget;

struct NoRegions;

impl RegionQuery for NoRegions {
    fn locate_address(&self, _ptr: *const u8) -> usize {
        0
    }

    fn set_report_path(&self, _path: &Path) {}
}

/// A target with one int argument that survives in the original caller but
/// dies in every mutation child.
struct AlwaysCrash {
    storage: *mut i32,
    main_pid: nix::unistd::Pid,
}

impl FuzzTarget for AlwaysCrash {
    type Ret = i32;

    fn name(&self) -> &str {
        "always_crash"
    }

    fn mutate_arguments(&self, rt: &mut Runtime) -> Result<(), Error> {
        unsafe { IntMutator.mutate(rt, self.storage.cast()) }
    }

    fn call_real(&self) -> i32 {
        if nix::unistd::getpid() != self.main_pid {
            std::process::abort();
        }
        42
    }
}

fn find_subdir(root: &Path, prefix: &str) -> PathBuf {
    fs::read_dir(root)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().starts_with(prefix))
                .unwrap_or(false)
        })
        .expect("expected directory missing")
}

#[test]
fn excessive_crashes_trip_the_circuit_breaker() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_path: dir.path().to_path_buf(),
        crash_path: dir.path().to_path_buf(),
        fork_count: 64,
        generation_count: 1,
        parallel_count: 1,
        max_state_count: 8,
        ..Config::default()
    };
    let mut rt =
        Runtime::with_config(config, "always_crash", 0x7ffd_0000, Box::new(NoRegions)).unwrap();

    let storage = Box::leak(Box::new(7i32));
    let target = AlwaysCrash {
        storage,
        main_pid: nix::unistd::getpid(),
    };

    // The original caller gets the real result back.
    let ret = fffc::run_call(&mut rt, &target);
    assert_eq!(ret, 42);

    // Every mutation died, so the circuit breaker must have cut the worker
    // loop well short of the configured 64 runs: above 25% crashes after 10
    // executions, the eleventh run is the last one filed.
    let crash_root = find_subdir(dir.path(), "fffc_crashes.always_crash.");
    let crash_dirs: Vec<_> = fs::read_dir(&crash_root)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().starts_with("crash."))
                .unwrap_or(false)
        })
        .collect();
    assert!(
        (1..=13).contains(&crash_dirs.len()),
        "got {} crash directories",
        crash_dirs.len()
    );

    // Each archived crash carries its log and report.
    for crash_dir in &crash_dirs {
        assert!(crash_dir.join("log").is_file());
        assert!(crash_dir.join("report").is_file());
    }

    // Nothing survived into the parent set.
    let state_root = find_subdir(dir.path(), "fffc_state.always_crash.");
    let call_dir = find_subdir(&state_root, "00000001.");
    let parents = fs::metadata(call_dir.join("parents")).unwrap();
    assert_eq!(parents.len(), 0);
}
