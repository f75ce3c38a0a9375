//! The process orchestrator.
//!
//! Every intercepted call grows a four-level process tree:
//!
//! ```text
//! caller process ── runs the real target, returns its value
//!   └─ monitor ──── one per call, runs the generations
//!        └─ worker × parallel_count, each looping mutations
//!             └─ mutation child × fork_count, the actual runs under test
//! ```
//!
//! Coordination is by `fork` and `wait` only; the caller's side of the
//! first fork drains the whole tree before executing the real call, so the
//! target's memory is only ever mutated in children that exit or die.

use std::thread;
use std::time::Duration;

use nix::sys::personality::{self, Persona};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::ForkResult;

use libafl_bolts::Error;

use crate::hook::Interceptor;
use crate::mutators::Mode;
use crate::state::Runtime;
use crate::target::FuzzTarget;

/// Exit for the monitor and all setup-fatal paths.
pub fn exit_failure() -> ! {
    unsafe { nix::libc::_exit(-1) }
}

/// Exit for workers whose loop is done.
pub fn exit_success() -> ! {
    unsafe { nix::libc::_exit(nix::libc::EXIT_SUCCESS) }
}

/// Exit for mutation children after the real call returns; runs the normal
/// exit path so instrumentation gets to flush its counters.
pub fn exit_child() -> ! {
    std::process::exit(nix::libc::EXIT_SUCCESS)
}

/// Whether this process runs with address-space randomization disabled.
pub fn aslr_disabled() -> Result<bool, Error> {
    let persona = personality::get().map_err(std::io::Error::from)?;
    Ok(persona.contains(Persona::ADDR_NO_RANDOMIZE))
}

/// Replay depends on identical addresses across runs, so a randomized
/// address space is refused outright.
pub fn check_aslr() {
    if !matches!(aslr_disabled(), Ok(true)) {
        log::error!("ASLR is enabled; cannot continue. Please see README.md.");
        exit_failure();
    }
}

fn fork_or_die() -> ForkResult {
    // # Safety
    // The runtime forks from the target's (single-threaded) call path; the
    // child only touches its own copy of the run context and files.
    match unsafe { nix::unistd::fork() } {
        Ok(result) => result,
        Err(_) => {
            log::error!("Failed to fork, exiting...");
            exit_failure();
        }
    }
}

/// Reap children until none remain.
fn wait_for_all_children() {
    while wait().is_ok() {}
}

/// Wait for the current mutation child; anything but a clean exit counts as
/// a crash.
fn wait_for_child() -> bool {
    match wait() {
        Ok(WaitStatus::Exited(_, code)) => code != 0,
        Ok(_) => true,
        Err(_) => false,
    }
}

fn wait_for_workers(count: i32) {
    let mut reaped = 0;
    while wait().is_ok() {
        reaped += 1;
        if reaped == count {
            return;
        }
    }
}

impl Runtime {
    /// Create and install the hook on the target. Idempotent: a second call
    /// warns and leaves the existing hook alone. Failure to install is
    /// fatal.
    pub fn setup_interceptor(&mut self, mut hook: Box<dyn Interceptor>) {
        if self.hook.is_some() {
            log::warn!("Hook already set, continuing.");
            return;
        }
        if hook.install().is_err() {
            log::error!("Failed to hook target function.");
            exit_failure();
        }
        self.hook = Some(hook);
    }

    /// Reinstall the hook after the real call. Fatal on failure.
    pub fn install_hook(&mut self) {
        let Some(hook) = self.hook.as_mut() else {
            return;
        };
        if hook.install().is_err() {
            log::error!("Failed to install hook before returning!");
            exit_failure();
        }
    }

    /// Lift the hook so the real target can be called through. Fatal on
    /// failure.
    pub fn remove_hook(&mut self) {
        let Some(hook) = self.hook.as_mut() else {
            return;
        };
        if hook.remove().is_err() {
            log::error!("Failed to remove hook before calling!");
            exit_failure();
        }
    }

    /// Cap the mutation child at one second of CPU; the kernel kills it
    /// past that. Fatal on failure.
    pub fn restrict_child(&self) {
        if setrlimit(Resource::RLIMIT_CPU, 1, 1).is_err() {
            log::error!("Unable to set rlimit");
            log::error!("Failed to set limits on child process!");
            exit_failure();
        }
    }

    /// Hook point right before the real call in a mutation child; traps
    /// into the debugger after a debug replay when tracing is on.
    pub fn precall(&self) {
        if self.worker.break_now && self.config.tracing {
            log::error!("Breaking out as requested");
            let _ = signal_hook::low_level::raise(nix::libc::SIGTRAP);
        }
    }

    /// Hook point right after the real call; reserved.
    pub fn postcall(&self) {}

    /// Advance the generation counter and decide whether another generation
    /// runs. Debug replay gets exactly one; -1 means forever.
    pub fn keep_generating(&mut self) -> bool {
        if self.debug() {
            let first = self.global.generation_count == 0;
            self.global.generation_count += 1;
            return first;
        }
        self.global.generation_count += 1;
        if self.config.generation_count == -1 {
            return true;
        }
        self.global.generation_count <= self.config.generation_count
    }

    /// Advance the execution counter and decide whether the worker keeps
    /// going: the circuit breaker wins, then the configured count, with -1
    /// meaning forever.
    pub fn keep_mutating(&mut self) -> bool {
        if self.debug() {
            let first = self.worker.exec_count == 0;
            self.worker.exec_count += 1;
            return first;
        }
        self.worker.exec_count += 1;
        if self.worker.excessive_crashes {
            return false;
        }
        if self.config.fork_count == -1 {
            return true;
        }
        self.worker.exec_count as i64 <= self.config.fork_count
    }

    /// Trip the circuit breaker when the crash ratio stays high as the
    /// sample grows: above 25% after 10 runs, 10% after 100, 5% after 1000.
    pub fn check_for_excessive_crashes(&mut self) {
        let crashes = self.worker.crash_count as f64;
        let execs = self.worker.exec_count as f64;
        let tripped = (execs > 10.0 && crashes / execs > 0.25)
            || (execs > 100.0 && crashes / execs > 0.1)
            || (execs > 1000.0 && crashes / execs > 0.05);
        if tripped {
            log::error!("Excessive crashes detected, bailing");
            self.worker.excessive_crashes = true;
        }
    }
}

/// The parallel replacement: the function the hook redirects the target's
/// callers into. Forks a monitor that fuzzes the call, while this side
/// waits the whole tree out, performs the real call with the hook lifted,
/// and hands the real return value back to the original caller.
pub fn run_call<T: FuzzTarget>(rt: &mut Runtime, target: &T) -> T::Ret {
    rt.global.call_count += 1;

    let monitor = fork_or_die();
    rt.remove_hook();
    match monitor {
        ForkResult::Parent { .. } => {
            // Yield briefly so the monitor gets going before we block.
            thread::sleep(Duration::from_micros(100));
            wait_for_all_children();
            let ret = target.call_real();
            rt.install_hook();
            if rt.debug() && rt.check_log_call_matches().is_ok() {
                // The replayed call already happened in the monitor's tree.
                exit_success();
            }
            ret
        }
        ForkResult::Child => run_monitor(rt, target),
    }
}

fn run_monitor<T: FuzzTarget>(rt: &mut Runtime, target: &T) -> ! {
    log::debug!("Fuzzing call {} of {}", rt.global.call_count, target.name());
    if rt.debug() && rt.check_log_call_matches().is_err() {
        exit_failure();
    }
    if rt.setup_call_state().is_err() {
        log::error!("Failed to setup call state");
        exit_failure();
    }

    while rt.keep_generating() {
        if let Err(err) = rt.setup_generation_state() {
            log::error!("Failed to setup generation state: {err}");
            exit_failure();
        }
        let workers = rt.config().effective_parallel_count();
        for worker_number in 0..workers {
            if let ForkResult::Child = fork_or_die() {
                run_worker(rt, target, worker_number);
            }
        }
        wait_for_workers(workers);
        rt.cleanup_generation_state();
    }

    rt.cleanup_call_state();
    exit_failure();
}

fn run_worker<T: FuzzTarget>(rt: &mut Runtime, target: &T, worker_number: i32) -> ! {
    rt.setup_worker_state(worker_number);
    if !rt.debug() {
        rt.set_mode(Mode::Count);
        if let Err(err) = target.mutate_arguments(rt) {
            log::warn!("Counting pass failed: {err}");
        }
        rt.set_mode(Mode::Normal);
    }

    while rt.keep_mutating() {
        if rt.setup_mutation_state().is_err() {
            continue;
        }
        let mut crashed = false;
        match fork_or_die() {
            ForkResult::Child => run_mutation_child(rt, target),
            ForkResult::Parent { .. } => {
                if wait_for_child() {
                    rt.worker.crash_count += 1;
                    crashed = true;
                    log::warn!(
                        "Mutation {} crashed, total crash count {}...",
                        rt.worker.exec_count,
                        rt.worker.crash_count
                    );
                }
                rt.check_for_excessive_crashes();
            }
        }
        rt.cleanup_mutation_state(crashed);
    }

    rt.cleanup_worker_state();
    exit_success();
}

fn run_mutation_child<T: FuzzTarget>(rt: &mut Runtime, target: &T) -> ! {
    if !rt.debug() && rt.time_to_resize() {
        rt.save_mode();
        rt.set_mode(Mode::Resize);
        if let Err(err) = target.mutate_arguments(rt) {
            log::warn!("Resize pass failed: {err}");
        }
        rt.restore_mode();
    }
    rt.restrict_child();
    // # Safety
    // This child shares the address-space layout of the run that wrote the
    // log: ASLR is off and the begin record is validated before anything is
    // applied.
    let _ = unsafe { rt.replay_log() };
    if !rt.debug() {
        if let Err(err) = target.mutate_arguments(rt) {
            log::warn!("Argument mutation failed: {err}");
        }
    }
    rt.precall();
    target.call_real();
    rt.postcall();
    exit_child();
}
