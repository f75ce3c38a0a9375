//! fffc, a per-function in-process fuzzer runtime.
//!
//! Linked into a target binary, the runtime hot-patches one chosen function
//! and turns every call of it into a fuzzing campaign: a forked monitor
//! drives workers that drive mutation children, each of which perturbs the
//! intercepted arguments, runs the real function, and leaves a replayable
//! log of exactly what it changed. Surviving inputs evolve on disk across
//! generations, scored by edge-coverage novelty, while the original caller
//! gets the real call's result as if nothing happened.
//!
//! A generated per-target stub (see [`target::FuzzTarget`]) supplies the
//! typed argument mutators and the call itself; the inline-hooking
//! primitive and the sanitizer's region queries are consumed behind the
//! [`hook::Interceptor`] and [`region::RegionQuery`] seams.

pub mod config;
pub mod coverage;
pub mod events;
pub mod fuzzer;
pub mod hook;
pub mod mutators;
pub mod region;
pub mod replay;
pub mod report;
pub mod state;
pub mod target;

pub use config::Config;
pub use fuzzer::{check_aslr, run_call};
pub use hook::Interceptor;
pub use mutators::{ArgMutator, Mode};
pub use region::RegionQuery;
pub use state::Runtime;
pub use target::FuzzTarget;
