//! The contract between the runtime and the generated per-target stub.
//!
//! A code generator emits one implementation of [`FuzzTarget`] per hooked
//! function: it knows the function's name, holds the addresses of the live
//! argument storage, and knows how to invoke the real function. The
//! runtime drives everything else.

use libafl_bolts::Error;

use crate::state::Runtime;

/// One hooked function, as seen by the orchestrator.
pub trait FuzzTarget {
    /// What the real function returns; handed back to the original caller.
    type Ret;

    /// Symbol name, used in directory names and crash reports.
    fn name(&self) -> &str;

    /// Run each argument's mutator once against the live storage. In
    /// counting or resize modes this only adjusts counters or buffers; in
    /// the selecting modes it perturbs the arguments and logs every write.
    fn mutate_arguments(&self, rt: &mut Runtime) -> Result<(), Error>;

    /// Invoke the real function on the current argument storage.
    fn call_real(&self) -> Self::Ret;
}
