//! The interception seam: installing and removing the trampoline on the
//! target function, and resolving the target's address inside the loaded
//! image.
//!
//! The trampoline itself lives outside this crate; the runtime only drives
//! an opaque handle through `install`/`remove` and never looks inside it.

use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libafl_bolts::Error;
use nix::libc;

/// An installed-or-removable patch on the target function.
///
/// `install` must redirect calls of the target to the replacement;
/// `remove` must restore call-through to the original. Both are called many
/// times over the runtime's life, strictly paired around the real call.
pub trait Interceptor {
    fn install(&mut self) -> Result<(), Error>;
    fn remove(&mut self) -> Result<(), Error>;
}

/// Resolve the runtime address of the target symbol.
///
/// For a non-PIE binary the link-time offset is the address. Otherwise the
/// loaded objects are walked and `elf_offset` is rebased onto the load
/// address of the object whose name matches `object_path`, either verbatim
/// or after canonicalization.
pub fn resolve_symbol(elf_offset: u64, object_path: &Path, recalculate: bool) -> *const () {
    if !recalculate {
        return elf_offset as *const ();
    }

    struct Search {
        wanted: PathBuf,
        base: Option<u64>,
    }

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let search = &mut *(data as *mut Search);
        let name = CStr::from_ptr((*info).dlpi_name);
        let name = Path::new(OsStr::from_bytes(name.to_bytes()));

        if name == search.wanted {
            search.base = Some((*info).dlpi_addr as u64);
            return -1;
        }
        // Loader names may be relative while ours is absolute, or vice
        // versa; retry against the canonical form.
        if let Ok(real) = std::fs::canonicalize(name) {
            if real == search.wanted {
                search.base = Some((*info).dlpi_addr as u64);
                return -1;
            }
        }
        0
    }

    let mut search = Search {
        wanted: object_path.to_path_buf(),
        base: None,
    };
    // # Safety
    // The callback only dereferences the loader-owned phdr info passed to it
    // and the `Search` pointer, which outlives the iteration.
    unsafe {
        libc::dl_iterate_phdr(
            Some(visit),
            &mut search as *mut Search as *mut libc::c_void,
        );
    }

    let base = search.base.unwrap_or(0);
    base.wrapping_add(elf_offset) as *const ()
}

#[cfg(test)]
pub(crate) mod testing {
    use libafl_bolts::Error;

    use super::Interceptor;

    /// Interceptor that only counts transitions, for orchestration tests.
    #[derive(Debug, Default)]
    pub struct CountingHook {
        pub installs: usize,
        pub removes: usize,
    }

    impl Interceptor for CountingHook {
        fn install(&mut self) -> Result<(), Error> {
            self.installs += 1;
            Ok(())
        }

        fn remove(&mut self) -> Result<(), Error> {
            self.removes += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_pie_offsets_pass_through() {
        let addr = resolve_symbol(0x401130, Path::new("/does/not/matter"), false);
        assert_eq!(addr as u64, 0x401130);
    }

    #[test]
    fn unknown_objects_fall_back_to_the_raw_offset() {
        let addr = resolve_symbol(0x10, Path::new("/no/such/object.so"), true);
        assert_eq!(addr as u64, 0x10);
    }
}
