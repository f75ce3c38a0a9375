//! The mutation engine.
//!
//! Mutators are tiny menus of byte-level perturbations, one menu per
//! primitive type, combined into arrays and pointers by the generated
//! argument stubs. Which menu entry (if any) fires is decided centrally by
//! [`Runtime::pick_one_or_none`], which implements the global mutation-mode
//! state machine: counting sites, targeting one site, probabilistic
//! mutation, or resizing buffers. Every write a mutator performs lands in
//! the replay log, so a crashing input can be reconstructed byte for byte.

use std::mem;

use libafl_bolts::rands::Rand;
use libafl_bolts::Error;

use crate::state::Runtime;

/// Global mutation mode, owned by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Pure probabilistic selection, no counter interaction.
    #[default]
    Random,
    /// Mutators only count their sites; memory is never touched.
    Count,
    /// Exactly one site fires: the one the counter lands on.
    Iterative,
    /// Iterative targeting plus probabilistic mutation of every other site.
    Normal,
    /// Reserved; selects like [`Mode::Normal`]'s probabilistic path.
    SmartSkip,
    /// Only pointer resizing may fire.
    Resize,
}

impl Runtime {
    pub fn mode(&self) -> Mode {
        self.worker.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.worker.mode = mode;
    }

    /// Stash the current mode. There is exactly one slot, not a stack;
    /// callers pair this with [`Runtime::restore_mode`] around a resize
    /// pass.
    pub fn save_mode(&mut self) {
        self.saved_mode = self.worker.mode;
    }

    pub fn restore_mode(&mut self) {
        self.worker.mode = self.saved_mode;
    }

    pub(crate) fn random_u64(&mut self) -> u64 {
        self.rand.next()
    }

    pub(crate) fn random_below(&mut self, upper_bound: u64) -> u64 {
        self.rand.below(upper_bound.max(1))
    }

    /// Roll for a whole resize pass over the argument list.
    pub fn time_to_resize(&mut self) -> bool {
        if self.config.resize_pass_mask == 0 {
            return false;
        }
        (self.random_u64() as u32 & self.config.resize_pass_mask) == 0
    }

    fn time_to_resize_pointer(&mut self) -> bool {
        if self.config.resize_pointer_mask == 0 {
            return false;
        }
        (self.random_u64() as u32 & self.config.resize_pointer_mask) == 0
    }

    /// The heart of site selection. Returns -1 for "leave this site alone"
    /// or an index into the caller's `options_count`-entry menu.
    ///
    /// Mode behavior:
    /// - `Resize`/`Count` never select; they only adjust the site counter.
    /// - `Iterative` selects exactly when the counter falls into this
    ///   site's `[1, options_count]` window, then zeroes it.
    /// - `Normal` does the same targeting but keeps rolling the dice on
    ///   every other site; `Random` and `SmartSkip` only roll the dice.
    pub fn pick_one_or_none(&mut self, options_count: i32) -> i32 {
        let span = options_count as u64;
        match self.worker.mode {
            Mode::Resize => {
                self.worker.mutation_counter =
                    self.worker.mutation_counter.wrapping_sub(span);
                return -1;
            }
            Mode::Count => {
                self.worker.mutation_counter =
                    self.worker.mutation_counter.wrapping_add(span);
                return -1;
            }
            Mode::Iterative | Mode::Normal => {
                if self.worker.mutation_counter > span {
                    self.worker.mutation_counter -= span;
                    if self.worker.mode != Mode::Normal {
                        return -1;
                    }
                } else if self.worker.mutation_counter > 0 {
                    self.worker.mutation_counter = 0;
                    return self.random_below(span) as i32;
                } else if self.worker.mode != Mode::Normal {
                    return -1;
                }
            }
            Mode::Random | Mode::SmartSkip => {}
        }
        let total_options = ((1.0 + self.config.skip_rate) * options_count as f32) as i32;
        let skip_options = total_options - options_count;
        let random_choice = self.random_below(total_options as u64) as i32;
        random_choice - skip_options
    }

    /// XOR a low-probability random mask into `size` bytes at `region`:
    /// eight random layers are ANDed together so most bits stay clear.
    ///
    /// # Safety
    /// `region` must be writable for `size` bytes.
    pub unsafe fn random_mask(&mut self, region: *mut u8, size: usize) {
        let mask_size = size * 8;
        let mut rnd = vec![0u8; mask_size];
        self.fill_random(&mut rnd);
        for i in 0..size {
            for j in 0..8 {
                rnd[i] &= rnd[i + size * j];
                *region.add(i) ^= rnd[i];
            }
        }
    }

    fn fill_random(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let word = self.rand.next().to_ne_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Region size for `ptr`, memoized through the worker's LFU.
    pub fn estimate_allocation_size(&mut self, ptr: *const u8) -> usize {
        if let Some(size) = self.worker.lfu.lookup(ptr as usize) {
            return size;
        }
        let size = self.region.locate_address(ptr);
        self.worker.lfu.insert(ptr as usize, size);
        size
    }

    /// In resize mode, maybe reallocate the buffer behind `ptr_cell` to a
    /// random new element count, filling it from a random start offset with
    /// wraparound, and publish the new pointer through the cell. Returns
    /// the (possibly new) byte size of the buffer.
    ///
    /// Regions of 128MB and up, and regions smaller than one element, are
    /// left alone.
    ///
    /// # Safety
    /// `ptr_cell` must point at a live pointer cell whose target is
    /// readable for `original_size` bytes.
    pub unsafe fn maybe_munge_pointer(
        &mut self,
        ptr_cell: *mut *mut u8,
        original_size: i64,
        stride: i64,
    ) -> i64 {
        if self.worker.mode != Mode::Resize {
            return original_size;
        }
        if original_size >= (128 << 20) || original_size < stride {
            return original_size;
        }
        if !self.time_to_resize_pointer() {
            return original_size;
        }

        let original_count = original_size / stride;
        let new_count = self.random_below(2 * original_count as u64) as i64 + 1;
        let start_element = self.random_below(original_count as u64) as i64;

        let new_size = new_count * stride;
        let base = ptr_cell.read();

        // The replacement buffer must outlive this child; the child exits
        // after the real call, so it is deliberately leaked.
        let alloc = Box::leak(vec![0u8; new_size as usize].into_boxed_slice()).as_mut_ptr();
        self.log_allocate(alloc as u64, new_size as u64);

        // Fill from the start element, wrapping at the end of the old
        // buffer; every chunk stays inside the source region.
        let mut src_element = start_element;
        let mut filled = 0i64;
        while filled < new_count {
            let chunk = (original_count - src_element).min(new_count - filled);
            let src = base.add((src_element * stride) as usize);
            let dest = alloc.add((filled * stride) as usize);
            let bytes = (chunk * stride) as usize;
            std::ptr::copy_nonoverlapping(src, dest, bytes);
            self.log_copy(dest as u64, src as u64, bytes as u64);
            filled += chunk;
            src_element = (src_element + chunk) % original_count;
        }

        ptr_cell.write(alloc);
        self.log_write(ptr_cell as *const u8, mem::size_of::<*mut u8>());
        self.worker.lfu.insert(alloc as usize, new_size as usize);
        new_size
    }
}

/// One argument (or element) mutator, as the generated stubs drive it. The
/// runtime knows nothing about target types beyond this surface.
pub trait ArgMutator {
    /// Byte width of one element of the mutated type.
    fn stride(&self) -> usize;

    /// Perturb (or, depending on mode, count) the storage at `storage`.
    ///
    /// # Safety
    /// `storage` must be valid for reads and writes of the mutator's type.
    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error>;
}

/// Menu for single-byte values: random XOR plus delimiter and sentinel
/// characters.
pub struct ByteMutator;

impl ArgMutator for ByteMutator {
    fn stride(&self) -> usize {
        1
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(16);
        if choice <= 0 {
            return Ok(());
        }
        let value = storage.read();
        let new = match choice {
            1..=7 => value ^ (rt.random_u64() & 0xFF) as u8,
            8 => 0,
            9 => 0xFF,
            10 => b'&',
            11 => b'>',
            12 => b',',
            13 => b'\\',
            14 => b'\t',
            15 => b'/',
            _ => value,
        };
        storage.write(new);
        rt.log_write(storage, 1);
        Ok(())
    }
}

/// Menu for 2-byte integers, signed or unsigned.
pub struct ShortMutator;

impl ArgMutator for ShortMutator {
    fn stride(&self) -> usize {
        mem::size_of::<u16>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(13);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<u16>();
        let value = cell.read_unaligned();
        // Slots 4 and 10 cannot change a 16-bit value; the write is still
        // logged.
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0xFFFF) as u16,
            5 => value.wrapping_add(1),
            6 => value.wrapping_sub(1),
            7 => value.wrapping_shl(1),
            8 => value.wrapping_neg(),
            9 => value ^ 0xFF,
            10 => value ^ 0xFF00_0000u32 as u16,
            11 => i16::MAX as u16,
            12 => 0,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<u16>());
        Ok(())
    }
}

/// Menu for 4-byte signed integers.
pub struct IntMutator;

impl ArgMutator for IntMutator {
    fn stride(&self) -> usize {
        mem::size_of::<i32>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(16);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<i32>();
        let value = cell.read_unaligned();
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0xFFFF) as i32,
            4..=7 => value ^ (rt.random_u64() as u32 & 0xFFFF_0000) as i32,
            8 => value.wrapping_add(1),
            9 => value.wrapping_sub(1),
            10 => value.wrapping_shl(1),
            11 => value.wrapping_neg(),
            12 => value ^ 0xFF,
            13 => value ^ 0xFF00_0000u32 as i32,
            14 => i32::MAX,
            15 => i32::MIN,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<i32>());
        Ok(())
    }
}

/// Menu for 4-byte unsigned integers.
pub struct UIntMutator;

impl ArgMutator for UIntMutator {
    fn stride(&self) -> usize {
        mem::size_of::<u32>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(16);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<u32>();
        let value = cell.read_unaligned();
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0xFFFF) as u32,
            4..=7 => value ^ (rt.random_u64() as u32 & 0xFFFF_0000),
            8 => value.wrapping_add(1),
            9 => value.wrapping_sub(1),
            10 => value.wrapping_shl(1),
            11 => value.wrapping_neg(),
            12 => value ^ 0xFF,
            13 => value ^ 0xFF00_0000,
            14 => i32::MAX as u32,
            15 => 0,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<u32>());
        Ok(())
    }
}

/// Menu for 8-byte signed integers addressed as four 16-bit byte groups.
pub struct LongMutator;

impl ArgMutator for LongMutator {
    fn stride(&self) -> usize {
        mem::size_of::<i64>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(25);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<i64>();
        let value = cell.read_unaligned();
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0x0000_FFFF) as i64,
            4..=7 => value ^ (rt.random_u64() & 0xFFFF_0000) as i64,
            8..=11 => value ^ (rt.random_u64() & 0xFF00_00FF) as i64,
            12..=15 => value ^ (rt.random_u64() & 0x00FF_FF00) as i64,
            17 => value.wrapping_add(1),
            18 => value.wrapping_sub(1),
            19 => value.wrapping_shl(1),
            20 => value.wrapping_neg(),
            21 => value ^ 0xFF,
            22 => value ^ 0xFF00_0000,
            23 => i64::MAX,
            24 => i64::MIN,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<i64>());
        Ok(())
    }
}

/// Menu for 8-byte unsigned integers addressed as four 16-bit byte groups.
pub struct ULongMutator;

impl ArgMutator for ULongMutator {
    fn stride(&self) -> usize {
        mem::size_of::<u64>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(25);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<u64>();
        let value = cell.read_unaligned();
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0x0000_FFFF),
            4..=7 => value ^ (rt.random_u64() & 0xFFFF_0000),
            8..=11 => value ^ (rt.random_u64() & 0xFF00_00FF),
            12..=15 => value ^ (rt.random_u64() & 0x00FF_FF00),
            17 => value.wrapping_add(1),
            18 => value.wrapping_sub(1),
            19 => value.wrapping_shl(1),
            20 => value.wrapping_neg(),
            21 => value ^ 0xFF,
            22 => value ^ 0xFF00_0000,
            23 => i64::MAX as u64,
            24 => 0,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<u64>());
        Ok(())
    }
}

/// Menu for 8-byte signed integers with full-width byte-group masks.
pub struct LongLongMutator;

impl ArgMutator for LongLongMutator {
    fn stride(&self) -> usize {
        mem::size_of::<i64>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(24);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<i64>();
        let value = cell.read_unaligned();
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0x0000_0000_0000_FFFF) as i64,
            4..=7 => value ^ (rt.random_u64() & 0xFFFF_0000_0000_0000) as i64,
            8..=11 => value ^ (rt.random_u64() & 0x0000_FFFF_0000_0000) as i64,
            12..=15 => value ^ (rt.random_u64() & 0x0000_0000_FFFF_0000) as i64,
            16 => value.wrapping_add(1),
            17 => value.wrapping_sub(1),
            18 => value.wrapping_shl(1),
            19 => value.wrapping_neg(),
            20 => value ^ 0x0000_0000_0000_00FF,
            21 => value ^ 0xFF00_0000_0000_0000u64 as i64,
            22 => i64::MAX,
            23 => i64::MIN,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<i64>());
        Ok(())
    }
}

/// Menu for 8-byte unsigned integers with full-width byte-group masks.
pub struct ULongLongMutator;

impl ArgMutator for ULongLongMutator {
    fn stride(&self) -> usize {
        mem::size_of::<u64>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(24);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<u64>();
        let value = cell.read_unaligned();
        let new = match choice {
            1..=3 => value ^ (rt.random_u64() & 0x0000_0000_0000_FFFF),
            4..=7 => value ^ (rt.random_u64() & 0xFFFF_0000_0000_0000),
            8..=11 => value ^ (rt.random_u64() & 0x0000_FFFF_0000_0000),
            12..=15 => value ^ (rt.random_u64() & 0x0000_0000_FFFF_0000),
            16 => value.wrapping_add(1),
            17 => value.wrapping_sub(1),
            18 => value.wrapping_shl(1),
            19 => value.wrapping_neg(),
            20 => value ^ 0x0000_0000_0000_00FF,
            21 => value ^ 0xFF00_0000_0000_0000,
            22 => i64::MAX as u64,
            23 => 0,
            _ => value,
        };
        cell.write_unaligned(new);
        rt.log_write(storage, mem::size_of::<u64>());
        Ok(())
    }
}

/// Menu for 4-byte floats: masked bit noise plus the edge values (zero,
/// extremes, infinities, a signalling NaN, a subnormal).
pub struct FloatMutator;

// Quiet-bit clear, payload nonzero: signalling NaNs.
const F32_SNAN_BITS: u32 = 0x7FA0_0000;
const F64_SNAN_BITS: u64 = 0x7FF4_0000_0000_0000;

impl ArgMutator for FloatMutator {
    fn stride(&self) -> usize {
        mem::size_of::<f32>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(19);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<f32>();
        if (1..8).contains(&choice) {
            rt.random_mask(storage, mem::size_of::<f32>());
        } else {
            let value = cell.read_unaligned();
            let new = match choice {
                8 => value + 1.0,
                9 => value - 1.0,
                10 => value + f32::EPSILON,
                11 => 0.0,
                12 => -1.0,
                13 => f32::MAX,
                14 => f32::MIN_POSITIVE,
                15 => f32::NEG_INFINITY,
                16 => f32::INFINITY,
                17 => f32::from_bits(F32_SNAN_BITS),
                18 => f32::MIN_POSITIVE / 2.0,
                _ => value,
            };
            cell.write_unaligned(new);
        }
        rt.log_write(storage, mem::size_of::<f32>());
        Ok(())
    }
}

/// Menu for 8-byte floats.
pub struct DoubleMutator;

impl ArgMutator for DoubleMutator {
    fn stride(&self) -> usize {
        mem::size_of::<f64>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let choice = rt.pick_one_or_none(19);
        if choice <= 0 {
            return Ok(());
        }
        let cell = storage.cast::<f64>();
        if (1..8).contains(&choice) {
            rt.random_mask(storage, mem::size_of::<f64>());
        } else {
            let value = cell.read_unaligned();
            let new = match choice {
                8 => value + 1.0,
                9 => value - 1.0,
                10 => value + f64::EPSILON,
                11 => 0.0,
                12 => -1.0,
                13 => f64::MAX,
                14 => f64::MIN_POSITIVE,
                15 => f64::NEG_INFINITY,
                16 => f64::INFINITY,
                17 => f64::from_bits(F64_SNAN_BITS),
                18 => f64::MIN_POSITIVE / 2.0,
                _ => value,
            };
            cell.write_unaligned(new);
        }
        rt.log_write(storage, mem::size_of::<f64>());
        Ok(())
    }
}

/// Placeholder for types the generator cannot perturb.
pub struct NoopMutator;

impl ArgMutator for NoopMutator {
    fn stride(&self) -> usize {
        1
    }

    unsafe fn mutate(&self, _rt: &mut Runtime, _storage: *mut u8) -> Result<(), Error> {
        Ok(())
    }
}

/// Applies the element mutator to every member of an inline array.
pub struct ArrayMutator<'m> {
    element: &'m dyn ArgMutator,
    storage_size: usize,
}

impl<'m> ArrayMutator<'m> {
    pub fn new(element: &'m dyn ArgMutator, storage_size: usize) -> Self {
        Self {
            element,
            storage_size,
        }
    }
}

impl ArgMutator for ArrayMutator<'_> {
    fn stride(&self) -> usize {
        self.storage_size
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let stride = self.element.stride();
        let nmemb = self.storage_size / stride;
        for i in 0..nmemb {
            self.element.mutate(rt, storage.add(i * stride))?;
        }
        Ok(())
    }
}

/// Follows a pointer argument: looks up the region size, maybe resizes the
/// buffer, then walks the elements. Single-byte elements stop at the first
/// null byte (string semantics); traversal never follows nested pointers.
pub struct PointerMutator<'m> {
    element: &'m dyn ArgMutator,
}

impl<'m> PointerMutator<'m> {
    pub fn new(element: &'m dyn ArgMutator) -> Self {
        Self { element }
    }
}

impl ArgMutator for PointerMutator<'_> {
    fn stride(&self) -> usize {
        mem::size_of::<*mut u8>()
    }

    unsafe fn mutate(&self, rt: &mut Runtime, storage: *mut u8) -> Result<(), Error> {
        let cell = storage.cast::<*mut u8>();
        let original_size = rt.estimate_allocation_size(cell.read_unaligned()) as i64;
        let stride = self.element.stride() as i64;
        let size = rt.maybe_munge_pointer(cell, original_size, stride);
        if size < 0 {
            return Ok(());
        }
        let mut data = cell.read_unaligned();
        let mut remaining = size;
        if stride == 1 {
            while remaining >= 1 {
                if data.read() == 0 {
                    break;
                }
                self.element.mutate(rt, data)?;
                data = data.add(1);
                remaining -= 1;
            }
        } else {
            while remaining >= stride {
                self.element.mutate(rt, data)?;
                data = data.add(stride as usize);
                remaining -= stride;
            }
        }
        Ok(())
    }
}
