use std::ptr::NonNull;

use log::debug;

use crate::region::ALIGNMENT;
use crate::utils::align;

/// This trait provides an abstraction over the low level, monotonic
/// heap-extension primitive. The allocator, our top level view of this, has
/// nothing to do with the concrete APIs offered by each platform.
///
/// A source only ever grows. There is no way to hand memory back, and the
/// allocator assumes it is the *sole* caller of `grow` for the source's whole
/// lifetime; see [`grow_aligned`] for where a violation gets caught.
pub trait HeapSource {
    /// Extends the heap by `len` bytes and returns the address where the new
    /// memory starts, or `None` if the platform refuses to grow.
    ///
    /// The returned address is not required to be aligned; consecutive calls
    /// are expected to return contiguous memory.
    unsafe fn grow(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// Grows the heap by `len` bytes and fixes up the result onto the
/// [`ALIGNMENT`] grid.
///
/// The primitive may hand back a misaligned address. In that case one
/// corrective request of exactly the misalignment is issued, consuming just
/// enough space that the *next* growth lands aligned, and the realigned
/// address is treated as the start of the requested memory. The corrective
/// request must land right where the first one ended; anything else means
/// another party is moving the heap underneath us, and the process aborts
/// rather than risk silent corruption.
///
/// Failure of either request propagates as `None`; no memory is handed out.
pub(crate) unsafe fn grow_aligned<S: HeapSource>(source: &mut S, len: usize) -> Option<NonNull<u8>> {
    debug_assert_eq!(0, len % ALIGNMENT);
    unsafe {
        let ptr = source.grow(len)?;
        let addr = ptr.as_ptr() as usize;
        let aligned = align(addr, ALIGNMENT);
        if aligned != addr {
            let shim = aligned - addr;
            debug!("heap growth landed {} bytes off the alignment grid, consuming a shim", shim);
            let shim_ptr = source.grow(shim)?;
            assert_eq!(
                addr + len,
                shim_ptr.as_ptr() as usize,
                "heap-growth primitive is not exclusively owned"
            );
        }
        Some(NonNull::new_unchecked(aligned as *mut u8))
    }
}

#[cfg(unix)]
mod unix {
    use std::ptr::NonNull;

    use libc::{c_void, intptr_t, sbrk};

    use super::HeapSource;

    /// The process data segment, grown by moving the program break with
    /// [`libc::sbrk`]. There is exactly one break per process, so at most one
    /// [`crate::Heap`] should ever own a `SystemHeap`.
    pub struct SystemHeap;

    impl SystemHeap {
        pub const fn new() -> Self {
            Self
        }
    }

    impl HeapSource for SystemHeap {
        unsafe fn grow(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = sbrk(len as intptr_t);
                if addr == usize::MAX as *mut c_void {
                    return None;
                }
                NonNull::new(addr.cast::<u8>())
            }
        }
    }
}

#[cfg(unix)]
pub use unix::SystemHeap;

#[cfg(windows)]
mod windows {
    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use log::debug;
    use windows::Win32::System::Memory;

    use super::HeapSource;

    /// How much address space the emulated break may grow into.
    const RESERVE_LIMIT: usize = 1 << 30;

    /// A monotonic break emulated on top of `VirtualAlloc`: one large
    /// reservation up front, committed incrementally as the heap grows, so
    /// consecutive grows stay contiguous the way `sbrk` results are.
    pub struct SystemHeap {
        base: *mut u8,
        committed: usize,
    }

    impl SystemHeap {
        pub const fn new() -> Self {
            Self {
                base: std::ptr::null_mut(),
                committed: 0,
            }
        }
    }

    impl HeapSource for SystemHeap {
        unsafe fn grow(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                if self.base.is_null() {
                    let base = Memory::VirtualAlloc(
                        None,
                        RESERVE_LIMIT,
                        Memory::MEM_RESERVE,
                        Memory::PAGE_NOACCESS,
                    );
                    if base.is_null() {
                        return None;
                    }
                    self.base = base.cast();
                    debug!("reserved {} bytes for the emulated break", RESERVE_LIMIT);
                }
                if RESERVE_LIMIT - self.committed < len {
                    return None;
                }
                let tail = self.base.add(self.committed);
                let committed = Memory::VirtualAlloc(
                    Some(tail as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );
                if committed.is_null() {
                    return None;
                }
                self.committed += len;
                NonNull::new(tail)
            }
        }
    }
}

#[cfg(windows)]
pub use windows::SystemHeap;

/// A bounded arena source backed by ordinary process memory.
///
/// Growth fails by exhaustion instead of touching the process break, which
/// gives every [`crate::Heap`] built on one a fully isolated, sizable heap.
/// Tests use this to force growth failure deterministically.
pub struct FixedHeap {
    storage: Box<[u8]>,
    used: usize,
}

impl FixedHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl HeapSource for FixedHeap {
    unsafe fn grow(&mut self, len: usize) -> Option<NonNull<u8>> {
        if self.storage.len() - self.used < len {
            return None;
        }
        let ptr = unsafe { self.storage.as_mut_ptr().add(self.used) };
        self.used += len;
        NonNull::new(ptr)
    }
}
