use std::ptr::{self, NonNull};

use log::{debug, trace};

use crate::freelist::{self, FreeList, MAX_CLASS, MIN_CLASS};
use crate::kernel::{HeapSource, grow_aligned};
use crate::region::{ALIGNMENT, HEADER_SIZE, Link, MIN_REGION_SIZE, Region};
use crate::utils::align;

/// When we free something of size 100 it gets filed under the class for 64
/// and above, but a later request for 100 has to search from the class for
/// 128 so every candidate is guaranteed big enough. That search would walk
/// right past the perfect region we just freed. Doing a perfect job here
/// costs real memory or time, so instead a lookup briefly inspects the head
/// of the one-lower class, where the most recently freed regions sit. A few
/// entries is enough when the caller is allocating and freeing the same
/// shapes over and over.
const SPECULATIVE_TRIES: usize = 3;

/// Largest request the size classes can represent.
const MAX_REQUEST: usize = 1 << (MAX_CLASS - 1);

/// The allocation engine: one independent, growable heap.
///
/// Owns the segregated free lists, the heap frontier, and the growth source,
/// so every `Heap` is a fully isolated arena. Single execution context only;
/// nothing here is reentrant and nothing suspends mid-operation.
pub struct Heap<S: HeapSource> {
    source: S,
    free_lists: FreeList,
    /// The most recently obtained region. Freshly grown memory that starts
    /// right at its end is physically contiguous and gets linked to it.
    frontier: Link<Region>,
}

impl<S: HeapSource> Heap<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            free_lists: FreeList::new(),
            frontier: None,
        }
    }

    /// Allocates `size` bytes and returns a 16-byte-aligned payload pointer,
    /// or null when `size` is 0 or the heap cannot grow.
    ///
    /// **SAFETY**: the heap must be the sole owner of its growth source, and
    /// the call must not race any other operation on this heap.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 || size > MAX_REQUEST {
            return ptr::null_mut();
        }
        unsafe {
            let region = match self.take_from_free_lists(size) {
                Some(region) => region,
                None => match self.grow_new_region(size) {
                    Some(region) => region,
                    None => return ptr::null_mut(),
                },
            };
            Region::payload(region).as_ptr()
        }
    }

    /// Releases a payload pointer previously returned by this heap. Null is
    /// a no-op.
    ///
    /// **SAFETY**: `ptr` must be null or a live allocation of this heap;
    /// releasing foreign or already-released pointers is undefined.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        unsafe {
            let mut region = Region::from_payload(payload);
            trace!("releasing {} used payload bytes", region.as_ref().used_payload);
            region.as_mut().used_payload = 0;
            self.coalesce_and_file(region);
        }
    }

    /// Resizes an allocation to `new_size` bytes, in place when possible.
    ///
    /// Null `ptr` behaves as [`Heap::allocate`]; `new_size` of 0 behaves as
    /// [`Heap::release`] and returns null. When the region has to move, the
    /// contents are copied up to the smaller of the two sizes and the old
    /// allocation is released; if that move fails, null is returned and the
    /// original allocation stays valid and untouched.
    ///
    /// **SAFETY**: as [`Heap::release`].
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(payload) = NonNull::new(ptr) else {
            return unsafe { self.allocate(new_size) };
        };
        if new_size == 0 {
            unsafe { self.release(ptr) };
            return ptr::null_mut();
        }
        if new_size > MAX_REQUEST {
            return ptr::null_mut();
        }
        unsafe {
            let mut region = Region::from_payload(payload);
            let used = region.as_ref().used_payload;

            if new_size == used {
                return ptr;
            }
            if new_size < used {
                region.as_mut().used_payload = new_size;
                self.split_remainder(region, new_size);
                return ptr;
            }
            if new_size <= region.as_ref().max_payload() {
                region.as_mut().used_payload = new_size;
                return ptr;
            }

            // Maybe free space right after us can be merged in. One look is
            // enough: two free regions after us would already have merged.
            if let Some(next) = region.as_ref().next {
                if next.as_ref().is_free()
                    && new_size <= region.as_ref().max_payload() + next.as_ref().total_size
                {
                    self.free_lists.remove(next);
                    self.absorb_next(region, next);
                    region.as_mut().used_payload = new_size;
                    trace!("resize absorbed the free right neighbor in place");
                    return ptr;
                }
            }

            // Slow path: fresh region, copy, release the original.
            let new_ptr = self.allocate(new_size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(ptr, new_ptr, used.min(new_size));
            self.release(ptr);
            new_ptr
        }
    }

    /// Allocates room for `count` elements of `elem_size` bytes each and
    /// zero-fills it. A product that overflows fails the allocation.
    ///
    /// **SAFETY**: as [`Heap::allocate`].
    pub unsafe fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(elem_size) else {
            debug!("zero-fill request of {} x {} bytes overflows, refusing", count, elem_size);
            return ptr::null_mut();
        };
        unsafe {
            let ptr = self.allocate(total);
            if !ptr.is_null() {
                ptr.write_bytes(0, total);
            }
            ptr
        }
    }

    /// Searches the free lists for a region that can hold `size` bytes and
    /// commits it. Speculative probes first, then first-fit over the classes
    /// whose every member is guaranteed sufficient.
    unsafe fn take_from_free_lists(&mut self, size: usize) -> Option<NonNull<Region>> {
        unsafe {
            let start = freelist::search_class_of(size);

            // The one-lower class is where this request would itself be
            // filed; its members *may* fit even though none is guaranteed
            // to. Skipped when the request sits exactly on a class boundary,
            // because then its own class already starts the guaranteed scan.
            if start > MIN_CLASS && size < freelist::min_capacity_of_class(start) {
                let mut candidate = self.free_lists.head(start - 1);
                let mut tries = 0;
                while let Some(info) = candidate {
                    if tries == SPECULATIVE_TRIES {
                        break;
                    }
                    let region = Region::from_free_info(info);
                    if region.as_ref().max_payload() >= size {
                        trace!("speculative probe hit in class {}", start - 1);
                        return Some(self.take_region(region, size));
                    }
                    candidate = info.as_ref().next;
                    tries += 1;
                }
            }

            for class in start..MAX_CLASS {
                if let Some(info) = self.free_lists.head(class) {
                    let region = Region::from_free_info(info);
                    return Some(self.take_region(region, size));
                }
            }

            None
        }
    }

    /// Removes `region` from its class and commits `size` bytes of it. The
    /// originally requested size is threaded through here so splitting is
    /// computed against the request, never the region's full capacity.
    unsafe fn take_region(&mut self, region: NonNull<Region>, size: usize) -> NonNull<Region> {
        unsafe {
            self.free_lists.remove(region);
            self.use_region(region, size);
            region
        }
    }

    unsafe fn use_region(&mut self, mut region: NonNull<Region>, size: usize) {
        unsafe {
            debug_assert!(region.as_ref().is_free());
            debug_assert!(region.as_ref().max_payload() >= size);
            region.as_mut().used_payload = size;
            self.split_remainder(region, size);
        }
    }

    /// Carves the unused tail of `region` into a new free region when there
    /// is at least a minimal region plus one alignment unit to gain; smaller
    /// remainders stay as untracked waste inside `region`.
    unsafe fn split_remainder(&mut self, mut region: NonNull<Region>, size: usize) {
        unsafe {
            let extra = region.as_ref().max_payload() - size;
            if extra < MIN_REGION_SIZE + ALIGNMENT {
                return;
            }

            let payload = Region::payload(region).as_ptr() as usize;
            let split_addr = align(payload + size, ALIGNMENT);
            let split_total = Region::end(region) as usize - split_addr;
            debug_assert!(split_total >= MIN_REGION_SIZE);

            let mut split = NonNull::new_unchecked(split_addr as *mut Region);
            Region::init(split, split_total);
            region.as_mut().total_size = split_addr - region.as_ptr() as usize;

            split.as_mut().prev = Some(region);
            split.as_mut().next = region.as_ref().next;
            if let Some(mut next) = region.as_ref().next {
                next.as_mut().prev = Some(split);
            }
            region.as_mut().next = Some(split);
            if self.frontier == Some(region) {
                self.frontier = Some(split);
            }

            // A tail carved on the shrink path may border an already-free
            // region; absorb it so two adjacent free regions never coexist.
            if let Some(next) = split.as_ref().next {
                if next.as_ref().is_free() {
                    self.free_lists.remove(next);
                    self.absorb_next(split, next);
                }
            }

            trace!("split a {}-byte tail off a committed region", split_total);
            self.free_lists.insert(split);
        }
    }

    /// Falls back to the growth source for a brand new region sized for the
    /// request, linking it to the frontier when the memory is contiguous.
    unsafe fn grow_new_region(&mut self, size: usize) -> Option<NonNull<Region>> {
        unsafe {
            let total = HEADER_SIZE + align(size, ALIGNMENT);
            debug!("free lists exhausted, growing the heap by {} bytes", total);
            let addr = grow_aligned(&mut self.source, total)?;
            let mut region = addr.cast::<Region>();
            Region::init(region, total);

            if let Some(mut frontier) = self.frontier {
                if Region::end(frontier) == addr.as_ptr() {
                    debug_assert!(frontier.as_ref().next.is_none());
                    frontier.as_mut().next = Some(region);
                    region.as_mut().prev = Some(frontier);
                }
            }
            self.frontier = Some(region);

            self.use_region(region, size);
            Some(region)
        }
    }

    /// Files a freshly freed region, first absorbing free physical
    /// neighbors: left first, then the right neighbor of whatever survived
    /// the left merge. One check in each direction suffices, since no two
    /// adjacent free regions ever coexist.
    unsafe fn coalesce_and_file(&mut self, region: NonNull<Region>) {
        unsafe {
            let mut survivor = region;
            if let Some(prev) = region.as_ref().prev {
                if prev.as_ref().is_free() {
                    self.free_lists.remove(prev);
                    self.absorb_next(prev, region);
                    survivor = prev;
                }
            }
            if let Some(next) = survivor.as_ref().next {
                if next.as_ref().is_free() {
                    self.free_lists.remove(next);
                    self.absorb_next(survivor, next);
                }
            }
            self.free_lists.insert(survivor);
        }
    }

    /// Absorbs `region`'s physical right neighbor into it, relinking the
    /// adjacency chain and moving the frontier off the dying header. The
    /// neighbor must already be off the free lists; its header bytes become
    /// plain payload.
    unsafe fn absorb_next(&mut self, mut region: NonNull<Region>, next: NonNull<Region>) {
        unsafe {
            debug_assert_eq!(Some(next), region.as_ref().next);
            debug_assert_eq!(next.as_ptr().cast::<u8>(), Region::end(region));
            region.as_mut().total_size += next.as_ref().total_size;
            region.as_mut().next = next.as_ref().next;
            if let Some(mut after) = next.as_ref().next {
                after.as_mut().prev = Some(region);
            }
            if self.frontier == Some(next) {
                self.frontier = Some(region);
            }
        }
    }
}
