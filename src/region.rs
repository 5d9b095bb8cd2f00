use std::{mem, ptr::NonNull};

use crate::freelist::FreeInfo;

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// All payload addresses handed out by the allocator are aligned to this value.
pub(crate) const ALIGNMENT: usize = 16;

/// Even allocating 1 byte incurs this much payload. This is also the smallest
/// capacity a size class can hold, and it is what makes the free-list linkage
/// fit inside any free payload.
pub(crate) const MIN_ALLOC: usize = ALIGNMENT;

/// This is the overhead size introduced by the [`Region`] header in bytes.
/// The payload starts exactly this many bytes past the region, an invariant
/// shared by every accessor pair below.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Region>();

/// How big a minimal region is: a header plus the smallest payload.
pub(crate) const MIN_REGION_SIZE: usize = HEADER_SIZE + MIN_ALLOC;

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(mem::size_of::<FreeInfo>() <= MIN_ALLOC);

/// A contiguous, heap-address-ordered block of managed memory. The header
/// describes it; right after comes the payload that user code gets to use.
///
/// ```text
/// +---------------------+ <------+
/// |     total_size      |        |
/// +---------------------+        |
/// |    used_payload     |        | -> Header (HEADER_SIZE bytes)
/// +---------------------+        |
/// |     prev | next     |        |
/// +---------------------+ <------+
/// |       Payload       |        |
/// |         ...         |        | -> used_payload > 0: caller bytes
/// |         ...         |        |    used_payload == 0: [`FreeInfo`] overlay
/// +---------------------+ <------+
/// ```
///
/// `prev` and `next` navigate *physical* adjacency so neighbors can be merged;
/// they are not an ownership relation. A region with no physical neighbor on a
/// side stores `None` there. `used_payload == 0` is the sole free/used
/// discriminator; the payload bytes themselves are untyped scratch space whose
/// meaning follows from it.
pub(crate) struct Region {
    /// Total size of the memory this region is contained in, header included.
    /// Never shrinks except by splitting, never grows except by absorbing a
    /// physical neighbor.
    pub total_size: usize,
    /// How many payload bytes are used. 0 means the region is free
    /// (payloads of size 0 are never allocated).
    pub used_payload: usize,
    /// Physically preceding region, if adjacent memory below is managed.
    pub prev: Link<Region>,
    /// Physically following region, if adjacent memory above is managed.
    pub next: Link<Region>,
}

impl Region {
    /// Writes a fresh, free, unlinked header at `region`.
    ///
    /// **SAFETY**: `region` must point at `total_size` bytes of exclusively
    /// owned, ALIGNMENT-aligned memory.
    pub unsafe fn init(region: NonNull<Region>, total_size: usize) {
        debug_assert!(total_size >= MIN_REGION_SIZE);
        unsafe {
            region.as_ptr().write(Region {
                total_size,
                used_payload: 0,
                prev: None,
                next: None,
            });
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.used_payload == 0
    }

    /// Maximum payload this region can hold, used or not.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.total_size - HEADER_SIZE
    }

    /// Pointer to the caller payload. Only valid while the region is used.
    pub unsafe fn payload(region: NonNull<Region>) -> NonNull<u8> {
        unsafe {
            debug_assert!(!region.as_ref().is_free());
            NonNull::new_unchecked(region.as_ptr().cast::<u8>().add(HEADER_SIZE))
        }
    }

    /// Recovers the owning region from a payload pointer returned by the
    /// allocator. Counterpart of [`Region::payload`].
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Region> {
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)).cast() }
    }

    /// Free-list linkage overlaid on the payload. Only valid while free.
    pub unsafe fn free_info(region: NonNull<Region>) -> NonNull<FreeInfo> {
        unsafe {
            debug_assert!(region.as_ref().is_free());
            NonNull::new_unchecked(region.as_ptr().cast::<u8>().add(HEADER_SIZE)).cast()
        }
    }

    /// Recovers the owning region from its free-list linkage.
    /// Counterpart of [`Region::free_info`].
    pub unsafe fn from_free_info(info: NonNull<FreeInfo>) -> NonNull<Region> {
        unsafe { NonNull::new_unchecked(info.as_ptr().cast::<u8>().sub(HEADER_SIZE)).cast() }
    }

    /// First address past this region. A physical right neighbor starts here.
    pub unsafe fn end(region: NonNull<Region>) -> *mut u8 {
        unsafe { region.as_ptr().cast::<u8>().add(region.as_ref().total_size) }
    }
}
