use std::ptr::NonNull;

use crate::region::{Link, MIN_ALLOC, Region};
use crate::utils::{next_power_of_two, prev_power_of_two};

/// Smallest size class: 2^4 == [`MIN_ALLOC`].
pub(crate) const MIN_CLASS: usize = 4;

/// One past the largest size class. Capacities are bounded by what a 32-bit
/// field can represent, so classes stop at 2^31.
pub(crate) const MAX_CLASS: usize = 32;

const _: () = assert!((1 << MIN_CLASS) == MIN_ALLOC);

/// Linkage of a free region within its size class, overlaid on the payload
/// bytes that would otherwise sit unused.
///
/// ```text
///                  class K head
///                       |
/// +--------+-------+    |    +--------+-------+         +--------+-------+
/// | Region | Free  | <--+    | Region | Free  |         | Region | Free  |
/// | header | Info -+-------> | header | Info -+-------> | header | Info  |
/// +--------+-------+         +--------+-------+         +--------+-------+
/// ```
///
/// The overlay is only meaningful while the owning region is free; marking a
/// region used hands the same bytes back to the caller as payload.
pub(crate) struct FreeInfo {
    pub prev: Link<FreeInfo>,
    pub next: Link<FreeInfo>,
}

/// Segregated table of free regions: one doubly linked, unordered list per
/// power-of-two size class. A region whose payload capacity lies in
/// `[2^K, 2^(K+1))` is filed in class K. Freshly freed regions are pushed to
/// the head, so reuse prefers the most recently freed memory.
pub(crate) struct FreeList {
    classes: [Link<FreeInfo>; MAX_CLASS],
}

/// The class a capacity is *filed* under: keyed by the power of two that
/// lower-bounds it.
pub(crate) fn class_of(capacity: usize) -> usize {
    debug_assert!(capacity >= MIN_ALLOC);
    let class = prev_power_of_two(capacity).trailing_zeros() as usize;
    class.min(MAX_CLASS - 1)
}

/// The first class every member of which is guaranteed to hold `size`: the
/// one keyed by the power of two at or above the request. Regions are filed
/// by the lower bound of their capacity, so a lookup that started at
/// `class_of(size)` could hand back memory that is too small.
pub(crate) fn search_class_of(size: usize) -> usize {
    next_power_of_two(size.max(MIN_ALLOC)).trailing_zeros() as usize
}

/// Smallest capacity class `class` can contain.
pub(crate) fn min_capacity_of_class(class: usize) -> usize {
    1 << class
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            classes: [None; MAX_CLASS],
        }
    }

    #[inline]
    pub fn head(&self, class: usize) -> Link<FreeInfo> {
        self.classes[class]
    }

    /// Files a free region at the head of its capacity's class.
    ///
    /// **SAFETY**: `region` must be a valid free region that is not currently
    /// on any list.
    pub unsafe fn insert(&mut self, region: NonNull<Region>) {
        unsafe {
            debug_assert!(region.as_ref().is_free());
            let class = class_of(region.as_ref().max_payload());
            let info = Region::free_info(region);
            let head = self.classes[class];

            info.as_ptr().write(FreeInfo { prev: None, next: head });
            if let Some(mut head) = head {
                head.as_mut().prev = Some(info);
            }
            self.classes[class] = Some(info);
        }
    }

    /// Unlinks a region from its class in O(1) via its overlaid linkage.
    ///
    /// **SAFETY**: `region` must be on this table, filed under its current
    /// capacity (callers absorb or mark used only *after* removal).
    pub unsafe fn remove(&mut self, region: NonNull<Region>) {
        unsafe {
            let class = class_of(region.as_ref().max_payload());
            let info = Region::free_info(region);
            let FreeInfo { prev, next } = info.as_ptr().read();

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => {
                    debug_assert_eq!(self.classes[class], Some(info));
                    self.classes[class] = next;
                }
            }
            if let Some(mut next) = next {
                next.as_mut().prev = prev;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HEADER_SIZE;

    #[test]
    fn filing_uses_the_capacity_lower_bound() {
        assert_eq!(MIN_CLASS, class_of(16));
        assert_eq!(MIN_CLASS, class_of(31));
        assert_eq!(5, class_of(32));
        assert_eq!(6, class_of(100));
        assert_eq!(MAX_CLASS - 1, class_of(1 << 31));
        assert_eq!(MAX_CLASS - 1, class_of((1 << 31) + 5));
    }

    #[test]
    fn lookups_start_at_the_ceiling_class() {
        assert_eq!(MIN_CLASS, search_class_of(1));
        assert_eq!(MIN_CLASS, search_class_of(16));
        assert_eq!(5, search_class_of(17));
        assert_eq!(7, search_class_of(100));
        assert_eq!(7, search_class_of(128));

        // A request on a class boundary is guaranteed by its own class; any
        // other request must look one class above where it would be filed.
        assert_eq!(class_of(64), search_class_of(64));
        assert_eq!(class_of(100) + 1, search_class_of(100));
    }

    #[test]
    fn class_capacity_floor() {
        assert_eq!(16, min_capacity_of_class(MIN_CLASS));
        assert_eq!(128, min_capacity_of_class(7));
    }

    #[repr(align(16))]
    struct Arena([u8; 1024]);

    unsafe fn region_at(arena: &mut Arena, offset: usize, total: usize) -> NonNull<Region> {
        unsafe {
            let region = NonNull::new(arena.0.as_mut_ptr().add(offset).cast::<Region>()).unwrap();
            Region::init(region, total);
            region
        }
    }

    #[test]
    fn insert_and_remove_keep_the_class_chain_linked() {
        let mut arena = Arena([0; 1024]);
        let total = HEADER_SIZE + 64;
        let class = class_of(64);

        unsafe {
            let a = region_at(&mut arena, 0, total);
            let b = region_at(&mut arena, 256, total);
            let c = region_at(&mut arena, 512, total);

            let mut list = FreeList::new();
            list.insert(a);
            list.insert(b);
            list.insert(c);

            // Most recently freed first.
            let head = list.head(class).unwrap();
            assert_eq!(c, Region::from_free_info(head));
            let second = head.as_ref().next.unwrap();
            assert_eq!(b, Region::from_free_info(second));

            list.remove(b);
            let head = list.head(class).unwrap();
            assert_eq!(c, Region::from_free_info(head));
            let second = head.as_ref().next.unwrap();
            assert_eq!(a, Region::from_free_info(second));
            assert_eq!(Some(head), second.as_ref().prev);

            list.remove(c);
            let head = list.head(class).unwrap();
            assert_eq!(a, Region::from_free_info(head));
            assert!(head.as_ref().prev.is_none());

            list.remove(a);
            assert!(list.head(class).is_none());
        }
    }
}
