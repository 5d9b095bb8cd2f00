//! Walks the allocator through its four operations against the real process
//! break. Run with `RUST_LOG=trace` to watch the engine's decisions.

use brkalloc::{Heap, SystemHeap};

fn log_alloc(what: &str, addr: *mut u8, size: usize) {
    println!("{what}: {size} bytes at {addr:?}");
}

fn main() {
    env_logger::init();

    let mut heap = Heap::new(SystemHeap::new());

    unsafe {
        let a = heap.allocate(100);
        log_alloc("allocate", a, 100);

        let b = heap.allocate_zeroed(8, 4);
        log_alloc("allocate_zeroed", b, 32);

        let a = heap.resize(a, 400);
        log_alloc("resize", a, 400);

        heap.release(b);
        let c = heap.allocate(24);
        log_alloc("allocate (reuses b)", c, 24);

        heap.release(a);
        heap.release(c);
    }
}
