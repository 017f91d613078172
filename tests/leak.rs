//! Heap accounting across fiber lifecycles, in its own binary for the global allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use stackful::fiber::{self, SwitchResult};

/// Tracks bytes allocated and not yet freed by the current thread.
struct Counting;

thread_local! {
    static NET_BYTES: Cell<isize> = const { Cell::new(0) };
}

fn record(delta: isize) {
    let _ = NET_BYTES.try_with(|net| net.set(net.get() + delta));
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        record(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = System.realloc(ptr, layout, new_size);
        if !new.is_null() {
            record(new_size as isize - layout.size() as isize);
        }
        new
    }
}

#[global_allocator]
static ALLOCATOR: Counting = Counting;

fn destroy_while_suspended(i: u32) {
    let f = fiber::create().unwrap();
    let result: SwitchResult<u32> = fiber::enter(f, i, |caller, i: u32| {
        fiber::switch::<_, ()>(caller, i);
        unreachable!();
    });
    assert_eq!(result.payload, i);
    fiber::destroy(f);
}

#[test]
fn destroying_suspended_fibers_frees_their_heap() {
    // first use sets up thread locals and caches
    destroy_while_suspended(0);
    let before = NET_BYTES.with(Cell::get);

    for i in 0..10_000 {
        destroy_while_suspended(i);
    }

    let after = NET_BYTES.with(Cell::get);
    assert_eq!(after, before);
    assert!(!fiber::is_bound());
}
