//! Thread local storage.
//!
//! Encapsulates the per-thread [ThreadState] and the thread's binding to it.
//! A thread is bound (fiber-capable) exactly while it has live fibers.

use std::cell::{Cell, RefCell};

use super::ThreadState;

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Binding {
    state: RefCell<Option<ThreadState>>,
    /// Outlives individual bindings so stale handles never alias new fibers.
    generation: Cell<u64>,
}

impl Binding {
    const fn new() -> Self {
        Binding {
            state: RefCell::new(None),
            generation: Cell::new(0),
        }
    }
}

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent fiber state.
    static BINDING: Binding = const { Binding::new() };
}

#[cfg(not(feature = "fast_thread_local"))]
fn binding<T>(f: impl FnOnce(&Binding) -> T) -> T {
    BINDING.with(f)
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static BINDING: Binding = Binding::new();

#[cfg(feature = "fast_thread_local")]
fn binding<T>(f: impl FnOnce(&Binding) -> T) -> T {
    f(&BINDING)
}

/// Converts the thread into a fiber root on its first live fiber, then counts one more live fiber.
pub(super) fn bind() {
    binding(|binding| {
        let mut cell = binding.state.borrow_mut();
        let state = cell.get_or_insert_with(|| {
            log::debug!("binding thread {:?}", std::thread::current().id());
            ThreadState::new(binding.generation.get())
        });
        state.live += 1;
    });
}

/// Counts one less live fiber, converting the thread back once none remain.
pub(super) fn unbind() {
    let released = binding(|binding| {
        let mut cell = binding.state.borrow_mut();
        let state = cell.as_mut().expect("thread isn't bound to any fiber");
        state.live -= 1;
        if state.live > 0 {
            return None;
        }

        debug_assert_eq!(state.running, state.root, "unbinding from inside a fiber");
        binding.generation.set(state.next_generation);
        cell.take()
    });

    // dropped outside of the borrow, releases cached stacks
    if let Some(state) = released {
        log::debug!("unbinding thread {:?}", std::thread::current().id());
        drop(state);
    }
}

/// Borrow the bound thread's state.
///
/// # Panics
/// If the thread has no live fibers.
pub(super) fn with<T>(f: impl FnOnce(&mut ThreadState) -> T) -> T {
    binding(|binding| {
        let mut cell = binding.state.borrow_mut();
        let state = cell.as_mut().expect("thread isn't bound to any fiber");
        f(state)
    })
}

/// Borrow the thread's state if it's bound.
pub(super) fn try_with<T>(f: impl FnOnce(&mut ThreadState) -> T) -> Option<T> {
    binding(|binding| {
        let mut cell = binding.state.borrow_mut();
        cell.as_mut().map(f)
    })
}
