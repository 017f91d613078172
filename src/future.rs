//! Bridges synchronous code and futures.
//!
//! [stackful] turns a synchronous closure into a [Future] by running it on its own fiber.
//! Inside that closure, [wait] awaits any future by suspending the whole fiber, so the executor
//! polling the outer future sees [Poll::Pending] instead of a blocked thread.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::{pin, Pin};
use std::ptr::NonNull;
use std::task::{Context, Poll, Waker};

use waker_fn::waker_fn;

use crate::generator::{Generator, GeneratorState, StackfulGenerator, YieldHandle};

/// Body of the [stackful] closure that is running right now.
struct Frame {
    handle: *const YieldHandle<(), Waker>,
    /// Waker of the poll that last resumed the body.
    waker: RefCell<Waker>,
}

thread_local! {
    static CURRENT: Cell<Option<NonNull<Frame>>> = const { Cell::new(None) };
}

/// Waits for a future to complete and returns its output.
///
/// Called (directly or transitively) from a [stackful] closure, suspends that closure until
/// [future] makes progress. Anywhere else, blocks the thread like [block_on].
///
/// ```
/// let output = stackful::block_on(stackful::stackful(|| {
///     let a = stackful::wait(async { 1 });
///     let b = stackful::wait(async { 2 });
///     a + b
/// }));
///
/// assert_eq!(output, 3);
/// ```
pub fn wait<T>(future: impl Future<Output = T>) -> T {
    let Some(frame) = CURRENT.with(Cell::get) else {
        return block_on(future);
    };

    let mut future = pin!(future);
    loop {
        // safety: CURRENT only points at the frame of the running body
        let frame = unsafe { frame.as_ref() };

        let waker = frame.waker.borrow().clone();
        if let Poll::Ready(output) = future.as_mut().poll(&mut Context::from_waker(&waker)) {
            return output;
        }

        // safety: the handle outlives the body it was handed to
        let handle = unsafe { &*frame.handle };
        let waker = handle.yield_(());

        *frame.waker.borrow_mut() = waker;
        CURRENT.with(|current| current.set(Some(NonNull::from(frame))));
    }
}

/// Restores the frame of whatever body was running before a [StackfulFuture::poll].
struct RestoreCurrent(Option<NonNull<Frame>>);

impl Drop for RestoreCurrent {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.0));
    }
}

/// [Future] running a synchronous closure on its own fiber, see [stackful].
#[must_use = "futures do nothing unless polled"]
pub struct StackfulFuture<'a, T> {
    generator: StackfulGenerator<'a, (), T, Waker>,
}

impl<'a, T> StackfulFuture<'a, T> {
    /// Sets up [f] to run on a fiber with the default stack size.
    ///
    /// # Panics
    /// If the stack can't be allocated.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> T + 'a,
    {
        let generator = StackfulGenerator::new(move |handle: &YieldHandle<(), Waker>, waker: Waker| {
            let frame = Frame {
                handle,
                waker: RefCell::new(waker),
            };
            CURRENT.with(|current| current.set(Some(NonNull::from(&frame))));

            f()
        });

        StackfulFuture { generator }
    }
}

impl<T> Future for StackfulFuture<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let _restore = RestoreCurrent(CURRENT.with(Cell::get));

        match Pin::new(&mut this.generator).resume(cx.waker().clone()) {
            GeneratorState::Yielded(()) => Poll::Pending,
            GeneratorState::Complete(output) => Poll::Ready(output),
        }
    }
}

/// Turns a synchronous closure into a [Future].
///
/// Pairs with [wait] to call async code from sync code called from async code, nested to any depth.
///
/// # Panics
/// If the fiber's stack can't be allocated.
pub fn stackful<'a, T>(f: impl FnOnce() -> T + 'a) -> StackfulFuture<'a, T> {
    StackfulFuture::new(f)
}

/// Runs a future to completion on the current thread, parking it while the future is pending.
///
/// # Examples
///
/// ### Run on current thread
/// ```
/// assert_eq!(stackful::block_on(async { 7 }), 7);
/// ```
///
/// ### Run on new thread
/// ```
/// std::thread::spawn(|| {
///     stackful::block_on(async {});
/// }).join().unwrap();
/// ```
pub fn block_on<T>(future: impl Future<Output = T>) -> T {
    let (parker, unparker) = parking::pair();

    let waker = waker_fn(move || {
        unparker.unpark();
    });

    let mut cx = Context::from_waker(&waker);

    let mut future = pin!(future);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => parker.park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::fiber;

    /// Pending a fixed number of times, waking immediately each time.
    struct YieldTimes(u32);

    impl Future for YieldTimes {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 == 0 {
                return Poll::Ready(());
            }
            self.0 -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    fn yield_now() -> YieldTimes {
        YieldTimes(1)
    }

    mod stackful {
        use super::*;

        #[test]
        fn returns_output() {
            let output = block_on(stackful(|| 42));

            assert_eq!(output, 42);
            assert!(!fiber::is_bound());
        }

        #[test]
        fn pending_while_waiting() {
            let waker = noop_waker::noop_waker();
            let mut cx = Context::from_waker(&waker);
            let mut future = stackful(|| {
                wait(yield_now());
                wait(yield_now());
                "done"
            });

            assert_eq!(Pin::new(&mut future).poll(&mut cx), Poll::Pending);
            assert_eq!(Pin::new(&mut future).poll(&mut cx), Poll::Pending);
            assert_eq!(Pin::new(&mut future).poll(&mut cx), Poll::Ready("done"));
            assert!(CURRENT.with(Cell::get).is_none());
        }

        #[test]
        fn returns_borrowed_output() {
            let data = String::from("borrowed output");

            let output = block_on(stackful(|| {
                wait(yield_now());
                &data[..8]
            }));

            assert_eq!(output, "borrowed");
        }

        #[test]
        fn borrows_from_environment() {
            let mut visited = Vec::new();

            block_on(stackful(|| {
                visited.push(1);
                wait(yield_now());
                visited.push(2);
            }));

            assert_eq!(visited, [1, 2]);
        }

        #[test]
        fn nests() {
            let output = block_on(stackful(|| {
                let inner = wait(stackful(|| {
                    wait(yield_now());
                    wait(stackful(|| {
                        wait(yield_now());
                        1
                    })) + 1
                }));
                wait(yield_now());
                inner + 1
            }));

            assert_eq!(output, 3);
            assert!(CURRENT.with(Cell::get).is_none());
        }

        #[test]
        fn propagates_panic() {
            let result = panic::catch_unwind(|| {
                block_on(stackful(|| {
                    wait(yield_now());
                    panic!("boom");
                }))
            });

            let payload = result.unwrap_err();
            assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
            assert!(CURRENT.with(Cell::get).is_none());
        }

        #[test]
        fn drop_before_polling() {
            drop(stackful(|| {
                wait(yield_now());
            }));

            assert!(!fiber::is_bound());
        }

        #[test]
        fn drop_after_polling() {
            let alive = Rc::new(());
            let waker = noop_waker::noop_waker();
            let mut cx = Context::from_waker(&waker);
            let mut future = Box::pin(stackful({
                let alive = alive.clone();
                move || {
                    let _alive = alive;
                    wait(yield_now());
                }
            }));
            let _ = future.as_mut().poll(&mut cx);
            assert_eq!(Rc::strong_count(&alive), 2);

            drop(future);

            assert_eq!(Rc::strong_count(&alive), 1);
            assert!(CURRENT.with(Cell::get).is_none());
            assert!(!fiber::is_bound());
        }

        #[test]
        fn wakes_latest_waker() {
            let woken = Arc::new(AtomicUsize::new(0));
            let counting = waker_fn({
                let woken = woken.clone();
                move || {
                    woken.fetch_add(1, Ordering::SeqCst);
                }
            });
            let noop = noop_waker::noop_waker();
            let mut future = stackful(|| wait(YieldTimes(2)));

            assert!(Pin::new(&mut future).poll(&mut Context::from_waker(&noop)).is_pending());
            assert_eq!(woken.load(Ordering::SeqCst), 0);
            assert!(Pin::new(&mut future).poll(&mut Context::from_waker(&counting)).is_pending());
            assert_eq!(woken.load(Ordering::SeqCst), 1);
            assert!(Pin::new(&mut future).poll(&mut Context::from_waker(&counting)).is_ready());
        }
    }

    mod wait {
        use super::*;

        #[test]
        fn blocks_outside_of_fiber() {
            wait(yield_now());

            assert_eq!(wait(async { 5 }), 5);
            assert!(!fiber::is_bound());
        }

        #[test]
        fn blocks_in_plain_fiber() {
            let f = fiber::create().unwrap();

            let result: fiber::SwitchResult<&str> = fiber::enter(f, (), |caller, ()| {
                wait(yield_now());
                fiber::switch::<_, ()>(caller, "after wait");
            });

            assert_eq!(result.payload, "after wait");
            fiber::destroy(f);
        }
    }
}
