//! # Stackful fibers on a single thread
//!
//! `stackful` creates independent execution contexts, each with its own call stack, and
//! transfers control between them cooperatively. Every transfer names the context to resume and
//! carries a payload; the suspended caller resumes exactly where it left off once some other
//! context switches back into it.
//!
//! The [fiber] module is the primitive: [fiber::create], [fiber::enter], [fiber::switch] and
//! [fiber::destroy]. Built on top of it:
//! - [generator] for resumable producers that borrow from their environment.
//! - [future] (feature `future`) to run synchronous code as a `Future` and to wait on a `Future`
//!   from synchronous code.
//!
//! ```
//! use std::pin::Pin;
//! use stackful::generator::{Generator, GeneratorState, StackfulGenerator, YieldHandle};
//!
//! let mut countdown = StackfulGenerator::new(|y: &YieldHandle<u32>, ()| {
//!     for i in (1..=3).rev() {
//!         y.yield_(i);
//!     }
//!     "liftoff"
//! });
//!
//! let mut countdown = Pin::new(&mut countdown);
//! assert!(matches!(countdown.as_mut().resume(()), GeneratorState::Yielded(3)));
//! assert!(matches!(countdown.as_mut().resume(()), GeneratorState::Yielded(2)));
//! assert!(matches!(countdown.as_mut().resume(()), GeneratorState::Yielded(1)));
//! assert!(matches!(countdown.as_mut().resume(()), GeneratorState::Complete("liftoff")));
//! ```

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]
#![warn(missing_docs)]

pub mod fiber;
pub mod generator;

#[cfg(feature = "future")]
pub mod future;
#[cfg(feature = "future")]
#[doc(inline)]
pub use future::{block_on, stackful, wait};

/// Failure to set up a fiber.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The OS refused to map a new stack.
    #[error("failed to allocate fiber stack")]
    StackAllocation(#[from] std::io::Error),
}

/// Shorthand for results carrying this crate's [Error].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::io;

    use super::*;

    #[test]
    fn error_keeps_os_source() {
        let error = Error::from(io::Error::from_raw_os_error(libc::ENOMEM));

        assert_eq!(error.to_string(), "failed to allocate fiber stack");
        let source = error.source().unwrap().downcast_ref::<io::Error>().unwrap();
        assert_eq!(source.raw_os_error(), Some(libc::ENOMEM));
    }
}
