//! Resumable producers running on their own fiber.
//!
//! Unlike [fiber::enter], the body of a [StackfulGenerator] may borrow from its environment:
//! the generator owns its fiber and unwinds it before the borrow ends.

use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::{panic, thread};

use crate::fiber::{self, ExecutionContext, State, Transfer};

/// The result of a generator resumption.
#[derive(Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Debug, Hash)]
pub enum GeneratorState<Y, R> {
    /// The generator suspended with a value.
    Yielded(Y),
    /// The generator completed with a return value.
    Complete(R),
}

/// Resumable computation yielding [Generator::Yield]s until it returns a [Generator::Return].
pub trait Generator<Resume = ()> {
    /// Type of the values the generator yields.
    type Yield;
    /// Type of the value the generator returns.
    type Return;

    /// Runs the generator until its next yield or its return, handing it [arg].
    ///
    /// # Panics
    /// Implementations may panic when resumed after completing.
    fn resume(self: Pin<&mut Self>, arg: Resume) -> GeneratorState<Self::Yield, Self::Return>;
}

type Body<'a, Y, R, Resume> = Box<dyn FnOnce(&YieldHandle<Y, Resume>, Resume) -> R + 'a>;

/// [Generator] whose body is an ordinary closure with a stack of its own.
///
/// The body receives a [YieldHandle] and the first resume argument:
/// ```
/// use std::pin::Pin;
/// use stackful::generator::{Generator, GeneratorState, StackfulGenerator, YieldHandle};
///
/// let mut sum = 0;
/// let mut adder = StackfulGenerator::new(|y: &YieldHandle<u32, u32>, mut n: u32| {
///     while n > 0 {
///         sum += n;
///         n = y.yield_(sum);
///     }
/// });
///
/// assert_eq!(Pin::new(&mut adder).resume(2), GeneratorState::Yielded(2));
/// assert_eq!(Pin::new(&mut adder).resume(3), GeneratorState::Yielded(5));
/// assert_eq!(Pin::new(&mut adder).resume(0), GeneratorState::Complete(()));
/// drop(adder);
/// assert_eq!(sum, 5);
/// ```
///
/// Generators stay on the thread that created them:
/// ```compile_fail
/// use stackful::generator::{StackfulGenerator, YieldHandle};
///
/// let generator = StackfulGenerator::new(|_: &YieldHandle<()>, ()| {});
/// std::thread::spawn(move || drop(generator));
/// ```
pub struct StackfulGenerator<'a, Y, R, Resume = ()> {
    context: ExecutionContext,
    /// Where the body last yielded from, usually [Self::context].
    resume_into: ExecutionContext,
    func: Option<Body<'a, Y, R, Resume>>,
    /// Return value of the body, set right before it finishes.
    output: Rc<Cell<Option<R>>>,
    completed: bool,
    _marker: PhantomData<fn(Resume) -> (Y, R)>,
}

// the body lives on its own stack, moving the generator moves handles only
impl<Y, R, Resume> Unpin for StackfulGenerator<'_, Y, R, Resume> {}

impl<'a, Y, R, Resume> StackfulGenerator<'a, Y, R, Resume> {
    /// Sets up a generator with the default stack size.
    ///
    /// # Panics
    /// If the stack can't be allocated, see [StackfulGenerator::try_new].
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&YieldHandle<Y, Resume>, Resume) -> R + 'a,
    {
        Self::try_new(f).unwrap_or_else(|error| panic!("{error}"))
    }

    /// Sets up a generator with the default stack size.
    pub fn try_new<F>(f: F) -> crate::Result<Self>
    where
        F: FnOnce(&YieldHandle<Y, Resume>, Resume) -> R + 'a,
    {
        Self::with_stack_size(fiber::DEFAULT_STACK_SIZE, f)
    }

    /// Sets up a generator whose body gets [bytes] of stack, rounded up to whole pages.
    pub fn with_stack_size<F>(bytes: usize, f: F) -> crate::Result<Self>
    where
        F: FnOnce(&YieldHandle<Y, Resume>, Resume) -> R + 'a,
    {
        let context = fiber::Builder::new().stack_size(bytes).create()?;
        fiber::adopt(context);

        Ok(StackfulGenerator {
            context,
            resume_into: context,
            func: Some(Box::new(f)),
            output: Rc::new(Cell::new(None)),
            completed: false,
            _marker: PhantomData,
        })
    }

    /// Whether the body returned or panicked.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    fn start(&self, func: Body<'a, Y, R, Resume>, arg: Resume) -> (ExecutionContext, Transfer) {
        let output = self.output.clone();
        let entry = Box::new(move |resumer: ExecutionContext| {
            let handle = YieldHandle {
                resumer: Cell::new(resumer),
                _marker: PhantomData,
            };
            let _finish = FinishInto(&handle);
            output.set(Some(func(&handle, arg)));
            Box::new(()) as Box<dyn Any>
        });

        // safety: the fiber only runs through this generator, and Drop unwinds it before 'a ends
        unsafe { fiber::enter_unchecked(self.context, entry) }
    }
}

/// Finishes a body into whoever resumed it last, even if a nested body yielded on its behalf.
struct FinishInto<'h, Y, Resume>(&'h YieldHandle<Y, Resume>);

impl<Y, Resume> Drop for FinishInto<'_, Y, Resume> {
    fn drop(&mut self) {
        fiber::designate_return_to(self.0.resumer.get());
    }
}

impl<Y, R, Resume> Generator<Resume> for StackfulGenerator<'_, Y, R, Resume> {
    type Yield = Y;
    type Return = R;

    /// # Panics
    /// If the generator already completed, or with the body's own panic.
    fn resume(self: Pin<&mut Self>, arg: Resume) -> GeneratorState<Y, R> {
        let this = self.get_mut();
        assert!(!this.completed, "resumed a completed generator");

        let (from, received) = match this.func.take() {
            Some(func) => this.start(func, arg),
            None => fiber::switch_unchecked(this.resume_into, arg),
        };

        match received {
            Transfer::Returned(_) if from == this.context => {
                this.completed = true;
                match this.output.take() {
                    Some(output) => GeneratorState::Complete(output),
                    None => panic!("generator body returned without output"),
                }
            }
            Transfer::Panicked(payload) => {
                this.completed |= from == this.context;
                panic::resume_unwind(payload)
            }
            received => {
                // safety: only handles of this generator switch into its resumer unchecked
                let value = unsafe { received.into_payload_unchecked() };
                this.resume_into = from;
                GeneratorState::Yielded(value)
            }
        }
    }
}

impl<Y, R, Resume> Drop for StackfulGenerator<'_, Y, R, Resume> {
    fn drop(&mut self) {
        // a nested body that yielded on our behalf goes first, it lives on our stack
        let nested = self.resume_into;
        if nested != self.context
            && !thread::panicking()
            && nested.state() == Some(State::Suspended)
            && !fiber::unwind(nested)
        {
            log::warn!("generator body caught its own unwind, leaking its locals");
        }

        fiber::destroy_owned(self.context);
    }
}

impl<Y> Iterator for StackfulGenerator<'_, Y, (), ()> {
    type Item = Y;

    fn next(&mut self) -> Option<Y> {
        if self.completed {
            return None;
        }

        match Pin::new(self).resume(()) {
            GeneratorState::Yielded(value) => Some(value),
            GeneratorState::Complete(()) => None,
        }
    }
}

/// Lets a generator body suspend itself.
pub struct YieldHandle<Y, Resume = ()> {
    resumer: Cell<ExecutionContext>,
    _marker: PhantomData<fn(Y) -> Resume>,
}

impl<Y, Resume> YieldHandle<Y, Resume> {
    /// Suspends the body, making the pending [Generator::resume] return [GeneratorState::Yielded].
    /// Returns the argument of the next resume.
    pub fn yield_(&self, value: Y) -> Resume {
        let (from, received) = fiber::switch_unchecked(self.resumer.get(), value);
        self.resumer.set(from);
        // safety: only the generator owning this handle resumes its body unchecked
        unsafe { received.into_payload_unchecked() }
    }
}
