//! Stackful execution contexts pinned to the current thread.
//!
//! A fiber is created [fresh](State::Fresh), started once with [enter], and thereafter resumed
//! with [switch]. Every transfer is a symmetric rendezvous: the caller names the context to run
//! next and hands it a payload, then stays suspended until some context switches back into it.
//!
//! ```
//! use stackful::fiber::{self, SwitchResult};
//!
//! let f = fiber::create().unwrap();
//!
//! let result: SwitchResult<String> = fiber::enter(f, String::from("hello"), |caller, arg: String| {
//!     fiber::switch::<_, ()>(caller, arg + "!");
//! });
//!
//! assert_eq!(result.from, f);
//! assert_eq!(result.payload, "hello!");
//!
//! fiber::destroy(f);
//! assert!(!fiber::is_bound());
//! ```

use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::{fmt, io, thread};

use context_switch::Continuation;

mod context_switch;
pub(crate) mod stack;
mod tls;

/// Usable stack size of a fiber unless configured otherwise.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Inaccessible pages below each stack, turning overflows into segmentation faults.
pub const DEFAULT_GUARD_PAGES: usize = 1;

/// Released stacks kept per thread for reuse while the thread stays bound.
const STACK_CACHE_CAPACITY: usize = 16;

/// Handle to a stackful, resumable unit of execution.
///
/// Handles are cheap to copy and compare. They are bound to the thread that created them:
/// ```compile_fail
/// let f = stackful::fiber::create().unwrap();
/// std::thread::spawn(move || stackful::fiber::destroy(f));
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionContext {
    id: FiberId,
    _thread_bound: PhantomData<*const ()>,
}

impl ExecutionContext {
    fn new(id: FiberId) -> Self {
        ExecutionContext {
            id,
            _thread_bound: PhantomData,
        }
    }

    /// Current lifecycle state, [None] once destroyed.
    pub fn state(self) -> Option<State> {
        tls::try_with(|state| state.get(self.id).map(|fiber| fiber.state)).flatten()
    }

    /// Whether this is the thread itself rather than a created fiber.
    pub fn is_root(self) -> bool {
        tls::try_with(|state| state.root == self.id).unwrap_or(false)
    }

    /// Bytes available to the fiber's frames, [None] for the thread root or once destroyed.
    pub fn stack_size(self) -> Option<usize> {
        tls::try_with(|state| {
            let fiber = state.get(self.id)?;
            fiber.stack.as_ref().map(stack::Stack::usable_size)
        })
        .flatten()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExecutionContext")
            .field(&self.id.index)
            .field(&self.id.generation)
            .finish()
    }
}

/// Lifecycle of an [ExecutionContext].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Created, never entered.
    Fresh,
    /// Entered at least once, not currently executing.
    Suspended,
    /// Currently executing on its thread.
    Running,
    /// The entry function returned or panicked, only [destroy] remains.
    Finished,
}

/// Outcome of a transfer back into the caller.
#[derive(Debug)]
pub struct SwitchResult<P> {
    /// Context that switched into the caller.
    pub from: ExecutionContext,
    /// What it sent along.
    pub payload: P,
}

/// Configuration for new fibers.
#[derive(Debug, Clone)]
pub struct Builder {
    stack_size: usize,
    guard_pages: NonZeroUsize,
}

impl Builder {
    /// Default stack geometry.
    pub fn new() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: NonZeroUsize::new(DEFAULT_GUARD_PAGES).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Usable stack size in bytes, rounded up to whole pages.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Guard pages below the stack, at least one.
    pub fn guard_pages(mut self, pages: usize) -> Self {
        self.guard_pages = NonZeroUsize::new(pages).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Allocates a new, unstarted fiber on the current thread.
    pub fn create(self) -> crate::Result<ExecutionContext> {
        let usable_pages = stack::pages_for(self.stack_size);

        tls::bind();
        let result = tls::with(|state| state.create_fiber(self.guard_pages, usable_pages));

        result.map_err(|error| {
            tls::unbind();
            crate::Error::StackAllocation(error)
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

/// Allocates a new, unstarted fiber on the current thread with the default stack size.
///
/// The first fiber converts the thread itself into a context that fibers can switch back into.
pub fn create() -> crate::Result<ExecutionContext> {
    Builder::new().create()
}

/// Releases a fiber's stack.
///
/// A suspended fiber is first unwound from its last switch, dropping its locals.
/// While the thread is already panicking they are leaked instead.
/// Destroying the last fiber converts the thread back to normal.
///
/// # Panics
/// If [context] is running, is the thread root, or was already destroyed.
pub fn destroy(context: ExecutionContext) {
    destroy_with(context, Access::Public);
}

/// [destroy] on behalf of whoever [adopted](adopt) the context.
pub(crate) fn destroy_owned(context: ExecutionContext) {
    destroy_with(context, Access::Owner);
}

fn destroy_with(context: ExecutionContext, access: Access) {
    let suspended = tls::with(|state| state.check_destroy(context.id, access)) == State::Suspended;

    // a second panic while unwinding would abort
    if suspended && !thread::panicking() && !unwind(context) {
        log::warn!("fiber {context:?} caught its forced unwind, leaking its locals");
    }

    tls::with(|state| state.destroy_fiber(context.id, access));
    tls::unbind();
}

/// Starts a fresh fiber by running [function] on it with the caller's handle and [payload].
///
/// Returns once some context switches back into the caller, possibly because [function] returned.
/// In that case the fiber is [finished](State::Finished) and the payload is [function]'s output.
///
/// # Panics
/// If [target] isn't fresh, if the received payload isn't an [R],
/// or with the fiber's own panic if it finished by panicking.
pub fn enter<T, R, F, U>(target: ExecutionContext, payload: T, function: F) -> SwitchResult<R>
where
    T: 'static,
    R: 'static,
    F: FnOnce(ExecutionContext, T) -> U + 'static,
    U: 'static,
{
    let entry: Entry = Box::new(move |caller| Box::new(function(caller, payload)) as Box<dyn Any>);
    let (from, received) = transfer(target, Transfer::Enter, Some(entry), Access::Public);
    SwitchResult {
        from,
        payload: received.into_payload(),
    }
}

/// Like [enter] on an [adopted](adopt) context, for an entry that may borrow for 'a.
///
/// # Safety
/// The fiber must never run again once 'a ends.
pub(crate) unsafe fn enter_unchecked<'a>(
    target: ExecutionContext,
    entry: Box<dyn FnOnce(ExecutionContext) -> Box<dyn Any> + 'a>,
) -> (ExecutionContext, Transfer) {
    let entry: Entry = std::mem::transmute(entry);
    transfer(target, Transfer::Enter, Some(entry), Access::Owner)
}

/// Suspends the running context and resumes [target], handing it [payload].
///
/// Returns once some context switches back into the caller.
///
/// # Panics
/// If [target] is running, fresh, finished, or destroyed, if the received payload isn't an [R],
/// or with a fiber's own panic if it finished by panicking.
pub fn switch<T: 'static, R: 'static>(target: ExecutionContext, payload: T) -> SwitchResult<R> {
    let (from, received) = send(target, payload, Some(TypeId::of::<T>()), Access::Public);
    SwitchResult {
        from,
        payload: received.into_payload(),
    }
}

/// [switch] on behalf of the owner of [target], without type information and without
/// interpreting what comes back. See [Transfer::into_payload_unchecked].
pub(crate) fn switch_unchecked<T>(target: ExecutionContext, payload: T) -> (ExecutionContext, Transfer) {
    send(target, payload, None, Access::Owner)
}

fn send<T>(
    target: ExecutionContext,
    payload: T,
    type_id: Option<TypeId>,
    access: Access,
) -> (ExecutionContext, Transfer) {
    // lives on this stack until the receiver moves it out
    let mut payload = ManuallyDrop::new(payload);
    let sent = Transfer::Value {
        value: &mut *payload as *mut T as *mut (),
        type_id,
        type_name: type_name::<T>(),
    };
    transfer(target, sent, None, access)
}

/// Unwinds a suspended fiber's stack, running destructors, until it finishes.
///
/// Returns whether the fiber finished, it may catch the unwind and switch back instead.
pub(crate) fn unwind(target: ExecutionContext) -> bool {
    let (_, received) = transfer(target, Transfer::Unwind, None, Access::Owner);
    matches!(received, Transfer::Unwound) && target.state() == Some(State::Finished)
}

/// Designates where the running fiber switches to once its entry function returns or panics.
///
/// Without a designation, or if the designated context is gone or running,
/// it goes to the context that most recently switched into it, else to the thread root.
///
/// # Panics
/// If called from the thread root or from inside a generator, or [target] was destroyed.
pub fn set_return_to(target: ExecutionContext) {
    tls::with(|state| {
        let running = state.running;
        assert_ne!(running, state.root, "the thread root has no entry function to return from");
        state.check_access(running, Access::Public);
        state.check_access(target.id, Access::Public);
        state.fibers[running.index].return_to = Some(target.id);
    });
}

/// [set_return_to] for the [adopted](adopt) running context.
/// Never panics, a [target] destroyed in the meantime is skipped when the context finishes.
pub(crate) fn designate_return_to(target: ExecutionContext) {
    tls::with(|state| {
        let running = state.running;
        state.fibers[running.index].return_to = Some(target.id);
    });
}

/// Reserves [context] for crate internals that hand out borrows into its stack.
/// Public [switch], [enter], [destroy] and [set_return_to] refuse it from now on.
pub(crate) fn adopt(context: ExecutionContext) {
    tls::with(|state| state.get_mut(context.id).owned = true);
}

/// Context that is running right now, [None] if the thread has no fibers.
pub fn current() -> Option<ExecutionContext> {
    tls::try_with(|state| ExecutionContext::new(state.running))
}

/// Fibers alive on the current thread, not counting the thread itself.
pub fn live_count() -> usize {
    tls::try_with(|state| state.live).unwrap_or(0)
}

/// Whether the current thread has been converted to host fibers.
pub fn is_bound() -> bool {
    tls::try_with(|_| ()).is_some()
}

/// Marker unwinding a fiber on behalf of [unwind].
pub(crate) struct ForcedUnwind;

/// Who is asking for a transfer, see [adopt].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Access {
    Public,
    Owner,
}

/// Type erased first run of a fiber, [Box]ed output is delivered to its return-to context.
type Entry = Box<dyn FnOnce(ExecutionContext) -> Box<dyn Any>>;

/// What the switch slot carries between contexts.
pub(crate) enum Transfer {
    /// Moved out of the suspended sender's stack by the receiver.
    /// Untyped when sent by [switch_unchecked].
    Value {
        value: *mut (),
        type_id: Option<TypeId>,
        type_name: &'static str,
    },
    /// First entry, the argument travels inside the [Entry].
    Enter,
    /// Entry function's output.
    Returned(Box<dyn Any>),
    /// Entry function's panic.
    Panicked(Box<dyn Any + Send>),
    /// Request to unwind the receiver.
    Unwind,
    /// Acknowledges an [Transfer::Unwind] once the stack is unwound.
    Unwound,
}

impl Transfer {
    /// Interprets the transfer as a payload of type [R].
    pub(crate) fn into_payload<R: 'static>(self) -> R {
        match self {
            Transfer::Value {
                value,
                type_id,
                type_name: sent,
            } => {
                assert!(
                    type_id == Some(TypeId::of::<R>()),
                    "expected payload of type {}, received {sent}",
                    type_name::<R>(),
                );
                // safety: the sender is suspended and forgot its copy
                unsafe { (value as *mut R).read() }
            }
            Transfer::Returned(output) => match output.downcast::<R>() {
                Ok(output) => *output,
                Err(_) => panic!("expected payload of type {}, received fiber output", type_name::<R>()),
            },
            transfer => transfer.into_control(type_name::<R>()),
        }
    }

    /// Interprets the transfer as a payload of type [R] sent by [switch_unchecked].
    ///
    /// # Safety
    /// Every [switch_unchecked] that can reach the receiving context must send an [R].
    pub(crate) unsafe fn into_payload_unchecked<R>(self) -> R {
        match self {
            Transfer::Value {
                value, type_id: None, ..
            } => {
                // the sender is suspended and forgot its copy
                (value as *mut R).read()
            }
            Transfer::Value { type_name: sent, .. } => {
                panic!("expected payload of type {} from its owner, received {sent}", type_name::<R>())
            }
            Transfer::Returned(_) => {
                panic!("expected payload of type {}, received fiber output", type_name::<R>())
            }
            transfer => transfer.into_control(type_name::<R>()),
        }
    }

    /// Raises whatever a transfer that isn't a payload stands for.
    fn into_control(self, expected: &str) -> ! {
        match self {
            Transfer::Panicked(payload) => panic::resume_unwind(payload),
            Transfer::Unwind => panic::resume_unwind(Box::new(ForcedUnwind)),
            _ => panic!("expected payload of type {expected}, received control transfer"),
        }
    }
}

/// The single transfer primitive behind [enter], [switch] and [unwind].
fn transfer(
    target: ExecutionContext,
    sent: Transfer,
    entry: Option<Entry>,
    access: Access,
) -> (ExecutionContext, Transfer) {
    let (from, to) = tls::with(|state| state.prepare_transfer(target.id, sent, entry, access));

    unsafe { context_switch::jump(from, to) };

    // resumed by whoever switched into us
    tls::with(|state| {
        let from = state.switching_from.take().expect("resumed without a sender");
        let received = state.switching_payload.take().expect("resumed without a payload");
        (ExecutionContext::new(from), received)
    })
}

/// Where every fiber starts executing.
extern "C" fn trampoline() -> ! {
    let (caller, entry) = tls::with(|state| {
        let caller = state.switching_from.take().expect("entered without a caller");
        let _enter = state.switching_payload.take();
        let entry = state.entry.take().expect("entered without an entry payload");
        (ExecutionContext::new(caller), entry)
    });

    let output = panic::catch_unwind(AssertUnwindSafe(move || entry(caller)));
    let outcome = match output {
        Ok(output) => Transfer::Returned(output),
        Err(payload) if payload.is::<ForcedUnwind>() => Transfer::Unwound,
        Err(payload) => Transfer::Panicked(payload),
    };

    let unwound = matches!(outcome, Transfer::Unwound);
    let return_to = tls::with(|state| state.finish_running(unwound));
    transfer(ExecutionContext::new(return_to), outcome, None, Access::Owner);
    unreachable!("resumed a finished fiber");
}

/// Identifies a fiber within its thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct FiberId {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct FiberState {
    generation: u64,
    /// [None] for the thread root, which runs on the thread's own stack.
    stack: Option<stack::Stack>,
    continuation: Continuation,
    state: State,
    /// Context that most recently switched into this one.
    resumer: Option<FiberId>,
    /// Designated by [set_return_to].
    return_to: Option<FiberId>,
    /// Reserved by [adopt].
    owned: bool,
}

/// Everything a bound thread knows about its fibers.
pub(super) struct ThreadState {
    fibers: slab::Slab<FiberState>,
    root: FiberId,
    running: FiberId,
    live: usize,
    next_generation: u64,
    switching_from: Option<FiberId>,
    switching_payload: Option<Transfer>,
    entry: Option<Entry>,
    stack_cache: Vec<stack::Stack>,
}

impl ThreadState {
    fn new(generation: u64) -> Self {
        let mut fibers = slab::Slab::new();
        let index = fibers.insert(FiberState {
            generation,
            stack: None,
            continuation: Continuation::empty(),
            state: State::Running,
            resumer: None,
            return_to: None,
            owned: false,
        });
        let root = FiberId { index, generation };

        ThreadState {
            fibers,
            root,
            running: root,
            live: 0,
            next_generation: generation + 1,
            switching_from: None,
            switching_payload: None,
            entry: None,
            stack_cache: Vec::new(),
        }
    }

    fn get(&self, id: FiberId) -> Option<&FiberState> {
        self.fibers.get(id.index).filter(|fiber| fiber.generation == id.generation)
    }

    fn get_mut(&mut self, id: FiberId) -> &mut FiberState {
        match self.fibers.get_mut(id.index) {
            Some(fiber) if fiber.generation == id.generation => fiber,
            _ => panic!("execution context was destroyed"),
        }
    }

    fn check_access(&mut self, id: FiberId, access: Access) -> &mut FiberState {
        let fiber = self.get_mut(id);
        assert!(
            access == Access::Owner || !fiber.owned,
            "execution context is owned by a generator"
        );
        fiber
    }

    fn create_fiber(
        &mut self,
        guard_pages: NonZeroUsize,
        usable_pages: NonZeroUsize,
    ) -> io::Result<ExecutionContext> {
        let cached = self
            .stack_cache
            .iter()
            .position(|stack| stack.has_geometry(guard_pages, usable_pages));
        let stack = match cached {
            Some(position) => {
                log::trace!("reusing cached stack");
                self.stack_cache.swap_remove(position)
            }
            None => stack::Stack::new(guard_pages, usable_pages)?,
        };

        let continuation = unsafe { context_switch::prepare_stack(stack.base(), trampoline) };

        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.fibers.insert(FiberState {
            generation,
            stack: Some(stack),
            continuation,
            state: State::Fresh,
            resumer: None,
            return_to: None,
            owned: false,
        });

        let id = FiberId { index, generation };
        log::trace!("created fiber {id:?}");
        Ok(ExecutionContext::new(id))
    }

    /// Validates a [destroy] before anything happens to [id], returning its state.
    fn check_destroy(&mut self, id: FiberId, access: Access) -> State {
        assert_ne!(id, self.root, "can't destroy the thread's root context");
        assert_ne!(id, self.running, "can't destroy the running context");
        self.check_access(id, access).state
    }

    fn destroy_fiber(&mut self, id: FiberId, access: Access) {
        self.check_destroy(id, access);

        let fiber = self.fibers.remove(id.index);
        if let Some(stack) = fiber.stack {
            if self.stack_cache.len() < STACK_CACHE_CAPACITY {
                self.stack_cache.push(stack);
            }
        }

        log::trace!("destroyed fiber {id:?}");
    }

    /// Fills the switch slots and marks [target] running.
    /// Returns where to save the running context and where to resume.
    fn prepare_transfer(
        &mut self,
        target: FiberId,
        sent: Transfer,
        entry: Option<Entry>,
        access: Access,
    ) -> (*mut Continuation, *const Continuation) {
        let running = self.running;
        assert_ne!(target, running, "can't switch into the running context");

        let is_entry = entry.is_some();
        let fiber = self.check_access(target, access);
        match fiber.state {
            State::Fresh if !is_entry => panic!("fresh context must be entered before switching into it"),
            State::Suspended if is_entry => panic!("context was already entered"),
            State::Finished => panic!("can't switch into a finished context"),
            _ => {}
        }
        fiber.state = State::Running;
        fiber.resumer = Some(running);
        let to = &fiber.continuation as *const Continuation;

        let current = &mut self.fibers[running.index];
        if current.state == State::Running {
            current.state = State::Suspended;
        }
        let from = &mut current.continuation as *mut Continuation;

        self.switching_from = Some(running);
        self.switching_payload = Some(sent);
        self.entry = entry;
        self.running = target;

        (from, to)
    }

    /// Marks the running fiber finished and picks its return-to context.
    /// An [unwound] fiber acknowledges to whoever requested the unwind.
    fn finish_running(&mut self, unwound: bool) -> FiberId {
        let running = self.running;
        let fiber = &mut self.fibers[running.index];
        fiber.state = State::Finished;
        let designated = if unwound { None } else { fiber.return_to };
        let candidates = [designated, fiber.resumer];

        log::trace!("fiber {running:?} finished");

        candidates
            .into_iter()
            .flatten()
            .find(|&id| matches!(self.get(id), Some(fiber) if fiber.state == State::Suspended))
            .unwrap_or(self.root)
    }
}
