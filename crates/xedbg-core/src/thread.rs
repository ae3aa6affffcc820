//! # Thread Debug Info
//!
//! One [`ThreadDebugInfo`] record per guest thread, created by the
//! thread-created notification and dropped by thread-destroyed (or by the
//! zombie sweep when a session is restored).
//!
//! ## Lifecycle
//!
//! ```text
//! Alive <-> Waiting        entering/leaving a kernel wait
//! Alive|Waiting -> Exited  thread-exit; record kept for inspection
//! Exited -> (removed)      thread-destroyed
//! other -> Zombie          thread-destroyed before exit; swept later
//! ```
//!
//! ## Suspension
//!
//! `suspended` is set only when the debugger itself issued the OS-level
//! suspend, and the debugger only ever resumes threads with the flag set. The
//! thread running debugger logic (see [`current_guest_thread`]) is never a
//! target.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::breakpoints::Breakpoint;
use crate::error::{protocol_violation, DebugError, DebugResult};
use crate::function::Function;
use crate::stack::{demangle_symbol, StackWalker};
use crate::types::{
    FrameLocation, GuestAddress, GuestContext, HostAddress, HostContext, NativeThreadHandle, ResolvedFrame,
    ThreadFrame, ThreadId,
};

thread_local! {
    static CURRENT_GUEST_THREAD: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Guest thread running on the calling OS thread, if any.
pub fn current_guest_thread() -> Option<ThreadId>
{
    CURRENT_GUEST_THREAD.with(Cell::get)
}

/// Mark the calling OS thread as running guest thread `id` until the
/// returned guard is dropped.
#[must_use = "the thread is only marked while the scope is alive"]
pub fn enter_guest_thread(id: ThreadId) -> GuestThreadScope
{
    let previous = CURRENT_GUEST_THREAD.with(|current| current.replace(Some(id)));
    GuestThreadScope { previous }
}

/// RAII guard returned by [`enter_guest_thread`].
#[derive(Debug)]
pub struct GuestThreadScope
{
    previous: Option<ThreadId>,
}

impl Drop for GuestThreadScope
{
    fn drop(&mut self)
    {
        CURRENT_GUEST_THREAD.with(|current| current.set(self.previous));
    }
}

/// A guest thread as seen by the debugger.
pub trait GuestThread: Send + Sync
{
    /// Guest thread id.
    fn id(&self) -> ThreadId;

    /// Handle of the backing OS thread.
    fn native_handle(&self) -> NativeThreadHandle;

    /// Host-only worker threads return `false` and are never suspended.
    fn can_debugger_suspend(&self) -> bool;

    /// Increment the suspend count. Returns the previous count.
    ///
    /// A thread suspending itself only records the request; it parks when it
    /// returns from the trap handler.
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::ThreadControl`] when the OS refuses.
    fn suspend(&self) -> DebugResult<u32>;

    /// Decrement the suspend count. Returns the remaining count.
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::ThreadControl`] when the OS refuses.
    fn resume(&self) -> DebugResult<u32>;

    /// Sampled guest register state.
    fn guest_context(&self) -> GuestContext;

    /// Whether the OS thread handle is still valid.
    fn is_valid(&self) -> bool;

    /// Guest entry point of the thread.
    fn start_address(&self) -> GuestAddress;
}

impl fmt::Debug for dyn GuestThread
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("GuestThread")
            .field("id", &self.id())
            .field("native_handle", &self.native_handle())
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState
{
    /// Running or runnable.
    Alive,
    /// Blocked in a kernel wait.
    Waiting,
    /// Returned from its entry point; record kept until destroyed.
    Exited,
    /// Destroyed without exiting; swept on restore.
    Zombie,
}

impl ThreadState
{
    /// Exited or zombie threads are never suspended, resumed or sampled.
    pub const fn is_dead(self) -> bool
    {
        matches!(self, Self::Exited | Self::Zombie)
    }
}

/// Debug state of one guest thread.
#[derive(Debug, Clone)]
pub struct ThreadDebugInfo
{
    pub(crate) thread_id: ThreadId,
    pub(crate) thread: Option<Arc<dyn GuestThread>>,
    pub(crate) native_handle: NativeThreadHandle,
    pub(crate) state: ThreadState,
    pub(crate) suspended: bool,
    pub(crate) guest_context: GuestContext,
    pub(crate) host_context: HostContext,
    pub(crate) frames: Vec<ThreadFrame>,
    pub(crate) step_breakpoint: Option<Arc<Breakpoint>>,
}

impl ThreadDebugInfo
{
    fn new(thread: Arc<dyn GuestThread>) -> Self
    {
        Self {
            thread_id: thread.id(),
            native_handle: thread.native_handle(),
            thread: Some(thread),
            state: ThreadState::Alive,
            suspended: false,
            guest_context: GuestContext::default(),
            host_context: HostContext::default(),
            frames: Vec::new(),
            step_breakpoint: None,
        }
    }

    /// Guest thread id.
    pub fn thread_id(&self) -> ThreadId
    {
        self.thread_id
    }

    /// The thread object, until it is destroyed.
    pub fn thread(&self) -> Option<&Arc<dyn GuestThread>>
    {
        self.thread.as_ref()
    }

    /// Handle of the backing OS thread.
    pub fn native_handle(&self) -> NativeThreadHandle
    {
        self.native_handle
    }

    /// Lifecycle state.
    pub fn state(&self) -> ThreadState
    {
        self.state
    }

    /// Whether the debugger holds a suspension on the thread.
    pub fn is_suspended(&self) -> bool
    {
        self.suspended
    }

    /// Guest registers captured at the last pause.
    pub fn guest_context(&self) -> &GuestContext
    {
        &self.guest_context
    }

    /// Host registers captured at the last pause.
    pub fn host_context(&self) -> &HostContext
    {
        &self.host_context
    }

    /// Stack captured at the last pause, innermost first.
    pub fn frames(&self) -> &[ThreadFrame]
    {
        &self.frames
    }

    /// Pending one-shot step breakpoint.
    pub fn step_breakpoint(&self) -> Option<&Arc<Breakpoint>>
    {
        self.step_breakpoint.as_ref()
    }

    /// Innermost guest frame.
    pub fn first_guest_frame(&self) -> Option<&ThreadFrame>
    {
        self.frames.iter().find(|frame| frame.is_guest())
    }

    fn live_thread(&self) -> DebugResult<&Arc<dyn GuestThread>>
    {
        match (&self.thread, self.state.is_dead()) {
            (Some(thread), false) => Ok(thread),
            _ => Err(DebugError::ThreadControl {
                thread: self.thread_id,
                reason: format!("thread is {:?}", self.state),
            }),
        }
    }
}

/// Table of thread records, keyed and ordered by thread id.
#[derive(Debug, Default)]
pub struct ThreadTable
{
    records: BTreeMap<ThreadId, ThreadDebugInfo>,
}

impl ThreadTable
{
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add a record for a newly created thread. Returns the stale record it
    /// replaced, if the id was reused.
    pub fn insert(&mut self, thread: Arc<dyn GuestThread>) -> Option<ThreadDebugInfo>
    {
        self.records.insert(thread.id(), ThreadDebugInfo::new(thread))
    }

    /// Record for `id`.
    pub fn get(&self, id: ThreadId) -> Option<&ThreadDebugInfo>
    {
        self.records.get(&id)
    }

    /// Mutable record for `id`.
    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadDebugInfo>
    {
        self.records.get_mut(&id)
    }

    /// Remove the record for `id`.
    pub fn remove(&mut self, id: ThreadId) -> Option<ThreadDebugInfo>
    {
        self.records.remove(&id)
    }

    /// Iterate records in thread id order.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadDebugInfo>
    {
        self.records.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadDebugInfo>
    {
        self.records.values_mut()
    }

    /// Number of records, including exited and zombie threads.
    pub fn len(&self) -> usize
    {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool
    {
        self.records.is_empty()
    }

    fn eligible(record: &ThreadDebugInfo, current: Option<ThreadId>) -> Option<Arc<dyn GuestThread>>
    {
        if record.state.is_dead() || current == Some(record.thread_id) {
            return None;
        }
        let thread = record.thread.as_ref()?;
        thread.can_debugger_suspend().then(|| Arc::clone(thread))
    }

    /// Suspend every live, suspendable thread the debugger has not suspended
    /// yet, except the calling thread. Returns how many were suspended.
    pub fn suspend_all(&mut self) -> usize
    {
        self.suspend_all_except(None)
    }

    /// [`suspend_all`](Self::suspend_all), additionally skipping `except`
    /// (the thread that trapped).
    pub fn suspend_all_except(&mut self, except: Option<ThreadId>) -> usize
    {
        let current = current_guest_thread();
        let mut count = 0;
        for record in self.records.values_mut() {
            if record.suspended || except == Some(record.thread_id) {
                continue;
            }
            let Some(thread) = Self::eligible(record, current) else {
                continue;
            };
            match thread.suspend() {
                Ok(previous) => {
                    trace!(thread = %record.thread_id, previous, "thread suspended");
                    record.suspended = true;
                    count += 1;
                }
                Err(err) => warn!(thread = %record.thread_id, error = %err, "failed to suspend thread"),
            }
        }
        count
    }

    /// Resume every thread the debugger suspended, except the calling thread.
    /// Returns how many were resumed.
    pub fn resume_all(&mut self) -> usize
    {
        let current = current_guest_thread();
        let mut count = 0;
        for record in self.records.values_mut() {
            if !record.suspended {
                continue;
            }
            let Some(thread) = Self::eligible(record, current) else {
                continue;
            };
            match thread.resume() {
                Ok(remaining) => {
                    trace!(thread = %record.thread_id, remaining, "thread resumed");
                    record.suspended = false;
                    count += 1;
                }
                Err(err) => warn!(thread = %record.thread_id, error = %err, "failed to resume thread"),
            }
        }
        count
    }

    fn target(&mut self, id: ThreadId) -> DebugResult<&mut ThreadDebugInfo>
    {
        if current_guest_thread() == Some(id) {
            protocol_violation("a thread cannot suspend or resume itself through the debugger");
        }
        self.records.get_mut(&id).ok_or(DebugError::UnknownThread(id))
    }

    /// Suspend a single thread.
    ///
    /// ## Errors
    ///
    /// Fails for unknown or dead threads, or when the OS refuses.
    pub fn suspend_thread(&mut self, id: ThreadId) -> DebugResult<()>
    {
        let record = self.target(id)?;
        if record.suspended {
            return Ok(());
        }
        record.live_thread()?.suspend()?;
        record.suspended = true;
        Ok(())
    }

    /// Resume a single thread the debugger suspended. Returns the remaining
    /// suspend count (zero when the thread is now runnable).
    ///
    /// ## Errors
    ///
    /// Fails for unknown or dead threads, or when the OS refuses.
    pub fn resume_thread(&mut self, id: ThreadId) -> DebugResult<u32>
    {
        let record = self.target(id)?;
        let thread = Arc::clone(record.live_thread()?);
        if !record.suspended {
            return Ok(0);
        }
        let remaining = thread.resume()?;
        record.suspended = false;
        Ok(remaining)
    }

    /// Resume a thread until it reports no pending suspensions, regardless of
    /// who suspended it.
    ///
    /// ## Errors
    ///
    /// Fails for unknown or dead threads, or when the OS refuses.
    pub fn force_resume_thread(&mut self, id: ThreadId) -> DebugResult<()>
    {
        let record = self.target(id)?;
        let thread = Arc::clone(record.live_thread()?);
        record.suspended = false;
        while thread.resume()? > 0 {}
        Ok(())
    }

    /// Refresh contexts and stacks of every live thread.
    ///
    /// Guest registers are sampled only from suspendable threads. The stack of
    /// `override_thread` is unwound from `override_context` instead of its live
    /// registers. Guest frames the walker could not attribute to a function
    /// are looked up with `lookup_function`.
    pub fn update_execution_states(
        &mut self,
        walker: &dyn StackWalker,
        max_frames: usize,
        override_thread: Option<ThreadId>,
        override_context: Option<&HostContext>,
        lookup_function: &dyn Fn(GuestAddress) -> Option<Arc<Function>>,
    )
    {
        for record in self.records.values_mut() {
            if record.state.is_dead() {
                continue;
            }
            let Some(thread) = record.thread.clone() else {
                continue;
            };
            if thread.can_debugger_suspend() {
                record.guest_context = thread.guest_context();
            }

            let context = override_context.filter(|_| override_thread == Some(record.thread_id));
            let Some(captured) = walker.capture_stack_trace(record.native_handle, max_frames, context) else {
                warn!(thread = %record.thread_id, "failed to capture stack");
                record.frames.clear();
                continue;
            };
            record.host_context = captured.context;
            record.frames = walker
                .resolve_stack(&captured.host_pcs)
                .into_iter()
                .map(|frame| thread_frame(frame, lookup_function))
                .collect();
            trace!(thread = %record.thread_id, frames = record.frames.len(), "execution state updated");
        }
    }

    /// Remove zombie records whose OS thread handle is no longer valid.
    /// Returns the ids that were removed.
    pub fn sweep_zombies(&mut self) -> Vec<ThreadId>
    {
        let dead: Vec<ThreadId> = self
            .records
            .values()
            .filter(|record| record.state == ThreadState::Zombie)
            .filter(|record| record.thread.as_ref().map_or(true, |thread| !thread.is_valid()))
            .map(|record| record.thread_id)
            .collect();
        for id in &dead {
            self.records.remove(id);
        }
        dead
    }
}

fn thread_frame(frame: ResolvedFrame, lookup_function: &dyn Fn(GuestAddress) -> Option<Arc<Function>>)
    -> ThreadFrame
{
    match frame.location {
        FrameLocation::Guest { function, guest_pc } => {
            let function = function.or_else(|| if guest_pc.is_zero() { None } else { lookup_function(guest_pc) });
            let (guest_function_address, name) = function.as_ref().map_or_else(
                || (GuestAddress::ZERO, format!("<guest {guest_pc}>")),
                |function| (function.address(), function.name().to_string()),
            );
            ThreadFrame {
                host_pc: frame.host_pc,
                host_function_address: HostAddress::ZERO,
                guest_pc,
                guest_function_address,
                guest_function: function,
                name,
            }
        }
        FrameLocation::Host { symbol, name } => ThreadFrame {
            host_pc: frame.host_pc,
            host_function_address: symbol,
            guest_pc: GuestAddress::ZERO,
            guest_function_address: GuestAddress::ZERO,
            guest_function: None,
            name: demangle_symbol(&name),
        },
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    struct FakeThread
    {
        id: ThreadId,
        count: AtomicU32,
        suspendable: bool,
        valid: AtomicBool,
    }

    impl FakeThread
    {
        fn new(id: u32, suspendable: bool) -> Arc<Self>
        {
            Arc::new(Self {
                id: ThreadId(id),
                count: AtomicU32::new(0),
                suspendable,
                valid: AtomicBool::new(true),
            })
        }
    }

    impl GuestThread for FakeThread
    {
        fn id(&self) -> ThreadId
        {
            self.id
        }

        fn native_handle(&self) -> NativeThreadHandle
        {
            NativeThreadHandle(u64::from(self.id.raw()))
        }

        fn can_debugger_suspend(&self) -> bool
        {
            self.suspendable
        }

        fn suspend(&self) -> DebugResult<u32>
        {
            Ok(self.count.fetch_add(1, Ordering::SeqCst))
        }

        fn resume(&self) -> DebugResult<u32>
        {
            let previous = self.count.fetch_sub(1, Ordering::SeqCst);
            Ok(previous - 1)
        }

        fn guest_context(&self) -> GuestContext
        {
            GuestContext::default()
        }

        fn is_valid(&self) -> bool
        {
            self.valid.load(Ordering::SeqCst)
        }

        fn start_address(&self) -> GuestAddress
        {
            GuestAddress::new(0x8200_0000)
        }
    }

    #[test]
    fn test_suspend_resume_symmetry_skips_dead_and_current()
    {
        let threads: Vec<_> = (1..=5).map(|id| FakeThread::new(id, id != 5)).collect();
        let mut table = ThreadTable::new();
        for thread in &threads {
            table.insert(Arc::clone(thread) as Arc<dyn GuestThread>);
        }
        table.get_mut(ThreadId(2)).unwrap().state = ThreadState::Exited;
        table.get_mut(ThreadId(3)).unwrap().state = ThreadState::Zombie;

        let _scope = enter_guest_thread(ThreadId(4));
        assert_eq!(table.suspend_all(), 1);
        assert!(table.get(ThreadId(1)).unwrap().is_suspended());
        for id in 2..=5 {
            assert!(!table.get(ThreadId(id)).unwrap().is_suspended());
        }
        // Already suspended records are not suspended twice.
        assert_eq!(table.suspend_all(), 0);
        assert_eq!(threads[0].count.load(Ordering::SeqCst), 1);

        assert_eq!(table.resume_all(), 1);
        assert!(table.iter().all(|record| !record.is_suspended()));
        assert!(threads.iter().all(|thread| thread.count.load(Ordering::SeqCst) == 0));
    }

    #[test]
    fn test_resume_thread_only_touches_debugger_suspensions()
    {
        let thread = FakeThread::new(1, true);
        let mut table = ThreadTable::new();
        table.insert(Arc::clone(&thread) as Arc<dyn GuestThread>);

        assert_eq!(table.resume_thread(ThreadId(1)).unwrap(), 0);
        assert_eq!(thread.count.load(Ordering::SeqCst), 0);

        table.suspend_thread(ThreadId(1)).unwrap();
        thread.suspend().unwrap();
        assert_eq!(table.resume_thread(ThreadId(1)).unwrap(), 1);
        table.force_resume_thread(ThreadId(1)).unwrap();
        assert_eq!(thread.count.load(Ordering::SeqCst), 0);

        assert!(matches!(table.resume_thread(ThreadId(9)), Err(DebugError::UnknownThread(ThreadId(9)))));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_resuming_the_calling_thread_is_fatal()
    {
        let mut table = ThreadTable::new();
        table.insert(FakeThread::new(1, true) as Arc<dyn GuestThread>);
        let _scope = enter_guest_thread(ThreadId(1));
        let _ = table.resume_thread(ThreadId(1));
    }

    #[test]
    fn test_sweep_zombies_keeps_valid_handles()
    {
        let valid = FakeThread::new(1, true);
        let invalid = FakeThread::new(2, true);
        invalid.valid.store(false, Ordering::SeqCst);
        let mut table = ThreadTable::new();
        table.insert(Arc::clone(&valid) as Arc<dyn GuestThread>);
        table.insert(Arc::clone(&invalid) as Arc<dyn GuestThread>);
        table.insert(FakeThread::new(3, true) as Arc<dyn GuestThread>);
        table.get_mut(ThreadId(1)).unwrap().state = ThreadState::Zombie;
        table.get_mut(ThreadId(2)).unwrap().state = ThreadState::Zombie;

        assert_eq!(table.sweep_zombies(), vec![ThreadId(2)]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_guest_thread_scope_restores_previous()
    {
        assert_eq!(current_guest_thread(), None);
        {
            let _outer = enter_guest_thread(ThreadId(1));
            {
                let _inner = enter_guest_thread(ThreadId(2));
                assert_eq!(current_guest_thread(), Some(ThreadId(2)));
            }
            assert_eq!(current_guest_thread(), Some(ThreadId(1)));
        }
        assert_eq!(current_guest_thread(), None);
    }
}
