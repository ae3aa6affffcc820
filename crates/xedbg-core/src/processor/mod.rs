//! # Processor
//!
//! The [`Processor`] owns the execution state machine and everything the
//! debugger needs to drive it: the function registry, the thread debug table
//! and the breakpoint manager.
//!
//! ## Execution states
//!
//! ```text
//!            pause / breakpoint hit / unhandled exception
//!   Running ---------------------------------------------> Paused
//!      ^                                                    |  ^
//!      |                 continue                           |  | step trap
//!      +----------------------------------------------------+  |
//!                                       step_*_instruction  v  |
//!                                                        Stepping
//! ```
//!
//! Execution starts out Paused; [`Processor::pre_launch`] moves it to
//! Running (and straight back to Paused when break-on-start is configured).
//!
//! ## Locking
//!
//! All debugger state lives behind a single debug lock. Lock order is debug
//! lock, then thread internals, then backend and memory. Listener callbacks
//! and breakpoint callbacks always run after the lock is released, and the
//! function registry is never asked to resolve while the lock is held.

mod stepping;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;
use tracing::{debug, debug_span, info, trace, warn};

use crate::backend::{Backend, Memory};
use crate::breakpoints::builder::BreakpointBuilder;
use crate::breakpoints::{
    Breakpoint, BreakpointAddress, BreakpointHit, BreakpointId, BreakpointInfo, BreakpointKind, BreakpointManager,
    BreakpointOperations, TrapSite,
};
use crate::config::ProcessorConfig;
use crate::error::{protocol_violation, DebugError, DebugResult};
use crate::events::DebugListener;
use crate::function::{Function, Module};
use crate::ppc;
use crate::registry::FunctionRegistry;
use crate::stack::StackWalker;
use crate::thread::{current_guest_thread, GuestThread, ThreadDebugInfo, ThreadState, ThreadTable};
use crate::types::{GuestAddress, HostContext, ThreadId};

/// Signature at the start of a saved session.
pub const SESSION_SIGNATURE: [u8; 4] = *b"PROC";
/// Current session format version.
pub const SESSION_VERSION: u32 = 1;

/// Global execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState
{
    /// Guest threads run freely; user breakpoints are installed.
    Running,
    /// Guest threads are suspended by the debugger.
    Paused,
    /// A single thread runs towards a step breakpoint.
    Stepping,
}

/// What a thread that trapped should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome
{
    /// Nothing claimed the trap; execute the instruction and carry on.
    Continue,
    /// The debugger suspended the thread. When it is resumed it must execute
    /// the trapping instruction without trapping again.
    Parked,
    /// The thread was suspended while the trap was in flight. When it is
    /// resumed it must evaluate the trap again.
    Deferred,
}

/// Produces a listener on demand when the debugger needs one.
pub type ListenerRequestHandler = Arc<dyn Fn(&Processor) -> Option<Arc<dyn DebugListener>> + Send + Sync>;

/// Summary of a restored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSession
{
    /// Execution state recorded in the session.
    pub execution_state: ExecutionState,
    /// Thread records the session listed.
    pub threads: Vec<(ThreadId, ThreadState)>,
    /// Zombie threads removed while restoring.
    pub swept: Vec<ThreadId>,
}

#[derive(Debug)]
pub(crate) struct DebugState
{
    pub(crate) execution_state: ExecutionState,
    pub(crate) threads: ThreadTable,
    pub(crate) breakpoints: BreakpointManager,
}

#[derive(Default)]
struct ListenerSlot
{
    listener: Option<Arc<dyn DebugListener>>,
    request_handler: Option<ListenerRequestHandler>,
}

/// Execution control and debugging front of one guest process.
pub struct Processor
{
    config: ProcessorConfig,
    backend: Arc<dyn Backend>,
    memory: Arc<dyn Memory>,
    stack_walker: Arc<dyn StackWalker>,
    registry: FunctionRegistry,
    state: Mutex<DebugState>,
    listener: Mutex<ListenerSlot>,
}

impl Processor
{
    /// Create a processor in the Paused state.
    ///
    /// ## Parameters
    ///
    /// - `config`: tunables, usually [`ProcessorConfig::from_env`]
    /// - `backend`: code generation backend that patches traps
    /// - `memory`: guest memory, used to decode instructions while stepping
    /// - `stack_walker`: host stack unwinder and symbolizer
    pub fn new(
        config: ProcessorConfig,
        backend: Arc<dyn Backend>,
        memory: Arc<dyn Memory>,
        stack_walker: Arc<dyn StackWalker>,
    ) -> Arc<Self>
    {
        debug!(?config, "creating processor");
        Arc::new(Self {
            config,
            backend,
            memory,
            stack_walker,
            registry: FunctionRegistry::new(),
            state: Mutex::new(DebugState {
                execution_state: ExecutionState::Paused,
                threads: ThreadTable::new(),
                breakpoints: BreakpointManager::new(),
            }),
            listener: Mutex::new(ListenerSlot::default()),
        })
    }

    /// Configuration the processor was created with.
    pub fn config(&self) -> &ProcessorConfig
    {
        &self.config
    }

    /// Function registry.
    pub fn registry(&self) -> &FunctionRegistry
    {
        &self.registry
    }

    /// Guest memory.
    pub fn memory(&self) -> &Arc<dyn Memory>
    {
        &self.memory
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DebugState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listener(&self) -> MutexGuard<'_, ListenerSlot>
    {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Functions and modules
    // ---------------------------------------------------------------------

    /// Register a module with the function registry.
    pub fn add_module(&self, module: Arc<dyn Module>)
    {
        self.registry.add_module(module);
    }

    /// Unload a module.
    ///
    /// Breakpoints patched into the module's functions are uninstalled first
    /// and, while running, reinstalled into whatever still covers them.
    /// Returns `false` if no module
    /// has that name.
    pub fn remove_module(&self, name: &str) -> bool
    {
        {
            let state = self.lock_state();
            for breakpoint in state.breakpoints.iter() {
                if breakpoint.installed_functions().iter().any(|function| function.module_name() == name) {
                    breakpoint.uninstall(self);
                }
            }
        }
        let removed = self.registry.remove_module(name);
        let state = self.lock_state();
        if state.execution_state == ExecutionState::Running {
            state.breakpoints.resume_all(self);
        }
        removed
    }

    /// Resolve (declare and define) the function starting at `address`.
    ///
    /// Concurrent callers for the same address share one resolution. When a
    /// function is newly defined while execution is running, pending guest
    /// breakpoints it covers are installed into it.
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::ResolveFailed`] with the cached failure reason.
    pub fn resolve_function(&self, address: GuestAddress) -> DebugResult<Arc<Function>>
    {
        let resolved = self.registry.resolve(address)?;
        if resolved.newly_defined {
            self.on_function_defined(&resolved.function);
        }
        Ok(resolved.function)
    }

    /// Resolved functions whose range covers `address`.
    pub fn lookup_functions_with_address(&self, address: GuestAddress) -> SmallVec<[Arc<Function>; 4]>
    {
        self.registry.lookup_functions_with_address(address)
    }

    fn on_function_defined(&self, function: &Arc<Function>)
    {
        let state = self.lock_state();
        if state.execution_state != ExecutionState::Running {
            return;
        }
        let installed = state.breakpoints.install_pending_into(function, self);
        if installed > 0 {
            debug!(function = function.name(), installed, "installed pending breakpoints");
        }
    }

    fn ensure_function_at(&self, address: GuestAddress) -> DebugResult<()>
    {
        if self.registry.lookup_functions_with_address(address).is_empty() {
            self.resolve_function(address)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Execution state machine
    // ---------------------------------------------------------------------

    /// Current execution state.
    pub fn execution_state(&self) -> ExecutionState
    {
        self.lock_state().execution_state
    }

    /// Called just before the guest entry point runs.
    ///
    /// Moves execution to Running, then pauses immediately when
    /// break-on-start is configured.
    pub fn pre_launch(&self)
    {
        self.lock_state().execution_state = ExecutionState::Running;
        info!("guest launched");
        if self.config.break_on_start {
            info!("breaking on start");
            if let Err(err) = self.pause() {
                warn!(error = %err, "break on start failed");
            }
        }
    }

    /// Suspend every guest thread and enter Paused.
    ///
    /// Breakpoints are uninstalled and every thread's context and stack are
    /// captured. Pausing while already paused does nothing. Afterwards the
    /// listener is notified and asked to take focus (or requested from the
    /// listener request handler).
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::InvalidState`] while a step is in progress.
    pub fn pause(&self) -> DebugResult<()>
    {
        {
            let mut state = self.lock_state();
            match state.execution_state {
                ExecutionState::Paused => {
                    trace!("pause requested while already paused");
                    return Ok(());
                }
                ExecutionState::Stepping => {
                    return Err(DebugError::InvalidState {
                        expected: ExecutionState::Running,
                        actual: ExecutionState::Stepping,
                    });
                }
                ExecutionState::Running => {}
            }
            let suspended = state.threads.suspend_all();
            state.breakpoints.suspend_all(self);
            self.update_thread_execution_states(&mut state.threads, None, None);
            state.execution_state = ExecutionState::Paused;
            info!(suspended, "execution paused");
        }
        self.notify(|listener| listener.on_execution_paused());
        self.demand_debug_listener();
        Ok(())
    }

    /// Reinstall breakpoints, resume every debugger-suspended thread and
    /// enter Running. Continuing while running does nothing.
    ///
    /// # Panics
    ///
    /// Continuing while a step is in progress is a protocol violation; steps
    /// cannot be cancelled.
    pub fn continue_execution(&self)
    {
        {
            let mut state = self.lock_state();
            match state.execution_state {
                ExecutionState::Running => {
                    trace!("continue requested while already running");
                    return;
                }
                ExecutionState::Stepping => protocol_violation("cannot continue while a step is in progress"),
                ExecutionState::Paused => {}
            }
            state.execution_state = ExecutionState::Running;
            let installed = state.breakpoints.resume_all(self);
            let resumed = state.threads.resume_all();
            info!(installed, resumed, "execution continued");
        }
        self.notify(|listener| listener.on_execution_continued());
    }

    /// Capture context and stack of every thread.
    fn update_thread_execution_states(
        &self,
        threads: &mut ThreadTable,
        override_thread: Option<ThreadId>,
        override_context: Option<&HostContext>,
    )
    {
        let lookup = |address: GuestAddress| self.registry.lookup_functions_with_address(address).into_iter().next();
        threads.update_execution_states(
            self.stack_walker.as_ref(),
            self.config.max_stack_frames,
            override_thread,
            override_context,
            &lookup,
        );
    }

    /// Validate that `thread` may be stepped in the current state.
    fn check_step_target<'a>(&self, state: &'a DebugState, thread: ThreadId) -> DebugResult<&'a ThreadDebugInfo>
    {
        match state.execution_state {
            ExecutionState::Paused => {}
            ExecutionState::Running => {
                return Err(DebugError::InvalidState {
                    expected: ExecutionState::Paused,
                    actual: ExecutionState::Running,
                });
            }
            ExecutionState::Stepping => protocol_violation("a step is already in progress"),
        }
        if current_guest_thread() == Some(thread) {
            protocol_violation("a thread cannot step itself");
        }
        let record = state.threads.get(thread).ok_or(DebugError::UnknownThread(thread))?;
        if record.state.is_dead() || record.thread.is_none() {
            return Err(DebugError::ThreadControl {
                thread,
                reason: format!("thread is {:?}", record.state),
            });
        }
        if record.step_breakpoint.is_some() {
            protocol_violation("thread already has a pending step breakpoint");
        }
        Ok(record)
    }

    /// Step `thread` over one guest instruction.
    ///
    /// The next guest address is predicted by decoding the instruction at the
    /// innermost frame with the registers captured at the pause. A one-shot
    /// step breakpoint is placed there and the thread alone is resumed;
    /// execution is Stepping until the thread reaches it, at which point the
    /// listener sees `on_step_completed` followed by `on_execution_paused`.
    ///
    /// ## Errors
    ///
    /// - `InvalidState`: execution is running
    /// - `UnknownThread`, `ThreadControl`: no live record for the thread
    /// - `NoStackFrames`, `NotGuestCode`: nothing to step from
    /// - `MemoryAccess`: the instruction word could not be read
    /// - `ResolveFailed`: the next address has no function to patch
    /// - `BreakpointInstallFailed`: the backend refused the step breakpoint
    pub fn step_guest_instruction(&self, thread: ThreadId) -> DebugResult<()>
    {
        let _span = debug_span!("step_guest_instruction", %thread).entered();
        let next = {
            let state = self.lock_state();
            let record = self.check_step_target(&state, thread)?;
            let frame = record.frames.first().ok_or(DebugError::NoStackFrames(thread))?;
            if frame.guest_pc.is_zero() {
                return Err(DebugError::NotGuestCode(thread));
            }
            let pc = frame.guest_pc;
            let word = self.memory.load_u32(pc).ok_or(DebugError::MemoryAccess(pc))?;
            let next = ppc::next_guest_pc(pc, word, &record.guest_context);
            debug!(%pc, %next, "predicted next guest instruction");
            next
        };
        self.ensure_function_at(next)?;
        self.begin_step(thread, BreakpointBuilder::guest(next).with_kind(BreakpointKind::Step).build())
    }

    /// Step `thread` over one host instruction.
    ///
    /// Works like [`step_guest_instruction`](Self::step_guest_instruction)
    /// with the next host address supplied by the backend.
    ///
    /// ## Errors
    ///
    /// Same as [`step_guest_instruction`](Self::step_guest_instruction),
    /// without the guest decoding failures.
    pub fn step_host_instruction(&self, thread: ThreadId) -> DebugResult<()>
    {
        let _span = debug_span!("step_host_instruction", %thread).entered();
        let next = {
            let state = self.lock_state();
            let record = self.check_step_target(&state, thread)?;
            let frame = record.frames.first().ok_or(DebugError::NoStackFrames(thread))?;
            let next = self.backend.calculate_next_host_instruction(record, frame.host_pc);
            debug!(pc = %frame.host_pc, %next, "predicted next host instruction");
            next
        };
        self.begin_step(thread, BreakpointBuilder::host(next).with_kind(BreakpointKind::Step).build())
    }

    fn begin_step(&self, thread: ThreadId, breakpoint: Arc<Breakpoint>) -> DebugResult<()>
    {
        let mut state = self.lock_state();
        // The state may have changed while the next address was resolved.
        self.check_step_target(&state, thread)?;
        if !breakpoint.install(self) {
            return Err(DebugError::BreakpointInstallFailed(breakpoint.address().to_string()));
        }
        state.execution_state = ExecutionState::Stepping;
        if let Some(record) = state.threads.get_mut(thread) {
            record.step_breakpoint = Some(Arc::clone(&breakpoint));
        }
        if let Err(err) = state.threads.resume_thread(thread) {
            breakpoint.uninstall(self);
            if let Some(record) = state.threads.get_mut(thread) {
                record.step_breakpoint = None;
            }
            state.execution_state = ExecutionState::Paused;
            return Err(err);
        }
        debug!(address = %breakpoint.address(), "step started");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Breakpoints
    // ---------------------------------------------------------------------

    /// Add a breakpoint to the active set. It is installed right away while
    /// running, otherwise on the next continue.
    pub fn add_breakpoint(&self, breakpoint: Arc<Breakpoint>) -> BreakpointId
    {
        let id = breakpoint.id();
        let mut state = self.lock_state();
        if !state.breakpoints.add(Arc::clone(&breakpoint)) {
            return id;
        }
        if state.execution_state == ExecutionState::Running && breakpoint.is_enabled() {
            let installed = breakpoint.install(self);
            debug!(%id, address = %breakpoint.address(), installed, "breakpoint added");
        } else {
            debug!(%id, address = %breakpoint.address(), "breakpoint added (deferred install)");
        }
        id
    }

    /// Uninstall and remove a breakpoint. Returns `false` for unknown ids.
    pub fn remove_breakpoint(&self, id: BreakpointId) -> bool
    {
        let mut state = self.lock_state();
        match state.breakpoints.remove(id) {
            Some(breakpoint) => {
                breakpoint.uninstall(self);
                debug!(%id, "breakpoint removed");
                true
            }
            None => false,
        }
    }

    /// Enable or disable a breakpoint. Returns `false` for unknown ids.
    pub fn set_breakpoint_enabled(&self, id: BreakpointId, enabled: bool) -> bool
    {
        let state = self.lock_state();
        let Some(breakpoint) = state.breakpoints.get(id) else {
            return false;
        };
        breakpoint.set_enabled(enabled);
        if !enabled {
            breakpoint.uninstall(self);
        } else if state.execution_state == ExecutionState::Running {
            breakpoint.install(self);
        }
        true
    }

    /// Active breakpoint with the given id.
    pub fn breakpoint(&self, id: BreakpointId) -> Option<Arc<Breakpoint>>
    {
        self.lock_state().breakpoints.get(id).cloned()
    }

    /// First active breakpoint keyed on `address`.
    pub fn find_breakpoint(&self, address: BreakpointAddress) -> Option<Arc<Breakpoint>>
    {
        self.lock_state().breakpoints.find_by_address(address).cloned()
    }

    /// Snapshot of every active breakpoint.
    pub fn breakpoints(&self) -> Vec<BreakpointInfo>
    {
        self.lock_state().breakpoints.list()
    }

    /// Trap handler, called on the trapping guest thread.
    ///
    /// A trap matching the thread's step breakpoint completes the step. While
    /// not stepping, enabled installed breakpoints matching `site` fire; the
    /// first hit while running pauses the whole process. Callbacks and
    /// listener notifications run after the debug lock is released.
    ///
    /// `host_context` is the register state at the trap, used to unwind the
    /// trapping thread's stack.
    ///
    /// # Panics
    ///
    /// A trap on a thread without a debug record is a protocol violation.
    pub fn on_breakpoint_hit(&self, thread: ThreadId, site: TrapSite, host_context: Option<&HostContext>)
        -> TrapOutcome
    {
        let mut hits = Vec::new();
        let mut step_completed = false;
        let mut paused_now = false;
        {
            let mut state = self.lock_state();
            let Some(record) = state.threads.get(thread) else {
                protocol_violation("trap on a thread without a debug record");
            };
            if record.suspended {
                trace!(%thread, "trap deferred, thread suspended while in flight");
                return TrapOutcome::Deferred;
            }

            if state.execution_state == ExecutionState::Stepping {
                let Some(step) = record.step_breakpoint.clone().filter(|step| step.matches(&site)) else {
                    return TrapOutcome::Continue;
                };
                step.uninstall(self);
                if let Some(record) = state.threads.get_mut(thread) {
                    record.step_breakpoint = None;
                }
                step_completed = true;
                paused_now = true;
            } else {
                hits = state.breakpoints.matching(&site);
                if hits.is_empty() {
                    return TrapOutcome::Continue;
                }
                if state.execution_state == ExecutionState::Running {
                    state.threads.suspend_all_except(Some(thread));
                    state.breakpoints.suspend_all(self);
                    paused_now = true;
                }
                for breakpoint in &hits {
                    let count = breakpoint.record_hit();
                    debug!(id = %breakpoint.id(), address = %breakpoint.address(), %thread, count, "breakpoint hit");
                }
            }

            self.update_thread_execution_states(&mut state.threads, Some(thread), host_context);
            state.execution_state = ExecutionState::Paused;
            if let Some(record) = state.threads.get_mut(thread) {
                park(record);
            }
        }

        for breakpoint in &hits {
            breakpoint.dispatch(&BreakpointHit {
                breakpoint: breakpoint.id(),
                address: breakpoint.address(),
                thread,
                site,
            });
        }
        if step_completed {
            info!(%thread, "step completed");
            self.notify(|listener| listener.on_step_completed(thread));
        }
        if paused_now {
            for breakpoint in hits.iter().filter(|breakpoint| breakpoint.kind() == BreakpointKind::User) {
                let info = breakpoint.info();
                self.notify(|listener| listener.on_breakpoint_hit(&info, thread));
            }
            self.notify(|listener| listener.on_execution_paused());
        }
        TrapOutcome::Parked
    }

    /// Unhandled guest exception, called on the faulting guest thread.
    ///
    /// Without a listener, or when called from a thread that is not running
    /// guest code, returns `false` and lets the host handle the exception.
    /// Otherwise the process pauses with the faulting thread parked and this
    /// returns `true`.
    pub fn on_unhandled_exception(&self, host_context: &HostContext) -> bool
    {
        if self.debug_listener().is_none() {
            return false;
        }
        let Some(thread) = current_guest_thread() else {
            return false;
        };
        {
            let mut state = self.lock_state();
            if state.threads.get(thread).is_none() {
                warn!(%thread, "unhandled exception on a thread without a debug record");
                return false;
            }
            state.threads.suspend_all_except(Some(thread));
            if state.execution_state != ExecutionState::Stepping {
                state.breakpoints.suspend_all(self);
            }
            // An interrupted step will never reach its trap.
            self.drop_step_breakpoints(&mut state, None);
            self.update_thread_execution_states(&mut state.threads, Some(thread), Some(host_context));
            state.execution_state = ExecutionState::Paused;
            if let Some(record) = state.threads.get_mut(thread) {
                park(record);
            }
            warn!(%thread, pc = %host_context.pc, "unhandled exception, execution paused");
        }
        self.notify(|listener| listener.on_execution_paused());
        true
    }

    // ---------------------------------------------------------------------
    // Thread lifecycle
    // ---------------------------------------------------------------------

    /// A guest thread was created.
    pub fn on_thread_created(&self, thread: Arc<dyn GuestThread>)
    {
        let id = thread.id();
        let mut state = self.lock_state();
        if let Some(stale) = state.threads.insert(thread) {
            warn!(thread = %id, state = ?stale.state, "replaced stale thread record");
        }
        debug!(thread = %id, "thread created");
    }

    /// A guest thread returned from its entry point.
    ///
    /// A step the thread still had pending is abandoned and execution
    /// returns to Paused.
    pub fn on_thread_exit(&self, thread: ThreadId)
    {
        let abandoned = {
            let mut state = self.lock_state();
            let Some(record) = state.threads.get_mut(thread) else {
                warn!(%thread, event = "exit", "lifecycle notification for unknown thread");
                return;
            };
            record.state = ThreadState::Exited;
            record.suspended = false;
            trace!(%thread, event = "exit", "thread lifecycle");
            self.abandon_step(&mut state, thread)
        };
        if abandoned {
            self.notify(|listener| listener.on_execution_paused());
        }
    }

    /// A guest thread object was destroyed.
    ///
    /// Exited threads are forgotten; threads destroyed without exiting stay
    /// behind as zombies until the next session restore sweeps them.
    pub fn on_thread_destroyed(&self, thread: ThreadId)
    {
        let abandoned = {
            let mut state = self.lock_state();
            let Some(exited) = state.threads.get(thread).map(|record| record.state == ThreadState::Exited) else {
                warn!(%thread, "destroy notification for unknown thread");
                return;
            };
            let abandoned = self.abandon_step(&mut state, thread);
            if exited {
                state.threads.remove(thread);
                debug!(%thread, "thread destroyed");
            } else if let Some(record) = state.threads.get_mut(thread) {
                record.state = ThreadState::Zombie;
                record.suspended = false;
                debug!(%thread, "thread destroyed before exit, kept as zombie");
            }
            abandoned
        };
        if abandoned {
            self.notify(|listener| listener.on_execution_paused());
        }
    }

    /// Drop the step `thread` has pending. Returns `true` when that step was
    /// the one execution was Stepping for, which is now back to Paused.
    fn abandon_step(&self, state: &mut DebugState, thread: ThreadId) -> bool
    {
        if self.drop_step_breakpoints(state, Some(thread)) == 0 {
            return false;
        }
        if state.execution_state != ExecutionState::Stepping {
            return false;
        }
        warn!(%thread, "thread left with a step pending, execution paused");
        state.execution_state = ExecutionState::Paused;
        true
    }

    /// Uninstall and forget pending step breakpoints, of `thread` only or of
    /// every thread. Returns how many were dropped.
    fn drop_step_breakpoints(&self, state: &mut DebugState, thread: Option<ThreadId>) -> usize
    {
        let steps: Vec<Arc<Breakpoint>> = state
            .threads
            .iter_mut()
            .filter(|record| thread.map_or(true, |id| record.thread_id == id))
            .filter_map(|record| record.step_breakpoint.take())
            .collect();
        for step in &steps {
            step.uninstall(self);
        }
        steps.len()
    }

    /// A guest thread entered a kernel wait.
    pub fn on_thread_entering_wait(&self, thread: ThreadId)
    {
        self.with_thread(thread, "entering wait", |record| {
            if record.state == ThreadState::Alive {
                record.state = ThreadState::Waiting;
            }
        });
    }

    /// A guest thread left a kernel wait.
    pub fn on_thread_leaving_wait(&self, thread: ThreadId)
    {
        self.with_thread(thread, "leaving wait", |record| {
            if record.state == ThreadState::Waiting {
                record.state = ThreadState::Alive;
            }
        });
    }

    fn with_thread(&self, thread: ThreadId, event: &str, update: impl FnOnce(&mut ThreadDebugInfo))
    {
        let mut state = self.lock_state();
        match state.threads.get_mut(thread) {
            Some(record) => {
                update(record);
                trace!(%thread, event, state = ?record.state, "thread lifecycle");
            }
            None => warn!(%thread, event, "lifecycle notification for unknown thread"),
        }
    }

    /// Snapshot of every thread record.
    pub fn query_thread_debug_infos(&self) -> Vec<ThreadDebugInfo>
    {
        self.lock_state().threads.iter().cloned().collect()
    }

    /// Snapshot of one thread record.
    pub fn query_thread_debug_info(&self, thread: ThreadId) -> Option<ThreadDebugInfo>
    {
        self.lock_state().threads.get(thread).cloned()
    }

    // ---------------------------------------------------------------------
    // Listener
    // ---------------------------------------------------------------------

    /// Currently attached listener.
    pub fn debug_listener(&self) -> Option<Arc<dyn DebugListener>>
    {
        self.lock_listener().listener.clone()
    }

    /// Attach (or with `None`, detach) the listener.
    ///
    /// The previous listener is told it was detached. Detaching while paused
    /// continues execution, since nobody is left to resume it.
    pub fn set_debug_listener(&self, listener: Option<Arc<dyn DebugListener>>)
    {
        let detaching = listener.is_none();
        let previous = {
            let mut slot = self.lock_listener();
            let same = match (&slot.listener, &listener) {
                (Some(current), Some(new)) => same_listener(current, new),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            std::mem::replace(&mut slot.listener, listener)
        };
        if let Some(previous) = previous {
            previous.on_detached();
        }
        debug!(attached = !detaching, "debug listener changed");
        if detaching && self.execution_state() == ExecutionState::Paused {
            info!("listener detached while paused, continuing");
            self.continue_execution();
        }
    }

    /// Install the handler consulted when a listener is demanded but none is
    /// attached.
    pub fn set_debug_listener_request_handler(&self, handler: Option<ListenerRequestHandler>)
    {
        self.lock_listener().request_handler = handler;
    }

    /// Bring the debugger frontend to the front.
    pub fn show(&self)
    {
        self.demand_debug_listener();
    }

    fn demand_debug_listener(&self)
    {
        let (listener, handler) = {
            let slot = self.lock_listener();
            (slot.listener.clone(), slot.request_handler.clone())
        };
        if let Some(listener) = listener {
            listener.on_focus();
            return;
        }
        let Some(handler) = handler else {
            warn!("debugger needs a listener but no request handler is installed");
            return;
        };
        match handler(self) {
            Some(listener) => self.set_debug_listener(Some(listener)),
            None => warn!("listener request handler declined to provide a listener"),
        }
    }

    fn notify(&self, event: impl FnOnce(&dyn DebugListener))
    {
        if let Some(listener) = self.debug_listener() {
            event(listener.as_ref());
        }
    }

    // ---------------------------------------------------------------------
    // Session and teardown
    // ---------------------------------------------------------------------

    /// Write the processor's session state.
    ///
    /// The format is the `PROC` signature, the version, the execution state
    /// and one `(thread id, state)` pair per thread record, little endian.
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::Io`] when the writer fails.
    pub fn save_session<W: Write>(&self, writer: &mut W) -> DebugResult<()>
    {
        let (execution_state, threads) = {
            let state = self.lock_state();
            let threads: Vec<(ThreadId, ThreadState)> =
                state.threads.iter().map(|record| (record.thread_id, record.state)).collect();
            (state.execution_state, threads)
        };
        writer.write_all(&SESSION_SIGNATURE)?;
        writer.write_all(&SESSION_VERSION.to_le_bytes())?;
        writer.write_all(&[encode_execution_state(execution_state)])?;
        let count = u32::try_from(threads.len()).map_err(|_| invalid_data("too many threads".to_string()))?;
        writer.write_all(&count.to_le_bytes())?;
        for (id, thread_state) in &threads {
            writer.write_all(&id.raw().to_le_bytes())?;
            writer.write_all(&[encode_thread_state(*thread_state)])?;
        }
        debug!(threads = threads.len(), "session saved");
        Ok(())
    }

    /// Read back a session written by [`save_session`](Self::save_session)
    /// and sweep zombie threads whose OS threads are gone.
    ///
    /// ## Errors
    ///
    /// - `InvalidSessionSignature`: the data does not start with `PROC`
    /// - `UnsupportedSessionVersion`: written by another format version
    /// - `Io`: truncated or unreadable data
    pub fn restore_session<R: Read>(&self, reader: &mut R) -> DebugResult<RestoredSession>
    {
        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature != SESSION_SIGNATURE {
            return Err(DebugError::InvalidSessionSignature(signature));
        }
        let version = read_u32(reader)?;
        if version != SESSION_VERSION {
            return Err(DebugError::UnsupportedSessionVersion(version));
        }
        let execution_state = decode_execution_state(read_u8(reader)?)?;
        let count = read_u32(reader)?;
        let mut threads = Vec::new();
        for _ in 0..count {
            let id = ThreadId(read_u32(reader)?);
            let thread_state = decode_thread_state(read_u8(reader)?)?;
            threads.push((id, thread_state));
        }

        let swept = self.lock_state().threads.sweep_zombies();
        if !swept.is_empty() {
            info!(count = swept.len(), "swept zombie threads");
        }
        Ok(RestoredSession {
            execution_state,
            threads,
            swept,
        })
    }

    /// Tear down debugging: detach the listener, uninstall and drop every
    /// breakpoint (step breakpoints included) and resume every thread the
    /// debugger suspended. Execution is left Running.
    pub fn shutdown(&self)
    {
        let listener = {
            let mut slot = self.lock_listener();
            slot.request_handler = None;
            slot.listener.take()
        };
        {
            let mut state = self.lock_state();
            self.drop_step_breakpoints(&mut state, None);
            state.breakpoints.suspend_all(self);
            let dropped = state.breakpoints.drain().len();
            let resumed = state.threads.resume_all();
            state.execution_state = ExecutionState::Running;
            info!(dropped, resumed, "debugger shut down");
        }
        if let Some(listener) = listener {
            listener.on_detached();
        }
    }
}

impl BreakpointOperations for Processor
{
    fn backend(&self) -> &dyn Backend
    {
        self.backend.as_ref()
    }

    fn functions_covering(&self, address: GuestAddress) -> SmallVec<[Arc<Function>; 4]>
    {
        self.registry.lookup_functions_with_address(address)
    }
}

impl std::fmt::Debug for Processor
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Processor")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Mark a trapping thread suspended by the debugger. The suspension takes
/// effect when the thread returns from the trap handler.
fn park(record: &mut ThreadDebugInfo)
{
    if record.suspended {
        return;
    }
    let Some(thread) = &record.thread else {
        return;
    };
    match thread.suspend() {
        Ok(_) => record.suspended = true,
        Err(err) => warn!(thread = %record.thread_id, error = %err, "failed to park trapping thread"),
    }
}

fn same_listener(a: &Arc<dyn DebugListener>, b: &Arc<dyn DebugListener>) -> bool
{
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn encode_execution_state(state: ExecutionState) -> u8
{
    match state {
        ExecutionState::Running => 0,
        ExecutionState::Paused => 1,
        ExecutionState::Stepping => 2,
    }
}

fn decode_execution_state(raw: u8) -> DebugResult<ExecutionState>
{
    match raw {
        0 => Ok(ExecutionState::Running),
        1 => Ok(ExecutionState::Paused),
        2 => Ok(ExecutionState::Stepping),
        other => Err(invalid_data(format!("unknown execution state {other}"))),
    }
}

fn encode_thread_state(state: ThreadState) -> u8
{
    match state {
        ThreadState::Alive => 0,
        ThreadState::Waiting => 1,
        ThreadState::Exited => 2,
        ThreadState::Zombie => 3,
    }
}

fn decode_thread_state(raw: u8) -> DebugResult<ThreadState>
{
    match raw {
        0 => Ok(ThreadState::Alive),
        1 => Ok(ThreadState::Waiting),
        2 => Ok(ThreadState::Exited),
        3 => Ok(ThreadState::Zombie),
        other => Err(invalid_data(format!("unknown thread state {other}"))),
    }
}

fn invalid_data(message: String) -> DebugError
{
    DebugError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn read_u8<R: Read>(reader: &mut R) -> DebugResult<u8>
{
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> DebugResult<u32>
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
