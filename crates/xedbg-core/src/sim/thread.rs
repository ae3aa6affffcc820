use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::{export_host_address, host_pc_for, SimBackend, SimMemory};
use crate::backend::Memory;
use crate::breakpoints::TrapSite;
use crate::error::{DebugError, DebugResult};
use crate::function::Export;
use crate::ppc::{self, BranchKind, Instruction};
use crate::processor::{Processor, TrapOutcome};
use crate::thread::{enter_guest_thread, GuestThread};
use crate::types::{
    CapturedStack, ConditionField, GuestAddress, GuestContext, HostAddress, HostContext, NativeThreadHandle, ThreadId,
};

/// Time one host call tick takes.
const HOST_CALL_TICK: Duration = Duration::from_millis(1);
/// Default ticks a non-blocking export runs for before returning.
const HOST_CALL_TICKS: u32 = 5;
/// Host stack top of every guest thread.
const STACK_TOP: u64 = 0x7FFF_0000;
const SPR_LR: u32 = 8;
const SPR_CTR: u32 = 9;

/// Coarse run state of a [`SimThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimThreadStatus
{
    /// Interpreting guest code.
    Guest(GuestAddress),
    /// Inside the host implementation of an export.
    HostCall(GuestAddress),
    /// Returned from its entry point or faulted.
    Exited,
}

#[derive(Debug)]
struct HostCall
{
    export: Export,
    thunk: GuestAddress,
    /// `None` blocks until [`SimThread::complete_wait`].
    remaining: Option<u32>,
}

#[derive(Debug)]
struct ThreadState
{
    pc: GuestAddress,
    context: GuestContext,
    call_stack: Vec<GuestAddress>,
    suspend_count: u32,
    skip_trap_at: Option<GuestAddress>,
    pending_export: Option<Export>,
    host_call: Option<HostCall>,
    faulted: bool,
    exited: bool,
    stop: bool,
    closed: bool,
    executed: u64,
}

impl ThreadState
{
    /// Whether a suspend landed after the thread passed `wait_runnable`.
    ///
    /// Nothing may change once `suspend` has returned, so the caller backs
    /// off without executing. A consumed trap skip for `pc` is put back.
    fn yield_to_suspend(&mut self, pc: GuestAddress, skipped: bool) -> bool
    {
        if self.suspend_count == 0 && !self.stop {
            return false;
        }
        if skipped {
            self.skip_trap_at = Some(pc);
        }
        true
    }
}

/// Collaborators a running thread calls into.
#[derive(Clone)]
pub(crate) struct ThreadEnv
{
    pub(crate) processor: Weak<Processor>,
    pub(crate) memory: Arc<SimMemory>,
    pub(crate) backend: Arc<SimBackend>,
}

enum Flow
{
    /// Suspended before the instruction ran.
    Yield,
    Next,
    Call(GuestAddress),
    Exit,
    Fault,
}

/// Guest thread interpreted on its own OS thread.
#[derive(Debug)]
pub struct SimThread
{
    id: ThreadId,
    handle: NativeThreadHandle,
    start_address: GuestAddress,
    suspendable: bool,
    host_call_ticks: AtomicU32,
    state: Mutex<ThreadState>,
    wake: Condvar,
}

impl SimThread
{
    pub(crate) fn new(id: ThreadId, start_address: GuestAddress, suspendable: bool) -> Self
    {
        Self {
            id,
            handle: NativeThreadHandle(0x1000 + u64::from(id.raw())),
            start_address,
            suspendable,
            host_call_ticks: AtomicU32::new(HOST_CALL_TICKS),
            state: Mutex::new(ThreadState {
                pc: start_address,
                context: GuestContext::default(),
                call_stack: Vec::new(),
                suspend_count: 0,
                skip_trap_at: None,
                pending_export: None,
                host_call: None,
                faulted: false,
                exited: false,
                stop: false,
                closed: false,
                executed: 0,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThreadState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current run state.
    pub fn status(&self) -> SimThreadStatus
    {
        let state = self.lock();
        if state.exited {
            SimThreadStatus::Exited
        } else if let Some(call) = &state.host_call {
            SimThreadStatus::HostCall(call.thunk)
        } else {
            SimThreadStatus::Guest(state.pc)
        }
    }

    /// Current guest program counter.
    pub fn pc(&self) -> GuestAddress
    {
        self.lock().pc
    }

    /// Outstanding suspensions.
    pub fn suspend_count(&self) -> u32
    {
        self.lock().suspend_count
    }

    /// Instructions interpreted so far.
    pub fn instructions_executed(&self) -> u64
    {
        self.lock().executed
    }

    /// Seed a register before the thread starts.
    pub fn set_gpr(&self, index: usize, value: u64)
    {
        if let Some(slot) = self.lock().context.gpr.get_mut(index) {
            *slot = value;
        }
    }

    /// Number of 1 ms ticks non-blocking exports take.
    pub fn set_host_call_ticks(&self, ticks: u32)
    {
        self.host_call_ticks.store(ticks, Ordering::Relaxed);
    }

    /// Let a blocking export return.
    pub fn complete_wait(&self)
    {
        let mut state = self.lock();
        if let Some(call) = state.host_call.as_mut() {
            call.remaining = Some(0);
        }
        self.wake.notify_all();
    }

    pub(crate) fn stop(&self)
    {
        self.lock().stop = true;
        self.wake.notify_all();
    }

    pub(crate) fn close(&self)
    {
        self.lock().closed = true;
    }

    /// Host program counters of the thread, innermost first.
    pub(crate) fn capture_stack(&self, max_frames: usize) -> CapturedStack
    {
        let state = self.lock();
        let mut host_pcs = Vec::with_capacity(state.call_stack.len() + 2);
        match &state.host_call {
            Some(call) => {
                host_pcs.push(export_host_address(call.export.ordinal) + 0x10);
                host_pcs.push(host_pc_for(call.thunk));
            }
            None => host_pcs.push(host_pc_for(state.pc)),
        }
        // Each return address belongs to the frame that made the call.
        host_pcs.extend(state.call_stack.iter().rev().map(|ret| host_pc_for(GuestAddress::new(ret.value() - 4))));
        host_pcs.truncate(max_frames);
        let depth = host_pcs.len() as u64;
        let context = HostContext {
            pc: host_pcs.first().copied().unwrap_or(HostAddress::ZERO),
            sp: STACK_TOP - depth * 0x80,
            ..HostContext::default()
        };
        CapturedStack { host_pcs, context }
    }

    fn host_context(&self, pc: GuestAddress) -> HostContext
    {
        HostContext {
            pc: host_pc_for(pc),
            sp: STACK_TOP - (self.lock().call_stack.len() as u64 + 1) * 0x80,
            ..HostContext::default()
        }
    }

    /// Interpreter loop; runs on the thread's own OS thread.
    pub(crate) fn run(self: &Arc<Self>, env: &ThreadEnv)
    {
        let _scope = enter_guest_thread(self.id);
        debug!(thread = %self.id, start = %self.start_address, "guest thread started");
        if let Some(processor) = env.processor.upgrade() {
            if let Err(err) = processor.resolve_function(self.start_address) {
                warn!(thread = %self.id, error = %err, "entry point did not resolve");
            }
        }

        while let Some(pc) = self.wait_runnable() {
            let Some(pc) = pc else {
                self.host_call_tick(env);
                continue;
            };
            let skipped = self.take_trap_skip(pc);
            if !skipped && env.backend.has_trap(pc) {
                let Some(processor) = env.processor.upgrade() else {
                    break;
                };
                let site = TrapSite {
                    guest: Some(pc),
                    host: host_pc_for(pc),
                };
                match processor.on_breakpoint_hit(self.id, site, Some(&self.host_context(pc))) {
                    TrapOutcome::Parked => {
                        self.lock().skip_trap_at = Some(pc);
                        continue;
                    }
                    TrapOutcome::Deferred => continue,
                    TrapOutcome::Continue => {}
                }
            }
            let host_call = {
                let mut state = self.lock();
                if state.yield_to_suspend(pc, skipped) {
                    continue;
                }
                state.pending_export.take().map(|export| self.begin_host_call(&mut state, export, pc))
            };
            if let Some(blocking) = host_call {
                if blocking {
                    if let Some(processor) = env.processor.upgrade() {
                        processor.on_thread_entering_wait(self.id);
                    }
                }
                continue;
            }

            match self.execute(pc, skipped, env) {
                Flow::Yield => continue,
                Flow::Next => {}
                Flow::Call(target) => self.enter_call(target, env),
                Flow::Exit => break,
                Flow::Fault => self.fault(pc, env),
            }
            std::thread::yield_now();
        }

        let exited = {
            let mut state = self.lock();
            let first = !state.exited;
            state.exited = true;
            first && !state.stop
        };
        if exited {
            debug!(thread = %self.id, "guest thread exited");
            if let Some(processor) = env.processor.upgrade() {
                processor.on_thread_exit(self.id);
            }
        }
    }

    /// Block while suspended. `None` stops the loop; `Some(None)` means the
    /// thread is inside a host call.
    fn wait_runnable(&self) -> Option<Option<GuestAddress>>
    {
        let mut state = self.lock();
        while state.suspend_count > 0 && !state.stop {
            state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.stop || state.exited || state.faulted {
            return None;
        }
        if state.host_call.is_some() {
            return Some(None);
        }
        Some(Some(state.pc))
    }

    fn take_trap_skip(&self, pc: GuestAddress) -> bool
    {
        let mut state = self.lock();
        match state.skip_trap_at.take() {
            Some(skip) => skip == pc,
            None => false,
        }
    }

    /// Run the instruction at `pc`, unless a suspend arrived since the
    /// thread last checked.
    fn execute(&self, pc: GuestAddress, skipped: bool, env: &ThreadEnv) -> Flow
    {
        let word = env.memory.load_u32(pc);
        let mut state = self.lock();
        if state.yield_to_suspend(pc, skipped) {
            return Flow::Yield;
        }
        let Some(word) = word else {
            return Flow::Fault;
        };
        state.executed += 1;
        let flow = match ppc::decode(pc, word) {
            Instruction::Branch(branch) => {
                let taken = branch.is_taken(&state.context);
                let target = branch.target(&state.context);
                let returning = matches!(branch.kind, BranchKind::ToLink { .. }) && taken;
                if branch.decrements_count() {
                    state.context.ctr = state.context.ctr.wrapping_sub(1);
                }
                if branch.link {
                    state.context.lr = u64::from(branch.fallthrough().value());
                }
                if !taken {
                    state.pc = branch.fallthrough();
                    Flow::Next
                } else if returning && target.is_zero() && state.call_stack.is_empty() {
                    Flow::Exit
                } else {
                    if returning {
                        state.call_stack.pop();
                    }
                    state.pc = target;
                    if branch.link {
                        state.call_stack.push(branch.fallthrough());
                        Flow::Call(target)
                    } else {
                        Flow::Next
                    }
                }
            }
            Instruction::Other { opcode, word } => {
                if interpret(&mut state.context, opcode, word) {
                    state.pc = pc.next_instruction();
                    Flow::Next
                } else {
                    Flow::Fault
                }
            }
        };
        trace!(thread = %self.id, %pc, word = format_args!("{word:08x}"), "executed");
        flow
    }

    /// Resolve a call target; calls into builtin thunks become host calls
    /// once the thread passes the trap check at the thunk.
    fn enter_call(&self, target: GuestAddress, env: &ThreadEnv)
    {
        let Some(processor) = env.processor.upgrade() else {
            return;
        };
        match processor.resolve_function(target) {
            Ok(function) => self.lock().pending_export = function.export().cloned(),
            Err(err) => warn!(thread = %self.id, %target, error = %err, "call target did not resolve"),
        }
    }

    /// Switch `state` into the host call for `export`. Returns whether the
    /// export blocks.
    fn begin_host_call(&self, state: &mut ThreadState, export: Export, thunk: GuestAddress) -> bool
    {
        let blocking = export.blocking;
        debug!(thread = %self.id, export = %export.name, "entering host call");
        let ticks = self.host_call_ticks.load(Ordering::Relaxed);
        state.host_call = Some(HostCall {
            remaining: (!blocking).then_some(ticks),
            export,
            thunk,
        });
        blocking
    }

    fn host_call_tick(&self, env: &ThreadEnv)
    {
        let mut state = self.lock();
        if state.suspend_count > 0 && !state.stop {
            return;
        }
        let Some((remaining, blocking)) = state.host_call.as_ref().map(|call| (call.remaining, call.export.blocking))
        else {
            return;
        };
        match remaining {
            Some(0) => {
                state.host_call = None;
                state.call_stack.pop();
                state.pc = state.context.link_target();
                state.context.gpr[3] = 0;
                drop(state);
                if blocking {
                    if let Some(processor) = env.processor.upgrade() {
                        processor.on_thread_leaving_wait(self.id);
                    }
                }
            }
            Some(ticks) => {
                if let Some(call) = state.host_call.as_mut() {
                    call.remaining = Some(ticks - 1);
                }
                drop(state);
                std::thread::sleep(HOST_CALL_TICK);
            }
            None => {
                let _ = self.wake.wait_timeout(state, HOST_CALL_TICK);
            }
        }
    }

    fn fault(&self, pc: GuestAddress, env: &ThreadEnv)
    {
        let handled = env
            .processor
            .upgrade()
            .is_some_and(|processor| processor.on_unhandled_exception(&self.host_context(pc)));
        if handled {
            warn!(thread = %self.id, %pc, "illegal instruction, handed to debugger");
        } else {
            error!(thread = %self.id, %pc, "illegal instruction, thread terminated");
        }
        // A faulted thread exits once the debugger lets it run again.
        self.lock().faulted = true;
    }
}

/// Execute a non-branch instruction. Returns `false` for illegal encodings.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn interpret(context: &mut GuestContext, opcode: u32, word: u32) -> bool
{
    let rt = ((word >> 21) & 0x1F) as usize;
    let ra = ((word >> 16) & 0x1F) as usize;
    let simm = i64::from(word as u16 as i16);
    match opcode {
        // addi
        14 => {
            let base = if ra == 0 { 0 } else { context.gpr[ra] };
            context.gpr[rt] = base.wrapping_add(simm as u64);
        }
        // cmpi (word compare)
        11 => {
            let field = (word >> 23) & 0x7;
            let value = i64::from(context.gpr[ra] as u32 as i32);
            let mut result = ConditionField::compare(value, simm);
            result.so = context.xer & 0x8000_0000 != 0;
            context.set_cr_field(field, result);
        }
        // ori (nop is ori 0,0,0)
        24 => {
            context.gpr[ra] = context.gpr[rt] | u64::from(word & 0xFFFF);
        }
        // isync and other XL-form non-branches
        ppc::OPCODE_XL => {}
        31 => {
            let spr = ((word >> 16) & 0x1F) | (((word >> 11) & 0x1F) << 5);
            match (ppc::extended_opcode(word), spr) {
                (467, SPR_LR) => context.lr = context.gpr[rt],
                (467, SPR_CTR) => context.ctr = context.gpr[rt],
                (339, SPR_LR) => context.gpr[rt] = context.lr,
                (339, SPR_CTR) => context.gpr[rt] = context.ctr,
                // sync, eieio
                (598 | 854, _) => {}
                _ => return false,
            }
        }
        _ => return false,
    }
    true
}

impl GuestThread for SimThread
{
    fn id(&self) -> ThreadId
    {
        self.id
    }

    fn native_handle(&self) -> NativeThreadHandle
    {
        self.handle
    }

    fn can_debugger_suspend(&self) -> bool
    {
        self.suspendable
    }

    fn suspend(&self) -> DebugResult<u32>
    {
        let mut state = self.lock();
        if state.exited || state.closed {
            return Err(DebugError::ThreadControl {
                thread: self.id,
                reason: "thread has exited".to_string(),
            });
        }
        let previous = state.suspend_count;
        state.suspend_count += 1;
        Ok(previous)
    }

    fn resume(&self) -> DebugResult<u32>
    {
        let mut state = self.lock();
        state.suspend_count = state.suspend_count.saturating_sub(1);
        let remaining = state.suspend_count;
        if remaining == 0 {
            self.wake.notify_all();
        }
        Ok(remaining)
    }

    fn guest_context(&self) -> GuestContext
    {
        self.lock().context.clone()
    }

    fn is_valid(&self) -> bool
    {
        !self.lock().closed
    }

    fn start_address(&self) -> GuestAddress
    {
        self.start_address
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::ppc::encode;

    #[test]
    fn test_interpret_register_moves()
    {
        let mut context = GuestContext::default();
        assert!(interpret(&mut context, 14, encode::addi(3, 0, -4)));
        assert_eq!(context.gpr[3] as i64, -4);
        assert!(interpret(&mut context, 14, encode::addi(4, 3, 10)));
        assert_eq!(context.gpr[4], 6);
        assert!(interpret(&mut context, 31, encode::mtctr(4)));
        assert_eq!(context.ctr, 6);
        assert!(interpret(&mut context, 31, encode::mtlr(3)));
        assert!(interpret(&mut context, 31, encode::mflr(5)));
        assert_eq!(context.gpr[5], context.gpr[3]);
        assert!(interpret(&mut context, 24, ppc::NOP));
        assert!(!interpret(&mut context, 0, 0));
    }

    #[test]
    fn test_interpret_compare_sets_field()
    {
        let mut context = GuestContext::default();
        context.gpr[3] = 5;
        assert!(interpret(&mut context, 11, encode::cmpwi(1, 3, 5)));
        assert!(context.cr_field(1).eq);
        assert!(!context.cr_field(1).lt);
        assert!(interpret(&mut context, 11, encode::cmpwi(0, 3, 9)));
        assert!(context.cr_field(0).lt);
    }

    #[test]
    fn test_suspend_counts()
    {
        let thread = SimThread::new(ThreadId(1), GuestAddress::new(0x100), true);
        assert_eq!(thread.suspend().unwrap(), 0);
        assert_eq!(thread.suspend().unwrap(), 1);
        assert_eq!(thread.resume().unwrap(), 1);
        assert_eq!(thread.resume().unwrap(), 0);
        assert_eq!(thread.resume().unwrap(), 0);
        thread.close();
        assert!(!thread.is_valid());
        assert!(thread.suspend().is_err());
    }
}
