//! Stepping engine.
//!
//! These operations run on a debugger thread while execution is Paused. Each
//! one installs fence breakpoints, force-resumes the single target thread,
//! releases the debug lock and blocks until a fence callback fires (or the
//! configured step timeout expires). Execution stays Paused throughout; only
//! the target thread runs.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, debug_span, trace, warn};

use super::{DebugState, ExecutionState, Processor};
use crate::breakpoints::builder::BreakpointBuilder;
use crate::breakpoints::{Breakpoint, BreakpointKind};
use crate::error::{protocol_violation, DebugError, DebugResult};
use crate::fence::Fence;
use crate::ppc::{self, Instruction};
use crate::thread::current_guest_thread;
use crate::types::{GuestAddress, GuestContext, ThreadFrame, ThreadId};

impl Processor
{
    /// Run `thread` until it reaches guest address `pc`.
    ///
    /// Blocks the caller until the thread traps at `pc`; the thread is left
    /// parked there.
    ///
    /// ## Errors
    ///
    /// - `InvalidState`: execution is not paused
    /// - `UnknownThread`, `ThreadControl`: no live record for the thread
    /// - `ResolveFailed`: no function can be resolved at `pc`
    /// - `BreakpointInstallFailed`: the fence could not be placed
    /// - `StepTimedOut`: the thread did not arrive within the step timeout
    ///
    /// # Panics
    ///
    /// Calling this from `thread` itself is a protocol violation.
    pub fn step_to_guest_address(&self, thread: ThreadId, pc: GuestAddress) -> DebugResult<()>
    {
        let _span = debug_span!("step_to_guest_address", %thread, %pc).entered();
        self.ensure_function_at(pc)?;

        let fence = Fence::new();
        let signal = fence.signaller();
        let breakpoint = BreakpointBuilder::guest(pc)
            .with_kind(BreakpointKind::Fence)
            .with_callback(move |_| {
                signal.signal(());
            })
            .build();
        self.run_until_fence(thread, &[breakpoint], fence, pc)
    }

    /// Run `thread` over the branch at `pc` and report where it went.
    ///
    /// Unconditional branches resolve to their only target. For conditional
    /// branches a fence is placed on both the target and the fall-through and
    /// the first one reached wins; both are removed afterwards.
    ///
    /// ## Errors
    ///
    /// Same as [`step_to_guest_address`](Self::step_to_guest_address), plus
    /// `MemoryAccess` when the branch cannot be read.
    pub fn step_into_guest_branch_target(&self, thread: ThreadId, pc: GuestAddress) -> DebugResult<GuestAddress>
    {
        let _span = debug_span!("step_into_guest_branch_target", %thread, %pc).entered();
        let context = self.paused_guest_context(thread)?;
        let word = self.memory.load_u32(pc).ok_or(DebugError::MemoryAccess(pc))?;
        let successors: SmallVec<[GuestAddress; 2]> = match ppc::decode(pc, word) {
            Instruction::Branch(branch) => {
                trace!(mnemonic = %branch.mnemonic(), "stepping into branch");
                branch.successors(&context)
            }
            Instruction::Other { .. } => smallvec::smallvec![pc.next_instruction()],
        };

        if let [only] = successors.as_slice() {
            self.step_to_guest_address(thread, *only)?;
            return Ok(*only);
        }

        for &address in &successors {
            self.ensure_function_at(address)?;
        }
        let fence = Fence::new();
        let breakpoints: Vec<Arc<Breakpoint>> = successors
            .iter()
            .map(|&address| {
                let signal = fence.signaller();
                BreakpointBuilder::guest(address)
                    .with_kind(BreakpointKind::Fence)
                    .with_callback(move |_| {
                        signal.signal(address);
                    })
                    .build()
            })
            .collect();
        let reached = self.run_until_fence(thread, &breakpoints, fence, successors[0])?;
        debug!(%reached, "branch resolved");
        Ok(reached)
    }

    /// Move `thread` to a point where its guest state is fully materialized
    /// and return that guest address.
    ///
    /// Threads in guest code scan forward from their pc for a
    /// synchronization point or a branch (taking the branch when one is
    /// found first). Threads in host code are moved out to the guest code
    /// that called them: a thread blocked in a kernel export is reported at
    /// the export's thunk, a thread in a non-blocking export runs to its
    /// return address, and anything else runs past the innermost guest frame
    /// and scans from there. A thread with no guest frames at all runs to its
    /// entry point.
    ///
    /// ## Errors
    ///
    /// - `NoStackFrames`: nothing was captured for the thread
    /// - `NotGuestCode`: the innermost guest frame has no program counter
    /// - `NoSafePoint`: the scan limit was exhausted
    /// - any error of [`step_to_guest_address`](Self::step_to_guest_address)
    pub fn step_to_guest_safe_point(&self, thread: ThreadId, ignore_host_frames: bool) -> DebugResult<GuestAddress>
    {
        let _span = debug_span!("step_to_guest_safe_point", %thread, ignore_host_frames).entered();
        if current_guest_thread() == Some(thread) {
            protocol_violation("a thread cannot step itself to a safe point");
        }
        let (frames, context, start_address) = {
            let mut state = self.lock_state();
            require_paused(&state)?;
            self.update_thread_execution_states(&mut state.threads, None, None);
            let record = state.threads.get(thread).ok_or(DebugError::UnknownThread(thread))?;
            let start_address = record.thread.as_ref().map(|handle| handle.start_address());
            (record.frames.clone(), record.guest_context.clone(), start_address)
        };
        let first = frames.first().ok_or(DebugError::NoStackFrames(thread))?;

        if ignore_host_frames || first.is_guest() {
            let pc = match guest_frame_pc(&frames, ignore_host_frames) {
                Some(pc) => pc,
                None if ignore_host_frames => return self.step_to_thread_start(thread, start_address),
                None => return Err(DebugError::NotGuestCode(thread)),
            };
            return self.step_to_safe_point_from(thread, pc);
        }

        // Host code: find the kernel export the thread is sitting in.
        let export = frames.iter().find_map(|frame| {
            let function = frame.guest_function.as_ref()?;
            function.export().map(|export| (frame, export.clone()))
        });
        if let Some((frame, export)) = export {
            if export.blocking {
                debug!(export = %export.name, "thread blocked in export, using thunk");
                return Ok(frame.guest_function_address);
            }
            let return_address = context.link_target();
            debug!(export = %export.name, %return_address, "running out of export");
            self.step_to_guest_address(thread, return_address)?;
            return Ok(return_address);
        }

        let Some(first_guest) = frames.iter().find(|frame| frame.is_guest() && !frame.guest_pc.is_zero()) else {
            return self.step_to_thread_start(thread, start_address);
        };
        let pc = first_guest.guest_pc;
        if self.backend.is_synchronization_point(pc) {
            return Ok(pc);
        }
        self.step_to_guest_address(thread, pc.next_instruction())?;
        self.step_to_guest_safe_point(thread, true)
    }

    fn step_to_safe_point_from(&self, thread: ThreadId, pc: GuestAddress) -> DebugResult<GuestAddress>
    {
        let (safe, word) = self.scan_for_safe_point(pc)?;
        if safe != pc {
            self.step_to_guest_address(thread, safe)?;
        }
        if ppc::decode(safe, word).as_branch().is_some() {
            return self.step_into_guest_branch_target(thread, safe);
        }
        Ok(safe)
    }

    fn step_to_thread_start(&self, thread: ThreadId, start_address: Option<GuestAddress>) -> DebugResult<GuestAddress>
    {
        let start = start_address.ok_or(DebugError::NoStackFrames(thread))?;
        debug!(%start, "no guest frames, running to thread entry");
        self.step_to_guest_address(thread, start)?;
        Ok(start)
    }

    /// First synchronization point or branch at or after `pc`, with its word.
    fn scan_for_safe_point(&self, pc: GuestAddress) -> DebugResult<(GuestAddress, u32)>
    {
        let limit = self.config.safe_point_scan_limit;
        let mut address = pc;
        for _ in 0..limit {
            let word = self.memory.load_u32(address).ok_or(DebugError::MemoryAccess(address))?;
            if self.backend.is_synchronization_point(address) || ppc::decode(address, word).as_branch().is_some() {
                trace!(%address, "safe point found");
                return Ok((address, word));
            }
            address = address.next_instruction();
        }
        Err(DebugError::NoSafePoint { start: pc, limit })
    }

    fn paused_guest_context(&self, thread: ThreadId) -> DebugResult<GuestContext>
    {
        let state = self.lock_state();
        require_paused(&state)?;
        let record = state.threads.get(thread).ok_or(DebugError::UnknownThread(thread))?;
        Ok(record.guest_context.clone())
    }

    /// Install `breakpoints`, run `thread` and wait for the first fence signal.
    ///
    /// The breakpoints are removed again whether or not the thread arrived.
    /// On timeout the thread is suspended again before returning.
    fn run_until_fence<T>(
        &self,
        thread: ThreadId,
        breakpoints: &[Arc<Breakpoint>],
        fence: Fence<T>,
        target: GuestAddress,
    ) -> DebugResult<T>
    {
        if current_guest_thread() == Some(thread) {
            protocol_violation("a thread cannot step itself");
        }
        {
            let mut state = self.lock_state();
            require_paused(&state)?;
            if state.threads.get(thread).is_none() {
                return Err(DebugError::UnknownThread(thread));
            }
            for breakpoint in breakpoints {
                state.breakpoints.add(Arc::clone(breakpoint));
                if !breakpoint.install(self) {
                    self.remove_fences(&mut state, breakpoints);
                    return Err(DebugError::BreakpointInstallFailed(breakpoint.address().to_string()));
                }
            }
            if let Err(err) = state.threads.force_resume_thread(thread) {
                self.remove_fences(&mut state, breakpoints);
                return Err(err);
            }
            trace!(fences = breakpoints.len(), "thread released towards fence");
        }

        let outcome = fence.wait_timeout(self.config.step_timeout);

        let mut state = self.lock_state();
        self.remove_fences(&mut state, breakpoints);
        match outcome {
            Some(value) => Ok(value),
            None => {
                warn!(%thread, %target, "thread did not reach fence in time");
                if let Err(err) = state.threads.suspend_thread(thread) {
                    warn!(%thread, error = %err, "failed to suspend thread after timeout");
                }
                Err(DebugError::StepTimedOut {
                    thread,
                    address: target,
                })
            }
        }
    }

    fn remove_fences(&self, state: &mut DebugState, breakpoints: &[Arc<Breakpoint>])
    {
        for breakpoint in breakpoints {
            state.breakpoints.remove(breakpoint.id());
            breakpoint.uninstall(self);
        }
    }
}

fn require_paused(state: &DebugState) -> DebugResult<()>
{
    match state.execution_state {
        ExecutionState::Paused => Ok(()),
        actual => Err(DebugError::InvalidState {
            expected: ExecutionState::Paused,
            actual,
        }),
    }
}

/// Guest pc to scan from. A zero pc in the innermost frame (a thunk stub or
/// prologue) falls back to the caller's frame.
fn guest_frame_pc(frames: &[ThreadFrame], skip_host_frames: bool) -> Option<GuestAddress>
{
    let position = if skip_host_frames {
        frames.iter().position(ThreadFrame::is_guest)?
    } else {
        0
    };
    let frame = frames.get(position)?;
    if !frame.guest_pc.is_zero() {
        return Some(frame.guest_pc);
    }
    frames.get(position + 1).map(|frame| frame.guest_pc).filter(|pc| !pc.is_zero())
}
