//! Tests for the stepping engine

mod common;

use std::time::Duration;

use common::{
    at, call, expect_event, jump, kernel_exports, launched_machine, launched_machine_with, test_config, wait_until,
    CODE_BASE, KERNEL_BASE,
};
use xedbg_core::breakpoints::builder::BreakpointBuilder;
use xedbg_core::error::ResolveFailure;
use xedbg_core::events::{DebugEvent, DebugEventReceiver};
use xedbg_core::ppc::encode::{addi, bc, cmpwi, mflr, mtlr};
use xedbg_core::ppc::{BLR, SYNC};
use xedbg_core::sim::{SimMachine, SimThread, SimThreadStatus};
use xedbg_core::thread::{GuestThread, ThreadState};
use xedbg_core::types::{GuestAddress, ThreadId};
use xedbg_core::{DebugError, ExecutionState};

/// `beq` at instruction 2 jumps to 4 when `r3 == 5`, otherwise falls through to 3.
fn branch_program(r3: i16) -> Vec<u32>
{
    vec![addi(3, 0, r3), cmpwi(0, 3, 5), bc(12, 2, at(2), at(4)), addi(4, 0, 1), addi(4, 0, 2), BLR]
}

/// A `sync` at instruction 2.
fn sync_program() -> Vec<u32>
{
    vec![addi(3, 0, 1), addi(3, 3, 1), SYNC, addi(3, 3, 1), BLR]
}

/// Three increments and a jump back to the first, forever.
fn spin_program() -> Vec<u32>
{
    vec![addi(3, 3, 1), addi(4, 4, 1), addi(5, 5, 1), jump(3, 0), BLR]
}

/// Calls the export thunk at `thunk` and returns.
fn export_call_program(thunk: GuestAddress) -> Vec<u32>
{
    vec![mflr(31), call(1, thunk), mtlr(31), BLR]
}

/// Run a fresh thread at the start of the image until it traps at `stop`.
fn paused_at(machine: &SimMachine, events: &DebugEventReceiver, stop: GuestAddress) -> std::sync::Arc<SimThread>
{
    machine.processor().add_breakpoint(BreakpointBuilder::guest(stop).build());
    let thread = machine.spawn_thread(CODE_BASE).unwrap();
    expect_event(events, |event| *event == DebugEvent::ExecutionPaused);
    assert_eq!(thread.pc(), stop);
    thread
}

fn expect_step_completed(events: &DebugEventReceiver, thread: ThreadId)
{
    assert_eq!(
        expect_event(events, |event| matches!(event, DebugEvent::StepCompleted { .. })),
        DebugEvent::StepCompleted { thread }
    );
    expect_event(events, |event| *event == DebugEvent::ExecutionPaused);
}

#[test]
fn test_guest_step_follows_taken_branch()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let processor = machine.processor();
    let thread = paused_at(&machine, &events, at(2));

    processor.step_guest_instruction(thread.id()).unwrap();
    expect_step_completed(&events, thread.id());
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
    assert_eq!(thread.pc(), at(4));
    let info = processor.query_thread_debug_info(thread.id()).unwrap();
    assert!(info.step_breakpoint().is_none());
    assert!(info.is_suspended());
    assert_eq!(info.frames()[0].guest_pc, at(4));
    assert_eq!(machine.backend().installed_trap_count(), 0);

    processor.step_guest_instruction(thread.id()).unwrap();
    expect_step_completed(&events, thread.id());
    assert_eq!(thread.pc(), at(5));

    // Returning to the host (link register zero) leaves nothing to patch.
    let err = processor.step_guest_instruction(thread.id()).unwrap_err();
    assert!(matches!(
        err,
        DebugError::ResolveFailed {
            reason: ResolveFailure::NotInModule,
            ..
        }
    ));
    assert_eq!(processor.execution_state(), ExecutionState::Paused);

    processor.continue_execution();
    machine.join_thread(thread.id());
    assert_eq!(thread.guest_context().gpr[4], 2);
}

#[test]
fn test_guest_step_falls_through()
{
    let (machine, events) = launched_machine(&branch_program(4));
    let thread = paused_at(&machine, &events, at(2));

    machine.processor().step_guest_instruction(thread.id()).unwrap();
    expect_step_completed(&events, thread.id());
    assert_eq!(thread.pc(), at(3));
}

#[test]
fn test_step_after_pause_runs_exactly_one_instruction()
{
    let (machine, events) = launched_machine(&spin_program());
    let processor = machine.processor();
    let thread = machine.spawn_thread(CODE_BASE).unwrap();
    wait_until("guest thread to run", || thread.instructions_executed() > 0);

    for _ in 0..50 {
        processor.pause().unwrap();
        expect_event(&events, |event| *event == DebugEvent::ExecutionPaused);
        let paused_pc = processor
            .query_thread_debug_info(thread.id())
            .unwrap()
            .first_guest_frame()
            .unwrap()
            .guest_pc;
        assert_eq!(paused_pc, thread.pc());
        let before = thread.instructions_executed();

        processor.step_guest_instruction(thread.id()).unwrap();
        expect_step_completed(&events, thread.id());
        assert_eq!(thread.instructions_executed(), before + 1);
        assert_ne!(thread.pc(), paused_pc);

        processor.continue_execution();
        expect_event(&events, |event| *event == DebugEvent::ExecutionContinued);
    }
}

#[test]
fn test_fault_while_stepping_drops_step_breakpoint()
{
    let (machine, events) = launched_machine(&[addi(3, 0, 1), 0, addi(3, 3, 1), BLR]);
    let processor = machine.processor();
    let thread = paused_at(&machine, &events, at(1));

    // The illegal word faults instead of reaching the step trap at 2.
    processor.step_guest_instruction(thread.id()).unwrap();
    expect_event(&events, |event| *event == DebugEvent::ExecutionPaused);
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
    let info = processor.query_thread_debug_info(thread.id()).unwrap();
    assert!(info.step_breakpoint().is_none());
    assert!(info.is_suspended());
    assert_eq!(machine.backend().installed_trap_count(), 0);

    // Stepping again lets the faulted thread exit, which abandons that step too.
    processor.step_guest_instruction(thread.id()).unwrap();
    expect_event(&events, |event| *event == DebugEvent::ExecutionPaused);
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
    assert_eq!(thread.status(), SimThreadStatus::Exited);
    let info = processor.query_thread_debug_info(thread.id()).unwrap();
    assert_eq!(info.state(), ThreadState::Exited);
    assert!(info.step_breakpoint().is_none());
    assert_eq!(machine.backend().installed_trap_count(), 0);
}

#[test]
fn test_host_step()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let thread = paused_at(&machine, &events, at(2));

    machine.processor().step_host_instruction(thread.id()).unwrap();
    expect_step_completed(&events, thread.id());
    assert_eq!(thread.pc(), at(4));
    assert_eq!(machine.backend().installed_trap_count(), 0);
}

#[test]
fn test_step_errors()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let processor = machine.processor();
    let thread = paused_at(&machine, &events, at(2));

    assert!(matches!(
        processor.step_guest_instruction(ThreadId(99)),
        Err(DebugError::UnknownThread(ThreadId(99)))
    ));

    machine.backend().set_refuse_installs(true);
    assert!(matches!(
        processor.step_guest_instruction(thread.id()),
        Err(DebugError::BreakpointInstallFailed(_))
    ));
    machine.backend().set_refuse_installs(false);

    // A failed step leaves the thread paused and steppable.
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
    assert!(processor.query_thread_debug_info(thread.id()).unwrap().step_breakpoint().is_none());
    processor.step_guest_instruction(thread.id()).unwrap();
    expect_step_completed(&events, thread.id());
}

#[test]
fn test_branch_race_picks_taken_side()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let processor = machine.processor();
    let thread = paused_at(&machine, &events, at(2));

    let reached = processor.step_into_guest_branch_target(thread.id(), at(2)).unwrap();

    assert_eq!(reached, at(4));
    assert_eq!(thread.pc(), at(4));
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
    // Both fences are gone; only the user breakpoint remains (uninstalled).
    assert_eq!(processor.breakpoints().len(), 1);
    assert_eq!(machine.backend().installed_trap_count(), 0);
    assert!(processor.query_thread_debug_info(thread.id()).unwrap().is_suspended());
}

#[test]
fn test_branch_race_picks_fall_through()
{
    let (machine, events) = launched_machine(&branch_program(4));
    let thread = paused_at(&machine, &events, at(2));

    let reached = machine.processor().step_into_guest_branch_target(thread.id(), at(2)).unwrap();

    assert_eq!(reached, at(3));
    assert_eq!(thread.pc(), at(3));
    assert_eq!(machine.backend().installed_trap_count(), 0);
}

#[test]
fn test_step_into_non_branch_goes_to_next_instruction()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let thread = paused_at(&machine, &events, at(0));

    let reached = machine.processor().step_into_guest_branch_target(thread.id(), at(0)).unwrap();
    assert_eq!(reached, at(1));
    assert_eq!(thread.pc(), at(1));
}

#[test]
fn test_step_to_guest_address()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let processor = machine.processor();
    let thread = paused_at(&machine, &events, at(0));

    processor.step_to_guest_address(thread.id(), at(5)).unwrap();

    assert_eq!(thread.pc(), at(5));
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
    assert_eq!(thread.guest_context().gpr[4], 2);
    assert_eq!(processor.breakpoints().len(), 1);

    assert!(matches!(
        processor.step_to_guest_address(thread.id(), GuestAddress::new(0x9000_0000)),
        Err(DebugError::ResolveFailed { .. })
    ));
}

#[test]
fn test_step_to_guest_address_times_out()
{
    let config = test_config().with_step_timeout(Duration::from_millis(50));
    let (machine, events) = launched_machine_with(config, &[addi(3, 3, 1), jump(1, 0), BLR]);
    let processor = machine.processor();
    let thread = paused_at(&machine, &events, at(0));

    let err = processor.step_to_guest_address(thread.id(), at(2)).unwrap_err();

    assert!(matches!(err, DebugError::StepTimedOut { thread: id, address } if id == thread.id() && address == at(2)));
    assert!(processor.query_thread_debug_info(thread.id()).unwrap().is_suspended());
    assert_eq!(processor.breakpoints().len(), 1);
    assert_eq!(machine.backend().installed_trap_count(), 0);

    std::thread::sleep(Duration::from_millis(20));
    let executed = thread.instructions_executed();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(thread.instructions_executed(), executed);
}

#[test]
fn test_stepping_requires_pause()
{
    let (machine, _events) = launched_machine(&branch_program(5));
    let processor = machine.processor();
    processor.resolve_function(CODE_BASE).unwrap();

    assert!(matches!(
        processor.step_to_guest_address(ThreadId(1), at(1)),
        Err(DebugError::InvalidState {
            expected: ExecutionState::Paused,
            actual: ExecutionState::Running,
        })
    ));
    assert!(matches!(
        processor.step_to_guest_safe_point(ThreadId(1), false),
        Err(DebugError::InvalidState { .. })
    ));
}

#[test]
fn test_pause_while_stepping_is_rejected()
{
    let thunk = KERNEL_BASE + 4;
    let (machine, _events) = launched_machine(&export_call_program(thunk));
    machine.load_builtin_module("xboxkrnl.exe", KERNEL_BASE, kernel_exports());
    let processor = machine.processor();
    let thread = machine.spawn_thread(CODE_BASE).unwrap();
    wait_until("thread to block", || thread.status() == SimThreadStatus::HostCall(thunk));
    processor.pause().unwrap();

    // The next host instruction inside the blocked export is never reached.
    processor.step_host_instruction(thread.id()).unwrap();
    assert_eq!(processor.execution_state(), ExecutionState::Stepping);

    let err = processor.pause().unwrap_err();
    assert!(matches!(
        err,
        DebugError::InvalidState {
            expected: ExecutionState::Running,
            actual: ExecutionState::Stepping,
        }
    ));
}

#[test]
#[should_panic(expected = "protocol violation")]
fn test_continue_while_stepping_panics()
{
    let thunk = KERNEL_BASE + 4;
    let (machine, _events) = launched_machine(&export_call_program(thunk));
    machine.load_builtin_module("xboxkrnl.exe", KERNEL_BASE, kernel_exports());
    let processor = machine.processor();
    let thread = machine.spawn_thread(CODE_BASE).unwrap();
    wait_until("thread to block", || thread.status() == SimThreadStatus::HostCall(thunk));
    processor.pause().unwrap();
    processor.step_host_instruction(thread.id()).unwrap();

    processor.continue_execution();
}

#[test]
fn test_safe_point_scans_to_sync()
{
    let (machine, events) = launched_machine(&sync_program());
    let thread = paused_at(&machine, &events, at(0));

    let safe = machine.processor().step_to_guest_safe_point(thread.id(), false).unwrap();

    assert_eq!(safe, at(2));
    assert_eq!(thread.pc(), at(2));
}

#[test]
fn test_safe_point_at_sync_does_not_move()
{
    let (machine, events) = launched_machine(&sync_program());
    let thread = paused_at(&machine, &events, at(2));
    let executed = thread.instructions_executed();

    let safe = machine.processor().step_to_guest_safe_point(thread.id(), false).unwrap();

    assert_eq!(safe, at(2));
    assert_eq!(thread.instructions_executed(), executed);
}

#[test]
fn test_safe_point_takes_branch()
{
    let (machine, events) = launched_machine(&branch_program(5));
    let thread = paused_at(&machine, &events, at(0));

    let safe = machine.processor().step_to_guest_safe_point(thread.id(), false).unwrap();

    assert_eq!(safe, at(4));
    assert_eq!(thread.pc(), at(4));
}

#[test]
fn test_safe_point_scan_limit()
{
    let config = test_config().with_safe_point_scan_limit(1);
    let (machine, events) = launched_machine_with(config, &sync_program());
    let thread = paused_at(&machine, &events, at(0));

    let err = machine.processor().step_to_guest_safe_point(thread.id(), false).unwrap_err();
    assert!(matches!(err, DebugError::NoSafePoint { start, limit: 1 } if start == at(0)));
}

#[test]
fn test_safe_point_in_blocking_export_is_thunk()
{
    let thunk = KERNEL_BASE + 4;
    let (machine, _events) = launched_machine(&export_call_program(thunk));
    machine.load_builtin_module("xboxkrnl.exe", KERNEL_BASE, kernel_exports());
    let processor = machine.processor();
    let thread = machine.spawn_thread(CODE_BASE).unwrap();
    wait_until("thread to block", || thread.status() == SimThreadStatus::HostCall(thunk));
    processor.pause().unwrap();

    let info = processor.query_thread_debug_info(thread.id()).unwrap();
    assert!(!info.frames()[0].is_guest());
    assert_eq!(info.frames()[0].name, "xboxkrnl::KeWaitForSingleObject");

    let safe = processor.step_to_guest_safe_point(thread.id(), false).unwrap();

    assert_eq!(safe, thunk);
    assert_eq!(thread.status(), SimThreadStatus::HostCall(thunk));
}

#[test]
fn test_safe_point_in_export_runs_to_return()
{
    let thunk = KERNEL_BASE;
    let (machine, _events) = launched_machine(&export_call_program(thunk));
    machine.load_builtin_module("xboxkrnl.exe", KERNEL_BASE, kernel_exports());
    let processor = machine.processor();
    let thread = machine.spawn_thread_with(CODE_BASE, |thread| thread.set_host_call_ticks(200)).unwrap();
    wait_until("thread to enter the export", || thread.status() == SimThreadStatus::HostCall(thunk));
    processor.pause().unwrap();

    let safe = processor.step_to_guest_safe_point(thread.id(), false).unwrap();

    assert_eq!(safe, at(2));
    assert_eq!(thread.status(), SimThreadStatus::Guest(at(2)));
    assert_eq!(processor.execution_state(), ExecutionState::Paused);
}
