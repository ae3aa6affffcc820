//! Tests for the function registry

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{at, kernel_exports, test_config, CODE_BASE, KERNEL_BASE};
use xedbg_core::breakpoints::builder::BreakpointBuilder;
use xedbg_core::error::{DebugError, ResolveFailure};
use xedbg_core::function::{FunctionStatus, Module};
use xedbg_core::ppc::{BLR, NOP};
use xedbg_core::registry::{EntryStatus, FunctionRegistry};
use xedbg_core::sim::{SimMachine, SimMemory, SimModule};
use xedbg_core::types::GuestAddress;

fn guest_module(words: &[u32]) -> Arc<SimModule>
{
    Arc::new(SimModule::guest("default.xex", CODE_BASE, words, Arc::new(SimMemory::new())))
}

#[test]
fn test_resolve_is_idempotent()
{
    let registry = FunctionRegistry::new();
    let module = guest_module(&[NOP, NOP, BLR]);
    registry.add_module(module.clone());

    let first = registry.resolve(CODE_BASE).unwrap();
    let second = registry.resolve(CODE_BASE).unwrap();

    assert!(first.newly_defined);
    assert!(!second.newly_defined);
    assert!(Arc::ptr_eq(&first.function, &second.function));
    assert_eq!(first.function.status(), FunctionStatus::Defined);
    assert_eq!(first.function.end_address(), Some(at(2)));
    assert_eq!(module.declare_calls(), 1);
    assert_eq!(module.define_calls(), 1);
    assert_eq!(registry.entry_status(CODE_BASE), Some(EntryStatus::Ready));
}

#[test]
fn test_concurrent_first_touch_defines_once()
{
    let registry = Arc::new(FunctionRegistry::new());
    let module = Arc::new(
        SimModule::guest("default.xex", CODE_BASE, &[NOP, BLR], Arc::new(SimMemory::new()))
            .with_define_delay(Duration::from_millis(20)),
    );
    registry.add_module(module.clone());

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                registry.resolve(CODE_BASE).unwrap()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|resolved| resolved.newly_defined).count(), 1);
    assert!(results.iter().all(|resolved| Arc::ptr_eq(&resolved.function, &results[0].function)));
    assert_eq!(module.declare_calls(), 1);
    assert_eq!(module.define_calls(), 1);
}

#[test]
fn test_failures_are_cached()
{
    let registry = FunctionRegistry::new();
    let module = guest_module(&[NOP, BLR, NOP, BLR]);
    module.fail_definition_at(at(2));
    registry.add_module(module.clone());

    for _ in 0..3 {
        match registry.resolve_function(at(2)) {
            Err(DebugError::ResolveFailed {
                address,
                reason: ResolveFailure::DefineFailed(_),
            }) => assert_eq!(address, at(2)),
            other => panic!("Expected cached define failure, got {other:?}"),
        }
    }
    assert_eq!(module.define_calls(), 1);
    assert_eq!(registry.entry_status(at(2)), Some(EntryStatus::Failed));

    // Other addresses in the module are unaffected.
    assert!(registry.resolve_function(CODE_BASE).is_ok());
}

#[test]
fn test_remove_module_forgets_its_failures()
{
    let registry = FunctionRegistry::new();
    let broken = guest_module(&[NOP, BLR, NOP, BLR]);
    broken.fail_definition_at(at(2));
    registry.add_module(broken);
    let outside = GuestAddress::new(0x9000_0000);

    assert!(registry.resolve_function(at(2)).is_err());
    assert!(registry.resolve_function(outside).is_err());
    assert!(registry.remove_module("default.xex"));
    assert_eq!(registry.entry_status(at(2)), None);
    assert_eq!(registry.entry_status(outside), Some(EntryStatus::Failed));

    // A fixed image loaded under the same name resolves the address again.
    let fixed = guest_module(&[NOP, BLR, NOP, BLR]);
    registry.add_module(fixed.clone());
    let function = registry.resolve_function(at(2)).unwrap();
    assert_eq!(function.status(), FunctionStatus::Defined);
    assert_eq!(fixed.define_calls(), 1);
}

#[test]
fn test_address_outside_modules()
{
    let registry = FunctionRegistry::new();
    registry.add_module(guest_module(&[BLR]));

    let address = GuestAddress::new(0x9000_0000);
    let err = registry.resolve_function(address).unwrap_err();
    assert!(matches!(
        err,
        DebugError::ResolveFailed {
            reason: ResolveFailure::NotInModule,
            ..
        }
    ));
    assert_eq!(registry.entry_status(address), Some(EntryStatus::Failed));
    assert!(registry.lookup_module(address).is_none());
}

#[test]
fn test_declare_failure_from_builtin()
{
    let registry = FunctionRegistry::new();
    let module = SimModule::builtin("xboxkrnl.exe", KERNEL_BASE, kernel_exports(), Arc::new(SimMemory::new()));
    registry.add_module(Arc::new(module));

    let err = registry.resolve_function(KERNEL_BASE + 2).unwrap_err();
    assert!(matches!(
        err,
        DebugError::ResolveFailed {
            reason: ResolveFailure::DeclareFailed(_),
            ..
        }
    ));

    let thunk = registry.resolve_function(KERNEL_BASE + 4).unwrap();
    assert_eq!(thunk.export().map(|export| export.name.as_str()), Some("KeWaitForSingleObject"));
    assert!(!thunk.is_guest());
}

#[test]
fn test_lookup_never_resolves()
{
    let registry = FunctionRegistry::new();
    registry.add_module(guest_module(&[NOP, NOP, BLR, NOP]));

    assert!(registry.lookup_functions_with_address(at(1)).is_empty());
    assert!(registry.is_empty());

    registry.resolve_function(CODE_BASE).unwrap();
    assert_eq!(registry.lookup_functions_with_address(at(1)).len(), 1);
    assert_eq!(registry.lookup_functions_with_address(at(2)).len(), 1);
    assert!(registry.lookup_functions_with_address(at(3)).is_empty());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_earlier_modules_win()
{
    let registry = FunctionRegistry::new();
    let memory = Arc::new(SimMemory::new());
    registry.add_module(Arc::new(SimModule::guest("first.xex", CODE_BASE, &[BLR], memory.clone())));
    registry.add_module(Arc::new(SimModule::guest("second.xex", CODE_BASE, &[BLR], memory)));

    assert_eq!(registry.lookup_module(CODE_BASE).map(|module| module.name().to_string()).as_deref(), Some("first.xex"));
    assert_eq!(registry.resolve_function(CODE_BASE).unwrap().module_name(), "first.xex");
}

#[test]
fn test_remove_module_evicts_functions()
{
    let registry = FunctionRegistry::new();
    registry.add_module(guest_module(&[NOP, BLR]));
    registry.resolve_function(CODE_BASE).unwrap();

    assert!(registry.remove_module("default.xex"));
    assert!(!registry.remove_module("default.xex"));
    assert!(registry.lookup_module(CODE_BASE).is_none());
    assert!(registry.lookup_functions_with_address(CODE_BASE).is_empty());
    assert!(matches!(
        registry.resolve_function(CODE_BASE),
        Err(DebugError::ResolveFailed {
            reason: ResolveFailure::NotInModule,
            ..
        })
    ));
}

#[test]
fn test_definition_installs_pending_breakpoints_while_running()
{
    let machine = SimMachine::new(test_config());
    machine.load_guest_module("default.xex", CODE_BASE, &[NOP, NOP, BLR]);
    let processor = machine.processor();
    processor.pre_launch();

    let id = processor.add_breakpoint(BreakpointBuilder::guest(at(1)).build());
    let breakpoint = processor.breakpoint(id).unwrap();
    assert!(!breakpoint.is_installed());

    processor.resolve_function(CODE_BASE).unwrap();
    assert!(breakpoint.is_installed());
    assert_eq!(breakpoint.installed_functions().len(), 1);
    assert!(machine.backend().has_trap(at(1)));

    assert!(processor.remove_module("default.xex"));
    assert!(!breakpoint.is_installed());
    assert_eq!(machine.backend().installed_trap_count(), 0);
    // The breakpoint itself survives the unload.
    assert_eq!(processor.breakpoints().len(), 1);
}

#[test]
fn test_definition_while_paused_leaves_breakpoints_pending()
{
    let machine = SimMachine::new(test_config());
    machine.load_guest_module("default.xex", CODE_BASE, &[NOP, BLR]);
    let processor = machine.processor();

    let id = processor.add_breakpoint(BreakpointBuilder::guest(CODE_BASE).build());
    processor.resolve_function(CODE_BASE).unwrap();
    assert!(!processor.breakpoint(id).unwrap().is_installed());

    processor.continue_execution();
    assert!(processor.breakpoint(id).unwrap().is_installed());
}
