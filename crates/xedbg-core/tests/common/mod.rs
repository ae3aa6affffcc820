//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use xedbg_core::config::ProcessorConfig;
use xedbg_core::events::{ChannelListener, DebugEvent, DebugEventReceiver};
use xedbg_core::function::Export;
use xedbg_core::sim::SimMachine;
use xedbg_core::types::GuestAddress;

/// Load address of the guest image used by every test.
pub const CODE_BASE: GuestAddress = GuestAddress::new(0x8200_0000);
/// Load address of the kernel export thunks.
pub const KERNEL_BASE: GuestAddress = GuestAddress::new(0x8210_0000);
/// Upper bound on any wait in the tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Config with a bounded step wait, so a broken step fails instead of hanging.
pub fn test_config() -> ProcessorConfig
{
    xedbg_utils::init_test_logging();
    ProcessorConfig::default().with_step_timeout(TIMEOUT)
}

/// Machine with `words` loaded at [`CODE_BASE`], launched and with a channel
/// listener attached.
pub fn launched_machine(words: &[u32]) -> (SimMachine, DebugEventReceiver)
{
    launched_machine_with(test_config(), words)
}

/// Like [`launched_machine`], with a custom config.
pub fn launched_machine_with(config: ProcessorConfig, words: &[u32]) -> (SimMachine, DebugEventReceiver)
{
    let machine = SimMachine::new(config);
    machine.load_guest_module("default.xex", CODE_BASE, words);
    let (listener, events) = ChannelListener::new();
    machine.processor().set_debug_listener(Some(listener));
    machine.processor().pre_launch();
    (machine, events)
}

/// Kernel exports used by the host call tests.
pub fn kernel_exports() -> Vec<Export>
{
    vec![
        Export {
            name: "NtClose".to_string(),
            ordinal: 25,
            blocking: false,
        },
        Export {
            name: "KeWaitForSingleObject".to_string(),
            ordinal: 8,
            blocking: true,
        },
    ]
}

/// Address of the `index`th instruction of the test image.
pub fn at(index: u32) -> GuestAddress
{
    CODE_BASE + index * 4
}

/// Receive events until one satisfies `wanted`, failing after [`TIMEOUT`].
pub fn expect_event<F>(events: &DebugEventReceiver, wanted: F) -> DebugEvent
where
    F: Fn(&DebugEvent) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if wanted(&event) => return event,
            Ok(_) => {}
            Err(err) => panic!("expected debug event did not arrive: {err}"),
        }
    }
}

/// Poll `condition` until it holds, failing after [`TIMEOUT`].
pub fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// `bl` from the `index`th instruction to `target`.
pub fn call(index: u32, target: GuestAddress) -> u32
{
    xedbg_core::ppc::encode::b(at(index), target, true)
}

/// `b` from the `index`th instruction to the `to`th.
pub fn jump(index: u32, to: u32) -> u32
{
    xedbg_core::ppc::encode::b(at(index), at(to), false)
}
