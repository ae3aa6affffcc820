//! # In-memory guest machine
//!
//! A small interpreter that implements every collaborator the [`Processor`]
//! needs, so the debugger can be driven end to end without a real
//! recompiler: big-endian guest memory, a trap-patching backend, a stack
//! walker, guest and builtin modules, and guest threads backed by OS threads.
//!
//! The interpreter understands the instructions [`ppc::encode`] can produce
//! (`addi`, `cmpwi`, `mtlr`/`mtctr`/`mflr`, `ori`, the synchronizing
//! instructions and every branch form). A `bl` into a builtin module enters a
//! host call for the export behind the thunk; returning through `blr` with a
//! zero link register exits the thread.
//!
//! [`Processor`]: crate::Processor
//! [`ppc::encode`]: crate::ppc::encode

mod backend;
mod machine;
mod memory;
mod module;
mod stack;
mod thread;

pub use backend::SimBackend;
pub use machine::SimMachine;
pub use memory::SimMemory;
pub use module::SimModule;
pub use stack::{mangle_export_symbol, SimStackWalker};
pub use thread::{SimThread, SimThreadStatus};

use crate::types::{GuestAddress, HostAddress};

/// Host address translated guest code is laid out at.
pub const HOST_CODE_BASE: u64 = 0x1_0000_0000;
/// Host address of the first export implementation.
pub const HOST_EXPORT_BASE: u64 = 0x2_0000_0000;
/// Host code size reserved per export.
pub const HOST_EXPORT_STRIDE: u64 = 0x100;

/// Host address of the translated code for `guest`.
pub const fn host_pc_for(guest: GuestAddress) -> HostAddress
{
    HostAddress::new(HOST_CODE_BASE + guest.value() as u64)
}

/// Guest address a host pc inside translated code belongs to.
#[allow(clippy::cast_possible_truncation)]
pub const fn guest_pc_for(host: HostAddress) -> Option<GuestAddress>
{
    let value = host.value();
    if value >= HOST_CODE_BASE && value < HOST_CODE_BASE + (1 << 32) {
        Some(GuestAddress::new((value - HOST_CODE_BASE) as u32))
    } else {
        None
    }
}

/// Entry point of the host implementation of export `ordinal`.
pub const fn export_host_address(ordinal: u32) -> HostAddress
{
    HostAddress::new(HOST_EXPORT_BASE + ordinal as u64 * HOST_EXPORT_STRIDE)
}
