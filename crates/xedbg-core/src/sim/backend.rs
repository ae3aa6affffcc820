use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::trace;

use super::{guest_pc_for, host_pc_for, SimMemory};
use crate::backend::{Backend, Memory};
use crate::breakpoints::{Breakpoint, BreakpointAddress};
use crate::function::Function;
use crate::ppc;
use crate::thread::ThreadDebugInfo;
use crate::types::{GuestAddress, HostAddress};

/// Backend that records traps in tables the interpreter consults before
/// every instruction.
#[derive(Debug)]
pub struct SimBackend
{
    memory: Arc<SimMemory>,
    guest_traps: Mutex<HashMap<GuestAddress, u32>>,
    host_traps: Mutex<HashMap<HostAddress, u32>>,
    sync_points: RwLock<HashSet<GuestAddress>>,
    refuse_installs: AtomicBool,
}

impl SimBackend
{
    /// Create a backend decoding instructions from `memory`.
    #[must_use]
    pub fn new(memory: Arc<SimMemory>) -> Self
    {
        Self {
            memory,
            guest_traps: Mutex::new(HashMap::new()),
            host_traps: Mutex::new(HashMap::new()),
            sync_points: RwLock::new(HashSet::new()),
            refuse_installs: AtomicBool::new(false),
        }
    }

    /// Treat `address` as a synchronization point in addition to the
    /// synchronizing instructions.
    pub fn add_sync_point(&self, address: GuestAddress)
    {
        self.sync_points.write().unwrap_or_else(PoisonError::into_inner).insert(address);
    }

    /// Make every following install fail (or succeed again).
    pub fn set_refuse_installs(&self, refuse: bool)
    {
        self.refuse_installs.store(refuse, Ordering::Release);
    }

    /// Whether executing the instruction at `pc` traps.
    pub fn has_trap(&self, pc: GuestAddress) -> bool
    {
        let guest = self.guest_traps.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&pc);
        guest || self.host_traps.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&host_pc_for(pc))
    }

    /// Number of distinct addresses with at least one trap patched in.
    pub fn installed_trap_count(&self) -> usize
    {
        self.guest_traps.lock().unwrap_or_else(PoisonError::into_inner).len()
            + self.host_traps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn add_ref<K: Eq + Hash>(table: &Mutex<HashMap<K, u32>>, key: K)
{
    *table.lock().unwrap_or_else(PoisonError::into_inner).entry(key).or_insert(0) += 1;
}

fn release_ref<K: Eq + Hash>(table: &Mutex<HashMap<K, u32>>, key: &K) -> bool
{
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(count) = table.get_mut(key) else {
        return false;
    };
    *count -= 1;
    if *count == 0 {
        table.remove(key);
    }
    true
}

impl Backend for SimBackend
{
    fn install_breakpoint(&self, breakpoint: &Breakpoint, function: Option<&Function>) -> bool
    {
        if self.refuse_installs.load(Ordering::Acquire) {
            return false;
        }
        match breakpoint.address() {
            BreakpointAddress::Guest(address) => {
                if function.is_none() {
                    return false;
                }
                add_ref(&self.guest_traps, address);
            }
            BreakpointAddress::Host(address) => add_ref(&self.host_traps, address),
        }
        trace!(id = %breakpoint.id(), address = %breakpoint.address(), "trap patched");
        true
    }

    fn uninstall_breakpoint(&self, breakpoint: &Breakpoint, _function: Option<&Function>) -> bool
    {
        match breakpoint.address() {
            BreakpointAddress::Guest(address) => release_ref(&self.guest_traps, &address),
            BreakpointAddress::Host(address) => release_ref(&self.host_traps, &address),
        }
    }

    fn calculate_next_host_instruction(&self, thread: &ThreadDebugInfo, current: HostAddress) -> HostAddress
    {
        let Some(guest) = guest_pc_for(current) else {
            return current + 4;
        };
        match self.memory.load_u32(guest) {
            Some(word) => host_pc_for(ppc::next_guest_pc(guest, word, thread.guest_context())),
            None => current + 4,
        }
    }

    fn is_synchronization_point(&self, address: GuestAddress) -> bool
    {
        if self.sync_points.read().unwrap_or_else(PoisonError::into_inner).contains(&address) {
            return true;
        }
        self.memory.load_u32(address).is_some_and(ppc::is_synchronizing_instruction)
    }
}
