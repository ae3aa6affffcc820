//! Breakpoint bookkeeping.
//!
//! A [`Breakpoint`] is a shared trap request keyed by a guest or host address.
//! The [`BreakpointManager`] keeps the ordered set of active breakpoints and
//! drives installation through the code generation backend. It never locks on
//! its own; the processor only touches it while holding the debug lock.
//!
//! Guest-addressed breakpoints are installed into every resolved function that
//! covers the address. A guest breakpoint whose address is not covered by any
//! resolved function stays pending and is installed as soon as a covering
//! function is defined (or on the next resume).

pub mod builder;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use smallvec::SmallVec;
use tracing::{error, trace};

use crate::backend::Backend;
use crate::function::Function;
use crate::types::{GuestAddress, HostAddress, ThreadId};

static NEXT_BREAKPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }

    fn allocate() -> Self
    {
        Self(NEXT_BREAKPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BreakpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Address space a breakpoint is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BreakpointAddress
{
    /// Guest program counter; patched into translated code.
    Guest(GuestAddress),
    /// Host code address; patched directly.
    Host(HostAddress),
}

impl fmt::Display for BreakpointAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Guest(address) => write!(f, "guest {address}"),
            Self::Host(address) => write!(f, "host {address}"),
        }
    }
}

/// Who owns a breakpoint and how a hit is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind
{
    /// Requested by the user; hits are reported to the listener.
    User,
    /// One-shot breakpoint owned by a stepping thread's debug record.
    Step,
    /// Internal breakpoint whose callback completes a stepping wait.
    Fence,
}

/// Location where a thread trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite
{
    /// Guest program counter, when the trap maps to a guest instruction.
    pub guest: Option<GuestAddress>,
    /// Host program counter of the trap.
    pub host: HostAddress,
}

/// Details handed to a breakpoint callback.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointHit
{
    /// Breakpoint that fired.
    pub breakpoint: BreakpointId,
    /// Address the breakpoint is keyed on.
    pub address: BreakpointAddress,
    /// Thread that trapped.
    pub thread: ThreadId,
    /// Where the thread trapped.
    pub site: TrapSite,
}

/// Callback invoked (outside the debug lock) when a breakpoint fires.
pub type HitCallback = Arc<dyn Fn(&BreakpointHit) + Send + Sync>;

#[derive(Default)]
struct InstallState
{
    installed: bool,
    functions: SmallVec<[Arc<Function>; 2]>,
    installed_at: Option<SystemTime>,
}

/// A trap request.
pub struct Breakpoint
{
    id: BreakpointId,
    address: BreakpointAddress,
    kind: BreakpointKind,
    callback: Option<HitCallback>,
    enabled: AtomicBool,
    hit_count: AtomicU64,
    requested_at: SystemTime,
    install: Mutex<InstallState>,
}

impl Breakpoint
{
    pub(crate) fn new(address: BreakpointAddress, kind: BreakpointKind, callback: Option<HitCallback>, enabled: bool)
        -> Self
    {
        Self {
            id: BreakpointId::allocate(),
            address,
            kind,
            callback,
            enabled: AtomicBool::new(enabled),
            hit_count: AtomicU64::new(0),
            requested_at: SystemTime::now(),
            install: Mutex::new(InstallState::default()),
        }
    }

    /// Unique identifier.
    pub fn id(&self) -> BreakpointId
    {
        self.id
    }

    /// Address the breakpoint is keyed on.
    pub fn address(&self) -> BreakpointAddress
    {
        self.address
    }

    /// Guest address, for guest-keyed breakpoints.
    pub fn guest_address(&self) -> Option<GuestAddress>
    {
        match self.address {
            BreakpointAddress::Guest(address) => Some(address),
            BreakpointAddress::Host(_) => None,
        }
    }

    /// Owner/reporting kind.
    pub fn kind(&self) -> BreakpointKind
    {
        self.kind
    }

    /// Whether the breakpoint should trap when installed.
    pub fn is_enabled(&self) -> bool
    {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool)
    {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the trap is currently patched into code.
    pub fn is_installed(&self) -> bool
    {
        self.install_state().installed
    }

    /// Functions the trap is patched into (guest breakpoints only).
    pub fn installed_functions(&self) -> Vec<Arc<Function>>
    {
        self.install_state().functions.to_vec()
    }

    /// Number of times the breakpoint fired.
    pub fn hit_count(&self) -> u64
    {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) -> u64
    {
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether a trap at `site` belongs to this breakpoint.
    pub fn matches(&self, site: &TrapSite) -> bool
    {
        match self.address {
            BreakpointAddress::Guest(address) => site.guest == Some(address),
            BreakpointAddress::Host(address) => site.host == address,
        }
    }

    /// Run the hit callback, if any.
    pub(crate) fn dispatch(&self, hit: &BreakpointHit)
    {
        if let Some(callback) = &self.callback {
            callback(hit);
        }
    }

    /// Snapshot of the public state.
    pub fn info(&self) -> BreakpointInfo
    {
        let state = self.install_state();
        BreakpointInfo {
            id: self.id,
            address: self.address,
            kind: self.kind,
            enabled: self.is_enabled(),
            installed: state.installed,
            function_count: state.functions.len(),
            hit_count: self.hit_count(),
            requested_at: self.requested_at,
            installed_at: state.installed_at,
        }
    }

    fn install_state(&self) -> std::sync::MutexGuard<'_, InstallState>
    {
        self.install.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Patch the trap into code.
    ///
    /// Guest breakpoints are installed into every resolved function covering the
    /// address; with no covering function the breakpoint stays pending and this
    /// returns `false`.
    pub(crate) fn install<Ops: BreakpointOperations + ?Sized>(&self, ops: &Ops) -> bool
    {
        if self.is_installed() {
            return true;
        }
        match self.address {
            BreakpointAddress::Guest(address) => {
                let functions = ops.functions_covering(address);
                if functions.is_empty() {
                    trace!(id = %self.id, %address, "no covering function, breakpoint pending");
                    return false;
                }
                for function in functions {
                    self.install_into(&function, ops);
                }
                self.is_installed()
            }
            BreakpointAddress::Host(_) => {
                let installed = ops.backend().install_breakpoint(self, None);
                if installed {
                    let mut state = self.install_state();
                    state.installed = true;
                    state.installed_at = Some(SystemTime::now());
                }
                installed
            }
        }
    }

    /// Patch a guest breakpoint into one more function.
    pub(crate) fn install_into<Ops: BreakpointOperations + ?Sized>(&self, function: &Arc<Function>, ops: &Ops) -> bool
    {
        let Some(address) = self.guest_address() else {
            return false;
        };
        if !function.contains(address) {
            return false;
        }
        if self.install_state().functions.iter().any(|f| Arc::ptr_eq(f, function)) {
            return true;
        }
        if !ops.backend().install_breakpoint(self, Some(function)) {
            return false;
        }
        let mut state = self.install_state();
        state.functions.push(Arc::clone(function));
        state.installed = true;
        state.installed_at.get_or_insert_with(SystemTime::now);
        trace!(id = %self.id, %address, function = function.name(), "breakpoint installed");
        true
    }

    /// Remove the trap from code.
    pub(crate) fn uninstall<Ops: BreakpointOperations + ?Sized>(&self, ops: &Ops)
    {
        let (installed, functions) = {
            let mut state = self.install_state();
            state.installed_at = None;
            (std::mem::take(&mut state.installed), std::mem::take(&mut state.functions))
        };
        if !installed {
            return;
        }
        match self.address {
            BreakpointAddress::Guest(_) => {
                for function in &functions {
                    ops.backend().uninstall_breakpoint(self, Some(function));
                }
            }
            BreakpointAddress::Host(_) => {
                ops.backend().uninstall_breakpoint(self, None);
            }
        }
        trace!(id = %self.id, address = %self.address, "breakpoint uninstalled");
    }
}

impl Drop for Breakpoint
{
    fn drop(&mut self)
    {
        let state = self.install.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.installed {
            error!(id = %self.id, address = %self.address, "breakpoint dropped while still installed");
        }
    }
}

impl fmt::Debug for Breakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Breakpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("installed", &self.is_installed())
            .field("hit_count", &self.hit_count())
            .finish_non_exhaustive()
    }
}

/// Public information about a breakpoint.
#[derive(Debug, Clone)]
pub struct BreakpointInfo
{
    /// Unique identifier for this breakpoint.
    pub id: BreakpointId,
    /// Address the breakpoint is keyed on.
    pub address: BreakpointAddress,
    /// Owner/reporting kind.
    pub kind: BreakpointKind,
    /// Whether the breakpoint is enabled.
    pub enabled: bool,
    /// Whether the trap is currently patched into code.
    pub installed: bool,
    /// Number of functions the trap is patched into.
    pub function_count: usize,
    /// Number of times this breakpoint has been hit.
    pub hit_count: u64,
    /// Timestamp when the breakpoint was created.
    pub requested_at: SystemTime,
    /// Timestamp of the current installation, if installed.
    pub installed_at: Option<SystemTime>,
}

/// Access to the collaborators breakpoint installation needs.
pub(crate) trait BreakpointOperations
{
    /// Code generation backend that patches traps.
    fn backend(&self) -> &dyn Backend;

    /// Resolved functions covering a guest address.
    fn functions_covering(&self, address: GuestAddress) -> SmallVec<[Arc<Function>; 4]>;
}

/// Ordered set of active breakpoints.
#[derive(Debug, Default)]
pub struct BreakpointManager
{
    active: BTreeMap<BreakpointId, Arc<Breakpoint>>,
}

impl BreakpointManager
{
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add a breakpoint to the active set. Returns `false` if it was already present.
    pub fn add(&mut self, breakpoint: Arc<Breakpoint>) -> bool
    {
        let id = breakpoint.id();
        if self.active.contains_key(&id) {
            return false;
        }
        self.active.insert(id, breakpoint);
        true
    }

    /// Remove a breakpoint from the active set without touching its installation.
    pub fn remove(&mut self, id: BreakpointId) -> Option<Arc<Breakpoint>>
    {
        self.active.remove(&id)
    }

    /// Look up a breakpoint by id.
    pub fn get(&self, id: BreakpointId) -> Option<&Arc<Breakpoint>>
    {
        self.active.get(&id)
    }

    /// First breakpoint keyed on `address`.
    pub fn find_by_address(&self, address: BreakpointAddress) -> Option<&Arc<Breakpoint>>
    {
        self.active.values().find(|breakpoint| breakpoint.address() == address)
    }

    /// Installed, enabled breakpoints a trap at `site` belongs to.
    pub fn matching(&self, site: &TrapSite) -> Vec<Arc<Breakpoint>>
    {
        self.active
            .values()
            .filter(|breakpoint| breakpoint.is_enabled() && breakpoint.is_installed() && breakpoint.matches(site))
            .cloned()
            .collect()
    }

    /// Uninstall every installed breakpoint (they stay in the active set).
    pub(crate) fn suspend_all<Ops: BreakpointOperations + ?Sized>(&self, ops: &Ops)
    {
        for breakpoint in self.active.values() {
            breakpoint.uninstall(ops);
        }
    }

    /// Install every enabled breakpoint. Returns how many are installed afterwards.
    pub(crate) fn resume_all<Ops: BreakpointOperations + ?Sized>(&self, ops: &Ops) -> usize
    {
        self.active
            .values()
            .filter(|breakpoint| breakpoint.is_enabled())
            .filter(|breakpoint| breakpoint.install(ops))
            .count()
    }

    /// Install enabled guest breakpoints covered by a freshly defined function.
    pub(crate) fn install_pending_into<Ops: BreakpointOperations + ?Sized>(&self, function: &Arc<Function>, ops: &Ops)
        -> usize
    {
        self.active
            .values()
            .filter(|breakpoint| breakpoint.is_enabled())
            .filter(|breakpoint| breakpoint.install_into(function, ops))
            .count()
    }

    /// Snapshot of every active breakpoint, in id order.
    pub fn list(&self) -> Vec<BreakpointInfo>
    {
        self.active.values().map(|breakpoint| breakpoint.info()).collect()
    }

    /// Iterate the active breakpoints in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Breakpoint>>
    {
        self.active.values()
    }

    /// Number of active breakpoints.
    pub fn len(&self) -> usize
    {
        self.active.len()
    }

    /// Whether the active set is empty.
    pub fn is_empty(&self) -> bool
    {
        self.active.is_empty()
    }

    /// Remove every breakpoint, returning them (still installed, if they were).
    pub fn drain(&mut self) -> Vec<Arc<Breakpoint>>
    {
        std::mem::take(&mut self.active).into_values().collect()
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::Mutex;

    use super::builder::BreakpointBuilder;
    use super::*;
    use crate::function::FunctionKind;
    use crate::thread::ThreadDebugInfo;

    #[derive(Default)]
    struct RecordingBackend
    {
        installs: Mutex<Vec<(BreakpointId, Option<GuestAddress>)>>,
        uninstalls: Mutex<Vec<BreakpointId>>,
    }

    impl Backend for RecordingBackend
    {
        fn install_breakpoint(&self, breakpoint: &Breakpoint, function: Option<&Function>) -> bool
        {
            self.installs.lock().unwrap().push((breakpoint.id(), function.map(Function::address)));
            true
        }

        fn uninstall_breakpoint(&self, breakpoint: &Breakpoint, _function: Option<&Function>) -> bool
        {
            self.uninstalls.lock().unwrap().push(breakpoint.id());
            true
        }

        fn calculate_next_host_instruction(&self, _thread: &ThreadDebugInfo, current: HostAddress) -> HostAddress
        {
            current + 4
        }

        fn is_synchronization_point(&self, _address: GuestAddress) -> bool
        {
            false
        }
    }

    struct Ops
    {
        backend: RecordingBackend,
        functions: Vec<Arc<Function>>,
    }

    impl BreakpointOperations for Ops
    {
        fn backend(&self) -> &dyn Backend
        {
            &self.backend
        }

        fn functions_covering(&self, address: GuestAddress) -> SmallVec<[Arc<Function>; 4]>
        {
            self.functions.iter().filter(|f| f.contains(address)).cloned().collect()
        }
    }

    fn defined(start: u32, end: u32) -> Arc<Function>
    {
        let function = Arc::new(Function::new(GuestAddress::new(start), "f", "m", FunctionKind::Guest));
        function.mark_defined(GuestAddress::new(end));
        function
    }

    #[test]
    fn test_guest_breakpoint_pending_until_function_defined()
    {
        let mut ops = Ops {
            backend: RecordingBackend::default(),
            functions: Vec::new(),
        };
        let mut manager = BreakpointManager::new();
        let bp = BreakpointBuilder::guest(GuestAddress::new(0x8200_0008)).build();
        assert!(manager.add(Arc::clone(&bp)));
        assert!(!manager.add(Arc::clone(&bp)));

        assert_eq!(manager.resume_all(&ops), 0);
        assert!(!bp.is_installed());

        let function = defined(0x8200_0000, 0x8200_0010);
        ops.functions.push(Arc::clone(&function));
        assert_eq!(manager.install_pending_into(&function, &ops), 1);
        assert!(bp.is_installed());
        assert_eq!(bp.installed_functions().len(), 1);

        manager.suspend_all(&ops);
        assert!(!bp.is_installed());
        assert_eq!(ops.backend.uninstalls.lock().unwrap().as_slice(), &[bp.id()]);
        assert!(manager.remove(bp.id()).is_some());
    }

    #[test]
    fn test_guest_breakpoint_installs_into_every_covering_function()
    {
        let ops = Ops {
            backend: RecordingBackend::default(),
            functions: vec![defined(0x100, 0x120), defined(0x110, 0x130), defined(0x200, 0x210)],
        };
        let bp = BreakpointBuilder::guest(GuestAddress::new(0x114)).build();
        assert!(bp.install(&ops));
        assert_eq!(bp.installed_functions().len(), 2);
        assert_eq!(ops.backend.installs.lock().unwrap().len(), 2);
        bp.uninstall(&ops);
    }

    #[test]
    fn test_matching_requires_enabled_and_installed()
    {
        let ops = Ops {
            backend: RecordingBackend::default(),
            functions: Vec::new(),
        };
        let mut manager = BreakpointManager::new();
        let host = BreakpointBuilder::host(HostAddress::new(0x1000)).build();
        let disabled = BreakpointBuilder::host(HostAddress::new(0x1000)).enabled(false).build();
        manager.add(Arc::clone(&host));
        manager.add(Arc::clone(&disabled));
        let site = TrapSite {
            guest: None,
            host: HostAddress::new(0x1000),
        };

        assert!(manager.matching(&site).is_empty());
        assert_eq!(manager.resume_all(&ops), 1);
        let hits = manager.matching(&site);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), host.id());

        assert_eq!(
            manager.find_by_address(BreakpointAddress::Host(HostAddress::new(0x1000))).map(|bp| bp.id()),
            Some(host.id())
        );
        manager.suspend_all(&ops);
        assert_eq!(manager.drain().len(), 2);
    }

    #[test]
    fn test_list_is_ordered_by_id()
    {
        let mut manager = BreakpointManager::new();
        let first = BreakpointBuilder::guest(GuestAddress::new(0x20)).build();
        let second = BreakpointBuilder::guest(GuestAddress::new(0x10)).build();
        manager.add(Arc::clone(&second));
        manager.add(Arc::clone(&first));
        let ids: Vec<_> = manager.list().into_iter().map(|info| info.id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
    }

    #[test]
    fn test_callback_dispatch_and_hit_count()
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let bp = BreakpointBuilder::guest(GuestAddress::new(0x40))
            .with_callback(move |hit| sink.lock().unwrap().push(hit.thread))
            .build();
        let hit = BreakpointHit {
            breakpoint: bp.id(),
            address: bp.address(),
            thread: ThreadId(3),
            site: TrapSite {
                guest: Some(GuestAddress::new(0x40)),
                host: HostAddress::ZERO,
            },
        };
        assert!(bp.matches(&hit.site));
        assert_eq!(bp.record_hit(), 1);
        bp.dispatch(&hit);
        assert_eq!(seen.lock().unwrap().as_slice(), &[ThreadId(3)]);
        assert_eq!(bp.info().hit_count, 1);
    }
}
