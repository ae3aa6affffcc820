//! # Function Registry
//!
//! Concurrent cache mapping guest addresses to resolved functions.
//!
//! Every address gets exactly one [`Entry`]. The first thread to observe an
//! entry performs the whole resolution (find the owning module, declare,
//! define) while any thread racing on the same address blocks on the entry
//! and then reuses the outcome. Failures are cached the same way successes
//! are, so an address outside every module is only ever looked up once.
//!
//! ## Locking
//!
//! The address map lock is held only long enough to find or insert an entry.
//! Declaring and defining run under the entry's once-cell, never under the map
//! lock, so unrelated addresses resolve in parallel. Entries and functions are
//! reference counted and stay valid while the map is mutated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use once_cell::sync::OnceCell;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::error::{DebugError, DebugResult, ResolveFailure};
use crate::function::{Function, FunctionStatus, Module};
use crate::types::GuestAddress;

/// Resolution status of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus
{
    /// Nobody has finished resolving the address yet.
    New,
    /// A function is available.
    Ready,
    /// Resolution failed permanently.
    Failed,
}

#[derive(Debug)]
enum Resolution
{
    Ready(Arc<Function>),
    /// `module` names the module that refused the address, if any did.
    Failed
    {
        reason: ResolveFailure,
        module: Option<String>,
    },
}

impl Resolution
{
    fn failed_in(module: &dyn Module, reason: ResolveFailure) -> Self
    {
        Self::Failed {
            reason,
            module: Some(module.name().to_string()),
        }
    }

    /// Whether the entry belongs to `module`, either as a function or a failure.
    fn owned_by(&self, name: &str) -> bool
    {
        match self {
            Self::Ready(function) => function.module_name() == name,
            Self::Failed { module, .. } => module.as_deref() == Some(name),
        }
    }
}

/// Cache slot for one guest address.
#[derive(Debug)]
pub struct Entry
{
    address: GuestAddress,
    resolution: OnceCell<Resolution>,
}

impl Entry
{
    fn new(address: GuestAddress) -> Self
    {
        Self {
            address,
            resolution: OnceCell::new(),
        }
    }

    /// Guest address of the entry.
    pub fn address(&self) -> GuestAddress
    {
        self.address
    }

    /// Current status. Moves from `New` to `Ready` or `Failed` exactly once.
    pub fn status(&self) -> EntryStatus
    {
        match self.resolution.get() {
            None => EntryStatus::New,
            Some(Resolution::Ready(_)) => EntryStatus::Ready,
            Some(Resolution::Failed { .. }) => EntryStatus::Failed,
        }
    }

    /// The resolved function, when `Ready`.
    pub fn function(&self) -> Option<Arc<Function>>
    {
        match self.resolution.get() {
            Some(Resolution::Ready(function)) => Some(Arc::clone(function)),
            _ => None,
        }
    }

    /// End address of the resolved function, when known.
    pub fn end_address(&self) -> Option<GuestAddress>
    {
        self.function().and_then(|function| function.end_address())
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolved
{
    /// The function covering the requested address.
    pub function: Arc<Function>,
    /// This call performed the definition (first observer of the entry).
    pub newly_defined: bool,
}

/// Guest address to function cache.
#[derive(Debug, Default)]
pub struct FunctionRegistry
{
    entries: Mutex<HashMap<GuestAddress, Arc<Entry>>>,
    modules: RwLock<Vec<Arc<dyn Module>>>,
}

impl FunctionRegistry
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register a module. Later modules do not shadow earlier ones.
    pub fn add_module(&self, module: Arc<dyn Module>)
    {
        debug!(module = module.name(), "module added");
        self.modules.write().unwrap_or_else(PoisonError::into_inner).push(module);
    }

    /// Unload a module and evict every entry whose function it owned, along
    /// with declare and define failures it reported. Addresses that failed
    /// because no module covered them stay cached.
    ///
    /// Returns `false` when no module has that name.
    pub fn remove_module(&self, name: &str) -> bool
    {
        let removed = {
            let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
            let before = modules.len();
            modules.retain(|module| module.name() != name);
            before != modules.len()
        };
        if !removed {
            return false;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.resolution.get().map_or(true, |resolution| !resolution.owned_by(name)));
        debug!(module = name, evicted = before - entries.len(), "module removed");
        true
    }

    /// Snapshot of the loaded modules.
    pub fn modules(&self) -> Vec<Arc<dyn Module>>
    {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// First module whose image covers `address`.
    pub fn lookup_module(&self, address: GuestAddress) -> Option<Arc<dyn Module>>
    {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|module| module.contains_address(address))
            .cloned()
    }

    /// Resolve the function at `address`, declaring and defining it on first use.
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::ResolveFailed`] when no module covers the address
    /// or the module fails to declare or define it. The failure is cached.
    pub fn resolve_function(&self, address: GuestAddress) -> DebugResult<Arc<Function>>
    {
        self.resolve(address).map(|resolved| resolved.function)
    }

    /// Like [`resolve_function`](Self::resolve_function), but also reports
    /// whether this call was the one that defined the function.
    ///
    /// ## Errors
    ///
    /// See [`resolve_function`](Self::resolve_function).
    pub fn resolve(&self, address: GuestAddress) -> DebugResult<Resolved>
    {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(address).or_insert_with(|| Arc::new(Entry::new(address))))
        };

        let mut newly_defined = false;
        let resolution = entry.resolution.get_or_init(|| {
            let resolution = self.resolve_uncached(address);
            newly_defined = matches!(resolution, Resolution::Ready(_));
            resolution
        });

        match resolution {
            Resolution::Ready(function) => Ok(Resolved {
                function: Arc::clone(function),
                newly_defined,
            }),
            Resolution::Failed { reason, .. } => Err(DebugError::ResolveFailed {
                address,
                reason: reason.clone(),
            }),
        }
    }

    fn resolve_uncached(&self, address: GuestAddress) -> Resolution
    {
        let Some(module) = self.lookup_module(address) else {
            debug!(%address, "no module covers address");
            return Resolution::Failed {
                reason: ResolveFailure::NotInModule,
                module: None,
            };
        };

        let function = match module.declare_function(address) {
            Ok((function, created)) => {
                trace!(%address, module = module.name(), created, "function declared");
                function
            }
            Err(err) => {
                warn!(%address, module = module.name(), error = %err, "declare failed");
                return Resolution::failed_in(module.as_ref(), ResolveFailure::DeclareFailed(err.to_string()));
            }
        };

        match function.status() {
            FunctionStatus::Defined => return Resolution::Ready(function),
            FunctionStatus::Failed => {
                return Resolution::failed_in(
                    module.as_ref(),
                    ResolveFailure::DefineFailed("function previously failed".to_string()),
                );
            }
            FunctionStatus::Declared => {}
        }

        if let Err(err) = module.define_function(&function) {
            warn!(%address, module = module.name(), error = %err, "define failed");
            function.mark_failed();
            return Resolution::failed_in(module.as_ref(), ResolveFailure::DefineFailed(err.to_string()));
        }
        if function.status() != FunctionStatus::Defined {
            // Module did not report an extent; treat the entry point as the whole function.
            function.mark_defined(function.address());
        }

        debug!(
            %address,
            end = ?function.end_address(),
            name = function.name(),
            "function defined"
        );
        Resolution::Ready(function)
    }

    /// Every resolved function whose range contains `address`.
    ///
    /// Never triggers resolution.
    pub fn lookup_functions_with_address(&self, address: GuestAddress) -> SmallVec<[Arc<Function>; 4]>
    {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .values()
            .filter_map(|entry| entry.function())
            .filter(|function| function.contains(address))
            .collect()
    }

    /// Entry for `address`, if one was ever created.
    pub fn entry(&self, address: GuestAddress) -> Option<Arc<Entry>>
    {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).get(&address).cloned()
    }

    /// Status of the entry for `address`, if one was ever created.
    pub fn entry_status(&self, address: GuestAddress) -> Option<EntryStatus>
    {
        self.entry(address).map(|entry| entry.status())
    }

    /// Number of entries (resolved, failed or in flight).
    pub fn len(&self) -> usize
    {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no address was ever resolved.
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }
}
