use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::trace;

use super::SimMemory;
use crate::backend::Memory;
use crate::error::{DebugError, DebugResult};
use crate::function::{Export, Function, Module, ModuleKind};
use crate::ppc;
use crate::types::GuestAddress;

/// Longest function the guest module will scan for its return.
const MAX_FUNCTION_WORDS: u32 = 4096;

/// Module over a range of [`SimMemory`].
///
/// Guest modules define a function by scanning forward from its entry to the
/// first `blr`. Builtin modules hold one single-instruction thunk per export.
/// Declare and define calls are counted so callers can check how often the
/// registry reached the module.
#[derive(Debug)]
pub struct SimModule
{
    name: String,
    kind: ModuleKind,
    base: GuestAddress,
    size: u32,
    memory: Arc<SimMemory>,
    exports: HashMap<GuestAddress, Export>,
    functions: Mutex<HashMap<GuestAddress, Arc<Function>>>,
    failing: Mutex<HashSet<GuestAddress>>,
    define_delay: Option<Duration>,
    declare_calls: AtomicUsize,
    define_calls: AtomicUsize,
}

impl SimModule
{
    /// Guest code module covering `words` loaded at `base`.
    pub fn guest(name: impl Into<String>, base: GuestAddress, words: &[u32], memory: Arc<SimMemory>) -> Self
    {
        memory.load_words(base, words);
        let size = u32::try_from(words.len() * 4).unwrap_or(u32::MAX);
        Self::with_kind(name.into(), ModuleKind::Guest, base, size, memory, HashMap::new())
    }

    /// Builtin module with one thunk per export, laid out from `base`.
    pub fn builtin(name: impl Into<String>, base: GuestAddress, exports: Vec<Export>, memory: Arc<SimMemory>) -> Self
    {
        // Thunks are never interpreted; `blr` keeps disassembly sensible.
        memory.load_words(base, &vec![ppc::BLR; exports.len()]);
        let mut address = base;
        let mut table = HashMap::new();
        for export in exports {
            table.insert(address, export);
            address = address.next_instruction();
        }
        let size = address.value() - base.value();
        Self::with_kind(name.into(), ModuleKind::Builtin, base, size, memory, table)
    }

    fn with_kind(
        name: String,
        kind: ModuleKind,
        base: GuestAddress,
        size: u32,
        memory: Arc<SimMemory>,
        exports: HashMap<GuestAddress, Export>,
    ) -> Self
    {
        Self {
            name,
            kind,
            base,
            size,
            memory,
            exports,
            functions: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            define_delay: None,
            declare_calls: AtomicUsize::new(0),
            define_calls: AtomicUsize::new(0),
        }
    }

    /// Make every definition take at least `delay`.
    #[must_use]
    pub fn with_define_delay(mut self, delay: Duration) -> Self
    {
        self.define_delay = Some(delay);
        self
    }

    /// Make the definition of the function at `address` fail.
    pub fn fail_definition_at(&self, address: GuestAddress)
    {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).insert(address);
    }

    /// Address of the thunk for export `name`.
    pub fn thunk_address(&self, name: &str) -> Option<GuestAddress>
    {
        self.exports.iter().find(|(_, export)| export.name == name).map(|(address, _)| *address)
    }

    /// First address of the module.
    pub fn base(&self) -> GuestAddress
    {
        self.base
    }

    /// Number of declare calls received.
    pub fn declare_calls(&self) -> usize
    {
        self.declare_calls.load(Ordering::SeqCst)
    }

    /// Number of define calls received.
    pub fn define_calls(&self) -> usize
    {
        self.define_calls.load(Ordering::SeqCst)
    }

    fn find_return(&self, entry: GuestAddress) -> Option<GuestAddress>
    {
        let mut address = entry;
        for _ in 0..MAX_FUNCTION_WORDS {
            if !self.contains_address(address) {
                return None;
            }
            if self.memory.load_u32(address)? == ppc::BLR {
                return Some(address);
            }
            address = address.next_instruction();
        }
        None
    }
}

impl Module for SimModule
{
    fn name(&self) -> &str
    {
        &self.name
    }

    fn kind(&self) -> ModuleKind
    {
        self.kind
    }

    fn contains_address(&self, address: GuestAddress) -> bool
    {
        address >= self.base && address.value() - self.base.value() < self.size
    }

    fn declare_function(&self, address: GuestAddress) -> DebugResult<(Arc<Function>, bool)>
    {
        self.declare_calls.fetch_add(1, Ordering::SeqCst);
        if !self.contains_address(address) {
            return Err(DebugError::Module(format!("{address} is outside {}", self.name)));
        }
        let export = match self.kind {
            ModuleKind::Builtin => {
                let export = self.exports.get(&address).cloned();
                if export.is_none() {
                    return Err(DebugError::Module(format!("no export thunk at {address}")));
                }
                export
            }
            ModuleKind::Guest => None,
        };

        let mut functions = self.functions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(function) = functions.get(&address) {
            return Ok((Arc::clone(function), false));
        }
        let function = self.kind.create_function(&self.name, address, export);
        functions.insert(address, Arc::clone(&function));
        Ok((function, true))
    }

    fn define_function(&self, function: &Function) -> DebugResult<()>
    {
        self.define_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.define_delay {
            std::thread::sleep(delay);
        }
        let address = function.address();
        if self.failing.lock().unwrap_or_else(PoisonError::into_inner).contains(&address) {
            return Err(DebugError::Module(format!("translation of {address} failed")));
        }
        let end = match self.kind {
            ModuleKind::Builtin => address,
            ModuleKind::Guest => self
                .find_return(address)
                .ok_or_else(|| DebugError::Module(format!("no return found after {address}")))?,
        };
        function.mark_defined(end);
        trace!(name = function.name(), %address, %end, "function translated");
        Ok(())
    }
}
