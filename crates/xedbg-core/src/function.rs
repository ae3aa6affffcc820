//! Functions and the modules that own them.
//!
//! A [`Module`] claims a range of guest addresses and knows how to declare a
//! [`Function`] at an address inside it (create the record) and define it
//! (translate it so it can run). Guest modules produce translated guest code;
//! builtin modules produce thunks that call into host implementations of
//! kernel exports.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::DebugResult;
use crate::types::GuestAddress;

/// Host export reached through a builtin thunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export
{
    /// Export name, e.g. `KeWaitForSingleObject`.
    pub name: String,
    /// Ordinal inside the exporting library.
    pub ordinal: u32,
    /// The host implementation may block the calling thread indefinitely.
    pub blocking: bool,
}

/// What kind of code a function is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind
{
    /// Translated guest code.
    Guest,
    /// Guest-callable thunk into a host export.
    Builtin
    {
        /// Export behind the thunk
        export: Export,
    },
}

/// Resolution progress of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionStatus
{
    /// Record exists, code not yet generated.
    Declared = 0,
    /// Code generated and runnable.
    Defined = 1,
    /// Definition failed; never retried.
    Failed = 2,
}

impl FunctionStatus
{
    const fn from_raw(raw: u8) -> Self
    {
        match raw {
            1 => Self::Defined,
            2 => Self::Failed,
            _ => Self::Declared,
        }
    }
}

/// A callable unit at a guest address.
///
/// Owned by its module and shared by reference count everywhere else, so a
/// handle stays valid while the registry map changes around it.
pub struct Function
{
    address: GuestAddress,
    // Inclusive; zero until defined.
    end_address: AtomicU32,
    name: String,
    module: String,
    kind: FunctionKind,
    status: AtomicU8,
}

impl Function
{
    /// Create a declared function.
    #[must_use]
    pub fn new(address: GuestAddress, name: impl Into<String>, module: impl Into<String>, kind: FunctionKind) -> Self
    {
        Self {
            address,
            end_address: AtomicU32::new(0),
            name: name.into(),
            module: module.into(),
            kind,
            status: AtomicU8::new(FunctionStatus::Declared as u8),
        }
    }

    /// Entry address.
    pub fn address(&self) -> GuestAddress
    {
        self.address
    }

    /// Address of the last instruction, once known.
    pub fn end_address(&self) -> Option<GuestAddress>
    {
        match self.end_address.load(Ordering::Acquire) {
            0 => None,
            end => Some(GuestAddress::new(end)),
        }
    }

    /// Whether `address` lies inside `[address, end_address]`.
    ///
    /// A function whose extent is unknown only contains its entry point.
    pub fn contains(&self, address: GuestAddress) -> bool
    {
        let end = self.end_address().unwrap_or(self.address);
        self.address <= address && address <= end
    }

    /// Function name.
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Name of the owning module.
    pub fn module_name(&self) -> &str
    {
        &self.module
    }

    /// Guest code or builtin thunk.
    pub fn kind(&self) -> &FunctionKind
    {
        &self.kind
    }

    /// Export data for builtin thunks.
    pub fn export(&self) -> Option<&Export>
    {
        match &self.kind {
            FunctionKind::Builtin { export } => Some(export),
            FunctionKind::Guest => None,
        }
    }

    /// Whether this is translated guest code.
    pub fn is_guest(&self) -> bool
    {
        matches!(self.kind, FunctionKind::Guest)
    }

    /// Current resolution status.
    pub fn status(&self) -> FunctionStatus
    {
        FunctionStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Record a successful definition covering up to `end` (inclusive).
    pub fn mark_defined(&self, end: GuestAddress)
    {
        self.end_address.store(end.value().max(self.address.value()), Ordering::Release);
        self.status.store(FunctionStatus::Defined as u8, Ordering::Release);
    }

    /// Record a failed definition.
    pub fn mark_failed(&self)
    {
        self.status.store(FunctionStatus::Failed as u8, Ordering::Release);
    }
}

impl fmt::Debug for Function
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Function")
            .field("address", &self.address)
            .field("end_address", &self.end_address())
            .field("name", &self.name)
            .field("module", &self.module)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// Tag selecting how a module constructs its functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind
{
    /// Translated guest executable code.
    Guest,
    /// Thunks into host exports.
    Builtin,
}

impl ModuleKind
{
    /// Build a declared function for a module of this kind.
    ///
    /// Builtin modules need the export the thunk forwards to; a builtin module
    /// asked for an address without an export gets a guest function.
    #[must_use]
    pub fn create_function(self, module: &str, address: GuestAddress, export: Option<Export>) -> Arc<Function>
    {
        let (name, kind) = match (self, export) {
            (ModuleKind::Builtin, Some(export)) => (format!("__imp__{}", export.name), FunctionKind::Builtin { export }),
            _ => (format!("sub_{:08X}", address.value()), FunctionKind::Guest),
        };
        Arc::new(Function::new(address, name, module, kind))
    }
}

/// A loaded module that owns a range of guest addresses.
pub trait Module: Send + Sync
{
    /// Unique module name.
    fn name(&self) -> &str;

    /// How this module constructs functions.
    fn kind(&self) -> ModuleKind;

    /// Whether the module's image covers `address`.
    fn contains_address(&self, address: GuestAddress) -> bool;

    /// Find or create the function starting at `address`.
    ///
    /// Returns the function and whether this call created it.
    ///
    /// ## Errors
    ///
    /// Returns an error when no function can start at `address`.
    fn declare_function(&self, address: GuestAddress) -> DebugResult<(Arc<Function>, bool)>;

    /// Generate code for a declared function and record its extent.
    ///
    /// ## Errors
    ///
    /// Returns an error when translation fails; the function is then marked
    /// [`FunctionStatus::Failed`] by the caller.
    fn define_function(&self, function: &Function) -> DebugResult<()>;
}

impl fmt::Debug for dyn Module
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_function_extent_is_known_after_define()
    {
        let function = Function::new(GuestAddress::new(0x100), "f", "m", FunctionKind::Guest);
        assert!(function.contains(GuestAddress::new(0x100)));
        assert!(!function.contains(GuestAddress::new(0x104)));
        assert_eq!(function.status(), FunctionStatus::Declared);

        function.mark_defined(GuestAddress::new(0x10C));
        assert_eq!(function.status(), FunctionStatus::Defined);
        assert!(function.contains(GuestAddress::new(0x10C)));
        assert!(!function.contains(GuestAddress::new(0x110)));
    }

    #[test]
    fn test_module_kind_factory()
    {
        let export = Export {
            name: "NtClose".to_string(),
            ordinal: 25,
            blocking: false,
        };
        let thunk = ModuleKind::Builtin.create_function("xboxkrnl.exe", GuestAddress::new(0x8000_0000), Some(export));
        assert_eq!(thunk.name(), "__imp__NtClose");
        assert!(!thunk.is_guest());
        assert_eq!(thunk.export().map(|e| e.ordinal), Some(25));

        let guest = ModuleKind::Guest.create_function("default.xex", GuestAddress::new(0x8200_0000), None);
        assert_eq!(guest.name(), "sub_82000000");
        assert!(guest.is_guest());
    }
}
