use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use super::thread::ThreadEnv;
use super::{SimBackend, SimMemory, SimModule, SimStackWalker, SimThread};
use crate::config::ProcessorConfig;
use crate::error::DebugResult;
use crate::function::{Export, Module};
use crate::processor::Processor;
use crate::thread::GuestThread;
use crate::types::{GuestAddress, ThreadId};

struct ThreadSlot
{
    thread: Arc<SimThread>,
    join: Option<JoinHandle<()>>,
}

/// A [`Processor`] wired to an in-memory guest.
///
/// ## Example
///
/// ```rust
/// use xedbg_core::config::ProcessorConfig;
/// use xedbg_core::ppc::{encode, BLR};
/// use xedbg_core::sim::SimMachine;
/// use xedbg_core::thread::GuestThread;
/// use xedbg_core::types::GuestAddress;
///
/// let machine = SimMachine::new(ProcessorConfig::default());
/// let base = GuestAddress::new(0x8200_0000);
/// machine.load_guest_module("default.xex", base, &[encode::addi(3, 0, 1), BLR]);
/// machine.processor().pre_launch();
/// let thread = machine.spawn_thread(base)?;
/// machine.join_thread(thread.id());
/// # Ok::<(), xedbg_core::DebugError>(())
/// ```
pub struct SimMachine
{
    processor: Arc<Processor>,
    memory: Arc<SimMemory>,
    backend: Arc<SimBackend>,
    walker: Arc<SimStackWalker>,
    threads: Mutex<Vec<ThreadSlot>>,
    next_thread_id: AtomicU32,
}

impl SimMachine
{
    /// Create the machine and its processor (Paused, nothing loaded).
    pub fn new(config: ProcessorConfig) -> Self
    {
        let memory = Arc::new(SimMemory::new());
        let backend = Arc::new(SimBackend::new(Arc::clone(&memory)));
        let walker = Arc::new(SimStackWalker::new());
        let processor = Processor::new(config, backend.clone(), memory.clone(), walker.clone());
        Self {
            processor,
            memory,
            backend,
            walker,
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicU32::new(1),
        }
    }

    /// The processor under test.
    pub fn processor(&self) -> &Arc<Processor>
    {
        &self.processor
    }

    /// Guest memory.
    pub fn memory(&self) -> &Arc<SimMemory>
    {
        &self.memory
    }

    /// Trap-patching backend.
    pub fn backend(&self) -> &Arc<SimBackend>
    {
        &self.backend
    }

    /// Load guest code at `base` and register it as a module.
    pub fn load_guest_module(&self, name: &str, base: GuestAddress, words: &[u32]) -> Arc<SimModule>
    {
        self.add_module(SimModule::guest(name, base, words, Arc::clone(&self.memory)))
    }

    /// Register a builtin module with one thunk per export.
    pub fn load_builtin_module(&self, name: &str, base: GuestAddress, exports: Vec<Export>) -> Arc<SimModule>
    {
        for export in &exports {
            self.walker.register_export(export.ordinal, &export.name);
        }
        self.add_module(SimModule::builtin(name, base, exports, Arc::clone(&self.memory)))
    }

    /// Register an already built module.
    pub fn add_module(&self, module: SimModule) -> Arc<SimModule>
    {
        let module = Arc::new(module);
        self.processor.add_module(Arc::clone(&module) as Arc<dyn Module>);
        module
    }

    /// Start a debugger-suspendable guest thread at `start`.
    ///
    /// ## Errors
    ///
    /// Returns [`DebugError::Io`](crate::DebugError::Io) when the OS thread
    /// cannot be spawned.
    pub fn spawn_thread(&self, start: GuestAddress) -> DebugResult<Arc<SimThread>>
    {
        self.spawn(start, true, |_| {})
    }

    /// Start a host worker thread the debugger never suspends.
    ///
    /// ## Errors
    ///
    /// See [`spawn_thread`](Self::spawn_thread).
    pub fn spawn_worker_thread(&self, start: GuestAddress) -> DebugResult<Arc<SimThread>>
    {
        self.spawn(start, false, |_| {})
    }

    /// Start a guest thread after `setup` has seeded its registers.
    ///
    /// ## Errors
    ///
    /// See [`spawn_thread`](Self::spawn_thread).
    pub fn spawn_thread_with<F>(&self, start: GuestAddress, setup: F) -> DebugResult<Arc<SimThread>>
    where
        F: FnOnce(&SimThread),
    {
        self.spawn(start, true, setup)
    }

    fn spawn<F>(&self, start: GuestAddress, suspendable: bool, setup: F) -> DebugResult<Arc<SimThread>>
    where
        F: FnOnce(&SimThread),
    {
        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(SimThread::new(id, start, suspendable));
        setup(&thread);
        self.walker.register_thread(thread.native_handle(), Arc::downgrade(&thread));
        // The record must exist before the thread can trap.
        self.processor.on_thread_created(Arc::clone(&thread) as Arc<dyn GuestThread>);

        let env = ThreadEnv {
            processor: Arc::downgrade(&self.processor),
            memory: Arc::clone(&self.memory),
            backend: Arc::clone(&self.backend),
        };
        let runner = Arc::clone(&thread);
        let join = std::thread::Builder::new()
            .name(format!("guest-{}", id.raw()))
            .spawn(move || runner.run(&env))?;
        debug!(thread = %id, %start, "guest thread spawned");

        self.lock_threads().push(ThreadSlot {
            thread: Arc::clone(&thread),
            join: Some(join),
        });
        Ok(thread)
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<ThreadSlot>>
    {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Thread with the given id.
    pub fn thread(&self, id: ThreadId) -> Option<Arc<SimThread>>
    {
        self.lock_threads().iter().find(|slot| slot.thread.id() == id).map(|slot| Arc::clone(&slot.thread))
    }

    /// Wait for a thread to leave its interpreter loop.
    pub fn join_thread(&self, id: ThreadId)
    {
        let join = self
            .lock_threads()
            .iter_mut()
            .find(|slot| slot.thread.id() == id)
            .and_then(|slot| slot.join.take());
        if let Some(join) = join {
            if join.join().is_err() {
                warn!(thread = %id, "guest thread panicked");
            }
        }
    }

    /// Stop a thread, close its handle and report it destroyed.
    ///
    /// A thread that had not exited yet is left behind as a zombie record.
    pub fn destroy_thread(&self, id: ThreadId) -> bool
    {
        let Some(thread) = self.thread(id) else {
            return false;
        };
        thread.stop();
        self.join_thread(id);
        thread.close();
        self.processor.on_thread_destroyed(id);
        true
    }

    /// Tear down the debugger and stop every thread.
    pub fn shutdown(&self)
    {
        self.processor.shutdown();
        let slots: Vec<ThreadSlot> = std::mem::take(&mut *self.lock_threads());
        for slot in &slots {
            slot.thread.stop();
        }
        for mut slot in slots {
            if let Some(join) = slot.join.take() {
                if join.join().is_err() {
                    warn!(thread = %slot.thread.id(), "guest thread panicked");
                }
            }
        }
    }
}

impl Drop for SimMachine
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

impl std::fmt::Debug for SimMachine
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("SimMachine")
            .field("processor", &self.processor)
            .field("threads", &self.lock_threads().len())
            .finish_non_exhaustive()
    }
}
