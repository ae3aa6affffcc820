//! Single-use completion signal.
//!
//! A stepping operation installs one or more breakpoints whose callbacks
//! signal a [`Fence`], releases the debug lock and then waits on the fence
//! until the target thread traps. Only the first signal is delivered; later
//! signals (the losing side of a branch race) are dropped.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// Waiting side of a completion signal.
#[derive(Debug)]
pub struct Fence<T>
{
    sender: SyncSender<T>,
    receiver: Receiver<T>,
}

/// Signalling side of a [`Fence`]. Cheap to clone into breakpoint callbacks.
#[derive(Debug)]
pub struct FenceSignal<T>
{
    sender: SyncSender<T>,
}

impl<T> Clone for FenceSignal<T>
{
    fn clone(&self) -> Self
    {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> FenceSignal<T>
{
    /// Deliver `value` to the waiter.
    ///
    /// Returns `false` when the fence was already signalled or the waiter is gone.
    pub fn signal(&self, value: T) -> bool
    {
        self.sender.try_send(value).is_ok()
    }
}

impl<T> Default for Fence<T>
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T> Fence<T>
{
    /// Create an unsignalled fence.
    #[must_use]
    pub fn new() -> Self
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        Self { sender, receiver }
    }

    /// Create a handle that can signal this fence.
    #[must_use]
    pub fn signaller(&self) -> FenceSignal<T>
    {
        FenceSignal {
            sender: self.sender.clone(),
        }
    }

    /// Block until the fence is signalled.
    ///
    /// The fence keeps a sender alive, so this only returns once a signal arrives.
    pub fn wait(self) -> T
    {
        loop {
            if let Ok(value) = self.receiver.recv() {
                return value;
            }
        }
    }

    /// Block until the fence is signalled or `timeout` elapses.
    ///
    /// `None` waits forever. Returns `None` on timeout.
    pub fn wait_timeout(self, timeout: Option<Duration>) -> Option<T>
    {
        let Some(timeout) = timeout else {
            return Some(self.wait());
        };
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}
