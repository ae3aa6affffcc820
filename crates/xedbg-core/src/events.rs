//! Debug listener and event types.
//!
//! The processor reports state transitions to at most one [`DebugListener`]
//! at a time, always after releasing the debug lock so a listener may call
//! straight back into the processor. [`ChannelListener`] turns the callbacks
//! into [`DebugEvent`] values for frontends (and tests) that prefer to poll a
//! channel.

use std::sync::{mpsc, Arc};

use crate::breakpoints::{BreakpointAddress, BreakpointId, BreakpointInfo};
use crate::types::ThreadId;

/// Receiver of execution state notifications.
pub trait DebugListener: Send + Sync
{
    /// The debugger wants the user's attention (execution paused with this
    /// listener already attached).
    fn on_focus(&self);

    /// The listener was replaced or removed.
    fn on_detached(&self);

    /// Execution transitioned to Paused.
    fn on_execution_paused(&self);

    /// Execution transitioned to Running.
    fn on_execution_continued(&self);

    /// A step operation on `thread` completed. Followed by `on_execution_paused`.
    fn on_step_completed(&self, _thread: ThreadId) {}

    /// A user breakpoint fired on `thread`. Followed by `on_execution_paused`.
    fn on_breakpoint_hit(&self, _breakpoint: &BreakpointInfo, _thread: ThreadId) {}
}

/// Event emitted by the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent
{
    /// Listener asked to take focus.
    Focus,
    /// Listener detached.
    Detached,
    /// Execution paused.
    ExecutionPaused,
    /// Execution continued.
    ExecutionContinued,
    /// A step completed.
    StepCompleted
    {
        /// Thread that was stepped.
        thread: ThreadId,
    },
    /// A user breakpoint fired.
    BreakpointHit
    {
        /// Breakpoint that fired.
        breakpoint: BreakpointId,
        /// Address it is keyed on.
        address: BreakpointAddress,
        /// Thread that trapped.
        thread: ThreadId,
    },
}

impl DebugEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Focus => "Debugger requested focus".to_string(),
            Self::Detached => "Debugger listener detached".to_string(),
            Self::ExecutionPaused => "Execution paused".to_string(),
            Self::ExecutionContinued => "Execution continued".to_string(),
            Self::StepCompleted { thread } => format!("Step completed (thread {thread})"),
            Self::BreakpointHit {
                breakpoint,
                address,
                thread,
            } => format!("Hit breakpoint {breakpoint} at {address} (thread {thread})"),
        }
    }
}

/// Sender side of the debug event channel.
pub type DebugEventSender = mpsc::Sender<DebugEvent>;
/// Receiver side of the debug event channel.
pub type DebugEventReceiver = mpsc::Receiver<DebugEvent>;

/// Create a new debug event channel.
#[must_use]
pub fn event_channel() -> (DebugEventSender, DebugEventReceiver)
{
    mpsc::channel()
}

/// Listener that forwards every notification into a channel.
#[derive(Debug)]
pub struct ChannelListener
{
    sender: DebugEventSender,
}

impl ChannelListener
{
    /// Create a listener and the receiver its events arrive on.
    #[must_use]
    pub fn new() -> (Arc<Self>, DebugEventReceiver)
    {
        let (sender, receiver) = event_channel();
        (Arc::new(Self { sender }), receiver)
    }

    fn send(&self, event: DebugEvent)
    {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.sender.send(event);
    }
}

impl DebugListener for ChannelListener
{
    fn on_focus(&self)
    {
        self.send(DebugEvent::Focus);
    }

    fn on_detached(&self)
    {
        self.send(DebugEvent::Detached);
    }

    fn on_execution_paused(&self)
    {
        self.send(DebugEvent::ExecutionPaused);
    }

    fn on_execution_continued(&self)
    {
        self.send(DebugEvent::ExecutionContinued);
    }

    fn on_step_completed(&self, thread: ThreadId)
    {
        self.send(DebugEvent::StepCompleted { thread });
    }

    fn on_breakpoint_hit(&self, breakpoint: &BreakpointInfo, thread: ThreadId)
    {
        self.send(DebugEvent::BreakpointHit {
            breakpoint: breakpoint.id,
            address: breakpoint.address,
            thread,
        });
    }
}
