//! The abstract registered participant: connection managers, interrupt
//! managers, and anything else an application plugs into the loop.

use std::any::Any;

use mio::event::Event;
use mio::Registry;

use crate::delayed::DelayedQueue;
use crate::error::Result;
use crate::registry::token_for;
use crate::timer::TimerWheel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceType {
    ConnectionManager,
    InterruptManager,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceState {
    Fresh,
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Everything an [`EventSource`] needs from its owning loop during a
/// lifecycle transition or readiness dispatch: the `mio` registry (to
/// (de)register file descriptors), and the timer wheel / delayed queue so
/// a source's callback can schedule follow-up work.
///
/// Borrowed from split fields of `EventLoop` rather than a back-pointer to
/// the whole loop: the original header describes a weak back-reference
/// from source to loop, but the borrow checker gives us the same
/// "loop outlives source, never the reverse" invariant for free when the
/// loop hands out only the pieces a source actually needs.
pub struct LoopContext<'a> {
    pub registry: &'a Registry,
    pub timers: &'a mut TimerWheel,
    pub delayed: &'a mut DelayedQueue,
    /// Stable, monotonically issued identifier for this source -- never
    /// reused, and independent of the source's current position in the
    /// loop's registry. Tokens baked from it stay valid for the life of
    /// the source even if earlier sources are later deregistered.
    pub source_id: usize,
}

impl<'a> LoopContext<'a> {
    /// Build the global `mio::Token` for this source's `local`-th interest,
    /// sharding the token space by source id (see `crate::registry`).
    pub fn token(&self, local: usize) -> mio::Token {
        token_for(self.source_id, local)
    }
}

/// A participant registered with the event loop. Implemented by
/// [`crate::net::TcpConnectionManager`] and [`crate::interrupt::InterruptManager`];
/// applications may implement it directly for other transports.
pub trait EventSource {
    fn name(&self) -> &str;

    fn source_type(&self) -> EventSourceType;

    fn state(&self) -> EventSourceState;

    /// Called once when the loop starts (or immediately at registration
    /// time if the loop is already started). Must leave `state()` as
    /// `Started` on success.
    fn start(&mut self, cx: &mut LoopContext<'_>) -> Result<()>;

    /// Begin an asynchronous stop. `state()` should move to `Stopping`
    /// immediately and reach `Stopped` within a bounded number of
    /// `handle_event`/`poll_stopped` calls.
    fn stop(&mut self, cx: &mut LoopContext<'_>);

    /// Dispatch one readiness event whose token belongs to this source
    /// (`local_token` has already had the source-index bits stripped).
    fn handle_event(&mut self, cx: &mut LoopContext<'_>, local_token: usize, event: &Event)
        -> Result<()>;

    /// For type-tagged downcasting (e.g. `find_event_source` followed by a
    /// cast to `TcpConnectionManager` to call `open_connection`).
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
