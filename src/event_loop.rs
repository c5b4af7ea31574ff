//! The event loop dispatcher: owns the `mio::Poll` instance, the timer
//! wheel, the delayed queue, and the ordered set of registered sources.
//! `run` is the single place these four things meet.

use std::time::{Duration, Instant};

use log::{debug, error, warn};
use mio::{Events, Poll};

use crate::clock::{Clock, SystemClock};
use crate::delayed::{DelayedCallback, DelayedQueue};
use crate::error::{Error, Result};
use crate::registry::split_token;
use crate::source::{EventSource, EventSourceState, LoopContext};
use crate::timer::{TimerCallback, TimerId, TimerPolicy, TimerWheel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopState {
    Fresh,
    Started,
    Stopping,
    Stopped,
}

/// A registered source plus the stable id its tokens are shared under.
/// The id, not this entry's position in `EventLoop::sources`, is what
/// `split_token` resolves readiness events against -- positions shift
/// under `Vec::remove` whenever an earlier source is deregistered, but a
/// live socket's already-registered `Token` can't be re-baked to match.
struct Registered {
    id: usize,
    source: Box<dyn EventSource>,
}

pub struct EventLoop {
    state: EventLoopState,
    poll: Poll,
    events: Events,
    clock: Box<dyn Clock>,
    timers: TimerWheel,
    delayed: DelayedQueue,
    sources: Vec<Registered>,
    /// Never reused, even across deregistration, so a stale `Token` from a
    /// removed source can never collide with one handed to a later source.
    next_source_id: usize,
    /// Set for the duration of `run_inner`; guards against a callback
    /// dispatched from this very cycle calling back into `run`.
    reentrant: bool,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_clock(Box::new(SystemClock))
    }

    /// For tests: drive timer scheduling off a [`crate::clock::TestClock`]
    /// instead of the wall-driven `SystemClock`.
    pub fn with_clock(clock: Box<dyn Clock>) -> Result<Self> {
        let poll = Poll::new().map_err(Error::CommunicationError)?;
        Ok(EventLoop {
            state: EventLoopState::Fresh,
            poll,
            events: Events::with_capacity(1024),
            clock,
            timers: TimerWheel::new(),
            delayed: DelayedQueue::new(),
            sources: Vec::new(),
            next_source_id: 0,
            reentrant: false,
        })
    }

    pub fn state(&self) -> EventLoopState {
        self.state
    }

    // -- Time domain ---------------------------------------------------

    pub fn now(&self) -> u64 {
        crate::clock::now_unix()
    }

    pub fn now_monotonic(&self) -> Instant {
        self.clock.now()
    }

    pub fn local_time_utc_offset(&self) -> i64 {
        crate::clock::local_time_utc_offset()
    }

    // -- Timers ----------------------------------------------------------

    pub fn next_cyclic_time(&self) -> Option<Instant> {
        self.timers.next_fire()
    }

    pub fn add_cyclic_callback(
        &mut self,
        callback: TimerCallback,
        interval_ms: f64,
        base_time: Option<Instant>,
        policy: TimerPolicy,
    ) -> Result<TimerId> {
        let now = self.clock.now();
        self.timers.add_cyclic(callback, interval_ms, base_time, policy, now)
    }

    pub fn modify_cyclic_callback(
        &mut self,
        id: TimerId,
        interval_ms: f64,
        base_time: Option<Instant>,
        policy: TimerPolicy,
    ) -> Result<()> {
        let now = self.clock.now();
        self.timers.modify_cyclic(id, interval_ms, base_time, policy, now)
    }

    pub fn remove_cyclic_callback(&mut self, id: TimerId) {
        self.timers.remove(id);
    }

    pub fn add_timed_callback(&mut self, callback: TimerCallback, date: Instant) -> Result<TimerId> {
        self.timers.add_timed(callback, date)
    }

    pub fn add_delayed_callback(&mut self, callback: DelayedCallback) {
        self.delayed.push(callback);
    }

    // -- Event sources -----------------------------------------------------

    pub fn register_event_source(&mut self, mut source: Box<dyn EventSource>) -> Result<()> {
        if self.sources.iter().any(|r| r.source.name() == source.name()) {
            return Err(Error::AlreadyExists(format!(
                "event source '{}'",
                source.name()
            )));
        }
        let id = self.next_source_id;
        self.next_source_id += 1;
        if self.state == EventLoopState::Started {
            let registry = self.poll.registry();
            let mut cx = LoopContext {
                registry,
                timers: &mut self.timers,
                delayed: &mut self.delayed,
                source_id: id,
            };
            source.start(&mut cx)?;
        }
        debug!(target: "evloop_core", "registered event source '{}'", source.name());
        self.sources.push(Registered { id, source });
        Ok(())
    }

    /// Stops the source (if not already stopped) and removes it once it
    /// reaches `Stopped`. If the source needs further loop cycles to
    /// finish stopping, it stays registered (still visible to
    /// `find_event_source`) and this returns `Err`; call `run` and retry.
    pub fn deregister_event_source(&mut self, name: &str) -> Result<()> {
        let index = self
            .sources
            .iter()
            .position(|r| r.source.name() == name)
            .ok_or_else(|| Error::NotFound(format!("event source '{name}'")))?;

        if self.sources[index].source.state() != EventSourceState::Stopped {
            let registry = self.poll.registry();
            let mut cx = LoopContext {
                registry,
                timers: &mut self.timers,
                delayed: &mut self.delayed,
                source_id: self.sources[index].id,
            };
            self.sources[index].source.stop(&mut cx);
        }

        if self.sources[index].source.state() == EventSourceState::Stopped {
            self.sources.remove(index);
            Ok(())
        } else {
            Err(Error::InternalError(format!(
                "event source '{name}' has not finished stopping; call run() and retry"
            )))
        }
    }

    pub fn find_event_source(&self, name: &str) -> Option<&dyn EventSource> {
        self.sources
            .iter()
            .find(|r| r.source.name() == name)
            .map(|r| r.source.as_ref())
    }

    pub fn find_event_source_mut(&mut self, name: &str) -> Option<&mut dyn EventSource> {
        self.sources
            .iter_mut()
            .find(|r| r.source.name() == name)
            .map(|r| r.source.as_mut())
    }

    // -- Lifecycle -----------------------------------------------------

    pub fn start(&mut self) -> Result<()> {
        if self.state != EventLoopState::Fresh && self.state != EventLoopState::Stopped {
            return Err(Error::InternalError(
                "start() called while already started or stopping".into(),
            ));
        }
        for index in 0..self.sources.len() {
            let registry = self.poll.registry();
            let mut cx = LoopContext {
                registry,
                timers: &mut self.timers,
                delayed: &mut self.delayed,
                source_id: self.sources[index].id,
            };
            if let Err(err) = self.sources[index].source.start(&mut cx) {
                error!(target: "evloop_core", "source '{}' failed to start: {err}", self.sources[index].source.name());
                for reverse in (0..index).rev() {
                    let registry = self.poll.registry();
                    let mut cx = LoopContext {
                        registry,
                        timers: &mut self.timers,
                        delayed: &mut self.delayed,
                        source_id: self.sources[reverse].id,
                    };
                    self.sources[reverse].source.stop(&mut cx);
                }
                return Err(err);
            }
        }
        self.state = EventLoopState::Started;
        debug!(target: "evloop_core", "event loop started with {} source(s)", self.sources.len());
        Ok(())
    }

    /// Non-blocking: asks every source to stop. The loop itself transitions
    /// to `Stopped` on a later `run` cycle once every source reports
    /// `Stopped`.
    pub fn stop(&mut self) {
        if self.state != EventLoopState::Started {
            return;
        }
        self.state = EventLoopState::Stopping;
        for index in 0..self.sources.len() {
            if self.sources[index].source.state() == EventSourceState::Stopped {
                continue;
            }
            let registry = self.poll.registry();
            let mut cx = LoopContext {
                registry,
                timers: &mut self.timers,
                delayed: &mut self.delayed,
                source_id: self.sources[index].id,
            };
            self.sources[index].source.stop(&mut cx);
        }
    }

    /// Fails unless the loop is `Stopped`. Consuming `self` does the rest:
    /// every source and the `Poll` instance are dropped along with it, no
    /// separate free-the-sources pass is needed in a language with
    /// ownership-based destructors.
    pub fn free(self) -> Result<()> {
        if self.state != EventLoopState::Stopped {
            return Err(Error::InternalError(
                "free() called before the event loop reached Stopped".into(),
            ));
        }
        Ok(())
    }

    /// Process one cycle: poll -> dispatch readiness -> fire timers ->
    /// drain delayed work. Reentrant calls (from within a callback
    /// dispatched by this very cycle) fail with `InternalError` and do
    /// nothing.
    pub fn run(&mut self, timeout_ms: u32) -> Result<()> {
        if self.reentrant {
            warn!(target: "evloop_core", "run() called reentrantly; rejecting");
            return Err(Error::InternalError(
                "run() must not be called from within a dispatched callback".into(),
            ));
        }
        self.reentrant = true;
        let result = self.run_inner(timeout_ms);
        self.reentrant = false;
        result
    }

    fn run_inner(&mut self, timeout_ms: u32) -> Result<()> {
        let now = self.clock.now();
        let mut wait = Duration::from_millis(u64::from(timeout_ms));
        if let Some(next) = self.timers.next_fire() {
            wait = wait.min(next.saturating_duration_since(now));
        }
        if !self.delayed.is_empty() {
            wait = Duration::ZERO;
        }

        self.poll
            .poll(&mut self.events, Some(wait))
            .map_err(Error::CommunicationError)?;

        for event in self.events.iter() {
            let (source_id, local_token) = split_token(event.token());
            // Look up by stable id, not position: an earlier source may
            // have been deregistered since this token was registered,
            // shifting everyone after it. A miss here means the owning
            // source was deregistered and its socket already torn down;
            // the stale readiness is simply dropped.
            let Some(index) = self.sources.iter().position(|r| r.id == source_id) else {
                continue;
            };
            let registry = self.poll.registry();
            let mut cx = LoopContext {
                registry,
                timers: &mut self.timers,
                delayed: &mut self.delayed,
                source_id,
            };
            let entry = &mut self.sources[index];
            if let Err(err) = entry.source.handle_event(&mut cx, local_token, event) {
                warn!(target: "evloop_core", "source '{}' failed to handle an event: {err}", entry.source.name());
            }
        }

        let now = self.clock.now();
        self.timers.fire_due(now);
        self.delayed.drain_one_cycle();

        if self.state == EventLoopState::Stopping
            && self
                .sources
                .iter()
                .all(|r| r.source.state() == EventSourceState::Stopped)
        {
            self.state = EventLoopState::Stopped;
            debug!(target: "evloop_core", "event loop reached Stopped");
        }

        Ok(())
    }
}
