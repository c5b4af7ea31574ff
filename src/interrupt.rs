//! Translates OS interrupts (POSIX signals) into in-loop callbacks.
//!
//! The signal handler itself never runs application code: `signal-hook`
//! installs an async-signal-safe handler that only records the signal and
//! writes to a self-pipe, and `signal-hook-mio` exposes that self-pipe as
//! a normal [`mio::event::Source`] we register like any socket. All real
//! work -- including the application's callback -- happens on the loop
//! thread during the ordinary dispatch cycle, never inside the OS signal
//! handler.

use std::any::Any;
use std::collections::HashMap;

use log::{debug, warn};
use mio::event::Event;
use mio::Interest;
use signal_hook_mio::v1_0::Signals;

use crate::error::{Error, Result};
use crate::params::ParamMap;
use crate::source::{EventSource, EventSourceState, EventSourceType, LoopContext};

pub type InterruptHandle = i32;

/// `instance_infos` carries whatever extra key-value detail a particular
/// delivery wants to attach; for POSIX signals there is none today, so it
/// is always empty, but the signature leaves room for it.
pub type InterruptCallback =
    Box<dyn FnMut(&mut InterruptManager, InterruptHandle, &mut Option<Box<dyn Any>>, &ParamMap)>;

struct Registration {
    params: ParamMap,
    callback: InterruptCallback,
    context: Option<Box<dyn Any>>,
}

const SIGNALS_LOCAL_TOKEN: usize = 0;

pub struct InterruptManager {
    name: String,
    state: EventSourceState,
    registrations: HashMap<InterruptHandle, Registration>,
    signals: Option<Signals>,
}

impl InterruptManager {
    pub fn new(name: impl Into<String>) -> Self {
        InterruptManager {
            name: name.into(),
            state: EventSourceState::Fresh,
            registrations: HashMap::new(),
            signals: None,
        }
    }

    /// Duplicate registrations for the same handle replace the prior one.
    /// Takes effect on the next `handle_event`/`reregister_signals` pass;
    /// if the loop is already started this also (re)arms the underlying
    /// `signal-hook` registration immediately.
    pub fn register_interrupt(
        &mut self,
        handle: InterruptHandle,
        params: ParamMap,
        callback: InterruptCallback,
        context: Option<Box<dyn Any>>,
    ) -> Result<()> {
        let replaced = self.registrations.insert(
            handle,
            Registration {
                params,
                callback,
                context,
            },
        );
        if replaced.is_some() {
            warn!(target: "evloop_core::interrupt", "{}: handle {handle} re-registered, replacing prior registration", self.name);
        }
        if self.state == EventSourceState::Started {
            self.rebuild_signal_set()?;
        }
        Ok(())
    }

    /// Idempotent: deregistering an unknown or already-deregistered handle
    /// is not an error.
    pub fn deregister_interrupt(&mut self, handle: InterruptHandle) {
        if self.registrations.remove(&handle).is_some() && self.state == EventSourceState::Started
        {
            let _ = self.rebuild_signal_set();
        }
    }

    fn rebuild_signal_set(&mut self) -> Result<()> {
        let handles: Vec<i32> = self.registrations.keys().copied().collect();
        self.signals = Some(Signals::new(handles).map_err(Error::CommunicationError)?);
        Ok(())
    }
}

impl EventSource for InterruptManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> EventSourceType {
        EventSourceType::InterruptManager
    }

    fn state(&self) -> EventSourceState {
        self.state
    }

    fn start(&mut self, cx: &mut LoopContext<'_>) -> Result<()> {
        self.state = EventSourceState::Starting;
        self.rebuild_signal_set()?;
        if let Some(signals) = &mut self.signals {
            cx.registry
                .register(signals, cx.token(SIGNALS_LOCAL_TOKEN), Interest::READABLE)
                .map_err(Error::CommunicationError)?;
        }
        debug!(target: "evloop_core::interrupt", "{}: started with {} registered handle(s)", self.name, self.registrations.len());
        self.state = EventSourceState::Started;
        Ok(())
    }

    fn stop(&mut self, cx: &mut LoopContext<'_>) {
        self.state = EventSourceState::Stopping;
        if let Some(signals) = &mut self.signals {
            let _ = cx.registry.deregister(signals);
        }
        self.signals = None;
        self.state = EventSourceState::Stopped;
    }

    fn handle_event(
        &mut self,
        _cx: &mut LoopContext<'_>,
        local_token: usize,
        _event: &Event,
    ) -> Result<()> {
        if local_token != SIGNALS_LOCAL_TOKEN {
            return Ok(());
        }
        let pending: Vec<i32> = match &mut self.signals {
            Some(signals) => signals.pending().collect(),
            None => return Ok(()),
        };
        for handle in pending {
            let Some(mut reg) = self.registrations.remove(&handle) else {
                continue;
            };
            (reg.callback)(self, handle, &mut reg.context, &reg.params);
            // The callback may have deregistered or re-registered this
            // handle itself; only put it back if nothing else claimed the
            // slot in the meantime.
            self.registrations.entry(handle).or_insert(reg);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
