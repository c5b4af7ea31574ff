//! A single-threaded, `mio`-backed event loop core: a timer wheel, a
//! delayed-callback queue, a TCP connection manager, and a POSIX interrupt
//! manager, all dispatched from one `EventLoop::run` cycle.
//!
//! `EventLoop` owns the shared `mio::Poll` and hands each registered
//! [`source::EventSource`] a slice of the token space (`registry`) so
//! readiness events route back to their owner without a lookup table.
//! Applications compose a loop from the pieces they need:
//!
//! ```no_run
//! use evloop_core::{EventLoop, TcpConnectionManager};
//!
//! let mut loop_ = EventLoop::new().unwrap();
//! let mut tcp: TcpConnectionManager = TcpConnectionManager::new("tcp");
//! tcp.params_mut().set(
//!     evloop_core::params::keys::LISTEN_PORT,
//!     evloop_core::params::Value::U16(4840),
//! );
//! loop_.register_event_source(Box::new(tcp)).unwrap();
//! loop_.start().unwrap();
//! loop_.run(100).unwrap();
//! ```

pub mod clock;
pub mod delayed;
pub mod error;
pub mod event_loop;
pub mod interrupt;
pub mod net;
pub mod params;
pub mod registry;
pub mod source;
pub mod timer;

pub use clock::{Clock, SystemClock, TestClock};
pub use delayed::{DelayedCallback, DelayedQueue};
pub use error::{Error, Result, StatusCode};
pub use event_loop::{EventLoop, EventLoopState};
pub use interrupt::{InterruptCallback, InterruptHandle, InterruptManager};
pub use net::{ConnectionCallback, ConnectionId, Direction, NetworkBuffer, TcpConnectionManager};
pub use params::{Key, ParamMap, Value};
pub use source::{EventSource, EventSourceState, EventSourceType, LoopContext};
pub use timer::{TimerCallback, TimerId, TimerPolicy};
