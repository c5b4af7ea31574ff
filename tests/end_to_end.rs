//! Integration coverage over real loopback sockets and a shared `EventLoop`.
//!
//! Timer phase-preservation and delayed-ordering are exercised here too,
//! through the public `EventLoop` API, even though `src/timer.rs` and
//! `src/delayed.rs` already cover the same ground unit-style against the
//! wheel/queue directly.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use evloop_core::clock::{Clock, TestClock};
use evloop_core::error::Error;
use evloop_core::params::{keys, ParamMap, Value};
use evloop_core::timer::TimerPolicy;
use evloop_core::{EventLoop, EventLoopState, EventSource, TcpConnectionManager};

/// Lets a test advance a `TestClock` that has already been moved into the
/// loop's `Box<dyn Clock>`.
struct SharedTestClock(Rc<RefCell<TestClock>>);

impl Clock for SharedTestClock {
    fn now(&self) -> Instant {
        self.0.borrow().now()
    }
}

fn run_until<F: FnMut(&mut EventLoop) -> bool>(loop_: &mut EventLoop, max_cycles: u32, mut done: F) {
    for _ in 0..max_cycles {
        loop_.run(20).unwrap();
        if done(loop_) {
            return;
        }
    }
    panic!("condition not reached within {max_cycles} cycles");
}

fn ephemeral_tcp_cm(name: &str) -> TcpConnectionManager<u8> {
    let mut tcp = TcpConnectionManager::new(name);
    tcp.params_mut().set(keys::LISTEN_PORT, Value::U16(0));
    tcp
}

fn tcp_ref(loop_: &EventLoop, name: &str) -> &TcpConnectionManager<u8> {
    loop_
        .find_event_source(name)
        .unwrap()
        .as_any()
        .downcast_ref::<TcpConnectionManager<u8>>()
        .unwrap()
}

fn tcp_mut<'a>(loop_: &'a mut EventLoop, name: &str) -> &'a mut TcpConnectionManager<u8> {
    loop_
        .find_event_source_mut(name)
        .unwrap()
        .as_any_mut()
        .downcast_mut::<TcpConnectionManager<u8>>()
        .unwrap()
}

fn listener_addr(loop_: &EventLoop, name: &str) -> SocketAddr {
    tcp_ref(loop_, name).listener_local_addrs()[0]
}

#[test]
fn listener_lifecycle() {
    let _ = env_logger::init();
    let mut loop_ = EventLoop::new().unwrap();
    loop_
        .register_event_source(Box::new(ephemeral_tcp_cm("tcp")))
        .unwrap();
    loop_.start().unwrap();
    assert_eq!(loop_.state(), EventLoopState::Started);

    for _ in 0..10 {
        loop_.run(1).unwrap();
    }

    loop_.stop();
    run_until(&mut loop_, 1000, |l| l.state() == EventLoopState::Stopped);
    loop_.free().unwrap();
}

#[test]
fn loopback_connect_echo() {
    let _ = env_logger::init();
    let mut loop_ = EventLoop::new().unwrap();

    let conn_count = Rc::new(RefCell::new(0i32));
    let client_id = Rc::new(RefCell::new(0u64));
    let received = Rc::new(RefCell::new(Vec::<u8>::new()));

    let mut tcp = ephemeral_tcp_cm("tcp");
    {
        let conn_count = conn_count.clone();
        let client_id = client_id.clone();
        let received = received.clone();
        tcp.set_connection_callback(Box::new(move |_cm, id, ctx, status, _params, msg| {
            if status.is_good() {
                *conn_count.borrow_mut() += 1;
                if *ctx == 0x01 {
                    *client_id.borrow_mut() = id;
                }
            } else {
                *conn_count.borrow_mut() -= 1;
            }
            if !msg.is_empty() {
                received.borrow_mut().extend_from_slice(msg);
            }
        }));
    }
    loop_.register_event_source(Box::new(tcp)).unwrap();
    loop_.start().unwrap();

    let addr = listener_addr(&loop_, "tcp");
    let params = ParamMap::new()
        .with(keys::HOSTNAME, Value::String(addr.ip().to_string()))
        .with(keys::PORT, Value::U16(addr.port()));
    tcp_mut(&mut loop_, "tcp")
        .open_connection(&params, 0x01)
        .unwrap();

    run_until(&mut loop_, 50, |_| *conn_count.borrow() == 2);
    let id = *client_id.borrow();
    assert_ne!(id, 0);

    let payload = b"open62541";
    let mut buf = tcp_ref(&loop_, "tcp")
        .alloc_network_buffer(id, payload.len())
        .unwrap();
    buf.as_mut_slice().copy_from_slice(payload);
    tcp_mut(&mut loop_, "tcp")
        .send_with_connection(id, &ParamMap::new(), buf)
        .unwrap();

    run_until(&mut loop_, 50, |_| received.borrow().as_slice() == payload);

    tcp_mut(&mut loop_, "tcp").close_connection(id).unwrap();
    run_until(&mut loop_, 50, |_| *conn_count.borrow() == 0);

    loop_.stop();
    run_until(&mut loop_, 1000, |l| l.state() == EventLoopState::Stopped);
    loop_.free().unwrap();
}

#[test]
fn reentrant_run_rejected() {
    let _ = env_logger::init();
    let loop_rc = Rc::new(RefCell::new(EventLoop::new().unwrap()));

    let conn_count = Rc::new(RefCell::new(0i32));
    let client_id = Rc::new(RefCell::new(0u64));
    let received = Rc::new(RefCell::new(Vec::<u8>::new()));
    // What the callback observed when it tried to reenter the loop. A
    // `TcpConnectionManager` callback only ever gets `&mut
    // TcpConnectionManager`, never `&mut EventLoop` -- there is no API path
    // for it to call `EventLoop::run` directly. The realistic way an
    // application could even attempt it is by sharing `Rc<RefCell<EventLoop>>`
    // with its own callback, so that's what this test wires up; the
    // rejection then comes from `RefCell`'s dynamic borrow check, which is
    // exactly the mechanism `EventLoop::run`'s own reentrancy guard is
    // documented to back up.
    let reentrant_result: Rc<RefCell<Option<Result<(), Error>>>> = Rc::new(RefCell::new(None));

    let mut tcp = ephemeral_tcp_cm("tcp");
    {
        let conn_count = conn_count.clone();
        let client_id = client_id.clone();
        let received = received.clone();
        let reentrant_result = reentrant_result.clone();
        let loop_for_cb = loop_rc.clone();
        tcp.set_connection_callback(Box::new(move |_cm, id, ctx, status, _params, msg| {
            if status.is_good() {
                *conn_count.borrow_mut() += 1;
                if *ctx == 0x01 {
                    *client_id.borrow_mut() = id;
                }
            } else {
                *conn_count.borrow_mut() -= 1;
            }
            if !msg.is_empty() {
                received.borrow_mut().extend_from_slice(msg);
            }
            let outcome = match loop_for_cb.try_borrow_mut() {
                Ok(mut l) => l.run(1),
                Err(_) => Err(Error::InternalError(
                    "run() must not be called from within a dispatched callback".into(),
                )),
            };
            *reentrant_result.borrow_mut() = Some(outcome);
        }));
    }
    loop_rc
        .borrow_mut()
        .register_event_source(Box::new(tcp))
        .unwrap();
    loop_rc.borrow_mut().start().unwrap();

    let addr = listener_addr(&loop_rc.borrow(), "tcp");
    let params = ParamMap::new()
        .with(keys::HOSTNAME, Value::String(addr.ip().to_string()))
        .with(keys::PORT, Value::U16(addr.port()));
    tcp_mut(&mut loop_rc.borrow_mut(), "tcp")
        .open_connection(&params, 0x01)
        .unwrap();

    run_until(&mut loop_rc.borrow_mut(), 50, |_| *conn_count.borrow() == 2);
    assert!(matches!(
        reentrant_result.borrow().as_ref(),
        Some(Err(Error::InternalError(_)))
    ));

    let id = *client_id.borrow();
    let payload = b"open62541";
    let mut buf = {
        let l = loop_rc.borrow();
        tcp_ref(&l, "tcp").alloc_network_buffer(id, payload.len()).unwrap()
    };
    buf.as_mut_slice().copy_from_slice(payload);
    tcp_mut(&mut loop_rc.borrow_mut(), "tcp")
        .send_with_connection(id, &ParamMap::new(), buf)
        .unwrap();

    run_until(&mut loop_rc.borrow_mut(), 50, |_| {
        received.borrow().as_slice() == payload
    });

    tcp_mut(&mut loop_rc.borrow_mut(), "tcp")
        .close_connection(id)
        .unwrap();
    run_until(&mut loop_rc.borrow_mut(), 50, |_| *conn_count.borrow() == 0);
}

#[test]
fn graceful_shutdown_with_live_connection() {
    let _ = env_logger::init();
    let mut loop_ = EventLoop::new().unwrap();

    let conn_count = Rc::new(RefCell::new(0i32));
    let client_id = Rc::new(RefCell::new(0u64));
    let terminal_msgs = Rc::new(RefCell::new(0u32));

    let mut tcp = ephemeral_tcp_cm("tcp");
    {
        let conn_count = conn_count.clone();
        let client_id = client_id.clone();
        let terminal_msgs = terminal_msgs.clone();
        tcp.set_connection_callback(Box::new(move |_cm, id, ctx, status, _params, msg| {
            if status.is_good() {
                *conn_count.borrow_mut() += 1;
                if *ctx == 0x01 {
                    *client_id.borrow_mut() = id;
                }
            } else {
                *conn_count.borrow_mut() -= 1;
                assert!(msg.is_empty());
                *terminal_msgs.borrow_mut() += 1;
            }
        }));
    }
    loop_.register_event_source(Box::new(tcp)).unwrap();
    loop_.start().unwrap();

    let addr = listener_addr(&loop_, "tcp");
    let params = ParamMap::new()
        .with(keys::HOSTNAME, Value::String(addr.ip().to_string()))
        .with(keys::PORT, Value::U16(addr.port()));
    tcp_mut(&mut loop_, "tcp")
        .open_connection(&params, 0x01)
        .unwrap();

    run_until(&mut loop_, 50, |_| *conn_count.borrow() == 2);

    // Stop without closing the client connection first.
    loop_.stop();
    run_until(&mut loop_, 1000, |l| l.state() == EventLoopState::Stopped);

    assert_eq!(*terminal_msgs.borrow(), 2);
    loop_.free().unwrap();
}

#[test]
fn cyclic_timer_base_time_phase_preservation() {
    let clock = Rc::new(RefCell::new(TestClock::new()));
    let mut loop_ = EventLoop::with_clock(Box::new(SharedTestClock(clock.clone()))).unwrap();

    let base = clock.borrow().now();
    let fires = Rc::new(RefCell::new(0u32));
    let f = fires.clone();
    loop_
        .add_cyclic_callback(
            Box::new(move || *f.borrow_mut() += 1),
            10.0,
            Some(base),
            TimerPolicy::BaseTime,
        )
        .unwrap();

    clock.borrow_mut().advance(Duration::from_millis(45));
    loop_.run(0).unwrap();

    assert_eq!(*fires.borrow(), 1);
    assert_eq!(loop_.next_cyclic_time(), Some(base + Duration::from_millis(50)));
}

#[test]
fn delayed_callback_ordering() {
    let mut loop_ = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let a = order.clone();
    loop_.add_delayed_callback(Box::new(move || a.borrow_mut().push('A')));
    let b = order.clone();
    loop_.add_delayed_callback(Box::new(move || b.borrow_mut().push('B')));
    let c = order.clone();
    loop_.add_delayed_callback(Box::new(move || c.borrow_mut().push('C')));

    loop_.run(0).unwrap();

    assert_eq!(*order.borrow(), vec!['A', 'B', 'C']);
}
