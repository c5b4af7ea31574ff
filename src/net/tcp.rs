//! The TCP connection manager: listener sockets, outbound connect,
//! per-connection send/recv, and the zero-copy-ish buffer handoff
//! contract.
//!
//! Mirrors mio's own `examples/tcp_server.rs`: the accept loop, the
//! `Interest::READABLE.add(WRITABLE)` re-registration dance around short
//! writes, and the `would_block`/`interrupted` helpers are the same shape
//! here, generalized from one hard-coded socket map to a registered
//! [`crate::source::EventSource`] with an application callback.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;

use log::{debug, trace, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use slab::Slab;

use crate::error::{Error, Result, StatusCode};
use crate::params::{keys, ParamMap, Value};
use crate::registry::token_for;
use crate::source::{EventSource, EventSourceState, EventSourceType, LoopContext};

/// Listener sockets get the low end of the connection manager's local
/// token range; connections start above this so the two never collide.
/// A manager with more than 4096 listening sockets is not a case this
/// crate is built for.
const CONNECTION_TOKEN_BASE: usize = 4096;

/// Stable, monotonically issued, never-reused identifier for a connection.
/// Zero is never issued.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Established,
    Closing,
}

/// A send buffer owned by the manager. Allocated via
/// [`TcpConnectionManager::alloc_network_buffer`]; from then on exactly one
/// of two things happens to it: it is handed back via
/// [`TcpConnectionManager::free_network_buffer`], or it is consumed by
/// [`TcpConnectionManager::send_with_connection`]. Rust's ownership makes
/// the double-free/use-after-send defects the original warns about
/// unrepresentable: once a `NetworkBuffer` is moved into `send`, the
/// caller no longer has a value to free.
#[derive(Debug)]
pub struct NetworkBuffer {
    data: Vec<u8>,
}

impl NetworkBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

struct Connection<C> {
    id: ConnectionId,
    socket: TcpStream,
    direction: Direction,
    state: ConnState,
    context: C,
    token: Token,
    /// Outbound bytes not yet written to the socket, in call order.
    out: VecDeque<u8>,
    /// Whether the socket is currently registered with WRITABLE interest.
    writable_registered: bool,
}

struct ListenerSlot {
    listener: TcpListener,
    recv_bufsize: usize,
}

/// The callback the application sees connection events through. Mirrors
/// `UA_ConnectionManager::connectionCallback`: `cm` and `context` let the
/// application reach back into the manager (close/send/alloc) and persist
/// state across calls for one connection.
pub type ConnectionCallback<C> = Box<
    dyn FnMut(&mut TcpConnectionManager<C>, ConnectionId, &mut C, StatusCode, &ParamMap, &[u8]),
>;

/// Listens on TCP sockets and manages inbound/outbound connections.
///
/// `C` is the per-connection application context type (the original's
/// opaque `void*`); it must be `Clone` so the manager can seed new
/// connections from `initial_connection_context`, and `Default` so a
/// context can be swapped out for the duration of a callback invocation
/// without a borrow conflict (see `invoke_callback`). Most users can leave
/// it at the default `()`.
pub struct TcpConnectionManager<C: Clone + Default + 'static = ()> {
    name: String,
    state: EventSourceState,
    params: ParamMap,
    registry: Option<Registry>,
    /// This source's stable id, cached from `LoopContext` at `start()`.
    /// Every listener/connection token is shared under this value (see
    /// `crate::registry`), and since the loop never reuses a source id,
    /// caching it once here stays correct even if other sources are later
    /// deregistered and the registry reindexes around this one.
    source_id: usize,
    listeners: Vec<ListenerSlot>,
    connections: Slab<Connection<C>>,
    id_index: HashMap<ConnectionId, usize>,
    next_connection_id: u64,
    initial_connection_context: C,
    callback: Option<ConnectionCallback<C>>,
}

impl<C: Clone + Default + 'static> TcpConnectionManager<C> {
    pub fn new(name: impl Into<String>) -> Self {
        TcpConnectionManager {
            name: name.into(),
            state: EventSourceState::Fresh,
            params: ParamMap::new(),
            registry: None,
            source_id: 0,
            listeners: Vec::new(),
            connections: Slab::new(),
            id_index: HashMap::new(),
            next_connection_id: 1,
            initial_connection_context: C::default(),
            callback: None,
        }
    }

    /// Listener configuration (`listen-port`, `listen-hostnames`,
    /// `recv-bufsize`); must be set before `start`.
    pub fn params_mut(&mut self) -> &mut ParamMap {
        &mut self.params
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback<C>) {
        self.callback = Some(cb);
    }

    pub fn set_initial_connection_context(&mut self, ctx: C) {
        self.initial_connection_context = ctx;
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn direction(&self, id: ConnectionId) -> Option<Direction> {
        let &slot = self.id_index.get(&id)?;
        self.connections.get(slot).map(|c| c.direction)
    }

    /// Bound addresses of every listener, in the order they were created.
    /// Mainly useful with `listen-port = 0` (ephemeral port), where the
    /// caller needs to learn the actual port the OS assigned.
    pub fn listener_local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.listener.local_addr().ok())
            .collect()
    }

    fn issue_connection_id(&mut self) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }

    /// Begin a non-blocking outbound connect. Required params: `hostname`,
    /// `port`. Local failures (bad params, resolution failure, descriptor
    /// exhaustion) return synchronously; the connection callback announces
    /// completion (`Good`) or asynchronous failure.
    pub fn open_connection(&mut self, params: &ParamMap, ctx: C) -> Result<ConnectionId> {
        let hostname = params.require_str(keys::HOSTNAME)?;
        let port = params.require_u16(keys::PORT)?;
        let addr = (hostname, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidArgument(format!("cannot resolve {hostname}:{port}: {e}")))?
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("no address for {hostname}:{port}")))?;

        let socket = TcpStream::connect(addr).map_err(Error::CommunicationError)?;
        let id = self.adopt_connection(socket, Direction::Outbound, ConnState::Connecting, ctx);
        debug!(target: "evloop_core::net::tcp", "{}: opening connection {id} to {addr}", self.name);
        Ok(id)
    }

    pub fn alloc_network_buffer(&self, _id: ConnectionId, size: usize) -> Result<NetworkBuffer> {
        Ok(NetworkBuffer {
            data: vec![0u8; size],
        })
    }

    /// Returns a buffer allocated by `alloc_network_buffer` without sending
    /// it. Taking `buf` by value and doing nothing else is the whole
    /// contract: once it is dropped here, the caller no longer has a handle
    /// to free or send it twice.
    pub fn free_network_buffer(&self, _buf: NetworkBuffer) {}

    /// Ownership of `buf` transfers here regardless of outcome: Rust
    /// drops it for us once this function returns, whether it was fully,
    /// partially, or never written to the wire.
    pub fn send_with_connection(
        &mut self,
        id: ConnectionId,
        _params: &ParamMap,
        buf: NetworkBuffer,
    ) -> Result<()> {
        let slot = *self
            .id_index
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;
        let conn = self
            .connections
            .get_mut(slot)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;
        if conn.state == ConnState::Closing {
            return Err(Error::ConnectionClosed);
        }
        trace!(target: "evloop_core::net::tcp", "{}: queuing {} bytes on connection {id}", self.name, buf.len());
        conn.out.extend(buf.data);
        Self::flush(&self.registry, conn)?;
        Ok(())
    }

    /// Idempotent only in the sense of never double-delivering the
    /// terminal callback: a second call on an already-closing connection
    /// returns `ConnectionClosed` without side effects.
    pub fn close_connection(&mut self, id: ConnectionId) -> Result<()> {
        let slot = *self
            .id_index
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;
        {
            let conn = self
                .connections
                .get_mut(slot)
                .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;
            if conn.state == ConnState::Closing {
                return Err(Error::ConnectionClosed);
            }
            conn.state = ConnState::Closing;
            if let Some(registry) = &self.registry {
                let _ = registry.deregister(&mut conn.socket);
            }
        }
        self.invoke_callback(id, StatusCode::BadConnectionClosed, &ParamMap::new(), &[]);
        self.connections.remove(slot);
        self.id_index.remove(&id);
        Ok(())
    }

    fn adopt_connection(
        &mut self,
        mut socket: TcpStream,
        direction: Direction,
        state: ConnState,
        ctx: C,
    ) -> ConnectionId {
        let id = self.issue_connection_id();
        let entry = self.connections.vacant_entry();
        let slot = entry.key();
        let token = token_for(self.source_id, CONNECTION_TOKEN_BASE + slot);
        if let Some(registry) = &self.registry {
            if let Err(e) =
                registry.register(&mut socket, token, Interest::READABLE.add(Interest::WRITABLE))
            {
                warn!(target: "evloop_core::net::tcp", "{}: failed to register connection: {e}", self.name);
            }
        }
        entry.insert(Connection {
            id,
            socket,
            direction,
            state,
            context: ctx,
            token,
            out: VecDeque::new(),
            writable_registered: true,
        });
        self.id_index.insert(id, slot);

        if state == ConnState::Established {
            self.invoke_callback(id, StatusCode::Good, &ParamMap::new(), &[]);
        }
        id
    }

    fn flush(registry: &Option<Registry>, conn: &mut Connection<impl Clone + Default>) -> Result<()> {
        loop {
            if conn.out.is_empty() {
                break;
            }
            let (first, _) = conn.out.as_slices();
            match conn.socket.write(first) {
                Ok(0) => {
                    return Err(Error::CommunicationError(io::Error::from(
                        io::ErrorKind::WriteZero,
                    )))
                }
                Ok(n) => {
                    conn.out.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::CommunicationError(e)),
            }
        }
        let want_writable = !conn.out.is_empty();
        if let Some(registry) = registry {
            if want_writable != conn.writable_registered {
                let interest = if want_writable {
                    Interest::READABLE.add(Interest::WRITABLE)
                } else {
                    Interest::READABLE
                };
                registry.reregister(&mut conn.socket, conn.token, interest)?;
                conn.writable_registered = want_writable;
            }
        }
        Ok(())
    }

    /// Take the callback out, invoke it with a freestanding context so the
    /// callback can freely call back into `self` (close/send/alloc)
    /// without aliasing the connection it's being invoked for, then
    /// restore both. If the connection has already been removed (e.g. the
    /// callback itself closed it), the context is simply dropped.
    fn invoke_callback(&mut self, id: ConnectionId, status: StatusCode, params: &ParamMap, msg: &[u8]) {
        let Some(mut cb) = self.callback.take() else {
            return;
        };
        let Some(&slot) = self.id_index.get(&id) else {
            self.callback = Some(cb);
            return;
        };
        let mut ctx = self
            .connections
            .get_mut(slot)
            .map(|conn| std::mem::take(&mut conn.context))
            .unwrap_or_default();
        cb(self, id, &mut ctx, status, params, msg);
        if let Some(conn) = self.connections.get_mut(slot) {
            conn.context = ctx;
        }
        self.callback = Some(cb);
    }

    fn handle_listener_event(&mut self, listener_idx: usize) {
        loop {
            let accepted = match self.listeners.get(listener_idx) {
                Some(slot) => slot.listener.accept(),
                None => break,
            };
            let (socket, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "evloop_core::net::tcp", "{}: accept failed: {e}", self.name);
                    break;
                }
            };
            let ctx = self.initial_connection_context.clone();
            let id = self.adopt_connection(socket, Direction::Inbound, ConnState::Established, ctx);
            let params =
                ParamMap::new().with(keys::REMOTE_HOSTNAME, Value::String(addr.to_string()));
            debug!(target: "evloop_core::net::tcp", "{}: accepted connection {id} from {addr}", self.name);
            self.invoke_callback(id, StatusCode::Good, &params, &[]);
        }
    }

    fn handle_connection_event(&mut self, slot: usize, event: &Event) -> Result<()> {
        let Some(conn) = self.connections.get(slot) else {
            return Ok(());
        };
        let id = conn.id;
        let was_connecting = conn.state == ConnState::Connecting;

        if was_connecting && event.is_writable() {
            let connect_error = self
                .connections
                .get_mut(slot)
                .and_then(|c| c.socket.take_error().ok().flatten());
            match connect_error {
                None => {
                    if let Some(c) = self.connections.get_mut(slot) {
                        c.state = ConnState::Established;
                    }
                    self.invoke_callback(id, StatusCode::Good, &ParamMap::new(), &[]);
                }
                Some(e) => {
                    warn!(target: "evloop_core::net::tcp", "{}: connect failed for {id}: {e}", self.name);
                    if let Some(registry) = &self.registry {
                        if let Some(c) = self.connections.get_mut(slot) {
                            let _ = registry.deregister(&mut c.socket);
                        }
                    }
                    self.invoke_callback(id, StatusCode::BadCommunicationError, &ParamMap::new(), &[]);
                    self.connections.remove(slot);
                    self.id_index.remove(&id);
                    return Ok(());
                }
            }
        } else if event.is_writable() {
            if let Some(conn) = self.connections.get_mut(slot) {
                if let Err(e) = Self::flush(&self.registry, conn) {
                    warn!(target: "evloop_core::net::tcp", "{}: write failed for {id}: {e}", self.name);
                    self.retire_with_error(id, slot);
                    return Ok(());
                }
            }
        }

        if event.is_readable() {
            self.drain_readable(id, slot);
        }
        Ok(())
    }

    fn drain_readable(&mut self, id: ConnectionId, slot: usize) {
        let mut closed = false;
        let mut errored = false;
        let mut received = Vec::new();
        loop {
            let conn = match self.connections.get_mut(slot) {
                Some(c) => c,
                None => return,
            };
            let mut buf = [0u8; 4096];
            match conn.socket.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "evloop_core::net::tcp", "{}: read failed for {id}: {e}", self.name);
                    errored = true;
                    break;
                }
            }
        }
        if !received.is_empty() {
            trace!(target: "evloop_core::net::tcp", "{}: {} bytes received on {id}", self.name, received.len());
            self.invoke_callback(id, StatusCode::Good, &ParamMap::new(), &received);
        }
        if closed || errored {
            self.retire_with_error(id, slot);
        }
    }

    fn retire_with_error(&mut self, id: ConnectionId, slot: usize) {
        if let Some(registry) = &self.registry {
            if let Some(conn) = self.connections.get_mut(slot) {
                let _ = registry.deregister(&mut conn.socket);
            }
        }
        self.invoke_callback(id, StatusCode::BadConnectionClosed, &ParamMap::new(), &[]);
        self.connections.remove(slot);
        self.id_index.remove(&id);
    }

    fn resolve_listener_addrs(&self) -> Result<Vec<std::net::SocketAddr>> {
        let port = match self.params.get_u16(keys::LISTEN_PORT)? {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let hosts = self
            .params
            .get_str_list(keys::LISTEN_HOSTNAMES)?
            .unwrap_or_else(|| vec!["0.0.0.0".to_string()]);
        let mut addrs = Vec::new();
        for host in hosts {
            let resolved = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| Error::InvalidArgument(format!("cannot resolve {host}:{port}: {e}")))?;
            addrs.extend(resolved);
        }
        Ok(addrs)
    }
}

impl<C: Clone + Default + 'static> EventSource for TcpConnectionManager<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> EventSourceType {
        EventSourceType::ConnectionManager
    }

    fn state(&self) -> EventSourceState {
        self.state
    }

    fn start(&mut self, cx: &mut LoopContext<'_>) -> Result<()> {
        self.state = EventSourceState::Starting;
        self.source_id = cx.source_id;
        self.registry = Some(cx.registry.try_clone().map_err(Error::CommunicationError)?);

        let recv_bufsize = self.params.get_u16(keys::RECV_BUFSIZE)?.unwrap_or(16384) as usize;
        let addrs = self.resolve_listener_addrs()?;
        for (i, addr) in addrs.into_iter().enumerate() {
            let mut listener = TcpListener::bind(addr).map_err(Error::CommunicationError)?;
            let token = cx.token(i);
            cx.registry
                .register(&mut listener, token, Interest::READABLE)
                .map_err(Error::CommunicationError)?;
            debug!(target: "evloop_core::net::tcp", "{}: listening on {addr}", self.name);
            self.listeners.push(ListenerSlot {
                listener,
                recv_bufsize,
            });
        }
        self.state = EventSourceState::Started;
        Ok(())
    }

    fn stop(&mut self, cx: &mut LoopContext<'_>) {
        self.state = EventSourceState::Stopping;
        for listener in &mut self.listeners {
            let _ = cx.registry.deregister(&mut listener.listener);
        }
        self.listeners.clear();

        let ids: Vec<ConnectionId> = self.connections.iter().map(|(_, c)| c.id).collect();
        for id in ids {
            let _ = self.close_connection(id);
        }
        debug!(target: "evloop_core::net::tcp", "{}: stopped", self.name);
        self.state = EventSourceState::Stopped;
    }

    fn handle_event(
        &mut self,
        _cx: &mut LoopContext<'_>,
        local_token: usize,
        event: &Event,
    ) -> Result<()> {
        if local_token < CONNECTION_TOKEN_BASE {
            self.handle_listener_event(local_token);
            return Ok(());
        }
        let slot = local_token - CONNECTION_TOKEN_BASE;
        self.handle_connection_event(slot, event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
