// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Byte transports beneath the session state machines.
//!
//! Transports never block. A connect is started and then polled until it
//! completes, reads return whatever is available and writes may be partial. Only sockets have a real implementation;
//! the other connection modes are recognised but refused at device creation.

use crate::error::{CommsError, TransportError};
use crate::types::ConnMode;
use bytes::BytesMut;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub trait Transport: Send {
    /// Starts connecting to `target`, a `host port` or `host:port` string. The attempt
    /// is abandoned if it has not completed within `timeout`.
    fn connect(&mut self, target: &str, timeout: Duration) -> Result<(), TransportError>;
    /// `Ok(true)` once connected, `Ok(false)` while the connect is still in progress.
    fn poll_connect(&mut self) -> Result<bool, TransportError>;
    fn is_connected(&self) -> bool;
    /// Appends whatever bytes are available to `buf`. Loss of the link is an error.
    fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError>;
    /// Writes as much of `data` as the link accepts without blocking.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    fn disconnect(&mut self);
    fn peer(&self) -> String;
}

pub trait Listener: Send {
    /// Returns the next pending connection, if any.
    fn accept(&mut self) -> Result<Option<Box<dyn Transport>>, TransportError>;
    fn set_backlog(&mut self, backlog: i32) -> Result<(), TransportError>;
    fn port(&self) -> u16;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, mode: ConnMode) -> Result<Box<dyn Transport>, CommsError>;
    fn bind(&self, port: u16, backlog: i32) -> Result<Box<dyn Listener>, TransportError>;
}

/// Splits `host port` or `host:port`.
pub fn parse_target(target: &str) -> Result<(String, u16), TransportError> {
    let target = target.trim();
    let (host, port) = match target.split_once(char::is_whitespace) {
        Some((h, p)) => (h, p.trim()),
        None => target
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Address(target.to_string()))?,
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::Address(target.to_string()))?;
    Ok((host.to_string(), port))
}

fn resolve(target: &str) -> Result<SocketAddr, TransportError> {
    let (host, port) = parse_target(target)?;
    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Address(target.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Address(target.to_string()))
}

#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub linger: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            linger: true,
        }
    }
}

pub struct TcpTransport {
    socket: Option<Socket>,
    /// A connect in progress and when it is abandoned.
    pending: Option<(Socket, Instant)>,
    peer: String,
    options: SocketOptions,
}

fn in_progress(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

impl TcpTransport {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            socket: None,
            pending: None,
            peer: String::new(),
            options,
        }
    }

    fn connect_failed(&self, source: std::io::Error) -> TransportError {
        TransportError::Connect {
            target: self.peer.clone(),
            source,
        }
    }

    fn from_accepted(socket: Socket, addr: SockAddr, options: SocketOptions) -> Self {
        let peer = addr
            .as_socket()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            socket: Some(socket),
            pending: None,
            peer,
            options,
        }
    }

    fn configure(&self, socket: &Socket) -> std::io::Result<()> {
        if self.options.keepalive {
            socket.set_keepalive(true)?;
        }
        if self.options.linger {
            socket.set_linger(Some(Duration::from_secs(5)))?;
        }
        socket.set_tcp_nodelay(true)?;
        socket.set_nonblocking(true)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, target: &str, timeout: Duration) -> Result<(), TransportError> {
        self.disconnect();
        self.peer = target.to_string();
        let addr = resolve(target)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if in_progress(&e) => {}
            Err(e) => return Err(self.connect_failed(e)),
        }
        self.pending = Some((socket, Instant::now() + timeout));
        Ok(())
    }

    fn poll_connect(&mut self) -> Result<bool, TransportError> {
        if self.socket.is_some() {
            return Ok(true);
        }
        let Some((socket, deadline)) = self.pending.take() else {
            return Err(TransportError::NotConnected);
        };
        if let Some(e) = socket.take_error()? {
            return Err(self.connect_failed(e));
        }
        match socket.peer_addr() {
            Ok(_) => {
                self.configure(&socket)?;
                self.socket = Some(socket);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                if Instant::now() >= deadline {
                    return Err(self.connect_failed(ErrorKind::TimedOut.into()));
                }
                self.pending = Some((socket, deadline));
                Ok(false)
            }
            Err(e) => Err(self.connect_failed(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        loop {
            match socket.read(&mut chunk) {
                Ok(0) => {
                    self.disconnect();
                    return Err(TransportError::Closed);
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    total += n;
                    if n < chunk.len() {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        match socket.write(data) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => {
                self.disconnect();
                Err(e.into())
            }
        }
    }

    fn disconnect(&mut self) {
        self.pending = None;
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
                debug!(peer = %self.peer, "shutdown: {e}");
            }
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

pub struct TcpListenSocket {
    socket: Socket,
    port: u16,
    options: SocketOptions,
}

impl Listener for TcpListenSocket {
    fn accept(&mut self) -> Result<Option<Box<dyn Transport>>, TransportError> {
        match self.socket.accept() {
            Ok((socket, addr)) => {
                let transport = TcpTransport::from_accepted(socket, addr, self.options);
                if let Some(s) = &transport.socket {
                    transport.configure(s)?;
                }
                Ok(Some(Box::new(transport)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Accept(e)),
        }
    }

    fn set_backlog(&mut self, backlog: i32) -> Result<(), TransportError> {
        self.socket.listen(backlog)?;
        Ok(())
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Builds real sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFactory {
    pub options: SocketOptions,
}

impl TransportFactory for TcpFactory {
    fn create(&self, mode: ConnMode) -> Result<Box<dyn Transport>, CommsError> {
        match mode {
            ConnMode::Socket => Ok(Box::new(TcpTransport::new(self.options))),
            other => {
                warn!(mode = %other, "transport mode not available");
                Err(CommsError::UnsupportedMode(other))
            }
        }
    }

    fn bind(&self, port: u16, backlog: i32) -> Result<Box<dyn Listener>, TransportError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let bind_err = |source| TransportError::Bind { port, source };
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&SockAddr::from(addr)).map_err(bind_err)?;
        socket.listen(backlog.max(1)).map_err(bind_err)?;
        socket.set_nonblocking(true)?;
        let port = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .map(|a| a.port())
            .unwrap_or(port);
        Ok(Box::new(TcpListenSocket {
            socket,
            port,
            options: self.options,
        }))
    }
}

/// An in-memory network for exercising the state machines without sockets.
pub mod mock {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One end of a simulated link. Tests push the peer's bytes into `inbound` and
    /// read what the device wrote from `outbound`.
    #[derive(Debug, Default)]
    pub struct MockWire {
        pub connected: bool,
        pub target: Option<String>,
        pub inbound: BytesMut,
        pub outbound: BytesMut,
        pub lost: bool,
        /// Bytes the link will still take; `None` is unlimited.
        pub room: Option<usize>,
        /// Writes fail and drop the link.
        pub broken: bool,
    }

    impl MockWire {
        pub fn push(&mut self, data: &str) {
            self.inbound.extend_from_slice(data.as_bytes());
        }

        pub fn take_output(&mut self) -> String {
            let out = String::from_utf8_lossy(&self.outbound).into_owned();
            self.outbound.clear();
            out
        }

        /// The next read reports the link as gone.
        pub fn drop_link(&mut self) {
            self.lost = true;
        }
    }

    pub type SharedWire = Arc<Mutex<MockWire>>;

    #[derive(Default)]
    struct NetState {
        unreachable: Mutex<HashSet<String>>,
        refuse_all: AtomicBool,
        connects: Mutex<Vec<String>>,
        /// Targets whose connects stay in progress.
        slow: Mutex<HashSet<String>>,
        wires: Mutex<Vec<SharedWire>>,
        incoming: Mutex<VecDeque<SharedWire>>,
        fail_bind: AtomicBool,
        bind_attempts: AtomicUsize,
        backlog: AtomicI32,
    }

    #[derive(Clone, Default)]
    pub struct MockNet {
        state: Arc<NetState>,
    }

    impl MockNet {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_unreachable(&self, target: &str, unreachable: bool) {
            let mut set = lock(&self.state.unreachable);
            if unreachable {
                set.insert(target.to_string());
            } else {
                set.remove(target);
            }
        }

        /// Connects to `target` stay in progress until this is cleared.
        pub fn set_slow(&self, target: &str, slow: bool) {
            let mut set = lock(&self.state.slow);
            if slow {
                set.insert(target.to_string());
            } else {
                set.remove(target);
            }
        }

        pub fn set_refuse_all(&self, refuse: bool) {
            self.state.refuse_all.store(refuse, Ordering::SeqCst);
        }

        /// Every connect attempt, in order.
        pub fn connects(&self) -> Vec<String> {
            lock(&self.state.connects).clone()
        }

        /// Every wire handed out, in creation order.
        pub fn wires(&self) -> Vec<SharedWire> {
            lock(&self.state.wires).clone()
        }

        /// The most recent wire connected to `target`.
        pub fn wire_for(&self, target: &str) -> Option<SharedWire> {
            lock(&self.state.wires)
                .iter()
                .rev()
                .find(|w| lock(w).target.as_deref() == Some(target))
                .cloned()
        }

        /// Queues an inbound call for the listener.
        pub fn dial_in(&self) -> SharedWire {
            let wire = Arc::new(Mutex::new(MockWire {
                connected: true,
                target: Some("caller".to_string()),
                ..Default::default()
            }));
            lock(&self.state.incoming).push_back(wire.clone());
            wire
        }

        pub fn pending_calls(&self) -> usize {
            lock(&self.state.incoming).len()
        }

        pub fn set_fail_bind(&self, fail: bool) {
            self.state.fail_bind.store(fail, Ordering::SeqCst);
        }

        pub fn bind_attempts(&self) -> usize {
            self.state.bind_attempts.load(Ordering::SeqCst)
        }

        pub fn backlog(&self) -> i32 {
            self.state.backlog.load(Ordering::SeqCst)
        }

        fn new_wire(&self, wire: SharedWire) -> MockTransport {
            lock(&self.state.wires).push(wire.clone());
            MockTransport {
                state: self.state.clone(),
                wire,
                dialing: false,
            }
        }
    }

    pub struct MockTransport {
        state: Arc<NetState>,
        wire: SharedWire,
        dialing: bool,
    }

    impl MockTransport {
        pub fn wire(&self) -> SharedWire {
            self.wire.clone()
        }
    }

    impl MockTransport {
        fn refused(&self, target: &str) -> bool {
            self.state.refuse_all.load(Ordering::SeqCst)
                || lock(&self.state.unreachable).contains(target)
        }
    }

    fn refusal(target: &str) -> TransportError {
        TransportError::Connect {
            target: target.to_string(),
            source: std::io::Error::from(ErrorKind::ConnectionRefused),
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, target: &str, _timeout: Duration) -> Result<(), TransportError> {
            lock(&self.state.connects).push(target.to_string());
            let refused = self.refused(target);
            let mut wire = lock(&self.wire);
            wire.target = Some(target.to_string());
            wire.connected = false;
            if refused {
                return Err(refusal(target));
            }
            self.dialing = true;
            Ok(())
        }

        fn poll_connect(&mut self) -> Result<bool, TransportError> {
            let target = {
                let wire = lock(&self.wire);
                if wire.connected {
                    return Ok(true);
                }
                wire.target.clone().unwrap_or_default()
            };
            if !self.dialing {
                return Err(TransportError::NotConnected);
            }
            if lock(&self.state.slow).contains(&target) {
                return Ok(false);
            }
            self.dialing = false;
            if self.refused(&target) {
                return Err(refusal(&target));
            }
            let mut wire = lock(&self.wire);
            wire.connected = true;
            wire.lost = false;
            Ok(true)
        }

        fn is_connected(&self) -> bool {
            lock(&self.wire).connected
        }

        fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
            let mut wire = lock(&self.wire);
            if !wire.connected {
                return Err(TransportError::NotConnected);
            }
            if wire.lost {
                wire.lost = false;
                wire.connected = false;
                return Err(TransportError::Closed);
            }
            let n = wire.inbound.len();
            buf.extend_from_slice(&wire.inbound);
            wire.inbound.clear();
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let mut wire = lock(&self.wire);
            if !wire.connected {
                return Err(TransportError::NotConnected);
            }
            if wire.broken {
                wire.connected = false;
                return Err(TransportError::Closed);
            }
            let n = wire.room.map_or(data.len(), |room| room.min(data.len()));
            if let Some(room) = wire.room.as_mut() {
                *room -= n;
            }
            wire.outbound.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn disconnect(&mut self) {
            self.dialing = false;
            lock(&self.wire).connected = false;
        }

        fn peer(&self) -> String {
            lock(&self.wire).target.clone().unwrap_or_default()
        }
    }

    pub struct MockListener {
        net: MockNet,
        port: u16,
    }

    impl Listener for MockListener {
        fn accept(&mut self) -> Result<Option<Box<dyn Transport>>, TransportError> {
            let next = lock(&self.net.state.incoming).pop_front();
            Ok(next.map(|wire| Box::new(self.net.new_wire(wire)) as Box<dyn Transport>))
        }

        fn set_backlog(&mut self, backlog: i32) -> Result<(), TransportError> {
            self.net.state.backlog.store(backlog, Ordering::SeqCst);
            Ok(())
        }

        fn port(&self) -> u16 {
            self.port
        }
    }

    impl TransportFactory for MockNet {
        fn create(&self, mode: ConnMode) -> Result<Box<dyn Transport>, CommsError> {
            if mode != ConnMode::Socket {
                return Err(CommsError::UnsupportedMode(mode));
            }
            Ok(Box::new(self.new_wire(SharedWire::default())))
        }

        fn bind(&self, port: u16, backlog: i32) -> Result<Box<dyn Listener>, TransportError> {
            self.state.bind_attempts.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_bind.load(Ordering::SeqCst) {
                return Err(TransportError::Bind {
                    port,
                    source: std::io::Error::from(ErrorKind::AddrInUse),
                });
            }
            self.state.backlog.store(backlog, Ordering::SeqCst);
            Ok(Box::new(MockListener {
                net: self.clone(),
                port,
            }))
        }
    }
}
