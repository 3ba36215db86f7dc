// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport multiplexer: every user-plane and control socket of the
//! process behind one reactor handler.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                           TransportMux                             |
//! |  +--------------+   +-----------------+   +---------------------+  |
//! |  |  SocketPool  |   |  fd -> conn map |   |  event queue (FIFO) |  |
//! |  +--------------+   +-----------------+   +---------------------+  |
//! |         |                                                          |
//! |   listen / connect / send / send_to / close / start_tls / stop_tls |
//! |         |                                                          |
//! |  TCP listen+accept | TCP stream | UDP | SCTP listen | SCTP assoc   |
//! |         TLS over stream (rustls) | DTLS via provider seam          |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Inbound pipeline per readable event: receive up to [`RECV_CHUNK`] bytes
//! into the connection buffer, loop the framer over it, emit one `Receive`
//! event per complete frame. On end-of-stream the draining policy runs the
//! close-time framer over whatever is left, then the connection closes.
//!
//! All operations are non-blocking; a send that cannot complete either
//! reports partial progress (`pureNonBlocking`) or parks the caller in
//! [`Reactor::block_for_writable`] until the socket drains.

pub mod events;
pub mod framing;
pub mod options;
pub mod sctp;
pub mod tls;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{Options, RECV_CHUNK};
use crate::error::{Error, ErrorKind, Result};
use crate::pool::{ConnId, ConnState, SockKind, SocketPool, TlsRole};
use crate::reactor::{EventHandler, HandlerId, Reactor, FD_EVENT_RD, FD_EVENT_WR};

use events::{OpResult, PortEvent, Proto};
use options::{apply_socket_option, with_socket, SockOption};
use tls::{CookieListen, DtlsHandshake, DtlsProvider, SrtpKeysAndSalts, TlsSession};

/// Outcome of a send operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// All bytes accepted by the transport.
    Complete(usize),
    /// The socket pushed back in pure-non-blocking mode; `sent` bytes are
    /// already on the wire, the caller owns the rest.
    Blocked { sent: usize },
}

/// Outcome of a connect operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Established(ConnId),
    /// `connect(2)` reported EINPROGRESS; completion arrives as a `Result`
    /// event once the socket signals writability.
    Pending(ConnId),
}

impl ConnectOutcome {
    pub fn conn(self) -> ConnId {
        match self {
            ConnectOutcome::Established(c) | ConnectOutcome::Pending(c) => c,
        }
    }
}

/// Per-message transport hints (SCTP stream id and payload protocol id).
#[derive(Debug, Clone, Copy, Default)]
pub struct SendHint {
    pub stream: u16,
    pub ppid: u32,
}

/// Introspection record of one live connection.
#[derive(Debug, Clone)]
pub struct ConnDetails {
    pub proto: Proto,
    pub kind: SockKind,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub user_tag: i64,
    pub parent: Option<ConnId>,
}

// ============================================================================
// Small fd helpers
// ============================================================================

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os(ErrorKind::Socket, "fcntl(F_GETFL) failed"));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os(ErrorKind::Socket, "fcntl(F_SETFL) failed"));
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::last_os(ErrorKind::Socket, "fcntl(F_GETFD) failed"));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::last_os(ErrorKind::Socket, "fcntl(F_SETFD) failed"));
    }
    Ok(())
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| {
            Error::new(
                ErrorKind::Hostname,
                format!("cannot resolve host {:?}: {}", host, e),
            )
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::new(
            ErrorKind::Hostname,
            format!("host {:?} resolved to no addresses", host),
        ));
    }
    Ok(addrs)
}

fn local_addr_of(fd: RawFd) -> Option<SocketAddr> {
    with_socket(fd, |s| s.local_addr())
        .ok()
        .and_then(|a| a.as_socket())
}

fn peer_addr_of(fd: RawFd) -> Option<SocketAddr> {
    with_socket(fd, |s| s.peer_addr())
        .ok()
        .and_then(|a| a.as_socket())
}

fn take_socket_error(fd: RawFd) -> Option<std::io::Error> {
    with_socket(fd, |s| s.take_error()).ok().flatten()
}

// ============================================================================
// Mux handle
// ============================================================================

/// Owner-facing handle; the core lives behind `Rc<RefCell>` because it is
/// simultaneously a reactor handler and the test layer's service interface
/// (single-threaded, so plain interior mutability).
pub struct TransportMux {
    core: Rc<RefCell<MuxCore>>,
}

impl TransportMux {
    pub fn new(reactor: &mut Reactor, options: Options) -> Self {
        let core = Rc::new(RefCell::new(MuxCore::new(options)));
        let id = reactor.register_handler(core.clone());
        core.borrow_mut().handler_id = id;
        Self { core }
    }

    pub fn handler_id(&self) -> HandlerId {
        self.core.borrow().handler_id
    }

    /// Next queued event, in arrival order.
    pub fn poll_event(&self) -> Option<PortEvent> {
        self.core.borrow_mut().events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.core.borrow().events.is_empty()
    }

    /// Install the pluggable DTLS engine.
    pub fn set_dtls_provider(&self, provider: Box<dyn DtlsProvider>) {
        self.core.borrow_mut().dtls = Some(provider);
    }

    pub fn listen(
        &self,
        reactor: &mut Reactor,
        local: Option<(&str, u16)>,
        proto: Proto,
        opts: &[SockOption],
    ) -> Result<ConnId> {
        let result = self.core.borrow_mut().listen(reactor, local, proto, opts);
        self.core.borrow_mut().mirror(&result);
        result
    }

    pub fn connect(
        &self,
        reactor: &mut Reactor,
        remote: (&str, u16),
        local: Option<(&str, u16)>,
        existing: Option<ConnId>,
        proto: Proto,
        opts: &[SockOption],
    ) -> Result<ConnectOutcome> {
        let outcome = self
            .core
            .borrow_mut()
            .connect(reactor, remote, local, existing, proto, opts);
        let mirrored = outcome.clone().map(ConnectOutcome::conn);
        self.core.borrow_mut().mirror(&mirrored);
        outcome
    }

    pub fn send(
        &self,
        reactor: &mut Reactor,
        conn: ConnId,
        bytes: &[u8],
        hint: Option<SendHint>,
    ) -> Result<SendStatus> {
        self.core.borrow_mut().send(reactor, conn, bytes, hint)
    }

    pub fn send_to(
        &self,
        reactor: &mut Reactor,
        conn: ConnId,
        remote: (&str, u16),
        bytes: &[u8],
        hint: Option<SendHint>,
    ) -> Result<SendStatus> {
        self.core
            .borrow_mut()
            .send_to(reactor, conn, remote, bytes, hint)
    }

    /// Send with completion guaranteed: partial writes are resolved through
    /// the writability wait even in pure-non-blocking configurations. The
    /// control plane uses this for its synchronous outbound frames.
    pub fn send_fully(&self, reactor: &mut Reactor, conn: ConnId, bytes: &[u8]) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let saved = core.options.pure_non_blocking;
        core.options.pure_non_blocking = false;
        let result = core.send(reactor, conn, bytes, None);
        core.options.pure_non_blocking = saved;
        match result? {
            SendStatus::Complete(_) => Ok(()),
            SendStatus::Blocked { .. } => unreachable!("blocking send cannot report Blocked"),
        }
    }

    pub fn close(&self, reactor: &mut Reactor, conn: ConnId) -> Result<()> {
        let result = self.core.borrow_mut().close(reactor, conn);
        let mirrored = result.as_ref().map(|_| conn).map_err(Error::clone);
        self.core.borrow_mut().mirror(&mirrored);
        result
    }

    pub fn start_tls(&self, reactor: &mut Reactor, conn: ConnId, server_side: bool) -> Result<()> {
        self.core.borrow_mut().start_tls(reactor, conn, server_side)
    }

    pub fn stop_tls(&self, reactor: &mut Reactor, conn: ConnId) -> Result<()> {
        self.core.borrow_mut().stop_tls(reactor, conn)
    }

    /// Keying-material export per the standard TLS exporter.
    pub fn export_tls_key(
        &self,
        conn: ConnId,
        label: &[u8],
        context: Option<&[u8]>,
        key_len: usize,
    ) -> Result<Vec<u8>> {
        let core = self.core.borrow();
        let desc = core.pool.lookup(conn)?;
        let session = desc.tls.as_ref().ok_or_else(|| no_tls(conn))?;
        session.export_keying_material(label, context, key_len)
    }

    pub fn export_srtp_keys_and_salts(&self, conn: ConnId) -> Result<SrtpKeysAndSalts> {
        let core = self.core.borrow();
        let desc = core.pool.lookup(conn)?;
        let session = desc.tls.as_ref().ok_or_else(|| no_tls(conn))?;
        session.export_srtp_keys_and_salts()
    }

    pub fn export_sctp_key(&self, conn: ConnId) -> Result<Vec<u8>> {
        let core = self.core.borrow();
        let desc = core.pool.lookup(conn)?;
        let session = desc.tls.as_ref().ok_or_else(|| no_tls(conn))?;
        session.export_sctp_key()
    }

    /// Replace the framing function of a connection.
    pub fn set_framer(&self, conn: ConnId, framer: framing::FramerFn, args: Vec<i64>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let desc = core.pool.lookup_mut(conn)?;
        desc.framer = framer;
        desc.framer_args = args;
        desc.pending_len = None;
        Ok(())
    }

    /// Withhold the first `n` bytes (the length field) of every frame from
    /// delivered payloads. Inherited by connections accepted from a
    /// listener.
    pub fn set_header_strip(&self, conn: ConnId, n: usize) -> Result<()> {
        self.core.borrow_mut().pool.lookup_mut(conn)?.header_strip = n;
        Ok(())
    }

    /// Framing applied while draining a closing connection.
    pub fn set_close_framer(
        &self,
        conn: ConnId,
        framer: framing::FramerFn,
        args: Vec<i64>,
    ) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let desc = core.pool.lookup_mut(conn)?;
        desc.close_framer = Some((framer, args));
        Ok(())
    }

    pub fn set_user_data(&self, conn: ConnId, tag: i64) -> Result<()> {
        self.core.borrow_mut().pool.lookup_mut(conn)?.user_tag = tag;
        Ok(())
    }

    pub fn user_data(&self, conn: ConnId) -> Result<i64> {
        Ok(self.core.borrow().pool.lookup(conn)?.user_tag)
    }

    pub fn connection_details(&self, conn: ConnId) -> Result<ConnDetails> {
        let core = self.core.borrow();
        let desc = core.pool.lookup(conn)?;
        Ok(ConnDetails {
            proto: desc.proto,
            kind: desc.kind,
            local: desc.local,
            remote: desc.remote,
            user_tag: desc.user_tag,
            parent: desc.parent,
        })
    }

    /// Adopt an already-connected stream descriptor (control rendezvous).
    ///
    /// The descriptor is switched to non-blocking and close-on-exec and
    /// joins the regular inbound pipeline with the given framing.
    pub fn adopt_stream(
        &self,
        reactor: &mut Reactor,
        fd: RawFd,
        proto: Proto,
        framer: framing::FramerFn,
        args: Vec<i64>,
    ) -> Result<ConnId> {
        self.core
            .borrow_mut()
            .adopt_stream(reactor, fd, proto, framer, args)
    }
}

fn no_tls(conn: ConnId) -> Error {
    Error::new(
        ErrorKind::General,
        format!("connection {} has no TLS session", conn),
    )
}

// ============================================================================
// Core
// ============================================================================

struct MuxCore {
    pool: SocketPool,
    fd_map: HashMap<RawFd, ConnId>,
    events: VecDeque<PortEvent>,
    options: Options,
    handler_id: HandlerId,
    dtls: Option<Box<dyn DtlsProvider>>,
}

impl MuxCore {
    fn new(options: Options) -> Self {
        Self {
            pool: SocketPool::with_reuse_distance(options.n_recently_closed),
            fd_map: HashMap::new(),
            events: VecDeque::new(),
            options,
            handler_id: HandlerId(0),
            dtls: None,
        }
    }

    fn emit(&mut self, event: PortEvent) {
        self.events.push_back(event);
    }

    /// Extended-events mode: mirror an operation outcome as a Result event.
    fn mirror(&mut self, result: &Result<ConnId>) {
        if !self.options.extended_port_events {
            return;
        }
        let op = match result {
            Ok(conn) => OpResult::available(*conn),
            Err(e) => OpResult::from_error(e, None),
        };
        self.emit(PortEvent::Result(op));
    }

    // ------------------------------------------------------------------
    // Socket construction
    // ------------------------------------------------------------------

    fn create_socket(&self, proto: Proto, addr: &SocketAddr) -> Result<RawFd> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = match proto {
            Proto::Tcp | Proto::Tls => Socket::new(domain, Type::STREAM, Some(Protocol::TCP)),
            Proto::Udp | Proto::DtlsUdp => Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)),
            Proto::Sctp | Proto::DtlsSctp => {
                Socket::new(domain, Type::STREAM, Some(Protocol::from(sctp::IPPROTO_SCTP)))
            }
            Proto::Unix => {
                return Err(Error::new(
                    ErrorKind::UnsupportedProtocol,
                    "local streams are adopted, not created",
                ))
            }
        }
        .map_err(|e| Error::from(e))?;
        let fd = socket.into_raw_fd();
        set_cloexec(fd)?;
        set_nonblocking(fd)?;
        Ok(fd)
    }

    /// Apply configured defaults plus explicit options; TLS-parameter
    /// options are collected instead of hitting the socket.
    fn apply_options(
        &self,
        fd: RawFd,
        proto: Proto,
        opts: &[SockOption],
        before_bind: bool,
        tls_params: &mut crate::pool::TlsParams,
    ) -> Result<()> {
        if before_bind {
            apply_socket_option(
                fd,
                proto,
                &SockOption::ReuseAddress(self.options.reuse_addr_for(proto)),
                true,
            )?;
            if matches!(proto, Proto::Sctp | Proto::DtlsSctp) {
                sctp::set_init_msg(
                    fd,
                    self.options.sinit_num_ostreams,
                    self.options.sinit_max_instreams,
                    self.options.sinit_max_attempts,
                    self.options.sinit_max_init_timeo,
                )?;
                sctp::set_event_subscriptions(fd, &self.options.sctp_events)?;
            }
            if matches!(proto, Proto::Udp | Proto::DtlsUdp) && self.options.broadcast {
                apply_socket_option(fd, proto, &SockOption::Broadcast(true), true)?;
            }
        }
        for opt in opts {
            if opt.is_tls_param() {
                if before_bind {
                    absorb_tls_param(tls_params, opt);
                }
                continue;
            }
            if opt.is_before_bind() != before_bind {
                continue;
            }
            apply_socket_option(fd, proto, opt, before_bind)?;
        }
        Ok(())
    }

    fn register_read(&mut self, reactor: &mut Reactor, fd: RawFd, conn: ConnId) -> Result<()> {
        reactor.add_fd(fd, self.handler_id, FD_EVENT_RD)?;
        self.fd_map.insert(fd, conn);
        Ok(())
    }

    /// Tear the connection out of reactor, fd map and pool; returns what
    /// the event path still needs (addresses, tag, protocol witness).
    fn teardown(&mut self, reactor: &mut Reactor, conn: ConnId) -> Result<crate::pool::SocketDesc> {
        let fd = self.pool.lookup(conn)?.fd;
        let _ = reactor.remove_fd(fd, self.handler_id, FD_EVENT_RD | FD_EVENT_WR);
        self.fd_map.remove(&fd);
        close_fd(fd);
        self.pool.free(conn)
    }

    // ------------------------------------------------------------------
    // Listen
    // ------------------------------------------------------------------

    fn listen(
        &mut self,
        reactor: &mut Reactor,
        local: Option<(&str, u16)>,
        proto: Proto,
        opts: &[SockOption],
    ) -> Result<ConnId> {
        let default_host = self.options.default_local_host.clone();
        let (host, port) = match local {
            Some((h, p)) => (h.to_string(), p),
            None => (
                default_host.unwrap_or_else(|| "0.0.0.0".to_string()),
                self.options.default_local_port.unwrap_or(0),
            ),
        };
        let addr = resolve(&host, port)?[0];
        let fd = self.create_socket(proto, &addr)?;
        let mut tls_params = crate::pool::TlsParams::default();

        let setup = (|| -> Result<()> {
            self.apply_options(fd, proto, opts, true, &mut tls_params)?;
            with_socket(fd, |s| s.bind(&addr.into()))?;
            match proto {
                Proto::Tcp | Proto::Tls | Proto::Sctp | Proto::DtlsSctp => {
                    let backlog = self.options.backlog.unwrap_or(libc::SOMAXCONN);
                    with_socket(fd, |s| s.listen(backlog))?;
                }
                Proto::Udp | Proto::DtlsUdp => {}
                Proto::Unix => unreachable!("rejected by create_socket"),
            }
            self.apply_options(fd, proto, opts, false, &mut tls_params)?;
            Ok(())
        })();
        if let Err(e) = setup {
            close_fd(fd);
            return Err(e);
        }

        let kind = match proto {
            Proto::Tcp | Proto::Tls => SockKind::TcpListen,
            Proto::Sctp | Proto::DtlsSctp => SockKind::SctpListen,
            Proto::Udp | Proto::DtlsUdp => SockKind::Udp,
            Proto::Unix => unreachable!(),
        };
        let tls_role = if proto.secured() { TlsRole::Server } else { TlsRole::None };
        let conn = self.pool.alloc(kind, fd, tls_role, None);
        {
            let desc = self.pool.lookup_mut(conn)?;
            desc.proto = proto;
            desc.local = local_addr_of(fd);
            desc.tls_params = tls_params;
        }

        // A DTLS server socket starts its cookie exchange on first data.
        if proto == Proto::DtlsUdp {
            match self.new_dtls_server_session(conn) {
                Ok(session) => {
                    let desc = self.pool.lookup_mut(conn)?;
                    desc.tls = Some(session);
                    desc.state = ConnState::Handshaking;
                }
                Err(e) => {
                    let _ = self.teardown(reactor, conn);
                    return Err(e);
                }
            }
        }

        self.register_read(reactor, fd, conn)?;
        log::debug!(
            "[MUX] conn {}: listening on {:?} ({:?})",
            conn,
            self.pool.lookup(conn)?.local,
            proto
        );
        Ok(conn)
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn connect(
        &mut self,
        reactor: &mut Reactor,
        remote: (&str, u16),
        local: Option<(&str, u16)>,
        existing: Option<ConnId>,
        proto: Proto,
        opts: &[SockOption],
    ) -> Result<ConnectOutcome> {
        let remote_addrs = resolve(remote.0, remote.1)?;
        let remote_addr = remote_addrs[0];

        // UDP may re-target an existing socket instead of creating one.
        if let Some(conn) = existing {
            let desc = self.pool.lookup_mut(conn)?;
            if desc.kind != SockKind::Udp {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "an existing connection can only be reused for UDP",
                ));
            }
            let fd = desc.fd;
            with_socket(fd, |s| s.connect(&remote_addr.into()))?;
            let desc = self.pool.lookup_mut(conn)?;
            desc.remote = Some(remote_addr);
            desc.local = local_addr_of(fd);
            return Ok(ConnectOutcome::Established(conn));
        }

        let fd = self.create_socket(proto, &remote_addr)?;
        let mut tls_params = crate::pool::TlsParams::default();
        let setup = (|| -> Result<()> {
            self.apply_options(fd, proto, opts, true, &mut tls_params)?;
            if let Some((host, port)) = local {
                let local_addr = resolve(host, port)?[0];
                with_socket(fd, |s| s.bind(&local_addr.into()))?;
            }
            self.apply_options(fd, proto, opts, false, &mut tls_params)?;
            Ok(())
        })();
        if let Err(e) = setup {
            close_fd(fd);
            return Err(e);
        }

        let multi_homed = matches!(proto, Proto::Sctp | Proto::DtlsSctp) && remote_addrs.len() > 1;
        let connect_result = if multi_homed && self.options.sctp_connection_method != 1 {
            sctp::connectx(fd, &remote_addrs).map_err(io_from_result)
        } else {
            with_socket(fd, |s| s.connect(&remote_addr.into())).map_err(io_from_result)
        };

        let in_progress = match connect_result {
            Ok(()) => false,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(e) => {
                close_fd(fd);
                return Err(Error::with_errno(
                    ErrorKind::Socket,
                    format!("connect to {} failed", remote_addr),
                    e.raw_os_error().unwrap_or(0),
                ));
            }
        };

        let kind = match proto {
            Proto::Tcp | Proto::Tls | Proto::Unix => SockKind::Tcp,
            Proto::Udp | Proto::DtlsUdp => SockKind::Udp,
            Proto::Sctp | Proto::DtlsSctp => SockKind::Sctp,
        };
        let tls_role = if proto.secured() { TlsRole::Client } else { TlsRole::None };
        let conn = self.pool.alloc(kind, fd, tls_role, None);
        {
            let desc = self.pool.lookup_mut(conn)?;
            desc.proto = proto;
            desc.remote = Some(remote_addr);
            desc.local = local_addr_of(fd);
            desc.tls_params = tls_params;
            desc.remote_addrs = remote_addrs;
        }

        if !in_progress {
            self.register_read(reactor, fd, conn)?;
            self.connection_established(reactor, conn)?;
            return Ok(ConnectOutcome::Established(conn));
        }

        // EINPROGRESS: watch for writability; a later writable event probes
        // SO_ERROR to tell success from asynchronous failure.
        self.pool.lookup_mut(conn)?.state = ConnState::Connecting;
        reactor.add_fd(fd, self.handler_id, FD_EVENT_WR)?;
        self.fd_map.insert(fd, conn);

        if self.options.pure_non_blocking {
            log::debug!("[MUX] conn {}: connect in progress towards {}", conn, remote_addr);
            return Ok(ConnectOutcome::Pending(conn));
        }

        // Blocking mode: probe the socket directly, bounded by the
        // configured poll budget.
        let attempts = self.options.max_num_of_poll.max(1);
        for _ in 0..attempts {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, self.options.poll_timeout) };
            if rc < 0 {
                let e = std::io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                let _ = self.teardown(reactor, conn);
                return Err(Error::from(e));
            }
            if rc > 0 && pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
                return match self.finalize_connect(reactor, conn)? {
                    Some(conn) => Ok(ConnectOutcome::Established(conn)),
                    None => Err(Error::new(
                        ErrorKind::Socket,
                        format!("connect to {} failed asynchronously", remote_addr),
                    )),
                };
            }
        }
        Ok(ConnectOutcome::Pending(conn))
    }

    /// Probe SO_ERROR on a completing connect. Returns the connection id on
    /// success; on failure the slot is gone and a Result event reports it.
    fn finalize_connect(&mut self, reactor: &mut Reactor, conn: ConnId) -> Result<Option<ConnId>> {
        let fd = self.pool.lookup(conn)?.fd;
        if let Some(os_err) = take_socket_error(fd) {
            let errno = os_err.raw_os_error().unwrap_or(0);
            log::debug!("[MUX] conn {}: connect failed: {}", conn, os_err);
            let _ = reactor.remove_fd(fd, self.handler_id, FD_EVENT_RD | FD_EVENT_WR);
            self.fd_map.remove(&fd);
            close_fd(fd);
            let _ = self.pool.free(conn);
            self.emit(PortEvent::Result(OpResult {
                kind: ErrorKind::Socket,
                conn: None,
                os_errno: Some(errno),
                os_text: Some(std::io::Error::from_raw_os_error(errno).to_string()),
            }));
            return Ok(None);
        }
        let _ = reactor.remove_fd(fd, self.handler_id, FD_EVENT_WR);
        reactor.add_fd(fd, self.handler_id, FD_EVENT_RD)?;
        self.connection_established(reactor, conn)?;
        self.emit(PortEvent::Result(OpResult::available(conn)));
        Ok(Some(conn))
    }

    /// Common tail of a successful connect: address bookkeeping and the
    /// client-side security handshake.
    fn connection_established(&mut self, reactor: &mut Reactor, conn: ConnId) -> Result<()> {
        let (fd, proto) = {
            let desc = self.pool.lookup_mut(conn)?;
            desc.state = ConnState::Normal;
            desc.local = local_addr_of(desc.fd);
            (desc.fd, desc.proto)
        };
        log::debug!("[MUX] conn {}: established ({:?})", conn, proto);
        match proto {
            Proto::Tls => self.begin_stream_handshake(reactor, conn, false)?,
            Proto::DtlsUdp | Proto::DtlsSctp => self.begin_datagram_handshake(reactor, conn, false)?,
            _ => {}
        }
        let _ = fd;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    fn send(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        bytes: &[u8],
        hint: Option<SendHint>,
    ) -> Result<SendStatus> {
        let (fd, kind, state, has_tls) = {
            let desc = self.pool.lookup(conn)?;
            (desc.fd, desc.kind, desc.state, desc.tls.is_some())
        };
        if state == ConnState::Connecting {
            return Err(Error::new(
                ErrorKind::TemporarilyUnavailable,
                format!("connection {} is still connecting", conn),
            ));
        }
        if kind.is_listener() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("connection {} is a listener", conn),
            ));
        }
        if has_tls {
            return self.send_tls(reactor, conn, bytes);
        }
        match kind {
            SockKind::Udp => self.send_datagram(reactor, conn, bytes, None),
            SockKind::Sctp => self.send_sctp(reactor, conn, bytes, hint.unwrap_or_default()),
            _ => self.send_stream(reactor, conn, fd, bytes),
        }
    }

    fn send_to(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        remote: (&str, u16),
        bytes: &[u8],
        _hint: Option<SendHint>,
    ) -> Result<SendStatus> {
        let kind = self.pool.lookup(conn)?.kind;
        if kind != SockKind::Udp {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "send_to requires an unconnected datagram socket",
            ));
        }
        let target = resolve(remote.0, remote.1)?[0];
        self.send_datagram(reactor, conn, bytes, Some(target))
    }

    fn send_tls(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        bytes: &[u8],
    ) -> Result<SendStatus> {
        let desc = self.pool.lookup_mut(conn)?;
        let fd = desc.fd;
        let session = desc.tls.as_mut().ok_or_else(|| no_tls(conn))?;
        if session.is_handshaking() {
            return Err(Error::new(
                ErrorKind::TemporarilyUnavailable,
                format!("connection {}: TLS handshake still in progress", conn),
            ));
        }
        let n = session.write_plain(fd, bytes)?;
        let blocked = session.wants_write();
        if blocked {
            reactor.add_fd(fd, self.handler_id, FD_EVENT_WR)?;
        }
        Ok(SendStatus::Complete(n))
    }

    fn send_datagram(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        bytes: &[u8],
        target: Option<SocketAddr>,
    ) -> Result<SendStatus> {
        let fd = self.pool.lookup(conn)?.fd;
        loop {
            let rc = match target {
                Some(addr) => {
                    let (raw, len) = sockaddr_raw(&addr);
                    unsafe {
                        libc::sendto(fd, bytes.as_ptr().cast(), bytes.len(), 0, raw.as_ptr().cast(), len)
                    }
                }
                None => unsafe { libc::send(fd, bytes.as_ptr().cast(), bytes.len(), 0) },
            };
            if rc >= 0 {
                return Ok(SendStatus::Complete(rc as usize));
            }
            let e = std::io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    if self.options.pure_non_blocking {
                        return Ok(SendStatus::Blocked { sent: 0 });
                    }
                    reactor.block_for_writable(fd)?;
                }
                _ => {
                    return Err(Error::with_errno(
                        ErrorKind::Socket,
                        format!("datagram send on connection {} failed", conn),
                        e.raw_os_error().unwrap_or(0),
                    ))
                }
            }
        }
    }

    fn send_sctp(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        bytes: &[u8],
        hint: SendHint,
    ) -> Result<SendStatus> {
        let fd = self.pool.lookup(conn)?.fd;
        loop {
            match sctp::send_with_info(fd, bytes, hint.stream, hint.ppid) {
                Ok(n) => return Ok(SendStatus::Complete(n)),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {
                        if self.options.pure_non_blocking {
                            return Ok(SendStatus::Blocked { sent: 0 });
                        }
                        reactor.block_for_writable(fd)?;
                    }
                    Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                        return self.send_broken_pipe(reactor, conn, &e)
                    }
                    _ => {
                        return Err(Error::with_errno(
                            ErrorKind::Socket,
                            format!("SCTP send on connection {} failed", conn),
                            e.raw_os_error().unwrap_or(0),
                        ))
                    }
                },
            }
        }
    }

    fn send_stream(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        fd: RawFd,
        bytes: &[u8],
    ) -> Result<SendStatus> {
        let mut sent = 0usize;
        while sent < bytes.len() {
            let rc = unsafe {
                libc::send(
                    fd,
                    bytes[sent..].as_ptr().cast(),
                    bytes.len() - sent,
                    0,
                )
            };
            if rc > 0 {
                sent += rc as usize;
                continue;
            }
            let e = std::io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    if self.options.pure_non_blocking {
                        return Ok(SendStatus::Blocked { sent });
                    }
                    // Partial write: park until the socket drains, resume.
                    reactor.block_for_writable(fd)?;
                }
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                    return self.send_broken_pipe(reactor, conn, &e);
                }
                _ => {
                    return Err(Error::with_errno(
                        ErrorKind::Socket,
                        format!("send on connection {} failed", conn),
                        e.raw_os_error().unwrap_or(0),
                    ))
                }
            }
        }
        Ok(SendStatus::Complete(sent))
    }

    /// EPIPE on send: the peer is gone. Flush the receive side through the
    /// framing path, report the close, release the slot.
    fn send_broken_pipe(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        e: &std::io::Error,
    ) -> Result<SendStatus> {
        let errno = e.raw_os_error().unwrap_or(0);
        log::debug!("[MUX] conn {}: send failed, peer closed ({})", conn, e);
        self.close_path(reactor, conn);
        Err(Error::with_errno(
            ErrorKind::Socket,
            format!("connection {} was closed by the peer during send", conn),
            errno,
        ))
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    fn close(&mut self, reactor: &mut Reactor, conn: ConnId) -> Result<()> {
        if !self.pool.is_valid(conn) {
            return Err(Error::new(
                ErrorKind::InvalidConnection,
                format!("closing invalid connection id {}", conn),
            ));
        }
        let kind = self.pool.lookup(conn)?.kind;
        if kind.is_listener() {
            // Accepted children keep running, orphaned.
            for id in self.pool.live_ids() {
                if let Ok(desc) = self.pool.lookup_mut(id) {
                    if desc.parent == Some(conn) {
                        desc.parent = None;
                    }
                }
            }
            let _ = self.teardown(reactor, conn)?;
            return Ok(());
        }

        {
            let desc = self.pool.lookup_mut(conn)?;
            let fd = desc.fd;
            if let Some(session) = desc.tls.as_mut() {
                session.begin_shutdown(fd);
            }
        }
        let had_data = self.drain_inbound(conn)?;
        let desc = self.teardown(reactor, conn)?;
        if had_data {
            self.emit(PortEvent::ConnectionClosed {
                conn,
                local: desc.local,
                remote: desc.remote,
                proto: desc.proto,
                user_tag: desc.user_tag,
            });
        }
        Ok(())
    }

    /// Peer-initiated teardown (EOF, COMM_LOST, fatal read error): drain,
    /// always report ConnectionClosed, release.
    fn close_path(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let _ = self.drain_inbound(conn);
        match self.teardown(reactor, conn) {
            Ok(desc) => self.emit(PortEvent::ConnectionClosed {
                conn,
                local: desc.local,
                remote: desc.remote,
                proto: desc.proto,
                user_tag: desc.user_tag,
            }),
            Err(e) => log::warn!("[MUX] conn {}: teardown failed: {}", conn, e),
        }
    }

    /// Run the close-time framing over whatever is buffered; emit a Receive
    /// per extracted frame. True when any data remained.
    fn drain_inbound(&mut self, conn: ConnId) -> Result<bool> {
        let mut any = false;
        loop {
            let (payload, meta) = {
                let desc = self.pool.lookup_mut(conn)?;
                let (framer, args) = match desc.close_framer.as_ref() {
                    Some((f, a)) => (*f, a.clone()),
                    None => (desc.framer, desc.framer_args.clone()),
                };
                let strip = desc.header_strip;
                let Some(buffer) = desc.buffer.as_mut() else { break };
                let avail_len = buffer.len();
                if avail_len == 0 {
                    break;
                }
                any = true;
                let verdict = framer(buffer.as_slice(), &args);
                if verdict <= 0 || (verdict as usize) > avail_len {
                    // Undecidable or incomplete remainder: it counted as
                    // data, but no full frame can be extracted from it.
                    break;
                }
                let take = verdict as usize;
                let payload = buffer.as_slice()[strip.min(take)..take].to_vec();
                buffer.consume(take);
                (
                    payload,
                    (desc.local, desc.remote, desc.proto, desc.user_tag),
                )
            };
            let (local, remote, proto, user_tag) = meta;
            self.emit(PortEvent::Receive {
                conn,
                local,
                remote,
                proto,
                payload,
                user_tag,
            });
        }
        Ok(any)
    }

    // ------------------------------------------------------------------
    // TLS entry points
    // ------------------------------------------------------------------

    fn start_tls(&mut self, reactor: &mut Reactor, conn: ConnId, server_side: bool) -> Result<()> {
        let kind = self.pool.lookup(conn)?.kind;
        if self.pool.lookup(conn)?.tls.is_some() {
            return Err(Error::new(
                ErrorKind::General,
                format!("connection {} already has a TLS session", conn),
            ));
        }
        match kind {
            SockKind::Tcp => self.begin_stream_handshake(reactor, conn, server_side),
            SockKind::Udp | SockKind::Sctp => {
                self.begin_datagram_handshake(reactor, conn, server_side)
            }
            SockKind::TcpListen | SockKind::SctpListen => {
                // Arm the listener: accepted connections inherit the role.
                let desc = self.pool.lookup_mut(conn)?;
                desc.tls_role = if server_side { TlsRole::Server } else { TlsRole::Client };
                desc.proto = match desc.kind {
                    SockKind::SctpListen => Proto::DtlsSctp,
                    _ => Proto::Tls,
                };
                Ok(())
            }
        }
    }

    fn begin_stream_handshake(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        server_side: bool,
    ) -> Result<()> {
        let session = {
            let desc = self.pool.lookup(conn)?;
            // Per-connection certificate material only applies when the
            // process allows the override.
            let params = if self.options.tls_cert_per_conn {
                desc.tls_params.clone()
            } else {
                let mut stripped = desc.tls_params.clone();
                stripped.key_file = None;
                stripped.cert_file = None;
                stripped.ca_list_file = None;
                stripped.cipher_list = None;
                stripped.password = None;
                stripped
            };
            if server_side {
                tls::server_session(&self.options.ssl_certs, &params)?
            } else {
                let peer = desc
                    .remote
                    .map(|a| a.ip().to_string())
                    .unwrap_or_else(|| "localhost".to_string());
                tls::client_session(
                    &self.options.ssl_certs,
                    &params,
                    self.options.ssl_verify_certificate,
                    self.options.ssl_use_session_resumption,
                    &peer,
                )?
            }
        };
        let fd = {
            let desc = self.pool.lookup_mut(conn)?;
            desc.tls = Some(session);
            desc.tls_role = if server_side { TlsRole::Server } else { TlsRole::Client };
            desc.proto = Proto::Tls;
            desc.state = ConnState::Handshaking;
            desc.fd
        };
        self.pump_tls_write(reactor, conn, fd)
    }

    fn begin_datagram_handshake(
        &mut self,
        reactor: &mut Reactor,
        conn: ConnId,
        server_side: bool,
    ) -> Result<()> {
        let mut provider = self.dtls.take().ok_or_else(|| {
            Error::new(
                ErrorKind::UnsupportedProtocol,
                "datagram TLS requires an installed DTLS provider",
            )
        })?;
        let result = (|| -> Result<()> {
            let params = self.pool.lookup(conn)?.tls_params.clone();
            let session = if server_side {
                provider.server_session(&params)?
            } else {
                provider.client_session(&params)?
            };
            let desc = self.pool.lookup_mut(conn)?;
            desc.tls = Some(TlsSession::Datagram(session));
            desc.tls_role = if server_side { TlsRole::Server } else { TlsRole::Client };
            desc.proto = match desc.kind {
                SockKind::Sctp | SockKind::SctpListen => Proto::DtlsSctp,
                _ => Proto::DtlsUdp,
            };
            desc.state = ConnState::Handshaking;
            Ok(())
        })();
        self.dtls = Some(provider);
        result?;
        if !server_side {
            self.drive_datagram_handshake(reactor, conn);
        }
        Ok(())
    }

    fn stop_tls(&mut self, _reactor: &mut Reactor, conn: ConnId) -> Result<()> {
        let desc = self.pool.lookup_mut(conn)?;
        let fd = desc.fd;
        match desc.tls.take() {
            Some(mut session) => {
                session.begin_shutdown(fd);
                desc.tls_role = TlsRole::None;
                desc.state = ConnState::Normal;
                desc.proto = match desc.kind {
                    SockKind::Udp => Proto::Udp,
                    SockKind::Sctp | SockKind::SctpListen => Proto::Sctp,
                    _ => Proto::Tcp,
                };
                Ok(())
            }
            None => Err(no_tls(conn)),
        }
    }

    // ------------------------------------------------------------------
    // Adoption
    // ------------------------------------------------------------------

    fn adopt_stream(
        &mut self,
        reactor: &mut Reactor,
        fd: RawFd,
        proto: Proto,
        framer: framing::FramerFn,
        args: Vec<i64>,
    ) -> Result<ConnId> {
        set_cloexec(fd)?;
        set_nonblocking(fd)?;
        let conn = self.pool.alloc(SockKind::Tcp, fd, TlsRole::None, None);
        {
            let desc = self.pool.lookup_mut(conn)?;
            desc.proto = proto;
            desc.framer = framer;
            desc.framer_args = args;
            desc.local = local_addr_of(fd);
            desc.remote = peer_addr_of(fd);
        }
        self.register_read(reactor, fd, conn)?;
        Ok(conn)
    }

    // ------------------------------------------------------------------
    // Event-handler paths
    // ------------------------------------------------------------------

    fn handle_error_event(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let Ok(desc) = self.pool.lookup(conn) else { return };
        let (fd, state) = (desc.fd, desc.state);
        if state == ConnState::Connecting {
            let _ = self.finalize_connect(reactor, conn);
            return;
        }
        if let Some(e) = take_socket_error(fd) {
            let errno = e.raw_os_error().unwrap_or(0);
            log::warn!("[MUX] conn {}: socket error: {}", conn, e);
            self.emit(PortEvent::Result(OpResult {
                kind: ErrorKind::Socket,
                conn: Some(conn),
                os_errno: Some(errno),
                os_text: Some(e.to_string()),
            }));
            self.close_path(reactor, conn);
        }
    }

    fn handle_writable(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let Ok(desc) = self.pool.lookup(conn) else { return };
        let (fd, state, has_tls) = (desc.fd, desc.state, desc.tls.is_some());
        if state == ConnState::Connecting {
            let _ = self.finalize_connect(reactor, conn);
            return;
        }
        if has_tls {
            let _ = self.pump_tls_write(reactor, conn, fd);
            // Drop write interest once the session has nothing pending.
            if let Ok(desc) = self.pool.lookup(conn) {
                if desc.tls.as_ref().map_or(true, |s| !s.wants_write()) {
                    let _ = reactor.remove_fd(fd, self.handler_id, FD_EVENT_WR);
                }
            }
        } else {
            let _ = reactor.remove_fd(fd, self.handler_id, FD_EVENT_WR);
        }
    }

    fn handle_readable(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let Ok(desc) = self.pool.lookup(conn) else { return };
        match desc.kind {
            SockKind::TcpListen | SockKind::SctpListen => self.handle_accept(reactor, conn),
            SockKind::Udp => self.handle_datagram_readable(reactor, conn),
            SockKind::Sctp => self.handle_sctp_readable(reactor, conn),
            SockKind::Tcp => self.handle_stream_readable(reactor, conn),
        }
    }

    fn handle_accept(&mut self, reactor: &mut Reactor, listener: ConnId) {
        loop {
            let (lfd, lkind) = match self.pool.lookup(listener) {
                Ok(d) => (d.fd, d.kind),
                Err(_) => return,
            };
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept(
                    lfd,
                    (&mut addr as *mut libc::sockaddr_storage).cast(),
                    &mut addr_len,
                )
            };
            if fd < 0 {
                let e = std::io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                    _ => {
                        log::warn!("[MUX] conn {}: accept failed: {}", listener, e);
                        return;
                    }
                }
            }
            if set_cloexec(fd).is_err() || set_nonblocking(fd).is_err() {
                close_fd(fd);
                continue;
            }

            // The child inherits framing, tag and security setup.
            let (kind, proto, tls_role, framer, args, close_framer, strip, user_tag, params) = {
                let l = match self.pool.lookup(listener) {
                    Ok(d) => d,
                    Err(_) => {
                        close_fd(fd);
                        return;
                    }
                };
                (
                    if lkind == SockKind::SctpListen { SockKind::Sctp } else { SockKind::Tcp },
                    l.proto,
                    l.tls_role,
                    l.framer,
                    l.framer_args.clone(),
                    l.close_framer.clone(),
                    l.header_strip,
                    l.user_tag,
                    l.tls_params.clone(),
                )
            };
            let conn = self.pool.alloc(kind, fd, tls_role, Some(listener));
            {
                let desc = match self.pool.lookup_mut(conn) {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                desc.proto = proto;
                desc.framer = framer;
                desc.framer_args = args;
                desc.close_framer = close_framer;
                desc.header_strip = strip;
                desc.user_tag = user_tag;
                desc.tls_params = params;
                desc.local = local_addr_of(fd);
                desc.remote = peer_addr_of(fd);
            }
            if self.register_read(reactor, fd, conn).is_err() {
                let _ = self.teardown(reactor, conn);
                continue;
            }

            let (local, remote) = {
                let d = self.pool.lookup(conn).expect("just allocated");
                (d.local, d.remote)
            };
            log::debug!("[MUX] conn {}: accepted from {:?} (parent {})", conn, remote, listener);
            self.emit(PortEvent::ConnectionOpened {
                conn,
                local,
                remote,
                proto,
            });

            // Server-side security starts handshaking immediately.
            if tls_role == TlsRole::Server {
                let started = match proto {
                    Proto::Tls => self.begin_stream_handshake(reactor, conn, true),
                    Proto::DtlsSctp => self.begin_datagram_handshake(reactor, conn, true),
                    _ => Ok(()),
                };
                if let Err(e) = started {
                    log::warn!("[MUX] conn {}: security setup failed: {}", conn, e);
                    self.emit_result_error(&e, Some(conn));
                    self.close_path(reactor, conn);
                }
            }
        }
    }

    fn handle_datagram_readable(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let (has_tls, state, tls_role, is_unconnected) = {
            let Ok(desc) = self.pool.lookup(conn) else { return };
            (desc.tls.is_some(), desc.state, desc.tls_role, desc.remote.is_none())
        };
        if has_tls {
            if state == ConnState::Handshaking {
                if tls_role == TlsRole::Server && is_unconnected {
                    self.dtls_cookie_flow(reactor, conn);
                } else {
                    self.drive_datagram_handshake(reactor, conn);
                }
            } else {
                self.read_datagram_tls(reactor, conn);
            }
            return;
        }

        // Plain datagrams: one Receive per datagram, sender populated.
        let mut chunk = vec![0u8; RECV_CHUNK];
        loop {
            let Ok(desc) = self.pool.lookup(conn) else { return };
            let fd = desc.fd;
            let (local, proto, user_tag) = (desc.local, desc.proto, desc.user_tag);
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    chunk.as_mut_ptr().cast(),
                    chunk.len(),
                    0,
                    (&mut addr as *mut libc::sockaddr_storage).cast(),
                    &mut addr_len,
                )
            };
            if n < 0 {
                let e = std::io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EAGAIN) => return,
                    Some(libc::EINTR) => continue,
                    _ => {
                        log::warn!("[MUX] conn {}: recvfrom failed: {}", conn, e);
                        self.emit_result_error(&Error::from(e), Some(conn));
                        return;
                    }
                }
            }
            let remote = sockaddr_to_std(&addr);
            self.emit(PortEvent::Receive {
                conn,
                local,
                remote,
                proto,
                payload: chunk[..n as usize].to_vec(),
                user_tag,
            });
        }
    }

    fn handle_stream_readable(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let Ok(desc) = self.pool.lookup(conn) else { return };
        let fd = desc.fd;
        if desc.tls.is_some() {
            self.read_stream_tls(reactor, conn, fd);
            return;
        }
        let mut chunk = vec![0u8; RECV_CHUNK];
        let n = unsafe { libc::recv(fd, chunk.as_mut_ptr().cast(), chunk.len(), 0) };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                _ => {
                    log::debug!("[MUX] conn {}: read failed: {}", conn, e);
                    self.emit_result_error(&Error::from(e), Some(conn));
                    self.close_path(reactor, conn);
                    return;
                }
            }
        }
        if n == 0 {
            // End of stream: flush what is decodable, then close.
            self.close_path(reactor, conn);
            return;
        }
        if let Ok(desc) = self.pool.lookup_mut(conn) {
            desc.buffer_mut().append_bytes(&chunk[..n as usize]);
        }
        self.extract_frames(reactor, conn);
    }

    fn handle_sctp_readable(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let Ok(desc) = self.pool.lookup(conn) else { return };
        let fd = desc.fd;
        let dtls_active = matches!(desc.tls, Some(TlsSession::Datagram(_)));
        let mut chunk = vec![0u8; RECV_CHUNK];

        // With DTLS layered on top, peek first so the security engine can
        // re-read the same bytes; notifications are consumed out-of-band.
        let (n, is_notification, _info) = match sctp::recv_message(fd, &mut chunk, dtls_active) {
            Ok(v) => v,
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                _ => {
                    log::debug!("[MUX] conn {}: SCTP receive failed: {}", conn, e);
                    self.emit_result_error(&Error::from(e), Some(conn));
                    self.close_path(reactor, conn);
                    return;
                }
            },
        };

        if is_notification {
            if dtls_active {
                // Drop the peeked copy before decoding.
                let _ = sctp::recv_message(fd, &mut chunk, false);
            }
            if let Some(kind) = sctp::parse_notification(&chunk[..n]) {
                let down = sctp::assoc_is_down(&kind);
                self.emit(PortEvent::Sctp { conn, kind });
                if down {
                    if self.try_next_sctp_address(reactor, conn) {
                        return;
                    }
                    self.close_path(reactor, conn);
                }
            }
            return;
        }

        if n == 0 {
            self.close_path(reactor, conn);
            return;
        }

        if dtls_active {
            if self.pool.lookup(conn).map(|d| d.state).ok() == Some(ConnState::Handshaking) {
                self.drive_datagram_handshake(reactor, conn);
            } else {
                self.read_datagram_tls(reactor, conn);
            }
            return;
        }

        if let Ok(desc) = self.pool.lookup_mut(conn) {
            desc.buffer_mut().append_bytes(&chunk[..n as usize]);
        }
        self.extract_frames(reactor, conn);
    }

    /// Sequential multi-homing (connection method 1): on a failed
    /// association setup, retry the next remote address on a fresh socket.
    fn try_next_sctp_address(&mut self, reactor: &mut Reactor, conn: ConnId) -> bool {
        if self.options.sctp_connection_method == 0 {
            return false;
        }
        let Ok(desc) = self.pool.lookup(conn) else { return false };
        if desc.state != ConnState::Connecting || desc.remote_addr_ix + 1 >= desc.remote_addrs.len()
        {
            return false;
        }
        let next_ix = desc.remote_addr_ix + 1;
        let next_addr = desc.remote_addrs[next_ix];
        let old_fd = desc.fd;
        let proto = desc.proto;
        log::info!(
            "[MUX] conn {}: association lost, retrying remote address {}",
            conn,
            next_addr
        );
        let new_fd = match self.create_socket(proto, &next_addr) {
            Ok(fd) => fd,
            Err(_) => return false,
        };
        let _ = sctp::set_init_msg(
            new_fd,
            self.options.sinit_num_ostreams,
            self.options.sinit_max_instreams,
            self.options.sinit_max_attempts,
            self.options.sinit_max_init_timeo,
        );
        let _ = sctp::set_event_subscriptions(new_fd, &self.options.sctp_events);
        // EINPROGRESS is the expected outcome on the nonblocking socket.
        let _ = with_socket(new_fd, |s| s.connect(&next_addr.into()));
        let _ = reactor.remove_fd(old_fd, self.handler_id, FD_EVENT_RD | FD_EVENT_WR);
        self.fd_map.remove(&old_fd);
        close_fd(old_fd);
        if reactor.add_fd(new_fd, self.handler_id, FD_EVENT_WR).is_err() {
            close_fd(new_fd);
            return false;
        }
        self.fd_map.insert(new_fd, conn);
        if let Ok(desc) = self.pool.lookup_mut(conn) {
            desc.fd = new_fd;
            desc.remote_addr_ix = next_ix;
            desc.remote = Some(next_addr);
            desc.state = ConnState::Connecting;
        }
        true
    }

    // ------------------------------------------------------------------
    // TLS data paths
    // ------------------------------------------------------------------

    fn pump_tls_write(&mut self, reactor: &mut Reactor, conn: ConnId, fd: RawFd) -> Result<()> {
        let (blocked, completed) = {
            let desc = self.pool.lookup_mut(conn)?;
            let Some(session) = desc.tls.as_mut() else { return Ok(()) };
            let was_handshaking = session.is_handshaking();
            let blocked = session.pump_write(fd)?;
            let completed = was_handshaking && !session.is_handshaking();
            (blocked, completed)
        };
        if blocked {
            reactor.add_fd(fd, self.handler_id, FD_EVENT_WR)?;
        }
        if completed {
            self.tls_handshake_complete(conn);
        }
        Ok(())
    }

    fn tls_handshake_complete(&mut self, conn: ConnId) {
        if let Ok(desc) = self.pool.lookup_mut(conn) {
            desc.state = ConnState::Normal;
        }
        log::debug!("[MUX] conn {}: TLS handshake complete", conn);
        self.emit(PortEvent::Result(OpResult::available(conn)));
    }

    fn read_stream_tls(&mut self, reactor: &mut Reactor, conn: ConnId, fd: RawFd) {
        let pumped = {
            let Ok(desc) = self.pool.lookup_mut(conn) else { return };
            let Some(session) = desc.tls.as_mut() else { return };
            let was_handshaking = session.is_handshaking();
            match session.pump_read(fd) {
                Ok((plaintext, closed)) => {
                    let completed = was_handshaking && !session.is_handshaking();
                    let wants_write = session.wants_write();
                    if !plaintext.is_empty() {
                        desc.buffer_mut().append_bytes(&plaintext);
                    }
                    Ok((closed, completed, wants_write))
                }
                Err(e) => Err(e),
            }
        };
        match pumped {
            Ok((closed, completed, wants_write)) => {
                if completed {
                    self.tls_handshake_complete(conn);
                }
                if wants_write {
                    let _ = self.pump_tls_write(reactor, conn, fd);
                }
                self.extract_frames(reactor, conn);
                if closed && self.pool.is_valid(conn) {
                    self.close_path(reactor, conn);
                }
            }
            Err(e) => {
                log::warn!("[MUX] conn {}: TLS failure: {}", conn, e);
                self.emit_result_error(&e, Some(conn));
                self.close_path(reactor, conn);
            }
        }
    }

    fn read_datagram_tls(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let result = {
            let Ok(desc) = self.pool.lookup_mut(conn) else { return };
            let fd = desc.fd;
            let Some(session) = desc.tls.as_mut() else { return };
            match session.pump_read(fd) {
                Ok((plaintext, closed)) => {
                    Ok((plaintext, closed, desc.local, desc.remote, desc.proto, desc.user_tag))
                }
                Err(e) => Err(e),
            }
        };
        match result {
            Ok((plaintext, closed, local, remote, proto, user_tag)) => {
                if !plaintext.is_empty() {
                    self.emit(PortEvent::Receive {
                        conn,
                        local,
                        remote,
                        proto,
                        payload: plaintext,
                        user_tag,
                    });
                }
                if closed {
                    self.close_path(reactor, conn);
                }
            }
            Err(e) => {
                self.emit_result_error(&e, Some(conn));
                self.close_path(reactor, conn);
            }
        }
    }

    fn drive_datagram_handshake(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let step = {
            let Ok(desc) = self.pool.lookup_mut(conn) else { return };
            let fd = desc.fd;
            match desc.tls.as_mut() {
                Some(TlsSession::Datagram(session)) => session.handshake_step(fd),
                _ => return,
            }
        };
        match step {
            DtlsHandshake::Done => self.tls_handshake_complete(conn),
            DtlsHandshake::WantRead | DtlsHandshake::WantWrite => {}
            DtlsHandshake::Failed(reason) => {
                log::warn!("[MUX] conn {}: DTLS handshake failed: {}", conn, reason);
                let e = Error::new(ErrorKind::Socket, reason);
                self.emit_result_error(&e, Some(conn));
                self.close_path(reactor, conn);
            }
        }
    }

    /// DTLS server accept: run the cookie exchange on the listening socket;
    /// on a verified peer, move the session onto a cloned per-peer socket
    /// and restart the listener with a fresh one.
    fn dtls_cookie_flow(&mut self, reactor: &mut Reactor, conn: ConnId) {
        let Some(mut provider) = self.dtls.take() else {
            log::error!("[MUX] conn {}: DTLS data without a provider", conn);
            return;
        };
        let verdict = {
            match self.pool.lookup_mut(conn) {
                Ok(desc) => {
                    let fd = desc.fd;
                    match desc.tls.as_mut() {
                        Some(TlsSession::Datagram(session)) => {
                            provider.cookie_listen(&mut **session, fd)
                        }
                        _ => {
                            self.dtls = Some(provider);
                            return;
                        }
                    }
                }
                Err(_) => {
                    self.dtls = Some(provider);
                    return;
                }
            }
        };
        let outcome = match verdict {
            Ok(CookieListen::NeedMore) => None,
            Ok(CookieListen::Verified(peer)) => Some(peer),
            Err(e) => {
                log::warn!("[MUX] conn {}: cookie exchange failed: {}", conn, e);
                self.emit_result_error(&e, Some(conn));
                None
            }
        };

        if let Some(peer) = outcome {
            let result = self.accept_dtls_peer(reactor, conn, peer, &mut *provider);
            if let Err(e) = result {
                log::warn!("[MUX] conn {}: DTLS accept failed: {}", conn, e);
                self.emit_result_error(&e, Some(conn));
            }
        }
        self.dtls = Some(provider);
    }

    fn accept_dtls_peer(
        &mut self,
        reactor: &mut Reactor,
        listener: ConnId,
        peer: SocketAddr,
        provider: &mut dyn DtlsProvider,
    ) -> Result<()> {
        let (local, proto, params, framer, args, user_tag) = {
            let desc = self.pool.lookup(listener)?;
            (
                desc.local,
                desc.proto,
                desc.tls_params.clone(),
                desc.framer,
                desc.framer_args.clone(),
                desc.user_tag,
            )
        };
        let bind_addr = local.ok_or_else(|| {
            Error::new(ErrorKind::General, "DTLS listener has no local address")
        })?;

        // Per-peer socket: same local address, connected to the peer.
        let fd = self.create_socket(Proto::Udp, &bind_addr)?;
        let setup = (|| -> Result<()> {
            apply_socket_option(fd, Proto::Udp, &SockOption::ReuseAddress(true), true)?;
            with_socket(fd, |s| s.bind(&bind_addr.into()))?;
            with_socket(fd, |s| s.connect(&peer.into()))?;
            Ok(())
        })();
        if let Err(e) = setup {
            close_fd(fd);
            return Err(e);
        }

        let conn = self.pool.alloc(SockKind::Udp, fd, TlsRole::Server, Some(listener));
        // The verified session moves to the per-peer connection; the
        // listener restarts with a fresh one.
        let session = self.pool.lookup_mut(listener)?.tls.take();
        {
            let desc = self.pool.lookup_mut(conn)?;
            desc.proto = proto;
            desc.tls = session;
            desc.tls_params = params;
            desc.framer = framer;
            desc.framer_args = args;
            desc.user_tag = user_tag;
            desc.state = ConnState::Handshaking;
            desc.local = local_addr_of(fd);
            desc.remote = Some(peer);
        }
        let fresh = self.new_dtls_server_session_with(provider, listener)?;
        self.pool.lookup_mut(listener)?.tls = Some(fresh);
        self.register_read(reactor, fd, conn)?;

        self.emit(PortEvent::ConnectionOpened {
            conn,
            local: local_addr_of(fd),
            remote: Some(peer),
            proto,
        });
        self.drive_datagram_handshake(reactor, conn);
        Ok(())
    }

    fn new_dtls_server_session(&mut self, conn: ConnId) -> Result<TlsSession> {
        let mut provider = self.dtls.take().ok_or_else(|| {
            Error::new(
                ErrorKind::UnsupportedProtocol,
                "datagram TLS requires an installed DTLS provider",
            )
        })?;
        let result = self.new_dtls_server_session_with(&mut *provider, conn);
        self.dtls = Some(provider);
        result
    }

    fn new_dtls_server_session_with(
        &mut self,
        provider: &mut dyn DtlsProvider,
        conn: ConnId,
    ) -> Result<TlsSession> {
        let params = self.pool.lookup(conn)?.tls_params.clone();
        Ok(TlsSession::Datagram(provider.server_session(&params)?))
    }

    // ------------------------------------------------------------------
    // Frame extraction
    // ------------------------------------------------------------------

    fn extract_frames(&mut self, reactor: &mut Reactor, conn: ConnId) {
        enum Step {
            Frame(Vec<u8>, Option<SocketAddr>, Option<SocketAddr>, Proto, i64),
            NeedMore,
            Malformed,
        }
        loop {
            let step = {
                let Ok(desc) = self.pool.lookup_mut(conn) else { return };
                let framer = desc.framer;
                let args = desc.framer_args.clone();
                let pending = desc.pending_len;
                let Some(buffer) = desc.buffer.as_mut() else { return };
                let avail_len = buffer.len();
                if avail_len == 0 {
                    return;
                }
                let frame_len = match pending {
                    Some(len) => Some(len),
                    None => {
                        let verdict = framer(buffer.as_slice(), &args);
                        if verdict == -1 {
                            None
                        } else if verdict <= 0 {
                            // Framing failure: protocol error on this
                            // connection only.
                            desc.pending_len = None;
                            Some(usize::MAX)
                        } else {
                            Some(verdict as usize)
                        }
                    }
                };
                match frame_len {
                    None => Step::NeedMore,
                    Some(usize::MAX) => Step::Malformed,
                    Some(frame_len) if avail_len < frame_len => {
                        desc.pending_len = Some(frame_len);
                        Step::NeedMore
                    }
                    Some(frame_len) => {
                        let strip = desc.header_strip.min(frame_len);
                        let buffer = desc.buffer.as_mut().expect("buffer present");
                        let payload = buffer.as_slice()[strip..frame_len].to_vec();
                        buffer.consume(frame_len);
                        desc.pending_len = None;
                        Step::Frame(payload, desc.local, desc.remote, desc.proto, desc.user_tag)
                    }
                }
            };
            match step {
                Step::NeedMore => return,
                Step::Malformed => {
                    let e = Error::new(
                        ErrorKind::Protocol,
                        format!("framer rejected inbound data on connection {}", conn),
                    );
                    self.emit_result_error(&e, Some(conn));
                    self.close_path(reactor, conn);
                    return;
                }
                Step::Frame(payload, local, remote, proto, user_tag) => {
                    self.emit(PortEvent::Receive {
                        conn,
                        local,
                        remote,
                        proto,
                        payload,
                        user_tag,
                    });
                }
            }
        }
    }

    fn emit_result_error(&mut self, e: &Error, conn: Option<ConnId>) {
        self.emit(PortEvent::Result(OpResult::from_error(e, conn)));
    }
}

/// Fold a TLS-parameter option into a connection's parameter block.
fn absorb_tls_param(params: &mut crate::pool::TlsParams, opt: &SockOption) {
    match opt {
        SockOption::SslSupport(versions) => params.versions = Some(*versions),
        SockOption::CertOptions(certs) => {
            if certs.key_file.is_some() {
                params.key_file = certs.key_file.clone();
            }
            if certs.cert_file.is_some() {
                params.cert_file = certs.cert_file.clone();
            }
            if certs.ca_list_file.is_some() {
                params.ca_list_file = certs.ca_list_file.clone();
            }
            if certs.cipher_list.is_some() {
                params.cipher_list = certs.cipher_list.clone();
            }
            if certs.password.is_some() {
                params.password = certs.password.clone();
            }
        }
        SockOption::AlpnList(protocols) => params.alpn = protocols.clone(),
        SockOption::TlsHostname(host) => params.tls_hostname = Some(host.clone()),
        SockOption::DtlsSrtpProfiles(profiles) => {
            params.dtls_srtp_profiles = Some(profiles.clone())
        }
        _ => {}
    }
}

fn io_from_result(e: Error) -> std::io::Error {
    match e.os_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno),
        None => std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    }
}

/// Raw sockaddr bytes for `sendto`.
fn sockaddr_raw(addr: &SocketAddr) -> (Vec<u8>, libc::socklen_t) {
    let s2: socket2::SockAddr = (*addr).into();
    let bytes = unsafe {
        std::slice::from_raw_parts(s2.as_ptr().cast::<u8>(), s2.len() as usize).to_vec()
    };
    (bytes, s2.len())
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        x if x == libc::AF_INET => {
            let sa = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(sa.sin_port)))
        }
        x if x == libc::AF_INET6 => {
            let sa =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

impl EventHandler for MuxCore {
    fn handle_fd_event(
        &mut self,
        reactor: &mut Reactor,
        fd: RawFd,
        readable: bool,
        writable: bool,
        is_error: bool,
    ) {
        let Some(&conn) = self.fd_map.get(&fd) else {
            log::debug!("[MUX] event on unknown fd {}", fd);
            return;
        };
        if is_error {
            self.handle_error_event(reactor, conn);
        }
        if writable && self.pool.is_valid(conn) {
            self.handle_writable(reactor, conn);
        }
        if readable && self.pool.is_valid(conn) {
            self.handle_readable(reactor, conn);
        }
    }

    fn label(&self) -> &str {
        "transport mux"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerRegistry;

    fn setup() -> (Reactor, TimerRegistry, TransportMux) {
        let mut reactor = Reactor::new().unwrap();
        let timers = TimerRegistry::new();
        let mux = TransportMux::new(&mut reactor, Options::default());
        (reactor, timers, mux)
    }

    #[test]
    fn test_listen_assigns_ephemeral_port() {
        let (mut reactor, _timers, mux) = setup();
        let conn = mux
            .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Tcp, &[])
            .unwrap();
        let details = mux.connection_details(conn).unwrap();
        assert_eq!(details.kind, SockKind::TcpListen);
        let port = details.local.unwrap().port();
        assert_ne!(port, 0);
        mux.close(&mut reactor, conn).unwrap();
        assert!(mux.connection_details(conn).is_err());
    }

    #[test]
    fn test_user_tag_round_trip() {
        let (mut reactor, _timers, mux) = setup();
        let conn = mux
            .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Udp, &[])
            .unwrap();
        assert_eq!(mux.user_data(conn).unwrap(), 0);
        mux.set_user_data(conn, 77).unwrap();
        assert_eq!(mux.user_data(conn).unwrap(), 77);
    }

    #[test]
    fn test_send_on_invalid_connection() {
        let (mut reactor, _timers, mux) = setup();
        let err = mux.send(&mut reactor, 42, b"x", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConnection);
    }

    #[test]
    fn test_listen_address_in_use() {
        let (mut reactor, _timers, mux) = setup();
        let first = mux
            .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Tcp, &[])
            .unwrap();
        let port = mux.connection_details(first).unwrap().local.unwrap().port();
        // second listener on the same port must fail cleanly
        let err = mux
            .listen(
                &mut reactor,
                Some(("127.0.0.1", port)),
                Proto::Tcp,
                &[SockOption::ReuseAddress(false)],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInUse);
    }

    #[test]
    fn test_unknown_host_is_hostname_error() {
        let (mut reactor, _timers, mux) = setup();
        let err = mux
            .connect(
                &mut reactor,
                ("no-such-host.invalid.", 9),
                None,
                None,
                Proto::Tcp,
                &[],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Hostname);
    }

    #[test]
    fn test_start_tls_on_datagram_without_provider() {
        let (mut reactor, _timers, mux) = setup();
        let conn = mux
            .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Udp, &[])
            .unwrap();
        let err = mux.start_tls(&mut reactor, conn, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);
    }
}
