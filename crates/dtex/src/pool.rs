// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket pool: dense connection-id → descriptor map with delayed slot reuse.
//!
//! Connection ids are small integers handed to the test layer as stable
//! handles. A freed slot goes to the back of a FIFO free list and is not
//! handed out again until more than `n_recently_closed` slots are free, so a
//! slow consumer holding a stale id cannot silently land on an unrelated new
//! connection.
//!
//! Slot 0 is reserved; valid connection ids are >= 1.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::buffer::ByteBuffer;
use crate::error::{Error, ErrorKind, Result};
use crate::mux::framing::{default_framer, FramerFn};

/// Freed slots that must stay on the free list before reuse begins.
pub const N_RECENTLY_CLOSED: usize = 10;
/// Initial slot-vector capacity.
pub const SOCK_LIST_SIZE_MIN: usize = 16;

/// Stable connection handle. `0` is never a valid id.
pub type ConnId = usize;

/// Socket kind, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Udp,
    TcpListen,
    Tcp,
    SctpListen,
    Sctp,
}

impl SockKind {
    pub fn is_listener(self) -> bool {
        matches!(self, SockKind::TcpListen | SockKind::SctpListen)
    }

    pub fn is_stream(self) -> bool {
        matches!(self, SockKind::Tcp | SockKind::Sctp)
    }
}

/// Role of the TLS/DTLS layer on a connection, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    None,
    Server,
    Client,
}

/// Connection-level state, mostly driven by the TLS/DTLS handshake engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Normal,
    Connecting,
    Handshaking,
    WaitForReceiveCallback,
    BlockForSending,
    DontClose,
    DontReceive,
}

/// Per-connection TLS parameter overrides (process defaults apply otherwise).
#[derive(Debug, Clone, Default)]
pub struct TlsParams {
    pub key_file: Option<String>,
    pub cert_file: Option<String>,
    pub ca_list_file: Option<String>,
    pub cipher_list: Option<String>,
    pub password: Option<String>,
    pub tls_hostname: Option<String>,
    pub alpn: Vec<Vec<u8>>,
    pub dtls_srtp_profiles: Option<String>,
    /// Per-protocol-version opt-outs; `None` means process default.
    pub versions: Option<crate::mux::options::SslVersions>,
}

/// One pooled socket.
#[derive(Debug)]
pub struct SocketDesc {
    pub kind: SockKind,
    /// Protocol witness reported in events.
    pub proto: crate::mux::events::Proto,
    pub tls_role: TlsRole,
    pub fd: RawFd,
    /// Inbound append/parse buffer; allocated lazily on first data.
    pub buffer: Option<ByteBuffer>,
    pub framer: FramerFn,
    pub framer_args: Vec<i64>,
    /// Alternative framer applied while draining a closing connection.
    pub close_framer: Option<(FramerFn, Vec<i64>)>,
    /// Leading bytes of each frame (the length field) withheld from the
    /// delivered payload.
    pub header_strip: usize,
    pub state: ConnState,
    pub user_tag: i64,
    /// Listener this connection was accepted from.
    pub parent: Option<ConnId>,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    /// Sticky decode state: frame length the framer last announced.
    pub pending_len: Option<usize>,
    /// Multi-homed remote address set (SCTP sequential connect).
    pub remote_addrs: Vec<SocketAddr>,
    /// Index of the remote address currently being attempted.
    pub remote_addr_ix: usize,
    /// TLS/DTLS session, when layered.
    pub tls: Option<crate::mux::tls::TlsSession>,
    pub tls_params: TlsParams,
}

impl SocketDesc {
    fn new(kind: SockKind, fd: RawFd, tls_role: TlsRole) -> Self {
        Self {
            kind,
            proto: match kind {
                SockKind::Udp => crate::mux::events::Proto::Udp,
                SockKind::TcpListen | SockKind::Tcp => crate::mux::events::Proto::Tcp,
                SockKind::SctpListen | SockKind::Sctp => crate::mux::events::Proto::Sctp,
            },
            tls_role,
            fd,
            buffer: None,
            framer: default_framer,
            framer_args: Vec::new(),
            close_framer: None,
            header_strip: 0,
            state: ConnState::Normal,
            user_tag: 0,
            parent: None,
            local: None,
            remote: None,
            pending_len: None,
            remote_addrs: Vec::new(),
            remote_addr_ix: 0,
            tls: None,
            tls_params: TlsParams::default(),
        }
    }

    /// Buffer accessor that performs the lazy allocation.
    pub fn buffer_mut(&mut self) -> &mut ByteBuffer {
        self.buffer.get_or_insert_with(ByteBuffer::new)
    }
}

enum Slot {
    Reserved,
    Live(SocketDesc),
    Free { next: Option<ConnId> },
}

/// Dense `ConnId → SocketDesc` arena with FIFO free-list reuse.
pub struct SocketPool {
    slots: Vec<Slot>,
    free_head: Option<ConnId>,
    free_tail: Option<ConnId>,
    free_count: usize,
    live_count: usize,
    n_recently_closed: usize,
}

impl SocketPool {
    pub fn new() -> Self {
        Self::with_reuse_distance(N_RECENTLY_CLOSED)
    }

    /// `n_recently_closed` is the minimum number of slots that must be on
    /// the free list before any of them is reused.
    pub fn with_reuse_distance(n_recently_closed: usize) -> Self {
        let mut slots = Vec::with_capacity(SOCK_LIST_SIZE_MIN);
        slots.push(Slot::Reserved);
        Self {
            slots,
            free_head: None,
            free_tail: None,
            free_count: 0,
            live_count: 0,
            n_recently_closed,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Allocate a slot for `fd`. Reuses the oldest freed slot only once more
    /// than `n_recently_closed` slots are waiting.
    pub fn alloc(
        &mut self,
        kind: SockKind,
        fd: RawFd,
        tls_role: TlsRole,
        parent: Option<ConnId>,
    ) -> ConnId {
        let mut desc = SocketDesc::new(kind, fd, tls_role);
        desc.parent = parent;
        let id = if self.free_count > self.n_recently_closed {
            let id = self.free_head.expect("free_count > 0 implies a head");
            let next = match &self.slots[id] {
                Slot::Free { next } => *next,
                _ => unreachable!("free list points at a non-free slot"),
            };
            self.free_head = next;
            if self.free_head.is_none() {
                self.free_tail = None;
            }
            self.free_count -= 1;
            self.slots[id] = Slot::Live(desc);
            id
        } else {
            self.slots.push(Slot::Live(desc));
            self.slots.len() - 1
        };
        self.live_count += 1;
        log::debug!("[POOL] alloc conn {} (fd {}, {:?})", id, fd, kind);
        id
    }

    /// Release a slot. The caller is responsible for having closed the OS
    /// descriptor and torn down reactor registrations; the pool only
    /// reclaims per-connection state and queues the id for delayed reuse.
    pub fn free(&mut self, id: ConnId) -> Result<SocketDesc> {
        if !self.is_valid(id) {
            return Err(Error::new(
                ErrorKind::InvalidConnection,
                format!("freeing invalid connection id {}", id),
            ));
        }
        let desc = match std::mem::replace(&mut self.slots[id], Slot::Free { next: None }) {
            Slot::Live(desc) => desc,
            _ => unreachable!("is_valid checked above"),
        };
        match self.free_tail {
            Some(tail) => {
                if let Slot::Free { next } = &mut self.slots[tail] {
                    *next = Some(id);
                }
            }
            None => self.free_head = Some(id),
        }
        self.free_tail = Some(id);
        self.free_count += 1;
        self.live_count -= 1;
        log::debug!("[POOL] free conn {} (fd {})", id, desc.fd);
        Ok(desc)
    }

    pub fn is_valid(&self, id: ConnId) -> bool {
        id > 0 && id < self.slots.len() && matches!(self.slots[id], Slot::Live(_))
    }

    pub fn lookup(&self, id: ConnId) -> Result<&SocketDesc> {
        match self.slots.get(id) {
            Some(Slot::Live(desc)) if id > 0 => Ok(desc),
            _ => Err(Error::new(
                ErrorKind::InvalidConnection,
                format!("connection id {} is not live", id),
            )),
        }
    }

    pub fn lookup_mut(&mut self, id: ConnId) -> Result<&mut SocketDesc> {
        match self.slots.get_mut(id) {
            Some(Slot::Live(desc)) if id > 0 => Ok(desc),
            _ => Err(Error::new(
                ErrorKind::InvalidConnection,
                format!("connection id {} is not live", id),
            )),
        }
    }

    /// Find the live connection that owns `fd`.
    pub fn find_by_fd(&self, fd: RawFd) -> Option<ConnId> {
        self.iter_live().find_map(|(id, desc)| (desc.fd == fd).then_some(id))
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (ConnId, &SocketDesc)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| match slot {
            Slot::Live(desc) => Some((id, desc)),
            _ => None,
        })
    }

    /// Ids of every live connection (snapshot, for mutation loops).
    pub fn live_ids(&self) -> Vec<ConnId> {
        self.iter_live().map(|(id, _)| id).collect()
    }
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_zero_reserved() {
        let mut pool = SocketPool::new();
        let id = pool.alloc(SockKind::Tcp, 10, TlsRole::None, None);
        assert!(id >= 1);
        assert!(!pool.is_valid(0));
        assert!(pool.is_valid(id));
    }

    #[test]
    fn test_lookup_after_free_is_invalid_connection() {
        let mut pool = SocketPool::new();
        let id = pool.alloc(SockKind::Udp, 11, TlsRole::None, None);
        pool.free(id).unwrap();
        assert!(!pool.is_valid(id));
        assert_eq!(
            pool.lookup(id).unwrap_err().kind(),
            ErrorKind::InvalidConnection
        );
        assert_eq!(pool.free(id).unwrap_err().kind(), ErrorKind::InvalidConnection);
    }

    #[test]
    fn test_reuse_distance_respected() {
        let mut pool = SocketPool::with_reuse_distance(N_RECENTLY_CLOSED);
        let ids: Vec<ConnId> = (0..N_RECENTLY_CLOSED)
            .map(|i| pool.alloc(SockKind::Tcp, i as RawFd, TlsRole::None, None))
            .collect();
        for &id in &ids {
            pool.free(id).unwrap();
        }
        // N slots freed: the next allocation must avoid every one of them
        let fresh = pool.alloc(SockKind::Tcp, 99, TlsRole::None, None);
        assert!(!ids.contains(&fresh));
        // one more free pushes the list over the threshold; the OLDEST
        // freed slot is recycled first
        pool.free(fresh).unwrap();
        let recycled = pool.alloc(SockKind::Tcp, 100, TlsRole::None, None);
        assert_eq!(recycled, ids[0]);
    }

    #[test]
    fn test_fifo_reuse_order() {
        let mut pool = SocketPool::with_reuse_distance(1);
        let a = pool.alloc(SockKind::Tcp, 1, TlsRole::None, None);
        let b = pool.alloc(SockKind::Tcp, 2, TlsRole::None, None);
        let c = pool.alloc(SockKind::Tcp, 3, TlsRole::None, None);
        pool.free(a).unwrap();
        pool.free(b).unwrap();
        pool.free(c).unwrap();
        assert_eq!(pool.alloc(SockKind::Tcp, 4, TlsRole::None, None), a);
        assert_eq!(pool.alloc(SockKind::Tcp, 5, TlsRole::None, None), b);
        // list back at the threshold: growth resumes
        let d = pool.alloc(SockKind::Tcp, 6, TlsRole::None, None);
        assert_ne!(d, c);
    }

    #[test]
    fn test_find_by_fd_and_iter_live() {
        let mut pool = SocketPool::new();
        let a = pool.alloc(SockKind::Tcp, 21, TlsRole::None, None);
        let b = pool.alloc(SockKind::Udp, 22, TlsRole::None, None);
        assert_eq!(pool.find_by_fd(21), Some(a));
        assert_eq!(pool.find_by_fd(22), Some(b));
        assert_eq!(pool.find_by_fd(23), None);
        assert_eq!(pool.live_ids(), vec![a, b]);
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    fn test_lazy_buffer_allocation() {
        let mut pool = SocketPool::new();
        let id = pool.alloc(SockKind::Tcp, 30, TlsRole::None, None);
        assert!(pool.lookup(id).unwrap().buffer.is_none());
        pool.lookup_mut(id).unwrap().buffer_mut().append_bytes(b"x");
        assert!(pool.lookup(id).unwrap().buffer.is_some());
    }

    #[test]
    fn test_random_alloc_free_keeps_invariants() {
        let mut pool = SocketPool::new();
        let mut live: Vec<ConnId> = Vec::new();
        for i in 0..500 {
            if live.is_empty() || fastrand::bool() {
                live.push(pool.alloc(SockKind::Tcp, i, TlsRole::None, None));
            } else {
                let id = live.swap_remove(fastrand::usize(..live.len()));
                pool.free(id).unwrap();
            }
            assert_eq!(pool.live_count(), live.len());
            for &id in &live {
                assert!(pool.is_valid(id));
            }
        }
    }
}
