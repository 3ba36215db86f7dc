// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection socket options and their application contracts.
//!
//! Each option has a phase: some only make sense before `bind(2)`
//! (`ReuseAddress`, `Freebind`, additional SCTP local addresses), some
//! before the SCTP association or TLS handshake exists, some any time.
//! The mux routes TLS-parameter options into the connection's parameter
//! block instead of the socket; everything else lands in `setsockopt`.

use std::mem::ManuallyDrop;
use std::net::IpAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;

use socket2::{Socket, TcpKeepalive};

use crate::error::{Error, ErrorKind, Result};
use crate::mux::events::Proto;
use crate::mux::sctp;

/// Tri-state option value: explicit yes/no or "leave the OS default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tri {
    Yes,
    No,
    #[default]
    NotSet,
}

impl Tri {
    pub fn or(self, fallback: bool) -> bool {
        match self {
            Tri::Yes => true,
            Tri::No => false,
            Tri::NotSet => fallback,
        }
    }
}

/// Per-version TLS/DTLS opt-outs. Each protocol version is independently
/// switchable; `NotSet` inherits the process default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SslVersions {
    pub sslv2: Tri,
    pub sslv3: Tri,
    pub tlsv1: Tri,
    pub tlsv1_1: Tri,
    pub tlsv1_2: Tri,
    pub dtlsv1: Tri,
    pub dtlsv1_2: Tri,
}

/// Stream keep-alive probing parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveOpts {
    pub enable: Tri,
    pub count: Option<u32>,
    pub idle: Option<u32>,
    pub interval: Option<u32>,
}

/// SCTP notification subscriptions (`SCTP_EVENTS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SctpEventSubscriptions {
    pub data_io: bool,
    pub association: bool,
    pub address: bool,
    pub send_failure: bool,
    pub peer_error: bool,
    pub shutdown: bool,
    pub partial_delivery: bool,
    pub adaptation_layer: bool,
    pub authentication: bool,
    pub sender_dry: bool,
}

impl Default for SctpEventSubscriptions {
    fn default() -> Self {
        Self {
            data_io: true,
            association: true,
            address: true,
            send_failure: true,
            peer_error: true,
            shutdown: true,
            partial_delivery: true,
            adaptation_layer: true,
            authentication: false,
            sender_dry: false,
        }
    }
}

/// TLS certificate/key material, per connection or process-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertOptions {
    pub key_file: Option<String>,
    pub cert_file: Option<String>,
    pub ca_list_file: Option<String>,
    pub cipher_list: Option<String>,
    pub password: Option<String>,
}

/// The closed set of recognized per-connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockOption {
    /// Before bind.
    ReuseAddress(bool),
    /// Any time after create.
    TcpNoDelay(bool),
    /// Any time after create.
    SctpNoDelay(bool),
    /// After connect, stream protocols only.
    Linger { on: bool, seconds: u32 },
    /// Before bind. Non-Linux systems log a warning instead of failing.
    Freebind(bool),
    /// Stream protocols.
    KeepAlive(KeepAliveOpts),
    /// Before association.
    SctpEvents(SctpEventSubscriptions),
    /// Before association.
    SctpInitMsg {
        ostreams: u16,
        instreams: u16,
        attempts: u16,
        init_timeo: u16,
    },
    /// Before bind; triggers `sctp_bindx`.
    SctpAdditionalLocalAddresses(Vec<IpAddr>),
    /// Disables path-MTU discovery with a fixed value.
    SctpPathMtu(u32),
    /// Before handshake.
    SslSupport(SslVersions),
    /// Before handshake; per-connection override of process defaults.
    CertOptions(CertOptions),
    /// Before handshake.
    AlpnList(Vec<Vec<u8>>),
    /// Before handshake.
    TlsHostname(String),
    /// Before handshake (DTLS-SRTP, RFC 5764).
    DtlsSrtpProfiles(String),
    /// UDP only.
    Broadcast(bool),
}

impl SockOption {
    /// TLS-parameter options configure the session, not the socket.
    pub fn is_tls_param(&self) -> bool {
        matches!(
            self,
            SockOption::SslSupport(_)
                | SockOption::CertOptions(_)
                | SockOption::AlpnList(_)
                | SockOption::TlsHostname(_)
                | SockOption::DtlsSrtpProfiles(_)
        )
    }

    /// Whether this option must be applied before `bind(2)`.
    pub fn is_before_bind(&self) -> bool {
        matches!(
            self,
            SockOption::ReuseAddress(_)
                | SockOption::Freebind(_)
                | SockOption::SctpAdditionalLocalAddresses(_)
        )
    }
}

/// Borrow an fd as a `socket2::Socket` without taking ownership.
pub(crate) fn with_socket<T>(fd: RawFd, f: impl FnOnce(&Socket) -> std::io::Result<T>) -> Result<T> {
    let sock = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
    f(&sock).map_err(Error::from)
}

fn wrong_proto(opt: &SockOption, proto: Proto) -> Error {
    Error::new(
        ErrorKind::InvalidArgument,
        format!("option {:?} is not applicable to {:?}", opt, proto),
    )
}

/// Apply one non-TLS option to a socket.
///
/// `before_bind` tells whether the socket is still unbound; options whose
/// contract requires that phase are rejected afterwards.
pub fn apply_socket_option(
    fd: RawFd,
    proto: Proto,
    opt: &SockOption,
    before_bind: bool,
) -> Result<()> {
    if opt.is_before_bind() && !before_bind {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("option {:?} must be applied before bind", opt),
        ));
    }
    match opt {
        SockOption::ReuseAddress(on) => with_socket(fd, |s| s.set_reuse_address(*on)),
        SockOption::TcpNoDelay(on) => {
            if !matches!(proto, Proto::Tcp | Proto::Tls | Proto::Unix) {
                return Err(wrong_proto(opt, proto));
            }
            with_socket(fd, |s| s.set_nodelay(*on))
        }
        SockOption::SctpNoDelay(on) => {
            if !matches!(proto, Proto::Sctp | Proto::DtlsSctp) {
                return Err(wrong_proto(opt, proto));
            }
            sctp::set_nodelay(fd, *on)
        }
        SockOption::Linger { on, seconds } => {
            if proto.is_datagram() {
                return Err(wrong_proto(opt, proto));
            }
            let linger = on.then(|| Duration::from_secs(u64::from(*seconds)));
            with_socket(fd, |s| s.set_linger(linger))
        }
        SockOption::Freebind(on) => set_freebind(fd, *on),
        SockOption::KeepAlive(ka) => {
            if proto.is_datagram() {
                return Err(wrong_proto(opt, proto));
            }
            apply_keepalive(fd, ka)
        }
        SockOption::SctpEvents(subs) => {
            if !matches!(proto, Proto::Sctp | Proto::DtlsSctp) {
                return Err(wrong_proto(opt, proto));
            }
            sctp::set_event_subscriptions(fd, subs)
        }
        SockOption::SctpInitMsg {
            ostreams,
            instreams,
            attempts,
            init_timeo,
        } => {
            if !matches!(proto, Proto::Sctp | Proto::DtlsSctp) {
                return Err(wrong_proto(opt, proto));
            }
            sctp::set_init_msg(fd, *ostreams, *instreams, *attempts, *init_timeo)
        }
        SockOption::SctpAdditionalLocalAddresses(addrs) => {
            if !matches!(proto, Proto::Sctp | Proto::DtlsSctp) {
                return Err(wrong_proto(opt, proto));
            }
            sctp::bindx_add(fd, addrs)
        }
        SockOption::SctpPathMtu(size) => {
            if !matches!(proto, Proto::Sctp | Proto::DtlsSctp) {
                return Err(wrong_proto(opt, proto));
            }
            sctp::set_path_mtu(fd, *size)
        }
        SockOption::Broadcast(on) => {
            if !matches!(proto, Proto::Udp | Proto::DtlsUdp) {
                return Err(wrong_proto(opt, proto));
            }
            with_socket(fd, |s| s.set_broadcast(*on))
        }
        _ => Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("option {:?} is not a socket option", opt),
        )),
    }
}

fn apply_keepalive(fd: RawFd, ka: &KeepAliveOpts) -> Result<()> {
    let enable = ka.enable.or(ka.count.is_some() || ka.idle.is_some() || ka.interval.is_some());
    if !enable {
        return with_socket(fd, |s| s.set_keepalive(false));
    }
    let mut params = TcpKeepalive::new();
    if let Some(idle) = ka.idle {
        params = params.with_time(Duration::from_secs(u64::from(idle)));
    }
    if let Some(interval) = ka.interval {
        params = params.with_interval(Duration::from_secs(u64::from(interval)));
    }
    #[cfg(target_os = "linux")]
    if let Some(count) = ka.count {
        params = params.with_retries(count);
    }
    with_socket(fd, |s| s.set_tcp_keepalive(&params))
}

#[cfg(target_os = "linux")]
fn set_freebind(fd: RawFd, on: bool) -> Result<()> {
    let value: libc::c_int = i32::from(on);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_FREEBIND,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os(ErrorKind::Socket, "setsockopt(IP_FREEBIND) failed"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_freebind(_fd: RawFd, on: bool) -> Result<()> {
    if on {
        log::warn!("[MUX] FREEBIND is not supported on this platform; option ignored");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_reuse_address_before_bind_only() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = apply_socket_option(
            sock.as_raw_fd(),
            Proto::Udp,
            &SockOption::ReuseAddress(true),
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_broadcast_udp_only() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        apply_socket_option(
            sock.as_raw_fd(),
            Proto::Udp,
            &SockOption::Broadcast(true),
            false,
        )
        .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let err = apply_socket_option(
            listener.as_raw_fd(),
            Proto::Tcp,
            &SockOption::Broadcast(true),
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_nodelay_rejected_on_udp() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = apply_socket_option(
            sock.as_raw_fd(),
            Proto::Udp,
            &SockOption::TcpNoDelay(true),
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_tls_params_are_not_socket_options() {
        assert!(SockOption::TlsHostname("peer".into()).is_tls_param());
        assert!(SockOption::SslSupport(SslVersions::default()).is_tls_param());
        assert!(!SockOption::ReuseAddress(true).is_tls_param());
    }

    #[test]
    fn test_keepalive_on_tcp_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let ka = KeepAliveOpts {
            enable: Tri::Yes,
            count: Some(3),
            idle: Some(30),
            interval: Some(5),
        };
        apply_socket_option(
            listener.as_raw_fd(),
            Proto::Tcp,
            &SockOption::KeepAlive(ka),
            false,
        )
        .unwrap();
    }
}
