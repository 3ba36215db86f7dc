// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide configuration, the single source of truth.
//!
//! This module centralizes every tunable and wire constant. Constants live
//! at the top; runtime parameters arrive through [`Options::set_parameter`]
//! as name/value strings (the form the surrounding harness feeds them in)
//! and are validated on the spot. Unknown names are rejected, never
//! silently dropped.

use crate::error::{Error, ErrorKind, Result};
use crate::mux::events::Proto;
use crate::mux::options::{CertOptions, KeepAliveOpts, SctpEventSubscriptions, SslVersions, Tri};
use crate::pool::N_RECENTLY_CLOSED;

// =======================================================================
// Wire and resource constants
// =======================================================================

/// Read ceiling per receive syscall.
pub const RECV_CHUNK: usize = 65535;

/// Rendezvous path of a co-located controller: `/tmp/dtex-mctr-<port>`.
pub const CONTROLLER_SOCKET_PREFIX: &str = "/tmp/dtex-mctr-";

/// Initial interval of the overload-probing timer on the control
/// connection, in seconds.
pub const INITIAL_CALL_INTERVAL: f64 = 1.0;

/// Factor by which each overload probe stretches the interval.
pub const CALL_INTERVAL_INCREMENT: f64 = 2.0;

/// Default SCTP association initialization parameters.
pub const SINIT_NUM_OSTREAMS: u16 = 64;
pub const SINIT_MAX_INSTREAMS: u16 = 64;

// =======================================================================
// Runtime options
// =======================================================================

/// What `map` does to a port when the harness maps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapBehavior {
    /// Mapping performs no transport operation.
    #[default]
    Inert,
    /// Mapping connects to the configured remote endpoint.
    Connect,
    /// Mapping opens a listener on the configured local endpoint.
    Listen,
}

/// Which SCTP implementation backs SCTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SctpStack {
    #[default]
    Kernel,
    /// External user-space stack bridged over a pipe (not shipped here).
    External,
}

/// Process-wide runtime options, set before the first connection.
#[derive(Debug, Clone)]
pub struct Options {
    // ------------------------------------------------------------------
    // Defaults for listen/connect
    // ------------------------------------------------------------------
    pub default_local_host: Option<String>,
    pub default_local_port: Option<u16>,
    pub map_behavior: MapBehavior,
    pub map_protocol: Proto,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,

    // ------------------------------------------------------------------
    // I/O discipline
    // ------------------------------------------------------------------
    /// Listen backlog; `None` means SOMAXCONN.
    pub backlog: Option<i32>,
    /// Never nest the reactor from a send: report partial progress instead.
    pub pure_non_blocking: bool,
    /// Connect-probing wait per attempt, in milliseconds (<= 0: unbounded).
    pub poll_timeout: i32,
    /// Connect-probing attempts.
    pub max_num_of_poll: i32,
    pub extended_port_events: bool,
    /// Reuse distance of freed connection slots.
    pub n_recently_closed: usize,

    // ------------------------------------------------------------------
    // Per-transport socket defaults
    // ------------------------------------------------------------------
    pub tcp_reuse_addr: Tri,
    pub udp_reuse_addr: Tri,
    pub sctp_reuse_addr: Tri,
    pub ssl_reuse_addr: Tri,
    pub tcp_keep_alive: KeepAliveOpts,
    pub ssl_keep_alive: KeepAliveOpts,
    pub broadcast: bool,

    // ------------------------------------------------------------------
    // SCTP
    // ------------------------------------------------------------------
    pub sctp_stack: SctpStack,
    pub sinit_num_ostreams: u16,
    pub sinit_max_instreams: u16,
    pub sinit_max_attempts: u16,
    pub sinit_max_init_timeo: u16,
    pub sctp_events: SctpEventSubscriptions,
    /// 0: kernel picks addresses at once; 1: sequential retry across the
    /// remote address list; 2: accepted alias of 1 with connectx preferred.
    pub sctp_connection_method: u8,

    // ------------------------------------------------------------------
    // TLS
    // ------------------------------------------------------------------
    pub ssl_certs: CertOptions,
    pub ssl_verify_certificate: bool,
    pub ssl_use_session_resumption: bool,
    pub ssl_versions: SslVersions,
    pub ssl_reconnect_attempts: u32,
    pub ssl_reconnect_delay_ms: u32,
    pub tls_cert_per_conn: bool,
    pub dtls_srtp_profiles: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_local_host: None,
            default_local_port: None,
            map_behavior: MapBehavior::default(),
            map_protocol: Proto::Tcp,
            remote_host: None,
            remote_port: None,
            backlog: None,
            pure_non_blocking: false,
            poll_timeout: -1,
            max_num_of_poll: 1,
            extended_port_events: false,
            n_recently_closed: N_RECENTLY_CLOSED,
            tcp_reuse_addr: Tri::Yes,
            #[cfg(target_os = "linux")]
            udp_reuse_addr: Tri::Yes,
            #[cfg(not(target_os = "linux"))]
            udp_reuse_addr: Tri::No,
            #[cfg(target_os = "linux")]
            sctp_reuse_addr: Tri::Yes,
            #[cfg(not(target_os = "linux"))]
            sctp_reuse_addr: Tri::No,
            ssl_reuse_addr: Tri::Yes,
            tcp_keep_alive: KeepAliveOpts::default(),
            ssl_keep_alive: KeepAliveOpts::default(),
            broadcast: false,
            sctp_stack: SctpStack::default(),
            sinit_num_ostreams: SINIT_NUM_OSTREAMS,
            sinit_max_instreams: SINIT_MAX_INSTREAMS,
            sinit_max_attempts: 0,
            sinit_max_init_timeo: 0,
            sctp_events: SctpEventSubscriptions::default(),
            sctp_connection_method: 0,
            ssl_certs: CertOptions::default(),
            ssl_verify_certificate: true,
            ssl_use_session_resumption: true,
            ssl_versions: SslVersions::default(),
            ssl_reconnect_attempts: 5,
            ssl_reconnect_delay_ms: 1000,
            tls_cert_per_conn: false,
            dtls_srtp_profiles: None,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("parameter {}: expected yes/no, got {:?}", name, value),
        )),
    }
}

fn parse_tri(name: &str, value: &str) -> Result<Tri> {
    Ok(if parse_bool(name, value)? { Tri::Yes } else { Tri::No })
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("parameter {}: invalid number {:?}", name, value),
        )
    })
}

impl Options {
    /// Apply one name/value parameter from the harness configuration.
    ///
    /// Unknown names fail with `InvalidArgument`; values are validated per
    /// parameter.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "defaultListeningHost" => self.default_local_host = Some(value.to_string()),
            "defaultListeningPort" => self.default_local_port = Some(parse_num(name, value)?),
            "map_behavior" => {
                self.map_behavior = match value {
                    "connect" => MapBehavior::Connect,
                    "listen" => MapBehavior::Listen,
                    "inert" | "none" => MapBehavior::Inert,
                    _ => {
                        return Err(Error::new(
                            ErrorKind::InvalidArgument,
                            format!("map_behavior: unknown mode {:?}", value),
                        ))
                    }
                }
            }
            "map_protocol" => {
                self.map_protocol = match value {
                    "tcp" => Proto::Tcp,
                    "tls" => Proto::Tls,
                    "sctp" => Proto::Sctp,
                    "udp" => Proto::Udp,
                    _ => {
                        return Err(Error::new(
                            ErrorKind::InvalidArgument,
                            format!("map_protocol: unknown protocol {:?}", value),
                        ))
                    }
                }
            }
            "RemoteHost" => self.remote_host = Some(value.to_string()),
            "RemotePort" => self.remote_port = Some(parse_num(name, value)?),
            "backlog" => self.backlog = Some(parse_num(name, value)?),
            "pureNonBlocking" => self.pure_non_blocking = parse_bool(name, value)?,
            "poll_timeout" => self.poll_timeout = parse_num(name, value)?,
            "max_num_of_poll" => self.max_num_of_poll = parse_num(name, value)?,
            "extendedPortEvents" => self.extended_port_events = parse_bool(name, value)?,
            "n_recently_closed" => self.n_recently_closed = parse_num(name, value)?,

            "tcpReuseAddress" => self.tcp_reuse_addr = parse_tri(name, value)?,
            "udpReuseAddress" => self.udp_reuse_addr = parse_tri(name, value)?,
            "sctpReuseAddress" => self.sctp_reuse_addr = parse_tri(name, value)?,
            "sslReuseAddress" => self.ssl_reuse_addr = parse_tri(name, value)?,
            "tcpKeepAlive" => self.tcp_keep_alive.enable = parse_tri(name, value)?,
            "tcpKeepCount" => self.tcp_keep_alive.count = Some(parse_num(name, value)?),
            "tcpKeepIdle" => self.tcp_keep_alive.idle = Some(parse_num(name, value)?),
            "tcpKeepInterval" => self.tcp_keep_alive.interval = Some(parse_num(name, value)?),
            "sslKeepAlive" => self.ssl_keep_alive.enable = parse_tri(name, value)?,
            "sslKeepCount" => self.ssl_keep_alive.count = Some(parse_num(name, value)?),
            "sslKeepIdle" => self.ssl_keep_alive.idle = Some(parse_num(name, value)?),
            "sslKeepInterval" => self.ssl_keep_alive.interval = Some(parse_num(name, value)?),
            "broadcast" => self.broadcast = parse_bool(name, value)?,

            "sctp_stack" => {
                self.sctp_stack = match value {
                    "kernel" => SctpStack::Kernel,
                    "external" => SctpStack::External,
                    _ => {
                        return Err(Error::new(
                            ErrorKind::InvalidArgument,
                            format!("sctp_stack: unknown stack {:?}", value),
                        ))
                    }
                }
            }
            "sinit_num_ostreams" => self.sinit_num_ostreams = parse_num(name, value)?,
            "sinit_max_instreams" => self.sinit_max_instreams = parse_num(name, value)?,
            "sinit_max_attempts" => self.sinit_max_attempts = parse_num(name, value)?,
            "sinit_max_init_timeo" => self.sinit_max_init_timeo = parse_num(name, value)?,
            "sctp_data_io_event" => self.sctp_events.data_io = parse_bool(name, value)?,
            "sctp_association_event" => self.sctp_events.association = parse_bool(name, value)?,
            "sctp_address_event" => self.sctp_events.address = parse_bool(name, value)?,
            "sctp_send_failure_event" => self.sctp_events.send_failure = parse_bool(name, value)?,
            "sctp_peer_error_event" => self.sctp_events.peer_error = parse_bool(name, value)?,
            "sctp_shutdown_event" => self.sctp_events.shutdown = parse_bool(name, value)?,
            "sctp_partial_delivery_event" => {
                self.sctp_events.partial_delivery = parse_bool(name, value)?
            }
            "sctp_adaptation_layer_event" => {
                self.sctp_events.adaptation_layer = parse_bool(name, value)?
            }
            "sctp_authentication_event" => {
                self.sctp_events.authentication = parse_bool(name, value)?
            }
            "sctp_sender_dry_event" => self.sctp_events.sender_dry = parse_bool(name, value)?,
            "sctp_connection_method" => {
                let method: u8 = parse_num(name, value)?;
                if method > 2 {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("sctp_connection_method: {} is out of range", method),
                    ));
                }
                self.sctp_connection_method = method;
            }

            "ssl_private_key_file" => self.ssl_certs.key_file = Some(value.to_string()),
            "ssl_certificate_file" => self.ssl_certs.cert_file = Some(value.to_string()),
            "ssl_trustedCAlist_file" => self.ssl_certs.ca_list_file = Some(value.to_string()),
            "ssl_cipher_list" => self.ssl_certs.cipher_list = Some(value.to_string()),
            "ssl_private_key_password" => self.ssl_certs.password = Some(value.to_string()),
            "ssl_verify_certificate" => self.ssl_verify_certificate = parse_bool(name, value)?,
            "ssl_use_session_resumption" => {
                self.ssl_use_session_resumption = parse_bool(name, value)?
            }
            "ssl_reconnect_attempts" => self.ssl_reconnect_attempts = parse_num(name, value)?,
            "ssl_reconnect_delay" => self.ssl_reconnect_delay_ms = parse_num(name, value)?,
            "TLS_CERT_PER_CONN" => self.tls_cert_per_conn = parse_bool(name, value)?,
            "dtlsSrtpProfiles" => self.dtls_srtp_profiles = Some(value.to_string()),

            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("unknown parameter {:?}", name),
                ))
            }
        }
        Ok(())
    }

    /// Default reuse-address behavior for one protocol.
    pub fn reuse_addr_for(&self, proto: Proto) -> bool {
        match proto {
            Proto::Tcp | Proto::Unix => self.tcp_reuse_addr.or(true),
            Proto::Udp => self.udp_reuse_addr.or(false),
            Proto::Sctp => self.sctp_reuse_addr.or(false),
            Proto::Tls | Proto::DtlsUdp | Proto::DtlsSctp => self.ssl_reuse_addr.or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let opts = Options::default();
        assert_eq!(opts.sinit_num_ostreams, SINIT_NUM_OSTREAMS);
        assert_eq!(opts.n_recently_closed, N_RECENTLY_CLOSED);
        assert!(!opts.pure_non_blocking);
        assert!(opts.sctp_events.association);
        assert!(!opts.sctp_events.sender_dry);
    }

    #[test]
    fn test_set_parameter_full_table() {
        let mut opts = Options::default();
        for (name, value) in [
            ("defaultListeningHost", "127.0.0.1"),
            ("defaultListeningPort", "7700"),
            ("map_behavior", "connect"),
            ("map_protocol", "tls"),
            ("RemoteHost", "peer.example"),
            ("RemotePort", "9901"),
            ("backlog", "32"),
            ("pureNonBlocking", "yes"),
            ("poll_timeout", "15"),
            ("max_num_of_poll", "8"),
            ("extendedPortEvents", "yes"),
            ("tcpReuseAddress", "no"),
            ("udpReuseAddress", "yes"),
            ("sctpReuseAddress", "yes"),
            ("sslReuseAddress", "no"),
            ("tcpKeepAlive", "yes"),
            ("tcpKeepCount", "4"),
            ("tcpKeepIdle", "60"),
            ("tcpKeepInterval", "10"),
            ("sslKeepAlive", "no"),
            ("sslKeepCount", "2"),
            ("sslKeepIdle", "30"),
            ("sslKeepInterval", "5"),
            ("broadcast", "yes"),
            ("sctp_stack", "kernel"),
            ("sinit_num_ostreams", "8"),
            ("sinit_max_instreams", "8"),
            ("sinit_max_attempts", "3"),
            ("sinit_max_init_timeo", "500"),
            ("sctp_data_io_event", "yes"),
            ("sctp_association_event", "no"),
            ("sctp_address_event", "no"),
            ("sctp_send_failure_event", "yes"),
            ("sctp_peer_error_event", "yes"),
            ("sctp_shutdown_event", "yes"),
            ("sctp_partial_delivery_event", "no"),
            ("sctp_adaptation_layer_event", "no"),
            ("sctp_authentication_event", "yes"),
            ("sctp_sender_dry_event", "yes"),
            ("sctp_connection_method", "1"),
            ("ssl_private_key_file", "/etc/dtex/key.pem"),
            ("ssl_certificate_file", "/etc/dtex/cert.pem"),
            ("ssl_trustedCAlist_file", "/etc/dtex/ca.pem"),
            ("ssl_cipher_list", "HIGH"),
            ("ssl_private_key_password", "secret"),
            ("ssl_verify_certificate", "no"),
            ("ssl_use_session_resumption", "no"),
            ("ssl_reconnect_attempts", "2"),
            ("ssl_reconnect_delay", "250"),
            ("TLS_CERT_PER_CONN", "yes"),
            ("dtlsSrtpProfiles", "SRTP_AES128_CM_SHA1_80"),
        ] {
            opts.set_parameter(name, value)
                .unwrap_or_else(|e| panic!("{} rejected: {}", name, e));
        }
        assert_eq!(opts.map_behavior, MapBehavior::Connect);
        assert_eq!(opts.map_protocol, Proto::Tls);
        assert_eq!(opts.default_local_port, Some(7700));
        assert!(opts.pure_non_blocking);
        assert_eq!(opts.sctp_connection_method, 1);
        assert!(!opts.ssl_verify_certificate);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut opts = Options::default();
        let err = opts.set_parameter("no_such_parameter", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut opts = Options::default();
        assert!(opts.set_parameter("backlog", "many").is_err());
        assert!(opts.set_parameter("pureNonBlocking", "maybe").is_err());
        assert!(opts.set_parameter("sctp_connection_method", "7").is_err());
        assert!(opts.set_parameter("map_protocol", "carrier-pigeon").is_err());
    }

    #[test]
    fn test_reuse_addr_defaults_per_proto() {
        let opts = Options::default();
        assert!(opts.reuse_addr_for(Proto::Tcp));
        assert!(opts.reuse_addr_for(Proto::Tls));
    }
}
