// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SCTP socket plumbing: kernel ABI declarations and one-to-one helpers.
//!
//! There is no SCTP binding in the dependency stack, so the socket-option
//! structures and notification layouts are declared here against the Linux
//! UAPI, the same way the rest of the crate declares what `libc` does not
//! cover. Everything uses the one-to-one (SOCK_STREAM) style: one socket,
//! one association, listeners accept like TCP.
//!
//! Notifications arrive in-band with `MSG_NOTIFICATION` set in the receive
//! flags; [`parse_notification`] decodes them into typed events. An
//! ASSOC_CHANGE with COMM_LOST state is the SCTP spelling of a peer close.

use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::ptr;

use crate::error::{Error, ErrorKind, Result};
use crate::mux::events::SctpEventKind;
use crate::mux::options::SctpEventSubscriptions;

// ============================================================================
// Kernel ABI (Linux UAPI values)
// ============================================================================

pub const IPPROTO_SCTP: libc::c_int = 132;
pub const SOL_SCTP: libc::c_int = 132;

pub const SCTP_INITMSG: libc::c_int = 2;
pub const SCTP_NODELAY: libc::c_int = 3;
pub const SCTP_PEER_ADDR_PARAMS: libc::c_int = 9;
pub const SCTP_EVENTS: libc::c_int = 11;
pub const SCTP_SOCKOPT_BINDX_ADD: libc::c_int = 100;
pub const SCTP_SOCKOPT_CONNECTX: libc::c_int = 110;

/// `msg_flags` bit marking an in-band notification.
pub const MSG_NOTIFICATION: libc::c_int = 0x8000;

/// `cmsg_type` of the send/receive info ancillary block.
pub const SCTP_SNDRCV: libc::c_int = 1;

/// Disable path-MTU discovery (`spp_flags`).
pub const SPP_PMTUD_DISABLE: u32 = 1 << 4;

// Notification types (sn_header.sn_type).
pub const SCTP_SN_TYPE_BASE: u16 = 1 << 15;
pub const SCTP_ASSOC_CHANGE: u16 = SCTP_SN_TYPE_BASE + 1;
pub const SCTP_PEER_ADDR_CHANGE: u16 = SCTP_SN_TYPE_BASE + 2;
pub const SCTP_SEND_FAILED: u16 = SCTP_SN_TYPE_BASE + 3;
pub const SCTP_REMOTE_ERROR: u16 = SCTP_SN_TYPE_BASE + 4;
pub const SCTP_SHUTDOWN_EVENT: u16 = SCTP_SN_TYPE_BASE + 5;
pub const SCTP_PARTIAL_DELIVERY_EVENT: u16 = SCTP_SN_TYPE_BASE + 6;
pub const SCTP_ADAPTATION_INDICATION: u16 = SCTP_SN_TYPE_BASE + 7;
pub const SCTP_AUTHENTICATION_EVENT: u16 = SCTP_SN_TYPE_BASE + 8;
pub const SCTP_SENDER_DRY_EVENT: u16 = SCTP_SN_TYPE_BASE + 9;

// Association states (sctp_assoc_change.sac_state).
pub const SCTP_COMM_UP: u16 = 0;
pub const SCTP_COMM_LOST: u16 = 1;
pub const SCTP_RESTART: u16 = 2;
pub const SCTP_SHUTDOWN_COMP: u16 = 3;
pub const SCTP_CANT_STR_ASSOC: u16 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SctpInitMsg {
    pub sinit_num_ostreams: u16,
    pub sinit_max_instreams: u16,
    pub sinit_max_attempts: u16,
    pub sinit_max_init_timeo: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SctpEventSubscribe {
    pub sctp_data_io_event: u8,
    pub sctp_association_event: u8,
    pub sctp_address_event: u8,
    pub sctp_send_failure_event: u8,
    pub sctp_peer_error_event: u8,
    pub sctp_shutdown_event: u8,
    pub sctp_partial_delivery_event: u8,
    pub sctp_adaptation_layer_event: u8,
    pub sctp_authentication_event: u8,
    pub sctp_sender_dry_event: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SctpSndRcvInfo {
    pub sinfo_stream: u16,
    pub sinfo_ssn: u16,
    pub sinfo_flags: u16,
    pub sinfo_ppid: u32,
    pub sinfo_context: u32,
    pub sinfo_timetolive: u32,
    pub sinfo_tsn: u32,
    pub sinfo_cumtsn: u32,
    pub sinfo_assoc_id: i32,
}

#[repr(C)]
struct SctpNotificationHeader {
    sn_type: u16,
    sn_flags: u16,
    sn_length: u32,
}

#[repr(C)]
struct SctpAssocChange {
    sac_type: u16,
    sac_flags: u16,
    sac_length: u32,
    sac_state: u16,
    sac_error: u16,
    sac_outbound_streams: u16,
    sac_inbound_streams: u16,
    sac_assoc_id: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SctpPaddrChange {
    spc_type: u16,
    spc_flags: u16,
    spc_length: u32,
    spc_aaddr: libc::sockaddr_storage,
    spc_state: libc::c_int,
    spc_error: libc::c_int,
    spc_assoc_id: i32,
}

#[repr(C)]
struct SctpPaddrParams {
    spp_assoc_id: i32,
    spp_address: libc::sockaddr_storage,
    spp_hbinterval: u32,
    spp_pathmaxrxt: u16,
    spp_pathmtu: u32,
    spp_sackdelay: u32,
    spp_flags: u32,
}

// ============================================================================
// Socket-option helpers
// ============================================================================

fn setsockopt_raw(fd: RawFd, opt: libc::c_int, ptr: *const libc::c_void, len: usize) -> Result<()> {
    let rc = unsafe { libc::setsockopt(fd, SOL_SCTP, opt, ptr, len as libc::socklen_t) };
    if rc < 0 {
        return Err(Error::last_os(
            ErrorKind::Socket,
            format!("setsockopt(SOL_SCTP, {}) failed", opt),
        ));
    }
    Ok(())
}

pub fn set_nodelay(fd: RawFd, on: bool) -> Result<()> {
    let value: libc::c_int = i32::from(on);
    setsockopt_raw(
        fd,
        SCTP_NODELAY,
        (&value as *const libc::c_int).cast(),
        mem::size_of::<libc::c_int>(),
    )
}

pub fn set_init_msg(fd: RawFd, ostreams: u16, instreams: u16, attempts: u16, timeo: u16) -> Result<()> {
    let msg = SctpInitMsg {
        sinit_num_ostreams: ostreams,
        sinit_max_instreams: instreams,
        sinit_max_attempts: attempts,
        sinit_max_init_timeo: timeo,
    };
    setsockopt_raw(
        fd,
        SCTP_INITMSG,
        (&msg as *const SctpInitMsg).cast(),
        mem::size_of::<SctpInitMsg>(),
    )
}

pub fn set_event_subscriptions(fd: RawFd, subs: &SctpEventSubscriptions) -> Result<()> {
    let raw = SctpEventSubscribe {
        sctp_data_io_event: u8::from(subs.data_io),
        sctp_association_event: u8::from(subs.association),
        sctp_address_event: u8::from(subs.address),
        sctp_send_failure_event: u8::from(subs.send_failure),
        sctp_peer_error_event: u8::from(subs.peer_error),
        sctp_shutdown_event: u8::from(subs.shutdown),
        sctp_partial_delivery_event: u8::from(subs.partial_delivery),
        sctp_adaptation_layer_event: u8::from(subs.adaptation_layer),
        sctp_authentication_event: u8::from(subs.authentication),
        sctp_sender_dry_event: u8::from(subs.sender_dry),
    };
    setsockopt_raw(
        fd,
        SCTP_EVENTS,
        (&raw as *const SctpEventSubscribe).cast(),
        mem::size_of::<SctpEventSubscribe>(),
    )
}

/// Disable path-MTU discovery with a fixed MTU.
pub fn set_path_mtu(fd: RawFd, size: u32) -> Result<()> {
    let mut params: SctpPaddrParams = unsafe { mem::zeroed() };
    params.spp_pathmtu = size;
    params.spp_flags = SPP_PMTUD_DISABLE;
    setsockopt_raw(
        fd,
        SCTP_PEER_ADDR_PARAMS,
        (&params as *const SctpPaddrParams).cast(),
        mem::size_of::<SctpPaddrParams>(),
    )
}

/// Pack socket addresses back-to-back, the layout `bindx`/`connectx` take.
fn pack_addrs(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        (&sa as *const libc::sockaddr_in).cast::<u8>(),
                        mem::size_of::<libc::sockaddr_in>(),
                    )
                };
                out.extend_from_slice(bytes);
            }
            SocketAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.s6_addr = v6.ip().octets();
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        (&sa as *const libc::sockaddr_in6).cast::<u8>(),
                        mem::size_of::<libc::sockaddr_in6>(),
                    )
                };
                out.extend_from_slice(bytes);
            }
        }
    }
    out
}

/// Bind additional local addresses (`sctp_bindx` with ADD).
pub fn bindx_add(fd: RawFd, addrs: &[IpAddr]) -> Result<()> {
    if addrs.is_empty() {
        return Ok(());
    }
    let socket_addrs: Vec<SocketAddr> = addrs.iter().map(|ip| SocketAddr::new(*ip, 0)).collect();
    let packed = pack_addrs(&socket_addrs);
    setsockopt_raw(
        fd,
        SCTP_SOCKOPT_BINDX_ADD,
        packed.as_ptr().cast(),
        packed.len(),
    )
}

/// Initiate an association towards every address at once (`sctp_connectx`).
///
/// Nonblocking sockets report `EINPROGRESS` like a TCP connect.
pub fn connectx(fd: RawFd, addrs: &[SocketAddr]) -> Result<()> {
    let packed = pack_addrs(addrs);
    setsockopt_raw(fd, SCTP_SOCKOPT_CONNECTX, packed.as_ptr().cast(), packed.len())
}

// ============================================================================
// Data path
// ============================================================================

/// Receive one message or notification.
///
/// Returns `(bytes, is_notification, info)`. With `peek` set the bytes stay
/// queued, which DTLS-over-SCTP needs so the security layer can re-read the
/// same record.
pub fn recv_message(
    fd: RawFd,
    buf: &mut [u8],
    peek: bool,
) -> std::io::Result<(usize, bool, Option<SctpSndRcvInfo>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_space = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space.len() as _;

    let flags = if peek { libc::MSG_PEEK } else { 0 };
    let n = unsafe { libc::recvmsg(fd, &mut msg, flags) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let is_notification = msg.msg_flags & MSG_NOTIFICATION != 0;
    let mut info = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == IPPROTO_SCTP && (*cmsg).cmsg_type == SCTP_SNDRCV {
                let mut raw = SctpSndRcvInfo::default();
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut raw as *mut SctpSndRcvInfo).cast(),
                    mem::size_of::<SctpSndRcvInfo>(),
                );
                info = Some(raw);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((n as usize, is_notification, info))
}

/// Send with per-message stream id and payload protocol id.
pub fn send_with_info(fd: RawFd, bytes: &[u8], stream: u16, ppid: u32) -> std::io::Result<usize> {
    let mut info = SctpSndRcvInfo {
        sinfo_stream: stream,
        sinfo_ppid: ppid.to_be(),
        ..Default::default()
    };
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    let mut cmsg_space = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr().cast();
    msg.msg_controllen =
        unsafe { libc::CMSG_SPACE(mem::size_of::<SctpSndRcvInfo>() as u32) } as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = IPPROTO_SCTP;
        (*cmsg).cmsg_type = SCTP_SNDRCV;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<SctpSndRcvInfo>() as u32) as _;
        ptr::copy_nonoverlapping(
            (&mut info as *mut SctpSndRcvInfo).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            mem::size_of::<SctpSndRcvInfo>(),
        );
    }

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

// ============================================================================
// Notification decoding
// ============================================================================

fn read_struct<T: Copy>(buf: &[u8]) -> Option<T> {
    if buf.len() < mem::size_of::<T>() {
        return None;
    }
    let mut value = mem::MaybeUninit::<T>::uninit();
    unsafe {
        ptr::copy_nonoverlapping(buf.as_ptr(), value.as_mut_ptr().cast(), mem::size_of::<T>());
        Some(value.assume_init())
    }
}

/// Decode an in-band notification into a typed event.
///
/// Returns `None` for truncated or unknown notification types (logged and
/// skipped, never fatal).
pub fn parse_notification(buf: &[u8]) -> Option<SctpEventKind> {
    if buf.len() < mem::size_of::<SctpNotificationHeader>() {
        log::warn!("[MUX] truncated SCTP notification ({} bytes)", buf.len());
        return None;
    }
    let sn_type = u16::from_ne_bytes([buf[0], buf[1]]);
    match sn_type {
        SCTP_ASSOC_CHANGE => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct Raw {
                _hdr: [u8; 8],
                state: u16,
                error: u16,
                outbound: u16,
                inbound: u16,
            }
            read_struct::<Raw>(buf).map(|raw| SctpEventKind::AssocChange {
                state: raw.state,
                error: raw.error,
                outbound_streams: raw.outbound,
                inbound_streams: raw.inbound,
            })
        }
        SCTP_PEER_ADDR_CHANGE => {
            read_struct::<SctpPaddrChange>(buf).map(|raw| SctpEventKind::PeerAddrChange {
                state: raw.spc_state as u32,
                error: raw.spc_error as u32,
            })
        }
        SCTP_SEND_FAILED => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct Raw {
                _hdr: [u8; 8],
                error: u32,
            }
            read_struct::<Raw>(buf).map(|raw| SctpEventKind::SendFailed { error: raw.error })
        }
        SCTP_REMOTE_ERROR => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct Raw {
                _hdr: [u8; 8],
                error: u16,
            }
            read_struct::<Raw>(buf).map(|raw| SctpEventKind::RemoteError { error: raw.error })
        }
        SCTP_SHUTDOWN_EVENT => Some(SctpEventKind::Shutdown),
        SCTP_PARTIAL_DELIVERY_EVENT => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct Raw {
                _hdr: [u8; 8],
                indication: u32,
            }
            read_struct::<Raw>(buf)
                .map(|raw| SctpEventKind::PartialDelivery { indication: raw.indication })
        }
        SCTP_ADAPTATION_INDICATION => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct Raw {
                _hdr: [u8; 8],
                indication: u32,
            }
            read_struct::<Raw>(buf)
                .map(|raw| SctpEventKind::AdaptationIndication { indication: raw.indication })
        }
        SCTP_AUTHENTICATION_EVENT => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct Raw {
                _hdr: [u8; 8],
                _keys: [u16; 2],
                indication: u32,
            }
            read_struct::<Raw>(buf)
                .map(|raw| SctpEventKind::Authentication { indication: raw.indication })
        }
        SCTP_SENDER_DRY_EVENT => Some(SctpEventKind::SenderDry),
        other => {
            log::warn!("[MUX] unknown SCTP notification type {:#x}", other);
            None
        }
    }
}

/// True when the association is gone and the connection must run its
/// closed-path (COMM_LOST, SHUTDOWN_COMP, CANT_STR_ASSOC).
pub fn assoc_is_down(kind: &SctpEventKind) -> bool {
    matches!(
        kind,
        SctpEventKind::AssocChange { state, .. }
            if *state == SCTP_COMM_LOST
                || *state == SCTP_SHUTDOWN_COMP
                || *state == SCTP_CANT_STR_ASSOC
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assoc_change_bytes(state: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SCTP_ASSOC_CHANGE.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
        buf.extend_from_slice(&20u32.to_ne_bytes()); // length
        buf.extend_from_slice(&state.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // error
        buf.extend_from_slice(&10u16.to_ne_bytes()); // outbound
        buf.extend_from_slice(&5u16.to_ne_bytes()); // inbound
        buf.extend_from_slice(&1i32.to_ne_bytes()); // assoc id
        buf
    }

    #[test]
    fn test_parse_assoc_change() {
        let buf = assoc_change_bytes(SCTP_COMM_UP);
        let kind = parse_notification(&buf).unwrap();
        assert_eq!(
            kind,
            SctpEventKind::AssocChange {
                state: SCTP_COMM_UP,
                error: 0,
                outbound_streams: 10,
                inbound_streams: 5,
            }
        );
        assert!(!assoc_is_down(&kind));
    }

    #[test]
    fn test_comm_lost_is_down() {
        let buf = assoc_change_bytes(SCTP_COMM_LOST);
        let kind = parse_notification(&buf).unwrap();
        assert!(assoc_is_down(&kind));
    }

    #[test]
    fn test_shutdown_event() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SCTP_SHUTDOWN_EVENT.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 6]);
        assert_eq!(parse_notification(&buf), Some(SctpEventKind::Shutdown));
    }

    #[test]
    fn test_truncated_and_unknown_notifications() {
        assert_eq!(parse_notification(&[1, 2]), None);
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x7777u16.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 6]);
        assert_eq!(parse_notification(&buf), None);
    }

    #[test]
    fn test_pack_addrs_layout() {
        let addrs = ["10.0.0.1:9000".parse().unwrap(), "10.0.0.2:9000".parse().unwrap()];
        let packed = pack_addrs(&addrs);
        assert_eq!(packed.len(), 2 * mem::size_of::<libc::sockaddr_in>());
    }
}
