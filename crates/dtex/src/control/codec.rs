// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane message codec.
//!
//! Every control frame is `u32 length (big-endian) || type || payload`,
//! assembled in a [`ByteBuffer`]: push the type, push the fields, back-patch
//! the length. Types are a closed enumeration with wire-stable integer
//! identifiers; both peers of a control connection use this codec, so the
//! only hard contract is symmetry plus stability of the identifiers.
//!
//! Inbound dispatch: [`open_dispatch`] yields the raw type and the frame's
//! end position; after the per-type handler runs,
//! `advance_past_current_frame` is mandatory, including for unknown types,
//! which are hex-dumped at warning level and consumed.

use crate::buffer::ByteBuffer;
use crate::error::Result;

/// Transports advertised in the `Version` message.
pub const TRANSPORT_LOCAL: u64 = 0;
pub const TRANSPORT_INET_STREAM: u64 = 1;
pub const TRANSPORT_UNIX_STREAM: u64 = 2;

/// Test verdicts, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    None = 0,
    Pass = 1,
    Inconc = 2,
    Fail = 3,
    Error = 4,
}

impl Verdict {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Verdict::None),
            1 => Some(Verdict::Pass),
            2 => Some(Verdict::Inconc),
            3 => Some(Verdict::Fail),
            4 => Some(Verdict::Error),
            _ => None,
        }
    }
}

/// Closed control-plane message catalogue. The discriminants are the
/// on-wire identifiers; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    // ------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------
    Error = 1,
    Log = 2,
    Version = 3,
    Configure = 4,
    ConfigureAck = 5,
    ConfigureNak = 6,

    // ------------------------------------------------------------------
    // Host controller
    // ------------------------------------------------------------------
    CreateMtc = 7,
    CreatePtc = 8,
    CreateNak = 9,
    HcReady = 10,
    KillProcess = 11,
    ExitHc = 12,

    // ------------------------------------------------------------------
    // Component lifecycle
    // ------------------------------------------------------------------
    CreateReq = 20,
    CreateAck = 21,
    StartReq = 22,
    StartAck = 23,
    Stop = 24,
    StopReq = 25,
    StopAck = 26,
    Kill = 27,
    KillReq = 28,
    KillAck = 29,
    IsRunning = 30,
    Running = 31,
    IsAlive = 32,
    Alive = 33,
    DoneReq = 34,
    DoneAck = 35,
    KilledReq = 36,
    KilledAck = 37,
    CancelDone = 38,
    CancelDoneAck = 39,
    ComponentStatus = 40,

    // ------------------------------------------------------------------
    // Port configuration
    // ------------------------------------------------------------------
    ConnectListen = 41,
    ConnectListenAck = 42,
    Connect = 43,
    ConnectReq = 44,
    Connected = 45,
    ConnectAck = 46,
    ConnectError = 47,
    Disconnect = 48,
    DisconnectReq = 49,
    Disconnected = 50,
    DisconnectAck = 51,
    Map = 52,
    MapReq = 53,
    Mapped = 54,
    MapAck = 55,
    Unmap = 56,
    UnmapReq = 57,
    Unmapped = 58,
    UnmapAck = 59,

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------
    ExecuteControl = 60,
    ExecuteTestcase = 61,
    MtcCreated = 62,
    TestcaseStarted = 63,
    TestcaseFinished = 64,
    MtcReady = 65,
    PtcVerdict = 66,
    Continue = 67,
    ExitMtc = 68,
    Start = 70,
    PtcCreated = 71,
    Stopped = 72,
    StoppedKilled = 73,
    Killed = 74,

    // ------------------------------------------------------------------
    // Debugger
    // ------------------------------------------------------------------
    DebugCommand = 80,
    DebugReturnValue = 81,
    DebugHaltReq = 82,
    DebugContinueReq = 83,
    DebugBatch = 84,
}

impl MsgType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use MsgType::*;
        Some(match v {
            1 => Error,
            2 => Log,
            3 => Version,
            4 => Configure,
            5 => ConfigureAck,
            6 => ConfigureNak,
            7 => CreateMtc,
            8 => CreatePtc,
            9 => CreateNak,
            10 => HcReady,
            11 => KillProcess,
            12 => ExitHc,
            20 => CreateReq,
            21 => CreateAck,
            22 => StartReq,
            23 => StartAck,
            24 => Stop,
            25 => StopReq,
            26 => StopAck,
            27 => Kill,
            28 => KillReq,
            29 => KillAck,
            30 => IsRunning,
            31 => Running,
            32 => IsAlive,
            33 => Alive,
            34 => DoneReq,
            35 => DoneAck,
            36 => KilledReq,
            37 => KilledAck,
            38 => CancelDone,
            39 => CancelDoneAck,
            40 => ComponentStatus,
            41 => ConnectListen,
            42 => ConnectListenAck,
            43 => Connect,
            44 => ConnectReq,
            45 => Connected,
            46 => ConnectAck,
            47 => ConnectError,
            48 => Disconnect,
            49 => DisconnectReq,
            50 => Disconnected,
            51 => DisconnectAck,
            52 => Map,
            53 => MapReq,
            54 => Mapped,
            55 => MapAck,
            56 => Unmap,
            57 => UnmapReq,
            58 => Unmapped,
            59 => UnmapAck,
            60 => ExecuteControl,
            61 => ExecuteTestcase,
            62 => MtcCreated,
            63 => TestcaseStarted,
            64 => TestcaseFinished,
            65 => MtcReady,
            66 => PtcVerdict,
            67 => Continue,
            68 => ExitMtc,
            70 => Start,
            71 => PtcCreated,
            72 => Stopped,
            73 => StoppedKilled,
            74 => Killed,
            80 => DebugCommand,
            81 => DebugReturnValue,
            82 => DebugHaltReq,
            83 => DebugContinueReq,
            84 => DebugBatch,
            _ => return None,
        })
    }
}

// ============================================================================
// Frame assembly
// ============================================================================

/// Start a frame of the given type.
pub fn begin(msg_type: MsgType) -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    buf.begin_frame();
    buf.append_uint(msg_type as u32 as u64);
    buf
}

/// Seal the frame and surrender the wire bytes.
pub fn finish(mut buf: ByteBuffer) -> Result<Vec<u8>> {
    buf.finalize_outgoing_frame()?;
    Ok(buf.as_slice().to_vec())
}

fn simple(msg_type: MsgType) -> Vec<u8> {
    finish(begin(msg_type)).expect("frame was begun")
}

// ============================================================================
// Encoders, field order fixed by the wire contract
// ============================================================================

#[allow(clippy::too_many_arguments)]
pub fn version(
    major: i64,
    minor: i64,
    patch: i64,
    build: i64,
    node_name: &str,
    machine: &str,
    sysname: &str,
    release: &str,
    os_version: &str,
    transports: &[u64],
) -> Vec<u8> {
    let mut buf = begin(MsgType::Version);
    buf.append_int(major);
    buf.append_int(minor);
    buf.append_int(patch);
    buf.append_int(build);
    buf.append_string(Some(node_name));
    buf.append_string(Some(machine));
    buf.append_string(Some(sysname));
    buf.append_string(Some(release));
    buf.append_string(Some(os_version));
    buf.append_uint(transports.len() as u64);
    for t in transports {
        buf.append_uint(*t);
    }
    finish(buf).expect("frame was begun")
}

pub fn configure_ack() -> Vec<u8> {
    simple(MsgType::ConfigureAck)
}

pub fn configure_nak() -> Vec<u8> {
    simple(MsgType::ConfigureNak)
}

pub fn configure(config: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Configure);
    buf.append_string(Some(config));
    finish(buf).expect("frame was begun")
}

pub fn create_nak(compref: i64, reason: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::CreateNak);
    buf.append_int(compref);
    buf.append_string(Some(reason));
    finish(buf).expect("frame was begun")
}

pub fn hc_ready() -> Vec<u8> {
    simple(MsgType::HcReady)
}

pub fn create_req(
    type_module: &str,
    type_name: &str,
    component_name: Option<&str>,
    location: Option<&str>,
    is_alive: bool,
) -> Vec<u8> {
    let mut buf = begin(MsgType::CreateReq);
    buf.append_qualified_name(type_module, type_name);
    buf.append_string(component_name);
    buf.append_string(location);
    buf.append_int(i64::from(is_alive));
    finish(buf).expect("frame was begun")
}

pub fn start_req(compref: i64, module: &str, function: &str, args: &[u8]) -> Vec<u8> {
    let mut buf = begin(MsgType::StartReq);
    buf.append_int(compref);
    buf.append_qualified_name(module, function);
    buf.append_bytes(args);
    finish(buf).expect("frame was begun")
}

fn compref_only(msg_type: MsgType, compref: i64) -> Vec<u8> {
    let mut buf = begin(msg_type);
    buf.append_int(compref);
    finish(buf).expect("frame was begun")
}

pub fn stop_req(compref: i64) -> Vec<u8> {
    compref_only(MsgType::StopReq, compref)
}

pub fn kill_req(compref: i64) -> Vec<u8> {
    compref_only(MsgType::KillReq, compref)
}

pub fn is_running(compref: i64) -> Vec<u8> {
    compref_only(MsgType::IsRunning, compref)
}

pub fn is_alive(compref: i64) -> Vec<u8> {
    compref_only(MsgType::IsAlive, compref)
}

pub fn done_req(compref: i64) -> Vec<u8> {
    compref_only(MsgType::DoneReq, compref)
}

pub fn killed_req(compref: i64) -> Vec<u8> {
    compref_only(MsgType::KilledReq, compref)
}

pub fn cancel_done_ack(compref: i64) -> Vec<u8> {
    compref_only(MsgType::CancelDoneAck, compref)
}

pub fn connect_req(src: i64, src_port: &str, dst: i64, dst_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::ConnectReq);
    buf.append_int(src);
    buf.append_string(Some(src_port));
    buf.append_int(dst);
    buf.append_string(Some(dst_port));
    finish(buf).expect("frame was begun")
}

pub fn connect_listen_ack_inet(
    local_port: &str,
    remote_comp: i64,
    remote_port: &str,
    local_addr: &std::net::SocketAddr,
) -> Vec<u8> {
    let mut buf = begin(MsgType::ConnectListenAck);
    buf.append_string(Some(local_port));
    buf.append_int(remote_comp);
    buf.append_string(Some(remote_port));
    buf.append_uint(TRANSPORT_INET_STREAM);
    buf.append_string(Some(&local_addr.to_string()));
    finish(buf).expect("frame was begun")
}

pub fn connect_listen_ack_unix(
    local_port: &str,
    remote_comp: i64,
    remote_port: &str,
    socket_path: &str,
) -> Vec<u8> {
    let mut buf = begin(MsgType::ConnectListenAck);
    buf.append_string(Some(local_port));
    buf.append_int(remote_comp);
    buf.append_string(Some(remote_port));
    buf.append_uint(TRANSPORT_UNIX_STREAM);
    buf.append_string(Some(socket_path));
    finish(buf).expect("frame was begun")
}

pub fn connected(local_port: &str, remote_comp: i64, remote_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Connected);
    buf.append_string(Some(local_port));
    buf.append_int(remote_comp);
    buf.append_string(Some(remote_port));
    finish(buf).expect("frame was begun")
}

pub fn connect_error(local_port: &str, remote_comp: i64, remote_port: &str, reason: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::ConnectError);
    buf.append_string(Some(local_port));
    buf.append_int(remote_comp);
    buf.append_string(Some(remote_port));
    buf.append_string(Some(reason));
    finish(buf).expect("frame was begun")
}

pub fn disconnect_req(src: i64, src_port: &str, dst: i64, dst_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::DisconnectReq);
    buf.append_int(src);
    buf.append_string(Some(src_port));
    buf.append_int(dst);
    buf.append_string(Some(dst_port));
    finish(buf).expect("frame was begun")
}

pub fn disconnected(local_port: &str, remote_comp: i64, remote_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Disconnected);
    buf.append_string(Some(local_port));
    buf.append_int(remote_comp);
    buf.append_string(Some(remote_port));
    finish(buf).expect("frame was begun")
}

pub fn map_req(src: i64, src_port: &str, system_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::MapReq);
    buf.append_int(src);
    buf.append_string(Some(src_port));
    buf.append_string(Some(system_port));
    finish(buf).expect("frame was begun")
}

pub fn mapped(local_port: &str, system_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Mapped);
    buf.append_string(Some(local_port));
    buf.append_string(Some(system_port));
    finish(buf).expect("frame was begun")
}

pub fn unmap_req(src: i64, src_port: &str, system_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::UnmapReq);
    buf.append_int(src);
    buf.append_string(Some(src_port));
    buf.append_string(Some(system_port));
    finish(buf).expect("frame was begun")
}

pub fn unmapped(local_port: &str, system_port: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Unmapped);
    buf.append_string(Some(local_port));
    buf.append_string(Some(system_port));
    finish(buf).expect("frame was begun")
}

pub fn mtc_created() -> Vec<u8> {
    simple(MsgType::MtcCreated)
}

pub fn testcase_started(
    tc_module: &str,
    tc_name: &str,
    mtc_type_module: &str,
    mtc_type_name: &str,
    system_type_module: &str,
    system_type_name: &str,
) -> Vec<u8> {
    let mut buf = begin(MsgType::TestcaseStarted);
    buf.append_qualified_name(tc_module, tc_name);
    buf.append_qualified_name(mtc_type_module, mtc_type_name);
    buf.append_qualified_name(system_type_module, system_type_name);
    finish(buf).expect("frame was begun")
}

pub fn testcase_finished(verdict: Verdict, reason: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::TestcaseFinished);
    buf.append_int(verdict as i64);
    buf.append_string(Some(reason));
    finish(buf).expect("frame was begun")
}

pub fn mtc_ready() -> Vec<u8> {
    simple(MsgType::MtcReady)
}

pub fn ptc_created(compref: i64) -> Vec<u8> {
    compref_only(MsgType::PtcCreated, compref)
}

pub fn stopped(return_type: Option<&str>, return_value: &[u8]) -> Vec<u8> {
    let mut buf = begin(MsgType::Stopped);
    buf.append_string(return_type);
    buf.append_bytes(return_value);
    finish(buf).expect("frame was begun")
}

pub fn stopped_killed(
    verdict: Verdict,
    reason: &str,
    return_type: Option<&str>,
    return_value: &[u8],
) -> Vec<u8> {
    let mut buf = begin(MsgType::StoppedKilled);
    buf.append_int(verdict as i64);
    buf.append_string(Some(reason));
    buf.append_string(return_type);
    buf.append_bytes(return_value);
    finish(buf).expect("frame was begun")
}

pub fn killed(verdict: Verdict, reason: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Killed);
    buf.append_int(verdict as i64);
    buf.append_string(Some(reason));
    finish(buf).expect("frame was begun")
}

pub fn log_message(seconds: i64, microseconds: i64, severity: i64, text: &[u8]) -> Vec<u8> {
    let mut buf = begin(MsgType::Log);
    buf.append_int(seconds);
    buf.append_int(microseconds);
    buf.append_int(severity);
    buf.append_uint(text.len() as u64);
    buf.append_bytes(text);
    finish(buf).expect("frame was begun")
}

pub fn error_message(text: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::Error);
    buf.append_string(Some(text));
    finish(buf).expect("frame was begun")
}

pub fn debug_return_value(return_type: i64, timestamp: Option<(i64, i64)>, message: Option<&str>) -> Vec<u8> {
    let mut buf = begin(MsgType::DebugReturnValue);
    buf.append_int(return_type);
    if let (Some((sec, usec)), Some(msg)) = (timestamp, message) {
        buf.append_int(sec);
        buf.append_int(usec);
        buf.append_string(Some(msg));
    }
    finish(buf).expect("frame was begun")
}

pub fn debug_halt_req() -> Vec<u8> {
    simple(MsgType::DebugHaltReq)
}

pub fn debug_continue_req() -> Vec<u8> {
    simple(MsgType::DebugContinueReq)
}

pub fn debug_batch(batch_file: &str) -> Vec<u8> {
    let mut buf = begin(MsgType::DebugBatch);
    buf.append_string(Some(batch_file));
    finish(buf).expect("frame was begun")
}

// ============================================================================
// Inbound dispatch helpers
// ============================================================================

/// Open the next frame for dispatch. Returns the raw type identifier and
/// the frame's end position, or `None` when no complete frame is buffered.
pub fn open_dispatch(buf: &mut ByteBuffer) -> Result<Option<(u32, usize)>> {
    if !buf.peek_frame_ready() {
        return Ok(None);
    }
    let end = buf.open_frame()?;
    let raw = buf.read_uint()? as u32;
    Ok(Some((raw, end)))
}

/// Log and consume a frame whose type nobody recognizes.
pub fn consume_unknown(buf: &mut ByteBuffer, raw_type: u32, msg_end: usize) -> Result<()> {
    let dump: String = buf
        .slice_to(msg_end)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    log::warn!(
        "[CTRL] unsupported control message: type {} data (hexadecimal): {}",
        raw_type,
        dump
    );
    buf.advance_past_current_frame()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(bytes: &[u8]) -> (ByteBuffer, MsgType, usize) {
        let mut buf = ByteBuffer::new();
        buf.append_bytes(bytes);
        let (raw, end) = open_dispatch(&mut buf).unwrap().expect("complete frame");
        let msg_type = MsgType::from_u32(raw).expect("known type");
        (buf, msg_type, end)
    }

    #[test]
    fn test_simple_frames_round_trip() {
        for (bytes, expected) in [
            (configure_ack(), MsgType::ConfigureAck),
            (configure_nak(), MsgType::ConfigureNak),
            (hc_ready(), MsgType::HcReady),
            (mtc_created(), MsgType::MtcCreated),
            (mtc_ready(), MsgType::MtcReady),
            (debug_halt_req(), MsgType::DebugHaltReq),
            (debug_continue_req(), MsgType::DebugContinueReq),
        ] {
            let (mut buf, t, _end) = open(&bytes);
            assert_eq!(t, expected);
            buf.advance_past_current_frame().unwrap();
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_version_round_trip() {
        let bytes = version(
            9,
            1,
            0,
            421,
            "host-a",
            "x86_64",
            "Linux",
            "6.1",
            "#1 SMP",
            &[TRANSPORT_LOCAL, TRANSPORT_INET_STREAM, TRANSPORT_UNIX_STREAM],
        );
        let (mut buf, t, _end) = open(&bytes);
        assert_eq!(t, MsgType::Version);
        assert_eq!(buf.read_int().unwrap(), 9);
        assert_eq!(buf.read_int().unwrap(), 1);
        assert_eq!(buf.read_int().unwrap(), 0);
        assert_eq!(buf.read_int().unwrap(), 421);
        assert_eq!(buf.read_string().unwrap(), "host-a");
        assert_eq!(buf.read_string().unwrap(), "x86_64");
        assert_eq!(buf.read_string().unwrap(), "Linux");
        assert_eq!(buf.read_string().unwrap(), "6.1");
        assert_eq!(buf.read_string().unwrap(), "#1 SMP");
        assert_eq!(buf.read_uint().unwrap(), 3);
        assert_eq!(buf.read_uint().unwrap(), TRANSPORT_LOCAL);
        assert_eq!(buf.read_uint().unwrap(), TRANSPORT_INET_STREAM);
        assert_eq!(buf.read_uint().unwrap(), TRANSPORT_UNIX_STREAM);
    }

    #[test]
    fn test_create_req_round_trip() {
        let bytes = create_req("MyModule", "MyComponent", Some("worker-1"), None, true);
        let (mut buf, t, _end) = open(&bytes);
        assert_eq!(t, MsgType::CreateReq);
        assert_eq!(
            buf.read_qualified_name().unwrap(),
            ("MyModule".to_string(), "MyComponent".to_string())
        );
        assert_eq!(buf.read_string().unwrap(), "worker-1");
        assert_eq!(buf.read_string().unwrap(), "");
        assert_eq!(buf.read_int().unwrap(), 1);
    }

    #[test]
    fn test_start_req_carries_opaque_args() {
        let bytes = start_req(3, "Mod", "behavior", &[0xDE, 0xAD]);
        let (mut buf, t, end) = open(&bytes);
        assert_eq!(t, MsgType::StartReq);
        assert_eq!(buf.read_int().unwrap(), 3);
        let _ = buf.read_qualified_name().unwrap();
        assert_eq!(buf.slice_to(end), &[0xDE, 0xAD]);
    }

    #[test]
    fn test_testcase_finished_verdict() {
        let bytes = testcase_finished(Verdict::Inconc, "guard timer expired");
        let (mut buf, t, _end) = open(&bytes);
        assert_eq!(t, MsgType::TestcaseFinished);
        assert_eq!(Verdict::from_i64(buf.read_int().unwrap()), Some(Verdict::Inconc));
        assert_eq!(buf.read_string().unwrap(), "guard timer expired");
    }

    #[test]
    fn test_log_message_payload() {
        let bytes = log_message(1_700_000_000, 250_000, 5, b"component started");
        let (mut buf, t, _end) = open(&bytes);
        assert_eq!(t, MsgType::Log);
        assert_eq!(buf.read_int().unwrap(), 1_700_000_000);
        assert_eq!(buf.read_int().unwrap(), 250_000);
        assert_eq!(buf.read_int().unwrap(), 5);
        let len = buf.read_uint().unwrap() as usize;
        assert_eq!(buf.read_raw(len).unwrap(), b"component started");
    }

    #[test]
    fn test_unknown_type_is_consumed() {
        let mut buf = ByteBuffer::new();
        buf.begin_frame();
        buf.append_uint(9999);
        buf.append_bytes(&[1, 2, 3]);
        buf.finalize_outgoing_frame().unwrap();
        let (raw, end) = open_dispatch(&mut buf).unwrap().unwrap();
        assert_eq!(MsgType::from_u32(raw), None);
        consume_unknown(&mut buf, raw, end).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_every_discriminant_survives_round_trip() {
        use MsgType::*;
        for t in [
            Error, Log, Version, Configure, ConfigureAck, ConfigureNak, CreateMtc, CreatePtc,
            CreateNak, HcReady, KillProcess, ExitHc, CreateReq, CreateAck, StartReq, StartAck,
            Stop, StopReq, StopAck, Kill, KillReq, KillAck, IsRunning, Running, IsAlive, Alive,
            DoneReq, DoneAck, KilledReq, KilledAck, CancelDone, CancelDoneAck, ComponentStatus,
            ConnectListen, ConnectListenAck, Connect, ConnectReq, Connected, ConnectAck,
            ConnectError, Disconnect, DisconnectReq, Disconnected, DisconnectAck, Map, MapReq,
            Mapped, MapAck, Unmap, UnmapReq, Unmapped, UnmapAck, ExecuteControl, ExecuteTestcase,
            MtcCreated, TestcaseStarted, TestcaseFinished, MtcReady, PtcVerdict, Continue,
            ExitMtc, Start, PtcCreated, Stopped, StoppedKilled, Killed, DebugCommand,
            DebugReturnValue, DebugHaltReq, DebugContinueReq, DebugBatch,
        ] {
            assert_eq!(MsgType::from_u32(t as u32), Some(t));
        }
    }
}
