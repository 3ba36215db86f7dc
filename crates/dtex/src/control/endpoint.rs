// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane endpoint: one process, one role, one controller socket.
//!
//! The endpoint drives a component's lifecycle (configure, execute,
//! stop/kill, tear down) against the central controller. Inbound frames
//! are dispatched in arrival order through the role's message table;
//! outbound frames are synchronous (partial writes resolve through the
//! reactor's writability wait before the send call returns).
//!
//! The control socket is an ordinary mux connection carrying the 4-byte
//! big-endian length framing; when the controller is co-located, a
//! Unix-domain rendezvous at `/tmp/dtex-mctr-<port>` is attempted before
//! falling back to TCP.
//!
//! Test execution itself (component processes, behaviors, verdict
//! bookkeeping, the debugger adjunct) lives behind [`TestHarness`]; the
//! endpoint owns the protocol and the state machine, nothing else.

use std::cell::Cell;
use std::ffi::CStr;
use std::net::TcpStream;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::buffer::ByteBuffer;
use crate::config::{CALL_INTERVAL_INCREMENT, CONTROLLER_SOCKET_PREFIX, INITIAL_CALL_INTERVAL};
use crate::control::codec::{self, MsgType, Verdict};
use crate::error::{Error, ErrorKind, Result};
use crate::mux::events::{PortEvent, Proto};
use crate::mux::framing;
use crate::mux::TransportMux;
use crate::pool::ConnId;
use crate::reactor::{EventHandler, HandlerId, Reactor};
use crate::timer::TimerRegistry;

/// Protocol version advertised to the controller.
pub const PROTOCOL_MAJOR: i64 = 2;
pub const PROTOCOL_MINOR: i64 = 1;
pub const PROTOCOL_PATCH: i64 = 0;
pub const PROTOCOL_BUILD: i64 = 0;

/// Well-known component references.
pub const NULL_COMPREF: i64 = 0;
pub const MTC_COMPREF: i64 = 1;
pub const SYSTEM_COMPREF: i64 = 2;
pub const FIRST_PTC_COMPREF: i64 = 3;
pub const ANY_COMPREF: i64 = -1;
pub const ALL_COMPREF: i64 = -2;

/// The one role this process plays on its control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    HostController,
    MainComponent,
    ParallelComponent,
}

/// Lifecycle state of the endpoint. Transitions are driven only by inbound
/// control messages and by local test-execution events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    HcIdle,
    HcConfiguring,
    HcActive,
    HcOverloaded,
    HcExit,
    MtcInitial,
    MtcIdle,
    MtcControlpart,
    MtcTestcase,
    MtcPaused,
    MtcTerminatingTestcase,
    MtcTerminatingExecution,
    MtcStart,
    MtcStop,
    MtcKill,
    MtcConnect,
    MtcDisconnect,
    MtcMap,
    MtcUnmap,
    MtcExit,
    PtcInitial,
    PtcIdle,
    PtcFunction,
    PtcStart,
    PtcStop,
    PtcKill,
    PtcConnect,
    PtcDisconnect,
    PtcMap,
    PtcUnmap,
    PtcStopped,
    PtcExit,
}

impl ComponentState {
    /// States in which a test case is being executed and control-socket
    /// loss must interrupt it through the guard timer.
    fn is_executing(self) -> bool {
        use ComponentState::*;
        matches!(
            self,
            MtcControlpart
                | MtcTestcase
                | MtcTerminatingTestcase
                | MtcStart
                | MtcStop
                | MtcKill
                | MtcConnect
                | MtcDisconnect
                | MtcMap
                | MtcUnmap
                | PtcFunction
                | PtcStart
                | PtcStop
                | PtcKill
                | PtcConnect
                | PtcDisconnect
                | PtcMap
                | PtcUnmap
        )
    }
}

// ============================================================================
// Test-layer seam
// ============================================================================

/// Hooks into the test-execution layer. The endpoint calls these as it
/// dispatches control messages; a default implementation does nothing, so
/// protocol tests can run without a test runtime.
#[allow(unused_variables)]
pub trait TestHarness {
    /// Apply a configuration string. `true` acknowledges it.
    fn process_config_string(&mut self, config: &str) -> bool {
        true
    }

    fn create_mtc(&mut self) {}

    #[allow(clippy::too_many_arguments)]
    fn create_ptc(
        &mut self,
        compref: i64,
        type_module: &str,
        type_name: &str,
        component_name: &str,
        is_alive: bool,
        testcase_module: &str,
        testcase_name: &str,
    ) {
    }

    fn kill_process(&mut self, compref: i64) {}
    fn create_ack(&mut self, compref: i64) {}
    fn running(&mut self, answer: bool) {}
    fn alive(&mut self, answer: bool) {}
    fn done_ack(&mut self, answer: bool, return_type: &str, return_value: &[u8]) {}
    fn killed_ack(&mut self, answer: bool) {}
    fn cancel_done(&mut self, compref: i64) {}
    fn component_done(&mut self, compref: i64, return_type: &str, return_value: &[u8]) {}
    fn component_killed(&mut self, compref: i64) {}

    fn connect_listen(
        &mut self,
        local_port: &str,
        remote_comp: i64,
        remote_comp_name: &str,
        remote_port: &str,
        transport: u64,
    ) {
    }

    fn connect_port(
        &mut self,
        local_port: &str,
        remote_comp: i64,
        remote_comp_name: &str,
        remote_port: &str,
        setup: &[u8],
    ) {
    }

    fn disconnect_port(&mut self, local_port: &str, remote_comp: i64, remote_port: &str) {}
    fn map_port(&mut self, local_port: &str, system_port: &str) {}
    fn unmap_port(&mut self, local_port: &str, system_port: &str) {}

    /// Run a module's control part. Errors abort it, like a failed testcase.
    fn execute_control(&mut self, module: &str) -> Result<()> {
        Ok(())
    }

    fn execute_testcase(&mut self, module: &str, testcase: &str) -> Result<()> {
        Ok(())
    }

    fn execute_all_testcases(&mut self, module: &str) -> Result<()> {
        Ok(())
    }

    fn start_function(&mut self, module: &str, function: &str, args: &[u8]) {}
    fn process_kill(&mut self) {}
    fn stop_execution(&mut self) {}
    fn ptc_verdict(&mut self, payload: &[u8]) {}
    fn error_from_controller(&mut self, message: &str) {}

    /// Overload probing: `true` while the host is still overloaded.
    fn overload_check(&mut self) -> bool {
        false
    }

    // Debugger adjunct.
    fn debugger_halted(&self) -> bool {
        false
    }

    fn debug_command(&mut self, command: i64, arguments: &[String]) {}
}

/// Harness that accepts everything and executes nothing.
pub struct NullHarness;

impl TestHarness for NullHarness {}

// ============================================================================
// Overload probe timer
// ============================================================================

/// Reactor-timer shim: the periodic overload probe only flips a flag the
/// endpoint picks up on its next event pass.
struct OverloadProbe {
    ticked: Rc<Cell<bool>>,
}

impl EventHandler for OverloadProbe {
    fn handle_fd_event(&mut self, _: &mut Reactor, _: RawFd, _: bool, _: bool, _: bool) {}

    fn handle_timeout(&mut self, _: &mut Reactor, _since: f64) {
        self.ticked.set(true);
    }

    fn label(&self) -> &str {
        "control connection"
    }
}

// ============================================================================
// Endpoint
// ============================================================================

pub struct Endpoint {
    role: Role,
    state: ComponentState,
    mux: TransportMux,
    harness: Box<dyn TestHarness>,
    control: Option<ConnId>,
    incoming: ByteBuffer,
    /// User-plane events passed through untouched for the test layer.
    user_events: std::collections::VecDeque<PortEvent>,
    controller_addr: Option<(String, u16)>,
    local_host: Option<String>,
    call_interval: f64,
    probe: HandlerId,
    probe_ticked: Rc<Cell<bool>>,
}

impl Endpoint {
    pub fn new(
        reactor: &mut Reactor,
        role: Role,
        mux: TransportMux,
        harness: Box<dyn TestHarness>,
    ) -> Self {
        let state = match role {
            Role::HostController => ComponentState::HcIdle,
            Role::MainComponent => ComponentState::MtcInitial,
            Role::ParallelComponent => ComponentState::PtcInitial,
        };
        let ticked = Rc::new(Cell::new(false));
        let probe = reactor.register_handler(Rc::new(std::cell::RefCell::new(OverloadProbe {
            ticked: ticked.clone(),
        })));
        Self {
            role,
            state,
            mux,
            harness,
            control: None,
            incoming: ByteBuffer::new(),
            user_events: std::collections::VecDeque::new(),
            controller_addr: None,
            local_host: None,
            call_interval: 0.0,
            probe,
            probe_ticked: ticked,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn set_state(&mut self, state: ComponentState) {
        log::debug!("[CTRL] state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_some()
    }

    pub fn control_connection(&self) -> Option<ConnId> {
        self.control
    }

    pub fn mux(&self) -> &TransportMux {
        &self.mux
    }

    /// Next user-plane event the dispatch loop set aside.
    pub fn poll_user_event(&mut self) -> Option<PortEvent> {
        self.user_events.pop_front()
    }

    pub fn set_controller_address(&mut self, host: &str, tcp_port: u16) {
        self.controller_addr = Some((host.to_string(), tcp_port));
    }

    pub fn set_local_address(&mut self, host: &str) {
        self.local_host = Some(host.to_string());
    }

    // ------------------------------------------------------------------
    // Controller rendezvous
    // ------------------------------------------------------------------

    /// Connect the control socket. A co-located controller is reached over
    /// its Unix-domain rendezvous first; TCP is the fallback.
    pub fn connect_to_controller(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.is_connected() {
            return Err(Error::new(
                ErrorKind::General,
                "there is already a control connection to the controller",
            ));
        }
        let (host, port) = self.controller_addr.clone().ok_or_else(|| {
            Error::new(ErrorKind::General, "the controller address has not been set")
        })?;

        if self.controller_is_local(&host) {
            let path = format!("{}{}", CONTROLLER_SOCKET_PREFIX, port);
            match UnixStream::connect(&path) {
                Ok(stream) => {
                    let fd = stream.into_raw_fd();
                    let conn = self.adopt_control(reactor, fd, Proto::Unix)?;
                    self.control = Some(conn);
                    log::info!("[CTRL] connected to the controller via {}", path);
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("[CTRL] local rendezvous {} unavailable: {}", path, e);
                }
            }
        }

        let stream = TcpStream::connect((host.as_str(), port)).map_err(|e| {
            Error::with_errno(
                ErrorKind::Socket,
                format!("connecting to the controller at {}:{} failed", host, port),
                e.raw_os_error().unwrap_or(0),
            )
        })?;
        stream.set_nodelay(true).map_err(Error::from)?;
        let fd = stream.into_raw_fd();
        grow_send_buffer(fd);
        let conn = self.adopt_control(reactor, fd, Proto::Tcp)?;
        self.control = Some(conn);
        log::info!("[CTRL] connected to the controller at {}:{}", host, port);
        Ok(())
    }

    fn controller_is_local(&self, host: &str) -> bool {
        if Some(host) == self.local_host.as_deref() {
            return true;
        }
        match host.parse::<std::net::IpAddr>() {
            Ok(ip) => ip.is_loopback(),
            Err(_) => host == "localhost",
        }
    }

    fn adopt_control(&mut self, reactor: &mut Reactor, fd: RawFd, proto: Proto) -> Result<ConnId> {
        self.mux.adopt_stream(
            reactor,
            fd,
            proto,
            framing::length_field_framer,
            framing::control_framer_args(),
        )
    }

    /// Orderly teardown of the control connection.
    pub fn disconnect(&mut self, reactor: &mut Reactor) {
        if let Some(conn) = self.control.take() {
            let _ = self.mux.close(reactor, conn);
            self.incoming.reset();
            self.call_interval = 0.0;
            reactor.set_timer(self.probe, 0.0, true, true);
            log::info!("[CTRL] disconnected from the controller");
        }
    }

    /// Control-socket loss: the role moves to its exit state and a running
    /// test case is interrupted through the guard timer.
    fn on_control_closed(&mut self, reactor: &mut Reactor, timers: &mut TimerRegistry) -> Error {
        self.control = None;
        self.incoming.reset();
        reactor.set_timer(self.probe, 0.0, true, true);
        if self.state.is_executing() {
            let _ = timers.start_guard(0.0);
        }
        self.set_state(match self.role {
            Role::HostController => ComponentState::HcExit,
            Role::MainComponent => ComponentState::MtcExit,
            Role::ParallelComponent => ComponentState::PtcExit,
        });
        Error::new(
            ErrorKind::General,
            "control connection was closed unexpectedly by the controller",
        )
    }

    // ------------------------------------------------------------------
    // Overload probing
    // ------------------------------------------------------------------

    pub fn enable_periodic_call(&mut self, reactor: &mut Reactor) {
        self.call_interval = INITIAL_CALL_INTERVAL;
        reactor.set_timer(self.probe, self.call_interval, true, false);
    }

    pub fn increase_call_interval(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.call_interval <= 0.0 {
            return Err(Error::new(
                ErrorKind::General,
                "increase_call_interval was called while the call interval is not set",
            ));
        }
        self.call_interval *= CALL_INTERVAL_INCREMENT;
        reactor.set_timer(self.probe, self.call_interval, true, false);
        Ok(())
    }

    pub fn disable_periodic_call(&mut self, reactor: &mut Reactor) {
        reactor.set_timer(self.probe, 0.0, true, true);
        self.call_interval = 0.0;
    }

    /// Current overload-probing interval; 0 while probing is off.
    pub fn call_interval(&self) -> f64 {
        self.call_interval
    }

    fn handle_probe_tick(&mut self, reactor: &mut Reactor) -> Result<()> {
        if !self.probe_ticked.replace(false) {
            return Ok(());
        }
        if self.state == ComponentState::HcOverloaded {
            if self.harness.overload_check() {
                self.increase_call_interval(reactor)?;
            } else {
                self.disable_periodic_call(reactor);
                self.set_state(ComponentState::HcActive);
                self.send_frame(reactor, codec::hc_ready())?;
            }
        } else {
            log::warn!("[CTRL] unexpected timeout on the control connection");
            self.disable_periodic_call(reactor);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound frames
    // ------------------------------------------------------------------

    fn send_frame(&mut self, reactor: &mut Reactor, bytes: Vec<u8>) -> Result<()> {
        let conn = self.control.ok_or_else(|| {
            Error::new(
                ErrorKind::General,
                "trying to send a control message, but the control connection is down",
            )
        })?;
        self.mux.send_fully(reactor, conn, &bytes)
    }

    /// Advertise protocol version, host identity and supported transports.
    pub fn send_version(&mut self, reactor: &mut Reactor) -> Result<()> {
        let (node, machine, sysname, release, version) = host_info();
        let mut transports = vec![codec::TRANSPORT_LOCAL, codec::TRANSPORT_INET_STREAM];
        if unix_stream_supported() {
            transports.push(codec::TRANSPORT_UNIX_STREAM);
        }
        let frame = codec::version(
            PROTOCOL_MAJOR,
            PROTOCOL_MINOR,
            PROTOCOL_PATCH,
            PROTOCOL_BUILD,
            &node,
            &machine,
            &sysname,
            &release,
            &version,
            &transports,
        );
        self.send_frame(reactor, frame)
    }

    pub fn send_configure_ack(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::configure_ack())
    }

    pub fn send_configure_nak(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::configure_nak())
    }

    pub fn send_create_nak(&mut self, reactor: &mut Reactor, compref: i64, reason: &str) -> Result<()> {
        self.send_frame(reactor, codec::create_nak(compref, reason))
    }

    pub fn send_hc_ready(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::hc_ready())
    }

    pub fn send_create_req(
        &mut self,
        reactor: &mut Reactor,
        type_module: &str,
        type_name: &str,
        component_name: Option<&str>,
        location: Option<&str>,
        is_alive: bool,
    ) -> Result<()> {
        self.send_frame(
            reactor,
            codec::create_req(type_module, type_name, component_name, location, is_alive),
        )
    }

    /// Ask the controller to start a behavior on a component; the endpoint
    /// enters the corresponding wait state until the ack arrives.
    pub fn send_start_req(
        &mut self,
        reactor: &mut Reactor,
        compref: i64,
        module: &str,
        function: &str,
        args: &[u8],
    ) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcStart, ComponentState::PtcStart);
        self.send_frame(reactor, codec::start_req(compref, module, function, args))
    }

    pub fn send_stop_req(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcStop, ComponentState::PtcStop);
        self.send_frame(reactor, codec::stop_req(compref))
    }

    pub fn send_kill_req(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcKill, ComponentState::PtcKill);
        self.send_frame(reactor, codec::kill_req(compref))
    }

    pub fn send_is_running(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.send_frame(reactor, codec::is_running(compref))
    }

    pub fn send_is_alive(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.send_frame(reactor, codec::is_alive(compref))
    }

    pub fn send_done_req(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.send_frame(reactor, codec::done_req(compref))
    }

    pub fn send_killed_req(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.send_frame(reactor, codec::killed_req(compref))
    }

    pub fn send_connect_req(
        &mut self,
        reactor: &mut Reactor,
        src: i64,
        src_port: &str,
        dst: i64,
        dst_port: &str,
    ) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcConnect, ComponentState::PtcConnect);
        self.send_frame(reactor, codec::connect_req(src, src_port, dst, dst_port))
    }

    pub fn send_connect_listen_ack_inet(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        remote_comp: i64,
        remote_port: &str,
        local_addr: &std::net::SocketAddr,
    ) -> Result<()> {
        self.send_frame(
            reactor,
            codec::connect_listen_ack_inet(local_port, remote_comp, remote_port, local_addr),
        )
    }

    pub fn send_connect_listen_ack_unix(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        remote_comp: i64,
        remote_port: &str,
        socket_path: &str,
    ) -> Result<()> {
        self.send_frame(
            reactor,
            codec::connect_listen_ack_unix(local_port, remote_comp, remote_port, socket_path),
        )
    }

    pub fn send_connected(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        remote_comp: i64,
        remote_port: &str,
    ) -> Result<()> {
        self.send_frame(reactor, codec::connected(local_port, remote_comp, remote_port))
    }

    pub fn send_connect_error(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        remote_comp: i64,
        remote_port: &str,
        reason: &str,
    ) -> Result<()> {
        self.send_frame(
            reactor,
            codec::connect_error(local_port, remote_comp, remote_port, reason),
        )
    }

    pub fn send_disconnect_req(
        &mut self,
        reactor: &mut Reactor,
        src: i64,
        src_port: &str,
        dst: i64,
        dst_port: &str,
    ) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcDisconnect, ComponentState::PtcDisconnect);
        self.send_frame(reactor, codec::disconnect_req(src, src_port, dst, dst_port))
    }

    pub fn send_disconnected(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        remote_comp: i64,
        remote_port: &str,
    ) -> Result<()> {
        self.send_frame(reactor, codec::disconnected(local_port, remote_comp, remote_port))
    }

    pub fn send_map_req(
        &mut self,
        reactor: &mut Reactor,
        src: i64,
        src_port: &str,
        system_port: &str,
    ) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcMap, ComponentState::PtcMap);
        self.send_frame(reactor, codec::map_req(src, src_port, system_port))
    }

    pub fn send_mapped(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        system_port: &str,
    ) -> Result<()> {
        self.send_frame(reactor, codec::mapped(local_port, system_port))
    }

    pub fn send_unmap_req(
        &mut self,
        reactor: &mut Reactor,
        src: i64,
        src_port: &str,
        system_port: &str,
    ) -> Result<()> {
        self.enter_wait_state(ComponentState::MtcUnmap, ComponentState::PtcUnmap);
        self.send_frame(reactor, codec::unmap_req(src, src_port, system_port))
    }

    pub fn send_unmapped(
        &mut self,
        reactor: &mut Reactor,
        local_port: &str,
        system_port: &str,
    ) -> Result<()> {
        self.send_frame(reactor, codec::unmapped(local_port, system_port))
    }

    pub fn send_mtc_created(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::mtc_created())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_testcase_started(
        &mut self,
        reactor: &mut Reactor,
        tc_module: &str,
        tc_name: &str,
        mtc_type_module: &str,
        mtc_type_name: &str,
        system_type_module: &str,
        system_type_name: &str,
    ) -> Result<()> {
        self.send_frame(
            reactor,
            codec::testcase_started(
                tc_module,
                tc_name,
                mtc_type_module,
                mtc_type_name,
                system_type_module,
                system_type_name,
            ),
        )
    }

    pub fn send_testcase_finished(
        &mut self,
        reactor: &mut Reactor,
        verdict: Verdict,
        reason: &str,
    ) -> Result<()> {
        self.send_frame(reactor, codec::testcase_finished(verdict, reason))
    }

    pub fn send_mtc_ready(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::mtc_ready())
    }

    pub fn send_ptc_created(&mut self, reactor: &mut Reactor, compref: i64) -> Result<()> {
        self.send_frame(reactor, codec::ptc_created(compref))
    }

    pub fn send_stopped(
        &mut self,
        reactor: &mut Reactor,
        return_type: Option<&str>,
        return_value: &[u8],
    ) -> Result<()> {
        self.send_frame(reactor, codec::stopped(return_type, return_value))
    }

    pub fn send_stopped_killed(
        &mut self,
        reactor: &mut Reactor,
        verdict: Verdict,
        reason: &str,
        return_type: Option<&str>,
        return_value: &[u8],
    ) -> Result<()> {
        self.send_frame(
            reactor,
            codec::stopped_killed(verdict, reason, return_type, return_value),
        )
    }

    pub fn send_killed(&mut self, reactor: &mut Reactor, verdict: Verdict, reason: &str) -> Result<()> {
        self.send_frame(reactor, codec::killed(verdict, reason))
    }

    /// Forward a log record to the controller. Returns `true` when the
    /// record does not additionally need the local console.
    pub fn send_log(
        &mut self,
        reactor: &mut Reactor,
        severity: i64,
        message: &[u8],
    ) -> bool {
        if self.is_connected() {
            let (sec, usec) = wall_clock();
            if self
                .send_frame(reactor, codec::log_message(sec, usec, severity, message))
                .is_err()
            {
                return false;
            }
            // Before configuration the controller may still reject us over a
            // version mismatch; keep echoing to the console until then.
            self.state != ComponentState::HcIdle
        } else {
            use ComponentState::*;
            matches!(self.state, HcExit | MtcInitial | MtcExit | PtcInitial | PtcExit)
        }
    }

    pub fn send_error(&mut self, reactor: &mut Reactor, message: &str) -> Result<()> {
        self.send_frame(reactor, codec::error_message(message))
    }

    pub fn send_debug_return_value(
        &mut self,
        reactor: &mut Reactor,
        return_type: i64,
        message: Option<&str>,
    ) -> Result<()> {
        let timestamp = message.is_some().then(wall_clock);
        self.send_frame(reactor, codec::debug_return_value(return_type, timestamp, message))
    }

    pub fn send_debug_halt_req(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::debug_halt_req())
    }

    pub fn send_debug_continue_req(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.send_frame(reactor, codec::debug_continue_req())
    }

    pub fn send_debug_batch(&mut self, reactor: &mut Reactor, batch_file: &str) -> Result<()> {
        self.send_frame(reactor, codec::debug_batch(batch_file))
    }

    fn enter_wait_state(&mut self, mtc_wait: ComponentState, ptc_wait: ComponentState) {
        let next = match self.state {
            ComponentState::MtcTestcase => mtc_wait,
            ComponentState::PtcFunction => ptc_wait,
            other => other,
        };
        if next != self.state {
            self.set_state(next);
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Absorb mux events: control frames feed the dispatch buffer, user
    /// traffic is set aside for the test layer, loss of the control socket
    /// is escalated.
    fn absorb_mux_events(
        &mut self,
        reactor: &mut Reactor,
        timers: &mut TimerRegistry,
    ) -> Result<()> {
        while let Some(event) = self.mux.poll_event() {
            match event {
                PortEvent::Receive { conn, payload, .. } if Some(conn) == self.control => {
                    // The control framer keeps the 4-byte header in the
                    // frame, so the bytes splice straight into the buffer.
                    self.incoming.append_bytes(&payload);
                }
                PortEvent::ConnectionClosed { conn, .. } if Some(conn) == self.control => {
                    return Err(self.on_control_closed(reactor, timers));
                }
                other => self.user_events.push_back(other),
            }
        }
        Ok(())
    }

    /// Drain mux events and dispatch buffered control frames for this role.
    pub fn process_events(
        &mut self,
        reactor: &mut Reactor,
        timers: &mut TimerRegistry,
    ) -> Result<()> {
        self.absorb_mux_events(reactor, timers)?;
        self.handle_probe_tick(reactor)?;
        match self.role {
            Role::HostController => self.process_all_messages_hc(reactor),
            Role::MainComponent | Role::ParallelComponent => {
                self.process_all_messages_tc(reactor)
            }
        }
    }

    fn invalid_state(&mut self, reactor: &mut Reactor, what: &str) -> Error {
        let text = format!("message {} arrived in invalid state {:?}", what, self.state);
        let _ = self.send_error(reactor, &text);
        Error::new(ErrorKind::Protocol, text)
    }

    fn process_all_messages_hc(&mut self, reactor: &mut Reactor) -> Result<()> {
        while let Some((raw, end)) = codec::open_dispatch(&mut self.incoming)? {
            match MsgType::from_u32(raw) {
                Some(MsgType::Error) => self.process_error()?,
                Some(MsgType::Configure) => self.process_configure(reactor, end, false)?,
                Some(MsgType::CreateMtc) => {
                    self.incoming.advance_past_current_frame()?;
                    self.harness.create_mtc();
                }
                Some(MsgType::CreatePtc) => self.process_create_ptc(reactor)?,
                Some(MsgType::KillProcess) => {
                    let compref = self.incoming.read_int()?;
                    self.incoming.advance_past_current_frame()?;
                    self.harness.kill_process(compref);
                }
                Some(MsgType::ExitHc) => {
                    self.incoming.advance_past_current_frame()?;
                    log::info!("[CTRL] exit was requested by the controller");
                    self.set_state(ComponentState::HcExit);
                }
                Some(MsgType::DebugCommand) => self.process_debug_command()?,
                _ => codec::consume_unknown(&mut self.incoming, raw, end)?,
            }
        }
        Ok(())
    }

    fn process_all_messages_tc(&mut self, reactor: &mut Reactor) -> Result<()> {
        while let Some((raw, end)) = codec::open_dispatch(&mut self.incoming)? {
            let msg = MsgType::from_u32(raw);
            match msg {
                Some(MsgType::Error) => self.process_error()?,
                Some(MsgType::CreateAck) => {
                    let compref = self.incoming.read_int()?;
                    self.incoming.advance_past_current_frame()?;
                    self.harness.create_ack(compref);
                }
                Some(MsgType::StartAck) => self.process_ack(
                    reactor,
                    "START_ACK",
                    ComponentState::MtcStart,
                    ComponentState::PtcStart,
                )?,
                Some(MsgType::Stop) => self.process_stop()?,
                Some(MsgType::StopAck) => self.process_ack(
                    reactor,
                    "STOP_ACK",
                    ComponentState::MtcStop,
                    ComponentState::PtcStop,
                )?,
                Some(MsgType::KillAck) => self.process_ack(
                    reactor,
                    "KILL_ACK",
                    ComponentState::MtcKill,
                    ComponentState::PtcKill,
                )?,
                Some(MsgType::Running) => {
                    let answer = self.incoming.read_int()? != 0;
                    self.incoming.advance_past_current_frame()?;
                    self.harness.running(answer);
                }
                Some(MsgType::Alive) => {
                    let answer = self.incoming.read_int()? != 0;
                    self.incoming.advance_past_current_frame()?;
                    self.harness.alive(answer);
                }
                Some(MsgType::DoneAck) => self.process_done_ack(end)?,
                Some(MsgType::KilledAck) => {
                    let answer = self.incoming.read_int()? != 0;
                    self.incoming.advance_past_current_frame()?;
                    self.harness.killed_ack(answer);
                }
                Some(MsgType::CancelDone) => self.process_cancel_done(reactor)?,
                Some(MsgType::ComponentStatus) => self.process_component_status(end)?,
                Some(MsgType::ConnectListen) => self.process_connect_listen()?,
                Some(MsgType::Connect) => self.process_connect(end)?,
                Some(MsgType::ConnectAck) => self.process_ack(
                    reactor,
                    "CONNECT_ACK",
                    ComponentState::MtcConnect,
                    ComponentState::PtcConnect,
                )?,
                Some(MsgType::Disconnect) => self.process_disconnect()?,
                Some(MsgType::DisconnectAck) => self.process_ack(
                    reactor,
                    "DISCONNECT_ACK",
                    ComponentState::MtcDisconnect,
                    ComponentState::PtcDisconnect,
                )?,
                Some(MsgType::Map) => self.process_map()?,
                Some(MsgType::MapAck) => self.process_ack(
                    reactor,
                    "MAP_ACK",
                    ComponentState::MtcMap,
                    ComponentState::PtcMap,
                )?,
                Some(MsgType::Unmap) => self.process_unmap()?,
                Some(MsgType::UnmapAck) => self.process_ack(
                    reactor,
                    "UNMAP_ACK",
                    ComponentState::MtcUnmap,
                    ComponentState::PtcUnmap,
                )?,
                Some(MsgType::DebugCommand) => self.process_debug_command()?,
                _ if self.role == Role::MainComponent => match msg {
                    Some(MsgType::ExecuteControl) => self.process_execute_control(reactor)?,
                    Some(MsgType::ExecuteTestcase) => self.process_execute_testcase(reactor)?,
                    Some(MsgType::PtcVerdict) => {
                        let payload = self.incoming.slice_to(end).to_vec();
                        self.incoming.advance_past_current_frame()?;
                        self.harness.ptc_verdict(&payload);
                    }
                    Some(MsgType::Continue) => {
                        self.incoming.advance_past_current_frame()?;
                        if self.state != ComponentState::MtcPaused {
                            return Err(self.invalid_state(reactor, "CONTINUE"));
                        }
                        self.set_state(ComponentState::MtcControlpart);
                    }
                    Some(MsgType::ExitMtc) => {
                        self.incoming.advance_past_current_frame()?;
                        log::info!("[CTRL] exit was requested by the controller");
                        self.set_state(ComponentState::MtcExit);
                    }
                    Some(MsgType::Configure) => self.process_configure(reactor, end, true)?,
                    _ => codec::consume_unknown(&mut self.incoming, raw, end)?,
                },
                _ => match msg {
                    Some(MsgType::Start) => self.process_start(end)?,
                    Some(MsgType::Kill) => {
                        self.incoming.advance_past_current_frame()?;
                        self.harness.process_kill();
                    }
                    _ => codec::consume_unknown(&mut self.incoming, raw, end)?,
                },
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-message handlers
    // ------------------------------------------------------------------

    fn process_error(&mut self) -> Result<()> {
        let message = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;
        self.harness.error_from_controller(&message);
        Err(Error::new(
            ErrorKind::General,
            format!("error message was received from the controller: {}", message),
        ))
    }

    fn process_configure(&mut self, reactor: &mut Reactor, _end: usize, to_mtc: bool) -> Result<()> {
        use ComponentState::*;
        let acceptable = if to_mtc {
            self.state == MtcIdle
        } else {
            matches!(self.state, HcIdle | HcActive | HcOverloaded)
        };
        if !acceptable {
            self.incoming.advance_past_current_frame()?;
            return Err(self.invalid_state(reactor, "CONFIGURE"));
        }
        if !to_mtc {
            self.set_state(HcConfiguring);
        }
        let config = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;

        let success = self.harness.process_config_string(&config);
        if success {
            log::info!("[CTRL] configuration accepted ({} bytes)", config.len());
            self.send_configure_ack(reactor)?;
            self.set_state(if to_mtc { MtcIdle } else { HcActive });
        } else {
            log::warn!("[CTRL] configuration rejected");
            self.send_configure_nak(reactor)?;
            self.set_state(if to_mtc { MtcIdle } else { HcIdle });
        }
        Ok(())
    }

    fn process_create_ptc(&mut self, reactor: &mut Reactor) -> Result<()> {
        let compref = self.incoming.read_int()?;
        if compref < FIRST_PTC_COMPREF {
            self.incoming.advance_past_current_frame()?;
            let text = format!("message CREATE_PTC refers to invalid component reference {}", compref);
            self.send_error(reactor, &text)?;
            return Ok(());
        }
        let (type_module, type_name) = self.incoming.read_qualified_name()?;
        let component_name = self.incoming.read_string()?;
        let is_alive = self.incoming.read_int()? != 0;
        let (tc_module, tc_name) = self.incoming.read_qualified_name()?;
        self.incoming.advance_past_current_frame()?;
        self.harness.create_ptc(
            compref,
            &type_module,
            &type_name,
            &component_name,
            is_alive,
            &tc_module,
            &tc_name,
        );
        Ok(())
    }

    /// Common shape of the ack family: the corresponding wait state returns
    /// to the executing state; a terminating test case absorbs the ack.
    fn process_ack(
        &mut self,
        reactor: &mut Reactor,
        what: &str,
        mtc_wait: ComponentState,
        ptc_wait: ComponentState,
    ) -> Result<()> {
        self.incoming.advance_past_current_frame()?;
        match self.state {
            s if s == mtc_wait => self.set_state(ComponentState::MtcTestcase),
            s if s == ptc_wait => self.set_state(ComponentState::PtcFunction),
            ComponentState::MtcTerminatingTestcase => {}
            _ => return Err(self.invalid_state(reactor, what)),
        }
        Ok(())
    }

    fn process_stop(&mut self) -> Result<()> {
        self.incoming.advance_past_current_frame()?;
        use ComponentState::*;
        match self.state {
            MtcIdle => {
                log::info!("[CTRL] stop was requested, ignored on idle component");
            }
            MtcPaused => {
                log::info!("[CTRL] stop was requested while paused");
                self.set_state(MtcTerminatingExecution);
            }
            PtcIdle | PtcStopped => {
                log::info!("[CTRL] stop was requested, ignored on idle component");
            }
            PtcExit => {}
            _ => {
                log::info!("[CTRL] stop was requested");
                self.harness.stop_execution();
            }
        }
        Ok(())
    }

    fn process_done_ack(&mut self, end: usize) -> Result<()> {
        let answer = self.incoming.read_int()? != 0;
        let return_type = self.incoming.read_string()?;
        let return_value = self.incoming.slice_to(end).to_vec();
        self.incoming.advance_past_current_frame()?;
        self.harness.done_ack(answer, &return_type, &return_value);
        Ok(())
    }

    fn process_cancel_done(&mut self, reactor: &mut Reactor) -> Result<()> {
        let compref = self.incoming.read_int()?;
        let cancel_any = if self.role == Role::MainComponent {
            self.incoming.read_int()? != 0
        } else {
            false
        };
        self.incoming.advance_past_current_frame()?;
        self.harness.cancel_done(compref);
        if cancel_any {
            self.harness.cancel_done(ANY_COMPREF);
        }
        self.send_frame(reactor, codec::cancel_done_ack(compref))
    }

    fn process_component_status(&mut self, end: usize) -> Result<()> {
        let compref = self.incoming.read_int()?;
        let is_done = self.incoming.read_int()? != 0;
        let is_killed = self.incoming.read_int()? != 0;
        let (any_done, all_done, any_killed, all_killed) = if self.role == Role::MainComponent {
            (
                self.incoming.read_int()? != 0,
                self.incoming.read_int()? != 0,
                self.incoming.read_int()? != 0,
                self.incoming.read_int()? != 0,
            )
        } else {
            (false, false, false, false)
        };
        if is_done {
            let return_type = self.incoming.read_string()?;
            let return_value = self.incoming.slice_to(end).to_vec();
            self.harness.component_done(compref, &return_type, &return_value);
        }
        if is_killed {
            self.harness.component_killed(compref);
        }
        if any_done {
            self.harness.component_done(ANY_COMPREF, "", &[]);
        }
        if all_done {
            self.harness.component_done(ALL_COMPREF, "", &[]);
        }
        if any_killed {
            self.harness.component_killed(ANY_COMPREF);
        }
        if all_killed {
            self.harness.component_killed(ALL_COMPREF);
        }
        self.incoming.advance_past_current_frame()?;
        let plausible = is_done
            || is_killed
            || (self.role == Role::MainComponent
                && compref == NULL_COMPREF
                && (any_done || all_done || any_killed || all_killed));
        if !plausible {
            return Err(Error::new(
                ErrorKind::Protocol,
                "malformed COMPONENT_STATUS message was received",
            ));
        }
        Ok(())
    }

    fn process_connect_listen(&mut self) -> Result<()> {
        let local_port = self.incoming.read_string()?;
        let remote_comp = self.incoming.read_int()?;
        let remote_comp_name = self.incoming.read_string()?;
        let remote_port = self.incoming.read_string()?;
        let transport = self.incoming.read_uint()?;
        self.incoming.advance_past_current_frame()?;
        self.harness
            .connect_listen(&local_port, remote_comp, &remote_comp_name, &remote_port, transport);
        Ok(())
    }

    fn process_connect(&mut self, end: usize) -> Result<()> {
        let local_port = self.incoming.read_string()?;
        let remote_comp = self.incoming.read_int()?;
        let remote_comp_name = self.incoming.read_string()?;
        let remote_port = self.incoming.read_string()?;
        let setup = self.incoming.slice_to(end).to_vec();
        self.incoming.advance_past_current_frame()?;
        self.harness
            .connect_port(&local_port, remote_comp, &remote_comp_name, &remote_port, &setup);
        Ok(())
    }

    fn process_disconnect(&mut self) -> Result<()> {
        let local_port = self.incoming.read_string()?;
        let remote_comp = self.incoming.read_int()?;
        let remote_port = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;
        self.harness.disconnect_port(&local_port, remote_comp, &remote_port);
        Ok(())
    }

    fn process_map(&mut self) -> Result<()> {
        let local_port = self.incoming.read_string()?;
        let system_port = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;
        self.harness.map_port(&local_port, &system_port);
        Ok(())
    }

    fn process_unmap(&mut self) -> Result<()> {
        let local_port = self.incoming.read_string()?;
        let system_port = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;
        self.harness.unmap_port(&local_port, &system_port);
        Ok(())
    }

    fn process_execute_control(&mut self, reactor: &mut Reactor) -> Result<()> {
        let module = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;
        if self.state != ComponentState::MtcIdle {
            return Err(self.invalid_state(reactor, "EXECUTE_CONTROL"));
        }
        log::info!("[CTRL] executing control part of module {}", module);
        self.set_state(ComponentState::MtcControlpart);
        if let Err(e) = self.harness.execute_control(&module) {
            log::warn!("[CTRL] control part of {} was aborted: {}", module, e);
        }
        self.finish_execution(reactor)
    }

    fn process_execute_testcase(&mut self, reactor: &mut Reactor) -> Result<()> {
        let module = self.incoming.read_string()?;
        let testcase = self.incoming.read_string()?;
        self.incoming.advance_past_current_frame()?;
        if self.state != ComponentState::MtcIdle {
            return Err(self.invalid_state(reactor, "EXECUTE_TESTCASE"));
        }
        log::info!("[CTRL] executing test case {}.{}", module, testcase);
        self.set_state(ComponentState::MtcControlpart);
        let outcome = if testcase.is_empty() {
            self.harness.execute_all_testcases(&module)
        } else {
            self.harness.execute_testcase(&module, &testcase)
        };
        if let Err(e) = outcome {
            log::warn!("[CTRL] test case execution was aborted: {}", e);
        }
        self.finish_execution(reactor)
    }

    /// Local completion: report readiness while connected, else exit.
    fn finish_execution(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.is_connected() {
            self.send_mtc_ready(reactor)?;
            self.set_state(ComponentState::MtcIdle);
        } else {
            self.set_state(ComponentState::MtcExit);
        }
        Ok(())
    }

    fn process_start(&mut self, end: usize) -> Result<()> {
        let (module, function) = self.incoming.read_qualified_name()?;
        if module.is_empty() || function.is_empty() {
            self.incoming.advance_past_current_frame()?;
            return Err(Error::new(
                ErrorKind::Protocol,
                "message START contains an invalid function name",
            ));
        }
        let args = self.incoming.slice_to(end).to_vec();
        self.incoming.advance_past_current_frame()?;
        self.set_state(ComponentState::PtcFunction);
        self.harness.start_function(&module, &function, &args);
        Ok(())
    }

    fn process_debug_command(&mut self) -> Result<()> {
        let command = self.incoming.read_int()?;
        let argument_count = self.incoming.read_uint()? as usize;
        let mut arguments = Vec::with_capacity(argument_count);
        for _ in 0..argument_count {
            arguments.push(self.incoming.read_string()?);
        }
        self.incoming.advance_past_current_frame()?;
        self.harness.debug_command(command, &arguments);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Debug-mode drain
    // ------------------------------------------------------------------

    /// While the debugger holds execution, keep the control socket alive:
    /// only DebugCommand and Stop are acted on, everything else is deferred
    /// and replayed in arrival order once the debugger releases.
    pub fn process_debug_messages(
        &mut self,
        reactor: &mut Reactor,
        timers: &mut TimerRegistry,
    ) -> Result<()> {
        let mut deferred = ByteBuffer::new();
        loop {
            self.absorb_mux_events(reactor, timers)?;
            while self.harness.debugger_halted() {
                let Some((raw, end)) = codec::open_dispatch(&mut self.incoming)? else {
                    break;
                };
                match MsgType::from_u32(raw) {
                    Some(MsgType::DebugCommand) => self.process_debug_command()?,
                    Some(MsgType::Stop) => self.process_stop()?,
                    _ => {
                        // Re-frame and defer; replayed after release.
                        let rest = self.incoming.slice_to(end).to_vec();
                        deferred.begin_frame();
                        deferred.append_uint(u64::from(raw));
                        deferred.append_bytes(&rest);
                        deferred.finalize_outgoing_frame()?;
                        self.incoming.advance_past_current_frame()?;
                    }
                }
            }
            if !self.harness.debugger_halted() {
                break;
            }
            reactor.take_snapshot(timers, true)?;
        }
        if !deferred.is_empty() {
            self.incoming.push_front(deferred.as_slice());
            match self.role {
                Role::HostController => self.process_all_messages_hc(reactor)?,
                _ => self.process_all_messages_tc(reactor)?,
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn inject(&mut self, bytes: &[u8]) {
        self.incoming.append_bytes(bytes);
    }

    #[cfg(test)]
    fn harness_mut(&mut self) -> &mut dyn TestHarness {
        &mut *self.harness
    }
}

// ============================================================================
// Host plumbing
// ============================================================================

fn cstr_field(field: &[libc::c_char]) -> String {
    unsafe { CStr::from_ptr(field.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Host identity for the Version message (uname).
fn host_info() -> (String, String, String, String, String) {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        let unknown = || "unknown".to_string();
        return (unknown(), unknown(), unknown(), unknown(), unknown());
    }
    (
        cstr_field(&uts.nodename),
        cstr_field(&uts.machine),
        cstr_field(&uts.sysname),
        cstr_field(&uts.release),
        cstr_field(&uts.version),
    )
}

fn unix_stream_supported() -> bool {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
        true
    } else {
        false
    }
}

fn wall_clock() -> (i64, i64) {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, i64::from(d.subsec_micros())),
        Err(_) => (0, 0),
    }
}

/// Grow the send buffer of the control socket: try doubling, fall back to a
/// binary search towards the largest size the kernel accepts. Failure to
/// grow is only logged.
fn grow_send_buffer(fd: RawFd) {
    let get = |fd: RawFd| -> Option<libc::c_int> {
        let mut size: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&mut size as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        (rc == 0 && size > 0).then_some(size)
    };
    let set = |fd: RawFd, size: libc::c_int| -> bool {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&size as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        rc == 0
    };

    let Some(old_size) = get(fd) else {
        log::warn!("[CTRL] getsockopt(SO_SNDBUF) failed on the control socket");
        return;
    };
    let doubled = old_size.saturating_mul(2);
    let mut achieved = old_size;
    if doubled > old_size && set(fd, doubled) {
        achieved = doubled;
    } else {
        // Binary-search the largest acceptable size above the current one.
        let mut step = old_size / 2;
        while step > 0 {
            let tried = achieved.saturating_add(step);
            if tried > achieved && set(fd, tried) {
                achieved = tried;
            }
            step /= 2;
        }
    }
    match get(fd) {
        Some(new_size) if new_size > old_size => {
            log::debug!(
                "[CTRL] control socket send buffer grown from {} to {} bytes",
                old_size,
                new_size
            );
        }
        _ => log::debug!(
            "[CTRL] control socket send buffer stays at {} bytes",
            old_size
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use std::cell::RefCell;

    #[derive(Default, Clone)]
    struct Recorded {
        stopped: usize,
        errors: Vec<String>,
        debug_commands: Vec<(i64, Vec<String>)>,
        done: Vec<i64>,
    }

    struct RecordingHarness {
        state: Rc<RefCell<Recorded>>,
    }

    impl TestHarness for RecordingHarness {
        fn stop_execution(&mut self) {
            self.state.borrow_mut().stopped += 1;
        }

        fn error_from_controller(&mut self, message: &str) {
            self.state.borrow_mut().errors.push(message.to_string());
        }

        fn debug_command(&mut self, command: i64, arguments: &[String]) {
            self.state
                .borrow_mut()
                .debug_commands
                .push((command, arguments.to_vec()));
        }

        fn component_done(&mut self, compref: i64, _rt: &str, _rv: &[u8]) {
            self.state.borrow_mut().done.push(compref);
        }
    }

    fn make_endpoint(role: Role) -> (Reactor, TimerRegistry, Endpoint, Rc<RefCell<Recorded>>) {
        let mut reactor = Reactor::new().unwrap();
        let timers = TimerRegistry::new();
        let mux = TransportMux::new(&mut reactor, Options::default());
        let state = Rc::new(RefCell::new(Recorded::default()));
        let endpoint = Endpoint::new(
            &mut reactor,
            role,
            mux,
            Box::new(RecordingHarness { state: state.clone() }),
        );
        (reactor, timers, endpoint, state)
    }

    fn debug_command_frame(command: i64, args: &[&str]) -> Vec<u8> {
        let mut buf = codec::begin(MsgType::DebugCommand);
        buf.append_int(command);
        buf.append_uint(args.len() as u64);
        for a in args {
            buf.append_string(Some(a));
        }
        codec::finish(buf).unwrap()
    }

    #[test]
    fn test_start_ack_transitions() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcStart);
        ep.inject(&codec::finish(codec::begin(MsgType::StartAck)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(ep.state(), ComponentState::MtcTestcase);

        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::ParallelComponent);
        ep.set_state(ComponentState::PtcStart);
        ep.inject(&codec::finish(codec::begin(MsgType::StartAck)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(ep.state(), ComponentState::PtcFunction);
    }

    #[test]
    fn test_ack_family_in_wait_states() {
        let cases = [
            (MsgType::StopAck, ComponentState::MtcStop),
            (MsgType::KillAck, ComponentState::MtcKill),
            (MsgType::ConnectAck, ComponentState::MtcConnect),
            (MsgType::DisconnectAck, ComponentState::MtcDisconnect),
            (MsgType::MapAck, ComponentState::MtcMap),
            (MsgType::UnmapAck, ComponentState::MtcUnmap),
        ];
        for (msg, wait_state) in cases {
            let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::MainComponent);
            ep.set_state(wait_state);
            ep.inject(&codec::finish(codec::begin(msg)).unwrap());
            ep.process_all_messages_tc(&mut reactor).unwrap();
            assert_eq!(ep.state(), ComponentState::MtcTestcase, "{:?}", msg);
        }
    }

    #[test]
    fn test_ack_in_terminating_testcase_is_absorbed() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcTerminatingTestcase);
        ep.inject(&codec::finish(codec::begin(MsgType::StopAck)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(ep.state(), ComponentState::MtcTerminatingTestcase);
    }

    #[test]
    fn test_ack_in_invalid_state_is_protocol_error() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcIdle);
        ep.inject(&codec::finish(codec::begin(MsgType::StartAck)).unwrap());
        let err = ep.process_all_messages_tc(&mut reactor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_stop_dispatch_by_state() {
        // executing component: the harness hook runs
        let (mut reactor, _timers, mut ep, state) = make_endpoint(Role::ParallelComponent);
        ep.set_state(ComponentState::PtcFunction);
        ep.inject(&codec::finish(codec::begin(MsgType::Stop)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(state.borrow().stopped, 1);

        // idle component: ignored
        let (mut reactor, _timers, mut ep, state) = make_endpoint(Role::ParallelComponent);
        ep.set_state(ComponentState::PtcIdle);
        ep.inject(&codec::finish(codec::begin(MsgType::Stop)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(state.borrow().stopped, 0);

        // paused MTC moves to terminating-execution
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcPaused);
        ep.inject(&codec::finish(codec::begin(MsgType::Stop)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(ep.state(), ComponentState::MtcTerminatingExecution);
    }

    #[test]
    fn test_error_message_raised_locally() {
        let (mut reactor, _timers, mut ep, state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcIdle);
        ep.inject(&codec::error_message("version mismatch"));
        let err = ep.process_all_messages_tc(&mut reactor).unwrap_err();
        assert!(err.message().contains("version mismatch"));
        assert_eq!(state.borrow().errors, vec!["version mismatch".to_string()]);
    }

    #[test]
    fn test_component_status_dispatch() {
        let (mut reactor, _timers, mut ep, state) = make_endpoint(Role::ParallelComponent);
        ep.set_state(ComponentState::PtcFunction);
        let mut buf = codec::begin(MsgType::ComponentStatus);
        buf.append_int(5); // compref
        buf.append_int(1); // is_done
        buf.append_int(0); // is_killed
        buf.append_string(Some("MyType"));
        buf.append_bytes(&[1, 2, 3]);
        ep.inject(&codec::finish(buf).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(state.borrow().done, vec![5]);
    }

    #[test]
    fn test_unknown_message_is_consumed_not_fatal() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcIdle);
        let mut buf = ByteBuffer::new();
        buf.begin_frame();
        buf.append_uint(4242);
        buf.append_bytes(&[0xAB; 4]);
        buf.finalize_outgoing_frame().unwrap();
        ep.inject(buf.as_slice());
        // a known frame behind it still gets dispatched
        ep.inject(&codec::finish(codec::begin(MsgType::ExitMtc)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(ep.state(), ComponentState::MtcExit);
    }

    #[test]
    fn test_debug_command_dispatch() {
        let (mut reactor, _timers, mut ep, state) = make_endpoint(Role::MainComponent);
        ep.set_state(ComponentState::MtcIdle);
        ep.inject(&debug_command_frame(3, &["breakpoint", "42"]));
        ep.process_all_messages_tc(&mut reactor).unwrap();
        assert_eq!(
            state.borrow().debug_commands,
            vec![(3, vec!["breakpoint".to_string(), "42".to_string()])]
        );
    }

    #[test]
    fn test_send_without_connection_fails() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::HostController);
        let err = ep.send_configure_ack(&mut reactor).unwrap_err();
        assert!(err.message().contains("control connection is down"));
    }

    #[test]
    fn test_exit_hc_transition() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::HostController);
        ep.inject(&codec::finish(codec::begin(MsgType::ExitHc)).unwrap());
        ep.process_all_messages_hc(&mut reactor).unwrap();
        assert_eq!(ep.state(), ComponentState::HcExit);
    }

    #[test]
    fn test_overload_call_interval_doubles() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::HostController);
        assert!(ep.increase_call_interval(&mut reactor).is_err());
        ep.enable_periodic_call(&mut reactor);
        assert_eq!(ep.call_interval(), crate::config::INITIAL_CALL_INTERVAL);
        ep.increase_call_interval(&mut reactor).unwrap();
        ep.increase_call_interval(&mut reactor).unwrap();
        assert!((ep.call_interval() - crate::config::INITIAL_CALL_INTERVAL * 4.0).abs() < 1e-9);
        ep.disable_periodic_call(&mut reactor);
        assert_eq!(ep.call_interval(), 0.0);
    }

    struct HaltedHarness {
        halted: Rc<Cell<bool>>,
        commands: Rc<RefCell<Vec<i64>>>,
    }

    impl TestHarness for HaltedHarness {
        fn debugger_halted(&self) -> bool {
            self.halted.get()
        }

        fn debug_command(&mut self, command: i64, _args: &[String]) {
            self.commands.borrow_mut().push(command);
            if command == 0 {
                self.halted.set(false);
            }
        }
    }

    #[test]
    fn test_debug_drain_defers_and_replays_in_order() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        let mux = TransportMux::new(&mut reactor, Options::default());
        let halted = Rc::new(Cell::new(true));
        let commands = Rc::new(RefCell::new(Vec::new()));
        let mut ep = Endpoint::new(
            &mut reactor,
            Role::MainComponent,
            mux,
            Box::new(HaltedHarness {
                halted: halted.clone(),
                commands: commands.clone(),
            }),
        );
        ep.set_state(ComponentState::MtcStart);

        // a non-debug frame arrives while halted, then the release command
        ep.inject(&codec::finish(codec::begin(MsgType::StartAck)).unwrap());
        ep.inject(&debug_command_frame(7, &[]));
        ep.inject(&debug_command_frame(0, &[]));

        ep.process_debug_messages(&mut reactor, &mut timers).unwrap();

        // both debug commands ran while halted, the ack replayed afterwards
        assert_eq!(*commands.borrow(), vec![7, 0]);
        assert_eq!(ep.state(), ComponentState::MtcTestcase);
        assert!(!halted.get());
    }

    #[test]
    fn test_harness_seam_is_replaceable() {
        let (mut reactor, _timers, mut ep, _state) = make_endpoint(Role::ParallelComponent);
        // the null harness ignores everything without blowing up
        let _ = ep.harness_mut();
        ep.set_state(ComponentState::PtcIdle);
        ep.inject(&codec::finish(codec::begin(MsgType::Kill)).unwrap());
        ep.process_all_messages_tc(&mut reactor).unwrap();
    }
}
