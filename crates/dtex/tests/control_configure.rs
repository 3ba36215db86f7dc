// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host-controller Configure flow against a controller peer on loopback:
//! acceptance answers ConfigureAck and activates the component, rejection
//! answers ConfigureNak and returns to idle.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use dtex::control::codec::{self, MsgType};
use dtex::control::{ComponentState, Endpoint, Role, TestHarness};
use dtex::{ByteBuffer, Options, Reactor, TimerRegistry, TransportMux};

struct ConfigHarness {
    accept: bool,
    seen: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
}

impl TestHarness for ConfigHarness {
    fn process_config_string(&mut self, config: &str) -> bool {
        self.seen.borrow_mut().push(config.to_string());
        self.accept
    }
}

/// Controller side: accept one component, push a Configure, read one frame
/// back and surrender its type.
fn run_controller(listener: TcpListener, config: &'static str) -> thread::JoinHandle<u32> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&codec::configure(config)).unwrap();

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();

        let mut frame = ByteBuffer::new();
        frame.append_bytes(&header);
        frame.append_bytes(&body);
        let (raw, _end) = codec::open_dispatch(&mut frame).unwrap().unwrap();
        raw
    })
}

fn drive_until(
    reactor: &mut Reactor,
    timers: &mut TimerRegistry,
    endpoint: &mut Endpoint,
    target: ComponentState,
) {
    for _ in 0..200 {
        reactor.take_snapshot(timers, true).unwrap();
        endpoint.process_events(reactor, timers).unwrap();
        if endpoint.state() == target {
            return;
        }
    }
    panic!(
        "endpoint never reached {:?}, stuck in {:?}",
        target,
        endpoint.state()
    );
}

fn make_endpoint(accept: bool, port: u16) -> (Reactor, TimerRegistry, Endpoint) {
    let mut reactor = Reactor::new().unwrap();
    let timers = TimerRegistry::new();
    let mux = TransportMux::new(&mut reactor, Options::default());
    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut endpoint = Endpoint::new(
        &mut reactor,
        Role::HostController,
        mux,
        Box::new(ConfigHarness { accept, seen }),
    );
    endpoint.set_controller_address("127.0.0.1", port);
    (reactor, timers, endpoint)
}

#[test]
fn test_configure_accepted_activates_and_acks() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let controller = run_controller(listener, "LogFile := \"run.log\"");

    let (mut reactor, mut timers, mut endpoint) = make_endpoint(true, port);
    assert_eq!(endpoint.state(), ComponentState::HcIdle);
    endpoint.connect_to_controller(&mut reactor).unwrap();
    assert!(endpoint.is_connected());

    drive_until(&mut reactor, &mut timers, &mut endpoint, ComponentState::HcActive);

    let answered = controller.join().unwrap();
    assert_eq!(MsgType::from_u32(answered), Some(MsgType::ConfigureAck));
}

#[test]
fn test_configure_rejected_naks_and_returns_to_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let controller = run_controller(listener, "not a configuration");

    let (mut reactor, mut timers, mut endpoint) = make_endpoint(false, port);
    endpoint.connect_to_controller(&mut reactor).unwrap();

    // the initial state is also HcIdle; the controller reading our answer
    // is the synchronization point
    let mut answered = None;
    for _ in 0..200 {
        reactor.take_snapshot(&mut timers, true).unwrap();
        endpoint.process_events(&mut reactor, &mut timers).unwrap();
        if controller.is_finished() {
            answered = Some(controller.join().unwrap());
            break;
        }
    }
    assert_eq!(endpoint.state(), ComponentState::HcIdle);
    assert_eq!(
        answered.and_then(MsgType::from_u32),
        Some(MsgType::ConfigureNak)
    );
}

#[test]
fn test_control_loss_moves_to_exit_state() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let controller = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream); // controller goes away immediately
    });

    let (mut reactor, mut timers, mut endpoint) = make_endpoint(true, port);
    endpoint.connect_to_controller(&mut reactor).unwrap();
    controller.join().unwrap();

    let mut escalated = false;
    for _ in 0..200 {
        reactor.take_snapshot(&mut timers, true).unwrap();
        if endpoint.process_events(&mut reactor, &mut timers).is_err() {
            escalated = true;
            break;
        }
    }
    assert!(escalated, "control loss was not escalated");
    assert_eq!(endpoint.state(), ComponentState::HcExit);
    assert!(!endpoint.is_connected());
}
