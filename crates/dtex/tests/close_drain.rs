// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Draining on close: frames buffered at close time are delivered before
//! the ConnectionClosed event; a locally closed connection reports a close
//! event only when data remained.

mod common;

use std::io::Write;
use std::net::TcpStream;

use dtex::mux::events::{PortEvent, Proto};
use dtex::mux::framing;
use dtex::{ConnId, Options, Reactor, TimerRegistry, TransportMux};

fn framed_listener() -> (Reactor, TimerRegistry, TransportMux, u16) {
    let mut reactor = Reactor::new().unwrap();
    let timers = TimerRegistry::new();
    let mux = TransportMux::new(&mut reactor, Options::default());
    let listener = mux
        .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Tcp, &[])
        .unwrap();
    mux.set_framer(listener, framing::length_field_framer, framing::control_framer_args())
        .unwrap();
    mux.set_header_strip(listener, 4).unwrap();
    let port = mux
        .connection_details(listener)
        .unwrap()
        .local
        .unwrap()
        .port();
    (reactor, timers, mux, port)
}

fn accepted_conn(
    reactor: &mut Reactor,
    timers: &mut TimerRegistry,
    mux: &TransportMux,
) -> ConnId {
    let events = common::pump_until(reactor, timers, mux, 5.0, |evs| {
        evs.iter().any(|e| matches!(e, PortEvent::ConnectionOpened { .. }))
    });
    events
        .iter()
        .find_map(|e| match e {
            PortEvent::ConnectionOpened { conn, .. } => Some(*conn),
            _ => None,
        })
        .expect("no accept event")
}

#[test]
fn test_peer_close_delivers_buffered_frames_first() {
    let (mut reactor, mut timers, mux, port) = framed_listener();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.write_all(&[0, 0, 0, 1, b'X', 0, 0, 0, 1, b'Y']).unwrap();
    drop(peer); // both frames and the FIN race into the same buffer

    let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, common::has_closed);

    let mut order = Vec::new();
    for event in &events {
        match event {
            PortEvent::Receive { payload, .. } => order.push(format!("recv:{:?}", payload)),
            PortEvent::ConnectionClosed { .. } => order.push("closed".to_string()),
            _ => {}
        }
    }
    assert_eq!(
        order,
        vec![
            format!("recv:{:?}", b"X".to_vec()),
            format!("recv:{:?}", b"Y".to_vec()),
            "closed".to_string()
        ]
    );
}

#[test]
fn test_local_close_reports_only_with_pending_data() {
    // a connection with half a frame buffered reports its close
    let (mut reactor, mut timers, mux, port) = framed_listener();
    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let conn = accepted_conn(&mut reactor, &mut timers, &mux);
    peer.write_all(&[0, 0, 0, 10, b'p', b'a', b'r']).unwrap();
    let _ = common::pump_for(&mut reactor, &mut timers, &mux, 0.3);

    mux.close(&mut reactor, conn).unwrap();
    assert!(mux.has_events(), "pending data must surface a close event");
    let mut saw_closed = false;
    while let Some(event) = mux.poll_event() {
        if matches!(event, PortEvent::ConnectionClosed { conn: c, .. } if c == conn) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);

    // an idle connection closes silently
    let (mut reactor, mut timers, mux, port) = framed_listener();
    let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let conn = accepted_conn(&mut reactor, &mut timers, &mux);
    mux.close(&mut reactor, conn).unwrap();
    while let Some(event) = mux.poll_event() {
        assert!(
            !matches!(event, PortEvent::ConnectionClosed { .. }),
            "clean close must not synthesize a close event"
        );
    }
}
