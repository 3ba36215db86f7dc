// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP listen/accept with length-prefixed framing, end to end over
//! loopback: open, ordered receive, peer-driven close.

mod common;

use std::io::Write;
use std::net::TcpStream;

use dtex::mux::events::{PortEvent, Proto};
use dtex::mux::framing;
use dtex::{Options, Reactor, TimerRegistry, TransportMux};

fn setup() -> (Reactor, TimerRegistry, TransportMux) {
    let mut reactor = Reactor::new().unwrap();
    let timers = TimerRegistry::new();
    let mux = TransportMux::new(&mut reactor, Options::default());
    (reactor, timers, mux)
}

#[test]
fn test_listen_accept_and_framed_receive() {
    let (mut reactor, mut timers, mux) = setup();
    let listener = mux
        .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Tcp, &[])
        .unwrap();
    let port = mux
        .connection_details(listener)
        .unwrap()
        .local
        .unwrap()
        .port();
    // 4-byte big-endian payload length; the header stays out of payloads
    mux.set_framer(listener, framing::length_field_framer, framing::control_framer_args())
        .unwrap();
    mux.set_header_strip(listener, 4).unwrap();
    mux.set_user_data(listener, 31).unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.write_all(&[0, 0, 0, 5, b'H', b'e', b'l', b'l', b'o'])
        .unwrap();

    let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, common::has_receive);

    // accept first, then exactly the framed message, and nothing closed yet
    let mut saw_open = None;
    for event in &events {
        match event {
            PortEvent::ConnectionOpened { conn, remote, proto, .. } => {
                assert_eq!(*proto, Proto::Tcp);
                assert!(remote.is_some());
                saw_open = Some(*conn);
            }
            PortEvent::Receive { conn, payload, user_tag, .. } => {
                assert_eq!(Some(*conn), saw_open, "receive before accept event");
                assert_eq!(payload, b"Hello");
                // inherited from the listener
                assert_eq!(*user_tag, 31);
            }
            PortEvent::ConnectionClosed { .. } => panic!("premature close event"),
            _ => {}
        }
    }
    let child = saw_open.expect("no accept event");
    assert!(common::first_receive(&events).is_some(), "no receive event");

    // peer closes; exactly one ConnectionClosed for the accepted child
    drop(peer);
    let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, common::has_closed);
    match events.iter().find(|e| matches!(e, PortEvent::ConnectionClosed { .. })) {
        Some(PortEvent::ConnectionClosed { conn, user_tag, .. }) => {
            assert_eq!(*conn, child);
            assert_eq!(*user_tag, 31);
        }
        _ => panic!("no close event"),
    }
    assert!(mux.connection_details(child).is_err(), "slot not released");
}

#[test]
fn test_two_frames_arrive_in_order() {
    let (mut reactor, mut timers, mux) = setup();
    let listener = mux
        .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Tcp, &[])
        .unwrap();
    let port = mux
        .connection_details(listener)
        .unwrap()
        .local
        .unwrap()
        .port();
    mux.set_framer(listener, framing::length_field_framer, framing::control_framer_args())
        .unwrap();
    mux.set_header_strip(listener, 4).unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.write_all(&[0, 0, 0, 1, b'A', 0, 0, 0, 2, b'B', b'C']).unwrap();

    let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, |evs| {
        evs.iter()
            .filter(|e| matches!(e, PortEvent::Receive { .. }))
            .count()
            >= 2
    });
    let payloads: Vec<&[u8]> = events
        .iter()
        .filter_map(|e| match e {
            PortEvent::Receive { payload, .. } => Some(payload.as_slice()),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![b"A".as_slice(), b"BC".as_slice()]);
}
