// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP datagram delivery with the default whole-datagram framing.

mod common;

use std::net::UdpSocket;

use dtex::mux::events::{PortEvent, Proto};
use dtex::{Options, Reactor, TimerRegistry, TransportMux};

#[test]
fn test_datagram_received_with_sender_address() {
    let mut reactor = Reactor::new().unwrap();
    let mut timers = TimerRegistry::new();
    let mux = TransportMux::new(&mut reactor, Options::default());

    let conn = mux
        .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Udp, &[])
        .unwrap();
    let port = mux.connection_details(conn).unwrap().local.unwrap().port();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer.local_addr().unwrap();
    peer.send_to(&[1, 2, 3, 4, 5, 6, 7], ("127.0.0.1", port)).unwrap();

    let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, common::has_receive);
    let receive = events
        .iter()
        .find_map(|e| match e {
            PortEvent::Receive { conn: c, payload, remote, proto, .. } => {
                Some((*c, payload.clone(), *remote, *proto))
            }
            _ => None,
        })
        .expect("no receive event");
    assert_eq!(receive.0, conn);
    assert_eq!(receive.1, vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(receive.2, Some(peer_addr));
    assert_eq!(receive.3, Proto::Udp);
}

#[test]
fn test_each_datagram_is_one_message() {
    let mut reactor = Reactor::new().unwrap();
    let mut timers = TimerRegistry::new();
    let mux = TransportMux::new(&mut reactor, Options::default());

    let conn = mux
        .listen(&mut reactor, Some(("127.0.0.1", 0)), Proto::Udp, &[])
        .unwrap();
    let port = mux.connection_details(conn).unwrap().local.unwrap().port();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"first", ("127.0.0.1", port)).unwrap();
    peer.send_to(b"second", ("127.0.0.1", port)).unwrap();

    let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, |evs| {
        evs.iter()
            .filter(|e| matches!(e, PortEvent::Receive { .. }))
            .count()
            >= 2
    });
    let payloads: Vec<Vec<u8>> = events
        .iter()
        .filter_map(|e| match e {
            PortEvent::Receive { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
}
