// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Asynchronous connect: EINPROGRESS resolution through SO_ERROR, both the
//! successful and the refused path, in pure-non-blocking configuration.

mod common;

use std::io::Read;
use std::net::TcpListener;

use dtex::mux::events::{PortEvent, Proto};
use dtex::mux::{ConnectOutcome, SendStatus};
use dtex::{ErrorKind, Options, Reactor, TimerRegistry, TransportMux};

fn setup_pure_nonblocking() -> (Reactor, TimerRegistry, TransportMux) {
    let mut reactor = Reactor::new().unwrap();
    let timers = TimerRegistry::new();
    let mut options = Options::default();
    options.set_parameter("pureNonBlocking", "yes").unwrap();
    let mux = TransportMux::new(&mut reactor, options);
    (reactor, timers, mux)
}

#[test]
fn test_pending_connect_completes_with_available() {
    let (mut reactor, mut timers, mux) = setup_pure_nonblocking();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let outcome = mux
        .connect(&mut reactor, ("127.0.0.1", port), None, None, Proto::Tcp, &[])
        .unwrap();
    let conn = outcome.conn();

    if let ConnectOutcome::Pending(_) = outcome {
        // completion surfaces as Result{Available} once writability fires
        let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, |evs| {
            evs.iter().any(|e| {
                matches!(e, PortEvent::Result(r)
                    if r.kind == ErrorKind::Available && r.conn == Some(conn))
            })
        });
        assert!(
            events.iter().any(|e| matches!(e, PortEvent::Result(r)
                if r.kind == ErrorKind::Available && r.conn == Some(conn))),
            "no completion event: {:?}",
            events
        );
    }

    // the connection is now usable
    match mux.send(&mut reactor, conn, b"ping", None).unwrap() {
        SendStatus::Complete(4) => {}
        other => panic!("unexpected send outcome: {:?}", other),
    }
    let (mut accepted, _) = listener.accept().unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn test_refused_connect_reports_econnrefused_and_frees_slot() {
    let (mut reactor, mut timers, mux) = setup_pure_nonblocking();
    // grab a port with no listener behind it
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    match mux.connect(&mut reactor, ("127.0.0.1", port), None, None, Proto::Tcp, &[]) {
        Err(e) => {
            // some kernels fail the loopback connect synchronously
            assert_eq!(e.kind(), ErrorKind::Socket);
            assert_eq!(e.os_errno(), Some(libc::ECONNREFUSED));
        }
        Ok(ConnectOutcome::Pending(conn)) => {
            let events = common::pump_until(&mut reactor, &mut timers, &mux, 5.0, |evs| {
                evs.iter()
                    .any(|e| matches!(e, PortEvent::Result(r) if r.kind == ErrorKind::Socket))
            });
            let failure = events
                .iter()
                .find_map(|e| match e {
                    PortEvent::Result(r) if r.kind == ErrorKind::Socket => Some(r.clone()),
                    _ => None,
                })
                .expect("no failure result event");
            assert_eq!(failure.os_errno, Some(libc::ECONNREFUSED));
            // no connection id remains live
            assert!(mux.connection_details(conn).is_err());
        }
        Ok(ConnectOutcome::Established(_)) => panic!("connect to a dead port succeeded"),
    }
}
