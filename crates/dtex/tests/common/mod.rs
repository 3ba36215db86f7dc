// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared plumbing for the integration tests: snapshot pumping with a
//! watchdog deadline, so a misbehaving reactor fails the test instead of
//! hanging it.

#![allow(dead_code)]

use dtex::mux::events::PortEvent;
use dtex::{Reactor, TimeoutStatus, TimerRegistry, TransportMux};

/// Drive snapshots until `done` is satisfied or `max_secs` elapse.
/// Returns every event collected along the way.
pub fn pump_until(
    reactor: &mut Reactor,
    timers: &mut TimerRegistry,
    mux: &TransportMux,
    max_secs: f64,
    mut done: impl FnMut(&[PortEvent]) -> bool,
) -> Vec<PortEvent> {
    let watchdog = timers.create("test watchdog");
    timers.start_with(watchdog, max_secs).expect("valid duration");
    let mut events = Vec::new();
    loop {
        reactor
            .take_snapshot(timers, true)
            .expect("snapshot must not fail");
        while let Some(event) = mux.poll_event() {
            events.push(event);
        }
        if done(&events) {
            timers.stop(watchdog);
            return events;
        }
        if timers.timed_out(watchdog) == TimeoutStatus::Yes {
            return events;
        }
    }
}

/// Drive snapshots for a fixed window, collecting whatever arrives.
pub fn pump_for(
    reactor: &mut Reactor,
    timers: &mut TimerRegistry,
    mux: &TransportMux,
    secs: f64,
) -> Vec<PortEvent> {
    pump_until(reactor, timers, mux, secs, |_| false)
}

/// First Receive payload among the events, if any.
pub fn first_receive(events: &[PortEvent]) -> Option<&[u8]> {
    events.iter().find_map(|e| match e {
        PortEvent::Receive { payload, .. } => Some(payload.as_slice()),
        _ => None,
    })
}

pub fn has_receive(events: &[PortEvent]) -> bool {
    first_receive(events).is_some()
}

pub fn has_closed(events: &[PortEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, PortEvent::ConnectionClosed { .. }))
}
