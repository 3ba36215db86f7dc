// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer expiry through the snapshot loop: a one-shot timer fires exactly
//! once, within its tolerance, and never again.

use std::time::Instant;

use dtex::{Reactor, TimeoutStatus, TimerRegistry};

#[test]
fn test_one_shot_timer_fires_once_within_tolerance() {
    let mut reactor = Reactor::new().unwrap();
    let mut timers = TimerRegistry::new();
    let t = timers.create("one-shot");
    timers.start_with(t, 0.1).unwrap();

    let started = Instant::now();
    let mut fired = 0;
    for _ in 0..100 {
        reactor.take_snapshot(&mut timers, true).unwrap();
        match timers.timed_out(t) {
            TimeoutStatus::Yes => {
                fired += 1;
                break;
            }
            TimeoutStatus::Maybe => continue,
            TimeoutStatus::No => panic!("timer lost its started state"),
        }
    }
    assert_eq!(fired, 1);
    let elapsed = started.elapsed().as_secs_f64();
    assert!(elapsed >= 0.1, "fired early after {:.3}s", elapsed);
    assert!(elapsed < 0.15, "fired late after {:.3}s", elapsed);

    // a later snapshot must not report the same expiry again
    let t2 = timers.create("pacemaker");
    timers.start_with(t2, 0.02).unwrap();
    reactor.take_snapshot(&mut timers, true).unwrap();
    assert_eq!(timers.timed_out(t), TimeoutStatus::No);
}

#[test]
fn test_stopped_timer_never_reports() {
    let mut reactor = Reactor::new().unwrap();
    let mut timers = TimerRegistry::new();
    let t = timers.create("cancelled");
    timers.start_with(t, 0.03).unwrap();
    timers.stop(t);

    let pacemaker = timers.create("pacemaker");
    timers.start_with(pacemaker, 0.05).unwrap();
    reactor.take_snapshot(&mut timers, true).unwrap();
    assert_eq!(timers.timed_out(t), TimeoutStatus::No);
}

#[test]
fn test_earliest_deadline_bounds_blocking_time() {
    let mut reactor = Reactor::new().unwrap();
    let mut timers = TimerRegistry::new();
    let short = timers.create("short");
    let long = timers.create("long");
    timers.start_with(long, 30.0).unwrap();
    timers.start_with(short, 0.05).unwrap();

    let started = Instant::now();
    reactor.take_snapshot(&mut timers, true).unwrap();
    // the snapshot must have waited for the short deadline, not the long one
    assert!(started.elapsed().as_secs_f64() < 1.0);
    assert_eq!(timers.timed_out(short), TimeoutStatus::Yes);
    assert_eq!(timers.timed_out(long), TimeoutStatus::Maybe);
}
