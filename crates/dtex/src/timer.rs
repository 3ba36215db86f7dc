// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer registry: the active-timer list feeding the reactor's deadline.
//!
//! Timers are arena-allocated and linked into the active list by index, so
//! removal during dispatch never invalidates a handle somebody else holds.
//! Timeout evaluation is frozen at the last snapshot (`alt_begin`): a timer
//! that expires *between* two snapshots only reports `Yes` from the snapshot
//! that observed it, which is what the selection construct upstream needs to
//! distinguish "matched" from "might match later".
//!
//! The guard timer is a singleton bounding one test case's wall-clock time.
//! It lives outside the active list but participates in the earliest-deadline
//! computation.

use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{Error, ErrorKind, Result};

/// Monotonic process clock, in seconds since first use.
///
/// All deadlines in the crate use this clock; wall time never enters timer
/// arithmetic.
pub fn time_now() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Handle to a timer slot. Never reused within one registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// Tri-valued timeout answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// Timer is not started.
    No,
    /// Timer is started and had not expired at the last snapshot.
    Maybe,
    /// Timer expired; reporting this consumes the expiry.
    Yes,
}

#[derive(Debug)]
struct TimerSlot {
    name: String,
    has_default: bool,
    default_dur: f64,
    started: bool,
    t_started: f64,
    t_expires: f64,
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

impl TimerSlot {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            has_default: false,
            default_dur: 0.0,
            started: false,
            t_started: 0.0,
            t_expires: 0.0,
            prev: None,
            next: None,
            linked: false,
        }
    }
}

/// Registry of test-layer timers plus the testcase guard timer.
#[derive(Debug)]
pub struct TimerRegistry {
    slots: Vec<TimerSlot>,
    head: Option<usize>,
    tail: Option<usize>,
    backup: Option<(Option<usize>, Option<usize>)>,
    guard: TimerSlot,
    /// Time frozen at the last snapshot.
    alt_begin: f64,
}

fn check_duration(what: &str, name: &str, dur: f64) -> Result<()> {
    if dur < 0.0 {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("{} timer {} with negative duration ({})", what, name, dur),
        ));
    }
    if !dur.is_finite() {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("{} timer {} with non-numeric duration ({})", what, name, dur),
        ));
    }
    Ok(())
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            backup: None,
            guard: TimerSlot::new("<testcase guard timer>"),
            alt_begin: time_now(),
        }
    }

    // ========================================================================
    // Slot management
    // ========================================================================

    pub fn create(&mut self, name: &str) -> TimerId {
        self.slots.push(TimerSlot::new(name));
        TimerId(self.slots.len() - 1)
    }

    pub fn create_with_default(&mut self, name: &str, default_dur: f64) -> Result<TimerId> {
        let id = self.create(name);
        self.set_default_duration(id, default_dur)?;
        Ok(id)
    }

    pub fn set_default_duration(&mut self, id: TimerId, dur: f64) -> Result<()> {
        check_duration("setting the default duration of", &self.slots[id.0].name, dur)?;
        let slot = &mut self.slots[id.0];
        slot.has_default = true;
        slot.default_dur = dur;
        Ok(())
    }

    // ========================================================================
    // Active list linkage
    // ========================================================================

    fn link(&mut self, ix: usize) {
        if self.slots[ix].linked {
            return;
        }
        self.slots[ix].prev = self.tail;
        self.slots[ix].next = None;
        self.slots[ix].linked = true;
        match self.tail {
            Some(t) => self.slots[t].next = Some(ix),
            None => self.head = Some(ix),
        }
        self.tail = Some(ix);
    }

    fn unlink(&mut self, ix: usize) {
        if !self.slots[ix].linked {
            return;
        }
        let (prev, next) = (self.slots[ix].prev, self.slots[ix].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[ix].prev = None;
        self.slots[ix].next = None;
        self.slots[ix].linked = false;
    }

    // ========================================================================
    // Timer operations
    // ========================================================================

    /// Start with the default duration.
    pub fn start(&mut self, id: TimerId) -> Result<()> {
        if !self.slots[id.0].has_default {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "timer {} has no default duration; it can only be started with an explicit one",
                    self.slots[id.0].name
                ),
            ));
        }
        let dur = self.slots[id.0].default_dur;
        self.start_with(id, dur)
    }

    pub fn start_with(&mut self, id: TimerId, dur: f64) -> Result<()> {
        check_duration("starting", &self.slots[id.0].name, dur)?;
        if self.slots[id.0].started {
            log::warn!(
                "[TIMER] re-starting timer {}, which is already active (running or expired)",
                self.slots[id.0].name
            );
            self.unlink(id.0);
        }
        let now = time_now();
        let slot = &mut self.slots[id.0];
        slot.started = true;
        slot.t_started = now;
        slot.t_expires = now + dur;
        self.link(id.0);
        Ok(())
    }

    pub fn stop(&mut self, id: TimerId) {
        if self.slots[id.0].started {
            self.slots[id.0].started = false;
            self.unlink(id.0);
        } else {
            log::warn!("[TIMER] stopping inactive timer {}", self.slots[id.0].name);
        }
    }

    /// Elapsed run time of a running timer, zero otherwise.
    pub fn read(&self, id: TimerId) -> f64 {
        let slot = &self.slots[id.0];
        if !slot.started {
            return 0.0;
        }
        let now = time_now();
        if now >= slot.t_expires {
            0.0
        } else {
            now - slot.t_started
        }
    }

    pub fn running(&self, id: TimerId) -> bool {
        let slot = &self.slots[id.0];
        slot.started && time_now() < slot.t_expires
    }

    /// Timeout status against the frozen snapshot time. `Yes` consumes the
    /// expiry and removes the timer from the active list.
    pub fn timed_out(&mut self, id: TimerId) -> TimeoutStatus {
        if !self.slots[id.0].started {
            return TimeoutStatus::No;
        }
        if self.alt_begin < self.slots[id.0].t_expires {
            return TimeoutStatus::Maybe;
        }
        self.slots[id.0].started = false;
        self.unlink(id.0);
        TimeoutStatus::Yes
    }

    pub fn any_running(&self) -> bool {
        let mut cur = self.head;
        while let Some(ix) = cur {
            if self.slots[ix].started && time_now() < self.slots[ix].t_expires {
                return true;
            }
            cur = self.slots[ix].next;
        }
        false
    }

    pub fn any_timeout(&mut self) -> TimeoutStatus {
        let mut status = TimeoutStatus::No;
        let mut cur = self.head;
        while let Some(ix) = cur {
            cur = self.slots[ix].next;
            match self.timed_out(TimerId(ix)) {
                TimeoutStatus::Yes => return TimeoutStatus::Yes,
                TimeoutStatus::Maybe => status = TimeoutStatus::Maybe,
                TimeoutStatus::No => {}
            }
        }
        status
    }

    pub fn stop_all(&mut self) {
        while let Some(ix) = self.head {
            self.slots[ix].started = false;
            self.unlink(ix);
        }
    }

    /// Earliest expiration over running timers and the guard timer.
    ///
    /// Timers that already expired before the previous snapshot are ignored;
    /// their `Yes` is pending and must not spin the reactor.
    pub fn earliest_deadline(&self) -> Option<f64> {
        let mut min: Option<f64> = None;
        if self.guard.started && self.guard.t_expires >= self.alt_begin {
            min = Some(self.guard.t_expires);
        }
        let mut cur = self.head;
        while let Some(ix) = cur {
            let slot = &self.slots[ix];
            if slot.t_expires >= self.alt_begin && min.map_or(true, |m| slot.t_expires < m) {
                min = Some(slot.t_expires);
            }
            cur = slot.next;
        }
        min
    }

    // ========================================================================
    // Control-timer backup (nested test-case scope)
    // ========================================================================

    pub fn save_control_timers(&mut self) -> Result<()> {
        if self.backup.is_some() {
            return Err(Error::new(
                ErrorKind::General,
                "control-plane timers are already saved",
            ));
        }
        self.backup = Some((self.head, self.tail));
        self.head = None;
        self.tail = None;
        Ok(())
    }

    pub fn restore_control_timers(&mut self) -> Result<()> {
        let (head, tail) = self.backup.take().ok_or_else(|| {
            Error::new(ErrorKind::General, "control-plane timers are not saved")
        })?;
        if self.head.is_some() {
            self.backup = Some((head, tail));
            return Err(Error::new(
                ErrorKind::General,
                "there are active timers; control-plane timers cannot be restored",
            ));
        }
        self.head = head;
        self.tail = tail;
        Ok(())
    }

    // ========================================================================
    // Guard timer
    // ========================================================================

    pub fn start_guard(&mut self, dur: f64) -> Result<()> {
        check_duration("starting", &self.guard.name, dur)?;
        let now = time_now();
        self.guard.started = true;
        self.guard.t_started = now;
        self.guard.t_expires = now + dur;
        Ok(())
    }

    pub fn stop_guard(&mut self) {
        self.guard.started = false;
    }

    pub fn guard_running(&self) -> bool {
        self.guard.started && time_now() < self.guard.t_expires
    }

    /// Guard timeout against the frozen snapshot time; `Yes` consumes it.
    pub fn guard_timeout(&mut self) -> TimeoutStatus {
        if !self.guard.started {
            return TimeoutStatus::No;
        }
        if self.alt_begin < self.guard.t_expires {
            return TimeoutStatus::Maybe;
        }
        self.guard.started = false;
        TimeoutStatus::Yes
    }

    // ========================================================================
    // Snapshot clock
    // ========================================================================

    /// Freeze the evaluation time. Called by the reactor after each snapshot.
    pub fn set_alt_begin(&mut self, t: f64) {
        self.alt_begin = t;
    }

    pub fn alt_begin(&self) -> f64 {
        self.alt_begin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_running() {
        let mut reg = TimerRegistry::new();
        let t = reg.create("t1");
        assert!(!reg.running(t));
        reg.start_with(t, 60.0).unwrap();
        assert!(reg.running(t));
        assert!(reg.any_running());
        reg.stop(t);
        assert!(!reg.running(t));
        assert!(!reg.any_running());
    }

    #[test]
    fn test_negative_and_nan_duration_rejected() {
        let mut reg = TimerRegistry::new();
        let t = reg.create("bad");
        assert_eq!(
            reg.start_with(t, -1.0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            reg.start_with(t, f64::NAN).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            reg.start_guard(-0.5).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_default_duration() {
        let mut reg = TimerRegistry::new();
        let t = reg.create("nodefault");
        assert_eq!(reg.start(t).unwrap_err().kind(), ErrorKind::InvalidArgument);
        let t2 = reg.create_with_default("d", 30.0).unwrap();
        reg.start(t2).unwrap();
        assert!(reg.running(t2));
    }

    #[test]
    fn test_timeout_tri_state_against_snapshot() {
        let mut reg = TimerRegistry::new();
        let t = reg.create("t");
        assert_eq!(reg.timed_out(t), TimeoutStatus::No);
        reg.start_with(t, 1000.0).unwrap();
        reg.set_alt_begin(time_now());
        assert_eq!(reg.timed_out(t), TimeoutStatus::Maybe);
        // move the frozen clock past the deadline
        reg.set_alt_begin(time_now() + 2000.0);
        assert_eq!(reg.timed_out(t), TimeoutStatus::Yes);
        // the expiry is consumed
        assert_eq!(reg.timed_out(t), TimeoutStatus::No);
    }

    #[test]
    fn test_earliest_deadline_prefers_minimum() {
        let mut reg = TimerRegistry::new();
        let a = reg.create("a");
        let b = reg.create("b");
        reg.start_with(a, 500.0).unwrap();
        reg.start_with(b, 100.0).unwrap();
        reg.start_guard(900.0).unwrap();
        let min = reg.earliest_deadline().unwrap();
        let b_expires = time_now() + 100.0;
        assert!((min - b_expires).abs() < 1.0);
    }

    #[test]
    fn test_restart_resets_deadline() {
        let mut reg = TimerRegistry::new();
        let t = reg.create("t");
        reg.start_with(t, 10.0).unwrap();
        let first = reg.earliest_deadline().unwrap();
        reg.start_with(t, 500.0).unwrap();
        let second = reg.earliest_deadline().unwrap();
        assert!(second > first + 400.0);
    }

    #[test]
    fn test_save_restore_control_timers() {
        let mut reg = TimerRegistry::new();
        let t = reg.create("control");
        reg.start_with(t, 1000.0).unwrap();
        reg.save_control_timers().unwrap();
        assert!(!reg.any_running());
        // double save is an error
        assert!(reg.save_control_timers().is_err());
        let tc = reg.create("testcase");
        reg.start_with(tc, 5.0).unwrap();
        // cannot restore while test-case timers are active
        assert!(reg.restore_control_timers().is_err());
        reg.stop(tc);
        reg.restore_control_timers().unwrap();
        assert!(reg.running(t));
    }

    #[test]
    fn test_stop_all_empties_list() {
        let mut reg = TimerRegistry::new();
        for i in 0..5 {
            let t = reg.create(&format!("t{}", i));
            reg.start_with(t, 100.0).unwrap();
        }
        reg.stop_all();
        assert!(!reg.any_running());
        assert!(reg.earliest_deadline().is_none());
    }
}
