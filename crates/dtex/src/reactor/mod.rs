// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded readiness reactor.
//!
//! One blocking call per process: the reactor owns it. Everything else
//! (socket handling, control-plane dispatch, timer expiry) happens in
//! handler callbacks made from [`Reactor::take_snapshot`], on the calling
//! thread, one at a time.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                          Reactor                             |
//! |  +--------------------+      +--------------------------+    |
//! |  |      FdTable       |      |         Backend          |    |
//! |  | dense<=16 / sparse |<---->| epoll (Linux) or poll(2) |    |
//! |  +--------------------+      +--------------------------+    |
//! |            |                                                 |
//! |            v                                                 |
//! |  +--------------------+      +--------------------------+    |
//! |  |   handler arena    |      |  handler timers (timed)  |    |
//! |  | Rc<RefCell<dyn ..>>|      |  interval / one-shot     |    |
//! |  +--------------------+      +--------------------------+    |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Ordering
//!
//! Within one snapshot, readiness callbacks run before timeout callbacks;
//! timeout callbacks run in increasing deadline order. A handler removed
//! during a snapshot sees no further callback from that snapshot: the
//! registration table is consulted immediately before every delivery, and
//! each backend stages removals so stale readiness cannot resurface.
//!
//! # Failure modes
//!
//! `EINTR` from the blocking primitive retries transparently. Any other
//! failure of the blocking primitive is fatal and surfaces as
//! `ErrorKind::Fatal` from `take_snapshot`.

mod fdtable;

#[cfg(all(target_os = "linux", not(feature = "force-poll")))]
mod backend_epoll;
#[cfg(all(target_os = "linux", not(feature = "force-poll")))]
use backend_epoll::Backend;

#[cfg(any(not(target_os = "linux"), feature = "force-poll"))]
mod backend_poll;
#[cfg(any(not(target_os = "linux"), feature = "force-poll"))]
use backend_poll::Backend;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::error::{Error, ErrorKind, Result};
use crate::timer::{time_now, TimeoutStatus, TimerRegistry};

use fdtable::{FdTable, RemoveOutcome};

pub use fdtable::{FD_EVENT_ERR, FD_EVENT_MASK, FD_EVENT_RD, FD_EVENT_WR};

/// Longest single block in the readiness primitive, in seconds. Derived from
/// the millisecond range of `poll(2)`'s timeout argument.
const MAX_BLOCK_TIME_SECS: f64 = (i32::MAX / 1000) as f64;

/// Handle to a registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) usize);

/// Callback interface for descriptor readiness and handler timeouts.
///
/// Implementors are registered once and referenced by [`HandlerId`]; one
/// handler may own any number of descriptor registrations.
pub trait EventHandler {
    fn handle_fd_event(
        &mut self,
        reactor: &mut Reactor,
        fd: RawFd,
        readable: bool,
        writable: bool,
        is_error: bool,
    );

    /// Periodic or one-shot timeout, independent of descriptor activity.
    fn handle_timeout(&mut self, reactor: &mut Reactor, _since_last_call: f64) {
        let _ = reactor;
        log::error!("[REACTOR] handler {:?} has a timer but no timeout hook", self.label());
    }

    fn label(&self) -> &str {
        "handler <unknown>"
    }
}

/// No-op handler backing `block_for_writable` on otherwise unowned fds.
struct NullHandler;

impl EventHandler for NullHandler {
    fn handle_fd_event(&mut self, _: &mut Reactor, _: RawFd, _: bool, _: bool, _: bool) {}

    fn label(&self) -> &str {
        "handler <writability wait>"
    }
}

#[derive(Debug, Clone, Copy)]
struct HandlerTimer {
    interval: f64,
    last_called: f64,
    /// Call even when the handler saw descriptor activity this snapshot.
    call_anyway: bool,
    periodic: bool,
}

struct HandlerSlot {
    handler: Rc<RefCell<dyn EventHandler>>,
    fd_count: usize,
    timer: Option<HandlerTimer>,
    /// Descriptor activity seen in the current snapshot.
    has_event: bool,
}

pub struct Reactor {
    table: FdTable,
    backend: Backend,
    handlers: Vec<Option<HandlerSlot>>,
    /// Handlers with an installed timer, in installation order.
    timed: Vec<usize>,
    in_dispatch: bool,
    null_handler: HandlerId,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let capacity = if open_max > 0 && open_max <= i32::MAX as i64 {
            open_max as usize
        } else {
            i32::MAX as usize
        };
        let mut reactor = Self {
            table: FdTable::new(capacity),
            backend: Backend::new(capacity)?,
            handlers: Vec::new(),
            timed: Vec::new(),
            in_dispatch: false,
            null_handler: HandlerId(0),
        };
        reactor.null_handler = reactor.register_handler(Rc::new(RefCell::new(NullHandler)));
        Ok(reactor)
    }

    /// Highest number of descriptors the OS lets this process hold.
    pub fn fd_limit(&self) -> usize {
        self.table.capacity()
    }

    pub fn in_dispatch(&self) -> bool {
        self.in_dispatch
    }

    // ========================================================================
    // Handler registration
    // ========================================================================

    pub fn register_handler(&mut self, handler: Rc<RefCell<dyn EventHandler>>) -> HandlerId {
        self.handlers.push(Some(HandlerSlot {
            handler,
            fd_count: 0,
            timer: None,
            has_event: false,
        }));
        HandlerId(self.handlers.len() - 1)
    }

    /// Drop a handler. Its timer is cancelled and any descriptor
    /// registrations it forgot to remove are removed here.
    pub fn unregister_handler(&mut self, id: HandlerId) -> Result<()> {
        self.set_timer(id, 0.0, true, true);
        self.remove_all_fds(id)?;
        self.handlers[id.0] = None;
        Ok(())
    }

    pub fn remove_all_fds(&mut self, id: HandlerId) -> Result<()> {
        for (fd, events) in self.table.fds_of(id) {
            self.remove_fd(fd, id, events)?;
        }
        Ok(())
    }

    // ========================================================================
    // Descriptor interest
    // ========================================================================

    pub fn add_fd(&mut self, fd: RawFd, id: HandlerId, events: u8) -> Result<()> {
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(Error::last_os(
                ErrorKind::InvalidArgument,
                format!("trying to add events of an invalid file descriptor ({})", fd),
            ));
        }
        let old = self.table.add(fd, id, events)?;
        if old == 0 {
            if let Some(slot) = self.handlers[id.0].as_mut() {
                slot.fd_count += 1;
            }
        }
        self.backend.register(&mut self.table, fd, old | events)
    }

    pub fn remove_fd(&mut self, fd: RawFd, id: HandlerId, events: u8) -> Result<()> {
        let ix = self.table.ix(fd);
        match self.table.remove(fd, id, events)? {
            RemoveOutcome::NotRegistered => {
                log::warn!(
                    "[REACTOR] removing events {:#x} of fd {} which has no handler",
                    events,
                    fd
                );
                Ok(())
            }
            RemoveOutcome::Removed(old, remaining) => {
                if old != 0 && remaining == 0 {
                    if let Some(slot) = self.handlers[id.0].as_mut() {
                        slot.fd_count -= 1;
                    }
                }
                self.backend
                    .deregister(&mut self.table, fd, ix, old & events, remaining);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Handler timers
    // ========================================================================

    /// Install (interval > 0) or cancel (interval == 0) a handler timer.
    ///
    /// `call_anyway` decides whether the timeout still fires in a snapshot
    /// where the handler already saw descriptor activity. One-shot timers
    /// (`periodic == false`) uninstall themselves after their first
    /// opportunity to fire.
    pub fn set_timer(&mut self, id: HandlerId, interval: f64, periodic: bool, call_anyway: bool) {
        let Some(slot) = self.handlers[id.0].as_mut() else {
            return;
        };
        if interval != 0.0 {
            if slot.timer.is_none() {
                self.timed.push(id.0);
            }
            slot.timer = Some(HandlerTimer {
                interval,
                last_called: time_now(),
                call_anyway,
                periodic,
            });
        } else {
            slot.timer = None;
            slot.has_event = false;
            self.timed.retain(|&h| h != id.0);
        }
    }

    fn handler_earliest_deadline(&self) -> Option<f64> {
        let mut min: Option<f64> = None;
        for &h in &self.timed {
            if let Some(slot) = self.handlers[h].as_ref() {
                if let Some(t) = slot.timer {
                    let due = t.last_called + t.interval;
                    if min.map_or(true, |m| due < m) {
                        min = Some(due);
                    }
                }
            }
        }
        min
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Wait (or poll, when `blocking` is false) for readiness and dispatch.
    ///
    /// Returns an error when the guard timer expired during this snapshot,
    /// when the blocking primitive failed fatally, or when blocking forever
    /// with nothing to wake us up.
    pub fn take_snapshot(&mut self, timers: &mut TimerRegistry, blocking: bool) -> Result<()> {
        loop {
            let mut handle_timer = false;
            let mut deadline = 0.0f64;
            let poll_timeout: i32 = if blocking {
                let min = match (timers.earliest_deadline(), self.handler_earliest_deadline()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                match min {
                    Some(d) => {
                        deadline = d;
                        let block_time = d - time_now();
                        if block_time <= 0.0 {
                            // already expired: dispatch without blocking
                            handle_timer = true;
                            0
                        } else if block_time < MAX_BLOCK_TIME_SECS {
                            handle_timer = true;
                            (block_time * 1000.0).floor() as i32
                        } else {
                            log::warn!(
                                "[REACTOR] first timer expiry is {:.0} s away; \
                                 clamping the blocking time to {:.0} s",
                                block_time,
                                MAX_BLOCK_TIME_SECS
                            );
                            deadline = time_now() + MAX_BLOCK_TIME_SECS;
                            handle_timer = true;
                            (MAX_BLOCK_TIME_SECS * 1000.0) as i32
                        }
                    }
                    None => -1,
                }
            } else {
                0
            };

            if self.table.len() == 0 && poll_timeout < 0 {
                return Err(Error::new(
                    ErrorKind::General,
                    "there are no active timers and no installed event handlers; \
                     execution would block forever",
                ));
            }

            let n_ready = if self.table.len() != 0 {
                match self.backend.wait(poll_timeout) {
                    Ok(n) => n,
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::with_errno(
                            ErrorKind::Fatal,
                            "readiness wait failed while taking a new snapshot",
                            e.raw_os_error().unwrap_or(0),
                        ))
                    }
                }
            } else {
                if poll_timeout > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(poll_timeout as u64));
                }
                0
            };

            if n_ready > 0 {
                self.call_fd_handlers(n_ready);
            } else if handle_timer && poll_timeout > 0 {
                // The wait may return marginally early; go around for a long
                // shortfall, spin for a sub-millisecond one.
                let diff = time_now() - deadline;
                if diff < 0.0 {
                    if diff < -0.001 {
                        continue;
                    }
                    while time_now() < deadline {}
                }
            }

            if n_ready > 0 || handle_timer {
                self.call_timeout_handlers();
            }
            break;
        }

        timers.set_alt_begin(time_now());
        if timers.guard_timeout() == TimeoutStatus::Yes {
            return Err(Error::new(
                ErrorKind::General,
                "guard timer has expired; execution of the current test case will be interrupted",
            ));
        }
        Ok(())
    }

    fn call_fd_handlers(&mut self, n_ready: usize) {
        self.in_dispatch = true;
        self.backend.freeze();
        let ready = self.backend.collect_ready(n_ready);
        for (fd, revents) in ready {
            // Consult the live table: the handler may have been removed (or
            // replaced) by an earlier callback of this same snapshot.
            let Some((wanted, hid)) = self.table.find(fd) else {
                continue;
            };
            let events = revents & (wanted | FD_EVENT_ERR);
            if events == 0 {
                continue;
            }
            let Some(slot) = self.handlers[hid.0].as_ref() else {
                continue;
            };
            let handler = Rc::clone(&slot.handler);
            handler.borrow_mut().handle_fd_event(
                self,
                fd,
                events & FD_EVENT_RD != 0,
                events & FD_EVENT_WR != 0,
                events & FD_EVENT_ERR != 0,
            );
            if let Some(slot) = self.handlers[hid.0].as_mut() {
                if slot.timer.is_some() {
                    slot.has_event = true;
                }
            }
        }
        self.backend.unfreeze(&mut self.table);
        self.in_dispatch = false;
    }

    fn call_timeout_handlers(&mut self) {
        // Deadline order, not installation order.
        let mut due: Vec<(usize, f64)> = Vec::new();
        for &h in &self.timed {
            if let Some(slot) = self.handlers[h].as_ref() {
                if let Some(t) = slot.timer {
                    due.push((h, t.last_called + t.interval));
                }
            }
        }
        due.sort_by(|a, b| a.1.total_cmp(&b.1));

        for (h, _) in due {
            // Re-check: an earlier timeout callback may have cancelled this one.
            let Some(slot) = self.handlers[h].as_mut() else {
                continue;
            };
            let Some(t) = slot.timer else { continue };
            let now = time_now();
            let call = if slot.has_event {
                t.call_anyway
            } else {
                now > t.last_called + t.interval
            };
            if !t.periodic && (call || slot.has_event) {
                slot.timer = None;
                self.timed.retain(|&x| x != h);
            }
            let since = now - t.last_called;
            let Some(slot) = self.handlers[h].as_mut() else {
                continue;
            };
            slot.has_event = false;
            if call {
                if let Some(t) = slot.timer.as_mut() {
                    t.last_called = now;
                }
                let handler = Rc::clone(&slot.handler);
                handler.borrow_mut().handle_timeout(self, since);
            }
        }
    }

    // ========================================================================
    // Synchronous writability wait
    // ========================================================================

    /// Resolve a partial write: wait until `fd` is writable (or errors).
    ///
    /// From inside a handler callback, or when the descriptor is owned by
    /// a live handler, this waits on the one descriptor without dispatching,
    /// so the executing handler can never be re-entered. Otherwise it drives
    /// nested snapshots, dispatching other handlers while it waits, like a
    /// nested reactor entry.
    pub fn block_for_writable(&mut self, fd: RawFd) -> Result<()> {
        let existing = self.table.find(fd);
        if let Some((events, _)) = existing {
            if events & FD_EVENT_WR != 0 {
                return Err(Error::new(
                    ErrorKind::General,
                    format!("an event handler already waits for fd {} to become writable", fd),
                ));
            }
        }
        let owned_by_component = existing.map_or(false, |(_, h)| h != self.null_handler);
        if self.in_dispatch || owned_by_component {
            return wait_single_fd_writable(fd);
        }

        let hid = self.null_handler;
        self.add_fd(fd, hid, FD_EVENT_WR)?;
        let result = loop {
            let n_ready = match self.backend.wait(-1) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    break Err(Error::with_errno(
                        ErrorKind::Fatal,
                        "readiness wait failed while blocking for writability",
                        e.raw_os_error().unwrap_or(0),
                    ))
                }
            };
            let revents = self.backend.revents_of(&self.table, fd);
            if revents & FD_EVENT_WR != 0 {
                break Ok(());
            }
            self.call_fd_handlers(n_ready);
            if revents != 0 {
                // The descriptor reported something other than writability
                // (error or hangup): let the caller's write surface it.
                break Ok(());
            }
        };
        self.remove_fd(fd, hid, FD_EVENT_WR)?;
        self.backend.clear_revents();
        result
    }
}

/// Level wait for writability on a single descriptor, no dispatch.
fn wait_single_fd_writable(fd: RawFd) -> Result<()> {
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::with_errno(
                ErrorKind::Fatal,
                "poll failed while blocking for writability",
                e.raw_os_error().unwrap_or(0),
            ));
        }
        if pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    struct Recorder {
        fd_events: Vec<RawFd>,
        timeouts: usize,
        remove_self_on_event: Option<RawFd>,
    }

    impl Recorder {
        fn new() -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                fd_events: Vec::new(),
                timeouts: 0,
                remove_self_on_event: None,
            }))
        }
    }

    struct RecorderHandler {
        state: Rc<RefCell<Recorder>>,
        id: HandlerId,
    }

    impl EventHandler for RecorderHandler {
        fn handle_fd_event(
            &mut self,
            reactor: &mut Reactor,
            fd: RawFd,
            readable: bool,
            _writable: bool,
            _is_error: bool,
        ) {
            if readable {
                let mut buf = [0u8; 64];
                unsafe {
                    libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
                }
            }
            let remove = self.state.borrow().remove_self_on_event;
            self.state.borrow_mut().fd_events.push(fd);
            if let Some(target) = remove {
                if target == fd {
                    reactor.remove_fd(fd, self.id, FD_EVENT_RD).unwrap();
                }
            }
        }

        fn handle_timeout(&mut self, _reactor: &mut Reactor, _since: f64) {
            self.state.borrow_mut().timeouts += 1;
        }

        fn label(&self) -> &str {
            "recorder"
        }
    }

    fn register_recorder(reactor: &mut Reactor, state: &Rc<RefCell<Recorder>>) -> HandlerId {
        // two-phase: the handler needs its own id for self-removal
        let handler = Rc::new(RefCell::new(RecorderHandler {
            state: Rc::clone(state),
            id: HandlerId(usize::MAX),
        }));
        let id = reactor.register_handler(handler.clone());
        handler.borrow_mut().id = id;
        id
    }

    #[test]
    fn test_readable_pipe_dispatches_handler() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        let (rd, wr) = make_pipe();
        let state = Recorder::new();
        let id = register_recorder(&mut reactor, &state);
        reactor.add_fd(rd, id, FD_EVENT_RD).unwrap();

        unsafe {
            libc::write(wr, b"x".as_ptr().cast(), 1);
        }
        reactor.take_snapshot(&mut timers, true).unwrap();
        assert_eq!(state.borrow().fd_events, vec![rd]);

        // nothing pending: a non-blocking snapshot stays quiet
        reactor.take_snapshot(&mut timers, false).unwrap();
        assert_eq!(state.borrow().fd_events, vec![rd]);

        reactor.remove_fd(rd, id, FD_EVENT_RD).unwrap();
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_self_removal_stops_callbacks() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        let (rd, wr) = make_pipe();
        let state = Recorder::new();
        let id = register_recorder(&mut reactor, &state);
        state.borrow_mut().remove_self_on_event = Some(rd);
        reactor.add_fd(rd, id, FD_EVENT_RD).unwrap();

        unsafe {
            libc::write(wr, b"ab".as_ptr().cast(), 2);
        }
        reactor.take_snapshot(&mut timers, true).unwrap();
        assert_eq!(state.borrow().fd_events.len(), 1);

        // data may remain, but the registration is gone
        unsafe {
            libc::write(wr, b"c".as_ptr().cast(), 1);
        }
        reactor.take_snapshot(&mut timers, false).unwrap();
        assert_eq!(state.borrow().fd_events.len(), 1);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_one_shot_handler_timer_fires_once() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        let state = Recorder::new();
        let id = register_recorder(&mut reactor, &state);
        reactor.set_timer(id, 0.02, false, true);

        let started = time_now();
        reactor.take_snapshot(&mut timers, true).unwrap();
        assert!(time_now() - started < 1.0, "snapshot blocked far too long");
        assert_eq!(state.borrow().timeouts, 1);

        reactor.take_snapshot(&mut timers, false).unwrap();
        assert_eq!(state.borrow().timeouts, 1);
    }

    #[test]
    fn test_guard_timer_interrupts_snapshot() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        timers.start_guard(0.01).unwrap();
        // guard is the only deadline; the snapshot waits it out and reports
        let err = loop {
            match reactor.take_snapshot(&mut timers, true) {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), ErrorKind::General);
        assert!(err.message().contains("guard timer"));
    }

    #[test]
    fn test_snapshot_without_work_errors() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        let err = reactor.take_snapshot(&mut timers, true).unwrap_err();
        assert!(err.message().contains("block forever"));
    }

    #[test]
    fn test_block_for_writable_on_ready_fd() {
        let mut reactor = Reactor::new().unwrap();
        let (rd, wr) = make_pipe();
        // an empty pipe's write end is writable immediately
        reactor.block_for_writable(wr).unwrap();
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_periodic_timer_fires_repeatedly() {
        let mut reactor = Reactor::new().unwrap();
        let mut timers = TimerRegistry::new();
        let state = Recorder::new();
        let id = register_recorder(&mut reactor, &state);
        reactor.set_timer(id, 0.01, true, true);
        for _ in 0..3 {
            reactor.take_snapshot(&mut timers, true).unwrap();
        }
        assert!(state.borrow().timeouts >= 3);
        reactor.set_timer(id, 0.0, true, true);
        reactor.take_snapshot(&mut timers, false).unwrap();
        let after = state.borrow().timeouts;
        reactor.take_snapshot(&mut timers, false).unwrap();
        assert_eq!(state.borrow().timeouts, after);
    }
}
