// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux `epoll(7)` readiness backend.
//!
//! Level-triggered; interest changes go through `epoll_ctl` at registration
//! time, so the wait call scales with the ready set instead of the
//! registered set. Removal of an fd that was closed before deregistration
//! is tolerated (the kernel already dropped it from the interest list).

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorKind, Result};
use crate::reactor::fdtable::{FdTable, FD_EVENT_ERR, FD_EVENT_RD, FD_EVENT_WR};

/// Upper bound on events drained per wait.
const MAX_EPOLL_EVENTS: usize = 64;

fn to_epoll_events(events: u8) -> u32 {
    let mut out = 0;
    if events & FD_EVENT_RD != 0 {
        out |= libc::EPOLLIN as u32;
    }
    if events & FD_EVENT_WR != 0 {
        out |= libc::EPOLLOUT as u32;
    }
    if events & FD_EVENT_ERR != 0 {
        out |= libc::EPOLLERR as u32;
    }
    out
}

fn from_epoll_events(events: u32) -> u8 {
    let mut out = 0;
    if events & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32) != 0 {
        out |= FD_EVENT_RD;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        out |= FD_EVENT_WR;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        out |= FD_EVENT_ERR;
    }
    out
}

#[derive(Debug)]
pub(crate) struct Backend {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    n_last: usize,
}

impl Backend {
    pub fn new(_capacity: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os(ErrorKind::Fatal, "epoll_create1 failed"));
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS],
            n_last: 0,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn register(&mut self, _table: &mut FdTable, fd: RawFd, total_events: u8) -> Result<()> {
        let bits = to_epoll_events(total_events);
        // ADD for a fresh fd, MOD when interest is widened; a fresh add can
        // race a slot that epoll still tracks, so fall through to the other op.
        match self.ctl(libc::EPOLL_CTL_ADD, fd, bits) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => self
                .ctl(libc::EPOLL_CTL_MOD, fd, bits)
                .map_err(|e| epoll_error("epoll_ctl(MOD)", fd, &e)),
            Err(e) => Err(epoll_error("epoll_ctl(ADD)", fd, &e)),
        }
    }

    pub fn deregister(&mut self, _table: &mut FdTable, fd: RawFd, _ix: i32, removed: u8, remaining: u8) {
        // Mask the fd out of events still pending in the event buffer so a
        // removal during dispatch is final for this snapshot.
        for ev in &mut self.events[..self.n_last] {
            if ev.u64 == fd as u64 {
                ev.events &= !to_epoll_events(removed);
                if remaining == 0 {
                    ev.events = 0;
                }
            }
        }
        let result = if remaining == 0 {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, to_epoll_events(remaining))
        };
        if let Err(e) = result {
            // The fd may have been closed before it was removed from the
            // table, in which case the kernel already dropped it.
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0 {
                log::error!("[REACTOR] epoll_ctl failed when removing fd {}: {}", fd, e);
            }
        }
    }

    pub fn freeze(&mut self) {}

    pub fn unfreeze(&mut self, _table: &mut FdTable) {
        self.n_last = 0;
    }

    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        self.n_last = rc as usize;
        Ok(rc as usize)
    }

    pub fn collect_ready(&self, n_ready: usize) -> Vec<(RawFd, u8)> {
        let mut out = Vec::with_capacity(n_ready);
        for ev in &self.events[..n_ready.min(self.events.len())] {
            let mapped = from_epoll_events(ev.events);
            if mapped != 0 {
                out.push((ev.u64 as RawFd, mapped));
            }
        }
        out
    }

    pub fn revents_of(&self, _table: &FdTable, fd: RawFd) -> u8 {
        for ev in &self.events[..self.n_last] {
            if ev.u64 == fd as u64 {
                return from_epoll_events(ev.events);
            }
        }
        0
    }

    pub fn clear_revents(&mut self) {
        self.n_last = 0;
    }
}

fn epoll_error(what: &str, fd: RawFd, e: &io::Error) -> Error {
    Error::with_errno(
        ErrorKind::Fatal,
        format!("{} failed for fd {}", what, fd),
        e.raw_os_error().unwrap_or(0),
    )
}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
