// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX `poll(2)` readiness backend.
//!
//! The poll array is the backend's own structure; the fd table's `ix` field
//! points each registration at its array slot. During dispatch the array is
//! frozen: entries removed by a handler keep their slot with a zeroed event
//! mask, and compaction runs only after every callback of the snapshot has
//! returned. Compaction swap-fills from the tail and fixes the moved
//! entry's `ix` through the table.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::reactor::fdtable::{FdTable, FD_EVENT_ERR, FD_EVENT_RD, FD_EVENT_WR};

fn to_poll_events(events: u8) -> i16 {
    let mut out = 0;
    if events & FD_EVENT_RD != 0 {
        out |= libc::POLLIN;
    }
    if events & FD_EVENT_WR != 0 {
        out |= libc::POLLOUT;
    }
    if events & FD_EVENT_ERR != 0 {
        out |= libc::POLLERR;
    }
    out
}

fn from_poll_events(revents: i16) -> u8 {
    let mut out = 0;
    if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
        out |= FD_EVENT_RD;
    }
    if revents & libc::POLLOUT != 0 {
        out |= FD_EVENT_WR;
    }
    if revents & libc::POLLERR != 0 {
        out |= FD_EVENT_ERR;
    }
    out
}

#[derive(Debug)]
pub(crate) struct Backend {
    pollfds: Vec<libc::pollfd>,
    /// Entries below this index may not be compacted away.
    frozen: usize,
    /// A frozen entry was logically removed; compaction is pending.
    need_update: bool,
}

impl Backend {
    pub fn new(_capacity: usize) -> Result<Self> {
        Ok(Self {
            pollfds: Vec::new(),
            frozen: 0,
            need_update: false,
        })
    }

    /// Mirror a registration into the poll array.
    pub fn register(&mut self, table: &mut FdTable, fd: RawFd, total_events: u8) -> Result<()> {
        let ix = table.ix(fd);
        if ix >= 0 {
            self.pollfds[ix as usize].events = to_poll_events(total_events);
            return Ok(());
        }
        // A slot may linger for this fd from a deferred (frozen) removal.
        if self.need_update {
            if let Some(pos) = self.pollfds.iter().position(|p| p.fd == fd) {
                self.pollfds[pos].events = to_poll_events(total_events);
                self.pollfds[pos].revents = 0;
                table.set_ix(fd, pos as i32);
                return Ok(());
            }
        }
        self.pollfds.push(libc::pollfd {
            fd,
            events: to_poll_events(total_events),
            revents: 0,
        });
        table.set_ix(fd, (self.pollfds.len() - 1) as i32);
        Ok(())
    }

    /// Mirror a (partial) deregistration. `ix` is the slot the table held
    /// for this fd before the entry was dropped.
    pub fn deregister(&mut self, table: &mut FdTable, fd: RawFd, ix: i32, _removed: u8, remaining: u8) {
        if ix < 0 {
            return;
        }
        let ix = ix as usize;
        debug_assert_eq!(self.pollfds[ix].fd, fd);
        self.pollfds[ix].events = to_poll_events(remaining);
        self.pollfds[ix].revents &= self.pollfds[ix].events | libc::POLLERR | libc::POLLHUP;
        if remaining != 0 {
            return;
        }
        if ix < self.frozen {
            // Frozen: the removal is staged and committed on unfreeze.
            self.pollfds[ix].revents = 0;
            self.need_update = true;
            return;
        }
        self.compact_out(table, ix);
    }

    fn compact_out(&mut self, table: &mut FdTable, ix: usize) {
        let last = self.pollfds.len() - 1;
        if ix < last {
            self.pollfds.swap(ix, last);
            let moved = self.pollfds[ix].fd;
            table.set_ix(moved, ix as i32);
        }
        self.pollfds.pop();
    }

    pub fn freeze(&mut self) {
        self.frozen = self.pollfds.len();
    }

    pub fn unfreeze(&mut self, table: &mut FdTable) {
        self.frozen = 0;
        if !self.need_update {
            return;
        }
        let mut ix = 0;
        while ix < self.pollfds.len() {
            if self.pollfds[ix].events == 0 {
                self.compact_out(table, ix);
            } else {
                ix += 1;
            }
        }
        self.need_update = false;
    }

    /// Block in `poll(2)`. Returns the ready count; `EINTR` surfaces as an
    /// `io::Error` for the caller's retry loop.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Snapshot of ready descriptors, in poll-array order.
    pub fn collect_ready(&self, _n_ready: usize) -> Vec<(RawFd, u8)> {
        let mut out = Vec::new();
        for p in &self.pollfds {
            let ev = from_poll_events(p.revents);
            if ev != 0 {
                out.push((p.fd, ev));
            }
        }
        out
    }

    /// Received events of one descriptor from the last wait.
    pub fn revents_of(&self, table: &FdTable, fd: RawFd) -> u8 {
        let ix = table.ix(fd);
        if ix < 0 {
            return 0;
        }
        from_poll_events(self.pollfds[ix as usize].revents)
    }

    /// Drop stale received events (after a wait whose events were not
    /// dispatched through the regular path).
    pub fn clear_revents(&mut self) {
        for p in &mut self.pollfds {
            p.revents = 0;
        }
    }
}
