// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Descriptor registration table: dense below a small capacity, sparse above.
//!
//! Registrations live in a sorted array of up to [`DENSE_CAPACITY`] items
//! (binary-searched, no allocation on the hot path). When the 17th
//! descriptor arrives the table dilates to a per-fd indirection vector sized
//! to the process fd limit; it packs back down once the population drops to
//! [`DENSE_LOW`]. The backend keeps a per-entry index (`ix`) for its own
//! bookkeeping (poll-array position); the table treats it as opaque.

use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorKind, Result};
use crate::reactor::HandlerId;

/// Registrations held inline before dilating to the sparse map.
pub(crate) const DENSE_CAPACITY: usize = 16;
/// Population at which the sparse map packs back into the dense array.
pub(crate) const DENSE_LOW: usize = 8;

pub const FD_EVENT_RD: u8 = 0x01;
pub const FD_EVENT_WR: u8 = 0x02;
pub const FD_EVENT_ERR: u8 = 0x04;
pub const FD_EVENT_MASK: u8 = FD_EVENT_RD | FD_EVENT_WR | FD_EVENT_ERR;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub events: u8,
    pub handler: HandlerId,
    /// Backend bookkeeping index; -1 when not assigned.
    pub ix: i32,
}

#[derive(Debug, Clone, Copy)]
struct DenseItem {
    fd: RawFd,
    entry: Entry,
}

#[derive(Debug)]
pub(crate) struct FdTable {
    capacity: usize,
    dense: Vec<DenseItem>,
    /// fd-indexed spill storage; `None` entries are unused slots.
    sparse: Option<Vec<Option<Entry>>>,
    len: usize,
}

pub(crate) enum RemoveOutcome {
    /// Events removed; `(old, remaining)` masks.
    Removed(u8, u8),
    /// The fd had no registration; callers warn and carry on.
    NotRegistered,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            dense: Vec::with_capacity(DENSE_CAPACITY),
            sparse: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_fd_and_mask(&self, fd: RawFd, events: u8, what: &str) -> Result<()> {
        if fd < 0 || fd as usize >= self.capacity {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("trying to {} events of an invalid file descriptor ({})", what, fd),
            ));
        }
        if events & !FD_EVENT_MASK != 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "trying to {} invalid events ({:#x}) of file descriptor {}",
                    what, events, fd
                ),
            ));
        }
        Ok(())
    }

    fn dense_position(&self, fd: RawFd) -> std::result::Result<usize, usize> {
        self.dense.binary_search_by_key(&fd, |item| item.fd)
    }

    /// Register `events` for `fd`. Returns the event mask present before the
    /// call (0 when the fd was new). A second handler for an already-claimed
    /// fd is a caller bug.
    pub fn add(&mut self, fd: RawFd, handler: HandlerId, events: u8) -> Result<u8> {
        self.check_fd_and_mask(fd, events, "add")?;
        if let Some(sparse) = self.sparse.as_mut() {
            match &mut sparse[fd as usize] {
                Some(entry) => {
                    if entry.handler != handler {
                        return Err(Error::new(
                            ErrorKind::General,
                            format!(
                                "file descriptor {} already has a different event handler",
                                fd
                            ),
                        ));
                    }
                    let old = entry.events;
                    entry.events |= events;
                    Ok(old)
                }
                slot @ None => {
                    *slot = Some(Entry {
                        events,
                        handler,
                        ix: -1,
                    });
                    self.len += 1;
                    Ok(0)
                }
            }
        } else {
            match self.dense_position(fd) {
                Ok(i) => {
                    let entry = &mut self.dense[i].entry;
                    if entry.handler != handler {
                        return Err(Error::new(
                            ErrorKind::General,
                            format!(
                                "file descriptor {} already has a different event handler",
                                fd
                            ),
                        ));
                    }
                    let old = entry.events;
                    entry.events |= events;
                    Ok(old)
                }
                Err(i) => {
                    if self.dense.len() < DENSE_CAPACITY {
                        self.dense.insert(
                            i,
                            DenseItem {
                                fd,
                                entry: Entry {
                                    events,
                                    handler,
                                    ix: -1,
                                },
                            },
                        );
                        self.len += 1;
                        return Ok(0);
                    }
                    // Dilate to the per-fd map, then add.
                    let mut sparse: Vec<Option<Entry>> = vec![None; self.capacity];
                    for item in self.dense.drain(..) {
                        sparse[item.fd as usize] = Some(item.entry);
                    }
                    sparse[fd as usize] = Some(Entry {
                        events,
                        handler,
                        ix: -1,
                    });
                    self.sparse = Some(sparse);
                    self.len += 1;
                    log::debug!(
                        "[REACTOR] fd table dilated to sparse map ({} registrations)",
                        self.len
                    );
                    Ok(0)
                }
            }
        }
    }

    /// Drop `events` from `fd`'s registration. The entry disappears when its
    /// event mask empties; the table may pack back into the dense array.
    pub fn remove(&mut self, fd: RawFd, handler: HandlerId, events: u8) -> Result<RemoveOutcome> {
        self.check_fd_and_mask(fd, events, "remove")?;
        let entry = match self.sparse.as_mut() {
            Some(sparse) => match &mut sparse[fd as usize] {
                Some(entry) => entry,
                None => return Ok(RemoveOutcome::NotRegistered),
            },
            None => match self.dense_position(fd) {
                Ok(i) => &mut self.dense[i].entry,
                Err(_) => return Ok(RemoveOutcome::NotRegistered),
            },
        };
        if entry.handler != handler {
            return Err(Error::new(
                ErrorKind::General,
                format!(
                    "removing events of file descriptor {} owned by a different handler",
                    fd
                ),
            ));
        }
        let old = entry.events;
        entry.events &= !events;
        let remaining = entry.events;
        if remaining == 0 {
            self.drop_entry(fd);
        }
        Ok(RemoveOutcome::Removed(old, remaining))
    }

    fn drop_entry(&mut self, fd: RawFd) {
        if let Some(sparse) = self.sparse.as_mut() {
            sparse[fd as usize] = None;
            self.len -= 1;
            if self.len <= DENSE_LOW {
                // Pack back; the dense array stays ordered by fd.
                let sparse = self.sparse.take().unwrap_or_default();
                for (fd, entry) in sparse.into_iter().enumerate() {
                    if let Some(entry) = entry {
                        self.dense.push(DenseItem {
                            fd: fd as RawFd,
                            entry,
                        });
                    }
                }
                log::debug!(
                    "[REACTOR] fd table packed back to dense array ({} registrations)",
                    self.len
                );
            }
        } else if let Ok(i) = self.dense_position(fd) {
            self.dense.remove(i);
            self.len -= 1;
        }
    }

    pub fn find(&self, fd: RawFd) -> Option<(u8, HandlerId)> {
        if fd < 0 {
            return None;
        }
        match self.sparse.as_ref() {
            Some(sparse) => sparse
                .get(fd as usize)
                .and_then(|e| e.as_ref())
                .map(|e| (e.events, e.handler)),
            None => self
                .dense_position(fd)
                .ok()
                .map(|i| (self.dense[i].entry.events, self.dense[i].entry.handler)),
        }
    }

    pub fn ix(&self, fd: RawFd) -> i32 {
        match self.sparse.as_ref() {
            Some(sparse) => sparse
                .get(fd as usize)
                .and_then(|e| e.as_ref())
                .map_or(-1, |e| e.ix),
            None => self.dense_position(fd).map_or(-1, |i| self.dense[i].entry.ix),
        }
    }

    pub fn set_ix(&mut self, fd: RawFd, ix: i32) {
        match self.sparse.as_mut() {
            Some(sparse) => {
                if let Some(Some(entry)) = sparse.get_mut(fd as usize) {
                    entry.ix = ix;
                }
            }
            None => {
                if let Ok(i) = self.dense_position(fd) {
                    self.dense[i].entry.ix = ix;
                }
            }
        }
    }

    /// All live registrations of one handler. Used to tear a handler down.
    pub fn fds_of(&self, handler: HandlerId) -> Vec<(RawFd, u8)> {
        let mut out = Vec::new();
        match self.sparse.as_ref() {
            Some(sparse) => {
                for (fd, entry) in sparse.iter().enumerate() {
                    if let Some(e) = entry {
                        if e.handler == handler {
                            out.push((fd as RawFd, e.events));
                        }
                    }
                }
            }
            None => {
                for item in &self.dense {
                    if item.entry.handler == handler {
                        out.push((item.fd, item.entry.events));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hid(n: usize) -> HandlerId {
        HandlerId(n)
    }

    #[test]
    fn test_add_find_remove() {
        let mut t = FdTable::new(1024);
        assert_eq!(t.add(5, hid(1), FD_EVENT_RD).unwrap(), 0);
        assert_eq!(t.add(5, hid(1), FD_EVENT_WR).unwrap(), FD_EVENT_RD);
        assert_eq!(t.find(5), Some((FD_EVENT_RD | FD_EVENT_WR, hid(1))));
        match t.remove(5, hid(1), FD_EVENT_RD).unwrap() {
            RemoveOutcome::Removed(old, remaining) => {
                assert_eq!(old, FD_EVENT_RD | FD_EVENT_WR);
                assert_eq!(remaining, FD_EVENT_WR);
            }
            RemoveOutcome::NotRegistered => panic!("was registered"),
        }
        match t.remove(5, hid(1), FD_EVENT_WR).unwrap() {
            RemoveOutcome::Removed(_, remaining) => assert_eq!(remaining, 0),
            RemoveOutcome::NotRegistered => panic!("was registered"),
        }
        assert!(t.find(5).is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_remove_unregistered_is_tolerated() {
        let mut t = FdTable::new(64);
        assert!(matches!(
            t.remove(9, hid(1), FD_EVENT_RD).unwrap(),
            RemoveOutcome::NotRegistered
        ));
    }

    #[test]
    fn test_foreign_handler_rejected() {
        let mut t = FdTable::new(64);
        t.add(3, hid(1), FD_EVENT_RD).unwrap();
        assert!(t.add(3, hid(2), FD_EVENT_WR).is_err());
        assert!(t.remove(3, hid(2), FD_EVENT_RD).is_err());
    }

    #[test]
    fn test_invalid_fd_and_mask() {
        let mut t = FdTable::new(64);
        assert_eq!(
            t.add(-1, hid(1), FD_EVENT_RD).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            t.add(64, hid(1), FD_EVENT_RD).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            t.add(1, hid(1), 0x40).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_dilate_and_pack_back() {
        let mut t = FdTable::new(4096);
        for fd in 0..(DENSE_CAPACITY as RawFd + 4) {
            t.add(fd * 3, hid(7), FD_EVENT_RD).unwrap();
        }
        assert_eq!(t.len(), DENSE_CAPACITY + 4);
        // all lookups survive the dilation
        for fd in 0..(DENSE_CAPACITY as RawFd + 4) {
            assert_eq!(t.find(fd * 3), Some((FD_EVENT_RD, hid(7))));
        }
        // removing down to the low-water mark packs back
        for fd in (DENSE_LOW as RawFd..DENSE_CAPACITY as RawFd + 4).rev() {
            t.remove(fd * 3, hid(7), FD_EVENT_RD).unwrap();
        }
        assert_eq!(t.len(), DENSE_LOW);
        for fd in 0..DENSE_LOW as RawFd {
            assert_eq!(t.find(fd * 3), Some((FD_EVENT_RD, hid(7))));
        }
    }

    #[test]
    fn test_fds_of_enumerates_handler() {
        let mut t = FdTable::new(256);
        t.add(1, hid(1), FD_EVENT_RD).unwrap();
        t.add(2, hid(2), FD_EVENT_RD).unwrap();
        t.add(3, hid(1), FD_EVENT_WR).unwrap();
        let mut fds = t.fds_of(hid(1));
        fds.sort_unstable();
        assert_eq!(fds, vec![(1, FD_EVENT_RD), (3, FD_EVENT_WR)]);
    }
}
