//! Single-threaded cooperative event loop: I/O readiness + a sorted timer set.
//!
//! Grounded on the teacher crate's two hand-rolled waiting primitives —
//! `core::wait::{futex_wait, futex_wake}`'s `#[cfg(target_os = "linux")]` /
//! portable-fallback split, and `notifier::platform::ReaderNotifier::wait`'s
//! `libc::poll` loop — generalised from "wait on one fd" to "wait on many fds
//! plus a timer deadline". Handler storage is an identity-keyed registry (§9:
//! "raw pointer graphs become identity-keyed registries") rather than raw
//! pointers: fds index directly into a `HashMap`, and a dropped registration is
//! a map removal, never a dangling pointer.

mod timer;

pub use timer::TimerId;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Why [`Reactor::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitReason {
    /// `quit(reason)` was called from a handler or timer.
    Requested(String),
    /// `stop_by_signal()` was called (signal-safe: only sets an atomic flag).
    Signal,
    /// A handler's `on_exception` hook re-threw.
    Exception(String),
}

type IoCallback = Box<dyn FnMut(&mut Reactor) -> Result<()>>;
type ExceptionCallback = Box<dyn FnMut(&mut Reactor, Error) -> Result<()>>;
type TimerCallback = Box<dyn FnMut(&mut Reactor)>;

struct IoSlot {
    callback: IoCallback,
    on_exception: Option<ExceptionCallback>,
    dead: bool,
}

#[derive(Default)]
struct IoTable {
    slots: HashMap<RawFd, IoSlot>,
    pending: Vec<(RawFd, IoSlot)>,
}

impl IoTable {
    fn insert(&mut self, fd: RawFd, slot: IoSlot, dispatching: bool) {
        if dispatching {
            self.pending.push((fd, slot));
        } else {
            self.slots.insert(fd, slot);
        }
    }

    fn drop_fd(&mut self, fd: RawFd, dispatching: bool) {
        if dispatching {
            if let Some(slot) = self.slots.get_mut(&fd) {
                slot.dead = true;
            }
            self.pending.retain(|(pfd, _)| *pfd != fd);
        } else {
            self.slots.remove(&fd);
        }
    }

    fn merge_pending(&mut self) {
        for (fd, slot) in self.pending.drain(..) {
            self.slots.insert(fd, slot);
        }
    }

    fn gc(&mut self) {
        self.slots.retain(|_, slot| !slot.dead);
    }
}

struct TimerSlot {
    deadline: Instant,
    seq: u64,
    active: bool,
    callback: TimerCallback,
}

#[derive(Clone, Copy)]
enum IoClass {
    Read,
    Write,
    Exception,
}

impl IoClass {
    fn table_mut(self, reactor: &mut Reactor) -> &mut IoTable {
        match self {
            IoClass::Read => &mut reactor.read,
            IoClass::Write => &mut reactor.write,
            IoClass::Exception => &mut reactor.exception,
        }
    }
}

/// The event loop itself. One per process; construct your own in tests rather
/// than reaching for a singleton (§9: "global singletons become a context value
/// passed into components at construction").
pub struct Reactor {
    read: IoTable,
    write: IoTable,
    exception: IoTable,
    timers: Vec<TimerSlot>,
    next_timer_seq: u64,
    dispatching: bool,
    quit_reason: Option<QuitReason>,
    signal_stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            read: IoTable::default(),
            write: IoTable::default(),
            exception: IoTable::default(),
            timers: Vec::new(),
            next_timer_seq: 0,
            dispatching: false,
            quit_reason: None,
            signal_stop: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// A clone-able flag safe to flip from a signal handler (no allocation, no
    /// lock): `reactor.signal_flag().store(true, Ordering::Release)`.
    pub fn signal_flag(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.signal_stop.clone()
    }

    pub fn add_read(&mut self, fd: RawFd, callback: impl FnMut(&mut Reactor) -> Result<()> + 'static) {
        self.read.insert(
            fd,
            IoSlot { callback: Box::new(callback), on_exception: None, dead: false },
            self.dispatching,
        );
    }

    pub fn add_read_with_exception(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor) -> Result<()> + 'static,
        on_exception: impl FnMut(&mut Reactor, Error) -> Result<()> + 'static,
    ) {
        self.read.insert(
            fd,
            IoSlot { callback: Box::new(callback), on_exception: Some(Box::new(on_exception)), dead: false },
            self.dispatching,
        );
    }

    pub fn add_write(&mut self, fd: RawFd, callback: impl FnMut(&mut Reactor) -> Result<()> + 'static) {
        self.write.insert(
            fd,
            IoSlot { callback: Box::new(callback), on_exception: None, dead: false },
            self.dispatching,
        );
    }

    pub fn add_exception(&mut self, fd: RawFd, callback: impl FnMut(&mut Reactor) -> Result<()> + 'static) {
        self.exception.insert(
            fd,
            IoSlot { callback: Box::new(callback), on_exception: None, dead: false },
            self.dispatching,
        );
    }

    pub fn drop_read(&mut self, fd: RawFd) {
        self.read.drop_fd(fd, self.dispatching);
    }

    pub fn drop_write(&mut self, fd: RawFd) {
        self.write.drop_fd(fd, self.dispatching);
    }

    pub fn drop_exception(&mut self, fd: RawFd) {
        self.exception.drop_fd(fd, self.dispatching);
    }

    /// Arm a one-shot timer. Returns an id usable with `cancel_timeout`.
    pub fn set_timeout(&mut self, delay: Duration, callback: impl FnMut(&mut Reactor) + 'static) -> TimerId {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.timers.push(TimerSlot {
            deadline: Instant::now() + delay,
            seq,
            active: true,
            callback: Box::new(callback),
        });
        TimerId(seq)
    }

    pub fn cancel_timeout(&mut self, id: TimerId) {
        if let Some(slot) = self.timers.iter_mut().find(|t| t.seq == id.0) {
            slot.active = false;
        }
    }

    /// Request a clean shutdown; takes effect after the current handler
    /// returns and before the next readiness wait.
    pub fn quit(&mut self, reason: impl Into<String>) {
        self.quit_reason = Some(QuitReason::Requested(reason.into()));
    }

    /// Signal-safe: only a non-blocking atomic store.
    pub fn stop_by_signal(&self) {
        self.signal_stop.store(true, std::sync::atomic::Ordering::Release);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter(|t| t.active).map(|t| t.deadline).min()
    }

    /// Run until `quit`/`stop_by_signal` or an unhandled exception. Returns the
    /// reason the loop stopped.
    pub fn run(&mut self) -> QuitReason {
        loop {
            if self.signal_stop.load(std::sync::atomic::Ordering::Acquire) {
                return QuitReason::Signal;
            }
            if let Some(reason) = self.quit_reason.take() {
                return reason;
            }

            let now = Instant::now();
            let timeout = self.next_deadline().map(|d| d.saturating_duration_since(now));

            match self.wait_for_readiness(timeout) {
                Ok((readable, writable, exceptional)) => {
                    self.fire_expired_timers();
                    if let Some(reason) = self.quit_reason.take() {
                        return reason;
                    }
                    if let Err(reason) = self.dispatch(&readable, &writable, &exceptional) {
                        return reason;
                    }
                }
                Err(err) => return QuitReason::Exception(err.to_string()),
            }
        }
    }

    fn fire_expired_timers(&mut self) {
        let now = Instant::now();
        loop {
            let due_seq = self
                .timers
                .iter()
                .filter(|t| t.active && t.deadline <= now)
                .min_by_key(|t| t.order_key_for_fire())
                .map(|t| t.seq);
            let Some(seq) = due_seq else { break };
            let idx = self.timers.iter().position(|t| t.seq == seq).unwrap();
            let mut slot = self.timers.remove(idx);
            if !slot.active {
                continue;
            }
            (slot.callback)(self);
            if self.quit_reason.is_some() {
                return;
            }
        }
    }

    /// read before write before exception, in fd-registration order within
    /// each class (§5: "across fds, the order is unspecified" — we use
    /// insertion order, which is a valid refinement of "unspecified").
    ///
    /// Each class's `IoTable` is detached from `self` (via `mem::take`)
    /// before its handlers run, so a handler that reentrantly calls
    /// `add_read`/`drop_read`/`set_timeout` on `&mut Reactor` never aliases
    /// the table this loop is iterating — no raw pointers needed. The
    /// detached table is merged back in once its class finishes.
    fn dispatch(&mut self, readable: &[RawFd], writable: &[RawFd], exceptional: &[RawFd]) -> std::result::Result<(), QuitReason> {
        self.dispatching = true;
        let outcome = 'classes: {
            if let Err(e) = self.dispatch_class(IoClass::Read, readable) {
                break 'classes Err(e);
            }
            if let Err(e) = self.dispatch_class(IoClass::Write, writable) {
                break 'classes Err(e);
            }
            self.dispatch_class(IoClass::Exception, exceptional)
        };
        self.dispatching = false;
        self.read.merge_pending();
        self.write.merge_pending();
        self.exception.merge_pending();
        self.read.gc();
        self.write.gc();
        self.exception.gc();
        outcome
    }

    fn dispatch_class(&mut self, class: IoClass, fds: &[RawFd]) -> std::result::Result<(), QuitReason> {
        let mut table = std::mem::take(class.table_mut(self));
        let mut outcome = Ok(());
        for fd in fds {
            if let Err(e) = Self::fire(&mut table, *fd, self) {
                outcome = Err(e);
                break;
            }
        }
        let slot = class.table_mut(self);
        table.pending.append(&mut slot.pending);
        *slot = table;
        outcome
    }

    fn fire(table: &mut IoTable, fd: RawFd, reactor: &mut Reactor) -> std::result::Result<(), QuitReason> {
        let mut callback = {
            let Some(slot) = table.slots.get_mut(&fd) else { return Ok(()) };
            if slot.dead {
                return Ok(());
            }
            std::mem::replace(&mut slot.callback, Box::new(|_: &mut Reactor| Ok(())))
        };
        let res = callback(reactor);
        if let Some(slot) = table.slots.get_mut(&fd) {
            slot.callback = callback;
        }
        if let Err(err) = res {
            let on_exception = table.slots.get_mut(&fd).and_then(|slot| slot.on_exception.take());
            match on_exception {
                Some(mut hook) => {
                    let hook_res = hook(reactor, err);
                    if let Some(slot) = table.slots.get_mut(&fd) {
                        slot.on_exception = Some(hook);
                    }
                    if let Err(rethrown) = hook_res {
                        return Err(QuitReason::Exception(rethrown.to_string()));
                    }
                }
                None => return Err(QuitReason::Exception(err.to_string())),
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn wait_for_readiness(&self, timeout: Option<Duration>) -> Result<(Vec<RawFd>, Vec<RawFd>, Vec<RawFd>)> {
        use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

        let mut pollfds: Vec<pollfd> = Vec::new();
        let mut index: Vec<(RawFd, bool, bool)> = Vec::new(); // (fd, is_read, is_write)
        for fd in self.read.slots.keys() {
            pollfds.push(pollfd { fd: *fd, events: POLLIN, revents: 0 });
            index.push((*fd, true, false));
        }
        for fd in self.write.slots.keys() {
            if let Some(existing) = pollfds.iter_mut().zip(index.iter_mut()).find(|(_, (f, _, _))| f == fd) {
                existing.0.events |= POLLOUT;
                existing.1 .2 = true;
            } else {
                pollfds.push(pollfd { fd: *fd, events: POLLOUT, revents: 0 });
                index.push((*fd, false, true));
            }
        }

        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let res = unsafe { poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok((Vec::new(), Vec::new(), Vec::new()));
            }
            return Err(Error::Io(err));
        }

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        let mut exceptional = Vec::new();
        for (pfd, (fd, is_read, is_write)) in pollfds.iter().zip(index.iter()) {
            if *is_read && (pfd.revents & POLLIN) != 0 {
                readable.push(*fd);
            }
            if *is_write && (pfd.revents & POLLOUT) != 0 {
                writable.push(*fd);
            }
            if (pfd.revents & (POLLERR | POLLHUP)) != 0 {
                exceptional.push(*fd);
            }
        }
        Ok((readable, writable, exceptional))
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_for_readiness(&self, timeout: Option<Duration>) -> Result<(Vec<RawFd>, Vec<RawFd>, Vec<RawFd>)> {
        std::thread::sleep(timeout.unwrap_or(Duration::from_millis(5)).min(Duration::from_millis(50)));
        Ok((self.read.slots.keys().copied().collect(), Vec::new(), Vec::new()))
    }
}

impl TimerSlot {
    fn order_key_for_fire(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut reactor = Reactor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        reactor.set_timeout(Duration::from_millis(20), move |r| {
            o1.borrow_mut().push(2);
            r.quit("done");
        });
        let o2 = order.clone();
        reactor.set_timeout(Duration::from_millis(1), move |_| {
            o2.borrow_mut().push(1);
        });

        let reason = reactor.run();
        assert!(matches!(reason, QuitReason::Requested(_)));
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let id = reactor.set_timeout(Duration::from_millis(5), move |_| {
            *f.borrow_mut() = true;
        });
        reactor.cancel_timeout(id);
        reactor.set_timeout(Duration::from_millis(10), |r| r.quit("done"));
        reactor.run();
        assert!(!*fired.borrow());
    }

    #[test]
    fn reentrant_add_during_dispatch_is_admitted() {
        let mut reactor = Reactor::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s1 = seen.clone();
        reactor.set_timeout(Duration::from_millis(1), move |r| {
            s1.borrow_mut().push("first");
            let s2 = s1.clone();
            r.set_timeout(Duration::from_millis(1), move |r2| {
                s2.borrow_mut().push("second");
                r2.quit("done");
            });
        });
        reactor.run();
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
    }
}
