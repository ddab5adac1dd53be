//! Thin epoll wrapper.
//!
//! `epoll_ctl` failures are programming errors (a bad fd, a double add)
//! and are treated as fatal, matching the reactor's failure model.

use std::io;
use std::os::unix::io::RawFd;

bitflags::bitflags! {
    /// Poll-event mask.
    ///
    /// The low bits map 1:1 onto the epoll bits; `NOACT` is a synthetic
    /// bit delivered to fd callbacks when their activity watchdog fires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        const IN    = libc::EPOLLIN as u32;
        const PRI   = libc::EPOLLPRI as u32;
        const OUT   = libc::EPOLLOUT as u32;
        const ERR   = libc::EPOLLERR as u32;
        const HUP   = libc::EPOLLHUP as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
        /// Synthetic: the inactivity watchdog expired.
        const NOACT = 1 << 30;
    }
}

impl Events {
    /// `IN | OUT`, the usual activity-watch mask.
    pub const INOUT: Self = Self::IN.union(Self::OUT);
}

pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> Self {
        // A write on a peer-closed socket must surface as an error from
        // the write path, not kill the process.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            panic!("epoll_create1: {}", io::Error::last_os_error());
        }
        Self { epfd }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, key: usize, events: Events) {
        let mut event = libc::epoll_event {
            events: events.bits(),
            u64: key as u64,
        };
        let ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, ptr) } != 0 {
            if op == libc::EPOLL_CTL_DEL {
                // The fd may already be gone; nothing to clean up.
                return;
            }
            panic!("epoll_ctl(fd={fd}): {}", io::Error::last_os_error());
        }
    }

    pub(crate) fn add(&self, fd: RawFd, key: usize, events: Events) {
        self.ctl(libc::EPOLL_CTL_ADD, fd, key, events);
    }

    pub(crate) fn modify(&self, fd: RawFd, key: usize, events: Events) {
        self.ctl(libc::EPOLL_CTL_MOD, fd, key, events);
    }

    pub(crate) fn delete(&self, fd: RawFd) {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Events::empty());
    }

    /// Wait for readiness, up to `timeout_ms` (-1 blocks indefinitely).
    /// Fired events are appended to `out` as `(key, events)` pairs.
    pub(crate) fn wait(&self, timeout_ms: i32, out: &mut Vec<(usize, Events)>) {
        const CAP: usize = 1024;
        let mut buf: [libc::epoll_event; CAP] = unsafe { std::mem::zeroed() };
        let res = unsafe { libc::epoll_wait(self.epfd, buf.as_mut_ptr(), CAP as i32, timeout_ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => return,
                _ => panic!("epoll_wait: {err}"),
            }
        }
        for ev in &buf[..res as usize] {
            out.push((
                ev.u64 as usize,
                Events::from_bits_truncate(ev.events),
            ));
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readiness_roundtrip() {
        let poller = Poller::new();
        let (r, w) = pipe();
        poller.add(r, 7, Events::IN);

        let mut fired = Vec::new();
        poller.wait(0, &mut fired);
        assert!(fired.is_empty());

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
        poller.wait(1000, &mut fired);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 7);
        assert!(fired[0].1.contains(Events::IN));

        poller.delete(r);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
