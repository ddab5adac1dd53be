//! The event loop.
//!
//! [`El`] owns the epoll set, a min-heap of timers, the pending-signal
//! bitmap, a child-pid map, before/after hook lists, the proxy ready list
//! and a slab of event records. Sources are registered per kind
//! (`fd_register`, `timer_register`, ...) and dispatched by
//! [`El::loop_timeout`] / [`El::run`].
//!
//! Unregistering is legal from inside any callback, including a callback
//! unregistering itself: records are tombstoned and their slots are only
//! reclaimed when the outermost loop frame finishes, and dispatch works on
//! a snapshot that skips dead records.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use slab::Slab;
use tracing::trace;

use crate::clock;

pub mod biglock;
mod poller;
mod record;
mod signals;
mod timers;

pub use poller::Events;
pub use record::{Ev, TimerFlags};

use poller::Poller;
use record::{Callback, EvRecord, FdState, Kind, Repeat, TimerState};

/// Re-schedule in more than half a second: the high-precision clock does
/// not matter anymore.
const LOWRES_THRESHOLD_MS: u64 = 500;

/// The reactor.
pub struct El {
    poller: Poller,
    records: Slab<EvRecord>,
    next_gen: u64,
    /// Keys of unregistered records, reclaimed at outermost tick end.
    garbage: Vec<usize>,
    /// Number of records keeping the loop running.
    active: usize,
    unloop: bool,
    loop_depth: u32,
    /// Low-precision clock, cached per tick.
    lp_clk: u64,

    before: Vec<Ev>,
    after: Vec<Ev>,
    sigs: Vec<Ev>,
    proxies: Vec<Ev>,
    proxy_ready: Vec<Ev>,
    /// Timer heap; see the `timers` module.
    timers: Vec<Ev>,
    children: HashMap<libc::pid_t, Ev>,
    /// Watchdog timer key -> watched fd event.
    fd_act: HashMap<usize, Ev>,
    sigchld_hooked: bool,
}

impl El {
    #[must_use]
    pub fn new() -> Self {
        Self {
            poller: Poller::new(),
            records: Slab::new(),
            next_gen: 0,
            garbage: Vec::new(),
            active: 0,
            unloop: false,
            loop_depth: 0,
            lp_clk: 0,
            before: Vec::new(),
            after: Vec::new(),
            sigs: Vec::new(),
            proxies: Vec::new(),
            proxy_ready: Vec::new(),
            timers: Vec::new(),
            children: HashMap::new(),
            fd_act: HashMap::new(),
            sigchld_hooked: false,
        }
    }

    /* ----- record plumbing ----- */

    fn create(&mut self, kind: Kind, cb: Option<Callback>, refd: bool) -> Ev {
        self.next_gen += 1;
        let gen = self.next_gen;
        let key = self.records.insert(EvRecord {
            gen,
            kind,
            refd,
            dead: false,
            cb,
        });
        if refd {
            self.active += 1;
        }
        Ev { key, gen }
    }

    fn rec(&self, ev: Ev) -> Option<&EvRecord> {
        self.records
            .get(ev.key)
            .filter(|rec| rec.gen == ev.gen && !rec.dead)
    }

    fn rec_mut(&mut self, ev: Ev) -> Option<&mut EvRecord> {
        self.records
            .get_mut(ev.key)
            .filter(|rec| rec.gen == ev.gen && !rec.dead)
    }

    /// Whether `ev` still refers to a registered event.
    #[must_use]
    pub fn is_live(&self, ev: Ev) -> bool {
        self.rec(ev).is_some()
    }

    /// Tombstone a record. The slot survives until the outermost tick
    /// ends so in-flight dispatch snapshots stay valid.
    fn destroy(&mut self, ev: Ev) {
        self.ev_unref(ev);
        if let Some(rec) = self.rec_mut(ev) {
            rec.dead = true;
            self.garbage.push(ev.key);
        }
    }

    fn gc(&mut self) {
        for key in std::mem::take(&mut self.garbage) {
            self.records.remove(key);
        }
    }

    /// Make `ev` hold a loop reference: the loop keeps running while any
    /// referenced event exists.
    pub fn ev_ref(&mut self, ev: Ev) {
        if let Some(rec) = self.rec_mut(ev) {
            if !rec.refd {
                rec.refd = true;
                self.active += 1;
            }
        }
    }

    /// Drop `ev`'s loop reference; the event stays registered.
    pub fn ev_unref(&mut self, ev: Ev) {
        if let Some(rec) = self.rec_mut(ev) {
            if rec.refd {
                rec.refd = false;
                self.active -= 1;
            }
        }
    }

    /// Whether anything still references the loop.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.active > 0
    }

    /* ----- dispatch ----- */

    fn take_cb(&mut self, ev: Ev) -> Option<Callback> {
        self.rec_mut(ev).and_then(|rec| rec.cb.take())
    }

    fn restore_cb(&mut self, ev: Ev, cb: Callback) {
        if let Some(rec) = self.rec_mut(ev) {
            // A callback may have installed a replacement for itself; the
            // newer one wins.
            if rec.cb.is_none() {
                rec.cb = Some(cb);
            }
        }
    }

    fn fire_hook(&mut self, ev: Ev) {
        if let Some(mut cb) = self.take_cb(ev) {
            if let Callback::Hook(f) = &mut cb {
                f(self, ev);
            }
            self.restore_cb(ev, cb);
        }
    }

    fn fire_signal(&mut self, ev: Ev, signo: i32) {
        if let Some(mut cb) = self.take_cb(ev) {
            if let Callback::Signal(f) = &mut cb {
                f(self, ev, signo);
            }
            self.restore_cb(ev, cb);
        }
    }

    fn fire_proxy(&mut self, ev: Ev, avail: Events) {
        if let Some(mut cb) = self.take_cb(ev) {
            if let Callback::Proxy(f) = &mut cb {
                f(self, ev, avail);
            }
            self.restore_cb(ev, cb);
        }
    }

    fn fire_child(&mut self, ev: Ev, pid: libc::pid_t, status: i32) {
        if let Some(mut cb) = self.take_cb(ev) {
            if let Callback::Child(f) = &mut cb {
                f(self, ev, pid, status);
            }
            self.restore_cb(ev, cb);
        }
    }

    fn fire_fd(&mut self, ev: Ev, events: Events) {
        let (fd, act_timer, act_mask) = {
            let Some(rec) = self.rec(ev) else { return };
            let state = rec.fd();
            (state.fd, state.act_timer, state.act_mask)
        };
        // Traffic in a watched direction feeds the watchdog.
        if let Some(timer) = act_timer {
            if events.intersects(act_mask) {
                let delay = match self.rec(timer).map(|t| t.timer().repeat) {
                    Some(Repeat::OneShot { delay }) => delay,
                    _ => 0,
                };
                if delay > 0 {
                    self.timer_restart_at(timer, delay);
                }
            }
        }
        if let Some(mut cb) = self.take_cb(ev) {
            if let Callback::Fd(f) = &mut cb {
                f(self, ev, fd, events);
            }
            self.restore_cb(ev, cb);
        }
    }

    /* ----- blockers, before and after hooks ----- */

    /// Register an event whose only purpose is to keep the loop running.
    pub fn blocker_register(&mut self) -> Ev {
        self.create(Kind::Blocker, None, true)
    }

    pub fn blocker_unregister(&mut self, ev: Ev) {
        self.destroy(ev);
    }

    /// `cb` runs at the start of every tick, before any I/O.
    pub fn before_register<F>(&mut self, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev) + 'static,
    {
        let ev = self.create(Kind::Before, Some(Callback::Hook(Box::new(cb))), true);
        self.before.push(ev);
        ev
    }

    /// `cb` runs at the end of every tick, after all dispatch.
    pub fn after_register<F>(&mut self, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev) + 'static,
    {
        let ev = self.create(Kind::After, Some(Callback::Hook(Box::new(cb))), true);
        self.after.push(ev);
        ev
    }

    pub fn before_unregister(&mut self, ev: Ev) {
        self.before.retain(|&e| e != ev);
        self.destroy(ev);
    }

    pub fn after_unregister(&mut self, ev: Ev) {
        self.after.retain(|&e| e != ev);
        self.destroy(ev);
    }

    /* ----- signals ----- */

    /// Watch `signo`. The handler only marks a pending bitmap; `cb` runs
    /// from the loop thread during the tick that drains it.
    ///
    /// Signal events do not hold a loop reference.
    pub fn signal_register<F>(&mut self, signo: i32, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev, i32) + 'static,
    {
        signals::hook(signo);
        let ev = self.create(
            Kind::Signal { signo },
            Some(Callback::Signal(Box::new(cb))),
            false,
        );
        self.sigs.push(ev);
        ev
    }

    pub fn signal_unregister(&mut self, ev: Ev) {
        self.sigs.retain(|&e| e != ev);
        self.destroy(ev);
    }

    fn process_signals(&mut self) {
        let got = signals::drain();
        if got == 0 {
            return;
        }
        let cache = self.sigs.clone();
        for ev in cache {
            let Some(rec) = self.rec(ev) else { continue };
            let Kind::Signal { signo } = rec.kind else {
                continue;
            };
            if got & (1u32 << signo) != 0 {
                self.fire_signal(ev, signo);
            }
        }
    }

    /* ----- children ----- */

    /// Watch for `pid` to terminate. The record auto-unregisters once the
    /// child has been reaped and `cb` has run with its wait status.
    ///
    /// Panics if `pid` is already watched.
    pub fn child_register<F>(&mut self, pid: libc::pid_t, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev, libc::pid_t, i32) + 'static,
    {
        if !self.sigchld_hooked {
            self.sigchld_hooked = true;
            self.signal_register(libc::SIGCHLD, |el, _ev, _signo| el.reap_children());
        }
        let ev = self.create(Kind::Child { pid }, Some(Callback::Child(Box::new(cb))), true);
        assert!(
            self.children.insert(pid, ev).is_none(),
            "pid {pid} is already watched"
        );
        ev
    }

    pub fn child_unregister(&mut self, ev: Ev) {
        if let Some(rec) = self.rec(ev) {
            if let Kind::Child { pid } = rec.kind {
                self.children.remove(&pid);
            }
        }
        self.destroy(ev);
    }

    /// The pid a child event watches.
    #[must_use]
    pub fn child_getpid(&self, ev: Ev) -> Option<libc::pid_t> {
        match self.rec(ev)?.kind {
            Kind::Child { pid } => Some(pid),
            _ => None,
        }
    }

    fn reap_children(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if let Some(ev) = self.children.remove(&pid) {
                self.fire_child(ev, pid, status);
                self.destroy(ev);
            }
        }
    }

    /* ----- timers ----- */

    fn get_clock(&mut self, lowres: bool) -> u64 {
        if self.timers.len() > 1 && lowres && self.lp_clk != 0 {
            return self.lp_clk;
        }
        self.lp_clk = clock::monotonic_ms();
        self.lp_clk
    }

    /// Arm a timer firing in `next_ms`. `repeat_ms > 0` makes it
    /// periodic; otherwise it is one-shot (and auto-unregisters after
    /// firing unless restarted from its callback).
    pub fn timer_register<F>(&mut self, next_ms: u64, repeat_ms: u64, flags: TimerFlags, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev) + 'static,
    {
        let lowres = flags.contains(TimerFlags::LOWRES) || next_ms >= LOWRES_THRESHOLD_MS;
        let expiry = next_ms + self.get_clock(lowres);
        let ev = self.create(
            Kind::Timer(TimerState {
                expiry,
                repeat: if repeat_ms > 0 {
                    Repeat::Periodic(repeat_ms)
                } else {
                    Repeat::OneShot { delay: next_ms }
                },
                heap_pos: timers::NO_POS,
                flags,
                updated: false,
            }),
            Some(Callback::Hook(Box::new(cb))),
            true,
        );
        timers::insert(&mut self.records, &mut self.timers, ev);
        ev
    }

    /// Re-arm a one-shot timer to fire in `ms` (0 reuses the original
    /// delay). Safe from inside the timer's own callback.
    ///
    /// Panics when called on a periodic timer.
    pub fn timer_restart(&mut self, ev: Ev, ms: u64) {
        let Some(rec) = self.rec_mut(ev) else { return };
        let timer = rec.timer_mut();
        let delay = match &mut timer.repeat {
            Repeat::OneShot { delay } => {
                if ms > 0 {
                    *delay = ms;
                }
                *delay
            }
            Repeat::Periodic(_) => panic!("timer isn't a one-shot timer"),
        };
        self.timer_restart_at(ev, delay);
    }

    fn timer_restart_at(&mut self, ev: Ev, delay: u64) {
        let lowres = {
            let Some(rec) = self.rec(ev) else { return };
            rec.timer().flags.contains(TimerFlags::LOWRES) || delay >= LOWRES_THRESHOLD_MS
        };
        let expiry = delay + self.get_clock(lowres);
        if let Some(rec) = self.rec_mut(ev) {
            let timer = rec.timer_mut();
            timer.expiry = expiry;
            timer.updated = true;
        }
        timers::fix(&mut self.records, &mut self.timers, ev);
    }

    pub fn timer_unregister(&mut self, ev: Ev) {
        if self.rec(ev).is_none() {
            return;
        }
        timers::remove(&mut self.records, &mut self.timers, ev);
        self.destroy(ev);
    }

    fn timer_process(&mut self, until: u64) {
        while let Some(&root) = self.timers.first() {
            let timer = self.records[root.key].timer_mut();
            if timer.expiry > until {
                return;
            }
            timer.updated = false;
            self.fire_hook(root);

            // Unregistered from inside the callback: the heap was already
            // updated by the unregister path.
            let Some(rec) = self.rec_mut(root) else {
                continue;
            };
            let timer = rec.timer_mut();
            match timer.repeat {
                Repeat::Periodic(period) => {
                    timer.expiry += period;
                    if !timer.flags.contains(TimerFlags::NOMISS) && timer.expiry < until {
                        // Skip the missed expirations entirely.
                        let delta = until - timer.expiry;
                        timer.expiry += delta.div_ceil(period) * period;
                    }
                    timers::fix(&mut self.records, &mut self.timers, root);
                }
                Repeat::OneShot { .. } => {
                    if !timer.updated {
                        timers::remove(&mut self.records, &mut self.timers, root);
                        self.destroy(root);
                    }
                }
            }
        }
    }

    /* ----- fd events ----- */

    /// Register interest in `events` on `fd`. The callback receives the
    /// ready mask (or [`Events::NOACT`] from an activity watchdog).
    pub fn fd_register<F>(&mut self, fd: RawFd, events: Events, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev, RawFd, Events) + 'static,
    {
        let ev = self.create(
            Kind::Fd(FdState {
                fd,
                wanted: events,
                act_mask: Events::empty(),
                act_timer: None,
            }),
            Some(Callback::Fd(Box::new(cb))),
            true,
        );
        self.poller.add(fd, ev.key, events);
        trace!(fd, ?events, "fd registered");
        ev
    }

    /// Change the wanted poll mask; returns the previous one.
    pub fn fd_set_mask(&mut self, ev: Ev, events: Events) -> Events {
        let Some(rec) = self.rec_mut(ev) else {
            return Events::empty();
        };
        let state = rec.fd_mut();
        let old = state.wanted;
        if old != events {
            state.wanted = events;
            let fd = state.fd;
            self.poller.modify(fd, ev.key, events);
        }
        old
    }

    #[must_use]
    pub fn fd_get_mask(&self, ev: Ev) -> Events {
        self.rec(ev).map_or(Events::empty(), |rec| rec.fd().wanted)
    }

    #[must_use]
    pub fn fd_get_fd(&self, ev: Ev) -> Option<RawFd> {
        self.rec(ev).map(|rec| rec.fd().fd)
    }

    /// Unregister an fd event, optionally closing the fd. Any armed
    /// activity watchdog is disarmed.
    pub fn fd_unregister(&mut self, ev: Ev, do_close: bool) {
        let Some(rec) = self.rec(ev) else { return };
        let state = rec.fd();
        let fd = state.fd;
        let act_timer = state.act_timer;
        self.poller.delete(fd);
        if do_close {
            unsafe { libc::close(fd) };
        }
        if let Some(timer) = act_timer {
            self.act_timer_unlink(timer);
        }
        trace!(fd, "fd unregistered");
        self.destroy(ev);
    }

    /// Arm, re-arm or disarm (`timeout_ms == 0`) the inactivity watchdog
    /// of an fd event. While armed, any poll event intersecting `mask`
    /// resets the countdown; expiry delivers a synthetic
    /// [`Events::NOACT`] to the fd callback. Returns the previous
    /// timeout, 0 when none was armed.
    pub fn fd_watch_activity(&mut self, ev: Ev, mask: Events, timeout_ms: u64) -> u64 {
        let timer = {
            let Some(rec) = self.rec_mut(ev) else { return 0 };
            let state = rec.fd_mut();
            state.act_mask = mask;
            state.act_timer
        };
        let Some(timer) = timer else {
            if timeout_ms == 0 {
                return 0;
            }
            self.act_timer_register(ev, timeout_ms);
            return 0;
        };

        let prev = match self.rec(timer).map(|t| t.timer().repeat) {
            Some(Repeat::OneShot { delay }) => delay,
            _ => 0,
        };
        if timeout_ms == 0 {
            self.act_timer_unlink(timer);
        } else {
            self.timer_restart(timer, timeout_ms);
        }
        prev
    }

    fn act_timer_register(&mut self, fd_ev: Ev, timeout_ms: u64) {
        let timer = self.timer_register(timeout_ms, 0, TimerFlags::empty(), move |el, tev| {
            el.act_timer_fire(tev);
        });
        // The watchdog must not keep the loop alive on its own.
        self.ev_unref(timer);
        if let Some(rec) = self.rec_mut(fd_ev) {
            rec.fd_mut().act_timer = Some(timer);
        }
        self.fd_act.insert(timer.key, fd_ev);
    }

    /// Tear down a watchdog timer and detach it from its fd event.
    fn act_timer_unlink(&mut self, timer: Ev) -> Option<Ev> {
        let fd_ev = self.fd_act.remove(&timer.key)?;
        if let Some(rec) = self.rec_mut(fd_ev) {
            rec.fd_mut().act_timer = None;
        }
        self.timer_unregister(timer);
        Some(fd_ev)
    }

    fn act_timer_fire(&mut self, timer: Ev) {
        // The timer is one-shot and firing: restarting it from the fd
        // callback is allowed, so fully unlink before dispatch.
        if let Some(fd_ev) = self.act_timer_unlink(timer) {
            self.fire_fd(fd_ev, Events::NOACT);
        }
    }

    /// Poll a single fd event synchronously, also running due timers.
    /// Returns whether the fd fired.
    pub fn fd_loop(&mut self, ev: Ev, timeout_ms: i32) -> bool {
        let Some(rec) = self.rec(ev) else { return false };
        let state = rec.fd();
        let mut pfd = libc::pollfd {
            fd: state.fd,
            events: (state.wanted.bits() & 0xffff) as i16,
            revents: 0,
        };
        let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if !self.timers.is_empty() {
            let clk = self.get_clock(false);
            self.timer_process(clk);
        }
        if res == 1 {
            let events = Events::from_bits_truncate(pfd.revents as u16 as u32);
            self.fire_fd(ev, events);
            return true;
        }
        false
    }

    /* ----- proxies ----- */

    /// Register a proxy: a software ready-queue event firing whenever
    /// `available ∩ wanted` is non-empty at dispatch time.
    pub fn proxy_register<F>(&mut self, cb: F) -> Ev
    where
        F: FnMut(&mut El, Ev, Events) + 'static,
    {
        let ev = self.create(
            Kind::Proxy {
                avail: Events::empty(),
                wanted: Events::empty(),
            },
            Some(Callback::Proxy(Box::new(cb))),
            true,
        );
        self.proxies.push(ev);
        ev
    }

    pub fn proxy_unregister(&mut self, ev: Ev) {
        self.proxies.retain(|&e| e != ev);
        self.proxy_ready.retain(|&e| e != ev);
        self.destroy(ev);
    }

    fn proxy_update(&mut self, ev: Ev, avail: Events, wanted: Events) {
        let Some(rec) = self.rec_mut(ev) else { return };
        let Kind::Proxy {
            avail: cur_avail,
            wanted: cur_wanted,
        } = &mut rec.kind
        else {
            return;
        };
        let was_ready = cur_avail.intersects(*cur_wanted);
        let is_ready = avail.intersects(wanted);
        *cur_avail = avail;
        *cur_wanted = wanted;
        if was_ready != is_ready {
            if is_ready {
                self.proxies.retain(|&e| e != ev);
                self.proxy_ready.push(ev);
            } else {
                self.proxy_ready.retain(|&e| e != ev);
                self.proxies.push(ev);
            }
        }
    }

    fn proxy_masks(&self, ev: Ev) -> Option<(Events, Events)> {
        match self.rec(ev)?.kind {
            Kind::Proxy { avail, wanted } => Some((avail, wanted)),
            _ => None,
        }
    }

    /// Add bits to the available mask; returns the previous mask.
    pub fn proxy_set_event(&mut self, ev: Ev, mask: Events) -> Events {
        let Some((avail, wanted)) = self.proxy_masks(ev) else {
            return Events::empty();
        };
        self.proxy_update(ev, avail | mask, wanted);
        avail
    }

    /// Clear bits from the available mask; returns the previous mask.
    pub fn proxy_clr_event(&mut self, ev: Ev, mask: Events) -> Events {
        let Some((avail, wanted)) = self.proxy_masks(ev) else {
            return Events::empty();
        };
        self.proxy_update(ev, avail - mask, wanted);
        avail
    }

    /// Replace the wanted mask; returns the previous one.
    pub fn proxy_set_mask(&mut self, ev: Ev, mask: Events) -> Events {
        let Some((avail, wanted)) = self.proxy_masks(ev) else {
            return Events::empty();
        };
        self.proxy_update(ev, avail, mask);
        wanted
    }

    fn process_proxies(&mut self) {
        if self.proxy_ready.is_empty() {
            return;
        }
        let cache = self.proxy_ready.clone();
        for ev in cache {
            let Some((avail, wanted)) = self.proxy_masks(ev) else {
                continue;
            };
            if avail.intersects(wanted) {
                self.fire_proxy(ev, avail);
            }
        }
    }

    /* ----- loop drivers ----- */

    fn process_hooks(&mut self, list: &[Ev]) {
        for &ev in list {
            self.fire_hook(ev);
        }
    }

    /// Run one tick: before hooks, due timers, one `epoll_wait` bounded
    /// by `timeout_ms` (clamped by the next timer and by proxy
    /// readiness), fd dispatch, proxies, signals, after hooks.
    pub fn loop_timeout(&mut self, timeout_ms: u64) {
        self.loop_depth += 1;

        let cache = self.before.clone();
        self.process_hooks(&cache);

        let mut timeout = timeout_ms.min(i32::MAX as u64) as i32;
        if !self.timers.is_empty() {
            let clk = self.get_clock(false);
            self.timer_process(clk);
            if let Some(&root) = self.timers.first() {
                let next = self.records[root.key].timer().expiry;
                if next < timeout as u64 + clk {
                    timeout = (next - clk) as i32;
                }
            }
        }
        if !self.proxy_ready.is_empty() {
            timeout = 0;
        }
        if self.unloop {
            self.loop_depth -= 1;
            return;
        }

        let relock = biglock::release_for_wait();
        let mut fired = Vec::new();
        self.poller.wait(timeout, &mut fired);
        if relock {
            biglock::lock();
        }

        if !self.timers.is_empty() {
            let clk = self.get_clock(false);
            self.timer_process(clk);
        }
        for (key, events) in fired {
            let Some(rec) = self.records.get(key) else {
                continue;
            };
            if rec.dead || !matches!(rec.kind, Kind::Fd(_)) {
                continue;
            }
            let ev = Ev { key, gen: rec.gen };
            self.fire_fd(ev, events);
        }

        self.process_proxies();
        self.process_signals();

        let cache = self.after.clone();
        self.process_hooks(&cache);

        if self.loop_depth == 1 {
            // Records unregistered during this tick can be recycled now:
            // no dispatch snapshot refers to them anymore.
            self.gc();
        }
        self.loop_depth -= 1;
    }

    /// Drive the loop until nothing references it anymore or
    /// [`El::unloop`] is called.
    pub fn run(&mut self) {
        while self.active > 0 && !self.unloop {
            self.loop_timeout(59_000);
        }
        self.unloop = false;
    }

    /// Ask the loop to return after the current tick.
    pub fn unloop(&mut self) {
        self.unloop = true;
    }
}

impl Default for El {
    fn default() -> Self {
        Self::new()
    }
}
