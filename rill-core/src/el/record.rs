//! Event records and their arena.
//!
//! Every registration with the reactor is one record in a slab. Handles
//! carry a generation so that a handle kept past unregistration is inert
//! rather than aliasing a recycled slot. Unregistered records are only
//! tombstoned during a tick; their keys return to the slab when the
//! outermost loop frame ends, so dispatch snapshots can safely skip them.

use std::os::unix::io::RawFd;

use super::poller::Events;
use super::El;

/// Handle to a registered event.
///
/// Copyable and cheap. Operations on a handle whose record has been
/// unregistered (even if the slot was since recycled) are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ev {
    pub(crate) key: usize,
    pub(crate) gen: u64,
}

bitflags::bitflags! {
    /// Timer registration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimerFlags: u8 {
        /// Fire catch-up re-schedules for missed periodic expirations
        /// instead of silently dropping them.
        const NOMISS = 1 << 0;
        /// The timer tolerates the per-tick cached clock.
        const LOWRES = 1 << 1;
    }
}

/// How a timer re-arms.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Repeat {
    /// Re-fires every `period` ms.
    Periodic(u64),
    /// Fires once; the original delay is kept so a restart with no
    /// explicit delay can reuse it.
    OneShot { delay: u64 },
}

pub(crate) struct FdState {
    pub(crate) fd: RawFd,
    pub(crate) wanted: Events,
    /// Directions whose traffic feeds the activity watchdog.
    pub(crate) act_mask: Events,
    /// Hidden one-shot inactivity timer, when armed.
    pub(crate) act_timer: Option<Ev>,
}

pub(crate) struct TimerState {
    pub(crate) expiry: u64,
    pub(crate) repeat: Repeat,
    pub(crate) heap_pos: usize,
    pub(crate) flags: TimerFlags,
    /// Restarted from inside its own callback this dispatch.
    pub(crate) updated: bool,
}

pub(crate) enum Kind {
    Blocker,
    Before,
    After,
    Signal { signo: i32 },
    Child { pid: libc::pid_t },
    Fd(FdState),
    Timer(TimerState),
    Proxy { avail: Events, wanted: Events },
}

pub(crate) enum Callback {
    /// Before/after hooks and timers.
    Hook(Box<dyn FnMut(&mut El, Ev)>),
    Fd(Box<dyn FnMut(&mut El, Ev, RawFd, Events)>),
    Signal(Box<dyn FnMut(&mut El, Ev, i32)>),
    Child(Box<dyn FnMut(&mut El, Ev, libc::pid_t, i32)>),
    Proxy(Box<dyn FnMut(&mut El, Ev, Events)>),
}

pub(crate) struct EvRecord {
    pub(crate) gen: u64,
    pub(crate) kind: Kind,
    /// Counted in the loop's `active` counter.
    pub(crate) refd: bool,
    /// Unregistered; key reclaimed at the end of the outermost tick.
    pub(crate) dead: bool,
    /// Taken out during dispatch, restored afterwards.
    pub(crate) cb: Option<Callback>,
}

impl EvRecord {
    pub(crate) fn fd(&self) -> &FdState {
        match &self.kind {
            Kind::Fd(state) => state,
            _ => panic!("event is not an fd event"),
        }
    }

    pub(crate) fn fd_mut(&mut self) -> &mut FdState {
        match &mut self.kind {
            Kind::Fd(state) => state,
            _ => panic!("event is not an fd event"),
        }
    }

    pub(crate) fn timer(&self) -> &TimerState {
        match &self.kind {
            Kind::Timer(state) => state,
            _ => panic!("event is not a timer"),
        }
    }

    pub(crate) fn timer_mut(&mut self) -> &mut TimerState {
        match &mut self.kind {
            Kind::Timer(state) => state,
            _ => panic!("event is not a timer"),
        }
    }
}
