//! The optional "big lock".
//!
//! A process-wide recursive mutex that, once enabled, is held by the loop
//! thread whenever it is not sleeping in `epoll_wait`. Auxiliary threads
//! take it with [`lock`]/[`unlock`] to touch loop-owned state, and can
//! block on a [`Cond`] which releases the full recursion depth while
//! waiting.
//!
//! When the big lock is not in use every function here is a no-op, and
//! loop-owned state must only be touched from the loop thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

static USED: AtomicBool = AtomicBool::new(false);

struct State {
    owner: Option<ThreadId>,
    count: u32,
}

static STATE: Mutex<State> = Mutex::new(State {
    owner: None,
    count: 0,
});
static FREED: Condvar = Condvar::new();

/// A condition variable integrated with the big lock.
///
/// [`Cond::wait`] atomically releases the big lock (whatever its current
/// recursion depth), sleeps, and restores the depth before returning.
pub struct Cond {
    cv: Condvar,
}

impl Cond {
    #[must_use]
    pub const fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    /// Must be called with the big lock held.
    pub fn wait(&self) {
        if !USED.load(Ordering::Relaxed) {
            return;
        }
        let me = thread::current().id();
        let mut st = STATE.lock();
        assert_eq!(st.owner, Some(me), "big lock is not held by this thread");
        let saved = st.count;
        st.owner = None;
        st.count = 0;
        FREED.notify_one();

        self.cv.wait(&mut st);

        while st.owner.is_some() {
            FREED.wait(&mut st);
        }
        st.owner = Some(me);
        st.count = saved;
    }

    pub fn signal(&self) {
        self.cv.notify_one();
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

/// Enable the big lock for the process and take it.
///
/// May only be called once; a second call panics.
pub fn use_() {
    if USED.swap(true, Ordering::SeqCst) {
        panic!("the big lock has been enabled twice");
    }
    lock();
}

/// Whether [`use_`] has been called.
#[must_use]
pub fn in_use() -> bool {
    USED.load(Ordering::Relaxed)
}

pub fn lock() {
    if !USED.load(Ordering::Relaxed) {
        return;
    }
    let me = thread::current().id();
    let mut st = STATE.lock();
    if st.owner == Some(me) {
        st.count += 1;
        return;
    }
    while st.owner.is_some() {
        FREED.wait(&mut st);
    }
    st.owner = Some(me);
    st.count = 1;
}

pub fn unlock() {
    if !USED.load(Ordering::Relaxed) {
        return;
    }
    let mut st = STATE.lock();
    assert!(st.count > 0, "unbalanced big-lock unlock");
    st.count -= 1;
    if st.count == 0 {
        st.owner = None;
        FREED.notify_one();
    }
}

/// Release one level of the big lock around `epoll_wait`, but only when
/// the calling thread actually owns it. Returns whether to re-lock.
pub(crate) fn release_for_wait() -> bool {
    if !USED.load(Ordering::Relaxed) {
        return false;
    }
    let me = thread::current().id();
    {
        let st = STATE.lock();
        if st.owner != Some(me) {
            return false;
        }
    }
    unlock();
    true
}
