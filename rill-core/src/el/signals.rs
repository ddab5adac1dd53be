//! Signal plumbing.
//!
//! The OS handler only sets a bit in an atomic bitmap; the loop drains it
//! after fd dispatch and invokes user callbacks from the loop thread.
//! User code never runs inside the kernel handler.

use std::sync::atomic::{AtomicU32, Ordering};

static PENDING: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_signal(signo: libc::c_int) {
    if (0..32).contains(&signo) {
        PENDING.fetch_or(1 << signo, Ordering::Relaxed);
    }
}

/// Install the bitmap handler for `signo`.
pub(crate) fn hook(signo: i32) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_signal as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        libc::sigaction(signo, &sa, std::ptr::null_mut());
    }
}

/// Take and clear the pending bitmap.
pub(crate) fn drain() -> u32 {
    let got = PENDING.load(Ordering::Relaxed);
    if got != 0 {
        PENDING.fetch_and(!got, Ordering::Relaxed);
    }
    got
}

