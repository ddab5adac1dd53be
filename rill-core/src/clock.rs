//! Monotonic millisecond clock.

use std::mem::MaybeUninit;

/// Current monotonic time in milliseconds.
///
/// The origin is unspecified; only differences are meaningful. Timer
/// expiries throughout the reactor are expressed on this clock.
#[must_use]
pub fn monotonic_ms() -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    let res = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) };
    debug_assert_eq!(res, 0);
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_is_monotonic() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn monotonic_ms_advances() {
        let a = monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let b = monotonic_ms();
        assert!(b >= a + 10, "clock advanced only {}ms", b - a);
    }
}
