//! Signal delivery. Separate binary: the pending-signal bitmap is
//! process-global, so this must not share a process with other loops.

use std::cell::RefCell;
use std::rc::Rc;

use rill_core::{El, TimerFlags};

#[test]
fn signal_callback_runs_on_loop_thread() {
    let mut el = El::new();
    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    let sig_ev = el.signal_register(libc::SIGUSR1, move |el, _ev, signo| {
        got2.borrow_mut().push(signo);
        el.unloop();
    });

    // Raise from a timer callback so the bitmap is drained in the same
    // tick.
    el.timer_register(1, 0, TimerFlags::empty(), |_el, _ev| {
        unsafe { libc::raise(libc::SIGUSR1) };
    });

    el.run();
    assert_eq!(*got.borrow(), vec![libc::SIGUSR1]);

    el.signal_unregister(sig_ev);
    assert!(!el.is_live(sig_ev));
}
