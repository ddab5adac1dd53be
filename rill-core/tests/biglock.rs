//! Big-lock behavior. Lives in its own integration binary because
//! enabling the big lock is a once-per-process switch.

use rill_core::biglock;

#[test]
fn recursion_and_handoff() {
    biglock::use_();
    // Recursive re-entry on the owning thread.
    biglock::lock();
    biglock::unlock();

    let handle = std::thread::spawn(|| {
        biglock::lock();
        biglock::unlock();
    });
    // Still locked here, so the spawned thread stays parked.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(!handle.is_finished());

    biglock::unlock();
    handle.join().unwrap();

    biglock::lock();
    biglock::unlock();
}
