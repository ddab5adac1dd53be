//! rill reactor core.
//!
//! A single-threaded, cooperative event loop multiplexing file-descriptor
//! readiness (epoll), hierarchical timers, UNIX signals, child-process
//! reaping, before/after hooks and "proxy" ready-queue events.
//!
//! All callbacks run on the loop thread. The only suspension point is the
//! `epoll_wait` call inside [`El::loop_timeout`]; callbacks must never
//! block and should register a timer instead of sleeping.

pub mod clock;
mod el;

pub use el::biglock;
pub use el::{El, Ev, Events, TimerFlags};
