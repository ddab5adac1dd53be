//! rill — a single-threaded reactor and the HTTP/1.x engines riding on it.
//!
//! The `rill` crate is a facade: it re-exports the member crates so that
//! most users only ever depend on `rill` itself.
//!
//! - [`core`]: the event loop — fd readiness, hierarchical timers, UNIX
//!   signals, child reaping, before/after hooks and proxy events, all
//!   dispatched from one thread.
//! - [`http`]: the HTTP/1.0 and HTTP/1.1 server and client protocol
//!   engines, implemented as clients of the event loop.
//!
//! # Example
//!
//! ```no_run
//! use rill::core::El;
//! use rill::http::server::{HttpdCfg, Trigger};
//!
//! let mut el = El::new();
//! let cfg = HttpdCfg::new();
//! // mount triggers on cfg, then:
//! let _listener = rill::http::server::listen(
//!     &mut el,
//!     "127.0.0.1:8080".parse().unwrap(),
//!     &cfg,
//! ).unwrap();
//! el.run();
//! ```

#[doc(inline)]
pub use rill_core as core;

#[doc(inline)]
pub use rill_http as http;
