//! rill HTTP/1.x protocol engines.
//!
//! Two symmetric state machines riding on the [`rill_core`] reactor:
//!
//! - [`server`]: an HTTP/1.0 and HTTP/1.1 server engine parsing pipelined
//!   requests (chunked transfer-encoding and `Expect: 100-continue`
//!   included), dispatching them to [`server::Trigger`]s mounted on a
//!   per-method URL trie, and producing ordered responses through
//!   per-query buffering.
//! - [`client`]: the outbound mirror, with pooled connections, request
//!   pipelining and reply dispatch to in-flight query records.
//!
//! Both share the [`codec`] wire grammar helpers and the [`outbuf`]
//! write-queue abstraction.

pub mod client;
pub mod codec;
mod error;
mod net;
pub mod outbuf;
pub mod server;

pub use error::{Error, Result};
pub use outbuf::Outbuf;
