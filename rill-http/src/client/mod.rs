//! HTTP client engine.
//!
//! The outbound mirror of the server: a connection owns a FIFO of
//! in-flight [`HttpcQuery`] records, emits pipelined requests through
//! the shared outbuf, and drives the reply parser
//! `Idle → Body | ChunkHdr → (Chunk | ChunkTrailer)* → Idle`,
//! dispatching each parsed reply to the head query. Connections can be
//! pooled and are promoted from busy to ready as pipeline slots free
//! up.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use memchr::memmem;
use tracing::{debug, trace, warn};

use rill_core::{El, Ev, Events};

use crate::codec;
use crate::error::{Error, Result};
use crate::net;
use crate::outbuf::Outbuf;

mod pool;
mod query;

pub use pool::{HttpcPool, PoolHook};
pub use query::{HttpcQuery, On100Cont, OnData, OnDone, OnHdrs};

/// Completion status handed to a query's `on_done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// The reply was fully received.
    Ok = 0,
    /// The peer violated the protocol; the connection is gone.
    Invalid = -1,
    /// The transport died mid-flight.
    Abort = -2,
    /// The bufferize ceiling was exceeded.
    TooLarge = -3,
    /// A 2xx arrived while `Expect: 100-continue` was still pending.
    Exp100Cont = -4,
}

/// Client tunables.
#[derive(Debug, Clone)]
pub struct HttpcCfg {
    /// Emit absolute-form request lines for a forward proxy.
    pub use_proxy: bool,
    /// Queries in flight per connection before it turns busy.
    pub pipeline_depth: u16,
    /// Inactivity watchdog delay, milliseconds.
    pub noact_delay_ms: u64,
    /// Requests sent on one connection before it is retired.
    pub max_queries: u32,
    /// Reply-body bytes batched before `on_data` fires.
    pub on_data_threshold: usize,
    /// Longest tolerated header (and chunk-size) line.
    pub header_line_max: usize,
    /// Largest tolerated reply head.
    pub header_size_max: usize,
}

impl Default for HttpcCfg {
    fn default() -> Self {
        Self {
            use_proxy: false,
            pipeline_depth: 32,
            noact_delay_ms: 30_000,
            max_queries: 1024,
            on_data_threshold: 8 << 10,
            header_line_max: 1024,
            header_size_max: 64 << 10,
        }
    }
}

impl HttpcCfg {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle { scanned: usize },
    Body { remaining: u64 },
    ChunkHdr,
    Chunk { remaining: u64 },
    ChunkTrailer,
}

enum Step {
    Cont,
    More,
    Fail(Status),
}

/// One client connection.
pub struct Httpc {
    pub(crate) cfg: Rc<HttpcCfg>,
    pub(crate) pool: RefCell<Weak<RefCell<HttpcPool>>>,
    ev: Option<Ev>,
    ibuf: Vec<u8>,
    state: State,
    connecting: bool,
    pub(crate) connection_close: bool,
    pub(crate) busy: Cell<bool>,
    pub(crate) queries: u16,
    pub(crate) max_queries: u32,
    pub(crate) query_list: VecDeque<Rc<HttpcQuery>>,
    pub(crate) ob: Outbuf,
}

/// Start a non-blocking connect to `addr`. The connection begins busy
/// and is promoted to ready once the transport is up.
pub fn connect(
    el: &mut El,
    addr: SocketAddr,
    cfg: &Rc<HttpcCfg>,
    pool: Option<&Rc<RefCell<HttpcPool>>>,
) -> Result<Rc<RefCell<Httpc>>> {
    let fd = net::tcp_connect_start(addr).map_err(Error::new_io)?;
    let conn = new_conn(el, fd, cfg, pool, true, Events::OUT);
    debug!(%addr, "httpc connecting");
    Ok(conn)
}

/// Take over an already-connected fd as a client connection.
pub fn spawn(
    el: &mut El,
    fd: std::os::unix::io::RawFd,
    cfg: &Rc<HttpcCfg>,
    pool: Option<&Rc<RefCell<HttpcPool>>>,
) -> Rc<RefCell<Httpc>> {
    new_conn(el, fd, cfg, pool, false, Events::empty())
}

fn new_conn(
    el: &mut El,
    fd: std::os::unix::io::RawFd,
    cfg: &Rc<HttpcCfg>,
    pool: Option<&Rc<RefCell<HttpcPool>>>,
    connecting: bool,
    events: Events,
) -> Rc<RefCell<Httpc>> {
    let conn = Rc::new(RefCell::new(Httpc {
        cfg: cfg.clone(),
        pool: RefCell::new(Weak::new()),
        ev: None,
        ibuf: Vec::new(),
        state: State::Idle { scanned: 0 },
        connecting,
        connection_close: false,
        busy: Cell::new(connecting),
        queries: 0,
        max_queries: cfg.max_queries,
        query_list: VecDeque::new(),
        ob: Outbuf::new(),
    }));
    let this = conn.clone();
    let ev = el.fd_register(fd, events, move |el, ev, fd, events| {
        Httpc::on_event(&this, el, ev, fd, events);
    });
    el.ev_unref(ev);
    el.fd_watch_activity(ev, Events::INOUT, cfg.noact_delay_ms);
    conn.borrow_mut().ev = Some(ev);
    if let Some(pool) = pool {
        HttpcPool::attach(pool, el, &conn);
    }
    conn
}

/// Tear a connection down, aborting every in-flight query.
pub fn close(el: &mut El, conn: &Rc<RefCell<Httpc>>) {
    Httpc::teardown(conn, el, Status::Abort);
}

impl Httpc {
    /// Whether the connection accepts more queries right now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.busy.get()
    }

    /// Remaining query budget on this connection.
    #[must_use]
    pub fn queries_left(&self) -> u32 {
        self.max_queries
    }

    fn on_event(
        this: &Rc<RefCell<Self>>,
        el: &mut El,
        ev: Ev,
        fd: std::os::unix::io::RawFd,
        events: Events,
    ) {
        if events.contains(Events::NOACT) {
            // An outstanding 100-continue expectation gets one grace
            // period: treat the server as silently accepting.
            let waiting = {
                let w = this.borrow();
                w.query_list
                    .front()
                    .filter(|q| q.expect100cont.get())
                    .cloned()
            };
            if let Some(q) = waiting {
                q.call_on_100cont(el);
                q.expect100cont.set(false);
                let delay = this.borrow().cfg.noact_delay_ms;
                el.fd_watch_activity(ev, Events::INOUT, delay);
                return;
            }
            trace!(fd, "httpc inactivity timeout");
            return Self::teardown(this, el, Status::Invalid);
        }

        if this.borrow().connecting {
            match net::connect_status(fd) {
                Ok(()) => {
                    {
                        let mut w = this.borrow_mut();
                        w.connecting = false;
                        w.set_mask(el);
                    }
                    trace!(fd, "httpc connected");
                    Self::set_ready(this, el);
                }
                Err(err) => {
                    debug!(fd, %err, "httpc connect failed");
                    Self::teardown(this, el, Status::Abort);
                }
            }
            return;
        }

        if events.contains(Events::IN) {
            let res = net::read_into(fd, &mut this.borrow_mut().ibuf);
            match res {
                Ok(0) => return Self::teardown(this, el, Status::Invalid),
                Ok(_) => loop {
                    match Self::parse_step(this, el) {
                        Step::Cont => {}
                        Step::More => break,
                        Step::Fail(st) => return Self::teardown(this, el, st),
                    }
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return Self::teardown(this, el, Status::Abort),
            }
        }

        let mut w = this.borrow_mut();
        if w.connection_close && w.query_list.is_empty() && w.ob.is_empty() {
            drop(w);
            return Self::teardown(this, el, Status::Invalid);
        }
        if w.ob.write_to(fd).is_err() {
            drop(w);
            return Self::teardown(this, el, Status::Abort);
        }
        w.set_mask(el);
    }

    pub(crate) fn set_mask(&self, el: &mut El) {
        let Some(ev) = self.ev else { return };
        let mut mask = Events::empty();
        if !self.ob.is_empty() || self.connecting {
            // Write-readiness also signals connect completion.
            mask |= Events::OUT;
        }
        if !self.query_list.is_empty() {
            mask |= Events::IN;
        }
        el.fd_set_mask(ev, mask);
    }

    /// The connection died: `first_st` goes to the head query when it
    /// already saw reply headers, everything else aborts.
    fn teardown(this: &Rc<RefCell<Self>>, el: &mut El, first_st: Status) {
        pool::detach(this);
        let mut w = this.borrow_mut();
        let Some(ev) = w.ev.take() else { return };
        el.fd_unregister(ev, true);
        let queries: Vec<_> = w.query_list.drain(..).collect();
        w.queries = 0;
        debug!("httpc connection closed");
        drop(w);

        let mut iter = queries.into_iter();
        if let Some(first) = iter.next() {
            // A reply in flight keeps its failure cause; a query that
            // never saw reply headers just aborted — except the skipped
            // 100-continue, which is its own verdict.
            let st = if first.has_rinfo() || first_st == Status::Exp100Cont {
                first_st
            } else {
                Status::Abort
            };
            first.clear_owner();
            first.call_on_done(el, st);
        }
        for q in iter {
            q.clear_owner();
            q.call_on_done(el, Status::Abort);
        }
    }

    /// The pipeline freed a slot (or the transport came up): move the
    /// connection to its pool's ready list.
    pub(crate) fn set_ready(this: &Rc<RefCell<Self>>, el: &mut El) {
        if !this.borrow().busy.replace(false) {
            return;
        }
        pool::notify_ready(this, el);
    }

    pub(crate) fn set_busy(this: &Rc<RefCell<Self>>, el: &mut El) {
        if this.borrow().busy.replace(true) {
            return;
        }
        pool::notify_busy(this, el);
    }

    /// A reply completed: pop the head query and hand the slot back.
    fn query_finish(
        this: &Rc<RefCell<Self>>,
        el: &mut El,
        q: &Rc<HttpcQuery>,
        st: Status,
    ) {
        let ready = {
            let mut w = this.borrow_mut();
            if let Some(pos) = w.query_list.iter().position(|x| Rc::ptr_eq(x, q)) {
                w.query_list.remove(pos);
                w.queries -= 1;
            }
            w.queries < w.cfg.pipeline_depth && w.max_queries > 0
        };
        if ready {
            Self::set_ready(this, el);
        }
        q.clear_owner();
        q.call_on_done(el, st);
    }

    /* ----- reply parser ----- */

    fn parse_step(this: &Rc<RefCell<Self>>, el: &mut El) -> Step {
        let state = this.borrow().state;
        match state {
            State::Idle { scanned } => Self::parse_idle(this, el, scanned),
            State::Body { remaining } => Self::parse_body(this, el, remaining),
            State::ChunkHdr => Self::parse_chunk_hdr(this),
            State::Chunk { remaining } => Self::parse_chunk(this, el, remaining),
            State::ChunkTrailer => Self::parse_chunk_trailer(this, el),
        }
    }

    fn parse_idle(this: &Rc<RefCell<Self>>, el: &mut El, scanned: usize) -> Step {
        enum Head {
            Swallow1xx,
            Deliver100(Rc<HttpcQuery>),
            Reply {
                q: Rc<HttpcQuery>,
                info: codec::RInfo,
                conn_close: bool,
            },
        }

        let head = {
            let mut w = this.borrow_mut();
            if w.query_list.is_empty() {
                if w.ibuf.is_empty() {
                    return Step::More;
                }
                warn!("spurious data from the HTTP server");
                return Step::Fail(Status::Invalid);
            }

            let start = scanned.saturating_sub(3);
            let terminated = w.ibuf.len() >= 4
                && memmem::find(&w.ibuf[start..], b"\r\n\r\n").is_some();
            if !terminated {
                if w.ibuf.len() > w.cfg.header_size_max {
                    return Step::Fail(Status::Invalid);
                }
                w.state = State::Idle { scanned: w.ibuf.len() };
                return Step::More;
            }

            let (info, facts, head_len) = match codec::parse_response_head(&w.ibuf) {
                Ok(Some(parts)) => parts,
                Ok(None) => return Step::More,
                Err(_) => return Step::Fail(Status::Invalid),
            };
            w.ibuf.drain(..head_len);
            w.connection_close |= facts.conn_close;

            let q = w
                .query_list
                .front()
                .cloned()
                .expect("checked non-empty above");
            let code = info.code();

            if (100..200).contains(&code) {
                // rfc 2616: §10.1: one or more 1xx may precede the
                // regular response; HTTP/1.0 never defined any.
                w.state = State::Idle { scanned: 0 };
                if info.version() == codec::Version::HTTP_10 {
                    return Step::Fail(Status::Invalid);
                }
                if code != 100 {
                    return Step::Cont;
                }
                if q.expect100cont.replace(false) {
                    Head::Deliver100(q)
                } else {
                    Head::Swallow1xx
                }
            } else {
                if q.expect100cont.get() && (200..300).contains(&code) {
                    // The server skipped the 100 we were waiting for.
                    return Step::Fail(Status::Exp100Cont);
                }
                if facts.chunked {
                    w.state = State::ChunkHdr;
                } else {
                    w.state = State::Body {
                        remaining: facts.content_length.unwrap_or(0),
                    };
                }
                Head::Reply {
                    q,
                    info,
                    conn_close: facts.conn_close,
                }
            }
        };

        match head {
            Head::Swallow1xx => Step::Cont,
            Head::Deliver100(q) => {
                q.call_on_100cont(el);
                Step::Cont
            }
            Head::Reply {
                q,
                info,
                conn_close,
            } => {
                q.set_rinfo(Rc::new(info));
                if let Err(st) = q.call_on_hdrs(el) {
                    return Step::Fail(st);
                }
                if conn_close {
                    // The server is closing after this reply: everything
                    // queued behind it can only be retried elsewhere.
                    this.borrow_mut().max_queries = 0;
                    Self::set_busy(this, el);
                    let doomed: Vec<_> = {
                        let mut w = this.borrow_mut();
                        let doomed: Vec<_> =
                            w.query_list.iter().skip(1).cloned().collect();
                        w.query_list.truncate(1);
                        w.queries = 1;
                        w.ob = Outbuf::new();
                        doomed
                    };
                    for q in doomed {
                        q.clear_owner();
                        q.call_on_done(el, Status::Abort);
                    }
                }
                Step::Cont
            }
        }
    }

    fn parse_body(this: &Rc<RefCell<Self>>, el: &mut El, remaining: u64) -> Step {
        let (q, data, finished) = {
            let mut w = this.borrow_mut();
            let q = w
                .query_list
                .front()
                .cloned()
                .expect("body states always have a head query");
            let plen = w.ibuf.len() as u64;

            if plen >= remaining {
                let data: Vec<u8> = w.ibuf.drain(..remaining as usize).collect();
                (q, Some(data), true)
            } else if plen >= w.cfg.on_data_threshold as u64 {
                let data = std::mem::take(&mut w.ibuf);
                w.state = State::Body {
                    remaining: remaining - plen,
                };
                (q, Some(data), false)
            } else {
                (q, None, false)
            }
        };

        if let Some(data) = data {
            if let Err(st) = q.call_on_data(el, &data) {
                return Step::Fail(st);
            }
        }
        if finished {
            Self::query_finish(this, el, &q, Status::Ok);
            this.borrow_mut().state = State::Idle { scanned: 0 };
            return Step::Cont;
        }
        Step::More
    }

    fn parse_chunk_hdr(this: &Rc<RefCell<Self>>) -> Step {
        let mut w = this.borrow_mut();
        let line_max = w.cfg.header_line_max;
        match codec::parse_chunk_size(&w.ibuf, line_max) {
            Ok(codec::ChunkStatus::Partial) => Step::More,
            Ok(codec::ChunkStatus::Complete { consumed, size }) => {
                w.ibuf.drain(..consumed);
                w.state = if size > 0 {
                    State::Chunk { remaining: size }
                } else {
                    State::ChunkTrailer
                };
                Step::Cont
            }
            Err(_) => Step::Fail(Status::Invalid),
        }
    }

    fn parse_chunk(this: &Rc<RefCell<Self>>, el: &mut El, remaining: u64) -> Step {
        let (q, data, cont) = {
            let mut w = this.borrow_mut();
            let q = w
                .query_list
                .front()
                .cloned()
                .expect("body states always have a head query");
            let plen = w.ibuf.len() as u64;

            if plen >= remaining + 2 {
                let data: Vec<u8> = w.ibuf.drain(..remaining as usize).collect();
                if !w.ibuf.starts_with(b"\r\n") {
                    return Step::Fail(Status::Invalid);
                }
                w.ibuf.drain(..2);
                w.state = State::ChunkHdr;
                (q, Some(data), true)
            } else {
                let take = plen.min(remaining);
                if take >= w.cfg.on_data_threshold as u64 && take > 0 {
                    let data: Vec<u8> = w.ibuf.drain(..take as usize).collect();
                    w.state = State::Chunk {
                        remaining: remaining - take,
                    };
                    (q, Some(data), false)
                } else {
                    (q, None, false)
                }
            }
        };

        if let Some(data) = data {
            if let Err(st) = q.call_on_data(el, &data) {
                return Step::Fail(st);
            }
        }
        if cont {
            Step::Cont
        } else {
            Step::More
        }
    }

    fn parse_chunk_trailer(this: &Rc<RefCell<Self>>, el: &mut El) -> Step {
        let q = loop {
            let mut w = this.borrow_mut();
            match memmem::find(&w.ibuf, b"\r\n") {
                None => {
                    if w.ibuf.len() > w.cfg.header_line_max {
                        return Step::Fail(Status::Invalid);
                    }
                    return Step::More;
                }
                Some(0) => {
                    w.ibuf.drain(..2);
                    break w
                        .query_list
                        .front()
                        .cloned()
                        .expect("body states always have a head query");
                }
                Some(pos) => {
                    w.ibuf.drain(..pos + 2);
                }
            }
        };
        Self::query_finish(this, el, &q, Status::Ok);
        this.borrow_mut().state = State::Idle { scanned: 0 };
        Step::Cont
    }
}
