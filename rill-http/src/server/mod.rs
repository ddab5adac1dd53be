//! HTTP server engine.
//!
//! Each accepted connection runs the parser state machine
//! `Idle → Body | ChunkHdr → (Chunk | ChunkTrailer)* → Idle | Close`
//! over bytes delivered by the reactor, dispatching parsed requests to
//! [`Trigger`]s and pipelining the responses in arrival order: only the
//! head query writes into the shared connection outbuf, the others
//! accumulate privately and are spliced in when they reach the head.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use base64::Engine as _;
use memchr::memmem;
use tracing::{debug, trace};

use rill_core::{El, Ev, Events};

use crate::codec::{self, Method, QInfo, Version};
use crate::error::{Error, Parse, Result};
use crate::net;
use crate::outbuf::Outbuf;

mod query;
mod static_files;
mod trigger;

pub use query::{OnData, OnDone, Query};
pub use static_files::{reply_file, reply_make_index, StaticDirTrigger};
pub use trigger::Trigger;

use trigger::TriggerNode;

/// Server tunables plus the per-method trigger tries.
///
/// Build one, mount triggers, then hand it (shared) to
/// [`listen`]/[`spawn`].
pub struct HttpdCfg {
    /// Backpressure: POLLIN is masked while the connection outbuf holds
    /// more than this.
    pub outbuf_max_size: usize,
    /// Body bytes are batched up to this size before `on_data` fires.
    pub on_data_threshold: usize,
    /// Maximum requests in flight per connection before POLLIN is
    /// masked.
    pub pipeline_depth: u16,
    /// Inactivity watchdog delay, milliseconds.
    pub noact_delay_ms: u64,
    /// Requests served on one connection before it is closed.
    pub max_queries: u32,
    /// Accepted connections beyond this are dropped on the floor.
    pub max_conns: u32,
    /// Longest tolerated header (and chunk-size) line.
    pub header_line_max: usize,
    /// Largest tolerated request head.
    pub header_size_max: usize,

    pub(crate) nb_conns: Cell<u32>,
    roots: [RefCell<TriggerNode>; Method::COUNT],
}

impl Default for HttpdCfg {
    fn default() -> Self {
        Self {
            outbuf_max_size: 32 << 20,
            on_data_threshold: 8 << 10,
            pipeline_depth: 32,
            noact_delay_ms: 30_000,
            max_queries: 1024,
            max_conns: 1000,
            header_line_max: 1024,
            header_size_max: 64 << 10,
            nb_conns: Cell::new(0),
            roots: Default::default(),
        }
    }
}

impl HttpdCfg {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Mount `trigger` for `method` at `path`; returns the trigger it
    /// replaced, for the caller to dispose of.
    pub fn trigger_register(
        &self,
        method: Method,
        path: &str,
        trigger: Rc<dyn Trigger>,
    ) -> Option<Rc<dyn Trigger>> {
        self.roots[method.index()].borrow_mut().register(path, trigger)
    }

    /// Unmount the trigger at `path`, pruning empty trie nodes.
    pub fn trigger_unregister(&self, method: Method, path: &str) -> Option<Rc<dyn Trigger>> {
        self.roots[method.index()].borrow_mut().unregister(path)
    }

    fn resolve(&self, method: Method, path: &str) -> (Option<Rc<dyn Trigger>>, usize) {
        self.roots[method.index()].borrow().resolve(path)
    }

    fn method_tree_is_empty(&self, method: Method) -> bool {
        self.roots[method.index()].borrow().is_empty()
    }

    /// Live connections currently served from this config.
    #[must_use]
    pub fn nb_conns(&self) -> u32 {
        self.nb_conns.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle { scanned: usize },
    Body { remaining: u64 },
    ChunkHdr,
    Chunk { remaining: u64 },
    ChunkTrailer,
    Close,
}

enum Step {
    /// Progress was made; run the next state.
    Cont,
    /// Need more input bytes.
    More,
}

/// One server connection.
pub struct Httpd {
    cfg: Rc<HttpdCfg>,
    ev: Option<Ev>,
    ibuf: Vec<u8>,
    state: State,
    pub(crate) connection_close: bool,
    pub(crate) queries: u16,
    max_queries: u32,
    pub(crate) query_list: VecDeque<Rc<Query>>,
    pub(crate) ob: Outbuf,
}

/// Bind `addr` and dispatch accepted connections into [`spawn`].
///
/// The returned listener event does not keep the loop alive by itself.
pub fn listen(el: &mut El, addr: SocketAddr, cfg: &Rc<HttpdCfg>) -> Result<Ev> {
    let fd = net::tcp_listen(addr).map_err(Error::new_io)?;
    let cfg = cfg.clone();
    let ev = el.fd_register(fd, Events::IN, move |el, _ev, fd, _events| {
        while let Ok(Some(sock)) = net::tcp_accept(fd) {
            if cfg.nb_conns.get() >= cfg.max_conns {
                unsafe { libc::close(sock) };
                continue;
            }
            spawn(el, sock, &cfg);
        }
    });
    el.ev_unref(ev);
    debug!(%addr, "httpd listening");
    Ok(ev)
}

/// Stop listening and close the socket. Existing connections live on.
pub fn unlisten(el: &mut El, ev: Ev) {
    el.fd_unregister(ev, true);
}

/// Take over an already-connected fd as a server connection.
pub fn spawn(el: &mut El, fd: std::os::unix::io::RawFd, cfg: &Rc<HttpdCfg>) -> Rc<RefCell<Httpd>> {
    cfg.nb_conns.set(cfg.nb_conns.get() + 1);
    let conn = Rc::new(RefCell::new(Httpd {
        cfg: cfg.clone(),
        ev: None,
        ibuf: Vec::new(),
        state: State::Idle { scanned: 0 },
        connection_close: false,
        queries: 0,
        max_queries: cfg.max_queries,
        query_list: VecDeque::new(),
        ob: Outbuf::new(),
    }));
    let this = conn.clone();
    let ev = el.fd_register(fd, Events::IN, move |el, ev, fd, events| {
        Httpd::on_event(&this, el, ev, fd, events);
    });
    el.ev_unref(ev);
    el.fd_watch_activity(ev, Events::INOUT, cfg.noact_delay_ms);
    conn.borrow_mut().ev = Some(ev);
    trace!(fd, "httpd connection spawned");
    conn
}

impl Httpd {
    fn on_event(
        this: &Rc<RefCell<Self>>,
        el: &mut El,
        ev: Ev,
        fd: std::os::unix::io::RawFd,
        events: Events,
    ) {
        if events.contains(Events::NOACT) {
            trace!(fd, "httpd inactivity timeout");
            return Self::close(this, el);
        }

        if events.contains(Events::IN) {
            let res = net::read_into(fd, &mut this.borrow_mut().ibuf);
            match res {
                Ok(0) => return Self::close(this, el),
                Ok(_) => loop {
                    match Self::parse_step(this, el) {
                        Step::Cont => {}
                        Step::More => break,
                    }
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return Self::close(this, el),
            }
        }

        {
            let mut w = this.borrow_mut();
            if w.ob.write_to(fd).is_err() {
                drop(w);
                return Self::close(this, el);
            }
            if w.state == State::Close {
                if w.queries == 0 && w.ob.is_empty() {
                    drop(w);
                    return Self::close(this, el);
                }
            } else {
                // Pending unanswered queries: we are the laggard, not the
                // peer, so hold the watchdog off.
                let parsing = !matches!(w.state, State::Idle { .. });
                let pending = w.queries > u16::from(parsing);
                if pending {
                    el.fd_watch_activity(ev, Events::INOUT, 0);
                } else if w.ob.is_empty() {
                    let delay = w.cfg.noact_delay_ms;
                    el.fd_watch_activity(ev, Events::INOUT, delay);
                }
            }
            w.set_mask(el);
        }
    }

    fn close(this: &Rc<RefCell<Self>>, el: &mut El) {
        let mut w = this.borrow_mut();
        let Some(ev) = w.ev.take() else { return };
        el.fd_unregister(ev, true);
        w.cfg.nb_conns.set(w.cfg.nb_conns.get() - 1);
        let queries: Vec<_> = w.query_list.drain(..).collect();
        w.queries = 0;
        debug!("httpd connection closed");
        drop(w);
        // Detached queries survive as long as their holders keep them;
        // replies written through them are silently discarded.
        for q in queries {
            q.detach();
        }
    }

    pub(crate) fn set_mask(&self, el: &mut El) {
        let Some(ev) = self.ev else { return };
        let mut mask = Events::IN;
        if self.queries >= self.cfg.pipeline_depth {
            mask = Events::empty();
        }
        if self.ob.len() >= self.cfg.outbuf_max_size {
            mask = Events::empty();
        }
        if self.state == State::Close {
            mask = Events::empty();
        }
        if !self.ob.is_empty() {
            mask |= Events::OUT;
        }
        el.fd_set_mask(ev, mask);
    }

    /// Splice answered queries' private outbufs into the connection
    /// outbuf in pipeline order, releasing finished records, and promote
    /// the new head.
    pub(crate) fn flush_answered(this: &Rc<RefCell<Self>>, el: &mut El) {
        let mut w = this.borrow_mut();
        let mut idx = 0;
        while idx < w.query_list.len() {
            let q = w.query_list[idx].clone();
            if let Some(mut pob) = q.take_priv_ob() {
                w.ob.merge(&mut pob);
            }
            if !q.answered() {
                q.promote_to_head();
                break;
            }
            if q.parsed() {
                w.query_list.remove(idx);
                w.queries -= 1;
                q.detach();
                continue;
            }
            idx += 1;
        }
        w.set_mask(el);
    }

    /// Request fully received: advance the pipeline and reset the
    /// parser.
    fn finish_request(this: &Rc<RefCell<Self>>, el: &mut El, q: &Rc<Query>) {
        q.set_parsed();
        Self::flush_answered(this, el);
        let mut w = this.borrow_mut();
        w.state = if w.connection_close {
            State::Close
        } else {
            State::Idle { scanned: 0 }
        };
    }

    fn unrecoverable(this: &Rc<RefCell<Self>>, el: &mut El, q: &Rc<Query>) {
        this.borrow_mut().connection_close = true;
        Self::finish_request(this, el, q);
    }

    fn parse_step(this: &Rc<RefCell<Self>>, el: &mut El) -> Step {
        let state = this.borrow().state;
        match state {
            State::Idle { scanned } => Self::parse_idle(this, el, scanned),
            State::Body { remaining } => Self::parse_body(this, el, remaining),
            State::ChunkHdr => Self::parse_chunk_hdr(this, el),
            State::Chunk { remaining } => Self::parse_chunk(this, el, remaining),
            State::ChunkTrailer => Self::parse_chunk_trailer(this, el),
            State::Close => {
                this.borrow_mut().ibuf.clear();
                Step::More
            }
        }
    }

    fn parse_idle(this: &Rc<RefCell<Self>>, el: &mut El, scanned: usize) -> Step {
        let parsed = {
            let mut w = this.borrow_mut();
            let start = scanned.saturating_sub(3);
            let terminated = w.ibuf.len() >= 4
                && memmem::find(&w.ibuf[start..], b"\r\n\r\n").is_some();
            if !terminated {
                if w.ibuf.len() > w.cfg.header_size_max {
                    let max = w.cfg.header_size_max;
                    drop(w);
                    let q = Query::create(this, None, None, Version::HTTP_11, false);
                    q.reject(el, 403, format_args!("headers exceed {max} octets"));
                    Self::unrecoverable(this, el, &q);
                    return Step::Cont;
                }
                w.state = State::Idle { scanned: w.ibuf.len() };
                return Step::More;
            }

            // Connection lifetime limit.
            if w.max_queries > 0 {
                w.max_queries -= 1;
                if w.max_queries == 0 {
                    w.connection_close = true;
                }
            }

            codec::parse_request_head(&w.ibuf)
        };

        let (mut info, facts, head_len) = match parsed {
            Ok(Some(parts)) => parts,
            Ok(None) => return Step::More,
            Err(parse) => {
                let q = Query::create(this, None, None, Version::HTTP_11, false);
                q.reject(el, parse.reject_code(), parse.reject_text());
                Self::unrecoverable(this, el, &q);
                return Step::Cont;
            }
        };

        let method = info.method();
        let version = info.version();
        let trigger = {
            let mut w = this.borrow_mut();
            w.connection_close |= facts.conn_close;
            if version == Version::HTTP_10 {
                w.connection_close = true;
            }
            if facts.chunked {
                // rfc 2616: §4.4: if chunked, ignore any Content-Length.
                w.state = State::ChunkHdr;
            } else {
                w.state = State::Body {
                    remaining: facts.content_length.unwrap_or(0),
                };
            }
            w.ibuf.drain(..head_len);

            let (trigger, prefix_len) = w.cfg.resolve(method, info.path());
            info.set_prefix_len(prefix_len);
            trigger
        };

        let q = Query::create(
            this,
            trigger.clone(),
            Some(Rc::new(info)),
            version,
            facts.expect_100,
        );

        match method {
            Method::Trace => Self::do_trace(el, &q),
            Method::Post | Method::Put
                if facts.content_length.is_none() && !facts.chunked =>
            {
                let parse = Parse::LengthRequired;
                q.reject(el, parse.reject_code(), parse.reject_text());
                Self::unrecoverable(this, el, &q);
                return Step::Cont;
            }
            _ => Self::do_any(this, el, &q, trigger),
        }
        q.reply_100continue();
        Step::Cont
    }

    fn do_any(
        this: &Rc<RefCell<Self>>,
        el: &mut El,
        q: &Rc<Query>,
        trigger: Option<Rc<dyn Trigger>>,
    ) {
        let info = q.qinfo().expect("dispatched query carries its qinfo");
        if info.path() == "*" {
            q.reject(el, 404, "'*' not found");
            return;
        }

        match trigger {
            Some(trigger) => {
                if trigger.auth_realm().is_some() {
                    match get_basic_auth(&info) {
                        Err(_) => {
                            q.reject(el, 400, "invalid Authentication header");
                        }
                        Ok((user, password)) => {
                            trigger.on_auth(el, q, &user, &password);
                        }
                    }
                }
                if !q.answered() {
                    trigger.on_query(el, q, &info);
                }
            }
            None => {
                let method = info.method();
                let tree_empty = this.borrow().cfg.method_tree_is_empty(method);
                if tree_empty {
                    q.reject(el, 501, format_args!("no handler for {method}"));
                } else {
                    q.reject(
                        el,
                        404,
                        format_args!(
                            "{method} {} HTTP/1.{}",
                            info.path(),
                            info.version().minor
                        ),
                    );
                }
            }
        }
    }

    /// TRACE is served inline: the received head is echoed back as a
    /// chunked `message/http` body. Refused on HTTP/1.0 where chunked
    /// framing does not exist.
    fn do_trace(el: &mut El, q: &Rc<Query>) {
        if q.version() == Version::HTTP_10 {
            q.reject(el, 501, "TRACE on HTTP/1.0 isn't supported");
            return;
        }
        let info = q.qinfo().expect("dispatched query carries its qinfo");

        q.set_on_data(Box::new(|_el, q, data| {
            if !data.is_empty() {
                q.with_ob(|ob| {
                    let _ = write!(ob, "\r\n{:x}\r\n", data.len());
                    ob.add(data);
                });
            }
        }));
        q.set_on_done(Box::new(|el, q| q.reply_done(el)));

        q.reply_hdrs_start(200, false);
        q.with_ob(|ob| ob.adds("Content-Type: message/http\r\n"));
        q.reply_hdrs_done(-1, true);
        q.with_ob(|ob| {
            let raw = info.raw_head();
            let _ = write!(ob, "\r\n{:x}\r\n", raw.len());
            ob.add(raw);
        });
    }

    fn last_query(&self) -> Rc<Query> {
        self.query_list
            .back()
            .cloned()
            .expect("parser states past Idle always have a query")
    }

    fn parse_body(this: &Rc<RefCell<Self>>, el: &mut El, remaining: u64) -> Step {
        let (q, data, finished) = {
            let mut w = this.borrow_mut();
            let q = w.last_query();
            q.expect100cont.set(false);
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
            q.call_on_data(el, &data);
        }
        if finished {
            q.call_on_done(el);
            Self::finish_request(this, el, &q);
            return Step::Cont;
        }
        Step::More
    }

    fn parse_chunk_hdr(this: &Rc<RefCell<Self>>, el: &mut El) -> Step {
        let res = {
            let mut w = this.borrow_mut();
            let q = w.last_query();
            q.expect100cont.set(false);
            let line_max = w.cfg.header_line_max;
            match codec::parse_chunk_size(&w.ibuf, line_max) {
                Ok(codec::ChunkStatus::Partial) => return Step::More,
                Ok(codec::ChunkStatus::Complete { consumed, size }) => {
                    w.ibuf.drain(..consumed);
                    w.state = if size > 0 {
                        State::Chunk { remaining: size }
                    } else {
                        State::ChunkTrailer
                    };
                    Ok(())
                }
                Err(_) => Err(q),
            }
        };
        match res {
            Ok(()) => Step::Cont,
            Err(q) => {
                q.reject(el, 400, Parse::ChunkSize.reject_text());
                Self::unrecoverable(this, el, &q);
                Step::Cont
            }
        }
    }

    fn parse_chunk(this: &Rc<RefCell<Self>>, el: &mut El, remaining: u64) -> Step {
        enum Outcome {
            Done(Vec<u8>),
            Stream(Vec<u8>),
            Malformed,
            NeedMore,
        }

        let (q, outcome) = {
            let mut w = this.borrow_mut();
            let q = w.last_query();
            let plen = w.ibuf.len() as u64;

            if plen >= remaining + 2 {
                let data: Vec<u8> = w.ibuf.drain(..remaining as usize).collect();
                if !w.ibuf.starts_with(b"\r\n") {
                    (q, Outcome::Malformed)
                } else {
                    w.ibuf.drain(..2);
                    w.state = State::ChunkHdr;
                    (q, Outcome::Done(data))
                }
            } else {
                let take = plen.min(remaining);
                if take >= w.cfg.on_data_threshold as u64 && take > 0 {
                    let data: Vec<u8> = w.ibuf.drain(..take as usize).collect();
                    w.state = State::Chunk {
                        remaining: remaining - take,
                    };
                    (q, Outcome::Stream(data))
                } else {
                    (q, Outcome::NeedMore)
                }
            }
        };

        match outcome {
            Outcome::Done(data) => {
                q.call_on_data(el, &data);
                Step::Cont
            }
            Outcome::Stream(data) => {
                q.call_on_data(el, &data);
                Step::More
            }
            Outcome::Malformed => {
                q.reject(el, 400, Parse::ChunkSize.reject_text());
                Self::unrecoverable(this, el, &q);
                Step::Cont
            }
            Outcome::NeedMore => Step::More,
        }
    }

    /// Trailer headers are consumed and discarded: clients must ask for
    /// them explicitly and this server never does.
    fn parse_chunk_trailer(this: &Rc<RefCell<Self>>, el: &mut El) -> Step {
        let res = loop {
            let mut w = this.borrow_mut();
            match memmem::find(&w.ibuf, b"\r\n") {
                None => {
                    if w.ibuf.len() > w.cfg.header_line_max {
                        break Err(w.last_query());
                    }
                    return Step::More;
                }
                Some(0) => {
                    w.ibuf.drain(..2);
                    break Ok(w.last_query());
                }
                Some(pos) => {
                    w.ibuf.drain(..pos + 2);
                }
            }
        };
        match res {
            Ok(q) => {
                q.call_on_done(el);
                Self::finish_request(this, el, &q);
                Step::Cont
            }
            Err(q) => {
                q.reject(el, 400, "trailer headers are unparseable");
                Self::unrecoverable(this, el, &q);
                Step::Cont
            }
        }
    }
}

/// Decode `Authorization: Basic` credentials from a request head.
/// Missing credentials yield empty strings; a malformed header is a
/// parse error (rejected with 400 by the dispatcher).
pub fn get_basic_auth(info: &QInfo) -> Result<(String, String)> {
    use crate::codec::WkHdr;

    let bad = || Error::new_parse(Parse::BadRequest);

    let Some(val) = info.header(WkHdr::Authorization) else {
        return Ok((String::new(), String::new()));
    };
    let val = val.strip_prefix(b" ").unwrap_or(val);
    let mut parts = val.splitn(2, |&b| b == b' ');
    let scheme = parts.next().unwrap_or(b"");
    if !scheme.eq_ignore_ascii_case(b"basic") {
        return Err(bad());
    }
    let b64: Vec<u8> = parts
        .next()
        .unwrap_or(b"")
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&b64)
        .map_err(|_| bad())?;
    let decoded = String::from_utf8(decoded).map_err(|_| bad())?;
    let colon = decoded.find(':').ok_or_else(bad)?;
    Ok((
        decoded[..colon].to_owned(),
        decoded[colon + 1..].to_owned(),
    ))
}

#[cfg(test)]
mod tests;
