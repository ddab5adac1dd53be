//! Outbound query records.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use rill_core::El;

use crate::codec::{self, urlencode_into, Method, RInfo};
use crate::outbuf::{Outbuf, CHUNK_HDR_LEN};

use super::{Httpc, Status};

/// Hook run when the interim `100 Continue` (real or synthesized)
/// arrives.
pub type On100Cont = Box<dyn FnMut(&mut El, &Rc<HttpcQuery>)>;
/// Hook run once the reply head is parsed; an `Err` fails the query.
pub type OnHdrs = Box<dyn FnMut(&mut El, &Rc<HttpcQuery>) -> Result<(), Status>>;
/// Streaming reply-body consumer; an `Err` fails the query.
pub type OnData = Box<dyn FnMut(&mut El, &Rc<HttpcQuery>, &[u8]) -> Result<(), Status>>;
/// Completion hook with the final [`Status`].
pub type OnDone = Box<dyn FnMut(&mut El, &Rc<HttpcQuery>, Status)>;

/// One in-flight outbound request.
///
/// Attach it to a connection, emit the request with
/// [`HttpcQuery::query_start`] / [`HttpcQuery::query_hdrs_done`] /
/// [`HttpcQuery::query_done`], and collect the reply through the hooks.
pub struct HttpcQuery {
    owner: RefCell<Weak<RefCell<Httpc>>>,
    rinfo: RefCell<Option<Rc<RInfo>>>,

    payload: RefCell<Vec<u8>>,
    payload_max: Cell<usize>,
    chunk_hdr_offs: Cell<usize>,
    chunk_prev_length: Cell<usize>,

    hdrs_started: Cell<bool>,
    hdrs_done: Cell<bool>,
    chunked: Cell<bool>,
    chunk_started: Cell<bool>,
    query_done: Cell<bool>,
    pub(crate) expect100cont: Cell<bool>,

    on_100cont: RefCell<Option<On100Cont>>,
    on_hdrs: RefCell<Option<OnHdrs>>,
    on_data: RefCell<Option<OnData>>,
    on_done: RefCell<Option<OnDone>>,
}

impl HttpcQuery {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            owner: RefCell::new(Weak::new()),
            rinfo: RefCell::new(None),
            payload: RefCell::new(Vec::new()),
            payload_max: Cell::new(0),
            chunk_hdr_offs: Cell::new(0),
            chunk_prev_length: Cell::new(0),
            hdrs_started: Cell::new(false),
            hdrs_done: Cell::new(false),
            chunked: Cell::new(false),
            chunk_started: Cell::new(false),
            query_done: Cell::new(false),
            expect100cont: Cell::new(false),
            on_100cont: RefCell::new(None),
            on_hdrs: RefCell::new(None),
            on_data: RefCell::new(None),
            on_done: RefCell::new(None),
        })
    }

    /* ----- hooks & knobs ----- */

    pub fn set_on_100cont(&self, hook: On100Cont) {
        *self.on_100cont.borrow_mut() = Some(hook);
    }

    pub fn set_on_hdrs(&self, hook: OnHdrs) {
        *self.on_hdrs.borrow_mut() = Some(hook);
    }

    pub fn set_on_data(&self, hook: OnData) {
        *self.on_data.borrow_mut() = Some(hook);
    }

    pub fn set_on_done(&self, hook: OnDone) {
        *self.on_done.borrow_mut() = Some(hook);
    }

    /// Declare the intent to send `Expect: 100-continue`; must be set
    /// before [`HttpcQuery::query_hdrs_done`].
    pub fn set_expect_100cont(&self, expect: bool) {
        self.expect100cont.set(expect);
    }

    /// The parsed reply head, available from `on_hdrs` onwards.
    #[must_use]
    pub fn rinfo(&self) -> Option<Rc<RInfo>> {
        self.rinfo.borrow().clone()
    }

    /// The body accumulated by [`HttpcQuery::bufferize`].
    #[must_use]
    pub fn payload(&self) -> Ref<'_, Vec<u8>> {
        self.payload.borrow()
    }

    #[must_use]
    pub fn take_payload(&self) -> Vec<u8> {
        std::mem::take(&mut self.payload.borrow_mut())
    }

    /// Install the default reply-body accumulator with a `max` ceiling;
    /// overruns complete the query with [`Status::TooLarge`].
    pub fn bufferize(self: &Rc<Self>, max: usize) {
        self.payload_max.set(max);
        self.set_on_data(Box::new(|_el, q, data| {
            if q.payload.borrow().len() + data.len() > q.payload_max.get() {
                return Err(Status::TooLarge);
            }
            q.payload.borrow_mut().extend_from_slice(data);
            Ok(())
        }));
    }

    /* ----- connection plumbing ----- */

    pub(crate) fn owner(&self) -> Option<Rc<RefCell<Httpc>>> {
        self.owner.borrow().upgrade()
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.borrow_mut() = Weak::new();
    }

    pub(crate) fn set_rinfo(&self, info: Rc<RInfo>) {
        *self.rinfo.borrow_mut() = Some(info);
    }

    pub(crate) fn has_rinfo(&self) -> bool {
        self.rinfo.borrow().is_some()
    }

    /// Append the query to `conn`'s pipeline. Panics when the
    /// connection has exhausted its lifetime query budget.
    pub fn attach(self: &Rc<Self>, el: &mut El, conn: &Rc<RefCell<Httpc>>) {
        let (close_latch, depth_reached) = {
            let mut w = conn.borrow_mut();
            assert!(w.max_queries > 0, "connection exhausted its query budget");
            assert!(
                !self.hdrs_started.get() && !self.hdrs_done.get(),
                "query already started"
            );
            *self.owner.borrow_mut() = Rc::downgrade(conn);
            w.query_list.push_back(self.clone());
            w.max_queries -= 1;
            if w.max_queries == 0 {
                w.connection_close = true;
            }
            w.queries += 1;
            w.set_mask(el);
            (w.max_queries == 0, w.queries >= w.cfg.pipeline_depth)
        };
        if close_latch || depth_reached {
            Httpc::set_busy(conn, el);
        }
    }

    fn with_ob<R>(&self, f: impl FnOnce(&mut Outbuf) -> R) -> Option<R> {
        let w = self.owner()?;
        let mut w = w.borrow_mut();
        Some(f(&mut w.ob))
    }

    /* ----- request emission ----- */

    /// Emit the request line (absolute-form when the config says proxy),
    /// `Host`, and the cached `Date` header.
    pub fn query_start(&self, method: Method, host: &str, uri: &str) {
        assert!(
            !self.hdrs_started.get() && !self.hdrs_done.get(),
            "query already started"
        );
        let Some(w) = self.owner() else { return };
        let mut w = w.borrow_mut();
        let use_proxy = w.cfg.use_proxy;
        let conn_close = w.connection_close;
        let ob = &mut w.ob;

        let mut enc_uri = String::with_capacity(uri.len());
        urlencode_into(&mut enc_uri, uri);
        if use_proxy {
            let _ = write!(ob, "{} http://{host}{enc_uri} HTTP/1.1\r\n", method.as_str());
        } else {
            let _ = write!(ob, "{} {enc_uri} HTTP/1.1\r\nHost: {host}\r\n", method.as_str());
        }
        codec::date::extend(ob);
        if conn_close {
            ob.adds("Connection: close\r\n");
        }
        self.hdrs_started.set(true);
    }

    /// Finish the request headers: `Expect: 100-continue` when armed,
    /// `Content-Length` when `clen >= 0`, chunked framing when asked.
    /// The head becomes flushable from here on, so a body withheld for
    /// the interim 100 does not hold it hostage.
    pub fn query_hdrs_done(&self, el: &mut El, clen: i64, chunked: bool) {
        assert!(!self.hdrs_done.get(), "request headers already finished");
        self.hdrs_done.set(true);
        self.with_ob(|ob| {
            if self.expect100cont.get() {
                ob.adds("Expect: 100-continue\r\n");
            }
            if clen >= 0 {
                let mut buf = itoa::Buffer::new();
                ob.adds("Content-Length: ");
                ob.adds(buf.format(clen));
                ob.adds("\r\n");
            }
            if chunked {
                self.chunked.set(true);
                ob.adds("Transfer-Encoding: chunked\r\n");
                // The first chunk header carries the section-closing
                // CRLF.
            } else {
                ob.adds("\r\n");
            }
        });
        if let Some(w) = self.owner() {
            w.borrow().set_mask(el);
        }
    }

    /// Open a body chunk; no-op on non-chunked requests.
    pub fn query_chunk_start(&self) {
        if !self.chunked.get() {
            return;
        }
        assert!(!self.chunk_started.get(), "chunk already started");
        self.chunk_started.set(true);
        self.with_ob(|ob| {
            self.chunk_hdr_offs.set(ob.reserve(CHUNK_HDR_LEN));
            self.chunk_prev_length.set(ob.len());
        });
    }

    /// Close the current chunk, patching its size prefix.
    pub fn query_chunk_done(&self) {
        if !self.chunked.get() {
            return;
        }
        assert!(self.chunk_started.get(), "no chunk in progress");
        self.chunk_started.set(false);
        self.with_ob(|ob| {
            let body_len = ob.len() - self.chunk_prev_length.get();
            ob.chunk_patch(self.chunk_hdr_offs.get(), body_len);
        });
    }

    /// Write into the request body through the owning connection.
    pub fn body_ob<R>(&self, f: impl FnOnce(&mut Outbuf) -> R) -> Option<R> {
        self.with_ob(f)
    }

    /// The request is fully emitted; flushing is now up to the loop.
    pub fn query_done(&self, el: &mut El) {
        assert!(
            self.hdrs_done.get() && !self.query_done.get() && !self.chunk_started.get(),
            "query_done out of sequence"
        );
        if self.chunked.get() {
            self.with_ob(|ob| ob.adds("\r\n0\r\n\r\n"));
        }
        self.query_done.set(true);
        if let Some(w) = self.owner() {
            w.borrow().set_mask(el);
        }
    }

    /* ----- hook dispatch ----- */

    pub(crate) fn call_on_100cont(self: &Rc<Self>, el: &mut El) {
        let hook = self.on_100cont.borrow_mut().take();
        if let Some(mut f) = hook {
            f(el, self);
            let mut slot = self.on_100cont.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    pub(crate) fn call_on_hdrs(self: &Rc<Self>, el: &mut El) -> Result<(), Status> {
        let hook = self.on_hdrs.borrow_mut().take();
        let mut res = Ok(());
        if let Some(mut f) = hook {
            res = f(el, self);
            let mut slot = self.on_hdrs.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
        res
    }

    pub(crate) fn call_on_data(self: &Rc<Self>, el: &mut El, data: &[u8]) -> Result<(), Status> {
        let hook = self.on_data.borrow_mut().take();
        let mut res = Ok(());
        if let Some(mut f) = hook {
            res = f(el, self, data);
            let mut slot = self.on_data.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
        res
    }

    pub(crate) fn call_on_done(self: &Rc<Self>, el: &mut El, status: Status) {
        let hook = self.on_done.borrow_mut().take();
        if let Some(mut f) = hook {
            f(el, self, status);
        }
    }
}

impl fmt::Debug for HttpcQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpcQuery")
            .field("hdrs_done", &self.hdrs_done.get())
            .field("query_done", &self.query_done.get())
            .field("has_rinfo", &self.has_rinfo())
            .finish()
    }
}
