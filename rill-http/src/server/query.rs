//! Server-side query records and the reply API.
//!
//! A [`Query`] is shared between the owning connection and whoever the
//! trigger handed it to: the connection holds it until the response is
//! complete, the handler may keep its own `Rc` and answer asynchronously.
//! When the connection dies first, the query sheds its owner and further
//! writes land in a private outbuf that is simply discarded — answering
//! a dead connection is legal and silent.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use rill_core::El;

use crate::codec::{self, reason_phrase, QInfo, Version, WkHdr};
use crate::outbuf::{Outbuf, CHUNK_HDR_LEN};

use super::{Httpd, Trigger};

/// Streaming body consumer: `(loop, query, body bytes)`.
pub type OnData = Box<dyn FnMut(&mut El, &Rc<Query>, &[u8])>;
/// End-of-body hook.
pub type OnDone = Box<dyn FnMut(&mut El, &Rc<Query>)>;

/// One in-flight request on a server connection.
pub struct Query {
    owner: RefCell<Weak<RefCell<Httpd>>>,
    pub(crate) trigger: RefCell<Option<Rc<dyn Trigger>>>,
    qinfo: RefCell<Option<Rc<QInfo>>>,

    // Input side.
    pub(crate) expect100cont: Cell<bool>,
    parsed: Cell<bool>,

    // Output side.
    uses_conn_ob: Cell<bool>,
    hdrs_started: Cell<bool>,
    hdrs_done: Cell<bool>,
    chunk_started: Cell<bool>,
    chunked: Cell<bool>,
    answered: Cell<bool>,
    conn_close: Cell<bool>,

    answer_code: Cell<u16>,
    version: Cell<Version>,
    chunk_hdr_offs: Cell<usize>,
    chunk_prev_length: Cell<usize>,

    payload_max: Cell<usize>,
    payload: RefCell<Vec<u8>>,
    priv_ob: RefCell<Option<Outbuf>>,
    on_data: RefCell<Option<OnData>>,
    on_done: RefCell<Option<OnDone>>,
}

impl Query {
    pub(crate) fn create(
        conn: &Rc<RefCell<Httpd>>,
        trigger: Option<Rc<dyn Trigger>>,
        qinfo: Option<Rc<QInfo>>,
        version: Version,
        expect100cont: bool,
    ) -> Rc<Self> {
        let mut w = conn.borrow_mut();
        let q = Rc::new(Self {
            owner: RefCell::new(Rc::downgrade(conn)),
            trigger: RefCell::new(trigger),
            qinfo: RefCell::new(qinfo),
            expect100cont: Cell::new(expect100cont),
            parsed: Cell::new(false),
            // The first in-flight query writes straight into the
            // connection outbuf; later ones buffer privately until they
            // reach the head of the pipeline.
            uses_conn_ob: Cell::new(w.queries == 0),
            hdrs_started: Cell::new(false),
            hdrs_done: Cell::new(false),
            chunk_started: Cell::new(false),
            chunked: Cell::new(false),
            answered: Cell::new(false),
            conn_close: Cell::new(false),
            answer_code: Cell::new(0),
            version: Cell::new(version),
            chunk_hdr_offs: Cell::new(0),
            chunk_prev_length: Cell::new(0),
            payload_max: Cell::new(0),
            payload: RefCell::new(Vec::new()),
            priv_ob: RefCell::new(None),
            on_data: RefCell::new(None),
            on_done: RefCell::new(None),
        });
        w.queries += 1;
        w.query_list.push_back(q.clone());
        q
    }

    /* ----- accessors ----- */

    /// The parsed request head; `None` only for the synthetic queries a
    /// rejected unparseable request gets.
    #[must_use]
    pub fn qinfo(&self) -> Option<Rc<QInfo>> {
        self.qinfo.borrow().clone()
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version.get()
    }

    /// Whether the response has been completed.
    #[must_use]
    pub fn answered(&self) -> bool {
        self.answered.get()
    }

    /// The status code the response was started with.
    #[must_use]
    pub fn answer_code(&self) -> u16 {
        self.answer_code.get()
    }

    /// Whether the owning connection is still alive. Replying through a
    /// dead connection silently discards the bytes.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.owner.borrow().strong_count() > 0
    }

    /// The body accumulated by [`Query::bufferize`].
    #[must_use]
    pub fn payload(&self) -> Ref<'_, Vec<u8>> {
        self.payload.borrow()
    }

    /// Take the accumulated body out of the query.
    #[must_use]
    pub fn take_payload(&self) -> Vec<u8> {
        std::mem::take(&mut self.payload.borrow_mut())
    }

    /// Install a streaming body consumer.
    pub fn set_on_data(&self, hook: OnData) {
        *self.on_data.borrow_mut() = Some(hook);
    }

    /// Install an end-of-body hook.
    pub fn set_on_done(&self, hook: OnDone) {
        *self.on_done.borrow_mut() = Some(hook);
    }

    /* ----- connection plumbing ----- */

    pub(crate) fn owner(&self) -> Option<Rc<RefCell<Httpd>>> {
        self.owner.borrow().upgrade()
    }

    pub(crate) fn detach(&self) {
        *self.owner.borrow_mut() = Weak::new();
        self.uses_conn_ob.set(false);
    }

    pub(crate) fn parsed(&self) -> bool {
        self.parsed.get()
    }

    pub(crate) fn set_parsed(&self) {
        self.parsed.set(true);
    }

    pub(crate) fn promote_to_head(&self) {
        self.uses_conn_ob.set(true);
    }

    pub(crate) fn take_priv_ob(&self) -> Option<Outbuf> {
        self.priv_ob.borrow_mut().take()
    }

    /// Run `f` on the outbuf this query currently writes to: the shared
    /// connection buffer at the head of the pipeline, a private one
    /// otherwise.
    pub fn with_ob<R>(&self, f: impl FnOnce(&mut Outbuf) -> R) -> R {
        if self.uses_conn_ob.get() {
            if let Some(w) = self.owner() {
                return f(&mut w.borrow_mut().ob);
            }
        }
        let mut ob = self.priv_ob.borrow_mut();
        f(ob.get_or_insert_with(Outbuf::new))
    }

    pub(crate) fn call_on_data(self: &Rc<Self>, el: &mut El, data: &[u8]) {
        let hook = self.on_data.borrow_mut().take();
        if let Some(mut f) = hook {
            f(el, self, data);
            if !self.answered.get() {
                let mut slot = self.on_data.borrow_mut();
                if slot.is_none() {
                    *slot = Some(f);
                }
            }
        }
    }

    pub(crate) fn call_on_done(self: &Rc<Self>, el: &mut El) {
        let hook = self.on_done.borrow_mut().take();
        if let Some(mut f) = hook {
            f(el, self);
            if !self.answered.get() {
                let mut slot = self.on_done.borrow_mut();
                if slot.is_none() {
                    *slot = Some(f);
                }
            }
        }
    }

    /* ----- low-level reply API ----- */

    /// Emit the status line, the cached `Date` header, and, when the
    /// connection is closing or `force_uncacheable` asks for it, the
    /// matching header lines. Must be the first reply call.
    pub fn reply_hdrs_start(&self, code: u16, force_uncacheable: bool) {
        assert!(
            !self.hdrs_started.get() && !self.hdrs_done.get(),
            "response headers already started"
        );
        self.answer_code.set(code);
        let minor = self.version.get().minor;

        let owner_close = self.owner().map_or(false, |w| w.borrow().connection_close);
        let add_close = owner_close && !self.conn_close.get();
        if add_close {
            self.conn_close.set(true);
        }
        self.with_ob(|ob| {
            let _ = write!(ob, "HTTP/1.{minor} {code} {}\r\n", reason_phrase(code));
            codec::date::extend(ob);
            if add_close {
                ob.adds("Connection: close\r\n");
            }
            if force_uncacheable {
                ob.adds(
                    "Cache-Control: no-store, no-cache, must-revalidate\r\n\
                     Pragma: no-cache\r\n",
                );
            }
        });
        self.hdrs_started.set(true);
    }

    /// Finish the header section. `clen >= 0` emits `Content-Length`;
    /// `chunked` selects chunked transfer-encoding on HTTP/1.1 and
    /// falls back to EOF framing (`Connection: close`) on HTTP/1.0.
    pub fn reply_hdrs_done(&self, clen: i64, chunked: bool) {
        assert!(!self.hdrs_done.get(), "response headers already finished");
        self.hdrs_done.set(true);

        if chunked && self.version.get() != Version::HTTP_10 {
            self.chunked.set(true);
            self.with_ob(|ob| {
                if clen >= 0 {
                    let _ = write!(ob, "Content-Length: {clen}\r\n");
                }
                ob.adds("Transfer-Encoding: chunked\r\n");
                // No blank line: the first chunk header (or the
                // terminator) starts with CRLF and closes the section.
            });
            return;
        }

        let add_close = chunked && !self.conn_close.get();
        if add_close {
            self.conn_close.set(true);
        }
        if chunked {
            if let Some(w) = self.owner() {
                w.borrow_mut().connection_close = true;
            }
        }
        self.with_ob(|ob| {
            if clen >= 0 {
                let mut buf = itoa::Buffer::new();
                ob.adds("Content-Length: ");
                ob.adds(buf.format(clen));
                ob.adds("\r\n");
            }
            if add_close {
                ob.adds("Connection: close\r\n");
            }
            ob.adds("\r\n");
        });
    }

    /// Open a chunk: reserves the size prefix to be patched by
    /// [`Query::reply_chunk_done`]. No-op on non-chunked responses.
    pub fn reply_chunk_start(&self) {
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

    /// Close the current chunk, patching its size prefix in place.
    pub fn reply_chunk_done(&self) {
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

    /// Complete the response: emits the chunked terminator when needed,
    /// marks the query answered and advances the pipeline.
    pub fn reply_done(self: &Rc<Self>, el: &mut El) {
        assert!(
            self.hdrs_done.get() && !self.answered.get() && !self.chunk_started.get(),
            "reply_done out of sequence"
        );
        if self.chunked.get() {
            self.with_ob(|ob| ob.adds("\r\n0\r\n\r\n"));
        }
        self.mark_answered(el);
    }

    fn mark_answered(self: &Rc<Self>, el: &mut El) {
        debug_assert!(!self.answered.get());
        self.answered.set(true);
        *self.on_data.borrow_mut() = None;
        *self.on_done.borrow_mut() = None;
        self.expect100cont.set(false);
        if let Some(w) = self.owner() {
            let is_head = w
                .borrow()
                .query_list
                .front()
                .is_some_and(|head| Rc::ptr_eq(head, self));
            if is_head {
                Httpd::flush_answered(&w, el);
            }
        }
    }

    /* ----- high-level reply API ----- */

    /// Emit `100 Continue` iff the request asked for it and no reply
    /// bytes have been produced yet. At most once per request.
    pub fn reply_100continue(&self) {
        if self.answered.get() || self.hdrs_started.get() {
            return;
        }
        if self.expect100cont.get() {
            let minor = self.version.get().minor;
            self.with_ob(|ob| {
                let _ = write!(ob, "HTTP/1.{minor} 100 Continue\r\n\r\n");
            });
            self.expect100cont.set(false);
        }
    }

    /// Convenience: a bodyless `202 Accepted`.
    pub fn reply_202accepted(self: &Rc<Self>, el: &mut El) {
        if self.answered.get() || self.hdrs_started.get() {
            return;
        }
        self.reply_hdrs_start(202, false);
        self.reply_hdrs_done(0, false);
        self.reply_done(el);
    }

    /// Reject the request with `code` and a minimal HTML error body.
    /// No-op when a reply has already been started.
    pub fn reject(self: &Rc<Self>, el: &mut El, code: u16, msg: impl fmt::Display) {
        if self.answered.get() || self.hdrs_started.get() {
            return;
        }
        self.reply_hdrs_start(code, false);
        self.with_ob(|ob| ob.adds("Content-Type: text/html\r\n"));
        self.reply_hdrs_done(-1, true);

        self.reply_chunk_start();
        self.with_ob(|ob| {
            let _ = write!(
                ob,
                "<html><body><h1>{code} - {}</h1><p>{msg}</p></body></html>",
                reason_phrase(code)
            );
        });
        self.reply_chunk_done();
        self.reply_done(el);
    }

    /// Reject with `401` and a `WWW-Authenticate: Basic` challenge.
    pub fn reject_unauthorized(self: &Rc<Self>, el: &mut El, auth_realm: &str) {
        const BODY: &str =
            "<html><body><h1>401 - Authentication required</h1></body></html>";

        if self.answered.get() || self.hdrs_started.get() {
            return;
        }
        self.reply_hdrs_start(401, false);
        self.with_ob(|ob| {
            ob.adds("Content-Type: text/html\r\n");
            let _ = write!(ob, "WWW-Authenticate: Basic realm=\"{auth_realm}\"\r\n");
        });
        self.reply_hdrs_done(BODY.len() as i64, false);
        self.with_ob(|ob| ob.adds(BODY));
        self.reply_done(el);
    }

    /// Install the default body accumulator: the body is collected into
    /// [`Query::payload`] up to `max` bytes, beyond which the request is
    /// rejected with 413. A `Content-Length` already known to exceed
    /// `max` is rejected immediately.
    pub fn bufferize(self: &Rc<Self>, el: &mut El, max: usize) {
        self.payload_max.set(max);
        self.set_on_data(Box::new(|el, q, data| {
            if q.payload.borrow().len() + data.len() > q.payload_max.get() {
                q.reject(
                    el,
                    413,
                    format_args!("payload is larger than {} octets", q.payload_max.get()),
                );
                return;
            }
            q.payload.borrow_mut().extend_from_slice(data);
        }));

        let Some(info) = self.qinfo() else { return };
        if let Some(val) = info.header(WkHdr::ContentLength) {
            let len: u64 = std::str::from_utf8(val)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            if len > max as u64 {
                self.reject(
                    el,
                    413,
                    format_args!("payload is larger than {max} octets"),
                );
            } else {
                self.payload.borrow_mut().reserve(len as usize);
            }
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if let Some(trigger) = self.trigger.borrow().as_ref() {
            trigger.on_query_wipe(self);
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("answered", &self.answered.get())
            .field("parsed", &self.parsed.get())
            .field("code", &self.answer_code.get())
            .finish()
    }
}
