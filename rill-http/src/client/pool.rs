//! Connection pool.
//!
//! A pool tracks one upstream (address + host) and its connections,
//! split into a ready list and a busy list. Every connection is on
//! exactly one of the two; `len` counts both. New connects are refused
//! past `max_len`, or past a shared global ceiling when several pools
//! account into one counter.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use rill_core::El;

use crate::error::Result;

use super::{connect, Httpc, HttpcCfg};

/// Pool state-change hook: `(loop, connection)`.
pub type PoolHook = Box<dyn FnMut(&mut El, &Rc<RefCell<Httpc>>)>;

pub struct HttpcPool {
    cfg: Rc<HttpcCfg>,
    addr: SocketAddr,
    host: String,
    max_len: usize,
    len: usize,
    len_global: Option<Rc<Cell<usize>>>,
    max_len_global: usize,
    ready: VecDeque<Rc<RefCell<Httpc>>>,
    busy: Vec<Rc<RefCell<Httpc>>>,
    on_ready: Option<PoolHook>,
    on_busy: Option<PoolHook>,
}

impl HttpcPool {
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        host: impl Into<String>,
        cfg: &Rc<HttpcCfg>,
        max_len: usize,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            cfg: cfg.clone(),
            addr,
            host: host.into(),
            max_len,
            len: 0,
            len_global: None,
            max_len_global: 0,
            ready: VecDeque::new(),
            busy: Vec::new(),
            on_ready: None,
            on_busy: None,
        }))
    }

    /// Account this pool's connections into a counter shared with other
    /// pools, capped at `ceiling`.
    pub fn share_counter(&mut self, counter: Rc<Cell<usize>>, ceiling: usize) {
        self.len_global = Some(counter);
        self.max_len_global = ceiling;
    }

    pub fn set_on_ready(&mut self, hook: PoolHook) {
        self.on_ready = Some(hook);
    }

    pub fn set_on_busy(&mut self, hook: PoolHook) {
        self.on_busy = Some(hook);
    }

    /// The `Host` this pool's requests are addressed to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Connections currently attached, ready and busy together.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Grab an idle connection, rotating the ready list for fairness.
    /// With none idle and headroom under the caps, a fresh connect is
    /// launched into the pool and `None` returned for now: it turns
    /// ready once the transport is up.
    pub fn get(el: &mut El, pool: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<Httpc>>> {
        let (addr, cfg) = {
            let mut p = pool.borrow_mut();
            if let Some(conn) = p.ready.pop_front() {
                p.ready.push_back(conn.clone());
                return Some(conn);
            }
            if p.len >= p.max_len {
                return None;
            }
            if let Some(global) = &p.len_global {
                if global.get() >= p.max_len_global {
                    return None;
                }
            }
            (p.addr, p.cfg.clone())
        };
        let _ = connect(el, addr, &cfg, Some(pool));
        None
    }

    /// Unconditionally launch one more pooled connection.
    pub fn launch(el: &mut El, pool: &Rc<RefCell<Self>>) -> Result<Rc<RefCell<Httpc>>> {
        let (addr, cfg) = {
            let p = pool.borrow();
            (p.addr, p.cfg.clone())
        };
        connect(el, addr, &cfg, Some(pool))
    }

    /// Close every pooled connection, aborting their in-flight queries.
    pub fn close_clients(el: &mut El, pool: &Rc<RefCell<Self>>) {
        let conns: Vec<_> = {
            let p = pool.borrow();
            p.ready.iter().chain(p.busy.iter()).cloned().collect()
        };
        for conn in conns {
            super::close(el, &conn);
        }
    }

    /// Adopt `conn` into the pool on the list matching its busy state.
    pub fn attach(pool: &Rc<RefCell<Self>>, el: &mut El, conn: &Rc<RefCell<Httpc>>) {
        detach(conn);
        *conn.borrow().pool.borrow_mut() = Rc::downgrade(pool);
        let busy = conn.borrow().busy.get();
        let hook = {
            let mut p = pool.borrow_mut();
            p.len += 1;
            if let Some(global) = &p.len_global {
                global.set(global.get() + 1);
            }
            if busy {
                p.busy.push(conn.clone());
                p.on_busy.take()
            } else {
                p.ready.push_back(conn.clone());
                p.on_ready.take()
            }
        };
        run_hook(pool, el, conn, hook, busy);
    }
}

fn run_hook(
    pool: &Rc<RefCell<HttpcPool>>,
    el: &mut El,
    conn: &Rc<RefCell<Httpc>>,
    hook: Option<PoolHook>,
    busy: bool,
) {
    let Some(mut f) = hook else { return };
    f(el, conn);
    let mut p = pool.borrow_mut();
    let slot = if busy { &mut p.on_busy } else { &mut p.on_ready };
    if slot.is_none() {
        *slot = Some(f);
    }
}

/// Drop `conn` from its pool's lists and counters.
pub(crate) fn detach(conn: &Rc<RefCell<Httpc>>) {
    let pool = conn.borrow().pool.borrow().upgrade();
    let Some(pool) = pool else {
        *conn.borrow().pool.borrow_mut() = Weak::new();
        return;
    };
    let mut p = pool.borrow_mut();
    p.len -= 1;
    if let Some(global) = &p.len_global {
        global.set(global.get() - 1);
    }
    p.ready.retain(|c| !Rc::ptr_eq(c, conn));
    p.busy.retain(|c| !Rc::ptr_eq(c, conn));
    drop(p);
    *conn.borrow().pool.borrow_mut() = Weak::new();
}

/// Move `conn` to the ready list and fire the pool's `on_ready`.
pub(crate) fn notify_ready(conn: &Rc<RefCell<Httpc>>, el: &mut El) {
    let Some(pool) = conn.borrow().pool.borrow().upgrade() else {
        return;
    };
    let hook = {
        let mut p = pool.borrow_mut();
        p.busy.retain(|c| !Rc::ptr_eq(c, conn));
        if !p.ready.iter().any(|c| Rc::ptr_eq(c, conn)) {
            p.ready.push_back(conn.clone());
        }
        p.on_ready.take()
    };
    run_hook(&pool, el, conn, hook, false);
}

/// Move `conn` to the busy list and fire the pool's `on_busy`.
pub(crate) fn notify_busy(conn: &Rc<RefCell<Httpc>>, el: &mut El) {
    let Some(pool) = conn.borrow().pool.borrow().upgrade() else {
        return;
    };
    let hook = {
        let mut p = pool.borrow_mut();
        p.ready.retain(|c| !Rc::ptr_eq(c, conn));
        if !p.busy.iter().any(|c| Rc::ptr_eq(c, conn)) {
            p.busy.push(conn.clone());
        }
        p.on_busy.take()
    };
    run_hook(&pool, el, conn, hook, true);
}
