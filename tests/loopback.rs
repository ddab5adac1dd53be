//! Full-stack loopback: the HTTP client engine talking to the HTTP
//! server engine over real TCP, both driven by one reactor.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rill::core::El;
use rill::http::client::{self, HttpcCfg, HttpcQuery, Status};
use rill::http::codec::{Method, QInfo};
use rill::http::server::{self, HttpdCfg, Query, Trigger};

struct Ping;

impl Trigger for Ping {
    fn on_query(&self, el: &mut El, q: &Rc<Query>, _info: &Rc<QInfo>) {
        q.reply_hdrs_start(200, false);
        q.reply_hdrs_done(4, false);
        q.with_ob(|ob| ob.adds("pong"));
        q.reply_done(el);
    }
}

struct Upper;

impl Trigger for Upper {
    fn on_query(&self, el: &mut El, q: &Rc<Query>, _info: &Rc<QInfo>) {
        q.bufferize(el, 1 << 16);
        q.set_on_done(Box::new(|el, q| {
            let upper: Vec<u8> = q
                .take_payload()
                .iter()
                .map(u8::to_ascii_uppercase)
                .collect();
            q.reply_hdrs_start(200, false);
            q.reply_hdrs_done(-1, true);
            q.reply_chunk_start();
            q.with_ob(|ob| ob.add(&upper));
            q.reply_chunk_done();
            q.reply_done(el);
        }));
    }
}

fn bound_addr(el: &El, listener: rill::core::Ev) -> SocketAddr {
    let fd = el.fd_get_fd(listener).expect("listener is registered");
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let res = unsafe { libc::getsockname(fd, std::ptr::addr_of_mut!(addr).cast(), &mut len) };
    assert_eq!(res, 0);
    format!("127.0.0.1:{}", u16::from_be(addr.sin_port))
        .parse()
        .expect("valid socket address")
}

fn pump_until(el: &mut El, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "loopback timed out");
        el.loop_timeout(10);
    }
}

#[test]
fn get_roundtrip_over_tcp() {
    let mut el = El::new();

    let srv_cfg = HttpdCfg::new();
    srv_cfg.trigger_register(Method::Get, "/ping", Rc::new(Ping));
    let listener = server::listen(&mut el, "127.0.0.1:0".parse().unwrap(), &srv_cfg).unwrap();
    let addr = bound_addr(&el, listener);

    let cli_cfg = HttpcCfg::new();
    let conn = client::connect(&mut el, addr, &cli_cfg, None).unwrap();

    let q = HttpcQuery::new();
    q.bufferize(1 << 16);
    let done = Rc::new(RefCell::new(None));
    let done2 = done.clone();
    q.set_on_done(Box::new(move |_el, _q, st| {
        *done2.borrow_mut() = Some(st);
    }));
    q.attach(&mut el, &conn);
    q.query_start(Method::Get, "localhost", "/ping");
    q.query_hdrs_done(&mut el, -1, false);
    q.query_done(&mut el);

    pump_until(&mut el, || done.borrow().is_some());
    assert_eq!(*done.borrow(), Some(Status::Ok));
    assert_eq!(q.rinfo().unwrap().code(), 200);
    assert_eq!(&q.payload()[..], b"pong");

    server::unlisten(&mut el, listener);
}

#[test]
fn pipelined_chunked_roundtrip_over_tcp() {
    let mut el = El::new();

    let srv_cfg = HttpdCfg::new();
    srv_cfg.trigger_register(Method::Post, "/upper", Rc::new(Upper));
    let listener = server::listen(&mut el, "127.0.0.1:0".parse().unwrap(), &srv_cfg).unwrap();
    let addr = bound_addr(&el, listener);

    let cli_cfg = HttpcCfg::new();
    let conn = client::connect(&mut el, addr, &cli_cfg, None).unwrap();

    let mut dones = Vec::new();
    let mut queries = Vec::new();
    for body in ["first body", "second body"] {
        let q = HttpcQuery::new();
        q.bufferize(1 << 16);
        let done = Rc::new(RefCell::new(None));
        let done2 = done.clone();
        q.set_on_done(Box::new(move |_el, _q, st| {
            *done2.borrow_mut() = Some(st);
        }));
        q.attach(&mut el, &conn);
        q.query_start(Method::Post, "localhost", "/upper");
        q.query_hdrs_done(&mut el, -1, true);
        q.query_chunk_start();
        let _ = q.body_ob(|ob| ob.adds(body));
        q.query_chunk_done();
        q.query_done(&mut el);
        dones.push(done);
        queries.push(q);
    }

    pump_until(&mut el, || dones.iter().all(|d| d.borrow().is_some()));
    assert_eq!(*dones[0].borrow(), Some(Status::Ok));
    assert_eq!(*dones[1].borrow(), Some(Status::Ok));
    assert_eq!(&queries[0].payload()[..], b"FIRST BODY");
    assert_eq!(&queries[1].payload()[..], b"SECOND BODY");

    server::unlisten(&mut el, listener);
}
