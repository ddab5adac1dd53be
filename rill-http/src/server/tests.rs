use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use rill_core::El;

use super::*;
use crate::codec::WkHdr;

struct FnTrigger<F>(F);

impl<F: Fn(&mut El, &Rc<Query>, &Rc<QInfo>)> Trigger for FnTrigger<F> {
    fn on_query(&self, el: &mut El, q: &Rc<Query>, info: &Rc<QInfo>) {
        (self.0)(el, q, info)
    }
}

fn trigger<F: Fn(&mut El, &Rc<Query>, &Rc<QInfo>) + 'static>(f: F) -> Rc<dyn Trigger> {
    Rc::new(FnTrigger(f))
}

fn pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(res, 0);
    (fds[0], fds[1])
}

/// Spawn a server connection over a socketpair; returns the loop and
/// the peer ("client") fd.
fn setup(cfg: &Rc<HttpdCfg>) -> (El, RawFd) {
    let mut el = El::new();
    let (server, client) = pair();
    spawn(&mut el, server, cfg);
    (el, client)
}

fn send(fd: RawFd, data: &[u8]) {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    assert_eq!(n, data.len() as isize);
}

fn recv_all(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 16 << 10];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

fn at_eof(fd: RawFd) -> bool {
    let mut buf = [0u8; 1];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 1) };
    n == 0
}

fn pump(el: &mut El, ticks: usize) {
    for _ in 0..ticks {
        el.loop_timeout(10);
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[test]
fn simple_get_with_content_length() {
    let cfg = HttpdCfg::new();
    cfg.trigger_register(
        Method::Get,
        "/hello",
        trigger(|el, q, _info| {
            q.reply_hdrs_start(200, false);
            q.reply_hdrs_done(5, false);
            q.with_ob(|ob| ob.adds("world"));
            q.reply_done(el);
        }),
    );
    let (mut el, client) = setup(&cfg);

    send(client, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);

    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\nDate: "), "{resp}");
    assert!(resp.ends_with("Content-Length: 5\r\n\r\nworld"), "{resp}");
}

#[test]
fn query_info_reaches_the_trigger() {
    let cfg = HttpdCfg::new();
    let seen = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    cfg.trigger_register(
        Method::Get,
        "/api",
        trigger(move |el, q, info| {
            *seen2.borrow_mut() = Some((
                info.host().to_owned(),
                info.prefix().to_owned(),
                info.tail().to_owned(),
                info.query_string().map(str::to_owned),
                info.header(WkHdr::UserAgent).map(<[u8]>::to_vec),
            ));
            q.reply_202accepted(el);
        }),
    );
    let (mut el, client) = setup(&cfg);

    send(
        client,
        b"GET /api/users/7?full=1 HTTP/1.1\r\nHost: h.example\r\nUser-Agent: rill-test\r\n\r\n",
    );
    pump(&mut el, 5);

    let seen = seen.borrow_mut().take().expect("trigger did not run");
    assert_eq!(seen.0, "h.example");
    assert_eq!(seen.1, "/api");
    assert_eq!(seen.2, "/users/7");
    assert_eq!(seen.3.as_deref(), Some("full=1"));
    assert_eq!(seen.4.as_deref(), Some(&b"rill-test"[..]));

    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 202 Accepted\r\n"), "{resp}");
}

#[test]
fn chunked_post_with_100_continue() {
    let cfg = HttpdCfg::new();
    let body = Rc::new(RefCell::new(Vec::new()));
    let body2 = body.clone();
    cfg.trigger_register(
        Method::Post,
        "/p",
        trigger(move |el, q, _info| {
            q.bufferize(el, 1 << 20);
            let body3 = body2.clone();
            q.set_on_done(Box::new(move |el, q| {
                *body3.borrow_mut() = q.take_payload();
                q.reply_hdrs_start(204, false);
                q.reply_hdrs_done(0, false);
                q.reply_done(el);
            }));
        }),
    );
    let (mut el, client) = setup(&cfg);

    send(
        client,
        b"POST /p HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n\
          Transfer-Encoding: chunked\r\n\r\n",
    );
    pump(&mut el, 5);

    // The interim response arrives before any body was sent.
    let interim = text(&recv_all(client));
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");
    assert!(body.borrow().is_empty());

    send(client, b"5\r\nhello\r\n0\r\n\r\n");
    pump(&mut el, 5);

    assert_eq!(&body.borrow()[..], b"hello");
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 204 No Content\r\n"), "{resp}");
    assert!(resp.ends_with("Content-Length: 0\r\n\r\n"), "{resp}");
}

#[test]
fn chunked_request_bodies_roundtrip() {
    let cfg = HttpdCfg::new();
    let body = Rc::new(RefCell::new(Vec::new()));
    let body2 = body.clone();
    cfg.trigger_register(
        Method::Post,
        "/echo",
        trigger(move |el, q, _info| {
            q.bufferize(el, 1 << 20);
            let body3 = body2.clone();
            q.set_on_done(Box::new(move |el, q| {
                *body3.borrow_mut() = q.take_payload();
                q.reply_202accepted(el);
            }));
        }),
    );
    let (mut el, client) = setup(&cfg);

    // Several chunks, sizes in hex, one with extensions, binary bytes
    // included.
    let payload: Vec<u8> = (0u16..300).map(|i| (i % 251) as u8).collect();
    let mut wire = Vec::new();
    wire.extend_from_slice(b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
    for chunk in payload.chunks(99) {
        wire.extend_from_slice(format!("{:x};ext=1\r\n", chunk.len()).as_bytes());
        wire.extend_from_slice(chunk);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0\r\nX-Trailer: ignored\r\n\r\n");

    send(client, &wire);
    pump(&mut el, 5);
    assert_eq!(*body.borrow(), payload);
}

#[test]
fn pipelined_responses_keep_request_order() {
    let cfg = HttpdCfg::new();
    let parked: Rc<RefCell<Option<Rc<Query>>>> = Rc::new(RefCell::new(None));
    let parked2 = parked.clone();
    cfg.trigger_register(
        Method::Get,
        "/slow",
        trigger(move |_el, q, _info| {
            // Answered later, out of band.
            *parked2.borrow_mut() = Some(q.clone());
        }),
    );
    cfg.trigger_register(
        Method::Get,
        "/fast",
        trigger(|el, q, _info| {
            q.reply_hdrs_start(200, false);
            q.reply_hdrs_done(4, false);
            q.with_ob(|ob| ob.adds("fast"));
            q.reply_done(el);
        }),
    );
    let (mut el, client) = setup(&cfg);

    send(
        client,
        b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\nGET /fast HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    pump(&mut el, 5);

    // The second answer is ready but must not pass the first.
    assert!(recv_all(client).is_empty());

    let q = parked.borrow_mut().take().expect("slow trigger did not run");
    q.reply_hdrs_start(200, false);
    q.reply_hdrs_done(4, false);
    q.with_ob(|ob| ob.adds("slow"));
    q.reply_done(&mut el);
    pump(&mut el, 5);

    let resp = text(&recv_all(client));
    let slow_at = resp.find("slow").expect("first response missing");
    let fast_at = resp.find("fast").expect("second response missing");
    assert!(slow_at < fast_at, "{resp}");
}

#[test]
fn pipeline_depth_masks_reads_until_head_answers() {
    let cfg = Rc::new(HttpdCfg {
        pipeline_depth: 1,
        ..HttpdCfg::default()
    });
    let parked: Rc<RefCell<Option<Rc<Query>>>> = Rc::new(RefCell::new(None));
    let parked2 = parked.clone();
    let served = Rc::new(RefCell::new(0));
    let served2 = served.clone();
    cfg.trigger_register(
        Method::Get,
        "/",
        trigger(move |el, q, _info| {
            *served2.borrow_mut() += 1;
            if *served2.borrow() == 1 {
                *parked2.borrow_mut() = Some(q.clone());
            } else {
                q.reply_202accepted(el);
            }
        }),
    );
    let (mut el, client) = setup(&cfg);

    send(client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    assert_eq!(*served.borrow(), 1);

    // The head query is unanswered and the pipeline is full: POLLIN is
    // masked, so the second request stays in the kernel buffer.
    send(client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    assert_eq!(*served.borrow(), 1);

    // Answering the head re-enables reads and the queued request is
    // served.
    let q = parked.borrow_mut().take().expect("trigger did not run");
    q.reply_202accepted(&mut el);
    pump(&mut el, 5);
    assert_eq!(*served.borrow(), 2);

    let resp = text(&recv_all(client));
    assert_eq!(resp.matches("HTTP/1.1 202 Accepted").count(), 2, "{resp}");
}

#[test]
fn connection_lifetime_limit_latches_close() {
    let cfg = Rc::new(HttpdCfg {
        max_queries: 2,
        ..HttpdCfg::default()
    });
    cfg.trigger_register(
        Method::Get,
        "/",
        trigger(|el, q, _info| {
            q.reply_hdrs_start(200, false);
            q.reply_hdrs_done(2, false);
            q.with_ob(|ob| ob.adds("ok"));
            q.reply_done(el);
        }),
    );
    let (mut el, client) = setup(&cfg);

    // Three pipelined requests against a two-request budget.
    send(
        client,
        b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\
          GET / HTTP/1.1\r\nHost: x\r\n\r\n\
          GET / HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert_eq!(resp.matches("HTTP/1.1 200 OK").count(), 2, "{resp}");
    // The second (final) response announces the close.
    assert!(resp.contains("Connection: close"), "{resp}");
    pump(&mut el, 3);
    assert!(at_eof(client));
}

#[test]
fn missing_trigger_distinguishes_404_from_501() {
    // No triggers at all: the method tree is empty.
    let cfg = HttpdCfg::new();
    let (mut el, client) = setup(&cfg);
    send(client, b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{resp}");

    // A populated tree turns the same miss into a 404.
    let cfg = HttpdCfg::new();
    cfg.trigger_register(Method::Get, "/known", trigger(|el, q, _| q.reply_202accepted(el)));
    let (mut el, client) = setup(&cfg);
    send(client, b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"), "{resp}");

    // Semantic errors do not close the connection.
    send(client, b"GET /known HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 202 Accepted\r\n"), "{resp}");
}

#[test]
fn bad_request_line_is_rejected_and_closed() {
    let cfg = HttpdCfg::new();
    let (mut el, client) = setup(&cfg);
    send(client, b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{resp}");
    pump(&mut el, 3);
    assert!(at_eof(client));
}

#[test]
fn oversized_headers_are_rejected_with_403() {
    let cfg = Rc::new(HttpdCfg {
        header_size_max: 256,
        ..HttpdCfg::default()
    });
    let (mut el, client) = setup(&cfg);
    send(client, b"GET / HTTP/1.1\r\nHost: x\r\n");
    let filler = vec![b'a'; 512];
    send(client, b"X-Pad: ");
    send(client, &filler);
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{resp}");
    pump(&mut el, 3);
    assert!(at_eof(client));
}

#[test]
fn post_without_length_gets_411() {
    let cfg = HttpdCfg::new();
    cfg.trigger_register(Method::Post, "/p", trigger(|el, q, _| q.reply_202accepted(el)));
    let (mut el, client) = setup(&cfg);
    send(client, b"POST /p HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 411 Length Required\r\n"), "{resp}");
}

#[test]
fn bufferize_rejects_oversized_content_length_immediately() {
    let cfg = HttpdCfg::new();
    cfg.trigger_register(
        Method::Post,
        "/p",
        trigger(|el, q, _| {
            q.bufferize(el, 16);
            q.set_on_done(Box::new(|el, q| q.reply_202accepted(el)));
        }),
    );
    let (mut el, client) = setup(&cfg);
    send(client, b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 64\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(
        resp.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"),
        "{resp}"
    );
}

#[test]
fn trace_echoes_the_head_chunked() {
    let cfg = HttpdCfg::new();
    let (mut el, client) = setup(&cfg);
    let head = b"TRACE /x HTTP/1.1\r\nHost: x\r\n\r\n";
    send(client, head);
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.contains("Content-Type: message/http\r\n"), "{resp}");
    assert!(resp.contains("Transfer-Encoding: chunked\r\n"), "{resp}");
    assert!(resp.contains("TRACE /x HTTP/1.1"), "{resp}");
    // Chunked terminator present.
    assert!(resp.ends_with("\r\n0\r\n\r\n"), "{resp}");
}

#[test]
fn trace_on_http10_is_refused() {
    let cfg = HttpdCfg::new();
    let (mut el, client) = setup(&cfg);
    send(client, b"TRACE /x HTTP/1.0\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.0 501 Not Implemented\r\n"), "{resp}");
}

#[test]
fn http10_responses_close_the_connection() {
    let cfg = HttpdCfg::new();
    cfg.trigger_register(
        Method::Get,
        "/",
        trigger(|el, q, _| {
            q.reply_hdrs_start(200, false);
            q.reply_hdrs_done(2, false);
            q.with_ob(|ob| ob.adds("ok"));
            q.reply_done(el);
        }),
    );
    let (mut el, client) = setup(&cfg);
    send(client, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.0 200 OK\r\n"), "{resp}");
    assert!(resp.contains("Connection: close\r\n"), "{resp}");
    pump(&mut el, 3);
    assert!(at_eof(client));
}

struct AuthTrigger;

impl Trigger for AuthTrigger {
    fn on_query(&self, el: &mut El, q: &Rc<Query>, _info: &Rc<QInfo>) {
        q.reply_hdrs_start(200, false);
        q.reply_hdrs_done(6, false);
        q.with_ob(|ob| ob.adds("secret"));
        q.reply_done(el);
    }

    fn auth_realm(&self) -> Option<&str> {
        Some("test realm")
    }

    fn on_auth(&self, el: &mut El, q: &Rc<Query>, user: &str, password: &str) {
        if user != "u" || password != "p" {
            q.reject_unauthorized(el, self.auth_realm().unwrap_or_default());
        }
    }
}

#[test]
fn basic_auth_challenges_and_admits() {
    let cfg = HttpdCfg::new();
    cfg.trigger_register(Method::Get, "/s", Rc::new(AuthTrigger));
    let (mut el, client) = setup(&cfg);

    send(client, b"GET /s HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{resp}");
    assert!(
        resp.contains("WWW-Authenticate: Basic realm=\"test realm\"\r\n"),
        "{resp}"
    );

    // "u:p" in base64.
    send(
        client,
        b"GET /s HTTP/1.1\r\nHost: x\r\nAuthorization: Basic dTpw\r\n\r\n",
    );
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.ends_with("secret"), "{resp}");
}

#[test]
fn head_on_static_file_describes_the_body() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), vec![b'x'; 100]).unwrap();

    let cfg = HttpdCfg::new();
    let st = Rc::new(StaticDirTrigger::new(dir.path()));
    cfg.trigger_register(Method::Get, "/files", st.clone());
    cfg.trigger_register(Method::Head, "/files", st);
    let (mut el, client) = setup(&cfg);

    send(client, b"HEAD /files/a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.contains("Content-Length: 100\r\n"), "{resp}");
    assert!(resp.contains("Content-Type: text/plain\r\n"), "{resp}");
    assert!(resp.contains("Last-Modified: "), "{resp}");
    assert!(resp.contains("ETag: "), "{resp}");
    // Headers only.
    assert!(resp.ends_with("\r\n\r\n"), "{resp}");

    send(client, b"GET /files/a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = recv_all(client);
    assert!(resp.ends_with(&vec![b'x'; 100]), "body missing");
}

#[test]
fn static_index_lists_entries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("seen.txt"), b"x").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

    let cfg = HttpdCfg::new();
    cfg.trigger_register(
        Method::Get,
        "/files",
        Rc::new(StaticDirTrigger::new(dir.path())),
    );
    let (mut el, client) = setup(&cfg);

    send(client, b"GET /files/ HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let resp = text(&recv_all(client));
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.contains("<a href=\"seen.txt\">seen.txt</a>"), "{resp}");
    assert!(resp.contains("<a href=\"sub/\">sub/</a>"), "{resp}");
    assert!(!resp.contains(".hidden"), "{resp}");
}

#[test]
fn queries_survive_a_dead_connection() {
    let cfg = HttpdCfg::new();
    let parked: Rc<RefCell<Option<Rc<Query>>>> = Rc::new(RefCell::new(None));
    let parked2 = parked.clone();
    cfg.trigger_register(
        Method::Get,
        "/park",
        trigger(move |_el, q, _info| {
            *parked2.borrow_mut() = Some(q.clone());
        }),
    );
    let (mut el, client) = setup(&cfg);

    send(client, b"GET /park HTTP/1.1\r\nHost: x\r\n\r\n");
    pump(&mut el, 5);
    let q = parked.borrow_mut().take().expect("trigger did not run");
    assert!(q.is_attached());

    // Peer goes away; the server reaps the connection.
    unsafe { libc::close(client) };
    pump(&mut el, 5);
    assert!(!q.is_attached());

    // Late replies are legal and silently discarded.
    q.reply_hdrs_start(200, false);
    q.reply_hdrs_done(2, false);
    q.with_ob(|ob| ob.adds("ok"));
    q.reply_done(&mut el);
    assert!(q.answered());
}

#[test]
fn listener_accepts_and_serves() {
    let cfg = HttpdCfg::new();
    cfg.trigger_register(Method::Get, "/", trigger(|el, q, _| q.reply_202accepted(el)));
    let mut el = El::new();
    let listener = listen(&mut el, "127.0.0.1:0".parse().unwrap(), &cfg).unwrap();
    let fd = el.fd_get_fd(listener).unwrap();

    // Recover the bound port.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockname(fd, std::ptr::addr_of_mut!(addr).cast(), &mut len)
    };
    assert_eq!(res, 0);
    let port = u16::from_be(addr.sin_port);

    let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_nonblocking(true).unwrap();
    use std::io::{Read, Write};
    let mut client = client;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    pump(&mut el, 10);
    assert_eq!(cfg.nb_conns(), 1);

    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    while let Ok(n) = client.read(&mut tmp) {
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let resp = text(&buf);
    assert!(resp.starts_with("HTTP/1.1 202 Accepted\r\n"), "{resp}");

    unlisten(&mut el, listener);
}
