//! Non-blocking socket plumbing shared by the server and client engines.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{IntoRawFd, RawFd};

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Bind and listen on `addr`, returning a non-blocking fd.
pub(crate) fn tcp_listen(addr: SocketAddr) -> io::Result<RawFd> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener.into_raw_fd())
}

/// Accept one connection; `None` when the backlog is drained.
pub(crate) fn tcp_accept(fd: RawFd) -> io::Result<Option<RawFd>> {
    let sock = unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if sock < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }
    Ok(Some(sock))
}

/// Start a non-blocking connect; completion is signaled by
/// write-readiness and read back with [`connect_status`].
pub(crate) fn tcp_connect_start(addr: SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let (storage, len) = sockaddr_from(&addr);
    let res = unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    };
    if res != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }
    Ok(fd)
}

/// The outcome of an in-progress connect, once the fd polls writable.
pub(crate) fn connect_status(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Read once into `buf`'s spare capacity. `Ok(0)` is end-of-stream;
/// `WouldBlock` is surfaced as an error for the caller to swallow.
pub(crate) fn read_into(fd: RawFd, buf: &mut Vec<u8>) -> io::Result<usize> {
    const READ_CHUNK: usize = 64 << 10;
    let offset = buf.len();
    buf.resize(offset + READ_CHUNK, 0);
    let res = unsafe { libc::read(fd, buf.as_mut_ptr().add(offset).cast(), READ_CHUNK) };
    if res < 0 {
        buf.truncate(offset);
        return Err(io::Error::last_os_error());
    }
    buf.truncate(offset + res as usize);
    Ok(res as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_and_connect_roundtrip() {
        let lfd = tcp_listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut addr_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockname(
                lfd,
                &mut addr_storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        assert_eq!(res, 0);
        let sin = unsafe { *(&addr_storage as *const _ as *const libc::sockaddr_in) };
        let port = u16::from_be(sin.sin_port);

        let cfd = tcp_connect_start(format!("127.0.0.1:{port}").parse().unwrap()).unwrap();

        // Wait for the accept side.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(fd) = tcp_accept(lfd).unwrap() {
                accepted = Some(fd);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let afd = accepted.expect("no connection accepted");
        connect_status(cfd).unwrap();

        assert_eq!(unsafe { libc::write(cfd, b"ok".as_ptr().cast(), 2) }, 2);
        let mut buf = Vec::new();
        for _ in 0..100 {
            match read_into(afd, &mut buf) {
                Ok(0) => break,
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(buf, b"ok");

        unsafe {
            libc::close(cfd);
            libc::close(afd);
            libc::close(lfd);
        }
    }
}
