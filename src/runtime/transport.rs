//! Transport layer: endpoint setup and teardown.
//!
//! These are the synchronous collaborator calls the completion-driven
//! core consumes: binding the listening endpoint, finalizing accepted
//! endpoints, the client-side blocking connect, and fd teardown. The
//! asynchronous accept/receive/send submissions live in the multiplexer.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

/// Create a bound, listening TCP endpoint.
pub fn bind_and_listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Client-side blocking connect.
pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Finalize a freshly accepted endpoint so it behaves as a normal
/// connected endpoint: apply the service's socket options and extract
/// the peer address.
pub fn finalize_accepted(fd: RawFd) -> io::Result<SocketAddr> {
    // The fd came straight from an accept completion; borrow it without
    // taking ownership so an error here does not double-close.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&borrowed);

    sock.set_nodelay(true)?;

    sock.peer_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
}

/// Close an endpoint. Safe to call once per fd.
pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// Shut down both directions of an endpoint without closing the fd.
///
/// Outstanding operations on the endpoint then complete with zero bytes
/// or an error rather than vanishing, so the dispatch loop can still
/// observe and release their contexts.
pub fn shutdown(fd: RawFd) {
    unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_bind_and_listen_ephemeral_port() {
        let listener = bind_and_listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_connect_and_finalize() {
        let listener = bind_and_listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = connect(addr).unwrap();
        let client_local = client.local_addr().unwrap();

        // Nonblocking listener: the connection is queued by the time
        // connect returns on loopback.
        let (accepted, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let peer = finalize_accepted(accepted.as_raw_fd()).unwrap();
        assert_eq!(peer, client_local);
    }
}
