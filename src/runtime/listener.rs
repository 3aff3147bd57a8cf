//! Listening endpoint and accept state machine.
//!
//! The listener keeps one accept operation outstanding whenever the
//! service is running, so incoming connections are never missed at the
//! OS level. A completed accept is promoted into a registered
//! `Connection`; a failed accept is logged and re-armed. Either way the
//! accept is re-posted before the completed one is processed further, so
//! the backlog invariant never lapses even transiently.

use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::context::{ContextPool, OpKind};
use crate::runtime::multiplexer::{Completion, Multiplexer};
use crate::runtime::transport;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

pub struct Listener {
    /// Owns the listening endpoint; closed on drop.
    inner: TcpListener,
    local: SocketAddr,
    /// Token of the outstanding accept context, if one is posted.
    pending_accept: Option<u64>,
}

impl Listener {
    /// Bind the listening endpoint and register it with the multiplexer.
    pub fn bind(addr: SocketAddr, backlog: i32, mux: &mut Multiplexer) -> io::Result<Self> {
        let inner = transport::bind_and_listen(addr, backlog)?;
        let local = inner.local_addr()?;

        mux.register(inner.as_raw_fd())
            .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

        Ok(Self {
            inner,
            local,
            pending_accept: None,
        })
    }

    /// Actual bound address (resolves an ephemeral port request).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Listening endpoint fd.
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Whether an accept is currently outstanding.
    pub fn has_pending_accept(&self) -> bool {
        self.pending_accept.is_some()
    }

    /// Token of the outstanding accept, for cancellation at shutdown.
    pub fn pending_token(&self) -> Option<u64> {
        self.pending_accept
    }

    /// Post an accept operation. The only way new connections enter the
    /// system.
    ///
    /// Returns `false` if the accept had to be abandoned (context pool
    /// exhausted); the dispatch loop re-attempts on its next timeout
    /// tick, restoring the backlog invariant.
    pub fn post_accept(&mut self, mux: &mut Multiplexer, pool: &mut ContextPool) -> bool {
        if self.pending_accept.is_some() {
            return true;
        }

        let token = match pool.acquire(OpKind::Accept) {
            Some(token) => token,
            None => {
                warn!("Context pool exhausted, accept abandoned");
                return false;
            }
        };

        if let Err(e) = mux.submit_accept(self.fd(), token) {
            warn!(error = %e, "Failed to submit accept");
            pool.release(token);
            return false;
        }

        self.pending_accept = Some(token);
        true
    }

    /// Process an accept completion.
    ///
    /// Re-arms the accept, then promotes a successful completion into a
    /// registered `Connection`. Returns the new connection's id; the
    /// caller starts its echo exchange by posting the first receive.
    /// A single failed accept never stops the service.
    pub fn handle_accept(
        &mut self,
        completion: Completion,
        mux: &mut Multiplexer,
        pool: &mut ContextPool,
        connections: &mut ConnectionRegistry,
        draining: bool,
    ) -> Option<usize> {
        pool.release(completion.token);
        self.pending_accept = None;

        if !draining {
            self.post_accept(mux, pool);
        }

        let client_fd = match completion.bytes() {
            Ok(fd) => fd as RawFd,
            Err(e) => {
                if !draining {
                    warn!(error = %e, "Accept failed");
                }
                return None;
            }
        };

        if draining {
            // Connection raced with shutdown; refuse it.
            transport::close(client_fd);
            return None;
        }

        let peer = match transport::finalize_accepted(client_fd) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Failed to finalize accepted endpoint");
                transport::close(client_fd);
                return None;
            }
        };

        if let Err(e) = mux.register(client_fd) {
            warn!(error = %e, "Failed to register accepted endpoint");
            transport::close(client_fd);
            return None;
        }

        let conn_id = match connections.insert(Connection::new(client_fd, Some(peer))) {
            Some(id) => id,
            None => {
                warn!("Connection limit reached, closing");
                mux.deregister(client_fd);
                transport::close(client_fd);
                return None;
            }
        };

        debug!(conn_id, fd = client_fd, peer = %peer, "Accepted connection");
        Some(conn_id)
    }
}
